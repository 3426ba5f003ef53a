//! Fleet Navigator server: the WebSocket secure channel gateway for Mates
//! and the operator API that drives pairing.

#![forbid(unsafe_code)]

pub mod admin;
pub mod config;
pub mod gateway;
pub mod server;

pub use config::NavigatorConfig;
pub use gateway::{BusinessHandler, Gateway, GatewayError};
pub use server::NavigatorServer;
