//! Frames sent by the Navigator.

use serde::{Deserialize, Serialize};

/// State of a pairing attempt as reported to the Mate and the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PairingStatus {
    Pending,
    Approved,
    Rejected,
    AlreadyPaired,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingResponse {
    pub request_id: Option<String>,
    pub device_id: Option<String>,
    pub pairing_code: Option<String>,
    pub navigator_public_key: String,
    pub navigator_exchange_key: String,
    pub status: PairingStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingApproved {
    pub device_id: String,
    pub device_name: String,
    pub navigator_exchange_key: String,
    pub status: PairingStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRejected {
    pub status: PairingStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthChallenge {
    pub device_id: String,
    pub nonce: String,
    pub navigator_public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSuccess {
    pub device_id: String,
    pub device_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthFailed {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedPayload {
    pub device_id: String,
    /// base64(iv || ciphertext || tag)
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Every frame the Navigator emits, serialized as `{"type", "payload"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Outbound {
    PairingResponse(PairingResponse),
    PairingApproved(PairingApproved),
    PairingRejected(PairingRejected),
    AuthChallenge(AuthChallenge),
    AuthSuccess(AuthSuccess),
    AuthFailed(AuthFailed),
    Encrypted(EncryptedPayload),
    Error(ErrorPayload),
}

impl Outbound {
    pub fn error(message: impl Into<String>) -> Self {
        Outbound::Error(ErrorPayload {
            message: message.into(),
        })
    }

    pub fn rejected() -> Self {
        Outbound::PairingRejected(PairingRejected {
            status: PairingStatus::Rejected,
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
