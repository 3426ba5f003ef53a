//! Inbound frame normalization.
//!
//! Mates in the field disagree on naming: Java peers send `name`/`type`,
//! Go peers send `mateName`/`mateType`; some put the body under `data`,
//! others under `payload` or directly on the frame. All of that is
//! resolved here, and nowhere else.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};

/// Errors raised while decoding an inbound frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid {kind} frame: {reason}")]
    Invalid { kind: &'static str, reason: String },

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("encrypted envelope nested inside another envelope")]
    NestedEnvelope,
}

/// Outer shape shared by every frame.
#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, alias = "mateId", alias = "mate_id", alias = "deviceId")]
    device_id: Option<String>,
    #[serde(default, alias = "payload")]
    data: Option<Value>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairingRequestBody {
    #[serde(alias = "mateName", alias = "deviceName")]
    name: String,
    #[serde(rename = "type", alias = "mateType", alias = "deviceType")]
    device_type: String,
    #[serde(alias = "matePublicKey", alias = "devicePublicKey")]
    public_key: String,
    #[serde(alias = "mateExchangeKey", alias = "deviceExchangeKey")]
    exchange_key: String,
    #[serde(default, alias = "IPv4")]
    ipv4: Option<String>,
    #[serde(default, alias = "IPv6")]
    ipv6: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceRefBody {
    #[serde(default, alias = "mateId", alias = "mate_id")]
    device_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthBody {
    #[serde(default, alias = "mateId", alias = "mate_id")]
    device_id: Option<String>,
    #[serde(alias = "matePublicKey")]
    public_key: String,
    signature: String,
    nonce: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NestedEnvelope {
    #[serde(default, alias = "mateId", alias = "mate_id")]
    device_id: Option<String>,
    payload: String,
    #[serde(default)]
    sequence: Option<u64>,
}

/// A Mate asking to be paired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingRequest {
    pub name: String,
    pub device_type: String,
    /// Base64 Ed25519 key, raw or SPKI
    pub public_key: String,
    /// Base64 X25519 key, raw or SPKI
    pub exchange_key: String,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
}

impl From<PairingRequestBody> for PairingRequest {
    fn from(body: PairingRequestBody) -> Self {
        let non_blank = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        Self {
            name: body.name,
            device_type: body.device_type,
            public_key: body.public_key,
            exchange_key: body.exchange_key,
            ipv4: non_blank(body.ipv4),
            ipv6: non_blank(body.ipv6),
        }
    }
}

/// Response to an `auth_challenge`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub device_id: String,
    pub public_key: String,
    pub signature: String,
    pub nonce: String,
}

/// The encrypted envelope, before decryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedFrame {
    /// Device the sender claims to be, if it said so
    pub device_id: Option<String>,
    /// base64(iv || ciphertext || tag)
    pub payload: String,
    /// Reserved for replay protection; carried but not checked
    pub sequence: Option<u64>,
}

/// Anything the pairing layer does not interpret.
#[derive(Debug, Clone, PartialEq)]
pub struct BusinessMessage {
    pub kind: String,
    pub device_id: Option<String>,
    pub data: Value,
}

/// Canonical inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    PairingRequest(PairingRequest),
    AuthChallengeRequest { device_id: String },
    Auth(AuthRequest),
    Encrypted(EncryptedFrame),
    /// Legacy registration without authentication. Always refused.
    Register,
    Heartbeat { device_id: Option<String> },
    Business(BusinessMessage),
}

impl Inbound {
    /// Decode a text frame received from the socket.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let raw: RawFrame = serde_json::from_str(text)?;
        Self::from_raw(raw)
    }

    /// Decode the plaintext of an envelope. Envelopes do not nest.
    pub fn parse_inner(plaintext: &[u8]) -> Result<Self, FrameError> {
        let raw: RawFrame = serde_json::from_slice(plaintext)?;
        match Self::from_raw(raw)? {
            Inbound::Encrypted(_) => Err(FrameError::NestedEnvelope),
            inner => Ok(inner),
        }
    }

    /// The `type` discriminant, for logging.
    pub fn kind(&self) -> &str {
        match self {
            Inbound::PairingRequest(_) => "pairing_request",
            Inbound::AuthChallengeRequest { .. } => "auth_challenge_request",
            Inbound::Auth(_) => "auth",
            Inbound::Encrypted(_) => crate::ENCRYPTED,
            Inbound::Register => "register",
            Inbound::Heartbeat { .. } => "heartbeat",
            Inbound::Business(msg) => &msg.kind,
        }
    }

    fn from_raw(raw: RawFrame) -> Result<Self, FrameError> {
        let RawFrame {
            kind,
            device_id,
            data,
            rest,
        } = raw;

        match kind.as_str() {
            "pairing_request" => {
                let body: PairingRequestBody = decode_body("pairing_request", data, rest)?;
                Ok(Inbound::PairingRequest(body.into()))
            }
            "auth_challenge_request" => {
                let body: DeviceRefBody = decode_body("auth_challenge_request", data, rest)?;
                let device_id = body
                    .device_id
                    .or(device_id)
                    .filter(|id| !id.is_empty())
                    .ok_or(FrameError::MissingField("deviceId"))?;
                Ok(Inbound::AuthChallengeRequest { device_id })
            }
            "auth" => {
                let body: AuthBody = decode_body("auth", data, rest)?;
                let device_id = body
                    .device_id
                    .or(device_id)
                    .filter(|id| !id.is_empty())
                    .ok_or(FrameError::MissingField("deviceId"))?;
                Ok(Inbound::Auth(AuthRequest {
                    device_id,
                    public_key: body.public_key,
                    signature: body.signature,
                    nonce: body.nonce,
                }))
            }
            crate::ENCRYPTED => decode_envelope(device_id, data, &rest).map(Inbound::Encrypted),
            "register" => Ok(Inbound::Register),
            "heartbeat" => Ok(Inbound::Heartbeat { device_id }),
            _ => Ok(Inbound::Business(BusinessMessage {
                kind,
                device_id,
                data: data.unwrap_or(Value::Object(rest)),
            })),
        }
    }
}

/// Read a frame body from `data`/`payload`, or from the frame itself when
/// the sender put the fields at the top level.
fn decode_body<T: DeserializeOwned>(
    kind: &'static str,
    data: Option<Value>,
    rest: Map<String, Value>,
) -> Result<T, FrameError> {
    let body = match data {
        Some(Value::Object(map)) => map,
        _ => rest,
    };
    serde_json::from_value(Value::Object(body)).map_err(|e| FrameError::Invalid {
        kind,
        reason: e.to_string(),
    })
}

fn decode_envelope(
    device_id: Option<String>,
    data: Option<Value>,
    rest: &Map<String, Value>,
) -> Result<EncryptedFrame, FrameError> {
    let sequence = rest.get("sequence").and_then(Value::as_u64);
    match data {
        // {"type":"encrypted","mateId":"..","payload":"<b64>"}
        Some(Value::String(payload)) => Ok(EncryptedFrame {
            device_id,
            payload,
            sequence,
        }),
        // {"type":"encrypted","data":{"mateId":"..","payload":"<b64>"}}
        Some(Value::Object(map)) => {
            let nested: NestedEnvelope =
                serde_json::from_value(Value::Object(map)).map_err(|e| FrameError::Invalid {
                    kind: crate::ENCRYPTED,
                    reason: e.to_string(),
                })?;
            Ok(EncryptedFrame {
                device_id: device_id.or(nested.device_id),
                payload: nested.payload,
                sequence: sequence.or(nested.sequence),
            })
        }
        _ => Err(FrameError::MissingField("payload")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pairing(frame: Value) -> PairingRequest {
        match Inbound::parse(&frame.to_string()).unwrap() {
            Inbound::PairingRequest(req) => req,
            other => panic!("expected pairing request, got {other:?}"),
        }
    }

    #[test]
    fn pairing_request_java_spelling() {
        let req = pairing(json!({
            "type": "pairing_request",
            "data": {
                "name": "Laptop",
                "type": "os",
                "publicKey": "cGs=",
                "exchangeKey": "ZXg=",
                "ipv4": "10.0.0.5"
            }
        }));
        assert_eq!(req.name, "Laptop");
        assert_eq!(req.device_type, "os");
        assert_eq!(req.public_key, "cGs=");
        assert_eq!(req.exchange_key, "ZXg=");
        assert_eq!(req.ipv4.as_deref(), Some("10.0.0.5"));
        assert_eq!(req.ipv6, None);
    }

    #[test]
    fn pairing_request_go_spelling() {
        let req = pairing(json!({
            "type": "pairing_request",
            "payload": {
                "mateName": "Mailbox",
                "mateType": "mail",
                "matePublicKey": "cGs=",
                "mateExchangeKey": "ZXg=",
                "IPv6": "fe80::1",
                "IPv4": ""
            }
        }));
        assert_eq!(req.name, "Mailbox");
        assert_eq!(req.device_type, "mail");
        assert_eq!(req.ipv4, None);
        assert_eq!(req.ipv6.as_deref(), Some("fe80::1"));
    }

    #[test]
    fn pairing_request_flat_body() {
        let req = pairing(json!({
            "type": "pairing_request",
            "deviceName": "Writer",
            "deviceType": "office",
            "devicePublicKey": "cGs=",
            "deviceExchangeKey": "ZXg="
        }));
        assert_eq!(req.name, "Writer");
        assert_eq!(req.device_type, "office");
    }

    #[test]
    fn pairing_request_missing_key_is_invalid() {
        let err = Inbound::parse(
            &json!({"type": "pairing_request", "data": {"name": "x", "type": "os"}}).to_string(),
        )
        .unwrap_err();
        assert!(matches!(err, FrameError::Invalid { kind: "pairing_request", .. }));
    }

    #[test]
    fn challenge_request_device_id_locations() {
        for frame in [
            json!({"type": "auth_challenge_request", "data": {"deviceId": "os-a"}}),
            json!({"type": "auth_challenge_request", "payload": {"mateId": "os-a"}}),
            json!({"type": "auth_challenge_request", "mateId": "os-a"}),
            json!({"type": "auth_challenge_request", "mate_id": "os-a"}),
        ] {
            assert_eq!(
                Inbound::parse(&frame.to_string()).unwrap(),
                Inbound::AuthChallengeRequest { device_id: "os-a".into() }
            );
        }
    }

    #[test]
    fn challenge_request_without_device_id() {
        let err = Inbound::parse(r#"{"type":"auth_challenge_request"}"#).unwrap_err();
        assert!(matches!(err, FrameError::MissingField("deviceId")));
    }

    #[test]
    fn auth_frame() {
        let frame = json!({
            "type": "auth",
            "data": {"mateId": "os-a", "publicKey": "cGs=", "signature": "c2ln", "nonce": "bm9u"}
        });
        assert_eq!(
            Inbound::parse(&frame.to_string()).unwrap(),
            Inbound::Auth(AuthRequest {
                device_id: "os-a".into(),
                public_key: "cGs=".into(),
                signature: "c2ln".into(),
                nonce: "bm9u".into(),
            })
        );
    }

    #[test]
    fn encrypted_flat_form() {
        let frame = json!({"type": "encrypted", "mateId": "os-a", "payload": "Y2lwaGVy", "sequence": 4});
        assert_eq!(
            Inbound::parse(&frame.to_string()).unwrap(),
            Inbound::Encrypted(EncryptedFrame {
                device_id: Some("os-a".into()),
                payload: "Y2lwaGVy".into(),
                sequence: Some(4),
            })
        );
    }

    #[test]
    fn encrypted_nested_form() {
        let frame = json!({"type": "encrypted", "data": {"mateId": "os-a", "payload": "Y2lwaGVy"}});
        assert_eq!(
            Inbound::parse(&frame.to_string()).unwrap(),
            Inbound::Encrypted(EncryptedFrame {
                device_id: Some("os-a".into()),
                payload: "Y2lwaGVy".into(),
                sequence: None,
            })
        );
    }

    #[test]
    fn encrypted_without_payload() {
        let err = Inbound::parse(r#"{"type":"encrypted","mateId":"os-a"}"#).unwrap_err();
        assert!(matches!(err, FrameError::MissingField("payload")));
    }

    #[test]
    fn inner_envelope_is_refused() {
        let inner = br#"{"type":"encrypted","payload":"Y2lwaGVy"}"#;
        assert!(matches!(
            Inbound::parse_inner(inner),
            Err(FrameError::NestedEnvelope)
        ));
    }

    #[test]
    fn register_and_heartbeat() {
        assert_eq!(
            Inbound::parse(r#"{"type":"register","data":{"name":"old"}}"#).unwrap(),
            Inbound::Register
        );
        assert_eq!(
            Inbound::parse(r#"{"type":"heartbeat","mateId":"os-a"}"#).unwrap(),
            Inbound::Heartbeat { device_id: Some("os-a".into()) }
        );
    }

    #[test]
    fn unknown_types_are_business_messages() {
        let frame = json!({"type": "stats", "mateId": "os-a", "data": {"cpu": 12.5}});
        match Inbound::parse(&frame.to_string()).unwrap() {
            Inbound::Business(msg) => {
                assert_eq!(msg.kind, "stats");
                assert_eq!(msg.device_id.as_deref(), Some("os-a"));
                assert_eq!(msg.data, json!({"cpu": 12.5}));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(Inbound::parse("not json"), Err(FrameError::Malformed(_))));
        assert!(matches!(Inbound::parse(r#"{"data":{}}"#), Err(FrameError::Malformed(_))));
    }
}
