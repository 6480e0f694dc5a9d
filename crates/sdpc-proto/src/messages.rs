//! SDP control protocol message types.

use serde::{Deserialize, Serialize};

/// Wire action tokens for the SDP control protocol.
///
/// An action string this build does not recognize still decodes (as
/// `Unknown`) so the dispatcher can log it; only a *missing* action key
/// is a decode failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Action {
    ServiceRequest,
    ServiceGranted,
    ServiceDenied,
    AuthnRequest,
    AuthnAccepted,
    AuthnRejected,
    TunnelTraffic,
    BadMessage,
    Unknown(String),
}

impl Action {
    /// The wire token for this action.
    pub fn as_str(&self) -> &str {
        match self {
            Action::ServiceRequest => "service_request",
            Action::ServiceGranted => "service_granted",
            Action::ServiceDenied => "service_denied",
            Action::AuthnRequest => "authn_request",
            Action::AuthnAccepted => "authn_accepted",
            Action::AuthnRejected => "authn_rejected",
            Action::TunnelTraffic => "tunnel_traffic",
            Action::BadMessage => "bad_message",
            Action::Unknown(token) => token,
        }
    }
}

impl From<String> for Action {
    fn from(token: String) -> Self {
        match token.as_str() {
            "service_request" => Action::ServiceRequest,
            "service_granted" => Action::ServiceGranted,
            "service_denied" => Action::ServiceDenied,
            "authn_request" => Action::AuthnRequest,
            "authn_accepted" => Action::AuthnAccepted,
            "authn_rejected" => Action::AuthnRejected,
            "tunnel_traffic" => Action::TunnelTraffic,
            "bad_message" => Action::BadMessage,
            _ => Action::Unknown(token),
        }
    }
}

impl From<Action> for String {
    fn from(action: Action) -> String {
        match action {
            Action::Unknown(token) => token,
            other => other.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The decoded form of one wire message.
///
/// Absent optional fields are omitted from the encoded JSON object,
/// never emitted as `null`. Numeric ids are unsigned 32-bit on the
/// wire; out-of-range values fail decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idp_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet: Option<String>,
}

impl ProtocolMessage {
    /// A message carrying only an action.
    pub fn new(action: Action) -> Self {
        Self {
            action,
            sdp_id: None,
            idp_id: None,
            service_id: None,
            id_token: None,
            tunnel_ip: None,
            packet: None,
        }
    }
}
