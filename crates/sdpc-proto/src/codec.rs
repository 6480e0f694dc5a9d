//! JSON codec for the SDP control protocol.
//!
//! Wire format: one JSON object per message, required `action` key
//! (string token) plus action-dependent optional keys.

use crate::error::{SdpError, SdpResult};
use crate::messages::{Action, ProtocolMessage};

/// Encode a control message from its individual fields.
///
/// Field order follows the control-channel convention: action, sdp id,
/// service id, idp id, then the optional token and packet payloads.
pub fn encode(
    action: Action,
    sdp_id: u32,
    service_id: u32,
    idp_id: u32,
    id_token: Option<&str>,
    packet: Option<&str>,
) -> SdpResult<String> {
    let msg = ProtocolMessage {
        action,
        sdp_id: Some(sdp_id),
        idp_id: Some(idp_id),
        service_id: Some(service_id),
        id_token: id_token.map(str::to_owned),
        tunnel_ip: None,
        packet: packet.map(str::to_owned),
    };
    encode_message(&msg)
}

/// Encode an already-built message record.
pub fn encode_message(msg: &ProtocolMessage) -> SdpResult<String> {
    serde_json::to_string(msg).map_err(|e| SdpError::MalformedMessage(e.to_string()))
}

/// Decode one wire message from its JSON text.
///
/// Fails with `MalformedMessage` if the `action` key is missing or any
/// field has the wrong JSON type; an unknown action *token* decodes
/// successfully as [`Action::Unknown`].
pub fn decode(text: &str) -> SdpResult<ProtocolMessage> {
    serde_json::from_str(text).map_err(|e| SdpError::MalformedMessage(e.to_string()))
}

/// Decode a message from already-parsed JSON.
pub fn decode_value(value: serde_json::Value) -> SdpResult<ProtocolMessage> {
    serde_json::from_value(value).map_err(|e| SdpError::MalformedMessage(e.to_string()))
}
