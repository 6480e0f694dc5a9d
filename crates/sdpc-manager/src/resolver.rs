//! Service-to-gateway resolution.
//!
//! The manager depends only on the [`ServiceResolver`] contract. The
//! shipped implementation reads a layered TOML stanza file: values for
//! a service may come from the `[default]` section, overridden by the
//! section named by the decimal service id.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use sdpc_proto::{SdpError, SdpResult, TUNNEL_PORT};

/// Resolved gateway endpoint for a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayAddr {
    pub ip: String,
    pub port: u16,
}

/// Maps a service id to the gateway hosting it.
///
/// Outcomes: success, `ServiceNotFound` (no stanza for the id), or
/// `ServiceUnresolved` (a stanza exists but names no gateway).
pub trait ServiceResolver: Send + Sync {
    fn resolve(&self, service_id: u32) -> SdpResult<GatewayAddr>;
}

/// One stanza of the resolver file.
#[derive(Debug, Clone, Default, Deserialize)]
struct Stanza {
    gateway: Option<String>,
    port: Option<u16>,
}

/// TOML-backed stanza resolver.
pub struct StanzaResolver {
    default: Stanza,
    stanzas: HashMap<String, Stanza>,
}

impl StanzaResolver {
    /// Load the stanza file the manager was started with.
    pub fn load(path: &Path) -> SdpResult<Self> {
        info!(path = %path.display(), "loading service stanza file");
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> SdpResult<Self> {
        let mut stanzas: HashMap<String, Stanza> = toml::from_str(content)
            .map_err(|e| SdpError::InvalidArgument(format!("stanza file parse error: {e}")))?;
        let default = stanzas.remove("default").unwrap_or_default();
        Ok(Self { default, stanzas })
    }
}

impl ServiceResolver for StanzaResolver {
    fn resolve(&self, service_id: u32) -> SdpResult<GatewayAddr> {
        let named = self
            .stanzas
            .get(&service_id.to_string())
            .ok_or(SdpError::ServiceNotFound(service_id))?;

        // the gateway address may come from the default stanza; an
        // empty string counts as unset
        let ip = named
            .gateway
            .clone()
            .filter(|g| !g.is_empty())
            .or_else(|| self.default.gateway.clone().filter(|g| !g.is_empty()))
            .ok_or(SdpError::ServiceUnresolved(service_id))?;
        let port = named.port.or(self.default.port).unwrap_or(TUNNEL_PORT);

        Ok(GatewayAddr { ip, port })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STANZAS: &str = r#"
[default]
gateway = "10.0.0.1"

[7]
gateway = "10.0.0.5"

[9]
port = 9000
"#;

    #[test]
    fn named_stanza_wins() {
        let resolver = StanzaResolver::parse(STANZAS).unwrap();
        let addr = resolver.resolve(7).unwrap();
        assert_eq!(addr.ip, "10.0.0.5");
        assert_eq!(addr.port, TUNNEL_PORT);
    }

    #[test]
    fn default_stanza_fills_gaps() {
        let resolver = StanzaResolver::parse(STANZAS).unwrap();
        let addr = resolver.resolve(9).unwrap();
        assert_eq!(addr.ip, "10.0.0.1");
        assert_eq!(addr.port, 9000);
    }

    #[test]
    fn unknown_service_id_not_found() {
        let resolver = StanzaResolver::parse(STANZAS).unwrap();
        let err = resolver.resolve(99).unwrap_err();
        assert!(matches!(err, SdpError::ServiceNotFound(99)));
    }

    #[test]
    fn stanza_without_gateway_unresolved() {
        let resolver = StanzaResolver::parse("[7]\nport = 9000\n").unwrap();
        let err = resolver.resolve(7).unwrap_err();
        assert!(matches!(err, SdpError::ServiceUnresolved(7)));
    }

    #[test]
    fn empty_gateway_string_counts_as_unset() {
        let resolver = StanzaResolver::parse("[7]\ngateway = \"\"\n").unwrap();
        let err = resolver.resolve(7).unwrap_err();
        assert!(matches!(err, SdpError::ServiceUnresolved(7)));
    }
}
