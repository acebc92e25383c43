//! Originating session configuration.

use rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

/// TLS parameters for `STARTTLS`.
#[derive(Clone)]
pub struct ClientTls {
    /// Connector used for the handshake.
    pub connector: TlsConnector,
    /// Name the server certificate must match.
    pub server_name: ServerName<'static>,
}

impl std::fmt::Debug for ClientTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTls")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

/// Client-role configuration.
#[derive(Debug, Clone)]
pub struct OriginatorConfig {
    /// Identity sent with `EHLO`/`HELO`.
    pub local_identity: String,
    /// Use `BDAT` when the server offers `CHUNKING` and the size is known.
    pub prefer_chunking: bool,
    /// Upgrade with `STARTTLS` when the server offers it.
    pub tls: Option<ClientTls>,
    /// Fail instead of continuing in plain text when `STARTTLS` is not
    /// offered.
    pub require_tls: bool,
}

impl OriginatorConfig {
    /// Creates a configuration without TLS that prefers chunking.
    #[must_use]
    pub fn new(local_identity: impl Into<String>) -> Self {
        OriginatorConfigBuilder::new(local_identity).build()
    }

    /// Creates a configuration builder.
    #[must_use]
    pub fn builder(local_identity: impl Into<String>) -> OriginatorConfigBuilder {
        OriginatorConfigBuilder::new(local_identity)
    }
}

/// Builder for [`OriginatorConfig`].
#[derive(Debug, Clone)]
pub struct OriginatorConfigBuilder {
    local_identity: String,
    prefer_chunking: bool,
    tls: Option<ClientTls>,
    require_tls: bool,
}

impl OriginatorConfigBuilder {
    /// Creates a new builder with the given identity.
    #[must_use]
    pub fn new(local_identity: impl Into<String>) -> Self {
        Self {
            local_identity: local_identity.into(),
            prefer_chunking: true,
            tls: None,
            require_tls: false,
        }
    }

    /// Enables or disables `BDAT` when available.
    #[must_use]
    pub const fn prefer_chunking(mut self, prefer: bool) -> Self {
        self.prefer_chunking = prefer;
        self
    }

    /// Enables opportunistic `STARTTLS`.
    #[must_use]
    pub fn starttls(mut self, connector: TlsConnector, server_name: ServerName<'static>) -> Self {
        self.tls = Some(ClientTls {
            connector,
            server_name,
        });
        self
    }

    /// Makes `STARTTLS` mandatory.
    #[must_use]
    pub const fn require_tls(mut self, require: bool) -> Self {
        self.require_tls = require;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> OriginatorConfig {
        OriginatorConfig {
            local_identity: self.local_identity,
            prefer_chunking: self.prefer_chunking,
            tls: self.tls,
            require_tls: self.require_tls,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::transport::default_tls_connector;

    #[test]
    fn test_defaults() {
        let config = OriginatorConfig::new("client.example.com");
        assert_eq!(config.local_identity, "client.example.com");
        assert!(config.prefer_chunking);
        assert!(config.tls.is_none());
        assert!(!config.require_tls);
    }

    #[test]
    fn test_builder() {
        let config = OriginatorConfig::builder("client.example.com")
            .prefer_chunking(false)
            .starttls(
                default_tls_connector(),
                ServerName::try_from("mx.example.org").unwrap(),
            )
            .require_tls(true)
            .build();
        assert!(!config.prefer_chunking);
        assert!(config.require_tls);
        assert_eq!(
            config.tls.unwrap().server_name,
            ServerName::try_from("mx.example.org").unwrap()
        );
    }
}
