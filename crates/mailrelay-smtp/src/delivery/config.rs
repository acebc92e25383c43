//! Delivery session configuration.

use tokio_rustls::TlsAcceptor;

/// Default maximum message size (36 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: u64 = 36 * 1024 * 1024;

/// Default size of body chunks handed to transaction handlers.
pub const DEFAULT_BODY_CHUNK_SIZE: usize = 64 * 1024;

/// Server-role configuration.
#[derive(Clone)]
pub struct DeliveryConfig {
    /// Domain announced in the greeting and hello replies.
    pub domain: String,
    /// Text following the domain in the 220 greeting.
    pub greeting: String,
    /// Advertise `CHUNKING` and `BINARYMIME` and accept `BDAT`.
    pub chunking: bool,
    /// Advertise and accept `8BITMIME`.
    pub eight_bit_mime: bool,
    /// Acceptor for `STARTTLS`; the extension is offered only when set.
    pub tls_acceptor: Option<TlsAcceptor>,
    /// Largest accepted message, advertised as `SIZE`.
    pub max_message_size: Option<u64>,
    /// Size of the chunks a handler receives while streaming a body.
    pub body_chunk_size: usize,
}

impl std::fmt::Debug for DeliveryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryConfig")
            .field("domain", &self.domain)
            .field("greeting", &self.greeting)
            .field("chunking", &self.chunking)
            .field("eight_bit_mime", &self.eight_bit_mime)
            .field("starttls", &self.tls_acceptor.is_some())
            .field("max_message_size", &self.max_message_size)
            .field("body_chunk_size", &self.body_chunk_size)
            .finish()
    }
}

impl DeliveryConfig {
    /// Creates a configuration with chunking and 8BITMIME enabled.
    #[must_use]
    pub fn new(domain: impl Into<String>) -> Self {
        ConfigBuilder::new(domain).build()
    }

    /// Creates a configuration builder.
    #[must_use]
    pub fn builder(domain: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder::new(domain)
    }
}

/// Builder for [`DeliveryConfig`].
#[derive(Clone)]
pub struct ConfigBuilder {
    domain: String,
    greeting: Option<String>,
    chunking: bool,
    eight_bit_mime: bool,
    tls_acceptor: Option<TlsAcceptor>,
    max_message_size: Option<u64>,
    body_chunk_size: usize,
}

impl ConfigBuilder {
    /// Creates a new builder with the given domain.
    #[must_use]
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            greeting: None,
            chunking: true,
            eight_bit_mime: true,
            tls_acceptor: None,
            max_message_size: Some(DEFAULT_MAX_MESSAGE_SIZE),
            body_chunk_size: DEFAULT_BODY_CHUNK_SIZE,
        }
    }

    /// Sets the greeting text.
    #[must_use]
    pub fn greeting(mut self, greeting: impl Into<String>) -> Self {
        self.greeting = Some(greeting.into());
        self
    }

    /// Enables or disables `BDAT`.
    #[must_use]
    pub const fn chunking(mut self, enabled: bool) -> Self {
        self.chunking = enabled;
        self
    }

    /// Enables or disables `8BITMIME`.
    #[must_use]
    pub const fn eight_bit_mime(mut self, enabled: bool) -> Self {
        self.eight_bit_mime = enabled;
        self
    }

    /// Enables `STARTTLS` with the given acceptor.
    #[must_use]
    pub fn tls_acceptor(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    /// Sets the maximum message size; `None` removes the limit.
    #[must_use]
    pub const fn max_message_size(mut self, size: Option<u64>) -> Self {
        self.max_message_size = size;
        self
    }

    /// Sets the body chunk size.
    #[must_use]
    pub const fn body_chunk_size(mut self, size: usize) -> Self {
        self.body_chunk_size = size;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> DeliveryConfig {
        DeliveryConfig {
            greeting: self
                .greeting
                .unwrap_or_else(|| "ESMTP service ready".to_string()),
            domain: self.domain,
            chunking: self.chunking,
            eight_bit_mime: self.eight_bit_mime,
            tls_acceptor: self.tls_acceptor,
            max_message_size: self.max_message_size,
            body_chunk_size: self.body_chunk_size.max(1),
        }
    }
}
