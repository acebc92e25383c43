//! Outer loop for the originating side.

use tokio_util::sync::CancellationToken;

use super::config::OriginatorConfig;
use super::session::{OriginatingSession, TransactionSource};
use crate::error::{Error, Result};
use crate::transport::Transport;

/// Runs a whole client connection: handshake, optional `STARTTLS`, every
/// transaction from a [`TransactionSource`], then `QUIT`.
#[derive(Debug)]
pub struct OriginatorProtocol<T> {
    transport: T,
    config: OriginatorConfig,
}

impl<T: Transport> OriginatorProtocol<T> {
    /// Binds a configuration to a connected transport.
    pub const fn new(transport: T, config: OriginatorConfig) -> Self {
        Self { transport, config }
    }

    /// Runs the connection to completion and returns the number of
    /// transactions sent.
    ///
    /// # Errors
    ///
    /// Returns the first error from the handshake, the TLS upgrade or the
    /// source. [`Error::NotSupported`] is returned when TLS is required but
    /// not offered.
    pub async fn run<S>(self, source: &mut S, cancel: &CancellationToken) -> Result<usize>
    where
        S: TransactionSource + ?Sized,
    {
        let mut session = OriginatingSession::connect(self.transport, self.config, cancel).await?;

        if let Some(tls) = session.config().tls.clone() {
            if session.extensions().contains("STARTTLS") {
                session
                    .start_tls(&tls.connector, tls.server_name, cancel)
                    .await?;
            } else if session.config().require_tls {
                tracing::warn!("server does not offer STARTTLS");
                return Err(Error::NotSupported("STARTTLS".to_string()));
            } else {
                tracing::info!("server does not offer STARTTLS, continuing in plain text");
            }
        }

        let count = match session.originate(source, cancel).await {
            Ok(count) => count,
            Err(err) => {
                if session.is_ready() && !err.is_unrecoverable() {
                    if let Err(quit_err) = session.quit(cancel).await {
                        tracing::debug!(error = %quit_err, "QUIT after failed transaction failed");
                    }
                }
                return Err(err);
            }
        };
        session.quit(cancel).await?;
        Ok(count)
    }
}
