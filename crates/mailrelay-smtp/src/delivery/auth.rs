//! SASL envelope for the `AUTH` command (RFC 4954).
//!
//! The session only moves base64 text back and forth. Mechanism logic lives
//! in an [`Authenticator`] supplied by the environment.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::AuthMechanism;

/// Result of one SASL step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslStep {
    /// Send this challenge (raw bytes, base64-encoded by the session) and
    /// wait for another response.
    Challenge(Vec<u8>),
    /// Authentication succeeded for the given identity.
    Success(String),
    /// Credentials were rejected.
    Failure,
}

/// Server-side SASL mechanism driver.
#[async_trait]
pub trait Authenticator: Send {
    /// Mechanisms advertised in the `AUTH` extension line.
    fn mechanisms(&self) -> Vec<AuthMechanism>;

    /// Starts an exchange. `initial_response` is the decoded response sent
    /// with the `AUTH` command, if any.
    async fn start(
        &mut self,
        mechanism: AuthMechanism,
        initial_response: Option<&[u8]>,
    ) -> Result<SaslStep>;

    /// Continues an exchange with the decoded client response.
    async fn step(&mut self, response: &[u8]) -> Result<SaslStep>;

    /// Called when the client cancels an exchange with `*`.
    fn abort(&mut self) {}
}
