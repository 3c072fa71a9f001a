//! Boundary to the upstream transport that actually reaches the tokens.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream unreachable: {0}")]
    Unreachable(String),
    #[error("upstream rejected request: {0}")]
    Rejected(String),
    #[error("malformed upstream reply: {0}")]
    Malformed(String),
}

/// One connection to the upstream. Workers hold their own session.
#[async_trait::async_trait]
pub trait UpstreamSession: Send + Sync {
    /// Send one command (or a reset when `reset` is set) to `token`.
    /// The reply is a list of hex status strings, the first one carrying
    /// response data followed by the status word.
    async fn cmd(
        &self,
        apdu: Option<&str>,
        token: &str,
        reset: bool,
    ) -> Result<Vec<String>, UpstreamError>;

    /// Attached tokens, each optionally followed by whitespace and its ATR.
    async fn inventory(&self) -> Result<Vec<String>, UpstreamError>;
}

#[async_trait::async_trait]
pub trait UpstreamProvider: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn UpstreamSession>, UpstreamError>;

    async fn close(&self, session: Box<dyn UpstreamSession>);

    async fn is_up(&self) -> bool;
}
