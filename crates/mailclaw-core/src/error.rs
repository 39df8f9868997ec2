//! Shared error type.

/// Errors raised while loading or saving MailClaw state.
#[derive(Debug, thiserror::Error)]
pub enum MailClawError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MailClawError>;
