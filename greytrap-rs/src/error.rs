use thiserror::Error;

#[derive(Error, Debug)]
pub enum GreytrapError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SMTP protocol error: {0}")]
    SmtpProtocol(String),

    #[error("Message protocol error: {0}")]
    Proto(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid address: {0}")]
    InvalidAddr(String),

    #[error("Blacklist feed error: {0}")]
    Feed(String),

    #[error("Firewall error: {0}")]
    Firewall(String),

    #[error("Sync error: {0}")]
    Sync(String),
}

pub type Result<T> = std::result::Result<T, GreytrapError>;
