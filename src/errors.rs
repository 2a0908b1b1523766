use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum TrellisError {
    #[error("I/O error: {0}")]
    #[diagnostic(code(trellis::io))]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    #[diagnostic(code(trellis::config))]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(trellis::serde))]
    Serde(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    #[diagnostic(code(trellis::db))]
    Db(#[from] sea_orm::DbErr),

    #[error("JOSE error: {0}")]
    #[diagnostic(code(trellis::jose))]
    Jose(String),

    #[error("Bad request: {0}")]
    #[diagnostic(code(trellis::bad_request))]
    BadRequest(String),

    #[error("{0}")]
    #[diagnostic(code(trellis::other))]
    Other(String),
}

impl From<josekit::JoseError> for TrellisError {
    fn from(value: josekit::JoseError) -> Self {
        TrellisError::Jose(value.to_string())
    }
}
