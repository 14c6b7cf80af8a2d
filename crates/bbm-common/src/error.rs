use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("unknown database: {0}")]
    UnknownDatabase(String),

    #[error("{0}")]
    UnknownGitlabSchema(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("`{0}` cannot be run inside a transaction")]
    TransactionOpen(&'static str),

    #[error("cursor regression for migration {id}: {current} -> {requested}")]
    CursorRegression { id: i64, current: i64, requested: i64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),
}
