use std::path::PathBuf;

use thiserror::Error;

use crate::auth::AuthError;
use crate::runtime::RuntimeError;

#[derive(Debug, Error)]
pub enum HopperError {
    #[error("config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("unknown database kind '{0}': only 'sqlite' is supported")]
    UnknownDatabase(String),

    #[error("database path is not configured")]
    MissingDatabase,

    #[error("invalid topic '{0}': must be a single path component of letters, digits, '.', '_' or '-'")]
    InvalidTopic(String),

    #[error("invalid destination id '{0}'")]
    InvalidDestination(String),

    #[error("inbox source file not found: {}", .0.display())]
    InboxSourceMissing(PathBuf),

    #[error("invalid registration: {0}")]
    InvalidRegistration(String),

    #[error("registration not found: {0}")]
    RegistrationNotFound(i64),

    #[error("registration already exists for topic '{topic}' and container '{container}'")]
    RegistrationExists { topic: String, container: String },

    #[error("user already exists: {0}")]
    UserExists(String),

    #[error("invalid user id or password")]
    InvalidCredentials,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("token authentication is not configured")]
    AuthNotConfigured,

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("failed to start container from image '{image}' after {attempts} attempt(s): {reason}")]
    ContainerStart {
        image: String,
        attempts: u32,
        reason: String,
    },

    #[error("background task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<tokio::task::JoinError> for HopperError {
    fn from(err: tokio::task::JoinError) -> Self {
        HopperError::Task(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HopperError>;
