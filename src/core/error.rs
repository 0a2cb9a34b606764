use rusqlite;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CephalonError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
    #[error("Build error: {0}")]
    BuildError(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Scope violation: {0}")]
    ScopeViolation(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Config error: {0}")]
    ConfigError(String),
}
