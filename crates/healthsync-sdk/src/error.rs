use std::fmt;
use rusqlite;

#[derive(Debug)]
pub enum HealthSyncError {
    SqliteError(rusqlite::Error),
    JsonError(String),
    InvalidArgument(String),
    NotFound(String),
    Other(String),
    KvStore(String),
    Serialization(String),
    IO(String),
    Database(String),
    Migration(String),
    NotAuthorized(String),
    Network(String),
    Upload(String),
    Timeout(String),
    Config(String),
    NotInitialized(String),
    ShuttingDown(String),
    ServerRejected { status: u16, message: String },
    InvalidData(String),
}

impl fmt::Display for HealthSyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthSyncError::SqliteError(e) => write!(f, "SQLite error: {}", e),
            HealthSyncError::JsonError(e) => write!(f, "JSON error: {}", e),
            HealthSyncError::InvalidArgument(e) => write!(f, "Invalid argument: {}", e),
            HealthSyncError::NotFound(e) => write!(f, "Not found: {}", e),
            HealthSyncError::Other(e) => write!(f, "Other error: {}", e),
            HealthSyncError::KvStore(e) => write!(f, "KV store error: {}", e),
            HealthSyncError::Serialization(e) => write!(f, "Serialization error: {}", e),
            HealthSyncError::IO(e) => write!(f, "IO error: {}", e),
            HealthSyncError::Database(e) => write!(f, "Database error: {}", e),
            HealthSyncError::Migration(e) => write!(f, "Migration error: {}", e),
            HealthSyncError::NotAuthorized(e) => write!(f, "Not authorized: {}", e),
            HealthSyncError::Network(e) => write!(f, "Network error: {}", e),
            HealthSyncError::Upload(e) => write!(f, "Upload error: {}", e),
            HealthSyncError::Timeout(e) => write!(f, "Timeout: {}", e),
            HealthSyncError::Config(e) => write!(f, "Config error: {}", e),
            HealthSyncError::NotInitialized(e) => write!(f, "Not initialized: {}", e),
            HealthSyncError::ShuttingDown(e) => write!(f, "Shutting down: {}", e),
            HealthSyncError::ServerRejected { status, message } => {
                write!(f, "Server rejected [{}]: {}", status, message)
            }
            HealthSyncError::InvalidData(e) => write!(f, "Invalid data: {}", e),
        }
    }
}

impl std::error::Error for HealthSyncError {}

impl From<rusqlite::Error> for HealthSyncError {
    fn from(error: rusqlite::Error) -> Self {
        HealthSyncError::SqliteError(error)
    }
}

impl From<serde_json::Error> for HealthSyncError {
    fn from(error: serde_json::Error) -> Self {
        HealthSyncError::JsonError(error.to_string())
    }
}

impl From<std::io::Error> for HealthSyncError {
    fn from(error: std::io::Error) -> Self {
        HealthSyncError::IO(error.to_string())
    }
}

impl HealthSyncError {
    /// 服务端拒绝时的 HTTP 状态码（如果是服务端拒绝错误）
    pub fn server_status(&self) -> Option<u16> {
        match self {
            HealthSyncError::ServerRejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, HealthSyncError>;
