use std::io;

use thiserror::Error;

/// Errors raised while wiring infrastructure at startup.
#[derive(Error, Debug)]
pub enum InfraError {
    #[error("Database connection failed")]
    DatabaseConnection(#[source] sqlx::Error),

    #[error("Database migration failed")]
    Migration(#[source] sqlx::migrate::MigrateError),

    #[error("Redis connection failed")]
    RedisConnection(#[source] redis::RedisError),

    #[error("HTTP client setup failed")]
    HttpClient(#[source] reqwest::Error),

    #[error("Failed to bind TCP listener")]
    TcpBind(#[source] io::Error),

    #[error("Server error")]
    Server(#[source] io::Error),
}

impl From<sqlx::Error> for InfraError {
    fn from(e: sqlx::Error) -> Self {
        InfraError::DatabaseConnection(e)
    }
}
