use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::entities::{
    subscription_status::SubscriptionStatus,
    usage::{ApiService, LimitKind, LimitViolation},
};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid subscription transition from {from} to {to}")]
    InvalidTransition {
        from: SubscriptionStatus,
        to: SubscriptionStatus,
    },

    #[error("Subscription already terminated ({0})")]
    AlreadyTerminated(SubscriptionStatus),

    #[error("A subscription already references charge {0}")]
    DuplicateCharge(String),

    #[error("Billing provider error: {0}")]
    BillingProvider(String),

    #[error("{service} {limit} limit of {limit_value} reached ({remaining} remaining)")]
    RateLimitExceeded {
        service: ApiService,
        limit: LimitKind,
        limit_value: i64,
        remaining: i64,
        reset_at: Option<DateTime<Utc>>,
    },

    #[error("Webhook item {item_id} failed after {attempts} attempts: {message}")]
    WebhookProcessing {
        item_id: Uuid,
        attempts: i32,
        message: String,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Not found")]
    NotFound,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn rate_limited(service: ApiService, violation: LimitViolation) -> Self {
        AppError::RateLimitExceeded {
            service,
            limit: violation.kind,
            limit_value: violation.limit,
            remaining: violation.remaining,
            reset_at: violation.reset_at,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub enum ErrorCode {
    DatabaseError,
    InvalidTransition,
    AlreadyTerminated,
    DuplicateCharge,
    BillingProviderError,
    RateLimitExceeded,
    WebhookProcessingError,
    InvalidInput,
    Unauthorized,
    NotFound,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::InvalidTransition => "INVALID_TRANSITION",
            ErrorCode::AlreadyTerminated => "ALREADY_TERMINATED",
            ErrorCode::DuplicateCharge => "DUPLICATE_CHARGE",
            ErrorCode::BillingProviderError => "BILLING_PROVIDER_ERROR",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::WebhookProcessingError => "WEBHOOK_PROCESSING_ERROR",
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl From<&AppError> for ErrorCode {
    fn from(err: &AppError) -> Self {
        match err {
            AppError::Database(_) => ErrorCode::DatabaseError,
            AppError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            AppError::AlreadyTerminated(_) => ErrorCode::AlreadyTerminated,
            AppError::DuplicateCharge(_) => ErrorCode::DuplicateCharge,
            AppError::BillingProvider(_) => ErrorCode::BillingProviderError,
            AppError::RateLimitExceeded { .. } => ErrorCode::RateLimitExceeded,
            AppError::WebhookProcessing { .. } => ErrorCode::WebhookProcessingError,
            AppError::InvalidInput(_) => ErrorCode::InvalidInput,
            AppError::Unauthorized => ErrorCode::Unauthorized,
            AppError::NotFound => ErrorCode::NotFound,
            AppError::Internal(_) => ErrorCode::InternalError,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
