use crate::domain::product::ProductId;
use crate::domain::state::SessionState;
use thiserror::Error;

/// Numeric response codes carried by `InitError` and `BillingError` events.
pub mod codes {
    pub const SERVICE_TIMEOUT: i32 = -3;
    pub const USER_CANCELED: i32 = 1;
    pub const SERVICE_UNAVAILABLE: i32 = 2;
    pub const BILLING_UNAVAILABLE: i32 = 3;
    pub const ITEM_UNAVAILABLE: i32 = 4;
    pub const DEVELOPER_ERROR: i32 = 5;
    pub const ERROR: i32 = 6;
    pub const ITEM_ALREADY_OWNED: i32 = 7;
    pub const ITEM_NOT_OWNED: i32 = 8;

    pub const FAILED_LOAD_PURCHASES: i32 = 100;
    pub const FAILED_TO_INITIALIZE_PURCHASE: i32 = 101;
    pub const INVALID_MERCHANT_ID: i32 = 104;
    pub const OTHER_ERROR: i32 = 110;
    pub const CONSUME_FAILED: i32 = 111;
    pub const LISTING_DETAILS_FAILED: i32 = 112;
    pub const BIND_FAILED: i32 = 113;
}

#[derive(Error, Debug)]
pub enum BillingError {
    #[error("Billing service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("Operation not allowed while session is {0}")]
    InvalidState(SessionState),
    #[error("Product {0} is not owned")]
    NotOwned(ProductId),
    #[error("Billing service error {code}: {cause}")]
    ServiceError { code: i32, cause: String },
    #[error("Purchase flow cancelled")]
    Cancelled,
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDbError(#[from] rocksdb::Error),
    #[error("Internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
}

impl BillingError {
    pub fn service(code: i32, cause: impl Into<String>) -> Self {
        BillingError::ServiceError {
            code,
            cause: cause.into(),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            BillingError::ServiceUnavailable(_) => codes::BILLING_UNAVAILABLE,
            BillingError::InvalidState(_) => codes::DEVELOPER_ERROR,
            BillingError::NotOwned(_) => codes::ITEM_NOT_OWNED,
            BillingError::ServiceError { code, .. } => *code,
            BillingError::Cancelled => codes::USER_CANCELED,
            _ => codes::ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, BillingError>;
