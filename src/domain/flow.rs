use super::product::{ProductId, ProductKind, PurchaseRecord};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Correlates a purchase flow launch with the outcome the platform result
/// channel eventually delivers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestToken(String);

impl RequestToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestToken {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

impl From<String> for RequestToken {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl fmt::Display for RequestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A purchase or subscription handed to an external flow that has not
/// reported back yet.
///
/// Persisted through `PendingFlowStore` so a session created after a process
/// restart still recognises the token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPurchaseFlow {
    pub request_token: RequestToken,
    pub product_id: ProductId,
    pub kind: ProductKind,
}

impl PendingPurchaseFlow {
    pub fn new(product_id: ProductId, kind: ProductKind) -> Self {
        Self {
            request_token: RequestToken::generate(),
            product_id,
            kind,
        }
    }
}

/// Outcome of an external purchase flow, as delivered by the platform.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowOutcome {
    Success(PurchaseRecord),
    Cancelled,
    Error { code: i32, cause: String },
}
