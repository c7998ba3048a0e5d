use super::product::{ProductId, PurchaseRecord};
use std::fmt;

/// Notifications a session emits to its observers.
#[derive(Debug, Clone, PartialEq)]
pub enum BillingEvent {
    /// Connected and the ownership sync has populated the purchase cache.
    Ready,
    /// Initialization failed; the session must be discarded.
    InitError { code: i32, cause: String },
    /// A purchase was completed or restored.
    Purchased {
        product_id: ProductId,
        record: PurchaseRecord,
    },
    BillingError { code: i32, cause: String },
}

impl fmt::Display for BillingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BillingEvent::Ready => f.write_str("ready"),
            BillingEvent::InitError { code, cause } => write!(f, "init-error {} {}", code, cause),
            BillingEvent::Purchased { product_id, .. } => write!(f, "purchased {}", product_id),
            BillingEvent::BillingError { code, cause } => {
                write!(f, "billing-error {} {}", code, cause)
            }
        }
    }
}
