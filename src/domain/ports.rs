use super::credentials::Credentials;
use super::flow::{PendingPurchaseFlow, RequestToken};
use super::product::{ListingDetails, ProductId, ProductKind, PurchaseRecord};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// The external purchase-processing service.
///
/// Every call is asynchronous and fallible; the session never assumes a call
/// completes.
#[async_trait]
pub trait BillingService: Send + Sync {
    /// Cheap capability probe. Must not perform I/O.
    fn is_available(&self) -> bool;

    async fn connect(&self, credentials: &Credentials) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;

    /// Starts an out-of-process purchase flow. The outcome comes back through
    /// the platform result channel, tagged with `request_token`.
    async fn begin_purchase_flow(
        &self,
        product_id: &ProductId,
        kind: ProductKind,
        request_token: &RequestToken,
    ) -> Result<()>;

    /// All non-consumed purchases and subscriptions owned by the caller.
    async fn query_owned(&self) -> Result<Vec<PurchaseRecord>>;

    async fn query_listing(
        &self,
        product_ids: &[ProductId],
        kind: ProductKind,
    ) -> Result<Vec<ListingDetails>>;

    async fn consume(&self, purchase_token: &str) -> Result<()>;
}

/// Durable storage for purchase flows that may outlive the process.
#[async_trait]
pub trait PendingFlowStore: Send + Sync {
    async fn store(&self, flow: PendingPurchaseFlow) -> Result<()>;
    /// Removes and returns the flow registered under `token`.
    async fn take(&self, token: &RequestToken) -> Result<Option<PendingPurchaseFlow>>;
    async fn get_all(&self) -> Result<Vec<PendingPurchaseFlow>>;
}

pub type BillingServiceRef = Arc<dyn BillingService>;
pub type PendingFlowStoreBox = Box<dyn PendingFlowStore>;
