use crate::domain::credentials::Credentials;
use crate::domain::flow::{PendingPurchaseFlow, RequestToken};
use crate::domain::ports::{BillingService, PendingFlowStore};
use crate::domain::product::{ListingDetails, ProductId, ProductKind, PurchaseRecord};
use crate::error::{BillingError, Result, codes};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

/// A purchase flow the in-memory service was asked to start.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchedFlow {
    pub product_id: ProductId,
    pub kind: ProductKind,
    pub request_token: RequestToken,
}

#[derive(Default)]
struct ServiceState {
    connected: bool,
    catalog: HashMap<ProductId, ListingDetails>,
    owned: HashMap<(ProductKind, ProductId), PurchaseRecord>,
    launched: Vec<LaunchedFlow>,
    connect_failure: Option<String>,
    query_failure: Option<String>,
    launch_failure: Option<String>,
    consume_failure: Option<String>,
    latency: Option<Duration>,
}

/// A scripted Billing Service kept entirely in memory.
///
/// Backs the CLI host and the test-suite. Clones share state, so a test can
/// keep a handle to inspect calls after handing one to a session.
#[derive(Clone)]
pub struct InMemoryBillingService {
    state: Arc<RwLock<ServiceState>>,
    available: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
    connects: Arc<AtomicUsize>,
}

impl Default for InMemoryBillingService {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBillingService {
    /// Creates an available service with an empty catalog and no purchases.
    pub fn new() -> Self {
        Self::seeded(Vec::new(), Vec::new())
    }

    pub fn seeded(catalog: Vec<ListingDetails>, owned: Vec<PurchaseRecord>) -> Self {
        let state = ServiceState {
            catalog: catalog
                .into_iter()
                .map(|listing| (listing.product_id.clone(), listing))
                .collect(),
            owned: owned
                .into_iter()
                .map(|record| ((record.kind(), record.product_id.clone()), record))
                .collect(),
            ..ServiceState::default()
        };
        Self {
            state: Arc::new(RwLock::new(state)),
            available: Arc::new(AtomicBool::new(true)),
            calls: Arc::new(AtomicUsize::new(0)),
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub async fn fail_connect(&self, cause: impl Into<String>) {
        self.state.write().await.connect_failure = Some(cause.into());
    }

    /// Makes ownership and listing queries fail until cleared with `None`.
    pub async fn fail_queries(&self, cause: Option<String>) {
        self.state.write().await.query_failure = cause;
    }

    pub async fn fail_launches(&self, cause: Option<String>) {
        self.state.write().await.launch_failure = cause;
    }

    pub async fn fail_consumes(&self, cause: Option<String>) {
        self.state.write().await.consume_failure = cause;
    }

    /// Delay applied to every call except `connect` and `disconnect`.
    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.state.write().await.latency = latency;
    }

    pub async fn add_owned(&self, record: PurchaseRecord) {
        let mut state = self.state.write().await;
        state
            .owned
            .insert((record.kind(), record.product_id.clone()), record);
    }

    pub async fn add_listing(&self, listing: ListingDetails) {
        let mut state = self.state.write().await;
        state.catalog.insert(listing.product_id.clone(), listing);
    }

    /// Completes a launched flow on the service side, recording ownership.
    ///
    /// Returns the new purchase, or `None` if the token was never launched.
    pub async fn fulfil_flow(&self, token: &RequestToken) -> Option<PurchaseRecord> {
        let mut state = self.state.write().await;
        let launched = state
            .launched
            .iter()
            .find(|flow| &flow.request_token == token)?
            .clone();
        let record = Self::mint_purchase(&launched.product_id, launched.kind);
        state
            .owned
            .insert((launched.kind, record.product_id.clone()), record.clone());
        Some(record)
    }

    /// Builds a purchase for `product_id` as the service would report it.
    pub fn mint_purchase(product_id: &ProductId, kind: ProductKind) -> PurchaseRecord {
        let record = PurchaseRecord::new(product_id.clone(), Uuid::new_v4().simple().to_string())
            .with_order_id(format!("GPA.{}", Uuid::new_v4().simple()));
        PurchaseRecord {
            is_subscription: kind.is_subscription(),
            ..record
        }
    }

    pub async fn launched_flows(&self) -> Vec<LaunchedFlow> {
        self.state.read().await.launched.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.state.read().await.connected
    }

    /// Number of calls made past `connect`, i.e. purchase, query and
    /// consume calls.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    async fn enter_call(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = self.state.read().await.latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if !self.state.read().await.connected {
            return Err(BillingError::service(
                codes::SERVICE_UNAVAILABLE,
                "billing service is not connected",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl BillingService for InMemoryBillingService {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn connect(&self, _credentials: &Credentials) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.write().await;
        if let Some(cause) = &state.connect_failure {
            return Err(BillingError::ServiceUnavailable(cause.clone()));
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.write().await.connected = false;
        Ok(())
    }

    async fn begin_purchase_flow(
        &self,
        product_id: &ProductId,
        kind: ProductKind,
        request_token: &RequestToken,
    ) -> Result<()> {
        self.enter_call().await?;
        let mut state = self.state.write().await;
        if let Some(cause) = &state.launch_failure {
            return Err(BillingError::service(codes::ERROR, cause.clone()));
        }
        if state
            .owned
            .get(&(kind, product_id.clone()))
            .is_some_and(|record| !record.is_consumed)
        {
            return Err(BillingError::service(
                codes::ITEM_ALREADY_OWNED,
                format!("{} is already owned", product_id),
            ));
        }
        state.launched.push(LaunchedFlow {
            product_id: product_id.clone(),
            kind,
            request_token: request_token.clone(),
        });
        Ok(())
    }

    async fn query_owned(&self) -> Result<Vec<PurchaseRecord>> {
        self.enter_call().await?;
        let state = self.state.read().await;
        if let Some(cause) = &state.query_failure {
            return Err(BillingError::service(codes::FAILED_LOAD_PURCHASES, cause.clone()));
        }
        Ok(state
            .owned
            .values()
            .filter(|record| !record.is_consumed)
            .cloned()
            .collect())
    }

    async fn query_listing(
        &self,
        product_ids: &[ProductId],
        kind: ProductKind,
    ) -> Result<Vec<ListingDetails>> {
        self.enter_call().await?;
        let state = self.state.read().await;
        if let Some(cause) = &state.query_failure {
            return Err(BillingError::service(codes::LISTING_DETAILS_FAILED, cause.clone()));
        }
        Ok(product_ids
            .iter()
            .filter_map(|id| state.catalog.get(id))
            .filter(|listing| listing.kind() == kind)
            .cloned()
            .collect())
    }

    async fn consume(&self, purchase_token: &str) -> Result<()> {
        self.enter_call().await?;
        let mut state = self.state.write().await;
        if let Some(cause) = &state.consume_failure {
            return Err(BillingError::service(codes::CONSUME_FAILED, cause.clone()));
        }
        let owned = state
            .owned
            .values_mut()
            .find(|record| record.purchase_token == purchase_token && !record.is_consumed);
        match owned {
            Some(record) => {
                record.is_consumed = true;
                Ok(())
            }
            None => Err(BillingError::service(
                codes::ITEM_NOT_OWNED,
                "purchase token does not match an owned item",
            )),
        }
    }
}

/// A thread-safe in-memory store for pending purchase flows.
///
/// Flows only survive as long as the store value, which is enough when the
/// host keeps the store across session instances.
#[derive(Default, Clone)]
pub struct InMemoryPendingFlowStore {
    flows: Arc<RwLock<HashMap<RequestToken, PendingPurchaseFlow>>>,
}

impl InMemoryPendingFlowStore {
    /// Creates a new, empty in-memory flow store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PendingFlowStore for InMemoryPendingFlowStore {
    async fn store(&self, flow: PendingPurchaseFlow) -> Result<()> {
        let mut flows = self.flows.write().await;
        flows.insert(flow.request_token.clone(), flow);
        Ok(())
    }

    async fn take(&self, token: &RequestToken) -> Result<Option<PendingPurchaseFlow>> {
        let mut flows = self.flows.write().await;
        Ok(flows.remove(token))
    }

    async fn get_all(&self) -> Result<Vec<PendingPurchaseFlow>> {
        let flows = self.flows.read().await;
        Ok(flows.values().cloned().collect())
    }
}
