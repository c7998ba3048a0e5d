use crate::application::config::{RestoreNotify, SessionConfig};
use crate::domain::credentials::Credentials;
use crate::domain::event::BillingEvent;
use crate::domain::flow::{FlowOutcome, PendingPurchaseFlow, RequestToken};
use crate::domain::ports::{BillingService, BillingServiceRef, PendingFlowStoreBox};
use crate::domain::product::{ListingDetails, ProductId, ProductKind, PurchaseRecord};
use crate::domain::state::SessionState;
use crate::error::{BillingError, Result, codes};
use dashmap::DashMap;
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{broadcast, watch};
use tokio::task::AbortHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationId(u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Consume,
    ListingDetails,
    SubscriptionDetails,
    Restore,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Consume => "consume",
            OperationKind::ListingDetails => "listing details",
            OperationKind::SubscriptionDetails => "subscription details",
            OperationKind::Restore => "restore",
        };
        f.write_str(name)
    }
}

/// An in-flight callback operation. Whoever removes it from the registry
/// owns the right to complete it.
struct PendingOperation {
    kind: OperationKind,
    abort: Option<AbortHandle>,
}

/// Cache key. A managed product and a subscription may share an id.
type PurchaseKey = (ProductKind, ProductId);

struct SessionInner {
    service: BillingServiceRef,
    flow_store: PendingFlowStoreBox,
    config: SessionConfig,
    credentials: OnceLock<Credentials>,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<BillingEvent>,
    purchases: DashMap<PurchaseKey, PurchaseRecord>,
    pending_flows: DashMap<RequestToken, PendingPurchaseFlow>,
    pending_ops: DashMap<OperationId, PendingOperation>,
    next_operation: AtomicU64,
}

/// Orchestrates a connection to the Billing Service.
///
/// `BillingSession` gates every operation on the session being `Ready`,
/// dispatches purchase, consume and query calls, and reconciles outcomes of
/// external purchase flows into its purchase cache. Observers follow along
/// through [`BillingSession::events`].
///
/// Cloning is cheap and yields a handle to the same session. The owner of
/// the session is expected to call [`BillingSession::release`] on teardown.
#[derive(Clone)]
pub struct BillingSession {
    inner: Arc<SessionInner>,
}

impl BillingSession {
    /// Creates a new, uninitialized session.
    ///
    /// # Arguments
    ///
    /// * `service` - The Billing Service collaborator.
    /// * `flow_store` - Storage for purchase flows that may outlive the process.
    /// * `config` - Timeouts, event buffering and restore notification policy.
    pub fn new(
        service: BillingServiceRef,
        flow_store: PendingFlowStoreBox,
        config: SessionConfig,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Uninitialized);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(SessionInner {
                service,
                flow_store,
                config,
                credentials: OnceLock::new(),
                state,
                events,
                purchases: DashMap::new(),
                pending_flows: DashMap::new(),
                pending_ops: DashMap::new(),
                next_operation: AtomicU64::new(1),
            }),
        }
    }

    /// Pre-flight probe, usable before a session exists.
    pub fn is_service_available(service: &dyn BillingService) -> bool {
        service.is_available()
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Subscribes to session notifications. Only events emitted after the
    /// call are received.
    pub fn events(&self) -> broadcast::Receiver<BillingEvent> {
        self.inner.events.subscribe()
    }

    /// Connects to the Billing Service and performs the ownership sync.
    ///
    /// Fires `Ready` on success. On failure the session moves to `Failed`,
    /// fires `InitError` and must be discarded; no retry is attempted.
    pub async fn initialize(&self, credentials: Credentials) -> Result<()> {
        self.transition(SessionState::Connecting)?;
        info!("Connecting to billing service");

        if let Err(err) = self.connect_and_sync(&credentials).await {
            // A concurrent release() already moved the session to Released.
            if self.transition(SessionState::Failed).is_ok() {
                warn!("Billing session failed to initialize: {}", err);
                self.emit(BillingEvent::InitError {
                    code: err.code(),
                    cause: err.to_string(),
                });
            }
            return Err(err);
        }

        if let Err(err) = self.transition(SessionState::Ready) {
            debug!("Session released during initialization, dropping connection");
            self.clear_local_state();
            self.disconnect_quietly().await;
            return Err(err);
        }

        info!(
            "Billing session ready ({} owned products, {} owned subscriptions, {} interrupted flows)",
            self.list_owned_products().len(),
            self.list_owned_subscriptions().len(),
            self.inner.pending_flows.len()
        );
        self.emit(BillingEvent::Ready);
        Ok(())
    }

    async fn connect_and_sync(&self, credentials: &Credentials) -> Result<()> {
        let service = &self.inner.service;
        if !service.is_available() {
            return Err(BillingError::ServiceUnavailable(
                "billing service is not installed or not supported".to_string(),
            ));
        }

        self.with_timeout(service.connect(credentials))
            .await
            .map_err(|err| match err {
                BillingError::ServiceUnavailable(_) => err,
                other => BillingError::ServiceUnavailable(other.to_string()),
            })?;

        let synced = async {
            let owned = self.fetch_owned().await?;
            let flows = self.inner.flow_store.get_all().await?;
            Ok::<_, BillingError>((owned, flows))
        }
        .await;

        let (owned, flows) = match synced {
            Ok(synced) => synced,
            Err(err) => {
                self.disconnect_quietly().await;
                return Err(err);
            }
        };

        let _ = self.inner.credentials.set(credentials.clone());
        self.merge_owned(owned);
        for flow in flows {
            debug!(
                "Recovered interrupted purchase flow {} for {}",
                flow.request_token, flow.product_id
            );
            self.inner
                .pending_flows
                .insert(flow.request_token.clone(), flow);
        }
        Ok(())
    }

    /// Launches the purchase flow for a managed product.
    ///
    /// The outcome arrives later through [`BillingSession::resolve_purchase_flow`]
    /// and is announced as a `Purchased` or `BillingError` event.
    pub async fn purchase(&self, product_id: &ProductId) -> Result<RequestToken> {
        self.launch_flow(product_id, ProductKind::Managed).await
    }

    /// Launches the purchase flow for a subscription.
    pub async fn subscribe(&self, product_id: &ProductId) -> Result<RequestToken> {
        self.launch_flow(product_id, ProductKind::Subscription).await
    }

    async fn launch_flow(&self, product_id: &ProductId, kind: ProductKind) -> Result<RequestToken> {
        self.ensure_ready()?;

        let flow = PendingPurchaseFlow::new(product_id.clone(), kind);
        let token = flow.request_token.clone();
        // Persist first: the flow may finish after this process is gone.
        self.inner.flow_store.store(flow.clone()).await?;
        self.inner.pending_flows.insert(token.clone(), flow);

        let launched = self.with_timeout(self.inner.service.begin_purchase_flow(
            product_id,
            kind,
            &token,
        ));
        if let Err(err) = launched.await {
            self.inner.pending_flows.remove(&token);
            if let Err(store_err) = self.inner.flow_store.take(&token).await {
                warn!("Failed to drop pending flow {}: {}", token, store_err);
            }
            if !self.state().is_ready() {
                debug!(
                    "Dropping launch failure of {} on {} session: {}",
                    token,
                    self.state(),
                    err
                );
                return Err(err);
            }
            self.emit(BillingEvent::BillingError {
                code: codes::FAILED_TO_INITIALIZE_PURCHASE,
                cause: err.to_string(),
            });
            return Err(err);
        }

        info!("Started {} purchase flow {} for {}", kind, token, product_id);
        Ok(token)
    }

    /// Routes the outcome of an external purchase flow.
    ///
    /// Returns `false` when the token is unknown or already resolved, so the
    /// host can forward the result elsewhere. Replaying a resolved token is a
    /// no-op.
    pub async fn resolve_purchase_flow(
        &self,
        token: &RequestToken,
        outcome: FlowOutcome,
    ) -> Result<bool> {
        if !self.state().is_ready() {
            debug!(
                "Ignoring purchase flow result {} on {} session",
                token,
                self.state()
            );
            return Ok(false);
        }
        let Some((_, flow)) = self.inner.pending_flows.remove(token) else {
            debug!("Unrecognized purchase flow token {}", token);
            return Ok(false);
        };

        match outcome {
            FlowOutcome::Success(record) => self.accept_purchase(&flow, record),
            FlowOutcome::Cancelled => {
                info!("Purchase flow {} for {} cancelled", token, flow.product_id);
            }
            FlowOutcome::Error { code, cause } => {
                warn!(
                    "Purchase flow {} for {} failed with {}: {}",
                    token, flow.product_id, code, cause
                );
                self.emit(BillingEvent::BillingError { code, cause });
            }
        }

        // Outcome already applied. A failed removal leaves a stale entry.
        if let Err(err) = self.inner.flow_store.take(token).await {
            warn!("Failed to drop resolved flow {}: {}", token, err);
        }
        Ok(true)
    }

    fn accept_purchase(&self, flow: &PendingPurchaseFlow, record: PurchaseRecord) {
        if record.product_id != flow.product_id {
            warn!(
                "Rejecting purchase of {} delivered for flow {} ({})",
                record.product_id, flow.request_token, flow.product_id
            );
            self.emit(BillingEvent::BillingError {
                code: codes::ERROR,
                cause: format!(
                    "purchase of {} does not match requested product {}",
                    record.product_id, flow.product_id
                ),
            });
            return;
        }
        if !self.merchant_accepts(&record) {
            warn!("Rejecting purchase of {}: merchant id mismatch", record.product_id);
            self.emit(BillingEvent::BillingError {
                code: codes::INVALID_MERCHANT_ID,
                cause: format!(
                    "order {} was not issued by the configured merchant",
                    record.order_id.as_deref().unwrap_or("<none>")
                ),
            });
            return;
        }

        let record = PurchaseRecord {
            is_subscription: flow.kind.is_subscription(),
            is_consumed: false,
            ..record
        };
        self.inner
            .purchases
            .insert((flow.kind, record.product_id.clone()), record.clone());
        info!("Purchased {}", record.product_id);
        self.emit(BillingEvent::Purchased {
            product_id: record.product_id.clone(),
            record,
        });
    }

    fn merchant_accepts(&self, record: &PurchaseRecord) -> bool {
        let merchant_id = self
            .inner
            .credentials
            .get()
            .and_then(|credentials| credentials.merchant_id.as_deref());
        match merchant_id {
            None => true,
            Some(merchant_id) => record.merchant_prefix() == Some(merchant_id),
        }
    }

    /// Cache lookup: owned, non-consumed managed product.
    pub fn is_purchased(&self, product_id: &ProductId) -> bool {
        self.owns(product_id, ProductKind::Managed)
    }

    pub fn is_subscribed(&self, product_id: &ProductId) -> bool {
        self.owns(product_id, ProductKind::Subscription)
    }

    pub fn list_owned_products(&self) -> BTreeSet<ProductId> {
        self.owned_of(ProductKind::Managed)
    }

    pub fn list_owned_subscriptions(&self) -> BTreeSet<ProductId> {
        self.owned_of(ProductKind::Subscription)
    }

    /// Snapshot of every cached record, consumed ones included, ordered by
    /// product id.
    pub fn purchase_records(&self) -> Vec<PurchaseRecord> {
        if !self.state().is_ready() {
            return Vec::new();
        }
        let mut records: Vec<PurchaseRecord> = self
            .inner
            .purchases
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| {
            (&a.product_id, a.is_subscription).cmp(&(&b.product_id, b.is_subscription))
        });
        records
    }

    pub fn pending_purchase_flows(&self) -> Vec<PendingPurchaseFlow> {
        self.inner
            .pending_flows
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn pending_operation_count(&self) -> usize {
        self.inner.pending_ops.len()
    }

    fn owns(&self, product_id: &ProductId, kind: ProductKind) -> bool {
        self.state().is_ready()
            && self
                .inner
                .purchases
                .get(&(kind, product_id.clone()))
                .is_some_and(|record| record.grants(kind))
    }

    fn owned_of(&self, kind: ProductKind) -> BTreeSet<ProductId> {
        if !self.state().is_ready() {
            return BTreeSet::new();
        }
        self.inner
            .purchases
            .iter()
            .filter(|entry| entry.value().grants(kind))
            .map(|entry| entry.value().product_id.clone())
            .collect()
    }

    /// Consumes an owned managed product so it can be bought again.
    ///
    /// Fails with `NotOwned` without calling the Billing Service when the
    /// product is not currently owned. The cache is only touched on success.
    pub async fn consume(&self, product_id: &ProductId) -> Result<()> {
        self.ensure_ready()?;

        let key = (ProductKind::Managed, product_id.clone());
        let purchase_token = self
            .inner
            .purchases
            .get(&key)
            .filter(|record| record.grants(ProductKind::Managed))
            .map(|record| record.purchase_token.clone());
        let Some(purchase_token) = purchase_token else {
            return Err(BillingError::NotOwned(product_id.clone()));
        };

        self.with_timeout(self.inner.service.consume(&purchase_token))
            .await
            .map_err(|err| match err {
                // A concurrent consume of the same product got there first.
                BillingError::ServiceError {
                    code: codes::ITEM_NOT_OWNED,
                    ..
                } => BillingError::NotOwned(product_id.clone()),
                other => other,
            })?;
        // Released while the call was in flight: nothing left to update.
        self.ensure_ready()?;

        if let Some(mut record) = self.inner.purchases.get_mut(&key) {
            record.is_consumed = true;
        }
        info!("Consumed {}", product_id);
        Ok(())
    }

    /// Fetches display metadata for managed products.
    ///
    /// Missing ids are left out of the result; only a failed call is an error.
    pub async fn query_listing_details(
        &self,
        product_ids: &[ProductId],
    ) -> Result<Vec<ListingDetails>> {
        self.query_details(product_ids, ProductKind::Managed).await
    }

    pub async fn query_subscription_details(
        &self,
        product_ids: &[ProductId],
    ) -> Result<Vec<ListingDetails>> {
        self.query_details(product_ids, ProductKind::Subscription)
            .await
    }

    async fn query_details(
        &self,
        product_ids: &[ProductId],
        kind: ProductKind,
    ) -> Result<Vec<ListingDetails>> {
        self.ensure_ready()?;
        if product_ids.is_empty() {
            return Ok(Vec::new());
        }

        let listings = self
            .with_timeout(self.inner.service.query_listing(product_ids, kind))
            .await
            .map_err(|err| match err {
                BillingError::ServiceError { .. } => err,
                other => BillingError::service(codes::LISTING_DETAILS_FAILED, other.to_string()),
            })?;
        self.ensure_ready()?;

        Ok(listings
            .into_iter()
            .filter(|listing| product_ids.contains(&listing.product_id))
            .collect())
    }

    /// Re-runs the ownership sync.
    ///
    /// Owned records are added or updated; records missing from the listing
    /// are kept, since only consumption removes ownership. `Purchased` events
    /// follow the configured [`RestoreNotify`] policy.
    pub async fn restore_owned_purchases(&self) -> Result<()> {
        self.ensure_ready()?;
        let owned = self.fetch_owned().await?;
        self.ensure_ready()?;

        let policy = self.inner.config.restore_notify;
        let merged = self.merge_owned(owned);
        let restored = merged.len();
        for (record, newly_present) in merged {
            let notify = match policy {
                RestoreNotify::NewlyPresent => newly_present,
                RestoreNotify::Always => true,
                RestoreNotify::Never => false,
            };
            if notify {
                self.emit(BillingEvent::Purchased {
                    product_id: record.product_id.clone(),
                    record,
                });
            }
        }
        info!("Restored {} owned purchases", restored);
        Ok(())
    }

    pub fn consume_async<F>(&self, product_id: ProductId, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        if let Err(err) = self.ensure_ready() {
            callback(Err(err));
            return;
        }
        let session = self.clone();
        self.dispatch(
            OperationKind::Consume,
            async move { session.consume(&product_id).await },
            callback,
        );
    }

    pub fn query_listing_details_async<F>(&self, product_ids: Vec<ProductId>, callback: F)
    where
        F: FnOnce(Result<Vec<ListingDetails>>) + Send + 'static,
    {
        if let Err(err) = self.ensure_ready() {
            callback(Err(err));
            return;
        }
        let session = self.clone();
        self.dispatch(
            OperationKind::ListingDetails,
            async move { session.query_listing_details(&product_ids).await },
            callback,
        );
    }

    pub fn query_subscription_details_async<F>(&self, product_ids: Vec<ProductId>, callback: F)
    where
        F: FnOnce(Result<Vec<ListingDetails>>) + Send + 'static,
    {
        if let Err(err) = self.ensure_ready() {
            callback(Err(err));
            return;
        }
        let session = self.clone();
        self.dispatch(
            OperationKind::SubscriptionDetails,
            async move { session.query_subscription_details(&product_ids).await },
            callback,
        );
    }

    pub fn restore_owned_purchases_async<F>(&self, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        if let Err(err) = self.ensure_ready() {
            callback(Err(err));
            return;
        }
        let session = self.clone();
        self.dispatch(
            OperationKind::Restore,
            async move { session.restore_owned_purchases().await },
            callback,
        );
    }

    /// Runs `operation` on the runtime and hands its result to `callback`
    /// exactly once, unless the session is released first.
    fn dispatch<T, Fut, F>(&self, kind: OperationKind, operation: Fut, callback: F)
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        F: FnOnce(Result<T>) + Send + 'static,
    {
        let id = OperationId(self.inner.next_operation.fetch_add(1, Ordering::Relaxed));
        self.inner
            .pending_ops
            .insert(id, PendingOperation { kind, abort: None });

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let result = operation.await;
            match inner.pending_ops.remove(&id) {
                Some(_) => callback(result),
                None => debug!("Dropping result of abandoned {} operation {}", kind, id),
            }
        });

        if let Some(mut pending) = self.inner.pending_ops.get_mut(&id) {
            pending.abort = Some(handle.abort_handle());
        }
    }

    /// Shuts the session down.
    ///
    /// Idempotent. Outstanding callback operations and purchase flows are
    /// abandoned without firing; persisted flows stay in the flow store for
    /// the next session.
    pub async fn release(&self) {
        let previous = match self.transition(SessionState::Released) {
            Ok(previous) => previous,
            Err(_) => {
                debug!("Release ignored on {} session", self.state());
                return;
            }
        };

        let abandoned = self.abandon_pending_operations();
        self.clear_local_state();
        info!(
            "Billing session released ({} pending operations abandoned)",
            abandoned
        );

        // A session still connecting disconnects at the end of initialize().
        if previous == SessionState::Ready {
            self.disconnect_quietly().await;
        }
    }

    fn abandon_pending_operations(&self) -> usize {
        let ids: Vec<OperationId> = self
            .inner
            .pending_ops
            .iter()
            .map(|entry| *entry.key())
            .collect();

        let mut abandoned = 0;
        for id in ids {
            if let Some((_, pending)) = self.inner.pending_ops.remove(&id) {
                if let Some(abort) = pending.abort {
                    abort.abort();
                }
                debug!("Abandoned {} operation {}", pending.kind, id);
                abandoned += 1;
            }
        }
        abandoned
    }

    fn clear_local_state(&self) {
        self.inner.purchases.clear();
        self.inner.pending_flows.clear();
    }

    async fn disconnect_quietly(&self) {
        if let Err(err) = self.inner.service.disconnect().await {
            warn!("Failed to disconnect from billing service: {}", err);
        }
    }

    async fn fetch_owned(&self) -> Result<Vec<PurchaseRecord>> {
        let owned = self
            .with_timeout(self.inner.service.query_owned())
            .await
            .map_err(|err| match err {
                BillingError::ServiceError { .. } => err,
                other => BillingError::service(codes::FAILED_LOAD_PURCHASES, other.to_string()),
            })?;
        Ok(owned
            .into_iter()
            .filter(|record| !record.is_consumed)
            .collect())
    }

    /// Adds or updates owned records. Each returned record is paired with
    /// whether it was absent (or consumed) before the merge.
    fn merge_owned(&self, owned: Vec<PurchaseRecord>) -> Vec<(PurchaseRecord, bool)> {
        owned
            .into_iter()
            .map(|record| {
                let previous = self
                    .inner
                    .purchases
                    .insert((record.kind(), record.product_id.clone()), record.clone());
                let newly_present = previous.is_none_or(|previous| previous.is_consumed);
                (record, newly_present)
            })
            .collect()
    }

    fn emit(&self, event: BillingEvent) {
        if self.inner.events.send(event).is_err() {
            debug!("No observers subscribed, event dropped");
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            SessionState::Ready => Ok(()),
            state => Err(BillingError::InvalidState(state)),
        }
    }

    /// Moves to `next` if allowed, returning the state that was left.
    fn transition(&self, next: SessionState) -> Result<SessionState> {
        let mut previous = None;
        self.inner.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                previous = Some(*state);
                *state = next;
                true
            } else {
                false
            }
        });
        previous.ok_or_else(|| BillingError::InvalidState(self.state()))
    }

    async fn with_timeout<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        let Some(limit) = self.inner.config.operation_timeout else {
            return call.await;
        };
        tokio::time::timeout(limit, call).await.map_err(|_| {
            BillingError::service(
                codes::SERVICE_TIMEOUT,
                format!("billing service did not respond within {:?}", limit),
            )
        })?
    }
}

impl fmt::Debug for BillingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BillingSession")
            .field("state", &self.state())
            .field("purchases", &self.inner.purchases.len())
            .field("pending_flows", &self.inner.pending_flows.len())
            .field("pending_operations", &self.inner.pending_ops.len())
            .finish()
    }
}
