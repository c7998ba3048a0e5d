mod common;

use async_trait::async_trait;
use billing_session::application::config::SessionConfig;
use billing_session::application::session::BillingSession;
use billing_session::domain::credentials::Credentials;
use billing_session::domain::event::BillingEvent;
use billing_session::domain::flow::{FlowOutcome, PendingPurchaseFlow, RequestToken};
use billing_session::domain::ports::PendingFlowStore;
use billing_session::domain::product::{ProductId, ProductKind, PurchaseRecord};
use billing_session::domain::state::SessionState;
use billing_session::error::{BillingError, codes};
use billing_session::infrastructure::in_memory::{InMemoryBillingService, InMemoryPendingFlowStore};
use std::sync::Arc;

#[tokio::test]
async fn test_purchase_flow_resolves_into_cache() {
    let service = InMemoryBillingService::new();
    let (session, mut events) = common::ready_session(&service).await;
    let sku: ProductId = "sku1".into();
    assert!(!session.is_purchased(&sku));

    let token = session.purchase(&sku).await.unwrap();
    let launched = service.launched_flows().await;
    assert_eq!(launched.len(), 1);
    assert_eq!(launched[0].request_token, token);
    assert_eq!(launched[0].kind, ProductKind::Managed);
    assert_eq!(session.pending_purchase_flows().len(), 1);

    let record = PurchaseRecord::new("sku1", "t1");
    let recognized = session
        .resolve_purchase_flow(&token, FlowOutcome::Success(record.clone()))
        .await
        .unwrap();

    assert!(recognized);
    assert!(session.is_purchased(&sku));
    assert!(!session.is_subscribed(&sku));
    assert!(session.pending_purchase_flows().is_empty());
    assert_eq!(
        common::drain(&mut events),
        vec![BillingEvent::Purchased {
            product_id: sku,
            record,
        }]
    );
}

#[tokio::test]
async fn test_resolving_twice_is_a_no_op() {
    let service = InMemoryBillingService::new();
    let (session, mut events) = common::ready_session(&service).await;
    let token = session.purchase(&"sku1".into()).await.unwrap();
    let outcome = FlowOutcome::Success(PurchaseRecord::new("sku1", "t1"));

    assert!(session.resolve_purchase_flow(&token, outcome.clone()).await.unwrap());
    assert!(!session.resolve_purchase_flow(&token, outcome).await.unwrap());

    assert_eq!(common::drain(&mut events).len(), 1);
}

#[tokio::test]
async fn test_unknown_token_is_not_recognized() {
    let service = InMemoryBillingService::new();
    let (session, mut events) = common::ready_session(&service).await;

    let recognized = session
        .resolve_purchase_flow(&RequestToken::from("nope"), FlowOutcome::Cancelled)
        .await
        .unwrap();

    assert!(!recognized);
    assert!(common::drain(&mut events).is_empty());
}

#[tokio::test]
async fn test_cancelled_flow_is_silent() {
    let service = InMemoryBillingService::new();
    let (session, mut events) = common::ready_session(&service).await;
    let token = session.purchase(&"sku1".into()).await.unwrap();

    let recognized = session
        .resolve_purchase_flow(&token, FlowOutcome::Cancelled)
        .await
        .unwrap();

    assert!(recognized);
    assert!(common::drain(&mut events).is_empty());
    assert!(!session.is_purchased(&"sku1".into()));
    assert!(session.pending_purchase_flows().is_empty());
}

#[tokio::test]
async fn test_failed_flow_fires_billing_error() {
    let service = InMemoryBillingService::new();
    let (session, mut events) = common::ready_session(&service).await;
    let token = session.purchase(&"sku1".into()).await.unwrap();

    let outcome = FlowOutcome::Error {
        code: codes::ITEM_UNAVAILABLE,
        cause: "item unavailable".to_string(),
    };
    assert!(session.resolve_purchase_flow(&token, outcome).await.unwrap());

    assert_eq!(
        common::drain(&mut events),
        vec![BillingEvent::BillingError {
            code: codes::ITEM_UNAVAILABLE,
            cause: "item unavailable".to_string(),
        }]
    );
    assert!(!session.is_purchased(&"sku1".into()));
}

#[tokio::test]
async fn test_mismatched_product_is_rejected() {
    let service = InMemoryBillingService::new();
    let (session, mut events) = common::ready_session(&service).await;
    let token = session.purchase(&"sku1".into()).await.unwrap();

    let outcome = FlowOutcome::Success(PurchaseRecord::new("sku9", "t9"));
    assert!(session.resolve_purchase_flow(&token, outcome).await.unwrap());

    assert!(matches!(
        common::drain(&mut events).as_slice(),
        [BillingEvent::BillingError { code: codes::ERROR, .. }]
    ));
    assert!(!session.is_purchased(&"sku1".into()));
    assert!(!session.is_purchased(&"sku9".into()));
}

#[tokio::test]
async fn test_merchant_id_guards_purchases() {
    let service = InMemoryBillingService::new();
    let session = common::session(&service);
    let mut events = session.events();
    let credentials = Credentials::new(Some("license".to_string()), Some("GPA".to_string()));
    session.initialize(credentials).await.unwrap();
    common::drain(&mut events);

    let accepted = session.purchase(&"sku1".into()).await.unwrap();
    let record = PurchaseRecord::new("sku1", "t1").with_order_id("GPA.1111-2222");
    session
        .resolve_purchase_flow(&accepted, FlowOutcome::Success(record))
        .await
        .unwrap();

    let rejected = session.purchase(&"sku2".into()).await.unwrap();
    let record = PurchaseRecord::new("sku2", "t2").with_order_id("ACME.3333");
    session
        .resolve_purchase_flow(&rejected, FlowOutcome::Success(record))
        .await
        .unwrap();

    let events = common::drain(&mut events);
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], BillingEvent::Purchased { product_id, .. } if product_id.as_str() == "sku1"));
    assert!(matches!(
        &events[1],
        BillingEvent::BillingError { code: codes::INVALID_MERCHANT_ID, .. }
    ));
    assert!(session.is_purchased(&"sku1".into()));
    assert!(!session.is_purchased(&"sku2".into()));
}

#[tokio::test]
async fn test_subscription_flag_comes_from_the_flow() {
    let service = InMemoryBillingService::new();
    let (session, _events) = common::ready_session(&service).await;
    let subs: ProductId = "subs1".into();

    let token = session.subscribe(&subs).await.unwrap();
    assert_eq!(service.launched_flows().await[0].kind, ProductKind::Subscription);

    let outcome = FlowOutcome::Success(PurchaseRecord::new("subs1", "t1"));
    session.resolve_purchase_flow(&token, outcome).await.unwrap();

    assert!(session.is_subscribed(&subs));
    assert!(!session.is_purchased(&subs));
    assert!(session.list_owned_subscriptions().contains(&subs));
}

#[tokio::test]
async fn test_launch_failure_drops_pending_flow() {
    let service = InMemoryBillingService::new();
    let flow_store = InMemoryPendingFlowStore::new();
    let session = common::session_with(&service, flow_store.clone(), SessionConfig::default());
    let mut events = session.events();
    session.initialize(Credentials::default()).await.unwrap();
    common::drain(&mut events);
    service.fail_launches(Some("store closed".to_string())).await;

    let result = session.purchase(&"sku1".into()).await;

    assert!(matches!(result, Err(BillingError::ServiceError { .. })));
    assert!(session.pending_purchase_flows().is_empty());
    assert!(flow_store.get_all().await.unwrap().is_empty());
    assert!(matches!(
        common::drain(&mut events).as_slice(),
        [BillingEvent::BillingError { code: codes::FAILED_TO_INITIALIZE_PURCHASE, .. }]
    ));
}

#[tokio::test]
async fn test_flow_survives_session_recreation() {
    let service = InMemoryBillingService::new();
    let flow_store = InMemoryPendingFlowStore::new();
    let sku: ProductId = "sku1".into();

    // The first session launches the flow, then the host process goes away.
    let first = common::session_with(&service, flow_store.clone(), SessionConfig::default());
    first.initialize(Credentials::default()).await.unwrap();
    let token = first.purchase(&sku).await.unwrap();
    first.release().await;
    assert_eq!(flow_store.get_all().await.unwrap().len(), 1);

    // The flow completes while no session is alive.
    let record = service.fulfil_flow(&token).await.unwrap();
    assert!(
        !first
            .resolve_purchase_flow(&token, FlowOutcome::Success(record.clone()))
            .await
            .unwrap()
    );

    let second = common::session_with(&service, flow_store.clone(), SessionConfig::default());
    let mut events = second.events();
    second.initialize(Credentials::default()).await.unwrap();
    assert_eq!(second.state(), SessionState::Ready);
    assert!(second.is_purchased(&sku));
    assert_eq!(second.pending_purchase_flows().len(), 1);

    // The platform replays the result to the new instance.
    let recognized = second
        .resolve_purchase_flow(&token, FlowOutcome::Success(record.clone()))
        .await
        .unwrap();

    assert!(recognized);
    assert!(second.is_purchased(&sku));
    assert!(flow_store.get_all().await.unwrap().is_empty());
    assert_eq!(
        common::drain(&mut events),
        vec![
            BillingEvent::Ready,
            BillingEvent::Purchased {
                product_id: sku,
                record,
            }
        ]
    );
}

/// Flow store whose removals always fail.
struct StuckFlowStore {
    inner: InMemoryPendingFlowStore,
}

#[async_trait]
impl PendingFlowStore for StuckFlowStore {
    async fn store(&self, flow: PendingPurchaseFlow) -> billing_session::error::Result<()> {
        self.inner.store(flow).await
    }

    async fn take(
        &self,
        _token: &RequestToken,
    ) -> billing_session::error::Result<Option<PendingPurchaseFlow>> {
        Err(BillingError::IoError(std::io::Error::other("disk busy")))
    }

    async fn get_all(&self) -> billing_session::error::Result<Vec<PendingPurchaseFlow>> {
        self.inner.get_all().await
    }
}

#[tokio::test]
async fn test_flow_store_failure_does_not_lose_purchase() {
    let service = InMemoryBillingService::new();
    let store = StuckFlowStore {
        inner: InMemoryPendingFlowStore::new(),
    };
    let session = BillingSession::new(
        Arc::new(service.clone()),
        Box::new(store),
        SessionConfig::default(),
    );
    let mut events = session.events();
    session.initialize(Credentials::default()).await.unwrap();
    assert_eq!(common::drain(&mut events), vec![BillingEvent::Ready]);

    let sku: ProductId = "sku1".into();
    let token = session.purchase(&sku).await.unwrap();
    let record = service.fulfil_flow(&token).await.unwrap();

    let first = session
        .resolve_purchase_flow(&token, FlowOutcome::Success(record.clone()))
        .await;
    let replay = session
        .resolve_purchase_flow(&token, FlowOutcome::Success(record.clone()))
        .await;

    assert!(matches!(first, Ok(true)));
    assert!(matches!(replay, Ok(false)));
    assert!(session.is_purchased(&sku));
    assert_eq!(
        common::drain(&mut events),
        vec![BillingEvent::Purchased {
            product_id: sku,
            record,
        }]
    );
}

#[tokio::test]
async fn test_managed_product_and_subscription_may_share_an_id() {
    let service = InMemoryBillingService::seeded(
        vec![],
        vec![PurchaseRecord::subscription("gold", "t-subs")],
    );
    let (session, _events) = common::ready_session(&service).await;
    let gold: ProductId = "gold".into();
    assert!(session.is_subscribed(&gold));

    let token = session.purchase(&gold).await.unwrap();
    let record = service.fulfil_flow(&token).await.unwrap();
    session
        .resolve_purchase_flow(&token, FlowOutcome::Success(record))
        .await
        .unwrap();

    assert!(session.is_purchased(&gold));
    assert!(session.is_subscribed(&gold));
    assert_eq!(session.purchase_records().len(), 2);

    session.consume(&gold).await.unwrap();
    assert!(!session.is_purchased(&gold));
    assert!(session.is_subscribed(&gold));
}
