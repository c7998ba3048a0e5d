#![allow(dead_code)]

use billing_session::application::config::SessionConfig;
use billing_session::application::session::BillingSession;
use billing_session::domain::credentials::Credentials;
use billing_session::domain::event::BillingEvent;
use billing_session::domain::product::ListingDetails;
use billing_session::infrastructure::in_memory::{InMemoryBillingService, InMemoryPendingFlowStore};
use rust_decimal::Decimal;
use std::fs::File;
use std::io::{Error, Write};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;

pub fn session(service: &InMemoryBillingService) -> BillingSession {
    session_with(service, InMemoryPendingFlowStore::new(), SessionConfig::default())
}

pub fn session_with(
    service: &InMemoryBillingService,
    flow_store: InMemoryPendingFlowStore,
    config: SessionConfig,
) -> BillingSession {
    BillingSession::new(Arc::new(service.clone()), Box::new(flow_store), config)
}

/// A session that has already fired `Ready`, with an event receiver
/// subscribed before initialization.
pub async fn ready_session(
    service: &InMemoryBillingService,
) -> (BillingSession, broadcast::Receiver<BillingEvent>) {
    let session = session(service);
    let mut events = session.events();
    session.initialize(Credentials::default()).await.unwrap();
    assert_eq!(drain(&mut events), vec![BillingEvent::Ready]);
    (session, events)
}

/// Collects every event already delivered to `events`.
pub fn drain(events: &mut broadcast::Receiver<BillingEvent>) -> Vec<BillingEvent> {
    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    received
}

pub fn listing(id: &str, price: Decimal, is_subscription: bool) -> ListingDetails {
    ListingDetails {
        product_id: id.into(),
        title: format!("{} title", id),
        description: format!("{} description", id),
        price,
        currency: "USD".to_string(),
        is_subscription,
    }
}

pub fn write_script(path: &Path, rows: &[&str]) -> Result<(), Error> {
    let mut file = File::create(path)?;
    writeln!(file, "action, product")?;
    for row in rows {
        writeln!(file, "{}", row)?;
    }
    Ok(())
}
