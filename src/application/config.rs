use clap::ValueEnum;
use std::time::Duration;

/// Which products a restore announces through `Purchased` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum RestoreNotify {
    /// Only products that were not owned before the restore.
    #[default]
    #[value(name = "new")]
    NewlyPresent,
    /// Every owned product, on every restore.
    Always,
    Never,
}

/// Tunables for a `BillingSession`.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upper bound for any single Billing Service call. `None` waits forever.
    pub operation_timeout: Option<Duration>,
    /// Buffer size of the event channel. Slow observers lag past this.
    pub event_capacity: usize,
    pub restore_notify: RestoreNotify,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Some(Duration::from_secs(30)),
            event_capacity: 64,
            restore_notify: RestoreNotify::default(),
        }
    }
}

impl SessionConfig {
    pub fn with_operation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_restore_notify(mut self, restore_notify: RestoreNotify) -> Self {
        self.restore_notify = restore_notify;
        self
    }
}
