use crate::domain::flow::{PendingPurchaseFlow, RequestToken};
use crate::domain::ports::PendingFlowStore;
use crate::error::{BillingError, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options};
use std::path::Path;
use std::sync::Arc;

/// Column Family holding purchase flows that have not been resolved yet.
pub const CF_PENDING_FLOWS: &str = "pending_flows";

/// A persistent flow store backed by RocksDB.
///
/// Flows are keyed by request token and stored as JSON, so a session created
/// by a later process can pick up flows an earlier one launched.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBPendingFlowStore {
    db: Arc<DB>,
}

impl RocksDBPendingFlowStore {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// Ensures that the "pending_flows" column family exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_flows = ColumnFamilyDescriptor::new(CF_PENDING_FLOWS, Options::default());
        let db = DB::open_cf_descriptors(&opts, path, vec![cf_flows])?;

        Ok(Self { db: Arc::new(db) })
    }

    fn flows_cf(&self) -> Result<&ColumnFamily> {
        self.db.cf_handle(CF_PENDING_FLOWS).ok_or_else(|| {
            BillingError::InternalError(Box::new(std::io::Error::other(
                "Pending flows column family not found",
            )))
        })
    }
}

#[async_trait]
impl PendingFlowStore for RocksDBPendingFlowStore {
    async fn store(&self, flow: PendingPurchaseFlow) -> Result<()> {
        let cf = self.flows_cf()?;
        let value = serde_json::to_vec(&flow)?;
        self.db.put_cf(cf, flow.request_token.as_str(), value)?;
        Ok(())
    }

    async fn take(&self, token: &RequestToken) -> Result<Option<PendingPurchaseFlow>> {
        let cf = self.flows_cf()?;
        let Some(bytes) = self.db.get_cf(cf, token.as_str())? else {
            return Ok(None);
        };
        self.db.delete_cf(cf, token.as_str())?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn get_all(&self) -> Result<Vec<PendingPurchaseFlow>> {
        let cf = self.flows_cf()?;

        let mut flows = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_key, value) = item?;
            flows.push(serde_json::from_slice(&value)?);
        }
        Ok(flows)
    }
}
