use std::collections::HashSet;

use tracing::{debug, info, warn};
use txsync_core::{Category, Receipt, ResourceKey, TxHash};

use crate::remote::RemoteError;
use crate::{EngineError, SyncEngine};

impl SyncEngine {
    /// Return the receipt of `hash`, fetching the transaction and receipt when missing.
    ///
    /// A transaction first seen here also pulls its internal transactions and token
    /// transfers at that exact timestamp.
    pub async fn get_or_fetch_receipt(&self, hash: &TxHash) -> Result<Receipt, EngineError> {
        let _guard = self.receipt_lock.lock().await;

        if !self.store().has_transaction(hash)? {
            let tx = self.remote.fetch_by_hash(hash).await?;
            self.store()
                .put_transactions(std::slice::from_ref(&tx), None)?;
            debug!(%hash, timestamp = tx.timestamp, "transaction fetched for receipt");

            for category in [Category::InternalTx, Category::TokenTx] {
                let key = ResourceKey::new(category, tx.from_address);
                let report = self.sync_category(&key, tx.timestamp, tx.timestamp).await?;
                if let Some(failure) = report.failure {
                    debug!(%key, error = %failure.error, "dependent lookup incomplete");
                }
            }
        }

        if let Some(receipt) = self.store().get_receipt(hash)? {
            return Ok(receipt);
        }

        let receipt = self.remote.fetch_receipt(hash).await?;
        self.store().put_receipt(&receipt)?;
        Ok(receipt)
    }

    /// Store receipts for up to `limit` transactions lacking one, oldest first.
    ///
    /// Hashes the remote does not know are skipped and the pass looks further ahead in
    /// their place. Any other remote failure ends the pass and is reported to the message
    /// sink. Returns the number of receipts stored.
    pub async fn backfill_missing_receipts(&self, limit: usize) -> Result<usize, EngineError> {
        let _guard = self.receipt_lock.lock().await;

        let mut skipped: HashSet<TxHash> = HashSet::new();
        let mut stored = 0;
        'pass: while stored < limit {
            // Skipped hashes stay missing, so widen the window past them.
            let pending: Vec<TxHash> = self
                .store()
                .hashes_missing_receipt(limit - stored + skipped.len())?
                .into_iter()
                .filter(|hash| !skipped.contains(hash))
                .collect();
            if pending.is_empty() {
                break;
            }

            for hash in pending {
                match self.remote.fetch_receipt(&hash).await {
                    Ok(receipt) => {
                        self.store().put_receipt(&receipt)?;
                        stored += 1;
                        if stored >= limit {
                            break 'pass;
                        }
                    }
                    Err(RemoteError::NotFound(_)) => {
                        debug!(%hash, "receipt not yet available");
                        skipped.insert(hash);
                    }
                    Err(error) => {
                        warn!(%hash, %error, "receipt backfill interrupted");
                        self.sink.add_warning(format!(
                            "Receipt backfill stopped after {stored} of {limit} receipts: {error}"
                        ));
                        break 'pass;
                    }
                }
            }
        }

        info!(stored, skipped = skipped.len(), "receipt backfill finished");
        Ok(stored)
    }
}
