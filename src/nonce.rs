//! Per-account nonce allocation shared by every submitter.
//!
//! The lock lives in the coordination store rather than in an OS primitive, so
//! a worker that dies while holding it only blocks others until the lease runs
//! out. Each lease carries a random token; a holder that outlived its lease
//! can no longer write the record or unlock it for whoever took over.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::address::Address;
use crate::chain::{ChainClient, ContractCall, TxRequest};
use crate::config::StoreSettings;
use crate::error::{ActionError, StoreError};
use crate::store::{CoordinationStore, NonceRecord};

pub struct NonceCoordinator {
    client: Arc<dyn ChainClient>,
    store: Arc<dyn CoordinationStore>,
    lease_ms: i64,
    backoff_initial: Duration,
    backoff_max: Duration,
    max_retries: u32,
}

impl NonceCoordinator {
    pub fn new(
        client: Arc<dyn ChainClient>,
        store: Arc<dyn CoordinationStore>,
        settings: &StoreSettings,
    ) -> Self {
        NonceCoordinator {
            client,
            store,
            lease_ms: settings.lock_lease_ms,
            backoff_initial: Duration::from_millis(settings.backoff_initial_ms.max(1)),
            backoff_max: Duration::from_millis(settings.backoff_max_ms.max(1)),
            max_retries: settings.max_nonce_retries,
        }
    }

    pub fn store(&self) -> &dyn CoordinationStore {
        self.store.as_ref()
    }

    /// Block until the account's record is ours, then work out the next nonce.
    ///
    /// When the chain has moved since the record was last synchronised, the
    /// node's pending count is folded in so transactions sent outside this
    /// coordinator are not reused. Within one block the stored counter alone
    /// is authoritative: the node may not have seen our in-flight sends yet.
    pub fn acquire(&self, account: Address) -> Result<NonceLease<'_>, ActionError> {
        let token = rand::random::<u64>();
        let mut delay = self.backoff_initial;
        let record = loop {
            let now_ms = chrono::Utc::now().timestamp_millis();
            if let Some(record) = self.store.try_lock_nonce(account, token, now_ms, self.lease_ms)? {
                break record;
            }
            trace!(%account, delay_ms = delay.as_millis() as u64, "nonce locked, backing off");
            thread::sleep(delay);
            delay = (delay * 2).min(self.backoff_max);
        };

        let nonce = match self.sync(account, token, &record) {
            Ok(n) => n,
            Err(e) => {
                self.release(account, token, None)?;
                return Err(e);
            }
        };
        trace!(%account, nonce, "nonce acquired");
        Ok(NonceLease {
            coordinator: self,
            account,
            token,
            nonce,
            used_through: None,
            open: true,
        })
    }

    fn sync(&self, account: Address, token: u64, record: &NonceRecord) -> Result<u64, ActionError> {
        let block = self.client.block_number()?;
        if record.last_seen_block == Some(block) {
            return Ok(record.next_nonce);
        }
        let pending = self.client.transaction_count(account)?;
        let next = record.next_nonce.max(pending);
        if !self.store.write_nonce(account, token, next, Some(block))? {
            return Err(ActionError::Precondition(format!(
                "nonce lease for {} was taken over during sync",
                account
            )));
        }
        Ok(next)
    }

    /// Unlock the account if the lease under `token` still holds it.
    /// `consumed` is the highest nonce known to be used.
    pub fn release(&self, account: Address, token: u64, consumed: Option<u64>) -> Result<(), StoreError> {
        if !self.store.unlock_nonce(account, token, consumed.map(|n| n + 1))? {
            warn!(%account, "nonce lease was taken over, leaving the lock to its new holder");
        }
        Ok(())
    }

    /// Acquire, send and release. Nonce conflicts reported by the node are
    /// retried under the same lease with the next nonce.
    pub fn submit(
        &self,
        from: Address,
        to: Address,
        gas: u64,
        call: ContractCall,
    ) -> Result<String, ActionError> {
        let mut lease = self.acquire(from)?;
        let mut tx = TxRequest {
            from,
            to,
            nonce: lease.nonce(),
            gas,
            call,
        };
        let mut retries = 0;
        loop {
            tx.nonce = lease.nonce();
            match self.client.send_transaction(&tx) {
                Ok(hash) => {
                    trace!(%from, nonce = tx.nonce, %hash, "transaction submitted");
                    lease.commit()?;
                    return Ok(hash);
                }
                Err(e) if e.is_nonce_conflict() && retries < self.max_retries => {
                    retries += 1;
                    debug!(%from, nonce = tx.nonce, error = %e, "nonce conflict, resending");
                    lease.bump();
                }
                Err(e) => {
                    lease.release()?;
                    return Err(e.into());
                }
            }
        }
    }
}

/// An account's nonce lock. Dropping it releases the lock without recording
/// the current nonce as used.
pub struct NonceLease<'a> {
    coordinator: &'a NonceCoordinator,
    account: Address,
    token: u64,
    nonce: u64,
    used_through: Option<u64>,
    open: bool,
}

impl<'a> NonceLease<'a> {
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn account(&self) -> Address {
        self.account
    }

    /// The current nonce is taken; move to the next one.
    pub fn bump(&mut self) {
        self.used_through = Some(self.nonce);
        self.nonce += 1;
    }

    /// Record the current nonce as used and unlock.
    pub fn commit(mut self) -> Result<(), StoreError> {
        self.used_through = Some(self.nonce);
        self.close()
    }

    /// Unlock without using the current nonce.
    pub fn release(mut self) -> Result<(), StoreError> {
        self.close()
    }

    fn close(&mut self) -> Result<(), StoreError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.coordinator.release(self.account, self.token, self.used_through)
    }
}

impl Drop for NonceLease<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(account = %self.account, error = %e, "failed to release nonce lock");
        }
    }
}
