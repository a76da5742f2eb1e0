//! Local view of one ERC20 token's balances, kept current by replaying
//! `Transfer` events.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use alloy::primitives::U256;
use tracing::{debug, trace};

use crate::address::{Address, Addressable};
use crate::balance::Balance;
use crate::chain::{ChainContext, ContractCall};
use crate::config::TokenSettings;
use crate::error::{ActionError, ApprovalError, ChainError, StoreError};

/// A tracked balance and the last block already reflected in it.
#[derive(Debug, Clone, Copy)]
struct Tracked {
    balance: Balance,
    as_of: u64,
}

#[derive(Debug)]
struct CacheState {
    balances: HashMap<Address, Tracked>,
    total_supply: Balance,
    /// Last block whose events have been applied
    last_block: u64,
}

pub struct TokenCache {
    ctx: Arc<ChainContext>,
    token: TokenSettings,
    state: Mutex<CacheState>,
    /// Serialises `update` so a batch of events is applied exactly once
    updating: Mutex<()>,
}

impl TokenCache {
    pub fn new(ctx: Arc<ChainContext>, token: TokenSettings) -> Result<Self, ActionError> {
        let client = ctx.client();
        let on_chain = client.decimals(token.address)?;
        if on_chain != token.decimals {
            return Err(ChainError::Decode(format!(
                "{} reports {} decimals, configured {}",
                token.symbol, on_chain, token.decimals
            ))
            .into());
        }
        let last_block = client.block_number()?;
        let total_supply = Balance::new(client.total_supply(token.address)?, token.decimals);
        debug!(token = %token.symbol, %total_supply, last_block, "token cache created");

        Ok(TokenCache {
            ctx,
            token,
            state: Mutex::new(CacheState {
                balances: HashMap::new(),
                total_supply,
                last_block,
            }),
            updating: Mutex::new(()),
        })
    }

    fn state(&self) -> Result<MutexGuard<'_, CacheState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn symbol(&self) -> &str {
        &self.token.symbol
    }

    pub fn decimals(&self) -> u8 {
        self.token.decimals
    }

    pub fn zero(&self) -> Balance {
        Balance::zero(self.token.decimals)
    }

    /// Apply every Transfer since the last update. Returns the number of
    /// events replayed.
    ///
    /// Endpoints that are not tracked yet, and tracked endpoints whose debit
    /// would go negative, are read directly from the chain after the batch.
    pub fn update(&self) -> Result<usize, ActionError> {
        let _updating = self.updating.lock().map_err(|_| StoreError::Poisoned)?;
        let client = self.ctx.client();

        let from_block = self.state()?.last_block + 1;
        let current = client.block_number()?;
        if current < from_block {
            return Ok(0);
        }
        let logs = client.transfer_logs(self.token.address, from_block, current)?;

        let mut stale = BTreeSet::new();
        let mut supply_underflow = false;
        {
            let mut state = self.state()?;
            for log in &logs {
                let value = Balance::new(log.value, self.token.decimals);

                if log.from.is_zero() {
                    state.total_supply.try_add_assign(&value)?;
                } else if !stale.contains(&log.from) {
                    match state.balances.get_mut(&log.from) {
                        Some(held) if log.block <= held.as_of => {}
                        Some(held) if held.balance >= value => held.balance.try_sub_assign(&value)?,
                        _ => {
                            stale.insert(log.from);
                        }
                    }
                }

                if log.to.is_zero() {
                    if state.total_supply.try_sub_assign(&value).is_err() {
                        supply_underflow = true;
                    }
                } else if !stale.contains(&log.to) {
                    match state.balances.get_mut(&log.to) {
                        Some(held) if log.block <= held.as_of => {}
                        Some(held) => held.balance.try_add_assign(&value)?,
                        None => {
                            stale.insert(log.to);
                        }
                    }
                }
            }
            state.last_block = current;
        }

        for who in stale {
            match self.read_direct(who) {
                Ok(fresh) => {
                    self.state()?.balances.insert(who, fresh);
                }
                Err(e) => {
                    // Untracked again; the next `get` reads it directly
                    self.state()?.balances.remove(&who);
                    return Err(e);
                }
            }
        }
        if supply_underflow {
            let raw = client.total_supply(self.token.address)?;
            self.state()?.total_supply = Balance::new(raw, self.token.decimals);
        }

        if !logs.is_empty() {
            debug!(token = %self.token.symbol, events = logs.len(), block = current, "token cache updated");
        }
        Ok(logs.len())
    }

    /// Cached balance, or a direct read that starts tracking `who`.
    pub fn get(&self, who: impl Addressable) -> Result<Balance, ActionError> {
        let who = who.address();
        if let Some(held) = self.state()?.balances.get(&who) {
            return Ok(held.balance);
        }
        let fresh = self.read_direct(who)?;
        let mut state = self.state()?;
        Ok(state.balances.entry(who).or_insert(fresh).balance)
    }

    /// The balance is read pinned to `as_of`, so events after that block are
    /// replayed exactly once by the next `update`.
    fn read_direct(&self, who: Address) -> Result<Tracked, ActionError> {
        let client = self.ctx.client();
        let as_of = client.block_number()?;
        let raw = client.balance_of_at(self.token.address, who, as_of)?;
        trace!(token = %self.token.symbol, %who, %raw, as_of, "direct balance read");
        Ok(Tracked {
            balance: Balance::new(raw, self.token.decimals),
            as_of,
        })
    }

    pub fn total_supply(&self) -> Result<Balance, ActionError> {
        Ok(self.state()?.total_supply)
    }

    pub fn tracked(&self) -> Result<Vec<Address>, ActionError> {
        let mut addrs: Vec<Address> = self.state()?.balances.keys().copied().collect();
        addrs.sort();
        Ok(addrs)
    }

    /// Grant `spender` an unlimited allowance over `owner`'s tokens once.
    /// Returns whether a transaction was sent.
    pub fn ensure_approved(
        &self,
        owner: impl Addressable,
        spender: impl Addressable,
    ) -> Result<bool, ApprovalError> {
        let (owner, spender) = (owner.address(), spender.address());
        let token = self.token.address;
        let ledger = self.ctx.store();
        if ledger.is_approved(token, owner, spender)? {
            return Ok(false);
        }

        let call = ContractCall::Approve {
            spender,
            amount: U256::MAX,
        };
        match self.ctx.transact(owner, token, call) {
            Ok(receipt) => {
                ledger.record_approval(token, owner, spender)?;
                debug!(token = %self.token.symbol, %owner, %spender, tx = %receipt.tx, "approved");
                Ok(true)
            }
            Err(ActionError::Reverted { tx }) => Err(ApprovalError::Reverted {
                token,
                owner,
                spender,
                tx,
            }),
            Err(e) => Err(ApprovalError::Submit(Box::new(e))),
        }
    }
}

impl Addressable for TokenCache {
    fn address(&self) -> Address {
        self.token.address
    }
}
