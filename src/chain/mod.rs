//! The RPC boundary and the context object every component shares.

pub mod contracts;
pub mod mock;
pub mod rpc;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use alloy::primitives::{Address, U256};
use tracing::debug;

use crate::config::{ChainSettings, StoreSettings};
use crate::error::{ActionError, ChainError};
use crate::nonce::NonceCoordinator;
use crate::store::CoordinationStore;

/// A decoded ERC20 `Transfer` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferLog {
    pub block: u64,
    pub log_index: u64,
    pub from: Address,
    pub to: Address,
    pub value: U256,
}

/// The part of a transaction receipt the simulation cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx: String,
    pub block: u64,
    pub status: bool,
}

/// Every state-changing contract call the simulation makes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractCall {
    Approve {
        spender: Address,
        amount: U256,
    },
    /// Testnet USDC faucet mint
    Mint {
        to: Address,
        amount: U256,
    },
    SwapExactTokensForTokens {
        amount_in: U256,
        amount_out_min: U256,
        path: Vec<Address>,
        to: Address,
        deadline: U256,
    },
    AddLiquidity {
        token_a: Address,
        token_b: Address,
        amount_a_desired: U256,
        amount_b_desired: U256,
        amount_a_min: U256,
        amount_b_min: U256,
        to: Address,
        deadline: U256,
    },
    RemoveLiquidity {
        token_a: Address,
        token_b: Address,
        liquidity: U256,
        amount_a_min: U256,
        amount_b_min: U256,
        to: Address,
        deadline: U256,
    },
    Advance,
    PlaceCouponAuctionBid {
        coupon_epoch_expiry: u64,
        dollar_amount: U256,
        max_coupon_amount: U256,
    },
    RedeemCoupons {
        coupon_epoch: u64,
        amount: U256,
    },
    Deposit {
        amount: U256,
    },
    Bond {
        amount: U256,
    },
    Unbond {
        shares: U256,
    },
}

impl ContractCall {
    pub fn name(&self) -> &'static str {
        match self {
            ContractCall::Approve { .. } => "approve",
            ContractCall::Mint { .. } => "mint",
            ContractCall::SwapExactTokensForTokens { .. } => "swapExactTokensForTokens",
            ContractCall::AddLiquidity { .. } => "addLiquidity",
            ContractCall::RemoveLiquidity { .. } => "removeLiquidity",
            ContractCall::Advance => "advance",
            ContractCall::PlaceCouponAuctionBid { .. } => "placeCouponAuctionBid",
            ContractCall::RedeemCoupons { .. } => "redeemCoupons",
            ContractCall::Deposit { .. } => "deposit",
            ContractCall::Bond { .. } => "bond",
            ContractCall::Unbond { .. } => "unbond",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    pub from: Address,
    pub to: Address,
    pub nonce: u64,
    pub gas: u64,
    pub call: ContractCall,
}

/// Read and write access to the test network. Contract internals are opaque;
/// only the calls below cross the boundary.
pub trait ChainClient: Send + Sync {
    fn block_number(&self) -> Result<u64, ChainError>;
    /// Pending transaction count, i.e. the node's idea of the next nonce.
    fn transaction_count(&self, account: Address) -> Result<u64, ChainError>;
    fn accounts(&self) -> Result<Vec<Address>, ChainError>;

    fn balance_of(&self, token: Address, owner: Address) -> Result<U256, ChainError>;
    /// `owner`'s balance as of the end of `block`.
    fn balance_of_at(&self, token: Address, owner: Address, block: u64) -> Result<U256, ChainError>;
    fn total_supply(&self, token: Address) -> Result<U256, ChainError>;
    fn decimals(&self, token: Address) -> Result<u8, ChainError>;
    /// Transfer events of `token` in the inclusive block range, in chain order.
    fn transfer_logs(
        &self,
        token: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferLog>, ChainError>;

    fn get_reserves(&self, pair: Address) -> Result<(U256, U256), ChainError>;
    fn token0(&self, pair: Address) -> Result<Address, ChainError>;
    fn get_amounts_out(
        &self,
        router: Address,
        amount_in: U256,
        path: &[Address],
    ) -> Result<Vec<U256>, ChainError>;

    fn epoch(&self, dao: Address) -> Result<u64, ChainError>;
    fn total_coupons(&self, dao: Address) -> Result<U256, ChainError>;
    fn total_redeemable(&self, dao: Address) -> Result<U256, ChainError>;
    fn balance_of_coupons(
        &self,
        dao: Address,
        account: Address,
        epoch: u64,
    ) -> Result<U256, ChainError>;
    fn coupons_current_assigned_index(
        &self,
        dao: Address,
        account: Address,
    ) -> Result<u64, ChainError>;
    fn coupons_assigned_at_epoch(
        &self,
        dao: Address,
        account: Address,
        index: u64,
    ) -> Result<u64, ChainError>;
    fn balance_of_staged(&self, dao: Address, account: Address) -> Result<U256, ChainError>;

    /// Submit a transaction from an unlocked account; returns the tx hash.
    fn send_transaction(&self, tx: &TxRequest) -> Result<String, ChainError>;
    fn transaction_receipt(&self, tx: &str) -> Result<Option<Receipt>, ChainError>;
}

/// Created once at process start and handed to every component.
pub struct ChainContext {
    client: Arc<dyn ChainClient>,
    nonces: NonceCoordinator,
    settings: ChainSettings,
}

impl ChainContext {
    pub fn new(
        client: Arc<dyn ChainClient>,
        store: Arc<dyn CoordinationStore>,
        chain: ChainSettings,
        store_settings: &StoreSettings,
    ) -> Self {
        let nonces = NonceCoordinator::new(client.clone(), store, store_settings);
        ChainContext {
            client,
            nonces,
            settings: chain,
        }
    }

    pub fn client(&self) -> &dyn ChainClient {
        self.client.as_ref()
    }

    pub fn nonces(&self) -> &NonceCoordinator {
        &self.nonces
    }

    pub fn settings(&self) -> &ChainSettings {
        &self.settings
    }

    pub fn store(&self) -> &dyn CoordinationStore {
        self.nonces.store()
    }

    /// Router deadline a comfortable distance past wall-clock now.
    pub fn deadline(&self) -> U256 {
        let at = chrono::Utc::now().timestamp() + self.settings.deadline_secs;
        U256::from(at.max(0) as u64)
    }

    /// Submit through the nonce coordinator and wait for a confirmed receipt.
    /// A reverted or missing receipt is an `ActionError`.
    pub fn transact(
        &self,
        from: Address,
        to: Address,
        call: ContractCall,
    ) -> Result<Receipt, ActionError> {
        let name = call.name();
        let tx = self.nonces.submit(from, to, self.settings.tx_gas, call)?;
        let receipt = self.wait_for_receipt(&tx)?;
        if !receipt.status {
            debug!(%from, call = name, %tx, "transaction reverted");
            return Err(ActionError::Reverted { tx });
        }
        debug!(%from, call = name, %tx, block = receipt.block, "transaction confirmed");
        Ok(receipt)
    }

    /// Bounded polling for a receipt.
    pub fn wait_for_receipt(&self, tx: &str) -> Result<Receipt, ActionError> {
        let started = Instant::now();
        let timeout = Duration::from_millis(self.settings.receipt_timeout_ms);
        let poll = Duration::from_millis(self.settings.receipt_poll_ms.max(1));
        loop {
            if let Some(receipt) = self.client.transaction_receipt(tx)? {
                return Ok(receipt);
            }
            if started.elapsed() >= timeout {
                return Err(ActionError::ReceiptTimeout {
                    tx: tx.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            thread::sleep(poll);
        }
    }
}
