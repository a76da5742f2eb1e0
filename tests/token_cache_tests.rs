mod common;

use std::sync::{Arc, Mutex};

use alloy::primitives::{Address, U256};

use common::{harness, wei};
use xsd_sim::address::{low_address, Addressable};
use xsd_sim::balance::Balance;
use xsd_sim::chain::mock::MockChain;
use xsd_sim::chain::{ChainClient, ChainContext, Receipt, TransferLog, TxRequest};
use xsd_sim::config::TokenSettings;
use xsd_sim::error::{ActionError, ApprovalError, ChainError};
use xsd_sim::store::{CoordinationStore, MemoryStore};
use xsd_sim::token_cache::TokenCache;

/// Mines one armed mint in the gap between reading the block height and
/// reading a balance, like a node producing a block mid-lookup.
struct RacingChain {
    inner: Arc<MockChain>,
    armed: Mutex<Option<(Address, Address, U256)>>,
}

impl ChainClient for RacingChain {
    fn block_number(&self) -> Result<u64, ChainError> {
        self.inner.block_number()
    }
    fn transaction_count(&self, account: Address) -> Result<u64, ChainError> {
        self.inner.transaction_count(account)
    }
    fn accounts(&self) -> Result<Vec<Address>, ChainError> {
        self.inner.accounts()
    }
    fn balance_of(&self, token: Address, owner: Address) -> Result<U256, ChainError> {
        self.inner.balance_of(token, owner)
    }
    fn balance_of_at(&self, token: Address, owner: Address, block: u64) -> Result<U256, ChainError> {
        if let Some((t, to, amount)) = self.armed.lock().unwrap().take() {
            self.inner.mint(t, to, amount)?;
        }
        self.inner.balance_of_at(token, owner, block)
    }
    fn total_supply(&self, token: Address) -> Result<U256, ChainError> {
        self.inner.total_supply(token)
    }
    fn decimals(&self, token: Address) -> Result<u8, ChainError> {
        self.inner.decimals(token)
    }
    fn transfer_logs(&self, token: Address, from_block: u64, to_block: u64) -> Result<Vec<TransferLog>, ChainError> {
        self.inner.transfer_logs(token, from_block, to_block)
    }
    fn get_reserves(&self, pair: Address) -> Result<(U256, U256), ChainError> {
        self.inner.get_reserves(pair)
    }
    fn token0(&self, pair: Address) -> Result<Address, ChainError> {
        self.inner.token0(pair)
    }
    fn get_amounts_out(&self, router: Address, amount_in: U256, path: &[Address]) -> Result<Vec<U256>, ChainError> {
        self.inner.get_amounts_out(router, amount_in, path)
    }
    fn epoch(&self, dao: Address) -> Result<u64, ChainError> {
        self.inner.epoch(dao)
    }
    fn total_coupons(&self, dao: Address) -> Result<U256, ChainError> {
        self.inner.total_coupons(dao)
    }
    fn total_redeemable(&self, dao: Address) -> Result<U256, ChainError> {
        self.inner.total_redeemable(dao)
    }
    fn balance_of_coupons(&self, dao: Address, account: Address, epoch: u64) -> Result<U256, ChainError> {
        self.inner.balance_of_coupons(dao, account, epoch)
    }
    fn coupons_current_assigned_index(&self, dao: Address, account: Address) -> Result<u64, ChainError> {
        self.inner.coupons_current_assigned_index(dao, account)
    }
    fn coupons_assigned_at_epoch(&self, dao: Address, account: Address, index: u64) -> Result<u64, ChainError> {
        self.inner.coupons_assigned_at_epoch(dao, account, index)
    }
    fn balance_of_staged(&self, dao: Address, account: Address) -> Result<U256, ChainError> {
        self.inner.balance_of_staged(dao, account)
    }
    fn send_transaction(&self, tx: &TxRequest) -> Result<String, ChainError> {
        self.inner.send_transaction(tx)
    }
    fn transaction_receipt(&self, tx: &str) -> Result<Option<Receipt>, ChainError> {
        self.inner.transaction_receipt(tx)
    }
}

#[test]
fn test_mint_to_untracked_address_is_picked_up() {
    let h = harness(2);
    let xsd = h.xsd_cache();
    let supply_before = xsd.total_supply().unwrap();
    let stranger = low_address(0xdead);

    h.chain.mint(h.xsd_address(), stranger, wei(250)).unwrap();
    let replayed = xsd.update().unwrap();
    assert_eq!(replayed, 1);

    let held = xsd.get(stranger).unwrap();
    assert!(held >= Balance::new(wei(250), 18));
    assert_eq!(
        xsd.total_supply().unwrap(),
        supply_before.try_add(&Balance::new(wei(250), 18)).unwrap()
    );
    assert!(xsd.tracked().unwrap().contains(&stranger));
}

#[test]
fn test_transfers_between_tracked_addresses_conserve_the_sum() {
    let h = harness(2);
    let (a, b) = (h.accounts[0], h.accounts[1]);
    h.fund_xsd(a, 100);
    h.fund_xsd(b, 50);

    let xsd = h.xsd_cache();
    let sum_before = xsd.get(a).unwrap().try_add(&xsd.get(b).unwrap()).unwrap();

    h.chain.transfer(h.xsd_address(), a, b, wei(30)).unwrap();
    h.chain.transfer(h.xsd_address(), b, a, wei(5)).unwrap();
    xsd.update().unwrap();

    let (ha, hb) = (xsd.get(a).unwrap(), xsd.get(b).unwrap());
    assert_eq!(ha, Balance::new(wei(75), 18));
    assert_eq!(hb, Balance::new(wei(75), 18));
    assert_eq!(ha.try_add(&hb).unwrap(), sum_before);
}

#[test]
fn test_direct_read_is_not_double_counted_by_replay() {
    let h = harness(1);
    let a = h.accounts[0];
    let xsd = h.xsd_cache();

    // Mint lands before the first lookup, so the direct read already includes it
    h.chain.mint(h.xsd_address(), a, wei(10)).unwrap();
    assert_eq!(xsd.get(a).unwrap(), Balance::new(wei(10), 18));

    xsd.update().unwrap();
    assert_eq!(xsd.get(a).unwrap(), Balance::new(wei(10), 18));

    h.chain.mint(h.xsd_address(), a, wei(1)).unwrap();
    xsd.update().unwrap();
    assert_eq!(xsd.get(a).unwrap(), Balance::new(wei(11), 18));
}

#[test]
fn test_block_mined_during_direct_read_is_counted_once() {
    let h = harness(1);
    let a = h.accounts[0];
    let racing = Arc::new(RacingChain {
        inner: h.chain.clone(),
        armed: Mutex::new(Some((h.xsd_address(), a, wei(7)))),
    });
    let ctx = Arc::new(ChainContext::new(
        racing,
        Arc::new(MemoryStore::new()),
        h.config.chain.clone(),
        &h.config.store,
    ));
    let xsd = TokenCache::new(ctx, h.config.contracts.xsd.clone()).unwrap();

    assert_eq!(xsd.get(a).unwrap(), Balance::zero(18), "read pinned before the mint");
    xsd.update().unwrap();
    assert_eq!(xsd.get(a).unwrap(), Balance::new(wei(7), 18));
    assert_eq!(h.chain.balance_of(h.xsd_address(), a).unwrap(), wei(7));
}

#[test]
fn test_historical_balance_reads() {
    let h = harness(2);
    let (a, b) = (h.accounts[0], h.accounts[1]);
    let start = h.chain.block_number().unwrap();
    h.fund_xsd(a, 10);
    let funded = h.chain.block_number().unwrap();
    h.chain.transfer(h.xsd_address(), a, b, wei(4)).unwrap();

    assert_eq!(h.chain.balance_of_at(h.xsd_address(), a, start).unwrap(), U256::ZERO);
    assert_eq!(h.chain.balance_of_at(h.xsd_address(), a, funded).unwrap(), wei(10));
    assert_eq!(h.chain.balance_of_at(h.xsd_address(), b, funded).unwrap(), U256::ZERO);
    let now = h.chain.block_number().unwrap();
    assert_eq!(h.chain.balance_of_at(h.xsd_address(), a, now).unwrap(), wei(6));
}

#[test]
fn test_cached_balances_match_chain_after_many_events() {
    let h = harness(3);
    let xsd = h.xsd_cache();
    for a in &h.accounts {
        xsd.get(*a).unwrap();
    }
    for (i, a) in h.accounts.iter().enumerate() {
        h.fund_xsd(*a, 10 * (i as u64 + 1));
    }
    h.chain
        .transfer(h.xsd_address(), h.accounts[2], h.accounts[0], wei(7))
        .unwrap();
    xsd.update().unwrap();

    for a in &h.accounts {
        let direct = h.chain.balance_of(h.xsd_address(), *a).unwrap();
        assert_eq!(xsd.get(*a).unwrap().to_wei(), direct);
    }
    let supply = h.chain.total_supply(h.xsd_address()).unwrap();
    assert_eq!(xsd.total_supply().unwrap().to_wei(), supply);
}

#[test]
fn test_wrong_configured_decimals_are_rejected() {
    let h = harness(1);
    let wrong = TokenSettings {
        decimals: 8,
        ..h.config.contracts.usdc.clone()
    };
    assert!(TokenCache::new(h.ctx.clone(), wrong).is_err());
}

#[test]
fn test_approval_is_sent_once() {
    let h = harness(1);
    let owner = h.accounts[0];
    let router = h.config.contracts.router;
    let usd = h.usd_cache();

    assert!(usd.ensure_approved(owner, router).unwrap());
    assert!(!usd.ensure_approved(owner, router).unwrap());
    assert_eq!(h.chain.count_calls("approve"), 1);
    assert_eq!(h.chain.allowance(usd.address(), owner, router), U256::MAX);

    // A second cache over the same ledger knows it too
    let again = h.usd_cache();
    assert!(!again.ensure_approved(owner, router).unwrap());
    assert_eq!(h.chain.count_calls("approve"), 1);
}

#[test]
fn test_reverted_approval_is_not_recorded() {
    let h = harness(1);
    let owner = h.accounts[0];
    let router = h.config.contracts.router;
    let usd = h.usd_cache();
    h.chain.revert_next("approve", 1);

    let err = usd.ensure_approved(owner, router).unwrap_err();
    match &err {
        ApprovalError::Reverted { token, owner: o, spender, .. } => {
            assert_eq!(*token, h.usd_address());
            assert_eq!(*o, owner);
            assert_eq!(*spender, router);
        }
        other => panic!("expected a revert, got {:?}", other),
    }
    assert!(ActionError::from(err).is_recoverable());
    assert!(!h.ctx.store().is_approved(h.usd_address(), owner, router).unwrap());

    // The next attempt goes through
    assert!(usd.ensure_approved(owner, router).unwrap());
    assert_eq!(h.chain.count_calls("approve"), 2);
}
