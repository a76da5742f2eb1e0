#![allow(dead_code)]

use std::sync::Arc;

use alloy::primitives::U256;

use xsd_sim::address::{low_address, Address};
use xsd_sim::balance::Balance;
use xsd_sim::chain::mock::MockChain;
use xsd_sim::chain::{ChainClient, ChainContext};
use xsd_sim::config::SimConfig;
use xsd_sim::dao::ProtocolDao;
use xsd_sim::exchange::ExchangePool;
use xsd_sim::store::{CoordinationStore, MemoryStore};
use xsd_sim::token_cache::TokenCache;

pub const POOL_PROVIDER: u64 = 0xfeed;

/// A fresh mock deployment, a context over it, and `agents` unlocked accounts.
pub struct Harness {
    pub config: SimConfig,
    pub chain: Arc<MockChain>,
    pub ctx: Arc<ChainContext>,
    pub accounts: Vec<Address>,
}

/// Defaults tuned so tests never sleep for long.
pub fn test_config() -> SimConfig {
    let mut config = SimConfig::default();
    config.chain.receipt_poll_ms = 1;
    config.chain.receipt_timeout_ms = 200;
    config.store.backoff_initial_ms = 1;
    config.store.backoff_max_ms = 5;
    config
}

pub fn harness(agents: u64) -> Harness {
    harness_with(test_config(), agents, Arc::new(MemoryStore::new()))
}

pub fn harness_with(config: SimConfig, agents: u64, store: Arc<dyn CoordinationStore>) -> Harness {
    let chain = Arc::new(MockChain::deploy(&config.contracts));
    let accounts: Vec<Address> = (1..=agents).map(|n| low_address(0x1000 + n)).collect();
    chain.set_accounts(&accounts);
    let client: Arc<dyn ChainClient> = chain.clone();
    let ctx = Arc::new(ChainContext::new(
        client,
        store,
        config.chain.clone(),
        &config.store,
    ));
    Harness {
        config,
        chain,
        ctx,
        accounts,
    }
}

impl Harness {
    pub fn usd_address(&self) -> Address {
        self.config.contracts.usdc.address
    }

    pub fn xsd_address(&self) -> Address {
        self.config.contracts.xsd.address
    }

    pub fn usd_cache(&self) -> Arc<TokenCache> {
        Arc::new(TokenCache::new(self.ctx.clone(), self.config.contracts.usdc.clone()).unwrap())
    }

    pub fn xsd_cache(&self) -> Arc<TokenCache> {
        Arc::new(TokenCache::new(self.ctx.clone(), self.config.contracts.xsd.clone()).unwrap())
    }

    pub fn lp_cache(&self) -> Arc<TokenCache> {
        Arc::new(TokenCache::new(self.ctx.clone(), self.config.contracts.pair.clone()).unwrap())
    }

    pub fn pool(&self) -> ExchangePool {
        ExchangePool::new(
            self.ctx.clone(),
            &self.config.contracts,
            &self.config.market,
            self.usd_cache(),
            self.xsd_cache(),
            self.lp_cache(),
        )
    }

    pub fn dao(&self, xsd: Arc<TokenCache>) -> ProtocolDao {
        ProtocolDao::new(self.ctx.clone(), self.config.contracts.dao, xsd)
    }

    /// Seed the pair with whole-token amounts on both sides.
    pub fn seed_pool(&self, usd_whole: u64, xsd_whole: u64) {
        let usd = Balance::from_whole(usd_whole, self.config.contracts.usdc.decimals).unwrap();
        let xsd = Balance::from_whole(xsd_whole, self.config.contracts.xsd.decimals).unwrap();
        self.chain
            .seed_pool(low_address(POOL_PROVIDER), usd.to_wei(), xsd.to_wei())
            .unwrap();
    }

    pub fn fund_usd(&self, who: Address, whole: u64) {
        let amount = Balance::from_whole(whole, self.config.contracts.usdc.decimals).unwrap();
        self.chain.mint(self.usd_address(), who, amount.to_wei()).unwrap();
    }

    pub fn fund_xsd(&self, who: Address, whole: u64) {
        let amount = Balance::from_whole(whole, self.config.contracts.xsd.decimals).unwrap();
        self.chain.mint(self.xsd_address(), who, amount.to_wei()).unwrap();
    }
}

/// `whole` tokens of an 18-decimal asset as raw units.
pub fn wei(whole: u64) -> U256 {
    U256::from(whole) * U256::from(10u64).pow(U256::from(18u64))
}
