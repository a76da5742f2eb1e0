use std::collections::HashMap;
use std::f64::consts::PI;
use std::fmt;

use crate::address::{Address, Addressable};
use crate::balance::Balance;
use crate::config::AgentSettings;

/// Faith completes one full swing every this many blocks.
const FAITH_PERIOD_BLOCKS: f64 = 5_000.0;

// ═══════════════════════════════════════════════════════════════════════
// Actions and strategy weights
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ActionKind {
    Buy,
    Sell,
    ProvideLiquidity,
    RemoveLiquidity,
    Bond,
    Unbond,
    CouponBid,
    Redeem,
}

impl ActionKind {
    pub const ALL: [ActionKind; 8] = [
        ActionKind::Buy,
        ActionKind::Sell,
        ActionKind::ProvideLiquidity,
        ActionKind::RemoveLiquidity,
        ActionKind::Bond,
        ActionKind::Unbond,
        ActionKind::CouponBid,
        ActionKind::Redeem,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::Buy => "buy",
            ActionKind::Sell => "sell",
            ActionKind::ProvideLiquidity => "provide_liquidity",
            ActionKind::RemoveLiquidity => "remove_liquidity",
            ActionKind::Bond => "bond",
            ActionKind::Unbond => "unbond",
            ActionKind::CouponBid => "coupon_bid",
            ActionKind::Redeem => "redeem",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Relative preference for each action. Anything not set weighs 1.0.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Strategy {
    weights: HashMap<ActionKind, f64>,
}

impl Strategy {
    pub fn weight(&self, action: ActionKind) -> f64 {
        self.weights.get(&action).copied().unwrap_or(1.0)
    }

    pub fn set(&mut self, action: ActionKind, weight: f64) {
        self.weights.insert(action, weight);
    }

    pub fn scale(&mut self, action: ActionKind, factor: f64) {
        let w = self.weight(action) * factor;
        self.set(action, w);
    }
}

// ═══════════════════════════════════════════════════════════════════════
// What an agent can see when deciding
// ═══════════════════════════════════════════════════════════════════════

/// Per-step market and DAO facts used for eligibility.
#[derive(Debug, Clone)]
pub struct MarketView {
    pub operational: bool,
    pub price: f64,
    pub epoch: u64,
    pub pool_xsd: Balance,
    pub total_redeemable: Balance,
    pub coupon_auction: bool,
    pub min_pool_liquidity: Balance,
    pub min_coupon_principal: Balance,
}

// ═══════════════════════════════════════════════════════════════════════
// Agent
// ═══════════════════════════════════════════════════════════════════════

/// One simulated wallet. Balances are refreshed from the token caches at the
/// top of each step and are never adjusted optimistically.
#[derive(Debug, Clone)]
pub struct Agent {
    address: Address,
    pub usd: Balance,
    pub xsd: Balance,
    pub lp: Balance,
    pub shares: Balance,
    pub staged: Balance,
    coupon_expiries: Vec<u64>,
    coupon_index_seen: u64,
    redeem_count: u64,
    min_faith: f64,
    max_faith: f64,
    use_faith: bool,
}

impl Agent {
    pub fn new(
        address: Address,
        settings: &AgentSettings,
        usd_decimals: u8,
        xsd_decimals: u8,
        lp_decimals: u8,
        share_decimals: u8,
    ) -> Self {
        Agent {
            address,
            usd: Balance::zero(usd_decimals),
            xsd: Balance::zero(xsd_decimals),
            lp: Balance::zero(lp_decimals),
            shares: Balance::zero(share_decimals),
            staged: Balance::zero(xsd_decimals),
            coupon_expiries: Vec::new(),
            coupon_index_seen: 0,
            redeem_count: 0,
            min_faith: settings.min_faith,
            max_faith: settings.max_faith,
            use_faith: settings.use_faith,
        }
    }

    /// Action weights for the current block, price and xSD supply (whole tokens).
    pub fn get_strategy(&self, block: u64, price: f64, total_supply: f64) -> Strategy {
        let mut s = Strategy::default();

        s.set(ActionKind::CouponBid, 0.1);
        s.set(ActionKind::Unbond, 0.1);

        if price > 1.0 {
            s.set(ActionKind::Bond, 2.0);
            s.set(ActionKind::Unbond, 2.0);
            s.set(ActionKind::Redeem, 100.0);
            if !self.coupon_expiries.is_empty() {
                s.scale(ActionKind::Redeem, 2.0);
            }
        } else {
            s.set(ActionKind::Unbond, 2.0);
            s.set(ActionKind::Bond, 0.5);
        }

        if self.use_faith {
            if price * total_supply > self.get_faith(block) {
                // Market cap above what we believe in
                s.scale(ActionKind::Unbond, 2.0);
                s.set(ActionKind::Sell, 4.0);
            } else {
                s.set(ActionKind::Buy, 4.0);
            }
        }
        s
    }

    /// Market cap in USD this agent believes xSD deserves at `block`.
    pub fn get_faith(&self, block: u64) -> f64 {
        let center = (self.max_faith + self.min_faith) / 2.0;
        let swing = (self.max_faith - self.min_faith) / 2.0;
        center + swing * (block as f64 * (2.0 * PI / FAITH_PERIOD_BLOCKS)).sin()
    }

    pub fn eligible_actions(&self, view: &MarketView) -> Vec<ActionKind> {
        let mut options = Vec::new();
        let has_usd = !self.usd.is_zero();
        let has_xsd = !self.xsd.is_zero();

        if has_usd && view.operational {
            options.push(ActionKind::Buy);
        }
        if has_xsd && view.operational {
            options.push(ActionKind::Sell);
        }
        if has_usd && has_xsd && view.operational {
            options.push(ActionKind::ProvideLiquidity);
        }
        if !self.lp.is_zero() {
            options.push(ActionKind::RemoveLiquidity);
        }
        if has_xsd {
            options.push(ActionKind::Bond);
        }
        if !self.shares.is_zero() {
            options.push(ActionKind::Unbond);
        }
        if view.coupon_auction
            && view.price <= 1.0
            && view.pool_xsd >= view.min_pool_liquidity
            && self.xsd >= view.min_coupon_principal
        {
            options.push(ActionKind::CouponBid);
        }
        if !view.total_redeemable.is_zero() && !self.live_coupon_expiries(view.epoch).is_empty() {
            options.push(ActionKind::Redeem);
        }
        options
    }

    pub fn coupon_expiries(&self) -> &[u64] {
        &self.coupon_expiries
    }

    /// Tracked expiries still ahead of `epoch`.
    pub fn live_coupon_expiries(&self, epoch: u64) -> Vec<u64> {
        self.coupon_expiries.iter().copied().filter(|e| *e > epoch).collect()
    }

    /// Forget expiries at or before `epoch`; those coupons are gone.
    pub fn drop_expired(&mut self, epoch: u64) -> usize {
        let before = self.coupon_expiries.len();
        self.coupon_expiries.retain(|e| *e > epoch);
        before - self.coupon_expiries.len()
    }

    /// Insert keeping the list sorted and free of duplicates.
    pub fn add_coupon_expiry(&mut self, epoch: u64) {
        if let Err(pos) = self.coupon_expiries.binary_search(&epoch) {
            self.coupon_expiries.insert(pos, epoch);
        }
    }

    pub fn remove_coupon_expiry(&mut self, epoch: u64) -> bool {
        match self.coupon_expiries.binary_search(&epoch) {
            Ok(pos) => {
                self.coupon_expiries.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    pub fn coupon_index_seen(&self) -> u64 {
        self.coupon_index_seen
    }

    pub fn set_coupon_index_seen(&mut self, index: u64) {
        self.coupon_index_seen = index;
    }

    pub fn redeem_count(&self) -> u64 {
        self.redeem_count
    }

    pub fn record_redeem(&mut self) {
        self.redeem_count += 1;
    }
}

impl Addressable for Agent {
    fn address(&self) -> Address {
        self.address
    }
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Agent({}, usd={}, xsd={}, lp={}, shares={}, coupon_epochs={})",
            self.address,
            self.usd,
            self.xsd,
            self.lp,
            self.shares,
            self.coupon_expiries.len()
        )
    }
}
