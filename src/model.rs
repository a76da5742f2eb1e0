use std::sync::Arc;

use rand::distributions::WeightedIndex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Uniform};
use tracing::{debug, info, warn};

use crate::address::{Address, Addressable};
use crate::agent::{ActionKind, Agent, MarketView};
use crate::balance::Balance;
use crate::chain::{ChainContext, ContractCall};
use crate::config::{AgentSettings, DaoSettings, MarketSettings, SimConfig};
use crate::dao::{DaoSnapshot, ProtocolDao, RedeemOutcome, SHARE_DECIMALS};
use crate::error::{ActionError, SimError};
use crate::exchange::ExchangePool;
use crate::token_cache::TokenCache;

// ═══════════════════════════════════════════════════════════════════════
// Step report: one row of the run log
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct StepReport {
    pub step: u64,
    pub block: u64,
    pub epoch: u64,
    pub price: f64,
    pub supply: Balance,
    pub total_coupons: Balance,
    pub total_redeemable: Balance,
    pub faith: f64,
    pub advanced: bool,
    /// Agents whose chosen action confirmed on chain
    pub acted: usize,
    /// Agents whose chosen action failed recoverably
    pub failed: usize,
    /// Agents with no eligible action, or whose action sized to nothing
    pub idle: usize,
    /// Coupon epochs redeemed by the pre-action pass
    pub redeemed: usize,
    /// Some agent had an eligible action and attempted it, whatever the
    /// outcome. A run ends on the first step where this is false.
    pub anyone_acted: bool,
}

/// Start-of-step state shared by every agent's turn.
#[derive(Debug, Clone)]
pub struct StepStart {
    pub advanced: bool,
    pub supply: Balance,
    pub snapshot: DaoSnapshot,
    pub redeemed: usize,
    pub view: MarketView,
}

/// Outcome of one agent's turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Turn {
    Acted,
    Skipped,
}

// ═══════════════════════════════════════════════════════════════════════
// Model
// ═══════════════════════════════════════════════════════════════════════

pub struct Model {
    ctx: Arc<ChainContext>,
    usd: Arc<TokenCache>,
    xsd: Arc<TokenCache>,
    lp: Arc<TokenCache>,
    pool: ExchangePool,
    dao: ProtocolDao,
    agents: Vec<Agent>,
    agent_settings: AgentSettings,
    market: MarketSettings,
    dao_settings: DaoSettings,
    rng: StdRng,
    step: u64,
    next_advancer: usize,
    has_prev_advanced: bool,
}

impl Model {
    /// Build caches and contract handles and one agent per account. On a
    /// fresh deployment (`mint_on_start`) every agent gets a random USDC grant.
    pub fn new(
        ctx: Arc<ChainContext>,
        config: &SimConfig,
        accounts: &[Address],
        seed: u64,
    ) -> Result<Self, SimError> {
        let contracts = &config.contracts;
        let usd = Arc::new(TokenCache::new(ctx.clone(), contracts.usdc.clone())?);
        let xsd = Arc::new(TokenCache::new(ctx.clone(), contracts.xsd.clone())?);
        let lp = Arc::new(TokenCache::new(ctx.clone(), contracts.pair.clone())?);
        let pool = ExchangePool::new(
            ctx.clone(),
            contracts,
            &config.market,
            usd.clone(),
            xsd.clone(),
            lp.clone(),
        );
        let dao = ProtocolDao::new(ctx.clone(), contracts.dao, xsd.clone());

        let agents = accounts
            .iter()
            .map(|a| {
                Agent::new(
                    *a,
                    &config.agents,
                    usd.decimals(),
                    xsd.decimals(),
                    lp.decimals(),
                    SHARE_DECIMALS,
                )
            })
            .collect();

        let mut model = Model {
            ctx,
            usd,
            xsd,
            lp,
            pool,
            dao,
            agents,
            agent_settings: config.agents.clone(),
            market: config.market.clone(),
            dao_settings: config.dao.clone(),
            rng: StdRng::seed_from_u64(seed),
            step: 0,
            next_advancer: 0,
            has_prev_advanced: true,
        };
        if config.agents.mint_on_start {
            model.mint_starting_usd()?;
        }
        info!(agents = model.agents.len(), seed, "model initialised");
        Ok(model)
    }

    fn mint_starting_usd(&mut self) -> Result<(), SimError> {
        let token = self.usd.address();
        for i in 0..self.agents.len() {
            let whole = self.rng.gen_range(0..=self.agent_settings.max_usdc);
            if whole == 0 {
                continue;
            }
            let amount = Balance::from_whole(whole, self.usd.decimals())?;
            let to = self.agents[i].address();
            let call = ContractCall::Mint {
                to,
                amount: amount.to_wei(),
            };
            match self.ctx.transact(to, token, call) {
                Ok(_) => debug!(agent = %to, %amount, "minted starting USDC"),
                Err(e) if e.is_recoverable() => warn!(agent = %to, error = %e, "starting mint failed"),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn agents_mut(&mut self) -> &mut [Agent] {
        &mut self.agents
    }

    pub fn pool(&self) -> &ExchangePool {
        &self.pool
    }

    pub fn dao(&self) -> &ProtocolDao {
        &self.dao
    }

    pub fn has_prev_advanced(&self) -> bool {
        self.has_prev_advanced
    }

    /// The first agent's faith at the current step.
    pub fn get_overall_faith(&self) -> f64 {
        self.agents.first().map(|a| a.get_faith(self.step)).unwrap_or(0.0)
    }

    /// Replay token events and re-read every agent's holdings.
    ///
    /// Recoverable read failures are logged and leave the affected cache or
    /// agent at its previous values until the next step. Anything else is
    /// returned.
    pub fn refresh(&mut self) -> Result<(), ActionError> {
        for cache in [&self.usd, &self.xsd, &self.lp] {
            match cache.update() {
                Ok(_) => {}
                Err(e) if e.is_recoverable() => {
                    warn!(token = cache.symbol(), error = %e, "event replay failed");
                }
                Err(e) => return Err(e),
            }
        }
        for i in 0..self.agents.len() {
            match self.refresh_agent(i) {
                Ok(()) => {}
                Err(e) if e.is_recoverable() => {
                    let agent = self.agents[i].address();
                    warn!(%agent, error = %e, "holdings read failed, keeping previous");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// All reads land before any field changes.
    fn refresh_agent(&mut self, i: usize) -> Result<(), ActionError> {
        let who = self.agents[i].address();
        let usd = self.usd.get(who)?;
        let xsd = self.xsd.get(who)?;
        let lp = self.lp.get(who)?;
        let shares = self.dao.shares_of(who)?;
        let staged = self.dao.staged_of(who)?;

        let agent = &mut self.agents[i];
        agent.usd = usd;
        agent.xsd = xsd;
        agent.lp = lp;
        agent.shares = shares;
        agent.staged = staged;
        self.dao.get_coupon_expirations(agent)?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────
    // One tick
    // ─────────────────────────────────────────────────────────────────

    /// Refresh holdings, advance the epoch and run the redemption pass.
    /// Returns what agents get to see for the rest of the step.
    pub fn begin_step(&mut self) -> Result<StepStart, SimError> {
        self.step += 1;
        self.refresh()?;

        let advanced = match self.agents.len() {
            0 => false,
            n => {
                let advancer = self.agents[self.next_advancer % n].address();
                self.next_advancer = (self.next_advancer + 1) % n;
                self.dao.advance(advancer)?.advanced()
            }
        };
        self.has_prev_advanced = advanced;

        // Advance may have minted; pool and DAO are read fresh either way
        self.xsd.update()?;
        let reserves = self.pool.reserves()?;
        let price = reserves.price()?;
        let snapshot = self.dao.snapshot()?;
        let supply = self.xsd.total_supply()?;

        let mut redeemed = 0;
        if self.dao_settings.redeem_before_actions && !snapshot.total_redeemable.is_zero() {
            for i in 0..self.agents.len() {
                redeemed += self.redeem_all(i, snapshot.epoch)?;
            }
        }

        let view = MarketView {
            operational: reserves.operational(),
            price,
            epoch: snapshot.epoch,
            pool_xsd: reserves.xsd,
            total_redeemable: self.dao.total_redeemable()?,
            coupon_auction: self.dao_settings.coupon_auction,
            min_pool_liquidity: Balance::from_whole(self.market.min_pool_liquidity, self.xsd.decimals())?,
            min_coupon_principal: Balance::from_whole(
                self.dao_settings.min_coupon_principal,
                self.xsd.decimals(),
            )?,
        };

        Ok(StepStart {
            advanced,
            supply,
            snapshot,
            redeemed,
            view,
        })
    }

    /// Refresh, advance the epoch, redeem, then let every agent try one
    /// action. Only fatal errors are returned.
    pub fn step(&mut self) -> Result<StepReport, SimError> {
        let StepStart {
            advanced,
            supply,
            snapshot,
            redeemed,
            view,
        } = self.begin_step()?;
        let price = view.price;

        let mut order: Vec<usize> = (0..self.agents.len()).collect();
        order.shuffle(&mut self.rng);

        let (mut acted, mut failed, mut idle) = (0, 0, 0);
        let mut attempted = 0;
        for i in order {
            let options = self.agents[i].eligible_actions(&view);
            if options.is_empty() {
                idle += 1;
                continue;
            }
            let strategy = self.agents[i].get_strategy(self.step, price, supply.to_f64());
            let weights: Vec<f64> = options.iter().map(|a| strategy.weight(*a)).collect();
            let Ok(choice) = WeightedIndex::new(&weights) else {
                idle += 1;
                continue;
            };
            let action = options[choice.sample(&mut self.rng)];
            attempted += 1;
            let commitment = self.draw_commitment();
            let agent = self.agents[i].address();
            debug!(%agent, %action, commitment, "agent acting");

            match self.act(i, action, commitment, &view) {
                Ok(Turn::Acted) => acted += 1,
                Ok(Turn::Skipped) => idle += 1,
                Err(e) if e.is_recoverable() => {
                    warn!(%agent, %action, error = %e, "action failed");
                    failed += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let report = StepReport {
            step: self.step,
            block: self.ctx.client().block_number()?,
            epoch: snapshot.epoch,
            price,
            supply,
            total_coupons: snapshot.total_coupons,
            total_redeemable: snapshot.total_redeemable,
            faith: self.get_overall_faith(),
            advanced,
            acted,
            failed,
            idle,
            redeemed,
            anyone_acted: attempted > 0,
        };
        info!(
            step = report.step,
            block = report.block,
            epoch = report.epoch,
            price = report.price,
            supply = %report.supply,
            coupons = %report.total_coupons,
            acted,
            failed,
            idle,
            "step complete"
        );
        Ok(report)
    }

    fn draw_commitment(&mut self) -> f64 {
        let max = self.agent_settings.max_commitment;
        if max > 0.0 {
            Uniform::new(0.0, max).sample(&mut self.rng)
        } else {
            0.0
        }
    }

    /// Carry out `action` for agent `i` with `commitment` of the relevant
    /// holding. Precondition checks that fail yield `Turn::Skipped`.
    pub fn act(
        &mut self,
        i: usize,
        action: ActionKind,
        commitment: f64,
        view: &MarketView,
    ) -> Result<Turn, ActionError> {
        let agent = self.agents[i].address();
        match action {
            ActionKind::Buy => {
                let usd_in = self.agents[i].usd.portion(commitment)?;
                if usd_in.is_zero() {
                    return Ok(Turn::Skipped);
                }
                let expected = self.pool.quote_buy(&usd_in)?;
                if expected.is_zero() {
                    return Ok(Turn::Skipped);
                }
                self.pool.buy(agent, &usd_in, &expected)?;
            }
            ActionKind::Sell => {
                let xsd_in = self.agents[i].xsd.portion(commitment)?;
                if xsd_in.is_zero() {
                    return Ok(Turn::Skipped);
                }
                let expected = self.pool.quote_sell(&xsd_in)?;
                if expected.is_zero() {
                    return Ok(Turn::Skipped);
                }
                self.pool.sell(agent, &xsd_in, &expected)?;
            }
            ActionKind::ProvideLiquidity => {
                let a = &self.agents[i];
                let (xsd, usd) = self.pool.balanced_deposit(&a.xsd, &a.usd, commitment)?;
                if xsd.is_zero() || usd.is_zero() {
                    return Ok(Turn::Skipped);
                }
                self.pool.provide_liquidity(agent, &xsd, &usd)?;
            }
            ActionKind::RemoveLiquidity => {
                let shares = self.agents[i].lp.portion(commitment)?;
                if shares.is_zero() {
                    return Ok(Turn::Skipped);
                }
                self.pool.remove_liquidity(agent, &shares)?;
            }
            ActionKind::Bond => {
                let amount = self.agents[i].xsd.portion(commitment)?;
                if amount.is_zero() {
                    return Ok(Turn::Skipped);
                }
                self.dao.bond(agent, &amount)?;
            }
            ActionKind::Unbond => {
                let shares = self.agents[i].shares.portion(commitment)?;
                if shares.is_zero() {
                    return Ok(Turn::Skipped);
                }
                self.dao.unbond(agent, &shares)?;
            }
            ActionKind::CouponBid => {
                if !self.has_prev_advanced {
                    // The epoch did not move this step; retry so the oracle
                    // is fresh before burning principal.
                    self.has_prev_advanced = self.dao.advance(agent)?.advanced();
                }
                let principal = self.agents[i].xsd.portion(commitment)?;
                if principal < view.min_coupon_principal || principal.is_zero() {
                    return Ok(Turn::Skipped);
                }
                let expiry = self.dao.epoch()? + self.dao_settings.coupon_expiry_epochs;
                let max_coupons = principal.plus_bps(self.dao_settings.max_coupon_premium_bps)?;
                self.dao.coupon_bid(agent, expiry, &principal, &max_coupons)?;
                self.dao.get_coupon_expirations(&mut self.agents[i])?;
            }
            ActionKind::Redeem => {
                if self.redeem_all(i, view.epoch)? == 0 {
                    return Ok(Turn::Skipped);
                }
            }
        }
        Ok(Turn::Acted)
    }

    /// Redeem every unexpired tracked epoch of agent `i`. An epoch leaves the
    /// list once the DAO confirms the agent holds nothing there; a failed
    /// redemption keeps it for a later step. Returns the number of epochs
    /// redeemed from.
    fn redeem_all(&mut self, i: usize, epoch: u64) -> Result<usize, ActionError> {
        let agent = self.agents[i].address();
        let dropped = self.agents[i].drop_expired(epoch);
        if dropped > 0 {
            debug!(%agent, dropped, "expired coupon epochs dropped");
        }

        let mut redeemed = 0;
        for expiry in self.agents[i].live_coupon_expiries(epoch) {
            match self.dao.redeem(agent, expiry) {
                Ok(RedeemOutcome::NothingToRedeem) => {
                    self.agents[i].remove_coupon_expiry(expiry);
                }
                Ok(RedeemOutcome::Deferred) => break,
                Ok(RedeemOutcome::Redeemed(_)) => {
                    redeemed += 1;
                    self.agents[i].record_redeem();
                    if self.dao.coupon_balance(agent, expiry)?.is_zero() {
                        self.agents[i].remove_coupon_expiry(expiry);
                    }
                }
                Err(e) if e.is_recoverable() => {
                    warn!(%agent, expiry, error = %e, "redemption failed");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(redeemed)
    }

    /// Step until nobody can act or `max_steps` is reached. `on_step` sees
    /// every report, including the final idle one. Returns the step count.
    pub fn run<F>(&mut self, max_steps: u64, mut on_step: F) -> Result<u64, SimError>
    where
        F: FnMut(&StepReport) -> Result<(), SimError>,
    {
        for n in 1..=max_steps {
            let report = self.step()?;
            on_step(&report)?;
            if !report.anyone_acted {
                info!(step = report.step, "no agent could act, stopping");
                return Ok(n);
            }
        }
        Ok(max_steps)
    }
}
