//! The USDC/xSD Uniswap pair and its router.

use std::sync::Arc;

use tracing::debug;

use crate::address::{Address, Addressable};
use crate::balance::Balance;
use crate::chain::{ChainContext, ContractCall, Receipt};
use crate::config::{ContractSettings, MarketSettings};
use crate::error::{ActionError, BalanceError, ChainError};
use crate::token_cache::TokenCache;

/// Decimal scale prices are normalised to.
pub const PRICE_SCALE: u8 = 18;

/// Pool reserves, already ordered by token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolReserves {
    pub usd: Balance,
    pub xsd: Balance,
}

impl PoolReserves {
    pub fn operational(&self) -> bool {
        !self.usd.is_zero() && !self.xsd.is_zero()
    }

    /// USD per xSD with both sides at `PRICE_SCALE`; 1.0 when there is no market.
    pub fn price(&self) -> Result<f64, BalanceError> {
        if !self.operational() {
            return Ok(1.0);
        }
        let usd = self.usd.to_decimals(PRICE_SCALE)?.to_f64();
        let xsd = self.xsd.to_decimals(PRICE_SCALE)?.to_f64();
        Ok(usd / xsd)
    }
}

pub struct ExchangePool {
    ctx: Arc<ChainContext>,
    pair: Address,
    router: Address,
    usd: Arc<TokenCache>,
    xsd: Arc<TokenCache>,
    lp: Arc<TokenCache>,
    slippage_bps: u32,
}

impl ExchangePool {
    pub fn new(
        ctx: Arc<ChainContext>,
        contracts: &ContractSettings,
        market: &MarketSettings,
        usd: Arc<TokenCache>,
        xsd: Arc<TokenCache>,
        lp: Arc<TokenCache>,
    ) -> Self {
        ExchangePool {
            ctx,
            pair: contracts.pair.address,
            router: contracts.router,
            usd,
            xsd,
            lp,
            slippage_bps: market.slippage_bps,
        }
    }

    pub fn usd(&self) -> &Arc<TokenCache> {
        &self.usd
    }

    pub fn xsd(&self) -> &Arc<TokenCache> {
        &self.xsd
    }

    pub fn lp(&self) -> &Arc<TokenCache> {
        &self.lp
    }

    pub fn router(&self) -> Address {
        self.router
    }

    pub fn reserves(&self) -> Result<PoolReserves, ActionError> {
        let client = self.ctx.client();
        let (r0, r1) = client.get_reserves(self.pair)?;
        let token0 = client.token0(self.pair)?;
        let (usd_raw, xsd_raw) = if token0 == self.usd.address() {
            (r0, r1)
        } else if token0 == self.xsd.address() {
            (r1, r0)
        } else {
            return Err(ChainError::Decode(format!(
                "pair {} token0 {} is neither USDC nor xSD",
                self.pair, token0
            ))
            .into());
        };
        Ok(PoolReserves {
            usd: Balance::new(usd_raw, self.usd.decimals()),
            xsd: Balance::new(xsd_raw, self.xsd.decimals()),
        })
    }

    pub fn operational(&self) -> Result<bool, ActionError> {
        Ok(self.reserves()?.operational())
    }

    pub fn price(&self) -> Result<f64, ActionError> {
        Ok(self.reserves()?.price()?)
    }

    /// Reserve-ratio quote: `amount * reserve_out / reserve_in`, no fee.
    pub fn quote(
        amount: &Balance,
        reserve_in: &Balance,
        reserve_out: &Balance,
    ) -> Result<Balance, BalanceError> {
        reserve_out.scale_by(amount, reserve_in)
    }

    fn amounts_out(&self, amount_in: &Balance, path: [Address; 2], out_scale: u8) -> Result<Balance, ActionError> {
        let amounts = self
            .ctx
            .client()
            .get_amounts_out(self.router, amount_in.to_wei(), &path)?;
        let out = amounts
            .last()
            .copied()
            .ok_or_else(|| ChainError::Decode("getAmountsOut returned nothing".to_string()))?;
        Ok(Balance::new(out, out_scale))
    }

    /// xSD the router would give for `usd_in`, fee included.
    pub fn quote_buy(&self, usd_in: &Balance) -> Result<Balance, ActionError> {
        self.amounts_out(usd_in, [self.usd.address(), self.xsd.address()], self.xsd.decimals())
    }

    /// USDC the router would give for `xsd_in`, fee included.
    pub fn quote_sell(&self, xsd_in: &Balance) -> Result<Balance, ActionError> {
        self.amounts_out(xsd_in, [self.xsd.address(), self.usd.address()], self.usd.decimals())
    }

    /// Amounts for a deposit at the current pool ratio, committing `fraction`
    /// of whichever side is scarcer. Returns `(xsd, usd)`.
    pub fn balanced_deposit(
        &self,
        xsd_available: &Balance,
        usd_available: &Balance,
        fraction: f64,
    ) -> Result<(Balance, Balance), ActionError> {
        let r = self.reserves()?;
        if !r.operational() {
            return Err(ActionError::Precondition("pool has no liquidity".to_string()));
        }
        let usd_for_all_xsd = Self::quote(xsd_available, &r.xsd, &r.usd)?;
        if usd_for_all_xsd < *usd_available {
            let xsd = xsd_available.portion(fraction)?;
            Ok((xsd, Self::quote(&xsd, &r.xsd, &r.usd)?))
        } else {
            let usd = usd_available.portion(fraction)?;
            Ok((Self::quote(&usd, &r.usd, &r.xsd)?, usd))
        }
    }

    fn check_amount(&self, amount: &Balance, token: &TokenCache) -> Result<(), ActionError> {
        if amount.decimals() != token.decimals() {
            return Err(BalanceError::ScaleMismatch {
                left: amount.decimals(),
                right: token.decimals(),
            }
            .into());
        }
        if amount.is_zero() {
            return Err(ActionError::Precondition(format!("zero {} amount", token.symbol())));
        }
        Ok(())
    }

    fn swap(
        &self,
        agent: Address,
        amount_in: &Balance,
        expected_out: &Balance,
        from: &TokenCache,
        to: &TokenCache,
    ) -> Result<Receipt, ActionError> {
        self.check_amount(amount_in, from)?;
        from.ensure_approved(agent, self.router)?;
        let min_out = expected_out.less_bps(self.slippage_bps)?;
        let call = ContractCall::SwapExactTokensForTokens {
            amount_in: amount_in.to_wei(),
            amount_out_min: min_out.to_wei(),
            path: vec![from.address(), to.address()],
            to: agent,
            deadline: self.ctx.deadline(),
        };
        let receipt = self.ctx.transact(agent, self.router, call)?;
        debug!(%agent, sold = %amount_in, from = from.symbol(), min_out = %min_out, "swap confirmed");
        Ok(receipt)
    }

    /// Swap `usd_in` for at least `expected_xsd` less slippage.
    pub fn buy(
        &self,
        agent: impl Addressable,
        usd_in: &Balance,
        expected_xsd: &Balance,
    ) -> Result<Receipt, ActionError> {
        self.swap(agent.address(), usd_in, expected_xsd, &self.usd, &self.xsd)
    }

    /// Swap `xsd_in` for at least `expected_usd` less slippage.
    pub fn sell(
        &self,
        agent: impl Addressable,
        xsd_in: &Balance,
        expected_usd: &Balance,
    ) -> Result<Receipt, ActionError> {
        self.swap(agent.address(), xsd_in, expected_usd, &self.xsd, &self.usd)
    }

    pub fn provide_liquidity(
        &self,
        agent: impl Addressable,
        xsd: &Balance,
        usd: &Balance,
    ) -> Result<Receipt, ActionError> {
        let agent = agent.address();
        self.check_amount(xsd, &self.xsd)?;
        self.check_amount(usd, &self.usd)?;
        self.xsd.ensure_approved(agent, self.router)?;
        self.usd.ensure_approved(agent, self.router)?;

        let call = ContractCall::AddLiquidity {
            token_a: self.xsd.address(),
            token_b: self.usd.address(),
            amount_a_desired: xsd.to_wei(),
            amount_b_desired: usd.to_wei(),
            amount_a_min: xsd.less_bps(self.slippage_bps)?.to_wei(),
            amount_b_min: usd.less_bps(self.slippage_bps)?.to_wei(),
            to: agent,
            deadline: self.ctx.deadline(),
        };
        let receipt = self.ctx.transact(agent, self.router, call)?;
        debug!(%agent, %xsd, %usd, "liquidity added");
        Ok(receipt)
    }

    /// Burn `shares` LP tokens for the matching part of both reserves.
    pub fn remove_liquidity(&self, agent: impl Addressable, shares: &Balance) -> Result<Receipt, ActionError> {
        let agent = agent.address();
        self.check_amount(shares, &self.lp)?;
        let total = Balance::new(self.ctx.client().total_supply(self.pair)?, self.lp.decimals());
        if total.is_zero() {
            return Err(ActionError::Precondition("pool has no LP supply".to_string()));
        }
        let r = self.reserves()?;
        let expected_usd = r.usd.scale_by(shares, &total)?;
        let expected_xsd = r.xsd.scale_by(shares, &total)?;
        self.lp.ensure_approved(agent, self.router)?;

        let call = ContractCall::RemoveLiquidity {
            token_a: self.xsd.address(),
            token_b: self.usd.address(),
            liquidity: shares.to_wei(),
            amount_a_min: expected_xsd.less_bps(self.slippage_bps)?.to_wei(),
            amount_b_min: expected_usd.less_bps(self.slippage_bps)?.to_wei(),
            to: agent,
            deadline: self.ctx.deadline(),
        };
        let receipt = self.ctx.transact(agent, self.router, call)?;
        debug!(%agent, %shares, %expected_xsd, %expected_usd, "liquidity removed");
        Ok(receipt)
    }
}

impl Addressable for ExchangePool {
    fn address(&self) -> Address {
        self.pair
    }
}
