//! The xSD DAO: epochs, the coupon auction, redemption and bonding.

use std::sync::Arc;

use alloy::primitives::U256;
use tracing::{debug, warn};

use crate::address::{Address, Addressable};
use crate::agent::Agent;
use crate::balance::Balance;
use crate::chain::{ChainContext, ContractCall, Receipt};
use crate::error::{ActionError, BalanceError};
use crate::token_cache::TokenCache;

/// DAO share tokens use 18 decimals.
pub const SHARE_DECIMALS: u8 = 18;

/// Fresh read of the DAO's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaoSnapshot {
    pub epoch: u64,
    pub total_coupons: Balance,
    pub total_redeemable: Balance,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    Advanced { tx: String },
    /// Reverted or never confirmed. The step carries on at the old epoch.
    Reverted { reason: String },
}

impl AdvanceOutcome {
    pub fn advanced(&self) -> bool {
        matches!(self, AdvanceOutcome::Advanced { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedeemOutcome {
    /// No coupons at that epoch; no transaction was sent.
    NothingToRedeem,
    /// Coupons are held but the DAO has nothing redeemable right now.
    Deferred,
    Redeemed(Balance),
}

pub struct ProtocolDao {
    ctx: Arc<ChainContext>,
    address: Address,
    xsd: Arc<TokenCache>,
}

impl ProtocolDao {
    pub fn new(ctx: Arc<ChainContext>, address: Address, xsd: Arc<TokenCache>) -> Self {
        ProtocolDao { ctx, address, xsd }
    }

    fn xsd_balance(&self, raw: U256) -> Balance {
        Balance::new(raw, self.xsd.decimals())
    }

    pub fn epoch(&self) -> Result<u64, ActionError> {
        Ok(self.ctx.client().epoch(self.address)?)
    }

    pub fn total_coupons(&self) -> Result<Balance, ActionError> {
        Ok(self.xsd_balance(self.ctx.client().total_coupons(self.address)?))
    }

    pub fn total_redeemable(&self) -> Result<Balance, ActionError> {
        Ok(self.xsd_balance(self.ctx.client().total_redeemable(self.address)?))
    }

    pub fn snapshot(&self) -> Result<DaoSnapshot, ActionError> {
        Ok(DaoSnapshot {
            epoch: self.epoch()?,
            total_coupons: self.total_coupons()?,
            total_redeemable: self.total_redeemable()?,
        })
    }

    /// Try to move to the next epoch. Recoverable failures are reported as
    /// `AdvanceOutcome::Reverted`, never as errors.
    pub fn advance(&self, advancer: impl Addressable) -> Result<AdvanceOutcome, ActionError> {
        let advancer = advancer.address();
        match self.ctx.transact(advancer, self.address, ContractCall::Advance) {
            Ok(receipt) => {
                debug!(%advancer, tx = %receipt.tx, "epoch advanced");
                Ok(AdvanceOutcome::Advanced { tx: receipt.tx })
            }
            Err(e) if e.is_recoverable() => {
                warn!(%advancer, error = %e, "advance failed");
                Ok(AdvanceOutcome::Reverted {
                    reason: e.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Burn `principal` xSD for up to `max_coupon_amount` coupons expiring at
    /// `expiry_epoch`.
    pub fn coupon_bid(
        &self,
        agent: impl Addressable,
        expiry_epoch: u64,
        principal: &Balance,
        max_coupon_amount: &Balance,
    ) -> Result<Receipt, ActionError> {
        let agent = agent.address();
        if principal.decimals() != self.xsd.decimals() {
            return Err(BalanceError::ScaleMismatch {
                left: principal.decimals(),
                right: self.xsd.decimals(),
            }
            .into());
        }
        if principal.is_zero() {
            return Err(ActionError::Precondition("zero coupon principal".to_string()));
        }
        self.xsd.ensure_approved(agent, self.address)?;
        let call = ContractCall::PlaceCouponAuctionBid {
            coupon_epoch_expiry: expiry_epoch,
            dollar_amount: principal.to_wei(),
            max_coupon_amount: max_coupon_amount.to_wei(),
        };
        let receipt = self.ctx.transact(agent, self.address, call)?;
        debug!(%agent, expiry_epoch, %principal, %max_coupon_amount, "coupon bid placed");
        Ok(receipt)
    }

    pub fn coupon_balance(&self, agent: impl Addressable, epoch: u64) -> Result<Balance, ActionError> {
        let raw = self
            .ctx
            .client()
            .balance_of_coupons(self.address, agent.address(), epoch)?;
        Ok(self.xsd_balance(raw))
    }

    /// Redeem as much of the agent's coupons at `epoch` as the DAO allows.
    pub fn redeem(&self, agent: impl Addressable, epoch: u64) -> Result<RedeemOutcome, ActionError> {
        let agent = agent.address();
        let held = self.coupon_balance(agent, epoch)?;
        if held.is_zero() {
            return Ok(RedeemOutcome::NothingToRedeem);
        }
        let amount = held.try_min(&self.total_redeemable()?)?;
        if amount.is_zero() {
            return Ok(RedeemOutcome::Deferred);
        }
        let call = ContractCall::RedeemCoupons {
            coupon_epoch: epoch,
            amount: amount.to_wei(),
        };
        self.ctx.transact(agent, self.address, call)?;
        debug!(%agent, epoch, %amount, "coupons redeemed");
        Ok(RedeemOutcome::Redeemed(amount))
    }

    /// Pull coupon expiry epochs assigned since the agent last looked.
    /// Returns how many were new.
    pub fn get_coupon_expirations(&self, agent: &mut Agent) -> Result<usize, ActionError> {
        let client = self.ctx.client();
        let current = client.coupons_current_assigned_index(self.address, agent.address())?;
        let first = agent.coupon_index_seen();
        for index in first..current {
            let expiry = client.coupons_assigned_at_epoch(self.address, agent.address(), index)?;
            agent.add_coupon_expiry(expiry);
        }
        agent.set_coupon_index_seen(current.max(first));
        Ok(current.saturating_sub(first) as usize)
    }

    pub fn shares_of(&self, agent: impl Addressable) -> Result<Balance, ActionError> {
        let raw = self.ctx.client().balance_of(self.address, agent.address())?;
        Ok(Balance::new(raw, SHARE_DECIMALS))
    }

    pub fn staged_of(&self, agent: impl Addressable) -> Result<Balance, ActionError> {
        let raw = self
            .ctx
            .client()
            .balance_of_staged(self.address, agent.address())?;
        Ok(self.xsd_balance(raw))
    }

    /// Bond `amount` xSD, depositing whatever is not already staged.
    pub fn bond(&self, agent: impl Addressable, amount: &Balance) -> Result<Receipt, ActionError> {
        let agent = agent.address();
        if amount.is_zero() {
            return Err(ActionError::Precondition("zero bond amount".to_string()));
        }
        let staged = self.staged_of(agent)?;
        let deposit = amount.saturating_sub(&staged)?;
        if !deposit.is_zero() {
            self.xsd.ensure_approved(agent, self.address)?;
            self.ctx.transact(
                agent,
                self.address,
                ContractCall::Deposit {
                    amount: deposit.to_wei(),
                },
            )?;
        }
        let receipt = self.ctx.transact(
            agent,
            self.address,
            ContractCall::Bond {
                amount: amount.to_wei(),
            },
        )?;
        debug!(%agent, %amount, %deposit, "bonded");
        Ok(receipt)
    }

    /// Unbond `shares` back to the staged balance.
    pub fn unbond(&self, agent: impl Addressable, shares: &Balance) -> Result<Receipt, ActionError> {
        let agent = agent.address();
        if shares.is_zero() {
            return Err(ActionError::Precondition("zero unbond amount".to_string()));
        }
        let receipt = self.ctx.transact(
            agent,
            self.address,
            ContractCall::Unbond {
                shares: shares.to_wei(),
            },
        )?;
        debug!(%agent, %shares, "unbonded");
        Ok(receipt)
    }
}

impl Addressable for ProtocolDao {
    fn address(&self) -> Address {
        self.address
    }
}
