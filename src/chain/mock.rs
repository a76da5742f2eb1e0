//! In-process chain for dry runs and tests.
//!
//! Models just enough of the deployed system to exercise the driver: ERC20
//! ledgers with allowances and Transfer events, one Uniswap-style pair behind a
//! router (0.3% fee, integer math), and a coupon DAO with epochs, bonding and
//! redemption. Every accepted transaction is mined into its own block. Reverts
//! roll back all state changes but still consume the nonce, like a real node.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use alloy::primitives::{Address, U256};

use super::{ChainClient, ContractCall, Receipt, TransferLog, TxRequest};
use crate::config::ContractSettings;
use crate::error::ChainError;

#[derive(Debug, Clone, Default)]
struct Erc20 {
    decimals: u8,
    mintable: bool,
    total_supply: U256,
    balances: HashMap<Address, U256>,
    allowances: HashMap<(Address, Address), U256>,
}

impl Erc20 {
    fn balance(&self, who: &Address) -> U256 {
        self.balances.get(who).copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
struct Pair {
    address: Address,
    token0: Address,
    token1: Address,
    reserve0: U256,
    reserve1: U256,
}

#[derive(Debug, Clone)]
struct Dao {
    address: Address,
    xsd: Address,
    usd: Address,
    epoch: u64,
    total_redeemable: U256,
    total_coupons: U256,
    bonded: U256,
    coupons: HashMap<(Address, u64), U256>,
    assigned: HashMap<Address, Vec<u64>>,
    staged: HashMap<Address, U256>,
    /// Expansion per advance, in basis points of xSD supply
    expansion_bps: u64,
}

/// Contract state; cloned before each transaction so a revert can discard it.
#[derive(Debug, Clone, Default)]
struct World {
    tokens: HashMap<Address, Erc20>,
    pair: Option<Pair>,
    router: Address,
    dao: Option<Dao>,
    pending_logs: Vec<(Address, Address, Address, U256)>,
}

type Revert = String;

fn get_amount_out(amount_in: U256, reserve_in: U256, reserve_out: U256) -> Result<U256, Revert> {
    if amount_in.is_zero() {
        return Err("INSUFFICIENT_INPUT_AMOUNT".to_string());
    }
    if reserve_in.is_zero() || reserve_out.is_zero() {
        return Err("INSUFFICIENT_LIQUIDITY".to_string());
    }
    let with_fee = amount_in * U256::from(997u64);
    let numerator = with_fee * reserve_out;
    let denominator = reserve_in * U256::from(1000u64) + with_fee;
    Ok(numerator / denominator)
}

fn quote(amount_a: U256, reserve_a: U256, reserve_b: U256) -> Result<U256, Revert> {
    if reserve_a.is_zero() {
        return Err("INSUFFICIENT_LIQUIDITY".to_string());
    }
    Ok(amount_a * reserve_b / reserve_a)
}

impl World {
    fn token_mut(&mut self, token: Address) -> Result<&mut Erc20, Revert> {
        self.tokens
            .get_mut(&token)
            .ok_or_else(|| format!("no token at {}", token))
    }

    fn mint(&mut self, token: Address, to: Address, amount: U256) -> Result<(), Revert> {
        let t = self.token_mut(token)?;
        t.total_supply = t.total_supply.checked_add(amount).ok_or("supply overflow")?;
        *t.balances.entry(to).or_default() += amount;
        self.pending_logs.push((token, Address::ZERO, to, amount));
        Ok(())
    }

    fn burn(&mut self, token: Address, from: Address, amount: U256) -> Result<(), Revert> {
        let t = self.token_mut(token)?;
        let bal = t.balance(&from);
        if bal < amount {
            return Err("burn amount exceeds balance".to_string());
        }
        t.balances.insert(from, bal - amount);
        t.total_supply -= amount;
        self.pending_logs.push((token, from, Address::ZERO, amount));
        Ok(())
    }

    fn transfer(&mut self, token: Address, from: Address, to: Address, amount: U256) -> Result<(), Revert> {
        let t = self.token_mut(token)?;
        let bal = t.balance(&from);
        if bal < amount {
            return Err("transfer amount exceeds balance".to_string());
        }
        t.balances.insert(from, bal - amount);
        *t.balances.entry(to).or_default() += amount;
        self.pending_logs.push((token, from, to, amount));
        Ok(())
    }

    fn transfer_from(
        &mut self,
        token: Address,
        spender: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> Result<(), Revert> {
        let t = self.token_mut(token)?;
        let allowance = t.allowances.get(&(from, spender)).copied().unwrap_or_default();
        if allowance < amount {
            return Err("transfer amount exceeds allowance".to_string());
        }
        if allowance != U256::MAX {
            t.allowances.insert((from, spender), allowance - amount);
        }
        self.transfer(token, from, to, amount)
    }

    fn pair_mut(&mut self) -> Result<&mut Pair, Revert> {
        self.pair.as_mut().ok_or_else(|| "no pair deployed".to_string())
    }

    fn dao_mut(&mut self) -> Result<&mut Dao, Revert> {
        self.dao.as_mut().ok_or_else(|| "no dao deployed".to_string())
    }

    /// Reserves ordered as (a, b) for the given token pair.
    fn ordered_reserves(&self, a: Address, b: Address) -> Result<(U256, U256), Revert> {
        let pair = self.pair.as_ref().ok_or("no pair deployed")?;
        if pair.token0 == a && pair.token1 == b {
            Ok((pair.reserve0, pair.reserve1))
        } else if pair.token0 == b && pair.token1 == a {
            Ok((pair.reserve1, pair.reserve0))
        } else {
            Err("INVALID_PATH".to_string())
        }
    }

    fn set_ordered_reserves(&mut self, a: Address, ra: U256, rb: U256) -> Result<(), Revert> {
        let pair = self.pair_mut()?;
        if pair.token0 == a {
            pair.reserve0 = ra;
            pair.reserve1 = rb;
        } else {
            pair.reserve0 = rb;
            pair.reserve1 = ra;
        }
        Ok(())
    }

    /// Price above peg when USD reserves, normalised to xSD decimals, exceed xSD reserves.
    fn above_peg(&self, dao: &Dao) -> bool {
        let (Some(usd), Some(xsd)) = (self.tokens.get(&dao.usd), self.tokens.get(&dao.xsd)) else {
            return false;
        };
        let Ok((r_usd, r_xsd)) = self.ordered_reserves(dao.usd, dao.xsd) else {
            return false;
        };
        if r_usd.is_zero() || r_xsd.is_zero() {
            return false;
        }
        let shift = xsd.decimals.saturating_sub(usd.decimals) as usize;
        r_usd.saturating_mul(U256::from(10u64).saturating_pow(U256::from(shift))) > r_xsd
    }

    fn apply(&mut self, from: Address, to: Address, call: &ContractCall) -> Result<(), Revert> {
        match call {
            ContractCall::Approve { spender, amount } => {
                self.token_mut(to)?.allowances.insert((from, *spender), *amount);
                Ok(())
            }
            ContractCall::Mint { to: recipient, amount } => {
                if !self.token_mut(to)?.mintable {
                    return Err("token is not mintable".to_string());
                }
                self.mint(to, *recipient, *amount)
            }
            ContractCall::SwapExactTokensForTokens {
                amount_in,
                amount_out_min,
                path,
                to: recipient,
                ..
            } => {
                if to != self.router {
                    return Err("swap sent to non-router".to_string());
                }
                let [token_in, token_out] = path.as_slice() else {
                    return Err("INVALID_PATH".to_string());
                };
                let (r_in, r_out) = self.ordered_reserves(*token_in, *token_out)?;
                let out = get_amount_out(*amount_in, r_in, r_out)?;
                if out < *amount_out_min {
                    return Err("INSUFFICIENT_OUTPUT_AMOUNT".to_string());
                }
                let pair = self.pair_mut()?.address;
                let router = self.router;
                self.transfer_from(*token_in, router, from, pair, *amount_in)?;
                self.transfer(*token_out, pair, *recipient, out)?;
                self.set_ordered_reserves(*token_in, r_in + *amount_in, r_out - out)
            }
            ContractCall::AddLiquidity {
                token_a,
                token_b,
                amount_a_desired,
                amount_b_desired,
                amount_a_min,
                amount_b_min,
                to: recipient,
                ..
            } => {
                if to != self.router {
                    return Err("addLiquidity sent to non-router".to_string());
                }
                let (ra, rb) = self.ordered_reserves(*token_a, *token_b)?;
                let (amount_a, amount_b) = if ra.is_zero() && rb.is_zero() {
                    (*amount_a_desired, *amount_b_desired)
                } else {
                    let b_optimal = quote(*amount_a_desired, ra, rb)?;
                    if b_optimal <= *amount_b_desired {
                        if b_optimal < *amount_b_min {
                            return Err("INSUFFICIENT_B_AMOUNT".to_string());
                        }
                        (*amount_a_desired, b_optimal)
                    } else {
                        let a_optimal = quote(*amount_b_desired, rb, ra)?;
                        if a_optimal > *amount_a_desired || a_optimal < *amount_a_min {
                            return Err("INSUFFICIENT_A_AMOUNT".to_string());
                        }
                        (a_optimal, *amount_b_desired)
                    }
                };
                let pair = self.pair_mut()?.address;
                let router = self.router;
                let total = self.token_mut(pair)?.total_supply;
                let liquidity = if total.is_zero() {
                    (amount_a * amount_b).root(2)
                } else {
                    std::cmp::min(amount_a * total / ra, amount_b * total / rb)
                };
                if liquidity.is_zero() {
                    return Err("INSUFFICIENT_LIQUIDITY_MINTED".to_string());
                }
                self.transfer_from(*token_a, router, from, pair, amount_a)?;
                self.transfer_from(*token_b, router, from, pair, amount_b)?;
                self.mint(pair, *recipient, liquidity)?;
                self.set_ordered_reserves(*token_a, ra + amount_a, rb + amount_b)
            }
            ContractCall::RemoveLiquidity {
                token_a,
                token_b,
                liquidity,
                amount_a_min,
                amount_b_min,
                to: recipient,
                ..
            } => {
                if to != self.router {
                    return Err("removeLiquidity sent to non-router".to_string());
                }
                let (ra, rb) = self.ordered_reserves(*token_a, *token_b)?;
                let pair = self.pair_mut()?.address;
                let router = self.router;
                let total = self.token_mut(pair)?.total_supply;
                if total.is_zero() {
                    return Err("INSUFFICIENT_LIQUIDITY".to_string());
                }
                let amount_a = *liquidity * ra / total;
                let amount_b = *liquidity * rb / total;
                if amount_a < *amount_a_min {
                    return Err("INSUFFICIENT_A_AMOUNT".to_string());
                }
                if amount_b < *amount_b_min {
                    return Err("INSUFFICIENT_B_AMOUNT".to_string());
                }
                self.transfer_from(pair, router, from, pair, *liquidity)?;
                self.burn(pair, pair, *liquidity)?;
                self.transfer(*token_a, pair, *recipient, amount_a)?;
                self.transfer(*token_b, pair, *recipient, amount_b)?;
                self.set_ordered_reserves(*token_a, ra - amount_a, rb - amount_b)
            }
            ContractCall::Advance => self.advance(to),
            ContractCall::PlaceCouponAuctionBid {
                coupon_epoch_expiry,
                dollar_amount,
                max_coupon_amount,
            } => {
                let dao = self.dao_mut()?;
                if dao.address != to {
                    return Err("bid sent to non-dao".to_string());
                }
                if *coupon_epoch_expiry <= dao.epoch {
                    return Err("coupon expiry must be in the future".to_string());
                }
                if dollar_amount.is_zero() || max_coupon_amount < dollar_amount {
                    return Err("invalid bid".to_string());
                }
                let xsd = dao.xsd;
                let dao_address = dao.address;
                // Flat 10% premium, capped by the bidder's maximum
                let premium = *dollar_amount / U256::from(10u64);
                let coupons = std::cmp::min(*dollar_amount + premium, *max_coupon_amount);

                let token = self.token_mut(xsd)?;
                let allowance = token.allowances.get(&(from, dao_address)).copied().unwrap_or_default();
                if allowance < *dollar_amount {
                    return Err("transfer amount exceeds allowance".to_string());
                }
                self.burn(xsd, from, *dollar_amount)?;

                let dao = self.dao_mut()?;
                *dao.coupons.entry((from, *coupon_epoch_expiry)).or_default() += coupons;
                dao.assigned.entry(from).or_default().push(*coupon_epoch_expiry);
                dao.total_coupons += coupons;
                Ok(())
            }
            ContractCall::RedeemCoupons { coupon_epoch, amount } => {
                let dao = self.dao_mut()?;
                if dao.address != to {
                    return Err("redeem sent to non-dao".to_string());
                }
                if *coupon_epoch <= dao.epoch {
                    return Err("coupons expired".to_string());
                }
                let held = dao.coupons.get(&(from, *coupon_epoch)).copied().unwrap_or_default();
                if held < *amount || amount.is_zero() {
                    return Err("insufficient coupon balance".to_string());
                }
                if dao.total_redeemable < *amount {
                    return Err("not enough redeemable".to_string());
                }
                dao.coupons.insert((from, *coupon_epoch), held - *amount);
                dao.total_redeemable -= *amount;
                dao.total_coupons = dao.total_coupons.saturating_sub(*amount);
                let (xsd, dao_address) = (dao.xsd, dao.address);
                self.transfer(xsd, dao_address, from, *amount)
            }
            ContractCall::Deposit { amount } => {
                let dao = self.dao_mut()?;
                let (xsd, dao_address) = (dao.xsd, dao.address);
                self.transfer_from(xsd, dao_address, from, dao_address, *amount)?;
                *self.dao_mut()?.staged.entry(from).or_default() += *amount;
                Ok(())
            }
            ContractCall::Bond { amount } => {
                let dao = self.dao_mut()?;
                let staged = dao.staged.get(&from).copied().unwrap_or_default();
                if staged < *amount || amount.is_zero() {
                    return Err("insufficient staged balance".to_string());
                }
                dao.staged.insert(from, staged - *amount);
                let (dao_address, bonded) = (dao.address, dao.bonded);
                let total_shares = self.token_mut(dao_address)?.total_supply;
                let shares = if total_shares.is_zero() || bonded.is_zero() {
                    *amount
                } else {
                    *amount * total_shares / bonded
                };
                self.dao_mut()?.bonded += *amount;
                self.mint(dao_address, from, shares)
            }
            ContractCall::Unbond { shares } => {
                let dao = self.dao_mut()?;
                let (dao_address, bonded) = (dao.address, dao.bonded);
                let total_shares = self.token_mut(dao_address)?.total_supply;
                if total_shares.is_zero() || shares.is_zero() {
                    return Err("nothing to unbond".to_string());
                }
                let amount = *shares * bonded / total_shares;
                self.burn(dao_address, from, *shares)?;
                let dao = self.dao_mut()?;
                dao.bonded -= amount;
                *dao.staged.entry(from).or_default() += amount;
                Ok(())
            }
        }
    }

    fn advance(&mut self, to: Address) -> Result<(), Revert> {
        let dao = self.dao.clone().ok_or("no dao deployed")?;
        if dao.address != to {
            return Err("advance sent to non-dao".to_string());
        }
        let above_peg = self.above_peg(&dao);
        let next_epoch = dao.epoch + 1;

        // Coupons keyed by an expiry epoch that has now arrived are gone
        let mut expired = U256::ZERO;
        let mut coupons = dao.coupons.clone();
        for ((_, epoch), amount) in coupons.iter_mut() {
            if *epoch <= next_epoch {
                expired += *amount;
                *amount = U256::ZERO;
            }
        }

        let mut redeemable_mint = U256::ZERO;
        if above_peg {
            let supply = self.tokens.get(&dao.xsd).map(|t| t.total_supply).unwrap_or_default();
            let outstanding = dao
                .total_coupons
                .saturating_sub(expired)
                .saturating_sub(dao.total_redeemable);
            let expansion = supply * U256::from(dao.expansion_bps) / U256::from(10_000u64);
            redeemable_mint = std::cmp::min(expansion, outstanding);
        }
        if !redeemable_mint.is_zero() {
            self.mint(dao.xsd, dao.address, redeemable_mint)?;
        }

        let d = self.dao_mut()?;
        d.epoch = next_epoch;
        d.coupons = coupons;
        d.total_coupons = d.total_coupons.saturating_sub(expired);
        d.total_redeemable += redeemable_mint;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MockState {
    world: World,
    block: u64,
    accounts: Vec<Address>,
    nonces: HashMap<Address, u64>,
    receipts: HashMap<String, Receipt>,
    logs: Vec<(Address, TransferLog)>,
    submitted: Vec<TxRequest>,
    tx_counter: u64,
    injected_errors: VecDeque<String>,
    read_errors: VecDeque<String>,
    reverts: HashMap<&'static str, u32>,
    hide_receipts: bool,
}

impl MockState {
    /// Mine the world's pending Transfer events into a fresh block.
    fn mine_block(&mut self) -> u64 {
        self.block += 1;
        let block = self.block;
        for (i, (token, from, to, value)) in self.world.pending_logs.drain(..).enumerate() {
            self.logs.push((
                token,
                TransferLog {
                    block,
                    log_index: i as u64,
                    from,
                    to,
                    value,
                },
            ));
        }
        block
    }

    fn direct<F>(&mut self, f: F) -> Result<(), ChainError>
    where
        F: FnOnce(&mut World) -> Result<(), Revert>,
    {
        let mut scratch = self.world.clone();
        f(&mut scratch).map_err(|reason| ChainError::Rpc {
            code: -32000,
            message: format!("mock setup failed: {}", reason),
        })?;
        self.world = scratch;
        self.mine_block();
        Ok(())
    }
}

/// Thread-safe in-memory chain.
#[derive(Debug, Default)]
pub struct MockChain {
    state: Mutex<MockState>,
}

impl MockChain {
    pub fn new() -> Self {
        MockChain::default()
    }

    /// The full deployment described by `contracts`, with an empty pool.
    pub fn deploy(contracts: &ContractSettings) -> Self {
        let chain = MockChain::new();
        {
            let mut state = chain.lock();
            let world = &mut state.world;
            world.tokens.insert(
                contracts.usdc.address,
                Erc20 {
                    decimals: contracts.usdc.decimals,
                    mintable: true,
                    ..Erc20::default()
                },
            );
            world.tokens.insert(
                contracts.xsd.address,
                Erc20 {
                    decimals: contracts.xsd.decimals,
                    ..Erc20::default()
                },
            );
            world.tokens.insert(
                contracts.pair.address,
                Erc20 {
                    decimals: contracts.pair.decimals,
                    ..Erc20::default()
                },
            );
            world.tokens.insert(
                contracts.dao,
                Erc20 {
                    decimals: 18,
                    ..Erc20::default()
                },
            );
            let (token0, token1) = if contracts.usdc.address < contracts.xsd.address {
                (contracts.usdc.address, contracts.xsd.address)
            } else {
                (contracts.xsd.address, contracts.usdc.address)
            };
            world.pair = Some(Pair {
                address: contracts.pair.address,
                token0,
                token1,
                reserve0: U256::ZERO,
                reserve1: U256::ZERO,
            });
            world.router = contracts.router;
            world.dao = Some(Dao {
                address: contracts.dao,
                xsd: contracts.xsd.address,
                usd: contracts.usdc.address,
                epoch: 0,
                total_redeemable: U256::ZERO,
                total_coupons: U256::ZERO,
                bonded: U256::ZERO,
                coupons: HashMap::new(),
                assigned: HashMap::new(),
                staged: HashMap::new(),
                expansion_bps: 100,
            });
        }
        chain
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_accounts(&self, accounts: &[Address]) {
        self.lock().accounts = accounts.to_vec();
    }

    /// Faucet mint outside any transaction, in its own block.
    pub fn mint(&self, token: Address, to: Address, amount: U256) -> Result<(), ChainError> {
        self.lock().direct(|w| w.mint(token, to, amount))
    }

    /// Direct token transfer outside any transaction, in its own block.
    pub fn transfer(
        &self,
        token: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> Result<(), ChainError> {
        self.lock().direct(|w| w.transfer(token, from, to, amount))
    }

    /// Mint both pool tokens straight into the pair and LP shares to `provider`.
    pub fn seed_pool(
        &self,
        provider: Address,
        usd_amount: U256,
        xsd_amount: U256,
    ) -> Result<(), ChainError> {
        self.lock().direct(|w| {
            let dao = w.dao.clone().ok_or("no dao deployed")?;
            let pair = w.pair.clone().ok_or("no pair deployed")?;
            w.mint(dao.usd, pair.address, usd_amount)?;
            w.mint(dao.xsd, pair.address, xsd_amount)?;
            let (ru, rx) = w.ordered_reserves(dao.usd, dao.xsd)?;
            w.set_ordered_reserves(dao.usd, ru + usd_amount, rx + xsd_amount)?;
            let liquidity = (usd_amount * xsd_amount).root(2);
            w.mint(pair.address, provider, liquidity)
        })
    }

    pub fn set_epoch(&self, epoch: u64) {
        if let Some(dao) = self.lock().world.dao.as_mut() {
            dao.epoch = epoch;
        }
    }

    /// Mint `amount` xSD to the DAO and make it redeemable.
    pub fn fund_redeemable(&self, amount: U256) -> Result<(), ChainError> {
        self.lock().direct(|w| {
            let dao = w.dao.clone().ok_or("no dao deployed")?;
            w.mint(dao.xsd, dao.address, amount)?;
            w.dao_mut()?.total_redeemable += amount;
            Ok(())
        })
    }

    /// Assign coupons as if a bid had cleared.
    pub fn grant_coupons(&self, account: Address, expiry_epoch: u64, amount: U256) {
        if let Some(dao) = self.lock().world.dao.as_mut() {
            *dao.coupons.entry((account, expiry_epoch)).or_default() += amount;
            dao.assigned.entry(account).or_default().push(expiry_epoch);
            dao.total_coupons += amount;
        }
    }

    pub fn set_expansion_bps(&self, bps: u64) {
        if let Some(dao) = self.lock().world.dao.as_mut() {
            dao.expansion_bps = bps;
        }
    }

    /// The next submission fails at the RPC layer with `message`, without
    /// consuming a nonce.
    pub fn inject_submit_error(&self, message: &str) {
        self.lock().injected_errors.push_back(message.to_string());
    }

    /// The next contract read fails at the RPC layer with `message`.
    pub fn inject_read_error(&self, message: &str) {
        self.lock().read_errors.push_back(message.to_string());
    }

    /// The next `count` transactions of this call kind are mined but revert.
    pub fn revert_next(&self, call_name: &'static str, count: u32) {
        *self.lock().reverts.entry(call_name).or_default() += count;
    }

    /// Hide receipts to simulate a stalled transaction.
    pub fn set_receipts_visible(&self, visible: bool) {
        self.lock().hide_receipts = !visible;
    }

    pub fn submitted(&self) -> Vec<TxRequest> {
        self.lock().submitted.clone()
    }

    pub fn count_calls(&self, call_name: &str) -> usize {
        self.lock()
            .submitted
            .iter()
            .filter(|tx| tx.call.name() == call_name)
            .count()
    }

    pub fn allowance(&self, token: Address, owner: Address, spender: Address) -> U256 {
        self.lock()
            .world
            .tokens
            .get(&token)
            .and_then(|t| t.allowances.get(&(owner, spender)).copied())
            .unwrap_or_default()
    }

    fn read_world<T>(&self, f: impl FnOnce(&World) -> Result<T, Revert>) -> Result<T, ChainError> {
        let mut state = self.lock();
        if let Some(message) = state.read_errors.pop_front() {
            return Err(ChainError::Rpc {
                code: -32000,
                message,
            });
        }
        f(&state.world).map_err(|reason| ChainError::Rpc {
            code: 3,
            message: format!("execution reverted: {}", reason),
        })
    }
}

impl ChainClient for MockChain {
    fn block_number(&self) -> Result<u64, ChainError> {
        Ok(self.lock().block)
    }

    fn transaction_count(&self, account: Address) -> Result<u64, ChainError> {
        Ok(self.lock().nonces.get(&account).copied().unwrap_or(0))
    }

    fn accounts(&self) -> Result<Vec<Address>, ChainError> {
        Ok(self.lock().accounts.clone())
    }

    fn balance_of(&self, token: Address, owner: Address) -> Result<U256, ChainError> {
        self.read_world(|w| {
            w.tokens
                .get(&token)
                .map(|t| t.balance(&owner))
                .ok_or_else(|| format!("no token at {}", token))
        })
    }

    fn balance_of_at(&self, token: Address, owner: Address, block: u64) -> Result<U256, ChainError> {
        let state = self.lock();
        let current = state
            .world
            .tokens
            .get(&token)
            .map(|t| t.balance(&owner))
            .ok_or_else(|| ChainError::Rpc {
                code: 3,
                message: format!("execution reverted: no token at {}", token),
            })?;
        let (mut sent, mut received) = (U256::ZERO, U256::ZERO);
        for (_, log) in state.logs.iter().filter(|(t, log)| *t == token && log.block > block) {
            if log.from == owner {
                sent += log.value;
            }
            if log.to == owner {
                received += log.value;
            }
        }
        (current + sent)
            .checked_sub(received)
            .ok_or_else(|| ChainError::Decode(format!("history of {} does not reach block {}", owner, block)))
    }

    fn total_supply(&self, token: Address) -> Result<U256, ChainError> {
        self.read_world(|w| {
            w.tokens
                .get(&token)
                .map(|t| t.total_supply)
                .ok_or_else(|| format!("no token at {}", token))
        })
    }

    fn decimals(&self, token: Address) -> Result<u8, ChainError> {
        self.read_world(|w| {
            w.tokens
                .get(&token)
                .map(|t| t.decimals)
                .ok_or_else(|| format!("no token at {}", token))
        })
    }

    fn transfer_logs(
        &self,
        token: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferLog>, ChainError> {
        Ok(self
            .lock()
            .logs
            .iter()
            .filter(|(t, log)| *t == token && log.block >= from_block && log.block <= to_block)
            .map(|(_, log)| log.clone())
            .collect())
    }

    fn get_reserves(&self, pair: Address) -> Result<(U256, U256), ChainError> {
        self.read_world(|w| match &w.pair {
            Some(p) if p.address == pair => Ok((p.reserve0, p.reserve1)),
            _ => Err(format!("no pair at {}", pair)),
        })
    }

    fn token0(&self, pair: Address) -> Result<Address, ChainError> {
        self.read_world(|w| match &w.pair {
            Some(p) if p.address == pair => Ok(p.token0),
            _ => Err(format!("no pair at {}", pair)),
        })
    }

    fn get_amounts_out(
        &self,
        router: Address,
        amount_in: U256,
        path: &[Address],
    ) -> Result<Vec<U256>, ChainError> {
        self.read_world(|w| {
            if w.router != router {
                return Err(format!("no router at {}", router));
            }
            let [token_in, token_out] = path else {
                return Err("INVALID_PATH".to_string());
            };
            let (r_in, r_out) = w.ordered_reserves(*token_in, *token_out)?;
            Ok(vec![amount_in, get_amount_out(amount_in, r_in, r_out)?])
        })
    }

    fn epoch(&self, dao: Address) -> Result<u64, ChainError> {
        self.read_world(|w| match &w.dao {
            Some(d) if d.address == dao => Ok(d.epoch),
            _ => Err(format!("no dao at {}", dao)),
        })
    }

    fn total_coupons(&self, dao: Address) -> Result<U256, ChainError> {
        self.read_world(|w| match &w.dao {
            Some(d) if d.address == dao => Ok(d.total_coupons),
            _ => Err(format!("no dao at {}", dao)),
        })
    }

    fn total_redeemable(&self, dao: Address) -> Result<U256, ChainError> {
        self.read_world(|w| match &w.dao {
            Some(d) if d.address == dao => Ok(d.total_redeemable),
            _ => Err(format!("no dao at {}", dao)),
        })
    }

    fn balance_of_coupons(
        &self,
        dao: Address,
        account: Address,
        epoch: u64,
    ) -> Result<U256, ChainError> {
        self.read_world(|w| match &w.dao {
            Some(d) if d.address == dao => {
                Ok(d.coupons.get(&(account, epoch)).copied().unwrap_or_default())
            }
            _ => Err(format!("no dao at {}", dao)),
        })
    }

    fn coupons_current_assigned_index(
        &self,
        dao: Address,
        account: Address,
    ) -> Result<u64, ChainError> {
        self.read_world(|w| match &w.dao {
            Some(d) if d.address == dao => {
                Ok(d.assigned.get(&account).map(|v| v.len() as u64).unwrap_or(0))
            }
            _ => Err(format!("no dao at {}", dao)),
        })
    }

    fn coupons_assigned_at_epoch(
        &self,
        dao: Address,
        account: Address,
        index: u64,
    ) -> Result<u64, ChainError> {
        self.read_world(|w| match &w.dao {
            Some(d) if d.address == dao => d
                .assigned
                .get(&account)
                .and_then(|v| v.get(index as usize).copied())
                .ok_or_else(|| format!("no coupon assignment {} for {}", index, account)),
            _ => Err(format!("no dao at {}", dao)),
        })
    }

    fn balance_of_staged(&self, dao: Address, account: Address) -> Result<U256, ChainError> {
        self.read_world(|w| match &w.dao {
            Some(d) if d.address == dao => Ok(d.staged.get(&account).copied().unwrap_or_default()),
            _ => Err(format!("no dao at {}", dao)),
        })
    }

    fn send_transaction(&self, tx: &TxRequest) -> Result<String, ChainError> {
        let mut state = self.lock();

        if let Some(message) = state.injected_errors.pop_front() {
            return Err(ChainError::Rpc {
                code: -32000,
                message,
            });
        }

        let expected = state.nonces.get(&tx.from).copied().unwrap_or(0);
        if tx.nonce < expected {
            return Err(ChainError::Rpc {
                code: -32000,
                message: format!("nonce too low: next nonce {}, tx nonce {}", expected, tx.nonce),
            });
        }
        if tx.nonce > expected {
            return Err(ChainError::Rpc {
                code: -32000,
                message: format!("nonce too high: next nonce {}, tx nonce {}", expected, tx.nonce),
            });
        }
        state.nonces.insert(tx.from, expected + 1);

        let forced_revert = match state.reverts.get_mut(tx.call.name()) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        };

        let mut scratch = state.world.clone();
        let status = !forced_revert && scratch.apply(tx.from, tx.to, &tx.call).is_ok();
        if status {
            state.world = scratch;
        }
        let block = state.mine_block();

        state.tx_counter += 1;
        let hash = format!("0x{:064x}", state.tx_counter);
        state.receipts.insert(
            hash.clone(),
            Receipt {
                tx: hash.clone(),
                block,
                status,
            },
        );
        state.submitted.push(tx.clone());
        Ok(hash)
    }

    fn transaction_receipt(&self, tx: &str) -> Result<Option<Receipt>, ChainError> {
        let state = self.lock();
        if state.hide_receipts {
            return Ok(None);
        }
        Ok(state.receipts.get(tx).cloned())
    }
}
