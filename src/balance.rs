//! Exact fixed-point token amounts.
//!
//! A `Balance` is a raw on-chain integer tagged with its decimal scale. Two
//! balances only combine when their scales agree; scalars only ever touch the
//! raw units. Nothing in here goes through floating point except `to_f64`,
//! which exists for display and strategy weighting.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Div, Mul, Sub};

use alloy::primitives::U256;

use crate::error::BalanceError;

/// Parts-per-million resolution used when sizing a commitment.
const PPM: u64 = 1_000_000;

/// 10^77 is the largest power of ten a U256 holds.
fn pow10(exp: usize) -> Result<U256, BalanceError> {
    U256::from(10u64)
        .checked_pow(U256::from(exp))
        .ok_or(BalanceError::Overflow)
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Balance {
    raw: U256,
    scale: u8,
}

impl Balance {
    pub fn new(raw: U256, scale: u8) -> Self {
        Balance { raw, scale }
    }

    /// Raw units that fit a machine word, e.g. `from_raw(5, 6)` is 0.000005.
    pub fn from_raw(raw: u64, scale: u8) -> Self {
        Balance::new(U256::from(raw), scale)
    }

    pub fn zero(scale: u8) -> Self {
        Balance::new(U256::ZERO, scale)
    }

    /// Exactly one whole token at this scale.
    pub fn one(scale: u8) -> Result<Self, BalanceError> {
        Ok(Balance::new(pow10(scale as usize)?, scale))
    }

    /// Parse a human-readable token count such as `"1500.25"`. Digits past
    /// `scale` are truncated.
    pub fn from_tokens(human: &str, scale: u8) -> Result<Self, BalanceError> {
        let parse_err = |reason: &str| BalanceError::Parse {
            input: human.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = human.trim().replace('_', "");
        if trimmed.is_empty() {
            return Err(parse_err("empty"));
        }
        let (whole, frac) = match trimmed.split_once('.') {
            Some((w, f)) => (w, f),
            None => (trimmed.as_str(), ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(parse_err("no digits"));
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit())
        {
            return Err(parse_err("expected an unsigned decimal number"));
        }

        let mut frac_digits: String = frac.chars().take(scale as usize).collect();
        while frac_digits.len() < scale as usize {
            frac_digits.push('0');
        }
        let digits = format!("{}{}", whole, frac_digits);
        let digits = digits.trim_start_matches('0');
        let raw = if digits.is_empty() {
            U256::ZERO
        } else {
            digits.parse::<U256>().map_err(|_| BalanceError::Overflow)?
        };
        Ok(Balance::new(raw, scale))
    }

    /// Whole tokens, e.g. `from_whole(500, 6)` is 500.000000.
    pub fn from_whole(tokens: u64, scale: u8) -> Result<Self, BalanceError> {
        U256::from(tokens)
            .checked_mul(pow10(scale as usize)?)
            .map(|raw| Balance::new(raw, scale))
            .ok_or(BalanceError::Overflow)
    }

    pub fn decimals(&self) -> u8 {
        self.scale
    }

    pub fn to_wei(&self) -> U256 {
        self.raw
    }

    pub fn is_zero(&self) -> bool {
        self.raw.is_zero()
    }

    fn check_scale(&self, other: &Balance) -> Result<(), BalanceError> {
        if self.scale != other.scale {
            return Err(BalanceError::ScaleMismatch {
                left: self.scale,
                right: other.scale,
            });
        }
        Ok(())
    }

    pub fn try_add(&self, other: &Balance) -> Result<Balance, BalanceError> {
        self.check_scale(other)?;
        let raw = self.raw.checked_add(other.raw).ok_or(BalanceError::Overflow)?;
        Ok(Balance::new(raw, self.scale))
    }

    pub fn try_sub(&self, other: &Balance) -> Result<Balance, BalanceError> {
        self.check_scale(other)?;
        let raw = self.raw.checked_sub(other.raw).ok_or(BalanceError::Underflow)?;
        Ok(Balance::new(raw, self.scale))
    }

    /// `self - other`, clamped at zero.
    pub fn saturating_sub(&self, other: &Balance) -> Result<Balance, BalanceError> {
        self.check_scale(other)?;
        Ok(Balance::new(self.raw.saturating_sub(other.raw), self.scale))
    }

    pub fn try_add_assign(&mut self, other: &Balance) -> Result<(), BalanceError> {
        self.raw = self.try_add(other)?.raw;
        Ok(())
    }

    pub fn try_sub_assign(&mut self, other: &Balance) -> Result<(), BalanceError> {
        self.raw = self.try_sub(other)?.raw;
        Ok(())
    }

    pub fn mul_scalar(&self, k: U256) -> Result<Balance, BalanceError> {
        let raw = self.raw.checked_mul(k).ok_or(BalanceError::Overflow)?;
        Ok(Balance::new(raw, self.scale))
    }

    /// Floor division of the raw units.
    pub fn div_scalar(&self, k: U256) -> Result<Balance, BalanceError> {
        if k.is_zero() {
            return Err(BalanceError::DivisionByZero);
        }
        Ok(Balance::new(self.raw / k, self.scale))
    }

    /// Multiply by the dimensionless ratio `num / den` of two balances of the
    /// same scale, flooring. The result keeps `self`'s scale.
    pub fn scale_by(&self, num: &Balance, den: &Balance) -> Result<Balance, BalanceError> {
        num.check_scale(den)?;
        if den.raw.is_zero() {
            return Err(BalanceError::DivisionByZero);
        }
        let product = self.raw.checked_mul(num.raw).ok_or(BalanceError::Overflow)?;
        Ok(Balance::new(product / den.raw, self.scale))
    }

    /// Multiply by `(10_000 - bps) / 10_000`, e.g. a 1% slippage floor.
    pub fn less_bps(&self, bps: u32) -> Result<Balance, BalanceError> {
        if bps > 10_000 {
            return Err(BalanceError::InvalidOperation("basis points above 10000"));
        }
        self.mul_scalar(U256::from(10_000 - bps))?
            .div_scalar(U256::from(10_000u64))
    }

    /// Multiply by `(10_000 + bps) / 10_000`.
    pub fn plus_bps(&self, bps: u32) -> Result<Balance, BalanceError> {
        self.mul_scalar(U256::from(10_000 + bps))?
            .div_scalar(U256::from(10_000u64))
    }

    /// The part of this balance an agent commits for a `fraction` in [0, 1].
    /// If at most one whole token would be left behind, the whole balance is
    /// used instead so no dust remains.
    pub fn portion(&self, fraction: f64) -> Result<Balance, BalanceError> {
        if !fraction.is_finite() || fraction < 0.0 {
            return Err(BalanceError::InvalidOperation("fraction must be finite and non-negative"));
        }
        let ppm = (fraction.min(1.0) * PPM as f64).floor() as u64;
        let part = self.mul_scalar(U256::from(ppm))?.div_scalar(U256::from(PPM))?;
        let left = self.raw.saturating_sub(part.raw);
        if left <= pow10(self.scale as usize)? {
            Ok(*self)
        } else {
            Ok(part)
        }
    }

    pub fn try_cmp(&self, other: &Balance) -> Result<Ordering, BalanceError> {
        self.check_scale(other)?;
        Ok(self.raw.cmp(&other.raw))
    }

    pub fn try_min(&self, other: &Balance) -> Result<Balance, BalanceError> {
        Ok(match self.try_cmp(other)? {
            Ordering::Greater => *other,
            _ => *self,
        })
    }

    /// Rescale to `new_scale`. Scaling up is exact; scaling down floors away
    /// the remainder units.
    pub fn to_decimals(&self, new_scale: u8) -> Result<Balance, BalanceError> {
        match new_scale.cmp(&self.scale) {
            Ordering::Equal => Ok(*self),
            Ordering::Greater => {
                let factor = pow10((new_scale - self.scale) as usize)?;
                let raw = self.raw.checked_mul(factor).ok_or(BalanceError::Overflow)?;
                Ok(Balance::new(raw, new_scale))
            }
            Ordering::Less => {
                let raw = match pow10((self.scale - new_scale) as usize) {
                    Ok(factor) => self.raw / factor,
                    Err(_) => U256::ZERO,
                };
                Ok(Balance::new(raw, new_scale))
            }
        }
    }

    /// Approximate token count, for logs and strategy weights only.
    pub fn to_f64(&self) -> f64 {
        let raw: f64 = self.raw.to_string().parse().unwrap_or(f64::MAX);
        raw / 10f64.powi(self.scale as i32)
    }
}

impl PartialOrd for Balance {
    /// Balances of different scale are unordered.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.try_cmp(other).ok()
    }
}

impl Add for Balance {
    type Output = Result<Balance, BalanceError>;

    fn add(self, rhs: Balance) -> Self::Output {
        self.try_add(&rhs)
    }
}

impl Sub for Balance {
    type Output = Result<Balance, BalanceError>;

    fn sub(self, rhs: Balance) -> Self::Output {
        self.try_sub(&rhs)
    }
}

impl Mul<u64> for Balance {
    type Output = Result<Balance, BalanceError>;

    fn mul(self, rhs: u64) -> Self::Output {
        self.mul_scalar(U256::from(rhs))
    }
}

impl Div<u64> for Balance {
    type Output = Result<Balance, BalanceError>;

    fn div(self, rhs: u64) -> Self::Output {
        self.div_scalar(U256::from(rhs))
    }
}

impl Mul<U256> for Balance {
    type Output = Result<Balance, BalanceError>;

    fn mul(self, rhs: U256) -> Self::Output {
        self.mul_scalar(rhs)
    }
}

impl Div<U256> for Balance {
    type Output = Result<Balance, BalanceError>;

    fn div(self, rhs: U256) -> Self::Output {
        self.div_scalar(rhs)
    }
}

impl Mul<Balance> for Balance {
    type Output = Result<Balance, BalanceError>;

    fn mul(self, _rhs: Balance) -> Self::Output {
        Err(BalanceError::InvalidOperation("token amounts cannot be multiplied together"))
    }
}

impl Div<Balance> for Balance {
    type Output = Result<Balance, BalanceError>;

    fn div(self, _rhs: Balance) -> Self::Output {
        Err(BalanceError::InvalidOperation("token amounts cannot be divided by each other"))
    }
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = self.raw.to_string();
        let scale = self.scale as usize;
        if scale == 0 {
            return write!(f, "{}", digits);
        }
        let padded = if digits.len() <= scale {
            format!("{}{}", "0".repeat(scale + 1 - digits.len()), digits)
        } else {
            digits
        };
        let (whole, frac) = padded.split_at(padded.len() - scale);
        write!(f, "{}.{}", whole, frac)
    }
}

impl fmt::Debug for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Balance({}, {})", self.raw, self.scale)
    }
}
