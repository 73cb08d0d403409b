//! checked integer arithmetic over token-scaled values
//!
//! every pool quantity is an integer scaled by the token's decimals. products
//! are taken before quotients (`a * b / c`) and go through a 512-bit
//! accumulator, so the only way to fail is a result that does not fit back
//! into 256 bits. nothing here wraps.

use alloy_primitives::{Uint, U256};

use crate::error::{MathError, Result};

type U512 = Uint<512, 8>;

/// basis-100 denominator used by every percentage in the pool
pub const PERCENT: U256 = U256::from_limbs([100, 0, 0, 0]);

fn widen(x: U256) -> U512 {
    let l = x.as_limbs();
    U512::from_limbs([l[0], l[1], l[2], l[3], 0, 0, 0, 0])
}

fn narrow(x: U512) -> Result<U256> {
    let l = x.as_limbs();
    if l[4..].iter().any(|&limb| limb != 0) {
        return Err(MathError::ArithmeticOverflow);
    }
    Ok(U256::from_limbs([l[0], l[1], l[2], l[3]]))
}

/// `a * b / c`, truncating toward zero
pub fn mul_div(a: U256, b: U256, c: U256) -> Result<U256> {
    if c.is_zero() {
        return Err(MathError::DivisionByZero);
    }
    // both factors are below 2^256 so the wide product cannot wrap
    narrow(widen(a) * widen(b) / widen(c))
}

/// `a * b / c`, rounding up
pub fn mul_div_ceil(a: U256, b: U256, c: U256) -> Result<U256> {
    if c.is_zero() {
        return Err(MathError::DivisionByZero);
    }
    let product = widen(a) * widen(b);
    let divisor = widen(c);
    let quotient = product / divisor;
    if (product % divisor).is_zero() {
        narrow(quotient)
    } else {
        narrow(quotient + U512::from_limbs([1, 0, 0, 0, 0, 0, 0, 0]))
    }
}

/// `value * pct / 100`
pub fn percent_of(value: U256, pct: U256) -> Result<U256> {
    mul_div(value, pct, PERCENT)
}

/// `num * 100 / den`, the basis-100 ratio of two amounts
pub fn ratio_percent(num: U256, den: U256) -> Result<U256> {
    mul_div(num, PERCENT, den)
}

pub fn checked_add(a: U256, b: U256) -> Result<U256> {
    a.checked_add(b).ok_or(MathError::ArithmeticOverflow)
}

/// subtraction that treats going below zero as overflow
pub fn checked_sub(a: U256, b: U256) -> Result<U256> {
    a.checked_sub(b).ok_or(MathError::ArithmeticOverflow)
}

/// subtraction floored at zero, for bounds that are allowed to bottom out
pub fn saturating_sub(a: U256, b: U256) -> U256 {
    a.saturating_sub(b)
}
