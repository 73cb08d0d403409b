//! conversion between human-readable token amounts and scaled integers

use alloy_primitives::U256;

use crate::error::UnitsError;

/// U256 holds at most 77 full decimal digits
const MAX_DECIMALS: u8 = 77;

fn scale(decimals: u8) -> Result<U256, UnitsError> {
    if decimals > MAX_DECIMALS {
        return Err(UnitsError::DecimalsOutOfRange(decimals));
    }
    Ok(U256::from(10u8).pow(U256::from(decimals)))
}

fn push_digit(acc: U256, c: char) -> Result<U256, UnitsError> {
    let digit = c.to_digit(10).ok_or(UnitsError::InvalidCharacter(c))?;
    acc.checked_mul(U256::from(10u8))
        .and_then(|v| v.checked_add(U256::from(digit)))
        .ok_or(UnitsError::Overflow)
}

/// parse a decimal string into a value scaled by `decimals`
///
/// `"1.5"` at 18 decimals is `1_500_000_000_000_000_000`. fractional digits
/// beyond `decimals` are an error rather than silently dropped.
pub fn parse_units(text: &str, decimals: u8) -> Result<U256, UnitsError> {
    let unit = scale(decimals)?;
    let text = text.trim();
    if text.is_empty() || text == "." {
        return Err(UnitsError::Empty);
    }

    let mut parts = text.split('.');
    let whole = parts.next().unwrap_or_default();
    let frac = parts.next().unwrap_or_default();
    if parts.next().is_some() {
        return Err(UnitsError::MultipleDecimalPoints);
    }
    if frac.len() > decimals as usize {
        return Err(UnitsError::TooManyDecimals {
            got: frac.len(),
            max: decimals,
        });
    }

    let whole_value = whole.chars().try_fold(U256::ZERO, push_digit)?;
    let frac_value = frac.chars().try_fold(U256::ZERO, push_digit)?;
    let frac_scale = scale(decimals - frac.len() as u8)?;

    whole_value
        .checked_mul(unit)
        .and_then(|w| frac_value.checked_mul(frac_scale).and_then(|f| w.checked_add(f)))
        .ok_or(UnitsError::Overflow)
}

/// render a scaled value with at most `max_fraction` fractional digits
///
/// digits past `max_fraction` are truncated, never rounded up, and trailing
/// zeros are dropped: `1_234_567_000_000_000_000` at (18, 4) is `"1.2345"`.
pub fn format_units(value: U256, decimals: u8, max_fraction: u8) -> String {
    let Ok(unit) = scale(decimals) else {
        return value.to_string();
    };
    let whole = value / unit;
    let frac = value % unit;

    let shown = max_fraction.min(decimals) as usize;
    if shown == 0 || frac.is_zero() {
        return whole.to_string();
    }

    let digits = format!("{:0>width$}", frac.to_string(), width = decimals as usize);
    let trimmed = digits[..shown].trim_end_matches('0');
    if trimmed.is_empty() {
        whole.to_string()
    } else {
        format!("{}.{}", whole, trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ETHER: u128 = 1_000_000_000_000_000_000;

    #[test]
    fn test_parse_whole_and_fraction() {
        assert_eq!(parse_units("1", 18).unwrap(), U256::from(ETHER));
        assert_eq!(parse_units("1.5", 18).unwrap(), U256::from(ETHER + ETHER / 2));
        assert_eq!(parse_units(".5", 18).unwrap(), U256::from(ETHER / 2));
        assert_eq!(parse_units("2.", 6).unwrap(), U256::from(2_000_000u64));
        assert_eq!(parse_units(" 0.000001 ", 6).unwrap(), U256::from(1u64));
        assert_eq!(parse_units("42", 0).unwrap(), U256::from(42u64));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert_eq!(parse_units("", 18), Err(UnitsError::Empty));
        assert_eq!(parse_units(".", 18), Err(UnitsError::Empty));
        assert_eq!(parse_units("-1", 18), Err(UnitsError::InvalidCharacter('-')));
        assert_eq!(parse_units("1e5", 18), Err(UnitsError::InvalidCharacter('e')));
        assert_eq!(parse_units("1.2.3", 18), Err(UnitsError::MultipleDecimalPoints));
        assert_eq!(
            parse_units("0.1234567", 6),
            Err(UnitsError::TooManyDecimals { got: 7, max: 6 })
        );
        assert_eq!(parse_units("1", 78), Err(UnitsError::DecimalsOutOfRange(78)));
    }

    #[test]
    fn test_parse_overflow() {
        let huge = "9".repeat(80);
        assert_eq!(parse_units(&huge, 0), Err(UnitsError::Overflow));
        assert_eq!(parse_units(&U256::MAX.to_string(), 1), Err(UnitsError::Overflow));
        assert_eq!(parse_units(&U256::MAX.to_string(), 0).unwrap(), U256::MAX);
    }

    #[test]
    fn test_format_truncates() {
        let v = U256::from(1_234_567_000_000_000_000u128);
        assert_eq!(format_units(v, 18, 4), "1.2345");
        assert_eq!(format_units(v, 18, 18), "1.234567");
        assert_eq!(format_units(v, 18, 0), "1");
        assert_eq!(format_units(U256::from(ETHER), 18, 4), "1");
        assert_eq!(format_units(U256::from(1u64), 18, 4), "0");
        assert_eq!(format_units(U256::ZERO, 18, 4), "0");
        assert_eq!(format_units(U256::from(1_500_000u64), 6, 2), "1.5");
    }
}
