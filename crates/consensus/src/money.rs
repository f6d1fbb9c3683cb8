//! Monetary units and money range rules.

/// Minor-unit amount. All persisted values use this, never floating point.
pub type Amount = i64;

pub const COIN: Amount = 100_000_000;
pub const COIN_DECIMALS: usize = 8;

/// No amount larger than this is valid.
pub const MAX_MONEY: Amount = 83_540_184 * COIN;

pub fn money_range(value: Amount) -> bool {
    (0..=MAX_MONEY).contains(&value)
}

/// Parses a decimal coin string (`"1.5"`, `"-0.00000001"`, `"2e-8"`) into minor units.
///
/// Digits past the eighth decimal place must be zero; anything else is rejected
/// rather than rounded.
pub fn parse_coin_amount(raw: &str) -> Option<Amount> {
    let raw = raw.trim();
    let (negative, unsigned) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let (mantissa, exponent) = match unsigned.find(['e', 'E']) {
        Some(idx) => (&unsigned[..idx], unsigned[idx + 1..].parse::<i32>().ok()?),
        None => (unsigned, 0),
    };
    let (int_part, frac_part) = match mantissa.split_once('.') {
        Some((int_part, frac_part)) => (int_part, frac_part),
        None => (mantissa, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.bytes().all(|b| b.is_ascii_digit()) || !frac_part.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }

    let mut digits: String = format!("{int_part}{frac_part}");
    let scale = COIN_DECIMALS as i32 - frac_part.len() as i32 + exponent;
    if scale >= 0 {
        digits.extend(std::iter::repeat('0').take(scale as usize));
    } else {
        let cut = (-scale) as usize;
        if cut > digits.len() {
            if digits.bytes().any(|b| b != b'0') {
                return None;
            }
            digits.clear();
        } else {
            let (kept, dropped) = digits.split_at(digits.len() - cut);
            if dropped.bytes().any(|b| b != b'0') {
                return None;
            }
            digits = kept.to_string();
        }
    }
    let digits = digits.trim_start_matches('0');
    let value: Amount = if digits.is_empty() {
        0
    } else {
        digits.parse().ok()?
    };
    Some(if negative { -value } else { value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_decimals() {
        assert_eq!(parse_coin_amount("1"), Some(COIN));
        assert_eq!(parse_coin_amount("0.00000003"), Some(3));
        assert_eq!(parse_coin_amount("103.5"), Some(10_350_000_000));
        assert_eq!(parse_coin_amount(".25"), Some(25_000_000));
        assert_eq!(parse_coin_amount("-0.1"), Some(-10_000_000));
    }

    #[test]
    fn parses_exponent_forms() {
        assert_eq!(parse_coin_amount("3e-8"), Some(3));
        assert_eq!(parse_coin_amount("1.5E2"), Some(150 * COIN));
        assert_eq!(parse_coin_amount("1e-10"), None);
    }

    #[test]
    fn rejects_sub_unit_precision_and_garbage() {
        assert_eq!(parse_coin_amount("0.000000001"), None);
        assert_eq!(parse_coin_amount("0.000000010"), Some(1));
        assert_eq!(parse_coin_amount("abc"), None);
        assert_eq!(parse_coin_amount(""), None);
        assert_eq!(parse_coin_amount("."), None);
    }

    #[test]
    fn money_range_bounds() {
        assert!(money_range(0));
        assert!(money_range(MAX_MONEY));
        assert!(!money_range(-1));
        assert!(!money_range(MAX_MONEY + 1));
    }
}
