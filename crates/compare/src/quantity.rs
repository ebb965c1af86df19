//! Kubernetes resource quantities, normalized to integer nano-units so
//! `500m`, `0.5`, and `5e-1` compare equal while `1Gi` and `1G` do not.

/// Parse a quantity string into nano-units. Sub-nano precision is
/// truncated. Returns `None` for anything that is not a quantity.
pub fn parse_quantity(s: &str) -> Option<i128> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (number, factor_num, factor_den) = split_suffix(s)?;
    let nanos = decimal_nanos(number)?;
    nanos.checked_mul(factor_num).map(|v| v / factor_den)
}

/// True when both strings parse as quantities with the same value.
pub fn quantities_equal(a: &str, b: &str) -> bool {
    match (parse_quantity(a), parse_quantity(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// Split the trailing unit suffix off, returning the numeric part and
/// the suffix as a rational factor.
fn split_suffix(s: &str) -> Option<(&str, i128, i128)> {
    const KI: i128 = 1024;
    for (suffix, num, den) in [
        ("Ki", KI, 1),
        ("Mi", KI * KI, 1),
        ("Gi", KI * KI * KI, 1),
        ("Ti", KI * KI * KI * KI, 1),
        ("Pi", KI * KI * KI * KI * KI, 1),
        ("Ei", KI * KI * KI * KI * KI * KI, 1),
        ("m", 1, 1000),
        ("k", 1_000, 1),
        ("M", 1_000_000, 1),
        ("G", 1_000_000_000, 1),
        ("T", 1_000_000_000_000, 1),
        ("P", 1_000_000_000_000_000, 1),
        ("E", 1_000_000_000_000_000_000, 1),
    ] {
        if let Some(number) = s.strip_suffix(suffix) {
            if number.is_empty() {
                return None;
            }
            // A trailing E is an exponent, not exa, when the remainder
            // already fails to parse as a full number (e.g. "2e3").
            if suffix == "E" && !number.bytes().last().is_some_and(|b| b.is_ascii_digit()) {
                continue;
            }
            return Some((number, num, den));
        }
    }
    Some((s, 1, 1))
}

/// Decimal string (optional sign, fraction, exponent) to nano-units.
fn decimal_nanos(s: &str) -> Option<i128> {
    let (sign, s) = match s.as_bytes().first()? {
        b'-' => (-1i128, &s[1..]),
        b'+' => (1i128, &s[1..]),
        _ => (1i128, s),
    };
    let (mantissa, exp) = match s.split_once(['e', 'E']) {
        Some((m, e)) => (m, e.parse::<i32>().ok()?),
        None => (s, 0),
    };
    let (int_part, frac_part) = match mantissa.split_once('.') {
        Some((i, f)) => (i, f),
        None => (mantissa, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.bytes().all(|b| b.is_ascii_digit())
        || !frac_part.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    let digits = format!("{}{}", int_part, frac_part);
    let mut value: i128 = 0;
    for b in digits.bytes() {
        value = value.checked_mul(10)?.checked_add((b - b'0') as i128)?;
    }
    // Shift into nano scale: 10^(9 + exp - fraction digits).
    let shift = 9 + exp as i64 - frac_part.len() as i64;
    if shift >= 0 {
        for _ in 0..shift {
            value = value.checked_mul(10)?;
        }
    } else {
        for _ in 0..(-shift) {
            value /= 10;
        }
    }
    Some(sign * value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn milli_and_decimal_forms_agree() {
        assert!(quantities_equal("500m", "0.5"));
        assert!(quantities_equal("100m", "0.1"));
        assert!(quantities_equal("1500m", "1.5"));
        assert!(quantities_equal("2", "2000m"));
        assert!(quantities_equal("5e-1", "500m"));
    }

    #[test]
    fn binary_and_decimal_suffixes_differ() {
        assert!(quantities_equal("1Gi", "1024Mi"));
        assert!(quantities_equal("1G", "1000M"));
        assert!(!quantities_equal("1Gi", "1G"));
        assert!(quantities_equal("1Ki", "1024"));
    }

    #[test]
    fn exponent_form_is_not_exa() {
        assert!(quantities_equal("2e3", "2k"));
        assert!(quantities_equal("1E", "1000P"));
    }

    #[test]
    fn non_quantities_never_compare_equal() {
        assert!(!quantities_equal("fast", "fast"));
        assert!(!quantities_equal("1Gi", ""));
        assert_eq!(parse_quantity("Gi"), None);
        assert_eq!(parse_quantity("1.2.3"), None);
    }

    #[test]
    fn negative_and_signed_values_parse() {
        assert!(quantities_equal("-500m", "-0.5"));
        assert!(quantities_equal("+1", "1000m"));
    }
}
