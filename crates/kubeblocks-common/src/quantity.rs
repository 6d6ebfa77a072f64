//! Resource quantity normalization
//!
//! `100m`, `0.1` and `1e-1` are the same CPU request, and `1Gi` equals
//! `1024Mi`. Specs are normalized before comparison so that an equivalent
//! spelling never triggers an update.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::{Error, Result};

const NANO: i128 = 1_000_000_000;

const BINARY_SUFFIXES: [(&str, i128); 6] = [
    ("Ei", 1 << 60),
    ("Pi", 1 << 50),
    ("Ti", 1 << 40),
    ("Gi", 1 << 30),
    ("Mi", 1 << 20),
    ("Ki", 1 << 10),
];

/// Parse a quantity into nano-units
///
/// Supports binary suffixes (`Ki`..`Ei`), decimal suffixes (`n`, `u`, `m`,
/// `k`, `M`..`E`) and exponents (`1e3`).
pub fn parse_nanos(raw: &str) -> Result<i128> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(Error::validation("empty quantity"));
    }
    let invalid = || Error::validation(format!("invalid quantity: {}", raw));

    let (number, multiplier_nanos, exp) = split_suffix(s).ok_or_else(invalid)?;
    let (negative, digits) = match number.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, number.strip_prefix('+').unwrap_or(number)),
    };
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };
    if (int_part.is_empty() && frac_part.is_empty())
        || !int_part.chars().all(|c| c.is_ascii_digit())
        || !frac_part.chars().all(|c| c.is_ascii_digit())
    {
        return Err(invalid());
    }

    // mantissa as an integer scaled by 10^-frac_len
    let mantissa: i128 = format!("{}{}", int_part, frac_part)
        .parse()
        .map_err(|_| invalid())?;
    let scale = frac_part.len() as i32 - exp;

    let mut value = mantissa.checked_mul(multiplier_nanos).ok_or_else(invalid)?;
    if scale > 0 {
        let divisor = 10i128.checked_pow(scale as u32).ok_or_else(invalid)?;
        // round up, as Kubernetes does when dropping precision
        value = (value + divisor - 1) / divisor;
    } else if scale < 0 {
        let factor = 10i128.checked_pow((-scale) as u32).ok_or_else(invalid)?;
        value = value.checked_mul(factor).ok_or_else(invalid)?;
    }
    Ok(if negative { -value } else { value })
}

/// Returns (number, nanos per unit, decimal exponent)
fn split_suffix(s: &str) -> Option<(&str, i128, i32)> {
    for (suffix, factor) in BINARY_SUFFIXES {
        if let Some(number) = s.strip_suffix(suffix) {
            return Some((number, factor * NANO, 0));
        }
    }
    if let Some(idx) = s.find(['e', 'E']) {
        let (number, exp) = s.split_at(idx);
        // a trailing `E` is the exa suffix, not an exponent
        if let Ok(exp) = exp[1..].parse::<i32>() {
            return Some((number, NANO, exp));
        }
    }
    let last = s.chars().last()?;
    let exp = match last {
        'n' => -9,
        'u' => -6,
        'm' => -3,
        'k' => 3,
        'M' => 6,
        'G' => 9,
        'T' => 12,
        'P' => 15,
        'E' => 18,
        c if c.is_ascii_digit() || c == '.' => return Some((s, NANO, 0)),
        _ => return None,
    };
    Some((&s[..s.len() - last.len_utf8()], NANO, exp))
}

/// Canonical CPU string: whole cores when exact, else millicores rounded up
pub fn normalize_cpu(q: &Quantity) -> Result<Quantity> {
    let nanos = parse_nanos(&q.0)?;
    let milli = ceil_div(nanos, NANO / 1000);
    if milli % 1000 == 0 {
        Ok(Quantity(format!("{}", milli / 1000)))
    } else {
        Ok(Quantity(format!("{}m", milli)))
    }
}

/// Canonical byte string: the largest exact binary suffix, else plain bytes
pub fn normalize_binary(q: &Quantity) -> Result<Quantity> {
    let bytes = ceil_div(parse_nanos(&q.0)?, NANO);
    if bytes == 0 {
        return Ok(Quantity("0".to_string()));
    }
    for (suffix, factor) in BINARY_SUFFIXES {
        if bytes % factor == 0 {
            return Ok(Quantity(format!("{}{}", bytes / factor, suffix)));
        }
    }
    Ok(Quantity(format!("{}", bytes)))
}

fn ceil_div(a: i128, b: i128) -> i128 {
    if a >= 0 {
        (a + b - 1) / b
    } else {
        a / b
    }
}

/// Normalize every quantity in a resource list by its resource name
pub fn normalize_resource_list(
    list: &BTreeMap<String, Quantity>,
) -> Result<BTreeMap<String, Quantity>> {
    list.iter()
        .map(|(name, q)| {
            let normalized = match name.as_str() {
                "cpu" => normalize_cpu(q)?,
                "memory" | "storage" | "ephemeral-storage" => normalize_binary(q)?,
                _ => q.clone(),
            };
            Ok((name.clone(), normalized))
        })
        .collect()
}

/// Normalize requests and limits in place
pub fn normalize_requirements(resources: &mut ResourceRequirements) -> Result<()> {
    if let Some(limits) = resources.limits.as_mut() {
        *limits = normalize_resource_list(limits)?;
    }
    if let Some(requests) = resources.requests.as_mut() {
        *requests = normalize_resource_list(requests)?;
    }
    Ok(())
}

/// Compare two quantities by value
pub fn quantity_cmp(a: &Quantity, b: &Quantity) -> Result<std::cmp::Ordering> {
    Ok(parse_nanos(&a.0)?.cmp(&parse_nanos(&b.0)?))
}

/// True if `new` is strictly larger than `old`
pub fn storage_grew(old: &Quantity, new: &Quantity) -> Result<bool> {
    Ok(quantity_cmp(new, old)? == std::cmp::Ordering::Greater)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        Quantity(s.to_string())
    }

    #[test]
    fn test_parse_suffixes() {
        assert_eq!(parse_nanos("1").unwrap(), NANO);
        assert_eq!(parse_nanos("100m").unwrap(), NANO / 10);
        assert_eq!(parse_nanos("1Ki").unwrap(), 1024 * NANO);
        assert_eq!(parse_nanos("1k").unwrap(), 1000 * NANO);
        assert_eq!(parse_nanos("1e3").unwrap(), 1000 * NANO);
        assert_eq!(parse_nanos("0.5").unwrap(), NANO / 2);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_nanos("").is_err());
        assert!(parse_nanos("abc").is_err());
        assert!(parse_nanos("1x").is_err());
    }

    #[test]
    fn test_cpu_equivalent_spellings_normalize_equal() {
        assert_eq!(normalize_cpu(&q("1000m")).unwrap(), q("1"));
        assert_eq!(normalize_cpu(&q("0.5")).unwrap(), q("500m"));
        assert_eq!(normalize_cpu(&q("500m")).unwrap(), q("500m"));
        assert_eq!(normalize_cpu(&q("1e-1")).unwrap(), q("100m"));
    }

    #[test]
    fn test_memory_equivalent_spellings_normalize_equal() {
        assert_eq!(normalize_binary(&q("1024Mi")).unwrap(), q("1Gi"));
        assert_eq!(normalize_binary(&q("1Gi")).unwrap(), q("1Gi"));
        assert_eq!(normalize_binary(&q("1500")).unwrap(), q("1500"));
        assert_eq!(normalize_binary(&q("2048")).unwrap(), q("2Ki"));
    }

    #[test]
    fn test_normalize_resource_list_by_name() {
        let list = BTreeMap::from([
            ("cpu".to_string(), q("1000m")),
            ("memory".to_string(), q("1024Mi")),
            ("nvidia.com/gpu".to_string(), q("1")),
        ]);
        let normalized = normalize_resource_list(&list).unwrap();
        assert_eq!(normalized["cpu"], q("1"));
        assert_eq!(normalized["memory"], q("1Gi"));
        assert_eq!(normalized["nvidia.com/gpu"], q("1"));
    }

    #[test]
    fn test_storage_growth() {
        assert!(storage_grew(&q("10Gi"), &q("20Gi")).unwrap());
        assert!(!storage_grew(&q("20Gi"), &q("10Gi")).unwrap());
        assert!(!storage_grew(&q("1Gi"), &q("1024Mi")).unwrap());
    }
}
