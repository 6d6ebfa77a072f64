//! Definition name matching and service version comparison
//!
//! Definitions are referenced by exact name, by name prefix or by regular
//! expression. Service versions are semantic versions; requirements may be
//! an exact version or a range such as `>=8.0.0, <9.0.0`.

use std::cmp::Ordering;

use regex::Regex;
use semver::{Version, VersionReq};

use crate::{Error, Result};

/// True if `name` starts with `pattern` or `pattern` is a regex matching `name`
pub fn prefix_or_regex_matched(name: &str, pattern: &str) -> bool {
    if name.starts_with(pattern) {
        return true;
    }
    match Regex::new(pattern) {
        Ok(re) => re.is_match(name),
        Err(_) => false,
    }
}

/// Select the candidates whose name equals `pattern`, else those matching it
///
/// Exact matches shadow pattern matches entirely.
pub fn filter_by_name_pattern<'a, T, F>(items: &'a [T], pattern: &str, name_of: F) -> Vec<&'a T>
where
    F: Fn(&T) -> &str,
{
    let exact: Vec<&T> = items.iter().filter(|i| name_of(i) == pattern).collect();
    if !exact.is_empty() {
        return exact;
    }
    items
        .iter()
        .filter(|i| prefix_or_regex_matched(name_of(i), pattern))
        .collect()
}

/// Parse a version leniently: `8.0` is `8.0.0`, a leading `v` is ignored
pub fn parse_version(raw: &str) -> Option<Version> {
    let trimmed = raw.trim().trim_start_matches('v');
    if let Ok(v) = Version::parse(trimmed) {
        return Some(v);
    }
    let (core, rest) = match trimmed.find(['-', '+']) {
        Some(idx) => trimmed.split_at(idx),
        None => (trimmed, ""),
    };
    let mut parts: Vec<&str> = core.split('.').collect();
    if parts.is_empty() || parts.len() > 3 || parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    while parts.len() < 3 {
        parts.push("0");
    }
    Version::parse(&format!("{}{}", parts.join("."), rest)).ok()
}

/// Check whether `provided` satisfies the `required` service version
///
/// An empty requirement accepts anything. A plain version must match
/// exactly; anything else is treated as a version range.
pub fn compare_service_version(required: &str, provided: &str) -> Result<bool> {
    if required.is_empty() {
        return Ok(true);
    }
    let version = parse_version(provided)
        .ok_or_else(|| Error::validation(format!("invalid service version: {}", provided)))?;
    if let Some(exact) = parse_version(required) {
        return Ok(exact == version);
    }
    let req = VersionReq::parse(required).map_err(|e| {
        Error::validation(format!(
            "invalid service version requirement {}: {}",
            required, e
        ))
    })?;
    Ok(req.matches(&version))
}

/// Order service versions: empty first, then by semantic version
///
/// Versions that do not parse sort lexically after every valid version.
pub fn service_version_cmp(a: &str, b: &str) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }
    match (parse_version(a), parse_version(b)) {
        (Some(va), Some(vb)) => va.cmp(&vb),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod name_patterns {
        use super::*;

        #[test]
        fn test_prefix_match() {
            assert!(prefix_or_regex_matched("apecloud-mysql-8.0", "apecloud-mysql"));
            assert!(!prefix_or_regex_matched("redis-7", "apecloud-mysql"));
        }

        #[test]
        fn test_regex_match() {
            assert!(prefix_or_regex_matched("mysql-8.0.30", "^mysql-8\\.0\\..*$"));
            assert!(!prefix_or_regex_matched("mysql-5.7", "^mysql-8"));
        }

        #[test]
        fn test_invalid_regex_does_not_match() {
            assert!(!prefix_or_regex_matched("mysql", "(["));
        }

        #[test]
        fn test_exact_matches_shadow_patterns() {
            let names = vec!["mysql".to_string(), "mysql-8".to_string()];
            let selected = filter_by_name_pattern(&names, "mysql", |s| s.as_str());
            assert_eq!(selected, vec![&names[0]]);

            let selected = filter_by_name_pattern(&names, "mys", |s| s.as_str());
            assert_eq!(selected.len(), 2);
        }
    }

    mod versions {
        use super::*;

        #[test]
        fn test_lenient_parse() {
            assert_eq!(parse_version("8.0"), Some(Version::new(8, 0, 0)));
            assert_eq!(parse_version("v1.2.3"), Some(Version::new(1, 2, 3)));
            assert!(parse_version("latest").is_none());
        }

        #[test]
        fn test_empty_requirement_accepts_all() {
            assert!(compare_service_version("", "8.0.30").unwrap());
        }

        #[test]
        fn test_exact_requirement() {
            assert!(compare_service_version("8.0.30", "8.0.30").unwrap());
            assert!(!compare_service_version("8.0.30", "8.0.31").unwrap());
        }

        #[test]
        fn test_range_requirement() {
            assert!(compare_service_version(">=8.0.0, <9.0.0", "8.0.31").unwrap());
            assert!(!compare_service_version(">=8.0.0, <9.0.0", "9.1.0").unwrap());
        }

        #[test]
        fn test_invalid_provided_version_is_error() {
            assert!(compare_service_version("8.0.30", "latest").is_err());
        }

        #[test]
        fn test_ordering_puts_empty_first() {
            let mut versions = vec!["8.0.30", "", "5.7.44", "8.0.4"];
            versions.sort_by(|a, b| service_version_cmp(a, b));
            assert_eq!(versions, vec!["", "5.7.44", "8.0.4", "8.0.30"]);
        }
    }
}
