// Version Ranges
//
// npm-style range expressions on top of the semver crate. npm and Cargo
// disagree on a few details (a bare "1.2.3" is exact in npm but caret in
// Cargo, npm separates comparators with spaces and supports "||" and hyphen
// ranges), so requests are translated into one VersionReq per alternative.

use std::fmt;
use std::str::FromStr;

use semver::{Comparator, Op, Version, VersionReq};

/// A parsed npm range such as `^1.2.0`, `>=1 <3 || 4.x` or `1.0.0 - 1.4`.
#[derive(Debug, Clone)]
pub struct VersionRange {
    raw: String,
    alternatives: Vec<VersionReq>,
}

/// Error returned for expressions that are not valid ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeError {
    pub range: String,
    pub reason: String,
}

impl fmt::Display for RangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid version range '{}': {}", self.range, self.reason)
    }
}

impl std::error::Error for RangeError {}

impl VersionRange {
    pub fn parse(raw: &str) -> Result<Self, RangeError> {
        let error = |reason: String| RangeError {
            range: raw.to_string(),
            reason,
        };

        let mut alternatives = Vec::new();
        for alternative in raw.split("||") {
            let comparators = translate_comparator_set(alternative).map_err(error)?;
            let req = if comparators.is_empty() {
                VersionReq::STAR
            } else {
                VersionReq::parse(&comparators.join(", ")).map_err(|e| error(e.to_string()))?
            };
            alternatives.push(req);
        }

        Ok(Self {
            raw: raw.trim().to_string(),
            alternatives,
        })
    }

    /// True when `version` falls inside any alternative of the range.
    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|req| req.matches(version))
    }

    /// True when `version` is greater than every version the range can match
    /// (npm's `gtr`). Ranges without an upper bound are never exceeded.
    pub fn is_exceeded_by(&self, version: &Version) -> bool {
        if self.matches(version) {
            return false;
        }
        self.alternatives.iter().all(|req| {
            req.comparators
                .iter()
                .filter_map(upper_bound)
                .any(|bound| bound.is_exceeded_by(version))
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for VersionRange {
    type Err = RangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Parse a concrete version, tolerating npm's leading `v` / `=`.
pub fn parse_version(raw: &str) -> Option<Version> {
    let trimmed = raw.trim().trim_start_matches('=').trim_start_matches(['v', 'V']);
    Version::parse(trimmed).ok()
}

/// Returns true when `raw` parses as a range.
pub fn is_valid_range(raw: &str) -> bool {
    VersionRange::parse(raw).is_ok()
}

/// `version` satisfies `range`. Unparseable input never satisfies.
pub fn satisfies(version: &str, range: &str) -> bool {
    match (parse_version(version), VersionRange::parse(range)) {
        (Some(version), Ok(range)) => range.matches(&version),
        _ => false,
    }
}

/// `version` is greater than every version allowed by `range`.
pub fn greater_than_range(version: &str, range: &str) -> bool {
    match (parse_version(version), VersionRange::parse(range)) {
        (Some(version), Ok(range)) => range.is_exceeded_by(&version),
        _ => false,
    }
}

/// Highest version in `versions` that satisfies `range`.
pub fn max_satisfying<'a, I>(versions: I, range: &VersionRange) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut best: Option<(Version, &'a str)> = None;
    for raw in versions {
        let Some(version) = parse_version(raw) else {
            continue;
        };
        if !range.matches(&version) {
            continue;
        }
        let is_better = match &best {
            Some((current, _)) => version > *current,
            None => true,
        };
        if is_better {
            best = Some((version, raw));
        }
    }
    best.map(|(_, raw)| raw)
}

/// Translate one space-separated npm comparator set into Cargo comparators.
/// An empty result means "any version".
fn translate_comparator_set(set: &str) -> Result<Vec<String>, String> {
    let tokens = tokenize(set);

    if tokens.len() == 3 && tokens[1] == "-" {
        let mut out = Vec::new();
        out.extend(translate_comparator(&format!(">={}", tokens[0]))?);
        out.extend(translate_comparator(&format!("<={}", tokens[2]))?);
        return Ok(out);
    }

    let mut out = Vec::new();
    for token in &tokens {
        if token == "-" {
            return Err("unexpected '-'".to_string());
        }
        out.extend(translate_comparator(token)?);
    }
    Ok(out)
}

/// Split on whitespace, gluing a lone operator to the version after it
/// (">= 1.2.3" becomes ">=1.2.3").
fn tokenize(set: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    let mut pending_op: Option<String> = None;
    for part in set.split_whitespace() {
        if matches!(part, ">" | ">=" | "<" | "<=" | "=" | "^" | "~") {
            pending_op = Some(part.to_string());
            continue;
        }
        match pending_op.take() {
            Some(op) => tokens.push(format!("{}{}", op, part)),
            None => tokens.push(part.to_string()),
        }
    }
    if let Some(op) = pending_op {
        tokens.push(op);
    }
    tokens
}

fn translate_comparator(token: &str) -> Result<Option<String>, String> {
    let (op, rest) = split_operator(token);
    let rest = rest.trim_start_matches(['v', 'V']);
    if rest.is_empty() {
        return Err(format!("missing version after '{}'", op));
    }

    // Build metadata never takes part in comparisons.
    let rest = rest.split('+').next().unwrap_or(rest);
    let (core, pre) = match rest.find('-') {
        Some(idx) => (&rest[..idx], Some(&rest[idx + 1..])),
        None => (rest, None),
    };

    let mut parts = Vec::new();
    let mut wildcard = false;
    for segment in core.split('.') {
        if matches!(segment, "x" | "X" | "*") {
            wildcard = true;
            break;
        }
        if segment.is_empty() || !segment.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("invalid version segment '{}'", segment));
        }
        parts.push(segment);
    }
    if parts.len() > 3 {
        return Err(format!("too many version segments in '{}'", token));
    }

    if parts.is_empty() {
        // "*", "x", ">=*": unbounded. "<*" / ">*" cannot match anything.
        return match op {
            "" | "=" | ">=" | "<=" | "^" | "~" => Ok(None),
            _ => Err(format!("'{}' can never match", token)),
        };
    }

    let mut version = parts.join(".");
    if let Some(pre) = pre {
        if !wildcard && parts.len() == 3 {
            version.push('-');
            version.push_str(pre);
        }
    }

    // A bare version is exact in npm ("1.2" means 1.2.x).
    let op = if op.is_empty() { "=" } else { op };
    Ok(Some(format!("{}{}", op, version)))
}

fn split_operator(token: &str) -> (&str, &str) {
    for op in [">=", "<=", "~>", ">", "<", "=", "^", "~"] {
        if let Some(rest) = token.strip_prefix(op) {
            let op = if op == "~>" { "~" } else { op };
            return (op, rest.trim());
        }
    }
    ("", token)
}

enum Bound {
    Inclusive(Version),
    Exclusive(Version),
}

impl Bound {
    fn is_exceeded_by(&self, version: &Version) -> bool {
        match self {
            Bound::Inclusive(bound) => version > bound,
            Bound::Exclusive(bound) => version >= bound,
        }
    }
}

fn upper_bound(comparator: &Comparator) -> Option<Bound> {
    let major = comparator.major;
    // An increment past u64::MAX leaves the range open above.
    let next_major = || -> Option<Bound> {
        Some(Bound::Exclusive(Version::new(major.checked_add(1)?, 0, 0)))
    };
    let next_minor = |major: u64, minor: u64| -> Option<Bound> {
        Some(Bound::Exclusive(Version::new(major, minor.checked_add(1)?, 0)))
    };

    match comparator.op {
        Op::Greater | Op::GreaterEq => None,
        Op::Exact | Op::LessEq => match (comparator.minor, comparator.patch) {
            (Some(minor), Some(patch)) => {
                let mut version = Version::new(major, minor, patch);
                version.pre = comparator.pre.clone();
                Some(Bound::Inclusive(version))
            }
            (Some(minor), None) => next_minor(major, minor),
            (None, _) => next_major(),
        },
        Op::Less => {
            let mut version = Version::new(
                major,
                comparator.minor.unwrap_or(0),
                comparator.patch.unwrap_or(0),
            );
            version.pre = comparator.pre.clone();
            Some(Bound::Exclusive(version))
        }
        Op::Tilde => match comparator.minor {
            Some(minor) => next_minor(major, minor),
            None => next_major(),
        },
        Op::Caret => match (comparator.minor, comparator.patch) {
            _ if major > 0 => next_major(),
            (None, _) => next_major(),
            (Some(minor), _) if minor > 0 => next_minor(0, minor),
            (Some(minor), None) => next_minor(0, minor),
            (Some(_), Some(patch)) => Some(Bound::Exclusive(Version::new(0, 0, patch.checked_add(1)?))),
        },
        Op::Wildcard => match comparator.minor {
            Some(minor) => next_minor(major, minor),
            None => next_major(),
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_versions_are_exact() {
        assert!(satisfies("1.2.3", "1.2.3"));
        assert!(!satisfies("1.2.4", "1.2.3"));
        assert!(satisfies("1.2.9", "1.2"));
        assert!(!satisfies("1.3.0", "1.2"));
        assert!(satisfies("v1.0.0", "=1.0.0"));
    }

    #[test]
    fn test_npm_range_syntax() {
        assert!(satisfies("1.5.0", "^1.0.0"));
        assert!(!satisfies("2.0.0", "^1.0.0"));
        assert!(satisfies("1.5.0", ">=1.0.0 <2.0.0"));
        assert!(satisfies("1.5.0", ">= 1.0.0 < 2.0.0"));
        assert!(satisfies("3.1.0", "^1.0.0 || ^3.0.0"));
        assert!(satisfies("1.4.7", "1.0.0 - 1.4"));
        assert!(!satisfies("1.5.0", "1.0.0 - 1.4"));
        assert!(satisfies("1.9.0", "1.x"));
        assert!(satisfies("1.2.9", "~1.2.x"));
        assert!(satisfies("7.0.0", "*"));
        assert!(satisfies("7.0.0", ""));
        assert!(satisfies("0.2.5", "^0.2.3"));
        assert!(!satisfies("0.3.0", "^0.2.3"));
    }

    #[test]
    fn test_tags_are_not_ranges() {
        assert!(!is_valid_range("latest"));
        assert!(!is_valid_range("next"));
        assert!(is_valid_range("^1.0.0"));
        assert!(!satisfies("1.0.0", "latest"));
    }

    #[test]
    fn test_greater_than_range() {
        assert!(greater_than_range("2.0.0", "^1.0.0"));
        assert!(greater_than_range("1.3.0", "~1.2.0"));
        assert!(greater_than_range("1.0.1", "1.0.0"));
        assert!(greater_than_range("0.4.0", "^0.3.1"));
        assert!(!greater_than_range("1.5.0", "^1.0.0"));
        assert!(!greater_than_range("0.9.0", "^1.0.0"));
        assert!(!greater_than_range("9.0.0", ">=1.0.0"));
        assert!(!greater_than_range("3.0.0", "^1.0.0 || >=2.5.0"));
        assert!(greater_than_range("5.0.0", "^1.0.0 || ^4.0.0"));
    }

    #[test]
    fn test_bounds_at_integer_limits_stay_open() {
        let max = u64::MAX;
        assert!(!greater_than_range(&format!("{max}.1.0"), &format!("^{max}.0.0")));
        assert!(!greater_than_range("2.0.0", &format!("~1.{max}")));
        assert!(!greater_than_range("0.1.0", &format!("^0.0.{max}")));
        assert!(greater_than_range(&format!("{max}.0.0"), "^1.0.0"));
    }

    #[test]
    fn test_max_satisfying_picks_highest_match() {
        let range = VersionRange::parse("^1.0.0").unwrap();
        let versions = ["1.0.0", "1.3.0", "1.2.0", "2.0.0", "not-a-version"];
        assert_eq!(max_satisfying(versions, &range), Some("1.3.0"));

        let range = VersionRange::parse("^3.0.0").unwrap();
        assert_eq!(max_satisfying(versions, &range), None);
    }

    #[test]
    fn test_prerelease_only_matches_explicitly() {
        assert!(!satisfies("2.0.0-beta.1", "^1.0.0"));
        assert!(satisfies("2.0.0-beta.2", ">=2.0.0-beta.1"));
    }
}
