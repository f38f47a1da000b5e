//! SemVer 2.0 parsing and the range grammar of §4.F. Comparison and
//! precedence are delegated to the `semver` crate; the range grammar
//! itself — `=V`, `<V`, `<=V`, `>V`, `>=V`, bare `V`, space-AND,
//! `||`-OR — does not match the crate's native `VersionReq` syntax
//! (caret/tilde), so it is hand-rolled on top of `semver::Version`
//! comparisons: reuse the crate for the hard part, hand-roll the glue.

use semver::Version;

use crate::error::{ErrorKind, NahError, Result};

pub fn parse_version(s: &str) -> Result<Version> {
    Version::parse(s).map_err(|e| {
        NahError::new(ErrorKind::InvalidManifest, "parse_version", e.to_string())
            .with_details(serde_json::json!({ "version": s }))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
struct RangeToken {
    op: CompareOp,
    version: Version,
}

/// A parsed range: OR of AND-groups of comparison tokens.
#[derive(Debug, Clone)]
pub struct VersionRange {
    alternatives: Vec<Vec<RangeToken>>,
}

impl VersionRange {
    pub fn parse(spec: &str) -> Result<VersionRange> {
        let mut alternatives = Vec::new();
        for branch in spec.split("||") {
            let branch = branch.trim();
            if branch.is_empty() {
                return Err(NahError::new(ErrorKind::InvalidManifest, "range_parse", "empty OR branch")
                    .with_details(serde_json::json!({ "range": spec })));
            }
            let mut tokens = Vec::new();
            for term in branch.split_whitespace() {
                tokens.push(parse_token(term, spec)?);
            }
            if tokens.is_empty() {
                return Err(NahError::new(ErrorKind::InvalidManifest, "range_parse", "empty AND group")
                    .with_details(serde_json::json!({ "range": spec })));
            }
            alternatives.push(tokens);
        }
        if alternatives.is_empty() {
            return Err(NahError::new(ErrorKind::InvalidManifest, "range_parse", "empty range")
                .with_details(serde_json::json!({ "range": spec })));
        }
        Ok(VersionRange { alternatives })
    }

    /// True iff `version` satisfies any OR branch in full.
    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|group| {
            group.iter().all(|token| match token.op {
                CompareOp::Eq => version == &token.version,
                CompareOp::Lt => version < &token.version,
                CompareOp::Le => version <= &token.version,
                CompareOp::Gt => version > &token.version,
                CompareOp::Ge => version >= &token.version,
            })
        })
    }
}

fn parse_token(term: &str, full_spec: &str) -> Result<RangeToken> {
    let (op, rest) = if let Some(rest) = term.strip_prefix(">=") {
        (CompareOp::Ge, rest)
    } else if let Some(rest) = term.strip_prefix("<=") {
        (CompareOp::Le, rest)
    } else if let Some(rest) = term.strip_prefix('>') {
        (CompareOp::Gt, rest)
    } else if let Some(rest) = term.strip_prefix('<') {
        (CompareOp::Lt, rest)
    } else if let Some(rest) = term.strip_prefix('=') {
        (CompareOp::Eq, rest)
    } else {
        (CompareOp::Eq, term)
    };

    let version = Version::parse(rest).map_err(|e| {
        NahError::new(ErrorKind::InvalidManifest, "range_parse", e.to_string())
            .with_details(serde_json::json!({ "range": full_spec, "token": term }))
    })?;
    Ok(RangeToken { op, version })
}

/// Given the set of candidate versions, returns the highest one that
/// satisfies `range`, or `None` if none do.
pub fn highest_satisfying<'a>(range: &VersionRange, versions: impl IntoIterator<Item = &'a Version>) -> Option<Version> {
    versions
        .into_iter()
        .filter(|v| range.matches(v))
        .max()
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn bare_version_is_exact_match() {
        let range = VersionRange::parse("1.2.3").unwrap();
        assert!(range.matches(&v("1.2.3")));
        assert!(!range.matches(&v("1.2.4")));
    }

    #[test]
    fn and_group_requires_all_tokens() {
        let range = VersionRange::parse(">=1.2.0 <2.0.0").unwrap();
        assert!(range.matches(&v("1.2.3")));
        assert!(!range.matches(&v("2.0.0")));
        assert!(!range.matches(&v("1.1.9")));
    }

    #[test]
    fn or_alternatives_match_if_any_branch_matches() {
        let range = VersionRange::parse("1.0.0 || >=2.0.0 <3.0.0").unwrap();
        assert!(range.matches(&v("1.0.0")));
        assert!(range.matches(&v("2.5.0")));
        assert!(!range.matches(&v("1.5.0")));
    }

    #[test]
    fn highest_satisfying_picks_max_in_range() {
        let range = VersionRange::parse(">=1.2.0 <2.0.0").unwrap();
        let versions = vec![v("1.1.0"), v("1.2.3"), v("2.0.0")];
        let chosen = highest_satisfying(&range, versions.iter());
        assert_eq!(chosen, Some(v("1.2.3")));
    }

    #[test]
    fn highest_satisfying_none_when_empty() {
        let range = VersionRange::parse(">=3.0.0").unwrap();
        let versions = vec![v("1.1.0"), v("1.2.3")];
        assert_eq!(highest_satisfying(&range, versions.iter()), None);
    }

    #[test]
    fn prerelease_orders_before_release() {
        assert!(v("1.0.0-alpha") < v("1.0.0"));
    }
}
