//! Version algebra: `pkgver` parsing, comparison, and pattern matching.
//!
//! Grounded on the teacher's `deps::version` module (pacman-compatible
//! dotted/alpha comparison), generalized to also split on the
//! `name-version_revision` shape and the `reverts` override rule described
//! for this package manager.

use std::cmp::Ordering;

use crate::error::{Error, Result};

/// A parsed `pkgver` string: `name-version_revision`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkgVer {
    /// Package name.
    pub name: String,
    /// Version component (without revision).
    pub version: String,
    /// Revision component (the integer after the final `_`).
    pub revision: String,
}

impl PkgVer {
    /// Reassembles the canonical `name-version_revision` string.
    #[must_use]
    pub fn pkgver(&self) -> String {
        format!("{}-{}_{}", self.name, self.version, self.revision)
    }
}

/// Splits a `pkgver` string into name/version/revision.
///
/// The trailing `_N` after the last `-` is the revision, the preceding
/// substring up to that `-` is the version, and the remainder is the name.
///
/// # Errors
/// Returns [`Error::InvalidArgument`] if `pkgver` has no `-` separating a
/// version, or no `_` separating a revision.
pub fn parse_pkgver(pkgver: &str) -> Result<PkgVer> {
    let last_dash = pkgver
        .rfind('-')
        .ok_or_else(|| Error::InvalidArgument(format!("not a pkgver: {pkgver}")))?;
    let name = &pkgver[..last_dash];
    let rest = &pkgver[last_dash + 1..];
    let last_underscore = rest
        .rfind('_')
        .ok_or_else(|| Error::InvalidArgument(format!("missing revision: {pkgver}")))?;
    let version = &rest[..last_underscore];
    let revision = &rest[last_underscore + 1..];
    if name.is_empty() || version.is_empty() || revision.is_empty() {
        return Err(Error::InvalidArgument(format!("malformed pkgver: {pkgver}")));
    }
    Ok(PkgVer {
        name: name.to_string(),
        version: version.to_string(),
        revision: revision.to_string(),
    })
}

/// Extracts just the package name from a `pkgver` string.
///
/// # Errors
/// Returns [`Error::InvalidArgument`] if `pkgver` cannot be parsed.
pub fn pkgname_from_pkgver(pkgver: &str) -> Result<String> {
    parse_pkgver(pkgver).map(|p| p.name)
}

/// Splits a version string into alternating numeric/alpha runs, using `.`
/// and any other non-alphanumeric byte as a separator (the separators
/// themselves are dropped, not emitted as empty runs).
fn split_runs(s: &str) -> Vec<Run> {
    let mut runs = Vec::new();
    let mut chars = s.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() {
            let mut num = String::new();
            while matches!(chars.peek(), Some(c) if c.is_ascii_digit()) {
                num.push(chars.next().expect("peeked"));
            }
            runs.push(Run::Num(num.parse::<u64>().unwrap_or(u64::MAX)));
        } else if c.is_alphanumeric() {
            let mut alpha = String::new();
            while matches!(chars.peek(), Some(c) if c.is_alphanumeric() && !c.is_ascii_digit()) {
                alpha.push(chars.next().expect("peeked"));
            }
            runs.push(Run::Alpha(alpha));
        } else {
            chars.next();
        }
    }
    runs
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Run {
    Num(u64),
    Alpha(String),
}

impl Run {
    fn cmp_run(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Num(a), Self::Num(b)) => a.cmp(b),
            (Self::Alpha(a), Self::Alpha(b)) => a.cmp(b),
            // a numeric run outranks an alpha run at the same position.
            (Self::Num(_), Self::Alpha(_)) => Ordering::Greater,
            (Self::Alpha(_), Self::Num(_)) => Ordering::Less,
        }
    }
}

/// Compares two plain version strings (without revision) by the run-based
/// rules: numeric runs compare numerically, alpha runs lexicographically,
/// a numeric run outranks an alpha run at the same position, and missing
/// trailing components compare as zero.
#[must_use]
pub fn cmp_version(a: &str, b: &str) -> Ordering {
    let ra = split_runs(a);
    let rb = split_runs(b);
    let len = ra.len().max(rb.len());
    for i in 0..len {
        let da = ra.get(i).cloned().unwrap_or(Run::Num(0));
        let db = rb.get(i).cloned().unwrap_or(Run::Num(0));
        match da.cmp_run(&db) {
            Ordering::Equal => continue,
            ord => return ord,
        }
    }
    Ordering::Equal
}

/// Compares two full `pkgver` strings: version first, revision last.
///
/// # Errors
/// Returns [`Error::InvalidArgument`] if either string is not a well-formed
/// `pkgver`.
pub fn cmpver(a: &str, b: &str) -> Result<Ordering> {
    let pa = parse_pkgver(a)?;
    let pb = parse_pkgver(b)?;
    match cmp_version(&pa.version, &pb.version) {
        Ordering::Equal => Ok(cmp_version(&pa.revision, &pb.revision)),
        ord => Ok(ord),
    }
}

/// Parses a space-separated `reverts` field into the list of pkgver strings
/// a package explicitly supersedes.
#[must_use]
pub fn parse_reverts(reverts: &str) -> Vec<&str> {
    reverts.split_whitespace().collect()
}

/// Returns whether `candidate`'s `reverts` list contains `other_version`,
/// meaning `candidate` wins against that version regardless of `cmpver`.
#[must_use]
pub fn reverts_wins(candidate_reverts: &str, other_version: &str) -> bool {
    parse_reverts(candidate_reverts).contains(&other_version)
}

/// A parsed pkgpattern: `name[{>=,<=,>,<,=}X[<Y]]` or a glob on the name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    /// Bare name or name glob (e.g. `foo`, `foo-dev*`), no version bound.
    Name(String),
    /// One or two inequality bounds against a name.
    Bounded {
        /// Package name (no glob allowed once a bound is present).
        name: String,
        /// Lower bound, e.g. `(">=", "1.0")`.
        lower: Option<(Op, String)>,
        /// Upper bound, e.g. `("<", "2.0")`.
        upper: Option<(Op, String)>,
    },
}

/// Comparison operator in a version bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// `>=`
    Ge,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `<`
    Lt,
    /// `=`
    Eq,
}

impl Op {
    fn holds(self, ord: Ordering) -> bool {
        match self {
            Self::Ge => ord != Ordering::Less,
            Self::Le => ord != Ordering::Greater,
            Self::Gt => ord == Ordering::Greater,
            Self::Lt => ord == Ordering::Less,
            Self::Eq => ord == Ordering::Equal,
        }
    }
}

const OPS: &[(&str, Op)] = &[
    (">=", Op::Ge),
    ("<=", Op::Le),
    (">", Op::Gt),
    ("<", Op::Lt),
    ("=", Op::Eq),
];

/// Parses a pkgpattern expression such as `foo>=1.0<2.0`, `foo-dev*`, or a
/// bare `foo`.
#[must_use]
pub fn parse_pattern(pattern: &str) -> Pattern {
    let Some((first_idx, first_op)) = find_first_op(pattern) else {
        return Pattern::Name(pattern.to_string());
    };
    let name = pattern[..first_idx].to_string();
    let rest = &pattern[first_idx + op_str(first_op).len()..];
    if let Some((second_idx, second_op)) = find_first_op(rest) {
        let first_ver = rest[..second_idx].to_string();
        let second_ver = rest[second_idx + op_str(second_op).len()..].to_string();
        let (lower, upper) = order_bounds((first_op, first_ver), (second_op, second_ver));
        Pattern::Bounded {
            name,
            lower: Some(lower),
            upper: Some(upper),
        }
    } else {
        let ver = rest.to_string();
        let (lower, upper) = order_bounds_single(first_op, ver);
        Pattern::Bounded { name, lower, upper }
    }
}

fn op_str(op: Op) -> &'static str {
    OPS.iter().find(|(_, o)| *o == op).map_or("", |(s, _)| s)
}

fn find_first_op(s: &str) -> Option<(usize, Op)> {
    // Longest-match first so ">=" is preferred over ">".
    let mut best: Option<(usize, Op)> = None;
    for (text, op) in OPS {
        if let Some(idx) = s.find(text) {
            match best {
                Some((bidx, _)) if bidx <= idx => {}
                _ => best = Some((idx, *op)),
            }
        }
    }
    best
}

fn order_bounds(
    first: (Op, String),
    second: (Op, String),
) -> ((Op, String), (Op, String)) {
    match first.0 {
        Op::Ge | Op::Gt | Op::Eq => (first, second),
        Op::Le | Op::Lt => (second, first),
    }
}

fn order_bounds_single(op: Op, ver: String) -> (Option<(Op, String)>, Option<(Op, String)>) {
    match op {
        Op::Ge | Op::Gt | Op::Eq => (Some((op, ver)), None),
        Op::Le | Op::Lt => (None, Some((op, ver))),
    }
}

fn glob_match(glob: &str, name: &str) -> bool {
    if let Some(prefix) = glob.strip_suffix('*') {
        name.starts_with(prefix)
    } else {
        glob == name
    }
}

/// Tests whether `name`/`version` (a `pkgver`-less name + version pair)
/// satisfies `pattern`.
///
/// Returns `true` only when the name matches exactly (or by glob, for
/// unbounded patterns) and every inequality bound holds.
#[must_use]
pub fn pattern_matches(pattern: &Pattern, name: &str, version: &str) -> bool {
    match pattern {
        Pattern::Name(glob) => glob_match(glob, name),
        Pattern::Bounded { name: pname, lower, upper } => {
            if pname != name {
                return false;
            }
            let lower_ok = lower
                .as_ref()
                .is_none_or(|(op, v)| op.holds(cmp_version(version, v)));
            let upper_ok = upper
                .as_ref()
                .is_none_or(|(op, v)| op.holds(cmp_version(version, v)));
            lower_ok && upper_ok
        }
    }
}

/// Convenience: parses and matches a pattern string against a name/version
/// pair in one call.
#[must_use]
pub fn matches(pattern: &str, name: &str, version: &str) -> bool {
    pattern_matches(&parse_pattern(pattern), name, version)
}

/// Extracts the bare package name a pattern constrains, without parsing
/// full bounds (the "pkgpattern-name rule" used by the resolver).
#[must_use]
pub fn pattern_name(pattern: &str) -> String {
    match parse_pattern(pattern) {
        Pattern::Name(n) => n,
        Pattern::Bounded { name, .. } => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pkgver() {
        let p = parse_pkgver("foo-1.2.3_1").unwrap();
        assert_eq!(p.name, "foo");
        assert_eq!(p.version, "1.2.3");
        assert_eq!(p.revision, "1");
    }

    #[test]
    fn parses_pkgver_with_dashes_in_name() {
        let p = parse_pkgver("foo-bar-1.0_2").unwrap();
        assert_eq!(p.name, "foo-bar");
        assert_eq!(p.version, "1.0");
        assert_eq!(p.revision, "2");
    }

    #[test]
    fn cmpver_is_antisymmetric_and_reflexive() {
        let corpus = ["foo-1.0_1", "foo-1.0_2", "foo-2.0_1", "foo-1.9.9_5", "foo-1.10_1"];
        for a in corpus {
            for b in corpus {
                let fwd = cmpver(a, b).unwrap();
                let bwd = cmpver(b, a).unwrap();
                assert_eq!(fwd, bwd.reverse());
            }
            assert_eq!(cmpver(a, a).unwrap(), Ordering::Equal);
        }
    }

    #[test]
    fn numeric_outranks_alpha_at_same_position() {
        assert_eq!(cmp_version("1.0", "1.0alpha"), Ordering::Greater);
    }

    #[test]
    fn missing_components_compare_as_zero() {
        assert_eq!(cmp_version("1.0", "1.0.0"), Ordering::Equal);
    }

    #[test]
    fn bounded_pattern_matches_range() {
        assert!(matches("foo>=1.0<2.0", "foo", "1.5"));
        assert!(!matches("foo>=1.0<2.0", "foo", "2.0"));
        assert!(!matches("foo>=1.0<2.0", "bar", "1.5"));
    }

    #[test]
    fn single_bound_patterns() {
        assert!(matches("foo>=1.0", "foo", "1.0"));
        assert!(matches("foo<2.0", "foo", "1.9"));
        assert!(!matches("foo<2.0", "foo", "2.0"));
        assert!(matches("foo=1.0", "foo", "1.0"));
    }

    #[test]
    fn name_glob_matches_prefix() {
        assert!(matches("foo-dev*", "foo-dev-tools", "1.0"));
        assert!(!matches("foo-dev*", "bar-dev-tools", "1.0"));
    }

    #[test]
    fn reverts_overrides_cmpver() {
        assert!(reverts_wins("1 2 3", "2"));
        assert!(!reverts_wins("1 2 3", "9"));
    }
}
