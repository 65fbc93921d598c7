//! Branch name generation and validation

use chrono::{DateTime, Utc};

use super::phase::Phase;

/// Default naming pattern
pub const DEFAULT_PATTERN: &str = "{prefix}/P{phase}-{session}-{timestamp}-{slug}";

/// Maximum length of the last `/` segment
pub const MAX_LEAF_LEN: usize = 50;

/// Minimum length of the last `/` segment
pub const MIN_LEAF_LEN: usize = 2;

/// Highest collision suffix tried before giving up
pub const MAX_NAME_SUFFIX: u32 = 1000;

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Lowercase, ASCII-only, hyphen-separated form of free text
pub fn slugify(text: &str) -> String {
    text.to_lowercase()
        .chars()
        // Strip apostrophes entirely, replace other non-alphanumeric with hyphens
        .filter_map(|c| {
            if c.is_ascii_alphanumeric() {
                Some(c)
            } else if c == '\'' || c == '\u{2019}' || c == '\u{2018}' {
                None
            } else {
                Some('-')
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Inputs for one generated name
#[derive(Debug, Clone)]
pub struct NameRequest<'a> {
    pub pattern: &'a str,
    pub prefix: &'a str,
    pub phase: Phase,
    pub session_id: &'a str,
    pub description: &'a str,
    pub at: DateTime<Utc>,
}

fn render(req: &NameRequest<'_>, slug: &str) -> String {
    req.pattern
        .replace("{prefix}", req.prefix)
        .replace("{phase}", &req.phase.index().to_string())
        .replace("{session}", &slugify(req.session_id))
        .replace("{timestamp}", &req.at.format(TIMESTAMP_FORMAT).to_string())
        .replace("{slug}", slug)
}

fn leaf(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// Render the pattern with the slug shortened so the leaf plus `suffix` fits
fn candidate(req: &NameRequest<'_>, suffix: &str) -> String {
    let mut slug = slugify(req.description);
    if slug.is_empty() {
        slug = "work".to_string();
    }
    let fixed = leaf(&render(req, "")).len() + suffix.len();
    let budget = MAX_LEAF_LEN.saturating_sub(fixed);
    if slug.len() > budget {
        slug.truncate(budget);
    }
    let slug = slug.trim_end_matches('-');
    let name = render(req, slug);
    let name = name.trim_end_matches('-');
    format!("{}{}", name, suffix)
}

/// Generate a branch name not rejected by `taken`
///
/// Deterministic for identical inputs and identical `taken` answers. On
/// collision `-2`, `-3`, … is appended and re-checked up to
/// [`MAX_NAME_SUFFIX`]; `Ok(None)` when every candidate is taken. Errors from
/// `taken` are returned as-is.
pub fn generate<E>(
    req: &NameRequest<'_>,
    mut taken: impl FnMut(&str) -> Result<bool, E>,
) -> Result<Option<String>, E> {
    for n in 1..=MAX_NAME_SUFFIX {
        let suffix = if n == 1 { String::new() } else { format!("-{}", n) };
        let name = candidate(req, &suffix);
        if !taken(&name)? {
            return Ok(Some(name));
        }
    }
    Ok(None)
}

/// Check a branch name against the naming rules
///
/// Every `/` segment is ASCII alphanumerics and hyphens with no leading or
/// trailing hyphen; the leaf is 2 to 50 characters.
pub fn validate_branch_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("branch name is empty".to_string());
    }
    for segment in name.split('/') {
        if segment.is_empty() {
            return Err(format!("'{}' has an empty path segment", name));
        }
        if let Some(bad) = segment.chars().find(|c| !(c.is_ascii_alphanumeric() || *c == '-')) {
            return Err(format!("'{}' contains invalid character '{}'", name, bad));
        }
        if segment.starts_with('-') || segment.ends_with('-') {
            return Err(format!("segment '{}' starts or ends with a hyphen", segment));
        }
    }
    let leaf_len = leaf(name).len();
    if !(MIN_LEAF_LEN..=MAX_LEAF_LEN).contains(&leaf_len) {
        return Err(format!(
            "final segment of '{}' is {} characters; must be {} to {}",
            name, leaf_len, MIN_LEAF_LEN, MAX_LEAF_LEN
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;
    use std::convert::Infallible;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 12, 30, 5).unwrap()
    }

    /// Generate with an infallible predicate
    fn pick(req: &NameRequest<'_>, taken: impl Fn(&str) -> bool) -> String {
        generate(req, |n| Ok::<_, Infallible>(taken(n))).unwrap().unwrap()
    }

    fn request<'a>(session: &'a str, phase: Phase, description: &'a str) -> NameRequest<'a> {
        NameRequest {
            pattern: DEFAULT_PATTERN,
            prefix: "feature",
            phase,
            session_id: session,
            description,
            at: at(),
        }
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Add OAuth Login!"), "add-oauth-login");
        assert_eq!(slugify("Don't   panic"), "dont-panic");
        assert_eq!(slugify("naïve café"), "na-ve-caf");
        assert_eq!(slugify("---"), "");
    }

    #[test]
    fn test_generate_default_pattern() {
        let name = pick(&request("t1", Phase::P3, "Add OAuth"), |_| false);
        assert_eq!(name, "feature/P3-t1-20261019123005-add-oauth");
        assert!(validate_branch_name(&name).is_ok());
    }

    #[test]
    fn test_generate_is_deterministic() {
        let req = request("t2", Phase::P1, "Spec the API");
        assert_eq!(pick(&req, |_| false), pick(&req, |_| false));
    }

    #[test]
    fn test_long_description_is_trimmed() {
        let name = pick(&request("t1", Phase::P3, &"very long words ".repeat(20)), |_| false);
        assert!(leaf(&name).len() <= MAX_LEAF_LEN);
        assert!(!name.ends_with('-'));
        assert!(validate_branch_name(&name).is_ok());
    }

    #[test]
    fn test_collision_appends_suffix() {
        let first = pick(&request("t1", Phase::P3, "x"), |_| false);
        let second = pick(&request("t1", Phase::P3, "x"), |n| n == first);
        assert_eq!(second, format!("{}-2", first));
        let third = pick(&request("t1", Phase::P3, "x"), |n| n == first || n == second);
        assert_eq!(third, format!("{}-3", first));
    }

    #[test]
    fn test_suffix_keeps_leaf_within_limit() {
        let desc = "a".repeat(80);
        let first = pick(&request("t1", Phase::P3, &desc), |_| false);
        let second = pick(&request("t1", Phase::P3, &desc), |n| n == first);
        assert_eq!(leaf(&first).len(), MAX_LEAF_LEN);
        assert!(leaf(&second).len() <= MAX_LEAF_LEN);
        assert!(second.ends_with("-2"));
        assert!(validate_branch_name(&second).is_ok());
    }

    #[test]
    fn test_empty_description_gets_placeholder() {
        let name = pick(&request("t1", Phase::P0, "!!!"), |_| false);
        assert!(name.ends_with("-work"));
    }

    #[test]
    fn test_validate_branch_name() {
        assert!(validate_branch_name("feature/P3-t1-x1").is_ok());
        assert!(validate_branch_name("main").is_ok());
        assert!(validate_branch_name("").is_err());
        assert!(validate_branch_name("feature//x").is_err());
        assert!(validate_branch_name("feature/-x").is_err());
        assert!(validate_branch_name("feature/x-").is_err());
        assert!(validate_branch_name("feature/a_b").is_err());
        assert!(validate_branch_name("feature/x").is_err());
        assert!(validate_branch_name(&format!("feature/{}", "a".repeat(51))).is_err());
    }

    #[test]
    fn test_failing_check_is_propagated() {
        let req = request("t1", Phase::P3, "x");
        let mut calls = 0;
        let result = generate(&req, |_| {
            calls += 1;
            Err::<bool, _>("store unreadable")
        });
        assert_eq!(result, Err("store unreadable"));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_gives_up_after_max_suffix() {
        let req = request("t1", Phase::P3, "x");
        let mut calls = 0u32;
        let result = generate(&req, |_| {
            calls += 1;
            Ok::<_, Infallible>(true)
        });
        assert_eq!(result, Ok(None));
        assert_eq!(calls, MAX_NAME_SUFFIX);

        let last = format!("{}-{}", pick(&req, |_| false), MAX_NAME_SUFFIX);
        let found = generate(&req, |n| Ok::<_, Infallible>(n != last)).unwrap();
        assert_eq!(found, Some(last));
    }

    #[test]
    fn test_ten_thousand_names_never_collide() {
        let mut taken: HashSet<String> = HashSet::new();
        let descriptions = ["add oauth", "fix login bug", "refactor store", "", "Update README!"];
        let mut clock = at();

        for i in 0..10_000u32 {
            if i % 7 == 0 {
                clock += chrono::Duration::seconds(1);
            }
            let session = format!("t{}", i % 5);
            let phase = Phase::from_index((i % 8) as u8).unwrap();
            let req = NameRequest {
                pattern: DEFAULT_PATTERN,
                prefix: "feature",
                phase,
                session_id: &session,
                description: descriptions[(i % 5) as usize],
                at: clock,
            };
            let name = pick(&req, |n| taken.contains(n));
            assert!(validate_branch_name(&name).is_ok(), "invalid name {}", name);
            assert!(taken.insert(name.clone()), "collision on {}", name);
        }
        assert_eq!(taken.len(), 10_000);
    }
}
