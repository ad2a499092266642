//! Route pattern matching for middleware applicability.
//!
//! # Responsibilities
//! - Decide whether a middleware route pattern applies to a request path
//!
//! # Design Decisions
//! - Matching is case-sensitive
//! - No regex: patterns are compared literally, by prefix, or segment by segment
//! - An entry with an empty pattern list applies to no path

/// Returns true if `path` matches `pattern`.
///
/// Supported shapes:
/// - `*` matches every path.
/// - `/prefix/*` matches any path starting with `/prefix`.
/// - A pattern with `*` inside a segment (`/api/v*/users`) is compared segment
///   by segment; every `*` consumes a non-empty run of characters within its
///   segment.
/// - Anything else must equal the path exactly.
pub fn route_matches(pattern: &str, path: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    if let Some(prefix) = pattern.strip_suffix("/*") {
        return path.starts_with(prefix);
    }

    if pattern.contains('*') {
        return segments_match(pattern, path);
    }

    pattern == path
}

/// Returns true if any pattern in `patterns` matches `path`.
pub fn any_route_matches(patterns: &[String], path: &str) -> bool {
    patterns.iter().any(|p| route_matches(p, path))
}

fn segments_match(pattern: &str, path: &str) -> bool {
    let mut pattern_segments = pattern.split('/');
    let mut path_segments = path.split('/');

    loop {
        match (pattern_segments.next(), path_segments.next()) {
            (None, None) => return true,
            (Some(p), Some(s)) => {
                if !glob_segment(p.as_bytes(), s.as_bytes()) {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

/// Glob within a single segment. `*` matches one or more bytes.
///
/// Greedy two-pointer scan: on a mismatch only the most recent `*` grows,
/// so the cost stays bounded by `pattern.len() * segment.len()`.
fn glob_segment(pattern: &[u8], segment: &[u8]) -> bool {
    let (mut p, mut s) = (0, 0);
    // Pattern index after the latest `*`, and where its run currently ends.
    let mut resume: Option<(usize, usize)> = None;

    while p < pattern.len() || s < segment.len() {
        if p < pattern.len() && s < segment.len() {
            if pattern[p] == b'*' {
                p += 1;
                s += 1;
                resume = Some((p, s));
                continue;
            }
            if pattern[p] == segment[s] {
                p += 1;
                s += 1;
                continue;
            }
        }
        match resume {
            Some((star_p, star_end)) if star_end < segment.len() => {
                resume = Some((star_p, star_end + 1));
                p = star_p;
                s = star_end + 1;
            }
            _ => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_matches_everything() {
        assert!(route_matches("*", "/"));
        assert!(route_matches("*", "/anything/at/all"));
    }

    #[test]
    fn test_prefix_pattern() {
        assert!(route_matches("/api/*", "/api/users"));
        assert!(route_matches("/api/*", "/api/users/1"));
        assert!(!route_matches("/api/*", "/other"));
    }

    #[test]
    fn test_segment_glob() {
        assert!(route_matches("/api/v*/users", "/api/v1/users"));
        assert!(route_matches("/api/v*/users", "/api/v2/users"));
        assert!(!route_matches("/api/v*/users", "/api/v1/accounts"));
        // `*` needs at least one character.
        assert!(!route_matches("/api/v*/users", "/api/v/users"));
        // Segment counts must line up.
        assert!(!route_matches("/api/v*/users", "/api/v1/users/7"));
        assert!(route_matches("/api/*/orders", "/api/eu/orders"));
        assert!(route_matches("/files/*.json", "/files/a.json"));
        assert!(!route_matches("/files/*.json", "/files/.json"));
    }

    #[test]
    fn test_multiple_globs_in_one_segment() {
        assert!(route_matches("/r/*-*", "/r/a-b-c"));
        assert!(route_matches("/files/*.json", "/files/a.b.json"));
        assert!(route_matches("/r/*a*", "/r/bab"));
        assert!(!route_matches("/r/*a*", "/r/ba"));
        assert!(!route_matches("/r/*-*", "/r/-ab"));
    }

    #[test]
    fn test_many_globs_against_long_segment() {
        let path = format!("/r/{}", "a".repeat(4096));
        assert!(!route_matches("/r/*a*a*a*a*a*a*a*a*a*a*b", &path));
        assert!(route_matches("/r/*a*a*a*a*a*a*a*a*a*a*a", &path));
    }

    #[test]
    fn test_exact_and_case_sensitive() {
        assert!(route_matches("/health", "/health"));
        assert!(!route_matches("/health", "/health/live"));
        assert!(!route_matches("/Health", "/health"));
        assert!(!route_matches("/API/*", "/api/users"));
    }

    #[test]
    fn test_empty_pattern_list_matches_nothing() {
        assert!(!any_route_matches(&[], "/api"));
        let patterns = vec!["/a".to_string(), "/b/*".to_string()];
        assert!(any_route_matches(&patterns, "/b/c"));
    }
}
