//! Minimal glob matching for export include/exclude patterns.
//!
//! Supports `*` (within one path segment), `?`, and a leading or embedded
//! `**` crossing segment boundaries. Patterns are matched against the
//! `/`-separated path relative to the exported subtree.

pub fn glob_match(pattern: &str, path: &str) -> bool {
    match_parts(
        &pattern.split('/').collect::<Vec<_>>(),
        &path.split('/').collect::<Vec<_>>(),
    )
}

fn match_parts(pattern: &[&str], path: &[&str]) -> bool {
    match (pattern.first(), path.first()) {
        (None, None) => true,
        (Some(&"**"), _) => {
            match_parts(&pattern[1..], path)
                || (!path.is_empty() && match_parts(pattern, &path[1..]))
        }
        (Some(p), Some(s)) => match_segment(p, s) && match_parts(&pattern[1..], &path[1..]),
        _ => false,
    }
}

fn match_segment(pattern: &str, segment: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = segment.chars().collect();
    match_chars(&p, &s)
}

fn match_chars(pattern: &[char], segment: &[char]) -> bool {
    match (pattern.first(), segment.first()) {
        (None, None) => true,
        (Some('*'), _) => {
            match_chars(&pattern[1..], segment)
                || (!segment.is_empty() && match_chars(pattern, &segment[1..]))
        }
        (Some('?'), Some(_)) => match_chars(&pattern[1..], &segment[1..]),
        (Some(p), Some(s)) if p == s => match_chars(&pattern[1..], &segment[1..]),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_and_star() {
        assert!(glob_match("files/a.txt", "files/a.txt"));
        assert!(glob_match("files/*.txt", "files/a.txt"));
        assert!(!glob_match("files/*.txt", "files/a.log"));
        assert!(!glob_match("files/*.txt", "files/sub/a.txt"));
    }

    #[test]
    fn question_mark() {
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "ac"));
    }

    #[test]
    fn double_star_crosses_segments() {
        assert!(glob_match("**/*.la", "lib/x.la"));
        assert!(glob_match("**/*.la", "lib/deep/nested/x.la"));
        assert!(glob_match("files/**", "files/any/depth/at/all"));
        assert!(!glob_match("**/*.la", "lib/x.so"));
    }

    #[test]
    fn empty_pattern_matches_nothing_else() {
        assert!(glob_match("", ""));
        assert!(!glob_match("", "a"));
    }
}
