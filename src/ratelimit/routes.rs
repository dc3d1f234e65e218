use regex::Regex;

/// A compiled route pattern.
///
/// `""` and `"*"` match everything; a trailing `*` matches by prefix; any
/// other pattern containing glob syntax is matched segment-wise (`*` and `?`
/// never cross a `/`). Patterns the glob grammar rejects compare exactly.
#[derive(Debug, Clone)]
pub enum RoutePattern {
    Any,
    Prefix(String),
    Glob(Regex),
    Exact(String),
}

impl RoutePattern {
    pub fn parse(pattern: &str) -> Self {
        let pattern = pattern.trim();
        if pattern.is_empty() || pattern == "*" {
            return Self::Any;
        }
        if let Some(prefix) = pattern.strip_suffix('*') {
            return Self::Prefix(prefix.to_string());
        }
        if !pattern.contains(['*', '?', '[', '\\']) {
            return Self::Exact(pattern.to_string());
        }

        match glob_to_regex(pattern).and_then(|re| Regex::new(&re).ok()) {
            Some(re) => Self::Glob(re),
            None => Self::Exact(pattern.to_string()),
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Prefix(prefix) => path.starts_with(prefix.as_str()),
            Self::Glob(re) => re.is_match(path),
            Self::Exact(pattern) => path == pattern,
        }
    }
}

pub fn matches_route(pattern: &str, path: &str) -> bool {
    RoutePattern::parse(pattern).matches(path)
}

fn glob_to_regex(pattern: &str) -> Option<String> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::from("^");
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '\\' => {
                i += 1;
                out.push_str(&escape(*chars.get(i)?));
            }
            '[' => {
                i = push_class(&chars, i + 1, &mut out)?;
                continue;
            }
            c => out.push_str(&escape(c)),
        }
        i += 1;
    }

    out.push('$');
    Some(out)
}

/// Translates a `[...]` class starting after the bracket; returns the index past `]`.
fn push_class(chars: &[char], mut i: usize, out: &mut String) -> Option<usize> {
    out.push('[');
    if matches!(chars.get(i), Some('^' | '!')) {
        out.push_str("^/");
        i += 1;
    }

    let mut ranges = 0;
    loop {
        if chars.get(i) == Some(&']') && ranges > 0 {
            out.push(']');
            return Some(i + 1);
        }

        let lo = class_char(chars, &mut i)?;
        out.push_str(&escape(lo));
        if chars.get(i) == Some(&'-') {
            i += 1;
            let hi = class_char(chars, &mut i)?;
            if hi < lo {
                return None;
            }
            out.push('-');
            out.push_str(&escape(hi));
        }
        ranges += 1;
    }
}

fn class_char(chars: &[char], i: &mut usize) -> Option<char> {
    let c = *chars.get(*i)?;
    let c = match c {
        '-' | ']' => return None,
        '\\' => {
            *i += 1;
            *chars.get(*i)?
        }
        c => c,
    };
    *i += 1;
    Some(c)
}

fn escape(c: char) -> String {
    regex::escape(c.encode_utf8(&mut [0; 4]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcards_match_everything() {
        assert!(matches_route("", "/anything"));
        assert!(matches_route("*", "/anything/at/all"));
        assert!(matches_route("  * ", "/"));
    }

    #[test]
    fn test_trailing_star_is_prefix_match() {
        assert!(matches_route("/api/v1/*", "/api/v1/payments"));
        assert!(matches_route("/api/*", "/api/v1/premium/resource"));
        assert!(matches_route("/api/*", "/api/"));
        assert!(!matches_route("/api/*", "/apix"));
        assert!(!matches_route("/api/v1/*", "/api/v2/payments"));
    }

    #[test]
    fn test_exact_match() {
        assert!(matches_route("/healthz", "/healthz"));
        assert!(!matches_route("/healthz", "/healthz/live"));
    }

    #[test]
    fn test_glob_stays_within_segment() {
        assert!(matches_route("/users/*/orders", "/users/42/orders"));
        assert!(!matches_route("/users/*/orders", "/users/42/x/orders"));
        assert!(matches_route("/v?/items", "/v2/items"));
        assert!(!matches_route("/v?/items", "/v10/items"));
    }

    #[test]
    fn test_character_classes() {
        assert!(matches_route("/v[12]/items", "/v1/items"));
        assert!(!matches_route("/v[12]/items", "/v3/items"));
        assert!(matches_route("/v[0-9]/items", "/v7/items"));
        assert!(matches_route("/v[^0-9]/items", "/vx/items"));
        assert!(!matches_route("/v[!0-9]/items", "/v7/items"));
    }

    #[test]
    fn test_escaped_metacharacters_are_literal() {
        assert!(matches_route(r"/files/\*/meta", "/files/*/meta"));
        assert!(!matches_route(r"/files/\*/meta", "/files/a/meta"));
        assert!(matches_route("/a.b/*/c", "/a.b/x/c"));
        assert!(!matches_route("/a.b/*/c", "/aXb/x/c"));
    }

    #[test]
    fn test_malformed_pattern_falls_back_to_exact() {
        assert!(matches!(RoutePattern::parse("/v[12/items"), RoutePattern::Exact(_)));
        assert!(matches_route("/v[12/items", "/v[12/items"));
        assert!(!matches_route("/v[12/items", "/v1/items"));
        assert!(matches!(RoutePattern::parse("/a[]b"), RoutePattern::Exact(_)));
        assert!(matches!(RoutePattern::parse("/a[z-a]b"), RoutePattern::Exact(_)));
    }
}
