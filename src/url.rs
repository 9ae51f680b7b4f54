use ::url::Url;

/// Scheme/suffix prefixes the walkthrough can never run on: the page
/// context cannot be injected there, so navigation events for them are
/// suppressed and the machine stays where it is.
const RESTRICTED_PREFIXES: &[&str] = &[
    "chrome://",
    "chrome-extension://",
    "edge://",
    "brave://",
    "devtools://",
    "view-source:",
    "about:",
    "data:",
    "javascript:",
    "file://",
];

pub fn is_restricted(url: &str) -> bool {
    let lower = url.trim().to_ascii_lowercase();
    if RESTRICTED_PREFIXES
        .iter()
        .any(|prefix| lower.starts_with(prefix))
    {
        return true;
    }
    // PDFs render in the browser's viewer, which is a dead zone too.
    let without_query = lower
        .split(['?', '#'])
        .next()
        .unwrap_or(lower.as_str());
    without_query.ends_with(".pdf")
}

/// Trailing-slash-insensitive pathname, with "" meaning "/".
fn normalized_path(url: &Url) -> String {
    let path = url.path();
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn strip_query_and_fragment(raw: &str) -> &str {
    raw.split(['?', '#']).next().unwrap_or(raw)
}

/// Whether `current` already satisfies `expected` for routing purposes.
///
/// Origins must match and pathnames are compared after normalization;
/// query and fragment never matter. An expected pathname of "/" matches
/// any path on the same origin, so sanitized or default recorded URLs
/// don't force a same-origin re-navigation.
pub fn urls_match(current: &str, expected: &str) -> bool {
    match (Url::parse(current), Url::parse(expected)) {
        (Ok(current), Ok(expected)) => {
            if current.origin() != expected.origin() {
                return false;
            }
            let expected_path = normalized_path(&expected);
            expected_path == "/" || normalized_path(&current) == expected_path
        }
        // Unparseable recorded URLs happen (sanitized exports); fall back
        // to a string compare without query or fragment.
        _ => {
            strip_query_and_fragment(current)
                == strip_query_and_fragment(expected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_origin_same_path_matches() {
        assert!(urls_match("https://a.test/x", "https://a.test/x"));
        assert!(urls_match("https://a.test/x/", "https://a.test/x"));
        assert!(urls_match("https://a.test/x?q=1#frag", "https://a.test/x"));
    }

    #[test]
    fn root_expected_path_is_a_wildcard_within_origin() {
        assert!(urls_match("https://a.test/search?q=foo", "https://a.test/"));
        assert!(urls_match("https://a.test/deep/page", "https://a.test"));
        assert!(!urls_match("https://b.test/search", "https://a.test/"));
    }

    #[test]
    fn root_current_path_is_not_a_wildcard() {
        assert!(!urls_match("https://a.test/", "https://a.test/x"));
    }

    #[test]
    fn differing_paths_do_not_match() {
        assert!(!urls_match("https://a.test/x", "https://a.test/y"));
    }

    #[test]
    fn query_and_fragment_stripping_is_commutative() {
        let pairs = [
            ("https://a.test/x?q=1", "https://a.test/x#frag"),
            ("not a url?x=1", "not a url#y"),
            ("https://a.test/x", "https://a.test/x?a=b#c"),
        ];
        for (left, right) in pairs {
            assert_eq!(
                urls_match(left, right),
                urls_match(right, left),
                "not commutative for {} / {}",
                left,
                right
            );
        }
    }

    #[test]
    fn unparseable_urls_compare_as_strings() {
        assert!(urls_match("not a url?x=1", "not a url"));
        assert!(!urls_match("not a url", "other"));
    }

    #[test]
    fn restricted_urls() {
        assert!(is_restricted("chrome://settings"));
        assert!(is_restricted("about:blank"));
        assert!(is_restricted("data:text/html,hi"));
        assert!(is_restricted("file:///tmp/x.html"));
        assert!(is_restricted("https://a.test/manual.PDF"));
        assert!(is_restricted("https://a.test/doc.pdf?dl=1"));
        assert!(!is_restricted("https://a.test/pdf-viewer"));
        assert!(!is_restricted("https://a.test/app"));
    }
}
