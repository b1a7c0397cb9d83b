//! Property tests for subject pattern matching.

use broker_core::subject_matches;
use proptest::prelude::*;

fn token() -> impl Strategy<Value = String> {
    proptest::string::string_regex("[a-z][a-z0-9_]{0,8}").unwrap()
}

fn subject(max_tokens: usize) -> impl Strategy<Value = String> {
    prop::collection::vec(token(), 1..=max_tokens).prop_map(|tokens| tokens.join("."))
}

proptest! {
    /// A subject always matches itself verbatim.
    #[test]
    fn subject_matches_itself(s in subject(6)) {
        prop_assert!(subject_matches(&s, &s));
    }

    /// `prefix.>` matches any non-empty extension of the prefix.
    #[test]
    fn tail_wildcard_matches_extensions(prefix in subject(3), rest in subject(3)) {
        let pattern = format!("{}.>", prefix);
        let extended = format!("{}.{}", prefix, rest);
        prop_assert!(subject_matches(&pattern, &extended));
        // But never the bare prefix itself.
        prop_assert!(!subject_matches(&pattern, &prefix));
    }

    /// Replacing any single token with `*` preserves the match.
    #[test]
    fn star_matches_any_single_token(s in subject(6), index in 0usize..6) {
        let tokens: Vec<&str> = s.split('.').collect();
        let index = index % tokens.len();
        let pattern: Vec<&str> = tokens
            .iter()
            .enumerate()
            .map(|(i, t)| if i == index { "*" } else { *t })
            .collect();
        prop_assert!(subject_matches(&pattern.join("."), &s));
    }

    /// A pattern with a different token count (and no `>`) never matches.
    #[test]
    fn length_mismatch_never_matches(s in subject(4), extra in token()) {
        let longer = format!("{}.{}", s, extra);
        prop_assert!(!subject_matches(&s, &longer));
        prop_assert!(!subject_matches(&longer, &s));
    }
}
