//! White/blacklist filtering of discovered image names.
//!
//! Both lists hold regular expressions. Whitelist entries admit names,
//! blacklist entries reject them, and a blacklist match overrides a
//! whitelist match when both lists are configured.

use std::collections::HashSet;

use regex::Regex;
use tracing::debug;

/// A configured pattern that failed to compile. Collected rather than
/// aborting registry construction so one bad pattern cannot take the
/// whole registry offline.
#[derive(Debug)]
pub struct FailedRegex {
    pub pattern: String,
    pub error: regex::Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterMode {
    Both,
    White,
    Black,
    None,
}

/// Compiled white/black regex filter.
#[derive(Debug, Default)]
pub struct Filter {
    white: Vec<Regex>,
    black: Vec<Regex>,
    failed_white: Vec<FailedRegex>,
    failed_black: Vec<FailedRegex>,
}

impl Filter {
    /// Compile both lists. Empty pattern strings are dropped and compile
    /// failures are recorded, not returned.
    pub fn new(whitelist: &[String], blacklist: &[String]) -> Self {
        let (white, failed_white) = compile(whitelist);
        let (black, failed_black) = compile(blacklist);
        Self {
            white,
            black,
            failed_white,
            failed_black,
        }
    }

    /// Patterns from the whitelist that did not compile.
    pub fn failed_whitelist(&self) -> &[FailedRegex] {
        &self.failed_white
    }

    /// Patterns from the blacklist that did not compile.
    pub fn failed_blacklist(&self) -> &[FailedRegex] {
        &self.failed_black
    }

    fn mode(&self) -> FilterMode {
        match (self.white.is_empty(), self.black.is_empty()) {
            (false, false) => FilterMode::Both,
            (false, true) => FilterMode::White,
            (true, false) => FilterMode::Black,
            (true, true) => FilterMode::None,
        }
    }

    /// Split `names` into (valid, filtered). Every input name lands in
    /// exactly one of the two outputs, in input order.
    pub fn run(&self, names: &[String]) -> (Vec<String>, Vec<String>) {
        match self.mode() {
            // No lists configured: nothing to filter against.
            FilterMode::None => (names.to_vec(), Vec::new()),
            FilterMode::White => {
                let white = match_set(&self.white, names);
                split(names, |name| white.contains(name))
            }
            FilterMode::Black => {
                let black = match_set(&self.black, names);
                split(names, |name| !black.contains(name))
            }
            FilterMode::Both => {
                let (mut white, black) = std::thread::scope(|scope| {
                    let white = scope.spawn(|| match_set(&self.white, names));
                    let black = match_set(&self.black, names);
                    (white.join().unwrap_or_default(), black)
                });
                // Blacklist matches override the whitelist.
                for name in &black {
                    white.remove(name);
                }
                split(names, |name| white.contains(name))
            }
        }
    }
}

fn compile(patterns: &[String]) -> (Vec<Regex>, Vec<FailedRegex>) {
    let mut compiled = Vec::with_capacity(patterns.len());
    let mut failed = Vec::new();
    for pattern in patterns {
        if pattern.is_empty() {
            debug!("ignoring empty whitelist or blacklist regex");
            continue;
        }
        match Regex::new(pattern) {
            Ok(regex) => compiled.push(regex),
            Err(error) => failed.push(FailedRegex {
                pattern: pattern.clone(),
                error,
            }),
        }
    }
    (compiled, failed)
}

/// Run each regex over the full name list on its own thread and merge the
/// per-regex matches into one set.
fn match_set<'a>(regexes: &[Regex], names: &'a [String]) -> HashSet<&'a str> {
    std::thread::scope(|scope| {
        let handles: Vec<_> = regexes
            .iter()
            .map(|regex| {
                scope.spawn(move || {
                    names
                        .iter()
                        .filter(|name| regex.is_match(name))
                        .map(String::as_str)
                        .collect::<Vec<&str>>()
                })
            })
            .collect();

        let mut matches = HashSet::new();
        for handle in handles {
            matches.extend(handle.join().unwrap_or_default());
        }
        matches
    })
}

fn split(names: &[String], keep: impl Fn(&str) -> bool) -> (Vec<String>, Vec<String>) {
    let mut valid = Vec::new();
    let mut filtered = Vec::new();
    for name in names {
        if keep(name) {
            valid.push(name.clone());
        } else {
            filtered.push(name.clone());
        }
    }
    (valid, filtered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> Vec<String> {
        [
            "legitimate-postgresql-apb",
            "legitimate-mediawiki-apb",
            "totally-not-malicious-apb",
            "malicious-bar-apb",
            "specific-blacklist-apb",
            "foo-apb",
            "bar-apb",
            "rhscl-postgresql-apb",
            "baz-apb",
            "foobar-apb",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    fn whitelist() -> Vec<String> {
        [
            "^legitimate-.*-apb$",
            "^foo-apb$",
            "^bar-apb$",
            "^rhscl-postgresql-apb$",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    fn blacklist() -> Vec<String> {
        ["malicious", "^specific-blacklist-apb$"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn blacklist_override() -> Vec<String> {
        let mut list = blacklist();
        list.push("^foo-apb$".to_string());
        list
    }

    fn set_eq(expected: &[&str], actual: &[String]) -> bool {
        let expected: HashSet<&str> = expected.iter().copied().collect();
        let actual: HashSet<&str> = actual.iter().map(String::as_str).collect();
        expected == actual
    }

    #[test]
    fn only_blacklist_passes_unmatched_names() {
        let filter = Filter::new(&[], &blacklist());
        let (valid, filtered) = filter.run(&names());

        assert!(set_eq(
            &[
                "legitimate-postgresql-apb",
                "legitimate-mediawiki-apb",
                "foo-apb",
                "bar-apb",
                "rhscl-postgresql-apb",
                "baz-apb",
                "foobar-apb",
            ],
            &valid
        ));
        assert!(set_eq(
            &[
                "totally-not-malicious-apb",
                "malicious-bar-apb",
                "specific-blacklist-apb",
            ],
            &filtered
        ));
    }

    #[test]
    fn only_whitelist_filters_everything_else() {
        let filter = Filter::new(&whitelist(), &[]);
        let (valid, filtered) = filter.run(&names());

        assert!(set_eq(
            &[
                "legitimate-postgresql-apb",
                "legitimate-mediawiki-apb",
                "foo-apb",
                "bar-apb",
                "rhscl-postgresql-apb",
            ],
            &valid
        ));
        assert!(set_eq(
            &[
                "totally-not-malicious-apb",
                "malicious-bar-apb",
                "specific-blacklist-apb",
                "baz-apb",
                "foobar-apb",
            ],
            &filtered
        ));
    }

    #[test]
    fn blacklist_overrides_whitelist() {
        let filter = Filter::new(&whitelist(), &blacklist_override());
        let (valid, filtered) = filter.run(&names());

        assert!(set_eq(
            &[
                "legitimate-postgresql-apb",
                "legitimate-mediawiki-apb",
                "bar-apb",
                "rhscl-postgresql-apb",
            ],
            &valid
        ));
        // foo-apb appears in both lists, so it is excluded.
        assert!(set_eq(
            &[
                "foo-apb",
                "totally-not-malicious-apb",
                "malicious-bar-apb",
                "specific-blacklist-apb",
                "foobar-apb",
                "baz-apb",
            ],
            &filtered
        ));
    }

    #[test]
    fn both_lists_without_overlap_keep_whitelisted_names() {
        let filter = Filter::new(&whitelist(), &blacklist());
        let (valid, filtered) = filter.run(&names());

        assert!(set_eq(
            &[
                "foo-apb",
                "legitimate-postgresql-apb",
                "legitimate-mediawiki-apb",
                "bar-apb",
                "rhscl-postgresql-apb",
            ],
            &valid
        ));
        assert!(set_eq(
            &[
                "totally-not-malicious-apb",
                "malicious-bar-apb",
                "specific-blacklist-apb",
                "foobar-apb",
                "baz-apb",
            ],
            &filtered
        ));
    }

    #[test]
    fn no_lists_pass_everything() {
        let filter = Filter::new(&[], &[]);
        let (valid, filtered) = filter.run(&names());

        assert_eq!(valid, names());
        assert!(filtered.is_empty());
    }

    #[test]
    fn whitelist_with_no_matches_filters_everything() {
        let filter = Filter::new(&["^no-such-image$".to_string()], &[]);
        let (valid, filtered) = filter.run(&names());

        assert!(valid.is_empty());
        assert_eq!(filtered.len(), names().len());
    }

    #[test]
    fn empty_patterns_are_dropped() {
        let filter = Filter::new(&[String::new()], &[String::new()]);
        let (valid, filtered) = filter.run(&names());

        // Both lists end up empty, so everything passes.
        assert_eq!(valid, names());
        assert!(filtered.is_empty());
        assert!(filter.failed_whitelist().is_empty());
        assert!(filter.failed_blacklist().is_empty());
    }

    #[test]
    fn bad_patterns_are_collected_not_fatal() {
        let filter = Filter::new(
            &["[invalid".to_string(), "^foo-apb$".to_string()],
            &["(unclosed".to_string()],
        );

        assert_eq!(filter.failed_whitelist().len(), 1);
        assert_eq!(filter.failed_whitelist()[0].pattern, "[invalid");
        assert_eq!(filter.failed_blacklist().len(), 1);

        // The surviving whitelist pattern still applies.
        let (valid, _) = filter.run(&names());
        assert!(set_eq(&["foo-apb"], &valid));
    }

    #[test]
    fn every_name_lands_in_exactly_one_output() {
        let filter = Filter::new(&whitelist(), &blacklist());
        let input = names();
        let (valid, filtered) = filter.run(&input);

        assert_eq!(valid.len() + filtered.len(), input.len());
        let mut all: Vec<String> = valid;
        all.extend(filtered);
        all.sort();
        let mut expected = input;
        expected.sort();
        assert_eq!(all, expected);
    }
}
