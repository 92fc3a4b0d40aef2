//! Fuzzy matching for the table filter.

use fuzzy_matcher::FuzzyMatcher;
use fuzzy_matcher::skim::SkimMatcherV2;

/// Case-insensitive fuzzy matcher.
///
/// `"agsm"` matches `"agent-smith"`: pattern characters must appear in order
/// but need not be adjacent.
pub struct Matcher {
    inner: SkimMatcherV2,
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Matcher {
    pub fn new() -> Self {
        Self {
            inner: SkimMatcherV2::default().ignore_case(),
        }
    }

    pub fn matches(&self, text: &str, pattern: &str) -> bool {
        self.score(text, pattern).is_some()
    }

    /// Higher is better; `None` when the pattern does not match.
    pub fn score(&self, text: &str, pattern: &str) -> Option<i64> {
        self.inner.fuzzy_match(text, pattern)
    }

    pub fn matches_any<'a>(&self, texts: impl IntoIterator<Item = &'a str>, pattern: &str) -> bool {
        texts.into_iter().any(|text| self.matches(text, pattern))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fuzzy_match() {
        let matcher = Matcher::new();

        assert!(matcher.matches("agent-smith", "agsm"));
        assert!(matcher.matches("text-embedding-3-large", "emb3"));
        assert!(matcher.matches("gpt-4o-mini", "gpt-4o-mini"));

        assert!(matcher.matches("IRMA-V3", "irma"));
        assert!(matcher.matches("irma-v3", "IRMA"));

        assert!(!matcher.matches("mr-bond", "xyz"));
    }

    #[test]
    fn test_matches_any() {
        let matcher = Matcher::new();
        let fields = ["asst_irma_0", "irma", "gpt-4o"];
        assert!(matcher.matches_any(fields, "4o"));
        assert!(!matcher.matches_any(fields, "smith"));
    }

    #[test]
    fn test_exact_scores_higher() {
        let matcher = Matcher::new();
        let exact = matcher.score("irma", "irma").unwrap();
        let fuzzy = matcher.score("agent-irma-v3", "irma").unwrap();
        assert!(exact >= fuzzy);
        assert!(matcher.score("testar", "xyz").is_none());
    }
}
