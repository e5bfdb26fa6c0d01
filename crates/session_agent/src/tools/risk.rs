/// Command prefixes that always need explicit confirmation, even in
/// unattended mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskRules {
    prefixes: Vec<String>,
}

impl RiskRules {
    #[must_use]
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            prefixes: prefixes
                .into_iter()
                .map(|prefix| prefix.as_ref().trim().to_lowercase())
                .filter(|prefix| !prefix.is_empty())
                .collect(),
        }
    }

    /// Case-insensitive: risky when the command starts with a prefix or its
    /// first word equals one.
    #[must_use]
    pub fn is_risky(&self, command: &str) -> bool {
        let lowered = command.trim().to_lowercase();
        let first_word = lowered.split_whitespace().next().unwrap_or_default();

        self.prefixes
            .iter()
            .any(|prefix| lowered.starts_with(prefix.as_str()) || first_word == prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_prefix_and_first_word_case_insensitively() {
        let rules = RiskRules::new(["stop", "Kill", " ban "]);

        assert!(rules.is_risky("stop"));
        assert!(rules.is_risky("STOP now"));
        assert!(rules.is_risky("  kill @e"));
        assert!(rules.is_risky("ban griefer"));
        assert!(!rules.is_risky("say stop"));
        assert!(!rules.is_risky("list"));
    }

    #[test]
    fn blank_prefixes_are_ignored() {
        let rules = RiskRules::new(["", "   "]);
        assert!(!rules.is_risky("anything"));
    }
}
