use serde::{Deserialize, Serialize};

/// Handling tier chosen for one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tier {
    Inline,
    OracleOnly,
    ContainerLight,
    ContainerFull,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Inline => "inline",
            Tier::OracleOnly => "oracle-only",
            Tier::ContainerLight => "container-light",
            Tier::ContainerFull => "container-full",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub tier: Tier,
    pub model: &'static str,
    pub reason: &'static str,
}

const GREETINGS: &[&str] = &[
    "hi", "hello", "hey", "yo", "sup", "good morning", "good afternoon", "good evening",
    "hola", "สวัสดี",
];
const THANKS: &[&str] = &["thanks", "thank you", "thx", "ty", "appreciate it"];
const ACKS: &[&str] = &["ok", "okay", "k", "kk", "got it", "sounds good", "cool", "nice", "great"];
const ADMIN_COMMANDS: &[&str] = &["/start", "/help", "/status", "/model", "/reset", "/new"];
const SEARCH_LEXICON: &[&str] = &["search for", "look up", "find out", "remember when", "recall"];
const CODE_MARKERS: &[&str] = &["```", "fn ", "def ", "class ", "import ", "function ", "const ", "SELECT "];
const ANALYSIS_MARKERS: &[&str] = &["analyze", "compare", "explain why", "summarize", "review this"];

const LONG_MESSAGE_THRESHOLD: usize = 500;

/// Pure classification: given trimmed message text, decide tier/model/reason.
/// Deterministic; no side effects; length check takes priority over every
/// lexicon match except admin commands.
pub fn classify(text: &str) -> Classification {
    let trimmed = text.trim();
    let lower = trimmed.to_lowercase();

    if let Some(cmd) = ADMIN_COMMANDS.iter().find(|c| lower.starts_with(*c)) {
        let _ = cmd;
        return Classification {
            tier: Tier::Inline,
            model: "haiku",
            reason: "admin-cmd",
        };
    }

    if trimmed.chars().count() > LONG_MESSAGE_THRESHOLD {
        return Classification {
            tier: Tier::ContainerFull,
            model: "sonnet",
            reason: "analysis",
        };
    }

    if starts_with_any(&lower, GREETINGS) || starts_with_any(&lower, THANKS) {
        return Classification {
            tier: Tier::Inline,
            model: "haiku",
            reason: "greeting",
        };
    }

    if ends_with_ack(&lower) {
        return Classification {
            tier: Tier::Inline,
            model: "haiku",
            reason: "greeting",
        };
    }

    if contains_any(&lower, SEARCH_LEXICON) {
        return Classification {
            tier: Tier::OracleOnly,
            model: "haiku",
            reason: "knowledge",
        };
    }

    if contains_any(trimmed, CODE_MARKERS) {
        return Classification {
            tier: Tier::ContainerFull,
            model: "sonnet",
            reason: "code",
        };
    }

    if contains_any(&lower, ANALYSIS_MARKERS) {
        return Classification {
            tier: Tier::ContainerFull,
            model: "sonnet",
            reason: "analysis",
        };
    }

    Classification {
        tier: Tier::ContainerLight,
        model: "haiku",
        reason: "general",
    }
}

fn starts_with_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.starts_with(n))
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Acks must consume the *entire* trimmed string (modulo trailing punctuation).
fn ends_with_ack(lower: &str) -> bool {
    let stripped = lower.trim_end_matches(|c: char| c == '!' || c == '.' || c == '?');
    ACKS.iter().any(|a| *a == stripped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_is_inline() {
        let c = classify("hey there");
        assert_eq!(c.tier, Tier::Inline);
        assert_eq!(c.reason, "greeting");
    }

    #[test]
    fn ack_matches_full_string_only() {
        assert_eq!(classify("ok!").tier, Tier::Inline);
        assert_eq!(classify("ok, but also can you help me with something else").tier, Tier::ContainerLight);
    }

    #[test]
    fn admin_command_wins_over_length() {
        let long = format!("/status {}", "x".repeat(600));
        assert_eq!(classify(&long).tier, Tier::Inline);
    }

    #[test]
    fn length_over_500_forces_container_full() {
        let long = "a".repeat(501);
        let c = classify(&long);
        assert_eq!(c.tier, Tier::ContainerFull);
        assert_eq!(c.reason, "analysis");
    }

    #[test]
    fn length_exactly_500_falls_through() {
        let exact = "a".repeat(500);
        let c = classify(&exact);
        assert_eq!(c.tier, Tier::ContainerLight);
    }

    #[test]
    fn search_lexicon_is_oracle_only() {
        let c = classify("can you search for the latest release notes");
        assert_eq!(c.tier, Tier::OracleOnly);
    }

    #[test]
    fn code_markers_force_container_full() {
        let c = classify("```rust\nfn main() {}\n```");
        assert_eq!(c.tier, Tier::ContainerFull);
        assert_eq!(c.reason, "code");
    }

    #[test]
    fn analysis_markers_force_container_full() {
        let c = classify("can you analyze this document for me");
        assert_eq!(c.tier, Tier::ContainerFull);
        assert_eq!(c.reason, "analysis");
    }

    #[test]
    fn default_is_container_light() {
        let c = classify("what's the weather like in the mountains tomorrow");
        assert_eq!(c.tier, Tier::ContainerLight);
        assert_eq!(c.reason, "general");
    }

    #[test]
    fn tier_as_str_matches_wire_names() {
        assert_eq!(Tier::OracleOnly.as_str(), "oracle-only");
        assert_eq!(Tier::ContainerFull.as_str(), "container-full");
    }
}
