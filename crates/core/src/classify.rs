//! Message-body heuristics: follow-up detection and priority derivation.
//!
//! The keyword lists are operational heuristics, not contracts. Callers depend
//! only on the [`MessageClassifier`] trait so deployments can swap the default
//! keyword matcher for something smarter without touching the resolvers.

use serde::{Deserialize, Serialize};

use crate::domain::conversation::ConversationPriority;

pub trait MessageClassifier: Send + Sync {
    /// Does this body read as a continuation of a recently resolved thread?
    fn is_follow_up(&self, body: &str) -> bool;

    /// Priority a brand-new conversation should open with.
    fn priority(&self, body: &str) -> ConversationPriority;

    fn is_emergency(&self, body: &str) -> bool {
        self.priority(body) == ConversationPriority::Emergency
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordClassifierConfig {
    pub follow_up_keywords: Vec<String>,
    pub emergency_keywords: Vec<String>,
    pub high_priority_keywords: Vec<String>,
}

impl Default for KeywordClassifierConfig {
    fn default() -> Self {
        Self {
            follow_up_keywords: vec![
                "follow up".to_string(),
                "following up".to_string(),
                "still".to_string(),
                "again".to_string(),
                "not fixed".to_string(),
                "came back".to_string(),
                "same issue".to_string(),
                "same problem".to_string(),
            ],
            emergency_keywords: vec![
                "emergency".to_string(),
                "flood".to_string(),
                "flooding".to_string(),
                "gas leak".to_string(),
                "smell gas".to_string(),
                "burst pipe".to_string(),
                "no heat".to_string(),
                "sparking".to_string(),
                "carbon monoxide".to_string(),
                "sewage".to_string(),
            ],
            high_priority_keywords: vec![
                "urgent".to_string(),
                "asap".to_string(),
                "today".to_string(),
                "leak".to_string(),
                "no hot water".to_string(),
            ],
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct KeywordClassifier {
    config: KeywordClassifierConfig,
}

impl KeywordClassifier {
    pub fn new(config: KeywordClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &KeywordClassifierConfig {
        &self.config
    }

    fn contains_any(body: &str, keywords: &[String]) -> bool {
        keywords.iter().any(|keyword| body.contains(keyword.as_str()))
    }
}

impl MessageClassifier for KeywordClassifier {
    fn is_follow_up(&self, body: &str) -> bool {
        let normalized = body.to_ascii_lowercase();
        Self::contains_any(&normalized, &self.config.follow_up_keywords)
    }

    fn priority(&self, body: &str) -> ConversationPriority {
        let normalized = body.to_ascii_lowercase();
        if Self::contains_any(&normalized, &self.config.emergency_keywords) {
            ConversationPriority::Emergency
        } else if Self::contains_any(&normalized, &self.config.high_priority_keywords) {
            ConversationPriority::High
        } else {
            ConversationPriority::Medium
        }
    }
}
