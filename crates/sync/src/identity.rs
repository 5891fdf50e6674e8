//! Maps a phone number (plus optional contact hints) to a customer record.
//!
//! Resolution order: exact primary-phone match, exact alternate-phone match,
//! fuzzy name/email scoring against active customers, then creation when
//! authorized. Fuzzy scores are averaged over the signals present so one
//! strong signal is enough to clear the threshold on its own.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use threadline_core::domain::customer::{Customer, CustomerId};
use threadline_core::phone;
use threadline_db::repositories::{CustomerRepository, RepositoryError};

const PARTIAL_EMAIL_SCORE: f64 = 0.6;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdentityHints {
    pub name: Option<String>,
    pub email: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResolutionPolicy {
    pub create_if_missing: bool,
    pub fuzzy_match: bool,
    pub min_confidence: f64,
}

impl Default for ResolutionPolicy {
    fn default() -> Self {
        Self { create_if_missing: true, fuzzy_match: true, min_confidence: 0.8 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Fuzzy,
    Created,
    None,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Fuzzy => "fuzzy",
            Self::Created => "created",
            Self::None => "none",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedCustomer {
    pub customer: Option<Customer>,
    pub match_type: MatchType,
    pub confidence: f64,
}

pub struct IdentityResolver {
    customers: Arc<dyn CustomerRepository>,
}

impl IdentityResolver {
    pub fn new(customers: Arc<dyn CustomerRepository>) -> Self {
        Self { customers }
    }

    /// `phone` must already be normalized to E.164.
    pub async fn resolve(
        &self,
        phone: &str,
        hints: &IdentityHints,
        policy: &ResolutionPolicy,
    ) -> Result<ResolvedCustomer, RepositoryError> {
        if let Some(customer) = self.customers.find_by_primary_phone(phone).await? {
            return Ok(ResolvedCustomer {
                customer: Some(customer),
                match_type: MatchType::Exact,
                confidence: 1.0,
            });
        }

        if let Some(customer) = self.customers.find_by_alternate_phone(phone).await? {
            return Ok(ResolvedCustomer {
                customer: Some(customer),
                match_type: MatchType::Exact,
                confidence: 1.0,
            });
        }

        if policy.fuzzy_match && (hints.name.is_some() || hints.email.is_some()) {
            if let Some((customer, confidence)) =
                self.best_fuzzy_match(hints, policy.min_confidence).await?
            {
                return Ok(ResolvedCustomer {
                    customer: Some(customer),
                    match_type: MatchType::Fuzzy,
                    confidence,
                });
            }
        }

        if policy.create_if_missing {
            let customer = self.create_customer(phone, hints).await?;
            return Ok(ResolvedCustomer {
                customer: Some(customer),
                match_type: MatchType::Created,
                confidence: 1.0,
            });
        }

        Ok(ResolvedCustomer { customer: None, match_type: MatchType::None, confidence: 0.0 })
    }

    async fn best_fuzzy_match(
        &self,
        hints: &IdentityHints,
        min_confidence: f64,
    ) -> Result<Option<(Customer, f64)>, RepositoryError> {
        let candidates = self.customers.list_active().await?;

        let mut best: Option<(Customer, f64)> = None;
        for candidate in candidates {
            let score = fuzzy_score(&candidate, hints);
            if score >= min_confidence
                && best.as_ref().map(|(_, best_score)| score > *best_score).unwrap_or(true)
            {
                best = Some((candidate, score));
            }
        }

        Ok(best)
    }

    async fn create_customer(
        &self,
        phone: &str,
        hints: &IdentityHints,
    ) -> Result<Customer, RepositoryError> {
        let (first_name, last_name) = match hints.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => split_name(name),
            _ => ("Unknown".to_string(), format!("Caller {}", phone::tail(phone))),
        };

        let now = Utc::now();
        let customer = Customer {
            id: CustomerId::generate(),
            first_name,
            last_name,
            email: hints.email.clone(),
            primary_phone: phone.to_string(),
            alternate_phone: None,
            active: true,
            created_at: now,
            updated_at: now,
        };

        self.customers.save(customer.clone()).await?;
        Ok(customer)
    }
}

fn split_name(name: &str) -> (String, String) {
    match name.split_once(char::is_whitespace) {
        Some((first, rest)) => (first.to_string(), rest.trim().to_string()),
        None => (name.to_string(), String::new()),
    }
}

/// Score one candidate against the hints. Each signal present contributes a
/// score in [0, 1]; the result is the mean over the signals present, so a
/// candidate is never penalized for a hint the message did not carry.
fn fuzzy_score(candidate: &Customer, hints: &IdentityHints) -> f64 {
    let mut scores = Vec::with_capacity(2);

    if let Some(name) = hints.name.as_deref().map(str::trim).filter(|name| !name.is_empty()) {
        scores.push(name_score(&candidate.full_name(), name));
    }

    if let Some(email) = hints.email.as_deref().map(str::trim).filter(|email| !email.is_empty()) {
        scores.push(email_score(candidate.email.as_deref(), email));
    }

    if scores.is_empty() {
        return 0.0;
    }

    scores.iter().sum::<f64>() / scores.len() as f64
}

fn name_score(candidate_name: &str, hint_name: &str) -> f64 {
    let candidate_lower = candidate_name.to_lowercase();
    let hint_lower = hint_name.to_lowercase();

    if candidate_lower == hint_lower {
        return 1.0;
    }

    let candidate_tokens: HashSet<&str> = candidate_lower.split_whitespace().collect();
    let hint_tokens: HashSet<&str> = hint_lower.split_whitespace().collect();
    if candidate_tokens.is_empty() || hint_tokens.is_empty() {
        return 0.0;
    }

    let overlap = candidate_tokens.intersection(&hint_tokens).count();
    let denominator = candidate_tokens.len().max(hint_tokens.len());
    overlap as f64 / denominator as f64
}

fn email_score(candidate_email: Option<&str>, hint_email: &str) -> f64 {
    let Some(candidate_email) = candidate_email else {
        return 0.0;
    };

    let candidate_lower = candidate_email.to_lowercase();
    let hint_lower = hint_email.to_lowercase();

    if candidate_lower == hint_lower {
        1.0
    } else if candidate_lower.contains(&hint_lower) || hint_lower.contains(&candidate_lower) {
        PARTIAL_EMAIL_SCORE
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use threadline_core::domain::customer::{Customer, CustomerId};
    use threadline_db::repositories::{CustomerRepository, InMemoryCustomerRepository};

    use super::{IdentityHints, IdentityResolver, MatchType, ResolutionPolicy};

    async fn seeded_resolver(customers: Vec<Customer>) -> IdentityResolver {
        let repo = Arc::new(InMemoryCustomerRepository::default());
        for customer in customers {
            repo.save(customer).await.expect("seed customer");
        }
        IdentityResolver::new(repo)
    }

    fn customer(first: &str, last: &str, phone: &str, email: Option<&str>) -> Customer {
        let now = Utc::now();
        Customer {
            id: CustomerId::generate(),
            first_name: first.to_string(),
            last_name: last.to_string(),
            email: email.map(str::to_string),
            primary_phone: phone.to_string(),
            alternate_phone: None,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn primary_phone_match_is_exact() {
        let existing = customer("Sam", "Okafor", "+15551280001", None);
        let resolver = seeded_resolver(vec![existing.clone()]).await;

        let resolved = resolver
            .resolve("+15551280001", &IdentityHints::default(), &ResolutionPolicy::default())
            .await
            .expect("resolve");

        assert_eq!(resolved.match_type, MatchType::Exact);
        assert_eq!(resolved.confidence, 1.0);
        assert_eq!(resolved.customer.map(|c| c.id), Some(existing.id));
    }

    #[tokio::test]
    async fn alternate_phone_match_is_exact() {
        let mut existing = customer("Sam", "Okafor", "+15551280002", None);
        existing.alternate_phone = Some("+15551288888".to_string());
        let resolver = seeded_resolver(vec![existing.clone()]).await;

        let resolved = resolver
            .resolve("+15551288888", &IdentityHints::default(), &ResolutionPolicy::default())
            .await
            .expect("resolve");

        assert_eq!(resolved.match_type, MatchType::Exact);
        assert_eq!(resolved.customer.map(|c| c.id), Some(existing.id));
    }

    #[tokio::test]
    async fn exact_name_hint_resolves_fuzzily_from_new_number() {
        let existing = customer("Sam", "Okafor", "+15551280003", None);
        let resolver = seeded_resolver(vec![existing.clone()]).await;

        let hints = IdentityHints { name: Some("Sam Okafor".to_string()), email: None };
        let resolved = resolver
            .resolve("+15559990001", &hints, &ResolutionPolicy::default())
            .await
            .expect("resolve");

        assert_eq!(resolved.match_type, MatchType::Fuzzy);
        assert_eq!(resolved.confidence, 1.0);
        assert_eq!(resolved.customer.map(|c| c.id), Some(existing.id));
    }

    #[tokio::test]
    async fn weak_name_overlap_falls_below_threshold_and_creates() {
        let existing = customer("Sam", "Okafor", "+15551280004", None);
        let resolver = seeded_resolver(vec![existing.clone()]).await;

        // Shares one of two tokens: 0.5 < 0.8.
        let hints = IdentityHints { name: Some("Sam Porter".to_string()), email: None };
        let resolved = resolver
            .resolve("+15559990002", &hints, &ResolutionPolicy::default())
            .await
            .expect("resolve");

        assert_eq!(resolved.match_type, MatchType::Created);
        let created = resolved.customer.expect("created customer");
        assert_ne!(created.id, existing.id);
        assert_eq!(created.first_name, "Sam");
        assert_eq!(created.last_name, "Porter");
    }

    #[tokio::test]
    async fn exact_name_with_partial_email_still_clears_threshold() {
        let existing =
            customer("Dana", "Whitfield", "+15551280005", Some("dana.whitfield@example.com"));
        let resolver = seeded_resolver(vec![existing.clone()]).await;

        let hints = IdentityHints {
            name: Some("Dana Whitfield".to_string()),
            email: Some("dana.whitfield@example".to_string()),
        };
        let resolved = resolver
            .resolve("+15559990003", &hints, &ResolutionPolicy::default())
            .await
            .expect("resolve");

        // (1.0 + 0.6) / 2 = 0.8, right at the default threshold.
        assert_eq!(resolved.match_type, MatchType::Fuzzy);
        assert_eq!(resolved.customer.map(|c| c.id), Some(existing.id));
    }

    #[tokio::test]
    async fn creation_without_hints_uses_placeholder_name() {
        let resolver = seeded_resolver(vec![]).await;

        let resolved = resolver
            .resolve("+15551280006", &IdentityHints::default(), &ResolutionPolicy::default())
            .await
            .expect("resolve");

        assert_eq!(resolved.match_type, MatchType::Created);
        let created = resolved.customer.expect("created");
        assert_eq!(created.first_name, "Unknown");
        assert_eq!(created.last_name, "Caller 0006");
        assert_eq!(created.primary_phone, "+15551280006");
    }

    #[tokio::test]
    async fn unauthorized_creation_returns_none() {
        let resolver = seeded_resolver(vec![]).await;
        let policy = ResolutionPolicy { create_if_missing: false, ..ResolutionPolicy::default() };

        let resolved = resolver
            .resolve("+15551280007", &IdentityHints::default(), &policy)
            .await
            .expect("resolve");

        assert_eq!(resolved.match_type, MatchType::None);
        assert!(resolved.customer.is_none());
        assert_eq!(resolved.confidence, 0.0);
    }

    #[tokio::test]
    async fn fuzzy_matching_can_be_disabled() {
        let existing = customer("Sam", "Okafor", "+15551280008", None);
        let resolver = seeded_resolver(vec![existing.clone()]).await;

        let hints = IdentityHints { name: Some("Sam Okafor".to_string()), email: None };
        let policy = ResolutionPolicy { fuzzy_match: false, ..ResolutionPolicy::default() };
        let resolved =
            resolver.resolve("+15559990004", &hints, &policy).await.expect("resolve");

        assert_eq!(resolved.match_type, MatchType::Created);
    }
}
