//! Typed representation of a single policy rule, and the parsing of one from
//! the wire-format state event that carries it.

use crate::core::wire::{PolicyRuleContent, StateEvent};
use serde::{Deserialize, Serialize};
use wildmatch::WildMatch;

/// The kind of entity a rule targets. A rule names exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    User,
    Room,
    Server,
}

/// The intent of a rule. Only `Ban` and `Allow` influence projection;
/// `Opinion` and `Unknown` are cached but inert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Recommendation {
    Ban,
    Allow,
    /// `i in [-100, 100]`.
    Opinion(i64),
    Unknown,
}

impl Recommendation {
    /// Normalizes a recommendation string (stable id or legacy alias) from
    /// the wire. Returns `None` only when `opinion` carries an out-of-range
    /// value for `org.matrix.msc3845.opinion` — every other unrecognized
    /// string becomes `Unknown` rather than a parse failure, since an
    /// unknown recommendation is still a validly-shaped rule: being
    /// recognized governs projection, not validity.
    pub fn parse(recommendation: &str, opinion: Option<i64>) -> Option<Recommendation> {
        match recommendation {
            "m.ban" | "org.matrix.mjolnir.ban" => Some(Recommendation::Ban),
            "org.matrix.mjolnir.allow" => Some(Recommendation::Allow),
            "org.matrix.msc3845.opinion" => {
                let i = opinion?;
                if (-100..=100).contains(&i) {
                    Some(Recommendation::Opinion(i))
                } else {
                    None
                }
            }
            _ => Some(Recommendation::Unknown),
        }
    }
}

/// A glob or literal entity pattern. Any `*` or `?` makes it a glob.
#[derive(Debug, Clone)]
pub enum EntityPattern {
    Literal(String),
    Glob(WildMatch),
}

impl EntityPattern {
    pub fn compile(entity: &str) -> Self {
        if entity.contains('*') || entity.contains('?') {
            EntityPattern::Glob(WildMatch::new(entity))
        } else {
            EntityPattern::Literal(entity.to_string())
        }
    }

    pub fn is_glob(&self) -> bool {
        matches!(self, EntityPattern::Glob(_))
    }

    pub fn matches(&self, candidate: &str) -> bool {
        match self {
            EntityPattern::Literal(l) => l == candidate,
            EntityPattern::Glob(g) => g.matches(candidate),
        }
    }
}

/// A single, typed policy rule, decoded from a state event.
#[derive(Debug, Clone)]
pub struct Rule {
    pub source_event_id: String,
    pub source_state_key: String,
    pub entity: String,
    pub pattern: EntityPattern,
    pub kind: EntityKind,
    pub recommendation: Recommendation,
    pub reason: String,
}

impl Rule {
    /// Attempts to parse a rule out of a state event already known to carry
    /// `kind`. Returns `None` when the event does not satisfy the rule
    /// schema: content is empty/missing, `entity` is absent or empty, or
    /// `recommendation` fails to parse (only the `opinion` out-of-range
    /// case).
    pub fn from_event(event: &StateEvent, kind: EntityKind) -> Option<Rule> {
        if event.has_empty_content() {
            return None;
        }
        let content: PolicyRuleContent = serde_json::from_value(event.content.clone()).ok()?;
        if content.entity.is_empty() {
            return None;
        }
        // Server ACLs match hosts case-insensitively, so a server-kind rule
        // is normalized to lowercase at the point it's parsed; every
        // downstream cache, index, and self-protection check then compares
        // like-for-like without needing to know this happened.
        let entity = if kind == EntityKind::Server { content.entity.to_lowercase() } else { content.entity };
        let recommendation = Recommendation::parse(&content.recommendation, content.opinion)?;
        Some(Rule {
            source_event_id: event.event_id.clone(),
            source_state_key: event.state_key.clone(),
            pattern: EntityPattern::compile(&entity),
            entity,
            kind,
            recommendation,
            reason: content.reason.unwrap_or_default(),
        })
    }

    pub fn matches_entity(&self, candidate: &str) -> bool {
        if self.kind == EntityKind::Server {
            self.pattern.matches(&candidate.to_lowercase())
        } else {
            self.pattern.matches(candidate)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(entity: &str, recommendation: &str, reason: &str) -> StateEvent {
        StateEvent {
            event_id: "$abc".to_string(),
            room_id: "!policy:example.org".to_string(),
            event_type: "m.policy.rule.user".to_string(),
            state_key: format!("rule:{entity}"),
            content: json!({"entity": entity, "recommendation": recommendation, "reason": reason}),
            origin_server_ts: 0,
            sender: "@mod:example.org".to_string(),
            unsigned: json!({}),
        }
    }

    #[test]
    fn parses_a_valid_ban_rule() {
        let e = event("@spam:bad.example", "m.ban", "abuse");
        let rule = Rule::from_event(&e, EntityKind::User).unwrap();
        assert_eq!(rule.recommendation, Recommendation::Ban);
        assert_eq!(rule.reason, "abuse");
        assert!(rule.matches_entity("@spam:bad.example"));
    }

    #[test]
    fn legacy_ban_alias_normalizes_to_ban() {
        let e = event("@spam:bad.example", "org.matrix.mjolnir.ban", "abuse");
        let rule = Rule::from_event(&e, EntityKind::User).unwrap();
        assert_eq!(rule.recommendation, Recommendation::Ban);
    }

    #[test]
    fn rejects_empty_entity() {
        let e = event("", "m.ban", "abuse");
        assert!(Rule::from_event(&e, EntityKind::User).is_none());
    }

    #[test]
    fn rejects_out_of_range_opinion() {
        let mut e = event("@x:example.org", "org.matrix.msc3845.opinion", "");
        e.content = json!({"entity": "@x:example.org", "recommendation": "org.matrix.msc3845.opinion", "opinion": 500});
        assert!(Rule::from_event(&e, EntityKind::User).is_none());
    }

    #[test]
    fn wildcard_entity_compiles_to_glob() {
        let e = event("*.evil.example", "m.ban", "net");
        let rule = Rule::from_event(&e, EntityKind::Server).unwrap();
        assert!(rule.pattern.is_glob());
        assert!(rule.matches_entity("a.evil.example"));
        assert!(!rule.matches_entity("evil.example"));
    }

    #[test]
    fn server_entity_matching_is_case_insensitive() {
        let e = event("Matrix.Self", "m.ban", "self ban attempt");
        let rule = Rule::from_event(&e, EntityKind::Server).unwrap();
        assert_eq!(rule.entity, "matrix.self");
        assert!(rule.matches_entity("matrix.self"));
        assert!(rule.matches_entity("MATRIX.SELF"));
    }

    #[test]
    fn user_entity_matching_stays_case_sensitive() {
        let e = event("@Spam:bad.example", "m.ban", "abuse");
        let rule = Rule::from_event(&e, EntityKind::User).unwrap();
        assert!(rule.matches_entity("@Spam:bad.example"));
        assert!(!rule.matches_entity("@spam:bad.example"));
    }

    #[test]
    fn unrecognized_recommendation_becomes_unknown_not_invalid() {
        let e = event("@x:example.org", "org.matrix.msc9999.custom", "");
        let rule = Rule::from_event(&e, EntityKind::User).unwrap();
        assert_eq!(rule.recommendation, Recommendation::Unknown);
    }
}
