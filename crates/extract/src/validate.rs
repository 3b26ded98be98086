//! Output-contract enforcement and sentinel resolution.
//!
//! Every payload, record and judgment passes through [`SchemaValidator`]
//! before it is aggregated or returned. Enum strings that are close to a
//! valid label are repaired; anything else is rejected.

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::attempt::{AttemptState, ExtractionAttempt, ParseStatus, StateError};
use crate::normalizer::{TermNormalizer, TermSet, key};
use crate::parse::ParsedReply;
use crate::schema::{
    AggregatedJudgment, Centrality, Characterization, ExtractionPayload, INSUFFICIENT_DATA,
    RecordBody, RelationshipRecord, RelationshipType, Sentiment, Sentinel, Verdict,
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaViolation {
    #[error("missing required field {0}")]
    MissingField(&'static str),

    #[error("field {0} has the wrong type")]
    WrongType(&'static str),

    #[error("unknown {field} value {value:?}")]
    UnknownValue { field: &'static str, value: String },

    #[error("payload describes {found}, expected {expected}")]
    CountryMismatch { expected: String, found: String },

    #[error("not-discussed centrality with substantive content")]
    SentinelWithContent,

    #[error("characterized record has centrality not-discussed")]
    CharacterizedWithoutFocus,

    #[error("unexpected sentinel {0:?}")]
    UnexpectedSentinel(Sentinel),

    #[error("description is empty")]
    EmptyDescription,

    #[error("description has {0} sentences, at most 2 allowed")]
    DescriptionTooLong(usize),

    #[error("judgment has no provenance")]
    MissingProvenance,
}

const RELATIONSHIP_ALIASES: &[(&str, RelationshipType)] = &[
    ("support", RelationshipType::SupportAndAlignment),
    ("alignment", RelationshipType::SupportAndAlignment),
    ("supportive", RelationshipType::SupportAndAlignment),
    ("opposition", RelationshipType::OppositionAndCriticism),
    ("criticism", RelationshipType::OppositionAndCriticism),
    ("critical", RelationshipType::OppositionAndCriticism),
    ("passing mention", RelationshipType::Passing),
    ("passing reference", RelationshipType::Passing),
    ("mention", RelationshipType::Passing),
    ("power", RelationshipType::PowerDynamics),
    ("power dynamic", RelationshipType::PowerDynamics),
    ("historical ties", RelationshipType::HistoricalOrRegionalTies),
    ("regional ties", RelationshipType::HistoricalOrRegionalTies),
    ("historical", RelationshipType::HistoricalOrRegionalTies),
    ("cooperation", RelationshipType::FunctionalCooperation),
    ("functional", RelationshipType::FunctionalCooperation),
    ("conflict", RelationshipType::ConflictAndSecurity),
    ("security", RelationshipType::ConflictAndSecurity),
];

const SENTIMENT_ALIASES: &[(&str, Sentiment)] = &[
    ("negative", Sentiment::Critical),
    ("adversarial", Sentiment::Hostile),
    ("positive", Sentiment::Friendly),
    ("warm", Sentiment::Friendly),
    ("supportive", Sentiment::Cooperative),
    ("ambivalent", Sentiment::Mixed),
    ("balanced", Sentiment::Mixed),
    ("neutral tone", Sentiment::Neutral),
];

const CENTRALITY_ALIASES: &[(&str, Centrality)] = &[
    ("central", Centrality::Major),
    ("primary", Centrality::Major),
    ("high", Centrality::Major),
    ("minor", Centrality::Passing),
    ("peripheral", Centrality::Passing),
    ("low", Centrality::Passing),
    ("not discussed", Centrality::NotDiscussed),
    ("none", Centrality::NotDiscussed),
    ("absent", Centrality::NotDiscussed),
];

/// Abbreviations that end in a period without ending a sentence.
const TITLES: &[&str] = &["mr", "mrs", "ms", "dr", "st", "no", "vs", "etc"];

pub struct SchemaValidator {
    similarity_threshold: f64,
    normalizer: TermNormalizer,
}

impl Default for SchemaValidator {
    fn default() -> Self {
        Self::new(0.8)
    }
}

impl SchemaValidator {
    pub fn new(similarity_threshold: f64) -> Self {
        Self {
            similarity_threshold,
            normalizer: TermNormalizer::new(),
        }
    }

    pub fn with_normalizer(mut self, normalizer: TermNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn normalizer(&self) -> &TermNormalizer {
        &self.normalizer
    }

    /// Move a completed attempt to `Validated` or `Rejected`.
    pub fn validate_attempt(&self, mut attempt: ExtractionAttempt) -> Result<ExtractionAttempt, StateError> {
        match attempt.state() {
            AttemptState::Completed(ParseStatus::Ok) => {}
            AttemptState::Completed(status) => {
                attempt.reject(status.label())?;
                return Ok(attempt);
            }
            // reject() reports the illegal transition
            _ => {
                attempt.reject("not completed")?;
                return Ok(attempt);
            }
        }

        let resolved = match attempt.reply() {
            Some(reply) => self.resolve_reply(reply, attempt.target()),
            None => Err(SchemaViolation::MissingField("reply")),
        };

        match resolved {
            Ok(payload) => attempt.validate(payload)?,
            Err(violation) => {
                warn!(
                    unit = %attempt.unit().id(),
                    target = attempt.target(),
                    violation = %violation,
                    "Rejected extraction reply"
                );
                attempt.reject(violation.to_string())?;
            }
        }
        Ok(attempt)
    }

    /// Turn a parsed per-record reply into a validated payload.
    pub fn resolve_reply(&self, reply: &ParsedReply, target: &str) -> Result<ExtractionPayload, SchemaViolation> {
        match reply {
            ParsedReply::Sentinel(sentinel) => Ok(ExtractionPayload::sentinel(*sentinel)),
            ParsedReply::Object(map) => self.resolve_object(map, target),
        }
    }

    fn resolve_object(&self, map: &Map<String, Value>, target: &str) -> Result<ExtractionPayload, SchemaViolation> {
        if let Some(found) = optional_string(map, "country")? {
            if !self.normalizer.same_country(&found, target) {
                return Err(SchemaViolation::CountryMismatch {
                    expected: target.to_string(),
                    found,
                });
            }
        }

        let centrality_raw = required_string(map, "centrality")?;
        let centrality = self
            .repair_centrality(&centrality_raw)
            .ok_or(SchemaViolation::UnknownValue {
                field: "centrality",
                value: centrality_raw,
            })?;

        let mut themes = TermSet::new();
        for theme in string_list(map, "themes")? {
            if let Some(clean) = self.normalizer.clean(&theme) {
                themes.insert(clean);
            }
        }
        let mut associations = TermSet::new();
        for name in string_list(map, "associations")? {
            if let Some(clean) = self.normalizer.association(&name) {
                if !self.normalizer.same_country(&clean, target) {
                    associations.insert(clean);
                }
            }
        }

        if centrality == Centrality::NotDiscussed {
            return if themes.is_empty() && associations.is_empty() {
                Ok(ExtractionPayload::sentinel(Sentinel::NotDiscussed))
            } else {
                Err(SchemaViolation::SentinelWithContent)
            };
        }

        let relationship_raw = required_string(map, "relationship_type")?;
        let relationship_type = self
            .repair_relationship_type(&relationship_raw)
            .ok_or(SchemaViolation::UnknownValue {
                field: "relationship_type",
                value: relationship_raw,
            })?;

        let sentiment_raw = required_string(map, "sentiment")?;
        let sentiment = self
            .repair_sentiment(&sentiment_raw)
            .ok_or(SchemaViolation::UnknownValue {
                field: "sentiment",
                value: sentiment_raw,
            })?;

        let summary = optional_string(map, "summary")?.map(|s| s.trim().to_string());

        Ok(ExtractionPayload::Characterized(Characterization {
            country: target.to_string(),
            relationship_type,
            themes: themes.into_vec(),
            centrality,
            sentiment,
            associations: associations.into_vec(),
            summary,
        }))
    }

    /// Structural check on an emitted record.
    pub fn check_record(&self, record: &RelationshipRecord) -> Result<(), SchemaViolation> {
        match &record.body {
            RecordBody::NotDiscussed => Ok(()),
            RecordBody::Characterized(c) => {
                if c.centrality == Centrality::NotDiscussed {
                    return Err(SchemaViolation::CharacterizedWithoutFocus);
                }
                if !self.normalizer.same_country(&c.country, &record.target) {
                    return Err(SchemaViolation::CountryMismatch {
                        expected: record.target.clone(),
                        found: c.country.clone(),
                    });
                }
                Ok(())
            }
        }
    }

    pub fn check_judgment(&self, judgment: &AggregatedJudgment) -> Result<(), SchemaViolation> {
        check_description(&judgment.description)?;
        if !judgment.is_insufficient() && judgment.provenance.is_empty() {
            return Err(SchemaViolation::MissingProvenance);
        }
        Ok(())
    }

    /// Validate a `{relationship_type, description}` reply.
    pub fn resolve_judgment_reply(&self, reply: &ParsedReply) -> Result<(Verdict, String), SchemaViolation> {
        let map = match reply {
            ParsedReply::Object(map) => map,
            ParsedReply::Sentinel(sentinel) => return Err(SchemaViolation::UnexpectedSentinel(*sentinel)),
        };

        let raw = required_string(map, "relationship_type")?;
        let verdict = if key(&raw) == key(INSUFFICIENT_DATA) || key(&raw) == "insufficient data" {
            Verdict::InsufficientData
        } else {
            let repaired = self
                .repair_relationship_type(&raw)
                .ok_or(SchemaViolation::UnknownValue {
                    field: "relationship_type",
                    value: raw,
                })?;
            Verdict::Relationship(repaired)
        };

        let description = required_string(map, "description")?.trim().to_string();
        check_description(&description)?;
        Ok((verdict, description))
    }

    pub fn repair_relationship_type(&self, raw: &str) -> Option<RelationshipType> {
        let domain: Vec<(RelationshipType, &str)> = RelationshipType::ALL.iter().map(|t| (*t, t.label())).collect();
        self.repair(raw, &domain, RELATIONSHIP_ALIASES)
    }

    pub fn repair_sentiment(&self, raw: &str) -> Option<Sentiment> {
        let domain: Vec<(Sentiment, &str)> = Sentiment::ALL.iter().map(|s| (*s, s.label())).collect();
        self.repair(raw, &domain, SENTIMENT_ALIASES)
    }

    pub fn repair_centrality(&self, raw: &str) -> Option<Centrality> {
        let domain: Vec<(Centrality, &str)> = Centrality::ALL.iter().map(|c| (*c, c.label())).collect();
        self.repair(raw, &domain, CENTRALITY_ALIASES)
    }

    /// exact -> normalized -> alias -> nearest label above the threshold
    fn repair<T: Copy>(&self, raw: &str, domain: &[(T, &str)], aliases: &[(&str, T)]) -> Option<T> {
        let raw = raw.trim();
        if let Some((value, _)) = domain.iter().find(|(_, label)| *label == raw) {
            return Some(*value);
        }

        let raw_key = key(&raw.replace(['-', '_'], " "));
        if raw_key.is_empty() {
            return None;
        }
        if let Some((value, _)) = domain
            .iter()
            .find(|(_, label)| key(&label.replace('-', " ")) == raw_key)
        {
            return Some(*value);
        }
        if let Some((_, value)) = aliases.iter().find(|(alias, _)| *alias == raw_key) {
            return Some(*value);
        }

        let (best, score) = domain
            .iter()
            .map(|(value, label)| {
                let label_key = key(&label.replace('-', " "));
                (*value, strsim::normalized_levenshtein(&raw_key, &label_key))
            })
            .fold(None, |best: Option<(T, f64)>, (value, score)| match best {
                Some((_, s)) if s >= score => best,
                _ => Some((value, score)),
            })?;

        (score >= self.similarity_threshold).then_some(best)
    }
}

fn check_description(description: &str) -> Result<(), SchemaViolation> {
    if description.trim().is_empty() {
        return Err(SchemaViolation::EmptyDescription);
    }
    let sentences = count_sentences(description);
    if sentences > 2 {
        return Err(SchemaViolation::DescriptionTooLong(sentences));
    }
    Ok(())
}

/// Sentence count that does not split on "U.S." or "Mr." style abbreviations.
pub fn count_sentences(text: &str) -> usize {
    let words: Vec<&str> = text.split_whitespace().collect();
    let mut count = 0;

    for (i, word) in words.iter().enumerate() {
        let trimmed = word.trim_end_matches(['"', '\'', ')', '’', '”']);
        if !trimmed.ends_with(['.', '!', '?']) {
            continue;
        }
        let is_last = i + 1 == words.len();
        if !is_last && trimmed.ends_with('.') {
            let stem = trimmed.trim_end_matches('.');
            let next_starts_lower = words[i + 1]
                .chars()
                .next()
                .is_some_and(|c| c.is_lowercase() || c.is_ascii_digit());
            if stem.contains('.') || TITLES.contains(&stem.to_lowercase().as_str()) || next_starts_lower {
                continue;
            }
        }
        count += 1;
    }

    let ends_open = words
        .last()
        .is_some_and(|w| !w.trim_end_matches(['"', '\'', ')', '’', '”']).ends_with(['.', '!', '?']));
    if ends_open {
        count += 1;
    }
    count
}

fn required_string(map: &Map<String, Value>, field: &'static str) -> Result<String, SchemaViolation> {
    optional_string(map, field)?.ok_or(SchemaViolation::MissingField(field))
}

fn optional_string(map: &Map<String, Value>, field: &'static str) -> Result<Option<String>, SchemaViolation> {
    match map.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(SchemaViolation::WrongType(field)),
    }
}

/// A list of strings, or one comma/semicolon separated string.
fn string_list(map: &Map<String, Value>, field: &'static str) -> Result<Vec<String>, SchemaViolation> {
    match map.get(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(s.split([',', ';']).map(str::to_string).collect()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                _ => Err(SchemaViolation::WrongType(field)),
            })
            .collect(),
        Some(_) => Err(SchemaViolation::WrongType(field)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempt::ExtractionUnit;
    use serde_json::json;

    fn object(value: Value) -> ParsedReply {
        match value {
            Value::Object(map) => ParsedReply::Object(map),
            _ => panic!("not an object"),
        }
    }

    fn characterized(payload: ExtractionPayload) -> Characterization {
        match payload {
            ExtractionPayload::Characterized(c) => c,
            other => panic!("expected characterization, got {:?}", other),
        }
    }

    #[test]
    fn test_enum_repair() {
        let validator = SchemaValidator::default();

        assert_eq!(
            validator.repair_relationship_type("Opposition and Criticism"),
            Some(RelationshipType::OppositionAndCriticism)
        );
        assert_eq!(
            validator.repair_relationship_type("opposition & criticism"),
            Some(RelationshipType::OppositionAndCriticism)
        );
        assert_eq!(
            validator.repair_relationship_type("Oppositon and Critcism"),
            Some(RelationshipType::OppositionAndCriticism)
        );
        assert_eq!(validator.repair_relationship_type("opposition"), Some(RelationshipType::OppositionAndCriticism));
        assert_eq!(validator.repair_relationship_type("Friendship"), None);

        assert_eq!(validator.repair_sentiment("Hostile"), Some(Sentiment::Hostile));
        assert_eq!(validator.repair_sentiment("negative"), Some(Sentiment::Critical));
        assert_eq!(validator.repair_sentiment("furious"), None);

        assert_eq!(validator.repair_centrality("Not Discussed"), Some(Centrality::NotDiscussed));
        assert_eq!(validator.repair_centrality("not_discussed"), Some(Centrality::NotDiscussed));
        assert_eq!(validator.repair_centrality("MAJOR"), Some(Centrality::Major));
    }

    #[test]
    fn test_resolve_object_cleans_and_fills() {
        let validator = SchemaValidator::default();
        let reply = object(json!({
            "relationship_type": "Opposition and Criticism",
            "themes": "border dispute; Border Dispute, sanctions.",
            "centrality": "major",
            "sentiment": "hostile",
            "associations": ["U.S.", "USA", "Eastoria"],
            "summary": "Eastoria is accused of aggression."
        }));

        let c = characterized(validator.resolve_reply(&reply, "Eastoria").unwrap());
        assert_eq!(c.country, "Eastoria");
        assert_eq!(c.themes, vec!["border dispute", "sanctions"]);
        assert_eq!(c.associations, vec!["United States"]);
        assert_eq!(c.summary.as_deref(), Some("Eastoria is accused of aggression."));
    }

    #[test]
    fn test_out_of_domain_relationship_is_rejected() {
        let validator = SchemaValidator::default();
        let reply = object(json!({
            "country": "Eastoria",
            "relationship_type": "Friendship",
            "centrality": "major",
            "sentiment": "friendly",
        }));

        assert!(matches!(
            validator.resolve_reply(&reply, "Eastoria"),
            Err(SchemaViolation::UnknownValue { field: "relationship_type", .. })
        ));
    }

    #[test]
    fn test_country_mismatch_is_rejected() {
        let validator = SchemaValidator::default();
        let reply = object(json!({
            "country": "Northland",
            "relationship_type": "Passing",
            "centrality": "passing",
            "sentiment": "neutral",
        }));

        assert!(matches!(
            validator.resolve_reply(&reply, "Eastoria"),
            Err(SchemaViolation::CountryMismatch { .. })
        ));
    }

    #[test]
    fn test_neighbouring_states_are_not_merged() {
        let validator = SchemaValidator::default();
        let about_sudan = object(json!({
            "country": "Sudan",
            "relationship_type": "Conflict and Security",
            "centrality": "major",
            "sentiment": "hostile",
            "associations": ["South Sudan", "Chad", "the Republic of Sudan"],
        }));

        assert!(matches!(
            validator.resolve_reply(&about_sudan, "South Sudan"),
            Err(SchemaViolation::CountryMismatch { .. })
        ));

        let c = characterized(validator.resolve_reply(&about_sudan, "Sudan").unwrap());
        assert_eq!(c.associations, vec!["Chad", "South Sudan"]);
    }

    #[test]
    fn test_not_discussed_centrality() {
        let validator = SchemaValidator::default();
        let empty = object(json!({
            "country": "Eastoria",
            "relationship_type": "Passing",
            "centrality": "not discussed",
            "sentiment": "neutral",
            "themes": [],
        }));
        assert!(validator.resolve_reply(&empty, "Eastoria").unwrap().is_not_discussed());

        let with_content = object(json!({
            "country": "Eastoria",
            "relationship_type": "Passing",
            "centrality": "not-discussed",
            "sentiment": "neutral",
            "themes": ["trade"],
        }));
        assert_eq!(
            validator.resolve_reply(&with_content, "Eastoria"),
            Err(SchemaViolation::SentinelWithContent)
        );
    }

    #[test]
    fn test_validate_attempt_transitions() {
        let validator = SchemaValidator::default();
        let unit = ExtractionUnit::synthesis("Westmark", "Eastoria");

        let mut good = ExtractionAttempt::new(unit.clone(), "Eastoria");
        good.begin().unwrap();
        good.succeed("x".into(), ParsedReply::Sentinel(Sentinel::NotDiscussed), 1).unwrap();
        let good = validator.validate_attempt(good).unwrap();
        assert_eq!(good.state(), AttemptState::Validated);

        let mut bad = ExtractionAttempt::new(unit.clone(), "Eastoria");
        bad.begin().unwrap();
        bad.succeed(
            "x".into(),
            object(json!({"relationship_type": "Alliance", "centrality": "major", "sentiment": "friendly"})),
            1,
        )
        .unwrap();
        let bad = validator.validate_attempt(bad).unwrap();
        assert_eq!(bad.state(), AttemptState::Rejected);
        assert!(bad.usable_payload().is_none());

        let mut timed_out = ExtractionAttempt::new(unit, "Eastoria");
        timed_out.begin().unwrap();
        timed_out.fail(ParseStatus::Timeout, None, "timed out", 3).unwrap();
        let timed_out = validator.validate_attempt(timed_out).unwrap();
        assert_eq!(timed_out.state(), AttemptState::Rejected);
    }

    #[test]
    fn test_sentence_counting() {
        assert_eq!(count_sentences("Westmark opposes Eastoria."), 1);
        assert_eq!(count_sentences("Relations with the U.S. are tense. Westmark sees itself as a victim."), 2);
        assert_eq!(count_sentences("One. Two. Three."), 3);
        assert_eq!(count_sentences("No terminal punctuation"), 1);
        assert_eq!(count_sentences("Mr. Smith spoke. It went well!"), 2);
    }

    #[test]
    fn test_judgment_checks() {
        let validator = SchemaValidator::default();
        let mut judgment = AggregatedJudgment {
            source: "Westmark".into(),
            target: "Eastoria".into(),
            relationship_type: Verdict::Relationship(RelationshipType::OppositionAndCriticism),
            description: "Westmark criticises Eastoria.".into(),
            provenance: vec!["r1".into()],
        };
        assert!(validator.check_judgment(&judgment).is_ok());

        judgment.provenance.clear();
        assert_eq!(validator.check_judgment(&judgment), Err(SchemaViolation::MissingProvenance));

        judgment.relationship_type = Verdict::InsufficientData;
        assert!(validator.check_judgment(&judgment).is_ok());

        judgment.description = "A. B. C.".into();
        assert_eq!(validator.check_judgment(&judgment), Err(SchemaViolation::DescriptionTooLong(3)));
    }

    #[test]
    fn test_resolve_judgment_reply() {
        let validator = SchemaValidator::default();
        let reply = object(json!({
            "relationship_type": "conflict and security",
            "description": "Westmark frames Eastoria as a military threat."
        }));
        let (verdict, description) = validator.resolve_judgment_reply(&reply).unwrap();
        assert_eq!(verdict, Verdict::Relationship(RelationshipType::ConflictAndSecurity));
        assert_eq!(description, "Westmark frames Eastoria as a military threat.");

        let insufficient = object(json!({"relationship_type": "INSUFFICIENT_DATA", "description": "Too little."}));
        assert_eq!(validator.resolve_judgment_reply(&insufficient).unwrap().0, Verdict::InsufficientData);

        assert!(validator
            .resolve_judgment_reply(&ParsedReply::Sentinel(Sentinel::NotDiscussed))
            .is_err());
    }
}
