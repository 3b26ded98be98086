use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use uuid::Uuid;

/// Canonical sentinel emitted when a speech never discusses the target.
pub const NOT_DISCUSSED: &str = "The target country is not discussed in this speech.";
pub const INSUFFICIENT_DATA: &str = "INSUFFICIENT_DATA";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RelationshipType {
    #[serde(rename = "Support and Alignment")]
    SupportAndAlignment,
    #[serde(rename = "Opposition and Criticism")]
    OppositionAndCriticism,
    #[serde(rename = "Passing")]
    Passing,
    #[serde(rename = "Power Dynamics")]
    PowerDynamics,
    #[serde(rename = "Historical or Regional Ties")]
    HistoricalOrRegionalTies,
    #[serde(rename = "Functional Cooperation")]
    FunctionalCooperation,
    #[serde(rename = "Conflict and Security")]
    ConflictAndSecurity,
}

impl RelationshipType {
    pub const ALL: [RelationshipType; 7] = [
        RelationshipType::SupportAndAlignment,
        RelationshipType::OppositionAndCriticism,
        RelationshipType::Passing,
        RelationshipType::PowerDynamics,
        RelationshipType::HistoricalOrRegionalTies,
        RelationshipType::FunctionalCooperation,
        RelationshipType::ConflictAndSecurity,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            RelationshipType::SupportAndAlignment => "Support and Alignment",
            RelationshipType::OppositionAndCriticism => "Opposition and Criticism",
            RelationshipType::Passing => "Passing",
            RelationshipType::PowerDynamics => "Power Dynamics",
            RelationshipType::HistoricalOrRegionalTies => "Historical or Regional Ties",
            RelationshipType::FunctionalCooperation => "Functional Cooperation",
            RelationshipType::ConflictAndSecurity => "Conflict and Security",
        }
    }

    /// Lower-case noun phrase for use inside generated prose.
    pub fn phrase(&self) -> &'static str {
        match self {
            RelationshipType::SupportAndAlignment => "support and alignment",
            RelationshipType::OppositionAndCriticism => "opposition and criticism",
            RelationshipType::Passing => "passing references",
            RelationshipType::PowerDynamics => "power dynamics",
            RelationshipType::HistoricalOrRegionalTies => "historical or regional ties",
            RelationshipType::FunctionalCooperation => "functional cooperation",
            RelationshipType::ConflictAndSecurity => "conflict and security",
        }
    }
}

impl fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Centrality {
    Major,
    Passing,
    NotDiscussed,
}

impl Centrality {
    pub const ALL: [Centrality; 3] = [Centrality::Major, Centrality::Passing, Centrality::NotDiscussed];

    pub fn label(&self) -> &'static str {
        match self {
            Centrality::Major => "major",
            Centrality::Passing => "passing",
            Centrality::NotDiscussed => "not-discussed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Hostile,
    Critical,
    Neutral,
    Mixed,
    Cooperative,
    Friendly,
}

impl Sentiment {
    pub const ALL: [Sentiment; 6] = [
        Sentiment::Hostile,
        Sentiment::Critical,
        Sentiment::Neutral,
        Sentiment::Mixed,
        Sentiment::Cooperative,
        Sentiment::Friendly,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Sentiment::Hostile => "hostile",
            Sentiment::Critical => "critical",
            Sentiment::Neutral => "neutral",
            Sentiment::Mixed => "mixed",
            Sentiment::Cooperative => "cooperative",
            Sentiment::Friendly => "friendly",
        }
    }

    /// -1 conflictual, 0 neither, 1 cooperative.
    pub fn polarity(&self) -> i8 {
        match self {
            Sentiment::Hostile | Sentiment::Critical => -1,
            Sentiment::Neutral | Sentiment::Mixed => 0,
            Sentiment::Cooperative | Sentiment::Friendly => 1,
        }
    }
}

/// Literal replies that stand in for "no structured data applies".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentinel {
    NotDiscussed,
    InsufficientData,
    MentionedWithoutCharacterization,
}

impl Sentinel {
    pub fn text(&self) -> &'static str {
        match self {
            Sentinel::NotDiscussed => NOT_DISCUSSED,
            Sentinel::InsufficientData => "insufficient data",
            Sentinel::MentionedWithoutCharacterization => "mentioned without characterization",
        }
    }
}

/// A populated characterization of one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Characterization {
    pub country: String,
    pub relationship_type: RelationshipType,
    pub themes: Vec<String>,
    pub centrality: Centrality,
    pub sentiment: Sentiment,
    pub associations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl Characterization {
    /// What a bare mention contributes: a passing, neutral reference.
    pub fn passing_mention(country: &str) -> Self {
        Self {
            country: country.to_string(),
            relationship_type: RelationshipType::Passing,
            themes: Vec::new(),
            centrality: Centrality::Passing,
            sentiment: Sentiment::Neutral,
            associations: Vec::new(),
            summary: None,
        }
    }

    pub fn to_output(&self) -> Value {
        json!({
            "country": self.country,
            "relationship_type": self.relationship_type.label(),
            "themes": self.themes,
            "centrality": self.centrality.label(),
            "sentiment": self.sentiment.label(),
            "associations": self.associations,
        })
    }
}

/// Validated content of one extraction attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractionPayload {
    Sentinel { sentinel: Sentinel },
    Characterized(Characterization),
}

impl ExtractionPayload {
    pub fn sentinel(sentinel: Sentinel) -> Self {
        ExtractionPayload::Sentinel { sentinel }
    }

    pub fn is_not_discussed(&self) -> bool {
        matches!(
            self,
            ExtractionPayload::Sentinel {
                sentinel: Sentinel::NotDiscussed
            }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordBody {
    NotDiscussed,
    Characterized(Characterization),
}

/// One per-speech characterization of `target` by `source`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRecord {
    pub id: String,
    pub source: String,
    pub target: String,
    pub speech_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<u16>,
    pub body: RecordBody,
    /// Extraction units whose payloads fed this record.
    #[serde(default)]
    pub units: Vec<String>,
}

impl RelationshipRecord {
    pub fn not_discussed(source: &str, target: &str, speech_id: &str, year: Option<u16>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source: source.to_string(),
            target: target.to_string(),
            speech_id: speech_id.to_string(),
            year,
            body: RecordBody::NotDiscussed,
            units: Vec::new(),
        }
    }

    pub fn characterized(
        source: &str,
        speech_id: &str,
        year: Option<u16>,
        characterization: Characterization,
        units: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source: source.to_string(),
            target: characterization.country.clone(),
            speech_id: speech_id.to_string(),
            year,
            body: RecordBody::Characterized(characterization),
            units,
        }
    }

    pub fn characterization(&self) -> Option<&Characterization> {
        match &self.body {
            RecordBody::Characterized(c) => Some(c),
            RecordBody::NotDiscussed => None,
        }
    }

    pub fn is_not_discussed(&self) -> bool {
        matches!(self.body, RecordBody::NotDiscussed)
    }

    pub fn relationship_type(&self) -> Option<RelationshipType> {
        self.characterization().map(|c| c.relationship_type)
    }

    pub fn centrality(&self) -> Centrality {
        self.characterization()
            .map(|c| c.centrality)
            .unwrap_or(Centrality::NotDiscussed)
    }

    pub fn sentiment(&self) -> Option<Sentiment> {
        self.characterization().map(|c| c.sentiment)
    }

    pub fn themes(&self) -> &[String] {
        self.characterization().map(|c| c.themes.as_slice()).unwrap_or(&[])
    }

    pub fn associations(&self) -> &[String] {
        self.characterization()
            .map(|c| c.associations.as_slice())
            .unwrap_or(&[])
    }

    /// Output-schema form: the populated object, or the bare sentinel string.
    pub fn to_output(&self) -> Value {
        match &self.body {
            RecordBody::NotDiscussed => Value::String(NOT_DISCUSSED.to_string()),
            RecordBody::Characterized(c) => c.to_output(),
        }
    }
}

/// Final relationship_type of a judgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Verdict {
    Relationship(RelationshipType),
    InsufficientData,
}

impl Verdict {
    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Relationship(t) => t.label(),
            Verdict::InsufficientData => INSUFFICIENT_DATA,
        }
    }
}

impl From<Verdict> for String {
    fn from(verdict: Verdict) -> Self {
        verdict.label().to_string()
    }
}

impl TryFrom<String> for Verdict {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value == INSUFFICIENT_DATA {
            return Ok(Verdict::InsufficientData);
        }
        RelationshipType::ALL
            .iter()
            .find(|t| t.label() == value)
            .map(|t| Verdict::Relationship(*t))
            .ok_or_else(|| format!("unknown relationship_type: {}", value))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedJudgment {
    pub source: String,
    pub target: String,
    pub relationship_type: Verdict,
    pub description: String,
    pub provenance: Vec<String>,
}

impl AggregatedJudgment {
    pub fn is_insufficient(&self) -> bool {
        self.relationship_type == Verdict::InsufficientData
    }

    pub fn to_output(&self) -> Value {
        json!({
            "relationship_type": self.relationship_type.label(),
            "description": self.description,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Characterization {
        Characterization {
            country: "Eastoria".to_string(),
            relationship_type: RelationshipType::OppositionAndCriticism,
            themes: vec!["border dispute".to_string()],
            centrality: Centrality::Major,
            sentiment: Sentiment::Hostile,
            associations: vec!["Northland".to_string()],
            summary: None,
        }
    }

    #[test]
    fn test_not_discussed_output_is_bare_sentinel() {
        let record = RelationshipRecord::not_discussed("Westmark", "Eastoria", "W_1990", Some(1990));

        assert_eq!(record.to_output(), Value::String(NOT_DISCUSSED.to_string()));
        assert_eq!(record.centrality(), Centrality::NotDiscussed);
        assert!(record.themes().is_empty());
        assert!(record.associations().is_empty());
        assert_eq!(record.relationship_type(), None);
    }

    #[test]
    fn test_characterized_output_schema() {
        let record = RelationshipRecord::characterized("Westmark", "W_1990", Some(1990), sample(), vec![]);
        let out = record.to_output();

        assert_eq!(out["country"], "Eastoria");
        assert_eq!(out["relationship_type"], "Opposition and Criticism");
        assert_eq!(out["centrality"], "major");
        assert_eq!(out["sentiment"], "hostile");
        assert_eq!(out["themes"][0], "border dispute");
        assert_eq!(record.target, "Eastoria");
    }

    #[test]
    fn test_verdict_serializes_as_label() {
        let judgment = AggregatedJudgment {
            source: "Westmark".to_string(),
            target: "Eastoria".to_string(),
            relationship_type: Verdict::InsufficientData,
            description: "Too few records.".to_string(),
            provenance: vec![],
        };
        let value = serde_json::to_value(&judgment).unwrap();
        assert_eq!(value["relationship_type"], "INSUFFICIENT_DATA");

        let back: AggregatedJudgment = serde_json::from_value(value).unwrap();
        assert!(back.is_insufficient());

        let bad = serde_json::json!({
            "source": "a", "target": "b", "relationship_type": "Friendship",
            "description": "x", "provenance": []
        });
        assert!(serde_json::from_value::<AggregatedJudgment>(bad).is_err());
    }

    #[test]
    fn test_relationship_type_serde_uses_labels() {
        for t in RelationshipType::ALL {
            let value = serde_json::to_value(t).unwrap();
            assert_eq!(value, Value::String(t.label().to_string()));
        }
    }
}
