use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use thiserror::Error;

use crate::schema::{NOT_DISCUSSED, RelationshipType, Sentiment};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([a-z_][a-z0-9_]*)\}").expect("valid placeholder pattern"));

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("template {template} has no value for placeholder {{{name}}}")]
    Unbound { template: String, name: String },
}

/// The reply shape a template asks the model for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyShape {
    /// Per-record object or one of the extraction sentinels.
    Characterization,
    /// `{relationship_type, description}`.
    Judgment,
}

impl ReplyShape {
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            ReplyShape::Characterization => &["relationship_type"],
            ReplyShape::Judgment => &["relationship_type", "description"],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BoundVariables {
    values: BTreeMap<String, String>,
}

impl BoundVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.values.insert(name.to_string(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct PromptTemplate {
    name: String,
    body: String,
    shape: ReplyShape,
}

impl PromptTemplate {
    pub fn new(name: impl Into<String>, body: impl Into<String>, shape: ReplyShape) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
            shape,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> ReplyShape {
        self.shape
    }

    /// Substitute every `{placeholder}` in one pass. Values are inserted
    /// verbatim, so speech text containing braces is never re-expanded.
    pub fn bind(&self, vars: &BoundVariables) -> Result<String, PromptError> {
        let mut missing: Option<String> = None;
        let bound = PLACEHOLDER.replace_all(&self.body, |caps: &Captures| match vars.get(&caps[1]) {
            Some(value) => value.to_string(),
            None => {
                missing.get_or_insert_with(|| caps[1].to_string());
                caps[0].to_string()
            }
        });

        match missing {
            Some(name) => Err(PromptError::Unbound {
                template: self.name.clone(),
                name,
            }),
            None => Ok(bound.into_owned()),
        }
    }

    /// Per-chunk (or whole-speech) characterization of `{target}` by `{source}`.
    pub fn characterization() -> Self {
        let types = label_list(RelationshipType::ALL.iter().map(|t| t.label()));
        let sentiments = label_list(Sentiment::ALL.iter().map(|s| s.label()));
        let body = format!(
            r#"Analyze how {{source}} characterizes {{target}} in the following passage from its {{year}} General Assembly speech.

INSTRUCTIONS:
1. Decide whether {{target}} is discussed in the passage at all
2. If it is not, output exactly: {not_discussed}
3. If it is named but not characterized in any way, output exactly: mentioned without characterization
4. Otherwise output ONLY valid JSON using the exact schema below

SCHEMA:
{{"country": "{{target}}", "relationship_type": "...", "themes": ["..."], "centrality": "major|passing", "sentiment": "...", "associations": ["..."], "summary": "..."}}

RULES:
- relationship_type must be one of: {types}
- sentiment must be one of: {sentiments}
- centrality is "major" when {{target}} is a focus of the passage, "passing" otherwise
- themes are short topic phrases, associations are other countries or groups linked to {{target}}
- summary is a single sentence, beginning with {{target}}, restating the context in which it is mentioned
- Output ONLY the JSON object or the exact sentence above, no markdown, no explanations

TEXT:
{{text}}

OUTPUT:"#,
            not_discussed = NOT_DISCUSSED,
            types = types,
            sentiments = sentiments,
        );
        Self::new("characterization", body, ReplyShape::Characterization)
    }

    /// Cross-record judgment over one-sentence summaries of a pair.
    pub fn relationship() -> Self {
        let types = label_list(RelationshipType::ALL.iter().map(|t| t.label()));
        let body = format!(
            r#"Below are summaries of how {{source}} characterized {{target}} in its General Assembly speeches ({{years}}).

SUMMARIES:
{{summaries}}

TASK: Classify the overall relationship {{source}} describes with {{target}} and explain it in one or two sentences.
Mention power dynamics, whether the tone is cooperative or conflictual, and how {{source}} sees itself relative to {{target}} where the summaries support it.

SCHEMA:
{{"relationship_type": "...", "description": "..."}}

RULES:
- relationship_type must be one of: {types}
- If the summaries do not support a judgment use "INSUFFICIENT_DATA"
- Output ONLY the JSON object, no markdown, no explanations

JSON OUTPUT:"#,
            types = types,
        );
        Self::new("relationship", body, ReplyShape::Judgment)
    }
}

fn label_list<'a>(labels: impl Iterator<Item = &'a str>) -> String {
    labels.map(|l| format!("\"{}\"", l)).collect::<Vec<_>>().join(", ")
}
