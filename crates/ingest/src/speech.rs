use serde::{Deserialize, Serialize};

/// One General Assembly speech. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Speech {
    id: String,
    source: String,
    year: u16,
    text: String,
}

impl Speech {
    /// Build a speech whose id is derived from the source country and year,
    /// e.g. `FRA_1994`.
    pub fn new(source: impl Into<String>, year: u16, text: impl Into<String>) -> Self {
        let source = source.into();
        let id = Self::derive_id(&source, year);
        Self {
            id,
            source,
            year,
            text: text.into(),
        }
    }

    /// Replace the derived id with a caller-supplied one (corpus doc ids).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn year(&self) -> u16 {
        self.year
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    fn derive_id(source: &str, year: u16) -> String {
        let slug: String = source
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("-")
            .to_uppercase();
        format!("{}_{}", slug, year)
    }
}
