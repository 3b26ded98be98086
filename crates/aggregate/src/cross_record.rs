use extract::{AggregatedJudgment, RelationshipRecord, RelationshipType, Verdict};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

use crate::synthesis;

#[derive(Debug, Error, PartialEq)]
pub enum AggregateError {
    #[error("record {record} is {found_source} -> {found_target}, expected {pair_source} -> {pair_target}")]
    MixedPair {
        record: String,
        pair_source: String,
        pair_target: String,
        found_source: String,
        found_target: String,
    },
}

/// How to break a tie between equally frequent relationship types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Prefer the type seen in the latest year.
    MostRecent,
    /// Prefer the type whose records carry the most themes, associations
    /// and summaries.
    MostDetailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossRecordConfig {
    /// Characterized records needed before a judgment is made.
    pub min_usable_records: usize,
    pub tie_break: Vec<TieBreak>,
}

impl Default for CrossRecordConfig {
    fn default() -> Self {
        Self {
            min_usable_records: 2,
            tie_break: vec![TieBreak::MostRecent, TieBreak::MostDetailed],
        }
    }
}

impl CrossRecordConfig {
    /// Across years of one pair.
    pub fn longitudinal() -> Self {
        Self::default()
    }

    /// Across extraction passes over one speech.
    pub fn per_speech() -> Self {
        Self {
            min_usable_records: 1,
            ..Self::default()
        }
    }
}

/// Records of one (source, target) pair, keyed by pair.
pub fn group_by_pair(records: &[RelationshipRecord]) -> BTreeMap<(String, String), Vec<RelationshipRecord>> {
    let mut groups: BTreeMap<(String, String), Vec<RelationshipRecord>> = BTreeMap::new();
    for record in records {
        groups
            .entry((record.source.clone(), record.target.clone()))
            .or_default()
            .push(record.clone());
    }
    groups
}

/// One record per (source, target, speech) when a speech was read in
/// several passes: the most detailed record of the passes' majority type,
/// or the not-discussed record when no pass characterized the target.
pub fn collapse_passes(records: &[RelationshipRecord], tie_break: &[TieBreak]) -> Vec<RelationshipRecord> {
    let mut groups: BTreeMap<(String, String, String), Vec<&RelationshipRecord>> = BTreeMap::new();
    for record in records {
        groups
            .entry((record.source.clone(), record.target.clone(), record.speech_id.clone()))
            .or_default()
            .push(record);
    }

    groups
        .into_values()
        .filter_map(|passes| {
            let usable: Vec<&RelationshipRecord> = passes.iter().copied().filter(|r| !r.is_not_discussed()).collect();
            if usable.is_empty() {
                return passes.first().map(|r| (*r).clone());
            }
            let winner = majority(&usable, tie_break);
            usable
                .iter()
                .filter(|r| r.relationship_type() == Some(winner))
                .min_by_key(|r| Reverse(detail(r)))
                .map(|r| (*r).clone())
        })
        .collect()
}

fn detail(record: &RelationshipRecord) -> usize {
    record.characterization().map_or(0, |c| {
        c.themes.len() + c.associations.len() + usize::from(c.summary.is_some())
    })
}

/// Combine records for one pair into one judgment.
///
/// Not-discussed records count toward the total but carry no vote. Below
/// `min_usable_records` characterized records the judgment is
/// `INSUFFICIENT_DATA`.
pub fn aggregate_records(
    source: &str,
    target: &str,
    records: &[RelationshipRecord],
    config: &CrossRecordConfig,
) -> Result<AggregatedJudgment, AggregateError> {
    if let Some(stray) = records.iter().find(|r| r.source != source || r.target != target) {
        return Err(AggregateError::MixedPair {
            record: stray.id.clone(),
            pair_source: source.to_string(),
            pair_target: target.to_string(),
            found_source: stray.source.clone(),
            found_target: stray.target.clone(),
        });
    }

    let usable: Vec<&RelationshipRecord> = records.iter().filter(|r| !r.is_not_discussed()).collect();
    let provenance: Vec<String> = usable.iter().map(|r| r.id.clone()).collect();
    let required = config.min_usable_records.max(1);

    if usable.len() < required {
        debug!(
            source,
            target,
            usable = usable.len(),
            total = records.len(),
            required,
            "Insufficient data for judgment"
        );
        return Ok(AggregatedJudgment {
            source: source.to_string(),
            target: target.to_string(),
            relationship_type: Verdict::InsufficientData,
            description: synthesis::insufficient(source, target, usable.len(), records.len(), required),
            provenance,
        });
    }

    let winner = majority(&usable, &config.tie_break);
    let description = synthesis::describe(source, target, winner, &usable);

    Ok(AggregatedJudgment {
        source: source.to_string(),
        target: target.to_string(),
        relationship_type: Verdict::Relationship(winner),
        description,
        provenance,
    })
}

/// Most frequent type, then the configured tie-breaks, then declaration order.
pub fn majority(records: &[&RelationshipRecord], tie_break: &[TieBreak]) -> RelationshipType {
    let mut by_type: BTreeMap<RelationshipType, Vec<&RelationshipRecord>> = BTreeMap::new();
    for record in records {
        if let Some(t) = record.relationship_type() {
            by_type.entry(t).or_default().push(*record);
        }
    }

    let top = by_type.values().map(Vec::len).max().unwrap_or(0);
    let mut candidates: Vec<RelationshipType> = by_type
        .iter()
        .filter(|(_, rs)| rs.len() == top)
        .map(|(t, _)| *t)
        .collect();

    for rule in tie_break {
        if candidates.len() <= 1 {
            break;
        }
        let score = |t: &RelationshipType| -> usize {
            let rs = &by_type[t];
            match rule {
                TieBreak::MostRecent => rs.iter().filter_map(|r| r.year).max().map_or(0, usize::from),
                TieBreak::MostDetailed => rs.iter().map(|r| detail(r)).max().unwrap_or(0),
            }
        };
        let best = candidates.iter().map(&score).max().unwrap_or(0);
        candidates.retain(|t| score(t) == best);
    }

    // BTreeMap order is declaration order.
    candidates.first().copied().unwrap_or(RelationshipType::Passing)
}
