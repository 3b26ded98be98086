use extract::{
    Centrality, Characterization, ExtractionAttempt, ExtractionPayload, RelationshipRecord, Sentinel,
    TermNormalizer, TermSet,
};
use ingest::Speech;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

const EPSILON: f64 = 1e-9;

/// The (source, target, speech) a record is built for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordContext {
    pub source: String,
    pub target: String,
    pub speech_id: String,
    pub year: Option<u16>,
}

impl RecordContext {
    pub fn new(source: &str, target: &str, speech_id: &str, year: Option<u16>) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
            speech_id: speech_id.to_string(),
            year,
        }
    }

    pub fn for_speech(speech: &Speech, target: &str) -> Self {
        Self::new(speech.source(), target, speech.id(), Some(speech.year()))
    }
}

/// One unit's contribution to a vote.
#[derive(Debug, Clone, Copy)]
struct Ballot<T> {
    value: T,
    weight: f64,
    len: usize,
    ordinal: usize,
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    weight: f64,
    longest: usize,
    earliest: usize,
}

/// Highest weight wins; ties go to the value backed by the longest unit,
/// then the earliest unit, then declaration order.
fn plurality<T: Copy + Ord>(ballots: &[Ballot<T>]) -> Option<T> {
    let mut tallies: BTreeMap<T, Tally> = BTreeMap::new();
    for ballot in ballots {
        let tally = tallies.entry(ballot.value).or_insert(Tally {
            weight: 0.0,
            longest: 0,
            earliest: usize::MAX,
        });
        tally.weight += ballot.weight;
        tally.longest = tally.longest.max(ballot.len);
        tally.earliest = tally.earliest.min(ballot.ordinal);
    }

    let mut best: Option<(T, Tally)> = None;
    // BTreeMap iterates in declaration order, so strict comparisons keep the first.
    for (value, tally) in tallies {
        let better = match &best {
            None => true,
            Some((_, b)) => {
                if (tally.weight - b.weight).abs() > EPSILON {
                    tally.weight > b.weight
                } else if tally.longest != b.longest {
                    tally.longest > b.longest
                } else {
                    tally.earliest < b.earliest
                }
            }
        };
        if better {
            best = Some((value, tally));
        }
    }
    best.map(|(value, _)| value)
}

/// Combine the attempts for one (source, target, speech) into one record.
///
/// Only validated attempts count. A bare mention counts as a passing,
/// neutral characterization. If nothing characterizes the target the
/// record is the not-discussed sentinel.
pub fn aggregate_attempts(
    ctx: &RecordContext,
    attempts: &[ExtractionAttempt],
    normalizer: &TermNormalizer,
) -> RelationshipRecord {
    let mut usable: Vec<(&ExtractionAttempt, &ExtractionPayload)> = attempts
        .iter()
        .filter_map(|a| a.usable_payload().map(|p| (a, p)))
        .collect();
    // calls may complete out of order
    usable.sort_by(|(a, _), (b, _)| {
        a.unit()
            .ordinal()
            .cmp(&b.unit().ordinal())
            .then_with(|| a.unit().id().cmp(&b.unit().id()))
    });

    let mut per_unit: HashMap<String, usize> = HashMap::new();
    for (attempt, _) in &usable {
        *per_unit.entry(attempt.unit().id()).or_insert(0) += 1;
    }

    let mentions: Vec<(&ExtractionAttempt, Characterization)> = usable
        .iter()
        .filter_map(|(attempt, payload)| {
            let characterization = match payload {
                ExtractionPayload::Characterized(c) => c.clone(),
                ExtractionPayload::Sentinel {
                    sentinel: Sentinel::MentionedWithoutCharacterization,
                } => Characterization::passing_mention(&ctx.target),
                ExtractionPayload::Sentinel { .. } => return None,
            };
            Some((*attempt, characterization))
        })
        .collect();

    if mentions.is_empty() {
        debug!(
            speech = %ctx.speech_id,
            target = %ctx.target,
            usable = usable.len(),
            total = attempts.len(),
            "Target not discussed"
        );
        let mut record = RelationshipRecord::not_discussed(&ctx.source, &ctx.target, &ctx.speech_id, ctx.year);
        record.units = usable.iter().map(|(a, _)| a.unit().id()).collect();
        record.units.dedup();
        return record;
    }

    let ballot = |attempt: &ExtractionAttempt| {
        let unit = attempt.unit();
        let share = per_unit.get(&unit.id()).copied().unwrap_or(1).max(1);
        (1.0 / share as f64, unit.weight_len(), unit.ordinal())
    };

    let relationship_ballots: Vec<_> = mentions
        .iter()
        .map(|(attempt, c)| {
            let (weight, len, ordinal) = ballot(*attempt);
            Ballot { value: c.relationship_type, weight, len, ordinal }
        })
        .collect();
    let sentiment_ballots: Vec<_> = mentions
        .iter()
        .map(|(attempt, c)| {
            let (weight, len, ordinal) = ballot(*attempt);
            Ballot { value: c.sentiment, weight, len, ordinal }
        })
        .collect();

    let mut merged = Characterization::passing_mention(&ctx.target);
    if let Some(relationship_type) = plurality(&relationship_ballots) {
        merged.relationship_type = relationship_type;
    }
    if let Some(sentiment) = plurality(&sentiment_ballots) {
        merged.sentiment = sentiment;
    }
    if mentions.iter().any(|(_, c)| c.centrality == Centrality::Major) {
        merged.centrality = Centrality::Major;
    }

    let mut themes = TermSet::new();
    let mut associations = TermSet::new();
    for (_, c) in &mentions {
        for theme in &c.themes {
            if let Some(clean) = normalizer.clean(theme) {
                themes.insert(clean);
            }
        }
        for name in &c.associations {
            if let Some(clean) = normalizer.association(name) {
                if !normalizer.same_country(&clean, &ctx.target) {
                    associations.insert(clean);
                }
            }
        }
    }
    merged.themes = themes.into_vec();
    merged.associations = associations.into_vec();

    // Prefer a summary from a unit that agrees with the verdict.
    merged.summary = mentions
        .iter()
        .filter(|(_, c)| c.relationship_type == merged.relationship_type)
        .chain(mentions.iter())
        .find_map(|(_, c)| c.summary.clone());

    let mut units: Vec<String> = mentions.iter().map(|(a, _)| a.unit().id()).collect();
    units.dedup();
    debug!(
        speech = %ctx.speech_id,
        target = %ctx.target,
        relationship_type = %merged.relationship_type,
        contributing = units.len(),
        "Aggregated chunk attempts"
    );

    RelationshipRecord::characterized(&ctx.source, &ctx.speech_id, ctx.year, merged, units)
}
