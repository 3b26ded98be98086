//! Deterministic one- or two-sentence descriptions of a judged pair, and
//! the summary block sent to the model when descriptions are model-backed.

use extract::normalizer::key;
use extract::{RelationshipRecord, RelationshipType};
use std::collections::{BTreeMap, BTreeSet};

/// Theme words that signal a power relationship.
const POWER_TERMS: &[&str] = &[
    "power",
    "hegemony",
    "dominance",
    "domination",
    "superpower",
    "imperialism",
    "colonialism",
    "colonial",
    "occupation",
    "intervention",
    "sovereignty",
    "sanctions",
    "pressure",
    "influence",
];

const MAX_LISTED: usize = 3;

/// Describe the relationship `source` draws with `target` from the records
/// that were judged. Names tone always; power dynamics, how the target is
/// grouped, and how the source casts itself only when the records show it.
pub fn describe(
    source: &str,
    target: &str,
    relationship_type: RelationshipType,
    records: &[&RelationshipRecord],
) -> String {
    let first = headline(source, target, relationship_type, records);

    let mut clauses = Vec::new();

    let power = power_terms(records);
    if !power.is_empty() {
        clauses.push(format!("power dynamics surface through {}", join_list(&power)));
    }

    let associations = top_associations(records);
    if !associations.is_empty() {
        clauses.push(format!("{} is grouped with {}", target, join_list(&associations)));
    }

    if speaks_of_itself(source, records) {
        clauses.push(format!("{} presents itself as {}", source, self_role(target, records)));
    }

    if clauses.is_empty() {
        first
    } else {
        format!("{} {}.", first, capitalize(&join_clauses(&clauses)))
    }
}

/// The first sentence of [`describe`]: type, years and tone.
pub fn headline(
    source: &str,
    target: &str,
    relationship_type: RelationshipType,
    records: &[&RelationshipRecord],
) -> String {
    capitalize(&format!(
        "{} characterizes {} chiefly through {} ({}), in a {} tone.",
        source,
        target,
        relationship_type.phrase(),
        years_label(records),
        tone(records),
    ))
}

/// Why a pair could not be judged.
pub fn insufficient(source: &str, target: &str, usable: usize, total: usize, required: usize) -> String {
    match (total, usable) {
        (0, _) => format!("No speeches by {} were analyzed for references to {}.", source, target),
        (1, 0) => format!("{} does not characterize {} in the speech analyzed.", source, target),
        (_, 0) => format!(
            "{} does not characterize {} in any of the {} speeches analyzed.",
            source, target, total
        ),
        _ => format!(
            "Only {} of {} analyzed speeches by {} characterize {}, fewer than the {} required for a judgment.",
            usable, total, source, target, required
        ),
    }
}

/// One line per characterized record, oldest first.
pub fn summaries_block(target: &str, records: &[&RelationshipRecord]) -> String {
    let mut ordered: Vec<&&RelationshipRecord> = records.iter().filter(|r| !r.is_not_discussed()).collect();
    ordered.sort_by_key(|r| (r.year, r.speech_id.clone()));

    ordered
        .iter()
        .filter_map(|record| {
            let c = record.characterization()?;
            let when = record
                .year
                .map(|y| y.to_string())
                .unwrap_or_else(|| record.speech_id.clone());
            let text = match &c.summary {
                Some(summary) => summary.clone(),
                None if c.themes.is_empty() => format!(
                    "{} receives a {} {} reference.",
                    target,
                    c.centrality.label(),
                    c.sentiment.label()
                ),
                None => format!(
                    "{} receives a {} {} reference concerning {}.",
                    target,
                    c.centrality.label(),
                    c.sentiment.label(),
                    c.themes.join(", ")
                ),
            };
            Some(format!("- {}: {}", when, text))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn years_label(records: &[&RelationshipRecord]) -> String {
    let years: BTreeSet<u16> = records.iter().filter_map(|r| r.year).collect();
    let first = years.iter().next().copied();
    let last = years.iter().next_back().copied();
    match (first, last) {
        (Some(a), Some(b)) if a == b => a.to_string(),
        (Some(a), Some(b)) if years.len() > MAX_LISTED => format!("{}-{}", a, b),
        (Some(_), Some(_)) => join_list(&years.iter().map(|y| y.to_string()).collect::<Vec<_>>()),
        _ => match records.len() {
            1 => "one undated speech".to_string(),
            n => format!("{} undated speeches", n),
        },
    }
}

fn tone(records: &[&RelationshipRecord]) -> &'static str {
    let polarities: Vec<i8> = records.iter().filter_map(|r| r.sentiment()).map(|s| s.polarity()).collect();
    if polarities.is_empty() {
        return "neutral";
    }
    let mean = polarities.iter().map(|p| *p as f64).sum::<f64>() / polarities.len() as f64;
    if mean > 0.34 {
        "cooperative"
    } else if mean < -0.34 {
        "conflictual"
    } else if polarities.iter().any(|p| *p > 0) && polarities.iter().any(|p| *p < 0) {
        "mixed"
    } else {
        "neutral"
    }
}

fn power_terms(records: &[&RelationshipRecord]) -> Vec<String> {
    let mut found: BTreeSet<&'static str> = BTreeSet::new();
    for record in records {
        for theme in record.themes() {
            let theme_key = key(theme);
            for term in POWER_TERMS {
                if theme_key.split_whitespace().any(|word| word == *term) {
                    found.insert(*term);
                }
            }
        }
    }
    found.into_iter().take(MAX_LISTED).map(str::to_string).collect()
}

/// Most frequent associations, ties in first-seen order.
fn top_associations(records: &[&RelationshipRecord]) -> Vec<String> {
    let mut counts: BTreeMap<String, (usize, usize, String)> = BTreeMap::new();
    let mut seen = 0;
    for record in records {
        for name in record.associations() {
            let entry = counts.entry(key(name)).or_insert_with(|| {
                seen += 1;
                (0, seen, name.clone())
            });
            entry.0 += 1;
        }
    }
    let mut ranked: Vec<(usize, usize, String)> = counts.into_values().collect();
    ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    ranked.into_iter().take(MAX_LISTED).map(|(_, _, name)| name).collect()
}

fn speaks_of_itself(source: &str, records: &[&RelationshipRecord]) -> bool {
    let source_key = key(source);
    !source_key.is_empty()
        && records
            .iter()
            .filter_map(|r| r.characterization()?.summary.as_deref())
            .any(|summary| key(summary).contains(&source_key))
}

fn self_role(target: &str, records: &[&RelationshipRecord]) -> String {
    match tone(records) {
        "cooperative" => format!("a partner of {}", target),
        "conflictual" => format!("an opponent of {}", target),
        _ => format!("an observer of {}", target),
    }
}

fn join_list(items: &[String]) -> String {
    match items {
        [] => String::new(),
        [one] => one.clone(),
        [init @ .., last] => format!("{} and {}", init.join(", "), last),
    }
}

fn join_clauses(clauses: &[String]) -> String {
    match clauses {
        [] => String::new(),
        [one] => one.clone(),
        [init @ .., last] => format!("{}, and {}", init.join(", "), last),
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
