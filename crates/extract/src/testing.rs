//! Testing utilities: a scripted, deterministic language model.
//!
//! Lets pipeline code be exercised without a running inference server.
//! Replies are chosen by substring rules over the prompt, so a test can
//! script different answers per target or per chunk of text.

use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::llm::{LanguageModel, ModelError};
use crate::schema::{Centrality, NOT_DISCUSSED, RelationshipType, Sentiment};

/// One scripted behaviour of the model.
#[derive(Debug, Clone)]
pub enum Scripted {
    Reply(String),
    Timeout,
    Refuse(String),
    Transport(String),
    /// Never returns; exercises the invoker's own timeout.
    Hang,
}

struct Rule {
    needles: Vec<String>,
    /// The last entry repeats once the others are used up.
    replies: VecDeque<Scripted>,
}

/// A `LanguageModel` that answers from a script.
///
/// Rules are checked in the order they were added; the first rule whose
/// needles all occur in the prompt answers. Prompts no rule matches get the
/// fallback, which defaults to the "not discussed" sentinel.
pub struct ScriptedModel {
    rules: Arc<RwLock<Vec<Rule>>>,
    fallback: Scripted,
    latency: Option<Duration>,
    calls: Arc<RwLock<Vec<String>>>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

/// Decrements the in-flight count when a call returns or is dropped.
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self {
            rules: Arc::new(RwLock::new(Vec::new())),
            fallback: Scripted::Reply(NOT_DISCUSSED.to_string()),
            latency: None,
            calls: Arc::new(RwLock::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Answer prompts containing every needle with `reply`.
    pub fn on(self, needles: &[&str], reply: Scripted) -> Self {
        self.on_sequence(needles, vec![reply])
    }

    /// Answer successive matching prompts from `replies`, repeating the last.
    pub fn on_sequence(self, needles: &[&str], replies: Vec<Scripted>) -> Self {
        if !replies.is_empty() {
            self.rules
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .push(Rule {
                    needles: needles.iter().map(|n| n.to_string()).collect(),
                    replies: replies.into(),
                });
        }
        self
    }

    pub fn with_fallback(mut self, fallback: Scripted) -> Self {
        self.fallback = fallback;
        self
    }

    /// Delay every call, so concurrent calls overlap.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Every prompt received, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn calls_containing(&self, needle: &str) -> usize {
        self.calls
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|prompt| prompt.contains(needle))
            .count()
    }

    /// Clears the recorded prompts and the in-flight peak.
    pub fn clear_calls(&self) {
        self.calls.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.peak_in_flight
            .store(self.in_flight.load(Ordering::SeqCst), Ordering::SeqCst);
    }

    /// Most calls running at the same time so far.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self, prompt: &str) -> Scripted {
        let mut rules = self.rules.write().unwrap_or_else(|e| e.into_inner());
        for rule in rules.iter_mut() {
            if rule.needles.iter().all(|needle| prompt.contains(needle.as_str())) {
                if rule.replies.len() > 1 {
                    if let Some(reply) = rule.replies.pop_front() {
                        return reply;
                    }
                }
                if let Some(reply) = rule.replies.front() {
                    return reply.clone();
                }
            }
        }
        self.fallback.clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn invoke(&self, prompt: &str) -> Result<String, ModelError> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(Arc::clone(&self.in_flight));
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);

        self.calls
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.to_string());
        let reply = self.next_reply(prompt);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        match reply {
            Scripted::Reply(text) => Ok(text),
            Scripted::Timeout => Err(ModelError::Timeout),
            Scripted::Refuse(msg) => Err(ModelError::Refused(msg)),
            Scripted::Transport(msg) => Err(ModelError::Transport(msg)),
            Scripted::Hang => std::future::pending().await,
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// A well-formed per-record reply.
pub fn payload_json(
    country: &str,
    relationship_type: RelationshipType,
    centrality: Centrality,
    sentiment: Sentiment,
    themes: &[&str],
    associations: &[&str],
) -> String {
    json!({
        "country": country,
        "relationship_type": relationship_type.label(),
        "themes": themes,
        "centrality": centrality.label(),
        "sentiment": sentiment.label(),
        "associations": associations,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rules_and_sequences() {
        let model = ScriptedModel::new()
            .on_sequence(
                &["Eastoria", "troops"],
                vec![Scripted::Timeout, Scripted::Reply("second".into())],
            )
            .on(&["Eastoria"], Scripted::Reply("any Eastoria".into()));

        assert!(matches!(model.invoke("Eastoria troops").await, Err(ModelError::Timeout)));
        assert_eq!(model.invoke("Eastoria troops").await.unwrap(), "second");
        assert_eq!(model.invoke("Eastoria troops").await.unwrap(), "second");
        assert_eq!(model.invoke("Eastoria trade").await.unwrap(), "any Eastoria");
        assert_eq!(model.invoke("Northland").await.unwrap(), NOT_DISCUSSED);

        assert_eq!(model.call_count(), 5);
        assert_eq!(model.calls_containing("troops"), 3);
        assert_eq!(model.peak_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_peak_counts_overlapping_calls() {
        let model = ScriptedModel::new().with_latency(Duration::from_millis(20));

        let (a, b, c) = tokio::join!(model.invoke("one"), model.invoke("two"), model.invoke("three"));
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(model.peak_in_flight(), 3);
        assert_eq!(model.calls().len(), 3);

        model.clear_calls();
        assert_eq!(model.call_count(), 0);
        assert_eq!(model.peak_in_flight(), 0);

        let _ = tokio::time::timeout(Duration::from_millis(5), model.invoke("abandoned")).await;
        model.invoke("after").await.unwrap();
        assert_eq!(model.peak_in_flight(), 1);
    }
}
