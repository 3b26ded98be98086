use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::attempt::{ExtractionAttempt, ExtractionUnit, ParseStatus, StateError};
use crate::llm::{LanguageModel, ModelError};
use crate::parse::{ParsedReply, ReplyFailure, parse_reply};
use crate::prompt::{BoundVariables, PromptError, PromptTemplate, ReplyShape};
use crate::retry::{RetryPolicy, Retryable};

/// Errors that stop an attempt from being made at all. Model failures are
/// never errors here; they are recorded on the attempt.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error(transparent)]
    Prompt(#[from] PromptError),

    #[error(transparent)]
    State(#[from] StateError),
}

/// Outcome of one try, before retries are exhausted.
#[derive(Debug)]
enum InvokeFailure {
    Timeout,
    Transport(String),
    Malformed { raw: String, reason: String },
    Refused { raw: String },
}

impl fmt::Display for InvokeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvokeFailure::Timeout => write!(f, "model call timed out"),
            InvokeFailure::Transport(msg) => write!(f, "transport error: {}", msg),
            InvokeFailure::Malformed { reason, .. } => write!(f, "malformed reply: {}", reason),
            InvokeFailure::Refused { .. } => write!(f, "model refused"),
        }
    }
}

impl Retryable for InvokeFailure {
    fn is_transient(&self) -> bool {
        !matches!(self, InvokeFailure::Refused { .. })
    }
}

/// Binds a template, calls the model, and classifies what comes back.
#[derive(Clone)]
pub struct ExtractionInvoker {
    model: Arc<dyn LanguageModel>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl ExtractionInvoker {
    pub fn new(model: Arc<dyn LanguageModel>, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            model,
            retry,
            timeout,
        }
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub async fn invoke(
        &self,
        template: &PromptTemplate,
        vars: &BoundVariables,
        unit: ExtractionUnit,
        target: &str,
    ) -> Result<ExtractionAttempt, InvokeError> {
        let prompt = template.bind(vars)?;
        self.invoke_prompt(&prompt, template.shape(), unit, target).await
    }

    /// Run an already-bound prompt. The returned attempt is in the
    /// `Completed` state; validation is the caller's job.
    pub async fn invoke_prompt(
        &self,
        prompt: &str,
        shape: ReplyShape,
        unit: ExtractionUnit,
        target: &str,
    ) -> Result<ExtractionAttempt, InvokeError> {
        let operation = format!("extract {} / {}", unit.id(), target);
        let mut attempt = ExtractionAttempt::new(unit, target);
        attempt.begin()?;

        let mut tries = 0;
        let outcome = self
            .retry
            .retry(&operation, || {
                tries += 1;
                self.call_once(prompt, shape)
            })
            .await;

        match outcome {
            Ok((raw, reply)) => {
                debug!(operation = %operation, tries, "Reply parsed");
                attempt.succeed(raw, reply, tries)?;
            }
            Err(InvokeFailure::Timeout) => {
                attempt.fail(ParseStatus::Timeout, None, "model call timed out", tries)?;
            }
            // An endpoint that keeps failing is treated like one that never answers.
            Err(InvokeFailure::Transport(msg)) => {
                attempt.fail(ParseStatus::Timeout, None, format!("transport: {}", msg), tries)?;
            }
            Err(InvokeFailure::Malformed { raw, reason }) => {
                attempt.fail(ParseStatus::Malformed, Some(raw), reason, tries)?;
            }
            Err(InvokeFailure::Refused { raw }) => {
                attempt.fail(ParseStatus::Refused, Some(raw), "model refused", tries)?;
            }
        }

        Ok(attempt)
    }

    async fn call_once(&self, prompt: &str, shape: ReplyShape) -> Result<(String, ParsedReply), InvokeFailure> {
        let raw = match tokio::time::timeout(self.timeout, self.model.invoke(prompt)).await {
            Err(_) | Ok(Err(ModelError::Timeout)) => return Err(InvokeFailure::Timeout),
            Ok(Err(ModelError::Refused(msg))) => return Err(InvokeFailure::Refused { raw: msg }),
            Ok(Err(ModelError::Transport(msg))) => return Err(InvokeFailure::Transport(msg)),
            Ok(Ok(raw)) => raw,
        };

        match parse_reply(&raw, shape) {
            Ok(reply) => Ok((raw, reply)),
            Err(ReplyFailure::Refused) => Err(InvokeFailure::Refused { raw }),
            Err(ReplyFailure::Malformed(reason)) => Err(InvokeFailure::Malformed { raw, reason }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempt::AttemptState;
    use crate::schema::{Centrality, NOT_DISCUSSED, RelationshipType, Sentiment, Sentinel};
    use crate::testing::{Scripted, ScriptedModel, payload_json};

    fn unit() -> ExtractionUnit {
        ExtractionUnit::Chunk {
            speech_id: "WESTMARK_1990".to_string(),
            chunk_id: "c0".to_string(),
            ordinal: 0,
            unique_len: 40,
        }
    }

    fn vars() -> BoundVariables {
        BoundVariables::new()
            .with("source", "Westmark")
            .with("target", "Eastoria")
            .with("year", "1990")
            .with("text", "Eastoria must withdraw its troops.")
    }

    fn invoker(model: ScriptedModel) -> (Arc<ScriptedModel>, ExtractionInvoker) {
        let model = Arc::new(model);
        let invoker = ExtractionInvoker::new(model.clone(), RetryPolicy::new(2, 1, 2), Duration::from_millis(200));
        (model, invoker)
    }

    #[tokio::test]
    async fn test_parsed_reply() {
        let reply = payload_json(
            "Eastoria",
            RelationshipType::OppositionAndCriticism,
            Centrality::Major,
            Sentiment::Hostile,
            &["troop withdrawal"],
            &[],
        );
        let (model, invoker) = invoker(ScriptedModel::new().on(&["withdraw"], Scripted::Reply(reply)));

        let attempt = invoker
            .invoke(&PromptTemplate::characterization(), &vars(), unit(), "Eastoria")
            .await
            .unwrap();

        assert_eq!(attempt.status(), Some(ParseStatus::Ok));
        assert_eq!(attempt.state(), AttemptState::Completed(ParseStatus::Ok));
        assert_eq!(attempt.tries(), 1);
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_then_recovered() {
        let model = ScriptedModel::new().on_sequence(
            &["withdraw"],
            vec![
                Scripted::Reply("Eastoria is criticised.".to_string()),
                Scripted::Reply(NOT_DISCUSSED.to_string()),
            ],
        );
        let (model, invoker) = invoker(model);

        let attempt = invoker
            .invoke(&PromptTemplate::characterization(), &vars(), unit(), "Eastoria")
            .await
            .unwrap();

        assert_eq!(attempt.status(), Some(ParseStatus::Ok));
        assert_eq!(attempt.reply(), Some(&ParsedReply::Sentinel(Sentinel::NotDiscussed)));
        assert_eq!(attempt.tries(), 2);
        assert_eq!(model.call_count(), 2);
    }

    #[tokio::test]
    async fn test_persistent_garbage_is_malformed() {
        let (model, invoker) = invoker(ScriptedModel::new().with_fallback(Scripted::Reply("garbage".into())));

        let attempt = invoker
            .invoke(&PromptTemplate::characterization(), &vars(), unit(), "Eastoria")
            .await
            .unwrap();

        assert_eq!(attempt.status(), Some(ParseStatus::Malformed));
        assert_eq!(attempt.raw_output(), Some("garbage"));
        assert_eq!(model.call_count(), 3);
    }

    #[tokio::test]
    async fn test_hanging_model_times_out() {
        let (model, invoker) = invoker(ScriptedModel::new().with_fallback(Scripted::Hang));

        let attempt = invoker
            .invoke(&PromptTemplate::characterization(), &vars(), unit(), "Eastoria")
            .await
            .unwrap();

        assert_eq!(attempt.status(), Some(ParseStatus::Timeout));
        assert_eq!(model.call_count(), 3);
    }

    #[tokio::test]
    async fn test_refusal_is_not_retried() {
        let (model, invoker) = invoker(ScriptedModel::new().with_fallback(Scripted::Refuse("policy".into())));

        let attempt = invoker
            .invoke(&PromptTemplate::characterization(), &vars(), unit(), "Eastoria")
            .await
            .unwrap();

        assert_eq!(attempt.status(), Some(ParseStatus::Refused));
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn test_unbound_template_is_an_error() {
        let (model, invoker) = invoker(ScriptedModel::new());
        let result = invoker
            .invoke(
                &PromptTemplate::characterization(),
                &BoundVariables::new().with("source", "Westmark"),
                unit(),
                "Eastoria",
            )
            .await;

        assert!(matches!(result, Err(InvokeError::Prompt(_))));
        assert_eq!(model.call_count(), 0);
    }
}
