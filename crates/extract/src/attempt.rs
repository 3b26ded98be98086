use ingest::{Chunk, Speech};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::parse::ParsedReply;
use crate::schema::ExtractionPayload;

/// What a single model call was asked to look at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractionUnit {
    Chunk {
        speech_id: String,
        chunk_id: String,
        ordinal: usize,
        /// Characters not shared with the previous chunk.
        unique_len: usize,
    },
    WholeSpeech {
        speech_id: String,
        len: usize,
    },
    /// Cross-record description request for one pair.
    Synthesis {
        source: String,
        target: String,
    },
}

impl ExtractionUnit {
    pub fn for_chunk(chunk: &Chunk) -> Self {
        ExtractionUnit::Chunk {
            speech_id: chunk.speech_id.clone(),
            chunk_id: chunk.chunk_id.clone(),
            ordinal: chunk.ordinal,
            unique_len: chunk.unique_len(),
        }
    }

    pub fn whole_speech(speech: &Speech) -> Self {
        ExtractionUnit::WholeSpeech {
            speech_id: speech.id().to_string(),
            len: speech.text().chars().count(),
        }
    }

    pub fn synthesis(source: &str, target: &str) -> Self {
        ExtractionUnit::Synthesis {
            source: source.to_string(),
            target: target.to_string(),
        }
    }

    pub fn id(&self) -> String {
        match self {
            ExtractionUnit::Chunk { chunk_id, .. } => chunk_id.clone(),
            ExtractionUnit::WholeSpeech { speech_id, .. } => format!("{}:whole", speech_id),
            ExtractionUnit::Synthesis { source, target } => format!("{}->{}", source, target),
        }
    }

    /// Position within the speech; a whole speech is its own first unit.
    pub fn ordinal(&self) -> usize {
        match self {
            ExtractionUnit::Chunk { ordinal, .. } => *ordinal,
            _ => 0,
        }
    }

    /// Original text length the unit covers, without overlap.
    pub fn weight_len(&self) -> usize {
        match self {
            ExtractionUnit::Chunk { unique_len, .. } => *unique_len,
            ExtractionUnit::WholeSpeech { len, .. } => *len,
            ExtractionUnit::Synthesis { .. } => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseStatus {
    Ok,
    Malformed,
    Timeout,
    Refused,
}

impl ParseStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ParseStatus::Ok => "ok",
            ParseStatus::Malformed => "malformed",
            ParseStatus::Timeout => "timeout",
            ParseStatus::Refused => "refused",
        }
    }
}

impl fmt::Display for ParseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// `pending -> invoked -> completed(status) -> validated | rejected`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Pending,
    Invoked,
    Completed(ParseStatus),
    Validated,
    Rejected,
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptState::Validated | AttemptState::Rejected)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum StateError {
    #[error("attempt {unit} cannot move from {from:?} to {to}")]
    IllegalTransition {
        unit: String,
        from: AttemptState,
        to: &'static str,
    },
}

/// One model call for one (unit, target) pair and everything learned from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionAttempt {
    unit: ExtractionUnit,
    target: String,
    state: AttemptState,
    status: Option<ParseStatus>,
    raw_output: Option<String>,
    tries: usize,
    reply: Option<ParsedReply>,
    payload: Option<ExtractionPayload>,
    failure: Option<String>,
}

impl ExtractionAttempt {
    pub fn new(unit: ExtractionUnit, target: &str) -> Self {
        Self {
            unit,
            target: target.to_string(),
            state: AttemptState::Pending,
            status: None,
            raw_output: None,
            tries: 0,
            reply: None,
            payload: None,
            failure: None,
        }
    }

    pub fn begin(&mut self) -> Result<(), StateError> {
        self.transition(AttemptState::Pending, AttemptState::Invoked, "invoked")
    }

    /// Record a reply that parsed into the expected shape.
    pub fn succeed(&mut self, raw: String, reply: ParsedReply, tries: usize) -> Result<(), StateError> {
        self.transition(
            AttemptState::Invoked,
            AttemptState::Completed(ParseStatus::Ok),
            "ok",
        )?;
        self.status = Some(ParseStatus::Ok);
        self.raw_output = Some(raw);
        self.reply = Some(reply);
        self.tries = tries;
        Ok(())
    }

    /// Record a classified failure. `status` must not be `Ok`.
    pub fn fail(
        &mut self,
        status: ParseStatus,
        raw: Option<String>,
        reason: impl Into<String>,
        tries: usize,
    ) -> Result<(), StateError> {
        if status == ParseStatus::Ok {
            return Err(self.illegal("failed with ok status"));
        }
        self.transition(AttemptState::Invoked, AttemptState::Completed(status), status.label())?;
        self.status = Some(status);
        self.raw_output = raw;
        self.failure = Some(reason.into());
        self.tries = tries;
        Ok(())
    }

    pub fn validate(&mut self, payload: ExtractionPayload) -> Result<(), StateError> {
        self.transition(
            AttemptState::Completed(ParseStatus::Ok),
            AttemptState::Validated,
            "validated",
        )?;
        self.payload = Some(payload);
        Ok(())
    }

    /// Any completed attempt may be rejected. A failed call keeps its
    /// original failure as the reason.
    pub fn reject(&mut self, reason: impl Into<String>) -> Result<(), StateError> {
        match self.state {
            AttemptState::Completed(_) => {
                self.state = AttemptState::Rejected;
                if self.failure.is_none() {
                    self.failure = Some(reason.into());
                }
                Ok(())
            }
            _ => Err(self.illegal("rejected")),
        }
    }

    fn transition(
        &mut self,
        from: AttemptState,
        to: AttemptState,
        label: &'static str,
    ) -> Result<(), StateError> {
        if self.state != from {
            return Err(self.illegal(label));
        }
        self.state = to;
        Ok(())
    }

    fn illegal(&self, to: &'static str) -> StateError {
        StateError::IllegalTransition {
            unit: self.unit.id(),
            from: self.state,
            to,
        }
    }

    pub fn unit(&self) -> &ExtractionUnit {
        &self.unit
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    pub fn status(&self) -> Option<ParseStatus> {
        self.status
    }

    pub fn raw_output(&self) -> Option<&str> {
        self.raw_output.as_deref()
    }

    pub fn tries(&self) -> usize {
        self.tries
    }

    pub fn reply(&self) -> Option<&ParsedReply> {
        self.reply.as_ref()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// The payload of a validated attempt; `None` for anything else.
    pub fn usable_payload(&self) -> Option<&ExtractionPayload> {
        match self.state {
            AttemptState::Validated => self.payload.as_ref(),
            _ => None,
        }
    }
}
