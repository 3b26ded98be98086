pub mod attempt;
pub mod invoker;
pub mod llm;
pub mod normalizer;
pub mod parse;
pub mod prompt;
pub mod retry;
pub mod schema;
pub mod testing;
pub mod validate;

pub use attempt::{AttemptState, ExtractionAttempt, ExtractionUnit, ParseStatus, StateError};
pub use invoker::{ExtractionInvoker, InvokeError};
pub use llm::{LanguageModel, ModelError, OllamaClient};
pub use normalizer::{TermNormalizer, TermSet};
pub use parse::{ParsedReply, ReplyFailure, parse_reply};
pub use prompt::{BoundVariables, PromptError, PromptTemplate, ReplyShape};
pub use retry::{RetryPolicy, Retryable};
pub use schema::{
    AggregatedJudgment, Centrality, Characterization, ExtractionPayload, INSUFFICIENT_DATA,
    NOT_DISCUSSED, RecordBody, RelationshipRecord, RelationshipType, Sentiment, Sentinel, Verdict,
};
pub use validate::{SchemaValidator, SchemaViolation};
