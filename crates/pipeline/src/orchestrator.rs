use aggregate::{RecordContext, aggregate_attempts, aggregate_records, collapse_passes, group_by_pair, synthesis};
use anyhow::Result;
use extract::{
    AggregatedJudgment, BoundVariables, ExtractionAttempt, ExtractionInvoker, ExtractionUnit, LanguageModel,
    OllamaClient, PromptTemplate, RelationshipRecord, RetryPolicy, SchemaValidator, TermNormalizer, Verdict,
};
use ingest::{Chunker, Speech};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, ExtractionMode};
use crate::error::PipelineError;
use crate::metrics::{MetricsSnapshot, PipelineMetrics, TimedOperation};

/// One speech and the countries to look for in it.
#[derive(Debug, Clone)]
pub struct ExtractionJob {
    pub speech: Speech,
    pub targets: Vec<String>,
}

impl ExtractionJob {
    pub fn new(speech: Speech, targets: &[&str]) -> Self {
        Self {
            speech,
            targets: targets.iter().map(|t| t.to_string()).collect(),
        }
    }
}

/// Work that produced no record, and why.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedUnit {
    pub speech_id: String,
    /// `None` when the whole speech was skipped.
    pub target: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    /// One record per (speech, target, pass).
    pub records: Vec<RelationshipRecord>,
    /// One verdict per (speech, target), reconciling the passes.
    pub verdicts: Vec<AggregatedJudgment>,
    pub skipped: Vec<SkippedUnit>,
    /// Set when the batch was cancelled or ran past its deadline.
    pub cancelled: bool,
    /// Counts for this batch only; `Orchestrator::metrics` keeps the totals.
    pub metrics: MetricsSnapshot,
}

/// (job, target, pass)
type PassKey = (usize, usize, usize);

struct PlannedJob {
    speech: Speech,
    targets: Vec<String>,
}

struct UnitTask {
    key: PassKey,
    unit: ExtractionUnit,
    target: String,
    prompt: String,
}

pub struct Orchestrator {
    invoker: ExtractionInvoker,
    validator: Arc<SchemaValidator>,
    config: AppConfig,
    chunker: Chunker,
    semaphore: Arc<Semaphore>,
    metrics: Arc<PipelineMetrics>,
    characterization: PromptTemplate,
    relationship: PromptTemplate,
}

impl Orchestrator {
    pub fn new(config: AppConfig, model: Arc<dyn LanguageModel>) -> Result<Self, PipelineError> {
        config.validate()?;

        let retry = RetryPolicy::new(
            config.retry.max_retries,
            config.retry.initial_backoff_ms,
            config.retry.max_backoff_ms,
        );
        let timeout = Duration::from_secs(config.concurrency.request_timeout_secs);
        let chunker = Chunker::new(config.chunking.chunker_config())?;
        let normalizer = config
            .aggregation
            .country_aliases
            .iter()
            .fold(TermNormalizer::new(), |normalizer, (alias, canonical)| {
                normalizer.with_alias(alias, canonical)
            });
        let validator = SchemaValidator::new(config.aggregation.similarity_threshold).with_normalizer(normalizer);

        info!(
            model = model.name(),
            mode = ?config.mode,
            max_concurrent = config.concurrency.max_concurrent_llm_calls,
            passes = config.aggregation.passes_per_speech,
            "Initializing orchestrator"
        );

        Ok(Self {
            invoker: ExtractionInvoker::new(model, retry, timeout),
            validator: Arc::new(validator),
            semaphore: Arc::new(Semaphore::new(config.concurrency.max_concurrent_llm_calls)),
            metrics: PipelineMetrics::new(),
            characterization: PromptTemplate::characterization(),
            relationship: PromptTemplate::relationship(),
            chunker,
            config,
        })
    }

    /// Orchestrator backed by the Ollama endpoint named in `config.model`.
    pub fn with_ollama(config: AppConfig) -> Result<Self> {
        let client = OllamaClient::with_timeout(
            config.model.base_url.clone(),
            config.model.name.clone(),
            Duration::from_secs(config.concurrency.request_timeout_secs),
        )?;
        Ok(Self::new(config, Arc::new(client))?)
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Extract, validate and aggregate every (speech, target) in `jobs`.
    ///
    /// Individual failures never abort the batch: they become skipped units
    /// or absent signal. Cancelling `cancel` or passing the batch deadline
    /// abandons in-flight calls and aggregates whatever completed.
    pub async fn run_batch(&self, jobs: Vec<ExtractionJob>, cancel: CancellationToken) -> BatchReport {
        let timer = TimedOperation::start();
        let baseline = self.metrics.snapshot();
        let mut skipped = Vec::new();

        let mut planned: Vec<PlannedJob> = jobs.into_iter().map(|job| self.plan_targets(job, &mut skipped)).collect();
        let tasks = self.plan_units(&mut planned, &mut skipped);

        info!(speeches = planned.len(), units = tasks.len(), "Starting extraction batch");

        let (mut attempts, cancelled) = self.dispatch(tasks, &cancel).await;

        let mut records = Vec::new();
        let mut verdicts = Vec::new();

        for (job_idx, job) in planned.iter().enumerate() {
            for (target_idx, target) in job.targets.iter().enumerate() {
                let ctx = RecordContext::for_speech(&job.speech, target);
                let mut passes = Vec::new();

                for pass in 0..self.config.aggregation.passes_per_speech {
                    let Some(pass_attempts) = attempts.remove(&(job_idx, target_idx, pass)) else {
                        continue;
                    };
                    let record = aggregate_attempts(&ctx, &pass_attempts, self.validator.normalizer());
                    match self.validator.check_record(&record) {
                        Ok(()) => {
                            self.metrics.record_record(&record);
                            passes.push(record);
                        }
                        Err(violation) => {
                            warn!(speech = %ctx.speech_id, target = %target, pass, violation = %violation, "Dropped invalid record");
                            skipped.push(SkippedUnit {
                                speech_id: ctx.speech_id.clone(),
                                target: Some(target.clone()),
                                reason: violation.to_string(),
                            });
                        }
                    }
                }

                if passes.is_empty() {
                    if !cancelled {
                        skipped.push(SkippedUnit {
                            speech_id: ctx.speech_id.clone(),
                            target: Some(target.clone()),
                            reason: "no extraction attempt completed".to_string(),
                        });
                    }
                    continue;
                }

                match aggregate_records(&ctx.source, target, &passes, &self.config.aggregation.per_speech) {
                    Ok(judgment) => verdicts.push(self.finalize(judgment, &passes, !cancelled).await),
                    Err(e) => error!(speech = %ctx.speech_id, error = %e, "Per-speech aggregation failed"),
                }
                records.extend(passes);
            }
        }

        let metrics = self.metrics.snapshot().since(&baseline);
        info!(
            records = records.len(),
            verdicts = verdicts.len(),
            skipped = skipped.len(),
            cancelled,
            elapsed_ms = timer.elapsed().as_millis() as u64,
            "Extraction batch finished"
        );

        BatchReport {
            records,
            verdicts,
            skipped,
            cancelled,
            metrics,
        }
    }

    /// Judge each (source, target) pair across speeches. Multiple passes
    /// over one speech are first reduced to a single record.
    pub async fn judge_longitudinal(
        &self,
        records: &[RelationshipRecord],
    ) -> Result<Vec<AggregatedJudgment>, PipelineError> {
        let collapsed = collapse_passes(records, &self.config.aggregation.per_speech.tie_break);

        let mut judgments = Vec::new();
        for ((source, target), group) in group_by_pair(&collapsed) {
            let judgment = aggregate_records(&source, &target, &group, &self.config.aggregation.longitudinal)?;
            judgments.push(self.finalize(judgment, &group, true).await);
        }

        info!(
            pairs = judgments.len(),
            insufficient = judgments.iter().filter(|j| j.is_insufficient()).count(),
            "Longitudinal judgments complete"
        );
        Ok(judgments)
    }

    /// Canonicalize and dedupe targets, dropping the speaker itself.
    fn plan_targets(&self, job: ExtractionJob, skipped: &mut Vec<SkippedUnit>) -> PlannedJob {
        let normalizer = self.validator.normalizer();
        let mut targets: Vec<String> = Vec::new();

        for raw in &job.targets {
            let reason = match normalizer.association(raw) {
                None => "empty target".to_string(),
                Some(target) if normalizer.same_country(&target, job.speech.source()) => {
                    format!("{} is the speaking country", target)
                }
                Some(target) if targets.iter().any(|t| normalizer.same_country(t, &target)) => {
                    debug!(speech = job.speech.id(), target = %target, "Duplicate target ignored");
                    continue;
                }
                Some(target) => {
                    targets.push(target);
                    continue;
                }
            };
            warn!(speech = job.speech.id(), target = %raw, reason = %reason, "Skipping target");
            skipped.push(SkippedUnit {
                speech_id: job.speech.id().to_string(),
                target: Some(raw.clone()),
                reason,
            });
        }

        PlannedJob {
            speech: job.speech,
            targets,
        }
    }

    /// Split each speech into units and bind one prompt per (unit, target, pass).
    /// Speeches that cannot be split lose their targets.
    fn plan_units(&self, planned: &mut [PlannedJob], skipped: &mut Vec<SkippedUnit>) -> Vec<UnitTask> {
        let mut tasks = Vec::new();

        for (job_idx, job) in planned.iter_mut().enumerate() {
            if job.targets.is_empty() {
                continue;
            }

            let units = match self.units_for(&job.speech) {
                Ok(units) => units,
                Err(e) => {
                    warn!(speech = job.speech.id(), error = %e, "Skipping speech");
                    self.metrics.record_skip();
                    skipped.push(SkippedUnit {
                        speech_id: job.speech.id().to_string(),
                        target: None,
                        reason: e.to_string(),
                    });
                    job.targets.clear();
                    continue;
                }
            };

            let year = job.speech.year().to_string();
            for (target_idx, target) in job.targets.iter().enumerate() {
                for (unit, text) in &units {
                    let vars = BoundVariables::new()
                        .with("source", job.speech.source())
                        .with("target", target.as_str())
                        .with("year", year.as_str())
                        .with("text", text.as_str());
                    let prompt = match self.characterization.bind(&vars) {
                        Ok(prompt) => prompt,
                        Err(e) => {
                            warn!(speech = job.speech.id(), unit = %unit.id(), error = %e, "Prompt binding failed");
                            skipped.push(SkippedUnit {
                                speech_id: job.speech.id().to_string(),
                                target: Some(target.clone()),
                                reason: e.to_string(),
                            });
                            continue;
                        }
                    };
                    for pass in 0..self.config.aggregation.passes_per_speech {
                        tasks.push(UnitTask {
                            key: (job_idx, target_idx, pass),
                            unit: unit.clone(),
                            target: target.clone(),
                            prompt: prompt.clone(),
                        });
                    }
                }
            }
        }

        tasks
    }

    fn units_for(&self, speech: &Speech) -> Result<Vec<(ExtractionUnit, String)>, PipelineError> {
        let chunks = self.chunker.chunk_speech(speech)?;
        let whole = || vec![(ExtractionUnit::whole_speech(speech), speech.text().to_string())];

        Ok(match self.config.chunking.extraction_mode {
            ExtractionMode::WholeSpeech => whole(),
            ExtractionMode::Auto if chunks.len() == 1 => whole(),
            ExtractionMode::Auto | ExtractionMode::Chunked => chunks
                .into_iter()
                .map(|chunk| (ExtractionUnit::for_chunk(&chunk), chunk.text))
                .collect(),
        })
    }

    /// Run every unit under the admission semaphore until all finish, the
    /// token is cancelled, or the deadline passes.
    async fn dispatch(
        &self,
        tasks: Vec<UnitTask>,
        cancel: &CancellationToken,
    ) -> (HashMap<PassKey, Vec<ExtractionAttempt>>, bool) {
        let mut set = JoinSet::new();

        for task in tasks {
            let invoker = self.invoker.clone();
            let validator = Arc::clone(&self.validator);
            let semaphore = Arc::clone(&self.semaphore);
            let shape = self.characterization.shape();
            self.metrics.record_dispatch();

            set.spawn(async move {
                // Held across retries so backoff doesn't free the slot.
                let _permit = semaphore.acquire_owned().await.map_err(|_| PipelineError::Cancelled)?;
                let timer = TimedOperation::start();
                let attempt = invoker
                    .invoke_prompt(&task.prompt, shape, task.unit, &task.target)
                    .await?;
                let attempt = validator.validate_attempt(attempt)?;
                Ok::<_, PipelineError>((task.key, attempt, timer.elapsed()))
            });
        }

        let deadline = self.config.concurrency.batch_timeout_secs.map(Duration::from_secs);
        let expired = async {
            match deadline {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(expired);

        let mut attempts: HashMap<PassKey, Vec<ExtractionAttempt>> = HashMap::new();
        let mut cancelled = false;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled(), if !cancelled => {
                    warn!(in_flight = set.len(), "Batch cancelled, abandoning in-flight units");
                    cancelled = true;
                    set.abort_all();
                }
                _ = &mut expired, if !cancelled => {
                    warn!(in_flight = set.len(), timeout_secs = ?deadline.map(|d| d.as_secs()), "Batch deadline passed, abandoning in-flight units");
                    cancelled = true;
                    set.abort_all();
                }
                joined = set.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok((key, attempt, elapsed)))) => {
                        self.metrics.record_attempt(&attempt, elapsed);
                        attempts.entry(key).or_default().push(attempt);
                    }
                    Some(Ok(Err(e))) => warn!(error = %e, "Extraction unit failed"),
                    Some(Err(e)) if e.is_cancelled() => {}
                    Some(Err(e)) => error!(error = %e, "Extraction task panicked"),
                },
            }
        }

        (attempts, cancelled)
    }

    /// Optional model wording, then the final schema check.
    async fn finalize(
        &self,
        mut judgment: AggregatedJudgment,
        records: &[RelationshipRecord],
        allow_model: bool,
    ) -> AggregatedJudgment {
        if allow_model && self.config.aggregation.model_descriptions && !judgment.is_insufficient() {
            if let Some((verdict, description)) = self.refine_description(&judgment, records).await {
                if verdict == judgment.relationship_type {
                    judgment.description = description;
                } else {
                    debug!(
                        source = %judgment.source,
                        target = %judgment.target,
                        model = verdict.label(),
                        vote = judgment.relationship_type.label(),
                        "Model description disagrees with vote, keeping synthesized one"
                    );
                }
            }
        }

        if let Err(violation) = self.validator.check_judgment(&judgment) {
            warn!(
                source = %judgment.source,
                target = %judgment.target,
                violation = %violation,
                "Judgment description failed validation, falling back to headline"
            );
            if let Verdict::Relationship(relationship_type) = judgment.relationship_type {
                let usable: Vec<&RelationshipRecord> = records.iter().filter(|r| !r.is_not_discussed()).collect();
                judgment.description =
                    synthesis::headline(&judgment.source, &judgment.target, relationship_type, &usable);
            }
        }

        self.metrics.record_judgment(&judgment);
        judgment
    }

    async fn refine_description(
        &self,
        judgment: &AggregatedJudgment,
        records: &[RelationshipRecord],
    ) -> Option<(Verdict, String)> {
        let usable: Vec<&RelationshipRecord> = records.iter().filter(|r| !r.is_not_discussed()).collect();
        let vars = BoundVariables::new()
            .with("source", judgment.source.as_str())
            .with("target", judgment.target.as_str())
            .with("years", synthesis::years_label(&usable))
            .with("summaries", synthesis::summaries_block(&judgment.target, &usable));

        let _permit = self.semaphore.acquire().await.ok()?;
        self.metrics.record_dispatch();
        let timer = TimedOperation::start();
        let unit = ExtractionUnit::synthesis(&judgment.source, &judgment.target);

        let attempt = match self.invoker.invoke(&self.relationship, &vars, unit, &judgment.target).await {
            Ok(attempt) => attempt,
            Err(e) => {
                warn!(source = %judgment.source, target = %judgment.target, error = %e, "Description request failed");
                return None;
            }
        };
        self.metrics.record_attempt(&attempt, timer.elapsed());

        match self.validator.resolve_judgment_reply(attempt.reply()?) {
            Ok(resolved) => Some(resolved),
            Err(violation) => {
                warn!(source = %judgment.source, target = %judgment.target, violation = %violation, "Rejected model description");
                None
            }
        }
    }
}
