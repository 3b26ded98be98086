use extract::testing::{Scripted, ScriptedModel, payload_json};
use extract::{Centrality, NOT_DISCUSSED, RelationshipType, Sentiment, Verdict};
use ingest::Speech;
use pipeline::config::RetryConfig;
use pipeline::{AppConfig, ExtractionJob, ExtractionMode, Orchestrator};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const OCCUPATION: &str = "Eastoria has moved its troops across our northern border and occupies the valley towns, and Westmark condemns this aggression before the whole Assembly. ";
const TRADE: &str = "We also regret that Eastoria still blocks the river trade route on which our farmers depend for their livelihoods and their markets. ";
const CHARTER: &str = "Finally, Westmark reaffirms its commitment to the Charter and to the peaceful settlement of all disputes among the nations of the world.";

fn eastoria_speech(year: u16) -> Speech {
    Speech::new("Westmark", year, format!("{}{}{}", OCCUPATION, TRADE, CHARTER))
}

/// Splits the three-paragraph speech into one chunk per paragraph.
fn chunked_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.chunking.extraction_mode = ExtractionMode::Chunked;
    config.chunking.max_size = 200;
    config.chunking.overlap = 0;
    config.retry = RetryConfig {
        max_retries: 2,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
    };
    config
}

fn eastoria_model() -> ScriptedModel {
    ScriptedModel::new()
        .on(
            &["troops"],
            Scripted::Reply(payload_json(
                "Eastoria",
                RelationshipType::OppositionAndCriticism,
                Centrality::Major,
                Sentiment::Hostile,
                &["military occupation", "border"],
                &["Northland"],
            )),
        )
        .on(
            &["river trade"],
            Scripted::Reply(payload_json(
                "Eastoria",
                RelationshipType::OppositionAndCriticism,
                Centrality::Passing,
                Sentiment::Hostile,
                &["trade route", "Border."],
                &[],
            )),
        )
}

#[tokio::test]
async fn test_eastoria_three_chunks() {
    let model = Arc::new(eastoria_model());
    let orch = Orchestrator::new(chunked_config(), model.clone()).unwrap();

    let report = orch
        .run_batch(
            vec![ExtractionJob::new(eastoria_speech(1990), &["Eastoria"])],
            CancellationToken::new(),
        )
        .await;

    assert!(!report.cancelled);
    assert!(report.skipped.is_empty());
    assert_eq!(model.call_count(), 3);
    assert_eq!(report.metrics.units_dispatched, 3);
    assert_eq!(report.metrics.attempts_validated, 3);

    assert_eq!(report.records.len(), 1);
    let record = &report.records[0];
    assert_eq!(record.relationship_type(), Some(RelationshipType::OppositionAndCriticism));
    assert_eq!(record.centrality(), Centrality::Major);
    assert_eq!(record.sentiment(), Some(Sentiment::Hostile));

    let mut themes = record.themes().to_vec();
    themes.sort();
    assert_eq!(themes, vec!["border", "military occupation", "trade route"]);
    assert_eq!(record.associations(), ["Northland".to_string()]);
    assert_eq!(record.units.len(), 2);

    assert_eq!(report.verdicts.len(), 1);
    let verdict = &report.verdicts[0];
    assert_eq!(verdict.relationship_type, Verdict::Relationship(RelationshipType::OppositionAndCriticism));
    assert_eq!(verdict.provenance, vec![record.id.clone()]);
}

#[tokio::test]
async fn test_target_never_mentioned_is_the_sentinel() {
    let model = Arc::new(ScriptedModel::new());
    let orch = Orchestrator::new(chunked_config(), model).unwrap();

    let speech = Speech::new("Westmark", 1990, CHARTER);
    let report = orch
        .run_batch(vec![ExtractionJob::new(speech, &["Northland"])], CancellationToken::new())
        .await;

    assert_eq!(report.records.len(), 1);
    let record = &report.records[0];
    assert!(record.is_not_discussed());
    assert_eq!(record.centrality(), Centrality::NotDiscussed);
    assert!(record.themes().is_empty());
    assert!(record.associations().is_empty());
    assert_eq!(record.to_output(), serde_json::Value::String(NOT_DISCUSSED.to_string()));

    assert_eq!(report.metrics.records_not_discussed, 1);
    assert!(report.verdicts[0].is_insufficient());
}

#[tokio::test]
async fn test_whole_speech_and_chunks_agree() {
    let chunked = Orchestrator::new(chunked_config(), Arc::new(eastoria_model())).unwrap();

    let mut whole_config = chunked_config();
    whole_config.chunking.extraction_mode = ExtractionMode::WholeSpeech;
    let whole_model = Arc::new(eastoria_model());
    let whole = Orchestrator::new(whole_config, whole_model.clone()).unwrap();

    let job = || vec![ExtractionJob::new(eastoria_speech(1990), &["Eastoria"])];
    let from_chunks = chunked.run_batch(job(), CancellationToken::new()).await;
    let from_whole = whole.run_batch(job(), CancellationToken::new()).await;

    assert_eq!(whole_model.call_count(), 1);
    assert_eq!(
        from_chunks.records[0].relationship_type(),
        from_whole.records[0].relationship_type()
    );
    assert_eq!(from_chunks.verdicts[0].relationship_type, from_whole.verdicts[0].relationship_type);
}

#[tokio::test]
async fn test_malformed_reply_is_retried() {
    let model = Arc::new(ScriptedModel::new().on_sequence(
        &["troops"],
        vec![
            Scripted::Reply(r#"```json
{"country": "Eastoria", "relationship_type": "#.to_string()),
            Scripted::Reply(payload_json(
                "Eastoria",
                RelationshipType::ConflictAndSecurity,
                Centrality::Major,
                Sentiment::Hostile,
                &["troops"],
                &[],
            )),
        ],
    ));
    let mut config = chunked_config();
    config.chunking.extraction_mode = ExtractionMode::WholeSpeech;
    let orch = Orchestrator::new(config, model.clone()).unwrap();

    let report = orch
        .run_batch(
            vec![ExtractionJob::new(eastoria_speech(1990), &["Eastoria"])],
            CancellationToken::new(),
        )
        .await;

    assert_eq!(model.call_count(), 2);
    assert_eq!(report.metrics.model_retries, 1);
    assert_eq!(report.metrics.attempts_ok, 1);
    assert_eq!(report.records[0].relationship_type(), Some(RelationshipType::ConflictAndSecurity));
}

#[tokio::test]
async fn test_refusal_is_not_retried_and_counts_as_absent() {
    let model = Arc::new(ScriptedModel::new().with_fallback(Scripted::Reply(
        "I'm sorry, but I cannot help with that request.".to_string(),
    )));
    let mut config = chunked_config();
    config.chunking.extraction_mode = ExtractionMode::WholeSpeech;
    let orch = Orchestrator::new(config, model.clone()).unwrap();

    let report = orch
        .run_batch(
            vec![ExtractionJob::new(eastoria_speech(1990), &["Eastoria"])],
            CancellationToken::new(),
        )
        .await;

    assert_eq!(model.call_count(), 1);
    assert_eq!(report.metrics.attempts_refused, 1);
    assert_eq!(report.metrics.attempts_rejected, 1);
    assert!(report.records[0].is_not_discussed());
}

#[tokio::test]
async fn test_out_of_domain_type_is_excluded() {
    let bogus = r#"{"country": "Eastoria", "relationship_type": "Interstellar Federation", "themes": ["space"], "centrality": "major", "sentiment": "hostile", "associations": []}"#;
    let model = Arc::new(
        ScriptedModel::new()
            .on(&["troops"], Scripted::Reply(bogus.to_string()))
            .on(
                &["river trade"],
                Scripted::Reply(payload_json(
                    "Eastoria",
                    RelationshipType::FunctionalCooperation,
                    Centrality::Passing,
                    Sentiment::Neutral,
                    &["trade route"],
                    &[],
                )),
            ),
    );
    let orch = Orchestrator::new(chunked_config(), model).unwrap();

    let report = orch
        .run_batch(
            vec![ExtractionJob::new(eastoria_speech(1990), &["Eastoria"])],
            CancellationToken::new(),
        )
        .await;

    assert_eq!(report.metrics.attempts_rejected, 1);
    let record = &report.records[0];
    assert_eq!(record.relationship_type(), Some(RelationshipType::FunctionalCooperation));
    assert_eq!(record.centrality(), Centrality::Passing);
    assert_eq!(record.themes(), ["trade route".to_string()]);
}

#[tokio::test]
async fn test_cancellation_keeps_completed_speeches() {
    let model = Arc::new(ScriptedModel::new().on(&["hangs"], Scripted::Hang));
    let orch = Orchestrator::new(chunked_config(), model).unwrap();

    let quick = Speech::new("Westmark", 1990, CHARTER);
    let stuck = Speech::new("Westmark", 1991, "This speech hangs forever.");
    let jobs = vec![
        ExtractionJob::new(quick, &["Eastoria"]),
        ExtractionJob::new(stuck, &["Eastoria"]),
    ];

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let report = orch.run_batch(jobs, cancel).await;

    assert!(report.cancelled);
    assert_eq!(report.records.len(), 1);
    assert_eq!(report.records[0].speech_id, "WESTMARK_1990");
    assert!(report.records[0].is_not_discussed());
}

#[tokio::test]
async fn test_batch_deadline_abandons_units() {
    let model = Arc::new(ScriptedModel::new().with_fallback(Scripted::Hang));
    let mut config = chunked_config();
    config.concurrency.batch_timeout_secs = Some(1);
    let orch = Orchestrator::new(config, model).unwrap();

    let report = orch
        .run_batch(
            vec![ExtractionJob::new(eastoria_speech(1990), &["Eastoria"])],
            CancellationToken::new(),
        )
        .await;

    assert!(report.cancelled);
    assert!(report.records.is_empty());
    assert!(report.verdicts.is_empty());
}

#[tokio::test]
async fn test_invalid_speech_is_skipped() {
    let orch = Orchestrator::new(chunked_config(), Arc::new(eastoria_model())).unwrap();

    let jobs = vec![
        ExtractionJob::new(Speech::new("Westmark", 1990, "   "), &["Eastoria"]),
        ExtractionJob::new(eastoria_speech(1991), &["Eastoria"]),
    ];
    let report = orch.run_batch(jobs, CancellationToken::new()).await;

    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].speech_id, "WESTMARK_1990");
    assert!(report.skipped[0].target.is_none());
    assert_eq!(report.metrics.speeches_skipped, 1);
    assert_eq!(report.records.len(), 1);
}

#[tokio::test]
async fn test_longitudinal_judgment() {
    let orch = Orchestrator::new(chunked_config(), Arc::new(eastoria_model())).unwrap();

    let jobs = vec![
        ExtractionJob::new(eastoria_speech(1990), &["Eastoria"]),
        ExtractionJob::new(Speech::new("Westmark", 1991, CHARTER), &["Eastoria"]),
        ExtractionJob::new(Speech::new("Westmark", 1992, CHARTER), &["Eastoria"]),
    ];
    let report = orch.run_batch(jobs, CancellationToken::new()).await;
    assert_eq!(report.records.len(), 3);

    let judgments = orch.judge_longitudinal(&report.records).await.unwrap();
    assert_eq!(judgments.len(), 1);
    assert_eq!(judgments[0].relationship_type, Verdict::InsufficientData);
    assert!(judgments[0].description.starts_with("Only 1 of 3"));

    let more = orch
        .run_batch(
            vec![ExtractionJob::new(eastoria_speech(1993), &["Eastoria"])],
            CancellationToken::new(),
        )
        .await;
    let mut records = report.records.clone();
    records.extend(more.records);

    let judgments = orch.judge_longitudinal(&records).await.unwrap();
    assert_eq!(
        judgments[0].relationship_type,
        Verdict::Relationship(RelationshipType::OppositionAndCriticism)
    );
    assert_eq!(judgments[0].provenance.len(), 2);
    assert!(judgments[0].description.contains("1990 and 1993"));
}

#[tokio::test]
async fn test_passes_are_reconciled_per_speech() {
    let mut config = chunked_config();
    config.chunking.extraction_mode = ExtractionMode::WholeSpeech;
    config.aggregation.passes_per_speech = 3;
    let model = Arc::new(ScriptedModel::new().on_sequence(
        &["troops"],
        vec![
            Scripted::Reply(payload_json(
                "Eastoria",
                RelationshipType::Passing,
                Centrality::Passing,
                Sentiment::Neutral,
                &[],
                &[],
            )),
            Scripted::Reply(payload_json(
                "Eastoria",
                RelationshipType::ConflictAndSecurity,
                Centrality::Major,
                Sentiment::Hostile,
                &["troops"],
                &[],
            )),
        ],
    ));
    let orch = Orchestrator::new(config, model.clone()).unwrap();

    let report = orch
        .run_batch(
            vec![ExtractionJob::new(eastoria_speech(1990), &["Eastoria"])],
            CancellationToken::new(),
        )
        .await;

    assert_eq!(model.call_count(), 3);
    assert_eq!(report.records.len(), 3);
    assert_eq!(report.verdicts.len(), 1);
    assert_eq!(
        report.verdicts[0].relationship_type,
        Verdict::Relationship(RelationshipType::ConflictAndSecurity)
    );
    assert_eq!(report.verdicts[0].provenance.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_model_calls_never_exceed_concurrency_limit() {
    let model = Arc::new(eastoria_model().with_latency(Duration::from_millis(30)));
    let mut config = AppConfig::default();
    config.chunking.extraction_mode = ExtractionMode::WholeSpeech;
    config.concurrency.max_concurrent_llm_calls = 2;
    let orch = Orchestrator::new(config, model.clone()).unwrap();

    let jobs = || {
        (1990..2010)
            .map(|year| ExtractionJob::new(eastoria_speech(year), &["Eastoria"]))
            .collect::<Vec<_>>()
    };

    let first = orch.run_batch(jobs(), CancellationToken::new()).await;

    assert_eq!(model.call_count(), 20);
    assert!(model.calls().iter().all(|prompt| prompt.contains("Eastoria")));
    assert_eq!(model.peak_in_flight(), 2);
    assert_eq!(first.records.len(), 20);
    assert_eq!(first.metrics.units_dispatched, 20);

    model.clear_calls();
    let second = orch.run_batch(jobs(), CancellationToken::new()).await;

    assert_eq!(model.call_count(), 20);
    assert!(model.peak_in_flight() <= 2);
    assert_eq!(second.metrics.units_dispatched, 20);
    assert_eq!(second.metrics.records_emitted, 20);
    assert_eq!(orch.metrics().snapshot().units_dispatched, 40);
}
