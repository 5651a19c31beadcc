//! Corpus compilation over state produced by a real pipeline run.

mod common;

use common::{default_response, rubric_answer, var, Harness, ScriptedInvoker};
use paper_cot_forge::export::{CorpusCompiler, CorpusFormat, CorpusSettings, DedupScope};
use paper_cot_forge::pipeline::{OrderBy, PipelineConfig};
use paper_cot_forge::scoring::Rubric;

/// One document whose three CoT sets finish with the given quality scores.
async fn finished_sets(quality: [usize; 3]) -> Harness {
    let invoker = ScriptedInvoker::new(move |template, vars| {
        if template == "cot_quality_assessment" {
            let question = var(vars, "question");
            let index = (0..3)
                .find(|i| question == format!("Question {}?", i))
                .unwrap_or(0);
            return Ok(rubric_answer(&Rubric::quality(), quality[index]));
        }
        Ok(default_response(template, vars, 3))
    });
    let harness =
        Harness::with_config(invoker, PipelineConfig::default().with_min_quality(2)).await;
    harness.ingest_tagged(&[("paper-1.txt", "cs.CL")]).await;

    let report = harness
        .orchestrator()
        .run_pipeline(OrderBy::Identity, 10)
        .await
        .unwrap();
    assert_eq!(report.cot_sets_completed, 3);
    harness
}

fn compiler(harness: &Harness, settings: CorpusSettings) -> CorpusCompiler {
    CorpusCompiler::new(harness.store.clone(), harness.artifacts.clone(), settings)
}

fn lines(path: &std::path::Path) -> Vec<serde_json::Value> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test]
async fn test_dedup_keeps_highest_scoring_set() {
    let harness = finished_sets([3, 4, 2]).await;
    let output = harness.dir.path().join("corpus.jsonl");

    let report = compiler(&harness, CorpusSettings::default())
        .compile(2, 3, &output)
        .await
        .unwrap();
    assert_eq!(report.candidates, 3);
    assert_eq!(report.written, 1);
    assert_eq!(report.deduplicated, 2);
    assert_eq!(report.excluded, 2);

    let records = lines(&output);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["question"], "Question 1?");
    assert_eq!(records[0]["answer"], "Answer 1");
    assert!(records[0]["reasoning"]
        .as_str()
        .unwrap()
        .starts_with("I think: Step A1."));
    assert_eq!(records[0]["provenance"]["quality_score"], 4);
    assert_eq!(records[0]["provenance"]["primary_category"], "cs.CL");
    assert_eq!(records[0]["provenance"]["locator"], "paper-1.txt");
}

#[tokio::test]
async fn test_dedup_tie_goes_to_earliest_set() {
    let harness = finished_sets([4, 4, 4]).await;
    let output = harness.dir.path().join("corpus.jsonl");

    compiler(&harness, CorpusSettings::default())
        .compile(4, 3, &output)
        .await
        .unwrap();
    let records = lines(&output);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["provenance"]["cot_set_id"], 1);
}

#[tokio::test]
async fn test_threshold_boundary() {
    let harness = finished_sets([3, 4, 2]).await;
    let settings = CorpusSettings::default().with_max_per_group(3);
    let output = harness.dir.path().join("corpus.jsonl");

    let at_min = compiler(&harness, settings.clone())
        .compile(4, 3, &output)
        .await
        .unwrap();
    assert_eq!(at_min.written, 1);
    assert_eq!(at_min.below_threshold, 2);

    let above = compiler(&harness, settings.clone())
        .compile(5, 3, &output)
        .await
        .unwrap();
    assert_eq!(above.written, 0);
    assert_eq!(above.below_threshold, 3);

    let voice_above = compiler(&harness, settings)
        .compile(0, 4, &output)
        .await
        .unwrap();
    assert_eq!(voice_above.written, 0);
    assert!(std::fs::read_to_string(&output).unwrap().is_empty());
}

#[tokio::test]
async fn test_compile_is_byte_identical_and_read_only() {
    let harness = finished_sets([3, 4, 2]).await;
    let settings = CorpusSettings::default().with_max_per_group(3);
    let first = harness.dir.path().join("first.jsonl");
    let second = harness.dir.path().join("second.jsonl");

    let before = harness.store.status_counts().await.unwrap();
    compiler(&harness, settings.clone())
        .compile(2, 3, &first)
        .await
        .unwrap();
    compiler(&harness, settings).compile(2, 3, &second).await.unwrap();
    let after = harness.store.status_counts().await.unwrap();

    assert_eq!(
        std::fs::read(&first).unwrap(),
        std::fs::read(&second).unwrap()
    );
    assert_eq!(
        std::fs::read(first.with_extension("yaml")).unwrap(),
        std::fs::read(second.with_extension("yaml")).unwrap()
    );
    assert_eq!(before, after);

    let ids: Vec<i64> = lines(&first)
        .iter()
        .map(|r| r["provenance"]["cot_set_id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_unreadable_artifacts_are_excluded() {
    let harness = finished_sets([4, 4, 4]).await;
    let set = harness.store.get_cot_set(2).await.unwrap().unwrap();
    let voicing = harness
        .artifacts
        .root()
        .join(set.voicing_artifact.unwrap());
    std::fs::remove_file(voicing).unwrap();

    let output = harness.dir.path().join("corpus.jsonl");
    let report = compiler(&harness, CorpusSettings::default().with_max_per_group(3))
        .compile(4, 3, &output)
        .await
        .unwrap();
    assert_eq!(report.unreadable, 1);
    assert_eq!(report.written, 2);
    assert_eq!(report.excluded, 1);
}

#[tokio::test]
async fn test_chat_format_with_validation_split() {
    let harness = finished_sets([4, 4, 4]).await;
    let settings = CorpusSettings::default()
        .with_max_per_group(3)
        .with_format(CorpusFormat::Chat)
        .with_dedup_scope(DedupScope::Category)
        .with_validation_fraction(0.5);
    let output = harness.dir.path().join("chat.jsonl");

    let report = compiler(&harness, settings)
        .compile(4, 3, &output)
        .await
        .unwrap();
    assert_eq!(report.written + report.validation, 3);
    let validation_path = report.validation_output.clone().unwrap();
    assert_eq!(validation_path, harness.dir.path().join("chat.validation.jsonl"));

    let mut all = lines(&output);
    all.extend(lines(&validation_path));
    assert_eq!(all.len(), 3);
    for record in &all {
        let messages = record["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
        let reply = messages[2]["content"].as_str().unwrap();
        assert!(reply.starts_with("I think: "));
        assert!(reply.contains("\n\nAnswer: Answer "));
    }
}
