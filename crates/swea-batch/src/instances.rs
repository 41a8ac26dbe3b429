// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use anyhow::Context;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde_json::Value;
use tracing::debug;

use swea_config::{InstanceSourceKind, InstancesConfig};
use swea_core::{EvaluationHooks, Instance};
use swea_env::RepoSource;

/// Load, slice, and (optionally) shuffle the instance set for a batch run.
pub async fn load_instances(config: &InstancesConfig) -> anyhow::Result<Vec<Instance>> {
    let mut instances = match config.kind {
        InstanceSourceKind::SweBench => {
            let path = require_path(config)?;
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading instance file {path}"))?;
            parse_swe_bench_records(&text)?
        }
        InstanceSourceKind::File => {
            let path = require_path(config)?;
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading instance file {path}"))?;
            parse_instance_file(&text)?
        }
        InstanceSourceKind::ExpertFile => {
            let path = require_path(config)?;
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading instance file {path}"))?;
            let doc: Value = serde_json::from_str(&text)?;
            let records = doc["instances"]
                .as_array()
                .context("expert file has no instances array")?;
            records
                .iter()
                .map(instance_from_record)
                .collect::<anyhow::Result<Vec<_>>>()?
        }
        InstanceSourceKind::Huggingface => fetch_huggingface(config).await?,
    };

    if let Some(slice) = &config.slice {
        instances = apply_slice(instances, slice)?;
    }
    if config.shuffle {
        let mut rng = rand::rngs::StdRng::seed_from_u64(config.shuffle_seed);
        instances.shuffle(&mut rng);
    }
    debug!(count = instances.len(), "loaded instances");
    Ok(instances)
}

fn require_path(config: &InstancesConfig) -> anyhow::Result<&str> {
    config
        .path
        .as_deref()
        .context("instances.path is required for file-backed sources")
}

/// Generic file source: a JSON array of instance records, or JSON Lines with
/// one record per line.
fn parse_instance_file(text: &str) -> anyhow::Result<Vec<Instance>> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('[') {
        Ok(serde_json::from_str(text)?)
    } else {
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(Into::into))
            .collect()
    }
}

/// SWE-bench-style records: `instance_id`, `problem_statement`, `repo`
/// (owner/name), `base_commit`, optional `image_name`, and stringified
/// `FAIL_TO_PASS` / `PASS_TO_PASS` test lists.
fn parse_swe_bench_records(text: &str) -> anyhow::Result<Vec<Instance>> {
    let doc: Value = serde_json::from_str(text)?;
    let records = doc.as_array().context("expected a JSON array of records")?;
    records.iter().map(instance_from_record).collect()
}

fn instance_from_record(record: &Value) -> anyhow::Result<Instance> {
    let id = record["instance_id"]
        .as_str()
        .context("record missing instance_id")?
        .to_string();
    let problem_statement = record["problem_statement"]
        .as_str()
        .context("record missing problem_statement")?
        .to_string();
    let repo = match record["repo"].as_str() {
        Some(slug) => RepoSource::Remote {
            url: format!("https://github.com/{slug}.git"),
            commit: record["base_commit"].as_str().map(String::from),
        },
        None => RepoSource::None,
    };
    let image = record["image_name"]
        .as_str()
        .unwrap_or("python:3.11")
        .to_string();

    let evaluation = match (
        parse_test_list(&record["FAIL_TO_PASS"]),
        parse_test_list(&record["PASS_TO_PASS"]),
    ) {
        (None, None) => None,
        (fail, pass) => Some(EvaluationHooks {
            fail_to_pass: fail.unwrap_or_default(),
            pass_to_pass: pass.unwrap_or_default(),
        }),
    };

    Ok(Instance {
        id,
        problem_statement,
        extra_files: vec![],
        repo,
        image,
        setup: record["setup"].as_str().map(String::from),
        evaluation,
    })
}

/// Test lists arrive either as JSON arrays or as stringified JSON arrays.
fn parse_test_list(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
        ),
        Value::String(text) => serde_json::from_str::<Vec<String>>(text).ok(),
        _ => None,
    }
}

/// Page through the HuggingFace datasets server.
async fn fetch_huggingface(config: &InstancesConfig) -> anyhow::Result<Vec<Instance>> {
    let dataset = require_path(config)?;
    let subset = config.subset.as_deref().unwrap_or("default");
    let split = config.split.as_deref().unwrap_or("test");
    let client = reqwest::Client::new();
    let mut instances = Vec::new();
    let mut offset = 0usize;
    const PAGE: usize = 100;

    loop {
        let url = format!(
            "https://datasets-server.huggingface.co/rows?dataset={dataset}&config={subset}&split={split}&offset={offset}&length={PAGE}"
        );
        debug!(%url, "fetching instance page");
        let doc: Value = client
            .get(&url)
            .send()
            .await
            .context("querying datasets server")?
            .error_for_status()
            .context("datasets server rejected the request")?
            .json()
            .await?;
        let rows = doc["rows"].as_array().context("no rows in response")?;
        if rows.is_empty() {
            break;
        }
        for row in rows {
            instances.push(instance_from_record(&row["row"])?);
        }
        offset += rows.len();
        let total = doc["num_rows_total"].as_u64().unwrap_or(0) as usize;
        if offset >= total {
            break;
        }
    }
    Ok(instances)
}

/// Python-style `start:end` slice (either side optional).
fn apply_slice(instances: Vec<Instance>, slice: &str) -> anyhow::Result<Vec<Instance>> {
    let (start, end) = slice
        .split_once(':')
        .with_context(|| format!("invalid slice {slice:?}, expected start:end"))?;
    let start: usize = if start.is_empty() { 0 } else { start.parse()? };
    let end: usize = if end.is_empty() {
        instances.len()
    } else {
        end.parse()?
    };
    let end = end.min(instances.len());
    let start = start.min(end);
    Ok(instances[start..end].to_vec())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn swe_bench_json() -> &'static str {
        r#"[
            {
                "instance_id": "django__django-1",
                "problem_statement": "fix the ORM",
                "repo": "django/django",
                "base_commit": "abc123",
                "FAIL_TO_PASS": "[\"test_orm\"]",
                "PASS_TO_PASS": ["test_other"]
            },
            {
                "instance_id": "flask__flask-2",
                "problem_statement": "fix routing",
                "repo": "pallets/flask",
                "base_commit": "def456",
                "image_name": "swe-bench/flask:latest"
            }
        ]"#
    }

    #[test]
    fn swe_bench_records_map_to_instances() {
        let instances = parse_swe_bench_records(swe_bench_json()).unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].id, "django__django-1");
        match &instances[0].repo {
            RepoSource::Remote { url, commit } => {
                assert_eq!(url, "https://github.com/django/django.git");
                assert_eq!(commit.as_deref(), Some("abc123"));
            }
            other => panic!("wrong repo source: {other:?}"),
        }
        assert_eq!(instances[1].image, "swe-bench/flask:latest");
    }

    #[test]
    fn stringified_and_plain_test_lists_both_parse() {
        let instances = parse_swe_bench_records(swe_bench_json()).unwrap();
        let hooks = instances[0].evaluation.as_ref().unwrap();
        assert_eq!(hooks.fail_to_pass, vec!["test_orm"]);
        assert_eq!(hooks.pass_to_pass, vec!["test_other"]);
        assert!(instances[1].evaluation.is_none());
    }

    #[test]
    fn record_without_id_is_an_error() {
        let err = parse_swe_bench_records(r#"[{"problem_statement": "x"}]"#).unwrap_err();
        assert!(err.to_string().contains("instance_id"));
    }

    #[test]
    fn instance_file_accepts_json_array_and_jsonl() {
        let record = serde_json::json!({
            "id": "a",
            "problem_statement": "p",
            "repo": {"kind": "none"},
            "image": "python:3.11"
        });
        let array = format!("[{record}]");
        let jsonl = format!("{record}\n{record}\n");
        assert_eq!(parse_instance_file(&array).unwrap().len(), 1);
        assert_eq!(parse_instance_file(&jsonl).unwrap().len(), 2);
    }

    fn dummy_instances(n: usize) -> Vec<Instance> {
        (0..n)
            .map(|i| Instance {
                id: format!("i-{i}"),
                problem_statement: "p".into(),
                extra_files: vec![],
                repo: RepoSource::None,
                image: "x".into(),
                setup: None,
                evaluation: None,
            })
            .collect()
    }

    #[test]
    fn slice_selects_half_open_range() {
        let out = apply_slice(dummy_instances(10), "2:5").unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].id, "i-2");
    }

    #[test]
    fn slice_sides_are_optional() {
        assert_eq!(apply_slice(dummy_instances(10), ":3").unwrap().len(), 3);
        assert_eq!(apply_slice(dummy_instances(10), "7:").unwrap().len(), 3);
        assert_eq!(apply_slice(dummy_instances(10), ":").unwrap().len(), 10);
    }

    #[test]
    fn slice_clamps_out_of_range() {
        assert_eq!(apply_slice(dummy_instances(3), "0:99").unwrap().len(), 3);
        assert!(apply_slice(dummy_instances(3), "nonsense").is_err());
    }

    #[tokio::test]
    async fn shuffle_with_fixed_seed_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instances.json");
        let records: Vec<_> = (0..20)
            .map(|i| {
                serde_json::json!({
                    "instance_id": format!("i-{i}"),
                    "problem_statement": "p",
                    "repo": "o/r"
                })
            })
            .collect();
        std::fs::write(&path, serde_json::to_string(&records).unwrap()).unwrap();
        let config = InstancesConfig {
            kind: InstanceSourceKind::SweBench,
            path: Some(path.to_string_lossy().into_owned()),
            shuffle: true,
            shuffle_seed: 7,
            ..Default::default()
        };
        let a = load_instances(&config).await.unwrap();
        let b = load_instances(&config).await.unwrap();
        let ids = |v: &[Instance]| v.iter().map(|i| i.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&a), ids(&b));
        assert_ne!(ids(&a), ids(&dummy_instances(20)), "seeded shuffle must permute");
    }
}
