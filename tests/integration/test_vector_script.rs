//! `vector_script` scoring against a flushed segment.

use crate::common::{dense_field, test_settings};
use segvec::vector::codec::{dot_product, l2_norm};
use segvec::vector::{Metric, VectorIndex, VectorScript};
use serde_json::json;
use tantivy::query::Scorer;
use tantivy::{DocSet, TERMINATED};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[test]
fn test_script_scores_every_document() {
    let dir = TempDir::new().unwrap();
    let index = VectorIndex::open(&test_settings(&dir, 1_000_000)).unwrap();
    let docs = [
        vec![1.0, 0.0, 0.0],
        vec![0.0, 2.0, 0.0],
        vec![-1.0, 0.0, 0.0],
        vec![1.0, 1.0, 1.0],
    ];
    let mut writer = index.writer(vec![dense_field("vector", 3, 1)]).unwrap();
    for v in &docs {
        writer.add_document(&[("vector", v.as_slice())]).unwrap();
    }
    // Document without a value is skipped by the scorer
    writer.add_document(&[]).unwrap();
    index.commit(writer, &CancellationToken::new()).unwrap();
    let segment = &index.segments()[0];

    let query = [0.5, 0.5, 0.0];
    let script = VectorScript::compile(
        "score",
        &json!({"field": "vector", "query_vector": query}),
    )
    .unwrap();
    assert_eq!(script.metric(), Metric::Cosine);

    let mut scorer = script.scorer(segment).unwrap();
    let mut scored = Vec::new();
    while scorer.doc() != TERMINATED {
        scored.push((scorer.doc(), scorer.score()));
        scorer.advance();
    }
    assert_eq!(scored.len(), docs.len());

    for (doc, score) in scored {
        let v = &docs[doc as usize];
        let expected = dot_product(&query, v) / (l2_norm(&query) * l2_norm(v)) + 1.0;
        assert!((score - expected).abs() < 1e-5, "doc {doc}: {score} vs {expected}");
    }
}

#[test]
fn test_script_l2_and_errors() {
    let dir = TempDir::new().unwrap();
    let index = VectorIndex::open(&test_settings(&dir, 1_000_000)).unwrap();
    let mut writer = index.writer(vec![dense_field("vector", 2, 1)]).unwrap();
    writer.add_document(&[("vector", &[3.0, 4.0])]).unwrap();
    index.commit(writer, &CancellationToken::new()).unwrap();
    let segment = &index.segments()[0];

    let script =
        VectorScript::parse(r#"{"field": "vector", "query_vector": [0, 0], "metric": "L2"}"#)
            .unwrap();
    let mut scorer = script.scorer(segment).unwrap();
    assert!((scorer.score() - 1.0 / 6.0).abs() < 1e-6);

    let unknown_field =
        VectorScript::parse(r#"{"field": "other", "query_vector": [0, 0]}"#).unwrap();
    assert!(unknown_field.scorer(segment).is_err());

    let wrong_dims = VectorScript::parse(r#"{"field": "vector", "query_vector": [1]}"#).unwrap();
    assert!(wrong_dims.scorer(segment).unwrap_err().is_invalid_input());

    let zero_cosine = VectorScript::parse(r#"{"field": "vector", "query_vector": [0, 0]}"#).unwrap();
    assert!(zero_cosine.scorer(segment).is_err());
}
