//! Flush, reopen, quantize, delete and merge through the public API.

use crate::common::{dense_field, random_vectors, test_settings};
use segvec::vector::codec::{decode_magnitude, l2_norm, squared_l2_distance};
use segvec::vector::{
    CentroidId, DenseVectorField, DenseVectorParams, Metric, SegmentVectorReader, VectorDimension,
    VectorIndex,
};
use std::fs;
use tantivy::DocSet;
use tantivy::query::Scorer;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[test]
fn test_flush_reopen_round_trip() {
    let dir = TempDir::new().unwrap();
    let settings = test_settings(&dir, 1_000_000);
    let vectors = random_vectors(50, 12, 1);

    let index = VectorIndex::open(&settings).unwrap();
    let mut writer = index.writer(vec![dense_field("embedding", 12, 9)]).unwrap();
    for v in &vectors {
        writer.add_document(&[("embedding", v.as_slice())]).unwrap();
    }
    let segment = index.commit(writer, &CancellationToken::new()).unwrap();
    drop(index);

    let reader = SegmentVectorReader::open(&settings.index_path, segment).unwrap();
    let field = reader.field("embedding").unwrap();
    assert!(field.quantized().is_none(), "below threshold, raw store only");
    for (doc, v) in vectors.iter().enumerate() {
        assert_eq!(field.raw().vector(doc as u32).unwrap().as_ref(), Some(v));
    }
    // The persisted seed reproduces the projection of every point
    for (i, tree) in field.trees().iter().enumerate() {
        for (doc, point) in tree.iter() {
            let expected = field.field().projector().project(&vectors[doc as usize]).unwrap();
            assert_eq!(*point, expected[i]);
        }
    }
}

#[test]
fn test_quantized_store_above_threshold() {
    let dir = TempDir::new().unwrap();
    let settings = test_settings(&dir, 64);
    let vectors = random_vectors(100, 6, 2);

    let index = VectorIndex::open(&settings).unwrap();
    let mut writer = index.writer(vec![dense_field("embedding", 6, 4)]).unwrap();
    for v in &vectors {
        writer.add_document(&[("embedding", v.as_slice())]).unwrap();
    }
    index.commit(writer, &CancellationToken::new()).unwrap();

    let segments = index.segments();
    let field = segments[0].field("embedding").unwrap();
    let quantized = field.quantized().expect("quantized store written");
    assert_eq!(quantized.centroid_count(), 10);
    assert_eq!(quantized.len(), 100);

    let centroids: Vec<Vec<f32>> = (0..quantized.centroid_count() as u32)
        .map(|i| quantized.centroid(CentroidId::new(i)).unwrap().unwrap())
        .collect();
    for (i, centroid) in centroids.iter().enumerate() {
        let record = quantized.centroid_record(CentroidId::new(i as u32)).unwrap();
        assert!((decode_magnitude(record).unwrap() - l2_norm(centroid)).abs() < 1e-5);
    }

    // Every document maps to its nearest final centroid
    for (doc, v) in vectors.iter().enumerate() {
        let assigned = quantized.assignment(doc as u32).unwrap();
        let assigned_distance = squared_l2_distance(v, &centroids[assigned.index()]);
        for centroid in &centroids {
            assert!(assigned_distance <= squared_l2_distance(v, centroid) + 1e-9);
        }
    }

    // Scoring over the quantized store uses the centroid values
    let mut scorer = segments[0]
        .similarity_scorer("embedding", Metric::L2, &vectors[0], true)
        .unwrap();
    assert_eq!(scorer.doc(), 0);
    let centroid = &centroids[quantized.assignment(0).unwrap().index()];
    let expected = 1.0 / (1.0 + squared_l2_distance(&vectors[0], centroid).sqrt() as f32);
    assert!((scorer.score() - expected).abs() < 1e-4);
}

#[test]
fn test_delete_then_merge() {
    let dir = TempDir::new().unwrap();
    let settings = test_settings(&dir, 1_000_000);
    let vectors = random_vectors(30, 4, 3);

    let index = VectorIndex::open(&settings).unwrap();
    let mut segments = Vec::new();
    for chunk in vectors.chunks(10) {
        let mut writer = index.writer(vec![dense_field("embedding", 4, 5)]).unwrap();
        for v in chunk {
            writer.add_document(&[("embedding", v.as_slice())]).unwrap();
        }
        segments.push(index.commit(writer, &CancellationToken::new()).unwrap());
    }
    assert_eq!(index.num_docs(), 30);

    index.delete(segments[0], &[0, 9]).unwrap();
    index.delete(segments[2], &[5]).unwrap();
    assert_eq!(index.num_docs(), 27);

    let merged = index.merge_all(&CancellationToken::new()).unwrap().unwrap();
    let readers = index.segments();
    assert_eq!(readers.len(), 1);
    assert_eq!(readers[0].segment(), merged);
    assert_eq!(readers[0].max_doc(), 27);
    assert!(!readers[0].live_docs().has_deletions());

    // Survivors keep their order, renumbered densely
    let survivors: Vec<&Vec<f32>> = vectors
        .iter()
        .enumerate()
        .filter(|(i, _)| ![0, 9, 25].contains(i))
        .map(|(_, v)| v)
        .collect();
    let raw = readers[0].field("embedding").unwrap().raw();
    for (doc, v) in survivors.iter().enumerate() {
        assert_eq!(raw.vector(doc as u32).unwrap().as_ref(), Some(*v));
    }

    // Only the merged segment remains on disk
    let metas = fs::read_dir(&settings.index_path)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            name.starts_with("segment_") && name.ends_with(".meta.json")
        })
        .count();
    assert_eq!(metas, 1);
}

#[test]
fn test_corrupt_raw_store_detected() {
    let dir = TempDir::new().unwrap();
    let settings = test_settings(&dir, 1_000_000);

    let index = VectorIndex::open(&settings).unwrap();
    let mut writer = index.writer(vec![dense_field("embedding", 4, 5)]).unwrap();
    writer.add_document(&[("embedding", &[1.0, 2.0, 3.0, 4.0])]).unwrap();
    let segment = index.commit(writer, &CancellationToken::new()).unwrap();
    drop(index);

    let raw_path = settings
        .index_path
        .join(format!("segment_{segment}.embedding.vec"));
    let mut bytes = fs::read(&raw_path).unwrap();
    bytes.truncate(bytes.len() - 3);
    fs::write(&raw_path, bytes).unwrap();

    let err = match VectorIndex::open(&settings) {
        Ok(_) => panic!("truncated raw store must not open"),
        Err(err) => err,
    };
    assert_eq!(err.status_code(), "CORRUPT_SEGMENT");
    assert!(!err.recovery_suggestions().is_empty());
}

#[test]
fn test_merge_after_reopen_with_default_params() {
    let dir = TempDir::new().unwrap();
    let settings = test_settings(&dir, 1_000_000);
    let vectors = random_vectors(40, 8, 6);
    let default_field = || {
        let params = DenseVectorParams::new(VectorDimension::new(8).unwrap());
        DenseVectorField::new("embedding", params).unwrap()
    };

    let index = VectorIndex::open(&settings).unwrap();
    let mut writer = index.writer(vec![default_field()]).unwrap();
    for v in &vectors[..20] {
        writer.add_document(&[("embedding", v.as_slice())]).unwrap();
    }
    index.commit(writer, &CancellationToken::new()).unwrap();
    drop(index);

    let index = VectorIndex::open(&settings).unwrap();
    let mut writer = index.writer(vec![default_field()]).unwrap();
    for v in &vectors[20..] {
        writer.add_document(&[("embedding", v.as_slice())]).unwrap();
    }
    index.commit(writer, &CancellationToken::new()).unwrap();
    assert_eq!(index.segments().len(), 2);

    let merged = index.merge_all(&CancellationToken::new()).unwrap().unwrap();
    assert_eq!(index.segments().len(), 1);
    assert_eq!(index.num_docs(), 40);

    for (i, v) in vectors.iter().enumerate().step_by(7) {
        let hits = index
            .search("embedding", v, Metric::L2, 3, &CancellationToken::new())
            .unwrap();
        assert_eq!(hits[0].segment, merged);
        assert_eq!(hits[0].doc as usize, i);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }
}
