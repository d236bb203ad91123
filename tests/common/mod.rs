//! Shared helpers for integration tests

#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use segvec::vector::{DenseVectorField, DenseVectorParams, VectorDimension};
use segvec::Settings;
use tempfile::TempDir;

/// Settings rooted in a temp dir, quantizing from `min_docs` documents.
pub fn test_settings(dir: &TempDir, min_docs: u32) -> Settings {
    let mut settings = Settings::default();
    settings.index_path = dir.path().join("index");
    settings.quantization.min_docs = min_docs;
    settings.search.parallel_threads = 2;
    settings.points.max_points_per_leaf = 16;
    settings
}

pub fn dense_field(name: &str, dims: usize, seed: u64) -> DenseVectorField {
    let params = DenseVectorParams::new(VectorDimension::new(dims).unwrap()).with_seed(seed);
    DenseVectorField::new(name, params).unwrap()
}

pub fn random_vectors(count: usize, dims: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| (0..dims).map(|_| rng.random_range(-1.0..1.0)).collect())
        .collect()
}
