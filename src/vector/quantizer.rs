//! K-means vector quantization run at flush and merge time.
//!
//! Large segments get a quantized sidecar store in which every document
//! points at one of `floor(sqrt(maxDoc))` centroids. Scoring over the
//! sidecar trades exactness for a much smaller working set.
//!
//! # Algorithm Details
//! - Seeding: reservoir sampling over the raw store with a seeded RNG
//! - Distance: Euclidean, ties go to the lowest centroid index
//! - Update: each centroid becomes the mean of its assigned vectors; a
//!   centroid without assignments keeps its previous position
//! - Finalization: assignments are recomputed against the final centroids
//!
//! # Performance Characteristics
//! - O(n * k * d * iterations) time complexity
//! - O(k * d) space for centroids, vectors are streamed from the store

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::QuantizationConfig;
use crate::error::{SegmentError, SegmentResult};
use crate::vector::codec::{encode_record, squared_l2_distance};
use crate::vector::storage::RawVectorStore;
use crate::vector::types::{CentroidId, DocId, VectorEncoding, VectorError};

/// Per-iteration quality statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationStats {
    /// 1-based iteration number
    pub iteration: usize,
    /// Documents scanned
    pub docs: usize,
    /// Mean distance from a document to its nearest centroid
    pub mean_distance_to_best: f64,
    /// Mean distance from a document to every other centroid
    pub mean_distance_to_others: f64,
    /// Centroids that received no documents and kept their position
    pub empty_clusters: usize,
}

/// Progress callbacks of a quantization pass.
pub trait QuantizationObserver: Send + Sync {
    fn on_start(&self, _field: &str, _centroids: usize, _max_doc: DocId) {}

    fn on_iteration(&self, _field: &str, _stats: &IterationStats) {}

    fn on_finish(&self, _field: &str, _result: &QuantizedVectors) {}
}

/// Reports progress through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl QuantizationObserver for TracingObserver {
    fn on_start(&self, field: &str, centroids: usize, max_doc: DocId) {
        info!(field, centroids, max_doc, "Running k-means");
    }

    fn on_iteration(&self, field: &str, stats: &IterationStats) {
        info!(
            field,
            iteration = stats.iteration,
            dist_to_centroid = stats.mean_distance_to_best,
            dist_to_other_centroids = stats.mean_distance_to_others,
            "Finished k-means iteration"
        );
        if stats.empty_clusters > 0 {
            debug!(
                field,
                empty = stats.empty_clusters,
                "Empty clusters kept their previous centroid"
            );
        }
    }

    fn on_finish(&self, field: &str, result: &QuantizedVectors) {
        info!(
            field,
            centroids = result.centroids.len(),
            docs = result.assignments.len(),
            "Finished k-means"
        );
    }
}

/// Outcome of a quantization pass.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedVectors {
    /// Final centroids
    pub centroids: Vec<Vec<f32>>,
    /// Nearest final centroid of every document, ascending by doc id
    pub assignments: Vec<(DocId, CentroidId)>,
    /// Per-iteration statistics
    pub iterations: Vec<IterationStats>,
}

impl QuantizedVectors {
    /// Centroid records as written to the quantized store.
    #[must_use]
    pub fn centroid_records(&self) -> Vec<Vec<u8>> {
        self.centroids
            .iter()
            .map(|centroid| encode_record(centroid, VectorEncoding::Float32))
            .collect()
    }
}

/// Number of centroids used for a segment of `max_doc` documents.
#[must_use]
pub fn centroid_count(max_doc: DocId) -> usize {
    ((f64::from(max_doc)).sqrt().floor() as usize).max(1)
}

/// Runs k-means over a raw store.
#[derive(Clone)]
pub struct VectorQuantizer {
    config: QuantizationConfig,
    observer: Arc<dyn QuantizationObserver>,
}

impl std::fmt::Debug for VectorQuantizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorQuantizer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl VectorQuantizer {
    #[must_use]
    pub fn new(config: QuantizationConfig) -> Self {
        Self {
            config,
            observer: Arc::new(TracingObserver),
        }
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn QuantizationObserver>) -> Self {
        self.observer = observer;
        self
    }

    #[must_use]
    pub fn config(&self) -> &QuantizationConfig {
        &self.config
    }

    /// Whether a segment of `max_doc` documents gets a quantized store.
    #[must_use]
    pub fn should_quantize(&self, max_doc: DocId) -> bool {
        self.config.enabled && max_doc >= self.config.min_docs
    }

    /// Quantizes `store` if the segment is large enough.
    ///
    /// Returns `None` when quantization is skipped or the store is empty.
    pub fn quantize(
        &self,
        field: &str,
        store: &RawVectorStore,
        max_doc: DocId,
        cancel: &CancellationToken,
    ) -> SegmentResult<Option<QuantizedVectors>> {
        if !self.should_quantize(max_doc) || store.is_empty() {
            debug!(field, max_doc, "Skipping quantization");
            return Ok(None);
        }

        let centroids = self.seed_centroids(store, centroid_count(max_doc), cancel)?;
        self.observer.on_start(field, centroids.len(), max_doc);
        self.run(field, store, centroids, cancel).map(Some)
    }

    /// Runs the configured iterations from explicit initial centroids.
    pub fn quantize_from(
        &self,
        field: &str,
        store: &RawVectorStore,
        initial: Vec<Vec<f32>>,
        cancel: &CancellationToken,
    ) -> SegmentResult<QuantizedVectors> {
        if initial.is_empty() {
            return Err(VectorError::InvalidParameter {
                name: "centroids".to_string(),
                reason: "at least one initial centroid is required".to_string(),
            }
            .into());
        }
        let dims = store.dimension();
        for centroid in &initial {
            dims.validate_vector(centroid)?;
        }
        self.observer.on_start(field, initial.len(), store.len() as DocId);
        self.run(field, store, initial, cancel)
    }

    /// Reservoir sampling: the first `k` vectors seed the centroids, the
    /// i-th after that replaces a random one with probability `k / i`.
    fn seed_centroids(
        &self,
        store: &RawVectorStore,
        k: usize,
        cancel: &CancellationToken,
    ) -> SegmentResult<Vec<Vec<f32>>> {
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut centroids: Vec<Vec<f32>> = Vec::with_capacity(k);

        for (i, (doc, record)) in store.iter().enumerate() {
            check_cancelled(cancel)?;
            if i < k {
                centroids.push(store.decode(doc, record)?);
            } else if rng.random::<f64>() < k as f64 / i as f64 {
                let slot = rng.random_range(0..k);
                centroids[slot] = store.decode(doc, record)?;
            }
        }
        // Sparse fields may hold fewer vectors than centroids.
        Ok(centroids)
    }

    fn run(
        &self,
        field: &str,
        store: &RawVectorStore,
        mut centroids: Vec<Vec<f32>>,
        cancel: &CancellationToken,
    ) -> SegmentResult<QuantizedVectors> {
        let mut iterations = Vec::with_capacity(self.config.iterations);
        for iteration in 1..=self.config.iterations {
            let (updated, stats) = run_iteration(iteration, store, &centroids, cancel)?;
            self.observer.on_iteration(field, &stats);
            iterations.push(stats);
            centroids = updated;
        }

        let assignments = assign_all(store, &centroids, cancel)?;
        let result = QuantizedVectors {
            centroids,
            assignments,
            iterations,
        };
        self.observer.on_finish(field, &result);
        Ok(result)
    }
}

fn check_cancelled(cancel: &CancellationToken) -> SegmentResult<()> {
    if cancel.is_cancelled() {
        return Err(SegmentError::Cancelled {
            operation: "vector quantization",
        });
    }
    Ok(())
}

/// Nearest centroid and the distance to every centroid.
fn nearest_centroid(vector: &[f32], centroids: &[Vec<f32>]) -> (usize, f64, f64) {
    let mut best = 0;
    let mut best_distance = f64::MAX;
    let mut total = 0.0;
    for (c, centroid) in centroids.iter().enumerate() {
        let distance = squared_l2_distance(centroid, vector).sqrt();
        total += distance;
        if distance < best_distance {
            best = c;
            best_distance = distance;
        }
    }
    (best, best_distance, total)
}

fn run_iteration(
    iteration: usize,
    store: &RawVectorStore,
    centroids: &[Vec<f32>],
    cancel: &CancellationToken,
) -> SegmentResult<(Vec<Vec<f32>>, IterationStats)> {
    let dims = store.dimension().get();
    let mut sums = vec![vec![0.0f64; dims]; centroids.len()];
    let mut counts = vec![0usize; centroids.len()];
    let mut to_best = 0.0;
    let mut to_others = 0.0;
    let mut docs = 0usize;

    for (doc, record) in store.iter() {
        check_cancelled(cancel)?;
        let vector = store.decode(doc, record)?;
        let (best, best_distance, total) = nearest_centroid(&vector, centroids);

        counts[best] += 1;
        for (sum, &value) in sums[best].iter_mut().zip(&vector) {
            *sum += f64::from(value);
        }
        to_best += best_distance;
        to_others += total - best_distance;
        docs += 1;
    }

    let mut empty_clusters = 0;
    let updated = centroids
        .iter()
        .zip(sums.iter().zip(&counts))
        .map(|(previous, (sum, &count))| {
            if count == 0 {
                empty_clusters += 1;
                previous.clone()
            } else {
                sum.iter().map(|&s| (s / count as f64) as f32).collect()
            }
        })
        .collect();

    let others = docs * centroids.len().saturating_sub(1);
    let stats = IterationStats {
        iteration,
        docs,
        mean_distance_to_best: if docs > 0 { to_best / docs as f64 } else { 0.0 },
        mean_distance_to_others: if others > 0 {
            to_others / others as f64
        } else {
            0.0
        },
        empty_clusters,
    };
    Ok((updated, stats))
}

fn assign_all(
    store: &RawVectorStore,
    centroids: &[Vec<f32>],
    cancel: &CancellationToken,
) -> SegmentResult<Vec<(DocId, CentroidId)>> {
    let mut assignments = Vec::with_capacity(store.len());
    for (doc, record) in store.iter() {
        check_cancelled(cancel)?;
        let vector = store.decode(doc, record)?;
        let (best, _, _) = nearest_centroid(&vector, centroids);
        assignments.push((doc, CentroidId::new(best as u32)));
    }
    Ok(assignments)
}
