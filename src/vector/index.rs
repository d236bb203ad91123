//! Multi-segment vector index.
//!
//! Holds the sealed segments of one directory. Searches take a snapshot of
//! the segment list and fan out over a dedicated rayon pool; commits,
//! deletions and merges swap segments in under a write lock.
//!
//! Field definitions belong to the index, not to a segment. The first
//! writer that names a field fixes its definition, seed included, in
//! `index.meta.json`; later writers get that definition back, so every
//! segment projects a field with the same bases. Fields may be added over
//! time, which leaves older segments without them.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tantivy::Score;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{SegmentError, SegmentResult};
use crate::vector::field::{DenseVectorField, DenseVectorParams};
use crate::vector::scoring::Metric;
use crate::vector::segment::{
    FieldMeta, SegmentFiles, SegmentVectorReader, SegmentVectorWriter, StagedFiles, VectorFormat,
    merge,
};
use crate::vector::types::{DocId, SegmentOrdinal, VectorError};

/// A hit of a multi-segment search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexHit {
    pub segment: SegmentOrdinal,
    pub doc: DocId,
    pub score: Score,
}

const INDEX_META_FILE: &str = "index.meta.json";
const INDEX_META_VERSION: u32 = 1;

/// Contents of `index.meta.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub version: u32,
    pub fields: Vec<FieldMeta>,
}

impl IndexMeta {
    fn new(fields: &[DenseVectorField]) -> Self {
        Self {
            version: INDEX_META_VERSION,
            fields: fields
                .iter()
                .map(|field| FieldMeta {
                    name: field.name().to_string(),
                    params: field.params().clone(),
                })
                .collect(),
        }
    }

    /// Writes the file through a temporary name.
    pub fn save(&self, path: &Path) -> SegmentResult<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| SegmentError::Config {
            reason: format!("Failed to serialize index meta: {e}"),
        })?;
        let mut staged = StagedFiles::default();
        let tmp = staged.stage(path.to_path_buf());
        match fs::write(&tmp, json) {
            Ok(()) => staged.publish(),
            Err(source) => {
                staged.discard();
                Err(SegmentError::FileWrite { path: tmp, source })
            }
        }
    }

    pub fn load(path: &Path) -> SegmentResult<Self> {
        let json = fs::read_to_string(path).map_err(|source| SegmentError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let meta: Self = serde_json::from_str(&json).map_err(|e| {
            SegmentError::corrupt(path.display(), format!("Failed to parse index meta: {e}"))
        })?;
        if meta.version != INDEX_META_VERSION {
            return Err(SegmentError::corrupt(
                path.display(),
                format!("unsupported meta version {}", meta.version),
            ));
        }
        Ok(meta)
    }

    fn definitions(&self, path: &Path) -> SegmentResult<Vec<DenseVectorField>> {
        self.fields
            .iter()
            .map(|meta| {
                DenseVectorField::new(meta.name.clone(), meta.params.clone()).map_err(|e| {
                    SegmentError::corrupt(
                        path.display(),
                        format!("invalid field [{}]: {e}", meta.name),
                    )
                })
            })
            .collect()
    }
}

/// Equal apart from the seed.
fn same_mapping(a: &DenseVectorParams, b: &DenseVectorParams) -> bool {
    DenseVectorParams {
        seed: b.seed,
        ..a.clone()
    } == *b
}

/// Resolves `requested` against the index fields.
///
/// Known names must keep their mapping and get the stored definition back.
/// Unknown names are appended to the returned field list.
fn resolve_fields(
    known: &[DenseVectorField],
    requested: Vec<DenseVectorField>,
) -> SegmentResult<(Vec<DenseVectorField>, Vec<DenseVectorField>)> {
    let mut all = known.to_vec();
    let mut resolved = Vec::with_capacity(requested.len());
    for field in requested {
        match all.iter().find(|f| f.name() == field.name()) {
            Some(stored) if same_mapping(stored.params(), field.params()) => {
                resolved.push(stored.clone());
            }
            Some(stored) => {
                return Err(VectorError::InvalidParameter {
                    name: "fields".to_string(),
                    reason: format!(
                        "field [{}] is already defined as {:?}, got {:?}",
                        field.name(),
                        stored.params(),
                        field.params()
                    ),
                }
                .into());
            }
            None => {
                all.push(field.clone());
                resolved.push(field);
            }
        }
    }
    Ok((resolved, all))
}

/// Field list covering every segment; segments disagreeing on a field
/// mean the directory was written outside an index.
fn fields_of_segments(
    dir: &Path,
    segments: &[Arc<SegmentVectorReader>],
) -> SegmentResult<Vec<DenseVectorField>> {
    let mut fields: Vec<DenseVectorField> = Vec::new();
    for segment in segments {
        for field in segment.fields().iter().map(|reader| reader.field()) {
            match fields.iter().find(|f| f.name() == field.name()) {
                Some(known) if known == field => {}
                Some(_) => {
                    return Err(SegmentError::corrupt(
                        dir.display(),
                        format!(
                            "segment {} defines field [{}] differently from an earlier segment",
                            segment.segment(),
                            field.name()
                        ),
                    ));
                }
                None => fields.push(field.clone()),
            }
        }
    }
    Ok(fields)
}

pub struct VectorIndex {
    dir: PathBuf,
    format: VectorFormat,
    segments: RwLock<Vec<Arc<SegmentVectorReader>>>,
    /// Every field defined so far, in definition order
    fields: RwLock<Vec<DenseVectorField>>,
    /// Serializes writer creation, commits, deletions and merges; also
    /// holds the next ordinal
    writer_lock: Mutex<u32>,
    pool: rayon::ThreadPool,
}

impl VectorIndex {
    /// Opens every segment found in `settings.index_path`.
    pub fn open(settings: &Settings) -> SegmentResult<Self> {
        Self::open_in(&settings.index_path, settings)
    }

    /// Opens every segment found in `dir`, creating the directory if needed.
    ///
    /// Leftover `*.tmp` files of an interrupted flush or merge are removed.
    /// Without `index.meta.json` the fields are taken from the segments.
    pub fn open_in(dir: &Path, settings: &Settings) -> SegmentResult<Self> {
        fs::create_dir_all(dir).map_err(|source| SegmentError::FileWrite {
            path: dir.to_path_buf(),
            source,
        })?;

        let entries = fs::read_dir(dir).map_err(|source| SegmentError::FileRead {
            path: dir.to_path_buf(),
            source,
        })?;
        let mut ordinals = Vec::new();
        for entry in entries.filter_map(Result::ok) {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let stale = name.starts_with("segment_") || name.starts_with(INDEX_META_FILE);
            if stale && name.ends_with(".tmp") {
                debug!(file = %name, "Removing stale temporary file");
                if let Err(e) = fs::remove_file(entry.path()) {
                    warn!(file = %name, "Failed to remove stale temporary file: {e}");
                }
            } else if let Some(ordinal) = SegmentFiles::parse_meta_name(&name) {
                ordinals.push(ordinal);
            }
        }
        ordinals.sort();

        let segments = ordinals
            .iter()
            .map(|&ordinal| SegmentVectorReader::open(dir, ordinal).map(Arc::new))
            .collect::<SegmentResult<Vec<_>>>()?;
        let next = ordinals.last().map_or(0, |last| last.get() + 1);

        let meta_path = dir.join(INDEX_META_FILE);
        let fields = if meta_path.exists() {
            let fields = IndexMeta::load(&meta_path)?.definitions(&meta_path)?;
            for segment in &segments {
                for field in segment.fields().iter().map(|reader| reader.field()) {
                    if !fields.iter().any(|f| f == field) {
                        return Err(SegmentError::corrupt(
                            meta_path.display(),
                            format!(
                                "field [{}] of segment {} is not defined by the index",
                                field.name(),
                                segment.segment()
                            ),
                        ));
                    }
                }
            }
            fields
        } else {
            let fields = fields_of_segments(dir, &segments)?;
            if !fields.is_empty() {
                IndexMeta::new(&fields).save(&meta_path)?;
            }
            fields
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.search.parallel_threads)
            .thread_name(|i| format!("segvec-search-{i}"))
            .build()
            .map_err(|e| SegmentError::Config {
                reason: format!("Failed to build search thread pool: {e}"),
            })?;

        info!(
            dir = %dir.display(),
            segments = segments.len(),
            fields = fields.len(),
            threads = settings.search.parallel_threads,
            "Opened vector index"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            format: VectorFormat::from_settings(settings),
            segments: RwLock::new(segments),
            fields: RwLock::new(fields),
            writer_lock: Mutex::new(next),
            pool,
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot of the current segments.
    #[must_use]
    pub fn segments(&self) -> Vec<Arc<SegmentVectorReader>> {
        self.segments.read().clone()
    }

    /// Live documents over all segments.
    #[must_use]
    pub fn num_docs(&self) -> u64 {
        self.segments.read().iter().map(|s| s.num_docs()).sum()
    }

    /// Field definitions of the index.
    #[must_use]
    pub fn fields(&self) -> Vec<DenseVectorField> {
        self.fields.read().clone()
    }

    /// Writer for a new segment with the next free ordinal.
    ///
    /// Fields the index already defines are replaced by the stored
    /// definition, so their seed is ignored; any other mapping change is
    /// rejected. New fields are added to the index.
    pub fn writer(&self, fields: Vec<DenseVectorField>) -> SegmentResult<SegmentVectorWriter> {
        let mut next = self.writer_lock.lock();
        let (resolved, all) = resolve_fields(&self.fields.read(), fields)?;
        let writer = SegmentVectorWriter::new(
            &self.dir,
            SegmentOrdinal::new(*next),
            resolved,
            self.format.clone(),
        )?;

        if all.len() != self.fields.read().len() {
            IndexMeta::new(&all).save(&self.dir.join(INDEX_META_FILE))?;
            info!(fields = all.len(), "Defined new vector fields");
            *self.fields.write() = all;
        }
        *next += 1;
        Ok(writer)
    }

    /// Flushes `writer` and makes its segment searchable.
    pub fn commit(
        &self,
        writer: SegmentVectorWriter,
        cancel: &CancellationToken,
    ) -> SegmentResult<SegmentOrdinal> {
        let reader = writer.flush(cancel)?;
        let segment = reader.segment();
        let _guard = self.writer_lock.lock();
        let mut segments = self.segments.write();
        segments.push(Arc::new(reader));
        segments.sort_by_key(|s| s.segment());
        Ok(segment)
    }

    /// Deletes `docs` of `segment`. Returns the number of live docs left in it.
    pub fn delete(&self, segment: SegmentOrdinal, docs: &[DocId]) -> SegmentResult<u64> {
        let _guard = self.writer_lock.lock();
        let current = self.segment(segment)?;
        let updated = Arc::new(current.delete_documents(docs)?);
        let live = updated.num_docs();

        let mut segments = self.segments.write();
        if let Some(slot) = segments.iter_mut().find(|s| s.segment() == segment) {
            *slot = updated;
        }
        Ok(live)
    }

    /// Merges all segments into one, dropping deleted documents.
    ///
    /// Returns the new segment, or `None` when there was nothing to merge.
    pub fn merge_all(&self, cancel: &CancellationToken) -> SegmentResult<Option<SegmentOrdinal>> {
        let mut next = self.writer_lock.lock();
        let sources = self.segments();
        let needs_merge =
            sources.len() > 1 || sources.iter().any(|s| s.live_docs().has_deletions());
        if !needs_merge {
            return Ok(None);
        }

        let segment = SegmentOrdinal::new(*next);
        let readers: Vec<&SegmentVectorReader> = sources.iter().map(Arc::as_ref).collect();
        let merged = merge(&self.dir, segment, &readers, &self.format, cancel)?;
        *next += 1;

        *self.segments.write() = vec![Arc::new(merged)];
        for source in &sources {
            if let Err(e) = source.remove_files() {
                warn!(segment = %source.segment(), "Failed to remove merged segment: {e}");
            }
        }
        Ok(Some(segment))
    }

    /// Top `k` hits over all segments, searched in parallel.
    ///
    /// Ties are broken by segment ordinal, then doc id.
    pub fn search(
        &self,
        field: &str,
        query: &[f32],
        metric: Metric,
        k: usize,
        cancel: &CancellationToken,
    ) -> SegmentResult<Vec<IndexHit>> {
        if k == 0 {
            return Err(VectorError::InvalidParameter {
                name: "k".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        if !self.fields.read().iter().any(|f| f.name() == field) {
            return Err(VectorError::InvalidParameter {
                name: "field".to_string(),
                reason: format!("no vector field [{field}] in the index"),
            }
            .into());
        }
        // Segments written before the field was added have nothing to offer
        let segments: Vec<_> = self
            .segments()
            .into_iter()
            .filter(|segment| segment.has_field(field))
            .collect();
        let per_segment = self.pool.install(|| {
            segments
                .par_iter()
                .map(|segment| {
                    segment.search(field, query, metric, k, cancel).map(|hits| {
                        hits.into_iter()
                            .map(|hit| IndexHit {
                                segment: segment.segment(),
                                doc: hit.doc,
                                score: hit.score,
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect::<SegmentResult<Vec<_>>>()
        })?;

        let mut hits: Vec<IndexHit> = per_segment.into_iter().flatten().collect();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.segment.cmp(&b.segment))
                .then(a.doc.cmp(&b.doc))
        });
        hits.truncate(k);
        Ok(hits)
    }

    fn segment(&self, segment: SegmentOrdinal) -> SegmentResult<Arc<SegmentVectorReader>> {
        self.segments
            .read()
            .iter()
            .find(|s| s.segment() == segment)
            .cloned()
            .ok_or_else(|| {
                VectorError::InvalidParameter {
                    name: "segment".to_string(),
                    reason: format!("no segment {segment} in {}", self.dir.display()),
                }
                .into()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::field::DenseVectorParams;
    use crate::vector::types::VectorDimension;
    use tempfile::TempDir;

    fn settings(dir: &TempDir) -> Settings {
        let mut settings = Settings::default();
        settings.index_path = dir.path().join("index");
        settings.search.parallel_threads = 2;
        settings.quantization.enabled = false;
        settings.points.max_points_per_leaf = 8;
        settings
    }

    fn fields() -> Vec<DenseVectorField> {
        let params = DenseVectorParams::new(VectorDimension::new(2).unwrap())
            .with_projections(3)
            .with_top_hits(4)
            .with_seed(3);
        vec![DenseVectorField::new("embedding", params).unwrap()]
    }

    fn add_segment(index: &VectorIndex, vectors: &[[f32; 2]]) -> SegmentOrdinal {
        let mut writer = index.writer(fields()).unwrap();
        for v in vectors {
            writer.add_document(&[("embedding", v.as_slice())]).unwrap();
        }
        index.commit(writer, &CancellationToken::new()).unwrap()
    }

    #[test]
    fn test_commit_and_reopen() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        let index = VectorIndex::open(&settings).unwrap();
        assert_eq!(add_segment(&index, &[[1.0, 0.0], [0.0, 1.0]]).get(), 0);
        assert_eq!(add_segment(&index, &[[1.0, 1.0]]).get(), 1);
        assert_eq!(index.num_docs(), 3);

        // A stale temporary file is cleaned up on open
        fs::write(settings.index_path.join("segment_9.meta.json.tmp"), "{}").unwrap();

        let reopened = VectorIndex::open(&settings).unwrap();
        assert_eq!(reopened.segments().len(), 2);
        assert_eq!(reopened.num_docs(), 3);
        assert!(!settings.index_path.join("segment_9.meta.json.tmp").exists());
        assert_eq!(add_segment(&reopened, &[[2.0, 2.0]]).get(), 2);
    }

    #[test]
    fn test_search_across_segments() {
        let dir = TempDir::new().unwrap();
        let index = VectorIndex::open(&settings(&dir)).unwrap();
        let first = add_segment(&index, &[[1.0, 0.0], [5.0, 5.0]]);
        let second = add_segment(&index, &[[0.0, 1.0], [1.0, 0.1]]);

        let hits = index
            .search("embedding", &[1.0, 0.0], Metric::L2, 2, &CancellationToken::new())
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!((hits[0].segment, hits[0].doc), (first, 0));
        assert_eq!((hits[1].segment, hits[1].doc), (second, 1));

        assert!(index
            .search("embedding", &[1.0, 0.0], Metric::L2, 0, &CancellationToken::new())
            .is_err());
    }

    #[test]
    fn test_delete_and_merge() {
        let dir = TempDir::new().unwrap();
        let index = VectorIndex::open(&settings(&dir)).unwrap();
        let first = add_segment(&index, &[[1.0, 0.0], [2.0, 0.0], [3.0, 0.0]]);
        add_segment(&index, &[[4.0, 0.0]]);

        assert_eq!(index.delete(first, &[1]).unwrap(), 2);
        assert_eq!(index.num_docs(), 3);
        assert!(index.delete(SegmentOrdinal::new(42), &[0]).is_err());

        let merged = index.merge_all(&CancellationToken::new()).unwrap().unwrap();
        assert_eq!(merged.get(), 2);
        let segments = index.segments();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].max_doc(), 3);

        let hits = index
            .search("embedding", &[2.0, 0.0], Metric::L2, 3, &CancellationToken::new())
            .unwrap();
        assert!(hits.iter().all(|hit| hit.segment == merged));
        assert_eq!(hits.len(), 3);

        // Merged sources are gone from disk
        let reopened = VectorIndex::open(&settings(&dir)).unwrap();
        assert_eq!(reopened.segments().len(), 1);

        // Nothing left to merge
        assert_eq!(index.merge_all(&CancellationToken::new()).unwrap(), None);
    }

    fn unseeded(name: &str) -> DenseVectorField {
        let params = DenseVectorParams::new(VectorDimension::new(2).unwrap()).with_top_hits(4);
        DenseVectorField::new(name, params).unwrap()
    }

    fn commit(index: &VectorIndex, fields: Vec<DenseVectorField>, name: &str, v: [f32; 2]) {
        let mut writer = index.writer(fields).unwrap();
        writer.add_document(&[(name, v.as_slice())]).unwrap();
        index.commit(writer, &CancellationToken::new()).unwrap();
    }

    #[test]
    fn test_unseeded_fields_share_one_definition() {
        let dir = TempDir::new().unwrap();
        let index = VectorIndex::open(&settings(&dir)).unwrap();
        commit(&index, vec![unseeded("v")], "v", [1.0, 0.0]);
        commit(&index, vec![unseeded("v")], "v", [0.0, 1.0]);

        let segments = index.segments();
        assert_eq!(
            segments[0].field("v").unwrap().field(),
            segments[1].field("v").unwrap().field()
        );
        assert_eq!(index.fields().len(), 1);

        let merged = index.merge_all(&CancellationToken::new()).unwrap().unwrap();
        assert_eq!(index.segments()[0].segment(), merged);
        assert_eq!(index.segments()[0].max_doc(), 2);

        // The definition survives a reopen
        let reopened = VectorIndex::open(&settings(&dir)).unwrap();
        assert_eq!(reopened.fields(), index.fields());
        commit(&reopened, vec![unseeded("v")], "v", [1.0, 1.0]);
        assert!(reopened.merge_all(&CancellationToken::new()).unwrap().is_some());
    }

    #[test]
    fn test_changed_mapping_rejected() {
        let dir = TempDir::new().unwrap();
        let index = VectorIndex::open(&settings(&dir)).unwrap();
        commit(&index, fields(), "embedding", [1.0, 0.0]);

        let params = DenseVectorParams::new(VectorDimension::new(3).unwrap()).with_seed(3);
        let err = index
            .writer(vec![DenseVectorField::new("embedding", params).unwrap()])
            .unwrap_err();
        assert!(err.is_invalid_input());
        assert!(err.to_string().contains("[embedding]"));

        // A duplicate new field is rejected without being recorded
        assert!(index.writer(vec![unseeded("x"), unseeded("x")]).is_err());
        assert_eq!(index.fields().len(), 1);

        // The rejected writers did not use up an ordinal
        commit(&index, fields(), "embedding", [0.0, 1.0]);
        assert_eq!(index.segments()[1].segment().get(), 1);
    }

    #[test]
    fn test_search_skips_segments_without_field() {
        let dir = TempDir::new().unwrap();
        let index = VectorIndex::open(&settings(&dir)).unwrap();
        commit(&index, vec![unseeded("a")], "a", [1.0, 0.0]);
        commit(&index, vec![unseeded("b")], "b", [1.0, 0.0]);

        let hits = index
            .search("a", &[1.0, 0.0], Metric::Cosine, 5, &CancellationToken::new())
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!((hits[0].segment.get(), hits[0].doc), (0, 0));

        let err = index
            .search("c", &[1.0, 0.0], Metric::Cosine, 5, &CancellationToken::new())
            .unwrap_err();
        assert!(err.is_invalid_input());

        // Merging keeps both fields
        index.merge_all(&CancellationToken::new()).unwrap();
        let hits = index
            .search("b", &[1.0, 0.0], Metric::Cosine, 5, &CancellationToken::new())
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc, 1);
    }

    #[test]
    fn test_fields_recovered_from_segments() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        let index = VectorIndex::open(&settings).unwrap();
        commit(&index, fields(), "embedding", [1.0, 0.0]);
        drop(index);

        fs::remove_file(settings.index_path.join(INDEX_META_FILE)).unwrap();
        let reopened = VectorIndex::open(&settings).unwrap();
        assert_eq!(reopened.fields(), fields());
        assert!(settings.index_path.join(INDEX_META_FILE).exists());
    }
}
