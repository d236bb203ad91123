//! Segment lifecycle for vector fields.
//!
//! A segment is written once by [`SegmentVectorWriter::flush`] or by
//! [`merge`], then only read. Per dense field it owns:
//!
//! - `segment_{n}.{field}.vec`: raw store, one record per document
//! - `segment_{n}.{field}.qvec`: quantized store, written only when the
//!   segment reaches the quantization threshold
//! - `segment_{n}.{field}_{i}.pts`: point tree of projection `i`
//!
//! plus `segment_{n}.meta.json` with the field definitions and an optional
//! `segment_{n}.del` deletion bitmap. Every file is first written as
//! `*.tmp` and renamed once all of them are complete, the meta file last,
//! so a failed flush or merge leaves no visible segment behind.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use tantivy::{DocSet, Score, query::Scorer};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{QuantizationConfig, Settings};
use crate::error::{SegmentError, SegmentResult};
use crate::vector::ann::{AnnQuery, CandidateScorer};
use crate::vector::field::{DenseVectorField, DenseVectorParams};
use crate::vector::points::{BkdTree, BkdWriter, DEFAULT_MAX_POINTS_PER_LEAF, PointTreeReader};
use crate::vector::quantizer::VectorQuantizer;
use crate::vector::scoring::{Metric, VectorScorer};
use crate::vector::storage::{LiveDocs, QuantizedVectorStore, RawVectorStore, VectorDocValues};
use crate::vector::types::{DocId, SegmentOrdinal, TERMINATED, VectorError};

const META_VERSION: u32 = 1;

/// How segments are written.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorFormat {
    /// `None` never writes quantized stores
    pub quantization: Option<QuantizationConfig>,
    pub max_points_per_leaf: usize,
}

impl Default for VectorFormat {
    fn default() -> Self {
        Self {
            quantization: Some(QuantizationConfig::default()),
            max_points_per_leaf: DEFAULT_MAX_POINTS_PER_LEAF,
        }
    }
}

impl VectorFormat {
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            quantization: settings
                .quantization
                .enabled
                .then(|| settings.quantization.clone()),
            max_points_per_leaf: settings.points.max_points_per_leaf,
        }
    }
}

/// Definition of one field as persisted in the segment meta file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMeta {
    pub name: String,
    pub params: DenseVectorParams,
}

/// Contents of `segment_{n}.meta.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub version: u32,
    pub max_doc: DocId,
    pub fields: Vec<FieldMeta>,
}

impl SegmentMeta {
    pub fn save(&self, path: &Path) -> SegmentResult<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| SegmentError::Config {
            reason: format!("Failed to serialize segment meta: {e}"),
        })?;
        fs::write(path, json).map_err(|source| SegmentError::FileWrite {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> SegmentResult<Self> {
        let json = fs::read_to_string(path).map_err(|source| SegmentError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let meta: Self = serde_json::from_str(&json).map_err(|e| {
            SegmentError::corrupt(path.display(), format!("Failed to parse segment meta: {e}"))
        })?;
        if meta.version != META_VERSION {
            return Err(SegmentError::corrupt(
                path.display(),
                format!("unsupported meta version {}", meta.version),
            ));
        }
        Ok(meta)
    }
}

/// File names of one segment.
#[derive(Debug, Clone)]
pub struct SegmentFiles {
    dir: PathBuf,
    segment: SegmentOrdinal,
}

impl SegmentFiles {
    #[must_use]
    pub fn new(dir: &Path, segment: SegmentOrdinal) -> Self {
        Self {
            dir: dir.to_path_buf(),
            segment,
        }
    }

    fn file(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("segment_{}.{suffix}", self.segment))
    }

    #[must_use]
    pub fn meta(&self) -> PathBuf {
        self.file("meta.json")
    }

    #[must_use]
    pub fn deletes(&self) -> PathBuf {
        self.file("del")
    }

    #[must_use]
    pub fn raw(&self, field: &str) -> PathBuf {
        self.file(&format!("{field}.vec"))
    }

    #[must_use]
    pub fn quantized(&self, field: &str) -> PathBuf {
        self.file(&format!("{field}.qvec"))
    }

    /// Point tree of sub-field `sub_field` (`"{field}_{i}"`).
    #[must_use]
    pub fn points(&self, sub_field: &str) -> PathBuf {
        self.file(&format!("{sub_field}.pts"))
    }

    /// Segment ordinal of a meta file name.
    #[must_use]
    pub fn parse_meta_name(name: &str) -> Option<SegmentOrdinal> {
        name.strip_prefix("segment_")?
            .strip_suffix(".meta.json")?
            .parse()
            .ok()
            .map(SegmentOrdinal::new)
    }

    /// Every file the segment may own, meta first.
    fn all(&self, fields: &[DenseVectorField]) -> Vec<PathBuf> {
        let mut files = vec![self.meta(), self.deletes()];
        for field in fields {
            files.push(self.raw(field.name()));
            files.push(self.quantized(field.name()));
            files.extend(field.sub_field_names().iter().map(|s| self.points(s)));
        }
        files
    }
}

/// Files written under a temporary name until the whole set is complete.
#[derive(Debug, Default)]
pub(crate) struct StagedFiles {
    files: Vec<(PathBuf, PathBuf)>,
}

impl StagedFiles {
    /// Registers `target` and returns the path to write instead.
    pub(crate) fn stage(&mut self, target: PathBuf) -> PathBuf {
        let mut tmp = target.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        self.files.push((tmp.clone(), target));
        tmp
    }

    pub(crate) fn publish(self) -> SegmentResult<()> {
        for (i, (tmp, target)) in self.files.iter().enumerate() {
            if let Err(source) = fs::rename(tmp, target) {
                for (tmp, _) in &self.files[i..] {
                    let _ = fs::remove_file(tmp);
                }
                return Err(SegmentError::FileWrite {
                    path: target.clone(),
                    source,
                });
            }
        }
        Ok(())
    }

    pub(crate) fn discard(self) {
        for (tmp, _) in self.files {
            if tmp.exists() {
                if let Err(e) = fs::remove_file(&tmp) {
                    warn!(path = %tmp.display(), "Failed to remove temporary file: {e}");
                }
            }
        }
    }
}

/// Everything needed to write one field of a segment.
struct FieldData {
    field: DenseVectorField,
    records: Vec<(DocId, Vec<u8>)>,
    trees: Vec<BkdTree>,
}

fn check_cancelled(cancel: &CancellationToken, operation: &'static str) -> SegmentResult<()> {
    if cancel.is_cancelled() {
        return Err(SegmentError::Cancelled { operation });
    }
    Ok(())
}

/// Writes and publishes a complete segment.
fn write_segment(
    dir: &Path,
    segment: SegmentOrdinal,
    max_doc: DocId,
    fields: &[FieldData],
    format: &VectorFormat,
    cancel: &CancellationToken,
    operation: &'static str,
) -> SegmentResult<()> {
    let files = SegmentFiles::new(dir, segment);
    if files.meta().exists() {
        return Err(VectorError::InvalidParameter {
            name: "segment".to_string(),
            reason: format!("segment {segment} already exists in {}", dir.display()),
        }
        .into());
    }
    fs::create_dir_all(dir).map_err(|source| SegmentError::FileWrite {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut staged = StagedFiles::default();
    match stage_segment(&files, &mut staged, max_doc, fields, format, cancel, operation) {
        Ok(()) => staged.publish(),
        Err(e) => {
            staged.discard();
            Err(e)
        }
    }
}

fn stage_segment(
    files: &SegmentFiles,
    staged: &mut StagedFiles,
    max_doc: DocId,
    fields: &[FieldData],
    format: &VectorFormat,
    cancel: &CancellationToken,
    operation: &'static str,
) -> SegmentResult<()> {
    let quantizer = format.quantization.clone().map(VectorQuantizer::new);

    for data in fields {
        check_cancelled(cancel, operation)?;
        let field = &data.field;
        let name = field.name();
        let params = field.params();

        let raw_path = staged.stage(files.raw(name));
        RawVectorStore::write(&raw_path, params.dims, params.encoding, &data.records)?;

        for (sub_field, tree) in field.sub_field_names().iter().zip(&data.trees) {
            tree.write_to(&staged.stage(files.points(sub_field)))?;
        }

        if let Some(quantizer) = quantizer.as_ref().filter(|q| q.should_quantize(max_doc)) {
            let raw = RawVectorStore::open(&raw_path)?;
            if let Some(quantized) = quantizer.quantize(name, &raw, max_doc, cancel)? {
                QuantizedVectorStore::write(
                    &staged.stage(files.quantized(name)),
                    params.dims,
                    &quantized.centroid_records(),
                    &quantized.assignments,
                )?;
            }
        }
    }

    check_cancelled(cancel, operation)?;
    let meta = SegmentMeta {
        version: META_VERSION,
        max_doc,
        fields: fields
            .iter()
            .map(|data| FieldMeta {
                name: data.field.name().to_string(),
                params: data.field.params().clone(),
            })
            .collect(),
    };
    meta.save(&staged.stage(files.meta()))
}

/// Buffers documents of one segment until flush.
#[derive(Debug)]
pub struct SegmentVectorWriter {
    dir: PathBuf,
    segment: SegmentOrdinal,
    format: VectorFormat,
    fields: Vec<FieldBuffer>,
    max_doc: DocId,
}

#[derive(Debug)]
struct FieldBuffer {
    field: DenseVectorField,
    records: Vec<(DocId, Vec<u8>)>,
    points: Vec<BkdWriter>,
}

impl SegmentVectorWriter {
    pub fn new(
        dir: impl Into<PathBuf>,
        segment: SegmentOrdinal,
        fields: Vec<DenseVectorField>,
        format: VectorFormat,
    ) -> SegmentResult<Self> {
        for (i, field) in fields.iter().enumerate() {
            if fields[..i].iter().any(|f| f.name() == field.name()) {
                return Err(VectorError::InvalidParameter {
                    name: "fields".to_string(),
                    reason: format!("field [{}] is declared twice", field.name()),
                }
                .into());
            }
        }
        let fields = fields
            .into_iter()
            .map(|field| FieldBuffer {
                points: (0..field.params().projections)
                    .map(|_| BkdWriter::new(format.max_points_per_leaf))
                    .collect(),
                records: Vec::new(),
                field,
            })
            .collect();
        Ok(Self {
            dir: dir.into(),
            segment,
            format,
            fields,
            max_doc: 0,
        })
    }

    #[must_use]
    pub fn segment(&self) -> SegmentOrdinal {
        self.segment
    }

    /// Documents added so far.
    #[must_use]
    pub fn max_doc(&self) -> DocId {
        self.max_doc
    }

    /// Adds one document and returns its doc id.
    ///
    /// Fields without a value are simply absent for this document. The
    /// document is rejected as a whole if any value is invalid.
    pub fn add_document(&mut self, values: &[(&str, &[f32])]) -> SegmentResult<DocId> {
        let doc = self.max_doc;
        if doc >= TERMINATED - 1 {
            return Err(VectorError::InvalidParameter {
                name: "max_doc".to_string(),
                reason: format!("segment {} is full", self.segment),
            }
            .into());
        }

        let mut indexed = Vec::with_capacity(values.len());
        for (i, (name, vector)) in values.iter().enumerate() {
            if values[..i].iter().any(|(other, _)| other == name) {
                return Err(VectorError::InvalidParameter {
                    name: (*name).to_string(),
                    reason: "multiple values for a vector field".to_string(),
                }
                .for_document(name, doc)
                .into());
            }
            let slot = self
                .fields
                .iter()
                .position(|buffer| buffer.field.name() == *name)
                .ok_or_else(|| VectorError::InvalidParameter {
                    name: (*name).to_string(),
                    reason: "unknown vector field".to_string(),
                })?;
            indexed.push((slot, self.fields[slot].field.index_document(doc, vector)?));
        }

        for (slot, value) in indexed {
            let buffer = &mut self.fields[slot];
            buffer.records.push((doc, value.record));
            for (writer, point) in buffer.points.iter_mut().zip(value.points) {
                writer.add(doc, point)?;
            }
        }
        self.max_doc += 1;
        Ok(doc)
    }

    /// Writes the segment and opens it.
    pub fn flush(self, cancel: &CancellationToken) -> SegmentResult<SegmentVectorReader> {
        let fields: Vec<FieldData> = self
            .fields
            .into_iter()
            .map(|buffer| FieldData {
                field: buffer.field,
                records: buffer.records,
                trees: buffer.points.into_iter().map(BkdWriter::finish).collect(),
            })
            .collect();

        write_segment(
            &self.dir,
            self.segment,
            self.max_doc,
            &fields,
            &self.format,
            cancel,
            "flush",
        )?;
        info!(
            segment = %self.segment,
            max_doc = self.max_doc,
            fields = fields.len(),
            "Flushed vector segment"
        );
        SegmentVectorReader::open(&self.dir, self.segment)
    }
}

/// Read side of one dense field in a segment.
#[derive(Debug, Clone)]
pub struct FieldReader {
    field: DenseVectorField,
    raw: RawVectorStore,
    quantized: Option<QuantizedVectorStore>,
    trees: Arc<Vec<BkdTree>>,
}

impl FieldReader {
    #[must_use]
    pub fn field(&self) -> &DenseVectorField {
        &self.field
    }

    #[must_use]
    pub fn raw(&self) -> &RawVectorStore {
        &self.raw
    }

    #[must_use]
    pub fn quantized(&self) -> Option<&QuantizedVectorStore> {
        self.quantized.as_ref()
    }

    /// Point trees in projection order.
    #[must_use]
    pub fn trees(&self) -> &[BkdTree] {
        &self.trees
    }

    /// Cursor over the quantized store when asked for and present,
    /// otherwise over the raw store.
    #[must_use]
    pub fn doc_values(&self, quantized: bool) -> Box<dyn VectorDocValues> {
        match (&self.quantized, quantized) {
            (Some(store), true) => Box::new(store.cursor()),
            _ => Box::new(self.raw.cursor()),
        }
    }
}

/// A document and its similarity score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredDoc {
    pub doc: DocId,
    pub score: Score,
}

/// Sorts by descending score, ties by ascending doc id.
pub(crate) fn sort_scored(hits: &mut [ScoredDoc]) {
    hits.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.doc.cmp(&b.doc)));
}

/// Sealed segment opened for search.
#[derive(Debug, Clone)]
pub struct SegmentVectorReader {
    dir: PathBuf,
    segment: SegmentOrdinal,
    meta: SegmentMeta,
    fields: Vec<FieldReader>,
    live_docs: Arc<LiveDocs>,
}

impl SegmentVectorReader {
    pub fn open(dir: &Path, segment: SegmentOrdinal) -> SegmentResult<Self> {
        let files = SegmentFiles::new(dir, segment);
        let meta_path = files.meta();
        let meta = SegmentMeta::load(&meta_path)?;
        let corrupt = |reason: String| SegmentError::corrupt(meta_path.display(), reason);

        let mut fields = Vec::with_capacity(meta.fields.len());
        for field_meta in &meta.fields {
            let field = DenseVectorField::new(field_meta.name.clone(), field_meta.params.clone())
                .map_err(|e| corrupt(format!("invalid field [{}]: {e}", field_meta.name)))?;
            let params = field.params();

            let raw = RawVectorStore::open(&files.raw(&field_meta.name))?;
            if raw.dimension() != params.dims || raw.encoding() != params.encoding {
                return Err(corrupt(format!(
                    "raw store of [{}] does not match the field definition",
                    field_meta.name
                )));
            }
            if raw.docs().any(|doc| doc >= meta.max_doc) {
                return Err(corrupt(format!(
                    "raw store of [{}] has doc ids beyond max_doc {}",
                    field_meta.name, meta.max_doc
                )));
            }

            let mut trees = Vec::with_capacity(params.projections);
            for sub_field in field.sub_field_names() {
                let tree = BkdTree::open(&files.points(&sub_field))?;
                if tree.point_count() != raw.len() || tree.iter().any(|(doc, _)| doc >= meta.max_doc) {
                    return Err(corrupt(format!(
                        "point tree [{sub_field}] does not match the raw store"
                    )));
                }
                trees.push(tree);
            }

            let quantized_path = files.quantized(&field_meta.name);
            let quantized = if quantized_path.exists() {
                let store = QuantizedVectorStore::open(&quantized_path)?;
                if store.dimension() != params.dims || store.len() != raw.len() {
                    return Err(corrupt(format!(
                        "quantized store of [{}] does not match the raw store",
                        field_meta.name
                    )));
                }
                Some(store)
            } else {
                None
            };

            fields.push(FieldReader {
                field,
                raw,
                quantized,
                trees: Arc::new(trees),
            });
        }

        let live_docs = LiveDocs::open(&files.deletes(), meta.max_doc)?;
        debug!(
            segment = %segment,
            max_doc = meta.max_doc,
            deleted = live_docs.num_deleted(),
            "Opened vector segment"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            segment,
            meta,
            fields,
            live_docs: Arc::new(live_docs),
        })
    }

    #[must_use]
    pub fn segment(&self) -> SegmentOrdinal {
        self.segment
    }

    #[must_use]
    pub fn meta(&self) -> &SegmentMeta {
        &self.meta
    }

    #[must_use]
    pub fn max_doc(&self) -> DocId {
        self.meta.max_doc
    }

    /// Documents not deleted.
    #[must_use]
    pub fn num_docs(&self) -> u64 {
        u64::from(self.meta.max_doc) - self.live_docs.num_deleted()
    }

    #[must_use]
    pub fn live_docs(&self) -> &LiveDocs {
        &self.live_docs
    }

    #[must_use]
    pub fn fields(&self) -> &[FieldReader] {
        &self.fields
    }

    #[must_use]
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|reader| reader.field.name() == name)
    }

    pub fn field(&self, name: &str) -> SegmentResult<&FieldReader> {
        self.fields
            .iter()
            .find(|reader| reader.field.name() == name)
            .ok_or_else(|| {
                VectorError::InvalidParameter {
                    name: "field".to_string(),
                    reason: format!("no vector field [{name}] in segment {}", self.segment),
                }
                .into()
            })
    }

    /// Projects `query` for `field` with the field's own bases.
    pub fn ann_query(&self, field: &str, query: &[f32]) -> SegmentResult<AnnQuery> {
        self.field(field)?.field.ann_query(query)
    }

    pub fn ann_candidates(
        &self,
        query: &AnnQuery,
        cancel: &CancellationToken,
    ) -> SegmentResult<RoaringBitmap> {
        let reader = self.field(query.field())?;
        query.candidates(reader.trees(), &self.live_docs, cancel)
    }

    pub fn ann_scorer(
        &self,
        query: &AnnQuery,
        cancel: &CancellationToken,
        boost: Score,
    ) -> SegmentResult<CandidateScorer> {
        let reader = self.field(query.field())?;
        query.scorer(reader.trees(), &self.live_docs, cancel, boost)
    }

    /// Similarity scorer over the raw store, or over the quantized store
    /// when `quantized` is set and the segment has one.
    pub fn similarity_scorer(
        &self,
        field: &str,
        metric: Metric,
        query: &[f32],
        quantized: bool,
    ) -> SegmentResult<VectorScorer> {
        let reader = self.field(field)?;
        Ok(metric.scorer(query, reader.doc_values(quantized))?)
    }

    /// Top `k` live documents among the ANN candidates, ranked by `metric`
    /// over the raw vectors.
    pub fn search(
        &self,
        field: &str,
        query: &[f32],
        metric: Metric,
        k: usize,
        cancel: &CancellationToken,
    ) -> SegmentResult<Vec<ScoredDoc>> {
        if k == 0 {
            return Err(VectorError::InvalidParameter {
                name: "k".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        let candidates = self.ann_candidates(&self.ann_query(field, query)?, cancel)?;
        let mut scorer = self.similarity_scorer(field, metric, query, false)?;

        let mut hits = Vec::with_capacity(candidates.len() as usize);
        for doc in &candidates {
            if scorer.seek(doc) == doc {
                hits.push(ScoredDoc {
                    doc,
                    score: scorer.score(),
                });
            }
        }
        sort_scored(&mut hits);
        hits.truncate(k);
        debug!(
            segment = %self.segment,
            field,
            candidates = candidates.len(),
            hits = hits.len(),
            "Searched vector segment"
        );
        Ok(hits)
    }

    /// Marks `docs` deleted and returns the reader seeing the deletions.
    ///
    /// The deletion bitmap is rewritten through a temporary file, so
    /// readers opened earlier keep their view.
    pub fn delete_documents(&self, docs: &[DocId]) -> SegmentResult<Self> {
        let mut live_docs = LiveDocs::clone(&self.live_docs);
        let mut deleted = 0;
        for &doc in docs {
            if doc >= self.meta.max_doc {
                return Err(VectorError::InvalidParameter {
                    name: "doc".to_string(),
                    reason: format!(
                        "doc {doc} is out of range for segment {} (max_doc {})",
                        self.segment, self.meta.max_doc
                    ),
                }
                .into());
            }
            if live_docs.delete(doc) {
                deleted += 1;
            }
        }
        if deleted == 0 {
            return Ok(self.clone());
        }

        let mut staged = StagedFiles::default();
        let tmp = staged.stage(SegmentFiles::new(&self.dir, self.segment).deletes());
        match live_docs.write_to(&tmp) {
            Ok(()) => staged.publish()?,
            Err(e) => {
                staged.discard();
                return Err(e);
            }
        }
        debug!(segment = %self.segment, deleted, "Deleted documents");
        Ok(Self {
            live_docs: Arc::new(live_docs),
            ..self.clone()
        })
    }

    /// Removes every file of this segment. The meta file goes first.
    pub fn remove_files(&self) -> SegmentResult<()> {
        let fields: Vec<DenseVectorField> =
            self.fields.iter().map(|reader| reader.field.clone()).collect();
        for path in SegmentFiles::new(&self.dir, self.segment).all(&fields) {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(SegmentError::FileWrite { path, source }),
            }
        }
        Ok(())
    }
}

/// Union of the fields of `readers`, in order of first appearance.
///
/// Fails when two readers define the same field name differently.
fn merged_fields(readers: &[&SegmentVectorReader]) -> SegmentResult<Vec<DenseVectorField>> {
    let mut fields: Vec<(SegmentOrdinal, &DenseVectorField)> = Vec::new();
    for reader in readers {
        for field in reader.fields.iter().map(FieldReader::field) {
            match fields.iter().find(|(_, known)| known.name() == field.name()) {
                Some((_, known)) if *known == field => {}
                Some((segment, _)) => {
                    return Err(VectorError::InvalidParameter {
                        name: "fields".to_string(),
                        reason: format!(
                            "segments {segment} and {} define field [{}] differently",
                            reader.segment,
                            field.name()
                        ),
                    }
                    .into());
                }
                None => fields.push((reader.segment, field)),
            }
        }
    }
    Ok(fields.into_iter().map(|(_, field)| field.clone()).collect())
}

/// Merges `readers` into a new segment.
///
/// Deleted documents are dropped and the remaining ones renumbered densely
/// in reader order. Point trees are rebuilt from the stored points, so no
/// vector is projected again. The new segment holds every field of every
/// reader; a field shared by several readers must have one definition.
pub fn merge(
    dir: &Path,
    segment: SegmentOrdinal,
    readers: &[&SegmentVectorReader],
    format: &VectorFormat,
    cancel: &CancellationToken,
) -> SegmentResult<SegmentVectorReader> {
    if readers.is_empty() {
        return Err(VectorError::InvalidParameter {
            name: "readers".to_string(),
            reason: "nothing to merge".to_string(),
        }
        .into());
    }
    let merged = merged_fields(readers)?;

    // old doc id -> new doc id, per reader
    let mut doc_maps = Vec::with_capacity(readers.len());
    let mut max_doc: DocId = 0;
    for reader in readers {
        let map: Vec<Option<DocId>> = (0..reader.max_doc())
            .map(|doc| {
                reader.live_docs.is_live(doc).then(|| {
                    max_doc += 1;
                    max_doc - 1
                })
            })
            .collect();
        doc_maps.push(map);
    }

    let mut fields = Vec::with_capacity(merged.len());
    for field in merged {
        let mut records = Vec::new();
        let mut writers: Vec<BkdWriter> = (0..field.params().projections)
            .map(|_| BkdWriter::new(format.max_points_per_leaf))
            .collect();

        for (reader, map) in readers.iter().zip(&doc_maps) {
            check_cancelled(cancel, "merge")?;
            // Readers written before the field existed contribute nothing
            let Some(source) = reader.fields.iter().find(|f| f.field.name() == field.name())
            else {
                continue;
            };
            for (doc, record) in source.raw.iter() {
                if let Some(new_doc) = map[doc as usize] {
                    records.push((new_doc, record.to_vec()));
                }
            }
            for (writer, tree) in writers.iter_mut().zip(source.trees.iter()) {
                for (doc, point) in tree.iter() {
                    if let Some(new_doc) = map[doc as usize] {
                        writer.add(new_doc, *point)?;
                    }
                }
            }
        }

        fields.push(FieldData {
            field,
            records,
            trees: writers.into_iter().map(BkdWriter::finish).collect(),
        });
    }

    write_segment(dir, segment, max_doc, &fields, format, cancel, "merge")?;
    info!(
        segment = %segment,
        merged = readers.len(),
        max_doc,
        "Merged vector segments"
    );
    SegmentVectorReader::open(dir, segment)
}
