//! Memory-mapped per-document vector stores for a single segment.
//!
//! A segment keeps one raw store per vector field and, when quantization
//! ran, a quantized store next to it. Both are written once at flush or
//! merge time and then only read through a memory map. Readers walk them
//! with a forward-only [`VectorDocValues`] cursor that hands out the stored
//! record of the current document.
//!
//! # Storage Format
//!
//! Every file starts with a 16 byte little-endian header: magic, version,
//! dimension, document count.
//!
//! Raw store (`SVEC`):
//! - u32 encoding tag, u32 record width
//! - `count` entries of u32 doc id followed by the record bytes
//!
//! Quantized store (`SQVC`):
//! - u32 centroid count
//! - centroid records, `dims * 4 + 4` bytes each (full precision plus norm)
//! - `count` entries of u32 doc id followed by u32 centroid index
//!
//! Doc ids are strictly ascending in both stores. Records themselves are
//! big-endian, see [`crate::vector::codec`].

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{LittleEndian, WriteBytesExt};
use memmap2::{Mmap, MmapOptions};
use roaring::RoaringBitmap;

use crate::error::{SegmentError, SegmentResult};
use crate::vector::codec::{self, FULL_BYTES, MAGNITUDE_BYTES, record_width};
use crate::vector::types::{
    CentroidId, DocId, TERMINATED, VectorDimension, VectorEncoding, VectorError,
};

/// Current storage format version.
const STORAGE_VERSION: u32 = 1;

/// Size of the storage header in bytes.
const HEADER_SIZE: usize = 16;

/// Magic bytes of the raw store.
const RAW_MAGIC: &[u8; 4] = b"SVEC";

/// Magic bytes of the quantized store.
const QUANTIZED_MAGIC: &[u8; 4] = b"SQVC";

/// Number of bytes per doc id.
const BYTES_PER_DOC: usize = 4;

/// Forward-only cursor over the documents of one store.
///
/// A fresh cursor is already positioned on its first document, or on
/// [`TERMINATED`] when the store is empty.
pub trait VectorDocValues: Send {
    /// Current document, [`TERMINATED`] once exhausted.
    fn doc_id(&self) -> DocId;

    /// Moves to the next document.
    fn next_doc(&mut self) -> DocId;

    /// Moves to the first document `>= target`. Never moves backwards.
    fn advance(&mut self, target: DocId) -> DocId;

    /// Stored record of the current document (empty once exhausted).
    fn binary_value(&self) -> &[u8];

    /// Encoding of the vector part of [`VectorDocValues::binary_value`].
    fn encoding(&self) -> VectorEncoding;

    /// Number of dimensions of every stored vector.
    fn dimension(&self) -> VectorDimension;

    /// Number of documents the cursor can visit.
    fn cost(&self) -> u64;
}

/// Validated 16 byte store header.
#[derive(Debug, Clone, Copy)]
struct StoreHeader {
    dimension: VectorDimension,
    count: usize,
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn read_header(bytes: &[u8], magic: &[u8; 4]) -> Result<StoreHeader, String> {
    if bytes.len() < HEADER_SIZE {
        return Err("file too small to contain header".to_string());
    }
    if &bytes[0..4] != magic {
        return Err("invalid magic bytes".to_string());
    }
    let version = read_u32(bytes, 4);
    if version != STORAGE_VERSION {
        return Err(format!(
            "unsupported version {version}, expected {STORAGE_VERSION}"
        ));
    }
    let dimension =
        VectorDimension::new(read_u32(bytes, 8) as usize).map_err(|e| e.to_string())?;
    Ok(StoreHeader {
        dimension,
        count: read_u32(bytes, 12) as usize,
    })
}

fn write_header(
    out: &mut impl Write,
    magic: &[u8; 4],
    dimension: VectorDimension,
    count: usize,
) -> std::io::Result<()> {
    out.write_all(magic)?;
    out.write_u32::<LittleEndian>(STORAGE_VERSION)?;
    out.write_u32::<LittleEndian>(dimension.get() as u32)?;
    out.write_u32::<LittleEndian>(count as u32)
}

fn map_file(path: &Path) -> SegmentResult<Mmap> {
    let file = File::open(path).map_err(|source| SegmentError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;
    // SAFETY: sealed segment files are never modified after they are written.
    unsafe { MmapOptions::new().map(&file) }.map_err(|source| SegmentError::FileRead {
        path: path.to_path_buf(),
        source,
    })
}

fn create_writer(path: &Path) -> SegmentResult<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| SegmentError::FileWrite {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let file = File::create(path).map_err(|source| SegmentError::FileWrite {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(BufWriter::new(file))
}

/// Column of fixed-stride entries that each begin with a doc id.
#[derive(Debug, Clone)]
struct DocColumn {
    mmap: Arc<Mmap>,
    base: usize,
    stride: usize,
    count: usize,
}

impl DocColumn {
    fn doc_at(&self, pos: usize) -> DocId {
        read_u32(&self.mmap, self.base + pos * self.stride)
    }

    fn entry(&self, pos: usize) -> &[u8] {
        let start = self.base + pos * self.stride;
        &self.mmap[start..start + self.stride]
    }

    /// First position in `from..count` whose doc id is `>= target`.
    fn seek(&self, from: usize, target: DocId) -> usize {
        let (mut lo, mut hi) = (from, self.count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.doc_at(mid) < target {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Position of `doc`, if stored.
    fn find(&self, doc: DocId) -> Option<usize> {
        let pos = self.seek(0, doc);
        (pos < self.count && self.doc_at(pos) == doc).then_some(pos)
    }

    /// Checks doc ids are strictly ascending.
    fn validate(&self) -> Result<(), String> {
        let mut previous: Option<DocId> = None;
        for pos in 0..self.count {
            let doc = self.doc_at(pos);
            if doc == TERMINATED || previous.is_some_and(|p| p >= doc) {
                return Err(format!("doc ids not strictly ascending at entry {pos}"));
            }
            previous = Some(doc);
        }
        Ok(())
    }

    fn docs(&self) -> impl Iterator<Item = DocId> + '_ {
        (0..self.count).map(|pos| self.doc_at(pos))
    }
}

/// Raw per-document store holding `encode(vector) ++ magnitude` records.
#[derive(Debug, Clone)]
pub struct RawVectorStore {
    path: PathBuf,
    column: DocColumn,
    dimension: VectorDimension,
    encoding: VectorEncoding,
    record_width: usize,
}

impl RawVectorStore {
    /// Writes a raw store. Records must be sorted by doc id and already
    /// have the width implied by `dimension` and `encoding`.
    pub fn write(
        path: &Path,
        dimension: VectorDimension,
        encoding: VectorEncoding,
        records: &[(DocId, Vec<u8>)],
    ) -> SegmentResult<()> {
        let width = record_width(dimension.get(), encoding);
        for (doc, record) in records {
            if record.len() != width {
                return Err(VectorError::MalformedLength {
                    length: record.len(),
                    width,
                }
                .for_document("record", *doc)
                .into());
            }
        }

        let mut out = create_writer(path)?;
        let write = |out: &mut BufWriter<File>| -> std::io::Result<()> {
            write_header(out, RAW_MAGIC, dimension, records.len())?;
            out.write_u32::<LittleEndian>(encoding.tag())?;
            out.write_u32::<LittleEndian>(width as u32)?;
            for (doc, record) in records {
                out.write_u32::<LittleEndian>(*doc)?;
                out.write_all(record)?;
            }
            out.flush()
        };
        write(&mut out).map_err(|source| SegmentError::FileWrite {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Opens and validates a raw store.
    pub fn open(path: &Path) -> SegmentResult<Self> {
        let mmap = Arc::new(map_file(path)?);
        let corrupt = |reason: String| SegmentError::corrupt(path.display(), reason);

        let header = read_header(&mmap, RAW_MAGIC).map_err(corrupt)?;
        if mmap.len() < HEADER_SIZE + 8 {
            return Err(corrupt("missing encoding and record width".to_string()));
        }
        let encoding = VectorEncoding::from_tag(read_u32(&mmap, HEADER_SIZE))
            .ok_or_else(|| corrupt("unknown vector encoding".to_string()))?;
        let width = read_u32(&mmap, HEADER_SIZE + 4) as usize;
        if width != record_width(header.dimension.get(), encoding) {
            return Err(corrupt(format!(
                "record width {width} does not match {} dims",
                header.dimension.get()
            )));
        }

        let base = HEADER_SIZE + 8;
        let stride = BYTES_PER_DOC + width;
        let expected = base + header.count * stride;
        if mmap.len() != expected {
            return Err(corrupt(format!(
                "file is {} bytes, expected {expected}",
                mmap.len()
            )));
        }

        let column = DocColumn {
            mmap,
            base,
            stride,
            count: header.count,
        };
        column.validate().map_err(corrupt)?;

        Ok(Self {
            path: path.to_path_buf(),
            column,
            dimension: header.dimension,
            encoding,
            record_width: width,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    #[must_use]
    pub fn encoding(&self) -> VectorEncoding {
        self.encoding
    }

    /// Number of documents with a value.
    #[must_use]
    pub fn len(&self) -> usize {
        self.column.count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.column.count == 0
    }

    /// Stored record of `doc`.
    #[must_use]
    pub fn record(&self, doc: DocId) -> Option<&[u8]> {
        self.column
            .find(doc)
            .map(|pos| &self.column.entry(pos)[BYTES_PER_DOC..])
    }

    /// Decoded vector of `doc`.
    pub fn vector(&self, doc: DocId) -> SegmentResult<Option<Vec<f32>>> {
        self.record(doc)
            .map(|record| self.decode(doc, record))
            .transpose()
    }

    /// Iterates `(doc, record)` in doc id order.
    pub fn iter(&self) -> impl Iterator<Item = (DocId, &[u8])> {
        (0..self.column.count).map(|pos| {
            let entry = self.column.entry(pos);
            (self.column.doc_at(pos), &entry[BYTES_PER_DOC..])
        })
    }

    /// Decodes a record read from this store.
    ///
    /// Indexing only accepts finite values, so anything else is corruption.
    pub fn decode(&self, doc: DocId, record: &[u8]) -> SegmentResult<Vec<f32>> {
        let corrupt =
            |reason: String| SegmentError::corrupt(self.path.display(), format!("doc {doc}: {reason}"));
        let vector = codec::decode_record(record, self.encoding).map_err(|e| corrupt(e.to_string()))?;
        if let Some(dim) = vector.iter().position(|v| !v.is_finite()) {
            return Err(corrupt(format!("value at dimension {dim} is not finite")));
        }
        Ok(vector)
    }

    /// Opens a cursor positioned on the first document.
    #[must_use]
    pub fn cursor(&self) -> RawVectorCursor {
        RawVectorCursor::new(
            self.column.clone(),
            self.dimension,
            self.encoding,
            self.record_width,
        )
    }

    /// Doc ids in ascending order.
    pub fn docs(&self) -> impl Iterator<Item = DocId> + '_ {
        self.column.docs()
    }
}

/// Cursor over a [`RawVectorStore`].
#[derive(Debug)]
pub struct RawVectorCursor {
    column: DocColumn,
    dimension: VectorDimension,
    encoding: VectorEncoding,
    record_width: usize,
    pos: usize,
    doc: DocId,
}

impl RawVectorCursor {
    fn new(
        column: DocColumn,
        dimension: VectorDimension,
        encoding: VectorEncoding,
        record_width: usize,
    ) -> Self {
        let doc = if column.count > 0 {
            column.doc_at(0)
        } else {
            TERMINATED
        };
        Self {
            column,
            dimension,
            encoding,
            record_width,
            pos: 0,
            doc,
        }
    }

    fn move_to(&mut self, pos: usize) -> DocId {
        self.pos = pos;
        self.doc = if pos < self.column.count {
            self.column.doc_at(pos)
        } else {
            TERMINATED
        };
        self.doc
    }
}

impl VectorDocValues for RawVectorCursor {
    fn doc_id(&self) -> DocId {
        self.doc
    }

    fn next_doc(&mut self) -> DocId {
        if self.doc == TERMINATED {
            return TERMINATED;
        }
        self.move_to(self.pos + 1)
    }

    fn advance(&mut self, target: DocId) -> DocId {
        if self.doc >= target {
            return self.doc;
        }
        let pos = self.column.seek(self.pos, target);
        self.move_to(pos)
    }

    fn binary_value(&self) -> &[u8] {
        if self.doc == TERMINATED {
            return &[];
        }
        let entry = self.column.entry(self.pos);
        &entry[BYTES_PER_DOC..BYTES_PER_DOC + self.record_width]
    }

    fn encoding(&self) -> VectorEncoding {
        self.encoding
    }

    fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    fn cost(&self) -> u64 {
        self.column.count as u64
    }
}

/// Quantized store: one centroid record per document.
#[derive(Debug, Clone)]
pub struct QuantizedVectorStore {
    path: PathBuf,
    mmap: Arc<Mmap>,
    dimension: VectorDimension,
    centroid_count: usize,
    centroid_base: usize,
    column: DocColumn,
}

impl QuantizedVectorStore {
    /// Writes a quantized store. `centroids` are full-precision records,
    /// `assignments` are sorted by doc id.
    pub fn write(
        path: &Path,
        dimension: VectorDimension,
        centroids: &[Vec<u8>],
        assignments: &[(DocId, CentroidId)],
    ) -> SegmentResult<()> {
        let width = record_width(dimension.get(), VectorEncoding::Float32);
        if let Some(bad) = centroids.iter().find(|c| c.len() != width) {
            return Err(VectorError::MalformedLength {
                length: bad.len(),
                width,
            }
            .into());
        }

        let mut out = create_writer(path)?;
        let write = |out: &mut BufWriter<File>| -> std::io::Result<()> {
            write_header(out, QUANTIZED_MAGIC, dimension, assignments.len())?;
            out.write_u32::<LittleEndian>(centroids.len() as u32)?;
            for centroid in centroids {
                out.write_all(centroid)?;
            }
            for (doc, centroid) in assignments {
                out.write_u32::<LittleEndian>(*doc)?;
                out.write_u32::<LittleEndian>(centroid.get())?;
            }
            out.flush()
        };
        write(&mut out).map_err(|source| SegmentError::FileWrite {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Opens and validates a quantized store.
    pub fn open(path: &Path) -> SegmentResult<Self> {
        let mmap = Arc::new(map_file(path)?);
        let corrupt = |reason: String| SegmentError::corrupt(path.display(), reason);

        let header = read_header(&mmap, QUANTIZED_MAGIC).map_err(corrupt)?;
        if mmap.len() < HEADER_SIZE + 4 {
            return Err(corrupt("missing centroid count".to_string()));
        }
        let centroid_count = read_u32(&mmap, HEADER_SIZE) as usize;
        let centroid_base = HEADER_SIZE + 4;
        let centroid_width = header.dimension.get() * FULL_BYTES + MAGNITUDE_BYTES;
        let assign_base = centroid_base + centroid_count * centroid_width;
        let stride = BYTES_PER_DOC + 4;
        let expected = assign_base + header.count * stride;
        if mmap.len() != expected {
            return Err(corrupt(format!(
                "file is {} bytes, expected {expected}",
                mmap.len()
            )));
        }

        let column = DocColumn {
            mmap: Arc::clone(&mmap),
            base: assign_base,
            stride,
            count: header.count,
        };
        column.validate().map_err(corrupt)?;
        for pos in 0..column.count {
            let centroid = read_u32(&mmap, assign_base + pos * stride + BYTES_PER_DOC) as usize;
            if centroid >= centroid_count {
                return Err(corrupt(format!(
                    "centroid index {centroid} out of range at entry {pos}"
                )));
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            dimension: header.dimension,
            centroid_count,
            centroid_base,
            column,
        })
    }

    #[must_use]
    pub fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    #[must_use]
    pub fn centroid_count(&self) -> usize {
        self.centroid_count
    }

    /// Number of documents with an assignment.
    #[must_use]
    pub fn len(&self) -> usize {
        self.column.count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.column.count == 0
    }

    fn centroid_width(&self) -> usize {
        record_width(self.dimension.get(), VectorEncoding::Float32)
    }

    /// Centroid record by index.
    #[must_use]
    pub fn centroid_record(&self, centroid: CentroidId) -> Option<&[u8]> {
        if centroid.index() >= self.centroid_count {
            return None;
        }
        let width = self.centroid_width();
        let start = self.centroid_base + centroid.index() * width;
        Some(&self.mmap[start..start + width])
    }

    /// Decoded centroid vector.
    pub fn centroid(&self, centroid: CentroidId) -> SegmentResult<Option<Vec<f32>>> {
        self.centroid_record(centroid)
            .map(|record| {
                codec::decode_record(record, VectorEncoding::Float32).map_err(|e| {
                    let reason = format!("centroid {}: {e}", centroid.get());
                    SegmentError::corrupt(self.path.display(), reason)
                })
            })
            .transpose()
    }

    /// Centroid assigned to `doc`.
    #[must_use]
    pub fn assignment(&self, doc: DocId) -> Option<CentroidId> {
        self.column
            .find(doc)
            .map(|pos| CentroidId::new(read_u32(self.column.entry(pos), BYTES_PER_DOC)))
    }

    /// Opens a cursor positioned on the first document.
    #[must_use]
    pub fn cursor(&self) -> QuantizedVectorCursor {
        let mut cursor = QuantizedVectorCursor {
            column: self.column.clone(),
            dimension: self.dimension,
            centroid_base: self.centroid_base,
            centroid_width: self.centroid_width(),
            pos: 0,
            doc: TERMINATED,
        };
        cursor.move_to(0);
        cursor
    }
}

/// Cursor over a [`QuantizedVectorStore`] yielding centroid records.
#[derive(Debug)]
pub struct QuantizedVectorCursor {
    column: DocColumn,
    dimension: VectorDimension,
    centroid_base: usize,
    centroid_width: usize,
    pos: usize,
    doc: DocId,
}

impl QuantizedVectorCursor {
    fn move_to(&mut self, pos: usize) -> DocId {
        self.pos = pos;
        self.doc = if pos < self.column.count {
            self.column.doc_at(pos)
        } else {
            TERMINATED
        };
        self.doc
    }
}

impl VectorDocValues for QuantizedVectorCursor {
    fn doc_id(&self) -> DocId {
        self.doc
    }

    fn next_doc(&mut self) -> DocId {
        if self.doc == TERMINATED {
            return TERMINATED;
        }
        self.move_to(self.pos + 1)
    }

    fn advance(&mut self, target: DocId) -> DocId {
        if self.doc >= target {
            return self.doc;
        }
        let pos = self.column.seek(self.pos, target);
        self.move_to(pos)
    }

    fn binary_value(&self) -> &[u8] {
        if self.doc == TERMINATED {
            return &[];
        }
        let centroid = read_u32(self.column.entry(self.pos), BYTES_PER_DOC) as usize;
        let start = self.centroid_base + centroid * self.centroid_width;
        &self.column.mmap[start..start + self.centroid_width]
    }

    fn encoding(&self) -> VectorEncoding {
        VectorEncoding::Float32
    }

    fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    fn cost(&self) -> u64 {
        self.column.count as u64
    }
}

/// Deleted documents of one segment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveDocs {
    max_doc: DocId,
    deleted: RoaringBitmap,
}

impl LiveDocs {
    /// Every document below `max_doc` is live.
    #[must_use]
    pub fn all_live(max_doc: DocId) -> Self {
        Self {
            max_doc,
            deleted: RoaringBitmap::new(),
        }
    }

    /// Builds from a set of deleted doc ids.
    #[must_use]
    pub fn with_deleted(max_doc: DocId, deleted: RoaringBitmap) -> Self {
        Self { max_doc, deleted }
    }

    #[must_use]
    pub fn is_live(&self, doc: DocId) -> bool {
        doc < self.max_doc && !self.deleted.contains(doc)
    }

    /// Marks `doc` deleted. Returns false if it already was.
    pub fn delete(&mut self, doc: DocId) -> bool {
        self.deleted.insert(doc)
    }

    #[must_use]
    pub fn max_doc(&self) -> DocId {
        self.max_doc
    }

    #[must_use]
    pub fn num_deleted(&self) -> u64 {
        self.deleted.len()
    }

    #[must_use]
    pub fn has_deletions(&self) -> bool {
        !self.deleted.is_empty()
    }

    /// Deleted doc ids.
    #[must_use]
    pub fn deleted(&self) -> &RoaringBitmap {
        &self.deleted
    }

    /// Writes the deletion bitmap.
    pub fn write_to(&self, path: &Path) -> SegmentResult<()> {
        let mut out = create_writer(path)?;
        self.deleted
            .serialize_into(&mut out)
            .and_then(|()| out.flush())
            .map_err(|source| SegmentError::FileWrite {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Reads a deletion bitmap. A missing file means no deletions.
    pub fn open(path: &Path, max_doc: DocId) -> SegmentResult<Self> {
        if !path.exists() {
            return Ok(Self::all_live(max_doc));
        }
        let file = File::open(path).map_err(|source| SegmentError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let deleted = RoaringBitmap::deserialize_from(BufReader::new(file))
            .map_err(|e| SegmentError::corrupt(path.display(), e.to_string()))?;
        Ok(Self { max_doc, deleted })
    }
}
