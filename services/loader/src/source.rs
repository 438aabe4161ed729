//! Chunked CSV source for price reports.
//!
//! Responsibilities:
//! - Map the fixed report header onto column positions
//! - Stream the file in fixed-size blocks of rows (chunks)
//! - Skip already-committed chunks without decoding them
//! - Decode cells as UTF-8 (BOM-aware, lossy on invalid bytes)
//!
//! Expected columns (comma delimiter, any order):
//!   Fecha,ID region,Region,Mercado,Subsector,Producto,Variedad / Tipo,Calidad,
//!   Unidad de comercializacion,Origen,Volumen,Precio minimo,Precio maximo,Precio promedio

use crate::normalize::fold_header;
use anyhow::{Context, Result};
use csv::ByteRecord;
use encoding_rs::UTF_8;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Rows per chunk unless configured otherwise
pub const DEFAULT_CHUNK_SIZE: usize = 50_000;

/// Report header columns, in the order [`RawRow`] stores them
pub const EXPECTED_COLUMNS: [&str; 14] = [
    "Fecha",
    "ID region",
    "Region",
    "Mercado",
    "Subsector",
    "Producto",
    "Variedad / Tipo",
    "Calidad",
    "Unidad de comercializacion",
    "Origen",
    "Volumen",
    "Precio minimo",
    "Precio maximo",
    "Precio promedio",
];

const COL_DATE: usize = 0;
const COL_REGION_CODE: usize = 1;
const COL_REGION: usize = 2;
const COL_MARKET: usize = 3;
const COL_SUBSECTOR: usize = 4;
const COL_PRODUCT: usize = 5;
const COL_VARIETY: usize = 6;
const COL_QUALITY: usize = 7;
const COL_UNIT: usize = 8;
const COL_ORIGIN: usize = 9;
const COL_VOLUME: usize = 10;
const COL_PRICE_MIN: usize = 11;
const COL_PRICE_MAX: usize = 12;
const COL_PRICE_AVG: usize = 13;

/// Position of every expected column in the file's header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMap {
    positions: [usize; 14],
}

impl ColumnMap {
    /// Build the map from decoded header names. Fails when any expected
    /// column is absent, since no row of such a file could be loaded.
    pub fn from_headers(headers: &[String]) -> Result<Self> {
        let folded: Vec<String> = headers.iter().map(|h| fold_header(h)).collect();
        let mut positions = [0usize; 14];
        let mut missing = Vec::new();

        for (slot, expected) in EXPECTED_COLUMNS.iter().enumerate() {
            let wanted = fold_header(expected);
            match folded.iter().position(|h| *h == wanted) {
                Some(idx) => positions[slot] = idx,
                None => missing.push(*expected),
            }
        }

        if !missing.is_empty() {
            anyhow::bail!(
                "Missing required columns {:?}. Headers found: {:?}",
                missing,
                headers
            );
        }

        Ok(Self { positions })
    }

    fn cell(&self, record: &ByteRecord, slot: usize) -> String {
        record
            .get(self.positions[slot])
            .map(|bytes| UTF_8.decode_without_bom_handling(bytes).0.into_owned())
            .unwrap_or_default()
    }

    fn row(&self, record: &ByteRecord, line: u64) -> RawRow {
        RawRow {
            line,
            date: self.cell(record, COL_DATE),
            region_code: self.cell(record, COL_REGION_CODE),
            region: self.cell(record, COL_REGION),
            market: self.cell(record, COL_MARKET),
            subsector: self.cell(record, COL_SUBSECTOR),
            product: self.cell(record, COL_PRODUCT),
            variety: self.cell(record, COL_VARIETY),
            quality: self.cell(record, COL_QUALITY),
            unit: self.cell(record, COL_UNIT),
            origin: self.cell(record, COL_ORIGIN),
            volume: self.cell(record, COL_VOLUME),
            price_min: self.cell(record, COL_PRICE_MIN),
            price_max: self.cell(record, COL_PRICE_MAX),
            price_avg: self.cell(record, COL_PRICE_AVG),
        }
    }
}

/// One CSV row as decoded text, before normalisation.
/// Cells missing from a short row are empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRow {
    /// 1-indexed line in the source file (header is line 1)
    pub line: u64,
    pub date: String,
    pub region_code: String,
    pub region: String,
    pub market: String,
    pub subsector: String,
    pub product: String,
    pub variety: String,
    pub quality: String,
    pub unit: String,
    pub origin: String,
    pub volume: String,
    pub price_min: String,
    pub price_max: String,
    pub price_avg: String,
}

/// A fixed-size block of rows, committed as one unit
#[derive(Debug, Default)]
pub struct Chunk {
    pub index: usize,
    pub rows: Vec<RawRow>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Streams a CSV source as consecutive [`Chunk`]s
pub struct ChunkReader<R: Read> {
    reader: csv::Reader<R>,
    columns: ColumnMap,
    chunk_size: usize,
    next_index: usize,
    exhausted: bool,
    record: ByteRecord,
}

impl ChunkReader<File> {
    /// Open a CSV file and validate its header
    pub fn open(path: &Path, chunk_size: usize) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open CSV file {}", path.display()))?;
        Self::from_reader(file, chunk_size)
            .with_context(|| format!("Failed to read header of {}", path.display()))
    }
}

impl<R: Read> ChunkReader<R> {
    pub fn from_reader(source: R, chunk_size: usize) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b',')
            .has_headers(true)
            .flexible(true)
            .from_reader(source);

        let headers: Vec<String> = reader
            .byte_headers()
            .context("Failed to read CSV headers")?
            .iter()
            .enumerate()
            .map(|(i, raw)| {
                let decoded = if i == 0 {
                    UTF_8.decode_with_bom_removal(raw).0
                } else {
                    UTF_8.decode_without_bom_handling(raw).0
                };
                decoded.trim_start_matches('\u{feff}').trim().to_string()
            })
            .collect();

        let columns = ColumnMap::from_headers(&headers)?;

        Ok(Self {
            reader,
            columns,
            chunk_size: chunk_size.max(1),
            next_index: 0,
            exhausted: false,
            record: ByteRecord::new(),
        })
    }

    /// Index of the chunk the next call will produce or skip
    pub fn next_index(&self) -> usize {
        self.next_index
    }

    /// Advance past one chunk without decoding it.
    /// Returns false once the source has no more records.
    pub fn skip_chunk(&mut self) -> Result<bool> {
        if self.exhausted {
            return Ok(false);
        }

        let mut seen = 0;
        while seen < self.chunk_size {
            match self.reader.read_byte_record(&mut self.record) {
                Ok(true) => seen += 1,
                Ok(false) => {
                    self.exhausted = true;
                    break;
                }
                Err(e) => return Err(e).context("Failed to read CSV while skipping chunk"),
            }
        }

        if seen == 0 {
            return Ok(false);
        }
        self.next_index += 1;
        Ok(true)
    }

    /// Read the next chunk, or `None` once the source is exhausted.
    /// The reader is flexible, so only I/O failures surface as errors:
    /// short, long or oddly quoted rows still come through as rows.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.exhausted {
            return Ok(None);
        }

        let mut chunk = Chunk {
            index: self.next_index,
            rows: Vec::with_capacity(self.chunk_size.min(DEFAULT_CHUNK_SIZE)),
        };

        while chunk.len() < self.chunk_size {
            match self.reader.read_byte_record(&mut self.record) {
                Ok(true) => {
                    let line = self.record.position().map(|p| p.line()).unwrap_or(0);
                    chunk.rows.push(self.columns.row(&self.record, line));
                }
                Ok(false) => {
                    self.exhausted = true;
                    break;
                }
                Err(e) => {
                    return Err(e).context(format!("Failed to read CSV chunk {}", chunk.index))
                }
            }
        }

        if chunk.is_empty() {
            return Ok(None);
        }
        self.next_index += 1;
        Ok(Some(chunk))
    }
}
