//! Chunked, resumable ingestion of price-report CSV files.
//!
//! For each file in the input directory:
//! - resume after the last committed chunk (progress file)
//! - read a chunk, validate and normalise each row, resolve its entities
//! - commit the chunk's facts in one transaction
//! - checkpoint `chunk + 1` right after the commit
//!
//! Bad rows are skipped and counted. A failed commit stops the file without
//! moving its checkpoint, and the loop continues with the next file.
//! Re-running over the same input is safe: committed chunks are skipped and
//! re-sent facts are absorbed by the conflict-tolerant insert.

use crate::error::{SkipCounts, SkipReason};
use crate::model::{NewFact, PriceRow, SchemaVariant};
use crate::progress::{ProgressStore, PROGRESS_FILE_NAME};
use crate::resolver::{EntityCache, Resolver};
use crate::source::{Chunk, ChunkReader, RawRow, DEFAULT_CHUNK_SIZE};
use crate::store::{PriceStore, DEFAULT_BATCH_SIZE};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, error, info, warn};

/// Skip messages kept per chunk for the log
const MAX_SKIP_SAMPLES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderOptions {
    pub variant: SchemaVariant,
    pub chunk_size: usize,
    pub batch_size: usize,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            variant: SchemaVariant::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

// =============================================================================
// REPORTS
// =============================================================================

/// Outcome of one chunk
#[derive(Debug, Default, Clone)]
pub struct ChunkSummary {
    pub rows_read: usize,
    pub facts_built: usize,
    pub facts_inserted: u64,
    pub skipped: SkipCounts,
    /// First few skip messages, with line numbers
    pub samples: Vec<String>,
}

impl ChunkSummary {
    fn skip(&mut self, line: u64, reason: &SkipReason) {
        self.skipped.record(reason);
        if self.samples.len() < MAX_SKIP_SAMPLES {
            self.samples.push(format!("line {}: {}", line, reason));
        }
    }
}

/// Outcome of one file
#[derive(Debug, Default, Clone)]
pub struct FileReport {
    pub file_name: String,
    pub start_chunk: usize,
    pub chunks_committed: usize,
    pub rows_read: usize,
    pub facts_built: usize,
    pub facts_inserted: u64,
    pub skipped: SkipCounts,
    /// Set when the file stopped early (open, read or commit failure)
    pub error: Option<String>,
}

impl FileReport {
    fn new(file_name: &str, start_chunk: usize) -> Self {
        Self {
            file_name: file_name.to_string(),
            start_chunk,
            ..Self::default()
        }
    }

    fn absorb(&mut self, chunk: &ChunkSummary) {
        self.chunks_committed += 1;
        self.rows_read += chunk.rows_read;
        self.facts_built += chunk.facts_built;
        self.facts_inserted += chunk.facts_inserted;
        self.skipped.merge(&chunk.skipped);
    }

    /// Ledger status
    pub fn status(&self) -> &'static str {
        if self.error.is_some() {
            "failed"
        } else {
            "ok"
        }
    }

    /// Next chunk to process on a later run
    pub fn next_chunk(&self) -> usize {
        self.start_chunk + self.chunks_committed
    }
}

/// Outcome of a whole directory load
#[derive(Debug, Default, Clone)]
pub struct RunReport {
    pub files: Vec<FileReport>,
}

impl RunReport {
    pub fn facts_inserted(&self) -> u64 {
        self.files.iter().map(|f| f.facts_inserted).sum()
    }

    pub fn rows_read(&self) -> usize {
        self.files.iter().map(|f| f.rows_read).sum()
    }

    pub fn skipped(&self) -> SkipCounts {
        let mut total = SkipCounts::default();
        for file in &self.files {
            total.merge(&file.skipped);
        }
        total
    }

    pub fn failed_files(&self) -> impl Iterator<Item = &FileReport> {
        self.files.iter().filter(|f| f.error.is_some())
    }
}

// =============================================================================
// LOADER
// =============================================================================

/// Drives ingestion. Owns the store handle and the entity caches for the
/// lifetime of one load invocation.
pub struct Loader<S: PriceStore> {
    store: S,
    cache: EntityCache,
    options: LoaderOptions,
    regions_warmed: bool,
}

impl<S: PriceStore> Loader<S> {
    pub fn new(store: S, options: LoaderOptions) -> Self {
        Self {
            store,
            cache: EntityCache::default(),
            options,
            regions_warmed: false,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn cache(&self) -> &EntityCache {
        &self.cache
    }

    /// Load every `*.csv` in `dir`, in filename order, checkpointing into
    /// `dir/progreso_carga.json`.
    ///
    /// Only an unreadable progress file or directory is fatal; per-file
    /// problems are logged and recorded in the report.
    pub async fn load_directory(&mut self, dir: &Path) -> Result<RunReport> {
        let mut progress = ProgressStore::open(dir.join(PROGRESS_FILE_NAME)).await?;
        let files = list_csv_files(dir).await?;

        let mut report = RunReport::default();
        if files.is_empty() {
            warn!(dir = %dir.display(), "No CSV files found");
            return Ok(report);
        }

        info!(files = files.len(), dir = %dir.display(), "Starting load");
        self.warm_regions().await?;

        for path in files {
            let file_name = file_name_of(&path);
            if !path.exists() {
                warn!(file = %file_name, "File disappeared before processing, skipping");
                continue;
            }

            let resume_from = progress.next_chunk(&file_name);
            info!(file = %file_name, chunk = resume_from, "Processing file");

            let run_id = match self.store.start_run(&file_name, resume_from).await {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(file = %file_name, error = %format!("{:#}", e), "Could not open load run entry");
                    None
                }
            };

            let file_report = match self.run(&path, resume_from, &mut progress).await {
                Ok(r) => r,
                Err(e) => {
                    error!(file = %file_name, error = %format!("{:#}", e), "File skipped");
                    let mut failed = FileReport::new(&file_name, resume_from);
                    failed.error = Some(format!("{:#}", e));
                    failed
                }
            };

            if let Some(run_id) = run_id {
                if let Err(e) = self.store.finish_run(run_id, &file_report).await {
                    warn!(file = %file_name, error = %format!("{:#}", e), "Could not close load run entry");
                }
            }

            report.files.push(file_report);
        }

        Ok(report)
    }

    /// Pre-warm the region cache from the store, once per invocation
    pub async fn warm_regions(&mut self) -> Result<()> {
        if self.regions_warmed {
            return Ok(());
        }
        let regions = self
            .store
            .load_regions()
            .await
            .context("Failed to pre-load regions")?;
        debug!(regions = regions.len(), "Region cache warmed");
        self.cache.warm_regions(regions);
        self.regions_warmed = true;
        Ok(())
    }

    /// Load one file starting at chunk `resume_from_chunk`, persisting the
    /// checkpoint after every committed chunk.
    ///
    /// Errors are file-level (open or read failures, checkpoint write
    /// failures). A failed commit is not an error here: it ends the file
    /// and is reported in [`FileReport::error`].
    pub async fn run(
        &mut self,
        path: &Path,
        resume_from_chunk: usize,
        progress: &mut ProgressStore,
    ) -> Result<FileReport> {
        let file_name = file_name_of(path);
        let mut report = FileReport::new(&file_name, resume_from_chunk);

        let mut reader = ChunkReader::open(path, self.options.chunk_size)?;
        while reader.next_index() < resume_from_chunk {
            if !reader.skip_chunk()? {
                break;
            }
        }

        while let Some(chunk) = reader.next_chunk()? {
            let index = chunk.index;
            debug!(file = %file_name, chunk = index, rows = chunk.len(), "Chunk read");

            let (facts, mut summary) = self.build_facts(chunk).await;

            match self.store.insert_facts(&facts, self.options.batch_size).await {
                Ok(inserted) => summary.facts_inserted = inserted,
                Err(e) => {
                    error!(
                        file = %file_name,
                        chunk = index,
                        error = %format!("{:#}", e),
                        "Failed to commit chunk; checkpoint not advanced"
                    );
                    report.error = Some(format!("chunk {}: {:#}", index, e));
                    return Ok(report);
                }
            }

            progress
                .record(&file_name, index + 1)
                .await
                .with_context(|| format!("Failed to checkpoint chunk {} of {}", index, file_name))?;

            if !summary.skipped.is_empty() {
                warn!(
                    file = %file_name,
                    chunk = index,
                    skipped = summary.skipped.total(),
                    reasons = %summary.skipped,
                    "Rows skipped"
                );
                for sample in &summary.samples {
                    debug!(file = %file_name, chunk = index, "{}", sample);
                }
            }
            info!(
                file = %file_name,
                chunk = index,
                rows = summary.rows_read,
                facts = summary.facts_built,
                inserted = summary.facts_inserted,
                "Chunk committed"
            );

            report.absorb(&summary);
        }

        info!(
            file = %file_name,
            chunks = report.chunks_committed,
            inserted = report.facts_inserted,
            skipped = report.skipped.total(),
            "File complete"
        );
        Ok(report)
    }

    /// Turn a chunk into facts. Never fails: every problem is a skipped row.
    async fn build_facts(&mut self, chunk: Chunk) -> (Vec<NewFact>, ChunkSummary) {
        let mut summary = ChunkSummary {
            rows_read: chunk.len(),
            ..ChunkSummary::default()
        };
        let mut facts = Vec::with_capacity(chunk.rows.len());

        for raw in &chunk.rows {
            match self.build_fact(raw).await {
                Ok(fact) => facts.push(fact),
                Err(reason) => summary.skip(raw.line, &reason),
            }
        }

        summary.facts_built = facts.len();
        (facts, summary)
    }

    async fn build_fact(&mut self, raw: &RawRow) -> Result<NewFact, SkipReason> {
        let row = PriceRow::from_raw(raw, self.options.variant)?;

        let mut resolver = Resolver::new(&mut self.store, &mut self.cache, self.options.variant);
        let ids = resolver
            .resolve(&row)
            .await
            .map_err(|e| SkipReason::Resolution(format!("{:#}", e)))?;

        Ok(NewFact::new(&row, &ids))
    }
}

/// `*.csv` files directly inside `dir`, sorted by name
pub async fn list_csv_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to list input directory {}", dir.display()))?;

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_csv = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("csv"))
            .unwrap_or(false);
        if is_csv && entry.file_type().await?.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use crate::progress;
    use bigdecimal::BigDecimal;
    use std::str::FromStr;

    const HEADER: &str = "Fecha,ID region,Region,Mercado,Subsector,Producto,Variedad / Tipo,Calidad,Unidad de comercializacion,Origen,Volumen,Precio minimo,Precio maximo,Precio promedio";

    fn line(date: &str, region: &str, market: &str, product: &str, variety: &str) -> String {
        format!(
            "{},{},Region {},{},Hortalizas,{},{},Primera,$/kilo,Nacional,\"1.652,0000\",\"800\",\"1.200\",\"1.000,5\"",
            date, region, region, market, product, variety
        )
    }

    fn write_csv(dir: &Path, name: &str, rows: &[String]) -> PathBuf {
        let mut content = String::from("\u{feff}");
        content.push_str(HEADER);
        content.push('\n');
        for row in rows {
            content.push_str(row);
            content.push('\n');
        }
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    /// n rows with distinct dates (distinct facts)
    fn distinct_rows(n: usize) -> Vec<String> {
        (0..n)
            .map(|i| {
                let date = chrono::NaiveDate::from_ymd_opt(2023, 1, 1).unwrap()
                    + chrono::Duration::days(i as i64);
                line(&date.format("%Y-%m-%d").to_string(), "13", "Lo Valledor", "Lechuga", "Escarola")
            })
            .collect()
    }

    fn options(variant: SchemaVariant, chunk_size: usize) -> LoaderOptions {
        LoaderOptions {
            variant,
            chunk_size,
            batch_size: 2,
        }
    }

    async fn saved_progress(dir: &Path) -> progress::Progress {
        progress::load(&dir.join(PROGRESS_FILE_NAME)).await.unwrap()
    }

    // -------------------------------------------------------------------------
    // END TO END
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_three_valid_rows_and_one_missing_region() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(
            dir.path(),
            "precios.csv",
            &[
                line("2024-01-02", "13", "Lo Valledor", "Lechuga", "Escarola"),
                line("2024-01-02", "5", "Vega Monumental", "Tomate", "Larga vida"),
                line("2024-01-03", "13", "Lo Valledor", "Lechuga", "Escarola"),
                line("2024-01-03", "", "Feria Huechuraba", "Zapallo", "Camote"),
            ],
        );

        let mut loader = Loader::new(MemoryStore::new(), LoaderOptions::default());
        let report = loader.load_directory(dir.path()).await.unwrap();

        let store = loader.store();
        assert_eq!(store.facts.len(), 3);
        assert_eq!(store.regions.len(), 2);
        assert_eq!(store.markets.len(), 2);
        assert_eq!(store.products.len(), 2);
        assert!(!store.markets.keys().any(|k| k.name == "Feria Huechuraba"));
        assert!(!store.products.keys().any(|k| k.name == "Zapallo"));

        assert_eq!(report.facts_inserted(), 3);
        assert_eq!(report.skipped().get("missing_region_code"), 1);
        assert_eq!(saved_progress(dir.path()).await.next_chunk("precios.csv"), 1);
    }

    #[tokio::test]
    async fn test_facts_carry_normalized_numbers() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "a.csv", &distinct_rows(1));

        let mut loader = Loader::new(MemoryStore::new(), LoaderOptions::default());
        loader.load_directory(dir.path()).await.unwrap();

        let fact = &loader.store().facts[0];
        assert_eq!(fact.volume, BigDecimal::from(1652));
        assert_eq!(fact.price_min, BigDecimal::from(800));
        assert_eq!(fact.price_max, BigDecimal::from(1200));
        assert_eq!(fact.price_avg, BigDecimal::from_str("1000.5").unwrap());
        assert_eq!(fact.quality, "Primera");
        assert_eq!(loader.store().region_code(fact.region_id), Some(13));
    }

    // -------------------------------------------------------------------------
    // IDEMPOTENCE / RESUMABILITY
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_second_run_inserts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "a.csv", &distinct_rows(7));

        let mut loader = Loader::new(MemoryStore::new(), options(SchemaVariant::Normalized, 3));
        loader.load_directory(dir.path()).await.unwrap();
        assert_eq!(loader.store().facts.len(), 7);
        let commits = loader.store().commits;

        let second = loader.load_directory(dir.path()).await.unwrap();
        assert_eq!(loader.store().facts.len(), 7);
        assert_eq!(second.facts_inserted(), 0);
        // every chunk was already checkpointed
        assert_eq!(loader.store().commits, commits);
    }

    #[tokio::test]
    async fn test_rerun_without_progress_is_absorbed_by_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "a.csv", &distinct_rows(5));

        let mut loader = Loader::new(MemoryStore::new(), options(SchemaVariant::Flat, 2));
        loader.load_directory(dir.path()).await.unwrap();
        std::fs::remove_file(dir.path().join(PROGRESS_FILE_NAME)).unwrap();

        let second = loader.load_directory(dir.path()).await.unwrap();
        assert_eq!(second.files[0].facts_built, 5);
        assert_eq!(second.facts_inserted(), 0);
        assert_eq!(loader.store().facts.len(), 5);
    }

    #[tokio::test]
    async fn test_resume_skips_committed_chunks() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "a.csv", &distinct_rows(7));
        // chunks of 3: [0..3) [3..6) [6..7); pretend the first two committed
        std::fs::write(dir.path().join(PROGRESS_FILE_NAME), "{\"a.csv\": 2}").unwrap();

        let mut loader = Loader::new(MemoryStore::new(), options(SchemaVariant::Normalized, 3));
        let report = loader.load_directory(dir.path()).await.unwrap();

        assert_eq!(report.files[0].start_chunk, 2);
        assert_eq!(report.files[0].rows_read, 1);
        assert_eq!(loader.store().facts.len(), 1);
        assert_eq!(
            loader.store().facts[0].observed_on,
            chrono::NaiveDate::from_ymd_opt(2023, 1, 7).unwrap()
        );
        assert_eq!(saved_progress(dir.path()).await.next_chunk("a.csv"), 3);
    }

    #[tokio::test]
    async fn test_failed_commit_does_not_advance_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "a.csv", &distinct_rows(7));

        let mut loader = Loader::new(MemoryStore::new(), options(SchemaVariant::Normalized, 3));
        loader.store_mut().fail_next_commits(1);
        let report = loader.load_directory(dir.path()).await.unwrap();

        let file = &report.files[0];
        assert_eq!(file.status(), "failed");
        assert_eq!(file.chunks_committed, 0);
        assert!(file.error.as_deref().unwrap().contains("chunk 0"));
        assert_eq!(loader.store().facts.len(), 0);
        assert_eq!(saved_progress(dir.path()).await.next_chunk("a.csv"), 0);

        // next invocation retries from chunk 0 and completes
        let retry = loader.load_directory(dir.path()).await.unwrap();
        assert_eq!(retry.files[0].status(), "ok");
        assert_eq!(loader.store().facts.len(), 7);
        assert_eq!(saved_progress(dir.path()).await.next_chunk("a.csv"), 3);
    }

    #[tokio::test]
    async fn test_mid_file_failure_resumes_at_failed_chunk() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "a.csv", &distinct_rows(7));

        let mut loader = Loader::new(MemoryStore::new(), options(SchemaVariant::Normalized, 3));
        let mut progress = ProgressStore::open(dir.path().join(PROGRESS_FILE_NAME)).await.unwrap();
        let path = dir.path().join("a.csv");

        // first chunk commits, then the store starts failing
        let mut reader = ChunkReader::open(&path, 3).unwrap();
        let chunk = reader.next_chunk().unwrap().unwrap();
        let (facts, _) = loader.build_facts(chunk).await;
        loader.store_mut().insert_facts(&facts, 2).await.unwrap();
        progress.record("a.csv", 1).await.unwrap();

        loader.store_mut().fail_next_commits(1);
        let report = loader.run(&path, progress.next_chunk("a.csv"), &mut progress).await.unwrap();
        assert_eq!(report.chunks_committed, 0);
        assert_eq!(progress.next_chunk("a.csv"), 1);
        assert_eq!(loader.store().facts.len(), 3);

        let report = loader.run(&path, progress.next_chunk("a.csv"), &mut progress).await.unwrap();
        assert_eq!(report.start_chunk, 1);
        assert_eq!(report.chunks_committed, 2);
        assert_eq!(report.next_chunk(), 3);
        assert_eq!(loader.store().facts.len(), 7);

        // same final facts as an uninterrupted load
        let clean_dir = tempfile::tempdir().unwrap();
        write_csv(clean_dir.path(), "a.csv", &distinct_rows(7));
        let mut clean = Loader::new(MemoryStore::new(), options(SchemaVariant::Normalized, 3));
        clean.load_directory(clean_dir.path()).await.unwrap();

        let dates = |store: &MemoryStore| {
            let mut d: Vec<_> = store.facts.iter().map(|f| f.observed_on).collect();
            d.sort();
            d
        };
        assert_eq!(dates(loader.store()), dates(clean.store()));
    }

    #[tokio::test]
    async fn test_failed_file_does_not_stop_next_file() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "a.csv", &distinct_rows(2));
        write_csv(dir.path(), "b.csv", &[line("2022-06-01", "8", "Concepcion", "Papa", "")]);

        let mut loader = Loader::new(MemoryStore::new(), options(SchemaVariant::Normalized, 10));
        loader.store_mut().fail_next_commits(1);
        let report = loader.load_directory(dir.path()).await.unwrap();

        assert_eq!(report.files.len(), 2);
        assert_eq!(report.files[0].status(), "failed");
        assert_eq!(report.files[1].status(), "ok");
        assert_eq!(report.failed_files().count(), 1);
        assert_eq!(loader.store().facts.len(), 1);

        let progress = saved_progress(dir.path()).await;
        assert_eq!(progress.next_chunk("a.csv"), 0);
        assert_eq!(progress.next_chunk("b.csv"), 1);
    }

    // -------------------------------------------------------------------------
    // ROW-LEVEL POLICY
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_bad_rows_skipped_by_reason() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(
            dir.path(),
            "a.csv",
            &[
                line("2024-01-02", "13", "Lo Valledor", "Lechuga", ""),
                line("02/01/2024", "13", "Lo Valledor", "Papa", ""),
                line("2024-01-02", "XIII", "Lo Valledor", "Papa", ""),
                line("2024-01-02", "13", "Lo Valledor", "", ""),
                "2024-01-02,13".to_string(),
            ],
        );

        let mut loader = Loader::new(MemoryStore::new(), LoaderOptions::default());
        let report = loader.load_directory(dir.path()).await.unwrap();

        let skipped = report.skipped();
        assert_eq!(skipped.get("invalid_date"), 1);
        assert_eq!(skipped.get("invalid_region_code"), 1);
        assert_eq!(skipped.get("missing_product"), 2);
        assert_eq!(skipped.total(), 4);
        assert_eq!(report.files[0].rows_read, 5);
        assert_eq!(loader.store().facts.len(), 1);
        // the bad-date row never created its product
        assert!(!loader.store().products.keys().any(|k| k.name == "Papa"));
    }

    #[tokio::test]
    async fn test_missing_subsector_depends_on_variant() {
        let row = "2024-01-02,13,RM,Lo Valledor,,Lechuga,,Primera,$/kilo,Nacional,1,1,1,1".to_string();

        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "a.csv", &[row.clone()]);
        let mut normalized = Loader::new(MemoryStore::new(), LoaderOptions::default());
        let report = normalized.load_directory(dir.path()).await.unwrap();
        assert_eq!(report.skipped().get("missing_subsector"), 1);

        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "a.csv", &[row]);
        let mut flat = Loader::new(MemoryStore::new(), options(SchemaVariant::Flat, 10));
        flat.load_directory(dir.path()).await.unwrap();
        assert_eq!(flat.store().facts.len(), 1);
        assert_eq!(flat.store().facts[0].subsector_id, None);
    }

    #[tokio::test]
    async fn test_store_failure_skips_only_that_row() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(
            dir.path(),
            "a.csv",
            &[
                line("2024-01-02", "7", "Talca", "Papa", ""),
                line("2024-01-02", "13", "Lo Valledor", "Papa", ""),
            ],
        );

        let mut store = MemoryStore::new();
        store.broken_region_codes.insert(7);
        let mut loader = Loader::new(store, LoaderOptions::default());
        let report = loader.load_directory(dir.path()).await.unwrap();

        assert_eq!(report.skipped().get("resolution"), 1);
        assert_eq!(loader.store().facts.len(), 1);
    }

    #[tokio::test]
    async fn test_unstorable_cells_do_not_cost_the_chunk() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(
            dir.path(),
            "a.csv",
            &[
                line("2024-01-02", "13", "Lo Valledor", "Lechuga", ""),
                "2024-01-02,13,RM,Lo Valledor,Hortalizas,Papa,,Prim\0era,$/kilo,Nacional,1e20,\"1\",\"2\",\"123.456.789\"".to_string(),
            ],
        );

        let mut loader = Loader::new(MemoryStore::new(), LoaderOptions::default());
        let report = loader.load_directory(dir.path()).await.unwrap();

        assert_eq!(report.files[0].status(), "ok");
        assert!(report.skipped().is_empty());
        assert_eq!(loader.store().facts.len(), 2);

        let papa = &loader.store().facts[1];
        assert_eq!(papa.quality, "Primera");
        assert_eq!(papa.volume, BigDecimal::from(0));
        assert_eq!(papa.price_avg, BigDecimal::from(0));
        assert_eq!(papa.price_max, BigDecimal::from(2));
        assert_eq!(saved_progress(dir.path()).await.next_chunk("a.csv"), 1);
    }

    // -------------------------------------------------------------------------
    // DEDUP / CONFLICTS
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_duplicate_rows_in_chunk_insert_once() {
        let dir = tempfile::tempdir().unwrap();
        let dup = line("2024-01-02", "13", "Lo Valledor", "Lechuga", "Escarola");
        write_csv(
            dir.path(),
            "a.csv",
            &[dup.clone(), dup, line("2024-01-03", "13", "Lo Valledor", "Lechuga", "Escarola")],
        );

        let mut loader = Loader::new(MemoryStore::new(), LoaderOptions::default());
        let report = loader.load_directory(dir.path()).await.unwrap();

        assert_eq!(report.files[0].facts_built, 3);
        assert_eq!(report.facts_inserted(), 2);
        assert_eq!(loader.store().products.len(), 1);
        assert_eq!(loader.store().varieties.len(), 1);
    }

    #[tokio::test]
    async fn test_entities_shared_across_files() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "a.csv", &[line("2024-01-02", "13", "Lo Valledor", "Lechuga", "")]);
        write_csv(dir.path(), "b.csv", &[line("2024-02-02", "13", "Lo Valledor", "Lechuga", "")]);

        let mut loader = Loader::new(MemoryStore::new(), LoaderOptions::default());
        loader.load_directory(dir.path()).await.unwrap();

        let facts = &loader.store().facts;
        assert_eq!(facts.len(), 2);
        assert_eq!(facts[0].product_id, facts[1].product_id);
        assert_eq!(facts[0].market_id, facts[1].market_id);
        // region, market, subsector, product: each created once
        assert_eq!(loader.store().entity_calls, 4);
    }

    #[tokio::test]
    async fn test_conflicting_batch_counts_only_new() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "a.csv", &distinct_rows(1));
        let mut loader = Loader::new(MemoryStore::new(), LoaderOptions::default());
        loader.load_directory(dir.path()).await.unwrap();

        let existing = loader.store().facts[0].clone();
        let mut batch = vec![existing.clone()];
        for days in 1..=3 {
            let mut f = existing.clone();
            f.observed_on = existing.observed_on + chrono::Duration::days(days);
            batch.push(f);
        }

        let inserted = loader.store_mut().insert_facts(&batch, 2).await.unwrap();
        assert_eq!(inserted, 3);
        assert_eq!(loader.store().facts.len(), 4);
    }

    // -------------------------------------------------------------------------
    // DIRECTORY HANDLING
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "no csv here").unwrap();

        let mut loader = Loader::new(MemoryStore::new(), LoaderOptions::default());
        let report = loader.load_directory(dir.path()).await.unwrap();
        assert!(report.files.is_empty());
        assert!(loader.store().runs.is_empty());
    }

    #[tokio::test]
    async fn test_files_listed_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "b.csv", &[]);
        write_csv(dir.path(), "a.CSV", &[]);
        std::fs::create_dir(dir.path().join("old.csv")).unwrap();

        let files = list_csv_files(dir.path()).await.unwrap();
        let names: Vec<String> = files.iter().map(|p| file_name_of(p)).collect();
        assert_eq!(names, vec!["a.CSV", "b.csv"]);
    }

    #[tokio::test]
    async fn test_corrupt_progress_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "a.csv", &distinct_rows(1));
        std::fs::write(dir.path().join(PROGRESS_FILE_NAME), "not json").unwrap();

        let mut loader = Loader::new(MemoryStore::new(), LoaderOptions::default());
        assert!(loader.load_directory(dir.path()).await.is_err());
        assert!(loader.store().facts.is_empty());
    }

    #[tokio::test]
    async fn test_file_with_wrong_header_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.csv"), "fecha;region;precio\n2024-01-01;13;100\n").unwrap();
        write_csv(dir.path(), "b.csv", &distinct_rows(2));

        let mut loader = Loader::new(MemoryStore::new(), LoaderOptions::default());
        let report = loader.load_directory(dir.path()).await.unwrap();

        assert_eq!(report.files[0].status(), "failed");
        assert!(report.files[0].error.as_deref().unwrap().contains("Missing required columns"));
        assert_eq!(report.files[1].facts_inserted, 2);
    }

    #[tokio::test]
    async fn test_run_ledger_records_each_file() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(
            dir.path(),
            "a.csv",
            &[line("2024-01-02", "13", "Lo Valledor", "Lechuga", ""), line("2024-01-02", "", "x", "y", "")],
        );

        let mut loader = Loader::new(MemoryStore::new(), LoaderOptions::default());
        loader.load_directory(dir.path()).await.unwrap();

        let runs = &loader.store().runs;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].file_name, "a.csv");
        assert_eq!(runs[0].start_chunk, 0);
        assert_eq!(runs[0].status, "ok");
        assert_eq!(runs[0].facts_inserted, 1);
        assert_eq!(runs[0].rows_skipped, 1);
    }
}
