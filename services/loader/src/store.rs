//! Persistent store for regions, markets, products and price facts.
//!
//! Responsibilities:
//! - Atomic get-or-create for every entity, by natural key
//! - Conflict-tolerant bulk insert of facts, one transaction per call
//! - Load run ledger (one row per file processed)
//!
//! The loader talks to the store through [`PriceStore`] so the ingestion
//! engine can run against Postgres or an in-memory store in tests.

use crate::config::Config;
use crate::engine::FileReport;
use crate::model::{MarketKey, NewFact, ProductKey, RegionRecord, VarietyKey};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

/// Bootstrap DDL, every statement is `IF NOT EXISTS`
const SCHEMA_SQL: &str = include_str!("../sql/schema.sql");

/// Default number of facts sent per INSERT statement
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

#[async_trait]
pub trait PriceStore: Send {
    /// All known regions, for warming the region cache
    async fn load_regions(&mut self) -> Result<Vec<RegionRecord>>;

    /// Region by code; `name` is only used when the region is created
    async fn get_or_create_region(&mut self, code: i32, name: &str) -> Result<Uuid>;

    async fn get_or_create_market(&mut self, key: &MarketKey) -> Result<Uuid>;

    async fn get_or_create_subsector(&mut self, name: &str) -> Result<Uuid>;

    async fn get_or_create_product(&mut self, key: &ProductKey) -> Result<Uuid>;

    async fn get_or_create_variety(&mut self, key: &VarietyKey) -> Result<Uuid>;

    /// Insert facts in one transaction, `batch_size` rows per statement.
    /// Facts whose natural key already exists are dropped silently.
    /// Returns the number of rows actually inserted.
    async fn insert_facts(&mut self, facts: &[NewFact], batch_size: usize) -> Result<u64>;

    /// Open a ledger entry for a file
    async fn start_run(&mut self, file_name: &str, start_chunk: usize) -> Result<Uuid>;

    /// Close a ledger entry with the file's final counts
    async fn finish_run(&mut self, run_id: Uuid, report: &FileReport) -> Result<()>;
}

// =============================================================================
// POSTGRES
// =============================================================================

const INSERT_FACTS_SQL: &str = r#"
    INSERT INTO price_facts (
        fact_id, observed_on, region_id, market_id, product_id, subsector_id, variety_id,
        quality, unit, origin, volume, price_min, price_max, price_avg
    )
    SELECT * FROM UNNEST(
        $1::uuid[], $2::date[], $3::uuid[], $4::uuid[], $5::uuid[], $6::uuid[], $7::uuid[],
        $8::text[], $9::text[], $10::text[],
        $11::numeric[], $12::numeric[], $13::numeric[], $14::numeric[]
    )
    ON CONFLICT ON CONSTRAINT price_facts_natural_key DO NOTHING
"#;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(config: &Config) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.db_url)
            .await
            .context("Failed to connect to database")?;
        Ok(Self { pool })
    }

    /// Create missing tables and indexes
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .context("Failed to apply schema")?;
        Ok(())
    }
}

#[async_trait]
impl PriceStore for PgStore {
    async fn load_regions(&mut self) -> Result<Vec<RegionRecord>> {
        let regions = sqlx::query_as::<_, RegionRecord>("SELECT region_id, code, name FROM regions")
            .fetch_all(&self.pool)
            .await
            .context("Failed to load regions")?;
        Ok(regions)
    }

    async fn get_or_create_region(&mut self, code: i32, name: &str) -> Result<Uuid> {
        let created: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO regions (region_id, code, name) VALUES ($1, $2, $3)
            ON CONFLICT (code) DO NOTHING
            RETURNING region_id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(code)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((id,)) = created {
            return Ok(id);
        }

        let (id,): (Uuid,) = sqlx::query_as("SELECT region_id FROM regions WHERE code = $1")
            .bind(code)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    async fn get_or_create_market(&mut self, key: &MarketKey) -> Result<Uuid> {
        let created: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO markets (market_id, name, region_id) VALUES ($1, $2, $3)
            ON CONFLICT ON CONSTRAINT markets_natural_key DO NOTHING
            RETURNING market_id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&key.name)
        .bind(key.region_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((id,)) = created {
            return Ok(id);
        }

        let (id,): (Uuid,) = sqlx::query_as(
            "SELECT market_id FROM markets WHERE name = $1 AND region_id IS NOT DISTINCT FROM $2",
        )
        .bind(&key.name)
        .bind(key.region_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn get_or_create_subsector(&mut self, name: &str) -> Result<Uuid> {
        let created: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO subsectors (subsector_id, name) VALUES ($1, $2)
            ON CONFLICT (name) DO NOTHING
            RETURNING subsector_id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((id,)) = created {
            return Ok(id);
        }

        let (id,): (Uuid,) = sqlx::query_as("SELECT subsector_id FROM subsectors WHERE name = $1")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    async fn get_or_create_product(&mut self, key: &ProductKey) -> Result<Uuid> {
        let created: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO products (product_id, name, subsector_id, variety_type, quality, unit, origin)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT ON CONSTRAINT products_natural_key DO NOTHING
            RETURNING product_id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&key.name)
        .bind(key.subsector_id)
        .bind(&key.variety_type)
        .bind(&key.quality)
        .bind(&key.unit)
        .bind(&key.origin)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((id,)) = created {
            return Ok(id);
        }

        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            SELECT product_id FROM products
            WHERE name = $1 AND subsector_id IS NOT DISTINCT FROM $2
              AND variety_type = $3 AND quality = $4 AND unit = $5 AND origin = $6
            "#,
        )
        .bind(&key.name)
        .bind(key.subsector_id)
        .bind(&key.variety_type)
        .bind(&key.quality)
        .bind(&key.unit)
        .bind(&key.origin)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn get_or_create_variety(&mut self, key: &VarietyKey) -> Result<Uuid> {
        let created: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO varieties (variety_id, product_id, name) VALUES ($1, $2, $3)
            ON CONFLICT ON CONSTRAINT varieties_natural_key DO NOTHING
            RETURNING variety_id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(key.product_id)
        .bind(&key.name)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((id,)) = created {
            return Ok(id);
        }

        let (id,): (Uuid,) =
            sqlx::query_as("SELECT variety_id FROM varieties WHERE product_id = $1 AND name = $2")
                .bind(key.product_id)
                .bind(&key.name)
                .fetch_one(&self.pool)
                .await?;
        Ok(id)
    }

    async fn insert_facts(&mut self, facts: &[NewFact], batch_size: usize) -> Result<u64> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        let mut inserted = 0;

        for batch in facts.chunks(batch_size.max(1)) {
            let result = sqlx::query(INSERT_FACTS_SQL)
                .bind(batch.iter().map(|_| Uuid::new_v4()).collect::<Vec<Uuid>>())
                .bind(batch.iter().map(|f| f.observed_on).collect::<Vec<NaiveDate>>())
                .bind(batch.iter().map(|f| f.region_id).collect::<Vec<Uuid>>())
                .bind(batch.iter().map(|f| f.market_id).collect::<Vec<Uuid>>())
                .bind(batch.iter().map(|f| f.product_id).collect::<Vec<Uuid>>())
                .bind(batch.iter().map(|f| f.subsector_id).collect::<Vec<Option<Uuid>>>())
                .bind(batch.iter().map(|f| f.variety_id).collect::<Vec<Option<Uuid>>>())
                .bind(batch.iter().map(|f| f.quality.clone()).collect::<Vec<String>>())
                .bind(batch.iter().map(|f| f.unit.clone()).collect::<Vec<String>>())
                .bind(batch.iter().map(|f| f.origin.clone()).collect::<Vec<String>>())
                .bind(batch.iter().map(|f| f.volume.clone()).collect::<Vec<BigDecimal>>())
                .bind(batch.iter().map(|f| f.price_min.clone()).collect::<Vec<BigDecimal>>())
                .bind(batch.iter().map(|f| f.price_max.clone()).collect::<Vec<BigDecimal>>())
                .bind(batch.iter().map(|f| f.price_avg.clone()).collect::<Vec<BigDecimal>>())
                .execute(&mut *tx)
                .await
                .context("Failed to insert price facts")?;
            inserted += result.rows_affected();
        }

        tx.commit().await.context("Failed to commit price facts")?;
        Ok(inserted)
    }

    async fn start_run(&mut self, file_name: &str, start_chunk: usize) -> Result<Uuid> {
        let run_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO load_runs (run_id, file_name, start_chunk, status)
            VALUES ($1, $2, $3, 'running')
            "#,
        )
        .bind(run_id)
        .bind(file_name)
        .bind(start_chunk as i64)
        .execute(&self.pool)
        .await?;
        Ok(run_id)
    }

    async fn finish_run(&mut self, run_id: Uuid, report: &FileReport) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE load_runs
            SET finished_at = now(), status = $2, error = $3, chunks_committed = $4,
                rows_read = $5, facts_inserted = $6, rows_skipped = $7, skip_detail = $8
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .bind(report.status())
        .bind(report.error.as_deref())
        .bind(report.chunks_committed as i64)
        .bind(report.rows_read as i64)
        .bind(report.facts_inserted as i64)
        .bind(report.skipped.total() as i64)
        .bind(serde_json::to_value(&report.skipped)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
