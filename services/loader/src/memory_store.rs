//! In-memory [`PriceStore`] with the same natural-key uniqueness as the
//! Postgres schema. Commits can be made to fail on demand.

use crate::engine::FileReport;
use crate::model::{FactKey, MarketKey, NewFact, ProductKey, RegionRecord, VarietyKey};
use crate::store::PriceStore;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub file_name: String,
    pub start_chunk: usize,
    pub status: String,
    pub facts_inserted: u64,
    pub rows_skipped: usize,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    pub regions: Vec<RegionRecord>,
    pub markets: HashMap<MarketKey, Uuid>,
    pub subsectors: HashMap<String, Uuid>,
    pub products: HashMap<ProductKey, Uuid>,
    pub varieties: HashMap<VarietyKey, Uuid>,
    pub facts: Vec<NewFact>,
    fact_keys: HashSet<FactKey>,
    pub runs: Vec<RunRecord>,
    /// get-or-create calls that reached the store
    pub entity_calls: usize,
    /// commits to fail, counted down on each `insert_facts`
    fail_commits: usize,
    /// region codes whose creation fails
    pub broken_region_codes: HashSet<i32>,
    pub commits: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_commits(&mut self, n: usize) {
        self.fail_commits = n;
    }

    pub fn region_code(&self, id: Uuid) -> Option<i32> {
        self.regions.iter().find(|r| r.region_id == id).map(|r| r.code)
    }
}

#[async_trait]
impl PriceStore for MemoryStore {
    async fn load_regions(&mut self) -> Result<Vec<RegionRecord>> {
        Ok(self.regions.clone())
    }

    async fn get_or_create_region(&mut self, code: i32, name: &str) -> Result<Uuid> {
        self.entity_calls += 1;
        if self.broken_region_codes.contains(&code) {
            anyhow::bail!("connection reset while creating region {}", code);
        }
        if let Some(r) = self.regions.iter().find(|r| r.code == code) {
            return Ok(r.region_id);
        }
        let region_id = Uuid::new_v4();
        self.regions.push(RegionRecord {
            region_id,
            code,
            name: name.to_string(),
        });
        Ok(region_id)
    }

    async fn get_or_create_market(&mut self, key: &MarketKey) -> Result<Uuid> {
        self.entity_calls += 1;
        Ok(*self.markets.entry(key.clone()).or_insert_with(Uuid::new_v4))
    }

    async fn get_or_create_subsector(&mut self, name: &str) -> Result<Uuid> {
        self.entity_calls += 1;
        Ok(*self.subsectors.entry(name.to_string()).or_insert_with(Uuid::new_v4))
    }

    async fn get_or_create_product(&mut self, key: &ProductKey) -> Result<Uuid> {
        self.entity_calls += 1;
        Ok(*self.products.entry(key.clone()).or_insert_with(Uuid::new_v4))
    }

    async fn get_or_create_variety(&mut self, key: &VarietyKey) -> Result<Uuid> {
        self.entity_calls += 1;
        Ok(*self.varieties.entry(key.clone()).or_insert_with(Uuid::new_v4))
    }

    async fn insert_facts(&mut self, facts: &[NewFact], _batch_size: usize) -> Result<u64> {
        if self.fail_commits > 0 {
            self.fail_commits -= 1;
            anyhow::bail!("could not serialize access due to concurrent update");
        }

        let mut inserted = 0;
        for fact in facts {
            if self.fact_keys.insert(fact.key()) {
                self.facts.push(fact.clone());
                inserted += 1;
            }
        }
        self.commits += 1;
        Ok(inserted)
    }

    async fn start_run(&mut self, file_name: &str, start_chunk: usize) -> Result<Uuid> {
        let run_id = Uuid::new_v4();
        self.runs.push(RunRecord {
            run_id,
            file_name: file_name.to_string(),
            start_chunk,
            status: "running".to_string(),
            facts_inserted: 0,
            rows_skipped: 0,
        });
        Ok(run_id)
    }

    async fn finish_run(&mut self, run_id: Uuid, report: &FileReport) -> Result<()> {
        if let Some(run) = self.runs.iter_mut().find(|r| r.run_id == run_id) {
            run.status = report.status().to_string();
            run.facts_inserted = report.facts_inserted;
            run.rows_skipped = report.skipped.total();
        }
        Ok(())
    }
}
