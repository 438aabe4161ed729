//! Entity resolution with per-invocation caches.
//!
//! Every natural key is looked up in the cache first and only reaches the
//! store on a miss. The store's get-or-create is atomic, so the cache is an
//! accelerator only and never the source of uniqueness.

use crate::model::{
    MarketKey, PriceRow, ProductKey, RegionRecord, ResolvedEntities, SchemaVariant, VarietyKey,
};
use crate::store::PriceStore;
use anyhow::{Context, Result};
use std::collections::HashMap;
use uuid::Uuid;

/// Natural key -> id maps. Lives for one load invocation, owned by the
/// engine and lent to the [`Resolver`].
#[derive(Debug, Default)]
pub struct EntityCache {
    regions: HashMap<i32, Uuid>,
    markets: HashMap<MarketKey, Uuid>,
    subsectors: HashMap<String, Uuid>,
    products: HashMap<ProductKey, Uuid>,
    varieties: HashMap<VarietyKey, Uuid>,
}

/// Entry counts per cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub regions: usize,
    pub markets: usize,
    pub subsectors: usize,
    pub products: usize,
    pub varieties: usize,
}

impl EntityCache {
    /// Seed the region cache with every region already in the store
    pub fn warm_regions(&mut self, regions: impl IntoIterator<Item = RegionRecord>) {
        for region in regions {
            self.regions.insert(region.code, region.region_id);
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            regions: self.regions.len(),
            markets: self.markets.len(),
            subsectors: self.subsectors.len(),
            products: self.products.len(),
            varieties: self.varieties.len(),
        }
    }
}

pub struct Resolver<'a, S: PriceStore> {
    store: &'a mut S,
    cache: &'a mut EntityCache,
    variant: SchemaVariant,
}

impl<'a, S: PriceStore> Resolver<'a, S> {
    pub fn new(store: &'a mut S, cache: &'a mut EntityCache, variant: SchemaVariant) -> Self {
        Self {
            store,
            cache,
            variant,
        }
    }

    /// Resolve (or create) every entity a validated row references
    pub async fn resolve(&mut self, row: &PriceRow) -> Result<ResolvedEntities> {
        let region_id = self.region(row.region_code, &row.region).await?;

        let market_key = self.variant.market_key(region_id, &row.market);
        let market_id = self.market(market_key).await?;

        let subsector_id = if row.subsector.is_empty() {
            None
        } else {
            Some(self.subsector(&row.subsector).await?)
        };

        let product_key = self.variant.product_key(row, subsector_id);
        let product_id = self.product(product_key).await?;

        let variety_id = match self.variant.variety_key(row, product_id) {
            Some(key) => Some(self.variety(key).await?),
            None => None,
        };

        Ok(ResolvedEntities {
            region_id,
            market_id,
            subsector_id,
            product_id,
            variety_id,
        })
    }

    async fn region(&mut self, code: i32, name: &str) -> Result<Uuid> {
        if let Some(&id) = self.cache.regions.get(&code) {
            return Ok(id);
        }
        let id = self
            .store
            .get_or_create_region(code, name)
            .await
            .with_context(|| format!("region {}", code))?;
        self.cache.regions.insert(code, id);
        Ok(id)
    }

    async fn market(&mut self, key: MarketKey) -> Result<Uuid> {
        if let Some(&id) = self.cache.markets.get(&key) {
            return Ok(id);
        }
        let id = self
            .store
            .get_or_create_market(&key)
            .await
            .with_context(|| format!("market '{}'", key.name))?;
        self.cache.markets.insert(key, id);
        Ok(id)
    }

    async fn subsector(&mut self, name: &str) -> Result<Uuid> {
        if let Some(&id) = self.cache.subsectors.get(name) {
            return Ok(id);
        }
        let id = self
            .store
            .get_or_create_subsector(name)
            .await
            .with_context(|| format!("subsector '{}'", name))?;
        self.cache.subsectors.insert(name.to_string(), id);
        Ok(id)
    }

    async fn product(&mut self, key: ProductKey) -> Result<Uuid> {
        if let Some(&id) = self.cache.products.get(&key) {
            return Ok(id);
        }
        let id = self
            .store
            .get_or_create_product(&key)
            .await
            .with_context(|| format!("product '{}'", key.name))?;
        self.cache.products.insert(key, id);
        Ok(id)
    }

    async fn variety(&mut self, key: VarietyKey) -> Result<Uuid> {
        if let Some(&id) = self.cache.varieties.get(&key) {
            return Ok(id);
        }
        let id = self
            .store
            .get_or_create_variety(&key)
            .await
            .with_context(|| format!("variety '{}'", key.name))?;
        self.cache.varieties.insert(key, id);
        Ok(id)
    }
}
