//! Domain records: validated rows, entity natural keys, and price facts.

use crate::error::SkipReason;
use crate::normalize::{normalize_text, parse_date, parse_region_code, PRICE_COLUMN, VOLUME_COLUMN};
use crate::source::RawRow;
use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// =============================================================================
// SCHEMA VARIANTS
// =============================================================================

/// How entities are identified in the store.
///
/// `Flat` keeps variety/quality/unit/origin inside the product identity and
/// scopes markets to a region. `Normalized` uses a global market, a
/// (name, subsector) product and a separate optional variety entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchemaVariant {
    Flat,
    #[default]
    Normalized,
}

impl SchemaVariant {
    pub fn requires_subsector(self) -> bool {
        matches!(self, SchemaVariant::Normalized)
    }

    pub fn market_key(self, region_id: Uuid, name: &str) -> MarketKey {
        MarketKey {
            name: name.to_string(),
            region_id: match self {
                SchemaVariant::Flat => Some(region_id),
                SchemaVariant::Normalized => None,
            },
        }
    }

    pub fn product_key(self, row: &PriceRow, subsector_id: Option<Uuid>) -> ProductKey {
        match self {
            SchemaVariant::Flat => ProductKey {
                name: row.product.clone(),
                subsector_id,
                variety_type: row.variety.clone(),
                quality: row.quality.clone(),
                unit: row.unit.clone(),
                origin: row.origin.clone(),
            },
            SchemaVariant::Normalized => ProductKey {
                name: row.product.clone(),
                subsector_id,
                ..ProductKey::default()
            },
        }
    }

    /// Variety key for a row, when this variant tracks varieties as entities
    pub fn variety_key(self, row: &PriceRow, product_id: Uuid) -> Option<VarietyKey> {
        match self {
            SchemaVariant::Normalized if !row.variety.is_empty() => Some(VarietyKey {
                product_id,
                name: row.variety.clone(),
            }),
            _ => None,
        }
    }
}

impl FromStr for SchemaVariant {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "flat" => Ok(SchemaVariant::Flat),
            "normalized" | "normalised" => Ok(SchemaVariant::Normalized),
            other => anyhow::bail!("Unknown schema variant '{}'. Expected 'flat' or 'normalized'", other),
        }
    }
}

impl fmt::Display for SchemaVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaVariant::Flat => write!(f, "flat"),
            SchemaVariant::Normalized => write!(f, "normalized"),
        }
    }
}

// =============================================================================
// VALIDATED ROW
// =============================================================================

/// A row that passed validation, with every cell normalised
#[derive(Debug, Clone, PartialEq)]
pub struct PriceRow {
    pub line: u64,
    pub date: NaiveDate,
    pub region_code: i32,
    pub region: String,
    pub market: String,
    pub subsector: String,
    pub product: String,
    pub variety: String,
    pub quality: String,
    pub unit: String,
    pub origin: String,
    pub volume: BigDecimal,
    pub price_min: BigDecimal,
    pub price_max: BigDecimal,
    pub price_avg: BigDecimal,
}

impl PriceRow {
    /// Validate and normalise a raw row.
    ///
    /// Every check happens here, before any entity is resolved, so a
    /// rejected row never leaves entities behind.
    pub fn from_raw(raw: &RawRow, variant: SchemaVariant) -> Result<Self, SkipReason> {
        let region_code = parse_region_code(&raw.region_code)?;

        let product = normalize_text(&raw.product);
        if product.is_empty() {
            return Err(SkipReason::MissingProduct);
        }

        let subsector = normalize_text(&raw.subsector);
        if subsector.is_empty() && variant.requires_subsector() {
            return Err(SkipReason::MissingSubsector);
        }

        let date = parse_date(&raw.date)
            .ok_or_else(|| SkipReason::InvalidDate(raw.date.trim().to_string()))?;

        Ok(Self {
            line: raw.line,
            date,
            region_code,
            region: normalize_text(&raw.region),
            market: normalize_text(&raw.market),
            subsector,
            product,
            variety: normalize_text(&raw.variety),
            quality: normalize_text(&raw.quality),
            unit: normalize_text(&raw.unit),
            origin: normalize_text(&raw.origin),
            volume: VOLUME_COLUMN.normalize(&raw.volume),
            price_min: PRICE_COLUMN.normalize(&raw.price_min),
            price_max: PRICE_COLUMN.normalize(&raw.price_max),
            price_avg: PRICE_COLUMN.normalize(&raw.price_avg),
        })
    }
}

// =============================================================================
// ENTITY KEYS
// =============================================================================

/// Region as stored, used to pre-warm the region cache
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct RegionRecord {
    pub region_id: Uuid,
    pub code: i32,
    pub name: String,
}

/// Market identity. `region_id` is `None` for global markets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MarketKey {
    pub name: String,
    pub region_id: Option<Uuid>,
}

/// Product identity: every field takes part in equality
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ProductKey {
    pub name: String,
    pub subsector_id: Option<Uuid>,
    pub variety_type: String,
    pub quality: String,
    pub unit: String,
    pub origin: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VarietyKey {
    pub product_id: Uuid,
    pub name: String,
}

/// Entity ids a row resolved to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedEntities {
    pub region_id: Uuid,
    pub market_id: Uuid,
    pub subsector_id: Option<Uuid>,
    pub product_id: Uuid,
    pub variety_id: Option<Uuid>,
}

// =============================================================================
// FACTS
// =============================================================================

/// A price/volume observation ready for the fact writer
#[derive(Debug, Clone, PartialEq)]
pub struct NewFact {
    pub observed_on: NaiveDate,
    pub region_id: Uuid,
    pub market_id: Uuid,
    pub product_id: Uuid,
    pub subsector_id: Option<Uuid>,
    pub variety_id: Option<Uuid>,
    pub quality: String,
    pub unit: String,
    pub origin: String,
    pub volume: BigDecimal,
    pub price_min: BigDecimal,
    pub price_max: BigDecimal,
    pub price_avg: BigDecimal,
}

/// Columns of the `price_facts` uniqueness constraint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FactKey {
    pub observed_on: NaiveDate,
    pub region_id: Uuid,
    pub market_id: Uuid,
    pub product_id: Uuid,
    pub variety_id: Option<Uuid>,
    pub quality: String,
    pub unit: String,
    pub origin: String,
}

impl NewFact {
    pub fn new(row: &PriceRow, ids: &ResolvedEntities) -> Self {
        Self {
            observed_on: row.date,
            region_id: ids.region_id,
            market_id: ids.market_id,
            product_id: ids.product_id,
            subsector_id: ids.subsector_id,
            variety_id: ids.variety_id,
            quality: row.quality.clone(),
            unit: row.unit.clone(),
            origin: row.origin.clone(),
            volume: row.volume.clone(),
            price_min: row.price_min.clone(),
            price_max: row.price_max.clone(),
            price_avg: row.price_avg.clone(),
        }
    }

    pub fn key(&self) -> FactKey {
        FactKey {
            observed_on: self.observed_on,
            region_id: self.region_id,
            market_id: self.market_id,
            product_id: self.product_id,
            variety_id: self.variety_id,
            quality: self.quality.clone(),
            unit: self.unit.clone(),
            origin: self.origin.clone(),
        }
    }
}
