//! Geographic blocking
//!
//! Composite key over (state | city | postal-code prefix), with an
//! optional great-circle radius check when records carry coordinates.

use super::{BlockingStats, BlockingStrategy, CandidatePair, PairCollector};
use crate::error::Result;
use crate::record::{Fields, Record};
use crate::storage::{EntityStore, KeyExpr};
use crate::validate::validate_collection_name;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Which fields carry the geographic keys.
#[derive(Debug, Clone, Default)]
pub struct GeographicFields {
    pub state: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    /// Prefix length applied to the postal code key.
    pub postal_prefix: u32,
}

/// Optional coordinate filter applied inside each block.
#[derive(Debug, Clone)]
pub struct RadiusCheck {
    pub lat_field: String,
    pub lon_field: String,
    pub max_km: f64,
}

pub struct GeographicStrategy {
    store: Arc<dyn EntityStore>,
    collection: String,
    fields: GeographicFields,
    radius: Option<RadiusCheck>,
    collector: PairCollector,
}

impl GeographicStrategy {
    pub fn new(
        store: Arc<dyn EntityStore>,
        collection: impl Into<String>,
        fields: GeographicFields,
    ) -> Result<Self> {
        let collection = collection.into();
        validate_collection_name(&collection)?;
        Ok(Self {
            store,
            collection,
            fields,
            radius: None,
            collector: PairCollector::new("geographic"),
        })
    }

    pub fn with_radius(mut self, radius: RadiusCheck) -> Self {
        self.radius = Some(radius);
        self
    }

    pub fn with_block_bounds(mut self, min: usize, max: usize) -> Self {
        self.collector.set_block_bounds(min, max);
        self
    }

    fn key_exprs(&self) -> Vec<KeyExpr> {
        let mut keys = Vec::new();
        if let Some(state) = &self.fields.state {
            keys.push(KeyExpr::Lower {
                field: state.clone(),
            });
        }
        if let Some(city) = &self.fields.city {
            keys.push(KeyExpr::Lower { field: city.clone() });
        }
        if let Some(postal) = &self.fields.postal_code {
            keys.push(KeyExpr::Prefix {
                field: postal.clone(),
                len: if self.fields.postal_prefix == 0 {
                    5
                } else {
                    self.fields.postal_prefix
                },
            });
        }
        keys
    }

    fn coordinates(&self, ids: &[String]) -> Result<HashMap<String, (f64, f64)>> {
        let Some(radius) = &self.radius else {
            return Ok(HashMap::new());
        };
        let records = self.store.fetch_many(
            &self.collection,
            ids,
            Some(&[radius.lat_field.clone(), radius.lon_field.clone()]),
        )?;
        let mut coords = HashMap::new();
        for record in records {
            if let (Some(lat), Some(lon)) = (
                numeric(&record, &radius.lat_field),
                numeric(&record, &radius.lon_field),
            ) {
                coords.insert(record.id.clone(), (lat, lon));
            }
        }
        Ok(coords)
    }
}

fn numeric(record: &Record, field: &str) -> Option<f64> {
    record.get(field).and_then(Value::as_f64)
}

/// Great-circle distance in kilometres.
fn haversine_km(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

impl BlockingStrategy for GeographicStrategy {
    fn name(&self) -> &str {
        "geographic"
    }

    fn generate_candidates(&mut self) -> Result<Vec<CandidatePair>> {
        let started = Instant::now();
        let keys = self.key_exprs();
        let blocks = self.store.group_blocks(&self.collection, &keys, &[])?;

        let mut out = Vec::new();
        for block in &blocks {
            self.collector.stats_mut().records_scanned += block.members.len();
            let key_fields: Fields = keys
                .iter()
                .zip(block.key.iter())
                .map(|(expr, value)| (expr.field().to_string(), Value::String(value.clone())))
                .collect();

            let mut block_pairs = Vec::new();
            self.collector
                .push_block(Some(&key_fields), &block.members, &mut block_pairs);

            if self.radius.is_some() {
                let coords = self.coordinates(&block.members)?;
                let max_km = self.radius.as_ref().map(|r| r.max_km).unwrap_or(f64::MAX);
                let before = block_pairs.len();
                block_pairs.retain(|pair| {
                    match (coords.get(&pair.a), coords.get(&pair.b)) {
                        // Pairs without both coordinates pass on key match alone.
                        (Some(&ca), Some(&cb)) => haversine_km(ca, cb) <= max_km,
                        _ => true,
                    }
                });
                self.collector.stats_mut().pairs_emitted -= before - block_pairs.len();
            }
            out.extend(block_pairs);
        }
        self.collector.stats_mut().elapsed_secs += started.elapsed().as_secs_f64();
        Ok(out)
    }

    fn statistics(&self) -> &BlockingStats {
        self.collector.stats()
    }
}
