//! SKU and state resolution built from the reference workbook
//!
//! A `MappingResolver` is an immutable snapshot. Saving a sheet through the
//! `MappingRegistry` builds a new snapshot and swaps it in; anyone holding
//! the previous `Arc` keeps a consistent, if stale, view.

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info};

use crate::model::UnifiedTable;
use crate::reference::{match_region_sheet, ReferenceStore, Sheet};

/// Canonical SKU column in mapping sheets.
pub const SKU_COLUMN: &str = "SKU";
/// Raw merchant SKU column in mapping sheets.
pub const MERCHANT_SKU_COLUMN: &str = "Merchant SKU";
pub const STATE_CODE_COLUMN: &str = "State Code";
pub const STATE_NAME_COLUMN: &str = "State Name";

#[derive(Debug, Clone, Default)]
pub struct MappingResolver {
    sku_map: HashMap<String, String>,
    region_lookup: HashMap<String, String>,
    valid_region_codes: BTreeSet<String>,
    region_names: BTreeMap<String, String>,
    version: String,
}

impl MappingResolver {
    /// No SKU mappings and no region table: identity SKUs, no region filtering.
    pub fn empty() -> Self {
        Self::from_sheets(&[])
    }

    /// Build from every sheet in the store.
    pub fn from_store(store: &ReferenceStore) -> Self {
        let sheets: Vec<(String, Sheet)> = store
            .list_sheets()
            .into_iter()
            .map(|name| {
                let sheet = store.read_sheet(&name);
                (name, sheet)
            })
            .collect();
        Self::from_sheets(&sheets)
    }

    /// Build from already-read sheets, in workbook order.
    pub fn from_sheets(sheets: &[(String, Sheet)]) -> Self {
        let mut sku_map = HashMap::new();
        for (name, sheet) in sheets {
            if !sheet.has_columns(&[SKU_COLUMN, MERCHANT_SKU_COLUMN]) {
                continue;
            }
            let pairs = sheet.key_pairs(MERCHANT_SKU_COLUMN, SKU_COLUMN);
            debug!(sheet = %name, mappings = pairs.len(), "Loaded SKU mappings");
            // Later sheets overwrite earlier ones
            sku_map.extend(pairs);
        }

        let mut region_lookup = HashMap::new();
        let mut valid_region_codes = BTreeSet::new();
        let mut region_names = BTreeMap::new();

        let names: Vec<String> = sheets.iter().map(|(n, _)| n.clone()).collect();
        let region_sheet = match_region_sheet(&names)
            .and_then(|found| sheets.iter().find(|(n, _)| n == found))
            .map(|(_, sheet)| sheet);

        if let Some(sheet) = region_sheet {
            if sheet.has_columns(&[STATE_CODE_COLUMN, STATE_NAME_COLUMN]) {
                let code_col = sheet.column_index(STATE_CODE_COLUMN).unwrap_or_default();
                let codes: Vec<String> = (0..sheet.rows.len())
                    .filter_map(|i| sheet.cell(i, code_col).as_key())
                    .collect();
                let pairs = sheet.key_pairs(STATE_NAME_COLUMN, STATE_CODE_COLUMN);

                valid_region_codes.extend(codes.iter().cloned());
                for (state_name, code) in &pairs {
                    region_lookup.insert(state_name.clone(), code.clone());
                    region_names.insert(code.clone(), state_name.clone());
                }
                // Codes map to themselves, after names
                for code in &codes {
                    region_lookup.insert(code.clone(), code.clone());
                }
            }
        }

        let version = mapping_version(&sku_map, &region_lookup, &valid_region_codes);
        info!(
            skus = sku_map.len(),
            regions = valid_region_codes.len(),
            version = %version,
            "Built mapping resolver"
        );

        Self {
            sku_map,
            region_lookup,
            valid_region_codes,
            region_names,
            version,
        }
    }

    /// Canonical SKU, or the input unchanged when unmapped.
    pub fn map_sku<'a>(&'a self, raw: &'a str) -> &'a str {
        self.sku_map.get(raw).map(String::as_str).unwrap_or(raw)
    }

    /// State code for a state name or code; `None` when missing or not a
    /// valid code.
    pub fn map_region(&self, raw: Option<&str>) -> Option<&str> {
        let mapped = self.region_lookup.get(raw?.trim())?;
        self.valid_region_codes
            .contains(mapped)
            .then_some(mapped.as_str())
    }

    /// Set canonical SKUs and, when a state table exists and the input has a
    /// state column, drop rows whose state does not resolve.
    pub fn apply_to(&self, mut table: UnifiedTable) -> UnifiedTable {
        for row in &mut table.rows {
            row.sku = self.map_sku(&row.merchant_sku).to_string();
        }

        if table.has_shipping_state && self.has_region_table() {
            let before = table.rows.len();
            table.rows = table
                .rows
                .into_iter()
                .filter_map(|mut row| {
                    let code = self.map_region(row.shipping_state.as_deref())?.to_string();
                    row.shipping_state = Some(code);
                    Some(row)
                })
                .collect();
            debug!(
                dropped = before - table.rows.len(),
                "Dropped rows with unmapped shipping state"
            );
        }
        table
    }

    pub fn has_region_table(&self) -> bool {
        !self.valid_region_codes.is_empty()
    }

    /// Valid state codes, sorted.
    pub fn valid_regions(&self) -> Vec<String> {
        self.valid_region_codes.iter().cloned().collect()
    }

    /// State code to display name.
    pub fn region_names(&self) -> &BTreeMap<String, String> {
        &self.region_names
    }

    pub fn sku_mapping_count(&self) -> usize {
        self.sku_map.len()
    }

    /// Content hash of the mappings; equal resolvers share a version.
    pub fn version(&self) -> &str {
        &self.version
    }
}

fn mapping_version(
    sku_map: &HashMap<String, String>,
    region_lookup: &HashMap<String, String>,
    valid_codes: &BTreeSet<String>,
) -> String {
    let mut hasher = Sha256::new();
    let sorted_skus: BTreeMap<_, _> = sku_map.iter().collect();
    for (raw, canonical) in sorted_skus {
        hasher.update(format!("sku:{}={}\n", raw, canonical));
    }
    let sorted_regions: BTreeMap<_, _> = region_lookup.iter().collect();
    for (name, code) in sorted_regions {
        hasher.update(format!("region:{}={}\n", name, code));
    }
    for code in valid_codes {
        hasher.update(format!("valid:{}\n", code));
    }
    format!("{:x}", hasher.finalize())
}

/// Owns the reference store and the current resolver snapshot.
#[derive(Debug)]
pub struct MappingRegistry {
    store: ReferenceStore,
    current: RwLock<Arc<MappingResolver>>,
    /// Held across write and reload so snapshots swap in save order.
    save_lock: Mutex<()>,
}

impl MappingRegistry {
    pub fn open(store: ReferenceStore) -> Self {
        let resolver = MappingResolver::from_store(&store);
        Self {
            store,
            current: RwLock::new(Arc::new(resolver)),
            save_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &ReferenceStore {
        &self.store
    }

    pub fn resolver(&self) -> Arc<MappingResolver> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn sheet_names(&self) -> Vec<String> {
        self.store.list_sheets()
    }

    pub fn sheet(&self, name: &str) -> Sheet {
        self.store.sheet(name)
    }

    /// Save one sheet; on success the resolver is rebuilt from the store.
    pub fn save_sheet(&self, name: &str, sheet: &Sheet) -> bool {
        let _guard = self.save_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.store.write_sheet(name, sheet) {
            return false;
        }
        self.reload();
        true
    }

    /// Rebuild the resolver from whatever is on disk now.
    pub fn reload(&self) -> Arc<MappingResolver> {
        let fresh = Arc::new(MappingResolver::from_store(&self.store));
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = fresh.clone();
        fresh
    }
}
