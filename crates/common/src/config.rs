use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};

/// Where spilled blocks are written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpillLocation {
    /// Directory on local disk.
    Local(PathBuf),
    /// Object store url (e.g. `s3://bucket/prefix`, `memory://`).
    ObjectStore(String),
}

/// One spill tier: location plus usable byte quota (`None` = unlimited).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpillTier {
    pub location: SpillLocation,
    pub quota_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Total buffer pool size shared by all operators of one worker.
    pub memory_budget_bytes: usize,
    /// Explicit per-operator budget; defaults to an even split of the pool.
    pub operator_budget_bytes: Option<usize>,
    pub concurrent_operators: usize,
    /// Fraction (percent) over budget at which reservations fail hard.
    pub operator_error_threshold_pct: u32,
    pub spill_tiers: Vec<SpillTier>,
    pub shuffle_threshold_bytes: usize,
    pub exscan_max_groups: usize,
    pub sync_iter: usize,
    pub output_batch_size: usize,
    pub output_work_stealing: bool,
    pub max_partition_depth: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: 1024 * 1024 * 1024,
            operator_budget_bytes: None,
            concurrent_operators: 4,
            operator_error_threshold_pct: 200,
            spill_tiers: vec![SpillTier {
                location: SpillLocation::Local(env::temp_dir().join("tessera_spill")),
                quota_bytes: None,
            }],
            shuffle_threshold_bytes: 8 * 1024 * 1024,
            exscan_max_groups: 1000,
            sync_iter: 10,
            output_batch_size: 4096,
            output_work_stealing: true,
            max_partition_depth: 6,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `TESSERA_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(v) = env_parse::<usize>("TESSERA_MEMORY_BUDGET_BYTES")? {
            cfg.memory_budget_bytes = v;
        }
        if let Some(v) = env_parse::<usize>("TESSERA_OPERATOR_BUDGET_BYTES")? {
            cfg.operator_budget_bytes = Some(v);
        }
        if let Some(v) = env_parse::<usize>("TESSERA_CONCURRENT_OPERATORS")? {
            cfg.concurrent_operators = v.max(1);
        }
        if let Ok(locations) = env::var("TESSERA_SPILL_LOCATIONS") {
            let quotas = env::var("TESSERA_SPILL_QUOTA_BYTES").unwrap_or_default();
            cfg.spill_tiers = parse_spill_tiers(&locations, &quotas)?;
        }
        if let Some(v) = env_parse::<usize>("TESSERA_SHUFFLE_THRESHOLD_BYTES")? {
            cfg.shuffle_threshold_bytes = v;
        }
        if let Some(v) = env_parse::<usize>("TESSERA_EXSCAN_MAX_GROUPS")? {
            cfg.exscan_max_groups = v;
        }
        if let Some(v) = env_parse::<usize>("TESSERA_SYNC_ITER")? {
            cfg.sync_iter = v.max(1);
        }
        if let Some(v) = env_parse::<usize>("TESSERA_OUTPUT_BATCH_SIZE")? {
            cfg.output_batch_size = v.max(1);
        }
        if let Ok(v) = env::var("TESSERA_DISABLE_OUTPUT_WORK_STEALING") {
            cfg.output_work_stealing = v.trim() == "0";
        }
        if let Some(v) = env_parse::<u32>("TESSERA_MAX_PARTITION_DEPTH")? {
            cfg.max_partition_depth = v;
        }
        Ok(cfg)
    }

    /// Budget granted to a single operator instance.
    pub fn operator_budget(&self) -> usize {
        self.operator_budget_bytes
            .unwrap_or(self.memory_budget_bytes / self.concurrent_operators.max(1))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| TesseraError::InvalidConfig(format!("{key}={raw}: {e}"))),
        Err(_) => Ok(None),
    }
}

/// Parse `local:/dir,s3://bucket/x` plus a parallel comma list of quotas.
/// An empty or `-1` quota means unlimited.
pub fn parse_spill_tiers(locations: &str, quotas: &str) -> Result<Vec<SpillTier>> {
    let quotas = quotas.split(',').map(str::trim).collect::<Vec<_>>();
    let mut tiers = Vec::new();
    for (idx, raw) in locations
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .enumerate()
    {
        let location = if let Some(dir) = raw.strip_prefix("local:") {
            SpillLocation::Local(PathBuf::from(dir))
        } else if raw.contains("://") {
            SpillLocation::ObjectStore(raw.to_string())
        } else {
            return Err(TesseraError::InvalidConfig(format!(
                "unrecognized spill location '{raw}'"
            )));
        };
        let quota_bytes = match quotas.get(idx).copied() {
            None | Some("") | Some("-1") => None,
            Some(q) => Some(q.parse::<u64>().map_err(|e| {
                TesseraError::InvalidConfig(format!("spill quota '{q}': {e}"))
            })?),
        };
        tiers.push(SpillTier {
            location,
            quota_bytes,
        });
    }
    if tiers.is_empty() {
        return Err(TesseraError::InvalidConfig(
            "at least one spill location is required".to_string(),
        ));
    }
    Ok(tiers)
}
