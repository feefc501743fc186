//! Compiler configuration.
//!
//! Every section has defaults, so a TOML file only needs the keys it
//! overrides:
//!
//! ```toml
//! default_timeout_ms = 250
//!
//! [limits]
//! max_page_size = 500
//!
//! [selectivity]
//! eq = 0.05
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structural limits enforced while normalizing and validating queries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Maximum nodes in a filter tree.
    pub max_predicate_nodes: usize,
    /// Maximum nesting depth of a filter tree.
    pub max_predicate_depth: usize,
    /// Maximum operands of a set operator.
    pub max_in_values: usize,
    /// Largest accepted page size.
    pub max_page_size: u32,
    /// Page size applied when a non-aggregating query omits pagination.
    pub default_page_size: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_predicate_nodes: 10_000,
            max_predicate_depth: 256,
            max_in_values: 10_000,
            max_page_size: 1_000,
            default_page_size: 50,
        }
    }
}

/// Default selectivity per operator, used when statistics are absent.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectivityTable {
    pub eq: f64,
    pub ne: f64,
    pub range: f64,
    /// Per operand, capped at 1.
    pub in_per_value: f64,
    pub not_in: f64,
    pub contains: f64,
    pub starts_with: f64,
    pub ends_with: f64,
    pub matches: f64,
    pub is_null: f64,
    pub is_not_null: f64,
    pub array_contains: f64,
    /// Per operand, capped at 1.
    pub array_contains_any_per_value: f64,
    /// Floor applied to every estimate so costs never collapse to zero.
    pub min: f64,
}

impl Default for SelectivityTable {
    fn default() -> Self {
        Self {
            eq: 0.1,
            ne: 0.9,
            range: 0.3,
            in_per_value: 0.1,
            not_in: 0.9,
            contains: 0.25,
            starts_with: 0.2,
            ends_with: 0.25,
            matches: 0.25,
            is_null: 0.1,
            is_not_null: 0.9,
            array_contains: 0.1,
            array_contains_any_per_value: 0.1,
            min: 0.0001,
        }
    }
}

/// Per-row cost weights of the baseline cost model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostModel {
    /// Row estimate for entities without statistics.
    pub default_row_count: u64,
    /// Cost of reading one row in a full scan.
    pub scan_row_cost: f64,
    /// Cost of reading one row through an index.
    pub index_row_cost: f64,
    /// Cost of evaluating one row in an in-memory operator.
    pub memory_row_cost: f64,
    /// Cost per build or probe row of an in-memory hash join.
    pub hash_join_row_cost: f64,
    /// Right inputs estimated below this many rows use a nested-loop join.
    pub nested_loop_threshold: u64,
    /// Multiplier for `n log2 n` sort cost.
    pub sort_row_cost: f64,
    /// Discount applied to operators executed by the backend.
    pub backend_discount: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            default_row_count: 1_000,
            scan_row_cost: 1.0,
            index_row_cost: 1.0,
            memory_row_cost: 0.1,
            hash_join_row_cost: 0.2,
            nested_loop_threshold: 64,
            sort_row_cost: 0.05,
            backend_discount: 0.5,
        }
    }
}

/// Top-level compiler configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Structural limits.
    pub limits: Limits,
    /// Selectivity heuristics.
    pub selectivity: SelectivityTable,
    /// Cost weights.
    pub cost: CostModel,
    /// Deadline applied when a query sets no timeout; `None` disables it.
    pub default_timeout_ms: Option<u64>,
    /// Plan cache entries; zero disables caching.
    pub plan_cache_capacity: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            selectivity: SelectivityTable::default(),
            cost: CostModel::default(),
            default_timeout_ms: None,
            plan_cache_capacity: 256,
        }
    }
}

impl CompilerConfig {
    /// Tight limits and a short deadline for latency-sensitive gateways.
    pub fn interactive() -> Self {
        Self {
            limits: Limits {
                max_predicate_nodes: 1_000,
                max_predicate_depth: 64,
                max_in_values: 1_000,
                max_page_size: 200,
                default_page_size: 25,
            },
            default_timeout_ms: Some(100),
            ..Self::default()
        }
    }

    /// Generous limits and no deadline for offline reporting jobs.
    pub fn batch() -> Self {
        Self {
            limits: Limits {
                max_predicate_nodes: 100_000,
                max_predicate_depth: 1_024,
                max_in_values: 100_000,
                max_page_size: 1_000,
                default_page_size: 1_000,
            },
            default_timeout_ms: None,
            plan_cache_capacity: 0,
            ..Self::default()
        }
    }

    /// Parses a TOML document and validates it.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: CompilerConfig =
            toml::from_str(text).map_err(|source| ConfigError::Parse { path: None, source })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses, and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: CompilerConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: Some(path.to_path_buf()),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = &self.limits;
        if limits.max_page_size == 0 || limits.max_page_size > 1_000 {
            return Err(ConfigError::invalid("limits.max_page_size", "must be within 1..=1000"));
        }
        if limits.default_page_size == 0 || limits.default_page_size > limits.max_page_size {
            return Err(ConfigError::invalid(
                "limits.default_page_size",
                "must be within 1..=max_page_size",
            ));
        }
        if limits.max_predicate_nodes == 0 || limits.max_predicate_depth == 0 {
            return Err(ConfigError::invalid("limits", "predicate budgets must be positive"));
        }
        let sel = &self.selectivity;
        let entries = [
            ("eq", sel.eq),
            ("ne", sel.ne),
            ("range", sel.range),
            ("in_per_value", sel.in_per_value),
            ("not_in", sel.not_in),
            ("contains", sel.contains),
            ("starts_with", sel.starts_with),
            ("ends_with", sel.ends_with),
            ("matches", sel.matches),
            ("is_null", sel.is_null),
            ("is_not_null", sel.is_not_null),
            ("array_contains", sel.array_contains),
            ("array_contains_any_per_value", sel.array_contains_any_per_value),
            ("min", sel.min),
        ];
        for (name, value) in entries {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid {
                    field: format!("selectivity.{name}"),
                    reason: "must be within 0.0..=1.0".to_owned(),
                });
            }
        }
        let cost = &self.cost;
        let weights = [
            cost.scan_row_cost,
            cost.index_row_cost,
            cost.memory_row_cost,
            cost.hash_join_row_cost,
            cost.sort_row_cost,
            cost.backend_discount,
        ];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ConfigError::invalid("cost", "weights must be finite and non-negative"));
        }
        Ok(())
    }
}

/// Failures while loading configuration.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read compiler config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse compiler config{}: {source}", display_path(.path))]
    Parse {
        path: Option<PathBuf>,
        source: toml::de::Error,
    },
    #[error("invalid compiler config value {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    fn invalid(field: &str, reason: &str) -> Self {
        ConfigError::Invalid {
            field: field.to_owned(),
            reason: reason.to_owned(),
        }
    }
}

fn display_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!(" {}", path.display()),
        None => String::new(),
    }
}
