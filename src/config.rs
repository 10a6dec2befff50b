//! Run configuration.
//!
//! Stored as a JSON document on disk:
//! ```json
//! {
//!   "analysis": { "percentile": 80, "threshold": 1.5 },
//!   "attributes": "TMC_Identification.csv",
//!   "extracts": [
//!     { "name": "interstate", "path": "OHINT23.csv" },
//!     { "name": "interstate_trucks", "path": "OHINTRK23.csv",
//!       "percentile": 95, "coverage_base": "interstate" }
//!   ]
//! }
//! ```
//! Relative paths are resolved against the config file's directory.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::analyzers::aggregate::AggregateConfig;
use crate::analyzers::percentile::PercentileMethod;
use crate::analyzers::score::{ReferencePolicy, ScoringConfig};
use crate::attributes::AttributeColumns;
use crate::error::{Error, Result};
use crate::ingest::ColumnMap;
use crate::period::PeriodCalendar;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub percentile: f64,
    pub percentile_method: PercentileMethod,
    pub reference: ReferencePolicy,
    pub threshold: f64,
    pub min_samples: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            percentile: 80.0,
            percentile_method: PercentileMethod::default(),
            reference: ReferencePolicy::default(),
            threshold: 1.5,
            min_samples: 1,
        }
    }
}

/// How the aggregator bounds its working set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AggregationStrategy {
    /// Whole extract in a compact table, groups scanned one at a time.
    #[default]
    InMemory,
    /// Stream the extract into on-disk partitions, one partition in memory at a time.
    Partitioned { partitions: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractConfig {
    pub name: String,
    pub path: PathBuf,
    /// Overrides `analysis.percentile` for this extract.
    #[serde(default)]
    pub percentile: Option<f64>,
    #[serde(default)]
    pub columns: Option<ColumnMap>,
    /// Overrides the run-wide attribute table.
    #[serde(default)]
    pub attributes: Option<PathBuf>,
    /// Name of the extract whose intervals this one is checked against.
    #[serde(default, alias = "backfill_from")]
    pub coverage_base: Option<String>,
}

impl ExtractConfig {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            percentile: None,
            columns: None,
            attributes: None,
            coverage_base: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub analysis: AnalysisConfig,
    pub calendar: PeriodCalendar,
    pub strategy: AggregationStrategy,
    pub columns: ColumnMap,
    pub attributes: Option<PathBuf>,
    pub attribute_columns: AttributeColumns,
    pub extracts: Vec<ExtractConfig>,
}

fn check_rank(what: &str, rank: f64) -> Result<()> {
    if !(0.0..=100.0).contains(&rank) {
        return Err(Error::InvalidConfig(format!(
            "{what} must be between 0 and 100, got {rank}"
        )));
    }
    Ok(())
}

impl RunConfig {
    /// Loads and validates the config at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: RunConfig = serde_json::from_str(&content)?;
        if let Some(base) = path.parent() {
            config.rebase(base);
        }
        config.validate()?;
        Ok(config)
    }

    fn rebase(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        if let Some(p) = self.attributes.as_mut() {
            resolve(p);
        }
        for extract in &mut self.extracts {
            resolve(&mut extract.path);
            if let Some(p) = extract.attributes.as_mut() {
                resolve(p);
            }
        }
    }

    /// Checks ranks, thresholds, extract names and coverage wiring.
    pub fn validate(&self) -> Result<()> {
        check_rank("analysis.percentile", self.analysis.percentile)?;
        if !self.analysis.threshold.is_finite() || self.analysis.threshold < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "threshold must be a non-negative number, got {}",
                self.analysis.threshold
            )));
        }
        if self.analysis.min_samples == 0 {
            return Err(Error::InvalidConfig("min_samples must be at least 1".to_string()));
        }
        if let AggregationStrategy::Partitioned { partitions: 0 } = self.strategy {
            return Err(Error::InvalidConfig("partitions must be at least 1".to_string()));
        }
        if self.analysis.reference == ReferencePolicy::FreeFlow
            && self.attribute_columns.free_flow.is_none()
        {
            return Err(Error::InvalidConfig(
                "free_flow reference needs attribute_columns.free_flow".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for extract in &self.extracts {
            if !names.insert(extract.name.as_str()) {
                return Err(Error::DuplicateExtract(extract.name.clone()));
            }
            if let Some(rank) = extract.percentile {
                check_rank(&format!("{}.percentile", extract.name), rank)?;
            }
        }

        for extract in &self.extracts {
            let Some(base) = &extract.coverage_base else {
                continue;
            };
            if matches!(self.strategy, AggregationStrategy::Partitioned { .. }) {
                return Err(Error::InvalidConfig(format!(
                    "{} checks coverage against {base}, which needs the in_memory strategy",
                    extract.name
                )));
            }
            let Some(base_cfg) = self.extract(base) else {
                return Err(Error::UnknownExtract(base.clone()));
            };
            if base_cfg.name == extract.name || base_cfg.coverage_base.is_some() {
                return Err(Error::InvalidConfig(format!(
                    "{} cannot use {base} as coverage base: a base must not have a base itself",
                    extract.name
                )));
            }
        }
        Ok(())
    }

    pub fn extract(&self, name: &str) -> Option<&ExtractConfig> {
        self.extracts.iter().find(|e| e.name == name)
    }

    pub fn columns_for<'a>(&'a self, extract: &'a ExtractConfig) -> &'a ColumnMap {
        extract.columns.as_ref().unwrap_or(&self.columns)
    }

    pub fn attributes_for<'a>(&'a self, extract: &'a ExtractConfig) -> Option<&'a Path> {
        extract.attributes.as_deref().or(self.attributes.as_deref())
    }

    pub fn aggregate_config(&self, extract: &ExtractConfig) -> AggregateConfig {
        AggregateConfig {
            percentile: extract.percentile.unwrap_or(self.analysis.percentile),
            method: self.analysis.percentile_method,
            min_samples: self.analysis.min_samples,
        }
    }

    pub fn scoring_config(&self) -> ScoringConfig {
        ScoringConfig {
            reference: self.analysis.reference,
            threshold: self.analysis.threshold,
        }
    }
}
