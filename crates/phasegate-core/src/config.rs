//! Configuration management for Phasegate
//!
//! Budget defaults, the worker tier price table, detector tuning and the default
//! phase layout. Loaded from `.phasegate/config.toml` in the project root.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::workflow::{DEFAULT_PHASES, DEFAULT_THRESHOLDS};
use crate::{PhasegateError, Result};

/// Directory holding config, journal and activity log
pub const STATE_DIR: &str = ".phasegate";

/// Project-level Phasegate configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhasegateConfig {
    /// Budget defaults for new workflows
    #[serde(default)]
    pub budget: BudgetConfig,

    /// Price per million tokens, keyed by worker tier
    #[serde(default = "default_pricing")]
    pub pricing: BTreeMap<String, TierPrice>,

    /// Loop/staleness detection tuning
    #[serde(default)]
    pub detector: DetectorConfig,

    /// Default phase layout
    #[serde(default)]
    pub phases: PhaseConfig,
}

/// Budget defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Budget applied when a workflow spec does not carry one
    #[serde(default = "default_budget_usd")]
    pub default_budget_usd: f64,

    /// Warning thresholds as fractions of the budget
    #[serde(default = "default_thresholds")]
    pub thresholds: Vec<f64>,
}

/// USD per million tokens for one tier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierPrice {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl TierPrice {
    pub fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    /// Cost in USD of the given token counts
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        input_tokens as f64 / 1_000_000.0 * self.input_per_million
            + output_tokens as f64 / 1_000_000.0 * self.output_per_million
    }
}

/// Loop/staleness detector tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Number of most recent progress entries inspected
    #[serde(default = "default_window")]
    pub window: usize,

    /// Seconds without an update before an in-progress task counts as stale
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

/// Default phase layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseConfig {
    #[serde(default = "default_sequence")]
    pub sequence: Vec<String>,

    /// Phases whose tasks freeze once approved
    #[serde(default = "default_immutable")]
    pub immutable: Vec<String>,
}

// Default value providers
fn default_budget_usd() -> f64 {
    10.0
}

fn default_thresholds() -> Vec<f64> {
    DEFAULT_THRESHOLDS.to_vec()
}

fn default_pricing() -> BTreeMap<String, TierPrice> {
    let mut pricing = BTreeMap::new();
    pricing.insert("opus".to_string(), TierPrice::new(15.0, 75.0));
    pricing.insert("sonnet".to_string(), TierPrice::new(3.0, 15.0));
    pricing.insert("haiku".to_string(), TierPrice::new(0.80, 4.0));
    pricing
}

fn default_window() -> usize {
    4
}

fn default_stale_after_secs() -> u64 {
    30 * 60
}

fn default_sequence() -> Vec<String> {
    DEFAULT_PHASES.iter().map(|p| p.to_string()).collect()
}

fn default_immutable() -> Vec<String> {
    vec!["TEST_IMPL".to_string()]
}

impl PhasegateConfig {
    /// Load configuration from `.phasegate/config.toml` or use defaults
    pub fn load_or_default(root: &Path) -> Result<Self> {
        let config_path = root.join(STATE_DIR).join("config.toml");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Self::parse(&content)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse and validate configuration text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| PhasegateError::Config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write default configuration to `.phasegate/config.toml`
    pub fn write_default(root: &Path) -> Result<()> {
        let config_dir = root.join(STATE_DIR);
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| PhasegateError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.detector.window == 0 {
            return Err(PhasegateError::Config(
                "detector.window must be at least 1".to_string(),
            ));
        }
        if self.pricing.is_empty() {
            return Err(PhasegateError::Config(
                "pricing must define at least one tier".to_string(),
            ));
        }
        for (tier, price) in &self.pricing {
            if price.input_per_million < 0.0 || price.output_per_million < 0.0 {
                return Err(PhasegateError::Config(format!(
                    "pricing for tier '{}' must not be negative",
                    tier
                )));
            }
        }
        for phase in &self.phases.immutable {
            if !self.phases.sequence.contains(phase) {
                return Err(PhasegateError::Config(format!(
                    "immutable phase '{}' is not in the phase sequence",
                    phase
                )));
            }
        }
        Ok(())
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.detector.stale_after_secs)
    }
}

impl Default for PhasegateConfig {
    fn default() -> Self {
        Self {
            budget: BudgetConfig::default(),
            pricing: default_pricing(),
            detector: DetectorConfig::default(),
            phases: PhaseConfig::default(),
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            default_budget_usd: default_budget_usd(),
            thresholds: default_thresholds(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            sequence: default_sequence(),
            immutable: default_immutable(),
        }
    }
}
