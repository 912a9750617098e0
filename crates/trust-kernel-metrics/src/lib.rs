#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use trust_kernel_core::{AgentStats, HistoryIndex, TrustError};

/// Allowed deviation of the performance weight sum from 1.0.
pub const WEIGHT_SUM_TOLERANCE: f64 = 0.01;
/// Lower clamp of every calibrated trust score.
pub const SCORE_FLOOR: f64 = 0.01;

const SCORE_CEILING: f64 = 1.0;
const NEUTRAL_SCORE: f64 = 0.5;
const SPARSE_DEVIATION_DAMPING: f64 = 0.5;
const ADJUSTMENT_GAIN: f64 = 3.0;

/// Blend weights over an agent's raw success rate and recent decayed
/// quality. Must sum to 1.0 within [`WEIGHT_SUM_TOLERANCE`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PerformanceWeights {
    pub raw_rate: f64,
    pub recent_decay: f64,
}

/// Volume gate for the confidence normalization stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct VolumeNormalization {
    /// Below this proposal count the sparse-data short-circuit applies.
    pub min_confidence_threshold: u64,
    /// Fraction of the history window at which confidence saturates,
    /// in (0, 1].
    pub max_confidence_proportion: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsConfig {
    pub performance_weights: PerformanceWeights,
    pub volume_normalization: VolumeNormalization,
    #[serde(default)]
    pub context_weights: BTreeMap<String, f64>,
    pub low_score_threshold: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            performance_weights: PerformanceWeights {
                raw_rate: 0.65,
                recent_decay: 0.35,
            },
            volume_normalization: VolumeNormalization {
                min_confidence_threshold: 10,
                max_confidence_proportion: 0.5,
            },
            context_weights: BTreeMap::new(),
            low_score_threshold: 0.6,
        }
    }
}

impl MetricsConfig {
    /// Validates all scoring parameters. A weight sum outside the
    /// tolerance is a hard error, never clamped: silent skew in a
    /// trust-scoring engine is a governance risk.
    ///
    /// # Errors
    /// Returns [`TrustError::Configuration`] when one or more fields
    /// are outside allowed bounds.
    pub fn validate(&self) -> Result<(), TrustError> {
        for (name, value) in [
            ("performance_weights.raw_rate", self.performance_weights.raw_rate),
            (
                "performance_weights.recent_decay",
                self.performance_weights.recent_decay,
            ),
            ("low_score_threshold", self.low_score_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(TrustError::Configuration(format!(
                    "{name} MUST be in [0.0, 1.0]"
                )));
            }
        }

        let weight_sum = self.performance_weights.raw_rate + self.performance_weights.recent_decay;
        if (weight_sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(TrustError::Configuration(format!(
                "performance weights MUST sum to 1.0 +/- {WEIGHT_SUM_TOLERANCE}, got {weight_sum}"
            )));
        }

        let proportion = self.volume_normalization.max_confidence_proportion;
        if !(proportion > 0.0 && proportion <= 1.0) {
            return Err(TrustError::Configuration(
                "max_confidence_proportion MUST be in (0.0, 1.0]".to_string(),
            ));
        }

        for (context, weight) in &self.context_weights {
            if !weight.is_finite() || *weight < 0.0 {
                return Err(TrustError::Configuration(format!(
                    "context weight for {context} MUST be finite and >= 0.0"
                )));
            }
        }

        Ok(())
    }

    /// Decodes and validates a configuration from JSON.
    ///
    /// # Errors
    /// Returns [`TrustError::Configuration`] when JSON decoding fails
    /// or decoded values violate bounds.
    pub fn from_json(value: &Value) -> Result<Self, TrustError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            TrustError::Configuration(format!("invalid metrics config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}

/// Deterministic scoring pipeline over [`HistoryIndex`] snapshots.
///
/// Holds nothing but its validated, immutable configuration; a single
/// instance is safe to share across all callers. Each call reads one
/// aggregate snapshot from the index, so concurrent calls may observe
/// different (individually consistent) snapshots.
#[derive(Debug, Clone)]
pub struct MetricsEngine {
    config: MetricsConfig,
}

impl MetricsEngine {
    /// Builds an engine, failing fast on an invalid configuration.
    ///
    /// # Errors
    /// Returns [`TrustError::Configuration`] when the configuration
    /// violates bounds.
    pub fn new(config: MetricsConfig) -> Result<Self, TrustError> {
        config.validate()?;
        Ok(Self { config })
    }

    #[must_use]
    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Calibrated trust score for one (agent, context) pair, in
    /// [0.01, 1.0].
    ///
    /// Pipeline: sparse-data short-circuit, performance blend, volume
    /// confidence normalization, contextual modulation with quadratic
    /// criticality dampening, clamp.
    #[must_use]
    pub fn calibrated_trust_score(
        &self,
        history: &HistoryIndex,
        agent_id: &str,
        context: &str,
    ) -> f64 {
        let stats = history.agent_stats(agent_id);
        self.calibrate(&stats, history.max_history_size(), context)
    }

    #[allow(clippy::cast_precision_loss)]
    fn calibrate(&self, stats: &AgentStats, max_history_size: usize, context: &str) -> f64 {
        let volume = self.config.volume_normalization;

        // Deliberately under-confident on sparse data: halve the
        // deviation from neutral instead of trusting the raw rate.
        if stats.total_proposals < volume.min_confidence_threshold {
            if stats.raw_rate <= NEUTRAL_SCORE {
                return NEUTRAL_SCORE;
            }
            return NEUTRAL_SCORE + (stats.raw_rate - NEUTRAL_SCORE) * SPARSE_DEVIATION_DAMPING;
        }

        let weights = self.config.performance_weights;
        let mut score = weights.raw_rate * stats.raw_rate + weights.recent_decay * stats.recent_weight;

        let window_fill = stats.total_proposals as f64 / max_history_size as f64;
        let confidence = (window_fill / volume.max_confidence_proportion).min(1.0);
        score = NEUTRAL_SCORE + (score - NEUTRAL_SCORE) * confidence;

        let multiplier = self
            .config
            .context_weights
            .get(context)
            .copied()
            .unwrap_or(1.0);
        if (multiplier - 1.0).abs() > f64::EPSILON {
            score = NEUTRAL_SCORE + (score - NEUTRAL_SCORE) * multiplier;
            if multiplier > 1.0 && score < self.config.low_score_threshold {
                // Larger shortfalls in high-criticality contexts are
                // punished super-linearly.
                let shortfall = self.config.low_score_threshold - score;
                score -= (multiplier - 1.0) * shortfall * shortfall;
            }
        }

        score.clamp(SCORE_FLOOR, SCORE_CEILING)
    }

    /// Risk-weighting multiplier for one failure pattern, in
    /// [1.0, 4.0]. Monotonic and convex in the pattern's bias.
    #[must_use]
    pub fn dynamic_adjustment(&self, history: &HistoryIndex, tag: &str) -> f64 {
        let bias = history.failure_pattern_bias(tag);
        1.0 + ADJUSTMENT_GAIN * bias * bias
    }
}
