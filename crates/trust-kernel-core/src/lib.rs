use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// Capacity of the per-agent recent quality sample window.
pub const RECENT_SCORE_CAPACITY: usize = 50;

const DEFAULT_MAX_HISTORY_SIZE: usize = 5000;
const DEFAULT_DECAY_FACTOR: f64 = 0.05;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TrustError {
    #[error("invalid event: {0}")]
    InvalidEvent(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Terminal validation status of a proposal, as reported by the
/// upstream proposal pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Accepted,
    Rejected,
    Vetoed,
}

impl ProposalStatus {
    /// True only for [`ProposalStatus::Accepted`]; vetoed proposals
    /// count as failures.
    #[must_use]
    pub fn accepted(self) -> bool {
        matches!(self, Self::Accepted)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Vetoed => "vetoed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            "vetoed" => Some(Self::Vetoed),
            _ => None,
        }
    }
}

/// Outcome record submitted by the proposal pipeline, one per
/// finalized proposal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProposalOutcomeInput {
    pub proposal_id: String,
    pub agent_id: String,
    pub status: ProposalStatus,
    pub quality_score: Option<f64>,
    #[serde(default)]
    pub failure_tags: BTreeSet<String>,
}

impl ProposalOutcomeInput {
    /// Validates an outcome record before ingestion.
    ///
    /// # Errors
    /// Returns [`TrustError::InvalidEvent`] when required identifiers
    /// are missing or the quality score is out of range.
    pub fn validate(&self) -> Result<(), TrustError> {
        if self.proposal_id.trim().is_empty() {
            return Err(TrustError::InvalidEvent(
                "proposal_id MUST be provided".to_string(),
            ));
        }

        if self.agent_id.trim().is_empty() {
            return Err(TrustError::InvalidEvent(
                "agent_id MUST be provided".to_string(),
            ));
        }

        if let Some(score) = self.quality_score {
            if !(0.0..=1.0).contains(&score) {
                return Err(TrustError::InvalidEvent(
                    "quality_score MUST be in [0.0, 1.0]".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Stored outcome event. Immutable once accepted; `recorded_seq` and
/// `recorded_at` are assigned by the index, never by the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProposalOutcomeEvent {
    pub recorded_seq: u64,
    pub recorded_at: OffsetDateTime,
    pub proposal_id: String,
    pub agent_id: String,
    pub status: ProposalStatus,
    pub quality_score: Option<f64>,
    pub failure_tags: BTreeSet<String>,
}

/// Construction parameters for [`HistoryIndex`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryConfig {
    #[serde(default = "default_max_history_size")]
    pub max_history_size: usize,
    #[serde(default = "default_decay_factor")]
    pub decay_factor: f64,
}

fn default_max_history_size() -> usize {
    DEFAULT_MAX_HISTORY_SIZE
}

fn default_decay_factor() -> f64 {
    DEFAULT_DECAY_FACTOR
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_history_size: DEFAULT_MAX_HISTORY_SIZE,
            decay_factor: DEFAULT_DECAY_FACTOR,
        }
    }
}

impl HistoryConfig {
    /// Validates retention and decay bounds.
    ///
    /// # Errors
    /// Returns [`TrustError::Configuration`] when a field is outside
    /// allowed bounds.
    pub fn validate(&self) -> Result<(), TrustError> {
        if self.max_history_size == 0 {
            return Err(TrustError::Configuration(
                "max_history_size MUST be >= 1".to_string(),
            ));
        }

        if !(self.decay_factor > 0.0 && self.decay_factor < 1.0) {
            return Err(TrustError::Configuration(
                "decay_factor MUST be in (0.0, 1.0)".to_string(),
            ));
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
            TrustError::Configuration(format!("invalid history config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}

/// Long-lived per-agent trust memory. Created lazily on the first
/// event for an agent and never evicted.
#[derive(Debug, Clone, Default, PartialEq)]
struct AgentAggregate {
    success_count: u64,
    failure_count: u64,
    weighted_average_rate: f64,
    recent_scores: VecDeque<f64>,
}

/// Aggregate view over one agent's history, as consumed by the
/// scoring pipeline and the downstream admission gate.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct AgentStats {
    pub raw_rate: f64,
    pub recent_weight: f64,
    pub total_proposals: u64,
    pub weighted_trust_score: f64,
}

/// Bounded, decay-aware outcome history with O(1) ingestion and O(1)
/// aggregate queries.
///
/// Four coupled indices: a by-ID event map, a temporal FIFO eviction
/// queue, per-agent aggregates, and per-failure-tag counters. The
/// temporal queue and by-ID map always hold the same entries, at most
/// `max_history_size` of them. Agent aggregates are cumulative trust
/// memory and are never rolled back on eviction.
#[derive(Debug, Clone)]
pub struct HistoryIndex {
    config: HistoryConfig,
    next_seq: u64,
    by_id: HashMap<String, ProposalOutcomeEvent>,
    temporal_queue: VecDeque<String>,
    agents: HashMap<String, AgentAggregate>,
    failure_tags: HashMap<String, u64>,
    total_failure_count: u64,
}

impl HistoryIndex {
    /// Creates an index, failing fast on an invalid configuration.
    ///
    /// # Errors
    /// Returns [`TrustError::Configuration`] when the configuration
    /// violates bounds.
    pub fn new(config: HistoryConfig) -> Result<Self, TrustError> {
        config.validate()?;
        Ok(Self {
            config,
            next_seq: 0,
            by_id: HashMap::new(),
            temporal_queue: VecDeque::new(),
            agents: HashMap::new(),
            failure_tags: HashMap::new(),
            total_failure_count: 0,
        })
    }

    /// Ingests one outcome record, updating all four indices and
    /// evicting the oldest entries past capacity. Returns the
    /// sequence number assigned to the stored event.
    ///
    /// # Errors
    /// Returns [`TrustError::InvalidEvent`] for malformed records and
    /// duplicate proposal IDs. Rejected records mutate nothing.
    pub fn record_event(&mut self, input: ProposalOutcomeInput) -> Result<u64, TrustError> {
        input.validate()?;

        if self.by_id.contains_key(&input.proposal_id) {
            return Err(TrustError::InvalidEvent(format!(
                "duplicate proposal_id: {}",
                input.proposal_id
            )));
        }

        self.next_seq += 1;
        let event = ProposalOutcomeEvent {
            recorded_seq: self.next_seq,
            recorded_at: now_utc(),
            proposal_id: input.proposal_id,
            agent_id: input.agent_id,
            status: input.status,
            quality_score: input.quality_score,
            failure_tags: input.failure_tags,
        };

        let accepted = event.status.accepted();
        let contribution = event
            .quality_score
            .unwrap_or(if accepted { 1.0 } else { 0.0 });

        let aggregate = self.agents.entry(event.agent_id.clone()).or_default();
        aggregate.weighted_average_rate = ema(
            aggregate.weighted_average_rate,
            contribution,
            self.config.decay_factor,
        );

        if let Some(score) = event.quality_score {
            aggregate.recent_scores.push_back(score);
            while aggregate.recent_scores.len() > RECENT_SCORE_CAPACITY {
                let _ = aggregate.recent_scores.pop_front();
            }
        }

        if accepted {
            aggregate.success_count += 1;
        } else {
            aggregate.failure_count += 1;
            self.total_failure_count += 1;
            for tag in &event.failure_tags {
                *self.failure_tags.entry(tag.clone()).or_insert(0) += 1;
            }
        }

        let seq = event.recorded_seq;
        self.temporal_queue.push_back(event.proposal_id.clone());
        self.by_id.insert(event.proposal_id.clone(), event);
        self.evict_over_capacity();

        Ok(seq)
    }

    // Oldest-first eviction. Tag counts and the failure total are
    // rolled back for evicted failure events; agent aggregates are not.
    fn evict_over_capacity(&mut self) {
        while self.temporal_queue.len() > self.config.max_history_size {
            let Some(oldest_id) = self.temporal_queue.pop_front() else {
                break;
            };
            let Some(event) = self.by_id.remove(&oldest_id) else {
                continue;
            };

            if event.status.accepted() {
                continue;
            }

            self.total_failure_count = self.total_failure_count.saturating_sub(1);
            for tag in &event.failure_tags {
                let remove = match self.failure_tags.get_mut(tag) {
                    Some(count) => {
                        *count = count.saturating_sub(1);
                        *count == 0
                    }
                    None => false,
                };
                if remove {
                    let _ = self.failure_tags.remove(tag);
                }
            }
        }
    }

    /// Aggregate view over one agent. Unknown agents yield all zeros,
    /// never an error.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn agent_stats(&self, agent_id: &str) -> AgentStats {
        let Some(aggregate) = self.agents.get(agent_id) else {
            return AgentStats::default();
        };

        let total_proposals = aggregate.success_count + aggregate.failure_count;
        let raw_rate = if total_proposals == 0 {
            0.0
        } else {
            aggregate.success_count as f64 / total_proposals as f64
        };
        let recent_weight = if aggregate.recent_scores.is_empty() {
            0.0
        } else {
            aggregate.recent_scores.iter().sum::<f64>() / aggregate.recent_scores.len() as f64
        };

        AgentStats {
            raw_rate,
            recent_weight,
            total_proposals,
            weighted_trust_score: aggregate.weighted_average_rate,
        }
    }

    /// Normalized frequency of a failure tag among currently-retained
    /// failure events, in [0, 1]. Zero when no failures are retained
    /// or the tag is absent.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn failure_pattern_bias(&self, tag: &str) -> f64 {
        if self.total_failure_count == 0 {
            return 0.0;
        }
        let count = self.failure_tags.get(tag).copied().unwrap_or(0);
        count as f64 / self.total_failure_count as f64
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    #[must_use]
    pub fn contains_proposal(&self, proposal_id: &str) -> bool {
        self.by_id.contains_key(proposal_id)
    }

    #[must_use]
    pub fn max_history_size(&self) -> usize {
        self.config.max_history_size
    }

    #[must_use]
    pub fn decay_factor(&self) -> f64 {
        self.config.decay_factor
    }

    /// Number of failure events currently retained in the window.
    #[must_use]
    pub fn total_failure_count(&self) -> u64 {
        self.total_failure_count
    }

    /// Ordered snapshot of the failure-tag counters.
    #[must_use]
    pub fn failure_tag_counts(&self) -> BTreeMap<String, u64> {
        self.failure_tags
            .iter()
            .map(|(tag, count)| (tag.clone(), *count))
            .collect()
    }
}

/// Cloneable handle sharing one [`HistoryIndex`] across threads.
///
/// `record_event` holds the write lock for the whole ingest-plus-
/// eviction critical section, so readers never observe a partially
/// evicted state. Queries run concurrently under the read lock.
#[derive(Debug, Clone)]
pub struct SharedHistoryIndex {
    inner: Arc<RwLock<HistoryIndex>>,
}

impl SharedHistoryIndex {
    /// Creates a shared index.
    ///
    /// # Errors
    /// Returns [`TrustError::Configuration`] when the configuration
    /// violates bounds.
    pub fn new(config: HistoryConfig) -> Result<Self, TrustError> {
        Ok(Self {
            inner: Arc::new(RwLock::new(HistoryIndex::new(config)?)),
        })
    }

    /// Ingests one outcome record under the write lock.
    ///
    /// # Errors
    /// Returns [`TrustError::InvalidEvent`] for malformed records and
    /// duplicate proposal IDs.
    pub fn record_event(&self, input: ProposalOutcomeInput) -> Result<u64, TrustError> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .record_event(input)
    }

    #[must_use]
    pub fn agent_stats(&self, agent_id: &str) -> AgentStats {
        self.with_read(|index| index.agent_stats(agent_id))
    }

    #[must_use]
    pub fn failure_pattern_bias(&self, tag: &str) -> f64 {
        self.with_read(|index| index.failure_pattern_bias(tag))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.with_read(HistoryIndex::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.with_read(HistoryIndex::is_empty)
    }

    /// Runs a closure over a consistent read snapshot of the index.
    pub fn with_read<R>(&self, reader: impl FnOnce(&HistoryIndex) -> R) -> R {
        reader(&self.inner.read().unwrap_or_else(PoisonError::into_inner))
    }
}

// Exponential moving average over per-event quality contributions.
// The formula is fixed and stateless; no plugin indirection.
fn ema(previous: f64, observation: f64, alpha: f64) -> f64 {
    alpha * observation + (1.0 - alpha) * previous
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}
