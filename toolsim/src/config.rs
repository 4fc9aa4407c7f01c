//! Simulation configuration: the process flow, the station groups, and the
//! run parameters, deserialized from a JSON file.

use std::collections::HashSet;
use std::io::Read;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{FlowStep, SeqId};

/// How a station group hands its instances to wafers.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, strum::EnumString, strum::ToString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AcquirePolicy {
    /// Wafers are assigned instances in rotation and wait in the instance
    /// queue.
    RoundRobin,
    /// A wafer keeps its current instance while racing requests to all
    /// instances of the next station, handing over only once one is granted.
    HoldAndWait,
}

/// A group of interchangeable station instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationGroup {
    /// Station ID referenced by flow steps.
    pub id: String,
    /// Names of the physical instances. Instances may be shared between
    /// groups by listing the same name in both.
    pub instances: Vec<String>,
    /// Acquisition policy of this group.
    pub policy: AcquirePolicy,
    /// Setup time added to every processing interval, in seconds.
    #[serde(default)]
    pub setup: f64,
    /// Treat transfer steps at this station as pure delays that take no
    /// instance.
    #[serde(default)]
    pub transfer_as_delay: bool,
}

/// The interval between consecutive lot releases.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IntervalConfig {
    /// Lots arrive a fixed number of seconds apart.
    Fixed {
        /// The interval in seconds.
        interval: f64,
    },
    /// Exponentially distributed inter-arrival times.
    Exponential {
        /// The mean inter-arrival time in seconds.
        mean: f64,
    },
}

/// Parameters of a single simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParams {
    /// Simulated horizon in seconds.
    pub horizon: f64,
    /// Number of wafers per lot.
    pub lot_size: usize,
    /// Interval between lot releases.
    pub lot_interval: IntervalConfig,
    /// Stop releasing lots after this many, if set.
    #[serde(default)]
    pub max_lots: Option<usize>,
    /// Seed of the random number generator; runs with equal seeds produce
    /// identical records.
    #[serde(default)]
    pub seed: u64,
    /// Upper bound of the uniform random delay between wafers of one lot,
    /// in seconds.
    #[serde(default)]
    pub stagger_max: f64,
}

impl RunParams {
    /// The simulated horizon as a duration.
    #[must_use]
    pub fn horizon(&self) -> Duration {
        Duration::from_secs_f64(self.horizon)
    }
}

/// Parameters of the hold-and-wait protocol.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HoldAndWaitConfig {
    /// How long a wafer may wait for the next station while holding its
    /// current instance before backing off, in seconds.
    pub max_wait: f64,
    /// How many times a wafer may back off and re-process its current step
    /// before it is dropped. `None` retries indefinitely.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl Default for HoldAndWaitConfig {
    fn default() -> Self {
        Self {
            max_wait: 1000.0,
            max_retries: None,
        }
    }
}

impl HoldAndWaitConfig {
    /// The wait bound as a duration.
    #[must_use]
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs_f64(self.max_wait)
    }
}

/// An optional buffer between the wafer source and the first station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryBufferConfig {
    /// Maximum number of wafers held; unbounded if `None`.
    #[serde(default)]
    pub capacity: Option<usize>,
    /// Order in which buffered wafers are released.
    #[serde(default)]
    pub discipline: crate::Discipline,
}

/// An optional batch-joining stage in front of a flow step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchingConfig {
    /// Sequence ID of the step the batch is formed for.
    pub before_seq: SeqId,
    /// Number of wafers per batch.
    pub size: usize,
    /// Force an incomplete batch through after this many seconds, if set.
    #[serde(default)]
    pub timeout: Option<f64>,
}

/// Which wafers a sampling stage lets into the sampled step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PredicateConfig {
    /// Each wafer is selected independently with this probability.
    Probability {
        /// Selection probability in `(0, 1]`.
        probability: f64,
    },
    /// Every n-th wafer is selected.
    EveryNth {
        /// The sampling period; 1 selects every wafer.
        period: u32,
    },
}

/// An optional sampling stage: only selected wafers go through the sampled
/// step, the rest skip straight past it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Sequence ID of the sampled step.
    pub at_seq: SeqId,
    /// Selection predicate.
    pub predicate: PredicateConfig,
}

/// The complete configuration of a simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// The process flow, one entry per step.
    pub flow: Vec<FlowStep>,
    /// The station groups the flow steps refer to.
    pub stations: Vec<StationGroup>,
    /// Run parameters.
    pub run: RunParams,
    /// Hold-and-wait parameters.
    #[serde(default)]
    pub hold_and_wait: HoldAndWaitConfig,
    /// Buffer between the source and the first station.
    #[serde(default)]
    pub entry_buffer: Option<EntryBufferConfig>,
    /// Batch-joining stage.
    #[serde(default)]
    pub batching: Option<BatchingConfig>,
    /// Sampling stage.
    #[serde(default)]
    pub sampling: Option<SamplingConfig>,
    /// Station marking the flow boundary; its steps are load/unload
    /// bookkeeping and are skipped when building the graph.
    #[serde(default = "default_boundary_station")]
    pub boundary_station: String,
}

fn default_boundary_station() -> String {
    String::from("LOADPORT")
}

/// Configuration validation and loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The flow has no steps.
    #[error("flow contains no steps")]
    EmptyFlow,
    /// Two flow steps share a sequence ID.
    #[error("duplicate flow step sequence ID: {0}")]
    DuplicateSeq(SeqId),
    /// Two station groups share an ID.
    #[error("station group defined more than once: {0}")]
    DuplicateStation(String),
    /// A flow step references a station that is not defined.
    #[error("flow step {seq} references unknown station: {station}")]
    UnknownStation {
        /// The offending step.
        seq: SeqId,
        /// The undefined station ID.
        station: String,
    },
    /// Lots must contain at least one wafer.
    #[error("lot size must be at least 1")]
    ZeroLotSize,
    /// Sampling probability outside of `(0, 1]`.
    #[error("sampling probability must be in (0, 1]: {0}")]
    InvalidProbability(f64),
    /// Every-nth sampling with period zero.
    #[error("sampling period must be at least 1")]
    ZeroSamplingPeriod,
    /// Non-positive hold-and-wait bound.
    #[error("hold-and-wait bound must be positive")]
    ZeroWaitBound,
    /// Batches must contain at least one wafer.
    #[error("batch size must be at least 1")]
    ZeroBatchSize,
    /// A batching or sampling stage references a step that is not in the
    /// flow.
    #[error("stage references unknown flow step: {0}")]
    UnknownStage(SeqId),
    /// The configuration file could not be read.
    #[error("failed to read configuration")]
    Io(#[from] std::io::Error),
    /// The configuration file is not valid JSON.
    #[error("failed to parse configuration")]
    Json(#[from] serde_json::Error),
}

impl SimulationConfig {
    /// Reads and validates a configuration from a JSON reader.
    ///
    /// # Errors
    ///
    /// Returns an error when reading or parsing fails, or when
    /// [`validate`](SimulationConfig::validate) rejects the parsed
    /// configuration.
    pub fn from_json<R: Read>(reader: R) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the internal consistency of the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first inconsistency found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flow.is_empty() {
            return Err(ConfigError::EmptyFlow);
        }
        let mut seqs = HashSet::new();
        for step in &self.flow {
            if !seqs.insert(step.seq_id) {
                return Err(ConfigError::DuplicateSeq(step.seq_id));
            }
            if step.station != self.boundary_station && self.station_group(&step.station).is_none()
            {
                return Err(ConfigError::UnknownStation {
                    seq: step.seq_id,
                    station: step.station.clone(),
                });
            }
        }
        let mut station_ids = HashSet::new();
        for group in &self.stations {
            if !station_ids.insert(&group.id) {
                return Err(ConfigError::DuplicateStation(group.id.clone()));
            }
        }
        if self.run.lot_size == 0 {
            return Err(ConfigError::ZeroLotSize);
        }
        if self.hold_and_wait.max_wait <= 0.0 {
            return Err(ConfigError::ZeroWaitBound);
        }
        if let Some(batching) = &self.batching {
            if batching.size == 0 {
                return Err(ConfigError::ZeroBatchSize);
            }
            if !seqs.contains(&batching.before_seq) {
                return Err(ConfigError::UnknownStage(batching.before_seq));
            }
        }
        if let Some(sampling) = &self.sampling {
            match sampling.predicate {
                PredicateConfig::Probability { probability } => {
                    if !(probability > 0.0 && probability <= 1.0) {
                        return Err(ConfigError::InvalidProbability(probability));
                    }
                }
                PredicateConfig::EveryNth { period } => {
                    if period == 0 {
                        return Err(ConfigError::ZeroSamplingPeriod);
                    }
                }
            }
            if !seqs.contains(&sampling.at_seq) {
                return Err(ConfigError::UnknownStage(sampling.at_seq));
            }
        }
        Ok(())
    }

    /// Looks up a station group by ID.
    #[must_use]
    pub fn station_group(&self, id: &str) -> Option<&StationGroup> {
        self.stations.iter().find(|group| group.id == id)
    }

    /// The flow steps in processing order, with the boundary station's
    /// load/unload steps removed.
    #[must_use]
    pub fn ordered_steps(&self) -> Vec<FlowStep> {
        let mut steps: Vec<_> = self
            .flow
            .iter()
            .filter(|step| step.station != self.boundary_station)
            .cloned()
            .collect();
        steps.sort_by_key(|step| step.seq_id);
        steps
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn config() -> SimulationConfig {
        serde_json::from_str(
            r#"{
                "flow": [
                    {"seq_id": 0, "station": "LOADPORT", "duration_mean": 0.0},
                    {"seq_id": 20, "station": "COAT", "duration_mean": 90.0, "duration_std": 5.0},
                    {"seq_id": 10, "station": "ETCH", "duration_mean": 120.0},
                    {"seq_id": 15, "station": "ETCH", "duration_mean": 3.0, "is_transfer": true}
                ],
                "stations": [
                    {"id": "ETCH", "instances": ["ETCH-1", "ETCH-2"], "policy": "hold_and_wait"},
                    {"id": "COAT", "instances": ["COAT-1"], "policy": "round_robin", "setup": 2.5}
                ],
                "run": {
                    "horizon": 3600.0,
                    "lot_size": 25,
                    "lot_interval": {"type": "fixed", "interval": 600.0},
                    "seed": 17
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_valid_config_parses() {
        let config = config();
        assert!(config.validate().is_ok());
        assert_eq!(config.boundary_station, "LOADPORT");
        assert_eq!(config.hold_and_wait.max_wait(), Duration::from_secs(1000));
        assert_eq!(config.hold_and_wait.max_retries, None);
        assert_eq!(
            config.station_group("ETCH").unwrap().policy,
            AcquirePolicy::HoldAndWait
        );
        let coat = config.station_group("COAT").unwrap();
        assert!(float_cmp::approx_eq!(f64, coat.setup, 2.5));
        assert_eq!(coat.policy, AcquirePolicy::RoundRobin);
    }

    #[test]
    fn test_steps_are_ordered_and_boundary_is_skipped() {
        let steps = config().ordered_steps();
        let seqs: Vec<_> = steps.iter().map(|step| u32::from(step.seq_id)).collect();
        assert_eq!(seqs, vec![10, 15, 20]);
    }

    #[test]
    fn test_duplicate_seq_is_rejected() {
        let mut config = config();
        config.flow[1].seq_id = SeqId::from(10);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateSeq(seq)) if seq == SeqId::from(10)
        ));
    }

    #[test]
    fn test_unknown_station_is_rejected() {
        let mut config = config();
        config.flow[1].station = String::from("CMP");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownStation { station, .. }) if station == "CMP"
        ));
    }

    #[test]
    fn test_invalid_probability_is_rejected() {
        let mut config = config();
        config.sampling = Some(SamplingConfig {
            at_seq: SeqId::from(20),
            predicate: PredicateConfig::Probability { probability: 1.5 },
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidProbability(_))
        ));
    }

    #[test]
    fn test_policy_round_trips_through_strings() {
        use std::str::FromStr;
        assert_eq!(
            AcquirePolicy::from_str("hold_and_wait").unwrap(),
            AcquirePolicy::HoldAndWait
        );
        assert_eq!(AcquirePolicy::RoundRobin.to_string(), "round_robin");
    }
}
