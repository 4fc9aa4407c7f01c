//! Wafer flow simulation across semiconductor tool stations.

#![warn(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications
)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::default_trait_access)]

use std::time::Duration;

use derive_more::{Display, From, Into};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

mod buffer;
pub use buffer::{Buffer, Discipline, Event as BufferEvent};

mod carrier;
pub use carrier::{Carrier, Event as CarrierEvent};

mod combine;
pub use combine::{Combine, Event as CombineEvent};

mod config;
pub use config::{
    AcquirePolicy, BatchingConfig, ConfigError, EntryBufferConfig, HoldAndWaitConfig,
    IntervalConfig, PredicateConfig, RunParams, SamplingConfig, SimulationConfig, StationGroup,
};

mod delay;
pub use delay::{Delay, Event as DelayEvent};

mod driver;
pub use driver::{Driver, InstanceSummary, NodeSummary, RunSummary};

mod graph;
pub use graph::FlowGraph;

mod node;
pub use node::{Link, NodeHandle, NodeStats};

mod select;
pub use select::{Event as SelectEvent, Select, SelectPredicate};

mod sink;
pub use sink::{Event as SinkEvent, Sink};

mod source;
pub use source::{Event as SourceEvent, LotInterval, WaferSource};

mod station;
pub use station::{Event as StationEvent, Station};

mod wafer_log;
pub use wafer_log::{CompletedWafer, CycleTimeSummary, DroppedWafer, WaferLog};

/// Wafer ID, unique throughout a simulation.
#[derive(
    From,
    Into,
    Debug,
    PartialEq,
    PartialOrd,
    Eq,
    Ord,
    Serialize,
    Deserialize,
    Copy,
    Clone,
    Hash,
    Display,
)]
pub struct WaferId(usize);

/// Lot ID. Wafers are released into the line in lots.
#[derive(
    From,
    Into,
    Debug,
    PartialEq,
    PartialOrd,
    Eq,
    Ord,
    Serialize,
    Deserialize,
    Copy,
    Clone,
    Hash,
    Display,
)]
pub struct LotId(usize);

/// Sequence ID of a flow step. Steps are processed in increasing order.
#[derive(
    From,
    Into,
    Debug,
    PartialEq,
    PartialOrd,
    Eq,
    Ord,
    Serialize,
    Deserialize,
    Copy,
    Clone,
    Hash,
    Display,
)]
pub struct SeqId(u32);

/// A wafer travelling through the flow graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wafer {
    /// Unique wafer ID.
    pub id: WaferId,
    /// The lot this wafer was released in.
    pub lot: LotId,
    /// When the wafer entered the line.
    pub created: Duration,
    /// Sequence ID of the next flow step this wafer expects.
    pub seq: SeqId,
}

/// One row of the wafer processing history: a wafer occupied a station
/// instance over a time interval.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingRecord {
    /// The processed wafer.
    pub wafer: WaferId,
    /// The wafer's lot.
    pub lot: LotId,
    /// Station the step belongs to.
    pub station: String,
    /// Sequence ID of the flow step.
    pub seq: SeqId,
    /// Name of the station instance that was held, or `-` when the step took
    /// no instance (instantaneous steps).
    pub resource: String,
    /// Interval start, in seconds of simulation time.
    #[serde(serialize_with = "serialize_secs")]
    pub start: Duration,
    /// Interval end, in seconds of simulation time.
    #[serde(serialize_with = "serialize_secs")]
    pub end: Duration,
}

fn serialize_secs<S: serde::Serializer>(
    duration: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

impl ProcessingRecord {
    /// Length of the recorded interval.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

/// One step of the process flow, read from the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStep {
    /// Sequence ID; steps run in increasing order of this value.
    pub seq_id: SeqId,
    /// ID of the station group performing this step.
    pub station: String,
    /// Mean processing time in seconds.
    pub duration_mean: f64,
    /// Standard deviation of the processing time in seconds.
    #[serde(default)]
    pub duration_std: f64,
    /// Lower bound of the sampled processing time in seconds.
    #[serde(default)]
    pub duration_min: f64,
    /// Transfer steps model wafer movement rather than processing.
    #[serde(default)]
    pub is_transfer: bool,
}

impl FlowStep {
    /// Samples a processing time for this step: normally distributed around
    /// the mean, truncated from below at the configured minimum. A
    /// non-positive mean yields a zero duration.
    pub fn sample_duration<R: Rng>(&self, rng: &mut R) -> Duration {
        if self.duration_mean <= 0.0 {
            return Duration::default();
        }
        let sampled = match Normal::new(self.duration_mean, self.duration_std) {
            Ok(normal) => normal.sample(rng),
            Err(_) => self.duration_mean,
        };
        Duration::from_secs_f64(sampled.max(self.duration_min).max(0.0))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn step(mean: f64, std: f64, min: f64) -> FlowStep {
        FlowStep {
            seq_id: SeqId::from(10),
            station: String::from("ETCH"),
            duration_mean: mean,
            duration_std: std,
            duration_min: min,
            is_transfer: false,
        }
    }

    #[test]
    fn test_zero_mean_step_takes_no_time() {
        let mut rng = ChaCha8Rng::seed_from_u64(17);
        assert_eq!(
            step(0.0, 1.0, 0.0).sample_duration(&mut rng),
            Duration::default()
        );
    }

    #[test]
    fn test_sampled_duration_is_truncated_at_min() {
        let mut rng = ChaCha8Rng::seed_from_u64(17);
        let step = step(5.0, 100.0, 4.0);
        for _ in 0..1000 {
            assert!(step.sample_duration(&mut rng) >= Duration::from_secs_f64(4.0));
        }
    }

    #[test]
    fn test_zero_std_is_deterministic() {
        let mut rng = ChaCha8Rng::seed_from_u64(17);
        let step = step(5.0, 0.0, 0.0);
        assert_eq!(
            step.sample_duration(&mut rng),
            Duration::from_secs_f64(5.0)
        );
    }
}
