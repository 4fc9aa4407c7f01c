use std::io;
use std::time::Duration;

use desim::Simulation;
use indicatif::{ProgressBar, ProgressStyle};

use crate::{
    source, ConfigError, CycleTimeSummary, FlowGraph, NodeStats, SimulationConfig, WaferLog,
};

/// Statistics of one graph node after a run.
#[derive(Debug, Clone)]
pub struct NodeSummary {
    /// The node's label.
    pub label: String,
    /// The node's counters.
    pub stats: NodeStats,
    /// Fraction of the run the node's instances spent processing; zero for
    /// nodes that hold no instances.
    pub utilization: f64,
}

/// Statistics of one station instance after a run.
#[derive(Debug, Clone)]
pub struct InstanceSummary {
    /// The instance name.
    pub name: String,
    /// Total number of grants handed out.
    pub granted: u64,
    /// Units still held when the run ended.
    pub in_use: usize,
}

/// Aggregated results of a finished run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Simulated time at the end of the run.
    pub elapsed: Duration,
    /// Wafers released into the line.
    pub started: usize,
    /// Wafers that completed the flow.
    pub completed: usize,
    /// Wafers dropped with a diagnostic.
    pub dropped: usize,
    /// Wafers still in the line when the run ended.
    pub active: usize,
    /// Completed wafers per hour of simulated time.
    pub throughput_per_hour: f64,
    /// Cycle-time statistics of the completed wafers.
    pub cycle_time: CycleTimeSummary,
    /// Per-node counters.
    pub nodes: Vec<NodeSummary>,
    /// Per-instance counters.
    pub instances: Vec<InstanceSummary>,
}

/// Owns a simulation built from a configuration and runs it to the horizon.
pub struct Driver {
    sim: Simulation,
    graph: FlowGraph,
    horizon: Duration,
}

impl Driver {
    /// Builds the flow graph and schedules the first lot release.
    ///
    /// # Errors
    ///
    /// Returns an error when the configuration fails validation.
    pub fn new(config: &SimulationConfig) -> Result<Self, ConfigError> {
        let mut sim = Simulation::default();
        let graph = FlowGraph::build(config, &mut sim)?;
        sim.schedule(Duration::default(), graph.source, source::Event::NextLot);
        Ok(Self {
            sim,
            graph,
            horizon: config.run.horizon(),
        })
    }

    /// Runs until the horizon, showing run progress. Returns the simulated
    /// time at the end of the run.
    pub fn run(&mut self) -> Duration {
        let pb = ProgressBar::new(self.horizon.as_secs())
            .with_style(ProgressStyle::default_bar().template("{msg} {wide_bar} {percent}%"));
        while self.sim.scheduler.time() < self.horizon {
            let end = !self.sim.step();
            let time = self.sim.scheduler.time();
            let secs = time.as_secs();
            if pb.position() < secs {
                pb.set_position(secs);
                let log = self
                    .sim
                    .state
                    .get_mut(self.graph.log)
                    .expect("Missing wafer log in state");
                let current = log.current_throughput();
                pb.set_message(&format!(
                    "[{time}s] [A={active}] [X={dropped}] [F={finished}] [CT/h={current:.1}] [TT/h={total:.1}]",
                    time = secs,
                    active = log.active_wafers(),
                    dropped = log.dropped_wafers(),
                    finished = log.completed_wafers(),
                    current = current * 3600.0,
                    total = log.total_throughput() * 3600.0,
                ));
            }
            if end {
                pb.finish();
                return time;
            }
        }
        pb.finish();
        self.sim.scheduler.time()
    }

    /// The wafer log of this run.
    #[must_use]
    pub fn log(&self) -> &WaferLog {
        self.sim
            .state
            .get(self.graph.log)
            .expect("Missing wafer log in state")
    }

    /// Writes all processing records as CSV.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the underlying write fails.
    pub fn write_records<W: io::Write>(&self, writer: W) -> Result<(), csv::Error> {
        self.log().write_csv(writer)
    }

    /// Collects the run summary.
    #[must_use]
    pub fn summary(&self) -> RunSummary {
        let log = self.log();
        let elapsed = self.sim.scheduler.time();
        let nodes = self
            .graph
            .stats
            .iter()
            .map(|(label, instances, key)| {
                let stats = self
                    .sim
                    .state
                    .get(*key)
                    .expect("Missing node stats in state")
                    .clone();
                let utilization = if *instances > 0 {
                    stats.utilization(elapsed, *instances)
                } else {
                    0.0
                };
                NodeSummary {
                    label: label.clone(),
                    stats,
                    utilization,
                }
            })
            .collect();
        let instances = self
            .graph
            .resources
            .iter()
            .map(|(name, key)| {
                let resource = self
                    .sim
                    .state
                    .get(*key)
                    .expect("Missing instance in state");
                InstanceSummary {
                    name: name.clone(),
                    granted: resource.granted_total(),
                    in_use: resource.in_use(),
                }
            })
            .collect();
        RunSummary {
            elapsed,
            started: log.started_wafers(),
            completed: log.completed_wafers(),
            dropped: log.dropped_wafers(),
            active: log.active_wafers(),
            throughput_per_hour: log.total_throughput() * 3600.0,
            cycle_time: log.cycle_time_summary(),
            nodes,
            instances,
        }
    }
}
