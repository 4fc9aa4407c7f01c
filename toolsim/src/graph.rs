use std::collections::{HashMap, HashSet};
use std::time::Duration;

use desim::{ComponentId, Key, Resource, Simulation};
use itertools::Itertools;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::{
    buffer, source, AcquirePolicy, Buffer, Carrier, Combine, ConfigError, Delay, FlowStep,
    IntervalConfig, Link, LotInterval, NodeHandle, NodeStats, PredicateConfig, Select,
    SelectPredicate, SeqId, SimulationConfig, Sink, Station, Wafer, WaferLog, WaferSource,
};

/// Sliding window used for the current-throughput display.
const THROUGHPUT_WINDOW: Duration = Duration::from_secs(3600);

/// How a run of consecutive steps is realized in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    RoundRobin,
    HoldAndWait,
    Delay,
}

fn step_kind(config: &SimulationConfig, step: &FlowStep) -> Kind {
    match config.station_group(&step.station) {
        Some(group) if step.is_transfer && group.transfer_as_delay => Kind::Delay,
        Some(group) => match group.policy {
            AcquirePolicy::RoundRobin => Kind::RoundRobin,
            AcquirePolicy::HoldAndWait => Kind::HoldAndWait,
        },
        None => Kind::Delay,
    }
}

fn node_stats(
    sim: &mut Simulation,
    stats: &mut Vec<(String, usize, Key<NodeStats>)>,
    label: impl Into<String>,
    instances: usize,
) -> Key<NodeStats> {
    let key = sim.state.insert(NodeStats::default());
    stats.push((label.into(), instances, key));
    key
}

fn fork(master: &mut ChaCha8Rng) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(master.gen())
}

/// The assembled flow graph, with the handles needed to run and inspect a
/// simulation.
pub struct FlowGraph {
    /// The wafer source; schedule its first event to start the run.
    pub source: ComponentId<source::Event>,
    /// The shared wafer log.
    pub log: Key<WaferLog>,
    /// Per-node statistics, labelled for reporting, together with the number
    /// of station instances backing the node (zero for nodes that hold no
    /// instances).
    pub stats: Vec<(String, usize, Key<NodeStats>)>,
    /// The station instance resources, labelled with their names.
    pub resources: Vec<(String, Key<Resource>)>,
}

impl FlowGraph {
    /// Builds the flow graph described by `config` into `sim`.
    ///
    /// Steps are ordered by sequence ID, load/unload bookkeeping at the
    /// boundary station is skipped, and consecutive steps are grouped by
    /// their station's acquisition policy: a round-robin run becomes a chain
    /// of station nodes, a hold-and-wait run becomes a single carrier
    /// section, and transfer steps at stations configured for it become
    /// pure delays. The optional entry buffer, batching, and sampling
    /// stages are spliced in where configured.
    ///
    /// # Errors
    ///
    /// Returns an error when the configuration fails validation.
    #[allow(clippy::too_many_lines)]
    pub fn build(config: &SimulationConfig, sim: &mut Simulation) -> Result<Self, ConfigError> {
        config.validate()?;
        let steps = config.ordered_steps();
        if steps.is_empty() {
            return Err(ConfigError::EmptyFlow);
        }
        let mut master = ChaCha8Rng::seed_from_u64(config.run.seed);

        let log = sim
            .state
            .insert(WaferLog::new(sim.scheduler.clock(), THROUGHPUT_WINDOW));

        let mut resource_keys = HashMap::new();
        let mut resources = Vec::new();
        let names: Vec<String> = config
            .stations
            .iter()
            .flat_map(|group| group.instances.iter().cloned())
            .unique()
            .collect();
        for name in names {
            let key = sim.state.insert(Resource::new(name.clone(), 1));
            resource_keys.insert(name.clone(), key);
            resources.push((name, key));
        }
        let group_instances = |config: &SimulationConfig, station: &str| {
            config
                .station_group(station)
                .map(|group| {
                    group
                        .instances
                        .iter()
                        .map(|name| (name.clone(), resource_keys[name]))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        };

        let mut stats = Vec::new();

        let sink_queue = sim.add_queue::<Wafer>();
        let sink_stats = node_stats(sim, &mut stats, "SINK", 0);
        let sink = sim.add_component(Sink::new(sink_queue, log, sink_stats));
        let mut current = Link::new(sink_queue, NodeHandle::Sink(sink));

        // Segment the flow: split on policy changes and at the batching and
        // sampling stages, so each stage wraps exactly one segment.
        let mut stage_seqs = HashSet::new();
        if let Some(batching) = &config.batching {
            stage_seqs.insert(batching.before_seq);
        }
        if let Some(sampling) = &config.sampling {
            stage_seqs.insert(sampling.at_seq);
        }
        let sampled_seq = config.sampling.map(|sampling| sampling.at_seq);
        let mut segments: Vec<(Kind, Vec<FlowStep>)> = Vec::new();
        for step in steps.iter() {
            let kind = step_kind(config, step);
            let split = match segments.last() {
                None => true,
                Some((last_kind, last_steps)) => {
                    *last_kind != kind
                        || stage_seqs.contains(&step.seq_id)
                        || last_steps.last().map(|step| step.seq_id) == sampled_seq
                }
            };
            if split {
                segments.push((kind, Vec::new()));
            }
            segments
                .last_mut()
                .expect("a segment was just pushed")
                .1
                .push(step.clone());
        }

        let mut next_seq: Option<SeqId> = None;
        let mut entry_ready: Option<Key<Option<ComponentId<buffer::Event>>>> = None;
        let mut entry_capacity = usize::MAX;

        for (kind, seg_steps) in segments.iter().rev() {
            let downstream = current;
            let post_next = next_seq;
            match kind {
                Kind::RoundRobin => {
                    let mut local_next = post_next;
                    for step in seg_steps.iter().rev() {
                        let group = config.station_group(&step.station).ok_or_else(|| {
                            ConfigError::UnknownStation {
                                seq: step.seq_id,
                                station: step.station.clone(),
                            }
                        })?;
                        let queue = sim.add_queue::<Wafer>();
                        let stats_key = node_stats(
                            sim,
                            &mut stats,
                            format!("{}:{}", step.station, step.seq_id),
                            group.instances.len(),
                        );
                        let ready = sim.state.insert(None);
                        let rng = fork(&mut master);
                        let station = sim.add_component(Station::new(
                            step.clone(),
                            local_next,
                            queue,
                            current,
                            group_instances(config, &step.station),
                            Duration::from_secs_f64(group.setup),
                            ready,
                            rng,
                            log,
                            stats_key,
                        ));
                        current = Link::new(queue, NodeHandle::Station(station));
                        entry_ready = Some(ready);
                        entry_capacity = group.instances.len().max(1);
                        local_next = Some(step.seq_id);
                    }
                }
                Kind::Delay => {
                    let mut local_next = post_next;
                    for step in seg_steps.iter().rev() {
                        let queue = sim.add_queue::<Wafer>();
                        let stats_key = node_stats(
                            sim,
                            &mut stats,
                            format!("{}:{} (transfer)", step.station, step.seq_id),
                            0,
                        );
                        let rng = fork(&mut master);
                        let delay = sim.add_component(Delay::new(
                            queue,
                            current,
                            step.clone(),
                            local_next,
                            rng,
                            log,
                            stats_key,
                        ));
                        current = Link::new(queue, NodeHandle::Delay(delay));
                        entry_ready = None;
                        entry_capacity = usize::MAX;
                        local_next = Some(step.seq_id);
                    }
                }
                Kind::HoldAndWait => {
                    let queue = sim.add_queue::<Wafer>();
                    let first = seg_steps[0].seq_id;
                    let last = seg_steps[seg_steps.len() - 1].seq_id;
                    let instances = seg_steps
                        .iter()
                        .map(|step| group_instances(config, &step.station))
                        .collect::<Vec<_>>();
                    let unique_instances = instances
                        .iter()
                        .flatten()
                        .map(|(name, _)| name)
                        .unique()
                        .count();
                    let stats_key = node_stats(
                        sim,
                        &mut stats,
                        format!("SECTION {}-{}", first, last),
                        unique_instances,
                    );
                    let ready = sim.state.insert(None);
                    entry_capacity = instances[0].len().max(1);
                    let rng = fork(&mut master);
                    let carrier = sim.add_component(Carrier::new(
                        seg_steps.clone(),
                        instances,
                        post_next,
                        queue,
                        current,
                        config.hold_and_wait.max_wait(),
                        config.hold_and_wait.max_retries,
                        ready,
                        rng,
                        log,
                        stats_key,
                    ));
                    current = Link::new(queue, NodeHandle::Carrier(carrier));
                    entry_ready = Some(ready);
                }
            }
            next_seq = Some(seg_steps[0].seq_id);
            let first_seq = seg_steps[0].seq_id;

            if let Some(batching) = &config.batching {
                if batching.before_seq == first_seq {
                    let queue = sim.add_queue::<Wafer>();
                    let stats_key =
                        node_stats(sim, &mut stats, format!("COMBINE:{}", first_seq), 0);
                    let combine = sim.add_component(Combine::new(
                        queue,
                        current,
                        batching.size,
                        batching.timeout.map(Duration::from_secs_f64),
                        log,
                        stats_key,
                    ));
                    current = Link::new(queue, NodeHandle::Combine(combine));
                    entry_ready = None;
                    entry_capacity = usize::MAX;
                }
            }
            if let Some(sampling) = &config.sampling {
                if sampling.at_seq == first_seq {
                    let queue = sim.add_queue::<Wafer>();
                    let stats_key =
                        node_stats(sim, &mut stats, format!("SAMPLE:{}", first_seq), 0);
                    let predicate = match sampling.predicate {
                        PredicateConfig::Probability { probability } => {
                            SelectPredicate::Probability(probability)
                        }
                        PredicateConfig::EveryNth { period } => {
                            SelectPredicate::EveryNth { period }
                        }
                    };
                    let rng = fork(&mut master);
                    let select = sim.add_component(Select::new(
                        queue,
                        current,
                        downstream,
                        post_next,
                        predicate,
                        rng,
                        log,
                        stats_key,
                    ));
                    current = Link::new(queue, NodeHandle::Select(select));
                    entry_ready = None;
                    entry_capacity = usize::MAX;
                }
            }
        }

        if let Some(entry_buffer) = &config.entry_buffer {
            let queue = sim.add_queue::<Wafer>();
            let stats_key = node_stats(sim, &mut stats, "ENTRY", 0);
            let credits = if entry_ready.is_some() {
                entry_capacity
            } else {
                usize::MAX
            };
            let buffer = sim.add_component(Buffer::new(
                queue,
                current,
                entry_buffer.discipline,
                entry_buffer.capacity.unwrap_or(usize::MAX),
                credits,
                log,
                stats_key,
            ));
            if let Some(ready) = entry_ready {
                *sim.state
                    .get_mut(ready)
                    .expect("the ready key was just created") = Some(buffer);
            }
            current = Link::new(queue, NodeHandle::Buffer(buffer));
        }

        let interval = match config.run.lot_interval {
            IntervalConfig::Fixed { interval } => {
                LotInterval::Fixed(Duration::from_secs_f64(interval))
            }
            IntervalConfig::Exponential { mean } => {
                LotInterval::Exponential(Duration::from_secs_f64(mean))
            }
        };
        let source_stats = node_stats(sim, &mut stats, "SOURCE", 0);
        let rng = fork(&mut master);
        let source = sim.add_component(WaferSource::new(
            current,
            config.run.lot_size,
            interval,
            Duration::from_secs_f64(config.run.stagger_max),
            config.run.max_lots,
            steps[0].seq_id,
            rng,
            log,
            source_stats,
        ));

        Ok(Self {
            source,
            log,
            stats,
            resources,
        })
    }
}
