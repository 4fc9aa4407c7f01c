use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::time::Duration;

use desim::ClockRef;

use crate::{ProcessingRecord, Wafer, WaferId};

/// A completed wafer together with the time it left the line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedWafer {
    /// The wafer.
    pub wafer: Wafer,
    /// When the wafer reached the sink.
    pub finished: Duration,
}

impl CompletedWafer {
    /// Time the wafer spent in the line.
    #[must_use]
    pub fn cycle_time(&self) -> Duration {
        self.finished - self.wafer.created
    }
}

/// A wafer dropped before completion, with the diagnostic reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedWafer {
    /// The wafer.
    pub wafer: Wafer,
    /// When the wafer was dropped.
    pub time: Duration,
    /// Why it was dropped.
    pub reason: String,
}

/// Cycle-time statistics over all completed wafers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CycleTimeSummary {
    /// Number of completed wafers.
    pub count: usize,
    /// Average cycle time.
    pub mean: Duration,
    /// Shortest cycle time.
    pub min: Duration,
    /// Longest cycle time.
    pub max: Duration,
}

/// Stores wafers at different stages of the simulation along with all
/// processing records.
///
/// The log tracks every wafer from release to completion or drop, and keeps
/// the completions of the most recent time interval in a separate heap to
/// compute the current throughput quickly.
pub struct WaferLog {
    active: HashMap<WaferId, Wafer>,
    completed: HashMap<WaferId, CompletedWafer>,
    dropped: HashMap<WaferId, DroppedWafer>,
    records: Vec<ProcessingRecord>,
    recent: BinaryHeap<(Reverse<Duration>, WaferId)>,
    current_interval: Duration,
    clock: ClockRef,
    fail_on_removing: bool,
}

impl WaferLog {
    /// Constructs a new wafer log.
    ///
    /// The value of `current_interval` determines how long into the past we
    /// look when computing the *current* throughput. `clock` is the
    /// reference to the simulation clock.
    #[must_use]
    pub fn new(clock: ClockRef, current_interval: Duration) -> Self {
        Self {
            active: HashMap::new(),
            completed: HashMap::new(),
            dropped: HashMap::new(),
            records: Vec::new(),
            recent: BinaryHeap::new(),
            current_interval,
            clock,
            fail_on_removing: true,
        }
    }

    /// Registers a wafer released into the line.
    pub fn start(&mut self, wafer: Wafer) {
        self.active.insert(wafer.id, wafer);
    }

    /// Appends a processing record.
    pub fn record(&mut self, record: ProcessingRecord) {
        self.records.push(record);
    }

    /// Marks a wafer as having left the line through the sink.
    pub fn finish(&mut self, wafer: Wafer) {
        if self.active.remove(&wafer.id).is_none() && self.fail_on_removing {
            panic!("Tried to finish unknown wafer.");
        }
        self.pop_old();
        let finished = self.clock.time();
        self.recent.push((Reverse(finished), wafer.id));
        self.completed
            .insert(wafer.id, CompletedWafer { wafer, finished });
    }

    /// Marks a wafer as dropped, with a diagnostic reason.
    pub fn drop_wafer(&mut self, wafer: Wafer, reason: impl Into<String>) {
        if self.active.remove(&wafer.id).is_none() && self.fail_on_removing {
            panic!("Tried to drop unknown wafer.");
        }
        self.dropped.insert(
            wafer.id,
            DroppedWafer {
                wafer,
                time: self.clock.time(),
                reason: reason.into(),
            },
        );
    }

    /// The number of wafers released so far.
    #[must_use]
    pub fn started_wafers(&self) -> usize {
        self.active.len() + self.completed.len() + self.dropped.len()
    }

    /// The number of wafers currently in the line.
    #[must_use]
    pub fn active_wafers(&self) -> usize {
        self.active.len()
    }

    /// The number of wafers that reached the sink.
    #[must_use]
    pub fn completed_wafers(&self) -> usize {
        self.completed.len()
    }

    /// The number of dropped wafers.
    #[must_use]
    pub fn dropped_wafers(&self) -> usize {
        self.dropped.len()
    }

    /// Iterates over the dropped wafers.
    pub fn dropped(&self) -> impl Iterator<Item = &DroppedWafer> {
        self.dropped.values()
    }

    /// The average number of completed wafers per second over the entire
    /// simulation.
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn total_throughput(&self) -> f64 {
        if self.completed.is_empty() || self.clock.time() == Duration::default() {
            0.0
        } else {
            self.completed.len() as f64 / self.clock.time().as_secs_f64()
        }
    }

    /// The average number of completed wafers per second over the most
    /// recent time interval.
    #[allow(clippy::cast_precision_loss)]
    pub fn current_throughput(&mut self) -> f64 {
        self.pop_old();
        if self.recent.is_empty() || self.clock.time() == Duration::default() {
            0.0
        } else {
            let recent_interval = std::cmp::min(self.current_interval, self.clock.time());
            self.recent.len() as f64 / recent_interval.as_secs_f64()
        }
    }

    /// Cycle-time statistics over all completed wafers.
    #[must_use]
    pub fn cycle_time_summary(&self) -> CycleTimeSummary {
        let mut summary = CycleTimeSummary::default();
        let mut total = Duration::default();
        for completed in self.completed.values() {
            let cycle = completed.cycle_time();
            total += cycle;
            summary.min = if summary.count == 0 {
                cycle
            } else {
                summary.min.min(cycle)
            };
            summary.max = summary.max.max(cycle);
            summary.count += 1;
        }
        if summary.count > 0 {
            summary.mean = total / summary.count as u32;
        }
        summary
    }

    /// Iterates over all processing records in insertion order.
    pub fn records(&self) -> impl Iterator<Item = &ProcessingRecord> {
        self.records.iter()
    }

    /// Writes all processing records as CSV.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the underlying write fails.
    pub fn write_csv<W: io::Write>(&self, writer: W) -> Result<(), csv::Error> {
        let mut writer = csv::Writer::from_writer(writer);
        for record in &self.records {
            writer.serialize(record)?;
        }
        Ok(())
    }

    fn pop_old(&mut self) {
        while let Some((Reverse(finished), _)) = self.recent.peek().copied() {
            if finished + self.current_interval >= self.clock.time() {
                break;
            }
            self.recent.pop();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{LotId, SeqId};

    use std::cell::Cell;
    use std::rc::Rc;

    use rstest::{fixture, rstest};

    fn wafer(id: usize, created_secs: u64) -> Wafer {
        Wafer {
            id: WaferId::from(id),
            lot: LotId::from(0),
            created: Duration::from_secs(created_secs),
            seq: SeqId::from(0),
        }
    }

    #[test]
    fn test_clock() {
        let clock = Rc::new(Cell::new(Duration::default()));
        let log = WaferLog::new(Rc::clone(&clock).into(), Duration::from_secs(3));

        assert_eq!(log.clock.time(), clock.get());
        clock.replace(Duration::from_secs(1));
        assert_eq!(log.clock.time(), clock.get());
    }

    #[fixture]
    fn log() -> WaferLog {
        let clock = Rc::new(Cell::new(Duration::default()));
        WaferLog::new(clock.into(), Duration::from_secs(3))
    }

    #[rstest]
    fn test_wafer_pipeline(mut log: WaferLog) {
        assert_eq!(log.started_wafers(), 0);

        log.start(wafer(0, 0));
        log.start(wafer(1, 0));
        assert_eq!(log.started_wafers(), 2);
        assert_eq!(log.active_wafers(), 2);

        log.finish(wafer(0, 0));
        log.drop_wafer(wafer(1, 0), "no route");
        assert_eq!(log.started_wafers(), 2);
        assert_eq!(log.active_wafers(), 0);
        assert_eq!(log.completed_wafers(), 1);
        assert_eq!(log.dropped_wafers(), 1);
        assert_eq!(log.dropped().next().unwrap().reason, "no route");
    }

    #[rstest]
    #[should_panic]
    fn test_finishing_unknown_wafer_panics(mut log: WaferLog) {
        log.finish(wafer(0, 0));
    }

    #[rstest]
    #[should_panic]
    fn test_dropping_unknown_wafer_panics(mut log: WaferLog) {
        log.drop_wafer(wafer(0, 0), "lost");
    }

    #[test]
    fn test_throughput() {
        let clock = Rc::new(Cell::new(Duration::default()));
        let mut log = WaferLog::new(Rc::clone(&clock).into(), Duration::from_secs(3));
        log.fail_on_removing = false;
        assert_eq!(log.total_throughput(), 0.0);

        log.finish(wafer(0, 0));
        clock.replace(Duration::from_secs(1));
        assert_eq!(log.total_throughput(), 1.0);
        assert_eq!(log.current_throughput(), 1.0);

        clock.replace(Duration::from_secs(4));
        log.finish(wafer(1, 0));
        assert_eq!(log.total_throughput(), 0.5);
        // Only the second completion is still within the window.
        assert!(float_cmp::approx_eq!(
            f64,
            log.current_throughput(),
            1.0 / 3.0
        ));

        clock.replace(Duration::from_secs(6));
        assert!(float_cmp::approx_eq!(
            f64,
            log.total_throughput(),
            2.0 / 6.0
        ));
        // The first completion fell out of the 3-second window.
        assert!(float_cmp::approx_eq!(
            f64,
            log.current_throughput(),
            1.0 / 3.0
        ));
    }

    #[test]
    fn test_cycle_time_summary() {
        let clock = Rc::new(Cell::new(Duration::default()));
        let mut log = WaferLog::new(Rc::clone(&clock).into(), Duration::from_secs(3));
        log.fail_on_removing = false;

        assert_eq!(log.cycle_time_summary(), CycleTimeSummary::default());

        clock.replace(Duration::from_secs(10));
        log.finish(wafer(0, 2));
        log.finish(wafer(1, 6));
        let summary = log.cycle_time_summary();
        assert_eq!(summary.count, 2);
        assert_eq!(summary.min, Duration::from_secs(4));
        assert_eq!(summary.max, Duration::from_secs(8));
        assert_eq!(summary.mean, Duration::from_secs(6));
    }

    #[rstest]
    fn test_csv_records(mut log: WaferLog) {
        log.record(ProcessingRecord {
            wafer: WaferId::from(3),
            lot: LotId::from(1),
            station: String::from("ETCH"),
            seq: SeqId::from(10),
            resource: String::from("ETCH-1"),
            start: Duration::from_secs(5),
            end: Duration::from_secs(125),
        });
        let mut out = Vec::new();
        log.write_csv(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "wafer,lot,station,seq,resource,start,end\n3,1,ETCH,10,ETCH-1,5.0,125.0\n"
        );
    }
}
