use std::collections::HashMap;
use std::time::Duration;

use toolsim::{Driver, ProcessingRecord, SimulationConfig, WaferId};

fn config(json: &str) -> SimulationConfig {
    SimulationConfig::from_json(json.as_bytes()).expect("invalid test configuration")
}

fn run(json: &str) -> Driver {
    let mut driver = Driver::new(&config(json)).expect("unable to build the flow graph");
    driver.run();
    driver
}

fn records(driver: &Driver) -> Vec<ProcessingRecord> {
    driver.log().records().cloned().collect()
}

fn secs(duration: Duration) -> f64 {
    duration.as_secs_f64()
}

/// Instances are assigned in rotation: the third wafer waits for the first
/// instance to free up even though it could start sooner elsewhere.
#[test]
fn test_round_robin_rotation_decides_the_instance() {
    let driver = run(r#"{
        "flow": [{"seq_id": 10, "station": "ETCH", "duration_mean": 5.0}],
        "stations": [
            {"id": "ETCH", "instances": ["ETCH-1", "ETCH-2"], "policy": "round_robin"}
        ],
        "run": {
            "horizon": 100.0,
            "lot_size": 1,
            "lot_interval": {"type": "fixed", "interval": 1.0},
            "max_lots": 3
        }
    }"#);
    assert_eq!(driver.log().completed_wafers(), 3);
    let records = records(&driver);
    let intervals: Vec<_> = records
        .iter()
        .map(|r| (usize::from(r.wafer), r.resource.as_str(), secs(r.start), secs(r.end)))
        .collect();
    assert_eq!(
        intervals,
        vec![
            (0, "ETCH-1", 0.0, 5.0),
            (1, "ETCH-2", 1.0, 6.0),
            (2, "ETCH-1", 5.0, 10.0),
        ]
    );

    // 15 seconds of processing over 10 seconds of run on two instances.
    let etch = driver
        .summary()
        .nodes
        .into_iter()
        .find(|node| node.label == "ETCH:10")
        .expect("the station node is missing from the summary");
    assert!(float_cmp::approx_eq!(f64, etch.utilization, 0.75));
}

/// In a hold-and-wait section a wafer's consecutive records touch: the
/// previous instance is released at the exact moment the next one is granted.
#[test]
fn test_hold_and_wait_hands_over_without_gaps() {
    let driver = run(r#"{
        "flow": [
            {"seq_id": 10, "station": "A", "duration_mean": 5.0},
            {"seq_id": 20, "station": "B", "duration_mean": 5.0}
        ],
        "stations": [
            {"id": "A", "instances": ["A-1"], "policy": "hold_and_wait"},
            {"id": "B", "instances": ["B-1"], "policy": "hold_and_wait"}
        ],
        "run": {
            "horizon": 100.0,
            "lot_size": 3,
            "lot_interval": {"type": "fixed", "interval": 1000.0},
            "max_lots": 1
        }
    }"#);
    assert_eq!(driver.log().completed_wafers(), 3);
    assert_eq!(driver.log().dropped_wafers(), 0);

    let mut per_wafer: HashMap<WaferId, Vec<ProcessingRecord>> = HashMap::new();
    for record in records(&driver) {
        per_wafer.entry(record.wafer).or_default().push(record);
    }
    for records in per_wafer.values_mut() {
        records.sort_by_key(|record| record.start);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].end, records[1].start);
    }

    let mut per_resource: HashMap<String, Vec<(Duration, Duration)>> = HashMap::new();
    for record in records(&driver) {
        per_resource
            .entry(record.resource.clone())
            .or_default()
            .push((record.start, record.end));
    }
    for intervals in per_resource.values_mut() {
        intervals.sort();
        for pair in intervals.windows(2) {
            assert!(pair[1].0 >= pair[0].1, "instance held twice at once");
        }
    }

    let summary = driver.log().cycle_time_summary();
    assert_eq!(summary.count, 3);
    assert_eq!(summary.min, Duration::from_secs(10));
    assert_eq!(summary.max, Duration::from_secs(20));
    assert_eq!(summary.mean, Duration::from_secs(15));
}

/// A wafer that cannot get its first instance within the wait bound holds
/// nothing to back off to and is dropped.
#[test]
fn test_wait_bound_drops_wafers_stuck_at_the_first_step() {
    let driver = run(r#"{
        "flow": [{"seq_id": 10, "station": "A", "duration_mean": 10.0}],
        "stations": [{"id": "A", "instances": ["A-1"], "policy": "hold_and_wait"}],
        "run": {
            "horizon": 100.0,
            "lot_size": 3,
            "lot_interval": {"type": "fixed", "interval": 1000.0},
            "max_lots": 1
        },
        "hold_and_wait": {"max_wait": 3.0}
    }"#);
    assert_eq!(driver.log().completed_wafers(), 1);
    assert_eq!(driver.log().dropped_wafers(), 2);
    for dropped in driver.log().dropped() {
        assert_eq!(dropped.reason, "timed out acquiring first station");
        assert_eq!(dropped.time, Duration::from_secs(3));
    }
    let section = driver
        .summary()
        .nodes
        .into_iter()
        .find(|node| node.label == "SECTION 10-10")
        .expect("the section node is missing from the summary");
    assert_eq!(section.stats.entered, 3);
    assert_eq!(section.stats.dropped, 2);
    assert!(section.stats.is_balanced());
}

/// With a retry limit, a wafer stuck behind a slow downstream station
/// eventually gives up, and the instance it was holding is freed.
#[test]
fn test_exhausted_retries_release_the_held_instance() {
    let driver = run(r#"{
        "flow": [
            {"seq_id": 10, "station": "A", "duration_mean": 5.0},
            {"seq_id": 20, "station": "B", "duration_mean": 50.0}
        ],
        "stations": [
            {"id": "A", "instances": ["A-1"], "policy": "hold_and_wait"},
            {"id": "B", "instances": ["B-1"], "policy": "hold_and_wait"}
        ],
        "run": {
            "horizon": 200.0,
            "lot_size": 2,
            "lot_interval": {"type": "fixed", "interval": 1000.0},
            "max_lots": 1
        },
        "hold_and_wait": {"max_wait": 8.0, "max_retries": 0}
    }"#);
    assert_eq!(driver.log().completed_wafers(), 1);
    assert_eq!(driver.log().dropped_wafers(), 1);
    let dropped: Vec<_> = driver.log().dropped().collect();
    assert_eq!(dropped[0].reason, "exceeded hold-and-wait retries");
    assert_eq!(dropped[0].time, Duration::from_secs(18));

    // The dropped wafer's interval on A-1 ends when it gives up, and the
    // instance shows up as free in the final summary.
    let held: Vec<_> = records(&driver)
        .into_iter()
        .filter(|record| record.wafer == WaferId::from(1))
        .collect();
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].resource, "A-1");
    assert_eq!((secs(held[0].start), secs(held[0].end)), (5.0, 18.0));
    for instance in driver.summary().instances {
        assert_eq!(instance.in_use, 0, "{} still held", instance.name);
    }
}

/// Every-nth sampling sends only every second wafer through the measurement
/// step; the rest skip straight to the step after it.
#[test]
fn test_every_nth_sampling_skips_the_measure_step() {
    let driver = run(r#"{
        "flow": [
            {"seq_id": 10, "station": "CLEAN", "duration_mean": 1.0},
            {"seq_id": 20, "station": "MEASURE", "duration_mean": 1.0},
            {"seq_id": 30, "station": "BAKE", "duration_mean": 1.0}
        ],
        "stations": [
            {"id": "CLEAN", "instances": ["CLEAN-1"], "policy": "round_robin"},
            {"id": "MEASURE", "instances": ["MEASURE-1"], "policy": "round_robin"},
            {"id": "BAKE", "instances": ["BAKE-1"], "policy": "round_robin"}
        ],
        "run": {
            "horizon": 100.0,
            "lot_size": 4,
            "lot_interval": {"type": "fixed", "interval": 1000.0},
            "max_lots": 1
        },
        "sampling": {"at_seq": 20, "predicate": {"type": "every_nth", "period": 2}}
    }"#);
    assert_eq!(driver.log().completed_wafers(), 4);
    let records = records(&driver);
    let measured: Vec<_> = records
        .iter()
        .filter(|record| record.station == "MEASURE")
        .map(|record| usize::from(record.wafer))
        .collect();
    assert_eq!(measured, vec![1, 3]);
    let baked = records
        .iter()
        .filter(|record| record.station == "BAKE")
        .count();
    assert_eq!(baked, 4);
}

/// An incomplete batch is forced through once its first wafer has waited out
/// the batching timeout.
#[test]
fn test_batching_timeout_forces_an_incomplete_batch() {
    let driver = run(r#"{
        "flow": [{"seq_id": 10, "station": "OXIDE", "duration_mean": 1.0}],
        "stations": [{"id": "OXIDE", "instances": ["OXIDE-1"], "policy": "round_robin"}],
        "run": {
            "horizon": 100.0,
            "lot_size": 4,
            "lot_interval": {"type": "fixed", "interval": 1000.0},
            "max_lots": 1
        },
        "batching": {"before_seq": 10, "size": 3, "timeout": 5.0}
    }"#);
    assert_eq!(driver.log().completed_wafers(), 4);
    let last = records(&driver)
        .into_iter()
        .find(|record| record.wafer == WaferId::from(3))
        .expect("the held-back wafer was never processed");
    assert_eq!((secs(last.start), secs(last.end)), (5.0, 6.0));
}

/// A bounded entry buffer rejects arrivals beyond its capacity.
#[test]
fn test_full_entry_buffer_rejects_wafers() {
    let driver = run(r#"{
        "flow": [{"seq_id": 10, "station": "IMPLANT", "duration_mean": 10.0}],
        "stations": [{"id": "IMPLANT", "instances": ["IMPLANT-1"], "policy": "round_robin"}],
        "run": {
            "horizon": 50.0,
            "lot_size": 6,
            "lot_interval": {"type": "fixed", "interval": 1000.0},
            "max_lots": 1
        },
        "entry_buffer": {"capacity": 3}
    }"#);
    let log = driver.log();
    // One wafer goes straight to the station, three fill the buffer, and the
    // remaining two are rejected.
    assert_eq!(log.dropped_wafers(), 2);
    for dropped in log.dropped() {
        assert_eq!(dropped.reason, "entry buffer full");
    }
    assert_eq!(
        log.started_wafers(),
        log.completed_wafers() + log.dropped_wafers() + log.active_wafers()
    );
}

/// Runs with the same seed produce byte-identical processing histories.
#[test]
fn test_same_seed_reproduces_the_run() {
    let json = r#"{
        "flow": [
            {"seq_id": 10, "station": "ETCH", "duration_mean": 30.0, "duration_std": 4.0},
            {"seq_id": 15, "station": "ETCH", "duration_mean": 2.0, "is_transfer": true},
            {"seq_id": 20, "station": "COAT", "duration_mean": 45.0, "duration_std": 6.0}
        ],
        "stations": [
            {"id": "ETCH", "instances": ["ETCH-1", "ETCH-2"], "policy": "round_robin",
             "transfer_as_delay": true},
            {"id": "COAT", "instances": ["COAT-1", "COAT-2"], "policy": "hold_and_wait"}
        ],
        "run": {
            "horizon": 2000.0,
            "lot_size": 5,
            "lot_interval": {"type": "exponential", "mean": 120.0},
            "max_lots": 4,
            "seed": 42,
            "stagger_max": 1.5
        }
    }"#;
    let first = run(json);
    let second = run(json);
    assert_eq!(records(&first), records(&second));
    assert_eq!(
        first.log().completed_wafers(),
        second.log().completed_wafers()
    );

    let mut reseeded = config(json);
    reseeded.run.seed = 43;
    let mut driver = Driver::new(&reseeded).expect("unable to build the flow graph");
    driver.run();
    assert_ne!(records(&first), records(&driver));
}

/// Wafers are never lost: everything released is accounted for as completed,
/// dropped, or still in the line.
#[test]
fn test_wafer_conservation() {
    let driver = run(r#"{
        "flow": [
            {"seq_id": 10, "station": "DEPO", "duration_mean": 8.0, "duration_std": 2.0},
            {"seq_id": 20, "station": "CMP", "duration_mean": 12.0, "duration_std": 3.0}
        ],
        "stations": [
            {"id": "DEPO", "instances": ["DEPO-1", "DEPO-2"], "policy": "round_robin"},
            {"id": "CMP", "instances": ["CMP-1"], "policy": "round_robin"}
        ],
        "run": {
            "horizon": 300.0,
            "lot_size": 8,
            "lot_interval": {"type": "fixed", "interval": 60.0},
            "seed": 7,
            "stagger_max": 2.0
        },
        "entry_buffer": {"capacity": 4, "discipline": "fifo"}
    }"#);
    let log = driver.log();
    assert!(log.started_wafers() > 0);
    assert_eq!(
        log.started_wafers(),
        log.completed_wafers() + log.dropped_wafers() + log.active_wafers()
    );
    for node in driver.summary().nodes {
        assert!(
            node.stats.is_balanced(),
            "conservation violated at node {}: {:?}",
            node.label,
            node.stats
        );
    }
}
