// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::Pid;
use procctl::{BatchId, Controller, ControllerConfig, ResultEntry, WorkerCommand};
use procctl_tests::jobs;
use serde_json::{json, Value};

fn config() -> ControllerConfig {
    ControllerConfig {
        worker: Some(WorkerCommand::new(env!("CARGO_BIN_EXE_test-worker"))),
        install_signal_handlers: false,
        poll_interval_ms: 20,
        ..Default::default()
    }
}

fn controller(function: &str) -> Controller {
    let target = jobs::registry().target(function).unwrap();
    Controller::new(target, config()).unwrap()
}

fn payloads(results: &[ResultEntry]) -> Vec<Option<Value>> {
    results.iter().map(|r| r.payload.clone()).collect()
}

fn assert_gone(pid: u32) {
    assert_eq!(
        signal::kill(Pid::from_raw(pid as i32), None),
        Err(Errno::ESRCH),
        "process {pid} still exists"
    );
}

#[test]
fn test_pool_squares_in_job_order() {
    let mut controller = controller("square");
    controller.create_pool(2).unwrap();
    assert_eq!(
        controller.submit(vec![json!(1), json!(2), json!(3)]).unwrap(),
        Some(BatchId(0))
    );

    let results = controller.collect_results().unwrap();
    assert_eq!(
        results,
        vec![
            ResultEntry::new(Some(json!(1)), "Pool Batch ID: 0"),
            ResultEntry::new(Some(json!(4)), "Pool Batch ID: 0"),
            ResultEntry::new(Some(json!(9)), "Pool Batch ID: 0"),
        ]
    );
    assert_eq!(controller.pool_results(), results.as_slice());
    assert!(controller.collect_results().unwrap().is_empty());
}

#[test]
fn test_most_recent_batch_is_collected_first() {
    let mut controller = controller("square");
    controller.create_pool(2).unwrap();
    controller.submit(vec![json!(1), json!(2)]).unwrap();
    controller.submit(vec![json!(3)]).unwrap();

    let results = controller.collect_results().unwrap();
    let pairs: Vec<_> = results
        .iter()
        .map(|r| (r.payload.clone(), r.origin.as_str()))
        .collect();
    assert_eq!(
        pairs,
        vec![
            (Some(json!(9)), "Pool Batch ID: 1"),
            (Some(json!(1)), "Pool Batch ID: 0"),
            (Some(json!(4)), "Pool Batch ID: 0"),
        ]
    );
}

#[test]
fn test_batch_ids_continue_across_pools() {
    let mut controller = controller("square");
    controller.create_pool(1).unwrap();
    assert_eq!(controller.submit(vec![json!(5)]).unwrap(), Some(BatchId(0)));

    // the old pool drains its queue before the new one starts
    controller.create_pool(2).unwrap();
    assert_eq!(controller.submit(vec![json!(6)]).unwrap(), Some(BatchId(1)));

    let results = controller.collect_results().unwrap();
    assert_eq!(payloads(&results), vec![Some(json!(36)), Some(json!(25))]);
}

#[test]
fn test_failed_job_leaves_an_empty_slot() {
    let mut controller = controller("invert");
    controller.create_pool(2).unwrap();
    controller.submit(vec![json!(1), json!(0), json!(4)]).unwrap();

    let results = controller.collect_results().unwrap();
    assert_eq!(
        payloads(&results),
        vec![Some(json!(1.0)), None, Some(json!(0.25))]
    );
}

#[test]
fn test_dispatch_strategies() {
    let mut apply = controller("always_true");
    apply.create_pool(1).unwrap();
    apply.submit(vec![Value::Null, json!("ignored")]).unwrap();
    assert_eq!(
        payloads(&apply.collect_results().unwrap()),
        vec![Some(json!(true)), Some(json!(true))]
    );

    let mut star = controller("divide");
    star.create_pool(2).unwrap();
    star.submit(vec![json!([6, 3]), json!([1, 4])]).unwrap();
    assert_eq!(
        payloads(&star.collect_results().unwrap()),
        vec![Some(json!(2.0)), Some(json!(0.25))]
    );

    // one array entry switches the whole batch to spreading
    let mut mixed = controller("square");
    mixed.create_pool(1).unwrap();
    mixed.submit(vec![json!(2), json!([3])]).unwrap();
    assert_eq!(
        payloads(&mixed.collect_results().unwrap()),
        vec![Some(json!(4)), Some(json!(9))]
    );
}

#[test]
fn test_pool_survives_dying_workers() {
    let mut controller = controller("exit_abruptly");
    controller.create_pool(1).unwrap();
    controller.submit(vec![Value::Null]).unwrap();
    assert_eq!(payloads(&controller.collect_results().unwrap()), vec![None]);

    controller.submit(vec![Value::Null, Value::Null]).unwrap();
    assert_eq!(payloads(&controller.collect_results().unwrap()), vec![None, None]);
    assert_eq!(controller.pool_results().len(), 3);
}

#[test]
fn test_no_pool_means_no_op() {
    let mut controller = controller("square");
    assert_eq!(controller.submit(vec![json!(1)]).unwrap(), None);
    assert!(controller.collect_results().unwrap().is_empty());

    controller.create_pool(1).unwrap();
    controller.submit(vec![json!(4)]).unwrap();
    controller.close_pool().unwrap();
    // a batch submitted before the pool was closed is still collected
    assert_eq!(payloads(&controller.collect_results().unwrap()), vec![Some(json!(16))]);
    assert_eq!(controller.submit(vec![json!(5)]).unwrap(), None);
}

#[test]
fn test_terminate_kills_the_pool() {
    let mut controller = controller("sleep_ms");
    controller.create_pool(2).unwrap();
    controller.submit(vec![json!(10_000), json!(10_000)]).unwrap();
    let pids = controller.pool_pids();
    assert_eq!(pids.len(), 2);

    let started = Instant::now();
    controller.terminate();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(controller.pending_batches(), 0);
    for pid in pids {
        assert_gone(pid);
    }
    controller.terminate();
}

#[test]
fn test_shutdown_flag_interrupts_collection() {
    let mut controller = controller("sleep_ms");
    controller.create_pool(1).unwrap();
    controller.submit(vec![json!(10_000)]).unwrap();
    let pids = controller.pool_pids();

    let flag = controller.shutdown_flag().clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        flag.raise();
    });

    let started = Instant::now();
    assert!(controller.collect_results().unwrap().is_empty());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!controller.has_pool());
    for pid in pids {
        assert_gone(pid);
    }
}
