// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::fs;
use std::io::Write;
use std::net::TcpStream;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use procctl_wire::{Level, LogRecord, FRAME_SEPARATOR};

use super::*;
use crate::config::{Endpoint, ReceiverConfig};
use crate::log_emitter::LogContext;

fn config(dir: &Path) -> ReceiverConfig {
    ReceiverConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        log_dir: dir.to_path_buf(),
        file_prefix: "test_log".to_string(),
        poll_interval_ms: 20,
        max_frame_len: 4096,
        ..Default::default()
    }
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

fn line_count(path: &Path) -> usize {
    fs::read_to_string(path).map(|s| s.lines().count()).unwrap_or(0)
}

//
// 1. records from several emitters land in per-name files
//
#[test]
fn test_routes_records_by_logger_name() {
    let dir = tempfile::tempdir().unwrap();
    let mut receiver = LogReceiver::bind(config(dir.path())).unwrap();
    let port = receiver.local_addr().unwrap().port();
    let stop = receiver.stop_handle();
    let server = thread::spawn(move || receiver.serve_until_stopped());

    let context = LogContext::new(Some(Endpoint::new("127.0.0.1", port)), Level::Debug);
    context.logger("controller").info("pool created").unwrap();
    context.logger("Process-1").debug("running").unwrap();
    context.logger("Process-1").error("quotient undefined").unwrap();

    let controller_log = dir.path().join("test_log.controller.log");
    let worker_log = dir.path().join("test_log.Process-1.log");
    assert!(wait_for(|| line_count(&controller_log) == 1 && line_count(&worker_log) == 2));

    stop.store(true, Ordering::SeqCst);
    server.join().unwrap().unwrap();

    let worker_lines = fs::read_to_string(&worker_log).unwrap();
    assert!(worker_lines.contains("\"levelname\":\"DEBUG\""));
    assert!(worker_lines.contains("quotient undefined"));
}

//
// 2. a connection that dies mid-frame produces no record
//
#[test]
fn test_truncated_frame_is_not_decoded() {
    let dir = tempfile::tempdir().unwrap();
    let mut receiver = LogReceiver::bind(config(dir.path())).unwrap();
    let addr = receiver.local_addr().unwrap();
    let stop = receiver.stop_handle();
    let server = thread::spawn(move || receiver.serve_until_stopped());

    {
        let mut stream = TcpStream::connect(addr).unwrap();
        let mut partial = 100u32.to_be_bytes().to_vec();
        partial.extend_from_slice(&FRAME_SEPARATOR);
        partial.extend_from_slice(&[b'{'; 38]);
        stream.write_all(&partial).unwrap();
    }

    // a healthy connection afterwards is still served
    let mut stream = TcpStream::connect(addr).unwrap();
    let frame = procctl_wire::encode(&LogRecord::new("healthy", Level::Info, "ok")).unwrap();
    stream.write_all(&frame).unwrap();
    drop(stream);

    let healthy = dir.path().join("test_log.healthy.log");
    assert!(wait_for(|| line_count(&healthy) == 1));

    stop.store(true, Ordering::SeqCst);
    server.join().unwrap().unwrap();

    let files: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(files.len(), 1);
}

//
// 3. oversized frames drop the connection
//
#[test]
fn test_oversized_frame_drops_connection() {
    let dir = tempfile::tempdir().unwrap();
    let mut receiver = LogReceiver::bind(config(dir.path())).unwrap();
    let addr = receiver.local_addr().unwrap();
    let stop = receiver.stop_handle();
    let server = thread::spawn(move || receiver.serve_until_stopped());

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(&(1u32 << 20).to_be_bytes()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut buf = [0u8; 1];
    // the server closes its side without waiting for the announced payload
    let closed = matches!(std::io::Read::read(&mut stream, &mut buf), Ok(0) | Err(_));
    assert!(closed);

    stop.store(true, Ordering::SeqCst);
    server.join().unwrap().unwrap();
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}

//
// 4. the abort flag is observed although no client ever connects
//
#[test]
fn test_stop_without_connections() {
    let dir = tempfile::tempdir().unwrap();
    let mut receiver = LogReceiver::bind(config(dir.path())).unwrap();
    let stop = receiver.stop_handle();
    let started = Instant::now();
    let server = thread::spawn(move || receiver.serve_until_stopped());
    thread::sleep(Duration::from_millis(50));
    stop.store(true, Ordering::SeqCst);
    server.join().unwrap().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
}

//
// 5. a fixed logname collects every record in one file
//
#[test]
fn test_fixed_logname() {
    let dir = tempfile::tempdir().unwrap();
    let mut receiver = LogReceiver::bind(ReceiverConfig {
        logname: Some("all".to_string()),
        ..config(dir.path())
    })
    .unwrap();
    let port = receiver.local_addr().unwrap().port();
    let stop = receiver.stop_handle();
    let server = thread::spawn(move || receiver.serve_until_stopped());

    let context = LogContext::new(Some(Endpoint::new("127.0.0.1", port)), Level::Info);
    context.logger("a").info("1").unwrap();
    context.logger("b").info("2").unwrap();

    let all = dir.path().join("test_log.all.log");
    assert!(wait_for(|| line_count(&all) == 2));
    stop.store(true, Ordering::SeqCst);
    server.join().unwrap().unwrap();
}

//
// 6. stopping lets a frame that is being received finish
//
#[test]
fn test_stop_finishes_the_frame_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let mut receiver = LogReceiver::bind(config(dir.path())).unwrap();
    let addr = receiver.local_addr().unwrap();
    let stop = receiver.stop_handle();
    let server = thread::spawn(move || receiver.serve_until_stopped());

    let frame = procctl_wire::encode(&LogRecord::new("late", Level::Info, "split frame")).unwrap();
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(&frame[..20]).unwrap();
    // the connection thread is now inside the frame
    thread::sleep(Duration::from_millis(200));

    stop.store(true, Ordering::SeqCst);
    thread::sleep(Duration::from_millis(100));
    stream.write_all(&frame[20..]).unwrap();

    server.join().unwrap().unwrap();
    assert_eq!(line_count(&dir.path().join("test_log.late.log")), 1);
}

//
// 7. an idle connection does not keep a stopped receiver alive
//
#[test]
fn test_idle_connection_ends_on_stop() {
    let dir = tempfile::tempdir().unwrap();
    let mut receiver = LogReceiver::bind(config(dir.path())).unwrap();
    let addr = receiver.local_addr().unwrap();
    let stop = receiver.stop_handle();
    let server = thread::spawn(move || receiver.serve_until_stopped());

    let _idle = TcpStream::connect(addr).unwrap();
    thread::sleep(Duration::from_millis(100));
    let started = Instant::now();
    stop.store(true, Ordering::SeqCst);
    server.join().unwrap().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
}
