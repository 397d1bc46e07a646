use std::collections::BTreeMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ndarray::{Array2, ArrayView2};
use streamwarden_lib::classifier::Classifier;
use streamwarden_lib::config::Config;
use streamwarden_lib::enforcement::Enforcement;
use streamwarden_lib::processor::{BatchOutcome, Monitor};
use streamwarden_lib::store::StateStore;
use streamwarden_lib::tracker::{ClientState, Transition};
use streamwarden_lib::types::{PacketRecord, TcpFields};
use tempfile::tempdir;

const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
const GOOGLE_A: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);
const GOOGLE_B: Ipv4Addr = Ipv4Addr::new(8, 8, 4, 4);

/// Reports streaming while the switch is on.
struct Switch(Arc<AtomicBool>);

impl Classifier for Switch {
    fn predict_proba(&self, rows: ArrayView2<f32>) -> anyhow::Result<Array2<f32>> {
        let p = if self.0.load(Ordering::SeqCst) { 0.9 } else { 0.2 };
        let mut out = Array2::zeros((rows.nrows(), 2));
        out.column_mut(0).fill(1.0 - p);
        out.column_mut(1).fill(p);
        Ok(out)
    }
}

fn config(dir: &Path) -> Config {
    Config {
        lan_subnet: Ipv4Addr::new(10, 0, 0, 0),
        lan_prefix_len: 24,
        state_path: dir.join("clients.json"),
        blocklist_path: dir.join("blocked-ips-v4.txt"),
        ..Config::default()
    }
}

fn packet(src: Ipv4Addr, dst: Ipv4Addr, ts: f64, size: u32, ack: u32) -> PacketRecord {
    let (src_port, dst_port) = if src == CLIENT { (51_000, 443) } else { (443, 51_000) };
    PacketRecord {
        src,
        dst,
        size,
        timestamp: ts,
        ttl: 58,
        ip_flags: 0x02,
        tcp: Some(TcpFields { src_port, dst_port, seq: ack.wrapping_mul(7), ack, flags: 0x18 }),
        udp: None,
    }
}

/// One full window of client traffic with every server in `servers`, ending at `end`.
fn batch(end: f64, servers: &[Ipv4Addr]) -> Vec<PacketRecord> {
    let start = end - 9.0;
    let mut out = Vec::new();
    for (i, server) in servers.iter().enumerate() {
        for k in 0..3u32 {
            let ts = start + (i as f64) * 3.0 + k as f64;
            out.push(packet(CLIENT, *server, ts, 66 + k, 1_000 + k));
            out.push(packet(*server, CLIENT, ts + 0.25, 1_420 + k * 10, 2_000 + k));
        }
    }
    out
}

fn run(monitor: &mut Monitor, end: f64, servers: &[Ipv4Addr]) -> BatchOutcome {
    let outcome = monitor.process_batch(batch(end, servers), end);
    assert_eq!(outcome.reports.len(), 1, "expected a verdict at t={end}");
    outcome
}

#[test]
fn streaming_session_lifecycle() {
    let dir = tempdir().unwrap();
    let streaming = Arc::new(AtomicBool::new(true));
    let mut monitor = Monitor::new(config(dir.path()), Box::new(Switch(streaming.clone())));

    // three streaming verdicts flip the client on the third
    assert_eq!(run(&mut monitor, 10.0, &[GOOGLE_A]).reports[0].transition, Transition::Unchanged);
    assert_eq!(run(&mut monitor, 20.0, &[GOOGLE_A]).reports[0].transition, Transition::Unchanged);
    assert!(!monitor.store().get(CLIENT).unwrap().is_streaming);
    assert_eq!(run(&mut monitor, 30.0, &[GOOGLE_A]).reports[0].transition, Transition::Started);
    let state = monitor.store().get(CLIENT).unwrap();
    assert!(state.is_streaming);
    assert_eq!(state.streaming_start_time, Some(30.0));

    // two more batches accrue twenty seconds, far from the quota
    run(&mut monitor, 40.0, &[GOOGLE_A]);
    let report = run(&mut monitor, 50.0, &[GOOGLE_A]).reports[0].clone();
    assert!((report.total_streaming_time - 20.0).abs() < 1e-9);
    assert!(!report.is_blocked);
    assert_eq!(report.enforcement, Enforcement::WithinQuota);

    // three negative verdicts end the session
    streaming.store(false, Ordering::SeqCst);
    run(&mut monitor, 60.0, &[GOOGLE_A]);
    run(&mut monitor, 70.0, &[GOOGLE_A]);
    assert_eq!(run(&mut monitor, 80.0, &[GOOGLE_A]).reports[0].transition, Transition::Stopped);
    let state = monitor.store().get(CLIENT).unwrap().clone();
    assert!(!state.is_streaming);
    assert_eq!(state.streaming_start_time, None);
    assert!((state.total_streaming_time - 50.0).abs() < 1e-9);

    run(&mut monitor, 90.0, &[GOOGLE_A]);
    assert_eq!(monitor.store().get(CLIENT).unwrap().total_streaming_time, state.total_streaming_time);

    // persisted after every update
    let on_disk = StateStore::load(dir.path().join("clients.json"));
    assert_eq!(on_disk.get(CLIENT), monitor.store().get(CLIENT));

    // idle past the eviction timeout
    let evicted = monitor.cleanup(90.0 + 3600.0 + 1.0).unwrap();
    assert_eq!(evicted, vec![CLIENT]);
    assert!(StateStore::load(dir.path().join("clients.json")).get(CLIENT).is_none());
}

#[test]
fn quota_blocks_one_server_per_batch_in_traffic_order() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());

    let mut seeded = ClientState::new(7_190.0);
    seeded.is_streaming = true;
    seeded.consecutive_streaming_count = 3;
    seeded.streaming_start_time = Some(7_190.0);
    seeded.total_streaming_time = 3_590.0;
    seeded.server_ips.insert(GOOGLE_A, 50);
    seeded.server_ips.insert(GOOGLE_B, 20);
    let table: BTreeMap<Ipv4Addr, ClientState> = [(CLIENT, seeded)].into_iter().collect();
    fs::write(&cfg.state_path, serde_json::to_string_pretty(&table).unwrap()).unwrap();

    let mut monitor = Monitor::new(cfg.clone(), Box::new(Switch(Arc::new(AtomicBool::new(true)))));

    // 3590 + 20 > 3600: heaviest server goes first
    let report = run(&mut monitor, 7_210.0, &[GOOGLE_A, GOOGLE_B]).reports[0].clone();
    assert_eq!(report.enforcement, Enforcement::Blocked(GOOGLE_A));
    assert!(report.is_blocked);
    assert_eq!(fs::read_to_string(&cfg.blocklist_path).unwrap(), "8.8.8.8\n");

    // next trigger skips the already blocked address
    let report = run(&mut monitor, 7_220.0, &[GOOGLE_A, GOOGLE_B]).reports[0].clone();
    assert_eq!(report.enforcement, Enforcement::Blocked(GOOGLE_B));
    assert_eq!(fs::read_to_string(&cfg.blocklist_path).unwrap(), "8.8.8.8\n8.8.4.4\n");

    // nothing left to block; the list never grows a duplicate
    for end in [7_230.0, 7_240.0] {
        let report = run(&mut monitor, end, &[GOOGLE_A, GOOGLE_B]).reports[0].clone();
        assert_eq!(report.enforcement, Enforcement::NothingToBlock);
        assert!(report.is_blocked);
    }
    assert_eq!(fs::read_to_string(&cfg.blocklist_path).unwrap(), "8.8.8.8\n8.8.4.4\n");
}

#[test]
fn identical_input_gives_identical_decisions() {
    let outcomes: Vec<(Vec<BatchOutcome>, String)> = (0..2)
        .map(|_| {
            let dir = tempdir().unwrap();
            let cfg = Config { quota_secs: 15.0, ..config(dir.path()) };
            let mut monitor = Monitor::new(cfg.clone(), Box::new(Switch(Arc::new(AtomicBool::new(true)))));
            let outcomes = (1..=6)
                .map(|i| monitor.process_batch(batch(10.0 * i as f64, &[GOOGLE_B, GOOGLE_A]), 10.0 * i as f64))
                .collect();
            (outcomes, fs::read_to_string(&cfg.blocklist_path).unwrap_or_default())
        })
        .collect();

    assert_eq!(outcomes[0], outcomes[1]);
    assert!(!outcomes[0].1.is_empty());
}
