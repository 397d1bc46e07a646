use anyhow::{Context, Result};
use crossbeam_channel::{select, tick, Receiver, Sender};
use ndarray::Array2;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};

use crate::classifier::{average_probabilities, Classifier, Verdict};
use crate::config::Config;
use crate::enforcement::{Blocklist, Enforcement, QuotaManager};
use crate::store::StateStore;
use crate::tracker::Transition;
use crate::types::{BatchStats, ClassifiedRecord, PacketRecord};
use super::subnet::LanSubnet;
use super::window::{aggregate_windows, FeatureVector};

#[inline]
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// What happened to one client in one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientReport {
    pub client: Ipv4Addr,
    pub verdict: Verdict,
    pub transition: Transition,
    pub enforcement: Enforcement,
    pub is_streaming: bool,
    pub is_blocked: bool,
    pub total_streaming_time: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub stats: BatchStats,
    pub reports: Vec<ClientReport>,
}

/// Subnet filter, window aggregation, classification, hysteresis and
/// quota enforcement for one batch of packets at a time.
pub struct Monitor {
    config: Config,
    subnet: LanSubnet,
    classifier: Box<dyn Classifier + Send>,
    store: StateStore,
    blocklist: Blocklist,
    quota: QuotaManager,
}

impl Monitor {
    pub fn new(config: Config, classifier: Box<dyn Classifier + Send>) -> Self {
        let store = StateStore::load(config.state_path.clone());
        Self {
            subnet: LanSubnet::new(config.lan_subnet, config.lan_prefix_len),
            blocklist: Blocklist::new(config.blocklist_path.clone()),
            quota: QuotaManager::new(config.quota_secs),
            classifier,
            store,
            config,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn process_batch(&mut self, packets: Vec<PacketRecord>, now: f64) -> BatchOutcome {
        let mut stats = BatchStats { packets: packets.len() as u64, ..Default::default() };

        let classified: Vec<ClassifiedRecord> = packets
            .into_iter()
            .filter_map(|p| self.subnet.classify(p))
            .collect();
        stats.classified = classified.len() as u64;

        let mut servers: BTreeMap<Ipv4Addr, BTreeSet<Ipv4Addr>> = BTreeMap::new();
        for r in &classified {
            servers.entry(r.client).or_default().insert(r.server);
        }
        stats.clients = servers.len() as u64;

        let windows = aggregate_windows(&classified, self.config.window_secs);
        stats.windows = windows.vectors.len() as u64;
        stats.dropped_windows = windows.dropped as u64;

        let mut per_client: BTreeMap<Ipv4Addr, Vec<&FeatureVector>> = BTreeMap::new();
        for v in &windows.vectors {
            per_client.entry(v.client).or_default().push(v);
        }

        let mut reports = Vec::with_capacity(per_client.len());
        for (client, vectors) in per_client {
            let verdict = match self.classify(&vectors) {
                Ok(Some(v)) => v,
                Ok(None) => continue,
                Err(e) => {
                    warn!(%client, error = %e, "classification failed, skipping client this batch");
                    continue;
                }
            };
            let contacted = servers.remove(&client).unwrap_or_default();
            let report = self.update_client(client, verdict, &contacted, now);
            if matches!(report.enforcement, Enforcement::Blocked(_)) {
                stats.blocked += 1;
            }
            reports.push(report);
        }

        BatchOutcome { stats, reports }
    }

    fn classify(&self, vectors: &[&FeatureVector]) -> Result<Option<Verdict>> {
        let features = &self.config.selected_features;
        let flat: Vec<f32> = vectors.iter().flat_map(|v| v.select(features)).collect();
        let rows = Array2::from_shape_vec((vectors.len(), features.len()), flat)
            .context("Failed to build feature matrix")?;
        let probs = self.classifier.predict_proba(rows.view())?;
        Ok(average_probabilities(&probs).map(|avg| Verdict::new(avg, self.config.streaming_threshold)))
    }

    fn update_client(&mut self, client: Ipv4Addr, verdict: Verdict, servers: &BTreeSet<Ipv4Addr>, now: f64) -> ClientReport {
        let state = self.store.entry(client, now);
        let transition = state.observe(verdict.is_streaming, servers, now, self.config.hysteresis);
        match transition {
            Transition::Started => info!(%client, "client started streaming"),
            Transition::Stopped => info!(%client, total_secs = state.total_streaming_time, "client stopped streaming"),
            Transition::Unchanged => {}
        }

        let enforcement = self
            .quota
            .enforce(client, state, &self.blocklist)
            .unwrap_or_else(|e| {
                error!(%client, path = %self.blocklist.path().display(), error = %e, "blocklist update failed");
                Enforcement::Failed
            });

        let report = ClientReport {
            client,
            verdict,
            transition,
            enforcement,
            is_streaming: state.is_streaming,
            is_blocked: state.is_blocked,
            total_streaming_time: state.total_streaming_time,
        };

        if let Err(e) = self.store.save() {
            error!(path = %self.store.path().display(), error = %e, "failed to save client state");
        }
        report
    }

    pub fn cleanup(&mut self, now: f64) -> io::Result<Vec<Ipv4Addr>> {
        self.store.cleanup(now, self.config.idle_timeout_secs)
    }
}

/// Accumulate packets and run them through the monitor every `batch_interval`,
/// evicting idle clients every `cleanup_interval`.
/// Returns once `running` is cleared or the capture side hangs up.
pub fn processing_loop(
    running: Arc<AtomicBool>,
    packet_rx: Receiver<PacketRecord>,
    outcome_tx: Sender<BatchOutcome>,
    mut monitor: Monitor,
    batch_interval: Duration,
    cleanup_interval: Duration,
) {
    let batch_tick = tick(batch_interval);
    let cleanup_tick = tick(cleanup_interval);
    let mut batch: Vec<PacketRecord> = Vec::new();

    let flush = |batch: &mut Vec<PacketRecord>, monitor: &mut Monitor| {
        if batch.is_empty() {
            return;
        }
        let outcome = monitor.process_batch(std::mem::take(batch), now_secs());
        let _ = outcome_tx.send(outcome);
    };

    let mut capture_done = false;
    loop {
        // While we're running
        if !running.load(Ordering::Relaxed) { break; }

        select! {
            recv(packet_rx) -> msg => {
                match msg {
                    Ok(pkt) => batch.push(pkt),
                    Err(_) => capture_done = true,
                }
            },

            recv(batch_tick) -> _ => flush(&mut batch, &mut monitor),

            // every save rewrites the whole table, so eviction lives in this process
            recv(cleanup_tick) -> _ => match monitor.cleanup(now_secs()) {
                Ok(evicted) if !evicted.is_empty() => {
                    info!(evicted = evicted.len(), remaining = monitor.store().len(), "idle clients evicted");
                }
                Ok(_) => {}
                Err(e) => error!(path = %monitor.store().path().display(), error = %e, "failed to save client state after cleanup"),
            },
        }

        if capture_done {
            // process what is left
            flush(&mut batch, &mut monitor);
            break;
        }
    }
    info!("processing loop exiting");
}
