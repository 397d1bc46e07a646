use crossbeam_channel::{select, tick, Receiver};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::types::BatchStats;
use super::engine::{BatchOutcome, ClientReport};

/// One status line per client verdict.
pub fn status_line(report: &ClientReport, threshold: f32) -> String {
    let status = if report.is_blocked { "BLOCKED" } else { "ALLOWED" };
    let activity = if report.verdict.is_streaming { "IS STREAMING" } else { "is NOT streaming" };
    format!(
        "Client: {:<15} | Status: {:<7} | Activity: {:<16} | Score/Threshold: {:3.0}%/{:3.0}%",
        report.client.to_string(),
        status,
        activity,
        100.0 * report.verdict.score(),
        100.0 * threshold,
    )
}

fn accumulate(total: &mut BatchStats, batch: &BatchStats) {
    total.packets += batch.packets;
    total.classified += batch.classified;
    total.clients += batch.clients;
    total.windows += batch.windows;
    total.dropped_windows += batch.dropped_windows;
    total.blocked += batch.blocked;
}

pub fn publisher_loop(
    running: Arc<AtomicBool>,
    outcome_rx: Receiver<BatchOutcome>,
    threshold: f32,
) {
    let emit_tick = tick(Duration::from_millis(250));
    let mut totals = BatchStats::default();
    let mut dirty = false;

    loop {
        if !running.load(Ordering::Relaxed) && outcome_rx.is_empty() { break; }

        select! {
            recv(outcome_rx) -> msg => {
                if let Ok(outcome) = msg {
                    for report in &outcome.reports {
                        info!(target: "streamwarden::status", "{}", status_line(report, threshold));
                    }
                    accumulate(&mut totals, &outcome.stats);
                    dirty = true;
                }
            }
            recv(emit_tick) -> _ => {
                if dirty {
                    info!(
                        packets = totals.packets,
                        classified = totals.classified,
                        windows = totals.windows,
                        dropped_windows = totals.dropped_windows,
                        blocked = totals.blocked,
                        "traffic totals"
                    );
                    dirty = false;
                }
            }
        }
    }
}
