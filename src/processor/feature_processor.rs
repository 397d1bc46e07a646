use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::error::Error;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::types::PacketRecord;
use super::engine::{self, BatchOutcome, Monitor};
use super::publisher;

/// Owns the batch processing and status publishing threads.
pub struct FeatureProcessor {
    running: Arc<AtomicBool>,
    processing_thread: Option<JoinHandle<()>>,
    publisher_thread: Option<JoinHandle<()>>,
    packet_tx: Option<Sender<PacketRecord>>,
    packet_rx: Receiver<PacketRecord>,
    outcome_tx: Sender<BatchOutcome>,
    outcome_rx: Receiver<BatchOutcome>,
}

impl FeatureProcessor {
    /// `capacity` bounds the capture hand-off; a full channel stalls the sniffer.
    pub fn new(capacity: usize) -> Self {
        let (packet_tx, packet_rx) = bounded(capacity);
        let (outcome_tx, outcome_rx) = unbounded();
        Self {
            running: Arc::new(AtomicBool::new(false)),
            processing_thread: None,
            publisher_thread: None,
            packet_tx: Some(packet_tx),
            packet_rx,
            outcome_tx,
            outcome_rx,
        }
    }

    /// Hand out senders before starting; the processor drops its own on start.
    pub fn get_sender(&self) -> Option<Sender<PacketRecord>> { self.packet_tx.clone() }

    pub fn start_processor(
        &mut self,
        monitor: Monitor,
        batch_interval: Duration,
        cleanup_interval: Duration,
        threshold: f32,
    ) -> Result<(), Box<dyn Error>> {
        if self.running.load(Ordering::Relaxed) {
            return Err("Processor is already running".into());
        }
        self.running.store(true, Ordering::Relaxed);
        self.packet_tx = None;

        let processing = {
            let running = self.running.clone();
            let rx = self.packet_rx.clone();
            let outcome_tx = self.outcome_tx.clone();
            thread::spawn(move || {
                engine::processing_loop(running, rx, outcome_tx, monitor, batch_interval, cleanup_interval)
            })
        };

        let publisher = {
            let running = self.running.clone();
            let outcome_rx = self.outcome_rx.clone();
            thread::spawn(move || publisher::publisher_loop(running, outcome_rx, threshold))
        };

        self.processing_thread = Some(processing);
        self.publisher_thread = Some(publisher);
        Ok(())
    }

    /// Block until capture has ended and the last batch is processed, then stop publishing.
    pub fn wait(&mut self) {
        if let Some(h) = self.processing_thread.take() { let _ = h.join(); }
        self.running.store(false, Ordering::Relaxed);
        if let Some(h) = self.publisher_thread.take() { let _ = h.join(); }
    }
}
