use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition { Started, Stopped, Unchanged }

/// Per-client streaming state, persisted as-is in the state store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientState {
    pub is_streaming: bool,
    pub consecutive_streaming_count: u32,
    pub consecutive_not_streaming_count: u32,
    /// Start of the not-yet-accrued part of the current session
    pub streaming_start_time: Option<f64>,
    pub total_streaming_time: f64,
    pub last_seen: f64,
    /// Batches in which each server was contacted while streaming
    #[serde(default)]
    pub server_ips: BTreeMap<Ipv4Addr, u64>,
    #[serde(default)]
    pub is_blocked: bool,
}

impl ClientState {
    pub fn new(now: f64) -> Self {
        Self {
            is_streaming: false,
            consecutive_streaming_count: 0,
            consecutive_not_streaming_count: 0,
            streaming_start_time: None,
            total_streaming_time: 0.0,
            last_seen: now,
            server_ips: BTreeMap::new(),
            is_blocked: false,
        }
    }

    /// Feed one batch verdict through the hysteresis state machine.
    ///
    /// `hysteresis` consecutive verdicts in the same direction are needed to
    /// flip state; one opposite verdict resets the run. Streaming time is
    /// accrued on every update while streaming, not only when the session ends.
    pub fn observe<'a, I>(&mut self, streaming: bool, servers: I, now: f64, hysteresis: u32) -> Transition
    where
        I: IntoIterator<Item = &'a Ipv4Addr>,
    {
        self.last_seen = now;

        if streaming {
            self.consecutive_streaming_count += 1;
            self.consecutive_not_streaming_count = 0;
        } else {
            self.consecutive_not_streaming_count += 1;
            self.consecutive_streaming_count = 0;
        }

        let mut transition = Transition::Unchanged;
        if !self.is_streaming && self.consecutive_streaming_count >= hysteresis {
            self.is_streaming = true;
            self.streaming_start_time = Some(now);
            transition = Transition::Started;
        } else if self.is_streaming && self.consecutive_not_streaming_count >= hysteresis {
            self.is_streaming = false;
            self.accrue(now);
            self.streaming_start_time = None;
            transition = Transition::Stopped;
        }

        if self.is_streaming {
            self.accrue(now);
            self.streaming_start_time = Some(now);
            for ip in servers {
                *self.server_ips.entry(*ip).or_insert(0) += 1;
            }
        }

        transition
    }

    fn accrue(&mut self, now: f64) {
        if let Some(start) = self.streaming_start_time {
            // a clock step backwards must not shrink the total
            self.total_streaming_time += (now - start).max(0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: u32 = 3;

    fn servers() -> Vec<Ipv4Addr> {
        vec![Ipv4Addr::new(8, 8, 8, 8)]
    }

    #[test]
    fn starts_streaming_on_third_consecutive_verdict() {
        let mut c = ClientState::new(0.0);
        assert_eq!(c.observe(true, &servers(), 10.0, H), Transition::Unchanged);
        assert_eq!(c.observe(true, &servers(), 20.0, H), Transition::Unchanged);
        assert!(!c.is_streaming);
        assert!(c.server_ips.is_empty());

        assert_eq!(c.observe(true, &servers(), 30.0, H), Transition::Started);
        assert!(c.is_streaming);
        assert_eq!(c.streaming_start_time, Some(30.0));
        assert_eq!(c.total_streaming_time, 0.0);
        assert_eq!(c.server_ips[&Ipv4Addr::new(8, 8, 8, 8)], 1);
    }

    #[test]
    fn accrues_time_incrementally_while_streaming() {
        let mut c = ClientState::new(0.0);
        for t in [10.0, 20.0, 30.0, 40.0, 50.0] {
            c.observe(true, &servers(), t, H);
        }
        assert!((c.total_streaming_time - 20.0).abs() < 1e-9);
        assert_eq!(c.streaming_start_time, Some(50.0));
        assert_eq!(c.server_ips[&Ipv4Addr::new(8, 8, 8, 8)], 3);
        assert!(!c.is_blocked);
    }

    #[test]
    fn opposite_verdict_resets_the_run() {
        let mut c = ClientState::new(0.0);
        c.observe(true, &servers(), 10.0, H);
        c.observe(true, &servers(), 20.0, H);
        c.observe(false, &servers(), 30.0, H);
        assert_eq!(c.consecutive_streaming_count, 0);
        assert_eq!(c.consecutive_not_streaming_count, 1);
        c.observe(true, &servers(), 40.0, H);
        c.observe(true, &servers(), 50.0, H);
        assert!(!c.is_streaming);
        c.observe(true, &servers(), 60.0, H);
        assert!(c.is_streaming);
    }

    #[test]
    fn stops_after_three_negative_verdicts() {
        let mut c = ClientState::new(0.0);
        for t in [10.0, 20.0, 30.0, 40.0] {
            c.observe(true, &servers(), t, H);
        }
        let total = c.total_streaming_time;

        assert_eq!(c.observe(false, &servers(), 50.0, H), Transition::Unchanged);
        assert!(c.is_streaming);
        c.observe(false, &servers(), 60.0, H);
        assert_eq!(c.observe(false, &servers(), 70.0, H), Transition::Stopped);

        assert!(!c.is_streaming);
        assert_eq!(c.streaming_start_time, None);
        // time keeps accruing through the negative run until the flip
        assert!((c.total_streaming_time - (total + 30.0)).abs() < 1e-9);

        let stopped_total = c.total_streaming_time;
        c.observe(false, &servers(), 80.0, H);
        assert_eq!(c.total_streaming_time, stopped_total);
    }

    #[test]
    fn exactly_one_counter_is_nonzero_and_total_never_drops() {
        let mut c = ClientState::new(0.0);
        let pattern = [true, true, false, true, true, true, false, true, false, false, false, true];
        let mut last_total = 0.0;
        for (i, s) in pattern.iter().enumerate() {
            c.observe(*s, &servers(), 10.0 * (i + 1) as f64, H);
            assert!((c.consecutive_streaming_count == 0) != (c.consecutive_not_streaming_count == 0));
            assert_eq!(c.streaming_start_time.is_some(), c.is_streaming);
            assert!(c.total_streaming_time >= last_total);
            last_total = c.total_streaming_time;
        }
    }

    #[test]
    fn clock_going_backwards_does_not_reduce_total() {
        let mut c = ClientState::new(0.0);
        for t in [10.0, 20.0, 30.0, 40.0] {
            c.observe(true, &servers(), t, H);
        }
        let total = c.total_streaming_time;
        c.observe(true, &servers(), 35.0, H);
        assert_eq!(c.total_streaming_time, total);
    }

    #[test]
    fn missing_optional_fields_deserialize() {
        let doc = r#"{"is_streaming": false, "consecutive_streaming_count": 0,
            "consecutive_not_streaming_count": 2, "streaming_start_time": null,
            "total_streaming_time": 12.5, "last_seen": 100.0}"#;
        let c: ClientState = serde_json::from_str(doc).unwrap();
        assert!(!c.is_blocked);
        assert!(c.server_ips.is_empty());
        assert_eq!(c.total_streaming_time, 12.5);
    }
}
