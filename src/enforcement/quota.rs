use std::cmp::Reverse;
use std::collections::HashSet;
use std::io;
use std::net::Ipv4Addr;
use tracing::{debug, info};

use super::Blocklist;
use crate::tracker::ClientState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enforcement {
    /// Not streaming, or still under quota
    WithinQuota,
    Blocked(Ipv4Addr),
    /// Over quota, but every contacted server is already on the blocklist
    NothingToBlock,
    /// Over quota, but the blocklist could not be read or written
    Failed,
}

#[derive(Debug, Clone, Copy)]
pub struct QuotaManager {
    quota_secs: f64,
}

impl QuotaManager {
    pub fn new(quota_secs: f64) -> Self {
        Self { quota_secs }
    }

    /// Block at most one server for a client that is streaming past its quota.
    ///
    /// Candidates are ranked by traffic count descending, then address
    /// ascending. The first one not yet on the blocklist is appended, and
    /// only then is `is_blocked` latched.
    pub fn enforce(&self, client: Ipv4Addr, state: &mut ClientState, blocklist: &Blocklist) -> io::Result<Enforcement> {
        if !state.is_streaming || state.total_streaming_time <= self.quota_secs {
            return Ok(Enforcement::WithinQuota);
        }
        if !state.is_blocked {
            info!(%client, total_secs = state.total_streaming_time, "client exceeded streaming quota");
        }

        let mut ranked: Vec<(Ipv4Addr, u64)> = state.server_ips.iter().map(|(ip, n)| (*ip, *n)).collect();
        ranked.sort_by_key(|(ip, n)| (Reverse(*n), *ip));

        let blocked: HashSet<String> = blocklist.entries()?.into_iter().collect();
        let Some((server, _)) = ranked.into_iter().find(|(ip, _)| !blocked.contains(&ip.to_string())) else {
            debug!(%client, "all contacted servers already blocked");
            return Ok(Enforcement::NothingToBlock);
        };

        blocklist.append(server)?;
        state.is_blocked = true;
        info!(%client, %server, "blocking server");
        Ok(Enforcement::Blocked(server))
    }
}
