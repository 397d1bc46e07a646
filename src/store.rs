use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::tracker::ClientState;

/// Durable client table, rewritten whole after every mutation.
pub struct StateStore {
    path: PathBuf,
    clients: BTreeMap<Ipv4Addr, ClientState>,
}

impl StateStore {
    /// Load the table. A missing or unreadable document starts an empty table.
    pub fn load<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        let clients = match Self::load_state(&path) {
            Ok(clients) => clients,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "state store unreadable, starting empty");
                BTreeMap::new()
            }
        };
        Self { path, clients }
    }

    fn load_state(path: &Path) -> Result<BTreeMap<Ipv4Addr, ClientState>, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(BTreeMap::new())
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn clients(&self) -> &BTreeMap<Ipv4Addr, ClientState> {
        &self.clients
    }

    pub fn get(&self, client: Ipv4Addr) -> Option<&ClientState> {
        self.clients.get(&client)
    }

    /// State for `client`, created on first observation.
    pub fn entry(&mut self, client: Ipv4Addr, now: f64) -> &mut ClientState {
        self.clients.entry(client).or_insert_with(|| ClientState::new(now))
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Serialize the whole table and swap it in with a rename, so a reader never sees half a document.
    pub fn save(&self) -> io::Result<()> {
        let content = serde_json::to_string_pretty(&self.clients)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let tmp_file = self.path.with_extension("tmp");
        fs::write(&tmp_file, content)?;
        fs::rename(&tmp_file, &self.path)?;
        Ok(())
    }

    /// Drop clients not seen for more than `timeout` seconds, then persist.
    pub fn cleanup(&mut self, now: f64, timeout: f64) -> io::Result<Vec<Ipv4Addr>> {
        let mut evicted = Vec::new();
        self.clients.retain(|ip, c| {
            let keep = now - c.last_seen <= timeout;
            if !keep {
                evicted.push(*ip);
            }
            keep
        });
        for ip in &evicted {
            info!(client = %ip, "removing inactive client");
        }
        self.save()?;
        Ok(evicted)
    }
}
