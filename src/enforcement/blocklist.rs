use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// Newline-delimited list of denied server addresses, consumed by the firewall.
///
/// Append-only. The file is re-read on every query so entries added by
/// another writer are honoured.
#[derive(Debug, Clone)]
pub struct Blocklist {
    path: PathBuf,
}

impl Blocklist {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current entries in file order. A missing file is an empty list.
    pub fn entries(&self) -> io::Result<Vec<String>> {
        match fs::read_to_string(&self.path) {
            Ok(s) => Ok(s
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Append one address. Callers check membership first; the file format does not dedupe.
    ///
    /// A hand-edited file may lack its final newline, so one is supplied
    /// before the new entry rather than gluing it onto the last line.
    pub fn append(&self, addr: Ipv4Addr) -> io::Result<()> {
        let mut f = OpenOptions::new().read(true).create(true).append(true).open(&self.path)?;
        let line = if ends_mid_line(&mut f)? { format!("\n{addr}\n") } else { format!("{addr}\n") };
        // one write per entry keeps concurrent appenders from interleaving
        f.write_all(line.as_bytes())?;
        f.flush()
    }
}

fn ends_mid_line(f: &mut fs::File) -> io::Result<bool> {
    if f.metadata()?.len() == 0 {
        return Ok(false);
    }
    f.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    f.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}
