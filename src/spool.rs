//! The durable queue of packets we couldn't (or chose not to) deliver yet.
//! One file per packet, so a crash can never corrupt more than one entry.

use crate::descriptor::RoutingInfo;
use crate::lock::LockGuard;
use crate::prelude::*;
use crate::util::{create_private_dir, previous_midnight};
use rand::{CryptoRng, RngCore};
use std::fs::{self, File, OpenOptions};
use std::process::Command;

const SPOOL_MAGIC: &str = "PACKET-0";
const HANDLE_BYTES: usize = 8;

#[derive(Serialize, Deserialize)]
struct SpoolRecord {
    magic: String,
    #[serde(with = "serde_bytes")]
    packet: Vec<u8>,
    first_hop: RoutingInfo,
    queued_at: OffsetDateTime,
}

/// One row of `inspect` output: what's waiting for a given first hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoolSummary {
    pub first_hop: RoutingInfo,
    pub count: usize,
    /// Whole days since the oldest packet was queued.
    pub oldest_days: i64,
}

pub struct PacketSpool {
    dir: PathBuf,
    shred_command: Option<Vec<String>>,
}

impl PacketSpool {
    pub fn new(dir: &Path, shred_command: Option<Vec<String>>) -> Result<PacketSpool> {
        create_private_dir(dir)?;
        Ok(PacketSpool {
            dir: dir.to_path_buf(),
            shred_command,
        })
    }

    fn path_for(&self, handle: &str) -> PathBuf {
        self.dir.join(format!("pkt_{}", handle))
    }

    /// Durably queue a packet; returns its handle.
    pub fn enqueue<R: RngCore + CryptoRng>(
        &self,
        _lock: &LockGuard,
        rng: &mut R,
        packet: &[u8],
        first_hop: &RoutingInfo,
        now: OffsetDateTime,
    ) -> Result<String> {
        let record = SpoolRecord {
            magic: SPOOL_MAGIC.to_owned(),
            packet: packet.to_vec(),
            first_hop: first_hop.clone(),
            queued_at: previous_midnight(now),
        };
        let mut body = Vec::new();
        ciborium::ser::into_writer(&record, &mut body)?;
        loop {
            let mut raw = [0u8; HANDLE_BYTES];
            rng.fill_bytes(&mut raw);
            let handle = data_encoding::HEXLOWER.encode(&raw);
            let path = self.path_for(&handle);
            let mut f = match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e).wrap_err_with(|| {
                        format!("couldn't create spool entry {}", path.display())
                    })
                }
            };
            f.write_all(&body)?;
            f.sync_data()?;
            return Ok(handle);
        }
    }

    pub fn handles(&self, _lock: &LockGuard) -> Result<Vec<String>> {
        let mut handles = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if let Some(handle) = name.strip_prefix("pkt_") {
                handles.push(handle.to_owned());
            }
        }
        handles.sort();
        Ok(handles)
    }

    pub fn load(
        &self,
        handle: &str,
    ) -> Result<(Vec<u8>, RoutingInfo, OffsetDateTime)> {
        let f = File::open(self.path_for(handle))?;
        let record: SpoolRecord = ciborium::de::from_reader(f)?;
        if record.magic != SPOOL_MAGIC {
            return Err(MixError::SpoolBadFormat(handle.to_owned()).into());
        }
        Ok((record.packet, record.first_hop, record.queued_at))
    }

    pub fn exists(&self, handle: &str) -> bool {
        self.path_for(handle).exists()
    }

    /// Best-effort secure deletion: the configured shred command when there
    /// is one, otherwise overwrite-then-unlink.  Never fatal.
    pub fn remove(&self, _lock: &LockGuard, handle: &str) -> Result<()> {
        let path = self.path_for(handle);
        if let Some(cmd) = &self.shred_command {
            match Command::new(&cmd[0]).args(&cmd[1..]).arg(&path).status() {
                Ok(status) if status.success() => {
                    if !path.exists() {
                        return Ok(());
                    }
                    // shredder overwrote but left the file; fall through
                }
                Ok(status) => {
                    warn!("Shred command exited with {}; overwriting instead", status)
                }
                Err(e) => warn!("Couldn't run shred command ({}); overwriting instead", e),
            }
        }
        if let Err(e) = overwrite_with_zeros(&path) {
            warn!("Couldn't overwrite {}: {}", path.display(), e);
        }
        fs::remove_file(&path)
            .wrap_err_with(|| format!("couldn't remove {}", path.display()))
    }

    /// Per-first-hop counts and age of the oldest packet, sorted by server.
    pub fn inspect(
        &self,
        lock: &LockGuard,
        now: OffsetDateTime,
    ) -> Result<Vec<SpoolSummary>> {
        let mut oldest: HashMap<RoutingInfo, (usize, OffsetDateTime)> =
            HashMap::new();
        for handle in self.handles(lock)? {
            let (_, routing, queued_at) = match self.load(&handle) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable spool entry {}: {}", handle, e);
                    continue;
                }
            };
            oldest
                .entry(routing)
                .and_modify(|(count, when)| {
                    *count += 1;
                    if queued_at < *when {
                        *when = queued_at;
                    }
                })
                .or_insert((1, queued_at));
        }
        let mut rows: Vec<SpoolSummary> = oldest
            .into_iter()
            .map(|(first_hop, (count, when))| SpoolSummary {
                first_hop,
                count,
                oldest_days: (now - when).whole_days(),
            })
            .collect();
        rows.sort_by(|a, b| a.first_hop.to_string().cmp(&b.first_hop.to_string()));
        Ok(rows)
    }
}

impl SpoolSummary {
    /// "<1" for packets queued today, the day count otherwise.
    pub fn age(&self) -> String {
        if self.oldest_days < 1 {
            "<1".to_owned()
        } else {
            self.oldest_days.to_string()
        }
    }
}

fn overwrite_with_zeros(path: &Path) -> Result<()> {
    let len = fs::metadata(path)?.len();
    let mut f = OpenOptions::new().write(true).open(path)?;
    let zeros = vec![0u8; 1 << 16];
    let mut left = len;
    while left > 0 {
        let n = left.min(zeros.len() as u64) as usize;
        f.write_all(&zeros[..n])?;
        left -= n as u64;
    }
    f.sync_data()?;
    Ok(())
}
