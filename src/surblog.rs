//! The replay-prevention log: which reply blocks we've already used, keyed
//! by the SHA-1 of their packed form.  Only ever open while the client
//! lock is held, which the constructor enforces by borrowing the guard.

use crate::crypto::sha1;
use crate::lock::LockGuard;
use crate::packet::ReplyBlock;
use crate::prelude::*;
use crate::util::{atomic_write, create_private_dir};
use std::fs;
use time::Duration;

const LAST_CLEANED_KEY: &str = "LAST_CLEANED";

/// Entries expiring within this much of `now` are dropped by `clean`.
const CLEAN_HORIZON: Duration = Duration::HOUR;

/// How stale LAST_CLEANED may get before opening triggers a clean.
const AUTO_CLEAN_AFTER: Duration = Duration::hours(24);

pub struct SurbLog<'l> {
    _lock: &'l LockGuard<'l>,
    path: PathBuf,
    // hex SHA-1 of the packed reply block -> its expiry (unix seconds)
    entries: HashMap<String, i64>,
    last_cleaned: i64,
}

impl<'l> SurbLog<'l> {
    pub fn open(
        lock: &'l LockGuard<'l>,
        path: &Path,
        now: OffsetDateTime,
    ) -> Result<SurbLog<'l>> {
        if let Some(parent) = path.parent() {
            create_private_dir(parent)?;
        }
        debug!("Opening reply block log");
        let mut entries = HashMap::new();
        let mut last_cleaned = 0i64;
        match fs::read_to_string(path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .wrap_err_with(|| format!("couldn't read {}", path.display()))
            }
            Ok(text) => {
                for line in text.lines() {
                    let mut words = line.split_whitespace();
                    let (Some(key), Some(value)) = (words.next(), words.next())
                    else {
                        continue;
                    };
                    let value: i64 = value.parse().wrap_err_with(|| {
                        format!("bad entry in {}", path.display())
                    })?;
                    if key == LAST_CLEANED_KEY {
                        last_cleaned = value;
                    } else {
                        entries.insert(key.to_owned(), value);
                    }
                }
            }
        }
        let mut log = SurbLog {
            _lock: lock,
            path: path.to_path_buf(),
            entries,
            last_cleaned,
        };
        if log.last_cleaned < (now - AUTO_CLEAN_AFTER).unix_timestamp() {
            log.clean(now)?;
        }
        Ok(log)
    }

    fn key(surb: &ReplyBlock) -> String {
        data_encoding::HEXLOWER.encode(&sha1(&[&surb.pack()]))
    }

    pub fn is_used(&self, surb: &ReplyBlock) -> bool {
        self.entries.contains_key(&Self::key(surb))
    }

    /// Record that `surb` has been spent.  Durable before this returns, so
    /// a crash can lose the reply packet but never reuse the block.
    pub fn mark_used(&mut self, surb: &ReplyBlock) -> Result<()> {
        self.entries
            .insert(Self::key(surb), surb.expiry().unix_timestamp());
        self.save()
    }

    /// Drop entries whose reply blocks expire within the hour; they can
    /// never be marked used again, so there is nothing left to prevent.
    pub fn clean(&mut self, now: OffsetDateTime) -> Result<()> {
        let cutoff = (now + CLEAN_HORIZON).unix_timestamp();
        self.entries.retain(|_, &mut expiry| expiry >= cutoff);
        self.last_cleaned = now.unix_timestamp();
        self.save()
    }

    pub fn close(self) -> Result<()> {
        // every mutation saved eagerly; nothing left to flush
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let mut keys: Vec<&String> = self.entries.keys().collect();
        keys.sort();
        let mut out = String::new();
        for key in keys {
            out.push_str(&format!("{} {}\n", key, self.entries[key]));
        }
        out.push_str(&format!("{} {}\n", LAST_CLEANED_KEY, self.last_cleaned));
        atomic_write(&self.path, out.as_bytes())
    }
}
