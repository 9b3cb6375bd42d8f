//! The on-disk cache of server descriptors, fed by a downloaded directory
//! and individually imported descriptor files.

use crate::crypto::{self, Digest};
use crate::descriptor::{self, Capability, ServerDescriptor};
use crate::lock::ClientLock;
use crate::prelude::*;
use crate::util::{
    create_private_dir, format_date, format_fname_time, open_unique,
    previous_midnight, read_possibly_gzipped,
};
use std::fs::{self, File};
use time::Duration;
use url::Url;

pub static DIRECTORY_URL: Lazy<Url> = Lazy::new(|| {
    "http://www.mixminion.net/directory/latest.gz"
        .parse()
        .unwrap()
});

/// Fingerprint the downloaded directory's signing identity must carry.
pub const DIRECTORY_FINGERPRINT: &str =
    "CD80DD1B8BE7CA2E13C928D57499992D56579CCD";

const CACHE_MAGIC: &[u8] = b"mixminion-cache-0\n";

/// When a caller doesn't say how long servers must remain valid, require
/// this much.
pub const DEFAULT_REQUIRED_LIFETIME: Duration = Duration::HOUR;

/// Imported descriptors get this much slack past expiry before `clean`
/// discards them.
const EXPIRY_SLACK: Duration = Duration::seconds(600);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    /// Came from the downloaded directory.
    Directory,
    /// Imported from a file; the payload is the name under imported/.
    Imported(String),
}

impl Origin {
    fn is_imported(&self) -> bool {
        matches!(self, Origin::Imported(_))
    }
}

#[derive(Deserialize)]
struct CacheFile {
    last_modified: Option<OffsetDateTime>,
    last_download: Option<OffsetDateTime>,
    servers: Vec<(ServerDescriptor, Origin)>,
    digests: HashMap<Digest, Origin>,
}

// Serialization twin of CacheFile, so saving doesn't clone the whole
// descriptor list.  Field names must stay in sync.
#[derive(Serialize)]
struct CacheFileRef<'a> {
    last_modified: &'a Option<OffsetDateTime>,
    last_download: &'a Option<OffsetDateTime>,
    servers: &'a Vec<(ServerDescriptor, Origin)>,
    digests: &'a HashMap<Digest, Origin>,
}

pub struct ClientDirectory<'a> {
    dir: PathBuf,
    lock: &'a ClientLock,
    agent: ureq::Agent,
    last_modified: Option<OffsetDateTime>,
    last_download: Option<OffsetDateTime>,
    server_list: Vec<(ServerDescriptor, Origin)>,
    digest_map: HashMap<Digest, Origin>,
    // derived tables; rebuilt on every load, never persisted
    by_nickname: HashMap<String, Vec<usize>>,
    by_capability: HashMap<Capability, Vec<usize>>,
}

impl<'a> ClientDirectory<'a> {
    /// Open (and if needed rebuild) the descriptor cache under `dir`.
    pub fn open(
        dir: &Path,
        lock: &'a ClientLock,
        agent: ureq::Agent,
    ) -> Result<ClientDirectory<'a>> {
        create_private_dir(dir)?;
        let mut d = ClientDirectory {
            dir: dir.to_path_buf(),
            lock,
            agent,
            last_modified: None,
            last_download: None,
            server_list: Vec::new(),
            digest_map: HashMap::new(),
            by_nickname: HashMap::new(),
            by_capability: HashMap::new(),
        };
        create_private_dir(&d.imported_dir())?;
        let guard = lock.acquire()?;
        d.load(false)?;
        d.clean(OffsetDateTime::now_utc())?;
        drop(guard);
        Ok(d)
    }

    fn cache_path(&self) -> PathBuf {
        self.dir.join("cache")
    }

    fn imported_dir(&self) -> PathBuf {
        self.dir.join("imported")
    }

    pub fn last_download(&self) -> Option<OffsetDateTime> {
        self.last_download
    }

    pub fn last_modified(&self) -> Option<OffsetDateTime> {
        self.last_modified
    }

    /// Read the cache file, falling back to a rescan when it is missing,
    /// corrupt, or from another cache version.  `scanning` guards against
    /// a rescan that produces an unreadable cache.
    fn load(&mut self, scanning: bool) -> Result<()> {
        match self.try_read_cache() {
            Ok(Some(cached)) => {
                self.last_modified = cached.last_modified;
                self.last_download = cached.last_download;
                self.server_list = cached.servers;
                self.digest_map = cached.digests;
                self.rebuild_tables();
                return Ok(());
            }
            Ok(None) => info!("No server cache; rebuilding"),
            Err(e) => info!("Couldn't read server cache ({}); rebuilding", e),
        }
        if scanning {
            return Err(MixError::CacheCorrupt.into());
        }
        self.rescan(false)
    }

    fn try_read_cache(&self) -> Result<Option<CacheFile>> {
        let bytes = match fs::read(self.cache_path()) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let body = bytes
            .strip_prefix(CACHE_MAGIC)
            .ok_or_else(|| eyre!("bad magic on server cache"))?;
        Ok(Some(ciborium::de::from_reader(body)?))
    }

    fn save(&self) -> Result<()> {
        let mut buf = CACHE_MAGIC.to_vec();
        ciborium::ser::into_writer(
            &CacheFileRef {
                last_modified: &self.last_modified,
                last_download: &self.last_download,
                servers: &self.server_list,
                digests: &self.digest_map,
            },
            &mut buf,
        )?;
        let new = self.dir.join("cache.new");
        let mut f = File::create(&new)?;
        f.write_all(&buf)?;
        f.sync_data()?;
        drop(f);
        fs::rename(&new, self.cache_path())?;
        Ok(())
    }

    fn rebuild_tables(&mut self) {
        self.by_nickname.clear();
        self.by_capability.clear();
        for (idx, (info, _)) in self.server_list.iter().enumerate() {
            self.by_nickname
                .entry(info.lc_nickname())
                .or_default()
                .push(idx);
            for &cap in info.capabilities() {
                self.by_capability.entry(cap).or_default().push(idx);
            }
        }
    }

    /// Regenerate the cache from the files on disk.  With `force`, the
    /// digest map is dropped too, so everything is re-validated.
    pub fn rescan(&mut self, force: bool) -> Result<()> {
        let _guard = self.lock.acquire()?;
        self.last_modified = None;
        self.last_download = None;
        self.server_list.clear();
        if force {
            self.digest_map.clear();
        }

        // Read the servers from the downloaded directory, preferring the
        // compressed flavor.
        for fname in ["dir.gz", "dir"] {
            let path = self.dir.join(fname);
            if !path.exists() {
                continue;
            }
            let mtime = file_mtime(&path)?;
            self.last_download = Some(mtime);
            self.last_modified = Some(mtime);
            let parsed = read_possibly_gzipped(&path)
                .map_err(|e| e.to_string())
                .and_then(|raw| {
                    String::from_utf8(raw)
                        .map_err(|_| "not valid utf-8".to_owned())
                })
                .and_then(|text| {
                    descriptor::parse_directory(&text).map_err(|e| e.to_string())
                });
            match parsed {
                Err(e) => {
                    warn!("Ignoring invalid directory {}: {}", path.display(), e);
                    continue;
                }
                Ok(parsed) => {
                    for info in parsed.servers {
                        self.digest_map.insert(*info.digest(), Origin::Directory);
                        self.server_list.push((info, Origin::Directory));
                    }
                }
            }
            break;
        }

        // Now the individually imported descriptors.
        create_private_dir(&self.imported_dir())?;
        let mut names: Vec<String> = Vec::new();
        for entry in fs::read_dir(self.imported_dir())? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        for name in names {
            let path = self.imported_dir().join(&name);
            let info = match descriptor::parse_descriptor_file(&path) {
                Ok(info) => info,
                Err(e) => {
                    warn!("Invalid server descriptor {}: {}", path.display(), e);
                    continue;
                }
            };
            let mtime = file_mtime(&path)?;
            if self.last_modified.map_or(true, |t| mtime > t) {
                self.last_modified = Some(mtime);
            }
            self.digest_map
                .insert(*info.digest(), Origin::Imported(name.clone()));
            self.server_list.push((info, Origin::Imported(name)));
        }

        self.save()?;
        // Reload once, to make sure the cache file is readable and to
        // rebuild the derived tables.
        self.load(true)
    }

    /// Fetch a fresh directory if we haven't downloaded one since the most
    /// recent midnight (or unconditionally, with `force`).
    pub fn update_directory(&mut self, force: bool, now: OffsetDateTime) -> Result<()> {
        let _guard = self.lock.acquire()?;
        let stale = self
            .last_download
            .map_or(true, |t| t < previous_midnight(now));
        if force || stale {
            self.download_directory()
        } else {
            debug!("Directory is up to date.");
            Ok(())
        }
    }

    fn download_directory(&mut self) -> Result<()> {
        let url = &*DIRECTORY_URL;
        context!("downloading server directory");
        info!("Downloading directory from {}", url);
        let gz = url.path().ends_with(".gz");
        let tmp_path = self
            .dir
            .join(if gz { "dir_new.gz" } else { "dir_new" });

        let response = self
            .agent
            .get(url.as_str())
            .call()
            .map_err(|e| MixError::DirectoryDownloadFailed(e.to_string()))?;
        let mut out = File::create(&tmp_path)?;
        std::io::copy(&mut response.into_reader(), &mut out)
            .map_err(|e| MixError::DirectoryDownloadFailed(e.to_string()))?;
        out.sync_data()?;
        drop(out);

        info!("Validating directory");
        let text = read_possibly_gzipped(&tmp_path).and_then(|raw| {
            String::from_utf8(raw).map_err(|_| eyre!("not valid utf-8"))
        });
        let parsed = text
            .and_then(|t| descriptor::parse_directory(&t))
            .map_err(|e| MixError::DirectoryInvalid(e.to_string()))?;
        if crypto::fingerprint(&parsed.signer_identity) != DIRECTORY_FINGERPRINT {
            return Err(MixError::DirectoryBadIdentity.into());
        }

        // Drop the stale cache, install the new directory, and rebuild.
        match fs::remove_file(self.cache_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::rename(&tmp_path, self.dir.join(if gz { "dir.gz" } else { "dir" }))?;
        self.rescan(false)
    }

    /// Import a single descriptor file into the cache.
    pub fn import_from_file(&mut self, path: &Path) -> Result<()> {
        context!("importing {}", path.display());
        let _guard = self.lock.acquire()?;
        let info = descriptor::parse_descriptor_file(path)?;
        let nickname = info.nickname().to_owned();
        let lc = info.lc_nickname();

        // The identity key must be consistent with every descriptor we
        // already have for this nickname.
        for (known, _) in &self.server_list {
            if known.lc_nickname() == lc && !known.same_identity(&info) {
                return Err(MixError::IdentityKeyConflict(nickname).into());
            }
        }

        if matches!(self.digest_map.get(info.digest()), Some(Origin::Imported(_))) {
            return Err(MixError::AlreadyImported.into());
        }

        let now = OffsetDateTime::now_utc();
        if info.is_expired_at(now) {
            return Err(MixError::DescriptorExpired.into());
        }

        if let Some(idxs) = self.by_nickname.get(&lc) {
            let others = idxs.iter().map(|&i| &self.server_list[i].0);
            if info.is_superseded_by(others) {
                return Err(MixError::DescriptorSuperseded.into());
            }
        }

        // Keep a copy under imported/, uniquified on collision.
        let short = format!("{}-{}", nickname, format_fname_time(now));
        let (mut f, written) = open_unique(self.imported_dir().join(short))?;
        f.write_all(info.raw().as_bytes())?;
        f.sync_data()?;
        drop(f);
        let short = written
            .file_name()
            .ok_or_else(|| eyre!("imported path has no file name"))?
            .to_string_lossy()
            .into_owned();

        self.digest_map
            .insert(*info.digest(), Origin::Imported(short.clone()));
        self.server_list.push((info, Origin::Imported(short)));
        self.last_modified = Some(now);
        self.save()?;
        self.rebuild_tables();
        Ok(())
    }

    /// Remove every imported descriptor with the given nickname; returns
    /// how many were dropped.
    pub fn expunge(&mut self, nickname: &str) -> Result<usize> {
        let _guard = self.lock.acquire()?;
        let lc = nickname.to_lowercase();
        let imported = self.imported_dir();
        let mut removed = 0;
        let mut kept = Vec::with_capacity(self.server_list.len());
        for (info, origin) in self.server_list.drain(..) {
            match &origin {
                Origin::Imported(fname) if info.lc_nickname() == lc => {
                    removed += 1;
                    let path = imported.join(fname);
                    if let Err(e) = fs::remove_file(&path) {
                        error!("Couldn't remove {}: {}", path.display(), e);
                    }
                }
                _ => kept.push((info, origin)),
            }
        }
        self.server_list = kept;
        if removed > 0 {
            self.last_modified = Some(OffsetDateTime::now_utc());
            self.save()?;
            self.rebuild_tables();
        }
        Ok(removed)
    }

    /// Drop imported descriptors that are expired (with some slack),
    /// superseded, or duplicated by the downloaded directory.
    pub fn clean(&mut self, now: OffsetDateTime) -> Result<()> {
        let _guard = self.lock.acquire()?;
        let cutoff = now - EXPIRY_SLACK;

        let mut drop_idx = Vec::new();
        for (idx, (info, origin)) in self.server_list.iter().enumerate() {
            if !origin.is_imported() {
                continue;
            }
            let siblings = match self.by_nickname.get(&info.lc_nickname()) {
                Some(idxs) => idxs.as_slice(),
                None => &[],
            };
            let superseded = info
                .is_superseded_by(siblings.iter().map(|&i| &self.server_list[i].0));
            let in_directory = siblings.iter().any(|&i| {
                self.server_list[i].1 == Origin::Directory
                    && self.server_list[i].0.digest() == info.digest()
            });
            if info.is_expired_at(cutoff) || superseded || in_directory {
                drop_idx.push(idx);
            }
        }
        if drop_idx.is_empty() {
            return Ok(());
        }

        for &idx in &drop_idx {
            if let (_, Origin::Imported(fname)) = &self.server_list[idx] {
                let path = self.imported_dir().join(fname);
                if let Err(e) = fs::remove_file(&path) {
                    info!("Couldn't remove {}: {}", path.display(), e);
                }
            }
        }
        let mut idx = 0;
        self.server_list.retain(|_| {
            let keep = !drop_idx.contains(&idx);
            idx += 1;
            keep
        });
        self.save()?;
        self.rebuild_tables();
        Ok(())
    }

    /// Find the descriptor for `name` (a nickname or a descriptor file
    /// path) valid over [start, end].  Unknown names yield None.
    pub fn get_server(
        &self,
        name: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Option<ServerDescriptor>> {
        if let Some(idxs) = self.by_nickname.get(&name.to_lowercase()) {
            return match self.find(idxs, start, end).pop() {
                Some(info) => Ok(Some(info)),
                None => Err(MixError::NoValidDescriptor(name.to_owned()).into()),
            };
        }
        let path = crate::util::expand_user(name);
        if path.exists() {
            return Ok(Some(descriptor::parse_descriptor_file(&path)?));
        }
        Ok(None)
    }

    /// Like `get_server`, but an unknown name is an error.
    pub fn require_server(
        &self,
        name: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<ServerDescriptor> {
        self.get_server(name, start, end)?
            .ok_or_else(|| MixError::UnknownDescriptor(name.to_owned()).into())
    }

    /// All servers with the given capability (or all servers, for None)
    /// that are continuously valid over [start, end], one per nickname.
    pub fn candidates(
        &self,
        capability: Option<Capability>,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Vec<ServerDescriptor> {
        static EMPTY: Vec<usize> = Vec::new();
        let idxs = match capability {
            None => {
                let all: Vec<usize> = (0..self.server_list.len()).collect();
                return self.find(&all, start, end);
            }
            Some(cap) => self.by_capability.get(&cap).unwrap_or(&EMPTY),
        };
        self.find(idxs, start, end)
    }

    /// Deduplicate by nickname, keeping the most recently published
    /// descriptor that covers the interval.
    fn find(
        &self,
        idxs: &[usize],
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Vec<ServerDescriptor> {
        let mut best: HashMap<String, &ServerDescriptor> = HashMap::new();
        for &i in idxs {
            let info = &self.server_list[i].0;
            if !info.is_valid_over(start, end) {
                continue;
            }
            match best.entry(info.lc_nickname()) {
                std::collections::hash_map::Entry::Vacant(v) => {
                    v.insert(info);
                }
                std::collections::hash_map::Entry::Occupied(mut o) => {
                    if info.is_newer_than(o.get()) {
                        o.insert(info);
                    }
                }
            }
        }
        let mut found: Vec<ServerDescriptor> =
            best.into_values().cloned().collect();
        found.sort_by(|a, b| a.lc_nickname().cmp(&b.lc_nickname()));
        found
    }

    /// A linewise listing of the known servers and their capabilities.
    pub fn list_servers(&self) -> Vec<String> {
        let mut nicknames: Vec<&String> = self.by_nickname.keys().collect();
        nicknames.sort();
        if nicknames.is_empty() {
            return vec!["No servers known".to_owned()];
        }
        let mut lines = Vec::new();
        for lc in nicknames {
            let idxs = &self.by_nickname[lc];
            lines.push(format!("{}:", self.server_list[idxs[0]].0.nickname()));
            for &i in idxs {
                let info = &self.server_list[i].0;
                let caps: Vec<String> = info
                    .capabilities()
                    .iter()
                    .map(|c| c.to_string())
                    .collect();
                lines.push(format!(
                    "   {:>15} (valid {} to {})",
                    caps.join(" "),
                    format_date(info.valid_after()),
                    format_date(info.valid_until()),
                ));
            }
        }
        lines
    }

    #[cfg(test)]
    pub fn servers_with_origins(&self) -> &[(ServerDescriptor, Origin)] {
        &self.server_list
    }

    #[cfg(test)]
    pub fn digest_map(&self) -> &HashMap<Digest, Origin> {
        &self.digest_map
    }
}

fn file_mtime(path: &Path) -> Result<OffsetDateTime> {
    Ok(fs::metadata(path)?.modified()?.into())
}
