use crate::prelude::*;
use std::fs::{self, File};
use std::io;
use time::{Duration, Time, UtcOffset};

pub fn slurp(r: &mut dyn Read) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    r.read_to_end(&mut buf)?;
    Ok(buf)
}

// fs2's lock_exclusive on Unix is a thin wrapper around flock(2), and in
// particular doesn't handle EINTR.
pub fn retry_interrupted<T, F>(mut f: F) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    loop {
        match f() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            result => return result,
        }
    }
}

/// The UTC midnight at or before `t`.
pub fn previous_midnight(t: OffsetDateTime) -> OffsetDateTime {
    t.to_offset(UtcOffset::UTC).replace_time(Time::MIDNIGHT)
}

/// The UTC midnight strictly after `t`.
pub fn succeeding_midnight(t: OffsetDateTime) -> OffsetDateTime {
    previous_midnight(t) + Duration::days(1)
}

pub fn format_date(t: OffsetDateTime) -> String {
    let t = t.to_offset(UtcOffset::UTC);
    format!("{:04}-{:02}-{:02}", t.year(), u8::from(t.month()), t.day())
}

pub fn format_time(t: OffsetDateTime) -> String {
    let t = t.to_offset(UtcOffset::UTC);
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        t.year(),
        u8::from(t.month()),
        t.day(),
        t.hour(),
        t.minute(),
        t.second()
    )
}

/// Timestamp suitable for embedding in a filename, e.g. "20260801-091500".
pub fn format_fname_time(t: OffsetDateTime) -> String {
    let t = t.to_offset(UtcOffset::UTC);
    format!(
        "{:04}{:02}{:02}-{:02}{:02}{:02}",
        t.year(),
        u8::from(t.month()),
        t.day(),
        t.hour(),
        t.minute(),
        t.second()
    )
}

pub fn expand_user(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(dirs) = directories::UserDirs::new() {
            return dirs.home_dir().to_path_buf();
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(dirs) = directories::UserDirs::new() {
            return dirs.home_dir().join(rest);
        }
    }
    PathBuf::from(path)
}

/// Create a directory (and its parents) that only the owning user can read.
pub fn create_private_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .wrap_err_with(|| format!("failed to create directory {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Write `data` to `path` via a temporary file and an atomic rename.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| eyre!("path {} has no parent directory", path.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_data()?;
    tmp.persist(path)
        .wrap_err_with(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// Create a new file at `path`, appending ".1", ".2", ... on collision.
pub fn open_unique(path: PathBuf) -> Result<(File, PathBuf)> {
    let base = path
        .file_name()
        .ok_or_else(|| eyre!("path {} has no file name", path.display()))?
        .to_os_string();
    let mut candidate = path.clone();
    let mut n = 0u32;
    loop {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(f) => return Ok((f, candidate)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                n += 1;
                let mut name = base.clone();
                name.push(format!(".{}", n));
                candidate.set_file_name(name);
            }
            Err(e) => {
                return Err(e)
                    .wrap_err_with(|| format!("failed to create {}", candidate.display()))
            }
        }
    }
}

/// Read a file that may or may not be gzip-compressed.
pub fn read_possibly_gzipped(path: &Path) -> Result<Vec<u8>> {
    let raw = fs::read(path)
        .wrap_err_with(|| format!("failed to read {}", path.display()))?;
    if raw.starts_with(&[0x1f, 0x8b]) {
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(&raw[..])
            .read_to_end(&mut out)
            .wrap_err_with(|| format!("failed to decompress {}", path.display()))?;
        Ok(out)
    } else {
        Ok(raw)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_midnights() {
        let t = datetime!(2026-08-01 13:45:12 UTC);
        assert_eq!(previous_midnight(t), datetime!(2026-08-01 0:00 UTC));
        assert_eq!(succeeding_midnight(t), datetime!(2026-08-02 0:00 UTC));
        let m = datetime!(2026-08-01 0:00 UTC);
        assert_eq!(previous_midnight(m), m);
        assert_eq!(succeeding_midnight(m), datetime!(2026-08-02 0:00 UTC));
    }

    #[test]
    fn test_fname_time() {
        let t = datetime!(2026-08-01 9:15:00 UTC);
        assert_eq!(format_fname_time(t), "20260801-091500");
        assert_eq!(format_date(t), "2026-08-01");
        assert_eq!(format_time(t), "2026-08-01 09:15:00");
    }

    #[test]
    fn test_open_unique() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let target = tmp.path().join("foo-20260801");
        let (_, p1) = open_unique(target.clone())?;
        let (_, p2) = open_unique(target.clone())?;
        let (_, p3) = open_unique(target.clone())?;
        assert_eq!(p1, target);
        assert_eq!(p2, tmp.path().join("foo-20260801.1"));
        assert_eq!(p3, tmp.path().join("foo-20260801.2"));
        Ok(())
    }

    #[test]
    fn test_read_possibly_gzipped() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let plain = tmp.path().join("plain");
        fs::write(&plain, b"hello")?;
        assert_eq!(read_possibly_gzipped(&plain)?, b"hello");

        let gz = tmp.path().join("data.gz");
        let mut enc =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(b"hello")?;
        fs::write(&gz, enc.finish()?)?;
        assert_eq!(read_possibly_gzipped(&gz)?, b"hello");
        Ok(())
    }
}
