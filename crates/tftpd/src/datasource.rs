//! Pluggable data-source abstraction (§3 "Data source", §4.3).
//!
//! The source models this with a virtual-inheritance hierarchy
//! (`DataMgr`/`DataMgrFile`/`DataMgrFileRead`/`DataMgrFileWrite`); §9
//! calls out the native replacement directly: a small sum type with
//! read/write variants and free operations, which is what this module is.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::{Result, TftpError};
use crate::resolver;
use crate::settings::SharedSettings;

/// The read/write surface the session engine drives a transfer through,
/// implemented by both the server's resolved [`DataSource`] and the
/// client's plain local file (`client::LocalFile`) so `Session::run_send`/
/// `run_receive` don't need to know which side of the wire they're on.
pub trait Transferable {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize>;
    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<usize>;
}

/// A single read or write capability bound to one resolved path, owned
/// exclusively by the session that opened it (§3 "Session → data-source
/// ownership").
pub enum DataSource {
    Read(FileReader),
    Write(FileWriter),
}

impl Transferable for DataSource {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        match self {
            DataSource::Read(r) => r.read(offset, buf),
            DataSource::Write(_) => Err(TftpError::Tftp(
                "data source opened for write does not support read".to_string(),
            )),
        }
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<usize> {
        match self {
            DataSource::Write(w) => w.write(offset, buf),
            DataSource::Read(_) => Err(TftpError::Tftp(
                "data source opened for read does not support write".to_string(),
            )),
        }
    }
}

impl DataSource {

    /// Normal end-of-transfer close: for a writer this applies the
    /// configured ownership/permissions and makes the file visible under
    /// its final name (§4.3).
    pub fn close(self) -> Result<()> {
        match self {
            DataSource::Read(r) => r.close(),
            DataSource::Write(w) => w.close(),
        }
    }

    /// Abnormal termination: a writer deletes its partial file; a reader
    /// close is a no-op either way (§3, §5 "Resource lifetimes").
    pub fn cancel(self) {
        match self {
            DataSource::Read(r) => r.cancel(),
            DataSource::Write(w) => w.cancel(),
        }
    }
}

/// Resolves a read request's filename using the content-addressed
/// resolver when the name is a 32-hex digest, falling back to plain-name
/// search otherwise (§4.4), then opens it.
pub fn open_read(settings: &SharedSettings, filename: &str, peer: SocketAddr) -> Result<DataSource> {
    let resolved = if resolver::is_digest_request(filename) {
        let found = resolver::resolve_digest(&settings.root_dir, &settings.search_dirs, filename);
        if let Some(path) = &found {
            crate::audit::AuditLogger::md5_resolved(filename, &path.display().to_string());
        } else {
            crate::audit::AuditLogger::md5_resolution_failed(filename);
        }
        found
    } else {
        resolver::resolve_plain_name(&settings.root_dir, &settings.search_dirs, filename)
    };

    let path = resolved.ok_or(TftpError::NotFound)?;
    let path = canonicalize_and_verify_root(&settings.root_dir, &settings.search_dirs, &path, peer)?;
    let file = File::open(&path)?;
    Ok(DataSource::Read(FileReader { file }))
}

/// Resolves a write request's filename to `root/leaf` (directory
/// components in the requested name are stripped before joining, per
/// §4.3's anti-traversal rule), then stages a write through a temp file
/// so a failed transfer never leaves a partial file visible under its
/// final name.
pub fn open_write(settings: &SharedSettings, filename: &str) -> Result<DataSource> {
    let leaf = Path::new(filename)
        .file_name()
        .ok_or_else(|| TftpError::AccessViolation("empty write filename".to_string()))?;
    let final_path = settings.root_dir.join(leaf);

    if final_path.exists() {
        return Err(TftpError::AlreadyExists);
    }

    let temp_path = settings
        .root_dir
        .join(format!(".{}.tftpd-{}", leaf.to_string_lossy(), std::process::id()));
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .truncate(true)
        .open(&temp_path)?;

    Ok(DataSource::Write(FileWriter {
        file,
        temp_path,
        final_path,
        chown_user: settings.write.chown_user.clone(),
        chown_group: settings.write.chown_group.clone(),
        chmod_mode: settings.write.chmod_mode,
    }))
}

/// Rejects paths that resolve outside every configured root (traversal)
/// or that pass through a symlink whose target escapes the root.
fn canonicalize_and_verify_root(
    root: &Path,
    search_dirs: &[PathBuf],
    path: &Path,
    peer: SocketAddr,
) -> Result<PathBuf> {
    let canonical = fs::canonicalize(path)?;
    let roots: Vec<PathBuf> = std::iter::once(root.to_path_buf())
        .chain(search_dirs.iter().cloned())
        .filter_map(|r| fs::canonicalize(&r).ok())
        .collect();

    if roots.iter().any(|r| canonical.starts_with(r)) {
        Ok(canonical)
    } else {
        let is_symlink = fs::symlink_metadata(path)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if is_symlink {
            crate::audit::AuditLogger::symlink_access_denied(peer, &path.display().to_string());
        } else {
            crate::audit::AuditLogger::path_traversal_attempt(peer, &path.display().to_string());
        }
        Err(TftpError::AccessViolation(format!(
            "{} escapes configured roots",
            path.display()
        )))
    }
}

pub struct FileReader {
    file: File,
}

impl FileReader {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        loop {
            match self.file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            if total == buf.len() {
                break;
            }
        }
        Ok(total)
    }

    fn close(self) -> Result<()> {
        Ok(())
    }

    fn cancel(self) {}
}

pub struct FileWriter {
    file: File,
    temp_path: PathBuf,
    final_path: PathBuf,
    chown_user: String,
    chown_group: String,
    chmod_mode: u32,
}

impl FileWriter {
    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    /// Applies chown (if a name was configured; failures are logged but
    /// non-fatal) then chmod (always, masked to rw bits only), matching
    /// `tftpDataMgrFileWrite::close()`'s order (SPEC_FULL.md §G), then
    /// publishes the file under its final name.
    fn close(mut self) -> Result<()> {
        self.file.flush()?;
        fs::rename(&self.temp_path, &self.final_path)?;
        apply_ownership(&self.final_path, &self.chown_user, &self.chown_group);
        apply_permissions(&self.final_path, self.chmod_mode);
        Ok(())
    }

    /// Deletes the staged temp file; it never existed under the final
    /// name so there is nothing else to clean up (§5 "Ephemeral files
    /// created by a failed WRQ session are deleted on cancel").
    fn cancel(self) {
        drop(self.file);
        if self.temp_path.is_file()
            && let Err(e) = fs::remove_file(&self.temp_path)
        {
            tracing::warn!(path = %self.temp_path.display(), error = %e, "failed to remove cancelled write's temp file");
        }
    }
}

fn apply_ownership(path: &Path, user: &str, group: &str) {
    use nix::unistd::{Gid, Uid, chown};

    if user.is_empty() && group.is_empty() {
        return;
    }

    let uid = if user.is_empty() {
        None
    } else {
        match nix::unistd::User::from_name(user) {
            Ok(Some(u)) => Some(Uid::from_raw(u.uid.as_raw())),
            Ok(None) => {
                tracing::warn!(user, "configured chown user not found; falling back to root");
                Some(Uid::from_raw(0))
            }
            Err(e) => {
                tracing::warn!(user, error = %e, "chown user lookup failed; falling back to root");
                Some(Uid::from_raw(0))
            }
        }
    };

    let gid = if group.is_empty() {
        None
    } else {
        match nix::unistd::Group::from_name(group) {
            Ok(Some(g)) => Some(Gid::from_raw(g.gid.as_raw())),
            Ok(None) => {
                tracing::warn!(group, "configured chown group not found; falling back to root");
                Some(Gid::from_raw(0))
            }
            Err(e) => {
                tracing::warn!(group, error = %e, "chown group lookup failed; falling back to root");
                Some(Gid::from_raw(0))
            }
        }
    };

    if (uid.is_some() || gid.is_some())
        && let Err(e) = chown(path, uid, gid)
    {
        tracing::warn!(path = %path.display(), error = %e, "chown failed");
    }
}

fn apply_permissions(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let masked = crate::config::masked_chmod_mode(mode);
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(masked)) {
        tracing::warn!(path = %path.display(), error = %e, "chmod failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TftpConfig, WriteConfig};
    use crate::settings::Settings;

    fn temp_settings(name: &str) -> (SharedSettings, PathBuf) {
        let mut dir = std::env::temp_dir();
        dir.push(format!("tftpd_ds_test_{}_{}", name, uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let mut config = TftpConfig::default();
        config.server.root_dir = dir.clone();
        config.write = WriteConfig::default();
        (Settings::from_config(&config), dir)
    }

    fn test_peer() -> SocketAddr {
        "127.0.0.1:12345".parse().unwrap()
    }

    #[test]
    fn read_open_rejects_missing_file() {
        let (settings, _dir) = temp_settings("read-missing");
        let result = open_read(&settings, "nope.bin", test_peer());
        assert!(matches!(result, Err(TftpError::NotFound)));
    }

    #[test]
    fn read_reads_full_contents() {
        let (settings, dir) = temp_settings("read-full");
        fs::write(dir.join("a.bin"), b"hello world").unwrap();
        let mut ds = open_read(&settings, "a.bin", test_peer()).unwrap();
        let mut buf = [0u8; 32];
        let n = ds.read(0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello world");
    }

    #[test]
    fn write_rejects_existing_target() {
        let (settings, dir) = temp_settings("write-exists");
        fs::write(dir.join("a.bin"), b"already here").unwrap();
        let result = open_write(&settings, "a.bin");
        assert!(matches!(result, Err(TftpError::AlreadyExists)));
    }

    #[test]
    fn write_strips_directory_components_from_filename() {
        let (settings, dir) = temp_settings("write-traversal");
        let mut ds = open_write(&settings, "../../etc/passwd").unwrap();
        ds.write(0, b"data").unwrap();
        ds.close().unwrap();
        assert!(dir.join("passwd").is_file());
    }

    #[test]
    fn write_then_close_publishes_final_file() {
        let (settings, dir) = temp_settings("write-close");
        let mut ds = open_write(&settings, "f.bin").unwrap();
        ds.write(0, b"payload").unwrap();
        ds.close().unwrap();
        assert_eq!(fs::read(dir.join("f.bin")).unwrap(), b"payload");
    }

    #[test]
    fn write_then_cancel_leaves_no_file_under_root() {
        let (settings, dir) = temp_settings("write-cancel");
        let mut ds = open_write(&settings, "f.bin").unwrap();
        ds.write(0, b"partial").unwrap();
        ds.cancel();
        assert!(!dir.join("f.bin").exists());
        let leftovers: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn write_applies_masked_chmod() {
        use std::os::unix::fs::PermissionsExt;
        let (settings, dir) = temp_settings("write-chmod");
        let mut ds = open_write(&settings, "f.bin").unwrap();
        ds.write(0, b"x").unwrap();
        ds.close().unwrap();
        let mode = fs::metadata(dir.join("f.bin")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, crate::config::masked_chmod_mode(settings.write.chmod_mode));
    }

    #[test]
    fn read_rejects_symlink_escaping_root() {
        let (settings, dir) = temp_settings("read-symlink-escape");
        let mut outside = std::env::temp_dir();
        outside.push(format!("tftpd_ds_outside_{}", uuid::Uuid::new_v4()));
        fs::write(&outside, b"secret").unwrap();
        std::os::unix::fs::symlink(&outside, dir.join("link")).unwrap();

        let result = open_read(&settings, "link", test_peer());
        assert!(matches!(result, Err(TftpError::AccessViolation(_))));
        let _ = fs::remove_file(&outside);
    }
}
