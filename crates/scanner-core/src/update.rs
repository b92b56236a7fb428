//! Self-update engine: content-addressed binary downloads with atomic
//! replacement, a crash blacklist, and backup restoration.
//!
//! The invariants the whole scheme rests on:
//!
//! * the managed executable is always either the prior version or a fully
//!   verified new version, never a torn write;
//! * the restart signal file is created only after the executable has been
//!   replaced;
//! * a hash only enters the blacklist when the supervisor observed a crash
//!   running it.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::files;

use thiserror::Error;

/// Backup of the previous version sits next to the live binary.
pub const BACKUP_EXT: &str = "bkup";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file error: {0}")]
    File(#[from] crate::files::FileError),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected HTTP status {0}")]
    Status(reqwest::StatusCode),

    #[error("bad version manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("downloaded file does not match the advertised hash")]
    FileInvalid,

    #[error("no backup exists for {0}")]
    NoBackup(PathBuf),
}

/// The update server's answer to a version probe.
#[derive(Debug, Deserialize)]
struct VersionManifest {
    hash: String,
    binary_path: String,
}

/// One managed executable.
pub struct Binary {
    pub name: String,
    path: PathBuf,
    base_url: String,
    state_dir: PathBuf,
    http: reqwest::Client,
    hash: Mutex<String>,
}

impl Binary {
    /// Hashes the on-disk executable at construction.
    pub fn new(path: impl AsRef<Path>, cfg: &Config) -> Result<Self, UpdateError> {
        let path = path.as_ref().to_owned();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let hash = hash_file(&path)?;

        Ok(Self {
            name,
            path,
            base_url: cfg.update_baseurl.trim_end_matches('/').to_owned(),
            state_dir: cfg.state_path.clone(),
            http: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .unwrap_or_default(),
            hash: Mutex::new(hash),
        })
    }

    /// One full update pass: self-heal from the blacklist, probe the server,
    /// download, verify, back up, swap, signal.
    pub async fn check(&self) -> Result<(), UpdateError> {
        let current = self.hash.lock().await.clone();

        // a blacklisted current version means the last update crashed and
        // the supervisor could not roll it back; do it now, before any HTTP
        if self.is_blacklisted(&current) {
            warn!(binary = %self.name, hash = %current, "running a blacklisted version, restoring backup");
            return self.restore_to_backup().await;
        }

        let manifest = self.fetch_manifest(&current).await?;
        if manifest.hash == current {
            debug!(binary = %self.name, "already up to date");
            return Ok(());
        }
        if self.is_blacklisted(&manifest.hash) {
            debug!(binary = %self.name, hash = %manifest.hash, "offered update is blacklisted, skipping");
            return Ok(());
        }

        info!(binary = %self.name, from = %current, to = %manifest.hash, "downloading update");
        let staged = self.download_verified(&manifest).await?;

        // keep the running version around for rollback, then swap
        files::copy_over(&self.path, &self.backup_path())?;
        let mut perms = fs::metadata(&self.path)?.permissions();
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(0o755);
        staged.as_file().set_permissions(perms)?;
        staged
            .persist(&self.path)
            .map_err(|e| UpdateError::Io(e.error))?;

        *self.hash.lock().await = manifest.hash.clone();
        self.write_restart_signal()?;
        info!(binary = %self.name, hash = %manifest.hash, "update installed, restart signalled");
        Ok(())
    }

    /// Rename `<bin>.bkup` over `<bin>` and signal a restart. The rename is
    /// atomic and consumes the backup.
    pub async fn restore_to_backup(&self) -> Result<(), UpdateError> {
        let bkup = self.backup_path();
        if !files::exists(&bkup) {
            return Err(UpdateError::NoBackup(bkup));
        }

        fs::rename(&bkup, &self.path)?;
        *self.hash.lock().await = hash_file(&self.path)?;
        self.write_restart_signal()?;
        Ok(())
    }

    /// True once an installed update waits for this binary to re-exec.
    pub fn should_restart(&self) -> bool {
        files::exists(&signal_path(&self.name))
    }

    /// Remove the restart signal; succeeds when it never existed.
    pub fn cleanup(&self) {
        match fs::remove_file(signal_path(&self.name)) {
            Ok(()) => debug!(binary = %self.name, "restart signal cleared"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(binary = %self.name, error = %e, "could not clear restart signal"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn current_hash(&self) -> String {
        self.hash.lock().await.clone()
    }

    fn backup_path(&self) -> PathBuf {
        let mut os = self.path.clone().into_os_string();
        os.push(".");
        os.push(BACKUP_EXT);
        PathBuf::from(os)
    }

    fn is_blacklisted(&self, hash: &str) -> bool {
        files::exists(&blacklist_dir(&self.state_dir).join(hash))
    }

    async fn fetch_manifest(&self, current: &str) -> Result<VersionManifest, UpdateError> {
        let url = format!(
            "{}/{}/{}/version.json?currentSha={}",
            self.base_url,
            self.name,
            platform(),
            current,
        );
        let resp = self.http.get(&url).send().await?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(UpdateError::Status(resp.status()));
        }
        Ok(serde_json::from_slice(&resp.bytes().await?)?)
    }

    /// Stream the advertised blob into a temp file next to the executable
    /// and verify its SHA-256 before anyone can run it.
    async fn download_verified(
        &self,
        manifest: &VersionManifest,
    ) -> Result<tempfile::NamedTempFile, UpdateError> {
        let url = format!(
            "{}/{}/{}/{}",
            self.base_url,
            self.name,
            platform(),
            manifest.binary_path,
        );
        let mut resp = self.http.get(&url).send().await?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(UpdateError::Status(resp.status()));
        }

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        let mut hasher = Sha256::new();
        while let Some(chunk) = resp.chunk().await? {
            hasher.update(&chunk);
            tmp.write_all(&chunk)?;
        }
        tmp.as_file().sync_all()?;

        let actual = hex(&hasher.finalize());
        if !actual.eq_ignore_ascii_case(&manifest.hash) {
            warn!(binary = %self.name, expected = %manifest.hash, %actual, "hash mismatch on downloaded update");
            return Err(UpdateError::FileInvalid);
        }
        Ok(tmp)
    }

    fn write_restart_signal(&self) -> Result<(), UpdateError> {
        let path = signal_path(&self.name);
        fs::create_dir_all(path.parent().unwrap_or_else(|| Path::new(".")))?;
        // an already-present signal is as good as a fresh one
        fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        Ok(())
    }
}

/// Marker file telling a running binary to exit for re-exec.
pub fn signal_path(bin_name: &str) -> PathBuf {
    files::tmp_dir().join(format!("UPD-{bin_name}"))
}

pub fn blacklist_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("blacklisted-updates")
}

/// Record the executable's current hash as known-crashing. Pre-existing
/// markers are fine.
pub fn blacklist_update(bin_path: &Path, state_dir: &Path) -> Result<(), UpdateError> {
    let hash = hash_file(bin_path)?;
    let dir = blacklist_dir(state_dir);
    fs::create_dir_all(&dir)?;
    fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(dir.join(&hash))?;
    info!(binary = %bin_path.display(), %hash, "blacklisted");
    Ok(())
}

/// SHA-256 of a file, lowercase hex.
pub fn hash_file(path: &Path) -> Result<String, std::io::Error> {
    let mut f = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut f, &mut hasher)?;
    Ok(hex(&hasher.finalize()))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Platform component of update URLs, using Go toolchain naming so one
/// update server serves both implementations.
pub fn platform() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "linux-amd64",
        "aarch64" => "linux-arm64",
        "arm" => "linux-arm",
        _ => "linux-unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(state: &Path) -> Config {
        use clap::Parser;
        Config::try_parse_from([
            "test",
            "--state-path",
            state.to_str().unwrap(),
            "--update-baseurl",
            "http://updates.invalid",
            "--database-dsn",
            "mysql://u:p@db.invalid/scanner",
            "--telegram-token",
            "t",
            "--telegram-channel-id",
            "1",
        ])
        .unwrap()
    }

    #[test]
    fn hash_file_matches_known_vector() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("f");
        fs::write(&p, b"abc").unwrap();
        assert_eq!(
            hash_file(&p).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn restore_to_backup_swaps_and_signals() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("barcode-scanner-test-restore");
        let bkup = dir.path().join("barcode-scanner-test-restore.bkup");
        fs::write(&bin, b"new-and-broken").unwrap();
        fs::write(&bkup, b"old-and-good").unwrap();

        let b = Binary::new(&bin, &test_config(dir.path())).unwrap();
        b.cleanup();
        assert!(!b.should_restart());

        b.restore_to_backup().await.unwrap();
        assert_eq!(fs::read(&bin).unwrap(), b"old-and-good");
        assert!(!bkup.exists());
        assert!(b.should_restart());
        assert_eq!(b.current_hash().await, hash_file(&bin).unwrap());

        b.cleanup();
        assert!(!b.should_restart());
        // cleaning an absent signal is fine
        b.cleanup();
    }

    #[tokio::test]
    async fn restore_without_backup_errors() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("no-backup-bin");
        fs::write(&bin, b"x").unwrap();

        let b = Binary::new(&bin, &test_config(dir.path())).unwrap();
        assert!(matches!(
            b.restore_to_backup().await,
            Err(UpdateError::NoBackup(_))
        ));
    }

    #[tokio::test]
    async fn blacklisted_current_version_restores_before_any_http() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("blacklisted-bin");
        let bkup = dir.path().join("blacklisted-bin.bkup");
        fs::write(&bin, b"crashy").unwrap();
        fs::write(&bkup, b"stable").unwrap();

        let cfg = test_config(dir.path());
        blacklist_update(&bin, &cfg.state_path).unwrap();

        // base URL points nowhere; check must still succeed via restore
        let b = Binary::new(&bin, &cfg).unwrap();
        b.cleanup();
        b.check().await.unwrap();
        assert_eq!(fs::read(&bin).unwrap(), b"stable");
        assert!(b.should_restart());
        b.cleanup();
    }

    #[test]
    fn blacklist_marker_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        fs::write(&bin, b"payload").unwrap();

        blacklist_update(&bin, dir.path()).unwrap();
        blacklist_update(&bin, dir.path()).unwrap();

        let marker = blacklist_dir(dir.path()).join(hash_file(&bin).unwrap());
        assert!(marker.exists());
        assert_eq!(fs::metadata(&marker).unwrap().len(), 0);
    }

    #[test]
    fn platform_is_a_go_style_pair() {
        let p = platform();
        assert!(p.starts_with("linux-"));
    }
}
