//! Durable at-least-once barcode queue with a MySQL sink.
//!
//! [`Storage::insert`] never blocks and never fails: every accepted barcode
//! lands on disk, in an in-memory safety net, or both, and stays there until
//! the database acknowledges it. A single consumer drains the queue; the
//! `(device_id, created_at_nanos)` unique key makes redelivery harmless.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sha1::{Digest, Sha1};
use sqlx::mysql::{MySqlDatabaseError, MySqlPool, MySqlPoolOptions};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::{self, Config};
use crate::files;
use crate::record::{Record, RecordError, RecordReader, RecordWriter};

use thiserror::Error;

/// How often the consumer sweeps the queue directory and the safety net.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Per-call budget for database operations.
const DB_TIMEOUT: Duration = Duration::from_secs(5);
/// Records younger than this may still be mid-write; leave them alone.
const MIN_RECORD_AGE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("device id not yet assigned")]
    DeviceIdMissing,

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("database call timed out")]
    Timeout,

    #[error(transparent)]
    File(#[from] crate::files::FileError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

/// Package flow direction, part of every barcode record.
///
/// The on-disk wire mapping is `0 = EGRESS, 1 = INGRESS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Egress,
    Ingress,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Egress => "EGRESS",
            Self::Ingress => "INGRESS",
        }
    }

    pub fn wire(self) -> i64 {
        match self {
            Self::Egress => 0,
            Self::Ingress => 1,
        }
    }

    pub fn from_wire(v: i64) -> Self {
        match v {
            1 => Self::Ingress,
            _ => Self::Egress,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("EGRESS") {
            Some(Self::Egress)
        } else if name.eq_ignore_ascii_case("INGRESS") {
            Some(Self::Ingress)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One captured scan, queued for the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Barcode {
    pub barcode: String,
    pub direction: Direction,
    pub currier_service: String,
    /// Wall-clock nanoseconds since the Unix epoch; never zero.
    pub created_at_nanos: i64,
}

impl Record for Barcode {
    fn encode(&self) -> Vec<u8> {
        let mut w = RecordWriter::new();
        w.put_str("Barcode", &self.barcode)
            .put_str("Direction", self.direction.as_str())
            .put_str("CurrierService", &self.currier_service)
            .put_i64("CreatedAt", self.created_at_nanos);
        w.into_bytes()
    }

    fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        let r = RecordReader::parse(bytes)?;
        Ok(Self {
            barcode: r.str("Barcode")?.to_owned(),
            direction: Direction::from_name(r.str("Direction")?)
                .ok_or(RecordError::InvalidValue("Direction"))?,
            currier_service: r.str("CurrierService")?.to_owned(),
            created_at_nanos: r.i64("CreatedAt")?,
        })
    }
}

/// Current wall time in nanoseconds, the queue's natural key.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

struct DeviceId(u64);

impl Record for DeviceId {
    fn encode(&self) -> Vec<u8> {
        let mut w = RecordWriter::new();
        w.put_u64("DeviceID", self.0);
        w.into_bytes()
    }

    fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        Ok(Self(RecordReader::parse(bytes)?.u64("DeviceID")?))
    }
}

#[derive(Debug, Clone)]
struct Entry {
    path: PathBuf,
    data: Barcode,
}

#[derive(Clone)]
pub struct Storage {
    inner: Arc<Inner>,
}

struct Inner {
    cancel: CancellationToken,
    queue_dir: PathBuf,
    device_id_path: PathBuf,
    pool: MySqlPool,
    device_id: AtomicU64,
    tx: mpsc::Sender<Entry>,
    // safety net for records whose disk write or channel hand-off failed
    buf: Mutex<HashMap<[u8; 20], Barcode>>,
}

impl Storage {
    /// Open the queue directory and the (lazy) database pool, and start the
    /// consumer and the device-id bootstrap in the background.
    pub fn new(cancel: CancellationToken, cfg: &Config) -> Result<Self, StorageError> {
        let queue_dir = cfg.state_path.join("storage");
        std::fs::create_dir_all(&queue_dir)
            .map_err(|e| crate::files::FileError::Io {
                path: queue_dir.clone(),
                source: e,
            })?;

        let pool = MySqlPoolOptions::new()
            .max_connections(3)
            .max_lifetime(Duration::from_secs(30))
            .connect_lazy(&cfg.database_dsn)?;

        let (tx, rx) = mpsc::channel(1);
        let inner = Arc::new(Inner {
            cancel,
            queue_dir,
            device_id_path: cfg.state_path.join("deviceid"),
            pool,
            device_id: AtomicU64::new(0),
            tx,
            buf: Mutex::new(HashMap::new()),
        });

        tokio::spawn(consume(inner.clone(), rx));
        tokio::spawn(bootstrap_device_id(inner.clone()));

        Ok(Self { inner })
    }

    /// Accept a barcode. Never blocks, never fails: the record is persisted
    /// to disk and mirrored into the safety net, then opportunistically
    /// handed to the consumer.
    ///
    /// Panics when `created_at_nanos` is zero; the state machine always
    /// stamps it.
    pub fn insert(&self, data: Barcode) {
        assert!(data.created_at_nanos != 0, "Barcode.created_at must be set");

        let path = self.inner.path_for(&data);
        if let Err(e) = files::serialize(&path, &data) {
            error!(error = %e, "persisting barcode to queue failed");
        }

        {
            let mut buf = self.inner.buf.lock().expect("storage buffer poisoned");
            let key = queue_key(&path);
            if buf.insert(key, data.clone()).is_some() {
                // two records with the same nanosecond timestamp would
                // silently overwrite each other on disk as well
                panic!("duplicate queue key for {}", path.display());
            }
        }

        match self.inner.tx.try_send(Entry { path, data }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!("insert channel busy, record stays queued on disk");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("insert channel closed, record stays queued on disk");
            }
        }
    }

    /// Verify the DSN actually reaches a database.
    pub async fn test_connection(&self) -> Result<(), StorageError> {
        let ping = sqlx::query("SELECT 1").execute(&self.inner.pool);
        match tokio::time::timeout(DB_TIMEOUT, ping).await {
            Err(_) => Err(StorageError::Timeout),
            Ok(r) => r.map(|_| ()).map_err(Into::into),
        }
    }

    /// Number of records currently held in the safety net.
    pub fn buffered(&self) -> usize {
        self.inner.buf.lock().expect("storage buffer poisoned").len()
    }

    /// Queue directory backing this storage.
    pub fn queue_dir(&self) -> &std::path::Path {
        &self.inner.queue_dir
    }
}

impl Inner {
    fn path_for(&self, data: &Barcode) -> PathBuf {
        self.queue_dir.join(data.created_at_nanos.to_string())
    }

    async fn handle_entry(&self, entry: Entry) {
        match self.db_insert(&entry.data).await {
            Ok(()) => {
                // the same record can arrive through the channel and a sweep
                // at once; a missing file just means the other path won
                if let Err(e) = std::fs::remove_file(&entry.path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        debug!(path = %entry.path.display(), error = %e, "could not remove queue file");
                    }
                }
                self.buf
                    .lock()
                    .expect("storage buffer poisoned")
                    .remove(&queue_key(&entry.path));
                trace!(path = %entry.path.display(), "barcode inserted");
            }
            Err(e) => {
                debug!(error = %e, "db insert failed, record left for retry");
            }
        }
    }

    async fn db_insert(&self, row: &Barcode) -> Result<(), StorageError> {
        let device_id = self.device_id.load(Ordering::Relaxed);
        if device_id == 0 {
            return Err(StorageError::DeviceIdMissing);
        }

        let query = sqlx::query(
            "INSERT INTO barcodes \
             (device_id, barcode, direction, currier_service, created_at_nanos, timestamp) \
             VALUES (?, ?, ?, ?, ?, NOW())",
        )
        .bind(device_id)
        .bind(&row.barcode)
        .bind(row.direction.as_str())
        .bind(&row.currier_service)
        .bind(row.created_at_nanos)
        .execute(&self.pool);

        match tokio::time::timeout(DB_TIMEOUT, query).await {
            Err(_) => Err(StorageError::Timeout),
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) if is_unique_violation(&e) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
        }
    }
}

/// SHA-1 of the queue path, the safety-net key.
fn queue_key(path: &std::path::Path) -> [u8; 20] {
    Sha1::digest(path.as_os_str().as_encoded_bytes()).into()
}

/// MySQL duplicate-key errors mean the record is already in; codes 1062
/// (ER_DUP_ENTRY) and 1586 (ER_DUP_ENTRY_WITH_KEY_NAME).
fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|d| d.try_downcast_ref::<MySqlDatabaseError>())
        .is_some_and(|m| matches!(m.number(), 1062 | 1586))
}

/// Consumer: drains the insert channel, sweeps stragglers once a minute,
/// exits on cancellation.
async fn consume(inner: Arc<Inner>, mut rx: mpsc::Receiver<Entry>) {
    let mut tick = tokio::time::interval(SWEEP_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await; // the immediate first tick

    let mut sweep_guard: Option<CancellationToken> = None;

    loop {
        tokio::select! {
            () = inner.cancel.cancelled() => {
                info!("storage consumer exiting");
                if let Some(t) = sweep_guard.take() {
                    t.cancel();
                }
                return;
            }
            Some(entry) = rx.recv() => inner.handle_entry(entry).await,
            _ = tick.tick() => {
                // a sweep still running after a whole minute is stuck on a
                // full channel; cut it loose and start fresh
                if let Some(t) = sweep_guard.take() {
                    t.cancel();
                }
                let guard = inner.cancel.child_token();
                sweep_guard = Some(guard.clone());
                tokio::spawn(sweep(inner.clone(), guard));
            }
        }
    }
}

/// Re-enqueue everything old enough from the safety net and the queue
/// directory.
async fn sweep(inner: Arc<Inner>, guard: CancellationToken) {
    let cutoff = now_nanos() - MIN_RECORD_AGE.as_nanos() as i64;

    let buffered: Vec<Entry> = {
        let buf = inner.buf.lock().expect("storage buffer poisoned");
        buf.values()
            .filter(|b| b.created_at_nanos <= cutoff)
            .map(|b| Entry {
                path: inner.path_for(b),
                data: b.clone(),
            })
            .collect()
    };
    if !buffered.is_empty() {
        trace!(count = buffered.len(), "re-enqueueing buffered barcodes");
    }
    for entry in buffered {
        tokio::select! {
            () = guard.cancelled() => return,
            r = inner.tx.send(entry) => if r.is_err() { return },
        }
    }

    let mut names: Vec<PathBuf> = match std::fs::read_dir(&inner.queue_dir) {
        Ok(rd) => rd.filter_map(|e| e.ok().map(|e| e.path())).collect(),
        Err(e) => {
            error!(error = %e, "listing queue directory failed, skipping sweep");
            return;
        }
    };
    // filenames are nanosecond timestamps; insertion attempts follow
    // arrival order
    names.sort();
    if !names.is_empty() {
        trace!(count = names.len(), "re-enqueueing persisted barcodes");
    }

    for path in names {
        let data: Barcode = match files::unserialize(&path) {
            Ok(d) => d,
            Err(e) => {
                error!(path = %path.display(), error = %e, "undecodable queue file, skipping");
                continue;
            }
        };
        if data.created_at_nanos > cutoff {
            continue;
        }

        tokio::select! {
            () = guard.cancelled() => return,
            r = inner.tx.send(Entry { path, data }) => if r.is_err() { return },
        }
    }
}

/// Resolve this device's numeric id, retrying forever with a one-minute
/// backoff. Inserts refuse to run until this lands.
async fn bootstrap_device_id(inner: Arc<Inner>) {
    loop {
        match try_setup_device(&inner).await {
            Ok(id) => {
                info!(device_id = id, "device id installed");
                inner.device_id.store(id, Ordering::Relaxed);
                return;
            }
            Err(e) => {
                debug!(error = %e, "device id bootstrap failed, retrying in a minute");
            }
        }

        tokio::select! {
            () = inner.cancel.cancelled() => return,
            () = tokio::time::sleep(Duration::from_secs(60)) => {}
        }
    }
}

async fn try_setup_device(inner: &Inner) -> Result<u64, StorageError> {
    if files::exists(&inner.device_id_path) {
        let cached: DeviceId = files::unserialize(&inner.device_id_path)?;
        return Ok(cached.0);
    }

    let machine_id = config::machine_id()?;

    let insert = sqlx::query("INSERT INTO devices (machine_id, created_at) VALUES (?, NOW())")
        .bind(&machine_id)
        .execute(&inner.pool);

    let id = match tokio::time::timeout(DB_TIMEOUT, insert).await {
        Err(_) => return Err(StorageError::Timeout),
        Ok(Ok(res)) => res.last_insert_id(),
        Ok(Err(e)) if is_unique_violation(&e) => {
            // the device registered on a previous life; look it up
            let select = sqlx::query_as::<_, (u64,)>(
                "SELECT id FROM devices WHERE machine_id = ? LIMIT 1",
            )
            .bind(&machine_id)
            .fetch_one(&inner.pool);
            match tokio::time::timeout(DB_TIMEOUT, select).await {
                Err(_) => return Err(StorageError::Timeout),
                Ok(r) => r?.0,
            }
        }
        Ok(Err(e)) => return Err(e.into()),
    };

    if let Err(e) = files::serialize(&inner.device_id_path, &DeviceId(id)) {
        warn!(error = %e, "could not cache device id");
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(state: &std::path::Path) -> Config {
        use clap::Parser;
        Config::try_parse_from([
            "test",
            "--state-path",
            state.to_str().unwrap(),
            "--update-baseurl",
            "http://updates.invalid",
            // port 1 so nothing ever answers
            "--database-dsn",
            "mysql://scanner:pw@127.0.0.1:1/scanner",
            "--telegram-token",
            "t",
            "--telegram-channel-id",
            "1",
        ])
        .unwrap()
    }

    fn sample(nanos: i64) -> Barcode {
        Barcode {
            barcode: "4006381333931".into(),
            direction: Direction::Egress,
            currier_service: "3".into(),
            created_at_nanos: nanos,
        }
    }

    #[test]
    fn barcode_record_round_trips() {
        let b = Barcode {
            barcode: "A-1".into(),
            direction: Direction::Ingress,
            currier_service: "7".into(),
            created_at_nanos: 1_700_000_000_000_000_001,
        };
        assert_eq!(Barcode::decode(&b.encode()).unwrap(), b);
    }

    #[test]
    fn direction_wire_mapping_is_stable() {
        assert_eq!(Direction::Egress.wire(), 0);
        assert_eq!(Direction::Ingress.wire(), 1);
        assert_eq!(Direction::from_wire(0), Direction::Egress);
        assert_eq!(Direction::from_wire(1), Direction::Ingress);
        assert_eq!(Direction::from_name("ingress"), Some(Direction::Ingress));
        assert_eq!(Direction::from_name("sideways"), None);
    }

    #[tokio::test]
    async fn insert_persists_to_disk_and_safety_net() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let storage = Storage::new(cancel.clone(), &test_config(dir.path())).unwrap();

        let nanos = now_nanos();
        storage.insert(sample(nanos));

        let path = storage.queue_dir().join(nanos.to_string());
        assert!(path.exists());
        let back: Barcode = files::unserialize(&path).unwrap();
        assert_eq!(back.barcode, "4006381333931");
        assert_eq!(storage.buffered(), 1);

        cancel.cancel();
    }

    #[tokio::test]
    async fn records_survive_while_db_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let storage = Storage::new(cancel.clone(), &test_config(dir.path())).unwrap();

        let base = now_nanos();
        for i in 0..3 {
            storage.insert(sample(base + i));
        }

        // give the consumer a chance to fail its inserts
        tokio::time::sleep(Duration::from_millis(200)).await;

        let files: Vec<_> = std::fs::read_dir(storage.queue_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(files.len(), 3);
        assert_eq!(storage.buffered(), 3);

        cancel.cancel();
    }

    #[tokio::test]
    #[should_panic(expected = "created_at must be set")]
    async fn zero_timestamp_is_a_bug() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let storage = Storage::new(cancel.clone(), &test_config(dir.path())).unwrap();
        storage.insert(sample(0));
    }
}
