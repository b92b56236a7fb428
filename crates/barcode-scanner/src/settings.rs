//! The operator-visible mode `(direction, currier, idle start)`, persisted
//! after every change and restored before the first scan is accepted.

use std::path::{Path, PathBuf};

use scanner_core::files::{self, FileError};
use scanner_core::record::{Record, RecordError, RecordReader, RecordWriter};
use scanner_core::storage::Direction;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub direction: Direction,
    pub currier: String,
    /// Nanoseconds since epoch when the device went idle; zero when active.
    pub idle_start_nanos: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            direction: Direction::Egress,
            currier: "0".into(),
            idle_start_nanos: 0,
        }
    }
}

impl Record for Settings {
    fn encode(&self) -> Vec<u8> {
        let mut w = RecordWriter::new();
        w.put_i64("Direction", self.direction.wire())
            .put_str("Currier", &self.currier)
            .put_i64("IdleStart", self.idle_start_nanos);
        w.into_bytes()
    }

    fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        let r = RecordReader::parse(bytes)?;
        Ok(Self {
            direction: Direction::from_wire(r.i64("Direction")?),
            currier: r.str("Currier")?.to_owned(),
            idle_start_nanos: r.i64("IdleStart")?,
        })
    }
}

pub fn settings_path(state_path: &Path) -> PathBuf {
    state_path.join("barcode-scanner").join("settings")
}

/// Restore the persisted mode; a fresh device starts at `(EGRESS, "0")`.
pub fn load(state_path: &Path) -> Settings {
    let path = settings_path(state_path);
    if !files::exists(&path) {
        debug!("no settings to restore, using defaults");
        return Settings::default();
    }

    match files::unserialize(&path) {
        Ok(s) => {
            debug!(settings = ?s, "restored settings");
            s
        }
        Err(e) => {
            debug!(error = %e, "could not restore settings, using defaults");
            Settings::default()
        }
    }
}

pub fn store(state_path: &Path, settings: &Settings) -> Result<(), FileError> {
    files::serialize(&settings_path(state_path), settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let s = Settings {
            direction: Direction::Ingress,
            currier: "7".into(),
            idle_start_nanos: 12345,
        };
        store(dir.path(), &s).unwrap();
        assert_eq!(load(dir.path()), s);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = load(dir.path());
        assert_eq!(s.direction, Direction::Egress);
        assert_eq!(s.currier, "0");
    }

    #[test]
    fn ingress_persists_as_one_on_the_wire() {
        let s = Settings {
            direction: Direction::Ingress,
            currier: "7".into(),
            idle_start_nanos: 0,
        };
        let r = RecordReader::parse(&s.encode()).unwrap();
        assert_eq!(r.i64("Direction").unwrap(), 1);
    }
}
