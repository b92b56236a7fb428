//! Atomic file I/O helpers shared by the state, queue, and update paths.
//!
//! Everything that must survive a power cut goes through [`write_atomic`]:
//! temp file in the destination directory, fsync, rename.

use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;

use crate::record::{Record, RecordError};

#[derive(Debug, Error)]
pub enum FileError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("decoding {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: RecordError,
    },

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

fn io_err(path: &Path, source: io::Error) -> FileError {
    FileError::Io {
        path: path.to_owned(),
        source,
    }
}

/// Directory for runtime signal files, `<tmpdir>/barcode-scanner`.
pub fn tmp_dir() -> PathBuf {
    std::env::temp_dir().join("barcode-scanner")
}

pub fn exists(path: &Path) -> bool {
    path.exists()
}

pub fn is_empty(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.len() == 0).unwrap_or(false)
}

/// Write `data` to `path` so that `path` always holds either the old or the
/// new contents. Creates parent directories as needed.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<(), FileError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| io_err(dir, e))?;
    tmp.write_all(data).map_err(|e| io_err(path, e))?;
    tmp.as_file().sync_all().map_err(|e| io_err(path, e))?;
    tmp.persist(path)
        .map_err(|e| io_err(path, e.error))?;
    Ok(())
}

/// Stream `src` over `dest` atomically. Used for the update backup copy,
/// where `dest` may be a running executable.
pub fn copy_over(src: &Path, dest: &Path) -> Result<(), FileError> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    let mut from = fs::File::open(src).map_err(|e| io_err(src, e))?;
    let perm = from.metadata().map_err(|e| io_err(src, e))?.permissions();

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| io_err(dir, e))?;
    io::copy(&mut from, &mut tmp).map_err(|e| io_err(dest, e))?;
    tmp.as_file().sync_all().map_err(|e| io_err(dest, e))?;
    tmp.as_file()
        .set_permissions(perm)
        .map_err(|e| io_err(dest, e))?;
    tmp.persist(dest).map_err(|e| io_err(dest, e.error))?;
    Ok(())
}

/// Encode a [`Record`] and write it atomically.
pub fn serialize<R: Record>(path: &Path, value: &R) -> Result<(), FileError> {
    write_atomic(path, &value.encode())
}

/// Read and decode a [`Record`] from `path`.
pub fn unserialize<R: Record>(path: &Path) -> Result<R, FileError> {
    let bytes = fs::read(path).map_err(|e| io_err(path, e))?;
    R::decode(&bytes).map_err(|e| FileError::Decode {
        path: path.to_owned(),
        source: e,
    })
}

/// Append to a log-style file, fsyncing afterwards.
pub fn append(path: &Path, data: &[u8]) -> Result<(), FileError> {
    let mut f = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| io_err(path, e))?;
    f.write_all(data).map_err(|e| io_err(path, e))?;
    f.sync_all().map_err(|e| io_err(path, e))?;
    Ok(())
}

/// Compress `data` into a single-entry zip archive named `inner_name`.
pub fn zip_bytes(data: &[u8], inner_name: &str) -> Result<Vec<u8>, FileError> {
    let mut out = Cursor::new(Vec::new());
    let mut w = zip::ZipWriter::new(&mut out);
    let opts = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    w.start_file(inner_name, opts)?;
    w.write_all(data)
        .map_err(|e| io_err(Path::new(inner_name), e))?;
    w.finish()?;
    Ok(out.into_inner())
}

/// Read a whole file, for shipping through the notifier.
pub fn read_all(path: &Path) -> Result<Vec<u8>, FileError> {
    let mut f = fs::File::open(path).map_err(|e| io_err(path, e))?;
    let mut buf = Vec::new();
    f.read_to_end(&mut buf).map_err(|e| io_err(path, e))?;
    Ok(buf)
}
