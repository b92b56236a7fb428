//! End-to-end update cycle against a canned HTTP server (probe, download,
//! verify, back up, swap, signal), plus the integrity-failure path that
//! must leave everything untouched.

use std::fs;
use std::path::Path;

use clap::Parser;
use scanner_core::config::Config;
use scanner_core::update::{self, Binary};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn config(state: &Path, base_url: &str) -> Config {
    Config::try_parse_from([
        "test",
        "--state-path",
        state.to_str().unwrap(),
        "--update-baseurl",
        base_url,
        "--database-dsn",
        "mysql://u:p@127.0.0.1:1/scanner",
        "--telegram-token",
        "t",
        "--telegram-channel-id",
        "1",
    ])
    .unwrap()
}

/// Serve two routes over bare HTTP/1.1: `version.json` and the binary blob.
async fn spawn_update_server(manifest: String, blob: Vec<u8>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            let manifest = manifest.clone();
            let blob = blob.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let mut req = Vec::new();
                loop {
                    let Ok(n) = sock.read(&mut buf).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    req.extend_from_slice(&buf[..n]);
                    if req.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }

                let request_line = String::from_utf8_lossy(&req);
                let body = if request_line.contains("version.json") {
                    manifest.into_bytes()
                } else {
                    blob
                };
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = sock.write_all(head.as_bytes()).await;
                let _ = sock.write_all(&body).await;
            });
        }
    });

    format!("http://{addr}")
}

#[tokio::test]
async fn check_downloads_verifies_and_swaps() {
    let dir = tempfile::tempdir().unwrap();
    let bin = dir.path().join("update-flow-happy");
    fs::write(&bin, b"old-version").unwrap();
    let old_hash = update::hash_file(&bin).unwrap();

    let new_blob = b"new-version-payload".to_vec();
    let new_hash = sha256_hex(&new_blob);
    let manifest = format!(r#"{{"hash":"{new_hash}","binary_path":"blob.bin"}}"#);

    let base = spawn_update_server(manifest, new_blob.clone()).await;
    let cfg = config(dir.path(), &base);

    let binary = Binary::new(&bin, &cfg).unwrap();
    binary.cleanup();
    binary.check().await.unwrap();

    // the binary is the verified new version, the backup is the old one
    assert_eq!(fs::read(&bin).unwrap(), new_blob);
    assert_eq!(
        fs::read(dir.path().join("update-flow-happy.bkup")).unwrap(),
        b"old-version"
    );
    assert_eq!(binary.current_hash().await, new_hash);
    assert_ne!(old_hash, new_hash);
    assert!(binary.should_restart());

    // the new file must be executable
    use std::os::unix::fs::PermissionsExt;
    let mode = fs::metadata(&bin).unwrap().permissions().mode();
    assert_eq!(mode & 0o111, 0o111);

    binary.cleanup();
}

#[tokio::test]
async fn matching_hash_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let bin = dir.path().join("update-flow-noop");
    fs::write(&bin, b"current").unwrap();
    let current_hash = update::hash_file(&bin).unwrap();

    let manifest = format!(r#"{{"hash":"{current_hash}","binary_path":"blob.bin"}}"#);
    let base = spawn_update_server(manifest, Vec::new()).await;
    let cfg = config(dir.path(), &base);

    let binary = Binary::new(&bin, &cfg).unwrap();
    binary.cleanup();
    binary.check().await.unwrap();

    assert_eq!(fs::read(&bin).unwrap(), b"current");
    assert!(!dir.path().join("update-flow-noop.bkup").exists());
    assert!(!binary.should_restart());
}

#[tokio::test]
async fn corrupt_download_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let bin = dir.path().join("update-flow-corrupt");
    fs::write(&bin, b"old-version").unwrap();

    // the manifest advertises a hash the blob will not match
    let manifest = format!(
        r#"{{"hash":"{}","binary_path":"blob.bin"}}"#,
        sha256_hex(b"what-the-server-promised")
    );
    let base = spawn_update_server(manifest, b"what-it-actually-sent".to_vec()).await;
    let cfg = config(dir.path(), &base);

    let binary = Binary::new(&bin, &cfg).unwrap();
    binary.cleanup();
    let err = binary.check().await.unwrap_err();
    assert!(matches!(err, update::UpdateError::FileInvalid));

    assert_eq!(fs::read(&bin).unwrap(), b"old-version");
    assert!(!dir.path().join("update-flow-corrupt.bkup").exists());
    assert!(!binary.should_restart());
}

#[tokio::test]
async fn blacklisted_offer_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let bin = dir.path().join("update-flow-blacklisted-offer");
    fs::write(&bin, b"old-version").unwrap();

    let new_blob = b"the-known-bad-version".to_vec();
    let new_hash = sha256_hex(&new_blob);
    let manifest = format!(r#"{{"hash":"{new_hash}","binary_path":"blob.bin"}}"#);
    let base = spawn_update_server(manifest, new_blob).await;
    let cfg = config(dir.path(), &base);

    // mark the offered hash as crashing
    let dir_bl = update::blacklist_dir(&cfg.state_path);
    fs::create_dir_all(&dir_bl).unwrap();
    fs::write(dir_bl.join(&new_hash), b"").unwrap();

    let binary = Binary::new(&bin, &cfg).unwrap();
    binary.cleanup();
    binary.check().await.unwrap();

    assert_eq!(fs::read(&bin).unwrap(), b"old-version");
    assert!(!binary.should_restart());
}
