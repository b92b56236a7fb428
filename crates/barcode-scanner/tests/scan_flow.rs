//! Scans flowing through the state machine into durable storage, with the
//! database unreachable: every record must survive on disk in arrival
//! order, and mode changes must persist and stamp subsequent records.

use std::path::Path;

use barcode_scanner::settings;
use barcode_scanner::state::{Effect, Event, Machine};
use clap::Parser;
use scanner_core::config::Config;
use scanner_core::files;
use scanner_core::input::Key;
use scanner_core::storage::{now_nanos, Barcode, Direction, Storage};
use tokio_util::sync::CancellationToken;

fn config(state: &Path) -> Config {
    Config::try_parse_from([
        "test",
        "--state-path",
        state.to_str().unwrap(),
        "--update-baseurl",
        "http://updates.invalid",
        "--database-dsn",
        "mysql://u:p@127.0.0.1:1/scanner",
        "--telegram-token",
        "t",
        "--telegram-channel-id",
        "1",
    ])
    .unwrap()
}

fn scan(machine: &mut Machine, text: &str) -> Vec<Effect> {
    for c in text.chars() {
        machine.handle(Event::Key(Key::Char(c)));
    }
    machine.handle(Event::Key(Key::Enter))
}

#[tokio::test]
async fn scans_queue_on_disk_in_arrival_order_while_db_is_down() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let storage = Storage::new(cancel.clone(), &config(dir.path())).unwrap();

    let mut machine = Machine::new();
    let mut mode = (Direction::Egress, "3".to_string());

    for code in ["AAA", "BBB", "CCC"] {
        for effect in scan(&mut machine, code) {
            match effect {
                Effect::Enqueue(bc) => storage.insert(Barcode {
                    barcode: bc,
                    direction: mode.0,
                    currier_service: mode.1.clone(),
                    created_at_nanos: now_nanos(),
                }),
                Effect::SetMode {
                    direction,
                    currier,
                } => mode = (direction, currier),
                _ => {}
            }
        }
        // distinct nanosecond timestamps for distinct scans
        std::thread::sleep(std::time::Duration::from_millis(2));
    }

    let mut names: Vec<String> = std::fs::read_dir(storage.queue_dir())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names.len(), 3);

    // filenames are nanosecond timestamps: lexicographic order is arrival
    // order, so sorting must put AAA before BBB before CCC
    names.sort();

    let decoded: Vec<Barcode> = names
        .iter()
        .map(|n| files::unserialize(&storage.queue_dir().join(n)).unwrap())
        .collect();
    assert_eq!(
        decoded.iter().map(|b| b.barcode.as_str()).collect::<Vec<_>>(),
        vec!["AAA", "BBB", "CCC"]
    );
    assert!(decoded.iter().all(|b| b.direction == Direction::Egress));
    assert_eq!(storage.buffered(), 3);

    cancel.cancel();
}

#[tokio::test]
async fn mode_barcode_changes_what_later_scans_record() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let storage = Storage::new(cancel.clone(), &config(dir.path())).unwrap();

    let mut machine = Machine::new();
    let mut current = settings::load(dir.path());
    assert_eq!(current.direction, Direction::Egress);
    assert_eq!(current.currier, "0");

    let mut inserted = Vec::new();
    for code in ["INGRESS-7", "4006381333931"] {
        for effect in scan(&mut machine, code) {
            match effect {
                Effect::SetMode {
                    direction,
                    currier,
                } => {
                    current.direction = direction;
                    current.currier = currier;
                    settings::store(dir.path(), &current).unwrap();
                }
                Effect::Enqueue(bc) => {
                    let record = Barcode {
                        barcode: bc,
                        direction: current.direction,
                        currier_service: current.currier.clone(),
                        created_at_nanos: now_nanos(),
                    };
                    inserted.push(record.clone());
                    storage.insert(record);
                }
                _ => {}
            }
        }
    }

    // the mode barcode itself was not enqueued
    assert_eq!(inserted.len(), 1);
    assert_eq!(inserted[0].barcode, "4006381333931");
    assert_eq!(inserted[0].direction, Direction::Ingress);
    assert_eq!(inserted[0].currier_service, "7");

    // and the mode survives a restart
    let restored = settings::load(dir.path());
    assert_eq!(restored.direction, Direction::Ingress);
    assert_eq!(restored.currier, "7");

    cancel.cancel();
}
