//! Message handling against the in-memory store

use rsm_common::store::{MemoryStore, TimeSeriesStore};
use rsm_common::time::parse_timestamp;
use rsm_common::{Error, Result};
use rsm_in::{IngestHandler, IngestOutcome, Player};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Records what it was asked to play and whether the file was there
#[derive(Default)]
struct RecordingPlayer {
    played: Mutex<Vec<(PathBuf, Vec<u8>)>>,
    fail: bool,
}

impl Player for RecordingPlayer {
    fn play(&self, path: &Path) -> Result<()> {
        if self.fail {
            return Err(Error::Playback("no output device".to_string()));
        }
        let bytes = std::fs::read(path)?;
        self.played.lock().unwrap().push((path.to_path_buf(), bytes));
        Ok(())
    }
}

struct Harness {
    store: MemoryStore,
    player: Arc<RecordingPlayer>,
    handler: IngestHandler,
    dir: TempDir,
}

impl Harness {
    fn new() -> Self {
        Self::with_player(RecordingPlayer::default())
    }

    fn with_player(player: RecordingPlayer) -> Self {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let player = Arc::new(player);
        let handler = IngestHandler::new(
            Arc::new(store.clone()),
            dir.path().join("received"),
            Some(player.clone() as Arc<dyn Player>),
        );
        Self {
            store,
            player,
            handler,
            dir,
        }
    }

    fn receive_dir_is_empty(&self) -> bool {
        std::fs::read_dir(self.dir.path().join("received"))
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }
}

fn message() -> serde_json::Value {
    json!({
        "timestamp": "2025-03-01T12:00:05.412000Z",
        "temperature": 22.5,
        "humidity": 45.0,
        "audio_base64": "UklGRiQAAABXQVZF",
        "filename": "recording_2025-03-01_12-00-01.wav",
        "device_id": "pi-livingroom"
    })
}

#[tokio::test]
async fn test_valid_message_is_stored_and_file_removed() {
    let h = Harness::new();

    let outcome = h.handler.handle(message().to_string().as_bytes()).await;
    assert!(matches!(outcome, IngestOutcome::Stored { .. }));

    let records = h.store.records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.air_temperature, 22.5);
    assert_eq!(record.humidity, 45.0);
    assert_eq!(record.filename, "recording_2025-03-01_12-00-01.wav");
    assert_eq!(record.device.as_deref(), Some("pi-livingroom"));
    assert_eq!(record.time, parse_timestamp("2025-03-01T12:00:05Z").unwrap());

    assert!(h.receive_dir_is_empty());
}

#[tokio::test]
async fn test_player_gets_decoded_clip_before_removal() {
    let h = Harness::new();
    h.handler.handle(message().to_string().as_bytes()).await;

    let played = h.player.played.lock().unwrap();
    assert_eq!(played.len(), 1);
    assert!(played[0].0.ends_with("recording_2025-03-01_12-00-01.wav"));
    assert_eq!(&played[0].1[..4], b"RIFF");
}

#[tokio::test]
async fn test_missing_required_field_is_rejected_without_write() {
    for field in ["timestamp", "filename", "audio_base64"] {
        let h = Harness::new();
        let mut body = message();
        body.as_object_mut().unwrap().remove(field);

        let outcome = h.handler.handle(body.to_string().as_bytes()).await;
        assert!(
            matches!(outcome, IngestOutcome::Rejected(ref reason) if reason.contains(field)),
            "field {}",
            field
        );
        assert!(h.store.is_empty());
        assert!(h.player.played.lock().unwrap().is_empty());
        assert!(h.receive_dir_is_empty());
    }
}

#[tokio::test]
async fn test_non_json_and_bad_audio_are_rejected() {
    let h = Harness::new();
    assert!(matches!(
        h.handler.handle(b"\x00\x01 not json").await,
        IngestOutcome::Rejected(_)
    ));

    let mut body = message();
    body["audio_base64"] = json!("***");
    assert!(matches!(
        h.handler.handle(body.to_string().as_bytes()).await,
        IngestOutcome::Rejected(_)
    ));

    let mut body = message();
    body["timestamp"] = json!("yesterday");
    assert!(matches!(
        h.handler.handle(body.to_string().as_bytes()).await,
        IngestOutcome::Rejected(_)
    ));

    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_storage_failure_still_removes_file_and_next_message_proceeds() {
    let h = Harness::new();
    h.store.set_write_failure(Some("connection refused"));

    let outcome = h.handler.handle(message().to_string().as_bytes()).await;
    assert_eq!(
        outcome,
        IngestOutcome::StorageFailed("Storage failure: connection refused".to_string())
    );
    assert!(h.receive_dir_is_empty());

    h.store.set_write_failure(None);
    let outcome = h.handler.handle(message().to_string().as_bytes()).await;
    assert!(matches!(outcome, IngestOutcome::Stored { .. }));
    assert_eq!(h.store.len(), 1);
}

#[tokio::test]
async fn test_playback_failure_does_not_affect_storage() {
    let h = Harness::with_player(RecordingPlayer {
        fail: true,
        ..Default::default()
    });

    let outcome = h.handler.handle(message().to_string().as_bytes()).await;
    assert!(matches!(outcome, IngestOutcome::Stored { .. }));
    assert_eq!(h.store.len(), 1);
    assert!(h.receive_dir_is_empty());
}

#[tokio::test]
async fn test_path_in_filename_cannot_escape_receive_dir() {
    let h = Harness::new();
    let mut body = message();
    body["filename"] = json!("../../outside.wav");

    h.handler.handle(body.to_string().as_bytes()).await;

    assert_eq!(h.store.records()[0].filename, "outside.wav");
    assert!(!h.dir.path().join("outside.wav").exists());
    let played = h.player.played.lock().unwrap();
    assert!(played[0].0.starts_with(h.dir.path().join("received")));
}

#[tokio::test]
async fn test_legacy_audio_field_and_missing_reading() {
    let h = Harness::new();
    let body = json!({
        "timestamp": "2025-03-01 12:00:05",
        "audio": "UklGRg==",
        "filename": "clip.wav"
    });

    let outcome = h.handler.handle(body.to_string().as_bytes()).await;
    assert!(matches!(outcome, IngestOutcome::Stored { .. }));
    let record = &h.store.records()[0];
    assert_eq!(record.air_temperature, 0.0);
    assert_eq!(record.humidity, 0.0);
    assert_eq!(record.device, None);
}

#[tokio::test]
async fn test_out_of_order_arrival_queries_in_time_order() {
    let h = Harness::new();
    for (ts, name) in [
        ("2025-03-01T12:00:40Z", "c.wav"),
        ("2025-03-01T12:00:00Z", "a.wav"),
        ("2025-03-01T12:00:20Z", "b.wav"),
    ] {
        let mut body = message();
        body["timestamp"] = json!(ts);
        body["filename"] = json!(name);
        h.handler.handle(body.to_string().as_bytes()).await;
    }

    let names: Vec<_> = h
        .store
        .query_from(rsm_common::time::epoch(), 100)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.filename)
        .collect();
    assert_eq!(names, vec!["a.wav", "b.wav", "c.wav"]);
}
