use std::sync::{Arc, Mutex};

use battery_bridge::coordinator::Stats;
use battery_bridge::prelude::*;
use chrono::{Duration, TimeZone, Utc};

struct Fixture {
    database: Database,
    channels: Channels,
    _dir: tempfile::TempDir,
}

impl Fixture {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("bridge.db").display());

        let channels = Channels::new();
        let stats = Arc::new(Mutex::new(Stats::default()));
        let database = Database::new(
            config::Database { url },
            channels.clone(),
            stats,
        );
        database.connect().await.unwrap();
        database.migrate().await.unwrap();

        let inserter = database.clone();
        tokio::spawn(async move {
            let _ = inserter.start().await;
        });
        tokio::task::yield_now().await;

        Self {
            database,
            channels,
            _dir: dir,
        }
    }

    async fn append_config(&self, config: &Config) -> i64 {
        let (tx, rx) = oneshot::channel();
        let reply = Arc::new(Mutex::new(Some(tx)));
        self.channels
            .to_database
            .send(database::ChannelData::ConfigRow(
                Box::new(config.clone()),
                reply,
            ))
            .unwrap();
        rx.await.unwrap()
    }
}

fn status(battery: &str) -> Status {
    Status {
        battery: battery.to_string(),
        timestamp: Utc.with_ymd_and_hms(2024, 5, 17, 10, 0, 0).unwrap(),
        panic: false,
        manual_timeout: 10,
        pump: [true, false, false, true],
        target_flow: 40,
        flow_in: 7,
        flow_out: 3,
        current_level_raw: [31, 45, 60],
        target_level_raw: [30, 45, 60],
        min_level_raw: [0, 0, 0],
        max_level_raw: [80, 130, 180],
        current_level: [31.5, 45.25, 60.0],
        target_level: [30.0, 45.0, 60.0],
        min_level: [0.0, 0.0, 0.0],
        max_level: [80.0, 130.0, 180.0],
    }
}

fn config(battery: &str) -> Config {
    Config {
        id: None,
        battery: battery.to_string(),
        username: "sjoerd".to_string(),
        timestamp: Utc.with_ymd_and_hms(2024, 5, 17, 10, 0, 0).unwrap(),
        ack_timestamp: None,
        manual_timeout: 10,
        pump: [true, false, false, true],
        target_flow: 40,
        target_level: [30.0, 45.0, 60.0],
        min_level: [0.0, 0.0, 0.0],
        max_level: [80.0, 130.0, 180.0],
        target_level_raw: [30, 45, 60],
        min_level_raw: [0, 0, 0],
        max_level_raw: [80, 130, 180],
    }
}

#[tokio::test]
async fn status_rows_round_trip() {
    let f = Fixture::new().await;

    let written = status("b1");
    f.channels
        .to_database
        .send(database::ChannelData::StatusRow(Box::new(written.clone())))
        .unwrap();

    // a config append doubles as a barrier: the inserter works the
    // channel in order
    f.append_config(&config("b1")).await;

    let read = f.database.last_status("b1").await.unwrap().unwrap();
    assert_eq!(read, written);

    assert!(f.database.last_status("b9").await.unwrap().is_none());
}

#[tokio::test]
async fn config_rows_get_sequential_ids_and_acks_stick() {
    let f = Fixture::new().await;

    let first = config("b1");
    let mut second = config("b1");
    second.timestamp = first.timestamp + Duration::minutes(5);
    second.manual_timeout = 20;

    let first_id = f.append_config(&first).await;
    let second_id = f.append_config(&second).await;
    assert!(second_id > first_id);

    // the most recent row per battery wins at hydration time
    let read = f.database.last_config("b1").await.unwrap().unwrap();
    assert_eq!(read.id, Some(second_id));
    assert_eq!(read.manual_timeout, 20);
    assert!(read.ack_timestamp.is_none());

    let acked_at = second.timestamp + Duration::minutes(1);
    f.channels
        .to_database
        .send(database::ChannelData::AckConfig {
            id: second_id,
            timestamp: acked_at,
        })
        .unwrap();

    // the ack is an update, so poll briefly for the inserter to land it
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let read = f.database.last_config("b1").await.unwrap().unwrap();
        if read.ack_timestamp.is_some() {
            assert_eq!(read.ack_timestamp, Some(acked_at));
            return;
        }
    }
    panic!("ack timestamp never landed");
}

#[tokio::test]
async fn hydrate_returns_latest_rows_per_battery() {
    let f = Fixture::new().await;

    let batteries = vec!["b1".to_string(), "b2".to_string()];

    // empty history still yields an entry per battery
    let store = f.database.hydrate(&batteries).await.unwrap();
    assert_eq!(store.len(), 2);
    {
        let entry = store.entry("b1").unwrap();
        let entry = entry.lock().await;
        assert!(entry.status.is_none());
        assert!(entry.config.is_none());
    }

    let mut old = status("b1");
    old.timestamp = old.timestamp - Duration::minutes(30);
    old.target_flow = 10;
    f.channels
        .to_database
        .send(database::ChannelData::StatusRow(Box::new(old)))
        .unwrap();
    f.channels
        .to_database
        .send(database::ChannelData::StatusRow(Box::new(status("b1"))))
        .unwrap();
    f.append_config(&config("b2")).await;

    let store = f.database.hydrate(&batteries).await.unwrap();

    let entry = store.entry("b1").unwrap();
    let entry = entry.lock().await;
    assert_eq!(entry.status.as_ref().unwrap().target_flow, 40);
    assert!(entry.config.is_none());

    let entry2 = store.entry("b2").unwrap();
    let entry2 = entry2.lock().await;
    assert!(entry2.status.is_none());
    assert_eq!(entry2.config.as_ref().unwrap().username, "sjoerd");
}
