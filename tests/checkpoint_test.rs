use ch_capture::checkpoint::{BinlogPosition, Position, PositionStore};
use tempfile::TempDir;

#[tokio::test]
async fn test_position_persistence() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("binlog_position.json");

    let mut store = PositionStore::new(&path);

    let position = Position::new(BinlogPosition::new("mysql-bin.000001", 1547).with_row(3))
        .with_last_version(1_700_000_000_000_010);
    store.save(&position).await.unwrap();

    let loaded = store.load().await.unwrap().expect("Position should exist");
    assert_eq!(loaded.position_token.file, "mysql-bin.000001");
    assert_eq!(loaded.position_token.position, 1547);
    assert_eq!(loaded.position_token.row, 3);
    assert_eq!(loaded.last_version, 1_700_000_000_000_010);

    let next = Position::new(BinlogPosition::new("mysql-bin.000002", 4));
    store.save(&next).await.unwrap();

    let loaded = store.load().await.unwrap().expect("Position should exist");
    assert_eq!(loaded.position_token, next.position_token);
}

#[tokio::test]
async fn test_position_recovery_simulation() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("binlog_position.json");

    // First run
    {
        let mut store = PositionStore::new(&path);
        assert!(store.load().await.unwrap().is_none());

        store
            .save(&Position::new(BinlogPosition::new("mysql-bin.000007", 900).with_row(2)))
            .await
            .unwrap();
    }

    // Restart
    {
        let mut store = PositionStore::new(&path);
        let loaded = store.load().await.unwrap().expect("Should recover position");
        assert_eq!(
            loaded.position_token,
            BinlogPosition::new("mysql-bin.000007", 900).with_row(2)
        );

        // The loaded position is the floor for later saves.
        let stale = Position::new(BinlogPosition::new("mysql-bin.000007", 900).with_row(1));
        assert!(store.save(&stale).await.is_err());

        store
            .save(&Position::new(BinlogPosition::new("mysql-bin.000007", 1300)))
            .await
            .unwrap();
    }

    let loaded = PositionStore::new(&path).load().await.unwrap().unwrap();
    assert_eq!(loaded.position_token.position, 1300);
}

#[tokio::test]
async fn test_position_file_without_optional_fields() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("binlog_position.json");
    std::fs::write(
        &path,
        r#"{"position_token": {"file": "mysql-bin.000003", "position": 4}, "timestamp": 1700000000.5}"#,
    )
    .unwrap();

    let loaded = PositionStore::new(&path).load().await.unwrap().unwrap();
    assert_eq!(loaded.position_token.row, 0);
    assert_eq!(loaded.last_version, 0);
    assert_eq!(loaded.timestamp, 1_700_000_000.5);
}

#[tokio::test]
async fn test_timestamp_is_recent() {
    let before = chrono::Utc::now().timestamp() as f64;
    let position = Position::new(BinlogPosition::new("mysql-bin.000001", 4));
    let after = chrono::Utc::now().timestamp() as f64 + 1.0;

    assert!(position.timestamp >= before);
    assert!(position.timestamp <= after);
}

#[tokio::test]
async fn test_reset_forces_fresh_start() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("binlog_position.json");

    let mut store = PositionStore::new(&path);
    store
        .save(&Position::new(BinlogPosition::new("mysql-bin.000009", 800)))
        .await
        .unwrap();

    // What --reset-position does before the replicator starts.
    let mut reset = PositionStore::new(&path);
    assert_eq!(reset.path(), path.as_path());
    reset.delete().await.unwrap();
    reset.delete().await.unwrap();

    let mut store = PositionStore::new(&path);
    assert!(store.load().await.unwrap().is_none());
    // Nothing left to be monotonic against, so an older position is accepted.
    store
        .save(&Position::new(BinlogPosition::new("mysql-bin.000001", 4)))
        .await
        .unwrap();
}
