mod common;

use common::{cancel, messages};
use streamstore::{Database, ExpectedVersion, Position, SqliteBackend, StreamStore, StreamVersion};
use uuid::Uuid;

fn open(path: &std::path::Path) -> StreamStore<SqliteBackend> {
    StreamStore::with_settings(SqliteBackend::open(path).unwrap(), common::test_settings())
}

#[tokio::test]
async fn restart_recovers_versions_and_positions() {
    common::init_tracing();
    let (_dir, path) = common::create_temp_db_file("restart.db");
    let c = cancel();

    let store = open(&path);
    let first = store
        .append_to_stream("stream-restart", ExpectedVersion::NoStream, messages(&[1, 2]), &c)
        .await
        .unwrap();
    assert_eq!(first.current_version, 1);
    assert_eq!(first.current_position, 1);
    store.dispose().await;

    // Simulates a process restart.
    let store = open(&path);
    let second = store
        .append_to_stream("stream-restart", ExpectedVersion::Exact(1), messages(&[3]), &c)
        .await
        .unwrap();
    assert_eq!(second.current_version, 2);
    assert_eq!(second.current_position, 2);

    // Idempotency survives the restart too.
    let replay = store
        .append_to_stream("stream-restart", ExpectedVersion::NoStream, messages(&[1, 2]), &c)
        .await
        .unwrap();
    assert_eq!(replay, second);

    let page = store
        .read_stream_forwards("stream-restart", StreamVersion::START, 10, true, &c)
        .await
        .unwrap();
    let versions: Vec<i32> = page.messages.iter().map(|m| m.stream_version).collect();
    assert_eq!(versions, vec![0, 1, 2]);
    store.dispose().await;
}

#[tokio::test]
async fn positions_are_not_reused_after_restart() {
    let (_dir, path) = common::create_temp_db_file("positions.db");
    let c = cancel();

    let store = open(&path);
    store
        .append_to_stream("a", ExpectedVersion::NoStream, messages(&[1, 2, 3]), &c)
        .await
        .unwrap();
    store.delete_stream("a", ExpectedVersion::Any, &c).await.unwrap();
    store.dispose().await;

    let store = open(&path);
    // 0..=2 belonged to "a" and 3 to its tombstone.
    let result = store
        .append_to_stream("b", ExpectedVersion::NoStream, messages(&[4]), &c)
        .await
        .unwrap();
    assert_eq!(result.current_position, 4);

    let page = store.read_all_forwards(Position::START, 10, true, &c).await.unwrap();
    let positions: Vec<i64> = page.messages.iter().map(|m| m.position).collect();
    assert_eq!(positions, vec![3, 4]);
    store.dispose().await;
}

#[tokio::test]
async fn metadata_survives_restart() {
    let (_dir, path) = common::create_temp_db_file("metadata.db");
    let c = cancel();

    let store = open(&path);
    store
        .set_stream_metadata("s", ExpectedVersion::NoStream, Some(30), Some(2), Some("{}".to_string()), &c)
        .await
        .unwrap();
    store.dispose().await;

    let store = open(&path);
    let metadata = store.get_stream_metadata("s", &c).await.unwrap();
    assert_eq!(metadata.metadata_stream_version, 0);
    assert_eq!(metadata.max_age, Some(30));
    assert_eq!(metadata.max_count, Some(2));

    store
        .append_to_stream("s", ExpectedVersion::Any, messages(&[1, 2, 3]), &c)
        .await
        .unwrap();
    assert_eq!(store.get_stream_message_count("s", &c).await.unwrap(), 2);
    store.dispose().await;
}

#[tokio::test]
async fn stream_ids_are_stored_hashed_with_original_kept() {
    let (_dir, path) = common::create_temp_db_file("keys.db");
    let c = cancel();

    let guid = Uuid::new_v4().to_string();
    let store = open(&path);
    for id in ["plain-name", guid.as_str()] {
        store
            .append_to_stream(id, ExpectedVersion::NoStream, vec![common::message(1)], &c)
            .await
            .unwrap();
    }
    store.dispose().await;

    let conn = Database::open(&path).unwrap().into_connection();
    let mut stmt = conn
        .prepare("SELECT id, id_original FROM streams ORDER BY id_internal")
        .unwrap();
    let rows: Vec<(String, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(rows[0].1, "plain-name");
    assert_eq!(rows[0].0.len(), 40);
    assert!(rows[0].0.chars().all(|ch| ch.is_ascii_hexdigit() && !ch.is_ascii_lowercase()));
    // GUID ids are used as their own key.
    assert_eq!(rows[1], (guid.clone(), guid));
}

#[tokio::test]
async fn calls_after_dispose_fail() {
    let (_dir, path) = common::create_temp_db_file("disposed.db");
    let store = open(&path);
    store.dispose().await;

    let result = store
        .append_to_stream("a", ExpectedVersion::Any, messages(&[1]), &cancel())
        .await;
    assert!(matches!(result, Err(streamstore::Error::Disposed)));
}
