#[macro_use]
mod common;

use common::{cancel, messages};
use streamstore::{
    Error, ExpectedVersion, PageReadStatus, StreamStore, StreamStoreBackend, StreamVersion, DELETED_STREAM_ID,
    MESSAGE_DELETED_MESSAGE_TYPE, STREAM_DELETED_MESSAGE_TYPE,
};
use uuid::Uuid;

backend_tests!(
    deleted_stream_reads_as_not_found,
    deleting_missing_stream_with_any_is_a_no_op,
    delete_stream_checks_expected_version,
    delete_stream_rejects_empty_stream,
    delete_stream_removes_metadata,
    delete_stream_writes_tombstone,
    delete_message_writes_one_tombstone,
    deleting_missing_message_changes_nothing,
    deleted_stream_can_be_recreated,
    tombstones_cannot_be_deleted,
);

async fn deleted_stream_reads_as_not_found<B: StreamStoreBackend>(store: StreamStore<B>) {
    let c = cancel();
    store
        .append_to_stream("stream-1", ExpectedVersion::NoStream, messages(&[1, 2]), &c)
        .await
        .unwrap();

    store.delete_stream("stream-1", ExpectedVersion::Any, &c).await.unwrap();

    let page = store
        .read_stream_forwards("stream-1", StreamVersion::START, 10, true, &c)
        .await
        .unwrap();
    assert_eq!(page.status, PageReadStatus::StreamNotFound);
    assert!(page.is_end);
    assert!(page.messages.is_empty());
}

async fn deleting_missing_stream_with_any_is_a_no_op<B: StreamStoreBackend>(store: StreamStore<B>) {
    let c = cancel();
    store.delete_stream("never-existed", ExpectedVersion::Any, &c).await.unwrap();
    store.delete_stream("never-existed", ExpectedVersion::NoStream, &c).await.unwrap();

    // No tombstone for a stream that was not there.
    assert_eq!(store.read_head_position(&c).await.unwrap(), -1);
}

async fn delete_stream_checks_expected_version<B: StreamStoreBackend>(store: StreamStore<B>) {
    let c = cancel();

    let result = store.delete_stream("stream-1", ExpectedVersion::Exact(0), &c).await;
    assert!(matches!(result, Err(Error::WrongExpectedVersion { .. })));

    store
        .append_to_stream("stream-1", ExpectedVersion::NoStream, messages(&[1, 2]), &c)
        .await
        .unwrap();

    let result = store.delete_stream("stream-1", ExpectedVersion::Exact(0), &c).await;
    assert!(matches!(result, Err(Error::WrongExpectedVersion { .. })));
    let result = store.delete_stream("stream-1", ExpectedVersion::NoStream, &c).await;
    assert!(matches!(result, Err(Error::WrongExpectedVersion { .. })));
    assert_eq!(store.get_stream_message_count("stream-1", &c).await.unwrap(), 2);

    store.delete_stream("stream-1", ExpectedVersion::Exact(1), &c).await.unwrap();
    assert_eq!(store.read_stream_head_version("stream-1", &c).await.unwrap(), -1);
}

async fn delete_stream_rejects_empty_stream<B: StreamStoreBackend>(store: StreamStore<B>) {
    let c = cancel();
    let result = store.delete_stream("stream-1", ExpectedVersion::EmptyStream, &c).await;
    assert!(matches!(result, Err(Error::InvalidArgument(_))));

    store
        .append_to_stream("stream-1", ExpectedVersion::NoStream, messages(&[1]), &c)
        .await
        .unwrap();
    let result = store.delete_stream("stream-1", ExpectedVersion::EmptyStream, &c).await;
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
}

async fn delete_stream_removes_metadata<B: StreamStoreBackend>(store: StreamStore<B>) {
    let c = cancel();
    store
        .append_to_stream("stream-1", ExpectedVersion::NoStream, messages(&[1]), &c)
        .await
        .unwrap();
    store
        .set_stream_metadata("stream-1", ExpectedVersion::NoStream, None, Some(10), None, &c)
        .await
        .unwrap();

    store.delete_stream("stream-1", ExpectedVersion::Any, &c).await.unwrap();

    let metadata = store.get_stream_metadata("stream-1", &c).await.unwrap();
    assert_eq!(metadata.metadata_stream_version, -1);
    assert_eq!(metadata.max_count, None);
}

async fn delete_stream_writes_tombstone<B: StreamStoreBackend>(store: StreamStore<B>) {
    let c = cancel();
    store
        .append_to_stream("stream-1", ExpectedVersion::NoStream, messages(&[1]), &c)
        .await
        .unwrap();
    store.delete_stream("stream-1", ExpectedVersion::Any, &c).await.unwrap();

    let page = store
        .read_stream_forwards(DELETED_STREAM_ID, StreamVersion::START, 10, true, &c)
        .await
        .unwrap();
    assert_eq!(page.messages.len(), 1);
    let tombstone = &page.messages[0];
    assert_eq!(tombstone.message_type, STREAM_DELETED_MESSAGE_TYPE);

    let body: serde_json::Value = serde_json::from_str(&tombstone.json_data().await.unwrap().unwrap()).unwrap();
    assert_eq!(body["StreamId"], "stream-1");
}

async fn delete_message_writes_one_tombstone<B: StreamStoreBackend>(store: StreamStore<B>) {
    let c = cancel();
    store
        .append_to_stream("stream-1", ExpectedVersion::NoStream, messages(&[1, 2, 3]), &c)
        .await
        .unwrap();

    store.delete_message("stream-1", Uuid::from_u128(2), &c).await.unwrap();

    let page = store
        .read_stream_forwards("stream-1", StreamVersion::START, 10, true, &c)
        .await
        .unwrap();
    let ids: Vec<Uuid> = page.messages.iter().map(|m| m.message_id).collect();
    assert_eq!(ids, vec![Uuid::from_u128(1), Uuid::from_u128(3)]);
    assert_eq!(page.last_stream_version, 2);

    let deleted = store
        .read_stream_forwards(DELETED_STREAM_ID, StreamVersion::START, 10, true, &c)
        .await
        .unwrap();
    assert_eq!(deleted.messages.len(), 1);
    assert_eq!(deleted.messages[0].message_type, MESSAGE_DELETED_MESSAGE_TYPE);

    let body: serde_json::Value =
        serde_json::from_str(&deleted.messages[0].json_data().await.unwrap().unwrap()).unwrap();
    assert_eq!(body["StreamId"], "stream-1");
    assert_eq!(body["MessageId"], Uuid::from_u128(2).to_string());
}

async fn deleting_missing_message_changes_nothing<B: StreamStoreBackend>(store: StreamStore<B>) {
    let c = cancel();
    store
        .append_to_stream("stream-1", ExpectedVersion::NoStream, messages(&[1]), &c)
        .await
        .unwrap();
    let head = store.read_head_position(&c).await.unwrap();

    store.delete_message("stream-1", Uuid::from_u128(99), &c).await.unwrap();
    store.delete_message("no-such-stream", Uuid::from_u128(1), &c).await.unwrap();

    assert_eq!(store.read_head_position(&c).await.unwrap(), head);
    assert_eq!(store.get_stream_message_count("stream-1", &c).await.unwrap(), 1);
    assert_eq!(store.read_stream_head_version(DELETED_STREAM_ID, &c).await.unwrap(), -1);
}

async fn deleted_stream_can_be_recreated<B: StreamStoreBackend>(store: StreamStore<B>) {
    let c = cancel();
    store
        .append_to_stream("stream-1", ExpectedVersion::NoStream, messages(&[1, 2]), &c)
        .await
        .unwrap();
    store.delete_stream("stream-1", ExpectedVersion::Any, &c).await.unwrap();

    let result = store
        .append_to_stream("stream-1", ExpectedVersion::NoStream, messages(&[3]), &c)
        .await
        .unwrap();
    assert_eq!(result.current_version, 0);
    // Positions 0 and 1 were used by the old stream, 2 by its tombstone.
    assert_eq!(result.current_position, 3);
}

async fn tombstones_cannot_be_deleted<B: StreamStoreBackend>(store: StreamStore<B>) {
    let c = cancel();
    store
        .append_to_stream("s", ExpectedVersion::NoStream, messages(&[1]), &c)
        .await
        .unwrap();
    store.delete_stream("s", ExpectedVersion::Any, &c).await.unwrap();

    let before = store
        .read_stream_forwards(DELETED_STREAM_ID, StreamVersion::START, 10, true, &c)
        .await
        .unwrap();
    assert_eq!(before.messages.len(), 1);
    let tombstone_id = before.messages[0].message_id;

    let result = store.delete_message(DELETED_STREAM_ID, tombstone_id, &c).await;
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
    let result = store.delete_stream(DELETED_STREAM_ID, ExpectedVersion::Any, &c).await;
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
    let result = store
        .set_stream_metadata(DELETED_STREAM_ID, ExpectedVersion::Any, Some(1), Some(0), None, &c)
        .await;
    assert!(matches!(result, Err(Error::InvalidArgument(_))));

    let after = store
        .read_stream_forwards(DELETED_STREAM_ID, StreamVersion::START, 10, true, &c)
        .await
        .unwrap();
    assert_eq!(after.status, PageReadStatus::Success);
    let ids: Vec<Uuid> = after.messages.iter().map(|m| m.message_id).collect();
    assert_eq!(ids, vec![tombstone_id]);
}
