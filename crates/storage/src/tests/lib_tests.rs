use super::*;
use shared::domain::ContentType;

fn text_message(id: &str, room: &str, sequence_id: i64, text: &str) -> Message {
    Message {
        id: MessageId::new(id),
        room_id: RoomId::new(room),
        sequence_id,
        sender_id: Some(UserId::new("u1")),
        content_type: ContentType::Text,
        content_text: Some(text.to_string()),
        attachment_id: None,
        payload_json: None,
        created_at: DateTime::from_timestamp(1_700_000_000 + sequence_id, 0).expect("timestamp"),
    }
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("cache.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[tokio::test]
async fn empty_room_reads_back_empty_with_zero_watermark() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let room = RoomId::new("r-empty");

    assert_eq!(storage.last_sequence_id(&room).await.expect("watermark"), 0);
    assert!(storage
        .messages_in_room(&room)
        .await
        .expect("messages")
        .is_empty());
    assert_eq!(storage.first_sequence_id(&room).await.expect("first"), None);
}

#[tokio::test]
async fn reads_back_messages_in_sequence_order() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let room = RoomId::new("r1");

    storage
        .upsert_message(&text_message("m3", "r1", 3, "third"))
        .await
        .expect("m3");
    storage
        .upsert_message(&text_message("m1", "r1", 1, "first"))
        .await
        .expect("m1");
    storage
        .upsert_message(&text_message("m2", "r1", 2, "second"))
        .await
        .expect("m2");

    let messages = storage.messages_in_room(&room).await.expect("messages");
    let sequences: Vec<i64> = messages.iter().map(|m| m.sequence_id).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    assert_eq!(storage.last_sequence_id(&room).await.expect("watermark"), 3);
    assert_eq!(
        storage.first_sequence_id(&room).await.expect("first"),
        Some(1)
    );
}

#[tokio::test]
async fn replaying_the_same_message_id_does_not_duplicate() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let room = RoomId::new("r1");

    storage
        .upsert_message(&text_message("m1", "r1", 1, "original"))
        .await
        .expect("insert");
    storage
        .upsert_message(&text_message("m1", "r1", 1, "replayed"))
        .await
        .expect("replay");

    assert_eq!(storage.message_count(&room).await.expect("count"), 1);
    let messages = storage.messages_in_room(&room).await.expect("messages");
    assert_eq!(messages[0].content_text.as_deref(), Some("replayed"));
}

#[tokio::test]
async fn bulk_upsert_interleaves_with_existing_rows() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let room = RoomId::new("r1");

    storage
        .upsert_message(&text_message("m2", "r1", 2, "live"))
        .await
        .expect("live row");

    storage
        .bulk_upsert_messages(&[
            text_message("m1", "r1", 1, "pulled"),
            text_message("m2", "r1", 2, "pulled again"),
            text_message("m3", "r1", 3, "pulled"),
        ])
        .await
        .expect("bulk");

    assert_eq!(storage.message_count(&room).await.expect("count"), 3);
    assert_eq!(storage.last_sequence_id(&room).await.expect("watermark"), 3);
}

#[tokio::test]
async fn rooms_are_isolated() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");

    storage
        .bulk_upsert_messages(&[
            text_message("a1", "room-a", 1, "a"),
            text_message("a2", "room-a", 2, "a"),
            text_message("b1", "room-b", 5, "b"),
        ])
        .await
        .expect("bulk");

    assert_eq!(
        storage
            .last_sequence_id(&RoomId::new("room-a"))
            .await
            .expect("a watermark"),
        2
    );
    assert_eq!(
        storage
            .last_sequence_id(&RoomId::new("room-b"))
            .await
            .expect("b watermark"),
        5
    );
    assert_eq!(
        storage
            .messages_in_room(&RoomId::new("room-a"))
            .await
            .expect("a messages")
            .len(),
        2
    );
}

#[tokio::test]
async fn round_trips_attachment_and_payload_fields() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let room = RoomId::new("r1");

    let mut message = text_message("m1", "r1", 1, "see attachment");
    message.content_type = ContentType::File;
    message.attachment_id = Some(AttachmentId::new("att-1"));
    message.payload_json = Some(serde_json::json!({
        "attachment_id": "att-1",
        "file_name": "report.pdf",
        "size_bytes": 1024
    }));

    storage.upsert_message(&message).await.expect("insert");

    let loaded = storage.messages_in_room(&room).await.expect("messages");
    assert_eq!(loaded[0].content_type, ContentType::File);
    assert_eq!(
        loaded[0].attachment_id.as_ref().map(|a| a.as_str()),
        Some("att-1")
    );
    let payload = loaded[0].payload_json.as_ref().expect("payload");
    assert_eq!(payload["file_name"], "report.pdf");
    assert_eq!(loaded[0].created_at, message.created_at);
}

#[tokio::test]
async fn credentials_use_a_single_slot() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");

    assert!(storage.load_credentials().await.expect("empty").is_none());

    storage
        .save_credentials(&StoredCredentials {
            user_id: UserId::new("u1"),
            username: "alice".into(),
            access_token: "access-1".into(),
            refresh_token: "refresh-1".into(),
        })
        .await
        .expect("save");

    storage
        .save_credentials(&StoredCredentials {
            user_id: UserId::new("u1"),
            username: "alice".into(),
            access_token: "access-2".into(),
            refresh_token: "refresh-2".into(),
        })
        .await
        .expect("rotate");

    let creds = storage
        .load_credentials()
        .await
        .expect("load")
        .expect("present");
    assert_eq!(creds.access_token, "access-2");
    assert_eq!(creds.refresh_token, "refresh-2");

    storage.clear_credentials().await.expect("clear");
    assert!(storage.load_credentials().await.expect("cleared").is_none());
}
