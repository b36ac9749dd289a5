use crate::domain::{ContentType, Message};
use crate::error::{ApiError, ErrorCode};
use crate::protocol::{
    ClientFrame, ListPartsResponse, LoginResponse, ServerFrame, UploadedPart,
};

#[test]
fn message_dto_parses_wire_shape() {
    let raw = r#"{
        "id": "m1",
        "room_id": "r1",
        "sequence_id": 7,
        "sender_id": "u2",
        "content_type": "text",
        "content_text": "hello",
        "created_at": 1700000000
    }"#;
    let msg: Message = serde_json::from_str(raw).expect("parse");
    assert_eq!(msg.sequence_id, 7);
    assert_eq!(msg.content_type, ContentType::Text);
    assert_eq!(msg.created_at.timestamp(), 1_700_000_000);
    assert!(msg.attachment_id.is_none());
}

#[test]
fn message_dto_omits_absent_fields() {
    let raw = r#"{"id":"m2","room_id":"r1","sequence_id":1,"content_type":"file","created_at":0}"#;
    let msg: Message = serde_json::from_str(raw).expect("parse");
    assert!(msg.sender_id.is_none());
    let back = serde_json::to_value(&msg).expect("serialize");
    assert!(back.get("content_text").is_none());
}

#[test]
fn login_response_uses_camel_case_tokens() {
    let raw = r#"{
        "accessToken": "a",
        "refreshToken": "r",
        "user": {"id": "u1", "username": "alice", "status": "active"}
    }"#;
    let resp: LoginResponse = serde_json::from_str(raw).expect("parse");
    assert_eq!(resp.access_token, "a");
    assert_eq!(resp.refresh_token, "r");
    assert_eq!(resp.user.username, "alice");
}

#[test]
fn ping_frame_serializes_flat() {
    let frame = serde_json::to_value(ClientFrame::Ping).expect("serialize");
    assert_eq!(frame, serde_json::json!({"type": "ping"}));
}

#[test]
fn friend_message_frame_round_trips() {
    let frame = ClientFrame::FriendMessage {
        to_user_id: "u2".into(),
        content: "hi".into(),
    };
    let v = serde_json::to_value(&frame).expect("serialize");
    assert_eq!(v["type"], "friend_message");
    assert_eq!(v["to_user_id"], "u2");
}

#[test]
fn server_frames_parse_by_type_tag() {
    let pong: ServerFrame = serde_json::from_str(r#"{"type":"pong","ts":123}"#).expect("pong");
    assert!(matches!(pong, ServerFrame::Pong { ts: 123 }));

    let raw = r#"{
        "type": "group_message",
        "id": "m9",
        "from_user_id": "u1",
        "room_id": "g1",
        "content": "yo",
        "timestamp": 1700000001,
        "sequence_id": 3
    }"#;
    let frame: ServerFrame = serde_json::from_str(raw).expect("group frame");
    match frame {
        ServerFrame::GroupMessage(inner) => {
            assert_eq!(inner.sequence_id, 3);
            assert_eq!(inner.room_id.as_ref().map(|r| r.as_str()), Some("g1"));
        }
        other => panic!("unexpected frame: {other:?}"),
    }

    let ping: ServerFrame = serde_json::from_str(r#"{"type":"ping"}"#).expect("ping");
    assert!(matches!(ping, ServerFrame::Ping { ts: None }));
}

#[test]
fn relayed_frame_without_id_or_sequence_still_parses() {
    let raw = r#"{
        "type": "friend_message",
        "from_user_id": "u1",
        "to_user_id": "u2",
        "room_id": "dm-12",
        "content": "early relay",
        "timestamp": 1700000002
    }"#;
    let frame: ServerFrame = serde_json::from_str(raw).expect("frame");
    match frame {
        ServerFrame::FriendMessage(inner) => {
            assert!(inner.id.is_none());
            assert_eq!(inner.sequence_id, 0);
        }
        other => panic!("unexpected frame: {other:?}"),
    }
}

#[test]
fn uploaded_parts_accept_store_casing() {
    let resp: ListPartsResponse = serde_json::from_str(
        r#"{"parts":[{"PartNumber":1,"ETag":"abc","Size":5242880},{"part_number":2}]}"#,
    )
    .expect("parts");
    assert_eq!(resp.parts.len(), 2);
    assert_eq!(resp.parts[0].part_number, 1);
    assert_eq!(resp.parts[0].etag.as_deref(), Some("abc"));
    assert_eq!(resp.parts[1].part_number, 2);
    assert!(resp.parts[1].etag.is_none());

    let ours = UploadedPart {
        part_number: 3,
        etag: Some("def".into()),
        size: Some(10),
    };
    let v = serde_json::to_value(&ours).expect("serialize");
    assert_eq!(v["part_number"], 3);
}

#[test]
fn api_error_maps_status_and_body() {
    let err = ApiError::from_response(401, r#"{"error":"token expired"}"#);
    assert_eq!(err.code, ErrorCode::Unauthorized);
    assert_eq!(err.message, "token expired");

    let fallback = ApiError::from_response(500, "not json");
    assert_eq!(fallback.code, ErrorCode::Internal);
}
