// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use serde_json::json;

#[test]
fn decode_minimal_request() {
    let req = decode_request(r#"{"event":"system:health"}"#).unwrap();
    assert_eq!(req.event, "system:health");
    assert_eq!(req.data, json!({}));
    assert!(req.correlation_id.is_none());
    assert!(req.timeout.is_none());
}

#[test]
fn decode_full_request() {
    let req = decode_request(
        r#"{"event":"a:b","data":{"x":1},"correlation_id":"c1","_ksi_context":{"_agent_id":"a"},"timeout":2.5}"#,
    )
    .unwrap();
    assert_eq!(req.data, json!({"x": 1}));
    assert_eq!(req.correlation_id, Some(json!("c1")));
    assert_eq!(req.ksi_context, Some(json!({"_agent_id": "a"})));
    assert_eq!(req.timeout, Some(2.5));
}

#[test]
fn decode_rejects_missing_event() {
    assert!(matches!(
        decode_request(r#"{"data":{}}"#),
        Err(ProtocolError::Json(_))
    ));
    assert!(matches!(
        decode_request(r#"{"event":""}"#),
        Err(ProtocolError::MissingEvent)
    ));
}

#[test]
fn single_result_unwraps() {
    let envelope = response_envelope("q:a", vec![json!({"n": 1})], Some(json!("c9")), 5.0);
    assert_eq!(envelope["data"], json!({"n": 1}));
    assert_eq!(envelope["count"], json!(1));
    assert_eq!(envelope["correlation_id"], json!("c9"));
}

#[test]
fn multiple_results_stay_a_list() {
    let envelope = response_envelope("q:a", vec![json!(1), json!(2)], None, 5.0);
    assert_eq!(envelope["data"], json!([1, 2]));
    assert_eq!(envelope["count"], json!(2));
    assert_eq!(envelope["correlation_id"], json!(null));
}

#[test]
fn zero_results_are_an_empty_list() {
    let envelope = response_envelope("q:a", vec![], None, 5.0);
    assert_eq!(envelope["data"], json!([]));
    assert_eq!(envelope["count"], json!(0));
}

#[test]
fn error_envelope_replaces_data() {
    let envelope = error_envelope(Some("q:a"), "bad input", Some(json!("c1")), 5.0);
    assert_eq!(envelope["error"], json!("bad input"));
    assert!(envelope.get("data").is_none());
    assert_eq!(envelope["event"], json!("q:a"));
}

#[tokio::test]
async fn read_frame_splits_lines() {
    let input = b"{\"event\":\"a\"}\n{\"event\":\"b\"}\n".to_vec();
    let mut reader = std::io::Cursor::new(input);
    assert_eq!(
        read_frame(&mut reader).await.unwrap().unwrap(),
        "{\"event\":\"a\"}"
    );
    assert_eq!(
        read_frame(&mut reader).await.unwrap().unwrap(),
        "{\"event\":\"b\"}"
    );
    assert!(read_frame(&mut reader).await.unwrap().is_none());
}

#[tokio::test]
async fn read_frame_skips_blank_lines() {
    let input = b"\n\n{\"event\":\"a\"}\n".to_vec();
    let mut reader = std::io::Cursor::new(input);
    assert_eq!(
        read_frame(&mut reader).await.unwrap().unwrap(),
        "{\"event\":\"a\"}"
    );
}

#[tokio::test]
async fn read_frame_handles_trailing_unterminated_line() {
    let input = b"{\"event\":\"a\"}".to_vec();
    let mut reader = std::io::Cursor::new(input);
    assert_eq!(
        read_frame(&mut reader).await.unwrap().unwrap(),
        "{\"event\":\"a\"}"
    );
    assert!(read_frame(&mut reader).await.unwrap().is_none());
}

#[tokio::test]
async fn read_frame_bounds_line_length() {
    let mut input = vec![b'x'; MAX_LINE_BYTES + 10];
    input.push(b'\n');
    let mut reader = std::io::Cursor::new(input);
    assert!(matches!(
        read_frame(&mut reader).await,
        Err(ProtocolError::LineTooLong { .. })
    ));
}
