//! Frame codec tests: EOT-delimited JSON arrays over a byte stream.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use taskfabric::proto::{Frame, FrameCodec, Message, Request, Response, SEPARATOR};

fn decode_all(codec: &mut FrameCodec, buf: &mut BytesMut) -> Vec<Frame> {
    let mut frames = Vec::new();
    while let Some(frame) = codec.decode(buf).unwrap() {
        frames.push(frame);
    }
    frames
}

#[test]
fn encode_appends_separator() {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();
    codec.encode(Message::Ping, &mut buf).unwrap();

    assert_eq!(buf.as_ref(), b"[2]\x04");
}

#[test]
fn request_roundtrip() {
    let request = Request {
        no: 42,
        kind: "poll".to_string(),
        data: Some(serde_json::json!({ "targets": ["alpha"] })),
        password: None,
    };

    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();
    codec
        .encode(Message::Request(request.clone()), &mut buf)
        .unwrap();

    let frames = decode_all(&mut codec, &mut buf);
    assert_eq!(frames.len(), 1);
    match &frames[0] {
        Frame::Message(Message::Request(decoded)) => assert_eq!(decoded, &request),
        other => panic!("unexpected frame: {other:?}"),
    }
}

#[test]
fn response_roundtrip_preserves_error() {
    let response = Response::err(7, "invalid password");

    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();
    codec
        .encode(Message::Response(response.clone()), &mut buf)
        .unwrap();

    let frames = decode_all(&mut codec, &mut buf);
    match &frames[0] {
        Frame::Message(Message::Response(decoded)) => {
            assert_eq!(decoded, &response);
            assert_eq!(decoded.error.as_deref(), Some("invalid password"));
            assert!(decoded.data.is_none());
        }
        other => panic!("unexpected frame: {other:?}"),
    }
}

#[test]
fn multiple_messages_in_one_chunk() {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();
    codec.encode(Message::Ping, &mut buf).unwrap();
    codec.encode(Message::Pong, &mut buf).unwrap();
    codec
        .encode(Message::Response(Response::ok(3, serde_json::json!("ok"))), &mut buf)
        .unwrap();

    let frames = decode_all(&mut codec, &mut buf);
    assert_eq!(frames.len(), 3);
    assert!(matches!(frames[0], Frame::Message(Message::Ping)));
    assert!(matches!(frames[1], Frame::Message(Message::Pong)));
    assert!(matches!(frames[2], Frame::Message(Message::Response(_))));
}

#[test]
fn partial_frame_waits_for_more_bytes() {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();

    // Feed the bytes of a ping one at a time; nothing decodes until the
    // separator arrives.
    buf.extend_from_slice(b"[");
    assert!(codec.decode(&mut buf).unwrap().is_none());
    buf.extend_from_slice(b"2]");
    assert!(codec.decode(&mut buf).unwrap().is_none());
    buf.extend_from_slice(&[SEPARATOR]);
    let frame = codec.decode(&mut buf).unwrap().unwrap();
    assert!(matches!(frame, Frame::Message(Message::Ping)));
}

#[test]
fn malformed_json_yields_invalid_frame_and_stream_continues() {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();
    buf.extend_from_slice(b"{not json\x04[2]\x04");

    let frames = decode_all(&mut codec, &mut buf);
    assert_eq!(frames.len(), 2);
    assert!(matches!(frames[0], Frame::Invalid(_)));
    assert!(matches!(frames[1], Frame::Message(Message::Ping)));
}

#[test]
fn non_array_message_is_invalid() {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();
    buf.extend_from_slice(b"{\"no\":1}\x04");

    let frames = decode_all(&mut codec, &mut buf);
    assert!(matches!(&frames[0], Frame::Invalid(reason) if reason.contains("not an array")));
}

#[test]
fn unknown_discriminant_is_invalid() {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();
    buf.extend_from_slice(b"[9]\x04");

    let frames = decode_all(&mut codec, &mut buf);
    assert!(matches!(&frames[0], Frame::Invalid(reason) if reason.contains("unknown message type")));
}

#[test]
fn ping_with_payload_is_invalid() {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();
    buf.extend_from_slice(b"[2,{}]\x04");

    let frames = decode_all(&mut codec, &mut buf);
    assert!(matches!(frames[0], Frame::Invalid(_)));
}

#[test]
fn encode_decode_is_byte_identical() {
    let messages = vec![
        Message::Request(Request {
            no: 999_998,
            kind: "status".to_string(),
            data: None,
            password: Some("p".to_string()),
        }),
        Message::Response(Response::ok(1, serde_json::json!({ "x": [1, 2, 3] }))),
        Message::Ping,
        Message::Pong,
    ];

    let mut codec = FrameCodec::new();
    let mut first = BytesMut::new();
    for message in &messages {
        codec.encode(message.clone(), &mut first).unwrap();
    }
    let original = first.clone();

    let mut second = BytesMut::new();
    for frame in decode_all(&mut codec, &mut first) {
        match frame {
            Frame::Message(message) => codec.encode(message, &mut second).unwrap(),
            Frame::Invalid(reason) => panic!("unexpected invalid frame: {reason}"),
        }
    }
    assert_eq!(original, second);
}
