// tests/property/framing_test.rs

//! Property-based tests for record-separator framing
//! Tests that frames survive arbitrary chunking on the way in

use bytes::BytesMut;
use hublink::core::protocol::framing::{RECORD_SEPARATOR, try_split_frame, write_frame};
use hublink::core::protocol::{HubMessage, HubProtocol, JsonHubProtocol, PermissiveBinder};
use proptest::prelude::*;
use serde_json::json;

fn payload() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>().prop_filter("no separator", |b| *b != RECORD_SEPARATOR), 0..200)
}

/// Cuts `bytes` into consecutive chunks whose sizes cycle through `sizes`.
fn chunks<'a>(bytes: &'a [u8], sizes: &[usize]) -> Vec<&'a [u8]> {
    let mut out = Vec::new();
    let mut offset = 0;
    let mut i = 0;
    while offset < bytes.len() {
        let size = sizes[i % sizes.len()].min(bytes.len() - offset);
        out.push(&bytes[offset..offset + size]);
        offset += size;
        i += 1;
    }
    out
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        max_shrink_iters: 500,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_frames_split_identically_under_any_chunking(
        payloads in prop::collection::vec(payload(), 1..20),
        sizes in prop::collection::vec(1usize..64, 1..8)
    ) {
        let mut wire = BytesMut::new();
        for p in &payloads {
            write_frame(p, &mut wire);
        }

        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        for chunk in chunks(&wire, &sizes) {
            buf.extend_from_slice(chunk);
            while let Some(frame) = try_split_frame(&mut buf).unwrap() {
                frames.push(frame.to_vec());
            }
        }

        prop_assert!(buf.is_empty());
        prop_assert_eq!(frames, payloads);
    }

    #[test]
    fn test_incomplete_frame_is_never_consumed(data in payload()) {
        let mut buf = BytesMut::from(&data[..]);
        prop_assert!(try_split_frame(&mut buf).unwrap().is_none());
        prop_assert_eq!(&buf[..], &data[..]);
    }

    #[test]
    fn test_messages_parse_the_same_under_any_chunking(
        targets in prop::collection::vec("[a-zA-Z][a-zA-Z0-9_]{0,20}", 1..10),
        texts in prop::collection::vec(".{0,40}", 1..10),
        sizes in prop::collection::vec(1usize..32, 1..6)
    ) {
        let protocol = JsonHubProtocol::new();
        let messages: Vec<HubMessage> = targets
            .iter()
            .zip(texts.iter().cycle())
            .enumerate()
            .map(|(i, (target, text))| HubMessage::Invocation {
                invocation_id: (i % 2 == 0).then(|| i.to_string()),
                target: target.clone(),
                arguments: vec![json!(text), json!(i)],
                stream_ids: vec![],
            })
            .collect();
        let mut wire = BytesMut::new();
        for message in &messages {
            protocol.write_message(message, &mut wire).unwrap();
        }

        let mut buf = BytesMut::new();
        let mut parsed = Vec::new();
        for chunk in chunks(&wire, &sizes) {
            buf.extend_from_slice(chunk);
            while let Some(message) = protocol.try_parse_message(&mut buf, &PermissiveBinder).unwrap() {
                parsed.push(message);
            }
        }

        prop_assert_eq!(parsed, messages);
    }
}
