use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio_util::codec::{Decoder, Framed};
use torrentchain::crypto::{Keypair, SIGNATURE_LENGTH};
use torrentchain::error::{CryptoError, NetworkError};
use torrentchain::protocol::{decode_payload, encode_payload, frame_codec, Message};
use torrentchain::TorrentChainError;

fn sample_messages() -> Vec<Message> {
    vec![
        Message::Handshake {
            node_id: "127.0.0.1:21000".to_string(),
            pub_key: "ab".repeat(32),
        },
        Message::announce_chunk("cd".repeat(32), vec!["127.0.0.1:21001".to_string()], "127.0.0.1:21000"),
        Message::announce_inventory(vec!["ef".repeat(32)], "127.0.0.1:21000"),
        Message::ChunkRequest {
            chunk_hash: "01".repeat(32),
            requestor: "127.0.0.1:21002".to_string(),
        },
        Message::ChunkResponse {
            chunk_hash: "01".repeat(32),
            data: hex::encode(b"hello"),
        },
        Message::PeerExchange {
            peers: vec!["127.0.0.1:21003".to_string()],
        },
        Message::Heartbeat {},
    ]
}

#[test]
fn test_signed_payload_decodes() {
    let keypair = Keypair::generate();
    for message in sample_messages() {
        let payload = encode_payload(&message, &keypair, 1_700_000_000.5).unwrap();
        let envelope = decode_payload(&payload).unwrap();
        assert_eq!(envelope.message, message);
        assert_eq!(envelope.sender_key, keypair.public_key_hex());
        assert_eq!(envelope.timestamp, 1_700_000_000.5);
    }
}

#[test]
fn test_payload_is_json_then_signature() {
    let keypair = Keypair::generate();
    let payload = encode_payload(&Message::Heartbeat {}, &keypair, 1.0).unwrap();
    let (json, signature) = payload.split_at(payload.len() - SIGNATURE_LENGTH);

    let value: serde_json::Value = serde_json::from_slice(json).unwrap();
    assert_eq!(value["type"], "heartbeat");
    assert_eq!(value["sender_key"], keypair.public_key_hex());
    assert_eq!(signature, keypair.sign(json));
}

#[test]
fn test_message_type_tags() {
    let tags: Vec<&str> = sample_messages().iter().map(Message::message_type).collect();
    assert_eq!(
        tags,
        vec![
            "handshake",
            "chunk_announce",
            "chunk_announce",
            "chunk_request",
            "chunk_response",
            "peer_exchange",
            "heartbeat"
        ]
    );
}

#[test]
fn test_tampered_payload_is_rejected() {
    let keypair = Keypair::generate();
    let mut payload = encode_payload(
        &Message::PeerExchange {
            peers: vec!["127.0.0.1:21003".to_string()],
        },
        &keypair,
        1.0,
    )
    .unwrap();
    let position = payload.iter().position(|b| *b == b'3').unwrap();
    payload[position] = b'4';

    assert!(matches!(
        decode_payload(&payload),
        Err(TorrentChainError::Crypto(CryptoError::InvalidSignature))
    ));
}

#[test]
fn test_foreign_signature_is_rejected() {
    let keypair = Keypair::generate();
    let impostor = Keypair::generate();
    let mut payload = encode_payload(&Message::Heartbeat {}, &keypair, 1.0).unwrap();
    let split = payload.len() - SIGNATURE_LENGTH;
    let forged = impostor.sign(&payload[..split]);
    payload[split..].copy_from_slice(&forged);

    assert!(decode_payload(&payload).is_err());
}

#[test]
fn test_short_or_garbled_payloads_are_invalid() {
    assert!(matches!(
        decode_payload(&[0u8; SIGNATURE_LENGTH]),
        Err(TorrentChainError::Network(NetworkError::InvalidMessage { .. }))
    ));

    let mut garbage = b"{not json".to_vec();
    garbage.extend_from_slice(&[0u8; SIGNATURE_LENGTH]);
    assert!(decode_payload(&garbage).is_err());
}

#[test]
fn test_frame_header_is_big_endian_length() {
    let mut codec = frame_codec(1024);
    let mut buf = BytesMut::new();
    buf.put_u32(5);
    buf.put_slice(b"hello");
    buf.put_u32(3);
    buf.put_slice(b"ab");

    let frame = codec.decode(&mut buf).unwrap().unwrap();
    assert_eq!(&frame[..], b"hello");
    // Second frame is incomplete
    assert!(codec.decode(&mut buf).unwrap().is_none());
}

#[test]
fn test_oversized_frame_is_an_error() {
    let mut codec = frame_codec(16);
    let mut buf = BytesMut::new();
    buf.put_u32(1024);
    buf.put_slice(&[0u8; 32]);
    assert!(codec.decode(&mut buf).is_err());
}

#[tokio::test]
async fn test_frames_cross_a_duplex_stream() {
    let keypair = Keypair::generate();
    let (left, right) = tokio::io::duplex(64 * 1024);
    let mut writer = Framed::new(left, frame_codec(1024 * 1024));
    let mut reader = Framed::new(right, frame_codec(1024 * 1024));

    for message in sample_messages() {
        let payload = encode_payload(&message, &keypair, 2.0).unwrap();
        writer.send(Bytes::from(payload)).await.unwrap();
    }
    drop(writer);

    let mut received = Vec::new();
    while let Some(frame) = reader.next().await {
        received.push(decode_payload(&frame.unwrap()).unwrap().message);
    }
    assert_eq!(received, sample_messages());
}
