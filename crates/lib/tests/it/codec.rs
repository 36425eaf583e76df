//! Message framing over real TCP sockets.

use meshmap::codec::io::{ReadLimits, read_message, write_message};
use meshmap::codec::{
    Bootstrap, ENVELOPE_SIZE, FRAME_OVERHEAD, Message, TAG_CHUNK, encode_bootstrap, encode_chunks,
    heartbeat, max_chunk_payload, max_entries_per_chunk, max_entry_size,
};
use meshmap::{Mutation, Version};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

const ENTRY_SIZE: usize = 64;

fn limits() -> ReadLimits {
    ReadLimits {
        max_payload: max_chunk_payload(8, max_entry_size(ENTRY_SIZE)),
        entry_size: ENTRY_SIZE,
    }
}

async fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (client.unwrap(), accepted.unwrap().0)
}

fn sample_mutations(count: usize) -> Vec<Mutation> {
    (0..count)
        .map(|i| {
            let version = Version::new(1_000 + i as u64, (i % 4) as u8 + 1);
            if i % 5 == 0 {
                Mutation::remove(format!("key-{i}"), version)
            } else {
                Mutation::put(format!("key-{i}"), format!("EXAMPLE-{i}"), version)
            }
        })
        .collect()
}

#[tokio::test]
async fn test_messages_survive_byte_at_a_time_delivery() {
    let (mut writer, mut reader) = socket_pair().await;
    let bootstrap = Bootstrap {
        protocol_version: 1,
        identifier: 7,
        last_seen: vec![(1, 10), (7, 99)],
    };
    let mutations = sample_mutations(6);

    let mut bytes = encode_bootstrap(&bootstrap);
    for chunk in encode_chunks(&mutations, 4, max_entry_size(ENTRY_SIZE)) {
        bytes.extend(chunk);
    }
    bytes.extend(heartbeat());

    let send = tokio::spawn(async move {
        for byte in bytes {
            writer.write_all(&[byte]).await.unwrap();
            writer.flush().await.unwrap();
        }
    });

    let mut received = Vec::new();
    while let Some(message) = read_message(&mut reader, limits()).await.unwrap() {
        received.push(message);
    }
    send.await.unwrap();

    assert_eq!(received.len(), 4);
    assert_eq!(received[0], Message::Bootstrap(bootstrap));
    assert_eq!(received[1], Message::Chunk(mutations[..4].to_vec()));
    assert_eq!(received[2], Message::Chunk(mutations[4..].to_vec()));
    assert_eq!(received[3], Message::Chunk(Vec::new()));
}

#[tokio::test]
async fn test_oversized_payload_is_rejected_before_reading_it() {
    let (mut writer, mut reader) = socket_pair().await;
    let mut header = vec![TAG_CHUNK];
    header.extend_from_slice(&u32::MAX.to_be_bytes());
    write_message(&mut writer, &header).await.unwrap();

    let err = read_message(&mut reader, limits()).await.unwrap_err();
    assert!(err.is_codec_error());
}

fn full_size_entries(count: usize) -> Vec<Mutation> {
    (0..count)
        .map(|i| {
            let key = format!("key-{i:06}");
            let value = vec![b'v'; ENTRY_SIZE - key.len()];
            Mutation::put(key, value, Version::new(1 + i as u64, 1))
        })
        .collect()
}

#[tokio::test]
async fn test_chunk_larger_than_configured_budget_is_rejected() {
    let max = max_entry_size(ENTRY_SIZE);

    // Eight maximal frames fill the reader's limit exactly.
    let (mut writer, mut reader) = socket_pair().await;
    let chunk = encode_chunks(&full_size_entries(8), 8, max).pop().unwrap();
    assert_eq!(chunk.len() - ENVELOPE_SIZE, max_chunk_payload(8, max));
    write_message(&mut writer, &chunk).await.unwrap();
    let message = read_message(&mut reader, limits()).await.unwrap();
    assert!(matches!(message, Some(Message::Chunk(entries)) if entries.len() == 8));

    // A ninth does not fit.
    let (mut writer, mut reader) = socket_pair().await;
    let chunk = encode_chunks(&full_size_entries(9), 9, max).pop().unwrap();
    write_message(&mut writer, &chunk).await.unwrap();
    let err = read_message(&mut reader, limits()).await.unwrap_err();
    assert!(err.is_codec_error());
}

#[tokio::test]
async fn test_truncated_message_is_an_io_error() {
    let (mut writer, mut reader) = socket_pair().await;
    let chunk = encode_chunks(&sample_mutations(1), 8, max_entry_size(ENTRY_SIZE))
        .pop()
        .unwrap();
    write_message(&mut writer, &chunk[..chunk.len() - 1]).await.unwrap();
    drop(writer);

    let err = read_message(&mut reader, limits()).await.unwrap_err();
    assert_eq!(err.module(), "io");
}

#[tokio::test]
async fn test_frame_for_larger_entry_size_is_rejected() {
    let (mut writer, mut reader) = socket_pair().await;
    let big = Mutation::put(vec![b'k'; 10], vec![b'v'; ENTRY_SIZE], Version::new(1, 1));
    let chunk = encode_chunks(&[big], 8, max_entry_size(ENTRY_SIZE * 2))
        .pop()
        .unwrap();
    write_message(&mut writer, &chunk).await.unwrap();

    let err = read_message(&mut reader, limits()).await.unwrap_err();
    assert!(err.is_codec_error());
}

#[test]
fn test_default_chunk_sizing() {
    // 128-byte entries under a 8 KiB budget.
    let max = max_entry_size(128);
    assert_eq!(max, 128 + FRAME_OVERHEAD);
    assert_eq!(max_entries_per_chunk(8192, max), 8192 / max as u16);
    assert_eq!(max_entries_per_chunk(10, max), 1);

    let chunks = encode_chunks(&sample_mutations(100), 56, max);
    assert_eq!(chunks.len(), 2);
    assert!(chunks.iter().all(|c| c.len() <= ENVELOPE_SIZE + 2 + 56 * max));
}
