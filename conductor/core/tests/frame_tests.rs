//! Wire-level tests: envelopes written as frames over a byte pipe
//!
//! A client reading the event stream sees arbitrary chunk boundaries. These
//! tests push orchestrator output through an in-memory duplex pipe and decode
//! it back with `FrameDecoder`.

use std::sync::Arc;

use futures::StreamExt;
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use chatstream_core::backend::{Script, ScriptedRunner};
use chatstream_core::{
    Envelope, FrameDecoder, FrameEncoder, InMemoryConversationStore, SessionRegistry,
    StreamOrchestrator,
};

async fn decode_all(mut reader: tokio::io::DuplexStream) -> Vec<Envelope> {
    let mut decoder = FrameDecoder::new();
    let mut envelopes = Vec::new();
    let mut buf = [0u8; 7];

    loop {
        let n = reader.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        decoder.push(&buf[..n]);
        while let Some(envelope) = decoder.decode().unwrap() {
            envelopes.push(envelope);
        }
    }

    assert_eq!(decoder.available(), 0);
    envelopes
}

#[tokio::test]
async fn test_stream_survives_arbitrary_chunking() {
    let script = Script::completes(
        ["Line one\n", "line \"two\"", " ünïcödé ✓"],
        "Line one\nline \"two\" ünïcödé ✓",
    );
    let orch = StreamOrchestrator::new(
        Arc::new(ScriptedRunner::new().with_script(script)),
        Arc::new(InMemoryConversationStore::default()),
        SessionRegistry::new(),
    );

    let (mut writer, reader) = tokio::io::duplex(64);
    let reader_task = tokio::spawn(decode_all(reader));

    let encoder = FrameEncoder::new();
    let mut stream = orch.stream_chat("hi", Some("c1"), 0).unwrap();
    let mut sent = Vec::new();
    while let Some(envelope) = stream.next().await {
        writer.write_all(&encoder.encode(&envelope).unwrap()).await.unwrap();
        sent.push(envelope);
    }
    drop(writer);

    assert_eq!(sent.len(), 4);
    assert!(sent[3].is_terminal());
    assert_eq!(reader_task.await.unwrap(), sent);
}

#[tokio::test]
async fn test_scripted_frames_round_trip_over_pipe() {
    let envelopes = vec![
        Envelope::token("Hi", 0, "default"),
        Envelope::token(" there\n\nfriend", 1, "default"),
        Envelope::end("default", "Hi there\n\nfriend"),
    ];

    let (mut writer, reader) = tokio::io::duplex(16);
    let reader_task = tokio::spawn(decode_all(reader));

    let encoder = FrameEncoder::new();
    for envelope in &envelopes {
        writer.write_all(&encoder.encode(envelope).unwrap()).await.unwrap();
    }
    drop(writer);

    assert_eq!(reader_task.await.unwrap(), envelopes);
}
