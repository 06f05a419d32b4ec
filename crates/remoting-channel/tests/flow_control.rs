//! Drives a large pipe write through a constrained window against a slow
//! reader, checking that the writer blocks on window exhaustion instead of
//! flooding the peer, that chunks arrive in order, and that the full payload
//! lands intact once the reader keeps crediting window back.
#![allow(clippy::unwrap_used, clippy::cast_possible_truncation)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use remoting_channel::{Channel, ChannelBuilder, Dispatcher, Oid, PipeEvent, Unimplemented};
use remoting_proto::Mode;
use test_utils::{large_payload, Payload};

async fn build_pair(window: u32) -> (Channel, Channel) {
    let (a_io, b_io) = tokio::io::duplex(256 * 1024);

    let a_builder = ChannelBuilder::new().name("writer").mode(Mode::Negotiate).pipe_window_size(window);
    let b_builder = ChannelBuilder::new().name("reader").mode(Mode::Negotiate).pipe_window_size(window);

    let a_dispatcher: Arc<dyn Dispatcher> = Arc::new(Unimplemented);
    let b_dispatcher: Arc<dyn Dispatcher> = Arc::new(Unimplemented);

    let a_fut = Channel::build(a_io, a_builder, a_dispatcher);
    let b_fut = Channel::build(b_io, b_builder, b_dispatcher);

    let ((a, _a_handle), (b, _b_handle)) = tokio::join!(a_fut, b_fut);
    (a.unwrap().0, b.unwrap().0)
}

fn sample_payload() -> Payload {
    proptest::test_runner::TestRunner::default()
        .new_tree(&large_payload())
        .expect("generate payload")
        .current()
}

#[tokio::test]
async fn large_write_is_throttled_and_arrives_in_order() {
    const WINDOW: u32 = 128 * 1024;

    let (writer, reader) = build_pair(WINDOW).await;
    let oid = writer.export(Bytes::new());

    // Both sides track the same oid by convention here; a real embedder
    // would learn the oid from a prior call's result instead.
    let _writer_events = writer.open_pipe(oid);
    let mut reader_events = reader.open_pipe(oid);

    let full = Bytes::from(sample_payload());
    assert!(full.len() > WINDOW as usize, "payload should span multiple window credits");

    let expected = full.clone();
    let write_task = tokio::spawn({
        let writer = writer.clone();
        async move {
            let chunk_len = (WINDOW / 2) as usize;
            let mut remaining = full;
            while !remaining.is_empty() {
                let take = remaining.len().min(chunk_len);
                let chunk = remaining.split_to(take);
                writer.write_pipe_chunk(oid, chunk).await.unwrap();
            }
            writer.close_pipe(oid).unwrap();
        }
    });

    let mut received = Vec::with_capacity(expected.len());
    loop {
        match tokio::time::timeout(Duration::from_secs(5), reader_events.recv())
            .await
            .expect("reader should not stall")
        {
            Some(PipeEvent::Chunk(chunk)) => {
                received.extend_from_slice(&chunk);
                // Credit the window back immediately, like a reader draining
                // its buffer as fast as it arrives.
                reader.ack_pipe(oid, chunk.len() as u32).unwrap();
            }
            Some(PipeEvent::Eof) => break,
            Some(other) => panic!("unexpected pipe event: {other:?}"),
            None => panic!("pipe event stream ended before EOF"),
        }
    }

    write_task.await.unwrap();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn single_write_pipe_call_auto_chunks_against_the_window() {
    const WINDOW: u32 = 128 * 1024;

    let (writer, reader) = build_pair(WINDOW).await;
    let oid = writer.export(Bytes::new());
    let _writer_events = writer.open_pipe(oid);
    let mut reader_events = reader.open_pipe(oid);

    let full = Bytes::from(sample_payload());
    assert!(full.len() > WINDOW as usize, "payload should span multiple window credits");
    let expected = full.clone();

    let write_task = tokio::spawn({
        let writer = writer.clone();
        async move {
            writer.write_pipe(oid, full).await.unwrap();
            writer.close_pipe(oid).unwrap();
        }
    });

    let mut received = Vec::with_capacity(expected.len());
    loop {
        match tokio::time::timeout(Duration::from_secs(5), reader_events.recv())
            .await
            .expect("reader should not stall")
        {
            Some(PipeEvent::Chunk(chunk)) => {
                assert!(chunk.len() as u32 <= WINDOW / 2, "each chunk must respect the half-window cap");
                received.extend_from_slice(&chunk);
                reader.ack_pipe(oid, chunk.len() as u32).unwrap();
            }
            Some(PipeEvent::Eof) => break,
            Some(other) => panic!("unexpected pipe event: {other:?}"),
            None => panic!("pipe event stream ended before EOF"),
        }
    }

    write_task.await.unwrap();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn writer_blocks_until_window_is_credited_back() {
    const WINDOW: u32 = 4096;

    let (writer, reader) = build_pair(WINDOW).await;
    let oid = writer.export(Bytes::new());
    let _writer_events = writer.open_pipe(oid);
    let mut reader_events = reader.open_pipe(oid);

    // First chunk exactly exhausts the window; this must go through without
    // blocking.
    writer
        .write_pipe_chunk(oid, Bytes::from(vec![1u8; WINDOW as usize]))
        .await
        .unwrap();

    // A second chunk has nothing left to spend and must block until credited.
    let blocked = tokio::spawn({
        let writer = writer.clone();
        async move { writer.write_pipe_chunk(oid, Bytes::from(vec![2u8; 10])).await }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished(), "writer should still be blocked on an empty window");

    let first = match reader_events.recv().await.unwrap() {
        PipeEvent::Chunk(chunk) => chunk,
        other => panic!("expected a chunk, got {other:?}"),
    };
    reader.ack_pipe(oid, first.len() as u32).unwrap();

    blocked.await.unwrap().unwrap();
}
