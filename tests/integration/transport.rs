//! Multiplexed transport scenarios: framing, large frames, backpressure,
//! and fatal-error stream draining.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use veld_core::wire::{decode_frames, ControlOp, StreamId};
use veld_core::{Chunk, Error};
use veld_transport::pipe::boxed;
use veld_transport::{
    reject_inbound, AcceptFn, ConnState, ConnectionOptions, MultiplexedConnection, ReadMode,
    ReceiverFn, StreamEvent,
};

use crate::init_tracing;

fn channel_receiver() -> (ReceiverFn, mpsc::UnboundedReceiver<StreamEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let receiver: ReceiverFn = Box::new(move |event| {
        let _ = tx.send(event);
    });
    (receiver, rx)
}

/// Accept every inbound stream, handing each a channel receiver.
fn accept_all() -> (AcceptFn, mpsc::UnboundedReceiver<(StreamId, mpsc::UnboundedReceiver<StreamEvent>)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let accept: AcceptFn = Box::new(move |sid| {
        let (receiver, events) = channel_receiver();
        let _ = tx.send((sid, events));
        Some(receiver)
    });
    (accept, rx)
}

fn quiet_options() -> ConnectionOptions {
    ConnectionOptions {
        ping_interval: None,
        ..ConnectionOptions::default()
    }
}

/// A connected initiator/acceptor pair over one in-memory pipe.
async fn connected_pair(
    buffer: usize,
    initiator_options: ConnectionOptions,
    acceptor_options: ConnectionOptions,
) -> (
    MultiplexedConnection,
    MultiplexedConnection,
    mpsc::UnboundedReceiver<(StreamId, mpsc::UnboundedReceiver<StreamEvent>)>,
) {
    let (a, b) = tokio::io::duplex(buffer);
    let initiator =
        MultiplexedConnection::initiate(vec![boxed(a)], reject_inbound(), initiator_options);
    let (accept, inbound) = accept_all();
    let acceptor = MultiplexedConnection::accept(vec![boxed(b)], accept, acceptor_options);
    initiator.established().await.unwrap();
    acceptor.established().await.unwrap();
    (initiator, acceptor, inbound)
}

async fn expect_data(events: &mut mpsc::UnboundedReceiver<StreamEvent>) -> Chunk {
    match tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for stream event")
        .expect("stream event channel closed")
    {
        StreamEvent::Data(chunk) => chunk,
        other => panic!("expected data, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn handshake_establishes_both_sides() {
    init_tracing();
    let (initiator, acceptor, _inbound) =
        connected_pair(16 * 1024, quiet_options(), quiet_options()).await;
    assert_eq!(initiator.state(), ConnState::Established);
    assert_eq!(acceptor.state(), ConnState::Established);
}

#[tokio::test(flavor = "multi_thread")]
async fn coalesced_small_frames_arrive_separately_in_order() {
    // Three frames of 10/20/30 bytes sent back to back; however they
    // share segments on the wire, the receiver sees three chunks of the
    // original sizes, in order, on the right stream.
    init_tracing();
    let (initiator, _acceptor, mut inbound) =
        connected_pair(16 * 1024, quiet_options(), quiet_options()).await;

    let (receiver, _events) = channel_receiver();
    let stream = initiator.open(receiver).unwrap();
    stream.send(Chunk::from_vec(vec![0xaa; 10])).unwrap();
    stream.send(Chunk::from_vec(vec![0xbb; 20])).unwrap();
    stream.send(Chunk::from_vec(vec![0xcc; 30])).unwrap();

    let (sid, mut events) = inbound.recv().await.unwrap();
    assert_eq!(sid, stream.id());
    let first = expect_data(&mut events).await;
    let second = expect_data(&mut events).await;
    let third = expect_data(&mut events).await;
    assert_eq!(
        (first.len(), second.len(), third.len()),
        (10, 20, 30)
    );
    assert_eq!(first.as_ref(), &[0xaa; 10][..]);
    assert_eq!(second.as_ref(), &[0xbb; 20][..]);
    assert_eq!(third.as_ref(), &[0xcc; 30][..]);
}

#[tokio::test(flavor = "multi_thread")]
async fn large_frame_crosses_segments_as_one_chunk() {
    // A 4096-byte payload over a 512-byte pipe buffer arrives in many
    // reads; exactly one chunk comes out, and the read buffer's switch
    // into and out of large-chunk mode is visible through the hook.
    init_tracing();
    let modes: Arc<Mutex<Vec<ReadMode>>> = Arc::default();
    let hook: veld_transport::ModeHook = {
        let modes = Arc::clone(&modes);
        Box::new(move |mode| modes.lock().unwrap().push(mode))
    };
    let acceptor_options = ConnectionOptions {
        read_mode_hook: Some(hook),
        ..quiet_options()
    };
    let (initiator, _acceptor, mut inbound) =
        connected_pair(512, quiet_options(), acceptor_options).await;

    let payload: Vec<u8> = (0..4096u32).map(|i| (i % 255) as u8).collect();
    let (receiver, _events) = channel_receiver();
    let stream = initiator.open(receiver).unwrap();
    stream.send(Chunk::from_vec(payload.clone())).unwrap();

    let (_, mut events) = inbound.recv().await.unwrap();
    let chunk = expect_data(&mut events).await;
    assert_eq!(chunk.len(), 4096);
    assert_eq!(chunk.as_ref(), &payload[..]);

    let seen = modes.lock().unwrap().clone();
    assert_eq!(
        seen,
        [ReadMode::LargeChunk, ReadMode::Scratch],
        "one transition into large-chunk mode and one back"
    );

    // nothing further pending
    assert!(events.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn stream_close_reaches_the_peer() {
    init_tracing();
    let (initiator, _acceptor, mut inbound) =
        connected_pair(16 * 1024, quiet_options(), quiet_options()).await;

    let (receiver, _events) = channel_receiver();
    let stream = initiator.open(receiver).unwrap();
    stream.send(Chunk::from_static(b"before close")).unwrap();
    stream.close().unwrap();
    assert!(matches!(
        stream.send(Chunk::from_static(b"after close")),
        Err(Error::StreamClosed)
    ));

    let (_, mut events) = inbound.recv().await.unwrap();
    let data = expect_data(&mut events).await;
    assert_eq!(data.as_ref(), b"before close");
    match tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap()
    {
        StreamEvent::RemoteClosed => {}
        other => panic!("expected remote close, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn backpressure_rejects_past_the_high_water_mark() {
    // The peer end is a raw pipe we control, so nothing drains until the
    // test reads. Once queued bytes cross the mark, send returns
    // WouldBlock; draining the pipe lets a retry through.
    init_tracing();
    let (a, mut b) = tokio::io::duplex(256);
    let options = ConnectionOptions {
        high_water_mark: 2048,
        ..quiet_options()
    };
    let connection = MultiplexedConnection::accept(vec![boxed(a)], reject_inbound(), options);

    // drive the handshake by hand: send a ping, absorb the pong
    b.write_all(&ControlOp::Ping(7).to_frame()).await.unwrap();
    connection.established().await.unwrap();

    let (receiver, _events) = channel_receiver();
    let stream = connection.open(receiver).unwrap();

    let mut accepted = 0usize;
    let blocked = loop {
        match stream.send(Chunk::from_vec(vec![0x55; 128])) {
            Ok(()) => accepted += 1,
            Err(Error::WouldBlock) => break accepted,
            Err(other) => panic!("unexpected send error: {other}"),
        }
        assert!(accepted < 1000, "high-water mark never engaged");
    };
    assert!(blocked > 0, "some sends must fit under the mark");

    // drain the pipe; the writer flushes and capacity returns
    let mut sink = vec![0u8; 64 * 1024];
    let mut retried = false;
    for _ in 0..100 {
        let _ = tokio::time::timeout(Duration::from_millis(20), b.read(&mut sink)).await;
        if stream.send(Chunk::from_vec(vec![0x55; 128])).is_ok() {
            retried = true;
            break;
        }
    }
    assert!(retried, "send must succeed after the queue drains");
}

#[tokio::test(flavor = "multi_thread")]
async fn fatal_error_drains_streams_in_ascending_order() {
    // Three open streams; the only pipe dies. Every receiver hears
    // Disconnected exactly once, in ascending StreamId order, the
    // connection is Closed, and further sends fail.
    init_tracing();
    let (a, mut b) = tokio::io::duplex(16 * 1024);
    let connection =
        MultiplexedConnection::initiate(vec![boxed(a)], reject_inbound(), quiet_options());

    // answer the handshake ping by hand
    let mut buf = vec![0u8; 1024];
    let n = b.read(&mut buf).await.unwrap();
    let (frames, _) = decode_frames(&buf[..n]).unwrap();
    let ControlOp::Ping(nonce) = ControlOp::decode(&frames[0].1).unwrap() else {
        panic!("expected the handshake ping first");
    };
    b.write_all(&ControlOp::Pong(nonce).to_frame()).await.unwrap();
    connection.established().await.unwrap();

    let order: Arc<Mutex<Vec<u64>>> = Arc::default();
    let mut streams = Vec::new();
    for _ in 0..3 {
        let stream = connection.open(Box::new(|_| {})).unwrap();
        let order = Arc::clone(&order);
        let id = stream.id().0;
        stream.set_receiver(Box::new(move |event| {
            if matches!(event, StreamEvent::Disconnected) {
                order.lock().unwrap().push(id);
            }
        }));
        streams.push(stream);
    }
    assert_eq!(connection.stream_count(), 3);

    drop(b); // the transport dies

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if connection.state() == ConnState::Closed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("connection must reach Closed");

    let seen = order.lock().unwrap().clone();
    assert_eq!(seen, [1, 3, 5], "ascending stream id order, exactly once each");
    assert!(matches!(
        streams[0].send(Chunk::from_static(b"too late")),
        Err(Error::StreamClosed)
    ));
    assert!(matches!(
        connection.open(Box::new(|_| {})),
        Err(Error::StreamClosed)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_inbound_stream_gets_closed() {
    init_tracing();
    let (a, b) = tokio::io::duplex(16 * 1024);
    // the acceptor rejects everything
    let initiator =
        MultiplexedConnection::initiate(vec![boxed(a)], reject_inbound(), quiet_options());
    let acceptor =
        MultiplexedConnection::accept(vec![boxed(b)], reject_inbound(), quiet_options());
    initiator.established().await.unwrap();
    acceptor.established().await.unwrap();

    let (receiver, mut events) = channel_receiver();
    let stream = initiator.open(receiver).unwrap();
    stream.send(Chunk::from_static(b"anyone there?")).unwrap();

    match tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap()
    {
        StreamEvent::RemoteClosed => {}
        other => panic!("expected the rejection close, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn graceful_close_drains_to_closed() {
    init_tracing();
    let (initiator, acceptor, _inbound) =
        connected_pair(16 * 1024, quiet_options(), quiet_options()).await;

    initiator.close();
    assert!(matches!(
        initiator.open(Box::new(|_| {})),
        Err(Error::StreamClosed)
    ));
    // no streams were open, so the drain finishes immediately
    assert_eq!(initiator.state(), ConnState::Closed);

    // the peer sees the goaway and closes too
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if acceptor.state() == ConnState::Closed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("peer must observe the goaway");
}
