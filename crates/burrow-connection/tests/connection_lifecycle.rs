//! End-to-end tests of the frame loop over in-memory sockets

use burrow_connection::{ConnectionManager, StreamState};
use burrow_proto::{read_frame, write_frame, Frame, FrameFlags, FrameType};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::time::{sleep, timeout};

fn manager(heartbeat: Duration) -> Arc<ConnectionManager> {
    Arc::new(ConnectionManager::new(16, heartbeat))
}

/// Registers a connection over a duplex pipe and returns the agent end
fn connect(manager: &Arc<ConnectionManager>, id: &str, agent: &str) -> DuplexStream {
    let (agent_end, server_end) = tokio::io::duplex(16 * 1024);
    manager
        .register_connection(id, agent, HashMap::new(), server_end)
        .unwrap();
    agent_end
}

#[tokio::test]
async fn heartbeat_timeout_closes_connection_once() {
    let manager = manager(Duration::from_millis(200));

    let closed = Arc::new(AtomicUsize::new(0));
    let counter = closed.clone();
    manager.set_on_connection_closed(Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let _agent = connect(&manager, "conn-1", "agent-1");
    assert_eq!(manager.connection_count(), 1);

    // no frames for longer than the heartbeat timeout
    sleep(Duration::from_millis(400)).await;

    assert_eq!(manager.connection_count(), 0);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn heartbeats_keep_connection_alive() {
    let manager = manager(Duration::from_millis(200));
    let mut agent = connect(&manager, "conn-1", "agent-1");

    for _ in 0..8 {
        write_frame(&mut agent, &Frame::heartbeat()).await.unwrap();
        sleep(Duration::from_millis(80)).await;
    }

    // well past several heartbeat windows, the connection is still up
    assert_eq!(manager.connection_count(), 1);
}

#[tokio::test]
async fn agent_close_frame_terminates_connection() {
    let manager = manager(Duration::from_secs(5));

    let closed = Arc::new(AtomicUsize::new(0));
    let counter = closed.clone();
    manager.set_on_connection_closed(Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let mut agent = connect(&manager, "conn-1", "agent-1");
    write_frame(&mut agent, &Frame::control(FrameType::Close, Bytes::new()))
        .await
        .unwrap();

    sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.connection_count(), 0);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stream_data_path_delivers_in_order_then_closes() {
    let manager = manager(Duration::from_secs(5));

    let created = Arc::new(AtomicUsize::new(0));
    let stream_closed = Arc::new(AtomicUsize::new(0));
    let created_counter = created.clone();
    let closed_counter = stream_closed.clone();
    manager.set_on_stream_created(Arc::new(move |_, _| {
        created_counter.fetch_add(1, Ordering::SeqCst);
    }));
    manager.set_on_stream_closed(Arc::new(move |_, _| {
        closed_counter.fetch_add(1, Ordering::SeqCst);
    }));

    let mut agent = connect(&manager, "conn-1", "agent-1");
    let conn = manager.get_connection("conn-1").unwrap();

    write_frame(&mut agent, &Frame::open_stream(7, Bytes::new()))
        .await
        .unwrap();

    // wait for the dispatch loop to create the stream
    let stream = {
        let mut found = None;
        for _ in 0..50 {
            if let Some(stream) = conn.get_stream(7) {
                found = Some(stream);
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        found.expect("stream 7 was never created")
    };
    assert_eq!(created.load(Ordering::SeqCst), 1);

    let mut rx = stream.take_reader().unwrap();
    let close_signal = stream.close_signal();

    write_frame(&mut agent, &Frame::data(7, Bytes::from_static(b"ab")))
        .await
        .unwrap();
    write_frame(&mut agent, &Frame::data(7, Bytes::from_static(b"cd")))
        .await
        .unwrap();
    write_frame(
        &mut agent,
        &Frame::data(7, Bytes::new()).with_flags(FrameFlags::new().with_end_stream()),
    )
    .await
    .unwrap();

    assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"ab"));
    assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"cd"));

    timeout(Duration::from_secs(1), close_signal.cancelled())
        .await
        .expect("close signal never fired");

    assert!(conn.get_stream(7).is_none());
    assert_eq!(stream.state(), StreamState::Closed);
    assert_eq!(stream_closed.load(Ordering::SeqCst), 1);

    // the connection itself survives the stream teardown
    assert_eq!(manager.connection_count(), 1);
}

#[tokio::test]
async fn duplicate_open_stream_is_fatal_for_connection() {
    let manager = manager(Duration::from_secs(5));
    let mut agent = connect(&manager, "conn-1", "agent-1");

    write_frame(&mut agent, &Frame::open_stream(3, Bytes::new()))
        .await
        .unwrap();
    write_frame(&mut agent, &Frame::open_stream(3, Bytes::new()))
        .await
        .unwrap();

    sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.connection_count(), 0);
}

#[tokio::test]
async fn data_for_unknown_stream_is_tolerated() {
    let manager = manager(Duration::from_secs(5));
    let mut agent = connect(&manager, "conn-1", "agent-1");

    write_frame(&mut agent, &Frame::data(9, Bytes::from_static(b"stray")))
        .await
        .unwrap();

    sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.connection_count(), 1);

    // and the connection still processes later frames
    write_frame(&mut agent, &Frame::open_stream(1, Bytes::new()))
        .await
        .unwrap();
    sleep(Duration::from_millis(50)).await;
    assert!(manager.get_connection("conn-1").unwrap().get_stream(1).is_some());
}

#[tokio::test]
async fn close_stream_frame_removes_stream() {
    let manager = manager(Duration::from_secs(5));
    let mut agent = connect(&manager, "conn-1", "agent-1");
    let conn = manager.get_connection("conn-1").unwrap();

    write_frame(&mut agent, &Frame::open_stream(4, Bytes::new()))
        .await
        .unwrap();
    sleep(Duration::from_millis(50)).await;
    assert!(conn.get_stream(4).is_some());

    write_frame(&mut agent, &Frame::close(4)).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    assert!(conn.get_stream(4).is_none());

    // closing an already-absent stream is ignored
    write_frame(&mut agent, &Frame::close(4)).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.connection_count(), 1);
}

#[tokio::test]
async fn outbound_frames_reach_the_agent_in_order() {
    let manager = manager(Duration::from_secs(5));
    let mut agent = connect(&manager, "conn-1", "agent-1");
    let conn = manager.get_connection("conn-1").unwrap();

    let stream = conn.open_stream().unwrap();
    conn.send_frame(&Frame::open_stream(stream.id(), Bytes::from_static(b"req")))
        .await
        .unwrap();
    conn.send_frame(&Frame::data(stream.id(), Bytes::from_static(b"body")))
        .await
        .unwrap();

    let first = read_frame(&mut agent).await.unwrap();
    assert_eq!(first.frame_type, FrameType::OpenStream);
    assert_eq!(first.payload, Bytes::from_static(b"req"));

    let second = read_frame(&mut agent).await.unwrap();
    assert_eq!(second.frame_type, FrameType::Data);
    assert_eq!(second.payload, Bytes::from_static(b"body"));
}

#[tokio::test]
async fn register_rejects_duplicates_and_overflow() {
    let manager = Arc::new(ConnectionManager::new(1, Duration::from_secs(5)));

    let (_a, server_a) = tokio::io::duplex(1024);
    manager
        .register_connection("conn-1", "agent-1", HashMap::new(), server_a)
        .unwrap();

    let (_b, server_b) = tokio::io::duplex(1024);
    let err = manager
        .register_connection("conn-2", "agent-2", HashMap::new(), server_b)
        .unwrap_err();
    assert!(matches!(err, burrow_connection::ConnectionError::MaxConnections));

    let manager = Arc::new(ConnectionManager::new(4, Duration::from_secs(5)));
    let (_c, server_c) = tokio::io::duplex(1024);
    manager
        .register_connection("conn-1", "agent-1", HashMap::new(), server_c)
        .unwrap();
    let (_d, server_d) = tokio::io::duplex(1024);
    let err = manager
        .register_connection("conn-1", "agent-1", HashMap::new(), server_d)
        .unwrap_err();
    assert!(matches!(err, burrow_connection::ConnectionError::ConnectionExists));
}

#[tokio::test]
async fn connection_close_closes_live_streams_with_callbacks() {
    let manager = manager(Duration::from_secs(5));

    let stream_closed = Arc::new(AtomicUsize::new(0));
    let counter = stream_closed.clone();
    manager.set_on_stream_closed(Arc::new(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let mut agent = connect(&manager, "conn-1", "agent-1");
    let conn = manager.get_connection("conn-1").unwrap();

    write_frame(&mut agent, &Frame::open_stream(1, Bytes::new()))
        .await
        .unwrap();
    write_frame(&mut agent, &Frame::open_stream(2, Bytes::new()))
        .await
        .unwrap();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(conn.stream_count(), 2);

    let signal = conn.get_stream(1).unwrap().close_signal();
    manager.close_connection("conn-1").await.unwrap();

    assert!(signal.is_cancelled());
    assert_eq!(stream_closed.load(Ordering::SeqCst), 2);
    assert!(manager.get_connection("conn-1").is_none());

    // repeated close is not-found, with no second round of callbacks
    assert!(manager.close_connection("conn-1").await.is_err());
    assert_eq!(stream_closed.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn drain_waits_for_all_frame_loops() {
    let manager = manager(Duration::from_secs(5));

    let closed = Arc::new(AtomicUsize::new(0));
    let counter = closed.clone();
    manager.set_on_connection_closed(Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let _a = connect(&manager, "conn-1", "agent-1");
    let _b = connect(&manager, "conn-2", "agent-2");
    assert_eq!(manager.connection_count(), 2);

    timeout(Duration::from_secs(2), manager.drain())
        .await
        .expect("drain did not finish");

    assert_eq!(manager.connection_count(), 0);
    assert_eq!(closed.load(Ordering::SeqCst), 2);
}
