mod common;

use std::{sync::Arc, time::Duration};
use tokio::{io::AsyncWriteExt, time::sleep};

use castproxy::{
    client::AudioFormat,
    config::Limits,
    icecast::SinkError,
    supervisor
};
use common::SinkCall;

#[tokio::test]
async fn solo_source_forwards_audio() {
    let rig    = common::spawn_engine();
    let mut s1 = common::admit(&rig.senders, common::client_id("dj", "/main", "10.0.0.1:4000")).await;

    sleep(Duration::from_millis(200)).await;

    let events = rig.events();
    assert!(events.contains(&"connect:dj".to_owned()));
    assert!(events.contains(&"live:dj".to_owned()));
    assert_eq!(rig.calls().first(), Some(&SinkCall::Options("/main".to_owned(), AudioFormat::Mp3)));

    s1.write_all(&[b'A'; 4096]).await.unwrap();
    s1.flush().await.unwrap();

    sleep(Duration::from_millis(300)).await;

    let calls = rig.calls();
    assert!(calls.contains(&SinkCall::Open));
    assert_eq!(rig.bytes_sent(), 4096);
    let sent = calls
        .iter()
        .find_map(|call| match call {
            SinkCall::Send(data) => Some(data.clone()),
            _ => None
        })
        .expect("audio must reach the sink");
    assert!(sent.iter().all(|byte| *byte == b'A'));
}

#[tokio::test]
async fn standby_takes_over_on_live_source_loss() {
    let rig    = common::spawn_engine();
    let s1     = common::admit(&rig.senders, common::client_id("dj", "/main", "10.0.0.1:4000")).await;
    let mut s2 = common::admit(&rig.senders, common::client_id("dj2", "/main", "10.0.0.2:4000")).await;

    sleep(Duration::from_millis(200)).await;

    // The second client is standby only
    let events = rig.events();
    assert!(events.contains(&"connect:dj2".to_owned()));
    assert!(!events.contains(&"live:dj2".to_owned()));

    // Standby audio never reaches the sink
    s2.write_all(&[b'B'; 1024]).await.unwrap();
    s2.flush().await.unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(rig.bytes_sent(), 0);

    drop(s1);
    sleep(Duration::from_millis(300)).await;

    let events  = rig.events();
    let unlive  = events.iter().position(|e| e.eq("unlive:dj")).expect("old live must unlive");
    let live    = events.iter().position(|e| e.eq("live:dj2")).expect("standby must go live");
    let dropped = events.iter().position(|e| e.eq("disconnect:dj")).expect("old live must disconnect");
    assert!(unlive < live);
    assert!(live < dropped);

    s2.write_all(&[b'C'; 512]).await.unwrap();
    s2.flush().await.unwrap();
    sleep(Duration::from_millis(300)).await;

    assert_eq!(rig.bytes_sent(), 512);
}

#[tokio::test]
async fn transport_error_drops_packet_and_reconnects() {
    let rig    = common::spawn_engine();
    let mut s1 = common::admit(&rig.senders, common::client_id("dj", "/main", "10.0.0.1:4000")).await;

    sleep(Duration::from_millis(100)).await;

    s1.write_all(&[b'A'; 128]).await.unwrap();
    s1.flush().await.unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(rig.bytes_sent(), 128);

    rig.fail_next_send(SinkError::Transport(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "upstream went away"
    )));

    s1.write_all(&[b'B'; 128]).await.unwrap();
    s1.flush().await.unwrap();
    sleep(Duration::from_millis(200)).await;

    // Packet was ditched and the sink closed
    assert_eq!(rig.bytes_sent(), 128);
    assert!(rig.calls().contains(&SinkCall::Close));

    s1.write_all(&[b'C'; 128]).await.unwrap();
    s1.flush().await.unwrap();
    sleep(Duration::from_millis(200)).await;

    // The next packet reopened the connection and went through
    let calls = rig.calls();
    let close = calls.iter().position(|call| matches!(call, SinkCall::Close)).unwrap();
    let open  = calls.iter().rposition(|call| matches!(call, SinkCall::Open)).unwrap();
    assert!(open > close);
    assert_eq!(rig.bytes_sent(), 256);
}

#[tokio::test]
async fn fatal_sink_error_kills_the_engine() {
    let rig    = common::spawn_engine();
    let mut s1 = common::admit(&rig.senders, common::client_id("dj", "/main", "10.0.0.1:4000")).await;

    sleep(Duration::from_millis(100)).await;

    rig.fail_next_send(SinkError::Insane);
    s1.write_all(&[b'A'; 64]).await.unwrap();
    s1.flush().await.unwrap();

    let ret = rig.engine.await;
    assert!(ret.expect_err("engine must die on a fatal sink error").is_panic());
}

#[tokio::test]
async fn supervisor_replaces_a_dead_engine() {
    let sink    = Arc::new(std::sync::Mutex::new(common::SinkState::default()));
    let handler = Arc::new(common::RecordingHandler::default());
    let handle  = supervisor::start(
        Limits::default(),
        Arc::new(common::MockSinkFactory { state: sink.clone() }),
        handler.clone()
    );

    let senders = handle.senders().await;
    let mut s1  = common::admit(&senders, common::client_id("dj", "/main", "10.0.0.1:4000")).await;
    sleep(Duration::from_millis(100)).await;

    sink.lock().unwrap().fail_send.push_back(SinkError::OutOfMemory);
    s1.write_all(&[b'A'; 64]).await.unwrap();
    s1.flush().await.unwrap();

    // Give the supervisor room to notice and restart
    sleep(Duration::from_millis(500)).await;

    // The old source socket died with the old engine
    let mut gone = false;
    for _ in 0..10 {
        if s1.write_all(&[b'A'; 64]).await.is_err() {
            gone = true;
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    assert!(gone, "sockets of the old engine must close");

    // And the fresh engine accepts work again
    let senders = handle.senders().await;
    let mut s2  = common::admit(&senders, common::client_id("dj2", "/other", "10.0.0.2:4000")).await;
    sleep(Duration::from_millis(200)).await;

    s2.write_all(&[b'B'; 32]).await.unwrap();
    s2.flush().await.unwrap();
    sleep(Duration::from_millis(200)).await;

    let calls = sink.lock().unwrap().calls.clone();
    assert!(calls.contains(&SinkCall::Options("/other".to_owned(), AudioFormat::Mp3)));
    assert!(calls.iter().any(|call| matches!(call, SinkCall::Send(data) if data.len() == 32)));

    let events = handler.events();
    assert!(events.contains(&"live:dj2".to_owned()));
}
