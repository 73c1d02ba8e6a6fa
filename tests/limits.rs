mod common;

use std::time::Duration;
use tokio::{io::AsyncWriteExt, time::sleep};

use castproxy::config::Limits;
use common::SinkCall;

fn small_queue_limits() -> Limits {
    Limits {
        queue_limit: 2,
        ..Limits::default()
    }
}

#[tokio::test]
async fn full_standby_queue_rejects_admission() {
    let rig = common::spawn_engine_with(small_queue_limits());

    let _live = common::admit(&rig.senders, common::client_id("dj", "/main", "10.0.0.1:4000")).await;
    let _q1   = common::admit(&rig.senders, common::client_id("q1", "/main", "10.0.0.2:4000")).await;
    let _q2   = common::admit(&rig.senders, common::client_id("q2", "/main", "10.0.0.3:4000")).await;
    let mut rejected = common::admit(&rig.senders, common::client_id("q3", "/main", "10.0.0.4:4000")).await;

    sleep(Duration::from_millis(300)).await;

    let events = rig.events();
    assert!(events.contains(&"connect:q1".to_owned()));
    assert!(events.contains(&"connect:q2".to_owned()));
    // The overflowing client never connected, it only disconnected
    assert!(!events.contains(&"connect:q3".to_owned()));
    assert!(events.contains(&"disconnect:q3".to_owned()));

    // And its socket is gone
    let mut gone = false;
    for _ in 0..10 {
        if rejected.write_all(&[b'A'; 64]).await.is_err() {
            gone = true;
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    assert!(gone, "rejected client must be hung up on");
}

#[tokio::test]
async fn promotion_skips_standbys_that_left() {
    let rig = common::spawn_engine();

    let live = common::admit(&rig.senders, common::client_id("dj", "/main", "10.0.0.1:4000")).await;
    let q1   = common::admit(&rig.senders, common::client_id("q1", "/main", "10.0.0.2:4000")).await;
    let _q2  = common::admit(&rig.senders, common::client_id("q2", "/main", "10.0.0.3:4000")).await;

    sleep(Duration::from_millis(200)).await;

    // First standby leaves before its turn comes
    drop(q1);
    sleep(Duration::from_millis(200)).await;
    assert!(rig.events().contains(&"disconnect:q1".to_owned()));

    drop(live);
    sleep(Duration::from_millis(300)).await;

    let events = rig.events();
    assert!(events.contains(&"live:q2".to_owned()));
    assert!(!events.contains(&"live:q1".to_owned()));
}

#[tokio::test]
async fn empty_mount_is_collected_after_the_grace_window() {
    let rig = common::spawn_engine();

    let s1 = common::admit(&rig.senders, common::client_id("dj", "/main", "10.0.0.1:4000")).await;
    sleep(Duration::from_millis(200)).await;
    drop(s1);

    // Inside the window the upstream connection stays around
    sleep(Duration::from_millis(2000)).await;
    assert!(!rig.calls().contains(&SinkCall::Close));

    sleep(Duration::from_millis(4500)).await;
    assert!(rig.calls().contains(&SinkCall::Close));

    // A returning source gets a brand new mount
    let _s2 = common::admit(&rig.senders, common::client_id("dj", "/main", "10.0.0.1:5000")).await;
    sleep(Duration::from_millis(200)).await;

    let options = rig.calls()
        .iter()
        .filter(|call| matches!(call, SinkCall::Options(..)))
        .count();
    assert_eq!(options, 2);
}

#[tokio::test]
async fn overlapping_handover_keeps_the_mount_alive() {
    let rig = common::spawn_engine();

    let s1 = common::admit(&rig.senders, common::client_id("dj", "/main", "10.0.0.1:4000")).await;
    sleep(Duration::from_millis(200)).await;
    drop(s1);

    // The replacement connects inside the grace window
    sleep(Duration::from_millis(1000)).await;
    let mut s2 = common::admit(&rig.senders, common::client_id("dj2", "/main", "10.0.0.2:4000")).await;

    sleep(Duration::from_millis(300)).await;
    assert!(rig.events().contains(&"live:dj2".to_owned()));

    // Outlive the scheduled collection, which must abort
    sleep(Duration::from_millis(5000)).await;

    s2.write_all(&[b'D'; 256]).await.unwrap();
    s2.flush().await.unwrap();
    sleep(Duration::from_millis(300)).await;

    assert_eq!(rig.bytes_sent(), 256);
    let options = rig.calls()
        .iter()
        .filter(|call| matches!(call, SinkCall::Options(..)))
        .count();
    assert_eq!(options, 1, "the mount must survive the aborted collection");
}
