mod common;

use std::time::{Duration, Instant};
use tokio::time::sleep;

#[test]
fn fingerprint_survives_reconnects() {
    let id = common::client_id("dj", "/main", "10.0.0.1:4000");

    // Same client on a new port with a new player
    let mut reconnect   = common::client_id("dj", "/main", "10.0.0.1:51312");
    reconnect.agent     = Some("other-player".to_owned());
    assert_eq!(id.fingerprint(), reconnect.fingerprint());

    let other_user = common::client_id("dj2", "/main", "10.0.0.1:4000");
    assert_ne!(id.fingerprint(), other_user.fingerprint());

    let other_mount = common::client_id("dj", "/other", "10.0.0.1:4000");
    assert_ne!(id.fingerprint(), other_mount.fingerprint());

    let other_ip = common::client_id("dj", "/main", "10.0.0.9:4000");
    assert_ne!(id.fingerprint(), other_ip.fingerprint());
}

#[tokio::test]
async fn live_metadata_settles_before_delivery() {
    let rig = common::spawn_engine();
    let _s1 = common::admit(&rig.senders, common::client_id("dj", "/main", "10.0.0.1:4000")).await;

    sleep(Duration::from_millis(100)).await;

    // Metadata arrives on its own connection: same identity, new port
    let pack = common::meta_pack(&common::client_id("dj", "/main", "10.0.0.1:9999"), "Song A");
    let sent = Instant::now();
    rig.senders.meta.send(pack).await.unwrap();

    sleep(Duration::from_millis(200)).await;

    // The handler hears about it right away, the upstream does not
    assert!(rig.events().contains(&"metadata:dj:Song A".to_owned()));
    assert!(rig.metadata_sent().is_empty());

    let mut delivered = None;
    for _ in 0..30 {
        sleep(Duration::from_millis(100)).await;
        if rig.metadata_sent().contains(&"Song A".to_owned()) {
            delivered = Some(sent.elapsed());
            break;
        }
    }

    let delivered = delivered.expect("metadata must reach the upstream");
    assert!(delivered >= Duration::from_secs(1), "settle delay was {:?}", delivered);
}

#[tokio::test]
async fn early_metadata_waits_in_the_stash() {
    let rig = common::spawn_engine();

    let pack = common::meta_pack(&common::client_id("dj", "/early", "10.0.0.3:8888"), "Song A");
    rig.senders.meta.send(pack).await.unwrap();

    sleep(Duration::from_millis(200)).await;
    let _s1 = common::admit(&rig.senders, common::client_id("dj", "/early", "10.0.0.3:4000")).await;

    // Not yet: the replayed pack still sits in its settle window
    sleep(Duration::from_millis(500)).await;
    assert!(rig.metadata_sent().is_empty());

    sleep(Duration::from_millis(900)).await;
    assert_eq!(rig.metadata_sent(), vec!["Song A".to_owned()]);
}

#[tokio::test]
async fn early_metadata_expires_with_the_stash() {
    let rig = common::spawn_engine();

    let pack = common::meta_pack(&common::client_id("dj", "/early", "10.0.0.3:8888"), "Song A");
    rig.senders.meta.send(pack).await.unwrap();

    // Outlive the stash reset cadence before connecting
    sleep(Duration::from_millis(6000)).await;
    let _s1 = common::admit(&rig.senders, common::client_id("dj", "/early", "10.0.0.3:4000")).await;

    sleep(Duration::from_millis(1500)).await;
    assert!(rig.metadata_sent().is_empty());
}

#[tokio::test]
async fn standby_metadata_is_kept_and_replayed_on_promotion() {
    let rig = common::spawn_engine();
    let s1  = common::admit(&rig.senders, common::client_id("dj", "/main", "10.0.0.1:4000")).await;
    let _s2 = common::admit(&rig.senders, common::client_id("dj2", "/main", "10.0.0.2:4000")).await;

    sleep(Duration::from_millis(100)).await;

    let pack = common::meta_pack(&common::client_id("dj2", "/main", "10.0.0.2:9999"), "Song B");
    rig.senders.meta.send(pack).await.unwrap();

    sleep(Duration::from_millis(300)).await;

    // Stored on the standby client and reported, but never sent
    // upstream while someone else is live
    assert!(rig.events().contains(&"metadata:dj2:Song B".to_owned()));
    assert!(rig.metadata_sent().is_empty());

    drop(s1);

    let mut delivered = false;
    for _ in 0..30 {
        sleep(Duration::from_millis(100)).await;
        if rig.metadata_sent().contains(&"Song B".to_owned()) {
            delivered = true;
            break;
        }
    }
    assert!(delivered, "promoted client's metadata must reach the upstream");
    assert!(rig.events().contains(&"live:dj2".to_owned()));
}

#[tokio::test]
async fn metadata_for_unknown_client_is_discarded() {
    let rig = common::spawn_engine();
    let _s1 = common::admit(&rig.senders, common::client_id("dj", "/main", "10.0.0.1:4000")).await;

    sleep(Duration::from_millis(100)).await;

    // Mount exists but nobody with this identity is connected
    let pack = common::meta_pack(&common::client_id("stranger", "/main", "10.9.9.9:1234"), "Song X");
    rig.senders.meta.send(pack).await.unwrap();

    sleep(Duration::from_millis(1500)).await;

    assert!(rig.metadata_sent().is_empty());
    assert!(!rig.events().iter().any(|e| e.contains("Song X")));
}
