//! Redis adapter against a throwaway container.
//!
//! Needs Docker: `cargo test -p nacre-service --test redis_hub_test -- --ignored`

use bytes::Bytes;
use nacre_service::hub::{ClientState, FeedReceiver, Hub, HubSettings, RedisHub};
use std::time::Duration;
use testcontainers::{core::WaitFor, runners::AsyncRunner, ContainerAsync, GenericImage};
use tokio_util::sync::CancellationToken;

async fn start_redis(settings: HubSettings) -> (RedisHub, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("redis", "7-alpine")
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
        .start()
        .await
        .expect("start redis container");
    let port = container
        .get_host_port_ipv4(6379)
        .await
        .expect("redis host port");
    let hub = RedisHub::connect(&format!("redis://127.0.0.1:{port}/0"), settings)
        .await
        .expect("connect to redis");
    (hub, container)
}

async fn recv(rx: &mut FeedReceiver) -> Option<Bytes> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("tail produced nothing in time")
}

fn chunk(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

#[tokio::test]
#[ignore = "requires docker"]
async fn push_get_all_and_existence() {
    let (hub, _container) = start_redis(HubSettings::default()).await;

    assert!(!hub.feed_exists("f").await.unwrap());
    assert!(hub.get_all("f").await.unwrap().is_empty());

    let binary = Bytes::from_static(&[0, 159, 146, 150, 255]);
    for c in ["a", "b", "c"] {
        hub.push("f", chunk(c)).await.unwrap();
    }
    hub.push("f", binary.clone()).await.unwrap();

    assert!(hub.feed_exists("f").await.unwrap());
    assert_eq!(
        hub.get_all("f").await.unwrap(),
        vec![chunk("a"), chunk("b"), chunk("c"), binary]
    );
    hub.health_check().await.unwrap();
}

#[tokio::test]
#[ignore = "requires docker"]
async fn history_is_bounded() {
    let (hub, _container) = start_redis(HubSettings {
        max_stream_len: 10,
        ..HubSettings::default()
    })
    .await;

    for i in 0..500 {
        hub.push("bounded", chunk(&format!("e{i}"))).await.unwrap();
    }
    let all = hub.get_all("bounded").await.unwrap();
    // Approximate trimming keeps whole macro nodes, so allow slack above the cap.
    assert!(all.len() < 500, "no trimming happened");
    assert!(all.len() >= 10, "trimmed below the cap");

    // What survives is the newest contiguous run, oldest dropped first.
    let first_kept = 500 - all.len();
    let expected: Vec<Bytes> = (first_kept..500).map(|i| chunk(&format!("e{i}"))).collect();
    assert_eq!(all, expected);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn liveness_record_lifecycle() {
    let (hub, _container) = start_redis(HubSettings::default()).await;

    assert_eq!(hub.client_state("p").await.unwrap(), ClientState::Disconnected);
    hub.client_disconnected("p").await.unwrap();

    hub.client_connected("p").await.unwrap();
    assert_eq!(hub.client_state("p").await.unwrap(), ClientState::Connected);

    hub.client_disconnected("p").await.unwrap();
    assert_eq!(hub.client_state("p").await.unwrap(), ClientState::Disconnected);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn listen_replays_follows_and_stops_with_the_producer() {
    let (hub, _container) = start_redis(HubSettings {
        block_timeout: Duration::from_millis(200),
        ..HubSettings::default()
    })
    .await;

    hub.client_connected("live").await.unwrap();
    hub.push("live", chunk("old")).await.unwrap();

    let mut rx = hub.listen("live", CancellationToken::new()).await.unwrap();
    assert_eq!(recv(&mut rx).await, Some(chunk("old")));

    hub.push("live", chunk("new")).await.unwrap();
    assert_eq!(recv(&mut rx).await, Some(chunk("new")));

    hub.client_disconnected("live").await.unwrap();
    assert_eq!(recv(&mut rx).await, None);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn cancelling_a_listen_closes_its_channel() {
    let (hub, _container) = start_redis(HubSettings::default()).await;
    hub.client_connected("c").await.unwrap();
    hub.push("c", chunk("x")).await.unwrap();

    let cancel = CancellationToken::new();
    let mut rx = hub.listen("c", cancel.clone()).await.unwrap();
    assert_eq!(rx.recv().await, Some(chunk("x")));

    cancel.cancel();
    let closed = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
    assert_eq!(closed.unwrap(), None);
}
