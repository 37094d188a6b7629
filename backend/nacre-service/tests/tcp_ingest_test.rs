mod common;

use async_trait::async_trait;
use bytes::Bytes;
use common::{admission, eventually, fast_hub, start_tcp, BASE_URL};
use nacre_service::hub::{ClientState, FeedReceiver, Hub, HubError, InMemoryHub, SharedHub};
use nacre_service::tcp::REJECTION_MESSAGE;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

/// Read the two-line banner and return the announced feed id.
async fn read_banner(stream: &mut TcpStream) -> String {
    let mut banner = Vec::new();
    let mut byte = [0u8; 1];
    while banner.iter().filter(|b| **b == b'\n').count() < 2 {
        let n = tokio::time::timeout(WAIT, stream.read(&mut byte))
            .await
            .expect("banner in time")
            .expect("banner read");
        assert_ne!(n, 0, "connection closed before the banner completed");
        banner.push(byte[0]);
    }
    let banner = String::from_utf8(banner).expect("utf-8 banner");
    let mut lines = banner.lines();
    assert_eq!(lines.next(), Some("Connected to nacre"));
    let url = lines.next().expect("feed url line");
    let prefix = format!("{}/feed/", BASE_URL);
    assert!(url.starts_with(&prefix), "unexpected url {url}");
    url[prefix.len()..].to_string()
}

/// In-memory hub whose store rejects every append.
struct RejectingStore(InMemoryHub);

#[async_trait]
impl Hub for RejectingStore {
    async fn feed_exists(&self, id: &str) -> Result<bool, HubError> {
        self.0.feed_exists(id).await
    }

    async fn push(&self, _id: &str, _data: Bytes) -> Result<(), HubError> {
        Err(HubError::Store(redis::RedisError::from((
            redis::ErrorKind::IoError,
            "store unavailable",
        ))))
    }

    async fn listen(&self, id: &str, cancel: CancellationToken) -> Result<FeedReceiver, HubError> {
        self.0.listen(id, cancel).await
    }

    async fn get_all(&self, id: &str) -> Result<Vec<Bytes>, HubError> {
        self.0.get_all(id).await
    }

    async fn client_state(&self, id: &str) -> Result<ClientState, HubError> {
        self.0.client_state(id).await
    }

    async fn client_connected(&self, id: &str) -> Result<(), HubError> {
        self.0.client_connected(id).await
    }

    async fn client_disconnected(&self, id: &str) -> Result<(), HubError> {
        self.0.client_disconnected(id).await
    }

    async fn health_check(&self) -> Result<(), HubError> {
        self.0.health_check().await
    }
}

#[tokio::test]
async fn feed_is_live_by_the_time_the_banner_arrives() {
    let hub = fast_hub();
    let server = start_tcp(Arc::new(hub.clone()), admission(5, 3)).await;

    let mut producer = TcpStream::connect(server.addr).await.unwrap();
    let feed_id = read_banner(&mut producer).await;
    assert_eq!(hub.client_state(&feed_id).await.unwrap(), ClientState::Connected);

    drop(producer);
    server.cancel.cancel();
    server.task.await.unwrap();
}

#[tokio::test]
async fn failed_push_ends_the_stream_and_cleans_up() {
    let hub = fast_hub();
    let controller = admission(1, 3);
    let server = start_tcp(Arc::new(RejectingStore(hub.clone())), controller.clone()).await;

    let mut producer = TcpStream::connect(server.addr).await.unwrap();
    let feed_id = read_banner(&mut producer).await;
    producer.write_all(b"lost").await.unwrap();

    let mut rest = Vec::new();
    let n = tokio::time::timeout(WAIT, producer.read_to_end(&mut rest))
        .await
        .expect("server hung up in time")
        .unwrap_or(0);
    assert_eq!(n, 0);

    let (hub_ref, id) = (&hub, feed_id.as_str());
    let cleared = eventually(WAIT, || async move {
        hub_ref.client_state(id).await.unwrap() == ClientState::Disconnected
    })
    .await;
    assert!(cleared, "liveness record survived the failed push");
    assert!(hub.get_all(&feed_id).await.unwrap().is_empty());

    // The origin's only producer slot is free again.
    let admission = &controller;
    assert!(
        eventually(WAIT, || async move { admission.try_acquire_producer("127.0.0.1") }).await,
        "producer slot was never released"
    );
    assert!(!controller.try_acquire_producer("127.0.0.1"));

    server.cancel.cancel();
    server.task.await.unwrap();
}

#[tokio::test]
async fn producer_bytes_land_in_a_fresh_feed() {
    let hub = fast_hub();
    let shared: SharedHub = Arc::new(hub.clone());
    let server = start_tcp(shared, admission(5, 3)).await;

    let mut producer = TcpStream::connect(server.addr).await.unwrap();
    let feed_id = read_banner(&mut producer).await;
    assert_eq!(feed_id.len(), 36);

    producer.write_all(b"hello ").await.unwrap();
    producer.write_all(b"world\n").await.unwrap();

    let (hub_ref, id) = (&hub, feed_id.as_str());
    let arrived = eventually(WAIT, || async move {
        let all: Vec<u8> = hub_ref
            .get_all(id)
            .await
            .unwrap()
            .iter()
            .flat_map(|c| c.iter().copied())
            .collect();
        all == b"hello world\n".to_vec()
    })
    .await;
    assert!(arrived, "pushed bytes never reached the hub");
    assert_eq!(hub.client_state(&feed_id).await.unwrap(), ClientState::Connected);

    drop(producer);
    let cleared = eventually(WAIT, || async move {
        hub_ref.client_state(id).await.unwrap() == ClientState::Disconnected
    })
    .await;
    assert!(cleared, "liveness record survived the disconnect");

    server.cancel.cancel();
    server.task.await.unwrap();
}

#[tokio::test]
async fn each_connection_gets_its_own_feed() {
    let hub = fast_hub();
    let server = start_tcp(Arc::new(hub.clone()), admission(5, 3)).await;

    let mut first = TcpStream::connect(server.addr).await.unwrap();
    let mut second = TcpStream::connect(server.addr).await.unwrap();
    let first_id = read_banner(&mut first).await;
    let second_id = read_banner(&mut second).await;
    assert_ne!(first_id, second_id);

    first.write_all(b"one").await.unwrap();
    second.write_all(b"two").await.unwrap();
    let (hub, first_id, second_id) = (&hub, first_id.as_str(), second_id.as_str());
    assert!(
        eventually(WAIT, || async move {
            hub.get_all(first_id).await.unwrap() == vec![Bytes::from_static(b"one")]
                && hub.get_all(second_id).await.unwrap() == vec![Bytes::from_static(b"two")]
        })
        .await
    );

    server.cancel.cancel();
    server.task.await.unwrap();
}

#[tokio::test]
async fn origin_over_capacity_is_rejected_without_a_feed() {
    let hub = fast_hub();
    let server = start_tcp(Arc::new(hub.clone()), admission(1, 3)).await;

    let mut admitted = TcpStream::connect(server.addr).await.unwrap();
    read_banner(&mut admitted).await;

    let mut rejected = TcpStream::connect(server.addr).await.unwrap();
    let mut reply = Vec::new();
    tokio::time::timeout(WAIT, rejected.read_to_end(&mut reply))
        .await
        .expect("rejection in time")
        .unwrap();
    assert_eq!(reply, REJECTION_MESSAGE);
    assert!(!String::from_utf8_lossy(&reply).contains("Connected to nacre"));

    // Once the first producer leaves its slot comes back.
    drop(admitted);
    let addr = server.addr;
    let readmitted = eventually(WAIT, || async move {
        let mut retry = TcpStream::connect(addr).await.unwrap();
        let mut head = [0u8; 9];
        retry.read_exact(&mut head).await.is_ok() && &head == b"Connected"
    })
    .await;
    assert!(readmitted);

    server.cancel.cancel();
    server.task.await.unwrap();
}

#[tokio::test]
async fn shutdown_closes_open_producers_and_returns() {
    let hub = fast_hub();
    let server = start_tcp(Arc::new(hub.clone()), admission(5, 3)).await;

    let mut producer = TcpStream::connect(server.addr).await.unwrap();
    let feed_id = read_banner(&mut producer).await;

    server.cancel.cancel();
    tokio::time::timeout(WAIT, server.task)
        .await
        .expect("server drained in time")
        .unwrap();

    let mut rest = Vec::new();
    let n = tokio::time::timeout(WAIT, producer.read_to_end(&mut rest))
        .await
        .expect("socket closed in time")
        .unwrap_or(0);
    assert_eq!(n, 0);
    assert_eq!(
        hub.client_state(&feed_id).await.unwrap(),
        ClientState::Disconnected
    );
    assert!(TcpStream::connect(server.addr).await.is_err());
}
