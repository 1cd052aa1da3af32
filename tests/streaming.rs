mod common;

use common::pair;
use futures::stream::{self, BoxStream, StreamExt};
use rsock::{Client, Error, Payload, Responder, Server};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

struct Counting;

impl Responder for Counting {
    fn request_stream(&self, payload: Payload) -> BoxStream<'static, Result<Payload, Error>> {
        let count: usize = String::from_utf8_lossy(payload.data())
            .parse()
            .unwrap_or(0);
        stream::iter((0..count).map(|i| Ok(Payload::new(format!("item-{i}").into_bytes()))))
            .boxed()
    }

    fn request_channel(
        &self,
        payloads: BoxStream<'static, Result<Payload, Error>>,
    ) -> BoxStream<'static, Result<Payload, Error>> {
        // echo
        payloads
    }
}

#[tokio::test]
async fn streamed_with_credit() {
    let pair = pair(Client::builder(), Server::builder(), Arc::new(Counting)).await;

    let mut incoming = pair
        .client
        .request_stream(Payload::new("5"), 2)
        .unwrap();

    for i in 0..2 {
        let payload = incoming.next().await.unwrap().unwrap();
        assert_eq!(payload.data().as_ref(), format!("item-{i}").as_bytes());
    }
    // credit exhausted: nothing may arrive until we grant more
    assert!(timeout(Duration::from_millis(100), incoming.next())
        .await
        .is_err());

    incoming.request_n(3);
    for i in 2..5 {
        let payload = incoming.next().await.unwrap().unwrap();
        assert_eq!(payload.data().as_ref(), format!("item-{i}").as_bytes());
    }
    assert!(incoming.next().await.is_none());
}

#[tokio::test]
async fn cancel_mid_stream() {
    let pair = pair(Client::builder(), Server::builder(), Arc::new(Counting)).await;

    let mut incoming = pair
        .client
        .request_stream(Payload::new("1000"), 1)
        .unwrap();
    let first = incoming.next().await.unwrap().unwrap();
    assert_eq!(first.data().as_ref(), b"item-0");

    incoming.cancel();
    // no error, no further payloads
    assert!(incoming.next().await.is_none());

    // the connection survives and serves new streams
    let mut fresh = pair
        .client
        .request_stream(Payload::new("2"), 2)
        .unwrap();
    assert!(fresh.next().await.unwrap().is_ok());
    assert!(fresh.next().await.unwrap().is_ok());
    assert!(fresh.next().await.is_none());
}

#[tokio::test]
async fn dropping_the_stream_cancels_it() {
    let pair = pair(Client::builder(), Server::builder(), Arc::new(Counting)).await;

    {
        let mut incoming = pair
            .client
            .request_stream(Payload::new("1000"), 1)
            .unwrap();
        let _ = incoming.next().await;
    }
    // after the implicit cancel the connection is still usable
    let mut fresh = pair.client.request_stream(Payload::new("1"), 1).unwrap();
    assert!(fresh.next().await.unwrap().is_ok());
    assert!(fresh.next().await.is_none());
}

#[tokio::test]
async fn channel_echo() {
    let pair = pair(Client::builder(), Server::builder(), Arc::new(Counting)).await;

    let outbound = stream::iter((0..4).map(|i| Ok(Payload::new(format!("c{i}").into_bytes()))));
    let mut inbound = pair.client.request_channel(outbound, 16).await.unwrap();

    for i in 0..4 {
        let payload = inbound.next().await.unwrap().unwrap();
        assert_eq!(payload.data().as_ref(), format!("c{i}").as_bytes());
    }
    assert!(inbound.next().await.is_none());
}

#[tokio::test]
async fn empty_channel_still_carries_the_initial_payload() {
    let pair = pair(Client::builder(), Server::builder(), Arc::new(Counting)).await;

    let mut inbound = pair
        .client
        .request_channel(stream::empty(), 4)
        .await
        .unwrap();
    // REQUEST_CHANNEL always carries a payload; an empty outbound sequence
    // sends an empty one, which the echo handler reflects
    let first = inbound.next().await.unwrap().unwrap();
    assert!(first.is_empty());
    assert!(inbound.next().await.is_none());
}

#[tokio::test]
async fn stream_order_is_preserved() {
    let pair = pair(Client::builder(), Server::builder(), Arc::new(Counting)).await;

    let mut incoming = pair
        .client
        .request_stream(Payload::new("64"), 64)
        .unwrap();
    let mut seen = Vec::new();
    while let Some(item) = incoming.next().await {
        seen.push(String::from_utf8_lossy(item.unwrap().data()).into_owned());
    }
    let expected: Vec<String> = (0..64).map(|i| format!("item-{i}")).collect();
    assert_eq!(seen, expected);
}
