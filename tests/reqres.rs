mod common;

use common::pair;
use futures::future::{self, BoxFuture, FutureExt};
use rsock::{Bytes, Client, Error, ErrorCode, Payload, RejectAll, Responder, Server};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Pong;

impl Responder for Pong {
    fn request_response(&self, payload: Payload) -> BoxFuture<'static, Result<Payload, Error>> {
        future::ready(if payload.data().as_ref() == br#"{"q":"ping"}"# {
            Ok(Payload::new(&br#"{"r":"pong"}"#[..]))
        } else {
            Err(Error::application("unexpected request"))
        })
        .boxed()
    }
}

#[tokio::test]
async fn setup_and_response() {
    let pair = pair(
        Client::builder()
            .keepalive_interval(Duration::from_secs(30))
            .max_lifetime(Duration::from_secs(90))
            .metadata_mime("application/json")
            .data_mime("application/json"),
        Server::builder(),
        Arc::new(Pong),
    )
    .await;

    let response = pair
        .client
        .request_response(Payload::new(&br#"{"q":"ping"}"#[..]))
        .await
        .unwrap();
    assert_eq!(response.data().as_ref(), br#"{"r":"pong"}"#);
}

#[tokio::test]
async fn application_errors_carry_their_code() {
    let pair = pair(Client::builder(), Server::builder(), Arc::new(Pong)).await;

    let err = pair
        .client
        .request_response(Payload::new("something else"))
        .await
        .unwrap_err();
    match err {
        Error::Stream { code, message } => {
            assert_eq!(code, ErrorCode::ApplicationError);
            assert_eq!(message, "unexpected request");
        }
        other => panic!("expected stream error, got {other:?}"),
    }
}

#[tokio::test]
async fn unhandled_patterns_are_rejected() {
    let pair = pair(Client::builder(), Server::builder(), Arc::new(RejectAll)).await;

    let err = pair
        .client
        .request_response(Payload::new("anyone home?"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::Rejected));
}

struct Recording {
    fnf: mpsc::UnboundedSender<Payload>,
    pushes: mpsc::UnboundedSender<Bytes>,
}

impl Responder for Recording {
    fn fire_and_forget(&self, payload: Payload) -> BoxFuture<'static, ()> {
        let fnf = self.fnf.clone();
        async move {
            let _ = fnf.send(payload);
        }
        .boxed()
    }

    fn metadata_push(&self, metadata: Bytes) {
        let _ = self.pushes.send(metadata);
    }
}

#[tokio::test]
async fn fire_and_forget_is_delivered() {
    let (fnf_tx, mut fnf_rx) = mpsc::unbounded_channel();
    let (push_tx, mut push_rx) = mpsc::unbounded_channel();
    let pair = pair(
        Client::builder(),
        Server::builder(),
        Arc::new(Recording {
            fnf: fnf_tx,
            pushes: push_tx,
        }),
    )
    .await;

    pair.client
        .fire_and_forget(Payload::new("tell, don't ask"))
        .await
        .unwrap();
    let seen = fnf_rx.recv().await.unwrap();
    assert_eq!(seen.data().as_ref(), b"tell, don't ask");

    pair.client
        .metadata_push(Bytes::from_static(b"routing-hint"))
        .await
        .unwrap();
    let seen = push_rx.recv().await.unwrap();
    assert_eq!(seen.as_ref(), b"routing-hint");
}

#[tokio::test]
async fn server_can_request_from_client() {
    let pair = pair(
        Client::builder().responder(Arc::new(Pong)),
        Server::builder(),
        Arc::new(RejectAll),
    )
    .await;

    let response = pair
        .server
        .request_response(Payload::new(&br#"{"q":"ping"}"#[..]))
        .await
        .unwrap();
    assert_eq!(response.data().as_ref(), br#"{"r":"pong"}"#);
}
