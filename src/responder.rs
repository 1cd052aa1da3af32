use crate::{payload::Payload, types::Error};
use bytes::Bytes;
use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{self, BoxStream, StreamExt};

/// Application hooks for serving inbound interactions.
///
/// One handler serves every stream the peer opens on a connection. Each
/// pattern the application leaves unimplemented answers with
/// `ERROR(REJECTED)`. Returned streams are pulled one item per unit of
/// request-N credit, so a handler never outruns the peer's demand.
pub trait Responder: Send + Sync + 'static {
    fn request_response(&self, payload: Payload) -> BoxFuture<'static, Result<Payload, Error>> {
        let _ = payload;
        future::err(Error::rejected("request_response unsupported")).boxed()
    }

    fn request_stream(&self, payload: Payload) -> BoxStream<'static, Result<Payload, Error>> {
        let _ = payload;
        stream::once(future::err(Error::rejected("request_stream unsupported"))).boxed()
    }

    /// `payloads` yields the requester's frames, the initial request payload
    /// first; the returned stream is this side's outbound direction.
    fn request_channel(
        &self,
        payloads: BoxStream<'static, Result<Payload, Error>>,
    ) -> BoxStream<'static, Result<Payload, Error>> {
        let _ = payloads;
        stream::once(future::err(Error::rejected("request_channel unsupported"))).boxed()
    }

    /// Fire-and-forget carries no reply channel; failures may only be logged.
    fn fire_and_forget(&self, payload: Payload) -> BoxFuture<'static, ()> {
        let _ = payload;
        future::ready(()).boxed()
    }

    fn metadata_push(&self, metadata: Bytes) {
        let _ = metadata;
    }
}

/// The do-nothing handler: every request is rejected, pushes are dropped.
pub struct RejectAll;

impl Responder for RejectAll {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorCode;

    #[tokio::test]
    async fn defaults_reject() {
        let responder = RejectAll;
        let err = responder
            .request_response(Payload::new("x"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::Rejected));

        let first = responder
            .request_stream(Payload::new("x"))
            .next()
            .await
            .unwrap();
        assert_eq!(first.unwrap_err().code(), Some(ErrorCode::Rejected));

        responder.fire_and_forget(Payload::new("x")).await;
    }
}
