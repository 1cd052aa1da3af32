use rsock::{
    ClientBuilder, ConnectionHandle, FramedTransport, Requester, Responder, Server, ServerBuilder,
};
use std::sync::Arc;

/// Client and server ends of one in-memory connection. Handles are kept so
/// tests can drive lease grants and closure; not every test touches them.
#[allow(dead_code)]
pub struct Pair {
    pub client: Requester,
    pub client_handle: ConnectionHandle,
    pub server: Requester,
    pub server_handle: ConnectionHandle,
}

/// Wire a client and a server together over an in-memory duplex pipe.
pub async fn pair(
    client: ClientBuilder,
    server: ServerBuilder,
    responder: Arc<dyn Responder>,
) -> Pair {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let accepting = tokio::spawn(async move {
        server
            .accept(FramedTransport::new(b), move |_setup, _requester| {
                Ok(responder)
            })
            .await
    });
    let (client, client_handle) = client
        .connect(FramedTransport::new(a))
        .await
        .expect("client connect");
    let (server, server_handle) = accepting
        .await
        .expect("accept task")
        .expect("server accept");
    Pair {
        client,
        client_handle,
        server,
        server_handle,
    }
}
