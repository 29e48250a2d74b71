pub mod api;
pub mod stats;
pub mod worker;

use std::convert::Infallible;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use anyhow::{Context, Error};
use hyper::service::{make_service_fn, service_fn};
use hyper::Server;

use api::ApiState;

/// §5: "two worker threads drain internal metadata/data queues".
pub const DATASTORE_WORKER_COUNT: usize = 2;

/// Serve the wire protocol on an already-bound listener until the process is
/// killed or the listener fails. Takes ownership of a `std::net::TcpListener`
/// rather than a `SocketAddr` so callers that need to know the actual bound
/// port (tests binding to `:0`) can read it back before handing the listener
/// over. Pulled out of `main.rs` so integration tests can build the same
/// `ApiState` and drive it through a real `hyper::Client` without
/// duplicating the connection-handling glue.
pub async fn serve(state: Arc<ApiState>, listener: TcpListener) -> Result<(), Error> {
    let addr = listener.local_addr()?;
    let make_svc = make_service_fn(move |_conn| {
        let state = Arc::clone(&state);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = Arc::clone(&state);
                async move { Ok::<_, Infallible>(api::dispatch(state, req).await) }
            }))
        }
    });

    log::info!("cdp-server listening on {addr}");
    Server::from_tcp(listener)
        .context("unable to configure bound listener")?
        .serve(make_svc)
        .await
        .context("server loop exited with an error")
}

/// Bind `addr`, returning the listener and its actual local address (useful
/// when `addr`'s port is `0` and the caller needs to know what was picked).
pub fn bind(addr: SocketAddr) -> Result<(TcpListener, SocketAddr), Error> {
    let listener = TcpListener::bind(addr).with_context(|| format!("unable to bind {addr}"))?;
    let local_addr = listener.local_addr()?;
    Ok((listener, local_addr))
}
