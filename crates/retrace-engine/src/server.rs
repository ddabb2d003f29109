//! Server listener task.
//!
//! A server binds its address, accepts for the listener's lifetime and
//! spawns a drain task per connection. Servers never complete: they stay
//! `Running` until stopped.

use std::{sync::Arc, time::Duration};

use retrace_core::Environment;
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;

use crate::{
    engine::RunContext,
    registry::{EndpointCounters, ListenerHandle},
};

/// Rolling read deadline in a drain task. Expiry only re-checks
/// cancellation.
pub const DRAIN_DEADLINE: Duration = Duration::from_millis(100);

const DRAIN_BUFFER: usize = 4096;

pub(crate) async fn run<E: Environment>(ctx: RunContext<E>) {
    let id = ctx.endpoint.id;
    let engine = &ctx.engine;

    engine.log_info(format!("Starting endpoint {id} (server)..."));

    if engine.has_listener(id) {
        engine.log_info(format!("Listener {id} already active"));
        return;
    }

    let addr = ctx.endpoint.socket_address();
    let bound = TcpListener::bind(&addr).await.and_then(|listener| {
        let local_addr = listener.local_addr()?;
        Ok((listener, local_addr))
    });
    let (listener, local_addr) = match bound {
        Ok(bound) => bound,
        Err(e) => {
            engine.log_error(format!("Error starting listener {id}: {e}"));
            engine.fail_setup(id, ctx.generation);
            return;
        },
    };

    let handle = ListenerHandle::new(listener, local_addr, ctx.cancel.child_token());
    if !engine.register_listener(id, ctx.generation, handle.clone()) {
        tracing::debug!("endpoint {} stopped during bind, dropping listener", id);
        handle.close();
        return;
    }

    engine.log_info(format!("Endpoint {id} listening on {local_addr}"));

    loop {
        tokio::select! {
            biased;
            () = ctx.shutdown.cancelled() => break,
            () = handle.closed() => {
                engine.log_info(format!("Endpoint {id} listener closed"));
                break;
            },
            accepted = handle.accept() => match accepted {
                Ok((stream, peer)) => {
                    ctx.counters.record_accept();
                    engine.log_info(format!("Endpoint {id} accepted connection from {peer}"));

                    let shutdown = ctx.shutdown.clone();
                    let counters = Arc::clone(&ctx.counters);
                    tokio::spawn(drain(stream, shutdown, counters));
                },
                Err(e) => {
                    engine.log_error(format!("Endpoint {id} accept error: {e}"));
                    break;
                },
            },
        }
    }

    handle.close();
}

/// Read and discard everything the peer sends, counting bytes.
async fn drain(mut stream: TcpStream, shutdown: CancellationToken, counters: Arc<EndpointCounters>) {
    let mut buf = [0u8; DRAIN_BUFFER];

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            read = tokio::time::timeout(DRAIN_DEADLINE, stream.read(&mut buf)) => match read {
                Err(_) => continue,
                Ok(Ok(0) | Err(_)) => break,
                Ok(Ok(n)) => counters.record_received(n),
            },
        }
    }
}
