//! Client replay task.
//!
//! A client walks its own messages in trace order: wait the message's delay,
//! execute it, repeat. Message failures are logged and counted but never end
//! the run. Cancellation is observed before each message, during the delay
//! and during execution.

use std::{sync::Arc, time::Duration};

use retrace_core::{Environment, Message, MessageKind};
use tokio::net::TcpStream;

use crate::{
    engine::RunContext,
    error::MessageError,
    registry::{ConnectionTable, PeerConnection},
};

/// Bound on establishing a connection.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) async fn run<E: Environment>(ctx: RunContext<E>, connections: Arc<ConnectionTable>) {
    let id = ctx.endpoint.id;
    let engine = &ctx.engine;
    let env = engine.env().clone();
    let trace = Arc::clone(engine.trace());
    let default_delay = engine.config().default_delay;

    engine.log_info(format!("Starting endpoint {id} (client)..."));
    let started = env.now();

    for (index, message) in trace.messages_from(id).iter().enumerate() {
        if ctx.cancel.is_cancelled() || !engine.is_current(id, ctx.generation) {
            stopped(&ctx);
            return;
        }

        let delay = message.delay_ms.map_or(default_delay, Duration::from_millis);
        if !delay.is_zero() {
            tokio::select! {
                biased;
                () = ctx.cancel.cancelled() => {
                    stopped(&ctx);
                    return;
                },
                () = env.sleep(delay) => {},
            }
        }

        let elapsed = env.elapsed_since(started).as_millis();
        let result = tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => {
                stopped(&ctx);
                return;
            },
            result = execute(&ctx, &connections, message) => result,
        };

        if let Err(e) = result {
            engine.log_error(format!("[+{elapsed}ms] Error msg {index}: {e}"));
            ctx.counters.record_error();
            engine.mark_error(id, ctx.generation);
        }
    }

    engine.log_info(format!("Endpoint {id} finished trace."));
    engine.finish_run(id, ctx.generation);
}

fn stopped<E: Environment>(ctx: &RunContext<E>) {
    let id = ctx.endpoint.id;
    ctx.engine.log_info(format!("Endpoint {id} stopped by user"));
    ctx.engine.mark_stopped(id, ctx.generation);
}

/// Perform one message.
async fn execute<E: Environment>(
    ctx: &RunContext<E>,
    connections: &ConnectionTable,
    message: &Message,
) -> Result<(), MessageError> {
    let engine = &ctx.engine;
    let (from, to) = (message.from, message.to);

    match &message.kind {
        MessageKind::Syn => {
            let target = engine.trace().endpoint(to).ok_or(MessageError::UnknownTarget(to))?;
            let addr = target.socket_address();

            engine.log_info(format!("Connecting {from} -> {to} ({addr})..."));
            let stream = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&addr)).await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(source)) => return Err(MessageError::Connect { addr, source }),
                Err(_) => return Err(MessageError::ConnectTimeout { addr, timeout: DIAL_TIMEOUT }),
            };
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!("set_nodelay failed: {}", e);
            }

            if connections.insert(to, Arc::new(PeerConnection::new(stream)), &ctx.cancel) {
                engine.log_info(format!("Connected {from} -> {to}"));
            }
            Ok(())
        },

        MessageKind::Data => {
            let Some(conn) = connections.get(to) else {
                engine.log_info(format!("simulating data {from} -> {to} (no active conn)"));
                return Ok(());
            };

            let payload = message.decode_payload()?;
            if payload.is_empty() {
                return Ok(());
            }

            conn.write(&payload, engine.config().connect_timeout).await?;
            ctx.counters.record_sent(payload.len());
            engine.log_info(format!("Sent {} bytes {from} -> {to}", payload.len()));
            Ok(())
        },

        MessageKind::Fin => {
            if let Some(conn) = connections.remove(to) {
                conn.close().await;
                engine.log_info(format!("Closed connection {from} -> {to}"));
            }
            Ok(())
        },

        MessageKind::Other(kind) => {
            tracing::trace!("skipping {} message {} -> {}", kind, from, to);
            Ok(())
        },
    }
}
