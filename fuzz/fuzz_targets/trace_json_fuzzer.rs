//! Fuzz target for trace loading and validation
//!
//! # Strategy
//!
//! - Raw bytes: arbitrary input fed to the JSON loader
//! - Structured traces: arbitrary endpoints and messages, with ids drawn
//!   from a small range so dangling references are common
//!
//! # Invariants
//!
//! - NEVER panic on malformed JSON or unknown message kinds
//! - A trace that validates has only known senders and targets
//! - The sender index preserves per-sender trace order
//! - Every message lands in exactly one sender bucket

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use retrace_core::{Endpoint, Globals, Message, MessageKind, Trace};

#[derive(Debug, Arbitrary)]
enum Input {
    Raw(Vec<u8>),
    Structured { endpoints: Vec<FuzzEndpoint>, messages: Vec<FuzzMessage> },
}

#[derive(Debug, Arbitrary)]
struct FuzzEndpoint {
    id: u8,
    server: bool,
    port: u16,
}

#[derive(Debug, Arbitrary)]
struct FuzzMessage {
    from: u8,
    to: u8,
    kind: String,
    payload: String,
    delay_ms: Option<u16>,
}

fuzz_target!(|input: Input| {
    let trace = match input {
        Input::Raw(bytes) => {
            let Ok(json) = std::str::from_utf8(&bytes) else {
                return;
            };
            match Trace::from_json(json) {
                Ok(trace) => trace,
                Err(_) => return,
            }
        },
        Input::Structured { endpoints, messages } => {
            let endpoints = endpoints
                .into_iter()
                .map(|ep| {
                    let id = u32::from(ep.id % 8);
                    if ep.server {
                        Endpoint::server(id, "127.0.0.1", ep.port)
                    } else {
                        Endpoint::client(id)
                    }
                })
                .collect();
            let messages = messages
                .into_iter()
                .map(|m| {
                    let mut message = Message::new(
                        u32::from(m.from % 8),
                        u32::from(m.to % 8),
                        MessageKind::parse(&m.kind),
                    )
                    .with_payload(m.payload);
                    message.delay_ms = m.delay_ms.map(u64::from);
                    message
                })
                .collect();
            Trace::new(Globals::default(), endpoints, messages)
        },
    };

    if trace.validate().is_ok() {
        for message in &trace.messages {
            assert!(trace.endpoint(message.from).is_some(), "validated trace has unknown sender");
            assert!(trace.endpoint(message.to).is_some(), "validated trace has unknown target");
        }
    }

    let indexed: usize = trace.sender_index().values().map(Vec::len).sum();
    assert_eq!(indexed, trace.messages.len(), "sender index lost or duplicated messages");

    for endpoint in &trace.endpoints {
        let expected: Vec<&Message> =
            trace.messages.iter().filter(|m| m.from == endpoint.id).collect();
        let actual: Vec<&Message> = trace.messages_from(endpoint.id).iter().collect();
        assert_eq!(expected, actual, "sender index reordered messages");
    }

    for message in &trace.messages {
        let _ = message.decode_payload();
    }
});
