//! Start/stop lifecycle tests.

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use proptest::prelude::*;
use retrace_core::{Endpoint, EndpointId, Globals, Message, MessageKind};
use retrace_engine::{EndpointStatus, Engine, EngineConfig, Environment, Trace};
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
};

const WAIT: Duration = Duration::from_secs(5);
const LONG: u64 = 60_000;

async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn noop(from: EndpointId) -> Message {
    Message::new(from, from, MessageKind::Other("noop".into()))
}

/// Clients that connect to server 1 and then sleep for a minute.
fn sleeping_clients(port: u16, clients: &[EndpointId]) -> Trace {
    let mut endpoints = vec![Endpoint::server(1, "127.0.0.1", port)];
    let mut messages = Vec::new();
    for &id in clients {
        endpoints.push(Endpoint::client(id));
        messages.push(Message::new(id, 1, MessageKind::Syn));
        messages.push(Message::new(id, 1, MessageKind::Data).with_payload("ff").with_delay(LONG));
    }
    Trace::new(Globals::default(), endpoints, messages)
}

#[tokio::test]
async fn stop_mid_sequence_leaves_client_idle() {
    let trace = Trace::new(
        Globals::default(),
        vec![Endpoint::client(1)],
        vec![noop(1).with_delay(LONG), noop(1)],
    );
    let engine = Engine::new(trace, EngineConfig::default()).await.unwrap();

    engine.start_endpoint(1);
    assert_eq!(engine.status(1), EndpointStatus::Running);

    engine.stop_endpoint(1);
    assert_eq!(engine.status(1), EndpointStatus::Idle);
    assert!(!engine.is_running(1));
    assert!(!engine.is_replaying());

    assert!(wait_for(|| engine.log().read_all().contains("Endpoint 1 stopped by user")).await);
    assert_eq!(engine.status(1), EndpointStatus::Idle);
    assert!(!engine.log().read_all().contains("finished trace"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_all_closes_sockets_and_allows_restart() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let engine = Engine::new(sleeping_clients(port, &[2, 3]), EngineConfig::default()).await.unwrap();

    engine.start_endpoint(2);
    engine.start_endpoint(3);

    let (mut first, _) = tokio::time::timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    let (mut second, _) = tokio::time::timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    assert!(wait_for(|| engine.stats(2).open_connections == 1).await);
    assert!(wait_for(|| engine.stats(3).open_connections == 1).await);
    assert_eq!(engine.active_client_count(), 2);

    let stopped_at = Instant::now();
    engine.stop_all();

    assert_eq!(engine.status(2), EndpointStatus::Idle);
    assert_eq!(engine.status(3), EndpointStatus::Idle);
    assert_eq!(engine.active_client_count(), 0);
    assert!(!engine.is_replaying());
    assert!(engine.snapshot().active.is_empty());

    let mut buf = [0u8; 4];
    for stream in [&mut first, &mut second] {
        let n = tokio::time::timeout(WAIT, stream.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 0, "peer should see EOF after stop_all");
    }
    assert!(stopped_at.elapsed() < Duration::from_secs(2));

    engine.start_endpoint(2);
    assert_eq!(engine.status(2), EndpointStatus::Running);
    let (_again, _) = tokio::time::timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    assert!(wait_for(|| engine.stats(2).open_connections == 1).await);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_endpoint_closes_its_connections() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let engine = Engine::new(sleeping_clients(port, &[2, 3]), EngineConfig::default()).await.unwrap();

    engine.start_endpoint(2);
    let (mut stream, _) = tokio::time::timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    assert!(wait_for(|| engine.stats(2).open_connections == 1).await);
    engine.start_endpoint(3);

    engine.stop_endpoint(2);

    let mut buf = [0u8; 4];
    let n = tokio::time::timeout(WAIT, stream.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0);
    assert_eq!(engine.stats(2).open_connections, 0);
    assert!(engine.is_running(3));
    assert_eq!(engine.active_client_count(), 1);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopped_server_releases_listener() {
    let trace = Trace::new(Globals::default(), vec![Endpoint::server(1, "127.0.0.1", 0)], vec![]);
    let engine = Engine::new(trace, EngineConfig::default()).await.unwrap();

    engine.start_endpoint(1);
    assert!(wait_for(|| engine.listener_addr(1).is_some()).await);
    let addr = engine.listener_addr(1).unwrap();
    TcpStream::connect(addr).await.unwrap();

    engine.stop_endpoint(1);
    assert_eq!(engine.status(1), EndpointStatus::Idle);
    assert!(engine.listener_addr(1).is_none());
    assert!(TcpStream::connect(addr).await.is_err(), "listener still accepting after stop");
    assert!(wait_for(|| engine.log().read_all().contains("Endpoint 1 listener closed")).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_all_releases_listeners() {
    let trace = Trace::new(Globals::default(), vec![Endpoint::server(1, "127.0.0.1", 0)], vec![]);
    let engine = Engine::new(trace, EngineConfig::default()).await.unwrap();

    engine.start_endpoint(1);
    assert!(wait_for(|| engine.listener_addr(1).is_some()).await);
    let addr = engine.listener_addr(1).unwrap();

    engine.stop_all();
    assert_eq!(engine.status(1), EndpointStatus::Idle);

    assert!(TcpStream::connect(addr).await.is_err(), "listener still accepting after stop_all");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!engine.log().read_all().contains("listener closed"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn port_is_free_once_stop_returns() {
    let port = free_port();
    let trace = Trace::new(Globals::default(), vec![Endpoint::server(1, "127.0.0.1", port)], vec![]);
    let engine = Engine::new(trace, EngineConfig::default()).await.unwrap();

    engine.start_endpoint(1);
    assert!(wait_for(|| engine.listener_addr(1).is_some()).await);
    engine.stop_endpoint(1);
    drop(std::net::TcpListener::bind(("127.0.0.1", port)).unwrap());

    engine.start_endpoint(1);
    assert!(wait_for(|| engine.listener_addr(1).is_some()).await);
    engine.stop_all();
    drop(std::net::TcpListener::bind(("127.0.0.1", port)).unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_restarts_on_same_port_right_after_stop() {
    let port = free_port();
    let trace = Trace::new(Globals::default(), vec![Endpoint::server(1, "127.0.0.1", port)], vec![]);
    let engine = Engine::new(trace, EngineConfig::default()).await.unwrap();

    for _ in 0..20 {
        engine.start_endpoint(1);
        assert!(wait_for(|| engine.listener_addr(1).is_some()).await);
        assert_eq!(engine.status(1), EndpointStatus::Running);
        engine.stop_endpoint(1);
    }

    assert!(!engine.log().read_all().contains("Error starting listener"));
    engine.shutdown().await;
}

#[tokio::test]
async fn completed_client_can_run_again() {
    let trace = Trace::new(Globals::default(), vec![Endpoint::client(1)], vec![noop(1)]);
    let engine = Engine::new(trace, EngineConfig::default()).await.unwrap();

    for _ in 0..3 {
        engine.start_endpoint(1);
        tokio::time::timeout(WAIT, engine.wait_until_idle()).await.unwrap();
        assert_eq!(engine.status(1), EndpointStatus::Completed);
    }
    assert_eq!(engine.log().read_all().matches("Endpoint 1 finished trace.").count(), 3);
}

#[tokio::test]
async fn watch_running_follows_replay() {
    let trace = Trace::new(
        Globals::default(),
        vec![Endpoint::client(1)],
        vec![noop(1).with_delay(LONG)],
    );
    let engine = Engine::new(trace, EngineConfig::default()).await.unwrap();
    let mut running = engine.watch_running();
    assert!(!*running.borrow());

    engine.start_endpoint(1);
    tokio::time::timeout(WAIT, running.wait_for(|r| *r)).await.unwrap().unwrap();

    engine.stop_endpoint(1);
    tokio::time::timeout(WAIT, running.wait_for(|r| !*r)).await.unwrap().unwrap();
}

/// Records requested delays and returns immediately.
#[derive(Clone, Default)]
struct RecordingEnv {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl Environment for RecordingEnv {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        self.delays.lock().unwrap().push(duration);
        std::future::ready(())
    }
}

#[tokio::test]
async fn missing_delay_uses_default_and_zero_skips_wait() {
    let trace = Trace::new(
        Globals::default(),
        vec![Endpoint::client(1)],
        vec![noop(1), noop(1).with_delay(0), noop(1).with_delay(30)],
    );
    let config =
        EngineConfig { default_delay: Duration::from_millis(20), ..EngineConfig::default() };
    let env = RecordingEnv::default();
    let engine = Engine::with_env(trace, config, env.clone()).await.unwrap();

    engine.start_endpoint(1);
    tokio::time::timeout(WAIT, engine.wait_until_idle()).await.unwrap();

    assert_eq!(engine.status(1), EndpointStatus::Completed);
    assert_eq!(
        *env.delays.lock().unwrap(),
        vec![Duration::from_millis(20), Duration::from_millis(30)]
    );
}

#[derive(Debug, Clone)]
enum Op {
    Start(EndpointId),
    Stop(EndpointId),
    StopAll,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    // 1-3 are clients, 10 is a server, 42 is not in the trace
    let id = prop_oneof![Just(1), Just(2), Just(3), Just(10), Just(42)];
    prop_oneof![
        4 => id.clone().prop_map(Op::Start),
        3 => id.prop_map(Op::Stop),
        1 => Just(Op::StopAll),
    ]
}

fn lifecycle_trace() -> Trace {
    let mut endpoints: Vec<Endpoint> = (1..=3).map(Endpoint::client).collect();
    endpoints.push(Endpoint::server(10, "127.0.0.1", 0));
    let messages = (1..=3).map(|id| noop(id).with_delay(LONG)).collect();
    Trace::new(Globals::default(), endpoints, messages)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Active set and counters match a reference model after every operation.
    #[test]
    fn prop_lifecycle_matches_model(ops in prop::collection::vec(op_strategy(), 0..40)) {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let engine = rt.block_on(Engine::new(lifecycle_trace(), EngineConfig::default())).unwrap();
        let _guard = rt.enter();

        let mut model: BTreeSet<EndpointId> = BTreeSet::new();
        for op in &ops {
            match op {
                Op::Start(id) if *id != 42 => {
                    model.insert(*id);
                    engine.start_endpoint(*id);
                },
                Op::Start(id) => engine.start_endpoint(*id),
                Op::Stop(id) => {
                    model.remove(id);
                    engine.stop_endpoint(*id);
                },
                Op::StopAll => {
                    model.clear();
                    engine.stop_all();
                },
            }

            let snapshot = engine.snapshot();
            let clients = model.iter().filter(|id| **id != 10).count();
            prop_assert_eq!(&snapshot.active, &model, "after {:?}", op);
            prop_assert_eq!(snapshot.active_clients, clients);
            prop_assert_eq!(snapshot.running, clients > 0);

            for id in [1, 2, 3, 10] {
                let expected = if model.contains(&id) {
                    EndpointStatus::Running
                } else {
                    EndpointStatus::Idle
                };
                prop_assert_eq!(engine.status(id), expected, "endpoint {} after {:?}", id, op);
            }
        }

        rt.block_on(engine.shutdown());
    }
}
