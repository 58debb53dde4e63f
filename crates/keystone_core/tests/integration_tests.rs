//! End-to-end behaviour of the core with an in-memory host pipeline.

use keystone_core::revision::{V1_17_R1, V1_17_R1_1, V1_8_R3};
use keystone_core::*;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Host pipeline stand-in: whatever survives interception lands in
/// `delivered`, whatever is sent raw lands in `wire`.
#[derive(Default)]
struct MemoryPipeline {
    interceptor: RwLock<Option<Arc<PacketInterceptor>>>,
    delivered: Mutex<Vec<Packet>>,
    wire: Mutex<Vec<Packet>>,
}

impl MemoryPipeline {
    async fn receive(&self, packet: Packet) {
        let interceptor = self.interceptor.read().clone();
        let packet = match interceptor {
            Some(interceptor) => interceptor.intercept(Direction::Inbound, packet).await,
            None => Some(packet),
        };
        if let Some(packet) = packet {
            self.delivered.lock().push(packet);
        }
    }
}

impl ConnectionPipeline for MemoryPipeline {
    fn splice(&self, interceptor: Arc<PacketInterceptor>) -> Result<(), PipelineError> {
        let mut slot = self.interceptor.write();
        if slot.is_some() {
            return Err(PipelineError::StageExists(INTERCEPTOR_STAGE.to_string()));
        }
        *slot = Some(interceptor);
        Ok(())
    }

    fn unsplice(&self) -> Result<(), PipelineError> {
        self.interceptor.write().take();
        Ok(())
    }

    fn send_raw(&self, packet: Packet) -> Result<(), PipelineError> {
        self.wire.lock().push(packet);
        Ok(())
    }

    fn is_open(&self) -> bool {
        true
    }
}

fn catalog() -> ImplementationCatalog {
    let mut catalog = ImplementationCatalog::new();
    variants::install_builtin(&mut catalog);
    catalog
}

fn boot(build: &str) -> Result<Core, CoreError> {
    let scheduler = Arc::new(TickLoop::spawn(Duration::from_millis(5))?);
    Core::bootstrap(
        BuildIdentity::new(build),
        scheduler,
        catalog(),
        CoreConfig::default(),
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn test_chat_is_cancelled_and_connection_stays_open() {
    let core = boot("git-Paper-196 (MC: 1.20.4)").unwrap();
    core.on_event(
        Some(Direction::Inbound),
        |event| event.is_kind("Chat"),
        |event| {
            event.cancel();
            Ok(())
        },
    );

    let client = ClientId::new();
    let pipeline = Arc::new(MemoryPipeline::default());
    let handle = core.connected(client, pipeline.clone()).unwrap();

    pipeline
        .receive(Packet::from_json(&json!({"type": "Chat", "text": "hi"})))
        .await;
    let movement = Packet::from(r#"{"type":"Move","x":1,"y":2}"#);
    pipeline.receive(movement.clone()).await;

    let delivered = pipeline.delivered.lock().clone();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].as_bytes(), movement.as_bytes());
    assert!(handle.is_open());
    assert!(core.connections().lookup(client).is_some());
    assert_eq!(core.dispatch_stats().cancelled, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_per_connection_order_is_preserved() {
    let core = Arc::new(boot("1.20.4-R0.1-SNAPSHOT").unwrap());
    let seen: Arc<Mutex<Vec<(ClientId, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    core.on_event(None, |_| true, move |event| {
        let seq: u64 = event.field_as("seq")?;
        log.lock().push((event.client(), seq));
        Ok(())
    });

    let mut tasks = Vec::new();
    let mut clients = Vec::new();
    for _ in 0..2 {
        let client = ClientId::new();
        clients.push(client);
        let pipeline = Arc::new(MemoryPipeline::default());
        core.connected(client, pipeline.clone()).unwrap();
        tasks.push(tokio::spawn(async move {
            for seq in 0..50u64 {
                pipeline
                    .receive(Packet::from_json(&json!({"type": "Move", "seq": seq})))
                    .await;
            }
            pipeline.delivered.lock().len()
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), 50);
    }

    let seen = seen.lock();
    assert_eq!(seen.len(), 100);
    for client in clients {
        let order: Vec<u64> = seen
            .iter()
            .filter(|(c, _)| *c == client)
            .map(|(_, seq)| *seq)
            .collect();
        assert_eq!(order, (0..50).collect::<Vec<_>>());
    }
}

#[test]
fn test_unrecognized_build_aborts_startup() {
    let err = boot("9.9.9-mystery").unwrap_err();
    assert_eq!(
        err,
        CoreError::Revision(RevisionError::Unrecognized {
            build: "9.9.9-mystery".to_string()
        })
    );
}

#[test]
fn test_resolve_is_identical_across_threads() {
    let resolver = Arc::new(VersionResolver::new(BuildIdentity::new("1.17.1")));
    let threads: Vec<_> = (0..8)
        .map(|_| {
            let resolver = resolver.clone();
            std::thread::spawn(move || resolver.resolve().unwrap())
        })
        .collect();
    let results: Vec<RevisionTag> = threads.into_iter().map(|t| t.join().unwrap()).collect();
    assert!(results.iter().all(|tag| *tag == V1_17_R1_1));
    assert_eq!(resolver.get(), Some(V1_17_R1_1));
}

#[test]
fn test_unsupported_feature_is_memoized() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let mut catalog = catalog();
    // Count construction attempts for a revision that has a factory.
    catalog.register(
        "v1_8_R3::item::MetaCodec",
        Factory::new(vec![], move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err("codec tables missing".into())
        }),
    );

    let scheduler = Arc::new(TickLoop::spawn(Duration::from_millis(5)).unwrap());
    let core = Core::bootstrap(
        BuildIdentity::new("1.8.8-R0.1-SNAPSHOT"),
        scheduler,
        catalog,
        CoreConfig::default(),
    )
    .unwrap();
    assert_eq!(core.resolve_revision(), V1_8_R3);

    let first = core.feature::<StatusBarFeature>().err().unwrap();
    let second = core.get_feature_implementation("status_bar").unwrap_err();
    assert_eq!(first, second);
    assert_eq!(first.feature(), "status_bar");
    assert_eq!(first.revision(), V1_8_R3);
    assert!(first.to_string().contains("v1_8_R3"));

    core.declare_feature("item_metadata", "{revision}::item::MetaCodec", vec![]);
    let a = core.get_feature_implementation("item_metadata").unwrap_err();
    let b = core.get_feature_implementation("item_metadata").unwrap_err();
    assert_eq!(a, b);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    // Other features keep working.
    assert!(core.feature::<MenuFeature>().is_ok());
}

#[test]
fn test_override_selects_sub_release_variant() {
    let plain = boot("1.17-R0.1-SNAPSHOT").unwrap();
    assert_eq!(plain.resolve_revision(), V1_17_R1);
    let text = plain.feature::<FloatingTextFeature>().unwrap();
    assert_eq!(text.despawn(&[1, 2]).len(), 2);

    let patched = boot("git-Paper-100 (MC: 1.17.1)").unwrap();
    assert_eq!(patched.resolve_revision(), V1_17_R1_1);
    let text = patched.feature::<FloatingTextFeature>().unwrap();
    assert_eq!(text.despawn(&[1, 2]).len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_duplicate_connect_and_idempotent_disconnect() {
    let core = boot("1.20.4").unwrap();
    let client = ClientId::new();
    core.connected(client, Arc::new(MemoryPipeline::default()))
        .unwrap();
    assert_eq!(
        core.connected(client, Arc::new(MemoryPipeline::default()))
            .unwrap_err(),
        ConnectionError::DuplicateConnectionRegistration(client)
    );

    assert!(core.disconnected(client));
    assert!(!core.disconnected(client));
    assert!(core.connections().lookup(client).is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_send_bypasses_consumers() {
    let core = boot("1.20.4").unwrap();
    let consumed = Arc::new(AtomicUsize::new(0));
    let counter = consumed.clone();
    core.on_event(None, |_| true, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let client = ClientId::new();
    let pipeline = Arc::new(MemoryPipeline::default());
    core.connected(client, pipeline.clone()).unwrap();

    let title = core.feature::<TitleFeature>().unwrap();
    let sent = core
        .send(client, title.show("Hello", "world", TitleTimes::default()))
        .unwrap();
    assert_eq!(sent, 3);
    assert_eq!(pipeline.wire.lock().len(), 3);
    assert_eq!(consumed.load(Ordering::SeqCst), 0);

    let stranger = ClientId::new();
    assert_eq!(
        core.send(stranger, Vec::new()),
        Err(ConnectionError::NotConnected(stranger))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timeout_forwards_message() {
    let scheduler = Arc::new(TickLoop::spawn(Duration::from_millis(5)).unwrap());
    let config = CoreConfig {
        dispatcher: DispatcherConfig {
            timeout: Duration::from_millis(50),
            timeout_policy: TimeoutPolicy::Forward,
        },
        ..Default::default()
    };
    let core = Core::bootstrap(BuildIdentity::new("1.20.4"), scheduler, catalog(), config).unwrap();
    core.on_event(None, |_| true, |event| {
        std::thread::sleep(Duration::from_millis(200));
        event.cancel();
        Ok(())
    });

    let pipeline = Arc::new(MemoryPipeline::default());
    core.connected(ClientId::new(), pipeline.clone()).unwrap();
    pipeline.receive(Packet::from(r#"{"type":"Chat"}"#)).await;

    assert_eq!(pipeline.delivered.lock().len(), 1);
    assert_eq!(core.dispatch_stats().timed_out, 1);
}
