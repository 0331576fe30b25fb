//! End-to-end tests over complete protocol stacks.
//!
//! Each "stack" is a certificate store, a device registry, and a link
//! provider, wired the way an application would wire them. Most tests run
//! two stacks against each other over the in-process loopback provider;
//! the last one uses the LAN provider with real TLS over 127.0.0.1.

use async_trait::async_trait;
use kdeconnect_link::certstore::verification_key;
use kdeconnect_link::{
    CertificateStore, DeviceInfo, DeviceRegistry, DeviceType, LanProvider, LanProviderConfig,
    LinkProvider, LocalIdentity, LoopbackProvider, Packet, PairingConfig, PairingEvent,
    PairingFailure, Plugin, PluginContext, PluginFactory, PluginRegistry, RegistryConfig,
    RegistryEvent, Result,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_test::assert_ok;

const PING: &str = "kdeconnect.ping";

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Plugin that forwards every received packet to a test channel
struct RecorderPlugin {
    tx: mpsc::UnboundedSender<Packet>,
}

#[async_trait]
impl Plugin for RecorderPlugin {
    fn name(&self) -> &'static str {
        "recorder"
    }
    fn incoming_capabilities(&self) -> Vec<String> {
        vec![PING.to_string()]
    }
    fn outgoing_capabilities(&self) -> Vec<String> {
        vec![PING.to_string()]
    }
    fn listens_to_unpaired(&self) -> bool {
        true
    }
    async fn handle_packet(&mut self, packet: &Packet, _ctx: &PluginContext) -> Result<()> {
        let _ = self.tx.send(packet.clone());
        Ok(())
    }
}

struct RecorderFactory {
    tx: mpsc::UnboundedSender<Packet>,
}

impl PluginFactory for RecorderFactory {
    fn name(&self) -> &'static str {
        "recorder"
    }
    fn incoming_capabilities(&self) -> Vec<String> {
        vec![PING.to_string()]
    }
    fn outgoing_capabilities(&self) -> Vec<String> {
        vec![PING.to_string()]
    }
    fn create(&self) -> Box<dyn Plugin> {
        Box::new(RecorderPlugin {
            tx: self.tx.clone(),
        })
    }
}

struct Stack {
    registry: Arc<DeviceRegistry>,
    events: mpsc::UnboundedReceiver<RegistryEvent>,
    provider: LoopbackProvider,
    store: Arc<CertificateStore>,
    identity: LocalIdentity,
    device_id: String,
    received: mpsc::UnboundedReceiver<Packet>,
    dir: TempDir,
}

async fn stack(name: &str) -> Stack {
    stack_with(name, PairingConfig::default()).await
}

async fn stack_with(name: &str, pairing: PairingConfig) -> Stack {
    init_logging();
    let dir = TempDir::new().unwrap();
    let store = Arc::new(CertificateStore::open(dir.path()).unwrap());
    let info = DeviceInfo::new(name, DeviceType::Desktop)
        .with_capabilities(vec![PING.to_string()], vec![PING.to_string()]);
    let device_id = info.device_id.clone();
    let identity = store.ensure_local_identity(&device_id).unwrap();

    let (received_tx, received) = mpsc::unbounded_channel();
    let mut plugins = PluginRegistry::new();
    plugins.register(Arc::new(RecorderFactory { tx: received_tx }));

    let config = RegistryConfig {
        pairing,
        ..Default::default()
    };
    let (registry, events) = DeviceRegistry::new(store.clone(), identity.clone(), plugins, config);

    let provider = LoopbackProvider::new(identity.clone(), info);
    provider.start(registry.provider_events()).await.unwrap();

    Stack {
        registry,
        events,
        provider,
        store,
        identity,
        device_id,
        received,
        dir,
    }
}

async fn expect_event(
    events: &mut mpsc::UnboundedReceiver<RegistryEvent>,
    pred: impl Fn(&RegistryEvent) -> bool,
) -> RegistryEvent {
    loop {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for registry event")
            .expect("registry event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

async fn connect(a: &mut Stack, b: &mut Stack) {
    LoopbackProvider::connect(&a.provider, &b.provider)
        .await
        .unwrap();
    expect_event(&mut a.events, |e| {
        matches!(e, RegistryEvent::DeviceReachable { .. })
    })
    .await;
    expect_event(&mut b.events, |e| {
        matches!(e, RegistryEvent::DeviceReachable { .. })
    })
    .await;
}

/// Pair two connected stacks: a requests, b accepts.
async fn pair(a: &mut Stack, b: &mut Stack) {
    let device_b = a.registry.device(&b.device_id).await.unwrap();
    assert_ok!(device_b.request_pairing().await);

    expect_event(&mut b.events, |e| {
        matches!(
            e,
            RegistryEvent::Pairing(PairingEvent::RequestReceived { .. })
        )
    })
    .await;

    let device_a = b.registry.device(&a.device_id).await.unwrap();
    device_a.accept_pairing().await.unwrap();

    expect_event(&mut a.events, |e| {
        matches!(e, RegistryEvent::Pairing(PairingEvent::PairingDone { .. }))
    })
    .await;
    expect_event(&mut b.events, |e| {
        matches!(e, RegistryEvent::Pairing(PairingEvent::PairingDone { .. }))
    })
    .await;
}

#[tokio::test]
async fn identity_packets_accept_string_and_numeric_ids() {
    // Both id encodings appear in the wild
    let numeric = br#"{"id":1234,"type":"kdeconnect.ping","body":{}}
"#;
    let string = br#"{"id":"1234","type":"kdeconnect.ping","body":{}}
"#;

    let a = Packet::from_bytes(numeric).unwrap();
    let b = Packet::from_bytes(string).unwrap();
    assert_eq!(a.id, 1234);
    assert_eq!(b.id, 1234);

    // Frames are newline-terminated single-line JSON
    let bytes = a.to_bytes().unwrap();
    assert_eq!(*bytes.last().unwrap(), b'\n');
    assert!(!bytes[..bytes.len() - 1].contains(&b'\n'));
}

#[tokio::test]
async fn ping_crosses_two_full_stacks() {
    let mut a = stack("Alpha").await;
    let mut b = stack("Beta").await;
    connect(&mut a, &mut b).await;

    let device_b = a.registry.device(&b.device_id).await.unwrap();
    assert_ok!(
        device_b
            .send_packet(&Packet::new(PING, json!({"message": "hello"})))
            .await
    );

    let got = timeout(Duration::from_secs(5), b.received.recv())
        .await
        .expect("ping never arrived")
        .unwrap();
    assert_eq!(got.packet_type, PING);
    assert_eq!(got.string("message"), Some("hello".to_string()));
}

#[tokio::test]
async fn pairing_pins_certificates_on_both_sides() {
    let mut a = stack("Alpha").await;
    let mut b = stack("Beta").await;
    connect(&mut a, &mut b).await;

    let device_b = a.registry.device(&b.device_id).await.unwrap();
    device_b.request_pairing().await.unwrap();

    // The key shown to b's user matches the one computed from the two
    // certificates directly, so both screens show the same digits
    let event = expect_event(&mut b.events, |e| {
        matches!(
            e,
            RegistryEvent::Pairing(PairingEvent::RequestReceived { .. })
        )
    })
    .await;
    let RegistryEvent::Pairing(PairingEvent::RequestReceived {
        verification_key: shown,
        ..
    }) = event
    else {
        unreachable!()
    };
    let expected = verification_key(&a.identity.certificate, &b.identity.certificate).unwrap();
    assert_eq!(shown, expected);

    let device_a = b.registry.device(&a.device_id).await.unwrap();
    device_a.accept_pairing().await.unwrap();

    expect_event(&mut a.events, |e| {
        matches!(e, RegistryEvent::Pairing(PairingEvent::PairingDone { .. }))
    })
    .await;

    assert!(device_b.is_paired().await);
    assert!(device_a.is_paired().await);
    assert!(a.store.is_trusted(&b.device_id));
    assert!(b.store.is_trusted(&a.device_id));

    // Pinned certificates are the ones from the links, crossed over
    assert_eq!(
        a.store.trusted_certificate(&b.device_id).unwrap(),
        Some(b.identity.certificate.clone())
    );
    assert_eq!(
        b.store.trusted_certificate(&a.device_id).unwrap(),
        Some(a.identity.certificate.clone())
    );
}

#[tokio::test]
async fn simultaneous_requests_converge_to_paired() {
    let mut a = stack("Alpha").await;
    let mut b = stack("Beta").await;
    connect(&mut a, &mut b).await;

    let device_b = a.registry.device(&b.device_id).await.unwrap();
    let device_a = b.registry.device(&a.device_id).await.unwrap();

    // Both sides ask at once; crossing requests count as mutual consent
    device_b.request_pairing().await.unwrap();
    device_a.request_pairing().await.unwrap();

    expect_event(&mut a.events, |e| {
        matches!(e, RegistryEvent::Pairing(PairingEvent::PairingDone { .. }))
    })
    .await;
    expect_event(&mut b.events, |e| {
        matches!(e, RegistryEvent::Pairing(PairingEvent::PairingDone { .. }))
    })
    .await;

    assert!(device_b.is_paired().await);
    assert!(device_a.is_paired().await);
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let mut a = stack_with(
        "Alpha",
        PairingConfig {
            timeout: Duration::from_millis(300),
        },
    )
    .await;
    let mut b = stack("Beta").await;
    connect(&mut a, &mut b).await;

    let device_b = a.registry.device(&b.device_id).await.unwrap();
    device_b.request_pairing().await.unwrap();

    // Beta's user never answers
    let event = expect_event(&mut a.events, |e| {
        matches!(e, RegistryEvent::Pairing(PairingEvent::PairingFailed { .. }))
    })
    .await;
    let RegistryEvent::Pairing(PairingEvent::PairingFailed { reason, .. }) = event else {
        unreachable!()
    };
    assert_eq!(reason, PairingFailure::Timeout);
    assert!(!device_b.is_paired().await);
    assert!(!a.store.is_trusted(&b.device_id));
}

#[tokio::test]
async fn rejected_request_fails_cleanly() {
    let mut a = stack("Alpha").await;
    let mut b = stack("Beta").await;
    connect(&mut a, &mut b).await;

    let device_b = a.registry.device(&b.device_id).await.unwrap();
    device_b.request_pairing().await.unwrap();

    expect_event(&mut b.events, |e| {
        matches!(
            e,
            RegistryEvent::Pairing(PairingEvent::RequestReceived { .. })
        )
    })
    .await;
    let device_a = b.registry.device(&a.device_id).await.unwrap();
    device_a.reject_pairing().await.unwrap();

    let event = expect_event(&mut a.events, |e| {
        matches!(e, RegistryEvent::Pairing(PairingEvent::PairingFailed { .. }))
    })
    .await;
    let RegistryEvent::Pairing(PairingEvent::PairingFailed { reason, .. }) = event else {
        unreachable!()
    };
    assert_eq!(reason, PairingFailure::RejectedByPeer);
    assert!(!device_b.is_paired().await);
}

#[tokio::test]
async fn unpair_propagates_and_revokes_trust() {
    let mut a = stack("Alpha").await;
    let mut b = stack("Beta").await;
    connect(&mut a, &mut b).await;
    pair(&mut a, &mut b).await;

    let device_b = a.registry.device(&b.device_id).await.unwrap();
    device_b.unpair().await.unwrap();

    expect_event(&mut a.events, |e| {
        matches!(e, RegistryEvent::Pairing(PairingEvent::Unpaired { .. }))
    })
    .await;
    expect_event(&mut b.events, |e| {
        matches!(e, RegistryEvent::Pairing(PairingEvent::Unpaired { .. }))
    })
    .await;

    assert!(!a.store.is_trusted(&b.device_id));
    assert!(!b.store.is_trusted(&a.device_id));
}

#[tokio::test]
async fn trust_survives_restart() {
    let mut a = stack("Alpha").await;
    let mut b = stack("Beta").await;
    connect(&mut a, &mut b).await;
    pair(&mut a, &mut b).await;

    let a_dir = a.dir;
    let b_device_id = b.device_id.clone();
    let a_device_id = a.device_id.clone();
    drop(a.registry);
    drop(b);

    // A fresh stack over the same state directory comes up already paired
    let store = Arc::new(CertificateStore::open(a_dir.path()).unwrap());
    assert!(store.is_trusted(&b_device_id));

    let identity = store.ensure_local_identity(&a_device_id).unwrap();
    let (registry, mut events) = DeviceRegistry::new(
        store,
        identity,
        PluginRegistry::with_defaults(),
        RegistryConfig::default(),
    );
    registry.load_trusted_devices().await.unwrap();

    expect_event(&mut events, |e| {
        matches!(e, RegistryEvent::DeviceAdded { device_id } if *device_id == b_device_id)
    })
    .await;

    let device = registry.device(&b_device_id).await.unwrap();
    assert!(device.is_paired().await);
    assert!(!device.is_reachable().await);
}

#[tokio::test]
async fn lan_provider_pairs_over_real_tls() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let store_a = Arc::new(CertificateStore::open(dir_a.path()).unwrap());
    let store_b = Arc::new(CertificateStore::open(dir_b.path()).unwrap());

    let info_a = DeviceInfo::new("Alpha", DeviceType::Desktop)
        .with_capabilities(vec![PING.to_string()], vec![PING.to_string()]);
    let info_b = DeviceInfo::new("Beta", DeviceType::Laptop)
        .with_capabilities(vec![PING.to_string()], vec![PING.to_string()]);
    let id_a = info_a.device_id.clone();
    let id_b = info_b.device_id.clone();

    let identity_a = store_a.ensure_local_identity(&id_a).unwrap();
    let identity_b = store_b.ensure_local_identity(&id_b).unwrap();

    let (registry_a, mut events_a) = DeviceRegistry::new(
        store_a.clone(),
        identity_a.clone(),
        PluginRegistry::with_defaults(),
        RegistryConfig::default(),
    );
    let (registry_b, mut events_b) = DeviceRegistry::new(
        store_b.clone(),
        identity_b.clone(),
        PluginRegistry::with_defaults(),
        RegistryConfig::default(),
    );

    let lan_config = LanProviderConfig {
        enable_broadcast: false,
        ..Default::default()
    };
    let lan_a = LanProvider::new(identity_a, info_a, store_a.clone(), lan_config.clone());
    let lan_b = LanProvider::new(identity_b, info_b, store_b.clone(), lan_config);
    lan_a.start(registry_a.provider_events()).await.unwrap();
    lan_b.start(registry_b.provider_events()).await.unwrap();

    let b_port = lan_b.tcp_port().await.unwrap();
    lan_a
        .connect(format!("127.0.0.1:{}", b_port).parse().unwrap())
        .await
        .unwrap();

    expect_event(&mut events_a, |e| {
        matches!(e, RegistryEvent::DeviceReachable { device_id } if *device_id == id_b)
    })
    .await;
    expect_event(&mut events_b, |e| {
        matches!(e, RegistryEvent::DeviceReachable { device_id } if *device_id == id_a)
    })
    .await;

    // Pair over the TLS link; the pinned certificates must be the ones
    // TLS actually presented
    let device_b = registry_a.device(&id_b).await.unwrap();
    device_b.request_pairing().await.unwrap();

    expect_event(&mut events_b, |e| {
        matches!(
            e,
            RegistryEvent::Pairing(PairingEvent::RequestReceived { .. })
        )
    })
    .await;
    let device_a = registry_b.device(&id_a).await.unwrap();
    device_a.accept_pairing().await.unwrap();

    expect_event(&mut events_a, |e| {
        matches!(e, RegistryEvent::Pairing(PairingEvent::PairingDone { .. }))
    })
    .await;

    assert!(store_a.is_trusted(&id_b));
    assert!(store_b.is_trusted(&id_a));

    lan_a.stop().await;
    lan_b.stop().await;
}
