// SPDX-License-Identifier: MIT OR Apache-2.0
//! Service lifecycle and dispatch over the in-memory broker.

use intersect_broker::{BrokerClient, BrokerEndpoint, Credentials, MemoryHub};
use intersect_config::{
    BrokerProtocol, BrokerSelection, ControlPlaneConfig, DataStoreConfigMap, ServiceConfig,
};
use intersect_core::{
    ErrorRecord, Hierarchy, LifecycleMessage, LifecycleType, UserspaceMessage,
    UserspaceMessageOptions, WireErrorCode,
};
use intersect_schema::{Capability, CapabilityBuilder, OperationOptions};
use intersect_service::{IntersectService, LifecycleState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const SERVICE_NAME: &str = "test-org.test-fac.test-sys.test-sub.test-svc";
const CLIENT_NAME: &str = "client-org.client-fac.client-sys.probe";

fn hello_capability() -> Capability {
    CapabilityBuilder::new("HelloExample")
        .status::<String, _>(|| "Up".to_string())
        .operation::<String, String, _>(
            "say_hello_to_name",
            OperationOptions::default(),
            |_, name| Ok(format!("Hello, {name}!")),
        )
        .build()
        .unwrap()
}

fn config() -> ServiceConfig {
    ServiceConfig {
        hierarchy: Hierarchy::parse(SERVICE_NAME).unwrap(),
        brokers: BrokerSelection::List(vec![ControlPlaneConfig {
            protocol: BrokerProtocol::Mqtt311,
            host: "127.0.0.1".into(),
            port: 1883,
            username: "u".into(),
            password: "p".into(),
        }]),
        data_stores: DataStoreConfigMap::default(),
        status_interval: 30.0,
        schema_version: None,
    }
}

async fn probe_client(hub: &MemoryHub) -> Arc<intersect_broker::MemoryBroker> {
    let client = Arc::new(hub.client());
    client
        .connect(
            &BrokerEndpoint {
                host: "127.0.0.1".into(),
                port: 1883,
            },
            &Credentials {
                username: "u".into(),
                password: "p".into(),
            },
        )
        .await
        .unwrap();
    client
}

async fn subscribe_bytes(
    client: &Arc<intersect_broker::MemoryBroker>,
    pattern: &str,
) -> mpsc::UnboundedReceiver<Vec<u8>> {
    let (tx, rx) = mpsc::unbounded_channel();
    client
        .subscribe(pattern, Arc::new(move |m| drop(tx.send(m.payload))))
        .await
        .unwrap();
    rx
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<u8> {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no message within 2s")
        .expect("channel closed")
}

#[tokio::test]
async fn startup_reaches_ready_and_publishes_startup() {
    let hub = MemoryHub::new();
    let probe = probe_client(&hub).await;
    let mut lifecycle_rx =
        subscribe_bytes(&probe, "test-org/test-fac/test-sys/test-sub/test-svc/lifecycle").await;

    let service =
        IntersectService::new(vec![hello_capability()], config(), Arc::new(hub.client())).unwrap();
    assert_eq!(service.state(), LifecycleState::New);
    service.startup().await.unwrap();
    assert_eq!(service.state(), LifecycleState::Ready);

    let startup = LifecycleMessage::deserialize_and_validate(&recv(&mut lifecycle_rx).await).unwrap();
    assert_eq!(startup.headers.lifecycle_type, LifecycleType::Startup);
    assert_eq!(startup.headers.source, SERVICE_NAME);
    let schema: serde_json::Value = serde_json::from_slice(&startup.payload).unwrap();
    assert_eq!(schema["service"], SERVICE_NAME);
    assert!(schema["capabilities"]["HelloExample"]["operations"]["say_hello_to_name"].is_object());

    service.shutdown().await;
    assert_eq!(service.state(), LifecycleState::Stopped);
    let shutdown = LifecycleMessage::deserialize_and_validate(&recv(&mut lifecycle_rx).await).unwrap();
    assert_eq!(shutdown.headers.lifecycle_type, LifecycleType::Shutdown);
}

#[tokio::test]
async fn dispatches_and_replies() {
    let hub = MemoryHub::new();
    let probe = probe_client(&hub).await;
    let mut reply_rx =
        subscribe_bytes(&probe, "client-org/client-fac/client-sys/-/probe/reply").await;

    let service =
        IntersectService::new(vec![hello_capability()], config(), Arc::new(hub.client())).unwrap();
    service.startup().await.unwrap();

    let request = UserspaceMessage::create(
        CLIENT_NAME,
        SERVICE_NAME,
        "HelloExample.say_hello_to_name",
        b"\"world\"".to_vec(),
        UserspaceMessageOptions::default(),
    );
    probe
        .publish(
            "test-org/test-fac/test-sys/test-sub/test-svc/userspace",
            &request.serialize().unwrap(),
            &std::collections::BTreeMap::new(),
            "application/json",
        )
        .await
        .unwrap();

    let reply = UserspaceMessage::deserialize_and_validate(&recv(&mut reply_rx).await).unwrap();
    assert!(!reply.headers.has_error);
    assert_eq!(reply.payload, b"\"Hello, world!\"");
    assert_eq!(reply.headers.request_id, Some(request.message_id));
    assert_eq!(reply.headers.source, SERVICE_NAME);

    service.shutdown().await;
}

#[tokio::test]
async fn unknown_operation_and_version_mismatch_replies() {
    let hub = MemoryHub::new();
    let probe = probe_client(&hub).await;
    let mut reply_rx =
        subscribe_bytes(&probe, "client-org/client-fac/client-sys/-/probe/reply").await;

    let service =
        IntersectService::new(vec![hello_capability()], config(), Arc::new(hub.client())).unwrap();
    service.startup().await.unwrap();

    let request = UserspaceMessage::create(
        CLIENT_NAME,
        SERVICE_NAME,
        "HelloExample.no_such_operation",
        b"null".to_vec(),
        UserspaceMessageOptions::default(),
    );
    probe
        .publish(
            "test-org/test-fac/test-sys/test-sub/test-svc/userspace",
            &request.serialize().unwrap(),
            &std::collections::BTreeMap::new(),
            "application/json",
        )
        .await
        .unwrap();
    let reply = UserspaceMessage::deserialize_and_validate(&recv(&mut reply_rx).await).unwrap();
    assert!(reply.headers.has_error);
    let record = ErrorRecord::from_payload(&reply.payload).unwrap();
    assert_eq!(record.code, WireErrorCode::UnknownOperation);

    // a peer one major version ahead gets a version-incompat reply
    let mut request = UserspaceMessage::create(
        CLIENT_NAME,
        SERVICE_NAME,
        "HelloExample.say_hello_to_name",
        b"\"world\"".to_vec(),
        UserspaceMessageOptions::default(),
    );
    let (major, minor, patch) = intersect_core::version_info();
    request.headers.sdk_version = format!("{}.{minor}.{patch}", major + 1);
    probe
        .publish(
            "test-org/test-fac/test-sys/test-sub/test-svc/userspace",
            &request.serialize().unwrap(),
            &std::collections::BTreeMap::new(),
            "application/json",
        )
        .await
        .unwrap();
    let reply = UserspaceMessage::deserialize_and_validate(&recv(&mut reply_rx).await).unwrap();
    assert!(reply.headers.has_error);
    let record = ErrorRecord::from_payload(&reply.payload).unwrap();
    assert_eq!(record.code, WireErrorCode::VersionIncompat);

    service.shutdown().await;
}

#[tokio::test]
async fn schema_request_elicits_schema_response() {
    let hub = MemoryHub::new();
    let probe = probe_client(&hub).await;
    let mut lifecycle_rx =
        subscribe_bytes(&probe, "client-org/client-fac/client-sys/-/probe/lifecycle").await;

    let service =
        IntersectService::new(vec![hello_capability()], config(), Arc::new(hub.client())).unwrap();
    service.startup().await.unwrap();

    let request = LifecycleMessage::create(
        CLIENT_NAME,
        Some(SERVICE_NAME.to_string()),
        LifecycleType::SchemaRequest,
        b"null".to_vec(),
    );
    probe
        .publish(
            "test-org/test-fac/test-sys/test-sub/test-svc/lifecycle",
            &request.serialize().unwrap(),
            &std::collections::BTreeMap::new(),
            "application/json",
        )
        .await
        .unwrap();

    let response = LifecycleMessage::deserialize_and_validate(&recv(&mut lifecycle_rx).await).unwrap();
    assert_eq!(response.headers.lifecycle_type, LifecycleType::SchemaResponse);
    assert_eq!(response.headers.destination.as_deref(), Some(CLIENT_NAME));
    let schema: serde_json::Value = serde_json::from_slice(&response.payload).unwrap();
    assert_eq!(schema["service"], SERVICE_NAME);

    service.shutdown().await;
}

#[tokio::test]
async fn duplicate_deliveries_are_suppressed() {
    let hub = MemoryHub::new();
    let probe = probe_client(&hub).await;
    let mut reply_rx =
        subscribe_bytes(&probe, "client-org/client-fac/client-sys/-/probe/reply").await;

    let service =
        IntersectService::new(vec![hello_capability()], config(), Arc::new(hub.client())).unwrap();
    service.startup().await.unwrap();

    let request = UserspaceMessage::create(
        CLIENT_NAME,
        SERVICE_NAME,
        "HelloExample.say_hello_to_name",
        b"\"twice\"".to_vec(),
        UserspaceMessageOptions::default(),
    );
    let bytes = request.serialize().unwrap();
    for _ in 0..2 {
        probe
            .publish(
                "test-org/test-fac/test-sys/test-sub/test-svc/userspace",
                &bytes,
                &std::collections::BTreeMap::new(),
                "application/json",
            )
            .await
            .unwrap();
    }

    let _first = recv(&mut reply_rx).await;
    let second = tokio::time::timeout(Duration::from_millis(300), reply_rx.recv()).await;
    assert!(second.is_err(), "duplicate delivery produced a second reply");

    service.shutdown().await;
}
