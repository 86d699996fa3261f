// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end scenarios over the in-memory broker: a service and a client
//! (or two services) exchanging real envelopes through the full dispatch,
//! emitter, and bookkeeping paths.

use intersect_sdk::client::{ClientLoopExit, IntersectClient};
use intersect_sdk::config::{
    BrokerProtocol, BrokerSelection, ClientCallbackConfig, ClientConfig, ControlPlaneConfig,
    DataStoreConfigMap, ServiceConfig,
};
use intersect_sdk::schema::{HandlerResult, ServiceResponse};
use intersect_sdk::{
    Capability, CapabilityBuilder, DirectMessageParams, ErrorRecord, EventOptions, Hierarchy,
    IntersectService, MemoryHub, OperationOptions, WireErrorCode,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

fn brokers() -> BrokerSelection {
    BrokerSelection::List(vec![ControlPlaneConfig {
        protocol: BrokerProtocol::Mqtt311,
        host: "127.0.0.1".into(),
        port: 1883,
        username: "intersect_username".into(),
        password: "intersect_password".into(),
    }])
}

fn service_config(name: &str) -> ServiceConfig {
    ServiceConfig {
        hierarchy: Hierarchy::parse(name).unwrap(),
        brokers: brokers(),
        data_stores: DataStoreConfigMap::default(),
        status_interval: 30.0,
        schema_version: None,
    }
}

fn client_config(initial: ClientCallbackConfig) -> ClientConfig {
    ClientConfig {
        brokers: brokers(),
        initial_message_event_config: initial,
    }
}

async fn start_service(hub: &MemoryHub, name: &str, capability: Capability) -> IntersectService {
    let service =
        IntersectService::new(vec![capability], service_config(name), Arc::new(hub.client()))
            .unwrap();
    service.startup().await.unwrap();
    service
}

// ── Scenario: hello round trip ─────────────────────────────────────────

#[tokio::test]
async fn hello_round_trip_within_two_seconds() {
    let hub = MemoryHub::new();
    let service_name =
        "hello-organization.hello-facility.hello-system.hello-subsystem.hello-service";
    let capability = CapabilityBuilder::new("HelloExample")
        .status::<String, _>(|| "Up".to_string())
        .operation::<String, String, _>(
            "say_hello_to_name",
            OperationOptions::default(),
            |_, name| Ok(format!("Hello, {name}!")),
        )
        .build()
        .unwrap();
    let service = start_service(&hub, service_name, capability).await;

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let on_response: Arc<intersect_sdk::client::ResponseCallback> = Arc::new(
        move |_source: &str, _operation: &str, has_error: bool, payload: serde_json::Value| {
            assert!(!has_error);
            let _ = tx.send(payload.as_str().unwrap_or_default().to_string());
            Err(ClientLoopExit)
        },
    );
    let client = IntersectClient::new(
        client_config(ClientCallbackConfig {
            messages_to_send: vec![DirectMessageParams::new(
                service_name,
                "HelloExample.say_hello_to_name",
                json!("world"),
            )],
            ..ClientCallbackConfig::default()
        }),
        Arc::new(hub.client()),
        Some(on_response),
        None,
    )
    .unwrap();
    client.startup().await.unwrap();

    let greeting = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no reply within 2s")
        .unwrap();
    assert_eq!(greeting, "Hello, world!");

    client.wait_until_terminated().await;
    client.shutdown().await;
    service.shutdown().await;
}

// ── Scenario: stateful counter ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct CounterState {
    count: u32,
    counting: bool,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct CounterResponse {
    state: CounterState,
    success: bool,
}

struct Counter {
    count: AtomicU32,
    counting: AtomicBool,
}

impl Counter {
    fn snapshot(&self) -> CounterState {
        CounterState {
            count: self.count.load(Ordering::SeqCst),
            counting: self.counting.load(Ordering::SeqCst),
        }
    }
}

fn counting_capability(counter: Arc<Counter>) -> Capability {
    let status_counter = Arc::clone(&counter);
    let start_counter = Arc::clone(&counter);
    let stop_counter = Arc::clone(&counter);
    CapabilityBuilder::new("CountingExample")
        .status::<CounterState, _>(move || status_counter.snapshot())
        .operation::<(), CounterResponse, _>(
            "start_count",
            OperationOptions::default(),
            move |_, ()| -> HandlerResult<CounterResponse> {
                if start_counter.counting.swap(true, Ordering::SeqCst) {
                    return Ok(CounterResponse {
                        state: start_counter.snapshot(),
                        success: false,
                    });
                }
                let ticker = Arc::clone(&start_counter);
                std::thread::spawn(move || {
                    while ticker.counting.load(Ordering::SeqCst) {
                        ticker.count.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(100));
                    }
                });
                Ok(CounterResponse {
                    state: start_counter.snapshot(),
                    success: true,
                })
            },
        )
        .operation::<(), CounterResponse, _>(
            "stop_count",
            OperationOptions::default(),
            move |_, ()| -> HandlerResult<CounterResponse> {
                let was_counting = stop_counter.counting.swap(false, Ordering::SeqCst);
                Ok(CounterResponse {
                    state: stop_counter.snapshot(),
                    success: was_counting,
                })
            },
        )
        .build()
        .unwrap()
}

#[tokio::test]
async fn counter_starts_and_stops() {
    let hub = MemoryHub::new();
    let service_name = "counting-organization.counting-facility.counting-system.counting-service";
    let counter = Arc::new(Counter {
        count: AtomicU32::new(0),
        counting: AtomicBool::new(false),
    });
    let service =
        start_service(&hub, service_name, counting_capability(Arc::clone(&counter))).await;

    let (tx, mut rx) = mpsc::unbounded_channel::<(String, CounterResponse)>();
    let stack = Arc::new(Mutex::new(vec![DirectMessageParams::new(
        service_name,
        "CountingExample.stop_count",
        json!(null),
    )]));
    let on_response: Arc<intersect_sdk::client::ResponseCallback> = Arc::new(
        move |_source: &str, operation: &str, has_error: bool, payload: serde_json::Value| {
            assert!(!has_error, "unexpected error reply: {payload}");
            let response: CounterResponse = serde_json::from_value(payload).unwrap();
            let _ = tx.send((operation.to_string(), response));
            let next = stack.lock().unwrap().pop();
            match next {
                Some(message) => {
                    // let the counter run before stopping it
                    std::thread::sleep(Duration::from_millis(550));
                    Ok(Some(ClientCallbackConfig {
                        messages_to_send: vec![message],
                        ..ClientCallbackConfig::default()
                    }))
                }
                None => Err(ClientLoopExit),
            }
        },
    );
    let client = IntersectClient::new(
        client_config(ClientCallbackConfig {
            messages_to_send: vec![DirectMessageParams::new(
                service_name,
                "CountingExample.start_count",
                json!(null),
            )],
            ..ClientCallbackConfig::default()
        }),
        Arc::new(hub.client()),
        Some(on_response),
        None,
    )
    .unwrap();
    client.startup().await.unwrap();

    let (operation, started) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no start_count reply")
        .unwrap();
    assert_eq!(operation, "CountingExample.start_count");
    assert!(started.success);
    assert!(started.state.counting);

    let (operation, stopped) = tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("no stop_count reply")
        .unwrap();
    assert_eq!(operation, "CountingExample.stop_count");
    assert!(stopped.success);
    assert!(!stopped.state.counting);
    assert!(
        (1..=10).contains(&stopped.state.count),
        "count was {}",
        stopped.state.count
    );

    client.shutdown().await;
    service.shutdown().await;
}

// ── Scenario: event subscription ───────────────────────────────────────

#[tokio::test]
async fn subscribed_client_receives_ping_events() {
    let hub = MemoryHub::new();
    let service_name = "ping-organization.ping-facility.ping-system.ping-service";
    let capability = CapabilityBuilder::new("PingExample")
        .status::<String, _>(|| "Up".to_string())
        .event::<String>("ping", EventOptions::default())
        .operation::<(), (), _>(
            "start_pinging",
            OperationOptions::with_events(["ping"]),
            |ctx, ()| -> HandlerResult<()> {
                let emit_ctx = ctx.clone();
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        emit_ctx.emit_event("ping", &"ping".to_string());
                        std::thread::sleep(Duration::from_millis(150));
                    }
                });
                Ok(())
            },
        )
        .build()
        .unwrap();
    let service = start_service(&hub, service_name, capability).await;

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let received = Arc::new(AtomicU32::new(0));
    let on_event: Arc<intersect_sdk::client::EventCallback> = Arc::new(
        move |_source: &str, capability: &str, event: &str, payload: serde_json::Value| {
            assert_eq!(capability, "PingExample");
            assert_eq!(event, "ping");
            let _ = tx.send(payload.as_str().unwrap_or_default().to_string());
            if received.fetch_add(1, Ordering::SeqCst) + 1 >= 2 {
                Err(ClientLoopExit)
            } else {
                Ok(None)
            }
        },
    );
    let client = IntersectClient::new(
        client_config(ClientCallbackConfig {
            messages_to_send: vec![DirectMessageParams::new(
                service_name,
                "PingExample.start_pinging",
                json!(null),
            )],
            services_to_start_listening_for_events: vec![service_name.to_string()],
            ..ClientCallbackConfig::default()
        }),
        Arc::new(hub.client()),
        None,
        Some(on_event),
    )
    .unwrap();
    client.startup().await.unwrap();

    for _ in 0..2 {
        let payload = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no ping event")
            .unwrap();
        assert_eq!(payload, "ping");
    }

    client.wait_until_terminated().await;
    client.shutdown().await;
    service.shutdown().await;
}

// ── Scenario: service-to-service with response event ───────────────────

#[tokio::test]
async fn service_forwards_to_peer_and_emits_response_event() {
    let hub = MemoryHub::new();
    let one = "example-organization.example-facility.example-system.example-subsystem.service-one";
    let two = "example-organization.example-facility.example-system.example-subsystem.service-two";

    let service_two = start_service(
        &hub,
        two,
        CapabilityBuilder::new("ServiceTwo")
            .status::<String, _>(|| "Up".to_string())
            .operation::<String, String, _>(
                "test_service",
                OperationOptions::default(),
                |_, text| Ok(format!("Service 2 received: {text}")),
            )
            .build()
            .unwrap(),
    )
    .await;

    let two_name = two.to_string();
    let service_one = start_service(
        &hub,
        one,
        CapabilityBuilder::new("ServiceOne")
            .status::<String, _>(|| "Up".to_string())
            .event::<String>("response_event", EventOptions::default())
            .operation::<String, (), _>(
                "pass_text_to_service_2",
                OperationOptions::with_events(["response_event"]),
                move |ctx, text| -> HandlerResult<()> {
                    let emit_ctx = ctx.clone();
                    ctx.call_service(
                        DirectMessageParams::new(&two_name, "ServiceTwo.test_service", json!(text)),
                        Some(Box::new(move |response: ServiceResponse| {
                            assert!(!response.has_error);
                            let text = response.payload.as_str().unwrap_or_default();
                            emit_ctx.emit_event(
                                "response_event",
                                &format!("Received response from Service 2: {text}"),
                            );
                        })),
                        Duration::from_secs(5),
                    );
                    Ok(())
                },
            )
            .build()
            .unwrap(),
    )
    .await;

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let on_event: Arc<intersect_sdk::client::EventCallback> = Arc::new(
        move |_source: &str, _capability: &str, event: &str, payload: serde_json::Value| {
            assert_eq!(event, "response_event");
            let _ = tx.send(payload.as_str().unwrap_or_default().to_string());
            Err(ClientLoopExit)
        },
    );
    let client = IntersectClient::new(
        client_config(ClientCallbackConfig {
            messages_to_send: vec![DirectMessageParams::new(
                one,
                "ServiceOne.pass_text_to_service_2",
                json!("ping-pong"),
            )],
            services_to_start_listening_for_events: vec![one.to_string()],
            ..ClientCallbackConfig::default()
        }),
        Arc::new(hub.client()),
        None,
        Some(on_event),
    )
    .unwrap();
    client.startup().await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no response event")
        .unwrap();
    assert!(event.contains("ping-pong"), "event was '{event}'");
    assert!(event.contains("Service 2 received"), "event was '{event}'");

    client.shutdown().await;
    service_one.shutdown().await;
    service_two.shutdown().await;
}

// ── Scenario: call_service timeout ─────────────────────────────────────

#[tokio::test]
async fn unanswered_call_times_out_exactly_once() {
    let hub = MemoryHub::new();
    let one = "timeout-org.timeout-fac.timeout-sys.service-one";
    let two = "timeout-org.timeout-fac.timeout-sys.service-two";

    // the peer's operation is void: it never produces a reply
    let service_two = start_service(
        &hub,
        two,
        CapabilityBuilder::new("SilentPeer")
            .status::<String, _>(|| "Up".to_string())
            .operation::<String, (), _>("swallow", OperationOptions::default(), |_, _| Ok(()))
            .build()
            .unwrap(),
    )
    .await;

    let (tx, mut rx) = mpsc::unbounded_channel::<ServiceResponse>();
    let two_name = two.to_string();
    let service_one = start_service(
        &hub,
        one,
        CapabilityBuilder::new("Caller")
            .status::<String, _>(|| "Up".to_string())
            .operation::<String, (), _>(
                "forward",
                OperationOptions::default(),
                move |ctx, text| -> HandlerResult<()> {
                    let tx = tx.clone();
                    ctx.call_service(
                        DirectMessageParams::new(&two_name, "SilentPeer.swallow", json!(text)),
                        Some(Box::new(move |response| drop(tx.send(response)))),
                        Duration::from_secs(1),
                    );
                    Ok(())
                },
            )
            .build()
            .unwrap(),
    )
    .await;

    let client = IntersectClient::new(
        client_config(ClientCallbackConfig {
            messages_to_send: vec![DirectMessageParams::new(one, "Caller.forward", json!("x"))],
            ..ClientCallbackConfig::default()
        }),
        Arc::new(hub.client()),
        None,
        None,
    )
    .unwrap();
    client.startup().await.unwrap();

    let response = tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("timeout callback never fired")
        .unwrap();
    assert!(response.has_error);
    let record: ErrorRecord = serde_json::from_value(response.payload).unwrap();
    assert_eq!(record.code, WireErrorCode::Timeout);

    // exactly once: nothing further arrives
    let extra = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(extra.is_err());

    client.shutdown().await;
    service_one.shutdown().await;
    service_two.shutdown().await;
}
