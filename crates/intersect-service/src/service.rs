// SPDX-License-Identifier: MIT OR Apache-2.0
//! The service: capabilities bound to a broker, plus lifecycle control.

use intersect_broker::{BrokerClient, BrokerEndpoint, BrokerError, ChannelManager, Credentials};
use intersect_config::{BrokerSelection, ConfigError, ServiceConfig};
use intersect_core::message::value_to_payload;
use intersect_core::{
    Hierarchy, LifecycleMessage, LifecycleType, UserspaceMessage, UserspaceMessageOptions,
    version_string,
};
use intersect_schema::{
    Capability, CapabilityObserver, DirectMessageParams, ResponseHandler, SchemaBuildError,
};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::datastore::DataStore;
use crate::dispatch::{DispatchEngine, InboxKind};
use crate::emitter::EventEmitter;
use crate::lifecycle::{LifecycleState, MultiFlagLatch};
use intersect_broker::{Outbound, Publisher};
use crate::pending::RequestBookkeeper;
use crate::pool::{DEFAULT_DRAIN_GRACE, DispatchPool, default_capacity};

const SUBSCRIPTION_FLAGS: usize = 3;
const SUBSCRIBE_WAIT: Duration = Duration::from_secs(30);

/// Callback invoked once the service reaches READY.
pub type PostStartupCallback = Box<dyn FnOnce() + Send + 'static>;

/// Service construction or lifecycle failure.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Configuration failed validation (startup-fatal).
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A capability declaration failed (startup-fatal).
    #[error(transparent)]
    SchemaBuild(#[from] SchemaBuildError),

    /// Two capabilities share one name.
    #[error("duplicate capability '{0}'")]
    DuplicateCapability(String),

    /// Broker connection or subscription failure.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// `brokers = "discovery"` must be resolved (via
    /// `intersect_config::discover_broker`) into a concrete list first.
    #[error("broker selection 'discovery' must be resolved before startup")]
    DiscoveryUnresolved,

    /// The requested transition is not legal from the current state.
    #[error("operation not valid in lifecycle state '{0}'")]
    WrongState(LifecycleState),

    /// Required subscriptions were not confirmed in time.
    #[error("subscriptions not confirmed within {0:?}")]
    SubscribeTimeout(Duration),
}

struct ServiceShared {
    hierarchy: Hierarchy,
    local_name: String,
    config: ServiceConfig,
    capabilities: BTreeMap<String, Arc<Capability>>,
    channels: ChannelManager,
    publisher: Publisher,
    dispatch: DispatchEngine,
    bookkeeper: RequestBookkeeper,
    emitter: EventEmitter,
    pool: DispatchPool,
    ready: Arc<AtomicBool>,
    state: Mutex<LifecycleState>,
    latch: MultiFlagLatch,
    ticker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    post_startup: Mutex<Option<PostStartupCallback>>,
    stopped: Notify,
}

impl ServiceShared {
    fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: LifecycleState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        debug!(from = %*state, to = %next, "lifecycle transition");
        *state = next;
    }

    /// The document advertised on STARTUP and SCHEMA_RESPONSE.
    fn schema_document(&self) -> Value {
        let capabilities: BTreeMap<&String, Value> = self
            .capabilities
            .iter()
            .map(|(name, capability)| (name, capability.descriptor().schema_document()))
            .collect();
        json!({
            "service": self.local_name,
            "sdkVersion": version_string(),
            "schemaVersion": self.config.schema_version.clone().unwrap_or_else(|| version_string().to_string()),
            "capabilities": capabilities,
        })
    }

    /// Current value of every capability's status probe.
    fn status_document(&self) -> Value {
        let mut statuses = serde_json::Map::new();
        for (name, capability) in &self.capabilities {
            let value = capability
                .status_payload()
                .ok()
                .and_then(|bytes| serde_json::from_slice(&bytes).ok())
                .unwrap_or(Value::Null);
            statuses.insert(name.clone(), value);
        }
        Value::Object(statuses)
    }

    async fn publish_lifecycle(
        &self,
        destination: Option<String>,
        lifecycle_type: LifecycleType,
        payload: Value,
    ) {
        let topic = match &destination {
            Some(name) => match Hierarchy::parse(name) {
                Ok(hierarchy) => hierarchy.lifecycle_topic(),
                Err(_) => {
                    warn!(destination = %name, "lifecycle destination is not a hierarchy");
                    return;
                }
            },
            None => self.hierarchy.lifecycle_topic(),
        };
        let message = LifecycleMessage::create(
            self.local_name.clone(),
            destination,
            lifecycle_type,
            payload.to_string().into_bytes(),
        );
        match message.serialize() {
            Ok(bytes) => {
                if let Err(error) = self
                    .channels
                    .broker()
                    .publish(&topic, &bytes, &BTreeMap::new(), "application/json")
                    .await
                {
                    warn!(%error, "lifecycle publish failed");
                }
            }
            Err(error) => warn!(%error, "lifecycle serialization failed"),
        }
    }

    /// Inbound control-plane traffic: answer schema requests, ignore the rest.
    fn handle_lifecycle(&self, bytes: &[u8]) {
        let message = match LifecycleMessage::deserialize_and_validate(bytes) {
            Ok(message) => message,
            Err(error) => {
                debug!(%error, "ignoring invalid lifecycle message");
                return;
            }
        };
        if message.headers.source == self.local_name {
            return;
        }
        if message.headers.lifecycle_type != LifecycleType::SchemaRequest {
            return;
        }
        if let Some(destination) = &message.headers.destination {
            if destination != &self.local_name {
                return;
            }
        }
        let Ok(requester) = Hierarchy::parse(&message.headers.source) else {
            debug!(source = %message.headers.source, "schema requester is not a hierarchy");
            return;
        };
        info!(requester = %message.headers.source, "answering schema request");
        let response = LifecycleMessage::create(
            self.local_name.clone(),
            Some(message.headers.source.clone()),
            LifecycleType::SchemaResponse,
            self.schema_document().to_string().into_bytes(),
        );
        match response.serialize() {
            Ok(bytes) => self.publisher.send(Outbound {
                topic: requester.lifecycle_topic(),
                payload: bytes,
                headers: BTreeMap::new(),
                content_type: "application/json".to_string(),
            }),
            Err(error) => warn!(%error, "schema response serialization failed"),
        }
    }

    /// Build and enqueue an outbound userspace request.
    fn send_userspace(&self, params: &DirectMessageParams, request_id: Option<Uuid>) {
        let Ok(destination) = Hierarchy::parse(&params.destination) else {
            warn!(destination = %params.destination, "request destination is not a hierarchy, dropping");
            return;
        };
        let Some(payload) = value_to_payload(params.content_type, &params.payload) else {
            warn!(operation = %params.operation, "request payload does not fit its content type, dropping");
            return;
        };
        let message = UserspaceMessage::create(
            self.local_name.clone(),
            params.destination.clone(),
            params.operation.clone(),
            payload,
            UserspaceMessageOptions {
                content_type: params.content_type,
                data_handler: params.data_handler,
                request_id,
                ..UserspaceMessageOptions::default()
            },
        );
        match message.serialize() {
            Ok(bytes) => self.publisher.send(Outbound {
                topic: destination.inbox_topic(),
                payload: bytes,
                headers: BTreeMap::from([("source".to_string(), self.local_name.clone())]),
                content_type: params.content_type.mime().to_string(),
            }),
            Err(error) => warn!(%error, "request serialization failed"),
        }
    }
}

impl CapabilityObserver for ServiceShared {
    fn observe_event(&self, capability_name: &str, operation: &str, event_name: &str, value: Value) {
        match self.capabilities.get(capability_name) {
            Some(capability) => self.emitter.emit(capability, operation, event_name, &value),
            None => warn!(capability = capability_name, "event from unknown capability, dropping"),
        }
    }

    fn create_external_request(
        &self,
        request: DirectMessageParams,
        response_handler: Option<ResponseHandler>,
        timeout: Duration,
    ) -> Uuid {
        let request_id = Uuid::new_v4();
        self.bookkeeper.track(
            request_id,
            request.destination.clone(),
            request.operation.clone(),
            response_handler,
            timeout,
            None,
        );
        self.send_userspace(&request, Some(request_id));
        request_id
    }
}

/// A running (or startable) INTERSECT service.
///
/// Construct inside a tokio runtime: the worker pool, publisher, and
/// emitter spawn their tasks immediately.
pub struct IntersectService {
    shared: Arc<ServiceShared>,
}

impl IntersectService {
    /// Bind capabilities to a broker under the configured hierarchy.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Config`] when the configuration is invalid, and
    /// [`ServiceError::DuplicateCapability`] when two capabilities share a
    /// name.
    pub fn new(
        capabilities: Vec<Capability>,
        config: ServiceConfig,
        broker: Arc<dyn BrokerClient>,
    ) -> Result<Self, ServiceError> {
        Self::build(capabilities, config, broker, None)
    }

    /// Like [`new`](Self::new), with an object store behind the
    /// `MINIO` data handler.
    pub fn with_data_store(
        capabilities: Vec<Capability>,
        config: ServiceConfig,
        broker: Arc<dyn BrokerClient>,
        data_store: Arc<dyn DataStore>,
    ) -> Result<Self, ServiceError> {
        Self::build(capabilities, config, broker, Some(data_store))
    }

    fn build(
        capabilities: Vec<Capability>,
        config: ServiceConfig,
        broker: Arc<dyn BrokerClient>,
        data_store: Option<Arc<dyn DataStore>>,
    ) -> Result<Self, ServiceError> {
        config.validate()?;
        let hierarchy = config.hierarchy.clone();
        let local_name = hierarchy.name();

        let mut capability_map: BTreeMap<String, Arc<Capability>> = BTreeMap::new();
        for capability in capabilities {
            let name = capability.name().to_string();
            if capability_map.insert(name.clone(), Arc::new(capability)).is_some() {
                return Err(ServiceError::DuplicateCapability(name));
            }
        }

        let publisher = Publisher::start(Arc::clone(&broker));
        let pool = DispatchPool::new(default_capacity());
        let bookkeeper = RequestBookkeeper::new();
        let ready = Arc::new(AtomicBool::new(false));
        let emitter = EventEmitter::start(
            hierarchy.clone(),
            publisher.clone(),
            data_store.clone(),
            Arc::clone(&ready),
        );
        let dispatch = DispatchEngine::new(
            hierarchy.clone(),
            capability_map.clone(),
            pool.clone(),
            bookkeeper.clone(),
            data_store,
            publisher.clone(),
        );
        let channels = ChannelManager::new(broker);

        let shared = Arc::new(ServiceShared {
            hierarchy,
            local_name,
            config,
            capabilities: capability_map,
            channels,
            publisher,
            dispatch,
            bookkeeper,
            emitter,
            pool,
            ready,
            state: Mutex::new(LifecycleState::New),
            latch: MultiFlagLatch::new(SUBSCRIPTION_FLAGS),
            ticker: Mutex::new(None),
            post_startup: Mutex::new(None),
            stopped: Notify::new(),
        });

        // weak back-reference only: capabilities never own the service
        let observer: Arc<dyn CapabilityObserver> = shared.clone();
        let weak_observer = Arc::downgrade(&observer);
        for capability in shared.capabilities.values() {
            capability.register_observer(weak_observer.clone());
        }

        Ok(Self { shared })
    }

    /// The service's identity.
    #[must_use]
    pub fn hierarchy(&self) -> &Hierarchy {
        &self.shared.hierarchy
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.shared.state()
    }

    /// Look up a registered capability (e.g. to build emit contexts).
    #[must_use]
    pub fn capability(&self, name: &str) -> Option<Arc<Capability>> {
        self.shared.capabilities.get(name).cloned()
    }

    /// The advertised schema document.
    #[must_use]
    pub fn schema_document(&self) -> Value {
        self.shared.schema_document()
    }

    /// Install a callback invoked once on reaching READY.
    pub fn on_startup(&self, callback: PostStartupCallback) {
        let mut slot = self.shared.post_startup.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(callback);
    }

    /// Number of dispatches currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.shared.dispatch.in_flight()
    }

    /// Drive `NEW → CONNECTING → SUBSCRIBING → READY`.
    ///
    /// # Errors
    ///
    /// Broker failures after the backoff cap, subscription timeouts, and
    /// illegal state transitions.
    pub async fn startup(&self) -> Result<(), ServiceError> {
        let shared = &self.shared;
        match shared.state() {
            LifecycleState::New | LifecycleState::Stopped => {}
            other => return Err(ServiceError::WrongState(other)),
        }
        shared.set_state(LifecycleState::Connecting);

        let (endpoint, credentials) = broker_target(&shared.config.brokers)?;
        if let Err(error) = shared.channels.broker().connect(&endpoint, &credentials).await {
            shared.set_state(LifecycleState::Stopped);
            return Err(error.into());
        }
        info!(service = %shared.local_name, "broker connected");

        shared.set_state(LifecycleState::Subscribing);
        shared
            .publish_lifecycle(None, LifecycleType::Startup, shared.schema_document())
            .await;

        shared.latch.unset_all();
        let weak = Arc::downgrade(shared);
        let subscriptions: [(String, InboxHandler); SUBSCRIPTION_FLAGS] = [
            (shared.hierarchy.inbox_topic(), InboxHandler::Userspace),
            (shared.hierarchy.reply_topic(), InboxHandler::Reply),
            (shared.hierarchy.lifecycle_topic(), InboxHandler::Lifecycle),
        ];
        for (flag, (topic, handler_kind)) in subscriptions.into_iter().enumerate() {
            let weak = weak.clone();
            shared
                .channels
                .register(
                    &topic,
                    Arc::new(move |message| {
                        if let Some(shared) = weak.upgrade() {
                            match handler_kind {
                                InboxHandler::Userspace => shared
                                    .dispatch
                                    .handle_inbound(InboxKind::Userspace, &message.payload),
                                InboxHandler::Reply => shared
                                    .dispatch
                                    .handle_inbound(InboxKind::Reply, &message.payload),
                                InboxHandler::Lifecycle => shared.handle_lifecycle(&message.payload),
                            }
                        }
                        true
                    }),
                )
                .await?;
            shared.latch.set(flag);
        }

        if !shared.latch.wait(SUBSCRIBE_WAIT).await {
            return Err(ServiceError::SubscribeTimeout(SUBSCRIBE_WAIT));
        }

        shared.bookkeeper.start_scan();
        self.start_status_ticker();
        shared.ready.store(true, Ordering::SeqCst);
        shared.set_state(LifecycleState::Ready);
        info!(service = %shared.local_name, "service ready");

        let callback = {
            let mut slot = shared.post_startup.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        if let Some(callback) = callback {
            callback();
        }
        Ok(())
    }

    fn start_status_ticker(&self) {
        let weak = Arc::downgrade(&self.shared);
        let period = Duration::from_secs_f64(self.shared.config.status_interval);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // the immediate first tick would duplicate the STARTUP message
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let status = shared.status_document();
                shared
                    .publish_lifecycle(None, LifecycleType::Status, status)
                    .await;
            }
        });
        let mut ticker = self.shared.ticker.lock().unwrap_or_else(|e| e.into_inner());
        *ticker = Some(handle);
    }

    /// Drive `READY → STOPPING → STOPPED` with the default drain grace.
    pub async fn shutdown(&self) {
        self.shutdown_with_grace(DEFAULT_DRAIN_GRACE).await;
    }

    /// Shutdown, waiting up to `grace` for in-flight dispatches.
    pub async fn shutdown_with_grace(&self, grace: Duration) {
        let shared = &self.shared;
        match shared.state() {
            LifecycleState::Ready | LifecycleState::Subscribing | LifecycleState::Connecting => {}
            other => {
                debug!(state = %other, "shutdown ignored");
                return;
            }
        }
        shared.set_state(LifecycleState::Stopping);
        shared.ready.store(false, Ordering::SeqCst);

        {
            let mut ticker = shared.ticker.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(handle) = ticker.take() {
                handle.abort();
            }
        }

        shared.pool.close();
        if !shared.pool.drain(grace).await {
            warn!("in-flight dispatches abandoned after drain grace");
        }
        shared.bookkeeper.stop_scan();
        shared.bookkeeper.fail_all_for_shutdown();

        shared
            .publish_lifecycle(None, LifecycleType::Shutdown, Value::Null)
            .await;
        if let Err(error) = shared.channels.broker().close().await {
            warn!(%error, "broker close failed");
        }
        shared.set_state(LifecycleState::Stopped);
        shared.stopped.notify_waiters();
        info!(service = %shared.local_name, "service stopped");
    }

    /// Block until another task drives this service to STOPPED.
    pub async fn wait_until_stopped(&self) {
        while self.shared.state() != LifecycleState::Stopped {
            let notified = self.shared.stopped.notified();
            if self.shared.state() == LifecycleState::Stopped {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Clone, Copy)]
enum InboxHandler {
    Userspace,
    Reply,
    Lifecycle,
}

fn broker_target(selection: &BrokerSelection) -> Result<(BrokerEndpoint, Credentials), ServiceError> {
    match selection {
        BrokerSelection::Discovery(_) => Err(ServiceError::DiscoveryUnresolved),
        BrokerSelection::List(entries) => {
            let entry = entries.first().ok_or(ServiceError::DiscoveryUnresolved)?;
            Ok((
                BrokerEndpoint {
                    host: entry.host.clone(),
                    port: entry.port,
                },
                Credentials {
                    username: entry.username.clone(),
                    password: entry.password.clone(),
                },
            ))
        }
    }
}

/// Start the service and run until ctrl-c (or an external `shutdown`),
/// then stop it cleanly.
///
/// # Errors
///
/// Propagates startup failures.
pub async fn default_lifecycle_loop(service: &IntersectService) -> Result<(), ServiceError> {
    service.startup().await?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            service.shutdown().await;
        }
        () = service.wait_until_stopped() => {}
    }
    Ok(())
}
