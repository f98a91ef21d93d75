// Session Coordinator
//
// Applies connection lifecycle events to the connection table and presence
// registry, and issues the resulting broadcasts and store calls. No lock is
// held across a store call.

use crate::presence::PresenceRegistry;
use crate::protocol::{
    ChatMessageEvent, ClientEvent, CourierIssueEvent, KillResultEvent, ProtocolError, ProxyKind,
    ServerEvent,
};
use crate::session::{Connection, ConnectionId, ConnectionTable, Role};
use crate::transport::Transport;
use skyrelay_store::{Fields, OrderStore, StoreEnvelope, StoreError, StoreRequest};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct SessionCoordinator {
    connections: ConnectionTable,
    presence: PresenceRegistry,
    store: Arc<dyn OrderStore>,
    transport: Arc<dyn Transport>,
}

impl SessionCoordinator {
    pub fn new(store: Arc<dyn OrderStore>, transport: Arc<dyn Transport>) -> Self {
        Self {
            connections: ConnectionTable::new(),
            presence: PresenceRegistry::new(),
            store,
            transport,
        }
    }

    /// Route one inbound event. Store operations run on their own task so a
    /// slow store only delays that request.
    pub async fn handle_event(self: &Arc<Self>, id: &ConnectionId, event: ClientEvent) {
        match event {
            ClientEvent::Register(params) => {
                if let Err(error) = self.register(id, &params.username, params.role).await {
                    self.reject(id, error).await;
                }
            }
            ClientEvent::ChatMessage(message) => {
                self.chat(id, message).await;
            }
            ClientEvent::DroneStatus(operating) => self.set_drone_status(id, operating).await,
            ClientEvent::KillUser(params) => {
                self.kill_connection(id, &params.username).await;
            }
            ClientEvent::CreateOrder(fields) => self.spawn_proxy(id, ProxyKind::CreateOrder, fields),
            ClientEvent::UpdateOrder(fields) => self.spawn_proxy(id, ProxyKind::UpdateOrder, fields),
            ClientEvent::GetAllOrders => self.spawn_proxy(id, ProxyKind::GetAllOrders, Fields::new()),
            ClientEvent::CreateDrone(fields) => self.spawn_proxy(id, ProxyKind::CreateDrone, fields),
            ClientEvent::UpdateDrone(fields) => self.spawn_proxy(id, ProxyKind::UpdateDrone, fields),
            ClientEvent::GetAllDrones => self.spawn_proxy(id, ProxyKind::GetAllDrones, Fields::new()),
        }
    }

    /// Track a freshly accepted connection
    pub async fn connect(&self, id: ConnectionId) {
        self.connections.open(id).await;
    }

    pub async fn register(
        &self,
        id: &ConnectionId,
        username: &str,
        role: Role,
    ) -> Result<(), ProtocolError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(ProtocolError::new(
                ProtocolError::INVALID_REQUEST,
                "Username cannot be empty",
            ));
        }

        let previous_name = self
            .connections
            .update(id, |conn| {
                let previous = conn.username.replace(username.to_string());
                conn.role = Some(role);
                conn.operating_drone = false;
                previous
            })
            .await
            .ok_or_else(|| {
                ProtocolError::new(ProtocolError::NOT_FOUND, "Connection is not open")
            })?;

        // Renaming an already registered connection frees its old name
        if let Some(old) = previous_name.filter(|old| old != username) {
            self.presence.remove(&old, id).await;
        }

        if let Some(superseded) = self.presence.register(username, id.clone()).await {
            if &superseded != id {
                // The earlier connection stays open without a registry entry
                warn!(
                    "Username {} re-registered by {}; connection {} superseded",
                    username, id, superseded
                );
            }
        }

        info!("Connection {} registered as {} ({:?})", id, username, role);
        Ok(())
    }

    /// Record whether a courier is flying; ignored for everyone else
    pub async fn set_drone_status(&self, id: &ConnectionId, operating: bool) {
        let applied = self
            .connections
            .update(id, |conn| {
                if conn.is_courier() {
                    conn.operating_drone = operating;
                    true
                } else {
                    false
                }
            })
            .await
            .unwrap_or(false);

        if applied {
            debug!("Connection {} drone status: operating={}", id, operating);
        } else {
            debug!("Ignoring drone status from non-courier connection {}", id);
        }
    }

    /// Broadcast to every connected party, sender included
    pub async fn chat(&self, id: &ConnectionId, message: String) -> usize {
        self.transport
            .broadcast(ServerEvent::ChatMessage(ChatMessageEvent {
                id: id.clone(),
                message,
            }))
            .await
    }

    /// Forward an order/drone operation to the store and answer the requester.
    ///
    /// Store failures come back as an error envelope on the same result event:
    /// the store's own envelope when it sent one, otherwise one built from
    /// the failure.
    pub async fn proxy(&self, id: &ConnectionId, kind: ProxyKind, fields: Fields) {
        let envelope = match self.store.send(kind.request(fields)).await {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Store call for '{}' from {} failed: {}", kind.event_name(), id, e);
                e.into_envelope()
            }
        };

        if !self.transport.send_to(id, kind.result_event(envelope)).await {
            debug!(
                "Connection {} closed before '{}' completed; result dropped",
                id,
                kind.event_name()
            );
        }
    }

    fn spawn_proxy(self: &Arc<Self>, id: &ConnectionId, kind: ProxyKind, fields: Fields) {
        let coordinator = Arc::clone(self);
        let id = id.clone();
        tokio::spawn(async move {
            coordinator.proxy(&id, kind, fields).await;
        });
    }

    /// Tear down a connection's record.
    ///
    /// Returns the detached crash-recovery task when the connection was a
    /// courier operating a drone. Nothing needs to await it; tests do.
    pub async fn disconnect(&self, id: &ConnectionId) -> Option<JoinHandle<()>> {
        let conn = self.connections.close(id).await?;

        if let Some(username) = &conn.username {
            if !self.presence.remove(username, id).await {
                debug!(
                    "Registry entry for {} belongs to a newer connection; left in place",
                    username
                );
            }
        }

        let online = chrono::Utc::now().signed_duration_since(conn.connected_at);
        info!("Connection {} closed after {}s", id, online.num_seconds());

        if !conn.needs_crash_recovery() {
            return None;
        }
        let courier = conn.username?;
        Some(self.begin_crash_recovery(courier).await)
    }

    async fn begin_crash_recovery(&self, courier: String) -> JoinHandle<()> {
        warn!("Courier {} disconnected while operating a drone", courier);
        self.transport
            .broadcast(ServerEvent::CourierIssue(CourierIssueEvent::connection_lost(&courier)))
            .await;

        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            // Independent best-effort calls: one failing never blocks the other
            let (reset, crashed) = tokio::join!(
                store.send(StoreRequest::reset_orders_to_storage(courier.as_str())),
                store.send(StoreRequest::mark_drone_crashed(courier.as_str())),
            );
            log_recovery_step("reset orders to storage", &courier, reset);
            log_recovery_step("mark drone crashed", &courier, crashed);
        })
    }

    /// Force another user's connection closed by username.
    ///
    /// The target's own disconnect path (including crash recovery) runs when
    /// its socket task observes the close. Any connection may ask.
    pub async fn kill_connection(&self, requester: &ConnectionId, target: &str) -> KillResultEvent {
        warn!("Connection {} requested kill of user {}", requester, target);

        let result = match self.presence.lookup(target).await {
            None => KillResultEvent::failed(target, format!("User {} is not connected", target)),
            Some(target_id) => {
                if self.transport.close(&target_id).await {
                    info!("Closing connection {} for user {}", target_id, target);
                    KillResultEvent::succeeded(target)
                } else {
                    KillResultEvent::failed(target, format!("Connection for {} is already closing", target))
                }
            }
        };

        self.transport
            .send_to(requester, ServerEvent::KillResult(result.clone()))
            .await;
        result
    }

    /// Answer a malformed or invalid event
    pub async fn reject(&self, id: &ConnectionId, error: ProtocolError) {
        debug!("Rejecting event from {}: {}", id, error.message);
        self.transport.send_to(id, ServerEvent::Error(error)).await;
    }

    pub async fn lookup(&self, username: &str) -> Option<ConnectionId> {
        self.presence.lookup(username).await
    }

    pub async fn connection(&self, id: &ConnectionId) -> Option<Connection> {
        self.connections.get(id).await
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.count().await
    }

    pub async fn online_users(&self) -> usize {
        self.presence.len().await
    }
}

fn log_recovery_step(step: &str, courier: &str, outcome: Result<StoreEnvelope, StoreError>) {
    match outcome {
        Ok(_) => info!("Crash recovery for {}: {} succeeded", courier, step),
        Err(e) => warn!("Crash recovery for {}: {} failed: {}", courier, step, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ConnectionState;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        attached: Mutex<HashSet<ConnectionId>>,
        broadcasts: Mutex<Vec<ServerEvent>>,
        unicasts: Mutex<Vec<(ConnectionId, ServerEvent)>>,
        closes: Mutex<Vec<ConnectionId>>,
    }

    impl RecordingTransport {
        fn attach(&self, id: &ConnectionId) {
            self.attached.lock().unwrap().insert(id.clone());
        }

        fn broadcasts(&self) -> Vec<ServerEvent> {
            self.broadcasts.lock().unwrap().clone()
        }

        fn unicasts_to(&self, id: &ConnectionId) -> Vec<ServerEvent> {
            self.unicasts
                .lock()
                .unwrap()
                .iter()
                .filter(|(to, _)| to == id)
                .map(|(_, event)| event.clone())
                .collect()
        }

        fn closes(&self) -> Vec<ConnectionId> {
            self.closes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn broadcast(&self, event: ServerEvent) -> usize {
            self.broadcasts.lock().unwrap().push(event);
            self.attached.lock().unwrap().len()
        }

        async fn send_to(&self, id: &ConnectionId, event: ServerEvent) -> bool {
            if !self.attached.lock().unwrap().contains(id) {
                return false;
            }
            self.unicasts.lock().unwrap().push((id.clone(), event));
            true
        }

        async fn close(&self, id: &ConnectionId) -> bool {
            if !self.attached.lock().unwrap().remove(id) {
                return false;
            }
            self.closes.lock().unwrap().push(id.clone());
            true
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        requests: Mutex<Vec<StoreRequest>>,
        failing: Mutex<HashSet<&'static str>>,
    }

    impl RecordingStore {
        fn fail_on(&self, kind: &'static str) {
            self.failing.lock().unwrap().insert(kind);
        }

        fn requests(&self) -> Vec<StoreRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OrderStore for RecordingStore {
        async fn send(&self, request: StoreRequest) -> Result<StoreEnvelope, StoreError> {
            let kind = request.kind();
            self.requests.lock().unwrap().push(request);
            if self.failing.lock().unwrap().contains(kind) {
                return Err(StoreError::Status {
                    status: 500,
                    message: format!("{} unavailable", kind),
                    envelope: None,
                });
            }
            Ok(StoreEnvelope::success(json!({"type": kind})))
        }
    }

    struct Harness {
        coordinator: Arc<SessionCoordinator>,
        transport: Arc<RecordingTransport>,
        store: Arc<RecordingStore>,
    }

    impl Harness {
        fn new() -> Self {
            let transport = Arc::new(RecordingTransport::default());
            let store = Arc::new(RecordingStore::default());
            let coordinator = Arc::new(SessionCoordinator::new(store.clone(), transport.clone()));
            Self {
                coordinator,
                transport,
                store,
            }
        }

        async fn open(&self, id: &str) -> ConnectionId {
            let id = ConnectionId::from(id);
            self.transport.attach(&id);
            self.coordinator.connect(id.clone()).await;
            id
        }

        async fn courier_in_flight(&self, id: &str, username: &str) -> ConnectionId {
            let id = self.open(id).await;
            self.coordinator
                .register(&id, username, Role::Courier)
                .await
                .unwrap();
            self.coordinator.set_drone_status(&id, true).await;
            id
        }
    }

    fn courier_issues(events: &[ServerEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|event| match event {
                ServerEvent::CourierIssue(issue) => Some(issue.username.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_register_sets_fields_and_presence() {
        let h = Harness::new();
        let id = h.open("a").await;

        h.coordinator.register(&id, "u1", Role::Customer).await.unwrap();

        let conn = h.coordinator.connection(&id).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Registered);
        assert_eq!(conn.username.as_deref(), Some("u1"));
        assert_eq!(conn.role, Some(Role::Customer));
        assert!(!conn.operating_drone);
        assert_eq!(h.coordinator.lookup("u1").await, Some(id));
    }

    #[tokio::test]
    async fn test_register_rejects_blank_username() {
        let h = Harness::new();
        let id = h.open("a").await;

        let err = h.coordinator.register(&id, "   ", Role::Courier).await.unwrap_err();
        assert_eq!(err.code, ProtocolError::INVALID_REQUEST);
        assert_eq!(h.coordinator.online_users().await, 0);
    }

    #[tokio::test]
    async fn test_rename_frees_old_username() {
        let h = Harness::new();
        let id = h.open("a").await;

        h.coordinator.register(&id, "u1", Role::Customer).await.unwrap();
        h.coordinator.register(&id, "u9", Role::Customer).await.unwrap();

        assert_eq!(h.coordinator.lookup("u1").await, None);
        assert_eq!(h.coordinator.lookup("u9").await, Some(id));
    }

    #[tokio::test]
    async fn test_drone_status_only_applies_to_couriers() {
        let h = Harness::new();
        let customer = h.open("a").await;
        h.coordinator.register(&customer, "c1", Role::Customer).await.unwrap();
        h.coordinator.set_drone_status(&customer, true).await;
        assert!(!h.coordinator.connection(&customer).await.unwrap().operating_drone);

        let courier = h.courier_in_flight("b", "u1").await;
        assert!(h.coordinator.connection(&courier).await.unwrap().operating_drone);

        h.coordinator.set_drone_status(&courier, false).await;
        assert!(!h.coordinator.connection(&courier).await.unwrap().operating_drone);
    }

    #[tokio::test]
    async fn test_chat_broadcasts_with_sender_id() {
        let h = Harness::new();
        let x = h.open("x").await;
        h.open("y").await;
        h.open("z").await;

        let reached = h.coordinator.chat(&x, "hello".to_string()).await;

        assert_eq!(reached, 3);
        assert_eq!(
            h.transport.broadcasts(),
            vec![ServerEvent::ChatMessage(ChatMessageEvent {
                id: x,
                message: "hello".to_string(),
            })]
        );
    }

    #[tokio::test]
    async fn test_operating_courier_disconnect_triggers_recovery_once() {
        let h = Harness::new();
        let id = h.courier_in_flight("a", "u1").await;

        let recovery = h.coordinator.disconnect(&id).await.expect("recovery task");
        recovery.await.unwrap();

        assert_eq!(courier_issues(&h.transport.broadcasts()), vec!["u1".to_string()]);
        let requests = h.store.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests.contains(&StoreRequest::reset_orders_to_storage("u1")));
        assert!(requests.contains(&StoreRequest::mark_drone_crashed("u1")));
        assert_eq!(h.coordinator.lookup("u1").await, None);

        // A second teardown of the same connection does nothing
        assert!(h.coordinator.disconnect(&id).await.is_none());
        assert_eq!(h.store.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_idle_courier_and_customer_disconnect_quietly() {
        let h = Harness::new();
        let idle = h.open("a").await;
        h.coordinator.register(&idle, "u1", Role::Courier).await.unwrap();

        let customer = h.open("b").await;
        h.coordinator.register(&customer, "c1", Role::Customer).await.unwrap();
        h.coordinator.set_drone_status(&customer, true).await;

        let anonymous = h.open("c").await;

        assert!(h.coordinator.disconnect(&idle).await.is_none());
        assert!(h.coordinator.disconnect(&customer).await.is_none());
        assert!(h.coordinator.disconnect(&anonymous).await.is_none());
        assert!(h.transport.broadcasts().is_empty());
        assert!(h.store.requests().is_empty());
        assert_eq!(h.coordinator.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_landing_before_disconnect_skips_recovery() {
        let h = Harness::new();
        let id = h.courier_in_flight("a", "u1").await;
        h.coordinator.set_drone_status(&id, false).await;

        assert!(h.coordinator.disconnect(&id).await.is_none());
        assert!(h.store.requests().is_empty());
    }

    #[tokio::test]
    async fn test_recovery_steps_are_independent() {
        let h = Harness::new();
        h.store.fail_on("ResetOrdersToStorage");
        let id = h.courier_in_flight("a", "u1").await;

        let recovery = h.coordinator.disconnect(&id).await.expect("recovery task");
        recovery.await.unwrap();

        assert!(h
            .store
            .requests()
            .contains(&StoreRequest::mark_drone_crashed("u1")));
        assert_eq!(courier_issues(&h.transport.broadcasts()).len(), 1);
    }

    #[tokio::test]
    async fn test_stale_disconnect_keeps_newer_registration() {
        let h = Harness::new();
        let a = h.open("a").await;
        let b = h.open("b").await;
        h.coordinator.register(&a, "u1", Role::Customer).await.unwrap();
        h.coordinator.register(&b, "u1", Role::Customer).await.unwrap();

        h.coordinator.disconnect(&a).await;

        assert_eq!(h.coordinator.lookup("u1").await, Some(b.clone()));
        // superseded connection is not evicted by the second registration
        assert!(h.transport.closes().is_empty());

        h.coordinator.disconnect(&b).await;
        assert_eq!(h.coordinator.lookup("u1").await, None);
    }

    #[tokio::test]
    async fn test_kill_user_closes_target_and_reports_success() {
        let h = Harness::new();
        let admin = h.open("admin").await;
        let target = h.courier_in_flight("t", "u2").await;

        let result = h.coordinator.kill_connection(&admin, "u2").await;

        assert!(result.ok);
        assert_eq!(h.transport.closes(), vec![target.clone()]);
        assert_eq!(
            h.transport.unicasts_to(&admin),
            vec![ServerEvent::KillResult(KillResultEvent::succeeded("u2"))]
        );

        // The socket task reacts to the close by running the normal teardown
        let recovery = h.coordinator.disconnect(&target).await.expect("recovery task");
        recovery.await.unwrap();
        assert_eq!(courier_issues(&h.transport.broadcasts()), vec!["u2".to_string()]);
        assert_eq!(h.store.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_kill_unknown_user_reports_error_without_side_effects() {
        let h = Harness::new();
        let admin = h.open("admin").await;

        let result = h.coordinator.kill_connection(&admin, "ghost").await;

        assert!(!result.ok);
        assert_eq!(result.username, "ghost");
        assert!(h.transport.closes().is_empty());
        assert!(h.transport.broadcasts().is_empty());
        assert!(h.store.requests().is_empty());
        assert_eq!(h.transport.unicasts_to(&admin).len(), 1);
    }

    #[tokio::test]
    async fn test_proxy_returns_store_envelope() {
        let h = Harness::new();
        let id = h.open("a").await;
        let mut fields = Fields::new();
        fields.insert("customer".to_string(), json!("c1"));

        h.coordinator.proxy(&id, ProxyKind::CreateOrder, fields.clone()).await;

        assert_eq!(h.store.requests(), vec![StoreRequest::create_order(fields)]);
        match h.transport.unicasts_to(&id).as_slice() {
            [ServerEvent::OrderCreated(envelope)] => assert!(envelope.is_success()),
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_proxy_failure_becomes_error_envelope() {
        let h = Harness::new();
        h.store.fail_on("GetAllOrders");
        let id = h.open("a").await;

        h.coordinator.proxy(&id, ProxyKind::GetAllOrders, Fields::new()).await;

        match h.transport.unicasts_to(&id).as_slice() {
            [ServerEvent::AllOrders(envelope)] => {
                assert!(!envelope.is_success());
                assert!(envelope.message().contains("GetAllOrders unavailable"));
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    struct RejectingStore {
        envelope: StoreEnvelope,
    }

    #[async_trait]
    impl OrderStore for RejectingStore {
        async fn send(&self, _request: StoreRequest) -> Result<StoreEnvelope, StoreError> {
            Err(StoreError::Rejected(self.envelope.clone()))
        }
    }

    #[tokio::test]
    async fn test_proxy_forwards_store_error_envelope_unchanged() {
        let transport = Arc::new(RecordingTransport::default());
        let envelope = StoreEnvelope {
            status: skyrelay_store::EnvelopeStatus::Error,
            timestamp: 1_700_000_000,
            data: json!({"code": 400, "fields": ["destination"]}),
        };
        let store = Arc::new(RejectingStore {
            envelope: envelope.clone(),
        });
        let coordinator = SessionCoordinator::new(store, transport.clone());
        let id = ConnectionId::from("a");
        transport.attach(&id);

        coordinator.proxy(&id, ProxyKind::UpdateOrder, Fields::new()).await;

        assert_eq!(
            transport.unicasts_to(&id),
            vec![ServerEvent::OrderUpdated(envelope)]
        );
    }

    #[tokio::test]
    async fn test_proxy_result_for_departed_connection_is_dropped() {
        let h = Harness::new();
        let id = h.open("a").await;
        h.transport.close(&id).await;

        h.coordinator.proxy(&id, ProxyKind::GetAllDrones, Fields::new()).await;

        assert_eq!(h.store.requests(), vec![StoreRequest::GetAllDrones]);
        assert!(h.transport.unicasts_to(&id).is_empty());
    }

    #[tokio::test]
    async fn test_invalid_register_event_is_answered() {
        let h = Harness::new();
        let id = h.open("a").await;

        let event = ClientEvent::Register(crate::protocol::RegisterParams {
            username: String::new(),
            role: Role::Customer,
        });
        h.coordinator.handle_event(&id, event).await;

        match h.transport.unicasts_to(&id).as_slice() {
            [ServerEvent::Error(error)] => assert_eq!(error.code, ProtocolError::INVALID_REQUEST),
            other => panic!("unexpected events: {:?}", other),
        }
    }
}
