//! Session registry: one physical connection per location key.
//!
//! The registry owns the map from location key to [`ConnectionSession`] and,
//! inside each entry, the map from room name to [`RoomState`]. It is the
//! dedup layer: concurrent join requests for the same (location, room) pair
//! converge on one in-flight connection attempt, with every waiter observing
//! the same pending/ready state.
//!
//! Construct one registry at the host application's composition root and
//! pass it by reference — there is deliberately no process-wide instance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rt_core::room::{RoomConnector, RoomHandle, WsConnector};
use tracing::{debug, warn};

use crate::backoff::RetryPolicy;
use crate::providers::Providers;
use crate::session::{ConnectionSession, RoomParams};

/// Per-(location, room) join state, read by consumers polling for a handle.
///
/// Always re-read through the registry accessors; a `RoomState` cached
/// across a reconnect goes stale.
#[derive(Clone)]
pub enum RoomState {
    /// A join is in flight; no handle yet.
    Pending,
    /// The join completed.
    Ready(RoomHandle),
}

impl RoomState {
    pub fn is_pending(&self) -> bool {
        matches!(self, RoomState::Pending)
    }

    /// The room handle, if ready.
    pub fn room(&self) -> Option<&RoomHandle> {
        match self {
            RoomState::Ready(room) => Some(room),
            RoomState::Pending => None,
        }
    }
}

/// One registry entry: a session plus its per-room join states.
pub struct SessionEntry<C> {
    pub session: ConnectionSession<C>,
    rooms: Arc<Mutex<HashMap<String, RoomState>>>,
}

impl<C> Clone for SessionEntry<C> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            rooms: Arc::clone(&self.rooms),
        }
    }
}

/// Registry of sessions keyed by location, with join dedup.
///
/// `make_connector` builds the per-endpoint [`RoomConnector`] when a new
/// session is created; production code uses [`SessionRegistry::over_websocket`].
pub struct SessionRegistry<C, F> {
    make_connector: F,
    providers: Providers,
    policy: RetryPolicy,
    sessions: Mutex<HashMap<String, SessionEntry<C>>>,
}

impl SessionRegistry<WsConnector, fn(&str) -> WsConnector> {
    /// Registry whose sessions dial a fresh WebSocket per attempt.
    pub fn over_websocket(providers: Providers) -> Self {
        fn make(endpoint: &str) -> WsConnector {
            WsConnector::new(endpoint)
        }
        Self::with_connector(make, providers)
    }
}

impl<C, F> SessionRegistry<C, F>
where
    C: RoomConnector,
    F: Fn(&str) -> C + Send + Sync,
{
    /// Registry with a custom connector factory (alternative transports,
    /// tests).
    pub fn with_connector(make_connector: F, providers: Providers) -> Self {
        Self {
            make_connector,
            providers,
            policy: RetryPolicy::default(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Override the retry policy applied to newly created sessions.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Return the entry for `location`, creating the session on first call.
    ///
    /// Idempotent on `location` alone: the first registration binds the
    /// endpoint, and a later call with a different endpoint returns the
    /// existing session unchanged (one physical connection per location).
    /// The mismatch is logged; [`endpoint_for`](Self::endpoint_for) lets
    /// callers detect it programmatically.
    pub fn get_or_create_session(
        &self,
        endpoint: &str,
        location: &str,
        debug_logging: bool,
    ) -> SessionEntry<C> {
        let mut sessions = match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(entry) = sessions.get(location) {
            if entry.session.endpoint() != endpoint {
                warn!(
                    location,
                    bound = entry.session.endpoint(),
                    requested = endpoint,
                    "location already bound to a different endpoint; keeping first"
                );
            }
            return entry.clone();
        }

        let session = ConnectionSession::with_policy(
            endpoint,
            location,
            (self.make_connector)(endpoint),
            self.providers.clone(),
            debug_logging,
            self.policy,
        );
        let entry = SessionEntry {
            session,
            rooms: Arc::new(Mutex::new(HashMap::new())),
        };
        sessions.insert(location.to_string(), entry.clone());
        debug!(location, endpoint, "created new session");
        entry
    }

    /// The endpoint `location` is bound to, if a session exists.
    pub fn endpoint_for(&self, location: &str) -> Option<String> {
        self.sessions
            .lock()
            .ok()?
            .get(location)
            .map(|e| e.session.endpoint().to_string())
    }

    /// Join-or-create `room_name` on the session for `location`.
    ///
    /// Dedup contract: if the pair already has a state — pending or ready —
    /// it is returned as-is and no second network join is issued. Returns
    /// `None` when no session exists for `location`, and on a failed join
    /// (the slot is cleared so a later call can re-attempt rather than
    /// observing a permanently pending entry).
    pub async fn join_or_create_room(&self, location: &str, room_name: &str) -> Option<RoomState> {
        let entry = self
            .sessions
            .lock()
            .ok()
            .and_then(|s| s.get(location).cloned())?;

        // Claim the slot before the first await so racers observe Pending.
        {
            let mut rooms = entry.rooms.lock().ok()?;
            if let Some(state) = rooms.get(room_name) {
                return Some(state.clone());
            }
            rooms.insert(room_name.to_string(), RoomState::Pending);
        }

        let mut params = RoomParams::new();
        params.insert("location".into(), location.to_string());
        params.insert("roomName".into(), room_name.to_string());

        let joined = entry.session.connect(room_name, params).await;

        let mut rooms = entry.rooms.lock().ok()?;
        match joined {
            Some(room) => {
                let state = RoomState::Ready(room);
                rooms.insert(room_name.to_string(), state.clone());
                Some(state)
            }
            None => {
                rooms.remove(room_name);
                None
            }
        }
    }

    /// Current join state for the pair, without issuing a join.
    pub fn room_state(&self, location: &str, room_name: &str) -> Option<RoomState> {
        self.sessions
            .lock()
            .ok()?
            .get(location)
            .and_then(|e| e.rooms.lock().ok().and_then(|r| r.get(room_name).cloned()))
    }

    /// Poll [`join_or_create_room`](Self::join_or_create_room) with growing
    /// backoff until a handle is ready or `max_polls` attempts are spent.
    pub async fn wait_for_room(
        &self,
        location: &str,
        room_name: &str,
        max_polls: u32,
    ) -> Option<RoomHandle> {
        for poll in 1..=max_polls {
            if let Some(RoomState::Ready(room)) = self.join_or_create_room(location, room_name).await
            {
                return Some(room);
            }
            tokio::time::sleep(self.policy.delay_for(poll)).await;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rt_core::protocol::{JoinOptions, Realm, UserData};
    use rt_core::room::{JoinError, RoomEvent};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{Notify, mpsc};
    use tokio::time::{sleep, timeout};

    use crate::providers::StaticProvider;

    fn providers() -> Providers {
        let p = Arc::new(StaticProvider::new(
            Some(UserData {
                user_id: "0xabc".into(),
                display_name: "alice".into(),
                public_key: Some("0xpub".into()),
                has_connected_web3: true,
            }),
            Some(Realm {
                server_name: "artemis".into(),
                domain: "https://peer.example.org".into(),
                layer: None,
                display_name: None,
            }),
        ));
        Providers::new(p.clone(), p)
    }

    /// Connector that waits for a release signal, then succeeds (or fails
    /// when `fail` is set). Counts calls.
    struct GatedConnector {
        release: Notify,
        calls: AtomicUsize,
        fail: bool,
        keep: Mutex<Vec<mpsc::UnboundedSender<RoomEvent>>>,
    }

    impl GatedConnector {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                release: Notify::new(),
                calls: AtomicUsize::new(0),
                fail,
                keep: Mutex::new(Vec::new()),
            })
        }
    }

    impl RoomConnector for GatedConnector {
        async fn join_or_create(
            &self,
            room_name: &str,
            _options: JoinOptions,
        ) -> Result<RoomHandle, JoinError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            if self.fail {
                return Err(JoinError::Closed);
            }
            let (cmd_tx, _cmd_rx) = mpsc::unbounded_channel();
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            self.keep.lock().unwrap().push(event_tx);
            Ok(RoomHandle::from_parts(
                room_name,
                format!("r{n}"),
                format!("s{n}"),
                cmd_tx,
                event_rx,
            ))
        }
    }

    fn registry(
        connector: &Arc<GatedConnector>,
    ) -> Arc<
        SessionRegistry<Arc<GatedConnector>, impl Fn(&str) -> Arc<GatedConnector> + Send + Sync + use<>>,
    > {
        let connector = Arc::clone(connector);
        Arc::new(SessionRegistry::with_connector(
            move |_endpoint: &str| Arc::clone(&connector),
            providers(),
        ))
    }

    #[tokio::test]
    async fn session_is_a_singleton_per_location() {
        let connector = GatedConnector::new(false);
        let reg = registry(&connector);

        let a = reg.get_or_create_session("wss://one.example.org", "parcel-1", false);
        let b = reg.get_or_create_session("wss://two.example.org", "parcel-1", false);
        assert!(a.session.ptr_eq(&b.session));

        // First writer wins on the endpoint binding, and it is queryable.
        assert_eq!(
            reg.endpoint_for("parcel-1").as_deref(),
            Some("wss://one.example.org")
        );
        assert_eq!(reg.endpoint_for("parcel-9"), None);
    }

    #[tokio::test]
    async fn concurrent_joins_issue_one_connect() {
        let connector = GatedConnector::new(false);
        let reg = registry(&connector);
        reg.get_or_create_session("wss://one.example.org", "parcel-1", false);

        let mut waiters = Vec::new();
        for _ in 0..5 {
            let reg = Arc::clone(&reg);
            waiters.push(tokio::spawn(async move {
                reg.join_or_create_room("parcel-1", "update").await
            }));
        }

        // Let every waiter reach the connector (or the Pending short-circuit).
        sleep(Duration::from_millis(10)).await;
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);

        connector.release.notify_one();

        let mut states = Vec::new();
        for w in waiters {
            states.push(timeout(Duration::from_secs(1), w).await.unwrap().unwrap());
        }

        // Every waiter has returned, so the one driving join has stored
        // Ready; racers that saw Pending re-poll through the accessor.
        let mut ready_ids = Vec::new();
        for state in states {
            match state {
                Some(RoomState::Ready(room)) => ready_ids.push(room.room_id().to_string()),
                Some(RoomState::Pending) => {
                    let state = reg.room_state("parcel-1", "update").unwrap();
                    ready_ids.push(state.room().unwrap().room_id().to_string());
                }
                None => panic!("join failed"),
            }
        }

        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ready_ids.len(), 5);
        assert!(ready_ids.iter().all(|id| id == "r0"));
    }

    #[tokio::test]
    async fn join_without_session_returns_none() {
        let connector = GatedConnector::new(false);
        let reg = registry(&connector);
        assert!(reg.join_or_create_room("parcel-1", "update").await.is_none());
        assert_eq!(connector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_join_clears_the_slot_for_retry() {
        let connector = GatedConnector::new(true);
        let reg = registry(&connector);
        reg.get_or_create_session("wss://one.example.org", "parcel-1", false);

        let join = {
            let reg = Arc::clone(&reg);
            tokio::spawn(async move { reg.join_or_create_room("parcel-1", "update").await })
        };
        sleep(Duration::from_millis(10)).await;
        assert!(reg.room_state("parcel-1", "update").unwrap().is_pending());

        connector.release.notify_one();
        assert!(join.await.unwrap().is_none());

        // Not wedged in Pending: a fresh call may re-attempt.
        assert!(reg.room_state("parcel-1", "update").is_none());
        let retry = {
            let reg = Arc::clone(&reg);
            tokio::spawn(async move { reg.join_or_create_room("parcel-1", "update").await })
        };
        sleep(Duration::from_millis(10)).await;
        assert_eq!(connector.calls.load(Ordering::SeqCst), 2);
        connector.release.notify_one();
        let _ = retry.await.unwrap();
    }

    #[tokio::test]
    async fn racer_ten_millis_later_shares_the_first_join() {
        let connector = GatedConnector::new(false);
        let reg = registry(&connector);
        reg.get_or_create_session("wss://one.example.org", "parcel-1", false);

        let first = {
            let reg = Arc::clone(&reg);
            tokio::spawn(async move { reg.join_or_create_room("parcel-1", "update").await })
        };
        sleep(Duration::from_millis(10)).await;

        // Second caller with the same arguments sees the in-flight state,
        // never a second handle.
        let second = reg.join_or_create_room("parcel-1", "update").await;
        assert!(second.unwrap().is_pending());

        connector.release.notify_one();
        let first = first.await.unwrap().unwrap();
        let room = first.room().unwrap();
        assert_eq!(room.room_id(), "r0");
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);

        // The registry now serves the identical ready state to everyone.
        let state = reg.room_state("parcel-1", "update").unwrap();
        assert!(state.room().unwrap().ptr_eq(room));
    }

    #[tokio::test]
    async fn wait_for_room_polls_until_ready() {
        let connector = GatedConnector::new(false);
        let reg = registry(&connector);
        reg.get_or_create_session("wss://one.example.org", "parcel-1", false);

        let waiter = {
            let reg = Arc::clone(&reg);
            tokio::spawn(async move { reg.wait_for_room("parcel-1", "update", 5).await })
        };
        sleep(Duration::from_millis(10)).await;
        connector.release.notify_one();

        let room = timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .expect("room should become ready");
        assert_eq!(room.name(), "update");
    }
}
