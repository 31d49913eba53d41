//! One resilient connection to one room-server endpoint.
//!
//! [`ConnectionSession`] owns a [`RoomConnector`], the attempt counter and
//! the room-connected listener list. It dials rooms, taps their lifecycle
//! events, and schedules reconnects with backoff whenever a join fails or a
//! joined room is dropped involuntarily. There is no give-up state: a
//! session retries until the process ends.
//!
//! Overlapping `connect` calls are not deduplicated here — that is the
//! registry's contract (see [`crate::registry`]).

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Local;
use rt_core::callbacks::{Callback, CallbackList};
use rt_core::protocol::JoinOptions;
use rt_core::room::{RoomConnector, RoomHandle};
use tracing::{debug, warn};

use crate::backoff::{BackoffScheduler, RetryPolicy};
use crate::providers::Providers;

/// Caller-supplied room parameters forwarded in the join options.
pub type RoomParams = BTreeMap<String, String>;

struct SessionInner<C> {
    endpoint: String,
    location: String,
    connector: C,
    providers: Providers,
    backoff: BackoffScheduler,
    /// Incremented on every attempt, clamped, reset only by success.
    attempts: AtomicU32,
    current_room: Mutex<Option<RoomHandle>>,
    room_connected: CallbackList<RoomHandle>,
    debug: bool,
}

/// A resilient connection to one endpoint, bound to one location key.
///
/// Cheap to clone; clones share the connection, counter, and listeners.
pub struct ConnectionSession<C> {
    inner: Arc<SessionInner<C>>,
}

impl<C> Clone for ConnectionSession<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: RoomConnector> ConnectionSession<C> {
    pub fn new(
        endpoint: impl Into<String>,
        location: impl Into<String>,
        connector: C,
        providers: Providers,
        debug: bool,
    ) -> Self {
        Self::with_policy(
            endpoint,
            location,
            connector,
            providers,
            debug,
            RetryPolicy::default(),
        )
    }

    pub fn with_policy(
        endpoint: impl Into<String>,
        location: impl Into<String>,
        connector: C,
        providers: Providers,
        debug: bool,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                endpoint: endpoint.into(),
                location: location.into(),
                connector,
                providers,
                backoff: BackoffScheduler::new(policy),
                attempts: AtomicU32::new(0),
                current_room: Mutex::new(None),
                room_connected: CallbackList::new(),
                debug,
            }),
        }
    }

    /// Endpoint this session dials.
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Location key this session is bound to.
    pub fn location(&self) -> &str {
        &self.inner.location
    }

    /// Current attempt count (clamped). Zero after a successful connect.
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::Relaxed)
    }

    /// The most recently connected room, if any.
    pub fn current_room(&self) -> Option<RoomHandle> {
        self.inner.current_room.lock().ok().and_then(|g| g.clone())
    }

    /// Whether two handles refer to the same underlying session.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Register a listener for successful connects.
    ///
    /// Listeners accumulate for the session's lifetime. A listener
    /// registered after a connection is already up is replayed immediately
    /// with the current room, then invoked for every later connect. The
    /// replay decision and the registration happen under the room lock, so
    /// a registration racing a connect sees each room exactly once: either
    /// through the replay or through the connect's fan-out, never both.
    pub fn on_room_connected(&self, cb: impl Fn(&RoomHandle) + Send + Sync + 'static) {
        let cb: Callback<RoomHandle> = Arc::new(cb);
        let replay = match self.inner.current_room.lock() {
            Ok(current) => {
                self.inner.room_connected.push_arc(Arc::clone(&cb));
                current.clone()
            }
            Err(_) => {
                self.inner.room_connected.push_arc(Arc::clone(&cb));
                None
            }
        };
        if let Some(room) = replay {
            cb(&room);
        }
    }

    /// Attempt to join-or-create `room_name` on this session's endpoint.
    ///
    /// Derives fresh join options (identity, realm, timestamp) for this
    /// attempt, bumps the clamped attempt counter, and dials. On success the
    /// counter resets to zero, lifecycle taps are wired, listeners fan out,
    /// and the handle is returned. On failure the counter keeps its value, a
    /// reconnect is scheduled with the current attempt count as the backoff
    /// factor, and `None` is returned — connection failures never surface as
    /// hard errors.
    pub async fn connect(&self, room_name: &str, params: RoomParams) -> Option<RoomHandle> {
        let max = self.inner.backoff.policy().max_attempt;
        let prev = self
            .inner
            .attempts
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |a| {
                Some((a + 1).min(max))
            })
            .unwrap_or(max);
        let attempt = (prev + 1).min(max);

        if self.inner.debug {
            debug!(
                location = %self.inner.location,
                room = room_name,
                attempt,
                "attempting connection to server"
            );
        }

        let options = self.build_options(&params).await;

        match self.inner.connector.join_or_create(room_name, options).await {
            Ok(room) => {
                self.inner.attempts.store(0, Ordering::Relaxed);
                if self.inner.debug {
                    debug!(
                        location = %self.inner.location,
                        room = room_name,
                        room_id = room.room_id(),
                        "connected to socket server"
                    );
                }

                // Publish the room and snapshot the listeners atomically;
                // racing registrations replay instead (see
                // `on_room_connected`).
                let listeners = match self.inner.current_room.lock() {
                    Ok(mut current) => {
                        *current = Some(room.clone());
                        self.inner.room_connected.snapshot()
                    }
                    Err(_) => Vec::new(),
                };
                self.tap_room(&room, room_name, &params);
                for cb in &listeners {
                    cb(&room);
                }
                Some(room)
            }
            Err(e) => {
                self.on_disconnect(&e.to_string(), room_name, params, attempt);
                None
            }
        }
    }

    /// Disconnect notification: log, then unconditionally schedule the
    /// reconnect. Reconnection is automatic and not configurable per call.
    fn on_disconnect(&self, reason: &str, room_name: &str, params: RoomParams, attempt: u32) {
        warn!(
            location = %self.inner.location,
            room = room_name,
            attempt,
            reason,
            "disconnected from socket server"
        );
        let key = format!("{}/{}", self.inner.location, room_name);
        self.inner
            .backoff
            .schedule(&key, attempt, self.reconnect_future(room_name.to_string(), params));
    }

    /// Wire lifecycle taps onto a freshly joined room.
    fn tap_room(&self, room: &RoomHandle, room_name: &str, params: &RoomParams) {
        let debug_enabled = self.inner.debug;
        let location = self.inner.location.clone();

        let loc = location.clone();
        room.on_state_change(move |state| {
            if debug_enabled {
                debug!(location = %loc, %state, "state change");
            }
        });

        let loc = location;
        room.on_error(move |err| {
            if debug_enabled {
                debug!(location = %loc, code = err.code, message = %err.message, "room error");
            }
        });

        // Involuntary leave: retry the same room with the same logical
        // parameters (options are re-derived inside the retried connect).
        let session = self.clone();
        let name = room_name.to_string();
        let params = params.clone();
        room.on_leave(move |code| {
            session.on_disconnect(
                &format!("left room (code {code})"),
                &name,
                params.clone(),
                session.attempts(),
            );
        });
    }

    /// Boxed so the reconnect future can contain `connect`, which schedules
    /// further reconnect futures.
    fn reconnect_future(
        &self,
        room_name: String,
        params: RoomParams,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let session = self.clone();
        Box::pin(async move {
            let _ = session.connect(&room_name, params).await;
        })
    }

    /// Join options for one attempt: identity and realm fetched fresh,
    /// timestamp stamped now. Never reused across attempts.
    async fn build_options(&self, params: &RoomParams) -> JoinOptions {
        JoinOptions {
            user_data: self.inner.providers.identity.user_data().await,
            realm: self.inner.providers.realm.current_realm().await,
            timezone: Local::now().to_rfc2822(),
            params: params.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rt_core::protocol::{Realm, UserData};
    use rt_core::room::{JoinError, RoomEvent};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::{advance, sleep};

    use crate::providers::{IdentityProvider, RealmProvider, StaticProvider};

    fn user() -> UserData {
        UserData {
            user_id: "0xabc".into(),
            display_name: "alice".into(),
            public_key: Some("0xpub".into()),
            has_connected_web3: true,
        }
    }

    fn realm() -> Realm {
        Realm {
            server_name: "artemis".into(),
            domain: "https://peer.example.org".into(),
            layer: None,
            display_name: None,
        }
    }

    fn providers() -> Providers {
        let p = Arc::new(StaticProvider::new(Some(user()), Some(realm())));
        Providers::new(p.clone(), p)
    }

    /// Connector scripted with a per-call pass/fail sequence; the last entry
    /// repeats. Records every call's options and keeps room event senders
    /// alive so handles don't see a synthetic leave.
    struct ScriptedConnector {
        script: Vec<bool>,
        calls: AtomicUsize,
        seen_options: Mutex<Vec<JoinOptions>>,
        keep: Mutex<Vec<mpsc::UnboundedSender<RoomEvent>>>,
    }

    impl ScriptedConnector {
        fn new(script: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                script: script.to_vec(),
                calls: AtomicUsize::new(0),
                seen_options: Mutex::new(Vec::new()),
                keep: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl RoomConnector for ScriptedConnector {
        async fn join_or_create(
            &self,
            room_name: &str,
            options: JoinOptions,
        ) -> Result<RoomHandle, JoinError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_options.lock().unwrap().push(options);
            let ok = *self.script.get(n).or(self.script.last()).unwrap_or(&false);
            if ok {
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
            } else {
                Err(JoinError::Closed)
            }
        }
    }

    fn session(connector: &Arc<ScriptedConnector>) -> ConnectionSession<Arc<ScriptedConnector>> {
        ConnectionSession::new(
            "wss://rooms.example.org",
            "parcel-1",
            Arc::clone(connector),
            providers(),
            false,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_counter_clamps_at_fifteen() {
        let connector = ScriptedConnector::new(&[false]);
        let s = session(&connector);
        for _ in 0..20 {
            assert!(s.connect("update", RoomParams::new()).await.is_none());
        }
        assert_eq!(s.attempts(), 15);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_counter_failure_does_not() {
        let connector = ScriptedConnector::new(&[false, false, true, false]);
        let s = session(&connector);

        assert!(s.connect("update", RoomParams::new()).await.is_none());
        assert_eq!(s.attempts(), 1);
        assert!(s.connect("update", RoomParams::new()).await.is_none());
        assert_eq!(s.attempts(), 2);

        assert!(s.connect("update", RoomParams::new()).await.is_some());
        assert_eq!(s.attempts(), 0);

        // The next failure's backoff is driven by attempt = 1, not a
        // carried-over high value.
        assert!(s.connect("update", RoomParams::new()).await.is_none());
        assert_eq!(s.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_schedules_growing_reconnects() {
        let connector = ScriptedConnector::new(&[false]);
        let s = session(&connector);

        assert!(s.connect("update", RoomParams::new()).await.is_none());
        assert_eq!(connector.calls(), 1);

        // Let the spawned retry timer register its sleep before advancing.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        // First retry is due after attempt=1 → 1s.
        advance(Duration::from_millis(1_001)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(connector.calls(), 2);

        // That retry failed with attempt=2 → due 2s later, not 1s.
        advance(Duration::from_millis(1_001)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(connector.calls(), 2);
        advance(Duration::from_secs(1)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(connector.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn listener_registered_after_connect_is_replayed_once() {
        let connector = ScriptedConnector::new(&[true]);
        let s = session(&connector);

        let early_hits = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&early_hits);
        s.on_room_connected(move |_room| {
            hits.fetch_add(1, Ordering::SeqCst);
        });

        s.connect("update", RoomParams::new()).await.unwrap();
        assert_eq!(early_hits.load(Ordering::SeqCst), 1);

        let late_hits = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&late_hits);
        s.on_room_connected(move |_room| {
            hits.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(late_hits.load(Ordering::SeqCst), 1);

        // Give the runtime a chance to surface any stray double fire.
        sleep(Duration::ZERO).await;
        assert_eq!(early_hits.load(Ordering::SeqCst), 1);
        assert_eq!(late_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn listener_racing_a_connect_fires_exactly_once() {
        // Registration and connect on separate worker threads: whichever
        // interleaving occurs, the listener must see the room once, via the
        // replay or via the fan-out.
        for _ in 0..50 {
            let connector = ScriptedConnector::new(&[true]);
            let s = session(&connector);
            let hits = Arc::new(AtomicUsize::new(0));

            let connect = {
                let s = s.clone();
                tokio::spawn(async move { s.connect("update", RoomParams::new()).await })
            };
            let register = {
                let s = s.clone();
                let hits = Arc::clone(&hits);
                tokio::spawn(async move {
                    s.on_room_connected(move |_room| {
                        hits.fetch_add(1, Ordering::SeqCst);
                    });
                })
            };

            assert!(connect.await.unwrap().is_some());
            register.await.unwrap();
            assert_eq!(hits.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn options_are_rederived_on_every_attempt() {
        struct CountingIdentity {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl IdentityProvider for CountingIdentity {
            async fn user_data(&self) -> Option<UserData> {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                Some(UserData {
                    user_id: format!("0x{n}"),
                    display_name: "alice".into(),
                    public_key: None,
                    has_connected_web3: false,
                })
            }
        }

        #[async_trait]
        impl RealmProvider for CountingIdentity {
            async fn current_realm(&self) -> Option<Realm> {
                Some(realm())
            }
        }

        let identity = Arc::new(CountingIdentity {
            calls: AtomicUsize::new(0),
        });
        let providers = Providers::new(identity.clone(), identity.clone());

        let connector = ScriptedConnector::new(&[false]);
        let s = ConnectionSession::new(
            "wss://rooms.example.org",
            "parcel-1",
            Arc::clone(&connector),
            providers,
            false,
        );

        s.connect("update", RoomParams::new()).await;
        s.connect("update", RoomParams::new()).await;

        let seen = connector.seen_options.lock().unwrap();
        let ids: Vec<_> = seen
            .iter()
            .map(|o| o.user_data.as_ref().unwrap().user_id.clone())
            .collect();
        assert_eq!(ids, vec!["0x0", "0x1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn involuntary_leave_triggers_reconnect() {
        let connector = ScriptedConnector::new(&[true]);
        let s = session(&connector);

        let room = s.connect("update", RoomParams::new()).await.unwrap();
        assert_eq!(connector.calls(), 1);

        // Server drops the room.
        let leave_tx = connector.keep.lock().unwrap()[0].clone();
        leave_tx
            .send(RoomEvent::Message(
                rt_core::protocol::ServerMessage::Leave { code: 4002 },
            ))
            .unwrap();
        drop(leave_tx);
        // Let the leave dispatch run and the retry timer register its sleep.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        // attempts was 0 after the success, so the reconnect is immediate.
        advance(Duration::from_millis(1)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(connector.calls(), 2);

        // The reconnect joined the same room and replaced the handle.
        let current = s.current_room().unwrap();
        assert_eq!(current.name(), "update");
        assert!(!current.ptr_eq(&room));
    }
}
