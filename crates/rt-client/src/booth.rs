//! Claim booth: the kiosk-style consumer of a room session.
//!
//! A [`ClaimBooth`] obtains its room handle through the registry's
//! room-connected events and independently claims rewards over a signed
//! HTTP channel. Claims are rate-limited by a 5-second per-booth debounce
//! measured from the last click. All failures surface as alert strings for
//! the end user — the booth never propagates a raw error.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use rt_core::room::{RoomConnector, RoomHandle};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::providers::Providers;
use crate::registry::SessionEntry;

/// Minimum spacing between accepted claim clicks.
pub const CLICK_DEBOUNCE: Duration = Duration::from_millis(5_000);

const DEFAULT_ENDPOINT: &str = "https://api.reward.tools";

// ---------------------------------------------------------------------------
// Signed request transport
// ---------------------------------------------------------------------------

/// Errors from the signed claim channel.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The request never produced a response.
    #[error("request failed: {0}")]
    Transport(String),

    /// The server answered with an error status.
    #[error("{message}")]
    Status { status: u16, message: String },

    /// The response body did not parse as the expected JSON.
    #[error("malformed response body")]
    Malformed,
}

/// Raw response from the signed channel: status code plus text body.
#[derive(Debug, Clone)]
pub struct SignedResponse {
    pub status: u16,
    pub text: String,
}

/// Signed request/response transport used for reward lookup and claims.
///
/// The host environment supplies request signing; this crate only shapes
/// and interprets the payloads.
#[async_trait]
pub trait SignedFetch: Send + Sync {
    async fn post_signed(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<SignedResponse, FetchError>;
}

/// Production transport over a shared HTTP client.
pub struct ReqwestSigner {
    http: reqwest::Client,
}

impl ReqwestSigner {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl Default for ReqwestSigner {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

#[async_trait]
impl SignedFetch for ReqwestSigner {
    async fn post_signed(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<SignedResponse, FetchError> {
        let resp = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(SignedResponse { status, text })
    }
}

// ---------------------------------------------------------------------------
// Reward payloads
// ---------------------------------------------------------------------------

/// Which reward rail the booth dispenses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimKind {
    /// Wearable airdrop, claimed via `dcl/claim`.
    Dcl,
    /// Attendance token, claimed via `poap/claim`.
    Poap,
}

impl ClaimKind {
    fn claim_path(self) -> &'static str {
        match self {
            ClaimKind::Dcl => "dcl/claim",
            ClaimKind::Poap => "poap/claim",
        }
    }

    /// Caption for the external reward link.
    pub fn link_label(self) -> &'static str {
        match self {
            ClaimKind::Dcl => "View item on Decentraland Marketplace",
            ClaimKind::Poap => "View Event on POAP.gallery",
        }
    }
}

/// Reward metadata returned by the fetch endpoint.
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct RewardData {
    pub image_url: Option<String>,
    pub contract_address: Option<String>,
    pub blockchain_id: Option<String>,
    #[serde(alias = "event_id")]
    pub event_id: Option<String>,
}

impl RewardData {
    /// External page for the reward, when the payload carries enough ids.
    pub fn link(&self, kind: ClaimKind) -> Option<String> {
        match kind {
            ClaimKind::Dcl => {
                let contract = self.contract_address.as_ref()?;
                let token = self.blockchain_id.as_ref()?;
                Some(format!(
                    "https://market.decentraland.org/contracts/{contract}/tokens/{token}"
                ))
            }
            ClaimKind::Poap => {
                let event = self.event_id.as_ref()?;
                Some(format!("https://poap.gallery/event/{event}"))
            }
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct Envelope {
    message: Option<String>,
    data: Option<RewardData>,
}

// ---------------------------------------------------------------------------
// Booth
// ---------------------------------------------------------------------------

/// Booth configuration.
#[derive(Debug, Clone)]
pub struct BoothConfig {
    /// Reward API base URL.
    pub endpoint: String,
    /// Location key of the parcel this booth stands on.
    pub base_parcel: String,
    pub debug: bool,
}

impl BoothConfig {
    pub fn new(base_parcel: impl Into<String>) -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            base_parcel: base_parcel.into(),
            debug: false,
        }
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

/// Alert callback type; messages are already human-readable.
pub type AlertFn = Arc<dyn Fn(&str) + Send + Sync>;

/// One claim kiosk.
pub struct ClaimBooth<S> {
    config: BoothConfig,
    signer: S,
    providers: Providers,
    on_alert: Option<AlertFn>,
    reward_id: Mutex<Option<String>>,
    reward: Mutex<Option<RewardData>>,
    room: Mutex<Option<RoomHandle>>,
    last_click: Mutex<Option<Instant>>,
}

impl<S: SignedFetch + 'static> ClaimBooth<S> {
    pub fn new(config: BoothConfig, signer: S, providers: Providers) -> Self {
        Self {
            config,
            signer,
            providers,
            on_alert: None,
            reward_id: Mutex::new(None),
            reward: Mutex::new(None),
            room: Mutex::new(None),
            last_click: Mutex::new(None),
        }
    }

    /// Set the user-facing alert callback.
    pub fn on_alert(mut self, cb: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_alert = Some(Arc::new(cb));
        self
    }

    /// Subscribe to the session's room-connected events, keeping the
    /// booth's room handle current across reconnects.
    pub fn attach<C: RoomConnector>(self: &Arc<Self>, entry: &SessionEntry<C>) {
        let booth = Arc::clone(self);
        entry.session.on_room_connected(move |room| {
            if booth.config.debug {
                debug!(parcel = %booth.config.base_parcel, room_id = room.room_id(), "room attached");
            }
            if let Ok(mut slot) = booth.room.lock() {
                *slot = Some(room.clone());
            }
        });
    }

    /// The room handle from the most recent connect, if any.
    pub fn room(&self) -> Option<RoomHandle> {
        self.room.lock().ok().and_then(|g| g.clone())
    }

    /// The reward fetched by [`set_reward`](Self::set_reward), if any.
    pub fn reward(&self) -> Option<RewardData> {
        self.reward.lock().ok().and_then(|g| g.clone())
    }

    /// Look up reward metadata over the signed channel.
    pub async fn fetch_reward(&self, reward_id: &str) -> Result<RewardData, FetchError> {
        let user = self.providers.identity.user_data().await;
        let body = json!({
            "address": user.as_ref().map(|u| u.user_id.clone()),
            "displayName": user.as_ref().map(|u| u.display_name.clone()),
            "rewardId": reward_id,
        });
        let url = format!("{}/v1/quest/fetch", self.config.endpoint);
        let envelope = self.post_json(&url, &body).await?;
        envelope.data.ok_or(FetchError::Malformed)
    }

    /// Configure the reward this booth dispenses.
    ///
    /// Fetches the reward metadata; a missing reward alerts the deploy hint
    /// in preview mode and "Reward not found" otherwise. Returns the data on
    /// success so the host can render the image and the [`RewardData::link`].
    pub async fn set_reward(&self, kind: ClaimKind, reward_id: &str) -> Option<RewardData> {
        if let Ok(mut slot) = self.reward_id.lock() {
            *slot = Some(reward_id.to_string());
        }
        if self.config.debug {
            debug!(parcel = %self.config.base_parcel, reward_id, "reward id set");
        }

        match self.fetch_reward(reward_id).await {
            Ok(data) => {
                if self.config.debug {
                    debug!(parcel = %self.config.base_parcel, ?data, link = ?data.link(kind), "got reward");
                }
                if let Ok(mut slot) = self.reward.lock() {
                    *slot = Some(data.clone());
                }
                Some(data)
            }
            Err(e) => {
                if self.config.debug {
                    debug!(parcel = %self.config.base_parcel, error = %e, "fetch failed");
                }
                if self.providers.realm.is_preview().await {
                    self.alert("Deploy your scene to claim items");
                } else {
                    self.alert("Reward not found");
                }
                None
            }
        }
    }

    /// Handle one claim-button click.
    ///
    /// Clicks within [`CLICK_DEBOUNCE`] of the previous click are rejected
    /// with a spam warning and issue no network call. A user without a
    /// connected wallet is told to log in; the operation is not retried.
    pub async fn claim(&self, kind: ClaimKind) {
        if !self.register_click() {
            self.alert("Warning: Please don't spam the booth");
            return;
        }

        let reward_id = self.reward_id.lock().ok().and_then(|g| g.clone());
        let Some(reward_id) = reward_id else {
            self.alert("Reward not found");
            return;
        };

        if self.config.debug {
            debug!(parcel = %self.config.base_parcel, %reward_id, "claiming item");
        }
        self.alert("Attempting to claim item... Please wait...");

        let user = self.providers.identity.user_data().await;
        let Some(user) = user.filter(|u| u.has_connected_web3 && u.public_key.is_some()) else {
            self.alert("Login with an Ethereum Wallet to claim this item");
            return;
        };

        let realm = self.providers.realm.current_realm().await;
        let body = json!({
            "address": user.public_key,
            "displayName": user.display_name,
            "rewardId": reward_id,
            "realm": realm,
            "timezone": Local::now().to_rfc2822(),
        });
        let url = format!("{}/v1/{}", self.config.endpoint, kind.claim_path());

        match self.post_json(&url, &body).await {
            Ok(envelope) => {
                let message = envelope.message.unwrap_or_else(|| "Item claimed".to_string());
                if self.config.debug {
                    debug!(parcel = %self.config.base_parcel, %message, "reward claim succeeded");
                }
                self.alert(&message);
            }
            Err(FetchError::Status { message, .. }) if !message.is_empty() => {
                self.alert(&message);
            }
            Err(_) => {
                self.alert("An error has occurred");
            }
        }
    }

    /// Record a click. Returns false when the click lands inside the
    /// debounce window. The timestamp advances on rejected clicks too, so
    /// sustained spamming never gets through.
    fn register_click(&self) -> bool {
        let Ok(mut last) = self.last_click.lock() else {
            return false;
        };
        let now = Instant::now();
        let accepted = match *last {
            Some(prev) => now.duration_since(prev) >= CLICK_DEBOUNCE,
            None => true,
        };
        *last = Some(now);
        accepted
    }

    async fn post_json(&self, url: &str, body: &serde_json::Value) -> Result<Envelope, FetchError> {
        let resp = self.signer.post_signed(url, body).await?;
        let envelope: Envelope =
            serde_json::from_str(&resp.text).map_err(|_| FetchError::Malformed)?;
        if resp.status != 200 {
            return Err(FetchError::Status {
                status: resp.status,
                message: envelope.message.unwrap_or_default(),
            });
        }
        Ok(envelope)
    }

    fn alert(&self, message: &str) {
        if let Some(cb) = &self.on_alert {
            cb(message);
        }
    }
}
