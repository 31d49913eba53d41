//! Host-environment collaborators: identity and realm lookup.
//!
//! Both can change between calls (wallet connect/disconnect, realm hop), so
//! sessions and booths re-fetch them on every attempt and never cache a
//! result past a single attempt's scope.

use std::sync::Arc;

use async_trait::async_trait;
use rt_core::protocol::{Realm, UserData};

/// Looks up the signed user identity. `None` means no profile is available
/// (guest, or the lookup failed).
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn user_data(&self) -> Option<UserData>;
}

/// Looks up the realm/environment the user is currently in.
#[async_trait]
pub trait RealmProvider: Send + Sync {
    async fn current_realm(&self) -> Option<Realm>;

    /// Whether the scene is running in local preview rather than deployed.
    async fn is_preview(&self) -> bool {
        false
    }
}

/// Bundled providers injected into sessions and booths.
#[derive(Clone)]
pub struct Providers {
    pub identity: Arc<dyn IdentityProvider>,
    pub realm: Arc<dyn RealmProvider>,
}

impl Providers {
    pub fn new(identity: Arc<dyn IdentityProvider>, realm: Arc<dyn RealmProvider>) -> Self {
        Self { identity, realm }
    }
}

/// Fixed-value providers, for hosts without a dynamic environment and for
/// tests.
pub struct StaticProvider {
    user: Option<UserData>,
    realm: Option<Realm>,
    preview: bool,
}

impl StaticProvider {
    pub fn new(user: Option<UserData>, realm: Option<Realm>) -> Self {
        Self {
            user,
            realm,
            preview: false,
        }
    }

    pub fn preview(mut self, preview: bool) -> Self {
        self.preview = preview;
        self
    }
}

#[async_trait]
impl IdentityProvider for StaticProvider {
    async fn user_data(&self) -> Option<UserData> {
        self.user.clone()
    }
}

#[async_trait]
impl RealmProvider for StaticProvider {
    async fn current_realm(&self) -> Option<Realm> {
        self.realm.clone()
    }

    async fn is_preview(&self) -> bool {
        self.preview
    }
}
