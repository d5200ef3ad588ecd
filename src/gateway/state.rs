//! Gateway lifecycle state

use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Lifecycle state of a [`ProtocolGateway`](super::ProtocolGateway)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayState {
    /// Created, no credential checked yet
    Uninitialized,
    /// Obtaining or refreshing a credential
    Authenticating,
    /// Credential valid, calls flowing
    Ready,
    /// Last call was denied by a budget
    RateLimited,
    /// Last authentication attempt failed
    Error,
    /// Closed; no further calls
    Closed,
}

impl GatewayState {
    /// Whether `self -> to` is a legal move
    #[must_use]
    pub fn can_transition(self, to: Self) -> bool {
        use GatewayState::{Authenticating, Closed, Error, RateLimited, Ready, Uninitialized};
        match (self, to) {
            (Closed, _) => false,
            (_, Closed) => true,
            (a, b) if a == b => true,
            // Logout forgets the credential
            (_, Uninitialized) => true,
            (Uninitialized | Ready | RateLimited | Error, Authenticating) => true,
            (Authenticating, Ready | Error) => true,
            (Ready, RateLimited) | (RateLimited, Ready) => true,
            // A denial can arrive before the first credential check
            (Uninitialized | Error, RateLimited | Ready) => true,
            (Ready | RateLimited, Error) => true,
            _ => false,
        }
    }
}

impl fmt::Display for GatewayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uninitialized => "uninitialized",
            Self::Authenticating => "authenticating",
            Self::Ready => "ready",
            Self::RateLimited => "rate_limited",
            Self::Error => "error",
            Self::Closed => "closed",
        })
    }
}

/// Shared, guarded state with logged transitions
#[derive(Debug)]
pub(crate) struct StateCell {
    platform: String,
    state: RwLock<GatewayState>,
}

impl StateCell {
    pub(crate) fn new(platform: &str) -> Self {
        Self {
            platform: platform.to_string(),
            state: RwLock::new(GatewayState::Uninitialized),
        }
    }

    pub(crate) fn get(&self) -> GatewayState {
        *self.state.read()
    }

    /// Move to `to` if legal; returns whether the state is now `to`
    pub(crate) fn set(&self, to: GatewayState) -> bool {
        let mut state = self.state.write();
        if *state == to {
            return true;
        }
        if !state.can_transition(to) {
            debug!(platform = %self.platform, from = %*state, to = %to, "Ignoring illegal transition");
            return false;
        }
        debug!(platform = %self.platform, from = %*state, to = %to, "State transition");
        *state = to;
        true
    }
}
