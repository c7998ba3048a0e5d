use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a billing session.
///
/// ```text
/// Uninitialized ──► Connecting ──► Ready ──► Released
///                       │
///                       └──► Failed
/// ```
///
/// `release()` may also cut `Uninitialized` or `Connecting` short, moving
/// straight to `Released`. No state is re-entered once left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Uninitialized,
    Connecting,
    Ready,
    Failed,
    Released,
}

impl SessionState {
    pub fn is_ready(self) -> bool {
        self == SessionState::Ready
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Released)
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Uninitialized, Connecting)
                | (Connecting, Ready)
                | (Connecting, Failed)
                | (Uninitialized | Connecting | Ready, Released)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Connecting => "connecting",
            SessionState::Ready => "ready",
            SessionState::Failed => "failed",
            SessionState::Released => "released",
        };
        f.write_str(name)
    }
}
