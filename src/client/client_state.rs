use std::fmt::{Display, Formatter};

/// Lifecycle of the client:
///
/// ```text
/// Uninitialized --initialize--> Initialized --start--> Loading --load ok--> Loaded
/// Loaded --identity present--> Ready
/// Loaded --no identity--> CheckingIn --first check-in ok--> Ready
/// any --stop--> Initialized
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClientState {
    Uninitialized,
    Initialized,
    Loading,
    Loaded,
    CheckingIn,
    Ready,
}
impl Display for ClientState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClientState::Uninitialized => "UNINITIALIZED",
            ClientState::Initialized => "INITIALIZED",
            ClientState::Loading => "LOADING",
            ClientState::Loaded => "LOADED",
            ClientState::CheckingIn => "INITIAL_DEVICE_CHECKIN",
            ClientState::Ready => "READY",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StartMode {
    /// load the store, but only go online once there is demand (a registration)
    Delayed,
    Immediate,
}
