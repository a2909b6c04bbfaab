//! Session Management Module
//!
//! Provides the single-session manager with:
//! - State machine for the session lifecycle, published on a broadcast channel
//! - Separate shell and file-ops transports
//! - Liveness probing before every file operation
//! - Remote environment detection (OS, apt, git)

pub mod clipboard;
pub mod env_detector;
pub mod error;
pub mod external;
mod manager;
mod state;

pub use clipboard::{ClipboardEntry, ClipboardMode, PendingClipboard};
pub use env_detector::{GitBranch, RemoteOs};
pub use error::{CommandError, ConnectError, FileOpError, ListError, LivenessError};
pub use external::{
    AlwaysReachable, EndpointStore, NullEndpointStore, Reachability, RouteReachability,
};
pub use manager::{RemoteCapabilities, SessionManager};
pub use state::{InvalidTransition, SessionState, SessionStateMachine};
