//! Session controller, state machine and events

pub mod controller;
pub mod events;
pub mod state;

pub use controller::{SessionController, SessionHandle, SessionOptions};
pub use events::{EventSink, SessionEvent, Severity};
pub use state::SessionState;
