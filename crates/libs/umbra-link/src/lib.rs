//! IWP - the encrypted, message-oriented UDP link layer.
//!
//! A [`session::Session`] is a sans-IO state machine between two routers: it
//! consumes datagrams and clock readings and emits datagrams and events.
//! [`server::LinkLayer`] binds a socket and drives a table of sessions the
//! way the rest of the stack consumes them.

pub mod codel;
pub mod frame;
pub mod frame_state;
pub mod message;
pub mod server;
pub mod session;
pub mod xmit;

pub use server::{LinkConfig, LinkEvent, LinkLayer};
pub use session::{CloseReason, Session, SessionEvent, SessionState};
