//! Core data model shared by every umbra crate: identifier newtypes, the
//! router-contact store, the introduction-set model, the routing-message
//! envelope, the flat configuration surface, and the error taxonomy.

pub mod config;
pub mod error;
pub mod id;
pub mod introset;
pub mod rc;
pub mod time;
pub mod wire;

pub use config::Config;
pub use error::Error;
pub use id::{ConvoTag, PathId, RouterId, ServiceAddress};
pub use introset::{IntroSet, Introduction};
pub use rc::{RcStore, RouterContact};
pub use time::now_ms;
