//! The path subsystem: onion-layered encryption, client-side path building
//! and lifecycle, and the per-hop transit state relays keep for paths that
//! run through them.

pub mod builder;
pub mod capsule;
pub mod onion;
pub mod path;
pub mod relay;
pub mod transit;

pub use builder::{BuildFailure, PathBuilder, PendingBuild};
pub use onion::HopCrypt;
pub use path::{OwnedPath, PathHop, PathStatus};
pub use relay::{commit_action, handle_relay_commit, CommitAction, RelayKeys};
pub use transit::{TransitHop, TransitTable};
