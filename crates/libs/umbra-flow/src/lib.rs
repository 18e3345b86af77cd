//! The hidden-service flow layer: publishing and looking up introduction
//! sets in the DHT, establishing per-conversation sessions through
//! introduction points, and the end-to-end frame crypto.

pub mod endpoint;
pub mod frame_crypto;
pub mod identity;
pub mod introset_store;
pub mod lookup;
pub mod publish;
pub mod replay;
pub mod session;

pub use endpoint::{Endpoint, EndpointConfig, FlowEffect};
pub use identity::ServiceIdentity;
pub use introset_store::IntroSetStore;
pub use lookup::{LookupConfig, LookupManager, LookupProgress};
pub use publish::Publisher;
pub use replay::ReplayWindow;
pub use session::{FlowSession, FlowState};
