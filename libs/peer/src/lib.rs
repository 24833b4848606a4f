//! Peer discovery and image transfer between appliances on the same
//! network: mDNS advertisement/browsing plus a PIN-authenticated HTTP
//! upload surface.

pub mod discovery;
pub mod error;
pub mod transfer;

pub use discovery::{Discovery, PeerDevice};
pub use error::{AuthenticationError, DiscoveryError, ServerError, TransferError};
pub use transfer::{TransferClient, TransferServer};
