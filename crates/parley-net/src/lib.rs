//! Collaborator seams for the Parley client core, plus an in-process
//! loopback service implementing them.

pub mod loopback;
pub mod transport;

pub use loopback::{LoopbackServer, LoopbackTransport};
pub use transport::{
    SessionProvider, StaticSession, Transport, UploadMeta, UploadProgress, Uploader,
};
