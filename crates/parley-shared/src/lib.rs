//! Types shared by every Parley crate: identifiers, the message and channel
//! model, the envelopes exchanged with the transport, and the error taxonomy.

pub mod constants;
pub mod error;
pub mod message;
pub mod protocol;
pub mod types;

pub use error::{ChatError, CodecError, ErrorKind};
pub use message::{FileInfo, Message, MessageBody, MessageState};
pub use protocol::{
    ChannelEvent, CounterDelta, EventCategory, HistoryAnchor, HistoryDirection, MembershipChange,
    MetaOp, Request, Response,
};
pub use types::{ChannelInfo, ChannelKind, ChannelUrl, MessageId, RequestId, Sender, UserId};
