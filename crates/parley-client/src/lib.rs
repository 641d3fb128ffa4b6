//! Parley client core.
//!
//! Orchestrates outbound sends, inbound event fan-out, channel metadata and
//! counters, deletion and history paging on top of the collaborator seams in
//! `parley-net`. A [`ChatClient`] owns one event loop task; every handle
//! derived from it talks to that loop.

pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod metadata;
pub mod pending;
pub mod pipeline;
pub mod query;

mod client;
mod deletion;
mod event_loop;

use tracing_subscriber::{fmt, EnvFilter};

pub use channel::{Channel, ChannelRegistry};
pub use client::{ChannelHandle, ChatClient, Collaborators};
pub use config::ClientConfig;
pub use dispatcher::{ChannelObserver, EventDispatcher};
pub use metadata::{MetaStore, MetaValue};
pub use pending::RequestIdGenerator;
pub use pipeline::{
    FailedSend, FileMessageParams, FileSource, ProgressSink, SendHandle, SendResult,
    TextMessageParams,
};
pub use query::{HistoryCursor, MessageListQuery};

/// Install a `fmt` subscriber filtered by `RUST_LOG`. Safe to call more than
/// once; later calls are ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("parley_client=debug,parley_net=info,warn"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
