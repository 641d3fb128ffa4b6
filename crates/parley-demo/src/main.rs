//! Scripted session against the in-process loopback service.
//!
//! Two users share a group channel. Alice sends text and a file, edits
//! metadata and counters, pages history and deletes a message while Bob
//! watches the channel.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use tracing::info;

use parley_client::{
    init_tracing, ChatClient, ClientConfig, Collaborators, FileMessageParams, TextMessageParams,
};
use parley_net::{LoopbackServer, UploadProgress};
use parley_shared::constants::PROTOCOL_VERSION;
use parley_shared::{ChannelEvent, ChannelInfo, ChannelKind, ChannelUrl, Sender, UserId};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    init_tracing();
    info!(protocol = PROTOCOL_VERSION, "Starting Parley demo v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration and start the loopback service
    // -----------------------------------------------------------------------
    let config = ClientConfig::from_env();
    info!(?config, "Loaded configuration");

    let server = LoopbackServer::new().upload_chunk(4 * 1024);
    let url = ChannelUrl::new("group_demo");
    let mut channel_info = ChannelInfo::new(url.clone(), ChannelKind::Group);
    channel_info.name = "Demo".into();
    server.create_channel(channel_info);

    let alice = ChatClient::new(
        config.clone(),
        Collaborators::from_loopback(server.connect(user("alice", "Alice"))),
    );
    let bob = ChatClient::new(
        config,
        Collaborators::from_loopback(server.connect(user("bob", "Bob"))),
    );

    // -----------------------------------------------------------------------
    // 3. Bob watches the channel
    // -----------------------------------------------------------------------
    bob.subscribe(
        "bob-log",
        Arc::new(|event: &ChannelEvent| -> anyhow::Result<()> {
            info!(category = ?event.category(), channel = %event.channel_url(), "Bob saw event");
            Ok(())
        }),
    );
    bob.watch_channel(&url).await?;

    let channel = alice.refresh_channel(&url).await?;
    info!(name = %channel.channel().name(), "Alice opened channel");

    // -----------------------------------------------------------------------
    // 4. Messages
    // -----------------------------------------------------------------------
    let text = channel
        .send_text(TextMessageParams::new("Hello, Bob!").target_languages(["fr"]))?
        .completion()
        .await?;
    info!(message_id = ?text.message_id, translations = ?text.translations(), "Text confirmed");

    let payload = Bytes::from(vec![b'x'; 10 * 1024]);
    let file = channel
        .send_file(
            FileMessageParams::binary(payload, "notes.txt", "text/plain").with_progress(
                |p: UploadProgress| {
                    info!(sent = p.total_bytes_sent, total = p.total_bytes_expected, "Upload progress");
                },
            ),
        )?
        .completion()
        .await?;
    info!(url = %file.file().map(|f| f.url.as_str()).unwrap_or_default(), "File confirmed");

    // -----------------------------------------------------------------------
    // 5. Metadata and counters
    // -----------------------------------------------------------------------
    let meta = channel.meta_data();
    meta.create(BTreeMap::from([("topic".to_string(), "rust".to_string())]))
        .await?;
    meta.update(BTreeMap::from([("topic".to_string(), "async rust".to_string())]))
        .await?;
    let stored = meta.get_all().await?;
    info!(meta = ?stored, "Metadata");

    let counters = channel.meta_counters();
    counters
        .create(BTreeMap::from([("likes".to_string(), 0)]))
        .await?;
    let likes = counters
        .increase(BTreeMap::from([("likes".to_string(), 3)]))
        .await?;
    info!(?likes, "Counters");

    // -----------------------------------------------------------------------
    // 6. History and deletion
    // -----------------------------------------------------------------------
    let mut cursor = channel.create_history_cursor();
    while cursor.has_more() {
        let page = cursor.next_page().await?;
        for message in &page {
            info!(message_id = ?message.message_id, text = ?message.text(), "History");
        }
    }

    let mut to_delete = text;
    channel
        .delete_message(&mut to_delete)
        .await
        .context("deleting own message")?;
    info!(deleted = to_delete.is_deleted(), "Deleted first message");

    alice.flush().await;
    bob.flush().await;
    alice.shutdown();
    bob.shutdown();

    info!(operations = server.operations().len(), "Demo finished");
    Ok(())
}

fn user(id: &str, nickname: &str) -> Sender {
    Sender {
        nickname: Some(nickname.to_string()),
        ..Sender::new(UserId::new(id))
    }
}
