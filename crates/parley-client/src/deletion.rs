//! Deletion of own messages.

use tracing::info;

use parley_net::SessionProvider;
use parley_shared::{ChannelEvent, ChannelUrl, ChatError, Message, MessageId, Request, Response};

use crate::client::{unexpected_response, ClientInner};
use crate::event_loop::ClientCommand;

/// Check locally that the current user may delete `message` from
/// `channel_url`. Nothing reaches the transport unless this passes.
fn authorize(
    session: &dyn SessionProvider,
    channel_url: &ChannelUrl,
    message: &Message,
) -> Result<MessageId, ChatError> {
    if &message.channel_url != channel_url {
        return Err(ChatError::validation(format!(
            "message belongs to '{}', not '{channel_url}'",
            message.channel_url
        )));
    }
    let message_id = message
        .message_id
        .ok_or_else(|| ChatError::validation("only confirmed messages can be deleted"))?;
    if message.is_deleted() {
        return Err(ChatError::validation(format!("message {message_id} is already deleted")));
    }

    let user = session
        .current_user()
        .ok_or_else(|| ChatError::authorization("no authenticated user"))?;
    if message.is_admin() {
        return Err(ChatError::authorization("admin messages cannot be deleted by users"));
    }
    if !message.is_sent_by(&user.user_id) {
        return Err(ChatError::authorization(format!(
            "{} is not the sender of message {message_id}",
            user.user_id
        )));
    }
    Ok(message_id)
}

pub(crate) async fn delete_message(
    client: &ClientInner,
    channel_url: &ChannelUrl,
    message: &mut Message,
) -> Result<(), ChatError> {
    let message_id = authorize(&*client.session, channel_url, message)?;

    let request = Request::DeleteMessage {
        channel_url: channel_url.clone(),
        message_id,
    };
    match client.round_trip(request).await? {
        Response::Ack => {}
        other => return Err(unexpected_response("ack", &other)),
    }

    message.mark_deleted();
    info!(channel = %channel_url, message_id = %message_id, "Message deleted");
    client.command(ClientCommand::Dispatch(ChannelEvent::MessageDeleted {
        channel_url: channel_url.clone(),
        message_id,
    }));
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    use parley_net::{LoopbackServer, StaticSession};
    use parley_shared::{ChannelInfo, ChannelKind, ErrorKind, MessageBody, Sender, UserId};

    use crate::client::{ChatClient, Collaborators};
    use crate::config::ClientConfig;

    use super::*;

    fn user(id: &str) -> Sender {
        Sender::new(UserId::new(id))
    }

    fn confirmed_by(sender: &str) -> Message {
        let mut message = Message::pending(
            parley_shared::RequestId("r1".into()),
            ChannelUrl::new("c1"),
            MessageBody::User {
                text: "hi".into(),
                translations: BTreeMap::new(),
            },
            Some(user(sender)),
        );
        message.message_id = Some(MessageId(7));
        message
    }

    #[test]
    fn test_authorize_checks() {
        let url = ChannelUrl::new("c1");
        let alice = StaticSession::new(user("alice"));

        assert_eq!(authorize(&alice, &url, &confirmed_by("alice")), Ok(MessageId(7)));

        let err = authorize(&alice, &url, &confirmed_by("bob")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);

        let err = authorize(&StaticSession::anonymous(), &url, &confirmed_by("alice")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);

        let err = authorize(&alice, &ChannelUrl::new("other"), &confirmed_by("alice")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let mut unconfirmed = confirmed_by("alice");
        unconfirmed.message_id = None;
        assert_eq!(
            authorize(&alice, &url, &unconfirmed).unwrap_err().kind(),
            ErrorKind::Validation
        );

        let mut admin = confirmed_by("alice");
        admin.body = MessageBody::Admin { text: "notice".into() };
        assert_eq!(
            authorize(&alice, &url, &admin).unwrap_err().kind(),
            ErrorKind::Authorization
        );
    }

    #[tokio::test]
    async fn test_delete_requires_authorship_and_emits_once() {
        let server = LoopbackServer::new();
        let url = ChannelUrl::new("group_1");
        server.create_channel(ChannelInfo::new(url.clone(), ChannelKind::Group));

        let alice = ChatClient::new(
            ClientConfig::default(),
            Collaborators::from_loopback(server.connect(user("alice"))),
        );
        let bob = ChatClient::new(
            ClientConfig::default(),
            Collaborators::from_loopback(server.connect(user("bob"))),
        );
        let deleted = Arc::new(Mutex::new(Vec::new()));
        let sink = deleted.clone();
        alice.subscribe(
            "deletions",
            Arc::new(move |event: &ChannelEvent| -> anyhow::Result<()> {
                if let ChannelEvent::MessageDeleted { message_id, .. } = event {
                    sink.lock().unwrap().push(*message_id);
                }
                Ok(())
            }),
        );
        alice.watch_channel(&url).await.unwrap();

        let mut message = alice
            .channel(url.clone())
            .send_text("mine")
            .unwrap()
            .completion()
            .await
            .unwrap();
        let operations_before = server.operations().len();

        let mut bobs_copy = message.clone();
        let err = bob.channel(url.clone()).delete_message(&mut bobs_copy).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);
        assert!(!bobs_copy.is_deleted());
        assert_eq!(server.operations().len(), operations_before);

        alice.channel(url.clone()).delete_message(&mut message).await.unwrap();
        assert!(message.is_deleted());
        assert!(server.messages(&url).is_empty());

        alice.flush().await;
        assert_eq!(*deleted.lock().unwrap(), vec![message.message_id.unwrap()]);
    }
}
