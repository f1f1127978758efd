//! Threading of delivered messages into conversations.
//!
//! A conversation is identified by the set of counterpart addresses; names
//! are display data and follow the latest message.  Messages keep delivery
//! order, which can differ from send order, so "most recent" is decided by
//! `sent_at`.

use serde::{Deserialize, Serialize};

use crate::protocol::{ConversationId, KnownPeer, Message, MessageMeta};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    recipients: Vec<KnownPeer>,
    messages: Vec<MessageMeta>,
}

impl Conversation {
    pub fn new(recipients: &[KnownPeer], first: MessageMeta) -> Self {
        let recipients = normalize(recipients);
        Self {
            id: ConversationId::for_recipients(&recipients),
            recipients,
            messages: vec![first],
        }
    }

    /// Address-ordered, one entry per address.
    pub fn recipients(&self) -> &[KnownPeer] {
        &self.recipients
    }

    /// Delivery order.
    pub fn messages(&self) -> &[MessageMeta] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Whether `recipients` names the same address set.
    pub fn matches(&self, recipients: &[KnownPeer]) -> bool {
        self.id == ConversationId::for_recipients(recipients)
    }

    /// The message with the latest `sent_at`; ties go to the later delivery.
    pub fn most_recent(&self) -> Option<&MessageMeta> {
        self.messages.iter().max_by_key(|meta| meta.sent_at)
    }

    /// Messages ordered by `sent_at`, delivery order breaking ties.
    pub fn by_sent_at(&self) -> Vec<&MessageMeta> {
        let mut messages: Vec<&MessageMeta> = self.messages.iter().collect();
        messages.sort_by_key(|meta| meta.sent_at);
        messages
    }

    /// Comma-separated recipient names.
    pub fn title(&self) -> String {
        self.recipients
            .iter()
            .map(|peer| peer.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn push(&mut self, recipients: &[KnownPeer], meta: MessageMeta) {
        for incoming in recipients {
            if let Some(known) = self
                .recipients
                .iter_mut()
                .find(|known| known.address == incoming.address)
            {
                known.name.clone_from(&incoming.name);
            }
        }
        self.messages.push(meta);
    }
}

fn normalize(recipients: &[KnownPeer]) -> Vec<KnownPeer> {
    let mut peers: Vec<KnownPeer> = Vec::with_capacity(recipients.len());
    for peer in recipients {
        match peers.iter_mut().find(|known| known.address == peer.address) {
            Some(known) => known.name.clone_from(&peer.name),
            None => peers.push(peer.clone()),
        }
    }
    peers.sort_by(|a, b| a.address.cmp(&b.address));
    peers
}

/// Append `meta` to the conversation with the same recipient set, or start a
/// new one.  Returns the id of the conversation that took the message.
pub fn fold_into(
    conversations: &mut Vec<Conversation>,
    recipients: &[KnownPeer],
    meta: MessageMeta,
) -> ConversationId {
    let id = ConversationId::for_recipients(recipients);
    if let Some(conversation) = conversations
        .iter_mut()
        .find(|conversation| conversation.id == id)
    {
        conversation.push(recipients, meta);
        return conversation.id.clone();
    }
    conversations.push(Conversation::new(recipients, meta));
    id
}

/// Thread `message` by its addressee list.
pub fn fold(conversations: &mut Vec<Conversation>, message: &Message) -> ConversationId {
    fold_into(conversations, &message.recipients, message.meta())
}

/// Thread `message` as seen by the handheld at `own_address`: the thread is
/// keyed by everyone else taking part, sender included.
pub fn fold_received(
    conversations: &mut Vec<Conversation>,
    message: &Message,
    own_address: &str,
) -> ConversationId {
    fold_into(conversations, &message.counterparts(own_address), message.meta())
}
