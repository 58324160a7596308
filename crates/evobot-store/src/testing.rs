// ABOUTME: In-memory chat transport for exercising the channel store without a network.
// ABOUTME: Supports failure injection, call counting, and out-of-band tampering with messages.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use evobot_core::{ChannelId, MessageId};

use crate::transport::{ChatMessage, ChatTransport, TransportError};

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    /// Messages per channel in send order.
    channels: HashMap<ChannelId, Vec<ChatMessage>>,
    failures: VecDeque<TransportError>,
    calls: HashMap<&'static str, usize>,
}

/// A transport that keeps messages in memory. Cloning is not supported; share
/// it through an `Arc`.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    state: Mutex<State>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_id: 1000,
                ..State::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue errors returned, in order, by the next calls of any operation.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = TransportError>) {
        self.state().failures.extend(errors);
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.state().calls.get(operation).copied().unwrap_or(0)
    }

    pub fn message_count(&self, channel: ChannelId) -> usize {
        self.state().channels.get(&channel).map_or(0, Vec::len)
    }

    pub fn pinned_count(&self, channel: ChannelId) -> usize {
        self.state()
            .channels
            .get(&channel)
            .map_or(0, |messages| messages.iter().filter(|m| m.pinned).count())
    }

    /// All message bodies of `channel` in send order.
    pub fn contents(&self, channel: ChannelId) -> Vec<String> {
        self.state()
            .channels
            .get(&channel)
            .map(|messages| messages.iter().map(|m| m.content.clone()).collect())
            .unwrap_or_default()
    }

    pub fn content(&self, channel: ChannelId, id: MessageId) -> Option<String> {
        self.state()
            .channels
            .get(&channel)?
            .iter()
            .find(|m| m.id == id)
            .map(|m| m.content.clone())
    }

    /// Delete a message behind the store's back.
    pub fn remove_message(&self, channel: ChannelId, id: MessageId) {
        if let Some(messages) = self.state().channels.get_mut(&channel) {
            messages.retain(|m| m.id != id);
        }
    }

    /// Replace a message body behind the store's back.
    pub fn overwrite_content(&self, channel: ChannelId, id: MessageId, content: &str) {
        if let Some(message) = self
            .state()
            .channels
            .get_mut(&channel)
            .and_then(|messages| messages.iter_mut().find(|m| m.id == id))
        {
            message.content = content.to_string();
        }
    }

    fn begin(&self, operation: &'static str) -> Result<MutexGuard<'_, State>, TransportError> {
        let mut state = self.state();
        *state.calls.entry(operation).or_default() += 1;
        match state.failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(state),
        }
    }
}

fn find_mut(state: &mut State, channel: ChannelId, id: MessageId) -> Result<&mut ChatMessage, TransportError> {
    state
        .channels
        .get_mut(&channel)
        .and_then(|messages| messages.iter_mut().find(|m| m.id == id))
        .ok_or(TransportError::NotFound)
}

#[async_trait]
impl ChatTransport for MemoryTransport {
    async fn send_message(&self, channel: ChannelId, content: &str) -> Result<MessageId, TransportError> {
        let mut state = self.begin("send_message")?;
        state.next_id += 1;
        let id = MessageId(state.next_id);
        state.channels.entry(channel).or_default().push(ChatMessage {
            id,
            channel_id: channel,
            content: content.to_string(),
            pinned: false,
        });
        Ok(id)
    }

    async fn edit_message(&self, channel: ChannelId, message: MessageId, content: &str) -> Result<(), TransportError> {
        let mut state = self.begin("edit_message")?;
        find_mut(&mut state, channel, message)?.content = content.to_string();
        Ok(())
    }

    async fn pin_message(&self, channel: ChannelId, message: MessageId) -> Result<(), TransportError> {
        let mut state = self.begin("pin_message")?;
        find_mut(&mut state, channel, message)?.pinned = true;
        Ok(())
    }

    async fn fetch_message(&self, channel: ChannelId, message: MessageId) -> Result<ChatMessage, TransportError> {
        let mut state = self.begin("fetch_message")?;
        Ok(find_mut(&mut state, channel, message)?.clone())
    }

    async fn delete_message(&self, channel: ChannelId, message: MessageId) -> Result<(), TransportError> {
        let mut state = self.begin("delete_message")?;
        let messages = state.channels.get_mut(&channel).ok_or(TransportError::NotFound)?;
        let before = messages.len();
        messages.retain(|m| m.id != message);
        if messages.len() == before {
            return Err(TransportError::NotFound);
        }
        Ok(())
    }

    async fn pinned_messages(&self, channel: ChannelId) -> Result<Vec<ChatMessage>, TransportError> {
        let state = self.begin("pinned_messages")?;
        Ok(state
            .channels
            .get(&channel)
            .map(|messages| messages.iter().rev().filter(|m| m.pinned).cloned().collect())
            .unwrap_or_default())
    }
}
