use crate::error::{Error, Result};
use crate::peer::connection::Endpoint;
use crate::peer::types::{EndpointId, ReadyState};
use crate::transport::TransportChannel;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A message received on a data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    /// Endpoint whose channel received it
    pub endpoint: EndpointId,
    pub label: String,
    pub data: String,
}

pub type MessageCallback = Arc<dyn Fn(ChannelMessage) + Send + Sync>;
pub type StateCallback = Arc<dyn Fn(EndpointId, &str, ReadyState) + Send + Sync>;

/// Handle to one side of a data channel
pub struct DataChannel {
    label: String,
    owner: EndpointId,
    state: Mutex<ReadyState>,
    /// Set once `closed` has gone out to the state callback
    close_reported: AtomicBool,
    transport: Arc<dyn TransportChannel>,
}

impl DataChannel {
    fn new(owner: EndpointId, transport: Arc<dyn TransportChannel>) -> Self {
        Self {
            label: transport.label().to_string(),
            owner,
            state: Mutex::new(ReadyState::Connecting),
            close_reported: AtomicBool::new(false),
            transport,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn owner(&self) -> EndpointId {
        self.owner
    }

    pub fn ready_state(&self) -> ReadyState {
        *self.state.lock()
    }

    /// Sends a text message; only valid while the channel is `open`
    pub async fn send(&self, message: &str) -> Result<()> {
        let state = self.ready_state();
        if state != ReadyState::Open {
            return Err(Error::ChannelNotOpen {
                label: self.label.clone(),
                state,
            });
        }

        self.transport.send_text(message).await.map_err(|e| {
            let state = self.ready_state();
            if state != ReadyState::Open {
                Error::ChannelNotOpen {
                    label: self.label.clone(),
                    state,
                }
            } else {
                Error::ChannelSend {
                    label: self.label.clone(),
                    reason: e.to_string(),
                }
            }
        })?;
        debug!(endpoint = %self.owner, label = %self.label, len = message.len(), "Sent message");
        Ok(())
    }

    /// Marks the channel `closed` right away; the transport is told in the
    /// background. Returns false if it was already closed.
    ///
    /// The state callback hears about it once the transport confirms; use
    /// [`DataChannelManager::close`] to report and untrack it immediately.
    pub fn close(&self) -> bool {
        if !self.set_state(ReadyState::Closed) {
            return false;
        }
        let transport = self.transport.clone();
        let label = self.label.clone();
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move {
                if let Err(e) = transport.close().await {
                    debug!(%label, "Transport channel close failed: {}", e);
                }
            });
        }
        true
    }

    /// Returns true if the state actually changed. `closed` is terminal.
    fn set_state(&self, next: ReadyState) -> bool {
        let mut state = self.state.lock();
        if *state == next || *state == ReadyState::Closed {
            return false;
        }
        *state = next;
        true
    }
}

impl std::fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannel")
            .field("label", &self.label)
            .field("owner", &self.owner)
            .field("state", &self.ready_state())
            .finish()
    }
}

/// Tracks the data channels of the current session and dispatches their
/// events to registered callbacks
#[derive(Default)]
pub struct DataChannelManager {
    channels: Mutex<Vec<Arc<DataChannel>>>,
    on_message: Mutex<Option<MessageCallback>>,
    on_state: Mutex<Option<StateCallback>>,
}

impl DataChannelManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the receiver for incoming messages, replacing any previous one
    pub fn on_message(&self, callback: impl Fn(ChannelMessage) + Send + Sync + 'static) {
        *self.on_message.lock() = Some(Arc::new(callback));
    }

    /// Registers the receiver for ready-state changes
    pub fn on_state_change(
        &self,
        callback: impl Fn(EndpointId, &str, ReadyState) + Send + Sync + 'static,
    ) {
        *self.on_state.lock() = Some(Arc::new(callback));
    }

    /// Opens a channel on `endpoint`. The handle starts `connecting` and
    /// becomes `open` once the transport reports the channel up, which can
    /// only happen after the endpoint has connected.
    pub async fn open(&self, endpoint: &Endpoint, label: &str) -> Result<Arc<DataChannel>> {
        let transport = endpoint.create_channel(label).await?;
        let channel = Arc::new(DataChannel::new(endpoint.id(), transport));
        info!(endpoint = %endpoint.id(), %label, "Created data channel");
        self.channels.lock().push(channel.clone());
        Ok(channel)
    }

    /// Takes over a channel the peer opened towards `owner`
    pub fn adopt(
        &self,
        owner: EndpointId,
        transport: Arc<dyn TransportChannel>,
    ) -> Arc<DataChannel> {
        let channel = Arc::new(DataChannel::new(owner, transport));
        info!(endpoint = %owner, label = %channel.label(), "Peer opened data channel");
        self.channels.lock().push(channel.clone());
        channel
    }

    pub fn find(&self, owner: EndpointId, label: &str) -> Option<Arc<DataChannel>> {
        self.channels
            .lock()
            .iter()
            .find(|c| c.owner == owner && c.label == label)
            .cloned()
    }

    pub fn channels(&self) -> Vec<Arc<DataChannel>> {
        self.channels.lock().clone()
    }

    pub fn handle_open(&self, owner: EndpointId, label: &str) {
        self.transition(owner, label, ReadyState::Open);
    }

    pub fn handle_closed(&self, owner: EndpointId, label: &str) {
        self.transition(owner, label, ReadyState::Closed);
    }

    /// Delivers an incoming message in arrival order; messages for closed or
    /// unknown channels are dropped
    pub fn handle_message(&self, owner: EndpointId, label: &str, data: String) {
        let Some(channel) = self.find(owner, label) else {
            warn!(endpoint = %owner, %label, "Message for unknown channel dropped");
            return;
        };
        if channel.ready_state() == ReadyState::Closed {
            debug!(endpoint = %owner, %label, "Message for closed channel dropped");
            return;
        }

        let callback = self.on_message.lock().clone();
        match callback {
            Some(cb) => cb(ChannelMessage {
                endpoint: owner,
                label: label.to_string(),
                data,
            }),
            None => debug!(endpoint = %owner, %label, "No message callback registered"),
        }
    }

    /// Closes one channel, reports `closed` and stops tracking it.
    /// Returns false if the channel was already closed.
    pub fn close(&self, channel: &Arc<DataChannel>) -> bool {
        let changed = channel.close();
        self.retire(channel);
        changed
    }

    /// Closes every channel and forgets them
    pub fn close_all(&self) {
        let channels = std::mem::take(&mut *self.channels.lock());
        for channel in channels {
            channel.close();
            self.report_closed(&channel);
        }
    }

    fn transition(&self, owner: EndpointId, label: &str, next: ReadyState) {
        let Some(channel) = self.find(owner, label) else {
            debug!(endpoint = %owner, %label, "State change for unknown channel ignored");
            return;
        };
        if next == ReadyState::Closed {
            // also covers handles closed directly before the transport confirmed
            channel.set_state(ReadyState::Closed);
            self.retire(&channel);
        } else if channel.set_state(next) {
            self.notify(&channel, next);
        }
    }

    fn retire(&self, channel: &Arc<DataChannel>) {
        self.channels.lock().retain(|c| !Arc::ptr_eq(c, channel));
        self.report_closed(channel);
    }

    fn report_closed(&self, channel: &DataChannel) {
        if !channel.close_reported.swap(true, Ordering::SeqCst) {
            self.notify(channel, ReadyState::Closed);
        }
    }

    fn notify(&self, channel: &DataChannel, state: ReadyState) {
        info!(endpoint = %channel.owner, label = %channel.label, "Channel state is: {}", state);
        let callback = self.on_state.lock().clone();
        if let Some(cb) = callback {
            cb(channel.owner, &channel.label, state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportResult;
    use async_trait::async_trait;

    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TransportChannel for RecordingChannel {
        fn label(&self) -> &str {
            "chat"
        }

        async fn send_text(&self, text: &str) -> TransportResult<()> {
            self.sent.lock().push(text.to_string());
            Ok(())
        }

        async fn close(&self) -> TransportResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn send_requires_open() {
        let manager = DataChannelManager::new();
        let transport = Arc::new(RecordingChannel::default());
        let channel = manager.adopt(EndpointId::Local, transport.clone());

        let err = channel.send("too early").await.unwrap_err();
        assert!(matches!(
            err,
            Error::ChannelNotOpen {
                state: ReadyState::Connecting,
                ..
            }
        ));

        manager.handle_open(EndpointId::Local, "chat");
        channel.send("hello").await.unwrap();
        assert_eq!(*transport.sent.lock(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn close_is_immediate_and_idempotent() {
        let manager = DataChannelManager::new();
        let channel = manager.adopt(EndpointId::Remote, Arc::new(RecordingChannel::default()));
        manager.handle_open(EndpointId::Remote, "chat");

        assert!(channel.close());
        assert_eq!(channel.ready_state(), ReadyState::Closed);
        assert!(!channel.close());

        // a late open event must not resurrect it
        manager.handle_open(EndpointId::Remote, "chat");
        assert_eq!(channel.ready_state(), ReadyState::Closed);
        assert!(matches!(
            channel.send("x").await,
            Err(Error::ChannelNotOpen { .. })
        ));
    }

    #[tokio::test]
    async fn messages_are_delivered_in_arrival_order() {
        let manager = DataChannelManager::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        {
            let received = received.clone();
            manager.on_message(move |m| received.lock().push(m.data));
        }
        manager.adopt(EndpointId::Remote, Arc::new(RecordingChannel::default()));
        manager.handle_open(EndpointId::Remote, "chat");

        for msg in ["one", "two", "two", "three"] {
            manager.handle_message(EndpointId::Remote, "chat", msg.to_string());
        }
        assert_eq!(*received.lock(), vec!["one", "two", "two", "three"]);
    }

    #[tokio::test]
    async fn state_callback_sees_transitions() {
        let manager = DataChannelManager::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            manager.on_state_change(move |_, _, s| seen.lock().push(s));
        }
        manager.adopt(EndpointId::Local, Arc::new(RecordingChannel::default()));
        manager.handle_open(EndpointId::Local, "chat");
        manager.close_all();

        assert_eq!(*seen.lock(), vec![ReadyState::Open, ReadyState::Closed]);
        assert!(manager.channels().is_empty());
    }

    #[tokio::test]
    async fn direct_close_is_reported_when_transport_confirms() {
        let manager = DataChannelManager::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            manager.on_state_change(move |_, _, s| seen.lock().push(s));
        }
        let channel = manager.adopt(EndpointId::Remote, Arc::new(RecordingChannel::default()));
        manager.handle_open(EndpointId::Remote, "chat");

        assert!(channel.close());
        manager.handle_closed(EndpointId::Remote, "chat");
        manager.handle_closed(EndpointId::Remote, "chat");

        assert_eq!(*seen.lock(), vec![ReadyState::Open, ReadyState::Closed]);
        assert!(manager.channels().is_empty());
    }

    #[tokio::test]
    async fn manager_close_reports_once_and_untracks() {
        let manager = DataChannelManager::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            manager.on_state_change(move |_, _, s| seen.lock().push(s));
        }
        let channel = manager.adopt(EndpointId::Local, Arc::new(RecordingChannel::default()));
        manager.handle_open(EndpointId::Local, "chat");

        assert!(manager.close(&channel));
        assert!(manager.find(EndpointId::Local, "chat").is_none());
        assert!(!manager.close(&channel));
        manager.handle_closed(EndpointId::Local, "chat");
        manager.close_all();

        assert_eq!(*seen.lock(), vec![ReadyState::Open, ReadyState::Closed]);
    }
}
