//! Channel handles.
//!
//! A [`Channel`] is the shared handle over a driver task that owns the
//! transport. Client drivers correlate calls by id and run the handshake;
//! server drivers dispatch incoming requests. The handle only carries the
//! command queue and the shared state (scope, lifecycle state, negotiated
//! remote protocol).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use parley_core::Service;
use tokio::sync::{mpsc, oneshot};

use crate::ServiceError;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Channel lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Created; handshake not yet complete.
    Pending,
    /// Handshake succeeded; calls flow.
    Open,
    /// Destroyed or transport reached end-of-stream.
    Closed,
    /// Terminal: a fatal transport or handshake error occurred.
    Errored,
}

/// Options for creating a channel.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Scope label; the default scope is the empty string.
    pub scope: String,
    /// Skip the opening ping handshake; the handshake then piggybacks on
    /// the first call. Implicit for stateless transports.
    pub no_ping: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            scope: String::new(),
            no_ping: false,
        }
    }
}

impl ChannelOptions {
    /// Options for a given scope.
    pub fn scoped(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            ..Self::default()
        }
    }
}

/// Identity of a channel, as exposed on [`CallContext`](crate::CallContext).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    /// The channel's scope.
    pub scope: String,
    /// Process-unique channel id.
    pub id: u64,
}

pub(crate) struct ChannelShared {
    pub(crate) id: u64,
    pub(crate) scope: String,
    state: Mutex<ChannelState>,
    remote: Mutex<Option<Arc<Service>>>,
}

impl ChannelShared {
    pub(crate) fn new(scope: String) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            scope,
            state: Mutex::new(ChannelState::Pending),
            remote: Mutex::new(None),
        })
    }

    pub(crate) fn state(&self) -> ChannelState {
        *self.state.lock().expect("channel state poisoned")
    }

    pub(crate) fn set_state(&self, next: ChannelState) {
        let mut state = self.state.lock().expect("channel state poisoned");
        // Errored is terminal; Closed only yields to Errored.
        match *state {
            ChannelState::Errored => {}
            ChannelState::Closed if next != ChannelState::Errored => {}
            _ => *state = next,
        }
    }

    pub(crate) fn remote(&self) -> Option<Arc<Service>> {
        self.remote.lock().expect("channel remote poisoned").clone()
    }

    pub(crate) fn set_remote(&self, remote: Option<Arc<Service>>) {
        *self.remote.lock().expect("channel remote poisoned") = remote;
    }
}

pub(crate) enum ChannelCommand {
    Call {
        body: Bytes,
        one_way: bool,
        reply: oneshot::Sender<Result<Option<Bytes>, ServiceError>>,
    },
    Destroy,
}

/// Handle to a channel driver.
///
/// Clonable; dropping handles does not close the channel, [`destroy`]
/// (or transport end-of-stream) does.
///
/// [`destroy`]: Channel::destroy
#[derive(Clone)]
pub struct Channel {
    pub(crate) shared: Arc<ChannelShared>,
    pub(crate) cmd_tx: mpsc::Sender<ChannelCommand>,
}

impl Channel {
    /// The channel's scope label.
    pub fn scope(&self) -> &str {
        &self.shared.scope
    }

    /// Process-unique channel id.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    /// Whether calls can still be issued on this channel.
    pub fn is_usable(&self) -> bool {
        matches!(self.state(), ChannelState::Pending | ChannelState::Open)
    }

    /// The negotiated remote protocol, once a handshake learned one.
    ///
    /// `None` means the remote protocol matches the local one (or no
    /// handshake has completed yet).
    pub fn remote_protocol(&self) -> Option<Arc<Service>> {
        self.shared.remote()
    }

    /// Identity snapshot for call contexts.
    pub fn info(&self) -> ChannelInfo {
        ChannelInfo {
            scope: self.shared.scope.clone(),
            id: self.shared.id,
        }
    }

    /// Destroy the channel, aborting every in-flight call with a
    /// transport-kind error.
    pub async fn destroy(&self) {
        let _ = self.cmd_tx.send(ChannelCommand::Destroy).await;
    }

    /// Issue a raw call: send an encoded envelope, await the raw response
    /// body (`None` for one-way messages, which resolve at flush).
    pub(crate) async fn call(
        &self,
        body: Bytes,
        one_way: bool,
    ) -> Result<Option<Bytes>, ServiceError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ChannelCommand::Call {
                body,
                one_way,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ServiceError::Transport("channel closed".into()))?;
        reply_rx
            .await
            .map_err(|_| ServiceError::Transport("channel closed".into()))?
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.id)
            .field("scope", &self.shared.scope)
            .field("state", &self.state())
            .finish()
    }
}
