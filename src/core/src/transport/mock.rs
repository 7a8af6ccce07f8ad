//! In-memory transport for tests and offline demos.
//!
//! Clones share state, so a test can keep one handle while the session owns
//! another, inspect what was emitted and inject server events.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{Credentials, Transport, TransportEvent, TransportSignal};
use crate::error::{ChatError, Result};
use crate::protocol::{ClientEvent, ServerEvent};

#[derive(Debug, Default)]
struct MockState {
    opens: Vec<(u64, Credentials)>,
    closes: usize,
    current_epoch: Option<u64>,
    open: bool,
    emitted: Vec<ClientEvent>,
    reject_emits: bool,
    auto_open: bool,
    signals: Option<mpsc::UnboundedSender<TransportSignal>>,
}

#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver injected events through a session signal channel.
    pub fn with_signals(self, signals: mpsc::UnboundedSender<TransportSignal>) -> Self {
        self.state.lock().signals = Some(signals);
        self
    }

    /// Report `Opened` as soon as `open` is called.
    pub fn with_auto_open(self) -> Self {
        self.state.lock().auto_open = true;
        self
    }

    /// Make every `emit` fail with `NotConnected`.
    pub fn reject_emits(&self, reject: bool) {
        self.state.lock().reject_emits = reject;
    }

    /// Mark the socket open or closed without sending a signal.
    pub fn set_open(&self, open: bool) {
        self.state.lock().open = open;
    }

    /// Epoch of the most recent `open`.
    pub fn current_epoch(&self) -> Option<u64> {
        self.state.lock().current_epoch
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().opens.len()
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().closes
    }

    /// Credentials of the most recent `open`.
    pub fn last_credentials(&self) -> Option<Credentials> {
        self.state.lock().opens.last().map(|(_, c)| c.clone())
    }

    /// Everything emitted so far.
    pub fn emitted(&self) -> Vec<ClientEvent> {
        self.state.lock().emitted.clone()
    }

    /// Drain the emitted events.
    pub fn take_emitted(&self) -> Vec<ClientEvent> {
        std::mem::take(&mut self.state.lock().emitted)
    }

    /// Send a lifecycle event for the current epoch through the signal
    /// channel. Returns `false` without a channel or an epoch.
    pub fn signal(&self, event: TransportEvent) -> bool {
        let mut state = self.state.lock();
        let Some(epoch) = state.current_epoch else {
            return false;
        };
        match &event {
            TransportEvent::Opened => state.open = true,
            TransportEvent::Closed(_) | TransportEvent::Error(_) => state.open = false,
            TransportEvent::Inbound(_) => {}
        }
        state
            .signals
            .as_ref()
            .map(|tx| tx.send(TransportSignal { epoch, event }).is_ok())
            .unwrap_or(false)
    }

    /// Push a server event for the current epoch.
    pub fn push(&self, event: ServerEvent) -> bool {
        self.signal(TransportEvent::Inbound(event))
    }
}

impl Transport for MockTransport {
    fn open(&mut self, credentials: &Credentials, epoch: u64) -> Result<()> {
        let auto_open = {
            let mut state = self.state.lock();
            if state.current_epoch.is_some() {
                state.closes += 1;
            }
            state.opens.push((epoch, credentials.clone()));
            state.current_epoch = Some(epoch);
            state.open = false;
            state.auto_open
        };
        if auto_open {
            self.signal(TransportEvent::Opened);
        }
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        if state.current_epoch.take().is_some() {
            state.closes += 1;
        }
        state.open = false;
    }

    fn emit(&mut self, event: &ClientEvent) -> Result<()> {
        let mut state = self.state.lock();
        if state.reject_emits {
            return Err(ChatError::not_connected());
        }
        state.emitted.push(event.clone());
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }
}
