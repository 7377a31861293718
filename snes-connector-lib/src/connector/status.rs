use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex, MutexGuard,
};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    capabilities::ConnectorCapabilities,
    error::FileTransferError,
    request::Request,
};

use super::{ConnectionState, ConnectorEvent};

const EVENT_CAPACITY: usize = 64;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Lifecycle bookkeeping shared by every connector: connection state, the
/// in-flight marker, discovered capabilities, the event channel and the
/// cancellation token of the current `enable`.
pub(crate) struct ConnectionStatus {
    events: broadcast::Sender<ConnectorEvent>,
    state: Mutex<ConnectionState>,
    busy: AtomicBool,
    capabilities: Mutex<ConnectorCapabilities>,
    token: Mutex<Option<CancellationToken>>,
}

impl ConnectionStatus {
    pub fn new() -> Self {
        Self {
            events: broadcast::channel(EVENT_CAPACITY).0,
            state: Mutex::new(ConnectionState::Disconnected),
            busy: AtomicBool::new(false),
            capabilities: Mutex::new(ConnectorCapabilities::none()),
            token: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectorEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: ConnectorEvent) {
        let _ = self.events.send(event);
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn capabilities(&self) -> ConnectorCapabilities {
        *lock(&self.capabilities)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Returns the token for the new background loops, or `None` when the
    /// connector is already enabled.
    pub fn enable(&self) -> Option<CancellationToken> {
        let mut token = lock(&self.token);
        if token.as_ref().is_some_and(|token| !token.is_cancelled()) {
            return None;
        }
        let new_token = CancellationToken::new();
        *token = Some(new_token.clone());
        *lock(&self.state) = ConnectionState::Discovering;
        Some(new_token)
    }

    pub fn disable(&self) {
        if let Some(token) = lock(&self.token).take() {
            token.cancel();
        }
        self.mark_disconnected();
    }

    /// Ends the `enable` owning `token` when its background loop cannot
    /// start. A stale token leaves the current state alone.
    pub fn give_up(&self, token: &CancellationToken) {
        if token.is_cancelled() {
            return;
        }
        token.cancel();
        self.mark_disconnected();
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.token)
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    pub fn mark_connected(&self, capabilities: ConnectorCapabilities) {
        if !self.is_enabled() {
            return;
        }
        *lock(&self.capabilities) = capabilities;
        {
            let mut state = lock(&self.state);
            if state.is_connected() {
                return;
            }
            *state = ConnectionState::Connected;
        }
        self.emit(ConnectorEvent::Connected);
    }

    pub fn mark_game_detected(&self) {
        {
            let mut state = lock(&self.state);
            if *state != ConnectionState::Connected {
                return;
            }
            *state = ConnectionState::GameDetected;
        }
        self.emit(ConnectorEvent::GameDetected);
    }

    /// Drops back to discovery (or to disconnected once disabled). The
    /// Disconnected event is raised only on the transition out of a
    /// connected state.
    pub fn mark_disconnected(&self) -> bool {
        let enabled = self.is_enabled();
        let was_connected = {
            let mut state = lock(&self.state);
            let was_connected = state.is_connected();
            *state = if enabled {
                ConnectionState::Discovering
            } else {
                ConnectionState::Disconnected
            };
            was_connected
        };
        self.busy.store(false, Ordering::SeqCst);
        *lock(&self.capabilities) = ConnectorCapabilities::none();
        if was_connected {
            self.emit(ConnectorEvent::Disconnected);
        }
        was_connected
    }

    pub fn try_begin_request(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn finish_request(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }

    /// Completes a request the connector cannot serve.
    pub fn reject(&self, request: Request, error: FileTransferError) {
        warn!("Rejected {:?}: {}", request, error);
        let event = match request {
            Request::RetrieveMemory(_) | Request::UpdateMemory(_) => return,
            Request::ListFiles(request) => ConnectorEvent::FileListReceived {
                request,
                files: vec![],
            },
            Request::BootRom(request) => ConnectorEvent::RomBooted {
                request,
                outcome: Err(error),
            },
            Request::UploadFile(request) => ConnectorEvent::FileUploaded {
                request,
                outcome: Err(error),
            },
            Request::DeleteFile(request) => ConnectorEvent::FileDeleted {
                request,
                outcome: Err(error),
            },
            Request::CreateDirectory(request) => ConnectorEvent::DirectoryCreated {
                request,
                outcome: Err(error),
            },
            Request::DeleteDirectory(request) => ConnectorEvent::DirectoryDeleted {
                request,
                outcome: Err(error),
            },
        };
        self.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_is_reported_once() {
        let status = ConnectionStatus::new();
        let mut events = status.subscribe();
        assert!(status.enable().is_some());
        assert!(status.enable().is_none());

        assert!(!status.is_connected());
        status.mark_connected(ConnectorCapabilities::memory_only());
        assert!(status.is_connected());
        status.mark_game_detected();
        assert_eq!(status.state(), ConnectionState::GameDetected);
        assert!(status.is_connected());

        assert!(status.mark_disconnected());
        assert_eq!(status.state(), ConnectionState::Discovering);
        assert!(!status.is_connected());
        status.disable();
        assert!(!status.mark_disconnected());
        assert_eq!(status.state(), ConnectionState::Disconnected);

        assert!(matches!(events.try_recv(), Ok(ConnectorEvent::Connected)));
        assert!(matches!(events.try_recv(), Ok(ConnectorEvent::GameDetected)));
        assert!(matches!(events.try_recv(), Ok(ConnectorEvent::Disconnected)));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn giving_up_ends_the_enable() {
        let status = ConnectionStatus::new();
        let stale = status.enable().unwrap();
        status.give_up(&stale);
        assert!(!status.is_enabled());
        assert_eq!(status.state(), ConnectionState::Disconnected);

        let current = status.enable().unwrap();
        status.mark_connected(ConnectorCapabilities::memory_only());
        status.give_up(&stale);
        assert!(status.is_enabled());
        assert!(status.is_connected());
        assert!(!current.is_cancelled());
    }

    #[test]
    fn only_one_request_in_flight() {
        let status = ConnectionStatus::new();
        assert!(status.try_begin_request());
        assert!(!status.try_begin_request());
        status.finish_request();
        assert!(status.try_begin_request());
        status.mark_disconnected();
        assert!(!status.is_busy());
    }
}
