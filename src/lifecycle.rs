//! Connection lifecycle state machine for the shared store.
//!
//! The store adapter reports connection events; the admission engine only
//! asks [`ConnectionLifecycle::is_available`]. Keeping the transitions in one
//! table means every change of the "store usable" signal is logged and
//! testable without request traffic.

use crate::error::{LifecycleError, StoreError};
use crate::rate_limit::store::BucketStore;
use crate::telemetry::{emit_best_effort, LimiterEvent, NullSink, TelemetrySink};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

const STATE_DISCONNECTED: u8 = 0;
const STATE_CONNECTING: u8 = 1;
const STATE_READY: u8 = 2;
const STATE_RECONNECTING: u8 = 3;

/// Connection state of the store client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and none being attempted.
    Disconnected,
    /// First connection attempt in flight.
    Connecting,
    /// Connected and usable.
    Ready,
    /// Connection lost; the client is trying to restore it.
    Reconnecting,
}

impl ConnectionState {
    fn to_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => STATE_DISCONNECTED,
            ConnectionState::Connecting => STATE_CONNECTING,
            ConnectionState::Ready => STATE_READY,
            ConnectionState::Reconnecting => STATE_RECONNECTING,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            STATE_CONNECTING => ConnectionState::Connecting,
            STATE_READY => ConnectionState::Ready,
            STATE_RECONNECTING => ConnectionState::Reconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// Events reported by the store client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A connection attempt started.
    Connect,
    /// The connection is established and accepting commands.
    Ready,
    /// Fatal connection error.
    Error,
    /// The client is retrying a lost connection.
    Reconnecting,
    /// The connection was closed for good.
    End,
}

/// Transition table. `None` means the event is illegal in `from`.
fn next_state(from: ConnectionState, event: ConnectionEvent) -> Option<ConnectionState> {
    use ConnectionEvent as E;
    use ConnectionState as S;
    match (from, event) {
        (S::Disconnected, E::Connect) => Some(S::Connecting),
        (S::Connecting, E::Connect) => Some(S::Connecting),
        (S::Connecting | S::Reconnecting | S::Ready, E::Ready) => Some(S::Ready),
        (S::Disconnected | S::Connecting | S::Ready | S::Reconnecting, E::Reconnecting) => {
            Some(S::Reconnecting)
        }
        (_, E::Error | E::End) => Some(S::Disconnected),
        _ => None,
    }
}

/// Shared handle on the store's connection state.
///
/// Clones share the same state via `Arc`, so the adapter that reports events
/// and the engine that reads availability see one source of truth.
#[derive(Clone)]
pub struct ConnectionLifecycle<T = NullSink> {
    state: Arc<AtomicU8>,
    shut_down: Arc<AtomicBool>,
    sink: T,
}

impl<T> std::fmt::Debug for ConnectionLifecycle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLifecycle").field("state", &self.state()).finish()
    }
}

impl Default for ConnectionLifecycle<NullSink> {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionLifecycle<NullSink> {
    /// Start `Disconnected` with no telemetry.
    pub fn new() -> Self {
        Self::starting_in(ConnectionState::Disconnected)
    }

    /// Start in `state`; mostly for tests and in-process stores that are
    /// ready from the outset.
    pub fn starting_in(state: ConnectionState) -> Self {
        Self {
            state: Arc::new(AtomicU8::new(state.to_u8())),
            shut_down: Arc::new(AtomicBool::new(false)),
            sink: NullSink,
        }
    }
}

impl<T> ConnectionLifecycle<T> {
    /// Route transition events to `sink`. The state is shared with `self`.
    pub fn with_sink<U>(self, sink: U) -> ConnectionLifecycle<U> {
        ConnectionLifecycle { state: self.state, shut_down: self.shut_down, sink }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Only `Ready` is available; everything else means fail-open.
    pub fn is_available(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Whether [`shutdown`](Self::shutdown) has run. Background connect and
    /// reconnect tasks stop once this is set.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl<T> ConnectionLifecycle<T>
where
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    /// Apply a connection event and return the resulting state.
    ///
    /// # Errors
    /// Returns [`LifecycleError::InvalidTransition`] and leaves the state
    /// untouched when `event` is not legal in the current state, and
    /// [`LifecycleError::ShutDown`] for anything but `Error`/`End` after
    /// [`shutdown`](Self::shutdown).
    pub async fn apply(&self, event: ConnectionEvent) -> Result<ConnectionState, LifecycleError> {
        let (from, to) = self.transition(event)?;
        if from != to {
            self.announce(from, to).await;
        }
        Ok(to)
    }

    fn transition(
        &self,
        event: ConnectionEvent,
    ) -> Result<(ConnectionState, ConnectionState), LifecycleError> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if self.is_shut_down() && !matches!(event, ConnectionEvent::Error | ConnectionEvent::End)
            {
                tracing::debug!(?event, "ignoring connection event after shutdown");
                return Err(LifecycleError::ShutDown { event });
            }
            let from = ConnectionState::from_u8(current);
            let to = next_state(from, event).ok_or_else(|| {
                tracing::debug!(state = %from, ?event, "ignoring invalid connection event");
                LifecycleError::InvalidTransition { from, event }
            })?;
            match self.state.compare_exchange(
                current,
                to.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok((from, to)),
                Err(actual) => current = actual,
            }
        }
    }

    async fn announce(&self, from: ConnectionState, to: ConnectionState) {
        match to {
            ConnectionState::Ready => tracing::info!(%from, "store connection → ready"),
            ConnectionState::Disconnected => {
                tracing::warn!(%from, "store connection → disconnected; admitting unmetered")
            }
            _ => tracing::info!(%from, %to, "store connection state changed"),
        }
        emit_best_effort(self.sink.clone(), LimiterEvent::Connection { from, to }).await;
    }

    /// Move to `Disconnected` for good, closing the store if it was `Ready`.
    ///
    /// Already `Disconnected` is a no-op. A pending `Connecting` or
    /// `Reconnecting` is abandoned without calling `close`. Afterwards every
    /// event except `Error` and `End` is rejected, so a connect or reconnect
    /// task still in flight cannot bring the state back. The state ends
    /// `Disconnected` even when `close` fails; the error is returned for the
    /// caller to log.
    pub async fn shutdown<S>(&self, store: &S) -> Result<(), StoreError>
    where
        S: BucketStore + ?Sized,
    {
        self.shut_down.store(true, Ordering::Release);
        let Ok((from, to)) = self.transition(ConnectionEvent::End) else {
            return Ok(());
        };
        if from == to {
            return Ok(());
        }
        let closed = if from == ConnectionState::Ready { store.close().await } else { Ok(()) };
        self.announce(from, to).await;
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rate_limit::store::InMemoryBucketStore;
    use crate::telemetry::MemorySink;
    use ConnectionEvent as E;
    use ConnectionState as S;

    #[tokio::test]
    async fn happy_path_connect_ready() {
        let lc = ConnectionLifecycle::new();
        assert_eq!(lc.state(), S::Disconnected);
        assert!(!lc.is_available());
        assert_eq!(lc.apply(E::Connect).await.unwrap(), S::Connecting);
        assert!(!lc.is_available());
        assert_eq!(lc.apply(E::Ready).await.unwrap(), S::Ready);
        assert!(lc.is_available());
    }

    #[tokio::test]
    async fn reconnect_cycle() {
        let lc = ConnectionLifecycle::starting_in(S::Ready);
        assert_eq!(lc.apply(E::Reconnecting).await.unwrap(), S::Reconnecting);
        assert!(!lc.is_available());
        assert_eq!(lc.apply(E::Ready).await.unwrap(), S::Ready);
        assert!(lc.is_available());
    }

    #[tokio::test]
    async fn error_and_end_disconnect_from_anywhere() {
        for start in [S::Connecting, S::Ready, S::Reconnecting, S::Disconnected] {
            let lc = ConnectionLifecycle::starting_in(start);
            assert_eq!(lc.apply(E::Error).await.unwrap(), S::Disconnected);
            let lc = ConnectionLifecycle::starting_in(start);
            assert_eq!(lc.apply(E::End).await.unwrap(), S::Disconnected);
        }
    }

    #[tokio::test]
    async fn ready_from_disconnected_is_rejected() {
        let lc = ConnectionLifecycle::new();
        let err = lc.apply(E::Ready).await.unwrap_err();
        assert_eq!(err, LifecycleError::InvalidTransition { from: S::Disconnected, event: E::Ready });
        assert_eq!(lc.state(), S::Disconnected);

        let lc = ConnectionLifecycle::starting_in(S::Ready);
        assert!(lc.apply(E::Connect).await.is_err());
        assert_eq!(lc.state(), S::Ready);
    }

    #[tokio::test]
    async fn clones_share_state() {
        let lc = ConnectionLifecycle::new();
        let reader = lc.clone();
        lc.apply(E::Connect).await.unwrap();
        lc.apply(E::Ready).await.unwrap();
        assert!(reader.is_available());
    }

    #[tokio::test]
    async fn transitions_are_emitted_to_sink() {
        let sink = MemorySink::new();
        let lc = ConnectionLifecycle::new().with_sink(sink.clone());
        lc.apply(E::Connect).await.unwrap();
        lc.apply(E::Ready).await.unwrap();
        lc.apply(E::Ready).await.unwrap(); // no change, no event
        assert_eq!(
            sink.events(),
            vec![
                LimiterEvent::Connection { from: S::Disconnected, to: S::Connecting },
                LimiterEvent::Connection { from: S::Connecting, to: S::Ready },
            ]
        );
    }

    #[tokio::test]
    async fn shutdown_closes_ready_store_once() {
        let store = InMemoryBucketStore::new(ManualClock::new(0));
        let lc = ConnectionLifecycle::starting_in(S::Ready);
        lc.shutdown(&store).await.unwrap();
        assert_eq!(lc.state(), S::Disconnected);
        assert_eq!(store.close_count(), 1);

        // already disconnected: no-op, not an error
        lc.shutdown(&store).await.unwrap();
        assert_eq!(store.close_count(), 1);
    }

    #[tokio::test]
    async fn shutdown_while_connecting_skips_close() {
        let store = InMemoryBucketStore::new(ManualClock::new(0));
        let lc = ConnectionLifecycle::starting_in(S::Connecting);
        lc.shutdown(&store).await.unwrap();
        assert_eq!(lc.state(), S::Disconnected);
        assert_eq!(store.close_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_is_terminal() {
        let store = InMemoryBucketStore::new(ManualClock::new(0));
        let lc = ConnectionLifecycle::starting_in(S::Connecting);
        let connector = lc.clone();
        lc.shutdown(&store).await.unwrap();
        assert!(connector.is_shut_down());

        for event in [E::Connect, E::Ready, E::Reconnecting] {
            assert_eq!(connector.apply(event).await, Err(LifecycleError::ShutDown { event }));
            assert_eq!(lc.state(), S::Disconnected);
        }
        assert_eq!(connector.apply(E::Error).await, Ok(S::Disconnected));
        assert_eq!(connector.apply(E::End).await, Ok(S::Disconnected));
    }

    #[tokio::test]
    async fn shutdown_from_disconnected_still_stops_reconnects() {
        let store = InMemoryBucketStore::new(ManualClock::new(0));
        let lc = ConnectionLifecycle::starting_in(S::Ready);
        lc.apply(E::Error).await.unwrap();
        lc.shutdown(&store).await.unwrap();
        assert_eq!(store.close_count(), 0);
        assert!(lc.apply(E::Reconnecting).await.is_err());
        assert_eq!(lc.state(), S::Disconnected);
    }

    #[tokio::test]
    async fn shutdown_is_shared_with_resinked_handles() {
        let store = InMemoryBucketStore::new(ManualClock::new(0));
        let lc = ConnectionLifecycle::starting_in(S::Ready);
        let sink = MemorySink::new();
        let observed = lc.clone().with_sink(sink.clone());
        observed.shutdown(&store).await.unwrap();
        assert!(lc.is_shut_down());
        assert_eq!(store.close_count(), 1);
        assert_eq!(
            sink.events(),
            vec![LimiterEvent::Connection { from: S::Ready, to: S::Disconnected }]
        );
    }
}
