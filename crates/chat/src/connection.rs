//! Connection status for the realtime relay.
//!
//! Connecting -> Connected -> Reconnecting { attempt } -> Connected
//!                                                    \-> Disconnected
//!
//! Status changes are published on a watch channel so health checks and the
//! hub can observe them without locking.

use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;

use crate::backoff::Backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Disconnected,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting { .. } => "reconnecting",
            ConnectionStatus::Disconnected => "disconnected",
        }
    }
}

pub struct ConnectionState {
    backoff: Backoff,
    tx: watch::Sender<ConnectionStatus>,
    was_connected: bool,
}

impl ConnectionState {
    pub fn new(backoff: Backoff) -> Self {
        let (tx, _rx) = watch::channel(ConnectionStatus::Connecting);
        Self {
            backoff,
            tx,
            was_connected: false,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.tx.subscribe()
    }

    /// Mark the link up. Returns true if this is a reconnect (a previous
    /// connection existed), in which case subscribers should resync.
    pub fn on_connected(&mut self) -> bool {
        self.backoff.reset();
        self.tx.send_replace(ConnectionStatus::Connected);
        std::mem::replace(&mut self.was_connected, true)
    }

    /// Mark the link down and return how long to wait before retrying.
    /// `None` means the retry budget is spent and the state is Disconnected.
    pub fn on_disconnected(&mut self) -> Option<Duration> {
        self.on_disconnected_with(None)
    }

    pub fn on_disconnected_with(&mut self, jitter: Option<f64>) -> Option<Duration> {
        let delay = match jitter {
            Some(j) => self.backoff.next_delay_with(j),
            None => self.backoff.next_delay(),
        };
        match delay {
            Some(d) => {
                self.tx.send_replace(ConnectionStatus::Reconnecting {
                    attempt: self.backoff.attempt(),
                });
                Some(d)
            }
            None => {
                self.tx.send_replace(ConnectionStatus::Disconnected);
                None
            }
        }
    }

    pub fn close(&mut self) {
        self.tx.send_replace(ConnectionStatus::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_the_state_machine() {
        let mut state = ConnectionState::new(Backoff::default());
        let rx = state.subscribe();
        assert_eq!(state.status(), ConnectionStatus::Connecting);

        assert!(!state.on_connected());
        assert!(state.status().is_connected());

        assert_eq!(state.on_disconnected_with(Some(1.0)), Some(Duration::from_millis(500)));
        assert_eq!(state.status(), ConnectionStatus::Reconnecting { attempt: 1 });
        assert_eq!(state.on_disconnected_with(Some(1.0)), Some(Duration::from_secs(1)));
        assert_eq!(*rx.borrow(), ConnectionStatus::Reconnecting { attempt: 2 });

        assert!(state.on_connected());
        assert_eq!(state.status().label(), "connected");

        // backoff restarts from the base after a good connection
        assert_eq!(state.on_disconnected_with(Some(1.0)), Some(Duration::from_millis(500)));
    }

    #[test]
    fn gives_up_when_budget_spent() {
        let mut state = ConnectionState::new(Backoff::default().with_max_attempts(1));
        assert!(state.on_disconnected().is_some());
        assert!(state.on_disconnected().is_none());
        assert_eq!(state.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn status_serializes_with_state_tag() {
        let json = serde_json::to_value(ConnectionStatus::Reconnecting { attempt: 3 }).unwrap();
        assert_eq!(json["state"], "reconnecting");
        assert_eq!(json["attempt"], 3);
    }
}
