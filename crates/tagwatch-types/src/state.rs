//! Connection state machine for a single tracker.
//!
//! The radio stack reports link changes asynchronously and the coordinator
//! issues connect/disconnect requests; both feed [`ConnectionState::apply`],
//! a pure function returning the next state together with the side effects
//! the caller must carry out. Keeping the graph here (rather than spread
//! across event handlers) makes every edge testable without a radio.
//!
//! Valid edges:
//!
//! ```text
//! disconnected -> connecting -> connected -> disconnecting -> disconnected
//! connecting   -> disconnected   (connect failed)
//! connected    -> disconnected   (link dropped)
//! ```

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Link state of a tracker as seen by the radio stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ConnectionState {
    /// No link and no pending connect.
    #[default]
    Disconnected,
    /// Connect issued, waiting for the radio to report the outcome.
    Connecting,
    /// Link established.
    Connected,
    /// Disconnect issued, waiting for the radio to confirm.
    Disconnecting,
}

impl ConnectionState {
    /// Every state, in graph order.
    pub const ALL: [ConnectionState; 4] = [
        ConnectionState::Disconnected,
        ConnectionState::Connecting,
        ConnectionState::Connected,
        ConnectionState::Disconnecting,
    ];

    /// Whether `self -> next` is an edge of the connection graph.
    ///
    /// Staying in the same state is not an edge.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnecting)
                | (Connected, Disconnected)
                | (Disconnecting, Disconnected)
        )
    }

    /// Apply an input to this state.
    ///
    /// Returns the resulting state and the ordered effects to perform.
    /// Inputs that arrive late or twice (a second disconnect report, a
    /// failure report after the device is already disconnected) resolve to
    /// a no-op transition. Anything else off the graph is rejected.
    pub fn apply(self, input: StateInput) -> Result<Transition, InvalidTransition> {
        use ConnectionState::*;
        use Effect::*;
        use StateInput::*;

        let transition = match (self, input) {
            (Disconnected, ConnectRequested) => Transition::to(Connecting, vec![IssueConnect]),
            (Connecting, ConnectRequested) => Transition::to(Connecting, vec![IssueConnect]),
            (Connecting, DidConnect) => Transition::to(
                Connected,
                vec![
                    CancelReconnect,
                    ResetLinkQuality,
                    DiscoverServices,
                    StartRssiSampling,
                    NotifyConnected,
                    RunPostConnectSequence,
                ],
            ),
            (Connecting, DidFailToConnect) | (Connecting, DidDisconnect) => {
                Transition::to(Disconnected, vec![ResetSession, NotifyConnectFailed])
            }
            (Connected, DisconnectRequested) => {
                Transition::to(Disconnecting, vec![IssueDisconnect])
            }
            (Connected, DidDisconnect) => Transition::to(
                Disconnected,
                vec![StopRssiSampling, ResetSession, ScheduleReconnect],
            ),
            (Disconnecting, DidDisconnect) => Transition::to(
                Disconnected,
                vec![StopRssiSampling, ResetSession, NotifyDisconnected],
            ),
            (Disconnected, DidDisconnect)
            | (Disconnected, DidFailToConnect)
            | (Disconnected, DisconnectRequested)
            | (Disconnecting, DisconnectRequested)
            | (Connected, ConnectRequested) => Transition::stay(self),
            (state, input) => return Err(InvalidTransition { state, input }),
        };

        Ok(transition)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

/// Something that can move a tracker along the connection graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum StateInput {
    /// The coordinator decided to connect.
    ConnectRequested,
    /// The coordinator decided to disconnect.
    DisconnectRequested,
    /// Radio callback: link established.
    DidConnect,
    /// Radio callback: link closed or dropped.
    DidDisconnect,
    /// Radio callback: connect attempt failed.
    DidFailToConnect,
}

impl StateInput {
    /// Every input.
    pub const ALL: [StateInput; 5] = [
        StateInput::ConnectRequested,
        StateInput::DisconnectRequested,
        StateInput::DidConnect,
        StateInput::DidDisconnect,
        StateInput::DidFailToConnect,
    ];
}

/// Side effect requested by a transition, performed by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Effect {
    /// Ask the radio to connect.
    IssueConnect,
    /// Ask the radio to disconnect.
    IssueDisconnect,
    /// Clear the RSSI window and adaptive-power flag.
    ResetLinkQuality,
    /// Run GATT service discovery.
    DiscoverServices,
    /// Start periodic RSSI reads.
    StartRssiSampling,
    /// Stop periodic RSSI reads.
    StopRssiSampling,
    /// Drop GATT bookkeeping and cancel queued commands.
    ResetSession,
    /// Enqueue the configuration sequence pushed on every connect.
    RunPostConnectSequence,
    /// Cancel a pending reconnect grace timer.
    CancelReconnect,
    /// Start the reconnect grace timer instead of reporting the drop.
    ScheduleReconnect,
    /// Emit a connected event.
    NotifyConnected,
    /// Emit a connect-failed event.
    NotifyConnectFailed,
    /// Emit a disconnected event (user-initiated disconnects).
    NotifyDisconnected,
}

/// Result of applying a [`StateInput`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// State after the input.
    pub next: ConnectionState,
    /// Effects to perform, in order.
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(next: ConnectionState, effects: Vec<Effect>) -> Self {
        Self { next, effects }
    }

    fn stay(state: ConnectionState) -> Self {
        Self {
            next: state,
            effects: Vec::new(),
        }
    }

    /// Whether the input left the state untouched and requested nothing.
    pub fn is_noop(&self) -> bool {
        self.effects.is_empty()
    }
}

/// An input that has no edge from the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition: {input:?} while {state}")]
pub struct InvalidTransition {
    /// State the tracker was in.
    pub state: ConnectionState,
    /// Rejected input.
    pub input: StateInput,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_happy_path() {
        let t = ConnectionState::Disconnected
            .apply(StateInput::ConnectRequested)
            .unwrap();
        assert_eq!(t.next, ConnectionState::Connecting);
        assert_eq!(t.effects, vec![Effect::IssueConnect]);

        let t = t.next.apply(StateInput::DidConnect).unwrap();
        assert_eq!(t.next, ConnectionState::Connected);
        assert!(t.effects.contains(&Effect::StartRssiSampling));
        assert!(t.effects.contains(&Effect::RunPostConnectSequence));
        // Each connection starts with an empty RSSI window.
        let reset = t.effects.iter().position(|e| *e == Effect::ResetLinkQuality);
        let sample = t.effects.iter().position(|e| *e == Effect::StartRssiSampling);
        assert!(reset.is_some());
        assert!(reset < sample);

        let t = t.next.apply(StateInput::DisconnectRequested).unwrap();
        assert_eq!(t.next, ConnectionState::Disconnecting);

        let t = t.next.apply(StateInput::DidDisconnect).unwrap();
        assert_eq!(t.next, ConnectionState::Disconnected);
        assert!(t.effects.contains(&Effect::NotifyDisconnected));
    }

    #[test]
    fn test_drop_schedules_reconnect_instead_of_notifying() {
        let t = ConnectionState::Connected
            .apply(StateInput::DidDisconnect)
            .unwrap();
        assert_eq!(t.next, ConnectionState::Disconnected);
        assert_eq!(
            t.effects,
            vec![
                Effect::StopRssiSampling,
                Effect::ResetSession,
                Effect::ScheduleReconnect
            ]
        );
        assert!(!t.effects.contains(&Effect::NotifyDisconnected));
    }

    #[test]
    fn test_connect_failure() {
        let t = ConnectionState::Connecting
            .apply(StateInput::DidFailToConnect)
            .unwrap();
        assert_eq!(t.next, ConnectionState::Disconnected);
        assert!(t.effects.contains(&Effect::NotifyConnectFailed));
    }

    #[test]
    fn test_connect_while_connecting_reissues() {
        let t = ConnectionState::Connecting
            .apply(StateInput::ConnectRequested)
            .unwrap();
        assert_eq!(t.next, ConnectionState::Connecting);
        assert_eq!(t.effects, vec![Effect::IssueConnect]);
    }

    #[test]
    fn test_duplicate_reports_are_noops() {
        let t = ConnectionState::Disconnected
            .apply(StateInput::DidDisconnect)
            .unwrap();
        assert!(t.is_noop());
        assert_eq!(t.next, ConnectionState::Disconnected);
    }

    #[test]
    fn test_off_graph_inputs_rejected() {
        let err = ConnectionState::Disconnected
            .apply(StateInput::DidConnect)
            .unwrap_err();
        assert_eq!(err.state, ConnectionState::Disconnected);
        assert_eq!(err.input, StateInput::DidConnect);

        assert!(
            ConnectionState::Disconnecting
                .apply(StateInput::ConnectRequested)
                .is_err()
        );
    }

    #[test]
    fn test_edge_table() {
        use ConnectionState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Disconnecting.can_transition_to(Connecting));
        assert!(!Connected.can_transition_to(Connected));
    }

    fn input_strategy() -> impl Strategy<Value = StateInput> {
        prop::sample::select(StateInput::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn prop_state_moves_only_along_edges(inputs in prop::collection::vec(input_strategy(), 0..64)) {
            let mut state = ConnectionState::Disconnected;
            for input in inputs {
                match state.apply(input) {
                    Ok(t) => {
                        prop_assert!(ConnectionState::ALL.contains(&t.next));
                        prop_assert!(t.next == state || state.can_transition_to(t.next));
                        state = t.next;
                    }
                    Err(e) => {
                        prop_assert_eq!(e.state, state);
                    }
                }
            }
        }
    }
}
