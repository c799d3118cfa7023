//! Connection open/close handshake tracking.
//!
//! AMQP 1.0 prefixes every connection with a protocol header exchange
//! followed by an OPEN/CLOSE handshake. [`transition`] is the single
//! source of truth for which header/open/close events are legal in
//! which state; the engine never re-derives legality ad hoc.

/// Progress of one connection through the header/open/close handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Nothing exchanged yet.
    Start,
    /// Peer header seen, ours not yet sent.
    HeaderReceived,
    /// Our header sent, peer header outstanding.
    HeaderSent,
    /// Both headers exchanged.
    HeadersExchanged,
    /// OPEN sent before the peer header arrived.
    OpenPipelined,
    /// OPEN and CLOSE both sent before the peer header arrived.
    OpenClosePipelined,
    /// Peer OPEN received, ours outstanding.
    OpenReceived,
    /// Our OPEN sent, peer OPEN outstanding.
    OpenSent,
    /// CLOSE sent while the peer OPEN is still outstanding.
    ClosePipelined,
    /// OPEN exchanged in both directions.
    Opened,
    /// Peer CLOSE received, ours outstanding.
    CloseReceived,
    /// Our CLOSE sent, peer CLOSE outstanding.
    CloseSent,
    /// Draining remaining inbound bytes before teardown.
    Discarding,
    /// Handshake completed in both directions.
    Ended,
    /// Protocol violation; the connection must be torn down.
    Error,
}

/// Handshake events observed by the connection engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    ReceivedHeader,
    SentHeader,
    ReceivedOpen,
    SentOpen,
    ReceivedClose,
    SentClose,
}

impl ConnectionState {
    /// Whether no further transitions may be attempted from this state.
    #[must_use]
    pub const fn is_terminal(self) -> bool { matches!(self, Self::Ended | Self::Error) }
}

/// Advance the handshake by one event.
///
/// Pure and total: every `(state, event)` pair not listed below maps to
/// [`ConnectionState::Error`], which callers treat as a protocol
/// violation. No transition is attempted out of a terminal state by the
/// engine; feeding one here also yields `Error`.
#[must_use]
pub const fn transition(state: ConnectionState, event: ConnectionEvent) -> ConnectionState {
    use ConnectionEvent as E;
    use ConnectionState as S;

    match (state, event) {
        (S::Start, E::ReceivedHeader) => S::HeaderReceived,
        (S::Start, E::SentHeader) => S::HeaderSent,
        (S::HeaderReceived, E::SentHeader) => S::HeadersExchanged,
        (S::HeaderSent, E::ReceivedHeader) => S::HeadersExchanged,
        (S::HeaderSent, E::SentOpen) => S::OpenPipelined,
        (S::HeadersExchanged, E::ReceivedOpen) => S::OpenReceived,
        (S::HeadersExchanged, E::SentOpen) => S::OpenSent,
        (S::OpenPipelined, E::ReceivedHeader) => S::OpenSent,
        (S::OpenPipelined, E::SentClose) => S::OpenClosePipelined,
        (S::OpenClosePipelined, E::ReceivedHeader) => S::ClosePipelined,
        (S::OpenReceived, E::SentOpen) => S::Opened,
        (S::OpenSent, E::ReceivedOpen) => S::Opened,
        (S::OpenSent, E::SentClose) => S::ClosePipelined,
        (S::ClosePipelined, E::ReceivedOpen) => S::CloseSent,
        (S::Opened, E::ReceivedClose) => S::CloseReceived,
        (S::Opened, E::SentClose) => S::CloseSent,
        (S::CloseReceived, E::SentClose) => S::Ended,
        (S::CloseSent, E::ReceivedClose) => S::Ended,
        _ => S::Error,
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{ConnectionEvent as E, ConnectionState as S, transition};

    const ALL_STATES: [S; 15] = [
        S::Start,
        S::HeaderReceived,
        S::HeaderSent,
        S::HeadersExchanged,
        S::OpenPipelined,
        S::OpenClosePipelined,
        S::OpenReceived,
        S::OpenSent,
        S::ClosePipelined,
        S::Opened,
        S::CloseReceived,
        S::CloseSent,
        S::Discarding,
        S::Ended,
        S::Error,
    ];

    const ALL_EVENTS: [E; 6] = [
        E::ReceivedHeader,
        E::SentHeader,
        E::ReceivedOpen,
        E::SentOpen,
        E::ReceivedClose,
        E::SentClose,
    ];

    #[rstest]
    #[case(S::Start, E::ReceivedHeader, S::HeaderReceived)]
    #[case(S::Start, E::SentHeader, S::HeaderSent)]
    #[case(S::HeaderReceived, E::SentHeader, S::HeadersExchanged)]
    #[case(S::HeaderSent, E::ReceivedHeader, S::HeadersExchanged)]
    #[case(S::HeadersExchanged, E::ReceivedOpen, S::OpenReceived)]
    #[case(S::HeadersExchanged, E::SentOpen, S::OpenSent)]
    #[case(S::OpenReceived, E::SentOpen, S::Opened)]
    #[case(S::OpenSent, E::ReceivedOpen, S::Opened)]
    #[case(S::Opened, E::ReceivedClose, S::CloseReceived)]
    #[case(S::Opened, E::SentClose, S::CloseSent)]
    #[case(S::CloseReceived, E::SentClose, S::Ended)]
    #[case(S::CloseSent, E::ReceivedClose, S::Ended)]
    fn defined_transitions(#[case] from: S, #[case] event: E, #[case] to: S) {
        assert_eq!(transition(from, event), to);
    }

    #[rstest]
    #[case(S::HeaderSent, E::SentOpen, S::OpenPipelined)]
    #[case(S::OpenPipelined, E::ReceivedHeader, S::OpenSent)]
    #[case(S::OpenPipelined, E::SentClose, S::OpenClosePipelined)]
    #[case(S::OpenClosePipelined, E::ReceivedHeader, S::ClosePipelined)]
    #[case(S::OpenSent, E::SentClose, S::ClosePipelined)]
    #[case(S::ClosePipelined, E::ReceivedOpen, S::CloseSent)]
    fn pipelined_transitions(#[case] from: S, #[case] event: E, #[case] to: S) {
        assert_eq!(transition(from, event), to);
    }

    /// Every pair outside the explicit table maps to `Error`.
    #[test]
    fn undefined_pairs_map_to_error() {
        let defined: &[(S, E)] = &[
            (S::Start, E::ReceivedHeader),
            (S::Start, E::SentHeader),
            (S::HeaderReceived, E::SentHeader),
            (S::HeaderSent, E::ReceivedHeader),
            (S::HeaderSent, E::SentOpen),
            (S::HeadersExchanged, E::ReceivedOpen),
            (S::HeadersExchanged, E::SentOpen),
            (S::OpenPipelined, E::ReceivedHeader),
            (S::OpenPipelined, E::SentClose),
            (S::OpenClosePipelined, E::ReceivedHeader),
            (S::OpenReceived, E::SentOpen),
            (S::OpenSent, E::ReceivedOpen),
            (S::OpenSent, E::SentClose),
            (S::ClosePipelined, E::ReceivedOpen),
            (S::Opened, E::ReceivedClose),
            (S::Opened, E::SentClose),
            (S::CloseReceived, E::SentClose),
            (S::CloseSent, E::ReceivedClose),
        ];

        for state in ALL_STATES {
            for event in ALL_EVENTS {
                if defined.contains(&(state, event)) {
                    continue;
                }
                assert_eq!(
                    transition(state, event),
                    S::Error,
                    "expected ({state:?}, {event:?}) to be undefined",
                );
            }
        }
    }

    #[rstest]
    #[case(S::Ended)]
    #[case(S::Error)]
    fn terminal_states_absorb_all_events(#[case] state: S) {
        assert!(state.is_terminal());
        for event in ALL_EVENTS {
            assert_eq!(transition(state, event), S::Error);
        }
    }
}
