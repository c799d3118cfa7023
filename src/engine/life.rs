//! Per-direction stream lifecycle tracking.
//!
//! Every bridged entity owns a pair of half-duplex streams whose
//! open/close progress is tracked independently. The guards here back
//! the idempotent `*_if_necessary` teardown paths: closing an already
//! closed direction is a no-op, checked explicitly.

/// Lifecycle of one stream direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum Phase {
    #[default]
    Idle,
    Opening,
    Open,
    Closing,
    Closed,
}

/// One half of a stream pair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct HalfLife {
    phase: Phase,
}

impl HalfLife {
    /// Mark the direction as opening; later phases are preserved.
    pub(crate) fn opening(&mut self) {
        if self.phase == Phase::Idle {
            self.phase = Phase::Opening;
        }
    }

    /// Mark the direction open; a closed direction stays closed.
    pub(crate) fn open(&mut self) {
        if matches!(self.phase, Phase::Idle | Phase::Opening) {
            self.phase = Phase::Open;
        }
    }

    /// Request an orderly close once the direction is writable again.
    pub(crate) fn closing(&mut self) {
        if self.phase != Phase::Closed {
            self.phase = Phase::Closing;
        }
    }

    /// Mark the direction closed.
    pub(crate) fn close(&mut self) { self.phase = Phase::Closed; }

    pub(crate) fn is_open(self) -> bool { self.phase == Phase::Open }

    pub(crate) fn is_closing(self) -> bool { self.phase == Phase::Closing }

    pub(crate) fn is_closed(self) -> bool { self.phase == Phase::Closed }
}

/// Lifecycle of an initial/reply stream pair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct DuplexLife {
    pub(crate) initial: HalfLife,
    pub(crate) reply: HalfLife,
}

impl DuplexLife {
    /// Whether both directions have closed.
    pub(crate) fn is_closed(self) -> bool {
        self.initial.is_closed() && self.reply.is_closed()
    }
}
