use std::fmt::{Display, Formatter};
use bitflags::bitflags;
use crate::fec::TransmissionGroup;

/// The primary outcome of a mutating receive window operation. None of these is an error
///  in the sense of the API - they tell the caller what happened to its input.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum RxwOutcome {
    Ok,
    /// the operation created placeholders without storing data
    CreatedPlaceholder,
    /// data was stored in a slot that was waiting for it
    FilledPlaceholder,
    /// the packet moved the window's leading edge forward
    AdvancedWindow,
    /// the sequence number is before the window's trailing edge (or already delivered)
    NotInWindow,
    /// the operation requires a defined window
    WindowUndefined,
    /// the slot already holds this packet's data
    Duplicate,
    /// the data arrived for a sequence number that was already given up
    ApduLost,
    /// the packet's fragment metadata is inconsistent - it was dropped
    MalformedApdu,
    /// the operation referred to a sequence number the window does not track
    Unknown,
    /// the window was shut down
    WindowGone,
}

impl RxwOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RxwOutcome::Ok => "PGM_RXW_OK",
            RxwOutcome::CreatedPlaceholder => "PGM_RXW_CREATED_PLACEHOLDER",
            RxwOutcome::FilledPlaceholder => "PGM_RXW_FILLED_PLACEHOLDER",
            RxwOutcome::AdvancedWindow => "PGM_RXW_ADVANCED_WINDOW",
            RxwOutcome::NotInWindow => "PGM_RXW_NOT_IN_TXW",
            RxwOutcome::WindowUndefined => "PGM_RXW_WINDOW_UNDEFINED",
            RxwOutcome::Duplicate => "PGM_RXW_DUPLICATE",
            RxwOutcome::ApduLost => "PGM_RXW_APDU_LOST",
            RxwOutcome::MalformedApdu => "PGM_RXW_MALFORMED_APDU",
            RxwOutcome::Unknown => "PGM_RXW_UNKNOWN",
            RxwOutcome::WindowGone => "PGM_RXW_WINDOW_GONE",
        }
    }
}

impl Display for RxwOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags! {
    /// side effects that can accompany any primary outcome
    #[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
    pub struct RxwFlags: u8 {
        /// the packet starts a new APDU
        const NEW_APDU = 0b01;
        /// the window took over the packet's payload buffer
        const CONSUMED_SLOT = 0b10;
    }
}

/// Result of a mutating receive window operation: a primary outcome, a set of flags and
///  optionally a transmission group that became reconstructable through this operation.
///
/// NB: Reconstruction is not done by the window itself, since FEC decoding must not happen
///      while holding the window's lock. The caller passes the group to a
///      [crate::fec::FecDecoder] and feeds the result back via `push_nth_repair`.
#[derive(Debug)]
#[must_use]
pub struct RxwResult {
    pub outcome: RxwOutcome,
    pub flags: RxwFlags,
    pub repairable: Option<TransmissionGroup>,
}

impl RxwResult {
    pub fn new(outcome: RxwOutcome) -> RxwResult {
        RxwResult {
            outcome,
            flags: RxwFlags::empty(),
            repairable: None,
        }
    }

    pub fn with_flags(outcome: RxwOutcome, flags: RxwFlags) -> RxwResult {
        RxwResult {
            outcome,
            flags,
            repairable: None,
        }
    }

    pub fn is_new_apdu(&self) -> bool {
        self.flags.contains(RxwFlags::NEW_APDU)
    }

    pub fn consumed_slot(&self) -> bool {
        self.flags.contains(RxwFlags::CONSUMED_SLOT)
    }
}

impl PartialEq<RxwOutcome> for RxwResult {
    fn eq(&self, other: &RxwOutcome) -> bool {
        self.outcome == *other
    }
}
