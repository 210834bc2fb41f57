use std::fmt::{Display, Formatter};

/// The lifecycle state of a single slot in the receive window.
///
/// ```ascii
///  gap detected     BACK_OFF ──expiry/NAK──> WAIT_NCF ──NCF──> WAIT_DATA
///                       │  └──────────NCF───────────────────────┘  │
///                       │             (retries exhausted)          │
///                       └─────────────> LOST_DATA <────────────────┘
///
///  any repair state ──data──> HAVE_DATA ──readv──> COMMIT_DATA ──release──> (reclaimed)
///                                                      └─TG unresolved─> PARITY_DATA
///  repair state ──parity──> HAVE_PARITY ──FEC reconstruction──> HAVE_DATA
/// ```
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum PacketState {
    /// gap detected, waiting a back-off interval before sending the first NAK
    BackOff,
    /// NAK sent, waiting for the sender's confirmation
    WaitNcf,
    /// NAK confirmed, waiting for the repair data
    WaitData,
    /// data received, waiting to be committed to the application
    HaveData,
    /// holds a parity packet in lieu of its original data; repair by NAK continues in parallel
    HaveParity,
    /// data delivered to the application, slot not reclaimed yet
    CommitData,
    /// delivered data retained as input for reconstructing a sibling in its transmission group
    ParityData,
    /// repair failed or was given up
    LostData,
}

impl PacketState {
    /// true for states in which the slot waits for its original data
    pub fn is_repair_pending(&self) -> bool {
        matches!(self, PacketState::BackOff | PacketState::WaitNcf | PacketState::WaitData | PacketState::HaveParity)
    }

    /// true for states in which the slot holds its original (or reconstructed) data
    pub fn has_data(&self) -> bool {
        matches!(self, PacketState::HaveData | PacketState::CommitData | PacketState::ParityData)
    }

    /// true for states that were handed to the application and only wait to be reclaimed
    pub fn is_committed(&self) -> bool {
        matches!(self, PacketState::CommitData | PacketState::ParityData)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PacketState::BackOff => "PGM_PKT_BACK_OFF_STATE",
            PacketState::WaitNcf => "PGM_PKT_WAIT_NCF_STATE",
            PacketState::WaitData => "PGM_PKT_WAIT_DATA_STATE",
            PacketState::HaveData => "PGM_PKT_HAVE_DATA_STATE",
            PacketState::HaveParity => "PGM_PKT_HAVE_PARITY_STATE",
            PacketState::CommitData => "PGM_PKT_COMMIT_DATA_STATE",
            PacketState::ParityData => "PGM_PKT_PARITY_DATA_STATE",
            PacketState::LostData => "PGM_PKT_LOST_DATA_STATE",
        }
    }
}

impl Display for PacketState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use PacketState::*;

    #[rstest]
    #[case(BackOff,    true,  false, false)]
    #[case(WaitNcf,    true,  false, false)]
    #[case(WaitData,   true,  false, false)]
    #[case(HaveParity, true,  false, false)]
    #[case(HaveData,   false, true,  false)]
    #[case(CommitData, false, true,  true)]
    #[case(ParityData, false, true,  true)]
    #[case(LostData,   false, false, false)]
    fn test_classification(#[case] state: PacketState, #[case] repair_pending: bool, #[case] has_data: bool, #[case] committed: bool) {
        assert_eq!(state.is_repair_pending(), repair_pending);
        assert_eq!(state.has_data(), has_data);
        assert_eq!(state.is_committed(), committed);
    }

    #[test]
    fn test_display() {
        assert_eq!(WaitNcf.to_string(), "PGM_PKT_WAIT_NCF_STATE");
        assert_eq!(LostData.to_string(), "PGM_PKT_LOST_DATA_STATE");
    }
}
