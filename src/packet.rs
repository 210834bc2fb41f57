use std::fmt::{Debug, Display, Formatter};
use bytes::Bytes;
use crate::clock::Timestamp;
use crate::sequence::SequenceNumber;

/// Transport session identifier: the sender's globally unique source id (GSI) combined with
///  its source port. There is one receive window per TSI.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct Tsi {
    pub gsi: [u8; 6],
    pub source_port: u16,
}

impl Tsi {
    pub fn new(gsi: [u8; 6], source_port: u16) -> Tsi {
        Tsi { gsi, source_port }
    }
}

impl Display for Tsi {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.gsi;
        write!(f, "{}.{}.{}.{}.{}.{}.{}", a, b, c, d, e, g, self.source_port)
    }
}

impl Debug for Tsi {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

/// The fragmentation option of a packet that carries part of a multi-packet APDU
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct FragmentInfo {
    /// sequence number of the APDU's first fragment
    pub apdu_first_sqn: SequenceNumber,
    /// offset of this fragment's payload inside the APDU
    pub offset: u32,
    /// total length of the APDU
    pub total_length: u32,
}

/// A parsed ODATA / RDATA (or parity) packet as handed to the receive window
#[derive(Clone, Debug)]
pub struct ReceivedPacket {
    pub tsi: Tsi,
    pub sequence: SequenceNumber,
    /// `None` if the packet carries a complete APDU
    pub fragment: Option<FragmentInfo>,
    pub payload: Bytes,
    pub timestamp: Timestamp,
}

impl ReceivedPacket {
    /// true if this packet is the first (or only) packet of an APDU
    pub fn starts_apdu(&self) -> bool {
        match &self.fragment {
            None => true,
            Some(fragment) => fragment.apdu_first_sqn == self.sequence,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[cfg(test)]
pub(crate) fn test_packet(sequence: u32, payload: &[u8]) -> ReceivedPacket {
    ReceivedPacket {
        tsi: Tsi::new([1, 2, 3, 4, 5, 6], 7500),
        sequence: SequenceNumber::from_raw(sequence),
        fragment: None,
        payload: Bytes::copy_from_slice(payload),
        timestamp: Timestamp::ZERO,
    }
}

#[cfg(test)]
pub(crate) fn test_fragment(sequence: u32, apdu_first_sqn: u32, offset: u32, total_length: u32, payload: &[u8]) -> ReceivedPacket {
    ReceivedPacket {
        fragment: Some(FragmentInfo {
            apdu_first_sqn: SequenceNumber::from_raw(apdu_first_sqn),
            offset,
            total_length,
        }),
        ..test_packet(sequence, payload)
    }
}
