//! The FEC seam: the receive window tracks parity packets and recognizes when a transmission
//!  group has enough members to reconstruct its missing originals, but the actual decoding
//!  is done by an external [FecDecoder] (e.g. Reed-Solomon), outside the window's lock.

use bytes::Bytes;
use crate::packet::Tsi;
use crate::sequence::SequenceNumber;

/// A member of a transmission group; `payload` is `None` for members whose original data is
///  missing and needs to be reconstructed
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GroupMember {
    pub sequence: SequenceNumber,
    pub payload: Option<Bytes>,
}

/// A parity packet; `index` is its position in the group's parity set (the 'h' of the packet)
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParityPacket {
    pub index: u32,
    pub payload: Bytes,
}

/// A snapshot of a transmission group, taken when the window has as many parity packets as
///  the group has missing members. Payloads are reference counted, so taking the snapshot
///  does not copy data.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransmissionGroup {
    pub tsi: Tsi,
    pub first_sqn: SequenceNumber,
    pub members: Vec<GroupMember>,
    pub parity: Vec<ParityPacket>,
}

impl TransmissionGroup {
    pub fn tg_size(&self) -> usize {
        self.members.len()
    }

    pub fn missing(&self) -> impl Iterator<Item = SequenceNumber> + '_ {
        self.members.iter()
            .filter(|m| m.payload.is_none())
            .map(|m| m.sequence)
    }
}

/// Reconstructs original data from the data and parity members of a transmission group
#[cfg_attr(test, mockall::automock)]
pub trait FecDecoder: Send + Sync + 'static {
    fn reconstruct(&self, group: &TransmissionGroup, missing: SequenceNumber) -> anyhow::Result<Bytes>;
}

/// A single-parity XOR code for tests: the parity packet is the XOR of all originals, which
///  allows reconstructing exactly one missing member of equal length.
#[cfg(test)]
pub(crate) struct XorDecoder;

#[cfg(test)]
pub(crate) fn xor_parity(payloads: &[&[u8]]) -> Bytes {
    let len = payloads.iter().map(|p| p.len()).max().unwrap_or(0);
    let mut result = vec![0u8; len];
    for p in payloads {
        for (i, b) in p.iter().enumerate() {
            result[i] ^= b;
        }
    }
    Bytes::from(result)
}

#[cfg(test)]
impl FecDecoder for XorDecoder {
    fn reconstruct(&self, group: &TransmissionGroup, missing: SequenceNumber) -> anyhow::Result<Bytes> {
        if group.missing().count() != 1 || group.parity.len() != 1 {
            anyhow::bail!("XOR parity can only restore a single missing packet");
        }
        if group.missing().next() != Some(missing) {
            anyhow::bail!("packet {} is not missing", missing);
        }

        let mut inputs: Vec<&[u8]> = group.members.iter()
            .filter_map(|m| m.payload.as_deref())
            .collect();
        inputs.push(group.parity[0].payload.as_ref());
        Ok(xor_parity(&inputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(sqn: u32, payload: Option<&'static [u8]>) -> GroupMember {
        GroupMember {
            sequence: SequenceNumber::from_raw(sqn),
            payload: payload.map(Bytes::from_static),
        }
    }

    #[test]
    fn test_missing() {
        let group = TransmissionGroup {
            tsi: Default::default(),
            first_sqn: SequenceNumber::from_raw(4),
            members: vec![member(4, Some(&b"a"[..])), member(5, None), member(6, Some(&b"c"[..])), member(7, None)],
            parity: vec![],
        };
        assert_eq!(group.tg_size(), 4);
        assert_eq!(group.missing().collect::<Vec<_>>(), vec![SequenceNumber::from_raw(5), SequenceNumber::from_raw(7)]);
    }

    #[test]
    fn test_xor_decoder() {
        let parity = xor_parity(&[&b"abcd"[..], &b"efgh"[..], &b"ijkl"[..], &b"mnop"[..]]);
        let group = TransmissionGroup {
            tsi: Default::default(),
            first_sqn: SequenceNumber::ZERO,
            members: vec![member(0, Some(&b"abcd"[..])), member(1, Some(&b"efgh"[..])), member(2, None), member(3, Some(&b"mnop"[..]))],
            parity: vec![ParityPacket { index: 0, payload: parity }],
        };

        assert_eq!(XorDecoder.reconstruct(&group, SequenceNumber::from_raw(2)).unwrap().as_ref(), b"ijkl");
        assert!(XorDecoder.reconstruct(&group, SequenceNumber::from_raw(1)).is_err());
    }
}
