//! Delivery of completed data from the front of the receive window.
//!
//! Data is delivered in two steps: the window keeps `commit_lead` up to date after every
//!  mutation, marking the end of the run of complete APDUs (and lost sequence numbers) that
//!  starts at `commit_trail`. `readv` then hands out that run, moving `commit_trail`, and
//!  `release_committed` reclaims the delivered slots.

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};
use crate::result::RxwOutcome;
use crate::sequence::SequenceNumber;
use crate::state::PacketState;
use crate::window::WindowState;

/// An APDU handed to the application
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeliveredApdu {
    pub first_sqn: SequenceNumber,
    pub payload: Bytes,
}

#[derive(Debug)]
pub struct ReadvResult {
    pub outcome: RxwOutcome,
    /// complete APDUs in sequence order
    pub messages: Vec<DeliveredApdu>,
    /// total payload bytes in `messages`
    pub bytes: usize,
    /// number of sequence numbers given up since the previous `readv`
    pub lost: u32,
}

impl ReadvResult {
    pub fn new(outcome: RxwOutcome) -> ReadvResult {
        ReadvResult {
            outcome,
            messages: Vec::new(),
            bytes: 0,
            lost: 0,
        }
    }

    /// true if there was nothing to deliver or report
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.lost == 0
    }
}

enum ApduScan {
    /// all fragments are there, the last one at the given sequence number
    Complete(SequenceNumber),
    Incomplete,
    Lost,
    Malformed,
}

impl WindowState {
    pub(crate) fn has_pending(&self) -> bool {
        self.commit_trail != self.commit_lead || self.unreported_losses > 0
    }

    /// checks if the fragments of the APDU starting at `first` are all there
    fn scan_apdu(&self, first: SequenceNumber, total_length: u32) -> ApduScan {
        let mut received = 0u64;
        let mut sequence = first;
        loop {
            let Some(slot) = self.slots.get(sequence) else {
                return ApduScan::Incomplete;
            };
            if slot.state == PacketState::LostData {
                return ApduScan::Lost;
            }
            if slot.state.is_repair_pending() {
                return ApduScan::Incomplete;
            }

            match slot.fragment {
                Some(f) if f.apdu_first_sqn == first && f.total_length == total_length && f.offset as u64 == received => {
                    received += slot.payload_len() as u64;
                }
                _ => return ApduScan::Malformed,
            }

            if received == total_length as u64 {
                return ApduScan::Complete(sequence);
            }
            if received > total_length as u64 {
                return ApduScan::Malformed;
            }
            sequence = sequence.next();
        }
    }

    /// Moves `commit_lead` forward over complete APDUs and lost slots. Fragments that can never
    ///  become part of a complete APDU are marked lost on the way.
    pub(crate) fn advance_commit_lead(&mut self) {
        while self.commit_lead.before_or_eq(self.slots.lead()) {
            let sequence = self.commit_lead;
            let Some((state, fragment)) = self.slots.get(sequence).map(|slot| (slot.state, slot.fragment)) else {
                break;
            };

            match state {
                PacketState::LostData => self.commit_lead = sequence.next(),
                PacketState::HaveData => match fragment {
                    None => self.commit_lead = sequence.next(),
                    Some(f) if f.apdu_first_sqn != sequence => {
                        debug!("{}: #{} continues APDU #{} which is not in the window - dropping", self.tsi, sequence, f.apdu_first_sqn);
                        self.set_lost(sequence);
                    }
                    Some(f) => match self.scan_apdu(sequence, f.total_length) {
                        ApduScan::Complete(last) => {
                            trace!("{}: APDU #{}..#{} is complete", self.tsi, sequence, last);
                            self.commit_lead = last.next();
                        }
                        ApduScan::Incomplete => break,
                        ApduScan::Lost => {
                            debug!("{}: APDU #{} has a lost fragment - dropping it", self.tsi, sequence);
                            self.mark_lost_internal(sequence);
                        }
                        ApduScan::Malformed => {
                            warn!("{}: APDU #{} has inconsistent fragments - dropping it", self.tsi, sequence);
                            self.stats.malformed += 1;
                            self.mark_lost_internal(sequence);
                        }
                    },
                },
                s if s.is_repair_pending() => break,
                _ => self.commit_lead = sequence.next(),
            }
        }
    }

    /// Marks the complete APDU starting at `first` as committed, returning its payload and
    ///  the number of packets it spans
    fn commit_apdu(&mut self, first: SequenceNumber) -> Option<(Bytes, u32)> {
        let head = self.slots.get(first)?;
        let num_packets = match head.fragment {
            None => 1,
            Some(f) => match self.scan_apdu(first, f.total_length) {
                ApduScan::Complete(last) => first.distance(last) as u32 + 1,
                _ => return None,
            },
        };

        let payload = if num_packets == 1 {
            head.payload.clone().unwrap_or_default()
        }
        else {
            let total_length = head.fragment.map(|f| f.total_length).unwrap_or(0);
            let mut buf = BytesMut::with_capacity(total_length as usize);
            for sequence in first.to(first + num_packets) {
                if let Some(p) = self.slots.get(sequence).and_then(|slot| slot.payload.as_ref()) {
                    buf.extend_from_slice(p);
                }
            }
            buf.freeze()
        };

        for sequence in first.to(first + num_packets) {
            if let Some(slot) = self.slots.get_mut(sequence) {
                slot.state = PacketState::CommitData;
            }
        }
        Some((payload, num_packets))
    }

    /// Hands out up to `max_count` complete APDUs from the front of the window. Lost sequence
    ///  numbers are reported once (in `lost`) and skipped.
    pub(crate) fn readv(&mut self, max_count: usize) -> ReadvResult {
        let mut result = ReadvResult::new(RxwOutcome::Ok);
        result.lost = std::mem::take(&mut self.unreported_losses);

        while self.commit_trail != self.commit_lead && result.messages.len() < max_count {
            let first = self.commit_trail;
            let Some(state) = self.slots.get(first).map(|slot| slot.state) else {
                break;
            };

            if state == PacketState::LostData {
                result.lost += 1;
                self.commit_trail = first.next();
                continue;
            }

            let Some((payload, num_packets)) = self.commit_apdu(first) else {
                // the resolved run is out of date, e.g. after a slot was evicted
                self.commit_lead = self.commit_trail;
                break;
            };

            trace!("{}: delivering APDU #{} with {} bytes in {} packets", self.tsi, first, payload.len(), num_packets);
            self.commit_trail = first + num_packets;
            self.stats.bytes_delivered += payload.len() as u64;
            self.stats.msgs_delivered += 1;
            result.bytes += payload.len();
            result.messages.push(DeliveredApdu {
                first_sqn: first,
                payload,
            });
        }

        self.advance_commit_lead();
        result
    }

    /// true if a delivered slot must stay in the window because it is needed for
    ///  reconstructing a sibling in its transmission group
    fn is_retained_for_parity(&self, sequence: SequenceNumber) -> bool {
        if self.tg_size <= 1 {
            return false;
        }
        match self.slots.get(sequence) {
            Some(slot) if slot.state.is_committed() => {}
            _ => return false,
        }

        let tg_first = self.tg_first(sequence);
        let tg_end = tg_first + self.tg_size;
        if tg_end.prev().after(self.slots.lead()) {
            // the group is not complete yet
            return true;
        }

        let mut has_pending_member = false;
        for sqn in tg_first.to(tg_end) {
            match self.slots.get(sqn) {
                None => return false,
                Some(slot) if slot.state == PacketState::LostData => return false,
                Some(slot) if slot.state.is_repair_pending() => has_pending_member = true,
                Some(_) => {}
            }
        }
        has_pending_member
    }

    /// Reclaims delivered (or surfaced lost) slots from the trail, returning the number of
    ///  slots reclaimed. A delivered slot whose transmission group is still being repaired
    ///  becomes PARITY_DATA and stops the trail.
    pub(crate) fn release_committed(&mut self) -> u32 {
        let mut num_released = 0;
        while self.slots.trail().before(self.commit_trail) {
            let trail = self.slots.trail();
            if self.is_retained_for_parity(trail) {
                if let Some(slot) = self.slots.get_mut(trail) {
                    if slot.state == PacketState::CommitData {
                        trace!("{}: retaining #{} as parity data", self.tsi, trail);
                        slot.state = PacketState::ParityData;
                    }
                }
                break;
            }
            self.slots.pop_trail();
            num_released += 1;
        }

        if num_released > 0 {
            trace!("{}: released {} slots, trail is now #{}", self.tsi, num_released, self.slots.trail());
        }
        num_released
    }

    /// Drops the payloads of delivered slots without reclaiming the slots. Slots still needed
    ///  as parity input keep their payload.
    pub(crate) fn free_committed(&mut self) {
        for sequence in self.slots.trail().to(self.commit_trail) {
            let is_retained = self.is_retained_for_parity(sequence);
            let Some(slot) = self.slots.get_mut(sequence) else {
                continue;
            };
            match slot.state {
                PacketState::CommitData if is_retained => slot.state = PacketState::ParityData,
                PacketState::CommitData => slot.payload = None,
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use crate::clock::Timestamp;
    use crate::config::test_config;
    use crate::packet::{test_fragment, test_packet, ReceivedPacket, Tsi};
    use super::*;

    fn window_state(capacity: u32) -> WindowState {
        WindowState::new(Tsi::new([1, 2, 3, 4, 5, 6], 7500), Arc::new(test_config(capacity, 1)))
    }

    fn push(state: &mut WindowState, packet: ReceivedPacket) -> RxwOutcome {
        let outcome = state.push(packet, None, Timestamp::ZERO).outcome;
        state.assert_invariants();
        outcome
    }

    fn payloads(result: &ReadvResult) -> Vec<(u32, &[u8])> {
        result.messages.iter()
            .map(|m| (m.first_sqn.to_raw(), m.payload.as_ref()))
            .collect()
    }

    #[test]
    fn test_orphan_continuation() {
        let mut state = window_state(8);
        assert_eq!(push(&mut state, test_fragment(5, 4, 3, 6, b"def")), RxwOutcome::AdvancedWindow);
        assert_eq!(state.slots.get(SequenceNumber::from_raw(5)).unwrap().state, PacketState::LostData);
        assert!(state.has_pending());

        let result = state.readv(10);
        assert_eq!(result.lost, 1);
        assert!(result.messages.is_empty());
        assert!(!state.has_pending());
    }

    #[test]
    fn test_inconsistent_fragment_offsets() {
        let mut state = window_state(8);
        let _ = push(&mut state, test_fragment(0, 0, 0, 6, b"abc"));
        let _ = push(&mut state, test_fragment(1, 0, 4, 6, b"de"));
        assert_eq!(state.stats.malformed, 1);

        let result = state.readv(10);
        assert_eq!(result.lost, 2);
        assert!(result.messages.is_empty());
    }

    #[test]
    fn test_unfragmented_packet_inside_apdu() {
        let mut state = window_state(8);
        let _ = push(&mut state, test_fragment(0, 0, 0, 6, b"abc"));
        let _ = push(&mut state, test_packet(1, b"xyz"));
        assert_eq!(state.stats.malformed, 1);

        let result = state.readv(10);
        assert_eq!(result.lost, 1);
        assert_eq!(payloads(&result), vec![(1, &b"xyz"[..])]);
    }

    #[test]
    fn test_readv_stops_at_incomplete_apdu() {
        let mut state = window_state(8);
        let _ = push(&mut state, test_packet(0, b"a"));
        let _ = push(&mut state, test_fragment(1, 1, 0, 4, b"bc"));
        let _ = push(&mut state, test_packet(3, b"d"));

        let result = state.readv(10);
        assert_eq!(payloads(&result), vec![(0, &b"a"[..])]);
        assert_eq!(state.commit_trail, SequenceNumber::from_raw(1));
        assert_eq!(state.commit_lead, SequenceNumber::from_raw(1));

        let _ = push(&mut state, test_fragment(2, 1, 2, 4, b"de"));
        let result = state.readv(10);
        assert_eq!(payloads(&result), vec![(1, &b"bcde"[..]), (3, &b"d"[..])]);
        assert_eq!(result.bytes, 5);
    }

    #[test]
    fn test_unreported_losses_are_pending() {
        let mut state = window_state(2);
        let _ = push(&mut state, test_packet(0, b"a"));
        let _ = push(&mut state, test_packet(1, b"b"));
        let _ = push(&mut state, test_packet(5, b"f"));
        assert_eq!(state.unreported_losses, 4);
        assert!(state.has_pending());

        let result = state.readv(10);
        assert_eq!(result.lost, 4);
        assert!(result.messages.is_empty());
        assert!(!state.has_pending());
    }

    #[test]
    fn test_release_committed() {
        let mut state = window_state(8);
        for sqn in 0..3 {
            let _ = push(&mut state, test_packet(sqn, b"x"));
        }

        assert_eq!(state.readv(1).messages.len(), 1);
        assert_eq!(state.release_committed(), 1);
        assert_eq!(state.slots.trail(), SequenceNumber::from_raw(1));
        state.assert_invariants();

        let _ = push(&mut state, test_packet(5, b"y"));
        let _ = state.mark_lost(SequenceNumber::from_raw(3));
        let result = state.readv(10);
        assert_eq!(result.messages.len(), 2);
        assert_eq!(result.lost, 1);

        // #4 is still waiting for repair
        assert_eq!(state.release_committed(), 3);
        assert_eq!(state.slots.trail(), SequenceNumber::from_raw(4));
        state.assert_invariants();
    }
}
