use bytes::Bytes;
use tracing::trace;
use crate::clock::Timestamp;
use crate::fec::ParityPacket;
use crate::nak_queue::NakQueue;
use crate::packet::{FragmentInfo, ReceivedPacket};
use crate::sequence::{SequenceNumber, SequenceRange};
use crate::state::PacketState;

/// A single sequence number's entry in the receive window
#[derive(Debug)]
pub struct Slot {
    pub sequence: SequenceNumber,
    pub state: PacketState,
    /// creation time of the slot, i.e. when the sequence number became known to the window
    pub t0: Timestamp,
    pub nak_rb_expiry: Timestamp,
    pub nak_rpt_expiry: Timestamp,
    pub nak_rdata_expiry: Timestamp,
    pub nak_transmit_count: u8,
    pub ncf_retry_count: u8,
    pub data_retry_count: u8,
    pub payload: Option<Bytes>,
    /// parity packet held in lieu of the original data
    pub parity: Option<ParityPacket>,
    pub fragment: Option<FragmentInfo>,
    /// the NAK timer queue this slot is currently in, if any
    pub queue: Option<NakQueue>,
}

impl Slot {
    /// a placeholder for a sequence number that was skipped, starting its back-off timer
    pub fn placeholder(sequence: SequenceNumber, now: Timestamp, nak_rb_expiry: Timestamp) -> Slot {
        Slot {
            sequence,
            state: PacketState::BackOff,
            t0: now,
            nak_rb_expiry,
            nak_rpt_expiry: Timestamp::ZERO,
            nak_rdata_expiry: Timestamp::ZERO,
            nak_transmit_count: 0,
            ncf_retry_count: 0,
            data_retry_count: 0,
            payload: None,
            parity: None,
            fragment: None,
            queue: Some(NakQueue::BackOff),
        }
    }

    /// a slot that received its data without ever being missed
    pub fn with_data(packet: ReceivedPacket, now: Timestamp) -> Slot {
        Slot {
            sequence: packet.sequence,
            state: PacketState::HaveData,
            t0: now,
            nak_rb_expiry: Timestamp::ZERO,
            nak_rpt_expiry: Timestamp::ZERO,
            nak_rdata_expiry: Timestamp::ZERO,
            nak_transmit_count: 0,
            ncf_retry_count: 0,
            data_retry_count: 0,
            payload: Some(packet.payload),
            parity: None,
            fragment: packet.fragment,
            queue: None,
        }
    }

    /// the expiry of the timer the slot is currently waiting for, if it is in a NAK queue
    pub fn expiry(&self) -> Option<Timestamp> {
        match self.queue? {
            NakQueue::BackOff => Some(self.nak_rb_expiry),
            NakQueue::WaitNcf => Some(self.nak_rpt_expiry),
            NakQueue::WaitData => Some(self.nak_rdata_expiry),
        }
    }

    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map(|p| p.len()).unwrap_or(0)
    }
}

/// Fixed-capacity ring of slots, indexed by sequence number.
///
/// The ring covers the contiguous range `trail..=lead`, holding a slot for every sequence
///  number in it. It grows at the lead and shrinks at the trail, and never holds more than
///  `capacity` slots. An empty ring has `lead == trail - 1`.
///
/// The ring's length is `capacity` rounded up to the next power of two, which divides 2^32.
///  So the index `sequence & mask` stays consistent when sequence numbers wrap around.
pub struct SlotStore {
    slots: Vec<Option<Slot>>,
    mask: u32,
    capacity: u32,
    trail: SequenceNumber,
    lead: SequenceNumber,
}

impl SlotStore {
    pub fn new(capacity: u32) -> SlotStore {
        assert!(capacity > 0, "capacity must be positive");
        let ring_len = capacity.next_power_of_two();

        SlotStore {
            slots: (0..ring_len).map(|_| None).collect(),
            mask: ring_len - 1,
            capacity,
            trail: SequenceNumber::ZERO,
            lead: SequenceNumber::ZERO.prev(),
        }
    }

    fn index(&self, sequence: SequenceNumber) -> usize {
        (sequence.to_raw() & self.mask) as usize
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn trail(&self) -> SequenceNumber {
        self.trail
    }

    pub fn lead(&self) -> SequenceNumber {
        self.lead
    }

    /// number of slots currently in the ring
    pub fn len(&self) -> u32 {
        self.trail.distance(self.lead.next()) as u32
    }

    pub fn is_empty(&self) -> bool {
        self.lead.next() == self.trail
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn contains(&self, sequence: SequenceNumber) -> bool {
        sequence.after_or_eq(self.trail) && sequence.before_or_eq(self.lead)
    }

    /// sequence numbers of all slots, from trail to lead
    pub fn sqns(&self) -> SequenceRange {
        self.trail.to(self.lead.next())
    }

    pub fn get(&self, sequence: SequenceNumber) -> Option<&Slot> {
        if !self.contains(sequence) {
            return None;
        }
        self.slots[self.index(sequence)].as_ref()
    }

    pub fn get_mut(&mut self, sequence: SequenceNumber) -> Option<&mut Slot> {
        if !self.contains(sequence) {
            return None;
        }
        let idx = self.index(sequence);
        self.slots[idx].as_mut()
    }

    /// Appends a slot at the lead. The slot must carry the sequence number following the
    ///  current lead, and the ring must not be full - callers evict at the trail first.
    pub fn push_lead(&mut self, slot: Slot) {
        assert_eq!(slot.sequence, self.lead.next(), "slots must be appended in sequence");
        assert!(!self.is_full(), "slot store is full");

        let idx = self.index(slot.sequence);
        self.lead = slot.sequence;
        self.slots[idx] = Some(slot);
    }

    /// Removes the slot at the trail, advancing the trail
    pub fn pop_trail(&mut self) -> Option<Slot> {
        if self.is_empty() {
            return None;
        }
        let idx = self.index(self.trail);
        self.trail = self.trail.next();
        self.slots[idx].take()
    }

    /// Drops all slots, leaving an empty ring whose next slot will be `trail`
    pub fn reset(&mut self, trail: SequenceNumber) {
        trace!("resetting slot store to trail {}", trail);
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.trail = trail;
        self.lead = trail.prev();
    }

    /// all slots, in ring order rather than sequence order
    pub fn iter(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter().flatten()
    }
}
