use std::cmp::max;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use anyhow::bail;
use bytes::Bytes;
use tracing::{debug, info, trace, warn};
use crate::clock::Timestamp;
use crate::commit::ReadvResult;
use crate::config::{ReceiveWindowConfig, MAX_TG_SIZE};
use crate::fec::{FecDecoder, GroupMember, ParityPacket, TransmissionGroup};
use crate::nak::{coalesce, NakRequest, NakStage};
use crate::nak_queue::{NakQueue, NakQueues};
use crate::packet::{ReceivedPacket, Tsi};
use crate::result::{RxwFlags, RxwOutcome, RxwResult};
use crate::sequence::SequenceNumber;
use crate::slot_store::{Slot, SlotStore};
use crate::state::PacketState;

/// Where the data of a repair packet came from
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RepairSource {
    /// RDATA sent by the source or a repairer in response to a NAK
    Retransmission,
    /// reconstructed locally from a transmission group's parity packets
    Parity,
}

/// Counters and gauges of a receive window.
///
/// The gauges describe the current window contents:
/// * `lost_count`: slots in `LOST_DATA`
/// * `fragment_count`: slots holding a fragment of a multi-packet APDU that was not delivered yet
/// * `parity_count`: slots holding a parity packet. A parity packet stays attached to the slot
///    it was assigned to until that slot is reconstructed from parity (which consumes it) or
///    leaves the window.
/// * `parity_data_count`: delivered slots retained as input for reconstructing a sibling
///    in their transmission group (`PARITY_DATA`)
/// * `committed_count`: delivered slots waiting to be released (`COMMIT_DATA`)
///
/// All other counters are monotonic for the lifetime of the window.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct WindowStats {
    pub len: u32,
    pub lost_count: u32,
    pub fragment_count: u32,
    pub parity_count: u32,
    pub parity_data_count: u32,
    pub committed_count: u32,

    /// sequence numbers given up, counted once each
    pub cumulative_losses: u64,
    pub bytes_delivered: u64,
    pub msgs_delivered: u64,
    pub duplicates: u64,
    pub malformed: u64,
    /// slots filled with data reconstructed from parity
    pub fec_repairs: u64,

    /// fewest NAKs that were sent for a slot that was eventually repaired
    pub min_repair_naks: Option<u8>,
    pub max_repair_naks: Option<u8>,
    /// shortest time from detecting a gap to receiving its data
    pub min_fill_time: Option<Duration>,
    pub max_fill_time: Option<Duration>,
}

impl WindowStats {
    fn record_repair(&mut self, fill_time: Duration, naks: u8) {
        self.min_fill_time = Some(self.min_fill_time.map_or(fill_time, |t| t.min(fill_time)));
        self.max_fill_time = Some(self.max_fill_time.map_or(fill_time, |t| t.max(fill_time)));
        self.min_repair_naks = Some(self.min_repair_naks.map_or(naks, |n| n.min(naks)));
        self.max_repair_naks = Some(self.max_repair_naks.map_or(naks, |n| n.max(naks)));
    }
}

/// A copy of a single slot's externally relevant data
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SlotSnapshot {
    pub sequence: SequenceNumber,
    pub state: PacketState,
    pub payload: Option<Bytes>,
    pub nak_transmit_count: u8,
}

/// The unsynchronized state of a receive window. All access goes through [ReceiveWindow],
///  which serializes it.
///
/// The window's sequence numbers are partitioned by four pointers:
///
/// ```ascii
///  trail         commit_trail        commit_lead              lead
///    |  delivered   |  ready for readv   |  waiting for data   |
///    |  or surfaced |  (complete APDUs   |  (or an incomplete  |
///    |  as lost     |   or losses)       |   APDU)             |
/// ```
///
/// `trail <= commit_trail <= commit_lead <= lead + 1` holds after every operation.
pub(crate) struct WindowState {
    pub(crate) tsi: Tsi,
    pub(crate) config: Arc<ReceiveWindowConfig>,
    /// may differ from the configured value after the sender advertised its parity parameters
    pub(crate) tg_size: u32,
    pub(crate) slots: SlotStore,
    pub(crate) queues: NakQueues,

    pub(crate) is_defined: bool,
    pub(crate) is_gone: bool,

    pub(crate) commit_trail: SequenceNumber,
    pub(crate) commit_lead: SequenceNumber,
    /// the sender's transmit window trail: data before it cannot be repaired any more
    pub(crate) rxw_trail: SequenceNumber,

    /// losses that happened outside of `[commit_trail, commit_lead)` (window overrun) and are
    ///  reported by the next `readv`
    pub(crate) unreported_losses: u32,
    pub(crate) stats: WindowStats,
}

impl WindowState {
    pub(crate) fn new(tsi: Tsi, config: Arc<ReceiveWindowConfig>) -> WindowState {
        WindowState {
            tsi,
            tg_size: config.tg_size,
            slots: SlotStore::new(config.capacity),
            queues: NakQueues::default(),
            config,
            is_defined: false,
            is_gone: false,
            commit_trail: SequenceNumber::ZERO,
            commit_lead: SequenceNumber::ZERO,
            rxw_trail: SequenceNumber::ZERO,
            unreported_losses: 0,
            stats: WindowStats::default(),
        }
    }

    fn define(&mut self, trail: SequenceNumber) {
        info!("{}: receive window defined with trail #{}", self.tsi, trail);
        self.slots.reset(trail);
        self.queues.clear();
        self.commit_trail = trail;
        self.commit_lead = trail;
        self.rxw_trail = trail;
        self.is_defined = true;
    }

    pub(crate) fn tg_first(&self, sequence: SequenceNumber) -> SequenceNumber {
        SequenceNumber::from_raw(sequence.to_raw() & !(self.tg_size - 1))
    }

    /// checks a data packet's metadata, returning the reason if it is malformed
    fn check_packet(&self, packet: &ReceivedPacket) -> Option<&'static str> {
        if packet.len() > self.config.max_tpdu as usize {
            return Some("payload exceeds max_tpdu");
        }

        let fragment = packet.fragment.as_ref()?;
        if fragment.apdu_first_sqn.after(packet.sequence) {
            return Some("APDU starts after the fragment");
        }
        if fragment.apdu_first_sqn.distance(packet.sequence) as u32 >= self.slots.capacity() {
            return Some("APDU does not fit into the window");
        }
        if fragment.offset as u64 + packet.len() as u64 > fragment.total_length as u64 {
            return Some("fragment exceeds the APDU length");
        }
        if (fragment.apdu_first_sqn == packet.sequence) != (fragment.offset == 0) {
            return Some("fragment offset is inconsistent with the APDU start");
        }

        if fragment.apdu_first_sqn != packet.sequence {
            if let Some(head) = self.slots.get(fragment.apdu_first_sqn) {
                if head.state.has_data() && head.fragment.map(|f| f.total_length) != Some(fragment.total_length) {
                    return Some("APDU length differs from the APDU's first fragment");
                }
            }
        }
        None
    }

    fn drop_malformed(&mut self, sequence: SequenceNumber, reason: &str) -> RxwResult {
        warn!("{}: dropping malformed packet #{}: {}", self.tsi, sequence, reason);
        self.stats.malformed += 1;
        RxwResult::new(RxwOutcome::MalformedApdu)
    }

    pub(crate) fn push(&mut self, packet: ReceivedPacket, source: Option<RepairSource>, now: Timestamp) -> RxwResult {
        trace!("{}: received packet #{} with length {} ({:?})", self.tsi, packet.sequence, packet.len(), source);

        if let Some(reason) = self.check_packet(&packet) {
            return self.drop_malformed(packet.sequence, reason);
        }
        if !self.is_defined {
            self.define(packet.sequence);
        }

        let sequence = packet.sequence;
        let mut flags = RxwFlags::CONSUMED_SLOT;
        if packet.starts_apdu() {
            flags |= RxwFlags::NEW_APDU;
        }

        if sequence.before(self.slots.trail()) {
            debug!("{}: packet #{} is before the window's trail #{} - dropping", self.tsi, sequence, self.slots.trail());
            return RxwResult::new(RxwOutcome::NotInWindow);
        }

        let outcome = if sequence.after(self.slots.lead()) {
            self.make_room_for(sequence);
            self.append_placeholders(sequence, now);
            self.slots.push_lead(Slot::with_data(packet, now));
            RxwOutcome::AdvancedWindow
        }
        else {
            let Some(slot) = self.slots.get(sequence) else {
                return RxwResult::new(RxwOutcome::Unknown);
            };

            if slot.state == PacketState::LostData {
                debug!("{}: packet #{} arrived after it was given up", self.tsi, sequence);
                return RxwResult::new(RxwOutcome::ApduLost);
            }
            if slot.state.has_data() {
                trace!("{}: duplicate packet #{}", self.tsi, sequence);
                self.stats.duplicates += 1;
                return RxwResult::new(RxwOutcome::Duplicate);
            }

            self.fill_slot(packet, source, now);
            RxwOutcome::FilledPlaceholder
        };

        self.advance_commit_lead();

        let mut result = RxwResult::with_flags(outcome, flags);
        result.repairable = self.reconstructable_group(sequence);
        result
    }

    /// stores data in a slot that is waiting for it
    fn fill_slot(&mut self, packet: ReceivedPacket, source: Option<RepairSource>, now: Timestamp) {
        let Some(slot) = self.slots.get_mut(packet.sequence) else {
            return;
        };

        if let Some(queue) = slot.queue.take() {
            self.queues.remove(queue, slot.sequence);
        }
        // a reordered original that nobody asked for is not a repair
        if source.is_some() || slot.nak_transmit_count > 0 {
            self.stats.record_repair(now.saturating_since(slot.t0), slot.nak_transmit_count);
        }

        debug!("{}: #{} repaired in state {} after {} NAKs", self.tsi, slot.sequence, slot.state, slot.nak_transmit_count);
        slot.state = PacketState::HaveData;
        slot.payload = Some(packet.payload);
        slot.fragment = packet.fragment;

        if source == Some(RepairSource::Parity) {
            // the parity packet attached to a reconstructed slot is used up
            slot.parity = None;
            self.stats.fec_repairs += 1;
        }
    }

    /// Evicts slots at the trail until a slot for `last` fits into the window. Slots that were
    ///  not delivered yet are lost. If the window has to move by more than its capacity, the
    ///  skipped sequence numbers are counted as lost without ever creating slots for them.
    fn make_room_for(&mut self, last: SequenceNumber) {
        let required_trail = last - (self.slots.capacity() - 1);

        while !self.slots.is_empty() && self.slots.trail().before(required_trail) {
            self.evict_trail();
        }

        if self.slots.trail().before(required_trail) {
            let skipped = self.slots.trail().distance(required_trail) as u32;
            warn!("{}: window moved by more than its capacity - {} sequence numbers lost without being tracked", self.tsi, skipped);
            self.stats.cumulative_losses += skipped as u64;
            self.unreported_losses = self.unreported_losses.saturating_add(skipped);
            self.slots.reset(required_trail);
        }

        let trail = self.slots.trail();
        if self.commit_trail.before(trail) {
            self.commit_trail = trail;
        }
        if self.commit_lead.before(self.commit_trail) {
            self.commit_lead = self.commit_trail;
        }
    }

    fn evict_trail(&mut self) {
        let was_delivered = self.slots.trail().before(self.commit_trail);
        let Some(slot) = self.slots.pop_trail() else {
            return;
        };
        if let Some(queue) = slot.queue {
            self.queues.remove(queue, slot.sequence);
        }

        if was_delivered {
            trace!("{}: reclaiming #{} to make room", self.tsi, slot.sequence);
            return;
        }

        warn!("{}: window full - giving up #{} in state {}", self.tsi, slot.sequence, slot.state);
        if slot.state != PacketState::LostData {
            self.stats.cumulative_losses += 1;
        }
        self.unreported_losses = self.unreported_losses.saturating_add(1);

        // the evicted slot may have been the start of the resolved run, so it is re-resolved
        self.commit_trail = self.slots.trail();
        self.commit_lead = self.commit_trail;
    }

    /// creates placeholders from the lead up to (excl) `end`
    fn append_placeholders(&mut self, end: SequenceNumber, now: Timestamp) {
        let nak_rb_expiry = now + self.config.nak_bo_ivl;
        for sequence in self.slots.lead().next().to(end) {
            trace!("{}: placeholder for #{}", self.tsi, sequence);
            self.slots.push_lead(Slot::placeholder(sequence, now, nak_rb_expiry));
            self.queues.push(NakQueue::BackOff, sequence);
        }
    }

    /// moves the lead to `new_lead`, creating placeholders
    fn advance_lead(&mut self, new_lead: SequenceNumber, now: Timestamp) {
        self.make_room_for(new_lead);
        self.append_placeholders(new_lead.next(), now);
    }

    pub(crate) fn push_nth_parity(&mut self, packet: ReceivedPacket, now: Timestamp) -> RxwResult {
        if self.tg_size <= 1 {
            return self.drop_malformed(packet.sequence, "parity packet without transmission groups");
        }
        if packet.len() > self.config.max_tpdu as usize {
            return self.drop_malformed(packet.sequence, "payload exceeds max_tpdu");
        }

        let tg_first = self.tg_first(packet.sequence);
        let tg_last = tg_first + (self.tg_size - 1);
        let index = packet.sequence.to_raw() & (self.tg_size - 1);
        trace!("{}: received parity packet #{} for transmission group #{}", self.tsi, index, tg_first);

        if !self.is_defined {
            self.define(tg_first);
        }
        if tg_first.before(self.slots.trail()) {
            debug!("{}: parity for transmission group #{} which is (partially) before the window's trail - dropping", self.tsi, tg_first);
            return RxwResult::new(RxwOutcome::NotInWindow);
        }

        let mut outcome = RxwOutcome::Ok;
        if tg_last.after(self.slots.lead()) {
            self.advance_lead(tg_last, now);
            outcome = RxwOutcome::AdvancedWindow;
        }

        let mut target = None;
        for sequence in tg_first.to(tg_last.next()) {
            let Some(slot) = self.slots.get(sequence) else {
                continue;
            };
            if slot.state == PacketState::LostData {
                debug!("{}: transmission group #{} has a lost member - dropping parity", self.tsi, tg_first);
                return RxwResult::new(RxwOutcome::ApduLost);
            }
            if target.is_none() && slot.state.is_repair_pending() && slot.parity.is_none() {
                target = Some(sequence);
            }
        }

        let Some(target) = target.and_then(|sqn| self.slots.get_mut(sqn)) else {
            trace!("{}: no member of transmission group #{} waiting for parity", self.tsi, tg_first);
            self.stats.duplicates += 1;
            return RxwResult::new(RxwOutcome::Duplicate);
        };

        debug!("{}: #{} holds parity packet {}", self.tsi, target.sequence, index);
        target.parity = Some(ParityPacket {
            index,
            payload: packet.payload,
        });
        // the slot stays in its NAK queue
        target.state = PacketState::HaveParity;

        self.advance_commit_lead();

        let mut result = RxwResult::with_flags(outcome, RxwFlags::CONSUMED_SLOT);
        result.repairable = self.reconstructable_group(tg_first);
        result
    }

    /// Returns a snapshot of the transmission group containing `sequence` if it has missing
    ///  members and enough parity to reconstruct all of them
    pub(crate) fn reconstructable_group(&self, sequence: SequenceNumber) -> Option<TransmissionGroup> {
        if self.tg_size <= 1 {
            return None;
        }

        let tg_first = self.tg_first(sequence);
        let mut members = Vec::with_capacity(self.tg_size as usize);
        let mut parity = Vec::new();
        for sqn in tg_first.to(tg_first + self.tg_size) {
            let slot = self.slots.get(sqn)?;
            if slot.state == PacketState::LostData {
                return None;
            }
            if slot.state.has_data() && slot.payload.is_none() {
                return None;
            }
            if let Some(p) = &slot.parity {
                parity.push(p.clone());
            }
            members.push(GroupMember {
                sequence: sqn,
                payload: if slot.state.has_data() { slot.payload.clone() } else { None },
            });
        }

        let num_missing = members.iter().filter(|m| m.payload.is_none()).count();
        if num_missing == 0 || parity.len() < num_missing {
            return None;
        }

        debug!("{}: transmission group #{} can be reconstructed ({} missing)", self.tsi, tg_first, num_missing);
        parity.sort_by_key(|p| p.index);
        Some(TransmissionGroup {
            tsi: self.tsi,
            first_sqn: tg_first,
            members,
            parity,
        })
    }

    pub(crate) fn ncf(&mut self, sequence: SequenceNumber, send_time: Timestamp, now: Timestamp) -> RxwResult {
        if !self.is_defined {
            return RxwResult::new(RxwOutcome::WindowUndefined);
        }

        let nak_rdata_expiry = now + self.config.nak_rdata_ivl;
        let Some(slot) = self.slots.get_mut(sequence) else {
            debug!("{}: NCF for untracked #{}", self.tsi, sequence);
            return RxwResult::new(RxwOutcome::Unknown);
        };

        if send_time < slot.t0 {
            debug!("{}: stale NCF for #{} - ignoring", self.tsi, sequence);
            return RxwResult::new(RxwOutcome::Ok);
        }

        match slot.queue {
            Some(NakQueue::WaitData) => {
                trace!("{}: repeated NCF for #{}", self.tsi, sequence);
                self.queues.remove(NakQueue::WaitData, sequence);
            }
            Some(queue) => {
                trace!("{}: NCF for #{} in state {}", self.tsi, sequence, slot.state);
                self.queues.remove(queue, sequence);
                if slot.state != PacketState::HaveParity {
                    slot.state = PacketState::WaitData;
                }
                slot.data_retry_count = 0;
                slot.queue = Some(NakQueue::WaitData);
            }
            None => {
                return RxwResult::new(if slot.state == PacketState::LostData {
                    RxwOutcome::ApduLost
                }
                else {
                    RxwOutcome::Duplicate
                });
            }
        }

        slot.nak_rdata_expiry = nak_rdata_expiry;
        self.queues.push(NakQueue::WaitData, sequence);
        RxwResult::new(RxwOutcome::Ok)
    }

    /// Applies a sender's status report. `tg_size` and `tg_sqn_shift` are the sender's parity
    ///  parameters; both are 0 if the sender does not advertise any.
    pub(crate) fn window_update(&mut self, txw_trail: SequenceNumber, txw_lead: SequenceNumber, tg_size: u32, tg_sqn_shift: u32, now: Timestamp) -> RxwResult {
        if txw_lead.next().before(txw_trail) {
            warn!("{}: status report with trail #{} after lead #{} - ignoring", self.tsi, txw_trail, txw_lead);
            self.stats.malformed += 1;
            return RxwResult::new(RxwOutcome::MalformedApdu);
        }

        self.update_tg_size(tg_size, tg_sqn_shift);

        if !self.is_defined {
            // late join: don't ask for anything the sender sent before we knew about it
            self.define(txw_lead.next());
            self.rxw_trail = txw_trail;
            return RxwResult::new(RxwOutcome::Ok);
        }

        let mut outcome = RxwOutcome::Ok;
        if txw_lead.after(self.slots.lead()) {
            trace!("{}: sender's lead #{} is ahead of the window's lead #{}", self.tsi, txw_lead, self.slots.lead());
            self.advance_lead(txw_lead, now);
            outcome = RxwOutcome::CreatedPlaceholder;
        }

        if txw_trail.after(self.rxw_trail) {
            self.rxw_trail = txw_trail;

            let end = if txw_trail.after(self.slots.lead().next()) { self.slots.lead().next() } else { txw_trail };
            let unrepairable = self.commit_trail.to(end)
                .filter(|&sqn| self.slots.get(sqn).map_or(false, |slot| slot.state.is_repair_pending()))
                .collect::<Vec<_>>();
            if !unrepairable.is_empty() {
                debug!("{}: sender's trail moved to #{} - giving up {} pending repairs", self.tsi, txw_trail, unrepairable.len());
            }
            for sequence in unrepairable {
                self.mark_lost_internal(sequence);
            }
        }

        self.advance_commit_lead();
        RxwResult::new(outcome)
    }

    fn update_tg_size(&mut self, tg_size: u32, tg_sqn_shift: u32) {
        if tg_size == 0 && tg_sqn_shift == 0 {
            return;
        }
        if tg_size == self.tg_size {
            return;
        }

        let is_consistent = tg_size.is_power_of_two()
            && tg_sqn_shift < 32
            && tg_size == 1 << tg_sqn_shift
            && tg_size <= MAX_TG_SIZE
            && tg_size <= self.slots.capacity();
        if !is_consistent {
            warn!("{}: ignoring inconsistent transmission group parameters: size {}, shift {}", self.tsi, tg_size, tg_sqn_shift);
            return;
        }
        if self.slots.iter().any(|slot| slot.parity.is_some() || slot.state == PacketState::ParityData) {
            warn!("{}: cannot change transmission group size from {} to {} while parity is held", self.tsi, self.tg_size, tg_size);
            return;
        }

        debug!("{}: transmission group size changed from {} to {}", self.tsi, self.tg_size, tg_size);
        self.tg_size = tg_size;
    }

    pub(crate) fn mark_lost(&mut self, sequence: SequenceNumber) -> RxwResult {
        if !self.is_defined {
            return RxwResult::new(RxwOutcome::WindowUndefined);
        }
        if sequence.before(self.commit_trail) {
            return RxwResult::new(RxwOutcome::NotInWindow);
        }
        let Some(slot) = self.slots.get(sequence) else {
            return RxwResult::new(RxwOutcome::Unknown);
        };

        if slot.state != PacketState::LostData {
            self.mark_lost_internal(sequence);
            self.advance_commit_lead();
        }
        RxwResult::new(RxwOutcome::Ok)
    }

    /// Marks a slot lost together with the rest of its APDU: all held fragments, and the
    ///  placeholders between the APDU's first and last known fragment
    pub(crate) fn mark_lost_internal(&mut self, sequence: SequenceNumber) {
        let apdu_first_sqn = self.slots.get(sequence)
            .and_then(|slot| slot.fragment)
            .map(|f| f.apdu_first_sqn);

        self.set_lost(sequence);

        let Some(apdu_first_sqn) = apdu_first_sqn else {
            return;
        };
        let start = if apdu_first_sqn.before(self.commit_trail) { self.commit_trail } else { apdu_first_sqn };
        let is_member = |slot: &Slot| slot.fragment.map_or(false, |f| f.apdu_first_sqn == apdu_first_sqn);

        let mut apdu_last = sequence;
        for sqn in start.to(self.slots.lead().next()) {
            let Some(slot) = self.slots.get(sqn) else {
                break;
            };
            if is_member(slot) {
                if sqn.after(apdu_last) {
                    apdu_last = sqn;
                }
            }
            else if slot.state.has_data() && sqn.after(sequence) {
                break;
            }
        }

        for sqn in start.to(apdu_last.next()) {
            let is_lost = self.slots.get(sqn)
                .map_or(false, |slot| is_member(slot) || slot.state.is_repair_pending());
            if is_lost {
                self.set_lost(sqn);
            }
        }
    }

    pub(crate) fn set_lost(&mut self, sequence: SequenceNumber) {
        let Some(slot) = self.slots.get_mut(sequence) else {
            return;
        };
        if slot.state == PacketState::LostData {
            return;
        }

        debug!("{}: #{} is lost (was {})", self.tsi, sequence, slot.state);
        if let Some(queue) = slot.queue.take() {
            self.queues.remove(queue, sequence);
        }
        slot.state = PacketState::LostData;
        slot.payload = None;
        slot.parity = None;
        self.stats.cumulative_losses += 1;
    }

    fn pop_expired(&mut self, queue: NakQueue, now: Timestamp) -> Vec<SequenceNumber> {
        let slots = &self.slots;
        self.queues.pop_expired(queue, now, |sqn| {
            slots.get(sqn)
                .filter(|slot| slot.queue == Some(queue))
                .and_then(|slot| slot.expiry())
        })
    }

    /// Processes all expired NAK timers, returning the NAKs to send
    pub(crate) fn sweep(&mut self, now: Timestamp) -> Vec<NakRequest> {
        if !self.is_defined {
            return Vec::new();
        }

        let nak_rpt_expiry = now + self.config.nak_rpt_ivl;
        let nak_rdata_expiry = now + self.config.nak_rdata_ivl;
        let mut naks = Vec::new();
        let mut lost = Vec::new();

        for sequence in self.pop_expired(NakQueue::BackOff, now) {
            let Some(slot) = self.slots.get_mut(sequence) else { continue };
            slot.nak_transmit_count = slot.nak_transmit_count.saturating_add(1);
            slot.nak_rpt_expiry = nak_rpt_expiry;
            if slot.state == PacketState::BackOff {
                slot.state = PacketState::WaitNcf;
            }
            slot.queue = Some(NakQueue::WaitNcf);
            self.queues.push(NakQueue::WaitNcf, sequence);
            naks.push((sequence, NakStage::Initial));
        }

        for sequence in self.pop_expired(NakQueue::WaitNcf, now) {
            let Some(slot) = self.slots.get_mut(sequence) else { continue };
            slot.queue = None;
            slot.ncf_retry_count = slot.ncf_retry_count.saturating_add(1);
            if slot.ncf_retry_count > self.config.max_ncf_retries || slot.nak_transmit_count >= self.config.max_nak_transmit_count {
                debug!("{}: no NCF for #{} after {} NAKs", self.tsi, sequence, slot.nak_transmit_count);
                lost.push(sequence);
                continue;
            }
            slot.nak_transmit_count = slot.nak_transmit_count.saturating_add(1);
            slot.nak_rpt_expiry = nak_rpt_expiry;
            slot.queue = Some(NakQueue::WaitNcf);
            self.queues.push(NakQueue::WaitNcf, sequence);
            naks.push((sequence, NakStage::NcfRetry));
        }

        for sequence in self.pop_expired(NakQueue::WaitData, now) {
            let Some(slot) = self.slots.get_mut(sequence) else { continue };
            slot.queue = None;

            // NAKs sent before the NCF arrived count against the data retry budget, but a
            //  confirmed repair always gets at least min_nak_transmit_count attempts
            let naks_before_ncf = slot.nak_transmit_count.saturating_sub(slot.data_retry_count);
            let budget = max(
                self.config.max_nak_transmit_count.saturating_sub(naks_before_ncf),
                self.config.min_nak_transmit_count,
            );
            if slot.data_retry_count >= budget {
                debug!("{}: repair data for #{} did not arrive after {} retries", self.tsi, sequence, slot.data_retry_count);
                lost.push(sequence);
                continue;
            }
            slot.data_retry_count += 1;
            slot.nak_transmit_count = slot.nak_transmit_count.saturating_add(1);
            slot.nak_rdata_expiry = nak_rdata_expiry;
            slot.queue = Some(NakQueue::WaitData);
            self.queues.push(NakQueue::WaitData, sequence);
            naks.push((sequence, NakStage::DataRetry));
        }

        for sequence in lost {
            self.mark_lost_internal(sequence);
        }
        self.advance_commit_lead();

        coalesce(naks)
    }

    pub(crate) fn next_expiry(&self) -> Option<Timestamp> {
        [NakQueue::BackOff, NakQueue::WaitNcf, NakQueue::WaitData].into_iter()
            .filter_map(|queue| self.queues.front(queue))
            .filter_map(|sqn| self.slots.get(sqn)?.expiry())
            .min()
    }

    pub(crate) fn stats(&self) -> WindowStats {
        let mut stats = self.stats.clone();
        stats.len = self.slots.len();
        for slot in self.slots.iter() {
            match slot.state {
                PacketState::LostData => stats.lost_count += 1,
                PacketState::CommitData => stats.committed_count += 1,
                PacketState::ParityData => stats.parity_data_count += 1,
                PacketState::HaveData if slot.fragment.is_some() => stats.fragment_count += 1,
                _ => {}
            }
            if slot.parity.is_some() {
                stats.parity_count += 1;
            }
        }
        stats
    }

    pub(crate) fn shutdown(&mut self) {
        info!("{}: shutting down receive window", self.tsi);
        self.is_gone = true;
        let trail = self.slots.trail();
        self.slots.reset(trail);
        self.queues.clear();
    }

    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        if !self.is_defined || self.is_gone {
            return;
        }
        let trail = self.slots.trail();
        let lead = self.slots.lead();
        assert!(trail.before_or_eq(self.commit_trail), "trail {} commit_trail {}", trail, self.commit_trail);
        assert!(self.commit_trail.before_or_eq(self.commit_lead), "commit_trail {} commit_lead {}", self.commit_trail, self.commit_lead);
        assert!(self.commit_lead.before_or_eq(lead.next()), "commit_lead {} lead {}", self.commit_lead, lead);
        assert!(self.slots.len() <= self.slots.capacity());

        let mut queued = 0;
        for sqn in self.slots.sqns() {
            let slot = self.slots.get(sqn).expect("no slot in window");
            assert_eq!(slot.sequence, sqn);
            if let Some(queue) = slot.queue {
                queued += 1;
                assert!(slot.state.is_repair_pending(), "#{} in queue {:?} with state {}", sqn, queue, slot.state);
                assert!(self.queues.contains(queue, sqn));
            }
            if sqn.before(self.commit_trail) {
                assert!(slot.state.is_committed() || slot.state == PacketState::LostData, "#{} before commit trail in state {}", sqn, slot.state);
            }
        }
        assert_eq!(self.queues.total_len(), queued);
    }
}

/// The receive window for a single sending peer (identified by its [Tsi]).
///
/// All operations are synchronous and never block on anything but the window's own lock,
///  which is held only for in-memory updates. Work that does I/O or heavy computation is
///  done by the caller outside the lock: `sweep` returns the NAKs to send, and operations
///  that make a transmission group reconstructable return its snapshot for FEC decoding.
///
/// After `shutdown`, all operations return [RxwOutcome::WindowGone] (or nothing).
pub struct ReceiveWindow {
    tsi: Tsi,
    inner: Mutex<WindowState>,
    delivery: tokio::sync::Mutex<()>,
}

impl ReceiveWindow {
    pub fn new(tsi: Tsi, config: Arc<ReceiveWindowConfig>) -> anyhow::Result<ReceiveWindow> {
        config.validate()?;
        Ok(ReceiveWindow {
            tsi,
            inner: Mutex::new(WindowState::new(tsi, config)),
            delivery: tokio::sync::Mutex::new(()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, WindowState> {
        self.inner.lock()
            .expect("receive window lock is poisoned")
    }

    /// runs `f` unless the window was shut down, returning `gone` in that case
    fn with_live_state<R>(&self, gone: R, f: impl FnOnce(&mut WindowState) -> R) -> R {
        let mut state = self.lock();
        if state.is_gone {
            return gone;
        }
        f(&mut state)
    }

    pub fn tsi(&self) -> Tsi {
        self.tsi
    }

    /// Adds an original data packet (ODATA) to the window
    pub fn push(&self, packet: ReceivedPacket, now: Timestamp) -> RxwResult {
        if packet.tsi != self.tsi {
            warn!("{}: packet from {} pushed into the wrong window", self.tsi, packet.tsi);
            return RxwResult::new(RxwOutcome::Unknown);
        }
        self.with_live_state(RxwResult::new(RxwOutcome::WindowGone), |state| state.push(packet, None, now))
    }

    /// Adds repair data, either retransmitted by the sender or reconstructed from parity
    pub fn push_nth_repair(&self, packet: ReceivedPacket, source: RepairSource, now: Timestamp) -> RxwResult {
        if packet.tsi != self.tsi {
            warn!("{}: repair from {} pushed into the wrong window", self.tsi, packet.tsi);
            return RxwResult::new(RxwOutcome::Unknown);
        }
        self.with_live_state(RxwResult::new(RxwOutcome::WindowGone), |state| state.push(packet, Some(source), now))
    }

    /// Adds a parity packet. The packet's sequence number identifies both its transmission
    ///  group (upper bits) and its index in the group's parity set (lower bits).
    pub fn push_nth_parity(&self, packet: ReceivedPacket, now: Timestamp) -> RxwResult {
        if packet.tsi != self.tsi {
            warn!("{}: parity from {} pushed into the wrong window", self.tsi, packet.tsi);
            return RxwResult::new(RxwOutcome::Unknown);
        }
        self.with_live_state(RxwResult::new(RxwOutcome::WindowGone), |state| state.push_nth_parity(packet, now))
    }

    /// Reconstructs the missing members of a transmission group that was reported as
    ///  repairable, and feeds them back into the window. Decoding happens without holding
    ///  the window's lock. Returns the number of slots that were filled.
    pub fn repair(&self, group: &TransmissionGroup, decoder: &dyn FecDecoder, now: Timestamp) -> anyhow::Result<u32> {
        let mut num_repaired = 0;
        for missing in group.missing() {
            let payload = decoder.reconstruct(group, missing)?;
            let packet = ReceivedPacket {
                tsi: group.tsi,
                sequence: missing,
                fragment: None,
                payload,
                timestamp: now,
            };

            let result = self.push_nth_repair(packet, RepairSource::Parity, now);
            match result.outcome {
                RxwOutcome::FilledPlaceholder => num_repaired += 1,
                RxwOutcome::WindowGone => bail!("receive window for {} was shut down", self.tsi),
                other => debug!("{}: reconstructed #{} was not used: {}", self.tsi, missing, other),
            }
        }
        Ok(num_repaired)
    }

    /// Handles a NAK confirmation for `sequence`. `send_time` is the NCF's timestamp, NCFs
    ///  older than the slot itself are stale.
    pub fn ncf(&self, sequence: SequenceNumber, send_time: Timestamp, now: Timestamp) -> RxwResult {
        self.with_live_state(RxwResult::new(RxwOutcome::WindowGone), |state| state.ncf(sequence, send_time, now))
    }

    pub fn window_update(&self, txw_trail: SequenceNumber, txw_lead: SequenceNumber, tg_size: u32, tg_sqn_shift: u32, now: Timestamp) -> RxwResult {
        self.with_live_state(RxwResult::new(RxwOutcome::WindowGone), |state| state.window_update(txw_trail, txw_lead, tg_size, tg_sqn_shift, now))
    }

    pub fn mark_lost(&self, sequence: SequenceNumber) -> RxwResult {
        self.with_live_state(RxwResult::new(RxwOutcome::WindowGone), |state| state.mark_lost(sequence))
    }

    pub fn sweep(&self, now: Timestamp) -> Vec<NakRequest> {
        self.with_live_state(Vec::new(), |state| state.sweep(now))
    }

    pub fn readv(&self, max_count: usize) -> ReadvResult {
        self.with_live_state(ReadvResult::new(RxwOutcome::WindowGone), |state| state.readv(max_count))
    }

    /// Serializes consumers that take messages out of the window and hand them on
    ///  asynchronously. `readv` itself is atomic, but the order in which its results reach the
    ///  application is only kept if the guard is held from `readv` through dispatch to
    ///  `release_committed`.
    pub async fn lock_delivery(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.delivery.lock().await
    }

    /// reclaims delivered slots, returning the number of slots released
    pub fn release_committed(&self) -> u32 {
        self.with_live_state(0, |state| state.release_committed())
    }

    pub fn free_committed(&self) {
        self.with_live_state((), |state| state.free_committed())
    }

    pub fn shutdown(&self) {
        let mut state = self.lock();
        if !state.is_gone {
            state.shutdown();
        }
    }

    pub fn is_gone(&self) -> bool {
        self.lock().is_gone
    }

    pub fn is_defined(&self) -> bool {
        self.lock().is_defined
    }

    pub fn peek(&self, sequence: SequenceNumber) -> Option<SlotSnapshot> {
        let state = self.lock();
        state.slots.get(sequence)
            .map(|slot| SlotSnapshot {
                sequence: slot.sequence,
                state: slot.state,
                payload: slot.payload.clone(),
                nak_transmit_count: slot.nak_transmit_count,
            })
    }

    /// number of slots in the window
    pub fn len(&self) -> u32 {
        self.lock().slots.len()
    }

    pub fn sqns(&self) -> Vec<SequenceNumber> {
        self.lock().slots.sqns().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().slots.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.lock().slots.is_full()
    }

    /// true if there is something for `readv` to return
    pub fn has_pending(&self) -> bool {
        self.with_live_state(false, |state| state.has_pending())
    }

    pub fn next_expiry(&self) -> Option<Timestamp> {
        self.with_live_state(None, |state| state.next_expiry())
    }

    pub fn trail(&self) -> SequenceNumber {
        self.lock().slots.trail()
    }

    pub fn lead(&self) -> SequenceNumber {
        self.lock().slots.lead()
    }

    pub fn commit_trail(&self) -> SequenceNumber {
        self.lock().commit_trail
    }

    pub fn commit_lead(&self) -> SequenceNumber {
        self.lock().commit_lead
    }

    pub fn rxw_trail(&self) -> SequenceNumber {
        self.lock().rxw_trail
    }

    pub fn tg_size(&self) -> u32 {
        self.lock().tg_size
    }

    pub fn stats(&self) -> WindowStats {
        self.lock().stats()
    }

    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        self.lock().assert_invariants();
    }
}
