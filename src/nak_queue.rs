use std::collections::VecDeque;
use crate::clock::Timestamp;
use crate::sequence::SequenceNumber;

/// identifies one of the three NAK timer queues
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum NakQueue {
    BackOff,
    WaitNcf,
    WaitData,
}

/// The NAK timer queues of a receive window. Each queue holds the sequence numbers of slots
///  waiting for the corresponding timer, and each slot is in at most one queue.
///
/// Since each queue's timer interval is the same for all its entries and entries are
///  appended when their timer starts, insertion order is expiry order. So a FIFO queue serves
///  as a priority queue, and a sweep only needs to look at the queue heads.
///
/// NB: The queues store sequence numbers rather than slot references - slot data lives in the
///      slot store only, and the expiry of an entry is looked up there
#[derive(Default, Debug)]
pub struct NakQueues {
    back_off: VecDeque<SequenceNumber>,
    wait_ncf: VecDeque<SequenceNumber>,
    wait_data: VecDeque<SequenceNumber>,
}

impl NakQueues {
    fn queue(&self, queue: NakQueue) -> &VecDeque<SequenceNumber> {
        match queue {
            NakQueue::BackOff => &self.back_off,
            NakQueue::WaitNcf => &self.wait_ncf,
            NakQueue::WaitData => &self.wait_data,
        }
    }

    fn queue_mut(&mut self, queue: NakQueue) -> &mut VecDeque<SequenceNumber> {
        match queue {
            NakQueue::BackOff => &mut self.back_off,
            NakQueue::WaitNcf => &mut self.wait_ncf,
            NakQueue::WaitData => &mut self.wait_data,
        }
    }

    pub fn push(&mut self, queue: NakQueue, sequence: SequenceNumber) {
        self.queue_mut(queue).push_back(sequence);
    }

    pub fn front(&self, queue: NakQueue) -> Option<SequenceNumber> {
        self.queue(queue).front().copied()
    }

    /// Removes a sequence number from a queue, returning `true` if it was there. Entries are
    ///  usually removed because their data arrived, and data tends to arrive in sequence, so
    ///  the search starts at the head.
    pub fn remove(&mut self, queue: NakQueue, sequence: SequenceNumber) -> bool {
        let q = self.queue_mut(queue);
        match q.iter().position(|&s| s == sequence) {
            Some(idx) => {
                q.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Pops all entries from the head of a queue whose expiry (as determined by `expiry_of`)
    ///  is at or before `now`. Entries for which `expiry_of` returns `None` are stale and
    ///  dropped silently.
    pub fn pop_expired(&mut self, queue: NakQueue, now: Timestamp, expiry_of: impl Fn(SequenceNumber) -> Option<Timestamp>) -> Vec<SequenceNumber> {
        let q = self.queue_mut(queue);
        let mut result = Vec::new();
        while let Some(&sequence) = q.front() {
            match expiry_of(sequence) {
                None => {
                    q.pop_front();
                }
                Some(expiry) if expiry <= now => {
                    q.pop_front();
                    result.push(sequence);
                }
                Some(_) => break,
            }
        }
        result
    }

    pub fn len(&self, queue: NakQueue) -> usize {
        self.queue(queue).len()
    }

    pub fn total_len(&self) -> usize {
        self.back_off.len() + self.wait_ncf.len() + self.wait_data.len()
    }

    pub fn contains(&self, queue: NakQueue, sequence: SequenceNumber) -> bool {
        self.queue(queue).contains(&sequence)
    }

    pub fn clear(&mut self) {
        self.back_off.clear();
        self.wait_ncf.clear();
        self.wait_data.clear();
    }
}
