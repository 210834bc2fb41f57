use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use crate::packet::Tsi;
use crate::sequence::{SequenceNumber, SequenceRange};

/// The retry stage a NAK is sent in - senders and network elements may treat repeated NAKs
///  differently from initial ones, and it is useful for diagnostics
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum NakStage {
    /// first NAK after the back-off interval
    Initial,
    /// repeated NAK because no NCF arrived
    NcfRetry,
    /// repeated NAK because the confirmed repair data did not arrive
    DataRetry,
}

/// A request to NAK a contiguous range `first..=last` of sequence numbers
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct NakRequest {
    pub first: SequenceNumber,
    pub last: SequenceNumber,
    pub stage: NakStage,
}

impl NakRequest {
    pub fn single(sequence: SequenceNumber, stage: NakStage) -> NakRequest {
        NakRequest {
            first: sequence,
            last: sequence,
            stage,
        }
    }

    /// number of sequence numbers covered by this request
    pub fn count(&self) -> u32 {
        self.first.distance(self.last) as u32 + 1
    }

    pub fn sequences(&self) -> SequenceRange {
        self.first.to(self.last.next())
    }
}

/// Merges NAKs for consecutive sequence numbers in the same stage into ranges. The input is
///  expected in the order the NAK timers fired.
pub(crate) fn coalesce(naks: impl IntoIterator<Item = (SequenceNumber, NakStage)>) -> Vec<NakRequest> {
    let mut result: Vec<NakRequest> = Vec::new();
    for (sequence, stage) in naks {
        if let Some(last) = result.last_mut() {
            if last.stage == stage && last.last.next() == sequence {
                last.last = sequence;
                continue;
            }
        }
        result.push(NakRequest::single(sequence, stage));
    }
    result
}

/// The receive window decides *when* to NAK, but it never sends anything itself. NAK
///  transmission is done by an implementation of this trait, outside the window's lock.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NakSender: Send + Sync + 'static {
    async fn send_nak(&self, tsi: Tsi, request: NakRequest);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use NakStage::*;

    fn s(raw: u32) -> SequenceNumber {
        SequenceNumber::from_raw(raw)
    }

    #[rstest]
    #[case::empty(vec![], vec![])]
    #[case::single(vec![(3, Initial)], vec![(3, 3, Initial)])]
    #[case::range(vec![(3, Initial), (4, Initial), (5, Initial)], vec![(3, 5, Initial)])]
    #[case::gap(vec![(3, Initial), (5, Initial)], vec![(3, 3, Initial), (5, 5, Initial)])]
    #[case::stage_change(vec![(3, Initial), (4, NcfRetry), (5, NcfRetry)], vec![(3, 3, Initial), (4, 5, NcfRetry)])]
    #[case::wrap(vec![(u32::MAX, DataRetry), (0, DataRetry)], vec![(u32::MAX, 0, DataRetry)])]
    fn test_coalesce(#[case] naks: Vec<(u32, NakStage)>, #[case] expected: Vec<(u32, u32, NakStage)>) {
        let actual = coalesce(naks.into_iter().map(|(sqn, stage)| (s(sqn), stage)));
        let expected = expected.into_iter()
            .map(|(first, last, stage)| NakRequest { first: s(first), last: s(last), stage })
            .collect::<Vec<_>>();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_request_sequences() {
        let request = NakRequest { first: s(u32::MAX - 1), last: s(1), stage: Initial };
        assert_eq!(request.count(), 4);
        assert_eq!(request.sequences().collect::<Vec<_>>(), vec![s(u32::MAX - 1), s(u32::MAX), s(0), s(1)]);
    }
}
