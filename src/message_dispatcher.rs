use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use crate::packet::Tsi;
use crate::sequence::SequenceNumber;

/// Receives the APDUs delivered by a session's receive window, in sequence order
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn on_message(&self, tsi: Tsi, first_sqn: SequenceNumber, msg_buf: &[u8]);

    /// reports the number of sequence numbers given up since the previous call
    async fn on_loss(&self, tsi: Tsi, num_lost: u32);
}
