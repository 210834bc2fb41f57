//! The receive side of a PGM-style reliable multicast transport.
//!
//! Senders transmit numbered data packets (ODATA) to a group of receivers. Receivers detect
//!  loss through gaps in the sequence numbers and ask for repair with negative acknowledgements
//!  (NAKs), which the sender confirms (NCF) before retransmitting (RDATA). Optionally, senders
//!  add parity packets to groups of consecutive packets (transmission groups) so receivers can
//!  reconstruct some losses locally (FEC).
//!
//! The core of this crate is the per-sender [window::ReceiveWindow]. It buffers arriving
//!  packets, tracks the repair state of every missing sequence number, decides when to NAK
//!  and when to give up, and hands complete application messages (APDUs, possibly spanning
//!  several packets) to the application strictly in order and at most once.
//!
//! ## Design goals
//!
//! * The window does no I/O. It returns the NAKs to send and the transmission groups that can
//!   be reconstructed, and the caller sends / decodes them outside the window's lock
//! * All operations are synchronous and bounded. Time is passed in explicitly, so the window
//!   is deterministic and needs no timer infrastructure of its own
//! * Memory is bounded: the window has a fixed capacity of sequence numbers. If the sender
//!   runs further ahead, the oldest sequence numbers are given up rather than growing the
//!   window
//! * Losses are not errors. A sequence number that can not be repaired is reported once and
//!   skipped, and delivery continues after it
//!
//! ## Slot lifecycle
//!
//! Every sequence number in the window has a slot whose [state::PacketState] follows the
//!  repair handshake:
//!
//! ```ascii
//!  gap detected -> BACK_OFF -> (NAK) -> WAIT_NCF -> (NCF) -> WAIT_DATA -> (RDATA) -> HAVE_DATA
//! ```
//!
//! Each waiting state has a timer (`nak_bo_ivl`, `nak_rpt_ivl`, `nak_rdata_ivl`). Timers of a
//!  state all have the same interval, so the timer queues are plain FIFO queues that are
//!  swept from the head. Retries are bounded by `max_ncf_retries` and
//!  `max_nak_transmit_count`, after which the slot is `LOST_DATA`.
//!
//! ## Components
//!
//! * [registry::SessionRegistry] maps transport session ids to their windows
//! * [driver::ReceiveDriver] is the active part: a tokio loop that sweeps the windows' NAK
//!   timers, sends NAKs through a [nak::NakSender] and delivers messages to a
//!   [message_dispatcher::MessageDispatcher]

pub mod sequence;
pub mod clock;
pub mod config;
pub mod packet;
pub mod state;
pub mod result;
pub mod slot_store;
pub mod nak_queue;
pub mod nak;
pub mod fec;
pub mod window;
pub mod commit;
pub mod message_dispatcher;
pub mod registry;
pub mod driver;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
