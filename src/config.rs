use std::time::Duration;
use anyhow::bail;

/// The largest capacity a window may be configured with. Sequence number comparison is only
///  well-defined for numbers less than 2^31 apart, and the slot ring is rounded up to the next
///  power of two.
pub const MAX_WINDOW_CAPACITY: u32 = 1 << 30;

/// PGM limits transmission groups to 128 packets (the parity option encodes the group index
///  in 7 bits)
pub const MAX_TG_SIZE: u32 = 128;

/// Configuration of a single peer's receive window. All values are required - there are no
///  defaults because sensible values depend on the network and the sender's configuration.
#[derive(Debug, Clone)]
pub struct ReceiveWindowConfig {
    /// Maximum transport PDU size, i.e. the upper bound for the payload of a single packet.
    ///  Payloads exceeding this are dropped as malformed.
    pub max_tpdu: u16,

    /// Transmission group size for FEC parity: consecutive sequence numbers in groups of
    ///  this size share a parity set. Must be a power of two; 1 means no parity.
    pub tg_size: u32,

    /// This is the maximum number of *sequence numbers* (not bytes) tracked by the window at
    ///  any time. If the sender runs further ahead, the oldest slots are given up.
    pub capacity: u32,

    /// Once an NCF confirmed that a repair is on the way, the slot is granted at least this
    ///  many additional NAKs while waiting for the data
    pub min_nak_transmit_count: u8,
    /// Total NAK budget per sequence number
    pub max_nak_transmit_count: u8,
    /// NAK retries without receiving an NCF before the sequence number is given up
    pub max_ncf_retries: u8,

    /// back-off after detecting a gap before sending the first NAK - this gives packets that
    ///  are merely reordered on the network a chance to arrive (NAK_BO_IVL)
    pub nak_bo_ivl: Duration,
    /// wait for an NCF after sending a NAK (NAK_RPT_IVL)
    pub nak_rpt_ivl: Duration,
    /// wait for repair data after receiving an NCF (NAK_RDATA_IVL)
    pub nak_rdata_ivl: Duration,
}

impl ReceiveWindowConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_tpdu == 0 {
            bail!("max_tpdu must be positive");
        }
        if self.capacity == 0 || self.capacity > MAX_WINDOW_CAPACITY {
            bail!("window capacity must be between 1 and {}, was {}", MAX_WINDOW_CAPACITY, self.capacity);
        }
        if !self.tg_size.is_power_of_two() || self.tg_size > MAX_TG_SIZE {
            bail!("transmission group size must be a power of two no bigger than {}, was {}", MAX_TG_SIZE, self.tg_size);
        }
        if self.tg_size > self.capacity {
            bail!("transmission group size {} does not fit into a window of capacity {}", self.tg_size, self.capacity);
        }
        if self.max_nak_transmit_count == 0 {
            bail!("max_nak_transmit_count must be positive");
        }
        if self.min_nak_transmit_count > self.max_nak_transmit_count {
            bail!("min_nak_transmit_count {} exceeds max_nak_transmit_count {}", self.min_nak_transmit_count, self.max_nak_transmit_count);
        }
        if self.nak_bo_ivl.is_zero() || self.nak_rpt_ivl.is_zero() || self.nak_rdata_ivl.is_zero() {
            bail!("NAK intervals must be positive");
        }
        Ok(())
    }
}

/// Configuration of the [crate::driver::ReceiveDriver]'s active loop
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// the interval for sweeping NAK timer queues and draining windows - this is the
    ///  resolution of all NAK timers, so it should be well below `nak_bo_ivl`
    pub tick_interval: Duration,
    /// upper bound for the number of messages taken from a window in a single `readv` call
    pub max_messages_per_read: usize,
}

impl DriverConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tick_interval.is_zero() {
            bail!("tick interval must be positive");
        }
        if self.max_messages_per_read == 0 {
            bail!("max_messages_per_read must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_config(capacity: u32, tg_size: u32) -> ReceiveWindowConfig {
    ReceiveWindowConfig {
        max_tpdu: 1500,
        tg_size,
        capacity,
        min_nak_transmit_count: 2,
        max_nak_transmit_count: 5,
        max_ncf_retries: 2,
        nak_bo_ivl: Duration::from_millis(50),
        nak_rpt_ivl: Duration::from_millis(200),
        nak_rdata_ivl: Duration::from_millis(500),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::valid(|_c: &mut ReceiveWindowConfig| {}, true)]
    #[case::zero_tpdu(|c: &mut ReceiveWindowConfig| c.max_tpdu = 0, false)]
    #[case::zero_capacity(|c: &mut ReceiveWindowConfig| c.capacity = 0, false)]
    #[case::huge_capacity(|c: &mut ReceiveWindowConfig| c.capacity = MAX_WINDOW_CAPACITY + 1, false)]
    #[case::tg_not_power_of_two(|c: &mut ReceiveWindowConfig| c.tg_size = 3, false)]
    #[case::tg_zero(|c: &mut ReceiveWindowConfig| c.tg_size = 0, false)]
    #[case::tg_too_big(|c: &mut ReceiveWindowConfig| c.tg_size = 256, false)]
    #[case::tg_exceeds_capacity(|c: &mut ReceiveWindowConfig| c.tg_size = 128, false)]
    #[case::tg_one(|c: &mut ReceiveWindowConfig| c.tg_size = 1, true)]
    #[case::no_naks(|c: &mut ReceiveWindowConfig| c.max_nak_transmit_count = 0, false)]
    #[case::min_above_max(|c: &mut ReceiveWindowConfig| c.min_nak_transmit_count = 6, false)]
    #[case::zero_interval(|c: &mut ReceiveWindowConfig| c.nak_rpt_ivl = Duration::ZERO, false)]
    fn test_validate(#[case] modifier: fn(&mut ReceiveWindowConfig), #[case] expected_valid: bool) {
        let mut config = test_config(64, 4);
        modifier(&mut config);
        assert_eq!(config.validate().is_ok(), expected_valid);
    }
}
