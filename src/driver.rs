use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, trace, warn};
use crate::clock::{Clock, Timestamp};
use crate::config::DriverConfig;
use crate::fec::{FecDecoder, TransmissionGroup};
use crate::message_dispatcher::MessageDispatcher;
use crate::nak::NakSender;
use crate::packet::{ReceivedPacket, Tsi};
use crate::registry::SessionRegistry;
use crate::result::{RxwOutcome, RxwResult};
use crate::sequence::SequenceNumber;
use crate::window::{ReceiveWindow, RepairSource};

struct ReceiveDriverInner {
    config: Arc<DriverConfig>,
    registry: Arc<SessionRegistry>,
    clock: Arc<dyn Clock>,
    nak_sender: Arc<dyn NakSender>,
    message_dispatcher: Arc<dyn MessageDispatcher>,
    fec_decoder: Option<Arc<dyn FecDecoder>>,
}

impl ReceiveDriverInner {
    /// sweeps the NAK timers of all windows and drains them
    async fn on_tick(&self) {
        let now = self.clock.now();
        for window in self.registry.windows() {
            for nak in window.sweep(now) {
                trace!("{}: sending NAK for #{}..=#{} ({:?})", window.tsi(), nak.first, nak.last, nak.stage);
                self.nak_sender.send_nak(window.tsi(), nak).await;
            }
            self.drain(&window).await;
        }
    }

    /// dispatches everything the window has ready, and reclaims the delivered slots
    async fn drain(&self, window: &ReceiveWindow) {
        let tsi = window.tsi();
        let _delivery = window.lock_delivery().await;
        while window.has_pending() {
            let result = window.readv(self.config.max_messages_per_read);
            if result.outcome != RxwOutcome::Ok || result.is_empty() {
                break;
            }

            if result.lost > 0 {
                debug!("{}: {} sequence numbers were lost", tsi, result.lost);
                self.message_dispatcher.on_loss(tsi, result.lost).await;
            }
            for message in &result.messages {
                self.message_dispatcher.on_message(tsi, message.first_sqn, &message.payload).await;
            }
            window.release_committed();
        }
    }

    /// FEC reconstruction, if the push made a transmission group reconstructable
    fn try_repair(&self, window: &ReceiveWindow, group: Option<TransmissionGroup>, now: Timestamp) {
        let (Some(group), Some(decoder)) = (group, &self.fec_decoder) else {
            return;
        };
        match window.repair(&group, decoder.as_ref(), now) {
            Ok(n) => debug!("{}: reconstructed {} packets of transmission group #{}", window.tsi(), n, group.first_sqn),
            Err(e) => warn!("{}: reconstructing transmission group #{} failed: {}", window.tsi(), group.first_sqn, e),
        }
    }
}

/// The active part of a receiver: it acts as the receive windows' clock, sending NAKs for
///  expired timers and delivering completed messages to the [MessageDispatcher]. It also
///  routes incoming packets to their session's window.
pub struct ReceiveDriver {
    inner: Arc<ReceiveDriverInner>,
    active_handle: Option<JoinHandle<()>>,
}

impl Drop for ReceiveDriver {
    fn drop(&mut self) {
        if let Some(handle) = self.active_handle.take() {
            handle.abort();
        }
    }
}

impl ReceiveDriver {
    pub fn new(
        config: Arc<DriverConfig>,
        registry: Arc<SessionRegistry>,
        clock: Arc<dyn Clock>,
        nak_sender: Arc<dyn NakSender>,
        message_dispatcher: Arc<dyn MessageDispatcher>,
        fec_decoder: Option<Arc<dyn FecDecoder>>,
    ) -> anyhow::Result<ReceiveDriver> {
        config.validate()?;

        Ok(ReceiveDriver {
            inner: Arc::new(ReceiveDriverInner {
                config,
                registry,
                clock,
                nak_sender,
                message_dispatcher,
                fec_decoder,
            }),
            active_handle: None,
        })
    }

    pub fn spawn_active_loop(&mut self) {
        if self.active_handle.is_some() {
            warn!("active loop already spawned");
            return;
        }
        self.active_handle = Some(tokio::spawn(Self::do_loop(self.inner.clone())));
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    /// Handles an ODATA or RDATA packet
    pub async fn on_data(&self, packet: ReceivedPacket, source: Option<RepairSource>) -> anyhow::Result<RxwResult> {
        let now = self.inner.clock.now();
        let window = self.inner.registry.get_or_create(packet.tsi)?;

        let mut result = match source {
            None => window.push(packet, now),
            Some(source) => window.push_nth_repair(packet, source, now),
        };
        self.inner.try_repair(&window, result.repairable.take(), now);
        self.inner.drain(&window).await;
        Ok(result)
    }

    pub async fn on_parity(&self, packet: ReceivedPacket) -> anyhow::Result<RxwResult> {
        let now = self.inner.clock.now();
        let window = self.inner.registry.get_or_create(packet.tsi)?;

        let mut result = window.push_nth_parity(packet, now);
        self.inner.try_repair(&window, result.repairable.take(), now);
        self.inner.drain(&window).await;
        Ok(result)
    }

    pub fn on_ncf(&self, tsi: Tsi, sequence: SequenceNumber, send_time: Timestamp) -> RxwResult {
        match self.inner.registry.get(tsi) {
            Some(window) => window.ncf(sequence, send_time, self.inner.clock.now()),
            None => RxwResult::new(RxwOutcome::Unknown),
        }
    }

    /// Handles a sender's status report (SPM)
    pub async fn on_status_report(&self, tsi: Tsi, txw_trail: SequenceNumber, txw_lead: SequenceNumber, tg_size: u32, tg_sqn_shift: u32) -> anyhow::Result<RxwResult> {
        let now = self.inner.clock.now();
        let window = self.inner.registry.get_or_create(tsi)?;
        let result = window.window_update(txw_trail, txw_lead, tg_size, tg_sqn_shift, now);
        self.inner.drain(&window).await;
        Ok(result)
    }

    /// runs a single iteration of the active loop
    pub async fn tick(&self) {
        self.inner.on_tick().await;
    }

    /// Active loop - this function never returns, it runs until it is taken out of dispatch
    async fn do_loop(inner: Arc<ReceiveDriverInner>) {
        let mut tick_interval = interval(inner.config.tick_interval);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tick_interval.tick().await;
            inner.on_tick().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::config::test_config;
    use crate::fec::{xor_parity, XorDecoder};
    use crate::nak::{MockNakSender, NakRequest, NakStage};
    use crate::packet::test_packet;
    use async_trait::async_trait;
    use mockall::predicate::eq;
    use std::time::Duration;
    use tokio::runtime::Builder;
    use tokio::sync::{Mutex, Notify};

    struct CollectingMessageDispatcher {
        messages: Mutex<Vec<(u32, Vec<u8>)>>,
        losses: Mutex<u32>,
    }
    impl CollectingMessageDispatcher {
        fn new() -> CollectingMessageDispatcher {
            CollectingMessageDispatcher {
                messages: Default::default(),
                losses: Default::default(),
            }
        }

        async fn assert_messages(&self, expected: Vec<(u32, &str)>) {
            let expected = expected.into_iter()
                .map(|(sqn, buf)| (sqn, buf.as_bytes().to_vec()))
                .collect::<Vec<_>>();
            assert_eq!(self.messages.lock().await.clone(), expected);
        }
    }
    #[async_trait]
    impl MessageDispatcher for CollectingMessageDispatcher {
        async fn on_message(&self, _tsi: Tsi, first_sqn: SequenceNumber, msg_buf: &[u8]) {
            self.messages.lock().await.push((first_sqn.to_raw(), msg_buf.to_vec()));
        }

        async fn on_loss(&self, _tsi: Tsi, num_lost: u32) {
            *self.losses.lock().await += num_lost;
        }
    }

    /// holds up the dispatch of #0 until released
    struct BlockingMessageDispatcher {
        entered: Notify,
        release: Notify,
        messages: Mutex<Vec<u32>>,
    }
    #[async_trait]
    impl MessageDispatcher for BlockingMessageDispatcher {
        async fn on_message(&self, _tsi: Tsi, first_sqn: SequenceNumber, _msg_buf: &[u8]) {
            if first_sqn == SequenceNumber::ZERO {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.messages.lock().await.push(first_sqn.to_raw());
        }

        async fn on_loss(&self, _tsi: Tsi, _num_lost: u32) {}
    }

    fn tsi() -> Tsi {
        Tsi::new([1, 2, 3, 4, 5, 6], 7500)
    }

    fn fixed_clock(micros: u64) -> Arc<MockClock> {
        let mut clock = MockClock::new();
        clock.expect_now()
            .return_const(Timestamp::from_micros(micros));
        Arc::new(clock)
    }

    fn driver(clock: Arc<MockClock>, nak_sender: MockNakSender, dispatcher: Arc<dyn MessageDispatcher>, fec_decoder: Option<Arc<dyn FecDecoder>>) -> ReceiveDriver {
        let tg_size = if fec_decoder.is_some() { 4 } else { 1 };
        let registry = Arc::new(SessionRegistry::new(Arc::new(test_config(16, tg_size))).unwrap());
        ReceiveDriver::new(
            Arc::new(DriverConfig {
                tick_interval: Duration::from_millis(10),
                max_messages_per_read: 2,
            }),
            registry,
            clock,
            Arc::new(nak_sender),
            dispatcher,
            fec_decoder,
        ).unwrap()
    }

    #[test]
    fn test_on_data_dispatches_in_order() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let dispatcher = Arc::new(CollectingMessageDispatcher::new());
            let driver = driver(fixed_clock(0), MockNakSender::new(), dispatcher.clone(), None);

            assert_eq!(driver.on_data(test_packet(0, b"a"), None).await.unwrap(), RxwOutcome::AdvancedWindow);
            assert_eq!(driver.on_data(test_packet(2, b"c"), None).await.unwrap(), RxwOutcome::AdvancedWindow);
            dispatcher.assert_messages(vec![(0, "a")]).await;

            assert_eq!(driver.on_data(test_packet(1, b"b"), Some(RepairSource::Retransmission)).await.unwrap(), RxwOutcome::FilledPlaceholder);
            dispatcher.assert_messages(vec![(0, "a"), (1, "b"), (2, "c")]).await;

            let window = driver.registry().get(tsi()).unwrap();
            assert_eq!(window.trail(), SequenceNumber::from_raw(3));
            assert!(window.is_empty());
        });
    }

    #[test]
    fn test_tick_sends_naks() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut nak_sender = MockNakSender::new();
            nak_sender.expect_send_nak()
                .with(eq(tsi()), eq(NakRequest { first: SequenceNumber::from_raw(1), last: SequenceNumber::from_raw(2), stage: NakStage::Initial }))
                .times(1)
                .return_const(());

            let dispatcher = Arc::new(CollectingMessageDispatcher::new());
            let driver = driver(fixed_clock(100_000), nak_sender, dispatcher.clone(), None);
            let window = driver.registry().get_or_create(tsi()).unwrap();
            let _ = window.push(test_packet(0, b"a"), Timestamp::ZERO);
            let _ = window.push(test_packet(3, b"d"), Timestamp::ZERO);

            driver.tick().await;
            // the NAKs' repeat timers have not expired yet
            driver.tick().await;

            dispatcher.assert_messages(vec![(0, "a")]).await;
        });
    }

    #[test]
    fn test_active_loop() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let mut nak_sender = MockNakSender::new();
            nak_sender.expect_send_nak()
                .with(eq(tsi()), eq(NakRequest::single(SequenceNumber::from_raw(1), NakStage::Initial)))
                .times(1)
                .return_const(());

            let dispatcher = Arc::new(CollectingMessageDispatcher::new());
            let mut driver = driver(fixed_clock(100_000), nak_sender, dispatcher.clone(), None);
            let window = driver.registry().get_or_create(tsi()).unwrap();
            let _ = window.push(test_packet(0, b"a"), Timestamp::ZERO);
            let _ = window.push(test_packet(2, b"c"), Timestamp::ZERO);

            driver.spawn_active_loop();
            tokio::time::sleep(Duration::from_millis(55)).await;

            dispatcher.assert_messages(vec![(0, "a")]).await;
            assert_eq!(window.peek(SequenceNumber::from_raw(1)).unwrap().nak_transmit_count, 1);
        });
    }

    #[test]
    fn test_losses_are_reported() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let dispatcher = Arc::new(CollectingMessageDispatcher::new());
            let driver = driver(fixed_clock(0), MockNakSender::new(), dispatcher.clone(), None);

            let _ = driver.on_data(test_packet(0, b"a"), None).await.unwrap();
            let _ = driver.on_data(test_packet(2, b"c"), None).await.unwrap();
            let window = driver.registry().get(tsi()).unwrap();
            assert_eq!(window.mark_lost(SequenceNumber::from_raw(1)), RxwOutcome::Ok);

            driver.tick().await;
            dispatcher.assert_messages(vec![(0, "a"), (2, "c")]).await;
            assert_eq!(*dispatcher.losses.lock().await, 1);
        });
    }

    #[test]
    fn test_parity_repair() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let dispatcher = Arc::new(CollectingMessageDispatcher::new());
            let driver = driver(fixed_clock(0), MockNakSender::new(), dispatcher.clone(), Some(Arc::new(XorDecoder) as Arc<dyn FecDecoder>));

            let _ = driver.on_data(test_packet(0, b"aaaa"), None).await.unwrap();
            let _ = driver.on_data(test_packet(1, b"bbbb"), None).await.unwrap();
            let _ = driver.on_data(test_packet(3, b"dddd"), None).await.unwrap();

            let mut parity = test_packet(0, &[]);
            parity.payload = xor_parity(&[&b"aaaa"[..], &b"bbbb"[..], &b"cccc"[..], &b"dddd"[..]]);
            assert_eq!(driver.on_parity(parity).await.unwrap(), RxwOutcome::Ok);

            dispatcher.assert_messages(vec![(0, "aaaa"), (1, "bbbb"), (2, "cccc"), (3, "dddd")]).await;
        });
    }

    #[test]
    fn test_on_ncf_unknown_session() {
        let driver = driver(fixed_clock(0), MockNakSender::new(), Arc::new(CollectingMessageDispatcher::new()), None);
        assert_eq!(driver.on_ncf(tsi(), SequenceNumber::ZERO, Timestamp::ZERO), RxwOutcome::Unknown);
    }

    #[test]
    fn test_on_status_report_late_join() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let dispatcher = Arc::new(CollectingMessageDispatcher::new());
            let driver = driver(fixed_clock(0), MockNakSender::new(), dispatcher.clone(), None);

            let result = driver.on_status_report(tsi(), SequenceNumber::from_raw(90), SequenceNumber::from_raw(100), 0, 0).await.unwrap();
            assert_eq!(result, RxwOutcome::Ok);

            let window = driver.registry().get(tsi()).unwrap();
            assert!(window.is_empty());
            assert_eq!(window.trail(), SequenceNumber::from_raw(101));

            let _ = driver.on_data(test_packet(101, b"x"), None).await.unwrap();
            dispatcher.assert_messages(vec![(101, "x")]).await;
        });
    }

    #[test]
    fn test_overlapping_drains_keep_order() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let dispatcher = Arc::new(BlockingMessageDispatcher {
                entered: Notify::new(),
                release: Notify::new(),
                messages: Default::default(),
            });
            let driver = Arc::new(driver(fixed_clock(0), MockNakSender::new(), dispatcher.clone(), None));

            let first = tokio::spawn({
                let driver = driver.clone();
                async move { driver.on_data(test_packet(0, b"a"), None).await.unwrap().outcome }
            });
            dispatcher.entered.notified().await;

            let second = tokio::spawn({
                let driver = driver.clone();
                async move { driver.on_data(test_packet(1, b"b"), None).await.unwrap().outcome }
            });
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
            assert!(dispatcher.messages.lock().await.is_empty());

            dispatcher.release.notify_one();
            assert_eq!(first.await.unwrap(), RxwOutcome::AdvancedWindow);
            assert_eq!(second.await.unwrap(), RxwOutcome::AdvancedWindow);

            assert_eq!(*dispatcher.messages.lock().await, vec![0, 1]);
        });
    }

    #[test]
    fn test_concurrent_entry_points() {
        let rt = Builder::new_multi_thread().worker_threads(4).enable_all().build().unwrap();
        rt.block_on(async {
            let mut nak_sender = MockNakSender::new();
            nak_sender.expect_send_nak()
                .return_const(());
            let dispatcher = Arc::new(CollectingMessageDispatcher::new());
            let driver = Arc::new(driver(fixed_clock(0), nak_sender, dispatcher.clone(), None));

            let num_tasks: u32 = 4;
            let num_packets: u32 = 15;
            // defines the window's trail
            let _ = driver.on_data(test_packet(0, b"0"), None).await.unwrap();

            let mut handles = Vec::new();
            for task in 0..num_tasks {
                let driver = driver.clone();
                handles.push(tokio::spawn(async move {
                    // every task pushes every num_tasks'th packet, from the back
                    for sqn in (1..num_packets).rev().filter(|sqn| sqn % num_tasks == task) {
                        let _ = driver.on_data(test_packet(sqn, sqn.to_string().as_bytes()), None).await.unwrap();
                        driver.tick().await;
                    }
                }));
            }
            for handle in handles {
                handle.await.unwrap();
            }
            driver.tick().await;

            let expected = (0..num_packets).map(|sqn| (sqn, sqn.to_string())).collect::<Vec<_>>();
            dispatcher.assert_messages(expected.iter().map(|(sqn, s)| (*sqn, s.as_str())).collect()).await;
            assert_eq!(*dispatcher.losses.lock().await, 0);
            driver.registry().get(tsi()).unwrap().assert_invariants();
        });
    }
}
