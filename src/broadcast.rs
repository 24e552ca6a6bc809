use crate::protocol::Frame;
use crate::state::StateManager;
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, channel::Channel, signal::Signal};
use embassy_time::{Duration, Ticker};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

pub const DEFAULT_BROADCAST_PERIOD_MS: u64 = 100;

pub type ObserverId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The consumer is gone; the hub drops the observer.
    Disconnected,
    /// The consumer has not taken the previous frame; this one is skipped.
    Lagging,
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DeliveryError::Disconnected => write!(f, "observer disconnected"),
            DeliveryError::Lagging => write!(f, "observer lagging, frame dropped"),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// A consumer of the periodic broadcast. `deliver` must not block.
pub trait Observer: Send + Sync {
    fn deliver(&self, frame: &Frame) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    Stopped,
    Running,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub delivered: usize,
    pub dropped: usize,
    pub disconnected: usize,
}

/// Fans the current scale state out to every registered observer on a fixed
/// cadence. Each tick takes one snapshot and encodes it once.
pub struct BroadcastHub {
    state: StateManager,
    period: Duration,
    running: AtomicBool,
    started: Signal<CriticalSectionRawMutex, ()>,
    next_id: AtomicU32,
    observers: StdMutex<Vec<(ObserverId, Arc<dyn Observer>)>>,
}

impl BroadcastHub {
    pub fn new(state: StateManager, period: Duration) -> Self {
        Self {
            state,
            period,
            running: AtomicBool::new(false),
            started: Signal::new(),
            next_id: AtomicU32::new(1),
            observers: StdMutex::new(Vec::new()),
        }
    }

    pub fn register(&self, observer: Arc<dyn Observer>) -> ObserverId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        observers.push((id, observer));
        info!("Registered observer {} ({} total)", id, observers.len());
        id
    }

    pub fn deregister(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|(observer_id, _)| *observer_id != id);
        let removed = observers.len() != before;
        if removed {
            info!("Removed observer {} ({} remaining)", id, observers.len());
        }
        removed
    }

    pub fn observer_count(&self) -> usize {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn state(&self) -> HubState {
        if self.running.load(Ordering::Acquire) {
            HubState::Running
        } else {
            HubState::Stopped
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == HubState::Running
    }

    /// Stopped -> Running. Returns false if the hub was already running.
    pub fn start(&self) -> bool {
        let started = self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if started {
            self.started.signal(());
            info!("Broadcast hub started ({}ms period)", self.period.as_millis());
        }
        started
    }

    /// Running -> Stopped. Future ticks are skipped; an in-flight tick finishes.
    pub fn stop(&self) -> bool {
        let stopped = self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if stopped {
            info!("Broadcast hub stopped");
        }
        stopped
    }

    /// Snapshots the state once and delivers the encoded frame to every
    /// observer registered at this moment.
    pub async fn tick(&self) -> TickReport {
        let snapshot = self.state.snapshot().await;
        let frame = Frame::from_state(&snapshot);

        // Deliver outside the registry lock so joins and leaves never wait on a tick
        let targets: Vec<(ObserverId, Arc<dyn Observer>)> = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut report = TickReport::default();
        let mut gone = Vec::new();
        for (id, observer) in &targets {
            match observer.deliver(&frame) {
                Ok(()) => report.delivered += 1,
                Err(DeliveryError::Lagging) => {
                    debug!("Observer {} lagging, dropped frame", id);
                    report.dropped += 1;
                }
                Err(DeliveryError::Disconnected) => {
                    warn!("Observer {} disconnected", id);
                    report.disconnected += 1;
                    gone.push(*id);
                }
            }
        }

        for id in gone {
            self.deregister(id);
        }
        report
    }

    /// Broadcast loop. Never returns: while stopped it parks until the next
    /// `start`, then ticks on a fresh period.
    pub async fn run(&self) {
        let mut ticks = 0u32;
        loop {
            if !self.is_running() {
                debug!("Broadcast loop idle after {} ticks", ticks);
                self.started.wait().await;
                continue;
            }

            let mut ticker = Ticker::every(self.period);
            while self.is_running() {
                ticker.next().await;
                if !self.is_running() {
                    break;
                }
                let report = self.tick().await;
                ticks = ticks.wrapping_add(1);
                debug!(
                    "Tick {}: {} delivered, {} dropped, {} disconnected",
                    ticks, report.delivered, report.dropped, report.disconnected
                );
            }
        }
    }
}

pub type FrameChannel = Channel<CriticalSectionRawMutex, Frame, 1>;

/// In-process observer backed by a single-slot channel.
pub struct ChannelObserver {
    channel: FrameChannel,
    closed: AtomicBool,
}

impl Default for ChannelObserver {
    fn default() -> Self {
        Self {
            channel: Channel::new(),
            closed: AtomicBool::new(false),
        }
    }
}

impl ChannelObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn receive(&self) -> Frame {
        self.channel.receive().await
    }

    pub fn try_receive(&self) -> Option<Frame> {
        self.channel.try_receive().ok()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl Observer for ChannelObserver {
    fn deliver(&self, frame: &Frame) -> Result<(), DeliveryError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DeliveryError::Disconnected);
        }
        self.channel
            .try_send(frame.clone())
            .map_err(|_| DeliveryError::Lagging)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{CommandDispatcher, ScaleCommand};
    use crate::protocol::decode_packet;
    use embassy_futures::{block_on, select::select};
    use std::sync::OnceLock;
    use embassy_time::Timer;

    #[derive(Default)]
    struct RecordingObserver {
        frames: StdMutex<Vec<Frame>>,
    }

    impl RecordingObserver {
        fn count(&self) -> usize {
            self.frames.lock().unwrap().len()
        }

        fn last(&self) -> Option<Frame> {
            self.frames.lock().unwrap().last().cloned()
        }
    }

    impl Observer for RecordingObserver {
        fn deliver(&self, frame: &Frame) -> Result<(), DeliveryError> {
            self.frames.lock().unwrap().push(frame.clone());
            Ok(())
        }
    }

    struct DroppedConnection;

    impl Observer for DroppedConnection {
        fn deliver(&self, _frame: &Frame) -> Result<(), DeliveryError> {
            Err(DeliveryError::Disconnected)
        }
    }

    fn hub() -> (BroadcastHub, StateManager) {
        let state = StateManager::default();
        let hub = BroadcastHub::new(state.clone(), Duration::from_millis(20));
        (hub, state)
    }

    #[test]
    fn test_disconnect_does_not_abort_tick() {
        let (hub, _) = hub();
        let first = Arc::new(RecordingObserver::default());
        let second = Arc::new(RecordingObserver::default());
        hub.register(first.clone());
        hub.register(Arc::new(DroppedConnection));
        hub.register(second.clone());

        let report = block_on(hub.tick());
        assert_eq!(report.delivered, 2);
        assert_eq!(report.disconnected, 1);
        assert_eq!(first.count(), 1);
        assert_eq!(second.count(), 1);
        assert_eq!(hub.observer_count(), 2);

        let report = block_on(hub.tick());
        assert_eq!(report.delivered, 2);
        assert_eq!(report.disconnected, 0);
    }

    #[test]
    fn test_join_and_leave() {
        let (hub, _) = hub();
        let early = Arc::new(RecordingObserver::default());
        let early_id = hub.register(early.clone());
        block_on(hub.tick());

        let late = Arc::new(RecordingObserver::default());
        hub.register(late.clone());
        assert_eq!(late.count(), 0);
        block_on(hub.tick());
        assert_eq!(late.count(), 1);

        assert!(hub.deregister(early_id));
        assert!(!hub.deregister(early_id));
        block_on(hub.tick());
        assert_eq!(early.count(), 2);
        assert_eq!(late.count(), 2);
    }

    #[test]
    fn test_tick_sees_applied_command() {
        let (hub, state) = hub();
        let observer = Arc::new(RecordingObserver::default());
        hub.register(observer.clone());

        let dispatcher = CommandDispatcher::new(state);
        block_on(dispatcher.dispatch(ScaleCommand::SetWeight { weight: 321.0 })).unwrap();
        block_on(hub.tick());

        let frame = observer.last().unwrap();
        assert_eq!(decode_packet(&frame.packet).unwrap().display_weight, 321.0);
        assert!(frame.message.contains("\"weight\":321.0"));
    }

    #[test]
    fn test_lagging_channel_drops_frames() {
        let (hub, _) = hub();
        let observer = ChannelObserver::new();
        hub.register(observer.clone());

        assert_eq!(block_on(hub.tick()).delivered, 1);
        let report = block_on(hub.tick());
        assert_eq!(report.dropped, 1);
        assert_eq!(hub.observer_count(), 1);

        assert!(observer.try_receive().is_some());
        assert!(observer.try_receive().is_none());

        observer.close();
        assert_eq!(block_on(hub.tick()).disconnected, 1);
        assert_eq!(hub.observer_count(), 0);
    }

    #[test]
    fn test_state_transitions() {
        let (hub, _) = hub();
        assert_eq!(hub.state(), HubState::Stopped);
        assert!(!hub.stop());
        assert!(hub.start());
        assert!(!hub.start());
        assert_eq!(hub.state(), HubState::Running);
        assert!(hub.stop());
        assert_eq!(hub.state(), HubState::Stopped);
    }

    /// Takes itself out of the hub from inside `deliver`, as a connection
    /// dropping mid-tick does.
    struct DropsMidTick {
        hub: Arc<BroadcastHub>,
        id: OnceLock<ObserverId>,
    }

    impl Observer for DropsMidTick {
        fn deliver(&self, _frame: &Frame) -> Result<(), DeliveryError> {
            if let Some(id) = self.id.get() {
                self.hub.deregister(*id);
            }
            Err(DeliveryError::Disconnected)
        }
    }

    #[test]
    fn test_disconnect_mid_tick() {
        let hub = Arc::new(BroadcastHub::new(StateManager::default(), Duration::from_millis(20)));
        let first = Arc::new(RecordingObserver::default());
        let second = Arc::new(RecordingObserver::default());
        let dropping = Arc::new(DropsMidTick {
            hub: Arc::clone(&hub),
            id: OnceLock::new(),
        });

        hub.register(first.clone());
        let id = hub.register(dropping.clone());
        dropping.id.set(id).unwrap();
        hub.register(second.clone());

        let report = block_on(hub.tick());
        assert_eq!(report.delivered, 2);
        assert_eq!(report.disconnected, 1);
        assert_eq!(first.count(), 1);
        assert_eq!(second.count(), 1);
        assert_eq!(hub.observer_count(), 2);
    }

    #[test]
    fn test_run_idles_while_stopped() {
        let (hub, _) = hub();
        let observer = Arc::new(RecordingObserver::default());
        hub.register(observer.clone());

        block_on(select(hub.run(), Timer::after(Duration::from_millis(100))));
        assert_eq!(observer.count(), 0);
    }

    #[test]
    fn test_run_until_stopped() {
        let (hub, _) = hub();
        let observer = Arc::new(RecordingObserver::default());
        hub.register(observer.clone());
        hub.start();

        block_on(select(hub.run(), async {
            Timer::after(Duration::from_millis(150)).await;
            hub.stop();
            // let an in-flight tick settle
            Timer::after(Duration::from_millis(30)).await;
        }));

        let seen = observer.count();
        assert!(seen >= 2, "only {} ticks delivered", seen);
        assert_eq!(hub.state(), HubState::Stopped);

        block_on(hub.tick());
        assert_eq!(observer.count(), seen + 1);
    }

    #[test]
    fn test_restart_resumes_ticks() {
        let (hub, _) = hub();
        let observer = Arc::new(RecordingObserver::default());
        hub.register(observer.clone());
        hub.start();

        let mut while_stopped = (0, 0);
        block_on(select(hub.run(), async {
            Timer::after(Duration::from_millis(100)).await;
            hub.stop();
            Timer::after(Duration::from_millis(30)).await;
            let stopped_at = observer.count();
            Timer::after(Duration::from_millis(100)).await;
            while_stopped = (stopped_at, observer.count());

            assert!(hub.start());
            Timer::after(Duration::from_millis(150)).await;
        }));

        assert_eq!(while_stopped.0, while_stopped.1);
        assert_eq!(hub.state(), HubState::Running);
        assert!(
            observer.count() >= while_stopped.1 + 2,
            "ticks did not resume: {} -> {}",
            while_stopped.1,
            observer.count()
        );
    }
}
