/// Memory watcher: periodically measures one service and restarts it when
/// its resident memory reaches the configured limit.
///
/// Every failure inside a check cycle is logged through the event sink and
/// ends that cycle only. The watcher itself keeps ticking until stopped.
use crate::config::{OverlapPolicy, WatchConfig};
use crate::control::ServiceControl;
use crate::events::{EventSink, Severity};
use crate::resolver::ProcessResolver;
use std::sync::{Arc, Mutex, TryLockError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Lifecycle state of the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Stopped,
    Running,
}

/// How a single check cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    ServiceNotFound,
    ProcessNotFound,
    /// The resolver could not answer at all.
    LookupFailed,
    BelowLimit { usage_kb: u64, limit_kb: u64 },
    Restarted { usage_kb: u64 },
    StopFailed,
    StartFailed,
    /// The previous cycle was still running.
    Skipped,
    /// The cycle panicked on the blocking pool.
    Panicked,
}

struct Shared<R, C, S> {
    config: WatchConfig,
    resolver: R,
    control: C,
    sink: S,
    busy: Mutex<()>,
}

pub struct Watcher<R, C, S> {
    shared: Arc<Shared<R, C, S>>,
    state: WatcherState,
    shutdown: Option<watch::Sender<bool>>,
    timer: Option<JoinHandle<()>>,
}

impl<R, C, S> Watcher<R, C, S>
where
    R: ProcessResolver,
    C: ServiceControl,
    S: EventSink,
{
    pub fn new(config: WatchConfig, resolver: R, control: C, sink: S) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                resolver,
                control,
                sink,
                busy: Mutex::new(()),
            }),
            state: WatcherState::Stopped,
            shutdown: None,
            timer: None,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> WatcherState {
        self.state
    }

    /// Check once right away, then keep checking every interval.
    pub async fn start(&mut self) {
        if self.state == WatcherState::Running {
            tracing::debug!("watcher already running");
            return;
        }
        self.state = WatcherState::Running;
        tracing::info!(
            service = %self.shared.config.service(),
            interval_ms = self.shared.config.interval().as_millis() as u64,
            limit_kb = self.shared.config.memory_limit_kb(),
            "watcher started"
        );

        let outcome = self.check_once().await;
        tracing::debug!(?outcome, "initial check finished");

        let (tx, rx) = watch::channel(false);
        self.timer = Some(tokio::spawn(timer_loop(Arc::clone(&self.shared), rx)));
        self.shutdown = Some(tx);
    }

    /// Stop scheduling checks. A cycle already running is left to finish.
    pub async fn stop(&mut self) {
        if self.state == WatcherState::Stopped {
            tracing::debug!("watcher already stopped");
            return;
        }
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
        if let Some(timer) = self.timer.take() {
            if let Err(e) = timer.await {
                tracing::warn!(error = %e, "timer task ended abnormally");
            }
        }
        self.state = WatcherState::Stopped;
        tracing::info!(service = %self.shared.config.service(), "watcher stopped");
    }

    /// Run one check cycle now, honoring the overlap policy.
    pub async fn check_once(&self) -> CycleOutcome {
        dispatch(Arc::clone(&self.shared), None).await
    }
}

async fn timer_loop<R, C, S>(shared: Arc<Shared<R, C, S>>, mut shutdown: watch::Receiver<bool>)
where
    R: ProcessResolver,
    C: ServiceControl,
    S: EventSink,
{
    let period = shared.config.interval();
    let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticks.tick() => {
                // Not awaited: a slow cycle must not hold up the next tick.
                tokio::spawn(dispatch(Arc::clone(&shared), Some(shutdown.clone())));
            }
        }
    }
}

/// Run a cycle on the blocking pool. A timer-driven cycle passes the shutdown
/// receiver and does not begin once shutdown has been requested.
async fn dispatch<R, C, S>(
    shared: Arc<Shared<R, C, S>>,
    shutdown: Option<watch::Receiver<bool>>,
) -> CycleOutcome
where
    R: ProcessResolver,
    C: ServiceControl,
    S: EventSink,
{
    let cycle = move || {
        if shutdown.as_ref().is_some_and(|rx| *rx.borrow()) {
            tracing::debug!("watcher stopping, dropping tick");
            return CycleOutcome::Skipped;
        }
        shared.run_guarded()
    };
    match tokio::task::spawn_blocking(cycle).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(error = %e, "check cycle panicked");
            CycleOutcome::Panicked
        }
    }
}

impl<R, C, S> Shared<R, C, S>
where
    R: ProcessResolver,
    C: ServiceControl,
    S: EventSink,
{
    fn run_guarded(&self) -> CycleOutcome {
        if self.config.overlap() == OverlapPolicy::Allow {
            return self.run_cycle();
        }
        match self.busy.try_lock() {
            Ok(_guard) => self.run_cycle(),
            Err(TryLockError::WouldBlock) => {
                tracing::debug!("previous check still running, skipping tick");
                CycleOutcome::Skipped
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                let _guard = poisoned.into_inner();
                self.run_cycle()
            }
        }
    }

    fn run_cycle(&self) -> CycleOutcome {
        let name = self.config.service();
        let limit_kb = self.config.memory_limit_kb();

        let service = match self.resolver.find_service(name) {
            Ok(Some(service)) => service,
            Ok(None) => {
                self.sink
                    .record(Severity::Error, &format!("could not find service: {name}"));
                return CycleOutcome::ServiceNotFound;
            }
            Err(e) => {
                self.sink.record(
                    Severity::Error,
                    &format!("failed to look up service {name}: {e}"),
                );
                return CycleOutcome::LookupFailed;
            }
        };

        let sample = match self.resolver.find_process(&service) {
            Ok(Some(sample)) => sample,
            Ok(None) => {
                self.sink.record(
                    Severity::Error,
                    &format!("could not find process for service: {name}"),
                );
                return CycleOutcome::ProcessNotFound;
            }
            Err(e) => {
                self.sink.record(
                    Severity::Error,
                    &format!("failed to look up process for service {name}: {e}"),
                );
                return CycleOutcome::LookupFailed;
            }
        };

        let usage_kb = sample.resident_kb();
        tracing::debug!(pid = sample.pid, usage_kb, sampled_at = %sample.sampled_at, "sampled process");

        if usage_kb < limit_kb {
            self.sink.record(
                Severity::Information,
                &format!(
                    "memory usage for service {} is below limit. {usage_kb}KB < {limit_kb}KB",
                    service.display_name
                ),
            );
            return CycleOutcome::BelowLimit { usage_kb, limit_kb };
        }

        let op = if usage_kb == limit_kb { ">=" } else { ">" };
        self.sink.record(
            Severity::Warning,
            &format!(
                "memory usage for service {} is above limit. {usage_kb}KB {op} {limit_kb}KB",
                service.display_name
            ),
        );

        tracing::info!(service = %name, "stopping service");
        let stopped = self
            .control
            .stop(&service)
            .and_then(|()| self.control.wait_for_stopped(&service));
        if let Err(e) = stopped {
            self.sink
                .record(Severity::Error, &format!("error stopping service: {e}"));
            if !self.config.restart_after_stop_failure() {
                return CycleOutcome::StopFailed;
            }
            tracing::info!(service = %name, "attempting start despite stop failure");
            return match self.control.start(&service) {
                Ok(()) => {
                    self.sink.record(
                        Severity::Information,
                        &format!("service {} started after failed stop", service.display_name),
                    );
                    CycleOutcome::StopFailed
                }
                Err(e) => {
                    self.sink
                        .record(Severity::Error, &format!("error starting service: {e}"));
                    CycleOutcome::StartFailed
                }
            };
        }

        tracing::info!(service = %name, "starting service");
        if let Err(e) = self.control.start(&service) {
            self.sink
                .record(Severity::Error, &format!("error starting service: {e}"));
            return CycleOutcome::StartFailed;
        }

        self.sink.record(
            Severity::Information,
            &format!("service {} restarted", service.display_name),
        );
        CycleOutcome::Restarted { usage_kb }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlError;
    use crate::events::RecordingSink;
    use crate::resolver::{ProcessSample, ResolveError, ServiceHandle};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Resolver answering from a scripted queue of memory readings.
    /// Once the queue holds a single reading it is repeated forever.
    struct FakeResolver {
        service_exists: bool,
        lookup_fails: bool,
        readings: Mutex<VecDeque<Option<u64>>>,
        service_calls: AtomicUsize,
        process_calls: AtomicUsize,
    }

    impl FakeResolver {
        fn with_readings(readings: &[Option<u64>]) -> Self {
            Self {
                service_exists: true,
                lookup_fails: false,
                readings: Mutex::new(readings.iter().copied().collect()),
                service_calls: AtomicUsize::new(0),
                process_calls: AtomicUsize::new(0),
            }
        }

        fn using(bytes: u64) -> Self {
            Self::with_readings(&[Some(bytes)])
        }

        fn missing_service() -> Self {
            Self {
                service_exists: false,
                ..Self::using(0)
            }
        }

        fn cycles(&self) -> usize {
            self.service_calls.load(Ordering::SeqCst)
        }
    }

    impl ProcessResolver for FakeResolver {
        fn find_service(&self, name: &str) -> Result<Option<ServiceHandle>, ResolveError> {
            self.service_calls.fetch_add(1, Ordering::SeqCst);
            if self.lookup_fails {
                return Err(ResolveError::Parse {
                    detail: "bus unavailable".to_string(),
                });
            }
            Ok(self.service_exists.then(|| ServiceHandle {
                name: name.to_string(),
                display_name: format!("{name} Display"),
            }))
        }

        fn find_process(
            &self,
            _service: &ServiceHandle,
        ) -> Result<Option<ProcessSample>, ResolveError> {
            self.process_calls.fetch_add(1, Ordering::SeqCst);
            let mut readings = self.readings.lock().unwrap();
            let reading = if readings.len() > 1 {
                readings.pop_front().flatten()
            } else {
                readings.front().copied().flatten()
            };
            Ok(reading.map(|bytes| ProcessSample::new(4242, bytes)))
        }
    }

    #[derive(Default)]
    struct FakeControl {
        fail_stop: bool,
        fail_wait: bool,
        fail_start: bool,
        stop_delay: Duration,
        calls: Mutex<Vec<&'static str>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl FakeControl {
        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }

        fn count(&self, call: &str) -> usize {
            self.calls().iter().filter(|c| **c == call).count()
        }

        fn failure(action: &'static str) -> ControlError {
            ControlError::Command {
                action,
                code: Some(1),
                stderr: "access denied".to_string(),
            }
        }
    }

    impl ServiceControl for FakeControl {
        fn stop(&self, _service: &ServiceHandle) -> Result<(), ControlError> {
            self.calls.lock().unwrap().push("stop");
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.stop_delay);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.fail_stop {
                return Err(Self::failure("stop"));
            }
            Ok(())
        }

        fn wait_for_stopped(&self, _service: &ServiceHandle) -> Result<(), ControlError> {
            self.calls.lock().unwrap().push("wait");
            if self.fail_wait {
                return Err(ControlError::Timeout {
                    service: "TargetSvc".to_string(),
                    waited: Duration::from_secs(30),
                });
            }
            Ok(())
        }

        fn start(&self, _service: &ServiceHandle) -> Result<(), ControlError> {
            self.calls.lock().unwrap().push("start");
            if self.fail_start {
                return Err(Self::failure("start"));
            }
            Ok(())
        }
    }

    type TestWatcher = Watcher<Arc<FakeResolver>, Arc<FakeControl>, Arc<RecordingSink>>;

    struct Harness {
        watcher: TestWatcher,
        resolver: Arc<FakeResolver>,
        control: Arc<FakeControl>,
        sink: Arc<RecordingSink>,
    }

    fn harness(config: WatchConfig, resolver: FakeResolver, control: FakeControl) -> Harness {
        let resolver = Arc::new(resolver);
        let control = Arc::new(control);
        let sink = Arc::new(RecordingSink::new());
        let watcher = Watcher::new(config, resolver.clone(), control.clone(), sink.clone());
        Harness {
            watcher,
            resolver,
            control,
            sink,
        }
    }

    fn config(limit_kb: u64, interval: Duration) -> WatchConfig {
        WatchConfig::new("TargetSvc", interval, limit_kb).unwrap()
    }

    fn hourly(limit_kb: u64) -> WatchConfig {
        config(limit_kb, Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_below_limit_issues_no_commands() {
        let h = harness(hourly(20_000), FakeResolver::using(10_240_000), FakeControl::default());
        for _ in 0..5 {
            let outcome = h.watcher.check_once().await;
            assert_eq!(
                outcome,
                CycleOutcome::BelowLimit {
                    usage_kb: 10_000,
                    limit_kb: 20_000
                }
            );
        }
        assert!(h.control.calls().is_empty());
        assert_eq!(h.sink.count(Severity::Information), 5);
        assert_eq!(h.sink.count(Severity::Error), 0);
    }

    #[tokio::test]
    async fn test_example_restart_then_below_limit() {
        let h = harness(
            hourly(20_000),
            FakeResolver::with_readings(&[Some(25_165_824), Some(10_240_000)]),
            FakeControl::default(),
        );

        let outcome = h.watcher.check_once().await;
        assert_eq!(outcome, CycleOutcome::Restarted { usage_kb: 24_576 });
        assert_eq!(h.control.calls(), vec!["stop", "wait", "start"]);
        let records = h.sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, Severity::Warning);
        assert!(records[0].1.contains("above limit. 24576KB > 20000KB"));
        assert_eq!(records[1].0, Severity::Information);
        assert!(records[1].1.contains("restarted"));

        let outcome = h.watcher.check_once().await;
        assert!(matches!(outcome, CycleOutcome::BelowLimit { usage_kb: 10_000, .. }));
        assert_eq!(h.control.calls().len(), 3);
        let records = h.sink.records();
        assert_eq!(records[2].0, Severity::Information);
        assert!(records[2].1.contains("below limit. 10000KB < 20000KB"));
    }

    #[tokio::test]
    async fn test_usage_equal_to_limit_restarts() {
        let h = harness(hourly(20_000), FakeResolver::using(20_000 * 1024), FakeControl::default());
        let outcome = h.watcher.check_once().await;
        assert_eq!(outcome, CycleOutcome::Restarted { usage_kb: 20_000 });
        assert!(h.sink.records()[0].1.contains("20000KB >= 20000KB"));
    }

    #[tokio::test]
    async fn test_sub_kilobyte_remainder_does_not_trigger() {
        // 20000 KB minus one byte truncates to 19999 KB.
        let h = harness(
            hourly(20_000),
            FakeResolver::using(20_000 * 1024 - 1),
            FakeControl::default(),
        );
        assert!(matches!(
            h.watcher.check_once().await,
            CycleOutcome::BelowLimit { usage_kb: 19_999, .. }
        ));
        assert!(h.control.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_service_skips_process_lookup() {
        let h = harness(hourly(20_000), FakeResolver::missing_service(), FakeControl::default());
        assert_eq!(h.watcher.check_once().await, CycleOutcome::ServiceNotFound);
        assert_eq!(h.resolver.process_calls.load(Ordering::SeqCst), 0);
        assert!(h.control.calls().is_empty());
        let records = h.sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, Severity::Error);
        assert!(records[0].1.contains("could not find service: TargetSvc"));
    }

    #[tokio::test]
    async fn test_missing_process_logs_one_error() {
        let h = harness(
            hourly(20_000),
            FakeResolver::with_readings(&[None]),
            FakeControl::default(),
        );
        assert_eq!(h.watcher.check_once().await, CycleOutcome::ProcessNotFound);
        assert!(h.control.calls().is_empty());
        let records = h.sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, Severity::Error);
        assert!(records[0].1.contains("could not find process for service: TargetSvc"));
    }

    #[tokio::test]
    async fn test_lookup_failure_is_contained() {
        let resolver = FakeResolver {
            lookup_fails: true,
            ..FakeResolver::using(0)
        };
        let h = harness(hourly(20_000), resolver, FakeControl::default());
        assert_eq!(h.watcher.check_once().await, CycleOutcome::LookupFailed);
        assert!(h.control.calls().is_empty());
        assert_eq!(h.sink.count(Severity::Error), 1);
        assert!(h.sink.records()[0].1.contains("bus unavailable"));
    }

    #[tokio::test]
    async fn test_stop_failure_never_starts() {
        let control = FakeControl {
            fail_stop: true,
            ..Default::default()
        };
        let h = harness(hourly(20_000), FakeResolver::using(25_165_824), control);
        assert_eq!(h.watcher.check_once().await, CycleOutcome::StopFailed);
        assert_eq!(h.control.calls(), vec!["stop"]);
        assert_eq!(h.sink.count(Severity::Error), 1);
        assert_eq!(h.sink.count(Severity::Warning), 1);
        assert_eq!(h.sink.count(Severity::Information), 0);
        assert!(h.sink.records()[1].1.starts_with("error stopping service"));
    }

    #[tokio::test]
    async fn test_wait_failure_never_starts() {
        let control = FakeControl {
            fail_wait: true,
            ..Default::default()
        };
        let h = harness(hourly(20_000), FakeResolver::using(25_165_824), control);
        assert_eq!(h.watcher.check_once().await, CycleOutcome::StopFailed);
        assert_eq!(h.control.calls(), vec!["stop", "wait"]);
        assert_eq!(h.sink.count(Severity::Error), 1);
        assert!(h.sink.records()[1].1.contains("did not stop within 30s"));
    }

    #[tokio::test]
    async fn test_stop_failure_with_restart_enabled_starts_anyway() {
        let control = FakeControl {
            fail_stop: true,
            ..Default::default()
        };
        let h = harness(
            hourly(20_000).with_restart_after_stop_failure(true),
            FakeResolver::using(25_165_824),
            control,
        );
        assert_eq!(h.watcher.check_once().await, CycleOutcome::StopFailed);
        assert_eq!(h.control.calls(), vec!["stop", "start"]);
        assert_eq!(h.sink.count(Severity::Error), 1);
        assert_eq!(h.sink.count(Severity::Information), 1);
    }

    #[tokio::test]
    async fn test_start_failure_leaves_service_stopped() {
        let control = FakeControl {
            fail_start: true,
            ..Default::default()
        };
        let h = harness(hourly(20_000), FakeResolver::using(25_165_824), control);
        assert_eq!(h.watcher.check_once().await, CycleOutcome::StartFailed);
        assert_eq!(h.control.calls(), vec!["stop", "wait", "start"]);
        assert_eq!(h.sink.count(Severity::Error), 1);
        assert_eq!(h.sink.count(Severity::Information), 0);
        assert!(h.sink.records()[1].1.starts_with("error starting service"));
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_later_cycles() {
        let h = harness(
            hourly(20_000),
            FakeResolver::with_readings(&[None, Some(25_165_824), Some(1024)]),
            FakeControl::default(),
        );
        assert_eq!(h.watcher.check_once().await, CycleOutcome::ProcessNotFound);
        assert!(matches!(h.watcher.check_once().await, CycleOutcome::Restarted { .. }));
        assert!(matches!(h.watcher.check_once().await, CycleOutcome::BelowLimit { .. }));
    }

    #[tokio::test]
    async fn test_start_checks_immediately() {
        let mut h = harness(hourly(20_000), FakeResolver::using(1024), FakeControl::default());
        assert_eq!(h.watcher.state(), WatcherState::Stopped);

        h.watcher.start().await;
        assert_eq!(h.watcher.state(), WatcherState::Running);
        assert_eq!(h.resolver.cycles(), 1);

        h.watcher.stop().await;
        assert_eq!(h.watcher.state(), WatcherState::Stopped);
        assert_eq!(h.resolver.cycles(), 1);
    }

    #[tokio::test]
    async fn test_start_twice_is_noop() {
        let mut h = harness(hourly(20_000), FakeResolver::using(1024), FakeControl::default());
        h.watcher.start().await;
        h.watcher.start().await;
        assert_eq!(h.resolver.cycles(), 1);
        h.watcher.stop().await;
        h.watcher.stop().await;
        assert_eq!(h.watcher.state(), WatcherState::Stopped);
    }

    #[tokio::test]
    async fn test_timer_keeps_checking_until_stopped() {
        let mut h = harness(
            config(20_000, Duration::from_millis(25)),
            FakeResolver::using(1024),
            FakeControl::default(),
        );
        h.watcher.start().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        h.watcher.stop().await;

        let cycles = h.resolver.cycles();
        assert!(cycles >= 3, "expected several cycles, got {cycles}");
        assert!(h.control.calls().is_empty());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.resolver.cycles(), cycles);
    }

    #[tokio::test]
    async fn test_no_cycle_begins_after_stop_returns() {
        let mut late = 0;
        for _ in 0..50 {
            let mut h = harness(
                config(20_000, Duration::from_millis(5)),
                FakeResolver::using(1024),
                FakeControl::default(),
            );
            h.watcher.start().await;
            // Stop right as the first timer tick falls due.
            tokio::time::sleep(Duration::from_millis(5)).await;
            h.watcher.stop().await;

            let cycles = h.resolver.cycles();
            tokio::time::sleep(Duration::from_millis(20)).await;
            if h.resolver.cycles() != cycles {
                late += 1;
            }
        }
        assert_eq!(late, 0, "cycles began after stop() returned");
    }

    #[tokio::test]
    async fn test_stop_lets_running_cycle_finish() {
        let control = FakeControl {
            stop_delay: Duration::from_millis(300),
            ..Default::default()
        };
        // First reading (initial check) is fine, everything after is too high.
        let mut h = harness(
            config(20_000, Duration::from_millis(30)),
            FakeResolver::with_readings(&[Some(1024), Some(25_165_824)]),
            control,
        );
        h.watcher.start().await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        h.watcher.stop().await;

        assert_eq!(h.control.count("stop"), 1);
        assert_eq!(h.control.count("start"), 0);
        let cycles = h.resolver.cycles();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.control.calls(), vec!["stop", "wait", "start"]);
        assert_eq!(h.resolver.cycles(), cycles);
        assert_eq!(h.sink.count(Severity::Information), 2);
    }

    #[tokio::test]
    async fn test_skip_policy_never_overlaps() {
        let control = FakeControl {
            stop_delay: Duration::from_millis(300),
            ..Default::default()
        };
        let mut h = harness(
            config(20_000, Duration::from_millis(30)),
            FakeResolver::using(25_165_824),
            control,
        );
        h.watcher.start().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        h.watcher.stop().await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(h.control.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(h.control.count("stop"), 2);
        assert_eq!(h.control.count("start"), 2);
    }

    #[tokio::test]
    async fn test_allow_policy_overlaps_slow_cycles() {
        let control = FakeControl {
            stop_delay: Duration::from_millis(300),
            ..Default::default()
        };
        let mut h = harness(
            config(20_000, Duration::from_millis(30)).with_overlap(OverlapPolicy::Allow),
            FakeResolver::using(25_165_824),
            control,
        );
        h.watcher.start().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        h.watcher.stop().await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(h.control.max_in_flight.load(Ordering::SeqCst) >= 2);
        assert!(h.control.count("stop") >= 3);
        assert_eq!(h.control.count("stop"), h.control.count("start"));
    }

    #[tokio::test]
    async fn test_check_once_skips_while_busy() {
        let control = FakeControl {
            stop_delay: Duration::from_millis(200),
            ..Default::default()
        };
        let h = harness(hourly(20_000), FakeResolver::using(25_165_824), control);
        let (first, second) = tokio::join!(h.watcher.check_once(), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            h.watcher.check_once().await
        });
        assert!(matches!(first, CycleOutcome::Restarted { .. }));
        assert_eq!(second, CycleOutcome::Skipped);
        assert_eq!(h.control.count("stop"), 1);
    }
}
