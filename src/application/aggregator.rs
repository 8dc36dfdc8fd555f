// Aggregation cache and poller - owns per-machine snapshots
use crate::application::subscription::{BusEvent, SubscriptionBus, SubscriptionId};
use crate::application::transport::MachineTransport;
use crate::domain::machine::Machine;
use crate::domain::oee::{compute_oee, OeeMetrics};
use crate::domain::sample::{normalize_samples, MachineState};
use crate::domain::segment::{build_timeline, status_durations, Timeline};
use crate::domain::snapshot::MachineSnapshot;
use crate::domain::stats::{channel_stats, ChannelStats};
use crate::domain::window::{RangeToken, TimeWindow};
use crate::error::{AggregatorError, TransportError};
use crate::infrastructure::config::AggregatorSettings;
use chrono::{DateTime, NaiveDate, Utc};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};

/// Injected time source, pinned in tests.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Per-machine fetch lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchState {
    Uninitialized,
    Fetching,
    Ready,
    Stale,
}

struct MachineEntry {
    machine: Machine,
    state: FetchState,
    // In-flight flag, tracked apart from the lifecycle state so a retry
    // for a stale machine does not hide its staleness from readers, and
    // so at most one fetch per machine is ever outstanding.
    fetching: bool,
    snapshot: Option<Arc<MachineSnapshot>>,
    consecutive_failures: u32,
}

/// What a reader gets back from the cache. `Stale` still carries the
/// last good snapshot; `NotYetAvailable` is explicit, never a default
/// silently passed off as real data.
#[derive(Debug, Clone)]
pub enum SnapshotRead {
    NotYetAvailable,
    Ready(Arc<MachineSnapshot>),
    Stale(Arc<MachineSnapshot>),
}

struct PollerHandle {
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

/// Aggregator settings consumed at construction. Range tokens are
/// validated up front so a bad config fails fast, not on the first tick.
#[derive(Clone)]
struct Policy {
    poll_interval: Duration,
    stale_after_failures: u32,
    current_range: RangeToken,
    previous_range: RangeToken,
    speed_channel: String,
    nominal_speed: f64,
    nominal_speeds: HashMap<String, f64>,
}

impl Policy {
    fn nominal_speed_for(&self, machine_id: &str) -> f64 {
        self.nominal_speeds
            .get(machine_id)
            .copied()
            .unwrap_or(self.nominal_speed)
    }
}

/// The telemetry aggregator: an in-memory snapshot cache per machine,
/// refreshed by one polling task, fanned out through a subscription bus.
///
/// Snapshots are replaced by whole-`Arc` swap under a briefly-held lock,
/// so readers are synchronous and never observe a half-written snapshot
/// or block on an in-flight fetch. Everything outside the transport
/// calls is pure computation.
#[derive(Clone)]
pub struct Aggregator {
    transport: Arc<dyn MachineTransport>,
    policy: Policy,
    clock: Clock,
    entries: Arc<RwLock<HashMap<String, MachineEntry>>>,
    bus: Arc<SubscriptionBus>,
    active: Arc<AtomicBool>,
    poller: Arc<Mutex<Option<PollerHandle>>>,
}

impl Aggregator {
    pub fn new(
        transport: Arc<dyn MachineTransport>,
        settings: &AggregatorSettings,
    ) -> Result<Self, AggregatorError> {
        let policy = Policy {
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            stale_after_failures: settings.stale_after_failures.max(1),
            current_range: RangeToken::parse(&settings.current_range)?,
            previous_range: RangeToken::parse(&settings.previous_range)?,
            speed_channel: settings.speed_channel.clone(),
            nominal_speed: settings.nominal_speed,
            nominal_speeds: settings.nominal_speeds.clone(),
        };
        Ok(Self {
            transport,
            policy,
            clock: Arc::new(Utc::now),
            entries: Arc::new(RwLock::new(HashMap::new())),
            bus: Arc::new(SubscriptionBus::new()),
            active: Arc::new(AtomicBool::new(true)),
            poller: Arc::new(Mutex::new(None)),
        })
    }

    /// Replace the time source. Tests pin "now" with this.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    // ---- read side: cache only, no I/O ----

    /// Cached machine list, ordered by id.
    pub fn get_machines(&self) -> Vec<Machine> {
        let entries = self.entries.read().expect("cache lock poisoned");
        let mut machines: Vec<Machine> =
            entries.values().map(|e| e.machine.clone()).collect();
        machines.sort_by(|a, b| a.machine_id.cmp(&b.machine_id));
        machines
    }

    pub fn get_snapshot(&self, machine_id: &str) -> SnapshotRead {
        let entries = self.entries.read().expect("cache lock poisoned");
        match entries.get(machine_id) {
            Some(entry) => match (&entry.snapshot, entry.state) {
                (Some(snapshot), FetchState::Stale) => SnapshotRead::Stale(snapshot.clone()),
                (Some(snapshot), _) => SnapshotRead::Ready(snapshot.clone()),
                (None, _) => SnapshotRead::NotYetAvailable,
            },
            None => SnapshotRead::NotYetAvailable,
        }
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.bus.unsubscribe(id)
    }

    // ---- poller ----

    /// Spawn the polling task: an immediate first refresh, then one
    /// refresh per interval. A tick firing while a refresh pass is still
    /// outstanding is skipped, not queued. Calling `start` again waits
    /// for the running poller to wind down, then replaces it, so two
    /// pollers never overlap.
    pub async fn start(&self) {
        let previous = self.poller.lock().expect("poller lock poisoned").take();
        if let Some(previous) = previous {
            let _ = previous.shutdown.send(true);
            let _ = previous.task.await;
        }
        self.active.store(true, Ordering::SeqCst);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let aggregator = self.clone();
        let interval_duration = self.policy.poll_interval;
        let task = tokio::spawn(async move {
            tracing::info!(interval = ?interval_duration, "poller started");
            let mut interval = time::interval(interval_duration);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = interval.tick() => aggregator.refresh_all().await,
                }
            }
            tracing::info!("poller stopped");
        });
        *self.poller.lock().expect("poller lock poisoned") = Some(PollerHandle {
            shutdown: shutdown_tx,
            task,
        });
    }

    /// Stop polling. An in-flight refresh is allowed to finish, but it
    /// no longer commits into the cache or publishes events.
    pub async fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        let handle = self
            .poller
            .lock()
            .expect("poller lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.shutdown.send(true);
            let _ = handle.task.await;
        }
    }

    /// One refresh pass: re-list machines, then refresh every known
    /// machine concurrently. Failures are isolated per machine.
    pub async fn refresh_all(&self) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        let now = (self.clock)();

        match self.transport.list_machines().await {
            Ok(machines) => self.sync_machine_list(machines),
            Err(e) => {
                tracing::warn!(error = %e, "machine list refresh failed, keeping known machines")
            }
        }

        let ids: Vec<String> = {
            let entries = self.entries.read().expect("cache lock poisoned");
            entries.keys().cloned().collect()
        };

        let results = join_all(ids.iter().map(|id| self.refresh_machine(id, now))).await;

        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        self.bus.publish(&BusEvent::Update { timestamp: now });
        for (id, result) in ids.iter().zip(results) {
            if let Err(cause) = result {
                self.bus.publish(&BusEvent::Error {
                    machine_id: id.clone(),
                    cause,
                });
            }
        }
    }

    fn sync_machine_list(&self, machines: Vec<Machine>) {
        let mut entries = self.entries.write().expect("cache lock poisoned");
        let listed: HashSet<String> = machines.iter().map(|m| m.machine_id.clone()).collect();

        entries.retain(|id, _| {
            let keep = listed.contains(id);
            if !keep {
                tracing::info!(machine_id = %id, "machine disappeared upstream, discarding snapshot");
            }
            keep
        });

        for machine in machines {
            match entries.get_mut(&machine.machine_id) {
                Some(entry) => entry.machine = machine,
                None => {
                    tracing::info!(machine_id = %machine.machine_id, "discovered machine");
                    entries.insert(
                        machine.machine_id.clone(),
                        MachineEntry {
                            machine,
                            state: FetchState::Uninitialized,
                            fetching: false,
                            snapshot: None,
                            consecutive_failures: 0,
                        },
                    );
                }
            }
        }
    }

    /// Refresh one machine. `Err` carries a cause only once the failure
    /// threshold is reached; transient failures below it are swallowed
    /// and the last good snapshot keeps serving. While the fetch is
    /// outstanding only the in-flight flag changes, so readers keep
    /// seeing the entry's settled state (a stale entry stays reported
    /// stale through its retries). A machine whose previous fetch is
    /// still in flight is skipped.
    async fn refresh_machine(&self, machine_id: &str, now: DateTime<Utc>) -> Result<(), String> {
        {
            let mut entries = self.entries.write().expect("cache lock poisoned");
            match entries.get_mut(machine_id) {
                Some(entry) => {
                    if entry.fetching {
                        return Ok(());
                    }
                    entry.fetching = true;
                    if entry.state == FetchState::Uninitialized {
                        entry.state = FetchState::Fetching;
                    }
                }
                None => return Ok(()),
            }
        }

        match self.build_snapshot(machine_id, now).await {
            Ok(snapshot) => {
                // Torn down while this fetch was in flight; drop the result.
                if !self.active.load(Ordering::SeqCst) {
                    self.settle_fetch(machine_id);
                    return Ok(());
                }
                let mut entries = self.entries.write().expect("cache lock poisoned");
                if let Some(entry) = entries.get_mut(machine_id) {
                    entry.snapshot = Some(Arc::new(snapshot));
                    entry.state = FetchState::Ready;
                    entry.fetching = false;
                    entry.consecutive_failures = 0;
                }
                Ok(())
            }
            Err(error) => {
                if !self.active.load(Ordering::SeqCst) {
                    self.settle_fetch(machine_id);
                    return Ok(());
                }
                let mut entries = self.entries.write().expect("cache lock poisoned");
                let Some(entry) = entries.get_mut(machine_id) else {
                    return Ok(());
                };
                entry.fetching = false;
                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= self.policy.stale_after_failures {
                    entry.state = FetchState::Stale;
                    tracing::error!(
                        machine_id = %machine_id,
                        failures = entry.consecutive_failures,
                        error = %error,
                        "sustained refresh failure, snapshot marked stale"
                    );
                    Err(error.to_string())
                } else {
                    entry.state = if entry.snapshot.is_some() {
                        FetchState::Ready
                    } else {
                        FetchState::Uninitialized
                    };
                    tracing::warn!(
                        machine_id = %machine_id,
                        failures = entry.consecutive_failures,
                        error = %error,
                        "refresh failed, will retry on next tick"
                    );
                    Ok(())
                }
            }
        }
    }

    fn settle_fetch(&self, machine_id: &str) {
        let mut entries = self.entries.write().expect("cache lock poisoned");
        if let Some(entry) = entries.get_mut(machine_id) {
            entry.fetching = false;
        }
    }

    async fn build_snapshot(
        &self,
        machine_id: &str,
        now: DateTime<Utc>,
    ) -> Result<MachineSnapshot, TransportError> {
        let current = TimeWindow::ending_at(self.policy.current_range, now);
        // The previous window ends where the current one begins, so the
        // two OEE figures never overlap.
        let previous = TimeWindow::ending_at(self.policy.previous_range, current.start);
        let nominal_speed = self.policy.nominal_speed_for(machine_id);

        let samples = normalize_samples(
            self.transport.fetch_samples(machine_id, &current).await?,
        );

        let current_oee = match self.transport.fetch_oee(machine_id, &current).await? {
            Some(metrics) => metrics,
            None => compute_oee(&samples, &self.policy.speed_channel, nominal_speed),
        };

        let previous_oee = match self.transport.fetch_oee(machine_id, &previous).await? {
            Some(metrics) => metrics,
            None => {
                let previous_samples = normalize_samples(
                    self.transport.fetch_samples(machine_id, &previous).await?,
                );
                compute_oee(&previous_samples, &self.policy.speed_channel, nominal_speed)
            }
        };

        let timeline = match self.transport.fetch_timeline(machine_id, &current).await? {
            Some(timeline) => timeline,
            None => build_timeline(&samples, &current),
        };

        let durations = match self
            .transport
            .fetch_status_summary(machine_id, &current)
            .await?
        {
            Some(summary) => summary,
            None => status_durations(&timeline),
        };

        Ok(MachineSnapshot {
            machine_id: machine_id.to_string(),
            latest_sample: samples.last().cloned(),
            current_oee,
            previous_oee,
            timeline,
            status_durations: durations,
            fetched_at: now,
        })
    }

    // ---- on-demand window queries ----

    /// Reject queries for machine ids the upstream has never listed.
    /// The cached list answers first; on a miss the upstream list is
    /// consulted directly (read-only), covering queries made before the
    /// first refresh pass.
    async fn ensure_known(&self, machine_id: &str) -> Result<(), AggregatorError> {
        {
            let entries = self.entries.read().expect("cache lock poisoned");
            if entries.contains_key(machine_id) {
                return Ok(());
            }
        }
        let machines = self.transport.list_machines().await?;
        if machines.iter().any(|m| m.machine_id == machine_id) {
            Ok(())
        } else {
            Err(AggregatorError::UnknownMachine(machine_id.to_string()))
        }
    }

    /// OEE over an arbitrary range token, bypassing the cache.
    pub async fn oee_for(
        &self,
        machine_id: &str,
        range: &str,
    ) -> Result<OeeMetrics, AggregatorError> {
        let window = TimeWindow::ending_at(RangeToken::parse(range)?, (self.clock)());
        self.oee_for_window(machine_id, &window).await
    }

    /// OEE over an explicit calendar range (inclusive dates).
    pub async fn oee_for_dates(
        &self,
        machine_id: &str,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<OeeMetrics, AggregatorError> {
        let window = TimeWindow::from_dates(start_date, end_date);
        self.oee_for_window(machine_id, &window).await
    }

    async fn oee_for_window(
        &self,
        machine_id: &str,
        window: &TimeWindow,
    ) -> Result<OeeMetrics, AggregatorError> {
        self.ensure_known(machine_id).await?;
        if let Some(metrics) = self.transport.fetch_oee(machine_id, window).await? {
            return Ok(metrics);
        }
        let samples =
            normalize_samples(self.transport.fetch_samples(machine_id, window).await?);
        Ok(compute_oee(
            &samples,
            &self.policy.speed_channel,
            self.policy.nominal_speed_for(machine_id),
        ))
    }

    /// Status timeline over an arbitrary range token.
    pub async fn timeline_for(
        &self,
        machine_id: &str,
        range: &str,
    ) -> Result<Timeline, AggregatorError> {
        let window = TimeWindow::ending_at(RangeToken::parse(range)?, (self.clock)());
        self.ensure_known(machine_id).await?;
        if let Some(timeline) = self.transport.fetch_timeline(machine_id, &window).await? {
            return Ok(timeline);
        }
        let samples =
            normalize_samples(self.transport.fetch_samples(machine_id, &window).await?);
        Ok(build_timeline(&samples, &window))
    }

    /// Per-status duration totals over an arbitrary range token.
    pub async fn status_summary_for(
        &self,
        machine_id: &str,
        range: &str,
    ) -> Result<HashMap<MachineState, f64>, AggregatorError> {
        let window = TimeWindow::ending_at(RangeToken::parse(range)?, (self.clock)());
        self.ensure_known(machine_id).await?;
        if let Some(summary) = self
            .transport
            .fetch_status_summary(machine_id, &window)
            .await?
        {
            return Ok(summary);
        }
        let samples =
            normalize_samples(self.transport.fetch_samples(machine_id, &window).await?);
        Ok(status_durations(&build_timeline(&samples, &window)))
    }

    /// Rolling min/max/avg/count of one numeric channel over a range
    /// token, for trend charts. `None` when no sample in the window
    /// carries the channel.
    pub async fn stats_for(
        &self,
        machine_id: &str,
        channel: &str,
        range: &str,
    ) -> Result<Option<ChannelStats>, AggregatorError> {
        let window = TimeWindow::ending_at(RangeToken::parse(range)?, (self.clock)());
        self.ensure_known(machine_id).await?;
        let samples =
            normalize_samples(self.transport.fetch_samples(machine_id, &window).await?);
        Ok(channel_stats(&samples, channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::sample::Sample;
    use crate::infrastructure::config::AggregatorSettings;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Mutex as StdMutex;

    struct MockTransport {
        machines: StdMutex<Vec<Machine>>,
        samples: StdMutex<HashMap<String, Vec<Sample>>>,
        failing: AtomicBool,
        preaggregated_oee: StdMutex<Option<OeeMetrics>>,
        // When set, fetch_samples blocks on a permit per call.
        gate: StdMutex<Option<Arc<tokio::sync::Semaphore>>>,
        sample_fetches: AtomicUsize,
    }

    impl MockTransport {
        fn new() -> Self {
            Self {
                machines: StdMutex::new(Vec::new()),
                samples: StdMutex::new(HashMap::new()),
                failing: AtomicBool::new(false),
                preaggregated_oee: StdMutex::new(None),
                gate: StdMutex::new(None),
                sample_fetches: AtomicUsize::new(0),
            }
        }

        fn set_gate(&self, gate: Arc<tokio::sync::Semaphore>) {
            *self.gate.lock().unwrap() = Some(gate);
        }

        fn set_machines(&self, machines: Vec<Machine>) {
            *self.machines.lock().unwrap() = machines;
        }

        fn set_samples(&self, machine_id: &str, samples: Vec<Sample>) {
            self.samples
                .lock()
                .unwrap()
                .insert(machine_id.to_string(), samples);
        }

        fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        fn check_failure(&self) -> Result<(), TransportError> {
            if self.failing.load(Ordering::SeqCst) {
                Err(TransportError::UpstreamStatus {
                    status: 502,
                    body: "bad gateway".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl MachineTransport for MockTransport {
        async fn list_machines(&self) -> Result<Vec<Machine>, TransportError> {
            self.check_failure()?;
            Ok(self.machines.lock().unwrap().clone())
        }

        async fn fetch_samples(
            &self,
            machine_id: &str,
            window: &TimeWindow,
        ) -> Result<Vec<Sample>, TransportError> {
            self.sample_fetches.fetch_add(1, Ordering::SeqCst);
            let gate = self.gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.acquire().await.unwrap().forget();
            }
            self.check_failure()?;
            let samples = self.samples.lock().unwrap();
            Ok(samples
                .get(machine_id)
                .map(|s| {
                    s.iter()
                        .filter(|sample| window.contains(sample.timestamp))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        }

        async fn fetch_oee(
            &self,
            _machine_id: &str,
            _window: &TimeWindow,
        ) -> Result<Option<OeeMetrics>, TransportError> {
            self.check_failure()?;
            Ok(*self.preaggregated_oee.lock().unwrap())
        }
    }

    fn pinned_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap()
    }

    fn running_sample(offset_secs: i64) -> Sample {
        let mut sample = Sample::new(
            "laser_01".to_string(),
            pinned_now() - chrono::Duration::hours(1)
                + chrono::Duration::seconds(offset_secs),
            MachineState::Running,
        );
        sample.channels.insert("cutting_speed".to_string(), 80.0);
        sample
    }

    fn aggregator_with(transport: Arc<MockTransport>) -> Aggregator {
        Aggregator::new(transport, &AggregatorSettings::default())
            .unwrap()
            .with_clock(Arc::new(pinned_now))
    }

    fn seeded_transport() -> Arc<MockTransport> {
        let transport = Arc::new(MockTransport::new());
        transport.set_machines(vec![Machine::new(
            "laser_01".to_string(),
            MachineState::Running,
        )]);
        transport.set_samples("laser_01", vec![running_sample(0), running_sample(600)]);
        transport
    }

    #[tokio::test]
    async fn test_snapshot_not_yet_available_before_first_fetch() {
        let aggregator = aggregator_with(seeded_transport());
        assert!(matches!(
            aggregator.get_snapshot("laser_01"),
            SnapshotRead::NotYetAvailable
        ));
    }

    #[tokio::test]
    async fn test_refresh_populates_snapshot_and_machine_list() {
        let aggregator = aggregator_with(seeded_transport());
        aggregator.refresh_all().await;

        let machines = aggregator.get_machines();
        assert_eq!(machines.len(), 1);
        assert_eq!(machines[0].machine_id, "laser_01");

        let SnapshotRead::Ready(snapshot) = aggregator.get_snapshot("laser_01") else {
            panic!("expected ready snapshot");
        };
        assert_eq!(snapshot.machine_id, "laser_01");
        assert_eq!(snapshot.current_oee.availability, 100.0);
        assert!(snapshot.latest_sample.is_some());
        assert_eq!(snapshot.fetched_at, pinned_now());
    }

    #[tokio::test]
    async fn test_unchanged_upstream_yields_identical_snapshots() {
        let aggregator = aggregator_with(seeded_transport());
        aggregator.refresh_all().await;
        let SnapshotRead::Ready(first) = aggregator.get_snapshot("laser_01") else {
            panic!("expected ready snapshot");
        };
        aggregator.refresh_all().await;
        let SnapshotRead::Ready(second) = aggregator.get_snapshot("laser_01") else {
            panic!("expected ready snapshot");
        };
        // Clock is pinned, so even fetched_at matches.
        assert_eq!(*first, *second);
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_last_good_snapshot() {
        let transport = seeded_transport();
        let aggregator = aggregator_with(transport.clone());
        let errors = Arc::new(StdMutex::new(Vec::new()));
        let sink = errors.clone();
        aggregator.subscribe(move |event| {
            if let BusEvent::Error { machine_id, .. } = event {
                sink.lock().unwrap().push(machine_id.clone());
            }
        });

        aggregator.refresh_all().await;
        let SnapshotRead::Ready(before) = aggregator.get_snapshot("laser_01") else {
            panic!("expected ready snapshot");
        };

        transport.set_failing(true);
        aggregator.refresh_all().await;

        let SnapshotRead::Ready(after) = aggregator.get_snapshot("laser_01") else {
            panic!("expected last good snapshot still served");
        };
        assert_eq!(*before, *after);
        assert!(errors.lock().unwrap().is_empty(), "below threshold, no error event");

        transport.set_failing(false);
        transport.set_samples("laser_01", vec![running_sample(0)]);
        aggregator.refresh_all().await;
        let SnapshotRead::Ready(recovered) = aggregator.get_snapshot("laser_01") else {
            panic!("expected ready snapshot");
        };
        assert_ne!(*before, *recovered);
    }

    #[tokio::test]
    async fn test_sustained_failure_marks_stale_and_publishes_error() {
        let transport = seeded_transport();
        let aggregator = aggregator_with(transport.clone());
        let errors = Arc::new(StdMutex::new(Vec::new()));
        let sink = errors.clone();
        aggregator.subscribe(move |event| {
            if let BusEvent::Error { cause, .. } = event {
                sink.lock().unwrap().push(cause.clone());
            }
        });

        aggregator.refresh_all().await;
        transport.set_failing(true);
        for _ in 0..3 {
            aggregator.refresh_all().await;
        }

        assert!(matches!(
            aggregator.get_snapshot("laser_01"),
            SnapshotRead::Stale(_)
        ));
        let errors = errors.lock().unwrap();
        assert!(!errors.is_empty());
        assert!(errors[0].contains("502"));
    }

    #[tokio::test]
    async fn test_recovery_after_stale_resets_failure_count() {
        let transport = seeded_transport();
        let aggregator = aggregator_with(transport.clone());

        aggregator.refresh_all().await;
        transport.set_failing(true);
        for _ in 0..3 {
            aggregator.refresh_all().await;
        }
        transport.set_failing(false);
        aggregator.refresh_all().await;

        assert!(matches!(
            aggregator.get_snapshot("laser_01"),
            SnapshotRead::Ready(_)
        ));
    }

    #[tokio::test]
    async fn test_disappeared_machine_is_discarded() {
        let transport = seeded_transport();
        let aggregator = aggregator_with(transport.clone());
        aggregator.refresh_all().await;
        assert!(matches!(
            aggregator.get_snapshot("laser_01"),
            SnapshotRead::Ready(_)
        ));

        transport.set_machines(Vec::new());
        aggregator.refresh_all().await;
        assert!(aggregator.get_machines().is_empty());
        assert!(matches!(
            aggregator.get_snapshot("laser_01"),
            SnapshotRead::NotYetAvailable
        ));
    }

    #[tokio::test]
    async fn test_update_event_published_per_refresh_pass() {
        let aggregator = aggregator_with(seeded_transport());
        let updates = Arc::new(StdMutex::new(Vec::new()));
        let sink = updates.clone();
        aggregator.subscribe(move |event| {
            if let BusEvent::Update { timestamp } = event {
                sink.lock().unwrap().push(*timestamp);
            }
        });

        aggregator.refresh_all().await;
        aggregator.refresh_all().await;
        let updates = updates.lock().unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0], pinned_now());
    }

    #[tokio::test]
    async fn test_refresh_after_stop_commits_nothing() {
        let aggregator = aggregator_with(seeded_transport());
        aggregator.stop().await;
        aggregator.refresh_all().await;
        assert!(matches!(
            aggregator.get_snapshot("laser_01"),
            SnapshotRead::NotYetAvailable
        ));
    }

    #[tokio::test]
    async fn test_preaggregated_oee_is_served_verbatim() {
        let transport = seeded_transport();
        let upstream = OeeMetrics::from_components(91.0, 84.5, 99.0);
        *transport.preaggregated_oee.lock().unwrap() = Some(upstream);

        let aggregator = aggregator_with(transport);
        aggregator.refresh_all().await;
        let SnapshotRead::Ready(snapshot) = aggregator.get_snapshot("laser_01") else {
            panic!("expected ready snapshot");
        };
        assert_eq!(snapshot.current_oee, upstream);
    }

    #[tokio::test]
    async fn test_on_demand_oee_rejects_unknown_token() {
        let aggregator = aggregator_with(seeded_transport());
        let err = aggregator.oee_for("laser_01", "48h").await.unwrap_err();
        assert!(matches!(err, AggregatorError::InvalidRange(_)));
    }

    #[tokio::test]
    async fn test_on_demand_oee_computes_from_samples() {
        let aggregator = aggregator_with(seeded_transport());
        let metrics = aggregator.oee_for("laser_01", "24h").await.unwrap();
        assert_eq!(metrics.availability, 100.0);
        assert_eq!(metrics.performance, 80.0);
    }

    #[tokio::test]
    async fn test_status_summary_matches_timeline_totals() {
        let aggregator = aggregator_with(seeded_transport());
        let timeline = aggregator.timeline_for("laser_01", "24h").await.unwrap();
        let summary = aggregator
            .status_summary_for("laser_01", "24h")
            .await
            .unwrap();
        let total: f64 = summary.values().sum();
        assert!((total - timeline.covered_secs()).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_poller_start_and_stop() {
        let transport = seeded_transport();
        let aggregator = Aggregator::new(
            transport,
            &AggregatorSettings {
                poll_interval_ms: 10,
                ..AggregatorSettings::default()
            },
        )
        .unwrap()
        .with_clock(Arc::new(pinned_now));

        aggregator.start().await;
        // First interval tick fires immediately.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            aggregator.get_snapshot("laser_01"),
            SnapshotRead::Ready(_)
        ));
        aggregator.stop().await;
    }

    #[tokio::test]
    async fn test_restart_waits_out_previous_poller() {
        let transport = seeded_transport();
        let aggregator = Aggregator::new(
            transport,
            &AggregatorSettings {
                poll_interval_ms: 10,
                ..AggregatorSettings::default()
            },
        )
        .unwrap()
        .with_clock(Arc::new(pinned_now));

        aggregator.start().await;
        aggregator.start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            aggregator.get_snapshot("laser_01"),
            SnapshotRead::Ready(_)
        ));
        aggregator.stop().await;
    }

    #[tokio::test]
    async fn test_stale_machine_stays_stale_while_retry_in_flight() {
        let transport = seeded_transport();
        let aggregator = aggregator_with(transport.clone());

        aggregator.refresh_all().await;
        transport.set_failing(true);
        for _ in 0..3 {
            aggregator.refresh_all().await;
        }
        assert!(matches!(
            aggregator.get_snapshot("laser_01"),
            SnapshotRead::Stale(_)
        ));

        // Block the next retry inside its sample fetch.
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        transport.set_gate(gate.clone());
        let retry = tokio::spawn({
            let aggregator = aggregator.clone();
            async move { aggregator.refresh_all().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(
            matches!(
                aggregator.get_snapshot("laser_01"),
                SnapshotRead::Stale(_)
            ),
            "an outstanding retry must not mask staleness"
        );

        gate.add_permits(100);
        retry.await.unwrap();
        assert!(matches!(
            aggregator.get_snapshot("laser_01"),
            SnapshotRead::Stale(_)
        ));
    }

    #[tokio::test]
    async fn test_at_most_one_fetch_in_flight_per_machine() {
        let transport = seeded_transport();
        let aggregator = aggregator_with(transport.clone());
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        transport.set_gate(gate.clone());

        let first = tokio::spawn({
            let aggregator = aggregator.clone();
            async move { aggregator.refresh_all().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.sample_fetches.load(Ordering::SeqCst), 1);

        // A second pass while the first is blocked skips the machine.
        aggregator.refresh_all().await;
        assert_eq!(transport.sample_fetches.load(Ordering::SeqCst), 1);

        gate.add_permits(100);
        first.await.unwrap();
        assert!(matches!(
            aggregator.get_snapshot("laser_01"),
            SnapshotRead::Ready(_)
        ));
    }

    #[tokio::test]
    async fn test_on_demand_queries_reject_unknown_machine() {
        let aggregator = aggregator_with(seeded_transport());
        assert!(matches!(
            aggregator.oee_for("ghost", "24h").await.unwrap_err(),
            AggregatorError::UnknownMachine(_)
        ));
        assert!(matches!(
            aggregator.timeline_for("ghost", "24h").await.unwrap_err(),
            AggregatorError::UnknownMachine(_)
        ));
        assert!(matches!(
            aggregator
                .stats_for("ghost", "cutting_speed", "24h")
                .await
                .unwrap_err(),
            AggregatorError::UnknownMachine(_)
        ));
    }

    #[tokio::test]
    async fn test_stats_for_aggregates_channel_values() {
        let transport = seeded_transport();
        let mut slow = running_sample(0);
        slow.channels.insert("cutting_speed".to_string(), 60.0);
        let mut fast = running_sample(600);
        fast.channels.insert("cutting_speed".to_string(), 100.0);
        transport.set_samples("laser_01", vec![slow, fast]);

        let aggregator = aggregator_with(transport);
        let stats = aggregator
            .stats_for("laser_01", "cutting_speed", "24h")
            .await
            .unwrap()
            .expect("channel carried by both samples");
        assert_eq!(stats.min, 60.0);
        assert_eq!(stats.max, 100.0);
        assert_eq!(stats.avg, 80.0);
        assert_eq!(stats.count, 2);

        let absent = aggregator
            .stats_for("laser_01", "spindle_load", "24h")
            .await
            .unwrap();
        assert!(absent.is_none());
    }
}
