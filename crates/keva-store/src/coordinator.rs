//! Advisory cross-process migration lock.
//!
//! The coordinator implements a best-effort mutual-exclusion protocol over
//! a [`MigrationTopic`]: ping the topic, watch a short discovery window
//! for another holder to announce itself, then claim the lock and
//! announce. There is no consensus — two processes racing inside the same
//! discovery window can both claim, and a subscriber that joins after the
//! window misses the announcement entirely. The store's transactional
//! version guard is what keeps duplicate claims harmless; the lock only
//! reduces wasted work.

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use crate::bus::{LockMessage, MigrationTopic};

/// Tunables for the lock protocol.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How long to listen for a competing holder after pinging.
    pub discovery_window: Duration,
    /// Pause between acquisition attempts in [`LockCoordinator::wait_for_lock`].
    pub retry_backoff: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            discovery_window: Duration::from_millis(100),
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// Why a coordinated run failed.
#[derive(Debug)]
pub enum CoordinationError<E> {
    /// Another holder kept the lock for the whole wait.
    LockTimeout { waited: Duration },
    /// The coordinated work itself failed.
    Work(E),
}

impl<E: fmt::Display> fmt::Display for CoordinationError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LockTimeout { waited } => {
                write!(f, "migration lock not acquired within {waited:?}")
            }
            Self::Work(e) => write!(f, "coordinated work failed: {e}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for CoordinationError<E> {}

/// Advisory migration lock over a topic subscription.
///
/// Each coordinator carries a transient identity; nothing about the lock
/// is persisted, so a crashed holder simply stops re-announcing and its
/// lock evaporates with it.
pub struct LockCoordinator<T: MigrationTopic> {
    topic: T,
    identity: String,
    config: CoordinatorConfig,
    holding: bool,
    remote_holder: Option<String>,
}

impl<T: MigrationTopic> LockCoordinator<T> {
    pub fn new(topic: T) -> Self {
        Self::with_config(topic, CoordinatorConfig::default())
    }

    pub fn with_config(topic: T, config: CoordinatorConfig) -> Self {
        let identity = format!("{:x}-{:04x}", now_ms(), rand::random::<u32>() & 0xffff);
        Self {
            topic,
            identity,
            config,
            holding: false,
            remote_holder: None,
        }
    }

    /// This coordinator's transient identity.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Whether this coordinator currently holds the lock.
    pub fn is_holding(&self) -> bool {
        self.holding
    }

    /// Process every queued message, updating what we know about a remote
    /// holder. While holding, answers foreign pings by re-announcing.
    fn drain(&mut self) {
        while let Some(msg) = self.topic.try_recv() {
            if msg.sender() == self.identity {
                continue;
            }
            match msg {
                LockMessage::LockAcquired { from } => {
                    self.remote_holder = Some(from);
                }
                LockMessage::LockReleased { from } => {
                    if self.remote_holder.as_deref() == Some(from.as_str()) {
                        self.remote_holder = None;
                    }
                }
                LockMessage::Ping { .. } if self.holding => {
                    self.topic.publish(&LockMessage::LockAcquired {
                        from: self.identity.clone(),
                    });
                }
                _ => {}
            }
        }
    }

    /// One acquisition attempt: ping, watch the discovery window, claim if
    /// nobody else announced. Returns `false` without retrying if a
    /// foreign holder announces during this attempt.
    ///
    /// The foreign-holder observation is scoped to the attempt: a holder
    /// seen in an earlier window counts only if it announces again (queued
    /// or in response to the ping). A holder that vanished without
    /// releasing therefore blocks nothing past its last announcement.
    pub fn acquire_lock(&mut self) -> bool {
        if self.holding {
            return true;
        }

        self.remote_holder = None;
        self.drain();
        self.topic.publish(&LockMessage::Ping {
            from: self.identity.clone(),
        });

        let deadline = Instant::now() + self.config.discovery_window;
        loop {
            self.drain();
            if self.remote_holder.is_some() {
                return false;
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(Duration::from_millis(5).min(self.config.discovery_window));
        }

        self.holding = true;
        self.topic.publish(&LockMessage::LockAcquired {
            from: self.identity.clone(),
        });
        true
    }

    /// Retry acquisition with backoff until it succeeds or `timeout`
    /// elapses.
    pub fn wait_for_lock(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.acquire_lock() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(self.config.retry_backoff.min(
                deadline.saturating_duration_since(Instant::now()),
            ));
        }
    }

    /// Release the lock and announce the release. No-op if not holding.
    pub fn release_lock(&mut self) {
        if !self.holding {
            return;
        }
        self.holding = false;
        self.topic.publish(&LockMessage::LockReleased {
            from: self.identity.clone(),
        });
    }

    pub fn notify_migration_started(&self) {
        self.topic.publish(&LockMessage::MigrationStarted {
            from: self.identity.clone(),
        });
    }

    pub fn notify_migration_completed(&self) {
        self.topic.publish(&LockMessage::MigrationCompleted {
            from: self.identity.clone(),
        });
    }

    pub fn notify_migration_failed(&self, message: &str) {
        self.topic.publish(&LockMessage::MigrationFailed {
            from: self.identity.clone(),
            message: message.to_string(),
        });
    }

    /// Run `work` under the lock, broadcasting the lifecycle around it:
    /// started before, completed or failed after, released always. If the
    /// lock is not acquired within `timeout`, `work` never runs.
    pub fn run_with_coordination<R, E: fmt::Display>(
        mut self,
        timeout: Duration,
        work: impl FnOnce() -> Result<R, E>,
    ) -> Result<R, CoordinationError<E>> {
        if !self.wait_for_lock(timeout) {
            return Err(CoordinationError::LockTimeout { waited: timeout });
        }

        self.notify_migration_started();
        let outcome = work();
        match &outcome {
            Ok(_) => self.notify_migration_completed(),
            Err(e) => self.notify_migration_failed(&e.to_string()),
        }
        self.release_lock();

        outcome.map_err(CoordinationError::Work)
    }
}

pub(crate) fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use std::sync::Arc;

    fn fast() -> CoordinatorConfig {
        CoordinatorConfig {
            discovery_window: Duration::from_millis(5),
            retry_backoff: Duration::from_millis(2),
        }
    }

    #[test]
    fn uncontested_acquire_succeeds() {
        let bus = LocalBus::new();
        let mut a = LockCoordinator::with_config(bus.subscribe("app"), fast());
        assert!(a.acquire_lock());
        assert!(a.is_holding());
    }

    #[test]
    fn second_coordinator_sees_the_holder_and_fails() {
        let bus = LocalBus::new();
        let mut a = LockCoordinator::with_config(bus.subscribe("app"), fast());
        let mut b = LockCoordinator::with_config(bus.subscribe("app"), fast());

        assert!(a.acquire_lock());
        // B's queue holds A's announcement; the discovery drain finds it.
        assert!(!b.acquire_lock());
        assert!(!b.is_holding());
    }

    #[test]
    fn release_lets_the_next_coordinator_in() {
        let bus = LocalBus::new();
        let mut a = LockCoordinator::with_config(bus.subscribe("app"), fast());
        let mut b = LockCoordinator::with_config(bus.subscribe("app"), fast());

        assert!(a.acquire_lock());
        assert!(!b.acquire_lock());

        a.release_lock();
        assert!(b.acquire_lock());
    }

    #[test]
    fn holder_reannounces_on_ping() {
        let bus = LocalBus::new();
        let mut a = LockCoordinator::with_config(bus.subscribe("app"), fast());
        let mut observer = bus.subscribe("app");
        assert!(a.acquire_lock());
        while observer.try_recv().is_some() {}

        observer.publish(&LockMessage::Ping { from: "obs".into() });
        a.drain();

        let mut saw_announce = false;
        while let Some(msg) = observer.try_recv() {
            if matches!(msg, LockMessage::LockAcquired { .. }) {
                saw_announce = true;
            }
        }
        assert!(saw_announce);
    }

    #[test]
    fn wait_for_lock_times_out_while_holder_answers_pings() {
        let bus = LocalBus::new();
        let mut a = LockCoordinator::with_config(bus.subscribe("app"), fast());
        let mut b = LockCoordinator::with_config(bus.subscribe("app"), fast());

        assert!(a.acquire_lock());

        // Keep the holder responsive so every retry sees its announcement.
        let holder = thread::spawn(move || {
            let stop = Instant::now() + Duration::from_millis(80);
            while Instant::now() < stop {
                a.drain();
                thread::sleep(Duration::from_millis(1));
            }
        });

        assert!(!b.wait_for_lock(Duration::from_millis(30)));
        holder.join().unwrap();
    }

    #[test]
    fn crashed_holder_does_not_block_future_acquires() {
        let bus = LocalBus::new();
        let mut a = LockCoordinator::with_config(bus.subscribe("app"), fast());
        let mut b = LockCoordinator::with_config(bus.subscribe("app"), fast());

        assert!(a.acquire_lock());
        assert!(!b.acquire_lock());

        // The holder goes away without ever announcing a release.
        drop(a);

        // Its lock evaporates: nothing answers the next ping.
        assert!(b.wait_for_lock(Duration::from_millis(200)));
        assert!(b.is_holding());
    }

    #[test]
    fn racing_coordinators_yield_at_most_one_holder() {
        let bus = LocalBus::new();
        // Asymmetric windows: the fast one claims and announces while the
        // slow one is still inside its discovery window.
        let mut a = LockCoordinator::with_config(
            bus.subscribe("app"),
            CoordinatorConfig {
                discovery_window: Duration::from_millis(1),
                retry_backoff: Duration::from_millis(2),
            },
        );
        let mut b = LockCoordinator::with_config(
            bus.subscribe("app"),
            CoordinatorConfig {
                discovery_window: Duration::from_millis(80),
                retry_backoff: Duration::from_millis(2),
            },
        );

        let gate = Arc::new(std::sync::Barrier::new(2));
        let gate_a = gate.clone();
        let gate_b = gate.clone();
        let ta = thread::spawn(move || {
            gate_a.wait();
            let got = a.acquire_lock();
            (got, a)
        });
        let tb = thread::spawn(move || {
            gate_b.wait();
            let got = b.acquire_lock();
            (got, b)
        });

        let (a_got, _a) = ta.join().unwrap();
        let (b_got, _b) = tb.join().unwrap();

        assert!(a_got);
        assert!(!(a_got && b_got), "both coordinators claimed the lock");
    }

    #[test]
    fn coordinated_run_broadcasts_lifecycle() {
        let bus = LocalBus::new();
        let coordinator = LockCoordinator::with_config(bus.subscribe("app"), fast());
        let mut observer = bus.subscribe("app");

        let result: Result<u32, CoordinationError<String>> =
            coordinator.run_with_coordination(Duration::from_millis(50), || Ok(42));
        assert_eq!(result.unwrap(), 42);

        let mut kinds = Vec::new();
        while let Some(msg) = observer.try_recv() {
            kinds.push(match msg {
                LockMessage::Ping { .. } => "ping",
                LockMessage::LockAcquired { .. } => "acquired",
                LockMessage::MigrationStarted { .. } => "started",
                LockMessage::MigrationCompleted { .. } => "completed",
                LockMessage::MigrationFailed { .. } => "failed",
                LockMessage::LockReleased { .. } => "released",
            });
        }
        assert_eq!(kinds, vec!["ping", "acquired", "started", "completed", "released"]);
    }

    #[test]
    fn coordinated_run_reports_failure_and_releases() {
        let bus = LocalBus::new();
        let coordinator = LockCoordinator::with_config(bus.subscribe("app"), fast());
        let mut observer = bus.subscribe("app");

        let result: Result<(), CoordinationError<String>> = coordinator
            .run_with_coordination(Duration::from_millis(50), || Err("boom".to_string()));
        assert!(matches!(result, Err(CoordinationError::Work(msg)) if msg == "boom"));

        let mut saw_failed = false;
        let mut saw_released = false;
        while let Some(msg) = observer.try_recv() {
            match msg {
                LockMessage::MigrationFailed { message, .. } => {
                    assert_eq!(message, "boom");
                    saw_failed = true;
                }
                LockMessage::LockReleased { .. } => saw_released = true,
                _ => {}
            }
        }
        assert!(saw_failed && saw_released);
    }

    #[test]
    fn timed_out_run_never_invokes_work() {
        let bus = LocalBus::new();
        let mut holder = LockCoordinator::with_config(bus.subscribe("app"), fast());
        assert!(holder.acquire_lock());

        let blocked = LockCoordinator::with_config(bus.subscribe("app"), fast());
        let ran = std::cell::Cell::new(false);
        let result: Result<(), CoordinationError<String>> =
            blocked.run_with_coordination(Duration::from_millis(20), || {
                ran.set(true);
                Ok(())
            });
        assert!(matches!(result, Err(CoordinationError::LockTimeout { .. })));
        assert!(!ran.get());
    }
}
