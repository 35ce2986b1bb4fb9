//! Application-level reconnection supervisor.
//!
//! ```text
//!            ┌──────────── success ────────────┐
//!            ▼                                 │
//!  Idle ──▶ Attempting ── failure ──▶ Scheduled(delay) ──▶ Attempting
//!            ▲                                 │
//!            └──── stop() / max_retries ───────┘ (back to Idle)
//! ```
//!
//! Delay for the n-th consecutive failure:
//! `min(base × multiplier^(n−1), max)`, jittered by ±`jitter` and never
//! below `min_delay`.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;

use crate::error::SyncError;
use crate::events::{Listeners, Subscription};

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Consecutive failures after which automatic attempts stop.
    pub max_retries: u32,
    /// Relative jitter, 0.25 = ±25%.
    pub jitter: f64,
    /// Floor applied after jitter.
    pub min_delay: Duration,
    /// Upper bound on a single connection attempt.
    pub attempt_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_retries: 5,
            jitter: 0.25,
            min_delay: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPhase {
    Idle,
    Attempting,
    /// Waiting `delay` before the next attempt.
    Scheduled(Duration),
}

/// Emitted for every scheduled retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryEvent {
    /// Number of consecutive failures so far.
    pub attempt: u32,
    pub delay: Duration,
}

struct State {
    phase: ReconnectPhase,
    retry_count: u32,
    /// Bumped by `stop()`; supervisors of an older generation exit.
    generation: u64,
    in_flight: Option<watch::Receiver<Option<bool>>>,
    supervising: bool,
}

struct Inner {
    config: ReconnectConfig,
    state: Mutex<State>,
    listeners: Listeners<RetryEvent>,
    /// Told the final failure count when retries run out.
    exhausted: Listeners<u32>,
}

/// Cloneable handle; clones share the same state machine.
#[derive(Clone)]
pub struct ReconnectionManager {
    inner: Arc<Inner>,
}

enum Role {
    Leader(watch::Sender<Option<bool>>, u64),
    Follower(watch::Receiver<Option<bool>>),
}

impl ReconnectionManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State {
                    phase: ReconnectPhase::Idle,
                    retry_count: 0,
                    generation: 0,
                    in_flight: None,
                    supervising: false,
                }),
                listeners: Listeners::new(),
                exhausted: Listeners::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.inner.config
    }

    /// Un-jittered delay before retry `n` (1-based).
    pub fn delay_for(&self, n: u32) -> Duration {
        let config = &self.inner.config;
        let exponent = n.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = config.base_delay.as_secs_f64() * config.multiplier.powi(exponent);
        let max = config.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            config.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }

    /// Jittered delay before retry `n`, clamped to `[min_delay, max(max_delay, min_delay)]`.
    pub fn jittered_delay(&self, n: u32) -> Duration {
        let config = &self.inner.config;
        let base = self.delay_for(n).as_secs_f64();
        let jitter = config.jitter.abs();
        let factor = if jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            1.0
        };
        let ceiling = config.max_delay.max(config.min_delay);
        Duration::from_secs_f64((base * factor).max(0.0)).clamp(config.min_delay, ceiling)
    }

    /// Run one connection attempt under the attempt timeout.
    ///
    /// If an attempt is already in flight, waits for it and returns its
    /// result without calling `connect`.
    pub async fn attempt_reconnection<F, Fut>(&self, connect: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), SyncError>>,
    {
        let role = {
            let mut state = self.lock();
            if let Some(rx) = state.in_flight.clone() {
                Role::Follower(rx)
            } else {
                let (tx, rx) = watch::channel(None);
                state.in_flight = Some(rx);
                state.phase = ReconnectPhase::Attempting;
                Role::Leader(tx, state.generation)
            }
        };

        let (tx, generation) = match role {
            Role::Follower(mut rx) => {
                log::debug!("Reconnection attempt already in flight, waiting for it");
                return match rx.wait_for(Option::is_some).await {
                    Ok(result) => (*result).unwrap_or(false),
                    Err(_) => false,
                };
            }
            Role::Leader(tx, generation) => (tx, generation),
        };

        let timeout = self.inner.config.attempt_timeout;
        let result = match tokio::time::timeout(timeout, connect()).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout),
        };
        let success = result.is_ok();

        let outcome = {
            let mut state = self.lock();
            state.in_flight = None;
            match result {
                Ok(()) => {
                    log::info!("Reconnected after {} failed attempts", state.retry_count);
                    state.retry_count = 0;
                    state.phase = ReconnectPhase::Idle;
                    None
                }
                Err(e) if state.generation != generation => {
                    log::debug!("Ignoring failure of a stopped reconnection attempt: {e}");
                    None
                }
                Err(e) => {
                    state.retry_count += 1;
                    let attempt = state.retry_count;
                    if attempt >= self.inner.config.max_retries {
                        log::warn!("Reconnection failed {attempt} times, giving up: {e}");
                        state.phase = ReconnectPhase::Idle;
                        Some(Err(attempt))
                    } else {
                        let delay = self.jittered_delay(attempt);
                        log::warn!("Reconnection attempt {attempt} failed: {e}; retrying in {delay:?}");
                        state.phase = ReconnectPhase::Scheduled(delay);
                        Some(Ok(RetryEvent { attempt, delay }))
                    }
                }
            }
        };

        tx.send_replace(Some(success));
        match outcome {
            Some(Ok(event)) => self.inner.listeners.emit(&event),
            Some(Err(failures)) => self.inner.exhausted.emit(&failures),
            None => {}
        }
        success
    }

    /// Spawn the supervising loop unless one is already running or retries
    /// are exhausted. Returns whether a supervisor was started.
    pub fn start<F, Fut>(&self, connect: F) -> bool
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), SyncError>> + Send + 'static,
    {
        let generation = {
            let mut state = self.lock();
            if state.supervising {
                return false;
            }
            if state.retry_count >= self.inner.config.max_retries {
                log::warn!("Reconnection retries exhausted; call reconnect() to resume");
                return false;
            }
            state.supervising = true;
            state.generation
        };

        let this = self.clone();
        tokio::spawn(async move {
            this.supervise(connect, generation).await;
        });
        true
    }

    async fn supervise<F, Fut>(&self, connect: F, generation: u64)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), SyncError>> + Send + 'static,
    {
        loop {
            if self.generation() != generation {
                break;
            }
            if self.attempt_reconnection(|| connect()).await {
                break;
            }
            let delay = match self.phase() {
                ReconnectPhase::Scheduled(delay) => delay,
                // We waited on an attempt started before stop(); its failure
                // is not ours to count, so make our own.
                _ if self.generation() == generation && !self.is_exhausted() => continue,
                _ => break,
            };
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.generation == generation {
            state.supervising = false;
        }
    }

    /// Manual resume: reset the retry count and start supervising again.
    pub fn reconnect<F, Fut>(&self, connect: F) -> bool
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), SyncError>> + Send + 'static,
    {
        self.stop();
        self.start(connect)
    }

    /// Reset to idle. An attempt already in flight still completes, and its
    /// success is still reported by the connection itself.
    pub fn stop(&self) {
        let mut state = self.lock();
        state.generation += 1;
        state.retry_count = 0;
        state.phase = ReconnectPhase::Idle;
        state.supervising = false;
    }

    fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn phase(&self) -> ReconnectPhase {
        self.lock().phase
    }

    pub fn retry_count(&self) -> u32 {
        self.lock().retry_count
    }

    pub fn is_exhausted(&self) -> bool {
        self.retry_count() >= self.inner.config.max_retries
    }

    pub fn is_supervising(&self) -> bool {
        self.lock().supervising
    }

    pub fn on_retry<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&RetryEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(callback)
    }

    /// Called with the failure count once automatic attempts stop.
    pub fn on_exhausted<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&u32) + Send + Sync + 'static,
    {
        self.inner.exhausted.subscribe(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_retries: u32) -> ReconnectConfig {
        ReconnectConfig {
            base_delay: Duration::from_millis(5),
            multiplier: 2.0,
            max_delay: Duration::from_millis(20),
            max_retries,
            jitter: 0.25,
            min_delay: Duration::from_millis(5),
            attempt_timeout: Duration::from_millis(200),
        }
    }

    async fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        done()
    }

    #[test]
    fn test_delay_monotonic_and_capped() {
        let manager = ReconnectionManager::new(ReconnectConfig::default());
        let mut previous = Duration::ZERO;
        for n in 1..=12 {
            let delay = manager.delay_for(n);
            assert!(delay >= previous, "delay({n}) decreased");
            assert!(delay <= Duration::from_secs(30));
            previous = delay;
        }
        assert_eq!(manager.delay_for(1), Duration::from_secs(1));
        assert_eq!(manager.delay_for(3), Duration::from_secs(4));
        assert_eq!(manager.delay_for(10), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let manager = ReconnectionManager::new(ReconnectConfig::default());
        for _ in 0..200 {
            let delay = manager.jittered_delay(3);
            assert!(delay >= Duration::from_secs(3), "{delay:?}");
            assert!(delay <= Duration::from_secs(5), "{delay:?}");
        }
    }

    #[test]
    fn test_jitter_respects_floor_and_ceiling() {
        let manager = ReconnectionManager::new(ReconnectConfig::default());
        for _ in 0..200 {
            let first = manager.jittered_delay(1);
            assert!(first >= Duration::from_secs(1));
            let capped = manager.jittered_delay(20);
            assert!(capped <= Duration::from_secs(30));
        }
    }

    #[tokio::test]
    async fn test_failure_schedules_retry_and_emits() {
        let manager = ReconnectionManager::new(fast_config(5));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _sub = manager.on_retry(move |e| sink.lock().unwrap().push(*e));

        let ok = manager
            .attempt_reconnection(|| async { Err(SyncError::Transport("refused".into())) })
            .await;

        assert!(!ok);
        assert_eq!(manager.retry_count(), 1);
        assert!(matches!(manager.phase(), ReconnectPhase::Scheduled(_)));
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].attempt, 1);
        assert!(events[0].delay >= Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_success_resets_retry_count() {
        let manager = ReconnectionManager::new(fast_config(5));
        manager
            .attempt_reconnection(|| async { Err(SyncError::Transport("refused".into())) })
            .await;
        manager
            .attempt_reconnection(|| async { Err(SyncError::Transport("refused".into())) })
            .await;
        assert_eq!(manager.retry_count(), 2);

        assert!(manager.attempt_reconnection(|| async { Ok(()) }).await);
        assert_eq!(manager.retry_count(), 0);
        assert_eq!(manager.phase(), ReconnectPhase::Idle);
    }

    #[tokio::test]
    async fn test_attempt_times_out() {
        let manager = ReconnectionManager::new(ReconnectConfig {
            attempt_timeout: Duration::from_millis(20),
            ..fast_config(5)
        });

        let ok = manager
            .attempt_reconnection(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(!ok);
        assert_eq!(manager.retry_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_attempts_coalesce() {
        let manager = ReconnectionManager::new(fast_config(5));
        let calls = Arc::new(AtomicU32::new(0));

        let c1 = Arc::clone(&calls);
        let first = manager.attempt_reconnection(move || async move {
            c1.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        });
        let c2 = Arc::clone(&calls);
        let second = manager.attempt_reconnection(move || async move {
            c2.fetch_add(1, Ordering::SeqCst);
            Err(SyncError::Transport("should not run".into()))
        });

        let (a, b) = tokio::join!(first, second);
        assert!(a);
        assert!(b);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_supervisor_retries_until_success() {
        let manager = ReconnectionManager::new(fast_config(5));
        let calls = Arc::new(AtomicU32::new(0));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _sub = manager.on_retry(move |e| sink.lock().unwrap().push(e.attempt));

        let c = Arc::clone(&calls);
        assert!(manager.start(move || {
            let c = Arc::clone(&c);
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SyncError::Transport("refused".into()))
                } else {
                    Ok(())
                }
            }
        }));
        // Only one supervisor at a time
        assert!(!manager.start(|| async { Ok(()) }));

        assert!(wait_until(Duration::from_secs(2), || !manager.is_supervising()).await);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(manager.retry_count(), 0);
        assert_eq!(*events.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_supervisor_stops_after_max_retries() {
        let manager = ReconnectionManager::new(fast_config(3));
        let calls = Arc::new(AtomicU32::new(0));

        let exhausted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&exhausted);
        let _sub = manager.on_exhausted(move |failures| sink.lock().unwrap().push(*failures));

        let c = Arc::clone(&calls);
        manager.start(move || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(SyncError::Transport("refused".into())) }
        });

        assert!(wait_until(Duration::from_secs(2), || !manager.is_supervising()).await);
        assert!(manager.is_exhausted());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(*exhausted.lock().unwrap(), vec![3]);
        assert!(!manager.start(|| async { Ok(()) }));

        // Manual resume is still possible
        assert!(manager.reconnect(|| async { Ok(()) }));
        assert!(wait_until(Duration::from_secs(2), || !manager.is_supervising()).await);
        assert_eq!(manager.retry_count(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_while_old_attempt_in_flight() {
        let manager = ReconnectionManager::new(fast_config(5));
        let calls = Arc::new(AtomicU32::new(0));

        let c = Arc::clone(&calls);
        assert!(manager.start(move || {
            c.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Err(SyncError::Transport("refused".into()))
            }
        }));
        assert!(wait_until(Duration::from_secs(1), || calls.load(Ordering::SeqCst) == 1).await);

        // The slow attempt fails after the resume; the resumed supervisor
        // still makes an attempt of its own.
        let resumed = Arc::new(AtomicU32::new(0));
        let r = Arc::clone(&resumed);
        assert!(manager.reconnect(move || {
            r.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        }));

        assert!(wait_until(Duration::from_secs(2), || resumed.load(Ordering::SeqCst) == 1).await);
        assert!(wait_until(Duration::from_secs(2), || !manager.is_supervising()).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.retry_count(), 0);
        assert_eq!(manager.phase(), ReconnectPhase::Idle);
    }

    #[tokio::test]
    async fn test_stop_ends_supervision() {
        let manager = ReconnectionManager::new(ReconnectConfig {
            base_delay: Duration::from_millis(100),
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(100),
            ..fast_config(10)
        });
        let calls = Arc::new(AtomicU32::new(0));

        let c = Arc::clone(&calls);
        manager.start(move || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(SyncError::Transport("refused".into())) }
        });
        assert!(wait_until(Duration::from_secs(1), || calls.load(Ordering::SeqCst) == 1).await);

        manager.stop();
        assert_eq!(manager.phase(), ReconnectPhase::Idle);
        assert_eq!(manager.retry_count(), 0);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
