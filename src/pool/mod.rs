//! Per-host bounded pool of live sessions.
//!
//! Sessions are created lazily on first demand and handed out one at a
//! time through scoped checkouts; the closure gets the session and the
//! pool guarantees it is returned (or destroyed, when the caller reports
//! it broken) on every exit path. Blocked checkouts wake FIFO per host. A
//! background reaper closes sessions idle past the configured duration.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::common::Stopwatch;
use crate::config::{Defaults, Host};
use crate::error::{PoolError, SessionError};
use crate::ssh::Session;
use crate::telemetry::{names, Event, SharedSink};

/// Dials one host and produces a live session.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &Host) -> Result<Box<dyn Session>, SessionError>;
}

/// How the caller left the session it borrowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionHealth {
    /// Return the session to the pool for reuse.
    Healthy,
    /// Connection-level failure; destroy instead of returning.
    Broken,
}

/// Pool tuning knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Bound on live sessions per host.
    pub max_per_host: usize,
    /// Idle sessions older than this are reaped.
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
    /// Bound on how long a checkout may wait for a free slot.
    pub checkout_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_host: 5,
            idle_timeout: Duration::from_secs(300),
            reap_interval: Duration::from_secs(30),
            checkout_timeout: None,
        }
    }
}

impl PoolConfig {
    pub fn from_defaults(defaults: &Defaults) -> Self {
        Self {
            max_per_host: defaults.max_connections.max(1),
            ..Default::default()
        }
    }
}

/// Point-in-time pool counters for one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub pool_size: usize,
    pub available: usize,
    pub in_use: usize,
}

struct IdleSession {
    session: Arc<dyn Session>,
    last_used: Instant,
}

struct HostPool {
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleSession>>,
    in_use: AtomicUsize,
}

impl HostPool {
    fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            idle: Mutex::new(VecDeque::new()),
            in_use: AtomicUsize::new(0),
        }
    }
}

/// Restores pool accounting when a checkout ends, normally or by drop.
struct ReturnGuard {
    host_pool: Arc<HostPool>,
    session: Option<Arc<dyn Session>>,
}

impl Drop for ReturnGuard {
    fn drop(&mut self) {
        self.host_pool.in_use.fetch_sub(1, Ordering::SeqCst);
        if let Some(session) = self.session.take() {
            self.host_pool.idle.lock().unwrap().push_back(IdleSession {
                session,
                last_used: Instant::now(),
            });
        }
    }
}

/// The connection pool.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    hosts: Mutex<HashMap<String, Arc<HostPool>>>,
    closed: AtomicBool,
    reaper_started: AtomicBool,
    telemetry: SharedSink,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig, telemetry: SharedSink) -> Arc<Self> {
        Arc::new(Self {
            connector,
            config,
            hosts: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            reaper_started: AtomicBool::new(false),
            telemetry,
        })
    }

    fn host_pool(&self, host_name: &str) -> Arc<HostPool> {
        let mut hosts = self.hosts.lock().unwrap();
        Arc::clone(
            hosts
                .entry(host_name.to_string())
                .or_insert_with(|| Arc::new(HostPool::new(self.config.max_per_host))),
        )
    }

    fn ensure_reaper(self: &Arc<Self>) {
        if self.reaper_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(self);
        let interval = self.config.reap_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(pool) = weak.upgrade() else { break };
                if pool.closed.load(Ordering::SeqCst) {
                    break;
                }
                pool.reap_idle();
            }
        });
    }

    fn reap_idle(&self) {
        let hosts: Vec<Arc<HostPool>> = self.hosts.lock().unwrap().values().cloned().collect();
        for host_pool in hosts {
            let mut idle = host_pool.idle.lock().unwrap();
            let before = idle.len();
            idle.retain(|s| s.last_used.elapsed() < self.config.idle_timeout);
            let reaped = before - idle.len();
            if reaped > 0 {
                debug!(reaped, "Reaped idle sessions");
            }
        }
    }

    /// Executes `f` with a session for `host`, returning the session to
    /// the pool (or destroying it when `f` reports it broken) on every
    /// exit path. The closure must not retain the session beyond its
    /// future.
    pub async fn checkout<T, F, Fut>(self: &Arc<Self>, host: &Host, f: F) -> Result<T, PoolError>
    where
        F: FnOnce(Arc<dyn Session>) -> Fut,
        Fut: Future<Output = (T, SessionHealth)>,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }
        self.ensure_reaper();
        let host_pool = self.host_pool(&host.name);

        let permit = {
            let acquire = Arc::clone(&host_pool.semaphore).acquire_owned();
            match self.config.checkout_timeout {
                Some(limit) => tokio::time::timeout(limit, acquire)
                    .await
                    .map_err(|_| PoolError::CheckoutTimeout {
                        host: host.name.clone(),
                    })?,
                None => acquire.await,
            }
            .map_err(|_| PoolError::Closed)?
        };

        let session = self.obtain_session(host, &host_pool).await?;

        // The guard returns the session and fixes the in-use count even if
        // the caller's future is dropped mid-flight (task timeout, cancel).
        host_pool.in_use.fetch_add(1, Ordering::SeqCst);
        let mut guard = ReturnGuard {
            host_pool: Arc::clone(&host_pool),
            session: Some(Arc::clone(&session)),
        };

        let (value, health) = f(session).await;

        if health == SessionHealth::Broken || self.closed.load(Ordering::SeqCst) {
            debug!(host = %host.name, "Destroying session");
            guard.session = None;
        }
        drop(guard);
        drop(permit);
        Ok(value)
    }

    /// Checkout variant for callers whose work is itself fallible at the
    /// session level; fatal errors destroy the session automatically.
    pub async fn with_connection<R, F, Fut>(
        self: &Arc<Self>,
        host: &Host,
        f: F,
    ) -> Result<R, PoolError>
    where
        F: FnOnce(Arc<dyn Session>) -> Fut,
        Fut: Future<Output = Result<R, SessionError>>,
    {
        let result = self
            .checkout(host, |session| async move {
                let result = f(session).await;
                let health = match &result {
                    Err(err) if err.is_fatal() => SessionHealth::Broken,
                    _ => SessionHealth::Healthy,
                };
                (result, health)
            })
            .await?;
        result.map_err(PoolError::Session)
    }

    async fn obtain_session(
        &self,
        host: &Host,
        host_pool: &HostPool,
    ) -> Result<Arc<dyn Session>, PoolError> {
        // Reuse the most recently returned session that is still alive.
        loop {
            let candidate = host_pool.idle.lock().unwrap().pop_back();
            match candidate {
                Some(idle) => {
                    if idle.session.alive().await {
                        return Ok(idle.session);
                    }
                    debug!(host = %host.name, "Discarding dead idle session");
                }
                None => break,
            }
        }

        self.telemetry.emit(Event::new(
            names::SSH_CONNECT_START,
            serde_json::json!({"host": host.name}),
        ));
        let stopwatch = Stopwatch::start();

        let connected = self.connector.connect(host).await;
        let duration_ms = stopwatch.elapsed_ms();
        match connected {
            Ok(session) => {
                self.telemetry.emit(
                    Event::new(
                        names::SSH_CONNECT_STOP,
                        serde_json::json!({"host": host.name, "ok": true}),
                    )
                    .with_duration(duration_ms),
                );
                Ok(Arc::from(session))
            }
            Err(err) => {
                warn!(host = %host.name, error = %err, "Connect failed");
                self.telemetry.emit(
                    Event::new(
                        names::SSH_CONNECT_STOP,
                        serde_json::json!({"host": host.name, "ok": false, "reason": err.to_string()}),
                    )
                    .with_duration(duration_ms),
                );
                Err(PoolError::Session(err))
            }
        }
    }

    /// Counters for one host's pool.
    pub fn stats(&self, host_name: &str) -> PoolStats {
        let hosts = self.hosts.lock().unwrap();
        match hosts.get(host_name) {
            Some(host_pool) => PoolStats {
                pool_size: self.config.max_per_host,
                available: host_pool.idle.lock().unwrap().len(),
                in_use: host_pool.in_use.load(Ordering::SeqCst),
            },
            None => PoolStats {
                pool_size: self.config.max_per_host,
                available: 0,
                in_use: 0,
            },
        }
    }

    /// Terminates every session and rejects further checkouts.
    pub fn close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let hosts = self.hosts.lock().unwrap();
        for host_pool in hosts.values() {
            host_pool.idle.lock().unwrap().clear();
            host_pool.semaphore.close();
        }
        debug!("Connection pool closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::mock::MockSession;
    use crate::telemetry::CollectingSink;

    struct CountingConnector {
        connects: AtomicUsize,
        fail: AtomicBool,
    }

    impl CountingConnector {
        fn new() -> Self {
            Self {
                connects: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn connect(&self, host: &Host) -> Result<Box<dyn Session>, SessionError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SessionError::ConnectionFailed {
                    host: host.name.clone(),
                    reason: "scripted".into(),
                });
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockSession::new()))
        }
    }

    fn host() -> Host {
        Host::parse("web1", "web1.example.com").unwrap()
    }

    fn pool_with(
        connector: Arc<CountingConnector>,
        config: PoolConfig,
    ) -> Arc<ConnectionPool> {
        ConnectionPool::new(connector, config, Arc::new(CollectingSink::new()))
    }

    #[tokio::test]
    async fn test_sequential_checkouts_reuse_one_session() {
        let connector = Arc::new(CountingConnector::new());
        let pool = pool_with(Arc::clone(&connector), PoolConfig::default());

        for _ in 0..3 {
            pool.with_connection(&host(), |session| async move {
                session.exec("true", &Default::default()).await.map(|_| ())
            })
            .await
            .unwrap();
        }

        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        let stats = pool.stats("web1");
        assert_eq!(stats.available, 1);
        assert_eq!(stats.in_use, 0);
    }

    #[tokio::test]
    async fn test_capacity_bounds_concurrency() {
        let connector = Arc::new(CountingConnector::new());
        let config = PoolConfig {
            max_per_host: 2,
            ..Default::default()
        };
        let pool = pool_with(Arc::clone(&connector), config);

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let pool = Arc::clone(&pool);
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                pool.checkout(&host(), |_session| async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    ((), SessionHealth::Healthy)
                })
                .await
                .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(connector.connects.load(Ordering::SeqCst) <= 2);

        let stats = pool.stats("web1");
        assert!(stats.available + stats.in_use <= stats.pool_size);
    }

    #[tokio::test]
    async fn test_broken_session_is_replaced() {
        let connector = Arc::new(CountingConnector::new());
        let pool = pool_with(Arc::clone(&connector), PoolConfig::default());

        let result: Result<(), PoolError> = pool
            .with_connection(&host(), |_session| async move {
                Err(SessionError::ConnectionLost("reset by peer".into()))
            })
            .await;
        assert!(matches!(
            result,
            Err(PoolError::Session(SessionError::ConnectionLost(_)))
        ));
        assert_eq!(pool.stats("web1").available, 0);

        pool.with_connection(&host(), |_session| async move { Ok(()) })
            .await
            .unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_command_failure_keeps_session() {
        let connector = Arc::new(CountingConnector::new());
        let pool = pool_with(Arc::clone(&connector), PoolConfig::default());

        let result: Result<(), PoolError> = pool
            .with_connection(&host(), |_session| async move {
                Err(SessionError::Exec("exit 1".into()))
            })
            .await;
        assert!(result.is_err());
        // Non-fatal: the session went back to the pool.
        assert_eq!(pool.stats("web1").available, 1);
    }

    #[tokio::test]
    async fn test_checkout_timeout() {
        let connector = Arc::new(CountingConnector::new());
        let config = PoolConfig {
            max_per_host: 1,
            checkout_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let pool = pool_with(connector, config);

        let holder = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.checkout(&host(), |_session| async move {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    ((), SessionHealth::Healthy)
                })
                .await
                .unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let result = pool
            .checkout(&host(), |_session| async move { ((), SessionHealth::Healthy) })
            .await;
        assert!(matches!(result, Err(PoolError::CheckoutTimeout { .. })));

        holder.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_surfaces_and_frees_slot() {
        let connector = Arc::new(CountingConnector::new());
        connector.fail.store(true, Ordering::SeqCst);
        let pool = pool_with(Arc::clone(&connector), PoolConfig::default());

        let result = pool
            .checkout(&host(), |_session| async move { ((), SessionHealth::Healthy) })
            .await;
        assert!(matches!(
            result,
            Err(PoolError::Session(SessionError::ConnectionFailed { .. }))
        ));

        // The slot is free again for the next attempt.
        connector.fail.store(false, Ordering::SeqCst);
        pool.checkout(&host(), |_session| async move { ((), SessionHealth::Healthy) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_all_rejects_checkouts() {
        let connector = Arc::new(CountingConnector::new());
        let pool = pool_with(connector, PoolConfig::default());

        pool.with_connection(&host(), |_s| async move { Ok(()) })
            .await
            .unwrap();
        pool.close_all();

        let result = pool
            .checkout(&host(), |_session| async move { ((), SessionHealth::Healthy) })
            .await;
        assert!(matches!(result, Err(PoolError::Closed)));
        assert_eq!(pool.stats("web1").available, 0);
    }

    #[tokio::test]
    async fn test_connect_emits_telemetry() {
        let connector = Arc::new(CountingConnector::new());
        let sink = Arc::new(CollectingSink::new());
        let pool = ConnectionPool::new(connector, PoolConfig::default(), sink.clone());

        pool.with_connection(&host(), |_s| async move { Ok(()) })
            .await
            .unwrap();

        let names: Vec<_> = sink.names();
        assert_eq!(names, vec!["ssh.connect.start", "ssh.connect.stop"]);
    }
}
