// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sandbox pool manager.
//!
//! The pool owns every sandbox. Sandboxes are grouped by [`SandboxClass`];
//! each class has its own bucket (idle queue, lease semaphore, counters) so
//! unrelated classes never share a lock. A global semaphore caps the total
//! number of leases.
//!
//! Admission waits FIFO for a class slot, then a global slot, up to the
//! caller's deadline. A lease prefers the most recently used idle sandbox of
//! its class and falls back to a cold boot.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::lifecycle::{LifecycleController, LifecycleError};
use super::{Sandbox, SandboxClass};

/// Pool sizing and eviction settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Concurrent leases across all classes.
    pub max_global: usize,
    /// Concurrent leases per class.
    pub max_per_class: usize,
    /// Idle sandboxes kept warm for each warm class.
    pub min_warm: usize,
    /// Idle queue size above which released sandboxes are destroyed.
    pub idle_target: usize,
    /// Idle sandboxes older than this are destroyed instead of leased.
    pub idle_ttl: Duration,
    /// Classes pre-provisioned at startup and kept warm.
    pub warm_classes: Vec<SandboxClass>,
    /// How often [`PoolMaintainer`] runs.
    pub maintenance_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_global: 64,
            max_per_class: 16,
            min_warm: 1,
            idle_target: 4,
            idle_ttl: Duration::from_secs(300),
            warm_classes: Vec::new(),
            maintenance_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// No slot became free before the deadline.
    #[error("No sandbox available for class {class}: {reason}")]
    Exhausted { class: SandboxClass, reason: String },

    /// A cold boot was needed and failed.
    #[error("Could not provision a sandbox for class {class}: {source}")]
    Provision {
        class: SandboxClass,
        #[source]
        source: LifecycleError,
    },

    #[error("Sandbox pool is shutting down")]
    ShuttingDown,
}

/// Per-class snapshot for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassStats {
    pub class: String,
    pub idle: usize,
    pub leased: usize,
}

struct ClassBucket {
    idle: Mutex<VecDeque<Sandbox>>,
    permits: Arc<Semaphore>,
    leased: AtomicUsize,
}

impl ClassBucket {
    fn new(max_leases: usize) -> Self {
        Self {
            idle: Mutex::new(VecDeque::new()),
            permits: Arc::new(Semaphore::new(max_leases)),
            leased: AtomicUsize::new(0),
        }
    }

    fn idle(&self) -> MutexGuard<'_, VecDeque<Sandbox>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A sandbox leased to one execution.
///
/// Hand it back with [`SandboxPool::release`]. A lease that is dropped
/// instead has its sandbox destroyed in the background.
pub struct SandboxLease {
    sandbox: Option<Sandbox>,
    bucket: Arc<ClassBucket>,
    lifecycle: Arc<LifecycleController>,
    _class_permit: OwnedSemaphorePermit,
    _global_permit: OwnedSemaphorePermit,
}

impl SandboxLease {
    /// The leased sandbox. Always `busy` while the lease is held.
    pub fn sandbox(&self) -> &Sandbox {
        // Only `release` and `drop` take the sandbox, and both consume the lease.
        match self.sandbox.as_ref() {
            Some(sandbox) => sandbox,
            None => unreachable!("lease used after release"),
        }
    }

    pub fn sandbox_id(&self) -> &str {
        self.sandbox().id()
    }
}

impl std::fmt::Debug for SandboxLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxLease")
            .field("sandbox", &self.sandbox)
            .finish_non_exhaustive()
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        self.bucket.leased.fetch_sub(1, Ordering::SeqCst);
        let Some(mut sandbox) = self.sandbox.take() else {
            return;
        };
        warn!(sandbox_id = %sandbox.id(), "Lease dropped without release, destroying sandbox");
        let lifecycle = self.lifecycle.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = lifecycle.destroy(&mut sandbox).await {
                    error!(sandbox_id = %sandbox.id(), error = %e, "Failed to destroy abandoned sandbox");
                }
            });
        }
    }
}

/// Owns all sandboxes and leases them out per class.
pub struct SandboxPool {
    lifecycle: Arc<LifecycleController>,
    buckets: DashMap<SandboxClass, Arc<ClassBucket>>,
    global: Arc<Semaphore>,
    config: PoolConfig,
    closed: AtomicBool,
}

impl SandboxPool {
    pub fn new(lifecycle: Arc<LifecycleController>, config: PoolConfig) -> Self {
        Self {
            lifecycle,
            buckets: DashMap::new(),
            global: Arc::new(Semaphore::new(config.max_global)),
            config,
            closed: AtomicBool::new(false),
        }
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleController> {
        &self.lifecycle
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn bucket(&self, class: SandboxClass) -> Arc<ClassBucket> {
        if let Some(bucket) = self.buckets.get(&class) {
            return bucket.value().clone();
        }
        self.buckets
            .entry(class)
            .or_insert_with(|| Arc::new(ClassBucket::new(self.config.max_per_class)))
            .value()
            .clone()
    }

    /// Lease a sandbox of `class` for `execution_id`, waiting for capacity
    /// until `deadline`.
    pub async fn acquire(
        &self,
        class: SandboxClass,
        execution_id: &str,
        deadline: Instant,
    ) -> Result<SandboxLease, PoolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::ShuttingDown);
        }
        let bucket = self.bucket(class);

        let class_permit = self
            .wait_for_permit(&bucket.permits, class, deadline, "class")
            .await?;
        let global_permit = self
            .wait_for_permit(&self.global, class, deadline, "global")
            .await?;

        let mut sandbox = match self.take_idle(&bucket).await {
            Some(sandbox) => {
                debug!(
                    execution_id = %execution_id,
                    sandbox_id = %sandbox.id(),
                    class = %class,
                    "Reusing warm sandbox"
                );
                sandbox
            }
            None => {
                let mut sandbox = Sandbox::new(class);
                debug!(execution_id = %execution_id, class = %class, "Cold start");
                self.lifecycle
                    .provision(&mut sandbox)
                    .await
                    .map_err(|source| PoolError::Provision { class, source })?;
                sandbox
            }
        };

        if let Err(e) = sandbox.bind(execution_id) {
            error!(sandbox_id = %sandbox.id(), error = %e, "Sandbox could not be leased");
            self.destroy(&mut sandbox).await;
            return Err(PoolError::Exhausted {
                class,
                reason: e.to_string(),
            });
        }

        bucket.leased.fetch_add(1, Ordering::SeqCst);
        Ok(SandboxLease {
            sandbox: Some(sandbox),
            bucket,
            lifecycle: self.lifecycle.clone(),
            _class_permit: class_permit,
            _global_permit: global_permit,
        })
    }

    async fn wait_for_permit(
        &self,
        semaphore: &Arc<Semaphore>,
        class: SandboxClass,
        deadline: Instant,
        scope: &str,
    ) -> Result<OwnedSemaphorePermit, PoolError> {
        match tokio::time::timeout_at(deadline, semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(PoolError::ShuttingDown),
            Err(_) => {
                warn!(class = %class, scope = scope, "Admission deadline passed");
                Err(PoolError::Exhausted {
                    class,
                    reason: format!("no {scope} capacity before the admission deadline"),
                })
            }
        }
    }

    /// Most recently used idle sandbox that is still within its TTL.
    async fn take_idle(&self, bucket: &ClassBucket) -> Option<Sandbox> {
        loop {
            let candidate = bucket.idle().pop_back()?;
            if candidate.last_used_at().elapsed() < self.config.idle_ttl {
                return Some(candidate);
            }
            let mut expired = candidate;
            debug!(sandbox_id = %expired.id(), "Idle sandbox expired");
            self.destroy(&mut expired).await;
        }
    }

    /// Return a leased sandbox. A reusable sandbox is reset and parked if its
    /// class has room; anything else is destroyed.
    pub async fn release(&self, mut lease: SandboxLease, reusable: bool) {
        let Some(mut sandbox) = lease.sandbox.take() else {
            return;
        };

        if let Err(e) = self.lifecycle.drain(&mut sandbox).await {
            warn!(sandbox_id = %sandbox.id(), error = %e, "Drain failed");
            self.destroy(&mut sandbox).await;
            return;
        }

        if !reusable || self.closed.load(Ordering::SeqCst) {
            self.destroy(&mut sandbox).await;
            return;
        }

        if let Err(e) = self.lifecycle.reset(&mut sandbox).await {
            warn!(sandbox_id = %sandbox.id(), error = %e, "Sandbox not reusable");
            return;
        }

        if let Some(mut rejected) = self.park(&lease.bucket, sandbox, self.config.idle_target) {
            debug!(sandbox_id = %rejected.id(), "Idle queue full");
            self.destroy(&mut rejected).await;
        }
    }

    /// Put a ready sandbox into the idle queue, or hand it back if the queue
    /// already holds `limit` sandboxes or the pool is closed.
    fn park(&self, bucket: &ClassBucket, sandbox: Sandbox, limit: usize) -> Option<Sandbox> {
        let mut idle = bucket.idle();
        if self.closed.load(Ordering::SeqCst) || idle.len() >= limit {
            return Some(sandbox);
        }
        idle.push_back(sandbox);
        None
    }

    async fn destroy(&self, sandbox: &mut Sandbox) {
        if let Err(e) = self.lifecycle.destroy(sandbox).await {
            error!(sandbox_id = %sandbox.id(), error = %e, "Failed to destroy sandbox");
        }
    }

    /// Provision idle sandboxes until every warm class has `min_warm`.
    /// Returns how many were booted.
    pub async fn prefill(&self) -> usize {
        let limit = self.config.min_warm.max(self.config.idle_target);
        let mut booted = 0;

        for class in self.config.warm_classes.clone() {
            let bucket = self.bucket(class);
            let missing = self
                .config
                .min_warm
                .saturating_sub(bucket.idle().len());

            for _ in 0..missing {
                if self.closed.load(Ordering::SeqCst) {
                    return booted;
                }
                let mut sandbox = Sandbox::new(class);
                if let Err(e) = self.lifecycle.provision(&mut sandbox).await {
                    warn!(class = %class, error = %e, "Warm provisioning failed");
                    break;
                }
                booted += 1;
                if let Some(mut rejected) = self.park(&bucket, sandbox, limit) {
                    self.destroy(&mut rejected).await;
                }
            }
        }

        if booted > 0 {
            info!(booted = booted, "Warm sandboxes provisioned");
        }
        booted
    }

    /// Destroy idle sandboxes past the idle TTL. Returns how many went.
    pub async fn evict_idle(&self) -> usize {
        let buckets: Vec<Arc<ClassBucket>> =
            self.buckets.iter().map(|b| b.value().clone()).collect();
        let mut evicted = 0;

        for bucket in buckets {
            let expired: Vec<Sandbox> = {
                let mut idle = bucket.idle();
                let mut expired = Vec::new();
                while idle
                    .front()
                    .is_some_and(|s| s.last_used_at().elapsed() >= self.config.idle_ttl)
                {
                    if let Some(sandbox) = idle.pop_front() {
                        expired.push(sandbox);
                    }
                }
                expired
            };
            for mut sandbox in expired {
                self.destroy(&mut sandbox).await;
                evicted += 1;
            }
        }

        if evicted > 0 {
            info!(evicted = evicted, "Evicted idle sandboxes");
        }
        evicted
    }

    /// Idle and leased counts per class, sorted by class.
    pub fn stats(&self) -> Vec<ClassStats> {
        let mut stats: Vec<ClassStats> = self
            .buckets
            .iter()
            .map(|entry| ClassStats {
                class: entry.key().to_string(),
                idle: entry.value().idle().len(),
                leased: entry.value().leased.load(Ordering::SeqCst),
            })
            .collect();
        stats.sort_by(|a, b| a.class.cmp(&b.class));
        stats
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Reject new leases and destroy every idle sandbox. Sandboxes still
    /// leased are destroyed when they are released.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.global.close();

        let buckets: Vec<Arc<ClassBucket>> =
            self.buckets.iter().map(|b| b.value().clone()).collect();
        let mut destroyed = 0;
        for bucket in buckets {
            bucket.permits.close();
            let idle: Vec<Sandbox> = bucket.idle().drain(..).collect();
            for mut sandbox in idle {
                self.destroy(&mut sandbox).await;
                destroyed += 1;
            }
        }
        info!(destroyed = destroyed, "Sandbox pool drained");
    }
}

/// Background worker keeping the pool in shape: evicts expired idle
/// sandboxes, then tops warm classes back up.
pub struct PoolMaintainer {
    pool: Arc<SandboxPool>,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl PoolMaintainer {
    pub fn new(pool: Arc<SandboxPool>) -> Self {
        let interval = pool.config().maintenance_interval;
        Self {
            pool,
            interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub async fn run(&self) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Pool maintainer started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Pool maintainer received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.interval) => {
                    self.run_once().await;
                }
            }
        }

        info!("Pool maintainer stopped");
    }

    /// One maintenance pass.
    pub async fn run_once(&self) {
        if self.pool.is_closed() {
            return;
        }
        self.pool.evict_idle().await;
        self.pool.prefill().await;
    }
}
