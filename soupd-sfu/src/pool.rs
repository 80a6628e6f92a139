//! Worker Pool - one media-engine worker per shard
//!
//! Shards are isolated: a crash on one shard relaunches that shard only, and
//! rooms assigned to other shards keep being served.

use crate::channel::{Channel, Notification};
use crate::config::SfuConfig;
use crate::error::{Error, Result};
use crate::types::ShardId;
use crate::worker::{LaunchedWorker, ShardSpec, WorkerExit, WorkerLauncher};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A shard's worker went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDown {
    pub shard: ShardId,
    pub generation: u64,
    /// `None` when the channel died before the process was reaped
    pub exit: Option<WorkerExit>,
}

/// Receivers for everything the pool reports
pub struct PoolEvents {
    pub notifications: mpsc::UnboundedReceiver<Notification>,
    pub shard_down: mpsc::UnboundedReceiver<ShardDown>,
}

struct ShardSlot {
    channel: Arc<Channel>,
    shutdown: CancellationToken,
    generation: u64,
}

/// Pool of engine workers, one per shard
pub struct WorkerPool {
    config: Arc<SfuConfig>,
    launcher: Arc<dyn WorkerLauncher>,
    shards: RwLock<Vec<Option<ShardSlot>>>,
    notify_tx: mpsc::UnboundedSender<Notification>,
    down_tx: mpsc::UnboundedSender<ShardDown>,
    shutting_down: AtomicBool,
}

impl WorkerPool {
    /// Launch every shard
    pub async fn start(
        config: Arc<SfuConfig>,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Result<(Arc<Self>, PoolEvents)> {
        config
            .validate()
            .map_err(|errors| Error::Config(errors.join("; ")))?;
        let shard_count = config.shard_count();
        let (notify_tx, notifications) = mpsc::unbounded_channel();
        let (down_tx, shard_down) = mpsc::unbounded_channel();

        let pool = Arc::new(Self {
            config,
            launcher,
            shards: RwLock::new((0..shard_count).map(|_| None).collect()),
            notify_tx,
            down_tx,
            shutting_down: AtomicBool::new(false),
        });

        for shard in 0..shard_count {
            let worker = pool.launcher.launch(&pool.spec(shard), pool.notify_tx.clone()).await?;
            pool.install(shard, 0, worker);
        }

        info!(shards = shard_count, "worker pool started");

        Ok((
            pool,
            PoolEvents {
                notifications,
                shard_down,
            },
        ))
    }

    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.read().len()
    }

    fn spec(&self, shard: ShardId) -> ShardSpec {
        let (min_port, max_port) = self.config.port_range(shard, self.shard_count());
        ShardSpec {
            shard,
            min_port,
            max_port,
        }
    }

    /// Channel of a live shard
    pub fn channel(&self, shard: ShardId) -> Result<Arc<Channel>> {
        self.shards
            .read()
            .get(shard)
            .and_then(Option::as_ref)
            .map(|slot| slot.channel.clone())
            .ok_or(Error::ShardUnavailable(shard))
    }

    #[must_use]
    pub fn is_live(&self, shard: ShardId) -> bool {
        self.shards.read().get(shard).is_some_and(Option::is_some)
    }

    /// Uniform random choice among live shards
    #[must_use]
    pub fn choose_shard(&self) -> Option<ShardId> {
        let live: Vec<ShardId> = self
            .shards
            .read()
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|_| i))
            .collect();
        live.choose(&mut rand::thread_rng()).copied()
    }

    fn install(self: &Arc<Self>, shard: ShardId, generation: u64, worker: LaunchedWorker) {
        let LaunchedWorker {
            channel,
            exited,
            shutdown,
        } = worker;

        {
            let mut shards = self.shards.write();
            shards[shard] = Some(ShardSlot {
                channel: channel.clone(),
                shutdown,
                generation,
            });
        }

        let down_tx = self.down_tx.clone();
        let pool = Arc::downgrade(self);
        tokio::spawn(async move {
            let exit = tokio::select! {
                exit = exited => exit.ok(),
                () = channel.closed() => None,
            };
            let Some(pool) = pool.upgrade() else { return };
            if pool.shutting_down.load(Ordering::Acquire) {
                return;
            }
            warn!(shard, generation, exit = ?exit, "shard worker down");
            let _ = down_tx.send(ShardDown {
                shard,
                generation,
                exit,
            });
        });
    }

    /// Take a shard out of service, terminating its worker.
    ///
    /// Returns false if `generation` is not the shard's current worker.
    pub fn mark_down(&self, shard: ShardId, generation: u64) -> bool {
        let slot = {
            let mut shards = self.shards.write();
            match shards.get_mut(shard) {
                Some(slot) if slot.as_ref().is_some_and(|s| s.generation == generation) => {
                    slot.take()
                }
                _ => None,
            }
        };
        let Some(slot) = slot else {
            return false;
        };
        slot.channel.close();
        slot.shutdown.cancel();
        true
    }

    /// Relaunch a shard that was taken out of service, retrying until it
    /// comes up or the pool shuts down.
    pub async fn restart(self: &Arc<Self>, shard: ShardId, previous_generation: u64) {
        let generation = previous_generation + 1;
        loop {
            if self.shutting_down.load(Ordering::Acquire) {
                return;
            }
            match self.launcher.launch(&self.spec(shard), self.notify_tx.clone()).await {
                Ok(worker) => {
                    self.install(shard, generation, worker);
                    info!(shard, generation, "shard worker relaunched");
                    return;
                }
                Err(e) => {
                    error!(shard, error = %e, "failed to relaunch shard worker, retrying");
                    tokio::time::sleep(self.config.restart_backoff()).await;
                }
            }
        }
    }

    /// Close every channel and terminate every worker
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let slots: Vec<ShardSlot> = self.shards.write().iter_mut().filter_map(Option::take).collect();
        for slot in slots {
            slot.channel.close();
            slot.shutdown.cancel();
        }
        info!("worker pool shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::FakeLauncher;

    fn config(workers: usize) -> Arc<SfuConfig> {
        Arc::new(SfuConfig {
            num_workers: workers,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_start_launches_every_shard_with_disjoint_ports() {
        let launcher = Arc::new(FakeLauncher::new());
        let (pool, _events) = WorkerPool::start(config(3), launcher.clone()).await.unwrap();

        assert_eq!(pool.shard_count(), 3);
        for shard in 0..3 {
            assert!(pool.channel(shard).is_ok());
        }
        let specs = launcher.launched_specs();
        assert_eq!(specs.len(), 3);
        assert!(specs[0].max_port < specs[1].min_port);
        assert!(specs[1].max_port < specs[2].min_port);
    }

    #[tokio::test]
    async fn test_crash_reports_shard_down_and_restart_replaces_only_that_shard() {
        let launcher = Arc::new(FakeLauncher::new());
        let (pool, mut events) = WorkerPool::start(config(2), launcher.clone()).await.unwrap();
        let other = pool.channel(1).unwrap();

        launcher.crash(0);
        let down = events.shard_down.recv().await.unwrap();
        assert_eq!(down.shard, 0);
        assert_eq!(down.generation, 0);

        assert!(pool.mark_down(0, 0));
        assert!(!pool.is_live(0));
        assert!(matches!(pool.channel(0), Err(Error::ShardUnavailable(0))));
        assert_eq!(pool.choose_shard(), Some(1));

        pool.restart(0, 0).await;
        assert!(pool.is_live(0));
        assert_eq!(launcher.launched_specs().len(), 3);

        // Shard 1 kept its original channel.
        assert!(Arc::ptr_eq(&other, &pool.channel(1).unwrap()));
        assert!(!other.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_relaunch_is_retried_after_backoff() {
        let launcher = Arc::new(FakeLauncher::new());
        let (pool, mut events) = WorkerPool::start(config(2), launcher.clone()).await.unwrap();
        let other = pool.channel(1).unwrap();
        let backoff = pool.config.restart_backoff();

        launcher.fail_launches(2);
        launcher.crash(0);
        let down = events.shard_down.recv().await.unwrap();
        assert!(pool.mark_down(down.shard, down.generation));

        let started = tokio::time::Instant::now();
        let restart = tokio::spawn({
            let pool = pool.clone();
            async move { pool.restart(0, 0).await }
        });

        tokio::time::sleep(backoff + backoff / 2).await;
        assert!(!pool.is_live(0), "still backing off after the first refusal");

        restart.await.unwrap();
        assert!(pool.is_live(0));
        assert!(started.elapsed() >= backoff * 2);
        // Refused launches are not recorded.
        assert_eq!(launcher.launched_specs().len(), 3);
        assert!(Arc::ptr_eq(&other, &pool.channel(1).unwrap()));
        assert!(!other.is_closed());
    }

    #[tokio::test]
    async fn test_invalid_config_is_refused() {
        let config = Arc::new(SfuConfig {
            num_workers: 1,
            stat_interval_ms: 0,
            ..Default::default()
        });
        let result = WorkerPool::start(config, Arc::new(FakeLauncher::new())).await;
        assert!(matches!(result, Err(Error::Config(reason)) if reason.contains("stat_interval_ms")));
    }

    #[tokio::test]
    async fn test_stale_mark_down_is_ignored() {
        let launcher = Arc::new(FakeLauncher::new());
        let (pool, _events) = WorkerPool::start(config(1), launcher).await.unwrap();
        assert!(!pool.mark_down(0, 7));
        assert!(pool.is_live(0));
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything_silently() {
        let launcher = Arc::new(FakeLauncher::new());
        let (pool, mut events) = WorkerPool::start(config(2), launcher).await.unwrap();
        let channel = pool.channel(0).unwrap();

        pool.shutdown();
        assert!(channel.is_closed());
        assert!(pool.choose_shard().is_none());
        tokio::task::yield_now().await;
        assert!(events.shard_down.try_recv().is_err());
    }
}
