use crate::engine::SpreadEngine;
use crate::model::{WorkerHeartbeat, WorkerStatus};
use crate::store::write_json_atomic;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Called after every cycle; returning false stops the worker.
pub type AfterCycle = Box<dyn FnMut() -> bool + Send>;

pub struct WorkerOptions {
    pub interval: Duration,
    pub status_file: Option<PathBuf>,
    pub after_cycle: Option<AfterCycle>,
}

impl WorkerOptions {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            status_file: None,
            after_cycle: None,
        }
    }
}

/// Cloneable shutdown request for a running worker.
#[derive(Clone)]
pub struct ShutdownTrigger(Arc<watch::Sender<bool>>);

impl ShutdownTrigger {
    pub fn fire(&self) {
        let _ = self.0.send(true);
    }
}

pub struct WorkerHandle {
    shutdown: ShutdownTrigger,
    task: JoinHandle<WorkerHeartbeat>,
}

impl WorkerHandle {
    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        self.shutdown.clone()
    }

    /// Requests shutdown and waits for the in-flight cycle to finish.
    pub async fn shutdown(self) -> WorkerHeartbeat {
        self.shutdown.fire();
        self.join().await
    }

    /// Waits for the worker to stop on its own.
    pub async fn join(self) -> WorkerHeartbeat {
        match self.task.await {
            Ok(heartbeat) => heartbeat,
            Err(e) => {
                log::error!("[WORKER] task failed: {:?}", e);
                let mut heartbeat = WorkerHeartbeat::new(std::process::id(), Utc::now());
                heartbeat.status = WorkerStatus::Stopped;
                heartbeat
            }
        }
    }
}

async fn publish(engine: &SpreadEngine, heartbeat: &WorkerHeartbeat) {
    if let Err(e) = engine.record_heartbeat(heartbeat.clone()).await {
        log::warn!("[WORKER] failed to record heartbeat: {}", e);
    }
}

async fn write_status(engine: &SpreadEngine, path: &Path) {
    match engine.status().await {
        Ok(snapshot) => {
            if let Err(err) = write_json_atomic(path, &snapshot) {
                log::warn!("[STATUS] failed to write status: {:?}", err);
            }
        }
        Err(e) => log::warn!("[STATUS] failed to read status: {}", e),
    }
}

/// Drives `engine` on a fixed interval until shutdown is requested or the
/// `after_cycle` hook asks to stop. Shutdown never interrupts a cycle.
pub fn spawn(engine: Arc<SpreadEngine>, mut options: WorkerOptions) -> WorkerHandle {
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut heartbeat = WorkerHeartbeat::new(std::process::id(), Utc::now());
        publish(&engine, &heartbeat).await;
        log::info!(
            "[WORKER] started pid={} interval={:?}",
            heartbeat.pid,
            options.interval
        );

        let mut ticker = tokio::time::interval(options.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match engine.run_cycle().await {
                Ok(result) if !result.executed => {
                    log::debug!("[WORKER] cycle skipped: {:?}", result.skipped_reason)
                }
                Ok(_) => {}
                Err(e) => log::error!("[WORKER] cycle failed: {}", e),
            }
            heartbeat.beat(Utc::now());
            publish(&engine, &heartbeat).await;
            if let Some(path) = &options.status_file {
                write_status(&engine, path).await;
            }

            if let Some(hook) = options.after_cycle.as_mut() {
                if !hook() {
                    log::info!("[WORKER] stop requested by cycle hook");
                    break;
                }
            }
            if *shutdown_rx.borrow() {
                break;
            }
        }

        heartbeat.status = WorkerStatus::Stopping;
        publish(&engine, &heartbeat).await;
        heartbeat.status = WorkerStatus::Stopped;
        heartbeat.last_heartbeat = Utc::now();
        publish(&engine, &heartbeat).await;
        log::info!("[WORKER] stopped after {} cycles", heartbeat.cycles_count);
        heartbeat
    });
    WorkerHandle {
        shutdown: ShutdownTrigger(Arc::new(shutdown)),
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StatusSnapshot;
    use crate::ports::notifier::EventPublisher;
    use crate::store::{BotStore, MemoryStore};
    use crate::testing::{scan_settings, spike_pair_closes, FakeGateway};

    fn engine() -> (Arc<SpreadEngine>, Arc<MemoryStore>) {
        let (a, b) = spike_pair_closes();
        let gw = FakeGateway::new().with_candles("AAA", &a).with_candles("BBB", &b);
        let settings = scan_settings(&["AAA", "BBB"]);
        let store = Arc::new(MemoryStore::new(settings.bot.clone(), settings.initial_balance));
        let engine = SpreadEngine::new(
            Arc::new(settings),
            store.clone(),
            Arc::new(gw),
            EventPublisher::disabled(),
        );
        (Arc::new(engine), store)
    }

    #[tokio::test]
    async fn hook_stops_worker_after_cycles() {
        let (engine, store) = engine();
        let dir = tempfile::tempdir().unwrap();
        let status_path = dir.path().join("status.json");
        let mut remaining = 3;
        let options = WorkerOptions {
            interval: Duration::from_millis(1),
            status_file: Some(status_path.clone()),
            after_cycle: Some(Box::new(move || {
                remaining -= 1;
                remaining > 0
            })),
        };

        let heartbeat = spawn(engine, options).join().await;
        assert_eq!(heartbeat.cycles_count, 3);
        assert_eq!(heartbeat.status, WorkerStatus::Stopped);

        let stored = store.get_worker_status().await.unwrap().unwrap();
        assert_eq!(stored.status, WorkerStatus::Stopped);
        assert_eq!(stored.cycles_count, 3);

        let raw = std::fs::read(&status_path).unwrap();
        let snapshot: StatusSnapshot = serde_json::from_slice(&raw).unwrap();
        assert_eq!(snapshot.open_count, 1);
    }

    #[tokio::test]
    async fn shutdown_waits_for_worker() {
        let (engine, store) = engine();
        let handle = spawn(engine, WorkerOptions::every(Duration::from_secs(3600)));
        // first tick fires immediately
        tokio::time::sleep(Duration::from_millis(50)).await;
        let heartbeat = handle.shutdown().await;
        assert_eq!(heartbeat.status, WorkerStatus::Stopped);
        assert!(heartbeat.cycles_count <= 1);
        assert_eq!(
            store.get_worker_status().await.unwrap().unwrap().status,
            WorkerStatus::Stopped
        );
    }
}
