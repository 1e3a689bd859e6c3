//! Session supervisor
//!
//! Maps session keys to running runner tasks. Start has replace
//! semantics: an existing runner is stopped and awaited before the new one
//! spawns, so there is at most one active runner per key. The wrapper
//! removes the map entry before the stopped log line, which keeps
//! `is_running` truthful; crashes are logged, never rethrown.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::models::{ContactId, SessionKey, UserId};

struct RunnerHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
    gen: u64,
}

#[derive(Default)]
pub struct SessionSupervisor {
    tasks: Arc<Mutex<HashMap<SessionKey, RunnerHandle>>>,
    gen: AtomicU64,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or replace) the runner for a key. `make_runner` receives the
    /// stop receiver the supervisor controls.
    pub async fn start<F, Fut>(&self, key: SessionKey, make_runner: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        // Replace semantics: take the old runner out first and wait for it
        // to wind down completely before its successor spawns.
        let old = self.tasks.lock().remove(&key);
        if let Some(old) = old {
            info!("replacing running tracker session={}", key);
            let _ = old.stop_tx.send(true);
            let _ = old.join.await;
        }

        let gen = self.gen.fetch_add(1, Ordering::Relaxed);
        let (stop_tx, stop_rx) = watch::channel(false);
        let runner = make_runner(stop_rx);

        let tasks = Arc::clone(&self.tasks);
        let join = tokio::spawn(async move {
            info!("tracking loop starting session={}", key);
            if AssertUnwindSafe(runner).catch_unwind().await.is_err() {
                error!("tracking loop crashed session={}", key);
            }
            // Remove before the "ended" line so is_running reflects
            // reality the moment the log appears. A replacement may
            // already own the slot; generations disambiguate.
            {
                let mut tasks = tasks.lock();
                if tasks.get(&key).map(|h| h.gen) == Some(gen) {
                    tasks.remove(&key);
                }
            }
            info!("tracking loop ended session={}", key);
        });

        // If a racing start inserted a handle for this key, the overwrite
        // drops its stop sender, which that runner observes as stop.
        self.tasks.lock().insert(key, RunnerHandle { stop_tx, join, gen });
    }

    /// Stop one session and wait for the runner to finish.
    pub async fn stop(&self, key: SessionKey) {
        let handle = self.tasks.lock().remove(&key);
        if let Some(handle) = handle {
            let _ = handle.stop_tx.send(true);
            let _ = handle.join.await;
            info!("tracking stopped session={}", key);
        }
    }

    /// Stop every platform runner of one contact.
    pub async fn stop_all_for_contact(&self, user_id: UserId, contact_id: ContactId) {
        let keys: Vec<SessionKey> = {
            let tasks = self.tasks.lock();
            tasks
                .keys()
                .filter(|k| k.user_id == user_id && k.contact_id == contact_id)
                .copied()
                .collect()
        };
        for key in keys {
            self.stop(key).await;
        }
    }

    /// Stop everything; process shutdown.
    pub async fn stop_all(&self) {
        let keys: Vec<SessionKey> = self.tasks.lock().keys().copied().collect();
        for key in keys {
            self.stop(key).await;
        }
    }

    /// True iff a runner task exists and has not finished. Finished
    /// entries are pruned on the way.
    pub fn is_running(&self, key: SessionKey) -> bool {
        let mut tasks = self.tasks.lock();
        match tasks.get(&key) {
            Some(handle) if handle.join.is_finished() => {
                tasks.remove(&key);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// contact_id -> sorted platforms, for one user.
    pub fn list_running(&self, user_id: UserId) -> BTreeMap<ContactId, Vec<String>> {
        let tasks = self.tasks.lock();
        let mut out: BTreeMap<ContactId, Vec<String>> = BTreeMap::new();
        for (key, handle) in tasks.iter() {
            if key.user_id != user_id || handle.join.is_finished() {
                continue;
            }
            out.entry(key.contact_id).or_default().push(key.platform.as_str().to_string());
        }
        for platforms in out.values_mut() {
            platforms.sort();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Platform;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{sleep, Duration};

    fn key(platform: Platform) -> SessionKey {
        SessionKey::new(1, 2, platform)
    }

    async fn idle_runner(mut stop_rx: watch::Receiver<bool>) {
        loop {
            if *stop_rx.borrow() {
                return;
            }
            if stop_rx.changed().await.is_err() {
                return;
            }
        }
    }

    #[tokio::test]
    async fn start_stop_roundtrip() {
        let sup = SessionSupervisor::new();
        let k = key(Platform::Mock);

        sup.start(k, idle_runner).await;
        assert!(sup.is_running(k));

        sup.stop(k).await;
        assert!(!sup.is_running(k));
    }

    #[tokio::test]
    async fn replace_stops_previous_runner() {
        let sup = SessionSupervisor::new();
        let k = key(Platform::Mock);
        let stops = Arc::new(AtomicUsize::new(0));

        let stops_a = stops.clone();
        sup.start(k, move |mut stop_rx| async move {
            let _ = stop_rx.changed().await;
            stops_a.fetch_add(1, Ordering::SeqCst);
        })
        .await;

        sup.start(k, idle_runner).await;
        // The first runner was stopped and awaited before the second spawned.
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert!(sup.is_running(k));

        sup.stop(k).await;
    }

    #[tokio::test]
    async fn finished_runner_is_pruned() {
        let sup = SessionSupervisor::new();
        let k = key(Platform::Mock);

        sup.start(k, |_stop_rx| async {}).await;
        sleep(Duration::from_millis(50)).await;
        assert!(!sup.is_running(k));
    }

    #[tokio::test]
    async fn crash_is_contained_and_entry_removed() {
        let sup = SessionSupervisor::new();
        let k = key(Platform::Mock);

        sup.start(k, |_stop_rx| async {
            panic!("boom");
        })
        .await;
        sleep(Duration::from_millis(50)).await;
        assert!(!sup.is_running(k));

        // The slot is free for a retry.
        sup.start(k, idle_runner).await;
        assert!(sup.is_running(k));
        sup.stop(k).await;
    }

    #[tokio::test]
    async fn list_running_groups_platforms() {
        let sup = SessionSupervisor::new();
        sup.start(key(Platform::Mock), idle_runner).await;
        sup.start(key(Platform::Signal), idle_runner).await;
        sup.start(SessionKey::new(9, 9, Platform::Mock), idle_runner).await;

        let running = sup.list_running(1);
        assert_eq!(running.len(), 1);
        assert_eq!(running[&2], vec!["mock".to_string(), "signal".to_string()]);

        sup.stop_all().await;
        assert!(sup.list_running(1).is_empty());
        assert!(sup.list_running(9).is_empty());
    }

    #[tokio::test]
    async fn stop_all_for_contact_is_scoped() {
        let sup = SessionSupervisor::new();
        sup.start(key(Platform::Mock), idle_runner).await;
        sup.start(SessionKey::new(1, 3, Platform::Mock), idle_runner).await;

        sup.stop_all_for_contact(1, 2).await;
        assert!(!sup.is_running(key(Platform::Mock)));
        assert!(sup.is_running(SessionKey::new(1, 3, Platform::Mock)));

        sup.stop_all().await;
    }
}
