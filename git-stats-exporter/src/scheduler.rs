// SPDX-FileCopyrightText: 2025 RAprogramm <andrey.rozanov.vl@gmail.com>
// SPDX-License-Identifier: MIT

//! Drives reconciliation cycles for every watched resource.
//!
//! Each key gets its own task loop, so at most one cycle per key runs at a
//! time; a shared semaphore bounds the number of cycles running across all
//! keys. The loop sleeps for the interval requested by the reconciler, backs
//! off exponentially after failures and wakes early when the resource spec
//! changes.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::{
    sync::{
        Notify, Semaphore,
        broadcast::error::RecvError,
        mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    },
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    controller::{Reconciler, SyncPhase},
    error::Error,
    resource::{ResourceEvent, ResourceKey, ResourceStore},
    retry::RetryConfig,
};

type PhaseMap = Arc<Mutex<HashMap<ResourceKey, SyncPhase,>,>,>;

/// State shared by all key loops.
#[derive(Clone,)]
struct Shared
{
    reconciler: Arc<Reconciler,>,
    workers:    Arc<Semaphore,>,
    backoff:    RetryConfig,
    phases:     PhaseMap,
}

impl Shared
{
    fn set_phase(&self, key: &ResourceKey, phase: SyncPhase,)
    {
        self.phases.lock().unwrap_or_else(PoisonError::into_inner,).insert(key.clone(), phase,);
    }

    fn clear_phase(&self, key: &ResourceKey,)
    {
        self.phases.lock().unwrap_or_else(PoisonError::into_inner,).remove(key,);
    }
}

struct KeyTask
{
    id:      u64,
    trigger: Arc<Notify,>,
    handle:  JoinHandle<(),>,
}

/// Running key loops plus the channel their exits are reported on.
struct TaskSet
{
    tasks:    HashMap<ResourceKey, KeyTask,>,
    next_id:  u64,
    finished: UnboundedSender<(ResourceKey, u64,),>,
}

impl TaskSet
{
    fn new() -> (Self, UnboundedReceiver<(ResourceKey, u64,),>,)
    {
        let (finished, exits,) = unbounded_channel();
        (
            Self {
                tasks: HashMap::new(), next_id: 0, finished,
            },
            exits,
        )
    }

    /// Forgets the loop `id` of `key`; returns `false` when a newer loop has
    /// already replaced it.
    fn remove_finished(&mut self, key: &ResourceKey, id: u64,) -> bool
    {
        match self.tasks.get(key,) {
            Some(task,) if task.id == id => {
                self.tasks.remove(key,);
                true
            }
            _ => false,
        }
    }

    fn len(&self,) -> usize
    {
        self.tasks.len()
    }
}

/// Work queue of reconciliation cycles.
pub struct Scheduler
{
    store:  Arc<dyn ResourceStore,>,
    shared: Shared,
}

impl Scheduler
{
    /// Creates a scheduler running at most `workers` cycles concurrently.
    pub fn new(
        reconciler: Arc<Reconciler,>,
        store: Arc<dyn ResourceStore,>,
        workers: usize,
        backoff: RetryConfig,
    ) -> Self
    {
        Self {
            store,
            shared: Shared {
                reconciler,
                workers: Arc::new(Semaphore::new(workers.max(1,),),),
                backoff,
                phases: Arc::default(),
            },
        }
    }

    /// Current phase of `key`; `None` once its loop has ended.
    pub fn phase(&self, key: &ResourceKey,) -> Option<SyncPhase,>
    {
        self.shared.phases.lock().unwrap_or_else(PoisonError::into_inner,).get(key,).copied()
    }

    /// Snapshot of all tracked phases.
    pub fn phases(&self,) -> HashMap<ResourceKey, SyncPhase,>
    {
        self.shared.phases.lock().unwrap_or_else(PoisonError::into_inner,).clone()
    }

    /// Runs until `cancel` fires, then waits for every key loop to stop.
    ///
    /// # Errors
    ///
    /// Returns store errors of the initial listing.
    pub async fn run(&self, cancel: CancellationToken,) -> Result<(), Error,>
    {
        let mut events = self.store.subscribe();
        let (mut tasks, mut exits,) = TaskSet::new();
        for key in self.store.list().await? {
            self.ensure_task(&mut tasks, key, &cancel,);
        }
        info!(resources = tasks.len(), "scheduler started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(ResourceEvent::Applied(key,),) => self.ensure_task(&mut tasks, key, &cancel,),
                    Ok(ResourceEvent::Deleted(key,),) => {
                        if let Some(task,) = tasks.tasks.get(&key,) {
                            task.trigger.notify_one();
                        }
                    }
                    Err(RecvError::Lagged(skipped,),) => {
                        warn!(skipped, "resource events lagged, resynchronizing all resources");
                        for key in self.store.list().await? {
                            self.ensure_task(&mut tasks, key, &cancel,);
                        }
                    }
                    Err(RecvError::Closed,) => {
                        debug!("resource event stream closed");
                        cancel.cancelled().await;
                        break;
                    }
                },
                Some((key, id,),) = exits.recv() => {
                    // A re-applied resource may have been signalled to a loop
                    // that was already exiting.
                    if tasks.remove_finished(&key, id,)
                        && !cancel.is_cancelled()
                        && self.store.get(&key,).await?.is_some()
                    {
                        debug!(%key, "resource reappeared, restarting reconciliation loop");
                        self.ensure_task(&mut tasks, key, &cancel,);
                    }
                }
            }
        }

        for (key, task,) in tasks.tasks {
            if let Err(error,) = task.handle.await {
                warn!(%key, %error, "reconciliation loop panicked");
            }
        }
        info!("scheduler stopped");
        Ok((),)
    }

    /// Wakes the loop of `key`, starting one when none is running.
    fn ensure_task(
        &self,
        tasks: &mut TaskSet,
        key: ResourceKey,
        cancel: &CancellationToken,
    )
    {
        if let Some(task,) = tasks.tasks.get(&key,).filter(|task| !task.handle.is_finished(),) {
            task.trigger.notify_one();
            return;
        }

        let id = tasks.next_id;
        tasks.next_id += 1;
        let trigger = Arc::new(Notify::new(),);
        self.shared.set_phase(&key, SyncPhase::Pending,);
        let finished = tasks.finished.clone();
        let loop_key = key.clone();
        let shared = self.shared.clone();
        let loop_trigger = trigger.clone();
        let cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            run_key(shared, loop_key.clone(), loop_trigger, cancel,).await;
            let _ = finished.send((loop_key, id,),);
        },);
        tasks.tasks.insert(key, KeyTask {
            id, trigger, handle,
        },);
    }
}

/// Delay before retrying after `failures` consecutive failed cycles.
fn failure_delay(backoff: &RetryConfig, failures: u32, resync: Option<Duration,>,) -> Duration
{
    let delay = backoff.delay_for(failures,);
    resync.map_or(delay, |resync| delay.min(resync,),)
}

async fn run_key(shared: Shared, key: ResourceKey, trigger: Arc<Notify,>, cancel: CancellationToken,)
{
    let mut failures = 0u32;

    loop {
        shared.set_phase(&key, SyncPhase::Pending,);
        let permit = tokio::select! {
            () = cancel.cancelled() => break,
            permit = shared.workers.clone().acquire_owned() => match permit {
                Ok(permit,) => permit,
                Err(_,) => break,
            },
        };

        shared.set_phase(&key, SyncPhase::Synchronizing,);
        let outcome = shared.reconciler.run_cycle(&key, &cancel,).await;
        drop(permit,);

        let delay = if outcome.success {
            let Some(after,) = outcome.next_run_after else {
                debug!(%key, "resource gone, stopping reconciliation loop");
                break;
            };
            failures = 0;
            shared.set_phase(&key, SyncPhase::Synchronized,);
            after
        } else {
            failures = failures.saturating_add(1,);
            shared.set_phase(&key, SyncPhase::Pending,);
            let delay = failure_delay(&shared.backoff, failures, outcome.next_run_after,);
            debug!(%key, failures, delay_ms = delay.as_millis() as u64, "requeued after failure");
            delay
        };

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay,) => {}
            () = trigger.notified() => debug!(%key, "resource changed, resynchronizing"),
        }
    }

    shared.clear_phase(&key,);
}
