//! A small long-lived worker pool for fire-and-forget cleanup jobs.
//! Jobs are identified by a task id handed back to the caller, who
//! can poll, await with a timeout, or best-effort cancel (which only
//! succeeds while the job is still queued).

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc, Arc, Condvar, Mutex,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Result};

use crate::{cleaner::CleanupResult, debug, info, warn};

pub const DEFAULT_BACKGROUND_WORKERS: usize = 4;

enum TaskPhase {
    Queued,
    Running,
    Done(CleanupResult),
    Cancelled,
}

impl TaskPhase {
    fn is_finished(&self) -> bool {
        matches!(self, TaskPhase::Done(_) | TaskPhase::Cancelled)
    }
}

struct TaskCell {
    phase: Mutex<TaskPhase>,
    cond: Condvar,
}

struct Job {
    task_id: String,
    cell: Arc<TaskCell>,
    run: Box<dyn FnOnce() -> CleanupResult + Send>,
}

struct Workers {
    sender: mpsc::Sender<Job>,
    handles: Vec<JoinHandle<()>>,
}

pub struct BackgroundRunner {
    num_workers: usize,
    workers: Mutex<Option<Workers>>,
    tasks: Mutex<HashMap<String, Arc<TaskCell>>>,
    next_seq: AtomicU64,
}

impl BackgroundRunner {
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers: num_workers.max(1),
            workers: Mutex::new(None),
            tasks: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Workers are started lazily on the first submission (and again
    /// after a shutdown).
    fn ensure_workers(&self) -> Result<()> {
        let mut workers = self.workers.lock().expect("workers mutex");
        if workers.is_some() {
            return Ok(());
        }
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut handles = vec![];
        for n in 0..self.num_workers {
            let receiver = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("background-cleanup-{n}"))
                .spawn(move || loop {
                    let job = {
                        let receiver = receiver.lock().expect("worker receiver mutex");
                        match receiver.recv() {
                            Ok(job) => job,
                            Err(_) => break,
                        }
                    };
                    let Job { task_id, cell, run } = job;
                    {
                        let mut phase = cell.phase.lock().expect("task phase mutex");
                        if matches!(*phase, TaskPhase::Cancelled) {
                            continue;
                        }
                        *phase = TaskPhase::Running;
                    }
                    debug!("background task {task_id} starting");
                    let result = run();
                    let mut phase = cell.phase.lock().expect("task phase mutex");
                    *phase = TaskPhase::Done(result);
                    cell.cond.notify_all();
                })
                .map_err(|e| anyhow!("spawning background worker: {e}"))?;
            handles.push(handle);
        }
        *workers = Some(Workers { sender, handles });
        Ok(())
    }

    /// Submit `job`; returns the task id immediately. `label` becomes
    /// part of the id so operators can tell tasks apart.
    pub fn submit(
        &self,
        label: &str,
        job: impl FnOnce() -> CleanupResult + Send + 'static,
    ) -> Result<String> {
        self.ensure_workers()?;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let task_id = format!("{label}_{seq}");
        let cell = Arc::new(TaskCell {
            phase: Mutex::new(TaskPhase::Queued),
            cond: Condvar::new(),
        });
        self.tasks
            .lock()
            .expect("tasks mutex")
            .insert(task_id.clone(), cell.clone());
        let workers = self.workers.lock().expect("workers mutex");
        workers
            .as_ref()
            .expect("workers were just ensured")
            .sender
            .send(Job {
                task_id: task_id.clone(),
                cell,
                run: Box::new(job),
            })
            .map_err(|_| anyhow!("background worker pool is shut down"))?;
        info!("submitted background task {task_id}");
        Ok(task_id)
    }

    /// True when the task has finished (or was cancelled, or is not
    /// known at all).
    pub fn is_done(&self, task_id: &str) -> bool {
        let tasks = self.tasks.lock().expect("tasks mutex");
        match tasks.get(task_id) {
            None => true,
            Some(cell) => cell.phase.lock().expect("task phase mutex").is_finished(),
        }
    }

    /// Block until the task finishes, up to `timeout` (forever when
    /// `None`). The result is handed out once; the task is forgotten
    /// afterwards. `None` on timeout, unknown task id, or a cancelled
    /// task.
    pub fn await_result(&self, task_id: &str, timeout: Option<Duration>) -> Option<CleanupResult> {
        let cell = {
            let tasks = self.tasks.lock().expect("tasks mutex");
            match tasks.get(task_id) {
                None => {
                    warn!("background task not found: {task_id}");
                    return None;
                }
                Some(cell) => cell.clone(),
            }
        };
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut phase = cell.phase.lock().expect("task phase mutex");
        while !phase.is_finished() {
            match deadline {
                None => {
                    phase = cell.cond.wait(phase).expect("task phase mutex");
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        warn!("timeout waiting for background task {task_id}");
                        return None;
                    }
                    let (guard, _timeout_result) = cell
                        .cond
                        .wait_timeout(phase, deadline - now)
                        .expect("task phase mutex");
                    phase = guard;
                }
            }
        }
        let result = match std::mem::replace(&mut *phase, TaskPhase::Cancelled) {
            TaskPhase::Done(result) => Some(result),
            _ => None,
        };
        drop(phase);
        self.tasks.lock().expect("tasks mutex").remove(task_id);
        result
    }

    /// Best-effort cancellation; only succeeds while the job has not
    /// been picked up by a worker yet.
    pub fn cancel(&self, task_id: &str) -> bool {
        let mut tasks = self.tasks.lock().expect("tasks mutex");
        let Some(cell) = tasks.get(task_id) else {
            return false;
        };
        let mut phase = cell.phase.lock().expect("task phase mutex");
        match *phase {
            TaskPhase::Queued => {
                *phase = TaskPhase::Cancelled;
                cell.cond.notify_all();
                drop(phase);
                tasks.remove(task_id);
                info!("cancelled background task {task_id}");
                true
            }
            _ => false,
        }
    }

    /// Ids of tasks that are queued or currently running.
    pub fn active_task_ids(&self) -> Vec<String> {
        let tasks = self.tasks.lock().expect("tasks mutex");
        let mut ids: Vec<String> = tasks
            .iter()
            .filter(|(_, cell)| !cell.phase.lock().expect("task phase mutex").is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Wait for every known task to finish. True when all finished
    /// within the timeout.
    pub fn await_all(&self, timeout: Option<Duration>) -> bool {
        let cells: Vec<(String, Arc<TaskCell>)> = {
            let tasks = self.tasks.lock().expect("tasks mutex");
            tasks
                .iter()
                .map(|(id, cell)| (id.clone(), cell.clone()))
                .collect()
        };
        let deadline = timeout.map(|t| Instant::now() + t);
        for (task_id, cell) in cells {
            let mut phase = cell.phase.lock().expect("task phase mutex");
            while !phase.is_finished() {
                match deadline {
                    None => phase = cell.cond.wait(phase).expect("task phase mutex"),
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            warn!("timeout waiting for background task {task_id}");
                            return false;
                        }
                        let (guard, _) = cell
                            .cond
                            .wait_timeout(phase, deadline - now)
                            .expect("task phase mutex");
                        phase = guard;
                    }
                }
            }
        }
        true
    }

    /// Stop the worker pool. Already queued jobs still run; with
    /// `wait` the call blocks until the workers have drained and
    /// exited. A later submission starts a fresh pool.
    pub fn shutdown(&self, wait: bool) {
        let workers = {
            let mut workers = self.workers.lock().expect("workers mutex");
            workers.take()
        };
        let Some(Workers { sender, handles }) = workers else {
            return;
        };
        drop(sender);
        if wait {
            for handle in handles {
                let _ = handle.join();
            }
            self.tasks.lock().expect("tasks mutex").clear();
        }
        info!("background cleanup workers shut down (wait: {wait})");
    }
}

impl Drop for BackgroundRunner {
    fn drop(&mut self) {
        self.shutdown(false);
    }
}
