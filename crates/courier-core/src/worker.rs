//! Workers: the monitor side of task supervision.
//!
//! Both variants run the same outer loop: dequeue, hand the task to a
//! child process, wait for the reply frame, the child's death or the task
//! deadline (whichever comes first), classify, invoke the matching
//! handler, release. The load-bearing rule throughout: release happens in
//! the child on the happy path, in the monitor on every other path, and is
//! idempotent so the overlap is harmless.
//!
//! [`SpawnedWorker`] starts a fresh child per task; [`PersistentWorker`]
//! keeps one child alive across tasks and respawns lazily after a kill.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::child::{ChildMode, ENV_MODE, ENV_QUEUE, ENV_STORE_URL};
use crate::codec::TaskCodec;
use crate::config::WorkerConfig;
use crate::error::CourierError;
use crate::outcome::{TaskFailure, TaskOutcome};
use crate::pipe;
use crate::queue::Queue;
use crate::task::Task;

/// Called on observed success. Runs in the monitor process.
pub type SuccessHandler = Arc<dyn Fn(&Task) + Send + Sync>;

/// Called on observed failure with the kill signal (if the child was
/// killed) and the task failure (if one was reported); at least one of the
/// two is populated. Runs in the monitor process.
pub type ErrorHandler = Arc<dyn Fn(&Task, Option<i32>, Option<&TaskFailure>) + Send + Sync>;

const DEQUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Callbacks {
    on_success: Option<SuccessHandler>,
    on_error: Option<ErrorHandler>,
}

impl Callbacks {
    // Handlers may panic; the monitor logs and carries on.
    fn success(&self, task: &Task) {
        let Some(handler) = self.on_success.as_deref() else {
            return;
        };
        let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(task)));
        if caught.is_err() {
            warn!(id = task.id, "success handler panicked");
        }
    }

    fn error(&self, task: &Task, kill_signal: Option<i32>, failure: Option<&TaskFailure>) {
        let Some(handler) = self.on_error.as_deref() else {
            return;
        };
        let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            handler(task, kill_signal, failure)
        }));
        if caught.is_err() {
            warn!(id = task.id, "error handler panicked");
        }
    }
}

/// A spawned child runner plus the two pipe ends the monitor talks to.
struct ChildProc {
    child: Child,
    pid: u32,
    stdin: Option<ChildStdin>,
    stdout: Option<BufReader<ChildStdout>>,
}

impl ChildProc {
    fn spawn(mode: ChildMode, queue_name: &str, config: &WorkerConfig) -> Result<Self, CourierError> {
        let exe = std::env::current_exe().map_err(CourierError::Spawn)?;
        let mut child = Command::new(exe)
            .env(ENV_MODE, mode.as_str())
            .env(ENV_QUEUE, queue_name)
            .env(ENV_STORE_URL, &config.store_url)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            // the monitor must never exit leaving a live child behind
            .kill_on_drop(true)
            .spawn()
            .map_err(CourierError::Spawn)?;

        let pid = child
            .id()
            .ok_or_else(|| CourierError::Child("spawned child has no pid".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CourierError::Child("spawned child has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CourierError::Child("spawned child has no stdout".into()))?;

        info!(pid, mode = mode.as_str(), "spawned child runner");
        Ok(Self {
            child,
            pid,
            stdin: Some(stdin),
            stdout: Some(BufReader::new(stdout)),
        })
    }

    fn soft_kill(&self) {
        debug!(pid = self.pid, "sending SIGTERM to child");
        // best effort; the child may already be gone
        unsafe {
            libc::kill(self.pid as libc::pid_t, libc::SIGTERM);
        }
    }

    fn hard_kill(&mut self) {
        debug!(pid = self.pid, "sending SIGKILL to child");
        let _ = self.child.start_kill();
    }
}

/// Where a supervision cycle ended.
enum CycleEnd {
    /// The child reported a result; it may still be running.
    Reply(TaskOutcome),
    /// The child died first (timeout kill, crash, external signal).
    Exited(ExitStatus),
}

enum KillPhase {
    Running,
    SoftKilled,
    HardKilled,
}

/// One step of the supervision select loop.
enum Event {
    Reply(Result<(std::io::Result<Option<Vec<u8>>>, BufReader<ChildStdout>), tokio::task::JoinError>),
    Exited(std::io::Result<ExitStatus>),
    Deadline,
}

/// The supervision core shared by both worker variants.
struct Supervisor {
    queue: Arc<Queue>,
    config: WorkerConfig,
    callbacks: Callbacks,
}

impl Supervisor {
    /// Feed one task to the child and see the cycle through: result or
    /// death, with SIGTERM at the task deadline and SIGKILL `kill_grace`
    /// later. Ends with handlers invoked and the task released. Returns
    /// whether the child survived and can take another task.
    async fn supervise(&self, child: &mut ChildProc, task: &Task, mode: ChildMode) -> bool {
        let timeout = task.timeout_or(self.config.default_timeout);
        let deadline = Instant::now() + timeout;
        let kill_deadline = deadline + self.config.kill_grace;

        if !self.send_task(child, task, deadline).await {
            return self.abort_cycle(
                child,
                task,
                TaskFailure::new("failed to deliver task to child"),
            )
            .await;
        }
        if mode == ChildMode::Oneshot {
            // one frame is all this child gets; EOF backs up the protocol
            child.stdin = None;
        }

        let Some(stdout) = child.stdout.take() else {
            return self.abort_cycle(child, task, TaskFailure::new("child stdout was lost")).await;
        };
        let mut reply: Option<JoinHandle<(std::io::Result<Option<Vec<u8>>>, _)>> =
            Some(tokio::spawn(async move {
                let mut reader = stdout;
                let result = pipe::read_frame(&mut reader).await;
                (result, reader)
            }));

        let mut phase = KillPhase::Running;
        // (how the cycle ended, whether the child is still alive)
        let (end, alive) = loop {
            let sleep_target = match phase {
                KillPhase::Running => deadline,
                _ => kill_deadline,
            };
            let event = tokio::select! {
                joined = async { reply.as_mut().expect("reply branch gated on is_some").await },
                    if reply.is_some() => Event::Reply(joined),
                status = child.child.wait() => Event::Exited(status),
                _ = tokio::time::sleep_until(sleep_target),
                    if !matches!(phase, KillPhase::HardKilled) => Event::Deadline,
            };

            match event {
                Event::Reply(Ok((Ok(Some(bytes)), reader))) => {
                    child.stdout = Some(reader);
                    match serde_json::from_slice::<TaskOutcome>(&bytes) {
                        Ok(outcome) => break (CycleEnd::Reply(outcome), true),
                        Err(e) => {
                            warn!(pid = child.pid, error = %e, "malformed result frame");
                            return self
                                .abort_cycle(
                                    child,
                                    task,
                                    TaskFailure::new(format!("malformed result frame: {e}")),
                                )
                                .await;
                        }
                    }
                }
                Event::Reply(Ok((Ok(None), _)) | Ok((Err(_), _)) | Err(_)) => {
                    // stdout closed with no reply: the child is on its way
                    // out; keep waiting for the exit status
                    reply = None;
                }
                Event::Exited(Ok(status)) => {
                    // The child is gone, but a reply it wrote just before
                    // exiting may still sit in the pipe buffer. A reply
                    // that made it out beats the exit status.
                    if let Some(outcome) = self.drain_reply(child, reply.take()).await {
                        break (CycleEnd::Reply(outcome), false);
                    }
                    break (CycleEnd::Exited(status), false);
                }
                Event::Exited(Err(e)) => {
                    error!(pid = child.pid, error = %e, "waiting for child failed");
                    return self
                        .abort_cycle(
                            child,
                            task,
                            TaskFailure::new(format!("waiting for child failed: {e}")),
                        )
                        .await;
                }
                Event::Deadline => match phase {
                    KillPhase::Running => {
                        info!(
                            id = task.id,
                            pid = child.pid,
                            timeout_ms = timeout.as_millis() as u64,
                            "task ran out of time, soft-killing child"
                        );
                        child.soft_kill();
                        phase = KillPhase::SoftKilled;
                    }
                    KillPhase::SoftKilled => {
                        warn!(id = task.id, pid = child.pid, "child survived SIGTERM, hard-killing");
                        child.hard_kill();
                        phase = KillPhase::HardKilled;
                    }
                    KillPhase::HardKilled => unreachable!("deadline branch disabled after SIGKILL"),
                },
            }
        };

        match end {
            CycleEnd::Reply(TaskOutcome::Ok { .. }) => {
                debug!(id = task.id, "task succeeded");
                self.callbacks.success(task);
            }
            CycleEnd::Reply(TaskOutcome::Err { failure }) => {
                warn!(id = task.id, error = %failure, "task failed");
                self.callbacks.error(task, None, Some(&failure));
            }
            CycleEnd::Exited(status) => {
                self.classify_exit(task, status);
            }
        }

        // The child released on the happy path; this is the safety net for
        // every other path, and double release is a no-op.
        self.release(task).await;
        alive
    }

    /// Collect a reply the dead child may have left in the pipe buffer.
    /// The reader sees buffered data or EOF, so this resolves promptly;
    /// the timeout is a backstop.
    async fn drain_reply(
        &self,
        child: &mut ChildProc,
        reply: Option<JoinHandle<(std::io::Result<Option<Vec<u8>>>, BufReader<ChildStdout>)>>,
    ) -> Option<TaskOutcome> {
        let handle = reply?;
        match tokio::time::timeout(Duration::from_millis(200), handle).await {
            Ok(Ok((Ok(Some(bytes)), reader))) => {
                child.stdout = Some(reader);
                match serde_json::from_slice::<TaskOutcome>(&bytes) {
                    Ok(outcome) => Some(outcome),
                    Err(e) => {
                        warn!(pid = child.pid, error = %e, "malformed result frame from exited child");
                        None
                    }
                }
            }
            _ => None,
        }
    }

    /// Deliver the task frame, bounded by the task deadline so a wedged
    /// child cannot stall the monitor.
    async fn send_task(&self, child: &mut ChildProc, task: &Task, deadline: Instant) -> bool {
        let blob = match task.raw() {
            Some(raw) => raw.to_vec(),
            None => match self.queue.codec().encode(task) {
                Ok(blob) => blob,
                Err(e) => {
                    error!(id = task.id, error = %e, "encode task failed");
                    return false;
                }
            },
        };
        let Some(stdin) = child.stdin.as_mut() else {
            return false;
        };
        match tokio::time::timeout_at(deadline, pipe::write_frame(stdin, &blob)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(pid = child.pid, id = task.id, error = %e, "failed to deliver task to child");
                false
            }
            Err(_) => {
                warn!(pid = child.pid, id = task.id, "timed out delivering task to child");
                false
            }
        }
    }

    /// Kill and reap the child, report the failure, release the task.
    /// Always returns false: the child is gone.
    async fn abort_cycle(&self, child: &mut ChildProc, task: &Task, failure: TaskFailure) -> bool {
        child.hard_kill();
        if let Err(e) = child.child.wait().await {
            error!(pid = child.pid, error = %e, "reaping killed child failed");
        }
        self.callbacks.error(task, None, Some(&failure));
        self.release(task).await;
        false
    }

    fn classify_exit(&self, task: &Task, status: ExitStatus) {
        use std::os::unix::process::ExitStatusExt;

        if let Some(signal) = status.signal() {
            // our timeout kill and external kills look the same here
            warn!(id = task.id, signal, "child was killed");
            self.callbacks.error(task, Some(signal), None);
        } else {
            let code = status.code().unwrap_or(-1);
            warn!(id = task.id, code, "child exited without reporting a result");
            let failure =
                TaskFailure::new(format!("child exited with status {code} before reporting a result"));
            self.callbacks.error(task, None, Some(&failure));
        }
    }

    async fn release(&self, task: &Task) {
        if let Err(e) = self.queue.release(task).await {
            error!(id = task.id, error = %e, "release failed");
        }
    }

    /// Wait out a child that already replied; it only has a release left
    /// to do. A child that lingers past `kill_grace` gets killed.
    async fn reap(&self, child: &mut ChildProc) {
        match tokio::time::timeout(self.config.kill_grace, child.child.wait()).await {
            Ok(Ok(status)) => debug!(pid = child.pid, %status, "child exited"),
            Ok(Err(e)) => error!(pid = child.pid, error = %e, "reaping child failed"),
            Err(_) => {
                warn!(pid = child.pid, "child lingered after its task, killing it");
                child.hard_kill();
                let _ = child.child.wait().await;
            }
        }
    }

    /// Dequeue with backoff on store errors. `None` on an empty wait or
    /// when shutdown was requested during the backoff.
    async fn next_task(&self, shutdown: &mut watch::Receiver<bool>) -> Option<Task> {
        match self.queue.dequeue(self.config.dequeue_wait).await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "dequeue failed, backing off");
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(DEQUEUE_ERROR_BACKOFF) => {}
                }
                None
            }
        }
    }
}

/// Worker that spawns a fresh child runner for every task.
pub struct SpawnedWorker {
    sup: Supervisor,
}

impl SpawnedWorker {
    pub fn new(queue: Arc<Queue>, config: WorkerConfig) -> Self {
        Self {
            sup: Supervisor {
                queue,
                config,
                callbacks: Callbacks::default(),
            },
        }
    }

    pub fn on_success(mut self, handler: impl Fn(&Task) + Send + Sync + 'static) -> Self {
        self.sup.callbacks.on_success = Some(Arc::new(handler));
        self
    }

    pub fn on_error(
        mut self,
        handler: impl Fn(&Task, Option<i32>, Option<&TaskFailure>) + Send + Sync + 'static,
    ) -> Self {
        self.sup.callbacks.on_error = Some(Arc::new(handler));
        self
    }

    /// Run until the shutdown flag flips. The current supervision cycle
    /// always completes first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(queue = self.sup.queue.name(), "starting spawned worker");
        // shutdown が来ていたら新しいタスクを取らない
        while !*shutdown.borrow() {
            let Some(task) = self.sup.next_task(&mut shutdown).await else {
                continue;
            };
            let mut child =
                match ChildProc::spawn(ChildMode::Oneshot, self.sup.queue.name(), &self.sup.config)
                {
                    Ok(child) => child,
                    Err(e) => {
                        // the task stays in-flight; the sweeper will bring
                        // it back after its timeout
                        error!(id = task.id, error = %e, "spawning child runner failed");
                        continue;
                    }
                };
            if self.sup.supervise(&mut child, &task, ChildMode::Oneshot).await {
                self.sup.reap(&mut child).await;
            }
        }
        info!(queue = self.sup.queue.name(), "spawned worker stopped");
    }
}

/// Worker that keeps one child runner alive across tasks, respawning
/// lazily after the child is killed or dies.
pub struct PersistentWorker {
    sup: Supervisor,
    child: Option<ChildProc>,
}

impl PersistentWorker {
    pub fn new(queue: Arc<Queue>, config: WorkerConfig) -> Self {
        Self {
            sup: Supervisor {
                queue,
                config,
                callbacks: Callbacks::default(),
            },
            child: None,
        }
    }

    pub fn on_success(mut self, handler: impl Fn(&Task) + Send + Sync + 'static) -> Self {
        self.sup.callbacks.on_success = Some(Arc::new(handler));
        self
    }

    pub fn on_error(
        mut self,
        handler: impl Fn(&Task, Option<i32>, Option<&TaskFailure>) + Send + Sync + 'static,
    ) -> Self {
        self.sup.callbacks.on_error = Some(Arc::new(handler));
        self
    }

    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(queue = self.sup.queue.name(), "starting persistent worker");
        while !*shutdown.borrow() {
            let Some(task) = self.sup.next_task(&mut shutdown).await else {
                continue;
            };
            if self.child.is_none() {
                match ChildProc::spawn(
                    ChildMode::Persistent,
                    self.sup.queue.name(),
                    &self.sup.config,
                ) {
                    Ok(child) => self.child = Some(child),
                    Err(e) => {
                        error!(id = task.id, error = %e, "spawning child runner failed");
                        continue;
                    }
                }
            }
            let child = self.child.as_mut().expect("child spawned above");
            if !self.sup.supervise(child, &task, ChildMode::Persistent).await {
                // killed or dead, already reaped; respawn on the next task
                self.child = None;
            }
        }
        self.shutdown_child().await;
        info!(queue = self.sup.queue.name(), "persistent worker stopped");
    }

    /// Hang up the task channel so the idle child exits on EOF; kill it if
    /// it does not.
    async fn shutdown_child(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        child.stdin = None;
        self.sup.reap(&mut child).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn callbacks_survive_a_panicking_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let callbacks = Callbacks {
            on_success: Some(Arc::new(move |_task| {
                seen.fetch_add(1, Ordering::SeqCst);
                panic!("handler blew up");
            })),
            on_error: None,
        };

        let task = Task::new("noop");
        callbacks.success(&task);
        callbacks.success(&task);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn error_callback_receives_signal_and_failure() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callbacks = Callbacks {
            on_success: None,
            on_error: Some(Arc::new(move |_task, signal, failure| {
                sink.lock()
                    .unwrap()
                    .push((signal, failure.map(|f| f.message.clone())));
            })),
        };

        let task = Task::new("noop");
        callbacks.error(&task, Some(9), None);
        callbacks.error(&task, None, Some(&TaskFailure::new("boom")));

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], (Some(9), None));
        assert_eq!(seen[1], (None, Some("boom".to_string())));
    }

    #[test]
    fn missing_callbacks_are_a_no_op() {
        let callbacks = Callbacks::default();
        let task = Task::new("noop");
        callbacks.success(&task);
        callbacks.error(&task, None, Some(&TaskFailure::new("ignored")));
    }
}
