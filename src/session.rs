//! The session manager: child process lifecycle, the connection-file
//! handshake, the serializing shell lock, the in-flight execution registry,
//! the kernel state machine, and the public `start`/`execute`/`interrupt`/
//! `restart`/`shutdown` surface.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::{
    Codec, Content, ExecuteRequest, InterruptRequest, KernelInfoRequest, KernelStatus, Message,
    Reply,
};
use crate::connection::ConnectionInfo;
use crate::events::{Event, EventBus};
use crate::output::Output;
use crate::transport::{IopubListener, RequestSockets};
use crate::{Error, Result};

/// Configuration for a [`Session`], including its timeouts and retry counts.
/// Exposed as fields (rather than hardcoded constants) so tests can shrink
/// the timeouts without waiting out the real defaults.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Path to the kernel's Python (or compatible) interpreter binary.
    pub kernel_bin: PathBuf,
    /// Module passed to `-m` when launching the kernel, e.g.
    /// `"ipykernel_launcher"`.
    pub launcher_module: String,
    /// How many times to poll for the connection file before giving up.
    pub connection_poll_attempts: u32,
    /// Spacing between connection-file polls.
    pub connection_poll_interval: Duration,
    /// Extra delay after the connection file is seen, before reading it.
    pub connection_debounce: Duration,
    /// How long to wait for a `kernel_info_reply` during `start`. Timing out
    /// here is non-fatal; `start` proceeds anyway.
    pub kernel_info_timeout: Duration,
    /// How long to wait for an `execute_request`'s shell reply and matching
    /// idle status.
    pub execute_timeout: Duration,
    /// How often the child-process watcher polls for exit.
    pub process_poll_interval: Duration,
}

impl SessionConfig {
    /// Build a config with the default timeouts for the given kernel binary,
    /// using `ipykernel_launcher` as the launcher module.
    pub fn new(kernel_bin: impl Into<PathBuf>) -> Self {
        SessionConfig {
            kernel_bin: kernel_bin.into(),
            launcher_module: "ipykernel_launcher".to_string(),
            connection_poll_attempts: 50,
            connection_poll_interval: Duration::from_millis(100),
            connection_debounce: Duration::from_millis(100),
            kernel_info_timeout: Duration::from_secs(10),
            execute_timeout: Duration::from_secs(5 * 60),
            process_poll_interval: Duration::from_millis(250),
        }
    }
}

/// The kernel's state machine. `Dead` is terminal until `restart`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelState {
    /// No kernel has been started yet, or the previous one was shut down.
    Disconnected,
    /// `start` is in progress: the process has been spawned but the
    /// handshake is not complete.
    Starting,
    /// Connected and ready for the next request.
    Idle,
    /// Processing a request.
    Busy,
    /// The kernel process exited, or `start`/the handshake failed.
    Dead,
}

/// Result of a completed `execute` call.
#[derive(Clone, Debug)]
pub struct ExecuteOutcome {
    /// The `msg_id` of the `execute_request` that was sent.
    pub msg_id: String,
    /// Every output produced while the kernel processed the request, in
    /// kernel emission order.
    pub outputs: Vec<Output>,
}

/// Bookkeeping for one in-flight `execute` call, live from the moment the
/// request is registered until its idle status resolves or the call times
/// out.
struct ExecutionRecord {
    outputs: Arc<StdMutex<Vec<Output>>>,
    idle_tx: oneshot::Sender<()>,
}

/// Everything that exists only while a kernel process is connected. Built
/// fresh by every `start`, torn down entirely by `shutdown`.
struct Runtime {
    child: Arc<Mutex<tokio::process::Child>>,
    connection_file: PathBuf,
    codec: Codec,
    sockets: Arc<RequestSockets>,
    listener: IopubListener,
    dispatch_handle: tokio::task::JoinHandle<()>,
    watch_cancel: CancellationToken,
}

/// Launches and drives one Jupyter-compatible kernel subprocess.
///
/// At most one kernel process is live per `Session` at a time, and at most
/// one shell request is ever in flight. Clone and share a `Session` across
/// tasks; its internals are already synchronized.
#[derive(Clone)]
pub struct Session {
    config: Arc<SessionConfig>,
    session_id: String,
    state: Arc<StdMutex<KernelState>>,
    execution_count: Arc<AtomicI32>,
    registry: Arc<DashMap<String, ExecutionRecord>>,
    events: EventBus,
    shell_lock: Arc<Mutex<()>>,
    runtime: Arc<RwLock<Option<Runtime>>>,
}

impl Session {
    /// Create a new, unstarted session.
    pub fn new(config: SessionConfig) -> Self {
        Session {
            config: Arc::new(config),
            session_id: Uuid::new_v4().to_string(),
            state: Arc::new(StdMutex::new(KernelState::Disconnected)),
            execution_count: Arc::new(AtomicI32::new(0)),
            registry: Arc::new(DashMap::new()),
            events: EventBus::new(),
            shell_lock: Arc::new(Mutex::new(())),
            runtime: Arc::new(RwLock::new(None)),
        }
    }

    /// The current kernel state.
    pub fn get_state(&self) -> KernelState {
        *self.state.lock().unwrap()
    }

    /// The execution counter last reported by the kernel.
    pub fn get_execution_count(&self) -> i32 {
        self.execution_count.load(Ordering::SeqCst)
    }

    /// Subscribe to this session's event stream. See [`Event`].
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    fn set_state(&self, new_state: KernelState) {
        *self.state.lock().unwrap() = new_state;
        self.events.emit(Event::StateChange(new_state));
    }

    /// Start the kernel process and connect to it.
    ///
    /// Idempotent: calling `start` while already running shuts the existing
    /// kernel down first.
    pub async fn start(&self) -> Result<()> {
        if self.runtime.read().await.is_some() {
            self.shutdown().await;
        }

        self.set_state(KernelState::Starting);

        let connection_file =
            std::env::temp_dir().join(format!("kernel-client-core-{}.json", Uuid::new_v4()));

        let mut command = tokio::process::Command::new(&self.config.kernel_bin);
        command
            .arg("-m")
            .arg(&self.config.launcher_module)
            .arg("-f")
            .arg(&connection_file)
            .kill_on_drop(true);
        if let Some(bin_dir) = self.config.kernel_bin.parent() {
            let mut path = std::ffi::OsString::from(bin_dir);
            if let Some(existing) = std::env::var_os("PATH") {
                path.push(if cfg!(windows) { ";" } else { ":" });
                path.push(existing);
            }
            command.env("PATH", path);
            // Correct for conventional venvs (bin/ or Scripts/ under the
            // prefix); misleading but harmless for system-installed kernels.
            let venv = bin_dir.parent().unwrap_or(bin_dir);
            command.env("VIRTUAL_ENV", venv);
        }

        let child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                self.set_state(KernelState::Dead);
                self.events
                    .emit(Event::Error(format!("failed to spawn kernel: {err}")));
                return Err(Error::Subprocess(err));
            }
        };

        match self.finish_start(child, connection_file).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.set_state(KernelState::Dead);
                self.events.emit(Event::Error(err.to_string()));
                Err(err)
            }
        }
    }

    async fn finish_start(
        &self,
        child: tokio::process::Child,
        connection_file: PathBuf,
    ) -> Result<()> {
        let info = ConnectionInfo::wait_and_read(
            connection_file.to_string_lossy().as_ref(),
            self.config.connection_poll_attempts,
            self.config.connection_poll_interval,
            self.config.connection_debounce,
        )
        .await?;

        let codec = Codec::new(&info.key);
        let sockets = Arc::new(RequestSockets::connect(&info).await?);

        let (tx, rx) = mpsc::unbounded_channel();
        let listener = IopubListener::spawn(&info, codec.clone(), tx).await?;
        let dispatch_handle = tokio::spawn(run_iopub_dispatch(
            rx,
            self.state.clone(),
            self.registry.clone(),
            self.events.clone(),
        ));

        let child = Arc::new(Mutex::new(child));
        let watch_cancel = CancellationToken::new();
        tokio::spawn(watch_child(
            child.clone(),
            self.state.clone(),
            self.events.clone(),
            self.registry.clone(),
            watch_cancel.clone(),
            self.config.process_poll_interval,
        ));

        *self.runtime.write().await = Some(Runtime {
            child,
            connection_file,
            codec,
            sockets,
            listener,
            dispatch_handle,
            watch_cancel,
        });

        let kernel_info_msg = Message::build(
            &self.session_id,
            Content::KernelInfoRequest(KernelInfoRequest {}),
            None,
        );
        let (sockets, codec) = {
            let guard = self.runtime.read().await;
            let runtime = guard.as_ref().expect("just inserted above");
            (runtime.sockets.clone(), runtime.codec.clone())
        };
        let reply = tokio::time::timeout(
            self.config.kernel_info_timeout,
            sockets.call_shell(&codec, &kernel_info_msg),
        )
        .await;
        match reply {
            Ok(Ok(reply)) => {
                if let Content::KernelInfoReply(Reply::Ok(info)) = reply.content {
                    self.events.emit(Event::KernelInfo(info));
                }
            }
            Ok(Err(err)) => warn!("kernel_info_request failed, continuing anyway: {err}"),
            Err(_) => warn!("kernel_info_request timed out, continuing anyway"),
        }

        self.set_state(KernelState::Idle);
        info!("kernel started");
        Ok(())
    }

    /// Run a block of code on the kernel and collect its outputs.
    ///
    /// Calls are totally ordered: the Nth call begins only after the
    /// (N-1)th has resolved or rejected, enforced by [`Session::shell_lock`].
    pub async fn execute(&self, code: &str) -> Result<ExecuteOutcome> {
        let _permit = self.shell_lock.lock().await;

        // Only held long enough to clone the handles `execute` needs; the
        // guard must not span the awaits below or a concurrent `shutdown`
        // (which needs the write lock) would block behind this call for as
        // long as its timeout, instead of being unconditional.
        let (sockets, codec) = {
            let guard = self.runtime.read().await;
            let runtime = guard.as_ref().ok_or(Error::NotStarted)?;
            (runtime.sockets.clone(), runtime.codec.clone())
        };

        let request = Message::build(
            &self.session_id,
            Content::ExecuteRequest(ExecuteRequest::new(code)),
            None,
        );
        let msg_id = request.header.msg_id.clone();

        let (idle_tx, idle_rx) = oneshot::channel();
        let outputs = Arc::new(StdMutex::new(Vec::new()));
        // Register before sending, to avoid a race with fast iopub events.
        self.registry.insert(
            msg_id.clone(),
            ExecutionRecord {
                outputs: outputs.clone(),
                idle_tx,
            },
        );

        let timeout = self.config.execute_timeout;
        let shell_fut = tokio::time::timeout(timeout, sockets.call_shell(&codec, &request));
        let idle_fut = tokio::time::timeout(timeout, idle_rx);

        let (shell_res, idle_res) = tokio::join!(shell_fut, idle_fut);

        let shell_reply = match shell_res {
            Ok(Ok(reply)) => Some(reply),
            Ok(Err(err)) => {
                self.registry.remove(&msg_id);
                return Err(err);
            }
            Err(_) => {
                self.registry.remove(&msg_id);
                return Err(Error::Timeout(format!(
                    "execute_reply for {msg_id} did not arrive in time"
                )));
            }
        };

        match idle_res {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                self.registry.remove(&msg_id);
                return Err(Error::Transport(
                    "session was shut down while the execution was in flight".to_string(),
                ));
            }
            Err(_) => {
                self.registry.remove(&msg_id);
                return Err(Error::Timeout(format!(
                    "idle status for {msg_id} did not arrive in time"
                )));
            }
        }

        if let Some(reply) = shell_reply {
            if let Content::ExecuteReply(Reply::Ok(ok)) = reply.content {
                self.execution_count.store(ok.execution_count, Ordering::SeqCst);
            }
        }

        // The idle dispatch already removed the registry entry; this is a
        // defensive no-op unless that race went the other way.
        self.registry.remove(&msg_id);

        let outputs = outputs.lock().unwrap().clone();
        Ok(ExecuteOutcome { msg_id, outputs })
    }

    /// Interrupt the kernel's current operation.
    ///
    /// Sends an OS interrupt signal to the child process and an
    /// `interrupt_request` on the control channel. Both are best-effort;
    /// either reaching the kernel suffices.
    pub async fn interrupt(&self) -> Result<()> {
        let (child, sockets, codec) = {
            let guard = self.runtime.read().await;
            let runtime = guard.as_ref().ok_or(Error::NotStarted)?;
            (runtime.child.clone(), runtime.sockets.clone(), runtime.codec.clone())
        };

        {
            let child = child.lock().await;
            if let Some(pid) = child.id() {
                signal::interrupt(pid);
            }
        }

        let request = Message::build(
            &self.session_id,
            Content::InterruptRequest(InterruptRequest {}),
            None,
        );
        if let Err(err) = sockets.call_control(&codec, &request).await {
            debug!("interrupt_request on control channel did not complete: {err}");
        }
        Ok(())
    }

    /// Shut down, then start again.
    pub async fn restart(&self) -> Result<()> {
        self.shutdown().await;
        self.start().await
    }

    /// Tear the session down: mark the kernel dead, close every socket,
    /// kill the child process, delete the connection file, and clear the
    /// in-flight execution map.
    ///
    /// Unconditional: any execution still in flight never resolves and its
    /// caller observes a rejected `execute` future.
    pub async fn shutdown(&self) {
        self.set_state(KernelState::Dead);

        let mut guard = self.runtime.write().await;
        if let Some(runtime) = guard.take() {
            runtime.watch_cancel.cancel();
            runtime.listener.stop().await;
            runtime.dispatch_handle.abort();

            let mut child = runtime.child.lock().await;
            let _ = child.kill().await;
            drop(child);

            if let Err(err) = tokio::fs::remove_file(&runtime.connection_file).await {
                debug!("could not remove connection file: {err}");
            }
        }

        self.registry.clear();
    }
}

/// Best-effort OS interrupt delivery to the kernel process.
mod signal {
    #[cfg(unix)]
    #[allow(unsafe_code)]
    pub fn interrupt(pid: u32) {
        // SAFETY: `pid` comes from `tokio::process::Child::id()`, which is
        // `Some` only while the child is alive, and `SIGINT` to a live pid
        // is always a well-defined `kill(2)` call.
        unsafe {
            libc::kill(pid as i32, libc::SIGINT);
        }
    }

    #[cfg(not(unix))]
    pub fn interrupt(_pid: u32) {
        // No portable equivalent; callers fall back to the control-channel
        // interrupt_request sent alongside this call.
    }
}

async fn watch_child(
    child: Arc<Mutex<tokio::process::Child>>,
    state: Arc<StdMutex<KernelState>>,
    events: EventBus,
    registry: Arc<DashMap<String, ExecutionRecord>>,
    cancel: CancellationToken,
    poll_interval: Duration,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(poll_interval) => {
                let exited = {
                    let mut child = child.lock().await;
                    child.try_wait()
                };
                match exited {
                    Ok(Some(status)) => {
                        *state.lock().unwrap() = KernelState::Dead;
                        events.emit(Event::StateChange(KernelState::Dead));
                        events.emit(Event::Error(format!(
                            "kernel process exited unexpectedly: {status}"
                        )));
                        registry.clear();
                        break;
                    }
                    Ok(None) => continue,
                    Err(_) => break,
                }
            }
        }
    }
}

async fn run_iopub_dispatch(
    mut rx: mpsc::UnboundedReceiver<Message>,
    state: Arc<StdMutex<KernelState>>,
    registry: Arc<DashMap<String, ExecutionRecord>>,
    events: EventBus,
) {
    while let Some(msg) = rx.recv().await {
        let parent_msg_id = msg.parent_header.map(|h| h.msg_id);

        match msg.content {
            Content::Status(status) => {
                let new_state = match status.execution_state {
                    KernelStatus::Busy => KernelState::Busy,
                    KernelStatus::Idle => KernelState::Idle,
                    // The kernel's own process-startup broadcast; start()
                    // drives the Starting -> Idle transition itself.
                    KernelStatus::Starting => continue,
                };
                *state.lock().unwrap() = new_state;
                events.emit(Event::StateChange(new_state));

                if new_state == KernelState::Idle {
                    if let Some(parent_id) = &parent_msg_id {
                        if let Some((_, record)) = registry.remove(parent_id) {
                            let _ = record.idle_tx.send(());
                        }
                    }
                }
            }
            // execute_reply only ever arrives on the shell channel.
            Content::ExecuteReply(_) => {}
            other => {
                let output = match other {
                    Content::Stream(s) => Some(Output::from_stream(s)),
                    Content::DisplayData(d) => Output::from_display_data(d),
                    Content::ExecuteResult(r) => Output::from_execute_result(r),
                    Content::Error(e) => Some(Output::from_error(e)),
                    _ => None,
                };
                let Some(output) = output else { continue };

                if let Some(parent_id) = &parent_msg_id {
                    if let Some(record) = registry.get(parent_id) {
                        record.outputs.lock().unwrap().push(output.clone());
                    }
                }
                events.emit(Event::Output { output, parent_msg_id });
            }
        }
    }
}
