//! Coordinated process shutdown.
//!
//! Operations that must not be interrupted halfway, such as starting a child
//! process and recording that it started, run inside a critical section. Any
//! number of critical sections may be active at once. On a shutdown signal
//! the coordinator waits for all active critical sections to finish, blocks
//! new ones from starting, runs every registered handler and then lets the
//! process exit.
//!
//! The coordinator is constructed once by the driver and handed to each
//! backend; there is no global instance.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Why the process is shutting down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// An OS signal, by name.
    Signal(&'static str),
    /// The program asked to terminate itself.
    Requested { success: bool },
}

impl ShutdownReason {
    /// Process exit status for this reason.
    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownReason::Requested { success: true } => 0,
            _ => 1,
        }
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Signal(name) => write!(f, "Caught signal {}", name),
            ShutdownReason::Requested { success: true } => write!(f, "Shutting down"),
            ShutdownReason::Requested { success: false } => write!(f, "Shutting down after failure"),
        }
    }
}

/// Cleanup work to run before the process exits on shutdown.
///
/// Handlers run after all critical sections have completed. Entering a
/// critical section from a handler deadlocks.
pub trait ShutdownHandler: Send + Sync {
    fn handle_shutdown(&self, reason: &ShutdownReason);
}

/// Reader/writer gate between critical sections and shutdown.
pub struct ShutdownCoordinator {
    gate: RwLock<()>,
    handlers: Mutex<Vec<Arc<dyn ShutdownHandler>>>,
    shutting_down: AtomicBool,
    notify_tx: broadcast::Sender<ShutdownReason>,
    request_tx: mpsc::UnboundedSender<ShutdownReason>,
    request_rx: Mutex<Option<mpsc::UnboundedReceiver<ShutdownReason>>>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (notify_tx, _) = broadcast::channel(1);
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        Self {
            gate: RwLock::new(()),
            handlers: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
            notify_tx,
            request_tx,
            request_rx: Mutex::new(Some(request_rx)),
        }
    }

    /// Enters a critical section, which lasts until the guard is dropped.
    ///
    /// Waits if a shutdown is in progress. Since the gate is fair, once a
    /// shutdown is waiting no new critical section is admitted, so after
    /// shutdown begins this never returns.
    ///
    /// Critical sections must not nest.
    pub async fn enter_critical_section(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read().await
    }

    /// Registers a handler to run on shutdown.
    pub fn register(&self, handler: Arc<dyn ShutdownHandler>) {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }

    /// Subscribes to shutdown notifications, sent after the handlers ran.
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.notify_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Asks the signal listener to shut the process down.
    pub fn terminate(&self, success: bool) {
        info!("Shutting down.");
        if self
            .request_tx
            .send(ShutdownReason::Requested { success })
            .is_err()
        {
            warn!("Shutdown listener is gone");
        }
    }

    /// Waits for active critical sections, then runs all handlers.
    ///
    /// The returned guard keeps new critical sections out for as long as it
    /// is held.
    pub async fn shutdown(&self, reason: ShutdownReason) -> RwLockWriteGuard<'_, ()> {
        self.shutting_down.store(true, Ordering::SeqCst);
        let guard = self.gate.write().await;
        let handlers: Vec<_> = self
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for handler in handlers {
            handler.handle_shutdown(&reason);
        }
        let _ = self.notify_tx.send(reason);
        guard
    }

    /// Waits for a handled signal or a [`terminate`](Self::terminate)
    /// request, then performs the shutdown.
    ///
    /// Handles SIGINT, SIGTERM, SIGUSR1, SIGUSR2 and SIGHUP. SIGHUP is left
    /// alone if the process was started with it ignored, as under `nohup`.
    pub async fn wait_for_shutdown(&self) -> std::io::Result<(ShutdownReason, RwLockWriteGuard<'_, ()>)> {
        let mut requests = self
            .request_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| std::io::Error::other("shutdown listener already running"))?;
        let reason = signals::wait(&mut requests).await?;
        if let ShutdownReason::Signal(_) = reason {
            error!("{}", reason);
        }
        let guard = self.shutdown(reason.clone()).await;
        Ok((reason, guard))
    }

    /// Spawns a task which exits the process once a shutdown completes.
    pub fn spawn_signal_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.wait_for_shutdown().await {
                Ok((reason, _guard)) => std::process::exit(reason.exit_code()),
                Err(e) => error!(error = %e, "Could not install signal handlers"),
            }
        })
    }
}

#[cfg(unix)]
mod signals {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    use tokio::signal::unix::{signal, SignalKind};
    use tokio::sync::mpsc;

    use super::ShutdownReason;

    /// Whether SIGHUP was ignored when the process started.
    fn sighup_ignored() -> bool {
        let probe = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        // SAFETY: installs SIG_IGN and immediately restores the previous
        // disposition; no handler function is involved.
        match unsafe { sigaction(Signal::SIGHUP, &probe) } {
            Ok(old) => {
                let _ = unsafe { sigaction(Signal::SIGHUP, &old) };
                matches!(old.handler(), SigHandler::SigIgn)
            }
            Err(_) => false,
        }
    }

    pub(super) async fn wait(
        requests: &mut mpsc::UnboundedReceiver<ShutdownReason>,
    ) -> std::io::Result<ShutdownReason> {
        let mut hangup = if sighup_ignored() {
            None
        } else {
            Some(signal(SignalKind::hangup())?)
        };
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut usr1 = signal(SignalKind::user_defined1())?;
        let mut usr2 = signal(SignalKind::user_defined2())?;

        let hup = async {
            match hangup.as_mut() {
                Some(s) => s.recv().await,
                None => std::future::pending().await,
            }
        };

        let reason = tokio::select! {
            _ = interrupt.recv() => ShutdownReason::Signal("SIGINT"),
            _ = hup => ShutdownReason::Signal("SIGHUP"),
            _ = terminate.recv() => ShutdownReason::Signal("SIGTERM"),
            _ = usr1.recv() => ShutdownReason::Signal("SIGUSR1"),
            _ = usr2.recv() => ShutdownReason::Signal("SIGUSR2"),
            req = requests.recv() => req.unwrap_or(ShutdownReason::Requested { success: false }),
        };
        Ok(reason)
    }
}

#[cfg(not(unix))]
mod signals {
    use tokio::sync::mpsc;

    use super::ShutdownReason;

    pub(super) async fn wait(
        requests: &mut mpsc::UnboundedReceiver<ShutdownReason>,
    ) -> std::io::Result<ShutdownReason> {
        let reason = tokio::select! {
            r = tokio::signal::ctrl_c() => { r?; ShutdownReason::Signal("SIGINT") }
            req = requests.recv() => req.unwrap_or(ShutdownReason::Requested { success: false }),
        };
        Ok(reason)
    }
}
