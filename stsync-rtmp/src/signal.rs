use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll};

use pin_project::{pin_project, pinned_drop};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

/// The process-wide shutdown triggered by SIGINT/SIGTERM.
pub static SHUTDOWN: Shutdown = Shutdown::new();

/// A future that resolves once shutdown has been requested.
///
/// Every live listener keeps [`Shutdown::wait`] pending, so tasks hold one for as long as they
/// own resources that must be released before the process exits.
#[pin_project(PinnedDrop)]
pub struct ShutdownListener {
    shutdown: &'static Shutdown,
    #[pin]
    notify: Notified<'static>,
}

impl ShutdownListener {
    #[inline]
    pub fn in_progress(&self) -> bool {
        self.shutdown.in_progress()
    }
}

impl Future for ShutdownListener {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.in_progress() {
            return Poll::Ready(());
        }

        self.project().notify.poll(cx)
    }
}

#[pinned_drop]
impl PinnedDrop for ShutdownListener {
    #[inline]
    fn drop(self: Pin<&mut Self>) {
        self.shutdown.dec();
    }
}

#[derive(Debug)]
pub struct Shutdown {
    in_progress: AtomicBool,
    counter: AtomicUsize,
    notify_shutdown: Notify,
    notify_done: Notify,
}

impl Shutdown {
    pub const fn new() -> Self {
        Self {
            in_progress: AtomicBool::new(false),
            counter: AtomicUsize::new(0),
            notify_shutdown: Notify::const_new(),
            notify_done: Notify::const_new(),
        }
    }

    #[inline]
    pub fn in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Returns the number of live listeners.
    #[inline]
    pub fn listeners(&self) -> usize {
        self.counter.load(Ordering::Acquire)
    }

    #[inline]
    fn inc(&self) {
        self.counter.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    fn dec(&self) {
        let prev = self.counter.fetch_sub(1, Ordering::AcqRel);

        if self.in_progress() && prev == 1 {
            self.notify_done.notify_waiters();
        }
    }

    #[inline]
    pub fn listen(&'static self) -> ShutdownListener {
        self.inc();

        ShutdownListener {
            shutdown: self,
            notify: self.notify_shutdown.notified(),
        }
    }

    /// Requests shutdown. All current and future listeners resolve immediately.
    pub fn trigger(&self) {
        self.in_progress.store(true, Ordering::Release);
        self.notify_shutdown.notify_waiters();

        if self.listeners() == 0 {
            self.notify_done.notify_waiters();
        }

        tracing::info!("Waiting on {} listeners", self.listeners());
    }

    /// Waits until shutdown was triggered and all listeners have been dropped.
    pub async fn wait(&self) {
        loop {
            // Register before checking the state, a notification between the check and the
            // await would be lost otherwise.
            let done = self.notify_done.notified();

            if self.in_progress() && self.listeners() == 0 {
                return;
            }

            done.await;
        }
    }
}

impl Default for Shutdown {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/// Starts listening for SIGINT/SIGTERM. Must be called from within a tokio runtime.
///
/// Signals are received as streams on a spawned task, nothing runs in the signal handler
/// itself.
pub fn init() {
    #[cfg(unix)]
    unix::init();

    #[cfg(not(unix))]
    tokio::task::spawn(async {
        while tokio::signal::ctrl_c().await.is_ok() {
            terminate();
        }
    });
}

/// Signal entry point. A second signal while shutting down exits immediately.
pub fn terminate() {
    if SHUTDOWN.in_progress() {
        tracing::info!("SIGKILL");
        std::process::exit(0);
    }

    SHUTDOWN.trigger();
}

#[cfg(unix)]
mod unix {
    use tokio::signal::unix::{signal, SignalKind};

    pub(super) fn init() {
        for (name, kind) in [
            ("SIGINT", SignalKind::interrupt()),
            ("SIGTERM", SignalKind::terminate()),
        ] {
            // Registered before spawning so that signals arriving before the task is first
            // polled are not missed.
            let mut stream = match signal(kind) {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::warn!("Failed to install {} handler: {}", name, err);
                    continue;
                }
            };

            tokio::task::spawn(async move {
                while stream.recv().await.is_some() {
                    tracing::info!("Received {}", name);
                    super::terminate();
                }
            });
        }
    }
}
