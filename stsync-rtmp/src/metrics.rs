use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counters shared by the acceptor and all connection tasks.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    pub connections_accepted: Counter,
    pub accept_errors: Counter,
    pub handshakes_completed: Counter,
    pub handshakes_failed: Counter,
    pub connections_active: Gauge,
}

impl ServerMetrics {
    pub const fn new() -> Self {
        Self {
            connections_accepted: Counter::new(),
            accept_errors: Counter::new(),
            handshakes_completed: Counter::new(),
            handshakes_failed: Counter::new(),
            connections_active: Gauge::new(),
        }
    }
}

impl Display for ServerMetrics {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "accepted={} accept_errors={} completed={} failed={} active={}",
            self.connections_accepted,
            self.accept_errors,
            self.handshakes_completed,
            self.handshakes_failed,
            self.connections_active,
        )
    }
}

/// An increasing counter.
#[derive(Debug, Default)]
#[repr(transparent)]
pub struct Counter(AtomicUsize);

impl Counter {
    #[inline]
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    #[inline]
    pub fn add(&self, n: usize) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc(&self) {
        self.add(1);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

impl Display for Counter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.get().fmt(f)
    }
}

/// A value that goes up and down, e.g. the number of open connections.
#[derive(Debug, Default)]
#[repr(transparent)]
pub struct Gauge(AtomicUsize);

impl Gauge {
    #[inline]
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    #[inline]
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

impl Display for Gauge {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.get().fmt(f)
    }
}
