use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};

pub const NSEC_PER_SEC: u64 = 1_000_000_000;
pub const USEC_PER_SEC: u64 = 1_000_000;

/// Source of local time ticks shared by every output and stream.
pub trait LocalClock: Send + Sync + Debug {
    fn local_time(&self) -> i64;
    fn local_freq(&self) -> u64;
}

/// CLOCK_MONOTONIC in nanoseconds, the same timebase ALSA uses for its
/// hardware timestamps.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl LocalClock for MonotonicClock {
    fn local_time(&self) -> i64 {
        match nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
            Ok(ts) => ts.tv_sec() as i64 * NSEC_PER_SEC as i64 + ts.tv_nsec() as i64,
            Err(_) => 0,
        }
    }

    fn local_freq(&self) -> u64 {
        NSEC_PER_SEC
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
    freq: u64,
}

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
            freq: NSEC_PER_SEC,
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, ticks: i64) {
        self.now.fetch_add(ticks, Ordering::SeqCst);
    }

    pub fn advance_usec(&self, usec: u64) {
        let ticks = usec as i128 * self.freq as i128 / USEC_PER_SEC as i128;
        self.advance(ticks as i64);
    }
}

impl LocalClock for ManualClock {
    fn local_time(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }

    fn local_freq(&self) -> u64 {
        self.freq
    }
}

/// Maps values between two linear timelines:
/// `b = b_zero + (a - a_zero) * numer / denom`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinearTransform {
    pub a_zero: i64,
    pub b_zero: i64,
    pub a_to_b_numer: u64,
    pub a_to_b_denom: u64,
}

impl LinearTransform {
    pub fn new(numer: u64, denom: u64) -> Self {
        let (a_to_b_numer, a_to_b_denom) = reduce(numer, denom);
        Self {
            a_zero: 0,
            b_zero: 0,
            a_to_b_numer,
            a_to_b_denom,
        }
    }

    pub fn with_origin(mut self, a_zero: i64, b_zero: i64) -> Self {
        self.a_zero = a_zero;
        self.b_zero = b_zero;
        self
    }

    /// Returns `None` when the ratio is degenerate or the result overflows.
    pub fn forward(&self, a: i64) -> Option<i64> {
        if self.a_to_b_denom == 0 {
            return None;
        }
        let delta = (a as i128 - self.a_zero as i128).checked_mul(self.a_to_b_numer as i128)?
            / self.a_to_b_denom as i128;
        i64::try_from(delta + self.b_zero as i128).ok()
    }

    pub fn reverse(&self, b: i64) -> Option<i64> {
        if self.a_to_b_numer == 0 {
            return None;
        }
        let delta = (b as i128 - self.b_zero as i128).checked_mul(self.a_to_b_denom as i128)?
            / self.a_to_b_numer as i128;
        i64::try_from(delta + self.a_zero as i128).ok()
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

pub fn reduce(numer: u64, denom: u64) -> (u64, u64) {
    if numer == 0 || denom == 0 {
        return (numer, denom);
    }
    let g = gcd(numer, denom);
    (numer / g, denom / g)
}
