//! Time-based decay of free pages.
//!
//! Pages freed into a tier are not purged right away. Instead, the decay
//! engine remembers how many pages became free in each of the last
//! [`NSTEPS`] epochs and lets a smoothly shrinking fraction of each epoch's
//! pages stay around: all of the newest epoch's, almost none of the oldest's.
//! Once a full decay time has passed, every page freed before it has been
//! allowed to go.
//!
//! The engine only computes limits; the page allocator does the purging.

use core::fmt;
use core::str::FromStr;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::error::AllocError;

/// Number of epochs in one decay period.
pub const NSTEPS: usize = 200;
/// Bits of fraction in the kernel weights.
const WEIGHT_BITS: u32 = 24;
/// Largest decay time in milliseconds; times past this cannot be represented
/// in nanoseconds.
pub const DECAY_MS_MAX: u64 = u64::MAX / 1_000_000;

/// How long freed pages may linger before they are purged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecayTime {
    /// Never purge.
    Never,
    /// Purge as soon as pages are freed.
    Immediate,
    /// Purge over this many milliseconds.
    Millis(u64),
}

impl DecayTime {
    /// Interpret a millisecond count: -1 is `Never`, 0 is `Immediate`.
    pub fn from_millis(ms: i64) -> Result<Self, AllocError> {
        match ms {
            -1 => Ok(DecayTime::Never),
            0 => Ok(DecayTime::Immediate),
            ms if ms > 0 && (ms as u64) <= DECAY_MS_MAX => Ok(DecayTime::Millis(ms as u64)),
            ms => Err(AllocError::InvalidDecayTime(ms)),
        }
    }

    /// Millisecond count, saturating at `i64::MAX` for out-of-range times.
    pub fn as_millis(self) -> i64 {
        match self {
            DecayTime::Never => -1,
            DecayTime::Immediate => 0,
            DecayTime::Millis(ms) => i64::try_from(ms).unwrap_or(i64::MAX),
        }
    }

    /// Reject `Millis` values that `from_millis` would not produce.
    pub fn validate(self) -> Result<Self, AllocError> {
        match self {
            DecayTime::Millis(ms) if ms == 0 || ms > DECAY_MS_MAX => {
                Err(AllocError::InvalidDecayTime(self.as_millis()))
            }
            time => Ok(time),
        }
    }
}

impl fmt::Display for DecayTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_millis())
    }
}

/// The curve used to weigh past epochs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DecayKernel {
    Linear,
    Smoothstep,
    #[default]
    Smootherstep,
}

impl DecayKernel {
    fn eval(self, x: f64) -> f64 {
        match self {
            DecayKernel::Linear => x,
            DecayKernel::Smoothstep => x * x * (3.0 - 2.0 * x),
            DecayKernel::Smootherstep => x * x * x * (x * (x * 6.0 - 15.0) + 10.0),
        }
    }

    /// Weights for each ring slot, oldest first, in 24-bit fixed point.
    pub fn weights(self) -> [u64; NSTEPS] {
        let mut weights = [0u64; NSTEPS];
        for (i, w) in weights.iter_mut().enumerate() {
            let x = (i + 1) as f64 / NSTEPS as f64;
            *w = (self.eval(x) * (1u64 << WEIGHT_BITS) as f64).round() as u64;
        }
        weights
    }
}

impl FromStr for DecayKernel {
    type Err = AllocError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" => Ok(DecayKernel::Linear),
            "smoothstep" => Ok(DecayKernel::Smoothstep),
            "smootherstep" => Ok(DecayKernel::Smootherstep),
            _ => Err(AllocError::config("decay_kernel", format!("unknown kernel {:?}", s))),
        }
    }
}

impl fmt::Display for DecayKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DecayKernel::Linear => "linear",
            DecayKernel::Smoothstep => "smoothstep",
            DecayKernel::Smootherstep => "smootherstep",
        };
        f.write_str(name)
    }
}

/// Decay state for one tier of one arena.
pub struct Decay {
    time: DecayTime,
    kernel: DecayKernel,
    weights: [u64; NSTEPS],
    /// Epoch length in nanoseconds.
    interval: u64,
    epoch: u64,
    deadline: u64,
    /// Pages newly freed in each epoch, oldest first.
    backlog: [usize; NSTEPS],
    backlog_limit: usize,
    /// Tier size at the start of the current epoch, less pages purged since.
    nunpurged: usize,
    purging: bool,
    rng: SmallRng,
}

impl Decay {
    pub fn new(time: DecayTime, kernel: DecayKernel, now: u64, seed: u64) -> Self {
        let mut decay = Decay {
            time,
            kernel,
            weights: kernel.weights(),
            interval: 0,
            epoch: now,
            deadline: now,
            backlog: [0; NSTEPS],
            backlog_limit: 0,
            nunpurged: 0,
            purging: false,
            rng: SmallRng::seed_from_u64(seed),
        };
        decay.reset(time, now);
        decay
    }

    pub fn time(&self) -> DecayTime {
        self.time
    }

    pub fn kernel(&self) -> DecayKernel {
        self.kernel
    }

    /// Change the decay time, forgetting all history.
    pub fn reset(&mut self, time: DecayTime, now: u64) {
        self.time = time;
        self.interval = match time {
            DecayTime::Millis(ms) => (ms.saturating_mul(1_000_000) / NSTEPS as u64).max(1),
            _ => 0,
        };
        self.epoch = now;
        self.backlog = [0; NSTEPS];
        self.backlog_limit = 0;
        self.nunpurged = 0;
        self.set_deadline();
    }

    fn set_deadline(&mut self) {
        let jitter = if self.interval > 1 {
            self.rng.gen_range(0..self.interval)
        } else {
            0
        };
        self.deadline = self
            .epoch
            .saturating_add(self.interval)
            .saturating_add(jitter);
    }

    /// Advance the epoch if its deadline has passed. `current` is the tier's
    /// page count. Returns whether the epoch moved.
    pub fn update(&mut self, now: u64, current: usize) -> bool {
        if self.interval == 0 {
            return false;
        }
        if now < self.epoch {
            // The clock went backwards: restart the epoch from here.
            self.epoch = now;
            self.set_deadline();
            return false;
        }
        if now < self.deadline {
            return false;
        }

        let elapsed = (now - self.epoch) / self.interval;
        let nadvance = elapsed.max(1);
        self.epoch += nadvance * self.interval;

        if nadvance >= NSTEPS as u64 {
            self.backlog = [0; NSTEPS];
        } else {
            let n = nadvance as usize;
            self.backlog.copy_within(n.., 0);
            for slot in &mut self.backlog[NSTEPS - n..] {
                *slot = 0;
            }
        }
        self.backlog[NSTEPS - 1] = current.saturating_sub(self.nunpurged);
        self.nunpurged = current;
        self.backlog_limit = self
            .backlog
            .iter()
            .zip(self.weights.iter())
            .map(|(&pages, &w)| pages as u64 * w)
            .sum::<u64>() as usize
            >> WEIGHT_BITS;
        self.set_deadline();
        true
    }

    /// Pages the tier may hold right now, or `None` for no limit.
    pub fn limit(&self, current: usize) -> Option<usize> {
        match self.time {
            DecayTime::Never => None,
            DecayTime::Immediate => Some(0),
            DecayTime::Millis(_) => {
                Some(self.backlog_limit + current.saturating_sub(self.nunpurged))
            }
        }
    }

    /// Record that `pages` were purged from the tier.
    pub fn purged(&mut self, pages: usize) {
        self.nunpurged = self.nunpurged.saturating_sub(pages);
    }

    /// Claim the right to purge; `false` if a purge is already running.
    pub fn begin_purge(&mut self) -> bool {
        !core::mem::replace(&mut self.purging, true)
    }

    pub fn end_purge(&mut self) {
        self.purging = false;
    }

    pub fn is_purging(&self) -> bool {
        self.purging
    }

    pub fn backlog_limit(&self) -> usize {
        self.backlog_limit
    }

    pub fn deadline(&self) -> u64 {
        self.deadline
    }
}
