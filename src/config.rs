//! Allocator configuration.
//!
//! A [`Config`] can be built in code, parsed from an option string of the
//! form `key:value,key:value`, or read from the `TIERED_ALLOC_CONF`
//! environment variable:
//!
//! ```text
//! TIERED_ALLOC_CONF="narenas:4,dirty_decay_ms:5000,muzzy_decay_ms:-1"
//! ```
//!
//! Unknown keys and out-of-range values are rejected; nothing is applied
//! from an option string that fails to parse.

use core::fmt;
use core::str::FromStr;
use core::time::Duration;

use crate::decay::{DecayKernel, DecayTime};
use crate::error::AllocError;
use crate::rtree::MAX_ARENAS;
use crate::size_class::{classes, HUGEPAGE};

pub const ENV_VAR: &str = "TIERED_ALLOC_CONF";

/// Upper bound on the per-arena descriptor fast cache.
pub const MAX_FAST_CACHE_DEPTH: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub narenas: usize,
    pub dirty_decay: DecayTime,
    pub muzzy_decay: DecayTime,
    /// Keep purged address space mapped for reuse instead of unmapping it.
    pub retain: bool,
    /// Largest single growth of retained address space, in bytes.
    pub retain_grow_limit: usize,
    /// Dirty extents more than `2^lg_max_active_fit` times a request are not
    /// split for it.
    pub lg_max_active_fit: u32,
    pub decay_kernel: DecayKernel,
    /// Offset large allocations by a random number of cache lines.
    pub cache_oblivious: bool,
    /// Deallocations between decay checks in each arena.
    pub decay_ticks: u32,
    pub fast_cache_depth: usize,
    pub background_thread: bool,
    pub background_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            narenas: (4 * num_cpus::get()).clamp(1, MAX_ARENAS),
            dirty_decay: DecayTime::Millis(10_000),
            muzzy_decay: DecayTime::Immediate,
            retain: true,
            retain_grow_limit: classes().large_max(),
            lg_max_active_fit: 6,
            decay_kernel: DecayKernel::Smootherstep,
            cache_oblivious: true,
            decay_ticks: 1000,
            fast_cache_depth: 16,
            background_thread: false,
            background_interval: Duration::from_millis(100),
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, AllocError> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(AllocError::config(key, format!("expected a boolean, got {:?}", value))),
    }
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T, AllocError> {
    value
        .parse()
        .map_err(|_| AllocError::config(key, format!("expected a number, got {:?}", value)))
}

impl Config {
    /// Defaults, overridden by `TIERED_ALLOC_CONF` if it is set.
    pub fn from_env() -> Result<Self, AllocError> {
        match std::env::var(ENV_VAR) {
            Ok(opts) => {
                log::debug!("{}={}", ENV_VAR, opts);
                opts.parse()
            }
            Err(_) => Ok(Config::default()),
        }
    }

    /// Apply one `key:value` option.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), AllocError> {
        match key {
            "narenas" => self.narenas = parse_num(key, value)?,
            "dirty_decay_ms" => self.dirty_decay = DecayTime::from_millis(parse_num(key, value)?)?,
            "muzzy_decay_ms" => self.muzzy_decay = DecayTime::from_millis(parse_num(key, value)?)?,
            "retain" => self.retain = parse_bool(key, value)?,
            "retain_grow_limit" => self.retain_grow_limit = parse_num(key, value)?,
            "lg_max_active_fit" => self.lg_max_active_fit = parse_num(key, value)?,
            "decay_kernel" => self.decay_kernel = value.parse()?,
            "cache_oblivious" => self.cache_oblivious = parse_bool(key, value)?,
            "decay_ticks" => self.decay_ticks = parse_num(key, value)?,
            "fast_cache_depth" => self.fast_cache_depth = parse_num(key, value)?,
            "background_thread" => self.background_thread = parse_bool(key, value)?,
            "background_interval_ms" => {
                self.background_interval = Duration::from_millis(parse_num(key, value)?)
            }
            _ => return Err(AllocError::config(key, "unknown option")),
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), AllocError> {
        if self.narenas == 0 || self.narenas > MAX_ARENAS {
            return Err(AllocError::config(
                "narenas",
                format!("must be between 1 and {}", MAX_ARENAS),
            ));
        }
        self.dirty_decay.validate()?;
        self.muzzy_decay.validate()?;
        if self.retain_grow_limit < HUGEPAGE {
            return Err(AllocError::config(
                "retain_grow_limit",
                format!("must be at least {}", HUGEPAGE),
            ));
        }
        if self.lg_max_active_fit >= usize::BITS {
            return Err(AllocError::config("lg_max_active_fit", "too large"));
        }
        if self.decay_ticks == 0 {
            return Err(AllocError::config("decay_ticks", "must be positive"));
        }
        if self.fast_cache_depth > MAX_FAST_CACHE_DEPTH {
            return Err(AllocError::config(
                "fast_cache_depth",
                format!("must be at most {}", MAX_FAST_CACHE_DEPTH),
            ));
        }
        if self.background_interval.is_zero() {
            return Err(AllocError::config("background_interval_ms", "must be positive"));
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = AllocError;

    /// Parse `key:value` pairs separated by commas on top of the defaults.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut config = Config::default();
        for opt in s.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            let (key, value) = opt
                .split_once(':')
                .ok_or_else(|| AllocError::config(opt, "expected key:value"))?;
            config.set(key.trim(), value.trim())?;
        }
        config.validate()?;
        Ok(config)
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "narenas:{},dirty_decay_ms:{},muzzy_decay_ms:{},retain:{},retain_grow_limit:{},\
             lg_max_active_fit:{},decay_kernel:{},cache_oblivious:{},decay_ticks:{},\
             fast_cache_depth:{},background_thread:{},background_interval_ms:{}",
            self.narenas,
            self.dirty_decay,
            self.muzzy_decay,
            self.retain,
            self.retain_grow_limit,
            self.lg_max_active_fit,
            self.decay_kernel,
            self.cache_oblivious,
            self.decay_ticks,
            self.fast_cache_depth,
            self.background_thread,
            self.background_interval.as_millis(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.narenas, 4 * num_cpus::get());
        assert_eq!(config.dirty_decay, DecayTime::Millis(10_000));
        assert_eq!(config.muzzy_decay, DecayTime::Immediate);
    }

    #[test]
    fn option_strings() {
        let config: Config = "narenas:3, dirty_decay_ms:-1,muzzy_decay_ms:500,retain:false,decay_kernel:linear"
            .parse()
            .unwrap();
        assert_eq!(config.narenas, 3);
        assert_eq!(config.dirty_decay, DecayTime::Never);
        assert_eq!(config.muzzy_decay, DecayTime::Millis(500));
        assert!(!config.retain);
        assert_eq!(config.decay_kernel, DecayKernel::Linear);
        assert_eq!("".parse::<Config>().unwrap(), Config::default());
    }

    #[test]
    fn display_round_trips() {
        let mut config = Config::default();
        config.narenas = 2;
        config.cache_oblivious = false;
        config.background_interval = Duration::from_millis(250);
        let parsed: Config = config.to_string().parse().unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn rejects_bad_options() {
        for bad in [
            "narenas:0",
            "narenas:lots",
            "dirty_decay_ms:-5",
            "retain:maybe",
            "no_such_key:1",
            "decay_kernel:cubic",
            "fast_cache_depth:65",
            "decay_ticks:0",
            "narenas",
        ] {
            let err = bad.parse::<Config>();
            assert!(err.is_err(), "{} parsed", bad);
        }
        assert_eq!(
            "dirty_decay_ms:-7".parse::<Config>(),
            Err(AllocError::InvalidDecayTime(-7))
        );
    }

    #[test]
    fn out_of_range_decay_times_fail_validation() {
        let config = Config {
            dirty_decay: DecayTime::Millis(u64::MAX),
            ..Config::default()
        };
        assert_eq!(config.validate(), Err(AllocError::InvalidDecayTime(i64::MAX)));
        // Printing it must not produce an option string that parses as
        // something else.
        assert!(config.to_string().parse::<Config>().is_err());

        let config = Config {
            muzzy_decay: DecayTime::Millis(0),
            ..Config::default()
        };
        assert_eq!(config.validate(), Err(AllocError::InvalidDecayTime(0)));
    }
}
