//! A background thread that runs decay on a timer.
//!
//! Without it, decay only happens when deallocations tick an arena, so an
//! idle program keeps its dirty pages forever. With `background_thread` on,
//! a sweeper wakes every `background_interval` and gives every arena's decay
//! engines a chance to purge.

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, trace, warn};

use crate::allocators::{decay_all, Registry};
use crate::error::AllocError;

pub struct BackgroundPurger {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundPurger {
    pub fn spawn(reg: Arc<Registry>) -> Result<Self, AllocError> {
        let stop = Arc::new(AtomicBool::new(false));
        let interval = reg.config.background_interval;
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name("tiered-alloc-decay".into())
            .spawn(move || {
                debug!("registry {}: background decay every {:?}", reg.uid(), interval);
                while !flag.load(Ordering::Acquire) {
                    let purged = decay_all(&reg);
                    if purged != 0 {
                        trace!("registry {}: background pass purged {} pages", reg.uid(), purged);
                    }
                    thread::park_timeout(interval);
                }
            })
            .map_err(|e| AllocError::BackgroundThread(e.to_string()))?;
        Ok(BackgroundPurger {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it to finish its current pass.
    pub fn stop(&mut self) {
        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => return,
        };
        self.stop.store(true, Ordering::Release);
        handle.thread().unpark();
        if handle.join().is_err() {
            warn!("background decay thread panicked");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for BackgroundPurger {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use core::time::Duration;

    use test_log::test;

    use crate::clock::ManualClock;
    use crate::config::Config;
    use crate::decay::DecayTime;
    use crate::hooks::ToyVm;
    use crate::size_class::PAGE;
    use crate::Allocator;

    #[test]
    fn sweeps_idle_arenas() {
        let clock = Arc::new(ManualClock::new(0));
        let config = Config {
            narenas: 1,
            dirty_decay: DecayTime::Millis(10),
            background_thread: true,
            background_interval: Duration::from_millis(1),
            ..Config::default()
        };
        let alloc = Allocator::with_clock(ToyVm::default(), config, clock.clone()).unwrap();
        assert!(alloc.has_background_thread());

        let layout = core::alloc::Layout::from_size_align(16 * PAGE, PAGE).unwrap();
        let p = alloc.alloc(layout).unwrap();
        unsafe { alloc.dealloc(p) };

        // Two full decay periods: the first files the pages, the second lets
        // them all go.
        let mut waited = 0;
        while alloc.stats().dirty_pages() != 0 {
            assert!(waited < 5000, "background thread never purged");
            clock.advance(Duration::from_millis(10));
            thread::sleep(Duration::from_millis(1));
            waited += 1;
        }
        assert!(alloc.validate().is_valid());
    }

    #[test]
    fn stops_on_drop() {
        let config = Config {
            narenas: 1,
            background_thread: true,
            ..Config::default()
        };
        let alloc = Allocator::new(ToyVm::default(), config).unwrap();
        drop(alloc);
    }
}
