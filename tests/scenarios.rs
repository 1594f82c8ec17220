use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::Ordering;
use core::time::Duration;
use std::sync::Arc;

use tiered_alloc::size_class::{classes, PAGE};
use tiered_alloc::{AllocError, Allocator, Config, DecayTime, ManualClock, PurgeState, ToyVm};

use test_log::test;

fn config() -> Config {
    Config {
        narenas: 1,
        ..Config::default()
    }
}

fn layout(size: usize) -> Layout {
    Layout::from_size_align(size, 8).unwrap()
}

fn check_and_rewrite(live: &[(usize, NonNull<u8>)], expect: impl Fn(usize) -> u64, next: u64) {
    for &(i, p) in live {
        unsafe {
            assert_eq!(p.as_ptr().cast::<u64>().read(), expect(i), "object {}", i);
            core::ptr::write_bytes(p.as_ptr(), 0xab, 48);
            p.as_ptr().cast::<u64>().write(next + i as u64);
        }
    }
}

#[test]
fn free_every_other_object() {
    // Only explicit purges move pages, so the dirty count is exact.
    let alloc = Allocator::new(
        ToyVm::default(),
        Config {
            dirty_decay: DecayTime::Never,
            ..config()
        },
    )
    .unwrap();
    let ptrs: Vec<NonNull<u8>> = (0..1000u64)
        .map(|i| {
            let p = alloc.alloc(layout(48)).unwrap();
            unsafe { p.as_ptr().cast::<u64>().write(i) };
            p
        })
        .collect();

    let (odd, even): (Vec<(usize, NonNull<u8>)>, Vec<_>) =
        ptrs.into_iter().enumerate().partition(|&(i, _)| i % 2 == 1);
    for &(_, p) in &odd {
        unsafe { alloc.dealloc(p) };
    }
    let stats = alloc.stats();
    assert_eq!(stats.small_regions(), 500);
    // Every slab still holds a survivor.
    assert_eq!(stats.dirty_pages(), 0);

    let mut addrs: Vec<usize> = even.iter().map(|(_, p)| p.as_ptr() as usize).collect();
    addrs.sort_unstable();
    addrs.dedup();
    assert_eq!(addrs.len(), 500);

    // Purging with survivors live must not touch them.
    alloc.purge_all();
    check_and_rewrite(&even, |i| i as u64, 1000);
    check_and_rewrite(&even, |i| 1000 + i as u64, 2000);
    assert!(alloc.validate().is_valid());

    // Slabs fill in allocation order, so freeing the first 512 objects
    // empties the first two slabs (256 regions each) and sends them to the
    // dirty tier.
    let class = classes().size_to_index(48).unwrap();
    let info = classes().bin_info(class).unwrap();
    assert_eq!(info.nregs, 256);
    let (early, late): (Vec<_>, Vec<_>) = even.into_iter().partition(|&(i, _)| i < 512);
    for &(_, p) in &early {
        unsafe { alloc.dealloc(p) };
    }
    let dirty = alloc.stats().dirty_pages();
    assert_eq!(dirty, 2 * info.slab_size / PAGE);

    assert_eq!(alloc.purge_all(), dirty);
    assert_eq!(alloc.stats().dirty_pages(), 0);
    check_and_rewrite(&late, |i| 2000 + i as u64, 3000);
    assert!(alloc.validate().is_valid());

    for (_, p) in late {
        unsafe { alloc.dealloc(p) };
    }
    alloc.purge_all();
    let stats = alloc.stats();
    assert_eq!(stats.small_regions(), 0);
    assert_eq!(stats.active_pages(), 0);
    assert_eq!(stats.dirty_pages(), 0);
    assert!(alloc.validate().is_valid());
}

#[test]
fn class_sized_requests_fit_exactly() {
    let alloc = Allocator::new(ToyVm::default(), config()).unwrap();
    let sc = classes();
    for index in 0..sc.len() {
        let size = sc.index_to_size(index);
        if size > 1 << 20 {
            break;
        }
        let p = alloc.alloc(layout(size)).unwrap();
        assert_eq!(alloc.usable_size(p), Some(size), "class {}", index);
        // The byte after the class boundary belongs to the next size up.
        let q = alloc.alloc(layout(size + 1)).unwrap();
        assert!(alloc.usable_size(q).unwrap() > size);
        unsafe {
            alloc.dealloc(p);
            alloc.dealloc(q);
        }
    }
    assert_eq!(alloc.stats().active_pages(), 0);
}

#[test]
fn immediate_decay_leaves_nothing_dirty() {
    let alloc = Allocator::new(
        ToyVm::default(),
        Config {
            dirty_decay: DecayTime::Immediate,
            ..config()
        },
    )
    .unwrap();
    assert_eq!(alloc.decay_time(0, PurgeState::Dirty), Ok(DecayTime::Immediate));

    let p = alloc.alloc(layout(256 * 1024)).unwrap();
    unsafe { alloc.dealloc(p) };
    let stats = alloc.stats();
    assert_eq!(stats.dirty_pages(), 0);
    assert_eq!(stats.muzzy_pages(), 0);
    assert!(stats.retained_pages() > 0);
}

#[test]
fn never_decay_keeps_dirty_pages() {
    let clock = Arc::new(ManualClock::new(0));
    let alloc = Allocator::with_clock(
        ToyVm::default(),
        Config {
            dirty_decay: DecayTime::Never,
            ..config()
        },
        clock.clone(),
    )
    .unwrap();

    let p = alloc.alloc(layout(256 * 1024)).unwrap();
    unsafe { alloc.dealloc(p) };
    let dirty = alloc.stats().dirty_pages();
    assert!(dirty > 0);

    for _ in 0..10 {
        clock.advance(Duration::from_secs(3600));
        assert_eq!(alloc.decay(), 0);
    }
    assert_eq!(alloc.stats().dirty_pages(), dirty);

    // An explicit purge still empties the tier.
    assert_eq!(alloc.purge_all(), dirty);
    assert_eq!(alloc.stats().dirty_pages(), 0);
}

#[test]
fn failed_growth_changes_nothing() {
    let vm = Arc::new(ToyVm::default());
    let alloc = Allocator::new(vm.clone(), config()).unwrap();
    let warm = alloc.alloc(layout(64 * 1024)).unwrap();
    let before = alloc.stats();

    vm.fail_maps.store(true, Ordering::Relaxed);
    assert!(alloc.alloc(layout(64 << 20)).is_err());
    let after = alloc.stats();
    assert_eq!(after.mapped(), before.mapped());
    assert_eq!(after.active_pages(), before.active_pages());
    assert_eq!(after.retained_pages(), before.retained_pages());
    assert_eq!(after.descriptors.in_use, before.descriptors.in_use);
    assert!(alloc.validate().is_valid());

    vm.fail_maps.store(false, Ordering::Relaxed);
    let big = alloc.alloc(layout(64 << 20)).unwrap();
    unsafe {
        alloc.dealloc(big);
        alloc.dealloc(warm);
    }
    assert!(alloc.validate().is_valid());
}

#[test]
fn exhausted_address_space_is_out_of_memory() {
    let alloc = Allocator::new(ToyVm::with_capacity(16 << 20), config()).unwrap();
    assert_eq!(alloc.alloc(layout(32 << 20)), Err(AllocError::OutOfMemory));
    // Smaller requests still succeed afterwards.
    let p = alloc.alloc(layout(4096)).unwrap();
    unsafe { alloc.dealloc(p) };
    assert!(alloc.validate().is_valid());
}

#[test]
fn oversized_requests_fail() {
    let alloc = Allocator::new(ToyVm::default(), config()).unwrap();
    let too_big = layout(classes().large_max() + 1);
    assert_eq!(alloc.alloc(too_big), Err(AllocError::OutOfMemory));
    assert_eq!(alloc.stats().active_pages(), 0);
}

#[test]
fn config_from_options_and_env() {
    let config: Config = "narenas:3, dirty_decay_ms:-1, muzzy_decay_ms:0, retain:false"
        .parse()
        .unwrap();
    assert_eq!(config.narenas, 3);
    assert_eq!(config.dirty_decay, DecayTime::Never);
    assert_eq!(config.muzzy_decay, DecayTime::Immediate);
    assert!(!config.retain);
    // Display output parses back to the same configuration.
    assert_eq!(config.to_string().parse::<Config>(), Ok(config));

    assert!(matches!(
        "narenas:0".parse::<Config>(),
        Err(AllocError::InvalidConfig { .. })
    ));
    assert!(matches!(
        "bogus:1".parse::<Config>(),
        Err(AllocError::InvalidConfig { .. })
    ));
    assert_eq!(
        "dirty_decay_ms:-2".parse::<Config>(),
        Err(AllocError::InvalidDecayTime(-2))
    );

    std::env::set_var(tiered_alloc::config::ENV_VAR, "narenas:2,decay_ticks:7");
    let config = Config::from_env().unwrap();
    std::env::remove_var(tiered_alloc::config::ENV_VAR);
    assert_eq!(config.narenas, 2);
    assert_eq!(config.decay_ticks, 7);
    assert_eq!(Config::from_env(), Ok(Config::default()));
}
