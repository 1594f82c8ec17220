//! A minimal example of the page hooks on their own: map some pages, dirty
//! them, purge them, and give them back.

use tiered_alloc::{ExtentHooks, LibcHooks};

const SIZE: usize = 16 * 4096;

fn main() {
    env_logger::init();
    let hooks = LibcHooks::new().unwrap();

    let mapping = unsafe { hooks.map(SIZE, 1 << 16).unwrap() };
    println!(
        "Mapped {} bytes at {:p} (zeroed: {}, committed: {})",
        mapping.size, mapping.addr, mapping.zeroed, mapping.committed
    );
    let addr = mapping.addr.as_ptr();

    unsafe {
        core::ptr::write_bytes(addr, 0x5a, mapping.size);
        match hooks.purge_lazy(addr, mapping.size) {
            Ok(()) => println!("Lazily purged; contents are now unspecified"),
            Err(e) => println!("Lazy purge refused: {}", e),
        }
        match hooks.purge_forced(addr, mapping.size) {
            Ok(()) => println!("Forced purge; first byte reads {:#x}", *addr),
            Err(e) => println!("Forced purge refused: {}", e),
        }
        match hooks.decommit(addr, mapping.size) {
            Ok(()) => {
                println!("Decommitted");
                hooks.commit(addr, mapping.size).unwrap();
                println!("Committed again; first byte reads {:#x}", *addr);
            }
            Err(e) => println!("Decommit refused: {}", e),
        }
        hooks.unmap(addr, mapping.size).unwrap();
    }
    println!("Unmapped");
}
