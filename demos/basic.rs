use std::ptr::NonNull;

use arenalloc::{AllocError, Allocator};

fn log_alloc(allocator: &Allocator, addr: NonNull<u8>, size: usize) {
    println!("Requested {size} bytes of memory");
    println!("Received this address: {addr:?}");

    for arena in allocator.arenas() {
        print!("{arena}");
    }
}

fn main() -> Result<(), AllocError> {
    env_logger::init();

    let mut allocator: Allocator = Allocator::default();

    let addr1 = allocator.allocate(8)?;
    log_alloc(&allocator, addr1, 8);

    let addr2 = allocator.allocate(100)?;
    log_alloc(&allocator, addr2, 100);

    let addr3 = allocator.allocate(16)?;
    log_alloc(&allocator, addr3, 16);

    unsafe {
        allocator.release(addr1)?;
        allocator.release(addr2)?;

        if let Err(err) = allocator.release(addr2) {
            println!("Releasing twice fails: {err}");
        }

        allocator.release(addr3)?;
    }

    println!("Arenas left: {}", allocator.arena_count());

    Ok(())
}
