//! Hammers a single allocator from several worker threads to exercise the
//! locking discipline: every worker keeps allocating, writing, resizing and
//! releasing its own blocks while the others do the same.

use std::{sync::Arc, thread};

use poolalloc::{Allocator, ArenaSource};

const WORKERS: usize = 8;
const ROUNDS: u32 = 1_000;

fn main() {
    tracing_subscriber::fmt().init();

    let allocator = Arc::new(Allocator::with_source(
        4 << 20,
        ArenaSource::with_capacity(16 << 20),
    ));

    let mut handles = Vec::new();
    for worker in 0..WORKERS {
        let allocator = Arc::clone(&allocator);
        handles.push(thread::spawn(move || {
            let size = 48 * (worker + 1);
            let fill = worker as u8 + 1;

            for _ in 0..ROUNDS {
                let ptr = allocator.allocate(size).expect("no memory");
                unsafe {
                    std::ptr::write_bytes(ptr.as_ptr(), fill, size);

                    let grown = allocator
                        .resize(ptr.as_ptr(), size * 2)
                        .expect("no memory");
                    for at in 0..size {
                        assert_eq!(
                            *grown.as_ptr().add(at),
                            fill,
                            "worker {worker} lost its bytes"
                        );
                    }

                    allocator.release(grown.as_ptr());
                }
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }

    println!("{WORKERS} workers x {ROUNDS} rounds finished without corruption");
}
