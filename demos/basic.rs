use poolalloc::Allocator;

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .init();

    let allocator = Allocator::new(1 << 20);
    allocator.set_logging(true);

    let first = allocator.allocate(64).expect("no memory");
    println!("Requested 64 bytes, received {first:?}");

    let second = allocator.allocate(256).expect("no memory");
    println!("Requested 256 bytes, received {second:?}");

    unsafe {
        first.as_ptr().write(42);
        println!("First byte of the first block: {}", first.as_ptr().read());

        allocator.release(first.as_ptr());

        // A request that fits in the freed block gets its address back.
        let reused = allocator.allocate(32).expect("no memory");
        println!("Requested 32 bytes after a free, received {reused:?}");

        let grown = allocator.resize(second.as_ptr(), 512).expect("no memory");
        println!("Resized the 256 byte block, moved to {grown:?}");

        allocator.release(reused.as_ptr());
        allocator.release(grown.as_ptr());
    }
}
