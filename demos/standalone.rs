use binloc::{Allocator, ResizePolicy};

fn main() {
    let mut allocator = Allocator::<8, 4>::with_resize_policy(ResizePolicy::HalfShrink);

    let sizes = [1, 100, 1024, 4096, 64 * 1024];
    let addresses: Vec<_> = sizes
        .iter()
        .map(|size| allocator.allocate(*size).unwrap())
        .collect();

    for (size, address) in sizes.iter().zip(&addresses) {
        let (tag, logical) = unsafe { (allocator.tag_of(*address), allocator.size_of(*address)) };
        println!("Requested {size} bytes, got {logical} from the {tag} allocator at {address:?}");
    }

    println!("{:?}", allocator.stats());

    unsafe {
        let address = allocator.resize(addresses[2].as_ptr(), 600).unwrap();
        println!("Shrinking 1024 to 600 bytes kept the pointer: {}", address == Some(addresses[2]));

        println!("Freeing everything...");
        allocator.free(addresses[0].as_ptr());
        allocator.free(addresses[1].as_ptr());
        allocator.free(addresses[2].as_ptr());
        allocator.free(addresses[3].as_ptr());
        allocator.free(addresses[4].as_ptr());
    }

    println!("{:?}", allocator.stats());
}
