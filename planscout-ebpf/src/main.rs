#![cfg_attr(target_arch = "bpf", no_std)]
#![cfg_attr(target_arch = "bpf", no_main)]

mod counters;
mod generated;
mod ou;

#[cfg(all(not(test), target_arch = "bpf"))]
#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 4] = *b"GPL\0";

// Host builds of the workspace compile the programs without linking a
// BPF entry point; the real artifact is produced by `cargo xtask
// build-ebpf` for bpfel-unknown-none.
#[cfg(not(target_arch = "bpf"))]
fn main() {}
