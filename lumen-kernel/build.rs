fn main() {
    // Pass the linker script when building the kernel image itself;
    // host-side test binaries link normally.
    let arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    if arch == "aarch64" {
        let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();
        println!("cargo:rustc-link-arg-bins=-T{manifest_dir}/kernel.ld");
    }
    println!("cargo:rerun-if-changed=kernel.ld");
}
