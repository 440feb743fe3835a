#![no_std]

// Library target only so the host crate can depend on this package from its
// build script; the XDP program itself lives in `main.rs`.
