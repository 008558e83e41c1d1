//! Architecture-specific implementations.
//!
//! Only x86_64 is supported; the module split keeps the door open for the
//! day that stops being true.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
