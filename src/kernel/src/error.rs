//! Kernel-wide error types.

use core::fmt;

/// Recoverable kernel errors.
///
/// Fatal conditions do not use this type; they go straight to
/// [`crate::fatal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// No physical memory left, or a fixed-capacity table is full.
    OutOfMemory,
    /// The operation or argument combination is not implemented.
    NotSupported,
    /// A caller-provided address or size failed validation.
    InvalidArgument,
    /// The firmware memory map contains no usable region.
    NoUsableMemory,
    /// The bitmap for physical memory does not fit any usable region.
    BitmapTooLarge,
    /// The kernel image is not a loadable ELF64 object.
    BadElf,
    /// The thread table is at capacity.
    TooManyThreads,
    /// The HPET reported an out-of-range counter period.
    InvalidClockPeriod,
    /// No local APIC, or not running on the bootstrap processor.
    NoApic,
    /// A fixed virtual address was already taken.
    AddressInUse,
    /// A page fault hit an address no reserved range covers.
    UnmappedFault,
    /// A page fault hit a range reserved with no access.
    ProtNoneFault,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::OutOfMemory => "out of memory",
            KernelError::NotSupported => "not supported",
            KernelError::InvalidArgument => "invalid argument",
            KernelError::NoUsableMemory => "no usable memory in firmware map",
            KernelError::BitmapTooLarge => "memory bitmap does not fit in available memory",
            KernelError::BadElf => "invalid ELF image",
            KernelError::TooManyThreads => "too many threads",
            KernelError::InvalidClockPeriod => "invalid HPET clock period",
            KernelError::NoApic => "no usable local APIC",
            KernelError::AddressInUse => "virtual address already reserved",
            KernelError::UnmappedFault => "page fault for unmapped address",
            KernelError::ProtNoneFault => "page fault for PROT_NONE address",
        };
        f.write_str(msg)
    }
}
