//! PCI bus access.
//!
//! Configuration space is reached through the legacy I/O port mechanism
//! (0xCF8 address, 0xCFC data), which in this system means the `outl` and
//! `inl` syscalls. Enumeration recurses through PCI-to-PCI bridges; BAR
//! decoding understands I/O, 32-bit and 64-bit memory BARs; MSI-X setup
//! maps the vector table and programs entries one by one.

#![no_std]

extern crate alloc;

use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use ydin_sdk as sdk;

const PCI_CONFIG_ADDR_PORT: u16 = 0xCF8;
const PCI_CONFIG_DATA_PORT: u16 = 0xCFC;

const PCI_CAP_ID_MSIX: u8 = 0x11;

/// PCI vendor ID indicating "no device present".
pub const PCI_VENDOR_ID_NONE: u16 = 0xFFFF;

/// PCI access errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciError {
    /// The device advertises no MSI-X capability.
    MsixNotSupported,
    /// An MMIO window could not be mapped.
    MapFailed,
}

impl fmt::Display for PciError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PciError::MsixNotSupported => f.write_str("MSI-X is not supported"),
            PciError::MapFailed => f.write_str("failed to map MMIO window"),
        }
    }
}

/// A PCI device address (bus, device, function).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

/// Scans every bus reachable from the host controllers and returns the
/// standard devices found.
pub fn detect() -> Vec<Address> {
    let mut addrs = Vec::new();
    // A multi-function host controller exposes one controller per
    // function, each rooting a bus.
    for function in 0..=7u8 {
        let probe = Address {
            bus: 0,
            device: 0,
            function,
        };
        if probe.read_vendor_id() == PCI_VENDOR_ID_NONE {
            break;
        }
        search_bus(&mut addrs, function);
    }
    addrs
}

fn search_bus(addrs: &mut Vec<Address>, bus: u8) {
    for device in 0..=31u8 {
        search_device(addrs, bus, device);
    }
}

fn search_device(addrs: &mut Vec<Address>, bus: u8, device: u8) {
    let addr = Address {
        bus,
        device,
        function: 0,
    };
    if addr.read_vendor_id() == PCI_VENDOR_ID_NONE {
        return;
    }
    let max_function = if addr.read_header_type() & 0x80 != 0 {
        // Multi-function device.
        7
    } else {
        0
    };
    for function in 0..=max_function {
        let addr = Address {
            bus,
            device,
            function,
        };
        if addr.read_vendor_id() == PCI_VENDOR_ID_NONE {
            continue;
        }
        search_function(addrs, addr);
    }
}

fn search_function(addrs: &mut Vec<Address>, addr: Address) {
    match addr.read_header_type() & 0x7F {
        0x00 => addrs.push(addr),
        0x01 => {
            // PCI-to-PCI bridge.
            search_bus(addrs, addr.read_secondary_bus());
        }
        _ => {}
    }
}

impl Address {
    fn config_address(self, reg: u8) -> u32 {
        if reg & 0x3 != 0 {
            panic!("unaligned PCI register access");
        }
        0x8000_0000
            | (self.bus as u32) << 16
            | (self.device as u32) << 11
            | (self.function as u32) << 8
            | reg as u32
    }

    /// Reads a 32-bit configuration register.
    pub fn read_register(self, reg: u8) -> u32 {
        sdk::outl(PCI_CONFIG_ADDR_PORT, self.config_address(reg));
        sdk::inl(PCI_CONFIG_DATA_PORT)
    }

    fn write_register(self, reg: u8, val: u32) {
        sdk::outl(PCI_CONFIG_ADDR_PORT, self.config_address(reg));
        sdk::outl(PCI_CONFIG_DATA_PORT, val);
    }

    pub fn read_vendor_id(self) -> u16 {
        self.read_register(0x0) as u16
    }

    pub fn read_device_id(self) -> u16 {
        (self.read_register(0x0) >> 16) as u16
    }

    pub fn read_status(self) -> u16 {
        (self.read_register(0x4) >> 16) as u16
    }

    /// Offset of the first entry in the capability list.
    pub fn read_cap_offset(self) -> u8 {
        self.read_register(0x34) as u8 & !0x3
    }

    fn read_header_type(self) -> u8 {
        (self.read_register(0xC) >> 16) as u8
    }

    fn read_secondary_bus(self) -> u8 {
        (self.read_register(0x18) >> 8) as u8
    }

    /// Decodes BAR `bar`: returns the address, whether the region is
    /// prefetchable and whether it is memory-mapped (as opposed to I/O
    /// ports).
    pub fn read_bar(self, bar: u8) -> (u64, bool, bool) {
        if bar > 0x5 {
            panic!("invalid BAR");
        }
        let bar0 = self.read_register(0x10 + bar * 4);
        if bar0 & 1 != 0 {
            // I/O space.
            return ((bar0 & !0b11) as u64, false, false);
        }
        let mut addr = (bar0 & !0xF) as u64;
        match (bar0 >> 1) & 0b11 {
            0b01 => {
                // 16-bit addressing; long obsolete.
                return (addr, false, false);
            }
            0b10 => {
                // 64-bit address; the next BAR holds the high half.
                let hi = self.read_register(0x10 + (bar + 1) * 4);
                addr |= (hi as u64) << 32;
            }
            _ => {}
        }
        let prefetch = bar0 & 0b1000 != 0;
        (addr, prefetch, true)
    }

    /// Finds the MSI-X capability, maps the vector table and enables
    /// MSI-X delivery on the function.
    pub fn init_interrupts(self) -> Result<InterruptTable, PciError> {
        let mut next_cap = self.read_cap_offset();
        while next_cap != 0 {
            let cap_off = next_cap;
            let w0 = self.read_register(cap_off);
            next_cap = (w0 >> 8) as u8;
            if w0 as u8 != PCI_CAP_ID_MSIX {
                continue;
            }
            let off_bar = self.read_register(cap_off + 4);
            let bar_off = off_bar & !0b111;
            let bar = (off_bar & 0b111) as u8;
            let (bar_addr, _, is_mem) = self.read_bar(bar);
            if !is_mem {
                continue;
            }
            let entries = ((w0 >> 16) & 0x7FF) as usize + 1;
            let base = bar_addr + bar_off as u64;
            let table_bytes = entries * core::mem::size_of::<MsixEntry>();
            let table = sdk::map(base, table_bytes).map_err(|_| PciError::MapFailed)?;
            // Global MSI-X enable.
            self.write_register(cap_off, w0 | 1 << 31);
            return Ok(InterruptTable {
                entries,
                table: table as *mut MsixEntry,
            });
        }
        Err(PciError::MsixNotSupported)
    }
}

/// Hardware layout of one MSI-X table entry.
#[repr(C)]
struct MsixEntry {
    addr_lo: AtomicU32,
    addr_hi: AtomicU32,
    data: AtomicU32,
    control: AtomicU32,
}

/// A mapped MSI-X vector table.
pub struct InterruptTable {
    entries: usize,
    table: *mut MsixEntry,
}

// SAFETY: entry stores are atomic and the table is device memory mapped
// once.
unsafe impl Send for InterruptTable {}
unsafe impl Sync for InterruptTable {}

impl InterruptTable {
    /// Number of vectors the function supports.
    pub fn num_interrupts(&self) -> usize {
        self.entries
    }

    /// Programs entry `intr` with the message and unmasks it last, so the
    /// device cannot fire a half-written vector.
    pub fn setup_interrupt(&self, intr: usize, enable: bool, mut addr: u64, data: u32) {
        if addr & 0x2 != 0 {
            panic!("unaligned message address");
        }
        if intr >= self.entries {
            panic!("interrupt number out of range");
        }
        if !enable {
            addr |= 0b10;
        }
        // SAFETY: intr was bounds checked against the mapped table.
        let entry = unsafe { &*self.table.add(intr) };
        entry.addr_lo.store(addr as u32, Ordering::SeqCst);
        entry.addr_hi.store((addr >> 32) as u32, Ordering::SeqCst);
        entry.data.store(data, Ordering::SeqCst);
        let ctrl = entry.control.load(Ordering::SeqCst);
        entry.control.store(ctrl & !0b1, Ordering::SeqCst);
    }
}
