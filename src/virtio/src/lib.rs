//! Virtio modern (1.x) transport over PCI.
//!
//! Discovery walks the PCI bus for vendor 0x1AF4 devices with modern IDs,
//! parses the vendor capability list for the common, notify, ISR and
//! device configuration windows, negotiates features and sets up split
//! virtqueues with MSI-X delivery. Legacy devices are not supported.
//!
//! Two driver-side helpers cover the device patterns in this system:
//! [`Reader`] for a device-to-driver stream and [`Commander`] for
//! request/response pairs.

#![no_std]

extern crate alloc;

pub mod gpu;
pub mod input;

use alloc::vec::Vec;
use core::fmt;
use core::mem::{offset_of, size_of};
use core::sync::atomic::{AtomicU16, Ordering};

use ydin_pci as pci;
use ydin_sdk as sdk;
use ydin_sdk::interrupt::{alloc_interrupt, InterruptLine};

/// Vendor ID of every virtio device.
pub const VIRTIO_VENDOR: u16 = 0x1AF4;

/// Modern device IDs are 0x1040 + device type.
const DEVICE_ID_BASE: u16 = 0x1040;
const DEVICE_ID_LAST: u16 = 0x107F;

pub const DEVICE_TYPE_GPU: u16 = 16;
pub const DEVICE_TYPE_INPUT: u16 = 18;

/// The mandatory virtio 1.x feature bit.
pub const F_VERSION_1: u64 = 1 << 32;

/// Queue sizes are capped here; must be a power of two.
pub const MAX_QUEUE_SIZE: usize = 1 << 7;

const PCI_CAP_ID_VNDR: u8 = 0x9;

/// Vendor capability kinds.
pub const CAP_COMMON_CFG: u8 = 1;
pub const CAP_NOTIFY_CFG: u8 = 2;
pub const CAP_ISR_CFG: u8 = 3;
pub const CAP_DEVICE_CFG: u8 = 4;

// Device status bits.
const STATUS_ACKNOWLEDGE: u8 = 1;
const STATUS_DRIVER: u8 = 2;
const STATUS_DRIVER_OK: u8 = 4;
const STATUS_FEATURES_OK: u8 = 8;
const STATUS_FAILED: u8 = 128;

/// Descriptor flags.
pub const DESC_F_NEXT: u16 = 1;
pub const DESC_F_WRITE: u16 = 2;

/// Transport errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtioError {
    /// No device of the requested type on the bus.
    NoDevice(u16),
    /// The requested capability is missing from the capability list.
    CapabilityNotFound(u8),
    /// A configuration window is smaller than its structure.
    ConfigTooSmall,
    /// The device rejected the negotiated feature set.
    FeatureNegotiationFailed,
    /// The device lacks features the driver requires.
    MissingFeatures { got: u64, need: u64 },
    /// The selected queue does not exist or reports size zero.
    QueueUnavailable,
    /// Queue index beyond the device's queue count.
    BadQueueIndex,
    /// Could not obtain physically contiguous queue memory.
    QueueMemory,
    /// The device did not accept an MSI-X vector.
    InterruptSetupFailed,
    /// MSI-X vectors or kernel interrupt lines are exhausted.
    NoInterrupts,
    /// The device returned used descriptors out of order.
    OutOfOrderDescriptor,
    /// A reader buffer cannot cover every descriptor.
    BufferTooSmall,
    /// Mapping an MMIO window or DMA memory failed.
    MapFailed,
}

impl fmt::Display for VirtioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VirtioError::NoDevice(t) => write!(f, "no virtio device of type {}", t),
            VirtioError::CapabilityNotFound(c) => write!(f, "capability {} not found", c),
            VirtioError::ConfigTooSmall => f.write_str("configuration area too small"),
            VirtioError::FeatureNegotiationFailed => f.write_str("feature negotiation failed"),
            VirtioError::MissingFeatures { got, need } => {
                write!(f, "device features {:#x}, need at least {:#x}", got, need)
            }
            VirtioError::QueueUnavailable => f.write_str("queue not available"),
            VirtioError::BadQueueIndex => f.write_str("queue index out of range"),
            VirtioError::QueueMemory => f.write_str("failed to allocate queue memory"),
            VirtioError::InterruptSetupFailed => f.write_str("failed to set up interrupt"),
            VirtioError::NoInterrupts => f.write_str("no interrupts available"),
            VirtioError::OutOfOrderDescriptor => {
                f.write_str("device returned descriptors out of order")
            }
            VirtioError::BufferTooSmall => f.write_str("read buffer too small"),
            VirtioError::MapFailed => f.write_str("failed to map device memory"),
        }
    }
}

/// The common configuration window, as laid out on the wire.
#[repr(C)]
struct CommonCfg {
    device_feature_select: u32,
    device_feature: u32,
    driver_feature_select: u32,
    driver_feature: u32,
    msix_vector: u16,
    num_queues: u16,
    device_status: u8,
    config_generation: u8,

    queue_select: u16,
    queue_size: u16,
    queue_msix_vector: u16,
    queue_enable: u16,
    queue_notify_off: u16,
    queue_desc: u64,
    queue_driver: u64,
    queue_device: u64,
}

macro_rules! cfg_read {
    ($cfg:expr, $field:ident) => {
        // SAFETY: the window was mapped and size-checked at open.
        unsafe { core::ptr::read_volatile(core::ptr::addr_of!((*$cfg).$field)) }
    };
}

macro_rules! cfg_write {
    ($cfg:expr, $field:ident, $val:expr) => {
        // SAFETY: as above.
        unsafe { core::ptr::write_volatile(core::ptr::addr_of_mut!((*$cfg).$field), $val) }
    };
}

/// One virtqueue descriptor.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

#[repr(C)]
pub struct AvailRing {
    pub flags: u16,
    pub idx: u16,
    pub ring: [u16; MAX_QUEUE_SIZE],
    pub used_event: u16,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct UsedElem {
    pub id: u32,
    pub len: u32,
}

#[repr(C)]
pub struct UsedRing {
    pub flags: u16,
    pub idx: u16,
    pub ring: [UsedElem; MAX_QUEUE_SIZE],
    pub avail_event: u16,
}

/// The in-memory layout handed to the device: descriptor table, available
/// ring, used ring, in one physically contiguous block.
#[repr(C)]
pub struct SplitQueue {
    pub descriptors: [Descriptor; MAX_QUEUE_SIZE],
    pub available: AvailRing,
    pub used: UsedRing,
}

/// A configured, enabled virtqueue.
pub struct Queue {
    queue: *mut SplitQueue,
    size: u16,
    notify: *mut u16,
    index: u16,
    interrupt: Option<InterruptLine>,
}

// SAFETY: the queue is driven from one thread at a time; the device side
// of the rings is synchronized through the idx fields.
unsafe impl Send for Queue {}

impl Queue {
    /// Wraps an allocated ring block.
    ///
    /// # Safety
    ///
    /// `queue` must point at a zeroed `SplitQueue` whose physical address
    /// the device was programmed with (or which only a test touches), and
    /// `notify` must be a writable doorbell location.
    pub unsafe fn new(
        queue: *mut SplitQueue,
        size: u16,
        notify: *mut u16,
        index: u16,
        interrupt: Option<InterruptLine>,
    ) -> Self {
        Self {
            queue,
            size,
            notify,
            index,
            interrupt,
        }
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    /// Blocks until this queue's interrupt fires. Queues without a line
    /// (tests) spin.
    fn wait_interrupt(&self) {
        match &self.interrupt {
            Some(line) => line.wait(),
            None => core::hint::spin_loop(),
        }
    }

    /// Reads `used.idx` with acquire ordering; ring entries published
    /// before it are visible afterwards.
    pub fn load_used_idx(&self) -> u16 {
        // SAFETY: the field is 2-byte aligned inside the ring block.
        unsafe {
            (*(core::ptr::addr_of!((*self.queue).used.idx) as *const AtomicU16))
                .load(Ordering::Acquire)
        }
    }

    /// The driver-owned available index.
    pub fn avail_idx(&self) -> u16 {
        // SAFETY: driver-owned field.
        unsafe { core::ptr::read_volatile(core::ptr::addr_of!((*self.queue).available.idx)) }
    }

    /// Publishes descriptors up to `idx` and rings the doorbell. The
    /// release store orders every descriptor and ring write before the
    /// index becomes visible to the device.
    pub fn notify_device(&self, idx: u16) {
        // SAFETY: as in load_used_idx.
        unsafe {
            (*(core::ptr::addr_of_mut!((*self.queue).available.idx) as *const AtomicU16))
                .store(idx, Ordering::Release);
            core::ptr::write_volatile(self.notify, self.index);
        }
    }

    fn write_descriptor(&self, idx: u16, desc: Descriptor) {
        // SAFETY: idx < size <= MAX_QUEUE_SIZE.
        unsafe {
            core::ptr::write_volatile(
                core::ptr::addr_of_mut!((*self.queue).descriptors[idx as usize]),
                desc,
            )
        }
    }

    fn read_descriptor(&self, idx: u16) -> Descriptor {
        // SAFETY: as above.
        unsafe {
            core::ptr::read_volatile(core::ptr::addr_of!((*self.queue).descriptors[idx as usize]))
        }
    }

    fn set_descriptor_link(&self, idx: u16, next: u16) {
        let mut d = self.read_descriptor(idx);
        d.flags |= DESC_F_NEXT;
        d.next = next;
        self.write_descriptor(idx, d);
    }

    fn write_avail_entry(&self, slot: u16, value: u16) {
        // SAFETY: slot < size.
        unsafe {
            core::ptr::write_volatile(
                core::ptr::addr_of_mut!((*self.queue).available.ring[slot as usize]),
                value,
            )
        }
    }

    fn read_used_entry(&self, slot: u16) -> UsedElem {
        // SAFETY: slot < size.
        unsafe {
            core::ptr::read_volatile(core::ptr::addr_of!((*self.queue).used.ring[slot as usize]))
        }
    }
}

/// A physically contiguous block backing part of an [`IoMem`].
#[derive(Debug, Clone, Copy)]
pub struct PhysBlock {
    pub addr: u64,
    pub size: usize,
}

/// A virtually contiguous buffer backed by one or more physically
/// contiguous blocks, for DMA payloads.
pub struct IoMem {
    base: *mut u8,
    len: usize,
    cap: usize,
    blocks: Vec<PhysBlock>,
}

// SAFETY: one owner at a time; the device only touches what descriptors
// point at.
unsafe impl Send for IoMem {}

impl IoMem {
    /// Reserves `capacity` bytes of address space and commits the first
    /// `size` bytes with physical backing.
    pub fn new(size: usize, capacity: usize) -> Result<Self, VirtioError> {
        let capacity = (capacity + sdk::PAGE_SIZE - 1) & !(sdk::PAGE_SIZE - 1);
        let base = sdk::mmap_anon(capacity).map_err(|_| VirtioError::MapFailed)?;
        let mut mem = Self {
            base,
            len: 0,
            cap: capacity,
            blocks: Vec::new(),
        };
        mem.ensure(size)?;
        Ok(mem)
    }

    /// Extends the committed prefix to at least `size` bytes.
    pub fn ensure(&mut self, size: usize) -> Result<(), VirtioError> {
        if size > self.cap {
            panic!("iomem: buffer overflow");
        }
        while self.len < size {
            let need = size - self.len;
            let (addr, got) = sdk::alloc_phys(need).map_err(|_| VirtioError::QueueMemory)?;
            sdk::iomap(self.base as u64 + self.len as u64, addr, got)
                .map_err(|_| VirtioError::MapFailed)?;
            self.blocks.push(PhysBlock { addr, size: got });
            self.len += got;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the committed prefix is mapped.
        unsafe { core::slice::from_raw_parts(self.base, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above.
        unsafe { core::slice::from_raw_parts_mut(self.base, self.len) }
    }

    /// A view of `[off, end)` with the physical blocks cut to match.
    pub fn region(&self, off: usize, end: usize) -> IoRegion {
        if end > self.len {
            panic!("iomem: slicing beyond committed length");
        }
        let mut blocks = Vec::new();
        let mut phys_off = 0usize;
        for b in &self.blocks {
            let mut addr = b.addr;
            let mut size = b.size as isize;
            let phys_end = phys_off + b.size;
            let lead = off as isize - phys_off as isize;
            phys_off = phys_end;
            if lead > 0 {
                addr += lead as u64;
                size -= lead;
                if size <= 0 {
                    // Block entirely before the range.
                    continue;
                }
            }
            let tail = phys_end as isize - end as isize;
            if tail > 0 {
                size -= tail;
                if size <= 0 {
                    // Block entirely after the range.
                    break;
                }
            }
            blocks.push(PhysBlock {
                addr,
                size: size as usize,
            });
        }
        // SAFETY: the view stays within the committed prefix.
        unsafe { IoRegion::from_raw(self.base.add(off), end - off, blocks) }
    }
}

/// A borrowed DMA view: virtual pointer plus matching physical blocks.
pub struct IoRegion {
    ptr: *mut u8,
    len: usize,
    blocks: Vec<PhysBlock>,
}

// SAFETY: see IoMem.
unsafe impl Send for IoRegion {}

impl IoRegion {
    /// # Safety
    ///
    /// `ptr` must stay valid for `len` bytes and `blocks` must describe
    /// the same bytes physically (tests may fabricate this as long as the
    /// descriptors built from it are only read by the test).
    pub unsafe fn from_raw(ptr: *mut u8, len: usize, blocks: Vec<PhysBlock>) -> Self {
        Self { ptr, len, blocks }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn blocks(&self) -> &[PhysBlock] {
        &self.blocks
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: from_raw's contract.
        unsafe { core::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: from_raw's contract.
        unsafe { core::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

/// A virtio device bound through its PCI function.
pub struct Device {
    addr: pci::Address,
    cfg: *mut CommonCfg,
    interrupts: Option<pci::InterruptTable>,
    used_interrupts: usize,
    notify_base: *mut u8,
    notify_len: usize,
    notify_multiplier: u32,
}

// SAFETY: one driver owns the device.
unsafe impl Send for Device {}

impl Device {
    /// Finds the first modern virtio device of `device_type` on the bus.
    pub fn open(device_type: u16) -> Result<Self, VirtioError> {
        for addr in pci::detect() {
            if addr.read_vendor_id() != VIRTIO_VENDOR {
                continue;
            }
            let dev_id = addr.read_device_id();
            if !(DEVICE_ID_BASE..=DEVICE_ID_LAST).contains(&dev_id) {
                // Legacy virtio or not virtio at all.
                continue;
            }
            if dev_id - DEVICE_ID_BASE != device_type {
                continue;
            }
            return Self::bind(addr);
        }
        Err(VirtioError::NoDevice(device_type))
    }

    fn bind(addr: pci::Address) -> Result<Self, VirtioError> {
        let (cfg_ptr, cfg_len, _) = find_capability(addr, CAP_COMMON_CFG)?;
        if size_of::<CommonCfg>() > cfg_len {
            return Err(VirtioError::ConfigTooSmall);
        }
        let (notify_ptr, notify_len, notify_cap_off) = find_capability(addr, CAP_NOTIFY_CFG)?;
        // notify_off_multiplier sits right after the capability structure.
        let multiplier = addr.read_register(notify_cap_off + 16);
        Ok(Self {
            addr,
            cfg: cfg_ptr as *mut CommonCfg,
            interrupts: None,
            used_interrupts: 0,
            notify_base: notify_ptr,
            notify_len,
            notify_multiplier: multiplier,
        })
    }

    /// Maps this device's configuration window of the given kind.
    pub fn map_device_config(&self, kind: u8) -> Result<(*mut u8, usize), VirtioError> {
        let (ptr, len, _) = find_capability(self.addr, kind)?;
        Ok((ptr, len))
    }

    /// The config generation counter; bumped by the device whenever any
    /// config field changes under the driver.
    pub fn config_generation(&self) -> u8 {
        cfg_read!(self.cfg, config_generation)
    }

    /// Resets the device, waits for the reset to take, then acknowledges
    /// it.
    pub fn reset(&self) {
        cfg_write!(self.cfg, device_status, 0);
        while cfg_read!(self.cfg, device_status) != 0 {
            core::hint::spin_loop();
        }
        cfg_write!(
            self.cfg,
            device_status,
            STATUS_ACKNOWLEDGE | STATUS_DRIVER
        );
    }

    /// Declares the driver ready.
    pub fn start(&self) {
        let status = cfg_read!(self.cfg, device_status);
        cfg_write!(self.cfg, device_status, status | STATUS_DRIVER_OK);
    }

    /// Reads the first 64 feature bits.
    pub fn features(&self) -> u64 {
        cfg_write!(self.cfg, device_feature_select, 0);
        let mut feats = cfg_read!(self.cfg, device_feature) as u64;
        cfg_write!(self.cfg, device_feature_select, 1);
        feats |= (cfg_read!(self.cfg, device_feature) as u64) << 32;
        feats
    }

    /// Writes the driver's feature subset back and verifies the device
    /// kept FEATURES_OK; marks the device FAILED otherwise.
    pub fn negotiate_features(&self, feats: u64) -> Result<(), VirtioError> {
        cfg_write!(self.cfg, driver_feature_select, 0);
        cfg_write!(self.cfg, driver_feature, feats as u32);
        cfg_write!(self.cfg, driver_feature_select, 1);
        cfg_write!(self.cfg, driver_feature, (feats >> 32) as u32);
        let status = cfg_read!(self.cfg, device_status);
        cfg_write!(self.cfg, device_status, status | STATUS_FEATURES_OK);
        if cfg_read!(self.cfg, device_status) & STATUS_FEATURES_OK == 0 {
            let status = cfg_read!(self.cfg, device_status);
            cfg_write!(self.cfg, device_status, status | STATUS_FAILED);
            return Err(VirtioError::FeatureNegotiationFailed);
        }
        Ok(())
    }

    fn setup_interrupt(&mut self) -> Result<(u16, InterruptLine), VirtioError> {
        if self.interrupts.is_none() {
            let table = self
                .addr
                .init_interrupts()
                .map_err(|_| VirtioError::NoInterrupts)?;
            self.interrupts = Some(table);
        }
        let table = self.interrupts.as_ref().unwrap();
        let msix_idx = self.used_interrupts;
        if msix_idx >= table.num_interrupts() {
            return Err(VirtioError::NoInterrupts);
        }
        let (msg, line) = alloc_interrupt().ok_or(VirtioError::NoInterrupts)?;
        self.used_interrupts += 1;
        table.setup_interrupt(msix_idx, true, msg.addr, msg.data);
        Ok((msix_idx as u16, line))
    }

    /// Binds an MSI-X vector to configuration-change notifications.
    pub fn config_interrupt(&mut self) -> Result<InterruptLine, VirtioError> {
        let (vector, line) = self.setup_interrupt()?;
        cfg_write!(self.cfg, msix_vector, vector);
        if cfg_read!(self.cfg, msix_vector) != vector {
            return Err(VirtioError::InterruptSetupFailed);
        }
        Ok(line)
    }

    /// Sets up queue `index`: allocates the ring block, programs its
    /// physical addresses, binds an MSI-X vector and enables the queue.
    pub fn configure_queue(&mut self, index: u16) -> Result<Queue, VirtioError> {
        if index >= cfg_read!(self.cfg, num_queues) {
            return Err(VirtioError::BadQueueIndex);
        }
        cfg_write!(self.cfg, queue_select, index);
        let mut qsz = cfg_read!(self.cfg, queue_size);
        if qsz == 0 {
            return Err(VirtioError::QueueUnavailable);
        }

        // One physically contiguous block for the whole ring structure.
        let ring_size = size_of::<SplitQueue>();
        let (paddr, got) = sdk::alloc_phys(ring_size).map_err(|_| VirtioError::QueueMemory)?;
        if got < ring_size {
            return Err(VirtioError::QueueMemory);
        }
        let vmem = sdk::mmap_anon(ring_size).map_err(|_| VirtioError::QueueMemory)?;
        sdk::iomap(vmem as u64, paddr, got).map_err(|_| VirtioError::MapFailed)?;

        cfg_write!(
            self.cfg,
            queue_desc,
            paddr + offset_of!(SplitQueue, descriptors) as u64
        );
        cfg_write!(
            self.cfg,
            queue_driver,
            paddr + offset_of!(SplitQueue, available) as u64
        );
        cfg_write!(
            self.cfg,
            queue_device,
            paddr + offset_of!(SplitQueue, used) as u64
        );

        let notify_off =
            self.notify_multiplier as usize * cfg_read!(self.cfg, queue_notify_off) as usize;
        // The 16-bit doorbell must fit inside the notification window.
        if notify_off + 2 > self.notify_len {
            return Err(VirtioError::ConfigTooSmall);
        }
        // SAFETY: bounds checked above.
        let notify = unsafe { self.notify_base.add(notify_off) } as *mut u16;

        if qsz as usize > MAX_QUEUE_SIZE {
            qsz = MAX_QUEUE_SIZE as u16;
            cfg_write!(self.cfg, queue_size, qsz);
        }

        let (vector, line) = self.setup_interrupt()?;
        cfg_write!(self.cfg, queue_msix_vector, vector);
        if cfg_read!(self.cfg, queue_msix_vector) != vector {
            return Err(VirtioError::InterruptSetupFailed);
        }

        cfg_write!(self.cfg, queue_enable, 1);
        // SAFETY: the ring block is zeroed (fresh physical pages) and the
        // device was just programmed with its physical address.
        Ok(unsafe { Queue::new(vmem as *mut SplitQueue, qsz, notify, index, Some(line)) })
    }
}

/// Walks the PCI capability list for a vendor capability of the given
/// virtio kind and maps the MMIO window it names. Returns the mapping,
/// its length and the capability's own config-space offset.
fn find_capability(addr: pci::Address, kind: u8) -> Result<(*mut u8, usize, u8), VirtioError> {
    if addr.read_status() & (1 << 3) == 0 {
        // No capability list at all.
        return Err(VirtioError::CapabilityNotFound(kind));
    }
    let mut next_cap = addr.read_cap_offset();
    while next_cap != 0 {
        let cap_off = next_cap;
        let w0 = addr.read_register(cap_off);
        let w1 = addr.read_register(cap_off + 4);
        let w2 = addr.read_register(cap_off + 8);
        let w3 = addr.read_register(cap_off + 12);
        next_cap = (w0 >> 8) as u8;
        if w0 as u8 != PCI_CAP_ID_VNDR {
            continue;
        }
        if (w0 >> 24) as u8 != kind {
            continue;
        }
        let bar = w1 as u8;
        if bar > 0x5 {
            // Reserved BAR index.
            continue;
        }
        let (bar_addr, _, is_mem) = addr.read_bar(bar);
        if !is_mem {
            // Only memory-mapped windows are supported.
            continue;
        }
        let offset = w2 as u64;
        let length = w3 as usize;
        let ptr = sdk::map(bar_addr + offset, length).map_err(|_| VirtioError::MapFailed)?;
        return Ok((ptr, length, cap_off));
    }
    Err(VirtioError::CapabilityNotFound(kind))
}

/// Device-to-driver stream reader.
///
/// Every descriptor is pre-populated with a write-flagged buffer carved
/// out of one fixed [`IoRegion`]; `fill` keeps all free descriptors
/// available and `read` drains used ones in order.
pub struct Reader {
    q: Queue,
    /// Ring index of the descriptor currently being read.
    used: u16,
    /// Bytes already consumed from that descriptor.
    read: usize,
    buffer: IoRegion,
    /// Descriptor index to offset within `buffer`.
    offsets: Vec<usize>,
}

impl Reader {
    /// Carves `buffer` into `desc_size` pieces and binds one to each
    /// descriptor. The buffer must cover the whole queue.
    pub fn new(q: Queue, buffer: IoRegion, desc_size: usize) -> Result<Self, VirtioError> {
        let size = q.size();
        let mut offsets = alloc::vec![0usize; size as usize];
        let mut desc: u16 = 0;
        let mut buf_offset = 0usize;
        'outer: for b in buffer.blocks() {
            let mut block_off = 0usize;
            loop {
                if desc >= size {
                    break 'outer;
                }
                let piece = desc_size.min(b.size - block_off);
                if piece == 0 {
                    break;
                }
                offsets[desc as usize] = buf_offset;
                q.write_descriptor(
                    desc,
                    Descriptor {
                        addr: b.addr + block_off as u64,
                        len: piece as u32,
                        flags: DESC_F_WRITE,
                        next: 0,
                    },
                );
                buf_offset += piece;
                block_off += piece;
                desc += 1;
            }
        }
        if desc != size {
            return Err(VirtioError::BufferTooSmall);
        }
        let mut r = Self {
            q,
            used: 0,
            read: 0,
            buffer,
            offsets,
        };
        r.fill();
        Ok(r)
    }

    /// Makes every descriptor not currently owned by the device available
    /// again.
    fn fill(&mut self) {
        let size = self.q.size();
        let mut avail = self.q.avail_idx();
        loop {
            let desc = avail;
            let limit = self.used.wrapping_sub(1);
            if limit.wrapping_sub(desc) % size == 0 {
                break;
            }
            let slot = desc % size;
            self.q.write_avail_entry(slot, slot);
            avail = avail.wrapping_add(1);
        }
        self.q.notify_device(avail);
    }

    /// Blocks until the device has produced data, then copies as much as
    /// fits into `buf`. Partial descriptors are resumed on the next call.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, VirtioError> {
        let size = self.q.size();
        let mut n = 0usize;
        let mut qused;
        loop {
            qused = self.q.load_used_idx();
            if qused != self.used {
                break;
            }
            self.q.wait_interrupt();
        }
        let src = self.buffer.as_slice();
        let mut out = buf;
        while qused != self.used {
            let slot = self.used % size;
            let elem = self.q.read_used_entry(slot);
            if elem.id as u16 != slot {
                return Err(VirtioError::OutOfOrderDescriptor);
            }
            let off = self.offsets[slot as usize];
            let chunk = &src[off + self.read..off + elem.len as usize];
            let copied = chunk.len().min(out.len());
            out[..copied].copy_from_slice(&chunk[..copied]);
            self.read += copied;
            let rest = core::mem::take(&mut out);
            out = &mut rest[copied..];
            n += copied;
            if out.is_empty() {
                break;
            }
            self.used = self.used.wrapping_add(1);
            self.read = 0;
        }
        self.fill();
        Ok(n)
    }
}

/// Request/response submitter over one virtqueue.
///
/// Free descriptors live on a stack; `command` links one chain per
/// request/response pair, `read` returns completed chains to the stack,
/// `sync` drains the queue completely.
pub struct Commander {
    q: Queue,
    /// Used-ring cursor of the last `read`.
    used: u16,
    free_desc: Vec<u16>,
}

impl Commander {
    pub fn new(q: Queue) -> Self {
        let free_desc = (0..q.size()).collect();
        Self {
            q,
            used: 0,
            free_desc,
        }
    }

    /// Number of descriptors on the free stack. The conservation law
    /// `free + in-flight == queue size` holds at every quiescent point.
    pub fn free_descriptors(&self) -> usize {
        self.free_desc.len()
    }

    fn alloc_desc(&mut self) -> u16 {
        self.free_desc.pop().expect("descriptor stack underflow")
    }

    /// Submits a request/response pair as one descriptor chain: the
    /// request blocks device-readable, the response blocks device-
    /// writable. Returns false when the free stack cannot cover the
    /// chain; the caller is expected to `read` completions and retry.
    pub fn command(&mut self, req: &IoRegion, resp: &IoRegion) -> bool {
        debug_assert!(!req.blocks().is_empty());
        if self.free_desc.len() < req.blocks().len() + resp.blocks().len() {
            if self.q.load_used_idx() != self.q.avail_idx() {
                // Completions are outstanding; wait for some.
                self.q.wait_interrupt();
            }
            return false;
        }
        let avail = self.q.avail_idx();
        let mut first = true;
        let mut prev: Option<u16> = None;
        for b in req.blocks() {
            let idx = self.alloc_desc();
            if let Some(p) = prev {
                self.q.set_descriptor_link(p, idx);
            }
            if first {
                self.q.write_avail_entry(avail % self.q.size(), idx);
                first = false;
            }
            self.q.write_descriptor(
                idx,
                Descriptor {
                    addr: b.addr,
                    len: b.size as u32,
                    flags: 0,
                    next: 0,
                },
            );
            prev = Some(idx);
        }
        for b in resp.blocks() {
            let idx = self.alloc_desc();
            let p = prev.expect("request chain is empty");
            self.q.set_descriptor_link(p, idx);
            self.q.write_descriptor(
                idx,
                Descriptor {
                    addr: b.addr,
                    len: b.size as u32,
                    flags: DESC_F_WRITE,
                    next: 0,
                },
            );
            prev = Some(idx);
        }
        self.q.notify_device(avail.wrapping_add(1));
        true
    }

    /// Drains the used ring, returning each completed chain's descriptors
    /// to the free stack. Returns the number of completed commands.
    pub fn read(&mut self) -> usize {
        let size = self.q.size();
        let mut count = 0usize;
        while self.used != self.q.load_used_idx() {
            let elem = self.q.read_used_entry(self.used % size);
            let mut did = elem.id as u16;
            let mut steps = 0;
            loop {
                self.free_desc.push(did);
                let desc = self.q.read_descriptor(did);
                if desc.flags & DESC_F_NEXT == 0 {
                    break;
                }
                did = desc.next;
                steps += 1;
                if steps > size {
                    panic!("corrupt descriptor chain");
                }
            }
            self.used = self.used.wrapping_add(1);
            count += 1;
        }
        count
    }

    /// Blocks until the device has consumed everything submitted.
    pub fn sync(&mut self) {
        while self.q.load_used_idx() != self.q.avail_idx() {
            self.q.wait_interrupt();
        }
    }
}
