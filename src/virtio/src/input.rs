//! Virtio-input driver.
//!
//! One event queue read through [`Reader`]; events are fixed 8-byte
//! `(type, code, value)` records. The device-config window answers
//! sub-queries (select, subselect, size) for the device name and per-axis
//! ranges. Mapping events to pointer semantics is the application's job;
//! this driver only hands them out in order.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::mem::size_of;

use crate::{Device, IoMem, Reader, VirtioError, CAP_DEVICE_CFG, DEVICE_TYPE_INPUT, F_VERSION_1};

// Event types.
pub const EV_SYN: u16 = 0x00;
pub const EV_KEY: u16 = 0x01;
pub const EV_REL: u16 = 0x02;
pub const EV_ABS: u16 = 0x03;

// Button and axis codes the pointer pipeline cares about.
pub const BTN_LEFT: u16 = 0x110;
pub const BTN_RIGHT: u16 = 0x111;
pub const BTN_MIDDLE: u16 = 0x112;
pub const REL_HWHEEL: u16 = 0x06;
pub const REL_WHEEL: u16 = 0x08;
pub const ABS_X: u16 = 0x00;
pub const ABS_Y: u16 = 0x01;

// Config selectors.
const CFG_ID_NAME: u8 = 0x01;
const CFG_ABS_INFO: u8 = 0x12;

const EVENT_QUEUE: u16 = 0;

/// Size of one wire event record.
pub const EVENT_SIZE: usize = size_of::<Event>();

/// One input event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Event {
    pub kind: u16,
    pub code: u16,
    pub value: u32,
}

/// Range information for one absolute axis.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct AbsInfo {
    pub min: u32,
    pub max: u32,
    pub fuzz: u32,
    pub flat: u32,
    pub res: u32,
}

/// The device-config window layout.
#[repr(C)]
struct InputConfig {
    select: u8,
    subsel: u8,
    size: u8,
    reserved: [u8; 5],
    subcfg: [u8; 128],
}

/// Input driver errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputError {
    Transport(VirtioError),
    /// The device has no information for the requested axis.
    NoAxisInfo,
    /// The axis record was shorter than expected.
    AxisInfoTruncated { got: usize, expected: usize },
}

impl From<VirtioError> for InputError {
    fn from(err: VirtioError) -> Self {
        InputError::Transport(err)
    }
}

impl fmt::Display for InputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputError::Transport(e) => write!(f, "virtio: {}", e),
            InputError::NoAxisInfo => f.write_str("no axis information"),
            InputError::AxisInfoTruncated { got, expected } => {
                write!(f, "axis info truncated to {}, expected {}", got, expected)
            }
        }
    }
}

/// A virtio input device.
pub struct Input {
    name: String,
    cfg: *mut InputConfig,
    reader: Reader,
    /// Reassembly buffer between the ring and the caller.
    buf: Vec<u8>,
    off: usize,
    /// Keeps the DMA window alive for the device's benefit.
    _dma: IoMem,
}

// SAFETY: one owner drives the device.
unsafe impl Send for Input {}

impl Input {
    /// Finds and initializes the first virtio input device.
    pub fn open() -> Result<Self, InputError> {
        let mut dev = Device::open(DEVICE_TYPE_INPUT)?;
        let (cfg_ptr, cfg_len) = dev.map_device_config(CAP_DEVICE_CFG)?;
        if size_of::<InputConfig>() > cfg_len {
            return Err(VirtioError::ConfigTooSmall.into());
        }
        let cfg = cfg_ptr as *mut InputConfig;

        let need = F_VERSION_1;
        let (name, eventq) = loop {
            let before = dev.config_generation();
            dev.reset();
            let feats = dev.features();
            if feats & need != need {
                return Err(VirtioError::MissingFeatures { got: feats, need }.into());
            }
            dev.negotiate_features(need)?;
            let name = match query_config(cfg, CFG_ID_NAME, 0) {
                Some(mut raw) => {
                    // The virtio spec says strings carry no trailing NUL,
                    // but QEMU pads with them anyway.
                    while raw.last() == Some(&0) {
                        raw.pop();
                    }
                    String::from_utf8_lossy(&raw).into_owned()
                }
                None => String::new(),
            };
            let eventq = dev.configure_queue(EVENT_QUEUE)?;
            if dev.config_generation() != before {
                // Configuration changed under us.
                continue;
            }
            dev.start();
            break (name, eventq);
        };

        let buf_size = eventq.size() as usize * EVENT_SIZE;
        let dma = IoMem::new(buf_size, buf_size)?;
        let reader = Reader::new(eventq, dma.region(0, buf_size), EVENT_SIZE)?;
        Ok(Self {
            name,
            cfg,
            reader,
            buf: alloc::vec![0u8; buf_size],
            off: 0,
            _dma: dma,
        })
    }

    /// The device name reported through the config window.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queries min/max/fuzz/flat/resolution for an absolute axis.
    pub fn abs_info(&self, axis: u16) -> Result<AbsInfo, InputError> {
        let raw = query_config(self.cfg, CFG_ABS_INFO, axis as u8).ok_or(InputError::NoAxisInfo)?;
        if raw.len() < size_of::<AbsInfo>() {
            return Err(InputError::AxisInfoTruncated {
                got: raw.len(),
                expected: size_of::<AbsInfo>(),
            });
        }
        // SAFETY: length checked; AbsInfo is plain data.
        Ok(unsafe { core::ptr::read_unaligned(raw.as_ptr() as *const AbsInfo) })
    }

    /// Reads events into `events`, blocking until at least one whole
    /// record is available. Returns the number of events delivered, in
    /// device order.
    pub fn read(&mut self, events: &mut [Event]) -> Result<usize, InputError> {
        if self.off < EVENT_SIZE {
            let n = self.reader.read(&mut self.buf[self.off..])?;
            self.off += n;
        }
        let mut consumed = 0usize;
        let mut delivered = 0usize;
        while self.off - consumed >= EVENT_SIZE && delivered < events.len() {
            let bytes = &self.buf[consumed..consumed + EVENT_SIZE];
            // SAFETY: bytes holds exactly one wire record.
            events[delivered] =
                unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const Event) };
            consumed += EVENT_SIZE;
            delivered += 1;
        }
        self.buf.copy_within(consumed..self.off, 0);
        self.off -= consumed;
        Ok(delivered)
    }
}

/// Runs one config sub-query; None when the device reports size zero.
fn query_config(cfg: *mut InputConfig, select: u8, subsel: u8) -> Option<Vec<u8>> {
    // SAFETY: the config window is mapped and size-checked at open.
    unsafe {
        core::ptr::write_volatile(core::ptr::addr_of_mut!((*cfg).select), select);
        core::ptr::write_volatile(core::ptr::addr_of_mut!((*cfg).subsel), subsel);
        let size = core::ptr::read_volatile(core::ptr::addr_of!((*cfg).size)) as usize;
        if size == 0 {
            return None;
        }
        let size = size.min(128);
        let mut out = alloc::vec![0u8; size];
        for (i, b) in out.iter_mut().enumerate() {
            *b = core::ptr::read_volatile(core::ptr::addr_of!((*cfg).subcfg[i]));
        }
        Some(out)
    }
}
