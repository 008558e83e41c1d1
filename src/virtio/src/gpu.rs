//! Virtio-GPU driver.
//!
//! Two queues: control (resources, transfers, VirGL command submission)
//! and cursor, both driven through [`Commander`]. 3D work goes through the
//! VirGL command stream: individual commands are batched into one
//! SUBMIT_3D message in a staging buffer and the message's size field is
//! patched when the batch flushes. Submission errors are sticky and
//! surface on the next [`Gpu::flush_3d`].

use alloc::vec::Vec;
use core::fmt;
use core::mem::size_of;

use ydin_sdk::interrupt::InterruptLine;

use crate::{
    Commander, Device, IoMem, IoRegion, VirtioError, CAP_DEVICE_CFG, DEVICE_TYPE_GPU,
    F_VERSION_1,
};

/// VirGL (3D) support feature bit.
const F_VIRGL: u64 = 1 << 0;

const MAX_SCANOUTS: usize = 16;

const CONTROL_QUEUE: u16 = 0;
const CURSOR_QUEUE: u16 = 1;

// 2D control commands.
const CMD_GET_DISPLAY_INFO: u32 = 0x0100;
const CMD_RESOURCE_CREATE_2D: u32 = 0x0101;
const CMD_RESOURCE_UNREF: u32 = 0x0102;
const CMD_SET_SCANOUT: u32 = 0x0103;
const CMD_RESOURCE_FLUSH: u32 = 0x0104;
const CMD_TRANSFER_TO_HOST_2D: u32 = 0x0105;
const CMD_RESOURCE_ATTACH_BACKING: u32 = 0x0106;
const CMD_RESOURCE_DETACH_BACKING: u32 = 0x0107;
const CMD_GET_CAPSET_INFO: u32 = 0x0108;
const CMD_GET_CAPSET: u32 = 0x0109;

// 3D control commands.
const CMD_CTX_CREATE: u32 = 0x0200;
const CMD_CTX_ATTACH_RESOURCE: u32 = 0x0202;
const CMD_CTX_DETACH_RESOURCE: u32 = 0x0203;
const CMD_RESOURCE_CREATE_3D: u32 = 0x0204;
const CMD_SUBMIT_3D: u32 = 0x0207;

// Cursor commands.
const CMD_UPDATE_CURSOR: u32 = 0x0300;
const CMD_MOVE_CURSOR: u32 = 0x0301;

// Responses.
const RESP_OK_DISPLAY_INFO: u32 = 0x1101;
const RESP_OK_CAPSET_INFO: u32 = 0x1102;
const RESP_OK_CAPSET: u32 = 0x1103;

const FLAG_FENCE: u32 = 1 << 0;

/// Cursor surface format (BGRA, sRGB).
pub const FORMAT_B8G8R8A8_SRGB: u32 = 100;

/// VirGL command-stream opcodes used by the batch encoder itself; the
/// application encodes the rest.
pub const CCMD_COPY_TRANSFER3D: u8 = 45;

/// Staging-only resource bind flag.
pub const BIND_STAGING: u32 = 1 << 19;

/// The host supports COPY_TRANSFER3D out of guest-attached backing.
const VIRGL_CAP_COPY_TRANSFER: u32 = 1 << 26;

/// A device-side resource id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resource(pub u32);

/// GPU driver errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuError {
    Transport(VirtioError),
    /// Cursors must be 64x64 BGRA.
    CursorFormat,
    /// The device reports no enabled scanout.
    NoScanout,
    /// VIRGL capset v2 is unavailable.
    CapsetVersion { got: u32, need: u32 },
    /// The capset response is smaller than the capability structure.
    CapsetTooSmall,
    /// An unexpected control response type.
    BadResponse { got: u32 },
    /// The host cannot do staged copy transfers.
    NoCopyTransfer,
}

impl From<VirtioError> for GpuError {
    fn from(err: VirtioError) -> Self {
        GpuError::Transport(err)
    }
}

impl fmt::Display for GpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuError::Transport(e) => write!(f, "virtio: {}", e),
            GpuError::CursorFormat => f.write_str("cursor is not 64x64 BGRA"),
            GpuError::NoScanout => f.write_str("no available scanouts"),
            GpuError::CapsetVersion { got, need } => {
                write!(f, "VIRGL capset version {}, expected at least {}", got, need)
            }
            GpuError::CapsetTooSmall => f.write_str("capset response too small"),
            GpuError::BadResponse { got } => write!(f, "invalid control response {:#x}", got),
            GpuError::NoCopyTransfer => f.write_str("VIRGL_CAP_COPY_TRANSFER not supported"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Copy, Default)]
#[repr(C)]
struct CtrlHdr {
    hdr_type: u32,
    flags: u32,
    fence_id: u64,
    ctx_id: u32,
    padding: u32,
}

#[repr(C)]
struct GpuConfig {
    events_read: u32,
    events_clear: u32,
    num_scanouts: u32,
    reserved: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct GetCapsetInfoReq {
    hdr: CtrlHdr,
    capset_index: u32,
    padding: u32,
}

#[derive(Clone, Copy, Default)]
#[repr(C)]
struct CapsetInfoResp {
    hdr: CtrlHdr,
    capset_id: u32,
    capset_max_version: u32,
    capset_max_size: u32,
    padding: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct GetCapsetReq {
    hdr: CtrlHdr,
    capset_id: u32,
    capset_version: u32,
}

#[derive(Clone, Copy, Default)]
#[repr(C)]
struct DisplayMode {
    r: Rect,
    enabled: u32,
    flags: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct DisplayInfoResp {
    hdr: CtrlHdr,
    pmodes: [DisplayMode; MAX_SCANOUTS],
}

#[derive(Clone, Copy)]
#[repr(C)]
struct ResourceCreate2dReq {
    hdr: CtrlHdr,
    resource_id: u32,
    format: u32,
    width: u32,
    height: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct SetScanoutReq {
    hdr: CtrlHdr,
    r: Rect,
    scanout_id: u32,
    resource_id: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct ResourceAttachBackingReq {
    hdr: CtrlHdr,
    resource_id: u32,
    nr_entries: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct ResourceDetachBackingReq {
    hdr: CtrlHdr,
    resource_id: u32,
    padding: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct TransferToHost2dReq {
    hdr: CtrlHdr,
    r: Rect,
    offset: u64,
    resource_id: u32,
    padding: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct ResourceFlushReq {
    hdr: CtrlHdr,
    r: Rect,
    resource_id: u32,
    padding: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct MemEntry {
    addr: u64,
    length: u32,
    padding: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct CtxCreateReq {
    hdr: CtrlHdr,
    nlen: u32,
    padding: u32,
    debug_name: [u8; 64],
}

#[derive(Clone, Copy)]
#[repr(C)]
struct CtxResourceReq {
    hdr: CtrlHdr,
    resource_id: u32,
    padding: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct CmdSubmitReq {
    hdr: CtrlHdr,
    size: u32,
    padding: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct ResourceUnrefReq {
    hdr: CtrlHdr,
    resource_id: u32,
    padding: u32,
}

/// Parameters for RESOURCE_CREATE_3D.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceCreate3d {
    pub target: u32,
    pub format: u32,
    pub bind: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub array_size: u32,
    pub flags: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct ResourceCreate3dReq {
    hdr: CtrlHdr,
    resource_id: u32,
    target: u32,
    format: u32,
    bind: u32,
    width: u32,
    height: u32,
    depth: u32,
    array_size: u32,
    last_level: u32,
    nr_samples: u32,
    flags: u32,
    padding: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct CursorPos {
    scanout_id: u32,
    x: u32,
    y: u32,
    padding: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct UpdateCursorReq {
    hdr: CtrlHdr,
    pos: CursorPos,
    resource_id: u32,
    hot_x: u32,
    hot_y: u32,
    padding: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct FormatMask {
    bitmask: [u32; 16],
}

#[derive(Clone, Copy)]
#[repr(C)]
struct CapsV1 {
    max_version: u32,
    sampler: FormatMask,
    render: FormatMask,
    depthstencil: FormatMask,
    vertexbuffer: FormatMask,
    bset: u32,
    glsl_level: u32,
    max_texture_array_layers: u32,
    max_streamout_buffers: u32,
    max_dual_source_render_targets: u32,
    max_render_targets: u32,
    max_samples: u32,
    prim_mask: u32,
    max_tbo_size: u32,
    max_uniform_blocks: u32,
    max_viewports: u32,
    max_texture_gather_components: u32,
}

/// VIRGL capset v2, as far as this driver reads it.
#[derive(Clone, Copy)]
#[repr(C)]
struct CapsV2 {
    v1: CapsV1,
    min_aliased_point_size: f32,
    max_aliased_point_size: f32,
    min_smooth_point_size: f32,
    max_smooth_point_size: f32,
    min_aliased_line_width: f32,
    max_aliased_line_width: f32,
    min_smooth_line_width: f32,
    max_smooth_line_width: f32,
    max_texture_lod_bias: f32,
    max_geom_output_vertices: u32,
    max_geom_total_output_components: u32,
    max_vertex_outputs: u32,
    max_vertex_attribs: u32,
    max_shader_patch_varyings: u32,
    min_texel_offset: i32,
    max_texel_offset: i32,
    min_texture_gather_offset: i32,
    max_texture_gather_offset: i32,
    texture_buffer_offset_alignment: u32,
    uniform_buffer_offset_alignment: u32,
    shader_buffer_offset_alignment: u32,
    capability_bits: u32,
}

struct Batch {
    begun: bool,
    offset: usize,
    size: usize,
}

/// The virtio-GPU device.
pub struct Gpu {
    dev: Device,
    config: *mut GpuConfig,
    config_line: InterruptLine,
    control: Commander,
    cursor: Commander,
    staging: IoMem,
    staging_off: usize,
    batch: Batch,
    scanout_id: u32,
    scanout_rect: Rect,
    ctx_id: u32,
    next_id: u32,
    submit_err: Option<GpuError>,
}

// SAFETY: one owner drives the device.
unsafe impl Send for Gpu {}

fn write_struct<T: Copy>(region: &mut IoRegion, value: T) {
    debug_assert!(size_of::<T>() <= region.len());
    // SAFETY: region covers at least size_of::<T>() writable bytes.
    unsafe {
        core::ptr::write_unaligned(region.as_mut_slice().as_mut_ptr() as *mut T, value);
    }
}

fn read_struct<T: Copy>(region: &IoRegion, offset: usize) -> T {
    debug_assert!(offset + size_of::<T>() <= region.len());
    // SAFETY: bounds asserted; unaligned reads are fine for plain data.
    unsafe { core::ptr::read_unaligned(region.as_slice().as_ptr().add(offset) as *const T) }
}

/// Encodes a VirGL command header: `size << 16 | subtype << 8 | type`,
/// size in 32-bit words excluding the header itself.
pub fn encode_cmd_header(size: u16, typ: u8, subtype: u8) -> u32 {
    (size as u32) << 16 | (subtype as u32) << 8 | typ as u32
}

impl Gpu {
    /// Finds and initializes the GPU: feature negotiation (VERSION_1 and
    /// VIRGL required), both queues, the capset check and a rendering
    /// context.
    pub fn open() -> Result<Self, GpuError> {
        let mut dev = Device::open(DEVICE_TYPE_GPU)?;
        let (cfg_ptr, cfg_len) = dev.map_device_config(CAP_DEVICE_CFG)?;
        if size_of::<GpuConfig>() > cfg_len {
            return Err(VirtioError::ConfigTooSmall.into());
        }

        let need = F_VERSION_1 | F_VIRGL;
        let (controlq, cursorq) = loop {
            let before = dev.config_generation();
            dev.reset();
            let feats = dev.features();
            if feats & need != need {
                return Err(VirtioError::MissingFeatures { got: feats, need }.into());
            }
            dev.negotiate_features(need)?;
            let controlq = dev.configure_queue(CONTROL_QUEUE)?;
            let cursorq = dev.configure_queue(CURSOR_QUEUE)?;
            if dev.config_generation() != before {
                // Configuration changed under us; redo the dance.
                continue;
            }
            dev.start();
            break (controlq, cursorq);
        };

        let config_line = dev.config_interrupt()?;
        let staging = IoMem::new(0, 10_000_000)?;

        let mut gpu = Self {
            dev,
            config: cfg_ptr as *mut GpuConfig,
            config_line,
            control: Commander::new(controlq),
            cursor: Commander::new(cursorq),
            staging,
            staging_off: 0,
            batch: Batch {
                begun: false,
                offset: 0,
                size: 0,
            },
            scanout_id: 0,
            scanout_rect: Rect::default(),
            ctx_id: 0,
            next_id: 0,
            submit_err: None,
        };

        let caps = gpu.query_caps()?;
        if caps.capability_bits & VIRGL_CAP_COPY_TRANSFER == 0 {
            return Err(GpuError::NoCopyTransfer);
        }
        let ctx_id = gpu.cmd_ctx_create();
        gpu.flush_3d()?;
        gpu.ctx_id = ctx_id;
        Ok(gpu)
    }

    /// Interrupt line for configuration-change events.
    pub fn config_notify(&self) -> &InterruptLine {
        &self.config_line
    }

    /// Queries the display and returns the active scanout's dimensions.
    pub fn query_scanout(&mut self) -> Result<(u32, u32), GpuError> {
        // SAFETY: the config window is mapped.
        let scanouts =
            unsafe { core::ptr::read_volatile(core::ptr::addr_of!((*self.config).num_scanouts)) };
        if scanouts == 0 {
            return Err(GpuError::NoScanout);
        }
        self.update_scanout()?;
        Ok((self.scanout_rect.width, self.scanout_rect.height))
    }

    /// The rectangle of the active scanout.
    pub fn scanout_rect(&self) -> Rect {
        self.scanout_rect
    }

    fn next_id(&mut self) -> u32 {
        if self.next_id == u32::MAX {
            panic!("out of resource ids");
        }
        self.next_id += 1;
        self.next_id
    }

    fn set_err(&mut self, err: GpuError) {
        if self.submit_err.is_none() {
            self.submit_err = Some(err);
        }
    }

    /// Flushes the staging buffer to the device when the next allocation
    /// would not fit.
    fn reserve(&mut self, size: usize) {
        if self.staging_off + size > self.staging.capacity() {
            self.sync();
        }
    }

    fn alloc(&mut self, size: usize) -> Result<IoRegion, GpuError> {
        self.reserve(size);
        self.staging.ensure(self.staging_off + size)?;
        let region = self.staging.region(self.staging_off, self.staging_off + size);
        self.staging_off += size;
        Ok(region)
    }

    /// Ends any open 3D batch, then carves request and response regions.
    fn alloc_command(
        &mut self,
        req_size: usize,
        resp_size: usize,
    ) -> Result<(IoRegion, IoRegion), GpuError> {
        self.flush_batch();
        let req = self.alloc(req_size)?;
        let resp = self.alloc(resp_size)?;
        Ok((req, resp))
    }

    /// Submits on the control queue, draining completions until the chain
    /// fits.
    fn command(&mut self, req: &IoRegion, resp: &IoRegion) {
        while !self.control.command(req, resp) {
            self.control.read();
        }
    }

    fn cursor_command(&mut self, req: &IoRegion, resp: &IoRegion) {
        while !self.cursor.command(req, resp) {
            self.cursor.read();
        }
    }

    /// Appends one VirGL command (header included) to the current
    /// SUBMIT_3D batch, opening a batch if necessary.
    pub fn submit_3d(&mut self, cmd: &[u8]) {
        let mut total = cmd.len() + size_of::<CtrlHdr>();
        if !self.batch.begun {
            total += size_of::<CmdSubmitReq>();
        }
        self.reserve(total);
        if !self.batch.begun {
            self.batch.size = 0;
            self.batch.offset = self.staging_off;
            let header = match self.alloc(size_of::<CmdSubmitReq>()) {
                Ok(h) => h,
                Err(e) => {
                    self.set_err(e);
                    return;
                }
            };
            let mut header = header;
            write_struct(
                &mut header,
                CmdSubmitReq {
                    hdr: CtrlHdr {
                        hdr_type: CMD_SUBMIT_3D,
                        ctx_id: self.ctx_id,
                        ..CtrlHdr::default()
                    },
                    // Patched in flush_batch once the batch is complete.
                    size: 0,
                    padding: 0,
                },
            );
            self.batch.begun = true;
        }
        let mut buf = match self.alloc(cmd.len()) {
            Ok(b) => b,
            Err(e) => {
                self.set_err(e);
                return;
            }
        };
        self.batch.size += cmd.len();
        buf.as_mut_slice().copy_from_slice(cmd);
    }

    /// Closes the open batch: patches the byte count into the SUBMIT_3D
    /// header and submits the whole staging span as one request.
    fn flush_batch(&mut self) {
        if !self.batch.begun {
            return;
        }
        let size_off = self.batch.offset + size_of::<CtrlHdr>();
        self.staging.as_mut_slice()[size_off..size_off + 4]
            .copy_from_slice(&(self.batch.size as u32).to_le_bytes());

        let req = self.staging.region(self.batch.offset, self.staging_off);
        let resp = match self.alloc(size_of::<CtrlHdr>()) {
            Ok(r) => r,
            Err(e) => {
                self.set_err(e);
                self.batch.begun = false;
                return;
            }
        };
        self.command(&req, &resp);
        self.batch.begun = false;
    }

    /// Flushes and waits until the control queue is idle, recycling the
    /// staging buffer.
    fn sync(&mut self) {
        self.flush_batch();
        self.control.sync();
        self.control.read();
        self.staging_off = 0;
        self.batch.begun = false;
    }

    /// Drains all outstanding 3D work; reports the first deferred
    /// submission error, which stays sticky.
    pub fn flush_3d(&mut self) -> Result<(), GpuError> {
        self.sync();
        match self.submit_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Creates a 64x64 BGRA cursor from `pixels` (row-major, 256-byte
    /// stride) and makes it the active cursor.
    pub fn new_cursor(&mut self, pixels: &[u8], hot_x: u32, hot_y: u32) -> Result<Resource, GpuError> {
        const W: usize = 64;
        const H: usize = 64;
        // The host rejects any other cursor geometry.
        if pixels.len() != W * H * 4 {
            return Err(GpuError::CursorFormat);
        }
        let res = self.cmd_resource_create_2d(FORMAT_B8G8R8A8_SRGB, W as u32, H as u32);
        let mut backing = self.alloc(pixels.len())?;
        backing.as_mut_slice().copy_from_slice(pixels);
        self.cmd_resource_attach_backing(res, &backing);
        self.cmd_transfer_to_host_2d(
            res,
            0,
            Rect {
                x: 0,
                y: 0,
                width: W as u32,
                height: H as u32,
            },
            true,
        );
        // The resource must exist host-side before the cursor uses it.
        self.flush_3d()?;
        self.cursor_cmd(CMD_UPDATE_CURSOR, res, 0, 0, hot_x, hot_y);
        Ok(res)
    }

    /// Moves the active cursor.
    pub fn move_cursor(&mut self, cursor: Resource, x: u32, y: u32) {
        self.cursor_cmd(CMD_MOVE_CURSOR, cursor, x, y, 0, 0);
    }

    fn cursor_cmd(&mut self, cmd: u32, res: Resource, x: u32, y: u32, hot_x: u32, hot_y: u32) {
        let (mut req, resp) =
            match self.alloc_command(size_of::<UpdateCursorReq>(), size_of::<CtrlHdr>()) {
                Ok(pair) => pair,
                Err(e) => {
                    self.set_err(e);
                    return;
                }
            };
        write_struct(
            &mut req,
            UpdateCursorReq {
                hdr: CtrlHdr {
                    hdr_type: cmd,
                    ..CtrlHdr::default()
                },
                pos: CursorPos {
                    scanout_id: self.scanout_id,
                    x,
                    y,
                    padding: 0,
                },
                resource_id: res.0,
                hot_x,
                hot_y,
                padding: 0,
            },
        );
        self.cursor_command(&req, &resp);
    }

    fn cmd_ctx_create(&mut self) -> u32 {
        let ctx_id = self.next_id();
        let (mut req, resp) =
            match self.alloc_command(size_of::<CtxCreateReq>(), size_of::<CtrlHdr>()) {
                Ok(pair) => pair,
                Err(e) => {
                    self.set_err(e);
                    return 0;
                }
            };
        let mut name = [0u8; 64];
        let text = b"gpu";
        name[..text.len()].copy_from_slice(text);
        write_struct(
            &mut req,
            CtxCreateReq {
                hdr: CtrlHdr {
                    hdr_type: CMD_CTX_CREATE,
                    ctx_id,
                    ..CtrlHdr::default()
                },
                nlen: text.len() as u32,
                padding: 0,
                debug_name: name,
            },
        );
        self.command(&req, &resp);
        ctx_id
    }

    /// Creates a 2D resource.
    pub fn cmd_resource_create_2d(&mut self, format: u32, width: u32, height: u32) -> Resource {
        let res = Resource(self.next_id());
        let (mut req, resp) =
            match self.alloc_command(size_of::<ResourceCreate2dReq>(), size_of::<CtrlHdr>()) {
                Ok(pair) => pair,
                Err(e) => {
                    self.set_err(e);
                    return Resource(0);
                }
            };
        write_struct(
            &mut req,
            ResourceCreate2dReq {
                hdr: CtrlHdr {
                    hdr_type: CMD_RESOURCE_CREATE_2D,
                    ..CtrlHdr::default()
                },
                resource_id: res.0,
                format,
                width,
                height,
            },
        );
        self.command(&req, &resp);
        res
    }

    /// Creates a 3D resource.
    pub fn cmd_resource_create_3d(&mut self, args: ResourceCreate3d) -> Resource {
        let res = Resource(self.next_id());
        let (mut req, resp) =
            match self.alloc_command(size_of::<ResourceCreate3dReq>(), size_of::<CtrlHdr>()) {
                Ok(pair) => pair,
                Err(e) => {
                    self.set_err(e);
                    return Resource(0);
                }
            };
        write_struct(
            &mut req,
            ResourceCreate3dReq {
                hdr: CtrlHdr {
                    hdr_type: CMD_RESOURCE_CREATE_3D,
                    ..CtrlHdr::default()
                },
                resource_id: res.0,
                target: args.target,
                format: args.format,
                bind: args.bind,
                width: args.width,
                height: args.height,
                depth: args.depth,
                array_size: args.array_size,
                last_level: 0,
                nr_samples: 0,
                flags: args.flags,
                padding: 0,
            },
        );
        self.command(&req, &resp);
        res
    }

    /// Attaches guest memory pages as the backing store of a resource.
    pub fn cmd_resource_attach_backing(&mut self, res: Resource, backing: &IoRegion) {
        let nentries = backing.blocks().len();
        let hdr_size = size_of::<ResourceAttachBackingReq>();
        let req_size = hdr_size + nentries * size_of::<MemEntry>();
        let blocks: Vec<MemEntry> = backing
            .blocks()
            .iter()
            .map(|b| MemEntry {
                addr: b.addr,
                length: b.size as u32,
                padding: 0,
            })
            .collect();
        let (mut req, resp) = match self.alloc_command(req_size, size_of::<CtrlHdr>()) {
            Ok(pair) => pair,
            Err(e) => {
                self.set_err(e);
                return;
            }
        };
        write_struct(
            &mut req,
            ResourceAttachBackingReq {
                hdr: CtrlHdr {
                    hdr_type: CMD_RESOURCE_ATTACH_BACKING,
                    ..CtrlHdr::default()
                },
                resource_id: res.0,
                nr_entries: nentries as u32,
            },
        );
        let entries = &mut req.as_mut_slice()[hdr_size..];
        for (i, entry) in blocks.iter().enumerate() {
            // SAFETY: the region was sized for exactly nentries entries.
            unsafe {
                core::ptr::write_unaligned(
                    entries.as_mut_ptr().add(i * size_of::<MemEntry>()) as *mut MemEntry,
                    *entry,
                );
            }
        }
        self.command(&req, &resp);
    }

    /// Detaches a resource's backing store.
    pub fn cmd_resource_detach_backing(&mut self, res: Resource) {
        let (mut req, resp) =
            match self.alloc_command(size_of::<ResourceDetachBackingReq>(), size_of::<CtrlHdr>()) {
                Ok(pair) => pair,
                Err(e) => {
                    self.set_err(e);
                    return;
                }
            };
        write_struct(
            &mut req,
            ResourceDetachBackingReq {
                hdr: CtrlHdr {
                    hdr_type: CMD_RESOURCE_DETACH_BACKING,
                    ..CtrlHdr::default()
                },
                resource_id: res.0,
                padding: 0,
            },
        );
        self.command(&req, &resp);
    }

    /// Copies from the backing store into the host-side resource.
    pub fn cmd_transfer_to_host_2d(&mut self, res: Resource, offset: u64, r: Rect, fence: bool) {
        let (mut req, resp) =
            match self.alloc_command(size_of::<TransferToHost2dReq>(), size_of::<CtrlHdr>()) {
                Ok(pair) => pair,
                Err(e) => {
                    self.set_err(e);
                    return;
                }
            };
        let mut hdr = CtrlHdr {
            hdr_type: CMD_TRANSFER_TO_HOST_2D,
            ..CtrlHdr::default()
        };
        if fence {
            hdr.flags |= FLAG_FENCE;
            // The id value is irrelevant, but zero hangs the host.
            hdr.fence_id = 1;
        }
        write_struct(
            &mut req,
            TransferToHost2dReq {
                hdr,
                r,
                offset,
                resource_id: res.0,
                padding: 0,
            },
        );
        self.command(&req, &resp);
    }

    /// Makes a resource the scanout (display) source.
    pub fn cmd_set_scanout(&mut self, res: Resource) {
        let (mut req, resp) =
            match self.alloc_command(size_of::<SetScanoutReq>(), size_of::<CtrlHdr>()) {
                Ok(pair) => pair,
                Err(e) => {
                    self.set_err(e);
                    return;
                }
            };
        write_struct(
            &mut req,
            SetScanoutReq {
                hdr: CtrlHdr {
                    hdr_type: CMD_SET_SCANOUT,
                    ..CtrlHdr::default()
                },
                r: self.scanout_rect,
                scanout_id: self.scanout_id,
                resource_id: res.0,
            },
        );
        self.command(&req, &resp);
    }

    /// Flushes a resource to the display.
    pub fn cmd_resource_flush(&mut self, res: Resource) {
        let rect = self.scanout_rect;
        let (mut req, resp) =
            match self.alloc_command(size_of::<ResourceFlushReq>(), size_of::<CtrlHdr>()) {
                Ok(pair) => pair,
                Err(e) => {
                    self.set_err(e);
                    return;
                }
            };
        write_struct(
            &mut req,
            ResourceFlushReq {
                hdr: CtrlHdr {
                    hdr_type: CMD_RESOURCE_FLUSH,
                    ..CtrlHdr::default()
                },
                r: rect,
                resource_id: res.0,
                padding: 0,
            },
        );
        self.command(&req, &resp);
    }

    /// Drops the device's reference to a resource.
    pub fn cmd_resource_unref(&mut self, res: Resource) {
        let (mut req, resp) =
            match self.alloc_command(size_of::<ResourceUnrefReq>(), size_of::<CtrlHdr>()) {
                Ok(pair) => pair,
                Err(e) => {
                    self.set_err(e);
                    return;
                }
            };
        write_struct(
            &mut req,
            ResourceUnrefReq {
                hdr: CtrlHdr {
                    hdr_type: CMD_RESOURCE_UNREF,
                    ..CtrlHdr::default()
                },
                resource_id: res.0,
                padding: 0,
            },
        );
        self.command(&req, &resp);
    }

    fn cmd_ctx_resource(&mut self, cmd: u32, res: Resource) {
        let ctx_id = self.ctx_id;
        let (mut req, resp) =
            match self.alloc_command(size_of::<CtxResourceReq>(), size_of::<CtrlHdr>()) {
                Ok(pair) => pair,
                Err(e) => {
                    self.set_err(e);
                    return;
                }
            };
        write_struct(
            &mut req,
            CtxResourceReq {
                hdr: CtrlHdr {
                    hdr_type: cmd,
                    ctx_id,
                    ..CtrlHdr::default()
                },
                resource_id: res.0,
                padding: 0,
            },
        );
        self.command(&req, &resp);
    }

    /// Attaches a resource to the rendering context.
    pub fn cmd_ctx_attach_resource(&mut self, res: Resource) {
        self.cmd_ctx_resource(CMD_CTX_ATTACH_RESOURCE, res);
    }

    /// Detaches a resource from the rendering context.
    pub fn cmd_ctx_detach_resource(&mut self, res: Resource) {
        self.cmd_ctx_resource(CMD_CTX_DETACH_RESOURCE, res);
    }

    /// Uploads `data` into `dst` through a staging resource and a
    /// synchronized COPY_TRANSFER3D. The staging resource is detached and
    /// unreferenced on every path.
    pub fn copy_to_resource(&mut self, dst: Resource, data: &[u8], width: u32, height: u32) {
        let staging = self.cmd_resource_create_3d(ResourceCreate3d {
            width: data.len() as u32,
            height: 1,
            depth: 1,
            array_size: 1,
            bind: BIND_STAGING,
            ..ResourceCreate3d::default()
        });
        self.cmd_ctx_attach_resource(staging);
        match self.alloc(data.len()) {
            Ok(mut backing) => {
                backing.as_mut_slice().copy_from_slice(data);
                self.cmd_resource_attach_backing(staging, &backing);
                self.copy_transfer_3d(dst, width, height, staging, 0);
            }
            Err(e) => self.set_err(e),
        }
        self.cmd_ctx_detach_resource(staging);
        self.cmd_resource_unref(staging);
    }

    /// Emits a synchronized VirGL COPY_TRANSFER3D from `src` into `dst`.
    fn copy_transfer_3d(&mut self, dst: Resource, width: u32, height: u32, src: Resource, src_off: u32) {
        const CMD_LEN: u16 = 14;
        let mut cmd = [0u8; 4 + CMD_LEN as usize * 4];
        let words: [u32; CMD_LEN as usize + 1] = [
            encode_cmd_header(CMD_LEN, CCMD_COPY_TRANSFER3D, 0),
            dst.0,
            0, // level
            0, // usage
            0, // stride
            0, // layer stride
            0, // x
            0, // y
            0, // z
            width,
            height,
            1, // depth
            src.0,
            src_off,
            1, // synchronized
        ];
        for (chunk, word) in cmd.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        self.submit_3d(&cmd);
    }

    fn query_caps(&mut self) -> Result<CapsV2, GpuError> {
        let info = self.cmd_get_capset_info(1)?;
        const CAP_VERSION: u32 = 2;
        if info.capset_max_version < CAP_VERSION {
            return Err(GpuError::CapsetVersion {
                got: info.capset_max_version,
                need: CAP_VERSION,
            });
        }
        let resp_size = size_of::<CtrlHdr>() + info.capset_max_size as usize;
        if resp_size < size_of::<CtrlHdr>() + size_of::<CapsV2>() {
            return Err(GpuError::CapsetTooSmall);
        }
        let (mut req, resp) = self.alloc_command(size_of::<GetCapsetReq>(), resp_size)?;
        write_struct(
            &mut req,
            GetCapsetReq {
                hdr: CtrlHdr {
                    hdr_type: CMD_GET_CAPSET,
                    ..CtrlHdr::default()
                },
                capset_id: info.capset_id,
                capset_version: CAP_VERSION,
            },
        );
        self.command(&req, &resp);
        self.sync();
        let hdr: CtrlHdr = read_struct(&resp, 0);
        if hdr.hdr_type != RESP_OK_CAPSET {
            return Err(GpuError::BadResponse { got: hdr.hdr_type });
        }
        Ok(read_struct(&resp, size_of::<CtrlHdr>()))
    }

    fn cmd_get_capset_info(&mut self, index: u32) -> Result<CapsetInfoResp, GpuError> {
        let (mut req, resp) =
            self.alloc_command(size_of::<GetCapsetInfoReq>(), size_of::<CapsetInfoResp>())?;
        write_struct(
            &mut req,
            GetCapsetInfoReq {
                hdr: CtrlHdr {
                    hdr_type: CMD_GET_CAPSET_INFO,
                    ..CtrlHdr::default()
                },
                capset_index: index,
                padding: 0,
            },
        );
        self.command(&req, &resp);
        self.sync();
        let info: CapsetInfoResp = read_struct(&resp, 0);
        if info.hdr.hdr_type != RESP_OK_CAPSET_INFO {
            return Err(GpuError::BadResponse {
                got: info.hdr.hdr_type,
            });
        }
        Ok(info)
    }

    fn update_scanout(&mut self) -> Result<(), GpuError> {
        let (mut req, resp) =
            self.alloc_command(size_of::<CtrlHdr>(), size_of::<DisplayInfoResp>())?;
        write_struct(
            &mut req,
            CtrlHdr {
                hdr_type: CMD_GET_DISPLAY_INFO,
                ..CtrlHdr::default()
            },
        );
        self.command(&req, &resp);
        self.sync();
        let info: DisplayInfoResp = read_struct(&resp, 0);
        if info.hdr.hdr_type != RESP_OK_DISPLAY_INFO {
            return Err(GpuError::BadResponse {
                got: info.hdr.hdr_type,
            });
        }
        // Use the first enabled scanout, if any.
        self.scanout_id = 0;
        self.scanout_rect = Rect::default();
        for (i, mode) in info.pmodes.iter().enumerate() {
            if mode.enabled != 0 {
                self.scanout_id = i as u32;
                self.scanout_rect = mode.r;
                break;
            }
        }
        Ok(())
    }
}
