//! Boot logging with status indicators.
//!
//! Provides Linux-style boot messages over the serial console. The display
//! belongs to virtio-gpu in this kernel, so unlike a VGA-console system the
//! status brackets are plain text.

use crate::{serial_print, serial_println};

/// Boot status indicators.
#[derive(Debug, Clone, Copy)]
pub enum Status {
    /// Success - `[ OK ]`
    Ok,
    /// Failure - `[FAIL]`
    Fail,
    /// Informational - `[INFO]`
    Info,
}

/// Log a boot stage with status.
///
/// Format: `[ OK ] Message text`
pub fn log(status: Status, message: &str) {
    print_status(status);
    serial_println!(" {}", message);
}

fn print_status(status: Status) {
    let text = match status {
        Status::Ok => "[ OK ]",
        Status::Fail => "[FAIL]",
        Status::Info => "[INFO]",
    };
    serial_print!("{}", text);
}
