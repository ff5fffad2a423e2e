//! Raw HID report transport for configurable peripherals
//!
//! This crate is the lowest layer of host-to-device communication for
//! configurable HID peripherals (gaming mice, keyboards): it owns the
//! device's raw character node and offers synchronous feature-report
//! transactions, output-report writes, bounded input-report reads, and an
//! optional background reader that drains unsolicited input reports into a
//! consumer callback.
//!
//! The interesting part is [`HidrawTransport`]: a single device node must
//! serve both a background reader parked in a blocking wait and arbitrary
//! threads issuing request/response transactions. A steal protocol built
//! from two mutexes and a self-signal channel arbitrates between them, so
//! report bytes are never interleaved and a transacting thread is serviced
//! within one bounded read cycle instead of waiting for the device to go
//! quiet.
//!
//! Protocol encoding, device discovery, and retry policy all live above this
//! crate; here a report is just bytes plus the one reserved report-number
//! byte.

pub mod error;
pub mod types;

mod transport;

#[cfg(target_os = "linux")]
mod hidraw;

pub use error::TransportError;
pub use transport::{HidrawTransport, IoGuard};
pub use types::{
    DeviceInfo, ReportType, RequestType, WaitStatus, HIDRAW_MAX_READ, HID_MAX_BUFFER_SIZE,
    READ_WAIT_BUDGET_MS,
};

#[cfg(target_os = "linux")]
pub use hidraw::HidrawDevice;

use std::time::Duration;

/// An open raw HID device node, the single endpoint all report I/O goes
/// through.
///
/// [`HidrawDevice`] is the real Linux backend; tests substitute an in-memory
/// implementation. The contract every implementation must honor:
///
/// - [`wait_readable`](RawDevice::wait_readable) blocks on two sources,
///   pending input and the interrupt signal, and reports which one fired.
///   An interrupt wakeup must consume the signal and leave the device
///   untouched.
/// - [`interrupt`](RawDevice::interrupt) may be called from any thread at
///   any time, including while no wait is in progress; the next wait then
///   returns [`WaitStatus::Interrupted`].
/// - The report I/O methods each perform exactly one underlying device
///   operation.
pub trait RawDevice: Send + Sync {
    /// Block until input is pending, the interrupt signal fires, or
    /// `timeout` expires, whichever happens first.
    fn wait_readable(&self, timeout: Duration) -> Result<WaitStatus, TransportError>;

    /// Wake the thread (if any) blocked in [`wait_readable`](Self::wait_readable).
    fn interrupt(&self);

    /// Read one input report, up to `buf.len()` bytes. Returns the byte
    /// count.
    fn read_report(&self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Write one output report. Returns the number of bytes the device
    /// accepted.
    fn write_report(&self, buf: &[u8]) -> Result<usize, TransportError>;

    /// Exchange `buf` for a feature report; `buf[0]` addresses the report
    /// number. Returns the byte count the device handed back.
    fn get_feature_report(&self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Push `buf` to the device as a feature report; `buf[0]` must already
    /// hold the report number.
    fn send_feature_report(&self, buf: &[u8]) -> Result<usize, TransportError>;
}

/// Consumer of raw input reports.
///
/// Registered with [`HidrawTransport::set_event_handler`] as a weak
/// reference; the transport never owns the consumer's lifetime. Invoked for
/// every input report observed, whether drained by the background reader or
/// read synchronously with propagation enabled.
pub trait RawEventHandler: Send + Sync {
    fn raw_event(&self, report: &[u8]) -> Result<(), TransportError>;
}
