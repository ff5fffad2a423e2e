//! Common types and constants for the raw transport

/// Largest report the kernel exchanges in one feature request.
///
/// Defined as `HID_MAX_BUFFER_SIZE` in `include/linux/hid.h` but not
/// exported through the uapi headers.
pub const HID_MAX_BUFFER_SIZE: usize = 4096;

/// Largest single input-report read. 4096 is the max allowed by the HID spec.
pub const HIDRAW_MAX_READ: usize = 4096;

/// Upper bound on a single input-report wait, in milliseconds.
///
/// Also bounds how long a transacting thread can wait for the background
/// reader to notice an interrupt, and how long stopping the reader can take.
pub const READ_WAIT_BUDGET_MS: u64 = 1000;

/// HID report classes addressable through the raw device node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportType {
    /// Device to host, unsolicited or polled
    Input,
    /// Host to device, no reply expected
    Output,
    /// Bidirectional configuration block addressed by report number
    Feature,
}

/// Direction of a feature-report transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    /// Fetch a report from the device
    GetReport,
    /// Push a report to the device
    SetReport,
}

/// Outcome of a cancellable wait for device readability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The device has at least one input report pending
    Ready,
    /// The signal channel fired and was drained; the device was not touched
    Interrupted,
    /// Neither source became ready within the budget
    TimedOut,
}

/// Device identification, queried once when the node is opened
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Kernel bus type (BUS_USB, BUS_BLUETOOTH, ...)
    pub bus_type: u32,
    /// USB Vendor ID
    pub vid: u16,
    /// USB Product ID
    pub pid: u16,
    /// Device node path this transport was opened from
    pub device_path: String,
    /// Product name if available
    pub product_name: Option<String>,
}
