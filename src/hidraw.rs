//! Linux hidraw backend: direct I/O on `/dev/hidrawN`

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::TransportError;
use crate::types::{DeviceInfo, WaitStatus, HIDRAW_MAX_READ};
use crate::RawDevice;

// HIDRAW ioctl definitions
// From linux/hidraw.h:
// #define HIDIOCGRAWINFO      _IOR('H', 0x03, struct hidraw_devinfo)
// #define HIDIOCGRAWNAME(len) _IOC(_IOC_READ, 'H', 0x04, len)
// #define HIDIOCSFEATURE(len) _IOC(_IOC_WRITE|_IOC_READ, 'H', 0x06, len)
// #define HIDIOCGFEATURE(len) _IOC(_IOC_WRITE|_IOC_READ, 'H', 0x07, len)

const HIDRAW_MAGIC: u8 = b'H';

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

// Direction: 2 bits at 30-31, Size: 14 bits at 16-29, Type: 8 bits at 8-15,
// Nr: 8 bits at 0-7
fn ioc(dir: u32, nr: u32, len: usize) -> libc::c_ulong {
    let size = (len as u32) & 0x3FFF;
    (((dir << 30) | (size << 16) | ((HIDRAW_MAGIC as u32) << 8) | nr) as libc::c_uint)
        as libc::c_ulong
}

fn hidiocgrawinfo() -> libc::c_ulong {
    ioc(IOC_READ, 0x03, std::mem::size_of::<HidrawDevInfo>())
}

fn hidiocgrawname(len: usize) -> libc::c_ulong {
    ioc(IOC_READ, 0x04, len)
}

fn hidiocsfeature(len: usize) -> libc::c_ulong {
    ioc(IOC_WRITE | IOC_READ, 0x06, len)
}

fn hidiocgfeature(len: usize) -> libc::c_ulong {
    ioc(IOC_WRITE | IOC_READ, 0x07, len)
}

/// `struct hidraw_devinfo` from `linux/hidraw.h`
#[repr(C)]
#[derive(Default)]
struct HidrawDevInfo {
    bustype: u32,
    vendor: i16,
    product: i16,
}

fn last_os_error() -> TransportError {
    TransportError::Io(io::Error::last_os_error())
}

/// A raw HID device node opened read-write, plus the self-pipe used to
/// interrupt a blocked wait on it.
pub struct HidrawDevice {
    file: File,
    signal_rd: OwnedFd,
    signal_wr: OwnedFd,
    info: DeviceInfo,
}

impl HidrawDevice {
    /// Open a hidraw node (e.g. `/dev/hidraw3`) and query its identity.
    ///
    /// Fails if the node cannot be opened read-write or the raw-info query
    /// fails; on failure nothing is left open.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, TransportError> {
        let path = path.as_ref();
        let file = File::options().read(true).write(true).open(path)?;
        let fd = file.as_raw_fd();

        let mut raw = HidrawDevInfo::default();
        let ret = unsafe { libc::ioctl(fd, hidiocgrawinfo(), &mut raw as *mut HidrawDevInfo) };
        if ret < 0 {
            return Err(last_os_error());
        }

        let product_name = read_raw_name(fd);
        let (signal_rd, signal_wr) = new_signal_pipe()?;

        let info = DeviceInfo {
            bus_type: raw.bustype,
            vid: raw.vendor as u16,
            pid: raw.product as u16,
            device_path: path.display().to_string(),
            product_name,
        };
        debug!(
            "opened {} (bus {:#x}, {:04x}:{:04x}, {:?})",
            info.device_path, info.bus_type, info.vid, info.pid, info.product_name
        );

        Ok(Self {
            file,
            signal_rd,
            signal_wr,
            info,
        })
    }

    /// Identity queried at open time.
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }
}

fn new_signal_pipe() -> Result<(OwnedFd, OwnedFd), TransportError> {
    let mut fds = [0 as RawFd; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if ret < 0 {
        return Err(last_os_error());
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Product-name string via HIDIOCGRAWNAME; diagnostic only, failure is fine.
fn read_raw_name(fd: RawFd) -> Option<String> {
    let mut buf = [0u8; 256];
    let ret = unsafe { libc::ioctl(fd, hidiocgrawname(buf.len()), buf.as_mut_ptr()) };
    if ret <= 0 {
        return None;
    }
    let len = buf[..ret as usize]
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(ret as usize);
    Some(String::from_utf8_lossy(&buf[..len]).into_owned())
}

impl RawDevice for HidrawDevice {
    fn wait_readable(&self, timeout: Duration) -> Result<WaitStatus, TransportError> {
        let mut fds = [
            libc::pollfd {
                fd: self.file.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.signal_rd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];

        let ret = unsafe { libc::poll(fds.as_mut_ptr(), 2, timeout.as_millis() as libc::c_int) };
        if ret < 0 {
            return Err(last_os_error());
        }
        if ret == 0 {
            return Ok(WaitStatus::TimedOut);
        }

        if fds[1].revents & libc::POLLIN != 0 {
            // clear the signal channel
            let mut drain = [0u8; HIDRAW_MAX_READ];
            let _ = unsafe {
                libc::read(
                    self.signal_rd.as_raw_fd(),
                    drain.as_mut_ptr() as *mut libc::c_void,
                    drain.len(),
                )
            };
            return Ok(WaitStatus::Interrupted);
        }

        Ok(WaitStatus::Ready)
    }

    fn interrupt(&self) {
        let buf = [b'\n'];
        let ret = unsafe {
            libc::write(
                self.signal_wr.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                1,
            )
        };
        if ret < 0 {
            warn!(
                "failed to signal waiting reader: {}",
                io::Error::last_os_error()
            );
        }
    }

    fn read_report(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let n = unsafe {
            libc::read(
                self.file.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            return Err(last_os_error());
        }
        Ok(n as usize)
    }

    fn write_report(&self, buf: &[u8]) -> Result<usize, TransportError> {
        let n = unsafe {
            libc::write(
                self.file.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            return Err(last_os_error());
        }
        Ok(n as usize)
    }

    fn get_feature_report(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let ret =
            unsafe { libc::ioctl(self.file.as_raw_fd(), hidiocgfeature(buf.len()), buf.as_mut_ptr()) };
        if ret < 0 {
            return Err(last_os_error());
        }
        Ok(ret as usize)
    }

    fn send_feature_report(&self, buf: &[u8]) -> Result<usize, TransportError> {
        // HIDIOCSFEATURE is declared read-write but the kernel only copies in
        let ret =
            unsafe { libc::ioctl(self.file.as_raw_fd(), hidiocsfeature(buf.len()), buf.as_ptr()) };
        if ret < 0 {
            return Err(last_os_error());
        }
        Ok(ret as usize)
    }
}
