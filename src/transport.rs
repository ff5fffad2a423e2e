//! Exclusive device access and the report transaction API
//!
//! One [`HidrawTransport`] owns one open device node. Any number of threads
//! may issue transactions against it; at most one background reader drains
//! unsolicited input reports. Arbitration between a reader parked in its
//! blocking wait and a transacting thread is the steal protocol in
//! [`HidrawTransport::lock_io`].

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

#[cfg(target_os = "linux")]
use std::path::Path;

#[cfg(target_os = "linux")]
use crate::hidraw::HidrawDevice;

use crate::error::TransportError;
use crate::types::{
    DeviceInfo, ReportType, RequestType, WaitStatus, HIDRAW_MAX_READ, HID_MAX_BUFFER_SIZE,
    READ_WAIT_BUDGET_MS,
};
use crate::{RawDevice, RawEventHandler};

/// Pause after an unexpected reader error, so a dying device cannot spin the
/// loop
const READER_ERROR_BACKOFF_MS: u64 = 100;

/// State shared between the transport handle and the reader thread
struct Shared {
    /// The open device node; `None` once closed
    device: Mutex<Option<Arc<dyn RawDevice>>>,
    /// Guards every device I/O operation
    access_lock: Mutex<()>,
    /// Arbitrates who may attempt the next `access_lock` acquisition; never
    /// held across device I/O
    handover_lock: Mutex<()>,
    /// True while the reader loop should keep running
    reader_enabled: AtomicBool,
    /// Latched by the first (and only permitted) reader start
    reader_started: AtomicBool,
    /// Consumer of observed input reports; not owned by the transport
    handler: Mutex<Option<Weak<dyn RawEventHandler>>>,
}

/// Raw report transport over a single HID device node.
///
/// All methods take `&self`; the transport is meant to be shared across
/// threads. Dropping it stops the background reader and releases the device.
pub struct HidrawTransport {
    shared: Arc<Shared>,
    info: DeviceInfo,
    /// Reader thread ownership; `Some` between start and stop
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// Holds exclusive device access; dropping it releases the device to the
/// background reader (or the next transacting thread).
#[must_use]
pub struct IoGuard<'a> {
    _access: Option<MutexGuard<'a, ()>>,
}

impl HidrawTransport {
    /// Open the device node at `path` and build a transport around it.
    #[cfg(target_os = "linux")]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, TransportError> {
        let device = HidrawDevice::open(path)?;
        let info = device.info().clone();
        Ok(Self::new(Arc::new(device), info))
    }

    /// Build a transport around an already-open device.
    pub fn new(device: Arc<dyn RawDevice>, info: DeviceInfo) -> Self {
        Self {
            shared: Arc::new(Shared {
                device: Mutex::new(Some(device)),
                access_lock: Mutex::new(()),
                handover_lock: Mutex::new(()),
                reader_enabled: AtomicBool::new(false),
                reader_started: AtomicBool::new(false),
                handler: Mutex::new(None),
            }),
            info,
            reader: Mutex::new(None),
        }
    }

    /// Identity of the underlying device.
    pub fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Register the consumer invoked with every observed input report.
    ///
    /// Only a weak reference is kept; a dropped consumer is treated as
    /// unregistered.
    pub fn set_event_handler(&self, handler: Weak<dyn RawEventHandler>) {
        *self.shared.handler.lock() = Some(handler);
    }

    /// Start the background reader. May be called at most once per
    /// transport; a second call fails without spawning anything.
    pub fn start_events(&self) -> Result<(), TransportError> {
        if self
            .shared
            .reader_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TransportError::AlreadyStarted);
        }

        self.shared.reader_enabled.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let handle = match thread::Builder::new()
            .name("hidraw-event-reader".into())
            .spawn(move || shared.run_reader_loop())
        {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.reader_enabled.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        *self.reader.lock() = Some(handle);
        Ok(())
    }

    /// Stop the background reader and wait for it to exit.
    ///
    /// Takes effect at the top of the reader's next loop iteration, so this
    /// blocks for at most one wait budget. No-op when the reader is not
    /// running.
    pub fn stop_events(&self) {
        self.shared.reader_enabled.store(false, Ordering::SeqCst);
        if let Some(handle) = self.reader.lock().take() {
            let _ = handle.join();
        }
    }

    /// Stop the reader and release the device node.
    ///
    /// Must not race in-flight transactions. A second call is a no-op; an
    /// un-closed transport is closed on drop.
    pub fn close(&self) {
        self.stop_events();
        if self.shared.device.lock().take().is_some() {
            debug!("closed {}", self.info.device_path);
        }
    }

    /// Exclusive device access for the lifetime of the returned guard,
    /// stealing the device from the background reader if it is mid-wait.
    ///
    /// The steal sequence: take `handover_lock` (serializes concurrent
    /// stealers), signal the reader's wait, then take `access_lock`; the
    /// reader bails out of its read on the signal and releases the lock.
    /// `handover_lock` is dropped only after `access_lock` is held, which
    /// pins the reader in its end-of-loop handshake until this caller owns
    /// the device.
    ///
    /// With no reader ever started there is nobody to steal from and this is
    /// free of locking entirely.
    pub fn lock_io(&self) -> IoGuard<'_> {
        if !self.shared.reader_started.load(Ordering::SeqCst) {
            return IoGuard { _access: None };
        }

        let stealing = self.shared.handover_lock.lock();
        if let Some(device) = self.shared.device.lock().clone() {
            device.interrupt();
        }
        let access = self.shared.access_lock.lock();
        drop(stealing);
        IoGuard {
            _access: Some(access),
        }
    }

    /// One locked feature-report transaction.
    ///
    /// `GetReport` exchanges a zero-filled buffer addressed by
    /// `report_number` for device-held data and returns the byte count the
    /// device handed back, copied into `buf`. `SetReport` overwrites
    /// `buf[0]` with the report number, pushes the whole buffer, and returns
    /// 0.
    pub fn raw_request(
        &self,
        report_number: u8,
        buf: &mut [u8],
        report_type: ReportType,
        request_type: RequestType,
    ) -> Result<usize, TransportError> {
        if report_type != ReportType::Feature {
            return Err(TransportError::NotSupported);
        }
        if buf.is_empty() || buf.len() > HID_MAX_BUFFER_SIZE {
            return Err(TransportError::InvalidArgument(format!(
                "report length {} outside 1..={}",
                buf.len(),
                HID_MAX_BUFFER_SIZE
            )));
        }
        let device = self.shared.device_handle()?;

        let _io = self.lock_io();

        match request_type {
            RequestType::GetReport => {
                let mut scratch = vec![0u8; buf.len()];
                scratch[0] = report_number;
                let n = device.get_feature_report(&mut scratch)?;
                let n = n.min(buf.len());
                buf[..n].copy_from_slice(&scratch[..n]);
                Ok(n)
            }
            RequestType::SetReport => {
                buf[0] = report_number;
                device.send_feature_report(buf)?;
                Ok(0)
            }
        }
    }

    /// Write one output report to the device.
    ///
    /// Runs under the same device lock as feature transactions, so a write
    /// can never interleave with a background read.
    pub fn output_report(&self, buf: &[u8]) -> Result<(), TransportError> {
        if buf.is_empty() || buf.len() > HID_MAX_BUFFER_SIZE {
            return Err(TransportError::InvalidArgument(format!(
                "report length {} outside 1..={}",
                buf.len(),
                HID_MAX_BUFFER_SIZE
            )));
        }
        let device = self.shared.device_handle()?;

        let _io = self.lock_io();

        let written = device.write_report(buf)?;
        if written != buf.len() {
            return Err(TransportError::ShortWrite {
                written,
                expected: buf.len(),
            });
        }
        Ok(())
    }

    /// Wait (bounded by [`READ_WAIT_BUDGET_MS`]) for one input report and
    /// copy it into `buf`.
    ///
    /// Returns the full report length even when `buf` is shorter; with
    /// `propagate` set, the registered handler sees the full report first.
    /// Callers other than the background reader must hold
    /// [`lock_io`](Self::lock_io) across this call while the reader is
    /// running.
    pub fn read_input_report(
        &self,
        buf: &mut [u8],
        propagate: bool,
    ) -> Result<usize, TransportError> {
        self.shared.read_input_report(buf, propagate)
    }

    /// Hand `report` to the registered handler as if it had been read from
    /// the device. No-op success when no handler is registered.
    pub fn propagate_report(&self, report: &[u8]) -> Result<(), TransportError> {
        match self.shared.handler() {
            Some(handler) => handler.raw_event(report),
            None => Ok(()),
        }
    }
}

impl Drop for HidrawTransport {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    fn device_handle(&self) -> Result<Arc<dyn RawDevice>, TransportError> {
        self.device
            .lock()
            .clone()
            .ok_or_else(|| TransportError::InvalidArgument("device is closed".into()))
    }

    fn handler(&self) -> Option<Arc<dyn RawEventHandler>> {
        self.handler.lock().as_ref().and_then(Weak::upgrade)
    }

    fn read_input_report(&self, buf: &mut [u8], propagate: bool) -> Result<usize, TransportError> {
        if buf.is_empty() || buf.len() > HIDRAW_MAX_READ {
            return Err(TransportError::InvalidArgument(format!(
                "read capacity {} outside 1..={}",
                buf.len(),
                HIDRAW_MAX_READ
            )));
        }
        let device = self.device_handle()?;

        match device.wait_readable(Duration::from_millis(READ_WAIT_BUDGET_MS))? {
            WaitStatus::TimedOut => Err(TransportError::Timeout),
            WaitStatus::Interrupted => Err(TransportError::Interrupted),
            WaitStatus::Ready => {
                let mut frame = [0u8; HIDRAW_MAX_READ];
                let len = device.read_report(&mut frame)?;
                if len == 0 {
                    return Err(TransportError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "device signaled readable but returned no data",
                    )));
                }

                if propagate {
                    if let Some(handler) = self.handler() {
                        if let Err(e) = handler.raw_event(&frame[..len]) {
                            debug!("event handler rejected report: {e}");
                        }
                    }
                }

                let copied = len.min(buf.len());
                buf[..copied].copy_from_slice(&frame[..copied]);
                Ok(len)
            }
        }
    }

    /// Reader loop: one locked bounded read per iteration, then the
    /// handover handshake so a mid-steal caller acquires the device before
    /// the next read.
    fn run_reader_loop(self: Arc<Self>) {
        debug!("input report reader started");
        let mut placeholder = [0u8; 1];

        while self.reader_enabled.load(Ordering::SeqCst) {
            let result = {
                let _access = self.access_lock.lock();
                self.read_input_report(&mut placeholder, true)
            };

            // pin here until an interrupting caller holds the access lock
            drop(self.handover_lock.lock());

            match result {
                // the read exists for its propagation side effect; timeouts
                // and steal interrupts are part of normal operation
                Ok(_) | Err(TransportError::Timeout) | Err(TransportError::Interrupted) => {}
                Err(e) => {
                    warn!("input report reader: {e}");
                    thread::sleep(Duration::from_millis(READER_ERROR_BACKOFF_MS));
                }
            }
        }

        debug!("input report reader exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Device that counts operations and never produces data.
    #[derive(Default)]
    struct NullDevice {
        ops: AtomicUsize,
        short_write: bool,
    }

    impl NullDevice {
        fn op_count(&self) -> usize {
            self.ops.load(Ordering::SeqCst)
        }
    }

    impl RawDevice for NullDevice {
        fn wait_readable(&self, _timeout: Duration) -> Result<WaitStatus, TransportError> {
            self.ops.fetch_add(1, Ordering::SeqCst);
            Ok(WaitStatus::TimedOut)
        }

        fn interrupt(&self) {}

        fn read_report(&self, _buf: &mut [u8]) -> Result<usize, TransportError> {
            self.ops.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        }

        fn write_report(&self, buf: &[u8]) -> Result<usize, TransportError> {
            self.ops.fetch_add(1, Ordering::SeqCst);
            if self.short_write {
                Ok(buf.len() - 1)
            } else {
                Ok(buf.len())
            }
        }

        fn get_feature_report(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
            self.ops.fetch_add(1, Ordering::SeqCst);
            Ok(buf.len())
        }

        fn send_feature_report(&self, buf: &[u8]) -> Result<usize, TransportError> {
            self.ops.fetch_add(1, Ordering::SeqCst);
            Ok(buf.len())
        }
    }

    fn test_info() -> DeviceInfo {
        DeviceInfo {
            bus_type: 0x03,
            vid: 0x3151,
            pid: 0x5030,
            device_path: "/dev/hidraw9".into(),
            product_name: Some("Test Device".into()),
        }
    }

    fn null_transport() -> (Arc<NullDevice>, HidrawTransport) {
        let device = Arc::new(NullDevice::default());
        let transport = HidrawTransport::new(device.clone(), test_info());
        (device, transport)
    }

    #[test]
    fn non_feature_report_types_are_rejected_first() {
        let (device, transport) = null_transport();
        let mut buf = [0u8; 8];
        for rtype in [ReportType::Input, ReportType::Output] {
            for reqtype in [RequestType::GetReport, RequestType::SetReport] {
                let err = transport
                    .raw_request(0x10, &mut buf, rtype, reqtype)
                    .unwrap_err();
                assert!(matches!(err, TransportError::NotSupported));
            }
        }
        // rejected even with an otherwise-invalid buffer
        let err = transport
            .raw_request(0x10, &mut [], ReportType::Output, RequestType::GetReport)
            .unwrap_err();
        assert!(matches!(err, TransportError::NotSupported));
        assert_eq!(device.op_count(), 0);
    }

    #[test]
    fn bad_lengths_are_rejected_without_io() {
        let (device, transport) = null_transport();

        let err = transport
            .raw_request(
                0x10,
                &mut [],
                ReportType::Feature,
                RequestType::GetReport,
            )
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidArgument(_)));

        let mut oversized = vec![0u8; HID_MAX_BUFFER_SIZE + 1];
        let err = transport
            .raw_request(
                0x10,
                &mut oversized,
                ReportType::Feature,
                RequestType::SetReport,
            )
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidArgument(_)));

        let err = transport.output_report(&[]).unwrap_err();
        assert!(matches!(err, TransportError::InvalidArgument(_)));
        let err = transport.output_report(&oversized).unwrap_err();
        assert!(matches!(err, TransportError::InvalidArgument(_)));

        let err = transport.read_input_report(&mut [], false).unwrap_err();
        assert!(matches!(err, TransportError::InvalidArgument(_)));
        let err = transport
            .read_input_report(&mut oversized, false)
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidArgument(_)));

        assert_eq!(device.op_count(), 0);
    }

    #[test]
    fn closed_transport_rejects_every_operation() {
        let (device, transport) = null_transport();
        transport.close();

        let mut buf = [0u8; 16];
        for reqtype in [RequestType::GetReport, RequestType::SetReport] {
            let err = transport
                .raw_request(0x02, &mut buf, ReportType::Feature, reqtype)
                .unwrap_err();
            assert!(matches!(err, TransportError::InvalidArgument(_)));
        }
        let err = transport.output_report(&buf).unwrap_err();
        assert!(matches!(err, TransportError::InvalidArgument(_)));
        let err = transport.read_input_report(&mut buf, false).unwrap_err();
        assert!(matches!(err, TransportError::InvalidArgument(_)));

        assert_eq!(device.op_count(), 0);
    }

    #[test]
    fn second_close_is_a_noop() {
        let (_device, transport) = null_transport();
        transport.close();
        transport.close();
    }

    #[test]
    fn short_write_is_surfaced() {
        let device = Arc::new(NullDevice {
            short_write: true,
            ..Default::default()
        });
        let transport = HidrawTransport::new(device, test_info());
        let err = transport.output_report(&[1, 2, 3, 4]).unwrap_err();
        match err {
            TransportError::ShortWrite { written, expected } => {
                assert_eq!(written, 3);
                assert_eq!(expected, 4);
            }
            other => panic!("expected ShortWrite, got {other:?}"),
        }
    }

    #[test]
    fn propagate_without_handler_is_noop() {
        let (_device, transport) = null_transport();
        assert!(transport.propagate_report(&[1, 2, 3]).is_ok());
    }

    #[test]
    fn dropped_handler_counts_as_unregistered() {
        struct FailingHandler;
        impl RawEventHandler for FailingHandler {
            fn raw_event(&self, _report: &[u8]) -> Result<(), TransportError> {
                Err(TransportError::NotSupported)
            }
        }

        let (_device, transport) = null_transport();
        let handler = Arc::new(FailingHandler);
        transport.set_event_handler(Arc::downgrade(&handler) as Weak<dyn RawEventHandler>);
        assert!(transport.propagate_report(&[0]).is_err());

        drop(handler);
        assert!(transport.propagate_report(&[0]).is_ok());
    }
}
