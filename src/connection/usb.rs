use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex, PoisonError,
    },
    time::Duration,
};

use rusb::{Device, DeviceHandle, Direction, GlobalContext, TransferType};
use tokio::sync::Mutex;

use super::{ConnectionError, POLL_INTERVAL};
use crate::address::TransportError;

/// Largest single bulk transfer handed to libusb.
const MAX_TRANSFER: usize = 16 * 1024;

const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Failed bulk OUT attempts tolerated per chunk before the device is given up on.
const WRITE_ATTEMPTS: u32 = 5;

/// Pause between failed bulk OUT attempts.
const WRITE_RETRY_PAUSE: Duration = Duration::from_millis(10);

/// Flag checked before touching the device. `guard` is held for the whole
/// of a bulk read, so acquiring it after setting the flag means no read is
/// still in flight.
#[derive(Default)]
struct StopFlag {
    stopped: AtomicBool,
    guard: StdMutex<()>,
}

impl StopFlag {
    fn is_set(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Connection to a USB device over one bulk IN/OUT endpoint pair.
pub struct UsbConnection {
    handle: Arc<DeviceHandle<GlobalContext>>,
    endpoint_in: u8,
    endpoint_out: u8,
    read_lock: Mutex<()>,
    write_lock: Mutex<()>,
    stop: Arc<StopFlag>,
    closed: AtomicBool,
}

impl UsbConnection {
    pub(crate) async fn open(vendor_id: u16, product_id: u16, serial: &str) -> Result<Self, TransportError> {
        let serial = serial.to_owned();
        tokio::task::spawn_blocking(move || Self::open_blocking(vendor_id, product_id, &serial)).await?
    }

    fn open_blocking(vendor_id: u16, product_id: u16, serial: &str) -> Result<Self, TransportError> {
        for device in rusb::devices()?.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(descriptor) => descriptor,
                Err(error) => {
                    tracing::trace!(error = format!("{:?}", error), "skipping unreadable usb device");
                    continue;
                }
            };
            if descriptor.vendor_id() != vendor_id || descriptor.product_id() != product_id {
                continue;
            }

            let handle = match device.open() {
                Ok(handle) => handle,
                Err(error) => {
                    tracing::warn!(
                        vendor_id,
                        product_id,
                        error = format!("{:?}", error),
                        "failed to open matching usb device"
                    );
                    continue;
                }
            };

            if !serial.is_empty() {
                let found = handle.read_serial_number_string_ascii(&descriptor).unwrap_or_default();
                if found != serial {
                    tracing::trace!(serial = found, "serial does not match; skipping");
                    continue;
                }
            }

            return Self::claim(&device, handle);
        }

        Err(TransportError::DeviceNotFound {
            vendor_id,
            product_id,
            serial: serial.to_owned(),
        })
    }

    fn claim(device: &Device<GlobalContext>, mut handle: DeviceHandle<GlobalContext>) -> Result<Self, TransportError> {
        let (interface, endpoint_in, endpoint_out) = find_bulk_endpoints(device)?;

        match handle.kernel_driver_active(interface) {
            Ok(true) => {
                if let Err(error) = handle.detach_kernel_driver(interface) {
                    tracing::warn!(
                        interface,
                        error = format!("{:?}", error),
                        "failed to detach kernel driver; continuing"
                    );
                }
            }
            Ok(false) => {}
            Err(error) => {
                tracing::debug!(error = format!("{:?}", error), "can not query kernel driver state");
            }
        }
        handle.claim_interface(interface)?;

        tracing::info!(interface, endpoint_in, endpoint_out, "claimed usb interface");

        Ok(Self {
            handle: Arc::new(handle),
            endpoint_in,
            endpoint_out,
            read_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
            stop: Arc::new(StopFlag::default()),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stop.is_set()
    }

    /// One bulk IN transfer bounded by [POLL_INTERVAL].
    ///
    /// libusb does not report how much of a transfer arrived before a
    /// timeout, so bytes of a transfer cut off by the poll bound are lost.
    /// Devices are expected to send each message in one transfer.
    pub(crate) async fn read(&self) -> Result<Vec<u8>, ConnectionError> {
        let _read = self.read_lock.lock().await;
        let handle = self.handle.clone();
        let stop = self.stop.clone();
        let endpoint = self.endpoint_in;

        let result = tokio::task::spawn_blocking(move || {
            let _guard = stop.guard.lock().unwrap_or_else(PoisonError::into_inner);
            if stop.is_set() {
                return Err(ConnectionError::EndOfStream);
            }

            let mut buffer = vec![0; MAX_TRANSFER];
            match handle.read_bulk(endpoint, &mut buffer, POLL_INTERVAL) {
                Ok(n) => {
                    buffer.truncate(n);
                    Ok(buffer)
                }
                Err(rusb::Error::Timeout | rusb::Error::Interrupted) => Ok(Vec::new()),
                Err(error) => {
                    tracing::debug!(error = format!("{:?}", error), "usb read failed; treating as end of stream");
                    Err(ConnectionError::EndOfStream)
                }
            }
        })
        .await;

        result.unwrap_or_else(|error| {
            tracing::warn!(error = format!("{:?}", error), "usb read worker failed");
            Err(ConnectionError::EndOfStream)
        })
    }

    pub(crate) async fn write(&self, data: &[u8]) -> Result<(), ConnectionError> {
        let _write = self.write_lock.lock().await;
        let handle = self.handle.clone();
        let stop = self.stop.clone();
        let endpoint = self.endpoint_out;
        let data = data.to_vec();

        let result = tokio::task::spawn_blocking(move || {
            write_chunks(&data, &stop, |chunk| handle.write_bulk(endpoint, chunk, WRITE_TIMEOUT))
        })
        .await;

        result.unwrap_or_else(|error| {
            tracing::warn!(error = format!("{:?}", error), "usb write worker failed");
            Err(ConnectionError::EndOfStream)
        })
    }

    pub(crate) fn stop(&self) {
        if !self.stop.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!("usb connection stopped");
        }
    }

    pub(crate) async fn close(&self) {
        self.stop();
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wait out a read that is already talking to the device.
        let stop = self.stop.clone();
        let waited = tokio::task::spawn_blocking(move || {
            drop(stop.guard.lock().unwrap_or_else(PoisonError::into_inner));
        })
        .await;
        if let Err(error) = waited {
            tracing::warn!(error = format!("{:?}", error), "waiting for the usb reader failed");
        }
        // The interface is released when the last handle reference drops.
        tracing::debug!("usb connection closed");
    }
}

/// Send `data` through `transfer` in chunks of at most [MAX_TRANSFER] bytes.
///
/// A chunk gets [WRITE_ATTEMPTS] failed attempts before the device is
/// treated as gone. A timed out transfer may have been partly sent, so it is
/// not resent.
fn write_chunks<F>(data: &[u8], stop: &StopFlag, mut transfer: F) -> Result<(), ConnectionError>
where
    F: FnMut(&[u8]) -> rusb::Result<usize>,
{
    let total = data.len();
    let mut written = 0;
    for chunk in data.chunks(MAX_TRANSFER) {
        let mut offset = 0;
        let mut failures = 0;
        while offset < chunk.len() {
            if stop.is_set() {
                return Err(ConnectionError::Stopped {
                    written: written + offset,
                    total,
                });
            }
            match transfer(&chunk[offset..]) {
                Ok(n) if n > 0 => {
                    offset += n;
                    failures = 0;
                    continue;
                }
                Ok(_) => tracing::warn!("usb write sent nothing; retrying"),
                Err(rusb::Error::NoDevice) => return Err(ConnectionError::EndOfStream),
                Err(rusb::Error::Timeout) => {
                    tracing::warn!(written = written + offset, total, "usb write timed out; giving up on the device");
                    return Err(ConnectionError::EndOfStream);
                }
                Err(error) => {
                    tracing::warn!(error = format!("{:?}", error), "usb write failed; retrying");
                }
            }

            failures += 1;
            if failures >= WRITE_ATTEMPTS {
                tracing::warn!(attempts = failures, "usb write kept failing; giving up on the device");
                return Err(ConnectionError::EndOfStream);
            }
            std::thread::sleep(WRITE_RETRY_PAUSE);
        }
        written += chunk.len();
    }
    Ok(())
}

fn find_bulk_endpoints(device: &Device<GlobalContext>) -> Result<(u8, u8, u8), TransportError> {
    let config = device.active_config_descriptor()?;
    for interface in config.interfaces() {
        for descriptor in interface.descriptors() {
            let mut endpoint_in = None;
            let mut endpoint_out = None;
            for endpoint in descriptor.endpoint_descriptors() {
                if endpoint.transfer_type() != TransferType::Bulk {
                    continue;
                }
                match endpoint.direction() {
                    Direction::In => {
                        endpoint_in.get_or_insert(endpoint.address());
                    }
                    Direction::Out => {
                        endpoint_out.get_or_insert(endpoint.address());
                    }
                }
            }
            if let (Some(endpoint_in), Some(endpoint_out)) = (endpoint_in, endpoint_out) {
                return Ok((descriptor.interface_number(), endpoint_in, endpoint_out));
            }
        }
    }
    Err(TransportError::NoBulkEndpoints)
}
