use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use nusb::transfer::{Queue, RequestBuffer};
use parking_lot::Mutex;
use serialport::SerialPort;
use std::{
    io::{ErrorKind, Read, Write},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, info, warn};

use crate::{
    error::{AntError, Result},
    types::{SerialParams, UsbParams},
};

/// Bulk IN transfers kept in flight while the stick is open
const USB_IN_FLIGHT: usize = 4;

/// Byte pipe to an ANT dongle
///
/// `read` must return promptly: an empty buffer means nothing arrived within
/// the transport's own short timeout, which the reader loop treats as
/// "try again" rather than an error.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the underlying device
    async fn open(&mut self) -> Result<()>;

    /// Close the underlying device; closing twice is not an error
    async fn close(&mut self) -> Result<()>;

    /// Read up to `max` bytes
    async fn read(&mut self, max: usize) -> Result<Bytes>;

    /// Write a complete frame, returning the number of bytes written
    async fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Whether the device is currently open
    fn is_open(&self) -> bool;
}

/// Transport for dongles that enumerate as a USB serial port
pub struct SerialTransport {
    params: SerialParams,
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialTransport {
    /// Create a transport for the given port; nothing is opened yet
    #[must_use]
    pub const fn new(params: SerialParams) -> Self {
        Self { params, port: None }
    }

    /// Port parameters
    #[must_use]
    pub const fn params(&self) -> &SerialParams {
        &self.params
    }

    fn port(&self) -> Result<Arc<Mutex<Box<dyn SerialPort>>>> {
        self.port
            .clone()
            .ok_or_else(|| AntError::Transport(format!("{} is not open", self.params.path)))
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self) -> Result<()> {
        if self.port.is_some() {
            return Ok(());
        }

        info!(
            "Opening ANT dongle on {} at {} baud",
            self.params.path, self.params.baud_rate
        );

        let path = self.params.path.clone();
        let baud_rate = self.params.baud_rate;
        let read_timeout = Duration::from_millis(self.params.read_timeout_ms);

        let port = tokio::task::spawn_blocking(move || {
            serialport::new(path, baud_rate)
                .timeout(read_timeout)
                .data_bits(serialport::DataBits::Eight)
                .stop_bits(serialport::StopBits::One)
                .parity(serialport::Parity::None)
                .open()
        })
        .await
        .map_err(|e| AntError::Transport(format!("serial open task failed: {e}")))??;

        self.port = Some(Arc::new(Mutex::new(port)));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            debug!("Closed serial port {}", self.params.path);
        }
        Ok(())
    }

    async fn read(&mut self, max: usize) -> Result<Bytes> {
        let port = self.port()?;

        tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; max];
            match port.lock().read(&mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    Ok(Bytes::from(buf))
                }
                Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::Interrupted => {
                    Ok(Bytes::new())
                }
                Err(e) => Err(AntError::Io(e)),
            }
        })
        .await
        .map_err(|e| AntError::Transport(format!("serial read task failed: {e}")))?
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let port = self.port()?;
        let data = data.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut port = port.lock();
            port.write_all(&data)?;
            port.flush()?;
            Ok::<_, AntError>(data.len())
        })
        .await
        .map_err(|e| AntError::Transport(format!("serial write task failed: {e}")))?
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}

struct UsbHandle {
    interface: nusb::Interface,
    reader: tokio::sync::Mutex<Queue<RequestBuffer>>,
    pending: BytesMut,
}

fn usb_device_name(params: &UsbParams) -> String {
    format!(
        "USB device {:04x}:{:04x}",
        params.vendor_id, params.product_id
    )
}

/// Transport for ANT USB sticks driven directly over their bulk endpoints
///
/// Sticks such as the ANTUSB2 (`0fcf:1008`) do not expose a serial port;
/// frames travel through one bulk OUT and one bulk IN endpoint. Inbound
/// transfers are kept queued so bytes are not lost between reads.
pub struct UsbTransport {
    params: UsbParams,
    handle: Option<UsbHandle>,
}

impl UsbTransport {
    /// Create a transport for the given stick; nothing is opened yet
    #[must_use]
    pub const fn new(params: UsbParams) -> Self {
        Self {
            params,
            handle: None,
        }
    }

    /// USB parameters
    #[must_use]
    pub const fn params(&self) -> &UsbParams {
        &self.params
    }

    fn device_name(&self) -> String {
        usb_device_name(&self.params)
    }

    fn handle(&mut self) -> Result<&mut UsbHandle> {
        let params = &self.params;
        self.handle
            .as_mut()
            .ok_or_else(|| AntError::Transport(format!("{} is not open", usb_device_name(params))))
    }
}

#[async_trait]
impl Transport for UsbTransport {
    async fn open(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }

        info!("Opening ANT stick {}", self.device_name());

        let info = nusb::list_devices()?
            .find(|device| {
                device.vendor_id() == self.params.vendor_id
                    && device.product_id() == self.params.product_id
            })
            .ok_or_else(|| AntError::Transport(format!("{} not found", self.device_name())))?;

        let device = info.open()?;
        let interface = device.detach_and_claim_interface(self.params.interface)?;
        let reader = interface.bulk_in_queue(self.params.in_endpoint);

        self.handle = Some(UsbHandle {
            interface,
            reader: tokio::sync::Mutex::new(reader),
            pending: BytesMut::new(),
        });
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut handle) = self.handle.take() {
            handle.reader.get_mut().cancel_all();
            debug!("Closed {}", self.device_name());
        }
        Ok(())
    }

    async fn read(&mut self, max: usize) -> Result<Bytes> {
        let transfer_size = self.params.transfer_size;
        let read_timeout = Duration::from_millis(self.params.read_timeout_ms);
        let handle = self.handle()?;

        if handle.pending.is_empty() {
            let queue = handle.reader.get_mut();
            while queue.pending() < USB_IN_FLIGHT {
                queue.submit(RequestBuffer::new(transfer_size));
            }

            let Ok(completion) = tokio::time::timeout(read_timeout, queue.next_complete()).await
            else {
                return Ok(Bytes::new());
            };

            let data = completion.into_result().inspect_err(|e| {
                warn!("USB bulk IN transfer failed: {}", e);
            })?;
            handle.pending.extend_from_slice(&data);
            queue.submit(RequestBuffer::reuse(data, transfer_size));
        }

        let take = max.min(handle.pending.len());
        Ok(handle.pending.split_to(take).freeze())
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let out_endpoint = self.params.out_endpoint;
        let write_timeout = Duration::from_millis(self.params.write_timeout_ms);
        let handle = self.handle()?;

        let transfer = handle.interface.bulk_out(out_endpoint, data.to_vec());
        let completion = tokio::time::timeout(write_timeout, transfer)
            .await
            .map_err(|_| {
                AntError::Transport(format!(
                    "USB write timed out after {}ms",
                    write_timeout.as_millis()
                ))
            })?;

        Ok(completion.into_result()?.actual_length())
    }

    fn is_open(&self) -> bool {
        self.handle.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_serial_transport_starts_closed() {
        let mut transport = SerialTransport::new(SerialParams::default());
        assert!(!transport.is_open());
        assert_eq!(transport.params().baud_rate, 115_200);

        assert!(matches!(
            transport.read(20).await,
            Err(AntError::Transport(_))
        ));
        assert!(matches!(
            transport.write(&[0xA4]).await,
            Err(AntError::Transport(_))
        ));
        assert!(transport.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_serial_open_missing_device_fails() {
        let mut transport = SerialTransport::new(SerialParams {
            path: "/dev/does-not-exist-ant".to_string(),
            ..SerialParams::default()
        });
        assert!(transport.open().await.is_err());
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_usb_transport_starts_closed() {
        let mut transport = UsbTransport::new(UsbParams::default());
        assert!(!transport.is_open());
        assert_eq!(transport.params().vendor_id, 0x0FCF);
        assert_eq!(transport.params().product_id, 0x1008);

        assert!(matches!(
            transport.read(20).await,
            Err(AntError::Transport(_))
        ));
        assert!(matches!(
            transport.write(&[0xA4]).await,
            Err(AntError::Transport(_))
        ));
        assert!(transport.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_usb_open_missing_device_fails() {
        let mut transport = UsbTransport::new(UsbParams {
            vendor_id: 0xFFFF,
            product_id: 0xFFFE,
            ..UsbParams::default()
        });
        assert!(transport.open().await.is_err());
        assert!(!transport.is_open());
    }
}
