//! Serialized, CRC-framed exchanges with the front-end.
//!
//! Every bus transaction goes through [`Transport`]: it waits for the busy
//! line to drop, stamps the outbound trailer, runs one duplex transfer and
//! checks the inbound trailer. The bus sits behind a mutex so at most one
//! exchange is in flight; the device's command parser cannot interleave.

#[cfg(feature = "linux")]
pub mod spidev;

use crate::frame::{self, hex_dump};
use crate::gpio::{Delay, GpioBackend, GpioController, GpioError};
use log::{debug, error, trace, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::{Mutex, MutexGuard};

/// Synchronous full-duplex byte bus.
pub trait SpiBus: Send {
    /// Clock out `tx` while clocking in `rx`. Both have the same length.
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<()>;
}

/// What to do with a received frame whose trailer does not match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrcPolicy {
    /// Log the mismatch and hand the frame over anyway.
    #[default]
    Lenient,
    /// Fail the exchange.
    Strict,
}

/// Transport errors.
#[derive(Debug)]
pub enum TransportError {
    /// Device never became ready, or the GPIO lines are unusable.
    NotReady(GpioError),
    /// The bus transfer itself failed.
    Bus(io::Error),
    /// Received trailer mismatch under [`CrcPolicy::Strict`].
    Crc { stored: u16, computed: u16, len: usize },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotReady(e) => write!(f, "device not ready: {}", e),
            Self::Bus(e) => write!(f, "SPI transfer failed: {}", e),
            Self::Crc {
                stored,
                computed,
                len,
            } => write!(
                f,
                "CRC mismatch: found 0x{:04X}, computed 0x{:04X}, length {}",
                stored, computed, len
            ),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::NotReady(e) => Some(e),
            Self::Bus(e) => Some(e),
            Self::Crc { .. } => None,
        }
    }
}

/// Bus plus the GPIO lines that gate it.
pub struct Transport<G: GpioBackend, B: SpiBus, D: Delay> {
    gpio: GpioController<G, D>,
    bus: Mutex<B>,
    crc_policy: CrcPolicy,
}

impl<G: GpioBackend, B: SpiBus, D: Delay> Transport<G, B, D> {
    pub fn new(gpio: GpioController<G, D>, bus: B, crc_policy: CrcPolicy) -> Self {
        Self {
            gpio,
            bus: Mutex::new(bus),
            crc_policy,
        }
    }

    pub fn gpio(&self) -> &GpioController<G, D> {
        &self.gpio
    }

    pub fn gpio_mut(&mut self) -> &mut GpioController<G, D> {
        &mut self.gpio
    }

    pub fn crc_policy(&self) -> CrcPolicy {
        self.crc_policy
    }

    pub fn set_crc_policy(&mut self, policy: CrcPolicy) {
        self.crc_policy = policy;
    }

    /// Take exclusive use of the bus for a multi-step transaction.
    pub fn lock(&self) -> Link<'_, G, B, D> {
        // A panic mid-exchange leaves the bus itself usable.
        let bus = self.bus.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Link {
            gpio: &self.gpio,
            bus,
            crc_policy: self.crc_policy,
        }
    }

    /// One locked exchange; see [`Link::exchange`].
    pub fn exchange(
        &self,
        tx: Option<&mut [u8]>,
        rx: Option<&mut [u8]>,
    ) -> Result<(), TransportError> {
        self.lock().exchange(tx, rx)
    }

    /// Send a frame, ignoring whatever comes back.
    pub fn send(&self, frame: &mut [u8]) -> Result<(), TransportError> {
        self.lock().send(frame)
    }

    /// Clock in a frame while sending zeros.
    pub fn receive(&self, frame: &mut [u8]) -> Result<(), TransportError> {
        self.lock().receive(frame)
    }
}

/// Exclusive handle on the bus; released on drop.
pub struct Link<'a, G: GpioBackend, B: SpiBus, D: Delay> {
    gpio: &'a GpioController<G, D>,
    bus: MutexGuard<'a, B>,
    crc_policy: CrcPolicy,
}

impl<G: GpioBackend, B: SpiBus, D: Delay> Link<'_, G, B, D> {
    /// Exchange `tx` against `rx` in one duplex transfer.
    ///
    /// Waits for the device first, stamps the trailer on `tx`, and verifies
    /// the trailer on `rx` according to the CRC policy. Missing buffers are
    /// replaced by zeros on the way out and discarded on the way in.
    pub fn exchange(
        &mut self,
        tx: Option<&mut [u8]>,
        rx: Option<&mut [u8]>,
    ) -> Result<(), TransportError> {
        self.gpio.wait_for_ready().map_err(|e| {
            error!("Exchange aborted: {}", e);
            TransportError::NotReady(e)
        })?;

        let tx_len = tx.as_ref().map_or(0, |b| b.len());
        let rx_len = rx.as_ref().map_or(0, |b| b.len());
        let len = tx_len.max(rx_len);

        let mut out = vec![0u8; len];
        if let Some(tx) = tx {
            frame::stamp_trailer(tx);
            out[..tx_len].copy_from_slice(tx);
        }
        let mut inbound = vec![0u8; len];

        trace!("SPI out ({} bytes):\n{}", tx_len, hex_dump(&out[..tx_len]));
        self.bus.transfer(&out, &mut inbound).map_err(|e| {
            error!("SPI transfer of {} bytes failed: {}", len, e);
            TransportError::Bus(e)
        })?;

        if let Some(rx) = rx {
            rx.copy_from_slice(&inbound[..rx_len]);
            trace!("SPI in ({} bytes):\n{}", rx_len, hex_dump(rx));
            self.check_trailer(rx)?;
        }

        debug!("Exchanged {} out / {} in", tx_len, rx_len);
        Ok(())
    }

    fn check_trailer(&self, rx: &[u8]) -> Result<(), TransportError> {
        let Some((stored, computed)) = frame::trailer_checksums(rx) else {
            return Ok(());
        };
        if stored == computed {
            return Ok(());
        }

        warn!(
            "CRC found 0x{:04X}, computed 0x{:04X}, length {}",
            stored,
            computed,
            rx.len()
        );
        match self.crc_policy {
            CrcPolicy::Lenient => Ok(()),
            CrcPolicy::Strict => Err(TransportError::Crc {
                stored,
                computed,
                len: rx.len(),
            }),
        }
    }

    pub fn send(&mut self, frame: &mut [u8]) -> Result<(), TransportError> {
        self.exchange(Some(frame), None)
    }

    pub fn receive(&mut self, frame: &mut [u8]) -> Result<(), TransportError> {
        self.exchange(None, Some(frame))
    }

    /// The GPIO lines, for resets inside a transaction.
    pub fn gpio(&self) -> &GpioController<G, D> {
        self.gpio
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{boot_frame, verify_trailer, StatusFrame, STATUS_FRAME_LEN};
    use crate::sim::{SimBus, SimDelay, SimDevice, SimGpio};
    use std::sync::Arc;
    use std::thread;

    fn transport(device: &SimDevice, policy: CrcPolicy) -> Transport<SimGpio, SimBus, SimDelay> {
        let mut gpio = GpioController::new(device.gpio(), device.delay());
        gpio.initialize("gpiochip0").unwrap();
        Transport::new(gpio, device.bus(), policy)
    }

    #[test]
    fn test_send_stamps_trailer() {
        let device = SimDevice::new();
        let transport = transport(&device, CrcPolicy::Lenient);

        let mut frame = boot_frame();
        transport.send(&mut frame).unwrap();

        assert!(verify_trailer(&frame));
        let sent = device.sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0][..], &frame[..]);
        assert_eq!(device.bad_crc_frames(), 0);
    }

    #[test]
    fn test_receive_sends_zeros() {
        let device = SimDevice::new();
        let transport = transport(&device, CrcPolicy::Strict);

        let mut frame = [0u8; STATUS_FRAME_LEN];
        transport.receive(&mut frame).unwrap();

        assert!(verify_trailer(&frame));
        assert!(StatusFrame::parse(&frame).is_ok());
        assert!(device.sent_frames()[0].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_exchange_waits_for_ready() {
        let device = SimDevice::new();
        let transport = transport(&device, CrcPolicy::Lenient);

        device.set_stuck_busy(true);
        let mut frame = boot_frame();
        let err = transport.send(&mut frame).unwrap_err();
        assert!(matches!(
            err,
            TransportError::NotReady(GpioError::ReadyTimeout { .. })
        ));
        assert!(device.sent_frames().is_empty());
    }

    #[test]
    fn test_exchange_uninitialized_gpio() {
        let device = SimDevice::new();
        let gpio = GpioController::new(device.gpio(), device.delay());
        let transport = Transport::new(gpio, device.bus(), CrcPolicy::Lenient);

        let mut frame = [0u8; STATUS_FRAME_LEN];
        assert!(matches!(
            transport.receive(&mut frame),
            Err(TransportError::NotReady(GpioError::NotInitialized))
        ));
        assert_eq!(device.busy_reads(), 0);
    }

    #[test]
    fn test_bus_failure_is_reported() {
        let device = SimDevice::new();
        let transport = transport(&device, CrcPolicy::Lenient);

        device.set_bus_failure(true);
        let mut frame = boot_frame();
        assert!(matches!(
            transport.send(&mut frame),
            Err(TransportError::Bus(_))
        ));
    }

    #[test]
    fn test_lenient_policy_passes_corrupt_frame() {
        let device = SimDevice::new();
        let transport = transport(&device, CrcPolicy::Lenient);

        device.set_corrupt_responses(true);
        let mut frame = [0u8; STATUS_FRAME_LEN];
        transport.receive(&mut frame).unwrap();
        assert!(!verify_trailer(&frame));
    }

    #[test]
    fn test_strict_policy_rejects_corrupt_frame() {
        let device = SimDevice::new();
        let transport = transport(&device, CrcPolicy::Strict);

        device.set_corrupt_responses(true);
        let mut frame = [0u8; STATUS_FRAME_LEN];
        let err = transport.receive(&mut frame).unwrap_err();
        assert!(matches!(err, TransportError::Crc { len: 32, .. }));
    }

    #[test]
    fn test_independent_lengths() {
        let device = SimDevice::new();
        let transport = transport(&device, CrcPolicy::Lenient);

        let mut tx = [0u8; 8];
        tx[0] = b'X';
        let mut rx = [0u8; STATUS_FRAME_LEN];
        transport.exchange(Some(&mut tx), Some(&mut rx)).unwrap();

        let sent = device.sent_frames();
        assert_eq!(sent[0].len(), STATUS_FRAME_LEN);
        assert_eq!(&sent[0][..8], &tx);
        assert!(sent[0][8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_exchanges_never_overlap() {
        let device = SimDevice::new();
        let transport = Arc::new(transport(&device, CrcPolicy::Strict));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let transport = Arc::clone(&transport);
                thread::spawn(move || {
                    for _ in 0..25 {
                        let mut frame = [0u8; STATUS_FRAME_LEN];
                        transport.receive(&mut frame).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(device.sent_frames().len(), 100);
        assert_eq!(device.max_concurrent_transfers(), 1);
    }
}
