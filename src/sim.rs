//! Simulated front-end for host tests.
//!
//! [`SimDevice`] models the GPIO chip, the SPI bus and the STM firmware
//! behind them closely enough to drive every controller operation: it
//! checks inbound trailers, answers status reads, keeps a flash array for
//! firmware transfers and records every line change, delay and frame so
//! tests can assert on the exact wire traffic. Timing is recorded, never
//! slept.

use crate::controller::{Controller, FIRMWARE_SIZE};
use crate::frame::{
    stamp_trailer, verify_trailer, ControlFrame, FirmwareHeader, StatusFrame, FIRMWARE_HEADER_LEN,
    TRAILER_LEN,
};
use crate::gpio::{
    Delay, GpioBackend, GpioChip, GpioController, GpioLine, InputLine, OutputLine, BUSY_LINE,
    RESET_LINE,
};
use crate::transport::{CrcPolicy, SpiBus};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// GPIO failure to inject on the next initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimGpioFault {
    ChipOpen,
    ResetAcquire,
    ResetDirection,
    BusyAcquire,
    BusyDirection,
}

struct SimState {
    // GPIO
    gpio_fault: Option<SimGpioFault>,
    open_chips: usize,
    reset_level: Option<bool>,
    reset_history: Vec<bool>,
    pending_fall: bool,
    resets: usize,
    busy_polls: usize,
    stuck_busy: bool,
    busy_reads: usize,
    delays: Vec<u64>,

    // Bus
    sent_frames: Vec<Vec<u8>>,
    bad_crc_frames: usize,
    bus_failure: bool,
    transfers_left: Option<usize>,
    corrupt_responses: bool,

    // Device firmware
    status: StatusFrame,
    broken_magic: bool,
    booted: bool,
    leds: Option<u8>,
    controls: Vec<ControlFrame>,
    flash: Vec<u8>,
    chunk_writes: Vec<u32>,
    chunk_reads: Vec<u32>,
    written_since_reset: usize,
    version_after_flash: Option<u16>,
    pending_read: Option<Vec<u8>>,
}

impl SimState {
    fn new() -> Self {
        let mut uid = [0u8; 12];
        for (i, byte) in uid.iter_mut().enumerate() {
            *byte = i as u8;
        }
        Self {
            gpio_fault: None,
            open_chips: 0,
            reset_level: None,
            reset_history: Vec::new(),
            pending_fall: false,
            resets: 0,
            busy_polls: 0,
            stuck_busy: false,
            busy_reads: 0,
            delays: Vec::new(),
            sent_frames: Vec::new(),
            bad_crc_frames: 0,
            bus_failure: false,
            transfers_left: None,
            corrupt_responses: false,
            status: StatusFrame {
                voltage_mv: 3900,
                current_ma: 120,
                charging: false,
                charge_percent: 80,
                uid,
                firmware_version: 100,
                batch: 1,
                device_crc_ok: true,
            },
            broken_magic: false,
            booted: false,
            leds: None,
            controls: Vec::new(),
            flash: vec![0xFF; FIRMWARE_SIZE],
            chunk_writes: Vec::new(),
            chunk_reads: Vec::new(),
            written_since_reset: 0,
            version_after_flash: None,
            pending_read: None,
        }
    }

    fn drive_reset(&mut self, high: bool) {
        match (self.reset_level, high) {
            (Some(true), false) => self.pending_fall = true,
            (Some(false), true) if self.pending_fall => {
                self.pending_fall = false;
                self.on_reset();
            }
            _ => {}
        }
        self.reset_level = Some(high);
        self.reset_history.push(high);
    }

    /// Device comes out of reset.
    fn on_reset(&mut self) {
        self.resets += 1;
        self.booted = false;
        self.pending_read = None;
        if self.written_since_reset >= FIRMWARE_SIZE {
            if let Some(version) = self.version_after_flash {
                self.status.firmware_version = version;
            }
        }
        self.written_since_reset = 0;
    }

    fn status_frame(&self) -> Vec<u8> {
        let mut frame = self.status.encode();
        if self.broken_magic {
            frame[0] = b'X';
        }
        stamp_trailer(&mut frame);
        frame.to_vec()
    }

    /// Run one transfer through the device firmware.
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<()> {
        if self.bus_failure {
            return Err(io::Error::other("simulated bus failure"));
        }
        if let Some(left) = self.transfers_left.as_mut() {
            if *left == 0 {
                return Err(io::Error::other("simulated transfer failure"));
            }
            *left -= 1;
        }

        self.sent_frames.push(tx.to_vec());
        rx.fill(0);

        // Held in reset: the bus floats low
        if self.pending_fall {
            return Ok(());
        }

        if tx.iter().all(|&b| b == 0) {
            let mut reply = match self.pending_read.take() {
                Some(reply) => reply,
                None => self.status_frame(),
            };
            if self.corrupt_responses && reply.len() > 7 {
                reply[7] ^= 0x01;
            }
            let n = reply.len().min(rx.len());
            rx[..n].copy_from_slice(&reply[..n]);
            return Ok(());
        }

        if !verify_trailer(tx) {
            self.bad_crc_frames += 1;
            self.status.device_crc_ok = false;
            return Ok(());
        }
        self.status.device_crc_ok = true;
        self.command(tx);
        Ok(())
    }

    fn command(&mut self, frame: &[u8]) {
        if frame.starts_with(b"GO!") {
            self.booted = true;
        } else if frame[0] == b'L' {
            self.leds = Some(frame[1]);
        } else if let Some(control) = ControlFrame::decode(frame) {
            self.controls.push(control);
        } else if let Some(header) = FirmwareHeader::decode(frame) {
            let start = header.address as usize;
            let len = header.length as usize;
            if header.write {
                if frame.len() < FIRMWARE_HEADER_LEN + len + TRAILER_LEN {
                    return;
                }
                let data = &frame[FIRMWARE_HEADER_LEN..FIRMWARE_HEADER_LEN + len];
                let end = (start + len).min(self.flash.len());
                if start < end {
                    self.flash[start..end].copy_from_slice(&data[..end - start]);
                }
                self.chunk_writes.push(header.address);
                self.written_since_reset += len;
            } else {
                let mut reply = vec![0u8; FIRMWARE_HEADER_LEN + len + TRAILER_LEN];
                reply[..FIRMWARE_HEADER_LEN].copy_from_slice(&header.encode());
                let end = (start + len).min(self.flash.len());
                if start < end {
                    reply[FIRMWARE_HEADER_LEN..FIRMWARE_HEADER_LEN + end - start]
                        .copy_from_slice(&self.flash[start..end]);
                }
                stamp_trailer(&mut reply);
                self.chunk_reads.push(header.address);
                self.pending_read = Some(reply);
            }
        }
    }
}

/// Handle on one simulated front-end; clones share the device.
#[derive(Clone)]
pub struct SimDevice {
    state: Arc<Mutex<SimState>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDevice {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn gpio(&self) -> SimGpio {
        SimGpio {
            state: Arc::clone(&self.state),
        }
    }

    pub fn delay(&self) -> SimDelay {
        SimDelay {
            state: Arc::clone(&self.state),
        }
    }

    pub fn bus(&self) -> SimBus {
        SimBus {
            device: self.clone(),
        }
    }

    /// Controller wired to this device, lines not yet acquired.
    pub fn uninitialized_controller(
        &self,
        policy: CrcPolicy,
    ) -> Controller<SimGpio, SimBus, SimDelay> {
        Controller::with_parts(GpioController::new(self.gpio(), self.delay()), self.bus(), policy)
    }

    /// Controller wired to this device with `gpiochip0` acquired.
    pub fn controller(&self, policy: CrcPolicy) -> Controller<SimGpio, SimBus, SimDelay> {
        let mut controller = self.uninitialized_controller(policy);
        if let Err(e) = controller.initialize("gpiochip0") {
            panic!("simulated GPIO failed to initialize: {}", e);
        }
        controller
    }

    pub fn set_gpio_fault(&self, fault: Option<SimGpioFault>) {
        self.state().gpio_fault = fault;
    }

    /// Chips currently held open.
    pub fn open_chips(&self) -> usize {
        self.state().open_chips
    }

    /// Current reset output level, `None` while no output is configured.
    pub fn reset_level(&self) -> Option<bool> {
        self.state().reset_level
    }

    /// Every level the reset output was driven to, including its default.
    pub fn reset_history(&self) -> Vec<bool> {
        self.state().reset_history.clone()
    }

    /// Completed reset pulses.
    pub fn resets(&self) -> usize {
        self.state().resets
    }

    pub fn delays(&self) -> Vec<u64> {
        self.state().delays.clone()
    }

    pub fn total_delay_ms(&self) -> u64 {
        self.state().delays.iter().sum()
    }

    /// Report busy on the next `polls` reads.
    pub fn set_busy_polls(&self, polls: usize) {
        self.state().busy_polls = polls;
    }

    pub fn set_stuck_busy(&self, stuck: bool) {
        self.state().stuck_busy = stuck;
    }

    pub fn busy_reads(&self) -> usize {
        self.state().busy_reads
    }

    /// Every buffer clocked out, at its transferred length.
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.state().sent_frames.clone()
    }

    /// Commands dropped for a bad trailer.
    pub fn bad_crc_frames(&self) -> usize {
        self.state().bad_crc_frames
    }

    pub fn set_bus_failure(&self, fail: bool) {
        self.state().bus_failure = fail;
    }

    /// Let `count` more transfers through, then fail every one after.
    pub fn fail_transfers_after(&self, count: usize) {
        self.state().transfers_left = Some(count);
    }

    /// Flip one bit of every reply after its trailer is stamped.
    pub fn set_corrupt_responses(&self, corrupt: bool) {
        self.state().corrupt_responses = corrupt;
    }

    /// Most transfers ever seen in progress at once.
    pub fn max_concurrent_transfers(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Whether the boot command arrived since the last reset.
    pub fn booted(&self) -> bool {
        self.state().booted
    }

    pub fn leds(&self) -> Option<u8> {
        self.state().leds
    }

    pub fn controls(&self) -> Vec<ControlFrame> {
        self.state().controls.clone()
    }

    pub fn chunk_writes(&self) -> Vec<u32> {
        self.state().chunk_writes.clone()
    }

    pub fn chunk_reads(&self) -> Vec<u32> {
        self.state().chunk_reads.clone()
    }

    /// Replace flash contents; padded with erased bytes to full size.
    pub fn load_flash(&self, data: &[u8]) {
        let mut state = self.state();
        let len = data.len().min(FIRMWARE_SIZE);
        state.flash = vec![0xFF; FIRMWARE_SIZE];
        state.flash[..len].copy_from_slice(&data[..len]);
    }

    pub fn flash(&self) -> Vec<u8> {
        self.state().flash.clone()
    }

    pub fn set_firmware_version(&self, version: u16) {
        self.state().status.firmware_version = version;
    }

    /// Version reported after a reset that follows a complete image write.
    pub fn set_version_after_flash(&self, version: Option<u16>) {
        self.state().version_after_flash = version;
    }

    /// Answer status reads with a frame that does not start with `Status`.
    pub fn set_broken_magic(&self, broken: bool) {
        self.state().broken_magic = broken;
    }

    /// Forget recorded frames and delays.
    pub fn clear_log(&self) {
        let mut state = self.state();
        state.sent_frames.clear();
        state.delays.clear();
    }
}

/// Simulated GPIO backend.
pub struct SimGpio {
    state: Arc<Mutex<SimState>>,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn fault(state: &Mutex<SimState>, which: SimGpioFault) -> io::Result<()> {
    if lock(state).gpio_fault == Some(which) {
        return Err(io::Error::other(format!("simulated {:?}", which)));
    }
    Ok(())
}

impl GpioBackend for SimGpio {
    type Chip = SimChip;

    fn open_chip(&self, name: &str) -> io::Result<SimChip> {
        if lock(&self.state).gpio_fault == Some(SimGpioFault::ChipOpen) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no chip named {}", name),
            ));
        }
        lock(&self.state).open_chips += 1;
        Ok(SimChip {
            state: Arc::clone(&self.state),
        })
    }
}

pub struct SimChip {
    state: Arc<Mutex<SimState>>,
}

impl GpioChip for SimChip {
    type Line = SimLine;

    fn line(&mut self, offset: u32) -> io::Result<SimLine> {
        match offset {
            RESET_LINE => fault(&self.state, SimGpioFault::ResetAcquire)?,
            BUSY_LINE => fault(&self.state, SimGpioFault::BusyAcquire)?,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("line {} not wired", offset),
                ))
            }
        }
        Ok(SimLine {
            state: Arc::clone(&self.state),
        })
    }
}

impl Drop for SimChip {
    fn drop(&mut self) {
        lock(&self.state).open_chips -= 1;
    }
}

pub struct SimLine {
    state: Arc<Mutex<SimState>>,
}

impl GpioLine for SimLine {
    type Output = SimOutput;
    type Input = SimInput;

    fn into_output(self, _consumer: &str, default: bool) -> io::Result<SimOutput> {
        fault(&self.state, SimGpioFault::ResetDirection)?;
        lock(&self.state).drive_reset(default);
        Ok(SimOutput { state: self.state })
    }

    fn into_input(self, _consumer: &str) -> io::Result<SimInput> {
        fault(&self.state, SimGpioFault::BusyDirection)?;
        Ok(SimInput { state: self.state })
    }
}

/// The reset output.
pub struct SimOutput {
    state: Arc<Mutex<SimState>>,
}

impl OutputLine for SimOutput {
    fn set(&self, high: bool) -> io::Result<()> {
        lock(&self.state).drive_reset(high);
        Ok(())
    }
}

impl Drop for SimOutput {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        state.reset_level = None;
        state.pending_fall = false;
    }
}

/// The busy input.
pub struct SimInput {
    state: Arc<Mutex<SimState>>,
}

impl InputLine for SimInput {
    fn is_high(&self) -> io::Result<bool> {
        let mut state = lock(&self.state);
        state.busy_reads += 1;
        if state.stuck_busy {
            return Ok(true);
        }
        if state.busy_polls > 0 {
            state.busy_polls -= 1;
            return Ok(true);
        }
        Ok(false)
    }
}

/// Records delays instead of sleeping.
pub struct SimDelay {
    state: Arc<Mutex<SimState>>,
}

impl Delay for SimDelay {
    fn delay_ms(&self, ms: u64) {
        lock(&self.state).delays.push(ms);
        std::thread::yield_now();
    }
}

/// Simulated SPI bus into the device firmware.
pub struct SimBus {
    device: SimDevice,
}

impl SpiBus for SimBus {
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<()> {
        let now = self.device.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.device.max_in_flight.fetch_max(now, Ordering::SeqCst);
        // Widen the window an unserialized caller would overlap in.
        std::thread::yield_now();

        let result = self.device.state().transfer(tx, rx);
        self.device.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
