//! Key-scanner upgrade session.
//!
//! The session drives the keyboard's upgrade plugin through a fixed
//! sequence:
//!
//! ```text
//! start -> isReady (poll) -> [beginLeft -> getInfo -> sendWrite* -> finish]
//!                         -> [beginRight -> getInfo -> sendWrite* -> finish] -> (end)
//! ```
//!
//! Every command is answered with two lines; only the first one carries
//! information. A checked first line equal to `false \r\n` aborts the run.
//! Nothing is retried: a rejected block leaves the half in whatever state
//! the bootloader put it and the other half is never touched.
//!
//! ## Example
//!
//! ```rust,no_run
//! use defyflash::{FirmwareImage, UpgradeSession};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     #[cfg(feature = "native")]
//!     {
//!         use defyflash::{NativePort, SerialConfig};
//!
//!         let image = FirmwareImage::from_file("keyscanner.bin")?;
//!         let port = NativePort::open(&SerialConfig::new("/dev/ttyACM0", 115_200))?;
//!
//!         let mut session = UpgradeSession::new(port);
//!         let report = session.run(&image, &mut |side, written, total| {
//!             println!("{side}: {written}/{total}");
//!         })?;
//!         println!("{} halves processed", report.halves.len());
//!     }
//!     Ok(())
//! }
//! ```

use crate::error::{Error, Result};
use crate::image::seal::FirmwareImage;
use crate::port::Port;
use crate::protocol::codec::{
    Command, DeviceInfo, WriteCommand, decode_device_info, is_error_sentinel, is_ready_line,
};
use crate::protocol::line::{DEFAULT_RESPONSE_TIMEOUT, LineChannel};
use log::{debug, info, warn};
use std::fmt;
use std::io;
use std::thread;
use std::time::{Duration, Instant};

/// Delay between two `isReady` polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Longest uninterrupted sleep while waiting between polls.
const PAUSE_SLICE: Duration = Duration::from_millis(50);

/// One of the two key-scanner controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Side {
    /// Left half.
    Left,
    /// Right half.
    Right,
}

impl Side {
    /// Both halves in flashing order.
    pub const BOTH: [Side; 2] = [Side::Left, Side::Right];

    /// The command that selects this half.
    pub fn begin_command(self) -> Command {
        match self {
            Self::Left => Command::BeginLeft,
            Self::Right => Command::BeginRight,
        }
    }

    /// Lowercase name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Right => "right",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where a session currently is in the upgrade sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeState {
    /// Nothing sent yet.
    Idle,
    /// `upgrade.start` was sent.
    HandshakeStarted,
    /// Polling `upgrade.isReady`.
    AwaitingReady,
    /// The device reported readiness.
    Ready,
    /// A half was selected.
    HalfBegun(Side),
    /// The selected half's bootloader info was read.
    InfoFetched(Side),
    /// Writing the block at `offset` to `side`.
    Transferring {
        /// Half being written.
        side: Side,
        /// Image offset of the block in flight.
        offset: usize,
    },
    /// A half left its bootloader.
    HalfFinished(Side),
    /// All requested halves were processed.
    Done,
    /// The run was aborted. The transport is closed.
    Failed,
}

/// What to do when a half already runs the sealed program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdatePolicy {
    /// Report and flash anyway.
    #[default]
    Always,
    /// Report and leave the half untouched.
    SkipWhenCurrent,
}

/// Tunables of an upgrade session.
#[derive(Debug, Clone)]
pub struct UpgradeOptions {
    /// Delay between readiness polls.
    pub poll_interval: Duration,
    /// Give up after this many not-ready answers.
    pub max_ready_attempts: Option<u32>,
    /// Give up once readiness polling took this long.
    pub ready_timeout: Option<Duration>,
    /// Time to wait for each response line.
    pub response_timeout: Duration,
    /// Behavior for halves that are already current.
    pub policy: UpdatePolicy,
    /// Send `upgrade.end` after the last half.
    pub send_end: bool,
}

impl UpgradeOptions {
    /// Reject settings that would make the session stall or never poll.
    pub fn validate(&self) -> Result<()> {
        if self.max_ready_attempts == Some(0) {
            return Err(Error::Config("max_ready_attempts must be at least 1".into()));
        }
        if self.response_timeout.is_zero() {
            return Err(Error::Config("response_timeout must be non-zero".into()));
        }
        Ok(())
    }
}

impl Default for UpgradeOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_ready_attempts: None,
            ready_timeout: None,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            policy: UpdatePolicy::Always,
            send_end: false,
        }
    }
}

/// Result of processing one half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum HalfOutcome {
    /// The image was written.
    Flashed,
    /// The half already ran the sealed program and the policy skipped it.
    Skipped,
}

/// Per-half summary of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct HalfReport {
    /// Which half.
    pub side: Side,
    /// Bootloader info read before writing.
    pub info: DeviceInfo,
    /// Whether the installed program differed from the sealed one.
    pub needed_update: bool,
    /// What happened.
    pub outcome: HalfOutcome,
}

/// Summary of a completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct UpgradeReport {
    /// Halves in processing order.
    pub halves: Vec<HalfReport>,
}

type CancelCheck = Box<dyn Fn() -> bool + Send>;

/// Drives one upgrade run over an owned port.
///
/// The port is closed when the run finishes, when any step fails, or when
/// the session is dropped.
pub struct UpgradeSession<P: Port> {
    channel: LineChannel<P>,
    options: UpgradeOptions,
    state: UpgradeState,
    info: Option<DeviceInfo>,
    cancel: CancelCheck,
    closed: bool,
}

impl<P: Port> UpgradeSession<P> {
    /// Create a session over an opened port with default options.
    ///
    /// Cancellation follows [`crate::is_interrupted_requested`].
    pub fn new(port: P) -> Self {
        Self {
            channel: LineChannel::new(port),
            options: UpgradeOptions::default(),
            state: UpgradeState::Idle,
            info: None,
            cancel: Box::new(crate::is_interrupted_requested),
            closed: false,
        }
    }

    /// Replace the session options.
    #[must_use]
    pub fn with_options(mut self, options: UpgradeOptions) -> Self {
        self.channel.set_response_timeout(options.response_timeout);
        self.options = options;
        self
    }

    /// Replace the cancellation check.
    #[must_use]
    pub fn with_cancel_check<F>(mut self, check: F) -> Self
    where
        F: Fn() -> bool + Send + 'static,
    {
        self.cancel = Box::new(check);
        self
    }

    /// Current options.
    pub fn options(&self) -> &UpgradeOptions {
        &self.options
    }

    /// Current state.
    pub fn state(&self) -> UpgradeState {
        self.state
    }

    /// Info of the half selected last, if it was read.
    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.info.as_ref()
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        self.channel.port()
    }

    /// Whether the transport was released.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Flash both halves, left first.
    pub fn run(
        &mut self,
        image: &FirmwareImage,
        progress: &mut dyn FnMut(Side, usize, usize),
    ) -> Result<UpgradeReport> {
        self.run_sides(&Side::BOTH, image, progress)
    }

    /// Flash the given halves in order and close the transport.
    pub fn run_sides(
        &mut self,
        sides: &[Side],
        image: &FirmwareImage,
        progress: &mut dyn FnMut(Side, usize, usize),
    ) -> Result<UpgradeReport> {
        let report = self.guarded(|s| {
            s.start()?;
            s.wait_ready()?;

            let mut report = UpgradeReport::default();
            for &side in sides {
                report.halves.push(s.flash_half(side, image, progress)?);
            }

            if s.options.send_end {
                s.end()?;
            }
            Ok(report)
        })?;

        self.state = UpgradeState::Done;
        info!("Upgrade complete");
        self.close()?;
        Ok(report)
    }

    /// Read the bootloader info of the given halves without writing.
    pub fn query_sides(&mut self, sides: &[Side]) -> Result<Vec<(Side, DeviceInfo)>> {
        let infos = self.guarded(|s| {
            s.start()?;
            s.wait_ready()?;

            let mut infos = Vec::with_capacity(sides.len());
            for &side in sides {
                infos.push((side, s.query_info(side)?));
            }
            Ok(infos)
        })?;

        self.state = UpgradeState::Done;
        self.close()?;
        Ok(infos)
    }

    /// Arm upgrade mode. The answer is not validated.
    pub fn start(&mut self) -> Result<()> {
        self.guarded(|s| {
            s.options.validate()?;
            info!("Starting upgrade on {}", s.channel.port().name());
            s.channel.discard_input()?;
            s.exchange(Command::Start)?;
            s.state = UpgradeState::HandshakeStarted;
            Ok(())
        })
    }

    /// Poll `upgrade.isReady` until the device reports `true`.
    ///
    /// Ends with [`Error::Cancelled`] when the cancellation check fires and
    /// with [`Error::Timeout`] when the configured attempt count or deadline
    /// runs out. Without either bound the loop polls until cancelled.
    pub fn wait_ready(&mut self) -> Result<()> {
        self.guarded(|s| {
            s.state = UpgradeState::AwaitingReady;
            let started = Instant::now();
            let mut attempts: u32 = 0;

            loop {
                s.check_cancelled("waiting for the device")?;

                let line = s.exchange(Command::IsReady)?;
                attempts += 1;
                if is_ready_line(&line) {
                    debug!("Device ready after {attempts} poll(s)");
                    s.state = UpgradeState::Ready;
                    return Ok(());
                }

                if s.options.max_ready_attempts.is_some_and(|max| attempts >= max) {
                    return Err(Error::Timeout(format!(
                        "Device not ready after {attempts} attempts"
                    )));
                }
                if attempts == 1 {
                    info!("Waiting for the keyboard to become ready...");
                }

                let mut pause = s.options.poll_interval;
                if let Some(limit) = s.options.ready_timeout {
                    pause = pause.min(limit.saturating_sub(started.elapsed()));
                }
                s.pause(pause, "waiting for the device")?;

                if let Some(limit) = s.options.ready_timeout {
                    if started.elapsed() >= limit {
                        return Err(Error::Timeout(format!(
                            "Device not ready within {} ms",
                            limit.as_millis()
                        )));
                    }
                }
            }
        })
    }

    /// Select a half.
    pub fn begin_half(&mut self, side: Side) -> Result<()> {
        self.guarded(|s| {
            debug!("Selecting {side} half");
            s.info = None;
            s.checked_exchange(side.begin_command())?;
            s.state = UpgradeState::HalfBegun(side);
            Ok(())
        })
    }

    /// Read the selected half's bootloader info.
    pub fn get_info(&mut self) -> Result<DeviceInfo> {
        self.guarded(|s| {
            let line = s.checked_exchange(Command::GetInfo)?;
            let info = decode_device_info(&line)?;
            debug!(
                "Bootloader info: hw {}, flash start {:#010x}, program version {:#010x}, CRC {:#010x}",
                info.hardware_version, info.flash_start, info.program_version, info.program_crc
            );
            if let UpgradeState::HalfBegun(side) = s.state {
                s.state = UpgradeState::InfoFetched(side);
            }
            s.info = Some(info);
            Ok(info)
        })
    }

    /// Leave the selected half's bootloader. The answer is not validated.
    pub fn finish(&mut self) -> Result<()> {
        self.guarded(|s| {
            s.exchange(Command::Finish)?;
            if let Some(side) = s.current_side() {
                s.state = UpgradeState::HalfFinished(side);
            }
            Ok(())
        })
    }

    /// Disarm upgrade mode. The answer is not validated.
    pub fn end(&mut self) -> Result<()> {
        self.guarded(|s| {
            s.exchange(Command::End)?;
            Ok(())
        })
    }

    /// Select a half, read its info and release it again.
    pub fn query_info(&mut self, side: Side) -> Result<DeviceInfo> {
        self.begin_half(side)?;
        let info = self.get_info()?;
        self.finish()?;
        Ok(info)
    }

    /// Run the full flash cycle on one half.
    pub fn flash_half(
        &mut self,
        side: Side,
        image: &FirmwareImage,
        progress: &mut dyn FnMut(Side, usize, usize),
    ) -> Result<HalfReport> {
        self.begin_half(side)?;
        let info = self.get_info()?;

        let needed_update = image.seal().needs_update(&info);
        if !needed_update {
            warn!(
                "{side} half already runs program CRC {:#010x}, no update needed",
                info.program_crc
            );
            if self.options.policy == UpdatePolicy::SkipWhenCurrent {
                info!("Skipping {side} half");
                self.finish()?;
                return Ok(HalfReport {
                    side,
                    info,
                    needed_update,
                    outcome: HalfOutcome::Skipped,
                });
            }
        }

        self.guarded(|s| s.write_image(side, &info, image, progress))?;
        self.finish()?;

        info!("{side} half flashed");
        Ok(HalfReport {
            side,
            info,
            needed_update,
            outcome: HalfOutcome::Flashed,
        })
    }

    /// Close the transport. Safe to call more than once.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.channel.close()
    }

    fn write_image(
        &mut self,
        side: Side,
        info: &DeviceInfo,
        image: &FirmwareImage,
        progress: &mut dyn FnMut(Side, usize, usize),
    ) -> Result<()> {
        let total = image.len();
        info!(
            "Writing {total} bytes to {side} half at {:#010x} ({} blocks)",
            info.flash_start,
            image.chunk_count()
        );
        progress(side, 0, total);

        for (offset, chunk) in image.chunks() {
            self.check_cancelled("writing firmware")?;
            self.state = UpgradeState::Transferring { side, offset };

            let address = flash_address(info, offset)?;
            let frame = WriteCommand::new(address, chunk).build();
            self.channel.send(&frame)?;

            let line = self.channel.read_response()?;
            if is_error_sentinel(&line) {
                return Err(Error::DeviceRejected {
                    step: format!("{} at {address:#010x}", Command::SendWrite),
                });
            }

            progress(side, offset + chunk.len(), total);
        }
        Ok(())
    }

    /// Send a text command and return the first line of its answer.
    fn exchange(&mut self, command: Command) -> Result<Vec<u8>> {
        self.channel.send(&command.wire_bytes())?;
        self.channel.read_response()
    }

    /// Like [`exchange`](Self::exchange), failing on the error sentinel.
    fn checked_exchange(&mut self, command: Command) -> Result<Vec<u8>> {
        let line = self.exchange(command)?;
        if is_error_sentinel(&line) {
            return Err(Error::DeviceRejected {
                step: command.name().to_string(),
            });
        }
        Ok(line)
    }

    fn check_cancelled(&self, what: &str) -> Result<()> {
        if (self.cancel)() {
            return Err(Error::Cancelled(format!("Interrupted while {what}")));
        }
        Ok(())
    }

    /// Sleep for `duration` in short slices, checking for cancellation
    /// after each one.
    fn pause(&self, duration: Duration, what: &str) -> Result<()> {
        let started = Instant::now();
        loop {
            let remaining = duration.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Ok(());
            }
            thread::sleep(remaining.min(PAUSE_SLICE));
            self.check_cancelled(what)?;
        }
    }

    fn current_side(&self) -> Option<Side> {
        match self.state {
            UpgradeState::HalfBegun(side)
            | UpgradeState::InfoFetched(side)
            | UpgradeState::Transferring { side, .. }
            | UpgradeState::HalfFinished(side) => Some(side),
            _ => None,
        }
    }

    /// Run `step`, moving to [`UpgradeState::Failed`] and closing the
    /// transport if it fails.
    fn guarded<T>(&mut self, step: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.closed || self.state == UpgradeState::Failed {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "upgrade session is closed",
            )));
        }

        match step(self) {
            Ok(value) => Ok(value),
            Err(e) => {
                if self.state != UpgradeState::Failed {
                    warn!("Upgrade failed in state {:?}: {e}", self.state);
                    self.state = UpgradeState::Failed;
                    if let Err(close_err) = self.close() {
                        debug!("Failed to close port after error: {close_err}");
                    }
                }
                Err(e)
            },
        }
    }
}

impl<P: Port> Drop for UpgradeSession<P> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!("Failed to close port on drop: {e}");
        }
    }
}

/// Flash address of the block at image `offset`.
fn flash_address(info: &DeviceInfo, offset: usize) -> Result<u32> {
    u32::try_from(offset)
        .ok()
        .and_then(|offset| info.flash_start.checked_add(offset))
        .ok_or_else(|| Error::MalformedResponse {
            step: Command::GetInfo.name().to_string(),
            line: format!(
                "flash start {:#010x} leaves no room for offset {offset:#x}",
                info.flash_start
            ),
        })
}
