//! Buffered command channel to the engine.
//!
//! Commands are stashed in a fixed-size buffer and sent with one transport
//! write on [`CommandChannel::flush`]. Replies are collected by busy-polling
//! against a short deadline, since the driver's read call usually returns
//! nothing when no data is ready.

use std::fmt;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::mpsse::{
    PinState, BAD_COMMAND, DIS_3_PHASE, DIS_ADAPTIVE, DIS_DIV_5, EN_3_PHASE, EN_ADAPTIVE,
    TCK_DIVISOR,
};
use crate::transport::{BitMode, DeviceSelector, OpenTransport, Transport};

/// Two opcodes the engine does not know; each one is echoed back as
/// `[BAD_COMMAND, opcode]`.
const SYNC_OPCODES: [u8; 2] = [0xab, 0xaa];

/// Engine reference clock with the divide-by-5 prescaler disabled.
const BASE_CLOCK_KHZ: f64 = 60_000.0;

/// Command channel error
#[derive(Debug, thiserror::Error)]
pub enum Error<E> {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Nothing was buffered, retry after a flush
    #[error("command buffer full: {pending} bytes pending, {requested} more requested")]
    CapacityExceeded { pending: usize, requested: usize },
    #[error("failed to open device: {0:?}")]
    Open(E),
    #[error("transport write failed: {0:?}")]
    TransportWrite(E),
    #[error("short write: {written} of {expected} bytes accepted")]
    ShortWrite { expected: usize, written: usize },
    #[error("transport read failed: {0:?}")]
    TransportRead(E),
    #[error("transport returned {received} bytes while only {remaining} were outstanding")]
    ReadOverrun { remaining: usize, received: usize },
    #[error("read timed out with {received} of {expected} bytes")]
    Timeout { expected: usize, received: usize },
    #[error("engine synchronization failed, last bytes seen {tail:#010x}")]
    SyncFailure { tail: u32 },
    #[error("failed to set bit mode: {0:?}")]
    BitMode(E),
}

/// Fixed-capacity FIFO of command bytes waiting for one flush.
pub struct CommandBuffer {
    bytes: [u8; CommandBuffer::CAPACITY],
    len: usize,
}

impl CommandBuffer {
    pub const CAPACITY: usize = 512;

    pub fn new() -> Self {
        CommandBuffer {
            bytes: [0; Self::CAPACITY],
            len: 0,
        }
    }

    /// Append all of `data` or nothing. Returns `false` when it does not fit.
    pub fn try_extend(&mut self, data: &[u8]) -> bool {
        if data.len() > self.remaining() {
            return false;
        }
        self.bytes[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        true
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn remaining(&self) -> usize {
        Self::CAPACITY - self.len
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl Default for CommandBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("pending", &self.as_slice())
            .finish()
    }
}

/// Clock divisor settings derived from a requested frequency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockConfig {
    pub requested_khz: f64,
    pub divisor: u16,
    pub three_phase: bool,
    pub adaptive: bool,
    pub actual_khz: f64,
    pub error_pct: f64,
}

impl ClockConfig {
    /// Compute the divisor for `khz`. Returns `None` unless `khz` is a
    /// positive finite number.
    ///
    /// Three-phase clocking stretches each cycle by half, so the divisor is
    /// computed for 1.5 times the requested rate.
    pub fn compute(khz: f64, three_phase: bool, adaptive: bool) -> Option<Self> {
        if !(khz > 0.0) || !khz.is_finite() {
            return None;
        }
        let effective = if three_phase { khz * 1.5 } else { khz };
        let raw = (BASE_CLOCK_KHZ / effective / 2.0 - 1.0).round();
        let divisor = raw.max(0.0).min(f64::from(u16::MAX)) as u16;

        let mut actual_khz = BASE_CLOCK_KHZ / ((f64::from(divisor) + 1.0) * 2.0);
        if three_phase {
            actual_khz = actual_khz / 3.0 * 2.0;
        }
        let error_pct = (actual_khz - khz).abs() / khz * 100.0;

        Some(ClockConfig {
            requested_khz: khz,
            divisor,
            three_phase,
            adaptive,
            actual_khz,
            error_pct,
        })
    }

    /// Mode toggles followed by the little-endian divisor command.
    pub fn command(&self) -> [u8; 6] {
        let [lo, hi] = self.divisor.to_le_bytes();
        [
            if self.three_phase { EN_3_PHASE } else { DIS_3_PHASE },
            if self.adaptive { EN_ADAPTIVE } else { DIS_ADAPTIVE },
            DIS_DIV_5,
            TCK_DIVISOR,
            lo,
            hi,
        ]
    }
}

/// Polling deadlines.
///
/// The defaults were tuned on a single FT2232H and may need adjusting for
/// other chips or hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Deadline for an ordinary [`CommandChannel::read`]
    pub read_timeout: Duration,
    /// Give up on [`CommandChannel::sync`] after this long
    pub sync_timeout: Duration,
    /// Processing latency floor before a sync echo is trusted
    pub sync_min_wait: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            read_timeout: Duration::from_millis(1),
            sync_timeout: Duration::from_millis(10),
            sync_min_wait: Duration::from_micros(100),
        }
    }
}

impl Timing {
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    pub fn with_sync_min_wait(mut self, wait: Duration) -> Self {
        self.sync_min_wait = wait;
        self
    }
}

/// Last four bytes received, oldest in the most significant position.
#[derive(Debug, Default, Clone, Copy)]
struct ShiftRegister(u32);

impl ShiftRegister {
    fn push(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 = (self.0 << 8) | u32::from(b);
        }
    }
}

/// Owner of the transport handle and its pending command bytes.
///
/// Dropping the channel puts the chip back into its neutral bit mode.
pub struct CommandChannel<T: Transport> {
    transport: T,
    buffer: CommandBuffer,
    timing: Timing,
}

impl<T: Transport> CommandChannel<T> {
    /// Wrap an already opened transport.
    pub fn new(transport: T) -> Self {
        Self::with_timing(transport, Timing::default())
    }

    pub fn with_timing(transport: T, timing: Timing) -> Self {
        CommandChannel {
            transport,
            buffer: CommandBuffer::new(),
            timing,
        }
    }

    /// Open the device described by `selector`.
    pub fn open(selector: &DeviceSelector) -> Result<Self, Error<T::Error>>
    where
        T: OpenTransport,
    {
        let transport = T::open(selector).map_err(Error::Open)?;
        debug!("opened {:?}", selector);
        Ok(Self::new(transport))
    }

    pub fn timing(&self) -> Timing {
        self.timing
    }

    pub fn set_timing(&mut self, timing: Timing) {
        self.timing = timing;
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Bytes buffered since the last successful flush.
    pub fn pending(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    /// Free space left in the command buffer.
    pub fn remaining(&self) -> usize {
        self.buffer.remaining()
    }

    /// Drop pending bytes without sending them.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn buffer_byte(&mut self, byte: u8) -> Result<(), Error<T::Error>> {
        self.buffer_bytes(&[byte])
    }

    /// Queue `data`. On `CapacityExceeded` the buffer is left untouched.
    pub fn buffer_bytes(&mut self, data: &[u8]) -> Result<(), Error<T::Error>> {
        if self.buffer.try_extend(data) {
            Ok(())
        } else {
            Err(Error::CapacityExceeded {
                pending: self.buffer.len(),
                requested: data.len(),
            })
        }
    }

    /// Send all pending bytes with one transport write.
    ///
    /// The buffer is only emptied when every byte was accepted.
    pub fn flush(&mut self) -> Result<(), Error<T::Error>> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        trace!("flush {:02x?}", self.buffer.as_slice());
        write_all(&mut self.transport, self.buffer.as_slice())?;
        self.buffer.clear();
        Ok(())
    }

    /// Fill `buf` completely, polling until the read deadline.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<(), Error<T::Error>> {
        let timeout = self.timing.read_timeout;
        self.read_within(buf, timeout)
    }

    /// Fill `buf` completely, polling for at most `timeout`.
    ///
    /// For replies that take longer on the wire than the configured read
    /// timeout allows.
    pub fn read_within(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<(), Error<T::Error>> {
        let expected = buf.len();
        if expected == 0 {
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        let mut filled = 0;
        loop {
            let remaining = expected - filled;
            match self.transport.read(&mut buf[filled..]) {
                Ok(n) if n > remaining => {
                    return Err(Error::ReadOverrun {
                        remaining,
                        received: n,
                    })
                }
                Ok(n) => {
                    filled += n;
                    if filled == expected {
                        return Ok(());
                    }
                }
                Err(nb::Error::WouldBlock) => {}
                Err(nb::Error::Other(e)) => return Err(Error::TransportRead(e)),
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    expected,
                    received: filled,
                });
            }
        }
    }

    /// Bring the engine into a known state right after it enters MPSSE mode.
    ///
    /// Bytes from a previous session may still be in flight, so two unknown
    /// opcodes are sent and the reply stream is watched until its last four
    /// bytes are both echoes. A match is only trusted once the minimum wait
    /// has passed, as a stale tail could match before the engine has replied.
    pub fn sync(&mut self) -> Result<(), Error<T::Error>> {
        let expected = u32::from_be_bytes([
            BAD_COMMAND,
            SYNC_OPCODES[0],
            BAD_COMMAND,
            SYNC_OPCODES[1],
        ]);

        write_all(&mut self.transport, &SYNC_OPCODES)?;

        let begin = Instant::now();
        let mut tail = ShiftRegister::default();
        let mut scratch = [0u8; 256];
        loop {
            let elapsed = begin.elapsed();
            if tail.0 == expected && elapsed >= self.timing.sync_min_wait {
                debug!("engine synchronized after {:?}", elapsed);
                return Ok(());
            }
            if elapsed >= self.timing.sync_timeout {
                break;
            }
            match self.transport.read(&mut scratch) {
                Ok(n) => tail.push(&scratch[..n.min(scratch.len())]),
                Err(nb::Error::WouldBlock) => {}
                Err(nb::Error::Other(e)) => return Err(Error::TransportRead(e)),
            }
        }

        warn!("engine synchronization failed, tail {:#010x}", tail.0);
        Err(Error::SyncFailure { tail: tail.0 })
    }

    /// Program the engine clock for `khz` and return the resulting settings.
    pub fn set_clock_frequency(
        &mut self,
        khz: f64,
        three_phase: bool,
        adaptive: bool,
    ) -> Result<ClockConfig, Error<T::Error>> {
        let config = ClockConfig::compute(khz, three_phase, adaptive)
            .ok_or(Error::InvalidArgument("clock frequency must be a positive number"))?;
        debug!(
            "requested {:.2} kHz, divisor {}, actual {:.2} kHz, error {:.2}%",
            config.requested_khz, config.divisor, config.actual_khz, config.error_pct
        );
        self.buffer_bytes(&config.command())?;
        self.flush()?;
        Ok(config)
    }

    /// Queue a "set low GPIO bank" command.
    pub fn buffer_lower_pins(&mut self, pins: PinState) -> Result<(), Error<T::Error>> {
        self.buffer_bytes(&pins.command())
    }

    /// Set the low GPIO bank as its own write.
    ///
    /// Each call is a separate transport write, which gives the time gap
    /// between edges that bus start and stop conditions need.
    pub fn set_lower_pins(&mut self, pins: PinState) -> Result<(), Error<T::Error>> {
        self.buffer_lower_pins(pins)?;
        self.flush()
    }

    pub fn set_bit_mode(&mut self, mask: u8, mode: BitMode) -> Result<(), Error<T::Error>> {
        self.transport
            .set_bit_mode(mask, mode)
            .map_err(Error::BitMode)
    }
}

impl<T: Transport> Drop for CommandChannel<T> {
    fn drop(&mut self) {
        if self.transport.set_bit_mode(0xff, BitMode::Reset).is_err() {
            warn!("failed to reset bit mode while closing channel");
        }
    }
}

fn write_all<T: Transport>(transport: &mut T, data: &[u8]) -> Result<(), Error<T::Error>> {
    let written = transport.write(data).map_err(Error::TransportWrite)?;
    if written != data.len() {
        return Err(Error::ShortWrite {
            expected: data.len(),
            written,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockError, MockTransport};
    use proptest::prelude::*;

    fn channel() -> (CommandChannel<MockTransport>, MockTransport) {
        let mock = MockTransport::new();
        (CommandChannel::new(mock.clone()), mock)
    }

    #[test]
    fn buffer_rejects_overflow_and_keeps_content() {
        let (mut ch, _mock) = channel();
        let head: Vec<u8> = (0..500).map(|i| i as u8).collect();
        ch.buffer_bytes(&head).unwrap();

        let err = ch.buffer_bytes(&[0u8; 13]).unwrap_err();
        match err {
            Error::CapacityExceeded { pending, requested } => {
                assert_eq!(pending, 500);
                assert_eq!(requested, 13);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(ch.pending(), &head[..]);

        ch.buffer_bytes(&[0u8; 12]).unwrap();
        assert_eq!(ch.pending().len(), CommandBuffer::CAPACITY);
        assert!(matches!(
            ch.buffer_byte(0),
            Err(Error::CapacityExceeded { .. })
        ));
    }

    #[test]
    fn flush_writes_once_and_empties() {
        let (mut ch, mock) = channel();
        ch.buffer_bytes(&[1, 2, 3]).unwrap();
        ch.buffer_byte(4).unwrap();
        ch.flush().unwrap();
        assert_eq!(mock.writes(), vec![vec![1, 2, 3, 4]]);
        assert!(ch.pending().is_empty());
    }

    #[test]
    fn empty_flush_is_noop() {
        let (mut ch, mock) = channel();
        ch.flush().unwrap();
        assert!(mock.writes().is_empty());
    }

    #[test]
    fn failed_flush_keeps_buffer() {
        let (mut ch, mock) = channel();
        ch.buffer_bytes(&[9, 8, 7]).unwrap();

        mock.short_write_next(1);
        assert!(matches!(
            ch.flush(),
            Err(Error::ShortWrite {
                expected: 3,
                written: 1
            })
        ));
        assert_eq!(ch.pending(), &[9, 8, 7]);

        mock.fail_write_next();
        assert!(matches!(
            ch.flush(),
            Err(Error::TransportWrite(MockError::Injected))
        ));
        assert_eq!(ch.pending(), &[9, 8, 7]);

        ch.flush().unwrap();
        assert!(ch.pending().is_empty());
    }

    #[test]
    fn read_collects_across_polls() {
        let (mut ch, mock) = channel();
        mock.push_read(&[0x11]);
        mock.push_read(&[0x22, 0x33]);
        let mut buf = [0u8; 3];
        ch.read(&mut buf).unwrap();
        assert_eq!(buf, [0x11, 0x22, 0x33]);
    }

    #[test]
    fn read_times_out() {
        let (mut ch, mock) = channel();
        mock.push_read(&[0x11]);
        let mut buf = [0u8; 2];
        let begin = Instant::now();
        assert!(matches!(
            ch.read(&mut buf),
            Err(Error::Timeout {
                expected: 2,
                received: 1
            })
        ));
        assert!(begin.elapsed() >= Duration::from_millis(1));
    }

    #[test]
    fn read_within_uses_given_deadline() {
        let (mut ch, mock) = channel();
        mock.push_read(&[0x11]);
        let mut buf = [0u8; 2];
        let begin = Instant::now();
        assert!(matches!(
            ch.read_within(&mut buf, Duration::from_millis(5)),
            Err(Error::Timeout {
                expected: 2,
                received: 1
            })
        ));
        assert!(begin.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn read_rejects_overrun() {
        let (mut ch, mock) = channel();
        mock.push_read(&[1, 2]);
        mock.inflate_reads(3);
        let mut buf = [0u8; 2];
        assert!(matches!(
            ch.read(&mut buf),
            Err(Error::ReadOverrun {
                remaining: 2,
                received: 5
            })
        ));
    }

    #[test]
    fn sync_waits_for_latency_floor() {
        let (mut ch, mock) = channel();
        mock.set_echo(true);
        let begin = Instant::now();
        ch.sync().unwrap();
        assert!(begin.elapsed() >= Duration::from_micros(100));
        assert_eq!(mock.writes(), vec![vec![0xab, 0xaa]]);
    }

    #[test]
    fn sync_skips_stale_bytes_in_one_poll() {
        let (mut ch, mock) = channel();
        // stale reply and echo arrive together
        mock.push_read(&[0x01, 0x02, 0xfa, 0x55, 0xfa, 0xab, 0xfa, 0xaa]);
        ch.sync().unwrap();
    }

    #[test]
    fn sync_fails_without_echo() {
        let (mut ch, mock) = channel();
        mock.push_read(&[0xfa, 0xab]);
        let begin = Instant::now();
        match ch.sync() {
            Err(Error::SyncFailure { tail }) => assert_eq!(tail, 0x0000_faab),
            other => panic!("unexpected result {:?}", other),
        }
        let elapsed = begin.elapsed();
        assert!(elapsed >= Duration::from_millis(10));
        assert!(elapsed < Duration::from_millis(500));
    }

    #[test]
    fn sync_honours_custom_timing() {
        let mock = MockTransport::new();
        let timing = Timing::default()
            .with_sync_timeout(Duration::from_millis(2))
            .with_sync_min_wait(Duration::from_micros(10));
        let mut ch = CommandChannel::with_timing(mock, timing);
        let begin = Instant::now();
        assert!(matches!(ch.sync(), Err(Error::SyncFailure { .. })));
        assert!(begin.elapsed() < Duration::from_millis(10));
    }

    #[test]
    fn clock_command_for_i2c() {
        let (mut ch, mock) = channel();
        let config = ch.set_clock_frequency(400.0, true, false).unwrap();
        assert_eq!(config.divisor, 49);
        assert!((config.actual_khz - 400.0).abs() < 1e-9);
        assert_eq!(
            mock.writes(),
            vec![vec![0x8c, 0x97, 0x8a, 0x86, 49, 0]]
        );
    }

    #[test]
    fn clock_divisor_is_little_endian() {
        let config = ClockConfig::compute(1.0, false, true).unwrap();
        assert_eq!(config.divisor, 29_999);
        assert_eq!(config.command(), [0x8d, 0x96, 0x8a, 0x86, 0x2f, 0x75]);
    }

    #[test]
    fn clock_rejects_non_positive() {
        let (mut ch, mock) = channel();
        for &khz in &[0.0, -1.0, f64::NAN] {
            assert!(matches!(
                ch.set_clock_frequency(khz, false, false),
                Err(Error::InvalidArgument(_))
            ));
        }
        assert!(mock.writes().is_empty());
    }

    #[test]
    fn clock_clamps_divisor() {
        assert_eq!(ClockConfig::compute(0.1, false, false).unwrap().divisor, u16::MAX);
        assert_eq!(ClockConfig::compute(90_000.0, false, false).unwrap().divisor, 0);
    }

    #[test]
    fn lower_pins_is_one_write() {
        let (mut ch, mock) = channel();
        ch.set_lower_pins(PinState::new(0b01, 0b11)).unwrap();
        ch.set_lower_pins(PinState::new(0b00, 0b11)).unwrap();
        assert_eq!(
            mock.writes(),
            vec![vec![0x80, 0b01, 0b11], vec![0x80, 0b00, 0b11]]
        );
    }

    #[test]
    fn drop_resets_bit_mode() {
        let (ch, mock) = channel();
        drop(ch);
        assert_eq!(mock.bit_modes(), vec![(0xff, BitMode::Reset)]);
    }

    proptest! {
        #[test]
        fn divisor_consistent(khz in 0.001f64..100_000.0, three_phase: bool, adaptive: bool) {
            let config = ClockConfig::compute(khz, three_phase, adaptive).unwrap();
            let mut actual = 60_000.0 / ((f64::from(config.divisor) + 1.0) * 2.0);
            if three_phase {
                actual = actual / 3.0 * 2.0;
            }
            prop_assert!((config.actual_khz - actual).abs() < 1e-9);
            let error = (config.actual_khz - khz).abs() / khz * 100.0;
            prop_assert!((config.error_pct - error).abs() < 1e-9);
            prop_assert_eq!(config.three_phase, three_phase);
            prop_assert_eq!(config.adaptive, adaptive);
        }

        #[test]
        fn divisor_rejects_non_positive(khz in -100_000.0f64..=0.0) {
            prop_assert!(ClockConfig::compute(khz, false, false).is_none());
            prop_assert!(ClockConfig::compute(khz, true, true).is_none());
        }
    }
}
