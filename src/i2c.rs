/*!
  # I2C master built from MPSSE GPIO and bit-shift commands

  This implementation consumes the following hardware resources:
  - The low GPIO bank of one MPSSE interface
  - Three pins: SCL on ADBUS0, SDA on both ADBUS1 and ADBUS2

  The engine has no open-drain outputs, so SDA is released by turning ADBUS1
  into an input and read back through ADBUS2. Clock stretching is not
  supported.

  ## Hardware requirements

  1. Tie ADBUS1 and ADBUS2 together to form SDA.
  2. Add pull-up resistors to SDA and SCL if the adapter lacks them.

  ## Example

  Reading the temperature register of an MCP9808:

  ```no_run
    use mpsse_bitbang::channel::CommandChannel;
    use mpsse_bitbang::i2c::I2cMaster;
    use mpsse_bitbang::transport::{DeviceSelector, Interface, OpenTransport};

    fn read_temperature<T: OpenTransport>() -> Option<f64> {
        let selector = DeviceSelector::vendor_product(0x0403, 0x6010, Interface::A);
        let mut channel = CommandChannel::<T>::open(&selector).ok()?;
        let mut i2c = I2cMaster::new(&mut channel, I2cMaster::<T>::DEFAULT_KHZ).ok()?;

        let mut raw = [0u8; 2];
        i2c.transaction(0x18, &[0x05], &mut raw).ok()?;
        let value = (i16::from_be_bytes(raw) << 3) >> 3;
        Some(f64::from(value) / 16.0)
    }
  ```
*/

use core::ops::{Deref, DerefMut};
use std::time::Duration;

use embedded_hal::blocking::i2c::{Read, Write, WriteRead};
use log::{debug, warn};

use crate::channel::{self, CommandChannel};
use crate::mpsse::pins::{CLOCK, DATA_OUT};
use crate::mpsse::{
    bit_count, PinState, IDLE_LOW_READ_BITS, IDLE_LOW_WRITE_BITS, IDLE_LOW_WRITE_BITS_LSB,
    SEND_IMMEDIATE,
};
use crate::transport::{BitMode, Transport};

/// I2C error
#[derive(Debug, thiserror::Error)]
pub enum Error<E> {
    /// Engine or transport failure
    #[error("i2c bus I/O failed: {0}")]
    Io(channel::Error<E>),
    /// No ack received
    #[error("no acknowledge received")]
    Nack,
    /// Address does not fit in seven bits
    #[error("invalid 7-bit address {0:#04x}")]
    InvalidAddress(u8),
}

impl<E> From<channel::Error<E>> for Error<E> {
    fn from(e: channel::Error<E>) -> Self {
        Error::Io(e)
    }
}

/// Both lines driven by the engine.
const BUS_OUTPUT: u8 = CLOCK | DATA_OUT;
/// SDA released so the device can pull it, SCL still driven.
const SDA_RELEASED: PinState = PinState::new(0, CLOCK);
const SDA_DRIVEN_LOW: PinState = PinState::new(0, BUS_OUTPUT);

/// Commands queued per byte read: release, shift in, re-acquire, ack.
const READ_BYTE_COMMAND_LEN: usize = 11;

/// SCL cycles per byte on the wire, ack included.
const CYCLES_PER_BYTE: f64 = 9.0;

/// Time the bus needs to clock `bytes` bytes at `khz`.
fn bus_time(bytes: usize, khz: f64) -> Duration {
    Duration::from_secs_f64(bytes as f64 * CYCLES_PER_BYTE / (khz * 1_000.0))
}

const fn lines(scl: bool, sda: bool) -> PinState {
    let mut state = 0;
    if scl {
        state |= CLOCK;
    }
    if sda {
        state |= DATA_OUT;
    }
    PinState::new(state, BUS_OUTPUT)
}

/// I2C master on a borrowed command channel
///
/// Holding the `&mut` borrow keeps any other protocol off the channel for as
/// long as the master lives. Dropping it resets the chip's bit mode.
pub struct I2cMaster<'a, T: Transport> {
    channel: &'a mut CommandChannel<T>,
    scl_khz: f64,
}

impl<'a, T: Transport> I2cMaster<'a, T> {
    /// Typical fast-mode bus clock.
    pub const DEFAULT_KHZ: f64 = 400.0;

    /// Put the channel into MPSSE mode and idle the bus.
    ///
    /// Synchronization and pin setup always run again, so the channel may
    /// have hosted another protocol before.
    pub fn new(channel: &'a mut CommandChannel<T>, scl_khz: f64) -> Result<Self, Error<T::Error>> {
        channel.clear();
        channel.set_bit_mode(0xff, BitMode::Mpsse)?;
        // from here on drop restores the bit mode
        let mut master = I2cMaster { channel, scl_khz };
        master.channel.sync()?;
        let clock = master.channel.set_clock_frequency(scl_khz, true, false)?;
        master.scl_khz = clock.actual_khz;
        master.initialize_pins()?;
        debug!("i2c master ready at {:.2} kHz", clock.actual_khz);
        Ok(master)
    }

    /// Convert a 7-bit address and direction into the address byte.
    pub const fn addr7_to_data(addr7: u8, read: bool) -> u8 {
        (addr7 << 1) | read as u8
    }

    // Postcond: SDA & SCL high
    fn initialize_pins(&mut self) -> Result<(), Error<T::Error>> {
        self.channel.set_lower_pins(lines(true, true))?;
        Ok(())
    }

    /// Start condition.
    ///
    /// Precond: SDA & SCL high. Postcond: SDA & SCL low.
    ///
    /// ```text
    /// SDA ‾‾\____
    /// SCL ‾‾‾‾\__
    /// ```
    pub fn start(&mut self) -> Result<(), Error<T::Error>> {
        // two writes give the device its setup time
        self.channel.set_lower_pins(lines(true, false))?;
        self.channel.set_lower_pins(lines(false, false))?;
        Ok(())
    }

    /// Repeated start.
    ///
    /// Precond: SDA & SCL low. Postcond: SDA & SCL low.
    ///
    /// ```text
    /// SDA ___/‾‾‾\___
    /// SCL _____/‾‾‾\__
    /// ```
    pub fn restart(&mut self) -> Result<(), Error<T::Error>> {
        self.channel.set_lower_pins(lines(false, true))?;
        self.channel.set_lower_pins(lines(true, true))?;
        self.channel.set_lower_pins(lines(true, false))?;
        self.channel.set_lower_pins(lines(false, false))?;
        Ok(())
    }

    /// Stop condition.
    ///
    /// Precond: SDA & SCL low. Postcond: SDA & SCL high.
    ///
    /// ```text
    /// SDA ____/‾‾
    /// SCL __/‾‾‾‾
    /// ```
    pub fn stop(&mut self) -> Result<(), Error<T::Error>> {
        self.channel.set_lower_pins(lines(true, false))?;
        self.channel.set_lower_pins(lines(true, true))?;
        Ok(())
    }

    /// Clock out `byte` MSB first, then read the ack bit.
    ///
    /// Returns `true` when the device acknowledged.
    /// Precond: SDA & SCL low. Postcond: SDA & SCL low.
    pub fn write_byte(&mut self, byte: u8) -> Result<bool, Error<T::Error>> {
        let release = SDA_RELEASED.command();
        let acquire = SDA_DRIVEN_LOW.command();
        let cmds = [
            IDLE_LOW_WRITE_BITS,
            bit_count(8),
            byte,
            // the write holds data for a third of a cycle past the edge,
            // so SDA can be released right away
            release[0],
            release[1],
            release[2],
            IDLE_LOW_READ_BITS,
            bit_count(1),
            // have the ack bit sent back now rather than on the latency timer
            SEND_IMMEDIATE,
            acquire[0],
            acquire[1],
            acquire[2],
        ];

        self.channel.buffer_bytes(&cmds)?;
        self.channel.flush()?;

        let mut ack_bit = [0u8; 1];
        self.channel.read(&mut ack_bit)?;

        // low is ACK
        Ok(ack_bit[0] & 0x01 == 0)
    }

    /// Clock in `input.len()` bytes, acking all but the last.
    ///
    /// Each round waits for the read timeout plus the time the bus needs to
    /// clock its bytes, so slow clocks do not time out on long reads.
    /// Precond: SDA & SCL low. Postcond: SDA & SCL low.
    pub fn read_bytes(&mut self, input: &mut [u8]) -> Result<(), Error<T::Error>> {
        let per_flush = (channel::CommandBuffer::CAPACITY - 1) / READ_BYTE_COMMAND_LEN;
        let total = input.len();

        let mut offset = 0;
        for chunk in input.chunks_mut(per_flush) {
            for i in 0..chunk.len() {
                let last = offset + i == total - 1;
                self.queue_read_byte(last)?;
            }
            self.channel.buffer_byte(SEND_IMMEDIATE)?;
            self.channel.flush()?;
            let timeout =
                self.channel.timing().read_timeout + bus_time(chunk.len(), self.scl_khz);
            self.channel.read_within(chunk, timeout)?;
            offset += chunk.len();
        }
        Ok(())
    }

    fn queue_read_byte(&mut self, last: bool) -> Result<(), Error<T::Error>> {
        let release = SDA_RELEASED.command();
        let acquire = SDA_DRIVEN_LOW.command();
        let cmds: [u8; READ_BYTE_COMMAND_LEN] = [
            release[0],
            release[1],
            release[2],
            IDLE_LOW_READ_BITS,
            bit_count(8),
            acquire[0],
            acquire[1],
            acquire[2],
            // taken from the LSB, high is NACK
            IDLE_LOW_WRITE_BITS_LSB,
            bit_count(1),
            last as u8,
        ];
        self.channel.buffer_bytes(&cmds)?;
        Ok(())
    }

    /// Run one complete transfer with `addr7`.
    ///
    /// - `output` empty: Start, read address, read `input`, Stop
    /// - `input` empty: Start, write address, write `output`, Stop
    /// - both: Start, write address, write `output`, Restart, read address,
    ///   read `input`, Stop
    ///
    /// Stop is issued however the transfer ends.
    /// Precond: SDA & SCL high. Postcond: SDA & SCL high.
    pub fn transaction(
        &mut self,
        addr7: u8,
        output: &[u8],
        input: &mut [u8],
    ) -> Result<(), Error<T::Error>> {
        if addr7 > 0x7f {
            return Err(Error::InvalidAddress(addr7));
        }

        let mut bus = StopOnExit::new(self);
        bus.start()?;

        if !output.is_empty() {
            // SAD + W
            bus.expect_ack(Self::addr7_to_data(addr7, false))?;
            for &byte in output {
                bus.expect_ack(byte)?;
            }
            if input.is_empty() {
                return bus.finish();
            }
            // SR
            bus.restart()?;
        }

        // SAD + R
        bus.expect_ack(Self::addr7_to_data(addr7, true))?;
        bus.read_bytes(input)?;

        bus.finish()
    }

    /// Check whether a device answers at `addr7`.
    pub fn probe(&mut self, addr7: u8) -> Result<bool, Error<T::Error>> {
        match self.transaction(addr7, &[], &mut []) {
            Ok(()) => Ok(true),
            Err(Error::Nack) => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[inline]
    fn expect_ack(&mut self, byte: u8) -> Result<(), Error<T::Error>> {
        if self.write_byte(byte)? {
            Ok(())
        } else {
            Err(Error::Nack)
        }
    }
}

impl<'a, T: Transport> Drop for I2cMaster<'a, T> {
    fn drop(&mut self) {
        if self.channel.set_bit_mode(0xff, BitMode::Reset).is_err() {
            warn!("failed to reset bit mode after i2c use");
        }
    }
}

/// Issues Stop when dropped unless [`StopOnExit::finish`] already did.
struct StopOnExit<'m, 'a, T: Transport> {
    master: &'m mut I2cMaster<'a, T>,
    armed: bool,
}

impl<'m, 'a, T: Transport> StopOnExit<'m, 'a, T> {
    fn new(master: &'m mut I2cMaster<'a, T>) -> Self {
        StopOnExit {
            master,
            armed: true,
        }
    }

    /// Stop now and report its outcome.
    fn finish(mut self) -> Result<(), Error<T::Error>> {
        self.armed = false;
        self.master.stop()
    }
}

impl<'m, 'a, T: Transport> Deref for StopOnExit<'m, 'a, T> {
    type Target = I2cMaster<'a, T>;

    fn deref(&self) -> &Self::Target {
        self.master
    }
}

impl<'m, 'a, T: Transport> DerefMut for StopOnExit<'m, 'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.master
    }
}

impl<'m, 'a, T: Transport> Drop for StopOnExit<'m, 'a, T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // the aborted command must not go out again ahead of Stop
        self.master.channel.clear();
        if self.master.stop().is_err() {
            warn!("failed to issue stop after aborted i2c transaction");
        }
    }
}

impl<'a, T: Transport> Write for I2cMaster<'a, T> {
    type Error = Error<T::Error>;

    fn write(&mut self, addr: u8, output: &[u8]) -> Result<(), Self::Error> {
        if output.is_empty() {
            return Ok(());
        }
        self.transaction(addr, output, &mut [])
    }
}

impl<'a, T: Transport> Read for I2cMaster<'a, T> {
    type Error = Error<T::Error>;

    fn read(&mut self, addr: u8, input: &mut [u8]) -> Result<(), Self::Error> {
        self.transaction(addr, &[], input)
    }
}

impl<'a, T: Transport> WriteRead for I2cMaster<'a, T> {
    type Error = Error<T::Error>;

    fn write_read(&mut self, addr: u8, output: &[u8], input: &mut [u8]) -> Result<(), Self::Error> {
        self.transaction(addr, output, input)
    }
}
