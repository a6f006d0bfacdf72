//! WS2812b transmitter on the MPSSE data-out pin.
//!
//! The engine clocks data out of ADBUS1 at a fixed 2.5 MHz, so one transmitted
//! bit lasts 0.4 µs. Every LED bit becomes three line bits:
//!
//! ```text
//! 0 -> 100   0.4 µs high, 0.8 µs low
//! 1 -> 110   0.8 µs high, 0.4 µs low
//! ```
//!
//! Both fall inside the LED's tolerance window. Colors go out green, red,
//! blue, MSB first, followed by a single 0 bit. The line then idles low, which
//! latches the frame once no command is sent for 50 µs.

use log::{debug, warn};
use smart_leds_trait::{SmartLedsWrite, RGB8};

use crate::channel::{self, CommandBuffer, CommandChannel};
use crate::mpsse::pins::{CLOCK, DATA_OUT};
use crate::mpsse::{
    byte_count, PinState, IDLE_LOW_WRITE_BITS, IDLE_LOW_WRITE_BYTES, MAX_SHIFT_BYTES,
};
use crate::transport::{BitMode, Transport};

/// Line bit rate in kHz.
pub const BIT_RATE_KHZ: f64 = 2_500.0;

/// Encoded size of one LED.
pub const BYTES_PER_LED: usize = 9;

const ZERO: u128 = 0b100;
const ONE: u128 = 0b110;

/// Header of a byte-shift command.
const HEADER_LEN: usize = 3;

/// Shift out one bit, a 0.
const TERMINATOR: [u8; 3] = [IDLE_LOW_WRITE_BITS, 0, 0x00];

/// LED transmitter error
#[derive(Debug, thiserror::Error)]
pub enum Error<E> {
    /// Engine or transport failure
    #[error("led stream I/O failed: {0}")]
    Io(channel::Error<E>),
}

impl<E> From<channel::Error<E>> for Error<E> {
    fn from(e: channel::Error<E>) -> Self {
        Error::Io(e)
    }
}

/// Expand one `0x__RRGGBB` value into its 72 line bits.
///
/// The top byte is ignored.
pub fn encode_color(rgb: u32) -> [u8; BYTES_PER_LED] {
    let [_, r, g, b] = rgb.to_be_bytes();
    let grb = u32::from_be_bytes([0, g, r, b]);

    let mut bits: u128 = 0;
    for i in (0..24).rev() {
        let symbol = if (grb >> i) & 1 == 1 { ONE } else { ZERO };
        bits = (bits << 3) | symbol;
    }

    let wide = bits.to_be_bytes();
    let mut out = [0u8; BYTES_PER_LED];
    out.copy_from_slice(&wide[wide.len() - BYTES_PER_LED..]);
    out
}

/// Expand a whole frame, without the terminating bit.
pub fn encode_frame(colors: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(colors.len() * BYTES_PER_LED);
    for &color in colors {
        out.extend_from_slice(&encode_color(color));
    }
    out
}

/// WS2812b transmitter on a borrowed command channel
///
/// Dropping it resets the chip's bit mode.
pub struct LedBitstreamEncoder<'a, T: Transport> {
    channel: &'a mut CommandChannel<T>,
}

impl<'a, T: Transport> LedBitstreamEncoder<'a, T> {
    /// Put the channel into MPSSE mode at the LED bit rate and hold the
    /// data line low.
    pub fn new(channel: &'a mut CommandChannel<T>) -> Result<Self, Error<T::Error>> {
        channel.clear();
        channel.set_bit_mode(0xff, BitMode::Mpsse)?;
        let mut encoder = LedBitstreamEncoder { channel };
        encoder.channel.sync()?;
        let clock = encoder
            .channel
            .set_clock_frequency(BIT_RATE_KHZ, false, false)?;
        encoder
            .channel
            .set_lower_pins(PinState::new(0, CLOCK | DATA_OUT))?;
        debug!("led stream ready at {:.2} kHz", clock.actual_khz);
        Ok(encoder)
    }

    /// Send one frame of `0x__RRGGBB` colors.
    ///
    /// Frames larger than the command buffer go out in several writes. A
    /// frame that fails is dropped whole, nothing of it is sent later.
    pub fn send_frame(&mut self, colors: &[u32]) -> Result<(), Error<T::Error>> {
        let result = self.write_frame(&encode_frame(colors));
        if result.is_err() {
            self.channel.clear();
        }
        result
    }

    fn write_frame(&mut self, payload: &[u8]) -> Result<(), Error<T::Error>> {
        let max_chunk = (CommandBuffer::CAPACITY - HEADER_LEN).min(MAX_SHIFT_BYTES);

        for chunk in payload.chunks(max_chunk) {
            if self.channel.remaining() < HEADER_LEN + chunk.len() {
                self.channel.flush()?;
            }
            let [lo, hi] = byte_count(chunk.len());
            self.channel.buffer_bytes(&[IDLE_LOW_WRITE_BYTES, lo, hi])?;
            self.channel.buffer_bytes(chunk)?;
        }

        if self.channel.remaining() < TERMINATOR.len() {
            self.channel.flush()?;
        }
        self.channel.buffer_bytes(&TERMINATOR)?;
        self.channel.flush()?;
        Ok(())
    }
}

impl<'a, T: Transport> Drop for LedBitstreamEncoder<'a, T> {
    fn drop(&mut self) {
        if self.channel.set_bit_mode(0xff, BitMode::Reset).is_err() {
            warn!("failed to reset bit mode after led use");
        }
    }
}

impl<'a, T: Transport> SmartLedsWrite for LedBitstreamEncoder<'a, T> {
    type Error = Error<T::Error>;
    type Color = RGB8;

    fn write<I, C>(&mut self, iterator: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = C>,
        C: Into<Self::Color>,
    {
        let colors: Vec<u32> = iterator
            .into_iter()
            .map(|c| {
                let RGB8 { r, g, b } = c.into();
                u32::from_be_bytes([0, r, g, b])
            })
            .collect();
        self.send_frame(&colors)
    }
}
