//! Engine opcodes and the GPIO pin map.
//!
//! Values follow the FTDI MPSSE command reference (AN_108).

/// Flags a clocked shift command is composed from.
pub mod flags {
    /// Change output data on the falling clock edge
    pub const WRITE_NEG: u8 = 0x01;
    /// Length counts bits instead of bytes
    pub const BITMODE: u8 = 0x02;
    /// Sample input data on the falling clock edge
    pub const READ_NEG: u8 = 0x04;
    /// Shift least significant bit first
    pub const LSB: u8 = 0x08;
    pub const DO_WRITE: u8 = 0x10;
    pub const DO_READ: u8 = 0x20;
}

use self::flags::*;

pub const SET_BITS_LOW: u8 = 0x80;
pub const TCK_DIVISOR: u8 = 0x86;
/// Push buffered replies to the host right away
pub const SEND_IMMEDIATE: u8 = 0x87;
pub const DIS_DIV_5: u8 = 0x8a;
pub const EN_3_PHASE: u8 = 0x8c;
pub const DIS_3_PHASE: u8 = 0x8d;
pub const EN_ADAPTIVE: u8 = 0x96;
pub const DIS_ADAPTIVE: u8 = 0x97;

/// Prefix the engine puts in front of an echoed unknown opcode.
pub const BAD_COMMAND: u8 = 0xfa;

// Clock edge limitation: with the clock idling low the engine only behaves when
// output changes on the falling edge and input is sampled on the rising edge.
// Idling high needs the opposite pair.
//
//                         2-phase-clk      3-phase-clk
// clk-idle-low            __/‾‾\__/‾‾\    __/‾‾\_____/‾‾\__
// data-write-neg          <=1=> <=2=>     <=1====> <=2====>
//
// clk-idle-high           ‾‾\__/‾‾\__/    ‾‾\__/‾‾‾‾‾\__/‾‾
// data-write-pos          <=1=> <=2=>     <=1====> <=2====>

/// Shift bytes out MSB first, clock idling low.
pub const IDLE_LOW_WRITE_BYTES: u8 = DO_WRITE | WRITE_NEG;
/// Shift bits out MSB first, clock idling low.
pub const IDLE_LOW_WRITE_BITS: u8 = DO_WRITE | WRITE_NEG | BITMODE;
/// Shift bits out LSB first, clock idling low.
pub const IDLE_LOW_WRITE_BITS_LSB: u8 = DO_WRITE | WRITE_NEG | BITMODE | LSB;
/// Shift bits in MSB first, clock idling low.
pub const IDLE_LOW_READ_BITS: u8 = DO_READ | BITMODE;

/// Longest payload one byte-shift command can carry.
pub const MAX_SHIFT_BYTES: usize = 0x1_0000;

/// Length field of a bit-shift command, 1..=8 bits.
#[inline]
pub fn bit_count(bits: u8) -> u8 {
    debug_assert!((1..=8).contains(&bits));
    bits - 1
}

/// Little-endian length field of a byte-shift command, 1..=65536 bytes.
#[inline]
pub fn byte_count(bytes: usize) -> [u8; 2] {
    debug_assert!((1..=MAX_SHIFT_BYTES).contains(&bytes));
    let n = (bytes - 1) as u16;
    n.to_le_bytes()
}

/// Pin map of the lower GPIO bank.
pub mod pins {
    /// Clock output, also the I2C SCL line
    pub const CLOCK: u8 = 1 << 0;
    /// Data output, I2C SDA drive and LED data
    pub const DATA_OUT: u8 = 1 << 1;
    /// Data input, I2C SDA sense
    pub const DATA_IN: u8 = 1 << 2;
}

/// Level and direction masks for one GPIO bank.
///
/// A 1 in `direction` makes the pin an output, a 1 in `state` drives it high.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PinState {
    pub state: u8,
    pub direction: u8,
}

impl PinState {
    pub const fn new(state: u8, direction: u8) -> Self {
        PinState { state, direction }
    }

    /// The 3-byte "set low GPIO bank" command.
    pub fn command(self) -> [u8; 3] {
        [SET_BITS_LOW, self.state, self.direction]
    }
}
