//! Software-defined bus masters on the FTDI [MPSSE] command engine.
//!
//! Instead of a fixed hardware UART/SPI/I2C block, each protocol here is
//! assembled from raw GPIO and bit-shift commands sent through a
//! [`CommandChannel`](channel::CommandChannel):
//!
//! - [`i2c::I2cMaster`], an I2C master that also implements the
//!   [`embedded-hal`] blocking I2C traits
//! - [`ws2812::LedBitstreamEncoder`], a WS2812b transmitter that implements
//!   `SmartLedsWrite`
//!
//! The USB driver itself stays outside the crate, behind the
//! [`Transport`](transport::Transport) trait.
//!
//! [MPSSE]: https://www.ftdichip.com/Support/Documents/AppNotes/AN_135_MPSSE_Basics.pdf
//! [`embedded-hal`]: https://github.com/rust-embedded/embedded-hal

pub mod channel;
pub mod i2c;
pub mod mpsse;
pub mod transport;
pub mod ws2812;

#[cfg(test)]
mod mock;
