//! The seam between the command engine and the USB chip driver.
//!
//! Enumeration and the USB protocol itself live in the driver; this crate only
//! needs raw byte writes, a non-blocking read and bit-mode switching.

/// Operating mode of the chip's pins.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BitMode {
    /// Neutral mode, pins return to their power-on function
    Reset,
    /// Multi-protocol synchronous serial engine
    Mpsse,
}

impl BitMode {
    /// Raw mode value understood by the chip.
    pub fn bits(self) -> u8 {
        match self {
            BitMode::Reset => 0x00,
            BitMode::Mpsse => 0x02,
        }
    }
}

/// Interface (channel) of a multi-interface chip.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Interface {
    Any,
    A,
    B,
    C,
    D,
}

impl Default for Interface {
    fn default() -> Self {
        Interface::Any
    }
}

/// How to find the device to open.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DeviceSelector {
    VendorProduct {
        vendor: u16,
        product: u16,
        interface: Interface,
    },
    /// USB device number on a bus, not to be confused with the port path
    BusAddress {
        bus: u8,
        device: u8,
        interface: Interface,
    },
}

impl DeviceSelector {
    pub fn vendor_product(vendor: u16, product: u16, interface: Interface) -> Self {
        DeviceSelector::VendorProduct {
            vendor,
            product,
            interface,
        }
    }

    pub fn bus_address(bus: u8, device: u8, interface: Interface) -> Self {
        DeviceSelector::BusAddress {
            bus,
            device,
            interface,
        }
    }

    pub fn interface(&self) -> Interface {
        match *self {
            DeviceSelector::VendorProduct { interface, .. } => interface,
            DeviceSelector::BusAddress { interface, .. } => interface,
        }
    }
}

/// Raw byte pipe to the engine.
pub trait Transport {
    type Error;

    /// Write `data` in one call, returning how many bytes were accepted.
    fn write(&mut self, data: &[u8]) -> Result<usize, Self::Error>;

    /// Read whatever is ready into `buf`.
    ///
    /// Returns `nb::Error::WouldBlock` when nothing is available yet.
    fn read(&mut self, buf: &mut [u8]) -> nb::Result<usize, Self::Error>;

    /// Switch the pins selected by `mask` into `mode`.
    fn set_bit_mode(&mut self, mask: u8, mode: BitMode) -> Result<(), Self::Error>;
}

/// A transport that knows how to open itself.
pub trait OpenTransport: Transport + Sized {
    fn open(selector: &DeviceSelector) -> Result<Self, Self::Error>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    type Error = T::Error;

    fn write(&mut self, data: &[u8]) -> Result<usize, Self::Error> {
        (**self).write(data)
    }

    fn read(&mut self, buf: &mut [u8]) -> nb::Result<usize, Self::Error> {
        (**self).read(buf)
    }

    fn set_bit_mode(&mut self, mask: u8, mode: BitMode) -> Result<(), Self::Error> {
        (**self).set_bit_mode(mask, mode)
    }
}
