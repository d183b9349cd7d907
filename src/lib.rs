//! PROFIBUS-DP class 1 master communication stack.
//!
//! The stack is split into the layers of the PROFIBUS specification:
//!
//! - [`phy`]: Physical layer drivers and the transmit queue with its
//!   bus-allocation timing.
//! - [`fdl`]: Layer 2, the fieldbus data link.  Telegram codec and the
//!   transceiver which handles the frame count bit (FCB) discipline.
//! - [`dp`]: Layer 7, the DP application layer.  Service telegrams, the
//!   per-slave state machine, and the [`dp::DpMaster`] driving cyclic
//!   data exchange.
//!
//! Slave stations are described by GSD files which are handled by the
//! `gsd-parser` crate that is part of this project.

pub mod consts;
pub mod dp;
pub mod fdl;
pub mod phy;
pub mod time;

#[cfg(test)]
mod test_utils;

/// Baudrate for fieldbus communication.
///
/// All stations on a PROFIBUS-DP network must be configured for the same
/// baudrate.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum Baudrate {
    /// 9.6 kbit/s
    B9600,
    /// 19.2 kbit/s
    B19200,
    /// 45.45 kbit/s
    B45450,
    /// 93.75 kbit/s
    B93750,
    /// 187.5 kbit/s
    B187500,
    /// 500 kbit/s
    B500000,
    /// 1.5 Mbit/s
    B1500000,
    /// 3 Mbit/s
    B3000000,
    /// 6 Mbit/s
    B6000000,
    /// 12 Mbit/s
    B12000000,
}

impl Baudrate {
    /// Convert baudrate into its numeric value in bit/s.
    pub fn to_rate(self) -> u64 {
        match self {
            Baudrate::B9600 => 9600,
            Baudrate::B19200 => 19200,
            Baudrate::B45450 => 45450,
            Baudrate::B93750 => 93750,
            Baudrate::B187500 => 187500,
            Baudrate::B500000 => 500000,
            Baudrate::B1500000 => 1500000,
            Baudrate::B3000000 => 3000000,
            Baudrate::B6000000 => 6000000,
            Baudrate::B12000000 => 12000000,
        }
    }

    /// Construct a baudrate from its numeric value in bit/s.
    pub fn from_rate(rate: u64) -> Option<Baudrate> {
        match rate {
            9600 => Some(Baudrate::B9600),
            19200 => Some(Baudrate::B19200),
            45450 => Some(Baudrate::B45450),
            93750 => Some(Baudrate::B93750),
            187500 => Some(Baudrate::B187500),
            500000 => Some(Baudrate::B500000),
            1500000 => Some(Baudrate::B1500000),
            3000000 => Some(Baudrate::B3000000),
            6000000 => Some(Baudrate::B6000000),
            12000000 => Some(Baudrate::B12000000),
            _ => None,
        }
    }

    /// At this baudrate, return how long a given number of bits take to transmit.
    pub fn bits_to_time(self, bits: u32) -> crate::time::Duration {
        crate::time::Duration::from_micros(u64::from(bits) * 1000000 / self.to_rate())
    }

    /// At this baudrate, return how long a given number of octets take to transmit.
    ///
    /// One octet on the wire is an 11 bit UART frame (1 start bit, 8 data
    /// bits, even parity, 1 stop bit).
    pub fn octets_to_time(self, octets: u32) -> crate::time::Duration {
        self.bits_to_time(octets * 11)
    }
}
