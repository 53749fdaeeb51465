// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Common interfaces for multi-channel NIC drivers.
//!
//! This crate is shared by the descriptor-ring engine crates:
//!
//! - [`NicError`] / [`NicResult`]: the error taxonomy every fallible NIC
//!   operation reports with.
//! - [`RegisterIo`] / [`DmaHal`]: the hardware seams. Drivers never touch
//!   MMIO or allocate DMA memory except through these traits.
//! - [`DmaRegion`] / [`DmaMapping`]: scoped ownership of coherent DMA memory
//!   and streaming mappings, released on drop.
//! - [`MacAddress`]: the hardware address type.
//!
//! With the `mock` feature, [`mock::MockPlatform`] provides a register file
//! and a heap-backed DMA allocator for host-side tests.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod dma;
mod hal;
#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use self::{
    dma::{DmaMapping, DmaRegion},
    hal::{DmaDirection, DmaHal, NicHal, PhysAddr, RegisterIo},
};

/// The error type for NIC operation failures.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum NicError {
    /// No descriptor slot or control block is free; retry later.
    WouldBlock,
    /// Not enough memory for DMA or receive buffers.
    NoMemory,
    /// Invalid parameter, packet or message.
    InvalidInput,
    /// The object is not in a state that allows the operation.
    BadState,
    /// A channel-local hardware fault was detected.
    ChannelFault,
    /// A device-global hardware fault was detected.
    DeviceFault,
    /// A filter table or message slot has no room left.
    NoSpace,
    /// The entry to remove does not exist.
    NotFound,
    /// A bounded wait ran out of retries.
    Timeout,
    /// The remote endpoint rejected the request.
    Nack,
    /// The resource is busy (slot full or a transaction already pending).
    ResourceBusy,
    /// This operation is unsupported or unimplemented.
    Unsupported,
}

impl NicError {
    /// Stable error message for display/logging.
    pub const fn message(&self) -> &'static str {
        match self {
            NicError::WouldBlock => "Try again",
            NicError::NoMemory => "Not enough memory",
            NicError::InvalidInput => "Invalid parameter",
            NicError::BadState => "Bad state",
            NicError::ChannelFault => "Channel fault",
            NicError::DeviceFault => "Device fault",
            NicError::NoSpace => "No space left",
            NicError::NotFound => "Entry not found",
            NicError::Timeout => "Transaction timed out",
            NicError::Nack => "Request rejected",
            NicError::ResourceBusy => "Resource is busy",
            NicError::Unsupported => "Unsupported operation",
        }
    }

    /// Wire code carried in a negative mailbox reply.
    pub const fn to_code(self) -> u32 {
        match self {
            NicError::WouldBlock => 1,
            NicError::NoMemory => 2,
            NicError::InvalidInput => 3,
            NicError::BadState => 4,
            NicError::ChannelFault => 5,
            NicError::DeviceFault => 6,
            NicError::NoSpace => 7,
            NicError::NotFound => 8,
            NicError::Timeout => 9,
            NicError::Nack => 10,
            NicError::ResourceBusy => 11,
            NicError::Unsupported => 12,
        }
    }

    /// Decodes a wire code. Unknown codes decode as [`NicError::Nack`].
    pub const fn from_code(code: u32) -> Self {
        match code {
            1 => NicError::WouldBlock,
            2 => NicError::NoMemory,
            3 => NicError::InvalidInput,
            4 => NicError::BadState,
            5 => NicError::ChannelFault,
            6 => NicError::DeviceFault,
            7 => NicError::NoSpace,
            8 => NicError::NotFound,
            9 => NicError::Timeout,
            11 => NicError::ResourceBusy,
            12 => NicError::Unsupported,
            _ => NicError::Nack,
        }
    }
}

impl core::fmt::Display for NicError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.message())
    }
}

/// A specialized `Result` type for NIC operations.
pub type NicResult<T = ()> = Result<T, NicError>;

/// The hardware (MAC) address of a NIC or of one of its functions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// The all-zero address.
    pub const ZERO: Self = Self([0; 6]);

    /// Whether the group bit is set.
    pub const fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    /// Whether this is a usable station address.
    pub fn is_unicast(&self) -> bool {
        !self.is_multicast() && *self != Self::ZERO
    }

    /// Packs the address into two little-endian words, as carried in mailbox
    /// payloads.
    pub const fn to_words(self) -> [u32; 2] {
        let b = self.0;
        [
            u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            u16::from_le_bytes([b[4], b[5]]) as u32,
        ]
    }

    /// Inverse of [`MacAddress::to_words`]; the upper half of the second word
    /// is ignored.
    pub const fn from_words(words: [u32; 2]) -> Self {
        let lo = words[0].to_le_bytes();
        let hi = words[1].to_le_bytes();
        Self([lo[0], lo[1], lo[2], lo[3], hi[0], hi[1]])
    }
}

impl core::fmt::Display for MacAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// Common operations that every NIC driver instance implements.
pub trait DriverOps: Send + Sync {
    /// The name of the device.
    fn name(&self) -> &str;

    /// The IRQ number of the device, if applicable.
    fn irq(&self) -> Option<usize> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_survive_the_wire() {
        for err in [
            NicError::NoSpace,
            NicError::NotFound,
            NicError::InvalidInput,
            NicError::Timeout,
        ] {
            assert_eq!(NicError::from_code(err.to_code()), err);
        }
        assert_eq!(NicError::from_code(0xdead), NicError::Nack);
    }

    #[test]
    fn mac_address_words() {
        let mac = MacAddress([0x02, 0x11, 0x22, 0x33, 0x44, 0x55]);
        assert_eq!(MacAddress::from_words(mac.to_words()), mac);
        assert!(mac.is_unicast());
        assert!(MacAddress([0x01, 0, 0x5e, 0, 0, 1]).is_multicast());
        assert!(!MacAddress::ZERO.is_unicast());
    }

    #[test]
    fn display() {
        let mac = MacAddress([0x02, 0, 0, 0, 0, 0x0a]);
        assert_eq!(std::format!("{mac}"), "02:00:00:00:00:0a");
        assert_eq!(std::format!("{}", NicError::Timeout), "Transaction timed out");
    }
}
