// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Mailbox message format.
//!
//! A message is [`MSG_WORDS`] 32-bit words: one header word followed by up
//! to [`MAX_PAYLOAD`] payload words.
//!
//! | bits   | header field       |
//! |--------|--------------------|
//! | 0..8   | message type       |
//! | 8..16  | sequence number    |
//! | 16..20 | payload word count |
//! | 28     | response           |
//! | 29     | clear to send      |
//! | 30     | NACK               |
//! | 31     | ACK                |

use bit_field::BitField;
use bitflags::bitflags;
use nic_base::{NicError, NicResult, RegisterIo};
use strum::{FromRepr, IntoStaticStr};

pub const MSG_WORDS: usize = 16;
pub const MAX_PAYLOAD: usize = MSG_WORDS - 1;

/// First message API: reset, filters and MTU.
pub const API_V1: u32 = 1;
/// Adds the queue-count query.
pub const API_V2: u32 = 2;
/// Highest API version this side speaks.
pub const MAX_API: u32 = API_V2;

bitflags! {
    /// Features offered in a capability reply.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Caps: u32 {
        const MULTICAST = 1 << 0;
        const VLAN = 1 << 1;
        const MTU = 1 << 2;
        const QUEUES = 1 << 3;
    }
}

/// Message types. Everything below `PfControl` is a virtual function
/// request; `PfControl` travels the other way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum MsgType {
    Reset = 0x01,
    AddAddr = 0x02,
    RemoveAddr = 0x03,
    AddMulticast = 0x04,
    RemoveMulticast = 0x05,
    AddVlan = 0x06,
    RemoveVlan = 0x07,
    GetMtu = 0x08,
    SetMtu = 0x09,
    QueryCaps = 0x0a,
    QueryQueues = 0x0b,
    /// The physical function is about to reset the virtual function.
    PfControl = 0x10,
}

bitflags! {
    /// Header flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MsgFlags: u32 {
        const RESPONSE = 1 << 28;
        const CTS = 1 << 29;
        const NACK = 1 << 30;
        const ACK = 1 << 31;
    }
}

/// Decoded header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsgHeader {
    pub kind: u8,
    pub seq: u8,
    pub len: usize,
    pub flags: MsgFlags,
}

impl MsgHeader {
    pub fn encode(&self) -> u32 {
        let mut raw = self.flags.bits();
        raw.set_bits(0..8, self.kind as u32);
        raw.set_bits(8..16, self.seq as u32);
        raw.set_bits(16..20, (self.len & 0xf) as u32);
        raw
    }

    pub fn decode(raw: u32) -> Self {
        Self {
            kind: raw.get_bits(0..8) as u8,
            seq: raw.get_bits(8..16) as u8,
            len: raw.get_bits(16..20) as usize,
            flags: MsgFlags::from_bits_truncate(raw),
        }
    }

    pub fn msg_type(&self) -> Option<MsgType> {
        MsgType::from_repr(self.kind)
    }

    pub fn is_response(&self) -> bool {
        self.flags.contains(MsgFlags::RESPONSE)
    }

    pub fn is_nack(&self) -> bool {
        self.flags.contains(MsgFlags::NACK)
    }
}

/// One mailbox message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MboxMsg {
    words: [u32; MSG_WORDS],
}

impl MboxMsg {
    /// A request of type `kind` carrying `payload`.
    pub fn request(kind: MsgType, payload: &[u32]) -> NicResult<Self> {
        let header = MsgHeader {
            kind: kind as u8,
            len: payload.len(),
            ..MsgHeader::default()
        };
        Self::build(header, payload)
    }

    fn build(header: MsgHeader, payload: &[u32]) -> NicResult<Self> {
        if payload.len() > MAX_PAYLOAD {
            return Err(NicError::InvalidInput);
        }
        let mut words = [0; MSG_WORDS];
        words[0] = header.encode();
        words[1..=payload.len()].copy_from_slice(payload);
        Ok(Self { words })
    }

    /// A positive reply to this message.
    pub fn ack(&self, payload: &[u32], extra: MsgFlags) -> NicResult<Self> {
        let req = self.header();
        let header = MsgHeader {
            kind: req.kind,
            seq: req.seq,
            len: payload.len(),
            flags: MsgFlags::RESPONSE | MsgFlags::ACK | extra,
        };
        Self::build(header, payload)
    }

    /// A negative reply to this message carrying the code of `err`.
    pub fn nack(&self, err: NicError) -> Self {
        let req = self.header();
        let mut words = [0; MSG_WORDS];
        words[0] = MsgHeader {
            kind: req.kind,
            seq: req.seq,
            len: 1,
            flags: MsgFlags::RESPONSE | MsgFlags::NACK,
        }
        .encode();
        words[1] = err.to_code();
        Self { words }
    }

    pub fn from_words(words: [u32; MSG_WORDS]) -> Self {
        Self { words }
    }

    pub fn words(&self) -> &[u32; MSG_WORDS] {
        &self.words
    }

    pub fn header(&self) -> MsgHeader {
        MsgHeader::decode(self.words[0])
    }

    pub(crate) fn set_seq(&mut self, seq: u8) {
        let mut header = self.header();
        header.seq = seq;
        self.words[0] = header.encode();
    }

    /// Payload words as announced by the header.
    pub fn payload(&self) -> &[u32] {
        let len = self.header().len.min(MAX_PAYLOAD);
        &self.words[1..=len]
    }

    /// Reads a message from the register window at `base`.
    pub fn read_from(io: &(impl RegisterIo + ?Sized), base: usize) -> Self {
        let mut words = [0; MSG_WORDS];
        for (i, w) in words.iter_mut().enumerate() {
            *w = io.read32(base + i * 4);
        }
        Self { words }
    }

    /// Writes the message into the register window at `base`, header last.
    pub fn write_to(&self, io: &(impl RegisterIo + ?Sized), base: usize) {
        for (i, w) in self.words.iter().enumerate().skip(1) {
            io.write32(base + i * 4, *w);
        }
        io.write32(base, self.words[0]);
    }
}
