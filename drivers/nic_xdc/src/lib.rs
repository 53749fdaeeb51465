// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! DMA channel engines of a multi-channel Ethernet adapter.
//!
//! Each [`TxChannel`] and [`RxChannel`] owns its rings, buffers and
//! counters, and carries a [`FaultMonitor`] that decodes the channel status
//! word and drives recovery. Channels only touch their own registers.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod fault;
mod generation;
pub mod regs;
mod rx;
mod stats;
mod tx;

#[cfg(any(test, feature = "mock"))]
pub mod sim;

pub use self::{
    fault::{
        AdapterReset, ChannelId, ChannelOps, ChannelState, Decoded, Direction, FaultHooks, FaultKind,
        FaultMonitor, FaultScope, FaultSet, HealthMonitor,
    },
    generation::{ChannelCaps, Gen1, Gen2, Generation},
    rx::{Deliver, RxChannel, RxConfig, RxPacket, RxPoll, RxSegment},
    stats::{RxSnapshot, RxStats, TxSnapshot, TxStats},
    tx::{FlowControl, SendOutcome, TxChannel, TxConfig, TxPacket},
};
