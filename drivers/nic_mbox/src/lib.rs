// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Mailbox protocol between a physical function and its virtual functions.
//!
//! - [`msg`]: the 16-word message format.
//! - [`Mailbox`]: one endpoint's post/acknowledge state machine and its
//!   inbound window.
//! - [`AdapterShared`]: filter tables, enable bits and the per-endpoint
//!   single-flight gate, behind one adapter-wide lock.
//! - [`PfMailbox`]: the physical function's handler table.
//! - [`VfClient`]: the virtual function's request surface and its answers
//!   to physical function notices.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod endpoint;
pub mod msg;
mod pf;
pub mod regs;
mod shared;
#[cfg(any(test, feature = "mock"))]
pub mod sim;
mod vf;

pub use self::{
    endpoint::{Mailbox, MboxConfig, MboxState, PostOutcome},
    msg::{Caps, MboxMsg, MsgFlags, MsgHeader, MsgType},
    pf::{PfMailbox, caps_for},
    regs::MboxEvents,
    shared::{
        AdapterShared, DEFAULT_MTU, EndpointSetup, FilterLimits, FilterTable, QueueAssignment,
        Transaction, VLAN_MAX,
    },
    vf::{MtuInfo, VfClient},
};

/// Runs mailbox processing outside interrupt context.
pub trait DeferredWork: Send + Sync {
    /// Arranges for inbound processing to run for `endpoint`:
    /// [`PfMailbox::process_inbound`], or [`VfClient::process_inbound`] for
    /// endpoint 0 of a virtual function.
    fn schedule(&self, endpoint: usize);
}
