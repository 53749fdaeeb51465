// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Software model of the remote side of one mailbox register block.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};

use nic_base::mock::MockPlatform;
use spin::Mutex;

use crate::{
    msg::{MSG_WORDS, MboxMsg},
    regs::{self, MbxCtrl, MbxStatus},
};

type Responder = Box<dyn Fn(MboxMsg) -> Option<MboxMsg> + Send + Sync>;

fn load(dev: &MockPlatform, window: usize) -> MboxMsg {
    let mut words = [0; MSG_WORDS];
    for (i, w) in words.iter_mut().enumerate() {
        *w = dev.reg(window + i * 4) as u32;
    }
    MboxMsg::from_words(words)
}

fn store(dev: &MockPlatform, window: usize, msg: &MboxMsg) {
    for (i, w) in msg.words().iter().enumerate() {
        dev.set_reg(window + i * 4, *w as u64);
    }
}

/// The peer behind a mailbox endpoint.
///
/// A posted message is answered synchronously by the responder, if one is
/// installed; otherwise the outbound window stays full until cancelled.
pub struct Peer {
    mock: Arc<MockPlatform>,
    base: usize,
    received: Arc<Mutex<Vec<MboxMsg>>>,
    replies: Arc<Mutex<Vec<MboxMsg>>>,
    responder: Arc<Mutex<Option<Responder>>>,
    refuse: Arc<AtomicBool>,
}

impl Peer {
    /// Installs the register behaviour of the block at `base`. Call before
    /// creating the endpoint.
    pub fn attach(mock: &Arc<MockPlatform>, base: usize) -> Self {
        let ctrl = base + regs::MBX_CTRL;
        let status = base + regs::MBX_STATUS;
        mock.self_clearing(ctrl, MbxCtrl::all().bits() as u64);
        mock.write_one_to_clear(status, MbxStatus::W1C.bits() as u64);

        let received = Arc::new(Mutex::new(Vec::new()));
        let replies = Arc::new(Mutex::new(Vec::new()));
        let responder: Arc<Mutex<Option<Responder>>> = Arc::new(Mutex::new(None));
        let refuse = Arc::new(AtomicBool::new(false));
        {
            let received = Arc::clone(&received);
            let replies = Arc::clone(&replies);
            let responder = Arc::clone(&responder);
            let refuse = Arc::clone(&refuse);
            mock.on_write(ctrl, move |dev, value| {
                let cmd = MbxCtrl::from_bits_truncate(value as u32);
                if cmd.contains(MbxCtrl::POST) {
                    let msg = load(dev, base + regs::MBX_OMB_DATA);
                    received.lock().push(msg);
                    if refuse.swap(false, Ordering::AcqRel) {
                        dev.set_bits(status, MbxStatus::FAILED.bits() as u64);
                    } else {
                        dev.set_bits(status, MbxStatus::OMB_FULL.bits() as u64);
                        let rsp = responder.lock().as_ref().and_then(|f| f(msg));
                        if let Some(rsp) = rsp {
                            store(dev, base + regs::MBX_RSP_DATA, &rsp);
                            dev.clear_bits(status, MbxStatus::OMB_FULL.bits() as u64);
                            dev.set_bits(status, MbxStatus::ACKED.bits() as u64);
                        }
                    }
                }
                if cmd.contains(MbxCtrl::REPLY) {
                    replies.lock().push(load(dev, base + regs::MBX_RPL_DATA));
                }
                if cmd.contains(MbxCtrl::CANCEL) {
                    dev.clear_bits(status, MbxStatus::OMB_FULL.bits() as u64);
                }
                if cmd.contains(MbxCtrl::FUNC_RST) {
                    dev.clear_bits(
                        status,
                        (MbxStatus::OMB_FULL | MbxStatus::IMB_FULL).bits() as u64,
                    );
                    dev.set_bits(status, MbxStatus::FUNC_RST_DONE.bits() as u64);
                }
            });
        }
        Self {
            mock: Arc::clone(mock),
            base,
            received,
            replies,
            responder,
            refuse,
        }
    }

    /// Answers every later post with `f`; `None` leaves the post unanswered.
    pub fn respond_with(&self, f: impl Fn(MboxMsg) -> Option<MboxMsg> + Send + Sync + 'static) {
        *self.responder.lock() = Some(Box::new(f));
    }

    /// Refuses the next post.
    pub fn refuse(&self) {
        self.refuse.store(true, Ordering::Release);
    }

    /// Messages posted to us so far.
    pub fn received(&self) -> Vec<MboxMsg> {
        self.received.lock().clone()
    }

    /// Replies to messages we delivered.
    pub fn replies(&self) -> Vec<MboxMsg> {
        self.replies.lock().clone()
    }

    fn status(&self) -> MbxStatus {
        MbxStatus::from_bits_truncate(self.mock.reg(self.base + regs::MBX_STATUS) as u32)
    }

    pub fn outbound_full(&self) -> bool {
        self.status().contains(MbxStatus::OMB_FULL)
    }

    /// Keeps the outbound window busy as if an earlier message were stuck.
    pub fn hold_outbound(&self) {
        self.mock
            .set_bits(self.base + regs::MBX_STATUS, MbxStatus::OMB_FULL.bits() as u64);
    }

    /// Places `msg` in the inbound window.
    pub fn deliver(&self, msg: &MboxMsg) {
        store(&self.mock, self.base + regs::MBX_IMB_DATA, msg);
        self.mock
            .set_bits(self.base + regs::MBX_STATUS, MbxStatus::IMB_FULL.bits() as u64);
    }
}
