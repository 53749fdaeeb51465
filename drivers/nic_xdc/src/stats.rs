// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Per-channel counters, readable at any time with relaxed atomic loads.

use core::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    (
        $(#[$meta:meta])*
        $name:ident / $snap:ident { $($(#[$fmeta:meta])* $field:ident),* $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Default)]
        pub struct $name {
            $($(#[$fmeta])* pub $field: AtomicU64,)*
        }

        /// Point-in-time copy of the counters.
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
        pub struct $snap {
            $($(#[$fmeta])* pub $field: u64,)*
        }

        impl $name {
            pub fn snapshot(&self) -> $snap {
                $snap {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    /// Transmit channel counters.
    TxStats / TxSnapshot {
        /// Packets handed to the device.
        opackets,
        /// Bytes handed to the device, after padding.
        obytes,
        /// Packets dropped as malformed.
        oerrors,
        /// Sends handed back: no ring space, no mapping, or in recovery.
        ofulls,
        /// Streaming mappings the platform refused.
        map_failures,
        /// Packets sent through the per-slot copy buffer.
        copied,
        /// Packets coalesced because they needed too many descriptors.
        coalesced,
        /// Resume signals delivered to flow control.
        resumes,
        /// Doorbell writes.
        kicks,
        /// Descriptors reclaimed.
        reclaimed,
    }
}

counters! {
    /// Receive channel counters.
    RxStats / RxSnapshot {
        /// Frames delivered.
        ipackets,
        /// Bytes delivered.
        ibytes,
        /// Completion entries with an error, and frames discarded with them.
        ierrors,
        /// Replacement buffer allocations that failed.
        ierrors_alloc,
        /// Frames copied out of the ring buffer.
        copied,
        /// Segments whose ring buffer was handed upward.
        loaned,
        /// Frames that spanned more than one completion entry.
        chained,
    }
}

#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}
