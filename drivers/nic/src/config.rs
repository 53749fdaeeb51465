// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Adapter configuration.

use nic_base::{NicError, NicResult};
use nic_mbox::{FilterLimits, MboxConfig};
use nic_xdc::{RxConfig, TxConfig};

/// Default values of [`AdapterConfig`].
pub mod defaults {
    pub const TX_CHANNELS: u16 = 1;
    pub const RX_CHANNELS: u16 = 1;
    /// Register windows leave room for this many channels per direction.
    pub const MAX_CHANNELS: u16 = 64;

    pub const MIN_RING_SIZE: usize = 16;
    pub const MAX_RING_SIZE: usize = 4096;
    pub const TX_RING_SIZE: usize = 512;
    pub const RX_RING_SIZE: usize = 512;
    pub const RING_GAP: usize = 4;

    pub const TX_COPY_MAX: usize = 2048;
    pub const TX_KICK_BATCH: usize = 1;

    pub const RX_BUF_SIZE: usize = 2048;
    pub const RX_COPY_THRESHOLD: usize = 256;
    pub const RX_OFFSET: usize = 0;

    pub const MAX_FRAME: usize = 9216;
    pub const MIN_FRAME: usize = 60;

    pub const FAULT_WINDOW_MS: u64 = 1000;
    pub const QUIESCE_RETRIES: u32 = 1000;
    pub const RESET_RETRIES: u32 = 1000;
    pub const POLL_DELAY_US: u64 = 10;

    pub const MBOX_RETRIES: u32 = 100;
    pub const MBOX_DELAY_US: u64 = 10;

    pub const MTU_MIN: u32 = 68;
    pub const MTU_MAX: u32 = 9000;
    pub const MAX_UNICAST: usize = 16;
    pub const MAX_MULTICAST: usize = 32;
    pub const MAX_VLANS: usize = 32;
}

/// Ethernet header plus one VLAN tag.
const L2_OVERHEAD: usize = 18;

/// Everything tunable about an adapter instance.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub tx_channels: u16,
    pub rx_channels: u16,
    pub tx_ring_size: usize,
    pub rx_ring_size: usize,
    pub ring_gap: usize,
    /// Packets up to this size are copied into one descriptor.
    pub tx_copy_max: usize,
    pub tx_kick_batch: usize,
    /// Free slots needed to resume a paused sender; `None` is a quarter of
    /// the ring.
    pub tx_resched_threshold: Option<usize>,
    pub rx_buf_size: usize,
    /// Receive buffers per channel; `None` is twice the ring.
    pub rx_pool_bufs: Option<usize>,
    pub rx_copy_threshold: usize,
    pub rx_offset: usize,
    pub max_frame: usize,
    pub min_frame: usize,
    pub fault_window_ms: u64,
    pub quiesce_retries: u32,
    pub reset_retries: u32,
    pub poll_delay_us: u64,
    pub mbox_retries: u32,
    pub mbox_delay_us: u64,
    pub mtu_min: u32,
    pub mtu_max: u32,
    pub max_unicast: usize,
    pub max_multicast: usize,
    pub max_vlans: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        use defaults::*;
        Self {
            tx_channels: TX_CHANNELS,
            rx_channels: RX_CHANNELS,
            tx_ring_size: TX_RING_SIZE,
            rx_ring_size: RX_RING_SIZE,
            ring_gap: RING_GAP,
            tx_copy_max: TX_COPY_MAX,
            tx_kick_batch: TX_KICK_BATCH,
            tx_resched_threshold: None,
            rx_buf_size: RX_BUF_SIZE,
            rx_pool_bufs: None,
            rx_copy_threshold: RX_COPY_THRESHOLD,
            rx_offset: RX_OFFSET,
            max_frame: MAX_FRAME,
            min_frame: MIN_FRAME,
            fault_window_ms: FAULT_WINDOW_MS,
            quiesce_retries: QUIESCE_RETRIES,
            reset_retries: RESET_RETRIES,
            poll_delay_us: POLL_DELAY_US,
            mbox_retries: MBOX_RETRIES,
            mbox_delay_us: MBOX_DELAY_US,
            mtu_min: MTU_MIN,
            mtu_max: MTU_MAX,
            max_unicast: MAX_UNICAST,
            max_multicast: MAX_MULTICAST,
            max_vlans: MAX_VLANS,
        }
    }
}

fn ring_size_ok(size: usize) -> bool {
    size.is_power_of_two() && (defaults::MIN_RING_SIZE..=defaults::MAX_RING_SIZE).contains(&size)
}

impl AdapterConfig {
    /// Checks the adapter-level limits, then each derived channel
    /// configuration.
    pub fn validate(&self) -> NicResult {
        let channels = 1..=defaults::MAX_CHANNELS;
        if !channels.contains(&self.tx_channels) || !channels.contains(&self.rx_channels) {
            return Err(NicError::InvalidInput);
        }
        if !ring_size_ok(self.tx_ring_size) || !ring_size_ok(self.rx_ring_size) {
            return Err(NicError::InvalidInput);
        }
        if self.mtu_min == 0
            || self.mtu_min > self.mtu_max
            || self.mtu_max as usize + L2_OVERHEAD > self.max_frame
        {
            return Err(NicError::InvalidInput);
        }
        if self.mbox_retries == 0 {
            return Err(NicError::InvalidInput);
        }
        self.tx_config().validate()?;
        self.rx_config().validate()
    }

    pub fn tx_config(&self) -> TxConfig {
        TxConfig {
            ring_size: self.tx_ring_size,
            gap: self.ring_gap,
            copy_max: self.tx_copy_max,
            kick_batch: self.tx_kick_batch,
            resched_threshold: self
                .tx_resched_threshold
                .unwrap_or(self.tx_ring_size / 4),
            max_frame: self.max_frame,
            min_frame: self.min_frame,
            quiesce_retries: self.quiesce_retries,
            reset_retries: self.reset_retries,
            poll_delay_us: self.poll_delay_us,
            fault_window_ms: self.fault_window_ms,
        }
    }

    pub fn rx_config(&self) -> RxConfig {
        RxConfig {
            ring_size: self.rx_ring_size,
            gap: self.ring_gap,
            buf_size: self.rx_buf_size,
            pool_bufs: self.rx_pool_bufs.unwrap_or(self.rx_ring_size * 2),
            copy_threshold: self.rx_copy_threshold,
            offset: self.rx_offset,
            quiesce_retries: self.quiesce_retries,
            reset_retries: self.reset_retries,
            poll_delay_us: self.poll_delay_us,
            fault_window_ms: self.fault_window_ms,
        }
    }

    pub fn mbox_config(&self) -> MboxConfig {
        MboxConfig {
            retries: self.mbox_retries,
            delay_us: self.mbox_delay_us,
        }
    }

    pub fn filter_limits(&self) -> FilterLimits {
        FilterLimits {
            max_unicast: self.max_unicast,
            max_multicast: self.max_multicast,
            max_vlans: self.max_vlans,
            mtu_min: self.mtu_min,
            mtu_max: self.mtu_max,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = AdapterConfig::default();
        assert_eq!(cfg.validate(), Ok(()));
        assert_eq!(cfg.tx_config().resched_threshold, 128);
        assert_eq!(cfg.rx_config().pool_bufs, 1024);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let bad = [
            AdapterConfig {
                tx_ring_size: 8,
                ..AdapterConfig::default()
            },
            AdapterConfig {
                rx_ring_size: 8192,
                ..AdapterConfig::default()
            },
            AdapterConfig {
                tx_ring_size: 100,
                ..AdapterConfig::default()
            },
            AdapterConfig {
                rx_channels: 0,
                ..AdapterConfig::default()
            },
            AdapterConfig {
                tx_channels: 65,
                ..AdapterConfig::default()
            },
            AdapterConfig {
                ring_gap: 8,
                tx_ring_size: 16,
                ..AdapterConfig::default()
            },
            AdapterConfig {
                mtu_max: 9500,
                ..AdapterConfig::default()
            },
            AdapterConfig {
                rx_pool_bufs: Some(16),
                ..AdapterConfig::default()
            },
            AdapterConfig {
                tx_resched_threshold: Some(600),
                ..AdapterConfig::default()
            },
        ];
        for cfg in bad {
            assert_eq!(cfg.validate(), Err(NicError::InvalidInput), "{cfg:?}");
        }
    }
}
