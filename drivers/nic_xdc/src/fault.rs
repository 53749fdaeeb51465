// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Channel fault decoding and the recovery state machine.
//!
//! ```text
//!  Running ──fault──▶ FaultDetected ──▶ Quiescing ──▶ Reinitializing ──▶ Running
//!     ▲                    │  (device-global: escalate, stay here)            │
//!     └────────────────────┴──────────────────────────────────────────────────┘
//!  any state ──disable──▶ Disabled
//! ```
//!
//! The monitor never touches another channel. Device-global faults are
//! only reported to the [`AdapterReset`] collaborator.

use alloc::sync::Arc;
use core::{
    fmt,
    sync::atomic::{AtomicU8, AtomicU64, Ordering},
};

use log::{debug, error, info, warn};
use nic_base::{NicError, NicHal, NicResult};
use strum::{EnumCount, EnumIter, FromRepr, IntoEnumIterator, IntoStaticStr};

/// Transmit or receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Tx,
    Rx,
}

/// Identity of one DMA channel on the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId {
    pub dir: Direction,
    pub index: u16,
}

impl ChannelId {
    pub const fn tx(index: u16) -> Self {
        Self {
            dir: Direction::Tx,
            index,
        }
    }

    pub const fn rx(index: u16) -> Self {
        Self {
            dir: Direction::Rx,
            index,
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.dir {
            Direction::Tx => write!(f, "tx{}", self.index),
            Direction::Rx => write!(f, "rx{}", self.index),
        }
    }
}

/// Every fault a channel can report.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumCount, EnumIter, FromRepr, IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum FaultKind {
    // transmit
    PeuResponse,
    InvalidSop,
    PrematureSop,
    DescLength,
    DescPointerCount,
    MailboxWrite,
    PacketSize,
    RingOverflow,
    PrefetchParity,
    PrefetchTimeout,
    PacketReadNack,
    ConfigPartition,
    PacketPartition,
    // receive
    ControlFifoEcc,
    CompletionShadowFull,
    BufferRequestRejected,
    BufferTimeout,
    ResponseData,
    CompletionAck,
    CompletionShadowParity,
    BufferPrefetchParity,
    CompletionUnderflow,
    BufferOverflow,
    // raised by an external stall detector
    Watchdog,
}

/// Whether a fault can be cured by resetting only the reporting channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultScope {
    ChannelLocal,
    DeviceGlobal,
}

/// One row of a status-word decoding table.
#[derive(Debug, Clone, Copy)]
pub struct FaultBit {
    pub mask: u64,
    pub kind: FaultKind,
    pub scope: FaultScope,
}

impl FaultBit {
    pub const fn local(mask: u64, kind: FaultKind) -> Self {
        Self {
            mask,
            kind,
            scope: FaultScope::ChannelLocal,
        }
    }

    pub const fn global(mask: u64, kind: FaultKind) -> Self {
        Self {
            mask,
            kind,
            scope: FaultScope::DeviceGlobal,
        }
    }
}

/// A set of [`FaultKind`]s.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FaultSet(u32);

impl FaultSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, kind: FaultKind) {
        self.0 |= 1 << kind as u8;
    }

    pub fn contains(&self, kind: FaultKind) -> bool {
        self.0 & (1 << kind as u8) != 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = FaultKind> + '_ {
        FaultKind::iter().filter(|k| self.contains(*k))
    }
}

impl From<FaultKind> for FaultSet {
    fn from(kind: FaultKind) -> Self {
        let mut set = Self::empty();
        set.insert(kind);
        set
    }
}

impl fmt::Display for FaultSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for kind in self.iter() {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            let name: &'static str = kind.into();
            f.write_str(name)?;
        }
        Ok(())
    }
}

/// A status word split by scope.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    pub local: FaultSet,
    pub global: FaultSet,
    /// The status bits that matched a table row.
    pub bits: u64,
}

impl Decoded {
    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.global.is_empty()
    }
}

/// Decodes `status` against `table`.
pub fn decode(table: &[FaultBit], status: u64) -> Decoded {
    let mut out = Decoded::default();
    for row in table.iter().filter(|row| status & row.mask != 0) {
        out.bits |= row.mask;
        match row.scope {
            FaultScope::ChannelLocal => out.local.insert(row.kind),
            FaultScope::DeviceGlobal => out.global.insert(row.kind),
        }
    }
    out
}

/// Recovery state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, IntoStaticStr)]
#[repr(u8)]
pub enum ChannelState {
    Running,
    FaultDetected,
    Quiescing,
    Reinitializing,
    Disabled,
}

/// Receives device-global faults; performs the full adapter reset.
pub trait AdapterReset: Send + Sync {
    fn escalate(&self, channel: ChannelId, faults: FaultSet);
}

/// Tracks channels that keep faulting.
pub trait HealthMonitor: Send + Sync {
    /// `channel` faulted again `since_ms` after its previous fault.
    fn repeated_fault(&self, channel: ChannelId, faults: FaultSet, since_ms: u64);
}

/// Collaborators notified by the fault monitor.
#[derive(Clone, Default)]
pub struct FaultHooks {
    pub reset: Option<Arc<dyn AdapterReset>>,
    pub health: Option<Arc<dyn HealthMonitor>>,
}

/// The steps of channel recovery, implemented by each channel type.
pub trait ChannelOps {
    fn id(&self) -> ChannelId;

    fn hal(&self) -> &Arc<dyn NicHal>;

    /// Status-word decoding table of the channel's hardware generation.
    fn fault_table(&self) -> &'static [FaultBit];

    /// Reads the raw status word.
    fn read_status(&self) -> u64;

    /// Acknowledges status bits.
    fn clear_status(&self, bits: u64);

    fn mask_interrupts(&self, masked: bool);

    /// Stops the hardware, waiting a bounded time. Returns whether the
    /// device confirmed the stop.
    fn quiesce(&self) -> bool;

    /// Releases all control blocks, zeroes the ring, and reprograms and
    /// re-enables the hardware.
    fn reinit(&self) -> NicResult;
}

const NO_FAULT_YET: u64 = u64::MAX;

/// Per-channel fault state and counters.
pub struct FaultMonitor {
    state: AtomicU8,
    counts: [AtomicU64; FaultKind::COUNT],
    resets: AtomicU64,
    spurious: AtomicU64,
    escalations: AtomicU64,
    repeats: AtomicU64,
    last_fault_ms: AtomicU64,
    window_ms: u64,
    hooks: FaultHooks,
}

impl FaultMonitor {
    pub fn new(hooks: FaultHooks, window_ms: u64) -> Self {
        Self {
            state: AtomicU8::new(ChannelState::Disabled as u8),
            counts: core::array::from_fn(|_| AtomicU64::new(0)),
            resets: AtomicU64::new(0),
            spurious: AtomicU64::new(0),
            escalations: AtomicU64::new(0),
            repeats: AtomicU64::new(0),
            last_fault_ms: AtomicU64::new(NO_FAULT_YET),
            window_ms,
            hooks,
        }
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_repr(self.state.load(Ordering::Acquire)).unwrap_or(ChannelState::Disabled)
    }

    /// Whether the channel takes new sends or posts.
    pub fn is_running(&self) -> bool {
        self.state() == ChannelState::Running
    }

    fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: ChannelState, to: ChannelState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Marks a freshly initialized channel as running.
    pub fn start(&self) {
        self.set_state(ChannelState::Running);
    }

    /// Administrative shutdown; reachable from every state.
    pub fn disable(&self) {
        self.set_state(ChannelState::Disabled);
    }

    /// Completed recoveries.
    pub fn resets(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }

    /// Recovery requests on a channel that was already running.
    pub fn spurious_recoveries(&self) -> u64 {
        self.spurious.load(Ordering::Relaxed)
    }

    /// Device-global faults reported upward.
    pub fn escalations(&self) -> u64 {
        self.escalations.load(Ordering::Relaxed)
    }

    /// Faults that arrived within the window of a previous one.
    pub fn repeated_faults(&self) -> u64 {
        self.repeats.load(Ordering::Relaxed)
    }

    /// How often `kind` was seen.
    pub fn fault_count(&self, kind: FaultKind) -> u64 {
        self.counts[kind as usize].load(Ordering::Relaxed)
    }

    /// Every non-zero fault counter by name.
    pub fn fault_counts(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        FaultKind::iter()
            .map(|k| (k.into(), self.fault_count(k)))
            .filter(|(_, n)| *n != 0)
    }

    fn count(&self, set: FaultSet) {
        for kind in set.iter() {
            self.counts[kind as usize].fetch_add(1, Ordering::Relaxed);
        }
    }

    fn note_fault(&self, ch: &impl ChannelOps, faults: FaultSet) {
        let now = ch.hal().now_ms();
        let last = self.last_fault_ms.swap(now, Ordering::Relaxed);
        if last != NO_FAULT_YET && now.saturating_sub(last) <= self.window_ms {
            let since = now.saturating_sub(last);
            self.repeats.fetch_add(1, Ordering::Relaxed);
            warn!("{}: repeated fault {faults} after {since} ms", ch.id());
            if let Some(health) = &self.hooks.health {
                health.repeated_fault(ch.id(), faults, since);
            }
        }
    }

    /// Reads and acknowledges the channel status word, and reacts to what
    /// it finds: channel-local faults are recovered in place, device-global
    /// faults are escalated.
    ///
    /// Returns the decoded faults, or `None` if the status word was clean.
    pub fn check(&self, ch: &impl ChannelOps) -> NicResult<Option<Decoded>> {
        if self.state() == ChannelState::Disabled {
            return Ok(None);
        }
        let status = ch.read_status();
        let decoded = decode(ch.fault_table(), status);
        if decoded.is_empty() {
            return Ok(None);
        }
        ch.clear_status(decoded.bits);
        self.count(decoded.local);
        self.count(decoded.global);

        if !decoded.global.is_empty() {
            self.escalations.fetch_add(1, Ordering::Relaxed);
            self.transition(ChannelState::Running, ChannelState::FaultDetected);
            error!("{}: device fault {}, escalating", ch.id(), decoded.global);
            if let Some(reset) = &self.hooks.reset {
                reset.escalate(ch.id(), decoded.global);
            }
            return Ok(Some(decoded));
        }

        warn!("{}: channel fault {}", ch.id(), decoded.local);
        self.transition(ChannelState::Running, ChannelState::FaultDetected);
        self.note_fault(ch, decoded.local);
        self.recover(ch)?;
        Ok(Some(decoded))
    }

    /// External reset trigger, e.g. from a stall detector. Forces a running
    /// channel through the full recovery sequence.
    pub fn request_reset(&self, ch: &impl ChannelOps) -> NicResult {
        match self.state() {
            ChannelState::Disabled => return Err(NicError::BadState),
            ChannelState::Quiescing | ChannelState::Reinitializing => {
                return Err(NicError::ResourceBusy);
            }
            ChannelState::FaultDetected => return self.recover(ch),
            ChannelState::Running => {}
        }
        if self.transition(ChannelState::Running, ChannelState::FaultDetected) {
            self.count(FaultKind::Watchdog.into());
            self.note_fault(ch, FaultKind::Watchdog.into());
        }
        self.recover(ch)
    }

    /// Runs `FaultDetected -> Quiescing -> Reinitializing -> Running`.
    ///
    /// On a running channel this only counts the request. A recovery already
    /// in progress makes this call fail with [`NicError::ResourceBusy`].
    pub fn recover(&self, ch: &impl ChannelOps) -> NicResult {
        match self.state() {
            ChannelState::Running => {
                self.spurious.fetch_add(1, Ordering::Relaxed);
                debug!("{}: recovery requested while running", ch.id());
                return Ok(());
            }
            ChannelState::Disabled => return Err(NicError::BadState),
            ChannelState::Quiescing | ChannelState::Reinitializing => {
                return Err(NicError::ResourceBusy);
            }
            ChannelState::FaultDetected => {}
        }
        if !self.transition(ChannelState::FaultDetected, ChannelState::Quiescing) {
            return Err(NicError::ResourceBusy);
        }

        ch.mask_interrupts(true);
        if !ch.quiesce() {
            warn!("{}: stop not confirmed, abandoning in-flight work", ch.id());
        }

        if !self.transition(ChannelState::Quiescing, ChannelState::Reinitializing) {
            debug!("{}: disabled while quiescing", ch.id());
            return Err(NicError::BadState);
        }
        if let Err(err) = ch.reinit() {
            error!("{}: reinit failed: {err}", ch.id());
            self.set_state(ChannelState::Disabled);
            if let Some(reset) = &self.hooks.reset {
                reset.escalate(ch.id(), FaultSet::empty());
            }
            return Err(err);
        }
        if !self.transition(ChannelState::Reinitializing, ChannelState::Running) {
            debug!("{}: disabled while reinitializing", ch.id());
            return Err(NicError::BadState);
        }

        ch.mask_interrupts(false);
        let n = self.resets.fetch_add(1, Ordering::Relaxed) + 1;
        info!("{}: recovered (reset #{n})", ch.id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use core::sync::atomic::AtomicUsize;
    use std::vec::Vec;

    use nic_base::mock::MockPlatform;
    use spin::Mutex;

    use super::*;

    const TABLE: &[FaultBit] = &[
        FaultBit::local(1 << 0, FaultKind::RingOverflow),
        FaultBit::local(1 << 1, FaultKind::PrefetchParity),
        FaultBit::global(1 << 2, FaultKind::ConfigPartition),
    ];

    struct FakeChannel {
        hal: Arc<dyn NicHal>,
        status: AtomicU64,
        reinits: AtomicUsize,
        fail_reinit: bool,
        log: Mutex<Vec<&'static str>>,
        // Disabled from "another context" when the named step runs.
        disable_at: Mutex<Option<(&'static str, Arc<FaultMonitor>)>>,
    }

    impl FakeChannel {
        fn step(&self, name: &'static str) {
            self.log.lock().push(name);
            if let Some((at, mon)) = &*self.disable_at.lock() {
                if *at == name {
                    mon.disable();
                }
            }
        }
    }

    impl FakeChannel {
        fn new() -> Self {
            Self {
                hal: Arc::new(MockPlatform::new()),
                status: AtomicU64::new(0),
                reinits: AtomicUsize::new(0),
                fail_reinit: false,
                log: Mutex::new(Vec::new()),
                disable_at: Mutex::new(None),
            }
        }
    }

    impl ChannelOps for FakeChannel {
        fn id(&self) -> ChannelId {
            ChannelId::tx(0)
        }
        fn hal(&self) -> &Arc<dyn NicHal> {
            &self.hal
        }
        fn fault_table(&self) -> &'static [FaultBit] {
            TABLE
        }
        fn read_status(&self) -> u64 {
            self.status.load(Ordering::Relaxed)
        }
        fn clear_status(&self, bits: u64) {
            self.status.fetch_and(!bits, Ordering::Relaxed);
        }
        fn mask_interrupts(&self, masked: bool) {
            self.log.lock().push(if masked { "mask" } else { "unmask" });
        }
        fn quiesce(&self) -> bool {
            self.step("quiesce");
            true
        }
        fn reinit(&self) -> NicResult {
            self.step("reinit");
            self.reinits.fetch_add(1, Ordering::Relaxed);
            if self.fail_reinit {
                Err(NicError::Timeout)
            } else {
                Ok(())
            }
        }
    }

    struct Recorder {
        escalated: Mutex<Vec<FaultSet>>,
        repeated: AtomicUsize,
    }

    impl AdapterReset for Recorder {
        fn escalate(&self, _channel: ChannelId, faults: FaultSet) {
            self.escalated.lock().push(faults);
        }
    }

    impl HealthMonitor for Recorder {
        fn repeated_fault(&self, _channel: ChannelId, _faults: FaultSet, _since_ms: u64) {
            self.repeated.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn hooks() -> (Arc<Recorder>, FaultHooks) {
        let rec = Arc::new(Recorder {
            escalated: Mutex::new(Vec::new()),
            repeated: AtomicUsize::new(0),
        });
        let hooks = FaultHooks {
            reset: Some(rec.clone()),
            health: Some(rec.clone()),
        };
        (rec, hooks)
    }

    #[test]
    fn decode_splits_by_scope() {
        let d = decode(TABLE, 0b111 | (1 << 40));
        assert!(d.local.contains(FaultKind::RingOverflow));
        assert!(d.local.contains(FaultKind::PrefetchParity));
        assert_eq!(d.global, FaultKind::ConfigPartition.into());
        assert_eq!(d.bits, 0b111);
        assert!(decode(TABLE, 1 << 40).is_empty());
    }

    #[test]
    fn local_fault_runs_full_recovery_once() {
        let (_rec, hooks) = hooks();
        let mon = FaultMonitor::new(hooks, 1000);
        let ch = FakeChannel::new();
        mon.start();
        ch.status.store(1 << 1, Ordering::Relaxed);

        let decoded = mon.check(&ch).unwrap().unwrap();
        assert!(decoded.local.contains(FaultKind::PrefetchParity));
        assert_eq!(mon.state(), ChannelState::Running);
        assert_eq!(mon.resets(), 1);
        assert_eq!(mon.fault_count(FaultKind::PrefetchParity), 1);
        assert_eq!(ch.read_status(), 0);
        assert_eq!(*ch.log.lock(), ["mask", "quiesce", "reinit", "unmask"]);
    }

    #[test]
    fn recover_on_running_channel_only_counts() {
        let (_rec, hooks) = hooks();
        let mon = FaultMonitor::new(hooks, 1000);
        let ch = FakeChannel::new();
        mon.start();
        mon.recover(&ch).unwrap();
        mon.recover(&ch).unwrap();
        assert_eq!(mon.spurious_recoveries(), 2);
        assert_eq!(mon.resets(), 0);
        assert_eq!(ch.reinits.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn global_fault_is_escalated_not_recovered() {
        let (rec, hooks) = hooks();
        let mon = FaultMonitor::new(hooks, 1000);
        let ch = FakeChannel::new();
        mon.start();
        ch.status.store(1 << 2, Ordering::Relaxed);
        mon.check(&ch).unwrap();
        assert_eq!(mon.state(), ChannelState::FaultDetected);
        assert_eq!(mon.escalations(), 1);
        assert_eq!(*rec.escalated.lock(), [FaultSet::from(FaultKind::ConfigPartition)]);
        assert_eq!(ch.reinits.load(Ordering::Relaxed), 0);

        // the adapter-level reset later recovers the channel
        mon.recover(&ch).unwrap();
        assert_eq!(mon.state(), ChannelState::Running);
    }

    #[test]
    fn repeated_faults_are_reported_but_still_recovered() {
        let (rec, hooks) = hooks();
        let mon = FaultMonitor::new(hooks, 1000);
        let ch = FakeChannel::new();
        mon.start();
        for _ in 0..3 {
            ch.status.store(1, Ordering::Relaxed);
            mon.check(&ch).unwrap();
        }
        assert_eq!(mon.resets(), 3);
        assert_eq!(rec.repeated.load(Ordering::Relaxed), 2);

        ch.hal.delay_us(5_000_000);
        ch.status.store(1, Ordering::Relaxed);
        mon.check(&ch).unwrap();
        assert_eq!(rec.repeated.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn failed_reinit_disables_channel() {
        let (rec, hooks) = hooks();
        let mon = FaultMonitor::new(hooks, 1000);
        let mut ch = FakeChannel::new();
        ch.fail_reinit = true;
        mon.start();
        assert_eq!(mon.request_reset(&ch), Err(NicError::Timeout));
        assert_eq!(mon.state(), ChannelState::Disabled);
        assert_eq!(rec.escalated.lock().len(), 1);
        assert_eq!(mon.fault_count(FaultKind::Watchdog), 1);
        assert_eq!(mon.request_reset(&ch), Err(NicError::BadState));
    }

    #[test]
    fn disable_during_recovery_is_terminal() {
        for step in ["quiesce", "reinit"] {
            let (_rec, hooks) = hooks();
            let mon = Arc::new(FaultMonitor::new(hooks, 1000));
            let ch = FakeChannel::new();
            *ch.disable_at.lock() = Some((step, mon.clone()));
            mon.start();
            ch.status.store(1, Ordering::Relaxed);

            assert_eq!(mon.check(&ch), Err(NicError::BadState), "{step}");
            assert_eq!(mon.state(), ChannelState::Disabled, "{step}");
            assert_eq!(mon.resets(), 0);
            assert!(!ch.log.lock().contains(&"unmask"));
        }
    }

    #[test]
    fn watchdog_during_recovery_is_not_counted() {
        let (_rec, hooks) = hooks();
        let mon = FaultMonitor::new(hooks, 1000);
        let ch = FakeChannel::new();
        mon.start();
        mon.set_state(ChannelState::Reinitializing);
        for _ in 0..3 {
            assert_eq!(mon.request_reset(&ch), Err(NicError::ResourceBusy));
        }
        assert_eq!(mon.fault_count(FaultKind::Watchdog), 0);
        assert_eq!(mon.repeated_faults(), 0);

        // A channel held after a device fault is recovered without a
        // watchdog count of its own.
        mon.set_state(ChannelState::FaultDetected);
        mon.request_reset(&ch).unwrap();
        assert_eq!(mon.state(), ChannelState::Running);
        assert_eq!(mon.fault_count(FaultKind::Watchdog), 0);
        assert_eq!(mon.resets(), 1);
    }

    #[test]
    fn fault_set_display_uses_snake_case() {
        let mut set = FaultSet::from(FaultKind::RingOverflow);
        set.insert(FaultKind::BufferTimeout);
        assert_eq!(std::format!("{set}"), "ring_overflow,buffer_timeout");
        assert_eq!(set.len(), 2);
    }
}
