//! Slot bookkeeping and the per-attachment single-step state machine.
//!
//! Everything here is pure: hits and step completions return *plans* naming
//! the slot to disable or re-arm, and the platform layer applies them to
//! thread state. This keeps the hardware plumbing thin and the state machine
//! testable everywhere.

use thiserror::Error;

/// ARM64 exposes four DBGWVR/DBGWCR pairs.
pub const MAX_WATCHPOINTS: usize = 4;
/// ARM64 exposes sixteen DBGBVR/DBGBCR pairs.
pub const MAX_BREAKPOINTS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Read = 1,
    Write = 2,
    ReadWrite = 3,
}

impl WatchKind {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            1 => Some(WatchKind::Read),
            2 => Some(WatchKind::Write),
            3 => Some(WatchKind::ReadWrite),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WatchpointSlot {
    pub used: bool,
    pub address: u64,
    pub size: u8,
    pub kind: WatchKind,
}

impl Default for WatchpointSlot {
    fn default() -> Self {
        Self {
            used: false,
            address: 0,
            size: 0,
            kind: WatchKind::Write,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BreakpointSlot {
    pub used: bool,
    pub address: u64,
    pub hit_count: u64,
    pub target_count: u64,
}

/// Which hardware trigger an in-flight single step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    None,
    Watchpoint(usize),
    Breakpoint(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Watchpoint,
    Breakpoint,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlotError {
    #[error("watchpoint size {0} is not one of 1, 2, 4, 8")]
    InvalidSize(u8),
    #[error("breakpoint target count must be at least 1")]
    InvalidHitCount,
    #[error("all {0} slots are in use")]
    Exhausted(&'static str),
}

/// Result of installing a slot. `already_installed` means the address was
/// present and nothing needs to be programmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Install {
    pub index: usize,
    pub already_installed: bool,
}

/// A trigger that fired and now needs the disable/step/re-arm dance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hit {
    pub index: usize,
    pub kind: SlotKind,
    /// Whether the host should be notified for this hit. Watchpoints always
    /// notify; breakpoints only on the configured arrival.
    pub notify: bool,
}

/// A completed single step; slot `index` must be re-armed on the thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepCompletion {
    pub index: usize,
    pub kind: SlotKind,
}

#[derive(Debug)]
pub struct SlotTable {
    watchpoints: [WatchpointSlot; MAX_WATCHPOINTS],
    breakpoints: [BreakpointSlot; MAX_BREAKPOINTS],
    step: StepState,
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotTable {
    pub fn new() -> Self {
        Self {
            watchpoints: [WatchpointSlot::default(); MAX_WATCHPOINTS],
            breakpoints: [BreakpointSlot::default(); MAX_BREAKPOINTS],
            step: StepState::None,
        }
    }

    pub fn step_state(&self) -> StepState {
        self.step
    }

    pub fn watchpoint(&self, index: usize) -> Option<&WatchpointSlot> {
        self.watchpoints.get(index).filter(|s| s.used)
    }

    pub fn breakpoint(&self, index: usize) -> Option<&BreakpointSlot> {
        self.breakpoints.get(index).filter(|s| s.used)
    }

    pub fn used_watchpoints(&self) -> usize {
        self.watchpoints.iter().filter(|s| s.used).count()
    }

    pub fn used_breakpoints(&self) -> usize {
        self.breakpoints.iter().filter(|s| s.used).count()
    }

    /// Claim a watchpoint slot. Re-installing an address is a success that
    /// reports the existing slot; the lowest free index wins otherwise.
    pub fn install_watchpoint(
        &mut self,
        address: u64,
        size: u8,
        kind: WatchKind,
    ) -> Result<Install, SlotError> {
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(SlotError::InvalidSize(size));
        }
        if let Some(index) = self.find_watchpoint(address) {
            return Ok(Install {
                index,
                already_installed: true,
            });
        }
        let index = self
            .watchpoints
            .iter()
            .position(|s| !s.used)
            .ok_or(SlotError::Exhausted("watchpoint"))?;
        self.watchpoints[index] = WatchpointSlot {
            used: true,
            address,
            size,
            kind,
        };
        Ok(Install {
            index,
            already_installed: false,
        })
    }

    /// Release the slot watching `address`. Returns its index, or None when
    /// the address was never installed.
    pub fn remove_watchpoint(&mut self, address: u64) -> Option<usize> {
        let index = self.find_watchpoint(address)?;
        self.watchpoints[index] = WatchpointSlot::default();
        if self.step == StepState::Watchpoint(index) {
            self.step = StepState::None;
        }
        Some(index)
    }

    pub fn install_breakpoint(
        &mut self,
        address: u64,
        target_count: u64,
    ) -> Result<Install, SlotError> {
        if target_count == 0 {
            return Err(SlotError::InvalidHitCount);
        }
        if let Some(index) = self.find_breakpoint(address) {
            return Ok(Install {
                index,
                already_installed: true,
            });
        }
        let index = self
            .breakpoints
            .iter()
            .position(|s| !s.used)
            .ok_or(SlotError::Exhausted("breakpoint"))?;
        self.breakpoints[index] = BreakpointSlot {
            used: true,
            address,
            hit_count: 0,
            target_count,
        };
        Ok(Install {
            index,
            already_installed: false,
        })
    }

    pub fn remove_breakpoint(&mut self, address: u64) -> Option<usize> {
        let index = self.find_breakpoint(address)?;
        self.breakpoints[index] = BreakpointSlot::default();
        if self.step == StepState::Breakpoint(index) {
            self.step = StepState::None;
        }
        Some(index)
    }

    fn find_watchpoint(&self, address: u64) -> Option<usize> {
        self.watchpoints
            .iter()
            .position(|s| s.used && s.address == address)
    }

    fn find_breakpoint(&self, address: u64) -> Option<usize> {
        self.breakpoints
            .iter()
            .position(|s| s.used && s.address == address)
    }

    /// A watchpoint trigger arrived with the faulting data address. The
    /// matching slot must be disabled on the thread and one instruction
    /// stepped before it is re-armed; a hit while a step is already in
    /// flight is ignored.
    pub fn on_watchpoint_hit(&mut self, data_address: u64) -> Option<Hit> {
        if self.step != StepState::None {
            return None;
        }
        let index = self.watchpoints.iter().position(|s| {
            s.used && s.address <= data_address && data_address < s.address + s.size as u64
        })?;
        self.step = StepState::Watchpoint(index);
        Some(Hit {
            index,
            kind: SlotKind::Watchpoint,
            notify: true,
        })
    }

    /// A breakpoint trigger arrived at `pc`. The hit counter always
    /// advances; the host is notified only on the configured arrival.
    pub fn on_breakpoint_hit(&mut self, pc: u64) -> Option<Hit> {
        if self.step != StepState::None {
            return None;
        }
        let index = self.find_breakpoint(pc)?;
        let slot = &mut self.breakpoints[index];
        slot.hit_count += 1;
        let notify = slot.hit_count == slot.target_count;
        self.step = StepState::Breakpoint(index);
        Some(Hit {
            index,
            kind: SlotKind::Breakpoint,
            notify,
        })
    }

    /// The post-trigger single step retired; the recorded slot must be
    /// re-armed and stepping cleared.
    pub fn on_single_step(&mut self) -> Option<StepCompletion> {
        let completion = match self.step {
            StepState::None => return None,
            StepState::Watchpoint(index) => StepCompletion {
                index,
                kind: SlotKind::Watchpoint,
            },
            StepState::Breakpoint(index) => StepCompletion {
                index,
                kind: SlotKind::Breakpoint,
            },
        };
        self.step = StepState::None;
        Some(completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_watchpoint_does_not_consume_a_slot() {
        let mut table = SlotTable::new();
        let first = table.install_watchpoint(0x1000, 4, WatchKind::Write).unwrap();
        assert!(!first.already_installed);

        let second = table.install_watchpoint(0x1000, 8, WatchKind::Read).unwrap();
        assert!(second.already_installed);
        assert_eq!(second.index, first.index);
        assert_eq!(table.used_watchpoints(), 1);
    }

    #[test]
    fn lowest_free_index_wins() {
        let mut table = SlotTable::new();
        for i in 0..MAX_WATCHPOINTS {
            let install = table
                .install_watchpoint(0x1000 + i as u64 * 8, 8, WatchKind::ReadWrite)
                .unwrap();
            assert_eq!(install.index, i);
        }
        // Freeing the middle slot makes it the next claim.
        table.remove_watchpoint(0x1008).unwrap();
        let install = table.install_watchpoint(0x9000, 1, WatchKind::Read).unwrap();
        assert_eq!(install.index, 1);
    }

    #[test]
    fn exhaustion_and_bad_arguments() {
        let mut table = SlotTable::new();
        for i in 0..MAX_WATCHPOINTS {
            table
                .install_watchpoint(0x1000 + i as u64 * 8, 8, WatchKind::Write)
                .unwrap();
        }
        assert_eq!(
            table.install_watchpoint(0x2000, 4, WatchKind::Write),
            Err(SlotError::Exhausted("watchpoint"))
        );
        assert_eq!(
            table.install_watchpoint(0x3000, 3, WatchKind::Write),
            Err(SlotError::InvalidSize(3))
        );
        assert_eq!(
            table.install_breakpoint(0x4000, 0),
            Err(SlotError::InvalidHitCount)
        );
    }

    #[test]
    fn used_slots_track_distinct_addresses_minus_removals() {
        let mut table = SlotTable::new();
        table.install_watchpoint(0x10, 1, WatchKind::Read).unwrap();
        table.install_watchpoint(0x20, 2, WatchKind::Write).unwrap();
        table.install_watchpoint(0x10, 1, WatchKind::Read).unwrap();
        assert_eq!(table.used_watchpoints(), 2);
        table.remove_watchpoint(0x10).unwrap();
        assert_eq!(table.used_watchpoints(), 1);
        assert!(table.remove_watchpoint(0x10).is_none());
    }

    #[test]
    fn watchpoint_hit_matches_by_containment() {
        let mut table = SlotTable::new();
        let install = table.install_watchpoint(0x1000, 4, WatchKind::Write).unwrap();

        // A fault on the third watched byte still resolves to the slot.
        let hit = table.on_watchpoint_hit(0x1002).unwrap();
        assert_eq!(hit.index, install.index);
        assert!(hit.notify);
        assert_eq!(table.step_state(), StepState::Watchpoint(install.index));

        // One byte past the range is not ours.
        table.on_single_step().unwrap();
        assert!(table.on_watchpoint_hit(0x1004).is_none());
    }

    #[test]
    fn hits_are_ignored_while_a_step_is_in_flight() {
        let mut table = SlotTable::new();
        table.install_watchpoint(0x1000, 8, WatchKind::Write).unwrap();
        table.install_breakpoint(0x2000, 1).unwrap();

        assert!(table.on_watchpoint_hit(0x1000).is_some());
        // Second trigger before the step retires: dropped.
        assert!(table.on_watchpoint_hit(0x1000).is_none());
        assert!(table.on_breakpoint_hit(0x2000).is_none());

        let done = table.on_single_step().unwrap();
        assert_eq!(done.kind, SlotKind::Watchpoint);
        assert_eq!(table.step_state(), StepState::None);
    }

    #[test]
    fn breakpoint_notifies_only_on_target_arrival() {
        let mut table = SlotTable::new();
        table.install_breakpoint(0x4000, 3).unwrap();

        let mut notifications = 0;
        for _ in 0..5 {
            let hit = table.on_breakpoint_hit(0x4000).unwrap();
            if hit.notify {
                notifications += 1;
            }
            table.on_single_step().unwrap();
        }
        // Exactly one notification, on the third arrival; later hits keep
        // stepping past the trigger without telling the host.
        assert_eq!(notifications, 1);
        assert_eq!(table.breakpoint(0).unwrap().hit_count, 5);
    }

    #[test]
    fn every_hit_step_sequence_converges_to_idle() {
        let mut table = SlotTable::new();
        table.install_watchpoint(0x1000, 8, WatchKind::ReadWrite).unwrap();
        table.install_breakpoint(0x2000, 2).unwrap();

        // Interleave the two triggers; after each (hit, step) pair the
        // machine must be back to None, and a stray step is a no-op.
        for round in 0..8 {
            if round % 2 == 0 {
                assert!(table.on_watchpoint_hit(0x1003).is_some());
            } else {
                assert!(table.on_breakpoint_hit(0x2000).is_some());
            }
            assert_ne!(table.step_state(), StepState::None);
            assert!(table.on_single_step().is_some());
            assert_eq!(table.step_state(), StepState::None);
            assert!(table.on_single_step().is_none());
        }
    }

    #[test]
    fn removing_the_stepping_slot_clears_the_step() {
        let mut table = SlotTable::new();
        table.install_breakpoint(0x2000, 1).unwrap();
        table.on_breakpoint_hit(0x2000).unwrap();
        assert_eq!(table.step_state(), StepState::Breakpoint(0));

        table.remove_breakpoint(0x2000).unwrap();
        assert_eq!(table.step_state(), StepState::None);
        assert!(table.on_single_step().is_none());
    }
}
