//! The device registry: fixed slot table plus driver flags.
//!
//! This is the only state shared across task and callback contexts. It is
//! always reached through the driver's blocking mutex; the methods here assume
//! the caller already holds it.

use defmt::Format;

use crate::host::DeviceAddress;

/// One slot per possible bus address the driver tracks.
pub const DEVICE_SLOTS: usize = 8;

/// A pending phase of the per-device state machine.
///
/// The diagnostic phases are only ever enqueued when the `device-info` feature
/// is enabled.
#[derive(Format, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Open,
    SetupStreaming,
    FetchInfo,
    FetchDeviceDescriptor,
    FetchConfigDescriptor,
    FetchStringDescriptors,
    Close,
}

impl Action {
    const fn bit(self) -> u8 {
        match self {
            Action::Open => 1 << 0,
            Action::SetupStreaming => 1 << 1,
            Action::FetchInfo => 1 << 2,
            Action::FetchDeviceDescriptor => 1 << 3,
            Action::FetchConfigDescriptor => 1 << 4,
            Action::FetchStringDescriptors => 1 << 5,
            Action::Close => 1 << 6,
        }
    }
}

/// Execution order of a drain pass; close always runs last.
const PRIORITY: [Action; 7] = [
    Action::Open,
    Action::SetupStreaming,
    Action::FetchInfo,
    Action::FetchDeviceDescriptor,
    Action::FetchConfigDescriptor,
    Action::FetchStringDescriptors,
    Action::Close,
];

/// The worklist of phases a device still needs.
#[derive(Format, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActionSet(u8);

impl ActionSet {
    pub const EMPTY: ActionSet = ActionSet(0);

    pub const fn only(action: Action) -> ActionSet {
        ActionSet(action.bit())
    }

    pub fn insert(&mut self, action: Action) {
        self.0 |= action.bit();
    }

    pub fn contains(&self, action: Action) -> bool {
        self.0 & action.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn in_priority_order(self) -> impl Iterator<Item = Action> {
        PRIORITY
            .into_iter()
            .filter(move |action| self.contains(*action))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DeviceSlot<D, T> {
    address: DeviceAddress,
    device: Option<D>,
    actions: ActionSet,
    claimed_interface: Option<u8>,
    midi_in_transfer: Option<T>,
}

impl<D: Copy + PartialEq, T: Copy> DeviceSlot<D, T> {
    const fn empty() -> Self {
        DeviceSlot {
            address: 0,
            device: None,
            actions: ActionSet::EMPTY,
            claimed_interface: None,
            midi_in_transfer: None,
        }
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn device(&self) -> Option<D> {
        self.device
    }

    pub fn actions(&self) -> ActionSet {
        self.actions
    }

    pub fn claimed_interface(&self) -> Option<u8> {
        self.claimed_interface
    }

    pub fn midi_in_transfer(&self) -> Option<T> {
        self.midi_in_transfer
    }
}

pub struct Registry<D, T> {
    slots: [DeviceSlot<D, T>; DEVICE_SLOTS],
    unhandled_devices: bool,
    shutdown: bool,
}

impl<D: Copy + PartialEq, T: Copy> Registry<D, T> {
    pub fn new() -> Self {
        Registry {
            slots: [DeviceSlot::empty(); DEVICE_SLOTS],
            unhandled_devices: false,
            shutdown: false,
        }
    }

    /// Notes a freshly attached device and queues its open phase. Returns
    /// `false` when the address is beyond the slot table.
    pub fn register_attach(&mut self, address: DeviceAddress) -> bool {
        let Some(slot) = self.slots.get_mut(address as usize) else {
            return false;
        };
        slot.address = address;
        slot.device = None;
        slot.actions.insert(Action::Open);
        self.unhandled_devices = true;
        true
    }

    /// A vanished device cannot be queried further, so every slot holding its
    /// handle gets its worklist overwritten with close alone.
    pub fn register_detach(&mut self, device: D) {
        for slot in self.slots.iter_mut() {
            if slot.device == Some(device) {
                slot.actions = ActionSet::only(Action::Close);
                self.unhandled_devices = true;
            }
        }
    }

    /// Queues close for every open device and raises the shutdown flag.
    pub fn mark_all_for_close_and_shutdown(&mut self) {
        for slot in self.slots.iter_mut() {
            if slot.device.is_some() {
                slot.actions.insert(Action::Close);
                self.unhandled_devices = true;
            }
        }
        self.shutdown = true;
    }

    pub fn unhandled_devices(&self) -> bool {
        self.unhandled_devices
    }

    pub fn clear_unhandled_devices(&mut self) {
        self.unhandled_devices = false;
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown
    }

    pub fn slot(&self, index: usize) -> &DeviceSlot<D, T> {
        &self.slots[index]
    }

    pub fn has_actions(&self, index: usize) -> bool {
        !self.slots[index].actions.is_empty()
    }

    /// Snapshots and clears a slot's worklist in one step, so phases executed
    /// from the snapshot can queue follow-up work without losing it.
    pub fn take_actions(&mut self, index: usize) -> ActionSet {
        core::mem::take(&mut self.slots[index].actions)
    }

    pub fn enqueue(&mut self, index: usize, action: Action) {
        self.slots[index].actions.insert(action);
    }

    pub fn address(&self, index: usize) -> DeviceAddress {
        self.slots[index].address
    }

    pub fn device(&self, index: usize) -> Option<D> {
        self.slots[index].device
    }

    pub fn set_device(&mut self, index: usize, device: D) {
        self.slots[index].device = Some(device);
    }

    pub fn set_claimed_interface(&mut self, index: usize, interface: u8) {
        self.slots[index].claimed_interface = Some(interface);
    }

    pub fn set_midi_in_transfer(&mut self, index: usize, transfer: T) {
        self.slots[index].midi_in_transfer = Some(transfer);
    }

    pub fn reset_slot(&mut self, index: usize) {
        self.slots[index] = DeviceSlot::empty();
    }

    #[cfg(test)]
    pub(crate) fn mark_unhandled(&mut self) {
        self.unhandled_devices = true;
    }
}
