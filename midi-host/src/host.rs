//! Boundary to the underlying USB host stack.
//!
//! The driver never talks to host silicon directly; everything it needs from
//! the stack goes through [`UsbHostStack`]. The stack in turn feeds the driver
//! through [`crate::MidiHost::on_client_event`] and
//! [`crate::MidiHost::on_transfer_complete`].

use defmt::Format;

/// USB bus address of a device. `0` marks an unoccupied device slot.
pub type DeviceAddress = u8;

#[derive(Format, Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointAddress(pub u8);

impl EndpointAddress {
    const DIR_IN_MASK: u8 = 0x80;

    pub fn is_in(self) -> bool {
        self.0 & Self::DIR_IN_MASK != 0
    }
}

#[derive(Format, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostError {
    NotFound,
    NotSupported,
    InvalidParameter,
    InvalidState,
    NoResources,
}

/// Final status of a finished transfer, as reported by the stack.
#[derive(Format, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Canceled,
    Stall,
    Overflow,
    NoDevice,
}

#[derive(Format, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speed {
    Low,
    Full,
    High,
}

#[cfg(feature = "device-info")]
#[derive(Format, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub speed: Speed,
    pub configuration_value: u8,
}

#[cfg(feature = "device-info")]
#[derive(Format, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_class: u8,
    pub device_sub_class: u8,
    pub device_protocol: u8,
    pub num_configurations: u8,
}

#[cfg(feature = "device-info")]
#[derive(Format, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceString {
    Manufacturer,
    Product,
    SerialNumber,
}

/// Client-level notification from the stack. The stack emits nothing else;
/// an event outside this set cannot be represented.
#[derive(Format, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent<D> {
    NewDevice { address: DeviceAddress },
    DeviceGone { device: D },
}

/// A finished transfer handed back by the stack's completion context.
pub struct TransferComplete<'a, T> {
    pub transfer: T,
    pub endpoint: EndpointAddress,
    pub status: TransferStatus,
    pub data: &'a [u8],
}

/// Stack-level event flags observed by the host-library task.
#[derive(Format, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StackEvent {
    pub no_clients: bool,
    pub all_freed: bool,
}

pub trait UsbHostStack {
    type DeviceHandle: Copy + PartialEq;
    type TransferHandle: Copy + PartialEq;

    fn install(&self) -> Result<(), HostError>;
    fn uninstall(&self) -> Result<(), HostError>;
    async fn handle_stack_events(&self) -> StackEvent;
    fn free_all_devices(&self) -> Result<(), HostError>;

    fn register_client(&self) -> Result<(), HostError>;
    fn deregister_client(&self) -> Result<(), HostError>;

    fn open_device(&self, address: DeviceAddress) -> Result<Self::DeviceHandle, HostError>;
    fn close_device(&self, device: Self::DeviceHandle) -> Result<(), HostError>;
    /// Copies the active configuration descriptor into `buffer` and returns
    /// its total length.
    fn read_config_descriptor(
        &self,
        device: Self::DeviceHandle,
        buffer: &mut [u8],
    ) -> Result<usize, HostError>;
    fn claim_interface(
        &self,
        device: Self::DeviceHandle,
        interface: u8,
        alt_setting: u8,
    ) -> Result<(), HostError>;
    fn release_interface(&self, device: Self::DeviceHandle, interface: u8)
    -> Result<(), HostError>;

    fn alloc_transfer(
        &self,
        device: Self::DeviceHandle,
        endpoint: EndpointAddress,
        size: usize,
    ) -> Result<Self::TransferHandle, HostError>;
    fn submit_transfer(&self, transfer: Self::TransferHandle) -> Result<(), HostError>;
    fn free_transfer(&self, transfer: Self::TransferHandle) -> Result<(), HostError>;

    #[cfg(feature = "device-info")]
    fn device_info(&self, device: Self::DeviceHandle) -> Result<DeviceInfo, HostError>;
    #[cfg(feature = "device-info")]
    fn device_descriptor(&self, device: Self::DeviceHandle)
    -> Result<DeviceDescriptor, HostError>;
    #[cfg(feature = "device-info")]
    fn string_descriptor(
        &self,
        device: Self::DeviceHandle,
        which: DeviceString,
    ) -> Option<heapless::String<64>>;
}
