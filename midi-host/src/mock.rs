//! Scripted in-memory host stack.
//!
//! Services every [`UsbHostStack`] operation against a device table the test
//! or bring-up code populates with [`MockHost::attach`], and records enough of
//! what happened (opens, claims, submits, frees) to assert against.

use core::cell::RefCell;

use defmt::Format;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::Channel;

use crate::descriptor::CONFIG_DESCRIPTOR_CAPACITY;
#[cfg(feature = "device-info")]
use crate::host::{DeviceDescriptor, DeviceInfo, DeviceString, Speed};
use crate::host::{DeviceAddress, EndpointAddress, HostError, StackEvent, UsbHostStack};
use crate::registry::DEVICE_SLOTS;

const MAX_TRANSFERS: usize = 8;

#[derive(Format, Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockDeviceHandle(pub DeviceAddress);

#[derive(Format, Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockTransferHandle(pub usize);

struct MockDevice {
    address: DeviceAddress,
    config: heapless::Vec<u8, CONFIG_DESCRIPTOR_CAPACITY>,
    attached: bool,
    open: bool,
    close_count: u32,
    claimed_interfaces: heapless::Vec<u8, 4>,
}

struct MockTransfer {
    device: MockDeviceHandle,
    endpoint: EndpointAddress,
    size: usize,
    submit_count: u32,
    freed: bool,
}

#[derive(Default)]
struct MockState {
    devices: [Option<MockDevice>; DEVICE_SLOTS],
    transfers: heapless::Vec<MockTransfer, MAX_TRANSFERS>,
    installed: bool,
    uninstalled: bool,
    client_registered: bool,
    client_deregistered: bool,
    devices_freed: bool,
}

pub struct MockHost<M: RawMutex> {
    state: Mutex<M, RefCell<MockState>>,
    stack_events: Channel<M, StackEvent, 4>,
}

impl<M: RawMutex> MockHost<M> {
    pub fn new() -> Self {
        MockHost {
            state: Mutex::new(RefCell::new(MockState::default())),
            stack_events: Channel::new(),
        }
    }

    /// Puts a device with the given configuration blob on the simulated bus.
    pub fn attach(&self, address: DeviceAddress, config: &[u8]) {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let mut blob = heapless::Vec::new();
            blob.extend_from_slice(config)
                .expect("config descriptor too large for the mock");
            state.devices[address as usize] = Some(MockDevice {
                address,
                config: blob,
                attached: true,
                open: false,
                close_count: 0,
                claimed_interfaces: heapless::Vec::new(),
            });
        });
    }

    /// Pulls a device off the simulated bus. Its handle stays valid for
    /// teardown calls, as on real host stacks.
    pub fn detach(&self, address: DeviceAddress) -> MockDeviceHandle {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if let Some(device) = state.devices[address as usize].as_mut() {
                device.attached = false;
            }
        });
        MockDeviceHandle(address)
    }

    pub fn post_stack_event(&self, event: StackEvent) {
        self.stack_events
            .try_send(event)
            .expect("stack event queue full");
    }

    pub fn is_open(&self, address: DeviceAddress) -> bool {
        self.with_device(address, |device| device.open).unwrap_or(false)
    }

    pub fn close_count(&self, address: DeviceAddress) -> u32 {
        self.with_device(address, |device| device.close_count)
            .unwrap_or(0)
    }

    pub fn claimed_interfaces(&self, address: DeviceAddress) -> heapless::Vec<u8, 4> {
        self.with_device(address, |device| device.claimed_interfaces.clone())
            .unwrap_or_default()
    }

    pub fn transfer_count(&self) -> usize {
        self.state.lock(|state| state.borrow().transfers.len())
    }

    pub fn submit_count(&self, transfer: MockTransferHandle) -> u32 {
        self.state
            .lock(|state| state.borrow().transfers[transfer.0].submit_count)
    }

    pub fn is_freed(&self, transfer: MockTransferHandle) -> bool {
        self.state
            .lock(|state| state.borrow().transfers[transfer.0].freed)
    }

    /// The live MIDI IN transfer of a device, if one is set up.
    pub fn midi_in_transfer(
        &self,
        address: DeviceAddress,
    ) -> Option<(MockTransferHandle, EndpointAddress, usize)> {
        self.state.lock(|state| {
            let state = state.borrow();
            state
                .transfers
                .iter()
                .enumerate()
                .find(|(_, transfer)| {
                    transfer.device == MockDeviceHandle(address)
                        && transfer.endpoint.is_in()
                        && !transfer.freed
                })
                .map(|(index, transfer)| {
                    (MockTransferHandle(index), transfer.endpoint, transfer.size)
                })
        })
    }

    pub fn installed(&self) -> bool {
        self.state.lock(|state| state.borrow().installed)
    }

    pub fn uninstalled(&self) -> bool {
        self.state.lock(|state| state.borrow().uninstalled)
    }

    pub fn client_registered(&self) -> bool {
        self.state.lock(|state| state.borrow().client_registered)
    }

    pub fn client_deregistered(&self) -> bool {
        self.state.lock(|state| state.borrow().client_deregistered)
    }

    pub fn devices_freed(&self) -> bool {
        self.state.lock(|state| state.borrow().devices_freed)
    }

    fn with_device<R>(
        &self,
        address: DeviceAddress,
        f: impl FnOnce(&MockDevice) -> R,
    ) -> Option<R> {
        self.state.lock(|state| {
            let state = state.borrow();
            state.devices[address as usize].as_ref().map(f)
        })
    }
}

impl<M: RawMutex> Default for MockHost<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: RawMutex> UsbHostStack for MockHost<M> {
    type DeviceHandle = MockDeviceHandle;
    type TransferHandle = MockTransferHandle;

    fn install(&self) -> Result<(), HostError> {
        self.state.lock(|state| state.borrow_mut().installed = true);
        Ok(())
    }

    fn uninstall(&self) -> Result<(), HostError> {
        self.state
            .lock(|state| state.borrow_mut().uninstalled = true);
        Ok(())
    }

    async fn handle_stack_events(&self) -> StackEvent {
        self.stack_events.receive().await
    }

    fn free_all_devices(&self) -> Result<(), HostError> {
        self.state
            .lock(|state| state.borrow_mut().devices_freed = true);
        Ok(())
    }

    fn register_client(&self) -> Result<(), HostError> {
        self.state
            .lock(|state| state.borrow_mut().client_registered = true);
        Ok(())
    }

    fn deregister_client(&self) -> Result<(), HostError> {
        self.state
            .lock(|state| state.borrow_mut().client_deregistered = true);
        Ok(())
    }

    fn open_device(&self, address: DeviceAddress) -> Result<MockDeviceHandle, HostError> {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let device = state.devices[address as usize]
                .as_mut()
                .filter(|device| device.attached)
                .ok_or(HostError::NotFound)?;
            device.open = true;
            Ok(MockDeviceHandle(device.address))
        })
    }

    fn close_device(&self, device: MockDeviceHandle) -> Result<(), HostError> {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let device = state.devices[device.0 as usize]
                .as_mut()
                .ok_or(HostError::NotFound)?;
            device.open = false;
            device.close_count += 1;
            Ok(())
        })
    }

    fn read_config_descriptor(
        &self,
        device: MockDeviceHandle,
        buffer: &mut [u8],
    ) -> Result<usize, HostError> {
        self.state.lock(|state| {
            let state = state.borrow();
            let device = state.devices[device.0 as usize]
                .as_ref()
                .ok_or(HostError::NotFound)?;
            if buffer.len() < device.config.len() {
                return Err(HostError::InvalidParameter);
            }
            buffer[..device.config.len()].copy_from_slice(&device.config);
            Ok(device.config.len())
        })
    }

    fn claim_interface(
        &self,
        device: MockDeviceHandle,
        interface: u8,
        _alt_setting: u8,
    ) -> Result<(), HostError> {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let device = state.devices[device.0 as usize]
                .as_mut()
                .ok_or(HostError::NotFound)?;
            device
                .claimed_interfaces
                .push(interface)
                .map_err(|_| HostError::NoResources)?;
            Ok(())
        })
    }

    fn release_interface(&self, device: MockDeviceHandle, interface: u8) -> Result<(), HostError> {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let device = state.devices[device.0 as usize]
                .as_mut()
                .ok_or(HostError::NotFound)?;
            device.claimed_interfaces.retain(|claimed| *claimed != interface);
            Ok(())
        })
    }

    fn alloc_transfer(
        &self,
        device: MockDeviceHandle,
        endpoint: EndpointAddress,
        size: usize,
    ) -> Result<MockTransferHandle, HostError> {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let index = state.transfers.len();
            state
                .transfers
                .push(MockTransfer {
                    device,
                    endpoint,
                    size,
                    submit_count: 0,
                    freed: false,
                })
                .map_err(|_| HostError::NoResources)?;
            Ok(MockTransferHandle(index))
        })
    }

    fn submit_transfer(&self, transfer: MockTransferHandle) -> Result<(), HostError> {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let transfer = state
                .transfers
                .get_mut(transfer.0)
                .ok_or(HostError::NotFound)?;
            if transfer.freed {
                return Err(HostError::InvalidState);
            }
            transfer.submit_count += 1;
            Ok(())
        })
    }

    fn free_transfer(&self, transfer: MockTransferHandle) -> Result<(), HostError> {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let transfer = state
                .transfers
                .get_mut(transfer.0)
                .ok_or(HostError::NotFound)?;
            transfer.freed = true;
            Ok(())
        })
    }

    #[cfg(feature = "device-info")]
    fn device_info(&self, device: MockDeviceHandle) -> Result<DeviceInfo, HostError> {
        self.with_device(device.0, |_| DeviceInfo {
            speed: Speed::Full,
            configuration_value: 1,
        })
        .ok_or(HostError::NotFound)
    }

    #[cfg(feature = "device-info")]
    fn device_descriptor(&self, device: MockDeviceHandle) -> Result<DeviceDescriptor, HostError> {
        self.with_device(device.0, |_| DeviceDescriptor {
            vendor_id: 0x0882,
            product_id: 0x0001,
            device_class: 0x00,
            device_sub_class: 0x00,
            device_protocol: 0x00,
            num_configurations: 1,
        })
        .ok_or(HostError::NotFound)
    }

    #[cfg(feature = "device-info")]
    fn string_descriptor(
        &self,
        device: MockDeviceHandle,
        which: DeviceString,
    ) -> Option<heapless::String<64>> {
        self.with_device(device.0, |_| which)?;
        let string = match which {
            DeviceString::Manufacturer => "Mock Instruments",
            DeviceString::Product => "Scripted MIDI Keyboard",
            DeviceString::SerialNumber => "0000-0001",
        };
        heapless::String::try_from(string).ok()
    }
}
