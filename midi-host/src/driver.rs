//! The MIDI class driver proper: client event bridge, per-device state
//! machine, transfer engine, and the two long-running loops.

use core::cell::RefCell;

use defmt::{debug, error, info, warn};
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::signal::Signal;
use embassy_time::Timer;
use midi::packet::{self, UsbMidiPacket};

use crate::descriptor::{
    self, CONFIG_DESCRIPTOR_CAPACITY, DescriptorIter, EndpointDescriptor, InterfaceDescriptor,
};
#[cfg(feature = "device-info")]
use crate::host::DeviceString;
use crate::host::{
    ClientEvent, EndpointAddress, StackEvent, TransferComplete, TransferStatus, UsbHostStack,
};
use crate::registry::{Action, DEVICE_SLOTS, Registry};

/// The USB MIDI host driver.
///
/// Owns the device registry and runs the per-device state machine from
/// [`MidiHost::run`]. The host stack feeds it through
/// [`MidiHost::on_client_event`] (attach/detach) and
/// [`MidiHost::on_transfer_complete`] (finished IN transfers); both may be
/// called from any context the stack chooses.
pub struct MidiHost<'h, M: RawMutex, H: UsbHostStack, F: Fn(UsbMidiPacket)> {
    host: &'h H,
    registry: Mutex<M, RefCell<Registry<H::DeviceHandle, H::TransferHandle>>>,
    wake: Signal<M, ()>,
    on_packet: F,
}

impl<'h, M: RawMutex, H: UsbHostStack, F: Fn(UsbMidiPacket)> MidiHost<'h, M, H, F> {
    /// `on_packet` is called once per decoded MIDI packet, in wire order, from
    /// the transfer completion context. It must not block.
    pub fn new(host: &'h H, on_packet: F) -> Self {
        MidiHost {
            host,
            registry: Mutex::new(RefCell::new(Registry::new())),
            wake: Signal::new(),
            on_packet,
        }
    }

    /// Client event bridge. Translates stack notifications into registry
    /// mutations and wakes the driver loop.
    pub fn on_client_event(&self, event: ClientEvent<H::DeviceHandle>) {
        match event {
            ClientEvent::NewDevice { address } => {
                info!("New device connected");
                let accepted = self
                    .registry
                    .lock(|registry| registry.borrow_mut().register_attach(address));
                if !accepted {
                    warn!("No device slot for address {}", address);
                }
            }
            ClientEvent::DeviceGone { device } => {
                info!("Device disconnected");
                self.registry
                    .lock(|registry| registry.borrow_mut().register_detach(device));
            }
        }
        self.wake.signal(());
    }

    /// Transfer engine. Decodes a finished MIDI IN transfer, hands each packet
    /// to the callback and resubmits the transfer to keep the pipe open.
    ///
    /// A completion that is not a successful IN transfer is dropped without
    /// resubmission; that device stays silent until it is replugged.
    pub fn on_transfer_complete(&self, completion: TransferComplete<'_, H::TransferHandle>) {
        if completion.status != TransferStatus::Completed || !completion.endpoint.is_in() {
            return;
        }

        for midi_packet in packet::scan(completion.data) {
            (self.on_packet)(midi_packet);
        }

        if let Err(err) = self.host.submit_transfer(completion.transfer) {
            error!("Resubmitting MIDI IN transfer failed: {}", err);
        }
    }

    /// Marks every open device for close, raises the shutdown flag and
    /// unblocks [`MidiHost::run`]. Safe to call from an interrupt-driven
    /// context; the driver loop does the actual teardown.
    pub fn request_shutdown(&self) {
        self.registry
            .lock(|registry| registry.borrow_mut().mark_all_for_close_and_shutdown());
        self.wake.signal(());
    }

    /// Runs the driver until shutdown: drain queued device actions, otherwise
    /// park until the bridge signals new work.
    pub async fn run(&self) {
        info!("Registering client");
        if let Err(err) = self.host.register_client() {
            defmt::panic!("Registering the driver client failed: {}", err);
        }

        loop {
            if self.drain() {
                continue;
            }
            let shutdown = self
                .registry
                .lock(|registry| registry.borrow().shutdown_requested());
            if shutdown {
                break;
            }
            self.wake.wait().await;
        }

        info!("Deregistering class client");
        if let Err(err) = self.host.deregister_client() {
            defmt::panic!("Deregistering the driver client failed: {}", err);
        }
    }

    /// One pass over the registry: every slot with queued actions runs its
    /// state machine until its worklist stays empty. Returns whether any slot
    /// had work.
    pub fn drain(&self) -> bool {
        let pending = self.registry.lock(|registry| {
            let mut registry = registry.borrow_mut();
            if !registry.unhandled_devices() {
                return false;
            }
            // cleared before handling: events arriving mid-drain re-arm it
            registry.clear_unhandled_devices();
            true
        });
        if !pending {
            return false;
        }

        let mut did_work = false;
        for index in 0..DEVICE_SLOTS {
            let has_actions = self
                .registry
                .lock(|registry| registry.borrow().has_actions(index));
            if has_actions {
                did_work = true;
                self.handle_device(index);
            }
        }
        did_work
    }

    /// Drains one slot's worklist, re-reading it after every round because a
    /// phase may queue the next one (open queues setup, setup queues info).
    fn handle_device(&self, index: usize) {
        loop {
            let actions = self
                .registry
                .lock(|registry| registry.borrow_mut().take_actions(index));
            if actions.is_empty() {
                break;
            }
            for action in actions.in_priority_order() {
                match action {
                    Action::Open => self.action_open(index),
                    Action::SetupStreaming => self.action_setup_streaming(index),
                    #[cfg(feature = "device-info")]
                    Action::FetchInfo => self.action_fetch_info(index),
                    #[cfg(feature = "device-info")]
                    Action::FetchDeviceDescriptor => self.action_fetch_device_descriptor(index),
                    #[cfg(feature = "device-info")]
                    Action::FetchConfigDescriptor => self.action_fetch_config_descriptor(index),
                    #[cfg(feature = "device-info")]
                    Action::FetchStringDescriptors => self.action_fetch_string_descriptors(index),
                    Action::Close => self.action_close(index),
                    #[cfg(not(feature = "device-info"))]
                    _ => {}
                }
            }
        }
    }

    fn action_open(&self, index: usize) {
        let address = self
            .registry
            .lock(|registry| registry.borrow().address(index));
        defmt::assert!(address != 0);
        info!("Opening device at address {}", address);
        let device = match self.host.open_device(address) {
            Ok(device) => device,
            Err(err) => defmt::panic!("Opening device at address {} failed: {}", address, err),
        };
        self.registry.lock(|registry| {
            let mut registry = registry.borrow_mut();
            registry.set_device(index, device);
            registry.enqueue(index, Action::SetupStreaming);
        });
    }

    /// Walks the active configuration, claims the MIDI-streaming interface and
    /// brings up the persistent transfer on its bulk IN endpoint.
    fn action_setup_streaming(&self, index: usize) {
        let Some(device) = self
            .registry
            .lock(|registry| registry.borrow().device(index))
        else {
            defmt::panic!("MIDI setup queued for a device that was never opened");
        };

        let mut buffer = [0u8; CONFIG_DESCRIPTOR_CAPACITY];
        let length = match self.host.read_config_descriptor(device, &mut buffer) {
            Ok(length) => length,
            Err(err) => defmt::panic!("Reading the active config descriptor failed: {}", err),
        };

        // Set while reading descriptors that belong to the claimed MIDI
        // streaming interface.
        let mut in_midi_interface = false;
        let mut midi_in_endpoint_ready = false;

        for record in DescriptorIter::new(&buffer[..length]) {
            let record = match record {
                Ok(record) => record,
                Err(_) => {
                    debug!("USB descriptor invalid");
                    return;
                }
            };
            match record.descriptor_type {
                descriptor::TYPE_INTERFACE => {
                    let Some(interface) = InterfaceDescriptor::parse(record.bytes) else {
                        debug!("USB descriptor invalid");
                        return;
                    };
                    if interface.is_midi_streaming() {
                        in_midi_interface = true;
                        debug!(
                            "Claiming a MIDI interface! number: {}, alt: {}",
                            interface.interface_number, interface.alternate_setting
                        );
                        if let Err(err) = self.host.claim_interface(
                            device,
                            interface.interface_number,
                            interface.alternate_setting,
                        ) {
                            defmt::panic!(
                                "Claiming MIDI interface {} failed: {}",
                                interface.interface_number,
                                err
                            );
                        }
                        // remembered so close can release the interface later
                        self.registry.lock(|registry| {
                            registry
                                .borrow_mut()
                                .set_claimed_interface(index, interface.interface_number)
                        });
                    } else {
                        in_midi_interface = false;
                    }
                }
                descriptor::TYPE_ENDPOINT => {
                    if !in_midi_interface {
                        continue;
                    }
                    let Some(endpoint) = EndpointDescriptor::parse(record.bytes) else {
                        debug!("USB descriptor invalid");
                        return;
                    };
                    if !endpoint.is_bulk() {
                        debug!("Not a bulk endpoint: 0x{=u8:x}", endpoint.attributes);
                        continue;
                    }
                    if endpoint.is_in() {
                        if midi_in_endpoint_ready {
                            continue;
                        }
                        debug!(
                            "Setting up MIDI IN endpoint from address 0x{=u8:x}",
                            endpoint.endpoint_address
                        );
                        let transfer = match self.host.alloc_transfer(
                            device,
                            EndpointAddress(endpoint.endpoint_address),
                            endpoint.max_packet_size as usize,
                        ) {
                            Ok(transfer) => transfer,
                            Err(err) => {
                                defmt::panic!("Allocating the MIDI IN transfer failed: {}", err)
                            }
                        };
                        if let Err(err) = self.host.submit_transfer(transfer) {
                            defmt::panic!("Submitting the MIDI IN transfer failed: {}", err);
                        }
                        self.registry.lock(|registry| {
                            registry.borrow_mut().set_midi_in_transfer(index, transfer)
                        });
                        midi_in_endpoint_ready = true;
                        info!("MIDI device connected");
                    } else {
                        debug!(
                            "Found MIDI OUT endpoint at address 0x{=u8:x}",
                            endpoint.endpoint_address
                        );
                    }
                }
                _ => {}
            }
        }

        #[cfg(feature = "device-info")]
        self.registry
            .lock(|registry| registry.borrow_mut().enqueue(index, Action::FetchInfo));
    }

    #[cfg(feature = "device-info")]
    fn action_fetch_info(&self, index: usize) {
        let Some(device) = self
            .registry
            .lock(|registry| registry.borrow().device(index))
        else {
            return;
        };
        info!("Getting device information");
        match self.host.device_info(device) {
            Ok(device_info) => {
                info!("\t{} speed", device_info.speed);
                info!("\tbConfigurationValue {}", device_info.configuration_value);
            }
            Err(err) => debug!("Querying device information failed: {}", err),
        }
        self.registry.lock(|registry| {
            registry
                .borrow_mut()
                .enqueue(index, Action::FetchDeviceDescriptor)
        });
    }

    #[cfg(feature = "device-info")]
    fn action_fetch_device_descriptor(&self, index: usize) {
        let Some(device) = self
            .registry
            .lock(|registry| registry.borrow().device(index))
        else {
            return;
        };
        info!("Getting device descriptor");
        match self.host.device_descriptor(device) {
            Ok(device_descriptor) => {
                info!(
                    "\tidVendor 0x{=u16:x} idProduct 0x{=u16:x}",
                    device_descriptor.vendor_id, device_descriptor.product_id
                );
                info!(
                    "\tbDeviceClass {} bNumConfigurations {}",
                    device_descriptor.device_class, device_descriptor.num_configurations
                );
            }
            Err(err) => debug!("Querying the device descriptor failed: {}", err),
        }
        self.registry.lock(|registry| {
            registry
                .borrow_mut()
                .enqueue(index, Action::FetchConfigDescriptor)
        });
    }

    #[cfg(feature = "device-info")]
    fn action_fetch_config_descriptor(&self, index: usize) {
        let Some(device) = self
            .registry
            .lock(|registry| registry.borrow().device(index))
        else {
            return;
        };
        info!("Getting config descriptor");
        let mut buffer = [0u8; CONFIG_DESCRIPTOR_CAPACITY];
        match self.host.read_config_descriptor(device, &mut buffer) {
            Ok(length) => {
                let interfaces = DescriptorIter::new(&buffer[..length])
                    .map_while(Result::ok)
                    .filter(|record| record.descriptor_type == descriptor::TYPE_INTERFACE)
                    .count();
                info!(
                    "\twTotalLength {} with {} interface descriptors",
                    length, interfaces
                );
            }
            Err(err) => debug!("Querying the config descriptor failed: {}", err),
        }
        self.registry.lock(|registry| {
            registry
                .borrow_mut()
                .enqueue(index, Action::FetchStringDescriptors)
        });
    }

    #[cfg(feature = "device-info")]
    fn action_fetch_string_descriptors(&self, index: usize) {
        let Some(device) = self
            .registry
            .lock(|registry| registry.borrow().device(index))
        else {
            return;
        };
        for which in [
            DeviceString::Manufacturer,
            DeviceString::Product,
            DeviceString::SerialNumber,
        ] {
            if let Some(string) = self.host.string_descriptor(device, which) {
                info!("\t{}: {}", which, string.as_str());
            }
        }
        // no actions next
    }

    /// Tears a slot down: free the transfer, release the interface, close the
    /// handle, reset the slot. A no-op when the slot is already closed.
    fn action_close(&self, index: usize) {
        let (device, claimed_interface, transfer) = self.registry.lock(|registry| {
            let registry = registry.borrow();
            let slot = registry.slot(index);
            (
                slot.device(),
                slot.claimed_interface(),
                slot.midi_in_transfer(),
            )
        });

        let Some(device) = device else {
            return;
        };

        if let Some(transfer) = transfer {
            if let Err(err) = self.host.free_transfer(transfer) {
                error!("Freeing the MIDI IN transfer failed: {}", err);
            }
            if let Some(interface) = claimed_interface {
                if let Err(err) = self.host.release_interface(device, interface) {
                    error!("Releasing MIDI interface {} failed: {}", interface, err);
                }
            }
        }

        if let Err(err) = self.host.close_device(device) {
            defmt::panic!("Closing the device failed: {}", err);
        }
        self.registry
            .lock(|registry| registry.borrow_mut().reset_slot(index));
    }

    #[cfg(test)]
    pub(crate) fn force_action(&self, index: usize, action: Action) {
        self.registry.lock(|registry| {
            let mut registry = registry.borrow_mut();
            registry.enqueue(index, action);
            registry.mark_unhandled();
        });
    }

    #[cfg(test)]
    pub(crate) fn inspect_registry<R>(
        &self,
        f: impl FnOnce(&Registry<H::DeviceHandle, H::TransferHandle>) -> R,
    ) -> R {
        self.registry.lock(|registry| f(&registry.borrow()))
    }
}

/// Installs the host stack, signals readiness and pumps its event loop until
/// the last client deregistered, then uninstalls it again.
pub async fn host_library_task<M: RawMutex, H: UsbHostStack>(host: &H, ready: &Signal<M, ()>) {
    debug!("Installing USB host");
    if let Err(err) = host.install() {
        defmt::panic!("Installing the USB host stack failed: {}", err);
    }
    ready.signal(());

    debug!("Starting USB events handling");
    loop {
        let event: StackEvent = host.handle_stack_events().await;
        // the driver client deregistered, stop event handling
        if event.no_clients {
            if let Err(err) = host.free_all_devices() {
                defmt::panic!("Freeing USB devices failed: {}", err);
            }
            break;
        }
    }

    debug!("Shutting down USB");
    Timer::after_millis(10).await; // short delay to allow clients clean-up
    if let Err(err) = host.uninstall() {
        defmt::panic!("Uninstalling the USB host stack failed: {}", err);
    }
}
