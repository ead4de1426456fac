use embassy_futures::join::join;
use embassy_futures::{block_on, yield_now};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use midi::packet::UsbMidiPacket;
use pretty_assertions::assert_eq;

use crate::driver::{MidiHost, host_library_task};
use crate::host::{ClientEvent, EndpointAddress, StackEvent, TransferComplete, TransferStatus};
use crate::mock::MockHost;
use crate::registry::{Action, ActionSet, Registry};

// defmt needs a logger at link time even though the test harness prints nothing
#[defmt::global_logger]
struct NopLogger;

unsafe impl defmt::Logger for NopLogger {
    fn acquire() {}
    unsafe fn flush() {}
    unsafe fn release() {}
    unsafe fn write(_bytes: &[u8]) {}
}

defmt::timestamp!("{=u32}", 0);

#[defmt::panic_handler]
fn defmt_panic() -> ! {
    core::panic!()
}

macro_rules! setup {
    ($mock:ident, $driver:ident, $packets:ident) => {
        let $mock = MockHost::<NoopRawMutex>::new();
        let channel = Channel::<NoopRawMutex, UsbMidiPacket, 32>::new();
        let sender = channel.sender();
        let $packets = channel.receiver();
        let $driver: MidiHost<'_, NoopRawMutex, _, _> = MidiHost::new(&$mock, move |packet| {
            sender.try_send(packet).ok();
        });
    };
}

/// Configuration blob of a typical USB MIDI keyboard: an audio-control
/// interface, then the MIDI-streaming interface with a bulk OUT and a bulk IN
/// endpoint.
fn midi_config(extra_in_endpoint: bool) -> Vec<u8> {
    let mut bytes: Vec<u8> = vec![9, 2, 0, 0, 2, 1, 0, 0x80, 50];
    bytes.extend([9, 4, 0, 0, 0, 1, 1, 0, 0]);
    bytes.extend([9, 4, 1, 0, 2, 1, 3, 0, 0]);
    bytes.extend([7, 5, 0x02, 0x02, 64, 0, 0]);
    bytes.extend([7, 5, 0x81, 0x02, 64, 0, 0]);
    if extra_in_endpoint {
        bytes.extend([7, 5, 0x82, 0x02, 64, 0, 0]);
    }
    let total = bytes.len() as u16;
    bytes[2..4].copy_from_slice(&total.to_le_bytes());
    bytes
}

#[test]
fn attach_then_drain_brings_up_streaming() {
    setup!(mock, driver, _packets);
    mock.attach(3, &midi_config(false));

    driver.on_client_event(ClientEvent::NewDevice { address: 3 });
    assert!(driver.drain());

    assert!(mock.is_open(3));
    assert_eq!(mock.claimed_interfaces(3).as_slice(), &[1u8][..]);
    let (transfer, endpoint, size) = mock.midi_in_transfer(3).unwrap();
    assert_eq!(endpoint, EndpointAddress(0x81));
    assert_eq!(size, 64);
    assert_eq!(mock.submit_count(transfer), 1);

    driver.inspect_registry(|registry| {
        let slot = registry.slot(3);
        assert_eq!(slot.address(), 3);
        assert!(slot.device().is_some());
        assert_eq!(slot.claimed_interface(), Some(1));
        assert!(slot.midi_in_transfer().is_some());
        assert!(slot.actions().is_empty());
    });
}

#[test]
fn a_second_bulk_in_endpoint_is_ignored() {
    setup!(mock, driver, _packets);
    mock.attach(3, &midi_config(true));

    driver.on_client_event(ClientEvent::NewDevice { address: 3 });
    assert!(driver.drain());

    assert_eq!(mock.transfer_count(), 1);
    let (_, endpoint, _) = mock.midi_in_transfer(3).unwrap();
    assert_eq!(endpoint, EndpointAddress(0x81));
}

#[test]
fn detach_then_drain_resets_the_slot() {
    setup!(mock, driver, _packets);
    mock.attach(3, &midi_config(false));
    driver.on_client_event(ClientEvent::NewDevice { address: 3 });
    assert!(driver.drain());
    let (transfer, _, _) = mock.midi_in_transfer(3).unwrap();

    let handle = mock.detach(3);
    driver.on_client_event(ClientEvent::DeviceGone { device: handle });
    assert!(driver.drain());

    assert!(mock.is_freed(transfer));
    assert!(!mock.is_open(3));
    assert!(mock.claimed_interfaces(3).is_empty());
    driver.inspect_registry(|registry| {
        let slot = registry.slot(3);
        assert_eq!(slot.address(), 0);
        assert!(slot.device().is_none());
        assert!(slot.claimed_interface().is_none());
        assert!(slot.midi_in_transfer().is_none());
    });
}

#[test]
fn close_on_an_already_closed_slot_is_a_no_op() {
    setup!(mock, driver, _packets);
    mock.attach(3, &midi_config(false));
    driver.on_client_event(ClientEvent::NewDevice { address: 3 });
    driver.drain();
    let handle = mock.detach(3);
    driver.on_client_event(ClientEvent::DeviceGone { device: handle });
    driver.drain();
    let closes = mock.close_count(3);

    driver.force_action(3, Action::Close);
    assert!(driver.drain());

    assert_eq!(mock.close_count(3), closes);
    driver.inspect_registry(|registry| {
        let slot = registry.slot(3);
        assert_eq!(slot.address(), 0);
        assert!(slot.device().is_none());
        assert!(slot.actions().is_empty());
    });
}

#[test]
fn a_malformed_descriptor_leaves_the_device_without_streaming() {
    setup!(mock, driver, _packets);
    let mut config = midi_config(false);
    // the audio-control interface record now claims to run past the blob
    config[9] = 200;
    mock.attach(3, &config);

    driver.on_client_event(ClientEvent::NewDevice { address: 3 });
    assert!(driver.drain());

    assert!(mock.is_open(3));
    assert!(mock.claimed_interfaces(3).is_empty());
    assert!(mock.midi_in_transfer(3).is_none());
    driver.inspect_registry(|registry| {
        assert!(registry.slot(3).actions().is_empty());
    });
}

#[test]
fn a_completed_in_transfer_forwards_packets_and_resubmits() {
    setup!(mock, driver, packets);
    mock.attach(3, &midi_config(false));
    driver.on_client_event(ClientEvent::NewDevice { address: 3 });
    driver.drain();
    let (transfer, endpoint, _) = mock.midi_in_transfer(3).unwrap();

    let data = [0x09, 0x90, 0x40, 0x7f, 0x00, 0x00, 0x00, 0x00];
    driver.on_transfer_complete(TransferComplete {
        transfer,
        endpoint,
        status: TransferStatus::Completed,
        data: &data,
    });

    assert_eq!(
        packets.try_receive(),
        Ok(UsbMidiPacket {
            cable_number: 0,
            code_index: 9,
            midi_channel: 0,
            midi_type: 9,
            data_1: 0x40,
            data_2: 0x7f,
        })
    );
    // the all-zero record terminates the scan
    assert!(packets.try_receive().is_err());
    assert_eq!(mock.submit_count(transfer), 2);
}

#[test]
fn a_failed_transfer_is_dropped_without_resubmission() {
    setup!(mock, driver, packets);
    mock.attach(3, &midi_config(false));
    driver.on_client_event(ClientEvent::NewDevice { address: 3 });
    driver.drain();
    let (transfer, endpoint, _) = mock.midi_in_transfer(3).unwrap();

    let data = [0x09, 0x90, 0x40, 0x7f];
    driver.on_transfer_complete(TransferComplete {
        transfer,
        endpoint,
        status: TransferStatus::Error,
        data: &data,
    });

    assert!(packets.try_receive().is_err());
    assert_eq!(mock.submit_count(transfer), 1);
}

#[test]
fn a_non_in_completion_is_dropped() {
    setup!(mock, driver, packets);
    mock.attach(3, &midi_config(false));
    driver.on_client_event(ClientEvent::NewDevice { address: 3 });
    driver.drain();
    let (transfer, _, _) = mock.midi_in_transfer(3).unwrap();

    let data = [0x09, 0x90, 0x40, 0x7f];
    driver.on_transfer_complete(TransferComplete {
        transfer,
        endpoint: EndpointAddress(0x02),
        status: TransferStatus::Completed,
        data: &data,
    });

    assert!(packets.try_receive().is_err());
    assert_eq!(mock.submit_count(transfer), 1);
}

#[test]
fn an_attach_beyond_the_slot_table_is_ignored() {
    setup!(mock, driver, _packets);

    driver.on_client_event(ClientEvent::NewDevice { address: 9 });

    assert!(!driver.drain());
}

#[test]
fn shutdown_closes_open_devices_and_deregisters_the_client() {
    setup!(mock, driver, _packets);
    mock.attach(3, &midi_config(false));
    mock.attach(5, &midi_config(false));

    block_on(join(driver.run(), async {
        driver.on_client_event(ClientEvent::NewDevice { address: 3 });
        driver.on_client_event(ClientEvent::NewDevice { address: 5 });
        while !(mock.is_open(3) && mock.is_open(5)) {
            yield_now().await;
        }
        driver.request_shutdown();
    }));

    assert!(!mock.is_open(3));
    assert!(!mock.is_open(5));
    assert!(mock.client_registered());
    assert!(mock.client_deregistered());
    driver.inspect_registry(|registry| {
        assert!(registry.slot(3).device().is_none());
        assert!(registry.slot(5).device().is_none());
    });
}

#[test]
fn the_host_library_task_tears_down_once_no_clients_remain() {
    let mock = MockHost::<NoopRawMutex>::new();
    let ready = Signal::<NoopRawMutex, ()>::new();

    block_on(join(host_library_task(&mock, &ready), async {
        ready.wait().await;
        assert!(mock.installed());
        mock.post_stack_event(StackEvent {
            no_clients: true,
            all_freed: false,
        });
    }));

    assert!(mock.devices_freed());
    assert!(mock.uninstalled());
}

mod registry {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn a_detach_overwrites_every_other_pending_action() {
        let mut registry = Registry::<u8, u8>::new();
        registry.register_attach(2);
        registry.set_device(2, 7);
        registry.enqueue(2, Action::FetchInfo);

        registry.register_detach(7);

        assert_eq!(registry.slot(2).actions(), ActionSet::only(Action::Close));
        assert!(registry.unhandled_devices());
    }

    #[test]
    fn a_detach_of_an_unknown_handle_changes_nothing() {
        let mut registry = Registry::<u8, u8>::new();
        registry.register_attach(2);
        registry.clear_unhandled_devices();

        registry.register_detach(9);

        assert!(!registry.unhandled_devices());
        assert_eq!(registry.slot(2).actions(), ActionSet::only(Action::Open));
    }

    #[test]
    fn marking_for_shutdown_only_queues_close_for_open_devices() {
        let mut registry = Registry::<u8, u8>::new();
        registry.register_attach(1);
        registry.register_attach(2);
        registry.set_device(2, 7);
        registry.clear_unhandled_devices();

        registry.mark_all_for_close_and_shutdown();

        assert!(registry.shutdown_requested());
        assert!(registry.unhandled_devices());
        assert!(!registry.slot(1).actions().contains(Action::Close));
        assert!(registry.slot(2).actions().contains(Action::Close));
    }

    #[test]
    fn marking_for_shutdown_with_no_devices_only_raises_the_flag() {
        let mut registry = Registry::<u8, u8>::new();

        registry.mark_all_for_close_and_shutdown();

        assert!(registry.shutdown_requested());
        assert!(!registry.unhandled_devices());
    }

    #[test]
    fn take_actions_snapshots_and_clears_the_worklist() {
        let mut registry = Registry::<u8, u8>::new();
        registry.register_attach(4);

        let actions = registry.take_actions(4);

        assert_eq!(actions, ActionSet::only(Action::Open));
        assert!(registry.slot(4).actions().is_empty());
    }

    #[test]
    fn actions_run_in_fixed_priority_order() {
        let mut actions = ActionSet::EMPTY;
        actions.insert(Action::Close);
        actions.insert(Action::SetupStreaming);
        actions.insert(Action::Open);

        let ordered: Vec<Action> = actions.in_priority_order().collect();

        assert_eq!(
            ordered,
            vec![Action::Open, Action::SetupStreaming, Action::Close]
        );
    }
}
