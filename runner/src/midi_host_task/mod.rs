use defmt::info;
use embassy_executor::Spawner;
use embassy_stm32::exti::ExtiInput;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use midi::{MidiEvent, MidiListener, UsbMidiPacket};
use midi_host::MidiHost;
use static_cell::StaticCell;

#[cfg(feature = "host-mock")]
pub mod host_mock;
#[cfg(feature = "host-mock")]
use host_mock as backend;

#[cfg(not(any(feature = "host-mock")))]
compile_error!("a USB host backend feature must be enabled (currently only \"host-mock\")");

pub const MIDI_CHANNEL_SIZE: usize = 16;

pub static MIDI_TASK_CHANNEL: Channel<CriticalSectionRawMutex, MidiEvent, MIDI_CHANNEL_SIZE> =
    Channel::new();

static HOST_READY: Signal<CriticalSectionRawMutex, ()> = Signal::new();

pub type Host = backend::Host;
pub type Driver = MidiHost<'static, CriticalSectionRawMutex, Host, fn(UsbMidiPacket)>;

static DRIVER: StaticCell<Driver> = StaticCell::new();

fn forward_packet(packet: UsbMidiPacket) {
    MidiListener::new(MIDI_TASK_CHANNEL.sender()).process_packet(&packet);
}

/// Brings the MIDI host up: host library first, then the driver seeded with
/// the packet callback, then the shutdown monitor. Must only be called once.
pub fn setup(spawner: Spawner, shutdown_button: ExtiInput<'static>) {
    spawner.spawn(setup_task(spawner, shutdown_button)).unwrap();
}

#[embassy_executor::task]
async fn setup_task(spawner: Spawner, shutdown_button: ExtiInput<'static>) {
    let host = backend::get();
    let driver: &'static Driver =
        DRIVER.init(MidiHost::new(host, forward_packet as fn(UsbMidiPacket)));

    spawner.spawn(host_library_task(host)).unwrap();
    HOST_READY.wait().await;

    spawner.spawn(driver_task(driver)).unwrap();
    spawner
        .spawn(shutdown_monitor_task(driver, shutdown_button))
        .unwrap();

    #[cfg(feature = "host-mock")]
    spawner.spawn(host_mock::stimulus_task(host, driver)).unwrap();
}

#[embassy_executor::task]
async fn host_library_task(host: &'static Host) {
    midi_host::host_library_task(host, &HOST_READY).await;
}

#[embassy_executor::task]
async fn driver_task(driver: &'static Driver) {
    driver.run().await;
    info!("MIDI host driver stopped");
}

#[embassy_executor::task]
async fn shutdown_monitor_task(driver: &'static Driver, mut shutdown_button: ExtiInput<'static>) {
    shutdown_button.wait_for_falling_edge().await;
    info!("Shutdown requested");
    driver.request_shutdown();
}
