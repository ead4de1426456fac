//! Scripted host backend.
//!
//! Exercises the whole driver end to end on a board that has no USB host
//! silicon wired up yet: a keyboard appears on the simulated bus shortly
//! after boot and plays a rising scale until the shutdown button is pressed.

use defmt::info;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::Timer;
use midi_host::mock::MockHost;
use midi_host::{ClientEvent, TransferComplete, TransferStatus};
use static_cell::StaticCell;

use super::Driver;

pub type Host = MockHost<CriticalSectionRawMutex>;

static HOST: StaticCell<Host> = StaticCell::new();

pub fn get() -> &'static Host {
    HOST.init(MockHost::new())
}

const SCRIPTED_ADDRESS: u8 = 3;

/// One MIDI-streaming interface with a bulk IN and a bulk OUT endpoint.
const SCRIPTED_CONFIG: [u8; 32] = [
    9, 2, 32, 0, 1, 1, 0, 0x80, 50, // configuration
    9, 4, 0, 0, 2, 1, 3, 0, 0, // MIDI streaming interface
    7, 5, 0x81, 0x02, 64, 0, 0, // bulk IN endpoint
    7, 5, 0x02, 0x02, 64, 0, 0, // bulk OUT endpoint
];

#[embassy_executor::task]
pub async fn stimulus_task(host: &'static Host, driver: &'static Driver) {
    Timer::after_millis(100).await;
    info!("Scripting a keyboard at address {}", SCRIPTED_ADDRESS);
    host.attach(SCRIPTED_ADDRESS, &SCRIPTED_CONFIG);
    driver.on_client_event(ClientEvent::NewDevice {
        address: SCRIPTED_ADDRESS,
    });

    let mut step: u8 = 0;
    loop {
        Timer::after_millis(400).await;
        let Some((transfer, endpoint, _)) = host.midi_in_transfer(SCRIPTED_ADDRESS) else {
            continue;
        };

        let key = 60 + step;
        let note_on = [0x09, 0x90, key, 0x64, 0x00, 0x00, 0x00, 0x00];
        driver.on_transfer_complete(TransferComplete {
            transfer,
            endpoint,
            status: TransferStatus::Completed,
            data: &note_on,
        });

        Timer::after_millis(200).await;
        let note_off = [0x08, 0x80, key, 0x00, 0x00, 0x00, 0x00, 0x00];
        driver.on_transfer_complete(TransferComplete {
            transfer,
            endpoint,
            status: TransferStatus::Completed,
            data: &note_off,
        });

        step = (step + 1) % 12;
    }
}
