#![no_std]
#![no_main]

mod display_task;
mod hardware;
mod midi_host_task;

use defmt::info;
use embassy_executor::Executor;
use static_cell::StaticCell;

use defmt_rtt as _;
use embassy_stm32 as _;
use panic_probe as _;

static EXECUTOR: StaticCell<Executor> = StaticCell::new();

#[cortex_m_rt::entry]
fn main() -> ! {
    let hardware = hardware::Hardware::get();

    let executor = EXECUTOR.init(Executor::new());
    executor.run(|spawner| {
        midi_host_task::setup(spawner, hardware.shutdown_button);
        spawner.spawn(display_task::display_task()).unwrap();

        info!("Hello, world!");
    })
}
