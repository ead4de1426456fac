use defmt::info;
use embassy_stm32::exti::ExtiInput;
use embassy_stm32::gpio::Pull;

pub struct Hardware<'a> {
    pub shutdown_button: ExtiInput<'a>,
}

impl<'a> Hardware<'a> {
    pub fn get() -> Hardware<'a> {
        info!("Initializing");
        let peripherals = embassy_stm32::init(Default::default());

        // user button, wired as the shutdown trigger
        let shutdown_button = ExtiInput::new(peripherals.PC13, peripherals.EXTI13, Pull::Up);

        Hardware { shutdown_button }
    }
}
