use defmt::info;
use midi::MidiEvent;

use crate::midi_host_task::MIDI_TASK_CHANNEL;

/// Stand-in for the light-rendering layer: consumes decoded events from the
/// MIDI channel and reports them.
#[embassy_executor::task]
pub async fn display_task() {
    info!("Display: task starting");

    let receiver = MIDI_TASK_CHANNEL.receiver();

    loop {
        let event = receiver.receive().await;
        match event {
            MidiEvent::NoteOn { key, vel } => info!("Note on: key {} velocity {}", key, vel),
            MidiEvent::NoteOff { key, vel: _ } => info!("Note off: key {}", key),
            MidiEvent::ControlChange { controller, value } => {
                info!("Control change: controller {} value {}", controller, value)
            }
        }
    }
}
