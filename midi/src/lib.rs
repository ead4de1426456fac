#![cfg_attr(not(test), no_std)]

pub mod packet;

use defmt::{Format, trace};
use embassy_sync::{blocking_mutex::raw::RawMutex, channel::Sender};
use midly::{MidiMessage, live::LiveEvent};

pub use packet::UsbMidiPacket;

#[derive(Format, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiEvent {
    NoteOff { key: u8, vel: u8 },
    NoteOn { key: u8, vel: u8 },
    ControlChange { controller: u8, value: u8 },
}

/// Turns USB MIDI packets into [`MidiEvent`]s on a channel.
///
/// Each packet carries one complete MIDI message, so no stream state is kept.
pub struct MidiListener<'ch, M: RawMutex, const N: usize> {
    sender: Sender<'ch, M, MidiEvent, N>,
}

impl<'ch, M: RawMutex, const N: usize> MidiListener<'ch, M, N> {
    pub fn new(sender: Sender<'ch, M, MidiEvent, N>) -> Self {
        MidiListener { sender }
    }

    pub fn process_packet(&self, packet: &UsbMidiPacket) {
        let bytes = packet.midi_bytes();
        let Ok(event) = LiveEvent::parse(&bytes) else {
            return;
        };

        if let LiveEvent::Midi {
            channel: _,
            message,
        } = event
        {
            let event_to_add: MidiEvent = match message {
                MidiMessage::NoteOff { key, vel } => MidiEvent::NoteOff {
                    key: key.into(),
                    vel: vel.into(),
                },
                MidiMessage::NoteOn { key, vel } => MidiEvent::NoteOn {
                    key: key.into(),
                    vel: vel.into(),
                },
                MidiMessage::Controller { controller, value } => MidiEvent::ControlChange {
                    controller: controller.into(),
                    value: value.into(),
                },
                _ => return,
            };

            trace!("Adding event: {:#?}", event_to_add);

            // only fails if full. if full, the message should be discarded anyways
            self.sender.try_send(event_to_add).ok();
        }
    }
}

#[cfg(test)]
mod test;
