use embassy_sync::{blocking_mutex::raw::NoopRawMutex, channel::Channel};
use pretty_assertions::assert_eq;

use crate::packet::UsbMidiPacket;
use crate::{MidiEvent, MidiListener, packet};

// defmt needs a logger at link time even though the test harness prints nothing
#[defmt::global_logger]
struct NopLogger;

unsafe impl defmt::Logger for NopLogger {
    fn acquire() {}
    unsafe fn flush() {}
    unsafe fn release() {}
    unsafe fn write(_bytes: &[u8]) {}
}

macro_rules! setup {
    ($receiver:ident, $midi_listener:ident) => {
        let channel = Channel::<NoopRawMutex, MidiEvent, 4>::new();
        let sender = channel.sender();
        let $receiver = channel.receiver();
        let $midi_listener = MidiListener::new(sender);
    };
}

fn note_on_packet(channel: u8, key: u8, vel: u8) -> UsbMidiPacket {
    UsbMidiPacket::decode([0x09, 0x90 | channel, key, vel])
}

fn note_off_packet(channel: u8, key: u8, vel: u8) -> UsbMidiPacket {
    UsbMidiPacket::decode([0x08, 0x80 | channel, key, vel])
}

#[test]
fn decode_unpacks_the_nibble_fields() {
    let packet = UsbMidiPacket::decode([0x19, 0x92, 0x40, 0x7f]);

    assert_eq!(
        packet,
        UsbMidiPacket {
            cable_number: 1,
            code_index: 9,
            midi_channel: 2,
            midi_type: 9,
            data_1: 0x40,
            data_2: 0x7f,
        }
    );
}

#[test]
fn decode_then_encode_reproduces_the_wire_bytes() {
    let samples: [[u8; 4]; 4] = [
        [0x09, 0x90, 0x40, 0x7f],
        [0x08, 0x81, 0x3c, 0x00],
        [0x0b, 0xb0, 0x40, 0x7f],
        [0xff, 0xff, 0xff, 0xff],
    ];

    for bytes in samples {
        assert_eq!(UsbMidiPacket::decode(bytes).encode(), bytes);
    }
}

#[test]
fn an_all_zero_record_is_a_terminator() {
    assert!(UsbMidiPacket::decode([0, 0, 0, 0]).is_terminator());
    assert!(!UsbMidiPacket::decode([0, 0, 0, 1]).is_terminator());
}

#[test]
fn scan_stops_before_the_first_terminator() {
    let buffer = [0x09, 0x90, 0x40, 0x7f, 0x00, 0x00, 0x00, 0x00, 0x08, 0x80, 0x40, 0x00];

    let packets: Vec<UsbMidiPacket> = packet::scan(&buffer).collect();

    assert_eq!(packets, vec![note_on_packet(0, 0x40, 0x7f)]);
}

#[test]
fn scan_without_terminator_yields_every_whole_record() {
    let buffer = [0x09, 0x90, 0x40, 0x7f, 0x08, 0x80, 0x40, 0x00, 0x09, 0x91];

    let packets: Vec<UsbMidiPacket> = packet::scan(&buffer).collect();

    // the trailing partial record is dropped
    assert_eq!(
        packets,
        vec![note_on_packet(0, 0x40, 0x7f), note_off_packet(0, 0x40, 0x00)]
    );
}

#[test]
fn when_receiving_note_packets_it_forwards_the_events() {
    setup!(receiver, midi_listener);

    midi_listener.process_packet(&note_on_packet(0, 60, 100));
    midi_listener.process_packet(&note_off_packet(3, 60, 0));

    let mut output_buffer: Vec<MidiEvent> = Vec::new();
    while let Ok(event) = receiver.try_receive() {
        output_buffer.push(event);
    }

    assert_eq!(
        output_buffer.as_slice(),
        &[
            MidiEvent::NoteOn { key: 60, vel: 100 },
            MidiEvent::NoteOff { key: 60, vel: 0 },
        ]
    );
}

#[test]
fn when_receiving_a_control_change_it_forwards_the_event() {
    setup!(receiver, midi_listener);

    // sustain pedal down
    midi_listener.process_packet(&UsbMidiPacket::decode([0x0b, 0xb0, 64, 127]));

    assert_eq!(
        receiver.try_receive(),
        Ok(MidiEvent::ControlChange {
            controller: 64,
            value: 127,
        })
    );
}

#[test]
fn when_receiving_an_unhandled_message_it_is_dropped() {
    setup!(receiver, midi_listener);

    // pitch bend
    midi_listener.process_packet(&UsbMidiPacket::decode([0x0e, 0xe0, 0x00, 0x40]));

    assert!(receiver.try_receive().is_err());
}

#[test]
fn when_overflowing_it_discards_the_overflow() {
    setup!(receiver, midi_listener);

    for key in 0..6u8 {
        midi_listener.process_packet(&note_on_packet(0, key, key));
    }

    let mut output_buffer: Vec<MidiEvent> = Vec::new();
    while let Ok(event) = receiver.try_receive() {
        output_buffer.push(event);
    }

    assert_eq!(
        output_buffer.as_slice(),
        &[
            MidiEvent::NoteOn { key: 0, vel: 0 },
            MidiEvent::NoteOn { key: 1, vel: 1 },
            MidiEvent::NoteOn { key: 2, vel: 2 },
            MidiEvent::NoteOn { key: 3, vel: 3 },
        ]
    );
}
