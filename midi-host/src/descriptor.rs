//! Raw configuration-descriptor parsing.
//!
//! The stack hands over the active configuration as one opaque byte blob; this
//! module walks it record by record so the driver can pick out the
//! MIDI-streaming interface and its bulk IN endpoint.

pub const TYPE_INTERFACE: u8 = 0x04;
pub const TYPE_ENDPOINT: u8 = 0x05;

pub const CLASS_AUDIO: u8 = 0x01;
pub const SUBCLASS_MIDI_STREAMING: u8 = 0x03;

const ENDPOINT_DIR_IN_MASK: u8 = 0x80;
const TRANSFER_TYPE_MASK: u8 = 0x03;
const TRANSFER_TYPE_BULK: u8 = 0x02;

const INTERFACE_DESCRIPTOR_LENGTH: usize = 9;
const ENDPOINT_DESCRIPTOR_LENGTH: usize = 7;

/// Largest active configuration the driver is prepared to walk.
pub const CONFIG_DESCRIPTOR_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MalformedDescriptor;

/// One raw descriptor record: its type byte and the full record bytes.
#[derive(Debug, Clone, Copy)]
pub struct Descriptor<'a> {
    pub descriptor_type: u8,
    pub bytes: &'a [u8],
}

/// Iterates the records of a configuration blob. Yields an error and then
/// ends as soon as a record's length field runs past the blob.
pub struct DescriptorIter<'a> {
    data: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> DescriptorIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        DescriptorIter {
            data,
            offset: 0,
            failed: false,
        }
    }
}

impl<'a> Iterator for DescriptorIter<'a> {
    type Item = Result<Descriptor<'a>, MalformedDescriptor>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.data.len() {
            return None;
        }
        let remaining = &self.data[self.offset..];
        let length = remaining[0] as usize;
        if length < 2 || length > remaining.len() {
            self.failed = true;
            return Some(Err(MalformedDescriptor));
        }
        self.offset += length;
        Some(Ok(Descriptor {
            descriptor_type: remaining[1],
            bytes: &remaining[..length],
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub interface_class: u8,
    pub interface_sub_class: u8,
    pub interface_protocol: u8,
}

impl InterfaceDescriptor {
    pub fn parse(bytes: &[u8]) -> Option<InterfaceDescriptor> {
        if bytes.len() < INTERFACE_DESCRIPTOR_LENGTH {
            return None;
        }
        Some(InterfaceDescriptor {
            interface_number: bytes[2],
            alternate_setting: bytes[3],
            interface_class: bytes[5],
            interface_sub_class: bytes[6],
            interface_protocol: bytes[7],
        })
    }

    pub fn is_midi_streaming(&self) -> bool {
        self.interface_class == CLASS_AUDIO
            && self.interface_sub_class == SUBCLASS_MIDI_STREAMING
            && self.interface_protocol == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub endpoint_address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
}

impl EndpointDescriptor {
    pub fn parse(bytes: &[u8]) -> Option<EndpointDescriptor> {
        if bytes.len() < ENDPOINT_DESCRIPTOR_LENGTH {
            return None;
        }
        Some(EndpointDescriptor {
            endpoint_address: bytes[2],
            attributes: bytes[3],
            max_packet_size: u16::from_le_bytes([bytes[4], bytes[5]]),
        })
    }

    pub fn is_bulk(&self) -> bool {
        self.attributes & TRANSFER_TYPE_MASK == TRANSFER_TYPE_BULK
    }

    pub fn is_in(&self) -> bool {
        self.endpoint_address & ENDPOINT_DIR_IN_MASK != 0
    }
}
