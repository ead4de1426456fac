#![cfg_attr(not(test), no_std)]

pub mod descriptor;
pub mod driver;
pub mod host;
pub mod registry;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use driver::{MidiHost, host_library_task};
pub use host::{
    ClientEvent, DeviceAddress, EndpointAddress, HostError, StackEvent, TransferComplete,
    TransferStatus, UsbHostStack,
};
pub use registry::DEVICE_SLOTS;

#[cfg(test)]
mod test;
