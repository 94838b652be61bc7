//! [`Channel`] over a transport device handle, closing the in-process loop
//! between the kernel half and the serve loop.

use bytes::Bytes;
use fusegate::device::DeviceHandle;
use fusegate::error::EndpointError;

use crate::serve::{Channel, ChannelError};

impl Channel for DeviceHandle {
    fn receive(&self) -> Result<Bytes, ChannelError> {
        match self.read_request(true) {
            Ok(frame) => Ok(frame),
            // An answered ticket was dropped before delivery; read again.
            Err(EndpointError::Withdrawn | EndpointError::WouldBlock) => Err(ChannelError::Retry),
            Err(EndpointError::Dead | EndpointError::NotConnected | EndpointError::NoSuchDevice) => {
                Err(ChannelError::Disconnected)
            }
            Err(e) => Err(ChannelError::Io(e.into())),
        }
    }

    fn send(&self, frame: &[u8]) -> Result<(), ChannelError> {
        match self.write_reply(frame) {
            Ok(()) => Ok(()),
            Err(EndpointError::Dead | EndpointError::NotConnected | EndpointError::NoSuchDevice) => {
                Err(ChannelError::Disconnected)
            }
            Err(e) => Err(ChannelError::Io(e.into())),
        }
    }
}
