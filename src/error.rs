use crate::packet::Packet;
use crate::lwmac::frame::FrameError;

/// Core MAC errors
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CoreError<E> {
    /// Destination queue full, the packet is handed back
    QueueFull(Packet),

    /// No free neighbour slot for a new destination, the packet is handed back
    NeighbourTableFull(Packet),

    /// Serialized event queue full, the event was not accepted
    EventQueueFull,

    /// Configuration rejected, see [`crate::lwmac::Config::is_valid`]
    InvalidConfig,

    /// Frame decoding error
    Decode(FrameError),

    /// Wrapper for unhandled / underlying radio errors
    Radio(E),
}

impl <E> From<FrameError> for CoreError<E> {
    fn from(e: FrameError) -> Self {
        CoreError::Decode(e)
    }
}
