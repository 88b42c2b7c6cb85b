use b2_net_backend::{Transport, MAX_FRAME_SIZE};

use crate::error::TxError;
use crate::guest::{GuestCpu, GuestPacket};
use crate::stats::Counters;

/// Copy `packet` out of guest memory and send it.
pub(crate) fn transmit_packet(
    transport: &Transport,
    cpu: &dyn GuestCpu,
    packet: &GuestPacket,
    counters: &Counters,
) -> Result<(), TxError> {
    let frame = packet.gather(cpu).map_err(|err| {
        Counters::bump(&counters.tx_too_long);
        TxError::TooLong {
            len: err.len,
            max: err.max,
        }
    })?;
    transmit_frame(transport, frame.as_slice(), counters)
}

pub(crate) fn transmit_frame(
    transport: &Transport,
    frame: &[u8],
    counters: &Counters,
) -> Result<(), TxError> {
    if frame.len() > MAX_FRAME_SIZE {
        Counters::bump(&counters.tx_too_long);
        return Err(TxError::TooLong {
            len: frame.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    if let Err(err) = transport.write_frame(frame) {
        Counters::bump(&counters.tx_buffer_full);
        tracing::debug!(len = frame.len(), "couldn't transmit packet: {err}");
        return Err(TxError::Backend(err));
    }
    Counters::bump(&counters.tx_packets);
    Ok(())
}
