//! Length-prefixed framing
//!
//! A frame is a 16-bit big-endian payload length followed by the payload.
//! The length does not include itself.

use std::time::Instant;

use super::transport::Transport;
use crate::error::{DriveError, DriveResult};

/// Largest payload either side may send
pub const MAX_PAYLOAD: usize = 512;

pub fn encode_frame(payload: &[u8]) -> DriveResult<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD {
        return Err(DriveError::RemoteLinkError(format!(
            "payload of {} bytes exceeds frame limit",
            payload.len()
        )));
    }
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

pub fn write_frame(transport: &mut impl Transport, payload: &[u8]) -> DriveResult<()> {
    transport.write_all(&encode_frame(payload)?)
}

fn read_before(transport: &mut impl Transport, deadline: Instant) -> DriveResult<u8> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(DriveError::RemoteLinkTimeout);
    }
    transport
        .read_byte(remaining)
        .ok_or(DriveError::RemoteLinkTimeout)
}

/// Reads one frame, failing with a timeout if it is not complete by
/// `deadline`.
pub fn read_frame(transport: &mut impl Transport, deadline: Instant) -> DriveResult<Vec<u8>> {
    let len = u16::from_be_bytes([
        read_before(transport, deadline)?,
        read_before(transport, deadline)?,
    ]) as usize;
    if len > MAX_PAYLOAD {
        return Err(DriveError::RemoteLinkError(format!(
            "inbound frame length {} exceeds limit",
            len
        )));
    }

    let mut payload = Vec::with_capacity(len);
    for _ in 0..len {
        payload.push(read_before(transport, deadline)?);
    }
    Ok(payload)
}
