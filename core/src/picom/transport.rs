use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::error::{DriveError, DriveResult};

/// Byte-oriented serial link to the companion processor
pub trait Transport {
    fn write_all(&mut self, data: &[u8]) -> DriveResult<()>;

    /// Waits up to `timeout` for the next inbound byte.
    fn read_byte(&mut self, timeout: Duration) -> Option<u8>;

    /// Discards any buffered inbound bytes
    fn clear(&mut self) {}

    /// False once the other end is known to be gone
    fn connected(&self) -> bool {
        true
    }
}

/// One end of an in-process byte pipe
pub struct ChannelTransport {
    tx: Sender<u8>,
    rx: Receiver<u8>,
    disconnected: bool,
}

impl ChannelTransport {
    /// Creates two connected ends of a pipe
    pub fn pipe() -> (Self, Self) {
        let (a_tx, b_rx) = crossbeam_channel::unbounded();
        let (b_tx, a_rx) = crossbeam_channel::unbounded();
        (
            Self {
                tx: a_tx,
                rx: a_rx,
                disconnected: false,
            },
            Self {
                tx: b_tx,
                rx: b_rx,
                disconnected: false,
            },
        )
    }
}

impl Transport for ChannelTransport {
    fn write_all(&mut self, data: &[u8]) -> DriveResult<()> {
        for &b in data {
            if self.tx.send(b).is_err() {
                self.disconnected = true;
                return Err(DriveError::RemoteLinkError(
                    "companion disconnected".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn read_byte(&mut self, timeout: Duration) -> Option<u8> {
        match self.rx.recv_timeout(timeout) {
            Ok(b) => Some(b),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                self.disconnected = true;
                None
            }
        }
    }

    fn clear(&mut self) {
        let stale = self.rx.try_iter().count();
        if stale > 0 {
            log::debug!("Discarded {} stale bytes", stale);
        }
    }

    fn connected(&self) -> bool {
        !self.disconnected
    }
}
