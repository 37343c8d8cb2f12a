//! Companion processor side of the link
//!
//! Answers the drive's requests against a shared [`CompanionState`]. The
//! responder holds the state behind a mutex so a host application can
//! change the mounted media while the link is running.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::*;
use num_traits::FromPrimitive;

use super::PicomCommand;
use super::frame::{read_frame, write_frame};
use super::transport::{ChannelTransport, Transport};
use crate::error::DriveError;

/// How long the responder waits for a request before checking the link
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct CompanionState {
    pub mounted: bool,

    /// Storage is present and may be mounted
    pub storage_available: bool,

    /// Currently selected disc title carries EFM data
    pub efm_data_present: bool,

    /// User code of the currently selected disc title
    pub user_code: [u8; 5],
}

impl Default for CompanionState {
    fn default() -> Self {
        Self {
            mounted: false,
            storage_available: true,
            efm_data_present: false,
            user_code: [0; 5],
        }
    }
}

/// Builds the response payload for a single request.
///
/// An empty response tells the drive the request was not understood.
pub fn respond(state: &mut CompanionState, request: &[u8]) -> Vec<u8> {
    let Some(&op) = request.first() else {
        return vec![];
    };
    let Some(cmd) = PicomCommand::from_u8(op) else {
        warn!("Unknown request opcode {:02X}", op);
        return vec![];
    };
    debug!("Request {}", <&'static str>::from(cmd));

    match cmd {
        PicomCommand::Reset => {
            state.mounted = false;
            vec![1]
        }
        PicomCommand::SetMountState => match request.get(1) {
            Some(0) => {
                state.mounted = false;
                vec![1]
            }
            Some(_) => {
                state.mounted = state.storage_available;
                vec![u8::from(state.mounted)]
            }
            None => vec![],
        },
        PicomCommand::GetMountState => vec![u8::from(state.mounted)],
        PicomCommand::GetEfmDataPresent => vec![u8::from(state.efm_data_present)],
        PicomCommand::GetUserCode => state.user_code.to_vec(),
    }
}

/// Serves requests until the other end of the transport goes away
pub fn serve(transport: &mut impl Transport, state: &Mutex<CompanionState>) {
    loop {
        match read_frame(transport, Instant::now() + POLL_INTERVAL) {
            Ok(request) => {
                let response = match state.lock() {
                    Ok(mut s) => respond(&mut s, &request),
                    Err(_) => {
                        error!("Companion state poisoned");
                        return;
                    }
                };
                if let Err(e) = write_frame(transport, &response) {
                    warn!("Cannot send response: {}", e);
                }
            }
            Err(DriveError::RemoteLinkTimeout) => {
                if !transport.connected() {
                    debug!("Drive disconnected, companion stopping");
                    return;
                }
            }
            Err(e) => {
                warn!("Bad request frame: {}", e);
                transport.clear();
            }
        }
    }
}

/// Runs a companion responder on its own thread.
///
/// Returns the drive's end of the link. The thread exits once that end is
/// dropped.
pub fn spawn_companion(state: Arc<Mutex<CompanionState>>) -> (ChannelTransport, JoinHandle<()>) {
    let (drive, mut companion) = ChannelTransport::pipe();
    let handle = std::thread::spawn(move || serve(&mut companion, &state));
    (drive, handle)
}
