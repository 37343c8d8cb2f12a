//! Request/response link to the companion processor
//!
//! The companion owns the storage and the authoritative mount state; the
//! drive asks it to mount and queries laser-disc metadata. Every exchange
//! is one request frame followed by one response frame, bounded as a whole
//! by the link timeout.

pub mod companion;
pub mod frame;
pub mod transport;

use std::time::{Duration, Instant};

use log::*;
use num_derive::FromPrimitive;

use crate::error::{DriveError, DriveResult};
use frame::{read_frame, write_frame};
use transport::Transport;

/// Default timeout for a complete exchange
pub const DEFAULT_LINK_TIMEOUT: Duration = Duration::from_millis(1000);

/// Request opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, strum::IntoStaticStr)]
#[repr(u8)]
pub enum PicomCommand {
    Reset = 0x00,
    SetMountState = 0x01,
    GetMountState = 0x02,
    GetEfmDataPresent = 0x03,
    GetUserCode = 0x04,
}

/// Outcome of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[repr(u8)]
pub enum PicomResponse {
    Ok = 0x00,
    True = 0x01,
    False = 0x02,
    Error = 0x03,
    Timeout = 0x04,
}

impl PicomResponse {
    /// Converts a boolean answer into a result, mapping link failures onto
    /// the matching error.
    pub fn into_bool(self) -> DriveResult<bool> {
        match self {
            Self::Ok | Self::True => Ok(true),
            Self::False => Ok(false),
            Self::Timeout => Err(DriveError::RemoteLinkTimeout),
            Self::Error => Err(DriveError::RemoteLinkError(
                "companion returned an unusable response".to_string(),
            )),
        }
    }
}

/// The operations the drive needs from the companion
pub trait CompanionLink {
    fn reset(&mut self) -> PicomResponse;
    fn get_mount_state(&mut self) -> PicomResponse;
    fn set_mount_state(&mut self, mounted: bool) -> PicomResponse;
    fn get_efm_data_present(&mut self) -> PicomResponse;
    fn get_user_code(&mut self) -> DriveResult<[u8; 5]>;
}

/// Drive side of the link
pub struct RemoteLink<T: Transport> {
    transport: T,
    timeout: Duration,
}

impl<T: Transport> RemoteLink<T> {
    pub fn new(transport: T, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Sends a request and waits for the response payload
    pub fn exchange(&mut self, request: &[u8]) -> DriveResult<Vec<u8>> {
        let deadline = Instant::now() + self.timeout;
        self.transport.clear();
        write_frame(&mut self.transport, request)?;
        let response = read_frame(&mut self.transport, deadline);
        match &response {
            Ok(payload) => trace!("Exchange {:02X?} -> {:02X?}", request, payload),
            Err(e) => debug!("Exchange {:02X?} failed: {}", request, e),
        }
        response
    }

    fn boolean_request(&mut self, request: &[u8]) -> PicomResponse {
        match self.exchange(request) {
            Ok(payload) => match payload.first() {
                None => PicomResponse::Error,
                Some(0) => PicomResponse::False,
                Some(_) => PicomResponse::True,
            },
            Err(DriveError::RemoteLinkTimeout) => {
                warn!("Companion did not answer {:02X?} in time", request);
                PicomResponse::Timeout
            }
            Err(e) => {
                warn!("Companion link error: {}", e);
                PicomResponse::Error
            }
        }
    }
}

impl<T: Transport> CompanionLink for RemoteLink<T> {
    fn reset(&mut self) -> PicomResponse {
        match self.boolean_request(&[PicomCommand::Reset as u8]) {
            PicomResponse::True | PicomResponse::False => PicomResponse::Ok,
            r => r,
        }
    }

    fn get_mount_state(&mut self) -> PicomResponse {
        self.boolean_request(&[PicomCommand::GetMountState as u8])
    }

    fn set_mount_state(&mut self, mounted: bool) -> PicomResponse {
        self.boolean_request(&[PicomCommand::SetMountState as u8, u8::from(mounted)])
    }

    fn get_efm_data_present(&mut self) -> PicomResponse {
        self.boolean_request(&[PicomCommand::GetEfmDataPresent as u8])
    }

    fn get_user_code(&mut self) -> DriveResult<[u8; 5]> {
        let payload = self.exchange(&[PicomCommand::GetUserCode as u8])?;
        let Some(code) = payload.get(0..5) else {
            return Err(DriveError::RemoteLinkError(format!(
                "user code response too short ({} bytes)",
                payload.len()
            )));
        };
        let mut out = [0; 5];
        out.copy_from_slice(code);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::companion::{CompanionState, spawn_companion};
    use super::transport::ChannelTransport;
    use super::*;

    fn linked(state: CompanionState) -> (RemoteLink<ChannelTransport>, Arc<Mutex<CompanionState>>) {
        let state = Arc::new(Mutex::new(state));
        let (transport, _) = spawn_companion(Arc::clone(&state));
        (
            RemoteLink::new(transport, Duration::from_millis(500)),
            state,
        )
    }

    #[test]
    fn mount_cycle() {
        let (mut link, state) = linked(CompanionState::default());
        assert_eq!(link.reset(), PicomResponse::Ok);
        assert_eq!(link.get_mount_state(), PicomResponse::False);
        assert_eq!(link.set_mount_state(true), PicomResponse::True);
        assert_eq!(link.get_mount_state(), PicomResponse::True);
        assert!(state.lock().unwrap().mounted);
        assert_eq!(link.set_mount_state(false), PicomResponse::True);
        assert_eq!(link.get_mount_state(), PicomResponse::False);
    }

    #[test]
    fn mount_without_storage() {
        let (mut link, _) = linked(CompanionState {
            storage_available: false,
            ..Default::default()
        });
        assert_eq!(link.set_mount_state(true), PicomResponse::False);
        assert_eq!(link.get_mount_state(), PicomResponse::False);
    }

    #[test]
    fn efm_and_user_code() {
        let (mut link, _) = linked(CompanionState {
            efm_data_present: true,
            user_code: *b"AB123",
            ..Default::default()
        });
        assert_eq!(link.get_efm_data_present(), PicomResponse::True);
        assert_eq!(link.get_user_code().unwrap(), *b"AB123");
    }

    #[test]
    fn silent_companion_times_out() {
        let (transport, _other) = ChannelTransport::pipe();
        let mut link = RemoteLink::new(transport, Duration::from_millis(30));
        let start = Instant::now();
        assert_eq!(link.get_mount_state(), PicomResponse::Timeout);
        assert_eq!(link.reset(), PicomResponse::Timeout);
        assert!(matches!(
            link.get_user_code(),
            Err(DriveError::RemoteLinkTimeout)
        ));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn empty_response_is_error() {
        let (transport, mut other) = ChannelTransport::pipe();
        let mut link = RemoteLink::new(transport, Duration::from_millis(200));
        other.write_all(&[0, 0]).unwrap();
        // The stale frame is discarded before the request goes out
        assert_eq!(link.get_mount_state(), PicomResponse::Timeout);

        let h = std::thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(2);
            let unanswered = read_frame(&mut other, deadline).unwrap();
            assert_eq!(unanswered, vec![PicomCommand::GetMountState as u8]);
            let req = read_frame(&mut other, deadline).unwrap();
            assert_eq!(req, vec![PicomCommand::GetEfmDataPresent as u8]);
            write_frame(&mut other, &[]).unwrap();
        });
        assert_eq!(link.get_efm_data_present(), PicomResponse::Error);
        h.join().unwrap();
    }

    #[test]
    fn response_into_bool() {
        assert!(PicomResponse::True.into_bool().unwrap());
        assert!(!PicomResponse::False.into_bool().unwrap());
        assert!(matches!(
            PicomResponse::Timeout.into_bool(),
            Err(DriveError::RemoteLinkTimeout)
        ));
        assert!(PicomResponse::Error.into_bool().is_err());
    }
}
