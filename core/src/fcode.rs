//! Laser-disc F-code decode and relay
//!
//! F-codes are the remote-control commands of the VP415 laser-disc player.
//! The host writes them to a laser-disc LUN as a CR-terminated buffer
//! (`WRITE F-CODE`) and reads the player's reply the same way
//! (`READ F-CODE REPLY`). Player emulation lives outside the drive; this
//! module decodes commands for diagnostics and relays the one command that
//! needs data only the drive side can provide: the user code request.

use std::fmt;
use std::io::Write;

use log::*;

use crate::error::DriveResult;
use crate::filesystem::Filesystem;
use crate::filesystem::store::ImageStore;
use crate::picom::CompanionLink;
use crate::types::{SECTOR_SIZE, Sector};

/// Command and reply terminator
pub const CR: u8 = 0x0D;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum RequestKind {
    #[strum(to_string = "picture number")]
    PictureNumber,
    #[strum(to_string = "chapter number")]
    ChapterNumber,
    #[strum(to_string = "disc program status")]
    DiscStatus,
    #[strum(to_string = "player status")]
    PlayerStatus,
    #[strum(to_string = "user code")]
    UserCode,
    #[strum(to_string = "revision level")]
    RevisionLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum OverlayMode {
    #[strum(to_string = "1 (LaserVision video only)")]
    VideoOnly,
    #[strum(to_string = "2 (external RGB only)")]
    ExternalOnly,
    #[strum(to_string = "3 (hard-keyed)")]
    HardKeyed,
    #[strum(to_string = "4 (mixed)")]
    Mixed,
    #[strum(to_string = "5 (enhanced)")]
    Enhanced,
    #[strum(to_string = "request")]
    Request,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Source {
    #[strum(to_string = "internal")]
    Internal,
    #[strum(to_string = "external")]
    External,
}

/// A decoded F-code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FCode {
    SoundInsert,
    Rc5Command,
    ReplaySwitch(bool),
    Eject,
    TransmissionDelay(bool),
    Halt,
    RepetitiveHaltJump,
    JumpForward,
    /// On (load) or standby (unload)
    Power(bool),
    JumpBackward,
    Pause,
    ResetDefaults,
    Request(RequestKind),
    Audio1(bool),
    Audio2(bool),
    ChapterDisplay(bool),
    PictureNumberDisplay(bool),
    Video(bool),
    LoadPicture,
    RemoteRouted(bool),
    FrontPanel(bool),
    RemoteControl(bool),
    StillForward,
    StillReverse,
    PlayForward,
    PlayReverse,
    GotoChapter,
    SlowFastRead,
    SetSpeed,
    GotoTimeCode,
    SlowForward,
    VideoOverlay(OverlayMode),
    SlowReverse,
    FastForward,
    Clear,
    FastReverse,
    Audio1Source(Source),
    VideoSource(Source),
    Audio2Source(Source),
    Teletext(bool),

    /// Known opcode, malformed parameter
    InvalidParameter(u8),
    Unknown(u8),
}

impl FCode {
    /// Classifies a command buffer. Bytes past the end of `buf` read as CR.
    pub fn decode(buf: &[u8]) -> Self {
        let byte = |i: usize| buf.get(i).copied().unwrap_or(CR);
        let op = byte(0);
        let param = byte(1);

        let switch = |f: fn(bool) -> Self| match param {
            b'0' => f(false),
            b'1' => f(true),
            _ => Self::InvalidParameter(op),
        };
        let source = |f: fn(Source) -> Self| match param {
            b'0' => f(Source::Internal),
            b'1' => f(Source::External),
            _ => Self::InvalidParameter(op),
        };

        match op {
            b'!' => Self::SoundInsert,
            b'#' => Self::Rc5Command,
            b'$' => switch(Self::ReplaySwitch),
            b'\'' => Self::Eject,
            b')' => switch(Self::TransmissionDelay),
            b'*' if param == CR => Self::Halt,
            b'*' => Self::RepetitiveHaltJump,
            b'+' => Self::JumpForward,
            b',' => switch(Self::Power),
            b'-' => Self::JumpBackward,
            b'/' => Self::Pause,
            b':' => Self::ResetDefaults,
            b'?' => match param {
                b'F' => Self::Request(RequestKind::PictureNumber),
                b'C' => Self::Request(RequestKind::ChapterNumber),
                b'D' => Self::Request(RequestKind::DiscStatus),
                b'P' => Self::Request(RequestKind::PlayerStatus),
                b'U' => Self::Request(RequestKind::UserCode),
                b'=' => Self::Request(RequestKind::RevisionLevel),
                _ => Self::InvalidParameter(op),
            },
            b'A' => switch(Self::Audio1),
            b'B' => switch(Self::Audio2),
            b'C' => switch(Self::ChapterDisplay),
            b'D' => switch(Self::PictureNumberDisplay),
            b'E' => switch(Self::Video),
            b'F' => Self::LoadPicture,
            b'H' => switch(Self::RemoteRouted),
            b'I' => switch(Self::FrontPanel),
            b'J' => switch(Self::RemoteControl),
            b'L' => Self::StillForward,
            b'M' => Self::StillReverse,
            b'N' => Self::PlayForward,
            b'O' => Self::PlayReverse,
            b'Q' => Self::GotoChapter,
            b'R' => Self::SlowFastRead,
            b'S' => Self::SetSpeed,
            b'T' => Self::GotoTimeCode,
            b'U' => Self::SlowForward,
            b'V' => match param {
                b'P' => match byte(2) {
                    b'1' => Self::VideoOverlay(OverlayMode::VideoOnly),
                    b'2' => Self::VideoOverlay(OverlayMode::ExternalOnly),
                    b'3' => Self::VideoOverlay(OverlayMode::HardKeyed),
                    b'4' => Self::VideoOverlay(OverlayMode::Mixed),
                    b'5' => Self::VideoOverlay(OverlayMode::Enhanced),
                    b'X' => Self::VideoOverlay(OverlayMode::Request),
                    _ => Self::InvalidParameter(op),
                },
                CR => Self::SlowReverse,
                _ => Self::InvalidParameter(op),
            },
            b'W' => Self::FastForward,
            b'X' => Self::Clear,
            b'Z' => Self::FastReverse,
            b'[' => source(Self::Audio1Source),
            b'\\' => source(Self::VideoSource),
            b']' => source(Self::Audio2Source),
            b'_' => switch(Self::Teletext),
            _ => Self::Unknown(op),
        }
    }
}

fn on_off(on: bool) -> &'static str {
    if on { "on" } else { "off" }
}

impl fmt::Display for FCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SoundInsert => write!(f, "Sound insert (beep)"),
            Self::Rc5Command => write!(f, "RC-5 command out via A/V euroconnector"),
            Self::ReplaySwitch(on) => {
                write!(f, "Replay switch {}", if *on { "enable" } else { "disable" })
            }
            Self::Eject => write!(f, "Eject (open tray)"),
            Self::TransmissionDelay(on) => write!(f, "Transmission delay {}", on_off(*on)),
            Self::Halt => write!(f, "Halt (still mode)"),
            Self::RepetitiveHaltJump => write!(f, "Repetitive halt and jump"),
            Self::JumpForward => write!(f, "Instant jump forwards"),
            Self::Power(true) => write!(f, "On (load)"),
            Self::Power(false) => write!(f, "Standby (unload)"),
            Self::JumpBackward => write!(f, "Instant jump backwards"),
            Self::Pause => write!(f, "Pause (halt, all muted)"),
            Self::ResetDefaults => write!(f, "Reset to default values"),
            Self::Request(kind) => write!(f, "Request {}", kind),
            Self::Audio1(on) => write!(f, "Audio 1 {}", on_off(*on)),
            Self::Audio2(on) => write!(f, "Audio 2 {}", on_off(*on)),
            Self::ChapterDisplay(on) => write!(f, "Chapter number display {}", on_off(*on)),
            Self::PictureNumberDisplay(on) => {
                write!(f, "Picture number/time code display {}", on_off(*on))
            }
            Self::Video(on) => write!(f, "Video {}", on_off(*on)),
            Self::LoadPicture => write!(f, "Load/go to picture number"),
            Self::RemoteRouted(on) => write!(
                f,
                "Remote control {}routed to computer",
                if *on { "" } else { "not " }
            ),
            Self::FrontPanel(on) => write!(
                f,
                "Front panel buttons {}",
                if *on { "enabled" } else { "disabled" }
            ),
            Self::RemoteControl(on) => write!(
                f,
                "Remote control of player {}",
                if *on { "enabled" } else { "disabled" }
            ),
            Self::StillForward => write!(f, "Still forward"),
            Self::StillReverse => write!(f, "Still reverse"),
            Self::PlayForward => write!(f, "Play forward"),
            Self::PlayReverse => write!(f, "Play reverse"),
            Self::GotoChapter => write!(f, "Go to chapter and halt/play"),
            Self::SlowFastRead => write!(f, "Slow/fast read"),
            Self::SetSpeed => write!(f, "Set fast/slow speed"),
            Self::GotoTimeCode => write!(f, "Go to/load time code register"),
            Self::SlowForward => write!(f, "Slow motion forward"),
            Self::VideoOverlay(mode) => write!(f, "Video overlay mode {}", mode),
            Self::SlowReverse => write!(f, "Slow motion reverse"),
            Self::FastForward => write!(f, "Fast forward"),
            Self::Clear => write!(f, "Clear"),
            Self::FastReverse => write!(f, "Fast reverse"),
            Self::Audio1Source(s) => write!(f, "Audio 1 from {}", s),
            Self::VideoSource(s) => write!(f, "Video from {}", s),
            Self::Audio2Source(s) => write!(f, "Audio 2 from {}", s),
            Self::Teletext(on) => write!(f, "Teletext from disc {}", on_off(*on)),
            Self::InvalidParameter(op) => write!(f, "Opcode {:02X} with invalid parameter", op),
            Self::Unknown(op) => write!(f, "Unknown opcode {:02X}", op),
        }
    }
}

/// The 256-byte F-code transfer buffer shared by both directions
pub struct FcodeBuffer {
    data: Sector,

    /// Player reply waiting to be read by the host
    reply: Option<Vec<u8>>,
}

impl FcodeBuffer {
    pub fn new() -> Self {
        Self {
            data: [0; SECTOR_SIZE],
            reply: None,
        }
    }

    pub fn reset(&mut self) {
        self.data = [0; SECTOR_SIZE];
        self.reply = None;
    }

    pub fn data(&self) -> &Sector {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Sector {
        &mut self.data
    }

    /// Command bytes up to (not including) the terminator
    pub fn command(&self) -> &[u8] {
        let len = self
            .data
            .iter()
            .position(|&b| b == CR)
            .unwrap_or(SECTOR_SIZE);
        &self.data[..len]
    }

    /// Queues a player reply for the next [`Self::read_buffer`]. A missing
    /// terminator is added.
    pub fn queue_reply(&mut self, reply: &[u8]) {
        let mut r: Vec<u8> = reply.iter().copied().take(SECTOR_SIZE - 1).collect();
        if let Some(end) = r.iter().position(|&b| b == CR) {
            r.truncate(end);
        }
        r.push(CR);
        self.reply = Some(r);
    }

    /// Processes a command the host has written into the buffer.
    ///
    /// A user code request is answered out of band on `host_link` as
    /// `<UCD>` + 5 code bytes + `</UCD>\r\n`. The code comes from the
    /// companion, falling back to the LUN's own user code file.
    pub fn write_buffer<S: ImageStore>(
        &self,
        lun: u8,
        link: &mut impl CompanionLink,
        fs: &Filesystem<S>,
        host_link: &mut dyn Write,
    ) -> DriveResult<FCode> {
        let command = self.command();
        debug!("F-code bytes: {}", hex::encode(command));

        let fcode = FCode::decode(&self.data);
        info!("F-code {:02X} on LUN {}: {}", self.data[0], lun, fcode);

        if fcode == FCode::Request(RequestKind::UserCode) {
            let code = match link.get_user_code() {
                Ok(code) => code,
                Err(e) => {
                    warn!("User code unavailable from companion ({}), using LUN's", e);
                    fs.read_lun_user_code(lun)
                }
            };
            debug!("Relaying user code {:02X?}", code);
            host_link.write_all(b"<UCD>")?;
            host_link.write_all(&code)?;
            host_link.write_all(b"</UCD>\r\n")?;
            host_link.flush()?;
        }
        Ok(fcode)
    }

    /// Prepares the reply for the host to read. Without a pending player
    /// reply this is a lone CR.
    pub fn read_buffer(&mut self) {
        self.data = [0; SECTOR_SIZE];
        match self.reply.take() {
            Some(reply) => {
                debug!("F-code reply: {}", hex::encode(&reply));
                self.data[..reply.len()].copy_from_slice(&reply);
            }
            None => {
                debug!("No player reply pending, sending empty reply");
                self.data[0] = CR;
            }
        }
    }
}

impl Default for FcodeBuffer {
    fn default() -> Self {
        Self::new()
    }
}
