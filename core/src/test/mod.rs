//! Test doubles and whole-drive scenarios

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use crate::config::EmulatorConfig;
use crate::emulator::Emulator;
use crate::error::{DriveError, DriveResult};
use crate::fcode::{CR, FCode, RequestKind};
use crate::filesystem::store::MemoryStore;
use crate::filesystem::{LunStatus, MountState};
use crate::hostadapter::simbus::SimBus;
use crate::picom::companion::{CompanionState, spawn_companion};
use crate::picom::transport::ChannelTransport;
use crate::picom::{CompanionLink, PicomResponse};
use crate::types::SECTOR_SIZE;

/// Scripted companion for tests that do not need the wire protocol
pub struct FakeLink {
    pub mounted: bool,
    pub storage_available: bool,
    pub responsive: bool,
    pub efm_data_present: bool,

    /// None makes the request fail
    pub user_code: Option<[u8; 5]>,

    /// Every mount state change requested, in order
    pub set_calls: Vec<bool>,
}

impl FakeLink {
    pub fn new() -> Self {
        Self {
            mounted: false,
            storage_available: true,
            responsive: true,
            efm_data_present: false,
            user_code: Some([0; 5]),
            set_calls: vec![],
        }
    }
}

impl CompanionLink for FakeLink {
    fn reset(&mut self) -> PicomResponse {
        self.mounted = false;
        PicomResponse::Ok
    }

    fn get_mount_state(&mut self) -> PicomResponse {
        if !self.responsive {
            return PicomResponse::Timeout;
        }
        if self.mounted {
            PicomResponse::True
        } else {
            PicomResponse::False
        }
    }

    fn set_mount_state(&mut self, mounted: bool) -> PicomResponse {
        self.set_calls.push(mounted);
        if !self.responsive {
            return PicomResponse::Timeout;
        }
        self.mounted = mounted && self.storage_available;
        if self.mounted == mounted {
            PicomResponse::True
        } else {
            PicomResponse::False
        }
    }

    fn get_efm_data_present(&mut self) -> PicomResponse {
        if self.efm_data_present {
            PicomResponse::True
        } else {
            PicomResponse::False
        }
    }

    fn get_user_code(&mut self) -> DriveResult<[u8; 5]> {
        self.user_code.ok_or(DriveError::RemoteLinkTimeout)
    }
}

/// Host serial link capture
#[derive(Clone, Default)]
pub struct SharedSink(Arc<Mutex<Vec<u8>>>);

impl SharedSink {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

type TestEmulator = Emulator<SimBus, ChannelTransport, MemoryStore>;

struct Rig {
    emu: TestEmulator,
    store: MemoryStore,
    companion: Arc<Mutex<CompanionState>>,
    sink: SharedSink,
}

fn config() -> EmulatorConfig {
    EmulatorConfig {
        spin_limit: 1000,
        ..Default::default()
    }
}

fn rig_with(bus: SimBus, state: CompanionState, images: &[(u8, Vec<u8>)]) -> Rig {
    let config = config();
    let store = MemoryStore::new();
    for (lun, data) in images {
        store.insert(
            format!("{}0/scsi{}.dat", config.directory_prefix, lun),
            data.clone(),
        );
    }
    let companion = Arc::new(Mutex::new(state));
    let (transport, _) = spawn_companion(Arc::clone(&companion));
    let sink = SharedSink::default();
    let latch = bus.reset_latch();
    let emu = Emulator::new(
        config,
        bus,
        latch,
        transport,
        store.clone(),
        Box::new(sink.clone()),
    );
    Rig {
        emu,
        store,
        companion,
        sink,
    }
}

fn rig(images: &[(u8, Vec<u8>)]) -> Rig {
    rig_with(SimBus::new(), CompanionState::default(), images)
}

fn image_data(sectors: usize) -> Vec<u8> {
    (0..sectors * SECTOR_SIZE)
        .map(|i| (i / SECTOR_SIZE) as u8 ^ (i as u8).rotate_left(3))
        .collect()
}

#[test]
fn auto_created_descriptor() {
    let r = rig(&[(0, vec![0; 10_475_520])]);
    let fs = r.emu.filesystem();
    assert_eq!(fs.mount_state(), MountState::Mounted);
    assert!(r.companion.lock().unwrap().mounted);
    assert_eq!(fs.lun(0).unwrap().status, LunStatus::Started);

    let dsc = r.store.contents(&fs.descriptor_path(0, 0)).unwrap();
    assert_eq!(
        dsc,
        vec![0, 0, 0, 8, 0, 0, 0, 0, 0, 0, 1, 0, 1, 0, 124, 10, 0, 128, 0, 128, 0, 1]
    );
}

#[test]
fn fresh_directory() {
    let mut r = rig(&[]);
    let fs = r.emu.filesystem();
    assert!(fs.read_lun_status(0));
    assert!(r.store.contents(&fs.image_path(0, 0)).is_some());
    let g = fs.lun(0).unwrap().geometry.clone().unwrap();
    assert!(g.capacity_bytes() <= 536_870_656);

    r.emu.filesystem_mut().set_lun_status(4, true).unwrap();
    assert!(r.emu.filesystem().read_lun_status(4));
    assert!(
        r.store
            .contents(&r.emu.filesystem().descriptor_path(0, 4))
            .is_some()
    );
}

#[test]
fn send_sectors() {
    let img = image_data(8);
    let mut r = rig(&[(0, img.clone())]);
    r.emu.send_sectors(0, 2, 3).unwrap();
    let bus = r.emu.adapter_mut().lines_mut();
    assert_eq!(
        bus.take_host_received(),
        &img[2 * SECTOR_SIZE..5 * SECTOR_SIZE]
    );
    assert!(!r.emu.service_reset());
}

#[test]
fn receive_sectors() {
    let mut r = rig(&[(0, image_data(4))]);
    let data: Vec<u8> = (0..2 * SECTOR_SIZE).map(|i| (i * 3) as u8).collect();
    r.emu
        .adapter_mut()
        .lines_mut()
        .queue_host_bytes(data.iter().copied());
    r.emu.receive_sectors(0, 1, 2).unwrap();

    let img = r
        .store
        .contents(&r.emu.filesystem().image_path(0, 0))
        .unwrap();
    assert_eq!(&img[SECTOR_SIZE..3 * SECTOR_SIZE], data.as_slice());
    assert_eq!(img[..SECTOR_SIZE], image_data(1)[..]);
}

#[test]
fn reset_mid_transfer() {
    let bus = SimBus::new().with_reset_after(300);
    let mut r = rig_with(bus, CompanionState::default(), &[(0, image_data(4))]);
    let result = r.emu.send_sectors(0, 0, 4);
    assert!(matches!(result, Err(DriveError::BusReset { .. })));
    assert_eq!(r.emu.adapter().lines().handshakes(), 300);

    // Nothing moves until the reset is serviced
    assert!(matches!(
        r.emu.send_sectors(0, 0, 1),
        Err(DriveError::BusReset { transferred: 0 })
    ));
    assert_eq!(r.emu.adapter().lines().handshakes(), 300);

    assert!(r.emu.service_reset());
    assert!(!r.emu.service_reset());
    assert_eq!(r.emu.filesystem().mount_state(), MountState::Mounted);
    assert!(r.emu.filesystem().read_lun_status(0));

    r.emu.adapter_mut().lines_mut().heal();
    r.emu.adapter_mut().lines_mut().take_host_received();
    r.emu.send_sectors(0, 3, 1).unwrap();
    assert_eq!(
        r.emu.adapter().lines().host_received(),
        &image_data(4)[3 * SECTOR_SIZE..]
    );
}

#[test]
fn host_stall_times_out() {
    let bus = SimBus::new().with_ack_budget(SECTOR_SIZE + 10);
    let mut r = rig_with(bus, CompanionState::default(), &[(0, image_data(4))]);
    r.emu
        .adapter_mut()
        .lines_mut()
        .queue_host_bytes(std::iter::repeat_n(0x77, 2 * SECTOR_SIZE));
    let result = r.emu.receive_sectors(0, 0, 2);
    assert!(matches!(
        result,
        Err(DriveError::BusTimeout { transferred: 10 })
    ));

    // Only the complete first sector reached the image
    let img = r
        .store
        .contents(&r.emu.filesystem().image_path(0, 0))
        .unwrap();
    assert!(img[..SECTOR_SIZE].iter().all(|&b| b == 0x77));
    assert_eq!(img[SECTOR_SIZE..2 * SECTOR_SIZE], image_data(2)[SECTOR_SIZE..]);

    assert!(r.emu.service_reset());
}

#[test]
fn transfer_refused_while_reset_pending() {
    let mut r = rig(&[(0, image_data(2))]);
    r.emu.adapter_mut().lines_mut().pulse_reset();
    assert!(matches!(
        r.emu.send_sectors(0, 0, 1),
        Err(DriveError::BusReset { transferred: 0 })
    ));
    assert!(r.emu.service_reset());
}

#[test]
fn fcode_user_code_relay() {
    let state = CompanionState {
        user_code: *b"DOMES",
        ..Default::default()
    };
    let mut r = rig_with(SimBus::new(), state, &[(0, vec![])]);
    let mut cmd = vec![0; SECTOR_SIZE];
    cmd[..3].copy_from_slice(b"?U\r");
    r.emu.adapter_mut().lines_mut().queue_host_bytes(cmd);

    let decoded = r.emu.receive_fcode(0).unwrap();
    assert_eq!(decoded, FCode::Request(RequestKind::UserCode));
    assert_eq!(r.sink.contents(), b"<UCD>DOMES</UCD>\r\n");

    r.emu.send_fcode_reply().unwrap();
    let reply = r.emu.adapter_mut().lines_mut().take_host_received();
    assert_eq!(reply.len(), SECTOR_SIZE);
    assert_eq!(reply[0], CR);
    assert!(reply[1..].iter().all(|&b| b == 0));
}

#[test]
fn fcode_queued_reply() {
    let mut r = rig(&[(0, vec![])]);
    r.emu.queue_fcode_reply(b"A00042");
    r.emu.send_fcode_reply().unwrap();
    let reply = r.emu.adapter_mut().lines_mut().take_host_received();
    assert_eq!(&reply[..7], b"A00042\r");
    assert!(r.sink.contents().is_empty());
}

#[test]
fn laserdisc_data_present() {
    let mut r = rig(&[(0, vec![])]);
    assert!(!r.emu.laserdisc_data_present().unwrap());
    r.companion.lock().unwrap().efm_data_present = true;
    assert!(r.emu.laserdisc_data_present().unwrap());
}

#[test]
fn companion_silent() {
    let config = EmulatorConfig {
        link_timeout_ms: 50,
        ..config()
    };
    let (transport, _companion_end) = ChannelTransport::pipe();
    let bus = SimBus::new();
    let latch = bus.reset_latch();
    let mut emu = Emulator::new(
        config,
        bus,
        latch,
        transport,
        MemoryStore::new(),
        Box::new(io::sink()),
    );
    assert_eq!(emu.filesystem().mount_state(), MountState::Unmounted);
    assert!(matches!(
        emu.laserdisc_data_present(),
        Err(DriveError::RemoteLinkTimeout)
    ));
}

#[test]
fn reset_retries_mount() {
    let state = CompanionState {
        storage_available: false,
        ..Default::default()
    };
    let mut r = rig_with(SimBus::new(), state, &[(0, image_data(1))]);
    assert_eq!(r.emu.filesystem().mount_state(), MountState::Unmounted);

    r.companion.lock().unwrap().storage_available = true;
    r.emu.adapter_mut().lines_mut().pulse_reset();
    assert!(r.emu.service_reset());
    assert_eq!(r.emu.filesystem().mount_state(), MountState::Mounted);
    assert!(r.emu.filesystem().read_lun_status(0));
}

#[test]
fn dismount_and_remount() {
    let mut r = rig(&[(0, image_data(1))]);
    r.emu.dismount().unwrap();
    assert!(!r.companion.lock().unwrap().mounted);
    assert!(r.emu.send_sectors(1, 0, 1).is_err());
    r.emu.mount().unwrap();
    assert!(r.companion.lock().unwrap().mounted);
}
