//! Drive emulation orchestrator
//!
//! Owns the bus driver, the companion link, the LUN layer and the F-code
//! buffer, and provides the glue the SCSI command state machine calls into:
//! reset servicing and the sector and F-code data phases.

use std::io::Write;
use std::sync::Arc;

use log::*;

use crate::config::EmulatorConfig;
use crate::error::DriveResult;
use crate::fcode::{FCode, FcodeBuffer};
use crate::filesystem::Filesystem;
use crate::filesystem::store::ImageStore;
use crate::hostadapter::{BusLines, HostAdapter};
use crate::picom::transport::Transport;
use crate::picom::{CompanionLink, PicomResponse, RemoteLink};
use crate::types::{ResetLatch, SECTOR_SIZE};

pub struct Emulator<B: BusLines, T: Transport, S: ImageStore> {
    config: EmulatorConfig,
    adapter: HostAdapter<B>,
    link: RemoteLink<T>,
    fs: Filesystem<S>,
    fcode: FcodeBuffer,

    /// Out-of-band serial link to the host (user code relay)
    host_link: Box<dyn Write + Send>,
}

impl<B, T, S> Emulator<B, T, S>
where
    B: BusLines,
    T: Transport,
    S: ImageStore,
{
    /// Brings up the drive: idles the bus, resets the companion and mounts
    /// the storage. A failed mount is logged; the next host reset retries it.
    pub fn new(
        config: EmulatorConfig,
        lines: B,
        reset: Arc<ResetLatch>,
        transport: T,
        store: S,
        host_link: Box<dyn Write + Send>,
    ) -> Self {
        let adapter = HostAdapter::new(lines, reset, config.spin_limit);
        let link = RemoteLink::new(transport, config.link_timeout());
        let fs = Filesystem::new(store, &config);

        let mut emu = Self {
            config,
            adapter,
            link,
            fs,
            fcode: FcodeBuffer::new(),
            host_link,
        };

        match emu.link.reset() {
            PicomResponse::Ok => debug!("Companion reset"),
            r => warn!("Companion reset failed: {}", r),
        }
        if let Err(e) = emu.fs.mount(&mut emu.link) {
            error!("Initial mount failed: {}", e);
        }
        info!("Drive emulation ready");
        emu
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    pub fn adapter(&self) -> &HostAdapter<B> {
        &self.adapter
    }

    pub fn adapter_mut(&mut self) -> &mut HostAdapter<B> {
        &mut self.adapter
    }

    pub fn filesystem(&self) -> &Filesystem<S> {
        &self.fs
    }

    pub fn filesystem_mut(&mut self) -> &mut Filesystem<S> {
        &mut self.fs
    }

    pub fn link_mut(&mut self) -> &mut RemoteLink<T> {
        &mut self.link
    }

    pub fn fcode(&self) -> &FcodeBuffer {
        &self.fcode
    }

    pub fn mount(&mut self) -> DriveResult<()> {
        self.fs.mount(&mut self.link)
    }

    pub fn dismount(&mut self) -> DriveResult<()> {
        self.fs.dismount(&mut self.link)
    }

    /// Runs the host reset sequence if the host signalled reset (or a
    /// transfer timed out). Returns true if a reset was serviced.
    pub fn service_reset(&mut self) -> bool {
        if !self.adapter.read_reset_flag() {
            return false;
        }
        info!("Servicing host reset");
        self.adapter.reset();
        self.fs.reset(&mut self.link);
        self.fcode.reset();
        self.adapter.write_reset_flag(false);
        true
    }

    /// DataIn phase of a read: sends `count` sectors from `start` of a LUN
    pub fn send_sectors(&mut self, lun: u8, start: u32, count: u32) -> DriveResult<()> {
        self.fs.open_for_read(lun, start, count)?;
        let result = self.send_open_sectors(count);
        self.fs.close_for_read();
        Self::log_transfer_error("Read", lun, &result);
        result
    }

    fn send_open_sectors(&mut self, count: u32) -> DriveResult<()> {
        let mut sector = [0; SECTOR_SIZE];
        self.adapter.set_data_direction(true);
        for n in 0..count {
            self.fs.read_next_sector(&mut sector)?;
            let sent = self.adapter.perform_block_read(&sector);
            if let Err(e) = self.adapter.check_transfer(sent) {
                warn!("Read aborted at sector {} of {}: {}", n, count, e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// DataOut phase of a write: stores `count` sectors at `start` of a LUN
    pub fn receive_sectors(&mut self, lun: u8, start: u32, count: u32) -> DriveResult<()> {
        self.fs.open_for_write(lun, start, count)?;
        let result = self.receive_open_sectors(count);
        self.fs.close_for_write();
        Self::log_transfer_error("Write", lun, &result);
        result
    }

    /// Bus aborts are left to the reset path; anything else failed the
    /// storage side of the transfer.
    fn log_transfer_error(kind: &str, lun: u8, result: &DriveResult<()>) {
        match result {
            Err(e) if e.is_bus_abort() => debug!("{} on LUN {} awaits host reset", kind, lun),
            Err(e) => error!("{} on LUN {} failed: {}", kind, lun, e),
            Ok(()) => (),
        }
    }

    fn receive_open_sectors(&mut self, count: u32) -> DriveResult<()> {
        let mut sector = [0; SECTOR_SIZE];
        self.adapter.set_data_direction(false);
        for n in 0..count {
            let received = self.adapter.perform_block_write(&mut sector);
            if let Err(e) = self.adapter.check_transfer(received) {
                // Partial sectors are never written
                warn!("Write aborted at sector {} of {}: {}", n, count, e);
                return Err(e);
            }
            self.fs.write_next_sector(&sector)?;
        }
        Ok(())
    }

    /// DataOut phase of WRITE F-CODE
    pub fn receive_fcode(&mut self, lun: u8) -> DriveResult<FCode> {
        self.adapter.set_data_direction(false);
        let received = self.adapter.perform_block_write(self.fcode.data_mut());
        self.adapter.check_transfer(received)?;
        self.fcode
            .write_buffer(lun, &mut self.link, &self.fs, self.host_link.as_mut())
    }

    /// Queues a reply from the player for the next F-code read
    pub fn queue_fcode_reply(&mut self, reply: &[u8]) {
        self.fcode.queue_reply(reply);
    }

    /// DataIn phase of READ F-CODE REPLY
    pub fn send_fcode_reply(&mut self) -> DriveResult<()> {
        self.fcode.read_buffer();
        self.adapter.set_data_direction(true);
        let sent = self.adapter.perform_block_read(self.fcode.data());
        self.adapter.check_transfer(sent)
    }

    /// Whether the current laser-disc title carries EFM data
    pub fn laserdisc_data_present(&mut self) -> DriveResult<bool> {
        self.link.get_efm_data_present().into_bool()
    }
}
