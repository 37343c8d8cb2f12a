//! LUN and image management
//!
//! Each LUN directory (`BeebSCSI0`, `BeebSCSI1`, ...) holds up to eight image
//! sets. For LUN `n` these are `scsi{n}.dat` (the sector data), `scsi{n}.dsc`
//! (the drive geometry, see [`descriptor`]) and optionally `scsi{n}.ucd` (the
//! 5-byte user code of a laser-disc title).

pub mod descriptor;
mod session;
pub mod store;

use std::path::{Path, PathBuf};

use log::*;

use crate::config::EmulatorConfig;
use crate::error::{DriveError, DriveResult};
use crate::picom::{CompanionLink, PicomResponse};
use crate::types::{LUN_COUNT, SECTOR_SIZE, Sector};
use descriptor::{DESCRIPTOR_LEN, LunDescriptor, MAX_IMAGE_BYTES, TRACK_BYTES};
use session::Session;
use store::ImageStore;

/// Length of a laser-disc user code
pub const USER_CODE_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum MountState {
    Unmounted,
    Mounted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum LunStatus {
    #[default]
    Stopped,
    Started,
}

/// One LUN slot of the active directory
#[derive(Debug, Clone, Default)]
pub struct LogicalUnit {
    pub status: LunStatus,

    /// Geometry in effect, populated when the LUN is started
    pub geometry: Option<LunDescriptor>,

    /// Laser-disc user code, zero for plain disk images
    pub user_code: [u8; USER_CODE_LEN],
}

pub struct Filesystem<S: ImageStore> {
    store: S,

    prefix: String,
    buffer_sectors: usize,
    create_missing_images: bool,
    trace_blocks: bool,

    /// Local mirror of the companion's mount state
    mount_state: MountState,

    directory: u8,
    luns: [LogicalUnit; LUN_COUNT],
    session: Option<Session>,
}

impl<S: ImageStore> Filesystem<S> {
    /// Creates the layer in the unmounted state, on directory 0
    pub fn new(store: S, config: &EmulatorConfig) -> Self {
        Self {
            store,
            prefix: config.directory_prefix.clone(),
            buffer_sectors: config.sector_buffer_sectors.max(1),
            create_missing_images: config.create_missing_images,
            trace_blocks: config.trace_blocks,
            mount_state: MountState::Unmounted,
            directory: 0,
            luns: Default::default(),
            session: None,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn mount_state(&self) -> MountState {
        self.mount_state
    }

    pub fn lun(&self, lun: u8) -> Option<&LogicalUnit> {
        self.luns.get(lun as usize)
    }

    /// LUN of the open image, if any
    pub fn open_lun(&self) -> Option<u8> {
        self.session.as_ref().map(Session::lun)
    }

    fn lun_index(lun: u8) -> DriveResult<usize> {
        if (lun as usize) < LUN_COUNT {
            Ok(lun as usize)
        } else {
            Err(DriveError::InvalidLun(lun))
        }
    }

    pub fn directory_path(&self, directory: u8) -> PathBuf {
        PathBuf::from(format!("{}{}", self.prefix, directory))
    }

    fn lun_file(&self, directory: u8, lun: u8, ext: &str) -> PathBuf {
        self.directory_path(directory)
            .join(format!("scsi{}.{}", lun, ext))
    }

    pub fn image_path(&self, directory: u8, lun: u8) -> PathBuf {
        self.lun_file(directory, lun, "dat")
    }

    pub fn descriptor_path(&self, directory: u8, lun: u8) -> PathBuf {
        self.lun_file(directory, lun, "dsc")
    }

    pub fn user_code_path(&self, directory: u8, lun: u8) -> PathBuf {
        self.lun_file(directory, lun, "ucd")
    }

    /// Closes the open image, if any
    fn flush(&mut self) {
        if let Some(s) = self.session.take() {
            debug!("Closed image of LUN {}", s.lun());
        }
    }

    fn stop_all(&mut self) {
        for unit in &mut self.luns {
            unit.status = LunStatus::Stopped;
        }
    }

    /// Mounts the storage through the companion and starts LUN 0.
    ///
    /// LUN 0 is started unconditionally because some hosts (ADFS) assume it
    /// is ready after a reboot without ever sending START/STOP UNIT.
    pub fn mount(&mut self, link: &mut impl CompanionLink) -> DriveResult<()> {
        info!("Mounting file system");
        if self.mount_state == MountState::Mounted {
            return Err(DriveError::MountStateConflict(MountState::Mounted));
        }

        if link.get_mount_state() == PicomResponse::True {
            error!("Companion reports storage already mounted");
            return Err(DriveError::MountStateConflict(MountState::Mounted));
        }
        self.flush();
        self.stop_all();

        if !link.set_mount_state(true).into_bool()? {
            self.mount_state = MountState::Unmounted;
            return Err(DriveError::RemoteLinkError(
                "companion could not mount its storage".to_string(),
            ));
        }
        self.mount_state = MountState::Mounted;
        info!("File system mounted");

        if let Err(e) = self.set_lun_status(0, true) {
            warn!("Cannot start LUN 0 after mount: {}", e);
        }
        Ok(())
    }

    pub fn dismount(&mut self, link: &mut impl CompanionLink) -> DriveResult<()> {
        info!("Dismounting file system");
        if self.mount_state == MountState::Unmounted {
            return Err(DriveError::MountStateConflict(MountState::Unmounted));
        }

        self.flush();
        self.stop_all();

        match link.set_mount_state(false).into_bool() {
            Ok(true) => (),
            Ok(false) => warn!("Companion refused to dismount its storage"),
            Err(e) => warn!("Cannot notify companion of dismount: {}", e),
        }
        self.mount_state = MountState::Unmounted;
        Ok(())
    }

    /// Host reset: re-validates started LUNs, remounting if any went away.
    pub fn reset(&mut self, link: &mut impl CompanionLink) {
        info!("Resetting file system");
        self.flush();

        if self.mount_state == MountState::Mounted {
            let mut failed = false;
            for lun in 0..LUN_COUNT as u8 {
                if self.read_lun_status(lun) && !self.test_lun_status(lun) {
                    failed = true;
                }
            }
            if failed {
                warn!("Started LUNs failed validation, remounting");
                if let Err(e) = self.dismount(link) {
                    warn!("Dismount failed: {}", e);
                }
                if let Err(e) = self.mount(link) {
                    error!("Mount failed: {}", e);
                }
            }
        } else {
            debug!("Not mounted, attempting mount");
            if let Err(e) = self.mount(link) {
                error!("Mount failed: {}", e);
            }
        }
    }

    pub fn set_lun_status(&mut self, lun: u8, started: bool) -> DriveResult<()> {
        let idx = Self::lun_index(lun)?;
        let target = if started {
            LunStatus::Started
        } else {
            LunStatus::Stopped
        };
        if self.luns[idx].status == target {
            debug!("LUN {} is already {}", lun, target);
            return Ok(());
        }

        if started {
            if self.mount_state != MountState::Mounted {
                error!("Cannot start LUN {}: no file system mounted", lun);
                return Err(DriveError::MountStateConflict(MountState::Unmounted));
            }
            self.check_lun_directory()?;
            self.validate_lun(lun, self.create_missing_images)?;
        } else if self.open_lun() == Some(lun) {
            self.flush();
        }

        self.luns[idx].status = target;
        info!("LUN {} is {}", lun, target);
        Ok(())
    }

    pub fn read_lun_status(&self, lun: u8) -> bool {
        self.lun(lun)
            .is_some_and(|u| u.status == LunStatus::Started)
    }

    /// Checks that a started LUN's image is still present. Never creates an
    /// image, but writes a descriptor synthesized from the image size if the
    /// descriptor is missing.
    pub fn test_lun_status(&mut self, lun: u8) -> bool {
        if !self.read_lun_status(lun) {
            debug!("LUN {} is stopped, cannot test", lun);
            return false;
        }
        match self.validate_lun(lun, false) {
            Ok(()) => true,
            Err(e) => {
                error!("LUN {} failed validation: {}", lun, e);
                false
            }
        }
    }

    pub fn read_lun_user_code(&self, lun: u8) -> [u8; USER_CODE_LEN] {
        self.lun(lun).map_or([0; USER_CODE_LEN], |u| u.user_code)
    }

    /// Selects the active LUN directory. Every LUN is stopped and loses
    /// the geometry and user code of the previous directory.
    ///
    /// Does not mount or dismount.
    pub fn set_lun_directory(&mut self, directory: u8) {
        info!("Selecting LUN directory {}", directory);
        self.flush();
        self.directory = directory;
        self.luns = Default::default();
    }

    pub fn lun_directory(&self) -> u8 {
        self.directory
    }

    /// Ensures the active directory exists, creating it if needed
    fn check_lun_directory(&mut self) -> DriveResult<()> {
        self.flush();
        let dir = self.directory_path(self.directory);
        if self.store.exists(&dir) {
            debug!("LUN directory {} found", dir.display());
        } else {
            self.store.create_dir(&dir)?;
            info!("Created LUN directory {}", dir.display());
        }
        Ok(())
    }

    /// Logs (never fails on) image sizes the host or controller cannot use
    fn check_image_size(path: &Path, size: u64) {
        if size > MAX_IMAGE_BYTES || size % TRACK_BYTES != 0 {
            warn!(
                "{}",
                DriveError::StorageSizeInvalid {
                    path: path.to_path_buf(),
                    size,
                }
            );
        }
    }

    /// Validates a LUN image in the active directory and loads its geometry
    /// and user code.
    pub fn check_lun_image(&mut self, lun: u8) -> DriveResult<()> {
        self.validate_lun(lun, false)
    }

    fn validate_lun(&mut self, lun: u8, create: bool) -> DriveResult<()> {
        let idx = Self::lun_index(lun)?;
        self.flush();

        let directory = self.directory;
        let image = self.image_path(directory, lun);
        if !self.store.exists(&image) {
            if !create {
                return Err(DriveError::StorageNotFound(image));
            }
            self.store.create_file(&image)?;
            info!("Created empty image {}", image.display());
        }
        let size = self.store.file_size(&image)?;
        debug!("Image {} is {} bytes", image.display(), size);

        let geometry = if self.store.exists(&self.descriptor_path(directory, lun)) {
            Self::check_image_size(&image, size);
            let d = self.load_descriptor(directory, lun)?;
            let described = d.capacity_bytes();
            if described != size {
                // The descriptor wins
                warn!(
                    "{}",
                    DriveError::StorageSizeInconsistent {
                        path: image.clone(),
                        actual: size,
                        described,
                    }
                );
            }
            d
        } else {
            info!("No descriptor for LUN {}, creating from image size", lun);
            self.create_dsc_from_image_size(directory, lun, size)?
        };

        let user_code = self.load_user_code(directory, lun);
        let unit = &mut self.luns[idx];
        unit.geometry = Some(geometry);
        unit.user_code = user_code;
        Ok(())
    }

    fn load_descriptor(&self, directory: u8, lun: u8) -> DriveResult<LunDescriptor> {
        let raw = self.store.read_file(&self.descriptor_path(directory, lun))?;
        LunDescriptor::from_bytes(&raw)
    }

    fn load_user_code(&self, directory: u8, lun: u8) -> [u8; USER_CODE_LEN] {
        let path = self.user_code_path(directory, lun);
        if !self.store.exists(&path) {
            debug!("No user code for LUN {}", lun);
            return [0; USER_CODE_LEN];
        }
        match self.store.read_file(&path) {
            Ok(data) if data.len() >= USER_CODE_LEN => {
                let mut code = [0; USER_CODE_LEN];
                code.copy_from_slice(&data[..USER_CODE_LEN]);
                debug!("LUN {} user code {:02X?}", lun, code);
                code
            }
            Ok(data) => {
                warn!(
                    "User code file {} is only {} bytes",
                    path.display(),
                    data.len()
                );
                [0; USER_CODE_LEN]
            }
            Err(e) => {
                warn!("Cannot read {}: {}", path.display(), e);
                [0; USER_CODE_LEN]
            }
        }
    }

    /// Image capacity according to a LUN's descriptor
    pub fn lun_size_from_dsc(&mut self, directory: u8, lun: u8) -> DriveResult<u64> {
        Self::lun_index(lun)?;
        self.flush();
        Ok(self.load_descriptor(directory, lun)?.capacity_bytes())
    }

    /// Writes a descriptor whose geometry covers an image of `size` bytes
    pub fn create_dsc_from_image_size(
        &mut self,
        directory: u8,
        lun: u8,
        size: u64,
    ) -> DriveResult<LunDescriptor> {
        Self::lun_index(lun)?;
        self.flush();

        let path = self.descriptor_path(directory, lun);
        Self::check_image_size(&self.image_path(directory, lun), size);
        let d = LunDescriptor::from_image_size(size);
        self.store.write_file(&path, &d.to_bytes()?)?;
        info!(
            "Created {}: {} cylinders, {} heads",
            path.display(),
            d.cylinders,
            d.heads
        );
        Ok(d)
    }

    fn ensure_directory(&mut self) -> DriveResult<()> {
        let dir = self.directory_path(self.directory);
        if !self.store.exists(&dir) {
            self.store.create_dir(&dir)?;
        }
        Ok(())
    }

    /// Creates an empty image file if there is none
    pub fn create_lun_image(&mut self, lun: u8) -> DriveResult<()> {
        Self::lun_index(lun)?;
        self.flush();
        self.ensure_directory()?;
        let path = self.image_path(self.directory, lun);
        if self.store.create_file(&path)? {
            info!("Created image {}", path.display());
        }
        Ok(())
    }

    /// Creates an empty descriptor file if there is none
    pub fn create_lun_descriptor(&mut self, lun: u8) -> DriveResult<()> {
        Self::lun_index(lun)?;
        self.flush();
        self.ensure_directory()?;
        let path = self.descriptor_path(self.directory, lun);
        if self.store.create_file(&path)? {
            info!("Created descriptor {}", path.display());
        }
        Ok(())
    }

    /// Reads the raw descriptor record of a LUN in the active directory
    pub fn read_lun_descriptor(&mut self, lun: u8) -> DriveResult<[u8; DESCRIPTOR_LEN]> {
        Self::lun_index(lun)?;
        self.flush();
        let path = self.descriptor_path(self.directory, lun);
        let data = self.store.read_file(&path)?;
        let Some(raw) = data.get(..DESCRIPTOR_LEN) else {
            error!("Descriptor {} is only {} bytes", path.display(), data.len());
            return Err(DriveError::Storage(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "descriptor record too short",
            )));
        };
        let mut out = [0; DESCRIPTOR_LEN];
        out.copy_from_slice(raw);
        Ok(out)
    }

    /// Replaces the descriptor record of a LUN. The file must already exist.
    pub fn write_lun_descriptor(
        &mut self,
        lun: u8,
        record: &[u8; DESCRIPTOR_LEN],
    ) -> DriveResult<()> {
        Self::lun_index(lun)?;
        self.flush();
        let path = self.descriptor_path(self.directory, lun);
        if !self.store.exists(&path) {
            error!("Descriptor {} does not exist", path.display());
            return Err(DriveError::StorageNotFound(path));
        }
        self.store.write_file(&path, record)?;
        debug!("Wrote descriptor {}", path.display());
        Ok(())
    }

    /// (Re)allocates the image to the size its descriptor describes.
    ///
    /// The space is reserved rather than written, so `_pattern` has no
    /// effect.
    pub fn format_lun(&mut self, lun: u8, _pattern: u8) -> DriveResult<()> {
        let d = LunDescriptor::from_bytes(&self.read_lun_descriptor(lun)?)?;
        let sectors = d.required_sectors();
        let path = self.image_path(self.directory, lun);
        info!(
            "Formatting LUN {}: {} sectors into {}",
            lun,
            sectors,
            path.display()
        );
        self.store
            .allocate(&path, sectors * SECTOR_SIZE as u64)?;
        Ok(())
    }

    /// Opens (or reuses) the image session for a LUN
    fn session_for(&mut self, lun: u8) -> DriveResult<&mut Session> {
        Self::lun_index(lun)?;
        if self.open_lun() == Some(lun) {
            trace!("LUN {} already open", lun);
        } else {
            self.flush();
            let path = self.image_path(self.directory, lun);
            let handle = self.store.open(&path)?;
            debug!("Opened {}", path.display());
            self.session = Some(Session::new(lun, handle, self.buffer_sectors));
        }
        self.session
            .as_mut()
            .ok_or(DriveError::SessionConflict("no image open"))
    }

    pub fn open_for_read(&mut self, lun: u8, start: u32, count: u32) -> DriveResult<()> {
        debug!("Read LUN {} sector {} count {}", lun, start, count);
        self.session_for(lun)?.begin_read(start, count)
    }

    pub fn read_next_sector(&mut self, out: &mut Sector) -> DriveResult<()> {
        let Some(s) = self.session.as_mut() else {
            return Err(DriveError::SessionConflict("no image open"));
        };
        s.read_next(out)?;
        if self.trace_blocks {
            debug!("Sector read: {}", hex::encode(out));
        }
        Ok(())
    }

    pub fn close_for_read(&mut self) {
        self.end_transfer("read");
    }

    pub fn open_for_write(&mut self, lun: u8, start: u32, count: u32) -> DriveResult<()> {
        debug!("Write LUN {} sector {} count {}", lun, start, count);
        self.session_for(lun)?.begin_write(start, count)
    }

    pub fn write_next_sector(&mut self, data: &Sector) -> DriveResult<()> {
        let Some(s) = self.session.as_mut() else {
            return Err(DriveError::SessionConflict("no image open"));
        };
        if self.trace_blocks {
            debug!("Sector write: {}", hex::encode(data));
        }
        s.write_next(data)
    }

    pub fn close_for_write(&mut self) {
        self.end_transfer("write");
    }

    fn end_transfer(&mut self, kind: &str) {
        let Some(s) = self.session.as_mut() else {
            debug!("Close for {} with no image open", kind);
            return;
        };
        match s.end_transfer() {
            Ok(0) => (),
            Ok(n) => debug!("{} ended with {} sectors outstanding", kind, n),
            Err(e) => {
                error!("Closing {} on LUN {} failed: {}", kind, s.lun(), e);
                self.flush();
            }
        }
    }
}
