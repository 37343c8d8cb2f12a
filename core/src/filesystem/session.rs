//! Sector session over an open LUN image

use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};

use log::*;

use super::store::ImageHandle;
use crate::error::{DriveError, DriveResult};
use crate::types::{SECTOR_SIZE, Sector};

enum Transfer {
    Idle,
    Read {
        /// Sectors held in the buffer
        buffered: usize,
        /// Next buffered sector to hand out
        cursor: usize,
        /// Sectors of the request not yet fetched from the image
        remaining: u32,
    },
    Write {
        remaining: u32,
    },
}

/// Open image plus the state of the current transfer.
///
/// The image stays open between transfers so repeated access to the same
/// LUN only needs a seek.
pub(super) struct Session {
    lun: u8,
    handle: Box<dyn ImageHandle>,
    buffer: Vec<u8>,
    transfer: Transfer,
}

impl Session {
    pub(super) fn new(lun: u8, handle: Box<dyn ImageHandle>, buffer_sectors: usize) -> Self {
        Self {
            lun,
            handle,
            buffer: vec![0; buffer_sectors.max(1) * SECTOR_SIZE],
            transfer: Transfer::Idle,
        }
    }

    pub(super) fn lun(&self) -> u8 {
        self.lun
    }

    fn buffer_sectors(&self) -> usize {
        self.buffer.len() / SECTOR_SIZE
    }

    fn seek_sector(&mut self, sector: u32) -> DriveResult<()> {
        self.handle
            .seek(SeekFrom::Start(u64::from(sector) * SECTOR_SIZE as u64))?;
        Ok(())
    }

    /// Reads as much as the image holds into `buf`, zero-filling past its
    /// end.
    fn read_padded(handle: &mut dyn ImageHandle, buf: &mut [u8]) -> DriveResult<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match handle.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if filled < buf.len() {
            trace!("Short read, {} bytes zero-filled", buf.len() - filled);
            buf[filled..].fill(0);
        }
        Ok(())
    }

    /// Fetches the next chunk of the request into the buffer
    fn fill(&mut self, remaining: u32) -> DriveResult<()> {
        let sectors = (remaining as usize).min(self.buffer_sectors());
        Self::read_padded(
            self.handle.as_mut(),
            &mut self.buffer[..sectors * SECTOR_SIZE],
        )?;
        self.transfer = Transfer::Read {
            buffered: sectors,
            cursor: 0,
            remaining: remaining - sectors as u32,
        };
        Ok(())
    }

    pub(super) fn begin_read(&mut self, start: u32, count: u32) -> DriveResult<()> {
        self.transfer = Transfer::Idle;
        self.seek_sector(start)?;
        self.fill(count)
    }

    pub(super) fn read_next(&mut self, out: &mut Sector) -> DriveResult<()> {
        let Transfer::Read {
            buffered,
            cursor,
            remaining,
        } = self.transfer
        else {
            return Err(DriveError::SessionConflict("no read in progress"));
        };

        let cursor = if cursor == buffered {
            if remaining == 0 {
                return Err(DriveError::SessionConflict("read past end of request"));
            }
            self.fill(remaining)?;
            0
        } else {
            cursor
        };

        out.copy_from_slice(&self.buffer[cursor * SECTOR_SIZE..(cursor + 1) * SECTOR_SIZE]);
        if let Transfer::Read { cursor: c, .. } = &mut self.transfer {
            *c = cursor + 1;
        }
        Ok(())
    }

    pub(super) fn begin_write(&mut self, start: u32, count: u32) -> DriveResult<()> {
        self.transfer = Transfer::Idle;
        self.seek_sector(start)?;
        self.transfer = Transfer::Write { remaining: count };
        Ok(())
    }

    pub(super) fn write_next(&mut self, data: &Sector) -> DriveResult<()> {
        let Transfer::Write { remaining } = &mut self.transfer else {
            return Err(DriveError::SessionConflict("no write in progress"));
        };
        if *remaining == 0 {
            return Err(DriveError::SessionConflict("write past end of request"));
        }
        *remaining -= 1;
        self.handle.write_all(data)?;
        Ok(())
    }

    /// Ends the current transfer, keeping the image open.
    /// Returns the number of sectors of the request left untransferred.
    pub(super) fn end_transfer(&mut self) -> DriveResult<u32> {
        let left = match self.transfer {
            Transfer::Idle => 0,
            Transfer::Read {
                buffered,
                cursor,
                remaining,
            } => (buffered - cursor) as u32 + remaining,
            Transfer::Write { remaining } => {
                self.handle.flush()?;
                remaining
            }
        };
        self.transfer = Transfer::Idle;
        Ok(left)
    }
}
