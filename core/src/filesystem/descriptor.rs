//! LUN descriptor (`.dsc`) record
//!
//! This is the ACB-4000 mode select parameter list as the host sends it:
//! a 4-byte header, one 8-byte extent descriptor and a 10-byte drive
//! parameter list.

use std::fmt;
use std::io::Cursor;

use binrw::{BinRead, BinWrite, binrw};
use log::*;

use crate::error::{DriveError, DriveResult};
use crate::types::SECTOR_SIZE;

/// Size of the record on disk
pub const DESCRIPTOR_LEN: usize = 22;

/// Sectors per track (SuperForm 2:1 interleave)
pub const SECTORS_PER_TRACK: u64 = 33;

/// Bytes per track
pub const TRACK_BYTES: u64 = SECTORS_PER_TRACK * SECTOR_SIZE as u64;

/// Largest image ADFS can address (21-bit sector numbers)
pub const MAX_IMAGE_BYTES: u64 = 0x1F_FFFF * SECTOR_SIZE as u64;

const MAX_HEADS: u64 = 16;

#[binrw]
#[brw(big)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LunDescriptor {
    pub reserved0: [u8; 3],

    /// Length of the extent descriptor list (always 8)
    pub extent_list_len: u8,

    pub density: u8,
    pub reserved1: [u8; 4],

    /// 24-bit block size
    #[br(map = |b: [u8; 3]| u32::from_be_bytes([0, b[0], b[1], b[2]]))]
    #[bw(map = |v: &u32| { let b = v.to_be_bytes(); [b[1], b[2], b[3]] })]
    pub block_size: u32,

    pub list_format: u8,
    pub cylinders: u16,
    pub heads: u8,
    pub reduced_write_current: u16,
    pub write_precomp: u16,
    pub landing_zone: u8,
    pub step_rate: u8,
}

impl LunDescriptor {
    /// Builds a descriptor with default drive parameters
    pub fn from_geometry(cylinders: u16, heads: u8) -> Self {
        Self {
            reserved0: [0; 3],
            extent_list_len: 8,
            density: 0,
            reserved1: [0; 4],
            block_size: SECTOR_SIZE as u32,
            list_format: 1,
            cylinders,
            heads,
            reduced_write_current: 128,
            write_precomp: 128,
            landing_zone: 0,
            step_rate: 1,
        }
    }

    /// Synthesizes a geometry that covers an image of `size` bytes.
    ///
    /// The head count is the largest value up to 16 that divides the track
    /// count evenly.
    pub fn from_image_size(size: u64) -> Self {
        let tracks = size / TRACK_BYTES;
        let mut heads = MAX_HEADS;
        while tracks % heads != 0 && heads != 1 {
            heads -= 1;
        }
        let cylinders = tracks / heads;
        let cylinders = u16::try_from(cylinders).unwrap_or_else(|_| {
            warn!(
                "Image of {} bytes needs {} cylinders, clamping to {}",
                size,
                cylinders,
                u16::MAX
            );
            u16::MAX
        });
        debug!(
            "Geometry for {} bytes: {} tracks, {} heads, {} cylinders",
            size, tracks, heads, cylinders
        );
        Self::from_geometry(cylinders, heads as u8)
    }

    /// Data capacity in bytes
    pub fn capacity_bytes(&self) -> u64 {
        self.required_sectors() * u64::from(self.block_size)
    }

    /// Number of blocks the geometry holds
    pub fn required_sectors(&self) -> u64 {
        u64::from(self.heads) * u64::from(self.cylinders) * SECTORS_PER_TRACK
    }

    pub fn from_bytes(data: &[u8]) -> DriveResult<Self> {
        if data.len() < DESCRIPTOR_LEN {
            return Err(DriveError::Storage(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("descriptor is {} bytes, expected {}", data.len(), DESCRIPTOR_LEN),
            )));
        }
        let mut cursor = Cursor::new(&data[..DESCRIPTOR_LEN]);
        Self::read(&mut cursor).map_err(|e| DriveError::Storage(std::io::Error::other(e)))
    }

    pub fn to_bytes(&self) -> DriveResult<[u8; DESCRIPTOR_LEN]> {
        let mut out = [0; DESCRIPTOR_LEN];
        let mut cursor = Cursor::new(&mut out[..]);
        self.write(&mut cursor)
            .map_err(|e| DriveError::Storage(std::io::Error::other(e)))?;
        Ok(out)
    }
}

impl fmt::Display for LunDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Cylinders:               {}", self.cylinders)?;
        writeln!(f, "Heads:                   {}", self.heads)?;
        writeln!(f, "Block size:              {}", self.block_size)?;
        writeln!(f, "Density code:            {}", self.density)?;
        writeln!(f, "List format code:        {}", self.list_format)?;
        writeln!(f, "Reduced write current:   {}", self.reduced_write_current)?;
        writeln!(f, "Write precompensation:   {}", self.write_precomp)?;
        writeln!(f, "Landing zone:            {}", self.landing_zone)?;
        writeln!(f, "Step pulse rate code:    {}", self.step_rate)?;
        write!(f, "Capacity:                {} bytes", self.capacity_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        let d = LunDescriptor::from_geometry(0x1234, 4);
        assert_eq!(
            d.to_bytes().unwrap(),
            [
                0, 0, 0, 8, // header
                0, 0, 0, 0, 0, 0, 1, 0, // extent descriptor
                1, 0x12, 0x34, 4, 0, 128, 0, 128, 0, 1, // drive parameters
            ]
        );
    }

    #[test]
    fn byte_exact_round_trip() {
        // Nonzero reserved bytes and an odd block size must survive
        let raw: [u8; DESCRIPTOR_LEN] = [
            1, 2, 3, 8, 5, 6, 7, 8, 9, 0x01, 0x02, 0x03, 2, 0x01, 0x32, 8, 0x00, 0x99, 0x01, 0x00,
            7, 3,
        ];
        let d = LunDescriptor::from_bytes(&raw).unwrap();
        assert_eq!(d.block_size, 0x010203);
        assert_eq!(d.cylinders, 0x0132);
        assert_eq!(d.write_precomp, 0x0100);
        assert_eq!(d.to_bytes().unwrap(), raw);
    }

    #[test]
    fn short_record() {
        assert!(LunDescriptor::from_bytes(&[0; 21]).is_err());
    }

    #[test]
    fn geometry_ten_megabytes() {
        // 10 MB image, 1240 tracks
        let d = LunDescriptor::from_image_size(10_475_520);
        assert_eq!(d.heads, 10);
        assert_eq!(d.cylinders, 124);
        assert_eq!(d.capacity_bytes(), 10_475_520);
    }

    #[test]
    fn geometry_prime_track_count() {
        // 17 tracks only divides by 1
        let d = LunDescriptor::from_image_size(17 * TRACK_BYTES);
        assert_eq!(d.heads, 1);
        assert_eq!(d.cylinders, 17);
    }

    #[test]
    fn geometry_sixteen_heads() {
        let d = LunDescriptor::from_image_size(32 * TRACK_BYTES);
        assert_eq!(d.heads, 16);
        assert_eq!(d.cylinders, 2);
    }

    #[test]
    fn geometry_empty_image() {
        let d = LunDescriptor::from_image_size(0);
        assert_eq!(d.heads, 16);
        assert_eq!(d.cylinders, 0);
        assert_eq!(d.capacity_bytes(), 0);
    }

    #[test]
    fn geometry_partial_track_ignored() {
        let d = LunDescriptor::from_image_size(3 * TRACK_BYTES + 100);
        assert_eq!(d.heads, 3);
        assert_eq!(d.cylinders, 1);
    }

    #[test]
    fn geometry_all_track_counts() {
        for tracks in 0..=4096u64 {
            let d = LunDescriptor::from_image_size(tracks * TRACK_BYTES);
            let heads = u64::from(d.heads);
            let largest = (1..=16).rev().find(|h| tracks % h == 0).unwrap();
            assert_eq!(heads, largest, "{} tracks", tracks);
            assert_eq!(heads * u64::from(d.cylinders), tracks, "{} tracks", tracks);
        }
    }

    #[test]
    fn required_sectors() {
        let d = LunDescriptor::from_geometry(300, 4);
        assert_eq!(d.required_sectors(), 300 * 4 * 33);
    }
}
