//! Minimal ISO 9660 reader for boot artifact extraction.
//!
//! The boot2docker ISO carries the kernel, initrd, and bootloader config at
//! fixed paths; the provisioner pulls exactly those files out so hyperkit
//! can kexec-boot without mounting the image. This module does just enough
//! ECMA-119: find the Primary Volume Descriptor, walk directory records, and
//! copy one file extent at a time. No Rock Ridge, no Joliet, no multi-extent
//! files; the boot media needs none of them.
//!
//! Names are matched case-insensitively with the `;1` version suffix
//! stripped, since ISO directory records store `BOOT/BZIMAGE.;1`-style names
//! for what Linux calls `boot/bzimage`.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Sector ("logical block") size, hardcoded by ECMA-119.
const SECTOR_SIZE: u64 = 2048;
/// Volume descriptors start after the 16-sector system area.
const FIRST_DESCRIPTOR_SECTOR: u64 = 16;
/// Descriptor type codes.
const PRIMARY_VOLUME: u8 = 1;
const SET_TERMINATOR: u8 = 255;
/// Standard identifier present in every volume descriptor.
const STANDARD_ID: &[u8; 5] = b"CD001";
/// Directory-record flag bit marking a directory.
const FLAG_DIRECTORY: u8 = 0x02;
/// Offset of the root directory record inside the PVD.
const ROOT_RECORD_OFFSET: usize = 156;

#[derive(Debug, thiserror::Error)]
pub(crate) enum IsoError {
    #[error("not an ISO 9660 image (no primary volume descriptor)")]
    NotIso,

    #[error("path '{0}' not found in image")]
    MissingPath(String),

    #[error("path '{0}' is a directory, not a file")]
    NotAFile(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One parsed directory record.
#[derive(Debug, Clone)]
struct DirRecord {
    extent_lba: u32,
    data_len: u32,
    is_dir: bool,
    name: String,
}

pub(crate) struct IsoReader {
    file: File,
    root: DirRecord,
}

impl IsoReader {
    /// Open an image and locate its primary volume descriptor.
    pub(crate) fn open(path: &Path) -> Result<Self, IsoError> {
        let mut file = File::open(path)?;
        let mut sector = vec![0u8; SECTOR_SIZE as usize];

        // Walk the descriptor set until the PVD or the terminator. A bound
        // keeps a truncated or hostile image from seeking forever.
        for index in 0..64u64 {
            let lba = FIRST_DESCRIPTOR_SECTOR + index;
            file.seek(SeekFrom::Start(lba * SECTOR_SIZE))?;
            if file.read_exact(&mut sector).is_err() {
                return Err(IsoError::NotIso);
            }
            if &sector[1..6] != STANDARD_ID {
                return Err(IsoError::NotIso);
            }
            match sector[0] {
                PRIMARY_VOLUME => {
                    let root = parse_record(&sector[ROOT_RECORD_OFFSET..])
                        .ok_or(IsoError::NotIso)?
                        .0;
                    return Ok(Self { file, root });
                }
                SET_TERMINATOR => return Err(IsoError::NotIso),
                _ => {}
            }
        }
        Err(IsoError::NotIso)
    }

    /// Copy the file at `path_in_iso` (e.g. `/boot/bzimage`) to `dest`.
    pub(crate) fn extract(&mut self, path_in_iso: &str, dest: &Path) -> Result<(), IsoError> {
        let record = self.lookup(path_in_iso)?;
        if record.is_dir {
            return Err(IsoError::NotAFile(path_in_iso.to_owned()));
        }

        self.file
            .seek(SeekFrom::Start(u64::from(record.extent_lba) * SECTOR_SIZE))?;
        let mut out = File::create(dest)?;
        let mut remaining = u64::from(record.data_len);
        let mut buf = vec![0u8; 64 * 1024];
        while remaining > 0 {
            let take = remaining.min(buf.len() as u64) as usize;
            self.file.read_exact(&mut buf[..take])?;
            out.write_all(&buf[..take])?;
            remaining -= take as u64;
        }
        out.flush()?;
        Ok(())
    }

    /// Resolve an absolute path to its directory record.
    fn lookup(&mut self, path_in_iso: &str) -> Result<DirRecord, IsoError> {
        let mut current = self.root.clone();
        for component in path_in_iso.split('/').filter(|c| !c.is_empty()) {
            if !current.is_dir {
                return Err(IsoError::MissingPath(path_in_iso.to_owned()));
            }
            current = self
                .read_dir(&current)?
                .into_iter()
                .find(|r| r.name.eq_ignore_ascii_case(component))
                .ok_or_else(|| IsoError::MissingPath(path_in_iso.to_owned()))?;
        }
        Ok(current)
    }

    /// Read all records of one directory extent.
    fn read_dir(&mut self, dir: &DirRecord) -> Result<Vec<DirRecord>, IsoError> {
        self.file
            .seek(SeekFrom::Start(u64::from(dir.extent_lba) * SECTOR_SIZE))?;
        let mut data = vec![0u8; dir.data_len as usize];
        self.file.read_exact(&mut data)?;

        let mut records = Vec::new();
        let mut offset = 0usize;
        while offset < data.len() {
            if data[offset] == 0 {
                // Records never span sectors; a zero length byte means the
                // rest of this sector is padding.
                offset = next_sector_boundary(offset);
                continue;
            }
            let Some((record, len)) = parse_record(&data[offset..]) else {
                break;
            };
            // "." and ".." are stored as the 0x00 and 0x01 name bytes.
            if record.name != "\u{0}" && record.name != "\u{1}" {
                records.push(record);
            }
            offset += len;
        }
        Ok(records)
    }
}

fn next_sector_boundary(offset: usize) -> usize {
    let sector = SECTOR_SIZE as usize;
    (offset / sector + 1) * sector
}

/// Parse one directory record from the start of `buf`.
///
/// Returns the record and its on-disk length, or `None` if the bytes do not
/// form a complete record.
fn parse_record(buf: &[u8]) -> Option<(DirRecord, usize)> {
    let len = *buf.first()? as usize;
    if len < 34 || len > buf.len() {
        return None;
    }
    let extent_lba = u32::from_le_bytes(buf[2..6].try_into().ok()?);
    let data_len = u32::from_le_bytes(buf[10..14].try_into().ok()?);
    let flags = buf[25];
    let name_len = buf[32] as usize;
    if 33 + name_len > len {
        return None;
    }
    let raw = &buf[33..33 + name_len];
    let name = match raw {
        [0] => "\u{0}".to_owned(),
        [1] => "\u{1}".to_owned(),
        _ => decode_name(raw),
    };
    Some((
        DirRecord {
            extent_lba,
            data_len,
            is_dir: flags & FLAG_DIRECTORY != 0,
            name,
        },
        len,
    ))
}

/// Strip the `;1` version suffix and any trailing separator dot.
fn decode_name(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let text = text.split(';').next().unwrap_or(&text);
    text.trim_end_matches('.').to_owned()
}
