//! Raw disk image creation.
//!
//! boot2docker formats its data partition on first boot when the disk
//! starts with a tar archive whose first entry is named
//! `boot2docker, please format-me`; the same archive carries the SSH public
//! key the guest installs as `authorized_keys`. The image is written sparse:
//! only the seed archive occupies real blocks, the rest is a hole up to the
//! configured size.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::error::DriverError;

const FORMAT_MAGIC: &str = "boot2docker, please format-me";
const TAR_BLOCK: usize = 512;
const TYPE_FILE: u8 = b'0';
const TYPE_DIR: u8 = b'5';

/// Create the raw disk image at `disk_path`, seeded for first boot.
///
/// # Errors
/// Returns [`DriverError::DiskCreation`] if the public key cannot be read or
/// the image cannot be written.
pub(crate) fn create_disk_image(
    pub_key_path: &Path,
    disk_path: &Path,
    size_mb: u64,
) -> Result<(), DriverError> {
    let wrap = |source: std::io::Error| DriverError::DiskCreation {
        path: disk_path.to_owned(),
        source,
    };

    let pub_key = std::fs::read(pub_key_path).map_err(wrap)?;

    let mut seed = Vec::new();
    append_entry(&mut seed, FORMAT_MAGIC, 0o644, TYPE_FILE, FORMAT_MAGIC.as_bytes());
    append_entry(&mut seed, ".ssh", 0o700, TYPE_DIR, &[]);
    append_entry(&mut seed, ".ssh/authorized_keys", 0o600, TYPE_FILE, &pub_key);
    append_entry(&mut seed, ".ssh/authorized_keys2", 0o600, TYPE_FILE, &pub_key);
    // End-of-archive marker: two zero blocks.
    seed.resize(seed.len() + 2 * TAR_BLOCK, 0);

    let size_bytes = size_mb * 1024 * 1024;
    if (seed.len() as u64) > size_bytes {
        return Err(wrap(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("disk size {size_mb}MB too small for the boot seed"),
        )));
    }

    let mut file = File::create(disk_path).map_err(wrap)?;
    file.write_all(&seed).map_err(wrap)?;
    file.set_len(size_bytes).map_err(wrap)?;
    tracing::info!(path = %disk_path.display(), size_mb, "created raw disk image");
    Ok(())
}

/// Make the image readable by the hyperkit subprocess.
///
/// Must run before the subprocess is launched so nothing ever observes the
/// image with creation-time permissions.
pub(crate) fn fix_permissions(disk_path: &Path) -> Result<(), DriverError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(disk_path, std::fs::Permissions::from_mode(0o644)).map_err(
            |source| DriverError::DiskCreation {
                path: disk_path.to_owned(),
                source,
            },
        )?;
    }
    Ok(())
}

/// Append one ustar entry (header block plus block-padded data).
fn append_entry(tar: &mut Vec<u8>, name: &str, mode: u32, typeflag: u8, data: &[u8]) {
    let mut header = [0u8; TAR_BLOCK];
    header[..name.len()].copy_from_slice(name.as_bytes());
    octal_field(&mut header[100..108], u64::from(mode));
    octal_field(&mut header[108..116], 0); // uid
    octal_field(&mut header[116..124], 0); // gid
    octal_field(&mut header[124..136], data.len() as u64);
    octal_field(&mut header[136..148], 0); // mtime
    header[156] = typeflag;
    header[257..262].copy_from_slice(b"ustar");
    header[263..265].copy_from_slice(b"00");

    // Checksum is computed with its own field filled with spaces.
    header[148..156].fill(b' ');
    let sum: u32 = header.iter().map(|b| u32::from(*b)).sum();
    let digits = format!("{sum:06o}");
    header[148..154].copy_from_slice(digits.as_bytes());
    header[154] = 0;
    header[155] = b' ';

    tar.extend_from_slice(&header);
    tar.extend_from_slice(data);
    let padding = (TAR_BLOCK - data.len() % TAR_BLOCK) % TAR_BLOCK;
    tar.resize(tar.len() + padding, 0);
}

fn octal_field(field: &mut [u8], value: u64) {
    let width = field.len() - 1;
    let digits = format!("{value:0width$o}");
    field[..width].copy_from_slice(digits.as_bytes());
    field[width] = 0;
}
