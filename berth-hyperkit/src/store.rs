//! Machine store path layout.
//!
//! One directory per machine under `<store root>/machines/<name>`, owned
//! exclusively by that machine: the raw disk image, the boot ISO and the
//! artifacts extracted from it, the SSH keypair, and the state file the
//! hyperkit subprocess writes.

use std::path::{Path, PathBuf};

/// Boot image file name inside the machine directory.
pub const ISO_FILENAME: &str = "boot2docker.iso";
/// State record written by the hyperkit subprocess.
pub const STATE_FILENAME: &str = "hyperkit.json";
/// Kernel image extracted from the boot ISO.
pub const KERNEL_FILENAME: &str = "bzimage";
/// Initial ramdisk extracted from the boot ISO.
pub const INITRD_FILENAME: &str = "initrd";
/// Bootloader configuration extracted from the boot ISO.
pub const BOOT_CONFIG_FILENAME: &str = "isolinux.cfg";

const SSH_KEY_FILENAME: &str = "id_ed25519";

/// Filesystem home of a single machine.
#[derive(Debug, Clone)]
pub struct MachineStore {
    root: PathBuf,
    machine_name: String,
}

impl MachineStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, machine_name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            machine_name: machine_name.into(),
        }
    }

    #[must_use]
    pub fn machine_name(&self) -> &str {
        &self.machine_name
    }

    /// The machine's private directory: `<root>/machines/<name>`.
    #[must_use]
    pub fn dir(&self) -> PathBuf {
        self.root.join("machines").join(&self.machine_name)
    }

    /// Resolve a file name inside the machine directory.
    #[must_use]
    pub fn resolve(&self, file: impl AsRef<Path>) -> PathBuf {
        self.dir().join(file)
    }

    #[must_use]
    pub fn iso_path(&self) -> PathBuf {
        self.resolve(ISO_FILENAME)
    }

    #[must_use]
    pub fn kernel_path(&self) -> PathBuf {
        self.resolve(KERNEL_FILENAME)
    }

    #[must_use]
    pub fn initrd_path(&self) -> PathBuf {
        self.resolve(INITRD_FILENAME)
    }

    #[must_use]
    pub fn boot_config_path(&self) -> PathBuf {
        self.resolve(BOOT_CONFIG_FILENAME)
    }

    #[must_use]
    pub fn state_file_path(&self) -> PathBuf {
        self.resolve(STATE_FILENAME)
    }

    /// The raw disk image: `<dir>/<name>.rawdisk`.
    #[must_use]
    pub fn disk_path(&self) -> PathBuf {
        self.resolve(format!("{}.rawdisk", self.machine_name))
    }

    #[must_use]
    pub fn ssh_key_path(&self) -> PathBuf {
        self.resolve(SSH_KEY_FILENAME)
    }

    #[must_use]
    pub fn ssh_pub_key_path(&self) -> PathBuf {
        self.resolve(format!("{SSH_KEY_FILENAME}.pub"))
    }

    /// Create the machine directory (and parents) if absent.
    ///
    /// The directory is made world-traversable so the hyperkit subprocess,
    /// which may run with different credentials for vmnet access, can reach
    /// the disk and boot artifacts inside.
    ///
    /// # Errors
    /// Returns the underlying I/O error if the directory cannot be created.
    pub async fn ensure_dir(&self) -> std::io::Result<()> {
        let dir = self.dir();
        tokio::fs::create_dir_all(&dir).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o755);
            tokio::fs::set_permissions(&dir, perms).await?;
        }
        Ok(())
    }
}
