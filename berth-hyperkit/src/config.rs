//! Driver configuration and the hyperkit invocation contract.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use berth_core::{CoreError, CreateFlag, DriverOptions, FlagValue};

/// Port the guest's Docker daemon listens on (TLS).
pub const DOCKER_PORT: u16 = 2376;

pub const FLAG_BOOT2DOCKER_URL: &str = "hyperkit-boot2docker-url";
pub const FLAG_DISK_SIZE: &str = "hyperkit-disk-size";
pub const FLAG_CPU_COUNT: &str = "hyperkit-cpu-count";
pub const FLAG_MEMORY_SIZE: &str = "hyperkit-memory-size";
pub const FLAG_CMDLINE: &str = "hyperkit-cmdline";

const DEFAULT_DISK_SIZE_MB: u64 = 20000;
const DEFAULT_CPU_COUNT: u32 = 1;
const DEFAULT_MEMORY_MB: u32 = 1024;
const DEFAULT_CMDLINE: &str =
    "loglevel=3 user=docker console=ttyS0 console=tty0 noembed nomodeset norestore waitusb=10 base";

/// User-facing configuration for one hyperkit machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Where the boot2docker ISO comes from: an http(s) URL or a local path.
    pub boot2docker_url: String,
    /// Raw disk image size in megabytes.
    pub disk_size_mb: u64,
    /// Number of virtual CPUs.
    pub cpu_count: u32,
    /// Memory size in megabytes.
    pub memory_mb: u32,
    /// Kernel command line passed to the guest at boot.
    pub cmdline: String,
    /// User the cluster layer logs in as over SSH.
    pub ssh_user: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            boot2docker_url: String::new(),
            disk_size_mb: DEFAULT_DISK_SIZE_MB,
            cpu_count: DEFAULT_CPU_COUNT,
            memory_mb: DEFAULT_MEMORY_MB,
            cmdline: DEFAULT_CMDLINE.to_owned(),
            ssh_user: "docker".to_owned(),
        }
    }
}

impl DriverConfig {
    /// The configuration surface the cluster layer may set, with defaults.
    #[must_use]
    pub fn create_flags() -> Vec<CreateFlag> {
        vec![
            CreateFlag {
                name: FLAG_BOOT2DOCKER_URL,
                usage: "URL or local path of the boot2docker ISO copied into the machine store",
                default: FlagValue::String(String::new()),
            },
            CreateFlag {
                name: FLAG_DISK_SIZE,
                usage: "size of the raw disk image created for the VM, in MB",
                default: FlagValue::Int(DEFAULT_DISK_SIZE_MB as i64),
            },
            CreateFlag {
                name: FLAG_CPU_COUNT,
                usage: "number of virtual CPUs given to the VM",
                default: FlagValue::Int(i64::from(DEFAULT_CPU_COUNT)),
            },
            CreateFlag {
                name: FLAG_MEMORY_SIZE,
                usage: "memory given to the VM, in MB",
                default: FlagValue::Int(i64::from(DEFAULT_MEMORY_MB)),
            },
            CreateFlag {
                name: FLAG_CMDLINE,
                usage: "kernel command line the VM boots with",
                default: FlagValue::String(DEFAULT_CMDLINE.to_owned()),
            },
        ]
    }

    /// Apply supplied option values over the current configuration.
    ///
    /// # Errors
    /// Returns [`CoreError::UnknownOption`] for a name no flag declares and
    /// [`CoreError::InvalidValue`] for a wrongly-typed or non-positive size.
    pub fn apply_options(&mut self, options: &DriverOptions) -> Result<(), CoreError> {
        const KNOWN: [&str; 5] = [
            FLAG_BOOT2DOCKER_URL,
            FLAG_DISK_SIZE,
            FLAG_CPU_COUNT,
            FLAG_MEMORY_SIZE,
            FLAG_CMDLINE,
        ];
        for name in options.names() {
            if !KNOWN.contains(&name) {
                return Err(CoreError::UnknownOption { name: name.to_owned() });
            }
        }

        if let Some(url) = options.string(FLAG_BOOT2DOCKER_URL)? {
            self.boot2docker_url = url.to_owned();
        }
        if let Some(size) = options.int(FLAG_DISK_SIZE)? {
            self.disk_size_mb = positive(FLAG_DISK_SIZE, size)?;
        }
        if let Some(count) = options.int(FLAG_CPU_COUNT)? {
            self.cpu_count = narrow(FLAG_CPU_COUNT, positive(FLAG_CPU_COUNT, count)?)?;
        }
        if let Some(size) = options.int(FLAG_MEMORY_SIZE)? {
            self.memory_mb = narrow(FLAG_MEMORY_SIZE, positive(FLAG_MEMORY_SIZE, size)?)?;
        }
        if let Some(cmdline) = options.string(FLAG_CMDLINE)? {
            self.cmdline = cmdline.to_owned();
        }
        Ok(())
    }
}

fn positive(name: &str, value: i64) -> Result<u64, CoreError> {
    u64::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| CoreError::InvalidValue {
            name: name.to_owned(),
            reason: format!("must be a positive integer, got {value}"),
        })
}

fn narrow(name: &str, value: u64) -> Result<u32, CoreError> {
    u32::try_from(value).map_err(|_| CoreError::InvalidValue {
        name: name.to_owned(),
        reason: format!("{value} is out of range"),
    })
}

/// Console wiring for the hyperkit subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConsoleMode {
    /// Serial console logged to a file in the machine store.
    File,
    /// Serial console attached to the launching terminal.
    Stdio,
}

/// One block device handed to the VM.
#[derive(Debug, Clone, Serialize)]
pub struct DiskConfig {
    pub path: PathBuf,
    pub size_mb: u64,
    /// Device driver hyperkit should expose, e.g. `"virtio-blk"`.
    pub driver: String,
}

/// Everything hyperkit needs to boot one VM.
///
/// Assembled by the driver facade on each start and handed to the launcher;
/// paths are passed to the subprocess verbatim.
#[derive(Debug, Clone, Serialize)]
pub struct HyperkitConfig {
    pub kernel_path: PathBuf,
    pub initrd_path: PathBuf,
    pub iso_path: PathBuf,
    /// Directory the subprocess writes its state record into.
    pub state_dir: PathBuf,
    pub console: ConsoleMode,
    pub cpu_count: u32,
    pub memory_mb: u32,
    /// Per-boot unique identifier; the VM's MAC is derived from it.
    pub uuid: Uuid,
    pub disks: Vec<DiskConfig>,
    /// Attach the VM to the host's vmnet network.
    pub vmnet: bool,
    /// Kernel boot arguments.
    pub cmdline: String,
}
