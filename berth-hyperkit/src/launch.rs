//! Hyperkit subprocess invocation.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::{ConsoleMode, HyperkitConfig};
use crate::error::DriverError;
use crate::process::MachineRecord;
use crate::store::STATE_FILENAME;

/// Pid file hyperkit maintains itself via `-F`.
const PID_FILENAME: &str = "hyperkit.pid";

/// Spawns the hypervisor subprocess for a machine.
///
/// A seam so lifecycle logic can be driven end-to-end without a real
/// hypervisor; the production implementation is [`HyperkitProcess`].
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Launch the hypervisor with `config` and persist the machine record
    /// the process controller will read pids from. The launched process is
    /// not owned by the caller: it keeps running after the driver value is
    /// dropped and is only ever reached again through OS signals.
    ///
    /// # Errors
    /// Returns [`DriverError::Launch`] if the subprocess cannot be spawned
    /// or never comes up.
    async fn launch(&self, config: &HyperkitConfig) -> Result<(), DriverError>;
}

/// Production launcher execing the `hyperkit` binary.
#[derive(Debug, Clone)]
pub struct HyperkitProcess {
    binary_path: PathBuf,
}

impl HyperkitProcess {
    #[must_use]
    pub fn new(binary_path: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }

    /// Look up `hyperkit` in `$PATH`.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new("hyperkit")
    }

    /// Assemble the hyperkit argv from the invocation contract.
    fn build_args(config: &HyperkitConfig) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-A".to_owned(),
            "-u".to_owned(),
            "-F".to_owned(),
            config.state_dir.join(PID_FILENAME).display().to_string(),
            "-U".to_owned(),
            config.uuid.to_string(),
            "-c".to_owned(),
            config.cpu_count.to_string(),
            "-m".to_owned(),
            format!("{}M", config.memory_mb),
            "-s".to_owned(),
            "0:0,hostbridge".to_owned(),
            "-s".to_owned(),
            "31,lpc".to_owned(),
        ];

        args.push("-l".to_owned());
        match config.console {
            ConsoleMode::File => args.push(format!(
                "com1,autopty={}",
                config.state_dir.join("tty").display()
            )),
            ConsoleMode::Stdio => args.push("com1,stdio".to_owned()),
        }

        if config.vmnet {
            args.push("-s".to_owned());
            args.push("1:0,virtio-net".to_owned());
        }

        args.push("-s".to_owned());
        args.push(format!("2:0,ahci-cd,{}", config.iso_path.display()));

        // Block devices start at slot 4, after the fixed network/CD slots.
        for (index, disk) in config.disks.iter().enumerate() {
            args.push("-s".to_owned());
            args.push(format!(
                "{}:0,{},{}",
                4 + index,
                disk.driver,
                disk.path.display()
            ));
        }

        args.push("-f".to_owned());
        args.push(format!(
            "kexec,{},{},{}",
            config.kernel_path.display(),
            config.initrd_path.display(),
            config.cmdline
        ));

        args
    }

    /// Wait for hyperkit's pid file, proof the subprocess came up.
    async fn wait_for_pid_file(path: &Path) -> Result<(), DriverError> {
        for _ in 0..50u8 {
            if path.exists() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(DriverError::Launch(format!(
            "pid file {} did not appear within 5s",
            path.display()
        )))
    }
}

#[async_trait]
impl Launcher for HyperkitProcess {
    async fn launch(&self, config: &HyperkitConfig) -> Result<(), DriverError> {
        let args = Self::build_args(config);
        tracing::info!(
            binary = %self.binary_path.display(),
            uuid = %config.uuid,
            "spawning hyperkit"
        );
        tracing::debug!(?args, "hyperkit argv");

        let mut child = Command::new(&self.binary_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| DriverError::Launch(format!("exec hyperkit: {e}")))?;

        let raw_pid = child
            .id()
            .ok_or_else(|| DriverError::Launch("hyperkit exited immediately".to_owned()))?;
        let pid = i32::try_from(raw_pid)
            .map_err(|_| DriverError::Launch(format!("pid {raw_pid} out of range")))?;

        // The VM outlives this driver value; only reap the child so a
        // finished hyperkit never lingers as a zombie.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        let record = MachineRecord {
            pid,
            uuid: config.uuid.to_string(),
            cmdline: config.cmdline.clone(),
        };
        let body = serde_json::to_vec_pretty(&record)
            .map_err(|e| DriverError::Launch(format!("encoding machine record: {e}")))?;
        let state_file = config.state_dir.join(STATE_FILENAME);
        tokio::fs::write(&state_file, body).await.map_err(|e| {
            DriverError::Launch(format!("writing {}: {e}", state_file.display()))
        })?;

        Self::wait_for_pid_file(&config.state_dir.join(PID_FILENAME)).await?;

        tracing::info!(pid, "hyperkit is up");
        Ok(())
    }
}
