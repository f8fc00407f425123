//! The hyperkit machine driver facade.
//!
//! Sequences the boot-media provisioner, disk provisioning, the network
//! identity resolver, and the process lifecycle controller into the
//! [`MachineDriver`] contract. One facade value manages exactly one VM.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use uuid::Uuid;

use berth_core::{CreateFlag, DriverOptions, MachineDriver, MachineState};

use crate::config::{ConsoleMode, DiskConfig, DriverConfig, HyperkitConfig, DOCKER_PORT};
use crate::error::DriverError;
use crate::launch::{HyperkitProcess, Launcher};
use crate::net::{self, DhcpdLeases, LeaseSource};
use crate::process::{self, NativeProcessTable, ProcessTable};
use crate::store::MachineStore;
use crate::{boot, disk, ssh};

/// Stable backend identifier reported to the cluster layer.
pub const DRIVER_NAME: &str = "hyperkit";

/// Reference retry policy for DHCP lease resolution: 30 attempts, 2s apart,
/// giving the guest roughly a minute to boot and request a lease.
const IP_RESOLVE_ATTEMPTS: u32 = 30;
const IP_RESOLVE_INTERVAL: Duration = Duration::from_secs(2);

/// Drives one hyperkit-backed VM through its whole lifecycle.
pub struct HyperkitDriver {
    config: DriverConfig,
    store: MachineStore,
    ip_address: Option<Ipv4Addr>,
    ip_resolve_attempts: u32,
    ip_resolve_interval: Duration,
    launcher: Box<dyn Launcher>,
    process_table: Box<dyn ProcessTable>,
    leases: Box<dyn LeaseSource>,
}

impl HyperkitDriver {
    /// A driver wired to the real hypervisor, process table, and lease file.
    #[must_use]
    pub fn new(store_root: impl Into<PathBuf>, machine_name: impl Into<String>) -> Self {
        Self::with_collaborators(
            MachineStore::new(store_root, machine_name),
            DriverConfig::default(),
            Box::new(HyperkitProcess::with_defaults()),
            Box::new(NativeProcessTable),
            Box::new(DhcpdLeases::default()),
        )
    }

    /// A driver with explicit collaborators, for tests and variant wiring.
    #[must_use]
    pub fn with_collaborators(
        store: MachineStore,
        config: DriverConfig,
        launcher: Box<dyn Launcher>,
        process_table: Box<dyn ProcessTable>,
        leases: Box<dyn LeaseSource>,
    ) -> Self {
        Self {
            config,
            store,
            ip_address: None,
            ip_resolve_attempts: IP_RESOLVE_ATTEMPTS,
            ip_resolve_interval: IP_RESOLVE_INTERVAL,
            launcher,
            process_table,
            leases,
        }
    }

    /// Override the lease resolution budget (reference: 30 attempts, 2s).
    #[must_use]
    pub fn with_ip_resolve_policy(mut self, attempts: u32, interval: Duration) -> Self {
        self.ip_resolve_attempts = attempts;
        self.ip_resolve_interval = interval;
        self
    }

    #[must_use]
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &MachineStore {
        &self.store
    }

    /// The address resolved by the last successful start, if any.
    #[must_use]
    pub fn ip_address(&self) -> Option<Ipv4Addr> {
        self.ip_address
    }

    /// Create the disk image on first boot; an existing image is left
    /// exactly as it is, never recreated or resized.
    fn ensure_disk_image(&self) -> Result<(), DriverError> {
        let disk_path = self.store.disk_path();
        if disk_path.exists() {
            tracing::debug!(path = %disk_path.display(), "disk image already exists");
            return Ok(());
        }
        disk::create_disk_image(
            &self.store.ssh_pub_key_path(),
            &disk_path,
            self.config.disk_size_mb,
        )?;
        // Permissions must be right before hyperkit can ever open the image.
        disk::fix_permissions(&disk_path)
    }

    fn hyperkit_config(&self, uuid: Uuid) -> HyperkitConfig {
        HyperkitConfig {
            kernel_path: self.store.kernel_path(),
            initrd_path: self.store.initrd_path(),
            iso_path: self.store.iso_path(),
            state_dir: self.store.dir(),
            console: ConsoleMode::File,
            cpu_count: self.config.cpu_count,
            memory_mb: self.config.memory_mb,
            uuid,
            disks: vec![DiskConfig {
                path: self.store.disk_path(),
                size_mb: self.config.disk_size_mb,
                driver: "virtio-blk".to_owned(),
            }],
            vmnet: true,
            cmdline: self.config.cmdline.clone(),
        }
    }

    fn send_signal(&self, signal: Signal) -> Result<(), DriverError> {
        process::send_signal(
            self.process_table.as_ref(),
            &self.store.state_file_path(),
            signal,
        )
    }
}

#[async_trait]
impl MachineDriver for HyperkitDriver {
    type Error = DriverError;

    fn driver_name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn create_flags(&self) -> Vec<CreateFlag> {
        DriverConfig::create_flags()
    }

    fn configure(&mut self, options: &DriverOptions) -> Result<(), DriverError> {
        self.config.apply_options(options).map_err(Into::into)
    }

    async fn create(&mut self) -> Result<(), DriverError> {
        self.store.ensure_dir().await?;
        ssh::ensure_keypair(&self.store.ssh_key_path(), &self.store.ssh_pub_key_path())?;
        boot::provision(&self.config.boot2docker_url, &self.store).await?;
        self.start().await
    }

    async fn start(&mut self) -> Result<(), DriverError> {
        self.ensure_disk_image()?;

        // Each boot gets a fresh identity; the MAC, and therefore the IP,
        // follows the UUID. A restarted machine may come up on a new address.
        let uuid = Uuid::new_v4();
        tracing::info!(%uuid, "generated VM UUID");
        let mac = net::derive_mac(&uuid);
        tracing::info!(%mac, lease_form = %mac.lease_form(), "derived MAC address");

        let hyperkit_config = self.hyperkit_config(uuid);
        tracing::info!(cmdline = %hyperkit_config.cmdline, "starting VM");
        self.launcher.launch(&hyperkit_config).await?;

        let ip = net::resolve_ip(
            self.leases.as_ref(),
            &mac,
            self.ip_resolve_attempts,
            self.ip_resolve_interval,
        )
        .await?;
        self.ip_address = Some(ip);
        tracing::info!(machine = self.store.machine_name(), %ip, "machine is up");
        Ok(())
    }

    async fn stop(&self) -> Result<(), DriverError> {
        self.send_signal(Signal::SIGTERM)
    }

    async fn kill(&self) -> Result<(), DriverError> {
        self.send_signal(Signal::SIGKILL)
    }

    async fn restart(&mut self) -> Result<(), DriverError> {
        self.stop().await?;
        self.start().await
    }

    async fn remove(&self) -> Result<(), DriverError> {
        match self.state().await {
            Ok(MachineState::Running) => {
                tracing::info!("machine still running, stopping before removal");
                self.stop().await?;
            }
            Ok(MachineState::Error) => {
                tracing::warn!("machine state could not be read, assuming it was removed already");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "error checking machine state, assuming it was removed already");
            }
        }
        Ok(())
    }

    async fn state(&self) -> Result<MachineState, DriverError> {
        match process::current_state(self.process_table.as_ref(), &self.store.state_file_path()) {
            Ok(state) => Ok(state),
            Err(e) => {
                tracing::warn!(error = %e, "liveness probe failed");
                Ok(MachineState::Error)
            }
        }
    }

    fn url(&self) -> Result<String, DriverError> {
        let ip = self.ip_address.ok_or(DriverError::AddressUnavailable)?;
        Ok(format!("tcp://{ip}:{DOCKER_PORT}"))
    }

    fn ssh_hostname(&self) -> String {
        self.ip_address.map(|ip| ip.to_string()).unwrap_or_default()
    }
}
