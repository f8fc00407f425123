//! Shared fixtures for driver integration tests: a fake hypervisor host
//! (launcher + process table over one shared pid set), scripted lease
//! sources, and a minimal boot2docker-style ISO image.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::Signal;

use berth_hyperkit::{
    DriverError, HyperkitConfig, Launcher, LeaseError, LeaseSource, MacAddress, ProcessTable,
};

/// One fake "OS": pids spawned by [`FakeLauncher`] live here until a signal
/// tears them down. Error injection knobs let tests force probe/signal
/// failures that are not ESRCH.
pub struct FakeHost {
    alive: Mutex<HashSet<i32>>,
    next_pid: AtomicI32,
    pub launches: AtomicU32,
    pub signals_sent: AtomicU32,
    pub probe_errno: Mutex<Option<Errno>>,
    pub signal_errno: Mutex<Option<Errno>>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            alive: Mutex::new(HashSet::new()),
            next_pid: AtomicI32::new(1000),
            launches: AtomicU32::new(0),
            signals_sent: AtomicU32::new(0),
            probe_errno: Mutex::new(None),
            signal_errno: Mutex::new(None),
        })
    }

    pub fn fail_probes_with(&self, errno: Errno) {
        *self.probe_errno.lock().expect("lock") = Some(errno);
    }

    pub fn fail_signals_with(&self, errno: Errno) {
        *self.signal_errno.lock().expect("lock") = Some(errno);
    }
}

/// Launcher that "boots" by allocating a pid in the fake host and writing
/// the machine record the process controller reads, exactly as the real
/// subprocess contract demands.
pub struct FakeLauncher {
    pub host: Arc<FakeHost>,
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self, config: &HyperkitConfig) -> Result<(), DriverError> {
        self.host.launches.fetch_add(1, Ordering::SeqCst);
        let pid = self.host.next_pid.fetch_add(1, Ordering::SeqCst);
        self.host.alive.lock().expect("lock").insert(pid);
        let record = format!(
            r#"{{"pid": {pid}, "uuid": "{}", "cmdline": "{}"}}"#,
            config.uuid, config.cmdline
        );
        std::fs::write(config.state_dir.join("hyperkit.json"), record)?;
        Ok(())
    }
}

pub struct FakeProcessTable {
    pub host: Arc<FakeHost>,
}

impl ProcessTable for FakeProcessTable {
    fn probe(&self, pid: i32) -> Result<(), Errno> {
        if let Some(errno) = *self.host.probe_errno.lock().expect("lock") {
            return Err(errno);
        }
        if self.host.alive.lock().expect("lock").contains(&pid) {
            Ok(())
        } else {
            Err(Errno::ESRCH)
        }
    }

    fn signal(&self, pid: i32, _signal: Signal) -> Result<(), Errno> {
        self.host.signals_sent.fetch_add(1, Ordering::SeqCst);
        if let Some(errno) = *self.host.signal_errno.lock().expect("lock") {
            return Err(errno);
        }
        // Both SIGTERM and SIGKILL take the fake process down immediately.
        if self.host.alive.lock().expect("lock").remove(&pid) {
            Ok(())
        } else {
            Err(Errno::ESRCH)
        }
    }
}

/// Lease table that always has the address.
pub struct StaticLeases(pub Ipv4Addr);

impl LeaseSource for StaticLeases {
    fn lookup(&self, _mac: &MacAddress) -> Result<Option<Ipv4Addr>, LeaseError> {
        Ok(Some(self.0))
    }
}

/// Lease table in which the address never appears.
pub struct NeverLeases;

impl LeaseSource for NeverLeases {
    fn lookup(&self, _mac: &MacAddress) -> Result<Option<Ipv4Addr>, LeaseError> {
        Ok(None)
    }
}

const SECTOR: usize = 2048;

fn mk_record(name: &[u8], lba: u32, size: u32, is_dir: bool) -> Vec<u8> {
    let mut len = 33 + name.len();
    if len % 2 == 1 {
        len += 1;
    }
    let mut rec = vec![0u8; len];
    rec[0] = len as u8;
    rec[2..6].copy_from_slice(&lba.to_le_bytes());
    rec[6..10].copy_from_slice(&lba.to_be_bytes());
    rec[10..14].copy_from_slice(&size.to_le_bytes());
    rec[14..18].copy_from_slice(&size.to_be_bytes());
    rec[25] = if is_dir { 0x02 } else { 0 };
    rec[28..30].copy_from_slice(&1u16.to_le_bytes());
    rec[30..32].copy_from_slice(&1u16.to_be_bytes());
    rec[32] = name.len() as u8;
    rec[33..33 + name.len()].copy_from_slice(name);
    rec
}

fn push_sector(image: &mut Vec<u8>, content: &[u8]) {
    assert!(content.len() <= SECTOR);
    image.extend_from_slice(content);
    image.resize(image.len() + (SECTOR - content.len()), 0);
}

/// A minimal ISO 9660 image with the boot2docker layout: `/boot/bzimage`,
/// `/boot/initrd`, and `/isolinux/isolinux.cfg`.
pub fn build_boot_iso() -> Vec<u8> {
    let root_lba = 18u32;
    let boot_lba = 19u32;
    let isolinux_lba = 20u32;
    let bzimage = b"fake kernel";
    let initrd = b"fake ramdisk";
    let cfg = b"default boot2docker";

    let mut image = vec![0u8; 16 * SECTOR];

    // Primary Volume Descriptor with the root directory record at 156.
    let mut pvd = vec![0u8; SECTOR];
    pvd[0] = 1;
    pvd[1..6].copy_from_slice(b"CD001");
    pvd[6] = 1;
    let root_record = mk_record(&[0], root_lba, SECTOR as u32, true);
    pvd[156..156 + root_record.len()].copy_from_slice(&root_record);
    push_sector(&mut image, &pvd);

    // Volume descriptor set terminator.
    let mut term = vec![0u8; SECTOR];
    term[0] = 255;
    term[1..6].copy_from_slice(b"CD001");
    term[6] = 1;
    push_sector(&mut image, &term);

    // Root: ".", "..", BOOT, ISOLINUX.
    let mut root = Vec::new();
    root.extend_from_slice(&mk_record(&[0], root_lba, SECTOR as u32, true));
    root.extend_from_slice(&mk_record(&[1], root_lba, SECTOR as u32, true));
    root.extend_from_slice(&mk_record(b"BOOT", boot_lba, SECTOR as u32, true));
    root.extend_from_slice(&mk_record(b"ISOLINUX", isolinux_lba, SECTOR as u32, true));
    push_sector(&mut image, &root);

    // /BOOT: BZIMAGE;1 at sector 21, INITRD;1 at 22.
    let mut boot = Vec::new();
    boot.extend_from_slice(&mk_record(&[0], boot_lba, SECTOR as u32, true));
    boot.extend_from_slice(&mk_record(&[1], root_lba, SECTOR as u32, true));
    boot.extend_from_slice(&mk_record(b"BZIMAGE;1", 21, bzimage.len() as u32, false));
    boot.extend_from_slice(&mk_record(b"INITRD;1", 22, initrd.len() as u32, false));
    push_sector(&mut image, &boot);

    // /ISOLINUX: ISOLINUX.CFG;1 at sector 23.
    let mut isolinux = Vec::new();
    isolinux.extend_from_slice(&mk_record(&[0], isolinux_lba, SECTOR as u32, true));
    isolinux.extend_from_slice(&mk_record(&[1], root_lba, SECTOR as u32, true));
    isolinux.extend_from_slice(&mk_record(b"ISOLINUX.CFG;1", 23, cfg.len() as u32, false));
    push_sector(&mut image, &isolinux);

    push_sector(&mut image, bzimage);
    push_sector(&mut image, initrd);
    push_sector(&mut image, cfg);

    image
}
