//! Network identity: MAC derivation and DHCP lease resolution.
//!
//! The VM gets a fresh UUID on every boot; vmnet assigns its NIC a MAC
//! address that is a pure function of that UUID. The guest then DHCPs
//! against the host, and the host records the lease in its lease table.
//! Resolving the VM's IP is therefore: derive the MAC, poll the lease table
//! until an entry for it appears.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::DriverError;

/// A 48-bit link-layer address identifying the VM on the host's virtual
/// network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    #[must_use]
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Render in the form the macOS DHCP lease table uses.
    ///
    /// `dhcpd_leases` stores each octet without leading zeros (`0e` appears
    /// as `e`), so matching against the table must use this trimmed form
    /// byte-for-byte.
    #[must_use]
    pub fn lease_form(&self) -> String {
        let o = &self.0;
        format!("{:x}:{:x}:{:x}:{:x}:{:x}:{:x}", o[0], o[1], o[2], o[3], o[4], o[5])
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

/// Derive the VM's MAC address from its boot UUID.
///
/// Pure and deterministic: the same UUID always maps to the same address,
/// mirroring how vmnet assigns MACs, so a lease recorded under a UUID's
/// address can be found again by anyone holding the UUID. The first octet is
/// forced to locally-administered unicast.
#[must_use]
pub fn derive_mac(uuid: &Uuid) -> MacAddress {
    let digest = Sha256::digest(uuid.as_bytes());
    let mut octets = [0u8; 6];
    octets.copy_from_slice(&digest[..6]);
    octets[0] = (octets[0] & 0xfe) | 0x02;
    MacAddress(octets)
}

/// Errors from the lease lookup collaborator.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum LeaseError {
    /// The lease table has no entry for the address (yet).
    #[error("no lease recorded for the address")]
    NotFound,

    /// The lease table itself could not be read.
    #[error("reading lease table {path} failed")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// External lease registry: link-layer address to currently leased IP.
pub trait LeaseSource: Send + Sync {
    /// Look up the IP currently leased to `mac`, `None` if no lease exists.
    ///
    /// # Errors
    /// Returns [`LeaseError::Read`] if the registry could not be consulted.
    fn lookup(&self, mac: &MacAddress) -> Result<Option<Ipv4Addr>, LeaseError>;
}

/// The macOS vmnet DHCP lease table, a brace-delimited text file.
#[derive(Debug, Clone)]
pub struct DhcpdLeases {
    path: PathBuf,
}

impl DhcpdLeases {
    /// Where macOS keeps vmnet leases.
    pub const DEFAULT_PATH: &'static str = "/var/db/dhcpd_leases";

    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for DhcpdLeases {
    fn default() -> Self {
        Self::new(Self::DEFAULT_PATH)
    }
}

impl LeaseSource for DhcpdLeases {
    fn lookup(&self, mac: &MacAddress) -> Result<Option<Ipv4Addr>, LeaseError> {
        let contents = std::fs::read_to_string(&self.path).map_err(|source| LeaseError::Read {
            path: self.path.clone(),
            source,
        })?;
        Ok(find_lease(&contents, mac))
    }
}

#[derive(Debug, Default)]
struct LeaseEntry {
    ip: Option<Ipv4Addr>,
    hw_address: Option<String>,
    expires: Option<DateTime<Utc>>,
}

/// Scan the lease table text for entries bound to `mac`.
///
/// Entries look like:
///
/// ```text
/// {
///     name=node-a
///     ip_address=192.168.64.3
///     hw_address=1,b6:a9:d2:1f:92:3
///     identifier=1,b6:a9:d2:1f:92:3
///     lease=0x66b2a1c4
/// }
/// ```
///
/// The `hw_address` value carries a `1,` hardware-type prefix and trimmed
/// octets. When a MAC appears in several entries (the guest re-leased), the
/// entry with the newest expiry wins. Malformed lines are skipped.
fn find_lease(contents: &str, mac: &MacAddress) -> Option<Ipv4Addr> {
    let wanted = mac.lease_form();
    let mut best: Option<(Option<DateTime<Utc>>, Ipv4Addr)> = None;
    let mut entry = LeaseEntry::default();

    for line in contents.lines() {
        match line.trim() {
            "{" => entry = LeaseEntry::default(),
            "}" => {
                if entry.hw_address.as_deref() == Some(wanted.as_str()) {
                    if let Some(ip) = entry.ip {
                        tracing::debug!(
                            %mac,
                            %ip,
                            expires = ?entry.expires,
                            "lease table entry matches"
                        );
                        if best.as_ref().is_none_or(|(seen, _)| entry.expires >= *seen) {
                            best = Some((entry.expires, ip));
                        }
                    }
                }
            }
            body => {
                let Some((key, value)) = body.split_once('=') else {
                    continue;
                };
                match key {
                    "ip_address" => entry.ip = value.parse().ok(),
                    "hw_address" => {
                        entry.hw_address =
                            value.split_once(',').map(|(_, addr)| addr.to_owned());
                    }
                    "lease" => {
                        entry.expires = i64::from_str_radix(value.trim_start_matches("0x"), 16)
                            .ok()
                            .and_then(|secs| DateTime::from_timestamp(secs, 0));
                    }
                    _ => {}
                }
            }
        }
    }

    best.map(|(_, ip)| ip)
}

/// Poll `leases` for the IP bound to `mac`.
///
/// The guest has to boot and request a lease before the host records one, so
/// early misses are expected and only logged at debug level; the loop sleeps
/// `interval` between attempts and fails only when the whole budget is
/// exhausted. A lookup that succeeds on the k-th attempt performs exactly k
/// lookups and k-1 sleeps.
///
/// # Errors
/// Returns [`DriverError::AddressResolution`] wrapping the last underlying
/// lookup outcome once `max_attempts` lookups have all come up empty.
pub async fn resolve_ip(
    leases: &dyn LeaseSource,
    mac: &MacAddress,
    max_attempts: u32,
    interval: Duration,
) -> Result<Ipv4Addr, DriverError> {
    let mut last = LeaseError::NotFound;
    for attempt in 1..=max_attempts {
        match leases.lookup(mac) {
            Ok(Some(ip)) => {
                tracing::info!(%mac, %ip, attempt, "found IP in lease table");
                return Ok(ip);
            }
            Ok(None) => {
                tracing::debug!(%mac, attempt, max_attempts, "no lease yet");
                last = LeaseError::NotFound;
            }
            Err(e) => {
                tracing::debug!(%mac, attempt, max_attempts, error = %e, "lease lookup failed");
                last = e;
            }
        }
        if attempt < max_attempts {
            tokio::time::sleep(interval).await;
        }
    }
    Err(DriverError::AddressResolution {
        mac: *mac,
        attempts: max_attempts,
        source: last,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn derive_mac_is_deterministic() {
        let uuid = Uuid::parse_str("2c1bd0b8-8e9b-43ea-bfbd-1f8fcd7bb0f3").expect("uuid");
        assert_eq!(derive_mac(&uuid), derive_mac(&uuid), "same UUID must yield same MAC");
    }

    #[test]
    fn derive_mac_distinct_uuids_differ() {
        let a = Uuid::parse_str("2c1bd0b8-8e9b-43ea-bfbd-1f8fcd7bb0f3").expect("uuid");
        let b = Uuid::parse_str("2c1bd0b8-8e9b-43ea-bfbd-1f8fcd7bb0f4").expect("uuid");
        assert_ne!(derive_mac(&a), derive_mac(&b), "distinct UUIDs must yield distinct MACs");
    }

    #[test]
    fn derive_mac_is_locally_administered_unicast() {
        let mac = derive_mac(&Uuid::parse_str("00000000-0000-0000-0000-000000000000").expect("uuid"));
        let first = mac.octets()[0];
        assert_eq!(first & 0x01, 0, "multicast bit must be clear");
        assert_eq!(first & 0x02, 0x02, "locally-administered bit must be set");
    }

    #[test]
    fn lease_form_strips_leading_zeros_per_octet() {
        let mac = MacAddress([0x02, 0x0a, 0x00, 0xd2, 0x05, 0x92]);
        assert_eq!(mac.lease_form(), "2:a:0:d2:5:92");
        assert_eq!(mac.to_string(), "02:0a:00:d2:05:92");
    }

    #[test]
    fn find_lease_matches_trimmed_hw_address() {
        let mac = MacAddress([0xb6, 0xa9, 0xd2, 0x1f, 0x92, 0x03]);
        let table = "\
{
\tname=node-a
\tip_address=192.168.64.3
\thw_address=1,b6:a9:d2:1f:92:3
\tidentifier=1,b6:a9:d2:1f:92:3
\tlease=0x66b2a1c4
}
";
        assert_eq!(find_lease(table, &mac), Some(Ipv4Addr::new(192, 168, 64, 3)));
    }

    #[test]
    fn find_lease_ignores_other_machines() {
        let mac = MacAddress([0xb6, 0xa9, 0xd2, 0x1f, 0x92, 0x03]);
        let table = "\
{
\tname=other
\tip_address=192.168.64.9
\thw_address=1,aa:bb:cc:dd:ee:ff
\tlease=0x66b2a1c4
}
";
        assert_eq!(find_lease(table, &mac), None);
    }

    #[test]
    fn find_lease_prefers_newest_expiry() {
        let mac = MacAddress([0xb6, 0xa9, 0xd2, 0x1f, 0x92, 0x03]);
        let table = "\
{
\tip_address=192.168.64.3
\thw_address=1,b6:a9:d2:1f:92:3
\tlease=0x1000
}
{
\tip_address=192.168.64.7
\thw_address=1,b6:a9:d2:1f:92:3
\tlease=0x2000
}
";
        assert_eq!(
            find_lease(table, &mac),
            Some(Ipv4Addr::new(192, 168, 64, 7)),
            "the re-leased entry with the newest expiry must win"
        );
    }

    #[test]
    fn find_lease_skips_malformed_lines() {
        let mac = MacAddress([0xb6, 0xa9, 0xd2, 0x1f, 0x92, 0x03]);
        let table = "\
garbage line without equals
{
\tip_address=not-an-ip
\thw_address=1,b6:a9:d2:1f:92:3
}
{
\tip_address=192.168.64.4
\thw_address=1,b6:a9:d2:1f:92:3
}
";
        assert_eq!(find_lease(table, &mac), Some(Ipv4Addr::new(192, 168, 64, 4)));
    }

    struct ScriptedLeases {
        succeed_on: u32,
        calls: AtomicU32,
        ip: Ipv4Addr,
    }

    impl ScriptedLeases {
        fn new(succeed_on: u32) -> Self {
            Self {
                succeed_on,
                calls: AtomicU32::new(0),
                ip: Ipv4Addr::new(192, 168, 64, 5),
            }
        }
    }

    impl LeaseSource for ScriptedLeases {
        fn lookup(&self, _mac: &MacAddress) -> Result<Option<Ipv4Addr>, LeaseError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.succeed_on {
                Ok(Some(self.ip))
            } else {
                Ok(None)
            }
        }
    }

    #[tokio::test]
    async fn resolve_ip_returns_on_kth_attempt_with_exactly_k_lookups() {
        let leases = ScriptedLeases::new(3);
        let mac = derive_mac(&Uuid::new_v4());
        let ip = resolve_ip(&leases, &mac, 10, Duration::ZERO)
            .await
            .expect("lease appears on attempt 3");
        assert_eq!(ip, leases.ip);
        assert_eq!(leases.calls.load(Ordering::SeqCst), 3, "must stop at the k-th lookup");
    }

    #[tokio::test]
    async fn resolve_ip_exhausts_exactly_max_attempts() {
        let leases = ScriptedLeases::new(u32::MAX);
        let mac = derive_mac(&Uuid::new_v4());
        let err = resolve_ip(&leases, &mac, 4, Duration::ZERO)
            .await
            .expect_err("lease never appears");
        assert_eq!(leases.calls.load(Ordering::SeqCst), 4, "budget must be honored exactly");
        match err {
            DriverError::AddressResolution { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("expected AddressResolution, got {other}"),
        }
    }

    #[tokio::test]
    async fn resolve_ip_keeps_polling_through_read_errors() {
        struct FlakyLeases {
            calls: AtomicU32,
        }
        impl LeaseSource for FlakyLeases {
            fn lookup(&self, _mac: &MacAddress) -> Result<Option<Ipv4Addr>, LeaseError> {
                let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                if call < 3 {
                    Err(LeaseError::Read {
                        path: PathBuf::from("/var/db/dhcpd_leases"),
                        source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
                    })
                } else {
                    Ok(Some(Ipv4Addr::new(192, 168, 64, 8)))
                }
            }
        }

        let leases = FlakyLeases { calls: AtomicU32::new(0) };
        let mac = derive_mac(&Uuid::new_v4());
        let ip = resolve_ip(&leases, &mac, 5, Duration::ZERO)
            .await
            .expect("errors mid-loop must not abort the retry budget");
        assert_eq!(ip, Ipv4Addr::new(192, 168, 64, 8));
    }

    proptest::proptest! {
        #[test]
        fn proptest_derive_mac_pure(bytes in proptest::prelude::any::<[u8; 16]>()) {
            let uuid = Uuid::from_bytes(bytes);
            proptest::prop_assert_eq!(derive_mac(&uuid), derive_mac(&uuid));
        }

        #[test]
        fn proptest_lease_form_is_valid_lowercase_hex(bytes in proptest::prelude::any::<[u8; 16]>()) {
            let mac = derive_mac(&Uuid::from_bytes(bytes));
            let form = mac.lease_form();
            let groups: Vec<&str> = form.split(':').collect();
            proptest::prop_assert_eq!(groups.len(), 6, "lease form must have 6 octet groups");
            for group in groups {
                proptest::prop_assert!(!group.is_empty() && group.len() <= 2);
                proptest::prop_assert!(group.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
                // A trimmed octet never keeps a leading zero.
                proptest::prop_assert!(group.len() == 1 || !group.starts_with('0'));
            }
        }

        #[test]
        fn proptest_lease_form_round_trips_to_display(bytes in proptest::prelude::any::<[u8; 16]>()) {
            let mac = derive_mac(&Uuid::from_bytes(bytes));
            let padded: String = mac
                .lease_form()
                .split(':')
                .map(|g| format!("{:0>2}", g))
                .collect::<Vec<_>>()
                .join(":");
            proptest::prop_assert_eq!(padded, mac.to_string());
        }
    }
}
