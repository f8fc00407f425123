//! Boot-media provisioning: ISO acquisition and artifact extraction.

use std::path::Path;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::error::DriverError;
use crate::iso9660::IsoReader;
use crate::store::{MachineStore, BOOT_CONFIG_FILENAME, INITRD_FILENAME, KERNEL_FILENAME};

/// What gets pulled out of the boot ISO, and where it lands in the store.
const EXTRACT_TARGETS: [(&str, &str); 3] = [
    ("/boot/bzimage", KERNEL_FILENAME),
    ("/boot/initrd", INITRD_FILENAME),
    ("/isolinux/isolinux.cfg", BOOT_CONFIG_FILENAME),
];

/// Guarantee the boot image and its extracted artifacts exist in the store.
///
/// Idempotent: an ISO already in the store is reused, and extraction is
/// skipped when all artifacts are present, so re-provisioning never touches
/// files a booted VM may be holding open.
///
/// # Errors
/// Returns [`DriverError::Provision`] if the source is unreachable or the
/// image is missing an expected path.
pub(crate) async fn provision(source: &str, store: &MachineStore) -> Result<(), DriverError> {
    ensure_boot_image(source, store).await?;
    extract_boot_artifacts(store)
}

async fn ensure_boot_image(source: &str, store: &MachineStore) -> Result<(), DriverError> {
    let iso = store.iso_path();
    if iso.exists() {
        tracing::info!(path = %iso.display(), "using boot image already in store");
        return Ok(());
    }
    if source.is_empty() {
        return Err(DriverError::Provision(
            "no boot image in store and no boot2docker URL configured".to_owned(),
        ));
    }

    if source.starts_with("http://") || source.starts_with("https://") {
        download_iso(source, &iso).await
    } else {
        tracing::info!(from = source, to = %iso.display(), "copying boot image into store");
        tokio::fs::copy(source, &iso)
            .await
            .map_err(|e| DriverError::Provision(format!("copying {source}: {e}")))?;
        Ok(())
    }
}

/// Stream the ISO to `<dest>.part`, then rename, so an interrupted download
/// never leaves a truncated image that would be mistaken for a cached one.
async fn download_iso(url: &str, dest: &Path) -> Result<(), DriverError> {
    tracing::info!(url, "downloading boot image");

    let response = reqwest::get(url)
        .await
        .map_err(|e| DriverError::Provision(format!("request to {url} failed: {e}")))?;
    if !response.status().is_success() {
        return Err(DriverError::Provision(format!(
            "HTTP {} from {url}",
            response.status()
        )));
    }

    let tmp = dest.with_extension("part");
    let _ = tokio::fs::remove_file(&tmp).await;

    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| std::io::Error::other(format!("reading response body: {e}")))?;
            file.write_all(&chunk).await?;
        }
        file.flush().await
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(DriverError::Provision(format!("downloading {url}: {e}")));
    }

    tokio::fs::rename(&tmp, dest)
        .await
        .map_err(|e| DriverError::Provision(format!("renaming {}: {e}", tmp.display())))?;
    tracing::info!(path = %dest.display(), "boot image stored");
    Ok(())
}

fn extract_boot_artifacts(store: &MachineStore) -> Result<(), DriverError> {
    if EXTRACT_TARGETS
        .iter()
        .all(|(_, dest)| store.resolve(dest).exists())
    {
        tracing::debug!("boot artifacts already extracted");
        return Ok(());
    }

    let mut reader = IsoReader::open(&store.iso_path())
        .map_err(|e| DriverError::Provision(format!("opening boot image: {e}")))?;
    for (path_in_iso, dest) in EXTRACT_TARGETS {
        reader
            .extract(path_in_iso, &store.resolve(dest))
            .map_err(|e| DriverError::Provision(format!("extracting {path_in_iso}: {e}")))?;
    }
    tracing::info!(store = %store.dir().display(), "boot artifacts extracted");
    Ok(())
}
