// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Checks an emitted mfg image against itself: the hash embedded in the
//! metadata region and the one in the manifest must both match a fresh
//! computation over the device binaries.

use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::blob::DeviceSection;
use crate::builder::META_DEVICE;
use crate::emit::{MfgManifest, MANIFEST_FILE, MANIFEST_FORMAT};
use crate::error::MfgError;
use crate::hash::{self, HashLoc, MfgHash};
use crate::meta::{self, META_HASH_SZ};

pub fn load_manifest(out_dir: &Path) -> Result<MfgManifest> {
    let path = out_dir.join(MANIFEST_FILE);
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("could not read {}", path.display()))?;
    let manifest: MfgManifest = serde_json::from_str(&text)
        .with_context(|| format!("could not parse {}", path.display()))?;
    if manifest.format != MANIFEST_FORMAT {
        bail!(
            "{}: unsupported manifest format {} (expected {})",
            path.display(),
            manifest.format,
            MANIFEST_FORMAT
        );
    }
    Ok(manifest)
}

pub fn load_sections(
    out_dir: &Path,
    manifest: &MfgManifest,
) -> Result<Vec<DeviceSection>> {
    manifest
        .sections
        .iter()
        .map(|s| {
            let path = out_dir.join(&s.bin_path);
            let data = std::fs::read(&path)
                .with_context(|| format!("could not read {}", path.display()))?;
            if data.len() != s.size as usize {
                bail!(
                    "{} is {:#x} bytes, manifest says {:#x}",
                    path.display(),
                    data.len(),
                    s.size
                );
            }
            Ok(DeviceSection {
                device: s.device,
                base: s.offset,
                data,
            })
        })
        .collect()
}

/// Finds the hash field by parsing the metadata region back out of the
/// device image.
fn find_hash(
    manifest: &MfgManifest,
    sections: &[DeviceSection],
) -> Result<Option<HashLoc>> {
    let Some(m) = &manifest.meta else {
        return Ok(None);
    };
    let section = sections
        .iter()
        .find(|s| s.device == META_DEVICE)
        .ok_or_else(|| MfgError::BadMeta {
            reason: format!("no image for device {}", META_DEVICE),
        })?;
    if m.end_offset < section.base || m.end_offset > section.end() {
        bail!(MfgError::BadMeta {
            reason: format!(
                "end offset {:#x} is outside device {} ({:#x}..{:#x})",
                m.end_offset,
                META_DEVICE,
                section.base,
                section.end()
            ),
        });
    }

    let parsed =
        meta::parse(&section.data, (m.end_offset - section.base) as usize)?;
    if parsed.size != m.size as usize {
        bail!(MfgError::BadMeta {
            reason: format!(
                "region is {:#x} bytes, manifest says {:#x}",
                parsed.size, m.size
            ),
        });
    }

    let Some(tlv) = parsed.hash() else {
        return Ok(None);
    };
    if tlv.data.len() != META_HASH_SZ {
        bail!(MfgError::BadMeta {
            reason: format!("hash TLV holds {} bytes", tlv.data.len()),
        });
    }
    let start = section.base + tlv.data_offset as u32;
    if let Some(field) = m.hash_field {
        if field != start {
            bail!(MfgError::BadMeta {
                reason: format!(
                    "hash field found at {:#x}, manifest says {:#x}",
                    start, field
                ),
            });
        }
    }
    Ok(Some(HashLoc {
        device: META_DEVICE,
        range: start..start + META_HASH_SZ as u32,
    }))
}

/// Validates the mfg image in `out_dir`, returning its hash.
pub fn run(out_dir: &Path) -> Result<MfgHash> {
    let manifest = load_manifest(out_dir)?;
    let sections = load_sections(out_dir, &manifest)?;

    // A damaged region still has to show up as a hash mismatch, so a
    // region that cannot be read back only downgrades the check.
    let loc = match find_hash(&manifest, &sections) {
        Ok(loc) => loc,
        Err(e) if matches!(
            e.downcast_ref::<MfgError>(),
            Some(MfgError::BadMeta { .. })
        ) =>
        {
            log::warn!("{}: {}", manifest.name, e);
            None
        }
        Err(e) => return Err(e),
    };
    let actual = match loc {
        Some(loc) => hash::verify(&sections, &loc)?,
        None => {
            log::warn!(
                "{}: no usable hash record; checking manifest only",
                manifest.name
            );
            hash::calc(&sections)
        }
    };

    if hex::encode(actual) != manifest.mfg_hash.to_lowercase() {
        bail!(MfgError::HashMismatch {
            expected: manifest.mfg_hash.clone(),
            actual: hex::encode(actual),
        });
    }
    log::info!("{}: hash {} ok", manifest.name, manifest.mfg_hash);
    Ok(actual)
}
