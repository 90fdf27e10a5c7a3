// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Writes a built mfg image to disk: one binary and one S-record file per
//! device, copies of every target's artifacts, and `manifest.json`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use p256::ecdsa::SigningKey;
use path_slash::PathExt;
use serde::{Deserialize, Serialize};

use crate::blob::DeviceSection;
use crate::builder::{MfgImage, META_DEVICE};
use crate::error::MfgError;
use crate::flash::FlashArea;
use crate::sign;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const MANIFEST_FORMAT: u32 = 2;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MfgManifest {
    pub name: String,
    /// RFC 3339, UTC.
    pub build_time: String,
    pub format: u32,
    pub mfg_hash: String,
    pub version: String,
    /// Device whose binary `bin_path` names.
    pub device: u8,
    pub bin_path: String,
    pub bsp: String,
    pub signatures: Vec<ManifestSignature>,
    pub flash_map: Vec<FlashArea>,
    pub sections: Vec<ManifestSection>,
    pub targets: Vec<ManifestTarget>,
    pub raw: Vec<ManifestRaw>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<ManifestMeta>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSignature {
    /// Hex of the truncated public key hash.
    pub key: String,
    /// Hex of the DER signature.
    pub sig: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSection {
    pub device: u8,
    /// Device offset of the first byte of the binary.
    pub offset: u32,
    pub size: u32,
    pub bin_path: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestTarget {
    pub name: String,
    pub offset: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    pub elf_path: String,
    pub manifest_path: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRaw {
    pub filename: String,
    pub offset: u32,
    pub device: u8,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestMeta {
    /// Device offset one past the footer.
    pub end_offset: u32,
    pub size: u32,
    /// Device offset of the hash TLV's data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_field: Option<u32>,
    pub flash_map: bool,
    pub mmrs: Vec<ManifestMmr>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestMmr {
    pub area: String,
}

pub fn section_bin_name(device: u8) -> String {
    format!("mfgimg_{}.bin", device)
}

pub fn section_srec_name(device: u8) -> String {
    format!("mfgimg_{}.srec", device)
}

fn write_srec(section: &DeviceSection, out: &Path) -> Result<()> {
    let mut srec_out = vec![srec::Record::S0("mfgimg".to_string())];
    // SREC record size limit is 255 (0xFF). 32-bit addressed records
    // additionally contain a four-byte address and one-byte checksum, for a
    // payload limit of 255 - 5.
    let mut addr = section.base;
    for chunk in section.data.chunks(255 - 5) {
        srec_out.push(srec::Record::S3(srec::Data {
            address: srec::Address32(addr),
            data: chunk.to_vec(),
        }));
        addr += chunk.len() as u32;
    }
    let out_sec_count = srec_out.len() - 1; // header
    if out_sec_count < 0x1_00_00 {
        srec_out.push(srec::Record::S5(srec::Count16(out_sec_count as u16)));
    } else if out_sec_count < 0x1_00_00_00 {
        srec_out.push(srec::Record::S6(srec::Count24(out_sec_count as u32)));
    } else {
        panic!("SREC limit of 2^24 output sections exceeded");
    }

    srec_out.push(srec::Record::S7(srec::Address32(section.base)));

    let srec_image = srec::writer::generate_srec_file(&srec_out);
    std::fs::write(out, srec_image)
        .with_context(|| format!("could not write {}", out.display()))?;
    Ok(())
}

/// Copies `src` into `dir`, keeping its file name. Returns the new path.
fn copy_artifact(target: &str, src: &Path, dir: &Path) -> Result<PathBuf> {
    let file_name = src
        .file_name()
        .with_context(|| format!("{} has no file name", src.display()))?;
    let dst = dir.join(file_name);
    match std::fs::copy(src, &dst) {
        Ok(_) => Ok(dst),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Err(MfgError::MissingArtifact {
                target: target.to_string(),
                path: src.to_path_buf(),
            }
            .into())
        }
        Err(e) => Err(e).with_context(|| {
            format!("could not copy {} to {}", src.display(), dst.display())
        }),
    }
}

pub struct MfgEmitter<'a> {
    image: &'a MfgImage,
    out_dir: PathBuf,
    version: String,
    keys: Vec<SigningKey>,
}

impl<'a> MfgEmitter<'a> {
    pub fn new(image: &'a MfgImage, out_dir: &Path, version: &str) -> Self {
        Self {
            image,
            out_dir: out_dir.to_path_buf(),
            version: version.to_string(),
            keys: vec![],
        }
    }

    /// Keys to sign the mfg hash with; each adds one manifest signature.
    pub fn with_keys(mut self, keys: Vec<SigningKey>) -> Self {
        self.keys = keys;
        self
    }

    /// Path relative to the output directory, `/`-separated.
    fn rel(&self, path: &Path) -> Result<String> {
        let rel = path.strip_prefix(&self.out_dir).with_context(|| {
            format!(
                "{} is not under {}",
                path.display(),
                self.out_dir.display()
            )
        })?;
        rel.to_slash()
            .with_context(|| format!("{} is not valid UTF-8", rel.display()))
    }

    fn create_out_dir(&self) -> Result<()> {
        if self.out_dir.exists() {
            std::fs::remove_dir_all(&self.out_dir).with_context(|| {
                format!("could not remove {}", self.out_dir.display())
            })?;
        }
        std::fs::create_dir_all(&self.out_dir).with_context(|| {
            format!("could not create {}", self.out_dir.display())
        })
    }

    fn write_sections(&self) -> Result<Vec<ManifestSection>> {
        let mut out = vec![];
        for s in &self.image.sections {
            let bin = self.out_dir.join(section_bin_name(s.device));
            std::fs::write(&bin, &s.data)
                .with_context(|| format!("could not write {}", bin.display()))?;
            write_srec(s, &self.out_dir.join(section_srec_name(s.device)))?;
            log::debug!(
                "device {}: {} bytes at {:#x}",
                s.device,
                s.data.len(),
                s.base
            );
            out.push(ManifestSection {
                device: s.device,
                offset: s.base,
                size: s.data.len() as u32,
                bin_path: self.rel(&bin)?,
            });
        }
        Ok(out)
    }

    fn copy_targets(&self) -> Result<Vec<ManifestTarget>> {
        let mut out = vec![];
        for t in &self.image.targets {
            let dir = self.out_dir.join("targets").join(t.index.to_string());
            std::fs::create_dir_all(&dir).with_context(|| {
                format!("could not create {}", dir.display())
            })?;

            let name = &t.entry.name;
            let (bin_path, image_path) = if t.is_boot {
                let p = copy_artifact(name, &t.artifacts.bin, &dir)?;
                (Some(self.rel(&p)?), None)
            } else {
                let p = copy_artifact(name, &t.artifacts.image, &dir)?;
                (None, Some(self.rel(&p)?))
            };
            let elf = copy_artifact(name, &t.artifacts.elf, &dir)?;
            let manifest = copy_artifact(name, &t.artifacts.manifest, &dir)?;

            out.push(ManifestTarget {
                name: name.clone(),
                offset: t.part.offset,
                bin_path,
                image_path,
                elf_path: self.rel(&elf)?,
                manifest_path: self.rel(&manifest)?,
            });
        }
        Ok(out)
    }

    fn meta(&self) -> Option<ManifestMeta> {
        self.image.meta.as_ref().map(|m| ManifestMeta {
            end_offset: m.end_offset(),
            size: m.size(),
            hash_field: m.hash_range().map(|r| r.start),
            flash_map: m.meta.has_flash_map(),
            mmrs: m
                .meta
                .mmrs
                .iter()
                .map(|area| ManifestMmr { area: area.clone() })
                .collect(),
        })
    }

    /// Writes everything and returns the manifest that was written.
    pub fn emit(&self) -> Result<MfgManifest> {
        self.create_out_dir()?;

        let sections = self.write_sections()?;
        let bin_path = sections
            .iter()
            .find(|s| s.device == META_DEVICE)
            .map(|s| s.bin_path.clone())
            .with_context(|| {
                format!("no image for device {}", META_DEVICE)
            })?;
        let targets = self.copy_targets()?;

        let raw = self
            .image
            .raws
            .iter()
            .map(|r| ManifestRaw {
                filename: r.file.filename.clone(),
                offset: r.part.offset,
                device: r.part.device,
            })
            .collect();

        let signatures = sign::sign_all(&self.keys, &self.image.hash)?
            .into_iter()
            .map(|s| ManifestSignature {
                key: hex::encode(s.key_hash),
                sig: hex::encode(s.sig),
            })
            .collect();

        let manifest = MfgManifest {
            name: self.image.name.clone(),
            build_time: chrono::Utc::now()
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            format: MANIFEST_FORMAT,
            mfg_hash: hex::encode(self.image.hash),
            version: self.version.clone(),
            device: META_DEVICE,
            bin_path,
            bsp: self.image.bsp.clone(),
            signatures,
            flash_map: self
                .image
                .flash_map
                .sorted_by_id()
                .into_iter()
                .cloned()
                .collect(),
            sections,
            targets,
            raw,
            meta: self.meta(),
        };

        let path = self.out_dir.join(MANIFEST_FILE);
        let json = serde_json::to_string_pretty(&manifest)?;
        std::fs::write(&path, json)
            .with_context(|| format!("could not write {}", path.display()))?;
        log::info!("wrote {}", self.out_dir.display());

        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn srec_addresses_follow_base() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.srec");
        let section = DeviceSection {
            device: 0,
            base: 0x0800_0000,
            data: vec![0xab; 300],
        };
        write_srec(&section, &path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap().to_uppercase();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("S0"));
        // Two data records: 250 bytes, then 50.
        assert!(lines[1].starts_with("S3FF08000000"));
        assert!(lines[2].starts_with("S33708000"));
        assert!(lines[3].starts_with("S5030002"));
        assert!(lines[4].starts_with("S70508000000"));
    }

    #[test]
    fn missing_artifact_on_copy() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("app.elf");
        let err = copy_artifact("app", &src, dir.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MfgError>(),
            Some(MfgError::MissingArtifact { target, .. }) if target == "app"
        ));

        std::fs::write(&src, b"elf").unwrap();
        let out = tempfile::tempdir().unwrap();
        let dst = copy_artifact("app", &src, out.path()).unwrap();
        assert_eq!(dst, out.path().join("app.elf"));
        assert_eq!(std::fs::read(dst).unwrap(), b"elf");
    }

    #[test]
    fn manifest_json_shape() {
        let m = ManifestTarget {
            name: "app".into(),
            offset: 0x4000,
            bin_path: None,
            image_path: Some("targets/1/app.img".into()),
            elf_path: "targets/1/app.elf".into(),
            manifest_path: "targets/1/manifest.json".into(),
        };
        let v = serde_json::to_value(&m).unwrap();
        assert!(v.get("bin_path").is_none());
        assert_eq!(v["image_path"], "targets/1/app.img");
        assert_eq!(v["offset"], 0x4000);
    }
}
