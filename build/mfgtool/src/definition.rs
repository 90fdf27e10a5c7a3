// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Decoding of an mfg definition (`mfg.toml`).
//!
//! ```toml
//! bootloader = "boot"
//! images = [{ name = "app", offset = "end" }]
//!
//! [[raw]]
//! file = "calib.bin"
//! area = "FLASH_AREA_NFFS"
//! offset = 0
//!
//! [meta]
//! area = "FLASH_AREA_MFG"
//! hash = true
//! flash-map = true
//! mmrs = [{ area = "FLASH_AREA_BOOTLOADER" }]
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::MfgError;
use crate::flash::parse_size;

/// At most one image per slot.
pub const MAX_IMAGES: usize = 2;

pub const BOOTLOADER_AREA: &str = "FLASH_AREA_BOOTLOADER";
pub const IMAGE_AREAS: [&str; MAX_IMAGES] =
    ["FLASH_AREA_IMAGE_0", "FLASH_AREA_IMAGE_1"];

/// Where inside its flash area a segment starts.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Offset {
    /// Bytes from the start of the area.
    Absolute(u32),
    /// Wherever makes the segment end exactly at the end of the area.
    End,
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Offset::Absolute(o) => write!(f, "{:#x}", o),
            Offset::End => write!(f, "end"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Slot {
    Bootloader,
    Image(usize),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetEntry {
    pub name: String,
    pub slot: Slot,
    pub area: String,
    pub offset: Offset,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Placement {
    Area { area: String, offset: Offset },
    /// Raw device address; no area bounds apply.
    Device { device: u8, offset: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawFile {
    /// As written in the definition.
    pub filename: String,
    /// `filename` resolved against the definition's directory.
    pub path: PathBuf,
    pub placement: Placement,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetaSpec {
    pub area: String,
    pub hash: bool,
    pub flash_map: bool,
    pub mmrs: Vec<String>,
}

/// A decoded and validated mfg definition. Read-only once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Definition {
    pub name: String,
    pub base_dir: PathBuf,
    pub bsp: Option<String>,
    pub targets: Vec<TargetEntry>,
    pub raws: Vec<RawFile>,
    pub meta: Option<MetaSpec>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawDefinition {
    bsp: Option<String>,
    bootloader: Option<RawTarget>,
    #[serde(default)]
    images: Vec<RawTarget>,
    #[serde(default)]
    raw: Vec<RawEntry>,
    meta: Option<RawMeta>,
}

/// Targets are written either as a bare name or as a table.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum RawTarget {
    Name(String),
    Full(RawTargetTable),
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawTargetTable {
    name: String,
    area: Option<String>,
    offset: Option<RawOffset>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawEntry {
    file: Option<String>,
    area: Option<String>,
    device: Option<u8>,
    offset: Option<RawOffset>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawMeta {
    area: Option<String>,
    #[serde(default)]
    hash: bool,
    #[serde(default)]
    flash_map: bool,
    #[serde(default)]
    mmrs: Vec<RawMmr>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawMmr {
    area: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum RawOffset {
    Int(i64),
    Text(String),
}

fn decode_err(field: impl Into<String>, reason: impl Into<String>) -> MfgError {
    MfgError::Decode {
        field: field.into(),
        reason: reason.into(),
    }
}

fn decode_offset(field: &str, raw: &RawOffset) -> Result<Offset, MfgError> {
    match raw {
        RawOffset::Int(v) => u32::try_from(*v)
            .map(Offset::Absolute)
            .map_err(|_| {
                decode_err(
                    field,
                    format!("offset {} is not a valid 32-bit offset", v),
                )
            }),
        RawOffset::Text(s) if s.trim().eq_ignore_ascii_case("end") => {
            Ok(Offset::End)
        }
        RawOffset::Text(s) => parse_size(s)
            .ok()
            .and_then(|v| u32::try_from(v).ok())
            .map(Offset::Absolute)
            .ok_or_else(|| {
                decode_err(
                    field,
                    format!(
                        "'{}' is neither an offset nor the token \"end\"",
                        s
                    ),
                )
            }),
    }
}

impl Definition {
    /// Loads `mfg.toml`; the definition takes its name from the directory
    /// containing it, and relative raw filenames resolve against that
    /// directory.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| {
            format!("could not read mfg definition {}", path.display())
        })?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let name = base_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mfg".to_string());
        Self::from_toml(&name, &base_dir, &text)
            .with_context(|| format!("in {}", path.display()))
    }

    pub fn from_toml(name: &str, base_dir: &Path, text: &str) -> Result<Self> {
        let raw: RawDefinition = toml::from_str(text)
            .map_err(|e| decode_err("mfg.toml", e.to_string().trim()))?;
        Ok(Self::decode(name, base_dir, raw)?)
    }

    fn decode(
        name: &str,
        base_dir: &Path,
        raw: RawDefinition,
    ) -> Result<Self, MfgError> {
        if raw.images.len() > MAX_IMAGES {
            return Err(decode_err(
                "images",
                format!(
                    "at most {} image targets are allowed, found {}",
                    MAX_IMAGES,
                    raw.images.len()
                ),
            ));
        }

        let mut targets = vec![];
        if let Some(t) = &raw.bootloader {
            targets.push(decode_target(
                "bootloader",
                t,
                Slot::Bootloader,
                BOOTLOADER_AREA,
            )?);
        }
        for (i, t) in raw.images.iter().enumerate() {
            targets.push(decode_target(
                &format!("images[{}]", i),
                t,
                Slot::Image(i),
                IMAGE_AREAS[i],
            )?);
        }

        if targets.is_empty() && raw.bsp.is_none() {
            return Err(decode_err(
                "bsp",
                "required when the definition lists no targets",
            ));
        }

        let raws = raw
            .raw
            .iter()
            .enumerate()
            .map(|(i, r)| decode_raw(i, r, base_dir))
            .collect::<Result<Vec<_>, _>>()?;

        let meta = raw.meta.as_ref().map(decode_meta).transpose()?;

        Ok(Definition {
            name: name.to_string(),
            base_dir: base_dir.to_path_buf(),
            bsp: raw.bsp,
            targets,
            raws,
            meta,
        })
    }
}

fn decode_target(
    field: &str,
    raw: &RawTarget,
    slot: Slot,
    default_area: &str,
) -> Result<TargetEntry, MfgError> {
    let (name, area, offset) = match raw {
        RawTarget::Name(n) => (n, None, None),
        RawTarget::Full(t) => (&t.name, t.area.as_ref(), t.offset.as_ref()),
    };
    if name.is_empty() {
        return Err(decode_err(format!("{}.name", field), "empty target name"));
    }
    let offset = match offset {
        Some(o) => decode_offset(&format!("{}.offset", field), o)?,
        None => Offset::Absolute(0),
    };
    Ok(TargetEntry {
        name: name.clone(),
        slot,
        area: area.cloned().unwrap_or_else(|| default_area.to_string()),
        offset,
    })
}

fn decode_raw(
    index: usize,
    raw: &RawEntry,
    base_dir: &Path,
) -> Result<RawFile, MfgError> {
    let field = |f: &str| format!("raw[{}].{}", index, f);

    let filename = raw
        .file
        .clone()
        .ok_or_else(|| decode_err(field("file"), "missing source filename"))?;
    let offset = raw
        .offset
        .as_ref()
        .ok_or_else(|| decode_err(field("offset"), "missing offset"))?;
    let offset = decode_offset(&field("offset"), offset)?;

    let placement = match (&raw.area, raw.device) {
        (Some(_), Some(_)) => {
            return Err(decode_err(
                field("device"),
                "specify either `area` or `device`, not both",
            ))
        }
        (None, None) => {
            return Err(decode_err(
                field("area"),
                "missing flash area or device",
            ))
        }
        (Some(area), None) => Placement::Area {
            area: area.clone(),
            offset,
        },
        (None, Some(device)) => match offset {
            Offset::Absolute(offset) => Placement::Device { device, offset },
            Offset::End => {
                return Err(decode_err(
                    field("offset"),
                    "\"end\" needs a flash area to anchor to",
                ))
            }
        },
    };

    let path = base_dir.join(&filename);
    Ok(RawFile {
        filename,
        path,
        placement,
    })
}

fn decode_meta(raw: &RawMeta) -> Result<MetaSpec, MfgError> {
    let area = raw
        .area
        .clone()
        .ok_or_else(|| decode_err("meta.area", "missing flash area"))?;
    let mmrs = raw
        .mmrs
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let field = format!("meta.mmrs[{}].area", i);
            match &m.area {
                None => Err(decode_err(field, "missing flash area")),
                Some(a) if *a == area => Err(decode_err(
                    field,
                    "a metadata region cannot reference itself",
                )),
                Some(a) => Ok(a.clone()),
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(MetaSpec {
        area,
        hash: raw.hash,
        flash_map: raw.flash_map,
        mmrs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn decode(text: &str) -> Result<Definition> {
        Definition::from_toml("test", Path::new("/mfgs/test"), text)
    }

    fn decode_field(text: &str) -> String {
        let err = decode(text).unwrap_err();
        match err.downcast_ref::<MfgError>() {
            Some(MfgError::Decode { field, .. }) => field.clone(),
            _ => panic!("unexpected error: {:?}", err),
        }
    }

    #[test]
    fn full_definition() {
        let def = decode(indoc! {r#"
            bootloader = "boot"
            images = [
                { name = "app", offset = "end" },
                { name = "app2", area = "FLASH_AREA_OTHER", offset = 0x100 },
            ]

            [[raw]]
            file = "data/calib.bin"
            area = "FLASH_AREA_NFFS"
            offset = "END"

            [[raw]]
            file = "/abs/blob.bin"
            device = 1
            offset = "0x2000"

            [meta]
            area = "FLASH_AREA_MFG"
            hash = true
            mmrs = [{ area = "FLASH_AREA_BOOTLOADER" }]
        "#})
        .unwrap();

        assert_eq!(def.bsp, None);
        assert_eq!(
            def.targets,
            [
                TargetEntry {
                    name: "boot".into(),
                    slot: Slot::Bootloader,
                    area: BOOTLOADER_AREA.into(),
                    offset: Offset::Absolute(0),
                },
                TargetEntry {
                    name: "app".into(),
                    slot: Slot::Image(0),
                    area: "FLASH_AREA_IMAGE_0".into(),
                    offset: Offset::End,
                },
                TargetEntry {
                    name: "app2".into(),
                    slot: Slot::Image(1),
                    area: "FLASH_AREA_OTHER".into(),
                    offset: Offset::Absolute(0x100),
                },
            ]
        );
        assert_eq!(def.raws[0].path, Path::new("/mfgs/test/data/calib.bin"));
        assert_eq!(
            def.raws[0].placement,
            Placement::Area {
                area: "FLASH_AREA_NFFS".into(),
                offset: Offset::End
            }
        );
        assert_eq!(def.raws[1].path, Path::new("/abs/blob.bin"));
        assert_eq!(
            def.raws[1].placement,
            Placement::Device {
                device: 1,
                offset: 0x2000
            }
        );
        assert_eq!(
            def.meta,
            Some(MetaSpec {
                area: "FLASH_AREA_MFG".into(),
                hash: true,
                flash_map: false,
                mmrs: vec!["FLASH_AREA_BOOTLOADER".into()],
            })
        );
    }

    #[test]
    fn no_targets_needs_bsp() {
        assert_eq!(decode_field("raw = []\n"), "bsp");
        let def = decode("bsp = \"nrf52\"\n").unwrap();
        assert_eq!(def.bsp.as_deref(), Some("nrf52"));
        assert!(def.targets.is_empty());
    }

    #[test]
    fn too_many_images() {
        assert_eq!(decode_field("images = [\"a\", \"b\", \"c\"]\n"), "images");
    }

    #[test]
    fn raw_entry_fields_required() {
        let missing_file = indoc! {r#"
            bsp = "b"
            [[raw]]
            file = "ok.bin"
            area = "A"
            offset = 0
            [[raw]]
            area = "A"
            offset = 0
        "#};
        assert_eq!(decode_field(missing_file), "raw[1].file");

        let missing_offset = indoc! {r#"
            bsp = "b"
            [[raw]]
            file = "x.bin"
            area = "A"
        "#};
        assert_eq!(decode_field(missing_offset), "raw[0].offset");

        let missing_area = indoc! {r#"
            bsp = "b"
            [[raw]]
            file = "x.bin"
            offset = 0
        "#};
        assert_eq!(decode_field(missing_area), "raw[0].area");
    }

    #[test]
    fn bad_offsets() {
        assert_eq!(
            decode_field("bootloader = { name = \"b\", offset = -1 }\n"),
            "bootloader.offset"
        );
        assert_eq!(
            decode_field("bootloader = { name = \"b\", offset = \"middle\" }\n"),
            "bootloader.offset"
        );
        let device_end = indoc! {r#"
            bsp = "b"
            [[raw]]
            file = "x.bin"
            device = 0
            offset = "end"
        "#};
        assert_eq!(decode_field(device_end), "raw[0].offset");
    }

    #[test]
    fn meta_defaults_and_errors() {
        let def = decode(indoc! {r#"
            bsp = "b"
            [meta]
            area = "FLASH_AREA_MFG"
        "#})
        .unwrap();
        let meta = def.meta.unwrap();
        assert!(!meta.hash);
        assert!(!meta.flash_map);
        assert!(meta.mmrs.is_empty());

        assert_eq!(decode_field("bsp = \"b\"\n[meta]\nhash = true\n"), "meta.area");
        let self_ref = indoc! {r#"
            bsp = "b"
            [meta]
            area = "M"
            mmrs = [{ area = "M" }]
        "#};
        assert_eq!(decode_field(self_ref), "meta.mmrs[0].area");
    }

    #[test]
    fn unknown_keys_rejected() {
        assert_eq!(decode_field("bsp = \"b\"\nbogus = 1\n"), "mfg.toml");
    }
}
