// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::ErrorKind;
use std::ops::Range;
use std::path::Path;

use anyhow::{Context, Result};

use crate::definition::{
    Definition, Offset, Placement, RawFile, Slot, TargetEntry,
};
use crate::error::MfgError;
use crate::flash::{FlashArea, FlashMap};
use crate::project::{Project, TargetArtifacts, TargetManifest};

/// A chunk of data destined for an absolute offset on one flash device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Part {
    /// For diagnostics only.
    pub name: String,
    pub device: u8,
    pub offset: u32,
    pub data: Vec<u8>,
}

impl Part {
    pub fn end(&self) -> u32 {
        self.offset + self.data.len() as u32
    }

    pub fn range(&self) -> Range<u32> {
        self.offset..self.end()
    }
}

/// Converts an in-area offset into a device offset for a segment of `len`
/// bytes, checking that the segment fits.
pub fn normalize_offset(
    segment: &str,
    area: &FlashArea,
    offset: Offset,
    len: usize,
) -> Result<u32> {
    let size = u64::from(area.size);
    let len = len as u64;
    let out_of_space = |required: u64| MfgError::OutOfSpace {
        segment: segment.to_string(),
        area: area.name.clone(),
        required,
        available: size,
    };

    let within = match offset {
        Offset::End => {
            if len > size {
                return Err(out_of_space(len).into());
            }
            size - len
        }
        Offset::Absolute(o) => {
            let required = u64::from(o) + len;
            if required > size {
                return Err(out_of_space(required).into());
            }
            u64::from(o)
        }
    };
    // Fits in u32: `within < size` and the area itself fits.
    Ok(area.offset + within as u32)
}

/// A target, resolved against the project, along with the part it produces.
#[derive(Clone, Debug)]
pub struct TargetPart {
    pub index: usize,
    pub entry: TargetEntry,
    pub artifacts: TargetArtifacts,
    pub is_boot: bool,
    pub part: Part,
}

#[derive(Clone, Debug)]
pub struct RawPart {
    pub index: usize,
    pub file: RawFile,
    pub part: Part,
}

/// Reads a target artifact, turning a missing file into `MissingArtifact`.
pub fn read_artifact(target: &str, path: &Path) -> Result<Vec<u8>> {
    match std::fs::read(path) {
        Ok(data) => Ok(data),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Err(MfgError::MissingArtifact {
                target: target.to_string(),
                path: path.to_path_buf(),
            }
            .into())
        }
        Err(e) => Err(e).with_context(|| {
            format!("target {}: could not read {}", target, path.display())
        }),
    }
}

/// Turns the entries of a definition into placed parts.
pub struct PartResolver<'a> {
    project: &'a Project,
    flash_map: &'a FlashMap,
    def: &'a Definition,
}

impl<'a> PartResolver<'a> {
    pub fn new(
        project: &'a Project,
        flash_map: &'a FlashMap,
        def: &'a Definition,
    ) -> Self {
        Self {
            project,
            flash_map,
            def,
        }
    }

    pub fn targets(&self) -> Result<Vec<TargetPart>> {
        self.def
            .targets
            .iter()
            .enumerate()
            .map(|(i, t)| self.target(i, t))
            .collect()
    }

    pub fn raws(&self) -> Result<Vec<RawPart>> {
        self.def
            .raws
            .iter()
            .enumerate()
            .map(|(i, r)| self.raw(i, r))
            .collect()
    }

    fn target(&self, index: usize, entry: &TargetEntry) -> Result<TargetPart> {
        let field = match entry.slot {
            Slot::Bootloader => "bootloader".to_string(),
            Slot::Image(i) => format!("images[{}]", i),
        };
        let artifacts = self.project.target(&entry.name)?;
        let area = self
            .flash_map
            .area(&format!("{}.area", field), &entry.area)?;

        let manifest = read_artifact(&entry.name, &artifacts.manifest)?;
        let manifest: TargetManifest = serde_json::from_slice(&manifest)
            .with_context(|| {
                format!(
                    "could not parse target manifest {}",
                    artifacts.manifest.display()
                )
            })?;
        let is_boot = manifest.is_boot();
        match (entry.slot, is_boot) {
            (Slot::Bootloader, false) => log::warn!(
                "target {} is in the bootloader slot but is not a boot loader",
                entry.name
            ),
            (Slot::Image(_), true) => log::warn!(
                "target {} is in an image slot but is a boot loader",
                entry.name
            ),
            _ => (),
        }

        // Boot loaders are flashed as raw binaries; everything else goes in
        // as a signed image.
        let src = if is_boot {
            &artifacts.bin
        } else {
            &artifacts.image
        };
        let data = read_artifact(&entry.name, src)?;

        let name = format!("{} (target {})", entry.name, index);
        let offset = normalize_offset(&name, area, entry.offset, data.len())?;
        log::debug!(
            "{}: {} bytes at {:#x} in {}",
            name,
            data.len(),
            offset,
            area.name
        );

        Ok(TargetPart {
            index,
            entry: entry.clone(),
            artifacts: artifacts.clone(),
            is_boot,
            part: Part {
                name,
                device: area.device,
                offset,
                data,
            },
        })
    }

    fn raw(&self, index: usize, file: &RawFile) -> Result<RawPart> {
        let data = std::fs::read(&file.path).with_context(|| {
            format!("raw[{}]: could not read {}", index, file.path.display())
        })?;
        let name = format!("{} (raw {})", file.filename, index);

        let (device, offset) = match &file.placement {
            Placement::Area { area, offset } => {
                let area = self
                    .flash_map
                    .area(&format!("raw[{}].area", index), area)?;
                let offset =
                    normalize_offset(&name, area, *offset, data.len())?;
                (area.device, offset)
            }
            Placement::Device { device, offset } => {
                if !self.flash_map.devices().contains(device) {
                    return Err(MfgError::MultiDevice {
                        reason: format!(
                            "raw[{}]: flash device {} is not in the flash map",
                            index, device
                        ),
                    }
                    .into());
                }
                let required = u64::from(*offset) + data.len() as u64;
                if required > u64::from(u32::MAX) {
                    return Err(MfgError::OutOfSpace {
                        segment: name,
                        area: format!("device {}", device),
                        required,
                        available: u64::from(u32::MAX),
                    }
                    .into());
                }
                (*device, *offset)
            }
        };

        Ok(RawPart {
            index,
            file: file.clone(),
            part: Part {
                name,
                device,
                offset,
                data,
            },
        })
    }
}
