// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;

use crate::blob::{self, DeviceSection};
use crate::definition::Definition;
use crate::error::MfgError;
use crate::flash::FlashMap;
use crate::hash::{self, HashLoc, MfgHash};
use crate::meta::{Meta, PlacedMeta};
use crate::overlap;
use crate::part::{Part, PartResolver, RawPart, TargetPart};
use crate::project::Project;

/// The only device that may carry a metadata region.
pub const META_DEVICE: u8 = 0;

/// A fully assembled and hashed mfg image, ready to be emitted.
#[derive(Clone, Debug)]
pub struct MfgImage {
    pub name: String,
    pub bsp: String,
    pub flash_map: FlashMap,
    pub targets: Vec<TargetPart>,
    pub raws: Vec<RawPart>,
    pub meta: Option<PlacedMeta>,
    /// One per device, in device order.
    pub sections: Vec<DeviceSection>,
    pub hash: MfgHash,
}

fn hash_loc(meta: Option<&PlacedMeta>) -> Option<HashLoc> {
    meta.and_then(|m| {
        m.hash_range().map(|range| HashLoc {
            device: m.area.device,
            range,
        })
    })
}

impl MfgImage {
    pub fn hash_loc(&self) -> Option<HashLoc> {
        hash_loc(self.meta.as_ref())
    }

    /// Every placed part, metadata region included, in device and offset
    /// order.
    pub fn parts(&self) -> Vec<Part> {
        let mut parts: Vec<Part> = self
            .targets
            .iter()
            .map(|t| t.part.clone())
            .chain(self.raws.iter().map(|r| r.part.clone()))
            .chain(self.meta.iter().map(|m| m.part()))
            .collect();
        parts.sort_by_key(|p| (p.device, p.offset));
        parts
    }

    pub fn section(&self, device: u8) -> Option<&DeviceSection> {
        self.sections.iter().find(|s| s.device == device)
    }
}

/// Runs a definition through resolution, overlap checking, assembly and
/// hashing.
pub struct MfgBuilder<'a> {
    project: &'a Project,
}

impl<'a> MfgBuilder<'a> {
    pub fn new(project: &'a Project) -> Self {
        Self { project }
    }

    /// Works out which BSP the image is for. Every target must agree with
    /// each other and with the definition's `bsp`, if it names one.
    fn bsp_name(&self, def: &Definition) -> Result<String> {
        let mut names = BTreeSet::new();
        if let Some(b) = &def.bsp {
            names.insert(b.clone());
        }
        for t in &def.targets {
            names.insert(self.project.target(&t.name)?.bsp.clone());
        }

        let mut iter = names.into_iter();
        match (iter.next(), iter.next()) {
            (Some(name), None) => Ok(name),
            (None, _) => Err(MfgError::Decode {
                field: "bsp".to_string(),
                reason: "required when the definition lists no targets"
                    .to_string(),
            }
            .into()),
            (Some(a), Some(b)) => Err(MfgError::Decode {
                field: "bsp".to_string(),
                reason: format!(
                    "targets and definition disagree on the BSP ({}, {}, ...)",
                    a, b
                ),
            }
            .into()),
        }
    }

    pub fn build(&self, def: &Definition) -> Result<MfgImage> {
        let bsp = self.bsp_name(def)?;
        let flash_map = self.project.bsp(&bsp)?.flash_map.clone();
        log::info!("building mfg image {} for BSP {}", def.name, bsp);

        let resolver = PartResolver::new(self.project, &flash_map, def);
        let targets = resolver.targets()?;
        let raws = resolver.raws()?;

        let meta = match &def.meta {
            None => None,
            Some(spec) => {
                let area = flash_map.area("meta.area", &spec.area)?;
                if area.device != META_DEVICE {
                    return Err(MfgError::MultiDevice {
                        reason: format!(
                            "meta.area: the metadata region must be on \
                             device {}, but {} is on device {}",
                            META_DEVICE, area.name, area.device
                        ),
                    }
                    .into());
                }
                Some(Meta::build(spec, &flash_map)?.place(area)?)
            }
        };

        let parts: Vec<Part> = targets
            .iter()
            .map(|t| t.part.clone())
            .chain(raws.iter().map(|r| r.part.clone()))
            .chain(meta.iter().map(PlacedMeta::part))
            .collect();
        overlap::check(&parts)?;

        if !parts.is_empty() && !parts.iter().any(|p| p.device == META_DEVICE)
        {
            return Err(MfgError::MultiDevice {
                reason: format!(
                    "nothing is placed on device {}; every mfg image \
                     starts there",
                    META_DEVICE
                ),
            }
            .into());
        }

        let bases: BTreeMap<u8, u32> = parts
            .iter()
            .map(|p| p.device)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter_map(|d| flash_map.device_base(d).map(|b| (d, b)))
            .collect();
        let mut sections = blob::assemble(&parts, &bases)?;

        let loc = hash_loc(meta.as_ref());
        let hash = hash::finalize(&mut sections, loc.as_ref());
        log::info!("mfg hash {}", hex::encode(hash));

        Ok(MfgImage {
            name: def.name.clone(),
            bsp,
            flash_map,
            targets,
            raws,
            meta,
            sections,
            hash,
        })
    }
}
