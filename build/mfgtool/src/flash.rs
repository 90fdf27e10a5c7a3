// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The resolved flash map of a BSP: symbolic area name to its physical
//! placement.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{suggest, MfgError, Overlap};
use crate::overlap::overlapping_pairs;

/// Areas with ids fixed by the boot ROM contract.
const SYSTEM_AREAS: [(&str, u8); 5] = [
    ("FLASH_AREA_BOOTLOADER", 0),
    ("FLASH_AREA_IMAGE_0", 1),
    ("FLASH_AREA_IMAGE_1", 2),
    ("FLASH_AREA_IMAGE_SCRATCH", 3),
    ("FLASH_AREA_REBOOT_LOG", 16),
];

/// First id handed out to areas that neither pin an id nor are system areas.
const FIRST_USER_ID: u8 = 17;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashArea {
    pub name: String,
    pub id: u8,
    pub device: u8,
    pub offset: u32,
    pub size: u32,
}

impl FlashArea {
    /// One past the last byte of the area, relative to its device.
    pub fn end(&self) -> u32 {
        self.offset + self.size
    }

    pub fn range(&self) -> Range<u32> {
        self.offset..self.end()
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawFlashMap {
    areas: IndexMap<String, RawArea>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawArea {
    id: Option<u8>,
    device: u8,
    offset: SizeValue,
    size: SizeValue,
}

/// Offsets and sizes may be written as plain integers or as strings such as
/// `"0x8000"` or `"16kB"`.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum SizeValue {
    Int(u64),
    Text(String),
}

impl SizeValue {
    fn resolve(&self) -> Result<u64> {
        match self {
            SizeValue::Int(v) => Ok(*v),
            SizeValue::Text(s) => parse_size(s),
        }
    }
}

/// Parses `1234`, `0x4d2`, `16kB`/`16KB` and `1MB`.
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let (digits, mult) = if let Some(d) =
        s.strip_suffix("kB").or_else(|| s.strip_suffix("KB"))
    {
        (d.trim(), 1024)
    } else if let Some(d) = s.strip_suffix("MB") {
        (d.trim(), 1024 * 1024)
    } else {
        (s, 1)
    };

    let value = if let Some(hex) =
        digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16)
    } else {
        digits.parse::<u64>()
    }
    .map_err(|e| anyhow!("invalid size '{}': {}", s, e))?;

    value
        .checked_mul(mult)
        .ok_or_else(|| anyhow!("size '{}' is too large", s))
}

/// A validated flash map. Declaration order is preserved for iteration;
/// anything serialized into an image uses id order.
#[derive(Clone, Debug, Default)]
pub struct FlashMap {
    areas: IndexMap<String, FlashArea>,
}

impl FlashMap {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| {
            format!("could not read flash map {}", path.display())
        })?;
        Self::from_toml(&text)
            .with_context(|| format!("in flash map {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let raw: RawFlashMap = toml::from_str(text)?;

        let pinned: BTreeSet<u8> = raw
            .areas
            .iter()
            .filter_map(|(name, a)| a.id.or_else(|| system_id(name)))
            .collect();
        let mut next_id = FIRST_USER_ID;

        let mut areas = Vec::with_capacity(raw.areas.len());
        for (name, a) in raw.areas {
            let id = match a.id.or_else(|| system_id(&name)) {
                Some(id) => id,
                None => {
                    while pinned.contains(&next_id) {
                        next_id = next_id.checked_add(1).ok_or_else(|| {
                            anyhow!("ran out of flash area ids at {}", name)
                        })?;
                    }
                    let id = next_id;
                    next_id = next_id.wrapping_add(1);
                    id
                }
            };
            let offset = a.offset.resolve()?;
            let size = a.size.resolve()?;
            let to_u32 = |v: u64, what: &str| -> Result<u32> {
                u32::try_from(v).map_err(|_| {
                    anyhow!("{}: {} {:#x} does not fit in 32 bits", name, what, v)
                })
            };
            areas.push(FlashArea {
                id,
                device: a.device,
                offset: to_u32(offset, "offset")?,
                size: to_u32(size, "size")?,
                name,
            });
        }
        Self::new(areas)
    }

    /// Builds a map from already-resolved areas, checking that it is
    /// physically consistent.
    pub fn new(areas: Vec<FlashArea>) -> Result<Self> {
        let mut map = IndexMap::new();
        let mut ids = BTreeMap::new();
        for area in areas {
            if area.size == 0 {
                bail!("flash area {} has zero size", area.name);
            }
            if area.offset.checked_add(area.size).is_none() {
                bail!(
                    "flash area {} ({:#x} + {:#x}) runs past the end of \
                     the address space",
                    area.name,
                    area.offset,
                    area.size
                );
            }
            if let Some(other) =
                ids.insert((area.device, area.id), area.name.clone())
            {
                bail!(
                    "flash areas {} and {} share id {} on device {}",
                    other,
                    area.name,
                    area.id,
                    area.device
                );
            }
            if map.contains_key(&area.name) {
                bail!("flash area {} defined twice", area.name);
            }
            map.insert(area.name.clone(), area);
        }

        let out = Self { areas: map };
        out.check_overlaps()?;
        Ok(out)
    }

    fn check_overlaps(&self) -> Result<()> {
        let mut found = vec![];
        for dev in self.devices() {
            let mut on_dev: Vec<&FlashArea> =
                self.areas.values().filter(|a| a.device == dev).collect();
            on_dev.sort_by_key(|a| a.offset);
            let ranges: Vec<Range<u32>> =
                on_dev.iter().map(|a| a.range()).collect();
            for (i, j) in overlapping_pairs(&ranges) {
                found.push(Overlap {
                    device: dev,
                    first: on_dev[i].name.clone(),
                    first_range: ranges[i].clone(),
                    second: on_dev[j].name.clone(),
                    second_range: ranges[j].clone(),
                });
            }
        }
        if !found.is_empty() {
            return Err(MfgError::Overlap(found))
                .context("flash map areas overlap");
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&FlashArea> {
        self.areas.get(name)
    }

    /// Looks up `name`, failing with `UndefinedArea` attributed to `field`.
    pub fn area(&self, field: &str, name: &str) -> Result<&FlashArea> {
        self.areas.get(name).ok_or_else(|| {
            MfgError::UndefinedArea {
                field: field.to_string(),
                area: name.to_string(),
                suggestion: suggest(
                    name,
                    self.areas.keys().map(|k| k.as_str()),
                ),
            }
            .into()
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlashArea> {
        self.areas.values()
    }

    pub fn len(&self) -> usize {
        self.areas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    pub fn sorted_by_id(&self) -> Vec<&FlashArea> {
        let mut v: Vec<_> = self.areas.values().collect();
        v.sort_by_key(|a| (a.id, a.device));
        v
    }

    pub fn devices(&self) -> BTreeSet<u8> {
        self.areas.values().map(|a| a.device).collect()
    }

    /// Lowest address of any area on `device`; device images start here.
    pub fn device_base(&self, device: u8) -> Option<u32> {
        self.areas
            .values()
            .filter(|a| a.device == device)
            .map(|a| a.offset)
            .min()
    }
}

fn system_id(name: &str) -> Option<u8> {
    SYSTEM_AREAS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|&(_, id)| id)
}
