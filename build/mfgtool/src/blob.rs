// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::ops::Range;

use anyhow::Result;

use crate::error::MfgError;
use crate::part::Part;

/// What unwritten flash reads back as.
pub const ERASE_VAL: u8 = 0xff;

/// The contents of one flash device, starting at `base`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceSection {
    pub device: u8,
    /// Device offset of `data[0]`.
    pub base: u32,
    pub data: Vec<u8>,
}

impl DeviceSection {
    pub fn end(&self) -> u32 {
        self.base + self.data.len() as u32
    }

    /// Translates a device range into an index range of `data`, if the
    /// whole range lies within this section.
    pub fn index_range(&self, range: Range<u32>) -> Option<Range<usize>> {
        if range.start < self.base || range.end > self.end() {
            return None;
        }
        let start = (range.start - self.base) as usize;
        Some(start..start + range.len())
    }
}

/// Lays all parts out into one erase-filled buffer per device, in device
/// order.
///
/// `bases` gives the lowest address of each device's flash; a device
/// without an entry starts at zero. Parts must already have been checked
/// for overlap, so two parts writing the same byte is a bug.
pub fn assemble(
    parts: &[Part],
    bases: &BTreeMap<u8, u32>,
) -> Result<Vec<DeviceSection>> {
    let mut by_device: BTreeMap<u8, Vec<&Part>> = BTreeMap::new();
    for p in parts {
        by_device.entry(p.device).or_default().push(p);
    }
    if by_device.is_empty() {
        return Err(MfgError::NoFlashDevice.into());
    }

    let mut out = vec![];
    for (device, parts) in by_device {
        let lowest = parts.iter().map(|p| p.offset).min().unwrap_or(0);
        let base = bases.get(&device).copied().unwrap_or(0).min(lowest);
        let end = parts.iter().map(|p| p.end()).max().unwrap_or(base);

        let mut data = vec![ERASE_VAL; (end - base) as usize];
        let mut written = vec![false; data.len()];
        for p in parts {
            let start = (p.offset - base) as usize;
            let range = start..start + p.data.len();
            if let Some(i) = written[range.clone()].iter().position(|&w| w) {
                panic!(
                    "device {}: {} rewrites byte {:#x}; overlap check missed it",
                    device,
                    p.name,
                    base as usize + start + i
                );
            }
            written[range.clone()].iter_mut().for_each(|w| *w = true);
            data[range].copy_from_slice(&p.data);
        }

        out.push(DeviceSection { device, base, data });
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(name: &str, device: u8, offset: u32, data: &[u8]) -> Part {
        Part {
            name: name.to_string(),
            device,
            offset,
            data: data.to_vec(),
        }
    }

    #[test]
    fn gaps_are_erased() {
        let parts = [
            part("b", 0, 8, &[0xb0; 4]),
            part("a", 0, 2, &[0xa0; 3]),
        ];
        let sections = assemble(&parts, &BTreeMap::new()).unwrap();
        assert_eq!(sections.len(), 1);
        let s = &sections[0];
        assert_eq!(s.base, 0);
        assert_eq!(s.data.len(), 12);

        let covered = |i: usize| (2..5).contains(&i) || (8..12).contains(&i);
        for (i, &b) in s.data.iter().enumerate() {
            if !covered(i) {
                assert_eq!(b, ERASE_VAL, "byte {} not erased", i);
            }
        }
        assert_eq!(&s.data[2..5], &[0xa0; 3]);
        assert_eq!(&s.data[8..12], &[0xb0; 4]);
    }

    #[test]
    fn devices_in_order_with_bases() {
        let parts = [
            part("ext", 1, 0x100, &[1, 2]),
            part("int", 0, 0x0800_0010, &[3]),
        ];
        let bases: BTreeMap<u8, u32> =
            [(0, 0x0800_0000)].into_iter().collect();
        let sections = assemble(&parts, &bases).unwrap();

        assert_eq!(sections[0].device, 0);
        assert_eq!(sections[0].base, 0x0800_0000);
        assert_eq!(sections[0].data.len(), 0x11);
        assert_eq!(sections[0].data[0x10], 3);

        assert_eq!(sections[1].device, 1);
        assert_eq!(sections[1].base, 0);
        assert_eq!(sections[1].end(), 0x102);
        assert_eq!(
            sections[1].index_range(0x100..0x102),
            Some(0x100..0x102)
        );
        assert_eq!(sections[1].index_range(0x101..0x103), None);
    }

    #[test]
    fn nothing_to_assemble() {
        let err = assemble(&[], &BTreeMap::new()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<MfgError>(),
            Some(&MfgError::NoFlashDevice)
        );
    }

    #[test]
    #[should_panic(expected = "rewrites byte 0x4")]
    fn overwrite_is_a_bug() {
        let parts = [part("a", 0, 0, &[0; 5]), part("b", 0, 4, &[0; 2])];
        let _ = assemble(&parts, &BTreeMap::new());
    }
}
