// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::ops::Range;

use anyhow::Result;

use crate::error::{MfgError, Overlap};
use crate::part::Part;

/// Returns every pair `(i, j)`, `i < j`, of intersecting ranges.
///
/// `ranges` must be sorted by start address. For each range we only walk
/// forward while the successor starts before our end: once one successor
/// starts at or past it, every later one does too. Lengths vary, so this is
/// still quadratic when many ranges pile up on each other.
pub fn overlapping_pairs(ranges: &[Range<u32>]) -> Vec<(usize, usize)> {
    debug_assert!(ranges.windows(2).all(|w| w[0].start <= w[1].start));

    let mut out = vec![];
    for (i, r) in ranges.iter().enumerate() {
        for (j, next) in ranges.iter().enumerate().skip(i + 1) {
            if next.start >= r.end {
                break;
            }
            if !next.is_empty() {
                out.push((i, j));
            }
        }
    }
    out
}

/// Checks that no two parts on the same device share a byte, reporting
/// every conflicting pair at once.
///
/// Parts are ordered by offset with ties left in declaration order, so the
/// report is the same from run to run.
pub fn check(parts: &[Part]) -> Result<()> {
    let mut by_device: BTreeMap<u8, Vec<&Part>> = BTreeMap::new();
    for p in parts {
        by_device.entry(p.device).or_default().push(p);
    }

    let mut found = vec![];
    for (device, mut parts) in by_device {
        // `sort_by_key` is stable
        parts.sort_by_key(|p| p.offset);
        let ranges: Vec<_> = parts.iter().map(|p| p.range()).collect();
        for (i, j) in overlapping_pairs(&ranges) {
            found.push(Overlap {
                device,
                first: parts[i].name.clone(),
                first_range: ranges[i].clone(),
                second: parts[j].name.clone(),
                second_range: ranges[j].clone(),
            });
        }
    }

    if found.is_empty() {
        Ok(())
    } else {
        Err(MfgError::Overlap(found).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(name: &str, device: u8, offset: u32, len: usize) -> Part {
        Part {
            name: name.to_string(),
            device,
            offset,
            data: vec![0; len],
        }
    }

    fn pairs(parts: &[Part]) -> Vec<(String, String)> {
        match check(parts) {
            Ok(()) => vec![],
            Err(e) => match e.downcast_ref::<MfgError>() {
                Some(MfgError::Overlap(v)) => v
                    .iter()
                    .map(|o| (o.first.clone(), o.second.clone()))
                    .collect(),
                _ => panic!("unexpected error: {}", e),
            },
        }
    }

    #[test]
    fn only_intersecting_pair_reported() {
        let parts = [
            part("C", 0, 30, 5),
            part("B", 0, 5, 10),
            part("A", 0, 0, 10),
        ];
        assert_eq!(pairs(&parts), [("A".to_string(), "B".to_string())]);
    }

    #[test]
    fn adjacent_parts_do_not_overlap() {
        let parts = [part("A", 0, 0, 0x10), part("B", 0, 0x10, 0x10)];
        assert!(pairs(&parts).is_empty());
    }

    #[test]
    fn long_part_reaches_past_short_successor() {
        // A covers both B and C even though B ends before C starts.
        let parts = [
            part("A", 0, 0, 100),
            part("B", 0, 10, 5),
            part("C", 0, 50, 5),
            part("D", 0, 100, 5),
        ];
        assert_eq!(
            pairs(&parts),
            [
                ("A".to_string(), "B".to_string()),
                ("A".to_string(), "C".to_string()),
            ]
        );
    }

    #[test]
    fn ties_keep_declaration_order() {
        let parts = [part("second", 0, 0, 4), part("first", 0, 0, 4)];
        assert_eq!(
            pairs(&parts),
            [("second".to_string(), "first".to_string())]
        );
    }

    #[test]
    fn devices_are_independent() {
        let parts = [part("A", 0, 0, 10), part("B", 1, 0, 10)];
        assert!(pairs(&parts).is_empty());
    }
}
