// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;
use std::ops::Range;
use std::path::PathBuf;

/// One pair of parts whose byte ranges intersect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Overlap {
    pub device: u8,
    pub first: String,
    pub first_range: Range<u32>,
    pub second: String,
    pub second_range: Range<u32>,
}

impl fmt::Display for Overlap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "device {}: {} [{:#010x}..{:#010x}) overlaps {} [{:#010x}..{:#010x})",
            self.device,
            self.first,
            self.first_range.start,
            self.first_range.end,
            self.second,
            self.second_range.start,
            self.second_range.end,
        )
    }
}

/// Failures that a user can act on. These are raised through `anyhow`, so
/// callers that care about the kind use `err.downcast_ref::<MfgError>()`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MfgError {
    /// Malformed or incomplete definition; `field` is the path of the
    /// offending key, e.g. `raw[2].offset`.
    Decode { field: String, reason: String },
    /// A flash area named at `field` is not in the BSP's flash map.
    UndefinedArea {
        field: String,
        area: String,
        suggestion: Option<String>,
    },
    /// No built target of that name in the project.
    UndefinedTarget {
        name: String,
        suggestion: Option<String>,
    },
    /// The project has no BSP of that name.
    UndefinedBsp { name: String },
    /// `segment` needs `required` bytes of `area`, which only has
    /// `available`.
    OutOfSpace {
        segment: String,
        area: String,
        required: u64,
        available: u64,
    },
    /// Every pair of parts sharing bytes, not just the first found.
    Overlap(Vec<Overlap>),
    /// The definition places nothing at all.
    NoFlashDevice,
    /// Parts or the metadata region are spread over devices in a way the
    /// image layout cannot express.
    MultiDevice { reason: String },
    /// A file the target build should have produced is not there.
    MissingArtifact { target: String, path: PathBuf },
    /// Only raised by validation; hashes are lowercase hex.
    HashMismatch { expected: String, actual: String },
    /// A metadata region read back from a binary is not well formed.
    BadMeta { reason: String },
}

impl fmt::Display for MfgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode { field, reason } => {
                write!(f, "invalid definition: {}: {}", field, reason)
            }
            Self::UndefinedArea {
                field,
                area,
                suggestion,
            } => {
                write!(f, "{}: undefined flash area '{}'", field, area)?;
                if let Some(s) = suggestion {
                    write!(f, ". Did you mean '{}'?", s)?;
                }
                Ok(())
            }
            Self::UndefinedTarget { name, suggestion } => {
                write!(f, "'{}' is not a valid target name.", name)?;
                if let Some(s) = suggestion {
                    write!(f, " Did you mean '{}'?", s)?;
                }
                Ok(())
            }
            Self::UndefinedBsp { name } => {
                write!(f, "undefined BSP '{}'", name)
            }
            Self::OutOfSpace {
                segment,
                area,
                required,
                available,
            } => write!(
                f,
                "{} does not fit in {}: requires {:#x} bytes, {:#x} available",
                segment, area, required, available
            ),
            Self::Overlap(pairs) => {
                write!(f, "{} overlapping part(s):", pairs.len())?;
                for p in pairs {
                    write!(f, "\n    {}", p)?;
                }
                Ok(())
            }
            Self::NoFlashDevice => {
                write!(f, "mfg image does not reference any flash device")
            }
            Self::MultiDevice { reason } => write!(f, "{}", reason),
            Self::MissingArtifact { target, path } => write!(
                f,
                "target {}: file not found: {} (build the target first)",
                target,
                path.display()
            ),
            Self::HashMismatch { expected, actual } => write!(
                f,
                "mfg hash mismatch: expected {}, computed {}",
                expected, actual
            ),
            Self::BadMeta { reason } => {
                write!(f, "malformed metadata region: {}", reason)
            }
        }
    }
}

impl std::error::Error for MfgError {}

/// Picks the closest of `candidates` to `name`, for "did you mean" hints.
pub fn suggest<'a>(
    name: &str,
    candidates: impl Iterator<Item = &'a str>,
) -> Option<String> {
    // Suggest only for very small differences; a high number gives silly
    // suggestions for short names.
    const MAX_DISTANCE: usize = 3;

    let mut scored: Vec<_> = candidates
        .filter_map(|s| {
            let distance = strsim::damerau_levenshtein(name, s);
            if distance <= MAX_DISTANCE {
                Some((distance, s))
            } else {
                None
            }
        })
        .collect();
    scored.sort();
    scored.first().map(|(_, s)| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suggestion_picks_closest() {
        let names = ["FLASH_AREA_IMAGE_0", "FLASH_AREA_IMAGE_1", "FLASH_BOOT"];
        assert_eq!(
            suggest("FLASH_AREA_IMAGE_O", names.iter().copied()).as_deref(),
            Some("FLASH_AREA_IMAGE_0")
        );
        assert_eq!(suggest("NVRAM", names.iter().copied()), None);
    }

    #[test]
    fn overlap_message_lists_every_pair() {
        let e = MfgError::Overlap(vec![
            Overlap {
                device: 0,
                first: "a".into(),
                first_range: 0..10,
                second: "b".into(),
                second_range: 5..15,
            },
            Overlap {
                device: 1,
                first: "c".into(),
                first_range: 0..4,
                second: "d".into(),
                second_range: 2..3,
            },
        ]);
        let s = e.to_string();
        assert!(s.starts_with("2 overlapping"));
        assert!(s.contains("device 0: a"));
        assert!(s.contains("device 1: c"));
    }
}
