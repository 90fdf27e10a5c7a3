// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The mfg hash: SHA-256 over every device section, in device order, with
//! the hash field itself zeroed. Verification tooling recomputes it the
//! same way, so none of this is negotiable.

use std::ops::Range;

use anyhow::{bail, Result};
use sha2::{Digest, Sha256};

use crate::blob::DeviceSection;
use crate::error::MfgError;
use crate::meta::META_HASH_SZ;

pub type MfgHash = [u8; META_HASH_SZ];

/// Where the hash field lives: a device range within one section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashLoc {
    pub device: u8,
    pub range: Range<u32>,
}

/// Hashes `sections` exactly as they are.
pub fn calc(sections: &[DeviceSection]) -> MfgHash {
    let mut sorted: Vec<&DeviceSection> = sections.iter().collect();
    sorted.sort_by_key(|s| s.device);

    let mut hasher = Sha256::new();
    for s in sorted {
        hasher.update(&s.data);
    }
    hasher.finalize().into()
}

fn locate(
    sections: &[DeviceSection],
    loc: &HashLoc,
) -> Option<(usize, Range<usize>)> {
    sections.iter().enumerate().find_map(|(i, s)| {
        if s.device == loc.device {
            s.index_range(loc.range.clone()).map(|r| (i, r))
        } else {
            None
        }
    })
}

/// Overwrites the hash field with `hash`.
///
/// # Panics
///
/// If `loc` does not lie entirely inside one of `sections`; the builder
/// placed the field, so that would be a bug.
pub fn patch(sections: &mut [DeviceSection], loc: &HashLoc, hash: &[u8]) {
    let (i, range) = locate(sections, loc).unwrap_or_else(|| {
        panic!(
            "hash field {:x?} on device {} is outside the image",
            loc.range, loc.device
        )
    });
    assert_eq!(range.len(), hash.len(), "hash field size mismatch");
    sections[i].data[range].copy_from_slice(hash);
}

/// Computes the hash with the field zeroed, then writes it into the field.
/// With no field, the image is hashed as-is and left untouched.
pub fn finalize(
    sections: &mut [DeviceSection],
    loc: Option<&HashLoc>,
) -> MfgHash {
    let Some(loc) = loc else {
        return calc(sections);
    };
    patch(sections, loc, &[0; META_HASH_SZ]);
    let hash = calc(sections);
    patch(sections, loc, &hash);
    hash
}

/// Recomputes the hash of a finished image and checks it against the one
/// embedded at `loc`. Returns the recomputed hash.
pub fn verify(sections: &[DeviceSection], loc: &HashLoc) -> Result<MfgHash> {
    let Some((i, range)) = locate(sections, loc) else {
        bail!(MfgError::BadMeta {
            reason: format!(
                "hash field {:#x?} is outside device {}'s image",
                loc.range, loc.device
            ),
        });
    };
    let embedded = sections[i].data[range].to_vec();

    let mut zeroed = sections.to_vec();
    patch(&mut zeroed, loc, &[0; META_HASH_SZ]);
    let actual = calc(&zeroed);

    if embedded != actual {
        return Err(MfgError::HashMismatch {
            expected: hex::encode(&embedded),
            actual: hex::encode(actual),
        }
        .into());
    }
    Ok(actual)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sections() -> Vec<DeviceSection> {
        vec![
            DeviceSection {
                device: 1,
                base: 0,
                data: vec![0x55; 64],
            },
            DeviceSection {
                device: 0,
                base: 0x1000,
                data: (0..=255).collect(),
            },
        ]
    }

    fn loc() -> HashLoc {
        HashLoc {
            device: 0,
            range: 0x1010..0x1030,
        }
    }

    #[test]
    fn calc_is_device_ordered() {
        let s = sections();
        let mut expected = Sha256::new();
        expected.update(&s[1].data);
        expected.update(&s[0].data);
        let expected: MfgHash = expected.finalize().into();
        assert_eq!(calc(&s), expected);
    }

    #[test]
    fn deterministic_and_sensitive() {
        let mut a = sections();
        let mut b = sections();
        let ha = finalize(&mut a, Some(&loc()));
        let hb = finalize(&mut b, Some(&loc()));
        assert_eq!(ha, hb);
        assert_eq!(&a[1].data[0x10..0x30], &ha);

        // Finalizing again gives the same answer: the field is zeroed first.
        let again = finalize(&mut a, Some(&loc()));
        assert_eq!(again, ha);

        let mut c = sections();
        c[0].data[3] ^= 1;
        assert_ne!(finalize(&mut c, Some(&loc())), ha);
    }

    #[test]
    fn verify_round_trip() {
        let mut s = sections();
        let h = finalize(&mut s, Some(&loc()));
        assert_eq!(verify(&s, &loc()).unwrap(), h);

        let mut corrupt = s.clone();
        corrupt[1].data[0] ^= 0xff;
        let err = verify(&corrupt, &loc()).unwrap_err();
        match err.downcast_ref::<MfgError>() {
            Some(MfgError::HashMismatch { expected, actual }) => {
                assert_eq!(expected, &hex::encode(h));
                assert_ne!(actual, expected);
                assert_eq!(actual.len(), 64);
            }
            e => panic!("unexpected error {:?}", e),
        }
    }

    #[test]
    fn no_field() {
        let mut s = sections();
        let before = s.clone();
        let h = finalize(&mut s, None);
        assert_eq!(s, before);
        assert_eq!(h, calc(&before));
    }

    #[test]
    #[should_panic(expected = "outside the image")]
    fn patch_out_of_bounds() {
        let mut s = sections();
        let bad = HashLoc {
            device: 0,
            range: 0x10f0..0x1110,
        };
        patch(&mut s, &bad, &[0; META_HASH_SZ]);
    }
}
