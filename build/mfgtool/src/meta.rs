// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The manufacturing meta region (MMR): a run of TLVs followed by a fixed
//! footer, anchored to the end of its flash area.
//!
//! ```text
//!   area.offset                                        area.end()
//!   |   ...   | tlv | tlv | ... | tlv | footer (8 bytes) |
//!             ^ meta offset = area.end() - footer.size
//! ```
//!
//! All multi-byte fields are little-endian. Boot code walks the region
//! backwards from the footer, so its layout is a fixed contract.

use std::ops::Range;

use anyhow::Result;
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::definition::{MetaSpec, Offset};
use crate::error::MfgError;
use crate::flash::{FlashArea, FlashMap};
use crate::part::{normalize_offset, Part};

pub const META_MAGIC: u32 = 0x3bb2_a269;
pub const META_VERSION: u8 = 2;
pub const META_HASH_SZ: usize = 32;

pub const META_TLV_TYPE_HASH: u8 = 0x01;
pub const META_TLV_TYPE_FLASH_AREA: u8 = 0x02;
pub const META_TLV_TYPE_MMR_REF: u8 = 0x04;

pub const META_TLV_HEADER_SZ: usize = std::mem::size_of::<MetaTlvHeader>();
pub const META_FOOTER_SZ: usize = std::mem::size_of::<MetaFooter>();

/// Name of the synthetic part the region occupies in the image.
pub const META_PART_NAME: &str = "mmr";

#[repr(C)]
#[derive(
    Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned,
)]
pub struct MetaTlvHeader {
    pub kind: u8,
    /// Length of the data that follows, excluding this header.
    pub size: u8,
}

#[repr(C)]
#[derive(
    Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned,
)]
pub struct MetaFlashArea {
    pub area: u8,
    pub device: u8,
    pub offset: U32,
    pub size: U32,
}

#[repr(C)]
#[derive(
    Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned,
)]
pub struct MetaMmrRef {
    pub area: u8,
}

#[repr(C)]
#[derive(
    Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned,
)]
pub struct MetaFooter {
    /// Size of the whole region: TLVs plus this footer.
    pub size: U16,
    pub version: u8,
    pub pad: u8,
    pub magic: U32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetaTlv {
    pub kind: u8,
    pub data: Vec<u8>,
}

impl MetaTlv {
    fn new(kind: u8, data: &[u8]) -> Self {
        // Every TLV we emit is tiny; a u8 length is part of the format.
        assert!(data.len() <= u8::MAX as usize);
        Self {
            kind,
            data: data.to_vec(),
        }
    }

    pub fn size(&self) -> usize {
        META_TLV_HEADER_SZ + self.data.len()
    }
}

/// An unplaced metadata region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Meta {
    pub tlvs: Vec<MetaTlv>,
    /// Names of the areas the MMR_REF TLVs point at, in TLV order.
    pub mmrs: Vec<String>,
}

impl Meta {
    /// Builds the TLVs requested by `spec`.
    ///
    /// The hash placeholder always goes first, so that its position is known
    /// regardless of how long the flash map dump turns out to be.
    pub fn build(spec: &MetaSpec, flash_map: &FlashMap) -> Result<Self> {
        let mut tlvs = vec![];

        if spec.hash {
            tlvs.push(MetaTlv::new(META_TLV_TYPE_HASH, &[0; META_HASH_SZ]));
        }

        if spec.flash_map {
            for a in flash_map.sorted_by_id() {
                let body = MetaFlashArea {
                    area: a.id,
                    device: a.device,
                    offset: U32::new(a.offset),
                    size: U32::new(a.size),
                };
                tlvs.push(MetaTlv::new(
                    META_TLV_TYPE_FLASH_AREA,
                    body.as_bytes(),
                ));
            }
        }

        for (i, name) in spec.mmrs.iter().enumerate() {
            let area =
                flash_map.area(&format!("meta.mmrs[{}].area", i), name)?;
            let body = MetaMmrRef { area: area.id };
            tlvs.push(MetaTlv::new(META_TLV_TYPE_MMR_REF, body.as_bytes()));
        }

        Ok(Self {
            tlvs,
            mmrs: spec.mmrs.clone(),
        })
    }

    /// Total size of the region, footer included.
    pub fn size(&self) -> usize {
        self.tlvs.iter().map(MetaTlv::size).sum::<usize>() + META_FOOTER_SZ
    }

    /// Offset of the hash TLV's data from the start of the region.
    pub fn hash_offset(&self) -> Option<usize> {
        let mut off = 0;
        for tlv in &self.tlvs {
            if tlv.kind == META_TLV_TYPE_HASH {
                return Some(off + META_TLV_HEADER_SZ);
            }
            off += tlv.size();
        }
        None
    }

    pub fn has_flash_map(&self) -> bool {
        self.tlvs.iter().any(|t| t.kind == META_TLV_TYPE_FLASH_AREA)
    }

    fn to_bytes(&self) -> Vec<u8> {
        let size = self.size();
        let footer = MetaFooter {
            size: U16::new(size as u16),
            version: META_VERSION,
            pad: 0xff,
            magic: U32::new(META_MAGIC),
        };

        let mut out = Vec::with_capacity(size);
        for tlv in &self.tlvs {
            let hdr = MetaTlvHeader {
                kind: tlv.kind,
                size: tlv.data.len() as u8,
            };
            out.extend_from_slice(hdr.as_bytes());
            out.extend_from_slice(&tlv.data);
        }
        out.extend_from_slice(footer.as_bytes());
        out
    }

    /// Anchors the region to the end of `area`.
    pub fn place(self, area: &FlashArea) -> Result<PlacedMeta> {
        let size = self.size();
        if size > u16::MAX as usize {
            return Err(MfgError::OutOfSpace {
                segment: META_PART_NAME.to_string(),
                area: area.name.clone(),
                required: size as u64,
                available: u64::from(u16::MAX),
            }
            .into());
        }
        let offset =
            normalize_offset(META_PART_NAME, area, Offset::End, size)?;
        let bytes = self.to_bytes();
        Ok(PlacedMeta {
            area: area.clone(),
            offset,
            meta: self,
            bytes,
        })
    }
}

/// A metadata region with a fixed place on its device.
#[derive(Clone, Debug)]
pub struct PlacedMeta {
    pub area: FlashArea,
    /// Device offset of the first TLV.
    pub offset: u32,
    pub meta: Meta,
    bytes: Vec<u8>,
}

impl PlacedMeta {
    pub fn size(&self) -> u32 {
        self.bytes.len() as u32
    }

    /// Device offset one past the footer; always the end of the area.
    pub fn end_offset(&self) -> u32 {
        self.offset + self.size()
    }

    /// Device range of the hash TLV's data, if there is one.
    pub fn hash_range(&self) -> Option<Range<u32>> {
        self.meta.hash_offset().map(|o| {
            let start = self.offset + o as u32;
            start..start + META_HASH_SZ as u32
        })
    }

    pub fn part(&self) -> Part {
        Part {
            name: META_PART_NAME.to_string(),
            device: self.area.device,
            offset: self.offset,
            data: self.bytes.clone(),
        }
    }
}

/// One TLV read back out of an image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedTlv {
    pub kind: u8,
    /// Index of the data within the buffer that was parsed.
    pub data_offset: usize,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedMeta {
    /// Index of the region's first byte within the parsed buffer.
    pub start: usize,
    pub size: usize,
    pub tlvs: Vec<ParsedTlv>,
}

impl ParsedMeta {
    pub fn hash(&self) -> Option<&ParsedTlv> {
        self.tlvs.iter().find(|t| t.kind == META_TLV_TYPE_HASH)
    }

    pub fn flash_areas(&self) -> Vec<MetaFlashArea> {
        self.tlvs
            .iter()
            .filter(|t| t.kind == META_TLV_TYPE_FLASH_AREA)
            .filter_map(|t| MetaFlashArea::read_from_bytes(&t.data).ok())
            .collect()
    }

    pub fn mmr_refs(&self) -> Vec<u8> {
        self.tlvs
            .iter()
            .filter(|t| t.kind == META_TLV_TYPE_MMR_REF)
            .filter_map(|t| t.data.first().copied())
            .collect()
    }
}

fn bad_meta(reason: String) -> anyhow::Error {
    MfgError::BadMeta { reason }.into()
}

/// Reads back the metadata region whose footer ends at `buf[end - 1]`.
pub fn parse(buf: &[u8], end: usize) -> Result<ParsedMeta> {
    if end > buf.len() || end < META_FOOTER_SZ {
        return Err(bad_meta(format!(
            "end offset {:#x} is outside the {:#x}-byte image",
            end,
            buf.len()
        )));
    }
    let footer_at = end - META_FOOTER_SZ;
    let footer = MetaFooter::read_from_bytes(&buf[footer_at..end])
        .map_err(|_| bad_meta("truncated footer".to_string()))?;

    if footer.magic.get() != META_MAGIC {
        return Err(bad_meta(format!(
            "bad magic {:#010x} at {:#x}",
            footer.magic.get(),
            footer_at
        )));
    }
    if footer.version != META_VERSION {
        return Err(bad_meta(format!(
            "unsupported version {}",
            footer.version
        )));
    }
    let size = usize::from(footer.size.get());
    if size < META_FOOTER_SZ || size > end {
        return Err(bad_meta(format!("impossible region size {:#x}", size)));
    }

    let start = end - size;
    let mut tlvs = vec![];
    let mut pos = start;
    while pos < footer_at {
        if pos + META_TLV_HEADER_SZ > footer_at {
            return Err(bad_meta(format!("truncated TLV header at {:#x}", pos)));
        }
        let hdr = MetaTlvHeader::read_from_bytes(
            &buf[pos..pos + META_TLV_HEADER_SZ],
        )
        .map_err(|_| bad_meta(format!("truncated TLV header at {:#x}", pos)))?;
        let data_offset = pos + META_TLV_HEADER_SZ;
        let data_end = data_offset + usize::from(hdr.size);
        if data_end > footer_at {
            return Err(bad_meta(format!(
                "TLV at {:#x} runs into the footer",
                pos
            )));
        }
        tlvs.push(ParsedTlv {
            kind: hdr.kind,
            data_offset,
            data: buf[data_offset..data_end].to_vec(),
        });
        pos = data_end;
    }

    Ok(ParsedMeta { start, size, tlvs })
}
