// SPDX-License-Identifier: GPL-2.0-or-later

use crate::boxes::{fourcc, BoxTree, BoxType};
use byteio::{ByteIterator, ReadError};
use common::SamplePosition;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SampleTableError {
    #[error("box '{fourcc_}': {1}", fourcc_ = fourcc(*.0))]
    Malformed(BoxType, &'static str),

    #[error("sample {0} has zero size")]
    ZeroSize(u32),

    #[error("every stts delta is zero")]
    AllZeroDeltas,

    #[error("chunk {0} has no offset entry")]
    MissingChunkOffset(u32),
}

impl SampleTableError {
    fn truncated(typ: BoxType) -> impl FnOnce(ReadError) -> SampleTableError {
        move |_| SampleTableError::Malformed(typ, "truncated")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SttsEntry {
    pub sample_count: u32,
    pub sample_delta: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CttsEntry {
    pub sample_count: u32,
    pub sample_offset: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StscEntry {
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
}

// Decoded stbl leaves for one track.
#[derive(Debug, Default)]
pub struct SampleTables {
    pub stts: Vec<SttsEntry>,
    pub ctts: Vec<CttsEntry>,

    // Uniform size, or one entry per sample.
    pub uniform_size: u32,
    pub sizes: Vec<u32>,
    pub sample_count: u32,

    pub stsc: Vec<StscEntry>,
    pub chunk_offsets: Vec<u64>,

    // 1-based sync sample numbers. Absent means every sample
    // is a keyframe.
    pub sync_samples: Option<Vec<u32>>,

    // Media time of the first edit, subtracted from composition
    // timestamps.
    pub presentation_offset: i64,
}

impl SampleTables {
    pub fn parse(stbl: &BoxTree, elst: Option<&BoxTree>) -> Result<Self, SampleTableError> {
        let mut tables = SampleTables::default();

        for child in &stbl.children {
            match &child.typ {
                b"stts" => parse_stts(child.payload, &mut tables)?,
                b"ctts" => parse_ctts(child.payload, &mut tables)?,
                b"stsz" => parse_stsz(child.payload, &mut tables)?,
                b"stz2" => parse_stz2(child.payload, &mut tables)?,
                b"stsc" => parse_stsc(child.payload, &mut tables)?,
                b"stco" => parse_stco(child.payload, false, &mut tables)?,
                b"co64" => parse_stco(child.payload, true, &mut tables)?,
                b"stss" => parse_stss(child.payload, &mut tables)?,
                _ => {}
            }
        }

        if let Some(elst) = elst {
            tables.presentation_offset = parse_elst(elst.payload)?;
        }

        Ok(tables)
    }

    // Composes the tables into per-sample positions in decode order.
    pub fn resolve(&self) -> Result<Vec<SamplePosition>, SampleTableError> {
        let count = usize::try_from(self.sample_count).expect("usize fit u32");
        if count == 0 {
            return Ok(Vec::new());
        }

        let durations = self.effective_durations()?;
        let cts_offsets = self.expand_ctts(count);

        let mut positions = Vec::with_capacity(count);
        let mut dts: i64 = 0;
        let mut index: u32 = 0;

        'chunks: for (chunk_index, samples_in_chunk) in self.chunk_walk() {
            let Some(chunk_offset) = self
                .chunk_offsets
                .get(usize::try_from(chunk_index).expect("usize fit u32"))
            else {
                return Err(SampleTableError::MissingChunkOffset(chunk_index + 1));
            };
            let mut offset = *chunk_offset;

            for _ in 0..samples_in_chunk {
                if index >= self.sample_count {
                    break 'chunks;
                }
                let i = usize::try_from(index).expect("usize fit u32");
                let size = self.sample_size(i);
                if size == 0 {
                    return Err(SampleTableError::ZeroSize(index + 1));
                }
                let duration = durations[i];
                let cts = dts + cts_offsets.get(i).copied().unwrap_or(0) - self.presentation_offset;

                positions.push(SamplePosition {
                    file_offset: offset,
                    size,
                    dts,
                    cts,
                    duration,
                    is_keyframe: self.is_sync_sample(index + 1),
                });

                offset += u64::from(size);
                dts += i64::from(duration);
                index += 1;
            }
        }

        Ok(positions)
    }

    fn sample_size(&self, i: usize) -> u32 {
        if self.uniform_size != 0 {
            self.uniform_size
        } else {
            self.sizes.get(i).copied().unwrap_or(0)
        }
    }

    fn is_sync_sample(&self, number: u32) -> bool {
        match &self.sync_samples {
            Some(numbers) => numbers.binary_search(&number).is_ok(),
            None => true,
        }
    }

    // Per-sample durations with zero deltas replaced by the
    // nearest non-zero delta.
    fn effective_durations(&self) -> Result<Vec<u32>, SampleTableError> {
        let count = usize::try_from(self.sample_count).expect("usize fit u32");
        let fallback = self
            .stts
            .iter()
            .find(|e| e.sample_delta != 0)
            .ok_or(SampleTableError::AllZeroDeltas)?
            .sample_delta;

        let mut durations = Vec::with_capacity(count);
        let mut last_nonzero = fallback;
        for entry in &self.stts {
            let delta = if entry.sample_delta == 0 {
                last_nonzero
            } else {
                last_nonzero = entry.sample_delta;
                entry.sample_delta
            };
            for _ in 0..entry.sample_count {
                if durations.len() == count {
                    break;
                }
                durations.push(delta);
            }
        }
        // Tables shorter than the sample count reuse the last delta.
        while durations.len() < count {
            durations.push(last_nonzero);
        }
        Ok(durations)
    }

    fn expand_ctts(&self, count: usize) -> Vec<i64> {
        let mut offsets = Vec::with_capacity(count);
        for entry in &self.ctts {
            for _ in 0..entry.sample_count {
                if offsets.len() == count {
                    return offsets;
                }
                offsets.push(entry.sample_offset);
            }
        }
        offsets
    }

    // Yields (chunk index, samples per chunk) pairs by expanding
    // the stsc runs over the chunk offset table.
    fn chunk_walk(&self) -> Vec<(u32, u32)> {
        let chunk_count = u32::try_from(self.chunk_offsets.len()).expect("u32 fit len");
        let mut walk = Vec::new();
        for (i, entry) in self.stsc.iter().enumerate() {
            let end = match self.stsc.get(i + 1) {
                Some(next) => next.first_chunk.saturating_sub(1),
                None => chunk_count,
            };
            for chunk in entry.first_chunk.saturating_sub(1)..end {
                walk.push((chunk, entry.samples_per_chunk));
            }
        }
        walk
    }
}

fn parse_stts(payload: &[u8], tables: &mut SampleTables) -> Result<(), SampleTableError> {
    let typ = *b"stts";
    let mut it = ByteIterator::new(payload, 0);
    it.skip(4).map_err(SampleTableError::truncated(typ))?; // Full box.
    let count = it.read_u32().map_err(SampleTableError::truncated(typ))?;
    for _ in 0..count {
        let sample_count = it.read_u32().map_err(SampleTableError::truncated(typ))?;
        let sample_delta = it.read_u32().map_err(SampleTableError::truncated(typ))?;
        tables.stts.push(SttsEntry {
            sample_count,
            sample_delta,
        });
    }
    Ok(())
}

fn parse_ctts(payload: &[u8], tables: &mut SampleTables) -> Result<(), SampleTableError> {
    let typ = *b"ctts";
    let mut it = ByteIterator::new(payload, 0);
    let version = it.read_u8().map_err(SampleTableError::truncated(typ))?;
    it.skip(3).map_err(SampleTableError::truncated(typ))?;
    let count = it.read_u32().map_err(SampleTableError::truncated(typ))?;
    for _ in 0..count {
        let sample_count = it.read_u32().map_err(SampleTableError::truncated(typ))?;
        // Offsets are signed in version 1.
        let sample_offset = if version == 1 {
            i64::from(it.read_i32().map_err(SampleTableError::truncated(typ))?)
        } else {
            i64::from(it.read_u32().map_err(SampleTableError::truncated(typ))?)
        };
        tables.ctts.push(CttsEntry {
            sample_count,
            sample_offset,
        });
    }
    Ok(())
}

fn parse_stsz(payload: &[u8], tables: &mut SampleTables) -> Result<(), SampleTableError> {
    let typ = *b"stsz";
    let mut it = ByteIterator::new(payload, 0);
    it.skip(4).map_err(SampleTableError::truncated(typ))?;
    tables.uniform_size = it.read_u32().map_err(SampleTableError::truncated(typ))?;
    tables.sample_count = it.read_u32().map_err(SampleTableError::truncated(typ))?;
    if tables.uniform_size == 0 {
        for _ in 0..tables.sample_count {
            tables
                .sizes
                .push(it.read_u32().map_err(SampleTableError::truncated(typ))?);
        }
    }
    Ok(())
}

// Compact sample sizes with 4, 8 or 16-bit fields.
fn parse_stz2(payload: &[u8], tables: &mut SampleTables) -> Result<(), SampleTableError> {
    let typ = *b"stz2";
    let mut it = ByteIterator::new(payload, 0);
    it.skip(4).map_err(SampleTableError::truncated(typ))?;
    it.skip(3).map_err(SampleTableError::truncated(typ))?; // Reserved.
    let field_size = it.read_u8().map_err(SampleTableError::truncated(typ))?;
    tables.sample_count = it.read_u32().map_err(SampleTableError::truncated(typ))?;
    match field_size {
        4 => {
            let mut remaining = tables.sample_count;
            while remaining > 0 {
                let b = it.read_u8().map_err(SampleTableError::truncated(typ))?;
                tables.sizes.push(u32::from(b >> 4));
                remaining -= 1;
                if remaining > 0 {
                    tables.sizes.push(u32::from(b & 0x0F));
                    remaining -= 1;
                }
            }
        }
        8 => {
            for _ in 0..tables.sample_count {
                let b = it.read_u8().map_err(SampleTableError::truncated(typ))?;
                tables.sizes.push(u32::from(b));
            }
        }
        16 => {
            for _ in 0..tables.sample_count {
                let b = it.read_u16().map_err(SampleTableError::truncated(typ))?;
                tables.sizes.push(u32::from(b));
            }
        }
        _ => return Err(SampleTableError::Malformed(typ, "bad field size")),
    }
    Ok(())
}

fn parse_stsc(payload: &[u8], tables: &mut SampleTables) -> Result<(), SampleTableError> {
    let typ = *b"stsc";
    let mut it = ByteIterator::new(payload, 0);
    it.skip(4).map_err(SampleTableError::truncated(typ))?;
    let count = it.read_u32().map_err(SampleTableError::truncated(typ))?;
    for _ in 0..count {
        let first_chunk = it.read_u32().map_err(SampleTableError::truncated(typ))?;
        let samples_per_chunk = it.read_u32().map_err(SampleTableError::truncated(typ))?;
        it.skip(4).map_err(SampleTableError::truncated(typ))?; // Sample description index.
        tables.stsc.push(StscEntry {
            first_chunk,
            samples_per_chunk,
        });
    }
    Ok(())
}

fn parse_stco(
    payload: &[u8],
    large: bool,
    tables: &mut SampleTables,
) -> Result<(), SampleTableError> {
    let typ = if large { *b"co64" } else { *b"stco" };
    let mut it = ByteIterator::new(payload, 0);
    it.skip(4).map_err(SampleTableError::truncated(typ))?;
    let count = it.read_u32().map_err(SampleTableError::truncated(typ))?;
    for _ in 0..count {
        let offset = if large {
            it.read_u64().map_err(SampleTableError::truncated(typ))?
        } else {
            u64::from(it.read_u32().map_err(SampleTableError::truncated(typ))?)
        };
        tables.chunk_offsets.push(offset);
    }
    Ok(())
}

fn parse_stss(payload: &[u8], tables: &mut SampleTables) -> Result<(), SampleTableError> {
    let typ = *b"stss";
    let mut it = ByteIterator::new(payload, 0);
    it.skip(4).map_err(SampleTableError::truncated(typ))?;
    let count = it.read_u32().map_err(SampleTableError::truncated(typ))?;
    let mut numbers = Vec::with_capacity(usize::try_from(count).expect("usize fit u32"));
    for _ in 0..count {
        numbers.push(it.read_u32().map_err(SampleTableError::truncated(typ))?);
    }
    numbers.sort_unstable();
    tables.sync_samples = Some(numbers);
    Ok(())
}

// Media time of the first non-empty edit.
fn parse_elst(payload: &[u8]) -> Result<i64, SampleTableError> {
    let typ = *b"elst";
    let mut it = ByteIterator::new(payload, 0);
    let version = it.read_u8().map_err(SampleTableError::truncated(typ))?;
    it.skip(3).map_err(SampleTableError::truncated(typ))?;
    let count = it.read_u32().map_err(SampleTableError::truncated(typ))?;
    for _ in 0..count {
        let media_time = if version == 1 {
            it.skip(8).map_err(SampleTableError::truncated(typ))?;
            let v = it.read_u64().map_err(SampleTableError::truncated(typ))?;
            #[allow(clippy::cast_possible_wrap, clippy::as_conversions)]
            {
                v as i64
            }
        } else {
            it.skip(4).map_err(SampleTableError::truncated(typ))?;
            i64::from(it.read_i32().map_err(SampleTableError::truncated(typ))?)
        };
        it.skip(4).map_err(SampleTableError::truncated(typ))?; // Media rate.

        // Media time -1 is an empty edit.
        if media_time >= 0 {
            return Ok(media_time);
        }
    }
    Ok(0)
}
