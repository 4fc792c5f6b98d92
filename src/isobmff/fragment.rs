// SPDX-License-Identifier: GPL-2.0-or-later

use crate::boxes::BoxTree;
use byteio::ByteIterator;
use common::SamplePosition;
use std::collections::HashMap;
use thiserror::Error;

// tfhd flags.
const TFHD_BASE_DATA_OFFSET_PRESENT: u32 = 0x0000_0001;
const TFHD_SAMPLE_DESCRIPTION_INDEX_PRESENT: u32 = 0x0000_0002;
const TFHD_DEFAULT_SAMPLE_DURATION_PRESENT: u32 = 0x0000_0008;
const TFHD_DEFAULT_SAMPLE_SIZE_PRESENT: u32 = 0x0000_0010;
const TFHD_DEFAULT_SAMPLE_FLAGS_PRESENT: u32 = 0x0000_0020;

// trun flags.
const TRUN_DATA_OFFSET_PRESENT: u32 = 0x0000_0001;
const TRUN_FIRST_SAMPLE_FLAGS_PRESENT: u32 = 0x0000_0004;
const TRUN_SAMPLE_DURATION_PRESENT: u32 = 0x0000_0100;
const TRUN_SAMPLE_SIZE_PRESENT: u32 = 0x0000_0200;
const TRUN_SAMPLE_FLAGS_PRESENT: u32 = 0x0000_0400;
const TRUN_SAMPLE_COMPOSITION_TIME_OFFSET_PRESENT: u32 = 0x0000_0800;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FragmentError {
    #[error("traf at offset {0} has no tfhd")]
    MissingTfhd(u64),

    #[error("box at offset {0} is truncated")]
    Truncated(u64),

    #[error("track {0}: sample {1} has no duration and no default")]
    NoDuration(u32, u32),

    #[error("track {0}: sample {1} has no size and no default")]
    NoSize(u32, u32),

    #[error("track {0}: sample {1} has no flags and no default")]
    NoFlags(u32, u32),
}

// Defaults from the mvex trex box, one per track.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrackDefaults {
    pub sample_duration: Option<u32>,
    pub sample_size: Option<u32>,
    pub sample_flags: Option<u32>,
}

pub fn parse_trex(payload: &[u8]) -> Option<(u32, TrackDefaults)> {
    let mut it = ByteIterator::new(payload, 0);
    it.skip(4).ok()?; // Full box.
    let track_id = it.read_u32().ok()?;
    it.skip(4).ok()?; // Default sample description index.
    let duration = it.read_u32().ok()?;
    let size = it.read_u32().ok()?;
    let flags = it.read_u32().ok()?;
    Some((
        track_id,
        TrackDefaults {
            sample_duration: (duration != 0).then_some(duration),
            sample_size: (size != 0).then_some(size),
            sample_flags: (flags != 0).then_some(flags),
        },
    ))
}

struct Tfhd {
    track_id: u32,
    base_data_offset: Option<u64>,
    default_sample_duration: Option<u32>,
    default_sample_size: Option<u32>,
    default_sample_flags: Option<u32>,
}

fn parse_tfhd(payload: &[u8], offset: u64) -> Result<Tfhd, FragmentError> {
    let mut it = ByteIterator::new(payload, 0);
    let trunc = |_| FragmentError::Truncated(offset);
    it.read_u8().map_err(trunc)?; // Version.
    let flags = it.read_u24().map_err(trunc)?;
    let track_id = it.read_u32().map_err(trunc)?;

    let mut tfhd = Tfhd {
        track_id,
        base_data_offset: None,
        default_sample_duration: None,
        default_sample_size: None,
        default_sample_flags: None,
    };
    if flags & TFHD_BASE_DATA_OFFSET_PRESENT != 0 {
        tfhd.base_data_offset = Some(it.read_u64().map_err(trunc)?);
    }
    if flags & TFHD_SAMPLE_DESCRIPTION_INDEX_PRESENT != 0 {
        it.skip(4).map_err(trunc)?;
    }
    if flags & TFHD_DEFAULT_SAMPLE_DURATION_PRESENT != 0 {
        tfhd.default_sample_duration = Some(it.read_u32().map_err(trunc)?);
    }
    if flags & TFHD_DEFAULT_SAMPLE_SIZE_PRESENT != 0 {
        tfhd.default_sample_size = Some(it.read_u32().map_err(trunc)?);
    }
    if flags & TFHD_DEFAULT_SAMPLE_FLAGS_PRESENT != 0 {
        tfhd.default_sample_flags = Some(it.read_u32().map_err(trunc)?);
    }
    Ok(tfhd)
}

fn parse_tfdt(payload: &[u8], offset: u64) -> Result<i64, FragmentError> {
    let mut it = ByteIterator::new(payload, 0);
    let trunc = |_| FragmentError::Truncated(offset);
    let version = it.read_u8().map_err(trunc)?;
    it.skip(3).map_err(trunc)?;
    let time = if version == 1 {
        it.read_u64().map_err(trunc)?
    } else {
        u64::from(it.read_u32().map_err(trunc)?)
    };
    Ok(i64::try_from(time).unwrap_or(0))
}

struct TrunSample {
    duration: Option<u32>,
    size: Option<u32>,
    flags: Option<u32>,
    composition_offset: i64,
}

struct Trun {
    data_offset: Option<i64>,
    first_sample_flags: Option<u32>,
    samples: Vec<TrunSample>,
}

fn parse_trun(payload: &[u8], offset: u64) -> Result<Trun, FragmentError> {
    let mut it = ByteIterator::new(payload, 0);
    let trunc = |_| FragmentError::Truncated(offset);
    let version = it.read_u8().map_err(trunc)?;
    let flags = it.read_u24().map_err(trunc)?;
    let sample_count = it.read_u32().map_err(trunc)?;

    let mut trun = Trun {
        data_offset: None,
        first_sample_flags: None,
        samples: Vec::with_capacity(usize::try_from(sample_count).expect("usize fit u32")),
    };
    if flags & TRUN_DATA_OFFSET_PRESENT != 0 {
        trun.data_offset = Some(i64::from(it.read_i32().map_err(trunc)?));
    }
    if flags & TRUN_FIRST_SAMPLE_FLAGS_PRESENT != 0 {
        trun.first_sample_flags = Some(it.read_u32().map_err(trunc)?);
    }

    for _ in 0..sample_count {
        let duration = if flags & TRUN_SAMPLE_DURATION_PRESENT != 0 {
            Some(it.read_u32().map_err(trunc)?)
        } else {
            None
        };
        let size = if flags & TRUN_SAMPLE_SIZE_PRESENT != 0 {
            Some(it.read_u32().map_err(trunc)?)
        } else {
            None
        };
        let sample_flags = if flags & TRUN_SAMPLE_FLAGS_PRESENT != 0 {
            Some(it.read_u32().map_err(trunc)?)
        } else {
            None
        };
        let composition_offset = if flags & TRUN_SAMPLE_COMPOSITION_TIME_OFFSET_PRESENT != 0 {
            if version == 0 {
                i64::from(it.read_u32().map_err(trunc)?)
            } else {
                i64::from(it.read_i32().map_err(trunc)?)
            }
        } else {
            0
        };
        trun.samples.push(TrunSample {
            duration,
            size,
            flags: sample_flags,
            composition_offset,
        });
    }
    Ok(trun)
}

// The keyframe bit is "sample is non-sync" inverted.
fn is_keyframe(flags: u32) -> bool {
    (flags >> 16) & 1 == 0
}

// Resolves every traf in a moof into per-track sample positions.
//
// Per sample the value chain is: explicit trun value, then
// `first_sample_flags` for the first sample, then the tfhd
// defaults, then the trex defaults, then error.
pub fn resolve_fragment(
    moof: &BoxTree,
    trex_defaults: &HashMap<u32, TrackDefaults>,
) -> Result<Vec<(u32, Vec<SamplePosition>)>, FragmentError> {
    let mut out = Vec::new();

    for traf in moof.children_of(*b"traf") {
        let tfhd = traf
            .child(*b"tfhd")
            .ok_or(FragmentError::MissingTfhd(traf.offset))?;
        let tfhd = parse_tfhd(tfhd.payload, tfhd.offset)?;
        let trex = trex_defaults
            .get(&tfhd.track_id)
            .copied()
            .unwrap_or_default();

        let mut time: i64 = match traf.child(*b"tfdt") {
            Some(tfdt) => parse_tfdt(tfdt.payload, tfdt.offset)?,
            None => 0,
        };
        let base_offset = tfhd.base_data_offset.unwrap_or(moof.offset);

        let mut positions = Vec::new();
        let mut offset: i64 = 0;
        for (trun_box, index) in traf.children_of(*b"trun").zip(0_u32..) {
            let trun = parse_trun(trun_box.payload, trun_box.offset)?;
            if let Some(data_offset) = trun.data_offset {
                offset = data_offset;
            } else if index == 0 {
                offset = 0;
            }

            for (i, sample) in trun.samples.iter().enumerate() {
                let number = u32::try_from(positions.len()).expect("u32 fit len") + 1;
                let duration = sample
                    .duration
                    .or(tfhd.default_sample_duration)
                    .or(trex.sample_duration)
                    .ok_or(FragmentError::NoDuration(tfhd.track_id, number))?;
                let size = sample
                    .size
                    .or(tfhd.default_sample_size)
                    .or(trex.sample_size)
                    .ok_or(FragmentError::NoSize(tfhd.track_id, number))?;
                let flags = sample
                    .flags
                    .or(if i == 0 { trun.first_sample_flags } else { None })
                    .or(tfhd.default_sample_flags)
                    .or(trex.sample_flags)
                    .ok_or(FragmentError::NoFlags(tfhd.track_id, number))?;

                positions.push(SamplePosition {
                    file_offset: base_offset
                        .saturating_add_signed(offset),
                    size,
                    dts: time,
                    cts: time + sample.composition_offset,
                    duration,
                    is_keyframe: is_keyframe(flags),
                });

                offset += i64::from(size);
                time += i64::from(duration);
            }
        }

        out.push((tfhd.track_id, positions));
    }

    Ok(out)
}
