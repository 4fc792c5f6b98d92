// SPDX-License-Identifier: GPL-2.0-or-later

use byteio::ByteIterator;
use thiserror::Error;

const FLAG_KEYFRAME: u8 = 0b1000_0000;
const LACING_MASK: u8 = 0b0000_0110;
const LACING_NONE: u8 = 0b0000_0000;
const LACING_XIPH: u8 = 0b0000_0010;
const LACING_FIXED: u8 = 0b0000_0100;
const LACING_EBML: u8 = 0b0000_0110;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("block at offset {0} is truncated")]
    Truncated(u64),

    #[error("block at offset {0}: laced payload does not divide evenly")]
    UnevenFixedLacing(u64),

    #[error("block at offset {0}: lace sizes exceed payload")]
    LaceOverflow(u64),
}

// One frame inside a block, located within the source stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaceFrame {
    pub file_offset: u64,
    pub size: u32,
}

// Decoded block header plus the location of each laced frame.
#[derive(Debug, PartialEq, Eq)]
pub struct BlockInfo {
    pub track_number: u64,

    // Relative to the enclosing cluster timestamp.
    pub relative_timestamp: i16,

    // SimpleBlock only, always false for Block.
    pub keyframe: bool,

    pub frames: Vec<LaceFrame>,
}

// Decodes a SimpleBlock or Block payload. `base` is the absolute
// offset of `data` within the source stream so the lace frames
// carry resolvable positions.
pub fn parse_block(data: &[u8], base: u64) -> Result<BlockInfo, BlockError> {
    let mut it = ByteIterator::new(data, base);
    let trunc = |_| BlockError::Truncated(base);

    let track_number = it.read_vint().map_err(trunc)?;
    let relative_timestamp = it.read_i16().map_err(trunc)?;
    let flags = it.read_u8().map_err(trunc)?;
    let keyframe = flags & FLAG_KEYFRAME != 0;

    let frames = match flags & LACING_MASK {
        LACING_NONE => {
            let size = u32::try_from(it.remaining()).map_err(|_| BlockError::Truncated(base))?;
            vec![LaceFrame {
                file_offset: it.pos(),
                size,
            }]
        }
        lacing => {
            let frame_count = usize::from(it.read_u8().map_err(trunc)?) + 1;
            let sizes = match lacing {
                LACING_XIPH => xiph_sizes(&mut it, frame_count, base)?,
                LACING_FIXED => fixed_sizes(&it, frame_count, base)?,
                _ => ebml_sizes(&mut it, frame_count, base)?,
            };

            let mut frames = Vec::with_capacity(frame_count);
            let mut offset = it.pos();
            let mut remaining = u64::try_from(it.remaining()).expect("u64 fit usize");
            for size in sizes {
                if u64::from(size) > remaining {
                    return Err(BlockError::LaceOverflow(base));
                }
                frames.push(LaceFrame {
                    file_offset: offset,
                    size,
                });
                offset += u64::from(size);
                remaining -= u64::from(size);
            }
            frames
        }
    };

    Ok(BlockInfo {
        track_number,
        relative_timestamp,
        keyframe,
        frames,
    })
}

// Xiph lacing: the first n-1 sizes are sums of 255-bytes plus a
// terminator, the last frame takes the remainder.
fn xiph_sizes(
    it: &mut ByteIterator,
    frame_count: usize,
    base: u64,
) -> Result<Vec<u32>, BlockError> {
    let trunc = |_| BlockError::Truncated(base);
    let mut sizes = Vec::with_capacity(frame_count);
    let mut total: u64 = 0;
    for _ in 0..frame_count - 1 {
        let mut size: u32 = 0;
        loop {
            let b = it.read_u8().map_err(trunc)?;
            size += u32::from(b);
            if b != 255 {
                break;
            }
        }
        total += u64::from(size);
        sizes.push(size);
    }
    let remaining = u64::try_from(it.remaining()).expect("u64 fit usize");
    let last = remaining
        .checked_sub(total)
        .ok_or(BlockError::LaceOverflow(base))?;
    sizes.push(u32::try_from(last).map_err(|_| BlockError::LaceOverflow(base))?);
    Ok(sizes)
}

fn fixed_sizes(
    it: &ByteIterator,
    frame_count: usize,
    base: u64,
) -> Result<Vec<u32>, BlockError> {
    let remaining = it.remaining();
    if remaining % frame_count != 0 {
        return Err(BlockError::UnevenFixedLacing(base));
    }
    let size = u32::try_from(remaining / frame_count).map_err(|_| BlockError::LaceOverflow(base))?;
    Ok(vec![size; frame_count])
}

// EBML lacing: first size is a plain VINT, the rest are signed
// VINT deltas against the previous size.
fn ebml_sizes(
    it: &mut ByteIterator,
    frame_count: usize,
    base: u64,
) -> Result<Vec<u32>, BlockError> {
    let trunc = |_| BlockError::Truncated(base);
    let mut sizes = Vec::with_capacity(frame_count);

    let (first, _) = it.read_vint_with_width().map_err(trunc)?;
    let mut size = i64::try_from(first).map_err(|_| BlockError::LaceOverflow(base))?;
    sizes.push(u32::try_from(size).map_err(|_| BlockError::LaceOverflow(base))?);

    for _ in 1..frame_count - 1 {
        let (raw, width) = it.read_vint_with_width().map_err(trunc)?;
        // Signed VINTs are shifted by half their range.
        let bias = (1_i64 << (7 * width - 1)) - 1;
        let delta = i64::try_from(raw).map_err(|_| BlockError::LaceOverflow(base))? - bias;
        size += delta;
        sizes.push(u32::try_from(size).map_err(|_| BlockError::LaceOverflow(base))?);
    }

    if frame_count > 1 {
        let total: u64 = sizes.iter().map(|s| u64::from(*s)).sum();
        let remaining = u64::try_from(it.remaining()).expect("u64 fit usize");
        let last = remaining
            .checked_sub(total)
            .ok_or(BlockError::LaceOverflow(base))?;
        sizes.push(u32::try_from(last).map_err(|_| BlockError::LaceOverflow(base))?);
    }
    Ok(sizes)
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_no_lacing() {
        // Track 1, relative timestamp +17, keyframe, no lacing.
        let mut data = vec![0x81, 0x00, 0x11, 0x80];
        data.extend_from_slice(&[0xAB; 512]);

        let block = parse_block(&data, 1000).unwrap();
        assert_eq!(1, block.track_number);
        assert_eq!(17, block.relative_timestamp);
        assert!(block.keyframe);
        assert_eq!(
            vec![LaceFrame {
                file_offset: 1004,
                size: 512,
            }],
            block.frames,
        );
    }

    #[test]
    fn test_delta_block() {
        let data = vec![0x82, 0xFF, 0xEF, 0x00, 1, 2, 3];
        let block = parse_block(&data, 0).unwrap();
        assert_eq!(2, block.track_number);
        assert_eq!(-17, block.relative_timestamp);
        assert!(!block.keyframe);
        assert_eq!(3, block.frames[0].size);
    }

    #[test]
    fn test_xiph_lacing() {
        // Three frames of sizes 300, 4, and the remainder.
        let mut data = vec![0x81, 0, 0, 0x02, 2];
        data.extend_from_slice(&[255, 45]); // 300.
        data.extend_from_slice(&[4]);
        data.extend_from_slice(&vec![0xCD; 300 + 4 + 10]);

        let block = parse_block(&data, 0).unwrap();
        let sizes: Vec<u32> = block.frames.iter().map(|f| f.size).collect();
        assert_eq!(vec![300, 4, 10], sizes);

        // Frames are adjacent.
        assert_eq!(
            block.frames[0].file_offset + 300,
            block.frames[1].file_offset,
        );
        assert_eq!(
            block.frames[1].file_offset + 4,
            block.frames[2].file_offset,
        );
    }

    #[test]
    fn test_fixed_lacing() {
        let mut data = vec![0x81, 0, 0, 0x04, 3];
        data.extend_from_slice(&[0xEE; 40]);

        let block = parse_block(&data, 0).unwrap();
        let sizes: Vec<u32> = block.frames.iter().map(|f| f.size).collect();
        assert_eq!(vec![10, 10, 10, 10], sizes);
    }

    #[test]
    fn test_fixed_lacing_uneven() {
        let mut data = vec![0x81, 0, 0, 0x04, 2];
        data.extend_from_slice(&[0xEE; 40]);
        assert_eq!(
            Err(BlockError::UnevenFixedLacing(0)),
            parse_block(&data, 0).map(|_| ()),
        );
    }

    #[test]
    fn test_ebml_lacing() {
        // First size 500, second 500-2=498, last remainder.
        let mut data = vec![0x81, 0, 0, 0x06, 2];
        data.extend_from_slice(&[0x41, 0xF4]); // 500 as 2-byte VINT.
        data.extend_from_slice(&[0x5F, 0xFD]); // Delta -2 as signed VINT.
        data.extend_from_slice(&vec![0x11; 500 + 498 + 7]);

        let block = parse_block(&data, 0).unwrap();
        let sizes: Vec<u32> = block.frames.iter().map(|f| f.size).collect();
        assert_eq!(vec![500, 498, 7], sizes);
    }
}
