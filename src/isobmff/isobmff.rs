// SPDX-License-Identifier: GPL-2.0-or-later

pub mod boxes;
mod codec;
mod fragment;
mod sample_table;
mod track;

#[cfg(test)]
mod test;

pub use codec::{
    aac_codec_string, av1_codec_string, avc_codec_string, hevc_codec_string, vp9_codec_string,
};
pub use fragment::TrackDefaults;
pub use sample_table::{SampleTableError, SampleTables};
pub use track::TrackError;

use boxes::{fourcc, BoxHeader, BoxTree, BoxType};
use byteio::{ByteIterator, ReadError};
use bytes::{Buf, BytesMut};
use common::{DemuxEvent, SamplePosition, Track, TrackId};
use fragment::FragmentError;
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

// Upper bound for boxes that are buffered whole. A moov this
// large is corrupt rather than big.
const MAX_METADATA_BOX_SIZE: u64 = 64 << 20;

#[derive(Debug, Error)]
pub enum DemuxError {
    #[error("input ends inside a box starting at offset {0}")]
    TruncatedInput(u64),

    #[error("box '{fourcc_}' at offset {1} has unbounded size", fourcc_ = fourcc(*.0))]
    UnboundedBox(BoxType, u64),

    #[error("box '{fourcc_}' at offset {1}: size {2} exceeds metadata limit", fourcc_ = fourcc(*.0))]
    OversizedBox(BoxType, u64, u64),

    #[error("moof at offset {0} before moov")]
    MoofBeforeMoov(u64),

    #[error("{0}")]
    Box(#[from] boxes::BoxError),

    #[error("{0}")]
    Track(#[from] TrackError),

    #[error("{0}")]
    SampleTable(#[from] SampleTableError),

    #[error("{0}")]
    Fragment(#[from] FragmentError),
}

#[derive(Clone, Copy)]
enum State {
    // Expecting a box header at the buffer start.
    BoxHeader,

    // Discarding payload bytes. `None` runs to the end of the
    // file (size zero).
    Skip { remaining: Option<u64> },

    // Buffering a whole box, header included.
    Collect { typ: BoxType, total: u64 },
}

// Incremental ISO-BMFF demuxer. Bytes go in via `feed`, events
// come out via `poll`. The demuxer buffers moov and moof
// subtrees whole and streams over everything else, so the
// buffer stays small for arbitrarily large files.
pub struct Demuxer {
    buf: BytesMut,
    base: u64,
    state: State,
    events: VecDeque<DemuxEvent>,
    trex: HashMap<u32, TrackDefaults>,
    seen_moov: bool,
}

impl Default for Demuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl Demuxer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            base: 0,
            state: State::BoxHeader,
            events: VecDeque::new(),
            trex: HashMap::new(),
            seen_moov: false,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    // Parses as far as the buffered bytes allow. `None` means
    // more input is needed.
    pub fn poll(&mut self) -> Result<Option<DemuxEvent>, DemuxError> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Ok(Some(event));
            }
            if !self.step()? {
                return Ok(None);
            }
        }
    }

    // Signals end of input. Fails if the stream stops inside a box.
    pub fn finish(&self) -> Result<(), DemuxError> {
        match &self.state {
            State::BoxHeader => {
                if self.buf.is_empty() {
                    Ok(())
                } else {
                    Err(DemuxError::TruncatedInput(self.base))
                }
            }
            State::Skip { remaining } => match remaining {
                Some(r) if *r > 0 => Err(DemuxError::TruncatedInput(self.base)),
                _ => Ok(()),
            },
            State::Collect { .. } => Err(DemuxError::TruncatedInput(self.base)),
        }
    }

    fn consume(&mut self, n: usize) {
        self.buf.advance(n);
        self.base += u64::try_from(n).expect("u64 fit usize");
    }

    // Returns false when no further progress is possible
    // without more input.
    fn step(&mut self) -> Result<bool, DemuxError> {
        match self.state {
            State::Skip { remaining } => {
                let available = u64::try_from(self.buf.len()).expect("u64 fit usize");
                match remaining {
                    None => {
                        self.consume(usize::try_from(available).expect("usize fit u64"));
                        Ok(false)
                    }
                    Some(r) => {
                        let take = r.min(available);
                        self.consume(usize::try_from(take).expect("usize fit u64"));
                        if take == r {
                            self.state = State::BoxHeader;
                            Ok(true)
                        } else {
                            self.state = State::Skip {
                                remaining: Some(r - take),
                            };
                            Ok(false)
                        }
                    }
                }
            }
            State::BoxHeader => {
                let mut it = ByteIterator::new(&self.buf, self.base);
                let header = match BoxHeader::parse(&mut it) {
                    Ok(v) => v,
                    Err(ReadError::Incomplete) => return Ok(false),
                    Err(_) => return Err(DemuxError::TruncatedInput(self.base)),
                };

                if matches!(&header.typ, b"moov" | b"moof") {
                    let Some(size) = header.size else {
                        return Err(DemuxError::UnboundedBox(header.typ, header.offset));
                    };
                    if size > MAX_METADATA_BOX_SIZE {
                        return Err(DemuxError::OversizedBox(header.typ, header.offset, size));
                    }
                    if size < header.header_len {
                        return Err(boxes::BoxError::SizeTooSmall(
                            header.typ,
                            header.offset,
                            size,
                        )
                        .into());
                    }
                    self.state = State::Collect {
                        typ: header.typ,
                        total: size,
                    };
                } else {
                    self.consume(usize::try_from(header.header_len).expect("usize fit u64"));
                    self.state = State::Skip {
                        remaining: header.payload_size(),
                    };
                }
                Ok(true)
            }
            State::Collect { typ, total } => {
                let total_len = usize::try_from(total).expect("usize fit u64");
                if self.buf.len() < total_len {
                    return Ok(false);
                }
                let offset = self.base;
                let data = self.buf.split_to(total_len);
                self.base += total;

                let tree = BoxTree::parse(&data, offset)?;
                match &typ {
                    b"moov" => self.handle_moov(&tree)?,
                    b"moof" => self.handle_moof(&tree)?,
                    _ => unreachable!("only moov and moof are collected"),
                }
                self.state = State::BoxHeader;
                Ok(true)
            }
        }
    }

    fn handle_moov(&mut self, moov: &BoxTree) -> Result<(), DemuxError> {
        if let Some(mvex) = moov.child(*b"mvex") {
            for trex in mvex.children_of(*b"trex") {
                if let Some((track_id, defaults)) = fragment::parse_trex(trex.payload) {
                    self.trex.insert(track_id, defaults);
                }
            }
        }

        let mut tagged: Vec<(TrackId, SamplePosition)> = Vec::new();
        for trak in moov.children_of(*b"trak") {
            let parsed = track::parse_trak(trak)?;
            let track_id = parsed.track.id();
            let is_other = matches!(parsed.track, Track::Other(_));
            self.events.push_back(DemuxEvent::Track(parsed.track));

            if is_other {
                continue;
            }
            for position in parsed.tables.resolve()? {
                tagged.push((track_id, position));
            }
        }

        // Emit samples interleaved in file order so consumers see
        // tracks advance together. The sort is stable, per-track
        // decode order is unchanged.
        tagged.sort_by_key(|(_, p)| p.file_offset);
        for (track_id, position) in tagged {
            match self.events.back_mut() {
                Some(DemuxEvent::Samples {
                    track_id: last_id,
                    positions,
                }) if *last_id == track_id => positions.push(position),
                _ => self.events.push_back(DemuxEvent::Samples {
                    track_id,
                    positions: vec![position],
                }),
            }
        }

        self.seen_moov = true;
        Ok(())
    }

    fn handle_moof(&mut self, moof: &BoxTree) -> Result<(), DemuxError> {
        if !self.seen_moov {
            return Err(DemuxError::MoofBeforeMoov(moof.offset));
        }
        for (track_id, positions) in fragment::resolve_fragment(moof, &self.trex)? {
            if !positions.is_empty() {
                self.events.push_back(DemuxEvent::Samples {
                    track_id: TrackId::new(track_id),
                    positions,
                });
            }
        }
        Ok(())
    }
}
