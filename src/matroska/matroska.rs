// SPDX-License-Identifier: GPL-2.0-or-later

pub mod element;

mod block;
mod track;

#[cfg(test)]
mod test;

pub use block::{parse_block, BlockError, BlockInfo, LaceFrame};
pub use track::{TrackError, TRACK_TIMESCALE};

use byteio::{ByteIterator, ReadError, UNKNOWN_SIZE};
use bytes::{Buf, BytesMut};
use common::{DemuxEvent, SamplePosition, Track, TrackId};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

// Upper bound for elements that are buffered whole (Info,
// Tracks, blocks). Clusters themselves are streamed.
const MAX_BUFFERED_ELEMENT_SIZE: u64 = 64 << 20;

const DEFAULT_TIMESTAMP_SCALE_NS: u64 = 1_000_000;

#[derive(Debug, Error)]
pub enum DemuxError {
    #[error("not an ebml document")]
    NotEbml,

    #[error("unsupported doctype '{0}'")]
    UnsupportedDocType(String),

    #[error("element {id:#x} at offset {offset}: {reason}")]
    MalformedElement {
        id: u32,
        offset: u64,
        reason: &'static str,
    },

    #[error("element {id:#x} at offset {offset}: unknown size only allowed on segment and cluster")]
    UnknownSize { id: u32, offset: u64 },

    #[error("element {id:#x} at offset {offset}: size {size} exceeds buffer limit")]
    OversizedElement { id: u32, offset: u64, size: u64 },

    #[error("input ends inside an element at offset {0}")]
    TruncatedInput(u64),

    #[error("no segment element found")]
    MissingSegment,

    #[error("{0}")]
    Block(#[from] BlockError),

    #[error("{0}")]
    Track(#[from] TrackError),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TrackKind {
    Video,
    Audio,
}

#[derive(Clone, Copy)]
enum Resume {
    TopLevel,
    InSegment,
    InCluster,
}

#[derive(Clone, Copy)]
enum State {
    // Expecting the EBML header element.
    EbmlHeader,

    // Expecting the Segment element.
    TopLevel,

    InSegment,
    InCluster,

    // Discarding a skipped element's payload.
    Skip { remaining: u64, next: Resume },
}

// Incremental Matroska/WebM demuxer. Strictly resumable: when
// the buffered bytes end mid-element the machine simply reports
// "no event" and re-parses from the saved offset once more
// bytes arrive.
pub struct Demuxer {
    buf: BytesMut,
    base: u64,
    state: State,
    events: VecDeque<DemuxEvent>,

    timestamp_scale_ns: u64,
    cluster_timestamp: i64,

    kinds: HashMap<u64, TrackKind>,
    default_duration_us: HashMap<u64, u32>,

    // One undecided sample per track, waiting for the next
    // block to derive its duration from the timestamp delta.
    pending: HashMap<u64, SamplePosition>,
    last_duration_us: HashMap<u64, u32>,

    seen_segment: bool,
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
            state: State::EbmlHeader,
            events: VecDeque::new(),
            timestamp_scale_ns: DEFAULT_TIMESTAMP_SCALE_NS,
            cluster_timestamp: 0,
            kinds: HashMap::new(),
            default_duration_us: HashMap::new(),
            pending: HashMap::new(),
            last_duration_us: HashMap::new(),
            seen_segment: false,
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

    // Signals end of input. Samples still waiting for a duration
    // are flushed, so callers must drain `poll` afterwards.
    pub fn finish(&mut self) -> Result<(), DemuxError> {
        if !self.buf.is_empty() {
            return Err(DemuxError::TruncatedInput(self.base));
        }
        if let State::Skip { remaining, .. } = self.state {
            if remaining > 0 {
                return Err(DemuxError::TruncatedInput(self.base));
            }
        }
        if !self.seen_segment {
            return Err(DemuxError::MissingSegment);
        }

        let mut track_numbers: Vec<u64> = self.pending.keys().copied().collect();
        track_numbers.sort_unstable();
        for number in track_numbers {
            let mut position = self.pending.remove(&number).expect("key exists");
            if position.duration == 0 {
                position.duration = self.fallback_duration(number);
            }
            self.emit(number, position);
        }
        Ok(())
    }

    fn consume(&mut self, n: usize) {
        self.buf.advance(n);
        self.base += u64::try_from(n).expect("u64 fit usize");
    }

    fn fallback_duration(&self, track_number: u64) -> u32 {
        self.default_duration_us
            .get(&track_number)
            .or_else(|| self.last_duration_us.get(&track_number))
            .copied()
            .unwrap_or(1)
            .max(1)
    }

    fn emit(&mut self, track_number: u64, position: SamplePosition) {
        self.last_duration_us.insert(track_number, position.duration);
        self.events.push_back(DemuxEvent::Samples {
            track_id: TrackId::new(u32::try_from(track_number).unwrap_or(u32::MAX)),
            positions: vec![position],
        });
    }

    // Queues a sample. Samples without a known duration are held
    // back until the next block of the same track fixes it.
    fn push_sample(&mut self, track_number: u64, position: SamplePosition) {
        if position.duration != 0 {
            if let Some(mut prev) = self.pending.remove(&track_number) {
                if prev.duration == 0 {
                    let delta = position.dts - prev.dts;
                    prev.duration = u32::try_from(delta.max(1)).unwrap_or(1);
                }
                self.emit(track_number, prev);
            }
            self.emit(track_number, position);
            return;
        }
        if let Some(mut prev) = self.pending.insert(track_number, position) {
            if prev.duration == 0 {
                let delta = position.dts - prev.dts;
                prev.duration = if delta > 0 {
                    u32::try_from(delta).unwrap_or(1)
                } else {
                    self.fallback_duration(track_number)
                };
            }
            self.emit(track_number, prev);
        }
    }

    // Returns false when no further progress is possible
    // without more input.
    #[allow(clippy::too_many_lines)]
    fn step(&mut self) -> Result<bool, DemuxError> {
        if let State::Skip { remaining, next } = self.state {
            let available = u64::try_from(self.buf.len()).expect("u64 fit usize");
            let take = remaining.min(available);
            self.consume(usize::try_from(take).expect("usize fit u64"));
            if take < remaining {
                self.state = State::Skip {
                    remaining: remaining - take,
                    next,
                };
                return Ok(false);
            }
            self.state = match next {
                Resume::TopLevel => State::TopLevel,
                Resume::InSegment => State::InSegment,
                Resume::InCluster => State::InCluster,
            };
            return Ok(true);
        }

        let offset = self.base;
        let mut it = ByteIterator::new(&self.buf, self.base);
        let id = match it.read_element_id() {
            Ok(v) => v,
            Err(ReadError::Incomplete) => return Ok(false),
            Err(_) => {
                return Err(DemuxError::MalformedElement {
                    id: 0,
                    offset,
                    reason: "bad element id",
                })
            }
        };
        let size = match it.read_element_size() {
            Ok(v) => v,
            Err(ReadError::Incomplete) => return Ok(false),
            Err(_) => {
                return Err(DemuxError::MalformedElement {
                    id,
                    offset,
                    reason: "bad element size",
                })
            }
        };
        let header_len = usize::try_from(it.pos() - offset).expect("usize fit u64");

        match self.state {
            State::EbmlHeader => {
                if id != element::EBML {
                    return Err(DemuxError::NotEbml);
                }
                let Some(payload) = self.payload_ready(id, offset, header_len, size)? else {
                    return Ok(false);
                };
                check_doc_type(&payload)?;
                self.state = State::TopLevel;
                Ok(true)
            }
            State::TopLevel => {
                if id == element::SEGMENT {
                    self.consume(header_len);
                    self.seen_segment = true;
                    self.state = State::InSegment;
                    return Ok(true);
                }
                self.skip_element(id, offset, header_len, size, Resume::TopLevel)?;
                Ok(true)
            }
            State::InSegment => match id {
                element::INFO => {
                    let Some(payload) = self.payload_ready(id, offset, header_len, size)? else {
                        return Ok(false);
                    };
                    self.handle_info(&payload);
                    Ok(true)
                }
                element::TRACKS => {
                    let Some(payload) = self.payload_ready(id, offset, header_len, size)? else {
                        return Ok(false);
                    };
                    self.handle_tracks(&payload, offset + u64::try_from(header_len).expect("u64"))?;
                    Ok(true)
                }
                element::CLUSTER => {
                    self.consume(header_len);
                    self.cluster_timestamp = 0;
                    self.state = State::InCluster;
                    Ok(true)
                }
                _ => {
                    self.skip_element(id, offset, header_len, size, Resume::InSegment)?;
                    Ok(true)
                }
            },
            State::InCluster => match id {
                element::TIMESTAMP => {
                    let Some(payload) = self.payload_ready(id, offset, header_len, size)? else {
                        return Ok(false);
                    };
                    let mut pit = ByteIterator::new(&payload, 0);
                    let value = pit.read_uint(payload.len()).unwrap_or(0);
                    self.cluster_timestamp = i64::try_from(value).unwrap_or(0);
                    Ok(true)
                }
                element::SIMPLE_BLOCK => {
                    let payload_offset = offset + u64::try_from(header_len).expect("u64");
                    let Some(payload) = self.payload_ready(id, offset, header_len, size)? else {
                        return Ok(false);
                    };
                    self.handle_simple_block(&payload, payload_offset)?;
                    Ok(true)
                }
                element::BLOCK_GROUP => {
                    let payload_offset = offset + u64::try_from(header_len).expect("u64");
                    let Some(payload) = self.payload_ready(id, offset, header_len, size)? else {
                        return Ok(false);
                    };
                    self.handle_block_group(&payload, payload_offset)?;
                    Ok(true)
                }
                element::CLUSTER => {
                    self.consume(header_len);
                    self.cluster_timestamp = 0;
                    Ok(true)
                }
                _ if element::is_segment_level(id) => {
                    // Implicit end of an unknown-size cluster.
                    self.state = State::InSegment;
                    Ok(true)
                }
                _ => {
                    self.skip_element(id, offset, header_len, size, Resume::InCluster)?;
                    Ok(true)
                }
            },
            State::Skip { .. } => unreachable!("handled above"),
        }
    }

    // Waits until the element payload is fully buffered, then
    // consumes it and hands it out.
    fn payload_ready(
        &mut self,
        id: u32,
        offset: u64,
        header_len: usize,
        size: u64,
    ) -> Result<Option<BytesMut>, DemuxError> {
        if size == UNKNOWN_SIZE {
            return Err(DemuxError::UnknownSize { id, offset });
        }
        if size > MAX_BUFFERED_ELEMENT_SIZE {
            return Err(DemuxError::OversizedElement { id, offset, size });
        }
        let size = usize::try_from(size).expect("usize fit u64");
        if self.buf.len() < header_len + size {
            return Ok(None);
        }
        self.consume(header_len);
        let payload = self.buf.split_to(size);
        self.base += u64::try_from(size).expect("u64 fit usize");
        Ok(Some(payload))
    }

    fn skip_element(
        &mut self,
        id: u32,
        offset: u64,
        header_len: usize,
        size: u64,
        next: Resume,
    ) -> Result<(), DemuxError> {
        if size == UNKNOWN_SIZE {
            return Err(DemuxError::UnknownSize { id, offset });
        }
        self.consume(header_len);
        self.state = State::Skip {
            remaining: size,
            next,
        };
        Ok(())
    }

    fn handle_info(&mut self, payload: &[u8]) {
        let mut it = ByteIterator::new(payload, 0);
        while !it.is_empty() {
            let Ok(id) = it.read_element_id() else {
                return;
            };
            let Ok(size) = it.read_element_size() else {
                return;
            };
            let Ok(size) = usize::try_from(size) else {
                return;
            };
            let Ok(data) = it.read_bytes(size) else {
                return;
            };
            if id == element::TIMESTAMP_SCALE {
                let mut dit = ByteIterator::new(data, 0);
                if let Ok(scale) = dit.read_uint(data.len()) {
                    if scale > 0 {
                        self.timestamp_scale_ns = scale;
                    }
                }
            }
        }
    }

    fn handle_tracks(&mut self, payload: &[u8], base: u64) -> Result<(), DemuxError> {
        for entry in track::parse_tracks(payload, base)? {
            match &entry.track {
                Track::Video(_) => {
                    self.kinds.insert(entry.track_number, TrackKind::Video);
                }
                Track::Audio(_) => {
                    self.kinds.insert(entry.track_number, TrackKind::Audio);
                }
                Track::Other(_) => {}
            }
            if let Some(ns) = entry.default_duration_ns {
                let micros = u32::try_from(ns / 1000).unwrap_or(u32::MAX).max(1);
                self.default_duration_us.insert(entry.track_number, micros);
            }
            self.events.push_back(DemuxEvent::Track(entry.track));
        }
        Ok(())
    }

    fn block_timestamp_micros(&self, relative: i16) -> i64 {
        let ticks = self.cluster_timestamp + i64::from(relative);
        let scale = i64::try_from(self.timestamp_scale_ns).unwrap_or(1_000_000);
        ticks.saturating_mul(scale) / 1000
    }

    fn handle_simple_block(&mut self, payload: &[u8], base: u64) -> Result<(), DemuxError> {
        let info = parse_block(payload, base)?;
        let Some(kind) = self.kinds.get(&info.track_number).copied() else {
            // Tracks the pipeline cannot process are dropped.
            return Ok(());
        };
        let keyframe = match kind {
            // Audio frames are all independently decodable.
            TrackKind::Audio => true,
            TrackKind::Video => info.keyframe,
        };
        self.push_block_frames(&info, keyframe, None);
        Ok(())
    }

    fn handle_block_group(&mut self, payload: &[u8], base: u64) -> Result<(), DemuxError> {
        let mut block: Option<BlockInfo> = None;
        let mut has_reference = false;
        let mut duration_ticks: Option<u64> = None;

        let mut it = ByteIterator::new(payload, base);
        while !it.is_empty() {
            let offset = it.pos();
            let Ok(id) = it.read_element_id() else {
                break;
            };
            let Ok(size) = it.read_element_size() else {
                break;
            };
            let Ok(size) = usize::try_from(size) else {
                break;
            };
            let data_offset = it.pos();
            let Ok(data) = it.read_bytes(size) else {
                return Err(DemuxError::MalformedElement {
                    id,
                    offset,
                    reason: "truncated block group child",
                });
            };
            match id {
                element::BLOCK => block = Some(parse_block(data, data_offset)?),
                element::REFERENCE_BLOCK => has_reference = true,
                element::BLOCK_DURATION => {
                    let mut dit = ByteIterator::new(data, 0);
                    duration_ticks = dit.read_uint(data.len()).ok();
                }
                _ => {}
            }
        }

        let Some(info) = block else {
            return Ok(());
        };
        let Some(kind) = self.kinds.get(&info.track_number).copied() else {
            return Ok(());
        };
        // A Block has no keyframe flag. For video the absence of
        // a ReferenceBlock sibling marks an independent frame.
        let keyframe = match kind {
            TrackKind::Audio => true,
            TrackKind::Video => !has_reference,
        };
        let duration_us = duration_ticks.map(|ticks| {
            let scale = self.timestamp_scale_ns.max(1);
            u32::try_from(ticks.saturating_mul(scale) / 1000)
                .unwrap_or(u32::MAX)
                .max(1)
        });
        self.push_block_frames(&info, keyframe, duration_us);
        Ok(())
    }

    fn push_block_frames(&mut self, info: &BlockInfo, keyframe: bool, duration_us: Option<u32>) {
        let timestamp = self.block_timestamp_micros(info.relative_timestamp);
        let default = self.default_duration_us.get(&info.track_number).copied();

        for (i, frame) in info.frames.iter().enumerate() {
            // Laced frames advance by the default duration when
            // one is known.
            let step = i64::from(default.unwrap_or(0));
            let dts = timestamp + i64::try_from(i).expect("i64 fit usize") * step;
            let duration = duration_us.or(default).unwrap_or(0);
            self.push_sample(
                info.track_number,
                SamplePosition {
                    file_offset: frame.file_offset,
                    size: frame.size,
                    dts,
                    cts: dts,
                    duration,
                    is_keyframe: keyframe,
                },
            );
        }
    }
}

fn check_doc_type(payload: &[u8]) -> Result<(), DemuxError> {
    let mut it = ByteIterator::new(payload, 0);
    while !it.is_empty() {
        let Ok(id) = it.read_element_id() else {
            return Ok(());
        };
        let Ok(size) = it.read_element_size() else {
            return Ok(());
        };
        let Ok(size) = usize::try_from(size) else {
            return Ok(());
        };
        if id == element::DOC_TYPE {
            let doc_type = it.read_string(size).unwrap_or_default();
            if doc_type != "webm" && doc_type != "matroska" {
                return Err(DemuxError::UnsupportedDocType(doc_type));
            }
            return Ok(());
        }
        if it.skip(size).is_err() {
            return Ok(());
        }
    }
    Ok(())
}
