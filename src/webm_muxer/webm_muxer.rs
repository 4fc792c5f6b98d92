// SPDX-License-Identifier: GPL-2.0-or-later

#[cfg(test)]
mod test;

use bytes::Bytes;
use common::{AudioCodec, DynOutputWriter, EncodedChunk, VideoCodec};
use matroska::element;
use serde::Deserialize;
use thiserror::Error;

// Cluster policy: a new cluster starts when any of these trips.
const CLUSTER_MAX_SIZE: usize = 5 << 20;
const CLUSTER_MAX_SPAN_MS: i64 = 5000;
const CLUSTER_KEYFRAME_SPAN_MS: i64 = 1000;

const TIMESTAMP_SCALE_NS: u64 = 1_000_000;

#[derive(Debug, Error)]
pub enum WebmMuxerError {
    #[error("codec '{0}' cannot be written to webm")]
    UnsupportedCodec(String),

    #[error("track {0} is not registered")]
    UnknownTrack(u64),

    #[error("tracks cannot be added after the header was written")]
    HeaderWritten,

    #[error("write: {0}")]
    Write(common::DynError),
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct WebmMuxerOptions {
    // Emit a Cues index before finalizing.
    pub write_cues: bool,

    pub muxing_app: String,
    pub writing_app: String,
}

impl Default for WebmMuxerOptions {
    fn default() -> Self {
        Self {
            write_cues: false,
            muxing_app: "recast".to_owned(),
            writing_app: "recast".to_owned(),
        }
    }
}

// Output-side description of one track.
pub enum WebmTrack {
    Video {
        codec: VideoCodec,
        width: u32,
        height: u32,
        codec_private: Option<Bytes>,
    },
    Audio {
        codec: AudioCodec,
        channels: u32,
        sample_rate: u32,
        codec_private: Option<Bytes>,
    },
}

struct RegisteredTrack {
    number: u64,
    track: WebmTrack,

    // Timestamp of the previously written block, for
    // ReferenceBlock deltas.
    prev_ts_ms: Option<i64>,
}

struct PendingBlock {
    track_number: u64,
    ts_ms: i64,
    keyframe: bool,
    is_video: bool,
    reference_delta_ms: Option<i64>,
    data: Bytes,
}

struct PendingCluster {
    start_ms: i64,
    byte_size: usize,
    blocks: Vec<PendingBlock>,
}

struct CueEntry {
    time_ms: i64,
    track_number: u64,
    cluster_position: u64,
}

// Emits an EBML header plus one Segment of unknown size with
// Info, Tracks and Clusters. The Info Duration is written as a
// placeholder and patched on finalize.
pub struct WebmMuxer {
    w: DynOutputWriter,
    options: WebmMuxerOptions,
    tracks: Vec<RegisteredTrack>,

    header_written: bool,
    duration_payload_offset: u64,
    segment_data_start: u64,

    cluster: Option<PendingCluster>,
    cues: Vec<CueEntry>,
    duration_ms: i64,
}

impl WebmMuxer {
    #[must_use]
    pub fn new(w: DynOutputWriter, options: WebmMuxerOptions) -> Self {
        Self {
            w,
            options,
            tracks: Vec::new(),
            header_written: false,
            duration_payload_offset: 0,
            segment_data_start: 0,
            cluster: None,
            cues: Vec::new(),
            duration_ms: 0,
        }
    }

    // Registers a track and returns its track number. Only vp8
    // and vp9 video and opus audio are representable here.
    pub fn add_track(&mut self, track: WebmTrack) -> Result<u64, WebmMuxerError> {
        if self.header_written {
            return Err(WebmMuxerError::HeaderWritten);
        }
        match &track {
            WebmTrack::Video { codec, .. } => {
                if !matches!(codec, VideoCodec::Vp8 | VideoCodec::Vp9) {
                    return Err(WebmMuxerError::UnsupportedCodec(codec.to_string()));
                }
            }
            WebmTrack::Audio { codec, .. } => {
                if *codec != AudioCodec::Opus {
                    return Err(WebmMuxerError::UnsupportedCodec(codec.to_string()));
                }
            }
        }

        let number = u64::try_from(self.tracks.len()).expect("u64 fit len") + 1;
        self.tracks.push(RegisteredTrack {
            number,
            track,
            prev_ts_ms: None,
        });
        Ok(number)
    }

    pub async fn add_sample(
        &mut self,
        track_number: u64,
        chunk: &EncodedChunk,
    ) -> Result<(), WebmMuxerError> {
        if !self.header_written {
            self.write_header().await?;
        }

        let ts_ms = chunk.timestamp.as_millis();
        let (is_video, prev_ts_ms) = {
            let track = self
                .tracks
                .iter_mut()
                .find(|t| t.number == track_number)
                .ok_or(WebmMuxerError::UnknownTrack(track_number))?;
            let is_video = matches!(track.track, WebmTrack::Video { .. });
            let prev = track.prev_ts_ms;
            track.prev_ts_ms = Some(ts_ms);
            (is_video, prev)
        };
        let end_ms = *chunk
            .timestamp
            .checked_add(chunk.duration)
            .unwrap_or(chunk.timestamp)
            / 1000;
        self.duration_ms = self.duration_ms.max(end_ms);

        let needs_new_cluster = match &self.cluster {
            None => true,
            Some(cluster) => {
                cluster.byte_size >= CLUSTER_MAX_SIZE
                    || ts_ms - cluster.start_ms >= CLUSTER_MAX_SPAN_MS
                    || (chunk.is_keyframe
                        && is_video
                        && ts_ms - cluster.start_ms >= CLUSTER_KEYFRAME_SPAN_MS)
            }
        };
        if needs_new_cluster {
            self.flush_cluster().await?;
            self.cluster = Some(PendingCluster {
                start_ms: ts_ms,
                byte_size: 0,
                blocks: Vec::new(),
            });
        }

        let cluster = self.cluster.as_mut().expect("cluster exists");
        cluster.byte_size += chunk.data.len() + 16;
        cluster.blocks.push(PendingBlock {
            track_number,
            ts_ms,
            keyframe: chunk.is_keyframe,
            is_video,
            reference_delta_ms: (!chunk.is_keyframe)
                .then_some(prev_ts_ms)
                .flatten()
                .map(|prev| prev - ts_ms),
            data: chunk.data.clone(),
        });
        Ok(())
    }

    // Flushes the open cluster, writes the optional Cues and
    // patches the segment duration.
    pub async fn finalize(&mut self) -> Result<(), WebmMuxerError> {
        if !self.header_written {
            self.write_header().await?;
        }
        self.flush_cluster().await?;

        if self.options.write_cues && !self.cues.is_empty() {
            let mut cues = Vec::new();
            for cue in &self.cues {
                let mut point = Vec::new();
                uint_element(&mut point, element::CUE_TIME, to_u64(cue.time_ms));
                let mut positions = Vec::new();
                uint_element(&mut positions, element::CUE_TRACK, cue.track_number);
                uint_element(
                    &mut positions,
                    element::CUE_CLUSTER_POSITION,
                    cue.cluster_position,
                );
                write_element(&mut point, element::CUE_TRACK_POSITIONS, &positions);
                write_element(&mut cues, element::CUE_POINT, &point);
            }
            let mut out = Vec::new();
            write_element(&mut out, element::CUES, &cues);
            self.write(out).await?;
        }

        // Duration is an 8-byte float in timestamp-scale units.
        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let duration = self.duration_ms as f64;
        self.w
            .update_data_at(self.duration_payload_offset, &duration.to_be_bytes())
            .await
            .map_err(WebmMuxerError::Write)?;

        self.w.finish().await.map_err(WebmMuxerError::Write)
    }

    async fn write(&mut self, buf: Vec<u8>) -> Result<(), WebmMuxerError> {
        self.w
            .write(Bytes::from(buf))
            .await
            .map_err(WebmMuxerError::Write)
    }

    async fn write_header(&mut self) -> Result<(), WebmMuxerError> {
        /*
           EBML header
           Segment (unknown size)
           - Info
             - TimestampScale
             - MuxingApp
             - WritingApp
             - Duration (patched)
           - Tracks
             - TrackEntry * N
        */
        let mut out = Vec::new();

        let mut header = Vec::new();
        uint_element(&mut header, element::EBML_VERSION, 1);
        uint_element(&mut header, element::EBML_READ_VERSION, 1);
        uint_element(&mut header, element::EBML_MAX_ID_LENGTH, 4);
        uint_element(&mut header, element::EBML_MAX_SIZE_LENGTH, 8);
        string_element(&mut header, element::DOC_TYPE, "webm");
        uint_element(&mut header, element::DOC_TYPE_VERSION, 2);
        uint_element(&mut header, element::DOC_TYPE_READ_VERSION, 2);
        write_element(&mut out, element::EBML, &header);

        // Segment with unknown size, so nothing needs patching
        // when clusters are appended.
        byteio::write_element_id(&mut out, element::SEGMENT);
        byteio::write_vint_with_width(&mut out, (1 << 56) - 1, 8);

        self.segment_data_start =
            self.w.written_byte_count() + u64::try_from(out.len()).expect("u64 fit usize");

        let mut info = Vec::new();
        uint_element(&mut info, element::TIMESTAMP_SCALE, TIMESTAMP_SCALE_NS);
        string_element(&mut info, element::MUXING_APP, &self.options.muxing_app);
        string_element(&mut info, element::WRITING_APP, &self.options.writing_app);
        // Duration placeholder, rewritten on finalize.
        let duration_in_info = info.len() + 3;
        float_element(&mut info, element::DURATION, 0.0);
        let info_header_len = 4 + byteio::vint_len(u64::try_from(info.len()).expect("u64"));
        self.duration_payload_offset = self.w.written_byte_count()
            + u64::try_from(out.len() + info_header_len + duration_in_info).expect("u64");
        write_element(&mut out, element::INFO, &info);

        let mut tracks = Vec::new();
        for track in &self.tracks {
            write_track_entry(&mut tracks, track);
        }
        write_element(&mut out, element::TRACKS, &tracks);

        self.header_written = true;
        self.write(out).await
    }

    async fn flush_cluster(&mut self) -> Result<(), WebmMuxerError> {
        let Some(mut cluster) = self.cluster.take() else {
            return Ok(());
        };

        // Blocks within a cluster must be in timestamp order.
        cluster.blocks.sort_by_key(|b| b.ts_ms);

        let cluster_position = self.w.written_byte_count() - self.segment_data_start;

        let mut payload = Vec::new();
        uint_element(&mut payload, element::TIMESTAMP, to_u64(cluster.start_ms));

        let mut cue_track = None;
        for block in &cluster.blocks {
            let relative =
                i16::try_from(block.ts_ms - cluster.start_ms).unwrap_or(i16::MAX);
            if block.is_video && cue_track.is_none() {
                cue_track = Some(block.track_number);
            }

            if block.is_video && !block.keyframe {
                // Delta frames go into a BlockGroup with a
                // ReferenceBlock naming their dependency.
                let mut group = Vec::new();
                let raw = block_bytes(block.track_number, relative, 0, &block.data);
                write_element(&mut group, element::BLOCK, &raw);
                let reference = block.reference_delta_ms.unwrap_or(-1);
                int_element(&mut group, element::REFERENCE_BLOCK, reference);
                write_element(&mut payload, element::BLOCK_GROUP, &group);
            } else {
                let flags = if block.keyframe { 0x80 } else { 0 };
                let raw = block_bytes(block.track_number, relative, flags, &block.data);
                write_element(&mut payload, element::SIMPLE_BLOCK, &raw);
            }
        }

        if let Some(track_number) = cue_track {
            self.cues.push(CueEntry {
                time_ms: cluster.start_ms,
                track_number,
                cluster_position,
            });
        }

        let mut out = Vec::new();
        write_element(&mut out, element::CLUSTER, &payload);
        self.write(out).await
    }
}

fn write_track_entry(out: &mut Vec<u8>, track: &RegisteredTrack) {
    let mut entry = Vec::new();
    uint_element(&mut entry, element::TRACK_NUMBER, track.number);
    uint_element(&mut entry, element::TRACK_UID, track.number);

    match &track.track {
        WebmTrack::Video {
            codec,
            width,
            height,
            codec_private,
        } => {
            uint_element(&mut entry, element::TRACK_TYPE, 1);
            uint_element(&mut entry, element::FLAG_LACING, 0);
            let codec_id = match codec {
                VideoCodec::Vp9 => "V_VP9",
                _ => "V_VP8",
            };
            string_element(&mut entry, element::CODEC_ID, codec_id);
            if let Some(private) = codec_private {
                write_element(&mut entry, element::CODEC_PRIVATE, private);
            }
            let mut video = Vec::new();
            uint_element(&mut video, element::PIXEL_WIDTH, u64::from(*width));
            uint_element(&mut video, element::PIXEL_HEIGHT, u64::from(*height));
            write_element(&mut entry, element::VIDEO, &video);
        }
        WebmTrack::Audio {
            channels,
            sample_rate,
            codec_private,
            ..
        } => {
            uint_element(&mut entry, element::TRACK_TYPE, 2);
            uint_element(&mut entry, element::FLAG_LACING, 0);
            string_element(&mut entry, element::CODEC_ID, "A_OPUS");
            if let Some(private) = codec_private {
                write_element(&mut entry, element::CODEC_PRIVATE, private);
            }
            let mut audio = Vec::new();
            float_element(
                &mut audio,
                element::SAMPLING_FREQUENCY,
                f64::from(*sample_rate),
            );
            uint_element(&mut audio, element::CHANNELS, u64::from(*channels));
            write_element(&mut entry, element::AUDIO, &audio);
        }
    }

    write_element(out, element::TRACK_ENTRY, &entry);
}

fn block_bytes(track_number: u64, relative_ts: i16, flags: u8, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    byteio::write_vint(&mut out, track_number);
    out.extend_from_slice(&relative_ts.to_be_bytes());
    out.push(flags);
    out.extend_from_slice(data);
    out
}

fn write_element(out: &mut Vec<u8>, id: u32, payload: &[u8]) {
    byteio::write_element_id(out, id);
    byteio::write_vint(out, u64::try_from(payload.len()).expect("u64 fit usize"));
    out.extend_from_slice(payload);
}

fn uint_element(out: &mut Vec<u8>, id: u32, value: u64) {
    let bytes = value.to_be_bytes();
    let skip = usize::try_from(value.leading_zeros() / 8)
        .expect("small")
        .min(7);
    write_element(out, id, &bytes[skip..]);
}

// Minimal two's complement big-endian encoding.
fn int_element(out: &mut Vec<u8>, id: u32, value: i64) {
    let mut len = 1;
    while len < 8 {
        let sign = value >> (8 * len - 1);
        if sign == 0 || sign == -1 {
            break;
        }
        len += 1;
    }
    let bytes = value.to_be_bytes();
    write_element(out, id, &bytes[8 - len..]);
}

fn float_element(out: &mut Vec<u8>, id: u32, value: f64) {
    write_element(out, id, &value.to_be_bytes());
}

fn string_element(out: &mut Vec<u8>, id: u32, value: &str) {
    write_element(out, id, value.as_bytes());
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value.max(0)).expect("non-negative")
}
