// SPDX-License-Identifier: GPL-2.0-or-later

#[cfg(test)]
mod test;

use bytes::Bytes;
use common::{AudioCodec, DynOutputWriter, EncodedChunk, VideoCodec};
use mp4::{FullBox, ImmutableBox, Mp4Error};
use serde::Deserialize;
use std::{
    num::TryFromIntError,
    sync::{Arc, Mutex},
};
use thiserror::Error;

// Sample timestamps stay in microseconds, the movie header uses
// milliseconds.
const TRACK_TIMESCALE: u32 = 1_000_000;
const MOVIE_TIMESCALE: u32 = 1000;

const IDENTITY_MATRIX: [i32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

#[derive(Debug, Error)]
pub enum Mp4MuxerError {
    #[error("codec '{0}' cannot be written to mp4")]
    UnsupportedCodec(String),

    #[error("track {0} is not registered")]
    UnknownTrack(u32),

    #[error("tracks cannot be added after the first sample")]
    AlreadyStarted,

    #[error("duration: {0} {1}")]
    Duration(i64, TryFromIntError),

    #[error("cts: {0} {1}")]
    Cts(i64, TryFromIntError),

    #[error("chunk offset: {0} {1}")]
    ChunkOffset(u64, TryFromIntError),

    #[error("mdat size: {0} {1}")]
    MdatSize(u64, TryFromIntError),

    #[error("mp4: {0}")]
    Mp4(#[from] Mp4Error),

    #[error("write: {0}")]
    Write(common::DynError),
}

// Whether moov precedes or follows the mdat. Front buffers all
// sample data until finalize and needs no patching; back streams
// sample data as it arrives and patches the mdat size.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoovPlacement {
    #[default]
    Front,
    Back,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Mp4MuxerOptions {
    pub moov_placement: MoovPlacement,
}

enum TrackParams {
    Video {
        width: u16,
        height: u16,

        // AVCC record.
        config: Bytes,
    },
    Audio {
        channels: u16,
        sample_rate: u32,

        // AudioSpecificConfig.
        config: Bytes,
    },
}

struct MuxTrack {
    id: u32,
    params: TrackParams,

    stts: Vec<mp4::SttsEntry>,
    ctts: Vec<mp4::CttsEntryV1>,
    stss: Vec<u32>,
    stsz: Vec<u32>,
    chunk_offsets: Arc<Mutex<Vec<u32>>>,

    // Buffered sample data, front placement only.
    data: Vec<u8>,

    // Synthesized decode time; chunks arrive in decode order and
    // carry presentation timestamps.
    next_dts: Option<i64>,
    end_time: i64,
}

impl MuxTrack {
    fn sample_count(&self) -> u32 {
        u32::try_from(self.stsz.len()).expect("u32 fit len")
    }
}

pub struct Mp4Muxer {
    w: DynOutputWriter,
    options: Mp4MuxerOptions,
    tracks: Vec<MuxTrack>,
    started: bool,

    // Back placement bookkeeping.
    mdat_header_offset: u64,
    mdat_data_size: u64,
}

impl Mp4Muxer {
    #[must_use]
    pub fn new(w: DynOutputWriter, options: Mp4MuxerOptions) -> Self {
        Self {
            w,
            options,
            tracks: Vec::new(),
            started: false,
            mdat_header_offset: 0,
            mdat_data_size: 0,
        }
    }

    // Registers a video track. Only h264 is writable.
    pub fn add_video_track(
        &mut self,
        codec: VideoCodec,
        width: u32,
        height: u32,
        config: Bytes,
    ) -> Result<u32, Mp4MuxerError> {
        if self.started {
            return Err(Mp4MuxerError::AlreadyStarted);
        }
        if codec != VideoCodec::H264 {
            return Err(Mp4MuxerError::UnsupportedCodec(codec.to_string()));
        }
        Ok(self.push_track(TrackParams::Video {
            width: u16::try_from(width).unwrap_or(u16::MAX),
            height: u16::try_from(height).unwrap_or(u16::MAX),
            config,
        }))
    }

    // Registers an audio track. Only aac is writable.
    pub fn add_audio_track(
        &mut self,
        codec: AudioCodec,
        channels: u32,
        sample_rate: u32,
        config: Bytes,
    ) -> Result<u32, Mp4MuxerError> {
        if self.started {
            return Err(Mp4MuxerError::AlreadyStarted);
        }
        if codec != AudioCodec::Aac {
            return Err(Mp4MuxerError::UnsupportedCodec(codec.to_string()));
        }
        Ok(self.push_track(TrackParams::Audio {
            channels: u16::try_from(channels).unwrap_or(2),
            sample_rate,
            config,
        }))
    }

    fn push_track(&mut self, params: TrackParams) -> u32 {
        let id = u32::try_from(self.tracks.len()).expect("u32 fit len") + 1;
        self.tracks.push(MuxTrack {
            id,
            params,
            stts: Vec::new(),
            ctts: Vec::new(),
            stss: Vec::new(),
            stsz: Vec::new(),
            chunk_offsets: Arc::new(Mutex::new(Vec::new())),
            data: Vec::new(),
            next_dts: None,
            end_time: 0,
        });
        id
    }

    pub async fn add_sample(
        &mut self,
        track_id: u32,
        chunk: &EncodedChunk,
    ) -> Result<(), Mp4MuxerError> {
        use Mp4MuxerError::*;

        if !self.started && self.options.moov_placement == MoovPlacement::Back {
            self.write_leading_boxes().await?;
        }
        self.started = true;

        let back = self.options.moov_placement == MoovPlacement::Back;
        let write_offset = self.w.written_byte_count();

        let track = self
            .tracks
            .iter_mut()
            .find(|t| t.id == track_id)
            .ok_or(UnknownTrack(track_id))?;

        let pts = *chunk.timestamp;
        let delta = chunk.duration.as_u32().map_err(|e| Duration(*chunk.duration, e))?;
        match track.stts.last_mut() {
            Some(last) if last.sample_delta == delta => {
                last.sample_count += 1;
            }
            _ => track.stts.push(mp4::SttsEntry {
                sample_count: 1,
                sample_delta: delta,
            }),
        }

        // The first presentation timestamp anchors the synthetic
        // decode timeline.
        let dts = track.next_dts.unwrap_or(pts);
        track.next_dts = Some(dts + i64::from(delta));

        let cts = pts - dts;
        let cts = i32::try_from(cts).map_err(|e| Cts(cts, e))?;
        match track.ctts.last_mut() {
            Some(last) if last.sample_offset == cts => {
                last.sample_count += 1;
            }
            _ => track.ctts.push(mp4::CttsEntryV1 {
                sample_count: 1,
                sample_offset: cts,
            }),
        }

        track
            .stsz
            .push(u32::try_from(chunk.data.len()).expect("u32 fit chunk"));
        if chunk.is_keyframe {
            track.stss.push(track.sample_count());
        }
        track.end_time = track.end_time.max(pts + i64::from(delta));

        if back {
            // Every sample is its own chunk when streaming.
            track
                .chunk_offsets
                .lock()
                .expect("not poisoned")
                .push(u32::try_from(write_offset).map_err(|e| ChunkOffset(write_offset, e))?);
            self.mdat_data_size += u64::try_from(chunk.data.len()).expect("u64 fit len");
            self.w
                .write(chunk.data.clone())
                .await
                .map_err(Mp4MuxerError::Write)?;
        } else {
            track.data.extend_from_slice(&chunk.data);
        }
        Ok(())
    }

    pub async fn finalize(mut self) -> Result<(), Mp4MuxerError> {
        match self.options.moov_placement {
            MoovPlacement::Front => self.finalize_front().await?,
            MoovPlacement::Back => self.finalize_back().await?,
        }
        self.w.finish().await.map_err(Mp4MuxerError::Write)
    }

    /*
       ftyp
       moov
       - mvhd
       - trak * N
       mdat
    */
    async fn finalize_front(&mut self) -> Result<(), Mp4MuxerError> {
        use Mp4MuxerError::*;

        // One chunk per track inside the mdat. The offsets are
        // placeholders until the moov size is known, the stco box
        // reads them through the shared handle at marshal time.
        for track in &self.tracks {
            if !track.stsz.is_empty() {
                *track.chunk_offsets.lock().expect("not poisoned") = vec![0];
            }
        }

        let ftyp = ftyp();
        let moov = self.generate_moov()?;

        const MDAT_HEADER_SIZE: u64 = 8;
        let mdat_offset = u64::try_from(ftyp.size() + 8 + moov.size()).expect("u64 fit usize")
            + MDAT_HEADER_SIZE;

        let mut offset = mdat_offset;
        for track in &self.tracks {
            if track.stsz.is_empty() {
                continue;
            }
            track.chunk_offsets.lock().expect("not poisoned")[0] =
                u32::try_from(offset).map_err(|e| ChunkOffset(offset, e))?;
            offset += u64::try_from(track.data.len()).expect("u64 fit len");
        }

        let data_size: u64 = self
            .tracks
            .iter()
            .map(|t| u64::try_from(t.data.len()).expect("u64 fit len"))
            .sum();
        let mdat_size = data_size + MDAT_HEADER_SIZE;

        let mut out = Vec::new();
        mp4::write_single_box(&mut out, &ftyp)?;
        moov.marshal(&mut out)?;
        mp4::write_box_info(
            &mut out,
            usize::try_from(mdat_size).map_err(|e| MdatSize(mdat_size, e))?,
            *b"mdat",
        )?;
        for track in &self.tracks {
            out.extend_from_slice(&track.data);
        }

        self.w
            .write(Bytes::from(out))
            .await
            .map_err(Mp4MuxerError::Write)
    }

    /*
       ftyp
       mdat (size patched)
       moov
    */
    async fn finalize_back(&mut self) -> Result<(), Mp4MuxerError> {
        use Mp4MuxerError::*;

        if !self.started {
            self.write_leading_boxes().await?;
        }

        // Patch the mdat size now that all samples were streamed.
        let mdat_size = self.mdat_data_size + 8;
        let size = u32::try_from(mdat_size).map_err(|e| MdatSize(mdat_size, e))?;
        self.w
            .update_data_at(self.mdat_header_offset, &size.to_be_bytes())
            .await
            .map_err(Mp4MuxerError::Write)?;

        let moov = self.generate_moov()?;
        let mut out = Vec::new();
        moov.marshal(&mut out)?;
        self.w
            .write(Bytes::from(out))
            .await
            .map_err(Mp4MuxerError::Write)
    }

    async fn write_leading_boxes(&mut self) -> Result<(), Mp4MuxerError> {
        let mut out = Vec::new();
        mp4::write_single_box(&mut out, &ftyp())?;
        self.mdat_header_offset =
            self.w.written_byte_count() + u64::try_from(out.len()).expect("u64 fit usize");
        // Size is patched on finalize.
        mp4::write_box_info(&mut out, 8, *b"mdat")?;
        self.started = true;
        self.w
            .write(Bytes::from(out))
            .await
            .map_err(Mp4MuxerError::Write)
    }

    fn movie_duration_millis(&self) -> i64 {
        self.tracks.iter().map(|t| t.end_time).max().unwrap_or(0) / 1000
    }

    fn generate_moov(&self) -> Result<mp4::Boxes, Mp4MuxerError> {
        use Mp4MuxerError::*;

        let duration_millis = self.movie_duration_millis();
        let duration = u32::try_from(duration_millis).map_err(|e| Duration(duration_millis, e))?;

        let mut moov = mp4::Boxes::new(mp4::Moov).with_child(
            // Mvhd.
            mp4::Boxes::new(mp4::Mvhd {
                timescale: MOVIE_TIMESCALE,
                version: mp4::MvhdVersion::V0(mp4::MvhdV0 {
                    duration,
                    ..Default::default()
                }),
                rate: 65536,
                volume: 256,
                matrix: IDENTITY_MATRIX,
                next_track_id: u32::try_from(self.tracks.len()).expect("u32 fit len") + 1,
                ..Default::default()
            }),
        );
        for track in &self.tracks {
            moov = moov.with_child(generate_trak(track, duration)?);
        }
        Ok(moov)
    }
}

fn ftyp() -> mp4::Ftyp {
    mp4::Ftyp {
        major_brand: *b"isom",
        minor_version: 512,
        compatible_brands: vec![
            mp4::CompatibleBrandElem(*b"isom"),
            mp4::CompatibleBrandElem(*b"iso2"),
            mp4::CompatibleBrandElem(*b"avc1"),
            mp4::CompatibleBrandElem(*b"mp41"),
        ],
    }
}

/*
   trak
   - tkhd
   - edts
     - elst
   - mdia
     - mdhd
     - hdlr
     - minf
*/
fn generate_trak(track: &MuxTrack, movie_duration: u32) -> Result<mp4::Boxes, Mp4MuxerError> {
    use Mp4MuxerError::*;

    let is_video = matches!(track.params, TrackParams::Video { .. });
    let (width, height) = match &track.params {
        TrackParams::Video { width, height, .. } => (u32::from(*width), u32::from(*height)),
        TrackParams::Audio { .. } => (0, 0),
    };

    // Media duration is in track timescale and may exceed the
    // 32-bit header.
    let media_duration = track.end_time.max(0);
    let mdhd_version = match u32::try_from(media_duration) {
        Ok(v) => mp4::MdhdVersion::V0(mp4::MdhdV0 {
            duration: v,
            ..Default::default()
        }),
        Err(_) => mp4::MdhdVersion::V1(mp4::MdhdV1 {
            creation_time: 0,
            modification_time: 0,
            duration: u64::try_from(media_duration).map_err(|e| Duration(media_duration, e))?,
        }),
    };

    let trak = mp4::Boxes::new(mp4::Trak).with_children(vec![
        // Tkhd.
        mp4::Boxes::new(mp4::Tkhd {
            flags: [0, 0, 3],
            track_id: track.id,
            version: mp4::TkhdVersion::V0(mp4::TkhdV0 {
                duration: movie_duration,
                ..Default::default()
            }),
            volume: if is_video { 0 } else { 0x0100 },
            matrix: IDENTITY_MATRIX,
            width: width << 16,
            height: height << 16,
            ..Default::default()
        }),
        // Edts.
        mp4::Boxes::new(mp4::Edts).with_child(mp4::Boxes::new(mp4::Elst {
            flags: [0, 0, 0],
            entries: vec![mp4::ElstEntry {
                segment_duration: movie_duration,
                ..Default::default()
            }],
        })),
        // Mdia.
        mp4::Boxes::new(mp4::Mdia).with_children(vec![
            mp4::Boxes::new(mp4::Mdhd {
                timescale: TRACK_TIMESCALE,
                language: *b"und",
                version: mdhd_version,
                ..Default::default()
            }),
            mp4::Boxes::new(mp4::Hdlr {
                handler_type: if is_video { *b"vide" } else { *b"soun" },
                name: if is_video {
                    "VideoHandler".to_owned()
                } else {
                    "SoundHandler".to_owned()
                },
                ..Default::default()
            }),
            generate_minf(track)?,
        ]),
    ]);
    Ok(trak)
}

/*
   minf
   - vmhd | smhd
   - dinf
     - dref
       - url
   - stbl
*/
fn generate_minf(track: &MuxTrack) -> Result<mp4::Boxes, Mp4MuxerError> {
    let header = match &track.params {
        TrackParams::Video { .. } => mp4::Boxes::new(mp4::Vmhd {
            full_box: FullBox {
                version: 0,
                flags: [0, 0, 1],
            },
            ..Default::default()
        }),
        TrackParams::Audio { .. } => mp4::Boxes::new(mp4::Smhd::default()),
    };

    let minf = mp4::Boxes::new(mp4::Minf).with_children(vec![
        header,
        // Dinf.
        mp4::Boxes::new(mp4::Dinf).with_child(
            mp4::Boxes::new(mp4::Dref {
                full_box: FullBox::default(),
                entry_count: 1,
            })
            .with_child(mp4::Boxes::new(mp4::Url {
                full_box: FullBox {
                    version: 0,
                    flags: [0, 0, 1],
                },
                location: String::new(),
            })),
        ),
        generate_stbl(track)?,
    ]);
    Ok(minf)
}

/*
   stbl
   - stsd
   - stts
   - stss (video)
   - ctts
   - stsc
   - stsz
   - stco
*/
fn generate_stbl(track: &MuxTrack) -> Result<mp4::Boxes, Mp4MuxerError> {
    let mut children = vec![
        generate_stsd(track),
        mp4::Boxes::new(mp4::Stts {
            full_box: FullBox::default(),
            entries: track.stts.clone(),
        }),
    ];
    if matches!(track.params, TrackParams::Video { .. }) {
        children.push(mp4::Boxes::new(mp4::Stss {
            full_box: FullBox::default(),
            sample_numbers: track.stss.clone(),
        }));
    }
    children.extend([
        mp4::Boxes::new(mp4::Ctts {
            flags: [0, 0, 0],
            entries: mp4::CttsEntries::V1(track.ctts.clone()),
        }),
        mp4::Boxes::new(mp4::Stsc {
            full_box: FullBox::default(),
            entries: stsc_entries(track),
        }),
        mp4::Boxes::new(mp4::Stsz {
            full_box: FullBox::default(),
            sample_size: 0,
            sample_count: track.sample_count(),
            entry_sizes: track.stsz.clone(),
        }),
        mp4::Boxes::new(SharedStco {
            full_box: FullBox::default(),
            chunk_offsets: track.chunk_offsets.clone(),
        }),
    ]);
    Ok(mp4::Boxes::new(mp4::Stbl).with_children(children))
}

fn stsc_entries(track: &MuxTrack) -> Vec<mp4::StscEntry> {
    if track.stsz.is_empty() {
        return Vec::new();
    }
    let chunk_count = track.chunk_offsets.lock().expect("not poisoned").len();
    let samples_per_chunk = if chunk_count > 1 {
        // Streaming layout, one sample per chunk.
        1
    } else {
        track.sample_count()
    };
    vec![mp4::StscEntry {
        first_chunk: 1,
        samples_per_chunk,
        sample_description_index: 1,
    }]
}

fn generate_stsd(track: &MuxTrack) -> mp4::Boxes {
    let entry = match &track.params {
        TrackParams::Video {
            width,
            height,
            config,
        } => {
            /*
               - avc1
                 - avcC
                 - btrt
                 - pasp
            */
            mp4::Boxes::new(mp4::Avc1 {
                sample_entry: mp4::SampleEntry {
                    data_reference_index: 1,
                    ..Default::default()
                },
                width: *width,
                height: *height,
                horiz_resolution: 4_718_592,
                vert_resolution: 4_718_592,
                frame_count: 1,
                depth: 24,
                pre_defined3: -1,
                ..Default::default()
            })
            .with_children(vec![
                mp4::Boxes::new(mp4::RawBox {
                    typ: mp4::TYPE_AVCC,
                    data: config.to_vec(),
                }),
                mp4::Boxes::new(mp4::Btrt {
                    buffer_size_db: 0,
                    max_bitrate: 1_000_000,
                    avg_bitrate: 1_000_000,
                }),
                mp4::Boxes::new(mp4::Pasp {
                    h_spacing: 1,
                    v_spacing: 1,
                }),
            ])
        }
        TrackParams::Audio {
            channels,
            sample_rate,
            config,
        } => {
            /*
               - mp4a
                 - esds
                 - btrt
            */
            mp4::Boxes::new(mp4::Mp4a {
                sample_entry: mp4::SampleEntry {
                    data_reference_index: 1,
                    ..Default::default()
                },
                channel_count: *channels,
                sample_size: 16,
                // Rates above 16 bits are stored modulo 65536.
                sample_rate: (sample_rate & 0xFFFF) << 16,
                ..Default::default()
            })
            .with_children(vec![
                mp4::Boxes::new(mp4::Esds {
                    es_id: u16::try_from(track.id).unwrap_or(0),
                    object_type_indication: 0x40,
                    max_bitrate: 128_000,
                    avg_bitrate: 128_000,
                    decoder_specific_info: config.to_vec(),
                }),
                mp4::Boxes::new(mp4::Btrt {
                    buffer_size_db: 0,
                    max_bitrate: 128_000,
                    avg_bitrate: 128_000,
                }),
            ])
        }
    };

    mp4::Boxes::new(mp4::Stsd {
        full_box: FullBox::default(),
        entry_count: 1,
    })
    .with_child(entry)
}

// Chunk offsets live behind a shared handle so they can be
// filled in after the moov size is known.
struct SharedStco {
    full_box: FullBox,
    chunk_offsets: Arc<Mutex<Vec<u32>>>,
}

impl ImmutableBox for SharedStco {
    fn box_type(&self) -> mp4::BoxType {
        mp4::TYPE_STCO
    }

    fn size(&self) -> usize {
        8 + self.chunk_offsets.lock().expect("not poisoned").len() * 4
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        let chunk_offsets = self.chunk_offsets.lock().expect("not poisoned").clone();
        w.write_all(
            &u32::try_from(chunk_offsets.len())
                .map_err(|e| Mp4Error::FromInt("stco".to_owned(), e))?
                .to_be_bytes(),
        )?;
        for offset in chunk_offsets {
            w.write_all(&offset.to_be_bytes())?;
        }
        Ok(())
    }
}

impl From<SharedStco> for Box<dyn ImmutableBox> {
    fn from(value: SharedStco) -> Self {
        Box::new(value)
    }
}
