use crate::{MoovPlacement, Mp4Muxer, Mp4MuxerError, Mp4MuxerOptions};
use bytes::Bytes;
use common::{
    time::{DurationMicros, Micros},
    AudioCodec, DemuxEvent, SamplePosition, SharedMemoryWriter, Track, TrackId, VideoCodec,
};
use pretty_assertions::assert_eq;

const AVCC: [u8; 38] = [
    1, 0x64, 0, 0x16, 3, 1, 0, 0x1b, //
    0x67, 0x64, 0, 0x16, 0xac, 0xd9, 0x40, 0xa4, 0x3b, 0xe4, //
    0x88, 0xc0, 0x44, 0, 0, 3, 0, 4, 0, 0, //
    3, 0, 0x60, 0x3c, 0x58, 0xb6, 0x58, 1, 0, 0,
];

const ASC: [u8; 2] = [0x12, 0x10];

fn chunk(track: u32, ts: i64, dur: i64, key: bool, data: &'static [u8]) -> common::EncodedChunk {
    common::EncodedChunk {
        track_id: TrackId::new(track),
        data: Bytes::from_static(data),
        timestamp: Micros::new(ts),
        duration: DurationMicros::new(dur),
        is_keyframe: key,
    }
}

struct Parsed {
    tracks: Vec<Track>,
    samples: Vec<(TrackId, SamplePosition)>,
}

fn reparse(data: &[u8]) -> Parsed {
    let mut demuxer = isobmff::Demuxer::new();
    demuxer.feed(data);
    let mut parsed = Parsed {
        tracks: Vec::new(),
        samples: Vec::new(),
    };
    while let Some(event) = demuxer.poll().expect("poll") {
        match event {
            DemuxEvent::Track(track) => parsed.tracks.push(track),
            DemuxEvent::Samples {
                track_id,
                positions,
            } => {
                for position in positions {
                    parsed.samples.push((track_id, position));
                }
            }
        }
    }
    demuxer.finish().expect("finish");
    parsed
}

async fn mux(placement: MoovPlacement) -> Bytes {
    let writer = SharedMemoryWriter::new();
    let mut muxer = Mp4Muxer::new(
        Box::new(writer.clone()),
        Mp4MuxerOptions {
            moov_placement: placement,
        },
    );

    let video = muxer
        .add_video_track(VideoCodec::H264, 640, 360, Bytes::from_static(&AVCC))
        .expect("video track");
    let audio = muxer
        .add_audio_track(AudioCodec::Aac, 2, 48000, Bytes::from_static(&ASC))
        .expect("audio track");

    // Decode order with a B-frame: presentation timestamps are
    // 0, 99, 33, 66 while decode times run 0, 33, 66, 99.
    muxer.add_sample(video, &chunk(1, 0, 33_000, true, b"frame-i")).await.expect("sample");
    muxer.add_sample(video, &chunk(1, 99_000, 33_000, false, b"frame-p")).await.expect("sample");
    muxer.add_sample(video, &chunk(1, 33_000, 33_000, false, b"frame-b1")).await.expect("sample");
    muxer.add_sample(video, &chunk(1, 66_000, 33_000, false, b"frame-b2")).await.expect("sample");

    muxer.add_sample(audio, &chunk(2, 0, 21_333, true, b"aac-0")).await.expect("sample");
    muxer.add_sample(audio, &chunk(2, 21_333, 21_333, true, b"aac-1")).await.expect("sample");

    muxer.finalize().await.expect("finalize");
    writer.bytes()
}

fn assert_expected_layout(data: &[u8]) {
    let parsed = reparse(data);

    assert_eq!(2, parsed.tracks.len());
    let Track::Video(video) = &parsed.tracks[0] else {
        panic!("expected video track");
    };
    assert_eq!(TrackId::new(1), video.id);
    assert_eq!(VideoCodec::H264, video.codec);
    assert_eq!("avc1.640016", video.codec_string);
    assert_eq!(640, video.coded_width);
    assert_eq!(360, video.coded_height);
    assert_eq!(1_000_000, video.timescale);
    assert_eq!(Some(AVCC.as_slice()), video.codec_private.as_deref());

    let Track::Audio(audio) = &parsed.tracks[1] else {
        panic!("expected audio track");
    };
    assert_eq!(TrackId::new(2), audio.id);
    assert_eq!(AudioCodec::Aac, audio.codec);
    assert_eq!("mp4a.40.2", audio.codec_string);
    assert_eq!(2, audio.number_of_channels);
    assert_eq!(48000, audio.sample_rate);
    assert_eq!(Some(ASC.as_slice()), audio.codec_private.as_deref());

    let video_samples: Vec<&SamplePosition> = parsed
        .samples
        .iter()
        .filter(|(id, _)| *id == TrackId::new(1))
        .map(|(_, p)| p)
        .collect();
    assert_eq!(4, video_samples.len());

    // Decode timestamps are synthesized from durations,
    // composition timestamps restore the original order.
    assert_eq!(
        vec![0, 33_000, 66_000, 99_000],
        video_samples.iter().map(|s| s.dts).collect::<Vec<i64>>(),
    );
    assert_eq!(
        vec![0, 99_000, 33_000, 66_000],
        video_samples.iter().map(|s| s.cts).collect::<Vec<i64>>(),
    );
    assert_eq!(
        vec![true, false, false, false],
        video_samples.iter().map(|s| s.is_keyframe).collect::<Vec<bool>>(),
    );

    // The positions point at the actual frame bytes.
    let first = video_samples[0];
    let start = usize::try_from(first.file_offset).expect("usize fit offset");
    assert_eq!(
        b"frame-i".as_slice(),
        &data[start..start + usize::try_from(first.size).expect("usize fit size")],
    );

    let audio_samples: Vec<&SamplePosition> = parsed
        .samples
        .iter()
        .filter(|(id, _)| *id == TrackId::new(2))
        .map(|(_, p)| p)
        .collect();
    assert_eq!(2, audio_samples.len());
    assert!(audio_samples.iter().all(|s| s.is_keyframe));
    let last = audio_samples[1];
    let start = usize::try_from(last.file_offset).expect("usize fit offset");
    assert_eq!(
        b"aac-1".as_slice(),
        &data[start..start + usize::try_from(last.size).expect("usize fit size")],
    );
}

#[tokio::test]
async fn test_moov_front() {
    let data = mux(MoovPlacement::Front).await;

    // moov precedes mdat.
    let moov = data.windows(4).position(|w| w == b"moov").expect("moov");
    let mdat = data.windows(4).position(|w| w == b"mdat").expect("mdat");
    assert!(moov < mdat);

    assert_expected_layout(&data);
}

#[tokio::test]
async fn test_moov_back() {
    let data = mux(MoovPlacement::Back).await;

    // mdat precedes moov and its patched size covers the data.
    let moov = data.windows(4).position(|w| w == b"moov").expect("moov");
    let mdat = data.windows(4).position(|w| w == b"mdat").expect("mdat");
    assert!(mdat < moov);

    let mut size = [0_u8; 4];
    size.copy_from_slice(&data[mdat - 4..mdat]);
    let total: usize = [
        b"frame-i".len(),
        b"frame-p".len(),
        b"frame-b1".len(),
        b"frame-b2".len(),
        b"aac-0".len(),
        b"aac-1".len(),
    ]
    .iter()
    .sum();
    assert_eq!(total + 8, usize::try_from(u32::from_be_bytes(size)).expect("usize"));

    assert_expected_layout(&data);
}

#[tokio::test]
async fn test_ftyp_brands() {
    let data = mux(MoovPlacement::Front).await;
    assert_eq!(&data[4..8], b"ftyp");
    assert_eq!(&data[8..12], b"isom");
    assert_eq!(&data[12..16], &[0, 0, 2, 0]);
    assert_eq!(&data[16..32], b"isomiso2avc1mp41");
}

#[tokio::test]
async fn test_unsupported_codecs_rejected() {
    let writer = SharedMemoryWriter::new();
    let mut muxer = Mp4Muxer::new(Box::new(writer), Mp4MuxerOptions::default());

    assert!(matches!(
        muxer.add_video_track(VideoCodec::Vp9, 640, 360, Bytes::new()),
        Err(Mp4MuxerError::UnsupportedCodec(c)) if c == "vp9",
    ));
    assert!(matches!(
        muxer.add_audio_track(AudioCodec::Opus, 2, 48000, Bytes::new()),
        Err(Mp4MuxerError::UnsupportedCodec(c)) if c == "opus",
    ));
}

#[tokio::test]
async fn test_unknown_track_rejected() {
    let writer = SharedMemoryWriter::new();
    let mut muxer = Mp4Muxer::new(Box::new(writer), Mp4MuxerOptions::default());
    assert!(matches!(
        muxer.add_sample(7, &chunk(7, 0, 1000, true, b"x")).await,
        Err(Mp4MuxerError::UnknownTrack(7)),
    ));
}
