use crate::{element, DemuxError, Demuxer};
use common::{AudioCodec, DemuxEvent, SamplePosition, Track, TrackId, VideoCodec};
use pretty_assertions::assert_eq;

fn el(id: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    byteio::write_element_id(&mut out, id);
    byteio::write_vint(&mut out, u64::try_from(payload.len()).expect("u64 fit usize"));
    out.extend_from_slice(payload);
    out
}

fn uint_el(id: u32, value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = usize::try_from(value.leading_zeros() / 8).expect("small").min(7);
    el(id, &bytes[skip..])
}

fn string_el(id: u32, value: &str) -> Vec<u8> {
    el(id, value.as_bytes())
}

fn float_el(id: u32, value: f64) -> Vec<u8> {
    el(id, &value.to_be_bytes())
}

fn ebml_header() -> Vec<u8> {
    el(element::EBML, &string_el(element::DOC_TYPE, "webm"))
}

// Segment with unknown size, the streaming form.
fn segment_start() -> Vec<u8> {
    let mut out = Vec::new();
    byteio::write_element_id(&mut out, element::SEGMENT);
    out.push(0xFF);
    out
}

fn video_track_entry() -> Vec<u8> {
    let mut entry = Vec::new();
    entry.extend_from_slice(&uint_el(element::TRACK_NUMBER, 1));
    entry.extend_from_slice(&uint_el(element::TRACK_TYPE, 1));
    entry.extend_from_slice(&string_el(element::CODEC_ID, "V_VP8"));
    let mut video = Vec::new();
    video.extend_from_slice(&uint_el(element::PIXEL_WIDTH, 640));
    video.extend_from_slice(&uint_el(element::PIXEL_HEIGHT, 360));
    entry.extend_from_slice(&el(element::VIDEO, &video));
    el(element::TRACK_ENTRY, &entry)
}

fn audio_track_entry() -> Vec<u8> {
    let mut entry = Vec::new();
    entry.extend_from_slice(&uint_el(element::TRACK_NUMBER, 2));
    entry.extend_from_slice(&uint_el(element::TRACK_TYPE, 2));
    entry.extend_from_slice(&string_el(element::CODEC_ID, "A_OPUS"));
    entry.extend_from_slice(&uint_el(element::DEFAULT_DURATION, 20_000_000));
    let mut audio = Vec::new();
    audio.extend_from_slice(&uint_el(element::CHANNELS, 2));
    audio.extend_from_slice(&float_el(element::SAMPLING_FREQUENCY, 48000.0));
    entry.extend_from_slice(&el(element::AUDIO, &audio));
    el(element::TRACK_ENTRY, &entry)
}

fn simple_block(track: u8, relative_ts: i16, flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut block = vec![0x80 | track];
    block.extend_from_slice(&relative_ts.to_be_bytes());
    block.push(flags);
    block.extend_from_slice(payload);
    el(element::SIMPLE_BLOCK, &block)
}

fn drain(demuxer: &mut Demuxer) -> Vec<DemuxEvent> {
    let mut events = Vec::new();
    while let Some(event) = demuxer.poll().expect("poll") {
        events.push(event);
    }
    events
}

#[test]
fn test_parse_webm() {
    let mut file = Vec::new();
    file.extend_from_slice(&ebml_header());
    file.extend_from_slice(&segment_start());
    file.extend_from_slice(&el(
        element::INFO,
        &uint_el(element::TIMESTAMP_SCALE, 1_000_000),
    ));

    let mut tracks = Vec::new();
    tracks.extend_from_slice(&video_track_entry());
    tracks.extend_from_slice(&audio_track_entry());
    file.extend_from_slice(&el(element::TRACKS, &tracks));

    // Cluster with Timestamp 1000 and a keyframe SimpleBlock at
    // +17 with a 512 byte payload.
    let mut cluster = Vec::new();
    cluster.extend_from_slice(&uint_el(element::TIMESTAMP, 1000));
    let first_block = simple_block(1, 17, 0x80, &[0xAB; 512]);
    cluster.extend_from_slice(&first_block);
    cluster.extend_from_slice(&simple_block(1, 50, 0x00, &[0xCD; 16]));
    cluster.extend_from_slice(&simple_block(2, 20, 0x80, &[0xEF; 8]));

    let cluster_offset = u64::try_from(file.len()).expect("u64 fit usize");
    let cluster_el = el(element::CLUSTER, &cluster);
    let cluster_header_len = cluster_el.len() - cluster.len();
    file.extend_from_slice(&cluster_el);

    // A segment-level element ends the cluster.
    file.extend_from_slice(&el(element::TAGS, &[]));

    // Feed in small slices to exercise incremental resume.
    let mut demuxer = Demuxer::new();
    let mut events = Vec::new();
    for chunk in file.chunks(13) {
        demuxer.feed(chunk);
        events.extend(drain(&mut demuxer));
    }
    demuxer.finish().expect("finish");
    events.extend(drain(&mut demuxer));

    // Two tracks, three samples.
    assert_eq!(5, events.len());

    let DemuxEvent::Track(Track::Video(video)) = &events[0] else {
        panic!("expected video track: {:?}", events[0]);
    };
    assert_eq!(TrackId::new(1), video.id);
    assert_eq!(VideoCodec::Vp8, video.codec);
    assert_eq!("vp8", video.codec_string);
    assert_eq!(640, video.coded_width);
    assert_eq!(360, video.coded_height);
    assert_eq!(1_000_000, video.timescale);

    let DemuxEvent::Track(Track::Audio(audio)) = &events[1] else {
        panic!("expected audio track: {:?}", events[1]);
    };
    assert_eq!(TrackId::new(2), audio.id);
    assert_eq!(AudioCodec::Opus, audio.codec);
    assert_eq!(2, audio.number_of_channels);
    assert_eq!(48000, audio.sample_rate);

    // Video blocks wait for their successor to fix the duration,
    // so the first video sample is emitted when the second block
    // is parsed.
    let DemuxEvent::Samples {
        track_id,
        positions,
    } = &events[2]
    else {
        panic!("expected samples: {:?}", events[2]);
    };
    assert_eq!(TrackId::new(1), *track_id);
    let first_frame_offset = cluster_offset
        + u64::try_from(cluster_header_len + uint_el(element::TIMESTAMP, 1000).len())
            .expect("u64 fit usize")
        + u64::try_from(first_block.len() - 512).expect("u64 fit usize");
    assert_eq!(
        vec![SamplePosition {
            file_offset: first_frame_offset,
            size: 512,
            dts: 1_017_000,
            cts: 1_017_000,
            duration: 33_000,
            is_keyframe: true,
        }],
        *positions,
    );

    // The audio block has a default duration and is emitted as
    // soon as it is parsed.
    let DemuxEvent::Samples {
        track_id,
        positions,
    } = &events[3]
    else {
        panic!("expected samples: {:?}", events[3]);
    };
    assert_eq!(TrackId::new(2), *track_id);
    assert_eq!(
        vec![SamplePosition {
            file_offset: positions[0].file_offset,
            size: 8,
            dts: 1_020_000,
            cts: 1_020_000,
            duration: 20_000,
            is_keyframe: true,
        }],
        *positions,
    );

    // The last video block is flushed on finish and reuses the
    // previous duration.
    let DemuxEvent::Samples { positions, .. } = &events[4] else {
        panic!("expected samples: {:?}", events[4]);
    };
    assert_eq!(1_050_000, positions[0].dts);
    assert_eq!(33_000, positions[0].duration);
    assert!(!positions[0].is_keyframe);
}

fn block_group(inner: &[Vec<u8>]) -> Vec<u8> {
    let mut payload = Vec::new();
    for part in inner {
        payload.extend_from_slice(part);
    }
    el(element::BLOCK_GROUP, &payload)
}

#[test]
fn test_block_group_keyframe_inference() {
    let mut file = Vec::new();
    file.extend_from_slice(&ebml_header());
    file.extend_from_slice(&segment_start());
    file.extend_from_slice(&el(element::TRACKS, &video_track_entry()));

    let mut cluster = Vec::new();
    cluster.extend_from_slice(&uint_el(element::TIMESTAMP, 0));

    // Block without a ReferenceBlock sibling is a keyframe.
    let mut block = vec![0x81, 0, 0, 0];
    block.extend_from_slice(&[1, 2, 3]);
    cluster.extend_from_slice(&block_group(&[el(element::BLOCK, &block)]));

    // Block with a ReferenceBlock sibling is a delta frame.
    let mut block = vec![0x81, 0, 40, 0];
    block.extend_from_slice(&[4, 5, 6]);
    cluster.extend_from_slice(&block_group(&[
        el(element::BLOCK, &block),
        uint_el(element::REFERENCE_BLOCK, 0),
    ]));

    cluster.extend_from_slice(&simple_block(1, 80, 0x80, &[7]));
    file.extend_from_slice(&el(element::CLUSTER, &cluster));

    let mut demuxer = Demuxer::new();
    demuxer.feed(&file);
    let mut events = drain(&mut demuxer);
    demuxer.finish().expect("finish");
    events.extend(drain(&mut demuxer));

    let samples: Vec<&SamplePosition> = events
        .iter()
        .filter_map(|e| match e {
            DemuxEvent::Samples { positions, .. } => Some(&positions[0]),
            DemuxEvent::Track(_) => None,
        })
        .collect();
    assert_eq!(3, samples.len());
    assert!(samples[0].is_keyframe);
    assert!(!samples[1].is_keyframe);
    assert!(samples[2].is_keyframe);
}

#[test]
fn test_custom_timestamp_scale() {
    let mut file = Vec::new();
    file.extend_from_slice(&ebml_header());
    file.extend_from_slice(&segment_start());
    // Half-millisecond ticks.
    file.extend_from_slice(&el(
        element::INFO,
        &uint_el(element::TIMESTAMP_SCALE, 500_000),
    ));
    file.extend_from_slice(&el(element::TRACKS, &video_track_entry()));

    let mut cluster = Vec::new();
    cluster.extend_from_slice(&uint_el(element::TIMESTAMP, 2000));
    cluster.extend_from_slice(&simple_block(1, 0, 0x80, &[1]));
    file.extend_from_slice(&el(element::CLUSTER, &cluster));

    let mut demuxer = Demuxer::new();
    demuxer.feed(&file);
    drain(&mut demuxer);
    demuxer.finish().expect("finish");
    let events = drain(&mut demuxer);

    let DemuxEvent::Samples { positions, .. } = &events[0] else {
        panic!("expected samples: {:?}", events[0]);
    };
    assert_eq!(1_000_000, positions[0].dts);
}

#[test]
fn test_not_ebml() {
    let mut demuxer = Demuxer::new();
    demuxer.feed(&[0, 0, 0, 0x14, b'f', b't', b'y', b'p']);
    assert!(matches!(demuxer.poll(), Err(DemuxError::NotEbml)));
}

#[test]
fn test_unsupported_doc_type() {
    let header = el(element::EBML, &string_el(element::DOC_TYPE, "avi"));
    let mut demuxer = Demuxer::new();
    demuxer.feed(&header);
    assert!(matches!(
        demuxer.poll(),
        Err(DemuxError::UnsupportedDocType(v)) if v == "avi",
    ));
}

#[test]
fn test_missing_segment() {
    let mut demuxer = Demuxer::new();
    demuxer.feed(&ebml_header());
    drain(&mut demuxer);
    assert!(matches!(demuxer.finish(), Err(DemuxError::MissingSegment)));
}

#[test]
fn test_unknown_elements_are_skipped() {
    let mut file = Vec::new();
    file.extend_from_slice(&ebml_header());
    file.extend_from_slice(&segment_start());
    // SeekHead with opaque content.
    file.extend_from_slice(&el(element::SEEK_HEAD, &[0xAA; 40]));
    file.extend_from_slice(&el(element::TRACKS, &video_track_entry()));

    let mut demuxer = Demuxer::new();
    demuxer.feed(&file);
    let events = drain(&mut demuxer);
    assert_eq!(1, events.len());
    assert!(matches!(&events[0], DemuxEvent::Track(Track::Video(_))));
}
