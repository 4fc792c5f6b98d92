use crate::*;
use pretty_assertions::assert_eq;
use pretty_hex::pretty_hex;

fn marshal_single(b: &dyn ImmutableBox) -> Vec<u8> {
    let mut buf = Vec::new();
    let size = write_single_box(&mut buf, b).expect("marshal");
    assert_eq!(size, buf.len());
    buf
}

#[test]
fn test_boxes_size_includes_children() {
    let tree = Boxes::new(Moov).with_children(vec![
        Boxes::new(Trak).with_child(Boxes::new(Mdia)),
        Boxes::new(Trak),
    ]);

    // moov(8) + trak(8) + mdia(8) + trak(8).
    assert_eq!(32, tree.size());

    let mut buf = Vec::new();
    tree.marshal(&mut buf).expect("marshal");
    assert_eq!(32, buf.len());
    assert_eq!(&buf[0..4], &[0, 0, 0, 32]);
    assert_eq!(&buf[4..8], b"moov");
    assert_eq!(&buf[8..12], &[0, 0, 0, 16]);
    assert_eq!(&buf[12..16], b"trak");
}

#[test]
fn test_ftyp() {
    let got = marshal_single(&Ftyp {
        major_brand: *b"isom",
        minor_version: 512,
        compatible_brands: vec![
            CompatibleBrandElem(*b"isom"),
            CompatibleBrandElem(*b"iso2"),
            CompatibleBrandElem(*b"avc1"),
            CompatibleBrandElem(*b"mp41"),
        ],
    });

    let want = vec![
        0, 0, 0, 0x20, b'f', b't', b'y', b'p', //
        b'i', b's', b'o', b'm', // Major brand.
        0, 0, 2, 0, // Minor version.
        b'i', b's', b'o', b'm', // Compatible brand.
        b'i', b's', b'o', b'2', // Compatible brand.
        b'a', b'v', b'c', b'1', // Compatible brand.
        b'm', b'p', b'4', b'1', // Compatible brand.
    ];
    assert_eq!(pretty_hex(&want), pretty_hex(&got));
}

#[test]
fn test_mvhd() {
    let got = marshal_single(&Mvhd {
        timescale: 1000,
        version: MvhdVersion::V0(MvhdV0 {
            duration: 5000,
            ..Default::default()
        }),
        rate: 65536,
        volume: 256,
        matrix: [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000],
        next_track_id: 3,
        ..Default::default()
    });

    let want = vec![
        0, 0, 0, 0x6c, b'm', b'v', b'h', b'd', //
        0, 0, 0, 0, // Fullbox.
        0, 0, 0, 0, // Creation time.
        0, 0, 0, 0, // Modification time.
        0, 0, 3, 0xe8, // Timescale.
        0, 0, 0x13, 0x88, // Duration.
        0, 1, 0, 0, // Rate.
        1, 0, // Volume.
        0, 0, // Reserved.
        0, 0, 0, 0, 0, 0, 0, 0, // Reserved2.
        0, 1, 0, 0, 0, 0, 0, 0, 0, // Matrix.
        0, 0, 0, 0, 0, 0, 0, 0, 1, //
        0, 0, 0, 0, 0, 0, 0, 0, 0, //
        0, 0, 0, 0, 0, 0x40, 0, 0, 0, //
        0, 0, 0, 0, 0, 0, // Pre-defined.
        0, 0, 0, 0, 0, 0, //
        0, 0, 0, 0, 0, 0, //
        0, 0, 0, 0, 0, 0, //
        0, 0, 0, 3, // Next track ID.
    ];
    assert_eq!(pretty_hex(&want), pretty_hex(&got));
}

#[test]
fn test_tkhd() {
    let got = marshal_single(&Tkhd {
        flags: [0, 0, 3],
        track_id: 1,
        version: TkhdVersion::V0(TkhdV0::default()),
        width: 640 << 16,
        height: 360 << 16,
        matrix: [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000],
        ..Default::default()
    });

    let want = vec![
        0, 0, 0, 0x5c, b't', b'k', b'h', b'd', //
        0, 0, 0, 3, // Fullbox.
        0, 0, 0, 0, // Creation time.
        0, 0, 0, 0, // Modification time.
        0, 0, 0, 1, // Track ID.
        0, 0, 0, 0, // Reserved0.
        0, 0, 0, 0, // Duration.
        0, 0, 0, 0, 0, 0, 0, 0, // Reserved1.
        0, 0, // Layer.
        0, 0, // Alternate group.
        0, 0, // Volume.
        0, 0, // Reserved2.
        0, 1, 0, 0, 0, 0, 0, 0, 0, // Matrix.
        0, 0, 0, 0, 0, 0, 0, 0, 1, //
        0, 0, 0, 0, 0, 0, 0, 0, 0, //
        0, 0, 0, 0, 0, 0x40, 0, 0, 0, //
        2, 0x80, 0, 0, // Width.
        1, 0x68, 0, 0, // Height.
    ];
    assert_eq!(pretty_hex(&want), pretty_hex(&got));
}

#[test]
fn test_mdhd_language_packing() {
    let got = marshal_single(&Mdhd {
        timescale: 90000,
        language: *b"und",
        version: MdhdVersion::V0(MdhdV0 {
            duration: 17,
            ..Default::default()
        }),
        ..Default::default()
    });

    let want = vec![
        0, 0, 0, 0x20, b'm', b'd', b'h', b'd', //
        0, 0, 0, 0, // FullBox.
        0, 0, 0, 0, // Creation time.
        0, 0, 0, 0, // Modification time.
        0, 1, 0x5f, 0x90, // Time scale.
        0, 0, 0, 0x11, // Duration.
        0x55, 0xc4, // Language "und".
        0, 0, // Predefined.
    ];
    assert_eq!(pretty_hex(&want), pretty_hex(&got));
}

#[test]
fn test_hdlr() {
    let got = marshal_single(&Hdlr {
        handler_type: *b"soun",
        name: "SoundHandler".to_owned(),
        ..Default::default()
    });

    let want = vec![
        0, 0, 0, 0x2d, b'h', b'd', b'l', b'r', //
        0, 0, 0, 0, // FullBox.
        0, 0, 0, 0, // Predefined.
        b's', b'o', b'u', b'n', // Handler type.
        0, 0, 0, 0, // Reserved.
        0, 0, 0, 0, //
        0, 0, 0, 0, //
        b'S', b'o', b'u', b'n', b'd', b'H', b'a', b'n', b'd', b'l', b'e', b'r', 0, //
    ];
    assert_eq!(pretty_hex(&want), pretty_hex(&got));
}

#[test]
fn test_mp4a() {
    let got = marshal_single(&Mp4a {
        sample_entry: SampleEntry {
            data_reference_index: 1,
            ..Default::default()
        },
        channel_count: 2,
        sample_size: 16,
        sample_rate: 48000 << 16,
        ..Default::default()
    });

    let want = vec![
        0, 0, 0, 0x24, b'm', b'p', b'4', b'a', //
        0, 0, 0, 0, 0, 0, // Reserved.
        0, 1, // Data reference index.
        0, 0, // Entry version.
        0, 0, 0, 0, 0, 0, // Reserved.
        0, 2, // Channel count.
        0, 0x10, // Sample size.
        0, 0, // Predefined.
        0, 0, // Reserved2.
        0xbb, 0x80, 0, 0, // Sample rate 48000 in 16.16.
    ];
    assert_eq!(pretty_hex(&want), pretty_hex(&got));
}

#[test]
fn test_esds() {
    let got = marshal_single(&Esds {
        es_id: 1,
        object_type_indication: 0x40,
        max_bitrate: 128_000,
        avg_bitrate: 128_000,
        decoder_specific_info: vec![0x12, 0x10],
    });

    let want = vec![
        0, 0, 0, 0x27, b'e', b's', b'd', b's', //
        0, 0, 0, 0, // FullBox.
        3, 0x19, // ES descriptor.
        0, 1, // ES ID.
        0, // Flags.
        4, 0x11, // Decoder config descriptor.
        0x40, // Object type: AAC.
        0x15, // Stream type: audio.
        0, 0, 0, // Buffer size DB.
        0, 1, 0xf4, 0, // Max bitrate.
        0, 1, 0xf4, 0, // Average bitrate.
        5, 2, // Decoder specific info.
        0x12, 0x10, // AudioSpecificConfig.
        6, 1, 2, // SL config.
    ];
    assert_eq!(pretty_hex(&want), pretty_hex(&got));
}

#[test]
fn test_pasp() {
    let got = marshal_single(&Pasp {
        h_spacing: 1,
        v_spacing: 1,
    });

    let want = vec![
        0, 0, 0, 0x10, b'p', b'a', b's', b'p', //
        0, 0, 0, 1, // Horizontal spacing.
        0, 0, 0, 1, // Vertical spacing.
    ];
    assert_eq!(pretty_hex(&want), pretty_hex(&got));
}

#[test]
fn test_smhd() {
    let got = marshal_single(&Smhd::default());

    let want = vec![
        0, 0, 0, 0x10, b's', b'm', b'h', b'd', //
        0, 0, 0, 0, // FullBox.
        0, 0, // Balance.
        0, 0, // Reserved.
    ];
    assert_eq!(pretty_hex(&want), pretty_hex(&got));
}

#[test]
fn test_elst() {
    let got = marshal_single(&Elst {
        flags: [0, 0, 0],
        entries: vec![ElstEntry {
            segment_duration: 1000,
            media_time: 3000,
            ..Default::default()
        }],
    });

    let want = vec![
        0, 0, 0, 0x1c, b'e', b'l', b's', b't', //
        0, 0, 0, 0, // FullBox.
        0, 0, 0, 1, // Entry count.
        0, 0, 3, 0xe8, // Segment duration.
        0, 0, 0xb, 0xb8, // Media time.
        0, 1, // Media rate integer.
        0, 0, // Media rate fraction.
    ];
    assert_eq!(pretty_hex(&want), pretty_hex(&got));
}

#[test]
fn test_sample_tables() {
    let stts = marshal_single(&Stts {
        full_box: FullBox::default(),
        entries: vec![SttsEntry {
            sample_count: 3,
            sample_delta: 9,
        }],
    });
    let want = vec![
        0, 0, 0, 0x18, b's', b't', b't', b's', //
        0, 0, 0, 0, // FullBox.
        0, 0, 0, 1, // Entry count.
        0, 0, 0, 3, // Entry1 sample count.
        0, 0, 0, 9, // Entry1 sample delta.
    ];
    assert_eq!(pretty_hex(&want), pretty_hex(&stts));

    let ctts = marshal_single(&Ctts {
        flags: [0, 0, 0],
        entries: CttsEntries::V1(vec![CttsEntryV1 {
            sample_count: 1,
            sample_offset: -9,
        }]),
    });
    let want = vec![
        0, 0, 0, 0x18, b'c', b't', b't', b's', //
        1, 0, 0, 0, // FullBox.
        0, 0, 0, 1, // Entry count.
        0, 0, 0, 1, // Entry1 sample count.
        0xff, 0xff, 0xff, 0xf7, // Entry1 sample offset.
    ];
    assert_eq!(pretty_hex(&want), pretty_hex(&ctts));

    let stsc = marshal_single(&Stsc {
        full_box: FullBox::default(),
        entries: vec![StscEntry {
            first_chunk: 1,
            samples_per_chunk: 3,
            sample_description_index: 1,
        }],
    });
    let want = vec![
        0, 0, 0, 0x1c, b's', b't', b's', b'c', //
        0, 0, 0, 0, // FullBox.
        0, 0, 0, 1, // Entry count.
        0, 0, 0, 1, // Entry1 first chunk.
        0, 0, 0, 3, // Entry1 samples per chunk.
        0, 0, 0, 1, // Entry1 sample description index.
    ];
    assert_eq!(pretty_hex(&want), pretty_hex(&stsc));

    let stsz = marshal_single(&Stsz {
        full_box: FullBox::default(),
        sample_size: 0,
        sample_count: 2,
        entry_sizes: vec![2, 4],
    });
    let want = vec![
        0, 0, 0, 0x1c, b's', b't', b's', b'z', //
        0, 0, 0, 0, // FullBox.
        0, 0, 0, 0, // Sample size.
        0, 0, 0, 2, // Sample count.
        0, 0, 0, 2, // Entry1 size.
        0, 0, 0, 4, // Entry2 size.
    ];
    assert_eq!(pretty_hex(&want), pretty_hex(&stsz));

    let stco = marshal_single(&Stco {
        full_box: FullBox::default(),
        chunk_offsets: vec![713],
    });
    let want = vec![
        0, 0, 0, 0x14, b's', b't', b'c', b'o', //
        0, 0, 0, 0, // FullBox.
        0, 0, 0, 1, // Entry count.
        0, 0, 2, 0xc9, // Chunk offset1.
    ];
    assert_eq!(pretty_hex(&want), pretty_hex(&stco));

    let stss = marshal_single(&Stss {
        full_box: FullBox::default(),
        sample_numbers: vec![1, 4],
    });
    let want = vec![
        0, 0, 0, 0x18, b's', b't', b's', b's', //
        0, 0, 0, 0, // FullBox.
        0, 0, 0, 2, // Entry count.
        0, 0, 0, 1, // Entry1.
        0, 0, 0, 4, // Entry2.
    ];
    assert_eq!(pretty_hex(&want), pretty_hex(&stss));
}

#[test]
fn test_url() {
    let got = marshal_single(&Url {
        full_box: FullBox {
            version: 0,
            flags: [0, 0, 1],
        },
        location: String::new(),
    });

    let want = vec![
        0, 0, 0, 0xc, b'u', b'r', b'l', b' ', //
        0, 0, 0, 1, // FullBox.
    ];
    assert_eq!(pretty_hex(&want), pretty_hex(&got));
}

#[test]
fn test_raw_box() {
    let got = marshal_single(&RawBox {
        typ: TYPE_AVCC,
        data: vec![1, 0x64, 0, 0x16],
    });

    let want = vec![
        0, 0, 0, 0xc, b'a', b'v', b'c', b'C', //
        1, 0x64, 0, 0x16, // Payload.
    ];
    assert_eq!(pretty_hex(&want), pretty_hex(&got));
}
