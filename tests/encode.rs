mod common;

use flac_pipeline::config::{
    ChannelMode, EncoderOptions, EncodingPolicy, StreamParameters, SubframeMode,
};
use flac_pipeline::encode::Encoder;
use flac_pipeline::sink::{MemorySink, StreamingSink};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn encode_all(
    params: StreamParameters,
    policy: EncodingPolicy,
    options: EncoderOptions,
    samples: &[i32],
    chunk: usize,
) -> Vec<u8> {
    let channels = usize::from(params.channels());
    let sink = MemorySink::default();
    let mut encoder = Encoder::new(sink.clone(), params, policy, options).unwrap();
    for chunk in samples.chunks(chunk * channels) {
        encoder.write_samples(chunk, chunk.len() / channels).unwrap();
    }
    encoder.finish().unwrap();
    sink.contents()
}

#[test]
fn test_frames_written_in_order() {
    // frames finish in a scrambled order
    fn delay(frame: u64) -> Duration {
        Duration::from_millis((frame * 7919) % 13)
    }

    let params = StreamParameters::new(2, 44100, 16, 192);
    let samples = common::test_signal(2, 192 * 60 + 17, 16, 1);

    let flac = encode_all(
        params,
        EncodingPolicy::default(),
        EncoderOptions::default().threads(4).encode_delay(delay),
        &samples,
        1000,
    );

    let stream = common::decode(&flac);
    assert_eq!(stream.frame_numbers(), (0..61).collect::<Vec<_>>());
    assert_eq!(stream.samples(), samples);
}

#[test]
fn test_sample_conservation() {
    for threads in [0, 1, 3] {
        for frames in [1, 15, 16, 17, 4095, 4096, 4097, 10_000] {
            let params = StreamParameters::new(2, 44100, 16, 4096);
            let samples = common::test_signal(2, frames, 16, frames as u64);

            let flac = encode_all(
                params,
                EncodingPolicy::default(),
                EncoderOptions::default().threads(threads),
                &samples,
                777,
            );

            let stream = common::decode(&flac);
            assert_eq!(stream.streaminfo.total_samples, frames as u64);
            assert_eq!(
                stream.frames.iter().map(|f| f.block_size).sum::<usize>(),
                frames
            );
            assert_eq!(stream.samples(), samples);
        }
    }
}

#[test]
fn test_streaminfo_patched() {
    let params = StreamParameters::new(2, 48000, 24, 1024);
    let samples = common::test_signal(2, 1024 * 5 + 100, 24, 7);

    let flac = encode_all(
        params,
        EncodingPolicy::default(),
        EncoderOptions::default().threads(2).padding(100),
        &samples,
        4000,
    );

    let stream = common::decode(&flac);
    let streaminfo = &stream.streaminfo;
    assert_eq!(stream.padding, Some(100));
    assert_eq!(streaminfo.sample_rate, 48000);
    assert_eq!(streaminfo.channels, 2);
    assert_eq!(streaminfo.bits_per_sample, 24);
    assert_eq!(streaminfo.total_samples, 1024 * 5 + 100);
    assert_eq!(streaminfo.minimum_block_size, 1024);
    assert_eq!(streaminfo.maximum_block_size, 1024);
    assert_eq!(
        streaminfo.minimum_frame_size as usize,
        stream.frames.iter().map(|f| f.size).min().unwrap()
    );
    assert_eq!(
        streaminfo.maximum_frame_size as usize,
        stream.frames.iter().map(|f| f.size).max().unwrap()
    );
    assert_eq!(streaminfo.md5, common::samples_md5(&samples, 24));
}

/// A writer which can be inspected while the encoder owns it
#[derive(Clone, Default)]
struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_non_seekable_sink() {
    let params = StreamParameters::new(1, 22050, 8, 256);
    let samples = common::test_signal(1, 256 * 3, 8, 3);
    let writer = SharedWriter::default();

    let mut encoder = Encoder::new(
        StreamingSink::new(writer.clone()),
        params,
        EncodingPolicy::default(),
        EncoderOptions::default().threads(2),
    )
    .unwrap();
    encoder.write_samples(&samples, 256 * 3).unwrap();
    let summary = encoder.finish().unwrap();
    assert!(!summary.patched);
    assert_eq!(summary.md5, common::samples_md5(&samples, 8));

    let flac = writer.0.lock().unwrap().clone();
    let stream = common::decode(&flac);
    // placeholder values remain
    assert_eq!(stream.streaminfo.total_samples, 0);
    assert_eq!(stream.streaminfo.md5, [0; 16]);
    assert_eq!(stream.samples(), samples);
}

#[test]
fn test_backpressure() {
    fn delay(_: u64) -> Duration {
        Duration::from_millis(40)
    }

    let params = StreamParameters::new(1, 44100, 16, 16);
    let sink = MemorySink::default();
    let mut encoder = Encoder::new(
        sink.clone(),
        params,
        EncodingPolicy::default(),
        EncoderOptions::default()
            .threads(1)
            .queue_limit(100)
            .encode_delay(delay),
    )
    .unwrap();

    let samples = common::test_signal(1, 16 * 5, 16, 5);
    encoder.add_samples(&samples, 16 * 5).unwrap();

    assert_eq!(encoder.encode_samples(16 * 5, false).unwrap(), 16 * 5);
    assert!(encoder.outstanding() > 2);

    encoder.block_while_queue_exceeds(2).unwrap();
    assert!(encoder.outstanding() <= 2);

    encoder.block_while_queue_exceeds(0).unwrap();
    assert_eq!(encoder.outstanding(), 0);

    assert_eq!(encoder.finish().unwrap().frames, 5);
    assert_eq!(common::decode(&sink.contents()).samples(), samples);
}

#[test]
fn test_identical_channels_decorrelated() {
    let params = StreamParameters::new(2, 44100, 16, 16);
    let mono = common::test_signal(1, 16, 16, 9);
    let samples = mono.iter().flat_map(|s| [*s, *s]).collect::<Vec<_>>();

    let exhaustive = EncodingPolicy::default()
        .with_subframe_mode(SubframeMode::Exhaustive)
        .with_channel_mode(ChannelMode::Exhaustive);

    let chosen = encode_all(params, exhaustive, EncoderOptions::default(), &samples, 16);
    let independent = encode_all(
        params,
        exhaustive.with_channel_mode(ChannelMode::Independent),
        EncoderOptions::default(),
        &samples,
        16,
    );

    let stream = common::decode(&chosen);
    assert!(matches!(stream.frames[0].channel_assignment, 8 | 10));
    assert_eq!(stream.samples(), samples);
    assert!(chosen.len() < independent.len());
}

#[test]
fn test_constant_block() {
    let params = StreamParameters::new(1, 44100, 16, 4096);

    let sizes = [0, 1, -1, 12345, i16::MIN.into(), i16::MAX.into()].map(|value| {
        let flac = encode_all(
            params,
            EncodingPolicy::default(),
            EncoderOptions::default(),
            &[value; 4096],
            4096,
        );
        let stream = common::decode(&flac);
        assert_eq!(stream.samples(), vec![value; 4096]);
        stream.frames[0].size
    });

    // header, 8 + 16 bits of subframe, CRC-16
    assert!(sizes.iter().all(|size| *size == 6 + 3 + 2));
}

#[test]
fn test_channel_modes() {
    let params = StreamParameters::new(2, 44100, 16, 512);
    let samples = common::test_signal(2, 512 * 3 + 5, 16, 11);

    for mode in [
        ChannelMode::Independent,
        ChannelMode::LeftSide,
        ChannelMode::RightSide,
        ChannelMode::MidSide,
        ChannelMode::Exhaustive,
        ChannelMode::EncoderChoice,
    ] {
        let flac = encode_all(
            params,
            EncodingPolicy::default().with_channel_mode(mode),
            EncoderOptions::default().threads(2),
            &samples,
            300,
        );
        let stream = common::decode(&flac);
        assert_eq!(stream.samples(), samples, "{mode:?}");

        let expected = match mode {
            ChannelMode::Independent => Some(1),
            ChannelMode::LeftSide => Some(8),
            ChannelMode::RightSide => Some(9),
            ChannelMode::MidSide => Some(10),
            _ => None,
        };
        if let Some(expected) = expected {
            assert!(
                stream
                    .frames
                    .iter()
                    .all(|f| f.channel_assignment == expected)
            );
        }
    }
}

#[test]
fn test_subframe_modes() {
    let params = StreamParameters::new(3, 96000, 20, 1152);
    let samples = common::test_signal(3, 1152 * 2 + 1, 20, 13)
        .into_iter()
        // shared low zero bits
        .map(|s| s & !0b111)
        .collect::<Vec<_>>();

    let mut sizes = vec![];
    for mode in [
        SubframeMode::Verbatim,
        SubframeMode::Constant,
        SubframeMode::Fixed,
        SubframeMode::Lpc,
        SubframeMode::Exhaustive,
    ] {
        let flac = encode_all(
            params,
            EncodingPolicy::default()
                .with_subframe_mode(mode)
                .with_lpc_orders(1, 8)
                .with_partition_orders(0, 4),
            EncoderOptions::default().threads(2),
            &samples,
            1000,
        );
        let stream = common::decode(&flac);
        assert_eq!(stream.samples(), samples, "{mode:?}");
        sizes.push(flac.len());
    }

    // exhaustive search never loses to a single method
    let exhaustive = sizes[4];
    assert!(sizes[..4].iter().all(|size| exhaustive <= *size));
}

#[test]
fn test_policy_clamping() {
    let mut policy = EncodingPolicy::default();
    assert!(!policy.set_lpc_orders(0, 40));
    assert_eq!(policy.lpc_orders(), (1, 32));
    assert!(!policy.set_partition_orders(3, 99));
    assert_eq!(policy.partition_orders(), (3, 15));

    // a clamped policy still encodes correctly
    let params = StreamParameters::new(1, 44100, 16, 4096);
    let samples = common::test_signal(1, 5000, 16, 17);
    let flac = encode_all(params, policy, EncoderOptions::default(), &samples, 5000);
    assert_eq!(common::decode(&flac).samples(), samples);
}
