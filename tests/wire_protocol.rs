// Frame sizes, fragmentation and reassembly as seen by a receiver.

use std::collections::BTreeMap;

use vibration_node::codec::{decode, unpack_i16_le, unpack_u16_le, BlobKind, Message};
use vibration_node::config::{BLOB_CAPACITY, META_CAPACITY};
use vibration_node::machine::{Cycle, CycleEnd, CycleState};
use vibration_node::publish::{plan_frames, PublishTiming};
use vibration_node::session::{AcquisitionSession, Axis, IntervalSeries, Waveform};
use vibration_node::sim::SimPlatform;
use vibration_node::FailureCode;

fn session(n: usize) -> AcquisitionSession {
    let ramp = |k: i32| -> Vec<i16> { (0..n).map(|i| ((i as i32 * k) % 65_536 - 32_768) as i16).collect() };
    let waveform = Waveform::from_axes(ramp(7), ramp(13), ramp(29)).unwrap();
    let deltas = (0..n - 1).map(|i| 500 + (i % 100) as u16).collect();
    AcquisitionSession::from_parts(1_717_171_717_171_717, 2000, waveform, IntervalSeries::from_deltas(deltas)).unwrap()
}

/// Receiver-side view: payload bytes per blob kind, parts joined by index.
fn reassemble(frames: &[Vec<u8>]) -> BTreeMap<&'static str, Vec<u8>> {
    let mut parts: BTreeMap<&'static str, BTreeMap<u16, Vec<u8>>> = BTreeMap::new();
    let mut expected: BTreeMap<&'static str, u16> = BTreeMap::new();
    for frame in frames {
        if let Message::Blob(blob) = decode(frame).unwrap() {
            let tag = blob.kind.type_tag();
            expected.insert(tag, blob.parts);
            parts.entry(tag).or_default().insert(blob.idx, blob.payload);
        }
    }
    parts
        .into_iter()
        .map(|(tag, chunks)| {
            assert_eq!(chunks.len(), usize::from(expected[tag]), "{tag}");
            (tag, chunks.into_values().flatten().collect())
        })
        .collect()
}

#[test]
fn every_frame_fits_its_buffer_at_max_n() {
    let s = session(2000);
    let frames = plan_frames(&s, "esp32s3-lis331-01", "192.168.100.200", true).unwrap();
    assert!(frames[0].bytes.len() <= META_CAPACITY);
    assert!(frames[1..].iter().all(|f| f.bytes.len() <= BLOB_CAPACITY));
}

#[test]
fn fragmented_blobs_reassemble_to_the_session() {
    let s = session(1500);
    let frames: Vec<Vec<u8>> = plan_frames(&s, "dev", "ip", true)
        .unwrap()
        .into_iter()
        .map(|f| f.bytes)
        .collect();
    let joined = reassemble(&frames);

    assert_eq!(unpack_u16_le(&joined["dt"]).unwrap(), s.intervals().as_slice());
    assert_eq!(unpack_i16_le(&joined["x"]).unwrap(), s.waveform().axis(Axis::X));
    assert_eq!(unpack_i16_le(&joined["y"]).unwrap(), s.waveform().axis(Axis::Y));
    assert_eq!(unpack_i16_le(&joined["z"]).unwrap(), s.waveform().axis(Axis::Z));
}

#[test]
fn default_sample_count_is_one_part_per_blob() {
    let frames = plan_frames(&session(500), "esp32s3-lis331-01", "ip", true).unwrap();
    assert_eq!(frames.len(), 5);
    for frame in &frames[1..] {
        let Message::Blob(blob) = decode(&frame.bytes).unwrap() else {
            panic!("expected blob");
        };
        assert_eq!((blob.idx, blob.parts), (0, 1));
    }
    let kinds: Vec<_> = frames[1..]
        .iter()
        .map(|f| match decode(&f.bytes).unwrap() {
            Message::Blob(b) => b.kind,
            Message::Meta(_) => unreachable!(),
        })
        .collect();
    assert_eq!(kinds, BlobKind::SEQUENCE);
}

#[test]
fn oversized_identity_fails_the_cycle_before_sending() {
    let config = format!(
        r#"{{
            "device": {{ "client_id": "{}" }},
            "wifi":   {{ "ssid": "lab" }},
            "mqtt":   {{ "host": "broker.test" }},
            "acq":    {{ "n_samples": 4, "fs_hz": 100, "mag_rms_threshold": 0 }}
        }}"#,
        "n".repeat(600)
    );
    let mut platform = SimPlatform::new(config);
    let mut cycle = Cycle::new(PublishTiming::immediate());
    let end = cycle.run(&mut platform);

    let CycleEnd::Fail { code, .. } = end else {
        panic!("expected encoding failure");
    };
    assert_eq!(code, FailureCode::Encoding);
    assert_eq!(code.blinks(), 7);
    assert!(platform.sent().is_empty());
    let history = cycle.history();
    assert_eq!(history[history.len() - 2], CycleState::Gated);
}
