// Vibration Node: Publish Orchestrator
//
// Sends one session as `meta, dt, x, y, z` on the configured topic.
//
// Every frame is encoded up front; once the first byte is on the air nothing
// else can fail with an encoding error.  Delivery is fire-and-forget: a
// rejected publish is logged and counted, and the sequence moves on.

use std::fmt;
use std::time::Duration;

use crate::codec::{self, BlobKind, EncodingError};
use crate::config::{FINAL_FLUSH_MS, PUBLISH_FLUSH_MS, PUBLISH_GAP_MS};
use crate::session::AcquisitionSession;

/// Outbound message channel (the MQTT client on the device).
pub trait Transport {
    /// Queue one message.  `false` means the client refused it.
    fn publish(&mut self, frame: &[u8]) -> bool;

    /// Give the client `window` to move queued bytes onto the wire.
    fn pump(&mut self, window: Duration);
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn publish(&mut self, frame: &[u8]) -> bool {
        (**self).publish(frame)
    }

    fn pump(&mut self, window: Duration) {
        (**self).pump(window)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishTiming {
    /// After every publish.
    pub flush: Duration,
    /// Before every blob except the first.
    pub gap: Duration,
    /// Once, after the last message.
    pub final_flush: Duration,
}

impl Default for PublishTiming {
    fn default() -> Self {
        Self {
            flush: Duration::from_millis(PUBLISH_FLUSH_MS),
            gap: Duration::from_millis(PUBLISH_GAP_MS),
            final_flush: Duration::from_millis(FINAL_FLUSH_MS),
        }
    }
}

impl PublishTiming {
    pub const fn immediate() -> Self {
        Self {
            flush: Duration::ZERO,
            gap: Duration::ZERO,
            final_flush: Duration::ZERO,
        }
    }
}

// ---------------------------------------------------------------------------
// Frame planning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLabel {
    Meta,
    Blob { kind: BlobKind, idx: u16, parts: u16 },
}

impl fmt::Display for FrameLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Meta => f.write_str("meta"),
            Self::Blob { kind, parts: 1, .. } => f.write_str(kind.type_tag()),
            Self::Blob { kind, idx, parts } => write!(f, "{}[{}/{}]", kind.type_tag(), idx + 1, parts),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFrame {
    pub label: FrameLabel,
    pub bytes: Vec<u8>,
}

fn blob_payload(session: &AcquisitionSession, kind: BlobKind) -> Vec<u8> {
    match kind.axis() {
        None => codec::pack_u16_le(session.intervals().as_slice()),
        Some(axis) => codec::pack_i16_le(session.waveform().axis(axis)),
    }
}

/// Encode the complete message set for one session, in send order.
pub fn plan_frames(
    session: &AcquisitionSession,
    device_id: &str,
    ip: &str,
    ntp_ok: bool,
) -> Result<Vec<PlannedFrame>, EncodingError> {
    let id = session.session_id(device_id);
    let part_bytes = codec::max_part_bytes(&id)?;

    let mut frames = vec![PlannedFrame {
        label: FrameLabel::Meta,
        bytes: codec::encode_meta(session, device_id, ip, ntp_ok)?.to_vec(),
    }];

    for kind in BlobKind::SEQUENCE {
        let payload = blob_payload(session, kind);
        let chunks: Vec<&[u8]> = if payload.is_empty() {
            vec![payload.as_slice()]
        } else {
            payload.chunks(part_bytes).collect()
        };
        let parts = u16::try_from(chunks.len()).map_err(|_| EncodingError::TooManyParts { parts: chunks.len() })?;

        for (idx, chunk) in (0u16..).zip(chunks) {
            let frame = codec::encode_blob(kind, id.as_str(), chunk, idx, parts)?;
            frames.push(PlannedFrame {
                label: FrameLabel::Blob { kind, idx, parts },
                bytes: frame.to_vec(),
            });
        }
    }

    Ok(frames)
}

// ---------------------------------------------------------------------------
// Sending
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageOutcome {
    pub label: FrameLabel,
    pub bytes: usize,
    pub published: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub outcomes: Vec<MessageOutcome>,
}

impl PublishReport {
    pub fn attempted(&self) -> usize {
        self.outcomes.len()
    }

    pub fn published(&self) -> usize {
        self.outcomes.iter().filter(|o| o.published).count()
    }

    pub fn failed(&self) -> usize {
        self.attempted() - self.published()
    }

    pub fn bytes_published(&self) -> usize {
        self.outcomes.iter().filter(|o| o.published).map(|o| o.bytes).sum()
    }
}

/// Standalone entry point: encode everything, then send it.  An encoding
/// error returns before the transport is touched.  The wake cycle calls
/// [`plan_frames`] and [`send_frames`] separately so that encoding finishes
/// while it is still gated.
pub fn publish_sequence<T: Transport + ?Sized>(
    session: &AcquisitionSession,
    device_id: &str,
    ip: &str,
    ntp_ok: bool,
    transport: &mut T,
    timing: &PublishTiming,
) -> Result<PublishReport, EncodingError> {
    let frames = plan_frames(session, device_id, ip, ntp_ok)?;
    Ok(send_frames(&frames, transport, timing))
}

/// Send pre-encoded frames in order, pumping the transport between them.
/// Never fails: refused messages are recorded in the report.
pub fn send_frames<T: Transport + ?Sized>(
    frames: &[PlannedFrame],
    transport: &mut T,
    timing: &PublishTiming,
) -> PublishReport {
    let mut report = PublishReport::default();
    for (i, frame) in frames.iter().enumerate() {
        // frames[0] is meta, frames[1] the first blob
        if i >= 2 {
            transport.pump(timing.gap);
        }

        let published = transport.publish(&frame.bytes);
        if published {
            log::info!("  {} sent ({} bytes)", frame.label, frame.bytes.len());
        } else {
            log::warn!("  {} publish failed ({} bytes)", frame.label, frame.bytes.len());
        }
        report.outcomes.push(MessageOutcome {
            label: frame.label,
            bytes: frame.bytes.len(),
            published,
        });

        transport.pump(timing.flush);
    }

    transport.pump(timing.final_flush);
    log::info!(
        "Publish done: {}/{} ok, {} bytes",
        report.published(),
        report.attempted(),
        report.bytes_published()
    );
    report
}
