// Vibration Node: Wire Message Codec
//
// Every message is one definite-length CBOR map with text keys.  A cycle
// sends one `meta` map followed by `dt`, `x`, `y`, `z` blob maps, all sharing
// the same `id`.
//
//   meta: type id dev ip ntp epoch_s iso t0_us n fs dt_fmt a_fmt
//   blob: type id idx parts (dt | a)
//
// Blob payloads are raw CBOR byte strings of little-endian samples: `u16`
// microsecond intervals under `dt`, `i16` milli-g under `a`.  Little-endian
// is part of the wire contract.
//
// Frames are encoded with minicbor into fixed-capacity buffers.  Running out
// of room is an error; a frame is never truncated.

use minicbor::data::Type;
use minicbor::encode::write::{Cursor, EndOfArray};
use minicbor::{encode, Decoder, Encoder};
use thiserror::Error;

use crate::clock::{epoch_seconds, format_iso8601_us};
use crate::config::{BLOB_CAPACITY, MAX_BLOB_PART_BYTES, META_CAPACITY};
use crate::session::{AcquisitionSession, Axis, SessionId};

pub const DT_FORMAT: &str = "u16le_us";
pub const ACCEL_FORMAT: &str = "i16le_mg";

const META_FIELDS: u64 = 12;
const BLOB_FIELDS: u64 = 5;

/// Worst-case blob map bytes excluding the id text and payload:
/// map head, the four fixed keys with their largest values, the payload key
/// and a 3-byte byte-string head.
const BLOB_FIXED_OVERHEAD: usize = 1 + 5 + 3 + 3 + 4 + 3 + 6 + 3 + 3 + 3;

pub type MetaFrame = heapless::Vec<u8, META_CAPACITY>;
pub type BlobFrame = heapless::Vec<u8, BLOB_CAPACITY>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("frame exceeds its {capacity}-byte buffer")]
    CapacityExceeded { capacity: usize },
    #[error("payload needs {parts} parts, more than a u16 index allows")]
    TooManyParts { parts: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame truncated")]
    Truncated,
    #[error("unsupported CBOR item {0}")]
    Unsupported(String),
    #[error("top-level item is not a map")]
    NotAMap,
    #[error("map key is not a text string")]
    NonTextKey,
    #[error("malformed CBOR: {0}")]
    Malformed(String),
    #[error("{0} trailing byte(s) after the map")]
    TrailingBytes(usize),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{0}` has the wrong type")]
    WrongType(&'static str),
    #[error("field `{0}` out of range")]
    OutOfRange(&'static str),
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("payload length {0} is not a whole number of 16-bit samples")]
    OddPayload(usize),
}

// ---------------------------------------------------------------------------
// Message model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    Dt,
    X,
    Y,
    Z,
}

impl BlobKind {
    pub const SEQUENCE: [BlobKind; 4] = [BlobKind::Dt, BlobKind::X, BlobKind::Y, BlobKind::Z];

    pub const fn type_tag(self) -> &'static str {
        match self {
            Self::Dt => "dt",
            Self::X => "x",
            Self::Y => "y",
            Self::Z => "z",
        }
    }

    pub const fn payload_key(self) -> &'static str {
        match self {
            Self::Dt => "dt",
            Self::X | Self::Y | Self::Z => "a",
        }
    }

    /// The waveform axis carried by this blob; `None` for intervals.
    pub const fn axis(self) -> Option<Axis> {
        match self {
            Self::Dt => None,
            Self::X => Some(Axis::X),
            Self::Y => Some(Axis::Y),
            Self::Z => Some(Axis::Z),
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "dt" => Some(Self::Dt),
            "x" => Some(Self::X),
            "y" => Some(Self::Y),
            "z" => Some(Self::Z),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaMessage {
    pub id: String,
    pub dev: String,
    pub ip: String,
    pub ntp: bool,
    pub epoch_s: u32,
    pub iso: String,
    pub t0_us: u64,
    pub n: u16,
    pub fs: u16,
}

impl MetaMessage {
    /// All timestamps derive from the session's single captured epoch.
    pub fn from_session(session: &AcquisitionSession, device_id: &str, ip: &str, ntp_ok: bool) -> Self {
        let epoch_us0 = session.epoch_us0();
        Self {
            id: session.session_id(device_id).as_str().to_string(),
            dev: device_id.to_string(),
            ip: ip.to_string(),
            ntp: ntp_ok,
            epoch_s: epoch_seconds(epoch_us0),
            iso: format_iso8601_us(epoch_us0),
            t0_us: epoch_us0,
            n: session.n(),
            fs: session.fs_hz(),
        }
    }

    pub fn encode(&self) -> Result<MetaFrame, EncodingError> {
        encode_frame(|e| {
            e.map(META_FIELDS)?
                .str("type")?.str("meta")?
                .str("id")?.str(&self.id)?
                .str("dev")?.str(&self.dev)?
                .str("ip")?.str(&self.ip)?
                .str("ntp")?.u8(u8::from(self.ntp))?
                .str("epoch_s")?.u32(self.epoch_s)?
                .str("iso")?.str(&self.iso)?
                .str("t0_us")?.u64(self.t0_us)?
                .str("n")?.u16(self.n)?
                .str("fs")?.u16(self.fs)?
                .str("dt_fmt")?.str(DT_FORMAT)?
                .str("a_fmt")?.str(ACCEL_FORMAT)?;
            Ok(())
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMessage {
    pub kind: BlobKind,
    pub id: String,
    pub idx: u16,
    pub parts: u16,
    pub payload: Vec<u8>,
}

impl BlobMessage {
    pub fn encode(&self) -> Result<BlobFrame, EncodingError> {
        encode_blob(self.kind, &self.id, &self.payload, self.idx, self.parts)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Meta(MetaMessage),
    Blob(BlobMessage),
}

impl Message {
    pub fn id(&self) -> &str {
        match self {
            Self::Meta(meta) => &meta.id,
            Self::Blob(blob) => &blob.id,
        }
    }

    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::Meta(_) => "meta",
            Self::Blob(blob) => blob.kind.type_tag(),
        }
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

pub fn encode_meta(
    session: &AcquisitionSession,
    device_id: &str,
    ip: &str,
    ntp_ok: bool,
) -> Result<MetaFrame, EncodingError> {
    MetaMessage::from_session(session, device_id, ip, ntp_ok).encode()
}

pub fn encode_blob(
    kind: BlobKind,
    id: &str,
    payload: &[u8],
    idx: u16,
    parts: u16,
) -> Result<BlobFrame, EncodingError> {
    encode_frame(|e| {
        e.map(BLOB_FIELDS)?
            .str("type")?.str(kind.type_tag())?
            .str("id")?.str(id)?
            .str("idx")?.u16(idx)?
            .str("parts")?.u16(parts)?
            .str(kind.payload_key())?.bytes(payload)?;
        Ok(())
    })
}

/// Largest even payload length that always fits a blob frame for this id.
pub fn max_part_bytes(id: &SessionId) -> Result<usize, EncodingError> {
    let id_len = id.as_str().len();
    let overhead = BLOB_FIXED_OVERHEAD + head_len(id_len as u64) + id_len;
    match BLOB_CAPACITY.checked_sub(overhead) {
        Some(room) if room >= 2 => Ok(room.min(MAX_BLOB_PART_BYTES) & !1),
        _ => Err(EncodingError::CapacityExceeded {
            capacity: BLOB_CAPACITY,
        }),
    }
}

pub fn pack_u16_le(values: &[u16]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn pack_i16_le(values: &[i16]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn unpack_u16_le(bytes: &[u8]) -> Result<Vec<u16>, DecodeError> {
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddPayload(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

pub fn unpack_i16_le(bytes: &[u8]) -> Result<Vec<i16>, DecodeError> {
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddPayload(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// CBOR head size for an argument value (RFC 8949 3.1).
fn head_len(value: u64) -> usize {
    match value {
        0..=23 => 1,
        24..=0xFF => 2,
        0x100..=0xFFFF => 3,
        0x1_0000..=0xFFFF_FFFF => 5,
        _ => 9,
    }
}

type FrameEncoder<const N: usize> = Encoder<Cursor<[u8; N]>>;
type EncodeResult = Result<(), encode::Error<EndOfArray>>;

/// Run `body` against an `N`-byte buffer and keep what it wrote.  Reaching
/// the end of the buffer is `CapacityExceeded`, never a short frame.
fn encode_frame<const N: usize>(
    body: impl FnOnce(&mut FrameEncoder<N>) -> EncodeResult,
) -> Result<heapless::Vec<u8, N>, EncodingError> {
    let mut e = Encoder::new(Cursor::new([0u8; N]));
    body(&mut e).map_err(|_| EncodingError::CapacityExceeded { capacity: N })?;
    let cursor = e.into_writer();
    let len = cursor.position();
    heapless::Vec::from_slice(&cursor.into_inner()[..len])
        .map_err(|_| EncodingError::CapacityExceeded { capacity: N })
}

// ---------------------------------------------------------------------------
// Decoding (host tooling and tests)
// ---------------------------------------------------------------------------

impl From<minicbor::decode::Error> for DecodeError {
    fn from(e: minicbor::decode::Error) -> Self {
        if e.is_end_of_input() {
            DecodeError::Truncated
        } else {
            DecodeError::Malformed(e.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Uint(u64),
    Text(String),
    Bytes(Vec<u8>),
}

fn value(d: &mut Decoder<'_>) -> Result<Value, DecodeError> {
    match d.datatype()? {
        Type::U8 | Type::U16 | Type::U32 | Type::U64 => Ok(Value::Uint(d.u64()?)),
        Type::String => Ok(Value::Text(d.str()?.to_string())),
        Type::Bytes => Ok(Value::Bytes(d.bytes()?.to_vec())),
        other => Err(DecodeError::Unsupported(format!("{:?}", other))),
    }
}

struct Fields(Vec<(String, Value)>);

impl Fields {
    fn get(&self, key: &'static str) -> Result<&Value, DecodeError> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
            .ok_or(DecodeError::MissingField(key))
    }

    fn text(&self, key: &'static str) -> Result<String, DecodeError> {
        match self.get(key)? {
            Value::Text(s) => Ok(s.clone()),
            _ => Err(DecodeError::WrongType(key)),
        }
    }

    fn uint(&self, key: &'static str) -> Result<u64, DecodeError> {
        match self.get(key)? {
            Value::Uint(v) => Ok(*v),
            _ => Err(DecodeError::WrongType(key)),
        }
    }

    fn uint_as<T: TryFrom<u64>>(&self, key: &'static str) -> Result<T, DecodeError> {
        T::try_from(self.uint(key)?).map_err(|_| DecodeError::OutOfRange(key))
    }

    fn bytes(&self, key: &'static str) -> Result<Vec<u8>, DecodeError> {
        match self.get(key)? {
            Value::Bytes(b) => Ok(b.clone()),
            _ => Err(DecodeError::WrongType(key)),
        }
    }
}

/// Parse one frame back into a [`Message`].
pub fn decode(frame: &[u8]) -> Result<Message, DecodeError> {
    let mut d = Decoder::new(frame);
    if d.datatype()? != Type::Map {
        return Err(DecodeError::NotAMap);
    }
    let pairs = d.map()?.ok_or(DecodeError::NotAMap)?;

    let mut fields = Vec::new();
    for _ in 0..pairs {
        if d.datatype()? != Type::String {
            return Err(DecodeError::NonTextKey);
        }
        let key = d.str()?.to_string();
        fields.push((key, value(&mut d)?));
    }
    if d.position() != frame.len() {
        return Err(DecodeError::TrailingBytes(frame.len() - d.position()));
    }
    let fields = Fields(fields);

    let tag = fields.text("type")?;
    if tag == "meta" {
        if fields.text("dt_fmt")? != DT_FORMAT {
            return Err(DecodeError::OutOfRange("dt_fmt"));
        }
        if fields.text("a_fmt")? != ACCEL_FORMAT {
            return Err(DecodeError::OutOfRange("a_fmt"));
        }
        let ntp = match fields.uint("ntp")? {
            0 => false,
            1 => true,
            _ => return Err(DecodeError::OutOfRange("ntp")),
        };
        return Ok(Message::Meta(MetaMessage {
            id: fields.text("id")?,
            dev: fields.text("dev")?,
            ip: fields.text("ip")?,
            ntp,
            epoch_s: fields.uint_as("epoch_s")?,
            iso: fields.text("iso")?,
            t0_us: fields.uint("t0_us")?,
            n: fields.uint_as("n")?,
            fs: fields.uint_as("fs")?,
        }));
    }

    let kind = BlobKind::from_tag(&tag).ok_or(DecodeError::UnknownType(tag))?;
    Ok(Message::Blob(BlobMessage {
        kind,
        id: fields.text("id")?,
        idx: fields.uint_as("idx")?,
        parts: fields.uint_as("parts")?,
        payload: fields.bytes(kind.payload_key())?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{IntervalSeries, Waveform};

    fn session() -> AcquisitionSession {
        let waveform = Waveform::from_axes(vec![1, -2, 3], vec![0, 0, 0], vec![1000, 1001, -999]).unwrap();
        let intervals = IntervalSeries::from_deltas(vec![10_000, 10_003]);
        AcquisitionSession::from_parts(1_700_000_000_123_456, 100, waveform, intervals).unwrap()
    }

    #[test]
    fn meta_has_twelve_fields_in_order() {
        let frame = encode_meta(&session(), "node-1", "10.0.0.7", true).unwrap();
        assert_eq!(frame[0], 0xA0 | 12);
        // first key/value: "type" -> "meta"
        assert_eq!(&frame[1..11], b"\x64type\x64meta");

        let Message::Meta(meta) = decode(&frame).unwrap() else {
            panic!("expected meta");
        };
        assert_eq!(meta.id, format!("node-1-{}", (1_700_000_000_123_456_u64 & 0xFFFF_FFFF) as u32));
        assert_eq!(meta.dev, "node-1");
        assert_eq!(meta.ip, "10.0.0.7");
        assert!(meta.ntp);
        assert_eq!(meta.epoch_s, 1_700_000_000);
        assert_eq!(meta.iso, "2023-11-14T22:13:20.123456Z");
        assert_eq!(meta.t0_us, 1_700_000_000_123_456);
        assert_eq!(meta.n, 3);
        assert_eq!(meta.fs, 100);
    }

    #[test]
    fn blob_frame_layout() {
        let frame = encode_blob(BlobKind::X, "d-1", &[0x34, 0x12], 0, 1).unwrap();
        let expected: &[u8] = b"\xA5\x64type\x61x\x62id\x63d-1\x63idx\x00\x65parts\x01\x61a\x42\x34\x12";
        assert_eq!(frame.as_slice(), expected);
    }

    #[test]
    fn i16_samples_survive_the_wire() {
        let samples: Vec<i16> = (i16::MIN..=i16::MAX).collect();
        let packed = pack_i16_le(&samples);
        assert_eq!(packed.len(), 65_536 * 2);
        assert_eq!(&packed[..2], &[0x00, 0x80]);
        assert_eq!(unpack_i16_le(&packed).unwrap(), samples);
    }

    #[test]
    fn packing_is_little_endian() {
        assert_eq!(pack_u16_le(&[0x1234, 0xFFFF]), vec![0x34, 0x12, 0xFF, 0xFF]);
        assert_eq!(pack_i16_le(&[-2]), vec![0xFE, 0xFF]);
        assert_eq!(unpack_u16_le(&[1, 2, 3]), Err(DecodeError::OddPayload(3)));
    }

    #[test]
    fn oversized_blob_fails_instead_of_truncating() {
        let payload = vec![0u8; BLOB_CAPACITY];
        assert_eq!(
            encode_blob(BlobKind::Z, "d-1", &payload, 0, 1),
            Err(EncodingError::CapacityExceeded { capacity: BLOB_CAPACITY })
        );
    }

    #[test]
    fn max_part_always_fits() {
        let id = SessionId::derive("esp32s3-lis331-01", u64::from(u32::MAX));
        let room = max_part_bytes(&id).unwrap();
        assert_eq!(room % 2, 0);
        let frame = encode_blob(BlobKind::Dt, id.as_str(), &vec![0xAB; room], u16::MAX, u16::MAX).unwrap();
        assert!(frame.len() <= BLOB_CAPACITY);

        let huge = SessionId::derive(&"x".repeat(BLOB_CAPACITY), 0);
        assert!(max_part_bytes(&huge).is_err());
    }

    #[test]
    fn decode_rejects_malformed_frames() {
        let frame = encode_blob(BlobKind::Y, "d-1", &[1, 2], 0, 1).unwrap();
        assert_eq!(decode(&frame[..frame.len() - 1]), Err(DecodeError::Truncated));

        let mut trailing = frame.to_vec();
        trailing.push(0);
        assert_eq!(decode(&trailing), Err(DecodeError::TrailingBytes(1)));

        assert_eq!(decode(&[0x01]), Err(DecodeError::NotAMap));

        let mut unknown = encode_blob(BlobKind::Y, "d-1", &[], 0, 1).unwrap().to_vec();
        let at = unknown.windows(2).position(|w| w == [0x61, b'y']).unwrap();
        unknown[at + 1] = b'q';
        assert_eq!(decode(&unknown), Err(DecodeError::UnknownType("q".into())));

        // {1: 1} and {"k": -1}
        assert_eq!(decode(&[0xA1, 0x01, 0x01]), Err(DecodeError::NonTextKey));
        assert!(matches!(decode(&[0xA1, 0x61, b'k', 0x20]), Err(DecodeError::Unsupported(_))));
    }

    #[test]
    fn oversized_meta_fails_instead_of_truncating() {
        let device = "d".repeat(META_CAPACITY);
        assert_eq!(
            encode_meta(&session(), &device, "ip", true),
            Err(EncodingError::CapacityExceeded { capacity: META_CAPACITY })
        );
    }
}
