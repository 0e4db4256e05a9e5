//! Message codec (component A).
//!
//! Every envelope on the broker carries a `content` map and a `metadata`
//! map. The wire format is length-free binary: each variable-length field
//! is self-delimiting via its own 4-byte length prefix, but there is no
//! outer envelope-length frame — this mirrors the teacher's
//! `network::protocol::ControlRequest` encode/decode (`to_le_bytes`,
//! `from_le_bytes`, explicit offset arithmetic), generalized from six
//! control messages to the full envelope set below.
//!
//! `content` and `metadata` are carried as JSON rather than a fixed struct
//! layout, because the spec's envelope set is a closed list of *kinds* but
//! each kind's content shape is open (scan-status content differs from
//! alarm content). JSON keeps the byte layout uniform while `EnvelopeKind`
//! keeps the set of message types closed and typed.

use serde_json::Value;
use std::collections::HashMap;

use crate::error::CodecError;

/// The closed set of envelope kinds this fabric exchanges, per the grammar
/// in spec §4.1 / §6.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EnvelopeKind {
    ScanQueueRequest = 0,
    ScanQueueRequestResponse = 1,
    ScanQueueStatus = 2,
    ScanQueueModificationRequest = 3,
    DeviceInstruction = 4,
    DeviceReadback = 5,
    DeviceRequestStatus = 6,
    DeviceProgress = 7,
    ScanStatus = 8,
    ScanSegment = 9,
    ScanBaseline = 10,
    DeviceConfigUpdate = 11,
    DeviceConfigRequestResponse = 12,
    DeviceInfo = 13,
    File = 14,
    Alarm = 15,
    Log = 16,
}

impl EnvelopeKind {
    fn from_u8(tag: u8) -> Result<Self, CodecError> {
        use EnvelopeKind::*;
        Ok(match tag {
            0 => ScanQueueRequest,
            1 => ScanQueueRequestResponse,
            2 => ScanQueueStatus,
            3 => ScanQueueModificationRequest,
            4 => DeviceInstruction,
            5 => DeviceReadback,
            6 => DeviceRequestStatus,
            7 => DeviceProgress,
            8 => ScanStatus,
            9 => ScanSegment,
            10 => ScanBaseline,
            11 => DeviceConfigUpdate,
            12 => DeviceConfigRequestResponse,
            13 => DeviceInfo,
            14 => File,
            15 => Alarm,
            16 => Log,
            other => return Err(CodecError::UnknownTag(other)),
        })
    }
}

/// A generic metadata map: RID, scanID, DIID, pointID, readout_priority,
/// queue_group, scan_def_id, etc. are all well-known keys but the map
/// itself is open, matching the Python source's free `metadata: dict`.
pub type Metadata = HashMap<String, Value>;

/// One message on the broker: an envelope kind plus its content and
/// metadata maps.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub content: Value,
    pub metadata: Metadata,
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, content: Value, metadata: Metadata) -> Self {
        Self {
            kind,
            content,
            metadata,
        }
    }

    /// Encode to the length-free binary wire format:
    /// `[tag: u8][content_len: u32 LE][content bytes][metadata_len: u32 LE][metadata bytes]`.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let content_bytes = serde_json::to_vec(&self.content)?;
        let metadata_bytes = serde_json::to_vec(&self.metadata)?;

        let mut buf = Vec::with_capacity(1 + 4 + content_bytes.len() + 4 + metadata_bytes.len());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&(content_bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(&content_bytes);
        buf.extend_from_slice(&(metadata_bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(&metadata_bytes);
        Ok(buf)
    }

    /// Decode from the wire format produced by [`Envelope::encode`].
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let mut offset = 0usize;

        let tag = *buf
            .get(offset)
            .ok_or(CodecError::Truncated { need: 1, have: buf.len() })?;
        offset += 1;
        let kind = EnvelopeKind::from_u8(tag)?;

        let content_len = read_u32(buf, offset)? as usize;
        offset += 4;
        let content_bytes = buf
            .get(offset..offset + content_len)
            .ok_or(CodecError::Truncated {
                need: offset + content_len,
                have: buf.len(),
            })?;
        offset += content_len;
        let content: Value = serde_json::from_slice(content_bytes)?;

        let metadata_len = read_u32(buf, offset)? as usize;
        offset += 4;
        let metadata_bytes = buf
            .get(offset..offset + metadata_len)
            .ok_or(CodecError::Truncated {
                need: offset + metadata_len,
                have: buf.len(),
            })?;
        let metadata: Metadata = serde_json::from_slice(metadata_bytes)?;

        Ok(Envelope::new(kind, content, metadata))
    }
}

fn read_u32(buf: &[u8], offset: usize) -> Result<u32, CodecError> {
    let slice = buf
        .get(offset..offset + 4)
        .ok_or(CodecError::Truncated {
            need: offset + 4,
            have: buf.len(),
        })?;
    let arr: [u8; 4] = slice.try_into().expect("slice is exactly 4 bytes");
    Ok(u32::from_le_bytes(arr))
}
