//! The VSR^H^H^H Paxos wire protocol: a closed, tagged variant over the eight
//! message kinds, with a hand-rolled big-endian codec matching the bit-exact
//! format the design calls for (property P4).
//!
//! Unlike a `serde`-derived envelope, the layout here is part of the public
//! contract — every field's size and order is fixed by §6 of the design —
//! so encoding/decoding is written out explicitly rather than delegated to a
//! serialization crate.

use crate::error::CodecError;
use crate::log::{ConsensusInstance, InstanceState};
use crate::types::{InstanceId, ReplicaId, ViewNumber};

const TYPE_PREPARE: u8 = 1;
const TYPE_PREPARE_OK: u8 = 2;
const TYPE_PROPOSE: u8 = 3;
const TYPE_ACCEPT: u8 = 4;
const TYPE_ALIVE: u8 = 5;
const TYPE_CATCHUP_QUERY: u8 = 6;
const TYPE_CATCHUP_RESPONSE: u8 = 7;
const TYPE_CATCHUP_SNAPSHOT: u8 = 8;

/// A wire-shaped copy of a [`ConsensusInstance`], since the log's own type
/// deliberately hides its fields behind invariant-enforcing methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub view: Option<ViewNumber>,
    pub state: InstanceState,
    pub value: Option<Vec<u8>>,
}

impl InstanceRecord {
    #[must_use]
    pub fn from_instance(instance: &ConsensusInstance) -> Self {
        Self {
            id: instance.id,
            view: instance.view(),
            state: instance.state(),
            value: instance.value().map(<[u8]>::to_vec),
        }
    }

    fn byte_size(&self) -> usize {
        // id(4) + view(4) + state(4) + len(4) + bytes
        16 + self.value.as_ref().map_or(0, Vec::len)
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.id.as_u64() as u32).to_be_bytes());
        out.extend_from_slice(&(self.view.map_or(-1i32, |v| v.as_u64() as i32)).to_be_bytes());
        let state_ordinal: i32 = match self.state {
            InstanceState::Unknown => 0,
            InstanceState::Known => 1,
            InstanceState::Decided => 2,
        };
        out.extend_from_slice(&state_ordinal.to_be_bytes());
        match &self.value {
            None => out.extend_from_slice(&(-1i32).to_be_bytes()),
            Some(bytes) => {
                out.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
                out.extend_from_slice(bytes);
            }
        }
    }

    fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        let mut cursor = Cursor::new(buf);
        let id = InstanceId::new(u64::from(cursor.read_u32()?));
        let view_raw = cursor.read_i32()?;
        let view = if view_raw < 0 {
            None
        } else {
            Some(ViewNumber::new(view_raw as u64))
        };
        let state_raw = cursor.read_i32()?;
        let state = match state_raw {
            0 => InstanceState::Unknown,
            1 => InstanceState::Known,
            2 => InstanceState::Decided,
            other => return Err(CodecError::InvalidLength(other)),
        };
        let len = cursor.read_i32()?;
        let value = if len < 0 {
            None
        } else {
            Some(cursor.read_bytes(len as usize)?.to_vec())
        };
        Ok((
            Self {
                id,
                view,
                state,
                value,
            },
            cursor.pos,
        ))
    }
}

// ============================================================================
// Payload structs, one per message kind (§6)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepare {
    pub first_uncommitted: InstanceId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareOk {
    pub prepared: Vec<InstanceRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Propose {
    pub instance: InstanceRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accept {
    pub instance_id: InstanceId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alive;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchUpQuery {
    pub requested: Vec<InstanceId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchUpResponse {
    pub entries: Vec<InstanceRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchUpSnapshot {
    pub last_included_instance_id: InstanceId,
    pub last_included_view: ViewNumber,
    pub service_bytes: Vec<u8>,
    pub client_reply_cache: Vec<u8>,
}

/// The closed set of protocol messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePayload {
    Prepare(Prepare),
    PrepareOk(PrepareOk),
    Propose(Propose),
    Accept(Accept),
    Alive(Alive),
    CatchUpQuery(CatchUpQuery),
    CatchUpResponse(CatchUpResponse),
    CatchUpSnapshot(CatchUpSnapshot),
}

impl MessagePayload {
    #[must_use]
    pub fn type_byte(&self) -> u8 {
        match self {
            MessagePayload::Prepare(_) => TYPE_PREPARE,
            MessagePayload::PrepareOk(_) => TYPE_PREPARE_OK,
            MessagePayload::Propose(_) => TYPE_PROPOSE,
            MessagePayload::Accept(_) => TYPE_ACCEPT,
            MessagePayload::Alive(_) => TYPE_ALIVE,
            MessagePayload::CatchUpQuery(_) => TYPE_CATCHUP_QUERY,
            MessagePayload::CatchUpResponse(_) => TYPE_CATCHUP_RESPONSE,
            MessagePayload::CatchUpSnapshot(_) => TYPE_CATCHUP_SNAPSHOT,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            MessagePayload::Prepare(_) => "Prepare",
            MessagePayload::PrepareOk(_) => "PrepareOk",
            MessagePayload::Propose(_) => "Propose",
            MessagePayload::Accept(_) => "Accept",
            MessagePayload::Alive(_) => "Alive",
            MessagePayload::CatchUpQuery(_) => "CatchUpQuery",
            MessagePayload::CatchUpResponse(_) => "CatchUpResponse",
            MessagePayload::CatchUpSnapshot(_) => "CatchUpSnapshot",
        }
    }
}

/// A wire message: type tag (implicit in the payload variant), view,
/// send timestamp (RTT estimation only, never consulted for protocol
/// decisions), and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub view: ViewNumber,
    pub sent_time_ms: i64,
    pub payload: MessagePayload,
}

impl Message {
    #[must_use]
    pub fn new(view: ViewNumber, sent_time_ms: i64, payload: MessagePayload) -> Self {
        Self {
            view,
            sent_time_ms,
            payload,
        }
    }

    /// `encode(m).len() == m.byte_size()` (property P4).
    #[must_use]
    pub fn byte_size(&self) -> usize {
        let payload_size = match &self.payload {
            MessagePayload::Prepare(_) => 4,
            MessagePayload::PrepareOk(p) => {
                4 + p.prepared.iter().map(InstanceRecord::byte_size).sum::<usize>()
            }
            MessagePayload::Propose(p) => p.instance.byte_size(),
            MessagePayload::Accept(_) => 4,
            MessagePayload::Alive(_) => 0,
            MessagePayload::CatchUpQuery(q) => 4 + q.requested.len() * 4,
            MessagePayload::CatchUpResponse(r) => {
                4 + r.entries.iter().map(InstanceRecord::byte_size).sum::<usize>()
            }
            MessagePayload::CatchUpSnapshot(s) => {
                4 + 4 + 4 + s.service_bytes.len() + 4 + s.client_reply_cache.len()
            }
        };
        1 + 4 + 8 + payload_size
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_size());
        out.push(self.payload.type_byte());
        out.extend_from_slice(&(self.view.as_u64() as i32).to_be_bytes());
        out.extend_from_slice(&self.sent_time_ms.to_be_bytes());

        match &self.payload {
            MessagePayload::Prepare(p) => {
                out.extend_from_slice(&(p.first_uncommitted.as_u64() as u32).to_be_bytes());
            }
            MessagePayload::PrepareOk(p) => {
                out.extend_from_slice(&(p.prepared.len() as u32).to_be_bytes());
                for rec in &p.prepared {
                    rec.encode(&mut out);
                }
            }
            MessagePayload::Propose(p) => p.instance.encode(&mut out),
            MessagePayload::Accept(a) => {
                out.extend_from_slice(&(a.instance_id.as_u64() as u32).to_be_bytes());
            }
            MessagePayload::Alive(_) => {}
            MessagePayload::CatchUpQuery(q) => {
                out.extend_from_slice(&(q.requested.len() as u32).to_be_bytes());
                for id in &q.requested {
                    out.extend_from_slice(&(id.as_u64() as u32).to_be_bytes());
                }
            }
            MessagePayload::CatchUpResponse(r) => {
                out.extend_from_slice(&(r.entries.len() as u32).to_be_bytes());
                for rec in &r.entries {
                    rec.encode(&mut out);
                }
            }
            MessagePayload::CatchUpSnapshot(s) => {
                out.extend_from_slice(&(s.last_included_instance_id.as_u64() as u32).to_be_bytes());
                out.extend_from_slice(&(s.last_included_view.as_u64() as u32).to_be_bytes());
                out.extend_from_slice(&(s.service_bytes.len() as u32).to_be_bytes());
                out.extend_from_slice(&s.service_bytes);
                out.extend_from_slice(&(s.client_reply_cache.len() as u32).to_be_bytes());
                out.extend_from_slice(&s.client_reply_cache);
            }
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let mut cursor = Cursor::new(buf);
        let type_byte = cursor.read_u8()?;
        let view = ViewNumber::new(cursor.read_i32()? as u64);
        let sent_time_ms = cursor.read_i64()?;

        let payload = match type_byte {
            TYPE_PREPARE => MessagePayload::Prepare(Prepare {
                first_uncommitted: InstanceId::new(u64::from(cursor.read_u32()?)),
            }),
            TYPE_PREPARE_OK => {
                let count = cursor.read_u32()? as usize;
                let mut prepared = Vec::with_capacity(count);
                for _ in 0..count {
                    let (rec, consumed) = InstanceRecord::decode(cursor.remaining())?;
                    cursor.advance(consumed);
                    prepared.push(rec);
                }
                MessagePayload::PrepareOk(PrepareOk { prepared })
            }
            TYPE_PROPOSE => {
                let (rec, consumed) = InstanceRecord::decode(cursor.remaining())?;
                cursor.advance(consumed);
                MessagePayload::Propose(Propose { instance: rec })
            }
            TYPE_ACCEPT => MessagePayload::Accept(Accept {
                instance_id: InstanceId::new(u64::from(cursor.read_u32()?)),
            }),
            TYPE_ALIVE => MessagePayload::Alive(Alive),
            TYPE_CATCHUP_QUERY => {
                let count = cursor.read_u32()? as usize;
                let mut requested = Vec::with_capacity(count);
                for _ in 0..count {
                    requested.push(InstanceId::new(u64::from(cursor.read_u32()?)));
                }
                MessagePayload::CatchUpQuery(CatchUpQuery { requested })
            }
            TYPE_CATCHUP_RESPONSE => {
                let count = cursor.read_u32()? as usize;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let (rec, consumed) = InstanceRecord::decode(cursor.remaining())?;
                    cursor.advance(consumed);
                    entries.push(rec);
                }
                MessagePayload::CatchUpResponse(CatchUpResponse { entries })
            }
            TYPE_CATCHUP_SNAPSHOT => {
                let last_included_instance_id = InstanceId::new(u64::from(cursor.read_u32()?));
                let last_included_view = ViewNumber::new(u64::from(cursor.read_u32()?));
                let service_len = cursor.read_u32()? as usize;
                let service_bytes = cursor.read_bytes(service_len)?.to_vec();
                let cache_len = cursor.read_u32()? as usize;
                let client_reply_cache = cursor.read_bytes(cache_len)?.to_vec();
                MessagePayload::CatchUpSnapshot(CatchUpSnapshot {
                    last_included_instance_id,
                    last_included_view,
                    service_bytes,
                    client_reply_cache,
                })
            }
            other => return Err(CodecError::UnknownType(other)),
        };

        Ok(Self {
            view,
            sent_time_ms,
            payload,
        })
    }
}

// ============================================================================
// Minimal big-endian cursor (no external parsing crate: the format is a
// closed, small set of fixed-width fields).
// ============================================================================

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn advance(&mut self, n: usize) {
        self.pos += n;
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.pos + n > self.buf.len() {
            return Err(CodecError::Truncated {
                expected: self.pos + n,
                got: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, CodecError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().expect("len checked")))
    }

    fn read_i32(&mut self) -> Result<i32, CodecError> {
        let bytes = self.read_bytes(4)?;
        Ok(i32::from_be_bytes(bytes.try_into().expect("len checked")))
    }

    fn read_i64(&mut self) -> Result<i64, CodecError> {
        let bytes = self.read_bytes(8)?;
        Ok(i64::from_be_bytes(bytes.try_into().expect("len checked")))
    }
}
