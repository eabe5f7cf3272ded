//! Append-only blocks and the events stored inside them.
//!
//! A block is a paged container of variable-sized entries belonging to one
//! shard. The serialized form carries a header, an offset table and the
//! entry data area, so entries can be located by index without scanning.

use std::sync::RwLock;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use bytes::{BufMut, BytesMut};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CResult, Error};
use crate::page::PageType;
use crate::types::{
    BlockId, BlockIndex, EventId, LedgerPos, PageNo, ShardId, VersionNo, MIN_BLOCK_SIZE,
};

/// The kind of an object event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    NewVersion,
    Read,
    Deletion,
}

/// An immutable record in a shard's ledger.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,

    /// Identity string of whoever caused the event.
    pub source: String,

    /// Position of the predecessor event on the same shard, if any.
    pub previous: Option<(BlockId, BlockIndex)>,

    /// Reference into the transaction ledger, for events written by a
    /// committed transaction.
    pub tx_ref: Option<LedgerPos>,

    /// Monotonically increasing along the predecessor chain, starting at 1.
    pub version_no: VersionNo,

    /// The value document as raw JSON bytes. Empty for deletions and reads.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl Event {
    pub fn new_version(
        source: String,
        previous: Option<(BlockId, BlockIndex)>,
        version_no: VersionNo,
        value: &Value,
    ) -> CResult<Self> {
        Ok(Self {
            kind: EventKind::NewVersion,
            source,
            previous,
            tx_ref: None,
            version_no,
            payload: serde_json::to_vec(value)?,
        })
    }

    pub fn deletion(source: String, previous: (BlockId, BlockIndex)) -> Self {
        Self {
            kind: EventKind::Deletion,
            source,
            previous: Some(previous),
            tx_ref: None,
            version_no: 0,
            payload: Vec::new(),
        }
    }

    pub fn has_predecessor(&self) -> bool {
        self.previous.is_some()
    }

    /// The value document carried by a NewVersion event.
    pub fn value(&self) -> CResult<Value> {
        if self.payload.is_empty() {
            return Err(Error::Internal("event carries no value".into()));
        }
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// The embedded security policy, if the document carries one.
    pub fn policy(&self) -> CResult<Option<Value>> {
        if self.kind != EventKind::NewVersion {
            return Ok(None);
        }
        let value = self.value()?;
        Ok(value.get("policy").cloned())
    }

    pub fn encode(&self) -> CResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> CResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

struct BlockState {
    sealed: bool,
    offsets: Vec<u32>,
    data: BytesMut,
}

/// A paged, append-only sequence of entries.
///
/// Pending blocks accept appends; sealed blocks are immutable. Mutations
/// must happen under the owning shard's write lock.
pub struct Block {
    page_no: PageNo,
    state: RwLock<BlockState>,
}

impl Block {
    pub fn new(page_no: PageNo) -> Self {
        Self {
            page_no,
            state: RwLock::new(BlockState {
                sealed: false,
                offsets: Vec::new(),
                data: BytesMut::with_capacity(MIN_BLOCK_SIZE),
            }),
        }
    }

    /// The block identifier equals its page number.
    pub fn identifier(&self) -> BlockId {
        self.page_no
    }

    pub fn is_pending(&self) -> bool {
        !self.state.read().unwrap().sealed
    }

    pub fn num_entries(&self) -> BlockIndex {
        self.state.read().unwrap().offsets.len() as BlockIndex
    }

    /// Number of bytes of actual stored entry data.
    pub fn data_size(&self) -> usize {
        self.state.read().unwrap().data.len()
    }

    /// Append a raw entry. Fails on sealed blocks.
    pub fn insert_raw(&self, entry: &[u8]) -> CResult<BlockIndex> {
        let mut state = self.state.write().unwrap();
        if state.sealed {
            return Err(Error::Internal("cannot insert: block is sealed".into()));
        }

        let index = state.offsets.len() as BlockIndex;
        let offset = state.data.len() as u32;
        state.offsets.push(offset);
        state.data.put_slice(entry);
        Ok(index)
    }

    pub fn get_raw(&self, index: BlockIndex) -> CResult<Vec<u8>> {
        let state = self.state.read().unwrap();
        let pos = index as usize;

        let start = *state
            .offsets
            .get(pos)
            .ok_or_else(|| Error::Internal(format!("no entry {} in block {}", index, self.page_no)))?
            as usize;
        let end = state.offsets.get(pos + 1).map(|o| *o as usize).unwrap_or(state.data.len());

        Ok(state.data[start..end].to_vec())
    }

    /// Append an object event.
    pub fn insert(&self, event: &Event) -> CResult<BlockIndex> {
        self.insert_raw(&event.encode()?)
    }

    /// Load the event at `index`.
    pub fn get_event(&self, index: BlockIndex) -> CResult<Event> {
        Event::decode(&self.get_raw(index)?)
    }

    /// Event id of the event at `index`, on behalf of the given shard.
    pub fn event_id(&self, shard: ShardId, index: BlockIndex) -> EventId {
        EventId::new(shard, self.identifier(), index)
    }

    /// Seal the block. Idempotent; sealed blocks never gain entries.
    pub fn seal(&self) {
        self.state.write().unwrap().sealed = true;
    }
}

impl PageType for Block {
    fn from_bytes(page_no: PageNo, bytes: &[u8]) -> CResult<Self> {
        let mut reader = std::io::Cursor::new(bytes);

        let sealed = reader.read_u8()? != 0;
        let count = reader.read_u16::<BigEndian>()? as usize;

        let mut offsets = Vec::with_capacity(count);
        for _ in 0..count {
            offsets.push(reader.read_u32::<BigEndian>()?);
        }

        let data_start = reader.position() as usize;
        let mut data = BytesMut::with_capacity(MIN_BLOCK_SIZE.max(bytes.len() - data_start));
        data.put_slice(&bytes[data_start..]);

        Ok(Self { page_no, state: RwLock::new(BlockState { sealed, offsets, data }) })
    }

    fn to_bytes(&self) -> CResult<Vec<u8>> {
        let state = self.state.read().unwrap();

        let mut out = Vec::with_capacity(3 + state.offsets.len() * 4 + state.data.len());
        out.write_u8(state.sealed as u8)?;
        out.write_u16::<BigEndian>(state.offsets.len() as u16)?;
        for offset in &state.offsets {
            out.write_u32::<BigEndian>(*offset)?;
        }
        out.extend_from_slice(&state.data);
        Ok(out)
    }

    fn byte_size(&self) -> usize {
        let state = self.state.read().unwrap();
        std::mem::size_of::<Self>() + state.offsets.len() * 4 + state.data.capacity()
    }
}

/// Decode the offset table of a serialized block without materializing it.
/// Used by downstream replicas to learn a pushed block's entry count.
pub fn serialized_entry_count(bytes: &[u8]) -> CResult<BlockIndex> {
    if bytes.len() < 3 {
        return Err(Error::Serialization("truncated block".into()));
    }
    Ok(BigEndian::read_u16(&bytes[1..3]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_event(n: u32) -> Event {
        Event::new_version(format!("client://tester{}", n), None, n, &json!({ "n": n })).unwrap()
    }

    #[test]
    fn insert_and_get() -> CResult<()> {
        let block = Block::new(7);
        assert!(block.is_pending());

        let a = block.insert(&sample_event(1))?;
        let b = block.insert(&sample_event(2))?;
        assert_eq!((a, b), (0, 1));
        assert_eq!(block.num_entries(), 2);

        assert_eq!(block.get_event(0)?, sample_event(1));
        assert_eq!(block.get_event(1)?, sample_event(2));
        assert!(block.get_event(2).is_err());
        Ok(())
    }

    #[test]
    fn sealed_blocks_reject_appends() -> CResult<()> {
        let block = Block::new(1);
        block.insert(&sample_event(1))?;
        block.seal();
        block.seal(); // idempotent

        assert!(!block.is_pending());
        assert!(block.insert(&sample_event(2)).is_err());
        // existing entries stay readable
        assert_eq!(block.get_event(0)?.version_no, 1);
        Ok(())
    }

    #[test]
    fn serialization_roundtrip() -> CResult<()> {
        let block = Block::new(3);
        for n in 1..=5 {
            block.insert(&sample_event(n))?;
        }
        block.seal();

        let bytes = PageType::to_bytes(&block)?;
        assert_eq!(serialized_entry_count(&bytes)?, 5);

        let loaded = Block::from_bytes(3, &bytes)?;
        assert!(!loaded.is_pending());
        assert_eq!(loaded.num_entries(), 5);
        for n in 1..=5u32 {
            assert_eq!(loaded.get_event((n - 1) as BlockIndex)?, sample_event(n));
        }
        Ok(())
    }

    #[test]
    fn event_value_and_policy() -> CResult<()> {
        let plain = sample_event(1);
        assert_eq!(plain.value()?, json!({"n": 1}));
        assert_eq!(plain.policy()?, None);

        let guarded = Event::new_version(
            "client://tester".into(),
            None,
            1,
            &json!({"a": 1, "policy": "deny-all"}),
        )?;
        assert_eq!(guarded.policy()?, Some(json!("deny-all")));

        let tombstone = Event::deletion("client://tester".into(), (1, 0));
        assert!(tombstone.value().is_err());
        assert_eq!(tombstone.policy()?, None);
        Ok(())
    }
}
