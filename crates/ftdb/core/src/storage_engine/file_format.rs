// Dotlanth
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

// File format module
// This module defines the on-disk format of dictionary files: the ping-pong file header slots, the block header that tags every node with its layout version, and one payload codec per known layout. All layouts decode into the single in-memory `Node`.

use std::convert::TryInto;
use std::io::{Cursor, Read};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use ftdb_common::LayoutVersion;
use serde::{Deserialize, Serialize};

use crate::storage_engine::lib::{DictionaryId, StorageError, StorageResult, calculate_checksum, decode, encode};
use crate::storage_engine::upgrade::UpgradeProgress;

/// Magic number to identify dictionary files (FTDBDICT)
pub const FILE_MAGIC: [u8; 8] = *b"FTDBDICT";
/// Current file header version
pub const HEADER_VERSION: u32 = 1;
/// Size of one header slot in bytes
pub const HEADER_SLOT_SIZE: usize = 4096;
/// Bytes reserved for the two header slots before the first block
pub const HEADER_REGION_SIZE: u64 = 2 * HEADER_SLOT_SIZE as u64;
/// Size of the header at the start of every block
pub const BLOCK_HEADER_SIZE: usize = 24;

/// Unique identifier for a node within a dictionary file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Node kinds stored in the block header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Leaf = 1,
    Internal = 2,
}

impl TryFrom<u8> for NodeKind {
    type Error = StorageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(NodeKind::Leaf),
            2 => Ok(NodeKind::Internal),
            other => Err(StorageError::Corruption(format!("unknown node kind {other}"))),
        }
    }
}

/// Logical contents of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeBody {
    /// Sorted key/value entries
    Leaf { entries: Vec<(Vec<u8>, Vec<u8>)> },
    /// `children.len() == pivots.len() + 1`; child `i` holds keys in `[pivots[i-1], pivots[i])`
    Internal { pivots: Vec<Vec<u8>>, children: Vec<NodeId> },
}

/// Canonical in-memory node, independent of the layout it was read from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Packed LSN of the newest log record applied to this node
    pub lsn: u64,
    /// Node contents
    pub body: NodeBody,
}

impl Node {
    pub fn empty_leaf() -> Self {
        Self { lsn: 0, body: NodeBody::Leaf { entries: Vec::new() } }
    }

    pub fn leaf(entries: Vec<(Vec<u8>, Vec<u8>)>, lsn: u64) -> Self {
        Self { lsn, body: NodeBody::Leaf { entries } }
    }

    pub fn internal(pivots: Vec<Vec<u8>>, children: Vec<NodeId>, lsn: u64) -> Self {
        Self { lsn, body: NodeBody::Internal { pivots, children } }
    }

    pub fn kind(&self) -> NodeKind {
        match self.body {
            NodeBody::Leaf { .. } => NodeKind::Leaf,
            NodeBody::Internal { .. } => NodeKind::Internal,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.kind() == NodeKind::Leaf
    }

    /// Upper bound on the encoded payload size in any layout.
    pub fn estimated_size(&self) -> usize {
        let contents = match &self.body {
            NodeBody::Leaf { entries } => entries.iter().map(|(k, v)| 12 + k.len() + v.len()).sum::<usize>(),
            NodeBody::Internal { pivots, children } => pivots.iter().map(|p| 6 + p.len()).sum::<usize>() + children.len() * 10,
        };
        32 + contents
    }

    /// Raises the LSN stamp; stamps never move backwards.
    pub fn stamp(&mut self, lsn: u64) {
        self.lsn = self.lsn.max(lsn);
    }
}

/// A node as stored on disk: the tagged union over layout version and node kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionedNode {
    V4Leaf { entries: Vec<(Vec<u8>, Vec<u8>)> },
    V4Internal { pivots: Vec<Vec<u8>>, children: Vec<NodeId> },
    V5Leaf { lsn: u64, entries: Vec<(Vec<u8>, Vec<u8>)> },
    V5Internal { lsn: u64, pivots: Vec<Vec<u8>>, children: Vec<NodeId> },
    V6(Node),
}

impl VersionedNode {
    pub fn layout(&self) -> LayoutVersion {
        match self {
            VersionedNode::V4Leaf { .. } | VersionedNode::V4Internal { .. } => LayoutVersion::V4,
            VersionedNode::V5Leaf { .. } | VersionedNode::V5Internal { .. } => LayoutVersion::V5,
            VersionedNode::V6(_) => LayoutVersion::V6,
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            VersionedNode::V4Leaf { .. } | VersionedNode::V5Leaf { .. } => NodeKind::Leaf,
            VersionedNode::V4Internal { .. } | VersionedNode::V5Internal { .. } => NodeKind::Internal,
            VersionedNode::V6(node) => node.kind(),
        }
    }

    /// Converts to the canonical representation. Layouts without an LSN stamp yield 0.
    pub fn into_node(self) -> Node {
        match self {
            VersionedNode::V4Leaf { entries } => Node::leaf(entries, 0),
            VersionedNode::V4Internal { pivots, children } => Node::internal(pivots, children, 0),
            VersionedNode::V5Leaf { lsn, entries } => Node::leaf(entries, lsn),
            VersionedNode::V5Internal { lsn, pivots, children } => Node::internal(pivots, children, lsn),
            VersionedNode::V6(node) => node,
        }
    }

    /// Decodes a payload written in `layout`.
    pub fn decode(layout: LayoutVersion, kind: NodeKind, payload: &[u8]) -> StorageResult<Self> {
        match layout {
            LayoutVersion::V4 => legacy::decode_v4(kind, payload),
            LayoutVersion::V5 => legacy::decode_v5(kind, payload),
            LayoutVersion::V6 => {
                let node: Node = decode(payload)?;
                if node.kind() != kind {
                    return Err(StorageError::Corruption(format!("block header says {:?} but payload holds {:?}", kind, node.kind())));
                }
                Ok(VersionedNode::V6(node))
            }
        }
    }
}

/// Encodes the payload of `node` in the given layout.
pub fn encode_payload(node: &Node, layout: LayoutVersion) -> StorageResult<Vec<u8>> {
    match layout {
        LayoutVersion::V4 => legacy::encode_v4(node),
        LayoutVersion::V5 => legacy::encode_v5(node),
        LayoutVersion::V6 => encode(node),
    }
}

fn payload_checksum(layout: LayoutVersion, payload: &[u8]) -> u32 {
    match layout {
        LayoutVersion::V4 => payload.iter().fold(0u32, |sum, b| sum.wrapping_mul(31).wrapping_add(*b as u32)),
        _ => calculate_checksum(payload),
    }
}

/// Largest payload that fits a block of `block_size` bytes.
pub fn max_payload(block_size: usize) -> usize {
    block_size - BLOCK_HEADER_SIZE
}

/// Block header structure (fixed size)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    /// Layout version tag
    pub layout_tag: u16,
    /// Node kind tag
    pub kind: u8,
    /// Length of the payload following the header
    pub data_len: u32,
    /// Checksum of the payload
    pub checksum: u32,
    /// Node stored in the block
    pub node_id: NodeId,
}

impl BlockHeader {
    /// Serialize the header to bytes
    pub fn serialize(&self, buffer: &mut [u8]) {
        buffer[0..2].copy_from_slice(&self.layout_tag.to_le_bytes());
        buffer[2] = self.kind;
        buffer[3] = 0;
        buffer[4..8].copy_from_slice(&self.data_len.to_le_bytes());
        buffer[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buffer[12..20].copy_from_slice(&self.node_id.0.to_le_bytes());
        buffer[20..BLOCK_HEADER_SIZE].fill(0);
    }

    /// Deserialize the header from bytes
    pub fn deserialize(buffer: &[u8]) -> StorageResult<Self> {
        if buffer.len() < BLOCK_HEADER_SIZE {
            return Err(StorageError::Corruption("block shorter than its header".to_string()));
        }
        Ok(Self {
            layout_tag: u16::from_le_bytes(buffer[0..2].try_into().map_err(|_| StorageError::Corruption("Invalid layout bytes".to_string()))?),
            kind: buffer[2],
            data_len: u32::from_le_bytes(buffer[4..8].try_into().map_err(|_| StorageError::Corruption("Invalid length bytes".to_string()))?),
            checksum: u32::from_le_bytes(buffer[8..12].try_into().map_err(|_| StorageError::Corruption("Invalid checksum bytes".to_string()))?),
            node_id: NodeId(u64::from_le_bytes(buffer[12..20].try_into().map_err(|_| StorageError::Corruption("Invalid node id bytes".to_string()))?)),
        })
    }
}

/// Encodes `node` as a full block image in `layout`.
pub fn encode_block(id: NodeId, node: &Node, layout: LayoutVersion, block_size: usize) -> StorageResult<Vec<u8>> {
    let payload = encode_payload(node, layout)?;
    if payload.len() > max_payload(block_size) {
        return Err(StorageError::Usage(format!("node {} encodes to {} bytes, block holds {}", id, payload.len(), max_payload(block_size))));
    }
    let header = BlockHeader {
        layout_tag: layout.tag(),
        kind: node.kind() as u8,
        data_len: payload.len() as u32,
        checksum: payload_checksum(layout, &payload),
        node_id: id,
    };
    let mut block = vec![0u8; block_size];
    header.serialize(&mut block[..BLOCK_HEADER_SIZE]);
    block[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + payload.len()].copy_from_slice(&payload);
    Ok(block)
}

/// Reads only the layout tag of a block image.
pub fn peek_layout(block: &[u8]) -> StorageResult<LayoutVersion> {
    let header = BlockHeader::deserialize(block)?;
    LayoutVersion::from_tag(header.layout_tag).ok_or_else(|| StorageError::Corruption(format!("unknown node layout tag {}", header.layout_tag)))
}

/// Decodes a block image, verifying its tag, checksum and owner.
pub fn decode_block(block: &[u8], expected: NodeId) -> StorageResult<VersionedNode> {
    let header = BlockHeader::deserialize(block)?;
    let layout = LayoutVersion::from_tag(header.layout_tag).ok_or_else(|| StorageError::Corruption(format!("node {} has unknown layout tag {}", expected, header.layout_tag)))?;
    let kind = NodeKind::try_from(header.kind)?;
    if header.node_id != expected {
        return Err(StorageError::Corruption(format!("block holds node {} but {} was expected", header.node_id, expected)));
    }
    let end = BLOCK_HEADER_SIZE + header.data_len as usize;
    if end > block.len() {
        return Err(StorageError::Corruption(format!("node {} payload length {} exceeds block", expected, header.data_len)));
    }
    let payload = &block[BLOCK_HEADER_SIZE..end];
    if payload_checksum(layout, payload) != header.checksum {
        return Err(StorageError::Corruption(format!("checksum mismatch in node {}", expected)));
    }
    VersionedNode::decode(layout, kind, payload)
}

/// Codecs for layouts written by earlier releases
mod legacy {
    use super::*;

    fn corrupt(e: std::io::Error) -> StorageError {
        StorageError::Corruption(format!("truncated legacy node: {e}"))
    }

    fn read_bytes<B: byteorder::ByteOrder>(cursor: &mut Cursor<&[u8]>) -> StorageResult<Vec<u8>> {
        let len = cursor.read_u32::<B>().map_err(corrupt)? as usize;
        let remaining = cursor.get_ref().len() - cursor.position() as usize;
        if len > remaining {
            return Err(StorageError::Corruption(format!("length {} exceeds remaining {} bytes", len, remaining)));
        }
        let mut bytes = vec![0u8; len];
        cursor.read_exact(&mut bytes).map_err(corrupt)?;
        Ok(bytes)
    }

    fn write_bytes<B: byteorder::ByteOrder>(out: &mut Vec<u8>, bytes: &[u8]) -> StorageResult<()> {
        out.write_u32::<B>(bytes.len() as u32)?;
        out.extend_from_slice(bytes);
        Ok(())
    }

    fn read_body<B: byteorder::ByteOrder>(kind: NodeKind, cursor: &mut Cursor<&[u8]>) -> StorageResult<NodeBody> {
        let count = cursor.read_u32::<B>().map_err(corrupt)? as usize;
        match kind {
            NodeKind::Leaf => {
                let mut entries = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    let key = read_bytes::<B>(cursor)?;
                    let value = read_bytes::<B>(cursor)?;
                    entries.push((key, value));
                }
                Ok(NodeBody::Leaf { entries })
            }
            NodeKind::Internal => {
                let mut pivots = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    pivots.push(read_bytes::<B>(cursor)?);
                }
                let mut children = Vec::with_capacity(count + 1);
                for _ in 0..=count {
                    children.push(NodeId(cursor.read_u64::<B>().map_err(corrupt)?));
                }
                Ok(NodeBody::Internal { pivots, children })
            }
        }
    }

    fn write_body<B: byteorder::ByteOrder>(out: &mut Vec<u8>, body: &NodeBody) -> StorageResult<()> {
        match body {
            NodeBody::Leaf { entries } => {
                out.write_u32::<B>(entries.len() as u32)?;
                for (key, value) in entries {
                    write_bytes::<B>(out, key)?;
                    write_bytes::<B>(out, value)?;
                }
            }
            NodeBody::Internal { pivots, children } => {
                out.write_u32::<B>(pivots.len() as u32)?;
                for pivot in pivots {
                    write_bytes::<B>(out, pivot)?;
                }
                for child in children {
                    out.write_u64::<B>(child.0)?;
                }
            }
        }
        Ok(())
    }

    fn finish(cursor: &Cursor<&[u8]>) -> StorageResult<()> {
        if cursor.position() as usize != cursor.get_ref().len() {
            return Err(StorageError::Corruption("trailing bytes in legacy node".to_string()));
        }
        Ok(())
    }

    pub(super) fn decode_v4(kind: NodeKind, payload: &[u8]) -> StorageResult<VersionedNode> {
        let mut cursor = Cursor::new(payload);
        let body = read_body::<LittleEndian>(kind, &mut cursor)?;
        finish(&cursor)?;
        Ok(match body {
            NodeBody::Leaf { entries } => VersionedNode::V4Leaf { entries },
            NodeBody::Internal { pivots, children } => VersionedNode::V4Internal { pivots, children },
        })
    }

    pub(super) fn decode_v5(kind: NodeKind, payload: &[u8]) -> StorageResult<VersionedNode> {
        let mut cursor = Cursor::new(payload);
        let lsn = cursor.read_u64::<BigEndian>().map_err(corrupt)?;
        let body = read_body::<BigEndian>(kind, &mut cursor)?;
        finish(&cursor)?;
        Ok(match body {
            NodeBody::Leaf { entries } => VersionedNode::V5Leaf { lsn, entries },
            NodeBody::Internal { pivots, children } => VersionedNode::V5Internal { lsn, pivots, children },
        })
    }

    pub(super) fn encode_v4(node: &Node) -> StorageResult<Vec<u8>> {
        let mut out = Vec::with_capacity(node.estimated_size());
        write_body::<LittleEndian>(&mut out, &node.body)?;
        Ok(out)
    }

    pub(super) fn encode_v5(node: &Node) -> StorageResult<Vec<u8>> {
        let mut out = Vec::with_capacity(node.estimated_size() + 8);
        out.write_u64::<BigEndian>(node.lsn)?;
        write_body::<BigEndian>(&mut out, &node.body)?;
        Ok(out)
    }
}

/// Location and checksum of a serialized translation table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableLocation {
    /// First block holding the table
    pub first_block: u64,
    /// Encoded table length in bytes
    pub len: u64,
    /// crc32 of the encoded table
    pub checksum: u32,
}

/// File header slot structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// Incremented by every completed checkpoint; the valid slot with the larger count wins
    pub checkpoint_count: u64,
    /// Packed LSN of the checkpoint this header describes
    pub checkpoint_lsn: u64,
    /// Owning dictionary
    pub dictionary_id: DictionaryId,
    /// Size of each block in bytes
    pub node_size: u32,
    /// Root node at the checkpoint
    pub root: NodeId,
    /// Next unused node id
    pub next_node_id: u64,
    /// First block never handed out
    pub next_block: u64,
    /// Persisted translation table
    pub table: TableLocation,
    /// Layout the file was created with
    pub created_layout: LayoutVersion,
    /// Upgrade progress as of the checkpoint
    pub upgrade: UpgradeProgress,
}

impl FileHeader {
    const CHECKSUM_OFFSET: usize = 96;

    /// Serialize the header into one slot
    pub fn serialize(&self) -> Vec<u8> {
        let mut buffer = vec![0u8; HEADER_SLOT_SIZE];
        buffer[0..8].copy_from_slice(&FILE_MAGIC);
        buffer[8..12].copy_from_slice(&HEADER_VERSION.to_le_bytes());
        buffer[12..20].copy_from_slice(&self.checkpoint_count.to_le_bytes());
        buffer[20..28].copy_from_slice(&self.checkpoint_lsn.to_le_bytes());
        buffer[28..36].copy_from_slice(&self.dictionary_id.0.to_le_bytes());
        buffer[36..40].copy_from_slice(&self.node_size.to_le_bytes());
        buffer[40..48].copy_from_slice(&self.root.0.to_le_bytes());
        buffer[48..56].copy_from_slice(&self.next_node_id.to_le_bytes());
        buffer[56..64].copy_from_slice(&self.next_block.to_le_bytes());
        buffer[64..72].copy_from_slice(&self.table.first_block.to_le_bytes());
        buffer[72..80].copy_from_slice(&self.table.len.to_le_bytes());
        buffer[80..84].copy_from_slice(&self.table.checksum.to_le_bytes());
        buffer[84..86].copy_from_slice(&self.created_layout.tag().to_le_bytes());
        buffer[86..88].copy_from_slice(&self.upgrade.target.tag().to_le_bytes());
        buffer[88..96].copy_from_slice(&self.upgrade.legacy_remaining.to_le_bytes());
        let checksum = calculate_checksum(&buffer[..Self::CHECKSUM_OFFSET]);
        buffer[Self::CHECKSUM_OFFSET..Self::CHECKSUM_OFFSET + 4].copy_from_slice(&checksum.to_le_bytes());
        buffer
    }

    /// Deserialize one slot. Returns `Ok(None)` for a slot that was never written or was torn.
    pub fn deserialize(buffer: &[u8]) -> StorageResult<Option<Self>> {
        if buffer.len() < HEADER_SLOT_SIZE || buffer[0..8] != FILE_MAGIC {
            return Ok(None);
        }
        let read_u64 = |at: usize| -> StorageResult<u64> { Ok(u64::from_le_bytes(buffer[at..at + 8].try_into().map_err(|_| StorageError::Corruption("Invalid header bytes".to_string()))?)) };
        let read_u32 = |at: usize| -> StorageResult<u32> { Ok(u32::from_le_bytes(buffer[at..at + 4].try_into().map_err(|_| StorageError::Corruption("Invalid header bytes".to_string()))?)) };
        let read_u16 = |at: usize| -> StorageResult<u16> { Ok(u16::from_le_bytes(buffer[at..at + 2].try_into().map_err(|_| StorageError::Corruption("Invalid header bytes".to_string()))?)) };

        if read_u32(Self::CHECKSUM_OFFSET)? != calculate_checksum(&buffer[..Self::CHECKSUM_OFFSET]) {
            return Ok(None);
        }
        let version = read_u32(8)?;
        if version > HEADER_VERSION {
            return Err(StorageError::Corruption(format!("Unsupported header version: {}", version)));
        }
        let layout = |tag: u16| LayoutVersion::from_tag(tag).ok_or_else(|| StorageError::Corruption(format!("unknown layout tag {} in file header", tag)));

        Ok(Some(Self {
            checkpoint_count: read_u64(12)?,
            checkpoint_lsn: read_u64(20)?,
            dictionary_id: DictionaryId(read_u64(28)?),
            node_size: read_u32(36)?,
            root: NodeId(read_u64(40)?),
            next_node_id: read_u64(48)?,
            next_block: read_u64(56)?,
            table: TableLocation { first_block: read_u64(64)?, len: read_u64(72)?, checksum: read_u32(80)? },
            created_layout: layout(read_u16(84)?)?,
            upgrade: UpgradeProgress { target: layout(read_u16(86)?)?, legacy_remaining: read_u64(88)? },
        }))
    }
}
