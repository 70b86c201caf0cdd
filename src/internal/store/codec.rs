//! Key and value codecs for the persisted tables. Keys are big-endian so the
//! store's byte ordering matches numeric ordering; values go through bincode
//! with the serde integration so every row type is a plain serde struct.

use byteorder::{BigEndian, ByteOrder};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::ident::{ElementKind, TypedId};
use crate::internal::element::cell::CellId;
use crate::internal::store::{SequenceId, StoreError};

/// Separator between a cell quadkey and the element id in cell-index keys.
/// Quadkey digits are 0..=3, so the separator keeps prefix scans over a cell
/// from leaking into its descendants only when intended.
const CELL_KEY_SEPARATOR: u8 = 0xFF;

pub fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Codec(e.to_string()))
}

pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| StoreError::Codec(e.to_string()))
}

pub fn u64_key(value: u64) -> Vec<u8> {
    let mut key = vec![0u8; 8];
    BigEndian::write_u64(&mut key, value);
    key
}

pub fn read_u64_key(key: &[u8]) -> u64 {
    BigEndian::read_u64(key)
}

/// Two big-endian words back to back, the shape of every composite key.
fn u64_pair_key(first: u64, second: u64) -> Vec<u8> {
    let mut key = vec![0u8; 16];
    BigEndian::write_u64(&mut key[..8], first);
    BigEndian::write_u64(&mut key[8..], second);
    key
}

pub fn typed_id_key(id: TypedId) -> Vec<u8> {
    u64_key(id.raw())
}

/// `(typed_id, version)` primary key of the element log.
pub fn element_key(id: TypedId, version: u64) -> Vec<u8> {
    u64_pair_key(id.raw(), version)
}

pub fn element_key_parts(key: &[u8]) -> (u64, u64) {
    (BigEndian::read_u64(&key[..8]), BigEndian::read_u64(&key[8..16]))
}

/// Prefix covering every version of one element.
pub fn element_prefix(id: TypedId) -> Vec<u8> {
    typed_id_key(id)
}

pub fn sequence_key(sequence: SequenceId) -> Vec<u8> {
    u64_key(sequence)
}

/// `(member, parent)` key of the latest-membership index.
pub fn member_key(member: TypedId, parent: TypedId) -> Vec<u8> {
    u64_pair_key(member.raw(), parent.raw())
}

pub fn member_key_parent(key: &[u8]) -> u64 {
    BigEndian::read_u64(&key[8..16])
}

pub fn changeset_key(id: u64) -> Vec<u8> {
    u64_key(id)
}

/// `(changeset_id, sequence_id)`: one bounds row per commit, never mutated.
pub fn changeset_bounds_key(changeset: u64, sequence: SequenceId) -> Vec<u8> {
    u64_pair_key(changeset, sequence)
}

pub fn changeset_bounds_key_changeset(key: &[u8]) -> u64 {
    BigEndian::read_u64(&key[..8])
}

/// `(user_id, changeset_id)` key of the per-user changeset index.
pub fn changeset_user_key(user: u64, changeset: u64) -> Vec<u8> {
    u64_pair_key(user, changeset)
}

pub fn changeset_user_key_changeset(key: &[u8]) -> u64 {
    BigEndian::read_u64(&key[8..16])
}

/// `(quadkey, separator, typed_id)` key of the cell index.
pub fn cell_key(cell: CellId, id: TypedId) -> Vec<u8> {
    let quadkey = cell.quadkey();
    let mut key = vec![0u8; quadkey.len() + 9];
    key[..quadkey.len()].copy_from_slice(&quadkey);
    key[quadkey.len()] = CELL_KEY_SEPARATOR;
    BigEndian::write_u64(&mut key[quadkey.len() + 1..], id.raw());
    key
}

/// Prefix matching exactly one cell's entries.
pub fn cell_exact_prefix(cell: CellId) -> Vec<u8> {
    let mut prefix = cell.quadkey();
    prefix.push(CELL_KEY_SEPARATOR);
    prefix
}

/// Prefix matching a cell's entries plus every descendant cell's entries.
pub fn cell_subtree_prefix(cell: CellId) -> Vec<u8> {
    cell.quadkey()
}

pub fn cell_key_element(key: &[u8]) -> Option<u64> {
    let separator = key.iter().position(|&b| b == CELL_KEY_SEPARATOR)?;
    let id = key.get(separator + 1..separator + 9)?;
    Some(BigEndian::read_u64(id))
}

pub fn id_counter_key(kind: ElementKind) -> Vec<u8> {
    vec![kind as u8]
}

/// Changesets draw from their own counter, after the element kinds.
pub fn changeset_counter_key() -> Vec<u8> {
    vec![ElementKind::ALL.len() as u8]
}

/// Key of the single global watermark row.
pub fn watermark_key() -> Vec<u8> {
    b"hwm".to_vec()
}

/// Key of one shard's local watermark row.
pub fn shard_watermark_key(shard: usize) -> Vec<u8> {
    const PREFIX: &[u8] = b"shard-";
    let mut key = vec![0u8; PREFIX.len() + 8];
    key[..PREFIX.len()].copy_from_slice(PREFIX);
    BigEndian::write_u64(&mut key[PREFIX.len()..], shard as u64);
    key
}

pub fn fingerprint_key(digest: [u8; 32]) -> Vec<u8> {
    digest.to_vec()
}

/// Smallest key strictly greater than every key starting with `prefix`.
/// Empty result means "unbounded" (the prefix was all `0xFF`).
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < u8::MAX {
            *last += 1;
            return end;
        }
        end.pop();
    }
    end
}
