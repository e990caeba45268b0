//! Slot-entry decoding from raw shred-stream payloads.
//!
//! A stream frame carries every entry reassembled for one slot as a single
//! byte blob: a little-endian u64 entry count followed by the entries, each
//! `{ hash_count: u64, poh_hash: [u8; 32], tx_count: u64, transactions }`.
//! Transaction boundaries are not length-delimited; each transaction is
//! measured in place by walking its wire form.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EntryError {
    #[error("malformed entry at offset {offset}: {reason}")]
    Malformed { offset: usize, reason: &'static str },
}

/// One reassembled entry: PoH metadata plus the raw transaction blobs.
#[derive(Debug, Clone)]
pub struct SlotEntry {
    pub hash_count: u64,
    pub poh_hash: [u8; 32],
    pub transactions: Vec<Vec<u8>>,
}

/// Read a compact-u16 (1-3 bytes, continuation in the high bit).
/// Returns `(value, bytes_consumed)`.
#[inline]
pub fn read_compact_u16(buf: &[u8]) -> Option<(u16, usize)> {
    let b0 = *buf.first()? as u16;
    if b0 < 0x80 {
        return Some((b0, 1));
    }
    let b1 = *buf.get(1)? as u16;
    if b1 < 0x80 {
        return Some(((b0 & 0x7f) | (b1 << 7), 2));
    }
    let b2 = *buf.get(2)? as u16;
    Some(((b0 & 0x7f) | ((b1 & 0x7f) << 7) | (b2 << 14), 3))
}

#[inline]
fn read_u64_le(buf: &[u8], pos: usize) -> Option<u64> {
    let bytes: [u8; 8] = buf.get(pos..pos + 8)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

/// Skip a compact-u16 prefixed run of fixed-size items starting at `pos`.
/// Returns the position just past the run.
#[inline]
fn skip_compact_vec(buf: &[u8], pos: usize, item_size: usize) -> Option<usize> {
    let (count, len_bytes) = read_compact_u16(buf.get(pos..)?)?;
    let end = pos
        .checked_add(len_bytes)?
        .checked_add(count as usize * item_size)?;
    (end <= buf.len()).then_some(end)
}

/// Measure the wire length of one transaction starting at the front of
/// `buf` without copying or decoding it. Never reads past the buffer.
pub fn measure_transaction(buf: &[u8]) -> Option<usize> {
    // Signatures: compact count, 64 bytes each.
    let (sig_count, sig_len_bytes) = read_compact_u16(buf)?;
    let mut pos = sig_len_bytes.checked_add(sig_count as usize * 64)?;
    if pos > buf.len() {
        return None;
    }

    // Version bit in the first message byte selects the v0 layout.
    let first = *buf.get(pos)?;
    let versioned = first & 0x80 != 0;
    if versioned {
        pos += 1;
    }

    // Header: 3 bytes.
    pos = pos.checked_add(3)?;
    if pos > buf.len() {
        return None;
    }

    // Static account keys, then the recent blockhash.
    pos = skip_compact_vec(buf, pos, 32)?;
    pos = pos.checked_add(32)?;
    if pos > buf.len() {
        return None;
    }

    // Instructions: program index, account indices, data.
    let (ix_count, ix_len_bytes) = read_compact_u16(buf.get(pos..)?)?;
    pos += ix_len_bytes;
    for _ in 0..ix_count {
        pos = pos.checked_add(1)?; // program_id_index
        if pos > buf.len() {
            return None;
        }
        pos = skip_compact_vec(buf, pos, 1)?; // account indices
        pos = skip_compact_vec(buf, pos, 1)?; // data bytes
    }

    if versioned {
        // Address-table lookups: table key, writable indices, readonly indices.
        let (lookup_count, lookup_len_bytes) = read_compact_u16(buf.get(pos..)?)?;
        pos += lookup_len_bytes;
        for _ in 0..lookup_count {
            pos = pos.checked_add(32)?;
            if pos > buf.len() {
                return None;
            }
            pos = skip_compact_vec(buf, pos, 1)?;
            pos = skip_compact_vec(buf, pos, 1)?;
        }
    }

    Some(pos)
}

/// Decode a slot payload into its entries.
///
/// Fails with [`EntryError::Malformed`] when a length prefix runs past the
/// buffer or a transaction measures to zero while the entry still claims
/// transactions.
pub fn decode_slot_entries(payload: &[u8]) -> Result<Vec<SlotEntry>, EntryError> {
    let malformed = |offset: usize, reason: &'static str| EntryError::Malformed { offset, reason };

    let entry_count = read_u64_le(payload, 0)
        .ok_or_else(|| malformed(0, "missing entry count"))?;
    let mut pos = 8usize;
    let mut entries = Vec::with_capacity(entry_count.min(1024) as usize);

    for _ in 0..entry_count {
        let hash_count = read_u64_le(payload, pos)
            .ok_or_else(|| malformed(pos, "truncated hash count"))?;
        pos += 8;

        let poh_hash: [u8; 32] = payload
            .get(pos..pos + 32)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| malformed(pos, "truncated poh hash"))?;
        pos += 32;

        let tx_count = read_u64_le(payload, pos)
            .ok_or_else(|| malformed(pos, "truncated transaction count"))?;
        pos += 8;

        let mut transactions = Vec::with_capacity(tx_count.min(4096) as usize);
        for _ in 0..tx_count {
            let rest = payload
                .get(pos..)
                .ok_or_else(|| malformed(pos, "transaction start past buffer"))?;
            let tx_len = match measure_transaction(rest) {
                Some(len) if len > 0 => len,
                _ => return Err(malformed(pos, "unmeasurable transaction")),
            };
            transactions.push(rest[..tx_len].to_vec());
            pos += tx_len;
        }

        entries.push(SlotEntry {
            hash_count,
            poh_hash,
            transactions,
        });
    }

    Ok(entries)
}
