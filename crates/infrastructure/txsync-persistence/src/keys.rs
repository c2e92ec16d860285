//! Fixed-width binary keys. Integers are big-endian so byte order equals numeric order.

use byteorder::{BigEndian, ByteOrder};
use txsync_core::{Address, Timestamp, TxHash};

pub const TIME_KEY_LEN: usize = 8 + TxHash::LEN;
pub const RELEVANT_KEY_LEN: usize = Address::LEN + TxHash::LEN;

/// `timestamp ++ hash`, ordering the transaction table by time.
pub fn time_index_key(ts: Timestamp, hash: &TxHash) -> [u8; TIME_KEY_LEN] {
    let mut key = [0u8; TIME_KEY_LEN];
    BigEndian::write_u64(&mut key[..8], ts);
    key[8..].copy_from_slice(hash.as_bytes());
    key
}

/// Inclusive key bounds covering every hash in `[from, to]`.
pub fn time_index_bounds(from: Timestamp, to: Timestamp) -> ([u8; TIME_KEY_LEN], [u8; TIME_KEY_LEN]) {
    let start = time_index_key(from, &TxHash([0x00; 32]));
    let end = time_index_key(to, &TxHash([0xff; 32]));
    (start, end)
}

pub fn split_time_index_key(key: &[u8]) -> Option<(Timestamp, TxHash)> {
    if key.len() != TIME_KEY_LEN {
        return None;
    }
    let ts = BigEndian::read_u64(&key[..8]);
    let hash = TxHash::from_slice(&key[8..]).ok()?;
    Some((ts, hash))
}

/// `address ++ hash` link between a transaction and an address of interest.
pub fn relevant_key(address: &Address, hash: &TxHash) -> [u8; RELEVANT_KEY_LEN] {
    let mut key = [0u8; RELEVANT_KEY_LEN];
    key[..Address::LEN].copy_from_slice(address.as_bytes());
    key[Address::LEN..].copy_from_slice(hash.as_bytes());
    key
}

pub fn relevant_bounds(address: &Address) -> ([u8; RELEVANT_KEY_LEN], [u8; RELEVANT_KEY_LEN]) {
    (
        relevant_key(address, &TxHash([0x00; 32])),
        relevant_key(address, &TxHash([0xff; 32])),
    )
}

pub fn hash_from_relevant_key(key: &[u8]) -> Option<TxHash> {
    if key.len() != RELEVANT_KEY_LEN {
        return None;
    }
    TxHash::from_slice(&key[Address::LEN..]).ok()
}

/// `parent ++ trace_id`, grouping internal transactions under their parent.
///
/// The trace id is the explorer's call path (`0`, `0_1`, ...) kept verbatim, so ids that
/// share a numeric prefix never collide.
pub fn internal_key(parent: &TxHash, trace_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(TxHash::LEN + trace_id.len());
    key.extend_from_slice(parent.as_bytes());
    key.extend_from_slice(trace_id.as_bytes());
    key
}

/// Bounds enclosing every internal key of `parent`. Trace ids are ASCII, so no id byte
/// reaches `0xff`.
pub fn internal_bounds(parent: &TxHash) -> (Vec<u8>, Vec<u8>) {
    let start = parent.as_bytes().to_vec();
    let mut end = start.clone();
    end.push(0xff);
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_keys_sort_numerically() {
        let h = TxHash([7; 32]);
        let a = time_index_key(255, &h);
        let b = time_index_key(256, &h);
        assert!(a < b);
        assert_eq!(split_time_index_key(&b), Some((256, h)));
    }

    #[test]
    fn bounds_enclose_all_hashes() {
        let (lo, hi) = time_index_bounds(10, 10);
        let k = time_index_key(10, &TxHash([0x42; 32]));
        assert!(lo <= k && k <= hi);
        assert!(time_index_key(11, &TxHash([0; 32])) > hi);
    }

    #[test]
    fn internal_keys_keep_full_trace_path() {
        let parent = TxHash([3; 32]);
        let ids = ["0", "0_1", "1"].map(|id| internal_key(&parent, id));
        assert_ne!(ids[1], ids[2]);
        assert_ne!(ids[0], ids[1]);

        let (lo, hi) = internal_bounds(&parent);
        assert!(ids.iter().all(|k| lo <= *k && *k <= hi));
        assert!(internal_key(&TxHash([4; 32]), "0") > hi);
    }
}
