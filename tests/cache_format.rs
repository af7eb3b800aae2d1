//! Byte-level checks of the cache file layout. The replay engine reads this
//! format independently, so the positions below are a contract, not an
//! implementation detail.

use capture_prep::cache::{CACHE_MAGIC, CACHE_VERSION, COMMENT_LEN};
use capture_prep::{Cache, Decision, Side};

const HEADER_LEN: usize = 8 + 1 + 8 + COMMENT_LEN;

fn sample_cache() -> Cache {
    let mut cache = Cache::new("contract");
    cache.push(Decision::Send(Side::Secondary));
    cache.push(Decision::Send(Side::Primary));
    cache.push(Decision::Skip);
    cache
}

#[test]
fn header_field_positions() {
    let bytes = sample_cache().to_be_bytes();
    assert_eq!(&bytes[0..8], &CACHE_MAGIC);
    assert_eq!(bytes[8], CACHE_VERSION);
    assert_eq!(&bytes[9..17], &3u64.to_be_bytes());
    assert_eq!(&bytes[17..25], b"contract");
    // the rest of the comment field is null padding
    assert!(bytes[25..17 + COMMENT_LEN].iter().all(|&b| b == 0));
    assert_eq!(bytes.len(), HEADER_LEN + 1);
}

#[test]
fn golden_header_bytes() {
    // magic "capprep\0", version 1, count 3, big-endian
    let bytes = sample_cache().to_be_bytes();
    assert_eq!(hex::encode(&bytes[..17]), "6361707072657000010000000000000003");
}

#[test]
fn payload_bit_positions() {
    let bytes = sample_cache().to_be_bytes();
    // entries: send+secondary (11), send+primary (10), skip (00), padding (00)
    assert_eq!(bytes[HEADER_LEN], 0b11_10_00_00);
}

#[test]
fn payload_is_two_bits_per_packet() {
    for count in [0usize, 1, 3, 4, 5, 8, 9, 1000] {
        let mut cache = Cache::new("");
        for _ in 0..count {
            cache.push(Decision::Send(Side::Primary));
        }
        let bytes = cache.to_be_bytes();
        assert_eq!(bytes.len(), HEADER_LEN + count.div_ceil(4), "count {count}");
    }
}

#[test]
fn serde_snapshot_of_decisions() {
    let cache = sample_cache();
    let json = serde_json::to_string(cache.decisions()).unwrap();
    assert_eq!(
        json,
        r#"[{"Send":"Secondary"},{"Send":"Primary"},"Skip"]"#
    );
}
