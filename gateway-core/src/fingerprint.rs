//! Stable 64-bit fingerprints over canonical URLs, and the derived cache key
//! / on-disk shard layout (§3, §6).

use xxhash_rust::xxh3::xxh3_64;

/// Stable 64-bit digest of a canonical URL string. Same input, same
/// process, same machine, different run -- always the same output (xxh3 is
/// not seeded with anything process-random).
pub fn fingerprint(canonical_url: &str) -> u64 {
    xxh3_64(canonical_url.as_bytes())
}

/// Textual cache key: `cache:{host_id}:{dimension_id}:{hash}`.
pub fn cache_key(host_id: u64, dimension_id: u64, fp: u64) -> String {
    format!("cache:{host_id}:{dimension_id}:{fp:016x}")
}

/// Two-character shard prefixes `(h0, h1)` used in the on-disk artifact path
/// `{base}/{host_id}/{dim_id}/{h0}/{h1}/{fp}.{ext}`.
pub fn shard_prefixes(fp: u64) -> (String, String) {
    let hex = format!("{fp:016x}");
    (hex[0..2].to_string(), hex[2..4].to_string())
}
