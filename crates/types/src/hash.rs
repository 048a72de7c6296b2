use blake3::Hasher;

// Session fingerprints: every gateway process that sees the same chain and node set
// must land on the same cache keys, so the hash input is canonicalised before hashing.

const SESSION_DOMAIN: &[u8] = b"relay-gateway/session/v1";

/// Hex digest of `(chain, sorted public keys)` under the session domain tag.
///
/// Keys are length-prefixed so `["ab", "c"]` and `["a", "bc"]` never collide.
pub fn session_digest<'a, I>(chain_id: &str, public_keys: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut keys: Vec<&str> = public_keys.into_iter().collect();
    keys.sort_unstable();

    let mut h = Hasher::new();
    h.update(SESSION_DOMAIN);
    h.update(&(chain_id.len() as u64).to_le_bytes());
    h.update(chain_id.as_bytes());
    for key in keys {
        h.update(&(key.len() as u64).to_le_bytes());
        h.update(key.as_bytes());
    }
    h.finalize().to_hex().to_string()
}
