use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use rand::Rng;
use sha2::{Digest, Sha256};

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Streaming file hash in 1 MiB reads so large artifacts never load whole.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("open {} for hashing", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("read {} for hashing", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Random identifier with a stable prefix, e.g. `r_4k2m9q…`. Used for token
/// jtis, invite tokens, and API key secrets; not a substitute for a UUID where
/// global uniqueness matters.
pub fn random_id(prefix: &str, len: usize) -> String {
    let mut rng = rand::thread_rng();
    let mut out = String::with_capacity(prefix.len() + len);
    out.push_str(prefix);
    for _ in 0..len {
        let idx = rng.gen_range(0..ID_ALPHABET.len());
        out.push(ID_ALPHABET[idx] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn sha256_file_agrees_with_in_memory_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.bin");
        std::fs::write(&path, b"stage output bytes").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            sha256_hex(b"stage output bytes")
        );
    }

    #[test]
    fn random_ids_carry_prefix_and_length() {
        let id = random_id("r_", 16);
        assert!(id.starts_with("r_"));
        assert_eq!(id.len(), 18);
        assert_ne!(random_id("r_", 16), random_id("r_", 16));
    }
}
