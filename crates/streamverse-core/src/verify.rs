//! Content addressing.
//!
//! Assets are addressed by the lowercase hex SHA-256 of their bytes. The
//! address is assigned at registration and never changes, which is what
//! makes an asset immutable.

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

/// Compute the SHA-256 hash of a byte slice.
pub fn sha256_hash(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// SHA-256 as lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256_hash(data))
}

/// Hash a file without loading it into memory. Returns the content address
/// and the number of bytes read.
pub fn content_address_of_file(path: &Path) -> std::io::Result<(String, u64)> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), total))
}

/// Whether `s` looks like a content address (64 lowercase hex digits).
///
/// Used to reject path-traversal style asset ids before they reach storage.
pub fn is_content_address(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nist_sha256_abc() {
        // FIPS 180-4, Section B.1
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_file_hash_matches_in_memory_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let (addr, len) = content_address_of_file(&path).unwrap();
        assert_eq!(len, data.len() as u64);
        assert_eq!(addr, sha256_hex(&data));
    }

    #[test]
    fn test_content_address_shape() {
        assert!(is_content_address(&sha256_hex(b"video")));
        assert!(!is_content_address("../../etc/passwd"));
        assert!(!is_content_address(&sha256_hex(b"video").to_uppercase()));
        assert!(!is_content_address("abc"));
    }
}
