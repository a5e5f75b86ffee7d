//! Content fingerprinting for prebuild keys and change detection.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

/// Fingerprint a byte slice.
///
/// The leading 64 bits of a SHA-256 digest. Deterministic across runs and
/// machines; equal fingerprints are treated as equal content everywhere in
/// the build.
pub fn bytes_fingerprint(data: &[u8]) -> u64 {
    let digest = Sha256::digest(data);
    u64::from_be_bytes(digest[..8].try_into().unwrap())
}

/// Fingerprint a string.
pub fn str_fingerprint(s: &str) -> u64 {
    bytes_fingerprint(s.as_bytes())
}

/// Fingerprint a file's contents.
pub fn file_fingerprint(path: &Path) -> Result<u64> {
    let file = File::open(path)
        .with_context(|| format!("failed to open file for hashing: {}", path.display()))?;

    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    let digest = hasher.finalize();
    Ok(u64::from_be_bytes(digest[..8].try_into().unwrap()))
}

/// Render a fingerprint the way prebuild filenames expect it.
pub fn hex(fingerprint: u64) -> String {
    format!("{fingerprint:x}")
}

/// A builder combining multiple components into one fingerprint.
///
/// Components are separated by a NUL byte so that `("ab", "c")` and
/// `("a", "bc")` hash differently.
#[derive(Default)]
pub struct Fingerprint {
    hasher: Sha256,
}

impl Fingerprint {
    pub fn new() -> Self {
        Fingerprint {
            hasher: Sha256::new(),
        }
    }

    /// Add a string component.
    pub fn update_str(&mut self, s: &str) -> &mut Self {
        self.hasher.update(s.as_bytes());
        self.hasher.update(b"\0");
        self
    }

    /// Add multiple string components.
    pub fn update_strs<'a>(&mut self, items: impl IntoIterator<Item = &'a str>) -> &mut Self {
        for s in items {
            self.update_str(s);
        }
        self
    }

    /// Add an already-computed fingerprint as a component.
    pub fn update_hash(&mut self, h: u64) -> &mut Self {
        self.hasher.update(h.to_be_bytes());
        self
    }

    pub fn finish(self) -> u64 {
        let digest = self.hasher.finalize();
        u64::from_be_bytes(digest[..8].try_into().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn bytes_and_file_agree() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("test.f90");
        std::fs::write(&path, "program p\nend program p\n").unwrap();

        assert_eq!(
            file_fingerprint(&path).unwrap(),
            bytes_fingerprint(b"program p\nend program p\n"),
        );
    }

    #[test]
    fn deterministic() {
        assert_eq!(str_fingerprint("hello"), str_fingerprint("hello"));
        assert_ne!(str_fingerprint("hello"), str_fingerprint("world"));
    }

    #[test]
    fn unreadable_file_is_an_error() {
        assert!(file_fingerprint(Path::new("/no/such/file.f90")).is_err());
    }

    #[test]
    fn combined_fingerprint_separates_components() {
        let ab_c = {
            let mut fp = Fingerprint::new();
            fp.update_str("ab").update_str("c");
            fp.finish()
        };
        let a_bc = {
            let mut fp = Fingerprint::new();
            fp.update_str("a").update_str("bc");
            fp.finish()
        };
        assert_ne!(ab_c, a_bc);
    }

    #[test]
    fn hex_is_lowercase() {
        let h = hex(0xDEAD_BEEF);
        assert_eq!(h, "deadbeef");
    }
}
