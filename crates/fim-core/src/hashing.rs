//! Single-pass content hashing: every enabled digest is fed from the same
//! read buffer.

use crate::attr::{Attribute, AttributeMask};
use sha2::{Digest, Sha256, Sha512};
use std::io::{self, Read};

const BUFFER_SIZE: usize = 64 * 1024;

pub struct MultiHasher {
    sha256: Option<Sha256>,
    sha512: Option<Sha512>,
    blake3: Option<blake3::Hasher>,
    bytes: u64,
}

/// Digests produced by one pass, plus the number of bytes read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digests {
    pub bytes: u64,
    pub values: Vec<(Attribute, Vec<u8>)>,
}

impl MultiHasher {
    /// Hashers for the hash attributes in `mask`; other bits are ignored.
    pub fn new(mask: AttributeMask) -> Self {
        Self {
            sha256: mask.contains(Attribute::Sha256).then(Sha256::new),
            sha512: mask.contains(Attribute::Sha512).then(Sha512::new),
            blake3: mask.contains(Attribute::Blake3).then(blake3::Hasher::new),
            bytes: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        if let Some(h) = self.sha256.as_mut() {
            h.update(data);
        }
        if let Some(h) = self.sha512.as_mut() {
            h.update(data);
        }
        if let Some(h) = self.blake3.as_mut() {
            h.update(data);
        }
        self.bytes += data.len() as u64;
    }

    /// Stream `reader` to the end through every enabled digest.
    pub fn consume<R: Read>(&mut self, reader: &mut R) -> io::Result<()> {
        let mut buffer = vec![0u8; BUFFER_SIZE];
        loop {
            let n = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            self.update(&buffer[..n]);
        }
        Ok(())
    }

    pub fn finalize(self) -> Digests {
        let mut values = Vec::new();
        if let Some(h) = self.sha256 {
            values.push((Attribute::Sha256, h.finalize().to_vec()));
        }
        if let Some(h) = self.sha512 {
            values.push((Attribute::Sha512, h.finalize().to_vec()));
        }
        if let Some(h) = self.blake3 {
            values.push((Attribute::Blake3, h.finalize().as_bytes().to_vec()));
        }
        Digests {
            bytes: self.bytes,
            values,
        }
    }
}

/// Hash a whole reader in one pass.
pub fn digest_reader<R: Read>(reader: &mut R, mask: AttributeMask) -> io::Result<Digests> {
    let mut hasher = MultiHasher::new(mask);
    hasher.consume(reader)?;
    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digests_in_one_pass() {
        let mask = AttributeMask::hashes();
        let digests = digest_reader(&mut &b"abc"[..], mask).unwrap();
        assert_eq!(digests.bytes, 3);
        let by_attr = |a| {
            digests
                .values
                .iter()
                .find(|(attr, _)| *attr == a)
                .map(|(_, d)| hex::encode(d))
                .unwrap()
        };
        assert_eq!(
            by_attr(Attribute::Sha256),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(by_attr(Attribute::Blake3), blake3::hash(b"abc").to_hex().to_string());
        assert_eq!(by_attr(Attribute::Sha512).len(), 128);
    }

    #[test]
    fn only_requested_digests_are_computed() {
        let digests = digest_reader(&mut &b"data"[..], AttributeMask::of(&[Attribute::Blake3, Attribute::Perm])).unwrap();
        assert_eq!(digests.values.len(), 1);
        assert_eq!(digests.values[0].0, Attribute::Blake3);
        assert!(MultiHasher::new(AttributeMask::of(&[Attribute::Size])).finalize().values.is_empty());
    }
}
