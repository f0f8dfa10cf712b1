//! Command signatures: a single 64-bit hash over everything outside a
//! command's declared inputs that can change its behavior.

use xxhash_rust::xxh3::Xxh3;

/// Hash value identifying a configuration of a command; compared against the
/// signature stored in a cached SuccessfulCommand to detect staleness.
/// xxh3 is stable across processes, which the persisted form relies on.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Signature(pub u64);

const UNIT_SEPARATOR: u8 = 0x1F;

/// Accumulates length-delimited fields into a signature.  Callers feeding
/// set-like data (e.g. an environment map) must sort it first; xor-combining
/// per-entry hashes is not collision-safe.
pub struct SignatureHasher(Xxh3);

impl Default for SignatureHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl SignatureHasher {
    pub fn new() -> Self {
        SignatureHasher(Xxh3::new())
    }

    pub fn write_str(&mut self, s: &str) {
        self.0.update(&(s.len() as u64).to_le_bytes());
        self.0.update(s.as_bytes());
    }

    pub fn write_u64(&mut self, n: u64) {
        self.0.update(&n.to_le_bytes());
    }

    pub fn write_separator(&mut self) {
        self.0.update(&[UNIT_SEPARATOR]);
    }

    pub fn finish(&self) -> Signature {
        Signature(self.0.digest())
    }
}
