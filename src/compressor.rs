// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Compressor trait — the seam through which optional plug-in compressors
//! (ZLIB, LZO, LZMA, ...) would be wired in.
//!
//! Only the identity compressor ships with this crate; concrete compressing
//! implementations are external collaborators by design (see the purpose
//! and scope notes on out-of-scope plug-ins).

use crate::error::ReedResult;

/// A reversible byte transform applied to B+-tree leaf/inner node payloads
/// (when enabled) and to the header's module-checksum seed string.
pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> ReedResult<Vec<u8>>;
    fn decompress(&self, data: &[u8]) -> ReedResult<Vec<u8>>;
}

/// No-op compressor: passes bytes through unchanged.
///
/// This is the default compressor and the one used to derive the module
/// checksum when no plug-in compressor is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityCompressor;

impl Compressor for IdentityCompressor {
    fn compress(&self, data: &[u8]) -> ReedResult<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> ReedResult<Vec<u8>> {
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_round_trips() {
        let c = IdentityCompressor;
        let data = b"some record bytes".to_vec();
        let compressed = c.compress(&data).unwrap();
        let restored = c.decompress(&compressed).unwrap();
        assert_eq!(restored, data);
    }
}
