//! Artifacts and their canonical byte encoding.

use std::collections::BTreeMap;

use crate::UnitManifest;
use crate::integrity::ContentDigest;

const CANONICAL_TAG: &[u8] = b"pkgsys-unit/v1\n";

/// A fetched unit: manifest, payload files and the publisher's signature.
///
/// `digest` is the SHA-256 of [`Artifact::raw_bytes`], so it covers every
/// manifest field and every payload file. The signature is over the digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub digest: ContentDigest,
    pub manifest: UnitManifest,
    /// Payload files keyed by relative path.
    pub payload: BTreeMap<String, Vec<u8>>,
    pub signature: Vec<u8>,
}

impl Artifact {
    /// Build an unsigned artifact whose digest matches its content.
    pub fn seal(manifest: UnitManifest, payload: BTreeMap<String, Vec<u8>>) -> Self {
        let digest = ContentDigest::compute(&canonical_bytes(&manifest, &payload));
        Self {
            digest,
            manifest,
            payload,
            signature: Vec::new(),
        }
    }

    pub fn with_signature(mut self, signature: Vec<u8>) -> Self {
        self.signature = signature;
        self
    }

    /// Canonical encoding of the signed content.
    ///
    /// Every field is length-prefixed and payload files are ordered by path,
    /// so two artifacts share bytes only if they share content.
    pub fn raw_bytes(&self) -> Vec<u8> {
        canonical_bytes(&self.manifest, &self.payload)
    }

    /// Digest of the content as it is now, independent of `self.digest`.
    pub fn computed_digest(&self) -> ContentDigest {
        ContentDigest::compute(&self.raw_bytes())
    }

    /// Bytes of the entry point file, if the payload carries it.
    pub fn entry_bytes(&self) -> Option<&[u8]> {
        self.payload
            .get(&self.manifest.entry_point)
            .map(Vec::as_slice)
    }

    /// Payload plus signature size, used for cache accounting.
    pub fn size(&self) -> u64 {
        let payload: usize = self
            .payload
            .iter()
            .map(|(path, bytes)| path.len() + bytes.len())
            .sum();
        (payload + self.signature.len()) as u64
    }
}

fn canonical_bytes(manifest: &UnitManifest, payload: &BTreeMap<String, Vec<u8>>) -> Vec<u8> {
    let payload_len: usize = payload.iter().map(|(p, b)| p.len() + b.len() + 16).sum();
    let mut out = Vec::with_capacity(CANONICAL_TAG.len() + 256 + payload_len);

    out.extend_from_slice(CANONICAL_TAG);
    put_field(&mut out, manifest.name.as_bytes());
    put_field(&mut out, manifest.provider.as_bytes());
    put_field(&mut out, manifest.version.as_bytes());
    put_field(&mut out, manifest.entry_point.as_bytes());

    put_len(&mut out, manifest.exports.len());
    for export in &manifest.exports {
        put_field(&mut out, export.as_bytes());
    }

    put_len(&mut out, payload.len());
    for (path, bytes) in payload {
        put_field(&mut out, path.as_bytes());
        put_field(&mut out, bytes);
    }
    out
}

fn put_len(out: &mut Vec<u8>, len: usize) {
    out.extend_from_slice(&(len as u64).to_be_bytes());
}

fn put_field(out: &mut Vec<u8>, bytes: &[u8]) {
    put_len(out, bytes.len());
    out.extend_from_slice(bytes);
}
