//! The `.pkg` container: a zip archive holding `manifest.json` and the payload.
//!
//! Entries are written uncompressed. Decoding rejects path traversal,
//! duplicate entries, oversized entries and manifests whose declared digest
//! does not describe the payload it ships with.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use std::path::{Component, Path};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::artifact::Artifact;
use crate::{MANIFEST_FILE, ManifestError, ManifestFile, validate_manifest};

/// Maximum number of entries in one container.
pub const MAX_ENTRIES: usize = 256;

/// Maximum uncompressed size of a single entry (64 MiB).
pub const MAX_ENTRY_SIZE: u64 = 64 * 1024 * 1024;

/// Maximum uncompressed size of all entries together (256 MiB).
pub const MAX_TOTAL_SIZE: u64 = 256 * 1024 * 1024;

/// Encode an artifact as container bytes.
pub fn encode(artifact: &Artifact) -> Result<Vec<u8>, ManifestError> {
    let manifest = serde_json::to_vec_pretty(&ManifestFile::from_artifact(artifact))?;
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    write_entry(&mut writer, MANIFEST_FILE, &manifest, options)?;
    for (path, bytes) in &artifact.payload {
        validate_entry_path(path)?;
        write_entry(&mut writer, path, bytes, options)?;
    }

    let cursor = writer
        .finish()
        .map_err(|e| ManifestError::container(e.to_string()))?;
    Ok(cursor.into_inner())
}

fn write_entry(
    writer: &mut ZipWriter<Cursor<Vec<u8>>>,
    name: &str,
    bytes: &[u8],
    options: SimpleFileOptions,
) -> Result<(), ManifestError> {
    writer
        .start_file(name, options)
        .map_err(|e| ManifestError::container(e.to_string()))?;
    writer
        .write_all(bytes)
        .map_err(|e| ManifestError::container(e.to_string()))
}

/// Size and count bounds applied while decoding.
#[derive(Debug, Clone, Copy)]
struct Limits {
    entries: usize,
    entry_size: u64,
    total_size: u64,
}

const LIMITS: Limits = Limits {
    entries: MAX_ENTRIES,
    entry_size: MAX_ENTRY_SIZE,
    total_size: MAX_TOTAL_SIZE,
};

/// Decode container bytes into an artifact.
///
/// The returned artifact's `digest` is the one declared in the manifest;
/// callers decide whether it matches [`Artifact::computed_digest`].
pub fn decode(bytes: &[u8]) -> Result<Artifact, ManifestError> {
    decode_within(bytes, LIMITS)
}

fn decode_within(bytes: &[u8], limits: Limits) -> Result<Artifact, ManifestError> {
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).map_err(|e| ManifestError::container(e.to_string()))?;

    if archive.len() > limits.entries {
        return Err(ManifestError::container(format!(
            "{} entries exceeds maximum of {}",
            archive.len(),
            limits.entries
        )));
    }

    let mut manifest_json = None;
    let mut payload = BTreeMap::new();
    let mut total: u64 = 0;

    for index in 0..archive.len() {
        let mut file = archive
            .by_index(index)
            .map_err(|e| ManifestError::container(e.to_string()))?;
        if file.is_dir() {
            continue;
        }

        let name = file.name().to_string();
        validate_entry_path(&name)?;

        let declared = file.size();
        if declared > limits.entry_size {
            return Err(ManifestError::TooLarge {
                name,
                size: declared,
                max: limits.entry_size,
            });
        }

        // The declared size may lie; count what is actually read.
        let mut contents = Vec::with_capacity(declared as usize);
        (&mut file)
            .take(limits.entry_size + 1)
            .read_to_end(&mut contents)
            .map_err(|e| ManifestError::container(format!("{name}: {e}")))?;
        let size = contents.len() as u64;
        if size > limits.entry_size {
            return Err(ManifestError::TooLarge {
                name,
                size,
                max: limits.entry_size,
            });
        }
        total = total.saturating_add(size);
        if total > limits.total_size {
            return Err(ManifestError::TooLarge {
                name,
                size: total,
                max: limits.total_size,
            });
        }

        if name == MANIFEST_FILE {
            if manifest_json.is_some() {
                return Err(ManifestError::container("duplicate manifest.json"));
            }
            let text = String::from_utf8(contents)
                .map_err(|_| ManifestError::validation("manifest.json is not UTF-8"))?;
            manifest_json = Some(text);
        } else if payload.insert(name.clone(), contents).is_some() {
            return Err(ManifestError::container(format!("duplicate entry {name}")));
        }
    }

    let manifest_json =
        manifest_json.ok_or_else(|| ManifestError::MissingEntry(MANIFEST_FILE.to_string()))?;
    let (manifest, digest, signature) = validate_manifest(&manifest_json)?.into_parts()?;

    if !payload.contains_key(&manifest.entry_point) {
        return Err(ManifestError::MissingEntry(manifest.entry_point));
    }

    Ok(Artifact {
        digest,
        manifest,
        payload,
        signature,
    })
}

/// Reject entry names that could escape an extraction root.
fn validate_entry_path(name: &str) -> Result<(), ManifestError> {
    let traversal = || ManifestError::PathTraversal {
        path: name.to_string(),
    };

    if name.is_empty() || name.contains('\\') || name.contains('\0') {
        return Err(traversal());
    }
    let path = Path::new(name);
    if path.is_absolute() || name.starts_with('/') {
        return Err(traversal());
    }
    for component in path.components() {
        if !matches!(component, Component::Normal(_) | Component::CurDir) {
            return Err(traversal());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UnitManifest;
    use rstest::rstest;

    fn sample() -> Artifact {
        let manifest = UnitManifest {
            name: "tools".to_string(),
            provider: "acme".to_string(),
            version: "1.0.0".to_string(),
            entry_point: "tools.wasm".to_string(),
            exports: vec!["add".to_string()],
        };
        let payload = BTreeMap::from([
            ("tools.wasm".to_string(), b"\0asm\x01\0\0\0".to_vec()),
            ("docs/README.md".to_string(), b"# tools".to_vec()),
        ]);
        Artifact::seal(manifest, payload).with_signature(vec![0xAB; 64])
    }

    fn raw_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, bytes) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_decode_restores_encoded_artifact() {
        let artifact = sample();
        let decoded = decode(&encode(&artifact).unwrap()).unwrap();
        assert_eq!(decoded, artifact);
        assert_eq!(decoded.computed_digest(), decoded.digest);
    }

    #[test]
    fn test_payload_is_stored_uncompressed() {
        let bytes = encode(&sample()).unwrap();
        assert!(bytes.windows(4).any(|w| w == b"\0asm"));
    }

    #[test]
    fn test_missing_manifest() {
        let bytes = raw_zip(&[("tools.wasm", b"\0asm")]);
        assert!(matches!(
            decode(&bytes),
            Err(ManifestError::MissingEntry(name)) if name == MANIFEST_FILE
        ));
    }

    #[test]
    fn test_missing_entry_point() {
        let artifact = sample();
        let manifest = serde_json::to_vec(&ManifestFile::from_artifact(&artifact)).unwrap();
        let bytes = raw_zip(&[(MANIFEST_FILE, &manifest)]);
        assert!(matches!(
            decode(&bytes),
            Err(ManifestError::MissingEntry(name)) if name == "tools.wasm"
        ));
    }

    #[test]
    fn test_not_a_zip() {
        assert!(matches!(
            decode(b"definitely not a zip"),
            Err(ManifestError::Container(_))
        ));
    }

    #[test]
    fn test_invalid_manifest_json() {
        let bytes = raw_zip(&[(MANIFEST_FILE, b"{"), ("tools.wasm", b"\0asm")]);
        assert!(matches!(decode(&bytes), Err(ManifestError::ParseError(_))));
    }

    #[rstest]
    #[case("../evil.wasm")]
    #[case("a/../../evil")]
    #[case("/etc/passwd")]
    #[case("dir\\evil")]
    fn test_rejects_path_traversal(#[case] bad_path: &str) {
        let bytes = raw_zip(&[(bad_path, b"x")]);
        assert!(matches!(
            decode(&bytes),
            Err(ManifestError::PathTraversal { .. })
        ));
    }

    #[rstest]
    #[case("tools.wasm")]
    #[case("lib/helpers.wasm")]
    #[case("./tools.wasm")]
    fn test_accepts_normal_paths(#[case] path: &str) {
        assert!(validate_entry_path(path).is_ok());
    }

    #[test]
    fn test_total_size_counts_bytes_read() {
        let limits = Limits {
            total_size: 100,
            ..LIMITS
        };
        let bytes = raw_zip(&[("a.wasm", &[0u8; 60]), ("b.wasm", &[0u8; 60])]);
        assert!(matches!(
            decode_within(&bytes, limits),
            Err(ManifestError::TooLarge { size: 120, max: 100, .. })
        ));
    }

    #[test]
    fn test_entry_size_limit() {
        let limits = Limits {
            entry_size: 16,
            ..LIMITS
        };
        let bytes = raw_zip(&[("a.wasm", &[0u8; 17])]);
        assert!(matches!(
            decode_within(&bytes, limits),
            Err(ManifestError::TooLarge { max: 16, .. })
        ));
    }

    #[test]
    fn test_entry_count_limit() {
        let limits = Limits {
            entries: 1,
            ..LIMITS
        };
        let bytes = raw_zip(&[("a.wasm", b"a"), ("b.wasm", b"b")]);
        assert!(matches!(
            decode_within(&bytes, limits),
            Err(ManifestError::Container(_))
        ));
    }
}
