// Copyright 2025 CloudTik Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration fingerprints.
//!
//! A fingerprint is the first 16 hex chars of the SHA-256 over a canonical
//! byte stream (object keys serialized in sorted order). The truncated form
//! is the tag value written to cloud providers, so the exact construction is
//! a compatibility contract.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};

/// Number of hex chars of the SHA-256 digest kept for tag values.
const FINGERPRINT_LEN: usize = 16;

/// Fingerprint of an arbitrary JSON-like configuration value.
pub fn config_fingerprint(value: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hash_canonical(value, &mut hasher);
    truncate_digest(hasher)
}

/// Fingerprint of the contents of the configured file mounts
/// (destination path to source path), stable under mount ordering.
///
/// Sources that do not exist contribute their path only, so a config
/// referring to a not-yet-created file still produces a stable value.
pub fn file_mounts_fingerprint(mounts: &BTreeMap<String, String>) -> io::Result<String> {
    let mut hasher = Sha256::new();
    for (destination, source) in mounts {
        hasher.update(destination.as_bytes());
        hasher.update([0u8]);
        hash_path(Path::new(source), &mut hasher)?;
    }
    Ok(truncate_digest(hasher))
}

fn truncate_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut hex = hex::encode(digest);
    hex.truncate(FINGERPRINT_LEN);
    hex
}

fn hash_canonical(value: &serde_json::Value, hasher: &mut Sha256) {
    match value {
        serde_json::Value::Null => hasher.update(b"null"),
        serde_json::Value::Bool(b) => hasher.update(if *b { b"true" as &[u8] } else { b"false" }),
        serde_json::Value::Number(n) => hasher.update(n.to_string().as_bytes()),
        serde_json::Value::String(s) => {
            hasher.update(b"\"");
            hasher.update(s.as_bytes());
            hasher.update(b"\"");
        }
        serde_json::Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                hash_canonical(item, hasher);
                hasher.update(b",");
            }
            hasher.update(b"]");
        }
        serde_json::Value::Object(map) => {
            // Do not rely on the serde_json map flavor: sort explicitly.
            let sorted: BTreeMap<&String, &serde_json::Value> = map.iter().collect();
            hasher.update(b"{");
            for (key, item) in sorted {
                hasher.update(key.as_bytes());
                hasher.update(b":");
                hash_canonical(item, hasher);
                hasher.update(b",");
            }
            hasher.update(b"}");
        }
    }
}

fn hash_path(path: &Path, hasher: &mut Sha256) -> io::Result<()> {
    hasher.update(path.to_string_lossy().as_bytes());
    hasher.update([0u8]);
    if path.is_file() {
        hasher.update(std::fs::read(path)?);
    } else if path.is_dir() {
        let mut entries: Vec<_> = std::fs::read_dir(path)?
            .collect::<io::Result<Vec<_>>>()?
            .into_iter()
            .map(|e| e.path())
            .collect();
        entries.sort();
        for entry in entries {
            hash_path(&entry, hasher)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serde_json::json;

    use super::*;

    #[test]
    fn test_fingerprint_is_key_order_independent() {
        let a = json!({"region": "us-east-1", "instance_type": "m4.large"});
        let b = json!({"instance_type": "m4.large", "region": "us-east-1"});
        assert_eq!(config_fingerprint(&a), config_fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_shape() {
        let fp = config_fingerprint(&json!({"a": 1}));
        assert_eq!(fp.len(), 16);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_changes_with_value() {
        let a = json!({"ssh_user": "ubuntu"});
        let b = json!({"ssh_user": "centos"});
        assert_ne!(config_fingerprint(&a), config_fingerprint(&b));
    }

    #[test]
    fn test_file_mounts_fingerprint_tracks_contents() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("conf");
        let mut f = std::fs::File::create(&file).unwrap();
        f.write_all(b"one").unwrap();

        let mounts = BTreeMap::from([(
            "/remote/conf".to_string(),
            file.to_string_lossy().into_owned(),
        )]);
        let before = file_mounts_fingerprint(&mounts).unwrap();

        std::fs::write(&file, b"two").unwrap();
        let after = file_mounts_fingerprint(&mounts).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_missing_mount_source_is_stable() {
        let mounts = BTreeMap::from([(
            "/remote/conf".to_string(),
            "/nonexistent/source/path".to_string(),
        )]);
        let first = file_mounts_fingerprint(&mounts).unwrap();
        let second = file_mounts_fingerprint(&mounts).unwrap();
        assert_eq!(first, second);
    }
}
