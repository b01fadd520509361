//! `flasher_args.json` parsing.
//!
//! The manifest looks like:
//!
//! ```json
//! {
//!     "flash_settings": { "flash_mode": "dio", "flash_freq": "40m" },
//!     "flash_files": { "0x1000": "bootloader/bootloader.bin", "0x8000": "partition_table/partition-table.bin" },
//!     "bootloader": { "offset": "0x1000", "file": "bootloader/bootloader.bin", "encrypted": "false" }
//! }
//! ```
//!
//! `flash_files` drives the segment list; the per-image sections only
//! contribute the `encrypted` flag.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::warn;

use super::{ArtifactError, parse_int};

/// Fixed manifest name inside the binary directory.
pub const FLASH_ARGS_FILENAME: &str = "flasher_args.json";

/// One binary blob to be written at `offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashSegment {
    pub offset: u64,
    pub file_path: PathBuf,
    pub encrypted: bool,
}

/// Flash settings from the manifest plus the derived `encrypt` flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlashSettings {
    pub values: BTreeMap<String, String>,
    /// True iff any segment is encrypted.
    pub encrypt: bool,
}

impl FlashSettings {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// Parsed manifest: segments sorted by offset and the settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlashArgs {
    pub segments: Vec<FlashSegment>,
    pub settings: FlashSettings,
}

impl FlashArgs {
    /// Parse manifest text. Relative file paths are joined onto `binary_dir`.
    pub fn parse(text: &str, binary_dir: &Path, manifest: &Path) -> Result<Self, ArtifactError> {
        let invalid = |reason: String| ArtifactError::InvalidManifest {
            path: manifest.to_path_buf(),
            reason,
        };

        let root: Value = serde_json::from_str(text).map_err(|e| invalid(e.to_string()))?;
        let root = root
            .as_object()
            .ok_or_else(|| invalid("top level is not an object".into()))?;
        let files = root
            .get("flash_files")
            .and_then(Value::as_object)
            .ok_or_else(|| invalid("missing `flash_files` object".into()))?;

        let mut segments = Vec::with_capacity(files.len());
        for (offset_str, file) in files {
            let file = file
                .as_str()
                .ok_or_else(|| invalid(format!("flash file at {offset_str} is not a string")))?;
            let offset = parse_int(offset_str)
                .ok_or_else(|| invalid(format!("bad offset `{offset_str}`")))?;
            segments.push(FlashSegment {
                offset,
                file_path: binary_dir.join(file),
                encrypted: is_encrypted(root, offset_str, file),
            });
        }
        segments.sort_by_key(|s| s.offset);
        for offset in duplicate_offsets(&segments) {
            warn!(
                manifest = %manifest.display(),
                offset = format_args!("{offset:#x}"),
                "Several flash files share one offset"
            );
        }

        let mut values: BTreeMap<String, String> = root
            .get("flash_settings")
            .and_then(Value::as_object)
            .map(|settings| {
                settings
                    .iter()
                    .map(|(k, v)| {
                        let v = match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (k.clone(), v)
                    })
                    .collect()
            })
            .unwrap_or_default();
        let encrypt = segments.iter().any(|s| s.encrypted);
        values.insert("encrypt".into(), encrypt.to_string());

        Ok(Self {
            segments,
            settings: FlashSettings { values, encrypt },
        })
    }

    /// Read and parse the manifest at `path`.
    pub fn load(path: &Path, binary_dir: &Path) -> Result<Self, ArtifactError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text, binary_dir, path)
    }
}

/// Offsets used by more than one segment. `segments` must be sorted.
fn duplicate_offsets(segments: &[FlashSegment]) -> Vec<u64> {
    let mut dups: Vec<u64> = segments
        .windows(2)
        .filter(|w| w[0].offset == w[1].offset)
        .map(|w| w[0].offset)
        .collect();
    dups.dedup();
    dups
}

/// Look for a manifest section describing `(offset, file)` and report its
/// `encrypted` flag. Sections without the expected fields are skipped.
fn is_encrypted(root: &Map<String, Value>, offset: &str, file: &str) -> bool {
    for entry in root.values() {
        let Some(entry) = entry.as_object() else {
            continue;
        };
        let (Some(Value::String(o)), Some(Value::String(f))) = (entry.get("offset"), entry.get("file"))
        else {
            continue;
        };
        if o == offset && f == file {
            return matches!(entry.get("encrypted"), Some(Value::String(e)) if e == "true");
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"{
        "write_flash_args": ["--flash_mode", "dio"],
        "flash_settings": {"flash_mode": "dio", "flash_size": "2MB", "flash_freq": "40m"},
        "flash_files": {
            "0x10000": "hello_world.bin",
            "0x1000": "bootloader/bootloader.bin",
            "0x8000": "partition_table/partition-table.bin"
        },
        "bootloader": {"offset": "0x1000", "file": "bootloader/bootloader.bin", "encrypted": "false"},
        "app": {"offset": "0x10000", "file": "hello_world.bin", "encrypted": "true"},
        "partition-table": {"offset": "0x8000", "file": "partition_table/partition-table.bin"},
        "extra_esptool_args": {"after": "hard_reset", "chip": "esp32"}
    }"#;

    fn parse(text: &str) -> FlashArgs {
        FlashArgs::parse(text, Path::new("/build"), Path::new("/build/flasher_args.json")).unwrap()
    }

    #[test]
    fn test_segments_sorted_by_offset() {
        let args = parse(MANIFEST);
        let offsets: Vec<u64> = args.segments.iter().map(|s| s.offset).collect();
        assert_eq!(offsets, vec![0x1000, 0x8000, 0x10000]);
        assert_eq!(
            args.segments[1].file_path,
            Path::new("/build/partition_table/partition-table.bin")
        );
    }

    #[test]
    fn test_encrypted_flag_from_sections() {
        let args = parse(MANIFEST);
        let flags: Vec<bool> = args.segments.iter().map(|s| s.encrypted).collect();
        assert_eq!(flags, vec![false, false, true]);
        assert!(args.settings.encrypt);
        assert_eq!(args.settings.get("encrypt"), Some("true"));
        assert_eq!(args.settings.get("flash_mode"), Some("dio"));
    }

    #[test]
    fn test_encrypt_is_false_without_encrypted_sections() {
        let args = parse(
            r#"{"flash_settings": {"encrypt": "true"}, "flash_files": {"0x8000": "partition-table.bin"}}"#,
        );
        assert_eq!(args.segments.len(), 1);
        assert!(!args.segments[0].encrypted);
        assert!(!args.settings.encrypt);
        assert_eq!(args.settings.get("encrypt"), Some("false"));
    }

    #[test]
    fn test_same_offset_spelled_twice() {
        let args = parse(
            r#"{"flash_files": {"0x1000": "a.bin", "4096": "b.bin", "0x8000": "c.bin"}}"#,
        );
        assert_eq!(args.segments.len(), 3);
        assert_eq!(duplicate_offsets(&args.segments), vec![0x1000]);
        assert!(duplicate_offsets(&parse(MANIFEST).segments).is_empty());
    }

    #[test]
    fn test_invalid_manifests() {
        let manifest = Path::new("flasher_args.json");
        for text in ["not json", "[]", r#"{"flash_settings": {}}"#, r#"{"flash_files": {"zz": "a.bin"}}"#] {
            let err = FlashArgs::parse(text, Path::new("."), manifest).unwrap_err();
            assert!(matches!(err, ArtifactError::InvalidManifest { .. }), "{text}");
        }
    }
}
