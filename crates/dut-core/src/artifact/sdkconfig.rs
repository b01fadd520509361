//! `sdkconfig` (chip configuration) parsing.
//!
//! The file is a plain `KEY=VALUE` list produced by the firmware build.
//! Only lines with exactly one `=` carry a setting; comments such as
//! `# CONFIG_FOO is not set` are dropped along with anything else.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Key/value pairs read from an `sdkconfig` file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChipConfig {
    path: Option<PathBuf>,
    values: BTreeMap<String, String>,
}

impl ChipConfig {
    /// Parse the contents of an `sdkconfig` file.
    pub fn parse(text: &str) -> Self {
        let mut values = BTreeMap::new();
        for line in text.lines() {
            let mut parts = line.split('=');
            let (Some(key), Some(value), None) = (parts.next(), parts.next(), parts.next()) else {
                continue;
            };
            values.insert(
                key.trim().to_string(),
                value.trim_end().trim_matches('"').to_string(),
            );
        }
        Self { path: None, values }
    }

    /// Read and parse an `sdkconfig` file.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&text);
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Path the configuration was loaded from, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Candidate `sdkconfig` locations for a binary directory, in lookup order.
pub fn candidate_paths(binary_dir: &Path) -> [PathBuf; 2] {
    [
        binary_dir.join("..").join("sdkconfig"),
        binary_dir.join("sdkconfig"),
    ]
}

/// First existing `sdkconfig` for a binary directory.
pub fn find(binary_dir: &Path) -> Option<PathBuf> {
    candidate_paths(binary_dir)
        .into_iter()
        .find(|p| p.is_file())
        .map(|p| p.canonicalize().unwrap_or(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_strips_quotes_and_trailing_whitespace() {
        let config = ChipConfig::parse(
            "CONFIG_IDF_TARGET=\"esp32s3\"   \nCONFIG_FREERTOS_HZ=100\r\n",
        );
        assert_eq!(config.get("CONFIG_IDF_TARGET"), Some("esp32s3"));
        assert_eq!(config.get("CONFIG_FREERTOS_HZ"), Some("100"));
        assert_eq!(config.len(), 2);
    }

    #[test]
    fn test_parse_ignores_lines_without_exactly_one_equals() {
        let config = ChipConfig::parse(
            "#\n# CONFIG_BT_ENABLED is not set\nCONFIG_A=b=c\nCONFIG_EMPTY=\nplain text\n",
        );
        assert_eq!(config.get("CONFIG_A"), None);
        assert_eq!(config.get("CONFIG_EMPTY"), Some(""));
        assert_eq!(config.len(), 1);
    }

    #[test]
    fn test_find_prefers_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let build = dir.path().join("build");
        std::fs::create_dir(&build).unwrap();
        std::fs::write(build.join("sdkconfig"), "CONFIG_IDF_TARGET=\"esp32c3\"\n").unwrap();
        assert!(find(&build).unwrap().ends_with("build/sdkconfig"));

        std::fs::write(dir.path().join("sdkconfig"), "CONFIG_IDF_TARGET=\"esp32\"\n").unwrap();
        let found = find(&build).unwrap();
        assert!(!found.ends_with("build/sdkconfig"));
        assert_eq!(
            ChipConfig::load(&found).unwrap().get("CONFIG_IDF_TARGET"),
            Some("esp32")
        );
    }
}
