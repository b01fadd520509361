//! Build artifact descriptor.
//!
//! Given an application directory, locates the build output and derives
//! everything a test needs to know about the firmware: the ELF file, the
//! chip configuration, the flash layout and the partition table.
//!
//! Missing pieces are not errors. A build directory without a manifest
//! simply produces an artifact with no flash segments. The only fatal
//! derivation failure is a partition table that cannot be decoded while
//! flash segments are present.

pub mod flash_args;
pub mod partition;
pub mod sdkconfig;

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

pub use flash_args::{FLASH_ARGS_FILENAME, FlashArgs, FlashSegment, FlashSettings};
pub use partition::{DecodeError, PartitionEntry, PartitionTable, PartitionTool};
pub use sdkconfig::ChipConfig;

/// Target chip assumed when `sdkconfig` does not name one.
pub const DEFAULT_TARGET: &str = "esp32";

/// Environment variable holding the IDF root.
pub const IDF_PATH_ENV: &str = "IDF_PATH";

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("App path not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Invalid flash manifest {}: {reason}", path.display())]
    InvalidManifest { path: PathBuf, reason: String },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Knobs for artifact resolution.
#[derive(Debug, Clone)]
pub struct ArtifactOptions {
    /// Explicit partition tool, overrides the `idf_path` lookup.
    pub part_tool: Option<PathBuf>,
    /// IDF root used to find the default partition tool.
    pub idf_path: Option<PathBuf>,
    /// Interpreter for `.py` tools.
    pub python: String,
}

impl Default for ArtifactOptions {
    fn default() -> Self {
        Self {
            part_tool: None,
            idf_path: None,
            python: "python3".to_string(),
        }
    }
}

impl ArtifactOptions {
    /// Defaults with `idf_path` taken from `$IDF_PATH`.
    pub fn from_env() -> Self {
        Self {
            idf_path: std::env::var_os(IDF_PATH_ENV).map(PathBuf::from),
            ..Default::default()
        }
    }
}

/// Everything derived from one build directory. Read-only once built.
#[derive(Debug, Clone)]
pub struct BuildArtifact {
    app_path: PathBuf,
    binary_dir: Option<PathBuf>,
    elf_file: Option<PathBuf>,
    part_tool: Option<PartitionTool>,
    sdkconfig: Option<ChipConfig>,
    flash_files: Option<Vec<FlashSegment>>,
    flash_settings: Option<FlashSettings>,
    partition_table: Option<PartitionTable>,
    target: String,
}

impl BuildArtifact {
    /// Resolve `app_path` with options from the environment.
    pub fn resolve(app_path: impl AsRef<Path>) -> Result<Self, ArtifactError> {
        Self::resolve_with(app_path, &ArtifactOptions::from_env())
    }

    #[instrument(skip_all, fields(app_path = %app_path.as_ref().display()))]
    pub fn resolve_with(
        app_path: impl AsRef<Path>,
        options: &ArtifactOptions,
    ) -> Result<Self, ArtifactError> {
        let app_path = app_path.as_ref();
        if !app_path.exists() {
            return Err(ArtifactError::NotFound(app_path.to_path_buf()));
        }

        let mut artifact = Self {
            app_path: app_path.to_path_buf(),
            binary_dir: None,
            elf_file: None,
            part_tool: None,
            sdkconfig: None,
            flash_files: None,
            flash_settings: None,
            partition_table: None,
            target: DEFAULT_TARGET.to_string(),
        };

        let build = app_path.join("build");
        if !build.is_dir() {
            warn!(path = %build.display(), "Build directory does not exist");
            return Ok(artifact);
        }
        let binary_dir = build.canonicalize()?;

        artifact.elf_file = find_elf(&binary_dir)?;
        artifact.part_tool = PartitionTool::locate(
            options.part_tool.as_deref(),
            options.idf_path.as_deref(),
            &options.python,
        );

        if let Some(path) = sdkconfig::find(&binary_dir) {
            debug!(path = %path.display(), "Loading sdkconfig");
            artifact.sdkconfig = Some(ChipConfig::load(&path)?);
        }

        let manifest = binary_dir.join(FLASH_ARGS_FILENAME);
        if manifest.is_file() {
            let args = FlashArgs::load(&manifest, &binary_dir)?;
            artifact.flash_files = Some(args.segments);
            artifact.flash_settings = Some(args.settings);
        } else {
            debug!(path = %manifest.display(), "No flash manifest");
        }

        if let (Some(tool), Some(segments)) = (&artifact.part_tool, &artifact.flash_files)
            && !segments.is_empty()
        {
            artifact.partition_table = Some(tool.decode(segments, &binary_dir)?);
        }

        if let Some(target) = artifact
            .sdkconfig
            .as_ref()
            .and_then(|c| c.get("CONFIG_IDF_TARGET"))
        {
            artifact.target = target.to_string();
        }

        artifact.binary_dir = Some(binary_dir);

        info!(
            target = %artifact.target,
            elf = ?artifact.elf_file,
            segments = artifact.flash_files.as_ref().map_or(0, Vec::len),
            partitions = artifact.partition_table.as_ref().map_or(0, PartitionTable::len),
            "Resolved build artifact"
        );
        Ok(artifact)
    }

    pub fn app_path(&self) -> &Path {
        &self.app_path
    }

    pub fn binary_dir(&self) -> Option<&Path> {
        self.binary_dir.as_deref()
    }

    pub fn elf_file(&self) -> Option<&Path> {
        self.elf_file.as_deref()
    }

    pub fn part_tool(&self) -> Option<&PartitionTool> {
        self.part_tool.as_ref()
    }

    pub fn sdkconfig(&self) -> Option<&ChipConfig> {
        self.sdkconfig.as_ref()
    }

    pub fn flash_files(&self) -> Option<&[FlashSegment]> {
        self.flash_files.as_deref()
    }

    pub fn flash_settings(&self) -> Option<&FlashSettings> {
        self.flash_settings.as_ref()
    }

    pub fn partition_table(&self) -> Option<&PartitionTable> {
        self.partition_table.as_ref()
    }

    /// Look up a partition by name.
    pub fn partition(&self, name: &str) -> Option<&PartitionEntry> {
        self.partition_table.as_ref()?.get(name)
    }

    /// Whether any flash segment is encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.flash_settings.as_ref().is_some_and(|s| s.encrypt)
    }

    /// Target chip, e.g. `esp32s3`.
    pub fn target(&self) -> &str {
        &self.target
    }
}

/// First `.elf` entry in directory order. Which one wins when there are
/// several is whatever the filesystem enumerates first.
fn find_elf(binary_dir: &Path) -> std::io::Result<Option<PathBuf>> {
    for entry in std::fs::read_dir(binary_dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == "elf") {
            return Ok(Some(path.canonicalize().unwrap_or(path)));
        }
    }
    Ok(None)
}

/// Parse an unsigned integer literal with an optional `0x`, `0o` or `0b`
/// prefix; plain literals are decimal.
pub(crate) fn parse_int(s: &str) -> Option<u64> {
    let s = s.trim();
    let (digits, radix) = match s.get(..2) {
        Some("0x" | "0X") => (&s[2..], 16),
        Some("0o" | "0O") => (&s[2..], 8),
        Some("0b" | "0B") => (&s[2..], 2),
        _ => (s, 10),
    };
    let digits = digits.replace('_', "");
    if digits.is_empty() || digits.starts_with(['+', '-']) {
        return None;
    }
    u64::from_str_radix(&digits, radix).ok()
}
