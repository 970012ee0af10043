//! External metadata tool boundary.
//!
//! exiftool reports failures only as unstructured text, so this module also
//! owns the diagnostic parsing that recovers implicated file paths from
//! stderr: tokens matching the media-extension allowlist or containing path
//! separators, with backslashes normalized to `/`.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;

use crate::model::is_media_extension;
use crate::tags::TagSet;

#[derive(Debug, Error)]
pub enum ToolError {
    /// The tool could not be started at all — a capability loss, not a
    /// per-file failure.
    #[error("metadata tool unavailable: {0}")]
    Unavailable(String),
    /// The tool ran and rejected the write.
    #[error("metadata tool failed: {stderr}")]
    Failed { stderr: String },
}

/// Capability contract for the external metadata tool. Absence of an
/// implementation disables all tool-based paths.
#[async_trait]
pub trait MetadataTool: Send + Sync {
    /// One direct call writing `tags` to one file.
    async fn write_single(&self, file: &Path, tags: &TagSet) -> Result<(), ToolError>;

    /// One call writing an identical tag set to many files.
    async fn write_batch(&self, files: &[PathBuf], tags: &TagSet) -> Result<(), ToolError>;

    /// Batch write with the argument list shipped through an args file, for
    /// batches that would blow the command line.
    async fn write_batch_via_argfile(
        &self,
        files: &[PathBuf],
        tags: &TagSet,
    ) -> Result<(), ToolError>;
}

/// Spawns the real `exiftool` binary.
pub struct ExifToolProcess {
    binary: PathBuf,
}

impl ExifToolProcess {
    pub fn new(binary: Option<PathBuf>) -> Self {
        Self {
            binary: binary.unwrap_or_else(|| PathBuf::from("exiftool")),
        }
    }

    /// Probe for the binary. Used once at engine start; a `None` tool
    /// disables batching rather than failing every file later.
    pub async fn probe(binary: Option<PathBuf>) -> Option<Self> {
        let tool = Self::new(binary);
        match Command::new(&tool.binary).arg("-ver").output().await {
            Ok(out) if out.status.success() => {
                let version = String::from_utf8_lossy(&out.stdout).trim().to_string();
                log::info!("exiftool {version} found");
                Some(tool)
            }
            _ => {
                log::warn!("exiftool not found — tool-based metadata writes disabled");
                None
            }
        }
    }

    fn tag_args(tags: &TagSet) -> Vec<String> {
        tags.iter().map(|(name, value)| format!("-{name}={value}")).collect()
    }

    async fn run(&self, args: Vec<String>) -> Result<(), ToolError> {
        let output = Command::new(&self.binary)
            .arg("-overwrite_original")
            .args(&args)
            .output()
            .await
            .map_err(|e| ToolError::Unavailable(e.to_string()))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(ToolError::Failed {
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        }
    }
}

#[async_trait]
impl MetadataTool for ExifToolProcess {
    async fn write_single(&self, file: &Path, tags: &TagSet) -> Result<(), ToolError> {
        let mut args = Self::tag_args(tags);
        args.push(file.to_string_lossy().into_owned());
        self.run(args).await
    }

    async fn write_batch(&self, files: &[PathBuf], tags: &TagSet) -> Result<(), ToolError> {
        let mut args = Self::tag_args(tags);
        args.extend(files.iter().map(|f| f.to_string_lossy().into_owned()));
        self.run(args).await
    }

    async fn write_batch_via_argfile(
        &self,
        files: &[PathBuf],
        tags: &TagSet,
    ) -> Result<(), ToolError> {
        let mut contents = String::new();
        for arg in Self::tag_args(tags) {
            contents.push_str(&arg);
            contents.push('\n');
        }
        for file in files {
            contents.push_str(&file.to_string_lossy());
            contents.push('\n');
        }

        let argfile = tempfile::Builder::new()
            .prefix("metastamp-args-")
            .suffix(".txt")
            .tempfile()
            .map_err(|e| ToolError::Unavailable(e.to_string()))?;
        tokio::fs::write(argfile.path(), contents)
            .await
            .map_err(|e| ToolError::Unavailable(e.to_string()))?;

        self.run(vec![
            "-@".to_string(),
            argfile.path().to_string_lossy().into_owned(),
        ])
        .await
    }
}

/// Recover file paths implicated by a failure diagnostic.
///
/// Heuristic by necessity: exiftool emits lines like
/// `Error: Bad IFD0 directory - /data/photo2.jpg`. A token counts as a path
/// when its extension is on the media allowlist, or when it contains a path
/// separator and any extension. Backslashes are normalized to `/`. A
/// path-like substring unrelated to an actual failing file can slip through;
/// mis-parsed entries only degrade to single-file writes.
pub fn parse_failed_paths(diagnostic: &str) -> Vec<PathBuf> {
    let mut paths = Vec::new();

    for line in diagnostic.lines() {
        // exiftool appends the file after " - "; prefer that span when
        // present so paths with spaces survive.
        let candidate = match line.rfind(" - ") {
            Some(idx) => line[idx + 3..].trim(),
            None => line.trim(),
        };

        if let Some(path) = path_candidate(candidate) {
            if !paths.contains(&path) {
                paths.push(path);
            }
            continue;
        }

        // Fall back to a token scan for diagnostics with other shapes.
        for token in line.split_whitespace() {
            if let Some(path) = path_candidate(token) {
                if !paths.contains(&path) {
                    paths.push(path);
                }
            }
        }
    }

    paths
}

fn path_candidate(token: &str) -> Option<PathBuf> {
    let token = token.trim_matches(|c| matches!(c, '"' | '\'' | ',' | ';'));
    if token.is_empty() {
        return None;
    }

    let normalized = token.replace('\\', "/");
    let ext = normalized.rsplit('.').next()?;
    if ext.len() > 5 || ext == normalized {
        return None;
    }

    let has_separator = normalized.contains('/');
    if is_media_extension(ext) || (has_separator && ext.chars().all(|c| c.is_ascii_alphanumeric()))
    {
        Some(PathBuf::from(normalized))
    } else {
        None
    }
}

/// The one structural defect treated as benign at single-file granularity
/// and as an XMP-fallback trigger at batch granularity: a truncated
/// sub-directory (typically the interoperability IFD) in the classic
/// metadata structure. exiftool sometimes shortens the message to just
/// "truncated", so the directory name is not required.
pub fn is_truncated_interop(diagnostic: &str) -> bool {
    diagnostic.to_lowercase().contains("truncated")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovers_path_after_dash_separator() {
        let diag = "Error: truncated InteropIFD directory - /data/photo2.jpg";
        assert_eq!(parse_failed_paths(diag), vec![PathBuf::from("/data/photo2.jpg")]);
    }

    #[test]
    fn recovers_multiple_paths_across_lines() {
        let diag = "Error: Bad format (0) - /out/a.jpg\nWarning: minor - /out/b.mp4\n1 files updated";
        let paths = parse_failed_paths(diag);
        assert_eq!(
            paths,
            vec![PathBuf::from("/out/a.jpg"), PathBuf::from("/out/b.mp4")]
        );
    }

    #[test]
    fn normalizes_backslashes() {
        let diag = r"Error: File format error - C:\photos\trip\img_01.jpg";
        assert_eq!(
            parse_failed_paths(diag),
            vec![PathBuf::from("C:/photos/trip/img_01.jpg")]
        );
    }

    #[test]
    fn ignores_pathless_noise() {
        assert!(parse_failed_paths("Error: Format error in file").is_empty());
        assert!(parse_failed_paths("3 image files updated").is_empty());
        assert!(parse_failed_paths("").is_empty());
    }

    #[test]
    fn deduplicates_repeated_paths() {
        let diag = "Error: x - /a/f.jpg\nError: y - /a/f.jpg";
        assert_eq!(parse_failed_paths(diag).len(), 1);
    }

    #[test]
    fn separator_heuristic_accepts_unknown_extensions() {
        // Not on the media allowlist, but clearly path-shaped.
        let diag = "Error: bad thing - /data/file.xyz";
        assert_eq!(parse_failed_paths(diag), vec![PathBuf::from("/data/file.xyz")]);
    }

    #[test]
    fn truncated_interop_detection() {
        assert!(is_truncated_interop("Error: truncated InteropIFD directory - /a.jpg"));
        assert!(is_truncated_interop("TRUNCATED INTEROPIFD"));
        assert!(is_truncated_interop("Error: truncated - /data/photo2.jpg"));
        assert!(!is_truncated_interop("Error: Bad format (0)"));
    }

    #[test]
    fn tag_args_render_values() {
        use crate::tags::{TagSet, TagValue};
        let mut tags = TagSet::new();
        tags.set("GPSLatitude", TagValue::Num(40.6892));
        tags.set("GPSLatitudeRef", TagValue::Str("N".into()));
        tags.set("DateTimeOriginal", TagValue::Quoted("2023:07:04 10:15:00".into()));
        let args = ExifToolProcess::tag_args(&tags);
        assert_eq!(
            args,
            vec![
                "-DateTimeOriginal=2023:07:04 10:15:00",
                "-GPSLatitude=40.6892",
                "-GPSLatitudeRef=N",
            ]
        );
    }
}
