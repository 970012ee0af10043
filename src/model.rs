use chrono::NaiveDateTime;
use std::path::{Path, PathBuf};

/// How the effective date of an entity was determined upstream.
///
/// The engine does not extract dates itself; it only needs the provenance to
/// decide whether a date is UTC-anchored (JSON-derived timestamps are).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionMethod {
    /// Parsed from a JSON sidecar (exact, UTC).
    Json,
    /// Parsed from a JSON sidecar with relaxed filename matching (still UTC).
    JsonTryHard,
    /// Read from embedded EXIF.
    Exif,
    /// Guessed from the filename or filesystem timestamps.
    Guess,
    /// Derived from a year-named parent folder.
    FolderYear,
    /// No date could be determined.
    None,
}

/// A capture date/time already decided by the upstream pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectiveDate {
    /// Wall-clock timestamp. For UTC-anchored dates this is the UTC wall
    /// clock; for others it is whatever local reading the extractor produced.
    pub timestamp: NaiveDateTime,
    /// Set when the extractor knows the timestamp is UTC.
    pub utc: bool,
}

impl EffectiveDate {
    pub fn new(timestamp: NaiveDateTime, utc: bool) -> Self {
        Self { timestamp, utc }
    }

    /// A date is UTC-anchored if explicitly flagged or JSON-derived.
    pub fn is_utc_anchored(&self, method: ExtractionMethod) -> bool {
        self.utc || matches!(method, ExtractionMethod::Json | ExtractionMethod::JsonTryHard)
    }

    /// EXIF wall-clock representation (`YYYY:MM:DD HH:MM:SS`).
    pub fn exif_string(&self) -> String {
        self.timestamp.format("%Y:%m:%d %H:%M:%S").to_string()
    }
}

/// Whether a file is the entity's primary representation or a secondary copy.
///
/// Used only as a telemetry hint; files enqueued without a hint land in an
/// unsplit bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum FileRole {
    Primary,
    Secondary,
    #[default]
    Unknown,
}

/// A file on disk, as placed by the upstream pipeline.
#[derive(Debug, Clone)]
pub struct FileRef {
    /// Resolved output path. `None` means the file was never placed and must
    /// be skipped.
    pub target: Option<PathBuf>,
    /// Shortcut/symlink placeholders are skipped — there is nothing to patch.
    pub shortcut: bool,
    pub role: FileRole,
}

impl FileRef {
    pub fn primary(target: impl Into<PathBuf>) -> Self {
        Self {
            target: Some(target.into()),
            shortcut: false,
            role: FileRole::Primary,
        }
    }

    pub fn secondary(target: impl Into<PathBuf>) -> Self {
        Self {
            target: Some(target.into()),
            shortcut: false,
            role: FileRole::Secondary,
        }
    }

    /// Target path if this file is eligible for writing.
    pub fn eligible_target(&self) -> Option<&Path> {
        if self.shortcut {
            return None;
        }
        self.target.as_deref().filter(|p| p.exists())
    }
}

/// One logical photo or video, possibly materialized as several files.
#[derive(Debug, Clone)]
pub struct MediaEntity {
    pub primary: FileRef,
    pub secondaries: Vec<FileRef>,
    pub date: Option<EffectiveDate>,
    pub method: ExtractionMethod,
}

impl MediaEntity {
    pub fn new(primary: FileRef) -> Self {
        Self {
            primary,
            secondaries: Vec::new(),
            date: None,
            method: ExtractionMethod::None,
        }
    }

    pub fn with_date(mut self, date: EffectiveDate, method: ExtractionMethod) -> Self {
        self.date = Some(date);
        self.method = method;
        self
    }

    /// Primary first, then secondaries in submission order.
    pub fn files(&self) -> impl Iterator<Item = &FileRef> {
        std::iter::once(&self.primary).chain(self.secondaries.iter())
    }
}

/// The resolved collection handed to the engine by the upstream pipeline.
#[derive(Debug, Clone, Default)]
pub struct MediaCollection {
    pub entities: Vec<MediaEntity>,
}

impl MediaCollection {
    pub fn new(entities: Vec<MediaEntity>) -> Self {
        Self { entities }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// A GPS fix resolved from a sidecar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// `(0.0, 0.0)` sidecars mean "no fix recorded", not Null Island.
    pub fn is_zero(&self) -> bool {
        self.latitude == 0.0 && self.longitude == 0.0
    }

    pub fn latitude_ref(&self) -> char {
        if self.latitude >= 0.0 { 'N' } else { 'S' }
    }

    pub fn longitude_ref(&self) -> char {
        if self.longitude >= 0.0 { 'E' } else { 'W' }
    }
}

const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mov", "avi", "mkv", "webm", "m4v", "mpg", "mpeg", "wmv", "3gp", "mts", "m2ts",
];

const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "webp", "tif", "tiff", "heic", "heif", "avif", "gif", "bmp", "cr3",
    "cr2", "dng", "nef", "arw", "raf", "orf", "rw2", "pef", "srw",
];

fn ext_lower(path: &Path) -> Option<String> {
    path.extension().and_then(|e| e.to_str()).map(|e| e.to_lowercase())
}

/// True for extensions the engine treats as video (batch thresholds differ).
pub fn is_video(path: &Path) -> bool {
    ext_lower(path)
        .map(|e| VIDEO_EXTENSIONS.contains(&e.as_str()))
        .unwrap_or(false)
}

/// True for any media extension the engine knows about. Also the allowlist
/// used when recovering paths from tool diagnostics.
pub fn is_media_extension(ext: &str) -> bool {
    let ext = ext.to_lowercase();
    IMAGE_EXTENSIONS.contains(&ext.as_str()) || VIDEO_EXTENSIONS.contains(&ext.as_str())
}

/// True for the JPEG family — the one container the native patcher supports.
pub fn is_native_supported(path: &Path) -> bool {
    matches!(ext_lower(path).as_deref(), Some("jpg") | Some("jpeg"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn date(utc: bool) -> EffectiveDate {
        EffectiveDate::new(
            NaiveDate::from_ymd_opt(2023, 7, 4)
                .unwrap()
                .and_hms_opt(10, 15, 0)
                .unwrap(),
            utc,
        )
    }

    #[test]
    fn exif_string_format() {
        assert_eq!(date(false).exif_string(), "2023:07:04 10:15:00");
    }

    #[test]
    fn json_method_anchors_utc() {
        assert!(date(false).is_utc_anchored(ExtractionMethod::Json));
        assert!(date(false).is_utc_anchored(ExtractionMethod::JsonTryHard));
        assert!(!date(false).is_utc_anchored(ExtractionMethod::Exif));
        assert!(!date(false).is_utc_anchored(ExtractionMethod::Guess));
    }

    #[test]
    fn utc_flag_anchors_regardless_of_method() {
        assert!(date(true).is_utc_anchored(ExtractionMethod::Guess));
    }

    #[test]
    fn hemisphere_refs() {
        let c = Coordinates::new(40.6892, -74.0445);
        assert_eq!(c.latitude_ref(), 'N');
        assert_eq!(c.longitude_ref(), 'W');
        let c = Coordinates::new(-33.8568, 151.2153);
        assert_eq!(c.latitude_ref(), 'S');
        assert_eq!(c.longitude_ref(), 'E');
    }

    #[test]
    fn native_support_is_jpeg_only() {
        assert!(is_native_supported(Path::new("a.jpg")));
        assert!(is_native_supported(Path::new("a.JPEG")));
        assert!(!is_native_supported(Path::new("a.png")));
        assert!(!is_native_supported(Path::new("a.mp4")));
    }

    #[test]
    fn video_detection() {
        assert!(is_video(Path::new("clip.mp4")));
        assert!(is_video(Path::new("clip.MOV")));
        assert!(!is_video(Path::new("photo.jpg")));
    }

    #[test]
    fn shortcut_and_unresolved_files_are_ineligible() {
        let f = FileRef {
            target: None,
            shortcut: false,
            role: FileRole::Primary,
        };
        assert!(f.eligible_target().is_none());
        let f = FileRef {
            target: Some(PathBuf::from("/nonexistent/x.jpg")),
            shortcut: true,
            role: FileRole::Primary,
        };
        assert!(f.eligible_target().is_none());
    }
}
