//! Per-file decision of which metadata tags to write and in what namespace.
//!
//! Classic (EXIF-like) tags carry unsigned GPS decimals plus separate
//! hemisphere-letter reference fields; the XMP fallback namespace carries
//! signed decimals and no reference fields. Dates are UTC-anchored when the
//! extractor knows the timestamp is UTC — anchored dates get explicit
//! zero-offset timezone tags so downstream tools do not reinterpret them.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;

use crate::config::Config;
use crate::model::{Coordinates, EffectiveDate, ExtractionMethod, is_native_supported};

/// Formats the external tool cannot reliably write; skipped unless forced.
const UNSUPPORTED_FORMATS: &[&str] = &["avi", "mpg", "mpeg", "bmp", "wmv"];

/// A tag value, kept loosely shaped (name → value) for grouping but with the
/// value type made explicit.
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    /// Bare string (reference letters, offsets).
    Str(String),
    /// Decimal number (signed or unsigned coordinates).
    Num(f64),
    /// String that must survive whitespace intact (timestamps).
    Quoted(String),
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Str(s) | TagValue::Quoted(s) => f.write_str(s),
            TagValue::Num(n) => write!(f, "{n}"),
        }
    }
}

/// Pending metadata for one file: tag name → value, sorted by name so the
/// grouping key is insertion-order independent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagSet {
    tags: BTreeMap<String, TagValue>,
}

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: TagValue) {
        self.tags.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&TagValue> {
        self.tags.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<TagValue> {
        self.tags.remove(name)
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TagValue)> {
        self.tags.iter()
    }

    /// Stable serialization used to group byte-identical pending writes into
    /// one tool invocation. Equal as key/value sets ⇒ equal keys.
    pub fn group_key(&self) -> String {
        let mut key = String::new();
        for (name, value) in &self.tags {
            key.push_str(name);
            key.push('=');
            key.push_str(&value.to_string());
            key.push('\n');
        }
        key
    }

    /// True if any date tag is present (either namespace).
    pub fn has_date(&self) -> bool {
        self.tags
            .keys()
            .any(|k| k == "DateTimeOriginal" || k == "XMP:DateTimeOriginal")
    }

    /// True if any GPS tag is present (either namespace).
    pub fn has_gps(&self) -> bool {
        self.tags
            .keys()
            .any(|k| k == "GPSLatitude" || k == "XMP:GPSLatitude")
    }
}

/// Files whose classic EXIF structure is defective and which must be written
/// through the XMP namespace for the rest of the run. Keys are lower-cased
/// path strings.
#[derive(Debug, Default)]
pub struct ForceXmpRegistry {
    paths: HashSet<String>,
}

impl ForceXmpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(path: &Path) -> String {
        path.to_string_lossy().to_lowercase()
    }

    pub fn register(&mut self, path: &Path) {
        self.paths.insert(Self::key(path));
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.paths.contains(&Self::key(path))
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }
}

/// Outcome of compiling tags for one file.
#[derive(Debug, Clone, Default)]
pub struct CompiledTags {
    /// Tags to hand to the tool path. Empty when everything was satisfied
    /// natively or there was nothing to write.
    pub tags: TagSet,
    /// Date already persisted by the native patcher.
    pub date_native: bool,
    /// GPS already persisted by the native patcher.
    pub gps_native: bool,
}

/// True when the format is in the fixed unsupported set for tool writes.
pub fn is_unsupported_format(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| UNSUPPORTED_FORMATS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Apply the unsupported-format gate. Returns `false` when the file must be
/// skipped for tool-based writes.
pub fn passes_format_gate(path: &Path, config: &Config) -> bool {
    if !is_unsupported_format(path) || config.force_unsupported {
        return true;
    }
    if !config.silence_unsupported {
        log::warn!(
            "Metadata writing unsupported for {} — skipping (enable force_unsupported to override)",
            path.display()
        );
    }
    false
}

/// Compile the tool-path tags for one file.
///
/// `date_native`/`gps_native` report what the native patcher already wrote
/// for this file so the tool path does not duplicate it.
pub fn compile_tags(
    path: &Path,
    date: Option<&EffectiveDate>,
    method: ExtractionMethod,
    coords: Option<&Coordinates>,
    force_xmp: &ForceXmpRegistry,
    date_native: bool,
    gps_native: bool,
) -> CompiledTags {
    let use_xmp = force_xmp.contains(path) || !is_native_supported(path) && wants_xmp(path);
    let mut tags = TagSet::new();

    if let Some(date) = date {
        if !date_native {
            let anchored = date.is_utc_anchored(method);
            if use_xmp {
                set_xmp_date_tags(&mut tags, date, anchored);
            } else {
                set_classic_date_tags(&mut tags, date, anchored);
            }
        }
    }

    if let Some(coords) = coords {
        if !gps_native && !coords.is_zero() {
            if use_xmp {
                set_xmp_gps_tags(&mut tags, coords);
            } else {
                set_classic_gps_tags(&mut tags, coords);
            }
        }
    }

    CompiledTags {
        tags,
        date_native,
        gps_native,
    }
}

/// PNG-family images have no classic EXIF container worth targeting; they go
/// straight to the XMP namespace.
fn wants_xmp(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .as_deref(),
        Some("png") | Some("gif") | Some("bmp")
    )
}

fn set_classic_date_tags(tags: &mut TagSet, date: &EffectiveDate, anchored: bool) {
    let stamp = date.exif_string();
    tags.set("DateTimeOriginal", TagValue::Quoted(stamp.clone()));
    tags.set("CreateDate", TagValue::Quoted(stamp.clone()));
    tags.set("ModifyDate", TagValue::Quoted(stamp));
    if anchored {
        tags.set("OffsetTimeOriginal", TagValue::Str("+00:00".into()));
        tags.set("OffsetTimeDigitized", TagValue::Str("+00:00".into()));
        tags.set("OffsetTime", TagValue::Str("+00:00".into()));
    }
}

fn set_xmp_date_tags(tags: &mut TagSet, date: &EffectiveDate, anchored: bool) {
    let stamp = if anchored {
        format!("{}+00:00", date.exif_string())
    } else {
        date.exif_string()
    };
    tags.set("XMP:DateTimeOriginal", TagValue::Quoted(stamp.clone()));
    tags.set("XMP:CreateDate", TagValue::Quoted(stamp.clone()));
    tags.set("XMP:ModifyDate", TagValue::Quoted(stamp));
}

fn set_classic_gps_tags(tags: &mut TagSet, coords: &Coordinates) {
    tags.set("GPSLatitude", TagValue::Num(coords.latitude.abs()));
    tags.set("GPSLatitudeRef", TagValue::Str(coords.latitude_ref().to_string()));
    tags.set("GPSLongitude", TagValue::Num(coords.longitude.abs()));
    tags.set(
        "GPSLongitudeRef",
        TagValue::Str(coords.longitude_ref().to_string()),
    );
}

fn set_xmp_gps_tags(tags: &mut TagSet, coords: &Coordinates) {
    tags.set("XMP:GPSLatitude", TagValue::Num(coords.latitude));
    tags.set("XMP:GPSLongitude", TagValue::Num(coords.longitude));
}

/// Rewrite a pending classic TagSet into the XMP namespace: date fields move
/// under the XMP prefix, GPS becomes signed decimals and the reference fields
/// are dropped.
pub fn rewrite_to_xmp(tags: &TagSet) -> TagSet {
    let mut out = TagSet::new();

    for (name, value) in tags.iter() {
        match name.as_str() {
            "DateTimeOriginal" | "CreateDate" | "ModifyDate" => {
                out.set(format!("XMP:{name}"), value.clone());
            }
            // Offset tags fold into the XMP timestamps below.
            "OffsetTimeOriginal" | "OffsetTimeDigitized" | "OffsetTime" => {}
            "GPSLatitudeRef" | "GPSLongitudeRef" => {}
            "GPSLatitude" | "GPSLongitude" => {}
            other if other.starts_with("XMP:") => {
                out.set(other.to_string(), value.clone());
            }
            other => {
                out.set(other.to_string(), value.clone());
            }
        }
    }

    // Anchored classic sets carried explicit zero offsets; preserve the
    // anchoring in the XMP timestamp strings.
    let anchored = tags.get("OffsetTime").is_some();
    if anchored {
        for key in ["XMP:DateTimeOriginal", "XMP:CreateDate", "XMP:ModifyDate"] {
            if let Some(TagValue::Quoted(s)) = out.get(key).cloned() {
                if !s.ends_with("+00:00") {
                    out.set(key, TagValue::Quoted(format!("{s}+00:00")));
                }
            }
        }
    }

    // Re-sign the coordinates from the dropped reference letters.
    if let (Some(TagValue::Num(lat)), Some(lat_ref)) =
        (tags.get("GPSLatitude"), tags.get("GPSLatitudeRef"))
    {
        let signed = if lat_ref.to_string() == "S" { -lat } else { *lat };
        out.set("XMP:GPSLatitude", TagValue::Num(signed));
    }
    if let (Some(TagValue::Num(lon)), Some(lon_ref)) =
        (tags.get("GPSLongitude"), tags.get("GPSLongitudeRef"))
    {
        let signed = if lon_ref.to_string() == "W" { -lon } else { *lon };
        out.set("XMP:GPSLongitude", TagValue::Num(signed));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn date() -> EffectiveDate {
        EffectiveDate::new(
            NaiveDate::from_ymd_opt(2023, 7, 4)
                .unwrap()
                .and_hms_opt(10, 15, 0)
                .unwrap(),
            false,
        )
    }

    #[test]
    fn group_key_is_insertion_order_independent() {
        let mut a = TagSet::new();
        a.set("DateTimeOriginal", TagValue::Quoted("2023:07:04 10:15:00".into()));
        a.set("GPSLatitude", TagValue::Num(40.6892));

        let mut b = TagSet::new();
        b.set("GPSLatitude", TagValue::Num(40.6892));
        b.set("DateTimeOriginal", TagValue::Quoted("2023:07:04 10:15:00".into()));

        assert_eq!(a.group_key(), b.group_key());
        assert_eq!(a, b);
    }

    #[test]
    fn differing_values_produce_different_keys() {
        let mut a = TagSet::new();
        a.set("GPSLatitude", TagValue::Num(40.0));
        let mut b = TagSet::new();
        b.set("GPSLatitude", TagValue::Num(41.0));
        assert_ne!(a.group_key(), b.group_key());
    }

    #[test]
    fn json_dates_get_zero_offset_tags() {
        let registry = ForceXmpRegistry::new();
        let compiled = compile_tags(
            Path::new("img_0001.jpg"),
            Some(&date()),
            ExtractionMethod::Json,
            None,
            &registry,
            false,
            false,
        );
        assert_eq!(
            compiled.tags.get("DateTimeOriginal"),
            Some(&TagValue::Quoted("2023:07:04 10:15:00".into()))
        );
        assert_eq!(
            compiled.tags.get("OffsetTimeOriginal"),
            Some(&TagValue::Str("+00:00".into()))
        );
        assert_eq!(
            compiled.tags.get("OffsetTime"),
            Some(&TagValue::Str("+00:00".into()))
        );
    }

    #[test]
    fn guessed_dates_have_no_offset_tags() {
        let registry = ForceXmpRegistry::new();
        let compiled = compile_tags(
            Path::new("img_0001.jpg"),
            Some(&date()),
            ExtractionMethod::Guess,
            None,
            &registry,
            false,
            false,
        );
        assert!(compiled.tags.get("DateTimeOriginal").is_some());
        assert!(compiled.tags.get("OffsetTime").is_none());
    }

    #[test]
    fn classic_gps_is_unsigned_with_refs() {
        let registry = ForceXmpRegistry::new();
        let coords = Coordinates::new(40.6892, -74.0445);
        let compiled = compile_tags(
            Path::new("img_0001.jpg"),
            None,
            ExtractionMethod::None,
            Some(&coords),
            &registry,
            false,
            false,
        );
        assert_eq!(compiled.tags.get("GPSLatitude"), Some(&TagValue::Num(40.6892)));
        assert_eq!(compiled.tags.get("GPSLongitude"), Some(&TagValue::Num(74.0445)));
        assert_eq!(
            compiled.tags.get("GPSLatitudeRef"),
            Some(&TagValue::Str("N".into()))
        );
        assert_eq!(
            compiled.tags.get("GPSLongitudeRef"),
            Some(&TagValue::Str("W".into()))
        );
    }

    #[test]
    fn force_xmp_registry_redirects_namespace() {
        let mut registry = ForceXmpRegistry::new();
        registry.register(Path::new("/data/Photo2.JPG"));
        // Lookup is case-insensitive.
        assert!(registry.contains(Path::new("/data/photo2.jpg")));

        let coords = Coordinates::new(-33.8568, 151.2153);
        let compiled = compile_tags(
            Path::new("/data/Photo2.JPG"),
            Some(&date()),
            ExtractionMethod::Json,
            Some(&coords),
            &registry,
            false,
            false,
        );
        assert_eq!(
            compiled.tags.get("XMP:GPSLatitude"),
            Some(&TagValue::Num(-33.8568))
        );
        assert!(compiled.tags.get("GPSLatitudeRef").is_none());
        assert_eq!(
            compiled.tags.get("XMP:DateTimeOriginal"),
            Some(&TagValue::Quoted("2023:07:04 10:15:00+00:00".into()))
        );
    }

    #[test]
    fn zero_coordinates_are_dropped() {
        let registry = ForceXmpRegistry::new();
        let coords = Coordinates::new(0.0, 0.0);
        let compiled = compile_tags(
            Path::new("img.jpg"),
            None,
            ExtractionMethod::None,
            Some(&coords),
            &registry,
            false,
            false,
        );
        assert!(compiled.tags.is_empty());
    }

    #[test]
    fn natively_satisfied_fields_are_not_duplicated() {
        let registry = ForceXmpRegistry::new();
        let coords = Coordinates::new(40.0, -74.0);
        let compiled = compile_tags(
            Path::new("img.jpg"),
            Some(&date()),
            ExtractionMethod::Json,
            Some(&coords),
            &registry,
            true,
            true,
        );
        assert!(compiled.tags.is_empty());
        assert!(compiled.date_native);
        assert!(compiled.gps_native);
    }

    #[test]
    fn rewrite_to_xmp_signs_coordinates_and_drops_refs() {
        let mut tags = TagSet::new();
        set_classic_date_tags(&mut tags, &date(), true);
        set_classic_gps_tags(&mut tags, &Coordinates::new(-33.8568, 151.2153));

        let xmp = rewrite_to_xmp(&tags);
        assert_eq!(xmp.get("XMP:GPSLatitude"), Some(&TagValue::Num(-33.8568)));
        assert_eq!(xmp.get("XMP:GPSLongitude"), Some(&TagValue::Num(151.2153)));
        assert!(xmp.get("GPSLatitudeRef").is_none());
        assert!(xmp.get("GPSLatitude").is_none());
        assert_eq!(
            xmp.get("XMP:DateTimeOriginal"),
            Some(&TagValue::Quoted("2023:07:04 10:15:00+00:00".into()))
        );
        assert!(xmp.get("OffsetTime").is_none());
    }

    #[test]
    fn unsupported_gate() {
        let mut config = Config::default();
        assert!(!passes_format_gate(Path::new("old.avi"), &config));
        assert!(passes_format_gate(Path::new("img.jpg"), &config));
        config.force_unsupported = true;
        assert!(passes_format_gate(Path::new("old.avi"), &config));
    }

    #[test]
    fn category_detection_on_tagsets() {
        let registry = ForceXmpRegistry::new();
        let compiled = compile_tags(
            Path::new("a.jpg"),
            Some(&date()),
            ExtractionMethod::Guess,
            None,
            &registry,
            false,
            false,
        );
        assert!(compiled.tags.has_date());
        assert!(!compiled.tags.has_gps());

        let c2 = compile_tags(
            Path::new("a.png"),
            Some(&date()),
            ExtractionMethod::Guess,
            Some(&Coordinates::new(1.0, 2.0)),
            &registry,
            false,
            false,
        );
        assert!(c2.tags.has_date());
        assert!(c2.tags.has_gps());
    }
}
