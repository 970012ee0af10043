//! In-process EXIF patching for the JPEG container family.
//!
//! Existing EXIF is parsed with little_exif, the requested fields are set by
//! tag id, and the rebuilt TIFF block is re-injected into an in-memory copy
//! of the original bytes with img-parts.
//! Write-back only happens after re-injection succeeds, so a failed attempt
//! leaves the original file untouched. The file's modification time is
//! restored after a successful write.

use img_parts::Bytes;
use img_parts::ImageEXIF;
use img_parts::jpeg::Jpeg;
use little_exif::endian::Endian;
use little_exif::exif_tag::{ExifTag, ExifTagGroup};
use little_exif::exif_tag_format::ExifTagFormat;
use little_exif::filetype::FileExtension;
use little_exif::metadata::Metadata;
use std::path::Path;
use std::time::SystemTime;
use thiserror::Error;

use crate::model::{Coordinates, EffectiveDate};

// Date fields, written redundantly.
const TAG_MODIFY_DATE: u16 = 0x0132; // IFD0
const TAG_DATETIME_ORIGINAL: u16 = 0x9003; // ExifIFD
const TAG_CREATE_DATE: u16 = 0x9004; // ExifIFD

// GPS fields: decimal-derived rationals plus hemisphere-letter refs.
const TAG_GPS_LATITUDE_REF: u16 = 0x0001;
const TAG_GPS_LATITUDE: u16 = 0x0002;
const TAG_GPS_LONGITUDE_REF: u16 = 0x0003;
const TAG_GPS_LONGITUDE: u16 = 0x0004;

// little_exif as_u8_vec(JPEG) returns: [APP1 marker 2B][length 2B][Exif\0\0 6B][TIFF data]
// img-parts set_exif() expects just the TIFF data (after Exif\0\0)
const JPEG_EXIF_OVERHEAD: usize = 10; // 2 + 2 + 6

#[derive(Debug, Error)]
enum NativeError {
    #[error("failed to decode embedded metadata: {0}")]
    Decode(String),
    #[error("failed to re-inject metadata: {0}")]
    Inject(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Write the capture date into the file's EXIF block. Returns `false` and
/// logs a warning on any internal failure.
pub fn write_date(path: &Path, date: &EffectiveDate) -> bool {
    patch(path, Some(date), None)
}

/// Write a GPS fix into the file's EXIF block.
pub fn write_gps(path: &Path, coords: &Coordinates) -> bool {
    patch(path, None, Some(coords))
}

/// Write date and GPS in one pass.
pub fn write_combined(path: &Path, date: &EffectiveDate, coords: &Coordinates) -> bool {
    patch(path, Some(date), Some(coords))
}

fn patch(path: &Path, date: Option<&EffectiveDate>, coords: Option<&Coordinates>) -> bool {
    match patch_inner(path, date, coords) {
        Ok(()) => true,
        Err(e) => {
            log::warn!("Native EXIF write failed for {}: {e}", path.display());
            false
        }
    }
}

fn patch_inner(
    path: &Path,
    date: Option<&EffectiveDate>,
    coords: Option<&Coordinates>,
) -> Result<(), NativeError> {
    let file_bytes = std::fs::read(path)?;
    let mtime = std::fs::metadata(path)?.modified().ok();

    // Parse JPEG structure with img-parts (preserves all segments)
    let mut jpeg = Jpeg::from_bytes(Bytes::from(file_bytes))
        .map_err(|e| NativeError::Decode(e.to_string()))?;
    let orig_exif_pos = find_exif_segment_pos(&jpeg);

    // Decode any existing EXIF; a file without a parseable block gets a
    // fresh one.
    let mut metadata = match load_metadata(path) {
        Some(m) => m,
        None => Metadata::new(),
    };

    for tag in build_tags(date, coords) {
        metadata.set_tag(tag);
    }

    let exif_bytes = metadata.as_u8_vec(FileExtension::JPEG);
    if exif_bytes.len() <= JPEG_EXIF_OVERHEAD {
        return Err(NativeError::Inject("re-encoded EXIF block is empty".into()));
    }
    let tiff_data = exif_bytes[JPEG_EXIF_OVERHEAD..].to_vec();

    jpeg.set_exif(Some(Bytes::from(tiff_data)));

    // set_exif() inserts at a fixed position, which may land after an XMP
    // APP1. Move the EXIF segment back ahead of it so parsers that require
    // EXIF-before-XMP keep working.
    if let Some(new_pos) = find_exif_segment_pos(&jpeg) {
        let target_pos = orig_exif_pos.unwrap_or(1); // default: right after APP0
        if target_pos < new_pos {
            let segments = jpeg.segments_mut();
            let seg = segments.remove(new_pos);
            segments.insert(target_pos, seg);
        }
    }

    let output = jpeg.encoder().bytes();
    std::fs::write(path, &output)?;
    restore_mtime(path, mtime);
    Ok(())
}

/// Decode existing EXIF from the file. little_exif can panic on malformed
/// input; treat a panic the same as a parse failure.
fn load_metadata(path: &Path) -> Option<Metadata> {
    let owned = path.to_path_buf();
    let prev_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(|_| {}));
    let result = std::panic::catch_unwind(move || Metadata::new_from_path(&owned));
    std::panic::set_hook(prev_hook);

    match result {
        Ok(Ok(m)) => Some(m),
        Ok(Err(e)) => {
            log::debug!("little_exif could not parse EXIF: {e}");
            None
        }
        Err(_) => {
            log::debug!("little_exif panicked parsing EXIF");
            None
        }
    }
}

fn build_tags(date: Option<&EffectiveDate>, coords: Option<&Coordinates>) -> Vec<ExifTag> {
    let mut tags = Vec::new();
    if let Some(date) = date {
        collect_date_tags(&mut tags, date);
    }
    if let Some(coords) = coords {
        collect_gps_tags(&mut tags, coords);
    }
    tags
}

/// `YYYY:MM:DD HH:MM:SS` into DateTimeOriginal, CreateDate and ModifyDate.
fn collect_date_tags(tags: &mut Vec<ExifTag>, date: &EffectiveDate) {
    let stamp = format!("{}\0", date.exif_string()).into_bytes();

    for (tag_id, group) in [
        (TAG_DATETIME_ORIGINAL, ExifTagGroup::ExifIFD),
        (TAG_CREATE_DATE, ExifTagGroup::ExifIFD),
        (TAG_MODIFY_DATE, ExifTagGroup::IFD0),
    ] {
        if let Ok(tag) = ExifTag::from_u16_with_data(
            tag_id,
            &ExifTagFormat::STRING,
            &stamp,
            &Endian::Little,
            &group,
        ) {
            tags.push(tag);
        }
    }
}

/// Decimal coordinates as GPS rationals plus separate hemisphere letters.
/// No sign-encoding in this path.
fn collect_gps_tags(tags: &mut Vec<ExifTag>, coords: &Coordinates) {
    let lat_abs = coords.latitude.abs();
    let lon_abs = coords.longitude.abs();

    let entries = [
        (
            TAG_GPS_LATITUDE_REF,
            format!("{}\0", coords.latitude_ref()).into_bytes(),
            true,
        ),
        (TAG_GPS_LATITUDE, encode_gps_rational(lat_abs), false),
        (
            TAG_GPS_LONGITUDE_REF,
            format!("{}\0", coords.longitude_ref()).into_bytes(),
            true,
        ),
        (TAG_GPS_LONGITUDE, encode_gps_rational(lon_abs), false),
    ];

    for (tag_id, data, is_string) in entries {
        let format = if is_string {
            ExifTagFormat::STRING
        } else {
            ExifTagFormat::RATIONAL64U
        };
        if let Ok(tag) = ExifTag::from_u16_with_data(
            tag_id,
            &format,
            &data,
            &Endian::Little,
            &ExifTagGroup::GPSIFD,
        ) {
            tags.push(tag);
        }
    }
}

/// Encode an unsigned decimal coordinate as 3 rationals (deg, min, sec),
/// little-endian, seconds at 1/10000 precision.
fn encode_gps_rational(decimal: f64) -> Vec<u8> {
    let degrees = decimal.floor() as u32;
    let minutes = ((decimal - degrees as f64) * 60.0).floor() as u32;
    let seconds =
        ((decimal - degrees as f64 - minutes as f64 / 60.0) * 3600.0 * 10000.0).round() as u32;

    let mut bytes = Vec::with_capacity(24);
    bytes.extend_from_slice(&degrees.to_le_bytes());
    bytes.extend_from_slice(&1u32.to_le_bytes());
    bytes.extend_from_slice(&minutes.to_le_bytes());
    bytes.extend_from_slice(&1u32.to_le_bytes());
    bytes.extend_from_slice(&seconds.to_le_bytes());
    bytes.extend_from_slice(&10000u32.to_le_bytes());
    bytes
}

fn find_exif_segment_pos(jpeg: &Jpeg) -> Option<usize> {
    const EXIF_PREFIX: &[u8] = b"Exif\0\0";
    jpeg.segments()
        .iter()
        .position(|s| s.marker() == 0xE1 && s.contents().starts_with(EXIF_PREFIX))
}

fn restore_mtime(path: &Path, mtime: Option<SystemTime>) {
    let Some(mtime) = mtime else { return };
    let restored = std::fs::File::options()
        .write(true)
        .open(path)
        .and_then(|f| f.set_modified(mtime));
    if let Err(e) = restored {
        log::warn!("Could not restore mtime for {}: {e}", path.display());
    }
}
