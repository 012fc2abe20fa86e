//! Image payload probing
//!
//! Decides whether downloaded bytes are a supported image by sniffing the
//! content itself; `Content-Type` only breaks ties.

use crate::cache::metadata::ImageInfo;
use image::{ImageFormat, ImageReader};
use std::io::Cursor;

/// Result of a successful probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbedImage {
    pub info: ImageInfo,
    /// Extension to use for the blob file
    pub extension: &'static str,
}

/// Probe `bytes`, returning `Err(reason)` for unsupported payloads
pub fn probe_image(bytes: &[u8], content_type: Option<&str>) -> Result<ProbedImage, String> {
    if bytes.is_empty() {
        return Err("empty payload".to_string());
    }

    if looks_like_svg(bytes, content_type) {
        return Ok(ProbedImage {
            info: ImageInfo {
                width: None,
                height: None,
                format: "svg".to_string(),
            },
            extension: "svg",
        });
    }

    let format = sniff_format(bytes)
        .or_else(|| format_from_content_type(content_type))
        .ok_or_else(|| match content_type {
            Some(ct) => format!("not a recognised image (content type {})", ct),
            None => "not a recognised image".to_string(),
        })?;

    let (width, height) = ImageReader::with_format(Cursor::new(bytes), format)
        .into_dimensions()
        .map_err(|e| format!("unreadable {:?} header: {}", format, e))?;

    let extension = format.extensions_str().first().copied().unwrap_or("img");

    Ok(ProbedImage {
        info: ImageInfo {
            width: Some(width),
            height: Some(height),
            format: extension.to_string(),
        },
        extension,
    })
}

/// Whether a locator's extension names the probed format (`jpeg` vs `jpg`)
pub fn extension_matches(extension: &str, probed_extension: &str) -> bool {
    if extension.eq_ignore_ascii_case(probed_extension) {
        return true;
    }
    match (
        ImageFormat::from_extension(extension),
        ImageFormat::from_extension(probed_extension),
    ) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn sniff_format(bytes: &[u8]) -> Option<ImageFormat> {
    image::guess_format(bytes).ok()
}

fn format_from_content_type(content_type: Option<&str>) -> Option<ImageFormat> {
    let mime = content_type?
        .split(';')
        .next()
        .map(|ct| ct.trim().to_ascii_lowercase())?;
    ImageFormat::from_mime_type(mime)
}

fn looks_like_svg(bytes: &[u8], content_type: Option<&str>) -> bool {
    let declared = content_type.is_some_and(|ct| ct.to_ascii_lowercase().contains("image/svg"));

    let head = &bytes[..bytes.len().min(1024)];
    let text = String::from_utf8_lossy(head);
    let text = text.trim_start_matches('\u{feff}').trim_start();
    let has_root = text.starts_with("<svg")
        || ((text.starts_with("<?xml") || text.starts_with("<!DOCTYPE svg")) && text.contains("<svg"));

    has_root || (declared && text.contains("<svg"))
}
