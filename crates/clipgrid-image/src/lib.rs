// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Clipboard-image normalization for clipgrid.
//!
//! Clipboard snapshots arrive as whatever raster format the source
//! application produced (BMP/DIB on Windows, PNG, JPEG, …).  Before an image
//! reaches the remote API it is decoded, downscaled when it exceeds
//! [`MAX_WIDTH`]×[`MAX_HEIGHT`], and re-encoded as PNG — one canonical wire
//! format regardless of origin.
//!
//! ## Caching
//! [`normalize_png`] caches results in an in-process LRU keyed on the SHA-256
//! of the input bytes.  The same screenshot is often submitted to several
//! matrix cells at once; the decode → resize → re-encode work happens once.

use std::io::Cursor;
use std::num::NonZeroUsize;
use std::sync::{Mutex, OnceLock};

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use sha2::Digest as _;

pub use error::ImageError;

mod error;

// ─── LRU normalization cache ──────────────────────────────────────────────────

/// Maximum number of normalized images held in the in-process LRU cache.
pub const CACHE_CAPACITY: usize = 16;

type CacheKey = [u8; 32]; // SHA-256 digest

fn png_cache() -> &'static Mutex<lru::LruCache<CacheKey, Vec<u8>>> {
    static CACHE: OnceLock<Mutex<lru::LruCache<CacheKey, Vec<u8>>>> = OnceLock::new();
    CACHE.get_or_init(|| {
        Mutex::new(lru::LruCache::new(
            NonZeroUsize::new(CACHE_CAPACITY).unwrap(),
        ))
    })
}

/// Maximum image width in pixels before downscaling.
pub const MAX_WIDTH: u32 = 2048;
/// Maximum image height in pixels before downscaling.
pub const MAX_HEIGHT: u32 = 2048;

/// Decode arbitrary raster bytes and return normalized PNG bytes.
///
/// Results are cached by content hash: repeated submissions of the same
/// clipboard image (common when one screenshot fills several matrix rows)
/// return the cached encoding immediately.
pub fn normalize_png(raw: &[u8]) -> Result<Vec<u8>, ImageError> {
    let key: CacheKey = sha2::Sha256::digest(raw).into();
    if let Ok(mut cache) = png_cache().lock() {
        if let Some(cached) = cache.get(&key) {
            return Ok(cached.clone());
        }
    }

    let img = image::load_from_memory(raw).map_err(|e| ImageError::Decode(e.to_string()))?;
    let img = resize_if_needed(img);

    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png)
        .map_err(|e| ImageError::Encode(e.to_string()))?;
    let bytes = out.into_inner();

    if let Ok(mut cache) = png_cache().lock() {
        cache.put(key, bytes.clone());
    }
    Ok(bytes)
}

/// Normalize to PNG and return the base64 encoding, ready for an inline
/// request part.
pub fn normalize_png_base64(raw: &[u8]) -> Result<String, ImageError> {
    Ok(B64.encode(normalize_png(raw)?))
}

/// Plain base64 of arbitrary bytes — the last-resort encoding for clipboard
/// data that does not decode as an image.
pub fn to_base64(raw: &[u8]) -> String {
    B64.encode(raw)
}

fn resize_if_needed(img: image::DynamicImage) -> image::DynamicImage {
    let (w, h) = (img.width(), img.height());
    if w <= MAX_WIDTH && h <= MAX_HEIGHT {
        return img;
    }
    let ratio_w = MAX_WIDTH as f64 / w as f64;
    let ratio_h = MAX_HEIGHT as f64 / h as f64;
    let ratio = ratio_w.min(ratio_h);
    let new_w = ((w as f64 * ratio).round() as u32).max(1);
    let new_h = ((h as f64 * ratio).round() as u32).max(1);
    img.resize(new_w, new_h, image::imageops::FilterType::Lanczos3)
}

/// Return whether the given file extension belongs to a supported image format.
pub fn is_image_extension(ext: &str) -> bool {
    matches!(
        ext.to_lowercase().as_str(),
        "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" | "tiff" | "tif"
    )
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // 1×1 red PNG bytes (valid minimal PNG, CRCs verified by Python zlib)
    const MINIMAL_PNG: &[u8] = &[
        0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, // PNG signature
        0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44, 0x52, // IHDR chunk
        0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, // 1×1
        0x08, 0x02, 0x00, 0x00, 0x00, 0x90, 0x77, 0x53, // bit depth 8, RGB
        0xde, 0x00, 0x00, 0x00, 0x0c, 0x49, 0x44, 0x41, // IDAT length + "IDAT"
        0x54, 0x78, 0x9c, 0x63, 0xf8, 0xcf, 0xc0, 0x00, // compressed pixel (red)
        0x00, 0x03, 0x01, 0x01, 0x00, 0xc9, 0xfe, 0x92, // IDAT CRC
        0xef, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4e, // IEND
        0x44, 0xae, 0x42, 0x60, 0x82, // IEND CRC
    ];

    #[test]
    fn normalize_minimal_png_yields_png_signature() {
        let out = normalize_png(MINIMAL_PNG).unwrap();
        assert!(out.starts_with(&[0x89, 0x50, 0x4e, 0x47]), "output must be PNG");
    }

    #[test]
    fn normalize_garbage_is_a_decode_error() {
        let err = normalize_png(b"definitely not an image").unwrap_err();
        assert!(matches!(err, ImageError::Decode(_)));
    }

    #[test]
    fn second_call_returns_cached_bytes() {
        let first = normalize_png(MINIMAL_PNG).unwrap();
        let second = normalize_png(MINIMAL_PNG).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn base64_variant_round_trips() {
        use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
        let b64 = normalize_png_base64(MINIMAL_PNG).unwrap();
        let decoded = B64.decode(b64).unwrap();
        assert_eq!(decoded, normalize_png(MINIMAL_PNG).unwrap());
    }

    #[test]
    fn jpeg_input_is_reencoded_as_png() {
        // Encode a tiny JPEG in memory, then normalize it.
        let img = image::DynamicImage::new_rgb8(2, 2);
        let mut jpeg = std::io::Cursor::new(Vec::new());
        img.write_to(&mut jpeg, image::ImageFormat::Jpeg).unwrap();
        let out = normalize_png(&jpeg.into_inner()).unwrap();
        assert!(out.starts_with(&[0x89, 0x50, 0x4e, 0x47]));
    }

    #[test]
    fn oversized_image_is_downscaled() {
        let img = image::DynamicImage::new_rgb8(MAX_WIDTH * 2, 10);
        let mut png = std::io::Cursor::new(Vec::new());
        img.write_to(&mut png, image::ImageFormat::Png).unwrap();
        let out = normalize_png(&png.into_inner()).unwrap();
        let back = image::load_from_memory(&out).unwrap();
        assert!(back.width() <= MAX_WIDTH);
        assert!(back.height() >= 1);
    }

    #[test]
    fn is_image_extension_recognises_known_formats() {
        for ext in &["png", "PNG", "jpg", "jpeg", "gif", "webp", "bmp", "tiff"] {
            assert!(is_image_extension(ext), "{ext} should be recognised");
        }
        assert!(!is_image_extension("rs"));
        assert!(!is_image_extension(""));
    }
}
