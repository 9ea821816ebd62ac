//! The canned response table: classification -> (bytes, Content-Type).
//!
//! The exact byte content doesn't matter; what matters is that each blob
//! is well-formed for its declared content type and that `Content-Length`
//! always matches it byte-for-byte.

use crate::classify::Classification;

/// The smallest possible well-formed GIF: a 1x1 transparent pixel.
pub const GIF_PIXEL: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0xFF, 0xFF, 0xFF,
    0x00, 0x00, 0x00, 0x21, 0xF9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2C, 0x00, 0x00, 0x00, 0x00,
    0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3B,
];

/// A 1x1 transparent PNG.
pub const PNG_PIXEL: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F, 0x15, 0xC4,
    0x89, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x44, 0x41, 0x54, 0x78, 0xDA, 0x63, 0x64, 0x60, 0x60, 0x60,
    0x00, 0x00, 0x00, 0x05, 0x00, 0x01, 0x5F, 0x0A, 0x2E, 0x1E, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45,
    0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

/// The smallest valid baseline JPEG, a 1x1 white pixel.
pub const JPG_PIXEL: &[u8] = &[
    0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46, 0x49, 0x46, 0x00, 0x01, 0x01, 0x00, 0x00, 0x01,
    0x00, 0x01, 0x00, 0x00, 0xFF, 0xDB, 0x00, 0x43, 0x00, 0x03, 0x02, 0x02, 0x02, 0x02, 0x02, 0x03,
    0x02, 0x02, 0x02, 0x03, 0x03, 0x03, 0x03, 0x04, 0x06, 0x04, 0x04, 0x04, 0x04, 0x04, 0x08, 0x06,
    0x06, 0x05, 0x06, 0x09, 0x08, 0x0A, 0x0A, 0x09, 0x08, 0x09, 0x09, 0x0A, 0x0C, 0x0F, 0x0C, 0x0A,
    0x0B, 0x0E, 0x0B, 0x09, 0x09, 0x0D, 0x11, 0x0D, 0x0E, 0x0F, 0x10, 0x10, 0x11, 0x10, 0x0A, 0x0C,
    0x12, 0x13, 0x12, 0x10, 0x13, 0x0F, 0x10, 0x10, 0x10, 0xFF, 0xC9, 0x00, 0x0B, 0x08, 0x00, 0x01,
    0x00, 0x01, 0x01, 0x01, 0x11, 0x00, 0xFF, 0xCC, 0x00, 0x06, 0x00, 0x10, 0x10, 0x05, 0xFF, 0xDA,
    0x00, 0x08, 0x01, 0x01, 0x00, 0x00, 0x3F, 0x00, 0xD2, 0xCF, 0x20, 0xFF, 0xD9,
];

/// Minimal 16x16 ICO container holding a single 1-bpp glyph.
pub const ICO_FAVICON: &[u8] = &[
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x01, 0x01, 0x00, 0x00, 0x01, 0x00, 0x18, 0x00, 0x30, 0x00,
    0x00, 0x00, 0x16, 0x00, 0x00, 0x00, 0x28, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x18, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0xFF, 0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Empty SWF header (no frames). Flash is long dead; the point is a
/// parseable container, not animation.
pub const SWF_STUB: &[u8] = &[
    0x46, 0x57, 0x53, 0x05, 0x19, 0x00, 0x00, 0x00, 0x78, 0x00, 0x05, 0x5F, 0x00, 0x00, 0x0C, 0x01,
    0x00, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00, 0x00,
];

pub const EMPTY_BODY: &[u8] = b"";

pub struct CannedResponse {
    pub body: &'static [u8],
    pub content_type: &'static str,
    pub cache_control: &'static str,
}

/// Looks up the canned body + headers for a classification that results in
/// a body being sent. Classifications that never reach this table (method
/// overrides, stats pages, redirects, 204, failures) are rendered
/// elsewhere.
pub fn canned_response(class: Classification) -> Option<CannedResponse> {
    let (body, content_type) = match class {
        Classification::SendGif | Classification::SendNoExt | Classification::SendUnkExt => {
            (GIF_PIXEL, "image/gif")
        }
        Classification::SendPng => (PNG_PIXEL, "image/png"),
        Classification::SendJpg => (JPG_PIXEL, "image/jpeg"),
        Classification::SendIco => (ICO_FAVICON, "image/x-icon"),
        Classification::SendSwf => (SWF_STUB, "application/x-shockwave-flash"),
        Classification::SendTxt => (EMPTY_BODY, "text/plain"),
        _ => return None,
    };
    Some(CannedResponse { body, content_type, cache_control: "max-age=86400" })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gif_pixel_has_gif_magic() {
        assert_eq!(&GIF_PIXEL[0..6], b"GIF89a");
        assert_eq!(GIF_PIXEL.len(), 43);
    }

    #[test]
    fn png_pixel_has_png_magic() {
        assert_eq!(&PNG_PIXEL[0..8], &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]);
    }

    #[test]
    fn every_recognized_extension_has_a_canned_response() {
        for class in [
            Classification::SendGif,
            Classification::SendPng,
            Classification::SendJpg,
            Classification::SendIco,
            Classification::SendSwf,
            Classification::SendTxt,
        ] {
            assert!(canned_response(class).is_some());
        }
    }

    #[test]
    fn stats_and_control_classes_have_no_canned_body() {
        assert!(canned_response(Classification::SendStats).is_none());
        assert!(canned_response(Classification::Send204).is_none());
    }
}
