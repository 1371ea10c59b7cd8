use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::imageops::FilterType;
use image::GenericImageView;

/// Upper bound on a single encoded frame.
pub const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

/// A frame ready for inference.
#[derive(Clone, Debug)]
pub struct DecodedFrame {
    /// Tightly packed RGB8 pixels at the model input size.
    pub rgb: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// The original encoded image, kept for artifact storage.
    pub encoded: Vec<u8>,
}

/// Decode one stream payload and scale it to `target` (width, height).
///
/// The payload is either raw JPEG bytes or base64 text, optionally carrying a
/// `data:image/...;base64,` prefix.
pub fn decode_frame(payload: &[u8], target: (u32, u32)) -> Result<DecodedFrame> {
    let encoded = decode_payload(payload)?;
    let image = image::load_from_memory(&encoded).context("decode jpeg")?;
    let (src_w, src_h) = image.dimensions();
    let (width, height) = target;
    if width == 0 || height == 0 {
        return Err(anyhow!("invalid model input size {}x{}", width, height));
    }
    let image = if (src_w, src_h) == target {
        image
    } else {
        image.resize_exact(width, height, FilterType::Triangle)
    };
    let rgb = image.into_rgb8().into_raw();
    Ok(DecodedFrame {
        rgb,
        width,
        height,
        encoded,
    })
}

fn decode_payload(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.is_empty() {
        return Err(anyhow!("empty frame payload"));
    }
    if payload.starts_with(&[0xFF, 0xD8]) {
        if payload.len() > MAX_JPEG_BYTES {
            return Err(anyhow!("frame exceeds {} bytes", MAX_JPEG_BYTES));
        }
        return Ok(payload.to_vec());
    }
    // base64 expands by 4/3.
    if payload.len() > MAX_JPEG_BYTES / 3 * 4 + 4096 {
        return Err(anyhow!("frame exceeds {} bytes", MAX_JPEG_BYTES));
    }
    let text = std::str::from_utf8(payload).context("frame payload is neither jpeg nor text")?;
    let text = match text.find(";base64,") {
        Some(idx) if text.starts_with("data:") => &text[idx + ";base64,".len()..],
        _ => text,
    };
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = STANDARD
        .decode(compact.as_bytes())
        .context("invalid base64 frame payload")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty frame payload"));
    }
    if bytes.len() > MAX_JPEG_BYTES {
        return Err(anyhow!("frame exceeds {} bytes", MAX_JPEG_BYTES));
    }
    Ok(bytes)
}
