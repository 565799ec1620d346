//! Tile encoding: image file on disk → base64 `ImageData` for the vision API.
//!
//! Tiles are sent byte-for-byte as written by the tiler. Re-encoding would
//! only cost time: PNG tiles are already lossless, and re-compressing a JPEG
//! tile would add a second round of artefacts to small text.

use crate::error::PipelineError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use std::path::Path;
use tracing::debug;

/// MIME type for an image file, chosen by extension.
pub fn mime_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "webp" => "image/webp",
        _ => "image/jpeg",
    }
}

/// Read a tile and wrap it for a multimodal request.
///
/// `detail: "high"` keeps providers that support it from downscaling the
/// tile to a single low-resolution overview.
pub async fn encode_tile(path: &Path) -> Result<ImageData, PipelineError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| PipelineError::ImageRead {
            path: path.to_path_buf(),
            source,
        })?;

    let b64 = STANDARD.encode(&bytes);
    debug!("Encoded {} → {} bytes base64", path.display(), b64.len());

    Ok(ImageData::new(b64, mime_type_for(path)).with_detail("high"))
}
