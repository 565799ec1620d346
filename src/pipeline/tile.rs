//! Image tiling: cut a tall screenshot into overlapping horizontal bands.
//!
//! ## Why tile at all?
//!
//! Vision APIs cap the pixel size of each attached image and silently
//! downscale anything larger. A full YouTube channel page is several thousand
//! pixels tall; sent whole, its video titles shrink below legibility. Cutting
//! it into `part_height`-tall bands keeps text at native resolution, and the
//! `overlap` rows shared by neighbouring bands make sure a line that straddles
//! a cut is fully visible in at least one of them.
//!
//! ## Geometry
//!
//! Band `i` spans `[i * stride, min(height, i * stride + part_height))` with
//! `stride = part_height - overlap`. Generation stops at the first band whose
//! bottom reaches the image height, so the last band may be shorter than
//! `part_height` but never extends past the image. [`TilePlan`] is that
//! sequence as a plain iterator: it holds no pixels and can be cloned to start
//! over.
//!
//! ## Output layout
//!
//! ```text
//! <output_root>/crop_<label-or-stem>/
//!     metadata.txt
//!     <stem>_part_<n>_h<part_height>_overlap<overlap>.<ext>
//! ```
//!
//! Re-tiling the same image under the same label overwrites the previous
//! output in place; directories are not versioned.

use crate::config::{validate_tiling, PipelineConfig};
use crate::error::PipelineError;
use chrono::Local;
use image::{DynamicImage, ImageFormat, ImageReader};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Prefix of every tile output directory.
pub const TILE_DIR_PREFIX: &str = "crop_";

/// Name of the per-call report written into the tile directory.
pub const METADATA_FILE: &str = "metadata.txt";

/// Tile file-name pattern, as documented in the report.
pub const TILE_NAME_PATTERN: &str = "<stem>_part_<n>_h<part_height>_overlap<overlap>.<ext>";

// ── Geometry ─────────────────────────────────────────────────────────────

/// Vertical pixel range `[top, bottom)` of one tile in source coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileSpec {
    /// 0-based position, top to bottom.
    pub index: u32,
    pub top: u32,
    pub bottom: u32,
}

impl TileSpec {
    pub fn height(&self) -> u32 {
        self.bottom - self.top
    }
}

/// Ordered, finite sequence of [`TileSpec`]s for one image height.
#[derive(Debug, Clone)]
pub struct TilePlan {
    height: u32,
    part_height: u32,
    overlap: u32,
    next_index: u32,
    finished: bool,
}

impl TilePlan {
    /// Plan tiles for an image `height` pixels tall.
    ///
    /// # Errors
    /// [`PipelineError::InvalidParameter`] when `part_height == 0` or
    /// `overlap >= part_height`.
    pub fn new(height: u32, part_height: u32, overlap: u32) -> Result<Self, PipelineError> {
        validate_tiling(part_height, overlap)?;
        Ok(Self::new_unchecked(height, part_height, overlap))
    }

    fn new_unchecked(height: u32, part_height: u32, overlap: u32) -> Self {
        Self {
            height,
            part_height,
            overlap,
            next_index: 0,
            finished: height == 0,
        }
    }

    fn stride(&self) -> u64 {
        u64::from(self.part_height - self.overlap)
    }

    /// Total number of tiles in the plan, independent of iteration progress.
    pub fn part_count(&self) -> usize {
        if self.height == 0 {
            return 0;
        }
        if self.height <= self.part_height {
            return 1;
        }
        let rest = u64::from(self.height - self.part_height);
        (1 + rest.div_ceil(self.stride())) as usize
    }
}

impl Iterator for TilePlan {
    type Item = TileSpec;

    fn next(&mut self) -> Option<TileSpec> {
        if self.finished {
            return None;
        }
        let height = u64::from(self.height);
        let top = u64::from(self.next_index) * self.stride();
        let bottom = (top + u64::from(self.part_height)).min(height);

        let spec = TileSpec {
            index: self.next_index,
            top: top as u32,
            bottom: bottom as u32,
        };
        self.finished = bottom == height;
        self.next_index += 1;
        Some(spec)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = if self.finished {
            0
        } else {
            self.part_count() - self.next_index as usize
        };
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for TilePlan {}

/// Collect the full plan for `height` into a vector.
pub fn tile_specs(
    height: u32,
    part_height: u32,
    overlap: u32,
) -> Result<Vec<TileSpec>, PipelineError> {
    Ok(TilePlan::new(height, part_height, overlap)?.collect())
}

// ── Naming ───────────────────────────────────────────────────────────────

/// Tile directory name: `crop_` + label, or `crop_` + image stem.
///
/// A label that already carries the prefix is used unchanged.
pub fn tile_dir_name(label: Option<&str>, stem: &str) -> String {
    match label.filter(|l| !l.is_empty()) {
        Some(l) if l.starts_with(TILE_DIR_PREFIX) => l.to_string(),
        Some(l) => format!("{TILE_DIR_PREFIX}{l}"),
        None => format!("{TILE_DIR_PREFIX}{stem}"),
    }
}

/// File name of tile `index` (0-based); the name carries the 1-based part number.
pub fn tile_file_name(stem: &str, index: u32, part_height: u32, overlap: u32, ext: &str) -> String {
    format!(
        "{stem}_part_{}_h{part_height}_overlap{overlap}.{ext}",
        index + 1
    )
}

/// Encoder and extension for tiles cut from `source`, chosen by its extension.
///
/// Unknown extensions fall back to JPEG.
pub fn output_format_for(source: &Path) -> (ImageFormat, &'static str) {
    let ext = source
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => (ImageFormat::Png, "png"),
        "gif" => (ImageFormat::Gif, "gif"),
        "bmp" => (ImageFormat::Bmp, "bmp"),
        "tif" | "tiff" => (ImageFormat::Tiff, "tiff"),
        _ => (ImageFormat::Jpeg, "jpg"),
    }
}

fn format_name(format: ImageFormat) -> String {
    format!("{format:?}").to_uppercase()
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string())
}

// ── Source image ─────────────────────────────────────────────────────────

/// A decoded source image. Never mutated; tiles are cropped copies.
#[derive(Debug, Clone)]
pub struct RawImage {
    pub path: PathBuf,
    pub pixels: DynamicImage,
    /// Format detected from the file content.
    pub detected_format: Option<ImageFormat>,
}

impl RawImage {
    /// Read and decode the image at `path`.
    pub fn open(path: &Path) -> Result<Self, PipelineError> {
        let read_err = |source| PipelineError::ImageRead {
            path: path.to_path_buf(),
            source,
        };
        let reader = ImageReader::open(path)
            .map_err(read_err)?
            .with_guessed_format()
            .map_err(read_err)?;
        let detected_format = reader.format();
        let pixels = reader.decode().map_err(|e| PipelineError::ImageDecode {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            pixels,
            detected_format,
        })
    }

    /// Decode in-memory bytes; `path` names the image for output naming.
    pub fn from_bytes(path: impl Into<PathBuf>, bytes: &[u8]) -> Result<Self, PipelineError> {
        let path = path.into();
        let decode_err = |detail: String| PipelineError::ImageDecode {
            path: path.clone(),
            detail,
        };
        let reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| decode_err(e.to_string()))?;
        let detected_format = reader.format();
        let pixels = reader.decode().map_err(|e| decode_err(e.to_string()))?;

        Ok(Self {
            path,
            pixels,
            detected_format,
        })
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

// ── Tiling ───────────────────────────────────────────────────────────────

/// One written tile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tile {
    pub spec: TileSpec,
    pub path: PathBuf,
}

/// Report written once per tiling call as `metadata.txt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TilingMetadata {
    pub source_file: String,
    pub original_path: PathBuf,
    pub detected_format: String,
    pub width: u32,
    pub height: u32,
    pub color_mode: String,
    pub part_height: u32,
    pub overlap: u32,
    pub part_count: usize,
    pub output_dir: PathBuf,
    pub processed_at: String,
    /// Name of the first tile, an instance of [`TILE_NAME_PATTERN`].
    pub example_name: String,
}

impl TilingMetadata {
    /// Human-readable report.
    pub fn render(&self) -> String {
        format!(
            "Tiling Report\n\
             =============\n\n\
             Source\n\
             - File: {}\n\
             - Original Path: {}\n\
             - Format: {}\n\n\
             Image\n\
             - Dimensions: {}x{}\n\
             - Color Mode: {}\n\n\
             Settings\n\
             - Part Height: {} px\n\
             - Overlap: {} px\n\
             - Number of Parts: {}\n\
             - Output Directory: {}\n\n\
             Naming\n\
             - Pattern: {}\n\
             - <stem>: source file name without extension\n\
             - <n>: part number, from 1 at the top\n\
             - <part_height>: tile height in px (the last tile may be shorter)\n\
             - <overlap>: rows shared with the previous tile\n\
             - Example: {}\n\n\
             Processed: {}\n",
            self.source_file,
            self.original_path.display(),
            self.detected_format,
            self.width,
            self.height,
            self.color_mode,
            self.part_height,
            self.overlap,
            self.part_count,
            self.output_dir.display(),
            TILE_NAME_PATTERN,
            self.example_name,
            self.processed_at,
        )
    }
}

/// Result of one tiling call.
#[derive(Debug, Clone)]
pub struct TilingOutput {
    pub output_dir: PathBuf,
    pub tiles: Vec<Tile>,
    pub metadata: TilingMetadata,
}

/// Cuts images into overlapping bands under `output_root`.
#[derive(Debug, Clone)]
pub struct ImageTiler {
    output_root: PathBuf,
    part_height: u32,
    overlap: u32,
}

impl ImageTiler {
    pub fn new(
        output_root: impl Into<PathBuf>,
        part_height: u32,
        overlap: u32,
    ) -> Result<Self, PipelineError> {
        validate_tiling(part_height, overlap)?;
        Ok(Self {
            output_root: output_root.into(),
            part_height,
            overlap,
        })
    }

    /// Tiler writing under `config.data_root` with the configured geometry.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        Self::new(&config.data_root, config.part_height, config.overlap)
    }

    pub fn plan(&self, height: u32) -> TilePlan {
        TilePlan::new_unchecked(height, self.part_height, self.overlap)
    }

    /// Directory that receives the tiles of `source`.
    pub fn output_dir_for(&self, source: &Path, label: Option<&str>) -> PathBuf {
        self.output_root
            .join(tile_dir_name(label, &file_stem(source)))
    }

    /// Decode `source` and write its tiles.
    pub fn tile(&self, source: &Path, label: Option<&str>) -> Result<TilingOutput, PipelineError> {
        let image = RawImage::open(source)?;
        self.tile_image(&image, label)
    }

    /// Write the tiles of an already decoded image.
    pub fn tile_image(
        &self,
        image: &RawImage,
        label: Option<&str>,
    ) -> Result<TilingOutput, PipelineError> {
        let stem = file_stem(&image.path);
        let output_dir = self.output_dir_for(&image.path, label);
        let (format, ext) = output_format_for(&image.path);
        let plan = self.plan(image.height());

        std::fs::create_dir_all(&output_dir).map_err(|e| PipelineError::ImageWrite {
            path: output_dir.clone(),
            detail: e.to_string(),
        })?;

        let metadata = TilingMetadata {
            source_file: image
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| stem.clone()),
            original_path: image.path.clone(),
            detected_format: image
                .detected_format
                .map(format_name)
                .unwrap_or_else(|| "UNKNOWN".to_string()),
            width: image.width(),
            height: image.height(),
            color_mode: format!("{:?}", image.pixels.color()),
            part_height: self.part_height,
            overlap: self.overlap,
            part_count: plan.part_count(),
            output_dir: output_dir.clone(),
            processed_at: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            example_name: tile_file_name(&stem, 0, self.part_height, self.overlap, ext),
        };

        let metadata_path = output_dir.join(METADATA_FILE);
        std::fs::write(&metadata_path, metadata.render()).map_err(|e| {
            PipelineError::ImageWrite {
                path: metadata_path.clone(),
                detail: e.to_string(),
            }
        })?;

        info!(
            "Tiling {} ({}x{}) into {} parts → {}",
            image.path.display(),
            image.width(),
            image.height(),
            metadata.part_count,
            output_dir.display()
        );

        let mut tiles = Vec::with_capacity(metadata.part_count);
        for spec in plan {
            let band = image
                .pixels
                .crop_imm(0, spec.top, image.width(), spec.height());
            let path = output_dir.join(tile_file_name(
                &stem,
                spec.index,
                self.part_height,
                self.overlap,
                ext,
            ));
            encodable(band, format)
                .save_with_format(&path, format)
                .map_err(|e| PipelineError::ImageWrite {
                    path: path.clone(),
                    detail: e.to_string(),
                })?;
            debug!(
                "Tile {}/{}: rows {}..{} → {}",
                spec.index + 1,
                metadata.part_count,
                spec.top,
                spec.bottom,
                path.display()
            );
            tiles.push(Tile { spec, path });
        }

        Ok(TilingOutput {
            output_dir,
            tiles,
            metadata,
        })
    }
}

/// Convert a band to a pixel layout the target encoder accepts.
fn encodable(band: DynamicImage, format: ImageFormat) -> DynamicImage {
    match format {
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(band.to_rgb8()),
        ImageFormat::Png | ImageFormat::Tiff => band,
        _ => DynamicImage::ImageRgba8(band.to_rgba8()),
    }
}
