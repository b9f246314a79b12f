//! Colorspace-aware PNG write-out, shared by all extraction modes.

use super::document::PdfFile;
use super::geometry::Rect;
use super::pixmap::{Colorspace, Pixmap};
use super::record::ImageRecord;
use crate::error::Result;
use crate::types::Tunables;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{DynamicImage, RgbImage, RgbaImage};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

// ── Output naming ───────────────────────────────────────────────

/// Coordinate-encoding filename used by normal mode. Records that never
/// gained a bbox write zero coordinates.
pub(crate) fn output_name(dir: &Path, page: u32, bbox: Option<&Rect>, counter: u32) -> PathBuf {
  let (x0, y0, x1, y1) = match bbox {
    Some(b) => (b.x0, b.y0, b.x1, b.y1),
    None => (0.0, 0.0, 0.0, 0.0),
  };
  dir.join(format!(
    "p-{page}-x0-{x0:.3}-y0-{y0:.3}-x1-{x1:.3}-y1-{y1:.3}-{counter}.png"
  ))
}

/// Simple filename used by safe and unsafe mode.
pub(crate) fn plain_name(dir: &Path, page: u32, counter: u32) -> PathBuf {
  dir.join(format!("p-{page}-{counter}.png"))
}

// ── Encoding ────────────────────────────────────────────────────

/// PNG with the fastest compression and no row filtering: output stays
/// losslessly, predictably encoded for bit-exact downstream comparison.
pub(crate) fn save_png(img: &DynamicImage, path: &Path) -> Result<()> {
  let file = File::create(path)?;
  let encoder = PngEncoder::new_with_quality(
    BufWriter::new(file),
    CompressionType::Fast,
    FilterType::NoFilter,
  );
  img.write_with_encoder(encoder)?;
  Ok(())
}

/// Alpha-blend onto a pure white background, for consumers that need RGB.
pub(crate) fn flatten_onto_white(img: &RgbaImage) -> RgbImage {
  let mut out = RgbImage::from_pixel(img.width(), img.height(), image::Rgb([255, 255, 255]));
  for (x, y, p) in img.enumerate_pixels() {
    let a = p[3] as u16;
    let px = out.get_pixel_mut(x, y);
    for c in 0..3 {
      px[c] = ((p[c] as u16 * a + 255 * (255 - a)) / 255) as u8;
    }
  }
  out
}

// ── Decision table ──────────────────────────────────────────────

/// Write one pixmap according to its colorspace and alpha:
///
/// - Gray without alpha: inverted first when the object's secondary
///   colorspace is a Separation/DeviceN ink (those store intensity, not
///   luminance), then written as grayscale.
/// - Gray with alpha: converted to RGB, written RGBA.
/// - RGB: written as-is, RGBA when alpha is present.
/// - CMYK: converted to RGB before any alpha handling.
///
/// Returns `Ok(false)` without writing for sub-minimum sizes and for
/// pixmaps whose colorspace is unknown; I/O problems are errors.
pub(crate) fn write_pixmap(
  pix: &Pixmap,
  path: &Path,
  alt_colorspace: Option<&str>,
  t: &Tunables,
) -> Result<bool> {
  if pix.width < t.min_width || pix.height < t.min_height {
    return Ok(false);
  }
  let Some(cs) = pix.colorspace else {
    warn!(path = %path.display(), "unknown colorspace, image skipped");
    return Ok(false);
  };

  match (cs, pix.alpha) {
    (Colorspace::Gray, false) => {
      let mut pix = pix.clone();
      if matches!(alt_colorspace, Some("Separation") | Some("DeviceN")) {
        pix.invert();
      }
      save_png(&pix.to_dynamic()?, path)?;
    }
    (Colorspace::Gray, true) => {
      save_png(&pix.to_rgb().to_dynamic()?, path)?;
    }
    (Colorspace::Rgb, _) => {
      save_png(&pix.to_dynamic()?, path)?;
    }
    (Colorspace::Cmyk, _) => {
      save_png(&pix.to_rgb().to_dynamic()?, path)?;
    }
  }
  Ok(true)
}

/// Write one image record: synthetic composites from their pixel buffer,
/// xref records through the pixmap path, stencil-masked records with the
/// mask composed as alpha. A record that fails to decode is skipped.
pub(crate) fn write_image_record(
  pdf: &PdfFile,
  rec: &ImageRecord,
  path: &Path,
  t: &Tunables,
) -> Result<bool> {
  if let Some(px) = &rec.pixels {
    if !rec.is_valid_size(t) {
      return Ok(false);
    }
    save_png(&DynamicImage::ImageRgb8(px.clone()), path)?;
    return Ok(true);
  }

  let Some(xref) = rec.xref else {
    return Ok(false);
  };

  let pix = match rec.smask {
    Some(smask) => pdf.pixmap_with_mask(xref, smask),
    None => pdf.pixmap(xref),
  };
  match pix {
    Ok(pix) => write_pixmap(&pix, path, rec.alt_colorspace.as_deref(), t),
    Err(e) => {
      debug!(xref = xref.0, "record skipped, decode failed: {e}");
      Ok(false)
    }
  }
}
