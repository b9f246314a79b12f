//! Paint the records of one overlap cluster into a single composite
//! raster whose pixel size and offsets are reconstructed from the page
//! coordinates.

use super::deadline::Deadline;
use super::document::PdfFile;
use super::geometry::check_overlap;
use super::record::ImageRecord;
use super::writer::{self, flatten_onto_white};
use crate::error::{ExtractError, Result};
use crate::types::Tunables;
use image::{DynamicImage, RgbImage, imageops};
use std::cmp::Ordering;
use std::path::Path;
use tracing::{debug, warn};

/// Repeatedly merge the two closest cluster members until one record
/// remains, then write it out.
///
/// The merge tolerance starts narrow and widens by half a point whenever a
/// full pass over the remaining pieces finds nothing to join. Reaching the
/// cap means the cluster's coordinates are inconsistent (a corrupt or
/// misreported figure); the current head is flushed as a standalone image
/// and the tolerance restarts narrow.
pub(crate) fn assemble_cluster(
  pdf: &PdfFile,
  mut figures: Vec<ImageRecord>,
  dir: &Path,
  page: u32,
  counter: &mut u32,
  t: &Tunables,
  deadline: &Deadline,
) -> Result<()> {
  sort_figures(&mut figures);
  let mut distance = t.overlap_distance;
  let mut fruitless = 0usize;

  while figures.len() > 1 {
    deadline.check()?;
    let obj_i = figures.remove(0);

    let found = figures.iter().position(|obj_j| match (&obj_i.bbox, &obj_j.bbox) {
      (Some(a), Some(b)) => check_overlap(a, b, distance, t.overlap_distance_bbox),
      _ => false,
    });

    match found {
      Some(j) => {
        let obj_j = figures.remove(j);
        let merged = merge_images(pdf, obj_i, obj_j, dir, page, counter, t)?;
        figures.push(merged);
        fruitless = 0;
      }
      None => {
        fruitless += 1;
        if fruitless > figures.len() {
          if distance >= t.merge_distance_max {
            flush_record(pdf, &obj_i, dir, page, counter, t)?;
            distance = t.merge_distance_restart;
            fruitless = 0;
            continue;
          }
          distance += t.merge_distance_step;
          warn!(page, distance, "cluster pieces do not meet, widening merge tolerance");
          fruitless = 0;
        }
        sort_figures(&mut figures);
        figures.push(obj_i);
      }
    }
  }

  if let Some(last) = figures.pop() {
    let path = writer::output_name(dir, page, last.bbox.as_ref(), *counter);
    if writer::write_image_record(pdf, &last, &path, t)? {
      *counter += 1;
    }
  }
  Ok(())
}

/// Merge two records into a synthetic composite.
///
/// The canvas size comes from averaging each record's own estimate of the
/// full-figure pixel extent (its pixel density times the union rectangle).
/// The record further left/up anchors at zero; the other lands flush with
/// the far edge. If the chosen offsets would make the rasters overlap by
/// more than the threshold, the merge is vetoed: the piece that would be
/// painted over is flushed to its own file and the other survives.
fn merge_images(
  pdf: &PdfFile,
  obj_i: ImageRecord,
  obj_j: ImageRecord,
  dir: &Path,
  page: u32,
  counter: &mut u32,
  t: &Tunables,
) -> Result<ImageRecord> {
  let (Some(bbox_i), Some(bbox_j)) = (obj_i.bbox, obj_j.bbox) else {
    return Ok(obj_i);
  };
  if bbox_i.width() <= 0.0 || bbox_i.height() <= 0.0 || bbox_j.width() <= 0.0 || bbox_j.height() <= 0.0
  {
    return Ok(obj_i);
  }

  let img_i = match load_rgb(pdf, &obj_i) {
    Ok(img) => img,
    Err(e) => {
      debug!(page, "dropping undecodable cluster piece: {e}");
      return Ok(obj_j);
    }
  };
  let img_j = match load_rgb(pdf, &obj_j) {
    Ok(img) => img,
    Err(e) => {
      debug!(page, "dropping undecodable cluster piece: {e}");
      return Ok(obj_i);
    }
  };

  let mut sketch = bbox_i;
  sketch.include(&bbox_j);

  let est_w_i = sketch.width() * obj_i.width as f64 / bbox_i.width();
  let est_w_j = sketch.width() * obj_j.width as f64 / bbox_j.width();
  let est_h_i = sketch.height() * obj_i.height as f64 / bbox_i.height();
  let est_h_j = sketch.height() * obj_j.height as f64 / bbox_j.height();
  let real_w = ((est_w_i + est_w_j) / 2.0).round() as i64;
  let real_h = ((est_h_i + est_h_j) / 2.0).round() as i64;

  let (x0_i, x0_j) = if bbox_i.x0 < bbox_j.x0 {
    (0, (real_w - obj_j.width as i64).max(0))
  } else {
    ((real_w - obj_i.width as i64).max(0), 0)
  };
  let (y0_i, y0_j) = if bbox_i.y0 < bbox_j.y0 {
    (0, (real_h - obj_j.height as i64).max(0))
  } else {
    ((real_h - obj_i.height as i64).max(0), 0)
  };

  let (iw, ih) = (img_i.width() as i64, img_i.height() as i64);
  let (jw, jh) = (img_j.width() as i64, img_j.height() as i64);

  if x0_i < x0_j && (x0_i + iw - x0_j) > t.canvas_overlap_px {
    flush_loaded(&img_j, &obj_j, dir, page, counter, t)?;
    return Ok(obj_i);
  }
  if x0_j < x0_i && (x0_j + jw - x0_i) > t.canvas_overlap_px {
    flush_loaded(&img_i, &obj_i, dir, page, counter, t)?;
    return Ok(obj_j);
  }
  if y0_i < y0_j && (y0_i + ih - y0_j) > t.canvas_overlap_px {
    flush_loaded(&img_j, &obj_j, dir, page, counter, t)?;
    return Ok(obj_i);
  }
  if y0_j < y0_i && (y0_j + jh - y0_i) > t.canvas_overlap_px {
    flush_loaded(&img_i, &obj_i, dir, page, counter, t)?;
    return Ok(obj_j);
  }

  if real_w < 1 || real_h < 1 {
    flush_loaded(&img_j, &obj_j, dir, page, counter, t)?;
    return Ok(obj_i);
  }

  let mut canvas = RgbImage::from_pixel(real_w as u32, real_h as u32, image::Rgb([255, 255, 255]));
  // Later paint wins in the seam, so the head record goes on top.
  imageops::replace(&mut canvas, &img_j, x0_j, y0_j);
  imageops::replace(&mut canvas, &img_i, x0_i, y0_i);

  Ok(ImageRecord {
    xref: None,
    ext: obj_j.ext.clone(),
    filter: None,
    colorspace: obj_j.colorspace,
    alt_colorspace: None,
    smask: None,
    width: real_w as u32,
    height: real_h as u32,
    bbox: Some(sketch),
    pixels: Some(canvas),
    resolved: None,
  })
}

/// Load a record as an RGB raster for compositing. Colorspace-less
/// single-band objects decode photometrically inverted and are flipped
/// back; alpha is flattened against white because the merge canvas has no
/// alpha plane.
fn load_rgb(pdf: &PdfFile, rec: &ImageRecord) -> Result<RgbImage> {
  if let Some(px) = &rec.pixels {
    return Ok(px.clone());
  }
  let Some(xref) = rec.xref else {
    return Err(ExtractError::Decode {
      xref: (0, 0),
      reason: "record has neither pixels nor an xref".to_string(),
    });
  };
  let pix = pdf.pixmap(xref)?;
  let mut dynamic = pix.to_dynamic()?;
  if pix.colorspace.is_none() && pix.n == 1 {
    dynamic.invert();
  }
  Ok(match dynamic {
    DynamicImage::ImageRgba8(ref rgba) => flatten_onto_white(rgba),
    other => other.to_rgb8(),
  })
}

fn flush_record(
  pdf: &PdfFile,
  rec: &ImageRecord,
  dir: &Path,
  page: u32,
  counter: &mut u32,
  t: &Tunables,
) -> Result<()> {
  match load_rgb(pdf, rec) {
    Ok(img) => flush_loaded(&img, rec, dir, page, counter, t),
    Err(e) => {
      debug!(page, "flush skipped, record does not decode: {e}");
      Ok(())
    }
  }
}

fn flush_loaded(
  img: &RgbImage,
  rec: &ImageRecord,
  dir: &Path,
  page: u32,
  counter: &mut u32,
  t: &Tunables,
) -> Result<()> {
  if img.width() < t.min_width || img.height() < t.min_height {
    return Ok(());
  }
  let path = writer::output_name(dir, page, rec.bbox.as_ref(), *counter);
  writer::save_png(&DynamicImage::ImageRgb8(img.clone()), &path)?;
  *counter += 1;
  Ok(())
}

fn sort_figures(figures: &mut [ImageRecord]) {
  figures.sort_by(|a, b| {
    sort_key(a)
      .partial_cmp(&sort_key(b))
      .unwrap_or(Ordering::Equal)
  });
}

fn sort_key(rec: &ImageRecord) -> (f64, f64, f64, f64) {
  match rec.bbox {
    Some(b) => (b.x1, b.y1, b.x0, b.y0),
    None => (0.0, 0.0, 0.0, 0.0),
  }
}
