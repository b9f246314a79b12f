//! Batch cleanup of a document's output directory: single-color artifacts
//! and near-duplicate images are removed after all pages are written.

use crate::error::Result;
use crate::types::Tunables;
use image::{DynamicImage, GenericImageView};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Clone, Debug)]
struct OutputEntry {
  page: i64,
  /// `[x0, y0, x1, y1]` from the filename; `None` for the simple
  /// safe/unsafe naming scheme, which carries no placement.
  coords: Option<[f64; 4]>,
  counter: i64,
  path: PathBuf,
}

/// Remove single-color and near-duplicate images from `dir`.
///
/// Entries are visited newest-counter first so late synthetic merges win
/// tie-breaks against the pieces they were built from.
pub(crate) fn postprocess_dir(dir: &Path, t: &Tunables) -> Result<()> {
  if !dir.is_dir() {
    return Ok(());
  }

  let mut entries: Vec<OutputEntry> = std::fs::read_dir(dir)?
    .filter_map(|e| e.ok())
    .map(|e| e.path())
    .filter(|p| p.extension().is_some_and(|x| x == "png"))
    .filter_map(|p| parse_name(&p))
    .collect();
  entries.sort_by_key(|e| std::cmp::Reverse(e.counter));

  let mut queue: VecDeque<OutputEntry> = entries.into();
  while let Some(entry) = queue.pop_front() {
    let img = match image::open(&entry.path) {
      Ok(i) => i,
      Err(e) => {
        debug!(path = %entry.path.display(), "unreadable output skipped: {e}");
        continue;
      }
    };

    if is_single_color(&img) {
      std::fs::remove_file(&entry.path)?;
      continue;
    }

    let mut idx = 0;
    while idx < queue.len() {
      if !coords_close(&entry, &queue[idx], t) {
        idx += 1;
        continue;
      }
      let other = queue[idx].clone();
      let other_img = match image::open(&other.path) {
        Ok(i) => i,
        Err(_) => {
          idx += 1;
          continue;
        }
      };
      if let Some(victim) = duplicate_victim(&entry, &img, &other, &other_img) {
        if victim == other.path {
          // The survivor takes the loser's queue slot and is revisited.
          queue[idx] = entry.clone();
        }
        std::fs::remove_file(&victim)?;
        break;
      }
      idx += 1;
    }
  }
  Ok(())
}

/// Parse `p-<page>-x0-<x0>-y0-<y0>-x1-<x1>-y1-<y1>-<counter>.png`, or the
/// coordinate-less `p-<page>-<counter>.png` used by the fallback modes.
fn parse_name(path: &Path) -> Option<OutputEntry> {
  let stem = path.file_name()?.to_str()?.strip_suffix(".png")?;
  let rest = stem.strip_prefix("p-")?;
  let (head, counter) = rest.rsplit_once('-')?;
  let counter: i64 = counter.parse().ok()?;

  if let Some((page_str, coord_str)) = head.split_once("-x0-") {
    let page = page_str.parse().ok()?;
    let (x0, rest1) = coord_str.split_once("-y0-")?;
    let (y0, rest2) = rest1.split_once("-x1-")?;
    let (x1, y1) = rest2.split_once("-y1-")?;
    Some(OutputEntry {
      page,
      coords: Some([
        x0.parse().ok()?,
        y0.parse().ok()?,
        x1.parse().ok()?,
        y1.parse().ok()?,
      ]),
      counter,
      path: path.to_path_buf(),
    })
  } else {
    Some(OutputEntry {
      page: head.parse().ok()?,
      coords: None,
      counter,
      path: path.to_path_buf(),
    })
  }
}

fn isclose(a: f64, b: f64, t: &Tunables) -> bool {
  (a - b).abs() <= t.isclose_atol + t.isclose_rtol * b.abs()
}

fn coords_close(a: &OutputEntry, b: &OutputEntry, t: &Tunables) -> bool {
  let (Some(ca), Some(cb)) = (&a.coords, &b.coords) else {
    return false;
  };
  isclose(a.page as f64, b.page as f64, t)
    && ca.iter().zip(cb.iter()).all(|(x, y)| isclose(*x, *y, t))
}

/// Every channel's (min, max) coincide.
fn is_single_color(img: &DynamicImage) -> bool {
  fn bands<const N: usize>(data: &[u8]) -> bool {
    let mut min = [255u8; N];
    let mut max = [0u8; N];
    for px in data.chunks_exact(N) {
      for c in 0..N {
        min[c] = min[c].min(px[c]);
        max[c] = max[c].max(px[c]);
      }
    }
    min == max
  }
  match img {
    DynamicImage::ImageLuma8(b) => bands::<1>(b.as_raw()),
    DynamicImage::ImageLumaA8(b) => bands::<2>(b.as_raw()),
    DynamicImage::ImageRgb8(b) => bands::<3>(b.as_raw()),
    DynamicImage::ImageRgba8(b) => bands::<4>(b.as_raw()),
    other => bands::<3>(other.to_rgb8().as_raw()),
  }
}

fn is_grayscale(img: &DynamicImage) -> bool {
  matches!(
    img,
    DynamicImage::ImageLuma8(_) | DynamicImage::ImageLumaA8(_)
  )
}

/// Decide which of two co-located images to delete, if any:
/// differing sizes never count as duplicates; a grayscale copy loses to a
/// color copy; of two grayscale copies the older counter loses; two color
/// copies must match pixel-for-pixel, then the queue-front one loses.
fn duplicate_victim(
  i: &OutputEntry,
  img_i: &DynamicImage,
  j: &OutputEntry,
  img_j: &DynamicImage,
) -> Option<PathBuf> {
  if img_i.dimensions() != img_j.dimensions() {
    return None;
  }

  let gray_i = is_grayscale(img_i);
  let gray_j = is_grayscale(img_j);
  if gray_i != gray_j {
    return Some(if gray_j { j.path.clone() } else { i.path.clone() });
  }
  if gray_i && gray_j {
    return Some(if i.counter < j.counter {
      i.path.clone()
    } else {
      j.path.clone()
    });
  }

  match (img_i, img_j) {
    (DynamicImage::ImageRgb8(a), DynamicImage::ImageRgb8(b)) if a.as_raw() == b.as_raw() => {
      Some(i.path.clone())
    }
    (DynamicImage::ImageRgba8(a), DynamicImage::ImageRgba8(b)) if a.as_raw() == b.as_raw() => {
      Some(i.path.clone())
    }
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::{GrayImage, RgbImage};

  fn coord_path(dir: &Path, coords: [f64; 4], counter: i64) -> PathBuf {
    dir.join(format!(
      "p-1-x0-{:.3}-y0-{:.3}-x1-{:.3}-y1-{:.3}-{}.png",
      coords[0], coords[1], coords[2], coords[3], counter
    ))
  }

  fn gradient(w: u32, h: u32) -> RgbImage {
    RgbImage::from_fn(w, h, |x, _| image::Rgb([(x * 7 % 256) as u8, 10, 200]))
  }

  fn survivors(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
      .unwrap()
      .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
      .collect();
    names.sort();
    names
  }

  #[test]
  fn parse_coordinate_name() {
    let entry = parse_name(Path::new("p-3-x0-100.000-y0-50.500-x1-700.000-y1-250.000-12.png")).unwrap();
    assert_eq!(entry.page, 3);
    assert_eq!(entry.counter, 12);
    assert_eq!(entry.coords, Some([100.0, 50.5, 700.0, 250.0]));
  }

  #[test]
  fn parse_negative_coordinates() {
    let entry = parse_name(Path::new("p-1-x0--12.000-y0-0.000-x1-88.000-y1-40.000-2.png")).unwrap();
    assert_eq!(entry.coords, Some([-12.0, 0.0, 88.0, 40.0]));
  }

  #[test]
  fn parse_plain_name() {
    let entry = parse_name(Path::new("p-7-4.png")).unwrap();
    assert_eq!(entry.page, 7);
    assert_eq!(entry.counter, 4);
    assert!(entry.coords.is_none());
  }

  #[test]
  fn parse_rejects_foreign_files() {
    assert!(parse_name(Path::new("figure.png")).is_none());
    assert!(parse_name(Path::new("p-x-1.png")).is_none());
  }

  #[test]
  fn single_color_file_is_removed() {
    let dir = tempfile::tempdir().unwrap();
    let coords = [10.0, 10.0, 200.0, 200.0];
    RgbImage::from_pixel(32, 32, image::Rgb([40, 40, 40]))
      .save(coord_path(dir.path(), coords, 2))
      .unwrap();
    gradient(32, 32).save(coord_path(dir.path(), coords, 1)).unwrap();

    postprocess_dir(dir.path(), &Tunables::default()).unwrap();

    let names = survivors(dir.path());
    assert_eq!(names.len(), 1);
    assert!(names[0].ends_with("-1.png"));
  }

  #[test]
  fn grayscale_duplicate_loses_to_color() {
    let dir = tempfile::tempdir().unwrap();
    let coords = [0.0, 0.0, 100.0, 100.0];
    gradient(16, 16).save(coord_path(dir.path(), coords, 1)).unwrap();
    GrayImage::from_fn(16, 16, |x, _| image::Luma([(x * 11 % 256) as u8]))
      .save(coord_path(dir.path(), coords, 2))
      .unwrap();

    postprocess_dir(dir.path(), &Tunables::default()).unwrap();

    let names = survivors(dir.path());
    assert_eq!(names.len(), 1);
    assert!(names[0].ends_with("-1.png"));
  }

  #[test]
  fn older_grayscale_duplicate_is_removed() {
    let dir = tempfile::tempdir().unwrap();
    let coords = [0.0, 0.0, 100.0, 100.0];
    let gray = |seed: u32| GrayImage::from_fn(16, 16, move |x, y| image::Luma([((x + y * seed) % 251) as u8]));
    gray(3).save(coord_path(dir.path(), coords, 1)).unwrap();
    gray(5).save(coord_path(dir.path(), coords, 2)).unwrap();

    postprocess_dir(dir.path(), &Tunables::default()).unwrap();

    let names = survivors(dir.path());
    assert_eq!(names.len(), 1);
    assert!(names[0].ends_with("-2.png"));
  }

  #[test]
  fn identical_color_duplicates_keep_one() {
    let dir = tempfile::tempdir().unwrap();
    let coords = [5.0, 5.0, 50.0, 50.0];
    gradient(16, 16).save(coord_path(dir.path(), coords, 1)).unwrap();
    gradient(16, 16).save(coord_path(dir.path(), coords, 2)).unwrap();

    postprocess_dir(dir.path(), &Tunables::default()).unwrap();

    assert_eq!(survivors(dir.path()).len(), 1);
  }

  #[test]
  fn different_sizes_are_not_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let coords = [5.0, 5.0, 50.0, 50.0];
    gradient(16, 16).save(coord_path(dir.path(), coords, 1)).unwrap();
    gradient(32, 32).save(coord_path(dir.path(), coords, 2)).unwrap();

    postprocess_dir(dir.path(), &Tunables::default()).unwrap();

    assert_eq!(survivors(dir.path()).len(), 2);
  }

  #[test]
  fn distant_coordinates_are_not_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    gradient(16, 16)
      .save(coord_path(dir.path(), [0.0, 0.0, 100.0, 100.0], 1))
      .unwrap();
    gradient(16, 16)
      .save(coord_path(dir.path(), [300.0, 0.0, 400.0, 100.0], 2))
      .unwrap();

    postprocess_dir(dir.path(), &Tunables::default()).unwrap();

    assert_eq!(survivors(dir.path()).len(), 2);
  }

  #[test]
  fn safe_mode_names_only_get_single_color_pass() {
    let dir = tempfile::tempdir().unwrap();
    RgbImage::from_pixel(32, 32, image::Rgb([9, 9, 9]))
      .save(dir.path().join("p-1-1.png"))
      .unwrap();
    gradient(32, 32).save(dir.path().join("p-1-2.png")).unwrap();
    gradient(32, 32).save(dir.path().join("p-1-3.png")).unwrap();

    postprocess_dir(dir.path(), &Tunables::default()).unwrap();

    // The flat filler goes; the identical twins stay, since these names
    // carry no placement to dedup on.
    assert_eq!(survivors(dir.path()), vec!["p-1-2.png", "p-1-3.png"]);
  }

  #[test]
  fn postprocessing_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let coords = [10.0, 10.0, 200.0, 200.0];
    RgbImage::from_pixel(32, 32, image::Rgb([40, 40, 40]))
      .save(coord_path(dir.path(), coords, 3))
      .unwrap();
    gradient(16, 16).save(coord_path(dir.path(), coords, 2)).unwrap();
    gradient(16, 16).save(coord_path(dir.path(), coords, 1)).unwrap();

    let t = Tunables::default();
    postprocess_dir(dir.path(), &t).unwrap();
    let first = survivors(dir.path());
    postprocess_dir(dir.path(), &t).unwrap();
    assert_eq!(first, survivors(dir.path()));
    assert_eq!(first.len(), 1);
  }
}
