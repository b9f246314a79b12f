use super::geometry::Rect;
use super::pixmap::Colorspace;
use crate::types::Tunables;
use image::RgbImage;
use lopdf::ObjectId;

/// One image on a page, as the pipeline sees it: either an xref-addressable
/// object inside the source document, or a synthetic composite produced by
/// the assembler (then `pixels` is set and `xref` is not).
#[derive(Clone)]
pub(crate) struct ImageRecord {
  /// Source object; `None` for synthetic records.
  pub xref: Option<ObjectId>,
  /// Source encoding tag ("jpeg", "jpx", "flate", "raw"). Informational.
  pub ext: String,
  /// PDF stream filter name; only used as a mismatch signal.
  pub filter: Option<String>,
  /// Component count as reported by the decoder (1 gray, 3 RGB, 4 CMYK).
  pub colorspace: i64,
  /// Secondary colorspace tag ("Separation", "DeviceN", "Isolate<n>", ...).
  pub alt_colorspace: Option<String>,
  /// Stencil mask object, if the image carries per-pixel alpha.
  pub smask: Option<ObjectId>,
  pub width: u32,
  pub height: u32,
  /// Page-space placement; absent when correlation failed.
  pub bbox: Option<Rect>,
  /// Decoded bitmap, present only on assembler composites.
  pub pixels: Option<RgbImage>,
  /// Device-level colorspace of the resolved pixmap, cached for the
  /// clusterer's merge guards.
  pub resolved: Option<Colorspace>,
}

impl ImageRecord {
  pub fn has_alpha(&self) -> bool {
    self.smask.is_some()
  }

  pub fn is_valid_size(&self, t: &Tunables) -> bool {
    let (w, h) = match &self.pixels {
      Some(img) => (img.width(), img.height()),
      None => (self.width, self.height),
    };
    w >= t.min_width && h >= t.min_height
  }

  /// Duplicate the record without its source handle, so derived records
  /// never re-resolve through the document.
  pub fn copy(&self) -> ImageRecord {
    ImageRecord {
      xref: None,
      ..self.clone()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn bare_record(bbox: Option<Rect>) -> ImageRecord {
    ImageRecord {
      xref: Some((7, 0)),
      ext: "flate".to_string(),
      filter: Some("FlateDecode".to_string()),
      colorspace: 3,
      alt_colorspace: None,
      smask: None,
      width: 100,
      height: 80,
      bbox,
      pixels: None,
      resolved: Some(Colorspace::Rgb),
    }
  }

  #[test]
  fn alpha_follows_smask() {
    let mut rec = bare_record(None);
    assert!(!rec.has_alpha());
    rec.smask = Some((12, 0));
    assert!(rec.has_alpha());
  }

  #[test]
  fn copy_clears_xref_only() {
    let rec = bare_record(Some(Rect::new(0.0, 0.0, 10.0, 10.0)));
    let dup = rec.copy();
    assert!(dup.xref.is_none());
    assert_eq!(dup.bbox, rec.bbox);
    assert_eq!(dup.colorspace, rec.colorspace);
    assert_eq!(dup.filter, rec.filter);
  }

  #[test]
  fn size_gate_uses_pixels_when_present() {
    let t = Tunables::default();
    let mut rec = bare_record(None);
    rec.width = 5;
    rec.height = 5;
    assert!(!rec.is_valid_size(&t));
    rec.pixels = Some(RgbImage::new(64, 64));
    assert!(rec.is_valid_size(&t));
  }
}
