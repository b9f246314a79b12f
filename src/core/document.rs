//! Thin capability surface over lopdf.
//!
//! Everything library-specific lives here: resource-tree walks, content
//! stream interpretation for painted-image bounding boxes, and stream
//! extraction. The rest of the pipeline only sees [`XrefImage`],
//! [`ImageBlock`], [`ExtractedImage`] and [`Pixmap`].

use super::geometry::{Matrix, Point, Rect};
use super::pixmap::{
  Colorspace, Pixmap, decompress_stream_content, get_dict_int, image_stream, resolve_color_space,
  resolve_filter,
};
use crate::error::{ExtractError, Result};
use lopdf::{Document, Object, ObjectId};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::debug;

/// Forms nested deeper than this are not descended into.
const MAX_FORM_DEPTH: u8 = 6;

/// One image XObject reachable from a page's resources.
#[derive(Clone, Debug)]
pub(crate) struct XrefImage {
  pub xref: ObjectId,
  pub smask: Option<ObjectId>,
  pub width: u32,
  pub height: u32,
  pub bpc: u32,
  /// Resolved colorspace name ("DeviceRGB", "Separation", "ICCBased3", ...).
  pub cs_name: String,
  pub filter: Option<String>,
}

/// One image paint found while interpreting a page's content streams.
/// Carries no identity the correlator may use — matching against xref
/// objects goes through the `image` bytes.
#[derive(Clone)]
pub(crate) struct ImageBlock {
  /// Painted area, top-left origin page space.
  pub bbox: Rect,
  /// Decoded stream bytes for mask-less objects; the base pixmap's PNG
  /// serialization for objects that carry a stencil mask.
  pub image: Vec<u8>,
  pub width: u32,
  pub height: u32,
  /// Source object, exposed for the no-correlation unsafe mode only.
  pub xref: ObjectId,
}

/// Decoded-stream view of an image XObject.
#[derive(Clone)]
pub(crate) struct ExtractedImage {
  pub ext: String,
  pub smask: Option<ObjectId>,
  /// Component count (1 gray, 3 RGB, 4 CMYK).
  pub colorspace: i64,
  pub width: u32,
  pub height: u32,
  pub image: Vec<u8>,
}

/// An open PDF document. Exclusively owned by one extraction run; the
/// underlying handle is released on drop on every exit path.
pub(crate) struct PdfFile {
  doc: Document,
}

impl PdfFile {
  pub fn open(path: &Path) -> Result<PdfFile> {
    let doc = Document::load(path).map_err(|source| ExtractError::Open {
      path: path.to_path_buf(),
      source,
    })?;
    Ok(PdfFile { doc })
  }

  #[allow(dead_code)]
  pub fn from_bytes(buf: &[u8]) -> Result<PdfFile> {
    Ok(PdfFile {
      doc: Document::load_mem(buf)?,
    })
  }

  #[cfg(test)]
  pub fn from_document(doc: Document) -> PdfFile {
    PdfFile { doc }
  }

  /// Page numbers and ids, ascending.
  pub fn pages(&self) -> Vec<(u32, ObjectId)> {
    self.doc.get_pages().into_iter().collect()
  }

  // ── Xref image enumeration ────────────────────────────────────

  /// All image XObjects reachable from the page's resources, including
  /// images inside nested Form XObjects, in resource order.
  pub fn xref_images(&self, page_id: ObjectId) -> Vec<XrefImage> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    if let Some(resources) = self.inherited_resources(page_id) {
      self.collect_xref_images(&resources, &mut seen, &mut out, 0);
    }
    out
  }

  fn collect_xref_images(
    &self,
    resources: &lopdf::Dictionary,
    seen: &mut HashSet<ObjectId>,
    out: &mut Vec<XrefImage>,
    depth: u8,
  ) {
    let xobjects = match resources
      .get(b"XObject")
      .ok()
      .and_then(|o| self.resolve_to_dict(o))
    {
      Some(d) => d,
      None => return,
    };

    for (_name, obj_ref) in xobjects.iter() {
      let obj_id = match obj_ref {
        Object::Reference(id) => *id,
        _ => continue,
      };

      let stream = match self.doc.get_object(obj_id) {
        Ok(Object::Stream(s)) => s,
        _ => continue,
      };

      match xobject_subtype(stream) {
        Some(b"Image") => {
          if !seen.insert(obj_id) {
            continue;
          }
          let width = get_dict_int(&stream.dict, b"Width").unwrap_or(0) as u32;
          let height = get_dict_int(&stream.dict, b"Height").unwrap_or(0) as u32;
          if width == 0 || height == 0 {
            continue;
          }
          let smask = match stream.dict.get(b"SMask") {
            Ok(Object::Reference(id)) => Some(*id),
            _ => None,
          };
          out.push(XrefImage {
            xref: obj_id,
            smask,
            width,
            height,
            bpc: get_dict_int(&stream.dict, b"BitsPerComponent").unwrap_or(8) as u32,
            cs_name: resolve_color_space(&self.doc, &stream.dict),
            filter: resolve_filter(&stream.dict),
          });
        }
        Some(b"Form") if depth < MAX_FORM_DEPTH => {
          if !seen.insert(obj_id) {
            continue;
          }
          if let Some(form_res) = stream
            .dict
            .get(b"Resources")
            .ok()
            .and_then(|o| self.resolve_to_dict(o))
          {
            self.collect_xref_images(&form_res, seen, out, depth + 1);
          }
        }
        _ => {}
      }
    }
  }

  // ── Layout image blocks ───────────────────────────────────────

  /// Interpret the page's content streams and report every image paint
  /// with its page-space bounding box (top-left origin).
  pub fn layout_blocks(&self, page_id: ObjectId) -> Result<Vec<ImageBlock>> {
    let resources = match self.inherited_resources(page_id) {
      Some(r) => r,
      None => return Ok(Vec::new()),
    };
    let content = self.page_content(page_id)?;
    let page_h = self.page_height(page_id);

    let mut blocks = Vec::new();
    let mut cache: HashMap<ObjectId, Vec<u8>> = HashMap::new();
    self.walk_content(
      &content,
      &resources,
      Matrix::identity(),
      page_h,
      0,
      &mut cache,
      &mut blocks,
    )?;
    Ok(blocks)
  }

  #[allow(clippy::too_many_arguments)]
  fn walk_content(
    &self,
    content: &[u8],
    resources: &lopdf::Dictionary,
    base_ctm: Matrix,
    page_h: f64,
    depth: u8,
    cache: &mut HashMap<ObjectId, Vec<u8>>,
    blocks: &mut Vec<ImageBlock>,
  ) -> Result<()> {
    let ops = lopdf::content::Content::decode(content)?;

    let mut ctm = base_ctm;
    let mut stack: Vec<Matrix> = Vec::new();

    for op in &ops.operations {
      match op.operator.as_str() {
        "q" => stack.push(ctm),
        "Q" => {
          if let Some(m) = stack.pop() {
            ctm = m;
          }
        }
        "cm" => {
          if op.operands.len() == 6 {
            let v: Vec<f64> = op.operands.iter().filter_map(to_f64).collect();
            if v.len() == 6 {
              ctm = Matrix::new(v[0], v[1], v[2], v[3], v[4], v[5]).then(&ctm);
            }
          }
        }
        "Do" => {
          let name = match op.operands.first() {
            Some(Object::Name(n)) => n,
            _ => continue,
          };
          let obj_id = match resources
            .get(b"XObject")
            .ok()
            .and_then(|o| self.resolve_to_dict(o))
            .and_then(|x| match x.get(name.as_slice()) {
              Ok(Object::Reference(id)) => Some(*id),
              _ => None,
            }) {
            Some(id) => id,
            None => continue,
          };
          let stream = match self.doc.get_object(obj_id) {
            Ok(Object::Stream(s)) => s,
            _ => continue,
          };
          match xobject_subtype(stream) {
            Some(b"Image") => {
              let bytes = match self.block_bytes(obj_id, cache) {
                Ok(b) => b,
                Err(e) => {
                  debug!(xref = obj_id.0, "skipping undecodable image paint: {e}");
                  continue;
                }
              };
              blocks.push(ImageBlock {
                bbox: painted_bbox(&ctm, page_h),
                image: bytes,
                width: get_dict_int(&stream.dict, b"Width").unwrap_or(0) as u32,
                height: get_dict_int(&stream.dict, b"Height").unwrap_or(0) as u32,
                xref: obj_id,
              });
            }
            Some(b"Form") if depth < MAX_FORM_DEPTH => {
              let form_matrix = form_matrix(&stream.dict);
              let form_res = stream
                .dict
                .get(b"Resources")
                .ok()
                .and_then(|o| self.resolve_to_dict(o))
                .unwrap_or_else(|| resources.clone());
              let mut s = stream.clone();
              let _ = s.decompress();
              self.walk_content(
                &s.content,
                &form_res,
                form_matrix.then(&ctm),
                page_h,
                depth + 1,
                cache,
                blocks,
              )?;
            }
            _ => {}
          }
        }
        _ => {}
      }
    }
    Ok(())
  }

  /// Bytes the correlator matches a layout block against: the decoded
  /// stream for plain images, the base pixmap's PNG for masked ones.
  fn block_bytes(&self, xref: ObjectId, cache: &mut HashMap<ObjectId, Vec<u8>>) -> Result<Vec<u8>> {
    if let Some(bytes) = cache.get(&xref) {
      return Ok(bytes.clone());
    }
    let has_mask = matches!(
      image_stream(&self.doc, xref)?.dict.get(b"SMask"),
      Ok(Object::Reference(_))
    );
    let bytes = if has_mask {
      let mut pix = Pixmap::from_xref(&self.doc, xref)?;
      if pix.colorspace == Some(Colorspace::Cmyk) {
        pix = pix.to_rgb();
      }
      pix.tobytes_png()?
    } else {
      self.extract_image(xref)?.image
    };
    cache.insert(xref, bytes.clone());
    Ok(bytes)
  }

  // ── Single-object extraction ──────────────────────────────────

  /// Decoded-stream view of one image XObject. The `image` bytes are the
  /// stored stream for DCT/JPX and the inflated data otherwise, which is
  /// exactly what layout blocks of the same object carry.
  pub fn extract_image(&self, xref: ObjectId) -> Result<ExtractedImage> {
    let stream = image_stream(&self.doc, xref)?;
    let width = get_dict_int(&stream.dict, b"Width").unwrap_or(0) as u32;
    let height = get_dict_int(&stream.dict, b"Height").unwrap_or(0) as u32;
    let bpc = get_dict_int(&stream.dict, b"BitsPerComponent").unwrap_or(8) as u32;
    let cs_name = resolve_color_space(&self.doc, &stream.dict);
    let filter = resolve_filter(&stream.dict);
    let channels = Colorspace::from_pdf_name(&cs_name)
      .map(|cs| cs.components())
      .unwrap_or(3);

    let (ext, image) = match filter.as_deref() {
      Some("DCTDecode") => ("jpeg", stream.content.clone()),
      Some("JPXDecode") => ("jpx", stream.content.clone()),
      Some(_) => (
        "flate",
        decompress_stream_content(&self.doc, stream, width, height, channels, bpc),
      ),
      None => ("raw", stream.content.clone()),
    };

    let smask = match stream.dict.get(b"SMask") {
      Ok(Object::Reference(id)) => Some(*id),
      _ => None,
    };

    Ok(ExtractedImage {
      ext: ext.to_string(),
      smask,
      colorspace: channels as i64,
      width,
      height,
      image,
    })
  }

  pub fn pixmap(&self, xref: ObjectId) -> Result<Pixmap> {
    Pixmap::from_xref(&self.doc, xref)
  }

  /// Base image with the stencil mask's samples attached as alpha.
  /// CMYK bases are converted to RGB before the alpha is added.
  pub fn pixmap_with_mask(&self, xref: ObjectId, smask: ObjectId) -> Result<Pixmap> {
    let mut base = Pixmap::from_xref(&self.doc, xref)?;
    if base.colorspace == Some(Colorspace::Cmyk) {
      base = base.to_rgb();
    }
    let mask_pix = Pixmap::from_xref(&self.doc, smask)?;
    let (mask_w, mask_h) = (mask_pix.width, mask_pix.height);
    let mask = if mask_pix.n == 1 && !mask_pix.alpha {
      mask_pix.samples
    } else {
      mask_pix.to_dynamic()?.to_luma8().into_raw()
    };
    base.set_alpha(&mask, mask_w, mask_h);
    Ok(base)
  }

  /// Device-level colorspace of the object, without decoding samples.
  pub fn resolved_colorspace(&self, xref: ObjectId) -> Option<Colorspace> {
    let stream = image_stream(&self.doc, xref).ok()?;
    if matches!(stream.dict.get(b"ImageMask"), Ok(Object::Boolean(true))) {
      return None;
    }
    Colorspace::from_pdf_name(&resolve_color_space(&self.doc, &stream.dict))
  }

  // ── Page tree helpers ─────────────────────────────────────────

  /// Concatenated, decompressed content streams of a page.
  fn page_content(&self, page_id: ObjectId) -> Result<Vec<u8>> {
    let page_dict = self.doc.get_dictionary(page_id)?;
    let contents = match page_dict.get(b"Contents") {
      Ok(c) => c,
      Err(_) => return Ok(Vec::new()),
    };

    let stream_ids: Vec<ObjectId> = match contents {
      Object::Reference(id) => vec![*id],
      Object::Array(arr) => arr
        .iter()
        .filter_map(|o| {
          if let Object::Reference(id) = o {
            Some(*id)
          } else {
            None
          }
        })
        .collect(),
      _ => return Ok(Vec::new()),
    };

    let mut all_bytes = Vec::new();
    for stream_id in stream_ids {
      if let Ok(Object::Stream(s)) = self.doc.get_object(stream_id) {
        let mut s = s.clone();
        let _ = s.decompress();
        all_bytes.extend_from_slice(&s.content);
        all_bytes.push(b'\n');
      }
    }
    Ok(all_bytes)
  }

  /// Page height from the inherited CropBox, falling back to MediaBox.
  /// Used to flip content-stream coordinates into top-left origin.
  pub fn page_height(&self, page_id: ObjectId) -> f64 {
    let rect = self
      .inherited_page_box(page_id, b"CropBox")
      .or_else(|| self.inherited_page_box(page_id, b"MediaBox"))
      .unwrap_or([0.0, 0.0, 612.0, 792.0]);
    (rect[3] - rect[1]).abs()
  }

  /// Walk the page tree for /Resources, handling /Parent inheritance.
  fn inherited_resources(&self, page_id: ObjectId) -> Option<lopdf::Dictionary> {
    let mut current_id = Some(page_id);
    while let Some(id) = current_id {
      let dict = self.doc.get_dictionary(id).ok()?;
      if let Ok(resources_obj) = dict.get(b"Resources") {
        return self.resolve_to_dict(resources_obj);
      }
      current_id = dict.get(b"Parent").ok().and_then(|p| match p {
        Object::Reference(ref_id) => Some(*ref_id),
        _ => None,
      });
    }
    None
  }

  /// Walk the page tree for an inheritable page box, resolving indirect
  /// references — some producers store the box array behind one.
  fn inherited_page_box(&self, page_id: ObjectId, key: &[u8]) -> Option<[f64; 4]> {
    let mut current_id = Some(page_id);
    while let Some(id) = current_id {
      let dict = self.doc.get_dictionary(id).ok()?;
      if let Ok(obj) = dict.get(key) {
        let resolved = match obj {
          Object::Reference(ref_id) => self.doc.get_object(*ref_id).ok().cloned(),
          other => Some(other.clone()),
        };
        if let Some(ref val) = resolved
          && let Some(rect) = parse_page_box(val)
        {
          return Some(rect);
        }
      }
      current_id = dict.get(b"Parent").ok().and_then(|p| match p {
        Object::Reference(ref_id) => Some(*ref_id),
        _ => None,
      });
    }
    None
  }

  fn resolve_to_dict(&self, obj: &Object) -> Option<lopdf::Dictionary> {
    match obj {
      Object::Dictionary(d) => Some(d.clone()),
      Object::Reference(id) => match self.doc.get_object(*id).ok()? {
        Object::Dictionary(d) => Some(d.clone()),
        _ => None,
      },
      _ => None,
    }
  }
}

fn xobject_subtype(stream: &lopdf::Stream) -> Option<&[u8]> {
  stream.dict.get(b"Subtype").ok().and_then(|v| {
    if let Object::Name(n) = v {
      Some(n.as_slice())
    } else {
      None
    }
  })
}

fn to_f64(obj: &Object) -> Option<f64> {
  match obj {
    Object::Integer(i) => Some(*i as f64),
    Object::Real(f) => Some(*f as f64),
    _ => None,
  }
}

fn parse_page_box(obj: &Object) -> Option<[f64; 4]> {
  let arr = match obj {
    Object::Array(a) => a,
    _ => return None,
  };
  if arr.len() < 4 {
    return None;
  }
  let mut out = [0.0f64; 4];
  for (idx, slot) in out.iter_mut().enumerate().take(4) {
    *slot = to_f64(&arr[idx])?;
  }
  Some(out)
}

/// Default /Matrix of a Form XObject is the identity.
fn form_matrix(dict: &lopdf::Dictionary) -> Matrix {
  if let Ok(Object::Array(arr)) = dict.get(b"Matrix")
    && arr.len() == 6
  {
    let v: Vec<f64> = arr.iter().filter_map(to_f64).collect();
    if v.len() == 6 {
      return Matrix::new(v[0], v[1], v[2], v[3], v[4], v[5]);
    }
  }
  Matrix::identity()
}

/// Bounding box of the unit square an image is painted into, mapped
/// through the CTM and flipped into top-left origin.
fn painted_bbox(ctm: &Matrix, page_h: f64) -> Rect {
  let corners = [
    ctm.transform(Point::new(0.0, 0.0)),
    ctm.transform(Point::new(1.0, 0.0)),
    ctm.transform(Point::new(0.0, 1.0)),
    ctm.transform(Point::new(1.0, 1.0)),
  ];
  let x0 = corners.iter().map(|p| p.x).fold(f64::INFINITY, f64::min);
  let x1 = corners.iter().map(|p| p.x).fold(f64::NEG_INFINITY, f64::max);
  let y0 = corners.iter().map(|p| p.y).fold(f64::INFINITY, f64::min);
  let y1 = corners.iter().map(|p| p.y).fold(f64::NEG_INFINITY, f64::max);
  Rect::new(x0, page_h - y1, x1, page_h - y0)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::core::testdoc;

  #[test]
  fn painted_bbox_flips_y() {
    // 300x200 image placed at (100, 50) on a 792pt-high page.
    let ctm = Matrix::new(300.0, 0.0, 0.0, 200.0, 100.0, 50.0);
    let bbox = painted_bbox(&ctm, 792.0);
    assert_eq!(bbox, Rect::new(100.0, 542.0, 400.0, 742.0));
  }

  #[test]
  fn enumerates_xref_images_with_metadata() {
    let pdf = testdoc::single_image_pdf(20, 20, testdoc::solid_rgb(20, 20, [10, 200, 30]));
    let (_, page_id) = pdf.pages()[0];
    let images = pdf.xref_images(page_id);
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].width, 20);
    assert_eq!(images[0].height, 20);
    assert_eq!(images[0].cs_name, "DeviceRGB");
    assert!(images[0].smask.is_none());
  }

  #[test]
  fn layout_blocks_carry_ctm_bbox() {
    let pdf = testdoc::single_image_pdf(20, 20, testdoc::solid_rgb(20, 20, [10, 200, 30]));
    let (_, page_id) = pdf.pages()[0];
    let blocks = pdf.layout_blocks(page_id).unwrap();
    assert_eq!(blocks.len(), 1);
    // testdoc paints at `q 300 0 0 200 100 50 cm /Im0 Do Q` on 612x792.
    assert_eq!(blocks[0].bbox, Rect::new(100.0, 542.0, 400.0, 742.0));
    assert_eq!(blocks[0].width, 20);
  }

  #[test]
  fn block_bytes_match_extract_image() {
    let pdf = testdoc::single_image_pdf(20, 20, testdoc::solid_rgb(20, 20, [10, 200, 30]));
    let (_, page_id) = pdf.pages()[0];
    let blocks = pdf.layout_blocks(page_id).unwrap();
    let images = pdf.xref_images(page_id);
    let extracted = pdf.extract_image(images[0].xref).unwrap();
    assert_eq!(blocks[0].image, extracted.image);
    assert_eq!(extracted.ext, "raw");
    assert_eq!(extracted.colorspace, 3);
  }

  #[test]
  fn extract_image_reports_smask() {
    let pdf = testdoc::masked_image_pdf(20, 20);
    let (_, page_id) = pdf.pages()[0];
    let images = pdf.xref_images(page_id);
    assert_eq!(images.len(), 1);
    let extracted = pdf.extract_image(images[0].xref).unwrap();
    assert!(extracted.smask.is_some());
    // Masked objects publish their block bytes as a PNG of the base.
    let blocks = pdf.layout_blocks(page_id).unwrap();
    let pix = pdf.pixmap(images[0].xref).unwrap();
    assert_eq!(blocks[0].image, pix.tobytes_png().unwrap());
  }

  #[test]
  fn pixmap_with_mask_attaches_alpha() {
    let pdf = testdoc::masked_image_pdf(20, 20);
    let (_, page_id) = pdf.pages()[0];
    let img = &pdf.xref_images(page_id)[0];
    let pix = pdf.pixmap_with_mask(img.xref, img.smask.unwrap()).unwrap();
    assert!(pix.alpha);
    assert_eq!(pix.colorspace, Some(crate::core::pixmap::Colorspace::Rgb));
  }

  #[test]
  fn page_height_comes_from_the_media_box() {
    let pdf = testdoc::single_image_pdf(20, 20, testdoc::solid_rgb(20, 20, [1, 2, 3]));
    let (_, page_id) = pdf.pages()[0];
    assert_eq!(pdf.page_height(page_id), 792.0);
  }
}
