//! Build the per-page working list by correlating xref image objects with
//! the layout blocks actually painted on the page.
//!
//! Byte equality between an object's decoded stream and a block's bytes is
//! the primary correlation key; pairing leftovers positionally is a logged
//! last resort. The checked-xref set is carried across pages so an object
//! reused on several pages is extracted once.

use super::deadline::Deadline;
use super::document::{ExtractedImage, ImageBlock, PdfFile, XrefImage};
use super::geometry::Rect;
use super::pixmap::Colorspace;
use super::record::ImageRecord;
use crate::error::Result;
use crate::types::Tunables;
use lopdf::ObjectId;
use std::collections::HashSet;
use tracing::{debug, warn};

pub(crate) fn correlate_page(
  pdf: &PdfFile,
  page_num: u32,
  page_id: ObjectId,
  xrefs_checked: &mut HashSet<ObjectId>,
  t: &Tunables,
  deadline: &Deadline,
) -> Result<Vec<ImageRecord>> {
  let mut blocks = pdf.layout_blocks(page_id)?;
  let metas = pdf.xref_images(page_id);
  let mut list: Vec<ImageRecord> = Vec::new();

  for meta in &metas {
    deadline.check()?;
    if xrefs_checked.contains(&meta.xref) {
      continue;
    }
    let extracted = match pdf.extract_image(meta.xref) {
      Ok(e) => e,
      Err(e) => {
        debug!(page = page_num, xref = meta.xref.0, "object skipped: {e}");
        continue;
      }
    };

    if extracted.smask.is_some() {
      handle_alpha_image(pdf, meta, &extracted, &blocks, &mut list, xrefs_checked);
      continue;
    }

    let resolved = match pdf.resolved_colorspace(meta.xref) {
      Some(cs) => cs,
      None => {
        warn!(
          page = page_num,
          xref = meta.xref.0,
          "unknown colorspace, object skipped"
        );
        continue;
      }
    };
    match_page_content(meta, &extracted, resolved, &mut blocks, &mut list, xrefs_checked, t);
  }

  if list.iter().all(|r| r.bbox.is_none()) && !blocks.is_empty() {
    if t.positional_fallback {
      warn!(
        page = page_num,
        blocks = blocks.len(),
        "no byte match on page, pairing xrefs with leftover blocks by position"
      );
      positional_zip(pdf, &metas, &blocks, xrefs_checked, &mut list);
    } else {
      debug!(page = page_num, "positional fallback disabled, leaving blocks unmatched");
    }
  }

  Ok(list)
}

fn make_record(
  meta: &XrefImage,
  extracted: &ExtractedImage,
  bbox: Option<Rect>,
  alt_colorspace: Option<String>,
  resolved: Option<Colorspace>,
) -> ImageRecord {
  ImageRecord {
    xref: Some(meta.xref),
    ext: extracted.ext.clone(),
    filter: meta.filter.clone(),
    colorspace: extracted.colorspace,
    alt_colorspace,
    smask: extracted.smask,
    width: extracted.width,
    height: extracted.height,
    bbox,
    pixels: None,
    resolved,
  }
}

/// Correlate a stencil-masked object: serialize its base pixmap to PNG and
/// look for a layout block carrying those bytes. A miss still records the
/// object, just without a placement.
fn handle_alpha_image(
  pdf: &PdfFile,
  meta: &XrefImage,
  extracted: &ExtractedImage,
  blocks: &[ImageBlock],
  list: &mut Vec<ImageRecord>,
  xrefs_checked: &mut HashSet<ObjectId>,
) {
  let png = pdf.pixmap(meta.xref).and_then(|pix| {
    let pix = if pix.colorspace == Some(Colorspace::Cmyk) {
      pix.to_rgb()
    } else {
      pix
    };
    pix.tobytes_png()
  });
  let png = match png {
    Ok(b) => b,
    Err(e) => {
      debug!(xref = meta.xref.0, "masked object skipped: {e}");
      return;
    }
  };

  let bbox = blocks.iter().find(|b| b.image == png).map(|b| b.bbox);
  let resolved = pdf.resolved_colorspace(meta.xref);
  list.push(make_record(
    meta,
    extracted,
    bbox,
    Some(meta.cs_name.clone()),
    resolved,
  ));
  xrefs_checked.insert(meta.xref);
}

/// Claim every still-unclaimed block whose bytes equal the object's
/// decoded stream. One object can legitimately claim several blocks
/// (repeated blits); repeats above the isolate threshold get a per-index
/// tag so they stay out of each other's composites.
fn match_page_content(
  meta: &XrefImage,
  extracted: &ExtractedImage,
  resolved: Colorspace,
  blocks: &mut Vec<ImageBlock>,
  list: &mut Vec<ImageRecord>,
  xrefs_checked: &mut HashSet<ObjectId>,
  t: &Tunables,
) {
  let mut index = 0;
  while index < blocks.len() {
    if extracted.image == blocks[index].image {
      let bbox = blocks[index].bbox;
      // A record already holding this exact spot with a mask means the
      // block belongs to a stencil composite, not to this object.
      let secure = !list
        .iter()
        .any(|obj| obj.bbox == Some(bbox) && obj.has_alpha());

      let alt = if xrefs_checked.contains(&meta.xref)
        && extracted.width > t.isolate_min_side
        && extracted.height > t.isolate_min_side
      {
        Some(format!("Isolate{index}"))
      } else {
        Some(meta.cs_name.clone())
      };

      if secure {
        list.push(make_record(meta, extracted, Some(bbox), alt, Some(resolved)));
        xrefs_checked.insert(meta.xref);
        blocks.remove(index);
        continue;
      }
    }
    index += 1;
  }
}

/// Last-resort pairing: walk the page's xrefs in enumeration order and
/// hand each unchecked one the next leftover block's bbox. Alpha entries
/// get no bbox. Order-sensitive and known to misalign on exotic pages.
fn positional_zip(
  pdf: &PdfFile,
  metas: &[XrefImage],
  blocks: &[ImageBlock],
  xrefs_checked: &HashSet<ObjectId>,
  list: &mut Vec<ImageRecord>,
) {
  let mut index = 0usize;
  for meta in metas {
    if xrefs_checked.contains(&meta.xref) || index >= blocks.len() {
      index += 1;
      continue;
    }
    let extracted = match pdf.extract_image(meta.xref) {
      Ok(e) => e,
      Err(_) => {
        index += 1;
        continue;
      }
    };
    let resolved = pdf.resolved_colorspace(meta.xref);
    let bbox = if extracted.smask.is_some() {
      None
    } else {
      Some(blocks[index].bbox)
    };
    list.push(make_record(
      meta,
      &extracted,
      bbox,
      Some(meta.cs_name.clone()),
      resolved,
    ));
    index += 1;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::core::testdoc;
  use lopdf::Document;
  use std::time::Duration;

  fn run_page(pdf: &PdfFile, checked: &mut HashSet<ObjectId>) -> Vec<ImageRecord> {
    let t = Tunables::default();
    let deadline = Deadline::new(Duration::from_secs(600), None);
    let (page_num, page_id) = pdf.pages()[0];
    correlate_page(pdf, page_num, page_id, checked, &t, &deadline).unwrap()
  }

  #[test]
  fn painted_image_gains_block_bbox() {
    let pdf = testdoc::single_image_pdf(20, 20, testdoc::gradient_rgb(20, 20));
    let mut checked = HashSet::new();
    let list = run_page(&pdf, &mut checked);
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].bbox, Some(Rect::new(100.0, 542.0, 400.0, 742.0)));
    assert_eq!(list[0].alt_colorspace.as_deref(), Some("DeviceRGB"));
    assert!(checked.contains(&list[0].xref.unwrap()));
  }

  #[test]
  fn checked_xrefs_are_not_recorrelated() {
    let pdf = testdoc::single_image_pdf(20, 20, testdoc::gradient_rgb(20, 20));
    let mut checked = HashSet::new();
    run_page(&pdf, &mut checked);
    // Same page again, as a stand-in for the object reappearing later in
    // the document: the carried set suppresses it. Blocks remain, no
    // records have a bbox, so the positional fallback also skips the
    // checked xref and produces nothing.
    let second = run_page(&pdf, &mut checked);
    assert!(second.is_empty());
  }

  #[test]
  fn masked_image_correlates_via_png_bytes() {
    let pdf = testdoc::masked_image_pdf(20, 20);
    let mut checked = HashSet::new();
    let list = run_page(&pdf, &mut checked);
    assert_eq!(list.len(), 1);
    assert!(list[0].has_alpha());
    assert!(list[0].bbox.is_some());
  }

  #[test]
  fn repainted_large_xref_gets_isolate_tag() {
    let mut doc = Document::with_version("1.5");
    let im = testdoc::rgb_xobject(&mut doc, 40, 40, testdoc::gradient_rgb(40, 40));
    let doc = testdoc::build_document(
      doc,
      &[("Im0", im)],
      "q 100 0 0 100 50 600 cm /Im0 Do Q q 100 0 0 100 200 600 cm /Im0 Do Q",
    );
    let pdf = PdfFile::from_document(doc);
    let mut checked = HashSet::new();
    let list = run_page(&pdf, &mut checked);
    assert_eq!(list.len(), 2);
    assert_eq!(list[0].alt_colorspace.as_deref(), Some("DeviceRGB"));
    assert_eq!(list[1].alt_colorspace.as_deref(), Some("Isolate0"));
    assert_ne!(list[0].bbox, list[1].bbox);
  }

  #[test]
  fn positional_zip_pairs_in_order() {
    let pdf = testdoc::single_image_pdf(20, 20, testdoc::gradient_rgb(20, 20));
    let (_, page_id) = pdf.pages()[0];
    let metas = pdf.xref_images(page_id);
    // A block whose bytes match nothing, as after a lossy producer.
    let blocks = vec![ImageBlock {
      bbox: Rect::new(5.0, 5.0, 25.0, 25.0),
      image: vec![1, 2, 3],
      width: 20,
      height: 20,
      xref: metas[0].xref,
    }];
    let mut list = Vec::new();
    positional_zip(&pdf, &metas, &blocks, &HashSet::new(), &mut list);
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].bbox, Some(Rect::new(5.0, 5.0, 25.0, 25.0)));
  }
}
