//! Per-page driver for normal mode: correlate, cluster, then write each
//! cluster either directly or through the assembler.

use super::assemble::assemble_cluster;
use super::cluster::build_overlap_sets;
use super::correlate::correlate_page;
use super::deadline::Deadline;
use super::document::PdfFile;
use super::record::ImageRecord;
use super::writer;
use crate::error::Result;
use crate::types::Tunables;
use lopdf::ObjectId;
use std::collections::HashSet;
use std::path::Path;

#[allow(clippy::too_many_arguments)]
pub(crate) fn extract_page(
  pdf: &PdfFile,
  page_num: u32,
  page_id: ObjectId,
  dir: &Path,
  counter: &mut u32,
  xrefs_checked: &mut HashSet<ObjectId>,
  t: &Tunables,
  deadline: &Deadline,
) -> Result<()> {
  let figures = correlate_page(pdf, page_num, page_id, xrefs_checked, t, deadline)?;
  if figures.is_empty() {
    return Ok(());
  }
  if figures.len() == 1 {
    return save_single(pdf, &figures[0], dir, page_num, counter, t);
  }

  for set in build_overlap_sets(&figures, t) {
    deadline.check()?;
    let members: Vec<ImageRecord> = set.iter().map(|&i| figures[i].clone()).collect();
    // Stencil-masked leaders bypass the assembler: their pixels go out
    // composed with the mask, never merged with neighbours.
    if members[0].has_alpha() || members.len() == 1 {
      save_single(pdf, &members[0], dir, page_num, counter, t)?;
    } else {
      assemble_cluster(pdf, members, dir, page_num, counter, t, deadline)?;
    }
  }
  Ok(())
}

fn save_single(
  pdf: &PdfFile,
  rec: &ImageRecord,
  dir: &Path,
  page: u32,
  counter: &mut u32,
  t: &Tunables,
) -> Result<()> {
  let path = writer::output_name(dir, page, rec.bbox.as_ref(), *counter);
  if writer::write_image_record(pdf, rec, &path, t)? {
    *counter += 1;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::core::testdoc;
  use std::time::Duration;

  fn run_first_page(pdf: &PdfFile, dir: &Path) -> u32 {
    let t = Tunables::default();
    let deadline = Deadline::new(Duration::from_secs(600), None);
    let mut counter = 1;
    let mut checked = HashSet::new();
    let (page_num, page_id) = pdf.pages()[0];
    extract_page(pdf, page_num, page_id, dir, &mut counter, &mut checked, &t, &deadline).unwrap();
    counter
  }

  fn written(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
      .unwrap()
      .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
      .collect();
    names.sort();
    names
  }

  #[test]
  fn single_image_page_writes_one_coordinate_file() {
    let dir = tempfile::tempdir().unwrap();
    let pdf = testdoc::single_image_pdf(20, 20, testdoc::gradient_rgb(20, 20));
    let counter = run_first_page(&pdf, dir.path());
    assert_eq!(counter, 2);
    let names = written(dir.path());
    assert_eq!(names.len(), 1);
    assert_eq!(
      names[0],
      "p-1-x0-100.000-y0-542.000-x1-400.000-y1-742.000-1.png"
    );
  }

  #[test]
  fn masked_image_writes_rgba_with_its_coordinates() {
    let dir = tempfile::tempdir().unwrap();
    let pdf = testdoc::masked_image_pdf(20, 20);
    run_first_page(&pdf, dir.path());
    let names = written(dir.path());
    assert_eq!(names.len(), 1);
    assert_eq!(
      names[0],
      "p-1-x0-10.000-y0-10.000-x1-210.000-y1-210.000-1.png"
    );
    let img = image::open(dir.path().join(&names[0])).unwrap();
    assert!(matches!(img, image::DynamicImage::ImageRgba8(_)));
  }

  #[test]
  fn undersized_images_produce_no_output() {
    let dir = tempfile::tempdir().unwrap();
    // 4x4 source pixels fall under the minimum output size.
    let pdf = testdoc::single_image_pdf(4, 4, testdoc::gradient_rgb(4, 4));
    let counter = run_first_page(&pdf, dir.path());
    assert_eq!(counter, 1);
    assert!(written(dir.path()).is_empty());
  }
}
