#![deny(clippy::all)]

//! Recover embedded raster figures from scientific PDF documents.
//!
//! Figures in published PDFs are frequently split across several embedded
//! image objects — a base raster plus overlays, stencil masks or tiles —
//! with conflicting cross-reference metadata and mixed colorspaces. Naïve
//! extraction yields fragments. This crate reconstructs the visually
//! intended figures: it correlates xref image objects with the image
//! blocks painted on each page, clusters spatially related pieces,
//! reassembles each cluster into a single lossless bitmap, and cleans
//! duplicate and single-color artifacts out of the result.
//!
//! Three modes are offered per document: `Normal` (the full pipeline,
//! falling back to `Safe` on timeout or error), `Safe` (one file per xref
//! image, no compositing) and `Unsafe` (one file per painted block, no
//! correlation). See [`Extractor`].

mod core;
mod error;
mod types;

pub use error::{ExtractError, Result};
pub use types::{CancelToken, DocumentReport, ExtractionMode, Tunables};

use crate::core::deadline::Deadline;
use crate::core::document::PdfFile;
use crate::core::page::extract_page;
use crate::core::postprocess::postprocess_dir;
use crate::core::writer;
use lopdf::ObjectId;
use rayon::prelude::*;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Batch driver: owns the input list, tuning parameters and cancellation,
/// and processes one document at a time. Documents are independent — no
/// state is shared between them — so batches may also run in parallel.
pub struct Extractor {
  inputs: Vec<PathBuf>,
  tunables: Tunables,
  cancel: Option<CancelToken>,
}

impl Extractor {
  /// Accepts a single `.pdf` file or a directory, which is scanned
  /// (non-recursively) for PDFs in case-insensitive name order.
  pub fn new(input: impl AsRef<Path>) -> Result<Extractor> {
    let input = input.as_ref();
    let inputs = if input.is_dir() {
      let mut files: Vec<PathBuf> = std::fs::read_dir(input)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| is_pdf(p))
        .collect();
      files.sort_by_key(|p| {
        p.file_name()
          .map(|n| n.to_string_lossy().to_lowercase())
          .unwrap_or_default()
      });
      files
    } else if is_pdf(input) {
      vec![input.to_path_buf()]
    } else {
      return Err(ExtractError::Input(format!(
        "{} is not a PDF file or a directory",
        input.display()
      )));
    };
    Ok(Extractor {
      inputs,
      tunables: Tunables::default(),
      cancel: None,
    })
  }

  /// Explicit input list; entries without a `.pdf` extension are dropped
  /// with a warning.
  pub fn from_paths(paths: impl IntoIterator<Item = PathBuf>) -> Result<Extractor> {
    let mut inputs = Vec::new();
    for path in paths {
      if is_pdf(&path) {
        inputs.push(path);
      } else {
        warn!(path = %path.display(), "not a *.pdf file, skipped");
      }
    }
    if inputs.is_empty() {
      return Err(ExtractError::Input("no PDF inputs given".to_string()));
    }
    Ok(Extractor {
      inputs,
      tunables: Tunables::default(),
      cancel: None,
    })
  }

  pub fn with_tunables(mut self, tunables: Tunables) -> Extractor {
    self.tunables = tunables;
    self
  }

  pub fn with_cancel_token(mut self, token: CancelToken) -> Extractor {
    self.cancel = Some(token);
    self
  }

  pub fn inputs(&self) -> &[PathBuf] {
    &self.inputs
  }

  /// Process every input document in order. A document that fails is
  /// reported and does not stop the batch; only cancellation aborts it.
  pub fn extract_all(&self, out_dir: &Path, mode: ExtractionMode) -> Result<Vec<DocumentReport>> {
    self.check_out_dir(out_dir)?;
    let mut reports = Vec::with_capacity(self.inputs.len());
    for pdf in &self.inputs {
      reports.push(self.extract_document(pdf, out_dir, mode)?);
    }
    Ok(reports)
  }

  /// Same as [`extract_all`](Self::extract_all) with documents spread
  /// across the rayon pool. Each document still runs single-threaded.
  pub fn extract_all_parallel(
    &self,
    out_dir: &Path,
    mode: ExtractionMode,
  ) -> Result<Vec<DocumentReport>> {
    self.check_out_dir(out_dir)?;
    self
      .inputs
      .par_iter()
      .map(|pdf| self.extract_document(pdf, out_dir, mode))
      .collect()
  }

  fn check_out_dir(&self, out_dir: &Path) -> Result<()> {
    if !out_dir.is_dir() {
      return Err(ExtractError::Input(format!(
        "output {} is not a directory",
        out_dir.display()
      )));
    }
    Ok(())
  }

  fn extract_document(
    &self,
    pdf_path: &Path,
    out_root: &Path,
    mode: ExtractionMode,
  ) -> Result<DocumentReport> {
    let stem = pdf_path
      .file_stem()
      .map(|s| s.to_string_lossy().into_owned())
      .unwrap_or_else(|| "document".to_string());
    let dir = out_root.join(&stem);
    info!(pdf = %pdf_path.display(), "processing: {}", mode.description());

    let outcome = match mode {
      ExtractionMode::Normal => self.normal_with_fallback(pdf_path, &dir),
      ExtractionMode::Safe => self.safe_mode(pdf_path, &dir).map(|_| ExtractionMode::Safe),
      ExtractionMode::Unsafe => self
        .unsafe_mode(pdf_path, &dir)
        .map(|_| ExtractionMode::Unsafe),
    };

    let mode_used = match outcome {
      Ok(used) => Some(used),
      Err(ExtractError::Cancelled) => return Err(ExtractError::Cancelled),
      Err(e) => {
        error!(pdf = %pdf_path.display(), "cannot complete extraction: {e}");
        None
      }
    };

    // The cleanup pass runs over whatever output exists, failure or not.
    if mode == ExtractionMode::Normal
      && let Err(e) = postprocess_dir(&dir, &self.tunables)
    {
      error!(dir = %dir.display(), "post-processing failed: {e}");
    }

    Ok(DocumentReport {
      pdf: pdf_path.to_path_buf(),
      out_dir: dir.clone(),
      mode_used,
      images: collect_images(&dir),
    })
  }

  /// Normal mode under a deadline; on timeout or any other failure the
  /// partial output is purged and the document retried in safe mode under
  /// a fresh deadline. Cancellation propagates immediately and leaves
  /// output in place.
  fn normal_with_fallback(&self, pdf_path: &Path, dir: &Path) -> Result<ExtractionMode> {
    match self.normal_mode(pdf_path, dir) {
      Ok(()) => Ok(ExtractionMode::Normal),
      Err(ExtractError::Cancelled) => Err(ExtractError::Cancelled),
      Err(e) => {
        info!(pdf = %pdf_path.display(), "normal mode failed ({e}), retrying in safe mode");
        remove_partial(dir)?;
        match self.safe_mode(pdf_path, dir) {
          Ok(()) => Ok(ExtractionMode::Safe),
          Err(ExtractError::Cancelled) => Err(ExtractError::Cancelled),
          Err(e2) => {
            remove_partial(dir)?;
            Err(e2)
          }
        }
      }
    }
  }

  fn normal_mode(&self, pdf_path: &Path, dir: &Path) -> Result<()> {
    let deadline = Deadline::new(self.tunables.timeout, self.cancel.clone());
    std::fs::create_dir_all(dir)?;
    let pdf = PdfFile::open(pdf_path)?;
    let mut counter = 1u32;
    let mut xrefs_checked: HashSet<ObjectId> = HashSet::new();
    for (page_num, page_id) in pdf.pages() {
      deadline.check()?;
      extract_page(
        &pdf,
        page_num,
        page_id,
        dir,
        &mut counter,
        &mut xrefs_checked,
        &self.tunables,
        &deadline,
      )?;
    }
    Ok(())
  }

  /// One file per xref image, no correlation or compositing. Stencil
  /// masks are still composed so transparent figures come out whole.
  fn safe_mode(&self, pdf_path: &Path, dir: &Path) -> Result<()> {
    let deadline = Deadline::new(self.tunables.timeout, self.cancel.clone());
    std::fs::create_dir_all(dir)?;
    let pdf = PdfFile::open(pdf_path)?;
    let mut counter = 1u32;
    let mut xrefs_checked: HashSet<ObjectId> = HashSet::new();

    for (page_num, page_id) in pdf.pages() {
      for meta in pdf.xref_images(page_id) {
        deadline.check()?;
        if xrefs_checked.contains(&meta.xref) {
          continue;
        }
        let path = writer::plain_name(dir, page_num, counter);
        let wrote = match meta.smask {
          Some(smask) => match pdf.pixmap_with_mask(meta.xref, smask) {
            Ok(pix) => writer::write_pixmap(&pix, &path, None, &self.tunables)?,
            Err(e) => {
              debug!(xref = meta.xref.0, "masked object skipped: {e}");
              false
            }
          },
          None => match pdf.pixmap(meta.xref) {
            Ok(pix) => writer::write_pixmap(&pix, &path, Some(&meta.cs_name), &self.tunables)?,
            Err(e) => {
              debug!(xref = meta.xref.0, "object skipped: {e}");
              false
            }
          },
        };
        if wrote {
          counter += 1;
          xrefs_checked.insert(meta.xref);
        }
      }
    }
    Ok(())
  }

  /// One file per painted layout block, duplicates and all.
  fn unsafe_mode(&self, pdf_path: &Path, dir: &Path) -> Result<()> {
    let deadline = Deadline::new(self.tunables.timeout, self.cancel.clone());
    std::fs::create_dir_all(dir)?;
    let pdf = PdfFile::open(pdf_path)?;
    let mut counter = 1u32;

    for (page_num, page_id) in pdf.pages() {
      deadline.check()?;
      for block in pdf.layout_blocks(page_id)? {
        deadline.check()?;
        let pix = match pdf.pixmap(block.xref) {
          Ok(p) => p,
          Err(e) => {
            debug!(xref = block.xref.0, "block skipped: {e}");
            continue;
          }
        };
        let path = writer::plain_name(dir, page_num, counter);
        if writer::write_pixmap(&pix, &path, None, &self.tunables)? {
          counter += 1;
        }
      }
    }
    Ok(())
  }
}

/// One-call convenience for a single document.
pub fn extract_images(
  pdf_path: impl AsRef<Path>,
  out_dir: impl AsRef<Path>,
  mode: ExtractionMode,
) -> Result<DocumentReport> {
  let extractor = Extractor::new(pdf_path)?;
  extractor
    .extract_all(out_dir.as_ref(), mode)?
    .into_iter()
    .next()
    .ok_or_else(|| ExtractError::Input("no document processed".to_string()))
}

fn is_pdf(path: &Path) -> bool {
  path.is_file()
    && path
      .extension()
      .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
}

fn remove_partial(dir: &Path) -> Result<()> {
  if dir.is_dir() {
    std::fs::remove_dir_all(dir)?;
  }
  Ok(())
}

fn collect_images(dir: &Path) -> Vec<PathBuf> {
  let mut images: Vec<PathBuf> = match std::fs::read_dir(dir) {
    Ok(rd) => rd
      .filter_map(|e| e.ok())
      .map(|e| e.path())
      .filter(|p| p.extension().is_some_and(|x| x == "png"))
      .collect(),
    Err(_) => Vec::new(),
  };
  images.sort();
  images
}
