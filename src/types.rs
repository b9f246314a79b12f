use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

// ── Extraction modes ────────────────────────────────────────────

/// How aggressively images are recovered from a document.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExtractionMode {
  /// Extract only xref-addressable images, no compositing.
  Safe,
  /// Correlate, cluster and assemble split figures, then post-process.
  Normal,
  /// Dump every layout image block without xref warranty.
  Unsafe,
}

impl ExtractionMode {
  pub fn description(&self) -> &'static str {
    match self {
      ExtractionMode::Safe => "Safe mode - Extract only xreferred images",
      ExtractionMode::Normal => "Normal mode - Extract with duplicate and corruption handling",
      ExtractionMode::Unsafe => "Unsafe mode - Extract all images without warranty",
    }
  }
}

impl std::str::FromStr for ExtractionMode {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "safe" => Ok(ExtractionMode::Safe),
      "normal" => Ok(ExtractionMode::Normal),
      "unsafe" => Ok(ExtractionMode::Unsafe),
      other => Err(format!("invalid mode: {other}")),
    }
  }
}

// ── Tuning parameters ───────────────────────────────────────────

/// Heuristic constants of the pipeline, discovered empirically on large
/// scientific-PDF corpora. The defaults are the values the pipeline was
/// tuned with; changing them changes which figure fragments get merged.
#[derive(Clone, Debug)]
pub struct Tunables {
  /// Outputs narrower than this are dropped.
  pub min_width: u32,
  /// Outputs shorter than this are dropped.
  pub min_height: u32,
  /// Corner distance below which two rectangles count as adjacent tiles.
  pub overlap_distance: f64,
  /// Near-zero tolerance for the corner-on-edge proximity rules.
  pub overlap_distance_bbox: f64,
  /// Step by which the assembler widens its merge tolerance.
  pub merge_distance_step: f64,
  /// Tolerance at which the assembler gives up and flushes the head record.
  pub merge_distance_max: f64,
  /// Tolerance the assembler restarts from after a give-up flush.
  pub merge_distance_restart: f64,
  /// Max pixels two merged rasters may overlap on the canvas before the
  /// merge is vetoed and the smaller piece flushed on its own.
  pub canvas_overlap_px: i64,
  /// Repainted xrefs larger than this (both sides) get an Isolate tag so
  /// duplicate blits stay in distinct composites.
  pub isolate_min_side: u32,
  /// Relative tolerance for coordinate comparison in post-processing.
  pub isclose_rtol: f64,
  /// Absolute tolerance for coordinate comparison in post-processing.
  pub isclose_atol: f64,
  /// Wall-clock budget for one document before falling back to safe mode.
  pub timeout: Duration,
  /// Pair leftover xrefs with leftover layout blocks by position when byte
  /// matching found nothing on a page. Heuristic and order-sensitive; its
  /// activation is logged.
  pub positional_fallback: bool,
}

impl Default for Tunables {
  fn default() -> Self {
    Tunables {
      min_width: 10,
      min_height: 10,
      overlap_distance: 1.0,
      overlap_distance_bbox: 0.001,
      merge_distance_step: 0.5,
      merge_distance_max: 5.0,
      merge_distance_restart: 0.5,
      canvas_overlap_px: 10,
      isolate_min_side: 30,
      isclose_rtol: 1e-5,
      isclose_atol: 1e-8,
      timeout: Duration::from_secs(600),
      positional_fallback: true,
    }
  }
}

// ── Cancellation ────────────────────────────────────────────────

/// Cooperative cancellation handle, checked at page and image boundaries.
///
/// Unlike a timeout, cancellation propagates immediately and leaves any
/// partial output on disk.
#[derive(Clone, Default)]
pub struct CancelToken {
  flag: Arc<AtomicBool>,
}

impl CancelToken {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.flag.store(true, Ordering::Relaxed);
  }

  pub fn is_cancelled(&self) -> bool {
    self.flag.load(Ordering::Relaxed)
  }
}

// ── Per-document result ─────────────────────────────────────────

/// What happened to one input document.
#[derive(Clone, Debug)]
pub struct DocumentReport {
  /// The input PDF.
  pub pdf: PathBuf,
  /// Directory the document's images were written to.
  pub out_dir: PathBuf,
  /// Mode that ultimately produced the output; `None` when both the
  /// requested mode and the fallback failed.
  pub mode_used: Option<ExtractionMode>,
  /// Extracted image files, sorted.
  pub images: Vec<PathBuf>,
}
