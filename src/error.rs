use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the extraction pipeline.
///
/// Per-image decode problems are not represented here: a record that fails to
/// decode is skipped and the page continues. Everything that escalates to the
/// page or document level lands in this enum.
#[derive(Error, Debug)]
pub enum ExtractError {
  #[error("failed to open {path}: {source}")]
  Open {
    path: PathBuf,
    #[source]
    source: lopdf::Error,
  },

  #[error("page {page} cannot be parsed: {reason}")]
  Page { page: u32, reason: String },

  #[error("document exceeded the {seconds} s extraction deadline")]
  Timeout { seconds: u64 },

  #[error("extraction cancelled")]
  Cancelled,

  #[error("invalid input path: {0}")]
  Input(String),

  #[error("image object {} {} cannot be decoded: {reason}", xref.0, xref.1)]
  Decode { xref: (u32, u16), reason: String },

  #[error(transparent)]
  Pdf(#[from] lopdf::Error),

  #[error("image encoding failed: {0}")]
  Encode(#[from] image::ImageError),

  #[error(transparent)]
  Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ExtractError>;
