use crate::error::{ExtractError, Result};
use crate::types::CancelToken;
use std::time::{Duration, Instant};

/// Per-document wall-clock budget, checked cooperatively between pages and
/// between image objects. Replaces the process-wide alarm a batch tool
/// would otherwise need: each document carries its own deadline and no
/// global state is touched.
#[derive(Clone)]
pub(crate) struct Deadline {
  end: Instant,
  seconds: u64,
  cancel: Option<CancelToken>,
}

impl Deadline {
  pub fn new(budget: Duration, cancel: Option<CancelToken>) -> Deadline {
    Deadline {
      end: Instant::now() + budget,
      seconds: budget.as_secs(),
      cancel,
    }
  }

  /// Cancellation outranks the timeout: it must propagate even from a
  /// document that still has budget left.
  pub fn check(&self) -> Result<()> {
    if let Some(token) = &self.cancel
      && token.is_cancelled()
    {
      return Err(ExtractError::Cancelled);
    }
    if Instant::now() >= self.end {
      return Err(ExtractError::Timeout {
        seconds: self.seconds,
      });
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fresh_deadline_passes() {
    let d = Deadline::new(Duration::from_secs(600), None);
    assert!(d.check().is_ok());
  }

  #[test]
  fn expired_deadline_reports_timeout() {
    let d = Deadline::new(Duration::ZERO, None);
    assert!(matches!(d.check(), Err(ExtractError::Timeout { .. })));
  }

  #[test]
  fn cancellation_beats_timeout() {
    let token = CancelToken::new();
    let d = Deadline::new(Duration::ZERO, Some(token.clone()));
    token.cancel();
    assert!(matches!(d.check(), Err(ExtractError::Cancelled)));
  }
}
