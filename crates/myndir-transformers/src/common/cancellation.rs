//! Cooperative cancellation between decode steps.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, bail};

/// Read side of a stop flag, checked by the generation loop before every step.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

/// Write side of the same flag. Cancelling is permanent.
#[derive(Clone, Debug)]
pub struct CancellationHandle(Arc<AtomicBool>);

impl CancellationToken {
    /// A fresh token plus the handle that stops it.
    ///
    /// ```
    /// use myndir_transformers::common::CancellationToken;
    ///
    /// let (token, handle) = CancellationToken::new();
    /// assert!(token.check().is_ok());
    /// handle.cancel();
    /// assert!(token.check().is_err());
    /// ```
    pub fn new() -> (Self, CancellationHandle) {
        let flag = Arc::new(AtomicBool::new(false));
        (Self(flag.clone()), CancellationHandle(flag))
    }

    pub fn never() -> Self {
        Self::default()
    }

    pub fn already_cancelled() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    #[inline]
    pub fn check(&self) -> Result<()> {
        if self.0.load(Ordering::Acquire) {
            bail!("generation cancelled");
        }
        Ok(())
    }
}

impl CancellationHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }
}
