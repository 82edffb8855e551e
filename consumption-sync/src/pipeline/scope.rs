use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};

use tokio_util::sync::CancellationToken;

use super::SyncError;

/// Cancellation scope shared by every participant of one run.
///
/// The first non-consequence error reported through [`RunScope::fail`] is kept
/// as the run's terminal error; everything reported after it is dropped.
#[derive(Clone)]
pub struct RunScope {
    token: CancellationToken,
    first_error: Arc<Mutex<Option<SyncError>>>,
}

impl RunScope {
    /// New scope that is also cancelled when `parent` is.
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            first_error: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Record `err` and cancel the scope. Returns `true` if `err` became the
    /// terminal error of the run.
    pub fn fail(&self, err: SyncError) -> bool {
        let recorded = if err.is_consequence() {
            false
        } else {
            let mut slot = self.first_error.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(err);
                true
            } else {
                tracing::debug!(error = %err, "discarding error reported after the run already failed");
                false
            }
        };

        self.token.cancel();
        recorded
    }

    /// Drive `fut` unless the scope is cancelled first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, SyncError>
    where
        F: Future<Output = Result<T, SyncError>>,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(SyncError::Cancelled),
            res = fut => res,
        }
    }

    pub fn first_error(&self) -> Option<SyncError> {
        self.first_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Terminal result: the first recorded error, `Cancelled` if the scope was
    /// cancelled from outside without one, otherwise success.
    pub fn finish(&self) -> Result<(), SyncError> {
        match self.first_error() {
            Some(err) => Err(err),
            None if self.is_cancelled() => Err(SyncError::Cancelled),
            None => Ok(()),
        }
    }

    pub(crate) fn terminal_error(&self) -> SyncError {
        self.finish().err().unwrap_or(SyncError::Cancelled)
    }
}
