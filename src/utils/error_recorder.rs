use parking_lot::Mutex;

use crate::Error;

/// Collects errors from concurrent tasks
#[derive(Default)]
pub(crate) struct ErrorRecorder {
    errors: Mutex<Vec<Error>>,
}

impl ErrorRecorder {
    pub(crate) fn record(
        &self,
        error: Error,
    ) {
        self.errors.lock().push(error);
    }

    pub(crate) fn has_errors(&self) -> bool {
        !self.errors.lock().is_empty()
    }

    pub(crate) fn into_errors(self) -> Vec<Error> {
        self.errors.into_inner()
    }
}
