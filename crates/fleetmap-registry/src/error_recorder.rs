//! Ordered error accumulation for multi-step maintenance passes

use std::sync::Mutex;

use crate::error::RegistryError;

/// Accumulates errors in insertion order.
///
/// The TTL sweeper records every sub-step failure here and keeps going;
/// the pass hands the collected errors back to the loop in one batch.
#[derive(Debug, Default)]
pub struct ErrorRecorder {
    errs: Mutex<Vec<RegistryError>>,
}

impl ErrorRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an error to the recorder.
    pub fn record(&self, err: RegistryError) {
        if let Ok(mut errs) = self.errs.lock() {
            errs.push(err);
        }
    }

    /// True when at least one error has been recorded.
    pub fn has_errors(&self) -> bool {
        self.len() > 0
    }

    /// Number of recorded errors.
    pub fn len(&self) -> usize {
        self.errs.lock().map(|errs| errs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the recorded errors, in insertion order.
    pub fn errors(&self) -> Vec<RegistryError> {
        self.errs
            .lock()
            .map(|errs| errs.clone())
            .unwrap_or_default()
    }

    /// All recorded error messages joined by newline.
    pub fn join(&self) -> String {
        let messages: Vec<String> = self
            .errors()
            .iter()
            .map(|err| err.to_string())
            .collect();
        messages.join("\n")
    }

    /// Consumes the recorder, yielding the errors in insertion order.
    pub fn into_errors(self) -> Vec<RegistryError> {
        self.errs.into_inner().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_recorder() {
        let recorder = ErrorRecorder::new();
        assert!(!recorder.has_errors());
        assert!(recorder.is_empty());
        assert_eq!(recorder.len(), 0);
        assert_eq!(recorder.join(), "");
        assert!(recorder.into_errors().is_empty());
    }

    #[test]
    fn test_record_preserves_order() {
        let recorder = ErrorRecorder::new();
        recorder.record(RegistryError::NotFound("first".into()));
        recorder.record(RegistryError::Internal("second".into()));

        assert!(recorder.has_errors());
        assert_eq!(recorder.len(), 2);

        let errors = recorder.errors();
        assert_eq!(errors[0], RegistryError::NotFound("first".into()));
        assert_eq!(errors[1], RegistryError::Internal("second".into()));
    }

    #[test]
    fn test_join_concatenates_messages() {
        let recorder = ErrorRecorder::new();
        recorder.record(RegistryError::NotFound("relay-1".into()));
        recorder.record(RegistryError::Canceled);

        let joined = recorder.join();
        assert!(joined.contains("relay-1"));
        assert!(joined.contains("operation canceled"));
        assert_eq!(joined.lines().count(), 2);
    }

    #[test]
    fn test_record_from_concurrent_tasks() {
        use std::sync::Arc;

        let recorder = Arc::new(ErrorRecorder::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let recorder = recorder.clone();
            handles.push(std::thread::spawn(move || {
                recorder.record(RegistryError::Internal(format!("worker {i}")));
            }));
        }
        for handle in handles {
            handle.join().expect("worker panicked");
        }

        assert_eq!(recorder.len(), 8);
    }
}
