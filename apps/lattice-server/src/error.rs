//! Application-level error type carried across store and cluster seams.

use thiserror::Error;

/// An error with an i18n id and an HTTP-class status code. Store failures
/// wrap into this; cache layers may swallow the not-found case.
#[derive(Debug, Error)]
#[error("{source_label}: {id} ({status_code})")]
pub struct AppError {
    /// Caller label, e.g. `"GetStatus"`.
    pub source_label: &'static str,
    /// i18n message id, e.g. `"app.status.get.app_error"`.
    pub id: &'static str,
    pub status_code: u16,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl AppError {
    pub fn new(source_label: &'static str, id: &'static str, status_code: u16) -> Self {
        AppError {
            source_label,
            id,
            status_code,
            cause: None,
        }
    }

    pub fn not_found(source_label: &'static str, id: &'static str) -> Self {
        Self::new(source_label, id, 404)
    }

    pub fn internal(source_label: &'static str, id: &'static str) -> Self {
        Self::new(source_label, id, 500)
    }

    pub fn wrap(
        mut self,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code == 404
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let nf = AppError::not_found("GetStatus", "app.status.get.missing.app_error");
        assert!(nf.is_not_found());

        let internal = AppError::internal("GetStatus", "app.status.get.app_error");
        assert!(!internal.is_not_found());
        assert_eq!(internal.status_code, 500);
    }

    #[test]
    fn wraps_causes() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err = AppError::internal("SaveStatus", "app.status.save.app_error").wrap(io);
        assert!(std::error::Error::source(&err).is_some());
    }
}
