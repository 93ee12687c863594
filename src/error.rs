//! Graphics error types.
//!
//! Only fatal conditions are errors. Recoverable swapchain states are returned
//! as status values and soft failures (removing an absent entry) as `bool`.

use thiserror::Error;

use crate::backend::BackendError;

/// Errors surfaced by the renderer core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphicsError {
    /// Renderer initialization aborted.
    #[error("initialization failed: {what}: {source}")]
    InitializationFailed {
        what: &'static str,
        #[source]
        source: Box<GraphicsError>,
    },
    /// Failed to create a GPU object.
    #[error("failed to create {what}: {source}")]
    ResourceCreation {
        what: &'static str,
        #[source]
        source: BackendError,
    },
    /// Descriptor allocation failed even from a freshly obtained pool.
    #[error("descriptor allocation failed: {0}")]
    DescriptorAllocation(#[source] BackendError),
    /// The presentation surface is gone.
    #[error("surface lost, needs recreation")]
    SurfaceLost,
    /// Any other device failure.
    #[error("device error: {0}")]
    Device(#[source] BackendError),
    /// An operation was called in the wrong lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl GraphicsError {
    pub(crate) fn creation(what: &'static str) -> impl FnOnce(BackendError) -> GraphicsError {
        move |source| GraphicsError::ResourceCreation { what, source }
    }

    pub(crate) fn init(what: &'static str) -> impl FnOnce(GraphicsError) -> GraphicsError {
        move |source| GraphicsError::InitializationFailed {
            what,
            source: Box::new(source),
        }
    }
}

impl From<BackendError> for GraphicsError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::SurfaceLost => GraphicsError::SurfaceLost,
            other => GraphicsError::Device(other),
        }
    }
}

pub type GraphicsResult<T> = Result<T, GraphicsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GraphicsError::SurfaceLost;
        assert_eq!(err.to_string(), "surface lost, needs recreation");

        let err = GraphicsError::ResourceCreation {
            what: "sampler",
            source: BackendError::OutOfDeviceMemory,
        };
        assert_eq!(
            err.to_string(),
            "failed to create sampler: Out of device memory"
        );

        let err = GraphicsError::init("pipelines")(err);
        assert_eq!(
            err.to_string(),
            "initialization failed: pipelines: failed to create sampler: Out of device memory"
        );
    }

    #[test]
    fn test_backend_translation() {
        assert_eq!(
            GraphicsError::from(BackendError::SurfaceLost),
            GraphicsError::SurfaceLost
        );
        assert_eq!(
            GraphicsError::from(BackendError::DeviceLost),
            GraphicsError::Device(BackendError::DeviceLost)
        );
    }
}
