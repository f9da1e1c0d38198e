//! Endpoint handlers, grouped by pipeline stage.

pub mod draft;
pub mod persona;
pub mod retrieval;
pub mod status;

use crate::api::ApiError;
use clientmind_core::context::degraded_warning;
use clientmind_core::{PipelineError, Services};
use tracing::warn;

/// Error mapper for operation `op` honouring the configured detail exposure.
pub(crate) fn fail(services: &Services, op: &'static str) -> impl Fn(PipelineError) -> ApiError {
    let expose = services.config.expose_error_detail;
    move |e| ApiError::from_pipeline(op, e, expose)
}

pub(crate) fn correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Read endpoints answer a store outage with an empty result and a warning; anything
/// else goes through [`fail`].
pub(crate) fn degrade_read<T: Default>(
    services: &Services,
    op: &'static str,
    what: &str,
    result: Result<T, PipelineError>,
) -> Result<(T, Vec<String>), ApiError> {
    match result {
        Ok(value) => Ok((value, Vec::new())),
        Err(PipelineError::Store(e)) => {
            warn!("{} degraded: {}", op, e);
            let warning = degraded_warning(what, &e, services.config.expose_error_detail);
            Ok((T::default(), vec![warning]))
        }
        Err(e) => Err(fail(services, op)(e)),
    }
}
