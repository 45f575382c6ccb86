use crate::error::NetworkError;
use crate::types::{Request, Response};
use std::future::Future;

/// The network the proxy falls through to.
///
/// Implementations are shared across proxy generations and background
/// refreshes, so they must be `Send + Sync + 'static`.
pub trait Network: Send + Sync + 'static {
    /// Perform one attempt for `request`. No retries are expected.
    fn fetch(
        &self,
        request: &Request,
    ) -> impl Future<Output = Result<Response, NetworkError>> + Send;
}

/// Client control: lets a freshly activated proxy govern already-open
/// application instances without a reload.
pub trait Clients {
    fn claim(&self);
}
