//! Bounded refresh-and-retry around a single dispatch.

use tracing::{info, warn};

use crate::client::Dispatch;
use crate::error::TaskError;
use crate::http::{HttpRequest, HttpResponse};

/// Decides when a failed dispatch should trigger a credential refresh and
/// how many refreshes one logical request may perform.
#[derive(Debug, Clone, Copy)]
pub struct RefreshPolicy {
    pub max_refreshes: u32,
    pub is_expired: fn(&TaskError) -> bool,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            max_refreshes: 1,
            is_expired: TaskError::is_credential_expired,
        }
    }
}

impl RefreshPolicy {
    pub fn with_max_refreshes(mut self, max_refreshes: u32) -> Self {
        self.max_refreshes = max_refreshes;
        self
    }

    /// A policy that surfaces expiry immediately.
    pub fn disabled() -> Self {
        Self::default().with_max_refreshes(0)
    }

    /// Dispatch `request`, refreshing and re-issuing it while the client
    /// reports an expired credential and the refresh budget allows.
    pub async fn run(
        &self,
        client: &dyn Dispatch,
        request: &HttpRequest,
    ) -> Result<HttpResponse, TaskError> {
        let mut refreshes = 0;
        loop {
            match client.dispatch(request).await {
                Err(err) if (self.is_expired)(&err) => {
                    if refreshes >= self.max_refreshes {
                        warn!(refreshes, "credential still expired, giving up");
                        return Err(err);
                    }
                    refreshes += 1;
                    info!(attempt = refreshes, "credential expired, refreshing");
                    client.refresh_credential(&err).await?;
                }
                outcome => return outcome,
            }
        }
    }
}
