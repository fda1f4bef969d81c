//! Best-effort REST mirror of the signaling hangup.
//!
//! Some deployments poll call status over HTTP instead of holding a relay
//! connection; `POST /call/{id}/end` keeps them in sync. Failures never
//! block teardown.

use log::{debug, warn};

use crate::signaling::CallId;

/// Since `ureq` is blocking, requests run in `spawn_blocking`.
#[derive(Debug, Clone)]
pub struct StatusNotifier {
    base_url: String,
}

impl StatusNotifier {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { base_url }
    }

    /// Mirror the hangup. Best effort: failures are logged and swallowed,
    /// since the call is over either way.
    pub async fn call_ended(&self, call_id: &CallId) {
        let url = format!("{}/call/{}/end", self.base_url, call_id);
        let result = tokio::task::spawn_blocking(move || ureq::post(&url).send(&[])).await;
        match result {
            Ok(Ok(response)) => {
                debug!(target: "Call/Rest", "end-of-call notice accepted: {}", response.status());
            }
            Ok(Err(e)) => warn!(target: "Call/Rest", "end-of-call notice failed: {e}"),
            Err(e) => warn!(target: "Call/Rest", "end-of-call notice task failed: {e}"),
        }
    }
}
