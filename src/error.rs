use thiserror::Error;

/// Every failure the sync core can observe, grouped the way callers react to it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),
    #[error("no acknowledgment within the timeout window")]
    Timeout,
    #[error("realtime peer is not reachable")]
    TargetOffline,
    #[error("{0}")]
    BusinessRuleRejected(String),
    #[error("not found")]
    NotFound,
    #[error("forbidden")]
    Forbidden,
    #[error("server fault (HTTP {0})")]
    ServerFault(u16),
    #[error("realtime channel is not connected")]
    NotConnected,
    #[error("a command for {0} is already in flight")]
    CommandInFlight(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("could not decode response: {0}")]
    Decode(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Whether the UI should show this error to the admin.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, SyncError::Timeout | SyncError::TargetOffline)
    }

    /// Errors after which a local optimistic patch is acceptable.
    pub fn allows_local_patch(&self) -> bool {
        matches!(
            self,
            SyncError::NetworkUnreachable(_) | SyncError::ServerFault(_)
        )
    }

    /// Classifies the `message` of a realtime `error` event.
    pub fn from_realtime_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("not online")
            || lower.contains("offline")
            || lower.contains("not reachable")
            || lower.contains("unreachable")
        {
            SyncError::TargetOffline
        } else {
            SyncError::BusinessRuleRejected(message.to_string())
        }
    }

    /// Maps a non-2xx HTTP status and its body message to the taxonomy.
    pub fn from_http_status(status: u16, message: Option<String>) -> Self {
        match status {
            401 | 403 => SyncError::Forbidden,
            404 => SyncError::NotFound,
            400..=499 => SyncError::BusinessRuleRejected(
                message.unwrap_or_else(|| format!("request rejected (HTTP {})", status)),
            ),
            _ => SyncError::ServerFault(status),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            SyncError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            SyncError::from_http_status(status.as_u16(), None)
        } else {
            SyncError::NetworkUnreachable(e.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Decode(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_messages_trigger_fallback() {
        assert_eq!(
            SyncError::from_realtime_message("User is not online"),
            SyncError::TargetOffline
        );
        assert_eq!(
            SyncError::from_realtime_message("Customer unreachable"),
            SyncError::TargetOffline
        );
        assert_eq!(
            SyncError::from_realtime_message("Cannot deliver without payment"),
            SyncError::BusinessRuleRejected("Cannot deliver without payment".into())
        );
    }

    #[test]
    fn http_statuses_map_to_taxonomy() {
        assert_eq!(
            SyncError::from_http_status(400, Some("cannot deliver without payment".into())),
            SyncError::BusinessRuleRejected("cannot deliver without payment".into())
        );
        assert_eq!(SyncError::from_http_status(403, None), SyncError::Forbidden);
        assert_eq!(SyncError::from_http_status(404, None), SyncError::NotFound);
        assert_eq!(SyncError::from_http_status(502, None), SyncError::ServerFault(502));
    }

    #[test]
    fn benign_errors_stay_hidden() {
        assert!(!SyncError::Timeout.is_user_visible());
        assert!(!SyncError::TargetOffline.is_user_visible());
        assert!(SyncError::Forbidden.is_user_visible());
        assert!(SyncError::ServerFault(500).allows_local_patch());
        assert!(!SyncError::BusinessRuleRejected("x".into()).allows_local_patch());
    }
}
