use crate::session::CardRecognitionResult;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Receives recognized cards. Access decisions belong to the implementor.
pub trait ResultEmitter {
    fn on_card_recognized(&self, result: &CardRecognitionResult);
}

#[derive(Debug, Clone, Copy)]
pub struct LogEmitter {
    pub censor_sensitive_fields: bool,
}

impl ResultEmitter for LogEmitter {
    fn on_card_recognized(&self, result: &CardRecognitionResult) {
        if self.censor_sensitive_fields {
            info!("Card recognized: {}", result.censored());
        } else {
            info!("Card recognized: {}", result);
        }
    }
}

/// Repeat-scan suppression keyed by card identifier.
pub struct RecentScans {
    window: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl RecentScans {
    pub fn new(window: Duration) -> RecentScans {
        RecentScans {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Records the scan and tells whether the same identifier was already seen
    /// inside the window.
    pub fn is_repeat(&self, identifier: &str, now: Instant) -> bool {
        let mut seen = match self.seen.lock() {
            Ok(seen) => seen,
            Err(poisoned) => poisoned.into_inner(),
        };

        let window = self.window;
        seen.retain(|_, last| now.saturating_duration_since(*last) < window);

        let repeat = seen.contains_key(identifier);
        seen.insert(identifier.to_string(), now);

        repeat
    }
}

/// Forwards to `inner` unless the same card was reported within the window.
pub struct DedupEmitter<E: ResultEmitter> {
    inner: E,
    recent: RecentScans,
}

impl<E: ResultEmitter> DedupEmitter<E> {
    pub fn new(inner: E, window: Duration) -> DedupEmitter<E> {
        DedupEmitter {
            inner,
            recent: RecentScans::new(window),
        }
    }
}

impl<E: ResultEmitter> ResultEmitter for DedupEmitter<E> {
    fn on_card_recognized(&self, result: &CardRecognitionResult) {
        if self
            .recent
            .is_repeat(result.identifier.as_str(), Instant::now())
        {
            debug!("Suppressing repeat scan of {}", result.identifier.censored());
            return;
        }

        self.inner.on_card_recognized(result);
    }
}
