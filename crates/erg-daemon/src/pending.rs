use std::collections::HashMap;
use std::sync::Mutex;

/// Per-session message slots. A message is set once and handed to exactly
/// one reader.
#[derive(Default)]
pub struct PendingMessages {
    slots: Mutex<HashMap<String, String>>,
}

impl PendingMessages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a message, replacing any unread one.
    pub fn set(&self, session_id: &str, message: impl Into<String>) {
        self.lock().insert(session_id.to_string(), message.into());
    }

    /// Remove and return the message; later calls see nothing.
    pub fn take(&self, session_id: &str) -> Option<String> {
        self.lock().remove(session_id)
    }

    pub fn clear(&self, session_id: &str) {
        self.lock().remove(session_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}
