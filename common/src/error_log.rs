use serde::Serialize;

use crate::{
    config::ERROR_LOG_CAPACITY,
    types::{format_uptime, ErrorKind},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEntry {
    pub uptime_ms: u64,
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorEntry {
    /// `[HH:MM:SS] TAG: message`, the form shown on the display and in logs.
    pub fn render(&self) -> String {
        format!(
            "[{}] {}: {}",
            format_uptime(self.uptime_ms),
            self.kind.as_str(),
            self.message
        )
    }
}

/// Fixed ring of the most recent device faults; the oldest entry is overwritten.
#[derive(Debug, Clone, Default)]
pub struct ErrorLog {
    slots: [Option<ErrorEntry>; ERROR_LOG_CAPACITY],
    next: usize,
    total: u64,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, uptime_ms: u64, kind: ErrorKind, message: impl Into<String>) {
        self.slots[self.next] = Some(ErrorEntry {
            uptime_ms,
            kind,
            message: message.into(),
        });
        self.next = (self.next + 1) % ERROR_LOG_CAPACITY;
        self.total = self.total.saturating_add(1);
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Errors recorded since start, including overwritten ones.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn latest(&self) -> Option<&ErrorEntry> {
        let index = (self.next + ERROR_LOG_CAPACITY - 1) % ERROR_LOG_CAPACITY;
        self.slots[index].as_ref()
    }

    /// Newest first.
    pub fn iter(&self) -> impl Iterator<Item = &ErrorEntry> + '_ {
        (1..=ERROR_LOG_CAPACITY).filter_map(move |offset| {
            let index = (self.next + ERROR_LOG_CAPACITY - offset) % ERROR_LOG_CAPACITY;
            self.slots[index].as_ref()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_newest_entries() {
        let mut log = ErrorLog::new();
        for i in 0..13 {
            log.push(i * 1_000, ErrorKind::SendFailed, format!("attempt {i}"));
        }

        assert_eq!(log.len(), ERROR_LOG_CAPACITY);
        assert_eq!(log.total(), 13);

        let messages: Vec<_> = log.iter().map(|entry| entry.message.clone()).collect();
        assert_eq!(messages.first().map(String::as_str), Some("attempt 12"));
        assert_eq!(messages.last().map(String::as_str), Some("attempt 3"));
    }

    #[test]
    fn latest_and_render() {
        let mut log = ErrorLog::new();
        assert!(log.latest().is_none());
        assert!(log.is_empty());

        log.push(65_000, ErrorKind::WifiDisconnected, "link lost");
        let latest = log.latest().unwrap();

        assert_eq!(latest.render(), "[00:01:05] WIFI_DISCONNECTED: link lost");
    }
}
