use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Sequential stages of one wallet import. No backward transitions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ImportStage {
    Transfers,
    Gas,
    Prices,
    Complete,
}

impl std::fmt::Display for ImportStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ImportStage::Transfers => "transfers",
            ImportStage::Gas => "gas",
            ImportStage::Prices => "prices",
            ImportStage::Complete => "complete",
        };
        write!(f, "{}", label)
    }
}

/// One progress notification. Within a stage `current` is monotonically
/// non-decreasing; stages arrive in declaration order.
#[derive(Debug, Clone, Serialize)]
pub struct ImportProgress {
    pub wallet_address: String,
    pub stage: ImportStage,
    pub current: u64,
    pub total: Option<u64>,
    pub current_item: String,
    pub started_at: DateTime<Utc>,
}

/// Per-call progress handle. Each import carries its own sink, so
/// concurrent imports report independently instead of sharing one
/// listener slot. A sink without a channel discards events.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: Option<mpsc::UnboundedSender<ImportProgress>>,
}

impl ProgressSink {
    /// A sink wired to a fresh unbounded channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ImportProgress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that drops every event.
    pub fn none() -> Self {
        Self { tx: None }
    }

    /// Deliver an event. A hung-up receiver is not an error; the import
    /// keeps running without a listener.
    pub fn emit(&self, event: ImportProgress) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_delivers_in_order() {
        let (sink, mut rx) = ProgressSink::channel();
        let started_at = Utc::now();

        for current in 1..=3 {
            sink.emit(ImportProgress {
                wallet_address: "0xabc".to_string(),
                stage: ImportStage::Transfers,
                current,
                total: None,
                current_item: format!("page {}", current),
                started_at,
            });
        }
        drop(sink);

        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            seen.push(event.current);
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_none_sink_discards() {
        let sink = ProgressSink::none();
        sink.emit(ImportProgress {
            wallet_address: "0xabc".to_string(),
            stage: ImportStage::Complete,
            current: 1,
            total: Some(1),
            current_item: String::new(),
            started_at: Utc::now(),
        });
    }
}
