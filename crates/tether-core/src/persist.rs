//! Debounced incremental persistence.
//!
//! Every wire event schedules a flush; the debounce collapses bursts into
//! one write per quiet interval. Terminal transitions flush synchronously so
//! the final record (without the streaming marker) is on disk before
//! subscribers are released. Persistence failures are logged and swallowed:
//! durability is best-effort, the live stream is not.

use crate::run::Run;
use crate::store::RunStore;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct PersistenceWriter {
    store: Arc<RunStore>,
}

impl PersistenceWriter {
    pub fn new(store: Arc<RunStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Arc<RunStore> {
        self.store.clone()
    }

    /// Arm the run's debounce if idle. The flush snapshots state at fire
    /// time, so collapsed schedules lose nothing.
    pub fn schedule(&self, run: &Arc<Run>) {
        run.flush_debounce
            .schedule(flush_now(self.store.clone(), run.clone()));
    }

    /// Immediate flush; cancels any armed debounce first.
    pub async fn flush(&self, run: &Arc<Run>) {
        run.flush_debounce.cancel();
        flush_now(self.store.clone(), run.clone()).await;
    }
}

async fn flush_now(store: Arc<RunStore>, run: Arc<Run>) {
    let snapshot = run.snapshot_message();
    let status = run.status();
    let fresh_events = run.take_unlogged_events();

    if let Err(err) = store.upsert_message(&run.identity, snapshot).await {
        warn!("persistence flush failed for {}: {err}", run.identity);
    }
    if let Err(err) = store.append_events(&run.identity, &fresh_events).await {
        warn!("event log append failed for {}: {err}", run.identity);
    }
    if let Err(err) = store
        .touch_run(&run.identity, status, run.last_seen_seq(), run.ended_at())
        .await
    {
        warn!("run index update failed for {}: {err}", run.identity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;
    use tether_types::{MessagePart, RunStatus, WireEvent, SILENT_REPLY};

    use crate::store::RunIndexEntry;

    async fn setup(
        debounce: Duration,
    ) -> (tempfile::TempDir, Arc<RunStore>, PersistenceWriter, Arc<Run>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RunStore::new(dir.path()).await.unwrap());
        let writer = PersistenceWriter::new(store.clone());
        let run = Run::new("s1", None, "r1", debounce);
        store
            .upsert_run(RunIndexEntry {
                identity: run.identity.clone(),
                run_id: run.run_id.clone(),
                message_id: run.message_id.clone(),
                parent: None,
                task: None,
                label: None,
                status: RunStatus::Running,
                started_at: Utc::now(),
                ended_at: None,
                last_seq: 0,
                records: 0,
            })
            .await
            .unwrap();
        (dir, store, writer, run)
    }

    fn text_part(run: &Arc<Run>, id: &str, text: &str) {
        run.append_part(
            WireEvent::TextDelta {
                id: id.to_string(),
                delta: text.to_string(),
            },
            MessagePart::Text {
                text: text.to_string(),
            },
        );
    }

    #[tokio::test]
    async fn debounced_flush_writes_once_after_quiet_interval() {
        let (_dir, store, writer, run) = setup(Duration::from_millis(30)).await;
        text_part(&run, "t1", "hello");
        writer.schedule(&run);
        writer.schedule(&run);

        assert!(store.messages("s1").await.is_empty());
        tokio::time::sleep(Duration::from_millis(120)).await;

        let messages = store.messages("s1").await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].streaming, Some(true));
        assert_eq!(messages[0].content, "hello");
    }

    #[tokio::test]
    async fn terminal_flush_omits_streaming_marker() {
        let (_dir, store, writer, run) = setup(Duration::from_secs(10)).await;
        text_part(&run, "t1", "done");
        writer.schedule(&run); // armed but far out
        run.set_terminal(RunStatus::Completed);
        writer.flush(&run).await;

        let messages = store.messages("s1").await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].streaming, None);
        // the long-armed debounce was cancelled by the synchronous flush
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.messages("s1").await.len(), 1);
    }

    #[tokio::test]
    async fn flush_upserts_in_place_and_logs_events_incrementally() {
        let (_dir, store, writer, run) = setup(Duration::from_millis(10)).await;
        text_part(&run, "t1", "first ");
        writer.flush(&run).await;
        text_part(&run, "t1", "second");
        writer.flush(&run).await;

        let messages = store.messages("s1").await;
        assert_eq!(messages.len(), 1, "same message id must upsert in place");
        let events = store.load_events("s1").await.unwrap();
        assert_eq!(events.len(), 2, "event log only receives fresh events");
        assert_eq!(store.run_entry("s1").await.unwrap().records, 1);
    }

    #[tokio::test]
    async fn silent_reply_part_never_reaches_disk() {
        let (_dir, store, writer, run) = setup(Duration::from_millis(10)).await;
        text_part(&run, "t1", SILENT_REPLY);
        text_part(&run, "t2", "visible");
        writer.flush(&run).await;

        let messages = store.messages("s1").await;
        assert_eq!(messages[0].parts.len(), 1);
        assert_eq!(messages[0].content, "visible");
    }
}
