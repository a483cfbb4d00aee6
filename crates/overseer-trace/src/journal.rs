//! Journal: durable append plus outward stream projection.
//!
//! Subscribers get every stored envelope for a run in sequence order with
//! no gaps or duplicates, resumable from any previously observed cursor.
//! The projection replays from the store first, then switches to the live
//! broadcast, filtering by cursor so the overlap window never duplicates.

use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use overseer_protocol::{
    AppendRequest, CoreResult, RunId, SeqNo, StreamEnvelope, StreamMessage, StreamMessageStream,
    TimelineEntry, TraceEvent, TraceStorePort,
};
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

const READ_PAGE: usize = 256;

/// Fan-out hub for live envelopes.
#[derive(Clone, Debug)]
pub struct StreamHub {
    sender: broadcast::Sender<StreamEnvelope>,
}

impl StreamHub {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn publish(&self, envelope: StreamEnvelope) {
        let _ = self.sender.send(envelope);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEnvelope> {
        self.sender.subscribe()
    }
}

/// Durable trace writes mirrored outward as a stream.
#[derive(Clone)]
pub struct TraceJournal {
    store: Arc<dyn TraceStorePort>,
    hub: StreamHub,
    heartbeat_every: Duration,
}

impl TraceJournal {
    pub fn new(store: Arc<dyn TraceStorePort>, hub: StreamHub) -> Self {
        Self {
            store,
            hub,
            heartbeat_every: Duration::from_secs(15),
        }
    }

    pub fn with_heartbeat_every(mut self, period: Duration) -> Self {
        self.heartbeat_every = period;
        self
    }

    /// Append durably, then publish the projection. Publishing happens only
    /// after the durable write succeeds; the stream never runs ahead of the
    /// store.
    #[instrument(skip(self, request), fields(run_id = %request.run_id, kind = request.kind.name()))]
    pub async fn append_and_publish(&self, request: AppendRequest) -> CoreResult<TraceEvent> {
        let event = self.store.append(request).await?;
        self.hub.publish(StreamEnvelope::from_event(&event));
        debug!(sequence = event.sequence, "event published to stream");
        Ok(event)
    }

    pub async fn read(
        &self,
        run_id: RunId,
        since_sequence: SeqNo,
        limit: usize,
    ) -> CoreResult<Vec<TraceEvent>> {
        self.store.read(run_id, since_sequence, limit).await
    }

    pub async fn head(&self, run_id: RunId) -> CoreResult<SeqNo> {
        self.store.head(run_id).await
    }

    /// Ordered, resumable subscription for one run.
    ///
    /// Replays everything past `since_event_id` from the store, then follows
    /// the live broadcast. A lagged broadcast receiver falls back to a store
    /// refill, so slow subscribers see gaps filled rather than dropped.
    /// Heartbeats are emitted while the channel is idle.
    pub fn subscribe_from(&self, run_id: RunId, since_event_id: SeqNo) -> StreamMessageStream {
        let store = self.store.clone();
        let mut live = self.hub.subscribe();
        let heartbeat_every = self.heartbeat_every;

        let messages = stream! {
            let mut cursor = since_event_id;

            // Replay the durable window first.
            loop {
                let batch = match store.read(run_id.clone(), cursor, READ_PAGE).await {
                    Ok(batch) => batch,
                    Err(error) => {
                        yield Err(error);
                        return;
                    }
                };
                let done = batch.len() < READ_PAGE;
                for event in batch {
                    cursor = event.sequence;
                    yield Ok(StreamMessage::Event(StreamEnvelope::from_event(&event)));
                }
                if done {
                    break;
                }
            }

            // Follow live, filtering by cursor so the replay/live overlap
            // cannot duplicate.
            let start = tokio::time::Instant::now() + heartbeat_every;
            let mut ticker = tokio::time::interval_at(start, heartbeat_every);
            loop {
                tokio::select! {
                    received = live.recv() => match received {
                        Ok(envelope) => {
                            if envelope.run_id != run_id || envelope.event_id <= cursor {
                                continue;
                            }
                            if envelope.event_id > cursor + 1 {
                                // Broadcast jumped ahead of us; refill the
                                // gap from the store.
                                match store.read(run_id.clone(), cursor, READ_PAGE).await {
                                    Ok(batch) => {
                                        for event in batch {
                                            cursor = event.sequence;
                                            yield Ok(StreamMessage::Event(
                                                StreamEnvelope::from_event(&event),
                                            ));
                                        }
                                    }
                                    Err(error) => {
                                        yield Err(error);
                                        return;
                                    }
                                }
                                continue;
                            }
                            cursor = envelope.event_id;
                            yield Ok(StreamMessage::Event(envelope));
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // The broadcast dropped envelopes on us and will
                            // not replay them; the store still has everything,
                            // so drain it up to the current head before
                            // resuming. Without this a subscriber whose run
                            // stops publishing would stall on heartbeats with
                            // the lost events sitting durably in the store.
                            warn!(skipped, run_id = %run_id, "subscriber lagged; refilling from store");
                            loop {
                                let batch = match store.read(run_id.clone(), cursor, READ_PAGE).await {
                                    Ok(batch) => batch,
                                    Err(error) => {
                                        yield Err(error);
                                        return;
                                    }
                                };
                                let done = batch.len() < READ_PAGE;
                                for event in batch {
                                    cursor = event.sequence;
                                    yield Ok(StreamMessage::Event(
                                        StreamEnvelope::from_event(&event),
                                    ));
                                }
                                if done {
                                    break;
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = ticker.tick() => {
                        yield Ok(StreamMessage::Heartbeat {
                            run_id: run_id.clone(),
                            at: chrono::Utc::now(),
                            last_event_id: cursor,
                        });
                    }
                }
            }
        };
        Box::pin(messages)
    }

    /// Read projection for observability tooling: every envelope of a run
    /// with computed offsets. No side effects.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn timeline(&self, run_id: RunId) -> CoreResult<Vec<TimelineEntry>> {
        let mut entries = Vec::new();
        let mut cursor = 0;
        let mut run_start = None;
        let mut previous = None;

        loop {
            let batch = self.store.read(run_id.clone(), cursor, READ_PAGE).await?;
            let done = batch.len() < READ_PAGE;
            for event in batch {
                cursor = event.sequence;
                let start = *run_start.get_or_insert(event.timestamp);
                let prev = previous.replace(event.timestamp).unwrap_or(start);
                entries.push(TimelineEntry {
                    envelope: StreamEnvelope::from_event(&event),
                    offset_ms: millis_between(start, event.timestamp),
                    delta_ms: millis_between(prev, event.timestamp),
                });
            }
            if done {
                break;
            }
        }
        Ok(entries)
    }
}

fn millis_between(
    earlier: chrono::DateTime<chrono::Utc>,
    later: chrono::DateTime<chrono::Utc>,
) -> u64 {
    (later - earlier).num_milliseconds().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileTraceStore;
    use futures_util::StreamExt;
    use overseer_protocol::{CorrelationId, TraceEventKind};
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};
    use tokio::fs;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    fn journal(root: &PathBuf) -> TraceJournal {
        TraceJournal::new(Arc::new(FileTraceStore::new(root)), StreamHub::new(64))
    }

    fn message(run_id: &RunId, content: &str) -> AppendRequest {
        AppendRequest::new(
            run_id.clone(),
            CorrelationId::from_string("corr"),
            TraceEventKind::Message {
                role: "assistant".into(),
                content: content.into(),
            },
        )
    }

    async fn next_event(stream: &mut StreamMessageStream) -> StreamEnvelope {
        loop {
            match stream.next().await.expect("stream open").expect("no error") {
                StreamMessage::Event(envelope) => return envelope,
                StreamMessage::Heartbeat { .. } => continue,
            }
        }
    }

    #[tokio::test]
    async fn subscription_replays_then_follows_live() -> CoreResult<()> {
        let root = unique_test_root("overseer-journal-live");
        let journal = journal(&root);
        let run_id = RunId::new_uuid();

        journal.append_and_publish(message(&run_id, "one")).await?;
        journal.append_and_publish(message(&run_id, "two")).await?;

        let mut stream = journal.subscribe_from(run_id.clone(), 0);
        assert_eq!(next_event(&mut stream).await.event_id, 1);
        assert_eq!(next_event(&mut stream).await.event_id, 2);

        journal.append_and_publish(message(&run_id, "three")).await?;
        assert_eq!(next_event(&mut stream).await.event_id, 3);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn reconnect_resumes_without_gaps_or_duplicates() -> CoreResult<()> {
        let root = unique_test_root("overseer-journal-resume");
        let journal = journal(&root);
        let run_id = RunId::new_uuid();

        for i in 1..=10 {
            journal
                .append_and_publish(message(&run_id, &format!("m{i}")))
                .await?;
        }

        let mut first = journal.subscribe_from(run_id.clone(), 0);
        let mut seen = Vec::new();
        for _ in 0..10 {
            seen.push(next_event(&mut first).await.event_id);
        }
        drop(first);

        // Events appended while disconnected.
        for i in 11..=13 {
            journal
                .append_and_publish(message(&run_id, &format!("m{i}")))
                .await?;
        }

        let mut resumed = journal.subscribe_from(run_id.clone(), 10);
        for expected in 11..=13 {
            seen.push(next_event(&mut resumed).await.event_id);
            assert_eq!(*seen.last().unwrap(), expected);
        }
        assert_eq!(seen, (1..=13).collect::<Vec<_>>());

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn heartbeat_fires_on_idle_channel() -> CoreResult<()> {
        let root = unique_test_root("overseer-journal-heartbeat");
        let journal = journal(&root).with_heartbeat_every(Duration::from_millis(20));
        let run_id = RunId::new_uuid();

        journal.append_and_publish(message(&run_id, "only")).await?;

        let mut stream = journal.subscribe_from(run_id.clone(), 0);
        let first = stream.next().await.unwrap()?;
        assert!(matches!(first, StreamMessage::Event(_)));

        let second = stream.next().await.unwrap()?;
        match second {
            StreamMessage::Heartbeat { last_event_id, .. } => assert_eq!(last_event_id, 1),
            StreamMessage::Event(envelope) => panic!("unexpected event {envelope:?}"),
        }

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn timeline_computes_offsets_in_order() -> CoreResult<()> {
        let root = unique_test_root("overseer-journal-timeline");
        let journal = journal(&root);
        let run_id = RunId::new_uuid();

        journal.append_and_publish(message(&run_id, "a")).await?;
        journal.append_and_publish(message(&run_id, "b")).await?;
        journal.append_and_publish(message(&run_id, "c")).await?;

        let timeline = journal.timeline(run_id).await?;
        assert_eq!(timeline.len(), 3);
        assert_eq!(timeline[0].offset_ms, 0);
        assert_eq!(timeline[0].delta_ms, 0);
        let ids: Vec<_> = timeline.iter().map(|t| t.envelope.event_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(timeline.windows(2).all(|w| {
            w[0].envelope.event_id < w[1].envelope.event_id && w[0].offset_ms <= w[1].offset_ms
        }));

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn lagged_subscriber_recovers_missed_events_from_store() -> CoreResult<()> {
        let root = unique_test_root("overseer-journal-lagged");
        let journal = TraceJournal::new(Arc::new(FileTraceStore::new(&root)), StreamHub::new(1))
            .with_heartbeat_every(Duration::from_millis(20));
        let run_a = RunId::new_uuid();
        let run_b = RunId::new_uuid();

        // Drive the subscription past the (empty) replay phase so the live
        // receiver is armed before anything is published.
        let mut stream = journal.subscribe_from(run_a.clone(), 0);
        assert!(matches!(
            stream.next().await.unwrap()?,
            StreamMessage::Heartbeat { .. }
        ));

        // Overflow the single-slot channel without polling, then publish for
        // an unrelated run so no later envelope of run A ever arrives to
        // expose the gap.
        for i in 1..=3 {
            journal
                .append_and_publish(message(&run_a, &format!("m{i}")))
                .await?;
        }
        journal.append_and_publish(message(&run_b, "noise")).await?;

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(next_event(&mut stream).await.event_id);
        }
        assert_eq!(seen, vec![1, 2, 3]);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn subscription_filters_other_runs() -> CoreResult<()> {
        let root = unique_test_root("overseer-journal-filter");
        let journal = journal(&root);
        let run_a = RunId::new_uuid();
        let run_b = RunId::new_uuid();

        let mut stream = journal.subscribe_from(run_a.clone(), 0);
        journal.append_and_publish(message(&run_b, "noise")).await?;
        journal.append_and_publish(message(&run_a, "signal")).await?;

        let envelope = next_event(&mut stream).await;
        assert_eq!(envelope.run_id, run_a);
        assert_eq!(envelope.event_id, 1);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }
}
