use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::platform::{FileUpload, PlatformGateway};
use crate::prefs::PreferencesStore;
use crate::response::{Response, ResponseKind};

/// Preferences document holding the throttle state
pub const ENGINE_PREFS: &str = "engine";

const LAST_SEND_KEY: &str = "last_send_timestamp";

struct DispatchState {
    queue: VecDeque<Response>,
    last_send: Option<DateTime<Utc>>,
}

/// Outgoing response queue with a throttled drain.
///
/// One lock guards both the queue and the last-send timestamp; it is never
/// held across a gateway call. A drain pass sends at most one response, and
/// none while the minimum delay since the previous send has not elapsed.
pub struct ResponseDispatcher {
    state: Mutex<DispatchState>,
    /// Serializes drain passes; never held by producers
    drain: Mutex<()>,
    min_post_delay: Duration,
    prefs: Option<PreferencesStore>,
}

impl ResponseDispatcher {
    /// Restores the last-send timestamp from `prefs` if present.
    pub fn new(min_post_delay: Duration, prefs: Option<PreferencesStore>) -> Self {
        let last_send = prefs
            .as_ref()
            .and_then(|p| p.load(ENGINE_PREFS))
            .and_then(|doc| doc.get(LAST_SEND_KEY).and_then(|v| v.as_f64()))
            .and_then(|secs| Utc.timestamp_millis_opt((secs * 1000.0) as i64).single());
        if let Some(ts) = last_send {
            debug!("Restored last send timestamp: {}", ts);
        }
        Self {
            state: Mutex::new(DispatchState {
                queue: VecDeque::new(),
                last_send,
            }),
            drain: Mutex::new(()),
            min_post_delay,
            prefs,
        }
    }

    /// Queue behind everything already waiting
    pub async fn enqueue(&self, response: Response) {
        self.state.lock().await.queue.push_back(response);
    }

    /// Queue ahead of everything already waiting
    pub async fn enqueue_front(&self, response: Response) {
        self.state.lock().await.queue.push_front(response);
    }

    /// Number of responses waiting to be sent
    pub async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Time of the last successful send, restored across restarts
    pub async fn last_send(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.last_send
    }

    fn gate_open(&self, last_send: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last_send {
            None => true,
            Some(last) => match (now - last).to_std() {
                Ok(elapsed) => elapsed >= self.min_post_delay,
                // Clock went backwards
                Err(_) => self.min_post_delay.is_zero(),
            },
        }
    }

    /// Run one drain pass and return the number of responses still queued.
    ///
    /// Malformed responses met before the send are dropped. The queue lock
    /// is released while the gateway call is in flight, so producers never
    /// wait on the network. A send that the gateway rejects goes back to the
    /// front of the queue and ends the pass. Fails only if the throttle
    /// timestamp cannot be persisted.
    pub async fn drain_and_send(&self, gateway: &dyn PlatformGateway) -> Result<usize> {
        let _drain = self.drain.lock().await;

        let response = {
            let mut state = self.state.lock().await;
            if state.queue.is_empty() || !self.gate_open(state.last_send, Utc::now()) {
                return Ok(state.queue.len());
            }
            match next_valid(&mut state.queue) {
                Some(response) => response,
                None => return Ok(0),
            }
        };

        let result = send(gateway, &response).await;

        let mut state = self.state.lock().await;
        let sent_at = match result {
            Ok(()) => {
                debug!("Sent response to {}", response.channel_id);
                let now = Utc::now();
                state.last_send = Some(now);
                Some(now)
            }
            Err(e) => {
                warn!("Failed to send response to {}: {:#}", response.channel_id, e);
                state.queue.push_front(response);
                None
            }
        };
        let remaining = state.queue.len();
        drop(state);

        if let (Some(prefs), Some(ts)) = (&self.prefs, sent_at) {
            persist_last_send(prefs, ts)?;
        }
        Ok(remaining)
    }
}

/// Pop entries off the front until a well-formed one turns up, dropping the
/// malformed ones on the way.
fn next_valid(queue: &mut VecDeque<Response>) -> Option<Response> {
    while let Some(response) = queue.pop_front() {
        match response.validate() {
            Ok(()) => return Some(response),
            Err(e) => warn!("Dropping malformed response for '{}': {}", response.channel_id, e),
        }
    }
    None
}

async fn send(gateway: &dyn PlatformGateway, response: &Response) -> Result<()> {
    match response.kind {
        ResponseKind::Normal => {
            gateway
                .post_message(
                    &response.channel_id,
                    &response.text,
                    response.attachments.as_ref(),
                )
                .await
        }
        ResponseKind::Upload => {
            let file = response
                .file
                .as_ref()
                .context("upload has no file metadata")?;
            gateway
                .upload_file(&FileUpload {
                    channel_id: &response.channel_id,
                    content: &response.text,
                    file_type: &file.file_type,
                    file_name: &file.file_name,
                    title: &file.title,
                    comment: file.comment.as_deref(),
                })
                .await
        }
    }
}

fn persist_last_send(prefs: &PreferencesStore, ts: DateTime<Utc>) -> Result<()> {
    let mut doc = prefs.load(ENGINE_PREFS).unwrap_or_else(|| json!({}));
    if !doc.is_object() {
        info!("Replacing non-object engine preferences");
        doc = json!({});
    }
    let secs = ts.timestamp_millis() as f64 / 1000.0;
    doc[LAST_SEND_KEY] = json!(secs);
    prefs
        .save(ENGINE_PREFS, &doc)
        .context("Failed to persist last send timestamp")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::{MockGateway, Sent};
    use crate::response::FileMetadata;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn sent_texts(gateway: &MockGateway) -> Vec<String> {
        gateway
            .sent()
            .into_iter()
            .map(|s| match s {
                Sent::Message { text, .. } => text,
                Sent::Upload { file_name, .. } => file_name,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_one_send_per_pass_in_enqueue_order() {
        let gateway = MockGateway::new();
        let dispatcher = ResponseDispatcher::new(Duration::ZERO, None);
        dispatcher.enqueue(Response::text("C1", "R1")).await;
        dispatcher.enqueue(Response::text("C1", "R2")).await;

        assert_eq!(dispatcher.drain_and_send(&gateway).await.unwrap(), 1);
        assert_eq!(sent_texts(&gateway), vec!["R1"]);

        assert_eq!(dispatcher.drain_and_send(&gateway).await.unwrap(), 0);
        assert_eq!(sent_texts(&gateway), vec!["R1", "R2"]);
    }

    #[tokio::test]
    async fn test_closed_gate_sends_nothing() {
        let gateway = MockGateway::new();
        let dispatcher = ResponseDispatcher::new(Duration::from_secs(3600), None);
        dispatcher.enqueue(Response::text("C1", "first")).await;
        dispatcher.drain_and_send(&gateway).await.unwrap();

        dispatcher.enqueue(Response::text("C1", "R1")).await;
        dispatcher.enqueue(Response::text("", "malformed")).await;
        let before = gateway.call_count("post_message");

        assert_eq!(dispatcher.drain_and_send(&gateway).await.unwrap(), 2);
        assert_eq!(gateway.call_count("post_message"), before);
        // Even the malformed entry is left alone while gated
        assert_eq!(dispatcher.len().await, 2);
    }

    #[tokio::test]
    async fn test_enqueue_front_takes_priority() {
        let gateway = MockGateway::new();
        let dispatcher = ResponseDispatcher::new(Duration::ZERO, None);
        dispatcher.enqueue(Response::text("C1", "normal-1")).await;
        dispatcher.enqueue(Response::text("C1", "normal-2")).await;
        dispatcher.enqueue_front(Response::text("C1", "urgent")).await;

        while dispatcher.drain_and_send(&gateway).await.unwrap() > 0 {}
        assert_eq!(sent_texts(&gateway), vec!["urgent", "normal-1", "normal-2"]);
    }

    #[tokio::test]
    async fn test_malformed_dropped_and_next_sent() {
        let gateway = MockGateway::new();
        let dispatcher = ResponseDispatcher::new(Duration::ZERO, None);
        dispatcher.enqueue(Response::text("C1", "")).await;
        let mut bad_upload = Response::text("C1", "content");
        bad_upload.kind = ResponseKind::Upload;
        dispatcher.enqueue(bad_upload).await;
        dispatcher.enqueue(Response::text("C1", "ok")).await;
        dispatcher.enqueue(Response::text("C1", "later")).await;

        assert_eq!(dispatcher.drain_and_send(&gateway).await.unwrap(), 1);
        assert_eq!(sent_texts(&gateway), vec!["ok"]);
    }

    #[tokio::test]
    async fn test_failed_send_is_kept_in_place() {
        let gateway = MockGateway::new();
        gateway.fail_sends.store(true, Ordering::SeqCst);
        let dispatcher = ResponseDispatcher::new(Duration::ZERO, None);
        dispatcher.enqueue(Response::text("C1", "R1")).await;
        dispatcher.enqueue(Response::text("C1", "R2")).await;

        assert_eq!(dispatcher.drain_and_send(&gateway).await.unwrap(), 2);
        assert!(dispatcher.last_send().await.is_none());

        gateway.fail_sends.store(false, Ordering::SeqCst);
        while dispatcher.drain_and_send(&gateway).await.unwrap() > 0 {}
        assert_eq!(sent_texts(&gateway), vec!["R1", "R2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_producers_not_blocked_by_inflight_send() {
        let gateway = Arc::new(MockGateway::new());
        gateway.set_send_delay(Duration::from_secs(30));
        let dispatcher = Arc::new(ResponseDispatcher::new(Duration::ZERO, None));
        dispatcher.enqueue(Response::text("C1", "slow")).await;

        let drain = {
            let (dispatcher, gateway) = (Arc::clone(&dispatcher), Arc::clone(&gateway));
            tokio::spawn(async move { dispatcher.drain_and_send(gateway.as_ref()).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(gateway.call_count("post_message"), 1);

        // A timer task queueing while the post is still in flight
        tokio::time::timeout(
            Duration::from_secs(1),
            dispatcher.enqueue(Response::text("C1", "from timer")),
        )
        .await
        .expect("enqueue waited on the gateway");
        assert_eq!(dispatcher.len().await, 1);

        assert_eq!(drain.await.unwrap().unwrap(), 1);
        assert_eq!(sent_texts(&gateway), vec!["slow"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_send_returns_ahead_of_concurrent_enqueues() {
        let gateway = Arc::new(MockGateway::new());
        gateway.set_send_delay(Duration::from_secs(5));
        gateway.fail_sends.store(true, Ordering::SeqCst);
        let dispatcher = Arc::new(ResponseDispatcher::new(Duration::ZERO, None));
        dispatcher.enqueue(Response::text("C1", "R1")).await;

        let drain = {
            let (dispatcher, gateway) = (Arc::clone(&dispatcher), Arc::clone(&gateway));
            tokio::spawn(async move { dispatcher.drain_and_send(gateway.as_ref()).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        dispatcher.enqueue(Response::text("C1", "R2")).await;
        dispatcher.enqueue_front(Response::text("C1", "urgent")).await;
        assert_eq!(drain.await.unwrap().unwrap(), 3);

        gateway.set_send_delay(Duration::ZERO);
        gateway.fail_sends.store(false, Ordering::SeqCst);
        while dispatcher.drain_and_send(gateway.as_ref()).await.unwrap() > 0 {}
        // The retried entry lands ahead of a front-queued one sent meanwhile
        assert_eq!(sent_texts(&gateway), vec!["R1", "urgent", "R2"]);
    }

    #[tokio::test]
    async fn test_upload_uses_file_variant() {
        let gateway = MockGateway::new();
        let dispatcher = ResponseDispatcher::new(Duration::ZERO, None);
        let file = FileMetadata {
            file_type: "text".to_string(),
            file_name: "rates.txt".to_string(),
            title: "Exchange rates".to_string(),
            comment: Some("today".to_string()),
        };
        dispatcher.enqueue(Response::upload("C1", "USD 23000", file)).await;
        dispatcher.drain_and_send(&gateway).await.unwrap();

        assert_eq!(
            gateway.sent(),
            vec![Sent::Upload {
                channel_id: "C1".to_string(),
                file_name: "rates.txt".to_string(),
                title: "Exchange rates".to_string(),
            }]
        );
        assert_eq!(gateway.call_count("post_message"), 0);
    }

    #[tokio::test]
    async fn test_throttle_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = PreferencesStore::new(dir.path());
        let gateway = MockGateway::new();

        let dispatcher = ResponseDispatcher::new(Duration::from_secs(3600), Some(prefs.clone()));
        dispatcher.enqueue(Response::text("C1", "R1")).await;
        dispatcher.drain_and_send(&gateway).await.unwrap();
        assert!(prefs.load(ENGINE_PREFS).unwrap()[LAST_SEND_KEY].is_f64());

        let restarted = ResponseDispatcher::new(Duration::from_secs(3600), Some(prefs));
        assert!(restarted.last_send().await.is_some());
        restarted.enqueue(Response::text("C1", "R2")).await;
        assert_eq!(restarted.drain_and_send(&gateway).await.unwrap(), 1);
        assert_eq!(sent_texts(&gateway), vec!["R1"]);
    }

    #[tokio::test]
    async fn test_concurrent_producers_keep_their_order() {
        let gateway = MockGateway::new();
        let dispatcher = Arc::new(ResponseDispatcher::new(Duration::ZERO, None));

        let mut handles = Vec::new();
        for producer in ["a", "b", "c"] {
            let dispatcher = Arc::clone(&dispatcher);
            handles.push(tokio::spawn(async move {
                for i in 0..20 {
                    dispatcher
                        .enqueue(Response::text("C1", format!("{}{}", producer, i)))
                        .await;
                }
            }));
        }
        futures::future::join_all(handles).await;

        while dispatcher.drain_and_send(&gateway).await.unwrap() > 0 {}
        let sent = sent_texts(&gateway);
        assert_eq!(sent.len(), 60);
        for producer in ["a", "b", "c"] {
            let seq: Vec<_> = sent.iter().filter(|t| t.starts_with(producer)).collect();
            let expected: Vec<_> = (0..20).map(|i| format!("{}{}", producer, i)).collect();
            assert_eq!(seq, expected.iter().collect::<Vec<_>>());
        }
    }
}
