//! The streaming relay: one chat turn from inbound request to terminal event.
//!
//! Persists the trailing user message, forwards every upstream fragment to
//! the caller in arrival order while accumulating the full reply, and
//! records the assistant message once the stream completes. The turn always
//! ends with exactly one `Done` marker.

use crate::store::SessionStore;
use crate::upstream::{ChatMessage, Upstream, UpstreamConfig};
use futures_util::StreamExt;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Outbound event channel capacity.
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// One event of the outbound stream for a chat turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    /// One incremental piece of assistant text, exactly as received
    Content(String),
    /// The single failure notice for this turn
    Error { kind: String, message: String },
    /// Terminal marker; nothing follows it
    Done,
}

impl OutboundEvent {
    /// Build an error event.
    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Render as one SSE frame (`data: <json>\n\n`, or the literal
    /// `data: [DONE]\n\n` sentinel).
    pub fn to_sse(&self) -> String {
        match self {
            Self::Content(content) => {
                format!("data: {}\n\n", json!({ "content": content }))
            }
            Self::Error { kind, message } => {
                format!(
                    "data: {}\n\n",
                    json!({ "error": { "kind": kind, "message": message } })
                )
            }
            Self::Done => "data: [DONE]\n\n".to_string(),
        }
    }
}

/// Run one chat turn, returning the lazy outbound event sequence.
///
/// Events are produced incrementally by a spawned task, so a slow upstream
/// never blocks the caller and the turn survives the caller going away: on
/// client disconnect, forwarding stops but the upstream stream is drained
/// and the assistant reply is still persisted best-effort.
pub fn relay(
    store: Arc<SessionStore>,
    upstream: Arc<dyn Upstream>,
    messages: Vec<ChatMessage>,
    config: UpstreamConfig,
    session_id: Option<String>,
) -> ReceiverStream<OutboundEvent> {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        run_turn(store, upstream, messages, config, session_id, tx).await;
    });

    ReceiverStream::new(rx)
}

async fn run_turn(
    store: Arc<SessionStore>,
    upstream: Arc<dyn Upstream>,
    messages: Vec<ChatMessage>,
    config: UpstreamConfig,
    session_id: Option<String>,
    tx: mpsc::Sender<OutboundEvent>,
) {
    // The user's own message is saved before the upstream call so it cannot
    // be lost to an upstream failure. A storage failure here aborts the turn.
    if let Some(sid) = session_id.as_deref() {
        if let Some(last) = messages.last() {
            if last.role == "user" {
                if let Err(e) = store.append_message(sid, &last.role, &last.content) {
                    tracing::error!(session_id = %sid, error = %e, "Failed to persist user message");
                    let _ = tx.send(OutboundEvent::error("storage", e.to_string())).await;
                    let _ = tx.send(OutboundEvent::Done).await;
                    return;
                }
            }
        }
    }

    let mut accumulator = String::new();
    let mut failed = false;

    match upstream.stream_chat(&config, &messages).await {
        Ok(mut fragments) => {
            let mut forwarding = true;
            let mut fragment_count = 0u64;

            while let Some(item) = fragments.next().await {
                match item {
                    Ok(fragment) => {
                        fragment_count += 1;
                        accumulator.push_str(&fragment);
                        if forwarding
                            && tx.send(OutboundEvent::Content(fragment)).await.is_err()
                        {
                            // Client disconnected; keep draining so the
                            // reply can still be recorded.
                            forwarding = false;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Upstream stream failed");
                        let _ = tx.send(OutboundEvent::error(e.kind(), e.to_string())).await;
                        failed = true;
                        break;
                    }
                }
            }

            if !failed {
                tracing::info!(
                    session_id = session_id.as_deref().unwrap_or("-"),
                    fragments = fragment_count,
                    chars = accumulator.len(),
                    "Upstream stream completed"
                );
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Upstream call failed");
            let _ = tx.send(OutboundEvent::error(e.kind(), e.to_string())).await;
            failed = true;
        }
    }

    // The assistant reply is persisted only on full successful completion;
    // a failed or partial reply never reaches the store.
    if !failed && !accumulator.is_empty() {
        if let Some(sid) = session_id.as_deref() {
            match store.append_message(sid, "assistant", &accumulator) {
                Ok(()) => {
                    if let Err(e) = store.touch_session(sid) {
                        tracing::warn!(session_id = %sid, error = %e, "Failed to touch session");
                    }
                }
                Err(e) => {
                    tracing::error!(session_id = %sid, error = %e, "Failed to persist assistant message");
                }
            }
        }
    }

    let _ = tx.send(OutboundEvent::Done).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::{FragmentStream, UpstreamError};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Scripted upstream: either fails the call outright or replays a fixed
    /// sequence of fragment results.
    struct ScriptedUpstream {
        script: Mutex<Option<Vec<Result<String, UpstreamError>>>>,
        call_error: Option<UpstreamError>,
    }

    impl ScriptedUpstream {
        fn yielding(items: Vec<Result<String, UpstreamError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(Some(items)),
                call_error: None,
            })
        }

        fn failing(error: UpstreamError) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(None),
                call_error: Some(error),
            })
        }
    }

    #[async_trait]
    impl Upstream for ScriptedUpstream {
        async fn stream_chat(
            &self,
            _config: &UpstreamConfig,
            _messages: &[ChatMessage],
        ) -> Result<FragmentStream, UpstreamError> {
            if let Some(e) = &self.call_error {
                return Err(e.clone());
            }
            let items = self.script.lock().unwrap().take().unwrap_or_default();
            Ok(futures_util::stream::iter(items).boxed())
        }
    }

    fn setup_store() -> (TempDir, Arc<SessionStore>) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(SessionStore::new(&tmp.path().join("relay.db")).unwrap());
        (tmp, store)
    }

    fn user_message(content: &str) -> Vec<ChatMessage> {
        vec![ChatMessage {
            role: "user".into(),
            content: content.into(),
        }]
    }

    async fn collect(stream: ReceiverStream<OutboundEvent>) -> Vec<OutboundEvent> {
        stream.collect().await
    }

    #[tokio::test]
    async fn successful_turn_streams_and_persists() {
        let (_tmp, store) = setup_store();
        store.create_session("s1", None).unwrap();
        let upstream = ScriptedUpstream::yielding(vec![Ok("He".into()), Ok("llo".into())]);

        let events = collect(relay(
            store.clone(),
            upstream,
            user_message("hi"),
            UpstreamConfig::default(),
            Some("s1".into()),
        ))
        .await;

        assert_eq!(
            events,
            vec![
                OutboundEvent::Content("He".into()),
                OutboundEvent::Content("llo".into()),
                OutboundEvent::Done,
            ]
        );

        let messages = store.list_messages("s1").unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[0].content, "hi");
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[1].content, "Hello");
    }

    #[tokio::test]
    async fn failure_after_partial_output_skips_persistence() {
        let (_tmp, store) = setup_store();
        let upstream = ScriptedUpstream::yielding(vec![
            Ok("He".into()),
            Err(UpstreamError::Transport("connection reset".into())),
        ]);

        let events = collect(relay(
            store.clone(),
            upstream,
            user_message("hi"),
            UpstreamConfig::default(),
            Some("s1".into()),
        ))
        .await;

        assert_eq!(events.len(), 3);
        assert_eq!(events[0], OutboundEvent::Content("He".into()));
        assert!(matches!(&events[1], OutboundEvent::Error { kind, .. } if kind == "transport"));
        assert_eq!(events[2], OutboundEvent::Done);

        // Only the user turn survives; the partial reply is discarded.
        let messages = store.list_messages("s1").unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "user");
    }

    #[tokio::test]
    async fn failed_call_still_keeps_user_message() {
        let (_tmp, store) = setup_store();
        let upstream = ScriptedUpstream::failing(UpstreamError::Status {
            status: 401,
            body: "bad key".into(),
        });

        let events = collect(relay(
            store.clone(),
            upstream,
            user_message("hi"),
            UpstreamConfig::default(),
            Some("s1".into()),
        ))
        .await;

        assert!(matches!(&events[0], OutboundEvent::Error { kind, .. } if kind == "status"));
        assert_eq!(events[1], OutboundEvent::Done);

        let messages = store.list_messages("s1").unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hi");
    }

    #[tokio::test]
    async fn no_session_id_means_no_writes() {
        let (_tmp, store) = setup_store();
        let upstream = ScriptedUpstream::yielding(vec![Ok("Hello".into())]);

        let events = collect(relay(
            store.clone(),
            upstream,
            user_message("hi"),
            UpstreamConfig::default(),
            None,
        ))
        .await;

        assert_eq!(
            events,
            vec![OutboundEvent::Content("Hello".into()), OutboundEvent::Done]
        );
        assert!(store.list_sessions().unwrap().is_empty());
    }

    #[tokio::test]
    async fn trailing_non_user_message_is_not_persisted() {
        let (_tmp, store) = setup_store();
        let upstream = ScriptedUpstream::yielding(vec![]);
        let messages = vec![ChatMessage {
            role: "assistant".into(),
            content: "earlier reply".into(),
        }];

        let events = collect(relay(
            store.clone(),
            upstream,
            messages,
            UpstreamConfig::default(),
            Some("s1".into()),
        ))
        .await;

        assert_eq!(events, vec![OutboundEvent::Done]);
        assert!(store.list_sessions().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_stream_persists_no_assistant_message() {
        let (_tmp, store) = setup_store();
        let upstream = ScriptedUpstream::yielding(vec![]);

        let events = collect(relay(
            store.clone(),
            upstream,
            user_message("hi"),
            UpstreamConfig::default(),
            Some("s1".into()),
        ))
        .await;

        assert_eq!(events, vec![OutboundEvent::Done]);
        let messages = store.list_messages("s1").unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn disconnected_client_still_gets_reply_persisted() {
        let (_tmp, store) = setup_store();
        let upstream = ScriptedUpstream::yielding(vec![Ok("He".into()), Ok("llo".into())]);

        // Dropped receiver simulates a client that went away mid-stream.
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        run_turn(
            store.clone(),
            upstream,
            user_message("hi"),
            UpstreamConfig::default(),
            Some("s1".into()),
            tx,
        )
        .await;

        let messages = store.list_messages("s1").unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "Hello");
    }

    #[test]
    fn content_event_renders_as_sse_frame() {
        let frame = OutboundEvent::Content("He\"llo".into()).to_sse();
        assert_eq!(frame, "data: {\"content\":\"He\\\"llo\"}\n\n");
    }

    #[test]
    fn error_event_is_tagged() {
        let frame = OutboundEvent::error("status", "upstream returned status 500").to_sse();
        let json: serde_json::Value =
            serde_json::from_str(frame.strip_prefix("data: ").unwrap().trim()).unwrap();
        assert_eq!(json["error"]["kind"], "status");
    }

    #[test]
    fn done_event_is_the_literal_sentinel() {
        assert_eq!(OutboundEvent::Done.to_sse(), "data: [DONE]\n\n");
    }
}
