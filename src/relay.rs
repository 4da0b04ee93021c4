//! Bidirectional WebSocket relay between the caller and the gateway
//!
//! Frames are forwarded in order per direction. Text frames from the
//! gateway that carry a known error are rewritten into guidance the caller
//! can act on; everything else passes through untouched.

use futures::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// Longest close reason that fits a control frame
pub const MAX_CLOSE_REASON_BYTES: usize = 123;

/// How long the surviving direction may drain after the other one ends
const CLOSE_GRACE: Duration = Duration::from_secs(5);

const TOKEN_HINT: &str =
    "Invalid or missing token. Visit https://{host}?token={REPLACE_WITH_YOUR_TOKEN}";
const PAIRING_HINT: &str = "Pairing required. Visit https://{host}{pairing_path}";

/// Case-insensitive substring mapped to a replacement message
#[derive(Debug, Clone, Copy)]
pub struct RewriteRule {
    pub pattern: &'static str,
    pub message: &'static str,
}

pub const DEFAULT_RULES: &[RewriteRule] = &[
    RewriteRule {
        pattern: "gateway token missing",
        message: TOKEN_HINT,
    },
    RewriteRule {
        pattern: "gateway token mismatch",
        message: TOKEN_HINT,
    },
    RewriteRule {
        pattern: "pairing required",
        message: PAIRING_HINT,
    },
];

/// Applies the rule table for one connection
#[derive(Debug, Clone)]
pub struct ErrorRewriter {
    rules: &'static [RewriteRule],
    host: String,
    pairing_path: String,
}

/// Cut `text` to at most `max` bytes on a char boundary
pub fn truncate_utf8(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

impl ErrorRewriter {
    pub fn new(host: impl Into<String>, pairing_path: impl Into<String>) -> Self {
        Self::with_rules(DEFAULT_RULES, host, pairing_path)
    }

    pub fn with_rules(
        rules: &'static [RewriteRule],
        host: impl Into<String>,
        pairing_path: impl Into<String>,
    ) -> Self {
        Self {
            rules,
            host: host.into(),
            pairing_path: pairing_path.into(),
        }
    }

    /// Replacement for an error message, if a rule matches
    pub fn rewrite_message(&self, message: &str) -> Option<String> {
        let lowered = message.to_ascii_lowercase();
        let rule = self
            .rules
            .iter()
            .find(|rule| lowered.contains(&rule.pattern.to_ascii_lowercase()))?;
        Some(
            rule.message
                .replace("{host}", &self.host)
                .replace("{pairing_path}", &self.pairing_path),
        )
    }

    /// Rewrite a JSON text frame whose top-level `error` string matches a rule
    pub fn rewrite_text(&self, text: &str) -> Option<String> {
        let mut value: Value = serde_json::from_str(text).ok()?;
        let object = value.as_object_mut()?;
        let replacement = self.rewrite_message(object.get("error")?.as_str()?)?;
        object.insert("error".to_string(), Value::String(replacement));
        serde_json::to_string(&value).ok()
    }

    /// Rewritten close reason, cut to the control-frame limit
    pub fn rewrite_close_reason(&self, reason: &str) -> String {
        let reason = self
            .rewrite_message(reason)
            .unwrap_or_else(|| reason.to_string());
        truncate_utf8(&reason, MAX_CLOSE_REASON_BYTES).to_string()
    }
}

/// How one direction of the relay finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpEnd {
    /// A close frame was relayed, with its code if one was sent
    Closed(Option<u16>),
    /// The source failed or vanished; the sink was closed with 1011
    Failed(String),
    /// The sink could not be written
    SinkFailed(String),
}

/// Outcome of a relay session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySummary {
    pub to_gateway: Option<PumpEnd>,
    pub to_caller: Option<PumpEnd>,
}

fn error_close(reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Error,
        reason: reason.to_string().into(),
    }))
}

/// Forward frames from `source` to `sink` until either side ends
async fn pump<S, K>(
    mut source: S,
    mut sink: K,
    rewriter: Option<&ErrorRewriter>,
    failure_reason: &'static str,
) -> PumpEnd
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
    K: Sink<Message, Error = WsError> + Unpin,
{
    loop {
        let message = match source.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                let _ = sink.send(error_close(failure_reason)).await;
                let _ = sink.close().await;
                return PumpEnd::Failed(e.to_string());
            }
            None => {
                let _ = sink.send(error_close(failure_reason)).await;
                let _ = sink.close().await;
                return PumpEnd::Failed("stream ended without close frame".to_string());
            }
        };

        let outgoing = match message {
            Message::Text(text) => match rewriter.and_then(|r| r.rewrite_text(text.as_str())) {
                Some(rewritten) => {
                    debug!("Rewrote gateway error frame");
                    Message::text(rewritten)
                }
                None => Message::Text(text),
            },
            Message::Binary(data) => Message::Binary(data),
            Message::Close(frame) => {
                let code = frame.as_ref().map(|f| u16::from(f.code));
                let frame = match (frame, rewriter) {
                    (Some(frame), Some(rewriter)) => Some(CloseFrame {
                        code: frame.code,
                        reason: rewriter.rewrite_close_reason(&frame.reason).into(),
                    }),
                    (frame, _) => frame,
                };
                let _ = sink.send(Message::Close(frame)).await;
                let _ = sink.close().await;
                return PumpEnd::Closed(code);
            }
            // Control frames are answered by each leg itself
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };

        if let Err(e) = sink.send(outgoing).await {
            return PumpEnd::SinkFailed(e.to_string());
        }
    }
}

/// Relay frames between the two legs until both have closed
pub async fn relay<C, G>(
    caller: WebSocketStream<C>,
    gateway: WebSocketStream<G>,
    rewriter: ErrorRewriter,
) -> RelaySummary
where
    C: AsyncRead + AsyncWrite + Unpin,
    G: AsyncRead + AsyncWrite + Unpin,
{
    let (caller_tx, caller_rx) = caller.split();
    let (gateway_tx, gateway_rx) = gateway.split();

    let to_gateway = pump(caller_rx, gateway_tx, None, "Client error");
    let to_caller = pump(gateway_rx, caller_tx, Some(&rewriter), "Container error");
    tokio::pin!(to_gateway);
    tokio::pin!(to_caller);

    let summary = tokio::select! {
        end = &mut to_gateway => RelaySummary {
            to_caller: tokio::time::timeout(CLOSE_GRACE, &mut to_caller).await.ok(),
            to_gateway: Some(end),
        },
        end = &mut to_caller => RelaySummary {
            to_gateway: tokio::time::timeout(CLOSE_GRACE, &mut to_gateway).await.ok(),
            to_caller: Some(end),
        },
    };

    match (&summary.to_gateway, &summary.to_caller) {
        (Some(PumpEnd::Closed(_)), _) | (_, Some(PumpEnd::Closed(_))) => {
            info!(to_gateway = ?summary.to_gateway, to_caller = ?summary.to_caller, "WebSocket relay closed");
        }
        _ => {
            warn!(to_gateway = ?summary.to_gateway, to_caller = ?summary.to_caller, "WebSocket relay ended abnormally");
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn ws_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        (server, client)
    }

    /// (caller, gateway, relay task) with the relay running between them
    async fn relayed() -> (
        WebSocketStream<DuplexStream>,
        WebSocketStream<DuplexStream>,
        tokio::task::JoinHandle<RelaySummary>,
    ) {
        let (proxy_caller_leg, caller) = ws_pair().await;
        let (gateway, proxy_gateway_leg) = ws_pair().await;
        let rewriter = ErrorRewriter::new("bot.example.com", "/_admin/");
        let task = tokio::spawn(relay(proxy_caller_leg, proxy_gateway_leg, rewriter));
        (caller, gateway, task)
    }

    async fn next_text(ws: &mut WebSocketStream<DuplexStream>) -> String {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => text.to_string(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    async fn next_close(ws: &mut WebSocketStream<DuplexStream>) -> CloseFrame {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Close(Some(frame)) => return frame,
                Message::Close(None) => panic!("close frame without code"),
                _ => continue,
            }
        }
    }

    #[test]
    fn test_rewrites_token_errors() {
        let rewriter = ErrorRewriter::new("bot.example.com", "/_admin/");
        let out = rewriter.rewrite_text(r#"{"error":"gateway token mismatch"}"#).unwrap();
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(
            value["error"],
            "Invalid or missing token. Visit https://bot.example.com?token={REPLACE_WITH_YOUR_TOKEN}"
        );

        let out = rewriter
            .rewrite_text(r#"{"type":"res","error":"Unauthorized: Gateway Token Missing"}"#)
            .unwrap();
        assert!(out.contains("https://bot.example.com?token="));
        assert!(out.contains(r#""type":"res""#));
    }

    #[test]
    fn test_rewrites_pairing_error() {
        let rewriter = ErrorRewriter::new("bot.example.com", "/_admin/");
        let out = rewriter.rewrite_text(r#"{"error":"pairing required"}"#).unwrap();
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["error"], "Pairing required. Visit https://bot.example.com/_admin/");
    }

    #[test]
    fn test_leaves_other_frames_alone() {
        let rewriter = ErrorRewriter::new("h", "/p");
        assert!(rewriter.rewrite_text(r#"{"error":"rate limited"}"#).is_none());
        assert!(rewriter.rewrite_text(r#"{"error":{"message":"pairing required"}}"#).is_none());
        assert!(rewriter.rewrite_text(r#"["gateway token missing"]"#).is_none());
        assert!(rewriter.rewrite_text("gateway token missing").is_none());
        assert!(rewriter.rewrite_text(r#"{"message":"pairing required"}"#).is_none());
    }

    #[test]
    fn test_close_reason_is_truncated() {
        let rewriter = ErrorRewriter::new("a-very-long-hostname.example.com", "/_admin/");
        let reason = rewriter.rewrite_close_reason("gateway token missing");
        assert!(reason.len() <= MAX_CLOSE_REASON_BYTES);
        assert!(reason.starts_with("Invalid or missing token."));

        assert_eq!(rewriter.rewrite_close_reason("bye"), "bye");
        let long = "é".repeat(100);
        let cut = rewriter.rewrite_close_reason(&long);
        assert_eq!(cut.len(), 122);
    }

    #[tokio::test]
    async fn test_relays_frames_both_ways() {
        let (mut caller, mut gateway, _task) = relayed().await;

        caller.send(Message::text("hello")).await.unwrap();
        assert_eq!(next_text(&mut gateway).await, "hello");

        let untouched = r#"{ "error" : "rate limited", "retry": 3 }"#;
        gateway.send(Message::text(untouched)).await.unwrap();
        assert_eq!(next_text(&mut caller).await, untouched);

        gateway.send(Message::text("not json")).await.unwrap();
        assert_eq!(next_text(&mut caller).await, "not json");

        gateway
            .send(Message::text(r#"{"error":"gateway token mismatch"}"#))
            .await
            .unwrap();
        assert!(next_text(&mut caller).await.contains("https://bot.example.com?token="));

        gateway.send(Message::Binary(vec![1u8, 2, 3].into())).await.unwrap();
        match caller.next().await.unwrap().unwrap() {
            Message::Binary(data) => assert_eq!(&data[..], &[1, 2, 3]),
            other => panic!("expected binary frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_caller_close_propagates_code() {
        let (mut caller, mut gateway, task) = relayed().await;

        caller
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "done".to_string().into(),
            })))
            .await
            .unwrap();

        let frame = next_close(&mut gateway).await;
        assert_eq!(u16::from(frame.code), 1000);
        assert_eq!(&*frame.reason, "done");

        drop(gateway);
        drop(caller);
        let summary = task.await.unwrap();
        assert_eq!(summary.to_gateway, Some(PumpEnd::Closed(Some(1000))));
    }

    #[tokio::test]
    async fn test_gateway_close_reason_is_rewritten() {
        let (mut caller, mut gateway, _task) = relayed().await;

        gateway
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::from(4008),
                reason: "pairing required".to_string().into(),
            })))
            .await
            .unwrap();

        let frame = next_close(&mut caller).await;
        assert_eq!(u16::from(frame.code), 4008);
        assert_eq!(&*frame.reason, "Pairing required. Visit https://bot.example.com/_admin/");
    }

    #[tokio::test]
    async fn test_gateway_failure_closes_caller_with_1011() {
        let (mut caller, gateway, _task) = relayed().await;
        drop(gateway);

        let frame = next_close(&mut caller).await;
        assert_eq!(u16::from(frame.code), 1011);
        assert_eq!(&*frame.reason, "Container error");
    }
}
