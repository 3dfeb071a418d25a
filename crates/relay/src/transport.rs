//! Session transport abstraction and its server-push stream implementation.

use crate::error::{RelayError, Result};
use crate::jsonrpc::JsonRpcMessage;
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One item pushed to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    /// Where the client should submit its messages. Always the first frame.
    Endpoint(String),
    Message(JsonRpcMessage),
}

/// Outbound half handed to the HTTP layer. Dropping it closes the transport.
pub type OutboundStream = BoxStream<'static, OutboundFrame>;

/// Inbound half consumed by the session worker.
pub type InboundReceiver = mpsc::Receiver<JsonRpcMessage>;

#[derive(Debug, Clone, Copy)]
pub struct TransportSettings {
    /// Inbound messages buffered per session before submitters wait.
    pub inbound_capacity: usize,
    /// Outbound frames buffered per session before the worker waits.
    pub outbound_capacity: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            inbound_capacity: 64,
            outbound_capacity: 64,
        }
    }
}

/// A bidirectional message channel bound to one session.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a transport for `session_id`, returning the outbound stream and the inbound queue.
    fn open(
        session_id: &str,
        endpoint: String,
        settings: &TransportSettings,
    ) -> (Self, OutboundStream, InboundReceiver)
    where
        Self: Sized;

    fn session_id(&self) -> &str;

    /// Push one message to the client.
    async fn send(&self, message: JsonRpcMessage) -> Result<()>;

    /// Submit one inbound message, in arrival order, to the session's handler.
    async fn deliver(&self, message: JsonRpcMessage) -> Result<()>;

    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Resolves once the transport is closed, from either side.
    async fn closed(&self);
}

pub struct SseTransport {
    session_id: String,
    outbound: mpsc::Sender<OutboundFrame>,
    inbound: mpsc::Sender<JsonRpcMessage>,
    cancel: CancellationToken,
}

#[async_trait]
impl Transport for SseTransport {
    fn open(
        session_id: &str,
        endpoint: String,
        settings: &TransportSettings,
    ) -> (Self, OutboundStream, InboundReceiver) {
        let (out_tx, out_rx) = mpsc::channel(settings.outbound_capacity.max(1));
        let (in_tx, in_rx) = mpsc::channel(settings.inbound_capacity.max(1));
        let cancel = CancellationToken::new();

        // Fresh channel with capacity >= 1, so the endpoint frame always fits.
        let _ = out_tx.try_send(OutboundFrame::Endpoint(endpoint));

        let guard = cancel.clone().drop_guard();
        let token = cancel.clone();
        let outbound = stream::unfold(
            (out_rx, guard, token),
            |(mut rx, guard, token)| async move {
                let frame = tokio::select! {
                    biased;
                    frame = rx.recv() => frame,
                    () = token.cancelled() => None,
                };
                frame.map(|f| (f, (rx, guard, token)))
            },
        );

        let transport = Self {
            session_id: session_id.to_string(),
            outbound: out_tx,
            inbound: in_tx,
            cancel,
        };
        (transport, Box::pin(outbound), in_rx)
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<()> {
        if self.is_closed() {
            return Err(RelayError::SessionClosed(self.session_id.clone()));
        }
        tokio::select! {
            sent = self.outbound.send(OutboundFrame::Message(message)) => {
                sent.map_err(|_| RelayError::SessionClosed(self.session_id.clone()))
            }
            () = self.cancel.cancelled() => Err(RelayError::SessionClosed(self.session_id.clone())),
        }
    }

    async fn deliver(&self, message: JsonRpcMessage) -> Result<()> {
        if self.is_closed() {
            return Err(RelayError::SessionClosed(self.session_id.clone()));
        }
        tokio::select! {
            sent = self.inbound.send(message) => {
                sent.map_err(|_| RelayError::SessionClosed(self.session_id.clone()))
            }
            () = self.cancel.cancelled() => Err(RelayError::SessionClosed(self.session_id.clone())),
        }
    }

    fn close(&self) {
        self.cancel.cancel();
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn closed(&self) {
        self.cancel.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::RequestId;
    use futures::StreamExt as _;
    use serde_json::json;

    fn open() -> (SseTransport, OutboundStream, InboundReceiver) {
        SseTransport::open(
            "s-1",
            "/message?sessionId=s-1".to_string(),
            &TransportSettings::default(),
        )
    }

    #[tokio::test]
    async fn endpoint_frame_comes_first() {
        let (transport, mut outbound, _inbound) = open();
        let reply = JsonRpcMessage::response(Some(RequestId::Number(1.into())), json!({}));
        transport.send(reply.clone()).await.expect("send");

        assert_eq!(
            outbound.next().await,
            Some(OutboundFrame::Endpoint("/message?sessionId=s-1".to_string()))
        );
        assert_eq!(outbound.next().await, Some(OutboundFrame::Message(reply)));
    }

    #[tokio::test]
    async fn inbound_messages_keep_arrival_order() {
        let (transport, _outbound, mut inbound) = open();
        for i in 0..3 {
            let msg = JsonRpcMessage::request(RequestId::Number(i.into()), "ping", None);
            transport.deliver(msg).await.expect("deliver");
        }
        for i in 0..3 {
            let msg = inbound.recv().await.expect("message");
            assert_eq!(msg.id, Some(RequestId::Number(i.into())));
        }
    }

    #[tokio::test]
    async fn dropping_the_outbound_stream_closes_the_transport() {
        let (transport, outbound, _inbound) = open();
        assert!(!transport.is_closed());
        drop(outbound);
        transport.closed().await;
        assert!(transport.is_closed());

        let err = transport
            .deliver(JsonRpcMessage::notification("ping", None))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::SessionClosed(_)));
    }

    #[tokio::test]
    async fn close_ends_the_outbound_stream() {
        let (transport, mut outbound, _inbound) = open();
        assert!(matches!(
            outbound.next().await,
            Some(OutboundFrame::Endpoint(_))
        ));
        transport.close();
        assert_eq!(outbound.next().await, None);
        assert!(transport.send(JsonRpcMessage::notification("x", None)).await.is_err());
    }
}
