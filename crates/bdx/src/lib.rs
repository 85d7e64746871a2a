//! Matter BDX (Bulk Data Exchange) block-transfer state machine
//! (`spec.md` §4.11). Only the receiver-drive, receiver-side state machine
//! is implemented; the Matter exchange itself and TLV encode/decode are
//! external collaborators reached through [`transport::BdxTransport`].

pub mod error;
pub mod message;
pub mod receiver;
pub mod transport;

pub use error::{BdxError, BdxStatusResponseError, StatusCode};
pub use message::{next_block_counter, Message, MessageType};
pub use receiver::{ReceivedTransfer, ReceiverError, ReceiverSession, ReceiverState, IDLE_TIMEOUT};
pub use transport::{BdxTransport, TransportError};

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::*;

    /// An in-memory transport that plays back a scripted sequence of
    /// inbound messages and records every outbound one.
    struct ScriptedTransport {
        inbound: Mutex<VecDeque<Message>>,
        outbound: Mutex<Vec<Message>>,
    }

    impl ScriptedTransport {
        fn new(inbound: Vec<Message>) -> Self {
            Self { inbound: Mutex::new(inbound.into()), outbound: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl BdxTransport for ScriptedTransport {
        async fn send(&self, message: Message) -> Result<(), TransportError> {
            self.outbound.lock().await.push(message);
            Ok(())
        }

        async fn recv(&self) -> Result<Message, TransportError> {
            self.inbound.lock().await.pop_front().ok_or(TransportError::Closed)
        }
    }

    #[tokio::test]
    async fn happy_path_reassembles_all_bytes_in_order() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Message::ReceiveAccept { max_block_size: 1024, file_size: Some(6), start_offset: 0 },
            Message::Block { block_counter: 0, data: vec![1, 2, 3] },
            Message::BlockEof { block_counter: 1, data: vec![4, 5, 6] },
        ]));
        let session = ReceiverSession::new(transport.clone(), abort::Abort::new());

        let transfer = session.run("firmware.bin", 1024, 0).await.unwrap();
        assert_eq!(transfer.data, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(transfer.file_size, Some(6));

        let outbound = transport.outbound.lock().await;
        assert!(matches!(outbound[0], Message::ReceiveInit { .. }));
        assert!(matches!(outbound[1], Message::BlockQuery { block_counter: 0 }));
        assert!(matches!(outbound[2], Message::BlockAck { block_counter: 0 }));
        assert!(matches!(outbound[3], Message::BlockQuery { block_counter: 1 }));
        assert!(matches!(outbound[4], Message::BlockAckEof { block_counter: 1 }));
    }

    #[tokio::test]
    async fn empty_block_is_rejected_as_bad_message_content() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Message::ReceiveAccept { max_block_size: 1024, file_size: None, start_offset: 0 },
            Message::Block { block_counter: 0, data: vec![] },
        ]));
        let session = ReceiverSession::new(transport.clone(), abort::Abort::new());

        let err = session.run("firmware.bin", 1024, 0).await.unwrap_err();
        assert!(matches!(err, ReceiverError::Protocol(BdxError(StatusCode::BadMessageContent))));

        let outbound = transport.outbound.lock().await;
        assert!(matches!(outbound.last(), Some(Message::StatusReport { .. })));
    }

    #[tokio::test]
    async fn mismatched_block_counter_is_rejected() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Message::ReceiveAccept { max_block_size: 1024, file_size: None, start_offset: 0 },
            Message::Block { block_counter: 7, data: vec![9] },
        ]));
        let session = ReceiverSession::new(transport.clone(), abort::Abort::new());

        let err = session.run("firmware.bin", 1024, 0).await.unwrap_err();
        assert!(matches!(err, ReceiverError::Protocol(BdxError(StatusCode::BadBlockCounter))));
    }

    #[tokio::test]
    async fn unexpected_message_during_await_accept_is_rejected() {
        let transport = Arc::new(ScriptedTransport::new(vec![Message::BlockAck { block_counter: 0 }]));
        let session = ReceiverSession::new(transport.clone(), abort::Abort::new());

        let err = session.run("firmware.bin", 1024, 0).await.unwrap_err();
        assert!(matches!(err, ReceiverError::Protocol(BdxError(StatusCode::UnexpectedMessage))));
    }

    #[tokio::test]
    async fn peer_status_report_surfaces_as_peer_status_error() {
        let transport = Arc::new(ScriptedTransport::new(vec![Message::StatusReport {
            general_code: 5,
            protocol_code: 0x05,
        }]));
        let session = ReceiverSession::new(transport.clone(), abort::Abort::new());

        let err = session.run("firmware.bin", 1024, 0).await.unwrap_err();
        assert!(matches!(err, ReceiverError::PeerStatus(_)));
    }

    #[tokio::test]
    async fn abort_during_await_stops_the_session() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let abort = abort::Abort::new();
        abort.abort(None);
        let session = ReceiverSession::new(transport, abort);

        let err = session.run("firmware.bin", 1024, 0).await.unwrap_err();
        assert!(matches!(err, ReceiverError::Aborted));
    }
}
