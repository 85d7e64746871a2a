//! Receiver-drive BDX state machine, receiver side (`spec.md` §4.11):
//!
//! ```text
//! IDLE → sendReceiveInit → AWAIT_ACCEPT
//! AWAIT_ACCEPT → on ReceiveAccept → QUERYING
//! QUERYING → sendBlockQuery → AWAITING_BLOCK
//! AWAITING_BLOCK → Block (non-empty) → ACK → QUERYING
//!                → BlockEof → sendBlockAckEof → DONE
//! DONE → close exchange
//! ```

use std::time::Duration;

use abort::Abort;

use crate::error::{BdxError, BdxStatusResponseError, StatusCode};
use crate::message::{next_block_counter, Message};
use crate::transport::{BdxTransport, TransportError};

pub const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Idle,
    AwaitAccept,
    Querying,
    AwaitingBlock,
    Done,
    Closed,
}

#[derive(Debug)]
pub struct ReceivedTransfer {
    pub data: Vec<u8>,
    pub file_size: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    #[error(transparent)]
    Protocol(#[from] BdxError),
    #[error(transparent)]
    PeerStatus(#[from] BdxStatusResponseError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("bdx session aborted")]
    Aborted,
}

impl error_kind::Classify for ReceiverError {
    fn kind(&self) -> error_kind::ErrorKind {
        match self {
            ReceiverError::Protocol(_) => error_kind::ErrorKind::Bdx,
            ReceiverError::PeerStatus(_) => error_kind::ErrorKind::Bdx,
            ReceiverError::Transport(_) => error_kind::ErrorKind::TransientPeerCommunication,
            ReceiverError::Aborted => error_kind::ErrorKind::Aborted,
        }
    }
}

pub struct ReceiverSession<T: BdxTransport> {
    transport: T,
    abort: Abort,
    state: ReceiverState,
    max_block_size: u32,
    expected_block_counter: u32,
    data: Vec<u8>,
}

impl<T: BdxTransport> ReceiverSession<T> {
    pub fn new(transport: T, abort: Abort) -> Self {
        Self {
            transport,
            abort,
            state: ReceiverState::Idle,
            max_block_size: 0,
            expected_block_counter: 0,
            data: Vec::new(),
        }
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    /// Drives the transfer to completion, returning the reassembled bytes
    /// in order. On any protocol violation, a status report is sent to the
    /// peer and the exchange is considered closed.
    pub async fn run(
        mut self,
        file_designator: impl Into<String>,
        proposed_max_block_size: u32,
        start_offset: u64,
    ) -> Result<ReceivedTransfer, ReceiverError> {
        self.transport
            .send(Message::ReceiveInit {
                file_designator: file_designator.into(),
                proposed_max_block_size,
                file_size: None,
                start_offset,
            })
            .await?;
        self.state = ReceiverState::AwaitAccept;

        let (max_block_size, file_size) = match self.recv_next().await? {
            Message::ReceiveAccept { max_block_size, file_size, .. } => {
                (max_block_size.min(proposed_max_block_size), file_size)
            }
            Message::StatusReport { general_code, protocol_code } => {
                return Err(BdxStatusResponseError { general: general_code, protocol: protocol_code }.into())
            }
            _ => return Err(self.fail(StatusCode::UnexpectedMessage).await),
        };
        self.max_block_size = max_block_size;
        self.expected_block_counter = 0;
        self.state = ReceiverState::Querying;

        loop {
            self.transport.send(Message::BlockQuery { block_counter: self.expected_block_counter }).await?;
            self.state = ReceiverState::AwaitingBlock;

            match self.recv_next().await? {
                Message::Block { block_counter, data } => {
                    if block_counter != self.expected_block_counter {
                        return Err(self.fail(StatusCode::BadBlockCounter).await);
                    }
                    if data.is_empty() {
                        return Err(self.fail(StatusCode::BadMessageContent).await);
                    }
                    self.data.extend_from_slice(&data);
                    self.transport.send(Message::BlockAck { block_counter }).await?;
                    self.expected_block_counter = next_block_counter(block_counter);
                    self.state = ReceiverState::Querying;
                }
                Message::BlockEof { block_counter, data } => {
                    if block_counter != self.expected_block_counter {
                        return Err(self.fail(StatusCode::BadBlockCounter).await);
                    }
                    self.data.extend_from_slice(&data);
                    self.transport.send(Message::BlockAckEof { block_counter }).await?;
                    self.state = ReceiverState::Done;
                    break;
                }
                Message::StatusReport { general_code, protocol_code } => {
                    return Err(BdxStatusResponseError { general: general_code, protocol: protocol_code }.into())
                }
                _ => return Err(self.fail(StatusCode::UnexpectedMessage).await),
            }
        }

        Ok(ReceivedTransfer { data: self.data, file_size })
    }

    async fn recv_next(&mut self) -> Result<Message, ReceiverError> {
        let recv = self.transport.recv();
        match self.abort.race(tokio::time::timeout(IDLE_TIMEOUT, recv)).await {
            None => {
                self.state = ReceiverState::Closed;
                Err(ReceiverError::Aborted)
            }
            Some(Err(_elapsed)) => Err(self.fail(StatusCode::IdleTimeout).await),
            Some(Ok(Ok(message))) => Ok(message),
            Some(Ok(Err(err))) => Err(ReceiverError::Transport(err)),
        }
    }

    async fn fail(&mut self, code: StatusCode) -> ReceiverError {
        self.state = ReceiverState::Closed;
        if let Err(err) = self
            .transport
            .send(Message::StatusReport { general_code: 1, protocol_code: code.protocol_code() })
            .await
        {
            log::warn!("failed to send bdx status report for {code:?}: {err}");
        }
        ReceiverError::Protocol(BdxError(code))
    }
}
