//! The Matter exchange is an external collaborator (`spec.md` §1); BDX only
//! ever talks through this trait.

use async_trait::async_trait;

use crate::message::Message;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("exchange closed")]
    Closed,
    #[error("transport error: {0}")]
    Transient(String),
}

#[async_trait]
pub trait BdxTransport: Send + Sync {
    async fn send(&self, message: Message) -> Result<(), TransportError>;
    async fn recv(&self) -> Result<Message, TransportError>;
}

#[async_trait]
impl<T: BdxTransport + ?Sized> BdxTransport for std::sync::Arc<T> {
    async fn send(&self, message: Message) -> Result<(), TransportError> {
        (**self).send(message).await
    }

    async fn recv(&self) -> Result<Message, TransportError> {
        (**self).recv().await
    }
}
