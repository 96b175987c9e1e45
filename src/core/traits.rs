use tokio::io::{AsyncRead, AsyncWrite};

use super::{
    error::{RemoteCallError, StreamError},
    types::EntityHandle,
};

/// Backend that exposes a set of addressable entities.
///
/// `fetch_detail` and `fetch_metrics` are independent calls and may fail
/// independently. Implementations must be shareable across worker tasks.
#[async_trait::async_trait]
pub trait RemoteEntityClient: Send + Sync + 'static {
    /// Structural or state snapshot of an entity.
    type Detail: Send + 'static;

    /// Resource-usage snapshot of an entity.
    type Metrics: Send + 'static;

    /// Lists the handles of every entity currently known to the backend.
    async fn list_entities(&self) -> Result<Vec<EntityHandle>, RemoteCallError>;

    async fn fetch_detail(&self, handle: &EntityHandle) -> Result<Self::Detail, RemoteCallError>;

    async fn fetch_metrics(&self, handle: &EntityHandle)
        -> Result<Self::Metrics, RemoteCallError>;
}

/// Producer stage of a stream bridge.
///
/// Writes its data set incrementally into `out`. Returning (successfully or
/// not) ends the stream; the bridge closes the channel afterwards.
#[async_trait::async_trait]
pub trait StreamSource: Send + 'static {
    async fn run(&mut self, out: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<(), StreamError>;
}

/// Consumer stage of a stream bridge.
///
/// Reads and reduces the data set from `input` until end of stream.
#[async_trait::async_trait]
pub trait StreamSink: Send + 'static {
    async fn run(&mut self, input: &mut (dyn AsyncRead + Send + Unpin)) -> Result<(), StreamError>;
}
