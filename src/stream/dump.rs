//! Newline-delimited JSON dump of a fan-out collection.

use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::core::{
    error::StreamError, fanout::FanoutCollector, traits::RemoteEntityClient,
    traits::StreamSource,
};

/// Serializes `value` as one JSON line.
pub async fn write_json_line<T>(
    out: &mut (dyn AsyncWrite + Send + Unpin),
    value: &T,
) -> Result<(), StreamError>
where
    T: Serialize + ?Sized,
{
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    out.write_all(&line).await?;
    Ok(())
}

/// Stream source that collects every entity of a backend and writes each
/// `CollectedResult` as one JSON line. Entities that failed are left out of
/// the dump; they are reported through the collector's logging.
pub struct CollectionDumpSource<C: RemoteEntityClient> {
    collector: FanoutCollector<C>,
}

impl<C: RemoteEntityClient> CollectionDumpSource<C> {
    pub fn new(collector: FanoutCollector<C>) -> Self {
        Self { collector }
    }
}

#[async_trait::async_trait]
impl<C> StreamSource for CollectionDumpSource<C>
where
    C: RemoteEntityClient,
    C::Detail: Serialize + Sync,
    C::Metrics: Serialize + Sync,
{
    async fn run(&mut self, out: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<(), StreamError> {
        let collection = self.collector.collect_all().await?;

        for result in &collection.results {
            write_json_line(out, result).await?;
        }
        out.flush().await?;

        debug!("Dumped {} records", collection.results.len());
        if !collection.errors.is_empty() {
            info!(
                "{} entities were left out of the dump",
                collection.errors.len()
            );
        }
        Ok(())
    }
}
