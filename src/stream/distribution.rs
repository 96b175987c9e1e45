//! Incremental reduction of a JSON-lines dump into a value distribution.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    sync::oneshot,
};
use tracing::{debug, warn};

use crate::core::{error::StreamError, traits::StreamSink};

/// Label for records where the grouping field is absent or null.
pub const MISSING_LABEL: &str = "<none>";

/// Number of records per distinct value of one field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Distribution {
    pub field: String,
    pub total: usize,
    pub counts: BTreeMap<String, usize>,
}

impl Distribution {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ..Default::default()
        }
    }

    pub fn record(&mut self, label: String) {
        *self.counts.entry(label).or_insert(0) += 1;
        self.total += 1;
    }

    pub fn count(&self, label: &str) -> usize {
        self.counts.get(label).copied().unwrap_or(0)
    }
}

/// Stream sink that reads one JSON record per line and counts records by
/// the value found at a dotted field path.
///
/// The finished distribution is delivered through the receiver returned by
/// `DistributionSink::new`; it is only sent when the whole stream was
/// reduced without error.
pub struct DistributionSink {
    path: Vec<String>,
    distribution: Distribution,
    done: Option<oneshot::Sender<Distribution>>,
}

impl DistributionSink {
    pub fn new(group_by: &str) -> (Self, oneshot::Receiver<Distribution>) {
        let (done, receiver) = oneshot::channel();
        let sink = Self {
            path: group_by.split('.').map(str::to_string).collect(),
            distribution: Distribution::new(group_by),
            done: Some(done),
        };
        (sink, receiver)
    }

    fn label_of(&self, record: &Value) -> String {
        let found = self
            .path
            .iter()
            .try_fold(record, |value, key| value.get(key.as_str()));
        match found {
            None | Some(Value::Null) => MISSING_LABEL.to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl StreamSink for DistributionSink {
    async fn run(&mut self, input: &mut (dyn AsyncRead + Send + Unpin)) -> Result<(), StreamError> {
        let mut lines = BufReader::new(input).lines();
        let mut line_no = 0usize;

        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let record: Value = serde_json::from_str(&line).map_err(|e| {
                StreamError::Other(format!("invalid record on line {}: {}", line_no, e))
            })?;
            let label = self.label_of(&record);
            self.distribution.record(label);
        }

        debug!(
            "Reduced {} records into {} groups",
            self.distribution.total,
            self.distribution.counts.len()
        );
        if let Some(done) = self.done.take() {
            if done.send(std::mem::take(&mut self.distribution)).is_err() {
                warn!("Distribution receiver dropped before the result was ready");
            }
        }
        Ok(())
    }
}
