use std::{path::PathBuf, time::SystemTime};

use tokio::{
    fs::File,
    io::{AsyncBufReadExt, BufReader},
};

use crate::pipeline::{Envelope, EnvelopeStream, PipelineError, RawMessage, Source};

/// Replays saved bus payloads, one payload per line, as if they had just
/// arrived on `topic`. Blank lines are skipped.
pub struct ReplayFileSource {
    path: PathBuf,
    topic: String,
}

impl ReplayFileSource {
    pub fn new<P: Into<PathBuf>>(path: P, topic: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            topic: topic.into(),
        }
    }
}

#[async_trait::async_trait]
impl Source<RawMessage> for ReplayFileSource {
    async fn stream(&self) -> EnvelopeStream<RawMessage> {
        let path = self.path.clone();
        let topic = self.topic.clone();
        let s = async_stream::try_stream! {
            let file = File::open(&path)
                .await
                .map_err(|e| PipelineError::Source(format!("failed to open replay file {}: {e}", path.display())))?;
            let mut lines = BufReader::new(file).lines();

            while let Some(line) = lines
                .next_line()
                .await
                .map_err(|e| PipelineError::Source(format!("failed to read replay file: {e}")))?
            {
                if line.trim().is_empty() {
                    continue;
                }
                yield Envelope {
                    payload: RawMessage::new(topic.clone(), line.into_bytes()),
                    received_at: SystemTime::now(),
                };
            }
        };

        Box::pin(s)
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn yields_one_message_per_non_blank_line() {
        let path = std::env::temp_dir().join(format!("replay-{}.ndjson", std::process::id()));
        tokio::fs::write(&path, "{\"a\": 1}\n\n{\"b\": 2}\n").await.unwrap();

        let source = ReplayFileSource::new(&path, "/replay");
        let items: Vec<_> = source.stream().await.collect().await;
        tokio::fs::remove_file(&path).await.unwrap();

        assert_eq!(items.len(), 2);
        let first = items[0].as_ref().unwrap();
        assert_eq!(first.payload.topic, "/replay");
        assert_eq!(&first.payload.payload[..], b"{\"a\": 1}");
    }

    #[tokio::test]
    async fn missing_file_is_a_source_error() {
        let source = ReplayFileSource::new("/nonexistent/replay.ndjson", "/replay");
        let items: Vec<_> = source.stream().await.collect().await;
        assert!(matches!(items.as_slice(), [Err(PipelineError::Source(_))]));
    }
}
