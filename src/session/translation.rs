//! Per-session translation stage.
//!
//! Segments go in through an unbounded channel and are translated one at a
//! time. Draining closes the channel and waits for the backlog, bounded by a
//! timeout; past it the stage is cancelled and only finished translations are
//! kept.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::status::{TranscriptSegment, TranslatedSegment, TranslationState};
use crate::engine::Translator;

pub(crate) struct TranslationStage {
    session_id: Uuid,
    input: mpsc::UnboundedSender<TranscriptSegment>,
    cancel: CancellationToken,
    done: Arc<Mutex<Vec<TranslatedSegment>>>,
    worker: JoinHandle<()>,
}

impl TranslationStage {
    pub(crate) fn spawn(
        session_id: Uuid,
        translator: Arc<dyn Translator>,
        target_language: String,
    ) -> Self {
        let (input, mut rx) = mpsc::unbounded_channel::<TranscriptSegment>();
        let cancel = CancellationToken::new();
        let done = Arc::new(Mutex::new(Vec::new()));

        let worker = {
            let cancel = cancel.clone();
            let done = Arc::clone(&done);
            tokio::spawn(async move {
                loop {
                    let segment = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        segment = rx.recv() => match segment {
                            Some(segment) => segment,
                            None => break,
                        },
                    };

                    let translated = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        result = translator.translate(&segment.text, &target_language) => result,
                    };

                    match translated {
                        Ok(text) => done.lock().await.push(TranslatedSegment {
                            index: segment.index,
                            text,
                        }),
                        Err(e) => warn!(
                            "Translation of segment {} for session {} failed: {:#}",
                            segment.index, session_id, e
                        ),
                    }
                }
            })
        };

        Self {
            session_id,
            input,
            cancel,
            done,
            worker,
        }
    }

    pub(crate) fn submit(&self, segment: TranscriptSegment) {
        if self.input.send(segment).is_err() {
            debug!("Translation stage for session {} already closed", self.session_id);
        }
    }

    /// Finish queued work within `timeout`, or cancel and keep what is done.
    pub(crate) async fn drain(self, timeout: Duration) -> (TranslationState, Vec<TranslatedSegment>) {
        let Self {
            session_id,
            input,
            cancel,
            done,
            mut worker,
        } = self;
        drop(input);

        let state = match tokio::time::timeout(timeout, &mut worker).await {
            Ok(_) => TranslationState::Complete,
            Err(_) => {
                warn!(
                    "Translation drain for session {} exceeded {:?}, cancelling",
                    session_id, timeout
                );
                cancel.cancel();
                let _ = worker.await;
                TranslationState::Cancelled
            }
        };

        let mut segments = std::mem::take(&mut *done.lock().await);
        segments.sort_by_key(|segment| segment.index);
        (state, segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct SlowTranslator {
        delay: Duration,
    }

    #[async_trait]
    impl Translator for SlowTranslator {
        async fn translate(&self, text: &str, target_language: &str) -> anyhow::Result<String> {
            tokio::time::sleep(self.delay).await;
            Ok(format!("{target_language}:{text}"))
        }
    }

    fn segment(index: usize) -> TranscriptSegment {
        TranscriptSegment {
            index,
            start_secs: index as f64,
            end_secs: index as f64 + 1.0,
            text: format!("s{index}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_completes_backlog() {
        let stage = TranslationStage::spawn(
            Uuid::new_v4(),
            Arc::new(SlowTranslator {
                delay: Duration::from_secs(1),
            }),
            "fr".to_string(),
        );
        for i in 0..3 {
            stage.submit(segment(i));
        }

        let (state, segments) = stage.drain(Duration::from_secs(30)).await;
        assert_eq!(state, TranslationState::Complete);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[2].text, "fr:s2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_timeout_keeps_only_finished_segments() {
        let stage = TranslationStage::spawn(
            Uuid::new_v4(),
            Arc::new(SlowTranslator {
                delay: Duration::from_secs(10),
            }),
            "fr".to_string(),
        );
        for i in 0..5 {
            stage.submit(segment(i));
        }

        let (state, segments) = stage.drain(Duration::from_secs(25)).await;
        assert_eq!(state, TranslationState::Cancelled);
        let indexes: Vec<usize> = segments.iter().map(|s| s.index).collect();
        assert_eq!(indexes, vec![0, 1]);
    }
}
