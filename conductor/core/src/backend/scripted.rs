//! Scripted Backend
//!
//! An in-process backend that plays back predetermined fragment scripts.
//! Used by the test suites and by the daemon's offline demo mode.
//!
//! # Usage
//!
//! ```ignore
//! use stream_conductor_core::backend::{Script, ScriptedBackend};
//!
//! let backend = ScriptedBackend::new();
//! backend.push_script(Script::new().token("Hel").hold().token("lo").complete());
//!
//! // ... open a channel, observe "Hel" ...
//! backend.release(); // let the held script continue
//! ```
//!
//! When no script is queued the backend echoes the question back word by
//! word, which makes it usable as a stand-in for a real model.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use super::traits::{BackendError, BackendFragment, GenerationBackend, GenerationRequest};

/// One step of a script
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScriptStep {
    /// Emit a text fragment with an explicit sequence number
    Token {
        /// Sequence number to stamp on the fragment
        sequence: u64,
        /// Fragment text
        text: String,
    },
    /// Emit the completion marker and stop
    Complete,
    /// Emit a mid-stream failure and stop
    Fail(String),
    /// Wait for [`ScriptedBackend::release`] (or cancellation)
    Hold,
    /// Release the sender without any terminal marker
    Drop,
}

/// An ordered list of steps played back for one request
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Script {
    steps: Vec<ScriptStep>,
    next_sequence: u64,
}

impl Script {
    /// Create an empty script
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A well-behaved answer: one fragment per piece, then completion
    #[must_use]
    pub fn answer<I, S>(pieces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        pieces
            .into_iter()
            .fold(Self::new(), |script, piece| script.token(piece))
            .complete()
    }

    /// Append a fragment numbered after the previous one
    #[must_use]
    pub fn token(self, text: impl Into<String>) -> Self {
        let sequence = self.next_sequence;
        self.token_at(sequence, text)
    }

    /// Append a fragment with an explicit sequence number
    #[must_use]
    pub fn token_at(mut self, sequence: u64, text: impl Into<String>) -> Self {
        self.steps.push(ScriptStep::Token {
            sequence,
            text: text.into(),
        });
        self.next_sequence = sequence + 1;
        self
    }

    /// Append the completion marker
    #[must_use]
    pub fn complete(mut self) -> Self {
        self.steps.push(ScriptStep::Complete);
        self
    }

    /// Append a mid-stream failure
    #[must_use]
    pub fn fail(mut self, message: impl Into<String>) -> Self {
        self.steps.push(ScriptStep::Fail(message.into()));
        self
    }

    /// Append a pause until released
    #[must_use]
    pub fn hold(mut self) -> Self {
        self.steps.push(ScriptStep::Hold);
        self
    }

    /// Append an abrupt end without a terminal marker
    #[must_use]
    pub fn drop_stream(mut self) -> Self {
        self.steps.push(ScriptStep::Drop);
        self
    }

    /// The recorded steps
    #[must_use]
    pub fn steps(&self) -> &[ScriptStep] {
        &self.steps
    }

    /// Build the echo script used when nothing is queued
    fn echo(prompt: &str) -> Self {
        let mut pieces: Vec<String> = prompt
            .split_inclusive(' ')
            .map(ToString::to_string)
            .collect();
        if pieces.is_empty() {
            pieces.push(String::new());
        }
        Self::answer(pieces)
    }
}

/// Backend that plays back queued scripts
pub struct ScriptedBackend {
    /// Scripts consumed in FIFO order, one per request
    scripts: Mutex<VecDeque<Script>>,
    /// Every request received, in arrival order
    requests: Mutex<Vec<GenerationRequest>>,
    /// Permits that let held scripts continue
    gate: Arc<Semaphore>,
    /// Fail every `open` as unreachable
    unavailable: AtomicBool,
    /// Producer keeps running (and holding its sender) after cancellation
    ignore_cancel: AtomicBool,
    /// Producers that have not yet dropped their sender
    live_producers: Arc<AtomicUsize>,
    /// Capacity of each fragment channel
    channel_capacity: usize,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    /// Create a backend with an empty script queue
    #[must_use]
    pub fn new() -> Self {
        Self::with_channel_capacity(100)
    }

    /// Create a backend whose fragment channels hold `capacity` items
    #[must_use]
    pub fn with_channel_capacity(capacity: usize) -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            gate: Arc::new(Semaphore::new(0)),
            unavailable: AtomicBool::new(false),
            ignore_cancel: AtomicBool::new(false),
            live_producers: Arc::new(AtomicUsize::new(0)),
            channel_capacity: capacity.max(1),
        }
    }

    /// Queue a script for the next request
    pub fn push_script(&self, script: Script) {
        self.scripts.lock().push_back(script);
    }

    /// Let one held step continue
    pub fn release(&self) {
        self.gate.add_permits(1);
    }

    /// Make subsequent `open` calls fail as if the server were down
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make producers ignore cancellation (simulates a slow-to-cancel backend)
    pub fn set_ignore_cancel(&self, ignore: bool) {
        self.ignore_cancel.store(ignore, Ordering::SeqCst);
    }

    /// Requests received so far
    #[must_use]
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }

    /// Number of producers still holding their sender
    #[must_use]
    pub fn live_producers(&self) -> usize {
        self.live_producers.load(Ordering::SeqCst)
    }

    fn next_script(&self, request: &GenerationRequest) -> Script {
        self.scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| Script::echo(&request.prompt))
    }
}

/// Decrements the live producer count when the producer task ends
struct ProducerGuard(Arc<AtomicUsize>);

impl Drop for ProducerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn play(
    script: Script,
    tx: mpsc::Sender<BackendFragment>,
    cancel: CancellationToken,
    gate: Arc<Semaphore>,
    ignore_cancel: bool,
) {
    for step in script.steps {
        if cancel.is_cancelled() && !ignore_cancel {
            return;
        }
        match step {
            ScriptStep::Token { sequence, text } => {
                if tx.send(BackendFragment::Token { sequence, text }).await.is_err() {
                    return;
                }
            }
            ScriptStep::Complete => {
                let _ = tx.send(BackendFragment::Complete).await;
                return;
            }
            ScriptStep::Fail(message) => {
                let _ = tx.send(BackendFragment::Error(message)).await;
                return;
            }
            ScriptStep::Hold => {
                if ignore_cancel {
                    if let Ok(permit) = gate.acquire().await {
                        permit.forget();
                    }
                } else {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return,
                        permit = gate.acquire() => match permit {
                            Ok(permit) => permit.forget(),
                            Err(_) => return,
                        },
                    }
                }
            }
            ScriptStep::Drop => return,
        }
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "Scripted"
    }

    async fn health_check(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }

    async fn open(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<BackendFragment>, BackendError> {
        self.requests.lock().push(request.clone());

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable(
                "scripted backend marked unavailable".to_string(),
            ));
        }

        let script = self.next_script(request);
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let gate = Arc::clone(&self.gate);
        let ignore_cancel = self.ignore_cancel.load(Ordering::SeqCst);

        self.live_producers.fetch_add(1, Ordering::SeqCst);
        let guard = ProducerGuard(Arc::clone(&self.live_producers));

        tokio::spawn(async move {
            let _guard = guard;
            play(script, tx, cancel, gate, ignore_cancel).await;
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(mut rx: mpsc::Receiver<BackendFragment>) -> Vec<BackendFragment> {
        let mut out = Vec::new();
        while let Some(fragment) = rx.recv().await {
            out.push(fragment);
        }
        out
    }

    #[test]
    fn test_script_numbering() {
        let script = Script::new().token("a").token_at(5, "b").token("c").complete();
        assert_eq!(
            script.steps(),
            &[
                ScriptStep::Token {
                    sequence: 0,
                    text: "a".into()
                },
                ScriptStep::Token {
                    sequence: 5,
                    text: "b".into()
                },
                ScriptStep::Token {
                    sequence: 6,
                    text: "c".into()
                },
                ScriptStep::Complete,
            ]
        );
    }

    #[tokio::test]
    async fn test_plays_queued_script() {
        let backend = ScriptedBackend::new();
        backend.push_script(Script::answer(["Hel", "lo"]));

        let rx = backend
            .open(&GenerationRequest::new("Hi", "m"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            collect(rx).await,
            vec![
                BackendFragment::Token {
                    sequence: 0,
                    text: "Hel".into()
                },
                BackendFragment::Token {
                    sequence: 1,
                    text: "lo".into()
                },
                BackendFragment::Complete,
            ]
        );
        assert_eq!(backend.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_echo_when_queue_empty() {
        let backend = ScriptedBackend::new();
        let rx = backend
            .open(
                &GenerationRequest::new("How are you", "m"),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let fragments = collect(rx).await;
        assert_eq!(fragments.len(), 4);
        assert_eq!(fragments.last(), Some(&BackendFragment::Complete));
    }

    #[tokio::test]
    async fn test_hold_stops_on_cancel() {
        let backend = ScriptedBackend::new();
        backend.push_script(Script::new().token("a").hold().token("b").complete());
        let cancel = CancellationToken::new();

        let mut rx = backend
            .open(&GenerationRequest::new("q", "m"), cancel.clone())
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(BackendFragment::Token { .. })));

        cancel.cancel();
        assert_eq!(rx.recv().await, None);
        assert_eq!(backend.live_producers(), 0);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let backend = ScriptedBackend::new();
        backend.set_unavailable(true);
        assert!(!backend.health_check().await);
        let result = backend
            .open(&GenerationRequest::new("q", "m"), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(BackendError::Unavailable(_))));
    }
}
