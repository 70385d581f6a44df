// Scripted analysis backend for tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::services::providers::ProviderError;

use super::backend::{AnalysisBackend, AnalysisRequest};

#[derive(Debug, Clone)]
enum Outcome {
    Reply(String),
    Api(u16, String),
    Overflow(String),
    MissingContent,
    Panic,
}

#[derive(Debug, Clone)]
pub struct Step {
    delay: Duration,
    outcome: Outcome,
}

impl Step {
    pub fn reply(text: impl Into<String>) -> Self {
        Self { delay: Duration::ZERO, outcome: Outcome::Reply(text.into()) }
    }

    pub fn fail(error: ProviderError) -> Self {
        let outcome = match error {
            ProviderError::ContextOverflow(m) => Outcome::Overflow(m),
            ProviderError::MissingContent => Outcome::MissingContent,
            ProviderError::ApiError { status, message } => Outcome::Api(status, message),
            other => Outcome::Api(500, other.to_string()),
        };
        Self { delay: Duration::ZERO, outcome }
    }

    pub fn panic() -> Self {
        Self { delay: Duration::ZERO, outcome: Outcome::Panic }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Counts a call as in flight until dropped, including when a timeout or
/// task abort drops the call future mid-sleep.
struct InFlight<'a> {
    counter: &'a AtomicUsize,
    now: usize,
}

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        Self { counter, now }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Key: (depth, chunk_index); final-answer requests use `None`.
type ScriptKey = Option<(usize, usize)>;

#[derive(Default)]
pub struct ScriptedBackend {
    scripts: Mutex<HashMap<ScriptKey, Vec<Step>>>,
    calls: Mutex<HashMap<ScriptKey, usize>>,
    requests: Mutex<Vec<AnalysisRequest>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    cancel_at: Mutex<Option<(usize, CancellationToken)>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Steps for a top-level chunk; the last step repeats once exhausted.
    pub fn script(&self, chunk_index: usize, steps: Vec<Step>) {
        self.script_at(0, chunk_index, steps);
    }

    pub fn script_at(&self, depth: usize, chunk_index: usize, steps: Vec<Step>) {
        self.scripts.lock().unwrap().insert(Some((depth, chunk_index)), steps);
    }

    pub fn script_answer(&self, steps: Vec<Step>) {
        self.scripts.lock().unwrap().insert(None, steps);
    }

    /// Cancel `token` when the `n`-th call (1-based, any key) starts.
    pub fn cancel_on_call(&self, n: usize, token: CancellationToken) {
        *self.cancel_at.lock().unwrap() = Some((n, token));
    }

    pub fn calls_for(&self, chunk_index: usize) -> usize {
        self.calls_at(0, chunk_index)
    }

    pub fn calls_at(&self, depth: usize, chunk_index: usize) -> usize {
        self.calls.lock().unwrap().get(&Some((depth, chunk_index))).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<AnalysisRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn next_step(&self, key: ScriptKey) -> Step {
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(key).or_insert(0);
            *n += 1;
            *n
        };
        let scripts = self.scripts.lock().unwrap();
        match scripts.get(&key) {
            Some(steps) if !steps.is_empty() => steps[(attempt - 1).min(steps.len() - 1)].clone(),
            // Defaults stay under the dedup length floor so they never merge.
            _ => match key {
                Some((0, index)) => Step::reply(format!("{{\"summary\": \"Chunk {} ok.\"}}", index)),
                Some((_, index)) => Step::reply(format!("{{\"summary\": \"Part {} ok.\"}}", index)),
                None => Step::reply("Final answer."),
            },
        }
    }
}

#[async_trait]
impl AnalysisBackend for ScriptedBackend {
    async fn perform_analysis(&self, request: &AnalysisRequest) -> Result<String, ProviderError> {
        let key = request
            .positional_context
            .as_ref()
            .map(|ctx| (ctx.depth, ctx.chunk_index));

        let call_number = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len()
        };
        if let Some((n, token)) = self.cancel_at.lock().unwrap().as_ref() {
            if *n == call_number {
                token.cancel();
            }
        }

        let step = self.next_step(key);

        let guard = InFlight::enter(&self.in_flight);
        self.peak_in_flight.fetch_max(guard.now, Ordering::SeqCst);
        if !step.delay.is_zero() {
            tokio::time::sleep(step.delay).await;
        } else {
            tokio::task::yield_now().await;
        }
        drop(guard);

        match step.outcome {
            Outcome::Reply(text) => Ok(text),
            Outcome::Api(status, message) => Err(ProviderError::ApiError { status, message }),
            Outcome::Overflow(message) => Err(ProviderError::ContextOverflow(message)),
            Outcome::MissingContent => Err(ProviderError::MissingContent),
            Outcome::Panic => panic!("scripted backend panic"),
        }
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}
