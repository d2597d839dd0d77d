//! Provider and embeddings doubles for unit tests in this and dependent
//! crates.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use callsheet_core::error::{Error, Result};
use callsheet_core::message::{TokenUsage, ToolCall};

use crate::embeddings::{Embeddings, EMBEDDING_DIMENSIONS};
use crate::{
    ChatProvider, ChatResponse, CompletionRequest, DeltaStream, StreamDelta, StreamFinal,
};

enum Scripted {
    Ok {
        content: String,
        tool_calls: Vec<ToolCall>,
    },
    Err(fn() -> Error),
}

/// Scripted [`ChatProvider`]. Responses are consumed in order; running out
/// of script is a test bug and fails loudly.
pub struct FakeChatProvider {
    name: String,
    script: Mutex<VecDeque<Scripted>>,
    calls: AtomicUsize,
    delta_delay: Mutex<Duration>,
    completion_delay: Mutex<Duration>,
    healthy: std::sync::atomic::AtomicBool,
}

impl FakeChatProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            delta_delay: Mutex::new(Duration::ZERO),
            completion_delay: Mutex::new(Duration::ZERO),
            healthy: std::sync::atomic::AtomicBool::new(true),
        }
    }

    pub fn respond(&self, content: impl Into<String>) -> &Self {
        self.script.lock().push_back(Scripted::Ok {
            content: content.into(),
            tool_calls: Vec::new(),
        });
        self
    }

    pub fn respond_with_tool_calls(&self, content: impl Into<String>, calls: Vec<ToolCall>) -> &Self {
        self.script.lock().push_back(Scripted::Ok {
            content: content.into(),
            tool_calls: calls,
        });
        self
    }

    /// Queue a failure produced by `make` (a fn pointer keeps the double
    /// trivially `Sync`).
    pub fn fail(&self, make: fn() -> Error) -> &Self {
        self.script.lock().push_back(Scripted::Err(make));
        self
    }

    /// Slow the delta stream down, for cancellation tests.
    pub fn with_delta_delay(&self, delay: Duration) -> &Self {
        *self.delta_delay.lock() = delay;
        self
    }

    /// Slow non-streaming completions down, for busy/cancel tests.
    pub fn with_completion_delay(&self, delay: Duration) -> &Self {
        *self.completion_delay.lock() = delay;
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_scripted(&self) -> Result<(String, Vec<ToolCall>)> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().pop_front() {
            Some(Scripted::Ok { content, tool_calls }) => Ok((content, tool_calls)),
            Some(Scripted::Err(make)) => Err(make()),
            None => Err(Error::internal(format!(
                "FakeChatProvider {}: script exhausted",
                self.name
            ))),
        }
    }
}

fn fake_usage(content: &str) -> TokenUsage {
    let completion = content.split_whitespace().count() as u32;
    TokenUsage {
        prompt_tokens: 20,
        completion_tokens: completion,
        total_tokens: 20 + completion,
    }
}

#[async_trait]
impl ChatProvider for FakeChatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<ChatResponse> {
        let delay = *self.completion_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let (content, tool_calls) = self.next_scripted()?;
        Ok(ChatResponse {
            usage: fake_usage(&content),
            content,
            tool_calls,
            model: request.model.clone(),
            provider: self.name.clone(),
            finish_reason: Some("stop".to_string()),
        })
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<DeltaStream> {
        let (content, tool_calls) = self.next_scripted()?;
        let usage = fake_usage(&content);
        let provider = self.name.clone();
        let model = request.model.clone();
        let delay = *self.delta_delay.lock();

        let words: Vec<String> = content
            .split_inclusive(' ')
            .map(|w| w.to_string())
            .collect();
        let stream = async_stream::stream! {
            for word in words {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(StreamDelta::Content(word));
            }
            for call in tool_calls {
                yield Ok(StreamDelta::ToolCall(call));
            }
            yield Ok(StreamDelta::Final(StreamFinal {
                usage,
                cost_estimate: crate::usage::estimate_cost(&model, &usage),
                provider,
                model,
            }));
        };
        Ok(Box::pin(stream))
    }

    async fn health(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

/// Deterministic embeddings: unit-norm vectors derived from a content hash,
/// with per-text overrides for similarity-controlled tests.
#[derive(Default)]
pub struct FakeEmbeddings {
    overrides: Mutex<HashMap<String, Vec<f32>>>,
}

impl FakeEmbeddings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the vector returned for an exact text.
    pub fn set(&self, text: impl Into<String>, vector: Vec<f32>) {
        self.overrides.lock().insert(text.into(), vector);
    }

    fn derive(text: &str) -> Vec<f32> {
        // FNV-ish rolling hash drives a cheap LCG; stable across runs
        let mut state: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in text.bytes() {
            state ^= u64::from(byte);
            state = state.wrapping_mul(0x1000_0000_01b3);
        }
        let mut vector = Vec::with_capacity(EMBEDDING_DIMENSIONS);
        for _ in 0..EMBEDDING_DIMENSIONS {
            state = state.wrapping_mul(636_413_622_384_679_3005).wrapping_add(1);
            let unit = ((state >> 33) as f32) / ((1u64 << 31) as f32) - 1.0;
            vector.push(unit);
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt().max(1e-12);
        vector.iter_mut().for_each(|v| *v /= norm);
        vector
    }
}

#[async_trait]
impl Embeddings for FakeEmbeddings {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let overrides = self.overrides.lock();
        Ok(texts
            .iter()
            .map(|text| {
                overrides
                    .get(text)
                    .cloned()
                    .unwrap_or_else(|| Self::derive(text))
            })
            .collect())
    }
}
