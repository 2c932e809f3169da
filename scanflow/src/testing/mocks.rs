//! Mock stages and providers for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

use crate::core::StageOutput;
use crate::errors::{ProviderError, StageError};
use crate::stages::{Provider, ProviderHandle, Stage, StageContext};

/// A stage with scripted outcomes that records every call.
///
/// Clones share the call log, so a test can keep one clone for assertions
/// and hand the other to the coordinator.
#[derive(Debug, Clone)]
pub struct ScriptedStage {
    name: String,
    providers: Vec<String>,
    abort_on_failure: bool,
    mandatory: bool,
    timeout: Option<Duration>,
    output: Option<Value>,
    failure: Option<StageError>,
    provider_failures: HashMap<String, ProviderError>,
    panics: bool,
    calls: Arc<Mutex<Vec<Option<String>>>>,
}

impl ScriptedStage {
    /// Creates a mandatory stage that succeeds.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            providers: Vec::new(),
            abort_on_failure: false,
            mandatory: true,
            timeout: None,
            output: None,
            failure: None,
            provider_failures: HashMap::new(),
            panics: false,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Sets the candidate providers.
    #[must_use]
    pub fn requires<I, S>(mut self, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.providers = providers.into_iter().map(Into::into).collect();
        self
    }

    /// Sets whether a failure aborts the run.
    #[must_use]
    pub fn abort_on_failure(mut self, abort: bool) -> Self {
        self.abort_on_failure = abort;
        self
    }

    /// Marks the stage optional.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.mandatory = false;
        self
    }

    /// Sets a per-stage timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Returns `data` on success instead of the default payload.
    #[must_use]
    pub fn succeed_with(mut self, data: Value) -> Self {
        self.output = Some(data);
        self
    }

    /// Fails every call with `error`.
    #[must_use]
    pub fn fail_with(mut self, error: StageError) -> Self {
        self.failure = Some(error);
        self
    }

    /// Fails calls made against `provider` with `error`.
    #[must_use]
    pub fn fail_with_provider(mut self, provider: impl Into<String>, error: ProviderError) -> Self {
        self.provider_failures.insert(provider.into(), error);
        self
    }

    /// Panics on every call.
    #[must_use]
    pub fn panics(mut self) -> Self {
        self.panics = true;
        self
    }

    /// Number of calls so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Provider passed to each call, in call order.
    #[must_use]
    pub fn providers_seen(&self) -> Vec<Option<String>> {
        self.calls.lock().clone()
    }

    /// Wraps the stage for a pipeline.
    #[must_use]
    pub fn into_arc(self) -> Arc<dyn Stage> {
        Arc::new(self)
    }
}

#[async_trait]
impl Stage for ScriptedStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn requires_providers(&self) -> &[String] {
        &self.providers
    }

    fn abort_pipeline_on_failure(&self) -> bool {
        self.abort_on_failure
    }

    fn is_mandatory(&self) -> bool {
        self.mandatory
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn execute(
        &self,
        ctx: &StageContext,
        provider: Option<&ProviderHandle>,
    ) -> Result<StageOutput, StageError> {
        self.calls.lock().push(provider.map(|p| p.name().to_string()));
        assert!(!self.panics, "scripted panic in stage '{}'", self.name);

        if let Some(handle) = provider {
            handle.record_call()?;
            if let Some(err) = self.provider_failures.get(handle.name()) {
                return Err(err.clone().into());
            }
        }
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        let data = self.output.clone().unwrap_or_else(|| {
            json!({
                "stage": self.name,
                "run_key": ctx.run_key().as_str(),
            })
        });
        Ok(StageOutput::new(data))
    }
}

#[derive(Debug)]
struct Gate {
    open: Semaphore,
    started: AtomicUsize,
    started_notify: Notify,
}

/// A stage that stays open until released or cancelled.
///
/// Clones share the gate.
#[derive(Debug, Clone)]
pub struct BlockingStage {
    name: String,
    providers: Vec<String>,
    timeout: Option<Duration>,
    ignore_cancellation: bool,
    gate: Arc<Gate>,
}

impl BlockingStage {
    /// Creates a closed stage.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            providers: Vec::new(),
            timeout: None,
            ignore_cancellation: false,
            gate: Arc::new(Gate {
                open: Semaphore::new(0),
                started: AtomicUsize::new(0),
                started_notify: Notify::new(),
            }),
        }
    }

    /// Sets the candidate providers.
    #[must_use]
    pub fn requires<I, S>(mut self, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.providers = providers.into_iter().map(Into::into).collect();
        self
    }

    /// Sets a per-stage timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Keeps the stage blocked even after cancellation.
    #[must_use]
    pub fn ignoring_cancellation(mut self) -> Self {
        self.ignore_cancellation = true;
        self
    }

    /// Lets every current and future call finish.
    pub fn release(&self) {
        self.gate.open.close();
    }

    /// Number of calls that started.
    #[must_use]
    pub fn started(&self) -> usize {
        self.gate.started.load(Ordering::SeqCst)
    }

    /// Waits until at least one call started. False on timeout.
    pub async fn wait_started(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.gate.started_notify.notified();
                if self.started() > 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }

    /// Wraps the stage for a pipeline.
    #[must_use]
    pub fn into_arc(self) -> Arc<dyn Stage> {
        Arc::new(self)
    }
}

#[async_trait]
impl Stage for BlockingStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn requires_providers(&self) -> &[String] {
        &self.providers
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn execute(
        &self,
        ctx: &StageContext,
        _provider: Option<&ProviderHandle>,
    ) -> Result<StageOutput, StageError> {
        self.gate.started.fetch_add(1, Ordering::SeqCst);
        self.gate.started_notify.notify_waiters();

        // The gate never hands out permits; it only opens by closing.
        if self.ignore_cancellation {
            let _ = self.gate.open.acquire().await;
            return Ok(StageOutput::new(json!({ "released": true })));
        }
        tokio::select! {
            _ = self.gate.open.acquire() => Ok(StageOutput::new(json!({ "released": true }))),
            () = ctx.cancelled() => Err(StageError::Cancelled),
        }
    }
}

/// A provider that returns a fixed response.
#[derive(Debug)]
pub struct StaticProvider {
    name: String,
    response: Mutex<Result<Value, ProviderError>>,
    calls: AtomicUsize,
}

impl StaticProvider {
    /// Creates a provider that always answers `response`.
    #[must_use]
    pub fn new(name: impl Into<String>, response: Value) -> Self {
        Self {
            name: name.into(),
            response: Mutex::new(Ok(response)),
            calls: AtomicUsize::new(0),
        }
    }

    /// Creates a provider that always fails with `error`.
    #[must_use]
    pub fn failing(name: impl Into<String>, error: ProviderError) -> Self {
        Self {
            name: name.into(),
            response: Mutex::new(Err(error)),
            calls: AtomicUsize::new(0),
        }
    }

    /// Replaces the response.
    pub fn set_response(&self, response: Result<Value, ProviderError>) {
        *self.response.lock() = response;
    }

    /// Number of calls so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for StaticProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, _request: Value) -> Result<Value, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.response.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationToken;
    use crate::core::RunKey;

    fn ctx(token: Arc<CancellationToken>) -> StageContext {
        StageContext::new(RunKey::new("r"), "stage", 0, token, Vec::new())
    }

    #[tokio::test]
    async fn test_scripted_stage_records_calls() {
        let stage = ScriptedStage::new("Fetch").fail_with(StageError::failed("nope"));
        let shared = stage.clone();

        let err = stage.execute(&ctx(Arc::new(CancellationToken::new())), None).await.unwrap_err();
        assert_eq!(err, StageError::failed("nope"));
        assert_eq!(shared.call_count(), 1);
        assert_eq!(shared.providers_seen(), vec![None]);
    }

    #[tokio::test]
    async fn test_blocking_stage_release() {
        let stage = BlockingStage::new("Hold");
        let handle = {
            let stage = stage.clone();
            tokio::spawn(async move { stage.execute(&ctx(Arc::new(CancellationToken::new())), None).await })
        };
        assert!(stage.wait_started(Duration::from_secs(1)).await);
        stage.release();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_blocking_stage_observes_cancellation() {
        let token = Arc::new(CancellationToken::new());
        let stage = BlockingStage::new("Hold");
        let handle = {
            let stage = stage.clone();
            let ctx = ctx(Arc::clone(&token));
            tokio::spawn(async move { stage.execute(&ctx, None).await })
        };
        assert!(stage.wait_started(Duration::from_secs(1)).await);
        token.cancel("stop");
        assert_eq!(handle.await.unwrap().unwrap_err(), StageError::Cancelled);
    }

    #[tokio::test]
    async fn test_static_provider() {
        let provider = StaticProvider::new("p", json!(1));
        assert_eq!(provider.invoke(Value::Null).await.unwrap(), json!(1));
        provider.set_response(Err(ProviderError::transient("down")));
        assert!(provider.invoke(Value::Null).await.unwrap_err().is_transient());
        assert_eq!(provider.call_count(), 2);
    }
}
