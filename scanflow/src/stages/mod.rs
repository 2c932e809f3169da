//! Stage trait and implementations.
//!
//! A pipeline is an ordered list of stages. Each stage may name the providers
//! it can run against, in preference order; the coordinator picks one per
//! attempt based on remaining quota.

mod context;
mod ports;

pub use context::StageContext;
pub use ports::{Provider, ProviderHandle, ProviderRegistry};

use crate::core::StageOutput;
use crate::errors::StageError;
use async_trait::async_trait;
use std::fmt::Debug;
use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

/// Trait for pipeline stages.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Returns the name of the stage.
    fn name(&self) -> &str;

    /// Candidate providers, most preferred first. Empty for stages that do
    /// not call out to a provider.
    fn requires_providers(&self) -> &[String] {
        &[]
    }

    /// Whether a failure of this stage stops the rest of the run.
    fn abort_pipeline_on_failure(&self) -> bool {
        false
    }

    /// Mandatory stages fail when no provider is available; optional ones
    /// are skipped.
    fn is_mandatory(&self) -> bool {
        true
    }

    /// Per-stage timeout overriding the coordinator default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Executes the stage.
    ///
    /// `provider` is set for provider-dependent stages and names the
    /// provider selected for this attempt.
    async fn execute(
        &self,
        ctx: &StageContext,
        provider: Option<&ProviderHandle>,
    ) -> Result<StageOutput, StageError>;
}

/// A stage backed by an async closure.
pub struct FnStage<F, Fut>
where
    F: Fn(StageContext, Option<ProviderHandle>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StageOutput, StageError>> + Send,
{
    name: String,
    providers: Vec<String>,
    abort_on_failure: bool,
    mandatory: bool,
    timeout: Option<Duration>,
    func: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnStage<F, Fut>
where
    F: Fn(StageContext, Option<ProviderHandle>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StageOutput, StageError>> + Send,
{
    /// Creates a mandatory stage with no providers.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            providers: Vec::new(),
            abort_on_failure: false,
            mandatory: true,
            timeout: None,
            func,
            _phantom: PhantomData,
        }
    }

    /// Sets the candidate providers, most preferred first.
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
}

impl<F, Fut> Debug for FnStage<F, Fut>
where
    F: Fn(StageContext, Option<ProviderHandle>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StageOutput, StageError>> + Send,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage")
            .field("name", &self.name)
            .field("providers", &self.providers)
            .field("abort_on_failure", &self.abort_on_failure)
            .field("mandatory", &self.mandatory)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> Stage for FnStage<F, Fut>
where
    F: Fn(StageContext, Option<ProviderHandle>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StageOutput, StageError>> + Send,
{
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
        (self.func)(ctx.clone(), provider.cloned()).await
    }
}
