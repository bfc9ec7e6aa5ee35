use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::error::StepError;

/// Default bound on a single external call made by a cascade step.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

pub type StepFuture<'a, O> = Pin<Box<dyn Future<Output = Result<O, StepError>> + Send + 'a>>;

/// A single fallible strategy in a cascade.
///
/// A step either produces a value or reports that its dependency is
/// unavailable, in which case the cascade moves on to the next step.
pub trait CascadeStep<I, O>: Send + Sync {
    /// The display name of this step (for logging and outcome reporting).
    fn name(&self) -> &str;

    fn attempt<'a>(&'a self, input: &'a I) -> StepFuture<'a, O>;
}

/// The terminal strategy of a cascade. It has no failure path.
pub trait FallbackStep<I, O>: Send + Sync {
    fn name(&self) -> &str;

    fn produce(&self, input: &I) -> O;
}

/// The value a cascade produced and which step produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeOutcome<O> {
    pub value: O,
    pub step: String,
    /// Steps that were attempted and failed before `step` succeeded.
    pub skipped: Vec<String>,
}

impl<O> CascadeOutcome<O> {
    pub fn into_value(self) -> O {
        self.value
    }
}

/// An ordered list of fallible steps followed by an infallible fallback.
///
/// Steps run in insertion order; the first success wins. Each attempt is
/// bounded by the step timeout, and an elapsed timeout counts as a failed
/// step. The fallback runs only when every step has failed.
pub struct Cascade<I, O> {
    label: &'static str,
    steps: Vec<Box<dyn CascadeStep<I, O>>>,
    fallback: Box<dyn FallbackStep<I, O>>,
    step_timeout: Duration,
}

impl<I, O> Cascade<I, O>
where
    I: Sync,
    O: Send,
{
    pub fn new(label: &'static str, fallback: impl FallbackStep<I, O> + 'static) -> Self {
        Self {
            label,
            steps: Vec::new(),
            fallback: Box::new(fallback),
            step_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }

    /// Append a step. Steps are tried in the order they were added.
    pub fn with_step(mut self, step: impl CascadeStep<I, O> + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn with_timeout(mut self, step_timeout: Duration) -> Self {
        self.step_timeout = step_timeout;
        self
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Names of the configured steps in order, fallback last.
    pub fn step_names(&self) -> Vec<&str> {
        self.steps
            .iter()
            .map(|s| s.name())
            .chain(std::iter::once(self.fallback.name()))
            .collect()
    }

    pub async fn run(&self, input: &I) -> CascadeOutcome<O> {
        let mut skipped = Vec::new();

        for step in &self.steps {
            tracing::debug!(cascade = self.label, step = step.name(), "Attempting step");

            let result = match tokio::time::timeout(self.step_timeout, step.attempt(input)).await {
                Ok(result) => result,
                Err(_) => Err(StepError::TimedOut(self.step_timeout)),
            };

            match result {
                Ok(value) => {
                    tracing::info!(cascade = self.label, step = step.name(), "Step succeeded");
                    return CascadeOutcome {
                        value,
                        step: step.name().to_string(),
                        skipped,
                    };
                }
                Err(e) => {
                    tracing::warn!(
                        cascade = self.label,
                        step = step.name(),
                        error = %e,
                        "Step failed, falling through"
                    );
                    skipped.push(step.name().to_string());
                }
            }
        }

        tracing::debug!(
            cascade = self.label,
            step = self.fallback.name(),
            "Using fallback step"
        );
        CascadeOutcome {
            value: self.fallback.produce(input),
            step: self.fallback.name().to_string(),
            skipped,
        }
    }
}
