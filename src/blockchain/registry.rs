use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::AppError;

use super::traits::NamedProvider;

/// One provider's failure inside a fallback chain
#[derive(Debug, Clone)]
pub struct ProviderFailure {
    pub provider: String,
    pub error: AppError,
}

/// Accumulated failures of every provider tried for one operation
#[derive(Debug, Clone)]
pub struct ProviderFailures {
    pub operation: &'static str,
    pub failures: Vec<ProviderFailure>,
}

impl ProviderFailures {
    /// Full summary including provider names, for logs
    pub fn summary(&self) -> String {
        if self.failures.is_empty() {
            return format!("{}: no providers configured", self.operation);
        }
        let parts: Vec<String> = self
            .failures
            .iter()
            .map(|f| format!("{}: {}", f.provider, f.error))
            .collect();
        format!("{} failed on all providers [{}]", self.operation, parts.join("; "))
    }

    /// Error messages only, safe to hand back to callers
    pub fn messages(&self) -> Vec<String> {
        self.failures
            .iter()
            .map(|f| f.error.message().to_string())
            .collect()
    }
}

/// Ordered providers of one capability, tried in sequence
pub struct ProviderChain<P: ?Sized> {
    providers: Vec<Arc<P>>,
    timeout: Duration,
}

impl<P: ?Sized + NamedProvider> ProviderChain<P> {
    pub fn new(timeout: Duration) -> Self {
        Self {
            providers: Vec::new(),
            timeout,
        }
    }

    /// Append a provider to the end of the chain
    pub fn register(&mut self, provider: Arc<P>) {
        tracing::info!("Registering provider: {}", provider.name());
        self.providers.push(provider);
    }

    pub fn with(mut self, provider: Arc<P>) -> Self {
        self.register(provider);
        self
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    /// Run `op` against each provider until one succeeds. Each attempt is
    /// bounded by the chain timeout; an elapsed timeout counts as a failure.
    pub async fn call<T, F, Fut>(&self, operation: &'static str, op: F) -> Result<T, ProviderFailures>
    where
        F: Fn(Arc<P>) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let mut failures = Vec::new();

        for provider in &self.providers {
            let name = provider.name().to_string();
            let outcome = tokio::time::timeout(self.timeout, op(Arc::clone(provider))).await;

            match outcome {
                Ok(Ok(value)) => {
                    if !failures.is_empty() {
                        tracing::info!(
                            "{} succeeded on {} after {} failed provider(s)",
                            operation,
                            name,
                            failures.len()
                        );
                    }
                    return Ok(value);
                }
                Ok(Err(error)) => {
                    tracing::warn!("{} failed on {}: {}", operation, name, error);
                    failures.push(ProviderFailure { provider: name, error });
                }
                Err(_) => {
                    tracing::warn!(
                        "{} timed out on {} after {:?}",
                        operation,
                        name,
                        self.timeout
                    );
                    failures.push(ProviderFailure {
                        provider: name,
                        error: AppError::BlockchainError(format!(
                            "timed out after {}s",
                            self.timeout.as_secs_f32()
                        )),
                    });
                }
            }
        }

        Err(ProviderFailures {
            operation,
            failures,
        })
    }
}
