//! Admission middleware and the guarded upstream call path.
//!
//! Two pieces compose here:
//!
//! - [`AdmissionLayer`] / [`AdmissionService`]: tower middleware that runs in
//!   front of a service. It derives the caller's identity, asks the
//!   [`TieredRateLimiter`] for a decision, and either forwards the request or
//!   rejects it with [`GateError::RateLimited`] before any upstream work
//!   happens.
//! - [`UpstreamGate`]: wraps the actual upstream call with the circuit breaker
//!   and retry policy. The breaker is consulted before the retry budget is
//!   touched, and exactly one terminal outcome per call feeds back into it;
//!   individual retry attempts do not count as separate failures.

use crate::circuit_breaker::CircuitBreaker;
use crate::error::GateError;
use crate::rate_limit::{
    Decision, Identity, IdentityExtractor, IdentitySource, TieredRateLimiter, TokenStore,
};
use crate::retry::RetryPolicy;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower_layer::Layer;
use tower_service::Service;

/// What the admission middleware needs from a request type.
pub trait AdmissionRequest {
    /// Path used for bucket keying and route overrides.
    fn route(&self) -> &str;

    /// The credential carried in the given source, if any.
    fn credential(&self, source: IdentitySource) -> Option<String>;

    /// Called with the decision's rate-limit info before the request is
    /// forwarded, so responses can carry `X-RateLimit-*` headers.
    fn on_admitted(&mut self, remaining: u32, reset_after: Duration) {
        let _ = (remaining, reset_after);
    }
}

/// Layer that wraps a service with admission control.
pub struct AdmissionLayer<S> {
    limiter: Arc<TieredRateLimiter<S>>,
    extractor: IdentityExtractor,
}

impl<S> AdmissionLayer<S> {
    pub fn new(limiter: Arc<TieredRateLimiter<S>>, extractor: IdentityExtractor) -> Self {
        Self { limiter, extractor }
    }
}

impl<S> Clone for AdmissionLayer<S> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone(), extractor: self.extractor.clone() }
    }
}

impl<Svc, S> Layer<Svc> for AdmissionLayer<S> {
    type Service = AdmissionService<Svc, S>;

    fn layer(&self, service: Svc) -> Self::Service {
        AdmissionService {
            inner: service,
            limiter: self.limiter.clone(),
            extractor: self.extractor.clone(),
        }
    }
}

/// Middleware service enforcing the rate-limit decision.
pub struct AdmissionService<Svc, S> {
    inner: Svc,
    limiter: Arc<TieredRateLimiter<S>>,
    extractor: IdentityExtractor,
}

impl<Svc: Clone, S> Clone for AdmissionService<Svc, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            extractor: self.extractor.clone(),
        }
    }
}

impl<Svc, S, Req> Service<Req> for AdmissionService<Svc, S>
where
    Svc: Service<Req> + Clone + Send + 'static,
    Svc::Future: Send + 'static,
    Svc::Error: Send + Sync + std::error::Error + 'static,
    S: TokenStore + 'static,
    Req: AdmissionRequest + Send + 'static,
{
    type Response = Svc::Response;
    type Error = GateError<Svc::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GateError::Inner)
    }

    fn call(&mut self, mut req: Req) -> Self::Future {
        let limiter = self.limiter.clone();
        let mut inner = self.inner.clone();
        let identity = self
            .extractor
            .extract(|source| req.credential(source))
            .unwrap_or_else(Identity::anonymous);

        Box::pin(async move {
            match limiter.admit(&identity, req.route()).await {
                Decision::Allowed { remaining, reset_after, .. } => {
                    req.on_admitted(remaining, reset_after);
                    inner.call(req).await.map_err(GateError::Inner)
                }
                Decision::Denied { retry_after, limit } => {
                    Err(GateError::RateLimited { retry_after, limit, remaining: 0 })
                }
            }
        })
    }
}

/// Breaker- and retry-guarded path to the upstream.
#[derive(Clone)]
pub struct UpstreamGate<E> {
    breaker: CircuitBreaker,
    retry: RetryPolicy<E>,
}

impl<E> UpstreamGate<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new(breaker: CircuitBreaker, retry: RetryPolicy<E>) -> Self {
        Self { breaker, retry }
    }

    /// The breaker, for metrics surfaces.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run an upstream operation through the breaker and the retry policy.
    ///
    /// An open breaker fast-fails without invoking the operation or spending
    /// any retry budget. Otherwise the retry policy runs to a terminal
    /// outcome, and that single outcome is recorded on the breaker.
    pub async fn call<T, Fut, Op>(&self, operation: Op) -> Result<T, GateError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        if self.breaker.is_open() {
            return Err(GateError::CircuitOpen {
                failure_count: self.breaker.failure_count(),
                open_for: self.breaker.open_for(),
            });
        }

        match self.retry.execute(operation).await {
            Ok(value) => {
                self.breaker.record_success();
                Ok(value)
            }
            Err(error) => {
                self.breaker.record_failure();
                Err(error)
            }
        }
    }
}
