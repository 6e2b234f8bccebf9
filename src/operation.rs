//! The opaque unit of work driven by the retry executor and the orchestrator
//!
//! An [`Operation`] wraps one remote call: it takes an input descriptor and
//! returns either a payload or a classified [`OperationError`]. Request
//! construction, auth and response parsing all live behind this trait.
//!
//! Adapters are provided for plain async closures ([`operation_fn`]) and for
//! any cloneable `tower::Service` ([`ServiceOperation`]), so existing tower
//! stacks (timeouts, auth layers, HTTP clients) plug in unchanged.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tower::{Service, ServiceExt};

use crate::config::RetryConfig;
use crate::error::{ErrorClass, OperationError};

/// A single retryable remote call.
#[async_trait]
pub trait Operation: Send + Sync {
    type Input: Send + Sync;
    type Output: Send;

    async fn invoke(&self, input: &Self::Input) -> Result<Self::Output, OperationError>;
}

#[async_trait]
impl<O> Operation for Arc<O>
where
    O: Operation + ?Sized,
{
    type Input = O::Input;
    type Output = O::Output;

    async fn invoke(&self, input: &Self::Input) -> Result<Self::Output, OperationError> {
        (**self).invoke(input).await
    }
}

/// Operation backed by an async closure; see [`operation_fn`].
pub struct OperationFn<F, I> {
    f: F,
    _input: PhantomData<fn(I)>,
}

impl<F: Clone, I> Clone for OperationFn<F, I> {
    fn clone(&self) -> Self {
        Self {
            f: self.f.clone(),
            _input: PhantomData,
        }
    }
}

impl<F, I> fmt::Debug for OperationFn<F, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationFn").finish_non_exhaustive()
    }
}

/// Build an [`Operation`] from a closure taking an owned copy of the input.
pub fn operation_fn<F, I, T, Fut>(f: F) -> OperationFn<F, I>
where
    F: Fn(I) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, OperationError>> + Send,
    I: Clone + Send + Sync,
    T: Send,
{
    OperationFn {
        f,
        _input: PhantomData,
    }
}

#[async_trait]
impl<F, I, T, Fut> Operation for OperationFn<F, I>
where
    F: Fn(I) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, OperationError>> + Send,
    I: Clone + Send + Sync,
    T: Send,
{
    type Input = I;
    type Output = T;

    async fn invoke(&self, input: &I) -> Result<T, OperationError> {
        (self.f)(input.clone()).await
    }
}

/// Adapts a cloneable tower service into an [`Operation`].
///
/// Each invocation drives a fresh clone through `ready().call()`, so the
/// service can be shared by every batch worker.
#[derive(Debug, Clone)]
pub struct ServiceOperation<S, I> {
    inner: S,
    _input: PhantomData<fn(I)>,
}

impl<S, I> ServiceOperation<S, I> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            _input: PhantomData,
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S, I> Operation for ServiceOperation<S, I>
where
    S: Service<I, Error = OperationError> + Clone + Send + Sync + 'static,
    S::Response: Send,
    S::Future: Send,
    I: Clone + Send + Sync,
{
    type Input = I;
    type Output = S::Response;

    async fn invoke(&self, input: &I) -> Result<S::Response, OperationError> {
        let mut svc = self.inner.clone();
        svc.ready().await?.call(input.clone()).await
    }
}

/// Classified result of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Success(T),
    RetryableFailure(OperationError),
    FatalFailure(OperationError),
}

impl<T> Outcome<T> {
    pub fn classify(result: Result<T, OperationError>, config: &RetryConfig) -> Self {
        match result {
            Ok(value) => Outcome::Success(value),
            Err(err) => match err.classify(config) {
                ErrorClass::Retryable => Outcome::RetryableFailure(err),
                ErrorClass::Fatal => Outcome::FatalFailure(err),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn error(&self) -> Option<&OperationError> {
        match self {
            Outcome::Success(_) => None,
            Outcome::RetryableFailure(e) | Outcome::FatalFailure(e) => Some(e),
        }
    }

    pub fn into_result(self) -> Result<T, OperationError> {
        match self {
            Outcome::Success(value) => Ok(value),
            Outcome::RetryableFailure(e) | Outcome::FatalFailure(e) => Err(e),
        }
    }
}
