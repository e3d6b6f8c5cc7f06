//! The pending result of a remote call.
//!
//! Every request sent on a connection gets a call state that is completed exactly once, when the
//! matching response arrives. [`RpcFuture`] is the typed handle given to the caller: it can be
//! awaited, waited on with a timeout, blocked on from synchronous code, or given callbacks that
//! run on the client's callback pool once the response is in.
//!
//! Timing out a wait never completes the call. A late response still completes it, and any
//! callbacks registered by then still run.

use std::{
    fmt,
    future::IntoFuture,
    marker::PhantomData,
    sync::{Arc, Condvar, Mutex, OnceLock, PoisonError},
    time::{Duration, Instant},
};

use futures::future::BoxFuture;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use crate::{
    codec::{Decode, NIL},
    error::RpcError,
    pool::WorkerPool,
    wire::{Request, RequestId, Response},
};

/// Calls taking longer than this are logged as slow when they complete.
pub const SLOW_CALL_THRESHOLD: Duration = Duration::from_millis(5000);

type Callback = Box<dyn FnOnce(&Response) + Send>;

pub(crate) struct CallState {
    request_id: RequestId,
    service: String,
    method: String,
    started_at: Instant,
    response: OnceLock<Response>,
    callbacks: Mutex<Vec<Callback>>,
    notify: Notify,
    done: Mutex<bool>,
    done_cond: Condvar,
    callback_pool: WorkerPool,
}

impl CallState {
    pub(crate) fn new(request: &Request, callback_pool: WorkerPool) -> Arc<Self> {
        Arc::new(CallState {
            request_id: request.id,
            service: request.service.clone(),
            method: request.method.clone(),
            started_at: Instant::now(),
            response: OnceLock::new(),
            callbacks: Mutex::new(Vec::new()),
            notify: Notify::new(),
            done: Mutex::new(false),
            done_cond: Condvar::new(),
            callback_pool,
        })
    }

    pub(crate) fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub(crate) fn is_done(&self) -> bool {
        self.response.get().is_some()
    }

    /// Stores the response and wakes every waiter.
    ///
    /// Returns `false` if the call was already completed, in which case `response` is dropped.
    pub(crate) fn complete(&self, response: Response) -> bool {
        if self.response.set(response).is_err() {
            debug!(request_id = %self.request_id, "ignoring duplicate response");
            return false;
        }

        self.notify.notify_waiters();
        *self.done.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.done_cond.notify_all();

        let callbacks =
            std::mem::take(&mut *self.callbacks.lock().unwrap_or_else(PoisonError::into_inner));
        for callback in callbacks {
            self.run_callback(callback);
        }

        let elapsed = self.started_at.elapsed();
        if elapsed > SLOW_CALL_THRESHOLD {
            warn!(
                request_id = %self.request_id,
                service = %self.service,
                method = %self.method,
                elapsed_ms = elapsed.as_millis() as u64,
                "slow call"
            );
        }

        true
    }

    fn add_callback(&self, callback: Callback) {
        let mut callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_done() {
            drop(callbacks);
            self.run_callback(callback);
        } else {
            callbacks.push(callback);
        }
    }

    fn run_callback(&self, callback: Callback) {
        let Some(response) = self.response.get().cloned() else {
            return;
        };
        if let Err(err) = self
            .callback_pool
            .try_submit(async move { callback(&response) })
        {
            error!(request_id = %self.request_id, %err, "failed to run callback");
        }
    }

    async fn wait(&self) -> &Response {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(response) = self.response.get() {
                return response;
            }
            notified.await;
        }
    }

    fn wait_blocking(&self, timeout: Option<Duration>) -> Option<&Response> {
        let done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        match timeout {
            Some(timeout) => {
                let _done = self
                    .done_cond
                    .wait_timeout_while(done, timeout, |done| !*done)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            None => {
                let _done = self
                    .done_cond
                    .wait_while(done, |done| !*done)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
        self.response.get()
    }

    fn timeout_error(&self) -> RpcError {
        RpcError::Timeout {
            request_id: self.request_id,
            service: self.service.clone(),
            method: self.method.clone(),
        }
    }
}

impl fmt::Debug for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallState")
            .field("request_id", &self.request_id)
            .field("service", &self.service)
            .field("method", &self.method)
            .field("done", &self.is_done())
            .finish()
    }
}

/// A pending remote call whose result decodes into `R`.
///
/// `RpcFuture` implements [`IntoFuture`], so it can be awaited directly; awaiting waits without
/// a deadline. Use [`get_timeout`](RpcFuture::get_timeout) to bound the wait.
pub struct RpcFuture<R> {
    state: Arc<CallState>,
    _marker: PhantomData<fn() -> R>,
}

impl<R> RpcFuture<R> {
    pub(crate) fn new(state: Arc<CallState>) -> Self {
        RpcFuture {
            state,
            _marker: PhantomData,
        }
    }

    /// Returns the id of the underlying request.
    pub fn request_id(&self) -> RequestId {
        self.state.request_id()
    }

    /// Returns `true` once a response has been received.
    pub fn is_done(&self) -> bool {
        self.state.is_done()
    }

    /// Returns the time elapsed since the request was sent.
    pub fn elapsed(&self) -> Duration {
        self.state.started_at.elapsed()
    }
}

impl<R: Decode> RpcFuture<R> {
    /// Waits for the response without a deadline.
    pub async fn get(&self) -> Result<R, RpcError> {
        into_result(self.state.wait().await)
    }

    /// Waits for the response for at most `timeout`.
    ///
    /// On expiry returns [`RpcError::Timeout`] naming the request; the call stays pending.
    pub async fn get_timeout(&self, timeout: Duration) -> Result<R, RpcError> {
        match tokio::time::timeout(timeout, self.state.wait()).await {
            Ok(response) => into_result(response),
            Err(_) => Err(self.state.timeout_error()),
        }
    }

    /// Blocks the current thread until the response arrives.
    ///
    /// Must not be called from within an async context.
    pub fn blocking_get(&self) -> Result<R, RpcError> {
        match self.state.wait_blocking(None) {
            Some(response) => into_result(response),
            None => Err(RpcError::NoResult),
        }
    }

    /// Blocks the current thread for at most `timeout`.
    ///
    /// Must not be called from within an async context.
    pub fn blocking_get_timeout(&self, timeout: Duration) -> Result<R, RpcError> {
        match self.state.wait_blocking(Some(timeout)) {
            Some(response) => into_result(response),
            None => Err(self.state.timeout_error()),
        }
    }
}

impl<R: Decode + 'static> RpcFuture<R> {
    /// Registers a callback invoked with the call's outcome.
    ///
    /// If the call has already completed, the callback is scheduled immediately. Callbacks run on
    /// the client's callback pool, never on the connection's read loop.
    pub fn add_callback<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(Result<R, RpcError>) + Send + 'static,
    {
        self.state
            .add_callback(Box::new(move |response: &Response| {
                callback(into_result(response))
            }));
        self
    }
}

impl<R> Clone for RpcFuture<R> {
    fn clone(&self) -> Self {
        RpcFuture {
            state: self.state.clone(),
            _marker: PhantomData,
        }
    }
}

impl<R> fmt::Debug for RpcFuture<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RpcFuture").field(&self.state).finish()
    }
}

impl<R: Decode + Send + 'static> IntoFuture for RpcFuture<R> {
    type Output = Result<R, RpcError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.get().await })
    }
}

fn into_result<R: Decode>(response: &Response) -> Result<R, RpcError> {
    if let Some(err) = &response.error {
        return Err(RpcError::Remote(err.clone()));
    }
    match &response.result {
        Some(result) => Ok(R::decode(result)?),
        None => R::decode(NIL).map_err(|_| RpcError::NoResult),
    }
}
