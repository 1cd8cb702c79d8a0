//! Hooks run around every `call_service`.
//!
//! A middleware sees the call before it is sent and may veto it, then sees
//! the outcome and elapsed time afterwards. Layers run in registration
//! order on the way in and in reverse order on the way out.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use homelink_protocol::ServiceCall;

use crate::error::ConnectionError;

/// A layer wrapped around service calls.
pub trait ServiceMiddleware: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs before the call is sent. Returning an error aborts the call.
    fn before(&self, _call: &ServiceCall) -> Result<(), ConnectionError> {
        Ok(())
    }

    /// Runs after the call resolved or failed.
    fn after(
        &self,
        _call: &ServiceCall,
        _elapsed: Duration,
        _outcome: Result<&Value, &ConnectionError>,
    ) {
    }
}

/// Rejects calls whose domain or service is not a lowercase identifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidateServiceCall;

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl ServiceMiddleware for ValidateServiceCall {
    fn name(&self) -> &'static str {
        "validate"
    }

    fn before(&self, call: &ServiceCall) -> Result<(), ConnectionError> {
        if !is_identifier(&call.domain) {
            return Err(ConnectionError::InvalidServiceCall(format!(
                "invalid domain {:?}",
                call.domain
            )));
        }
        if !is_identifier(&call.service) {
            return Err(ConnectionError::InvalidServiceCall(format!(
                "invalid service {:?}",
                call.service
            )));
        }
        if let Some(data) = &call.service_data
            && !data.is_object()
        {
            return Err(ConnectionError::InvalidServiceCall(
                "service_data must be a JSON object".into(),
            ));
        }
        if let Some(target) = &call.target
            && !target.is_object()
        {
            return Err(ConnectionError::InvalidServiceCall(
                "target must be a JSON object".into(),
            ));
        }
        Ok(())
    }
}

/// Logs every call's duration and warns about slow ones.
#[derive(Debug)]
pub struct TimingMiddleware {
    slow_threshold: Duration,
    slow_calls: AtomicU64,
}

impl Default for TimingMiddleware {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl TimingMiddleware {
    pub fn new(slow_threshold: Duration) -> Self {
        Self {
            slow_threshold,
            slow_calls: AtomicU64::new(0),
        }
    }

    /// Number of calls that took longer than the threshold.
    pub fn slow_calls(&self) -> u64 {
        self.slow_calls.load(Ordering::Relaxed)
    }
}

impl ServiceMiddleware for TimingMiddleware {
    fn name(&self) -> &'static str {
        "timing"
    }

    fn after(
        &self,
        call: &ServiceCall,
        elapsed: Duration,
        outcome: Result<&Value, &ConnectionError>,
    ) {
        let elapsed_ms = elapsed.as_millis() as u64;
        if elapsed > self.slow_threshold {
            self.slow_calls.fetch_add(1, Ordering::Relaxed);
            warn!(
                service = %call.qualified_name(),
                elapsed_ms,
                threshold_ms = self.slow_threshold.as_millis() as u64,
                "slow service call"
            );
        } else {
            debug!(
                service = %call.qualified_name(),
                elapsed_ms,
                ok = outcome.is_ok(),
                "service call finished"
            );
        }
    }
}

/// Ordered list of middlewares.
#[derive(Clone, Default)]
pub(crate) struct MiddlewareChain {
    layers: Vec<Arc<dyn ServiceMiddleware>>,
}

impl MiddlewareChain {
    pub(crate) fn push(&mut self, layer: Arc<dyn ServiceMiddleware>) {
        self.layers.push(layer);
    }

    pub(crate) fn len(&self) -> usize {
        self.layers.len()
    }

    /// Runs `call` through every layer around `send`.
    pub(crate) async fn run<F, Fut>(
        &self,
        call: ServiceCall,
        send: F,
    ) -> Result<Value, ConnectionError>
    where
        F: FnOnce(ServiceCall) -> Fut,
        Fut: Future<Output = Result<Value, ConnectionError>>,
    {
        for layer in &self.layers {
            if let Err(e) = layer.before(&call) {
                debug!(layer = layer.name(), error = %e, "service call rejected");
                return Err(e);
            }
        }

        let started = Instant::now();
        let outcome = send(call.clone()).await;
        let elapsed = started.elapsed();

        for layer in self.layers.iter().rev() {
            layer.after(&call, elapsed, outcome.as_ref());
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct Recorder {
        tag: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ServiceMiddleware for Recorder {
        fn name(&self) -> &'static str {
            self.tag
        }

        fn before(&self, _call: &ServiceCall) -> Result<(), ConnectionError> {
            self.log.lock().unwrap().push(format!("before:{}", self.tag));
            Ok(())
        }

        fn after(
            &self,
            _call: &ServiceCall,
            _elapsed: Duration,
            outcome: Result<&Value, &ConnectionError>,
        ) {
            self.log
                .lock()
                .unwrap()
                .push(format!("after:{}:{}", self.tag, outcome.is_ok()));
        }
    }

    #[tokio::test]
    async fn layers_wrap_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = MiddlewareChain::default();
        for tag in ["a", "b"] {
            chain.push(Arc::new(Recorder {
                tag,
                log: log.clone(),
            }));
        }

        let inner = log.clone();
        let out = chain
            .run(ServiceCall::new("light", "turn_on"), |_call| async move {
                inner.lock().unwrap().push("send".into());
                Ok(json!({"done": true}))
            })
            .await
            .unwrap();

        assert_eq!(out, json!({"done": true}));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["before:a", "before:b", "send", "after:b:true", "after:a:true"]
        );
    }

    #[tokio::test]
    async fn rejection_skips_send() {
        let mut chain = MiddlewareChain::default();
        chain.push(Arc::new(ValidateServiceCall));

        let sent = Arc::new(AtomicU64::new(0));
        let counter = sent.clone();
        let err = chain
            .run(ServiceCall::new("Light", "turn_on"), |_call| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ConnectionError::InvalidServiceCall(_)));
        assert_eq!(sent.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn validation_rules() {
        let v = ValidateServiceCall;
        assert!(v.before(&ServiceCall::new("light", "turn_on")).is_ok());
        assert!(
            v.before(&ServiceCall::new("light", "turn_on").with_entity("light.kitchen"))
                .is_ok()
        );
        assert!(v.before(&ServiceCall::new("", "turn_on")).is_err());
        assert!(v.before(&ServiceCall::new("light", "turn on")).is_err());
        assert!(
            v.before(&ServiceCall::new("light", "turn_on").with_data(json!([1, 2])))
                .is_err()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timing_counts_slow_calls() {
        let timing = Arc::new(TimingMiddleware::new(Duration::from_millis(500)));
        let mut chain = MiddlewareChain::default();
        chain.push(timing.clone());

        chain
            .run(ServiceCall::new("light", "turn_on"), |_call| async {
                tokio::time::sleep(Duration::from_millis(800)).await;
                Ok(Value::Null)
            })
            .await
            .unwrap();
        chain
            .run(ServiceCall::new("light", "turn_off"), |_call| async {
                Ok(Value::Null)
            })
            .await
            .unwrap();

        assert_eq!(timing.slow_calls(), 1);
    }
}
