//! Remote collaborator interface and a typed operation registry
//!
//! The orchestrator only needs something implementing [`RemoteInvoker`]. For
//! in-process backends, [`OperationRegistry`] maps operation names to handlers
//! with concrete argument and output types. The map is built once and frozen;
//! arguments are decoded into the handler's type at call time, and a decode
//! failure is reported like any other remote rejection.

use crate::error::RemoteError;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// The remote side of the cache: executes an operation and returns its result
#[async_trait]
pub trait RemoteInvoker<V>: Send + Sync {
    async fn invoke(
        &self,
        operation: &str,
        args: &Value,
        identity: Option<&str>,
    ) -> Result<V, RemoteError>;
}

/// A statically typed operation
#[async_trait]
pub trait OperationHandler: Send + Sync + 'static {
    type Args: DeserializeOwned + Send;
    type Output: Serialize + Send;

    async fn handle(
        &self,
        args: Self::Args,
        identity: Option<&str>,
    ) -> Result<Self::Output, RemoteError>;
}

type ErasedHandler =
    Arc<dyn Fn(Value, Option<String>) -> BoxFuture<'static, Result<Value, RemoteError>> + Send + Sync>;

fn decode_args<A: DeserializeOwned>(operation: &str, args: Value) -> Result<A, RemoteError> {
    serde_json::from_value(args).map_err(|e| RemoteError::InvalidArguments {
        operation: operation.to_string(),
        message: e.to_string(),
    })
}

fn encode_output<O: Serialize>(operation: &str, output: O) -> Result<Value, RemoteError> {
    serde_json::to_value(output).map_err(|e| {
        RemoteError::failed(operation, format!("result could not be encoded: {}", e))
    })
}

/// Immutable name → handler map
#[derive(Clone)]
pub struct OperationRegistry {
    handlers: Arc<HashMap<String, ErasedHandler>>,
}

impl OperationRegistry {
    pub fn builder() -> OperationRegistryBuilder {
        OperationRegistryBuilder::default()
    }

    pub fn contains(&self, operation: &str) -> bool {
        self.handlers.contains_key(operation)
    }

    /// Registered operation names, sorted
    pub fn operations(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("operations", &self.operations())
            .finish()
    }
}

#[async_trait]
impl RemoteInvoker<Value> for OperationRegistry {
    async fn invoke(
        &self,
        operation: &str,
        args: &Value,
        identity: Option<&str>,
    ) -> Result<Value, RemoteError> {
        let handler = self
            .handlers
            .get(operation)
            .map(Arc::clone)
            .ok_or_else(|| RemoteError::UnknownOperation(operation.to_string()))?;

        debug!("Dispatching {}", operation);
        handler(args.clone(), identity.map(str::to_owned)).await
    }
}

/// Collects handlers before the registry is frozen
#[derive(Default)]
pub struct OperationRegistryBuilder {
    handlers: HashMap<String, ErasedHandler>,
}

impl OperationRegistryBuilder {
    /// Register a typed handler under `name`, replacing any previous one
    pub fn register<H: OperationHandler>(mut self, name: impl Into<String>, handler: H) -> Self {
        let name = name.into();
        let handler = Arc::new(handler);
        let operation = name.clone();

        let erased: ErasedHandler = Arc::new(move |args, identity| {
            let handler = Arc::clone(&handler);
            let operation = operation.clone();
            async move {
                let args = decode_args::<H::Args>(&operation, args)?;
                let output = handler.handle(args, identity.as_deref()).await?;
                encode_output(&operation, output)
            }
            .boxed()
        });

        self.handlers.insert(name, erased);
        self
    }

    /// Register a closure handler under `name`
    pub fn register_fn<A, O, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(A, Option<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, RemoteError>> + Send + 'static,
    {
        let name = name.into();
        let f = Arc::new(f);
        let operation = name.clone();

        let erased: ErasedHandler = Arc::new(move |args, identity| {
            let f = Arc::clone(&f);
            let operation = operation.clone();
            async move {
                let args = decode_args::<A>(&operation, args)?;
                let output = f(args, identity).await?;
                encode_output(&operation, output)
            }
            .boxed()
        });

        self.handlers.insert(name, erased);
        self
    }

    pub fn build(self) -> OperationRegistry {
        OperationRegistry {
            handlers: Arc::new(self.handlers),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct DoctorArgs {
        id: u32,
    }

    #[derive(Serialize)]
    struct Doctor {
        id: u32,
        name: String,
    }

    struct GetDoctor;

    #[async_trait]
    impl OperationHandler for GetDoctor {
        type Args = DoctorArgs;
        type Output = Doctor;

        async fn handle(&self, args: DoctorArgs, _identity: Option<&str>) -> Result<Doctor, RemoteError> {
            if args.id == 0 {
                return Err(RemoteError::with_code("getDoctor", "NOT_FOUND", "no such doctor"));
            }
            Ok(Doctor {
                id: args.id,
                name: format!("Dr. {}", args.id),
            })
        }
    }

    fn registry() -> OperationRegistry {
        OperationRegistry::builder()
            .register("getDoctor", GetDoctor)
            .register_fn("whoAmI", |_: Value, identity: Option<String>| async move {
                Ok::<_, RemoteError>(identity.unwrap_or_else(|| "anonymous".to_string()))
            })
            .build()
    }

    #[tokio::test]
    async fn test_typed_handler() {
        let registry = registry();
        let result = registry
            .invoke("getDoctor", &json!({"id": 7}), None)
            .await
            .unwrap();

        assert_eq!(result, json!({"id": 7, "name": "Dr. 7"}));
        assert_eq!(registry.operations(), vec!["getDoctor", "whoAmI"]);
    }

    #[tokio::test]
    async fn test_handler_failure_is_passed_through() {
        let err = registry()
            .invoke("getDoctor", &json!({"id": 0}), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("NOT_FOUND"));
    }

    #[tokio::test]
    async fn test_closure_handler_sees_identity() {
        let registry = registry();
        let result = registry
            .invoke("whoAmI", &Value::Null, Some("patient-1"))
            .await
            .unwrap();
        assert_eq!(result, json!("patient-1"));
    }

    #[tokio::test]
    async fn test_unknown_operation_and_bad_arguments() {
        let registry = registry();

        let err = registry.invoke("deleteEverything", &Value::Null, None).await.unwrap_err();
        assert_eq!(err, RemoteError::UnknownOperation("deleteEverything".to_string()));

        let err = registry
            .invoke("getDoctor", &json!({"id": "seven"}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::InvalidArguments { .. }));
    }
}
