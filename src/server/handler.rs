use crate::protocol::{MethodError, Params};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// An object whose methods can be called remotely.
///
/// The server calls [`invoke`](RpcObject::invoke) only for names listed by
/// [`methods`](RpcObject::methods). Names starting with `_` are never
/// reachable even if listed.
#[async_trait]
pub trait RpcObject: Send + Sync {
    // ---

    /// Names of the methods this object exposes.
    fn methods(&self) -> Vec<String>;

    /// Run `method` with the given arguments.
    async fn invoke(&self, method: &str, params: Params) -> Result<Value, MethodError>;
}

type BoxFuture<'a, T> = std::pin::Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// Type-erased async method closure
trait MethodFn: Send + Sync {
    fn call(&self, params: Params) -> BoxFuture<'static, Result<Value, MethodError>>;
}

struct Method<F, Fut, T>
where
    F: Fn(Params) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, MethodError>> + Send,
    T: Serialize,
{
    func: F,
    _phantom: std::marker::PhantomData<fn(T, Fut)>,
}

impl<F, Fut, T> MethodFn for Method<F, Fut, T>
where
    F: Fn(Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, MethodError>> + Send + 'static,
    T: Serialize + Send + 'static,
{
    fn call(&self, params: Params) -> BoxFuture<'static, Result<Value, MethodError>> {
        let fut = (self.func)(params);

        Box::pin(async move {
            let result = fut.await?;
            serde_json::to_value(result).map_err(|e| MethodError::runtime(e.to_string()))
        })
    }
}

/// An [`RpcObject`] assembled from async closures.
///
/// ```
/// use labwire::{MethodError, MethodTable, Params};
///
/// let dmm = MethodTable::new()
///     .method("identify", |_: Params| async { Ok::<_, MethodError>("Acme DMM-100") })
///     .method("measure", |params: Params| async move {
///         let range: f64 = params.get(0, "range")?;
///         Ok(range * 0.5)
///     });
/// ```
#[derive(Default, Clone)]
pub struct MethodTable {
    methods: HashMap<String, Arc<dyn MethodFn>>,
}

impl MethodTable {
    // ---

    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a method.
    pub fn method<F, Fut, T>(mut self, name: &str, func: F) -> Self
    where
        F: Fn(Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, MethodError>> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        // ---
        let method = Method {
            func,
            _phantom: std::marker::PhantomData,
        };
        self.methods.insert(name.to_string(), Arc::new(method));
        self
    }
}

#[async_trait]
impl RpcObject for MethodTable {
    // ---

    fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }

    async fn invoke(&self, method: &str, params: Params) -> Result<Value, MethodError> {
        // ---
        let func = self
            .methods
            .get(method)
            .cloned()
            .ok_or_else(|| MethodError::new(crate::RemoteErrorKind::NotFound, method))?;

        func.call(params).await
    }
}
