use super::RpcClient;
use crate::protocol::Params;
use crate::Result;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// A named remote method bound to a client.
///
/// Nested names are built with [`attr`](Self::attr): `client.method("a").attr("b")`
/// calls `"a.b"` on the server.
#[derive(Clone)]
pub struct RemoteMethod {
    client: RpcClient,
    name: String,
}

impl RemoteMethod {
    // ---

    pub(super) fn new(client: RpcClient, name: String) -> Self {
        Self { client, name }
    }

    /// Full dotted method name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The method `<self>.<part>`.
    pub fn attr(&self, part: &str) -> Self {
        Self {
            client: self.client.clone(),
            name: format!("{}.{part}", self.name),
        }
    }

    /// Whether the server listed this method at the last refresh.
    pub fn exists(&self) -> bool {
        self.client.has_method(&self.name)
    }

    pub async fn call(&self, params: Params) -> Result<Value> {
        self.client.call(&self.name, params).await
    }

    pub async fn call_as<T: DeserializeOwned>(&self, params: Params) -> Result<T> {
        self.client.call_as(&self.name, params).await
    }

    pub async fn notify(&self, params: Params) -> Result<()> {
        self.client.notify(&self.name, params).await
    }
}

impl std::fmt::Debug for RemoteMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RemoteMethod").field(&self.name).finish()
    }
}
