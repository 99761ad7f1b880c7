use super::handler::RpcObject;
use crate::{Result, RpcError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Name to object map shared by every connection of a server.
///
/// Dispatch takes the read lock only long enough to clone the object handle,
/// so a method that is running when its object is unregistered finishes
/// normally.
#[derive(Default)]
pub(crate) struct MethodRegistry {
    objects: RwLock<HashMap<String, Arc<dyn RpcObject>>>,
}

/// Whether a method or object name may never be called remotely.
pub(crate) fn is_protected(name: &str) -> bool {
    name.is_empty() || name.starts_with('_')
}

impl MethodRegistry {
    // ---

    pub(crate) async fn register(&self, name: &str, object: Arc<dyn RpcObject>) -> Result<()> {
        // ---
        if is_protected(name) || name.contains('.') {
            return Err(RpcError::InvalidParams(format!("invalid object name `{name}`")));
        }

        let replaced = self
            .objects
            .write()
            .await
            .insert(name.to_string(), object)
            .is_some();

        if replaced {
            crate::log_warn!("replaced registered object `{}`", name);
        }
        Ok(())
    }

    pub(crate) async fn unregister(&self, name: &str) -> bool {
        self.objects.write().await.remove(name).is_some()
    }

    /// Find the object serving `method` (`"<object>.<method>"`).
    ///
    /// Returns the object and the method name relative to it.
    pub(crate) async fn resolve(&self, method: &str) -> Option<(Arc<dyn RpcObject>, String)> {
        // ---
        let (object_name, member) = method.split_once('.')?;
        if is_protected(object_name) || is_protected(member) {
            return None;
        }

        let object = self.objects.read().await.get(object_name).cloned()?;
        object
            .methods()
            .iter()
            .any(|m| m == member)
            .then(|| (object, member.to_string()))
    }

    /// Every callable method, flattened to `"<object>.<method>"` and sorted.
    pub(crate) async fn method_names(&self) -> Vec<String> {
        // ---
        let objects = self.objects.read().await;
        let mut names: Vec<String> = objects
            .iter()
            .flat_map(|(name, object)| {
                object
                    .methods()
                    .into_iter()
                    .filter(|m| !is_protected(m))
                    .map(move |m| format!("{name}.{m}"))
            })
            .collect();
        names.sort();
        names
    }
}
