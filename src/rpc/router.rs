use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tracing::debug;

use super::envelope::RpcRequest;

pub type HandlerFuture = BoxFuture<'static, Option<Value>>;
pub type Handler = Arc<dyn Fn(RpcRequest) -> HandlerFuture + Send + Sync>;

/// Flat dispatch table from colon-delimited paths (`status:get`) to handlers.
///
/// Cloning shares the table, so routes added later are seen by every peer
/// already holding a clone.
#[derive(Clone, Default)]
pub struct Router {
    routes: Arc<RwLock<HashMap<String, Handler>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `path`.
    pub fn route<F, Fut>(&self, path: impl Into<String>, handler: F) -> &Self
    where
        F: Fn(RpcRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Value>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |req| handler(req).boxed());
        self.routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.into(), handler);
        self
    }

    pub fn handler(&self, path: &str) -> Option<Handler> {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        paths.sort();
        paths
    }

    /// Run the handler for `req.path`; unknown paths answer `null`.
    pub async fn dispatch(&self, req: RpcRequest) -> Value {
        match self.handler(&req.path) {
            Some(handler) => handler(req).await.unwrap_or(Value::Null),
            None => {
                debug!(path = %req.path, "No route registered");
                Value::Null
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(path: &str) -> RpcRequest {
        RpcRequest {
            path: path.into(),
            session: "s".into(),
            params: Some(json!({"id": "kitchen"})),
            body: None,
        }
    }

    #[tokio::test]
    async fn dispatches_by_exact_path() {
        let router = Router::new();
        router
            .route("status:get", |_| async { Some(json!({"running": true})) })
            .route("plugin:demo:echo", |req: RpcRequest| async move {
                req.param("id").map(|id| json!(id))
            });

        assert_eq!(router.dispatch(request("status:get")).await, json!({"running": true}));
        assert_eq!(router.dispatch(request("plugin:demo:echo")).await, json!("kitchen"));
        assert_eq!(router.dispatch(request("status")).await, Value::Null);
        assert_eq!(router.paths(), vec!["plugin:demo:echo", "status:get"]);
    }

    #[tokio::test]
    async fn clones_share_routes() {
        let router = Router::new();
        let clone = router.clone();
        router.route("late:route", |_| async { Some(json!(1)) });
        assert_eq!(clone.dispatch(request("late:route")).await, json!(1));
    }
}
