//! Hierarchical router: a tree of groups lowered onto one axum engine.
//!
//! Groups hold a path prefix, an upward parent link, an ordered middleware
//! chain, and their route registrations. The tree is lowered into an
//! `axum::Router` once, when the application starts serving: children are
//! nested first, then the group's own layers are applied, so a group's
//! middleware wraps its subtree and the effective chain at any route is
//! `parent.effective ++ own` in insertion order. Registrations after the
//! lowering fail with [`RouterError::Frozen`].

use crate::error::RouterError;
use axum::body::Body;
use axum::handler::Handler;
use axum::http::{Method, Request};
use axum::response::IntoResponse;
use axum::routing::{MethodRouter, Route};
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tower::{Layer, Service};
use tracing::{debug, info};

type GroupId = usize;

/// A deferred layer application; run when the tree is lowered.
type LayerFn = Box<dyn FnOnce(axum::Router) -> axum::Router + Send + 'static>;

struct GroupNode {
    /// Prefix relative to the parent. Empty for the root.
    prefix: String,
    parent: Option<GroupId>,
    /// Children keyed by their relative prefix, in creation order.
    /// Re-creating a prefix replaces the previous child silently.
    children: Vec<(String, GroupId)>,
    middlewares: Vec<LayerFn>,
    routes: Vec<(Method, String, MethodRouter)>,
}

struct RouterTree {
    nodes: Vec<Option<GroupNode>>,
    frozen: bool,
}

/// Handle to one group in the router tree. Handles are cheap to clone and
/// all share the same tree; a subrouter's lifetime is bounded by its root.
#[derive(Clone)]
pub struct Router {
    tree: Arc<Mutex<RouterTree>>,
    id: GroupId,
}

impl Router {
    /// Build the root group over a fresh engine.
    pub(crate) fn new() -> Router {
        debug!("creating router");
        let root = GroupNode {
            prefix: String::new(),
            parent: None,
            children: Vec::new(),
            middlewares: Vec::new(),
            routes: Vec::new(),
        };
        info!("created router");
        Router {
            tree: Arc::new(Mutex::new(RouterTree {
                nodes: vec![Some(root)],
                frozen: false,
            })),
            id: 0,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RouterTree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a child group mounted at `prefix` (must start with `/`).
    /// Creating the same prefix again replaces the earlier child.
    pub fn create_subrouter(&self, prefix: &str) -> Result<Router, RouterError> {
        let mut tree = self.lock();
        if tree.frozen {
            return Err(RouterError::Frozen);
        }
        debug!(route = prefix, "creating subrouter");

        let id = tree.nodes.len();
        tree.nodes.push(Some(GroupNode {
            prefix: prefix.to_string(),
            parent: Some(self.id),
            children: Vec::new(),
            middlewares: Vec::new(),
            routes: Vec::new(),
        }));
        let children = match tree.nodes[self.id].as_mut() {
            Some(node) => &mut node.children,
            None => return Err(RouterError::Frozen),
        };
        if let Some(slot) = children.iter_mut().find(|(key, _)| key == prefix) {
            slot.1 = id;
        } else {
            children.push((prefix.to_string(), id));
        }

        info!(route = prefix, "created subrouter");
        Ok(Router {
            tree: Arc::clone(&self.tree),
            id,
        })
    }

    /// Prefix of this group relative to the engine root, via the parent links.
    pub fn effective_prefix(&self) -> String {
        let tree = self.lock();
        let mut parts = Vec::new();
        let mut current = Some(self.id);
        while let Some(id) = current {
            match tree.nodes.get(id).and_then(Option::as_ref) {
                Some(node) => {
                    parts.push(node.prefix.clone());
                    current = node.parent;
                }
                None => break,
            }
        }
        parts.reverse();
        parts.concat()
    }

    pub fn get<H, T>(&self, path: &str, handler: H) -> Result<(), RouterError>
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.register(Method::GET, path, axum::routing::get(handler))
    }

    pub fn post<H, T>(&self, path: &str, handler: H) -> Result<(), RouterError>
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.register(Method::POST, path, axum::routing::post(handler))
    }

    pub fn put<H, T>(&self, path: &str, handler: H) -> Result<(), RouterError>
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.register(Method::PUT, path, axum::routing::put(handler))
    }

    pub fn patch<H, T>(&self, path: &str, handler: H) -> Result<(), RouterError>
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.register(Method::PATCH, path, axum::routing::patch(handler))
    }

    pub fn delete<H, T>(&self, path: &str, handler: H) -> Result<(), RouterError>
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.register(Method::DELETE, path, axum::routing::delete(handler))
    }

    /// Register a pre-built method router. Layer it first for per-route
    /// middleware; those layers wrap the handler inside the group chain.
    pub fn route(
        &self,
        method: Method,
        path: &str,
        method_router: MethodRouter,
    ) -> Result<(), RouterError> {
        self.register(method, path, method_router)
    }

    fn register(
        &self,
        method: Method,
        path: &str,
        method_router: MethodRouter,
    ) -> Result<(), RouterError> {
        let mut tree = self.lock();
        if tree.frozen {
            return Err(RouterError::Frozen);
        }
        // Group-root registrations arrive as "".
        let path = if path.is_empty() { "/" } else { path };
        debug!(method = %method, route = path, "registered a handler");
        match tree.nodes[self.id].as_mut() {
            Some(node) => {
                node.routes.push((method, path.to_string(), method_router));
                Ok(())
            }
            None => Err(RouterError::Frozen),
        }
    }

    /// Attach a group-scoped middleware layer. Wraps every route and child
    /// group of this group, including ones registered later.
    pub fn middleware<L>(&self, layer: L) -> Result<(), RouterError>
    where
        L: Layer<Route> + Clone + Send + Sync + 'static,
        L::Service: Service<Request<Body>> + Clone + Send + Sync + 'static,
        <L::Service as Service<Request<Body>>>::Response: IntoResponse + 'static,
        <L::Service as Service<Request<Body>>>::Error: Into<Infallible> + 'static,
        <L::Service as Service<Request<Body>>>::Future: Send + 'static,
    {
        let mut tree = self.lock();
        if tree.frozen {
            return Err(RouterError::Frozen);
        }
        match tree.nodes[self.id].as_mut() {
            Some(node) => {
                node.middlewares
                    .push(Box::new(move |router| router.layer(layer)));
                Ok(())
            }
            None => Err(RouterError::Frozen),
        }
    }

    /// Lower the whole tree into an `axum::Router` and freeze registrations.
    /// Must be called on the root group.
    pub(crate) fn freeze(&self) -> axum::Router {
        let mut tree = self.lock();
        tree.frozen = true;
        let mut nodes = std::mem::take(&mut tree.nodes);
        build_group(self.id, &mut nodes)
    }
}

fn build_group(id: GroupId, nodes: &mut Vec<Option<GroupNode>>) -> axum::Router {
    let node = match nodes.get_mut(id).and_then(Option::take) {
        Some(node) => node,
        None => return axum::Router::new(),
    };

    let mut router = axum::Router::new();
    for (_, path, method_router) in node.routes {
        router = router.route(&path, method_router);
    }
    for (prefix, child_id) in node.children {
        router = router.nest(&prefix, build_group(child_id, nodes));
    }
    // Apply in reverse so the first-attached middleware ends up outermost
    // and runs first on the way in.
    for layer in node.middlewares.into_iter().rev() {
        router = layer(router);
    }
    router
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, StatusCode};
    use axum::middleware::{from_fn, Next};
    use axum::response::Response;
    use tower::ServiceExt;

    async fn hello() -> &'static str {
        "hello"
    }

    fn request(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    async fn tag(req: Request<Body>, next: Next, value: &'static str) -> Response {
        let mut response = next.run(req).await;
        response
            .headers_mut()
            .append("x-chain", HeaderValue::from_static(value));
        response
    }

    async fn tag_parent(req: Request<Body>, next: Next) -> Response {
        tag(req, next, "parent").await
    }

    async fn tag_child(req: Request<Body>, next: Next) -> Response {
        tag(req, next, "child").await
    }

    #[tokio::test]
    async fn subrouter_routes_are_prefixed() {
        let root = Router::new();
        let api = root.create_subrouter("/api/v1").unwrap();
        api.get("/x", hello).unwrap();

        let app = root.freeze();
        let found = app.clone().oneshot(request("/api/v1/x")).await.unwrap();
        assert_eq!(found.status(), StatusCode::OK);

        let missing = app.oneshot(request("/x")).await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn empty_path_registers_the_group_root() {
        let root = Router::new();
        let api = root.create_subrouter("/api/v1").unwrap();
        api.get("", hello).unwrap();

        let app = root.freeze();
        let response = app.oneshot(request("/api/v1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn child_inherits_parent_middleware_attached_later() {
        let root = Router::new();
        let child = root.create_subrouter("/api").unwrap();
        child.get("/x", hello).unwrap();
        // Attached after the child was created and its route registered.
        root.middleware(from_fn(tag_parent)).unwrap();

        let app = root.freeze();
        let response = app.oneshot(request("/api/x")).await.unwrap();
        let tags: Vec<_> = response.headers().get_all("x-chain").iter().collect();
        assert_eq!(tags, vec!["parent"]);
    }

    #[tokio::test]
    async fn child_middleware_does_not_affect_parent() {
        let root = Router::new();
        root.get("/top", hello).unwrap();
        let child = root.create_subrouter("/api").unwrap();
        child.get("/x", hello).unwrap();
        child.middleware(from_fn(tag_child)).unwrap();

        let app = root.freeze();
        let top = app.clone().oneshot(request("/top")).await.unwrap();
        assert!(top.headers().get("x-chain").is_none());

        let nested = app.oneshot(request("/api/x")).await.unwrap();
        assert_eq!(nested.headers().get("x-chain").unwrap(), "child");
    }

    #[tokio::test]
    async fn effective_chain_is_parent_then_own() {
        let root = Router::new();
        root.middleware(from_fn(tag_parent)).unwrap();
        let child = root.create_subrouter("/api").unwrap();
        child.middleware(from_fn(tag_child)).unwrap();
        child.get("/x", hello).unwrap();

        let app = root.freeze();
        let response = app.oneshot(request("/api/x")).await.unwrap();
        // Response headers appended on the way out: innermost first.
        let tags: Vec<_> = response.headers().get_all("x-chain").iter().collect();
        assert_eq!(tags, vec!["child", "parent"]);
    }

    #[tokio::test]
    async fn registration_after_freeze_is_rejected() {
        let root = Router::new();
        let api = root.create_subrouter("/api").unwrap();
        root.get("/", hello).unwrap();
        let _app = root.freeze();

        assert!(matches!(
            api.get("/late", hello),
            Err(RouterError::Frozen)
        ));
        assert!(matches!(
            root.create_subrouter("/other"),
            Err(RouterError::Frozen)
        ));
        assert!(matches!(
            root.middleware(from_fn(tag_parent)),
            Err(RouterError::Frozen)
        ));
    }

    #[tokio::test]
    async fn duplicate_subrouter_replaces_silently() {
        let root = Router::new();
        let first = root.create_subrouter("/api").unwrap();
        first.get("/old", hello).unwrap();
        let second = root.create_subrouter("/api").unwrap();
        second.get("/new", hello).unwrap();

        let app = root.freeze();
        let new = app.clone().oneshot(request("/api/new")).await.unwrap();
        assert_eq!(new.status(), StatusCode::OK);
        let old = app.oneshot(request("/api/old")).await.unwrap();
        assert_eq!(old.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn effective_prefix_walks_the_parent_chain() {
        let root = Router::new();
        let api = root.create_subrouter("/api/v1").unwrap();
        let users = api.create_subrouter("/users").unwrap();
        assert_eq!(root.effective_prefix(), "");
        assert_eq!(users.effective_prefix(), "/api/v1/users");
    }

    #[tokio::test]
    async fn methods_dispatch_separately() {
        let root = Router::new();
        root.get("/thing", hello).unwrap();
        root.post("/thing", hello).unwrap();

        let app = root.freeze();
        let ok = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/thing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);

        let not_allowed = app
            .oneshot(
                Request::builder()
                    .method(Method::DELETE)
                    .uri("/thing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(not_allowed.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
