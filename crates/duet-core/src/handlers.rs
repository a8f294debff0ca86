//! The local function tree.
//!
//! An arbitrarily deep namespace whose leaves are callables, looked up by
//! dot-separated path on every invocation. The tree may be mutated at
//! runtime; resolution never caches, so a swap is observed on the next call.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde_json::Value;

use crate::endpoint::Context;
use crate::errors::HandlerError;

/// Stream of values produced by a streaming handler.
///
/// An `Err` item aborts the stream and travels to the caller as a stream
/// error frame.
pub type ValueStream = BoxStream<'static, Result<Value, HandlerError>>;

/// What a handler produced: a single value, or a sequence to stream.
pub enum Reply {
    Value(Value),
    Stream(ValueStream),
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Reply::Stream(_) => f.debug_tuple("Stream").finish(),
        }
    }
}

/// Boxed future returned by [`Handler::invoke`].
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Reply, HandlerError>> + Send>>;

/// A callable leaf in the function tree.
///
/// Most handlers are built with [`handler`] or [`stream_handler`]; implement
/// the trait directly when the outcome shape depends on the arguments.
pub trait Handler: Send + Sync {
    fn invoke(&self, ctx: Context, args: Vec<Value>) -> HandlerFuture;
}

struct FnHandler<F>(F);

impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Context, Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    fn invoke(&self, ctx: Context, args: Vec<Value>) -> HandlerFuture {
        let fut = (self.0)(ctx, args);
        Box::pin(async move { fut.await.map(Reply::Value) })
    }
}

/// Wrap an async closure producing a single value.
///
/// ```ignore
/// functions.insert("hi", handler(|_ctx, args| async move {
///     Ok(json!(format!("Hi {}", args[0].as_str().unwrap_or("?"))))
/// }));
/// ```
pub fn handler<F, Fut>(f: F) -> impl Handler
where
    F: Fn(Context, Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    FnHandler(f)
}

struct StreamFnHandler<F>(F);

impl<F, S> Handler for StreamFnHandler<F>
where
    F: Fn(Context, Vec<Value>) -> S + Send + Sync,
    S: futures_util::Stream<Item = Result<Value, HandlerError>> + Send + 'static,
{
    fn invoke(&self, ctx: Context, args: Vec<Value>) -> HandlerFuture {
        let stream = (self.0)(ctx, args);
        Box::pin(async move { Ok(Reply::Stream(stream.boxed())) })
    }
}

/// Wrap a closure producing a stream of values.
pub fn stream_handler<F, S>(f: F) -> impl Handler
where
    F: Fn(Context, Vec<Value>) -> S + Send + Sync,
    S: futures_util::Stream<Item = Result<Value, HandlerError>> + Send + 'static,
{
    StreamFnHandler(f)
}

/// Handler substituted for optional calls on a missing function.
pub(crate) struct NullHandler;

impl Handler for NullHandler {
    fn invoke(&self, _ctx: Context, _args: Vec<Value>) -> HandlerFuture {
        Box::pin(async { Ok(Reply::Value(Value::Null)) })
    }
}

enum Node {
    Leaf(Arc<dyn Handler>),
    Nested(Namespace),
}

#[derive(Default)]
struct Namespace {
    entries: HashMap<String, Node>,
}

/// The local function tree, shared and mutable at runtime.
///
/// Cloning shares the underlying tree; a broadcast group registers the same
/// `Handlers` on every member.
#[derive(Clone, Default)]
pub struct Handlers {
    root: Arc<RwLock<Namespace>>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler at a dot-separated path, creating intermediate
    /// namespaces as needed. An existing entry at the path is replaced.
    pub fn insert(&self, path: &str, handler: impl Handler + 'static) {
        self.insert_arc(path, Arc::new(handler));
    }

    pub fn insert_arc(&self, path: &str, handler: Arc<dyn Handler>) {
        let mut node = self.root.write().unwrap();
        let mut segments = path.split('.').peekable();
        let mut current = &mut *node;
        while let Some(segment) = segments.next() {
            if segments.peek().is_none() {
                current
                    .entries
                    .insert(segment.to_string(), Node::Leaf(handler));
                return;
            }
            let entry = current
                .entries
                .entry(segment.to_string())
                .or_insert_with(|| Node::Nested(Namespace::default()));
            if let Node::Leaf(_) = entry {
                // A leaf in the way of a deeper path is replaced by a namespace.
                *entry = Node::Nested(Namespace::default());
            }
            current = match entry {
                Node::Nested(ns) => ns,
                Node::Leaf(_) => unreachable!("leaf was just replaced"),
            };
        }
    }

    /// Remove the entry (leaf or whole namespace) at a path.
    ///
    /// Returns whether something was removed.
    pub fn remove(&self, path: &str) -> bool {
        let mut node = self.root.write().unwrap();
        let mut segments = path.split('.').peekable();
        let mut current = &mut *node;
        while let Some(segment) = segments.next() {
            if segments.peek().is_none() {
                return current.entries.remove(segment).is_some();
            }
            current = match current.entries.get_mut(segment) {
                Some(Node::Nested(ns)) => ns,
                _ => return false,
            };
        }
        false
    }

    /// Resolve a dot-separated path to a handler.
    ///
    /// Missing or non-namespace intermediates and non-leaf terminals resolve
    /// to `None`.
    pub fn resolve(&self, path: &str) -> Option<Arc<dyn Handler>> {
        let node = self.root.read().unwrap();
        let mut segments = path.split('.').peekable();
        let mut current = &*node;
        while let Some(segment) = segments.next() {
            match current.entries.get(segment)? {
                Node::Leaf(handler) => {
                    return segments.peek().is_none().then(|| handler.clone());
                }
                Node::Nested(ns) => current = ns,
            }
        }
        None
    }

    pub fn contains(&self, path: &str) -> bool {
        self.resolve(path).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Context;
    use serde_json::json;

    fn test_ctx() -> Context {
        Context::detached()
    }

    #[tokio::test]
    async fn resolves_nested_paths() {
        let functions = Handlers::new();
        functions.insert(
            "user.settings.get",
            handler(|_ctx, args| async move {
                let key = args[0].as_str().unwrap_or_default().to_string();
                Ok(json!(format!("value-for-{key}")))
            }),
        );

        let resolved = functions
            .resolve("user.settings.get")
            .expect("nested path should resolve");
        let reply = resolved
            .invoke(test_ctx(), vec![json!("theme")])
            .await
            .unwrap();
        match reply {
            Reply::Value(v) => assert_eq!(v, json!("value-for-theme")),
            other => panic!("expected value reply, got {other:?}"),
        }

        // Prefixes and overshoots do not resolve.
        assert!(functions.resolve("user.settings").is_none());
        assert!(functions.resolve("user.settings.get.deeper").is_none());
        assert!(functions.resolve("user.missing").is_none());
    }

    #[tokio::test]
    async fn mutation_is_observed_on_next_resolution() {
        let functions = Handlers::new();
        assert!(functions.resolve("late").is_none());

        functions.insert("late", handler(|_ctx, _args| async { Ok(json!(1)) }));
        assert!(functions.contains("late"));

        assert!(functions.remove("late"));
        assert!(!functions.contains("late"));
        assert!(!functions.remove("late"));
    }

    #[test]
    fn removing_a_namespace_removes_the_subtree() {
        let functions = Handlers::new();
        functions.insert("a.b.c", NullHandler);
        functions.insert("a.b.d", NullHandler);
        assert!(functions.remove("a.b"));
        assert!(!functions.contains("a.b.c"));
        assert!(!functions.contains("a.b.d"));
    }

    #[test]
    fn deep_insert_replaces_a_blocking_leaf() {
        let functions = Handlers::new();
        functions.insert("a", NullHandler);
        functions.insert("a.b", NullHandler);
        assert!(!functions.contains("a"));
        assert!(functions.contains("a.b"));
    }

    #[test]
    fn clones_share_the_tree() {
        let functions = Handlers::new();
        let alias = functions.clone();
        alias.insert("shared", NullHandler);
        assert!(functions.contains("shared"));
    }
}
