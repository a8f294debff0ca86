//! One-to-many broadcast over a dynamic list of endpoints.
//!
//! A group shares one function tree across every member and fans each
//! operation out to all of them, collecting results in list order.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::future::try_join_all;
use serde_json::Value;
use tracing::debug;

use crate::endpoint::{Endpoint, EndpointOptions};
use crate::errors::CallError;
use crate::handlers::Handlers;
use crate::transport::Transport;

/// One member slot of a [`Group`].
///
/// Built with a transport and optional per-member configuration; the group
/// instantiates the endpoint when the slot enters the list.
pub struct GroupChannel<T> {
    transport: Option<T>,
    options: Option<EndpointOptions>,
    meta: Option<Value>,
    endpoint: Option<Endpoint>,
    /// Identity across `update_channels` mutations; 0 until instantiated.
    tag: u64,
}

impl<T> GroupChannel<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport: Some(transport),
            options: None,
            meta: None,
            endpoint: None,
            tag: 0,
        }
    }

    /// Per-member metadata, overriding the group default.
    pub fn meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Per-member options, overriding the group default wholesale.
    pub fn options(mut self, options: EndpointOptions) -> Self {
        self.options = Some(options);
        self
    }

    /// The member's endpoint, once instantiated.
    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }
}

/// Fan-out over a dynamic list of endpoints sharing one function tree.
pub struct Group<T> {
    functions: Handlers,
    defaults: EndpointOptions,
    channels: Mutex<Vec<GroupChannel<T>>>,
    next_tag: AtomicU64,
}

impl<T: Transport + 'static> Group<T> {
    pub fn new(functions: Handlers) -> Self {
        Self::with_options(functions, EndpointOptions::default())
    }

    /// A group whose members default to `options`.
    pub fn with_options(functions: Handlers, options: EndpointOptions) -> Self {
        Self {
            functions,
            defaults: options,
            channels: Mutex::new(Vec::new()),
            next_tag: AtomicU64::new(1),
        }
    }

    /// Apply a mutation to the member list.
    ///
    /// Endpoints of removed entries are closed; new entries come online with
    /// the shared function tree and an internally spawned driver. Must run
    /// inside a tokio runtime.
    pub fn update_channels(&self, mutate: impl FnOnce(&mut Vec<GroupChannel<T>>)) {
        let mut channels = self.channels.lock().unwrap();
        let before: Vec<(u64, Endpoint)> = channels
            .iter()
            .filter_map(|ch| ch.endpoint.clone().map(|ep| (ch.tag, ep)))
            .collect();

        mutate(&mut channels);

        let kept: HashSet<u64> = channels.iter().map(|ch| ch.tag).collect();
        for (tag, endpoint) in before {
            if !kept.contains(&tag) {
                debug!(member = tag, "closing removed group member");
                endpoint.close();
            }
        }
        for channel in channels.iter_mut() {
            if channel.endpoint.is_none() {
                self.instantiate(channel);
            }
        }
    }

    fn instantiate(&self, channel: &mut GroupChannel<T>) {
        let Some(transport) = channel.transport.take() else {
            return;
        };
        let mut options = channel.options.take().unwrap_or_else(|| self.defaults.clone());
        if let Some(meta) = channel.meta.take() {
            options.meta = Some(meta);
        }
        channel.tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        debug!(member = channel.tag, "instantiating group member");
        let (endpoint, driver) = Endpoint::new(transport, self.functions.clone(), options);
        tokio::spawn(driver.run());
        channel.endpoint = Some(endpoint);
    }

    /// Snapshot of the member endpoints, in list order.
    pub fn clients(&self) -> Vec<Endpoint> {
        self.channels
            .lock()
            .unwrap()
            .iter()
            .filter_map(|ch| ch.endpoint.clone())
            .collect()
    }

    /// The shared function tree.
    pub fn functions(&self) -> &Handlers {
        &self.functions
    }

    /// Call every member and collect results in list order.
    ///
    /// Any member failing fails the whole call.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Vec<Value>, CallError> {
        let clients = self.clients();
        try_join_all(clients.iter().map(|client| client.call(method, args.clone()))).await
    }

    /// As [`call`](Group::call), but members missing the function contribute
    /// `Value::Null` in their slot instead of failing the list.
    pub async fn call_optional(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, CallError> {
        let clients = self.clients();
        try_join_all(
            clients
                .iter()
                .map(|client| client.call_optional(method, args.clone())),
        )
        .await
    }

    /// Fan an event out to every member; resolves once all frames are posted.
    pub async fn call_event(&self, method: &str, args: Vec<Value>) -> Result<(), CallError> {
        let clients = self.clients();
        try_join_all(
            clients
                .iter()
                .map(|client| client.call_event(method, args.clone())),
        )
        .await?;
        Ok(())
    }

    /// Navigable handle fanning out over the members.
    pub fn remote(&self, path: impl Into<String>) -> GroupMethod<'_, T> {
        GroupMethod {
            group: self,
            path: path.into(),
        }
    }
}

/// A remote method path bound to every member of a group.
pub struct GroupMethod<'a, T> {
    group: &'a Group<T>,
    path: String,
}

impl<'a, T: Transport + 'static> GroupMethod<'a, T> {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Descend one segment.
    pub fn join(&self, segment: impl AsRef<str>) -> GroupMethod<'a, T> {
        GroupMethod {
            group: self.group,
            path: format!("{}.{}", self.path, segment.as_ref()),
        }
    }

    pub async fn call(&self, args: Vec<Value>) -> Result<Vec<Value>, CallError> {
        self.group.call(&self.path, args).await
    }

    pub async fn call_optional(&self, args: Vec<Value>) -> Result<Vec<Value>, CallError> {
        self.group.call_optional(&self.path, args).await
    }

    pub async fn event(&self, args: Vec<Value>) -> Result<(), CallError> {
        self.group.call_event(&self.path, args).await
    }
}
