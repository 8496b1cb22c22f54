//! Watches a Kubernetes Resource for changes, with error recovery

use educe::Educe;
use futures::{stream::BoxStream, Stream, StreamExt};
use kontrol_client::Api;
use kontrol_core::{
    params::{ListParams, WatchParams},
    Resource, ResourceExt, WatchEvent,
};
use serde::de::DeserializeOwned;
use std::{clone::Clone, fmt::Debug};
use thiserror::Error;

/// Errors that can occur while driving a [`watcher`] stream
#[derive(Error, Debug)]
pub enum Error {
    /// The initial LIST call failed
    #[error("failed to perform initial object list: {0}")]
    InitialListFailed(#[source] kontrol_client::Error),
    /// The watch call failed to even start
    #[error("failed to start watching object: {0}")]
    WatchStartFailed(#[source] kontrol_client::Error),
    /// The apiserver returned an error event on the watch stream
    #[error("error returned by apiserver during watch: {0}")]
    WatchError(#[source] kontrol_core::ErrorResponse),
    /// The watch stream itself failed (transport error, decode error, ...)
    #[error("watch stream failed: {0}")]
    WatchFailed(#[source] kontrol_client::Error),
    /// A [`watch_object`] watch unexpectedly observed more than one matching object
    #[error("watch_object observed more than one matching object")]
    TooManyObjects,
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone)]
/// Watch events returned from the [`watcher`]
pub enum Event<K> {
    /// An object was added or modified
    Applied(K),
    /// An object was deleted
    ///
    /// NOTE: This should not be used for managing persistent state elsewhere, since
    /// events may be lost if the watcher is unavailable. Use Finalizers instead.
    Deleted(K),
    /// The watch stream was restarted, so `Deleted` events may have been missed
    ///
    /// Should be used as a signal to replace the store contents atomically.
    ///
    /// Any objects that were previously [`Applied`](Event::Applied) but are not listed in this event
    /// should be assumed to have been [`Deleted`](Event::Deleted).
    Restarted(Vec<K>),
}

impl<K> Event<K> {
    /// Flattens out all objects that were added or modified in the event.
    ///
    /// `Deleted` objects are ignored, all objects mentioned by `Restarted` events are
    /// emitted individually.
    pub fn into_iter_applied(self) -> impl Iterator<Item = K> {
        match self {
            Event::Applied(obj) => vec![obj],
            Event::Deleted(_) => vec![],
            Event::Restarted(objs) => objs,
        }
        .into_iter()
    }

    /// Flattens out all objects that were added, modified, or deleted in the event.
    ///
    /// Note that `Deleted` events may be missed when restarting the stream. Use finalizers
    /// or owner references instead if you care about cleaning up external resources after
    /// deleted objects.
    pub fn into_iter_touched(self) -> impl Iterator<Item = K> {
        match self {
            Event::Applied(obj) | Event::Deleted(obj) => vec![obj],
            Event::Restarted(objs) => objs,
        }
        .into_iter()
    }
}

#[derive(Educe)]
#[educe(Debug)]
/// The internal finite state machine driving the [`watcher`]
enum State<K: Clone> {
    /// The Watcher is empty, and the next [`poll`](Stream::poll_next) will start the initial LIST to get all existing objects
    Empty,
    /// The initial LIST was successful, so we should move on to starting the actual watch.
    InitListed { resource_version: String },
    /// The watch is in progress, from this point we just return events from the server.
    ///
    /// If the connection is disrupted then we propagate the error but try to restart the watch stream by
    /// returning to the `InitListed` state.
    /// If we fall out of the K8s watch window then we propagate the error and fall back doing a re-list
    /// with `Empty`.
    Watching {
        resource_version: String,
        #[educe(Debug(ignore))]
        stream: BoxStream<'static, kontrol_client::Result<WatchEvent<K>>>,
    },
}

/// Progresses the watcher a single step, returning (event, state)
///
/// This function should be trampolined: if event == `None`
/// then the function should be called again until it returns a Some.
async fn step_trampolined<K>(
    api: &Api<K>,
    watch_params: &WatchParams,
    state: State<K>,
) -> (Option<Result<Event<K>>>, State<K>)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    match state {
        State::Empty => {
            let lp = ListParams {
                label_selector: watch_params.label_selector.clone(),
                field_selector: watch_params.field_selector.clone(),
                ..ListParams::default()
            };
            match api.list(&lp).await {
                Ok(list) => (
                    Some(Ok(Event::Restarted(list.items))),
                    State::InitListed {
                        resource_version: list.metadata.resource_version.unwrap_or_default(),
                    },
                ),
                Err(err) => (Some(Err(Error::InitialListFailed(err))), State::Empty),
            }
        }
        State::InitListed { resource_version } => match api.watch(watch_params, &resource_version).await {
            Ok(stream) => (
                None,
                State::Watching {
                    resource_version,
                    stream: stream.boxed(),
                },
            ),
            Err(err) => (
                Some(Err(Error::WatchStartFailed(err))),
                State::InitListed { resource_version },
            ),
        },
        State::Watching {
            resource_version,
            mut stream,
        } => match stream.next().await {
            Some(Ok(WatchEvent::Added(obj))) | Some(Ok(WatchEvent::Modified(obj))) => {
                let resource_version = obj.resource_version().unwrap_or(resource_version);
                (
                    Some(Ok(Event::Applied(obj))),
                    State::Watching { resource_version, stream },
                )
            }
            Some(Ok(WatchEvent::Deleted(obj))) => {
                let resource_version = obj.resource_version().unwrap_or(resource_version);
                (
                    Some(Ok(Event::Deleted(obj))),
                    State::Watching { resource_version, stream },
                )
            }
            Some(Ok(WatchEvent::Bookmark(bm))) => (
                None,
                State::Watching {
                    resource_version: bm.metadata.resource_version,
                    stream,
                },
            ),
            Some(Ok(WatchEvent::Error(err))) => {
                // HTTP GONE, means we have desynced and need to start over and re-list :(
                let new_state = if err.code == 410 {
                    State::Empty
                } else {
                    State::Watching { resource_version, stream }
                };
                (Some(Err(Error::WatchError(err))), new_state)
            }
            Some(Err(err)) => (
                Some(Err(Error::WatchFailed(err))),
                State::Watching { resource_version, stream },
            ),
            None => (None, State::InitListed { resource_version }),
        },
    }
}

/// Trampoline helper for `step_trampolined`
async fn step<K>(api: &Api<K>, watch_params: &WatchParams, mut state: State<K>) -> (Result<Event<K>>, State<K>)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    loop {
        match step_trampolined(api, watch_params, state).await {
            (Some(result), new_state) => return (result, new_state),
            (None, new_state) => state = new_state,
        }
    }
}

/// Watches a Kubernetes resource for changes, automatically relisting on desync
///
/// Compared to [`Api::watch`], this automatically tries to recover the stream upon errors.
///
/// Errors from the underlying watch are propagated, after which the stream will go into recovery
/// mode on the next poll. This is the informer-cache's sole input: [`reflector`](super::reflector)
/// consumes exactly this stream to populate and maintain a [`Store`](super::reflector::Store).
///
/// # Recovery
///
/// If the watch connection is interrupted then we attempt to restart the watch using the last
/// resource version that we have seen on the stream. If this is successful then the stream is
/// simply resumed from where it left off. If this fails because the resource version is no
/// longer valid then we start over with a new list, starting with an [`Event::Restarted`].
pub fn watcher<K>(api: Api<K>, watch_params: WatchParams) -> impl Stream<Item = Result<Event<K>>> + Send
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    futures::stream::unfold((api, watch_params, State::Empty), |(api, watch_params, state)| async {
        let (event, state) = step(&api, &watch_params, state).await;
        Some((event, (api, watch_params, state)))
    })
}

/// Watches a single named object, collapsing the collection watch down to `Some(obj)` while it
/// exists and `None` once it is deleted or absent.
///
/// Used by the leader-election [`Elector`](super::lease::Elector) to watch its own `Lease`.
pub fn watch_object<K>(api: Api<K>, name: &str) -> impl Stream<Item = Result<Option<K>>> + Send
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let field_selector = format!("metadata.name={name}");
    let watch_params = WatchParams::default().fields(&field_selector);
    watcher(api, watch_params).map(|event| {
        event.map(|event| match event {
            Event::Deleted(_) => None,
            Event::Restarted(objs) => objs.into_iter().next(),
            Event::Applied(obj) => Some(obj),
        })
    })
}
