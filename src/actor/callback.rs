//! Completion callbacks for asynchronous actor creation.
//!
//! Both traits are implemented for matching `FnOnce` closures, so most callers just pass one.

use std::sync::Arc;

use super::Actor;
use crate::error::BackgroundError;
use crate::runtime::TaskQueue;

/// Completion of a child actor request made through
/// [`Background::get_or_create_for_current_thread`](crate::Background::get_or_create_for_current_thread).
///
/// Runs on the requesting thread, never inline with the request.
pub trait CreateCallback: Send + 'static {
    fn actor_created(self: Box<Self>, actor: &Arc<Actor>);

    fn actor_failed(self: Box<Self>);
}

impl<F> CreateCallback for F
where
    F: FnOnce(Result<Arc<Actor>, BackgroundError>) + Send + 'static,
{
    fn actor_created(self: Box<Self>, actor: &Arc<Actor>) {
        (*self)(Ok(actor.clone()))
    }

    fn actor_failed(self: Box<Self>) {
        (*self)(Err(BackgroundError::CreationFailed))
    }
}

/// Completion of [`Background::create_actor_for_same_process`](crate::Background::create_actor_for_same_process).
///
/// Runs on the main thread. On success the receiver owns an unopened parent actor and must either
/// open a child against it or hand it to [`Actor::destroy`].
pub trait SameProcessCallback: Send + 'static {
    fn success(self: Box<Self>, parent: Arc<Actor>, dispatcher: TaskQueue);

    fn failure(self: Box<Self>);
}

impl<F> SameProcessCallback for F
where
    F: FnOnce(Result<(Arc<Actor>, TaskQueue), BackgroundError>) + Send + 'static,
{
    fn success(self: Box<Self>, parent: Arc<Actor>, dispatcher: TaskQueue) {
        (*self)(Ok((parent, dispatcher)))
    }

    fn failure(self: Box<Self>) {
        (*self)(Err(BackgroundError::CreationFailed))
    }
}
