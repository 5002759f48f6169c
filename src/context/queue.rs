//! Confined execution: a context owned by a private serial queue.

use super::object_context::ObjectContext;
use crate::core::{ContextId, DaoError, Result};
use crate::dao::Dao;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};

type Job = Box<dyn FnOnce(&mut ObjectContext) + Send + 'static>;

/// Handle to a context running on its own task.
///
/// Jobs run one at a time in submission order. Cloning the handle shares the
/// same queue; the task ends once every handle is dropped.
#[derive(Clone)]
pub struct ContextHandle {
    id: ContextId,
    jobs: mpsc::UnboundedSender<Job>,
}

impl std::fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextHandle")
            .field("id", &self.id)
            .field("closed", &self.jobs.is_closed())
            .finish()
    }
}

impl ContextHandle {
    /// Move `context` onto a new tokio task. Must be called inside a runtime.
    pub fn spawn(mut context: ObjectContext) -> Self {
        let id = context.id();
        let (jobs, mut queue) = mpsc::unbounded_channel::<Job>();

        tokio::spawn(async move {
            while let Some(job) = queue.recv().await {
                job(&mut context);
            }
            log::debug!("{} queue drained, context dropped", id);
        });

        Self { id, jobs }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.jobs.is_closed()
    }

    /// Enqueue `work` and return immediately. Await the handle for the result.
    ///
    /// # Example
    ///
    /// ```
    /// # use graphdao::prelude::*;
    /// # tokio_test::block_on(async {
    /// let catalog = EntityCatalog::new()
    ///     .with_entity(EntityDescriptor::new("Tag").required("label", AttributeType::Text))?;
    /// let stack = DataStack::in_memory(catalog)?;
    /// let handle = stack.spawn_background_context();
    ///
    /// let tag = handle
    ///     .perform(|ctx| -> graphdao::Result<ObjectId> {
    ///         let tag = ctx.insert("Tag")?;
    ///         ctx.set_value(tag, "label", "rust")?;
    ///         ctx.save()?;
    ///         Ok(tag)
    ///     })
    ///     .await??;
    /// assert!(stack.store().record(tag)?.is_some());
    /// # Ok::<(), DaoError>(())
    /// # }).unwrap();
    /// ```
    pub fn perform<F, R>(&self, work: F) -> PerformHandle<R>
    where
        F: FnOnce(&mut ObjectContext) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply, result) = oneshot::channel();
        let job: Job = Box::new(move |context| {
            // The caller may have dropped its handle; the work still ran
            let _ = reply.send(work(context));
        });
        if self.jobs.send(job).is_err() {
            log::warn!("{} rejected a job: queue is closed", self.id);
        }
        PerformHandle { result }
    }

    /// Like `perform`, with the context wrapped in a `Dao`
    pub fn perform_dao<F, R>(&self, work: F) -> PerformHandle<R>
    where
        F: FnOnce(&mut Dao<'_>) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.perform(move |context| {
            let mut dao = Dao::new(context);
            work(&mut dao)
        })
    }
}

/// Pending result of a job submitted with `ContextHandle::perform`.
///
/// Dropping it does not cancel the job.
#[must_use = "the job runs either way; await the handle to observe its result"]
pub struct PerformHandle<R> {
    result: oneshot::Receiver<R>,
}

impl<R> Future for PerformHandle<R> {
    type Output = Result<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.result)
            .poll(cx)
            .map(|outcome| outcome.map_err(|_| DaoError::ContextClosed))
    }
}
