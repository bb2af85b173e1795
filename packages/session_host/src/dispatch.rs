//! Per-session execution context.
//!
//! Every operation against a session's scope is sent to that session's
//! dispatcher task and runs there one at a time, in submission order.
//! The dispatcher stops on `Terminate` or once every session handle, and
//! with it the command sender, is gone.

use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::SessionError;
use crate::scope::ScopeProvider;

pub(crate) type Job = Box<dyn FnOnce(Arc<ScopeProvider>) -> BoxFuture<'static, ()> + Send>;

/// Commands that can be sent to a session dispatcher
pub(crate) enum SessionCommand {
    Run(Job),
    Terminate,
}

/// Box `op` into a job that reports its result on the returned receiver.
///
/// Dropping the job unrun drops the sender, which the caller observes as a
/// closed receiver.
pub(crate) fn job<F, Fut, T>(op: F) -> (Job, oneshot::Receiver<Result<T, SessionError>>)
where
    F: FnOnce(Arc<ScopeProvider>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, SessionError>> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let job: Job = Box::new(move |scope| {
        async move {
            let result = op(scope).await;
            let _ = tx.send(result);
        }
        .boxed()
    });
    (job, rx)
}

/// The dispatcher task that owns a session's scope
pub(crate) struct SessionDispatcher {
    scope: Arc<ScopeProvider>,
    receiver: mpsc::Receiver<SessionCommand>,
}

impl SessionDispatcher {
    pub(crate) fn spawn(
        runtime: &Handle,
        scope: Arc<ScopeProvider>,
        receiver: mpsc::Receiver<SessionCommand>,
    ) {
        let dispatcher = Self { scope, receiver };
        runtime.spawn(async move {
            dispatcher.run().await;
        });
    }

    async fn run(mut self) {
        let session_id = self.scope.session_id();
        debug!(session_id = %session_id, "Session dispatcher started");

        while let Some(command) = self.receiver.recv().await {
            match command {
                SessionCommand::Run(job) => {
                    let live = self.scope.session().is_ok_and(|s| !s.is_terminated());
                    if !live {
                        debug!(session_id = %session_id, "Dropping operation queued after termination");
                        continue;
                    }
                    job(self.scope.clone()).await;
                }
                SessionCommand::Terminate => break,
            }
        }

        self.scope.dispose();
        debug!(session_id = %session_id, "Session dispatcher stopped");
    }
}
