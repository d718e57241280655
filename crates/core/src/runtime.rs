//! Async control loop
//!
//! [`ViewerRuntime::start`] spawns one tokio task that owns the
//! [`ViewerSession`]. Commands from the [`ViewerHandle`], completions from
//! spawned fetch and render futures, and a single deadline timer are all
//! funnelled through one `select!`, so session state is only ever touched
//! from that task.

use std::collections::HashMap;
use std::future;
use std::sync::Arc;
use std::time::Instant;

use folio_cache::{CacheBound, PageNumber, PagePayload};
use folio_scheduler::{PriorityBand, TaskId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::config::ViewerConfig;
use crate::error::{FetchError, PageError, RenderError, ViewerError, ViewerResult};
use crate::session::{Effect, PageStatus, ScrollSample, Step, ViewerEvent, ViewerSession};
use crate::source::{DocumentId, DocumentInfo, DocumentMetadata, PageFetcher, PageRenderer};
use crate::stats::SessionStats;

type Reply<T> = oneshot::Sender<T>;

/// Session time follows tokio's clock so paused-clock tests stay deterministic.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => future::pending().await,
    }
}

enum ViewerCommand<R> {
    ViewportChanged {
        current_page: PageNumber,
        visible_pages: Vec<PageNumber>,
        scrolling: bool,
        reply: Reply<ViewerResult<()>>,
    },
    ZoomChanged {
        scale: f32,
        reply: Reply<ViewerResult<()>>,
    },
    RotationChanged {
        degrees: i32,
        reply: Reply<ViewerResult<()>>,
    },
    RequestPage {
        page: PageNumber,
        priority: PriorityBand,
        reply: Reply<ViewerResult<()>>,
    },
    RetryRender {
        page: PageNumber,
        reply: Reply<ViewerResult<()>>,
    },
    SetZoomInProgress(bool),
    MemoryPressure,
    SetCacheBound(CacheBound),
    RecalculateLayout {
        reply: Reply<ViewerResult<()>>,
    },
    GetPage {
        page: PageNumber,
        reply: Reply<Option<PagePayload>>,
    },
    Rendered {
        page: PageNumber,
        reply: Reply<Option<R>>,
    },
    Status {
        page: PageNumber,
        reply: Reply<(PageStatus, Option<PageError>)>,
    },
    Stats {
        reply: Reply<SessionStats>,
    },
    Stop,
}

enum Completion<R> {
    Fetch {
        task: TaskId,
        result: Result<PagePayload, FetchError>,
    },
    Render {
        task: TaskId,
        result: Result<R, RenderError>,
    },
    Layout {
        result: Result<DocumentInfo, FetchError>,
        reply: Reply<ViewerResult<()>>,
    },
}

/// Entry point for running a viewer session on tokio.
pub struct ViewerRuntime;

impl ViewerRuntime {
    /// Consult the metadata provider, build the session and spawn its control
    /// loop.
    ///
    /// Returns the handle used to drive the viewer and the receiving end of
    /// its [`ViewerEvent`] stream. Must be called from within a tokio runtime.
    pub async fn start<F, Rn, M>(
        config: ViewerConfig,
        document: DocumentId,
        fetcher: Arc<F>,
        renderer: Arc<Rn>,
        metadata: Arc<M>,
    ) -> ViewerResult<(ViewerHandle<Rn::Output>, mpsc::UnboundedReceiver<ViewerEvent>)>
    where
        F: PageFetcher,
        Rn: PageRenderer,
        M: DocumentMetadata,
    {
        config.validate()?;
        let info = metadata
            .document_info(&document)
            .await
            .map_err(ViewerError::Metadata)?;
        let session = ViewerSession::new(config, document, info)?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let control = ControlLoop {
            session,
            fetcher,
            renderer,
            metadata,
            events: event_tx,
            completions: completion_tx,
            fetch_tasks: HashMap::new(),
            render_tasks: HashMap::new(),
        };
        let task = tokio::spawn(control.run(command_rx, completion_rx));

        Ok((
            ViewerHandle {
                commands: command_tx,
                task,
            },
            event_rx,
        ))
    }
}

/// Handle to a running viewer.
///
/// Every method is a message to the control loop. Once the loop has stopped
/// they fail with [`ViewerError::Stopped`].
pub struct ViewerHandle<R> {
    commands: mpsc::UnboundedSender<ViewerCommand<R>>,
    task: JoinHandle<()>,
}

impl<R: Send + 'static> ViewerHandle<R> {
    /// Report the viewport. `scrolling` marks the change as a scroll sample
    /// rather than a jump.
    pub async fn viewport_changed(
        &self,
        current_page: PageNumber,
        visible_pages: impl IntoIterator<Item = PageNumber>,
        scrolling: bool,
    ) -> ViewerResult<()> {
        let visible_pages = visible_pages.into_iter().collect();
        self.call(|reply| ViewerCommand::ViewportChanged {
            current_page,
            visible_pages,
            scrolling,
            reply,
        })
        .await?
    }

    /// Set the zoom factor; visible pages are re-rendered first.
    pub async fn zoom(&self, scale: f32) -> ViewerResult<()> {
        self.call(|reply| ViewerCommand::ZoomChanged { scale, reply })
            .await?
    }

    /// Set the rotation in degrees, normalized to quarter turns.
    pub async fn rotate(&self, degrees: i32) -> ViewerResult<()> {
        self.call(|reply| ViewerCommand::RotationChanged { degrees, reply })
            .await?
    }

    /// Explicitly request `page` at `priority`.
    pub async fn request_page(&self, page: PageNumber, priority: PriorityBand) -> ViewerResult<()> {
        self.call(|reply| ViewerCommand::RequestPage {
            page,
            priority,
            reply,
        })
        .await?
    }

    /// Clear a failure on `page` and render it again.
    pub async fn retry_render(&self, page: PageNumber) -> ViewerResult<()> {
        self.call(|reply| ViewerCommand::RetryRender { page, reply })
            .await?
    }

    /// Re-consult the metadata provider and adopt the new page count.
    pub async fn recalculate_layout(&self) -> ViewerResult<()> {
        self.call(|reply| ViewerCommand::RecalculateLayout { reply })
            .await?
    }

    /// Pause slot reclamation while a zoom gesture runs.
    pub fn set_zoom_in_progress(&self, in_progress: bool) -> ViewerResult<()> {
        self.send(ViewerCommand::SetZoomInProgress(in_progress))
    }

    /// Evict every non-visible page outside the keep window.
    pub fn memory_pressure(&self) -> ViewerResult<()> {
        self.send(ViewerCommand::MemoryPressure)
    }

    /// Change the cache bound at runtime.
    pub fn set_cache_bound(&self, bound: CacheBound) -> ViewerResult<()> {
        self.send(ViewerCommand::SetCacheBound(bound))
    }

    /// Cached payload for `page`.
    pub async fn get_page(&self, page: PageNumber) -> ViewerResult<Option<PagePayload>> {
        self.call(|reply| ViewerCommand::GetPage { page, reply }).await
    }

    /// Rendered resource for `page`.
    pub async fn rendered(&self, page: PageNumber) -> ViewerResult<Option<R>> {
        self.call(|reply| ViewerCommand::Rendered { page, reply }).await
    }

    /// Fetch status of `page` and its persistent error, if any.
    pub async fn status(&self, page: PageNumber) -> ViewerResult<(PageStatus, Option<PageError>)> {
        self.call(|reply| ViewerCommand::Status { page, reply }).await
    }

    /// Snapshot of every counter.
    pub async fn stats(&self) -> ViewerResult<SessionStats> {
        self.call(|reply| ViewerCommand::Stats { reply }).await
    }

    /// Abort all outstanding work and wait for the control loop to exit.
    pub async fn stop(self) {
        // The loop may already be gone; joining is all that is left then.
        let _ = self.commands.send(ViewerCommand::Stop);
        if let Err(error) = self.task.await {
            warn!(target: "folio::runtime", %error, "control loop ended abnormally");
        }
    }

    fn send(&self, command: ViewerCommand<R>) -> ViewerResult<()> {
        self.commands.send(command).map_err(|_| ViewerError::Stopped)
    }

    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> ViewerCommand<R>) -> ViewerResult<T> {
        let (reply, response) = oneshot::channel();
        self.send(command(reply))?;
        response.await.map_err(|_| ViewerError::Stopped)
    }
}

struct ControlLoop<F, Rn: PageRenderer, M> {
    session: ViewerSession<Rn::Output>,
    fetcher: Arc<F>,
    renderer: Arc<Rn>,
    metadata: Arc<M>,
    events: mpsc::UnboundedSender<ViewerEvent>,
    completions: mpsc::UnboundedSender<Completion<Rn::Output>>,
    fetch_tasks: HashMap<TaskId, AbortHandle>,
    render_tasks: HashMap<TaskId, AbortHandle>,
}

impl<F, Rn, M> ControlLoop<F, Rn, M>
where
    F: PageFetcher,
    Rn: PageRenderer,
    M: DocumentMetadata,
{
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<ViewerCommand<Rn::Output>>,
        mut completions: mpsc::UnboundedReceiver<Completion<Rn::Output>>,
    ) {
        info!(target: "folio::runtime", document = %self.session.document(), "control loop started");

        loop {
            let deadline = self.session.next_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(ViewerCommand::Stop) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(completion) = completions.recv() => self.handle_completion(completion),
                () = wait_until(deadline) => {
                    let step = self.session.on_timer(now());
                    self.apply(step);
                }
            }
        }

        let step = self.session.shutdown();
        self.apply(step);
        for (_, handle) in self.fetch_tasks.drain().chain(self.render_tasks.drain()) {
            handle.abort();
        }
        info!(target: "folio::runtime", document = %self.session.document(), "control loop stopped");
    }

    fn handle_command(&mut self, command: ViewerCommand<Rn::Output>) {
        let now = now();
        match command {
            ViewerCommand::ViewportChanged {
                current_page,
                visible_pages,
                scrolling,
                reply,
            } => {
                let sample = scrolling.then_some(ScrollSample { at: now });
                let result = self
                    .session
                    .on_viewport_changed(current_page, visible_pages, sample, now);
                self.respond(result, reply);
            }
            ViewerCommand::ZoomChanged { scale, reply } => {
                let result = self.session.on_zoom_changed(scale, now);
                self.respond(result, reply);
            }
            ViewerCommand::RotationChanged { degrees, reply } => {
                let result = self.session.on_rotation_changed(degrees, now);
                self.respond(result, reply);
            }
            ViewerCommand::RequestPage {
                page,
                priority,
                reply,
            } => {
                let result = self.session.request_page(page, priority, now);
                self.respond(result, reply);
            }
            ViewerCommand::RetryRender { page, reply } => {
                let result = self.session.retry_render(page, now);
                self.respond(result, reply);
            }
            ViewerCommand::SetZoomInProgress(in_progress) => {
                let step = self.session.set_zoom_in_progress(in_progress, now);
                self.apply(step);
            }
            ViewerCommand::MemoryPressure => {
                let step = self.session.on_memory_pressure();
                self.apply(step);
            }
            ViewerCommand::SetCacheBound(bound) => {
                let step = self.session.set_cache_bound(bound, now);
                self.apply(step);
            }
            ViewerCommand::RecalculateLayout { reply } => {
                // Runs off the loop like any other collaborator call.
                let lookup = self.metadata.document_info(self.session.document());
                let completions = self.completions.clone();
                tokio::spawn(async move {
                    let result = lookup.await;
                    let _ = completions.send(Completion::Layout { result, reply });
                });
            }
            ViewerCommand::GetPage { page, reply } => {
                let _ = reply.send(self.session.get_page(page));
            }
            ViewerCommand::Rendered { page, reply } => {
                let _ = reply.send(self.session.rendered(page).cloned());
            }
            ViewerCommand::Status { page, reply } => {
                let status = self.session.page_status(page);
                let error = self.session.page_error(page).cloned();
                let _ = reply.send((status, error));
            }
            ViewerCommand::Stats { reply } => {
                let _ = reply.send(self.session.stats());
            }
            ViewerCommand::Stop => {}
        }
    }

    fn handle_completion(&mut self, completion: Completion<Rn::Output>) {
        let now = now();
        match completion {
            Completion::Fetch { task, result } => {
                self.fetch_tasks.remove(&task);
                let step = self.session.on_fetch_complete(task, result, now);
                self.apply(step);
            }
            Completion::Render { task, result } => {
                self.render_tasks.remove(&task);
                let step = self.session.on_render_complete(task, result, now);
                self.apply(step);
            }
            Completion::Layout { result, reply } => {
                let result = match result {
                    Ok(info) => self.session.relayout(info, now),
                    Err(error) => Err(ViewerError::Metadata(error)),
                };
                self.respond(result, reply);
            }
        }
    }

    fn respond(&mut self, result: ViewerResult<Step>, reply: Reply<ViewerResult<()>>) {
        let result = result.map(|step| self.apply(step));
        let _ = reply.send(result);
    }

    /// Publish events and carry out effects.
    fn apply(&mut self, step: Step) {
        for event in step.events {
            // Nobody listening is fine.
            let _ = self.events.send(event);
        }

        for effect in step.effects {
            match effect {
                Effect::StartFetch { task, page, token } => {
                    let fetch = self.fetcher.fetch(self.session.document(), page, token);
                    let completions = self.completions.clone();
                    let handle = tokio::spawn(async move {
                        let result = fetch.await;
                        let _ = completions.send(Completion::Fetch { task, result });
                    });
                    self.fetch_tasks.insert(task, handle.abort_handle());
                }
                Effect::AbortFetch { task, page } => {
                    if let Some(handle) = self.fetch_tasks.remove(&task) {
                        handle.abort();
                    }
                    debug!(target: "folio::runtime", task, page, "fetch aborted");
                    let step = self
                        .session
                        .on_fetch_complete(task, Err(FetchError::Canceled), now());
                    self.apply(step);
                }
                Effect::StartRender {
                    task,
                    page,
                    payload,
                    params,
                    token,
                } => {
                    let render = self.renderer.render(page, payload, params, token);
                    let completions = self.completions.clone();
                    let handle = tokio::spawn(async move {
                        let result = render.await;
                        let _ = completions.send(Completion::Render { task, result });
                    });
                    self.render_tasks.insert(task, handle.abort_handle());
                }
                Effect::AbortRender { task, page } => {
                    if let Some(handle) = self.render_tasks.remove(&task) {
                        handle.abort();
                    }
                    debug!(target: "folio::runtime", task, page, "render aborted");
                    let step = self
                        .session
                        .on_render_complete(task, Err(RenderError::Canceled), now());
                    self.apply(step);
                }
            }
        }
    }
}
