//! Serializes page renders against the single rendering surface.
//!
//! At most one job is in flight and at most one is pending. A request that
//! arrives while a job is in flight overwrites the pending slot, so a burst of
//! requests collapses into the in-flight job plus the most recent request.

use pagebridge_core::viewport::{build_text_layer, page_geometry, PageGeometry};
use pagebridge_core::{
    DocumentBackend, DocumentHandle, DocumentId, RenderImage, RenderRequest, TextLayerItem,
    ViewportState,
};
use tracing::{debug, instrument};

pub type JobId = u64;

#[derive(Debug, Clone, PartialEq)]
pub struct RenderJob {
    pub id: JobId,
    /// One-based page number.
    pub requested_page: u32,
    pub viewport: ViewportState,
    pub document: DocumentId,
}

impl RenderJob {
    fn same_target(&self, page: u32, viewport: &ViewportState, document: DocumentId) -> bool {
        self.requested_page == page && self.document == document && self.viewport.matches(viewport)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerState {
    Idle,
    Rendering(RenderJob),
    RenderingWithPending {
        current: RenderJob,
        pending: RenderJob,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    /// The caller must start rendering this job now.
    Start(RenderJob),
    Queued(JobId),
    Ignored,
}

/// Result of retiring an in-flight job.
#[derive(Debug, Clone, PartialEq)]
pub enum Finished {
    /// The job's output is what should be on screen.
    Current,
    /// A newer request arrived meanwhile; it must be started now and the
    /// retired job's output discarded.
    Superseded(RenderJob),
    /// Not the in-flight job, e.g. issued before a reset.
    Unknown,
}

#[derive(Debug)]
pub struct RenderScheduler {
    state: SchedulerState,
    next_id: JobId,
}

impl Default for RenderScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderScheduler {
    pub fn new() -> Self {
        Self {
            state: SchedulerState::Idle,
            next_id: 1,
        }
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, SchedulerState::Idle)
    }

    /// The page the scheduler is heading towards: the pending job if any,
    /// otherwise the in-flight one.
    pub fn latest_target(&self) -> Option<u32> {
        match &self.state {
            SchedulerState::Idle => None,
            SchedulerState::Rendering(job) => Some(job.requested_page),
            SchedulerState::RenderingWithPending { pending, .. } => Some(pending.requested_page),
        }
    }

    pub fn request(
        &mut self,
        page: i64,
        viewport: ViewportState,
        document: &DocumentHandle,
    ) -> RequestOutcome {
        if !document.is_loaded || !document.contains(page) {
            debug!(page, total = document.total_pages, "ignoring out-of-range render request");
            return RequestOutcome::Ignored;
        }
        // contains() bounds the value to 1..=total_pages
        let page = page as u32;

        let state = std::mem::replace(&mut self.state, SchedulerState::Idle);
        let (state, outcome) = match state {
            SchedulerState::Idle => {
                let job = self.make_job(page, viewport, document.id);
                (
                    SchedulerState::Rendering(job.clone()),
                    RequestOutcome::Start(job),
                )
            }
            SchedulerState::Rendering(current) => {
                if current.same_target(page, &viewport, document.id) {
                    (SchedulerState::Rendering(current), RequestOutcome::Ignored)
                } else {
                    let pending = self.make_job(page, viewport, document.id);
                    let id = pending.id;
                    (
                        SchedulerState::RenderingWithPending { current, pending },
                        RequestOutcome::Queued(id),
                    )
                }
            }
            SchedulerState::RenderingWithPending { current, pending } => {
                if current.same_target(page, &viewport, document.id) {
                    // the in-flight job already satisfies the latest request
                    debug!(dropped = pending.requested_page, "pending render cancelled");
                    (SchedulerState::Rendering(current), RequestOutcome::Ignored)
                } else {
                    debug!(
                        replaced = pending.requested_page,
                        page, "coalescing pending render"
                    );
                    let pending = self.make_job(page, viewport, document.id);
                    let id = pending.id;
                    (
                        SchedulerState::RenderingWithPending { current, pending },
                        RequestOutcome::Queued(id),
                    )
                }
            }
        };
        self.state = state;
        outcome
    }

    /// Retires job `id`, promoting the pending job if there is one.
    pub fn finish(&mut self, id: JobId) -> Finished {
        let state = std::mem::replace(&mut self.state, SchedulerState::Idle);
        match state {
            SchedulerState::Rendering(current) if current.id == id => Finished::Current,
            SchedulerState::RenderingWithPending { current, pending } if current.id == id => {
                self.state = SchedulerState::Rendering(pending.clone());
                Finished::Superseded(pending)
            }
            other => {
                debug!(id, "completion for unknown render job");
                self.state = other;
                Finished::Unknown
            }
        }
    }

    /// Forgets all jobs. Completions for jobs issued before the reset are
    /// reported as unknown by [`RenderScheduler::finish`].
    pub fn reset(&mut self) {
        self.state = SchedulerState::Idle;
    }

    fn make_job(&mut self, page: u32, viewport: ViewportState, document: DocumentId) -> RenderJob {
        let id = self.next_id;
        self.next_id += 1;
        RenderJob {
            id,
            requested_page: page,
            viewport,
            document,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RenderError {
    #[error("failed to render page {page}: {message}")]
    Page { page: u32, message: String },
    #[error("render task for page {page} did not complete")]
    Aborted { page: u32 },
}

/// Output of one job, ready to be put on screen.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub image: RenderImage,
    pub geometry: PageGeometry,
    pub text_layer: Vec<TextLayerItem>,
}

/// Rasterizes the job's page and derives its text layer. Blocking.
#[instrument(skip(backend, job), fields(page = job.requested_page, scale = job.viewport.scale))]
pub fn execute(backend: &dyn DocumentBackend, job: &RenderJob) -> Result<RenderedPage, RenderError> {
    let page = job.requested_page;
    let page_index = page.saturating_sub(1) as usize;
    let failed = |err: anyhow::Error| RenderError::Page {
        page,
        message: format!("{err:#}"),
    };

    let size = backend.page_size(page_index).map_err(failed)?;
    let geometry = page_geometry(size, &job.viewport);
    let image = backend
        .render_page(RenderRequest {
            page_index,
            scale: job.viewport.render_scale(),
        })
        .map_err(failed)?;
    let runs = backend.text_runs(page_index).map_err(failed)?;

    Ok(RenderedPage {
        image,
        geometry,
        text_layer: build_text_layer(&runs, &job.viewport),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn document(total_pages: u32) -> DocumentHandle {
        DocumentHandle {
            id: Uuid::new_v4(),
            total_pages,
            is_loaded: true,
        }
    }

    fn viewport() -> ViewportState {
        ViewportState::new(800.0, 1000.0, 1.0)
    }

    fn started(outcome: RequestOutcome) -> RenderJob {
        match outcome {
            RequestOutcome::Start(job) => job,
            other => panic!("expected a started job, got {:?}", other),
        }
    }

    #[test]
    fn burst_collapses_to_in_flight_and_last_request() {
        let doc = document(10);
        let mut scheduler = RenderScheduler::new();

        let first = started(scheduler.request(2, viewport(), &doc));
        for page in 3..=5 {
            assert!(matches!(
                scheduler.request(page, viewport(), &doc),
                RequestOutcome::Queued(_)
            ));
        }
        assert_eq!(scheduler.latest_target(), Some(5));

        let next = match scheduler.finish(first.id) {
            Finished::Superseded(next) => next,
            other => panic!("expected the pending job to be promoted, got {:?}", other),
        };
        assert_eq!(next.requested_page, 5);

        assert_eq!(scheduler.finish(next.id), Finished::Current);
        assert!(scheduler.is_idle());
    }

    #[test]
    fn out_of_range_requests_are_ignored() {
        let doc = document(3);
        let mut scheduler = RenderScheduler::new();
        assert_eq!(scheduler.request(0, viewport(), &doc), RequestOutcome::Ignored);
        assert_eq!(scheduler.request(4, viewport(), &doc), RequestOutcome::Ignored);
        assert_eq!(scheduler.request(-1, viewport(), &doc), RequestOutcome::Ignored);
        assert!(scheduler.is_idle());

        let unloaded = DocumentHandle {
            is_loaded: false,
            ..doc
        };
        assert_eq!(scheduler.request(1, viewport(), &unloaded), RequestOutcome::Ignored);
    }

    #[test]
    fn identical_in_flight_request_is_a_no_op() {
        let doc = document(5);
        let mut scheduler = RenderScheduler::new();
        let job = started(scheduler.request(2, viewport(), &doc));
        assert_eq!(scheduler.request(2, viewport(), &doc), RequestOutcome::Ignored);
        assert_eq!(scheduler.state(), &SchedulerState::Rendering(job.clone()));

        // same page under a different zoom is a new job
        let zoomed = viewport().with_scale(1.5);
        assert!(matches!(
            scheduler.request(2, zoomed, &doc),
            RequestOutcome::Queued(_)
        ));
    }

    #[test]
    fn returning_to_in_flight_target_drops_pending() {
        let doc = document(5);
        let mut scheduler = RenderScheduler::new();
        let job = started(scheduler.request(2, viewport(), &doc));
        scheduler.request(3, viewport(), &doc);
        assert_eq!(scheduler.request(2, viewport(), &doc), RequestOutcome::Ignored);
        assert_eq!(scheduler.state(), &SchedulerState::Rendering(job.clone()));

        assert_eq!(scheduler.finish(job.id), Finished::Current);
    }

    #[test]
    fn completions_after_reset_are_unknown() {
        let doc = document(5);
        let mut scheduler = RenderScheduler::new();
        let job = started(scheduler.request(1, viewport(), &doc));
        scheduler.reset();
        let fresh = started(scheduler.request(1, viewport(), &document(2)));

        assert_eq!(scheduler.finish(job.id), Finished::Unknown);
        assert_eq!(scheduler.state(), &SchedulerState::Rendering(fresh));
    }

    #[test]
    fn job_ids_are_unique() {
        let doc = document(5);
        let mut scheduler = RenderScheduler::new();
        let a = started(scheduler.request(1, viewport(), &doc));
        scheduler.finish(a.id);
        let b = started(scheduler.request(1, viewport(), &doc));
        assert_ne!(a.id, b.id);
    }
}
