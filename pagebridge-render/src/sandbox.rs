//! The sandbox event loop.
//!
//! One task owns the [`SandboxSession`] and multiplexes three sources: inbound
//! host messages, pointer input and completions of its own background work
//! (document loads and renders). Rasterization runs on the blocking pool and
//! reports back through the completion channel, so the loop never waits on a
//! render and a second request only touches the pending slot.

use std::sync::Arc;

use pagebridge_core::{
    Channel, ConsoleLevel, Delivery, DocumentBackend, DocumentProvider, HostMessage, Inbox,
    NavigationCommand, Outbox, SandboxEvent, ScriptTarget, ViewerConfig,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::commands::CommandTable;
use crate::gesture::{GestureController, GestureIntent, PointerEvent};
use crate::loader::{self, LoadError, LoadRequest};
use crate::scheduler::{self, RenderError, RenderJob, RenderedPage, RequestOutcome};
use crate::session::{Frame, SandboxSession};

#[derive(Debug, Clone)]
pub enum SandboxInput {
    Pointer(PointerEvent),
    Shutdown,
}

enum Completion {
    Load {
        generation: u64,
        result: Result<Arc<dyn DocumentBackend>, LoadError>,
    },
    Render {
        job: RenderJob,
        result: Result<RenderedPage, RenderError>,
    },
}

enum LoopEvent {
    Inbound(Delivery),
    Input(SandboxInput),
    Completed(Completion),
    Stop,
}

/// Host-side handle to a running sandbox.
pub struct SandboxHandle {
    input: mpsc::UnboundedSender<SandboxInput>,
    frames: watch::Receiver<Option<Arc<Frame>>>,
    commands: Arc<CommandTable>,
    task: JoinHandle<()>,
}

impl SandboxHandle {
    pub fn send_pointer(&self, event: PointerEvent) {
        if self.input.send(SandboxInput::Pointer(event)).is_err() {
            debug!("sandbox is gone, pointer event dropped");
        }
    }

    /// The rendering surface. `None` until the first page has rendered.
    pub fn frames(&self) -> watch::Receiver<Option<Arc<Frame>>> {
        self.frames.clone()
    }

    pub fn script_target(&self) -> Arc<dyn ScriptTarget> {
        self.commands.clone()
    }

    pub async fn shutdown(self) {
        let _ = self.input.send(SandboxInput::Shutdown);
        if let Err(err) = self.task.await {
            warn!(error = %err, "sandbox task ended abnormally");
        }
    }
}

pub struct Sandbox<P: DocumentProvider + 'static> {
    provider: Arc<P>,
    config: ViewerConfig,
    session: SandboxSession,
    gestures: GestureController,
    inbox: Inbox,
    outbox: Outbox,
    commands: Arc<CommandTable>,
    input_rx: mpsc::UnboundedReceiver<SandboxInput>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    frames_tx: watch::Sender<Option<Arc<Frame>>>,
    load_task: Option<JoinHandle<()>>,
    load_generation: u64,
}

impl<P: DocumentProvider + 'static> Sandbox<P> {
    /// Starts a sandbox that reads host messages from `inbox` and emits its
    /// events on `outbox`. Must be called inside a tokio runtime.
    pub fn spawn(provider: Arc<P>, config: ViewerConfig, inbox: Inbox, outbox: Outbox) -> SandboxHandle {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = watch::channel(None);

        let commands = Arc::new(CommandTable::new(inbox.register_transport(Channel::Document)));
        commands.export_fallbacks();

        let sandbox = Sandbox {
            provider,
            session: SandboxSession::new(&config.layout, config.zoom.limits()),
            gestures: GestureController::new(&config.gestures),
            config,
            inbox,
            outbox,
            commands: Arc::clone(&commands),
            input_rx,
            completions_tx,
            completions_rx,
            frames_tx,
            load_task: None,
            load_generation: 0,
        };
        let task = tokio::spawn(sandbox.run());

        SandboxHandle {
            input: input_tx,
            frames: frames_rx,
            commands,
            task,
        }
    }

    async fn run(mut self) {
        self.console(ConsoleLevel::Log, "sandbox started, waiting for a document".into());
        loop {
            let event = tokio::select! {
                delivery = self.inbox.recv() => match delivery {
                    Some(delivery) => LoopEvent::Inbound(delivery),
                    None => LoopEvent::Stop,
                },
                input = self.input_rx.recv() => match input {
                    Some(input) => LoopEvent::Input(input),
                    None => LoopEvent::Stop,
                },
                Some(done) = self.completions_rx.recv() => LoopEvent::Completed(done),
            };

            match event {
                LoopEvent::Inbound(delivery) => {
                    if let Some(message) = pagebridge_core::transport::on_receive(&delivery) {
                        self.on_message(message);
                    }
                }
                LoopEvent::Input(SandboxInput::Pointer(pointer)) => self.on_pointer(pointer),
                LoopEvent::Input(SandboxInput::Shutdown) | LoopEvent::Stop => break,
                LoopEvent::Completed(Completion::Load { generation, result }) => {
                    self.on_loaded(generation, result)
                }
                LoopEvent::Completed(Completion::Render { job, result }) => {
                    self.on_rendered(job, result)
                }
            }
        }

        if let Some(task) = self.load_task.take() {
            task.abort();
        }
        debug!("sandbox stopped");
    }

    fn on_message(&mut self, message: HostMessage) {
        match message {
            HostMessage::Command(command) => self.on_command(command),
            HostMessage::LoadDataUri { data_uri } => self.start_load(LoadRequest::DataUri(data_uri)),
            HostMessage::LoadUrl { url } => self.start_load(LoadRequest::Url(url)),
        }
    }

    fn on_command(&mut self, command: NavigationCommand) {
        let Some(document) = self.session.document().copied() else {
            debug!(?command, "no document loaded, ignoring command");
            return;
        };
        let Some(page) = self.session.navigation_target(&command) else {
            debug!(?command, "command without a target page");
            return;
        };
        if !document.contains(page) {
            debug!(page, total = document.total_pages, "ignoring out-of-range page");
            return;
        }
        let outcome = self.session.request_page(page);
        self.dispatch(outcome);
    }

    fn on_pointer(&mut self, pointer: PointerEvent) {
        let Some(intent) = self.gestures.handle(pointer, &self.session) else {
            return;
        };
        match intent {
            GestureIntent::Zoom(direction) => {
                let outcome = self.session.zoom(direction);
                self.dispatch(outcome);
            }
            GestureIntent::ZoomTo(scale) => {
                let outcome = self.session.set_scale(scale);
                self.dispatch(outcome);
            }
            GestureIntent::Select(selected_text) => {
                self.emit(SandboxEvent::TextSelected { selected_text });
            }
        }
    }

    fn start_load(&mut self, request: LoadRequest) {
        if let Some(previous) = self.load_task.take() {
            debug!("superseding an unfinished load");
            previous.abort();
        }
        self.load_generation += 1;
        let generation = self.load_generation;
        self.console(ConsoleLevel::Log, format!("loading {}", request.describe()));

        let provider = Arc::clone(&self.provider);
        let completions = self.completions_tx.clone();
        let timeout = self.config.load_timeout;
        self.load_task = Some(tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, loader::load(provider.as_ref(), request)).await {
                Ok(result) => result,
                Err(_) => Err(LoadError::Timeout),
            };
            let _ = completions.send(Completion::Load { generation, result });
        }));
    }

    fn on_loaded(&mut self, generation: u64, result: Result<Arc<dyn DocumentBackend>, LoadError>) {
        if generation != self.load_generation {
            debug!(generation, "dropping result of a superseded load");
            return;
        }
        self.load_task = None;

        let backend = match result {
            Ok(backend) => backend,
            Err(err) => {
                self.console(ConsoleLevel::Error, format!("error loading document: {err}"));
                self.emit(SandboxEvent::Error {
                    message: err.to_string(),
                });
                return;
            }
        };

        let document = self.session.install(backend);
        self.frames_tx.send_replace(None);
        self.commands.export_direct();
        info!(pages = document.total_pages, "document ready");
        self.console(
            ConsoleLevel::Log,
            format!("document loaded with {} pages", document.total_pages),
        );
        self.emit(SandboxEvent::Loaded {
            page_count: document.total_pages,
            current_page: self.session.current_page(),
        });

        if document.total_pages > 0 {
            let outcome = self.session.request_page(1);
            self.dispatch(outcome);
        }
    }

    fn on_rendered(&mut self, job: RenderJob, result: Result<RenderedPage, RenderError>) {
        let completed = self.session.complete(&job, result);
        if let Some(frame) = completed.frame {
            self.frames_tx.send_replace(Some(Arc::new(frame)));
        }
        if let Some(event) = completed.event {
            if let SandboxEvent::Error { message } = &event {
                self.console(ConsoleLevel::Error, message.clone());
            }
            self.emit(event);
        }
        if let Some(next) = completed.next {
            self.start_render(next);
        }
    }

    fn dispatch(&mut self, outcome: RequestOutcome) {
        match outcome {
            RequestOutcome::Start(job) => self.start_render(job),
            RequestOutcome::Queued(id) => debug!(id, "render queued"),
            RequestOutcome::Ignored => {}
        }
    }

    fn start_render(&self, job: RenderJob) {
        let Some(backend) = self.session.backend() else {
            error!(page = job.requested_page, "render requested without a document");
            return;
        };
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let task_job = job.clone();
            let result =
                match tokio::task::spawn_blocking(move || scheduler::execute(backend.as_ref(), &task_job))
                    .await
                {
                    Ok(result) => result,
                    Err(err) => {
                        warn!(error = %err, "render task panicked");
                        Err(RenderError::Aborted {
                            page: job.requested_page,
                        })
                    }
                };
            let _ = completions.send(Completion::Render { job, result });
        });
    }

    fn emit(&self, event: SandboxEvent) {
        self.outbox.send(&event);
    }

    fn console(&self, level: ConsoleLevel, message: String) {
        match level {
            ConsoleLevel::Log => debug!(target: "pagebridge::sandbox::console", "{message}"),
            ConsoleLevel::Error => warn!(target: "pagebridge::sandbox::console", "{message}"),
        }
        if self.config.forward_console {
            self.emit(SandboxEvent::Console { level, message });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use pagebridge_core::{Point, TransportEndpoint};

    use super::*;
    use crate::loader::PDF_DATA_URI_PREFIX;
    use crate::testing::FakeProvider;

    struct Harness {
        handle: SandboxHandle,
        to_sandbox: TransportEndpoint,
        from_sandbox: Inbox,
    }

    impl Harness {
        fn start(provider: FakeProvider, config: ViewerConfig) -> Self {
            let sandbox_inbox = Inbox::new();
            let to_sandbox = sandbox_inbox.register_transport(Channel::Window);
            let from_sandbox = Inbox::new();
            let outbox = Outbox::new()
                .with_route(from_sandbox.register_transport(Channel::Window))
                .with_route(from_sandbox.register_transport(Channel::Document));
            let handle = Sandbox::spawn(Arc::new(provider), config, sandbox_inbox, outbox);
            Self {
                handle,
                to_sandbox,
                from_sandbox,
            }
        }

        fn send(&self, message: HostMessage) {
            let raw = pagebridge_core::protocol::encode(&message).unwrap();
            self.to_sandbox.deliver(raw).unwrap();
        }

        fn command(&self, command: NavigationCommand) {
            self.send(HostMessage::Command(command));
        }

        fn load(&self) {
            self.send(HostMessage::LoadDataUri {
                data_uri: format!("{PDF_DATA_URI_PREFIX}{}", BASE64.encode(b"%PDF-1.7")),
            });
        }

        /// Next non-console event.
        async fn event(&mut self) -> SandboxEvent {
            loop {
                let next = tokio::time::timeout(
                    Duration::from_secs(5),
                    self.from_sandbox.next_message::<SandboxEvent>(),
                )
                .await
                .expect("sandbox event in time")
                .expect("sandbox outbox open");
                match next.1 {
                    SandboxEvent::Console { .. } => continue,
                    event => return event,
                }
            }
        }

        async fn assert_quiet(&mut self) {
            let waited = tokio::time::timeout(Duration::from_millis(150), async {
                loop {
                    match self.from_sandbox.next_message::<SandboxEvent>().await {
                        Some((_, SandboxEvent::Console { .. })) => continue,
                        other => return other,
                    }
                }
            })
            .await;
            assert!(waited.is_err(), "unexpected event: {:?}", waited);
        }
    }

    fn quiet_config() -> ViewerConfig {
        ViewerConfig {
            forward_console: false,
            ..ViewerConfig::default()
        }
    }

    #[tokio::test]
    async fn ten_page_session_coalesces_and_survives_render_failure() {
        let provider = FakeProvider::new(10);
        let state = Arc::clone(&provider.state);
        let mut harness = Harness::start(provider, ViewerConfig::default());

        harness.load();
        assert_eq!(
            harness.event().await,
            SandboxEvent::Loaded {
                page_count: 10,
                current_page: 1
            }
        );
        assert_eq!(
            harness.event().await,
            SandboxEvent::PageChanged { current_page: 1 }
        );

        {
            // hold renders so the next four requests arrive mid-render
            let _gate = state.gate.lock();
            for _ in 0..4 {
                harness.command(NavigationCommand::next_page());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(
            harness.event().await,
            SandboxEvent::PageChanged { current_page: 5 }
        );
        assert_eq!(state.rendered(), vec![1, 2, 5]);

        harness.command(NavigationCommand::go_to_page(0));
        harness.assert_quiet().await;
        harness.command(NavigationCommand::go_to_page(11));
        harness.assert_quiet().await;
        assert_eq!(state.rendered(), vec![1, 2, 5]);

        state.fail_page(5);
        harness.command(NavigationCommand::go_to_page(5));
        match harness.event().await {
            SandboxEvent::Error { message } => assert!(message.contains("page 5")),
            other => panic!("expected a render error, got {:?}", other),
        }
        let frame = harness.handle.frames().borrow().clone().unwrap();
        assert_eq!(frame.page, 5);

        harness.command(NavigationCommand::next_page());
        assert_eq!(
            harness.event().await,
            SandboxEvent::PageChanged { current_page: 6 }
        );
        harness.handle.shutdown().await;
    }

    #[tokio::test]
    async fn console_messages_are_forwarded_when_enabled() {
        let mut harness = Harness::start(FakeProvider::new(1), ViewerConfig::default());
        let (_, first) = harness
            .from_sandbox
            .next_message::<SandboxEvent>()
            .await
            .unwrap();
        assert!(matches!(
            first,
            SandboxEvent::Console {
                level: ConsoleLevel::Log,
                ..
            }
        ));
        harness.handle.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_data_uri_reports_error() {
        let mut harness = Harness::start(FakeProvider::new(3), quiet_config());
        harness.send(HostMessage::LoadDataUri {
            data_uri: "data:text/html;base64,AAAA".into(),
        });
        assert_eq!(
            harness.event().await,
            SandboxEvent::Error {
                message: "Invalid PDF data URI".into()
            }
        );
        // nothing loaded, commands are ignored
        harness.command(NavigationCommand::next_page());
        harness.assert_quiet().await;
        harness.handle.shutdown().await;
    }

    #[tokio::test]
    async fn slow_load_times_out() {
        let mut provider = FakeProvider::new(3);
        provider.open_delay = Some(Duration::from_secs(30));
        let config = ViewerConfig {
            load_timeout: Duration::from_millis(50),
            ..quiet_config()
        };
        let mut harness = Harness::start(provider, config);
        harness.load();
        assert_eq!(
            harness.event().await,
            SandboxEvent::Error {
                message: "timeout".into()
            }
        );
        harness.handle.shutdown().await;
    }

    #[tokio::test]
    async fn empty_document_loads_without_rendering() {
        let provider = FakeProvider::new(0);
        let state = Arc::clone(&provider.state);
        let mut harness = Harness::start(provider, quiet_config());
        harness.load();
        assert_eq!(
            harness.event().await,
            SandboxEvent::Loaded {
                page_count: 0,
                current_page: 0
            }
        );
        harness.assert_quiet().await;
        assert!(state.rendered().is_empty());
        harness.handle.shutdown().await;
    }

    #[tokio::test]
    async fn direct_entry_points_are_exported_after_load() {
        let mut harness = Harness::start(FakeProvider::new(3), quiet_config());
        let target = harness.handle.script_target();
        assert!(target.invoke("goToPage", Some(2)).is_err());

        harness.load();
        harness.event().await;
        harness.event().await;

        target.invoke("goToPage", Some(3)).unwrap();
        assert_eq!(
            harness.event().await,
            SandboxEvent::PageChanged { current_page: 3 }
        );
        target.invoke("pdfViewerGoToPreviousPage", None).unwrap();
        assert_eq!(
            harness.event().await,
            SandboxEvent::PageChanged { current_page: 2 }
        );
        harness.handle.shutdown().await;
    }

    #[tokio::test]
    async fn double_click_selects_text_or_toggles_zoom() {
        let mut harness = Harness::start(FakeProvider::new(2), quiet_config());
        harness.load();
        harness.event().await;
        harness.event().await;

        let frame = harness.handle.frames().borrow().clone().unwrap();
        let on_text = Point::new(frame.origin.x + 40.0, frame.origin.y + 30.0);
        harness
            .handle
            .send_pointer(PointerEvent::DoubleClick { point: on_text });
        assert_eq!(
            harness.event().await,
            SandboxEvent::TextSelected {
                selected_text: "Page 1".into()
            }
        );

        harness.handle.send_pointer(PointerEvent::DoubleClick {
            point: Point::new(790.0, 990.0),
        });
        assert_eq!(
            harness.event().await,
            SandboxEvent::PageChanged { current_page: 1 }
        );
        let zoomed = harness.handle.frames().borrow().clone().unwrap();
        assert!(zoomed.scale > frame.scale);
        assert!(zoomed.scale <= ViewerConfig::default().zoom.max);
        harness.handle.shutdown().await;
    }

    #[tokio::test]
    async fn newer_load_supersedes_slow_one() {
        let mut provider = FakeProvider::new(3);
        provider.open_delay = Some(Duration::from_millis(100));
        let state = Arc::clone(&provider.state);
        let mut harness = Harness::start(provider, quiet_config());

        harness.send(HostMessage::LoadUrl {
            url: "file:///tmp/first.pdf".into(),
        });
        harness.load();
        assert_eq!(
            harness.event().await,
            SandboxEvent::Loaded {
                page_count: 3,
                current_page: 1
            }
        );
        assert_eq!(
            harness.event().await,
            SandboxEvent::PageChanged { current_page: 1 }
        );
        harness.assert_quiet().await;
        assert_eq!(*state.opened.lock(), vec!["data-uri".to_string()]);
        harness.handle.shutdown().await;
    }

    #[tokio::test]
    async fn zoom_during_render_joins_the_pending_slot() {
        let provider = FakeProvider::new(5);
        let state = Arc::clone(&provider.state);
        let mut harness = Harness::start(provider, quiet_config());
        harness.load();
        harness.event().await;
        harness.event().await;
        let initial = harness.handle.frames().borrow().clone().unwrap().scale;

        {
            let _gate = state.gate.lock();
            harness.command(NavigationCommand::go_to_page(3));
            tokio::time::sleep(Duration::from_millis(50)).await;
            // zooms page 3, which is still in flight
            harness
                .handle
                .send_pointer(PointerEvent::Wheel { delta_y: -1.0 });
            tokio::time::sleep(Duration::from_millis(50)).await;
            harness.command(NavigationCommand::go_to_page(4));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert_eq!(
            harness.event().await,
            SandboxEvent::PageChanged { current_page: 4 }
        );
        harness.assert_quiet().await;
        assert_eq!(state.rendered(), vec![1, 3, 4]);

        let frame = harness.handle.frames().borrow().clone().unwrap();
        let zoom = ViewerConfig::default().zoom;
        assert_eq!(frame.page, 4);
        assert!((frame.scale - initial * (1.0 + zoom.step)).abs() < 1e-4);
        assert!(frame.scale <= zoom.max);
        harness.handle.shutdown().await;
    }
}
