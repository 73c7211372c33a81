//! Host side of the bridge.
//!
//! [`HostBridge`] mirrors the sandbox's navigation state from the events it
//! emits and turns imperative navigation calls into fire-and-forget
//! invocations of the sandbox's exported entry points.

use std::sync::Arc;
use std::time::Duration;

use pagebridge_core::transport::on_receive;
use pagebridge_core::{
    BridgeConfig, ConsoleLevel, Delivery, HostMessage, InvokeError, NavigationAction,
    NavigationCommand, Outbox, SandboxEvent, ScriptTarget,
};
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostNavigationState {
    pub current_page: u32,
    pub total_pages: u32,
    pub is_ready: bool,
    pub is_loading: bool,
    pub last_error: Option<String>,
    pub selected_text: Option<String>,
}

/// Callbacks for collaborators interested in sandbox events. All methods
/// default to doing nothing.
pub trait BridgeObserver: Send + Sync {
    fn on_loaded(&self, _page_count: u32, _current_page: u32) {}
    fn on_page_changed(&self, _current_page: u32) {}
    fn on_error(&self, _message: &str) {}
    fn on_text_selected(&self, _text: &str) {}
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("host bridge must be created inside a tokio runtime")]
    NoRuntime,
    #[error("neither `{primary}` nor `{fallback}` accepted the call: {source}")]
    Unreachable {
        primary: &'static str,
        fallback: &'static str,
        #[source]
        source: InvokeError,
    },
}

/// Which entry point accepted a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPoint {
    Primary,
    Fallback,
}

/// Calls the direct entry point for `command`, falling back to the prefixed
/// one when the direct one is not defined yet.
pub fn invoke_with_fallback(
    target: &dyn ScriptTarget,
    command: &NavigationCommand,
) -> Result<EntryPoint, BridgeError> {
    let primary = command.action.entry_point();
    let fallback = command.action.fallback_entry_point();
    match target.invoke(primary, command.page_number) {
        Ok(()) => return Ok(EntryPoint::Primary),
        Err(InvokeError::NotDefined(_)) => {}
        Err(err) => {
            return Err(BridgeError::Unreachable {
                primary,
                fallback,
                source: err,
            })
        }
    }
    match target.invoke(fallback, command.page_number) {
        Ok(()) => {
            warn!(primary, fallback, "primary entry point missing, used fallback");
            Ok(EntryPoint::Fallback)
        }
        Err(err) => Err(BridgeError::Unreachable {
            primary,
            fallback,
            source: err,
        }),
    }
}

struct MirrorState {
    nav: HostNavigationState,
    /// Last page the sandbox reported as rendered.
    confirmed_page: u32,
}

enum Notification {
    Loaded(u32, u32),
    PageChanged(u32),
    Error(String),
    TextSelected(String),
}

/// A navigation call waiting out the settle delay.
struct PendingCall {
    command: NavigationCommand,
    due: Instant,
}

/// Delivers calls strictly in the order they were queued.
async fn dispatch_calls(
    mut calls: mpsc::UnboundedReceiver<PendingCall>,
    target: Arc<dyn ScriptTarget>,
) {
    while let Some(call) = calls.recv().await {
        tokio::time::sleep_until(call.due).await;
        if let Err(err) = invoke_with_fallback(target.as_ref(), &call.command) {
            warn!(error = %err, command = ?call.command, "navigation call was not delivered");
        }
    }
    debug!("host bridge dispatcher stopped");
}

pub struct HostBridge {
    state: Mutex<MirrorState>,
    observers: RwLock<Vec<Arc<dyn BridgeObserver>>>,
    calls: mpsc::UnboundedSender<PendingCall>,
    outbox: Outbox,
    settle_delay: Duration,
}

impl HostBridge {
    /// `target` receives navigation calls; `outbox` carries load requests.
    pub fn new(
        target: Arc<dyn ScriptTarget>,
        outbox: Outbox,
        config: &BridgeConfig,
    ) -> Result<Self, BridgeError> {
        let runtime = Handle::try_current().map_err(|_| BridgeError::NoRuntime)?;
        let (calls, queued) = mpsc::unbounded_channel();
        runtime.spawn(dispatch_calls(queued, target));
        Ok(Self {
            state: Mutex::new(MirrorState {
                nav: HostNavigationState::default(),
                confirmed_page: 0,
            }),
            observers: RwLock::new(Vec::new()),
            calls,
            outbox,
            settle_delay: config.settle_delay,
        })
    }

    pub fn subscribe(&self, observer: Arc<dyn BridgeObserver>) {
        self.observers.write().push(observer);
    }

    pub fn state(&self) -> HostNavigationState {
        self.state.lock().nav.clone()
    }

    /// Mirrored value; may lag the sandbox by one round trip.
    pub fn current_page(&self) -> u32 {
        self.state.lock().nav.current_page
    }

    pub fn total_pages(&self) -> u32 {
        self.state.lock().nav.total_pages
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().nav.is_ready
    }

    /// Clamps `page` into the document and asks the sandbox to show it.
    /// Returns the clamped page, or `None` when the bridge is not ready.
    /// Nothing is sent when the clamped page is already the current one.
    pub fn go_to_page(&self, page: i64) -> Option<u32> {
        let mut state = self.state.lock();
        let total = state.nav.total_pages;
        if !state.nav.is_ready || total == 0 {
            debug!(page, "bridge not ready, ignoring goToPage");
            return None;
        }
        let clamped = page.clamp(1, i64::from(total)) as u32;
        if clamped == state.nav.current_page {
            debug!(page, clamped, "already on the requested page");
            return Some(clamped);
        }
        state.nav.current_page = clamped;
        self.schedule(NavigationCommand::go_to_page(i64::from(clamped)));
        Some(clamped)
    }

    pub fn go_to_next_page(&self) -> Option<u32> {
        self.step(NavigationAction::GoToNextPage)
    }

    pub fn go_to_previous_page(&self) -> Option<u32> {
        self.step(NavigationAction::GoToPreviousPage)
    }

    fn step(&self, action: NavigationAction) -> Option<u32> {
        let mut state = self.state.lock();
        let nav = &mut state.nav;
        if !nav.is_ready || nav.total_pages == 0 {
            debug!(?action, "bridge not ready, ignoring navigation");
            return None;
        }
        let target = match action {
            NavigationAction::GoToNextPage if nav.current_page < nav.total_pages => {
                nav.current_page + 1
            }
            NavigationAction::GoToPreviousPage if nav.current_page > 1 => nav.current_page - 1,
            _ => return None,
        };
        nav.current_page = target;
        self.schedule(NavigationCommand {
            action,
            page_number: None,
        });
        Some(target)
    }

    /// Queues `command` behind earlier calls. Callers hold the state lock so
    /// the queue order matches the order the mirror was updated in.
    fn schedule(&self, command: NavigationCommand) {
        let call = PendingCall {
            command,
            due: Instant::now() + self.settle_delay,
        };
        if self.calls.send(call).is_err() {
            warn!("host bridge dispatcher is gone, navigation dropped");
        }
    }

    pub fn load_data_uri(&self, data_uri: impl Into<String>) {
        self.begin_load();
        self.outbox.send(&HostMessage::LoadDataUri {
            data_uri: data_uri.into(),
        });
    }

    pub fn load_url(&self, url: impl Into<String>) {
        self.begin_load();
        self.outbox.send(&HostMessage::LoadUrl { url: url.into() });
    }

    fn begin_load(&self) {
        let mut state = self.state.lock();
        state.nav.is_loading = true;
        state.nav.is_ready = false;
        state.nav.last_error = None;
    }

    /// Entry point for both inbound transports.
    pub fn on_receive(&self, delivery: &Delivery) {
        if let Some(event) = on_receive::<SandboxEvent>(delivery) {
            self.handle_event(event);
        }
    }

    pub fn handle_event(&self, event: SandboxEvent) {
        let notification = {
            let mut state = self.state.lock();
            match event {
                SandboxEvent::Loaded {
                    page_count,
                    current_page,
                } => {
                    state.nav.total_pages = page_count;
                    state.nav.current_page = current_page;
                    state.nav.is_ready = true;
                    state.nav.is_loading = false;
                    state.nav.last_error = None;
                    state.confirmed_page = current_page;
                    Notification::Loaded(page_count, current_page)
                }
                SandboxEvent::PageChanged { current_page } => {
                    if current_page == 0 || current_page > state.nav.total_pages {
                        warn!(current_page, "ignoring pageChanged outside the document");
                        return;
                    }
                    state.nav.current_page = current_page;
                    state.confirmed_page = current_page;
                    Notification::PageChanged(current_page)
                }
                SandboxEvent::Error { message } => {
                    state.nav.last_error = Some(message.clone());
                    state.nav.is_loading = false;
                    state.nav.current_page = state.confirmed_page;
                    Notification::Error(message)
                }
                SandboxEvent::TextSelected { selected_text } => {
                    state.nav.selected_text = Some(selected_text.clone());
                    Notification::TextSelected(selected_text)
                }
                SandboxEvent::Console { level, message } => {
                    match level {
                        ConsoleLevel::Log => info!(target: "pagebridge::sandbox", "{message}"),
                        ConsoleLevel::Error => error!(target: "pagebridge::sandbox", "{message}"),
                    }
                    return;
                }
            }
        };

        let observers = self.observers.read().clone();
        for observer in &observers {
            match &notification {
                Notification::Loaded(count, page) => observer.on_loaded(*count, *page),
                Notification::PageChanged(page) => observer.on_page_changed(*page),
                Notification::Error(message) => observer.on_error(message),
                Notification::TextSelected(text) => observer.on_text_selected(text),
            }
        }
    }
}
