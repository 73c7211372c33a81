use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossterm::cursor;
use crossterm::event::{self, DisableMouseCapture, EnableMouseCapture, Event};
use crossterm::terminal::{self, Clear, ClearType};
use directories::ProjectDirs;
use pagebridge_core::{Channel, Inbox, Outbox, ViewerConfig};
use pagebridge_host::{BridgeObserver, HostBridge, HostNavigationState};
use pagebridge_render::{Frame, PdfiumProvider, Sandbox, PDF_DATA_URI_PREFIX};
use pagebridge_tty::{
    write_status_line, CellMetrics, EventMapper, HostAction, KittyRenderer, UiEvent,
};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};
use url::Url;

#[derive(Debug, Parser)]
#[command(
    name = "pagebridge",
    version,
    about = "Sandboxed PDF page viewer for kitty-compatible terminals"
)]
struct Args {
    /// Page to show once the document has loaded (1-based)
    #[arg(short = 'p', long = "page")]
    page: Option<i64>,

    /// Configuration file to use instead of the platform default
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// PDF path, file:// or http(s):// URL, data URI, or a .b64 file holding one
    source: String,
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> anyhow::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, DisableMouseCapture, cursor::Show);
    }
}

/// What the bridge is asked to load.
#[derive(Debug, PartialEq, Eq)]
enum Source {
    DataUri(String),
    Url(String),
}

fn resolve_source(argument: &str) -> Result<Source> {
    let argument = argument.trim();
    if argument.starts_with("data:") {
        return Ok(Source::DataUri(argument.to_owned()));
    }
    if argument.ends_with(".b64") {
        let contents = fs::read_to_string(argument)
            .with_context(|| format!("failed to read {argument}"))?;
        let contents = contents.trim();
        let data_uri = if contents.starts_with("data:") {
            contents.to_owned()
        } else {
            format!("{PDF_DATA_URI_PREFIX}{contents}")
        };
        return Ok(Source::DataUri(data_uri));
    }
    if argument.contains("://") {
        let url = Url::parse(argument).with_context(|| format!("invalid URL {argument}"))?;
        return Ok(Source::Url(url.to_string()));
    }
    let path = Path::new(argument)
        .canonicalize()
        .with_context(|| format!("failed to resolve path for {argument:?}"))?;
    let url = Url::from_file_path(&path)
        .map_err(|_| anyhow!("cannot express {} as a file URL", path.display()))?;
    Ok(Source::Url(url.to_string()))
}

/// Copies selections reported by the sandbox to the system clipboard.
struct ClipboardSink;

impl ClipboardSink {
    fn copy(&self, text: &str) {
        let result = arboard::Clipboard::new().and_then(|mut clipboard| {
            clipboard.set_text(text.to_owned())
        });
        if let Err(err) = result {
            warn!(%err, "failed to copy selection");
        }
    }
}

impl BridgeObserver for ClipboardSink {
    fn on_text_selected(&self, text: &str) {
        info!(chars = text.chars().count(), "text selected");
        self.copy(text);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "pagebridge", "pagebridge")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| project_dirs.config_dir().join("config.toml"));
    let mut config = ViewerConfig::load(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;

    let source = resolve_source(&args.source)?;

    let mut cells = CellMetrics::query();
    fit_layout_to_terminal(&mut config, cells)?;

    let sandbox_inbox = Inbox::new();
    let mut host_inbox = Inbox::new();
    let to_sandbox = Outbox::new().with_route(sandbox_inbox.register_transport(Channel::Window));
    let to_host = Outbox::new()
        .with_route(host_inbox.register_transport(Channel::Document))
        .with_route(host_inbox.register_transport(Channel::Window));

    let provider = Arc::new(PdfiumProvider::new()?);
    let sandbox = Sandbox::spawn(provider, config.clone(), sandbox_inbox, to_host);
    let bridge = HostBridge::new(sandbox.script_target(), to_sandbox, &config.bridge)?;
    let clipboard = Arc::new(ClipboardSink);
    bridge.subscribe(clipboard.clone());

    match source {
        Source::DataUri(data_uri) => bridge.load_data_uri(data_uri),
        Source::Url(url) => bridge.load_url(url),
    }

    let _raw = RawModeGuard::new()?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, cursor::Hide, EnableMouseCapture)?;
    let mut renderer = KittyRenderer::new(stdout);
    renderer.clear_all()?;

    let (event_tx, mut terminal_events) = mpsc::unbounded_channel();
    let input_thread = tokio::task::spawn_blocking(move || read_terminal_events(event_tx));

    let mut event_mapper = EventMapper::new(cells);
    let mut frames = sandbox.frames();
    let mut pending_page = args.page;
    let mut dirty = true;

    loop {
        if dirty {
            let frame = frames.borrow().clone();
            redraw(
                &mut renderer,
                frame.as_deref(),
                cells,
                &bridge.state(),
                &args.source,
                event_mapper.pending_input().as_deref(),
            )?;
            dirty = false;
        }

        tokio::select! {
            Some(ev) = terminal_events.recv() => {
                match event_mapper.map_event(ev) {
                    UiEvent::Host(action) => apply_host_action(&bridge, action),
                    UiEvent::Pointer(pointer) => sandbox.send_pointer(pointer),
                    UiEvent::CopySelection => {
                        if let Some(text) = bridge.state().selected_text {
                            clipboard.copy(&text);
                        }
                    }
                    UiEvent::Resize => {
                        cells = CellMetrics::query();
                        event_mapper.set_cells(cells);
                        renderer.clear_all()?;
                    }
                    UiEvent::Quit => break,
                    UiEvent::None => {}
                }
                dirty = true;
            }
            Some(delivery) = host_inbox.recv() => {
                bridge.on_receive(&delivery);
                if bridge.is_ready() {
                    if let Some(page) = pending_page.take() {
                        bridge.go_to_page(page);
                    }
                }
                dirty = true;
            }
            changed = frames.changed() => {
                if changed.is_err() {
                    warn!("sandbox stopped publishing frames");
                    break;
                }
                dirty = true;
            }
        }
    }

    drop(terminal_events);
    sandbox.shutdown().await;
    if let Err(err) = input_thread.await {
        warn!(%err, "terminal input thread ended abnormally");
    }

    renderer.delete_image()?;
    renderer.clear_all()?;
    Ok(())
}

fn read_terminal_events(events: mpsc::UnboundedSender<Event>) {
    while !events.is_closed() {
        match event::poll(Duration::from_millis(100)) {
            Ok(false) => continue,
            Ok(true) => match event::read() {
                Ok(ev) => {
                    if events.send(ev).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "failed to read terminal event");
                    break;
                }
            },
            Err(err) => {
                warn!(%err, "failed to poll terminal events");
                break;
            }
        }
    }
}

fn apply_host_action(bridge: &HostBridge, action: HostAction) {
    match action {
        HostAction::GoToPage { page } => {
            bridge.go_to_page(page);
        }
        HostAction::NextPage { count: 1 } => {
            bridge.go_to_next_page();
        }
        HostAction::PreviousPage { count: 1 } => {
            bridge.go_to_previous_page();
        }
        HostAction::NextPage { count } => {
            bridge.go_to_page(i64::from(bridge.current_page()) + i64::from(count));
        }
        HostAction::PreviousPage { count } => {
            bridge.go_to_page(i64::from(bridge.current_page()) - i64::from(count));
        }
    }
}

/// Sizes the sandbox container to the terminal, leaving the last row for
/// the status line.
fn fit_layout_to_terminal(config: &mut ViewerConfig, cells: CellMetrics) -> Result<()> {
    let (columns, rows) = terminal::size()?;
    let rows = rows.saturating_sub(1).max(1);
    config.layout.container_width = f32::from(columns) * cells.width;
    config.layout.container_height = f32::from(rows) * cells.height;
    Ok(())
}

fn redraw(
    renderer: &mut KittyRenderer<io::Stdout>,
    frame: Option<&Frame>,
    cells: CellMetrics,
    state: &HostNavigationState,
    label: &str,
    pending_input: Option<&str>,
) -> Result<()> {
    renderer.begin_sync_update()?;
    match frame {
        Some(frame) => renderer.draw_frame(frame, cells)?,
        None => renderer.delete_image()?,
    }
    let status = combine_status(format_status(label, state), pending_input);
    draw_status_line(renderer, &status)?;
    renderer.end_sync_update()?;
    Ok(())
}

fn format_status(label: &str, state: &HostNavigationState) -> String {
    let name = Path::new(label)
        .file_name()
        .and_then(|s| s.to_str())
        .filter(|_| !label.starts_with("data:"))
        .unwrap_or("<inline document>");
    let mut status = if state.is_loading {
        format!("{name} | loading")
    } else if state.is_ready {
        format!(
            "{name} | page {}/{}",
            state.current_page, state.total_pages
        )
    } else {
        name.to_string()
    };
    if let Some(error) = &state.last_error {
        status.push_str(" | error: ");
        status.push_str(error);
    }
    status
}

fn combine_status(mut base: String, pending_input: Option<&str>) -> String {
    if let Some(pending) = pending_input.filter(|s| !s.is_empty()) {
        base.push_str(" | ");
        base.push_str(pending);
    }
    base
}

fn draw_status_line(renderer: &mut KittyRenderer<io::Stdout>, status: &str) -> Result<()> {
    let (_, rows) = terminal::size()?;
    let status_row = rows.max(1) - 1;
    let writer = renderer.writer();
    crossterm::queue!(
        writer,
        cursor::MoveTo(0, status_row),
        Clear(ClearType::CurrentLine)
    )?;
    write_status_line(writer, status)?;
    Ok(())
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "pagebridge.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    let console_layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_uri_arguments_pass_through() {
        let source = resolve_source(" data:application/pdf;base64,JVBERg== ").unwrap();
        assert_eq!(
            source,
            Source::DataUri("data:application/pdf;base64,JVBERg==".into())
        );
    }

    #[test]
    fn b64_files_become_data_uris() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.b64");
        fs::write(&path, "JVBERi0xLjQK\n").unwrap();

        let source = resolve_source(path.to_str().unwrap()).unwrap();
        assert_eq!(
            source,
            Source::DataUri(format!("{PDF_DATA_URI_PREFIX}JVBERi0xLjQK"))
        );
    }

    #[test]
    fn paths_become_file_urls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.pdf");
        fs::write(&path, b"%PDF-1.4").unwrap();

        match resolve_source(path.to_str().unwrap()).unwrap() {
            Source::Url(url) => {
                assert!(url.starts_with("file://"));
                assert!(url.ends_with("/doc.pdf"));
            }
            other => panic!("unexpected source: {:?}", other),
        }
        assert!(resolve_source("/definitely/not/here.pdf").is_err());
    }

    #[test]
    fn remote_urls_are_kept() {
        assert_eq!(
            resolve_source("https://example.com/a.pdf").unwrap(),
            Source::Url("https://example.com/a.pdf".into())
        );
    }

    #[test]
    fn status_reflects_bridge_state() {
        let mut state = HostNavigationState {
            is_ready: true,
            current_page: 3,
            total_pages: 10,
            ..Default::default()
        };
        assert_eq!(format_status("/tmp/doc.pdf", &state), "doc.pdf | page 3/10");

        state.last_error = Some("timeout".into());
        assert_eq!(
            format_status("data:application/pdf;base64,AA", &state),
            "<inline document> | page 3/10 | error: timeout"
        );
        assert_eq!(
            combine_status("doc.pdf".into(), Some("12")),
            "doc.pdf | 12"
        );
    }
}
