use std::io::{self, Write};
use std::time::Instant;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crossterm::{
    cursor,
    event::{
        Event, KeyCode, KeyEvent, KeyModifiers, MouseButton, MouseEvent, MouseEventKind,
    },
    terminal::{Clear, ClearType},
};
use pagebridge_core::{Point, RenderImage};
use pagebridge_render::{Frame, PointerEvent};
use png::{BitDepth, ColorType, Encoder};
use tracing::trace;

pub struct KittyRenderer<W: Write> {
    writer: W,
    image_id: u32,
    placement_id: u32,
}

pub struct DrawParams {
    pub column: u16,
    pub row: u16,
    pub columns: u32,
    pub rows: u32,
}

impl DrawParams {
    pub fn clamped(columns: u32, rows: u32) -> Self {
        Self {
            column: 0,
            row: 0,
            columns: columns.max(1),
            rows: rows.max(1),
        }
    }

    /// Placement of `frame` on a terminal whose cells measure `cells`.
    pub fn for_frame(frame: &Frame, cells: CellMetrics) -> Self {
        let column = (frame.origin.x / cells.width).floor().max(0.0) as u16;
        let row = (frame.origin.y / cells.height).floor().max(0.0) as u16;
        let columns = (frame.geometry.css_width / cells.width).ceil() as u32;
        let rows = (frame.geometry.css_height / cells.height).ceil() as u32;
        Self {
            column,
            row,
            ..Self::clamped(columns, rows)
        }
    }
}

impl<W: Write> KittyRenderer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            image_id: 1,
            placement_id: 1,
        }
    }

    pub fn writer(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn draw_frame(&mut self, frame: &Frame, cells: CellMetrics) -> Result<()> {
        let params = DrawParams::for_frame(frame, cells);
        crossterm::queue!(&mut self.writer, cursor::MoveTo(params.column, params.row))?;
        self.draw(&frame.image, params)
    }

    pub fn draw(&mut self, image: &RenderImage, params: DrawParams) -> Result<()> {
        let mut buffer = Vec::new();
        let mut encoder = Encoder::new(&mut buffer, image.width, image.height);
        encoder.set_color(ColorType::Rgba);
        encoder.set_depth(BitDepth::Eight);
        let mut writer = encoder.write_header()?;
        writer.write_image_data(&image.pixels)?;
        writer.finish()?;

        let encoded = BASE64.encode(&buffer);
        let mut chunks = encoded.as_bytes().chunks(4096).peekable();
        let mut first = true;

        while let Some(chunk) = chunks.next() {
            let more = u8::from(chunks.peek().is_some());
            if first {
                write!(
                    self.writer,
                    "\u{1b}_Ga=T,f=100,C=1,q=2,i={},p={},c={},r={},s={},v={},z=-1,m={}",
                    self.image_id,
                    self.placement_id,
                    params.columns,
                    params.rows,
                    image.width,
                    image.height,
                    more
                )?;
                first = false;
            } else {
                write!(self.writer, "\u{1b}_Gm={},q=2", more)?;
            }
            if !chunk.is_empty() {
                self.writer.write_all(b";")?;
                self.writer.write_all(chunk)?;
            }
            write!(self.writer, "\u{1b}\\")?;
        }

        self.writer.flush()?;
        Ok(())
    }

    /// Removes the page image, leaving any text in place.
    pub fn delete_image(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}_Ga=d,d=I,i={},q=2\u{1b}\\", self.image_id)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn begin_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026h")?;
        Ok(())
    }

    /// Disables synchronized updates.
    /// The terminal will render all buffered changes at once.
    pub fn end_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026l")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Clears the entire screen.
    pub fn clear_all(&mut self) -> Result<()> {
        crossterm::execute!(
            &mut self.writer,
            Clear(ClearType::All),
            cursor::MoveTo(0, 0)
        )?;
        Ok(())
    }
}

/// Pixel size of one terminal cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellMetrics {
    pub width: f32,
    pub height: f32,
}

impl CellMetrics {
    /// Used when the terminal does not report its pixel size.
    pub const FALLBACK: CellMetrics = CellMetrics {
        width: 8.0,
        height: 16.0,
    };

    pub fn from_window(columns: u16, rows: u16, width_px: u16, height_px: u16) -> Self {
        if columns == 0 || rows == 0 || width_px == 0 || height_px == 0 {
            return Self::FALLBACK;
        }
        Self {
            width: f32::from(width_px) / f32::from(columns),
            height: f32::from(height_px) / f32::from(rows),
        }
    }

    pub fn query() -> Self {
        match crossterm::terminal::window_size() {
            Ok(size) => Self::from_window(size.columns, size.rows, size.width, size.height),
            Err(_) => Self::FALLBACK,
        }
    }

    /// Centre of the cell in container pixels.
    pub fn cell_center(&self, column: u16, row: u16) -> Point {
        Point::new(
            (f32::from(column) + 0.5) * self.width,
            (f32::from(row) + 0.5) * self.height,
        )
    }
}


/// Navigation the host bridge carries out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostAction {
    GoToPage { page: i64 },
    NextPage { count: u32 },
    PreviousPage { count: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    Host(HostAction),
    Pointer(PointerEvent),
    CopySelection,
    Resize,
    Quit,
    None,
}

#[derive(Debug)]
pub struct EventMapper {
    pending_count: Option<u32>,
    pending_digits: String,
    cells: CellMetrics,
    clock: Instant,
}

impl EventMapper {
    const WHEEL_STEP: f32 = 100.0;

    pub fn new(cells: CellMetrics) -> Self {
        Self {
            pending_count: None,
            pending_digits: String::new(),
            cells,
            clock: Instant::now(),
        }
    }

    pub fn set_cells(&mut self, cells: CellMetrics) {
        self.cells = cells;
    }

    pub fn map_event(&mut self, event: Event) -> UiEvent {
        match event {
            Event::Key(key) => self.map_key(key),
            Event::Mouse(mouse) => self.map_mouse(mouse),
            Event::Resize(..) => UiEvent::Resize,
            _ => UiEvent::None,
        }
    }

    fn map_key(&mut self, KeyEvent { code, modifiers, .. }: KeyEvent) -> UiEvent {
        match (code, modifiers) {
            (KeyCode::Char(c), KeyModifiers::NONE) if c.is_ascii_digit() => {
                if let Some(digit) = c.to_digit(10) {
                    self.push_digit(digit);
                }
                UiEvent::None
            }
            (KeyCode::Char('c'), modifiers) if modifiers.contains(KeyModifiers::CONTROL) => {
                UiEvent::Quit
            }
            (KeyCode::Char('j'), KeyModifiers::NONE)
            | (KeyCode::Down, KeyModifiers::NONE)
            | (KeyCode::PageDown, _)
            | (KeyCode::Char(' '), KeyModifiers::NONE) => {
                let count = self.take_count();
                UiEvent::Host(HostAction::NextPage { count })
            }
            (KeyCode::Char('k'), KeyModifiers::NONE)
            | (KeyCode::Up, KeyModifiers::NONE)
            | (KeyCode::PageUp, _) => {
                let count = self.take_count();
                UiEvent::Host(HostAction::PreviousPage { count })
            }
            (KeyCode::Char('g'), KeyModifiers::NONE) | (KeyCode::Home, _) => {
                let page = i64::from(self.take_count());
                UiEvent::Host(HostAction::GoToPage { page })
            }
            (KeyCode::Char('G'), _) | (KeyCode::End, _) => {
                self.reset_count();
                UiEvent::Host(HostAction::GoToPage { page: i64::MAX })
            }
            (KeyCode::Char('+'), _) | (KeyCode::Char('='), _) => {
                self.reset_count();
                UiEvent::Pointer(PointerEvent::Wheel {
                    delta_y: -Self::WHEEL_STEP,
                })
            }
            (KeyCode::Char('-'), _) => {
                self.reset_count();
                UiEvent::Pointer(PointerEvent::Wheel {
                    delta_y: Self::WHEEL_STEP,
                })
            }
            (KeyCode::Char('y'), _) => {
                self.reset_count();
                UiEvent::CopySelection
            }
            (KeyCode::Char('q'), _) | (KeyCode::Esc, _) => {
                self.reset_count();
                UiEvent::Quit
            }
            _ => {
                self.reset_count();
                UiEvent::None
            }
        }
    }

    fn map_mouse(&mut self, mouse: MouseEvent) -> UiEvent {
        let zoom = mouse.modifiers.contains(KeyModifiers::CONTROL);
        match mouse.kind {
            MouseEventKind::ScrollDown if zoom => UiEvent::Pointer(PointerEvent::Wheel {
                delta_y: Self::WHEEL_STEP,
            }),
            MouseEventKind::ScrollUp if zoom => UiEvent::Pointer(PointerEvent::Wheel {
                delta_y: -Self::WHEEL_STEP,
            }),
            MouseEventKind::ScrollDown => UiEvent::Host(HostAction::NextPage { count: 1 }),
            MouseEventKind::ScrollUp => UiEvent::Host(HostAction::PreviousPage { count: 1 }),
            MouseEventKind::Down(MouseButton::Left) => {
                let point = self.cells.cell_center(mouse.column, mouse.row);
                let at_ms = u64::try_from(self.clock.elapsed().as_millis()).unwrap_or(u64::MAX);
                trace!(column = mouse.column, row = mouse.row, at_ms, "tap");
                UiEvent::Pointer(PointerEvent::Tap { point, at_ms })
            }
            _ => UiEvent::None,
        }
    }

    fn push_digit(&mut self, digit: u32) {
        let current = self.pending_count.unwrap_or(0);
        let next = current.saturating_mul(10).saturating_add(digit);
        self.pending_count = Some(next);
        if let Some(c) = char::from_digit(digit, 10) {
            self.pending_digits.push(c);
        }
    }

    fn take_count(&mut self) -> u32 {
        let count = self
            .pending_count
            .take()
            .filter(|&count| count > 0)
            .unwrap_or(1);
        self.pending_digits.clear();
        count
    }

    fn reset_count(&mut self) {
        self.pending_count = None;
        self.pending_digits.clear();
    }

    pub fn pending_input(&self) -> Option<String> {
        if self.pending_digits.is_empty() {
            None
        } else {
            Some(self.pending_digits.clone())
        }
    }
}

pub fn write_status_line<W: Write>(writer: &mut W, label: &str) -> io::Result<()> {
    write!(writer, "{}", label)?;
    writer.flush()
}
