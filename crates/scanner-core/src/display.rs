//! Four-line OLED text driver.
//!
//! Text layout, inversion and idle blanking live here, on top of a [`Panel`]
//! trait that pushes the finished framebuffer to the actual hardware. On ARM
//! targets the panel is the I²C OLED; everywhere else a no-op stub keeps the
//! rest of the system exercisable.
//!
//! Line 0 is the top of the screen, line 3 the bottom. Each redraw wipes the
//! affected line's rectangle first so shorter strings do not leave ghost
//! pixels behind.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use embedded_graphics::mono_font::ascii::{FONT_6X10, FONT_9X15, FONT_9X15_BOLD};
use embedded_graphics::mono_font::{MonoFont, MonoTextStyleBuilder};
use embedded_graphics::pixelcolor::BinaryColor;
use embedded_graphics::prelude::*;
use embedded_graphics::text::{Baseline, Text};
use thiserror::Error;
use tracing::{error, trace};

pub const WIDTH: u32 = 128;
pub const HEIGHT: u32 = 64;

/// Lines of text on the panel.
pub const LINE_COUNT: usize = 4;
const LINE_HEIGHT: i32 = (HEIGHT as i32) / LINE_COUNT as i32;

/// Inactivity span after which the panel is powered down.
pub const SCREEN_TIMEOUT: Duration = Duration::from_secs(90 * 60);

#[derive(Debug, Error)]
pub enum ScreenError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("panel error: {0}")]
    Panel(String),
}

/// 1-bit 128×64 framebuffer.
#[derive(Clone)]
pub struct Framebuffer {
    bits: [u8; (WIDTH * HEIGHT / 8) as usize],
}

impl Framebuffer {
    pub fn new() -> Self {
        Self {
            bits: [0; (WIDTH * HEIGHT / 8) as usize],
        }
    }

    pub fn set(&mut self, x: i32, y: i32, on: bool) {
        if x < 0 || y < 0 || x >= WIDTH as i32 || y >= HEIGHT as i32 {
            return;
        }
        let idx = (y as u32 * WIDTH + x as u32) as usize;
        if on {
            self.bits[idx / 8] |= 1 << (idx % 8);
        } else {
            self.bits[idx / 8] &= !(1 << (idx % 8));
        }
    }

    pub fn get(&self, x: u32, y: u32) -> bool {
        let idx = (y * WIDTH + x) as usize;
        self.bits[idx / 8] & (1 << (idx % 8)) != 0
    }

    pub fn fill_rect(&mut self, x: i32, y: i32, w: u32, h: u32, on: bool) {
        for yy in y..y + h as i32 {
            for xx in x..x + w as i32 {
                self.set(xx, yy, on);
            }
        }
    }

    pub fn zero(&mut self) {
        self.bits.fill(0);
    }
}

impl Default for Framebuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl OriginDimensions for Framebuffer {
    fn size(&self) -> Size {
        Size::new(WIDTH, HEIGHT)
    }
}

impl DrawTarget for Framebuffer {
    type Color = BinaryColor;
    type Error = core::convert::Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        for Pixel(point, color) in pixels {
            self.set(point.x, point.y, color.is_on());
        }
        Ok(())
    }
}

/// Pushes finished frames to the physical panel.
pub trait Panel: Send {
    fn push(&mut self, fb: &Framebuffer) -> Result<(), ScreenError>;

    /// Power the panel down without touching the backing image.
    fn halt(&mut self) -> Result<(), ScreenError>;
}

/// Stub for targets without the OLED.
pub struct NullPanel;

impl Panel for NullPanel {
    fn push(&mut self, _fb: &Framebuffer) -> Result<(), ScreenError> {
        Ok(())
    }

    fn halt(&mut self) -> Result<(), ScreenError> {
        Ok(())
    }
}

struct LineStyle {
    font: &'static MonoFont<'static>,
    inverted: bool,
    centered: bool,
}

const TITLE: LineStyle = LineStyle {
    font: &FONT_9X15_BOLD,
    inverted: true,
    centered: true,
};
const BODY: LineStyle = LineStyle {
    font: &FONT_9X15,
    inverted: false,
    centered: false,
};
const HELP: LineStyle = LineStyle {
    font: &FONT_6X10,
    inverted: true,
    centered: true,
};

fn text_width(font: &MonoFont<'_>, text: &str) -> i32 {
    text.chars().count() as i32
        * (font.character_size.width + font.character_spacing) as i32
}

/// Wipe the line's rectangle to the style's background, then draw.
fn render_line(fb: &mut Framebuffer, line: usize, text: &str, style: &LineStyle) {
    let top = line as i32 * LINE_HEIGHT;
    fb.fill_rect(0, top, WIDTH, LINE_HEIGHT as u32, style.inverted);

    let x = if style.centered {
        ((WIDTH as i32 - text_width(style.font, text)) / 2).max(0)
    } else {
        0
    };
    let color = if style.inverted {
        BinaryColor::Off
    } else {
        BinaryColor::On
    };
    let mono = MonoTextStyleBuilder::new()
        .font(style.font)
        .text_color(color)
        .build();

    let _ = Text::with_baseline(text, Point::new(x, top + 1), mono, Baseline::Top).draw(fb);
}

struct ScreenState {
    fb: Framebuffer,
    panel: Box<dyn Panel>,
    lines: [String; LINE_COUNT],
    last_active: Instant,
}

/// The screen: shared, mutex-guarded, safe for concurrent callers.
pub struct Screen {
    state: Mutex<ScreenState>,
    timeout: Duration,
}

impl Screen {
    pub fn new(panel: Box<dyn Panel>) -> Self {
        Self::with_timeout(panel, SCREEN_TIMEOUT)
    }

    pub fn with_timeout(panel: Box<dyn Panel>, timeout: Duration) -> Self {
        Self {
            state: Mutex::new(ScreenState {
                fb: Framebuffer::new(),
                panel,
                lines: Default::default(),
                last_active: Instant::now(),
            }),
            timeout,
        }
    }

    /// Probe for the real panel; falls back to the stub so the rest of the
    /// device keeps running headless.
    pub fn detect() -> Result<Self, ScreenError> {
        Ok(Self::new(open_panel()?))
    }

    pub fn disabled() -> Self {
        Self::new(Box::new(NullPanel))
    }

    /// Line 0: inverted, centered, bold.
    pub fn write_title(&self, text: &str) {
        self.write(0, text, &TITLE);
    }

    /// Lines 1 and 2: white on black, left aligned, monospaced.
    pub fn write_line(&self, line: usize, text: &str) {
        debug_assert!((1..=2).contains(&line), "body lines are 1 and 2");
        self.write(line.clamp(1, 2), text, &BODY);
    }

    /// Line 3: inverted, centered, small.
    pub fn write_help(&self, text: &str) {
        self.write(LINE_COUNT - 1, text, &HELP);
    }

    /// Zero the framebuffer and redraw.
    pub fn clear(&self) {
        let mut st = self.lock();
        st.fb.zero();
        st.lines = Default::default();
        st.last_active = Instant::now();
        let ScreenState { panel, fb, .. } = &mut *st;
        if let Err(e) = panel.push(fb) {
            error!(error = %e, "panel draw failed");
        }
    }

    /// Power-save: halt the panel, keep the backing image.
    pub fn blank(&self) {
        trace!("blanking screen");
        let mut st = self.lock();
        if let Err(e) = st.panel.halt() {
            error!(error = %e, "panel halt failed");
        }
    }

    /// Whether the idle loop should blank us.
    pub fn should_blank(&self) -> bool {
        let st = self.lock();
        st.last_active.elapsed() > self.timeout
    }

    /// Current text of a line, mostly for inspection in tests.
    pub fn line(&self, line: usize) -> String {
        self.lock().lines[line].clone()
    }

    #[cfg(test)]
    fn snapshot(&self) -> Framebuffer {
        self.lock().fb.clone()
    }

    fn write(&self, line: usize, text: &str, style: &LineStyle) {
        let mut st = self.lock();
        st.lines[line] = text.to_owned();
        st.last_active = Instant::now();
        render_line(&mut st.fb, line, text, style);
        let ScreenState { panel, fb, .. } = &mut *st;
        if let Err(e) = panel.push(fb) {
            error!(error = %e, "panel draw failed");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScreenState> {
        self.state.lock().expect("screen mutex poisoned")
    }
}

#[cfg(any(target_arch = "arm", target_arch = "aarch64"))]
fn open_panel() -> Result<Box<dyn Panel>, ScreenError> {
    Ok(Box::new(oled::OledPanel::open("/dev/i2c-0")?))
}

#[cfg(not(any(target_arch = "arm", target_arch = "aarch64")))]
fn open_panel() -> Result<Box<dyn Panel>, ScreenError> {
    Ok(Box::new(NullPanel))
}

#[cfg(any(target_arch = "arm", target_arch = "aarch64"))]
mod oled {
    //! The physical 128×64 I²C OLED.

    use linux_embedded_hal::I2cdev;
    use ssd1306::mode::BufferedGraphicsMode;
    use ssd1306::prelude::*;
    use ssd1306::{I2CDisplayInterface, Ssd1306};

    use super::{Framebuffer, Panel, ScreenError, HEIGHT, WIDTH};

    type Dev =
        Ssd1306<I2CInterface<I2cdev>, DisplaySize128x64, BufferedGraphicsMode<DisplaySize128x64>>;

    pub struct OledPanel {
        dev: Dev,
    }

    impl OledPanel {
        pub fn open(bus: &str) -> Result<Self, ScreenError> {
            let i2c = I2cdev::new(bus).map_err(|e| ScreenError::Panel(format!("{e:?}")))?;
            let mut dev = Ssd1306::new(
                I2CDisplayInterface::new(i2c),
                DisplaySize128x64,
                DisplayRotation::Rotate0,
            )
            .into_buffered_graphics_mode();
            dev.init().map_err(|e| ScreenError::Panel(format!("{e:?}")))?;
            dev.set_brightness(Brightness::BRIGHTEST)
                .map_err(|e| ScreenError::Panel(format!("{e:?}")))?;
            Ok(Self { dev })
        }
    }

    impl Panel for OledPanel {
        fn push(&mut self, fb: &Framebuffer) -> Result<(), ScreenError> {
            // a draw after a blank wakes the panel back up
            self.dev
                .set_display_on(true)
                .map_err(|e| ScreenError::Panel(format!("{e:?}")))?;
            for y in 0..HEIGHT {
                for x in 0..WIDTH {
                    self.dev.set_pixel(x, y, fb.get(x, y));
                }
            }
            self.dev
                .flush()
                .map_err(|e| ScreenError::Panel(format!("{e:?}")))
        }

        fn halt(&mut self) -> Result<(), ScreenError> {
            self.dev
                .set_display_on(false)
                .map_err(|e| ScreenError::Panel(format!("{e:?}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    struct RecordingPanel {
        pushes: Arc<AtomicUsize>,
        halted: Arc<AtomicBool>,
    }

    impl Panel for RecordingPanel {
        fn push(&mut self, _fb: &Framebuffer) -> Result<(), ScreenError> {
            self.pushes.fetch_add(1, Ordering::SeqCst);
            self.halted.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn halt(&mut self) -> Result<(), ScreenError> {
            self.halted.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn recording_screen() -> (Screen, Arc<AtomicUsize>, Arc<AtomicBool>) {
        let pushes = Arc::new(AtomicUsize::new(0));
        let halted = Arc::new(AtomicBool::new(false));
        let screen = Screen::new(Box::new(RecordingPanel {
            pushes: pushes.clone(),
            halted: halted.clone(),
        }));
        (screen, pushes, halted)
    }

    fn line_pixels_on(fb: &Framebuffer, line: usize) -> usize {
        let top = line as u32 * LINE_HEIGHT as u32;
        let mut n = 0;
        for y in top..top + LINE_HEIGHT as u32 {
            for x in 0..WIDTH {
                if fb.get(x, y) {
                    n += 1;
                }
            }
        }
        n
    }

    #[test]
    fn title_is_inverted_body_is_not() {
        let (screen, _, _) = recording_screen();
        screen.write_title("SCANNER");
        screen.write_line(1, "Barcode data:");

        let fb = screen.snapshot();
        let line_area = (WIDTH as usize) * LINE_HEIGHT as usize;
        // inverted line: mostly lit background
        assert!(line_pixels_on(&fb, 0) > line_area / 2);
        // normal line: only the glyphs are lit
        let body = line_pixels_on(&fb, 1);
        assert!(body > 0 && body < line_area / 2);
    }

    #[test]
    fn shorter_text_leaves_no_ghost_pixels() {
        let (screen, _, _) = recording_screen();
        screen.write_line(2, "WWWWWWWWWWWW");
        let wide = line_pixels_on(&screen.snapshot(), 2);

        screen.write_line(2, "i");
        let narrow = line_pixels_on(&screen.snapshot(), 2);
        assert!(narrow < wide / 4, "line was not wiped before redraw");
    }

    #[test]
    fn centered_text_has_balanced_margins() {
        let mut fb = Framebuffer::new();
        render_line(
            &mut fb,
            1,
            "HI",
            &LineStyle {
                font: &FONT_9X15,
                inverted: false,
                centered: true,
            },
        );

        let top = LINE_HEIGHT as u32;
        let mut min_x = WIDTH;
        let mut max_x = 0;
        for y in top..top + LINE_HEIGHT as u32 {
            for x in 0..WIDTH {
                if fb.get(x, y) {
                    min_x = min_x.min(x);
                    max_x = max_x.max(x);
                }
            }
        }
        let left = min_x as i32;
        let right = WIDTH as i32 - 1 - max_x as i32;
        assert!((left - right).abs() <= 10, "left {left}, right {right}");
    }

    #[test]
    fn clear_zeroes_everything() {
        let (screen, _, _) = recording_screen();
        screen.write_title("X");
        screen.clear();
        let fb = screen.snapshot();
        for line in 0..LINE_COUNT {
            assert_eq!(line_pixels_on(&fb, line), 0);
        }
        assert_eq!(screen.line(0), "");
    }

    #[test]
    fn blank_halts_and_draw_wakes() {
        let (screen, pushes, halted) = recording_screen();
        screen.blank();
        assert!(halted.load(Ordering::SeqCst));

        screen.write_title("WAKE");
        assert!(!halted.load(Ordering::SeqCst));
        assert!(pushes.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn should_blank_after_timeout() {
        let pushes = Arc::new(AtomicUsize::new(0));
        let halted = Arc::new(AtomicBool::new(false));
        let screen = Screen::with_timeout(
            Box::new(RecordingPanel {
                pushes,
                halted,
            }),
            Duration::from_millis(0),
        );
        screen.write_title("X");
        std::thread::sleep(Duration::from_millis(5));
        assert!(screen.should_blank());

        // fresh activity resets the clock on a sane timeout
        let (screen, _, _) = recording_screen();
        screen.write_title("X");
        assert!(!screen.should_blank());
    }
}
