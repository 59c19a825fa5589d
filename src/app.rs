use crate::{Prepared, print_summary};
use anyhow::{Context, Result};
use cogex_core::stimulus::WHITE;
use cogex_core::{Stage, StimulusDescriptor, StimulusKind, StimulusRenderer, Ticket};
use cogex_experiment::{
    DisplayInfo, Engine, EngineEvent, EnvironmentDescriptor, ExperimentConfig, JsonFileTransmitter,
};
use cogex_render::{SkiaRenderer, load_font};
use cogex_timing::{HighPrecisionTimer, Timer};
use pixels::{Pixels, SurfaceTexture};
use rand::rngs::StdRng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{Key, NamedKey},
    window::{Fullscreen, Window, WindowId},
};

/// Frames measured for display timing before the subject may start.
const CALIBRATION_FRAMES: usize = 120;

type SessionEngine =
    Engine<HighPrecisionTimer, SkiaRenderer<HighPrecisionTimer>, StdRng, JsonFileTransmitter>;
type Screen = SkiaRenderer<HighPrecisionTimer>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Calibrating,
    Waiting,
    Running,
    Done,
}

pub struct App {
    window: Option<Arc<Window>>,
    pixels: Option<Pixels<'static>>,
    config: ExperimentConfig,
    pending: Option<Prepared>,
    /// Renderer used before the session owns it.
    preview: Option<Screen>,
    engine: Option<SessionEngine>,
    timer: HighPrecisionTimer,
    last_frame: Option<u64>,
    mode: Mode,
    display: Option<DisplayInfo>,
    should_exit: bool,
    /// First fatal error; returned from [`App::run`] once the loop ends.
    failure: Option<anyhow::Error>,
}

fn key_name(key: &Key) -> Option<String> {
    match key {
        Key::Named(named) => Some(format!("{named:?}")),
        Key::Character(c) => Some(c.as_str().to_lowercase()),
        _ => None,
    }
}

fn preview_ticket() -> Ticket {
    Ticket {
        generation: 0,
        stage: Stage::Test,
    }
}

impl App {
    pub fn new(prepared: Prepared) -> Self {
        Self {
            window: None,
            pixels: None,
            config: prepared.config.clone(),
            pending: Some(prepared),
            preview: None,
            engine: None,
            timer: HighPrecisionTimer::new(),
            last_frame: None,
            mode: Mode::Calibrating,
            display: None,
            should_exit: false,
            failure: None,
        }
    }

    pub fn run(mut self) -> Result<()> {
        let event_loop = EventLoop::new()?;
        println!("Press SPACE to start or ESC to exit.\n");
        event_loop.run_app(&mut self)?;
        self.outcome()
    }

    fn outcome(&mut self) -> Result<()> {
        match self.failure.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn record_failure(&mut self, e: anyhow::Error) {
        error!("{e:#}");
        self.failure.get_or_insert(e);
    }

    fn fail(&mut self, e: anyhow::Error, event_loop: &ActiveEventLoop) {
        self.record_failure(e);
        self.cleanup_and_exit(event_loop);
    }

    fn create_window_and_surface(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let monitor = event_loop
            .primary_monitor()
            .or_else(|| event_loop.available_monitors().next())
            .context("no monitor available")?;
        let refresh_rate_hz = monitor
            .refresh_rate_millihertz()
            .map(|rate| rate as f64 / 1000.0);

        let attributes = Window::default_attributes()
            .with_title("Cogex")
            .with_fullscreen(Some(Fullscreen::Borderless(Some(monitor.clone()))))
            .with_resizable(false);
        let window = Arc::new(event_loop.create_window(attributes)?);
        let size = window.inner_size();
        let scale_factor = window.scale_factor();

        println!("Display Configuration:");
        println!("  Physical size: {}×{}", size.width, size.height);
        println!("  Scale factor: {:.2}", scale_factor);
        if let Some(hz) = refresh_rate_hz {
            println!("  Refresh rate: {:.1} Hz", hz);
        }
        self.display = Some(DisplayInfo {
            width: size.width,
            height: size.height,
            scale_factor,
            refresh_rate_hz,
        });

        let pending = self.pending.as_ref().context("session already started")?;
        let font = load_font(&pending.font)?;
        let mut preview = SkiaRenderer::new(size.width, size.height, font, self.timer.clone())?;
        preview.check_surface()?;
        preview.present(
            &StimulusDescriptor::new(StimulusKind::Fixation),
            preview_ticket(),
        );

        let surface = SurfaceTexture::new(size.width, size.height, window.clone());
        self.pixels = Some(Pixels::new(size.width, size.height, surface)?);
        self.preview = Some(preview);

        window.set_cursor_visible(false);
        window.request_redraw();
        self.window = Some(window);
        Ok(())
    }

    fn screen_mut(&mut self) -> Option<&mut Screen> {
        match self.engine.as_mut() {
            Some(engine) => Some(engine.renderer_mut()),
            None => self.preview.as_mut(),
        }
    }

    fn render(&mut self) -> Result<()> {
        let Some(mut pixels) = self.pixels.take() else {
            return Ok(());
        };
        let stats = self.screen_mut().map(|screen| screen.render_frame(pixels.frame_mut()));
        let presented = pixels.render();
        self.pixels = Some(pixels);
        presented?;

        let now = self.timer.now();
        if let Some(last) = self.last_frame.replace(now) {
            if self.mode == Mode::Calibrating {
                self.timer.record_frame(Duration::from_nanos(now - last));
                if self.timer.frame_count() >= CALIBRATION_FRAMES {
                    self.finish_calibration();
                }
            }
        }
        if let Some(stats) = stats {
            debug!(
                clear_ms = stats.clear.as_secs_f64() * 1e3,
                draw_ms = stats.draw.as_secs_f64() * 1e3,
                copy_ms = stats.copy.as_secs_f64() * 1e3,
                dirty = stats.dirty_count,
                "frame"
            );
        }
        Ok(())
    }

    fn finish_calibration(&mut self) {
        let stats = self.timer.calibration_stats();
        info!(
            fps = stats.effective_fps,
            jitter_ms = stats.jitter_ns / 1e6,
            "display timing calibrated"
        );
        self.mode = Mode::Waiting;
        if let Some(preview) = self.preview.as_mut() {
            preview.present(
                &StimulusDescriptor::new(StimulusKind::Letter {
                    content: "Press SPACE".to_string(),
                    color: WHITE,
                }),
                preview_ticket(),
            );
        }
    }

    fn start_session(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let (Some(prepared), Some(mut screen)) = (self.pending.take(), self.preview.take()) else {
            return Ok(());
        };
        screen.stop();
        let mut environment =
            EnvironmentDescriptor::detect().with_timing(self.timer.calibration_stats());
        if let Some(display) = self.display.clone() {
            environment = environment.with_display(display);
        }
        let mut engine = Engine::new(
            &prepared.config,
            prepared.specs,
            self.timer.clone(),
            screen,
            prepared.rng,
            prepared.client,
            environment,
        )?;
        info!(session = %engine.session().session_id, "session started");
        let events = engine.start();
        self.engine = Some(engine);
        self.mode = Mode::Running;
        self.handle_events(events, event_loop);
        Ok(())
    }

    fn update(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(engine) = self.engine.as_mut() {
            let events = engine.update();
            self.handle_events(events, event_loop);
        }
    }

    fn handle_events(&mut self, events: Vec<EngineEvent>, event_loop: &ActiveEventLoop) {
        for event in events {
            match event {
                EngineEvent::SessionFinished => {
                    self.mode = Mode::Done;
                    self.cleanup_and_exit(event_loop);
                }
                other => debug!(?other, "engine event"),
            }
        }
    }

    fn handle_key(&mut self, key: &Key, event_loop: &ActiveEventLoop) {
        match (key, self.mode) {
            (Key::Named(NamedKey::Escape), _) => self.cleanup_and_exit(event_loop),
            (Key::Named(NamedKey::Space), Mode::Waiting) => {
                if let Err(e) = self.start_session(event_loop) {
                    self.fail(e.context("failed to start session"), event_loop);
                }
            }
            (_, Mode::Running) => {
                let Some(name) = key_name(key) else {
                    return;
                };
                let Some(symbol) = self.config.symbol_for_key(&name).map(str::to_string) else {
                    debug!(key = name, "unmapped key");
                    return;
                };
                if let Some(engine) = self.engine.as_mut() {
                    let events = engine.handle_input(&symbol);
                    self.handle_events(events, event_loop);
                }
            }
            _ => {}
        }
    }

    fn handle_resize(&mut self, size: PhysicalSize<u32>) {
        if let Some(pixels) = &mut self.pixels {
            if let Err(e) = pixels.resize_surface(size.width, size.height) {
                warn!("failed to resize surface: {e}");
            }
            if let Err(e) = pixels.resize_buffer(size.width, size.height) {
                warn!("failed to resize buffer: {e}");
            }
        }
        if let Some(screen) = self.screen_mut() {
            if let Err(e) = screen.resize(size.width, size.height) {
                warn!("failed to resize canvas: {e}");
            }
        }
        if let Some(display) = self.display.as_mut() {
            display.width = size.width;
            display.height = size.height;
        }
        info!(width = size.width, height = size.height, "display resized");
    }

    fn cleanup_and_exit(&mut self, event_loop: &ActiveEventLoop) {
        if self.should_exit {
            return;
        }
        if let Some(window) = &self.window {
            window.set_cursor_visible(true);
        }
        if let Some(engine) = self.engine.as_mut() {
            let payload = engine.finalize();
            print_summary(&payload.trials);
        }
        if self.failure.is_none() {
            println!("\nExperiment completed. Thank you!");
        }
        self.should_exit = true;
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            if let Err(e) = self.create_window_and_surface(event_loop) {
                self.fail(e.context("failed to create window and surface"), event_loop);
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => self.cleanup_and_exit(event_loop),
            WindowEvent::RedrawRequested => {
                if let Err(e) = self.render() {
                    self.fail(e.context("render failed"), event_loop);
                    return;
                }
                self.update(event_loop);
                if let Some(window) = &self.window {
                    window.request_redraw();
                }
            }
            WindowEvent::KeyboardInput { event, .. }
                if event.state.is_pressed() && !event.repeat =>
            {
                self.handle_key(&event.logical_key, event_loop);
            }
            WindowEvent::Resized(size) => self.handle_resize(size),
            WindowEvent::ScaleFactorChanged { scale_factor, .. } => {
                if let Some(display) = self.display.as_mut() {
                    display.scale_factor = scale_factor;
                }
                if let Some(size) = self.window.as_ref().map(|w| w.inner_size()) {
                    self.handle_resize(size);
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.should_exit {
            event_loop.exit();
        }
    }
}
