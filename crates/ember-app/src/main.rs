// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use std::{fs, io};

use anyhow::{Context, Result};
use clap::Parser;
use ember_core::{init_tracing, EngineError, Origin, TracingSink};
use ember_platform::{create_window, framebuffer_size};
use ember_render::{EngineConfig, FrameOutcome, RenderSize, Renderer};
use ember_render_vk::VkRenderer;
use serde::Deserialize;
use tracing::{error, info};

use ember_platform::winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowId},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML file with a `[render]` table
    #[arg(long, default_value = "ember.toml")]
    config: PathBuf,
    /// Overrides `render.frames_in_flight`
    #[arg(long)]
    frames_in_flight: Option<u32>,
    /// Prefer tearing present modes over FIFO
    #[arg(long)]
    no_vsync: bool,
}

#[derive(Debug, Deserialize, Default)]
struct AppCfg {
    #[serde(default)]
    render: EngineConfig,
}

fn load_cfg(path: &Path) -> Result<AppCfg> {
    match fs::read_to_string(path) {
        Ok(s) => toml::from_str::<AppCfg>(&s).with_context(|| format!("parse {}", path.display())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!("{} not found, using defaults", path.display());
            Ok(AppCfg::default())
        }
        Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
    }
}

/// File, then environment, then command line.
fn engine_config(args: &Args, file: AppCfg) -> EngineConfig {
    let mut cfg = file.render.with_env_overrides();
    if let Some(n) = args.frames_in_flight {
        cfg.frames_in_flight = n;
    }
    if args.no_vsync {
        cfg.vsync = false;
    }
    cfg
}

struct App {
    cfg: EngineConfig,
    window: Option<Window>,
    renderer: Option<VkRenderer>,
    render_size: RenderSize,
    fatal: Option<EngineError>,

    paused: bool,
    frames: u32,
    dropped: u32,
    last_fps_instant: Instant,
}

impl App {
    fn new(cfg: EngineConfig) -> Self {
        App {
            cfg,
            window: None,
            renderer: None,
            render_size: RenderSize::new(1, 1),
            fatal: None,
            paused: false,
            frames: 0,
            dropped: 0,
            last_fps_instant: Instant::now(),
        }
    }

    /// Drops the renderer before the window it presents to, then stops.
    fn fail(&mut self, event_loop: &ActiveEventLoop, err: EngineError) {
        error!("fatal: {err}");
        self.renderer = None;
        self.window = None;
        self.fatal = Some(err);
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window = match create_window(event_loop, &self.cfg.app_name) {
            Ok(window) => window,
            Err(e) => {
                let err = EngineError::fatal(Origin::InitializationFailed, format!("{e:#}"));
                self.fail(event_loop, err);
                return;
            }
        };

        let (width, height) = framebuffer_size(&window);
        self.render_size = RenderSize::new(width, height);
        self.paused = self.render_size.is_degenerate();

        let mut renderer = match VkRenderer::new(
            &window,
            &window,
            self.render_size,
            &self.cfg,
            Arc::new(TracingSink),
        ) {
            Ok(renderer) => renderer,
            Err(e) => {
                self.window = Some(window);
                self.fail(event_loop, e);
                return;
            }
        };
        renderer.set_clear_color(self.cfg.clear_color);
        renderer.on_swapchain_change(|extent, images, _views| {
            info!(
                "swapchain → {}x{}, {images} images",
                extent.width, extent.height
            );
        });
        info!(
            "backend = vk ({}), vsync cfg = {}, msaa<={:?}",
            renderer.backend().device_name(),
            self.cfg.vsync,
            renderer.msaa_samples()
        );

        event_loop.set_control_flow(if self.cfg.vsync {
            ControlFlow::Wait
        } else {
            ControlFlow::Poll
        });
        info!("resumed → paused={}", self.paused);
        if !self.paused {
            window.request_redraw();
        }

        self.renderer = Some(renderer);
        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                // renderer before window
                self.renderer = None;
                self.window = None;
                event_loop.exit();
            }

            WindowEvent::Resized(new_size) => {
                self.render_size = RenderSize::new(new_size.width, new_size.height);
                let now_paused = self.render_size.is_degenerate();
                if self.paused != now_paused {
                    self.paused = now_paused;
                    info!(
                        "Resized → {}x{} (paused={})",
                        self.render_size.width, self.render_size.height, self.paused
                    );
                }

                let resized = match &mut self.renderer {
                    Some(renderer) => renderer.resize(self.render_size),
                    None => Ok(()),
                };
                if let Err(e) = resized {
                    self.fail(event_loop, e);
                    return;
                }
                if !self.paused {
                    if let Some(w) = &self.window {
                        w.request_redraw();
                    }
                }
            }

            WindowEvent::RedrawRequested => {
                if self.paused {
                    return;
                }
                let rendered = match &mut self.renderer {
                    Some(renderer) => renderer.render(),
                    None => return,
                };
                match rendered {
                    // count only frames that were actually presented
                    Ok(FrameOutcome::Presented) => self.frames = self.frames.saturating_add(1),
                    Ok(FrameOutcome::Dropped) => self.dropped = self.dropped.saturating_add(1),
                    Err(e) => self.fail(event_loop, e),
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.renderer.is_none() {
            return;
        }

        if self.paused {
            // minimized → sleep until the next resize
            event_loop.set_control_flow(ControlFlow::Wait);
            self.frames = 0;
            self.dropped = 0;
            return;
        }

        event_loop.set_control_flow(if self.cfg.vsync {
            ControlFlow::Wait
        } else {
            ControlFlow::Poll
        });
        if let Some(w) = &self.window {
            w.request_redraw();
        }

        let now = Instant::now();
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            info!("fps ~ {} (dropped {})", self.frames, self.dropped);
            self.frames = 0;
            self.dropped = 0;
            self.last_fps_instant = now;
        }
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let cfg = engine_config(&args, load_cfg(&args.config)?);
    let event_loop: EventLoop<()> = EventLoop::new()?;

    let mut app = App::new(cfg);
    event_loop.run_app(&mut app)?;
    match app.fatal.take() {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

fn main() -> ExitCode {
    init_tracing();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
