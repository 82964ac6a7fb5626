//! Headless driver for the graphics bridge.
//!
//! ```text
//! glbridge-demo [config.json] [--frames N] [--gpu]
//! ```
//!
//! Opens two software contexts (and a wgpu one with `--gpu`), uploads a
//! triangle, runs N frame ticks and logs the dispatch counters.

use std::error::Error;
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};

use glbridge_core::{gl, Args, ContextId, ScriptBuffer, Value};
use glbridge_dispatch::{BridgeConfig, BridgeEvent, GraphicsBridge, Invocation};
use glbridge_render::{SoftwareSurface, WgpuSurface};

const VERTEX_SOURCE: &str = "attribute vec2 pos; void main() { gl_Position = vec4(pos, 0.0, 1.0); }";
const FRAGMENT_SOURCE: &str = "void main() { gl_FragColor = vec4(1.0); }";

struct Options {
    config: BridgeConfig,
    frames: u64,
    gpu: bool,
}

fn parse_options() -> Result<Options, Box<dyn Error>> {
    let mut config = BridgeConfig::default();
    let mut frames = 120;
    let mut gpu = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--gpu" => gpu = true,
            "--frames" => {
                let value = args.next().ok_or("--frames needs a value")?;
                frames = value.parse()?;
            }
            path => {
                let text = fs::read_to_string(path)?;
                config = BridgeConfig::from_json(&text)?;
                info!("Loaded configuration from {path}");
            }
        }
    }
    Ok(Options { config, frames, gpu })
}

fn call(bridge: &GraphicsBridge, id: ContextId, op: &str, args: Args) -> Result<Value, Box<dyn Error>> {
    match bridge.invoke(id, op, &args)? {
        Invocation::Immediate(value) => Ok(value),
        Invocation::Pending(pending) => Ok(pending.wait()?),
    }
}

fn name_of(value: Value, op: &str) -> Result<u32, Box<dyn Error>> {
    value.as_name().ok_or_else(|| format!("{op} returned no object name").into())
}

/// Compile a pass-through program and upload one triangle.
fn prepare_scene(bridge: &GraphicsBridge, id: ContextId) -> Result<(), Box<dyn Error>> {
    let program = name_of(call(bridge, id, "createProgram", Args::new())?, "createProgram")?;
    for (kind, source) in [(gl::VERTEX_SHADER, VERTEX_SOURCE), (gl::FRAGMENT_SHADER, FRAGMENT_SOURCE)] {
        let shader = name_of(call(bridge, id, "createShader", Args::new().with("type", kind))?, "createShader")?;
        call(bridge, id, "shaderSource", Args::new().with("shader", shader).with("source", source))?;
        call(bridge, id, "compileShader", Args::new().with("shader", shader))?;
        call(bridge, id, "attachShader", Args::new().with("program", program).with("shader", shader))?;
    }
    call(bridge, id, "linkProgram", Args::new().with("program", program))?;
    call(bridge, id, "useProgram", Args::new().with("program", program))?;

    let vertices = ScriptBuffer::from_slice(&[-0.5f32, -0.5, 0.5, -0.5, 0.0, 0.5]);
    let vbo = name_of(call(bridge, id, "createBuffer", Args::new())?, "createBuffer")?;
    call(bridge, id, "bindBuffer", Args::new().with("target", gl::ARRAY_BUFFER).with("buffer", vbo))?;
    call(
        bridge,
        id,
        "bufferData",
        Args::new()
            .with("target", gl::ARRAY_BUFFER)
            .with("usage", gl::STATIC_DRAW)
            .with("data", vertices),
    )?;
    Ok(())
}

/// Queue one frame's commands without waiting on them.
fn queue_frame(bridge: &GraphicsBridge, id: ContextId, frame: u64, draws: bool) -> Result<(), Box<dyn Error>> {
    let phase = (frame % 60) as f64 / 60.0;
    let clear_color = Args::new()
        .with("red", phase)
        .with("green", 0.2)
        .with("blue", 1.0 - phase)
        .with("alpha", 1.0);
    bridge.invoke(id, "clearColor", &clear_color)?;
    bridge.invoke(id, "clear", &Args::new().with("mask", gl::COLOR_BUFFER_BIT))?;
    if draws {
        let draw = Args::new().with("mode", gl::TRIANGLES).with("first", 0).with("count", 3);
        bridge.invoke(id, "drawArrays", &draw)?;
    }
    Ok(())
}

fn sample_center(bridge: &GraphicsBridge, id: ContextId) -> Result<Option<Vec<u8>>, Box<dyn Error>> {
    let (width, height) = match call(bridge, id, "drawingBufferSize", Args::new())? {
        Value::Ints(size) if size.len() == 2 => (size[0], size[1]),
        _ => return Ok(None),
    };
    let args = Args::new()
        .with("x", width / 2)
        .with("y", height / 2)
        .with("width", 1)
        .with("height", 1)
        .with("format", gl::RGBA)
        .with("type", gl::UNSIGNED_BYTE);
    Ok(call(bridge, id, "readPixels", args)?.into_bytes().map(|owned| owned.bytes().to_vec()))
}

fn run(options: Options) -> Result<(), Box<dyn Error>> {
    let bridge = GraphicsBridge::new(options.config)?;
    let mut events = bridge.subscribe();

    let mut contexts = Vec::new();
    for i in 0..2 {
        let surface = SoftwareSurface::new(320, 240).with_label(format!("software-{i}"));
        contexts.push((bridge.on_surface_ready(Box::new(surface))?, true));
    }
    if options.gpu {
        let surface = WgpuSurface::new(320, 240).with_label("wgpu-headless");
        contexts.push((bridge.on_surface_ready(Box::new(surface))?, false));
    }

    for (id, draws) in &contexts {
        if *draws {
            prepare_scene(&bridge, *id)?;
        }
    }

    let presented = Arc::new(AtomicU64::new(0));
    for (id, _) in &contexts {
        let counter = presented.clone();
        bridge.add_frame_callback(*id, move |info| {
            counter.fetch_add(1, Ordering::Relaxed);
            debug!("{}: frame {} presented with {} command(s)", info.context, info.frame, info.commands);
        })?;
    }

    for frame in 0..options.frames {
        let mut ticks = Vec::with_capacity(contexts.len());
        for (id, draws) in &contexts {
            if let Err(e) = queue_frame(&bridge, *id, frame, *draws) {
                warn!("{id}: frame {frame} skipped: {e}");
                continue;
            }
            if let Some(tick) = bridge.on_frame_tick(*id)? {
                ticks.push(tick);
            }
        }
        for tick in ticks {
            tick.wait()?;
        }
        if frame % 30 == 0 {
            for (id, _) in &contexts {
                match sample_center(&bridge, *id) {
                    Ok(Some(pixel)) => info!("{id}: frame {frame} center pixel {pixel:?}"),
                    Ok(None) => {}
                    Err(e) => warn!("{id}: readPixels failed: {e}"),
                }
            }
        }
    }

    for (id, _) in &contexts {
        bridge.destroy_blocking(*id)?;
    }

    let mut published = 0usize;
    while let Ok(event) = events.try_recv() {
        if let BridgeEvent::NativeError { context, code, message } = &event {
            warn!("{context}: native error 0x{code:04X}: {message}");
        }
        published += 1;
    }

    info!("Callbacks observed {} presented frame(s)", presented.load(Ordering::Relaxed));
    info!("Received {published} bridge event(s)");
    info!("Dispatch stats: {}", serde_json::to_string(&bridge.stats())?);
    info!("Event stats: {}", serde_json::to_string(&bridge.event_stats())?);
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("Starting glbridge demo...");

    let result = parse_options().and_then(run);
    if let Err(e) = result {
        error!("Demo failed: {e}");
        std::process::exit(1);
    }
}
