//! End-to-end dispatch tests against the software device.
//!
//! Commands go through the real host surface, registry and render threads.

use std::sync::mpsc;
use std::thread;

use glbridge_core::op::ClearMask;
use glbridge_core::{
    codes, gl, ArrayKind, Args, BridgeError, BridgeResult, ContextId, ElementType,
    ScriptBuffer, Value,
};
use glbridge_dispatch::{BridgeConfig, BridgeEvent, GraphicsBridge, Pending};
use glbridge_render::{DeviceProbe, SoftwareSurface};
use tokio::time::{timeout, Duration};

fn start() -> GraphicsBridge {
    GraphicsBridge::with_defaults().unwrap()
}

fn attach(bridge: &GraphicsBridge, probe: &DeviceProbe) -> ContextId {
    let surface = SoftwareSurface::new(16, 16).with_probe(probe.clone());
    bridge.on_surface_ready(Box::new(surface)).unwrap()
}

fn submit(bridge: &GraphicsBridge, id: ContextId, op: &str, args: Args) -> Pending<Value> {
    bridge.invoke(id, op, &args).unwrap().into_pending().unwrap()
}

async fn call(bridge: &GraphicsBridge, id: ContextId, op: &str, args: Args) -> BridgeResult<Value> {
    bridge.invoke(id, op, &args)?.value().await
}

fn rect_args(x: i32, y: i32, w: u32, h: u32) -> Args {
    Args::new().with("x", x).with("y", y).with("width", w).with("height", h)
}

fn rgba(r: f64, g: f64, b: f64, a: f64) -> Args {
    Args::new().with("red", r).with("green", g).with("blue", b).with("alpha", a)
}

#[tokio::test]
async fn test_execution_order_equals_submission_order() {
    let bridge = start();
    let probe = DeviceProbe::new();
    let id = attach(&bridge, &probe);

    let ops = ["flush", "createBuffer", "finish", "createTexture", "createProgram"];
    let mut submitted = Vec::new();
    let mut pendings = Vec::new();
    for i in 0..100 {
        let op = ops[i % ops.len()];
        submitted.push(op);
        pendings.push(submit(&bridge, id, op, Args::new()));
    }

    // Object names come from a counter on the device: each create
    // observes every earlier create.
    let mut names = Vec::new();
    for pending in pendings {
        if let Value::Name(n) = pending.await.unwrap() {
            names.push(n);
        }
    }
    assert_eq!(names, (1..=names.len() as u32).collect::<Vec<_>>());
    assert_eq!(probe.executed(), submitted);
}

#[test]
fn test_concurrent_submitters_keep_per_thread_order() {
    let bridge = start();
    let probe = DeviceProbe::new();
    let id = attach(&bridge, &probe);

    let per_thread: Vec<Vec<u32>> = thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                s.spawn(|| {
                    let pendings: Vec<_> = (0..50)
                        .map(|_| submit(&bridge, id, "createBuffer", Args::new()))
                        .collect();
                    pendings
                        .into_iter()
                        .map(|p| p.wait().unwrap().as_name().unwrap())
                        .collect()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut all = Vec::new();
    for names in per_thread {
        assert!(names.windows(2).all(|w| w[0] < w[1]));
        all.extend(names);
    }
    all.sort();
    assert_eq!(all, (1..=200).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_destroy_with_queued_commands_cancels_all() {
    let bridge = start();
    let probe = DeviceProbe::new();
    let id = attach(&bridge, &probe);

    probe.hold_after("flush");
    let first = submit(&bridge, id, "flush", Args::new());
    let queued: Vec<_> = (0..10)
        .map(|_| submit(&bridge, id, "clear", Args::new().with("mask", gl::COLOR_BUFFER_BIT)))
        .collect();
    assert!(probe.wait_until_held(std::time::Duration::from_secs(5)));

    let teardown = bridge.on_surface_destroyed(id).unwrap();
    // Disposed: further deferred calls fail synchronously
    assert!(matches!(
        bridge.invoke(id, "flush", &Args::new()),
        Err(BridgeError::ContextLost(c)) if c == id
    ));
    probe.release_hold();

    assert_eq!(first.await, Ok(Value::None));
    for pending in queued {
        assert_eq!(pending.await, Err(BridgeError::ContextLost(id)));
    }
    teardown.await.unwrap();

    assert_eq!(probe.executed(), vec!["flush"]);
    assert!(probe.is_released());
    assert_eq!(bridge.stats().cancelled, 10);
    assert!(matches!(
        bridge.invoke(id, "flush", &Args::new()),
        Err(BridgeError::UnknownContext(_))
    ));
}

#[tokio::test]
async fn test_destroy_mid_queue_after_viewport() {
    let bridge = start();
    let probe = DeviceProbe::new();
    let id = attach(&bridge, &probe);

    // A program and vertex buffer would make drawArrays valid; here it
    // never runs, so none are set up.
    probe.hold_after("viewport");
    let viewport = submit(&bridge, id, "viewport", rect_args(0, 0, 100, 100));
    let _color = submit(&bridge, id, "clearColor", rgba(1.0, 0.0, 0.0, 1.0));
    let mut clear = submit(&bridge, id, "clear", Args::new().with("mask", gl::COLOR_BUFFER_BIT));
    let mut draw = submit(
        &bridge,
        id,
        "drawArrays",
        Args::new().with("mode", gl::TRIANGLES).with("first", 0).with("count", 3),
    );
    assert!(probe.wait_until_held(std::time::Duration::from_secs(5)));

    let teardown = bridge.on_surface_destroyed(id).unwrap();
    probe.release_hold();
    teardown.await.unwrap();

    // Both were resolved before the device was released.
    assert_eq!(clear.try_result(), Some(Err(BridgeError::ContextLost(id))));
    assert_eq!(draw.try_result(), Some(Err(BridgeError::ContextLost(id))));
    assert_eq!(viewport.await, Ok(Value::None));
    assert_eq!(probe.executed(), vec!["viewport"]);
    assert!(probe.is_released());
}

#[test]
fn test_ids_unique_under_churn() {
    let bridge = GraphicsBridge::new(BridgeConfig { render_threads: 3, ..Default::default() }).unwrap();

    let ids: Vec<ContextId> = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                s.spawn(|| {
                    (0..25)
                        .map(|_| {
                            let id = bridge
                                .on_surface_ready(Box::new(SoftwareSurface::new(4, 4)))
                                .unwrap();
                            bridge.destroy_blocking(id).unwrap();
                            id
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });

    let unique: std::collections::HashSet<_> = ids.iter().collect();
    assert_eq!(unique.len(), 200);
    assert!(bridge.live_contexts().is_empty());

    // A stale id never aliases a newer context
    let fresh = bridge.on_surface_ready(Box::new(SoftwareSurface::new(4, 4))).unwrap();
    assert!(!ids.contains(&fresh));
    assert!(matches!(
        bridge.invoke(ids[0], "getParameter", &Args::new().with("pname", gl::VIEWPORT)),
        Err(BridgeError::UnknownContext(_))
    ));
    // Second destroy of a gone context is a no-op
    bridge.destroy_blocking(ids[0]).unwrap();
}

#[tokio::test]
async fn test_read_pixels_returns_owned_copy() {
    let bridge = start();
    let id = attach(&bridge, &DeviceProbe::new());

    call(&bridge, id, "clearColor", rgba(1.0, 0.0, 0.0, 1.0)).await.unwrap();
    call(&bridge, id, "clear", Args::new().with("mask", gl::COLOR_BUFFER_BIT)).await.unwrap();

    let dest = ScriptBuffer::new(ArrayKind::Typed(ElementType::Uint8), 16);
    let args = rect_args(0, 0, 2, 2)
        .with("format", gl::RGBA)
        .with("type", gl::UNSIGNED_BYTE)
        .with("pixels", dest.clone());
    let pending = submit(&bridge, id, "readPixels", args);
    // Scribble on the destination while the read is in flight
    dest.write_bytes(0, &[7; 16]).unwrap();

    let pixels = pending.await.unwrap().into_bytes().unwrap();
    assert_eq!(pixels.bytes(), [255, 0, 0, 255].repeat(4).as_slice());
    // Resolving copies the pixels into the caller's buffer
    assert_eq!(dest.to_bytes(), [255, 0, 0, 255].repeat(4));

    dest.write_bytes(0, &[0; 16]).unwrap();
    assert_eq!(pixels.bytes()[..4], [255, 0, 0, 255]);
    assert_eq!(dest.to_bytes(), vec![0; 16]);
}

#[tokio::test]
async fn test_read_pixels_into_small_buffer_is_rejected() {
    let bridge = start();
    let id = attach(&bridge, &DeviceProbe::new());

    let dest = ScriptBuffer::new(ArrayKind::Typed(ElementType::Uint8), 8);
    let args = rect_args(0, 0, 2, 2)
        .with("format", gl::RGBA)
        .with("type", gl::UNSIGNED_BYTE)
        .with("pixels", dest.clone());
    assert!(matches!(bridge.invoke(id, "readPixels", &args), Err(BridgeError::InvalidArgument(_))));
    assert_eq!(dest.to_bytes(), vec![0; 8]);
}

#[tokio::test]
async fn test_oversized_read_leaves_shared_worker_running() {
    let config = BridgeConfig { render_threads: 1, ..Default::default() };
    let bridge = GraphicsBridge::new(config).unwrap();
    let first = attach(&bridge, &DeviceProbe::new());
    let second = attach(&bridge, &DeviceProbe::new());

    let huge = rect_args(0, 0, 0x8000_0000, 0x8000_0000)
        .with("format", gl::RGBA)
        .with("type", gl::UNSIGNED_BYTE);
    assert!(matches!(bridge.invoke(first, "readPixels", &huge), Err(BridgeError::InvalidArgument(_))));

    let image = Args::new()
        .with("target", gl::TEXTURE_2D)
        .with("format", gl::RGBA)
        .with("type", gl::UNSIGNED_BYTE)
        .with("width", u32::MAX)
        .with("height", u32::MAX);
    assert!(matches!(bridge.invoke(first, "texImage2D", &image), Err(BridgeError::InvalidArgument(_))));

    let flushed = timeout(Duration::from_secs(5), call(&bridge, second, "flush", Args::new())).await;
    assert_eq!(flushed.unwrap(), Ok(Value::None));
    assert_eq!(call(&bridge, first, "isContextLost", Args::new()).await, Ok(Value::Bool(false)));
}

#[tokio::test]
async fn test_reentrant_calls_from_render_thread() {
    let bridge = start();
    let id = attach(&bridge, &DeviceProbe::new());
    let host = bridge.host();
    let (tx, rx) = mpsc::channel();

    bridge
        .add_frame_callback(id, move |frame| {
            let submitted = host.invoke(frame.context, "flush", &Args::new()).map(|_| ());
            let waited = Pending::resolved(frame.context, Ok(())).wait();
            let immediate = host
                .invoke(frame.context, "isContextLost", &Args::new())
                .map(|i| i.is_immediate());
            let _ = tx.send((submitted, waited, immediate));
        })
        .unwrap();

    let frame = bridge.on_frame_tick(id).unwrap().unwrap();
    timeout(Duration::from_secs(5), frame).await.unwrap().unwrap();

    let (submitted, waited, immediate) = rx.recv().unwrap();
    assert_eq!(submitted, Err(BridgeError::ReentrantCall));
    assert_eq!(waited, Err(BridgeError::ReentrantCall));
    assert_eq!(immediate, Ok(true));
}

#[tokio::test]
async fn test_native_error_does_not_halt_queue() {
    let bridge = start();
    let id = attach(&bridge, &DeviceProbe::new());
    let mut events = bridge.subscribe();

    let bind = Args::new().with("target", gl::ARRAY_BUFFER).with("buffer", 77);
    let failing = submit(&bridge, id, "bindBuffer", bind);
    let after = submit(&bridge, id, "flush", Args::new());
    let error = submit(&bridge, id, "getError", Args::new());
    let cleared = submit(&bridge, id, "getError", Args::new());

    let err = failing.await.unwrap_err();
    assert_eq!(err.native_code(), Some(codes::INVALID_OPERATION));
    assert_eq!(after.await, Ok(Value::None));
    assert_eq!(error.await, Ok(Value::Int(codes::INVALID_OPERATION.into())));
    assert_eq!(cleared.await, Ok(Value::Int(codes::NO_ERROR.into())));

    let native = loop {
        match timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap() {
            BridgeEvent::NativeError { code, .. } => break code,
            _ => continue,
        }
    };
    assert_eq!(native, codes::INVALID_OPERATION);
    assert_eq!(bridge.stats().failed, 1);
}

#[tokio::test]
async fn test_validation_is_synchronous() {
    let bridge = start();
    let probe = DeviceProbe::new();
    let id = attach(&bridge, &probe);

    assert!(matches!(
        bridge.invoke(id, "clear", &Args::new().with("mask", 0x1)),
        Err(BridgeError::InvalidArgument(_))
    ));
    assert!(matches!(
        bridge.invoke(id, "texImage3D", &Args::new()),
        Err(BridgeError::InvalidArgument(_))
    ));
    assert!(matches!(
        bridge.invoke(ContextId(999), "flush", &Args::new()),
        Err(BridgeError::UnknownContext(_))
    ));
    let detached = ScriptBuffer::from_slice(&[1u16, 2, 3]);
    detached.detach();
    let args = Args::new()
        .with("target", gl::ARRAY_BUFFER)
        .with("usage", gl::STATIC_DRAW)
        .with("data", detached);
    assert!(matches!(bridge.invoke(id, "bufferData", &args), Err(BridgeError::InvalidBuffer(_))));

    call(&bridge, id, "finish", Args::new()).await.unwrap();
    // Nothing malformed reached the render thread
    assert_eq!(probe.executed(), vec!["finish"]);
}

#[tokio::test]
async fn test_immediate_reads_published_state() {
    let bridge = start();
    let id = attach(&bridge, &DeviceProbe::new());

    let before = bridge
        .invoke(id, "getParameter", &Args::new().with("pname", gl::VIEWPORT))
        .unwrap();
    assert!(before.is_immediate());
    assert_eq!(before.value().await, Ok(Value::Ints(vec![0, 0, 16, 16])));

    call(&bridge, id, "viewport", rect_args(2, 3, 4, 5)).await.unwrap();
    call(&bridge, id, "enable", Args::new().with("cap", gl::SCISSOR_TEST)).await.unwrap();

    let viewport = call(&bridge, id, "getParameter", Args::new().with("pname", gl::VIEWPORT)).await;
    assert_eq!(viewport, Ok(Value::Ints(vec![2, 3, 4, 5])));
    let scissor = call(&bridge, id, "getParameter", Args::new().with("pname", gl::SCISSOR_TEST)).await;
    assert_eq!(scissor, Ok(Value::Bool(true)));
    assert_eq!(
        call(&bridge, id, "drawingBufferSize", Args::new()).await,
        Ok(Value::Ints(vec![16, 16]))
    );
    assert!(bridge.context_state(id).unwrap().scissor_test);
    assert_eq!(bridge.stats().immediate, 4);
}

#[tokio::test]
async fn test_clear_mask_round_trips_through_device() {
    let bridge = start();
    let id = attach(&bridge, &DeviceProbe::new());
    let mask = (ClearMask::COLOR | ClearMask::DEPTH).bits();
    assert_eq!(call(&bridge, id, "clear", Args::new().with("mask", mask)).await, Ok(Value::None));
}
