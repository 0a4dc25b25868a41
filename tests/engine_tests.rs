use frameloom::gpu::HeadlessDraw;
use frameloom::{
    DecodedImage, Engine, EngineConfig, EngineError, FrameOutcome, HeadlessBackend,
    HeadlessSurface, Key, Mat4, MemoryDecoder, RenderableUbo, Vec3,
};
use std::sync::Arc;
use std::thread;

fn engine(config: EngineConfig, surface: HeadlessSurface) -> (Arc<HeadlessBackend>, Engine<HeadlessBackend, HeadlessSurface>) {
    let backend = Arc::new(HeadlessBackend::new());
    let decoder = Arc::new(MemoryDecoder::new());
    for name in ["albedo", "normal", "roughness"] {
        decoder.insert(name, DecodedImage::solid_color(4, 4, [200, 100, 50, 255]));
    }
    let engine = Engine::new(backend.clone(), surface, decoder, config).unwrap();
    (backend, engine)
}

fn small_config() -> EngineConfig {
    EngineConfig {
        textures_max: 16,
        placeholder_extent: 2,
        ..Default::default()
    }
}

#[test]
fn test_frames_with_concurrent_input_and_loading() {
    let (backend, mut engine) = engine(small_config(), HeadlessSurface::new(3));

    let slots = engine
        .textures()
        .register_batch(&["albedo", "normal", "roughness", "missing"])
        .unwrap();
    assert_eq!(slots[3], engine.textures().placeholder_slot());

    let cube = engine
        .create_renderable(HeadlessDraw::new("cube"), RenderableUbo::default())
        .unwrap();

    let camera = Arc::clone(engine.camera());
    let input_thread = thread::spawn(move || {
        for i in 0..500 {
            camera.on_mouse_move(0.5, if i % 2 == 0 { 0.25 } else { -0.25 });
        }
    });

    engine.input().key_changed(Key::W, true);
    for frame in 0..60 {
        let outcome = engine
            .frame(|ctx| {
                let model = Mat4::from_rotation_y(frame as f32 * 0.1);
                cube.set_transform(ctx.slot, &RenderableUbo::new(model, frame as f32 / 60.0))?;
                cube.draw(ctx.commands, ctx.slot)
            })
            .unwrap();
        assert!(matches!(outcome, FrameOutcome::Presented { .. }));
    }
    input_thread.join().unwrap();

    assert!(backend.hazards().is_empty());
    assert_eq!(engine.driver().profiler().frames, 60);
    let start = Vec3::from_array(engine.config().camera.position);
    assert!(engine.camera().pose().position.distance(start) > 0.5);
    engine.driver().wait_idle().unwrap();
}

#[test]
fn test_stalled_gpu_times_out_as_device_loss() {
    let config = EngineConfig {
        fence_timeout_ms: Some(20),
        ..small_config()
    };
    let (backend, mut engine) = engine(config, HeadlessSurface::new(2));

    backend.stall_gpu(true);
    engine.frame(|_| Ok(())).unwrap();
    engine.frame(|_| Ok(())).unwrap();
    let err = engine.frame(|_| Ok(())).unwrap_err();
    assert!(matches!(err, EngineError::FenceTimeout { .. }));
    assert!(err.is_device_loss());
    assert!(err.is_fatal());

    backend.stall_gpu(false);
}

#[test]
fn test_submit_failure_propagates() {
    let (backend, mut engine) = engine(small_config(), HeadlessSurface::new(2));
    engine.frame(|_| Ok(())).unwrap();

    backend.fail_next_submit();
    let err = engine.frame(|_| Ok(())).unwrap_err();
    assert!(matches!(err, EngineError::SubmitFailed(_)));
    assert_eq!(backend.submission_count(), 1);
}

#[test]
fn test_recording_errors_abort_the_frame() {
    let (backend, mut engine) = engine(small_config(), HeadlessSurface::new(2));
    let err = engine
        .frame(|_| Err(EngineError::Upload("mesh missing".into())))
        .unwrap_err();
    assert!(matches!(err, EngineError::Upload(_)));
    assert_eq!(backend.submission_count(), 0);
}

#[test]
fn test_stale_surface_is_rebuilt() {
    let (_backend, mut engine) = engine(small_config(), HeadlessSurface::new(2));
    engine.frame(|_| Ok(())).unwrap();

    engine.driver_mut().surface_mut().mark_stale();
    assert_eq!(engine.frame(|_| Ok(())).unwrap(), FrameOutcome::SurfaceStale);

    let before = engine.camera().snapshot_view_projection().projection;
    let old = engine.rebuild_surface(HeadlessSurface::new(3), 1.0).unwrap();
    assert_eq!(old.presented(), &[0]);
    assert_ne!(engine.camera().snapshot_view_projection().projection, before);

    for _ in 0..4 {
        assert!(matches!(
            engine.frame(|_| Ok(())).unwrap(),
            FrameOutcome::Presented { .. }
        ));
    }
    assert_eq!(engine.driver().surface().presented(), &[0, 1, 2, 0]);
}

#[test]
fn test_renderables_keep_independent_transforms() {
    let (backend, mut engine) = engine(small_config(), HeadlessSurface::new(2));
    let left = engine
        .create_renderable(HeadlessDraw::new("left"), RenderableUbo::default())
        .unwrap();
    let right = engine
        .create_renderable(HeadlessDraw::new("right"), RenderableUbo::default())
        .unwrap();

    engine
        .frame(|ctx| {
            left.set_transform(ctx.slot, &RenderableUbo::new(Mat4::from_translation(-Vec3::X), 0.0))?;
            right.set_transform(ctx.slot, &RenderableUbo::new(Mat4::from_translation(Vec3::X), 0.0))?;
            left.draw(ctx.commands, ctx.slot)?;
            right.draw(ctx.commands, ctx.slot)?;
            assert_eq!(ctx.commands.draws(), ["left".to_string(), "right".to_string()]);
            Ok(())
        })
        .unwrap();

    let slot = frameloom::FrameSlot::new(0);
    let (offset, range) = left.ring().region(slot);
    let left_bytes = backend.read_buffer(left.ring().buffer(), offset, range);
    let right_bytes = backend.read_buffer(right.ring().buffer(), offset, range);
    assert_ne!(left_bytes, right_bytes);
}

#[test]
fn test_dropped_renderable_outlives_frames_that_draw_it() {
    let (backend, mut engine) = engine(small_config(), HeadlessSurface::new(3));
    let baseline_buffers = backend.live_buffer_count();
    let baseline_tables = backend.live_table_count();

    let cube = engine
        .create_renderable(HeadlessDraw::new("cube"), RenderableUbo::default())
        .unwrap();
    engine.frame(|ctx| cube.draw(ctx.commands, ctx.slot)).unwrap();
    assert_eq!(backend.pending_count(), 1);

    let buffer = cube.ring().buffer().clone();
    let drawn = backend.read_buffer(&buffer, 0, 16);
    drop(cube);

    // The submission that reads the cube is still pending.
    assert!(backend.hazards().is_empty());
    assert_eq!(engine.driver().deletion_queue().len(), 2);
    assert_eq!(backend.live_buffer_count(), baseline_buffers + 1);
    assert_eq!(backend.read_buffer(&buffer, 0, 16), drawn);

    engine.frame(|_| Ok(())).unwrap();
    assert_eq!(engine.driver().deletion_queue().len(), 2);

    // Back on the cube's slot: its fence is waited on, then it is released.
    engine.frame(|_| Ok(())).unwrap();
    assert!(engine.driver().deletion_queue().is_empty());
    assert_eq!(backend.live_buffer_count(), baseline_buffers);
    assert_eq!(backend.live_table_count(), baseline_tables);
    assert!(backend.hazards().is_empty());
}

#[test]
fn test_renderables_dropped_after_engine_are_released() {
    let (backend, mut engine) = engine(small_config(), HeadlessSurface::new(2));
    let cube = engine
        .create_renderable(HeadlessDraw::new("cube"), RenderableUbo::default())
        .unwrap();
    engine.frame(|ctx| cube.draw(ctx.commands, ctx.slot)).unwrap();

    drop(engine);
    assert_eq!(backend.live_buffer_count(), 1);
    drop(cube);
    assert_eq!(backend.live_buffer_count(), 0);
    assert_eq!(backend.live_table_count(), 0);
    assert!(backend.hazards().is_empty());
}
