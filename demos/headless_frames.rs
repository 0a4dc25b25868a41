use frameloom::gpu::HeadlessDraw;
use frameloom::*;
use std::sync::Arc;
use std::thread;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let backend = Arc::new(HeadlessBackend::new());
    let decoder = Arc::new(
        MemoryDecoder::new()
            .with_image("brick", DecodedImage::solid_color(16, 16, [180, 60, 40, 255]))
            .with_image("grass", DecodedImage::solid_color(16, 16, [40, 160, 60, 255])),
    );
    let config = EngineConfig {
        textures_max: 64,
        placeholder_extent: 4,
        ..Default::default()
    };
    let mut engine = Engine::new(backend.clone(), HeadlessSurface::new(3), decoder, config)?;

    let loader = {
        let textures = Arc::clone(engine.textures());
        thread::spawn(move || textures.register_batch(&["brick", "grass", "marble"]))
    };

    let cube = engine.create_renderable(HeadlessDraw::new("cube"), RenderableUbo::default())?;
    let floor = engine.create_renderable(
        HeadlessDraw::new("floor"),
        RenderableUbo::new(Mat4::from_scale(Vec3::new(10.0, 0.1, 10.0)), 0.0),
    )?;

    engine.input().key_changed(Key::W, true);
    for frame in 0..120u32 {
        engine.input().cursor_moved(frame as f64 * 2.0, 300.0);
        let time = frame as f32 / 60.0;
        let outcome = engine.frame(|ctx| {
            cube.set_transform(ctx.slot, &RenderableUbo::new(Mat4::from_rotation_y(time), time))?;
            cube.draw(ctx.commands, ctx.slot)?;
            floor.draw(ctx.commands, ctx.slot)
        })?;
        if outcome == FrameOutcome::SurfaceStale {
            engine.rebuild_surface(HeadlessSurface::new(3), 16.0 / 9.0)?;
        }
    }

    match loader.join() {
        Ok(slots) => println!("Texture slots: {:?}", slots?),
        Err(_) => println!("Texture loader panicked"),
    }

    engine.driver().wait_idle()?;
    engine.driver().profiler().report();
    println!(
        "Presented {} frames, average {:?}, camera at {:?}, hazards: {}",
        engine.driver().profiler().frames,
        engine.driver().profiler().average_frame_time(),
        engine.camera().pose().position,
        backend.hazards().len()
    );
    Ok(())
}
