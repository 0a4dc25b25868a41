use frameloom::gpu::{Hazard, HeadlessDraw};
use frameloom::uniforms::UniformRing;
use frameloom::{
    AcquireOutcome, BindFrequency, CameraState, EngineConfig, FrameDriver, FrameOutcome, FrameSlot,
    FrameSynchronizer, HeadlessBackend, HeadlessSurface, Mat4, MemoryDecoder,
    PerFrameUniformSystem, PresentationSurface, RenderBackend, Renderable, RenderableUbo,
    TextureRegistry, Vec3,
};
use std::sync::Arc;

/// Deterministic pseudo-random source for interleaving choices.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}

fn random_sequence(rng: &mut Lcg, images: u32, len: usize) -> Vec<u32> {
    (0..len).map(|_| rng.below(images as u64) as u32).collect()
}

#[test]
fn test_no_uniform_overwrite_under_random_interleavings() {
    for seed in 1..=16u64 {
        let mut rng = Lcg(seed);
        let backend = Arc::new(HeadlessBackend::new().with_min_alignment(64));
        let config = EngineConfig {
            frames_in_flight: 2,
            textures_max: 8,
            placeholder_extent: 1,
            ..Default::default()
        };

        let textures = Arc::new(
            TextureRegistry::new(backend.clone(), Arc::new(MemoryDecoder::new()), &config).unwrap(),
        );
        let camera = Arc::new(CameraState::new(&config.camera));
        let per_frame =
            PerFrameUniformSystem::new(backend.clone(), textures, camera.clone(), &config).unwrap();
        let surface = HeadlessSurface::with_sequence(3, random_sequence(&mut rng, 3, 64));
        let mut driver = FrameDriver::new(backend.clone(), surface, per_frame, &config).unwrap();

        let deletion = driver.deletion_queue().clone();
        let spawn = |label: String| {
            Renderable::new(
                backend.clone(),
                deletion.clone(),
                HeadlessDraw::new(label),
                RenderableUbo::default(),
            )
            .unwrap()
        };
        let mut objects: Vec<_> = (0..3).map(|i| spawn(format!("object-{i}"))).collect();

        let mut presented = 0;
        for step in 0..400 {
            match rng.below(6) {
                0 => {
                    backend.retire_one();
                }
                1 => camera.on_mouse_move(rng.below(7) as f32 - 3.0, rng.below(7) as f32 - 3.0),
                2 => {
                    // Replace an object while its last frames may still be in flight.
                    let index = rng.below(3) as usize;
                    objects[index] = spawn(format!("object-{index}-{step}"));
                }
                _ => {
                    let outcome = driver
                        .tick(|ctx| {
                            for (i, object) in objects.iter().enumerate() {
                                let model = Mat4::from_translation(Vec3::new(i as f32, step as f32, 0.0));
                                object.set_transform(ctx.slot, &RenderableUbo::new(model, step as f32))?;
                                object.draw(ctx.commands, ctx.slot)?;
                            }
                            Ok(())
                        })
                        .unwrap();
                    assert!(matches!(outcome, FrameOutcome::Presented { .. }));
                    presented += 1;
                }
            }
        }

        assert!(presented > 100);
        assert_eq!(backend.hazards(), Vec::<Hazard>::new(), "seed {seed}");

        drop(objects);
        drop(driver);
        assert_eq!(backend.hazards(), Vec::<Hazard>::new(), "seed {seed}");
        assert_eq!(backend.live_table_count(), 0, "seed {seed}");
        assert_eq!(backend.live_buffer_count(), 0, "seed {seed}");
    }
}

#[test]
fn test_claimant_fence_is_signalled_before_reuse() {
    let mut rng = Lcg(99);
    let backend = Arc::new(HeadlessBackend::new());
    let mut surface = HeadlessSurface::with_sequence(3, random_sequence(&mut rng, 3, 128));
    let mut sync = FrameSynchronizer::new(backend.clone(), 2, surface.image_count(), None).unwrap();
    let mut commands: Vec<_> = (0..2).map(|_| backend.create_command_buffer().unwrap()).collect();

    let mut stalls = 0;
    for _ in 0..128 {
        if rng.below(3) == 0 {
            backend.retire_one();
        }

        let slot = sync.current_slot();
        sync.wait_for_slot().unwrap();
        assert!(backend.is_fence_signaled(sync.in_flight_fence(slot)).unwrap());

        let image = match surface.acquire_next_image(None, sync.acquire_semaphore()).unwrap() {
            AcquireOutcome::Acquired { image_index, .. } => image_index,
            AcquireOutcome::Stale => unreachable!(),
        };
        let previous = sync.images().claimant(image);
        if sync.claim_image(image).unwrap() {
            stalls += 1;
        }
        if let Some(previous) = previous {
            assert!(backend.is_fence_signaled(sync.in_flight_fence(previous)).unwrap());
        }
        assert_eq!(sync.images().claimant(image), Some(slot));

        let cmd = &mut commands[slot.index()];
        backend.begin_commands(cmd).unwrap();
        backend.end_commands(cmd).unwrap();
        sync.submit(cmd).unwrap();
        surface.present(image, sync.render_finished_semaphore()).unwrap();
        sync.advance();
    }

    // With three images and two slots, some acquisitions must hit an image
    // still held by the other slot.
    assert!(stalls > 0);
    assert!(backend.hazards().is_empty());

    sync.wait_all().unwrap();
    for cmd in commands {
        backend.destroy_command_buffer(cmd);
    }
}

#[test]
fn test_checker_flags_write_before_fence_wait() {
    let backend = Arc::new(HeadlessBackend::new());
    let mut sync = FrameSynchronizer::new(backend.clone(), 2, 3, None).unwrap();
    let ring: UniformRing<HeadlessBackend, [f32; 16]> = UniformRing::new(backend.clone(), 2).unwrap();
    let tables = backend
        .create_binding_tables(BindFrequency::Object, 2)
        .unwrap();
    for (i, table) in tables.iter().enumerate() {
        let (offset, range) = ring.region(FrameSlot::new(i));
        backend
            .write_uniform_binding(table, 0, ring.buffer(), offset, range)
            .unwrap();
    }

    let slot = sync.current_slot();
    let mut cmd = backend.create_command_buffer().unwrap();
    backend.begin_commands(&mut cmd).unwrap();
    backend
        .bind_table(&mut cmd, BindFrequency::Object, &tables[slot.index()])
        .unwrap();
    backend.end_commands(&mut cmd).unwrap();
    sync.submit(&cmd).unwrap();

    // Writing the other slot is fine; writing the in-flight slot is not.
    ring.write(slot.next(2), &[1.0; 16]).unwrap();
    assert!(backend.hazards().is_empty());
    ring.write(slot, &[2.0; 16]).unwrap();
    assert!(matches!(
        backend.hazards().as_slice(),
        [Hazard::UniformOverwrite { .. }]
    ));

    // Re-recording before the fence wait is flagged too.
    backend.begin_commands(&mut cmd).unwrap();
    assert!(backend
        .hazards()
        .iter()
        .any(|h| matches!(h, Hazard::CommandBufferReuse { .. })));

    backend.end_commands(&mut cmd).unwrap();
    sync.wait_for_slot().unwrap();
    backend.destroy_binding_tables(BindFrequency::Object, tables);
}

#[test]
fn test_at_most_k_frames_outstanding() {
    let backend = Arc::new(HeadlessBackend::new());
    let config = EngineConfig {
        frames_in_flight: 2,
        textures_max: 4,
        placeholder_extent: 1,
        ..Default::default()
    };
    let textures = Arc::new(
        TextureRegistry::new(backend.clone(), Arc::new(MemoryDecoder::new()), &config).unwrap(),
    );
    let camera = Arc::new(CameraState::new(&config.camera));
    let per_frame = PerFrameUniformSystem::new(backend.clone(), textures, camera, &config).unwrap();
    let mut driver =
        FrameDriver::new(backend.clone(), HeadlessSurface::new(3), per_frame, &config).unwrap();

    // The GPU never progresses on its own; each tick must retire work so that
    // no more than K submissions are ever pending.
    for _ in 0..20 {
        driver.tick(|_| Ok(())).unwrap();
        assert!(backend.pending_count() <= 2);
    }
    assert_eq!(backend.submission_count(), 20);
}
