use frameloom::texture::TextureRegistry;
use frameloom::{
    CameraState, DeletionQueue, FrameDriver, HeadlessBackend, HeadlessSurface, InputAdapter,
    PerFrameUniformSystem, Renderable,
};
use frameloom::gpu::HeadlessDraw;

#[test]
fn test_shared_state_is_sync_and_send() {
    fn assert_sync_send<T: Sync + Send>() {}
    assert_sync_send::<CameraState>();
    assert_sync_send::<InputAdapter>();
    assert_sync_send::<TextureRegistry<HeadlessBackend>>();
    assert_sync_send::<PerFrameUniformSystem<HeadlessBackend>>();
    assert_sync_send::<Renderable<HeadlessBackend, HeadlessDraw>>();
    assert_sync_send::<DeletionQueue<HeadlessBackend>>();
}

#[test]
fn test_driver_can_move_to_render_thread() {
    fn assert_send<T: Send>() {}
    assert_send::<FrameDriver<HeadlessBackend, HeadlessSurface>>();
}

#[test]
fn test_renderables_dropped_on_another_thread_mid_flight() {
    use frameloom::{Engine, EngineConfig, MemoryDecoder, RenderableUbo};
    use std::sync::{mpsc, Arc};
    use std::thread;

    let backend = Arc::new(HeadlessBackend::new());
    let config = EngineConfig {
        frames_in_flight: 3,
        textures_max: 8,
        placeholder_extent: 1,
        ..Default::default()
    };
    let mut engine = Engine::new(
        backend.clone(),
        HeadlessSurface::new(3),
        Arc::new(MemoryDecoder::new()),
        config,
    )
    .unwrap();

    let (sender, receiver) = mpsc::channel::<Renderable<HeadlessBackend, HeadlessDraw>>();
    let dropper = thread::spawn(move || receiver.into_iter().count());

    for frame in 0..40 {
        let object = engine
            .create_renderable(HeadlessDraw::new(format!("object-{frame}")), RenderableUbo::default())
            .unwrap();
        engine
            .frame(|ctx| object.draw(ctx.commands, ctx.slot))
            .unwrap();
        sender.send(object).unwrap();
    }
    drop(sender);
    assert_eq!(dropper.join().unwrap(), 40);

    engine.driver().wait_idle().unwrap();
    assert!(engine.driver().deletion_queue().is_empty());
    assert!(backend.hazards().is_empty());
}
