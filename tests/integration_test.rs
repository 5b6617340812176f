use image::{Rgba, RgbaImage};
use tempfile::TempDir;

use sam2_seg::mocks::{mock_artifacts, MockBackend, MockFetcher, RunLog};
use sam2_seg::{
    ArtifactStore, BackendKind, ControlState, DirectoryCache, ExecutionBackend, FailureKind,
    InteractiveSession, ModelGeometry, PointerButton, Sam2Model, SessionEvent,
};
use sam2_seg::imageops::Size;

const GEOMETRY: ModelGeometry = ModelGeometry {
    image_side: 64,
    mask_side: 16,
};

struct Harness {
    session: InteractiveSession,
    fetcher: MockFetcher,
    cpu_log: RunLog,
}

fn harness(cache: &TempDir, backends: Vec<MockBackend>) -> Harness {
    let fetcher = MockFetcher::serving_models();
    let cpu_log = backends
        .iter()
        .find(|b| b.kind() == BackendKind::Cpu)
        .map(MockBackend::run_log)
        .unwrap_or_default();
    let backends: Vec<Box<dyn ExecutionBackend>> = backends
        .into_iter()
        .map(|b| Box::new(b) as Box<dyn ExecutionBackend>)
        .collect();

    let store = ArtifactStore::new(DirectoryCache::new(cache.path()), fetcher.clone());
    let model = Sam2Model::new(store, mock_artifacts(), backends).with_geometry(GEOMETRY);
    Harness {
        session: InteractiveSession::spawn(model, 4).unwrap(),
        fetcher,
        cpu_log,
    }
}

async fn settle(session: &mut InteractiveSession) -> SessionEvent {
    loop {
        match session.next_event().await.expect("worker alive") {
            SessionEvent::Loading(_) => continue,
            event => return event,
        }
    }
}

fn portrait() -> RgbaImage {
    RgbaImage::from_fn(30, 60, |x, _| Rgba([x as u8 * 8, 90, 200, 255]))
}

#[tokio::test]
async fn test_end_to_end_with_backend_fallback() {
    let cache = TempDir::new().unwrap();
    let cuda = MockBackend::unavailable(BackendKind::Cuda);
    let mut h = harness(
        &cache,
        vec![
            cuda.clone(),
            MockBackend::available(BackendKind::Cpu).with_scores(&[0.1, 0.2, 0.8]),
        ],
    );

    h.session.initialize().unwrap();
    assert_eq!(h.session.state(), ControlState::LoadingModels);
    assert_eq!(
        settle(&mut h.session).await,
        SessionEvent::ModelsReady(BackendKind::Cpu)
    );
    assert_eq!(h.session.backend(), Some(BackendKind::Cpu));
    // One failed attempt per session.
    assert_eq!(cuda.attempts(), 2);

    h.session.set_image(portrait()).unwrap();
    h.session.encode_image().unwrap();
    assert_eq!(settle(&mut h.session).await, SessionEvent::ImageEncoded);

    h.session
        .click(32.0, 32.0, Size::square(64), PointerButton::Primary)
        .unwrap();
    assert!(matches!(
        settle(&mut h.session).await,
        SessionEvent::MaskUpdated { best_index: 2, .. }
    ));
    h.session
        .click(10.0, 50.0, Size::square(64), PointerButton::Secondary)
        .unwrap();
    settle(&mut h.session).await;

    let decodes = h.cpu_log.decodes();
    assert_eq!(decodes.len(), 2);
    assert_eq!(decodes[0].has_mask_input, Some(0.0));
    assert_eq!(decodes[0].mask_input_sum, Some(0.0));
    assert_eq!(decodes[1].has_mask_input, Some(1.0));
    // The winning channel of the first decode is all ones.
    let side = GEOMETRY.mask_side as f32;
    assert_eq!(decodes[1].mask_input_sum, Some(side * side));
    assert_eq!(decodes[1].labels, vec![1.0, 0.0]);

    assert_eq!(h.session.crop().unwrap().dimensions(), (30, 60));
    assert_eq!(h.session.mask_for_source().unwrap().dimensions(), (30, 60));
    h.session.shutdown().unwrap();
}

#[tokio::test]
async fn test_second_session_uses_cache() {
    let cache = TempDir::new().unwrap();

    let mut first = harness(&cache, vec![MockBackend::available(BackendKind::Cpu)]);
    first.session.initialize().unwrap();
    settle(&mut first.session).await;
    assert_eq!(first.fetcher.calls().len(), 2);
    first.session.shutdown().unwrap();

    let mut second = harness(&cache, vec![MockBackend::available(BackendKind::Cpu)]);
    second.session.initialize().unwrap();
    assert!(matches!(
        settle(&mut second.session).await,
        SessionEvent::ModelsReady(_)
    ));
    assert!(second.fetcher.calls().is_empty());
}

#[tokio::test]
async fn test_no_backend_is_fatal_and_retryable() {
    let cache = TempDir::new().unwrap();
    let mut h = harness(&cache, vec![MockBackend::unavailable(BackendKind::Cuda)]);

    h.session.initialize().unwrap();
    match settle(&mut h.session).await {
        SessionEvent::Failed { kind, message } => {
            assert_eq!(kind, FailureKind::Fatal);
            assert!(message.contains("cuda"));
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(h.session.state(), ControlState::Idle);
    assert!(h.session.status().starts_with("Error:"));

    // Nothing is stuck: initialize can be issued again.
    h.session.initialize().unwrap();
    assert!(matches!(
        settle(&mut h.session).await,
        SessionEvent::Failed { .. }
    ));
}

#[tokio::test]
async fn test_switching_image_clears_prompts() {
    let cache = TempDir::new().unwrap();
    let mut h = harness(&cache, vec![MockBackend::available(BackendKind::Cpu)]);
    h.session.initialize().unwrap();
    settle(&mut h.session).await;
    h.session.set_image(portrait()).unwrap();
    h.session.encode_image().unwrap();
    settle(&mut h.session).await;
    h.session
        .click(5.0, 5.0, Size::square(64), PointerButton::Primary)
        .unwrap();
    settle(&mut h.session).await;
    assert!(h.session.mask().is_some());

    h.session
        .set_image(RgbaImage::from_pixel(40, 40, Rgba([9, 9, 9, 255])))
        .unwrap();
    assert!(h.session.points().is_empty());
    assert!(h.session.mask().is_none());
    assert_eq!(h.session.state(), ControlState::Ready);

    // The new image has not been encoded yet.
    let err = h
        .session
        .click(5.0, 5.0, Size::square(64), PointerButton::Primary)
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::Precondition);
}

#[tokio::test]
async fn test_poll_drains_without_blocking() {
    let cache = TempDir::new().unwrap();
    let mut h = harness(&cache, vec![MockBackend::available(BackendKind::Cpu)]);
    assert!(h.session.poll().is_empty());

    h.session.initialize().unwrap();
    let mut events = Vec::new();
    while !events
        .iter()
        .any(|e| matches!(e, SessionEvent::ModelsReady(_)))
    {
        events.extend(h.session.poll());
        tokio::task::yield_now().await;
    }
    assert!(matches!(events[0], SessionEvent::Loading(_)));
}
