/*
 *  tests/display_integration.rs
 *
 *  Integration tests for the display session lifecycle and refresh protocol
 *
 *  usbd480fb - USB raster display driver
 *  (c) 2020-26 Stuart Hunter
 */

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use embedded_graphics::pixelcolor::Rgb565;
use embedded_graphics::prelude::*;

use usbd480fb::display::control::{SET_ADDRESS, SET_BRIGHTNESS, SET_FRAME_START_ADDRESS};
use usbd480fb::display::drivers::mock::{MockTransport, RecordingSink, TransportEvent};
use usbd480fb::display::memory::page_size;
use usbd480fb::display::{
    Attribute, AttributeError, AttributeHost, AttributeTable, DeviceId, DisplaySession,
    DriverRegistry, FlipMode, FrameAllocator, FrameMemory, FrameRegistry, MmapAllocator,
    Operation, SchedulerConfig, SessionConfig, SessionEnv, SessionError, UsbTransport,
};

/// Allocator that records what the device link looked like at release time
struct WatchingAllocator {
    mock: MockTransport,
    allocations: AtomicUsize,
    releases: AtomicUsize,
    events_at_release: Mutex<Option<Vec<TransportEvent>>>,
    fail: bool,
}

impl WatchingAllocator {
    fn new(mock: &MockTransport) -> Self {
        Self {
            mock: mock.clone(),
            allocations: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            events_at_release: Mutex::new(None),
            fail: false,
        }
    }

    fn failing(mock: &MockTransport) -> Self {
        Self { fail: true, ..Self::new(mock) }
    }
}

impl FrameAllocator for WatchingAllocator {
    fn allocate(&self, len: usize) -> Result<FrameMemory, SessionError> {
        if self.fail {
            return Err(SessionError::Allocation {
                size: len,
                reason: "no memory".to_string(),
            });
        }
        self.allocations.fetch_add(1, Ordering::SeqCst);
        MmapAllocator.allocate(len)
    }

    fn release(&self, frame: FrameMemory) {
        self.releases.fetch_add(1, Ordering::SeqCst);
        *self.events_at_release.lock().unwrap() = Some(self.mock.events());
        drop(frame);
    }
}

/// Attribute host that counts removals
#[derive(Default)]
struct CountingAttributes {
    table: AttributeTable,
    removed: AtomicUsize,
}

impl AttributeHost for CountingAttributes {
    fn expose(
        &self,
        device: &str,
        name: &'static str,
        attribute: Arc<dyn Attribute>,
    ) -> Result<(), AttributeError> {
        self.table.expose(device, name, attribute)
    }

    fn remove(&self, device: &str, name: &'static str) {
        self.removed.fetch_add(1, Ordering::SeqCst);
        self.table.remove(device, name)
    }
}

fn fast(flip_mode: FlipMode) -> SessionConfig {
    SessionConfig {
        scheduler: SchedulerConfig {
            interval: Duration::from_millis(1),
            initial_delay: Duration::from_millis(4),
            flip_mode,
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn wait_for_cycles(session: &DisplaySession, n: u64) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while session.stats().cycles < n {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("refresh made no progress");
}

fn address(value: u16, index: u16) -> u32 {
    (index as u32) << 16 | value as u32
}

#[tokio::test]
async fn test_full_lifecycle_releases_everything_once() {
    let mock = MockTransport::with_geometry("USBD480-LQ043", 480, 272);
    let frames = Arc::new(FrameRegistry::new());
    let attributes = Arc::new(CountingAttributes::default());
    let allocator = Arc::new(WatchingAllocator::new(&mock));
    let env = SessionEnv::new(frames.clone(), attributes.clone()).with_allocator(allocator.clone());

    let transport = Arc::new(mock.clone());
    let session = DisplaySession::attach(
        "usb-1",
        Arc::clone(&transport) as Arc<dyn UsbTransport>,
        &env,
        &fast(FlipMode::SameCycle),
    )
    .unwrap();
    wait_for_cycles(&session, 10).await;
    let report = session.detach().await;
    drop(env);

    assert!(report.stats.cycles >= 10);
    assert_eq!(allocator.allocations.load(Ordering::SeqCst), 1);
    assert_eq!(allocator.releases.load(Ordering::SeqCst), 1);
    assert_eq!(attributes.removed.load(Ordering::SeqCst), 4);
    assert!(attributes.table.is_empty());
    assert!(frames.is_empty());
    // device handle released with the session
    assert_eq!(Arc::strong_count(&transport), 1);
}

#[tokio::test]
async fn test_memory_released_only_after_refresh_stopped() {
    let mock = MockTransport::with_geometry("USBD480", 480, 272);
    mock.state().lock().unwrap().bulk_delay = Some(Duration::from_millis(30));
    let allocator = Arc::new(WatchingAllocator::new(&mock));
    let env = SessionEnv::new(Arc::new(FrameRegistry::new()), Arc::new(AttributeTable::new()))
        .with_allocator(allocator.clone());

    let session =
        DisplaySession::attach("usb-1", Arc::new(mock.clone()), &env, &fast(FlipMode::SameCycle))
            .unwrap();

    // detach while an upload is in flight
    tokio::time::timeout(Duration::from_secs(10), async {
        while mock.bulk_count() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
    session.detach().await;

    let at_release = allocator.events_at_release.lock().unwrap().clone().unwrap();
    assert!(matches!(
        at_release.last(),
        Some(TransportEvent::ControlOut { request: SET_FRAME_START_ADDRESS, .. })
    ));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(mock.events(), at_release, "transfers issued after release");
}

#[tokio::test]
async fn test_pages_alternate_across_a_running_session() {
    let mock = MockTransport::with_geometry("USBD480", 480, 272);
    let env = SessionEnv::new(Arc::new(FrameRegistry::new()), Arc::new(AttributeTable::new()));
    let session =
        DisplaySession::attach("usb-1", Arc::new(mock.clone()), &env, &fast(FlipMode::SameCycle))
            .unwrap();
    wait_for_cycles(&session, 9).await;
    session.detach().await;

    let page_len = 480 * 272 * 2;
    let writes: Vec<u32> = mock
        .events()
        .iter()
        .filter_map(|e| match e {
            TransportEvent::ControlOut { request: SET_ADDRESS, value, index } => Some(address(*value, *index)),
            _ => None,
        })
        .collect();
    assert!(writes.len() >= 9);
    for (i, offset) in writes.iter().enumerate() {
        assert_eq!(*offset, if i % 2 == 0 { 0 } else { page_len });
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_brightness_writes_never_overlap_refresh() {
    let mock = MockTransport::with_geometry("USBD480", 480, 272);
    mock.state().lock().unwrap().bulk_delay = Some(Duration::from_millis(2));
    let attributes = Arc::new(AttributeTable::new());
    let env = SessionEnv::new(Arc::new(FrameRegistry::new()), attributes.clone());
    let session =
        DisplaySession::attach("usb-1", Arc::new(mock.clone()), &env, &fast(FlipMode::WriteThenFlip))
            .unwrap();

    let writers: Vec<_> = (0..4)
        .map(|t| {
            let attributes = Arc::clone(&attributes);
            std::thread::spawn(move || {
                for level in 0..50u32 {
                    attributes
                        .write("usb-1", "brightness", &format!("{}\n", level * 7 + t))
                        .unwrap();
                    std::thread::sleep(Duration::from_micros(300));
                }
            })
        })
        .collect();
    for w in writers {
        w.join().unwrap();
    }
    wait_for_cycles(&session, 5).await;
    session.detach().await;

    let state = mock.state();
    let state = state.lock().unwrap();
    assert!(!state.overlap_detected);
    let brightness_writes = state
        .events
        .iter()
        .filter(|e| matches!(e, TransportEvent::ControlOut { request: SET_BRIGHTNESS, .. }))
        .count();
    assert_eq!(brightness_writes, 200);
}

#[tokio::test]
async fn test_brightness_300_is_clamped() {
    let mock = MockTransport::with_geometry("USBD480", 480, 272);
    let attributes = Arc::new(AttributeTable::new());
    let env = SessionEnv::new(Arc::new(FrameRegistry::new()), attributes.clone());
    let session = DisplaySession::attach("usb-1", Arc::new(mock.clone()), &env, &SessionConfig::default())
        .unwrap();

    attributes.write("usb-1", "brightness", "300").unwrap();
    assert_eq!(attributes.read("usb-1", "brightness").unwrap(), "255\n");
    assert_eq!(mock.state().lock().unwrap().last_brightness, Some(255));
    session.detach().await;
}

#[tokio::test]
async fn test_480x272_frame_is_page_aligned_and_large_enough() {
    let mock = MockTransport::with_geometry("USBD480", 480, 272);
    let frames = Arc::new(FrameRegistry::new());
    let env = SessionEnv::new(frames.clone(), Arc::new(AttributeTable::new()));
    let session = DisplaySession::attach("usb-1", Arc::new(mock), &env, &SessionConfig::default())
        .unwrap();

    let (info, frame) = frames.get(session.buffer_id()).unwrap();
    let frame = frame.upgrade().unwrap();
    assert_eq!(info.size, 261120);
    assert!(frame.len() >= 261120);
    assert_eq!(frame.allocated_len() % page_size(), 0);
    assert!(frame.is_page_aligned());
    drop(frame);
    session.detach().await;
}

#[tokio::test]
async fn test_allocation_failure_leaves_no_entries() {
    let mock = MockTransport::with_geometry("USBD480", 480, 272);
    let frames = Arc::new(FrameRegistry::new());
    let attributes = Arc::new(AttributeTable::new());
    let env = SessionEnv::new(frames.clone(), attributes.clone())
        .with_allocator(Arc::new(WatchingAllocator::failing(&mock)));

    let result = DisplaySession::attach("usb-1", Arc::new(mock.clone()), &env, &SessionConfig::default());
    assert!(matches!(result, Err(SessionError::Allocation { .. })));
    assert!(attributes.is_empty());
    assert!(frames.is_empty());
    assert_eq!(mock.bulk_count(), 0);
}

#[tokio::test]
async fn test_write_then_flip_holds_last_page_while_uploads_fail() {
    let mock = MockTransport::with_geometry("USBD480", 480, 272);
    let sink = RecordingSink::default();
    let env = SessionEnv::new(Arc::new(FrameRegistry::new()), Arc::new(AttributeTable::new()))
        .with_diagnostics(Arc::new(sink.clone()));
    let session =
        DisplaySession::attach("usb-1", Arc::new(mock.clone()), &env, &fast(FlipMode::WriteThenFlip))
            .unwrap();

    wait_for_cycles(&session, 2).await;
    mock.state().lock().unwrap().simulate_bulk_failure = true;
    let cycles = session.stats().cycles;
    wait_for_cycles(&session, cycles + 4).await;
    mock.state().lock().unwrap().simulate_bulk_failure = false;
    let report = session.detach().await;

    // the cycle in flight when failures started may still have flipped
    assert!(report.stats.flips_skipped >= 3);
    let shows = mock
        .events()
        .iter()
        .filter(|e| matches!(e, TransportEvent::ControlOut { request: SET_FRAME_START_ADDRESS, .. }))
        .count() as u64;
    assert_eq!(shows + report.stats.flips_skipped, report.stats.cycles);
    assert!(sink.faults().iter().all(|f| f.operation == Operation::BulkUpload));
    assert_eq!(report.stats.upload_failures, report.stats.flips_skipped);
}

#[tokio::test]
async fn test_canvas_drawing_reaches_the_device() {
    let mock = MockTransport::with_geometry("USBD480", 480, 272);
    let frames = Arc::new(FrameRegistry::new());
    let env = SessionEnv::new(frames.clone(), Arc::new(AttributeTable::new()));
    let session =
        DisplaySession::attach("usb-1", Arc::new(mock.clone()), &env, &fast(FlipMode::WriteThenFlip))
            .unwrap();

    let mut canvas = frames.canvas(session.buffer_id()).unwrap();
    Pixel(Point::new(479, 271), Rgb565::RED).draw(&mut canvas).unwrap();
    let cycles = session.stats().cycles;
    wait_for_cycles(&session, cycles + 2).await;
    drop(canvas);
    session.detach().await;

    let state = mock.state();
    let state = state.lock().unwrap();
    let last = state.last_upload.len();
    assert_eq!(last, 261120);
    assert_eq!(&state.last_upload[last - 2..], &[0x00, 0xF8]);
}

#[tokio::test]
async fn test_canvas_kept_past_detach_does_not_delay_release() {
    let mock = MockTransport::with_geometry("USBD480", 480, 272);
    let frames = Arc::new(FrameRegistry::new());
    let allocator = Arc::new(WatchingAllocator::new(&mock));
    let env = SessionEnv::new(frames.clone(), Arc::new(AttributeTable::new()))
        .with_allocator(allocator.clone());
    let session =
        DisplaySession::attach("usb-1", Arc::new(mock.clone()), &env, &fast(FlipMode::WriteThenFlip))
            .unwrap();

    let id = session.buffer_id();
    let mut canvas = frames.canvas(id).unwrap();
    let (_, weak) = frames.get(id).unwrap();
    Pixel(Point::new(0, 0), Rgb565::GREEN).draw(&mut canvas).unwrap();
    wait_for_cycles(&session, 2).await;

    session.detach().await;
    assert_eq!(allocator.allocations.load(Ordering::SeqCst), 1);
    assert_eq!(allocator.releases.load(Ordering::SeqCst), 1);
    assert!(weak.upgrade().is_none());
    assert!(Pixel(Point::new(1, 1), Rgb565::RED).draw(&mut canvas).is_err());

    drop(canvas);
    drop(weak);
    assert_eq!(allocator.releases.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_short_uploads_reach_the_sink() {
    let mock = MockTransport::with_geometry("USBD480", 480, 272);
    mock.state().lock().unwrap().simulate_short_upload = true;
    let sink = RecordingSink::default();
    let env = SessionEnv::new(Arc::new(FrameRegistry::new()), Arc::new(AttributeTable::new()))
        .with_diagnostics(Arc::new(sink.clone()));
    let session =
        DisplaySession::attach("usb-1", Arc::new(mock.clone()), &env, &fast(FlipMode::WriteThenFlip))
            .unwrap();

    wait_for_cycles(&session, 5).await;
    let report = session.detach().await;

    assert!(report.stats.cycles >= 5);
    assert_eq!(report.stats.upload_failures, report.stats.cycles);
    assert_eq!(report.stats.flips_skipped, report.stats.upload_failures);
    assert_eq!(sink.faults().len() as u64, report.stats.upload_failures);
    assert!(sink.faults().iter().all(|f| f.operation == Operation::BulkUpload));
    assert!(!mock
        .events()
        .iter()
        .any(|e| matches!(e, TransportEvent::ControlOut { request: SET_FRAME_START_ADDRESS, .. })));
}

#[tokio::test]
async fn test_registry_attaches_several_devices() {
    let registry = DriverRegistry::with_usbd480(DeviceId::USBD480, fast(FlipMode::WriteThenFlip));
    let frames = Arc::new(FrameRegistry::new());
    let attributes = Arc::new(AttributeTable::new());
    let env = SessionEnv::new(frames.clone(), attributes.clone());

    let small = MockTransport::with_geometry("USBD480-LQ035", 320, 240);
    let large = MockTransport::with_geometry("USBD480-LQ043", 480, 272);
    let a = registry.attach(DeviceId::USBD480, "usb-1", Arc::new(small.clone()), &env).unwrap();
    let b = registry.attach(DeviceId::USBD480, "usb-2", Arc::new(large.clone()), &env).unwrap();

    assert_eq!(frames.len(), 2);
    assert_eq!(attributes.read("usb-1", "width").unwrap(), "320\n");
    assert_eq!(attributes.read("usb-2", "name").unwrap(), "USBD480-LQ043\n");

    wait_for_cycles(&a, 2).await;
    wait_for_cycles(&b, 2).await;
    b.detach().await;
    a.detach().await;

    assert!(frames.is_empty());
    assert!(attributes.is_empty());
    let small_state = small.state();
    assert!(small_state.lock().unwrap().last_upload.len() == 320 * 240 * 2);
}
