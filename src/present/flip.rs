use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use tokio::sync::oneshot;
use tracing::{trace, warn};

use super::{
    page::PageId,
    surface::{Surface, SurfaceId, SurfaceShared},
    PresentError,
};

/// Confirmation that a submitted frame reached the screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Presented {
    pub surface: SurfaceId,
    pub page: PageId,
    pub sequence: u64,
}

/// Handed to the compositor with every asynchronous flip.
///
/// Carries the surface handle and page index instead of a pointer into the
/// surface. Completing it runs the vsync completion handler; dropping it
/// unresolved undoes the flip.
pub struct FlipToken {
    surface: Option<Arc<SurfaceShared>>,
    page: PageId,
    sequence: u64,
    receipt: Option<oneshot::Sender<Presented>>,
}

impl std::fmt::Debug for FlipToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlipToken")
            .field("surface", &self.surface.as_ref().map(|s| s.id))
            .field("page", &self.page)
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl FlipToken {
    pub fn page(&self) -> PageId {
        self.page
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// A completion for a page the caller already holds, without a real
    /// submission behind it.
    #[cfg(test)]
    pub(crate) fn detached(surface: &Surface, page: PageId) -> Self {
        let shared = &surface.shared;
        shared.device.reserve_flip(|| Some(()));
        Self {
            surface: Some(shared.clone()),
            page,
            sequence: shared.device.next_sequence(),
            receipt: None,
        }
    }

    /// Called by the hardware binding once the flip is visible.
    pub fn complete(mut self) {
        let Some(surface) = self.surface.take() else {
            return;
        };
        profiling::scope!("flip_complete");

        // Reclaim the previously visible page before announcing the new one.
        {
            let mut current = surface.lock_current();
            if let Some(previous) = *current {
                if previous != self.page {
                    surface.pool.release(previous);
                }
            }
            *current = Some(self.page);
        }

        // Last step: waiters woken here must already see the freed page.
        surface.device.finish_flip();

        trace!(
            "flip #{} on {:?} visible, page {}",
            self.sequence,
            surface.id,
            self.page
        );
        if let Some(receipt) = self.receipt.take() {
            let _ = receipt.send(Presented {
                surface: surface.id,
                page: self.page,
                sequence: self.sequence,
            });
        }
    }
}

impl Drop for FlipToken {
    fn drop(&mut self) {
        if let Some(surface) = self.surface.take() {
            warn!(
                "flip #{} on {:?} abandoned, returning page {}",
                self.sequence, surface.id, self.page
            );
            surface.pool.release(self.page);
            surface.device.finish_flip();
        }
    }
}

/// Resolves once the submitted frame is on screen, or to `None` if the flip
/// was abandoned.
#[derive(Debug)]
pub struct FlipReceipt {
    sequence: u64,
    rx: oneshot::Receiver<Presented>,
}

impl FlipReceipt {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Blocks the calling thread. Not for use inside an async context.
    pub fn wait(self) -> Option<Presented> {
        self.rx.blocking_recv().ok()
    }

    pub fn try_presented(&mut self) -> Option<Presented> {
        self.rx.try_recv().ok()
    }
}

impl Future for FlipReceipt {
    type Output = Option<Presented>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(Result::ok)
    }
}

/// Writes `pixels` into a free page of `surface` and schedules it for the next
/// vsync.
///
/// Waits for the device's outstanding flip to retire first; only one flip may
/// be in flight per device. The frame is visible once the returned receipt
/// resolves, not when this returns.
pub fn submit_frame(surface: &Surface, pixels: &[u8]) -> Result<FlipReceipt, PresentError> {
    profiling::scope!("submit_frame");
    let shared = &surface.shared;

    let expected = shared.pitch as usize * shared.height as usize;
    if pixels.len() < expected {
        return Err(PresentError::ShortFrame {
            expected,
            actual: pixels.len(),
        });
    }

    // With nothing in flight, a fully used pool can never drain. The page is
    // claimed under the same lock so no other acquirer can take it first.
    let page = shared
        .device
        .reserve_flip(|| shared.pool.try_acquire())
        .ok_or(PresentError::NoFreePage)?;
    let (tx, rx) = oneshot::channel();
    let sequence = shared.device.next_sequence();
    let token = FlipToken {
        surface: Some(shared.clone()),
        page,
        sequence,
        receipt: Some(tx),
    };
    trace!("flip #{} on {:?} uses page {}", sequence, shared.id, page);

    // From here on an error drops `token`, which returns the page and the slot.
    let hw = shared.device.hardware();
    let resource = shared.pool.resource(page);
    hw.write(resource, shared.format, shared.pitch, pixels, shared.bmp_rect)?;

    let update = hw.begin()?;
    hw.change_source(&update, shared.element, resource)?;
    hw.submit_async(update, token)?;

    Ok(FlipReceipt { sequence, rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hw::soft::SoftHardware,
        present::{Device, SurfaceParams},
    };
    use rand::Rng;
    use std::{
        sync::atomic::{AtomicBool, AtomicU32, Ordering},
        thread,
        time::Duration,
    };

    const W: u32 = 16;
    const H: u32 = 8;

    fn params(pages: usize) -> SurfaceParams {
        SurfaceParams {
            width: W,
            height: H,
            visible_pitch: W * 2,
            bpp: 16,
            opacity: 255,
            aspect: 2.0,
            pages,
            layer: 0,
        }
    }

    fn frame(fill: u8) -> Vec<u8> {
        vec![fill; (W * 2 * H) as usize]
    }

    fn setup(hw: SoftHardware, pages: usize) -> (Arc<SoftHardware>, Surface) {
        let hw = Arc::new(hw);
        let device = Device::open(hw.clone(), 0, (0, 0)).unwrap();
        let surface = Surface::setup(&device, params(pages)).unwrap();
        (hw, surface)
    }

    #[test]
    fn five_frames_on_three_pages_with_sync_completion() {
        let (hw, surface) = setup(SoftHardware::manual(640, 480), 3);

        for n in 0..5u8 {
            let mut receipt = submit_frame(&surface, &frame(n)).unwrap();
            assert_eq!(surface.device().pending_flips(), 1);
            assert!(hw.fire_next());

            let presented = receipt.try_presented().expect("flip completed");
            assert_eq!(surface.current_page(), Some(presented.page));
            assert_eq!(presented.sequence, receipt.sequence());
            assert_eq!(surface.device().pending_flips(), 0);
            assert_eq!(
                hw.element_source(surface.element()),
                Some(surface.resources()[presented.page])
            );
            assert_eq!(hw.resource_bytes(surface.resources()[presented.page]), frame(n));
        }
    }

    #[test]
    fn completion_frees_the_previous_page_only() {
        let (hw, surface) = setup(SoftHardware::manual(640, 480), 3);

        submit_frame(&surface, &frame(1)).unwrap();
        hw.fire_next();
        assert_eq!(surface.current_page(), Some(0));
        assert!(surface.is_page_used(0));

        submit_frame(&surface, &frame(2)).unwrap();
        assert!(surface.is_page_used(0) && surface.is_page_used(1));
        hw.fire_next();
        assert_eq!(surface.current_page(), Some(1));
        assert!(!surface.is_page_used(0));
        assert!(surface.is_page_used(1));
    }

    #[test]
    fn second_submit_waits_for_outstanding_flip() {
        let (hw, surface) = setup(SoftHardware::manual(640, 480), 3);
        let surface = Arc::new(surface);
        submit_frame(&surface, &frame(1)).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let producer = {
            let surface = surface.clone();
            let done = done.clone();
            thread::spawn(move || {
                submit_frame(&surface, &frame(2)).unwrap();
                done.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst));
        assert_eq!(surface.device().pending_flips(), 1);

        hw.fire_next();
        producer.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(surface.device().pending_flips(), 1);
        hw.fire_next();
        assert_eq!(surface.current_page(), Some(1));
    }

    #[test]
    fn n_plus_one_acquire_blocks_until_completion() {
        for pages in 1..=4 {
            let (hw, surface) = setup(SoftHardware::manual(640, 480), pages);
            let surface = Arc::new(surface);

            // Put a page on screen so a later completion has something to free.
            submit_frame(&surface, &frame(0)).unwrap();
            hw.fire_next();
            for _ in 1..pages {
                surface.acquire_free_page();
            }

            let acquired = Arc::new(AtomicBool::new(false));
            let waiter = {
                let surface = surface.clone();
                let acquired = acquired.clone();
                thread::spawn(move || {
                    let page = surface.acquire_free_page();
                    acquired.store(true, Ordering::SeqCst);
                    page
                })
            };

            thread::sleep(Duration::from_millis(30));
            assert!(!acquired.load(Ordering::SeqCst), "{pages} page(s)");

            let token = FlipToken::detached(&surface, pages - 1);
            assert_eq!(token.page(), pages - 1);
            if pages == 1 {
                // The only page is the visible one; completing onto it frees
                // nothing, so abandon the flip instead to hand it back.
                drop(token);
            } else {
                // Complete a flip onto a page other than the visible one.
                token.complete();
            }
            assert_eq!(waiter.join().unwrap(), 0);
        }
    }

    #[test]
    fn other_surface_flip_does_not_satisfy_page_waiter() {
        let (hw, a) = setup(SoftHardware::manual(640, 480), 2);
        let a = Arc::new(a);
        let b = Surface::setup(a.device(), params(2)).unwrap();

        submit_frame(&a, &frame(0)).unwrap();
        hw.fire_next();
        assert_eq!(a.acquire_free_page(), 1);

        let acquired = Arc::new(AtomicBool::new(false));
        let waiter = {
            let a = a.clone();
            let acquired = acquired.clone();
            thread::spawn(move || {
                let page = a.acquire_free_page();
                acquired.store(true, Ordering::SeqCst);
                page
            })
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!acquired.load(Ordering::SeqCst));

        // Wakes every waiter on the device, including the one on `a`.
        submit_frame(&b, &frame(1)).unwrap();
        assert!(hw.fire_next());
        assert_eq!(b.current_page(), Some(0));
        thread::sleep(Duration::from_millis(30));
        assert!(!acquired.load(Ordering::SeqCst));
        assert!(!waiter.is_finished());

        FlipToken::detached(&a, 1).complete();
        assert_eq!(waiter.join().unwrap(), 0);
        assert_eq!(a.current_page(), Some(1));
    }

    #[test]
    fn submit_never_hangs_racing_a_direct_acquire() {
        for _ in 0..100 {
            let (hw, surface) = setup(SoftHardware::manual(640, 480), 2);
            let surface = Arc::new(surface);
            submit_frame(&surface, &frame(0)).unwrap();
            hw.fire_next();

            let acquirer = {
                let surface = surface.clone();
                thread::spawn(move || surface.acquire_free_page())
            };
            let (tx, rx) = std::sync::mpsc::channel();
            {
                let surface = surface.clone();
                thread::spawn(move || {
                    let _ = tx.send(submit_frame(&surface, &frame(1)).map(|r| r.sequence()));
                });
            }

            let submitted = rx
                .recv_timeout(Duration::from_secs(2))
                .expect("submit blocked with nothing in flight");
            match submitted {
                Ok(_) => {
                    assert!(hw.fire_next());
                    assert_eq!(acquirer.join().unwrap(), 0);
                }
                Err(err) => {
                    assert!(matches!(err, PresentError::NoFreePage), "{err}");
                    assert_eq!(acquirer.join().unwrap(), 1);
                }
            }
        }
    }

    #[test]
    fn single_page_surface_rejects_second_frame() {
        let (hw, surface) = setup(SoftHardware::manual(640, 480), 1);
        submit_frame(&surface, &frame(0)).unwrap();
        hw.fire_next();
        let err = submit_frame(&surface, &frame(0)).unwrap_err();
        assert!(matches!(err, PresentError::NoFreePage));
        assert_eq!(surface.device().pending_flips(), 0);
    }

    #[test]
    fn short_frame_is_rejected_before_waiting() {
        let (_hw, surface) = setup(SoftHardware::manual(640, 480), 3);
        let err = submit_frame(&surface, &[0u8; 4]).unwrap_err();
        assert!(matches!(
            err,
            PresentError::ShortFrame {
                expected: 256,
                actual: 4
            }
        ));
        assert_eq!(surface.device().pending_flips(), 0);
    }

    #[test]
    fn failed_submission_returns_page_and_slot() {
        let (hw, surface) = setup(SoftHardware::manual(640, 480), 2);
        hw.fail_next_update();
        let err = submit_frame(&surface, &frame(1)).unwrap_err();
        assert!(matches!(err, PresentError::Hardware(_)));
        assert_eq!(surface.device().pending_flips(), 0);
        assert!(!surface.is_page_used(0));

        submit_frame(&surface, &frame(2)).unwrap();
        assert!(hw.fire_next());
        assert_eq!(surface.current_page(), Some(0));
    }

    #[test]
    fn dropped_token_resolves_receipt_to_none() {
        let (hw, surface) = setup(SoftHardware::manual(640, 480), 3);
        let receipt = submit_frame(&surface, &frame(1)).unwrap();
        assert!(hw.drop_next());
        assert_eq!(receipt.wait(), None);
        assert_eq!(surface.device().pending_flips(), 0);
        assert_eq!(surface.current_page(), None);
        assert!(!surface.is_page_used(0));
    }

    #[test]
    fn teardown_drains_outstanding_flip() {
        let (hw, surface) = setup(SoftHardware::manual(640, 480), 3);
        submit_frame(&surface, &frame(1)).unwrap();

        let finished = Arc::new(AtomicBool::new(false));
        let teardown = {
            let finished = finished.clone();
            thread::spawn(move || {
                surface.teardown();
                finished.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!finished.load(Ordering::SeqCst));
        assert_eq!(hw.live_resources(), 3);

        hw.fire_next();
        teardown.join().unwrap();
        assert_eq!(hw.live_resources(), 0);
        assert_eq!(hw.element_count(), 0);
        assert_eq!(hw.queued_flips(), 0);
    }

    #[test]
    fn receipts_resolve_from_vsync_thread() {
        let (_hw, surface) = setup(SoftHardware::with_vsync(640, 480, 240.0), 3);
        let mut last = 0;
        for n in 0..6u8 {
            let presented = submit_frame(&surface, &frame(n))
                .unwrap()
                .wait()
                .expect("presented");
            assert!(presented.sequence > last);
            last = presented.sequence;
            assert_eq!(surface.current_page(), Some(presented.page));
        }
    }

    #[tokio::test]
    async fn receipt_can_be_awaited() {
        let (_hw, surface) = setup(SoftHardware::with_vsync(640, 480, 240.0), 2);
        let receipt = submit_frame(&surface, &frame(7)).unwrap();
        let presented = receipt.await.expect("presented");
        assert_eq!(presented.surface, surface.id());
    }

    #[test]
    fn outstanding_flips_never_exceed_one_under_jitter() {
        let hw = SoftHardware::with_vsync_jitter(640, 480, 500.0, Duration::from_millis(3));
        let (hw, surface) = setup(hw, 3);
        let surface = Arc::new(surface);
        let max_seen = Arc::new(AtomicU32::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let sampler = {
            let surface = surface.clone();
            let max_seen = max_seen.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    max_seen.fetch_max(surface.device().pending_flips(), Ordering::SeqCst);
                    thread::yield_now();
                }
            })
        };

        let producers: Vec<_> = (0..2)
            .map(|_| {
                let surface = surface.clone();
                thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    for n in 0..25u8 {
                        submit_frame(&surface, &frame(n)).unwrap();
                        thread::sleep(Duration::from_micros(rng.gen_range(0..1500)));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        surface.device().wait_idle();
        stop.store(true, Ordering::SeqCst);
        sampler.join().unwrap();

        assert!(max_seen.load(Ordering::SeqCst) <= 1);
        assert!(hw.max_in_flight() <= 1);
        assert_eq!(hw.flips_presented(), 50);
    }

    #[test]
    fn acquired_page_is_never_visible_or_in_flight() {
        let (hw, surface) = setup(SoftHardware::manual(640, 480), 3);
        let surface = Arc::new(surface);
        submit_frame(&surface, &frame(0)).unwrap();
        hw.fire_next();

        let in_flight = Arc::new(std::sync::Mutex::new(Vec::<PageId>::new()));
        let (tx, rx) = std::sync::mpsc::channel::<PageId>();
        let completer = {
            let surface = surface.clone();
            let in_flight = in_flight.clone();
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for page in rx {
                    thread::sleep(Duration::from_micros(rng.gen_range(0..500)));
                    FlipToken::detached(&surface, page).complete();
                    in_flight.lock().unwrap().retain(|&p| p != page);
                }
            })
        };

        for _ in 0..200 {
            let page = surface.acquire_free_page();
            assert_ne!(surface.current_page(), Some(page));
            {
                let mut in_flight = in_flight.lock().unwrap();
                assert!(!in_flight.contains(&page), "page {page} handed out twice");
                in_flight.push(page);
            }
            tx.send(page).unwrap();
        }
        drop(tx);
        completer.join().unwrap();
    }
}
