//! In-memory hardware used by the demo binary and the tests.
//!
//! Resources are plain byte vectors and elements a map of descriptors.
//! Asynchronous flips are either queued until [`SoftHardware::fire_next`] is
//! called, or presented by a vsync thread ticking at a fixed refresh rate.

use std::{
    collections::{HashMap, VecDeque},
    sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError},
    thread,
    time::{Duration, Instant},
};

use rand::Rng;
use tracing::{debug, trace, warn};

use super::{
    Compositor, DisplayHandle, DisplayProvider, ElementDesc, ElementHandle, HwError, PixelFormat,
    Rect, ResourceAllocator, ResourceHandle, Update,
};
use crate::present::FlipToken;

#[derive(Debug)]
struct SoftResource {
    format: PixelFormat,
    width: u32,
    height: u32,
    data: Vec<u8>,
    palette: Option<Vec<u16>>,
}

#[derive(Debug)]
enum Op {
    Add(ElementHandle, ElementDesc),
    ChangeSource(ElementHandle, ResourceHandle),
    Remove(ElementHandle),
}

struct PendingFlip {
    ops: Vec<Op>,
    token: FlipToken,
}

#[derive(Default)]
struct State {
    next_handle: u32,
    open_displays: usize,
    resources: HashMap<ResourceHandle, SoftResource>,
    elements: HashMap<ElementHandle, ElementDesc>,
    updates: HashMap<u32, Vec<Op>>,
    created: usize,
    create_budget: Option<usize>,
    fail_next_update: bool,
    fail_next_open: bool,
    queued: VecDeque<PendingFlip>,
    in_flight: u32,
    max_in_flight: u32,
    presented: u64,
}

impl State {
    fn handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    fn apply(&mut self, ops: Vec<Op>) {
        for op in ops {
            match op {
                Op::Add(element, desc) => {
                    self.elements.insert(element, desc);
                }
                Op::ChangeSource(element, resource) => {
                    if let Some(desc) = self.elements.get_mut(&element) {
                        desc.resource = resource;
                    }
                }
                Op::Remove(element) => {
                    self.elements.remove(&element);
                }
            }
        }
    }

    fn ops(&mut self, update: &Update) -> Result<&mut Vec<Op>, HwError> {
        self.updates
            .get_mut(&update.0)
            .ok_or_else(|| HwError::UpdateFailed(format!("unknown update {}", update.0)))
    }
}

struct Inner {
    size: (u32, u32),
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn present(&self, flip: PendingFlip) {
        {
            let mut state = self.lock();
            state.apply(flip.ops);
            state.in_flight -= 1;
            state.presented += 1;
        }
        // The token may hold the last reference to the device, whose drop
        // calls back into `close`; the state lock must be released here.
        flip.token.complete();
    }
}

pub struct SoftHardware {
    inner: Arc<Inner>,
    vsync: Option<mpsc::Sender<PendingFlip>>,
}

impl SoftHardware {
    /// Flips stay queued until fired by hand.
    pub fn manual(width: u32, height: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                size: (width, height),
                state: Mutex::new(State::default()),
            }),
            vsync: None,
        }
    }

    /// Flips are presented by a background thread on each vsync tick.
    pub fn with_vsync(width: u32, height: u32, refresh_hz: f64) -> Self {
        Self::with_vsync_jitter(width, height, refresh_hz, Duration::ZERO)
    }

    /// Like [`Self::with_vsync`], adding a random delay of up to `jitter` to
    /// every presentation.
    pub fn with_vsync_jitter(width: u32, height: u32, refresh_hz: f64, jitter: Duration) -> Self {
        let mut hw = Self::manual(width, height);
        let period = Duration::from_secs_f64(1.0 / refresh_hz.max(1.0));
        let (tx, rx) = mpsc::channel();
        let inner = hw.inner.clone();
        let spawned = thread::Builder::new()
            .name("soft-vsync".into())
            .spawn(move || vsync_loop(inner, rx, period, jitter));
        match spawned {
            Ok(_) => hw.vsync = Some(tx),
            Err(err) => warn!("Failed to start soft vsync thread, flips stay queued: {err}"),
        }
        hw
    }

    /// Completes the oldest queued flip. Returns false if none was queued.
    pub fn fire_next(&self) -> bool {
        let flip = self.inner.lock().queued.pop_front();
        match flip {
            Some(flip) => {
                self.inner.present(flip);
                true
            }
            None => false,
        }
    }

    /// Discards the oldest queued flip without presenting it.
    pub fn drop_next(&self) -> bool {
        let flip = {
            let mut state = self.inner.lock();
            let flip = state.queued.pop_front();
            if flip.is_some() {
                state.in_flight -= 1;
            }
            flip
        };
        flip.is_some()
    }

    pub fn queued_flips(&self) -> usize {
        self.inner.lock().queued.len()
    }

    /// Makes every `create` after the next `count` fail.
    pub fn fail_create_after(&self, count: usize) {
        let mut state = self.inner.lock();
        state.create_budget = Some(state.created + count);
    }

    pub fn fail_next_update(&self) {
        self.inner.lock().fail_next_update = true;
    }

    pub fn fail_next_open(&self) {
        self.inner.lock().fail_next_open = true;
    }

    pub fn open_displays(&self) -> usize {
        self.inner.lock().open_displays
    }

    pub fn resources_created(&self) -> usize {
        self.inner.lock().created
    }

    pub fn live_resources(&self) -> usize {
        self.inner.lock().resources.len()
    }

    pub fn resource_size(&self, resource: ResourceHandle) -> Option<(u32, u32)> {
        self.inner
            .lock()
            .resources
            .get(&resource)
            .map(|res| (res.width, res.height))
    }

    pub fn resource_bytes(&self, resource: ResourceHandle) -> Vec<u8> {
        self.inner
            .lock()
            .resources
            .get(&resource)
            .map(|res| res.data.clone())
            .unwrap_or_default()
    }

    pub fn palette(&self, resource: ResourceHandle) -> Option<Vec<u16>> {
        self.inner
            .lock()
            .resources
            .get(&resource)
            .and_then(|res| res.palette.clone())
    }

    pub fn element_count(&self) -> usize {
        self.inner.lock().elements.len()
    }

    pub fn element_source(&self, element: ElementHandle) -> Option<ResourceHandle> {
        self.inner.lock().elements.get(&element).map(|e| e.resource)
    }

    pub fn element_layer(&self, element: ElementHandle) -> Option<i32> {
        self.inner.lock().elements.get(&element).map(|e| e.layer)
    }

    pub fn element_dst(&self, element: ElementHandle) -> Option<Rect> {
        self.inner.lock().elements.get(&element).map(|e| e.dst)
    }

    /// Highest number of flips the compositor ever held at once.
    pub fn max_in_flight(&self) -> u32 {
        self.inner.lock().max_in_flight
    }

    pub fn flips_presented(&self) -> u64 {
        self.inner.lock().presented
    }
}

fn vsync_loop(
    inner: Arc<Inner>,
    rx: mpsc::Receiver<PendingFlip>,
    period: Duration,
    jitter: Duration,
) {
    debug!("soft vsync running every {:?}", period);
    let mut rng = rand::thread_rng();
    let mut next = Instant::now() + period;
    while let Ok(flip) = rx.recv() {
        let now = Instant::now();
        while next <= now {
            next += period;
        }
        let mut wait = next - now;
        if !jitter.is_zero() {
            wait += rng.gen_range(Duration::ZERO..=jitter);
        }
        thread::sleep(wait);
        trace!(
            "soft vsync presenting flip #{} (page {})",
            flip.token.sequence(),
            flip.token.page()
        );
        inner.present(flip);
    }
    debug!("soft vsync stopped");
}

impl DisplayProvider for SoftHardware {
    fn open(&self, id: u32) -> Result<DisplayHandle, HwError> {
        let mut state = self.inner.lock();
        if std::mem::take(&mut state.fail_next_open) {
            return Err(HwError::DisplayOpen(id));
        }
        state.open_displays += 1;
        Ok(DisplayHandle(id))
    }

    fn close(&self, _display: DisplayHandle) {
        let mut state = self.inner.lock();
        state.open_displays = state.open_displays.saturating_sub(1);
    }

    fn size(&self, _display: DisplayHandle) -> Result<(u32, u32), HwError> {
        Ok(self.inner.size)
    }
}

impl ResourceAllocator for SoftHardware {
    fn create(
        &self,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<ResourceHandle, HwError> {
        let mut state = self.inner.lock();
        if state.create_budget.is_some_and(|budget| state.created >= budget) {
            return Err(HwError::ResourceExhausted);
        }
        state.created += 1;
        let handle = ResourceHandle(state.handle());
        let len = (width * height * format.bytes_per_pixel()) as usize;
        state.resources.insert(
            handle,
            SoftResource {
                format,
                width,
                height,
                data: vec![0; len],
                palette: None,
            },
        );
        Ok(handle)
    }

    fn delete(&self, resource: ResourceHandle) {
        self.inner.lock().resources.remove(&resource);
    }

    fn write(
        &self,
        resource: ResourceHandle,
        format: PixelFormat,
        pitch: u32,
        data: &[u8],
        rect: Rect,
    ) -> Result<(), HwError> {
        let mut state = self.inner.lock();
        let res = state
            .resources
            .get_mut(&resource)
            .ok_or(HwError::InvalidResource(resource))?;

        let bpp = format.bytes_per_pixel() as usize;
        let row_len = rect.width as usize * bpp;
        let stride = res.width as usize * res.format.bytes_per_pixel() as usize;
        let fits = rect.x >= 0
            && rect.y >= 0
            && rect.x as u32 + rect.width <= res.width
            && rect.y as u32 + rect.height <= res.height
            && (rect.height == 0
                || data.len() >= (rect.height as usize - 1) * pitch as usize + row_len);
        if !fits {
            return Err(HwError::WriteOutOfBounds {
                resource,
                len: data.len(),
            });
        }

        for row in 0..rect.height as usize {
            let src = row * pitch as usize;
            let dst = (rect.y as usize + row) * stride + rect.x as usize * bpp;
            res.data[dst..dst + row_len].copy_from_slice(&data[src..src + row_len]);
        }
        Ok(())
    }

    fn set_palette(&self, resource: ResourceHandle, palette: &[u16]) -> Result<(), HwError> {
        let mut state = self.inner.lock();
        let res = state
            .resources
            .get_mut(&resource)
            .ok_or(HwError::InvalidResource(resource))?;
        res.palette = Some(palette.to_vec());
        Ok(())
    }
}

impl Compositor for SoftHardware {
    fn begin(&self) -> Result<Update, HwError> {
        let mut state = self.inner.lock();
        if std::mem::take(&mut state.fail_next_update) {
            return Err(HwError::UpdateFailed("injected failure".into()));
        }
        let id = state.handle();
        state.updates.insert(id, Vec::new());
        Ok(Update(id))
    }

    fn add_element(&self, update: &Update, desc: ElementDesc) -> Result<ElementHandle, HwError> {
        let mut state = self.inner.lock();
        if !state.resources.contains_key(&desc.resource) {
            return Err(HwError::InvalidResource(desc.resource));
        }
        let element = ElementHandle(state.handle());
        state.ops(update)?.push(Op::Add(element, desc));
        Ok(element)
    }

    fn change_source(
        &self,
        update: &Update,
        element: ElementHandle,
        resource: ResourceHandle,
    ) -> Result<(), HwError> {
        let mut state = self.inner.lock();
        if !state.elements.contains_key(&element) {
            return Err(HwError::InvalidElement(element));
        }
        if !state.resources.contains_key(&resource) {
            return Err(HwError::InvalidResource(resource));
        }
        state.ops(update)?.push(Op::ChangeSource(element, resource));
        Ok(())
    }

    fn remove_element(&self, update: &Update, element: ElementHandle) -> Result<(), HwError> {
        let mut state = self.inner.lock();
        if !state.elements.contains_key(&element) {
            return Err(HwError::InvalidElement(element));
        }
        state.ops(update)?.push(Op::Remove(element));
        Ok(())
    }

    fn submit_sync(&self, update: Update) -> Result<(), HwError> {
        let mut state = self.inner.lock();
        let ops = state
            .updates
            .remove(&update.0)
            .ok_or_else(|| HwError::UpdateFailed(format!("unknown update {}", update.0)))?;
        state.apply(ops);
        Ok(())
    }

    fn submit_async(&self, update: Update, token: FlipToken) -> Result<(), HwError> {
        let flip = {
            let mut state = self.inner.lock();
            let Some(ops) = state.updates.remove(&update.0) else {
                drop(state);
                return Err(HwError::UpdateFailed(format!("unknown update {}", update.0)));
            };
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            let flip = PendingFlip { ops, token };
            match &self.vsync {
                Some(_) => flip,
                None => {
                    state.queued.push_back(flip);
                    return Ok(());
                }
            }
        };

        let sent = self.vsync.as_ref().map(|tx| tx.send(flip));
        if let Some(Err(mpsc::SendError(flip))) = sent {
            self.inner.lock().in_flight -= 1;
            drop(flip);
            return Err(HwError::UpdateFailed("vsync thread is gone".into()));
        }
        Ok(())
    }
}
