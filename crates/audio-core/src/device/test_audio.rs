//! Test audio devices
//!
//! Memory-backed capture and playout devices for running the pipeline
//! without audio hardware:
//!
//! - [`TestAudioSource`] / [`TestAudioPlayer`] run their own paced thread,
//!   like a real backend, and exchange samples through [`TestAudioBuffers`].
//! - [`ManualSource`] / [`ManualPlayer`] invoke the callbacks only when the
//!   test asks them to, on the calling thread.

use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{AudioPlayer, AudioSource, DeviceHandle, DeviceParams, ErrorHandler, ReadHandler, WriteHandler};
use crate::error::{AudioError, Result};

/// Shared sample stores for the threaded test devices
#[derive(Debug, Clone, Default)]
pub struct TestAudioBuffers {
    /// Samples the source delivers before falling back to its tone
    pub input: Arc<Mutex<VecDeque<i16>>>,
    /// Samples the player received
    pub output: Arc<Mutex<Vec<i16>>>,
}

impl TestAudioBuffers {
    /// Empty buffers
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue samples for capture
    pub fn push_input(&self, samples: &[i16]) {
        self.input.lock().extend(samples.iter().copied());
    }

    /// Take everything played so far
    pub fn take_output(&self) -> Vec<i16> {
        std::mem::take(&mut *self.output.lock())
    }
}

/// Keeps a device thread on its frame cadence
#[derive(Debug)]
struct FrameScheduler {
    frame_duration: Duration,
    next: Option<Instant>,
}

impl FrameScheduler {
    fn new(ptime: u32) -> Self {
        Self {
            frame_duration: Duration::from_millis(ptime.max(1) as u64),
            next: None,
        }
    }

    fn wait_for_next_frame(&mut self) {
        let now = Instant::now();
        let next = self.next.unwrap_or(now);
        if next > now {
            thread::sleep(next - now);
        }
        // Do not try to catch up after a stall
        self.next = Some(next.max(now) + self.frame_duration);
    }
}

/// Handle of a device driven by its own thread
struct ThreadedDevice {
    name: &'static str,
    run: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ThreadedDevice {
    fn spawn<F>(name: &'static str, mut tick: F, ptime: u32) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let run = Arc::new(AtomicBool::new(true));
        let thread = {
            let run = Arc::clone(&run);
            thread::Builder::new()
                .name(name.to_string())
                .spawn(move || {
                    let mut scheduler = FrameScheduler::new(ptime);
                    while run.load(Ordering::Acquire) {
                        scheduler.wait_for_next_frame();
                        if !run.load(Ordering::Acquire) {
                            break;
                        }
                        tick();
                    }
                })
                .map_err(|e| AudioError::device(name, "spawn", e.to_string()))?
        };

        Ok(Self {
            name,
            run,
            thread: Some(thread),
        })
    }
}

impl DeviceHandle for ThreadedDevice {
    fn stop(&mut self) {
        self.run.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("{}: device thread panicked", self.name);
            }
        }
    }
}

impl Drop for ThreadedDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Threaded capture device: queued input first, then a sine tone (or
/// silence when no tone is set)
#[derive(Debug, Clone)]
pub struct TestAudioSource {
    buffers: TestAudioBuffers,
    tone_hz: Option<f32>,
    amplitude: f32,
}

impl TestAudioSource {
    /// A source that plays silence once the input queue is empty
    pub fn new(buffers: TestAudioBuffers) -> Self {
        Self {
            buffers,
            tone_hz: None,
            amplitude: 8000.0,
        }
    }

    /// Generate a sine tone when the input queue is empty
    pub fn with_tone(mut self, hz: f32) -> Self {
        self.tone_hz = Some(hz);
        self
    }
}

impl AudioSource for TestAudioSource {
    fn name(&self) -> &str {
        "test"
    }

    fn alloc(
        &self,
        params: &DeviceParams,
        _device: Option<&str>,
        mut read: ReadHandler,
        _error: ErrorHandler,
    ) -> Result<Box<dyn DeviceHandle>> {
        debug!("test source: {}", params);

        let input = Arc::clone(&self.buffers.input);
        let tone = self.tone_hz;
        let amplitude = self.amplitude;
        let srate = params.srate.max(1) as f32;
        let channels = params.channels.max(1) as usize;
        let mut frame = vec![0i16; params.frame_size];
        let mut phase = 0u64;

        let tick = move || {
            {
                let mut queued = input.lock();
                for (i, slot) in frame.iter_mut().enumerate() {
                    *slot = match queued.pop_front() {
                        Some(sample) => sample,
                        None => match tone {
                            Some(hz) => {
                                let n = phase + (i / channels) as u64;
                                (amplitude * (2.0 * PI * hz * n as f32 / srate).sin()) as i16
                            }
                            None => 0,
                        },
                    };
                }
            }
            phase += (frame.len() / channels) as u64;
            read(&frame);
        };

        Ok(Box::new(ThreadedDevice::spawn("test-ausrc", tick, params.ptime)?))
    }
}

/// Threaded playout device recording everything it is given
#[derive(Debug, Clone)]
pub struct TestAudioPlayer {
    buffers: TestAudioBuffers,
    underruns: Arc<AtomicUsize>,
}

impl TestAudioPlayer {
    /// A player appending to `buffers.output`
    pub fn new(buffers: TestAudioBuffers) -> Self {
        Self {
            buffers,
            underruns: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Callbacks that produced no samples
    pub fn underruns(&self) -> usize {
        self.underruns.load(Ordering::Relaxed)
    }
}

impl AudioPlayer for TestAudioPlayer {
    fn name(&self) -> &str {
        "test"
    }

    fn alloc(
        &self,
        params: &DeviceParams,
        _device: Option<&str>,
        mut write: WriteHandler,
    ) -> Result<Box<dyn DeviceHandle>> {
        debug!("test player: {}", params);

        let output = Arc::clone(&self.buffers.output);
        let underruns = Arc::clone(&self.underruns);
        let mut frame = vec![0i16; params.frame_size];

        let tick = move || {
            if write(&mut frame) {
                output.lock().extend_from_slice(&frame);
            } else {
                underruns.fetch_add(1, Ordering::Relaxed);
            }
        };

        Ok(Box::new(ThreadedDevice::spawn("test-auplay", tick, params.ptime)?))
    }
}

struct ManualSlot<H> {
    handler: Option<H>,
    params: Option<DeviceParams>,
    allocs: usize,
    fail_next: bool,
}

impl<H> Default for ManualSlot<H> {
    fn default() -> Self {
        Self {
            handler: None,
            params: None,
            allocs: 0,
            fail_next: false,
        }
    }
}

impl<H> ManualSlot<H> {
    fn install(&mut self, name: &str, params: &DeviceParams, handler: H) -> Result<()> {
        if self.fail_next {
            self.fail_next = false;
            return Err(AudioError::device(name, "alloc", "injected failure"));
        }
        self.handler = Some(handler);
        self.params = Some(*params);
        self.allocs += 1;
        Ok(())
    }
}

/// Handle clearing a manual device's callback slot
struct ManualHandle<H: Send + 'static> {
    slot: Arc<Mutex<ManualSlot<H>>>,
}

impl<H: Send + 'static> DeviceHandle for ManualHandle<H> {
    fn stop(&mut self) {
        // Waits for an in-flight callback holding the lock
        self.slot.lock().handler = None;
    }
}

impl<H: Send + 'static> Drop for ManualHandle<H> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Capture device driven by the test
#[derive(Clone, Default)]
pub struct ManualSource {
    slot: Arc<Mutex<ManualSlot<(ReadHandler, ErrorHandler)>>>,
}

impl ManualSource {
    /// A stopped source
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver captured samples; false when the source is not running
    pub fn push(&self, samples: &[i16]) -> bool {
        let mut slot = self.slot.lock();
        match slot.handler.as_mut() {
            Some((read, _)) => {
                read(samples);
                true
            }
            None => false,
        }
    }

    /// Raise an asynchronous device error
    pub fn raise_error(&self, code: i32, message: &str) -> bool {
        let slot = self.slot.lock();
        match slot.handler.as_ref() {
            Some((_, error)) => {
                error(code, message);
                true
            }
            None => false,
        }
    }

    /// Make the next allocation fail
    pub fn fail_next_alloc(&self) {
        self.slot.lock().fail_next = true;
    }

    /// True between alloc and stop
    pub fn is_running(&self) -> bool {
        self.slot.lock().handler.is_some()
    }

    /// Parameters of the most recent allocation
    pub fn params(&self) -> Option<DeviceParams> {
        self.slot.lock().params
    }

    /// Number of successful allocations
    pub fn alloc_count(&self) -> usize {
        self.slot.lock().allocs
    }
}

impl AudioSource for ManualSource {
    fn name(&self) -> &str {
        "manual"
    }

    fn alloc(
        &self,
        params: &DeviceParams,
        _device: Option<&str>,
        read: ReadHandler,
        error: ErrorHandler,
    ) -> Result<Box<dyn DeviceHandle>> {
        self.slot.lock().install("manual", params, (read, error))?;
        Ok(Box::new(ManualHandle {
            slot: Arc::clone(&self.slot),
        }))
    }
}

/// Playout device driven by the test
#[derive(Clone, Default)]
pub struct ManualPlayer {
    slot: Arc<Mutex<ManualSlot<WriteHandler>>>,
}

impl ManualPlayer {
    /// A stopped player
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for `n` samples; `None` when stopped or nothing was written
    pub fn pull(&self, n: usize) -> Option<Vec<i16>> {
        let mut slot = self.slot.lock();
        let write = slot.handler.as_mut()?;
        let mut frame = vec![0i16; n];
        if write(&mut frame) {
            Some(frame)
        } else {
            None
        }
    }

    /// Make the next allocation fail
    pub fn fail_next_alloc(&self) {
        self.slot.lock().fail_next = true;
    }

    /// True between alloc and stop
    pub fn is_running(&self) -> bool {
        self.slot.lock().handler.is_some()
    }

    /// Parameters of the most recent allocation
    pub fn params(&self) -> Option<DeviceParams> {
        self.slot.lock().params
    }

    /// Number of successful allocations
    pub fn alloc_count(&self) -> usize {
        self.slot.lock().allocs
    }
}

impl AudioPlayer for ManualPlayer {
    fn name(&self) -> &str {
        "manual"
    }

    fn alloc(
        &self,
        params: &DeviceParams,
        _device: Option<&str>,
        write: WriteHandler,
    ) -> Result<Box<dyn DeviceHandle>> {
        self.slot.lock().install("manual", params, write)?;
        Ok(Box::new(ManualHandle {
            slot: Arc::clone(&self.slot),
        }))
    }
}
