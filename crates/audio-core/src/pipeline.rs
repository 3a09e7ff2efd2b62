//! Full-duplex audio pipeline
//!
//! An [`AudioStream`] sits on top of one RTP [`Stream`]. Captured PCM is
//! buffered in the tx ring buffer, pulled one packet at a time according to
//! the [`AudioMode`], encoded and sent. Received packets are decoded into
//! the rx ring buffer that the playout device drains.
//!
//! Device callbacks only touch the ring buffers, the encoder and the
//! telephone-event sender. Codec changes, device start/stop and all receive
//! processing happen on the caller's (reactor) side.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};
use voxmedia_rtp_core::{RtpHeader, RtpReceiver, Stream};

use crate::buffer::AudioBuffer;
use crate::codec::{CodecDescriptor, CodecInstance, CodecParams, CodecRegistry, SharedCodec, PT_CN};
use crate::config::{AudioConfig, AudioMode};
use crate::device::{
    AudioPlayer, AudioSource, DeviceHandle, DeviceParams, ErrorHandler, ReadHandler, WriteHandler,
};
use crate::error::{AudioError, Result};
use crate::filter::{FilterChain, FilterParams, FilterRegistry};
use crate::realtime;
use crate::telev::{code_to_digit, digit_to_code, TelevReceiver, TelevSender};

/// Period of the tx thread and the tx timer
pub const TX_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Upper bound on frames decoded from one packet
pub const MAX_DECODE_FRAMES: usize = 64;

/// RTP timestamp of the first outgoing packet
const INITIAL_TIMESTAMP: u32 = 160;

/// Called with `(digit, end)` for received telephone events
pub type EventHandler = Arc<dyn Fn(char, bool) + Send + Sync>;

/// Called with `(code, message)` for asynchronous device errors
pub type DeviceErrorHandler = Arc<dyn Fn(i32, &str) + Send + Sync>;

/// Collaborators handed to every audio stream of an application
#[derive(Clone)]
pub struct AudioContext {
    codecs: Arc<CodecRegistry>,
    filters: Arc<FilterRegistry>,
    source: Option<Arc<dyn AudioSource>>,
    player: Option<Arc<dyn AudioPlayer>>,
    event_handler: Option<EventHandler>,
    error_handler: Option<DeviceErrorHandler>,
}

impl AudioContext {
    /// A context with the given codecs, no filters and no devices
    pub fn new(codecs: CodecRegistry) -> Self {
        Self {
            codecs: Arc::new(codecs),
            filters: Arc::new(FilterRegistry::new()),
            source: None,
            player: None,
            event_handler: None,
            error_handler: None,
        }
    }

    /// Use these filters
    pub fn with_filters(mut self, filters: FilterRegistry) -> Self {
        self.filters = Arc::new(filters);
        self
    }

    /// Capture from this backend
    pub fn with_source(mut self, source: Arc<dyn AudioSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Play out through this backend
    pub fn with_player(mut self, player: Arc<dyn AudioPlayer>) -> Self {
        self.player = Some(player);
        self
    }

    /// Receive telephone events
    pub fn on_telephone_event<F>(mut self, handler: F) -> Self
    where
        F: Fn(char, bool) + Send + Sync + 'static,
    {
        self.event_handler = Some(Arc::new(handler));
        self
    }

    /// Receive asynchronous device errors
    pub fn on_device_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(i32, &str) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// The codec registry
    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }
}

impl fmt::Debug for AudioContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioContext")
            .field("codecs", &self.codecs.len())
            .field("filters", &self.filters)
            .field("source", &self.source.as_ref().map(|s| s.name().to_string()))
            .field("player", &self.player.as_ref().map(|p| p.name().to_string()))
            .finish()
    }
}

struct TxState {
    encoder: Option<SharedCodec>,
    pt: Option<u8>,
    pt_tel: Option<u8>,
    ts: u32,
    ts_tel: u32,
    marker: bool,
    ptime: u32,
    /// Capture format; set when the source starts
    src: Option<DeviceParams>,
    telev: TelevSender,
    telev_elapsed: u32,
    cur_key: Option<char>,
}

struct RxState {
    decoder: Option<SharedCodec>,
    pt: Option<u8>,
    pt_tel: Option<u8>,
    ptime: u32,
    telev: TelevReceiver,
    lost: u64,
}

/// The pipeline-owned tx thread
struct TxWorker {
    run: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl TxWorker {
    fn spawn(audio: Weak<AudioInner>, ptime: u32, realtime: bool) -> Result<Self> {
        let run = Arc::new(AtomicBool::new(true));
        let wait = Duration::from_millis(ptime as u64);

        let thread = {
            let run = Arc::clone(&run);
            thread::Builder::new()
                .name("audio-tx".to_string())
                .spawn(move || {
                    if realtime {
                        realtime::enable_realtime();
                    }
                    while run.load(Ordering::Acquire) {
                        match audio.upgrade() {
                            Some(a) => {
                                a.poll_tx(Some(wait));
                            }
                            None => break,
                        }
                        thread::sleep(TX_POLL_INTERVAL);
                    }
                    debug!("audio: tx thread exited");
                })
                .map_err(|e| AudioError::device("audio-tx", "spawn", e.to_string()))?
        };

        Ok(Self {
            run,
            thread: Some(thread),
        })
    }

    fn signal(&self) {
        self.run.store(false, Ordering::Release);
    }

    fn join(mut self) {
        self.signal();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("audio: tx thread panicked");
            }
        }
    }
}

#[derive(Default)]
struct Devices {
    source: Option<Box<dyn DeviceHandle>>,
    player: Option<Box<dyn DeviceHandle>>,
    tx_worker: Option<TxWorker>,
    tx_timer: Option<JoinHandle<()>>,
}

struct AudioInner {
    stream: Stream,
    config: AudioConfig,
    ctx: AudioContext,
    mode: Mutex<AudioMode>,
    tx: Mutex<TxState>,
    rx: Mutex<RxState>,
    aubuf_tx: RwLock<Option<Arc<AudioBuffer>>>,
    aubuf_rx: RwLock<Option<Arc<AudioBuffer>>>,
    filters: RwLock<Option<Arc<Mutex<FilterChain>>>>,
    devices: Mutex<Devices>,
    started: AtomicBool,
    muted: AtomicBool,
    vu_meter: AtomicBool,
    vu_avg: AtomicU32,
}

/// Delivers packets from the RTP stream to the pipeline
struct AudioReceiver(Weak<AudioInner>);

impl RtpReceiver for AudioReceiver {
    fn on_rtp(&self, header: &RtpHeader, payload: Option<Bytes>) {
        if let Some(audio) = self.0.upgrade() {
            audio.on_rtp(header, payload);
        }
    }
}

/// Audio pipeline bound to one RTP stream.
///
/// Dropping the `AudioStream` stops devices and the tx thread and closes
/// the stream.
pub struct AudioStream {
    inner: Arc<AudioInner>,
}

impl AudioStream {
    /// Attach an audio pipeline to `stream`.
    ///
    /// Advertises `ptime` and every codec in the context that fits the
    /// configured clock-rate and channel ranges on the stream's media line.
    pub fn new(stream: Stream, config: AudioConfig, ctx: AudioContext) -> Result<Self> {
        config.validate()?;

        {
            let mut media = stream.media().write();
            media.set_local_attr("ptime", Some(config.ptime.to_string()));
            let added = ctx.codecs.add_to_media(&mut media, config.srate, config.channels);
            debug!("audio: advertising {} codecs", added);
        }

        let inner = Arc::new(AudioInner {
            stream: stream.clone(),
            mode: Mutex::new(config.mode),
            tx: Mutex::new(TxState {
                encoder: None,
                pt: None,
                pt_tel: None,
                ts: INITIAL_TIMESTAMP,
                ts_tel: INITIAL_TIMESTAMP,
                marker: true,
                ptime: config.ptime,
                src: None,
                telev: TelevSender::new(),
                telev_elapsed: config.telev_ptime,
                cur_key: None,
            }),
            rx: Mutex::new(RxState {
                decoder: None,
                pt: None,
                pt_tel: None,
                ptime: config.ptime,
                telev: TelevReceiver::new(),
                lost: 0,
            }),
            config,
            ctx,
            aubuf_tx: RwLock::new(None),
            aubuf_rx: RwLock::new(None),
            filters: RwLock::new(None),
            devices: Mutex::new(Devices::default()),
            started: AtomicBool::new(false),
            muted: AtomicBool::new(false),
            vu_meter: AtomicBool::new(false),
            vu_avg: AtomicU32::new(0),
        });

        stream.set_receiver(Arc::new(AudioReceiver(Arc::downgrade(&inner))));

        Ok(Self { inner })
    }

    /// Start the stream, the filter chain, the player (if a decoder is set)
    /// and the source (if an encoder is set). Devices already running are
    /// left alone. Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        self.inner.start()
    }

    /// Stop the tx scheduler and all devices, then release the filter
    /// chain and ring buffers
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Set the encoder and its payload type.
    ///
    /// Shares the decoder's codec instance when both are the same codec.
    /// The source is restarted when the clock rate or channel count changes.
    pub fn set_encoder(&self, codec: Arc<CodecDescriptor>, pt: u8, fmtp: Option<&str>) -> Result<()> {
        self.inner.set_encoder(codec, pt, fmtp)
    }

    /// Set the decoder and its payload type.
    ///
    /// Shares the encoder's codec instance when both are the same codec.
    /// The player and filter chain are rebuilt when the clock rate or
    /// channel count changes.
    pub fn set_decoder(&self, codec: Arc<CodecDescriptor>, pt: u8) -> Result<()> {
        self.inner.set_decoder(codec, pt, None)
    }

    /// Payload types for sending and receiving telephone events
    pub fn enable_telephone_events(&self, pt_tx: u8, pt_rx: u8) {
        info!("audio: telephone-event pt_tx={} pt_rx={}", pt_tx, pt_rx);
        self.inner.tx.lock().pt_tel = Some(pt_tx);
        self.inner.rx.lock().pt_tel = Some(pt_rx);
    }

    /// Press (`Some`) or release (`None`) a DTMF key
    pub fn send_digit(&self, key: Option<char>) -> Result<()> {
        let mut tx = self.inner.tx.lock();
        match key {
            Some(key) => {
                let code = digit_to_code(key).ok_or_else(|| {
                    AudioError::invalid_config(format!("'{}' is not a DTMF digit", key))
                })?;
                info!("audio: send DTMF digit '{}'", key);
                if tx.cur_key.is_some() {
                    tx.telev.end();
                }
                tx.telev.start(code)?;
                tx.cur_key = Some(key);
            }
            None => {
                if let Some(cur) = tx.cur_key.take() {
                    info!("audio: send DTMF digit end '{}'", cur);
                    tx.telev.end();
                }
            }
        }
        Ok(())
    }

    /// Send silence instead of captured audio
    pub fn mute(&self, muted: bool) {
        self.inner.muted.store(muted, Ordering::Relaxed);
    }

    /// True while muted
    pub fn is_muted(&self) -> bool {
        self.inner.muted.load(Ordering::Relaxed)
    }

    /// Track the level of decoded audio
    pub fn enable_vu_meter(&self, enabled: bool) {
        self.inner.vu_meter.store(enabled, Ordering::Relaxed);
    }

    /// Level bar of the decoded audio, e.g. `" [====            ]"`
    pub fn vu_bar(&self) -> Option<String> {
        if !self.inner.vu_meter.load(Ordering::Relaxed) {
            return None;
        }
        let avg = self.inner.vu_avg.load(Ordering::Relaxed) as usize;
        let bars = (2 * 16 * avg / 0x8000).min(15);
        Some(format!(" [{:<16}]", "=".repeat(bars)))
    }

    /// Change the tx scheduling mode. A running source is restarted so that
    /// exactly one puller is active.
    pub fn set_mode(&self, mode: AudioMode) -> Result<()> {
        self.inner.set_mode(mode)
    }

    /// Switch between the `thread` and `poll` modes
    pub fn enable_tx_thread(&self, enabled: bool) -> Result<()> {
        self.set_mode(if enabled {
            AudioMode::Thread
        } else {
            AudioMode::Poll
        })
    }

    /// Current tx scheduling mode
    pub fn mode(&self) -> AudioMode {
        *self.inner.mode.lock()
    }

    /// Apply the peer's `ptime` and the stream-level attributes
    pub fn decode_sdp_attributes(&self) {
        let ptime = self
            .inner
            .stream
            .media()
            .read()
            .remote_attr("ptime")
            .flatten()
            .and_then(|v| v.trim().parse::<u32>().ok());

        if let Some(ptime) = ptime.filter(|p| *p > 0) {
            let mut tx = self.inner.tx.lock();
            if tx.ptime != ptime {
                info!("audio: peer changed ptime_tx {} -> {}", tx.ptime, ptime);
                tx.ptime = ptime;
            }
        }

        self.inner.stream.decode_sdp_attributes();
    }

    /// Loudspeaker mode changed
    pub fn update(&self, speakerphone: bool) {
        if let Some(chain) = self.inner.filter_chain() {
            if let Err(e) = chain.lock().update(speakerphone) {
                warn!("audio: filter update: {}", e);
            }
        }
    }

    /// The underlying RTP stream
    pub fn stream(&self) -> &Stream {
        &self.inner.stream
    }

    /// Active encoder instance
    pub fn encoder(&self) -> Option<SharedCodec> {
        self.inner.tx.lock().encoder.clone()
    }

    /// Active decoder instance
    pub fn decoder(&self) -> Option<SharedCodec> {
        self.inner.rx.lock().decoder.clone()
    }

    /// Payload type of outgoing audio
    pub fn tx_payload_type(&self) -> Option<u8> {
        self.inner.tx.lock().pt
    }

    /// Payload type the decoder is bound to
    pub fn rx_payload_type(&self) -> Option<u8> {
        self.inner.rx.lock().pt
    }

    /// RTP timestamp of the next outgoing audio packet
    pub fn tx_timestamp(&self) -> u32 {
        self.inner.tx.lock().ts
    }

    /// Packet time used for sending
    pub fn ptime_tx(&self) -> u32 {
        self.inner.tx.lock().ptime
    }

    /// Loss notifications received from the stream
    pub fn lost_packets(&self) -> u64 {
        self.inner.rx.lock().lost
    }

    /// Filters in the active chain
    pub fn filter_names(&self) -> Vec<String> {
        self.inner
            .filter_chain()
            .map(|c| c.lock().names().into_iter().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// True while a capture device is running
    pub fn source_running(&self) -> bool {
        self.inner.devices.lock().source.is_some()
    }

    /// True while a playout device is running
    pub fn player_running(&self) -> bool {
        self.inner.devices.lock().player.is_some()
    }

    /// True while the pipeline-owned tx thread runs
    pub fn tx_thread_running(&self) -> bool {
        self.inner.devices.lock().tx_worker.is_some()
    }

    /// Run one pull-encode-send cycle without waiting for samples.
    /// Returns true when a packet was encoded.
    pub fn poll_tx(&self) -> bool {
        self.inner.poll_tx(None)
    }
}

impl fmt::Display for AudioStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn codec(c: &Option<SharedCodec>) -> String {
            c.as_ref()
                .map(|c| c.descriptor().to_string())
                .unwrap_or_else(|| "(none)".to_string())
        }
        fn pt(pt: Option<u8>) -> String {
            pt.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())
        }
        fn aubuf(buf: &Option<Arc<AudioBuffer>>) -> String {
            buf.as_ref()
                .map(|b| b.to_string())
                .unwrap_or_else(|| "(none)".to_string())
        }

        let inner = &self.inner;
        let (enc, ptime_tx, pt_tx) = {
            let tx = inner.tx.lock();
            (codec(&tx.encoder), tx.ptime, pt(tx.pt))
        };
        let (dec, ptime_rx, pt_rx) = {
            let rx = inner.rx.lock();
            (codec(&rx.decoder), rx.ptime, pt(rx.pt))
        };

        writeln!(f, "--- Audio stream ---")?;
        writeln!(f, " tx/enc:   {} ptime={}ms pt={}", enc, ptime_tx, pt_tx)?;
        writeln!(f, " rx/dec:   {} ptime={}ms pt={}", dec, ptime_rx, pt_rx)?;
        writeln!(f, " aubuf_tx: {}", aubuf(&inner.aubuf_tx.read()))?;
        writeln!(f, " aubuf_rx: {}", aubuf(&inner.aubuf_rx.read()))?;
        write!(f, "{}", inner.stream.debug_summary())
    }
}

impl fmt::Debug for AudioStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioStream")
            .field("stream", &self.inner.stream.name())
            .field("mode", &self.mode())
            .finish()
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        self.inner.stop();
        self.inner.stream.close();
    }
}

impl AudioInner {
    fn filter_chain(&self) -> Option<Arc<Mutex<FilterChain>>> {
        self.filters.read().clone()
    }

    fn codec_params(codec: &CodecDescriptor, ptime: u32, fmtp: Option<&str>) -> CodecParams {
        CodecParams {
            srate: codec.dsp_srate(),
            channels: codec.channels,
            ptime,
            fmtp: fmtp.map(str::to_string).or_else(|| codec.fmtp.clone()),
        }
    }

    /// Filter parameters for both directions, plus the device rates they imply
    fn filter_params(
        &self,
        enc: Option<&CodecDescriptor>,
        dec: Option<&CodecDescriptor>,
        ptime_tx: u32,
        ptime_rx: u32,
    ) -> (FilterParams, FilterParams) {
        let mut encprm = FilterParams::default();
        let mut decprm = FilterParams::default();

        if let Some(ac) = enc {
            encprm.srate = self.config.srate_src.clamp_preferred(ac.dsp_srate());
            encprm.srate_out = ac.dsp_srate();
            encprm.channels = ac.channels;
            encprm.frame_size = crate::device::frame_samples(encprm.srate_out, ac.channels, ptime_tx);
            encprm.aec_len = self.config.aec_len;
        }

        if let Some(ac) = dec {
            decprm.srate = ac.dsp_srate();
            decprm.srate_out = self.config.srate_play.clamp_preferred(ac.dsp_srate());
            decprm.channels = ac.channels;
            decprm.frame_size = crate::device::frame_samples(decprm.srate, ac.channels, ptime_rx);
            decprm.aec_len = self.config.aec_len;
        }

        (encprm, decprm)
    }

    fn start(self: &Arc<Self>) -> Result<()> {
        self.stream.start();

        let (enc, ptime_tx) = {
            let tx = self.tx.lock();
            (tx.encoder.as_ref().map(|c| Arc::clone(c.descriptor())), tx.ptime)
        };
        let (dec, ptime_rx) = {
            let rx = self.rx.lock();
            (rx.decoder.as_ref().map(|c| Arc::clone(c.descriptor())), rx.ptime)
        };

        let mut srate_enc = 0;
        let mut srate_dec = 0;
        let need_filters = self.filters.read().is_none() && !self.ctx.filters.is_empty();
        if need_filters {
            let (encprm, decprm) = self.filter_params(enc.as_deref(), dec.as_deref(), ptime_tx, ptime_rx);
            let chain = FilterChain::alloc(&self.ctx.filters, &encprm, &decprm)?;
            srate_enc = encprm.srate;
            srate_dec = decprm.srate_out;
            *self.filters.write() = Some(Arc::new(Mutex::new(chain)));
        }

        let device = self.config.device.as_deref();
        let mut devices = self.devices.lock();

        if devices.player.is_none() {
            if let (Some(player), Some(dec)) = (&self.ctx.player, &dec) {
                let srate = if srate_dec != 0 { srate_dec } else { dec.dsp_srate() };
                let prm = DeviceParams::new(srate, dec.channels, ptime_rx);

                let buf = match self.aubuf_rx.read().clone() {
                    Some(buf) => buf,
                    None => Arc::new(AudioBuffer::new(prm.frame_size, prm.frame_size * 8)?),
                };
                *self.aubuf_rx.write() = Some(Arc::clone(&buf));

                let write: WriteHandler = Box::new(move |out: &mut [i16]| buf.read(out) > 0);
                let handle = player.alloc(&prm, device, write).map_err(|e| {
                    warn!("audio: start: audio player failed: {}", e);
                    e
                })?;
                debug!("audio: player {} started: {}", player.name(), prm);
                devices.player = Some(handle);
            }
        }

        if devices.source.is_none() {
            if let (Some(source), Some(enc)) = (&self.ctx.source, &enc) {
                let srate = if srate_enc != 0 { srate_enc } else { enc.dsp_srate() };
                let prm = DeviceParams::new(srate, enc.channels, ptime_tx);

                let buf = match self.aubuf_tx.read().clone() {
                    Some(buf) => buf,
                    None => Arc::new(AudioBuffer::new(prm.frame_size * 2, prm.frame_size * 30)?),
                };
                *self.aubuf_tx.write() = Some(buf);
                self.tx.lock().src = Some(prm);

                let weak = Arc::downgrade(self);
                let read: ReadHandler = Box::new(move |samples: &[i16]| {
                    if let Some(audio) = weak.upgrade() {
                        audio.on_capture(samples);
                    }
                });

                let error_handler = self.ctx.error_handler.clone();
                let error: ErrorHandler = Box::new(move |code: i32, message: &str| {
                    warn!("audio: source error {}: {}", code, message);
                    if let Some(handler) = &error_handler {
                        handler(code, message);
                    }
                });

                let handle = source.alloc(&prm, device, read, error).map_err(|e| {
                    warn!("audio: start: audio source failed: {}", e);
                    e
                })?;
                debug!("audio: source {} started: {}", source.name(), prm);
                devices.source = Some(handle);

                match *self.mode.lock() {
                    mode @ (AudioMode::Thread | AudioMode::ThreadRealtime) => {
                        if devices.tx_worker.is_none() {
                            let realtime = mode == AudioMode::ThreadRealtime;
                            devices.tx_worker =
                                Some(TxWorker::spawn(Arc::downgrade(self), ptime_tx, realtime)?);
                        }
                    }
                    AudioMode::Timer => {
                        if devices.tx_timer.is_none() {
                            devices.tx_timer = Some(tokio::spawn(tx_timer(Arc::downgrade(self))));
                        }
                    }
                    AudioMode::Poll => {}
                }
            }
        }

        self.started.store(true, Ordering::Release);
        Ok(())
    }

    /// Stop the tx scheduler and the source, then drop the tx ring buffer
    fn stop_source(&self) {
        let (worker, timer, source) = {
            let mut devices = self.devices.lock();
            (
                devices.tx_worker.take(),
                devices.tx_timer.take(),
                devices.source.take(),
            )
        };

        if let Some(worker) = &worker {
            worker.signal();
        }
        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(mut source) = source {
            source.stop();
        }
        if let Some(worker) = worker {
            worker.join();
        }
        if let Some(buf) = self.aubuf_tx.write().take() {
            buf.close();
        }
    }

    /// Stop the player, then drop the rx ring buffer
    fn stop_player(&self) {
        let player = self.devices.lock().player.take();
        if let Some(mut player) = player {
            player.stop();
        }
        if let Some(buf) = self.aubuf_rx.write().take() {
            buf.close();
        }
    }

    fn stop(&self) {
        let (worker, timer, source, player) = {
            let mut devices = self.devices.lock();
            (
                devices.tx_worker.take(),
                devices.tx_timer.take(),
                devices.source.take(),
                devices.player.take(),
            )
        };

        if let Some(worker) = &worker {
            worker.signal();
        }
        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(mut source) = source {
            source.stop();
        }
        if let Some(worker) = worker {
            worker.join();
        }
        if let Some(mut player) = player {
            player.stop();
        }

        *self.filters.write() = None;

        for slot in [&self.aubuf_tx, &self.aubuf_rx] {
            if let Some(buf) = slot.write().take() {
                buf.close();
            }
        }

        if self.started.swap(false, Ordering::AcqRel) {
            debug!("audio: stopped");
        }
    }

    fn set_encoder(self: &Arc<Self>, codec: Arc<CodecDescriptor>, pt: u8, fmtp: Option<&str>) -> Result<()> {
        info!("audio: set encoder: {} pt={}", codec, pt);

        let ptime = self.tx.lock().ptime;
        let shared = self
            .rx
            .lock()
            .decoder
            .clone()
            .filter(|dec| dec.descriptor().same_codec(&codec));
        let instance = match shared {
            Some(dec) => dec,
            None => CodecInstance::create(Arc::clone(&codec), &Self::codec_params(&codec, ptime, fmtp))
                .map_err(|e| {
                    warn!("audio: alloc encoder: {}", e);
                    e
                })?,
        };

        let restart = {
            let mut tx = self.tx.lock();
            let restart = tx
                .encoder
                .as_ref()
                .map_or(false, |old| !old.descriptor().same_clock(&codec));
            tx.encoder = Some(instance);
            tx.pt = Some(pt);
            restart
        };

        self.stream.set_sample_rates(codec.dsp_srate(), codec.dsp_srate());

        if restart {
            self.stop_source();
        }
        if self.started.load(Ordering::Acquire) {
            self.start()?;
        }
        Ok(())
    }

    fn set_decoder(self: &Arc<Self>, codec: Arc<CodecDescriptor>, pt: u8, fmtp: Option<&str>) -> Result<()> {
        info!("audio: set decoder: {} pt={}", codec, pt);

        let ptime = self.rx.lock().ptime;
        let shared = self
            .tx
            .lock()
            .encoder
            .clone()
            .filter(|enc| enc.descriptor().same_codec(&codec));
        let instance = match shared {
            Some(enc) => enc,
            None => CodecInstance::create(Arc::clone(&codec), &Self::codec_params(&codec, ptime, fmtp))
                .map_err(|e| {
                    warn!("audio: alloc decoder: {}", e);
                    e
                })?,
        };

        let restart = {
            let mut rx = self.rx.lock();
            let restart = rx
                .decoder
                .as_ref()
                .map_or(false, |old| !old.descriptor().same_clock(&codec));
            rx.decoder = Some(instance);
            rx.pt = Some(pt);
            restart
        };

        self.stream.set_sample_rates(codec.dsp_srate(), codec.dsp_srate());

        if restart {
            self.stop_player();
            *self.filters.write() = None;
        }
        if self.started.load(Ordering::Acquire) {
            self.start()?;
        }
        Ok(())
    }

    fn set_mode(self: &Arc<Self>, mode: AudioMode) -> Result<()> {
        {
            let mut current = self.mode.lock();
            if *current == mode {
                return Ok(());
            }
            info!("audio: tx mode {} -> {}", *current, mode);
            *current = mode;
        }

        let source_running = self.devices.lock().source.is_some();
        if source_running {
            self.stop_source();
            self.start()?;
        }
        Ok(())
    }

    /// Capture callback, runs on the device thread
    fn on_capture(&self, samples: &[i16]) {
        let silence;
        let data = if self.muted.load(Ordering::Relaxed) {
            silence = vec![0i16; samples.len()];
            &silence[..]
        } else {
            samples
        };

        let buf = self.aubuf_tx.read().clone();
        if let Some(buf) = buf {
            match buf.write(data) {
                Ok(()) => {
                    if *self.mode.lock() == AudioMode::Poll {
                        self.poll_tx(None);
                    }
                }
                Err(e) => trace!("audio: tx buffer: {}", e),
            }
        }

        self.check_telev(samples.len());
    }

    /// Pull one packet worth of samples, encode and send it. `wait` bounds
    /// the time spent waiting for samples; `None` never blocks.
    fn poll_tx(&self, wait: Option<Duration>) -> bool {
        let Some(buf) = self.aubuf_tx.read().clone() else {
            return false;
        };
        let frame_size = match self.tx.lock().src {
            Some(src) if src.frame_size > 0 => src.frame_size,
            _ => return false,
        };

        let mut pcm = vec![0i16; frame_size];
        let pulled = match wait {
            Some(timeout) => buf.get(&mut pcm, timeout).is_ok(),
            None => buf.try_get(&mut pcm),
        };
        if !pulled {
            return false;
        }

        if let Some(chain) = self.filter_chain() {
            if let Err(e) = chain.lock().encode(&mut pcm) {
                warn!("audio: encode filter: {}", e);
            }
        }

        self.encode_send(&pcm)
    }

    fn encode_send(&self, pcm: &[i16]) -> bool {
        let mut tx = self.tx.lock();
        let (Some(encoder), Some(pt)) = (tx.encoder.clone(), tx.pt) else {
            return false;
        };

        let mut out = Vec::with_capacity(pcm.len() * 2);
        let sent = match encoder.encode(pcm, &mut out) {
            Ok(()) => match self.stream.send(tx.marker, pt, tx.ts, &out) {
                Ok(()) => {
                    tx.ts = tx.ts.wrapping_add(encoder.descriptor().rtp_units(pcm.len()));
                    true
                }
                Err(e) => {
                    warn!("audio: send: {}", e);
                    false
                }
            },
            Err(e) => {
                warn!("audio: encode: {}", e);
                false
            }
        };

        tx.marker = false;
        sent
    }

    fn check_telev(&self, captured: usize) {
        let telev_ptime = self.config.telev_ptime;
        let mut tx = self.tx.lock();

        let elapsed_ms = match tx.src {
            Some(src) if src.srate > 0 && src.channels > 0 => {
                (captured as u64 * 1000 / (src.srate as u64 * src.channels as u64)) as u32
            }
            _ => tx.ptime,
        };
        tx.telev_elapsed = tx.telev_elapsed.saturating_add(elapsed_ms).min(telev_ptime);
        if tx.telev_elapsed < telev_ptime {
            return;
        }

        let Some(packet) = tx.telev.poll(telev_ptime) else {
            return;
        };
        tx.telev_elapsed = 0;

        if packet.marker {
            tx.ts_tel = tx.ts;
        }

        let Some(pt) = tx.pt_tel else {
            return;
        };
        if let Err(e) = self.stream.send(packet.marker, pt, tx.ts_tel, &packet.payload) {
            warn!("audio: telephone-event send: {}", e);
        }
    }

    /// Packet from the stream, runs on the reactor
    fn on_rtp(self: &Arc<Self>, header: &RtpHeader, payload: Option<Bytes>) {
        let Some(payload) = payload else {
            self.rx.lock().lost += 1;
            trace!("audio: loss reported before seq {}", header.sequence_number);
            self.conceal();
            return;
        };

        let pt = header.payload_type;
        let (pt_tel, pt_rx) = {
            let rx = self.rx.lock();
            (rx.pt_tel, rx.pt)
        };

        if Some(pt) == pt_tel {
            self.handle_telev(&payload);
            return;
        }

        if pt == PT_CN {
            return;
        }

        if Some(pt) != pt_rx {
            let format = self.stream.media().read().local_format(pt).cloned();
            let codec = format.as_ref().and_then(|f| self.ctx.codecs.find_format(f));
            match (format, codec) {
                (Some(format), Some(codec)) => {
                    info!("audio: rx payload type changed {:?} -> {}", pt_rx, pt);
                    if let Err(e) = self.set_decoder(codec, pt, format.fmtp.as_deref()) {
                        warn!("audio: decoder for payload type {}: {}", pt, e);
                        return;
                    }
                }
                _ => {
                    debug!("audio: no codec for payload type {}, dropping packet", pt);
                    return;
                }
            }
        }

        self.decode(payload);
    }

    fn handle_telev(&self, payload: &Bytes) {
        let event = self.rx.lock().telev.recv(payload);
        match event {
            Ok(Some((code, end))) => match code_to_digit(code) {
                Some(digit) => {
                    info!("audio: received DTMF '{}' end={}", digit, end);
                    if let Some(handler) = &self.ctx.event_handler {
                        handler(digit, end);
                    }
                }
                None => debug!("audio: ignoring telephone event {}", code),
            },
            Ok(None) => {}
            Err(e) => warn!("audio: telephone event: {}", e),
        }
    }

    fn decode(&self, mut payload: Bytes) {
        let Some(decoder) = self.rx.lock().decoder.clone() else {
            return;
        };

        let mut pcm = Vec::new();
        let mut frames = 0;
        while !payload.is_empty() {
            if frames == MAX_DECODE_FRAMES {
                warn!("audio: decode: {} frames in one packet, rest dropped", frames);
                break;
            }
            if let Err(e) = decoder.decode(&mut payload, &mut pcm) {
                warn!("audio: decode: {}", e);
                return;
            }
            frames += 1;
        }

        self.render(pcm);
    }

    fn conceal(&self) {
        let Some(decoder) = self.rx.lock().decoder.clone() else {
            return;
        };

        let mut pcm = Vec::new();
        if let Err(e) = decoder.conceal(&mut pcm) {
            warn!("audio: conceal: {}", e);
            return;
        }
        if !pcm.is_empty() {
            self.render(pcm);
        }
    }

    /// Decoded PCM through the decode filters, VU meter and rx buffer
    fn render(&self, mut pcm: Vec<i16>) {
        if let Some(chain) = self.filter_chain() {
            if let Err(e) = chain.lock().decode(&mut pcm) {
                warn!("audio: decode filter: {}", e);
            }
        }

        if self.vu_meter.load(Ordering::Relaxed) {
            self.vu_avg.store(average_level(&pcm) as u32, Ordering::Relaxed);
        }

        let buf = self.aubuf_rx.read().clone();
        if let Some(buf) = buf {
            if let Err(e) = buf.write(&pcm) {
                trace!("audio: rx buffer: {}", e);
            }
        }
    }
}

/// Running average of absolute sample values
fn average_level(pcm: &[i16]) -> u16 {
    pcm.iter()
        .fold(0u32, |avg, &s| (avg + s.unsigned_abs() as u32) / 2) as u16
}

async fn tx_timer(audio: Weak<AudioInner>) {
    let mut interval = tokio::time::interval(TX_POLL_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        match audio.upgrade() {
            Some(a) => {
                a.poll_tx(None);
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_level() {
        assert_eq!(average_level(&[]), 0);
        assert_eq!(average_level(&[100, -100]), 75);
        assert_eq!(average_level(&[i16::MIN; 32]), 32767);
    }
}
