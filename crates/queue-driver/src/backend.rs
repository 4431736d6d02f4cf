//! CPAL-backed implementation of the engine seam.
//!
//! Each queue maps onto one CPAL output stream. Enqueued buffers sit in a
//! per-queue list that the stream callback drains front to back, converting
//! the driver's u8/i16 PCM to the device sample format and applying the
//! queue volume. Fully consumed buffers are reported on a dedicated
//! delivery thread, standing in for the native driver's callback thread.
//!
//! CPAL streams are not `Send`, so a single stream thread owns all of them
//! and is driven by commands; the audio callback itself shares state with
//! the engine through `Arc`s and never goes through that thread.
//!
//! The backend performs no resampling: the output device must accept the
//! context sample rate.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::Result;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};

use crate::config::DriverConfig;
use crate::context::Context;
use crate::device;
use crate::engine::{AudioEngine, BufferId, CompletionHandler, EngineError, QueueId, StreamFormat};

/// [`AudioEngine`] over a CPAL output device.
pub struct CpalEngine {
    inner: Mutex<EngineInner>,
    registry: Arc<Mutex<HashMap<QueueId, DeliveryEntry>>>,
    stream_tx: Sender<StreamCommand>,
}

#[derive(Default)]
struct EngineInner {
    next_id: u64,
    queues: HashMap<QueueId, QueueEntry>,
}

struct QueueEntry {
    shared: Arc<QueueShared>,
    buffers: HashMap<BufferId, usize>,
}

struct DeliveryEntry {
    handler: CompletionHandler,
    shared: Arc<QueueShared>,
}

struct Completion {
    queue: QueueId,
    buffer: BufferId,
    generation: u64,
}

/// Queue state shared between engine calls and the stream callback.
struct QueueShared {
    format: StreamFormat,
    volume_bits: AtomicU32,
    /// Bumped on stop; stale completions compare unequal and are dropped,
    /// matching a native queue that flushes callbacks when stopped.
    generation: AtomicU64,
    state: Mutex<QueuePlayState>,
}

#[derive(Default)]
struct QueuePlayState {
    enqueued: VecDeque<EnqueuedBuffer>,
}

struct EnqueuedBuffer {
    id: BufferId,
    data: Vec<u8>,
    pos: usize,
}

enum StreamCommand {
    Start {
        queue: QueueId,
        shared: Arc<QueueShared>,
        reply: Sender<Result<(), EngineError>>,
    },
    Pause {
        queue: QueueId,
        reply: Sender<Result<(), EngineError>>,
    },
    Drop {
        queue: QueueId,
        reply: Sender<()>,
    },
    Shutdown,
}

impl CpalEngine {
    /// Open the default host and pick an output device, optionally by
    /// substring match.
    pub fn new(device_hint: Option<&str>) -> Result<Self> {
        let host = cpal::default_host();
        let device = device::pick_device(&host, device_hint)?;

        let (completions_tx, completions_rx) = crossbeam_channel::unbounded();
        let (stream_tx, stream_rx) = crossbeam_channel::unbounded();
        let registry: Arc<Mutex<HashMap<QueueId, DeliveryEntry>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let delivery_registry = registry.clone();
        thread::spawn(move || delivery_thread(completions_rx, delivery_registry));
        // The stream thread holds the last completion sender; the delivery
        // thread exits with it on shutdown.
        thread::spawn(move || stream_thread(device, stream_rx, completions_tx));

        Ok(Self {
            inner: Mutex::new(EngineInner::default()),
            registry,
            stream_tx,
        })
    }

    fn shared_for(&self, queue: QueueId, op: &'static str) -> Result<Arc<QueueShared>, EngineError> {
        let inner = self.inner.lock().unwrap();
        inner
            .queues
            .get(&queue)
            .map(|entry| entry.shared.clone())
            .ok_or(EngineError::Call { op, detail: "unknown queue".into() })
    }

    fn drop_stream(&self, queue: QueueId) {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        if self
            .stream_tx
            .send(StreamCommand::Drop { queue, reply: reply_tx })
            .is_ok()
        {
            let _ = reply_rx.recv();
        }
    }
}

impl Drop for CpalEngine {
    fn drop(&mut self) {
        let _ = self.stream_tx.send(StreamCommand::Shutdown);
    }
}

impl AudioEngine for CpalEngine {
    fn new_queue(
        &self,
        format: StreamFormat,
        on_complete: CompletionHandler,
    ) -> Result<QueueId, EngineError> {
        let shared = Arc::new(QueueShared {
            format,
            volume_bits: AtomicU32::new(1.0f32.to_bits()),
            generation: AtomicU64::new(0),
            state: Mutex::new(QueuePlayState::default()),
        });

        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = QueueId(inner.next_id);
        inner.queues.insert(
            id,
            QueueEntry {
                shared: shared.clone(),
                buffers: HashMap::new(),
            },
        );
        drop(inner);

        self.registry.lock().unwrap().insert(
            id,
            DeliveryEntry {
                handler: on_complete,
                shared,
            },
        );
        Ok(id)
    }

    fn allocate_buffer(&self, queue: QueueId, size: usize) -> Result<BufferId, EngineError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = BufferId(inner.next_id);
        let entry = inner
            .queues
            .get_mut(&queue)
            .ok_or(EngineError::Call { op: "allocate_buffer", detail: "unknown queue".into() })?;
        entry.buffers.insert(id, size);
        Ok(id)
    }

    fn free_buffer(&self, queue: QueueId, buffer: BufferId) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .queues
            .get_mut(&queue)
            .ok_or(EngineError::Call { op: "free_buffer", detail: "unknown queue".into() })?;
        entry
            .buffers
            .remove(&buffer)
            .map(|_| ())
            .ok_or(EngineError::Call { op: "free_buffer", detail: "unknown buffer".into() })
    }

    fn enqueue_buffer(
        &self,
        queue: QueueId,
        buffer: BufferId,
        data: &[u8],
    ) -> Result<(), EngineError> {
        let shared = {
            let inner = self.inner.lock().unwrap();
            let entry = inner
                .queues
                .get(&queue)
                .ok_or(EngineError::Call { op: "enqueue_buffer", detail: "unknown queue".into() })?;
            let size = entry.buffers.get(&buffer).copied().ok_or(EngineError::Call {
                op: "enqueue_buffer",
                detail: "unknown buffer".into(),
            })?;
            if data.len() != size {
                return Err(EngineError::Call {
                    op: "enqueue_buffer",
                    detail: format!("expected {size} bytes, got {}", data.len()),
                });
            }
            entry.shared.clone()
        };

        shared.state.lock().unwrap().enqueued.push_back(EnqueuedBuffer {
            id: buffer,
            data: data.to_vec(),
            pos: 0,
        });
        Ok(())
    }

    fn prime(&self, queue: QueueId) -> Result<(), EngineError> {
        // Streams are built on start; priming only validates the handle.
        self.shared_for(queue, "prime").map(|_| ())
    }

    fn start(&self, queue: QueueId) -> Result<(), EngineError> {
        let shared = self.shared_for(queue, "start")?;
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.stream_tx
            .send(StreamCommand::Start { queue, shared, reply: reply_tx })
            .map_err(|_| EngineError::Call { op: "start", detail: "stream thread gone".into() })?;
        reply_rx
            .recv()
            .map_err(|_| EngineError::Call { op: "start", detail: "stream thread gone".into() })?
    }

    fn pause(&self, queue: QueueId) -> Result<(), EngineError> {
        self.shared_for(queue, "pause")?;
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.stream_tx
            .send(StreamCommand::Pause { queue, reply: reply_tx })
            .map_err(|_| EngineError::Call { op: "pause", detail: "stream thread gone".into() })?;
        reply_rx
            .recv()
            .map_err(|_| EngineError::Call { op: "pause", detail: "stream thread gone".into() })?
    }

    fn stop(&self, queue: QueueId) -> Result<(), EngineError> {
        let shared = self.shared_for(queue, "stop")?;
        // Invalidate completions already emitted, then tear the stream down
        // and hand in-flight buffers back silently.
        shared.generation.fetch_add(1, Ordering::Relaxed);
        self.drop_stream(queue);
        shared.state.lock().unwrap().enqueued.clear();
        Ok(())
    }

    fn dispose(&self, queue: QueueId) -> Result<(), EngineError> {
        let removed = self.inner.lock().unwrap().queues.remove(&queue);
        let Some(entry) = removed else {
            return Err(EngineError::Call { op: "dispose", detail: "unknown queue".into() });
        };
        entry.shared.generation.fetch_add(1, Ordering::Relaxed);
        self.drop_stream(queue);
        self.registry.lock().unwrap().remove(&queue);
        Ok(())
    }

    fn set_volume(&self, queue: QueueId, volume: f32) -> Result<(), EngineError> {
        let shared = self.shared_for(queue, "set_volume")?;
        shared.volume_bits.store(volume.to_bits(), Ordering::Relaxed);
        Ok(())
    }
}

/// Build a context over a fresh [`CpalEngine`].
pub fn new_cpal_context(
    sample_rate: u32,
    channel_count: u16,
    bytes_per_sample: u16,
    config: DriverConfig,
    device_hint: Option<&str>,
) -> Result<(Context, Receiver<()>)> {
    let engine = Arc::new(CpalEngine::new(device_hint)?);
    Context::new(engine, sample_rate, channel_count, bytes_per_sample, config)
}

/// Owns every CPAL stream; commands come from engine calls on other threads.
fn stream_thread(
    device: cpal::Device,
    commands: Receiver<StreamCommand>,
    completions: Sender<Completion>,
) {
    let mut streams: HashMap<QueueId, cpal::Stream> = HashMap::new();
    while let Ok(command) = commands.recv() {
        match command {
            StreamCommand::Start { queue, shared, reply } => {
                let result = if let Some(stream) = streams.get(&queue) {
                    stream
                        .play()
                        .map_err(|e| EngineError::Call { op: "start", detail: e.to_string() })
                } else {
                    match build_stream(&device, queue, &shared, &completions) {
                        Ok(stream) => {
                            let result = stream.play().map_err(|e| EngineError::Call {
                                op: "start",
                                detail: e.to_string(),
                            });
                            streams.insert(queue, stream);
                            result
                        }
                        Err(err) => Err(err),
                    }
                };
                let _ = reply.send(result);
            }
            StreamCommand::Pause { queue, reply } => {
                // Pausing a queue that never started has no stream yet.
                let result = match streams.get(&queue) {
                    Some(stream) => stream
                        .pause()
                        .map_err(|e| EngineError::Call { op: "pause", detail: e.to_string() }),
                    None => Ok(()),
                };
                let _ = reply.send(result);
            }
            StreamCommand::Drop { queue, reply } => {
                streams.remove(&queue);
                let _ = reply.send(());
            }
            StreamCommand::Shutdown => break,
        }
    }
}

fn build_stream(
    device: &cpal::Device,
    queue: QueueId,
    shared: &Arc<QueueShared>,
    completions: &Sender<Completion>,
) -> Result<cpal::Stream, EngineError> {
    let supported = device
        .default_output_config()
        .map_err(|e| EngineError::Call { op: "start", detail: e.to_string() })?;
    let sample_format = supported.sample_format();
    let mut config: cpal::StreamConfig = supported.into();
    config.sample_rate = shared.format.sample_rate;

    match sample_format {
        cpal::SampleFormat::F32 => build_stream_typed::<f32>(device, &config, queue, shared, completions),
        cpal::SampleFormat::I16 => build_stream_typed::<i16>(device, &config, queue, shared, completions),
        cpal::SampleFormat::I32 => build_stream_typed::<i32>(device, &config, queue, shared, completions),
        cpal::SampleFormat::U16 => build_stream_typed::<u16>(device, &config, queue, shared, completions),
        other => Err(EngineError::Call {
            op: "start",
            detail: format!("unsupported sample format: {other:?}"),
        }),
    }
}

fn build_stream_typed<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: QueueId,
    shared: &Arc<QueueShared>,
    completions: &Sender<Completion>,
) -> Result<cpal::Stream, EngineError>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels_out = config.channels as usize;
    let shared_cb = shared.clone();
    let completions_cb = completions.clone();
    let err_fn = |err| tracing::warn!("stream error: {err}");

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                render_into(&shared_cb, queue, &completions_cb, channels_out, data);
            },
            err_fn,
            None,
        )
        .map_err(|e| EngineError::Call { op: "start", detail: e.to_string() })
}

/// Fill one callback's worth of output from the enqueued buffers, emitting
/// silence past the end and reporting fully consumed buffers.
fn render_into<T>(
    shared: &QueueShared,
    queue: QueueId,
    completions: &Sender<Completion>,
    channels_out: usize,
    data: &mut [T],
) where
    T: cpal::Sample + cpal::FromSample<f32>,
{
    let volume = f32::from_bits(shared.volume_bits.load(Ordering::Relaxed));
    let generation = shared.generation.load(Ordering::Relaxed);
    let mut frame_buf = [0.0f32; 8];
    let src_channels = (shared.format.channel_count as usize).min(frame_buf.len());
    let channels_out = channels_out.max(1);
    let mut finished: Vec<BufferId> = Vec::new();

    {
        let mut st = shared.state.lock().unwrap();
        let frames = data.len() / channels_out;
        for frame in 0..frames {
            let have = next_source_frame(
                &mut st,
                &shared.format,
                &mut frame_buf[..src_channels],
                &mut finished,
            );
            for ch in 0..channels_out {
                let sample = if have {
                    volume * map_channel(&frame_buf[..src_channels], ch, channels_out)
                } else {
                    0.0
                };
                data[frame * channels_out + ch] = T::from_sample(sample);
            }
        }
    }

    // Sends stay outside the state lock; the delivery thread may re-enter
    // the engine from the handler.
    for buffer in finished {
        let _ = completions.send(Completion { queue, buffer, generation });
    }
}

/// Pull one interleaved frame off the front buffer. Consumed buffers are
/// popped and collected into `finished`.
fn next_source_frame(
    st: &mut QueuePlayState,
    format: &StreamFormat,
    out: &mut [f32],
    finished: &mut Vec<BufferId>,
) -> bool {
    let bytes_per_sample = format.bytes_per_sample as usize;
    let frame_bytes = format.bytes_per_frame();
    loop {
        let exhausted = match st.enqueued.front() {
            None => return false,
            Some(front) => front.pos + frame_bytes > front.data.len(),
        };
        if exhausted {
            if let Some(done) = st.enqueued.pop_front() {
                finished.push(done.id);
            }
            continue;
        }
        let Some(front) = st.enqueued.front_mut() else {
            return false;
        };
        for (i, slot) in out.iter_mut().enumerate() {
            let off = front.pos + i * bytes_per_sample;
            *slot = decode_sample(format, &front.data[off..off + bytes_per_sample]);
        }
        front.pos += frame_bytes;
        return true;
    }
}

fn decode_sample(format: &StreamFormat, bytes: &[u8]) -> f32 {
    match format.bytes_per_sample {
        1 => (f32::from(bytes[0]) - 128.0) / 128.0,
        _ => f32::from(i16::from_le_bytes([bytes[0], bytes[1]])) / 32_768.0,
    }
}

/// Channel mapping: mono duplicates, stereo to mono averages, anything else
/// clamps to the available source channels.
fn map_channel(src: &[f32], dst_ch: usize, dst_channels: usize) -> f32 {
    match (src.len(), dst_channels) {
        (0, _) => 0.0,
        (1, _) => src[0],
        (2, 1) => 0.5 * (src[0] + src[1]),
        _ => src[dst_ch.min(src.len() - 1)],
    }
}

fn delivery_thread(
    completions: Receiver<Completion>,
    registry: Arc<Mutex<HashMap<QueueId, DeliveryEntry>>>,
) {
    while let Ok(event) = completions.recv() {
        let entry = {
            let registry = registry.lock().unwrap();
            registry
                .get(&event.queue)
                .map(|e| (e.handler.clone(), e.shared.clone()))
        };
        let Some((handler, shared)) = entry else {
            continue;
        };
        if shared.generation.load(Ordering::Relaxed) != event.generation {
            // Emitted before a stop; the queue flushed its callbacks.
            continue;
        }
        handler(event.queue, event.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MONO16: StreamFormat = StreamFormat {
        sample_rate: 8_000,
        channel_count: 1,
        bytes_per_sample: 2,
    };

    fn state_with(buffers: Vec<(u64, Vec<u8>)>) -> QueuePlayState {
        QueuePlayState {
            enqueued: buffers
                .into_iter()
                .map(|(id, data)| EnqueuedBuffer {
                    id: BufferId(id),
                    data,
                    pos: 0,
                })
                .collect(),
        }
    }

    #[test]
    fn decode_sample_covers_both_depths() {
        assert_eq!(decode_sample(&MONO16, &i16::MAX.to_le_bytes()), 32_767.0 / 32_768.0);
        assert_eq!(decode_sample(&MONO16, &0i16.to_le_bytes()), 0.0);

        let mono8 = StreamFormat { bytes_per_sample: 1, ..MONO16 };
        assert_eq!(decode_sample(&mono8, &[128]), 0.0);
        assert_eq!(decode_sample(&mono8, &[0]), -1.0);
    }

    #[test]
    fn map_channel_handles_common_layouts() {
        assert_eq!(map_channel(&[0.5], 1, 2), 0.5);
        assert_eq!(map_channel(&[0.2, 0.4], 0, 1), 0.3);
        assert_eq!(map_channel(&[0.2, 0.4], 1, 2), 0.4);
        assert_eq!(map_channel(&[], 0, 2), 0.0);
    }

    #[test]
    fn next_source_frame_crosses_buffer_boundaries() {
        let mut st = state_with(vec![
            (1, 1i16.to_le_bytes().to_vec()),
            (2, 2i16.to_le_bytes().to_vec()),
        ]);
        let mut out = [0.0f32; 1];
        let mut finished = Vec::new();

        assert!(next_source_frame(&mut st, &MONO16, &mut out, &mut finished));
        assert!(finished.is_empty());
        assert!(next_source_frame(&mut st, &MONO16, &mut out, &mut finished));
        assert_eq!(finished, vec![BufferId(1)]);
        assert!(!next_source_frame(&mut st, &MONO16, &mut out, &mut finished));
        assert_eq!(finished, vec![BufferId(1), BufferId(2)]);
    }

    #[test]
    fn next_source_frame_reports_silence_when_drained() {
        let mut st = state_with(Vec::new());
        let mut out = [0.0f32; 1];
        let mut finished = Vec::new();
        assert!(!next_source_frame(&mut st, &MONO16, &mut out, &mut finished));
        assert!(finished.is_empty());
    }
}
