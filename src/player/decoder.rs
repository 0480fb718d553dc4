//! Symphonia-backed playback: probe on open, then decode on a dedicated thread that writes to an
//! [`AudioSink`] and publishes the decoded position.

use super::output::{AudioSink, SinkFactory};
use super::resample::StreamResampler;
use super::{AudioBackend, Playback};
use crate::errors::{AppError, Result};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::{Time, TimeBase};

pub struct SymphoniaBackend {
    sinks: Arc<dyn SinkFactory>,
    sample_rate: u32,
    buffer_frames: usize,
}

impl SymphoniaBackend {
    /// Output is always delivered at `sample_rate`; tracks at other rates are resampled.
    pub fn new(sinks: Arc<dyn SinkFactory>, sample_rate: u32, buffer_frames: usize) -> Self {
        Self {
            sinks,
            sample_rate: sample_rate.max(1),
            buffer_frames: buffer_frames.max(64),
        }
    }
}

impl AudioBackend for SymphoniaBackend {
    fn open(&self, path: &Path, volume: f32) -> Result<Box<dyn Playback>> {
        let file = std::fs::File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        // Cached payloads carry no extension; let the probe sniff them.
        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            if crate::utils::is_audio_extension(ext) {
                hint.with_extension(ext);
            }
        }

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| AppError::Decode(format!("{}: {}", path.display(), e)))?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| AppError::Decode(format!("{}: no audio track", path.display())))?;

        let track_id = track.id;
        let sample_rate = track.codec_params.sample_rate;
        let clock = TrackClock {
            time_base: track.codec_params.time_base,
            sample_rate,
        };
        let duration_ms = track.codec_params.n_frames.map(|frames| match sample_rate {
            Some(rate) if rate > 0 => frames * 1000 / rate as u64,
            _ => clock.ts_to_ms(frames),
        });

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| AppError::Decode(format!("{}: {}", path.display(), e)))?;

        let sink = self.sinks.create()?;
        let shared = Arc::new(Shared {
            control: Mutex::new(Control {
                playing: false,
                seek: None,
                volume: volume.clamp(0.0, 1.0),
                stop: false,
            }),
            wake: Condvar::new(),
            position_ms: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            error: Mutex::new(None),
        });

        let worker = DecodeThread {
            format,
            decoder,
            track_id,
            clock,
            output_rate: self.sample_rate,
            resampler: None,
            buffer_frames: self.buffer_frames,
            sink,
            shared: Arc::clone(&shared),
        };
        let thread = thread::Builder::new()
            .name("termtunes-decode".to_string())
            .spawn(move || worker.run())?;

        log::info!(
            "🎵 [PLAYER] Opened {:?} ({} Hz, {} ms)",
            path,
            sample_rate.unwrap_or(0),
            duration_ms.unwrap_or(0)
        );

        Ok(Box::new(SymphoniaPlayback {
            shared,
            duration_ms,
            thread: Some(thread),
        }))
    }
}

#[derive(Clone, Copy)]
struct TrackClock {
    time_base: Option<TimeBase>,
    sample_rate: Option<u32>,
}

impl TrackClock {
    fn ts_to_ms(&self, ts: u64) -> u64 {
        match (self.time_base, self.sample_rate) {
            (Some(tb), _) => time_to_ms(tb.calc_time(ts)),
            (None, Some(rate)) if rate > 0 => ts * 1000 / rate as u64,
            _ => 0,
        }
    }
}

fn time_to_ms(time: Time) -> u64 {
    time.seconds * 1000 + (time.frac * 1000.0).round() as u64
}

fn ms_to_time(ms: u64) -> Time {
    Time::new(ms / 1000, (ms % 1000) as f64 / 1000.0)
}

struct Control {
    playing: bool,
    seek: Option<u64>,
    volume: f32,
    stop: bool,
}

struct Shared {
    control: Mutex<Control>,
    wake: Condvar,
    position_ms: AtomicU64,
    finished: AtomicBool,
    error: Mutex<Option<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct DecodeThread {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    clock: TrackClock,
    output_rate: u32,
    resampler: Option<StreamResampler>,
    buffer_frames: usize,
    sink: Box<dyn AudioSink>,
    shared: Arc<Shared>,
}

impl DecodeThread {
    fn run(mut self) {
        let mut applied_volume = lock(&self.shared.control).volume;
        let mut sink_paused = false;
        let mut ended = false;
        let mut samples: Option<SampleBuffer<f32>> = None;

        loop {
            let (volume, seek) = {
                let mut control = lock(&self.shared.control);
                while !control.stop && control.seek.is_none() && (!control.playing || ended) {
                    if !sink_paused {
                        self.sink.pause();
                        sink_paused = true;
                    }
                    control = match self.shared.wake.wait(control) {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
                if control.stop {
                    break;
                }
                (control.volume, control.seek.take())
            };

            if let Some(target) = seek {
                self.sink.flush();
                let seek_to = SeekTo::Time {
                    time: ms_to_time(target),
                    track_id: Some(self.track_id),
                };
                match self.format.seek(SeekMode::Accurate, seek_to) {
                    Ok(seeked) => {
                        self.decoder.reset();
                        if let Some(resampler) = self.resampler.as_mut() {
                            resampler.reset();
                        }
                        ended = false;
                        self.shared.finished.store(false, Ordering::SeqCst);
                        self.shared
                            .position_ms
                            .store(self.clock.ts_to_ms(seeked.actual_ts), Ordering::SeqCst);
                    }
                    Err(e) => log::warn!("⚠️ [PLAYER] Seek to {} ms failed: {}", target, e),
                }
                continue;
            }

            if sink_paused {
                self.sink.resume();
                sink_paused = false;
            }

            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    log::debug!("🎵 [PLAYER] End of stream");
                    if let Err(e) = self.drain_resampler() {
                        self.fail(format!("output: {}", e));
                        break;
                    }
                    ended = true;
                    self.shared.finished.store(true, Ordering::SeqCst);
                    continue;
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    continue;
                }
                Err(e) => {
                    self.fail(format!("reading packet: {}", e));
                    break;
                }
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(e)) => {
                    log::warn!("⚠️ [PLAYER] Skipping undecodable packet: {}", e);
                    continue;
                }
                Err(e) => {
                    self.fail(format!("decoding: {}", e));
                    break;
                }
            };

            let spec = *decoded.spec();
            let channels = spec.channels.count().max(1);
            let needed = decoded.capacity() as u64;
            let fits = samples
                .as_ref()
                .map(|buffer| buffer.capacity() as u64 >= needed * channels as u64)
                .unwrap_or(false);
            if !fits {
                samples = Some(SampleBuffer::<f32>::new(needed, spec));
            }
            let buffer = match samples.as_mut() {
                Some(buffer) => buffer,
                None => continue,
            };
            buffer.copy_interleaved_ref(decoded);

            let mut pcm = buffer.samples().to_vec();
            apply_volume_ramp(&mut pcm, channels, applied_volume, volume);
            applied_volume = volume;

            if let Err(e) = self.output(&pcm, channels, spec.rate) {
                self.fail(format!("output: {}", e));
                return;
            }

            // A seek requested during the write wins over this packet's position.
            let end_ts = packet.ts() + packet.dur();
            let control = lock(&self.shared.control);
            if control.seek.is_none() {
                self.shared
                    .position_ms
                    .store(self.clock.ts_to_ms(end_ts), Ordering::SeqCst);
            }
        }
    }

    /// Converts to the output rate when needed and writes in `buffer_frames` chunks.
    fn output(&mut self, pcm: &[f32], channels: usize, rate: u32) -> Result<()> {
        if rate == self.output_rate {
            return self.write(pcm, channels);
        }
        let stale = self
            .resampler
            .as_ref()
            .map(|r| !r.matches(rate, channels))
            .unwrap_or(true);
        if stale {
            self.drain_resampler()?;
            self.resampler = Some(StreamResampler::new(rate, self.output_rate, channels)?);
        }
        let converted = match self.resampler.as_mut() {
            Some(resampler) => resampler.push(pcm)?,
            None => return Ok(()),
        };
        self.write(&converted, channels)
    }

    fn drain_resampler(&mut self) -> Result<()> {
        let (tail, channels) = match self.resampler.as_mut() {
            Some(resampler) => (resampler.flush()?, resampler.channels()),
            None => return Ok(()),
        };
        self.write(&tail, channels)
    }

    fn write(&mut self, pcm: &[f32], channels: usize) -> Result<()> {
        for chunk in pcm.chunks(self.buffer_frames * channels) {
            self.sink.write(chunk, channels, self.output_rate)?;
        }
        Ok(())
    }

    fn fail(&self, message: String) {
        log::error!("❌ [PLAYER] Decode thread stopped: {}", message);
        *lock(&self.shared.error) = Some(message);
    }
}

/// Linear gain ramp across one buffer so volume steps never click.
pub fn apply_volume_ramp(samples: &mut [f32], channels: usize, from: f32, to: f32) {
    let channels = channels.max(1);
    let frames = samples.len() / channels;
    if frames == 0 {
        return;
    }
    if (from - to).abs() < f32::EPSILON {
        if (to - 1.0).abs() >= f32::EPSILON {
            samples.iter_mut().for_each(|s| *s *= to);
        }
        return;
    }
    for (i, frame) in samples.chunks_mut(channels).enumerate() {
        let gain = from + (to - from) * (i + 1) as f32 / frames as f32;
        frame.iter_mut().for_each(|s| *s *= gain);
    }
}

pub struct SymphoniaPlayback {
    shared: Arc<Shared>,
    duration_ms: Option<u64>,
    thread: Option<JoinHandle<()>>,
}

impl SymphoniaPlayback {
    fn update<F: FnOnce(&mut Control)>(&self, f: F) {
        let mut control = lock(&self.shared.control);
        f(&mut control);
        self.shared.wake.notify_all();
    }
}

impl Playback for SymphoniaPlayback {
    fn duration_ms(&self) -> Option<u64> {
        self.duration_ms
    }

    fn position_ms(&self) -> u64 {
        self.shared.position_ms.load(Ordering::SeqCst)
    }

    fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::SeqCst)
    }

    fn error(&self) -> Option<String> {
        lock(&self.shared.error).clone()
    }

    fn play(&mut self) {
        self.update(|c| c.playing = true);
    }

    fn pause(&mut self) {
        self.update(|c| c.playing = false);
    }

    fn seek(&mut self, position_ms: u64) -> Result<u64> {
        let target = match self.duration_ms {
            Some(duration) => position_ms.min(duration),
            None => position_ms,
        };
        self.shared.position_ms.store(target, Ordering::SeqCst);
        self.update(|c| c.seek = Some(target));
        Ok(target)
    }

    fn set_volume(&mut self, volume: f32) {
        self.update(|c| c.volume = volume.clamp(0.0, 1.0));
    }
}

impl Drop for SymphoniaPlayback {
    fn drop(&mut self) {
        self.update(|c| c.stop = true);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::player::output::NullSinkFactory;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    /// Writes a mono 16-bit PCM WAV file of `millis` length.
    pub(crate) fn write_test_wav(path: &Path, sample_rate: u32, millis: u32) {
        let frames = sample_rate * millis / 1000;
        let data_len = frames * 2;
        let mut bytes = Vec::with_capacity(44 + data_len as usize);
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
        bytes.extend_from_slice(b"WAVEfmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&sample_rate.to_le_bytes());
        bytes.extend_from_slice(&(sample_rate * 2).to_le_bytes());
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        for i in 0..frames {
            let sample = if (i / 20) % 2 == 0 { 8000i16 } else { -8000i16 };
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        std::fs::write(path, bytes).unwrap();
    }

    fn backend(realtime: bool) -> SymphoniaBackend {
        SymphoniaBackend::new(Arc::new(NullSinkFactory { realtime }), 8000, 1024)
    }

    fn wait_until(mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn probes_duration_from_cached_file_without_extension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("track.audio");
        write_test_wav(&path, 8000, 500);

        let playback = backend(false).open(&path, 1.0).unwrap();
        assert_eq!(playback.duration_ms(), Some(500));
        assert_eq!(playback.position_ms(), 0);
        assert!(!playback.is_finished());
    }

    #[test]
    fn decodes_to_the_end() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.wav");
        write_test_wav(&path, 8000, 300);

        let mut playback = backend(false).open(&path, 0.5).unwrap();
        playback.play();
        assert!(wait_until(|| playback.is_finished()));
        assert_eq!(playback.position_ms(), 300);
        assert!(playback.error().is_none());
    }

    #[test]
    fn paused_playback_does_not_advance() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.wav");
        write_test_wav(&path, 8000, 2000);

        let mut playback = backend(true).open(&path, 1.0).unwrap();
        playback.play();
        assert!(wait_until(|| playback.position_ms() > 0));
        playback.pause();
        thread::sleep(Duration::from_millis(200));
        let held = playback.position_ms();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(playback.position_ms(), held);
    }

    #[test]
    fn seek_clamps_to_duration() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.wav");
        write_test_wav(&path, 8000, 400);

        let mut playback = backend(false).open(&path, 1.0).unwrap();
        assert_eq!(playback.seek(10_000).unwrap(), 400);
        assert_eq!(playback.seek(100).unwrap(), 100);
        assert!(wait_until(|| playback.position_ms() <= 100));
    }

    /// Records the rate and frame count of everything written.
    #[derive(Clone, Default)]
    struct RecordingSink {
        writes: Arc<Mutex<Vec<(u32, usize)>>>,
    }

    impl AudioSink for RecordingSink {
        fn write(&mut self, samples: &[f32], channels: usize, sample_rate: u32) -> Result<()> {
            lock(&*self.writes).push((sample_rate, samples.len() / channels));
            Ok(())
        }
    }

    impl SinkFactory for RecordingSink {
        fn create(&self) -> Result<Box<dyn AudioSink>> {
            Ok(Box::new(self.clone()))
        }
    }

    #[test]
    fn output_is_resampled_to_the_configured_rate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.wav");
        write_test_wav(&path, 8000, 500);

        let sink = RecordingSink::default();
        let backend = SymphoniaBackend::new(Arc::new(sink.clone()), 16000, 1024);
        let mut playback = backend.open(&path, 1.0).unwrap();
        playback.play();
        assert!(wait_until(|| playback.is_finished()));
        assert_eq!(playback.position_ms(), 500);

        let writes = lock(&*sink.writes).clone();
        assert!(writes.iter().all(|(rate, _)| *rate == 16000));
        let frames: usize = writes.iter().map(|(_, frames)| frames).sum();
        // 4000 source frames, doubled, give or take the final padded chunk
        assert!((7_000..=10_500).contains(&frames), "got {} frames", frames);
    }

    #[test]
    fn matching_rate_is_passed_through() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.wav");
        write_test_wav(&path, 8000, 250);

        let sink = RecordingSink::default();
        let backend = SymphoniaBackend::new(Arc::new(sink.clone()), 8000, 1024);
        let mut playback = backend.open(&path, 1.0).unwrap();
        playback.play();
        assert!(wait_until(|| playback.is_finished()));

        let frames: usize = lock(&*sink.writes).iter().map(|(_, frames)| frames).sum();
        assert_eq!(frames, 2000);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk.audio");
        std::fs::write(&path, vec![0x42u8; 4096]).unwrap();
        assert!(matches!(backend(false).open(&path, 1.0), Err(AppError::Decode(_))));
    }

    #[test]
    fn volume_ramp_is_monotonic() {
        let mut samples = vec![1.0f32; 8];
        apply_volume_ramp(&mut samples, 2, 0.0, 1.0);
        assert!(samples.windows(2).all(|w| w[0] <= w[1]));
        assert!((samples[7] - 1.0).abs() < 1e-6);

        let mut flat = vec![1.0f32; 4];
        apply_volume_ramp(&mut flat, 1, 0.5, 0.5);
        assert!(flat.iter().all(|s| (*s - 0.5).abs() < 1e-6));
    }
}
