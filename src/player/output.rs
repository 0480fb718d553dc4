//! Output sinks fed by the decode thread with interleaved f32 samples.

use crate::errors::Result;
use std::sync::Arc;
use std::time::Duration;

/// Destination for decoded PCM. `write` blocks until the device (or the pacing clock) has room,
/// which is what keeps the decode thread running at playback speed.
pub trait AudioSink: Send {
    fn write(&mut self, samples: &[f32], channels: usize, sample_rate: u32) -> Result<()>;

    fn pause(&mut self) {}

    fn resume(&mut self) {}

    /// Discards anything buffered but not yet heard, e.g. after a seek.
    fn flush(&mut self) {}
}

pub trait SinkFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn AudioSink>>;
}

/// Device-less sink. In real-time mode it sleeps for the duration of every buffer so the
/// decoded position advances like a real device would.
pub struct NullSink {
    realtime: bool,
    frames_written: u64,
}

impl NullSink {
    pub fn new(realtime: bool) -> Self {
        Self {
            realtime,
            frames_written: 0,
        }
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

impl AudioSink for NullSink {
    fn write(&mut self, samples: &[f32], channels: usize, sample_rate: u32) -> Result<()> {
        let frames = (samples.len() / channels.max(1)) as u64;
        self.frames_written += frames;
        if self.realtime && sample_rate > 0 {
            std::thread::sleep(Duration::from_secs_f64(frames as f64 / sample_rate as f64));
        }
        Ok(())
    }
}

pub struct NullSinkFactory {
    pub realtime: bool,
}

impl SinkFactory for NullSinkFactory {
    fn create(&self) -> Result<Box<dyn AudioSink>> {
        Ok(Box::new(NullSink::new(self.realtime)))
    }
}

/// System output device when built with `cpal-output`, paced null output otherwise.
pub fn default_sink_factory() -> Arc<dyn SinkFactory> {
    #[cfg(feature = "cpal-output")]
    {
        Arc::new(cpal_sink::CpalSinkFactory::new(Duration::from_millis(250)))
    }
    #[cfg(not(feature = "cpal-output"))]
    {
        log::info!("🔇 [PLAYER] Built without cpal-output, audio goes to a paced null sink");
        Arc::new(NullSinkFactory { realtime: true })
    }
}

#[cfg(feature = "cpal-output")]
pub mod cpal_sink {
    use super::{AudioSink, SinkFactory};
    use crate::errors::{AppError, Result};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::StreamConfig;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Arc, Mutex};
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    pub struct CpalSinkFactory {
        latency: Duration,
    }

    impl CpalSinkFactory {
        pub fn new(latency: Duration) -> Self {
            Self { latency }
        }
    }

    impl SinkFactory for CpalSinkFactory {
        fn create(&self) -> Result<Box<dyn AudioSink>> {
            Ok(Box::new(CpalSink::new(self.latency)))
        }
    }

    /// Feeds a cpal output stream through a bounded sample queue.
    ///
    /// `cpal::Stream` is not `Send`, so the stream lives on its own thread for as long as the
    /// sink keeps the control channel open.
    pub struct CpalSink {
        queue: Arc<Mutex<VecDeque<f32>>>,
        paused: Arc<AtomicBool>,
        latency: Duration,
        format: Option<(usize, u32)>,
        control: Option<mpsc::Sender<()>>,
        thread: Option<JoinHandle<()>>,
    }

    impl CpalSink {
        pub fn new(latency: Duration) -> Self {
            Self {
                queue: Arc::new(Mutex::new(VecDeque::new())),
                paused: Arc::new(AtomicBool::new(false)),
                latency,
                format: None,
                control: None,
                thread: None,
            }
        }

        fn open_stream(&mut self, channels: usize, sample_rate: u32) -> Result<()> {
            self.close_stream();

            let (control_tx, control_rx) = mpsc::channel::<()>();
            let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
            let queue = Arc::clone(&self.queue);
            let paused = Arc::clone(&self.paused);

            let thread = thread::spawn(move || {
                let built = (|| -> Result<cpal::Stream> {
                    let host = cpal::default_host();
                    let device = host
                        .default_output_device()
                        .ok_or_else(|| AppError::Output("no output device available".to_string()))?;
                    let config = StreamConfig {
                        channels: channels as u16,
                        sample_rate: cpal::SampleRate(sample_rate),
                        buffer_size: cpal::BufferSize::Default,
                    };
                    let stream = device
                        .build_output_stream(
                            &config,
                            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                                let mut queue = match queue.lock() {
                                    Ok(queue) => queue,
                                    Err(poisoned) => poisoned.into_inner(),
                                };
                                let silent = paused.load(Ordering::Relaxed);
                                for sample in data.iter_mut() {
                                    *sample = if silent { 0.0 } else { queue.pop_front().unwrap_or(0.0) };
                                }
                            },
                            |err| log::error!("🔊 [PLAYER] Output stream error: {}", err),
                            None,
                        )
                        .map_err(|e| AppError::Output(e.to_string()))?;
                    stream.play().map_err(|e| AppError::Output(e.to_string()))?;
                    Ok(stream)
                })();

                match built {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        // Blocks until the sink drops its sender.
                        let _ = control_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            });

            ready_rx
                .recv()
                .map_err(|_| AppError::Output("output thread exited during setup".to_string()))??;
            log::info!("🔊 [PLAYER] Output stream open: {} ch @ {} Hz", channels, sample_rate);
            self.control = Some(control_tx);
            self.thread = Some(thread);
            self.format = Some((channels, sample_rate));
            Ok(())
        }

        fn close_stream(&mut self) {
            self.control = None;
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
            self.format = None;
        }
    }

    impl AudioSink for CpalSink {
        fn write(&mut self, samples: &[f32], channels: usize, sample_rate: u32) -> Result<()> {
            if self.format != Some((channels, sample_rate)) {
                self.open_stream(channels, sample_rate)?;
            }
            let max_buffered = (self.latency.as_secs_f64() * sample_rate as f64) as usize * channels;

            let mut remaining = samples;
            while !remaining.is_empty() {
                let accepted = {
                    let mut queue = match self.queue.lock() {
                        Ok(queue) => queue,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    let room = max_buffered.saturating_sub(queue.len()).min(remaining.len());
                    queue.extend(remaining[..room].iter().copied());
                    room
                };
                remaining = &remaining[accepted..];
                if !remaining.is_empty() {
                    thread::sleep(Duration::from_millis(5));
                }
            }
            Ok(())
        }

        fn pause(&mut self) {
            self.paused.store(true, Ordering::Relaxed);
        }

        fn resume(&mut self) {
            self.paused.store(false, Ordering::Relaxed);
        }

        fn flush(&mut self) {
            if let Ok(mut queue) = self.queue.lock() {
                queue.clear();
            }
        }
    }

    impl Drop for CpalSink {
        fn drop(&mut self) {
            self.close_stream();
        }
    }
}
