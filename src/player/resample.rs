//! Streaming sample-rate conversion from a track's native rate to the configured output rate.

use crate::errors::{AppError, Result};
use rubato::{FastFixedIn, PolynomialDegree, Resampler};

const CHUNK_FRAMES: usize = 1024;

/// Feeds arbitrarily sized interleaved buffers through a fixed-chunk rubato resampler, keeping the
/// remainder between calls.
pub struct StreamResampler {
    inner: FastFixedIn<f32>,
    channels: usize,
    pending: Vec<Vec<f32>>,
    input_rate: u32,
}

impl StreamResampler {
    pub fn new(input_rate: u32, output_rate: u32, channels: usize) -> Result<Self> {
        let channels = channels.max(1);
        let inner = FastFixedIn::<f32>::new(
            output_rate as f64 / input_rate as f64,
            1.0,
            PolynomialDegree::Cubic,
            CHUNK_FRAMES,
            channels,
        )
        .map_err(|e| AppError::Output(format!("creating resampler {} -> {} Hz: {}", input_rate, output_rate, e)))?;
        log::debug!("🎚️ [PLAYER] Resampling {} Hz -> {} Hz ({} ch)", input_rate, output_rate, channels);
        Ok(Self {
            inner,
            channels,
            pending: vec![Vec::new(); channels],
            input_rate,
        })
    }

    /// Whether this resampler was built for the given stream shape.
    pub fn matches(&self, input_rate: u32, channels: usize) -> bool {
        self.input_rate == input_rate && self.channels == channels.max(1)
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Converts as many whole chunks as are buffered and returns them interleaved.
    pub fn push(&mut self, interleaved: &[f32]) -> Result<Vec<f32>> {
        for frame in interleaved.chunks(self.channels) {
            for (channel, sample) in frame.iter().enumerate() {
                self.pending[channel].push(*sample);
            }
        }

        let mut out = Vec::new();
        loop {
            let needed = self.inner.input_frames_next();
            if self.pending[0].len() < needed {
                break;
            }
            let chunk: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|channel| channel.drain(..needed).collect())
                .collect();
            let converted = self
                .inner
                .process(chunk.as_slice(), None)
                .map_err(|e| AppError::Output(format!("resampling: {}", e)))?;
            interleave_into(&converted, &mut out);
        }
        Ok(out)
    }

    /// Converts whatever is still buffered, e.g. at the end of the track.
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        let mut out = Vec::new();
        if self.pending[0].is_empty() {
            return Ok(out);
        }
        let rest: Vec<Vec<f32>> = self.pending.iter_mut().map(std::mem::take).collect();
        let converted = self
            .inner
            .process_partial(Some(rest.as_slice()), None)
            .map_err(|e| AppError::Output(format!("resampling: {}", e)))?;
        interleave_into(&converted, &mut out);
        Ok(out)
    }

    /// Drops buffered input and filter state after a seek.
    pub fn reset(&mut self) {
        self.inner.reset();
        self.pending.iter_mut().for_each(Vec::clear);
    }
}

fn interleave_into(planar: &[Vec<f32>], out: &mut Vec<f32>) {
    let frames = planar.first().map(Vec::len).unwrap_or(0);
    out.reserve(frames * planar.len());
    for i in 0..frames {
        for channel in planar {
            out.push(channel[i]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubling_the_rate_doubles_the_frames() {
        let mut resampler = StreamResampler::new(8000, 16000, 2).unwrap();
        let input = vec![0.25f32; 8000 * 2];
        let mut frames = resampler.push(&input).unwrap().len() / 2;
        frames += resampler.flush().unwrap().len() / 2;
        assert!((15_000..=17_000).contains(&frames), "got {} frames", frames);
    }

    #[test]
    fn small_buffers_are_held_until_a_chunk_is_full() {
        let mut resampler = StreamResampler::new(44100, 48000, 1).unwrap();
        assert!(resampler.push(&[0.1; 100]).unwrap().is_empty());
        assert!(!resampler.flush().unwrap().is_empty());
        assert!(resampler.flush().unwrap().is_empty());
    }

    #[test]
    fn reset_discards_pending_input() {
        let mut resampler = StreamResampler::new(22050, 44100, 1).unwrap();
        resampler.push(&[0.1; 100]).unwrap();
        resampler.reset();
        assert!(resampler.flush().unwrap().is_empty());
        assert!(resampler.matches(22050, 1));
        assert!(!resampler.matches(22050, 2));
    }
}
