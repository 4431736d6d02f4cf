//! Byte sources in the driver's interleaved PCM format.
//!
//! Players consume any `std::io::Read`; these generators cover the CLI tone
//! commands and make driver tests independent of decoded media.

use std::io::{self, Read};

use crate::engine::StreamFormat;

/// Endless sine tone, rendered on demand in the context's PCM format.
///
/// Emits every channel at the same level. Finite playback comes from the
/// standard `Read::take` adapter.
pub struct SineWave {
    format: StreamFormat,
    freq: f32,
    amplitude: f32,
    /// Absolute byte position in the interleaved stream.
    pos: u64,
}

impl SineWave {
    pub fn new(format: StreamFormat, freq: f32) -> Self {
        Self::with_amplitude(format, freq, 0.3)
    }

    /// `amplitude` is a linear gain in `0.0..=1.0` applied at generation
    /// time, independent of the player volume.
    pub fn with_amplitude(format: StreamFormat, freq: f32, amplitude: f32) -> Self {
        Self {
            format,
            freq,
            amplitude: amplitude.clamp(0.0, 1.0),
            pos: 0,
        }
    }

    fn next_byte(&mut self) -> u8 {
        let bytes_per_sample = u64::from(self.format.bytes_per_sample);
        let frame_bytes = self.format.bytes_per_frame() as u64;
        let frame = self.pos / frame_bytes;
        let byte_in_sample = (self.pos % frame_bytes) % bytes_per_sample;
        self.pos += 1;

        // Phase folded to one second keeps the argument small on long runs.
        let rate = self.format.sample_rate;
        let t = (frame % u64::from(rate)) as f32 / rate as f32;
        let value = (t * self.freq * std::f32::consts::TAU).sin() * self.amplitude;

        match self.format.bytes_per_sample {
            1 => ((value * 127.0) as i16 + 128) as u8,
            _ => {
                let sample = (value * 32_767.0) as i16;
                sample.to_le_bytes()[byte_in_sample as usize]
            }
        }
    }
}

impl Read for SineWave {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        for byte in buf.iter_mut() {
            *byte = self.next_byte();
        }
        Ok(buf.len())
    }
}

/// A fixed amount of silence in the given format.
pub struct Silence {
    remaining: usize,
    mid: u8,
}

impl Silence {
    pub fn new(format: StreamFormat, bytes: usize) -> Self {
        Self {
            remaining: bytes,
            // Unsigned 8-bit silence sits at the midpoint, not at zero.
            mid: if format.bytes_per_sample == 1 { 128 } else { 0 },
        }
    }
}

impl Read for Silence {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.remaining.min(buf.len());
        buf[..n].fill(self.mid);
        self.remaining -= n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEREO16: StreamFormat = StreamFormat {
        sample_rate: 8_000,
        channel_count: 2,
        bytes_per_sample: 2,
    };

    #[test]
    fn sine_wave_never_signals_end_of_stream() {
        let mut src = SineWave::new(STEREO16, 440.0);
        let mut buf = [0u8; 64];
        for _ in 0..8 {
            assert_eq!(src.read(&mut buf).unwrap(), 64);
        }
    }

    #[test]
    fn sine_wave_channels_carry_the_same_sample() {
        let mut src = SineWave::new(STEREO16, 440.0);
        let mut buf = [0u8; 16];
        src.read(&mut buf).unwrap();
        for frame in buf.chunks_exact(4) {
            assert_eq!(frame[..2], frame[2..]);
        }
    }

    #[test]
    fn sine_wave_take_bounds_playback() {
        let src = SineWave::new(STEREO16, 440.0);
        let mut bounded = src.take(10);
        let mut out = Vec::new();
        bounded.read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), 10);
    }

    #[test]
    fn silence_drains_then_ends() {
        let mut src = Silence::new(STEREO16, 6);
        let mut buf = [1u8; 4];
        assert_eq!(src.read(&mut buf).unwrap(), 4);
        assert_eq!(buf, [0u8; 4]);
        assert_eq!(src.read(&mut buf).unwrap(), 2);
        assert_eq!(src.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn unsigned_silence_sits_at_the_midpoint() {
        let mono8 = StreamFormat {
            sample_rate: 8_000,
            channel_count: 1,
            bytes_per_sample: 1,
        };
        let mut src = Silence::new(mono8, 2);
        let mut buf = [0u8; 2];
        src.read(&mut buf).unwrap();
        assert_eq!(buf, [128, 128]);
    }
}
