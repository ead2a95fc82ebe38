//! Audio codec I/O: PCM16 byte parsing, WAV read/write, and the scoped
//! scratch artifact the realtime path hands to the transcriber.
//!
//! All failures here are `AudioIo` errors; malformed input is a caller
//! problem, not a server fault.

use crate::error::{AppError, AppResult};
use byteorder::{LittleEndian, ReadBytesExt};
use std::fs::File;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

/// Parse raw little-endian 16-bit PCM bytes into samples.
///
/// WebSocket binary frames arrive in this shape. Odd-length payloads mean a
/// sample was torn in half somewhere and are rejected.
pub fn parse_pcm16(data: &[u8]) -> AppResult<Vec<i16>> {
    if data.is_empty() {
        return Err(AppError::AudioIo("audio payload is empty".to_string()));
    }
    if data.len() % 2 != 0 {
        return Err(AppError::AudioIo(format!(
            "PCM16 payload length {} is not a multiple of 2",
            data.len()
        )));
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

/// Scale 16-bit PCM into the [-1.0, 1.0] float range ML models expect.
pub fn pcm_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Scale floats back to 16-bit PCM, clamping out-of-range values.
pub fn float_to_pcm(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s * 32768.0).clamp(-32768.0, 32767.0) as i16)
        .collect()
}

/// Write mono float samples to a 16-bit PCM WAV file.
pub fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> AppResult<()> {
    let header = wav::Header::new(wav::WAV_FORMAT_PCM, 1, sample_rate, 16);
    let track = wav::BitDepth::Sixteen(float_to_pcm(samples));

    let mut file = File::create(path)
        .map_err(|e| AppError::AudioIo(format!("cannot create {}: {}", path.display(), e)))?;
    wav::write(header, &track, &mut file)
        .map_err(|e| AppError::AudioIo(format!("cannot write {}: {}", path.display(), e)))?;
    Ok(())
}

/// Read a WAV file into normalized mono float samples plus its sample rate.
///
/// Multi-channel audio is averaged down to mono. All the bit depths the
/// `wav` crate knows are accepted; no resampling happens here.
pub fn read_wav(path: &Path) -> AppResult<(Vec<f32>, u32)> {
    let mut file = File::open(path)
        .map_err(|e| AppError::AudioIo(format!("cannot open {}: {}", path.display(), e)))?;
    decode_wav(&mut file, &path.display().to_string())
}

/// Decode an in-memory WAV payload, as received from a multipart upload.
pub fn parse_wav(bytes: &[u8]) -> AppResult<(Vec<f32>, u32)> {
    if bytes.is_empty() {
        return Err(AppError::AudioIo("uploaded audio is empty".to_string()));
    }
    let mut cursor = Cursor::new(bytes);
    decode_wav(&mut cursor, "uploaded audio")
}

fn decode_wav<R>(reader: &mut R, source: &str) -> AppResult<(Vec<f32>, u32)>
where
    R: std::io::Read + std::io::Seek,
{
    let (header, data) = wav::read(reader)
        .map_err(|e| AppError::AudioIo(format!("cannot parse {}: {}", source, e)))?;

    let interleaved: Vec<f32> = match data {
        wav::BitDepth::Eight(v) => v.iter().map(|&s| (s as f32 - 128.0) / 128.0).collect(),
        wav::BitDepth::Sixteen(v) => v.iter().map(|&s| s as f32 / 32768.0).collect(),
        wav::BitDepth::TwentyFour(v) => v.iter().map(|&s| s as f32 / 8_388_608.0).collect(),
        wav::BitDepth::ThirtyTwoFloat(v) => v,
        wav::BitDepth::Empty => {
            return Err(AppError::AudioIo(format!(
                "{} contains no audio data",
                source
            )))
        }
    };

    let channels = header.channel_count.max(1) as usize;
    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };

    Ok((samples, header.sampling_rate))
}

/// A WAV file that deletes itself when dropped.
///
/// Each flushed realtime segment is materialized as one of these, handed to
/// the transcriber by path, and removed whether or not transcription
/// succeeded.
pub struct TempArtifact {
    path: PathBuf,
}

impl TempArtifact {
    pub fn create(scratch_dir: &Path, samples: &[f32], sample_rate: u32) -> AppResult<Self> {
        let path = scratch_dir.join(format!("rt_{}.wav", Uuid::new_v4()));
        write_wav(&path, samples, sample_rate)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempArtifact {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove scratch artifact {}: {}", self.path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{}_{}.wav", name, Uuid::new_v4()))
    }

    #[test]
    fn test_parse_pcm16_little_endian() {
        let data = [0x34u8, 0x12, 0xFF, 0xFF];
        let samples = parse_pcm16(&data).unwrap();
        assert_eq!(samples, vec![0x1234, -1]);
    }

    #[test]
    fn test_parse_pcm16_rejects_odd_length() {
        let result = parse_pcm16(&[0u8; 15]);
        assert!(matches!(result, Err(AppError::AudioIo(_))));
    }

    #[test]
    fn test_parse_pcm16_rejects_empty() {
        assert!(matches!(parse_pcm16(&[]), Err(AppError::AudioIo(_))));
    }

    #[test]
    fn test_float_pcm_round_trip() {
        let pcm = vec![0i16, 16384, -16384, 32767, -32768];
        let floats = pcm_to_float(&pcm);
        let back = float_to_pcm(&floats);
        for (original, converted) in pcm.iter().zip(back.iter()) {
            assert!((original - converted).abs() <= 1);
        }
    }

    #[test]
    fn test_float_to_pcm_clamps() {
        let out = float_to_pcm(&[2.0, -2.0]);
        assert_eq!(out, vec![32767, -32768]);
    }

    #[test]
    fn test_wav_round_trip() {
        let path = scratch_path("round_trip");
        let samples: Vec<f32> = (0..1600)
            .map(|i| (i as f32 * 0.05).sin() * 0.5)
            .collect();

        write_wav(&path, &samples, 16000).unwrap();
        let (read_back, rate) = read_wav(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(rate, 16000);
        assert_eq!(read_back.len(), samples.len());
        for (a, b) in samples.iter().zip(read_back.iter()) {
            assert!((a - b).abs() < 0.001);
        }
    }

    #[test]
    fn test_read_wav_missing_file() {
        let result = read_wav(Path::new("/nonexistent/audio.wav"));
        assert!(matches!(result, Err(AppError::AudioIo(_))));
    }

    #[test]
    fn test_parse_wav_from_bytes() {
        let path = scratch_path("parse_bytes");
        let samples: Vec<f32> = (0..800).map(|i| (i as f32 * 0.1).sin() * 0.25).collect();
        write_wav(&path, &samples, 16000).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        let (decoded, rate) = parse_wav(&bytes).unwrap();
        assert_eq!(rate, 16000);
        assert_eq!(decoded.len(), samples.len());
    }

    #[test]
    fn test_parse_wav_rejects_garbage() {
        assert!(matches!(parse_wav(&[]), Err(AppError::AudioIo(_))));
        assert!(matches!(
            parse_wav(b"definitely not a wav file"),
            Err(AppError::AudioIo(_))
        ));
    }

    #[test]
    fn test_temp_artifact_removed_on_drop() {
        let dir = std::env::temp_dir();
        let samples = vec![0.1f32; 480];

        let path = {
            let artifact = TempArtifact::create(&dir, &samples, 16000).unwrap();
            let path = artifact.path().to_path_buf();
            assert!(path.exists());
            path
        };

        assert!(!path.exists());
    }
}
