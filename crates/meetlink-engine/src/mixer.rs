//! # Audio Mixer
//!
//! Sums the decoded audio of every remote subscriber into one output with
//! per-source gain and a master gain. Each source is a lock-free SPSC ring
//! (`rtrb`) written by its subscriber; the mixing graph itself sits behind a
//! mutex so sources can be added, removed and re-weighted from any task.
//!
//! Output is pull-based: the audio sink calls [`AudioMixer::output`] for each
//! period. The number of frames pulled so far is the shared playback clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::util::lock_or_recover;

/// Ring capacity per source, in seconds of audio.
const SOURCE_BUFFER_SECS: usize = 1;

struct Source {
    consumer: rtrb::Consumer<f32>,
    volume: f32,
    /// Frames consumed by the graph.
    played: Arc<AtomicU64>,
}

struct MixerGraph {
    sample_rate: u32,
    channels: u16,
    master: f32,
    sources: HashMap<String, Source>,
    frames_out: u64,
}

/// One mixed period.
#[derive(Debug, Clone, PartialEq)]
pub struct MixerOutput {
    /// Interleaved samples, `frames * channels` long.
    pub samples: Vec<f32>,
    /// Playback clock after this period.
    pub clock_us: u64,
}

/// Shared mixing graph. Cheap to clone.
#[derive(Clone)]
pub struct AudioMixer {
    graph: Arc<Mutex<MixerGraph>>,
}

/// Writing end of one mixer source, owned by its subscriber.
pub struct AudioSourceHandle {
    id: String,
    producer: rtrb::Producer<f32>,
    played: Arc<AtomicU64>,
    sample_rate: u32,
    pub overflowed: u64,
}

impl AudioSourceHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue interleaved samples; samples that do not fit are dropped.
    pub fn push(&mut self, samples: &[f32]) -> usize {
        let mut written = 0;
        for &sample in samples {
            if self.producer.push(sample).is_err() {
                break;
            }
            written += 1;
        }
        let dropped = samples.len() - written;
        if dropped > 0 {
            self.overflowed += dropped as u64;
            tracing::debug!(source = %self.id, dropped, "mixer source full");
        }
        written
    }

    /// Media time played out of this source.
    pub fn played_us(&self) -> u64 {
        let frames = self.played.load(Ordering::Acquire);
        frames.saturating_mul(1_000_000) / self.sample_rate.max(1) as u64
    }
}

impl AudioMixer {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        AudioMixer {
            graph: Arc::new(Mutex::new(MixerGraph {
                sample_rate,
                channels: channels.max(1),
                master: 1.0,
                sources: HashMap::new(),
                frames_out: 0,
            })),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        lock_or_recover(&self.graph).sample_rate
    }

    pub fn channels(&self) -> u16 {
        lock_or_recover(&self.graph).channels
    }

    /// Attach a source. The local loop-back source is never mixed, so it
    /// gets no handle at all. Re-adding an id replaces the old source.
    pub fn add_source(&self, id: &str, is_local: bool) -> Option<AudioSourceHandle> {
        if is_local {
            tracing::debug!(source = id, "not mixing local source");
            return None;
        }
        let mut graph = lock_or_recover(&self.graph);
        let capacity = graph.sample_rate as usize * graph.channels as usize * SOURCE_BUFFER_SECS;
        let (producer, consumer) = rtrb::RingBuffer::new(capacity.max(1));
        let played = Arc::new(AtomicU64::new(0));
        graph.sources.insert(
            id.to_string(),
            Source {
                consumer,
                volume: 1.0,
                played: played.clone(),
            },
        );
        tracing::info!(source = id, sources = graph.sources.len(), "mixer source added");
        Some(AudioSourceHandle {
            id: id.to_string(),
            producer,
            played,
            sample_rate: graph.sample_rate,
            overflowed: 0,
        })
    }

    pub fn remove_source(&self, id: &str) -> bool {
        let removed = lock_or_recover(&self.graph).sources.remove(id).is_some();
        if removed {
            tracing::info!(source = id, "mixer source removed");
        }
        removed
    }

    pub fn has_source(&self, id: &str) -> bool {
        lock_or_recover(&self.graph).sources.contains_key(id)
    }

    pub fn source_count(&self) -> usize {
        lock_or_recover(&self.graph).sources.len()
    }

    /// Per-source gain in `[0, 1]`. Returns false for an unknown id.
    pub fn set_source_volume(&self, id: &str, volume: f32) -> bool {
        match lock_or_recover(&self.graph).sources.get_mut(id) {
            Some(source) => {
                source.volume = clamp_gain(volume);
                true
            }
            None => false,
        }
    }

    pub fn set_master_volume(&self, volume: f32) {
        lock_or_recover(&self.graph).master = clamp_gain(volume);
    }

    pub fn master_volume(&self) -> f32 {
        lock_or_recover(&self.graph).master
    }

    /// Playback clock: media time pulled out of the graph so far.
    pub fn clock_us(&self) -> u64 {
        let graph = lock_or_recover(&self.graph);
        graph.frames_out.saturating_mul(1_000_000) / graph.sample_rate.max(1) as u64
    }

    /// Mix the next `frames` frames. Sources short of data contribute what
    /// they have; the remainder is silence.
    pub fn output(&self, frames: usize) -> MixerOutput {
        let mut graph = lock_or_recover(&self.graph);
        let channels = graph.channels as usize;
        let mut samples = vec![0.0f32; frames * channels];

        for source in graph.sources.values_mut() {
            let mut taken = 0;
            for slot in samples.iter_mut() {
                match source.consumer.pop() {
                    Ok(sample) => {
                        *slot += sample * source.volume;
                        taken += 1;
                    }
                    Err(_) => break,
                }
            }
            source.played.fetch_add((taken / channels) as u64, Ordering::AcqRel);
        }

        let master = graph.master;
        for sample in samples.iter_mut() {
            *sample = (*sample * master).clamp(-1.0, 1.0);
        }

        graph.frames_out += frames as u64;
        let clock_us = graph.frames_out.saturating_mul(1_000_000) / graph.sample_rate.max(1) as u64;
        MixerOutput { samples, clock_us }
    }
}

fn clamp_gain(volume: f32) -> f32 {
    if volume.is_nan() {
        return 0.0;
    }
    volume.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_source_is_excluded_at_add_time() {
        let mixer = AudioMixer::new(48_000, 1);
        assert!(mixer.add_source("me", true).is_none());
        assert!(!mixer.has_source("me"));
        assert_eq!(mixer.source_count(), 0);
    }

    #[test]
    fn silence_without_sources() {
        let mixer = AudioMixer::new(48_000, 2);
        let out = mixer.output(480);
        assert_eq!(out.samples.len(), 960);
        assert!(out.samples.iter().all(|s| *s == 0.0));
        assert_eq!(out.clock_us, 10_000);
    }

    #[test]
    fn sources_are_summed_with_gain() {
        let mixer = AudioMixer::new(1000, 1);
        let mut a = mixer.add_source("a", false).unwrap();
        let mut b = mixer.add_source("b", false).unwrap();
        a.push(&[0.5; 4]);
        b.push(&[0.25; 2]);
        mixer.set_source_volume("a", 0.5);

        let out = mixer.output(4);
        assert_eq!(out.samples, vec![0.5, 0.5, 0.25, 0.25]);
        assert_eq!(a.played_us(), 4000);
        assert_eq!(b.played_us(), 2000);
    }

    #[test]
    fn master_volume_is_clamped() {
        let mixer = AudioMixer::new(48_000, 1);
        mixer.set_master_volume(1.7);
        assert_eq!(mixer.master_volume(), 1.0);
        mixer.set_master_volume(-0.2);
        assert_eq!(mixer.master_volume(), 0.0);
        mixer.set_master_volume(f32::NAN);
        assert_eq!(mixer.master_volume(), 0.0);
    }

    #[test]
    fn removed_source_stops_contributing() {
        let mixer = AudioMixer::new(1000, 1);
        let mut a = mixer.add_source("a", false).unwrap();
        a.push(&[0.5; 8]);
        assert!(mixer.remove_source("a"));
        assert!(!mixer.remove_source("a"));
        assert!(!mixer.set_source_volume("a", 0.3));
        assert_eq!(mixer.output(4).samples, vec![0.0; 4]);
    }

    #[test]
    fn full_source_drops_excess() {
        let mixer = AudioMixer::new(4, 1);
        let mut a = mixer.add_source("a", false).unwrap();
        assert_eq!(a.push(&[0.1; 6]), 4);
        assert_eq!(a.overflowed, 2);
    }
}
