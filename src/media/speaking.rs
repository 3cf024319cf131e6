//! Energy-based speaking detection for decoded remote audio

/// Per-peer speaking classifier
///
/// Runs over decoded PCM frames: RMS energy is exponentially smoothed, then
/// compared against a fixed threshold. A hold window keeps the speaking state
/// up through short pauses so the indicator does not flicker between words.
pub struct SpeakingDetector {
    threshold: f32,
    hold_frames: u32,
    smoothing: f32,
    smoothed_energy: f32,
    quiet_frames: u32,
    speaking: bool,
}

impl Default for SpeakingDetector {
    fn default() -> Self {
        // ~500ms hold at 20ms frames
        Self::new(0.02, 25, 0.3)
    }
}

impl SpeakingDetector {
    /// Create a detector with explicit tuning
    pub fn new(threshold: f32, hold_frames: u32, smoothing: f32) -> Self {
        Self {
            threshold,
            hold_frames,
            smoothing,
            smoothed_energy: 0.0,
            quiet_frames: 0,
            speaking: false,
        }
    }

    /// Current speaking state
    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Feed one decoded PCM frame
    ///
    /// Returns `Some(state)` only on a transition, `None` while the state is
    /// unchanged.
    pub fn process(&mut self, samples: &[f32]) -> Option<bool> {
        if samples.is_empty() {
            return None;
        }

        let energy = rms(samples);
        self.smoothed_energy =
            self.smoothed_energy * (1.0 - self.smoothing) + energy * self.smoothing;

        let loud = self.smoothed_energy >= self.threshold;

        if loud {
            self.quiet_frames = 0;
            if !self.speaking {
                self.speaking = true;
                return Some(true);
            }
        } else if self.speaking {
            self.quiet_frames += 1;
            if self.quiet_frames >= self.hold_frames {
                self.speaking = false;
                self.quiet_frames = 0;
                return Some(false);
            }
        }

        None
    }
}

fn rms(samples: &[f32]) -> f32 {
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: usize = 960;

    fn loud_frame() -> Vec<f32> {
        vec![0.5; FRAME]
    }

    fn quiet_frame() -> Vec<f32> {
        vec![0.001; FRAME]
    }

    #[test]
    fn test_starts_silent() {
        let detector = SpeakingDetector::default();
        assert!(!detector.is_speaking());
    }

    #[test]
    fn test_loud_audio_triggers_speaking() {
        let mut detector = SpeakingDetector::default();
        let frame = loud_frame();

        let mut transition = None;
        for _ in 0..10 {
            if let Some(state) = detector.process(&frame) {
                transition = Some(state);
                break;
            }
        }
        assert_eq!(transition, Some(true));
        assert!(detector.is_speaking());
    }

    #[test]
    fn test_transition_reported_once() {
        let mut detector = SpeakingDetector::default();
        let frame = loud_frame();

        let transitions: Vec<bool> = (0..50).filter_map(|_| detector.process(&frame)).collect();
        assert_eq!(transitions, vec![true]);
    }

    #[test]
    fn test_hold_window_survives_short_pause() {
        let mut detector = SpeakingDetector::new(0.02, 25, 0.3);
        let loud = loud_frame();
        let quiet = quiet_frame();

        for _ in 0..10 {
            detector.process(&loud);
        }
        assert!(detector.is_speaking());

        // Shorter than the hold window: no transition out
        for _ in 0..10 {
            assert_eq!(detector.process(&quiet), None);
        }
        assert!(detector.is_speaking());

        // Coming back loud resets the hold counter
        for _ in 0..5 {
            detector.process(&loud);
        }
        for _ in 0..10 {
            assert_eq!(detector.process(&quiet), None);
        }
        assert!(detector.is_speaking());
    }

    #[test]
    fn test_sustained_silence_ends_speaking() {
        let mut detector = SpeakingDetector::new(0.02, 25, 0.3);
        let loud = loud_frame();
        let quiet = quiet_frame();

        for _ in 0..10 {
            detector.process(&loud);
        }
        assert!(detector.is_speaking());

        let mut transition = None;
        for _ in 0..100 {
            if let Some(state) = detector.process(&quiet) {
                transition = Some(state);
                break;
            }
        }
        assert_eq!(transition, Some(false));
        assert!(!detector.is_speaking());
    }

    #[test]
    fn test_empty_frame_is_ignored() {
        let mut detector = SpeakingDetector::default();
        assert_eq!(detector.process(&[]), None);
        assert!(!detector.is_speaking());
    }
}
