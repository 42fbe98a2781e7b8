//! Voice profile and the policies that tune it from rolling conversation metrics.

use crate::history::{last_user, Utterance};
use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use regex::Regex;
use std::time::Duration;
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum EnergyLevel {
    Low,
    #[default]
    Medium,
    High,
}

impl EnergyLevel {
    /// Style value handed to the synthesizer.
    pub fn style(self) -> f32 {
        match self {
            EnergyLevel::Low => 0.0,
            EnergyLevel::Medium => 0.2,
            EnergyLevel::High => 0.45,
        }
    }

    fn filler_phrases(self) -> &'static [&'static str] {
        match self {
            EnergyLevel::Low => &["Hmm.", "Let me think about that.", "Okay, give me a moment."],
            EnergyLevel::Medium => &["Hmm, let me think.", "Okay.", "Right, one sec."],
            EnergyLevel::High => &["Ooh, good one!", "Oh, nice!", "Okay, okay!"],
        }
    }
}

const INTERRUPTION_RESPONSES: &[&str] = &["Oh, sorry, go ahead.", "Sure, I'm listening.", "Go on."];

const QUESTION_FILLERS: &[&str] = &["Good question.", "Hmm, let me think about that.", "Ah, let's see."];

/// How the assistant currently sounds. Only the session's manager mutates it.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceProfile {
    pub voice_id: String,
    /// 1.0 is neutral
    pub speaking_rate: f32,
    pub energy: EnergyLevel,
    pub filler_phrases: Vec<String>,
    pub interruption_responses: Vec<String>,
}

impl VoiceProfile {
    pub fn new(voice_id: impl Into<String>) -> Self {
        let energy = EnergyLevel::default();
        Self {
            voice_id: voice_id.into(),
            speaking_rate: 1.0,
            energy,
            filler_phrases: to_owned(energy.filler_phrases()),
            interruption_responses: to_owned(INTERRUPTION_RESPONSES),
        }
    }

    pub fn set_energy(&mut self, energy: EnergyLevel) {
        if self.energy != energy {
            self.energy = energy;
            self.filler_phrases = to_owned(energy.filler_phrases());
        }
    }
}

fn to_owned(phrases: &[&str]) -> Vec<String> {
    phrases.iter().map(|p| p.to_string()).collect()
}

/// Rolling signals about how the user talks.
#[derive(Debug, Clone, Default)]
pub struct RollingMetrics {
    /// Exponential moving average; `None` until the first measurable utterance.
    pub words_per_minute: Option<f32>,
    pub interruption_count: u32,
    pub turn_count: u32,
    interruptions_at_last_adapt: u32,
}

impl RollingMetrics {
    const SMOOTHING: f32 = 0.3;

    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one user utterance into the words-per-minute average.
    /// Utterances shorter than a quarter second are too noisy to count.
    pub fn record_utterance(&mut self, text: &str, spoken_for: Duration) {
        let words = text.split_whitespace().count();
        let secs = spoken_for.as_secs_f32();
        if words == 0 || secs < 0.25 {
            return;
        }
        let sample = words as f32 * 60.0 / secs;
        self.words_per_minute = Some(match self.words_per_minute {
            Some(avg) => avg + Self::SMOOTHING * (sample - avg),
            None => sample,
        });
    }

    pub fn record_interruption(&mut self) {
        self.interruption_count += 1;
    }

    pub fn record_turn(&mut self) {
        self.turn_count += 1;
    }

    /// Interruptions since the profile was last adapted.
    pub fn recent_interruptions(&self) -> u32 {
        self.interruption_count - self.interruptions_at_last_adapt
    }

    pub fn mark_adapted(&mut self) {
        self.interruptions_at_last_adapt = self.interruption_count;
    }
}

/// Periodic profile adjustment. Best effort; any policy will do.
pub trait ProfileAdapter: Send + Sync {
    /// Returns true when the profile changed.
    fn adapt(&self, profile: &mut VoiceProfile, metrics: &RollingMetrics) -> bool;
}

/// Match the user's pace: fast talkers get brisk, energetic delivery; slow
/// talkers or frequent interrupters get calmer, slower delivery.
#[derive(Debug, Clone)]
pub struct RateMatchingAdapter {
    pub fast_wpm: f32,
    pub slow_wpm: f32,
    pub interruption_threshold: u32,
}

impl Default for RateMatchingAdapter {
    fn default() -> Self {
        Self {
            fast_wpm: 170.0,
            slow_wpm: 120.0,
            interruption_threshold: 2,
        }
    }
}

impl ProfileAdapter for RateMatchingAdapter {
    fn adapt(&self, profile: &mut VoiceProfile, metrics: &RollingMetrics) -> bool {
        let before = profile.clone();

        let (rate, energy) = if metrics.recent_interruptions() >= self.interruption_threshold {
            (0.9, EnergyLevel::Low)
        } else {
            match metrics.words_per_minute {
                Some(wpm) if wpm >= self.fast_wpm => (1.1, EnergyLevel::High),
                Some(wpm) if wpm <= self.slow_wpm => (0.9, EnergyLevel::Low),
                _ => (1.0, EnergyLevel::Medium),
            }
        };

        profile.speaking_rate = rate;
        profile.set_energy(energy);
        *profile != before
    }
}

/// Picks one phrase out of a set.
pub trait PhraseSelector: Send {
    fn choose(&mut self, phrases: &[String]) -> Option<String>;
}

/// Uniform choice from a seedable RNG so tests can pin the outcome.
pub struct SeededPhraseSelector {
    rng: StdRng,
}

impl SeededPhraseSelector {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }
}

impl PhraseSelector for SeededPhraseSelector {
    fn choose(&mut self, phrases: &[String]) -> Option<String> {
        phrases.choose(&mut self.rng).cloned()
    }
}

/// `history -> filler phrase`
pub trait FillerPolicy: Send + Sync {
    fn filler(
        &self,
        history: &[Utterance],
        profile: &VoiceProfile,
        selector: &mut dyn PhraseSelector,
    ) -> Option<String>;
}

static QUESTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\?\s*$|^\s*(what|why|how|when|where|who|which|can|could|should|would|do|does|is|are)\b)")
        .unwrap()
});

/// Question-shaped last user utterance picks a question filler, anything else
/// a filler from the current profile.
#[derive(Debug, Clone, Default)]
pub struct ContextualFiller;

impl ContextualFiller {
    pub fn is_question(text: &str) -> bool {
        QUESTION.is_match(text)
    }
}

impl FillerPolicy for ContextualFiller {
    fn filler(
        &self,
        history: &[Utterance],
        profile: &VoiceProfile,
        selector: &mut dyn PhraseSelector,
    ) -> Option<String> {
        match last_user(history) {
            Some(u) if Self::is_question(&u.text) => selector.choose(&to_owned(QUESTION_FILLERS)),
            _ => selector.choose(&profile.filler_phrases),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolling_wpm_average() {
        let mut metrics = RollingMetrics::new();
        metrics.record_utterance("one two three", Duration::from_secs(1));
        assert_eq!(metrics.words_per_minute, Some(180.0));

        metrics.record_utterance("one two", Duration::from_secs(1));
        let wpm = metrics.words_per_minute.unwrap();
        assert!((wpm - 162.0).abs() < 0.01, "got {}", wpm);

        // Too short to measure
        metrics.record_utterance("hi", Duration::from_millis(100));
        assert!((metrics.words_per_minute.unwrap() - 162.0).abs() < 0.01);
    }

    #[test]
    fn test_rate_matching_fast_talker() {
        let adapter = RateMatchingAdapter::default();
        let mut profile = VoiceProfile::new("v");
        let mut metrics = RollingMetrics::new();
        metrics.words_per_minute = Some(200.0);

        assert!(adapter.adapt(&mut profile, &metrics));
        assert_eq!(profile.energy, EnergyLevel::High);
        assert_eq!(profile.speaking_rate, 1.1);
        assert!(profile.filler_phrases.contains(&"Oh, nice!".to_string()));

        // Same inputs, nothing changes
        assert!(!adapter.adapt(&mut profile, &metrics));
    }

    #[test]
    fn test_rate_matching_interruptions_calm_down() {
        let adapter = RateMatchingAdapter::default();
        let mut profile = VoiceProfile::new("v");
        let mut metrics = RollingMetrics::new();
        metrics.words_per_minute = Some(200.0);
        metrics.record_interruption();
        metrics.record_interruption();

        adapter.adapt(&mut profile, &metrics);
        assert_eq!(profile.energy, EnergyLevel::Low);
        assert_eq!(profile.speaking_rate, 0.9);

        metrics.mark_adapted();
        assert_eq!(metrics.recent_interruptions(), 0);
    }

    #[test]
    fn test_seeded_selector_is_deterministic() {
        let phrases = to_owned(INTERRUPTION_RESPONSES);
        let mut a = SeededPhraseSelector::new(Some(7));
        let mut b = SeededPhraseSelector::new(Some(7));
        for _ in 0..5 {
            assert_eq!(a.choose(&phrases), b.choose(&phrases));
        }
        assert_eq!(a.choose(&[]), None);
    }

    #[test]
    fn test_contextual_filler_prefers_question_fillers() {
        let profile = VoiceProfile::new("v");
        let mut selector = SeededPhraseSelector::new(Some(1));
        let policy = ContextualFiller;

        let question = vec![Utterance::user("How does this work")];
        let filler = policy.filler(&question, &profile, &mut selector).unwrap();
        assert!(QUESTION_FILLERS.contains(&filler.as_str()));

        let statement = vec![Utterance::user("I went hiking today")];
        let filler = policy.filler(&statement, &profile, &mut selector).unwrap();
        assert!(profile.filler_phrases.contains(&filler));
    }

    #[test]
    fn test_question_detection() {
        assert!(ContextualFiller::is_question("is it raining"));
        assert!(ContextualFiller::is_question("you like it?"));
        assert!(!ContextualFiller::is_question("this is great"));
    }
}
