//! ConversationFSM (C5, §4.7): the agent state machine, barge-in detection,
//! and the privacy frame-gating rule.

use std::time::{Duration, Instant};

use lumen_media::PrivacyVerdict;
use lumen_protocol::TurnCompletionReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    Idle,
    Listening,
    Analyzing,
    Speaking,
    Interrupted,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    UserAudioObserved,
    SpatialQuery,
    SpatialQueryComplete,
    UpstreamResponseStarting,
    UpstreamAudioChunk,
    BargeIn,
    ClientInterrupt,
    TurnComplete,
    UpstreamFatalError,
    SessionCancelled,
}

/// A single totally-ordered FSM transition, for observability (§5).
#[derive(Debug, Clone, Copy)]
pub struct Transition {
    pub from: ConversationState,
    pub to: ConversationState,
    pub trigger: Trigger,
}

/// Tracks the agent state machine for one session plus the rolling privacy
/// verdict window that gates audio forwarding (§4.5, §4.7).
pub struct ConversationFsm {
    state: ConversationState,
    history: Vec<Transition>,
    consecutive_blocked: u32,
    consecutive_safe: u32,
    privacy_halted: bool,
    barge_in_threshold: f32,
    barge_in_duration: Duration,
    above_threshold_since: Option<Instant>,
    last_turn_complete_at: Option<Instant>,
}

impl ConversationFsm {
    pub fn new(barge_in_threshold: f32, barge_in_ms: u64) -> Self {
        Self {
            state: ConversationState::Idle,
            history: Vec::new(),
            consecutive_blocked: 0,
            consecutive_safe: 0,
            privacy_halted: false,
            barge_in_threshold,
            barge_in_duration: Duration::from_millis(barge_in_ms),
            above_threshold_since: None,
            last_turn_complete_at: None,
        }
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    fn transition(&mut self, to: ConversationState, trigger: Trigger) {
        let from = self.state;
        self.state = to;
        self.history.push(Transition { from, to, trigger });
    }

    /// Apply a non-audio, non-privacy trigger per the table in §4.7. Returns
    /// `true` if the state changed.
    pub fn apply(&mut self, trigger: Trigger) -> bool {
        use ConversationState::*;
        use Trigger::*;
        let next = match (self.state, trigger) {
            (Idle, UserAudioObserved) => Some(Listening),
            (Listening, SpatialQuery) | (Listening, UpstreamResponseStarting) => Some(Analyzing),
            (Analyzing, SpatialQueryComplete) => Some(Listening),
            (Analyzing, UpstreamAudioChunk) => Some(Speaking),
            (Speaking, BargeIn) | (Speaking, ClientInterrupt) => Some(Interrupted),
            (Speaking, TurnComplete) => Some(Idle),
            (Interrupted, TurnComplete) => Some(Listening),
            (_, UpstreamFatalError) | (_, SessionCancelled) => Some(Fatal),
            _ => None,
        };
        match next {
            Some(to) => {
                if trigger == Trigger::TurnComplete {
                    self.last_turn_complete_at = Some(Instant::now());
                }
                self.transition(to, trigger);
                true
            }
            None => false,
        }
    }

    /// Feed one audio energy sample while `speaking`. Returns `true` if this
    /// sample completes the 200ms-above-threshold barge-in window.
    pub fn observe_audio_energy(&mut self, rms: f32, now: Instant) -> bool {
        if self.state != ConversationState::Speaking {
            self.above_threshold_since = None;
            return false;
        }
        if rms < self.barge_in_threshold {
            self.above_threshold_since = None;
            return false;
        }
        let since = *self.above_threshold_since.get_or_insert(now);
        now.duration_since(since) >= self.barge_in_duration
    }

    /// Resolve a near-simultaneous barge-in vs `turn_complete` race (§4.7):
    /// if completion lands within 50ms of the interruption, prefer completion.
    pub fn resolve_barge_in_race(
        &mut self,
        barge_in_at: Instant,
        turn_complete_at: Option<Instant>,
    ) -> Trigger {
        const TIE_WINDOW: Duration = Duration::from_millis(50);
        match turn_complete_at {
            Some(tc) if tc.duration_since(barge_in_at.min(tc)) <= TIE_WINDOW => Trigger::TurnComplete,
            _ => Trigger::BargeIn,
        }
    }

    /// Decide whether a just-detected barge-in should actually interrupt, or
    /// lose the race to an upstream `turn_complete` that landed moments ago.
    pub fn barge_in_or_turn_complete(&mut self, now: Instant) -> Trigger {
        self.resolve_barge_in_race(now, self.last_turn_complete_at)
    }

    /// Feed a PrivacyVerdict observed for the session's most recent still
    /// frame. Applies the 3-consecutive-blocked / 2-consecutive-safe
    /// hysteresis (§4.7). Returns whether audio forwarding should currently
    /// be halted.
    pub fn observe_privacy_verdict(&mut self, verdict: &PrivacyVerdict) -> bool {
        match verdict {
            PrivacyVerdict::Blocked { .. } => {
                self.consecutive_blocked += 1;
                self.consecutive_safe = 0;
                if self.consecutive_blocked >= 3 {
                    self.privacy_halted = true;
                }
            }
            PrivacyVerdict::Safe | PrivacyVerdict::Blurred { .. } => {
                self.consecutive_safe += 1;
                self.consecutive_blocked = 0;
                if self.consecutive_safe >= 2 {
                    self.privacy_halted = false;
                }
            }
        }
        self.privacy_halted
    }

    pub fn audio_forwarding_halted(&self) -> bool {
        self.privacy_halted
    }

    pub fn turn_completion_reason(&self, trigger: Trigger) -> TurnCompletionReason {
        match trigger {
            Trigger::TurnComplete => TurnCompletionReason::Finished,
            Trigger::BargeIn | Trigger::ClientInterrupt => TurnCompletionReason::Interrupted,
            Trigger::UpstreamFatalError => TurnCompletionReason::Error,
            _ => TurnCompletionReason::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fsm() -> ConversationFsm {
        ConversationFsm::new(0.02, 200)
    }

    #[test]
    fn happy_path_traverses_full_cycle() {
        let mut f = fsm();
        assert!(f.apply(Trigger::UserAudioObserved));
        assert_eq!(f.state(), ConversationState::Listening);
        assert!(f.apply(Trigger::UpstreamResponseStarting));
        assert_eq!(f.state(), ConversationState::Analyzing);
        assert!(f.apply(Trigger::UpstreamAudioChunk));
        assert_eq!(f.state(), ConversationState::Speaking);
        assert!(f.apply(Trigger::TurnComplete));
        assert_eq!(f.state(), ConversationState::Idle);
        assert_eq!(f.history().len(), 4);
    }

    #[test]
    fn spatial_query_suspends_and_then_releases_listening() {
        let mut f = fsm();
        f.apply(Trigger::UserAudioObserved);
        assert!(f.apply(Trigger::SpatialQuery));
        assert_eq!(f.state(), ConversationState::Analyzing);
        assert!(f.apply(Trigger::SpatialQueryComplete));
        assert_eq!(f.state(), ConversationState::Listening);
    }

    #[test]
    fn illegal_edge_is_rejected() {
        let mut f = fsm();
        assert!(!f.apply(Trigger::TurnComplete));
        assert_eq!(f.state(), ConversationState::Idle);
    }

    #[test]
    fn barge_in_interrupts_speaking() {
        let mut f = fsm();
        f.apply(Trigger::UserAudioObserved);
        f.apply(Trigger::UpstreamResponseStarting);
        f.apply(Trigger::UpstreamAudioChunk);
        assert!(f.apply(Trigger::BargeIn));
        assert_eq!(f.state(), ConversationState::Interrupted);
        assert!(f.apply(Trigger::TurnComplete));
        assert_eq!(f.state(), ConversationState::Listening);
    }

    #[test]
    fn fatal_error_reachable_from_any_state() {
        for start in [ConversationState::Idle, ConversationState::Listening, ConversationState::Speaking] {
            let mut f = fsm();
            f.state = start;
            assert!(f.apply(Trigger::UpstreamFatalError));
            assert_eq!(f.state(), ConversationState::Fatal);
        }
    }

    #[test]
    fn barge_in_requires_200ms_sustained_energy() {
        let mut f = fsm();
        f.apply(Trigger::UserAudioObserved);
        f.apply(Trigger::UpstreamResponseStarting);
        f.apply(Trigger::UpstreamAudioChunk);
        let t0 = Instant::now();
        assert!(!f.observe_audio_energy(0.5, t0));
        assert!(!f.observe_audio_energy(0.5, t0 + Duration::from_millis(100)));
        assert!(f.observe_audio_energy(0.5, t0 + Duration::from_millis(201)));
    }

    #[test]
    fn energy_below_threshold_resets_window() {
        let mut f = fsm();
        f.apply(Trigger::UserAudioObserved);
        f.apply(Trigger::UpstreamResponseStarting);
        f.apply(Trigger::UpstreamAudioChunk);
        let t0 = Instant::now();
        assert!(!f.observe_audio_energy(0.5, t0));
        assert!(!f.observe_audio_energy(0.001, t0 + Duration::from_millis(150)));
        assert!(!f.observe_audio_energy(0.5, t0 + Duration::from_millis(250)));
    }

    #[test]
    fn three_consecutive_blocks_halts_forwarding() {
        let mut f = fsm();
        let blocked = PrivacyVerdict::Blocked { face_count: 5, reason: "crowd".into() };
        assert!(!f.observe_privacy_verdict(&blocked));
        assert!(!f.observe_privacy_verdict(&blocked));
        assert!(f.observe_privacy_verdict(&blocked));
        assert!(f.audio_forwarding_halted());
    }

    #[test]
    fn two_consecutive_safe_resumes_forwarding() {
        let mut f = fsm();
        let blocked = PrivacyVerdict::Blocked { face_count: 5, reason: "crowd".into() };
        for _ in 0..3 {
            f.observe_privacy_verdict(&blocked);
        }
        assert!(f.audio_forwarding_halted());
        f.observe_privacy_verdict(&PrivacyVerdict::Safe);
        assert!(f.audio_forwarding_halted());
        f.observe_privacy_verdict(&PrivacyVerdict::Safe);
        assert!(!f.audio_forwarding_halted());
    }

    #[test]
    fn tie_break_prefers_turn_complete_within_50ms() {
        let mut f = fsm();
        let t0 = Instant::now();
        let trigger = f.resolve_barge_in_race(t0, Some(t0 + Duration::from_millis(30)));
        assert_eq!(trigger, Trigger::TurnComplete);
        let trigger = f.resolve_barge_in_race(t0, Some(t0 + Duration::from_millis(80)));
        assert_eq!(trigger, Trigger::BargeIn);
        let trigger = f.resolve_barge_in_race(t0, None);
        assert_eq!(trigger, Trigger::BargeIn);
    }
}
