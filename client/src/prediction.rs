//! Local player prediction and server reconciliation.
//!
//! Inputs are applied locally the moment they are made, with the same
//! movement rules the server uses, and kept until the server acknowledges
//! them. Each snapshot is compared against what the client predicted for the
//! acknowledged input. Small differences are ignored, moderate ones are eased
//! out and large ones snap. Whatever is still unacknowledged is then replayed
//! on top of the corrected baseline.

use crate::config::ClientConfig;
use log::debug;
use nalgebra::Vector3;
use shared::math::to_vector;
use shared::movement::step;
use shared::{MotionState, MovementTuning, PlayerInput, PlayerState};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcileSettings {
    pub small_error_threshold: f32,
    pub large_error_threshold: f32,
    pub render_correction_rate: f32,
    pub baseline_correction_rate: f32,
    pub max_unacked_inputs: usize,
}

impl From<&ClientConfig> for ReconcileSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            small_error_threshold: config.small_error_threshold,
            large_error_threshold: config.large_error_threshold,
            render_correction_rate: config.render_correction_rate,
            baseline_correction_rate: config.baseline_correction_rate,
            max_unacked_inputs: config.max_unacked_inputs.max(1),
        }
    }
}

/// An input the server has not acknowledged yet.
#[derive(Debug, Clone, Copy)]
pub struct PendingInput {
    pub input: PlayerInput,
    pub dt: f32,
    /// Local time the input was sent.
    pub sent_at: f64,
    /// Predicted state right after applying the input.
    pub state_after: MotionState,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Correction {
    /// Within prediction noise.
    None,
    Smoothed { error: f32 },
    Snapped { error: f32 },
    /// Older than a snapshot already applied.
    Stale,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrectionStats {
    pub ignored: u64,
    pub smoothed: u64,
    pub snapped: u64,
    /// Inputs evicted from a full buffer before being acknowledged.
    pub dropped_inputs: u64,
}

pub struct PredictionEngine {
    settings: ReconcileSettings,
    tuning: MovementTuning,
    /// Last state the server confirmed.
    confirmed: MotionState,
    predicted: MotionState,
    render_position: Vector3<f32>,
    health: f32,
    pending: VecDeque<PendingInput>,
    last_ack: u32,
    stats: CorrectionStats,
}

impl PredictionEngine {
    pub fn new(settings: ReconcileSettings, tuning: MovementTuning, spawn: Vector3<f32>) -> Self {
        let state = MotionState::at(spawn, tuning.max_stamina);
        Self {
            settings,
            tuning,
            confirmed: state,
            predicted: state,
            render_position: spawn,
            health: 100.0,
            pending: VecDeque::new(),
            last_ack: 0,
            stats: CorrectionStats::default(),
        }
    }

    pub fn predicted(&self) -> &MotionState {
        &self.predicted
    }

    pub fn confirmed(&self) -> &MotionState {
        &self.confirmed
    }

    /// Where the local player should be drawn.
    pub fn render_position(&self) -> Vector3<f32> {
        self.render_position
    }

    pub fn health(&self) -> f32 {
        self.health
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn last_ack(&self) -> u32 {
        self.last_ack
    }

    pub fn stats(&self) -> CorrectionStats {
        self.stats
    }

    /// Discards every unacknowledged input and places the player at `state`.
    pub fn reset(&mut self, state: MotionState) {
        self.pending.clear();
        self.confirmed = state;
        self.predicted = state;
        self.render_position = state.position;
    }

    /// Applies an input locally and remembers it for replay.
    pub fn predict<H>(&mut self, input: PlayerInput, dt: f32, sent_at: f64, ground: H)
    where
        H: Fn(f32, f32) -> f32,
    {
        let before = self.predicted.position;
        step(&mut self.predicted, &input, &self.tuning, &ground, dt);
        self.render_position += self.predicted.position - before;

        self.pending.push_back(PendingInput {
            input,
            dt,
            sent_at,
            state_after: self.predicted,
        });
        while self.pending.len() > self.settings.max_unacked_inputs {
            self.pending.pop_front();
            self.stats.dropped_inputs += 1;
        }
    }

    /// Corrects the prediction against an authoritative state that reflects
    /// every input up to `ack`.
    pub fn reconcile<H>(&mut self, server: &PlayerState, ack: u32, ground: H) -> Correction
    where
        H: Fn(f32, f32) -> f32,
    {
        if ack < self.last_ack {
            return Correction::Stale;
        }
        self.last_ack = ack;
        self.health = server.health;

        let authoritative = MotionState {
            position: to_vector(server.position),
            velocity: to_vector(server.velocity),
            grounded: server.grounded,
            stamina: server.stamina,
        };
        self.confirmed = authoritative;

        let recorded = self
            .pending
            .iter()
            .find(|p| p.input.seq == ack)
            .map(|p| p.state_after);
        self.pending.retain(|p| p.input.seq > ack);
        let local_at_ack = match recorded {
            Some(state) => state,
            None if self.pending.is_empty() => self.predicted,
            // The acked input was evicted, so there is no local state to
            // compare against. Rebuild from the server state outright.
            None => {
                let before = self.predicted.position;
                self.replay(authoritative, &ground);
                let error = (before - self.predicted.position).norm();
                debug!(
                    "Ack {} older than the input buffer, resynced by {:.2} m",
                    ack, error
                );
                self.render_position = self.predicted.position;
                self.stats.snapped += 1;
                return Correction::Snapped { error };
            }
        };

        let error = (local_at_ack.position - authoritative.position).norm();
        if error < self.settings.small_error_threshold {
            self.stats.ignored += 1;
            if self.pending.is_empty() {
                self.predicted.stamina = authoritative.stamina;
                self.predicted.grounded = authoritative.grounded;
            }
            return Correction::None;
        }

        if error > self.settings.large_error_threshold {
            debug!("Prediction off by {:.2} m, snapping", error);
            self.replay(authoritative, &ground);
            self.render_position = self.predicted.position;
            self.stats.snapped += 1;
            return Correction::Snapped { error };
        }

        let baseline = if self.pending.is_empty() {
            authoritative
        } else {
            MotionState {
                position: local_at_ack.position.lerp(
                    &authoritative.position,
                    self.settings.baseline_correction_rate,
                ),
                ..authoritative
            }
        };
        self.replay(baseline, &ground);
        self.render_position = self.render_position.lerp(
            &self.predicted.position,
            self.settings.render_correction_rate,
        );
        self.stats.smoothed += 1;
        Correction::Smoothed { error }
    }

    /// Rebuilds the prediction as `baseline` plus every pending input.
    fn replay<H>(&mut self, baseline: MotionState, ground: &H)
    where
        H: Fn(f32, f32) -> f32,
    {
        let mut state = baseline;
        for pending in self.pending.iter_mut() {
            step(&mut state, &pending.input, &self.tuning, ground, pending.dt);
            pending.state_after = state;
        }
        self.predicted = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use shared::math::from_vector;
    use shared::PLAYER_HALF_HEIGHT;

    const DT: f32 = 1.0 / 60.0;

    fn flat(_x: f32, _z: f32) -> f32 {
        0.0
    }

    fn engine() -> PredictionEngine {
        let settings = ReconcileSettings::from(&ClientConfig::default());
        let mut engine = PredictionEngine::new(
            settings,
            MovementTuning::default(),
            Vector3::new(0.0, PLAYER_HALF_HEIGHT, 0.0),
        );
        let mut grounded = *engine.predicted();
        grounded.grounded = true;
        engine.reset(grounded);
        engine
    }

    fn walk(seq: u32) -> PlayerInput {
        PlayerInput {
            seq,
            forward: 1.0,
            ..PlayerInput::default()
        }
    }

    fn server_state(state: &MotionState) -> PlayerState {
        let mut server = PlayerState::new(1, "me", from_vector(&state.position));
        server.velocity = from_vector(&state.velocity);
        server.grounded = state.grounded;
        server.stamina = state.stamina;
        server
    }

    #[test]
    fn test_prediction_moves_immediately() {
        let mut engine = engine();
        engine.predict(walk(1), DT, 0.0, flat);
        assert!(engine.predicted().position.z < 0.0);
        assert_eq!(engine.render_position(), engine.predicted().position);
        assert_eq!(engine.pending(), 1);
    }

    #[test]
    fn test_matching_snapshot_changes_nothing() {
        let mut engine = engine();
        for seq in 1..=3 {
            engine.predict(walk(seq), DT, 0.0, flat);
        }
        let before = engine.predicted().position;
        let at_ack = engine.pending[0].state_after;
        let correction = engine.reconcile(&server_state(&at_ack), 1, flat);
        assert_eq!(correction, Correction::None);
        assert_eq!(engine.predicted().position, before);
        assert_eq!(engine.pending(), 2);
    }

    #[test]
    fn test_divergence_converges_when_nothing_to_replay() {
        let mut engine = engine();
        let mut server = *engine.predicted();
        server.position.x += 2.0;
        let correction = engine.reconcile(&server_state(&server), 0, flat);
        assert!(matches!(correction, Correction::Smoothed { .. }));
        assert_eq!(engine.predicted().position, server.position);
    }

    #[test]
    fn test_large_divergence_snaps_render_too() {
        let mut engine = engine();
        engine.predict(walk(1), DT, 0.0, flat);
        engine.predict(walk(2), DT, 0.0, flat);
        let mut server = engine.pending[0].state_after;
        server.position.x += 10.0;

        let correction = engine.reconcile(&server_state(&server), 1, flat);
        assert!(matches!(correction, Correction::Snapped { .. }));
        assert_eq!(engine.render_position(), engine.predicted().position);
        assert!((engine.predicted().position.x - server.position.x).abs() < 1e-4);
    }

    #[test]
    fn test_moderate_error_eases_baseline_and_replays() {
        let mut engine = engine();
        for seq in 1..=3 {
            engine.predict(walk(seq), DT, 0.0, flat);
        }
        let before = engine.predicted().position;
        let mut server = engine.pending[0].state_after;
        server.position.x += 0.5;

        let correction = engine.reconcile(&server_state(&server), 1, flat);
        assert!(matches!(correction, Correction::Smoothed { error } if (error - 0.5).abs() < 1e-4));
        // Baseline moved a tenth of the way; the replayed inputs carry it along.
        assert_approx_eq!(engine.predicted().position.x - before.x, 0.05, 1e-4);
        assert_approx_eq!(engine.predicted().position.z, before.z, 1e-4);
        // Render closes 30% of its gap to the new prediction.
        assert_approx_eq!(engine.render_position().x - before.x, 0.015, 1e-4);
    }

    #[test]
    fn test_stale_snapshot_ignored() {
        let mut engine = engine();
        for seq in 1..=3 {
            engine.predict(walk(seq), DT, 0.0, flat);
        }
        let state = engine.pending[1].state_after;
        engine.reconcile(&server_state(&state), 2, flat);
        assert_eq!(engine.reconcile(&server_state(&state), 1, flat), Correction::Stale);
        assert_eq!(engine.last_ack(), 2);
    }

    #[test]
    fn test_buffer_is_bounded() {
        let mut engine = engine();
        for seq in 1..=200 {
            engine.predict(walk(seq), DT, 0.0, flat);
        }
        assert_eq!(engine.pending(), 120);
        assert_eq!(engine.stats().dropped_inputs, 80);
        assert_eq!(engine.pending.front().map(|p| p.input.seq), Some(81));
    }

    #[test]
    fn test_ack_older_than_buffer_resyncs() {
        let settings = ReconcileSettings {
            max_unacked_inputs: 4,
            ..ReconcileSettings::from(&ClientConfig::default())
        };
        let mut engine = PredictionEngine::new(
            settings,
            MovementTuning::default(),
            Vector3::new(0.0, PLAYER_HALF_HEIGHT, 0.0),
        );
        for seq in 1..=10 {
            engine.predict(walk(seq), DT, 0.0, flat);
        }
        assert_eq!(engine.pending.front().map(|p| p.input.seq), Some(7));

        let mut server = *engine.predicted();
        server.position.x += 10.0;
        let correction = engine.reconcile(&server_state(&server), 2, flat);

        assert!(matches!(correction, Correction::Snapped { .. }));
        assert_eq!(engine.pending(), 4);
        // The four retained inputs are replayed on top of the server state.
        assert!(engine.predicted().position.x > 9.0);
        assert_eq!(engine.render_position(), engine.predicted().position);
    }

    #[test]
    fn test_server_owned_fields_adopted() {
        let mut engine = engine();
        let mut server = *engine.predicted();
        server.stamina = 42.0;
        engine.reconcile(&server_state(&server), 0, flat);
        assert_eq!(engine.predicted().stamina, 42.0);
    }
}
