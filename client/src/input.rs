//! Client input management with sequencing

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{timestamp_millis, AircraftInput, PlayerInput, VehicleInput};

/// What the player wants to do this frame, before sequencing.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InputIntent {
    pub forward: f32,
    pub right: f32,
    pub jump: bool,
    pub run: bool,
    pub crouch: bool,
    pub yaw: f32,
    /// Vehicle controls used while driving.
    pub vehicle: VehicleInput,
}

/// Turns per-frame intent into sequenced network inputs
pub struct InputManager {
    next_sequence: u32,
    current_input: PlayerInput,
    current_vehicle_input: VehicleInput,
}

impl InputManager {
    pub fn new() -> Self {
        Self {
            next_sequence: 1,
            current_input: PlayerInput::default(),
            current_vehicle_input: VehicleInput::idle(),
        }
    }

    /// Stamps the intent with the next sequence number.
    ///
    /// Every frame produces a new input, even when nothing changed, so the
    /// server keeps acknowledging and reconciliation keeps running.
    pub fn next_input(&mut self, intent: &InputIntent) -> PlayerInput {
        self.current_input = PlayerInput {
            seq: self.next_sequence,
            forward: intent.forward,
            right: intent.right,
            jump: intent.jump,
            run: intent.run,
            crouch: intent.crouch,
            yaw: intent.yaw,
            timestamp: timestamp_millis(),
        }
        .sanitized();
        self.next_sequence = self.next_sequence.wrapping_add(1).max(1);
        self.current_input
    }

    /// Vehicle controls are best effort and carry no sequence number.
    pub fn vehicle_input(&mut self, intent: &InputIntent) -> VehicleInput {
        self.current_vehicle_input = intent.vehicle.sanitized();
        self.current_vehicle_input
    }

    pub fn current_input(&self) -> &PlayerInput {
        &self.current_input
    }

    pub fn next_sequence(&self) -> u32 {
        self.next_sequence
    }
}

impl Default for InputManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Wandering input for the headless client.
///
/// Walks forward while drifting its heading, sometimes runs, sometimes jumps.
pub struct BotDriver {
    rng: StdRng,
    yaw: f32,
    turn_rate: f32,
    run: bool,
}

impl BotDriver {
    pub fn new(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let yaw = rng.gen_range(0.0..std::f32::consts::TAU);
        Self {
            rng,
            yaw,
            turn_rate: 0.0,
            run: false,
        }
    }

    pub fn next_intent(&mut self, dt: f32, driving: bool) -> InputIntent {
        if self.rng.gen_bool(0.02) {
            self.turn_rate = self.rng.gen_range(-1.5..1.5);
        }
        if self.rng.gen_bool(0.005) {
            self.run = !self.run;
        }
        self.yaw = (self.yaw + self.turn_rate * dt).rem_euclid(std::f32::consts::TAU);

        let vehicle = if driving {
            VehicleInput {
                throttle: 0.6,
                brake: 0.0,
                steering: (self.turn_rate / 1.5).clamp(-1.0, 1.0),
                handbrake: false,
                aircraft: Some(AircraftInput {
                    collective: 0.1,
                    ..AircraftInput::default()
                }),
            }
        } else {
            VehicleInput::idle()
        };

        InputIntent {
            forward: 1.0,
            right: 0.0,
            jump: self.rng.gen_bool(0.01),
            run: self.run,
            crouch: false,
            yaw: self.yaw,
            vehicle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_manager_creation() {
        let input_manager = InputManager::new();
        assert_eq!(input_manager.next_sequence(), 1);
        assert_eq!(input_manager.current_input().seq, 0);
    }

    #[test]
    fn test_sequence_increments_every_frame() {
        let mut input_manager = InputManager::new();
        let intent = InputIntent::default();
        let seqs: Vec<u32> = (0..3).map(|_| input_manager.next_input(&intent).seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_intent_is_sanitized() {
        let mut input_manager = InputManager::new();
        let input = input_manager.next_input(&InputIntent {
            forward: 3.0,
            right: f32::NAN,
            ..InputIntent::default()
        });
        assert_eq!(input.forward, 1.0);
        assert_eq!(input.right, 0.0);
        assert!(input.timestamp > 0.0);
    }

    #[test]
    fn test_bot_is_deterministic_per_seed() {
        let mut a = BotDriver::new(7);
        let mut b = BotDriver::new(7);
        for _ in 0..100 {
            assert_eq!(a.next_intent(1.0 / 60.0, false), b.next_intent(1.0 / 60.0, false));
        }
    }

    #[test]
    fn test_bot_only_drives_when_in_vehicle() {
        let mut bot = BotDriver::new(1);
        assert!(bot.next_intent(0.016, false).vehicle.handbrake);
        assert!(bot.next_intent(0.016, true).vehicle.throttle > 0.0);
    }
}
