//! Raw input capture and command sequencing

use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::sim::{ActionFlags, Command, LookDelta, MovementFlags};
use crate::util::time::unix_millis_f64;

/// Radians of look rotation per pixel of mouse travel
pub const DEFAULT_MOUSE_SENSITIVITY: f32 = 0.002;

/// Logical actions a key or button can be bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputAction {
    MoveForward,
    MoveBackward,
    MoveLeft,
    MoveRight,
    Jump,
    Crouch,
    Sprint,
    Reload,
    Fire,
    Aim,
}

impl InputAction {
    pub const ALL: [InputAction; 10] = [
        InputAction::MoveForward,
        InputAction::MoveBackward,
        InputAction::MoveLeft,
        InputAction::MoveRight,
        InputAction::Jump,
        InputAction::Crouch,
        InputAction::Sprint,
        InputAction::Reload,
        InputAction::Fire,
        InputAction::Aim,
    ];
}

/// Physical control an action is bound to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InputBinding {
    /// Keyboard key by its layout-independent code, e.g. `"KeyW"`
    Key(String),
    /// Mouse button index (0 = left, 2 = right)
    Mouse(u8),
}

impl InputBinding {
    pub fn key(code: &str) -> Self {
        Self::Key(code.to_string())
    }
}

fn default_bindings() -> HashMap<InputAction, InputBinding> {
    HashMap::from([
        (InputAction::MoveForward, InputBinding::key("KeyW")),
        (InputAction::MoveBackward, InputBinding::key("KeyS")),
        (InputAction::MoveLeft, InputBinding::key("KeyA")),
        (InputAction::MoveRight, InputBinding::key("KeyD")),
        (InputAction::Jump, InputBinding::key("Space")),
        (InputAction::Crouch, InputBinding::key("KeyC")),
        (InputAction::Sprint, InputBinding::key("ShiftLeft")),
        (InputAction::Reload, InputBinding::key("KeyR")),
        (InputAction::Fire, InputBinding::Mouse(0)),
        (InputAction::Aim, InputBinding::Mouse(2)),
    ])
}

/// Current state of keyboard and mouse as reported by the platform layer
#[derive(Debug, Clone)]
pub struct InputState {
    keys: HashSet<String>,
    mouse_buttons: HashSet<u8>,
    look: LookDelta,
    mouse_sensitivity: f32,
    bindings: HashMap<InputAction, InputBinding>,
}

impl InputState {
    pub fn new() -> Self {
        Self {
            keys: HashSet::new(),
            mouse_buttons: HashSet::new(),
            look: LookDelta::default(),
            mouse_sensitivity: DEFAULT_MOUSE_SENSITIVITY,
            bindings: default_bindings(),
        }
    }

    pub fn with_sensitivity(mut self, sensitivity: f32) -> Self {
        self.mouse_sensitivity = sensitivity;
        self
    }

    pub fn key_down(&mut self, code: &str) {
        self.keys.insert(code.to_string());
    }

    pub fn key_up(&mut self, code: &str) {
        self.keys.remove(code);
    }

    pub fn mouse_down(&mut self, button: u8) {
        self.mouse_buttons.insert(button);
    }

    pub fn mouse_up(&mut self, button: u8) {
        self.mouse_buttons.remove(&button);
    }

    /// Accumulate pointer-locked mouse travel in pixels
    pub fn mouse_moved(&mut self, dx: f32, dy: f32) {
        self.look.yaw -= dx * self.mouse_sensitivity;
        self.look.pitch -= dy * self.mouse_sensitivity;
    }

    /// Press or release whatever the action is bound to
    pub fn set_action(&mut self, action: InputAction, pressed: bool) {
        let Some(binding) = self.bindings.get(&action).cloned() else {
            return;
        };
        match (binding, pressed) {
            (InputBinding::Key(code), true) => self.key_down(&code),
            (InputBinding::Key(code), false) => self.key_up(&code),
            (InputBinding::Mouse(button), true) => self.mouse_down(button),
            (InputBinding::Mouse(button), false) => self.mouse_up(button),
        }
    }

    pub fn is_action_pressed(&self, action: InputAction) -> bool {
        match self.bindings.get(&action) {
            Some(InputBinding::Key(code)) => self.keys.contains(code),
            Some(InputBinding::Mouse(button)) => self.mouse_buttons.contains(button),
            None => false,
        }
    }

    /// Bind `action` to a new control, returns the previous binding
    pub fn rebind(&mut self, action: InputAction, binding: InputBinding) -> Option<InputBinding> {
        self.bindings.insert(action, binding)
    }

    pub fn reset_bindings(&mut self) {
        self.bindings = default_bindings();
    }

    pub fn binding(&self, action: InputAction) -> Option<&InputBinding> {
        self.bindings.get(&action)
    }

    /// Look rotation accumulated since the last call, resetting it to zero
    pub fn take_look_delta(&mut self) -> LookDelta {
        std::mem::take(&mut self.look)
    }

    pub fn movement(&self) -> MovementFlags {
        MovementFlags {
            forward: self.is_action_pressed(InputAction::MoveForward),
            back: self.is_action_pressed(InputAction::MoveBackward),
            left: self.is_action_pressed(InputAction::MoveLeft),
            right: self.is_action_pressed(InputAction::MoveRight),
            jump: self.is_action_pressed(InputAction::Jump),
            crouch: self.is_action_pressed(InputAction::Crouch),
            sprint: self.is_action_pressed(InputAction::Sprint),
        }
    }

    pub fn actions(&self) -> ActionFlags {
        ActionFlags {
            fire: self.is_action_pressed(InputAction::Fire),
            reload: self.is_action_pressed(InputAction::Reload),
            aim: self.is_action_pressed(InputAction::Aim),
        }
    }
}

impl Default for InputState {
    fn default() -> Self {
        Self::new()
    }
}

/// Stamps captured input with a per-session sequence number and hands the
/// resulting command to the outbound queue.
///
/// The counter belongs to this instance; it only restarts through
/// [`InputSequencer::reset_session`].
#[derive(Debug)]
pub struct InputSequencer {
    session_id: Uuid,
    counter: u64,
    outbound: Option<mpsc::Sender<Command>>,
}

impl InputSequencer {
    pub fn new(session_id: Uuid, outbound: mpsc::Sender<Command>) -> Self {
        Self {
            session_id,
            counter: 0,
            outbound: Some(outbound),
        }
    }

    /// Sequencer with no network queue (local simulation, tests)
    pub fn detached(session_id: Uuid) -> Self {
        Self {
            session_id,
            counter: 0,
            outbound: None,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Sequence number of the last command handed out (0 before the first)
    pub fn last_sequence(&self) -> u64 {
        self.counter
    }

    /// Capture the current input stamped with wall-clock time
    pub fn capture(&mut self, input: &mut InputState) -> Command {
        self.capture_at(input, unix_millis_f64())
    }

    /// Capture the current input with an explicit send timestamp (ms)
    pub fn capture_at(&mut self, input: &mut InputState, timestamp: f64) -> Command {
        let look = input.take_look_delta();
        self.issue(input.movement(), look, input.actions(), timestamp)
    }

    /// Build and enqueue a command from already-decoded intent
    pub fn issue(
        &mut self,
        movement: MovementFlags,
        look_delta: LookDelta,
        actions: ActionFlags,
        timestamp: f64,
    ) -> Command {
        self.counter += 1;
        let command = Command {
            sequence: self.counter,
            timestamp,
            movement,
            look_delta,
            actions,
        };

        if let Some(outbound) = &self.outbound {
            match outbound.try_send(command) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        session_id = %self.session_id,
                        sequence = command.sequence,
                        "Outbound command queue full, dropping send"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(session_id = %self.session_id, "Outbound command queue closed");
                }
            }
        }

        command
    }

    /// Start a fresh session after a reconnect; numbering restarts at 1
    pub fn reset_session(&mut self, session_id: Uuid) {
        debug!(old = %self.session_id, new = %session_id, "Resetting input sequence");
        self.session_id = session_id;
        self.counter = 0;
    }

    /// Swap the outbound queue (new network link after reconnect)
    pub fn set_outbound(&mut self, outbound: mpsc::Sender<Command>) {
        self.outbound = Some(outbound);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_strictly_increasing() {
        let mut seq = InputSequencer::detached(Uuid::new_v4());
        let mut input = InputState::new();
        let mut last = 0;
        for i in 0..500 {
            let cmd = seq.capture_at(&mut input, i as f64);
            assert!(cmd.sequence > last);
            last = cmd.sequence;
        }
        assert_eq!(seq.last_sequence(), 500);
    }

    #[test]
    fn test_sequencers_do_not_share_counters() {
        let mut a = InputSequencer::detached(Uuid::new_v4());
        let mut b = InputSequencer::detached(Uuid::new_v4());
        let mut input = InputState::new();
        a.capture_at(&mut input, 0.0);
        a.capture_at(&mut input, 0.0);
        assert_eq!(b.capture_at(&mut input, 0.0).sequence, 1);
    }

    #[test]
    fn test_reset_session_restarts_numbering() {
        let mut seq = InputSequencer::detached(Uuid::new_v4());
        let mut input = InputState::new();
        seq.capture_at(&mut input, 0.0);
        let fresh = Uuid::new_v4();
        seq.reset_session(fresh);
        assert_eq!(seq.session_id(), fresh);
        assert_eq!(seq.capture_at(&mut input, 0.0).sequence, 1);
    }

    #[test]
    fn test_capture_reads_bindings_and_consumes_look() {
        let mut input = InputState::new();
        input.key_down("KeyW");
        input.key_down("ShiftLeft");
        input.mouse_down(0);
        input.mouse_moved(100.0, 0.0);

        let mut seq = InputSequencer::detached(Uuid::new_v4());
        let cmd = seq.capture_at(&mut input, 12.5);
        assert!(cmd.movement.forward && cmd.movement.sprint);
        assert!(cmd.actions.fire);
        assert!((cmd.look_delta.yaw + 0.2).abs() < 1e-6);
        assert_eq!(cmd.timestamp, 12.5);

        let next = seq.capture_at(&mut input, 13.0);
        assert_eq!(next.look_delta, LookDelta::default());
    }

    #[test]
    fn test_rebind_and_reset() {
        let mut input = InputState::new();
        let old = input.rebind(InputAction::Jump, InputBinding::key("KeyJ"));
        assert_eq!(old, Some(InputBinding::key("Space")));

        input.key_down("Space");
        assert!(!input.movement().jump);
        input.key_down("KeyJ");
        assert!(input.movement().jump);

        input.reset_bindings();
        assert_eq!(input.binding(InputAction::Jump), Some(&InputBinding::key("Space")));
    }

    #[test]
    fn test_capture_pushes_to_outbound_queue() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut seq = InputSequencer::new(Uuid::new_v4(), tx);
        let mut input = InputState::new();
        let sent = seq.capture_at(&mut input, 1.0);
        assert_eq!(rx.try_recv().ok(), Some(sent));
    }

    #[test]
    fn test_full_outbound_queue_does_not_stall_capture() {
        let (tx, _rx) = mpsc::channel(1);
        let mut seq = InputSequencer::new(Uuid::new_v4(), tx);
        let mut input = InputState::new();
        for _ in 0..10 {
            seq.capture_at(&mut input, 0.0);
        }
        assert_eq!(seq.last_sequence(), 10);
    }
}
