//! Forwards window input events to the shared camera.
//!
//! The adapter owns a handle to the one [`CameraState`] instance instead of
//! reaching for a global, so callbacks registered with a windowing library can
//! capture it directly.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::camera::{CameraState, MoveDirection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    W,
    A,
    S,
    D,
    Other,
}

impl Key {
    pub fn movement(self) -> Option<MoveDirection> {
        match self {
            Key::W => Some(MoveDirection::Forward),
            Key::S => Some(MoveDirection::Backward),
            Key::A => Some(MoveDirection::Left),
            Key::D => Some(MoveDirection::Right),
            Key::Other => None,
        }
    }
}

pub struct InputAdapter {
    camera: Arc<CameraState>,
    held: Mutex<HashSet<Key>>,
}

impl InputAdapter {
    pub fn new(camera: Arc<CameraState>) -> Self {
        Self {
            camera,
            held: Mutex::new(HashSet::new()),
        }
    }

    pub fn camera(&self) -> &Arc<CameraState> {
        &self.camera
    }

    pub fn cursor_moved(&self, x: f64, y: f64) {
        self.camera.on_cursor_moved(x, y);
    }

    pub fn key_changed(&self, key: Key, pressed: bool) {
        if key.movement().is_none() {
            return;
        }
        let mut held = self.held.lock();
        if pressed {
            held.insert(key);
        } else {
            held.remove(&key);
        }
    }

    pub fn is_held(&self, key: Key) -> bool {
        self.held.lock().contains(&key)
    }

    /// Moves the camera one step for every held movement key. Call once per frame.
    pub fn apply_held_keys(&self) {
        let directions: Vec<MoveDirection> =
            self.held.lock().iter().filter_map(|k| k.movement()).collect();
        for direction in directions {
            self.camera.on_move_command(direction);
        }
    }
}
