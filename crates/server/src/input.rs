use anyhow::Result;
use periscope_protocol::KeyEvent;
use tracing::debug;

/// Keyboard injection backend.
pub trait Keyboard: Send {
    fn key(&mut self, event: &KeyEvent) -> Result<()>;
}

/// Multi-touch gesture, reported by trackpads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Gesture {
    Pinch { scale: f64 },
    Rotate { degrees: f64 },
    Swipe { dx: f64, dy: f64 },
}

/// Pointer injection backend. Coordinates are in captured-frame pixels.
pub trait Mouse: Send {
    fn move_to(&mut self, x: i32, y: i32) -> Result<()>;

    /// `button` follows `MouseEvent.button`: 0 left, 1 middle, 2 right.
    fn button(&mut self, button: u8, x: i32, y: i32, down: bool) -> Result<()>;

    fn wheel(&mut self, dx: f64, dy: f64, dz: f64) -> Result<()>;

    /// Backends without gesture support ignore these.
    fn gesture(&mut self, _gesture: &Gesture) -> Result<()> {
        Ok(())
    }
}

/// Keyboard that only records events in the log.
#[derive(Debug, Default)]
pub struct LoggingKeyboard {
    events: u64,
}

impl Keyboard for LoggingKeyboard {
    fn key(&mut self, event: &KeyEvent) -> Result<()> {
        self.events += 1;
        debug!(
            key = %event.key,
            code = %event.code,
            location = ?event.location,
            down = event.key_down,
            "Key event"
        );
        Ok(())
    }
}

/// Mouse that tracks pointer state and logs every event.
#[derive(Debug, Default)]
pub struct LoggingMouse {
    position: (i32, i32),
    /// Bit N set while button N is held
    buttons: u32,
}

impl LoggingMouse {
    #[cfg(test)]
    pub fn position(&self) -> (i32, i32) {
        self.position
    }

    #[cfg(test)]
    pub fn is_pressed(&self, button: u8) -> bool {
        button < 32 && self.buttons & (1 << button) != 0
    }
}

impl Mouse for LoggingMouse {
    fn move_to(&mut self, x: i32, y: i32) -> Result<()> {
        self.position = (x, y);
        debug!(x, y, "Mouse move");
        Ok(())
    }

    fn button(&mut self, button: u8, x: i32, y: i32, down: bool) -> Result<()> {
        if button >= 32 {
            anyhow::bail!("mouse button {button} out of range");
        }
        self.position = (x, y);
        if down {
            self.buttons |= 1 << button;
        } else {
            self.buttons &= !(1 << button);
        }
        debug!(button, x, y, down, held = self.buttons, "Mouse button");
        Ok(())
    }

    fn wheel(&mut self, dx: f64, dy: f64, dz: f64) -> Result<()> {
        let (x, y) = self.position;
        debug!(dx, dy, dz, x, y, "Mouse wheel");
        Ok(())
    }
}
