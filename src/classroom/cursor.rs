/// Smallest positional change worth sending
pub const MIN_CURSOR_DELTA: f64 = 2.0;

/// Coalesces pointer moves between flushes, keeping only the latest position.
#[derive(Debug, Default)]
pub struct CursorThrottle {
    last_sent: Option<(f64, f64)>,
    pending: Option<(f64, f64)>,
}

impl CursorThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a position. Moves closer than [`MIN_CURSOR_DELTA`] to the last
    /// sent position on both axes are dropped.
    pub fn offer(&mut self, x: f64, y: f64) -> bool {
        if let Some((lx, ly)) = self.last_sent {
            if (x - lx).abs() < MIN_CURSOR_DELTA && (y - ly).abs() < MIN_CURSOR_DELTA {
                return false;
            }
        }
        self.pending = Some((x, y));
        true
    }

    /// Position to send on this flush, if any
    pub fn take_pending(&mut self) -> Option<(f64, f64)> {
        let next = self.pending.take()?;
        self.last_sent = Some(next);
        Some(next)
    }

    pub fn reset(&mut self) {
        self.last_sent = None;
        self.pending = None;
    }
}
