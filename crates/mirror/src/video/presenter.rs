//! Latest-frame-wins hand-off to the draw callback
//!
//! The decoder never waits for the surface: publishing replaces whatever
//! frame has not been drawn yet. A dedicated thread takes frames out of the
//! slot and calls the draw callback.

use crate::video::frame::{DecodedFrame, DrawCallback};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use tracing::debug;

#[derive(Default)]
struct Slot {
    frame: Option<DecodedFrame>,
    closed: bool,
}

/// Single-frame mailbox between decode and presentation
#[derive(Default)]
pub struct LatestFrame {
    slot: Mutex<Slot>,
    ready: Condvar,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `frame`, returning the undrawn frame it replaced
    pub fn publish(&self, frame: DecodedFrame) -> Option<DecodedFrame> {
        let mut slot = self.lock();
        if slot.closed {
            return Some(frame);
        }
        let replaced = slot.frame.replace(frame);
        self.ready.notify_one();
        replaced
    }

    /// Wait for the next frame; `None` once closed and empty
    pub fn take(&self) -> Option<DecodedFrame> {
        let mut slot = self.lock();
        loop {
            if let Some(frame) = slot.frame.take() {
                return Some(frame);
            }
            if slot.closed {
                return None;
            }
            slot = self
                .ready
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Stop accepting frames; a pending frame is still handed out
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    /// Stop accepting frames and drop the pending one
    pub fn discard(&self) {
        let mut slot = self.lock();
        slot.closed = true;
        slot.frame = None;
        self.ready.notify_all();
    }
}

/// Run `draw` for every frame taken from `slot` on a `frame-presenter` thread
///
/// `on_presented` runs after each draw. The thread exits once the slot is
/// closed and empty.
pub fn spawn_presenter(
    slot: std::sync::Arc<LatestFrame>,
    draw: DrawCallback,
    on_presented: impl Fn(&DecodedFrame) + Send + 'static,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("frame-presenter".to_string())
        .spawn(move || {
            while let Some(frame) = slot.take() {
                draw(&frame);
                on_presented(&frame);
            }
            debug!("Frame presenter stopped");
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn frame(index: u64) -> DecodedFrame {
        DecodedFrame {
            width: 1,
            height: 1,
            pixels: vec![0, 0, 0, 255],
            timestamp: None,
            index,
        }
    }

    #[test]
    fn test_publish_replaces_undrawn_frame() {
        let slot = LatestFrame::new();
        assert!(slot.publish(frame(0)).is_none());
        assert_eq!(slot.publish(frame(1)).map(|f| f.index), Some(0));
        assert_eq!(slot.take().map(|f| f.index), Some(1));
        slot.close();
        assert!(slot.take().is_none());
    }

    #[test]
    fn test_close_hands_out_pending_frame() {
        let slot = LatestFrame::new();
        slot.publish(frame(4));
        slot.close();
        assert_eq!(slot.take().map(|f| f.index), Some(4));
        assert!(slot.take().is_none());
        // Publishing after close is refused
        assert!(slot.publish(frame(5)).is_some());
    }

    #[test]
    fn test_discard_wakes_waiter() {
        let slot = Arc::new(LatestFrame::new());
        let waiter = {
            let slot = Arc::clone(&slot);
            std::thread::spawn(move || slot.take())
        };
        std::thread::sleep(Duration::from_millis(20));
        slot.discard();
        assert!(waiter.join().unwrap().is_none());
    }

    #[test]
    fn test_presenter_draws_and_exits() {
        let slot = Arc::new(LatestFrame::new());
        let drawn = Arc::new(Mutex::new(Vec::new()));
        let draw: DrawCallback = {
            let drawn = Arc::clone(&drawn);
            Arc::new(move |f: &DecodedFrame| drawn.lock().unwrap().push(f.index))
        };
        let handle = spawn_presenter(Arc::clone(&slot), draw, |_| {}).unwrap();

        slot.publish(frame(7));
        slot.close();
        handle.join().unwrap();
        assert_eq!(*drawn.lock().unwrap(), vec![7]);
    }
}
