//! FIFO between the sensor callback and the capture loop
//!
//! The engine pushes from its own delivery thread; the capture loop pops
//! from the main thread. The channel is the only state the two share.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use crate::core::error::{CaptureError, Result};
use crate::engine::{RawImage, SensorCallback};

pub struct FrameQueue {
    tx: Sender<RawImage>,
    rx: Receiver<RawImage>,
}

impl FrameQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// Callback that enqueues every delivered image
    pub fn callback(&self) -> SensorCallback {
        let tx = self.tx.clone();
        Box::new(move |image| {
            // Only fails once the queue itself is gone, at which point
            // nobody is waiting for the frame anyway
            let _ = tx.send(image);
        })
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Drop everything queued so far; returns how many images were dropped
    pub fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }

    /// Block for the next image, `None` if none arrived within `timeout`
    pub fn pop(&self, timeout: Duration) -> Result<Option<RawImage>> {
        match self.rx.recv_timeout(timeout) {
            Ok(image) => Ok(Some(image)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(CaptureError::SensorDisconnected),
        }
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn image(frame: u64) -> RawImage {
        RawImage {
            frame,
            width: 1,
            height: 1,
            data: vec![0, 0, 0, 255],
        }
    }

    #[test]
    fn test_fifo_order_across_threads() {
        let queue = FrameQueue::new();
        let callback = queue.callback();

        let producer = thread::spawn(move || {
            for frame in 0..100 {
                callback(image(frame));
            }
        });
        producer.join().unwrap();

        for expected in 0..100 {
            let got = queue.pop(Duration::from_secs(1)).unwrap().unwrap();
            assert_eq!(got.frame, expected);
        }
    }

    #[test]
    fn test_clear_drops_pending() {
        let queue = FrameQueue::new();
        let callback = queue.callback();
        callback(image(1));
        callback(image(2));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_times_out() {
        let queue = FrameQueue::new();
        assert!(queue.pop(Duration::from_millis(10)).unwrap().is_none());
    }
}
