//! Progress notifications for long-running requests.
//!
//! Notifications are interleaved with the request's own traffic on the same
//! channel. Positional updates are rate limited; pulse mode instead sends a
//! heartbeat from a background thread until the operation ends. A request
//! uses one mode or the other, never both.

use crate::transport::SharedWriter;
use guestd_proto::{Progress, ProtoError};
use std::cell::{Cell, RefCell};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Nothing is sent for operations that finish sooner than this.
pub const INITIAL_DELAY: Duration = Duration::from_secs(2);
/// Minimum gap between two positional notifications.
pub const PERIOD: Duration = Duration::from_millis(333);
pub const PULSE_PERIOD: Duration = Duration::from_secs(1);

struct Pulse {
    stop: Sender<()>,
    thread: JoinHandle<u64>,
}

pub struct ProgressNotifier {
    writer: SharedWriter,
    proc_nr: u32,
    serial: u32,
    started: Instant,
    last_sent: Cell<Option<Instant>>,
    count: Cell<u64>,
    pulse: RefCell<Option<Pulse>>,
    delay: Duration,
    pulse_period: Duration,
}

impl ProgressNotifier {
    pub fn new(writer: SharedWriter, proc_nr: i32, serial: u32) -> Self {
        Self {
            writer,
            proc_nr: proc_nr as u32,
            serial,
            started: Instant::now(),
            last_sent: Cell::new(None),
            count: Cell::new(0),
            pulse: RefCell::new(None),
            delay: INITIAL_DELAY,
            pulse_period: PULSE_PERIOD,
        }
    }

    #[cfg(test)]
    fn with_timing(mut self, delay: Duration, pulse_period: Duration) -> Self {
        self.delay = delay;
        self.pulse_period = pulse_period;
        self
    }

    fn record(&self, position: u64, total: u64) -> Progress {
        Progress {
            proc_nr: self.proc_nr,
            serial: self.serial,
            position,
            total,
        }
    }

    /// Report `position` out of `total`. Cheap to call on every chunk.
    pub fn notify_progress(&self, position: u64, total: u64) -> Result<(), ProtoError> {
        self.notify_progress_at(position, total, Instant::now())
    }

    fn notify_progress_at(&self, position: u64, total: u64, now: Instant) -> Result<(), ProtoError> {
        if self.pulse.borrow().is_some() {
            return Ok(());
        }

        // The final notification goes out only if earlier ones did, so that
        // quick operations stay silent.
        let finished = position == total;
        let due = if finished {
            self.count.get() > 0
        } else {
            now.duration_since(self.started) >= self.delay
                && self
                    .last_sent
                    .get()
                    .is_none_or(|last| now.duration_since(last) >= PERIOD)
        };
        if !due {
            return Ok(());
        }

        self.writer.send_progress(&self.record(position, total))?;
        self.last_sent.set(Some(now));
        self.count.set(self.count.get() + 1);
        Ok(())
    }

    /// Start sending heartbeats for an operation of unknown length.
    pub fn pulse_start(&self) {
        let mut pulse = self.pulse.borrow_mut();
        if pulse.is_some() {
            return;
        }

        let (stop, stopped) = mpsc::channel::<()>();
        let writer = self.writer.clone();
        let beat = self.record(0, 1);
        let delay = self.delay;
        let period = self.pulse_period;

        let thread = std::thread::spawn(move || {
            let mut sent = 0u64;
            let mut wait = delay;
            loop {
                match stopped.recv_timeout(wait) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(e) = writer.send_progress(&beat) {
                            tracing::warn!("Progress pulse stopped: {}", e);
                            break;
                        }
                        sent += 1;
                        wait = period;
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            sent
        });

        *pulse = Some(Pulse { stop, thread });
    }

    fn stop_pulse(&self) -> u64 {
        match self.pulse.borrow_mut().take() {
            Some(Pulse { stop, thread }) => {
                let _ = stop.send(());
                thread.join().unwrap_or(0)
            }
            None => 0,
        }
    }

    /// Stop heartbeats after a successful operation, marking it complete.
    pub fn pulse_end(&self) -> Result<(), ProtoError> {
        if self.stop_pulse() > 0 {
            self.writer.send_progress(&self.record(1, 1))?;
        }
        Ok(())
    }

    /// Stop heartbeats on a failure path. Sends nothing.
    pub fn pulse_cancel(&self) {
        self.stop_pulse();
    }
}

impl Drop for ProgressNotifier {
    fn drop(&mut self) {
        self.stop_pulse();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guestd_proto::{PROGRESS_FLAG, PROGRESS_MESSAGE_SIZE};
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Capture {
        fn records(&self) -> Vec<Progress> {
            let bytes = self.0.lock().unwrap();
            bytes
                .chunks(4 + PROGRESS_MESSAGE_SIZE)
                .map(|frame| {
                    assert_eq!(&frame[..4], &PROGRESS_FLAG.to_be_bytes());
                    Progress::from_bytes(&frame[4..]).unwrap()
                })
                .collect()
        }
    }

    fn notifier() -> (Capture, ProgressNotifier) {
        let capture = Capture::default();
        let notifier = ProgressNotifier::new(SharedWriter::new(capture.clone()), 24, 9);
        (capture, notifier)
    }

    #[test]
    fn test_quick_operation_is_silent() {
        let (capture, notifier) = notifier();
        let t0 = notifier.started;
        for i in 1..=100 {
            notifier
                .notify_progress_at(i, 100, t0 + Duration::from_millis(i))
                .unwrap();
        }
        assert!(capture.records().is_empty());
    }

    #[test]
    fn test_rate_limited_after_initial_delay() {
        let (capture, notifier) = notifier();
        let t0 = notifier.started;

        // One call every 10ms for 4 seconds.
        for i in 0..400u64 {
            notifier
                .notify_progress_at(i, 400, t0 + Duration::from_millis(i * 10))
                .unwrap();
        }
        notifier
            .notify_progress_at(400, 400, t0 + Duration::from_millis(4000))
            .unwrap();

        let records = capture.records();
        // Roughly three per second over the two seconds after the delay,
        // plus the final one.
        assert!(records.len() >= 6 && records.len() <= 8, "{}", records.len());
        assert_eq!(records[0].position, 200);
        let last = records.last().unwrap();
        assert_eq!((last.position, last.total), (400, 400));
        assert!(records.iter().all(|p| p.proc_nr == 24 && p.serial == 9));
    }

    #[test]
    fn test_pulse_mode() {
        let capture = Capture::default();
        let notifier = ProgressNotifier::new(SharedWriter::new(capture.clone()), 16, 3)
            .with_timing(Duration::from_millis(10), Duration::from_millis(10));

        notifier.pulse_start();
        std::thread::sleep(Duration::from_millis(100));
        // Positional updates are ignored while pulsing.
        notifier.notify_progress(5, 10).unwrap();
        notifier.pulse_end().unwrap();

        let records = capture.records();
        assert!(records.len() >= 2);
        let (last, beats) = records.split_last().unwrap();
        assert!(beats.iter().all(|p| (p.position, p.total) == (0, 1)));
        assert_eq!((last.position, last.total), (1, 1));
    }

    #[test]
    fn test_pulse_cancel_sends_no_completion() {
        let (capture, notifier) = notifier();
        notifier.pulse_start();
        notifier.pulse_cancel();
        assert!(capture.records().is_empty());
        // Ending an already stopped pulse is a no-op.
        notifier.pulse_end().unwrap();
        assert!(capture.records().is_empty());
    }
}
