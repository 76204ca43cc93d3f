//! Async File Writer (spec §4.C): a dedicated worker thread draining a FIFO
//! of (converted buffer, destination path) pairs, the same shape as the
//! teacher's `CameraArrayController::start` image-writer thread
//! (`for payload in device_channel_rx { ... }`), but with a single
//! persistent worker and an explicit pending counter + condvar so
//! `await_drain` can block synchronously rather than fire-and-forget.

use crate::devices::hardware::camera::{ConvertedFrame, DeviceHandle};
use crate::types::OutputFormat;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use tracing::{error, warn};

struct WriteJob {
    frame: ConvertedFrame,
    path: PathBuf,
    format: OutputFormat,
}

/// Single background worker that saves converted frames to disk, overlapping
/// I/O with acquisition.
pub struct FileWriter {
    sender: Mutex<Option<mpsc::Sender<WriteJob>>>,
    pending: Arc<(Mutex<usize>, Condvar)>,
    stop_requested: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FileWriter {
    pub fn start() -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<WriteJob>();
        let pending = Arc::new((Mutex::new(0usize), Condvar::new()));
        let stop_requested = Arc::new(AtomicBool::new(false));

        let worker_pending = pending.clone();
        let worker = std::thread::spawn(move || {
            for job in rx {
                if let Err(e) = DeviceHandle::save_to(&job.frame, &job.path, job.format) {
                    error!(path = %job.path.display(), error = %e, "file writer save failed");
                }
                let (lock, cvar) = &*worker_pending;
                let mut pending = lock.lock().expect("file writer pending counter poisoned");
                *pending -= 1;
                cvar.notify_all();
            }
        });

        Arc::new(Self {
            sender: Mutex::new(Some(tx)),
            pending,
            stop_requested,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Non-blocking: hand a converted frame and its destination path to the
    /// writer. Returns immediately after incrementing the pending counter.
    /// A frame with zero-area dimensions or an empty path is rejected
    /// without incrementing the counter (spec §4.C).
    pub fn enqueue(&self, frame: ConvertedFrame, path: PathBuf, format: OutputFormat) {
        if frame.image.width() == 0 || frame.image.height() == 0 {
            warn!("file writer rejected a null/empty buffer");
            return;
        }
        if path.as_os_str().is_empty() {
            warn!("file writer rejected an empty destination path");
            return;
        }
        if self.stop_requested.load(Ordering::Relaxed) {
            warn!(path = %path.display(), "file writer rejected enqueue after shutdown was requested");
            return;
        }

        let guard = self.sender.lock().expect("file writer sender poisoned");
        let Some(sender) = guard.as_ref() else {
            warn!(path = %path.display(), "file writer rejected enqueue after shutdown");
            return;
        };

        {
            let (lock, _) = &*self.pending;
            *lock.lock().expect("file writer pending counter poisoned") += 1;
        }

        if sender.send(WriteJob { frame, path, format }).is_err() {
            // Worker already gone; undo the increment so await_drain doesn't hang.
            let (lock, cvar) = &*self.pending;
            let mut pending = lock.lock().expect("file writer pending counter poisoned");
            *pending -= 1;
            cvar.notify_all();
        }
    }

    /// Block until the pending counter is zero.
    pub fn await_drain(&self) {
        let (lock, cvar) = &*self.pending;
        let guard = lock.lock().expect("file writer pending counter poisoned");
        let _ = cvar.wait_while(guard, |pending| *pending > 0);
    }

    pub fn pending_count(&self) -> usize {
        *self.pending.0.lock().expect("file writer pending counter poisoned")
    }

    /// Signal stop, drain the queue, and join the worker thread.
    pub fn shutdown(&self) {
        self.stop_requested.store(true, Ordering::Relaxed);
        // Dropping the sender lets the worker's `for job in rx` loop end
        // once every already-enqueued job has been processed.
        self.sender.lock().expect("file writer sender poisoned").take();
        self.await_drain();
        if let Some(handle) = self.worker.lock().expect("file writer worker poisoned").take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, RgbImage};

    fn sample_frame(w: u32, h: u32) -> ConvertedFrame {
        ConvertedFrame {
            image: DynamicImage::ImageRgb8(RgbImage::new(w, h)),
        }
    }

    #[test]
    fn enqueue_is_non_blocking_and_drains() {
        let writer = FileWriter::start();
        let dir = tempfile::tempdir().expect("tempdir");
        for i in 0..3 {
            let path = dir.path().join(format!("frame_{i}.png"));
            writer.enqueue(sample_frame(4, 4), path, OutputFormat::Png);
        }
        writer.await_drain();
        assert_eq!(writer.pending_count(), 0);
        writer.shutdown();
    }

    #[test]
    fn empty_path_is_rejected_without_incrementing_pending() {
        let writer = FileWriter::start();
        writer.enqueue(sample_frame(4, 4), PathBuf::new(), OutputFormat::Png);
        assert_eq!(writer.pending_count(), 0);
        writer.shutdown();
    }

    #[test]
    fn zero_area_buffer_is_rejected() {
        let writer = FileWriter::start();
        writer.enqueue(sample_frame(0, 0), PathBuf::from("/tmp/x.png"), OutputFormat::Png);
        assert_eq!(writer.pending_count(), 0);
        writer.shutdown();
    }
}
