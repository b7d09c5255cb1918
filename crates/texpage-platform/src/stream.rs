//! Streams and Events
//!
//! A stream is an ordered queue of device work executed by a dedicated
//! service thread. Submission never blocks; completion is observed through
//! [`Event`]s, which block on a condition variable until the stream has
//! executed everything submitted before them.
//!
//! A failing command puts the stream into a sticky fault state: later kernels
//! and copies are skipped and every event wait reports the fault. Host
//! callbacks still run so that resources released by them are not leaked.

use std::fmt;
use std::sync::Arc;

use crossbeam::channel::{Receiver, Sender, unbounded};
use parking_lot::{Condvar, Mutex};

use crate::device::{Device, DevicePtr};
use crate::threading::Thread;
use crate::{DeviceError, DeviceResult};

type Command = Box<dyn FnOnce(&Device) -> DeviceResult<()> + Send + 'static>;

struct Submission {
    sequence: u64,
    name: &'static str,
    always_run: bool,
    command: Command,
}

#[derive(Default)]
struct Progress {
    submitted: u64,
    completed: u64,
    fault: Option<String>,
}

struct StreamShared {
    id: u64,
    progress: Mutex<Progress>,
    completed: Condvar,
}

struct StreamInner {
    shared: Arc<StreamShared>,
    device: Device,
    sender: Mutex<Option<Sender<Submission>>>,
    worker: Mutex<Option<Thread>>,
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        drop(self.sender.lock().take());
        if let Some(mut worker) = self.worker.lock().take() {
            worker.join();
        }
    }
}

/// Ordered asynchronous command queue. Cloning shares the same stream.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream").field("id", &self.id()).finish()
    }
}

impl Stream {
    pub(crate) fn new(device: Device, id: u64) -> DeviceResult<Self> {
        let shared = Arc::new(StreamShared {
            id,
            progress: Mutex::new(Progress::default()),
            completed: Condvar::new(),
        });
        let (sender, receiver) = unbounded();

        let worker = {
            let shared = shared.clone();
            let device = device.clone();
            Thread::spawn(format!("texpage-stream-{id}"), move || {
                run_stream(&shared, &device, receiver)
            })?
        };

        Ok(Self {
            inner: Arc::new(StreamInner {
                shared,
                device,
                sender: Mutex::new(Some(sender)),
                worker: Mutex::new(Some(worker)),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.shared.id
    }

    /// Device this stream executes on
    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    fn submit(&self, name: &'static str, always_run: bool, command: Command) -> DeviceResult<()> {
        let sender = self.inner.sender.lock();
        let sender = sender.as_ref().ok_or(DeviceError::StreamClosed(self.id()))?;

        let sequence = {
            let mut progress = self.inner.shared.progress.lock();
            progress.submitted += 1;
            progress.submitted
        };
        sender
            .send(Submission {
                sequence,
                name,
                always_run,
                command,
            })
            .map_err(|_| DeviceError::StreamClosed(self.id()))
    }

    /// Enqueue a device-side function
    pub fn launch<F>(&self, name: &'static str, kernel: F) -> DeviceResult<()>
    where
        F: FnOnce(&Device) -> DeviceResult<()> + Send + 'static,
    {
        self.submit(name, false, Box::new(kernel))
    }

    /// Enqueue a host callback that runs once all prior work has executed
    pub fn launch_host_func<F>(&self, f: F) -> DeviceResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(
            "host_func",
            true,
            Box::new(move |_| {
                f();
                Ok(())
            }),
        )
    }

    /// Enqueue an asynchronous copy of `data` into device memory
    pub fn memcpy_htod_async(&self, dst: DevicePtr, data: Vec<u8>) -> DeviceResult<()> {
        self.launch("memcpy_htod", move |device| device.write_bytes(dst, &data))
    }

    /// Enqueue an asynchronous fill of device memory
    pub fn memset_async(&self, dst: DevicePtr, value: u8, len: usize) -> DeviceResult<()> {
        self.launch("memset", move |device| device.fill(dst, len, value))
    }

    /// Record an event that completes once all currently submitted work has executed
    pub fn record_event(&self) -> Event {
        let _sender = self.inner.sender.lock();
        let sequence = self.inner.shared.progress.lock().submitted;
        Event {
            shared: self.inner.shared.clone(),
            sequence,
        }
    }

    /// Block until all submitted work has executed
    pub fn synchronize(&self) -> DeviceResult<()> {
        self.record_event().synchronize()
    }

    /// Sticky fault message, if a command on this stream has failed
    pub fn fault(&self) -> Option<String> {
        self.inner.shared.progress.lock().fault.clone()
    }
}

fn run_stream(shared: &StreamShared, device: &Device, receiver: Receiver<Submission>) {
    for submission in receiver.iter() {
        let faulted = shared.progress.lock().fault.is_some();
        if submission.always_run || !faulted {
            if let Err(err) = (submission.command)(device) {
                log::error!("stream {}: '{}' failed: {}", shared.id, submission.name, err);
                let mut progress = shared.progress.lock();
                progress.fault.get_or_insert_with(|| err.to_string());
            }
        } else {
            log::debug!(
                "stream {}: skipping '{}' after earlier fault",
                shared.id,
                submission.name
            );
        }

        let mut progress = shared.progress.lock();
        progress.completed = submission.sequence;
        shared.completed.notify_all();
    }
}

/// Marker in a stream's command sequence
#[derive(Clone)]
pub struct Event {
    shared: Arc<StreamShared>,
    sequence: u64,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("stream", &self.shared.id)
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl Event {
    /// True once the stream has executed everything before this event
    pub fn query(&self) -> bool {
        self.shared.progress.lock().completed >= self.sequence
    }

    /// Block until the event completes
    pub fn synchronize(&self) -> DeviceResult<()> {
        let mut progress = self.shared.progress.lock();
        while progress.completed < self.sequence {
            self.shared.completed.wait(&mut progress);
        }
        match &progress.fault {
            Some(message) => Err(DeviceError::StreamFault {
                stream: self.shared.id,
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceCapabilities;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_commands_execute_in_order() {
        let device = Device::new(DeviceCapabilities::default());
        let stream = device.create_stream().unwrap();
        let ptr = device.alloc(4).unwrap();

        for value in 1u32..=50 {
            stream
                .launch("store", move |device| device.write_value(ptr, &value))
                .unwrap();
        }
        stream.synchronize().unwrap();
        assert_eq!(device.read_value::<u32>(ptr).unwrap(), 50);
    }

    #[test]
    fn test_memcpy_and_memset() {
        let device = Device::new(DeviceCapabilities::default());
        let stream = device.create_stream().unwrap();
        let ptr = device.alloc(8).unwrap();

        stream.memcpy_htod_async(ptr, vec![7; 8]).unwrap();
        stream.memset_async(ptr.offset(4), 0, 4).unwrap();
        stream.synchronize().unwrap();

        assert_eq!(device.read_vec::<u8>(ptr, 8).unwrap(), vec![7, 7, 7, 7, 0, 0, 0, 0]);
    }

    #[test]
    fn test_event_waits_for_prior_work() {
        let device = Device::new(DeviceCapabilities::default());
        let stream = device.create_stream().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        stream
            .launch_host_func(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let event = stream.record_event();
        event.synchronize().unwrap();

        assert!(event.query());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fault_is_sticky_but_host_funcs_run() {
        let device = Device::new(DeviceCapabilities::default());
        let stream = device.create_stream().unwrap();
        let ptr = device.alloc(4).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        stream
            .memcpy_htod_async(DevicePtr(1), vec![0; 4])
            .unwrap();
        stream
            .launch("store", move |device| device.write_value(ptr, &9u32))
            .unwrap();
        let r = ran.clone();
        stream
            .launch_host_func(move || {
                r.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert!(matches!(stream.synchronize(), Err(DeviceError::StreamFault { .. })));
        assert!(stream.fault().is_some());
        assert_eq!(device.read_value::<u32>(ptr).unwrap(), 0);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stream_dropped_from_own_callback() {
        let device = Device::new(DeviceCapabilities::default());
        let stream = device.create_stream().unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        let captured = stream.clone();
        let d = done.clone();
        stream
            .launch_host_func(move || {
                let _keep = captured;
                d.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let event = stream.record_event();
        drop(stream);

        event.synchronize().unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
