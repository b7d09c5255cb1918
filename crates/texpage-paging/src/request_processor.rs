//! Request Processor
//!
//! Worker pool that turns page misses reported by the device into fill
//! callbacks. Requests for a page already being filled are not queued again;
//! their tickets are attached to the fill in flight.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use ahash::AHashMap;
use crossbeam::deque::{Injector, Steal};
use parking_lot::{Condvar, Mutex};
use smallvec::{SmallVec, smallvec};
use texpage_platform::{Stream, Stopwatch, Thread, TimeAccumulator, threading};

use crate::page_table::PageTableManager;
use crate::ticket::Ticket;
use crate::{PagingError, PagingResult};

/// Result of a fill callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    /// The page is resident once the next mappings are pushed
    Filled,
    /// No storage was available; the page stays non-resident and will be requested again
    Deferred,
}

/// Owner of a page range. Called from worker threads.
pub trait RequestHandler: Send + Sync {
    /// Make `page_id` resident, issuing device work on `stream`
    fn fill_request(&self, stream: &Stream, page_id: u32) -> PagingResult<FillOutcome>;

    fn name(&self) -> &str {
        "request handler"
    }
}

struct PageRequest {
    page_id: u32,
    stream: Stream,
}

#[derive(Default)]
struct FillCounters {
    filled: AtomicU64,
    deferred: AtomicU64,
    failed: AtomicU64,
}

struct ProcessorShared {
    queue: Injector<PageRequest>,
    /// Requests pushed but not yet taken by a worker
    pending: Mutex<usize>,
    available: Condvar,
    shutdown: AtomicBool,
    in_flight: Mutex<AHashMap<u32, SmallVec<[Ticket; 2]>>>,
    tickets: Mutex<AHashMap<u32, Ticket>>,
    page_table: Arc<Mutex<PageTableManager>>,
    processing_time: TimeAccumulator,
    counters: FillCounters,
}

impl ProcessorShared {
    fn next_request(&self) -> Option<PageRequest> {
        {
            let mut pending = self.pending.lock();
            loop {
                if self.shutdown.load(Ordering::Acquire) {
                    return None;
                }
                if *pending > 0 {
                    *pending -= 1;
                    break;
                }
                self.available.wait(&mut pending);
            }
        }
        self.steal()
    }

    fn steal(&self) -> Option<PageRequest> {
        loop {
            match self.queue.steal() {
                Steal::Success(request) => return Some(request),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    fn process(&self, request: PageRequest) {
        let page_id = request.page_id;
        let span = tracing::debug_span!("fill_request", page_id);
        let _enter = span.enter();

        // The handler runs without the page table lock; it may reserve pages itself
        let handler = self.page_table.lock().request_handler(page_id);
        let stopwatch = Stopwatch::new();
        let result = match handler {
            Some(handler) => handler.fill_request(&request.stream, page_id),
            None => Err(PagingError::UnknownPage(page_id)),
        };
        self.processing_time.record(stopwatch.elapsed());

        match result {
            Ok(FillOutcome::Filled) => {
                self.counters.filled.fetch_add(1, Ordering::Relaxed);
                log::trace!("filled page {}", page_id);
            }
            Ok(FillOutcome::Deferred) => {
                self.counters.deferred.fetch_add(1, Ordering::Relaxed);
                log::debug!("deferred page {}: no tile memory available", page_id);
            }
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                log::error!("failed to fill page {}: {}", page_id, err);
            }
        }
        self.complete(page_id);
    }

    fn complete(&self, page_id: u32) {
        let tickets = self.in_flight.lock().remove(&page_id).unwrap_or_default();
        for ticket in tickets {
            ticket.notify();
        }
    }
}

/// Worker pool processing page requests
pub struct RequestProcessor {
    shared: Arc<ProcessorShared>,
    workers: Mutex<Vec<Thread>>,
}

impl fmt::Debug for RequestProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestProcessor")
            .field("workers", &self.workers.lock().len())
            .field("in_flight", &self.num_in_flight())
            .finish()
    }
}

impl RequestProcessor {
    /// Create a processor resolving handlers through `page_table`. No worker runs until [`Self::start`].
    pub fn new(page_table: Arc<Mutex<PageTableManager>>) -> Self {
        Self {
            shared: Arc::new(ProcessorShared {
                queue: Injector::new(),
                pending: Mutex::new(0),
                available: Condvar::new(),
                shutdown: AtomicBool::new(false),
                in_flight: Mutex::new(AHashMap::new()),
                tickets: Mutex::new(AHashMap::new()),
                page_table,
                processing_time: TimeAccumulator::new(),
                counters: FillCounters::default(),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn worker threads; 0 uses one per core
    pub fn start(&self, num_threads: usize) -> PagingResult<()> {
        let num_threads = if num_threads == 0 {
            threading::default_worker_count()
        } else {
            num_threads
        };

        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return Ok(());
        }
        self.shared.shutdown.store(false, Ordering::Release);
        for index in 0..num_threads {
            let shared = self.shared.clone();
            workers.push(Thread::spawn(format!("texpage-request-{index}"), move || {
                while let Some(request) = shared.next_request() {
                    shared.process(request);
                }
            })?);
        }
        log::info!("started {} request workers", num_threads);
        Ok(())
    }

    /// Stop the workers. Requests still queued are dropped and their tickets completed.
    pub fn stop(&self) {
        {
            let _pending = self.shared.pending.lock();
            self.shared.shutdown.store(true, Ordering::Release);
            self.shared.available.notify_all();
        }
        let mut workers = std::mem::take(&mut *self.workers.lock());
        for worker in &mut workers {
            worker.join();
        }

        let mut dropped = 0;
        while let Some(request) = self.shared.steal() {
            self.shared.complete(request.page_id);
            dropped += 1;
        }
        *self.shared.pending.lock() = 0;
        if dropped > 0 {
            log::debug!("dropped {} queued page requests on shutdown", dropped);
        }
    }

    /// Register the ticket that tracks the requests of launch `launch_id`
    pub fn set_ticket(&self, launch_id: u32, ticket: Ticket) {
        self.shared.tickets.lock().insert(launch_id, ticket);
    }

    /// Queue the pages requested by a launch
    pub fn add_requests(&self, stream: &Stream, launch_id: u32, pages: &[u32]) {
        let ticket = self
            .shared
            .tickets
            .lock()
            .remove(&launch_id)
            .unwrap_or_default();

        if self.shared.shutdown.load(Ordering::Acquire) {
            log::warn!("request processor stopped; dropping {} requests", pages.len());
            ticket.set_total(0);
            return;
        }

        let mut queued = 0;
        {
            let mut in_flight = self.shared.in_flight.lock();
            for &page_id in pages {
                match in_flight.get_mut(&page_id) {
                    Some(waiting) => waiting.push(ticket.clone()),
                    None => {
                        in_flight.insert(page_id, smallvec![ticket.clone()]);
                        self.shared.queue.push(PageRequest {
                            page_id,
                            stream: stream.clone(),
                        });
                        queued += 1;
                    }
                }
            }
        }
        ticket.set_total(pages.len());

        if queued > 0 {
            let mut pending = self.shared.pending.lock();
            *pending += queued;
            self.shared.available.notify_all();
        }
        log::debug!(
            "launch {}: {} requests, {} already in flight",
            launch_id,
            pages.len(),
            pages.len() - queued
        );
    }

    /// Pages queued or being filled
    pub fn num_in_flight(&self) -> usize {
        self.shared.in_flight.lock().len()
    }

    /// Time spent in fill callbacks
    pub fn total_processing_time(&self) -> Duration {
        self.shared.processing_time.total()
    }

    pub fn num_filled(&self) -> u64 {
        self.shared.counters.filled.load(Ordering::Relaxed)
    }

    pub fn num_deferred(&self) -> u64 {
        self.shared.counters.deferred.load(Ordering::Relaxed)
    }

    pub fn num_failed(&self) -> u64 {
        self.shared.counters.failed.load(Ordering::Relaxed)
    }
}

impl Drop for RequestProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}
