//! Header record pooling.
//!
//! Request and Response records are reused across requests to avoid a pair
//! of allocations per call. The pool is a lock-guarded freelist; records are
//! reset on acquire so a recycled record is indistinguishable from a fresh
//! one. Correctness never depends on record identity.

use std::sync::Mutex;

use super::wire::{Request, Response};

/// A record that can be wiped for reuse without dropping its buffers.
pub trait Recyclable {
    /// Reset to the default state, keeping allocated capacity.
    fn reset(&mut self);
}

/// Lock-guarded freelist of records.
pub struct RecordPool<T> {
    free: Mutex<Vec<T>>,
}

impl<T: Recyclable + Default> RecordPool<T> {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Take a zeroed record: a recycled one if available, a fresh allocation
    /// otherwise.
    pub fn acquire(&self) -> T {
        let recycled = self.free.lock().expect("record pool lock poisoned").pop();
        match recycled {
            Some(mut record) => {
                record.reset();
                record
            }
            None => T::default(),
        }
    }

    /// Return a record to the freelist.
    pub fn release(&self, record: T) {
        self.free
            .lock()
            .expect("record pool lock poisoned")
            .push(record);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

impl<T: Recyclable + Default> Default for RecordPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The server's Request/Response record cache.
#[derive(Default)]
pub struct RecordCache {
    requests: RecordPool<Request>,
    responses: RecordPool<Response>,
}

impl RecordCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_request(&self) -> Request {
        self.requests.acquire()
    }

    pub fn put_request(&self, req: Request) {
        self.requests.release(req);
    }

    pub fn get_response(&self) -> Response {
        self.responses.acquire()
    }

    pub fn put_response(&self, resp: Response) {
        self.responses.release(resp);
    }
}
