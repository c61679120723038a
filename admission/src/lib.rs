//! Admission control for onvif-sdk
//!
//! A counting semaphore whose waiters are *actions* rather than blocked
//! threads. When a permit is available the action runs immediately in the
//! caller's context; otherwise it is queued and run later, in the context of
//! whoever calls [`Semaphore::release`].
//!
//! # Features
//!
//! - **Callback admission**: `acquire` never blocks, queued actions run on release
//! - **Deadlines**: queued actions may carry a timeout and a timeout callback
//! - **Permit forwarding**: a permit freed while the oldest waiter has expired
//!   passes straight to the next waiter
//! - **Async bridge**: [`Semaphore::acquire_owned`] returns an RAII guard for
//!   `async` callers
//!
//! # Quick Start
//!
//! ```rust
//! use admission::Semaphore;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let sem = Semaphore::new(1);
//! let ran = Arc::new(AtomicUsize::new(0));
//!
//! let r = ran.clone();
//! sem.acquire(move || { r.fetch_add(1, Ordering::SeqCst); }, None, None);
//! let r = ran.clone();
//! sem.acquire(move || { r.fetch_add(1, Ordering::SeqCst); }, None, None);
//!
//! // Only the first action ran, the second is queued
//! assert_eq!(ran.load(Ordering::SeqCst), 1);
//! assert_eq!(sem.pending(), 1);
//!
//! sem.release();
//! assert_eq!(ran.load(Ordering::SeqCst), 2);
//! assert_eq!(sem.available(), 0);
//! ```

pub mod error;
pub mod semaphore;

pub use error::{AdmissionError, Result};
pub use semaphore::{Semaphore, SemaphorePermit};
