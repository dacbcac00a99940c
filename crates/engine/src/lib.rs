//! Corral engine: resource handlers, retry and metrics middleware, schema
//! generation routing and the controller loop.

#![forbid(unsafe_code)]

pub mod controller;
pub mod declared;
pub mod diff;
pub mod handler;
pub mod middleware;
pub mod router;

pub use controller::{spawn, Controller, LoopOptions, PassResult, Policy, PolicyHandle};
pub use diff::{carry_version, diff_by_key, diff_objects, diff_summary, drift, object_key, strip_noisy, DiffSummary};
pub use handler::{apply_objects, Crud, CrudResource, Handler};
pub use middleware::{retry_with_backoff, wrap, Instrumented, Retry, RetryConfig};
pub use router::{Declared, GenerationRouter, PassReport, ResourceSet};
