//! Service layer - method descriptors, the service builder, the registry.
//!
//! A handler is described explicitly: a [`Service`] groups named
//! [`MethodDescriptor`] records, each carrying an ordered argument layout
//! and an invoke callable. The [`Registry`] resolves `Service.Method` names
//! to descriptors on the dispatch path.
//!
//! # Example
//!
//! ```ignore
//! let svc = Service::builder("DummyService")
//!     .method("Sum", |_ctx, args: Args, mut reply: Reply| async move {
//!         reply.num = args.a + args.b;
//!         Ok(reply)
//!     })
//!     .build()?;
//! server.register(svc)?;
//! ```

mod builder;
mod method;
mod registry;

pub use builder::{Service, ServiceBuilder};
pub use method::{
    ArgSpec, BoxFuture, Invoke, MethodDescriptor, MethodError, MethodOutcome,
};
pub use registry::Registry;
