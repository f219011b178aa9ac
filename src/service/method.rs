//! Method descriptors and typed invocation.
//!
//! A method is described by an explicit record: its name, an ordered list of
//! argument descriptors, and an invoke callable. The typed wrapper
//! [`TypedMethod`] adapts the canonical `(input, output)` handler shape onto
//! the type-erased [`Invoke`] trait, deserializing the positional bundle
//! before the user's handler runs and re-encoding the output after.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{type_tag, TaggedValue};
use crate::context::ConnContext;

/// Boxed future returned by method invocations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Error returned by a service method.
///
/// Only its string form travels in the response header, so the remote caller
/// sees exactly this message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodError(pub String);

impl fmt::Display for MethodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for MethodError {}

impl From<String> for MethodError {
    fn from(msg: String) -> Self {
        Self(msg)
    }
}

impl From<&str> for MethodError {
    fn from(msg: &str) -> Self {
        Self(msg.to_string())
    }
}

/// Result of one dispatched invocation.
///
/// `outputs` carries the output-position values in declaration order; it is
/// empty whenever `error` is set, since error responses are header-only.
#[derive(Debug)]
pub struct MethodOutcome {
    pub outputs: Vec<TaggedValue>,
    pub error: Option<String>,
}

impl MethodOutcome {
    pub fn ok(outputs: Vec<TaggedValue>) -> Self {
        Self {
            outputs,
            error: None,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            outputs: Vec::new(),
            error: Some(message.into()),
        }
    }
}

/// Type-erased invocation of one method.
pub trait Invoke: Send + Sync + 'static {
    /// Run the method against an already-decoded positional bundle.
    fn invoke(&self, ctx: ConnContext, args: Vec<TaggedValue>) -> BoxFuture<'static, MethodOutcome>;
}

impl<F> Invoke for F
where
    F: Fn(ConnContext, Vec<TaggedValue>) -> BoxFuture<'static, MethodOutcome>
        + Send
        + Sync
        + 'static,
{
    fn invoke(&self, ctx: ConnContext, args: Vec<TaggedValue>) -> BoxFuture<'static, MethodOutcome> {
        self(ctx, args)
    }
}

/// Descriptor of one positional argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgSpec {
    /// Short name of the argument's type.
    pub name: String,
    /// Canonical type tag, matched against incoming bundle elements.
    pub tag: String,
    /// Whether this position is returned to the caller.
    pub is_output: bool,
}

impl ArgSpec {
    /// Descriptor for an input position of type `T`.
    pub fn input<T>() -> Self {
        Self::for_type::<T>(false)
    }

    /// Descriptor for an output position of type `T`.
    pub fn output<T>() -> Self {
        Self::for_type::<T>(true)
    }

    fn for_type<T>(is_output: bool) -> Self {
        let tag = type_tag::<T>();
        Self {
            name: short_name(tag).to_string(),
            tag: tag.to_string(),
            is_output,
        }
    }
}

/// Last path segment of a canonical type tag.
pub(crate) fn short_name(tag: &str) -> &str {
    tag.rsplit("::").next().unwrap_or(tag)
}

/// Descriptor of one callable method.
pub struct MethodDescriptor {
    name: String,
    args: Vec<ArgSpec>,
    num_outputs: u32,
    calls: Mutex<u64>,
    invoke: Box<dyn Invoke>,
}

impl std::fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("args", &self.args)
            .field("num_outputs", &self.num_outputs)
            .field("calls", &self.calls)
            .finish()
    }
}

impl MethodDescriptor {
    pub(crate) fn new(name: String, args: Vec<ArgSpec>, invoke: Box<dyn Invoke>) -> Self {
        let num_outputs = args.iter().filter(|a| a.is_output).count() as u32;
        Self {
            name,
            args,
            num_outputs,
            calls: Mutex::new(0),
            invoke,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared argument positions, in order.
    #[inline]
    pub fn args(&self) -> &[ArgSpec] {
        &self.args
    }

    /// Number of output positions.
    #[inline]
    pub fn num_outputs(&self) -> u32 {
        self.num_outputs
    }

    /// How many times this method has been dispatched.
    pub fn call_count(&self) -> u64 {
        *self.calls.lock().expect("call counter lock poisoned")
    }

    pub(crate) fn record_call(&self) {
        *self.calls.lock().expect("call counter lock poisoned") += 1;
    }

    pub(crate) fn run(
        &self,
        ctx: ConnContext,
        args: Vec<TaggedValue>,
    ) -> BoxFuture<'static, MethodOutcome> {
        self.invoke.invoke(ctx, args)
    }
}

/// Adapter for the canonical `(input, output)` handler shape.
///
/// The handler receives the decoded input and the caller's initial output
/// value, and returns the final output or an error.
pub(crate) struct TypedMethod<I, O, F, Fut> {
    handler: F,
    _marker: PhantomData<fn(I, O) -> Fut>,
}

impl<I, O, F, Fut> TypedMethod<I, O, F, Fut>
where
    I: DeserializeOwned + Send + 'static,
    O: Serialize + DeserializeOwned + Send + 'static,
    F: Fn(ConnContext, I, O) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, MethodError>> + Send + 'static,
{
    pub(crate) fn new(handler: F) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

impl<I, O, F, Fut> Invoke for TypedMethod<I, O, F, Fut>
where
    I: DeserializeOwned + Send + 'static,
    O: Serialize + DeserializeOwned + Send + 'static,
    F: Fn(ConnContext, I, O) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, MethodError>> + Send + 'static,
{
    fn invoke(&self, ctx: ConnContext, args: Vec<TaggedValue>) -> BoxFuture<'static, MethodOutcome> {
        // Tags were checked against the descriptor before invocation, and
        // the count against the declared positions.
        let mut iter = args.into_iter();
        let (input, initial) = match (iter.next(), iter.next()) {
            (Some(input), Some(initial)) => (input, initial),
            _ => return Box::pin(async { MethodOutcome::fail("argument bundle too short") }),
        };

        let input: I = match input.decode_unchecked() {
            Ok(v) => v,
            Err(e) => {
                return Box::pin(async move { MethodOutcome::fail(format!("decoding argument 0: {e}")) })
            }
        };
        let initial: O = match initial.decode_unchecked() {
            Ok(v) => v,
            Err(e) => {
                return Box::pin(async move { MethodOutcome::fail(format!("decoding argument 1: {e}")) })
            }
        };

        let fut = (self.handler)(ctx, input, initial);
        Box::pin(async move {
            match fut.await {
                Ok(output) => match TaggedValue::encode(&output) {
                    Ok(value) => MethodOutcome::ok(vec![value]),
                    Err(e) => MethodOutcome::fail(format!("encoding output: {e}")),
                },
                Err(e) => MethodOutcome::fail(e.to_string()),
            }
        })
    }
}
