//! Service descriptors and the fluent service builder.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::method::{ArgSpec, Invoke, MethodDescriptor, MethodError, MethodOutcome, TypedMethod};
use crate::codec::{TaggedValue, TypeTable};
use crate::context::ConnContext;
use crate::error::{Result, RpcError};

/// A named group of callable methods.
///
/// Built with [`Service::builder`], then installed into a server's registry.
/// Lives for the lifetime of the server once registered.
#[derive(Debug)]
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<MethodDescriptor>>,
    types: TypeTable,
}

impl Service {
    /// Start building a service under `name`.
    pub fn builder(name: &str) -> ServiceBuilder {
        ServiceBuilder {
            name: name.to_string(),
            methods: HashMap::new(),
            types: TypeTable::new(),
            error: None,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a method by name.
    pub fn method(&self, name: &str) -> Option<Arc<MethodDescriptor>> {
        self.methods.get(name).cloned()
    }

    /// The value types this service's methods reference.
    pub(crate) fn types(&self) -> &TypeTable {
        &self.types
    }

    /// Dispatch an already-decoded positional bundle into a method.
    ///
    /// Verifies each position's tag against the descriptor, bumps the call
    /// counter, and invokes. The outcome's error is a caller-facing string;
    /// outputs are the output positions in declaration order.
    pub async fn execute_method(
        &self,
        method: &MethodDescriptor,
        ctx: ConnContext,
        args: Vec<TaggedValue>,
    ) -> MethodOutcome {
        for (pos, (spec, value)) in method.args().iter().zip(args.iter()).enumerate() {
            if value.tag != spec.tag {
                return MethodOutcome::fail(format!(
                    "Argument {} is of type {} and the expected type is {}",
                    pos, value.tag, spec.tag
                ));
            }
        }
        method.record_call();
        method.run(ctx, args).await
    }
}

/// Is this an exported - upper case - name?
fn is_exported(name: &str) -> bool {
    name.chars().next().is_some_and(char::is_uppercase)
}

/// Fluent builder for a [`Service`].
///
/// Validation errors are remembered and reported by [`ServiceBuilder::build`],
/// so registration never installs a partially valid service.
pub struct ServiceBuilder {
    name: String,
    methods: HashMap<String, Arc<MethodDescriptor>>,
    types: TypeTable,
    error: Option<RpcError>,
}

impl ServiceBuilder {
    /// Register a method with the canonical `(input, output)` signature.
    ///
    /// The handler receives the connection context, the decoded input and
    /// the caller's initial output value, and returns the final output or a
    /// [`MethodError`] whose message travels back verbatim.
    pub fn method<I, O, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        I: Serialize + DeserializeOwned + Send + 'static,
        O: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(ConnContext, I, O) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<O, MethodError>> + Send + 'static,
    {
        let args = vec![ArgSpec::input::<I>(), ArgSpec::output::<O>()];
        self.types.register::<I>();
        self.types.register::<O>();
        self.install(name, args, Box::new(TypedMethod::new(handler)));
        self
    }

    /// Register a method from an explicit descriptor record: argument
    /// layout plus a type-erased invoke callable.
    ///
    /// Non-primitive types referenced by `args` should be added with
    /// [`ServiceBuilder::register_type`] so receivers can verify them.
    pub fn method_raw(mut self, name: &str, args: Vec<ArgSpec>, invoke: impl Invoke) -> Self {
        self.install(name, args, Box::new(invoke));
        self
    }

    /// Record a value type used by a raw method.
    pub fn register_type<T: DeserializeOwned + 'static>(mut self) -> Self {
        self.types.register::<T>();
        self
    }

    fn install(&mut self, name: &str, args: Vec<ArgSpec>, invoke: Box<dyn Invoke>) {
        if self.error.is_some() {
            return;
        }
        if !is_exported(name) {
            self.error = Some(RpcError::Register(format!(
                "method {} is not exported",
                name
            )));
            return;
        }
        if self.methods.contains_key(name) {
            self.error = Some(RpcError::Register(format!(
                "method already defined: {}",
                name
            )));
            return;
        }
        self.methods.insert(
            name.to_string(),
            Arc::new(MethodDescriptor::new(name.to_string(), args, invoke)),
        );
    }

    /// Finish the service, reporting the first validation failure if any.
    pub fn build(self) -> Result<Service> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if !is_exported(&self.name) {
            return Err(RpcError::Register(format!(
                "Register: type {} is not exported",
                self.name
            )));
        }
        if self.methods.is_empty() {
            return Err(RpcError::Register(format!(
                "Type {} has no exported methods of suitable type",
                self.name
            )));
        }
        Ok(Service {
            name: self.name,
            methods: self.methods,
            types: self.types,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::type_tag;
    use crate::service::method::BoxFuture;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Args {
        a: i32,
        b: i32,
    }

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Reply {
        num: i32,
    }

    fn dummy_service() -> Service {
        Service::builder("DummyService")
            .method(
                "Sum",
                |_ctx: ConnContext, args: Args, mut reply: Reply| async move {
                    reply.num = args.a + args.b;
                    Ok(reply)
                },
            )
            .method(
                "Error",
                |_ctx: ConnContext, _args: Args, _reply: Reply| async move {
                    Err::<Reply, _>(MethodError::from("Test Error"))
                },
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_collects_methods_and_types() {
        let svc = dummy_service();
        assert_eq!(svc.name(), "DummyService");
        assert!(svc.method("Sum").is_some());
        assert!(svc.method("Error").is_some());
        assert!(svc.method("Missing").is_none());
        assert!(svc.types().contains(type_tag::<Args>()));
        assert!(svc.types().contains(type_tag::<Reply>()));
    }

    #[test]
    fn test_unexported_service_name_rejected() {
        let err = Service::builder("dummy")
            .method(
                "Sum",
                |_ctx: ConnContext, _a: Args, r: Reply| async move { Ok(r) },
            )
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("is not exported"));
    }

    #[test]
    fn test_unexported_method_name_rejected() {
        let err = Service::builder("DummyService")
            .method(
                "sum",
                |_ctx: ConnContext, _a: Args, r: Reply| async move { Ok(r) },
            )
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("not exported"));
    }

    #[test]
    fn test_zero_methods_rejected() {
        let err = Service::builder("DummyService").build().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Type DummyService has no exported methods of suitable type"
        );
    }

    #[test]
    fn test_duplicate_method_rejected() {
        let err = Service::builder("DummyService")
            .method(
                "Sum",
                |_ctx: ConnContext, _a: Args, r: Reply| async move { Ok(r) },
            )
            .method(
                "Sum",
                |_ctx: ConnContext, _a: Args, r: Reply| async move { Ok(r) },
            )
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("already defined"));
    }

    #[tokio::test]
    async fn test_execute_method_type_mismatch() {
        let svc = dummy_service();
        let method = svc.method("Error").unwrap();
        let ctx = ConnContext::new(1, None);

        // Second position carries Args where Reply is declared.
        let args = vec![
            TaggedValue::encode(&Args { a: 1, b: 2 }).unwrap(),
            TaggedValue::encode(&Args { a: 1, b: 2 }).unwrap(),
        ];

        let outcome = svc.execute_method(&method, ctx, args).await;
        let msg = outcome.error.unwrap();
        assert!(msg.starts_with("Argument 1 is of type"));
        assert!(msg.contains("Reply"));
        // A rejected bundle never reaches the handler.
        assert_eq!(method.call_count(), 0);
    }

    #[tokio::test]
    async fn test_execute_method_bumps_counter() {
        let svc = dummy_service();
        let method = svc.method("Sum").unwrap();
        let ctx = ConnContext::new(1, None);

        for _ in 0..3 {
            let args = vec![
                TaggedValue::encode(&Args { a: 1, b: 2 }).unwrap(),
                TaggedValue::encode(&Reply { num: 0 }).unwrap(),
            ];
            let outcome = svc.execute_method(&method, ctx.clone(), args).await;
            assert!(outcome.error.is_none());
        }
        assert_eq!(method.call_count(), 3);
    }

    #[tokio::test]
    async fn test_method_raw_descriptor() {
        let svc = Service::builder("RawService")
            .method_raw(
                "Echo",
                vec![ArgSpec::input::<String>(), ArgSpec::output::<String>()],
                |ctx: ConnContext, args: Vec<TaggedValue>| -> BoxFuture<'static, MethodOutcome> {
                    let _ = ctx;
                    Box::pin(async move {
                        match args[0].decode::<String>() {
                            Ok(text) => match TaggedValue::encode(&text) {
                                Ok(v) => MethodOutcome::ok(vec![v]),
                                Err(e) => MethodOutcome::fail(e.to_string()),
                            },
                            Err(e) => MethodOutcome::fail(e.to_string()),
                        }
                    })
                },
            )
            .register_type::<String>()
            .build()
            .unwrap();

        let method = svc.method("Echo").unwrap();
        assert_eq!(method.num_outputs(), 1);

        let args = vec![
            TaggedValue::encode(&"hi".to_string()).unwrap(),
            TaggedValue::encode(&String::new()).unwrap(),
        ];
        let outcome = svc
            .execute_method(&method, ConnContext::new(1, None), args)
            .await;
        assert_eq!(outcome.outputs[0].decode::<String>().unwrap(), "hi");
    }
}
