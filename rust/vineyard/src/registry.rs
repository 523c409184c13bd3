//! Service registry and method resolution.
//!
//! A service is any `Send + Sync` value. Its callable surface is declared
//! once, at registration, with typed closures:
//!
//! ```
//! use vineyard::{ServiceBuilder, ServiceRegistry};
//!
//! struct Calc;
//!
//! let calc = ServiceBuilder::new(Calc)
//!     .method("add", |_: &Calc, a: i64, b: i64| a + b)
//!     .method("add", |_: &Calc, a: f64, b: f64| a + b)
//!     .build();
//!
//! let mut registry = ServiceRegistry::new();
//! registry.register("Calc", calc).unwrap();
//! ```
//!
//! Each closure's parameter types give the overload's signature; a call is
//! routed to the cheapest compatible overload by name and arity.

use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use vineyard_wire::{ErrorKind, RemoteError, Request, Value};

use crate::RegistryError;
use crate::value::{FromValue, IntoOutcome, ParamKind};

/// A typed method body, implemented for closures `Fn(&S, A1, .., An) -> R`
/// with up to six parameters.
pub trait Handler<S, Args>: Send + Sync + 'static {
    fn params() -> Vec<ParamKind>;

    fn invoke(&self, service: &S, args: Vec<Value>) -> Result<Value, String>;
}

macro_rules! impl_handler {
    ($($arg:ident),*) => {
        impl<S, F, R, $($arg,)*> Handler<S, ($($arg,)*)> for F
        where
            F: Fn(&S, $($arg),*) -> R + Send + Sync + 'static,
            R: IntoOutcome,
            $($arg: FromValue,)*
        {
            fn params() -> Vec<ParamKind> {
                vec![$($arg::KIND),*]
            }

            #[allow(non_snake_case, unused_mut, unused_variables)]
            fn invoke(&self, service: &S, args: Vec<Value>) -> Result<Value, String> {
                let mut args = args.into_iter().enumerate();
                $(
                    let $arg = match args.next() {
                        Some((i, value)) => $arg::from_value(value)
                            .map_err(|e| format!("argument {i}: {e}"))?,
                        None => return Err("missing argument".to_string()),
                    };
                )*
                (self)(service, $($arg),*).into_outcome()
            }
        }
    };
}

impl_handler!();
impl_handler!(A1);
impl_handler!(A1, A2);
impl_handler!(A1, A2, A3);
impl_handler!(A1, A2, A3, A4);
impl_handler!(A1, A2, A3, A4, A5);
impl_handler!(A1, A2, A3, A4, A5, A6);

type Invoker = Arc<dyn Fn(Vec<Value>) -> Result<Value, String> + Send + Sync>;

/// One overload of a method.
#[derive(Clone)]
pub struct MethodEntry {
    params: Vec<ParamKind>,
    invoker: Invoker,
}

impl MethodEntry {
    pub fn params(&self) -> &[ParamKind] {
        &self.params
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// Total binding cost of `args`, or `None` if they do not fit.
    pub fn cost(&self, args: &[Value]) -> Option<u32> {
        if args.len() != self.params.len() {
            return None;
        }
        self.params
            .iter()
            .zip(args)
            .try_fold(0, |total, (param, arg)| Some(total + param.cost(arg)?))
    }

    fn signature(&self) -> String {
        let params: Vec<String> = self.params.iter().map(ToString::to_string).collect();
        format!("({})", params.join(", "))
    }
}

impl fmt::Debug for MethodEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodEntry")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Builds the method table of one service instance.
pub struct ServiceBuilder<S> {
    instance: Arc<S>,
    methods: HashMap<String, Vec<MethodEntry>>,
}

impl<S: Send + Sync + 'static> ServiceBuilder<S> {
    pub fn new(instance: S) -> Self {
        Self::from_arc(Arc::new(instance))
    }

    /// Build around a shared instance, e.g. one the application also uses.
    pub fn from_arc(instance: Arc<S>) -> Self {
        Self {
            instance,
            methods: HashMap::new(),
        }
    }

    /// Add an overload of `name`.
    pub fn method<Args, H>(mut self, name: impl Into<String>, handler: H) -> Self
    where
        H: Handler<S, Args>,
    {
        let instance = Arc::clone(&self.instance);
        let invoker: Invoker = Arc::new(move |args: Vec<Value>| handler.invoke(&instance, args));
        self.methods
            .entry(name.into())
            .or_default()
            .push(MethodEntry {
                params: H::params(),
                invoker,
            });
        self
    }

    pub fn build(self) -> ServiceHandle {
        ServiceHandle {
            type_name: type_name::<S>(),
            methods: self.methods,
        }
    }
}

/// A type-erased, registered service: its method table.
#[derive(Clone)]
pub struct ServiceHandle {
    type_name: &'static str,
    methods: HashMap<String, Vec<MethodEntry>>,
}

/// Services that describe their own methods.
pub trait Service: Send + Sync + Sized + 'static {
    fn methods(builder: ServiceBuilder<Self>) -> ServiceBuilder<Self>;

    fn into_handle(self) -> ServiceHandle {
        Self::methods(ServiceBuilder::new(self)).build()
    }
}

impl ServiceHandle {
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.methods.keys().map(String::as_str)
    }

    pub fn overloads(&self, method: &str) -> &[MethodEntry] {
        self.methods.get(method).map_or(&[], Vec::as_slice)
    }

    /// Pick the overload of `method` that binds `args` most cheaply.
    pub fn resolve(&self, bean: &str, method: &str, args: &[Value]) -> Result<&MethodEntry, RemoteError> {
        let overloads = self.overloads(method);
        if overloads.is_empty() {
            return Err(RemoteError::new(
                ErrorKind::NoMatchingMethod,
                format!("{bean} has no method {method:?}"),
            ));
        }

        let mut best: Option<(u32, &MethodEntry)> = None;
        let mut tied = false;
        for entry in overloads {
            let Some(cost) = entry.cost(args) else {
                continue;
            };
            match best {
                Some((best_cost, _)) if cost > best_cost => {}
                Some((best_cost, _)) if cost == best_cost => tied = true,
                _ => {
                    best = Some((cost, entry));
                    tied = false;
                }
            }
        }

        let kinds: Vec<String> = args.iter().map(|a| a.kind().to_string()).collect();
        match best {
            None => Err(RemoteError::new(
                ErrorKind::NoMatchingMethod,
                format!("no overload of {bean}.{method} accepts ({})", kinds.join(", ")),
            )),
            Some((cost, _)) if tied => {
                let candidates: Vec<String> = overloads
                    .iter()
                    .filter(|e| e.cost(args) == Some(cost))
                    .map(MethodEntry::signature)
                    .collect();
                Err(RemoteError::new(
                    ErrorKind::AmbiguousMethod,
                    format!(
                        "{bean}.{method}({}) matches {}",
                        kinds.join(", "),
                        candidates.join(" and ")
                    ),
                ))
            }
            Some((_, entry)) => Ok(entry),
        }
    }
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.method_names().collect();
        names.sort_unstable();
        f.debug_struct("ServiceHandle")
            .field("type_name", &self.type_name)
            .field("methods", &names)
            .finish()
    }
}

/// Bean name → service. Populated before serving, read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<ServiceHandle>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to a service.
    ///
    /// Fails if the name is empty or already bound.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        service: ServiceHandle,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if name.is_empty() {
            return Err(RegistryError::EmptyServiceName);
        }
        if self.services.contains_key(&name) {
            return Err(RegistryError::DuplicateRegistration(name));
        }
        tracing::debug!(bean = %name, service = service.type_name, "registered service");
        self.services.insert(name, Arc::new(service));
        Ok(())
    }

    /// Register a [`Service`] under `name`.
    pub fn register_service<S: Service>(
        &mut self,
        name: impl Into<String>,
        service: S,
    ) -> Result<(), RegistryError> {
        self.register(name, service.into_handle())
    }

    pub fn lookup(&self, name: &str) -> Option<&Arc<ServiceHandle>> {
        self.services.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.services.keys().map(String::as_str)
    }

    /// Resolve and invoke `request`, producing a result or a remote error.
    ///
    /// Panics inside the service are caught and reported as
    /// [`ErrorKind::ServiceInvocation`].
    pub fn invoke(&self, request: &Request) -> Result<Value, RemoteError> {
        let bean = request.bean_name.as_str();
        let service = self.lookup(bean).ok_or_else(|| {
            RemoteError::new(
                ErrorKind::UnknownService,
                format!("no service registered as {bean:?}"),
            )
        })?;
        let entry = service.resolve(bean, &request.method_name, &request.arguments)?;

        let args = request.arguments.clone();
        let invoker = &entry.invoker;
        match catch_unwind(AssertUnwindSafe(|| invoker(args))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(RemoteError::new(ErrorKind::ServiceInvocation, message)),
            Err(panic) => Err(RemoteError::new(
                ErrorKind::ServiceInvocation,
                panic_message(panic.as_ref()),
            )),
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct Calc {
        calls: AtomicU64,
    }

    impl Service for Calc {
        fn methods(builder: ServiceBuilder<Self>) -> ServiceBuilder<Self> {
            builder
                .method("add", |c: &Calc, a: i64, b: i64| {
                    c.calls.fetch_add(1, Ordering::Relaxed);
                    a + b
                })
                .method("add", |_: &Calc, a: f64, b: f64| a + b)
                .method("div", |_: &Calc, a: i64, b: i64| {
                    a.checked_div(b).ok_or("division by zero")
                })
                .method("greet", |_: &Calc, name: Option<String>| {
                    format!("hello {}", name.as_deref().unwrap_or("anonymous"))
                })
                .method("echo", |_: &Calc, v: Value| v)
                .method("boom", |_: &Calc| -> i64 { panic!("kaboom") })
                .method("calls", |c: &Calc| c.calls.load(Ordering::Relaxed) as i64)
        }
    }

    fn registry() -> ServiceRegistry {
        let mut registry = ServiceRegistry::new();
        registry.register_service("Calc", Calc::default()).unwrap();
        registry
    }

    fn call(registry: &ServiceRegistry, method: &str, args: Vec<Value>) -> Result<Value, RemoteError> {
        registry.invoke(&Request::new("Calc", method, args))
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = registry();
        let err = registry
            .register_service("Calc", Calc::default())
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateRegistration("Calc".into()));
        assert_eq!(
            registry.register("", Calc::default().into_handle()),
            Err(RegistryError::EmptyServiceName)
        );
    }

    #[test]
    fn exact_overload_wins() {
        let registry = registry();
        assert_eq!(call(&registry, "add", args![2, 3]), Ok(Value::Int(5)));
        assert_eq!(call(&registry, "add", args![2.5, 0.5]), Ok(Value::Float(3.0)));
        assert_eq!(call(&registry, "calls", vec![]), Ok(Value::Int(1)));
    }

    #[test]
    fn mixed_arguments_widen_to_float() {
        let registry = registry();
        assert_eq!(call(&registry, "add", args![1, 0.5]), Ok(Value::Float(1.5)));
    }

    #[test]
    fn optional_parameter_accepts_null() {
        let registry = registry();
        assert_eq!(
            call(&registry, "greet", args![None::<String>]),
            Ok(Value::Str("hello anonymous".into()))
        );
        assert_eq!(
            call(&registry, "greet", args!["ada"]),
            Ok(Value::Str("hello ada".into()))
        );
    }

    #[test]
    fn unknown_bean() {
        let err = registry()
            .invoke(&Request::new("Nope", "add", args![1, 2]))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownService);
    }

    #[test]
    fn no_matching_method() {
        let registry = registry();
        let err = call(&registry, "add", args![1, 2, 3]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoMatchingMethod);
        let err = call(&registry, "add", args!["a", "b"]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoMatchingMethod);
        let err = call(&registry, "subtract", args![1, 2]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoMatchingMethod);
    }

    #[test]
    fn equal_cost_overloads_are_ambiguous() {
        let handle = ServiceBuilder::new(())
            .method("pick", |_: &(), a: i64, _b: f64| a)
            .method("pick", |_: &(), _a: f64, b: i64| b)
            .build();
        let mut registry = ServiceRegistry::new();
        registry.register("Picker", handle).unwrap();

        let err = registry
            .invoke(&Request::new("Picker", "pick", args![1, 2]))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AmbiguousMethod);
        assert!(err.message.contains("(int, float)"));

        // An exact match breaks the tie.
        assert_eq!(
            registry.invoke(&Request::new("Picker", "pick", args![1, 2.0])),
            Ok(Value::Int(1))
        );
    }

    #[test]
    fn any_parameter_is_a_last_resort() {
        let handle = ServiceBuilder::new(())
            .method("show", |_: &(), _v: Value| "any")
            .method("show", |_: &(), _v: i64| "int")
            .build();
        let mut registry = ServiceRegistry::new();
        registry.register("Show", handle).unwrap();

        let show = |v: Value| registry.invoke(&Request::new("Show", "show", vec![v]));
        assert_eq!(show(Value::Int(1)), Ok(Value::Str("int".into())));
        assert_eq!(show(Value::Bool(true)), Ok(Value::Str("any".into())));
    }

    #[test]
    fn service_errors_and_panics_become_invocation_errors() {
        let registry = registry();
        let err = call(&registry, "div", args![1, 0]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ServiceInvocation);
        assert_eq!(err.message, "division by zero");

        let err = call(&registry, "boom", vec![]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ServiceInvocation);
        assert!(err.message.contains("kaboom"));
    }

    #[test]
    fn out_of_range_argument_is_an_invocation_error() {
        let handle = ServiceBuilder::new(())
            .method("small", |_: &(), v: i32| v)
            .build();
        let mut registry = ServiceRegistry::new();
        registry.register("S", handle).unwrap();
        let err = registry
            .invoke(&Request::new("S", "small", args![i64::MAX]))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ServiceInvocation);
        assert!(err.message.contains("argument 0"));
    }

    #[test]
    fn echo_returns_arguments_untouched() {
        let registry = registry();
        let list = Value::List(vec![Value::Null, Value::Bytes(vec![1, 2])]);
        assert_eq!(call(&registry, "echo", vec![list.clone()]), Ok(list));
    }
}
