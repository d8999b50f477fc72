//! [`MethodTable`] – the explicit set of remotely callable methods.
//!
//! A worker is reachable over the network only through the names it puts in
//! its table; nothing is discovered by introspection.  Dispatch looks the
//! requested name up in the table and fails with
//! [`LabError::UnknownMethod`] for anything that was not exposed.

use std::collections::BTreeMap;

use labmesh_types::{LabError, Map, Value};
use serde::de::DeserializeOwned;

// ────────────────────────────────────────────────────────────────────────────
// Arguments
// ────────────────────────────────────────────────────────────────────────────

/// Positional and keyword arguments of one remote call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl CallArgs {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    pub fn positional(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: Map::new(),
        }
    }

    /// Read a required argument passed either as keyword `name` or at
    /// position `index`.  The keyword wins when both are present.
    pub fn get<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<T, LabError> {
        match self.raw(index, name) {
            Some(value) => decode(name, value),
            None => Err(LabError::InvalidArgument {
                name: name.to_string(),
                details: format!("missing (position {index})"),
            }),
        }
    }

    /// Like [`get`](Self::get) but falls back to `default` when the argument
    /// is absent or `null`.
    pub fn get_or<T: DeserializeOwned>(&self, index: usize, name: &str, default: T) -> Result<T, LabError> {
        match self.raw(index, name) {
            None | Some(Value::Null) => Ok(default),
            Some(value) => decode(name, value),
        }
    }

    fn raw(&self, index: usize, name: &str) -> Option<&Value> {
        self.kwargs.get(name).or_else(|| self.args.get(index))
    }
}

fn decode<T: DeserializeOwned>(name: &str, value: &Value) -> Result<T, LabError> {
    T::deserialize(value).map_err(|e| LabError::InvalidArgument {
        name: name.to_string(),
        details: e.to_string(),
    })
}

// ────────────────────────────────────────────────────────────────────────────
// Method table
// ────────────────────────────────────────────────────────────────────────────

/// A remotely callable method of target `T`, given the dispatch context `C`.
pub type RemoteMethod<T, C> = Box<dyn Fn(&mut T, &mut C, CallArgs) -> Result<Value, LabError> + Send + Sync>;

/// Name → method map for one worker type.
///
/// ```
/// use labmesh_kernel::{CallArgs, MethodTable};
/// use labmesh_types::Value;
///
/// struct Counter(i64);
///
/// let table: MethodTable<Counter, ()> = MethodTable::new()
///     .expose("add", |c: &mut Counter, _: &mut (), args: CallArgs| {
///         c.0 += args.get::<i64>(0, "n")?;
///         Ok(Value::from(c.0))
///     });
///
/// let mut counter = Counter(1);
/// let out = table.dispatch(&mut counter, &mut (), "add", CallArgs::positional(vec![Value::from(2)]));
/// assert_eq!(out.unwrap(), Value::from(3));
/// assert!(table.dispatch(&mut counter, &mut (), "reset", CallArgs::default()).is_err());
/// ```
pub struct MethodTable<T, C> {
    methods: BTreeMap<String, RemoteMethod<T, C>>,
}

impl<T, C> Default for MethodTable<T, C> {
    fn default() -> Self {
        Self {
            methods: BTreeMap::new(),
        }
    }
}

impl<T, C> MethodTable<T, C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn expose<F>(mut self, name: &str, method: F) -> Self
    where
        F: Fn(&mut T, &mut C, CallArgs) -> Result<Value, LabError> + Send + Sync + 'static,
    {
        self.insert(name, method);
        self
    }

    /// Expose `method` under `name`, replacing any previous entry.
    pub fn insert<F>(&mut self, name: &str, method: F)
    where
        F: Fn(&mut T, &mut C, CallArgs) -> Result<Value, LabError> + Send + Sync + 'static,
    {
        self.methods.insert(name.to_string(), Box::new(method));
    }

    /// Expose `method` under `name` only if the name is still free.
    pub fn insert_default<F>(&mut self, name: &str, method: F)
    where
        F: Fn(&mut T, &mut C, CallArgs) -> Result<Value, LabError> + Send + Sync + 'static,
    {
        if !self.methods.contains_key(name) {
            self.insert(name, method);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Exposed names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Call the method exposed as `name`.
    pub fn dispatch(&self, target: &mut T, ctx: &mut C, name: &str, args: CallArgs) -> Result<Value, LabError> {
        let method = self
            .methods
            .get(name)
            .ok_or_else(|| LabError::UnknownMethod(name.to_string()))?;
        method(target, ctx, args)
    }
}
