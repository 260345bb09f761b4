//! Explicit, opt-in object instrumentation.
//!
//! [`ObservableObject`] maps string-keyed fields onto atoms: every read of a
//! field subscribes the tracking derivation to that field alone, every write
//! propagates to exactly the derivations that read it. There is no
//! transparent interception; fields are registered explicitly, either one by
//! one or through the [`ObjectBuilder`], which maps each field name to an
//! [`Annotation`] and applies the whole layout in one `instrument` call.
//!
//! Field values are stored type-erased. Reading with the wrong type is a
//! programming error and panics with the field and type names.

use crate::arena::next_guid;
use crate::atom::Atom;
use crate::computed::ComputedValue;
use crate::hash::GraphHashBuilder;
use crate::transaction::run_in_action;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// How a field participates in the reactive graph.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Annotation {
    /// Backed by an atom; reads subscribe, writes propagate.
    Observable,
    /// Derived from other observable state; cached and read-only.
    Computed,
    /// Stored verbatim with no tracking at all.
    Ignore,
}

trait ComputedField: Send + Sync {
    fn get_any(&self) -> Box<dyn Any>;
}

impl<T: Clone + Send + Sync + 'static> ComputedField for ComputedValue<T> {
    fn get_any(&self) -> Box<dyn Any> {
        Box::new(self.get())
    }
}

enum Field {
    Observable {
        atom: Atom,
        value: Box<dyn Any + Send + Sync>,
    },
    Computed(Arc<dyn ComputedField>),
    Ignored(Box<dyn Any + Send + Sync>),
}

impl Field {
    fn annotation(&self) -> Annotation {
        match self {
            Field::Observable { .. } => Annotation::Observable,
            Field::Computed(_) => Annotation::Computed,
            Field::Ignored(_) => Annotation::Ignore,
        }
    }
}

/// A bag of named reactive fields.
///
/// # Example
/// ```ignore
/// let user = ObservableObject::builder("user")
///     .observable("first", "Ada".to_string())
///     .observable("last", "Lovelace".to_string())
///     .ignored("request_count", 0u64)
///     .instrument();
///
/// let _greeter = autorun({
///     let user = user.clone();
///     move || println!("hello {}", user.get::<String>("first").unwrap())
/// });
///
/// user.set("first", "Grace".to_string()); // greeter runs
/// user.set("last", "Hopper".to_string()); // greeter does not: it never read "last"
/// ```
pub struct ObservableObject {
    name: String,
    /// Tracks existence of keys: has()/keys() subscribe here, add/remove
    /// report through it.
    keys_atom: Atom,
    fields: RwLock<HashMap<String, Field, GraphHashBuilder>>,
}

impl ObservableObject {
    /// Create an empty instrumented object.
    pub fn new(name: impl Into<String>) -> Self {
        let name: String = name.into();
        Self {
            keys_atom: Atom::new(format!("{name}.keys")),
            name,
            fields: RwLock::new(HashMap::with_hasher(GraphHashBuilder)),
        }
    }

    /// Create an empty instrumented object with an auto-generated name.
    pub fn unnamed() -> Self {
        Self::new(format!("ObservableObject@{}", next_guid()))
    }

    /// Start a field-list builder, finalized by
    /// [`instrument`](ObjectBuilder::instrument).
    pub fn builder(name: impl Into<String>) -> ObjectBuilder {
        ObjectBuilder {
            object: Self::new(name),
        }
    }

    /// The object's debug name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register an observable field. Replaces any previous field under the
    /// same key and reports the key set changed.
    pub fn define<T: Send + Sync + 'static>(&self, key: impl Into<String>, value: T) {
        let key: String = key.into();
        let atom = Atom::new(format!("{}.{key}", self.name));
        self.insert_field(key, Field::Observable {
            atom,
            value: Box::new(value),
        });
    }

    /// Register a computed field evaluated from other observable state.
    pub fn define_computed<T, F>(&self, key: impl Into<String>, compute: F)
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: FnMut() -> T + Send + 'static,
    {
        let key: String = key.into();
        let computed = ComputedValue::named(format!("{}.{key}", self.name), compute);
        self.insert_field(key, Field::Computed(Arc::new(computed)));
    }

    /// Register an untracked field.
    pub fn define_ignored<T: Send + Sync + 'static>(&self, key: impl Into<String>, value: T) {
        self.insert_field(key.into(), Field::Ignored(Box::new(value)));
    }

    fn insert_field(&self, key: String, field: Field) {
        self.fields.write().insert(key, field);
        self.keys_atom.report_changed();
    }

    /// Read a field.
    ///
    /// Observable fields subscribe the tracking derivation to the field's
    /// atom; computed fields evaluate through their cache; ignored fields
    /// return the stored value untracked. A missing key returns `None` and
    /// subscribes to the key set, so the read re-runs when the field appears.
    ///
    /// Panics when the stored value is not a `T`.
    pub fn get<T: Clone + 'static>(&self, key: &str) -> Option<T> {
        let fields = self.fields.read();
        match fields.get(key) {
            Some(Field::Observable { atom, value }) => {
                let result = downcast_field::<T>(&self.name, key, value.as_ref());
                let atom_id = atom.id();
                drop(fields);
                atom_id.report_observed();
                Some(result)
            }
            Some(Field::Computed(computed)) => {
                // Evaluate without the field table locked: the computation is
                // free to read other fields of this object
                let computed = computed.clone();
                drop(fields);
                match computed.get_any().downcast::<T>() {
                    Ok(value) => Some(*value),
                    Err(_) => wrong_type::<T>(&self.name, key),
                }
            }
            Some(Field::Ignored(value)) => {
                Some(downcast_field::<T>(&self.name, key, value.as_ref()))
            }
            None => {
                drop(fields);
                self.keys_atom.report_observed();
                None
            }
        }
    }

    /// Write a field.
    ///
    /// Writing an observable field compares against the current value and
    /// propagates only genuine changes. Writing a missing key defines it.
    /// Writing an ignored field stores silently. Writing a computed field is
    /// a contract violation and panics.
    pub fn set<T: PartialEq + Send + Sync + 'static>(&self, key: &str, value: T) {
        let mut fields = self.fields.write();
        match fields.get_mut(key) {
            Some(Field::Observable {
                atom,
                value: stored,
            }) => {
                let current = downcast_field_mut::<T>(&self.name, key, stored.as_mut());
                if *current == value {
                    return;
                }
                *current = value;
                let atom_id = atom.id();
                drop(fields);
                // Propagate without holding the field table: the drain may
                // re-enter get()
                atom_id.report_changed();
            }
            Some(Field::Computed(_)) => panic!(
                "cannot assign to computed member '{key}' of '{}'",
                self.name
            ),
            Some(Field::Ignored(stored)) => {
                *stored = Box::new(value);
            }
            None => {
                drop(fields);
                self.define(key.to_string(), value);
            }
        }
    }

    /// Whether a field exists. Subscribes to the key set.
    pub fn has(&self, key: &str) -> bool {
        self.keys_atom.report_observed();
        self.fields.read().contains_key(key)
    }

    /// The registered field names. Subscribes to the key set.
    pub fn keys(&self) -> Vec<String> {
        self.keys_atom.report_observed();
        self.fields.read().keys().cloned().collect()
    }

    /// How a field is instrumented, if it exists. Does not subscribe.
    pub fn annotation(&self, key: &str) -> Option<Annotation> {
        self.fields.read().get(key).map(Field::annotation)
    }

    /// Remove a field, notifying both its observers and key-set observers.
    /// Returns whether the field existed.
    pub fn remove(&self, key: &str) -> bool {
        let field = self.fields.write().remove(key);
        match field {
            Some(field) => {
                run_in_action(|| {
                    if let Field::Observable { atom, .. } = &field {
                        atom.report_changed();
                    }
                    self.keys_atom.report_changed();
                });
                true
            }
            None => false,
        }
    }
}

fn downcast_field<T: Clone + 'static>(object: &str, key: &str, value: &dyn Any) -> T {
    match value.downcast_ref::<T>() {
        Some(value) => value.clone(),
        None => wrong_type::<T>(object, key),
    }
}

fn downcast_field_mut<'a, T: 'static>(
    object: &str,
    key: &str,
    value: &'a mut (dyn Any + Send + Sync),
) -> &'a mut T {
    match value.downcast_mut::<T>() {
        Some(value) => value,
        None => wrong_type::<T>(object, key),
    }
}

fn wrong_type<T>(object: &str, key: &str) -> ! {
    panic!(
        "field '{key}' of '{object}' does not hold a {}",
        std::any::type_name::<T>()
    )
}

/// Field-list builder produced by [`ObservableObject::builder`]. Each method
/// maps one field name to an [`Annotation`]; [`instrument`]
/// (ObjectBuilder::instrument) applies the layout and returns the object.
pub struct ObjectBuilder {
    object: ObservableObject,
}

impl ObjectBuilder {
    /// Map a field to [`Annotation::Observable`].
    pub fn observable<T: Send + Sync + 'static>(self, key: impl Into<String>, value: T) -> Self {
        self.object.define(key, value);
        self
    }

    /// Map a field to [`Annotation::Computed`].
    pub fn computed<T, F>(self, key: impl Into<String>, compute: F) -> Self
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: FnMut() -> T + Send + 'static,
    {
        self.object.define_computed(key, compute);
        self
    }

    /// Map a field to [`Annotation::Ignore`].
    pub fn ignored<T: Send + Sync + 'static>(self, key: impl Into<String>, value: T) -> Self {
        self.object.define_ignored(key, value);
        self
    }

    /// Apply the layout and return the instrumented object.
    pub fn instrument(self) -> ObservableObject {
        self.object
    }
}
