use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use super::errors::{EngineError, EngineResult};

// ============================================================================
// Type Shape Descriptors
// ============================================================================
//
// Payload types describe their own property shape. Object fields point at
// their type through a function pointer, so a self-referential type can be
// declared without recursing; the cycle only surfaces (as an error) when the
// shape is walked.
//
// ============================================================================

#[derive(Clone, Debug)]
pub struct TypeDescriptor {
    pub name: String,
    pub kind: ShapeKind,
}

#[derive(Clone, Debug)]
pub enum ShapeKind {
    /// Numbers, booleans, ids, timestamps
    Primitive,
    Text,
    Sequence(fn() -> TypeDescriptor),
    Optional(fn() -> TypeDescriptor),
    /// String-keyed map, described by its value type
    Map(fn() -> TypeDescriptor),
    Object(Vec<FieldDescriptor>),
}

#[derive(Clone, Debug)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub ty: fn() -> TypeDescriptor,
}

impl TypeDescriptor {
    pub fn primitive(name: &str) -> Self {
        Self { name: name.to_string(), kind: ShapeKind::Primitive }
    }

    pub fn text() -> Self {
        Self { name: "String".to_string(), kind: ShapeKind::Text }
    }

    pub fn object(name: &str, fields: Vec<FieldDescriptor>) -> Self {
        Self { name: name.to_string(), kind: ShapeKind::Object(fields) }
    }

    pub fn is_primitive(&self) -> bool {
        matches!(self.kind, ShapeKind::Primitive)
    }
}

/// Field descriptor for a property of type `T`.
pub fn field<T: Describe>(name: &'static str) -> FieldDescriptor {
    FieldDescriptor { name, ty: T::descriptor }
}

/// Types that can report their property shape.
pub trait Describe {
    fn descriptor() -> TypeDescriptor;
}

macro_rules! describe_primitive {
    ($($ty:ty => $name:expr),* $(,)?) => {
        $(
            impl Describe for $ty {
                fn descriptor() -> TypeDescriptor {
                    TypeDescriptor::primitive($name)
                }
            }
        )*
    };
}

describe_primitive!(
    bool => "bool",
    i16 => "i16",
    i32 => "i32",
    i64 => "i64",
    u16 => "u16",
    u32 => "u32",
    u64 => "u64",
    f32 => "f32",
    f64 => "f64",
    Uuid => "Uuid",
    DateTime<Utc> => "DateTime<Utc>",
);

impl Describe for String {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::text()
    }
}

impl<T: Describe> Describe for Vec<T> {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor {
            name: format!("Vec<{}>", T::descriptor().name),
            kind: ShapeKind::Sequence(T::descriptor),
        }
    }
}

impl<T: Describe> Describe for Option<T> {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor {
            name: format!("Option<{}>", T::descriptor().name),
            kind: ShapeKind::Optional(T::descriptor),
        }
    }
}

impl<T: Describe> Describe for Box<T> {
    fn descriptor() -> TypeDescriptor {
        T::descriptor()
    }
}

impl<V: Describe> Describe for HashMap<String, V> {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor {
            name: format!("HashMap<String, {}>", V::descriptor().name),
            kind: ShapeKind::Map(V::descriptor),
        }
    }
}

// ============================================================================
// Event Metadata - structural description of an event payload
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PropertyMetadata {
    pub name: String,
    pub declared_type: String,
    pub is_primitive: bool,
    pub properties: Vec<PropertyMetadata>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EventMetadata {
    pub event_type: String,
    pub type_name: String,
    pub properties: Vec<PropertyMetadata>,
}

impl EventMetadata {
    /// Walk a descriptor into metadata. Fails on self-referential shapes.
    pub fn from_descriptor(event_type: &str, descriptor: &TypeDescriptor) -> EngineResult<Self> {
        let mut visiting = Vec::new();
        Ok(Self {
            event_type: event_type.to_string(),
            type_name: descriptor.name.clone(),
            properties: describe_properties(descriptor, &mut visiting)?,
        })
    }

    pub fn property(&self, name: &str) -> Option<&PropertyMetadata> {
        self.properties.iter().find(|p| p.name == name)
    }
}

fn describe_properties(
    descriptor: &TypeDescriptor,
    visiting: &mut Vec<String>,
) -> EngineResult<Vec<PropertyMetadata>> {
    match &descriptor.kind {
        ShapeKind::Primitive | ShapeKind::Text => Ok(Vec::new()),
        ShapeKind::Sequence(inner) | ShapeKind::Optional(inner) | ShapeKind::Map(inner) => {
            describe_properties(&inner(), visiting)
        }
        ShapeKind::Object(fields) => {
            if visiting.contains(&descriptor.name) {
                return Err(EngineError::Serialization(format!(
                    "cycle detected in type shape: {} -> {}",
                    visiting.join(" -> "),
                    descriptor.name
                )));
            }

            visiting.push(descriptor.name.clone());
            let mut properties = Vec::with_capacity(fields.len());
            for f in fields {
                let ty = (f.ty)();
                properties.push(PropertyMetadata {
                    name: f.name.to_string(),
                    declared_type: ty.name.clone(),
                    is_primitive: ty.is_primitive(),
                    properties: describe_properties(&ty, visiting)?,
                });
            }
            visiting.pop();

            Ok(properties)
        }
    }
}

// ============================================================================
// Shape Cache - owned by a serializer instance, never global
// ============================================================================

#[derive(Default)]
pub struct ShapeCache {
    entries: RwLock<HashMap<(TypeId, String), Arc<EventMetadata>>>,
}

impl ShapeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_try_insert<F>(
        &self,
        type_id: TypeId,
        event_type: &str,
        compute: F,
    ) -> EngineResult<Arc<EventMetadata>>
    where
        F: FnOnce() -> EngineResult<EventMetadata>,
    {
        let key = (type_id, event_type.to_string());
        if let Some(hit) = self.entries.read().get(&key) {
            return Ok(hit.clone());
        }

        let computed = Arc::new(compute()?);
        Ok(self.entries.write().entry(key).or_insert(computed).clone())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
