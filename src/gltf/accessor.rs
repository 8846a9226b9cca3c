//! Typed views over accessor data.
//!
//! An accessor's component type and shape are only known at runtime. They are
//! resolved once per attribute into a boxed [`AccessorView`] that yields
//! values already converted to the form the clusterer works with.

use super::GltfModel;
use crate::error::{Result, TunerError};
use gltf_json as json;
use json::accessor::{ComponentType, Type};
use json::validation::Checked;
use std::marker::PhantomData;
use tracing::warn;

/// Random access to the converted elements of an accessor.
pub trait AccessorView<T> {
    fn len(&self) -> usize;

    fn get(&self, index: usize) -> T;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A glTF accessor component type.
pub trait Component: Copy {
    const SIZE: usize;

    fn read(bytes: &[u8]) -> Self;

    /// Value as float, applying integer normalization if requested.
    fn to_f32(self, normalized: bool) -> f32;

    /// Value as an index or identifier.
    fn to_index(self) -> u32;

    /// Value as an 8-bit color component.
    fn to_color(self) -> u8;
}

impl Component for i8 {
    const SIZE: usize = 1;
    fn read(bytes: &[u8]) -> Self {
        bytes[0] as i8
    }
    fn to_f32(self, normalized: bool) -> f32 {
        if normalized { (self as f32 / 127.0).max(-1.0) } else { self as f32 }
    }
    fn to_index(self) -> u32 {
        self.max(0) as u32
    }
    fn to_color(self) -> u8 {
        (self.max(0) as u8) << 1
    }
}

impl Component for u8 {
    const SIZE: usize = 1;
    fn read(bytes: &[u8]) -> Self {
        bytes[0]
    }
    fn to_f32(self, normalized: bool) -> f32 {
        if normalized { self as f32 / 255.0 } else { self as f32 }
    }
    fn to_index(self) -> u32 {
        self as u32
    }
    fn to_color(self) -> u8 {
        self
    }
}

impl Component for i16 {
    const SIZE: usize = 2;
    fn read(bytes: &[u8]) -> Self {
        i16::from_le_bytes([bytes[0], bytes[1]])
    }
    fn to_f32(self, normalized: bool) -> f32 {
        if normalized { (self as f32 / 32767.0).max(-1.0) } else { self as f32 }
    }
    fn to_index(self) -> u32 {
        self.max(0) as u32
    }
    fn to_color(self) -> u8 {
        (self.max(0) >> 7) as u8
    }
}

impl Component for u16 {
    const SIZE: usize = 2;
    fn read(bytes: &[u8]) -> Self {
        u16::from_le_bytes([bytes[0], bytes[1]])
    }
    fn to_f32(self, normalized: bool) -> f32 {
        if normalized { self as f32 / 65535.0 } else { self as f32 }
    }
    fn to_index(self) -> u32 {
        self as u32
    }
    fn to_color(self) -> u8 {
        (self >> 8) as u8
    }
}

impl Component for u32 {
    const SIZE: usize = 4;
    fn read(bytes: &[u8]) -> Self {
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
    fn to_f32(self, normalized: bool) -> f32 {
        if normalized { self as f32 / u32::MAX as f32 } else { self as f32 }
    }
    fn to_index(self) -> u32 {
        self
    }
    fn to_color(self) -> u8 {
        (self >> 24) as u8
    }
}

impl Component for f32 {
    const SIZE: usize = 4;
    fn read(bytes: &[u8]) -> Self {
        f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
    fn to_f32(self, _normalized: bool) -> f32 {
        self
    }
    fn to_index(self) -> u32 {
        self.max(0.0) as u32
    }
    fn to_color(self) -> u8 {
        (self * 256.0).clamp(0.0, 255.0) as u8
    }
}

/// Elements of one accessor read as components of type `T`.
pub struct TypedView<'a, T> {
    data: &'a [u8],
    count: usize,
    stride: usize,
    width: usize,
    normalized: bool,
    _component: PhantomData<T>,
}

impl<T: Component> TypedView<'_, T> {
    fn component(&self, index: usize, c: usize) -> T {
        let offset = index * self.stride + c * T::SIZE;
        T::read(&self.data[offset..offset + T::SIZE])
    }
}

impl<T: Component> AccessorView<u32> for TypedView<'_, T> {
    fn len(&self) -> usize {
        self.count
    }
    fn get(&self, index: usize) -> u32 {
        self.component(index, 0).to_index()
    }
}

impl<T: Component> AccessorView<[f32; 2]> for TypedView<'_, T> {
    fn len(&self) -> usize {
        self.count
    }
    fn get(&self, index: usize) -> [f32; 2] {
        [0, 1].map(|c| self.component(index, c).to_f32(self.normalized))
    }
}

impl<T: Component> AccessorView<[f32; 3]> for TypedView<'_, T> {
    fn len(&self) -> usize {
        self.count
    }
    fn get(&self, index: usize) -> [f32; 3] {
        [0, 1, 2].map(|c| self.component(index, c).to_f32(self.normalized))
    }
}

/// Colors are converted to 8-bit RGBA; RGB inputs get an opaque alpha.
impl<T: Component> AccessorView<[u8; 4]> for TypedView<'_, T> {
    fn len(&self) -> usize {
        self.count
    }
    fn get(&self, index: usize) -> [u8; 4] {
        let mut color = [0xff; 4];
        for (c, value) in color.iter_mut().enumerate().take(self.width) {
            *value = self.component(index, c).to_color();
        }
        color
    }
}

/// Accessor storage resolved against its buffer view.
struct RawAccessor<'a> {
    data: &'a [u8],
    count: usize,
    stride: usize,
    width: usize,
    component: ComponentType,
    normalized: bool,
}

fn component_size(component: ComponentType) -> usize {
    match component {
        ComponentType::I8 | ComponentType::U8 => 1,
        ComponentType::I16 | ComponentType::U16 => 2,
        ComponentType::U32 | ComponentType::F32 => 4,
    }
}

fn type_width(type_: Type) -> usize {
    match type_ {
        Type::Scalar => 1,
        Type::Vec2 => 2,
        Type::Vec3 => 3,
        Type::Vec4 | Type::Mat2 => 4,
        Type::Mat3 => 9,
        Type::Mat4 => 16,
    }
}

impl<'a> RawAccessor<'a> {
    fn resolve(model: &'a GltfModel, index: usize) -> Result<Self> {
        let invalid = |reason: &str| TunerError::InvalidGltf(format!("accessor {index} {reason}"));
        let accessor = model
            .root
            .accessors
            .get(index)
            .ok_or_else(|| invalid("does not exist"))?;
        let (Checked::Valid(component), Checked::Valid(type_)) = (&accessor.component_type, &accessor.type_) else {
            return Err(invalid("has an invalid type"));
        };
        if accessor.sparse.is_some() {
            return Err(invalid("is sparse, which is not supported"));
        }
        let view_index = accessor
            .buffer_view
            .ok_or_else(|| invalid("has no buffer view"))?
            .value();
        let view = model
            .root
            .buffer_views
            .get(view_index)
            .ok_or_else(|| invalid("references a missing buffer view"))?;
        let component = component.0;
        let width = type_width(*type_);
        let element_size = width * component_size(component);
        let stride = view.byte_stride.map_or(element_size, |s| s.0);
        let offset = accessor.byte_offset.map_or(0, |o| o.0 as usize);
        let count = usize::try_from(accessor.count.0).map_err(|_| invalid("has an oversized count"))?;

        let data = model
            .buffer_view_data(view_index)
            .and_then(|data| data.get(offset..))
            .ok_or_else(|| invalid("exceeds its buffer view"))?;
        let required = match count {
            0 => Some(0),
            n => (n - 1).checked_mul(stride).and_then(|span| span.checked_add(element_size)),
        };
        match required {
            Some(required) if stride >= element_size && data.len() >= required => {}
            _ => return Err(invalid("exceeds its buffer view")),
        }
        Ok(Self {
            data,
            count,
            stride,
            width,
            component,
            normalized: accessor.normalized,
        })
    }

    /// Resolved accessor, or `None` with a warning: malformed optional data reads as absent.
    fn resolve_or_warn(model: &'a GltfModel, index: usize) -> Option<Self> {
        Self::resolve(model, index).map_err(|e| warn!("{e}")).ok()
    }

    fn typed<T>(&self) -> TypedView<'a, T> {
        TypedView {
            data: self.data,
            count: self.count,
            stride: self.stride,
            width: self.width,
            normalized: self.normalized,
            _component: PhantomData,
        }
    }

    fn dispatch<O>(self) -> Box<dyn AccessorView<O> + 'a>
    where
        TypedView<'a, i8>: AccessorView<O>,
        TypedView<'a, u8>: AccessorView<O>,
        TypedView<'a, i16>: AccessorView<O>,
        TypedView<'a, u16>: AccessorView<O>,
        TypedView<'a, u32>: AccessorView<O>,
        TypedView<'a, f32>: AccessorView<O>,
    {
        match self.component {
            ComponentType::I8 => Box::new(self.typed::<i8>()),
            ComponentType::U8 => Box::new(self.typed::<u8>()),
            ComponentType::I16 => Box::new(self.typed::<i16>()),
            ComponentType::U16 => Box::new(self.typed::<u16>()),
            ComponentType::U32 => Box::new(self.typed::<u32>()),
            ComponentType::F32 => Box::new(self.typed::<f32>()),
        }
    }
}

/// Index buffer of a primitive: unsigned scalars.
pub fn indices(model: &GltfModel, accessor: usize) -> Option<Box<dyn AccessorView<u32> + '_>> {
    let raw = RawAccessor::resolve_or_warn(model, accessor)?;
    let unsigned_int = matches!(raw.component, ComponentType::U8 | ComponentType::U16 | ComponentType::U32);
    (raw.width == 1 && unsigned_int).then(|| raw.dispatch())
}

/// Feature identifiers: scalars of any component type.
pub fn feature_ids(model: &GltfModel, accessor: usize) -> Option<Box<dyn AccessorView<u32> + '_>> {
    let raw = RawAccessor::resolve_or_warn(model, accessor)?;
    (raw.width == 1).then(|| raw.dispatch())
}

/// Vertex colors (RGB or RGBA) converted to 8-bit RGBA.
pub fn colors(model: &GltfModel, accessor: usize) -> Option<Box<dyn AccessorView<[u8; 4]> + '_>> {
    let raw = RawAccessor::resolve_or_warn(model, accessor)?;
    let supported = matches!(raw.component, ComponentType::U8 | ComponentType::U16 | ComponentType::F32);
    (supported && matches!(raw.width, 3 | 4)).then(|| raw.dispatch())
}

/// Three-component vectors, such as positions and normals.
pub fn vec3(model: &GltfModel, accessor: usize) -> Option<Box<dyn AccessorView<[f32; 3]> + '_>> {
    let raw = RawAccessor::resolve_or_warn(model, accessor)?;
    (raw.width == 3).then(|| raw.dispatch())
}

/// Two-component vectors, such as texture coordinates.
pub fn vec2(model: &GltfModel, accessor: usize) -> Option<Box<dyn AccessorView<[f32; 2]> + '_>> {
    let raw = RawAccessor::resolve_or_warn(model, accessor)?;
    (raw.width == 2).then(|| raw.dispatch())
}
