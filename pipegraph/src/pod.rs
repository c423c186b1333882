//! The self-describing value format used for all protocol payloads
//! and negotiation parameters.
//!
//! A pod is an 8-byte header `(size: u32, type: u32)` followed by
//! `size` body bytes, padded to an 8-byte boundary. Composite pods
//! (structs, objects, props, arrays) nest other pods in their body.
//!
//! [`PodBuilder`] encodes into a growable buffer, [`Pod`] is a
//! borrowed view that parses lazily and fails cleanly on truncated or
//! mistyped input.

use {std::str, thiserror::Error};

#[cfg(test)]
mod tests;

/// Value for object ids and buffer ids that are not set.
pub const INVALID_ID: u32 = 0xffff_ffff;

pub(crate) const HEADER_SIZE: usize = 8;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum PodType {
    None = 1,
    Bool = 2,
    Id = 3,
    Int = 4,
    Long = 5,
    Float = 6,
    Double = 7,
    String = 8,
    Bytes = 9,
    Pointer = 10,
    Fd = 11,
    Rectangle = 12,
    Fraction = 13,
    Bitmap = 14,
    Array = 15,
    Struct = 16,
    Object = 17,
    Prop = 18,
}

impl PodType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => PodType::None,
            2 => PodType::Bool,
            3 => PodType::Id,
            4 => PodType::Int,
            5 => PodType::Long,
            6 => PodType::Float,
            7 => PodType::Double,
            8 => PodType::String,
            9 => PodType::Bytes,
            10 => PodType::Pointer,
            11 => PodType::Fd,
            12 => PodType::Rectangle,
            13 => PodType::Fraction,
            14 => PodType::Bitmap,
            15 => PodType::Array,
            16 => PodType::Struct,
            17 => PodType::Object,
            18 => PodType::Prop,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            PodType::None => "none",
            PodType::Bool => "bool",
            PodType::Id => "id",
            PodType::Int => "int",
            PodType::Long => "long",
            PodType::Float => "float",
            PodType::Double => "double",
            PodType::String => "string",
            PodType::Bytes => "bytes",
            PodType::Pointer => "pointer",
            PodType::Fd => "fd",
            PodType::Rectangle => "rectangle",
            PodType::Fraction => "fraction",
            PodType::Bitmap => "bitmap",
            PodType::Array => "array",
            PodType::Struct => "struct",
            PodType::Object => "object",
            PodType::Prop => "prop",
        }
    }
}

#[derive(Debug, Error)]
pub enum PodError {
    #[error("the pod is truncated")]
    Truncated,
    #[error("unknown pod type {0}")]
    UnknownType(u32),
    #[error("pod has type {} but {} was expected", .found.name(), .expected.name())]
    WrongType { found: PodType, expected: PodType },
    #[error("body size {size} is invalid for a {} pod", .ty.name())]
    BadSize { ty: PodType, size: u32 },
    #[error("string is not NUL-terminated")]
    NotTerminated,
    #[error("string is not valid UTF-8")]
    NonUtf8,
    #[error("a required field is missing")]
    MissingField,
    #[error("there are trailing bytes after the pod")]
    TrailingBytes,
    #[error("the value is out of range")]
    InvalidValue,
}

pub(crate) fn round_up8(n: usize) -> usize {
    (n + 7) & !7
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32, PodError> {
    let bytes = data
        .get(offset..offset + 4)
        .ok_or(PodError::Truncated)?
        .try_into()
        .unwrap();
    Ok(u32::from_ne_bytes(bytes))
}

fn read_u64(data: &[u8], offset: usize) -> Result<u64, PodError> {
    let bytes = data
        .get(offset..offset + 8)
        .ok_or(PodError::Truncated)?
        .try_into()
        .unwrap();
    Ok(u64::from_ne_bytes(bytes))
}

/// A borrowed view of a single pod.
#[derive(Copy, Clone)]
pub struct Pod<'a> {
    ty: PodType,
    body: &'a [u8],
}

impl<'a> Pod<'a> {
    pub(crate) fn with_body(ty: PodType, body: &'a [u8]) -> Pod<'a> {
        Pod { ty, body }
    }

    /// Parses one pod at the start of `data`. Returns the pod and the
    /// padded number of bytes it spans.
    pub fn parse(data: &'a [u8]) -> Result<(Pod<'a>, usize), PodError> {
        let size = read_u32(data, 0)? as usize;
        let raw_ty = read_u32(data, 4)?;
        let ty = PodType::from_raw(raw_ty).ok_or(PodError::UnknownType(raw_ty))?;
        let body = data
            .get(HEADER_SIZE..HEADER_SIZE + size)
            .ok_or(PodError::Truncated)?;
        let span = HEADER_SIZE + round_up8(size);
        Ok((Pod { ty, body }, span.min(data.len())))
    }

    /// Parses `data` as exactly one pod with no trailing bytes beyond
    /// padding.
    pub fn from_slice(data: &'a [u8]) -> Result<Pod<'a>, PodError> {
        let (pod, span) = Pod::parse(data)?;
        if data.len() > round_up8(span) {
            return Err(PodError::TrailingBytes);
        }
        Ok(pod)
    }

    pub fn ty(&self) -> PodType {
        self.ty
    }

    pub fn body(&self) -> &'a [u8] {
        self.body
    }

    fn expect(&self, expected: PodType) -> Result<(), PodError> {
        if self.ty != expected {
            return Err(PodError::WrongType {
                found: self.ty,
                expected,
            });
        }
        Ok(())
    }

    fn fixed_body(&self, expected: PodType, size: usize) -> Result<&'a [u8], PodError> {
        self.expect(expected)?;
        if self.body.len() != size {
            return Err(PodError::BadSize {
                ty: self.ty,
                size: self.body.len() as u32,
            });
        }
        Ok(self.body)
    }

    pub fn is_none(&self) -> bool {
        self.ty == PodType::None
    }

    pub fn as_bool(&self) -> Result<bool, PodError> {
        let body = self.fixed_body(PodType::Bool, 4)?;
        Ok(read_u32(body, 0)? != 0)
    }

    pub fn as_id(&self) -> Result<u32, PodError> {
        let body = self.fixed_body(PodType::Id, 4)?;
        read_u32(body, 0)
    }

    pub fn as_int(&self) -> Result<i32, PodError> {
        let body = self.fixed_body(PodType::Int, 4)?;
        Ok(read_u32(body, 0)? as i32)
    }

    pub fn as_long(&self) -> Result<i64, PodError> {
        let body = self.fixed_body(PodType::Long, 8)?;
        Ok(read_u64(body, 0)? as i64)
    }

    pub fn as_float(&self) -> Result<f32, PodError> {
        let body = self.fixed_body(PodType::Float, 4)?;
        Ok(f32::from_bits(read_u32(body, 0)?))
    }

    pub fn as_double(&self) -> Result<f64, PodError> {
        let body = self.fixed_body(PodType::Double, 8)?;
        Ok(f64::from_bits(read_u64(body, 0)?))
    }

    pub fn as_str(&self) -> Result<&'a str, PodError> {
        self.expect(PodType::String)?;
        let Some((&0, init)) = self.body.split_last() else {
            return Err(PodError::NotTerminated);
        };
        str::from_utf8(init).map_err(|_| PodError::NonUtf8)
    }

    pub fn as_bytes(&self) -> Result<&'a [u8], PodError> {
        self.expect(PodType::Bytes)?;
        Ok(self.body)
    }

    /// Returns the index into the ancillary fd queue of the enclosing
    /// message.
    pub fn as_fd_index(&self) -> Result<i64, PodError> {
        let body = self.fixed_body(PodType::Fd, 8)?;
        Ok(read_u64(body, 0)? as i64)
    }

    pub fn as_rectangle(&self) -> Result<(u32, u32), PodError> {
        let body = self.fixed_body(PodType::Rectangle, 8)?;
        Ok((read_u32(body, 0)?, read_u32(body, 4)?))
    }

    pub fn as_fraction(&self) -> Result<(u32, u32), PodError> {
        let body = self.fixed_body(PodType::Fraction, 8)?;
        Ok((read_u32(body, 0)?, read_u32(body, 4)?))
    }

    pub fn as_pointer(&self) -> Result<(u32, u64), PodError> {
        let body = self.fixed_body(PodType::Pointer, 16)?;
        Ok((read_u32(body, 0)?, read_u64(body, 8)?))
    }

    pub fn as_bitmap(&self) -> Result<&'a [u8], PodError> {
        self.expect(PodType::Bitmap)?;
        Ok(self.body)
    }

    pub fn as_struct(&self) -> Result<PodIter<'a>, PodError> {
        self.expect(PodType::Struct)?;
        Ok(PodIter {
            data: self.body,
            offset: 0,
        })
    }

    pub fn as_array(&self) -> Result<PodArray<'a>, PodError> {
        self.expect(PodType::Array)?;
        let child_size = read_u32(self.body, 0)?;
        let raw_ty = read_u32(self.body, 4)?;
        let child_ty = PodType::from_raw(raw_ty).ok_or(PodError::UnknownType(raw_ty))?;
        if child_size == 0 {
            return Err(PodError::BadSize {
                ty: PodType::Array,
                size: 0,
            });
        }
        Ok(PodArray {
            child_ty,
            child_size,
            items: &self.body[8..],
        })
    }

    pub fn as_object(&self) -> Result<PodObject<'a>, PodError> {
        self.expect(PodType::Object)?;
        let type_id = read_u32(self.body, 0)?;
        let object_id = read_u32(self.body, 4)?;
        Ok(PodObject {
            type_id,
            object_id,
            body: &self.body[8..],
        })
    }

    /// Re-encodes this pod, header included.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(HEADER_SIZE + round_up8(self.body.len()));
        data.extend_from_slice(&(self.body.len() as u32).to_ne_bytes());
        data.extend_from_slice(&(self.ty as u32).to_ne_bytes());
        data.extend_from_slice(self.body);
        while data.len() % 8 != 0 {
            data.push(0);
        }
        data
    }
}

/// Iterates over the pods in a struct body.
#[derive(Copy, Clone)]
pub struct PodIter<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> PodIter<'a> {
    pub fn has_next(&self) -> bool {
        self.offset + HEADER_SIZE <= self.data.len()
    }

    /// Returns the next pod, failing with [`PodError::MissingField`]
    /// when the struct is exhausted.
    pub fn pod(&mut self) -> Result<Pod<'a>, PodError> {
        if !self.has_next() {
            return Err(PodError::MissingField);
        }
        let (pod, span) = Pod::parse(&self.data[self.offset..])?;
        self.offset += span;
        Ok(pod)
    }

    pub fn int(&mut self) -> Result<i32, PodError> {
        self.pod()?.as_int()
    }

    /// An unsigned value carried in an int pod (object ids, counts,
    /// masks).
    pub fn uint(&mut self) -> Result<u32, PodError> {
        Ok(self.int()? as u32)
    }

    pub fn id(&mut self) -> Result<u32, PodError> {
        self.pod()?.as_id()
    }

    pub fn long(&mut self) -> Result<i64, PodError> {
        self.pod()?.as_long()
    }

    pub fn string(&mut self) -> Result<&'a str, PodError> {
        self.pod()?.as_str()
    }

    pub fn fd_index(&mut self) -> Result<i64, PodError> {
        self.pod()?.as_fd_index()
    }
}

impl<'a> Iterator for PodIter<'a> {
    type Item = Result<Pod<'a>, PodError>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.has_next() {
            return None;
        }
        Some(self.pod())
    }
}

/// A parsed array pod.
#[derive(Copy, Clone)]
pub struct PodArray<'a> {
    pub child_ty: PodType,
    pub child_size: u32,
    items: &'a [u8],
}

impl<'a> PodArray<'a> {
    pub fn len(&self) -> usize {
        self.items.len() / self.child_size as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn value(&self, idx: usize) -> Result<Pod<'a>, PodError> {
        let start = idx * self.child_size as usize;
        let body = self
            .items
            .get(start..start + self.child_size as usize)
            .ok_or(PodError::Truncated)?;
        Ok(Pod {
            ty: self.child_ty,
            body,
        })
    }

    pub fn ids(&self) -> Result<Vec<u32>, PodError> {
        (0..self.len()).map(|i| self.value(i)?.as_id()).collect()
    }
}

/// A parsed object pod: a type id, an object id, and a list of props.
#[derive(Copy, Clone)]
pub struct PodObject<'a> {
    pub type_id: u32,
    pub object_id: u32,
    body: &'a [u8],
}

impl<'a> PodObject<'a> {
    pub fn props(&self) -> PropIter<'a> {
        PropIter {
            iter: PodIter {
                data: self.body,
                offset: 0,
            },
        }
    }

    pub fn find(&self, key: u32) -> Result<Option<PodProp<'a>>, PodError> {
        for prop in self.props() {
            let prop = prop?;
            if prop.key == key {
                return Ok(Some(prop));
            }
        }
        Ok(None)
    }
}

pub struct PropIter<'a> {
    iter: PodIter<'a>,
}

impl<'a> Iterator for PropIter<'a> {
    type Item = Result<PodProp<'a>, PodError>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.iter.has_next() {
            return None;
        }
        Some(self.next_prop())
    }
}

impl<'a> PropIter<'a> {
    fn next_prop(&mut self) -> Result<PodProp<'a>, PodError> {
        let pod = self.iter.pod()?;
        pod.expect(PodType::Prop)?;
        let body = pod.body;
        let key = read_u32(body, 0)?;
        let flags = read_u32(body, 4)?;
        let child_size = read_u32(body, 8)?;
        let raw_ty = read_u32(body, 12)?;
        let child_ty = PodType::from_raw(raw_ty).ok_or(PodError::UnknownType(raw_ty))?;
        if child_size == 0 {
            return Err(PodError::BadSize {
                ty: PodType::Prop,
                size: 0,
            });
        }
        Ok(PodProp {
            key,
            flags,
            child_ty,
            child_size,
            values: &body[16..],
        })
    }
}

/// A property of an object pod: the default value followed by
/// range/enum alternatives, as selected by the flags.
#[derive(Copy, Clone)]
pub struct PodProp<'a> {
    pub key: u32,
    pub flags: u32,
    pub child_ty: PodType,
    pub child_size: u32,
    values: &'a [u8],
}

impl<'a> PodProp<'a> {
    fn stride(&self) -> usize {
        round_up8(self.child_size as usize)
    }

    pub fn n_values(&self) -> usize {
        self.values.len() / self.stride()
    }

    pub fn value(&self, idx: usize) -> Result<Pod<'a>, PodError> {
        let start = idx * self.stride();
        let body = self
            .values
            .get(start..start + self.child_size as usize)
            .ok_or(PodError::Truncated)?;
        Ok(Pod {
            ty: self.child_ty,
            body,
        })
    }

    /// The default value.
    pub fn first(&self) -> Result<Pod<'a>, PodError> {
        self.value(0)
    }

    pub fn raw_value(&self, idx: usize) -> Result<&'a [u8], PodError> {
        let start = idx * self.stride();
        self.values
            .get(start..start + self.child_size as usize)
            .ok_or(PodError::Truncated)
    }
}

/// Encodes pods into a growable buffer.
#[derive(Default)]
pub struct PodBuilder {
    data: Vec<u8>,
}

impl PodBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn pad(&mut self) {
        while self.data.len() % 8 != 0 {
            self.data.push(0);
        }
    }

    fn header(&mut self, size: u32, ty: PodType) {
        self.data.extend_from_slice(&size.to_ne_bytes());
        self.data.extend_from_slice(&(ty as u32).to_ne_bytes());
    }

    fn primitive(&mut self, ty: PodType, body: &[u8]) {
        self.header(body.len() as u32, ty);
        self.data.extend_from_slice(body);
        self.pad();
    }

    pub fn none(&mut self) {
        self.primitive(PodType::None, &[]);
    }

    pub fn bool_(&mut self, v: bool) {
        self.primitive(PodType::Bool, &(v as u32).to_ne_bytes());
    }

    pub fn id(&mut self, v: u32) {
        self.primitive(PodType::Id, &v.to_ne_bytes());
    }

    pub fn int(&mut self, v: i32) {
        self.primitive(PodType::Int, &v.to_ne_bytes());
    }

    /// An unsigned value carried in an int pod.
    pub fn uint(&mut self, v: u32) {
        self.int(v as i32);
    }

    pub fn long(&mut self, v: i64) {
        self.primitive(PodType::Long, &v.to_ne_bytes());
    }

    pub fn float(&mut self, v: f32) {
        self.primitive(PodType::Float, &v.to_bits().to_ne_bytes());
    }

    pub fn double(&mut self, v: f64) {
        self.primitive(PodType::Double, &v.to_bits().to_ne_bytes());
    }

    pub fn string(&mut self, v: &str) {
        self.header(v.len() as u32 + 1, PodType::String);
        self.data.extend_from_slice(v.as_bytes());
        self.data.push(0);
        self.pad();
    }

    pub fn bytes(&mut self, v: &[u8]) {
        self.primitive(PodType::Bytes, v);
    }

    pub fn fd(&mut self, index: i64) {
        self.primitive(PodType::Fd, &index.to_ne_bytes());
    }

    pub fn rectangle(&mut self, width: u32, height: u32) {
        let mut body = [0; 8];
        body[..4].copy_from_slice(&width.to_ne_bytes());
        body[4..].copy_from_slice(&height.to_ne_bytes());
        self.primitive(PodType::Rectangle, &body);
    }

    pub fn fraction(&mut self, num: u32, denom: u32) {
        let mut body = [0; 8];
        body[..4].copy_from_slice(&num.to_ne_bytes());
        body[4..].copy_from_slice(&denom.to_ne_bytes());
        self.primitive(PodType::Fraction, &body);
    }

    pub fn pointer(&mut self, type_id: u32, value: u64) {
        let mut body = [0; 16];
        body[..4].copy_from_slice(&type_id.to_ne_bytes());
        body[8..].copy_from_slice(&value.to_ne_bytes());
        self.primitive(PodType::Pointer, &body);
    }

    pub fn bitmap(&mut self, v: &[u8]) {
        self.primitive(PodType::Bitmap, v);
    }

    pub fn array_id(&mut self, items: &[u32]) {
        self.header(8 + 4 * items.len() as u32, PodType::Array);
        self.data.extend_from_slice(&4u32.to_ne_bytes());
        self.data
            .extend_from_slice(&(PodType::Id as u32).to_ne_bytes());
        for item in items {
            self.data.extend_from_slice(&item.to_ne_bytes());
        }
        self.pad();
    }

    /// Appends an already-encoded pod.
    pub fn raw(&mut self, pod: &[u8]) {
        self.data.extend_from_slice(pod);
        self.pad();
    }

    /// Appends `pod` if present, a none pod otherwise.
    pub fn option_raw(&mut self, pod: Option<&[u8]>) {
        match pod {
            Some(pod) => self.raw(pod),
            None => self.none(),
        }
    }

    fn composite(&mut self, ty: PodType, f: impl FnOnce(&mut PodBuilder)) {
        let header = self.data.len();
        self.header(0, ty);
        f(self);
        let size = (self.data.len() - header - HEADER_SIZE) as u32;
        self.data[header..header + 4].copy_from_slice(&size.to_ne_bytes());
    }

    pub fn push_struct(&mut self, f: impl FnOnce(&mut PodBuilder)) {
        self.composite(PodType::Struct, f);
    }

    pub fn push_object(&mut self, type_id: u32, object_id: u32, f: impl FnOnce(&mut PodBuilder)) {
        self.composite(PodType::Object, |b| {
            b.data.extend_from_slice(&type_id.to_ne_bytes());
            b.data.extend_from_slice(&object_id.to_ne_bytes());
            f(b);
        });
    }

    fn prop(&mut self, key: u32, flags: u32, child_ty: PodType, child_size: u32, n: usize) {
        self.header(
            16 + (round_up8(child_size as usize) * n) as u32,
            PodType::Prop,
        );
        self.data.extend_from_slice(&key.to_ne_bytes());
        self.data.extend_from_slice(&flags.to_ne_bytes());
        self.data.extend_from_slice(&child_size.to_ne_bytes());
        self.data
            .extend_from_slice(&(child_ty as u32).to_ne_bytes());
    }

    fn prop_value(&mut self, body: &[u8]) {
        self.data.extend_from_slice(body);
        self.pad();
    }

    pub fn prop_id(&mut self, key: u32, flags: u32, values: &[u32]) {
        self.prop(key, flags, PodType::Id, 4, values.len());
        for v in values {
            self.prop_value(&v.to_ne_bytes());
        }
    }

    pub fn prop_int(&mut self, key: u32, flags: u32, values: &[i32]) {
        self.prop(key, flags, PodType::Int, 4, values.len());
        for v in values {
            self.prop_value(&v.to_ne_bytes());
        }
    }

    pub fn prop_long(&mut self, key: u32, flags: u32, values: &[i64]) {
        self.prop(key, flags, PodType::Long, 8, values.len());
        for v in values {
            self.prop_value(&v.to_ne_bytes());
        }
    }

    /// A property with raw child values of uniform size.
    pub fn prop_raw(
        &mut self,
        key: u32,
        flags: u32,
        child_ty: PodType,
        child_size: u32,
        values: &[&[u8]],
    ) {
        self.prop(key, flags, child_ty, child_size, values.len());
        for v in values {
            debug_assert_eq!(v.len(), child_size as usize);
            self.prop_value(v);
        }
    }
}
