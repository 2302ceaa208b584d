//! Script field types and their fixed-size value encoding.
//!
//! Every exposed field of a script class has a [`FieldType`] from a closed
//! set. Values travel between the editor, the persisted scene, and live
//! managed objects as a [`FieldBuffer`]: 16 bytes, 16-byte aligned, holding the
//! value in little-endian layout starting at byte 0 (the layout of the value in
//! managed linear memory). Entity references are the one exception: the buffer
//! holds the referenced entity's raw UUID (`u64`, `0` = unset), while managed
//! memory holds the address of an entity wrapper object.
//!
//! Typed access goes through the [`FieldValue`] trait, implemented for every
//! Rust type that corresponds to a [`FieldType`].

use lumen_scene::Uuid;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// FieldType
// ---------------------------------------------------------------------------

/// The closed set of field types the engine knows how to marshal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FieldType {
    /// Type could not be resolved (unknown managed type, or not yet resolved
    /// against a class descriptor).
    #[default]
    Invalid,
    Bool,
    SByte,
    Byte,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    Float,
    Double,
    Vector2,
    Vector3,
    Vector4,
    /// Reference to another entity.
    Entity,
}

/// Managed type names recognised by the reflector, and what they map to.
const MANAGED_TYPE_NAMES: &[(&str, FieldType)] = &[
    ("System.Boolean", FieldType::Bool),
    ("System.SByte", FieldType::SByte),
    ("System.Byte", FieldType::Byte),
    ("System.Int16", FieldType::Short),
    ("System.UInt16", FieldType::UShort),
    ("System.Int32", FieldType::Int),
    ("System.UInt32", FieldType::UInt),
    ("System.Int64", FieldType::Long),
    ("System.UInt64", FieldType::ULong),
    ("System.Single", FieldType::Float),
    ("System.Double", FieldType::Double),
    ("Lumen.Vector2", FieldType::Vector2),
    ("Lumen.Vector3", FieldType::Vector3),
    ("Lumen.Vector4", FieldType::Vector4),
    ("Lumen.Entity", FieldType::Entity),
];

impl FieldType {
    /// Map a managed type name to a field type. Unknown names yield
    /// [`FieldType::Invalid`].
    pub fn from_managed_name(name: &str) -> Self {
        MANAGED_TYPE_NAMES
            .iter()
            .find(|(managed, _)| *managed == name)
            .map(|(_, ty)| *ty)
            .unwrap_or(FieldType::Invalid)
    }

    /// The managed type name for this field type, if it has one.
    pub fn managed_name(self) -> Option<&'static str> {
        MANAGED_TYPE_NAMES
            .iter()
            .find(|(_, ty)| *ty == self)
            .map(|(name, _)| *name)
    }

    /// Bytes the field occupies inside a managed object.
    ///
    /// Entity fields hold a 32-bit object address.
    pub fn managed_size(self) -> usize {
        match self {
            FieldType::Invalid => 0,
            FieldType::Bool | FieldType::SByte | FieldType::Byte => 1,
            FieldType::Short | FieldType::UShort => 2,
            FieldType::Int | FieldType::UInt | FieldType::Float | FieldType::Entity => 4,
            FieldType::Long | FieldType::ULong | FieldType::Double | FieldType::Vector2 => 8,
            FieldType::Vector3 => 12,
            FieldType::Vector4 => 16,
        }
    }

    /// Bytes the value occupies inside a [`FieldBuffer`].
    pub fn buffer_size(self) -> usize {
        match self {
            FieldType::Entity => 8,
            other => other.managed_size(),
        }
    }

    pub fn is_valid(self) -> bool {
        self != FieldType::Invalid
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// FieldBuffer
// ---------------------------------------------------------------------------

/// Capacity of a [`FieldBuffer`] in bytes: large enough for a 4-component
/// `f32` vector, the widest field type.
pub const FIELD_BUFFER_SIZE: usize = 16;

/// Alignment of a [`FieldBuffer`] in bytes.
pub const FIELD_BUFFER_ALIGN: usize = 16;

const _: () = assert!(FIELD_BUFFER_SIZE >= 4 * std::mem::size_of::<f32>());
const _: () = assert!(std::mem::size_of::<FieldBuffer>() == FIELD_BUFFER_SIZE);
const _: () = assert!(std::mem::align_of::<FieldBuffer>() == FIELD_BUFFER_ALIGN);

/// Raw storage for one field value. See the module docs for the layout.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(C, align(16))]
pub struct FieldBuffer([u8; FIELD_BUFFER_SIZE]);

impl FieldBuffer {
    /// An all-zero buffer (the default value of every field type).
    pub const ZERO: FieldBuffer = FieldBuffer([0; FIELD_BUFFER_SIZE]);

    /// Encode a typed value.
    pub fn from_value<T: FieldValue>(value: T) -> Self {
        let mut buf = Self::ZERO;
        value.write(&mut buf);
        buf
    }

    /// Decode a typed value. The caller is responsible for matching `T` to
    /// the field type the buffer was written with.
    pub fn to_value<T: FieldValue>(&self) -> T {
        T::read(self)
    }

    /// Copy `bytes` into the front of a zeroed buffer. Extra bytes beyond the
    /// capacity are ignored.
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut buf = Self::ZERO;
        let len = bytes.len().min(FIELD_BUFFER_SIZE);
        buf.0[..len].copy_from_slice(&bytes[..len]);
        buf
    }

    pub fn as_bytes(&self) -> &[u8; FIELD_BUFFER_SIZE] {
        &self.0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; FIELD_BUFFER_SIZE] {
        &mut self.0
    }

    /// The raw UUID stored by an entity-typed value (`0` when unset).
    pub fn entity_uuid(&self) -> u64 {
        u64::read(self)
    }
}

impl std::fmt::Debug for FieldBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FieldBuffer(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

// ---------------------------------------------------------------------------
// Value types
// ---------------------------------------------------------------------------

/// Two-component `f32` vector (`Lumen.Vector2`).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector2 {
    pub x: f32,
    pub y: f32,
}

/// Three-component `f32` vector (`Lumen.Vector3`).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Four-component `f32` vector (`Lumen.Vector4`).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector4 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Vector2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

impl Vector3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

impl Vector4 {
    pub fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }
}

/// A reference to an entity, as seen by an entity-typed script field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntityRef(pub Option<Uuid>);

impl EntityRef {
    /// The unset reference.
    pub const NONE: EntityRef = EntityRef(None);

    pub fn to(uuid: Uuid) -> Self {
        Self(Some(uuid))
    }

    pub fn uuid(self) -> Option<Uuid> {
        self.0
    }
}

// ---------------------------------------------------------------------------
// FieldValue
// ---------------------------------------------------------------------------

/// A Rust type that maps onto one [`FieldType`].
pub trait FieldValue: Copy + Default {
    /// The field type this Rust type corresponds to.
    const FIELD_TYPE: FieldType;

    /// Encode into the front of `buf`.
    fn write(self, buf: &mut FieldBuffer);

    /// Decode from the front of `buf`.
    fn read(buf: &FieldBuffer) -> Self;
}

macro_rules! scalar_field_value {
    ($($ty:ty => $field_type:ident),* $(,)?) => {
        $(
            impl FieldValue for $ty {
                const FIELD_TYPE: FieldType = FieldType::$field_type;

                fn write(self, buf: &mut FieldBuffer) {
                    let bytes = self.to_le_bytes();
                    buf.0[..bytes.len()].copy_from_slice(&bytes);
                }

                fn read(buf: &FieldBuffer) -> Self {
                    let mut bytes = [0u8; std::mem::size_of::<$ty>()];
                    bytes.copy_from_slice(&buf.0[..std::mem::size_of::<$ty>()]);
                    <$ty>::from_le_bytes(bytes)
                }
            }
        )*
    };
}

scalar_field_value! {
    i8 => SByte,
    u8 => Byte,
    i16 => Short,
    u16 => UShort,
    i32 => Int,
    u32 => UInt,
    i64 => Long,
    u64 => ULong,
    f32 => Float,
    f64 => Double,
}

impl FieldValue for bool {
    const FIELD_TYPE: FieldType = FieldType::Bool;

    fn write(self, buf: &mut FieldBuffer) {
        buf.0[0] = u8::from(self);
    }

    fn read(buf: &FieldBuffer) -> Self {
        buf.0[0] != 0
    }
}

/// Write `components` as consecutive little-endian `f32`s.
fn write_f32s(buf: &mut FieldBuffer, components: &[f32]) {
    for (i, c) in components.iter().enumerate() {
        buf.0[i * 4..i * 4 + 4].copy_from_slice(&c.to_le_bytes());
    }
}

fn read_f32(buf: &FieldBuffer, index: usize) -> f32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf.0[index * 4..index * 4 + 4]);
    f32::from_le_bytes(bytes)
}

impl FieldValue for Vector2 {
    const FIELD_TYPE: FieldType = FieldType::Vector2;

    fn write(self, buf: &mut FieldBuffer) {
        write_f32s(buf, &[self.x, self.y]);
    }

    fn read(buf: &FieldBuffer) -> Self {
        Self::new(read_f32(buf, 0), read_f32(buf, 1))
    }
}

impl FieldValue for Vector3 {
    const FIELD_TYPE: FieldType = FieldType::Vector3;

    fn write(self, buf: &mut FieldBuffer) {
        write_f32s(buf, &[self.x, self.y, self.z]);
    }

    fn read(buf: &FieldBuffer) -> Self {
        Self::new(read_f32(buf, 0), read_f32(buf, 1), read_f32(buf, 2))
    }
}

impl FieldValue for Vector4 {
    const FIELD_TYPE: FieldType = FieldType::Vector4;

    fn write(self, buf: &mut FieldBuffer) {
        write_f32s(buf, &[self.x, self.y, self.z, self.w]);
    }

    fn read(buf: &FieldBuffer) -> Self {
        Self::new(
            read_f32(buf, 0),
            read_f32(buf, 1),
            read_f32(buf, 2),
            read_f32(buf, 3),
        )
    }
}

impl FieldValue for EntityRef {
    const FIELD_TYPE: FieldType = FieldType::Entity;

    fn write(self, buf: &mut FieldBuffer) {
        self.0.map_or(0, Uuid::to_raw).write(buf);
    }

    fn read(buf: &FieldBuffer) -> Self {
        EntityRef(Uuid::from_raw(u64::read(buf)))
    }
}

// ---------------------------------------------------------------------------
// JSON encoding (persisted field values)
// ---------------------------------------------------------------------------

/// Encode a buffer as the JSON value used in persisted scenes.
///
/// Scalars become numbers/booleans, vectors become arrays, entity references
/// become their raw UUID. Invalid fields encode as `null`. Non-finite floats
/// have no JSON number form and encode as their bit pattern,
/// `{"bits": "0x7fc00000"}`.
pub fn buffer_to_json(field_type: FieldType, buf: &FieldBuffer) -> serde_json::Value {
    use serde_json::json;
    match field_type {
        FieldType::Invalid => serde_json::Value::Null,
        FieldType::Bool => json!(bool::read(buf)),
        FieldType::SByte => json!(i8::read(buf)),
        FieldType::Byte => json!(u8::read(buf)),
        FieldType::Short => json!(i16::read(buf)),
        FieldType::UShort => json!(u16::read(buf)),
        FieldType::Int => json!(i32::read(buf)),
        FieldType::UInt => json!(u32::read(buf)),
        FieldType::Long => json!(i64::read(buf)),
        FieldType::ULong => json!(u64::read(buf)),
        FieldType::Float => f32_to_json(f32::read(buf)),
        FieldType::Double => f64_to_json(f64::read(buf)),
        FieldType::Vector2 => {
            let v = Vector2::read(buf);
            json!([f32_to_json(v.x), f32_to_json(v.y)])
        }
        FieldType::Vector3 => {
            let v = Vector3::read(buf);
            json!([f32_to_json(v.x), f32_to_json(v.y), f32_to_json(v.z)])
        }
        FieldType::Vector4 => {
            let v = Vector4::read(buf);
            json!([f32_to_json(v.x), f32_to_json(v.y), f32_to_json(v.z), f32_to_json(v.w)])
        }
        FieldType::Entity => json!(buf.entity_uuid()),
    }
}

fn f32_to_json(value: f32) -> serde_json::Value {
    if value.is_finite() {
        serde_json::json!(value)
    } else {
        serde_json::json!({ "bits": format!("{:#010x}", value.to_bits()) })
    }
}

fn f64_to_json(value: f64) -> serde_json::Value {
    if value.is_finite() {
        serde_json::json!(value)
    } else {
        serde_json::json!({ "bits": format!("{:#018x}", value.to_bits()) })
    }
}

/// The `{"bits": "0x.."}` form of a non-finite float, if `value` has it.
fn float_bits(value: &serde_json::Value) -> Option<Result<u64, String>> {
    let bits = value.get("bits")?.as_str()?;
    Some(
        u64::from_str_radix(bits.trim_start_matches("0x"), 16)
            .map_err(|_| format!("invalid float bit pattern {bits}")),
    )
}

/// Accept a number or one of `"NaN"`, `"Infinity"`, `"-Infinity"`.
fn plain_float(value: &serde_json::Value) -> Result<f64, String> {
    let named = match value.as_str() {
        Some("NaN") => Some(f64::NAN),
        Some("Infinity") => Some(f64::INFINITY),
        Some("-Infinity") => Some(f64::NEG_INFINITY),
        _ => None,
    };
    value
        .as_f64()
        .or(named)
        .ok_or_else(|| format!("expected number, got {value}"))
}

fn json_to_f32(value: &serde_json::Value) -> Result<f32, String> {
    match float_bits(value) {
        Some(bits) => {
            let bits = bits?;
            u32::try_from(bits)
                .map(f32::from_bits)
                .map_err(|_| format!("bit pattern {bits:#x} is wider than a Single"))
        }
        None => plain_float(value).map(|f| f as f32),
    }
}

fn json_to_f64(value: &serde_json::Value) -> Result<f64, String> {
    match float_bits(value) {
        Some(bits) => bits.map(f64::from_bits),
        None => plain_float(value),
    }
}

/// Decode a persisted JSON value into a buffer for `field_type`.
///
/// # Errors
///
/// Returns a description of the mismatch when the JSON shape does not fit
/// the field type (wrong kind, out of range, wrong vector arity).
pub fn json_to_buffer(
    field_type: FieldType,
    value: &serde_json::Value,
) -> Result<FieldBuffer, String> {
    fn int<T: TryFrom<i64>>(value: &serde_json::Value) -> Result<T, String> {
        let raw = value
            .as_i64()
            .ok_or_else(|| format!("expected integer, got {value}"))?;
        T::try_from(raw).map_err(|_| format!("integer {raw} out of range"))
    }

    fn floats(value: &serde_json::Value, arity: usize) -> Result<Vec<f32>, String> {
        let items = value
            .as_array()
            .ok_or_else(|| format!("expected array of {arity} numbers, got {value}"))?;
        if items.len() != arity {
            return Err(format!("expected {arity} components, got {}", items.len()));
        }
        items.iter().map(json_to_f32).collect()
    }

    let buf = match field_type {
        FieldType::Invalid => return Err("cannot decode a value for an invalid field".to_owned()),
        FieldType::Bool => FieldBuffer::from_value(
            value
                .as_bool()
                .ok_or_else(|| format!("expected boolean, got {value}"))?,
        ),
        FieldType::SByte => FieldBuffer::from_value(int::<i8>(value)?),
        FieldType::Byte => FieldBuffer::from_value(int::<u8>(value)?),
        FieldType::Short => FieldBuffer::from_value(int::<i16>(value)?),
        FieldType::UShort => FieldBuffer::from_value(int::<u16>(value)?),
        FieldType::Int => FieldBuffer::from_value(int::<i32>(value)?),
        FieldType::UInt => FieldBuffer::from_value(int::<u32>(value)?),
        FieldType::Long => FieldBuffer::from_value(int::<i64>(value)?),
        FieldType::ULong | FieldType::Entity => FieldBuffer::from_value(
            value
                .as_u64()
                .ok_or_else(|| format!("expected unsigned integer, got {value}"))?,
        ),
        FieldType::Float => FieldBuffer::from_value(json_to_f32(value)?),
        FieldType::Double => FieldBuffer::from_value(json_to_f64(value)?),
        FieldType::Vector2 => {
            let c = floats(value, 2)?;
            FieldBuffer::from_value(Vector2::new(c[0], c[1]))
        }
        FieldType::Vector3 => {
            let c = floats(value, 3)?;
            FieldBuffer::from_value(Vector3::new(c[0], c[1], c[2]))
        }
        FieldType::Vector4 => {
            let c = floats(value, 4)?;
            FieldBuffer::from_value(Vector4::new(c[0], c[1], c[2], c[3]))
        }
    };
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn managed_name_table_is_bijective() {
        for (name, ty) in MANAGED_TYPE_NAMES {
            assert_eq!(FieldType::from_managed_name(name), *ty);
            assert_eq!(ty.managed_name(), Some(*name));
        }
        assert_eq!(FieldType::from_managed_name("System.String"), FieldType::Invalid);
        assert_eq!(FieldType::Invalid.managed_name(), None);
    }

    #[test]
    fn every_buffer_size_fits() {
        for (_, ty) in MANAGED_TYPE_NAMES {
            assert!(ty.buffer_size() <= FIELD_BUFFER_SIZE, "{ty} does not fit");
            assert!(ty.managed_size() > 0);
        }
    }

    #[test]
    fn buffer_layout_is_little_endian() {
        let buf = FieldBuffer::from_value(0x0102_0304i32);
        assert_eq!(&buf.as_bytes()[..4], &[0x04, 0x03, 0x02, 0x01]);
        assert!(buf.as_bytes()[4..].iter().all(|b| *b == 0));
    }

    #[test]
    fn floats_are_bit_exact() {
        let nan_payload = f32::from_bits(0x7fc0_1234);
        let buf = FieldBuffer::from_value(nan_payload);
        assert_eq!(buf.to_value::<f32>().to_bits(), 0x7fc0_1234);

        let v = Vector4::new(-0.0, 1.5, f32::MIN_POSITIVE, 3.25);
        let back: Vector4 = FieldBuffer::from_value(v).to_value();
        assert_eq!(back.x.to_bits(), (-0.0f32).to_bits());
        assert_eq!(back, v);
    }

    #[test]
    fn entity_ref_zero_is_none() {
        assert_eq!(FieldBuffer::ZERO.to_value::<EntityRef>(), EntityRef::NONE);
        let id = Uuid::from_raw(77).unwrap();
        let buf = FieldBuffer::from_value(EntityRef::to(id));
        assert_eq!(buf.entity_uuid(), 77);
        assert_eq!(buf.to_value::<EntityRef>().uuid(), Some(id));
    }

    #[test]
    fn json_decoding_rejects_mismatched_shapes() {
        assert!(json_to_buffer(FieldType::Byte, &serde_json::json!(300)).is_err());
        assert!(json_to_buffer(FieldType::Vector3, &serde_json::json!([1.0, 2.0])).is_err());
        assert!(json_to_buffer(FieldType::Bool, &serde_json::json!(1)).is_err());
        assert!(json_to_buffer(FieldType::Invalid, &serde_json::json!(null)).is_err());
    }

    #[test]
    fn json_encoding_matches_persisted_format() {
        let buf = FieldBuffer::from_value(Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(
            buffer_to_json(FieldType::Vector3, &buf),
            serde_json::json!([1.0, 2.0, 3.0])
        );
        let buf = json_to_buffer(FieldType::Int, &serde_json::json!(-12)).unwrap();
        assert_eq!(buf.to_value::<i32>(), -12);
    }

    #[test]
    fn non_finite_floats_survive_json() {
        let nan = f32::from_bits(0x7fc0_1234);
        let buf = FieldBuffer::from_value(nan);
        let json = buffer_to_json(FieldType::Float, &buf);
        assert_eq!(json, serde_json::json!({ "bits": "0x7fc01234" }));
        let back = json_to_buffer(FieldType::Float, &json).unwrap();
        assert_eq!(back.to_value::<f32>().to_bits(), 0x7fc0_1234);

        let buf = FieldBuffer::from_value(f64::NEG_INFINITY);
        let json = buffer_to_json(FieldType::Double, &buf);
        let back = json_to_buffer(FieldType::Double, &json).unwrap();
        assert_eq!(back.to_value::<f64>(), f64::NEG_INFINITY);

        let v = Vector3::new(f32::INFINITY, 1.0, 2.0);
        let json = buffer_to_json(FieldType::Vector3, &FieldBuffer::from_value(v));
        assert_eq!(json[1], serde_json::json!(1.0));
        let back: Vector3 = json_to_buffer(FieldType::Vector3, &json).unwrap().to_value();
        assert_eq!(back, v);
    }

    #[test]
    fn named_non_finite_floats_are_accepted() {
        let buf = json_to_buffer(FieldType::Float, &serde_json::json!("NaN")).unwrap();
        assert!(buf.to_value::<f32>().is_nan());
        let buf = json_to_buffer(FieldType::Vector2, &serde_json::json!(["Infinity", "-Infinity"]))
            .unwrap();
        assert_eq!(
            buf.to_value::<Vector2>(),
            Vector2::new(f32::INFINITY, f32::NEG_INFINITY)
        );
        let wide = serde_json::json!({ "bits": "0x7ff8000000000000" });
        assert!(json_to_buffer(FieldType::Float, &wide).is_err());
    }
}
