//! The live binding between one entity and one managed object.

use std::sync::Arc;

use lumen_scene::Uuid;
use wasmtime::Val;

use crate::assembly::AppDomain;
use crate::fault::ScriptFault;
use crate::field::{FieldBuffer, FieldType, FieldValue};
use crate::handle::{Generation, MethodHandle, ObjectHandle};
use crate::reflect::{ClassRegistry, FieldDescriptor, ScriptClass};
use crate::ScriptError;

/// Name of the entity id field on the base script type.
const ENTITY_ID_FIELD: &str = "ID";

/// One entity bound to one managed object of a script class.
///
/// All calls take the [`AppDomain`] the instance was created in. Passing any
/// other domain is refused with a stale-handle error.
#[derive(Debug)]
pub struct ScriptInstance {
    entity: Uuid,
    class: Arc<ScriptClass>,
    entity_class: Arc<ScriptClass>,
    object: ObjectHandle,
    constructor: MethodHandle,
    on_create: Option<MethodHandle>,
    on_update: Option<MethodHandle>,
}

impl ScriptInstance {
    /// Allocate an object of `class`, run its field initialisers, and invoke
    /// the base-type constructor with the entity's UUID.
    ///
    /// # Errors
    ///
    /// - [`ScriptError::MissingConstructor`] if the base type has no
    ///   `.ctor(id)`; no object is created.
    /// - [`ScriptError::Fault`] if allocation, an initialiser, or the
    ///   constructor faults.
    pub fn new(
        domain: &mut AppDomain,
        registry: &ClassRegistry,
        class: Arc<ScriptClass>,
        entity: Uuid,
    ) -> Result<Self, ScriptError> {
        let entity_class = Arc::clone(registry.entity_class());
        let constructor = entity_class
            .method(".ctor", 1)
            .cloned()
            .ok_or_else(|| ScriptError::MissingConstructor {
                class: class.full_name().to_owned(),
            })?;

        let object = domain.instantiate(&class)?;
        domain.invoke(&constructor, object, &[Val::I64(entity.to_raw() as i64)])?;

        tracing::debug!(entity = %entity, class = %class.full_name(), "script instance created");
        Ok(Self {
            entity,
            on_create: class.method("OnCreate", 0).cloned(),
            on_update: class.method("OnUpdate", 1).cloned(),
            class,
            entity_class,
            object,
            constructor,
        })
    }

    pub fn entity(&self) -> Uuid {
        self.entity
    }

    pub fn class(&self) -> &Arc<ScriptClass> {
        &self.class
    }

    /// The live managed object.
    pub fn object(&self) -> ObjectHandle {
        self.object
    }

    pub fn generation(&self) -> Generation {
        self.object.generation()
    }

    pub fn has_on_create(&self) -> bool {
        self.on_create.is_some()
    }

    pub fn has_on_update(&self) -> bool {
        self.on_update.is_some()
    }

    /// Invoke `OnCreate()` if the class defines it.
    pub fn invoke_create(&self, domain: &mut AppDomain) -> Result<(), ScriptFault> {
        if let Some(method) = &self.on_create {
            domain.invoke(method, self.object, &[])?;
        }
        Ok(())
    }

    /// Invoke `OnUpdate(delta_time)` if the class defines it.
    pub fn invoke_update(
        &self,
        domain: &mut AppDomain,
        delta_time: f32,
    ) -> Result<(), ScriptFault> {
        if let Some(method) = &self.on_update {
            domain.invoke(method, self.object, &[Val::F32(delta_time.to_bits())])?;
        }
        Ok(())
    }

    // -- Fields --------------------------------------------------------------

    fn descriptor(&self, name: &str) -> Result<&FieldDescriptor, ScriptError> {
        self.class
            .field(name)
            .ok_or_else(|| ScriptError::FieldNotFound {
                class: self.class.full_name().to_owned(),
                field: name.to_owned(),
            })
    }

    fn typed_descriptor(
        &self,
        name: &str,
        expected: FieldType,
    ) -> Result<&FieldDescriptor, ScriptError> {
        let descriptor = self.descriptor(name)?;
        if descriptor.field_type != expected {
            return Err(ScriptError::FieldTypeMismatch {
                field: name.to_owned(),
                expected,
                found: descriptor.field_type,
            });
        }
        Ok(descriptor)
    }

    fn check_generation(
        &self,
        domain: &AppDomain,
        descriptor: &FieldDescriptor,
    ) -> Result<(), ScriptError> {
        let found = descriptor.handle.generation();
        if found != domain.generation() {
            return Err(ScriptError::StaleHandle {
                expected: domain.generation(),
                found,
            });
        }
        Ok(())
    }

    /// Read a field as `T`.
    ///
    /// # Errors
    ///
    /// [`ScriptError::FieldNotFound`], [`ScriptError::FieldTypeMismatch`], or
    /// an error from the domain (stale handle, memory access).
    pub fn try_get_field<T: FieldValue>(
        &self,
        domain: &mut AppDomain,
        name: &str,
    ) -> Result<T, ScriptError> {
        let descriptor = self.typed_descriptor(name, T::FIELD_TYPE)?;
        Ok(self.read_descriptor(domain, descriptor)?.to_value())
    }

    /// Write a field as `T`.
    pub fn try_set_field<T: FieldValue>(
        &self,
        domain: &mut AppDomain,
        name: &str,
        value: T,
    ) -> Result<(), ScriptError> {
        let descriptor = self.typed_descriptor(name, T::FIELD_TYPE)?;
        self.write_descriptor(domain, descriptor, &FieldBuffer::from_value(value))
    }

    /// Read a field, logging and returning `T::default()` on any failure.
    pub fn get_field<T: FieldValue>(&self, domain: &mut AppDomain, name: &str) -> T {
        self.try_get_field(domain, name).unwrap_or_else(|e| {
            tracing::error!(entity = %self.entity, field = name, error = %e, "get_field failed");
            T::default()
        })
    }

    /// Write a field, logging and doing nothing on any failure.
    pub fn set_field<T: FieldValue>(&self, domain: &mut AppDomain, name: &str, value: T) {
        if let Err(e) = self.try_set_field(domain, name, value) {
            tracing::error!(entity = %self.entity, field = name, error = %e, "set_field failed");
        }
    }

    /// Read a field into a buffer, whatever its type.
    pub fn get_field_raw(
        &self,
        domain: &mut AppDomain,
        name: &str,
    ) -> Result<FieldBuffer, ScriptError> {
        let descriptor = self.descriptor(name)?;
        self.read_descriptor(domain, descriptor)
    }

    /// Write a buffer into a field, whatever its type.
    pub fn set_field_raw(
        &self,
        domain: &mut AppDomain,
        name: &str,
        buffer: &FieldBuffer,
    ) -> Result<(), ScriptError> {
        let descriptor = self.descriptor(name)?;
        self.write_descriptor(domain, descriptor, buffer)
    }

    fn read_descriptor(
        &self,
        domain: &mut AppDomain,
        descriptor: &FieldDescriptor,
    ) -> Result<FieldBuffer, ScriptError> {
        self.check_generation(domain, descriptor)?;
        let offset = descriptor.handle.offset();
        match descriptor.field_type {
            FieldType::Invalid => Err(ScriptError::UnsupportedField {
                class: self.class.full_name().to_owned(),
                field: descriptor.name.clone(),
            }),
            FieldType::Entity => {
                let address = read_u32(domain, self.object, offset)?;
                if address == 0 {
                    return Ok(FieldBuffer::ZERO);
                }
                let wrapper = ObjectHandle {
                    generation: domain.generation(),
                    address,
                };
                let mut buffer = FieldBuffer::ZERO;
                let id_offset = self.entity_id_offset()?;
                domain.read_bytes(wrapper, id_offset, &mut buffer.as_bytes_mut()[..8])?;
                Ok(buffer)
            }
            field_type => {
                let mut buffer = FieldBuffer::ZERO;
                let len = field_type.managed_size();
                domain.read_bytes(self.object, offset, &mut buffer.as_bytes_mut()[..len])?;
                Ok(buffer)
            }
        }
    }

    fn write_descriptor(
        &self,
        domain: &mut AppDomain,
        descriptor: &FieldDescriptor,
        buffer: &FieldBuffer,
    ) -> Result<(), ScriptError> {
        self.check_generation(domain, descriptor)?;
        let offset = descriptor.handle.offset();
        match descriptor.field_type {
            FieldType::Invalid => Err(ScriptError::UnsupportedField {
                class: self.class.full_name().to_owned(),
                field: descriptor.name.clone(),
            }),
            FieldType::Entity => {
                let address = match Uuid::from_raw(buffer.entity_uuid()) {
                    Some(uuid) => self.entity_wrapper(domain, uuid)?.address(),
                    None => 0,
                };
                domain.write_bytes(self.object, offset, &address.to_le_bytes())
            }
            field_type => {
                let len = field_type.managed_size();
                domain.write_bytes(self.object, offset, &buffer.as_bytes()[..len])
            }
        }
    }

    /// The base-type object wrapping `uuid`. One wrapper per UUID is shared
    /// until the heap is reset; a wrapper whose id was overwritten by script
    /// code is replaced.
    fn entity_wrapper(
        &self,
        domain: &mut AppDomain,
        uuid: Uuid,
    ) -> Result<ObjectHandle, ScriptError> {
        let raw = uuid.to_raw();
        if let Some(wrapper) = domain.cached_entity_wrapper(raw) {
            let mut id = [0u8; 8];
            domain.read_bytes(wrapper, self.entity_id_offset()?, &mut id)?;
            if u64::from_le_bytes(id) == raw {
                return Ok(wrapper);
            }
        }
        let wrapper = domain.instantiate(&self.entity_class)?;
        domain.invoke(&self.constructor, wrapper, &[Val::I64(raw as i64)])?;
        domain.cache_entity_wrapper(raw, wrapper);
        Ok(wrapper)
    }

    fn entity_id_offset(&self) -> Result<u32, ScriptError> {
        self.entity_class
            .field(ENTITY_ID_FIELD)
            .map(|f| f.handle.offset())
            .ok_or_else(|| ScriptError::FieldNotFound {
                class: self.entity_class.full_name().to_owned(),
                field: ENTITY_ID_FIELD.to_owned(),
            })
    }
}

fn read_u32(domain: &AppDomain, object: ObjectHandle, offset: u32) -> Result<u32, ScriptError> {
    let mut bytes = [0u8; 4];
    domain.read_bytes(object, offset, &mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}
