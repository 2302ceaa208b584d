//! Class discovery.
//!
//! [`ClassReflector::discover`] reads the metadata exports of a loaded
//! [`AppDomain`] and builds a [`ClassRegistry`]: one [`ScriptClass`] for every
//! user-assembly class that derives (directly or transitively) from the base
//! script type, plus the descriptor of the base type itself. Discovery builds
//! the whole registry before returning it, so a failure leaves nothing behind.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use wasmtime::{Func, Instance, Module, Store, ValType};

use crate::assembly::AppDomain;
use crate::field::FieldType;
use crate::handle::{ClassHandle, FieldHandle, Generation, MethodHandle};
use crate::host_api::HostState;
use crate::ScriptError;

/// Full name of the base script type every script class derives from.
pub const BASE_CLASS_NAME: &str = "Lumen.Entity";

// ---------------------------------------------------------------------------
// Metadata export grammar
// ---------------------------------------------------------------------------

/// One parsed metadata export name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MetadataExport<'a> {
    /// `class <Full.Name> <Parent | ->`
    Class {
        name: &'a str,
        parent: Option<&'a str>,
    },
    /// `field <Class> <name> <TypeName> <public | private>`
    Field {
        class: &'a str,
        name: &'a str,
        type_name: &'a str,
        public: bool,
    },
    /// `method <Class> <name>`
    Method { class: &'a str, name: &'a str },
}

/// Parse an export name. Exports that are not metadata (`memory`, `alloc`,
/// helper functions) yield `Ok(None)`.
pub(crate) fn parse_export(export: &str) -> Result<Option<MetadataExport<'_>>, ScriptError> {
    let malformed = |reason: &str| ScriptError::Metadata {
        export: export.to_owned(),
        reason: reason.to_owned(),
    };

    let tokens: Vec<&str> = export.split_whitespace().collect();
    let parsed = match *tokens.as_slice() {
        ["class", name, parent] => MetadataExport::Class {
            name,
            parent: (parent != "-").then_some(parent),
        },
        ["class", ..] => return Err(malformed("expected `class <Name> <Parent | ->`")),
        ["field", class, name, type_name, visibility] => MetadataExport::Field {
            class,
            name,
            type_name,
            public: match visibility {
                "public" => true,
                "private" => false,
                _ => return Err(malformed("visibility must be `public` or `private`")),
            },
        },
        ["field", ..] => {
            return Err(malformed(
                "expected `field <Class> <name> <Type> <public | private>`",
            ))
        }
        ["method", class, name] => MetadataExport::Method { class, name },
        ["method", ..] => return Err(malformed("expected `method <Class> <name>`")),
        _ => return Ok(None),
    };
    Ok(Some(parsed))
}

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

/// One exposed field of a script class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub field_type: FieldType,
    pub handle: FieldHandle,
}

/// A discovered script class. Immutable once built; a reload produces new
/// descriptors instead of changing these.
#[derive(Debug)]
pub struct ScriptClass {
    namespace: String,
    name: String,
    full_name: String,
    parent: Option<String>,
    handle: ClassHandle,
    instance_size: u32,
    fields: BTreeMap<String, FieldDescriptor>,
    methods: HashMap<(String, usize), MethodHandle>,
}

impl ScriptClass {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `Namespace.Name`.
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn handle(&self) -> ClassHandle {
        self.handle
    }

    pub fn instance_size(&self) -> u32 {
        self.instance_size
    }

    /// Public fields, including those declared on user-assembly ancestors.
    pub fn fields(&self) -> &BTreeMap<String, FieldDescriptor> {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.get(name)
    }

    /// Look up a method by name and argument count (excluding `this`). The
    /// most-derived definition wins.
    pub fn method(&self, name: &str, param_count: usize) -> Option<&MethodHandle> {
        self.methods.get(&(name.to_owned(), param_count))
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }
}

// ---------------------------------------------------------------------------
// ClassRegistry
// ---------------------------------------------------------------------------

/// All script classes of one load generation.
#[derive(Debug)]
pub struct ClassRegistry {
    generation: Generation,
    classes: BTreeMap<String, Arc<ScriptClass>>,
    entity_class: Arc<ScriptClass>,
}

impl ClassRegistry {
    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn get(&self, full_name: &str) -> Option<&Arc<ScriptClass>> {
        self.classes.get(full_name)
    }

    pub fn contains(&self, full_name: &str) -> bool {
        self.classes.contains_key(full_name)
    }

    /// Sorted full names of all script classes.
    pub fn class_names(&self) -> Vec<String> {
        self.classes.keys().cloned().collect()
    }

    pub fn classes(&self) -> impl Iterator<Item = &Arc<ScriptClass>> {
        self.classes.values()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Descriptor of the base script type.
    pub fn entity_class(&self) -> &Arc<ScriptClass> {
        &self.entity_class
    }
}

// ---------------------------------------------------------------------------
// ClassReflector
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RawField {
    name: String,
    type_name: String,
    public: bool,
    offset: u32,
}

#[derive(Debug)]
struct RawClass {
    parent: Option<String>,
    size: u32,
    index: u32,
    fields: Vec<RawField>,
    methods: Vec<(String, Func)>,
}

/// Discovers script classes in a loaded domain.
#[derive(Debug, Clone)]
pub struct ClassReflector {
    base_class: String,
}

impl Default for ClassReflector {
    fn default() -> Self {
        Self {
            base_class: BASE_CLASS_NAME.to_owned(),
        }
    }
}

impl ClassReflector {
    pub fn new(base_class: impl Into<String>) -> Self {
        Self {
            base_class: base_class.into(),
        }
    }

    /// Build the class registry for `domain`.
    ///
    /// # Errors
    ///
    /// - [`ScriptError::NotInitialized`] if either assembly is missing.
    /// - [`ScriptError::MissingBaseType`] if the core assembly does not define
    ///   the base type.
    /// - [`ScriptError::Metadata`] for malformed exports, fields outside their
    ///   object, or inheritance cycles.
    pub fn discover(&self, domain: &mut AppDomain) -> Result<ClassRegistry, ScriptError> {
        let generation = domain.generation();
        let (core_module, core_instance) = domain
            .core()
            .map(|a| (a.module.clone(), a.instance))
            .ok_or(ScriptError::NotInitialized)?;
        let (app_module, app_instance) = domain
            .app()
            .map(|a| (a.module.clone(), a.instance))
            .ok_or(ScriptError::NotInitialized)?;
        let store = domain.store_mut();

        let mut core_classes = collect_classes(store, &core_module, core_instance, 0)?;
        let app_classes =
            collect_classes(store, &app_module, app_instance, core_classes.len() as u32)?;

        let base = core_classes
            .remove(&self.base_class)
            .ok_or_else(|| ScriptError::MissingBaseType {
                name: self.base_class.clone(),
            })?;
        let entity_class = Arc::new(build_class(
            store,
            generation,
            &self.base_class,
            &[(self.base_class.as_str(), &base)],
        )?);

        let mut classes = BTreeMap::new();
        for name in app_classes.keys() {
            let Some(chain) = self.ancestry(name, &app_classes)? else {
                tracing::trace!(class = %name, "skipping type that is not a script class");
                continue;
            };
            let class = build_class(store, generation, name, &chain)?;
            classes.insert(name.clone(), Arc::new(class));
        }

        tracing::info!(
            generation = %generation,
            classes = classes.len(),
            "script classes discovered"
        );
        Ok(ClassRegistry {
            generation,
            classes,
            entity_class,
        })
    }

    /// The user-assembly ancestry of `name` (most derived first, base type
    /// excluded), or `None` if it does not derive from the base type.
    fn ancestry<'a>(
        &self,
        name: &'a str,
        classes: &'a BTreeMap<String, RawClass>,
    ) -> Result<Option<Vec<(&'a str, &'a RawClass)>>, ScriptError> {
        let mut chain: Vec<(&str, &RawClass)> = Vec::new();
        let mut current = name;
        loop {
            let Some(raw) = classes.get(current) else {
                return Ok(None);
            };
            if chain.len() > classes.len() {
                return Err(ScriptError::Metadata {
                    export: format!("class {name}"),
                    reason: "inheritance cycle".to_owned(),
                });
            }
            chain.push((current, raw));
            match raw.parent.as_deref() {
                Some(parent) if parent == self.base_class => return Ok(Some(chain)),
                Some(parent) => current = parent,
                None => return Ok(None),
            }
        }
    }
}

/// Read every class, field, and method export of one assembly.
fn collect_classes(
    store: &mut Store<HostState>,
    module: &Module,
    instance: Instance,
    first_index: u32,
) -> Result<BTreeMap<String, RawClass>, ScriptError> {
    let mut classes = BTreeMap::new();
    let mut fields = Vec::new();
    let mut methods = Vec::new();

    for export in module.exports() {
        let export_name = export.name();
        let Some(parsed) = parse_export(export_name)? else {
            continue;
        };
        match parsed {
            MetadataExport::Class { name, parent } => {
                let size = read_i32_global(store, instance, export_name)?;
                let index = first_index + classes.len() as u32;
                classes.insert(
                    name.to_owned(),
                    RawClass {
                        parent: parent.map(str::to_owned),
                        size,
                        index,
                        fields: Vec::new(),
                        methods: Vec::new(),
                    },
                );
            }
            MetadataExport::Field {
                class,
                name,
                type_name,
                public,
            } => {
                let offset = read_i32_global(store, instance, export_name)?;
                fields.push((
                    class.to_owned(),
                    RawField {
                        name: name.to_owned(),
                        type_name: type_name.to_owned(),
                        public,
                        offset,
                    },
                ));
            }
            MetadataExport::Method { class, name } => {
                let func = instance
                    .get_func(&mut *store, export_name)
                    .ok_or_else(|| ScriptError::Metadata {
                        export: export_name.to_owned(),
                        reason: "method exports must be functions".to_owned(),
                    })?;
                methods.push((class.to_owned(), name.to_owned(), func));
            }
        }
    }

    for (class, field) in fields {
        match classes.get_mut(&class) {
            Some(raw) => raw.fields.push(field),
            None => tracing::warn!(
                class = %class,
                field = %field.name,
                "field of undeclared class ignored"
            ),
        }
    }
    for (class, name, func) in methods {
        match classes.get_mut(&class) {
            Some(raw) => raw.methods.push((name, func)),
            None => tracing::warn!(
                class = %class,
                method = %name,
                "method of undeclared class ignored"
            ),
        }
    }
    Ok(classes)
}

fn read_i32_global(
    store: &mut Store<HostState>,
    instance: Instance,
    export: &str,
) -> Result<u32, ScriptError> {
    let malformed = |reason: &str| ScriptError::Metadata {
        export: export.to_owned(),
        reason: reason.to_owned(),
    };
    let global = instance
        .get_global(&mut *store, export)
        .ok_or_else(|| malformed("expected an i32 global"))?;
    let value = global
        .get(&mut *store)
        .i32()
        .ok_or_else(|| malformed("expected an i32 global"))?;
    u32::try_from(value).map_err(|_| malformed("value must not be negative"))
}

/// Build the descriptor of the first class in `chain` (most derived first).
fn build_class(
    store: &Store<HostState>,
    generation: Generation,
    full_name: &str,
    chain: &[(&str, &RawClass)],
) -> Result<ScriptClass, ScriptError> {
    let Some((_, most_derived)) = chain.first() else {
        return Err(ScriptError::UnknownClass {
            name: full_name.to_owned(),
        });
    };

    let mut fields = BTreeMap::new();
    let mut methods = HashMap::new();

    // Walk from the root-most ancestor down so derived declarations win.
    for (declaring, raw) in chain.iter().rev() {
        for field in raw.fields.iter().filter(|f| f.public) {
            let field_type = FieldType::from_managed_name(&field.type_name);
            if !field_type.is_valid() {
                tracing::warn!(
                    class = %declaring,
                    field = %field.name,
                    managed_type = %field.type_name,
                    "unsupported field type, field kept as Invalid"
                );
            }
            let end = u64::from(field.offset) + field_type.managed_size() as u64;
            if end > u64::from(raw.size) {
                return Err(ScriptError::Metadata {
                    export: format!(
                        "field {declaring} {} {} public",
                        field.name, field.type_name
                    ),
                    reason: format!("ends at byte {end}, past the {}-byte object", raw.size),
                });
            }
            fields.insert(
                field.name.clone(),
                FieldDescriptor {
                    name: field.name.clone(),
                    field_type,
                    handle: FieldHandle {
                        generation,
                        offset: field.offset,
                    },
                },
            );
        }

        for (name, func) in &raw.methods {
            let param_count = method_param_count(store, *func, declaring, name)?;
            methods.insert(
                (name.clone(), param_count),
                MethodHandle {
                    generation,
                    func: *func,
                    name: format!("{declaring}::{name}"),
                    param_count,
                },
            );
        }
    }

    let (namespace, name) = full_name.rsplit_once('.').unwrap_or(("", full_name));
    Ok(ScriptClass {
        namespace: namespace.to_owned(),
        name: name.to_owned(),
        full_name: full_name.to_owned(),
        parent: most_derived.parent.clone(),
        handle: ClassHandle {
            generation,
            index: most_derived.index,
        },
        instance_size: most_derived.size,
        fields,
        methods,
    })
}

fn method_param_count(
    store: &Store<HostState>,
    func: Func,
    class: &str,
    name: &str,
) -> Result<usize, ScriptError> {
    let ty = func.ty(store);
    let mut params = ty.params();
    match params.next() {
        Some(ValType::I32) => Ok(params.len()),
        _ => Err(ScriptError::Metadata {
            export: format!("method {class} {name}"),
            reason: "first parameter must be the i32 object address".to_owned(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
