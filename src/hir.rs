use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::int128::S128;

/// Source location handle carried through layout queries so internal
/// bugs can point back at the offending item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Span {
    pub file: u32,
    pub line: u32,
}

impl Span {
    pub fn new(file: u32, line: u32) -> Self {
        Self { file, line }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Absolute item path, e.g. `core::num::NonZeroU32`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SimplePath(pub Vec<String>);

impl SimplePath {
    pub fn new<I, S>(components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(components.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for SimplePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("::"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreType {
    Bool,
    Char,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    U128,
    I128,
    Usize,
    Isize,
    F32,
    F64,
    Str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BorrowKind {
    Shared,
    Unique,
    Owned,
}

/// Element count of an array type. Generic parameters can leave the
/// count unevaluated until monomorphisation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArraySize {
    Known(u64),
    Unevaluated,
}

/// A fully resolved type expression. Structural equality and hashing
/// identify types for layout memoisation, so two equal expressions
/// always share a representation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeRef {
    /// Inference placeholder; must never reach layout.
    Infer,
    /// The never type.
    Diverge,
    Primitive(CoreType),
    Path(PathType),
    Generic {
        name: String,
        index: u32,
    },
    TraitObject(Vec<SimplePath>),
    ErasedType,
    Array {
        inner: Box<TypeRef>,
        count: ArraySize,
    },
    Slice(Box<TypeRef>),
    Tuple(Vec<TypeRef>),
    Borrow {
        kind: BorrowKind,
        inner: Box<TypeRef>,
    },
    Pointer {
        kind: BorrowKind,
        inner: Box<TypeRef>,
    },
    Function(Box<FunctionPointer>),
    /// Unlowered closure, identified by its defining node.
    Closure(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionPointer {
    pub is_unsafe: bool,
    pub abi: String,
    pub args: Vec<TypeRef>,
    pub ret: TypeRef,
}

/// A named type with its parameters and the definition it resolved to.
///
/// Identity (equality/hash) is the path plus parameters; the binding is
/// a cache of the resolution and never participates in comparisons.
#[derive(Debug, Clone)]
pub struct PathType {
    pub path: SimplePath,
    pub params: Vec<TypeRef>,
    pub binding: TypeBinding,
}

impl PartialEq for PathType {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path && self.params == other.params
    }
}

impl Eq for PathType {}

impl Hash for PathType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
        self.params.hash(state);
    }
}

#[derive(Debug, Clone)]
pub enum TypeBinding {
    /// Resolution failed or was never attempted.
    Unbound,
    /// Opaque associated type projection.
    Opaque,
    ExternType,
    Struct(Arc<StructDef>),
    Enum(Arc<EnumDef>),
    Union(Arc<UnionDef>),
}

#[derive(Debug, Clone)]
pub struct StructDef {
    pub fields: StructFields,
    pub repr: StructRepr,
    pub markings: StructMarkings,
}

#[derive(Debug, Clone)]
pub enum StructFields {
    Unit,
    Tuple(Vec<TypeRef>),
    Named(Vec<(String, TypeRef)>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructRepr {
    Rust,
    C,
    Packed,
    Simd,
    Aligned,
    Transparent,
}

/// Layout-relevant attributes collected from the struct definition.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructMarkings {
    /// The all-zeroes bit pattern is never a valid value
    /// (`#[rustc_nonnull_optimization_guaranteed]` wrappers).
    pub is_nonzero: bool,
    /// Values never exceed this bound, leaving the range above it free.
    pub bounded_max: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct EnumDef {
    pub variants: EnumVariants,
}

#[derive(Debug, Clone)]
pub enum EnumVariants {
    /// Variants carrying payloads. The payload is the variant's field
    /// product: the unit type, a single field's type, or a tuple.
    Data(Vec<DataVariant>),
    /// C-like enum of unit variants with explicit discriminants.
    Value {
        repr: DiscriminantRepr,
        variants: Vec<ValueVariant>,
    },
}

#[derive(Debug, Clone)]
pub struct DataVariant {
    pub name: String,
    pub ty: TypeRef,
}

#[derive(Debug, Clone)]
pub struct ValueVariant {
    pub name: String,
    pub value: S128,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscriminantRepr {
    Rust,
    C,
    U8,
    U16,
    U32,
    U64,
    Usize,
}

#[derive(Debug, Clone)]
pub struct UnionDef {
    pub variants: Vec<(String, TypeRef)>,
}

impl TypeRef {
    pub fn unit() -> Self {
        TypeRef::Tuple(Vec::new())
    }

    pub fn is_unit(&self) -> bool {
        matches!(self, TypeRef::Tuple(fields) if fields.is_empty())
    }

    pub fn borrow_of(inner: TypeRef) -> Self {
        TypeRef::Borrow {
            kind: BorrowKind::Shared,
            inner: Box::new(inner),
        }
    }

    pub fn array_of(inner: TypeRef, count: u64) -> Self {
        TypeRef::Array {
            inner: Box::new(inner),
            count: ArraySize::Known(count),
        }
    }

    /// Substitute generic parameters with the given arguments,
    /// producing a closed type suitable for layout.
    pub fn monomorph(&self, params: &[TypeRef]) -> TypeRef {
        if params.is_empty() {
            return self.clone();
        }
        match self {
            TypeRef::Generic { name, index } => params
                .get(*index as usize)
                .cloned()
                .unwrap_or_else(|| TypeRef::Generic {
                    name: name.clone(),
                    index: *index,
                }),
            TypeRef::Path(pt) => TypeRef::Path(PathType {
                path: pt.path.clone(),
                params: pt
                    .params
                    .iter()
                    .map(|t| t.monomorph(params))
                    .collect(),
                binding: pt.binding.clone(),
            }),
            TypeRef::Array { inner, count } => TypeRef::Array {
                inner: Box::new(inner.monomorph(params)),
                count: count.clone(),
            },
            TypeRef::Slice(inner) => {
                TypeRef::Slice(Box::new(inner.monomorph(params)))
            }
            TypeRef::Tuple(fields) => TypeRef::Tuple(
                fields.iter().map(|t| t.monomorph(params)).collect(),
            ),
            TypeRef::Borrow { kind, inner } => TypeRef::Borrow {
                kind: *kind,
                inner: Box::new(inner.monomorph(params)),
            },
            TypeRef::Pointer { kind, inner } => TypeRef::Pointer {
                kind: *kind,
                inner: Box::new(inner.monomorph(params)),
            },
            TypeRef::Function(fp) => {
                TypeRef::Function(Box::new(FunctionPointer {
                    is_unsafe: fp.is_unsafe,
                    abi: fp.abi.clone(),
                    args: fp
                        .args
                        .iter()
                        .map(|t| t.monomorph(params))
                        .collect(),
                    ret: fp.ret.monomorph(params),
                }))
            }
            _ => self.clone(),
        }
    }
}

/// Fat-pointer metadata kind carried by a pointer to some type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataType {
    /// Not determinable yet (generic or opaque referent).
    Unknown,
    /// Thin pointer.
    None,
    /// Thin pointer to an extern type.
    Zero,
    /// Pointer plus element count.
    Slice,
    /// Pointer plus vtable.
    TraitObject,
}

/// Language level the crate is being compiled against. Some layout
/// decisions changed across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LangVersion {
    Rustc1_19,
    Rustc1_29,
    Rustc1_39,
    Rustc1_54,
    Rustc1_74,
}

impl Default for LangVersion {
    fn default() -> Self {
        LangVersion::Rustc1_74
    }
}

/// The slice of the trait resolver that layout depends on.
pub trait TypeResolver {
    /// Metadata kind a pointer to `ty` carries.
    fn metadata_type(&self, sp: Span, ty: &TypeRef) -> MetadataType;

    /// Path of the legacy `NonZero` lang item wrapper, when the crate
    /// defines one.
    fn nonzero_lang_item(&self) -> Option<&SimplePath> {
        None
    }
}

/// Resolver that derives pointer metadata purely from type structure.
/// Sufficient whenever every path is already bound to its definition.
#[derive(Debug, Default)]
pub struct StructuralResolver {
    pub nonzero_path: Option<SimplePath>,
}

impl TypeResolver for StructuralResolver {
    fn metadata_type(&self, sp: Span, ty: &TypeRef) -> MetadataType {
        match ty {
            TypeRef::Infer | TypeRef::Generic { .. } | TypeRef::ErasedType => {
                MetadataType::Unknown
            }
            TypeRef::Primitive(CoreType::Str) | TypeRef::Slice(_) => {
                MetadataType::Slice
            }
            TypeRef::TraitObject(_) => MetadataType::TraitObject,
            TypeRef::Path(pt) => match &pt.binding {
                TypeBinding::Opaque | TypeBinding::Unbound => {
                    MetadataType::Unknown
                }
                TypeBinding::ExternType => MetadataType::Zero,
                TypeBinding::Struct(def) => {
                    // A struct is unsized through its final field.
                    let last = match &def.fields {
                        StructFields::Unit => None,
                        StructFields::Tuple(fields) => fields.last(),
                        StructFields::Named(fields) => {
                            fields.last().map(|(_, t)| t)
                        }
                    };
                    match last {
                        Some(t) => {
                            self.metadata_type(sp, &t.monomorph(&pt.params))
                        }
                        None => MetadataType::None,
                    }
                }
                TypeBinding::Enum(_) | TypeBinding::Union(_) => {
                    MetadataType::None
                }
            },
            _ => MetadataType::None,
        }
    }

    fn nonzero_lang_item(&self) -> Option<&SimplePath> {
        self.nonzero_path.as_ref()
    }
}
