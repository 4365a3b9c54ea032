mod repr;

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use anyhow::{anyhow, bail, Result};
use log::debug;

use crate::hir::{
    ArraySize, CoreType, LangVersion, MetadataType, Span, TypeBinding,
    TypeRef, TypeResolver,
};
use crate::target::TargetSpec;

/// Sentinel size of an unsized type.
pub const UNKNOWN_SIZE: u64 = u64::MAX;

/// Physical representation of a composite type: total extent, field
/// placement and, for sum types, how the active variant is encoded.
#[derive(Debug, Clone, Default)]
pub struct TypeRepr {
    /// Total size in bytes; [`UNKNOWN_SIZE`] when unsized.
    pub size: u64,
    /// Alignment in bytes; 0 when unknown (extern types).
    pub align: u64,
    /// For structs the data members in declaration order, for enums the
    /// per-variant payloads plus an optional trailing tag, for unions
    /// every alternative at offset 0.
    pub fields: Vec<Field>,
    pub variants: VariantMode,
}

#[derive(Debug, Clone)]
pub struct Field {
    pub offset: u64,
    pub ty: TypeRef,
}

/// Path to a leaf inside a representation: a top-level field index and
/// a chain of sub-field indices, stored outermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldPath {
    pub index: usize,
    pub sub_fields: Vec<usize>,
    /// Size in bytes of the leaf the path ends at.
    pub size: u64,
}

/// How a sum type encodes which variant is active.
#[derive(Debug, Clone, Default)]
pub enum VariantMode {
    /// Zero or one variant, no discriminator needed.
    #[default]
    None,
    /// Explicit tag field; variant `i` is active when the tag holds
    /// `values[i]`.
    Values {
        field: FieldPath,
        values: Vec<u64>,
    },
    /// Discriminant packed into a reused niche; variant `i` is active
    /// when the leaf holds `offset + i`. Values below `offset` belong
    /// to the niche host.
    Linear {
        field: FieldPath,
        offset: u64,
        num_variants: usize,
    },
    /// Two variants told apart by a single field: all-zeroes means
    /// `zero_variant`, anything else the other one.
    NonZero {
        field: FieldPath,
        zero_variant: usize,
    },
}

impl VariantMode {
    pub fn is_none(&self) -> bool {
        matches!(self, VariantMode::None)
    }
}

/// Layout oracle for one compilation: answers size/align and
/// representation queries against a fixed target, memoising every
/// composite it builds.
///
/// Single-threaded by design; parallel compilation needs an outer lock
/// around the whole solver.
pub struct LayoutSolver<'a, R: TypeResolver> {
    target: &'a TargetSpec,
    resolver: &'a R,
    lang_version: LangVersion,
    cache: HashMap<TypeRef, Option<Rc<TypeRepr>>>,
    // Guards against true type cycles, which only a defective frontend
    // can produce.
    building: HashSet<TypeRef>,
}

impl<'a, R: TypeResolver> LayoutSolver<'a, R> {
    pub fn new(target: &'a TargetSpec, resolver: &'a R) -> Self {
        Self {
            target,
            resolver,
            lang_version: LangVersion::default(),
            cache: HashMap::new(),
            building: HashSet::new(),
        }
    }

    pub fn with_lang_version(mut self, version: LangVersion) -> Self {
        self.lang_version = version;
        self
    }

    pub fn target(&self) -> &TargetSpec {
        self.target
    }

    pub fn resolver(&self) -> &R {
        self.resolver
    }

    pub fn lang_version(&self) -> LangVersion {
        self.lang_version
    }

    /// Size and alignment of a type, or `None` when it still depends on
    /// an unresolved generic. Unsized types report [`UNKNOWN_SIZE`].
    pub fn size_and_align(
        &mut self,
        sp: Span,
        ty: &TypeRef,
    ) -> Result<Option<(u64, u64)>> {
        let arch = &self.target.arch;
        let al = &arch.alignments;
        let ptr_bytes = arch.pointer_bytes();
        let ptr_align = u64::from(al.ptr.get());
        match ty {
            TypeRef::Infer => bail!("sizeof on _ type at {sp}"),
            TypeRef::Diverge => Ok(Some((0, 0))),
            TypeRef::Primitive(prim) => {
                let rv = match prim {
                    CoreType::Bool | CoreType::U8 | CoreType::I8 => (1, 1),
                    CoreType::U16 | CoreType::I16 => {
                        (2, u64::from(al.u16.get()))
                    }
                    CoreType::U32 | CoreType::I32 | CoreType::Char => {
                        (4, u64::from(al.u32.get()))
                    }
                    CoreType::U64 | CoreType::I64 => {
                        (8, u64::from(al.u64.get()))
                    }
                    CoreType::U128 | CoreType::I128 => {
                        // Emulated as a two-word struct, aligning as
                        // one word does.
                        let align = if self.target.backend_c.emulated_i128 {
                            al.u64.get()
                        } else {
                            al.u128.get()
                        };
                        (16, u64::from(align))
                    }
                    CoreType::Usize | CoreType::Isize => {
                        (ptr_bytes, ptr_align)
                    }
                    CoreType::F32 => (4, u64::from(al.f32.get())),
                    CoreType::F64 => (8, u64::from(al.f64.get())),
                    CoreType::Str => {
                        debug!("sizeof on str, unsized");
                        (UNKNOWN_SIZE, 1)
                    }
                };
                Ok(Some(rv))
            }
            TypeRef::Path(pt) => match &pt.binding {
                TypeBinding::Opaque => Ok(None),
                TypeBinding::ExternType => {
                    debug!("sizeof on extern type, unsized");
                    Ok(Some((UNKNOWN_SIZE, 0)))
                }
                _ => match self.type_repr(sp, ty)? {
                    Some(repr) => Ok(Some((repr.size, repr.align))),
                    None => {
                        debug!("cannot get type repr for {ty:?}");
                        Ok(None)
                    }
                },
            },
            TypeRef::Generic { .. } => {
                debug!("no repr for generic {ty:?}");
                Ok(None)
            }
            TypeRef::TraitObject(_) => {
                debug!("sizeof on a trait object, unsized");
                Ok(Some((UNKNOWN_SIZE, 0)))
            }
            TypeRef::ErasedType => {
                bail!("sizeof on an erased type at {sp}, shouldn't exist")
            }
            TypeRef::Array { inner, count } => {
                let Some((size, align)) = self.size_and_align(sp, inner)?
                else {
                    return Ok(None);
                };
                if size == UNKNOWN_SIZE {
                    bail!("unsized type in array at {sp}: {ty:?}");
                }
                let count = match count {
                    ArraySize::Known(n) => *n,
                    ArraySize::Unevaluated => return Ok(None),
                };
                let total = if count == 0 || size == 0 {
                    0
                } else {
                    if u64::MAX / count <= size {
                        bail!(
                            "integer overflow calculating array size at {sp}"
                        );
                    }
                    size * count
                };
                Ok(Some((total, align)))
            }
            TypeRef::Slice(inner) => {
                let Some(align) = self.align_of(sp, inner)? else {
                    return Ok(None);
                };
                debug!("sizeof on a slice, unsized");
                Ok(Some((UNKNOWN_SIZE, align)))
            }
            TypeRef::Tuple(_) => match self.type_repr(sp, ty)? {
                Some(repr) => Ok(Some((repr.size, repr.align))),
                None => {
                    debug!("cannot get type repr for {ty:?}");
                    Ok(None)
                }
            },
            TypeRef::Borrow { inner, .. }
            | TypeRef::Pointer { inner, .. } => {
                let size = match self.resolver.metadata_type(sp, inner) {
                    MetadataType::Unknown => return Ok(None),
                    MetadataType::None | MetadataType::Zero => ptr_bytes,
                    MetadataType::Slice | MetadataType::TraitObject => {
                        ptr_bytes * 2
                    }
                };
                Ok(Some((size, ptr_align)))
            }
            TypeRef::Function(_) => Ok(Some((ptr_bytes, ptr_align))),
            TypeRef::Closure(node) => {
                bail!("closure type {node} reached layout at {sp}")
            }
        }
    }

    /// Concrete size; it is a bug to ask for the size of an unsized
    /// type.
    pub fn size_of(&mut self, sp: Span, ty: &TypeRef) -> Result<Option<u64>> {
        match self.size_and_align(sp, ty)? {
            Some((UNKNOWN_SIZE, _)) => {
                bail!("getting size of unsized type at {sp}: {ty:?}")
            }
            Some((size, _)) => Ok(Some(size)),
            None => Ok(None),
        }
    }

    /// Concrete alignment; it is a bug to ask for the alignment of an
    /// unsized type.
    pub fn align_of(
        &mut self,
        sp: Span,
        ty: &TypeRef,
    ) -> Result<Option<u64>> {
        match self.size_and_align(sp, ty)? {
            Some((UNKNOWN_SIZE, _)) => {
                bail!("getting alignment of unsized type at {sp}: {ty:?}")
            }
            Some((_, align)) => Ok(Some(align)),
            None => Ok(None),
        }
    }

    /// Representation of a composite type. `None` when the type still
    /// depends on an unresolved generic; failed builds are memoised
    /// like successful ones. The returned handle stays valid for the
    /// solver's lifetime.
    pub fn type_repr(
        &mut self,
        sp: Span,
        ty: &TypeRef,
    ) -> Result<Option<Rc<TypeRepr>>> {
        if let Some(hit) = self.cache.get(ty) {
            return Ok(hit.clone());
        }
        if !self.building.insert(ty.clone()) {
            bail!("cyclic type reached layout at {sp}: {ty:?}");
        }
        let built = repr::build(self, sp, ty);
        self.building.remove(ty);
        let entry = built?.map(Rc::new);
        self.cache.insert(ty.clone(), entry.clone());
        Ok(entry)
    }

    /// Type of the leaf a field chain ends at.
    pub fn inner_type(
        &mut self,
        sp: Span,
        repr: &TypeRepr,
        idx: usize,
        sub_fields: &[usize],
    ) -> Result<TypeRef> {
        let mut ty = repr
            .fields
            .get(idx)
            .ok_or_else(|| anyhow!("field index {idx} out of range at {sp}"))?
            .ty
            .clone();
        for &sub in sub_fields {
            let inner = self
                .type_repr(sp, &ty)?
                .ok_or_else(|| anyhow!("no inner repr for {ty:?} at {sp}"))?;
            ty = inner
                .fields
                .get(sub)
                .ok_or_else(|| {
                    anyhow!("field index {sub} out of range at {sp}")
                })?
                .ty
                .clone();
        }
        Ok(ty)
    }

    /// Byte offset of the leaf a field path ends at, accumulated over
    /// every level of the chain.
    pub fn field_offset(
        &mut self,
        sp: Span,
        repr: &TypeRepr,
        path: &FieldPath,
    ) -> Result<u64> {
        let field = repr.fields.get(path.index).ok_or_else(|| {
            anyhow!("field index {} out of range at {sp}", path.index)
        })?;
        let mut offset = field.offset;
        let mut ty = field.ty.clone();
        for &sub in &path.sub_fields {
            let inner = self
                .type_repr(sp, &ty)?
                .ok_or_else(|| anyhow!("no inner repr for {ty:?} at {sp}"))?;
            let field = inner.fields.get(sub).ok_or_else(|| {
                anyhow!("field index {sub} out of range at {sp}")
            })?;
            offset += field.offset;
            ty = field.ty.clone();
        }
        Ok(offset)
    }
}

pub(crate) fn round_up(value: u64, align: u64) -> u64 {
    debug_assert!(align > 0);
    value.div_ceil(align) * align
}
