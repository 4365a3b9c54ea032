use anyhow::{bail, ensure, Result};
use log::debug;

use super::{
    round_up, Field, FieldPath, LayoutSolver, TypeRepr, VariantMode,
    UNKNOWN_SIZE,
};
use crate::hir::{
    CoreType, DataVariant, DiscriminantRepr, EnumVariants, LangVersion,
    PathType, Span, StructFields, StructRepr, TypeBinding, TypeRef,
    TypeResolver, ValueVariant,
};
use crate::int128::S128;
use crate::target::PointerBits;

/// Build the representation of a composite type, or `None` when a
/// field's layout is still unknown.
pub(super) fn build<R: TypeResolver>(
    s: &mut LayoutSolver<R>,
    sp: Span,
    ty: &TypeRef,
) -> Result<Option<TypeRepr>> {
    match ty {
        TypeRef::Tuple(_) => build_struct(s, sp, ty),
        TypeRef::Path(pt) => match &pt.binding {
            TypeBinding::Struct(_) => build_struct(s, sp, ty),
            TypeBinding::Union(_) => build_union(s, sp, ty),
            TypeBinding::Enum(_) => build_enum(s, sp, ty),
            TypeBinding::ExternType => Ok(None),
            TypeBinding::Opaque | TypeBinding::Unbound => {
                bail!("invalid type in type repr at {sp}: {ty:?}")
            }
        },
        // Leaf types carry no representation of their own; searches
        // walking into fields simply stop here.
        TypeRef::Primitive(_)
        | TypeRef::Borrow { .. }
        | TypeRef::Pointer { .. } => Ok(None),
        _ => bail!("type repr requested for {ty:?} at {sp}"),
    }
}

struct Ent {
    field: usize,
    size: u64,
    align: u64,
}

fn build_struct<R: TypeResolver>(
    s: &mut LayoutSolver<R>,
    sp: Span,
    ty: &TypeRef,
) -> Result<Option<TypeRepr>> {
    let mut ents: Vec<Ent> = Vec::new();
    let mut fields: Vec<Field> = Vec::new();
    let mut packed = false;

    let push_field = |s: &mut LayoutSolver<R>,
                      ents: &mut Vec<Ent>,
                      fields: &mut Vec<Field>,
                      fty: TypeRef|
     -> Result<bool> {
        let Some((size, align)) = s.size_and_align(sp, &fty)? else {
            debug!("can't get size/align of {fty:?}");
            return Ok(false);
        };
        ents.push(Ent {
            field: fields.len(),
            size,
            align,
        });
        fields.push(Field { offset: 0, ty: fty });
        Ok(true)
    };

    match ty {
        TypeRef::Path(pt) => {
            let TypeBinding::Struct(def) = &pt.binding else {
                bail!("unexpected type in creating type repr at {sp}: {ty:?}");
            };
            let def = def.clone();
            let member_types: Vec<TypeRef> = match &def.fields {
                StructFields::Unit => Vec::new(),
                StructFields::Tuple(tys) => {
                    tys.iter().map(|t| t.monomorph(&pt.params)).collect()
                }
                StructFields::Named(members) => members
                    .iter()
                    .map(|(_, t)| t.monomorph(&pt.params))
                    .collect(),
            };
            for fty in member_types {
                if !push_field(s, &mut ents, &mut fields, fty)? {
                    return Ok(None);
                }
            }
            match def.repr {
                StructRepr::Packed => packed = true,
                // Source order, padding to each field's alignment.
                StructRepr::C | StructRepr::Simd => {}
                // Reordering by descending alignment would be legal
                // here, but offsets are reported either way; keep
                // declaration order.
                StructRepr::Aligned
                | StructRepr::Transparent
                | StructRepr::Rust => {}
            }
        }
        TypeRef::Tuple(members) => {
            debug!("tuple {ty:?}");
            for fty in members {
                if !push_field(s, &mut ents, &mut fields, fty.clone())? {
                    return Ok(None);
                }
            }
        }
        _ => bail!("unexpected type in creating type repr at {sp}: {ty:?}"),
    }

    let mut cur_ofs = 0u64;
    let mut max_align = 1u64;
    let last = ents.len().checked_sub(1);
    for (i, e) in ents.iter().enumerate() {
        if !packed && e.align > 0 {
            cur_ofs = round_up(cur_ofs, e.align);
        }
        max_align = max_align.max(e.align);
        fields[e.field].offset = cur_ofs;
        if e.size == UNKNOWN_SIZE {
            ensure!(
                Some(i) == last,
                "unsized field isn't the last field at {sp}: {ty:?}"
            );
            cur_ofs = UNKNOWN_SIZE;
        } else {
            cur_ofs += e.size;
        }
    }
    if !packed && cur_ofs != UNKNOWN_SIZE {
        // Total size is a multiple of the alignment.
        cur_ofs = round_up(cur_ofs, max_align);
    }

    let rv = TypeRepr {
        size: cur_ofs,
        align: if packed { 1 } else { max_align },
        fields,
        variants: VariantMode::None,
    };
    debug!("size = {}, align = {}", rv.size, rv.align);
    Ok(Some(rv))
}

fn build_union<R: TypeResolver>(
    s: &mut LayoutSolver<R>,
    sp: Span,
    ty: &TypeRef,
) -> Result<Option<TypeRepr>> {
    let TypeRef::Path(pt) = ty else {
        bail!("unexpected type in union repr at {sp}: {ty:?}");
    };
    let TypeBinding::Union(def) = &pt.binding else {
        bail!("unexpected type in union repr at {sp}: {ty:?}");
    };
    let def = def.clone();

    let mut rv = TypeRepr::default();
    for (_, fty) in &def.variants {
        let fty = fty.monomorph(&pt.params);
        let Some((size, align)) = s.size_and_align(sp, &fty)? else {
            debug!("generic type after monomorphise in union: {fty:?}");
            return Ok(None);
        };
        if size == UNKNOWN_SIZE {
            bail!("unsized type in union at {sp}: {fty:?}");
        }
        rv.fields.push(Field { offset: 0, ty: fty });
        rv.size = rv.size.max(size);
        rv.align = rv.align.max(align);
    }
    if rv.align > 0 {
        rv.size = round_up(rv.size, rv.align);
    }
    Ok(Some(rv))
}

fn build_enum<R: TypeResolver>(
    s: &mut LayoutSolver<R>,
    sp: Span,
    ty: &TypeRef,
) -> Result<Option<TypeRepr>> {
    let TypeRef::Path(pt) = ty else {
        bail!("unexpected type in enum repr at {sp}: {ty:?}");
    };
    let TypeBinding::Enum(def) = &pt.binding else {
        bail!("unexpected type in enum repr at {sp}: {ty:?}");
    };
    let def = def.clone();
    match &def.variants {
        EnumVariants::Data(variants) => {
            build_data_enum(s, sp, pt, variants)
        }
        EnumVariants::Value { repr, variants } => {
            build_value_enum(s, sp, *repr, variants)
        }
    }
}

fn build_data_enum<R: TypeResolver>(
    s: &mut LayoutSolver<R>,
    sp: Span,
    pt: &PathType,
    variants: &[DataVariant],
) -> Result<Option<TypeRepr>> {
    let mut rv = TypeRepr::default();
    let mut var_sizes = Vec::with_capacity(variants.len());
    let mut max_size = 0u64;
    let mut max_align = 0u64;
    for var in variants {
        let fty = var.ty.monomorph(&pt.params);
        let Some((size, align)) = s.size_and_align(sp, &fty)? else {
            debug!("generic type in enum: {fty:?}");
            return Ok(None);
        };
        if size == UNKNOWN_SIZE {
            bail!("unsized type in enum at {sp}: {fty:?}");
        }
        max_size = max_size.max(size);
        max_align = max_align.max(align);
        var_sizes.push(size);
        rv.fields.push(Field { offset: 0, ty: fty });
    }
    debug!("max_size = {max_size}, max_align = {max_align}");

    // Non-zero optimisation: a unit variant plus a payload carrying a
    // never-zero field collapses to the payload alone.
    if variants.len() == 2 && rv.fields[0].ty.is_unit() {
        let mut nz_path = FieldPath::default();
        let payload = rv.fields[1].ty.clone();
        if nonzero_path(s, sp, &payload, &mut nz_path)? {
            nz_path.index = 1;
            nz_path.sub_fields.reverse();
            debug!("nz_path = {:?}", nz_path.sub_fields);
            rv.size = max_size;
            rv.align = max_align;
            rv.variants = VariantMode::NonZero {
                field: nz_path,
                zero_variant: 0,
            };
        }
    }

    // The payload block is padded out to the alignment; variant sizes
    // keep their raw values for the niche offset checks below.
    let max_var_size = max_size;
    if max_size > 0 {
        max_size = round_up(max_size, max_align);
    }

    // Niche optimisation: reuse spare encodings inside the single
    // largest variant, at an offset past every other variant's bytes.
    if rv.variants.is_none() && variants.len() > 1 {
        let mut n_match = 0usize;
        let mut biggest_var = rv.fields.len();
        let mut min_offset = 0u64;
        for (i, &size) in var_sizes.iter().enumerate() {
            if size == max_var_size {
                n_match += 1;
                biggest_var = i;
            } else {
                min_offset = min_offset.max(size);
            }
        }
        debug!(
            "niche: max_var_size={max_var_size} n_match={n_match} \
             biggest_var={biggest_var} min_offset={min_offset}"
        );

        if n_match == 1 {
            let mut nz_path = FieldPath::default();
            let host = rv.fields[biggest_var].ty.clone();
            if let Some(offset) =
                variant_niche_path(s, sp, &host, min_offset, &mut nz_path)?
            {
                // NOTE: conservatively capped at 2^32 for an 8-byte
                // leaf to keep the arithmetic clear of overflow.
                let max_var: u64 = match nz_path.size {
                    1 => 0xFF,
                    2 => 0xFFFF,
                    4 => 0xFFFF_FFFF,
                    8 => 0xFFFF_FFFF,
                    _ => 0,
                };
                debug!("niche offset={offset}");
                let n = variants.len() as u64;
                if offset <= max_var && offset + n <= max_var {
                    nz_path.index = biggest_var;
                    nz_path.sub_fields.reverse();
                    let tag_ofs = s.field_offset(sp, &rv, &nz_path)?;
                    ensure!(
                        tag_ofs >= min_offset,
                        "niche tag at {tag_ofs} overlaps variant data \
                         at {sp}"
                    );
                    rv.size = max_size;
                    rv.align = max_align;
                    rv.variants = VariantMode::Linear {
                        field: nz_path,
                        offset,
                        num_variants: variants.len(),
                    };
                } else {
                    debug!(
                        "out of space in this niche: {} > {max_var}",
                        offset + n
                    );
                }
            }
        }
    }

    // No usable niche: append a fresh tag.
    if rv.variants.is_none() {
        let n = variants.len();
        let mut tag_size = 0u64;
        if n <= 1 {
            // Nothing to discriminate.
        } else if n <= 255 {
            rv.fields.push(Field {
                offset: max_size,
                ty: TypeRef::Primitive(CoreType::U8),
            });
            tag_size = 1;
            debug!("u8 data tag");
        } else {
            ensure!(n <= 0xFFFF, "too many enum variants at {sp}");
            max_size = round_up(max_size, 2);
            rv.fields.push(Field {
                offset: max_size,
                ty: TypeRef::Primitive(CoreType::U16),
            });
            tag_size = 2;
            debug!("u16 data tag");
        }
        max_align = max_align.max(tag_size);
        if n > 1 {
            rv.variants = VariantMode::Linear {
                field: FieldPath {
                    index: n,
                    sub_fields: Vec::new(),
                    size: tag_size,
                },
                offset: 0,
                num_variants: n,
            };
        }
        if max_align > 0 {
            rv.size = round_up(max_size + tag_size, max_align);
            rv.align = max_align;
        } else {
            ensure!(
                max_size == 0,
                "zero alignment with nonzero size at {sp}"
            );
        }
    }
    debug!("variants = {:?}", rv.variants);
    Ok(Some(rv))
}

fn build_value_enum<R: TypeResolver>(
    s: &mut LayoutSolver<R>,
    sp: Span,
    repr: DiscriminantRepr,
    variants: &[ValueVariant],
) -> Result<Option<TypeRepr>> {
    let tag = match repr {
        DiscriminantRepr::C => Some(CoreType::U32),
        DiscriminantRepr::U8 => Some(CoreType::U8),
        DiscriminantRepr::U16 => Some(CoreType::U16),
        DiscriminantRepr::U32 => Some(CoreType::U32),
        DiscriminantRepr::U64 => Some(CoreType::U64),
        DiscriminantRepr::Usize => {
            Some(match s.target().arch.pointer_bits {
                PointerBits::P16 => CoreType::U16,
                PointerBits::P32 => CoreType::U32,
                PointerBits::P64 => CoreType::U64,
            })
        }
        // Smallest signed integer that fits every discriminant.
        DiscriminantRepr::Rust => {
            let mut pow8 = 0u8;
            for var in variants {
                let v = var.value;
                if S128::new(-0x80) <= v && v < S128::new(0x80) {
                    pow8 = pow8.max(1);
                } else if S128::new(-0x8000) <= v && v < S128::new(0x8000) {
                    pow8 = pow8.max(2);
                } else if S128::new(-0x8000_0000) <= v
                    && v < S128::new(0x8000_0000)
                {
                    pow8 = pow8.max(3);
                } else {
                    pow8 = 4;
                }
            }
            match pow8 {
                0 => None,
                1 => Some(CoreType::I8),
                2 => Some(CoreType::I16),
                3 => Some(CoreType::I32),
                _ => Some(CoreType::I64),
            }
        }
    };

    let mut rv = TypeRepr::default();
    if let Some(tag) = tag {
        let tag_ty = TypeRef::Primitive(tag);
        let Some((size, align)) = s.size_and_align(sp, &tag_ty)? else {
            bail!("no layout for discriminant type at {sp}: {tag_ty:?}");
        };
        rv.fields.push(Field {
            offset: 0,
            ty: tag_ty,
        });
        rv.size = size;
        rv.align = align;
        rv.variants = VariantMode::Values {
            field: FieldPath {
                index: 0,
                sub_fields: Vec::new(),
                size,
            },
            values: variants
                .iter()
                .map(|v| v.value.to_bits().truncate_u64())
                .collect(),
        };
    }
    Ok(Some(rv))
}

/// Find a field whose zero bit pattern is never a legal value:
/// references, function pointers, wrapper structs marked never-zero
/// and, on old language levels, the `NonZero` lang item. Sub-field
/// indices accumulate innermost first; the caller reverses them.
fn nonzero_path<R: TypeResolver>(
    s: &mut LayoutSolver<R>,
    sp: Span,
    ty: &TypeRef,
    out: &mut FieldPath,
) -> Result<bool> {
    match ty {
        TypeRef::Path(pt) => {
            let TypeBinding::Struct(def) = &pt.binding else {
                return Ok(false);
            };
            let def = def.clone();
            let Some(repr) = s.type_repr(sp, ty)? else {
                return Ok(false);
            };
            for i in 0..repr.fields.len() {
                let fty = repr.fields[i].ty.clone();
                if nonzero_path(s, sp, &fty, out)? {
                    out.sub_fields.push(i);
                    return Ok(true);
                }
            }
            if def.markings.is_nonzero {
                out.sub_fields.push(0);
                out.size = repr.size;
                return Ok(true);
            }
            if s.lang_version() <= LangVersion::Rustc1_29 {
                // The NonZero lang item predates the wrapper marking.
                if let Some(nz) = s.resolver().nonzero_lang_item() {
                    if pt.path == *nz {
                        out.sub_fields.push(0);
                        out.size = repr.size;
                        return Ok(true);
                    }
                }
            }
            Ok(false)
        }
        TypeRef::Borrow { .. } | TypeRef::Function(_) => {
            out.size = s.size_of(sp, ty)?.unwrap_or(0);
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Locate a tag slot with spare encodings inside `ty`, no earlier than
/// `min_offset` so other variants' bytes cannot collide with it.
///
/// Returns the number of encodings already in use (the outer variants
/// claim values starting there), or `None` when the type offers no
/// niche. Sub-field indices accumulate innermost first.
fn variant_niche_path<R: TypeResolver>(
    s: &mut LayoutSolver<R>,
    sp: Span,
    ty: &TypeRef,
    min_offset: u64,
    out: &mut FieldPath,
) -> Result<Option<u64>> {
    debug!("niche search in {ty:?} min_offset={min_offset}");
    match ty {
        TypeRef::Path(pt) => match &pt.binding {
            TypeBinding::Struct(def) => {
                let def = def.clone();
                let Some(repr) = s.type_repr(sp, ty)? else {
                    return Ok(None);
                };
                if let Some(bound) = def.markings.bounded_max {
                    // A bounded scalar leaves everything above the
                    // bound free, but only as the leading bytes.
                    if bound >= u64::from(u32::MAX) || min_offset != 0 {
                        return Ok(None);
                    }
                    debug!("max bounded");
                    ensure!(
                        !repr.fields.is_empty()
                            && repr.fields[0].offset == 0,
                        "malformed bounded struct at {sp}"
                    );
                    let fty = repr.fields[0].ty.clone();
                    let size = s.size_of(sp, &fty)?.unwrap_or(0);
                    out.sub_fields.push(0);
                    out.size = size;
                    return Ok(Some(bound + 1));
                }
                for i in 0..repr.fields.len() {
                    let f_ofs = repr.fields[i].offset;
                    let fty = repr.fields[i].ty.clone();
                    let f_size = match s.size_and_align(sp, &fty)? {
                        Some((size, _)) if size != UNKNOWN_SIZE => size,
                        _ => 0,
                    };
                    if f_ofs + f_size > min_offset {
                        let sub_min = min_offset.saturating_sub(f_ofs);
                        if let Some(used) =
                            variant_niche_path(s, sp, &fty, sub_min, out)?
                        {
                            out.sub_fields.push(i);
                            return Ok(Some(used));
                        }
                    }
                }
                Ok(None)
            }
            TypeBinding::Enum(_) => {
                let Some(repr) = s.type_repr(sp, ty)? else {
                    return Ok(None);
                };
                match &repr.variants {
                    VariantMode::None => {
                        // Undiscriminated: look inside the only field.
                        let Some(field) = repr.fields.first() else {
                            return Ok(None);
                        };
                        let fty = field.ty.clone();
                        match variant_niche_path(
                            s, sp, &fty, min_offset, out,
                        )? {
                            Some(used) => {
                                out.sub_fields.push(0);
                                Ok(Some(used))
                            }
                            None => Ok(None),
                        }
                    }
                    VariantMode::Linear {
                        field,
                        offset,
                        num_variants,
                    } => {
                        let field = field.clone();
                        let (offset, num) = (*offset, *num_variants);
                        let tag_ofs = s.field_offset(sp, &repr, &field)?;
                        debug!("tag offset: {tag_ofs}");
                        if tag_ofs < min_offset {
                            return Ok(None);
                        }
                        out.size = field.size;
                        out.sub_fields.clear();
                        out.sub_fields
                            .extend(field.sub_fields.iter().rev().copied());
                        out.sub_fields.push(field.index);
                        // The host's own variants leave a hole below
                        // this value.
                        Ok(Some(offset + num as u64))
                    }
                    VariantMode::Values { .. }
                    | VariantMode::NonZero { .. } => Ok(None),
                }
            }
            _ => Ok(None),
        },
        TypeRef::Primitive(CoreType::Char) => {
            // Code points stop at 0x10FFFF; everything above is free.
            if min_offset == 0 {
                out.size = 4;
                Ok(Some(0x10FFFF + 1))
            } else {
                Ok(None)
            }
        }
        _ => Ok(None),
    }
}
