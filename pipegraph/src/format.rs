//! Format negotiation primitives.
//!
//! Formats are object pods whose properties carry either a fixed
//! value or a set of alternatives (an enumeration or a min/max
//! range) plus an *unset* flag. [`filter`] intersects two objects of
//! the same type, [`fixate`] turns every unset property into its
//! default. Both are pure functions on encoded pods.

use {
    crate::{
        pod::{Pod, PodBuilder, PodError, PodProp, PodType},
        types,
    },
    thiserror::Error,
};

#[cfg(test)]
mod tests;

/// How the alternatives of an unset property are interpreted.
pub const PROP_RANGE_MASK: u32 = 0x7;
pub const PROP_RANGE_NONE: u32 = 0;
/// `values[1]` is the minimum, `values[2]` the maximum.
pub const PROP_RANGE_MIN_MAX: u32 = 1;
/// `values[1..]` enumerate the allowed values.
pub const PROP_RANGE_ENUM: u32 = 2;
/// The property has no fixed value yet; `values[0]` is the default.
pub const PROP_FLAG_UNSET: u32 = 1 << 4;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("cannot filter objects of types {0} and {1}")]
    TypeMismatch(u32, u32),
    #[error("property {0} has different value types on both sides")]
    ChildMismatch(u32),
    #[error("property {0} has no common value")]
    NoCommonValue(u32),
    #[error("property {0} cannot be compared as a range")]
    NotComparable(u32),
    #[error("could not parse the format")]
    Pod(#[from] PodError),
}

fn is_set(prop: &PodProp<'_>) -> bool {
    prop.flags & PROP_FLAG_UNSET == 0
}

fn range(prop: &PodProp<'_>) -> u32 {
    prop.flags & PROP_RANGE_MASK
}

/// The indices of the values that an unset property allows.
fn allowed(prop: &PodProp<'_>) -> std::ops::Range<usize> {
    match range(prop) {
        PROP_RANGE_ENUM | PROP_RANGE_MIN_MAX => 1..prop.n_values(),
        _ => 0..1,
    }
}

fn as_i64(prop: &PodProp<'_>, idx: usize) -> Result<i64, FormatError> {
    let pod = prop.value(idx)?;
    match pod.ty() {
        PodType::Int => Ok(pod.as_int()? as i64),
        PodType::Long => Ok(pod.as_long()?),
        _ => Err(FormatError::NotComparable(prop.key)),
    }
}

/// Whether `value` (a raw child value of `prop`) is allowed by
/// `prop`'s alternatives.
fn admits(prop: &PodProp<'_>, value: &[u8]) -> Result<bool, FormatError> {
    if is_set(prop) {
        return Ok(prop.raw_value(0)? == value);
    }
    match range(prop) {
        PROP_RANGE_MIN_MAX => {
            let probe = Pod::with_body(prop.child_ty, value);
            let v = match probe.ty() {
                PodType::Int => probe.as_int().map_err(FormatError::Pod)? as i64,
                PodType::Long => probe.as_long().map_err(FormatError::Pod)?,
                _ => return Err(FormatError::NotComparable(prop.key)),
            };
            Ok(v >= as_i64(prop, 1)? && v <= as_i64(prop, 2)?)
        }
        PROP_RANGE_ENUM => {
            for idx in allowed(prop) {
                if prop.raw_value(idx)? == value {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Ok(prop.raw_value(0)? == value),
    }
}

fn copy_prop(out: &mut PodBuilder, prop: &PodProp<'_>) -> Result<(), FormatError> {
    let values: Vec<&[u8]> = (0..prop.n_values())
        .map(|i| prop.raw_value(i))
        .collect::<Result<_, _>>()?;
    out.prop_raw(prop.key, prop.flags, prop.child_ty, prop.child_size, &values);
    Ok(())
}

fn set_prop(out: &mut PodBuilder, prop: &PodProp<'_>, value: &[u8]) {
    let flags = prop.flags & !(PROP_FLAG_UNSET | PROP_RANGE_MASK);
    out.prop_raw(prop.key, flags, prop.child_ty, prop.child_size, &[value]);
}

fn intersect(
    out: &mut PodBuilder,
    pa: &PodProp<'_>,
    pb: &PodProp<'_>,
) -> Result<(), FormatError> {
    if pa.child_ty != pb.child_ty || pa.child_size != pb.child_size {
        return Err(FormatError::ChildMismatch(pa.key));
    }
    match (is_set(pa), is_set(pb)) {
        (true, _) => {
            if !admits(pb, pa.raw_value(0)?)? {
                return Err(FormatError::NoCommonValue(pa.key));
            }
            copy_prop(out, pa)
        }
        (false, true) => {
            if !admits(pa, pb.raw_value(0)?)? {
                return Err(FormatError::NoCommonValue(pa.key));
            }
            set_prop(out, pa, pb.raw_value(0)?);
            Ok(())
        }
        (false, false) => {
            // Keep the alternatives of `pa` that `pb` admits, in
            // `pa`'s order.
            let mut common = Vec::new();
            for idx in allowed(pa) {
                let value = pa.raw_value(idx)?;
                if admits(pb, value)? {
                    common.push(value);
                }
            }
            match common.len() {
                0 => Err(FormatError::NoCommonValue(pa.key)),
                1 => {
                    set_prop(out, pa, common[0]);
                    Ok(())
                }
                _ => {
                    let mut values = vec![common[0]];
                    values.extend_from_slice(&common);
                    let flags = (pa.flags & !PROP_RANGE_MASK) | PROP_RANGE_ENUM | PROP_FLAG_UNSET;
                    out.prop_raw(pa.key, flags, pa.child_ty, pa.child_size, &values);
                    Ok(())
                }
            }
        }
    }
}

/// Intersects two format objects of the same type, keeping only
/// compatible properties. Properties present on one side only are
/// copied through.
pub fn filter(a: Pod<'_>, b: Pod<'_>) -> Result<Vec<u8>, FormatError> {
    let oa = a.as_object()?;
    let ob = b.as_object()?;
    if oa.type_id != ob.type_id {
        return Err(FormatError::TypeMismatch(oa.type_id, ob.type_id));
    }
    let mut out = PodBuilder::new();
    let mut err = None;
    out.push_object(oa.type_id, oa.object_id, |out| {
        let mut run = || -> Result<(), FormatError> {
            for pa in oa.props() {
                let pa = pa?;
                match ob.find(pa.key)? {
                    Some(pb) => intersect(out, &pa, &pb)?,
                    None => copy_prop(out, &pa)?,
                }
            }
            for pb in ob.props() {
                let pb = pb?;
                if oa.find(pb.key)?.is_none() {
                    copy_prop(out, &pb)?;
                }
            }
            Ok(())
        };
        err = run().err();
    });
    match err {
        Some(e) => Err(e),
        None => Ok(out.into_vec()),
    }
}

/// Picks the default value for every unset property.
pub fn fixate(pod: Pod<'_>) -> Result<Vec<u8>, FormatError> {
    let obj = pod.as_object()?;
    let mut out = PodBuilder::new();
    let mut err = None;
    out.push_object(obj.type_id, obj.object_id, |out| {
        let mut run = || -> Result<(), FormatError> {
            for prop in obj.props() {
                let prop = prop?;
                if is_set(&prop) {
                    copy_prop(out, &prop)?;
                } else {
                    set_prop(out, &prop, prop.raw_value(0)?);
                }
            }
            Ok(())
        };
        err = run().err();
    });
    match err {
        Some(e) => Err(e),
        None => Ok(out.into_vec()),
    }
}

/// Builds a fixed raw-audio format object.
pub fn audio_raw(format: u32, rate: i32, channels: i32) -> Vec<u8> {
    let mut b = PodBuilder::new();
    b.push_object(types::FORMAT_AUDIO, 0, |b| {
        b.prop_id(types::KEY_AUDIO_FORMAT, 0, &[format]);
        b.prop_int(types::KEY_AUDIO_RATE, 0, &[rate]);
        b.prop_int(types::KEY_AUDIO_CHANNELS, 0, &[channels]);
    });
    b.into_vec()
}

/// Builds an unfixed raw-audio format enumerating the supported
/// sample formats and rates. The first entry of each list is the
/// default.
pub fn audio_raw_enum(formats: &[u32], rates: &[i32], channels: i32) -> Vec<u8> {
    let mut b = PodBuilder::new();
    let prop_enum_id = |b: &mut PodBuilder, key: u32, values: &[u32]| {
        if let [single] = values {
            b.prop_id(key, 0, &[*single]);
        } else {
            let mut all = vec![values[0]];
            all.extend_from_slice(values);
            b.prop_id(key, PROP_FLAG_UNSET | PROP_RANGE_ENUM, &all);
        }
    };
    let prop_enum_int = |b: &mut PodBuilder, key: u32, values: &[i32]| {
        if let [single] = values {
            b.prop_int(key, 0, &[*single]);
        } else {
            let mut all = vec![values[0]];
            all.extend_from_slice(values);
            b.prop_int(key, PROP_FLAG_UNSET | PROP_RANGE_ENUM, &all);
        }
    };
    b.push_object(types::FORMAT_AUDIO, 0, |b| {
        prop_enum_id(b, types::KEY_AUDIO_FORMAT, formats);
        prop_enum_int(b, types::KEY_AUDIO_RATE, rates);
        b.prop_int(types::KEY_AUDIO_CHANNELS, 0, &[channels]);
    });
    b.into_vec()
}
