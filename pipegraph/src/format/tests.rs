use crate::{
    format::{
        FormatError, PROP_FLAG_UNSET, PROP_RANGE_ENUM, PROP_RANGE_MIN_MAX, audio_raw,
        audio_raw_enum, filter, fixate,
    },
    pod::{Pod, PodBuilder},
    types,
};

fn get_prop_int(data: &[u8], key: u32) -> i32 {
    let pod = Pod::from_slice(data).unwrap();
    let obj = pod.as_object().unwrap();
    obj.find(key).unwrap().unwrap().first().unwrap().as_int().unwrap()
}

fn get_prop_id(data: &[u8], key: u32) -> u32 {
    let pod = Pod::from_slice(data).unwrap();
    let obj = pod.as_object().unwrap();
    obj.find(key).unwrap().unwrap().first().unwrap().as_id().unwrap()
}

#[test]
fn filter_picks_first_common_entry_of_the_left_side() {
    let out = audio_raw_enum(&[types::AUDIO_F32], &[48000, 44100], 2);
    let inp = audio_raw_enum(&[types::AUDIO_F32], &[44100, 48000, 96000], 2);
    let common = filter(
        Pod::from_slice(&out).unwrap(),
        Pod::from_slice(&inp).unwrap(),
    )
    .unwrap();
    let fixed = fixate(Pod::from_slice(&common).unwrap()).unwrap();
    // Both rates are common; the left (output) enumeration order
    // wins.
    assert_eq!(get_prop_int(&fixed, types::KEY_AUDIO_RATE), 48000);
    assert_eq!(get_prop_id(&fixed, types::KEY_AUDIO_FORMAT), types::AUDIO_F32);
    assert_eq!(get_prop_int(&fixed, types::KEY_AUDIO_CHANNELS), 2);
}

#[test]
fn filter_fails_without_common_value() {
    let a = audio_raw(types::AUDIO_F32, 48000, 2);
    let b = audio_raw(types::AUDIO_F32, 44100, 2);
    let res = filter(Pod::from_slice(&a).unwrap(), Pod::from_slice(&b).unwrap());
    assert!(matches!(
        res,
        Err(FormatError::NoCommonValue(types::KEY_AUDIO_RATE))
    ));
}

#[test]
fn filter_set_against_enum() {
    let fixed = audio_raw(types::AUDIO_S16, 44100, 2);
    let open = audio_raw_enum(&[types::AUDIO_F32, types::AUDIO_S16], &[48000, 44100], 2);
    let common = filter(
        Pod::from_slice(&fixed).unwrap(),
        Pod::from_slice(&open).unwrap(),
    )
    .unwrap();
    assert_eq!(get_prop_id(&common, types::KEY_AUDIO_FORMAT), types::AUDIO_S16);
    assert_eq!(get_prop_int(&common, types::KEY_AUDIO_RATE), 44100);
}

#[test]
fn filter_min_max_range() {
    let mut a = PodBuilder::new();
    a.push_object(types::FORMAT_AUDIO, 0, |b| {
        b.prop_int(
            types::KEY_AUDIO_RATE,
            PROP_FLAG_UNSET | PROP_RANGE_ENUM,
            &[8000, 8000, 48000, 96000],
        );
    });
    let mut b = PodBuilder::new();
    b.push_object(types::FORMAT_AUDIO, 0, |p| {
        p.prop_int(
            types::KEY_AUDIO_RATE,
            PROP_FLAG_UNSET | PROP_RANGE_MIN_MAX,
            &[48000, 16000, 96000],
        );
    });
    let common = filter(
        Pod::from_slice(a.as_slice()).unwrap(),
        Pod::from_slice(b.as_slice()).unwrap(),
    )
    .unwrap();
    // 8000 is below the range; 48000 and 96000 survive in order.
    let pod = Pod::from_slice(&common).unwrap();
    let obj = pod.as_object().unwrap();
    let prop = obj.find(types::KEY_AUDIO_RATE).unwrap().unwrap();
    assert_ne!(prop.flags & PROP_FLAG_UNSET, 0);
    let fixed = fixate(Pod::from_slice(&common).unwrap()).unwrap();
    assert_eq!(get_prop_int(&fixed, types::KEY_AUDIO_RATE), 48000);
}

#[test]
fn filter_copies_one_sided_props() {
    let mut a = PodBuilder::new();
    a.push_object(types::FORMAT_AUDIO, 0, |b| {
        b.prop_id(types::KEY_AUDIO_FORMAT, 0, &[types::AUDIO_F32]);
    });
    let mut b = PodBuilder::new();
    b.push_object(types::FORMAT_AUDIO, 0, |p| {
        p.prop_int(types::KEY_AUDIO_CHANNELS, 0, &[2]);
    });
    let common = filter(
        Pod::from_slice(a.as_slice()).unwrap(),
        Pod::from_slice(b.as_slice()).unwrap(),
    )
    .unwrap();
    assert_eq!(get_prop_id(&common, types::KEY_AUDIO_FORMAT), types::AUDIO_F32);
    assert_eq!(get_prop_int(&common, types::KEY_AUDIO_CHANNELS), 2);
}

#[test]
fn filter_rejects_different_object_types() {
    let a = audio_raw(types::AUDIO_F32, 48000, 2);
    let mut b = PodBuilder::new();
    b.push_object(types::PARAM_BUFFERS, 0, |_| {});
    let res = filter(Pod::from_slice(&a).unwrap(), Pod::from_slice(b.as_slice()).unwrap());
    assert!(matches!(res, Err(FormatError::TypeMismatch(..))));
}

#[test]
fn fixate_clears_unset() {
    let open = audio_raw_enum(&[types::AUDIO_F32, types::AUDIO_S16], &[44100, 48000], 2);
    let fixed = fixate(Pod::from_slice(&open).unwrap()).unwrap();
    let pod = Pod::from_slice(&fixed).unwrap();
    let obj = pod.as_object().unwrap();
    for prop in obj.props() {
        let prop = prop.unwrap();
        assert_eq!(prop.flags & PROP_FLAG_UNSET, 0);
        assert_eq!(prop.n_values(), 1);
    }
    assert_eq!(get_prop_id(&fixed, types::KEY_AUDIO_FORMAT), types::AUDIO_F32);
    assert_eq!(get_prop_int(&fixed, types::KEY_AUDIO_RATE), 44100);
}
