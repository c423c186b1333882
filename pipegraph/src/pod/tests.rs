use crate::pod::{Pod, PodBuilder, PodError, PodType};

fn build(f: impl FnOnce(&mut PodBuilder)) -> Vec<u8> {
    let mut b = PodBuilder::new();
    f(&mut b);
    b.into_vec()
}

#[test]
fn primitive_round_trip() {
    let data = build(|b| {
        b.push_struct(|b| {
            b.none();
            b.bool_(true);
            b.id(77);
            b.int(-5);
            b.long(1 << 40);
            b.float(0.5);
            b.double(-2.25);
            b.string("hello");
            b.bytes(&[1, 2, 3]);
            b.fd(2);
            b.rectangle(640, 480);
            b.fraction(30, 1);
        });
    });
    assert_eq!(data.len() % 8, 0);
    let pod = Pod::from_slice(&data).unwrap();
    let mut it = pod.as_struct().unwrap();
    assert!(it.pod().unwrap().is_none());
    assert!(it.pod().unwrap().as_bool().unwrap());
    assert_eq!(it.id().unwrap(), 77);
    assert_eq!(it.int().unwrap(), -5);
    assert_eq!(it.long().unwrap(), 1 << 40);
    assert_eq!(it.pod().unwrap().as_float().unwrap(), 0.5);
    assert_eq!(it.pod().unwrap().as_double().unwrap(), -2.25);
    assert_eq!(it.string().unwrap(), "hello");
    assert_eq!(it.pod().unwrap().as_bytes().unwrap(), &[1, 2, 3]);
    assert_eq!(it.fd_index().unwrap(), 2);
    assert_eq!(it.pod().unwrap().as_rectangle().unwrap(), (640, 480));
    assert_eq!(it.pod().unwrap().as_fraction().unwrap(), (30, 1));
    assert!(matches!(it.pod(), Err(PodError::MissingField)));
}

#[test]
fn nested_structs() {
    let data = build(|b| {
        b.push_struct(|b| {
            b.int(1);
            b.push_struct(|b| {
                b.string("inner");
            });
            b.int(2);
        });
    });
    let pod = Pod::from_slice(&data).unwrap();
    let mut it = pod.as_struct().unwrap();
    assert_eq!(it.int().unwrap(), 1);
    let mut inner = it.pod().unwrap().as_struct().unwrap();
    assert_eq!(inner.string().unwrap(), "inner");
    assert_eq!(it.int().unwrap(), 2);
}

#[test]
fn object_props() {
    let data = build(|b| {
        b.push_object(100, 0, |b| {
            b.prop_id(10, 0, &[42]);
            b.prop_int(11, 0, &[48000, 44100, 96000]);
        });
    });
    let pod = Pod::from_slice(&data).unwrap();
    let obj = pod.as_object().unwrap();
    assert_eq!(obj.type_id, 100);
    let props: Vec<_> = obj.props().collect::<Result<_, _>>().unwrap();
    assert_eq!(props.len(), 2);
    assert_eq!(props[0].key, 10);
    assert_eq!(props[0].first().unwrap().as_id().unwrap(), 42);
    assert_eq!(props[1].n_values(), 3);
    assert_eq!(props[1].value(2).unwrap().as_int().unwrap(), 96000);
    assert!(obj.find(11).unwrap().is_some());
    assert!(obj.find(12).unwrap().is_none());
}

#[test]
fn array_of_ids() {
    let data = build(|b| b.array_id(&[3, 1, 4, 1, 5]));
    let pod = Pod::from_slice(&data).unwrap();
    let arr = pod.as_array().unwrap();
    assert_eq!(arr.child_ty, PodType::Id);
    assert_eq!(arr.ids().unwrap(), vec![3, 1, 4, 1, 5]);
}

#[test]
fn truncated_body() {
    let data = build(|b| b.string("truncate me please"));
    for len in 1..data.len() - 8 {
        assert!(Pod::from_slice(&data[..len]).is_err());
    }
}

#[test]
fn mismatched_type() {
    let data = build(|b| b.int(1));
    let pod = Pod::from_slice(&data).unwrap();
    assert!(matches!(
        pod.as_id(),
        Err(PodError::WrongType {
            found: PodType::Int,
            expected: PodType::Id,
        })
    ));
}

#[test]
fn unknown_type_tag() {
    let mut data = build(|b| b.int(1));
    data[4..8].copy_from_slice(&999u32.to_ne_bytes());
    assert!(matches!(
        Pod::from_slice(&data),
        Err(PodError::UnknownType(999))
    ));
}

#[test]
fn overflowing_size() {
    let mut data = build(|b| b.int(1));
    data[0..4].copy_from_slice(&0xffff_0000u32.to_ne_bytes());
    assert!(matches!(Pod::from_slice(&data), Err(PodError::Truncated)));
}

#[test]
fn reencode_equals_original() {
    let data = build(|b| {
        b.push_struct(|b| {
            b.string("x");
            b.push_object(7, 1, |b| {
                b.prop_id(1, 0, &[2]);
            });
        });
    });
    let pod = Pod::from_slice(&data).unwrap();
    assert_eq!(pod.to_vec(), data);
}
