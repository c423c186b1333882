use crate::{
    pod::{Pod, PodBuilder},
    types::{self, PeerTypes, TypeError, TypeMap, translate_pod},
};

#[test]
fn builtins_are_preseeded() {
    let map = TypeMap::new();
    assert_eq!(map.id_of("PipeGraph:Object:Core"), Some(types::CORE));
    assert_eq!(map.name(types::LINK), Some("PipeGraph:Object:Link"));
    assert_eq!(map.name(types::INVALID), None);
}

#[test]
fn intern_is_append_only() {
    let mut map = TypeMap::new();
    let first = map.next_id();
    let a = map.intern("Vendor:Format:Video");
    let b = map.intern("Vendor:Format:Video:size");
    assert_eq!(a, first);
    assert_eq!(b, first + 1);
    assert_eq!(map.intern("Vendor:Format:Video"), a);
    assert_eq!(map.names_from(first), ["Vendor:Format:Video", "Vendor:Format:Video:size"]);
}

#[test]
fn peer_update_and_translate() {
    let mut own = TypeMap::new();
    let mut peer = PeerTypes::new();
    // The peer knows "Theirs:A" before we do; our map assigns it a
    // fresh id on arrival.
    let first = peer.next_id();
    peer.update(first, &["Theirs:A".to_string()], &mut own).unwrap();
    let own_id = own.id_of("Theirs:A").unwrap();
    assert_eq!(peer.translate(first).unwrap(), own_id);
    assert_eq!(peer.translate(types::NODE).unwrap(), types::NODE);
    assert!(matches!(peer.translate(first + 1), Err(TypeError::Unknown(_))));
}

#[test]
fn peer_update_rejects_gaps_and_reassignment() {
    let mut own = TypeMap::new();
    let mut peer = PeerTypes::new();
    let next = peer.next_id();
    assert!(matches!(
        peer.update(next + 3, &["X".to_string()], &mut own),
        Err(TypeError::Gap { .. })
    ));
    peer.update(next, &["X".to_string()], &mut own).unwrap();
    assert!(matches!(
        peer.update(next, &["Y".to_string()], &mut own),
        Err(TypeError::Reassigned { .. })
    ));
}

#[test]
fn translate_pod_rewrites_every_type_field() {
    // Map every id to id + 100 to make rewrites visible.
    let tr = |id: u32| Ok(id + 100);
    let mut b = PodBuilder::new();
    b.push_struct(|b| {
        b.id(types::NODE);
        b.int(7);
        b.array_id(&[1, 2]);
        b.push_object(types::FORMAT_AUDIO, 0, |b| {
            b.prop_id(types::KEY_AUDIO_FORMAT, 0, &[types::AUDIO_F32]);
            b.prop_int(types::KEY_AUDIO_RATE, 0, &[48000]);
        });
    });
    let out = translate_pod(b.as_slice(), &tr).unwrap();
    let pod = Pod::from_slice(&out).unwrap();
    let mut it = pod.as_struct().unwrap();
    assert_eq!(it.id().unwrap(), types::NODE + 100);
    // Plain ints are not type-valued and stay untouched.
    assert_eq!(it.int().unwrap(), 7);
    assert_eq!(it.pod().unwrap().as_array().unwrap().ids().unwrap(), [101, 102]);
    let obj = it.pod().unwrap().as_object().unwrap();
    assert_eq!(obj.type_id, types::FORMAT_AUDIO + 100);
    let props: Vec<_> = obj.props().collect::<Result<_, _>>().unwrap();
    assert_eq!(props[0].key, types::KEY_AUDIO_FORMAT + 100);
    assert_eq!(props[0].first().unwrap().as_id().unwrap(), types::AUDIO_F32 + 100);
    assert_eq!(props[1].key, types::KEY_AUDIO_RATE + 100);
    assert_eq!(props[1].first().unwrap().as_int().unwrap(), 48000);
}

#[test]
fn translate_pod_fails_on_unknown_id() {
    let own = TypeMap::new();
    let peer = PeerTypes::new();
    let mut b = PodBuilder::new();
    b.push_struct(|b| b.id(own.next_id() + 5));
    assert!(translate_pod(b.as_slice(), &|id| peer.translate(id)).is_err());
}
