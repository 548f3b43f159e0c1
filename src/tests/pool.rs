use std::thread;

use crate::model::pool::{DexMethodRef, DexProto, DexString, DexType};

#[test]
fn types_intern_to_one_identity() {
    let first = DexType::make("Lfoo/Bar;");
    let second = DexType::make("Lfoo/Bar;");
    assert_eq!(first, second);
    assert_eq!(DexType::get("Lfoo/Bar;"), Some(first));
    assert_eq!(DexType::get("Lpool/never/Made;"), None);
    assert_eq!(first.name().as_str(), "Lfoo/Bar;");
}

#[test]
fn strings_from_other_threads_share_identity() {
    let handles: Vec<_> = (0..4).map(|_| thread::spawn(|| DexString::make("pool-scenario-\u{e9}"))).collect();
    let made: Vec<DexString> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let here = DexString::make("pool-scenario-\u{e9}");
    assert!(made.iter().all(|s| *s == here));
    assert_eq!(here.utf16_size(), 15);
}

#[test]
fn method_refs_share_their_components() {
    let m = DexMethodRef::make_from_descriptor("Lpool/A;.f:(ILjava/lang/String;)J").unwrap();
    assert_eq!(m.class(), DexType::make("Lpool/A;"));
    assert_eq!(m.proto(), DexProto::make_from_descriptor("(ILjava/lang/String;)J").unwrap());
    assert_eq!(m.proto().shorty().as_str(), "JIL");
    assert_eq!(m.to_string(), "Lpool/A;.f:(ILjava/lang/String;)J");
}
