use std::fs;

use tempfile::tempdir;

use crate::config::DexOptions;
use crate::dex::code::DexCode;
use crate::dex::encoded_values::EncodedValue;
use crate::dex::error::ErrorKind;
use crate::dex::instruction::{DexInstruction, DexRef};
use crate::dex::loader::{load_classes_from_dex, DexStats};
use crate::dex::opcodes::DexOpcode;
use crate::dex::writer::write_classes_to_dex;
use crate::find_dex_files;
use crate::ir::opcode::IROpcode;
use crate::model::access::DexAccessFlags;
use crate::model::class::{DexClass, DexField, DexMethod};
use crate::model::pool::{DexFieldRef, DexMethodRef, DexString, DexType};

fn counter_class(pkg: &str) -> DexClass {
    let desc = |member: &str| format!("L{}/Counter;{}", pkg, member);
    let mut cls = DexClass::new(DexType::make(&desc("")), "files-test").unwrap();
    cls.set_access(DexAccessFlags::PUBLIC | DexAccessFlags::FINAL);
    cls.set_super_class(Some(DexType::make("Ljava/lang/Object;")));
    cls.set_source_file(Some(DexString::make("Counter.java")));

    let mut field = DexField::new(DexFieldRef::make_from_descriptor(&desc(".START:I")).unwrap());
    field.make_concrete(DexAccessFlags::STATIC | DexAccessFlags::FINAL, Some(EncodedValue::Int(42))).unwrap();
    cls.add_field(field).unwrap();

    // if (n == 0) return "zero"; return "many";
    let code = DexCode {
        registers_size: 2,
        ins_size: 1,
        insns: vec![
            DexInstruction::new(DexOpcode::IfEqz).with_regs(&[1]).with_offset(4),
            DexInstruction::new(DexOpcode::ConstString).with_regs(&[0]).with_ref(DexRef::String(DexString::make("many"))),
            DexInstruction::new(DexOpcode::ReturnObject).with_regs(&[0]),
            DexInstruction::new(DexOpcode::ConstString).with_regs(&[0]).with_ref(DexRef::String(DexString::make("zero"))),
            DexInstruction::new(DexOpcode::ReturnObject).with_regs(&[0]),
        ],
        ..DexCode::default()
    };
    let mut m = DexMethod::new(DexMethodRef::make_from_descriptor(&desc(".describe:(I)Ljava/lang/String;")).unwrap());
    m.make_concrete(DexAccessFlags::PUBLIC | DexAccessFlags::STATIC, Some(code), false).unwrap();
    cls.add_method(m).unwrap();
    cls
}

#[test]
fn classes_survive_a_file_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("classes.dex");
    let options = DexOptions::default();
    {
        let mut cls = counter_class("files/a");
        // Edit through Method-IR: the body must be synced before writing.
        cls.balloon_all(&options).unwrap();
        cls.sync_all().unwrap();
        let written = write_classes_to_dex(&path, &[&cls], &options).unwrap();
        assert_eq!(written as u64, fs::metadata(&path).unwrap().len());
    }

    let mut stats = DexStats::default();
    let mut classes = load_classes_from_dex(&path, &mut stats, &options).unwrap();
    assert_eq!(classes.len(), 1);
    assert_eq!(stats.num_classes, 1);
    assert_eq!(stats.num_methods, 1);
    assert_eq!(stats.num_instructions, 5);

    let cls = &mut classes[0];
    assert_eq!(cls.location(), path.to_string_lossy());
    assert_eq!(cls.source_file(), Some(DexString::make("Counter.java")));
    assert_eq!(cls.get_sfields()[0].static_value(), Some(&EncodedValue::Int(42)));

    cls.balloon_all(&options).unwrap();
    let describe = &cls.get_dmethods()[0];
    let ops: Vec<IROpcode> = describe.get_code().unwrap().list().instructions().map(|(_, i)| i.opcode()).collect();
    assert_eq!(
        ops,
        vec![
            IROpcode::LoadParam,
            IROpcode::IfEqz,
            IROpcode::ConstString,
            IROpcode::MoveResultPseudoObject,
            IROpcode::ReturnObject,
            IROpcode::ConstString,
            IROpcode::MoveResultPseudoObject,
            IROpcode::ReturnObject,
        ]
    );
}

#[test]
fn directories_are_searched_for_dex_files() {
    let dir = tempdir().unwrap();
    let nested = dir.path().join("assets").join("secondary");
    fs::create_dir_all(&nested).unwrap();
    fs::write(dir.path().join("notes.txt"), b"not a dex").unwrap();
    {
        let cls = counter_class("files/b");
        write_classes_to_dex(&nested.join("classes2.dex"), &[&cls], &DexOptions::default()).unwrap();
    }

    let mut stats = DexStats::default();
    let classes = find_dex_files(dir.path(), &mut stats, &DexOptions::default()).unwrap();
    assert_eq!(classes.len(), 1);
    assert_eq!(classes[0].get_type(), DexType::make("Lfiles/b/Counter;"));
    drop(classes);

    fs::write(nested.join("broken.dex"), b"dex\n035\0").unwrap();
    let err = find_dex_files(dir.path(), &mut stats, &DexOptions::default()).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Format(_)));
}
