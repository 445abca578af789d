mod common;

use optrie::{
    CatalogBuilder, CompileError, EncodingDecl, InstructionDecl, TagClass, TagRegistry,
    MAX_TAGS_PER_CLASS,
};

#[test]
fn thirty_tags_fit_and_the_next_overflows() {
    let mut reg = TagRegistry::new(TagClass::Instruction);
    for i in 0..MAX_TAGS_PER_CLASS {
        let bit = reg.register(&format!("itag_{i}")).unwrap();
        assert_eq!(bit.mask(), 1 << i);
    }
    assert_eq!(reg.len(), 30);

    // Re-registering a known name never overflows.
    assert_eq!(reg.register("itag_29").unwrap().position(), 29);

    match reg.register("itag_30") {
        Err(CompileError::TagOverflow { class, name }) => {
            assert_eq!(class, TagClass::Instruction);
            assert_eq!(name, "itag_30");
        }
        other => panic!("expected overflow, got {other:?}"),
    }
    assert_eq!(reg.len(), 30);
}

#[test]
fn encoding_tag_overflow_surfaces_from_catalog() {
    let mut builder = CatalogBuilder::new();
    let mut enc = EncodingDecl::new("90");
    for i in 0..=MAX_TAGS_PER_CLASS {
        enc = enc.tag(&format!("etag_{i}"));
    }
    let err = builder
        .add_instruction(InstructionDecl::new("nop").encoding(enc))
        .unwrap_err();
    assert!(matches!(
        err,
        CompileError::TagOverflow {
            class: TagClass::Encoding,
            ..
        }
    ));
}

#[test]
fn mode_registry_is_capped_too() {
    let mut builder = CatalogBuilder::new();
    for i in 0..MAX_TAGS_PER_CLASS {
        builder.declare_mode(&format!("m{i}")).unwrap();
    }
    assert!(matches!(
        builder.declare_mode("one_too_many"),
        Err(CompileError::TagOverflow {
            class: TagClass::Mode,
            ..
        })
    ));
}

#[test]
fn tags_shared_between_instructions_keep_their_bit() {
    let mut builder = CatalogBuilder::new();
    builder
        .add_instruction(InstructionDecl::new("a").tag("itag_x").tag("itag_y"))
        .unwrap();
    builder
        .add_instruction(InstructionDecl::new("b").tag("itag_y").tag("itag_z"))
        .unwrap();
    let catalog = builder.build();

    let tags = &catalog.registries().insn_tags;
    let names: Vec<&str> = tags.iter().map(|(name, _)| name).collect();
    assert_eq!(names, ["itag_x", "itag_y", "itag_z"]);
    assert_eq!(catalog.instructions()[1].tags.bits(), 0b110);
    let b: Vec<&str> = tags.names_in(catalog.instructions()[1].tags).collect();
    assert_eq!(b, ["itag_y", "itag_z"]);
}
