use object::pe::{
    IMAGE_COMDAT_SELECT_ANY, IMAGE_FILE_MACHINE_AMD64, IMAGE_REL_AMD64_REL32,
};
use pelink::linker::LinkerTargetArch;

use crate::utils::{
    LinkFixture,
    build::{CoffBuilder, RDATA, TEXT, SectionSpec},
};

fn fixture() -> LinkFixture {
    LinkFixture::new(LinkerTargetArch::Amd64)
}

fn object_with_unused_comdat() -> Vec<u8> {
    CoffBuilder::new(IMAGE_FILE_MACHINE_AMD64)
        .section(SectionSpec::new(".text", TEXT).data(vec![0xc3; 4]))
        .section(
            SectionSpec::new(".unused", RDATA)
                .data(vec![5; 4])
                .comdat(IMAGE_COMDAT_SELECT_ANY),
        )
        .global("never_called", 2, 0)
        .build()
}

#[test]
fn unreferenced_comdat_is_stripped() {
    let image = fixture().object(object_with_unused_comdat()).link_ok();

    assert!(image.sections.iter().all(|s| s.name != ".unused"));
    assert!(!image.symbols.contains_key("never_called"));
}

#[test]
fn disabling_dead_strip_keeps_comdats() {
    let image = fixture()
        .object(object_with_unused_comdat())
        .configure(|builder| builder.dead_strip(false))
        .link_ok();

    let unused = image
        .sections
        .iter()
        .find(|s| s.name == ".unused")
        .expect(".unused missing");
    assert_eq!(unused.virtual_size, 4);
    assert!(image.symbols.contains_key("never_called"));
}

#[test]
fn referenced_comdat_survives_the_sweep() {
    let obj = CoffBuilder::new(IMAGE_FILE_MACHINE_AMD64)
        .section(
            SectionSpec::new(".text", TEXT)
                .data(vec![0u8; 8])
                .reloc(0, "helper", IMAGE_REL_AMD64_REL32),
        )
        .section(
            SectionSpec::new(".text$h", TEXT)
                .data(vec![0xc3; 4])
                .comdat(IMAGE_COMDAT_SELECT_ANY),
        )
        .global("helper", 2, 0)
        .build();

    let image = fixture().object(obj).link_ok();

    let text = image
        .sections
        .iter()
        .find(|s| s.name == ".text")
        .expect(".text missing");
    assert_eq!(text.virtual_size, 12);
    assert!(image.symbols.contains_key("helper"));
}
