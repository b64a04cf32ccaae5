use object::pe::{
    IMAGE_FILE_MACHINE_AMD64, IMAGE_FILE_MACHINE_I386, IMAGE_REL_AMD64_REL32,
    IMAGE_WEAK_EXTERN_SEARCH_LIBRARY, IMAGE_WEAK_EXTERN_SEARCH_NOLIBRARY,
};
use pelink::linker::LinkerTargetArch;

use crate::utils::{
    LinkFixture,
    build::{ArchiveBuilder, CoffBuilder, DATA, TEXT, SectionSpec},
    section_bytes, symbol_va,
};

fn fixture() -> LinkFixture {
    LinkFixture::new(LinkerTargetArch::Amd64)
}

#[test]
fn undefined_symbol_pulls_library_member() {
    let main_obj = CoffBuilder::new(IMAGE_FILE_MACHINE_AMD64)
        .section(
            SectionSpec::new(".text", TEXT)
                .data(vec![0u8; 8])
                .reloc(0, "helper", IMAGE_REL_AMD64_REL32),
        )
        .undefined("helper")
        .build();

    let helper_obj = CoffBuilder::new(IMAGE_FILE_MACHINE_AMD64)
        .section(SectionSpec::new(".text", TEXT).data(vec![0xc3; 4]))
        .global("helper", 1, 0)
        .build();

    let library = ArchiveBuilder::new()
        .member("helper.obj", helper_obj, ["helper"])
        .build();

    let image = fixture()
        .object(main_obj)
        .library("helpers", library)
        .link_ok();

    let text = image
        .sections
        .iter()
        .find(|s| s.name == ".text")
        .expect(".text missing");

    // The member's code lands after the referencing object's bytes.
    assert_eq!(
        symbol_va(&image, "helper"),
        0x140000000 + text.virtual_address + 8
    );

    // REL32 displacement from the end of the 4 byte fixup.
    let patched = u32::from_le_bytes(section_bytes(&image, ".text")[..4].try_into().unwrap());
    assert_eq!(patched, 4);
}

#[test]
fn weak_external_searches_library() {
    let main_obj = CoffBuilder::new(IMAGE_FILE_MACHINE_AMD64)
        .section(
            SectionSpec::new(".text", TEXT)
                .data(vec![0u8; 8])
                .reloc(0, "api", IMAGE_REL_AMD64_REL32),
        )
        .weak("api", "api_stub", IMAGE_WEAK_EXTERN_SEARCH_LIBRARY)
        .build();

    let api_obj = CoffBuilder::new(IMAGE_FILE_MACHINE_AMD64)
        .section(SectionSpec::new(".text", TEXT).data(vec![0xc3; 4]))
        .global("api", 1, 0)
        .build();

    let library = ArchiveBuilder::new()
        .member("api.obj", api_obj, ["api"])
        .build();

    let image = fixture().object(main_obj).library("api", library).link_ok();

    let text = image
        .sections
        .iter()
        .find(|s| s.name == ".text")
        .expect(".text missing");

    assert_eq!(
        symbol_va(&image, "api"),
        0x140000000 + text.virtual_address + 8
    );
}

#[test]
fn weak_external_falls_back_to_default() {
    let main_obj = CoffBuilder::new(IMAGE_FILE_MACHINE_AMD64)
        .section(
            SectionSpec::new(".text", TEXT)
                .data(vec![0u8; 16])
                .reloc(0, "api", IMAGE_REL_AMD64_REL32),
        )
        .global("api_stub", 1, 8)
        .weak("api", "api_stub", IMAGE_WEAK_EXTERN_SEARCH_NOLIBRARY)
        .build();

    let image = fixture().object(main_obj).link_ok();

    assert_eq!(symbol_va(&image, "api"), symbol_va(&image, "api_stub"));
}

#[test]
fn alternate_name_resolves_through_library() {
    let main_obj = CoffBuilder::new(IMAGE_FILE_MACHINE_AMD64)
        .section(
            SectionSpec::new(".text", TEXT)
                .data(vec![0u8; 8])
                .reloc(0, "old_api", IMAGE_REL_AMD64_REL32),
        )
        .undefined("old_api")
        .build();

    let new_obj = CoffBuilder::new(IMAGE_FILE_MACHINE_AMD64)
        .section(SectionSpec::new(".text", TEXT).data(vec![0xc3; 4]))
        .global("new_api", 1, 0)
        .build();

    let library = ArchiveBuilder::new()
        .member("new.obj", new_obj, ["new_api"])
        .build();

    let image = fixture()
        .object(main_obj)
        .library("compat", library)
        .configure(|builder| builder.alternate_name("old_api", "new_api"))
        .link_ok();

    assert_eq!(symbol_va(&image, "old_api"), symbol_va(&image, "new_api"));
}

#[test]
fn duplicate_symbols_are_reported() {
    let obj = |fill: u8| {
        CoffBuilder::new(IMAGE_FILE_MACHINE_AMD64)
            .section(SectionSpec::new(".data", DATA).data(vec![fill; 4]))
            .global("twice", 1, 0)
            .build()
    };

    let error = fixture().object(obj(1)).object(obj(2)).link_err();
    assert!(
        error.to_string().contains("duplicate symbol: twice"),
        "unexpected error: {error}"
    );
}

#[test]
fn unresolved_symbols_list_references() {
    let main_obj = CoffBuilder::new(IMAGE_FILE_MACHINE_AMD64)
        .section(
            SectionSpec::new(".text", TEXT)
                .data(vec![0u8; 8])
                .reloc(0, "missing", IMAGE_REL_AMD64_REL32),
        )
        .undefined("missing")
        .build();

    let error = fixture().object(main_obj).link_err();
    let message = error.to_string();
    assert!(
        message.contains("undefined symbol: missing"),
        "unexpected error: {message}"
    );
    assert!(
        message.contains(">>> referenced by"),
        "missing reference list: {message}"
    );
}

#[test]
fn regular_definition_beats_common() {
    let defining = CoffBuilder::new(IMAGE_FILE_MACHINE_AMD64)
        .section(SectionSpec::new(".data", DATA).data(vec![1, 2, 3, 4]))
        .global("shared", 1, 0)
        .build();

    let tentative = CoffBuilder::new(IMAGE_FILE_MACHINE_AMD64)
        .section(SectionSpec::new(".text", TEXT).data(vec![0xc3; 4]))
        .common("shared", 32)
        .build();

    let image = fixture().object(defining).object(tentative).link_ok();

    let data = image
        .sections
        .iter()
        .find(|s| s.name == ".data")
        .expect(".data missing");

    assert_eq!(
        symbol_va(&image, "shared"),
        0x140000000 + data.virtual_address
    );
    assert!(image.sections.iter().all(|s| s.name != ".bss"));
}

#[test]
fn common_definitions_keep_largest_size() {
    let small = CoffBuilder::new(IMAGE_FILE_MACHINE_AMD64)
        .section(SectionSpec::new(".text", TEXT).data(vec![0xc3; 4]))
        .common("buffer", 4)
        .build();

    let large = CoffBuilder::new(IMAGE_FILE_MACHINE_AMD64)
        .section(SectionSpec::new(".text", TEXT).data(vec![0xc3; 4]))
        .common("buffer", 8)
        .build();

    let image = fixture().object(small).object(large).link_ok();

    let bss = image
        .sections
        .iter()
        .find(|s| s.name == ".bss")
        .expect(".bss missing");
    assert_eq!(bss.virtual_size, 8);
    assert_eq!(bss.file_size, 0);
}

#[test]
fn incompatible_machine_is_reported() {
    let amd64 = CoffBuilder::new(IMAGE_FILE_MACHINE_AMD64)
        .section(SectionSpec::new(".text", TEXT).data(vec![0xc3; 4]))
        .build();

    let i386 = CoffBuilder::new(IMAGE_FILE_MACHINE_I386)
        .section(SectionSpec::new(".text", TEXT).data(vec![0xc3; 4]))
        .build();

    let error = fixture().object(amd64).object(i386).link_err();
    assert!(
        error.to_string().contains("incompatible"),
        "unexpected error: {error}"
    );
}

#[test]
fn image_base_symbol_resolves_to_base() {
    let main_obj = CoffBuilder::new(IMAGE_FILE_MACHINE_AMD64)
        .section(SectionSpec::new(".text", TEXT).data(vec![0xc3; 4]))
        .undefined("__ImageBase")
        .build();

    let image = fixture().object(main_obj).link_ok();
    assert_eq!(symbol_va(&image, "__ImageBase"), 0x140000000);
}

#[test]
fn entry_point_must_resolve() {
    let main_obj = CoffBuilder::new(IMAGE_FILE_MACHINE_AMD64)
        .section(SectionSpec::new(".text", TEXT).data(vec![0xc3; 4]))
        .build();

    let error = fixture()
        .object(main_obj)
        .configure(|builder| builder.entrypoint("start"))
        .link_err();
    assert!(
        error.to_string().contains("entry point symbol start"),
        "unexpected error: {error}"
    );
}
