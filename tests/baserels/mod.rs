use object::pe::{
    IMAGE_FILE_MACHINE_AMD64, IMAGE_FILE_MACHINE_I386, IMAGE_REL_AMD64_ADDR32,
    IMAGE_REL_AMD64_ADDR32NB, IMAGE_REL_AMD64_ADDR64, IMAGE_REL_AMD64_REL32,
    IMAGE_REL_I386_DIR32,
};
use pelink::linker::LinkerTargetArch;

use crate::utils::{
    LinkFixture,
    build::{CoffBuilder, DATA, TEXT, SectionSpec},
    section_bytes, symbol_va,
};

#[test]
fn addr64_fixups_emit_dir64_blocks() {
    let obj = CoffBuilder::new(IMAGE_FILE_MACHINE_AMD64)
        .section(
            SectionSpec::new(".data", DATA)
                .data(vec![0u8; 8])
                .reloc(0, "blob", IMAGE_REL_AMD64_ADDR64),
        )
        .global("blob", 1, 0)
        .build();

    let image = LinkFixture::new(LinkerTargetArch::Amd64)
        .object(obj)
        .link_ok();

    let data = image
        .sections
        .iter()
        .find(|s| s.name == ".data")
        .expect(".data missing");

    let reloc = section_bytes(&image, ".reloc");
    let page_voff = u32::from_le_bytes(reloc[0..4].try_into().unwrap());
    let block_size = u32::from_le_bytes(reloc[4..8].try_into().unwrap());
    let entry = u16::from_le_bytes(reloc[8..10].try_into().unwrap());

    assert_eq!(u64::from(page_voff), data.virtual_address & !0xfff);
    assert_eq!(block_size, 12);
    assert_eq!(
        entry,
        0xa000 | (data.virtual_address & 0xfff) as u16
    );

    // The fixup itself holds the absolute address of the target.
    let patched = u64::from_le_bytes(section_bytes(&image, ".data")[..8].try_into().unwrap());
    assert_eq!(patched, symbol_va(&image, "blob"));
}

#[test]
fn relative_fixups_emit_no_reloc_section() {
    let obj = CoffBuilder::new(IMAGE_FILE_MACHINE_AMD64)
        .section(
            SectionSpec::new(".text", TEXT)
                .data(vec![0u8; 8])
                .reloc(0, "next", IMAGE_REL_AMD64_REL32),
        )
        .global("next", 1, 4)
        .build();

    let image = LinkFixture::new(LinkerTargetArch::Amd64)
        .object(obj)
        .link_ok();

    assert!(image.sections.iter().all(|s| s.name != ".reloc"));
}

#[test]
fn addr32_overflow_is_reported() {
    let obj = CoffBuilder::new(IMAGE_FILE_MACHINE_AMD64)
        .section(
            SectionSpec::new(".data", DATA)
                .data(vec![0u8; 4])
                .reloc(0, "blob", IMAGE_REL_AMD64_ADDR32),
        )
        .global("blob", 1, 0)
        .build();

    // The default image base puts every address above 32 bits.
    let error = LinkFixture::new(LinkerTargetArch::Amd64)
        .object(obj)
        .link_err();

    assert!(
        error.to_string().contains("overflows 32 bits"),
        "unexpected error: {error}"
    );
}

#[test]
fn image_relative_fixup_against_absolute_symbol_is_reported() {
    let obj = CoffBuilder::new(IMAGE_FILE_MACHINE_AMD64)
        .section(
            SectionSpec::new(".data", DATA)
                .data(vec![0u8; 4])
                .reloc(0, "absval", IMAGE_REL_AMD64_ADDR32NB),
        )
        .absolute("absval", 0x10)
        .build();

    // An absolute value below the image base has no image relative form.
    let error = LinkFixture::new(LinkerTargetArch::Amd64)
        .object(obj)
        .link_err();

    assert!(
        error.to_string().contains("overflows 32 bits"),
        "unexpected error: {error}"
    );
}

#[test]
fn dir32_fixups_emit_highlow_blocks() {
    let obj = CoffBuilder::new(IMAGE_FILE_MACHINE_I386)
        .section(
            SectionSpec::new(".data", DATA)
                .data(vec![0u8; 4])
                .reloc(0, "_blob", IMAGE_REL_I386_DIR32),
        )
        .global("_blob", 1, 0)
        .build();

    let image = LinkFixture::new(LinkerTargetArch::I386)
        .configure(|builder| builder.image_base(0x400000))
        .object(obj)
        .link_ok();

    let reloc = section_bytes(&image, ".reloc");
    let entry = u16::from_le_bytes(reloc[8..10].try_into().unwrap());
    assert_eq!(entry >> 12, 3);

    let patched = u32::from_le_bytes(section_bytes(&image, ".data")[..4].try_into().unwrap());
    assert_eq!(u64::from(patched), symbol_va(&image, "_blob"));
}
