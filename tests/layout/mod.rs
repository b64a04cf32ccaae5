use object::pe::{
    IMAGE_COMDAT_SELECT_ANY, IMAGE_FILE_MACHINE_AMD64, IMAGE_REL_AMD64_ADDR64,
    IMAGE_SCN_CNT_UNINITIALIZED_DATA,
};
use pelink::linker::{LinkedImage, LinkerTargetArch};

use crate::utils::{
    LinkFixture,
    build::{CoffBuilder, DATA, RDATA, TEXT, SectionSpec},
    section_bytes, symbol_va,
};

fn fixture() -> LinkFixture {
    LinkFixture::new(LinkerTargetArch::Amd64)
}

fn mixed_input() -> Vec<u8> {
    CoffBuilder::new(IMAGE_FILE_MACHINE_AMD64)
        .section(SectionSpec::new(".text", TEXT).data(vec![0xc3; 16]))
        .section(SectionSpec::new(".data", DATA).data(vec![1; 24]))
        .section(SectionSpec::new(".rdata", RDATA).data(vec![2; 8]))
        .global("start", 1, 0)
        .build()
}

#[test]
fn identical_inputs_produce_identical_images() {
    let link = || -> LinkedImage { fixture().object(mixed_input()).link_ok() };

    let first = link();
    let second = link();
    assert_eq!(first.image, second.image);
    assert_eq!(first.symbols, second.symbols);
}

#[test]
fn folded_multi_object_links_are_deterministic() {
    // Two units sharing a COMDAT group, with live relocations so the
    // parallel sweep, fold and base relocation passes all run.
    let unit = |fill: u8, name: &str| {
        CoffBuilder::new(IMAGE_FILE_MACHINE_AMD64)
            .section(
                SectionSpec::new(".text", TEXT)
                    .data(vec![fill; 8])
                    .reloc(0, "shared_const", IMAGE_REL_AMD64_ADDR64),
            )
            .section(
                SectionSpec::new(".rdata", RDATA)
                    .data(vec![7; 4])
                    .comdat(IMAGE_COMDAT_SELECT_ANY),
            )
            .global("shared_const", 2, 0)
            .global(name, 1, 0)
            .build()
    };

    let link = || -> LinkedImage {
        fixture()
            .object(unit(0x90, "alpha"))
            .object(unit(0xc3, "beta"))
            .link_ok()
    };

    let first = link();
    let second = link();
    assert_eq!(first.image, second.image);
    assert_eq!(first.symbols, second.symbols);
}

#[test]
fn grouped_sections_order_by_suffix() {
    let obj = CoffBuilder::new(IMAGE_FILE_MACHINE_AMD64)
        .section(SectionSpec::new(".text$b", TEXT).data(vec![0xbb; 4]))
        .section(SectionSpec::new(".text", TEXT).data(vec![0xaa; 4]))
        .section(SectionSpec::new(".text$a", TEXT).data(vec![0xcc; 4]))
        .global("start", 2, 0)
        .build();

    let image = fixture().object(obj).link_ok();

    let text = section_bytes(&image, ".text");
    assert_eq!(&text[..4], [0xaa; 4]);
    assert_eq!(&text[4..8], [0xcc; 4]);
    assert_eq!(&text[8..12], [0xbb; 4]);
}

#[test]
fn sections_respect_alignment() {
    let image = fixture().object(mixed_input()).link_ok();

    let mut sections = image.sections.clone();
    sections.sort_by_key(|s| s.virtual_address);

    assert_eq!(sections[0].virtual_address, 0x1000);
    for section in &sections {
        assert_eq!(section.virtual_address % 0x1000, 0);
        if section.characteristics & IMAGE_SCN_CNT_UNINITIALIZED_DATA == 0 {
            assert_eq!(section.file_offset % 0x200, 0);
        }
    }
}

#[test]
fn merged_sections_share_an_output_section() {
    let obj = CoffBuilder::new(IMAGE_FILE_MACHINE_AMD64)
        .section(SectionSpec::new(".rdata", RDATA).data(vec![1; 4]))
        .section(SectionSpec::new(".xdata", RDATA).data(vec![2; 4]))
        .global("start", 1, 0)
        .build();

    let image = fixture()
        .object(obj)
        .configure(|builder| builder.merge_section(".xdata", ".rdata"))
        .link_ok();

    assert!(image.sections.iter().all(|s| s.name != ".xdata"));
    assert_eq!(section_bytes(&image, ".rdata"), [1, 1, 1, 1, 2, 2, 2, 2]);
}

#[test]
fn custom_image_base_shifts_addresses() {
    let image = fixture()
        .object(mixed_input())
        .configure(|builder| builder.image_base(0x1_8000_0000))
        .link_ok();

    let text = image
        .sections
        .iter()
        .find(|s| s.name == ".text")
        .expect(".text missing");
    assert_eq!(symbol_va(&image, "start"), 0x1_8000_0000 + text.virtual_address);
}
