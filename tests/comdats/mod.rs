use object::pe::{
    IMAGE_COMDAT_SELECT_ANY, IMAGE_COMDAT_SELECT_ASSOCIATIVE, IMAGE_COMDAT_SELECT_EXACT_MATCH,
    IMAGE_COMDAT_SELECT_LARGEST, IMAGE_COMDAT_SELECT_NODUPLICATES, IMAGE_COMDAT_SELECT_SAME_SIZE,
    IMAGE_FILE_MACHINE_AMD64, IMAGE_REL_AMD64_ADDR64,
};
use pelink::linker::LinkerTargetArch;

use crate::utils::{
    LinkFixture,
    build::{CoffBuilder, RDATA, TEXT, SectionSpec},
    section_bytes, symbol_va,
};

fn fixture() -> LinkFixture {
    LinkFixture::new(LinkerTargetArch::Amd64)
}

fn comdat_obj(selection: u8, data: Vec<u8>) -> Vec<u8> {
    CoffBuilder::new(IMAGE_FILE_MACHINE_AMD64)
        .section(SectionSpec::new(".rdata", RDATA).data(data).comdat(selection))
        .global("shared_const", 1, 0)
        .build()
}

#[test]
fn identical_comdats_do_not_conflict() {
    let obj = |_| {
        CoffBuilder::new(IMAGE_FILE_MACHINE_AMD64)
            .section(
                SectionSpec::new(".text", TEXT)
                    .data(vec![0u8; 8])
                    .reloc(0, "shared_const", IMAGE_REL_AMD64_ADDR64),
            )
            .section(
                SectionSpec::new(".rdata", RDATA)
                    .data(vec![7, 7, 7, 7])
                    .comdat(IMAGE_COMDAT_SELECT_ANY),
            )
            .global("shared_const", 2, 0)
            .build()
    };

    let image = fixture().object(obj(1)).object(obj(2)).link_ok();

    // One surviving copy.
    let rdata = image
        .sections
        .iter()
        .find(|s| s.name == ".rdata")
        .expect(".rdata missing");
    assert_eq!(rdata.virtual_size, 4);

    // Both references patch to the same final address.
    let va = symbol_va(&image, "shared_const");
    let text = section_bytes(&image, ".text");
    assert_eq!(u64::from_le_bytes(text[..8].try_into().unwrap()), va);
    assert_eq!(u64::from_le_bytes(text[8..16].try_into().unwrap()), va);
}

#[test]
fn any_selection_keeps_smallest() {
    let image = fixture()
        .object(comdat_obj(IMAGE_COMDAT_SELECT_ANY, vec![1; 8]))
        .object(comdat_obj(IMAGE_COMDAT_SELECT_ANY, vec![2; 4]))
        .configure(|builder| builder.dead_strip(false))
        .link_ok();

    assert_eq!(section_bytes(&image, ".rdata"), [2, 2, 2, 2]);
}

#[test]
fn largest_selection_keeps_largest() {
    let image = fixture()
        .object(comdat_obj(IMAGE_COMDAT_SELECT_LARGEST, vec![1; 4]))
        .object(comdat_obj(IMAGE_COMDAT_SELECT_LARGEST, vec![2; 8]))
        .configure(|builder| builder.dead_strip(false))
        .link_ok();

    assert_eq!(section_bytes(&image, ".rdata"), [2; 8]);
}

#[test]
fn mixed_any_and_largest_upgrades() {
    let image = fixture()
        .object(comdat_obj(IMAGE_COMDAT_SELECT_ANY, vec![1; 4]))
        .object(comdat_obj(IMAGE_COMDAT_SELECT_LARGEST, vec![2; 8]))
        .configure(|builder| builder.dead_strip(false))
        .link_ok();

    assert_eq!(section_bytes(&image, ".rdata"), [2; 8]);
}

#[test]
fn noduplicates_conflict_is_reported() {
    let error = fixture()
        .object(comdat_obj(IMAGE_COMDAT_SELECT_NODUPLICATES, vec![1; 4]))
        .object(comdat_obj(IMAGE_COMDAT_SELECT_NODUPLICATES, vec![2; 4]))
        .configure(|builder| builder.dead_strip(false))
        .link_err();

    assert!(
        error.to_string().contains("duplicate symbol: shared_const"),
        "unexpected error: {error}"
    );
}

#[test]
fn same_size_mismatch_is_reported() {
    let error = fixture()
        .object(comdat_obj(IMAGE_COMDAT_SELECT_SAME_SIZE, vec![1; 4]))
        .object(comdat_obj(IMAGE_COMDAT_SELECT_SAME_SIZE, vec![2; 8]))
        .configure(|builder| builder.dead_strip(false))
        .link_err();

    assert!(
        error.to_string().contains("duplicate symbol: shared_const"),
        "unexpected error: {error}"
    );
}

#[test]
fn same_size_match_links() {
    let image = fixture()
        .object(comdat_obj(IMAGE_COMDAT_SELECT_SAME_SIZE, vec![1; 4]))
        .object(comdat_obj(IMAGE_COMDAT_SELECT_SAME_SIZE, vec![2; 4]))
        .configure(|builder| builder.dead_strip(false))
        .link_ok();

    assert_eq!(section_bytes(&image, ".rdata").len(), 4);
}

#[test]
fn exact_match_checksum_mismatch_is_reported() {
    let obj = |fill: u8, checksum: u32| {
        CoffBuilder::new(IMAGE_FILE_MACHINE_AMD64)
            .section(
                SectionSpec::new(".rdata", RDATA)
                    .data(vec![fill; 4])
                    .comdat(IMAGE_COMDAT_SELECT_EXACT_MATCH)
                    .checksum(checksum),
            )
            .global("shared_const", 1, 0)
            .build()
    };

    let error = fixture()
        .object(obj(1, 0x1111))
        .object(obj(2, 0x2222))
        .configure(|builder| builder.dead_strip(false))
        .link_err();

    assert!(
        error.to_string().contains("duplicate symbol: shared_const"),
        "unexpected error: {error}"
    );
}

#[test]
fn associated_sections_follow_their_parent() {
    let obj = CoffBuilder::new(IMAGE_FILE_MACHINE_AMD64)
        .section(SectionSpec::new(".text", TEXT).data(vec![0xc3; 4]))
        .section(
            SectionSpec::new(".text$u", TEXT)
                .data(vec![0xcc; 4])
                .comdat(IMAGE_COMDAT_SELECT_ANY),
        )
        .section(
            SectionSpec::new(".xdata", RDATA)
                .data(vec![9; 4])
                .associative(IMAGE_COMDAT_SELECT_ASSOCIATIVE, 2),
        )
        .global("victim", 2, 0)
        .build();

    let image = fixture().object(obj).link_ok();

    // The unreferenced COMDAT and its associated section are both gone.
    assert!(image.sections.iter().all(|s| s.name != ".xdata"));
    assert!(!image.symbols.contains_key("victim"));

    let text = image
        .sections
        .iter()
        .find(|s| s.name == ".text")
        .expect(".text missing");
    assert_eq!(text.virtual_size, 4);
}
