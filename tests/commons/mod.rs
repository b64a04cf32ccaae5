use object::pe::IMAGE_FILE_MACHINE_AMD64;
use pelink::linker::LinkerTargetArch;

use crate::utils::{
    LinkFixture,
    build::{CoffBuilder, TEXT, SectionSpec},
    symbol_va,
};

#[test]
fn commons_pack_largest_first() {
    let obj = CoffBuilder::new(IMAGE_FILE_MACHINE_AMD64)
        .section(SectionSpec::new(".text", TEXT).data(vec![0xc3; 4]))
        .common("a", 8)
        .common("b", 4)
        .common("c", 16)
        .common("d", 4)
        .build();

    let image = LinkFixture::new(LinkerTargetArch::Amd64)
        .object(obj)
        .link_ok();

    let bss = image
        .sections
        .iter()
        .find(|s| s.name == ".bss")
        .expect(".bss missing");
    assert_eq!(bss.virtual_size, 32);
    assert_eq!(bss.file_size, 0);

    let base = 0x1_4000_0000 + bss.virtual_address;
    assert_eq!(symbol_va(&image, "c"), base);
    assert_eq!(symbol_va(&image, "a"), base + 16);
    assert_eq!(symbol_va(&image, "b"), base + 24);
    assert_eq!(symbol_va(&image, "d"), base + 28);
}
