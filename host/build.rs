use aya_build::cargo_metadata::{MetadataCommand, Package};

const EBPF_PACKAGE: &str = "pingwall-ebpf";

fn main() {
    // main.rs only embeds the XDP object on Linux.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("linux") {
        return;
    }

    let ebpf = MetadataCommand::new()
        .manifest_path("../ebpf/Cargo.toml")
        .no_deps()
        .exec()
        .expect("failed to read cargo metadata of the eBPF crate")
        .packages
        .into_iter()
        .find(|pkg: &Package| pkg.name == EBPF_PACKAGE)
        .unwrap_or_else(|| panic!("package `{EBPF_PACKAGE}` not found in ../ebpf"));

    aya_build::build_ebpf([ebpf]).expect("failed to build the XDP object");

    for dir in ["../ebpf/src", "../common/src"] {
        println!("cargo:rerun-if-changed={dir}");
    }
}
