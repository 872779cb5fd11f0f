use std::env;
use std::fs;
use std::path::{Path, PathBuf};

fn main() {
    // Ensure a working `protoc` is available across all CI runners by using a vendored binary.
    if let Ok(path) = protoc_bin_vendored::protoc_bin_path() {
        std::env::set_var("PROTOC", &path);
        eprintln!("build.rs: Using vendored protoc at {}", path.display());
    }

    println!("cargo:rerun-if-env-changed=MESHTASTIC_PROTO_DIR");
    println!("cargo:rerun-if-changed=protos");

    // The proto root holds a `meshtastic/` package directory; imports are written
    // as `meshtastic/<file>.proto`, so only the root goes on the include path.
    let proto_root = PathBuf::from(env::var("MESHTASTIC_PROTO_DIR").unwrap_or_else(|_| "protos".into()));

    fn collect_protos(dir: &Path, acc: &mut Vec<PathBuf>) {
        if let Ok(entries) = fs::read_dir(dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    collect_protos(&path, acc);
                } else if path.extension().and_then(|e| e.to_str()) == Some("proto") {
                    acc.push(path);
                }
            }
        }
    }

    let mut protos = Vec::new();
    collect_protos(&proto_root, &mut protos);
    if protos.is_empty() {
        panic!(
            "No Meshtastic .proto files found under '{}'. Set MESHTASTIC_PROTO_DIR to a directory containing meshtastic/*.proto",
            proto_root.display()
        );
    }

    // Each file must be passed once or protoc reports redefinitions.
    protos.sort();
    protos.dedup();
    eprintln!("build.rs: Compiling {} proto files", protos.len());

    let mut config = prost_build::Config::new();
    config.bytes(["."]);
    config
        .compile_protos(&protos, &[proto_root.as_path()])
        .expect("Failed to compile protos");
}
