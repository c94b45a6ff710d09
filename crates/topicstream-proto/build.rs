// Build script to compile the protobuf definitions into Rust code.
//
// protoc comes from protoc-bin-vendored so no system install is needed.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);

    tonic_build::configure()
        .build_server(false)
        .bytes(["."])
        .compile_protos(
            &["proto/topicstream.proto"],
            &[
                std::path::PathBuf::from("proto"),
                protoc_bin_vendored::include_path()?,
            ],
        )?;

    println!("cargo:rerun-if-changed=proto/topicstream.proto");
    Ok(())
}
