//! Build script: compiles the peer protocol used between zone servers.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let protoc = protoc_bin_vendored::protoc_bin_path().map_err(|e| e.to_string())?;
    std::env::set_var("PROTOC", protoc);

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/zonelog.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/zonelog.proto");
    Ok(())
}
