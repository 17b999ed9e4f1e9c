fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Compile the protocol buffer definitions
    tonic_build::compile_protos("proto/warp.proto")?;

    println!("cargo:rerun-if-changed=proto/warp.proto");

    Ok(())
}
