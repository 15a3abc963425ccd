fn main() -> Result<(), Box<dyn std::error::Error>> {
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    tonic_build::configure()
        .build_server(true)
        .compile(&["proto/lspd.proto", "proto/lnrpc.proto", "proto/routerrpc.proto"], &["proto"])?;
    Ok(())
}
