fn main() {
    println!("cargo:rerun-if-changed=./jobworker.proto");
    tonic_build::compile_protos("./jobworker.proto")
        .unwrap_or_else(|err| panic!("Failed to compile protos {:?}", err));
}
