fn main() {
    // Generate the tf.train.Example protobuf files
    protobuf_codegen::Codegen::new()
        .pure()
        .includes(["src/protos"])
        .input("src/protos/feature.proto")
        .input("src/protos/example.proto")
        .cargo_out_dir("tf-protos")
        .run_from_script();
}
