use std::fs;
use std::path::Path;

// Helper function to validate a WGSL shader file using naga
fn validate_wgsl_shader(shader_path_str: &str) -> naga::Module {
    let shader_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(shader_path_str);
    let shader_source = match fs::read_to_string(&shader_path) {
        Ok(s) => s,
        Err(e) => panic!("Failed to read shader file {shader_path:?}: {e}"),
    };

    let module = match naga::front::wgsl::parse_str(&shader_source) {
        Ok(m) => m,
        Err(e) => {
            panic!(
                "WGSL parsing error in {shader_path:?}:\n{error_report}",
                error_report = e.emit_to_string(&shader_source)
            );
        }
    };

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );

    if let Err(e) = validator.validate(&module) {
        panic!(
            "WGSL validation error in {shader_path:?}:\n{error_report}",
            error_report = e.emit_to_string(&shader_source)
        );
    }
    module
}

#[test]
fn validate_fill_shader_compiles() {
    let module = validate_wgsl_shader("../../shaders/fill.wgsl");
    let fill = module
        .entry_points
        .iter()
        .find(|ep| ep.name == "fill")
        .expect("fill entry point");
    assert_eq!(fill.stage, naga::ShaderStage::Compute);
    assert_eq!(fill.workgroup_size, [64, 1, 1]);
}

#[test]
fn fill_kernel_builds_on_the_mock_device_path() {
    // The mock device resolves kernels by entry point name in the source.
    let source = include_str!("../../../shaders/fill.wgsl");
    let device = minicompute::MockDevice::new().with_kernel("fill", |_| {});
    let mut compute = minicompute::Compute::with_device(device);
    let kernel = compute.create_kernel(source.as_bytes(), "fill").unwrap();
    assert_eq!(kernel.entry_point(), "fill");
    assert_eq!(compute.encoder_state(), minicompute::EncoderState::Idle);
}
