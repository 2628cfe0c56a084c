// ============================================================================
// GPU SHADERS: WGSL kept inline
// ============================================================================

// ============================================================================
// ADJUST SHADER: brightness, contrast, saturation over the preview texture
// ============================================================================
//
// One oversized triangle covers the target; the fragment stage reads the
// source texel at the same integer coordinate, so output pixels map 1:1 to
// preview pixels. Order matches `ops::adjust::Adjustments::apply_pixel`.
pub const ADJUST_SHADER: &str = r#"
struct AdjustUniforms {
    brightness: f32,
    contrast: f32,
    saturation: f32,
    _pad: f32,
};

@group(0) @binding(0) var<uniform> u: AdjustUniforms;
@group(0) @binding(1) var src_tex: texture_2d<f32>;

@vertex
fn vs_main(@builtin(vertex_index) vi: u32) -> @builtin(position) vec4<f32> {
    var positions = array<vec2<f32>, 3>(
        vec2<f32>(-1.0, -1.0),
        vec2<f32>(3.0, -1.0),
        vec2<f32>(-1.0, 3.0),
    );
    return vec4<f32>(positions[vi], 0.0, 1.0);
}

@fragment
fn fs_main(@builtin(position) frag: vec4<f32>) -> @location(0) vec4<f32> {
    let texel = textureLoad(src_tex, vec2<i32>(frag.xy), 0);

    var c = texel.rgb * u.brightness;
    c = (c - vec3<f32>(0.5)) * u.contrast + vec3<f32>(0.5);

    let luma = dot(c, vec3<f32>(0.2126, 0.7152, 0.0722));
    c = mix(vec3<f32>(luma), c, u.saturation);

    return vec4<f32>(clamp(c, vec3<f32>(0.0), vec3<f32>(1.0)), texel.a);
}
"#;
