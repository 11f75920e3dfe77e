//! GLSL generation for every pipeline variant.
//!
//! Each program is assembled from a version header, a block of `#define`s
//! describing the variant and the renderer settings, shared helper
//! functions and the program body. The same source is what the program
//! cache hashes, so any setting that changes the text gives a new cache key.
//!
//! The VRAM texture is stored bottom-up (GL convention) at
//! `1024*scale x 512*scale`; [`COMMON_FUNCTIONS`] converts between that and
//! the top-down VRAM coordinates the console uses.

use std::fmt::Write;

use crate::types::{BatchRenderMode, InterlacedRenderMode, TextureFilter, TextureMode};

/// Everything that influences generated source, besides the variant itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderGen {
    pub glsl_es: bool,
    pub resolution_scale: u32,
    pub multisamples: u32,
    pub per_sample_shading: bool,
    pub true_color: bool,
    pub scaled_dithering: bool,
    pub texture_filter: TextureFilter,
    pub uv_limits: bool,
    pub pgxp_depth: bool,
    pub dual_source_blend: bool,
    pub chroma_smoothing: bool,
    pub ssbo_writes: bool,
}

impl Default for ShaderGen {
    fn default() -> Self {
        Self {
            glsl_es: false,
            resolution_scale: 1,
            multisamples: 1,
            per_sample_shading: false,
            true_color: false,
            scaled_dithering: true,
            texture_filter: TextureFilter::Nearest,
            uv_limits: false,
            pgxp_depth: false,
            dual_source_blend: true,
            chroma_smoothing: false,
            ssbo_writes: false,
        }
    }
}

const COMMON_FUNCTIONS: &str = r#"
uint RGBA8ToRGBA5551(vec4 v)
{
  uvec4 c = uvec4(round(clamp(v, 0.0, 1.0) * 255.0));
  return (c.r >> 3) | ((c.g >> 3) << 5) | ((c.b >> 3) << 10) | ((c.a >> 7) << 15);
}

vec4 RGBA5551ToRGBA8(uint v)
{
  uvec3 c = uvec3(v & 31u, (v >> 5) & 31u, (v >> 10) & 31u);
  c = (c << 3) | (c >> 2);
  return vec4(vec3(c) / 255.0, float(v >> 15));
}

// Top-down scaled VRAM coordinates to a texel of the bottom-up texture
ivec2 ScaledToTexel(uvec2 scaled)
{
  return ivec2(int(scaled.x), int(VRAM_HEIGHT * RESOLUTION_SCALE - 1u - scaled.y));
}

uvec2 FragToScaled(vec4 frag)
{
  uvec2 p = uvec2(frag.xy);
  return uvec2(p.x, VRAM_HEIGHT * RESOLUTION_SCALE - 1u - p.y);
}

uvec2 WrapNative(uvec2 c)
{
  return c & uvec2(VRAM_WIDTH - 1u, VRAM_HEIGHT - 1u);
}
"#;

const VRAM_LOAD_FUNCTIONS: &str = r#"
#if MULTISAMPLING
uniform sampler2DMS samp0;
vec4 LoadVRAMFirst(ivec2 c) { return texelFetch(samp0, c, 0); }
vec4 LoadVRAMResolved(ivec2 c)
{
  vec4 sum = vec4(0.0);
  for (int i = 0; i < MULTISAMPLES; i++)
    sum += texelFetch(samp0, c, i);
  return sum / float(MULTISAMPLES);
}
#else
uniform sampler2D samp0;
vec4 LoadVRAMFirst(ivec2 c) { return texelFetch(samp0, c, 0); }
vec4 LoadVRAMResolved(ivec2 c) { return texelFetch(samp0, c, 0); }
#endif

// Native VRAM word, from the top-left sample of the scaled texel block
uint SampleNative(uint x, uint y)
{
  uvec2 n = WrapNative(uvec2(x, y));
  return RGBA8ToRGBA5551(LoadVRAMFirst(ScaledToTexel(n * RESOLUTION_SCALE)));
}
"#;

const BATCH_VERTEX_BODY: &str = r#"
in vec4 a_pos;
in vec4 a_col0;
in uint a_texcoord;
in uint a_texpage;
in vec4 a_uv_limits;

INTERP out vec3 v_col0;
flat out float v_depth;
#if TEXTURED
INTERP out vec2 v_tex0;
flat out uvec4 v_texpage;
#if UV_LIMITS
flat out vec4 v_uv_limits;
#endif
#endif

void main()
{
  // Shift by half a scaled pixel so that coverage is tested at the
  // top-left corner of each scaled pixel, i.e. at integer native
  // coordinates when unscaled. Sample positions are fixed by the driver
  // when multisampling, so edges stay on pixel boundaries instead and
  // every sample of an axis-aligned primitive agrees with sample 0.
#if MULTISAMPLING
  float offset = 0.0;
#else
  float offset = 0.5 / float(RESOLUTION_SCALE);
#endif
  float pos_x = ((a_pos.x + offset) / 512.0) - 1.0;
  float pos_y = 1.0 - ((a_pos.y + offset) / 256.0);
#if PGXP_DEPTH
  gl_Position = vec4(pos_x * a_pos.w, pos_y * a_pos.w, (a_pos.z * 2.0 - 1.0) * a_pos.w, a_pos.w);
#else
  gl_Position = vec4(pos_x, pos_y, 0.0, 1.0);
#endif
  v_depth = a_pos.z;
  v_col0 = a_col0.rgb;
#if TEXTURED
  v_tex0 = vec2(float(a_texcoord & 0xFFFFu), float(a_texcoord >> 16));
  uint mode = a_texpage & 0xFFFFu;
  uint palette = a_texpage >> 16;
  v_texpage = uvec4((mode & 15u) * 64u, ((mode >> 4) & 1u) * 256u, (palette & 63u) * 16u, (palette >> 6) & 511u);
#if UV_LIMITS
  v_uv_limits = a_uv_limits * 255.0;
#endif
#endif
}
"#;

const BATCH_UBO: &str = r#"
layout(std140) uniform UBOBlock
{
  uvec2 u_texture_window_and;
  uvec2 u_texture_window_or;
  float u_src_alpha_factor;
  float u_dst_alpha_factor;
  uint u_interlaced_displayed_field;
  uint u_set_mask_while_drawing;
  uint u_check_mask_before_draw;
};
"#;

const BATCH_FRAGMENT_BODY: &str = r#"
uniform sampler2D samp0;

INTERP in vec3 v_col0;
flat in float v_depth;
#if TEXTURED
INTERP in vec2 v_tex0;
flat in uvec4 v_texpage;
#if UV_LIMITS
flat in vec4 v_uv_limits;
#endif
#endif

#if DUAL_SOURCE
layout(location = 0, index = 0) out vec4 o_col0;
layout(location = 0, index = 1) out vec4 o_col1;
#else
layout(location = 0) out vec4 o_col0;
#endif

const int DITHER[16] = int[16](-4, 0, -3, 1, 2, -2, 3, -1, -3, 1, -4, 0, 3, -1, 2, -2);

uint SampleVRAM(uint x, uint y)
{
  uvec2 n = WrapNative(uvec2(x, y));
  return RGBA8ToRGBA5551(texelFetch(samp0, ScaledToTexel(n * RESOLUTION_SCALE), 0));
}

#if TEXTURED
uint FetchTexel(uvec2 uv)
{
  uv = ((uv & 255u) & u_texture_window_and) | u_texture_window_or;
#if PALETTE_4_BIT
  uint word = SampleVRAM(v_texpage.x + (uv.x >> 2), v_texpage.y + uv.y);
  uint index = (word >> ((uv.x & 3u) * 4u)) & 15u;
  return SampleVRAM(v_texpage.z + index, v_texpage.w);
#elif PALETTE_8_BIT
  uint word = SampleVRAM(v_texpage.x + (uv.x >> 1), v_texpage.y + uv.y);
  uint index = (word >> ((uv.x & 1u) * 8u)) & 255u;
  return SampleVRAM(v_texpage.z + index, v_texpage.w);
#else
  return SampleVRAM(v_texpage.x + uv.x, v_texpage.y + uv.y);
#endif
}

uvec2 ClampUV(vec2 uv)
{
  vec2 c = floor(uv);
#if UV_LIMITS
  c = clamp(c, v_uv_limits.xy, v_uv_limits.zw);
#endif
  return uvec2(max(c, vec2(0.0)));
}

// False when the texel is fully transparent (0x0000)
bool SampleTexture(out vec4 texcol)
{
#if BILINEAR
  vec2 base = v_tex0 - 0.5;
  vec2 f = fract(base);
  uint t00 = FetchTexel(ClampUV(base));
  uint t10 = FetchTexel(ClampUV(base + vec2(1.0, 0.0)));
  uint t01 = FetchTexel(ClampUV(base + vec2(0.0, 1.0)));
  uint t11 = FetchTexel(ClampUV(base + vec2(1.0, 1.0)));
  vec4 w = vec4((1.0 - f.x) * (1.0 - f.y), f.x * (1.0 - f.y), (1.0 - f.x) * f.y, f.x * f.y);
  w *= vec4(t00 != 0u, t10 != 0u, t01 != 0u, t11 != 0u);
  float total = w.x + w.y + w.z + w.w;
  if (total <= 0.0)
    return false;
  vec3 rgb = RGBA5551ToRGBA8(t00).rgb * w.x + RGBA5551ToRGBA8(t10).rgb * w.y +
             RGBA5551ToRGBA8(t01).rgb * w.z + RGBA5551ToRGBA8(t11).rgb * w.w;
  uint nearest = FetchTexel(ClampUV(v_tex0));
  texcol = vec4(rgb / total, float(nearest >> 15));
  return true;
#else
  uint texel = FetchTexel(ClampUV(v_tex0));
  if (texel == 0u)
    return false;
  texcol = RGBA5551ToRGBA8(texel);
  return true;
#endif
}
#endif

void main()
{
  uvec2 scaled = FragToScaled(gl_FragCoord);
#if INTERLACING
  if (((scaled.y / RESOLUTION_SCALE) & 1u) == u_interlaced_displayed_field)
    discard;
#endif
#if PGXP_DEPTH
  if (u_check_mask_before_draw != 0u && texelFetch(samp0, ScaledToTexel(scaled), 0).a >= 0.5)
    discard;
#endif

  uvec3 vertcol = uvec3(clamp(v_col0, 0.0, 1.0) * 255.0 + 0.5);
  bool semitransparent;
  bool texel_mask;
  uvec3 icolor;
#if TEXTURED
  vec4 texcol;
  if (!SampleTexture(texcol))
    discard;
  semitransparent = texcol.a >= 0.5;
  texel_mask = semitransparent;
  uvec3 tc = uvec3(texcol.rgb * 255.0 + 0.5);
#if RAW_TEXTURE
  icolor = tc;
#else
  icolor = min((tc * vertcol) >> 7, uvec3(255u));
#endif
#else
  semitransparent = true;
  texel_mask = false;
  icolor = vertcol;
#endif

#if DITHERING
  uvec2 dc = scaled;
#if SCALED_DITHERING
  dc /= RESOLUTION_SCALE;
#endif
  int d = DITHER[int(((dc.y & 3u) << 2) | (dc.x & 3u))];
  icolor = uvec3(clamp(ivec3(icolor) + d, 0, 255));
#endif

#if TRUE_COLOR
  vec3 rgb = vec3(icolor) / 255.0;
#else
  uvec3 c5 = icolor >> 3;
  vec3 rgb = vec3((c5 << 3) | (c5 >> 2)) / 255.0;
#endif

  bool mask_out = u_set_mask_while_drawing != 0u || texel_mask;
  float alpha = mask_out ? 1.0 : 0.0;

#if TRANSPARENCY
#if ONLY_OPAQUE
  if (semitransparent)
    discard;
#elif ONLY_TRANSPARENT
  if (!semitransparent)
    discard;
#endif
  o_col0 = vec4(semitransparent ? rgb * u_src_alpha_factor : rgb, alpha);
#if DUAL_SOURCE
  o_col1 = vec4(0.0, 0.0, 0.0, semitransparent ? u_dst_alpha_factor : 0.0);
#endif
#else
  o_col0 = vec4(rgb, alpha);
#if DUAL_SOURCE
  o_col1 = vec4(0.0);
#endif
#endif

#if !PGXP_DEPTH
  gl_FragDepth = mask_out ? v_depth : 0.0;
#endif
}
"#;

const SCREEN_QUAD_VERTEX_BODY: &str = r#"
out vec2 v_tex0;

void main()
{
  v_tex0 = vec2(float((gl_VertexID << 1) & 2), float(gl_VertexID & 2));
  gl_Position = vec4(v_tex0 * vec2(2.0, 2.0) - vec2(1.0, 1.0), 0.0, 1.0);
}
"#;

const DISPLAY_FRAGMENT_BODY: &str = r#"
// x: VRAM start x, y: VRAM start y, z: crop left, w: field
uniform ivec4 u_display_params;
uniform int u_output_height;
out vec4 o_col0;

vec3 RGBToYUV(vec3 rgb)
{
  return vec3(dot(rgb, vec3(0.299, 0.587, 0.114)),
              dot(rgb, vec3(-0.14713, -0.28886, 0.436)),
              dot(rgb, vec3(0.615, -0.51499, -0.10001)));
}

vec3 YUVToRGB(vec3 yuv)
{
  return vec3(yuv.x + 1.13983 * yuv.z,
              yuv.x - 0.39465 * yuv.y - 0.58060 * yuv.z,
              yuv.x + 2.03211 * yuv.y);
}

vec3 Load24(int x, uint vy)
{
  uint relative_x = uint(x + u_display_params.z);
  uint vx = uint(u_display_params.x) + (relative_x * 3u) / 2u;
  uint s0 = SampleNative(vx, vy);
  uint s1 = SampleNative(vx + 1u, vy);
  uint s1s0 = ((s1 << 16) | s0) >> ((relative_x & 1u) * 8u);
  return vec3(float(s1s0 & 0xFFu), float((s1s0 >> 8) & 0xFFu), float((s1s0 >> 16) & 0xFFu)) / 255.0;
}

void main()
{
  ivec2 p = ivec2(gl_FragCoord.xy);
  p.y = u_output_height - 1 - p.y;
#if INTERLACED
  int line = p.y / OUTPUT_SCALE;
  if ((line & 1) != u_display_params.w)
    discard;
#if !INTERLEAVED
  p.y = (line >> 1) * OUTPUT_SCALE + (p.y % OUTPUT_SCALE);
#endif
#endif

#if DEPTH_24BIT
  uint vy = uint(u_display_params.y + p.y);
  vec3 rgb = Load24(p.x, vy);
#if CHROMA_SMOOTHING
  vec3 yuv = RGBToYUV(rgb);
  vec2 uv = (RGBToYUV(Load24(p.x - 1, vy)).yz + yuv.yz + RGBToYUV(Load24(p.x + 1, vy)).yz) / 3.0;
  rgb = clamp(YUVToRGB(vec3(yuv.x, uv)), 0.0, 1.0);
#endif
#else
  uvec2 c = uvec2(uint((u_display_params.x + u_display_params.z) * int(RESOLUTION_SCALE) + p.x),
                  uint(u_display_params.y * int(RESOLUTION_SCALE) + p.y));
  c = c % uvec2(VRAM_WIDTH * RESOLUTION_SCALE, VRAM_HEIGHT * RESOLUTION_SCALE);
  vec3 rgb = LoadVRAMResolved(ScaledToTexel(c)).rgb;
#endif
  o_col0 = vec4(rgb, 1.0);
}
"#;

const FILL_FRAGMENT_BODY: &str = r#"
uniform vec4 u_fill_color;
// x, y, width, height in native pixels
uniform uvec4 u_fill_rect;
uniform uint u_interlaced_displayed_field;
out vec4 o_col0;

void main()
{
  uvec2 native = FragToScaled(gl_FragCoord) / RESOLUTION_SCALE;
#if WRAPPED
  uvec2 rel = WrapNative(native - u_fill_rect.xy);
  if (rel.x >= u_fill_rect.z || rel.y >= u_fill_rect.w)
    discard;
#endif
#if INTERLACED
  if ((native.y & 1u) == u_interlaced_displayed_field)
    discard;
#endif
  o_col0 = u_fill_color;
#if PGXP_DEPTH
  gl_FragDepth = 1.0;
#else
  gl_FragDepth = u_fill_color.a;
#endif
}
"#;

const READ_FRAGMENT_BODY: &str = r#"
// x, y, width, height in native pixels
uniform uvec4 u_read_rect;
out vec4 o_col0;

void main()
{
  // Encoding target rows run top-down, matching glReadPixels order
  uvec2 native = WrapNative(u_read_rect.xy + uvec2(gl_FragCoord.xy));
  o_col0 = LoadVRAMFirst(ScaledToTexel(native * RESOLUTION_SCALE));
}
"#;

const COPY_FRAGMENT_BODY: &str = r#"
uniform sampler2D samp0;
// src x, src y, dst x, dst y in native pixels
uniform uvec4 u_src_dst;
uniform uvec2 u_size;
uniform uint u_set_mask_bit;
uniform float u_depth_value;
out vec4 o_col0;

void main()
{
  uvec2 dst_scaled = FragToScaled(gl_FragCoord);
  uvec2 sub = dst_scaled % RESOLUTION_SCALE;
  uvec2 rel = WrapNative(dst_scaled / RESOLUTION_SCALE - u_src_dst.zw);
  if (rel.x >= u_size.x || rel.y >= u_size.y)
    discard;
  uvec2 src = WrapNative(u_src_dst.xy + rel);
  vec4 c = texelFetch(samp0, ScaledToTexel(src * RESOLUTION_SCALE + sub), 0);
  bool mask = u_set_mask_bit != 0u || c.a >= 0.5;
  o_col0 = vec4(c.rgb, mask ? 1.0 : 0.0);
#if PGXP_DEPTH
  gl_FragDepth = 1.0;
#else
  gl_FragDepth = mask ? u_depth_value : 0.0;
#endif
}
"#;

const UPDATE_DEPTH_FRAGMENT_BODY: &str = r#"
void main()
{
  gl_FragDepth = LoadVRAMFirst(ivec2(gl_FragCoord.xy)).a >= 0.5 ? 1.0 : 0.0;
}
"#;

const WRITE_FRAGMENT_BODY: &str = r#"
layout(std430, binding = 0) readonly buffer SSBO
{
  uint ssbo_data[];
};
// x, y, width, height in native pixels
uniform uvec4 u_base_size;
// In 16-bit words
uniform uint u_buffer_base_offset;
uniform uint u_mask_or_bits;
uniform float u_depth_value;
out vec4 o_col0;

void main()
{
  uvec2 rel = WrapNative(FragToScaled(gl_FragCoord) / RESOLUTION_SCALE - u_base_size.xy);
  if (rel.x >= u_base_size.z || rel.y >= u_base_size.w)
    discard;
  uint index = u_buffer_base_offset + rel.y * u_base_size.z + rel.x;
  uint value = ((ssbo_data[index >> 1] >> ((index & 1u) * 16u)) & 0xFFFFu) | u_mask_or_bits;
  o_col0 = RGBA5551ToRGBA8(value);
#if PGXP_DEPTH
  gl_FragDepth = 1.0;
#else
  gl_FragDepth = (value & 0x8000u) != 0u ? u_depth_value : 0.0;
#endif
}
"#;

const BOX_DOWNSAMPLE_FRAGMENT_BODY: &str = r#"
uniform sampler2D samp0;
out vec4 o_col0;

void main()
{
  ivec2 base = ivec2(gl_FragCoord.xy) * int(RESOLUTION_SCALE);
  vec3 sum = vec3(0.0);
  for (int y = 0; y < int(RESOLUTION_SCALE); y++)
  {
    for (int x = 0; x < int(RESOLUTION_SCALE); x++)
      sum += texelFetch(samp0, base + ivec2(x, y), 0).rgb;
  }
  o_col0 = vec4(sum / float(RESOLUTION_SCALE * RESOLUTION_SCALE), 1.0);
}
"#;

impl ShaderGen {
    fn header(&self, stage_defines: &[(&str, bool)], needs_ssbo: bool) -> String {
        let mut s = String::with_capacity(4096);
        match (self.glsl_es, needs_ssbo) {
            (false, false) => s.push_str("#version 330 core\n"),
            (false, true) => s.push_str("#version 430 core\n"),
            (true, false) => s.push_str("#version 300 es\n"),
            (true, true) => s.push_str("#version 310 es\n"),
        }
        let per_sample = self.per_sample_shading && self.multisamples > 1 && !self.glsl_es;
        if per_sample {
            s.push_str("#extension GL_ARB_gpu_shader5 : require\n");
        }
        if self.glsl_es {
            s.push_str("precision highp float;\nprecision highp int;\n");
            s.push_str("precision highp sampler2D;\n");
            if self.multisamples > 1 {
                s.push_str("precision highp sampler2DMS;\n");
            }
        }
        let _ = writeln!(s, "#define RESOLUTION_SCALE {}u", self.resolution_scale.max(1));
        let _ = writeln!(s, "#define VRAM_WIDTH 1024u");
        let _ = writeln!(s, "#define VRAM_HEIGHT 512u");
        let _ = writeln!(s, "#define MULTISAMPLES {}", self.multisamples.max(1));
        let _ = writeln!(s, "#define INTERP {}", if per_sample { "sample" } else { "" });

        let globals = [
            ("MULTISAMPLING", self.multisamples > 1),
            ("TRUE_COLOR", self.true_color),
            ("SCALED_DITHERING", self.scaled_dithering),
            ("BILINEAR", self.texture_filter == TextureFilter::Bilinear),
            ("UV_LIMITS", self.uv_limits),
            ("PGXP_DEPTH", self.pgxp_depth),
            ("DUAL_SOURCE", self.dual_source_blend && !self.glsl_es),
            ("CHROMA_SMOOTHING", self.chroma_smoothing),
        ];
        for (name, value) in globals.iter().chain(stage_defines.iter()) {
            let _ = writeln!(s, "#define {} {}", name, *value as u32);
        }
        s.push_str(COMMON_FUNCTIONS);
        s
    }

    pub fn batch_vertex_shader(&self, textured: bool) -> String {
        let mut s = self.header(&[("TEXTURED", textured)], false);
        s.push_str(BATCH_VERTEX_BODY);
        s
    }

    pub fn batch_fragment_shader(
        &self,
        render_mode: BatchRenderMode,
        texture_mode: TextureMode,
        dithering: bool,
        interlacing: bool,
    ) -> String {
        let textured = texture_mode.is_textured();
        let defines = [
            ("TEXTURED", textured),
            ("PALETTE_4_BIT", textured && texture_mode.color_mode() == 0),
            ("PALETTE_8_BIT", textured && texture_mode.color_mode() == 1),
            ("RAW_TEXTURE", texture_mode.is_raw()),
            ("DITHERING", dithering),
            ("INTERLACING", interlacing),
            ("TRANSPARENCY", render_mode != BatchRenderMode::TransparencyDisabled),
            ("ONLY_OPAQUE", render_mode == BatchRenderMode::OnlyOpaque),
            ("ONLY_TRANSPARENT", render_mode == BatchRenderMode::OnlyTransparent),
        ];
        let mut s = self.header(&defines, false);
        s.push_str(BATCH_UBO);
        s.push_str(BATCH_FRAGMENT_BODY);
        s
    }

    /// Full-screen triangle for the utility passes
    pub fn screen_quad_vertex_shader(&self) -> String {
        let mut s = self.header(&[], false);
        s.push_str(SCREEN_QUAD_VERTEX_BODY);
        s
    }

    pub fn display_fragment_shader(&self, depth_24bit: bool, interlace: InterlacedRenderMode) -> String {
        let defines = [
            ("DEPTH_24BIT", depth_24bit),
            ("INTERLACED", interlace != InterlacedRenderMode::None),
            ("INTERLEAVED", interlace == InterlacedRenderMode::InterleavedFields),
        ];
        let mut s = self.header(&defines, false);
        let output_scale = if depth_24bit { 1 } else { self.resolution_scale.max(1) };
        let _ = writeln!(s, "#define OUTPUT_SCALE {}", output_scale);
        s.push_str(VRAM_LOAD_FUNCTIONS);
        s.push_str(DISPLAY_FRAGMENT_BODY);
        s
    }

    pub fn fill_fragment_shader(&self, wrapped: bool, interlaced: bool) -> String {
        let mut s = self.header(&[("WRAPPED", wrapped), ("INTERLACED", interlaced)], false);
        s.push_str(FILL_FRAGMENT_BODY);
        s
    }

    pub fn read_fragment_shader(&self) -> String {
        let mut s = self.header(&[], false);
        s.push_str(VRAM_LOAD_FUNCTIONS);
        s.push_str(READ_FRAGMENT_BODY);
        s
    }

    pub fn copy_fragment_shader(&self) -> String {
        let mut s = self.header(&[], false);
        s.push_str(COPY_FRAGMENT_BODY);
        s
    }

    pub fn update_depth_fragment_shader(&self) -> String {
        let mut s = self.header(&[], false);
        s.push_str(VRAM_LOAD_FUNCTIONS);
        s.push_str(UPDATE_DEPTH_FRAGMENT_BODY);
        s
    }

    /// `None` without a storage buffer write path
    pub fn write_fragment_shader(&self) -> Option<String> {
        if !self.ssbo_writes {
            return None;
        }
        let mut s = self.header(&[], true);
        s.push_str(WRITE_FRAGMENT_BODY);
        Some(s)
    }

    pub fn box_downsample_fragment_shader(&self) -> String {
        let mut s = self.header(&[], false);
        s.push_str(BOX_DOWNSAMPLE_FRAGMENT_BODY);
        s
    }
}
