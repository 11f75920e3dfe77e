use std::fs;
use std::path::{Path, PathBuf};

use emu_core::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};

use crate::backend::Capabilities;
use crate::types::{DownsampleMode, TextureFilter};
use crate::GpuError;

/// Upper bound for the resolution scale on any backend
pub const MAX_RESOLUTION_SCALE: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RendererKind {
    #[default]
    Software,
    OpenGL,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuSettings {
    pub renderer: RendererKind,
    pub resolution_scale: u32,
    pub multisamples: u32,
    pub per_sample_shading: bool,
    /// Keep 8 bits per channel instead of truncating to 5 (disables dithering)
    pub true_color: bool,
    /// Dither at native pixel size rather than per scaled pixel
    pub scaled_dithering: bool,
    pub texture_filter: TextureFilter,
    pub downsample_mode: DownsampleMode,
    /// Render interlaced frames progressively
    pub disable_interlacing: bool,
    pub chroma_smoothing_24bit: bool,
    /// Per-pixel depth ordering with precise vertices
    pub pgxp_depth_buffer: bool,
    pub threaded_presentation: bool,
    pub shader_cache_path: Option<PathBuf>,
}

impl Default for GpuSettings {
    fn default() -> Self {
        Self {
            renderer: RendererKind::Software,
            resolution_scale: 1,
            multisamples: 1,
            per_sample_shading: false,
            true_color: false,
            scaled_dithering: true,
            texture_filter: TextureFilter::Nearest,
            downsample_mode: DownsampleMode::Disabled,
            disable_interlacing: true,
            chroma_smoothing_24bit: false,
            pgxp_depth_buffer: false,
            threaded_presentation: true,
            shader_cache_path: None,
        }
    }
}

impl GpuSettings {
    /// Load from a JSON file, falling back to defaults on error
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(settings) => settings,
                Err(e) => {
                    log(LogCategory::Rasterizer, LogLevel::Warn, || {
                        format!("failed to parse {}: {}, using defaults", path.display(), e)
                    });
                    Self::default()
                }
            },
            // Missing file
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), GpuError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Clamp to what the backend supports. Returns the adjusted settings and
    /// a description of every change.
    pub fn sanitized(&self, caps: &Capabilities) -> (Self, Vec<String>) {
        let mut s = self.clone();
        let mut notes = Vec::new();

        let max_scale = caps.max_resolution_scale.clamp(1, MAX_RESOLUTION_SCALE);
        let scale = s.resolution_scale.clamp(1, max_scale);
        if scale != s.resolution_scale {
            notes.push(format!("resolution scale {} not supported, using {}", s.resolution_scale, scale));
            s.resolution_scale = scale;
        }

        let mut samples = s.multisamples.max(1);
        if !samples.is_power_of_two() {
            samples = samples.next_power_of_two() / 2;
        }
        samples = samples.min(caps.max_multisamples.max(1));
        if samples != s.multisamples {
            notes.push(format!("{}x multisampling not supported, using {}x", s.multisamples, samples));
            s.multisamples = samples;
        }

        if s.per_sample_shading && (!caps.per_sample_shading || s.multisamples == 1) {
            notes.push("per-sample shading not available".to_string());
            s.per_sample_shading = false;
        }

        (s, notes)
    }

    /// Texture coordinates need clamping whenever they aren't exact integers
    pub fn uses_uv_limits(&self) -> bool {
        self.texture_filter != TextureFilter::Nearest || self.pgxp_depth_buffer
    }

    pub fn uses_downsampling(&self) -> bool {
        self.downsample_mode != DownsampleMode::Disabled && self.resolution_scale > 1
    }
}

/// What has to be rebuilt when switching between two settings snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SettingsChange {
    pub renderer_changed: bool,
    pub framebuffer_changed: bool,
    pub shaders_changed: bool,
}

impl SettingsChange {
    pub fn between(old: &GpuSettings, new: &GpuSettings) -> Self {
        let framebuffer_changed = old.resolution_scale != new.resolution_scale
            || old.multisamples != new.multisamples
            || old.pgxp_depth_buffer != new.pgxp_depth_buffer
            || old.uses_downsampling() != new.uses_downsampling();
        let shaders_changed = framebuffer_changed
            || old.per_sample_shading != new.per_sample_shading
            || old.true_color != new.true_color
            || old.scaled_dithering != new.scaled_dithering
            || old.texture_filter != new.texture_filter
            || old.downsample_mode != new.downsample_mode
            || old.chroma_smoothing_24bit != new.chroma_smoothing_24bit;
        Self {
            renderer_changed: old.renderer != new.renderer,
            framebuffer_changed,
            shaders_changed,
        }
    }

    pub fn any(&self) -> bool {
        self.renderer_changed || self.framebuffer_changed || self.shaders_changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::VramWritePath;

    fn caps() -> Capabilities {
        Capabilities {
            max_resolution_scale: 8,
            max_multisamples: 4,
            dual_source_blend: true,
            per_sample_shading: false,
            vram_write_path: VramWritePath::StorageBuffer,
            glsl_es: false,
        }
    }

    #[test]
    fn test_default_settings() {
        let s = GpuSettings::default();
        assert_eq!(s.resolution_scale, 1);
        assert_eq!(s.multisamples, 1);
        assert!(s.scaled_dithering);
        assert!(!s.uses_uv_limits());
        assert!(!s.uses_downsampling());
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let s: GpuSettings = serde_json::from_str(r#"{"resolution_scale": 3}"#).expect("parse");
        assert_eq!(s.resolution_scale, 3);
        assert!(s.threaded_presentation);
        assert_eq!(s.texture_filter, TextureFilter::Nearest);
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gpu.json");
        let settings = GpuSettings {
            resolution_scale: 4,
            texture_filter: TextureFilter::Bilinear,
            shader_cache_path: Some(dir.path().join("cache")),
            ..Default::default()
        };
        settings.save(&path).expect("save");
        assert_eq!(GpuSettings::load(&path), settings);
        assert_eq!(GpuSettings::load(&dir.path().join("missing.json")), GpuSettings::default());

        fs::write(&path, "not json").expect("write");
        assert_eq!(GpuSettings::load(&path), GpuSettings::default());
    }

    #[test]
    fn test_sanitize_clamps_to_capabilities() {
        let requested = GpuSettings {
            resolution_scale: 12,
            multisamples: 6,
            per_sample_shading: true,
            ..Default::default()
        };
        let (s, notes) = requested.sanitized(&caps());
        assert_eq!(s.resolution_scale, 8);
        assert_eq!(s.multisamples, 4);
        assert!(!s.per_sample_shading);
        assert_eq!(notes.len(), 3);

        let (s, notes) = GpuSettings { resolution_scale: 0, ..Default::default() }.sanitized(&caps());
        assert_eq!(s.resolution_scale, 1);
        assert_eq!(notes.len(), 1);

        let (_, notes) = GpuSettings::default().sanitized(&caps());
        assert!(notes.is_empty());
    }

    #[test]
    fn test_settings_change() {
        let a = GpuSettings::default();
        let b = GpuSettings { resolution_scale: 2, ..Default::default() };
        let change = SettingsChange::between(&a, &b);
        assert!(change.framebuffer_changed);
        assert!(change.shaders_changed);

        let c = GpuSettings { true_color: true, ..Default::default() };
        let change = SettingsChange::between(&a, &c);
        assert!(!change.framebuffer_changed);
        assert!(change.shaders_changed);

        let d = GpuSettings { threaded_presentation: false, ..Default::default() };
        assert!(!SettingsChange::between(&a, &d).any());
    }
}
