//! The complete set of pipeline programs for one renderer configuration.

use emu_core::logging::{log, LogCategory, LogLevel};

use crate::shader_cache::{ProgramCompiler, ShaderCache};
use crate::shadergen::ShaderGen;
use crate::types::{BatchRenderMode, InterlacedRenderMode, TextureMode};
use crate::GpuError;

pub const BATCH_PROGRAM_COUNT: usize = BatchRenderMode::COUNT * TextureMode::COUNT * 2 * 2;
pub const DISPLAY_PROGRAM_COUNT: usize = 2 * 3;
pub const FILL_PROGRAM_COUNT: usize = 2 * 2;

fn batch_index(render_mode: BatchRenderMode, texture_mode: TextureMode, dithering: bool, interlacing: bool) -> usize {
    ((render_mode.index() * TextureMode::COUNT + texture_mode.index()) * 2 + dithering as usize) * 2
        + interlacing as usize
}

fn display_index(depth_24bit: bool, interlace: InterlacedRenderMode) -> usize {
    depth_24bit as usize * 3 + interlace.index()
}

fn fill_index(wrapped: bool, interlaced: bool) -> usize {
    wrapped as usize * 2 + interlaced as usize
}

pub struct ProgramSet<P> {
    batch: Vec<P>,
    display: Vec<P>,
    fill: Vec<P>,
    pub read: P,
    pub copy: P,
    pub update_depth: P,
    /// Only with a shader write path
    pub write: Option<P>,
    /// Only when box downsampling is enabled
    pub downsample: Option<P>,
}

impl<P: Clone> ProgramSet<P> {
    /// Build every variant. Any failure aborts, naming the variant.
    pub fn compile<C>(
        gen: &ShaderGen,
        cache: &mut ShaderCache<P>,
        compiler: &mut C,
        with_downsample: bool,
        pre_link: &dyn Fn(&mut C, &P),
    ) -> Result<Self, GpuError>
    where
        C: ProgramCompiler<Program = P>,
    {
        let total = BATCH_PROGRAM_COUNT
            + DISPLAY_PROGRAM_COUNT
            + FILL_PROGRAM_COUNT
            + 3
            + gen.ssbo_writes as usize
            + with_downsample as usize;
        let mut done = 0usize;
        let mut get = |cache: &mut ShaderCache<P>,
                       compiler: &mut C,
                       name: String,
                       vs: &str,
                       fs: &str|
         -> Result<P, GpuError> {
            let program = cache
                .get_program(compiler, vs, fs, pre_link)
                .map_err(|message| GpuError::ShaderCompile { program: name, log: message })?;
            done += 1;
            if done % 16 == 0 || done == total {
                log(LogCategory::Shaders, LogLevel::Debug, || {
                    format!("compiled {} of {} programs", done, total)
                });
            }
            Ok(program)
        };

        let textured_vs = gen.batch_vertex_shader(true);
        let untextured_vs = gen.batch_vertex_shader(false);
        let mut batch = Vec::with_capacity(BATCH_PROGRAM_COUNT);
        for render_mode in BatchRenderMode::ALL {
            for texture_mode in TextureMode::ALL {
                for dithering in [false, true] {
                    for interlacing in [false, true] {
                        debug_assert_eq!(
                            batch.len(),
                            batch_index(render_mode, texture_mode, dithering, interlacing)
                        );
                        let vs = if texture_mode.is_textured() { &textured_vs } else { &untextured_vs };
                        let fs = gen.batch_fragment_shader(render_mode, texture_mode, dithering, interlacing);
                        let name = format!(
                            "batch {:?}/{:?} dithering={} interlacing={}",
                            render_mode, texture_mode, dithering, interlacing
                        );
                        batch.push(get(cache, compiler, name, vs, &fs)?);
                    }
                }
            }
        }

        let quad_vs = gen.screen_quad_vertex_shader();
        let mut display = Vec::with_capacity(DISPLAY_PROGRAM_COUNT);
        for depth_24bit in [false, true] {
            for interlace in InterlacedRenderMode::ALL {
                let fs = gen.display_fragment_shader(depth_24bit, interlace);
                let name = format!("display 24bit={} {:?}", depth_24bit, interlace);
                display.push(get(cache, compiler, name, &quad_vs, &fs)?);
            }
        }

        let mut fill = Vec::with_capacity(FILL_PROGRAM_COUNT);
        for wrapped in [false, true] {
            for interlaced in [false, true] {
                let fs = gen.fill_fragment_shader(wrapped, interlaced);
                let name = format!("fill wrapped={} interlaced={}", wrapped, interlaced);
                fill.push(get(cache, compiler, name, &quad_vs, &fs)?);
            }
        }

        let read = get(cache, compiler, "vram read".into(), &quad_vs, &gen.read_fragment_shader())?;
        let copy = get(cache, compiler, "vram copy".into(), &quad_vs, &gen.copy_fragment_shader())?;
        let update_depth = get(
            cache,
            compiler,
            "vram update depth".into(),
            &quad_vs,
            &gen.update_depth_fragment_shader(),
        )?;
        let write = match gen.write_fragment_shader() {
            Some(fs) => Some(get(cache, compiler, "vram write".into(), &quad_vs, &fs)?),
            None => None,
        };
        let downsample = if with_downsample {
            let fs = gen.box_downsample_fragment_shader();
            Some(get(cache, compiler, "box downsample".into(), &quad_vs, &fs)?)
        } else {
            None
        };

        let stats = cache.stats();
        log(LogCategory::Shaders, LogLevel::Info, || {
            format!(
                "{} programs ready ({} compiled, {} from disk, {} shared)",
                total, stats.compiles, stats.disk_loads, stats.memory_hits
            )
        });
        if let Err(e) = cache.flush() {
            log(LogCategory::Shaders, LogLevel::Warn, || {
                format!("failed to write program cache: {}", e)
            });
        }

        Ok(Self {
            batch,
            display,
            fill,
            read,
            copy,
            update_depth,
            write,
            downsample,
        })
    }

    pub fn batch(
        &self,
        render_mode: BatchRenderMode,
        texture_mode: TextureMode,
        dithering: bool,
        interlacing: bool,
    ) -> &P {
        &self.batch[batch_index(render_mode, texture_mode, dithering, interlacing)]
    }

    pub fn display(&self, depth_24bit: bool, interlace: InterlacedRenderMode) -> &P {
        &self.display[display_index(depth_24bit, interlace)]
    }

    pub fn fill(&self, wrapped: bool, interlaced: bool) -> &P {
        &self.fill[fill_index(wrapped, interlaced)]
    }

    /// Every program handle in the set
    pub fn programs(&self) -> impl Iterator<Item = &P> {
        self.batch
            .iter()
            .chain(&self.display)
            .chain(&self.fill)
            .chain([&self.read, &self.copy, &self.update_depth])
            .chain(self.write.as_ref())
            .chain(self.downsample.as_ref())
    }

    pub fn count(&self) -> usize {
        self.batch.len()
            + self.display.len()
            + self.fill.len()
            + 3
            + self.write.is_some() as usize
            + self.downsample.is_some() as usize
    }
}

impl<P: Clone + PartialEq> ProgramSet<P> {
    /// Compile a set for a new configuration and destroy the cached programs
    /// it no longer uses. The previous set must not be used afterwards.
    pub fn recompile<C>(
        gen: &ShaderGen,
        cache: &mut ShaderCache<P>,
        compiler: &mut C,
        with_downsample: bool,
        pre_link: &dyn Fn(&mut C, &P),
    ) -> Result<Self, GpuError>
    where
        C: ProgramCompiler<Program = P>,
    {
        let set = Self::compile(gen, cache, compiler, with_downsample, pre_link)?;
        let evicted = cache.retain(compiler, |program| set.programs().any(|p| p == program));
        if evicted > 0 {
            log(LogCategory::Shaders, LogLevel::Debug, || {
                format!("released {} superseded program(s)", evicted)
            });
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader_cache::tests::MockCompiler;

    fn no_pre_link(_: &mut MockCompiler, _: &String) {}

    #[test]
    fn test_full_cross_product() {
        let gen = ShaderGen { ssbo_writes: true, ..Default::default() };
        let mut cache = ShaderCache::in_memory();
        let mut compiler = MockCompiler::default();
        let set = ProgramSet::compile(&gen, &mut cache, &mut compiler, true, &no_pre_link).expect("compile");

        assert_eq!(BATCH_PROGRAM_COUNT, 144);
        assert_eq!(set.count(), 144 + 6 + 4 + 3 + 1 + 1);
        // Reserved 16-bit modes generate the same source as direct 16-bit
        assert_eq!(compiler.compiled, set.count() - 32);
        assert!(set.write.is_some());
        assert!(set.downsample.is_some());

        let p = set.batch(BatchRenderMode::OnlyOpaque, TextureMode::Palette8Bit, true, false);
        assert!(p.contains("#define ONLY_OPAQUE 1"));
        assert!(p.contains("#define PALETTE_8_BIT 1"));
        assert!(p.contains("#define DITHERING 1"));
        assert!(p.contains("#define INTERLACING 0"));

        let d = set.display(true, InterlacedRenderMode::SeparateFields);
        assert!(d.contains("#define DEPTH_24BIT 1"));
        assert!(d.contains("#define INTERLEAVED 0"));
        assert!(set.fill(true, false).contains("#define WRAPPED 1"));
    }

    #[test]
    fn test_optional_programs() {
        let gen = ShaderGen::default();
        let mut cache = ShaderCache::in_memory();
        let mut compiler = MockCompiler::default();
        let set = ProgramSet::compile(&gen, &mut cache, &mut compiler, false, &no_pre_link).expect("compile");
        assert!(set.write.is_none());
        assert!(set.downsample.is_none());
        assert_eq!(set.count(), 157);
    }

    #[test]
    fn test_recompile_hits_memory_cache() {
        let gen = ShaderGen::default();
        let mut cache = ShaderCache::in_memory();
        let mut compiler = MockCompiler::default();
        ProgramSet::compile(&gen, &mut cache, &mut compiler, false, &no_pre_link).expect("compile");
        let compiled = compiler.compiled;
        let hits = cache.stats().memory_hits;
        ProgramSet::compile(&gen, &mut cache, &mut compiler, false, &no_pre_link).expect("compile");
        assert_eq!(compiler.compiled, compiled);
        assert_eq!(cache.stats().memory_hits, hits + 157);
    }

    #[test]
    fn test_programs_lists_every_handle() {
        let gen = ShaderGen { ssbo_writes: true, ..Default::default() };
        let mut cache = ShaderCache::in_memory();
        let mut compiler = MockCompiler::default();
        let set = ProgramSet::compile(&gen, &mut cache, &mut compiler, true, &no_pre_link).expect("compile");
        assert_eq!(set.programs().count(), set.count());
    }

    #[test]
    fn test_recompile_releases_superseded_programs() {
        let mut cache = ShaderCache::in_memory();
        let mut compiler = MockCompiler::default();
        let first = ProgramSet::recompile(&ShaderGen::default(), &mut cache, &mut compiler, false, &no_pre_link)
            .expect("compile");
        let first_compiled = compiler.compiled;
        assert_eq!(first_compiled, first.count() - 32);
        assert_eq!(compiler.destroyed, 0);

        // Every source carries the scale, so nothing from the old set survives
        let scaled = ShaderGen { resolution_scale: 2, ..Default::default() };
        let second = ProgramSet::recompile(&scaled, &mut cache, &mut compiler, true, &no_pre_link).expect("compile");
        assert_eq!(compiler.destroyed, first_compiled);
        assert_eq!(cache.len(), compiler.compiled - first_compiled);
        assert!(second.programs().all(|p| p.contains("#define RESOLUTION_SCALE 2u")));

        // Same configuration again keeps everything
        ProgramSet::recompile(&scaled, &mut cache, &mut compiler, true, &no_pre_link).expect("compile");
        assert_eq!(compiler.destroyed, first_compiled);

        // Dropping the downsample program releases only that one
        let before = cache.len();
        ProgramSet::recompile(&scaled, &mut cache, &mut compiler, false, &no_pre_link).expect("compile");
        assert_eq!(compiler.destroyed, first_compiled + 1);
        assert_eq!(cache.len(), before - 1);
    }

    #[test]
    fn test_failure_names_variant() {
        let gen = ShaderGen::default();
        let mut cache = ShaderCache::in_memory();
        let mut compiler = MockCompiler { fail_on: Some("#define WRAPPED 1"), ..Default::default() };
        let err = ProgramSet::compile(&gen, &mut cache, &mut compiler, false, &no_pre_link)
            .err()
            .expect("must fail");
        match err {
            GpuError::ShaderCompile { program, log } => {
                assert_eq!(program, "fill wrapped=true interlaced=false");
                assert!(log.contains("WRAPPED"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
