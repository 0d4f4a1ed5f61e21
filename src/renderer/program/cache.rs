//! Program Cache
//!
//! Owns every compiled program. Entries are looked up by cache key and
//! reference counted: materials that resolve to the same key share one
//! program, and the backend program is deleted when the last user releases
//! it.
//!
//! A program that fails to compile stays in the cache with its
//! [`ProgramDiagnostics`] so the failure is reported once and inspectable
//! later; drawing with it is skipped.

use log::{debug, error, info};
use rustc_hash::FxHashMap;
use slotmap::{SlotMap, new_key_type};

use crate::renderer::backend::{ProgramDescriptor, ProgramDiagnostics, ProgramId, RenderBackend};
use crate::renderer::program::parameters::ProgramParameters;
use crate::renderer::program::shader_gen::ShaderGenerator;

new_key_type! {
    pub struct ProgramHandle;
}

#[derive(Debug)]
pub struct CachedProgram {
    pub key: String,
    pub used_times: u32,
    pub parameters: ProgramParameters,
    backend: Option<ProgramId>,
    diagnostics: Option<ProgramDiagnostics>,
    needs_compile: bool,
}

impl CachedProgram {
    #[must_use]
    pub fn backend_id(&self) -> Option<ProgramId> {
        self.backend
    }

    #[must_use]
    pub fn diagnostics(&self) -> Option<&ProgramDiagnostics> {
        self.diagnostics.as_ref()
    }
}

#[derive(Default)]
pub struct ProgramCache {
    programs: SlotMap<ProgramHandle, CachedProgram>,
    by_key: FxHashMap<String, ProgramHandle>,
    compiles: u64,
}

impl ProgramCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a live program for `cache_key`, compiling one if needed.
    ///
    /// Every call must be balanced by one [`Self::release_program`].
    pub fn acquire_program<B: RenderBackend>(
        &mut self,
        backend: &mut B,
        parameters: &ProgramParameters,
        cache_key: &str,
    ) -> ProgramHandle {
        if let Some(&handle) = self.by_key.get(cache_key)
            && let Some(program) = self.programs.get_mut(handle)
            && program.used_times > 0
        {
            program.used_times += 1;
            debug!("Program cache hit: {cache_key} ({} users)", program.used_times);
            return handle;
        }

        let mut program = CachedProgram {
            key: cache_key.to_string(),
            used_times: 1,
            parameters: parameters.clone(),
            backend: None,
            diagnostics: None,
            needs_compile: true,
        };
        self.compiles += 1;
        Self::compile(backend, &mut program);

        let handle = self.programs.insert(program);
        self.by_key.insert(cache_key.to_string(), handle);
        handle
    }

    /// Drops one reference; the last one destroys the program.
    pub fn release_program<B: RenderBackend>(&mut self, backend: &mut B, handle: ProgramHandle) {
        let Some(program) = self.programs.get_mut(handle) else {
            return;
        };
        program.used_times = program.used_times.saturating_sub(1);
        if program.used_times > 0 {
            return;
        }

        if let Some(program) = self.programs.remove(handle) {
            if let Some(id) = program.backend {
                backend.delete_program(id);
            }
            if self.by_key.get(&program.key) == Some(&handle) {
                self.by_key.remove(&program.key);
            }
            debug!("Program destroyed: {}", program.key);
        }
    }

    /// Backend program for `handle`, recompiling it first if the context was
    /// restored since it was built. `None` when compilation failed.
    pub fn program_id<B: RenderBackend>(&mut self, backend: &mut B, handle: ProgramHandle) -> Option<ProgramId> {
        let program = self.programs.get_mut(handle)?;
        if program.needs_compile {
            self.compiles += 1;
            Self::compile(backend, program);
        }
        program.backend
    }

    fn compile<B: RenderBackend>(backend: &mut B, program: &mut CachedProgram) {
        program.needs_compile = false;
        program.backend = None;
        program.diagnostics = None;

        let shader = match ShaderGenerator::generate(&program.parameters) {
            Ok(shader) => shader,
            Err(e) => {
                error!("Shader generation failed for {}: {e}", program.key);
                program.diagnostics = Some(ProgramDiagnostics {
                    runnable: false,
                    program_log: e.to_string(),
                    ..ProgramDiagnostics::default()
                });
                return;
            }
        };

        let descriptor = ProgramDescriptor {
            label: &program.key,
            vertex_source: &shader.vertex,
            fragment_source: &shader.fragment,
            parameters: &program.parameters,
        };
        match backend.create_program(&descriptor) {
            Ok(id) => {
                info!("Compiled program {}", program.key);
                program.backend = Some(id);
            }
            Err(diagnostics) => {
                error!(
                    "Program {} failed to compile\nvertex: {}\nfragment: {}\n{}",
                    program.key, diagnostics.vertex_log, diagnostics.fragment_log, diagnostics.program_log
                );
                program.diagnostics = Some(diagnostics);
            }
        }
    }

    /// Forgets every backend program after a context loss. Entries and their
    /// reference counts survive and recompile on next use.
    pub fn invalidate(&mut self) {
        for program in self.programs.values_mut() {
            program.backend = None;
            program.needs_compile = true;
        }
    }

    #[must_use]
    pub fn get(&self, handle: ProgramHandle) -> Option<&CachedProgram> {
        self.programs.get(handle)
    }

    #[must_use]
    pub fn diagnostics(&self, handle: ProgramHandle) -> Option<&ProgramDiagnostics> {
        self.programs.get(handle).and_then(|p| p.diagnostics.as_ref())
    }

    /// Every program that failed to compile, with its key.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &ProgramDiagnostics)> {
        self.programs
            .values()
            .filter_map(|p| p.diagnostics.as_ref().map(|d| (p.key.as_str(), d)))
    }

    #[must_use]
    pub fn program_count(&self) -> usize {
        self.programs.len()
    }

    /// Total number of compile attempts.
    #[must_use]
    pub fn compile_count(&self) -> u64 {
        self.compiles
    }

    #[must_use]
    pub fn handle_for_key(&self, cache_key: &str) -> Option<ProgramHandle> {
        self.by_key.get(cache_key).copied()
    }
}
